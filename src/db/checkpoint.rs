use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::storage::{EdgeRecord, NodeRecord};
use crate::types::{Crc32Fast, EngineError, Lsn, Result};

const CHECKPOINT_MAGIC: [u8; 4] = *b"EGCP";
const CHECKPOINT_VERSION: u16 = 1;
const HEADER_LEN: usize = 24;

/// Full committed state at a point in the log.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointImage {
    /// Highest LSN reflected in the image.
    pub last_lsn: Lsn,
    /// Next node id to hand out.
    pub next_node_id: u64,
    /// Next edge id to hand out.
    pub next_edge_id: u64,
    /// Live nodes, ascending by id.
    pub nodes: Vec<Arc<NodeRecord>>,
    /// Live edges, ascending by id.
    pub edges: Vec<Arc<EdgeRecord>>,
}

/// Header (magic, version, last LSN, body length, body crc) followed by a
/// snappy-compressed JSON body.
pub fn encode(image: &CheckpointImage) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(image)?;
    let body = snap::raw::Encoder::new()
        .compress_vec(&json)
        .map_err(|err| EngineError::Serialization(err.to_string()))?;
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&CHECKPOINT_MAGIC);
    out.extend_from_slice(&CHECKPOINT_VERSION.to_be_bytes());
    out.extend_from_slice(&[0u8; 2]);
    out.extend_from_slice(&image.last_lsn.0.to_be_bytes());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&Crc32Fast::of(&[&body]).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Validates and decodes a checkpoint image. Any mismatch is corruption.
pub fn decode(bytes: &[u8]) -> Result<CheckpointImage> {
    if bytes.len() < HEADER_LEN {
        return Err(EngineError::Corruption("checkpoint truncated"));
    }
    if bytes[0..4] != CHECKPOINT_MAGIC {
        return Err(EngineError::Corruption("checkpoint magic mismatch"));
    }
    if u16::from_be_bytes([bytes[4], bytes[5]]) != CHECKPOINT_VERSION {
        return Err(EngineError::Corruption("checkpoint version mismatch"));
    }
    let mut lsn = [0u8; 8];
    lsn.copy_from_slice(&bytes[8..16]);
    let mut len = [0u8; 4];
    len.copy_from_slice(&bytes[16..20]);
    let mut crc = [0u8; 4];
    crc.copy_from_slice(&bytes[20..24]);
    let body = &bytes[HEADER_LEN..];
    if body.len() != u32::from_be_bytes(len) as usize {
        return Err(EngineError::Corruption("checkpoint length mismatch"));
    }
    if Crc32Fast::of(&[body]) != u32::from_be_bytes(crc) {
        return Err(EngineError::Corruption("checkpoint crc mismatch"));
    }
    let json = snap::raw::Decoder::new()
        .decompress_vec(body)
        .map_err(|_| EngineError::Corruption("checkpoint body is not valid snappy"))?;
    let image: CheckpointImage = serde_json::from_slice(&json)
        .map_err(|_| EngineError::Corruption("checkpoint body is not a valid image"))?;
    if image.last_lsn.0 != u64::from_be_bytes(lsn) {
        return Err(EngineError::Corruption("checkpoint header lsn mismatch"));
    }
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NodeId, PropValue};

    fn image() -> CheckpointImage {
        let mut node = NodeRecord::new(NodeId(1));
        node.labels.insert("Person".into());
        node.props.insert("name".into(), PropValue::from("Alice"));
        CheckpointImage {
            last_lsn: Lsn(42),
            next_node_id: 2,
            next_edge_id: 1,
            nodes: vec![Arc::new(node)],
            edges: Vec::new(),
        }
    }

    #[test]
    fn encoded_image_decodes() {
        let bytes = encode(&image()).unwrap();
        assert_eq!(&bytes[..4], b"EGCP");
        assert_eq!(decode(&bytes).unwrap(), image());
    }

    #[test]
    fn flipped_body_byte_is_corruption() {
        let mut bytes = encode(&image()).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        assert!(matches!(decode(&bytes), Err(EngineError::Corruption(_))));
    }
}

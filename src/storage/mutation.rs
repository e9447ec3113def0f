use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::types::{EdgeRecord, NodeRecord};
use crate::primitives::wal::WalOp;
use crate::types::{EdgeId, EngineError, EntityKey, NodeId, Result};

/// A committed change to one entity. Updates carry the full after-image so
/// replay never needs the prior state.
#[derive(Clone, Debug, PartialEq)]
pub enum Mutation {
    /// New node.
    CreateNode(Arc<NodeRecord>),
    /// Replaced node image.
    UpdateNode(Arc<NodeRecord>),
    /// Node removal.
    DeleteNode(NodeId),
    /// New edge.
    CreateEdge(Arc<EdgeRecord>),
    /// Replaced edge image.
    UpdateEdge(Arc<EdgeRecord>),
    /// Edge removal.
    DeleteEdge(EdgeId),
}

#[derive(Serialize, Deserialize)]
struct NodeIdPayload {
    id: NodeId,
}

#[derive(Serialize, Deserialize)]
struct EdgeIdPayload {
    id: EdgeId,
}

impl Mutation {
    /// WAL opcode for this mutation.
    pub fn op(&self) -> WalOp {
        match self {
            Mutation::CreateNode(_) => WalOp::CreateNode,
            Mutation::UpdateNode(_) => WalOp::UpdateNode,
            Mutation::DeleteNode(_) => WalOp::DeleteNode,
            Mutation::CreateEdge(_) => WalOp::CreateEdge,
            Mutation::UpdateEdge(_) => WalOp::UpdateEdge,
            Mutation::DeleteEdge(_) => WalOp::DeleteEdge,
        }
    }

    /// Entity touched by this mutation.
    pub fn entity(&self) -> EntityKey {
        match self {
            Mutation::CreateNode(node) | Mutation::UpdateNode(node) => EntityKey::Node(node.id),
            Mutation::DeleteNode(id) => EntityKey::Node(*id),
            Mutation::CreateEdge(edge) | Mutation::UpdateEdge(edge) => EntityKey::Edge(edge.id),
            Mutation::DeleteEdge(id) => EntityKey::Edge(*id),
        }
    }

    /// JSON payload stored in the WAL entry.
    pub fn encode_payload(&self) -> Result<Vec<u8>> {
        let bytes = match self {
            Mutation::CreateNode(node) | Mutation::UpdateNode(node) => {
                serde_json::to_vec(node.as_ref())?
            }
            Mutation::CreateEdge(edge) | Mutation::UpdateEdge(edge) => {
                serde_json::to_vec(edge.as_ref())?
            }
            Mutation::DeleteNode(id) => serde_json::to_vec(&NodeIdPayload { id: *id })?,
            Mutation::DeleteEdge(id) => serde_json::to_vec(&EdgeIdPayload { id: *id })?,
        };
        Ok(bytes)
    }

    /// Rebuilds a mutation from a WAL opcode and payload.
    pub fn decode(op: WalOp, payload: &[u8]) -> Result<Self> {
        Ok(match op {
            WalOp::CreateNode => Mutation::CreateNode(Arc::new(serde_json::from_slice(payload)?)),
            WalOp::UpdateNode => Mutation::UpdateNode(Arc::new(serde_json::from_slice(payload)?)),
            WalOp::CreateEdge => Mutation::CreateEdge(Arc::new(serde_json::from_slice(payload)?)),
            WalOp::UpdateEdge => Mutation::UpdateEdge(Arc::new(serde_json::from_slice(payload)?)),
            WalOp::DeleteNode => {
                Mutation::DeleteNode(serde_json::from_slice::<NodeIdPayload>(payload)?.id)
            }
            WalOp::DeleteEdge => {
                Mutation::DeleteEdge(serde_json::from_slice::<EdgeIdPayload>(payload)?.id)
            }
            WalOp::Commit => {
                return Err(EngineError::Corruption("commit marker is not a mutation"))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PropValue;

    #[test]
    fn update_payload_carries_full_image() {
        let mut node = NodeRecord::new(NodeId(4));
        node.labels.insert("Person".into());
        node.props.insert("age".into(), PropValue::Int(31));
        node.embedding = Some(vec![0.5, 0.25]);
        let mutation = Mutation::UpdateNode(Arc::new(node));
        let payload = mutation.encode_payload().unwrap();
        let decoded = Mutation::decode(WalOp::UpdateNode, &payload).unwrap();
        assert_eq!(decoded, mutation);
        assert_eq!(decoded.entity(), EntityKey::Node(NodeId(4)));
    }

    #[test]
    fn garbage_payload_is_a_serialization_error() {
        let err = Mutation::decode(WalOp::DeleteEdge, b"{oops").unwrap_err();
        assert!(matches!(err, EngineError::Serialization(_)));
    }
}

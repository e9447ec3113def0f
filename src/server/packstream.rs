//! PackStream v1 encoding used by the Bolt protocol.

use bytes::{Buf, BufMut, BytesMut};

use super::ServerError;
use crate::query::{Path, Value};
use crate::storage::{EdgeRecord, NodeRecord};

/// Structure tags for graph values.
pub mod tag {
    /// Node structure.
    pub const NODE: u8 = 0x4E;
    /// Relationship structure.
    pub const RELATIONSHIP: u8 = 0x52;
    /// Relationship inside a path, without endpoints.
    pub const UNBOUND_RELATIONSHIP: u8 = 0x72;
    /// Path structure.
    pub const PATH: u8 = 0x50;
    /// Date-time with an offset, seconds in local time.
    pub const DATE_TIME: u8 = 0x46;
    /// Date-time with an offset, seconds in UTC.
    pub const DATE_TIME_UTC: u8 = 0x49;
}

const MAX_DEPTH: usize = 64;

/// A PackStream value.
#[derive(Clone, Debug, PartialEq)]
pub enum PackValue {
    /// `null`.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed 64-bit integer.
    Int(i64),
    /// 64-bit float.
    Float(f64),
    /// Byte array.
    Bytes(Vec<u8>),
    /// UTF-8 string.
    String(String),
    /// List.
    List(Vec<PackValue>),
    /// Map with string keys, in wire order.
    Map(Vec<(String, PackValue)>),
    /// Tagged structure.
    Struct(u8, Vec<PackValue>),
}

impl PackValue {
    /// Builds a map from `(key, value)` pairs.
    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, PackValue)>) -> Self {
        PackValue::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Entry of a map value.
    pub fn get(&self, key: &str) -> Option<&PackValue> {
        match self {
            PackValue::Map(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    /// String payload, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PackValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Integer payload, if this is an integer.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            PackValue::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl From<&str> for PackValue {
    fn from(value: &str) -> Self {
        PackValue::String(value.to_owned())
    }
}

impl From<String> for PackValue {
    fn from(value: String) -> Self {
        PackValue::String(value)
    }
}

impl From<i64> for PackValue {
    fn from(value: i64) -> Self {
        PackValue::Int(value)
    }
}

impl From<bool> for PackValue {
    fn from(value: bool) -> Self {
        PackValue::Bool(value)
    }
}

fn put_sized(out: &mut BytesMut, len: usize, tiny: u8, markers: [u8; 3]) {
    if len < 16 && tiny != 0 {
        out.put_u8(tiny | len as u8);
    } else if len <= u8::MAX as usize {
        out.put_u8(markers[0]);
        out.put_u8(len as u8);
    } else if len <= u16::MAX as usize {
        out.put_u8(markers[1]);
        out.put_u16(len as u16);
    } else {
        out.put_u8(markers[2]);
        out.put_u32(len as u32);
    }
}

/// Appends the encoding of `value` to `out`.
pub fn encode(value: &PackValue, out: &mut BytesMut) {
    match value {
        PackValue::Null => out.put_u8(0xC0),
        PackValue::Bool(false) => out.put_u8(0xC2),
        PackValue::Bool(true) => out.put_u8(0xC3),
        PackValue::Int(i) => {
            let i = *i;
            if (-16..=127).contains(&i) {
                out.put_i8(i as i8);
            } else if i8::try_from(i).is_ok() {
                out.put_u8(0xC8);
                out.put_i8(i as i8);
            } else if i16::try_from(i).is_ok() {
                out.put_u8(0xC9);
                out.put_i16(i as i16);
            } else if i32::try_from(i).is_ok() {
                out.put_u8(0xCA);
                out.put_i32(i as i32);
            } else {
                out.put_u8(0xCB);
                out.put_i64(i);
            }
        }
        PackValue::Float(f) => {
            out.put_u8(0xC1);
            out.put_f64(*f);
        }
        PackValue::Bytes(bytes) => {
            put_sized(out, bytes.len(), 0, [0xCC, 0xCD, 0xCE]);
            out.put_slice(bytes);
        }
        PackValue::String(s) => {
            put_sized(out, s.len(), 0x80, [0xD0, 0xD1, 0xD2]);
            out.put_slice(s.as_bytes());
        }
        PackValue::List(items) => {
            put_sized(out, items.len(), 0x90, [0xD4, 0xD5, 0xD6]);
            for item in items {
                encode(item, out);
            }
        }
        PackValue::Map(entries) => {
            put_sized(out, entries.len(), 0xA0, [0xD8, 0xD9, 0xDA]);
            for (key, value) in entries {
                encode(&PackValue::String(key.clone()), out);
                encode(value, out);
            }
        }
        PackValue::Struct(tag, fields) => {
            out.put_u8(0xB0 | (fields.len().min(15) as u8));
            out.put_u8(*tag);
            for field in fields.iter().take(15) {
                encode(field, out);
            }
        }
    }
}

/// Decodes one value from the front of `input`.
pub fn decode(input: &mut &[u8]) -> Result<PackValue, ServerError> {
    decode_at(input, 0)
}

fn truncated() -> ServerError {
    ServerError::Protocol("truncated PackStream value".into())
}

fn need(input: &[u8], len: usize) -> Result<(), ServerError> {
    if input.remaining() < len {
        return Err(truncated());
    }
    Ok(())
}

fn read_len(input: &mut &[u8], width: u8) -> Result<usize, ServerError> {
    need(input, width as usize)?;
    Ok(match width {
        1 => input.get_u8() as usize,
        2 => input.get_u16() as usize,
        _ => input.get_u32() as usize,
    })
}

fn read_string(input: &mut &[u8], len: usize) -> Result<String, ServerError> {
    need(input, len)?;
    let text = std::str::from_utf8(&input[..len])
        .map_err(|_| ServerError::Protocol("string is not valid UTF-8".into()))?
        .to_owned();
    input.advance(len);
    Ok(text)
}

fn decode_at(input: &mut &[u8], depth: usize) -> Result<PackValue, ServerError> {
    if depth > MAX_DEPTH {
        return Err(ServerError::Protocol("PackStream value nested too deeply".into()));
    }
    need(input, 1)?;
    let marker = input.get_u8();
    let value = match marker {
        0x00..=0x7F => PackValue::Int(i64::from(marker)),
        0xF0..=0xFF => PackValue::Int(i64::from(marker as i8)),
        0xC0 => PackValue::Null,
        0xC2 => PackValue::Bool(false),
        0xC3 => PackValue::Bool(true),
        0xC1 => {
            need(input, 8)?;
            PackValue::Float(input.get_f64())
        }
        0xC8 => {
            need(input, 1)?;
            PackValue::Int(i64::from(input.get_i8()))
        }
        0xC9 => {
            need(input, 2)?;
            PackValue::Int(i64::from(input.get_i16()))
        }
        0xCA => {
            need(input, 4)?;
            PackValue::Int(i64::from(input.get_i32()))
        }
        0xCB => {
            need(input, 8)?;
            PackValue::Int(input.get_i64())
        }
        0xCC..=0xCE => {
            let len = read_len(input, 1 << (marker - 0xCC))?;
            need(input, len)?;
            let bytes = input[..len].to_vec();
            input.advance(len);
            PackValue::Bytes(bytes)
        }
        0x80..=0x8F => PackValue::String(read_string(input, (marker & 0x0F) as usize)?),
        0xD0..=0xD2 => {
            let len = read_len(input, 1 << (marker - 0xD0))?;
            PackValue::String(read_string(input, len)?)
        }
        0x90..=0x9F | 0xD4..=0xD6 => {
            let len = if marker <= 0x9F {
                (marker & 0x0F) as usize
            } else {
                read_len(input, 1 << (marker - 0xD4))?
            };
            let mut items = Vec::with_capacity(len.min(1024));
            for _ in 0..len {
                items.push(decode_at(input, depth + 1)?);
            }
            PackValue::List(items)
        }
        0xA0..=0xAF | 0xD8..=0xDA => {
            let len = if marker <= 0xAF {
                (marker & 0x0F) as usize
            } else {
                read_len(input, 1 << (marker - 0xD8))?
            };
            let mut entries = Vec::with_capacity(len.min(1024));
            for _ in 0..len {
                let PackValue::String(key) = decode_at(input, depth + 1)? else {
                    return Err(ServerError::Protocol("map keys must be strings".into()));
                };
                entries.push((key, decode_at(input, depth + 1)?));
            }
            PackValue::Map(entries)
        }
        0xB0..=0xBF => {
            need(input, 1)?;
            let tag = input.get_u8();
            let size = (marker & 0x0F) as usize;
            let mut fields = Vec::with_capacity(size);
            for _ in 0..size {
                fields.push(decode_at(input, depth + 1)?);
            }
            PackValue::Struct(tag, fields)
        }
        other => {
            return Err(ServerError::Protocol(format!(
                "unknown PackStream marker 0x{other:02X}"
            )))
        }
    };
    Ok(value)
}

fn node_struct(node: &NodeRecord) -> PackValue {
    PackValue::Struct(
        tag::NODE,
        vec![
            PackValue::Int(node.id.0 as i64),
            PackValue::List(node.labels.iter().map(|l| PackValue::from(l.as_str())).collect()),
            PackValue::map(node.props.iter().map(|(k, v)| (k.clone(), from_value(&Value::from(v))))),
        ],
    )
}

fn edge_props(edge: &EdgeRecord) -> PackValue {
    PackValue::map(edge.props.iter().map(|(k, v)| (k.clone(), from_value(&Value::from(v)))))
}

fn path_struct(path: &Path) -> PackValue {
    let mut nodes: Vec<&NodeRecord> = Vec::new();
    let mut rels: Vec<&EdgeRecord> = Vec::new();
    let mut indices = Vec::with_capacity(path.rels.len() * 2);
    for node in &path.nodes {
        if !nodes.iter().any(|n| n.id == node.id) {
            nodes.push(node);
        }
    }
    for (step, edge) in path.rels.iter().enumerate() {
        let rel_idx = match rels.iter().position(|r| r.id == edge.id) {
            Some(idx) => idx,
            None => {
                rels.push(edge);
                rels.len() - 1
            }
        };
        let forward = edge.src == path.nodes[step].id;
        let signed = rel_idx as i64 + 1;
        indices.push(PackValue::Int(if forward { signed } else { -signed }));
        let next = path.nodes.get(step + 1).map(|n| n.id);
        let node_idx = nodes.iter().position(|n| Some(n.id) == next).unwrap_or(0);
        indices.push(PackValue::Int(node_idx as i64));
    }
    PackValue::Struct(
        tag::PATH,
        vec![
            PackValue::List(nodes.into_iter().map(node_struct).collect()),
            PackValue::List(
                rels.into_iter()
                    .map(|edge| {
                        PackValue::Struct(
                            tag::UNBOUND_RELATIONSHIP,
                            vec![
                                PackValue::Int(edge.id.0 as i64),
                                PackValue::from(edge.ty.as_str()),
                                edge_props(edge),
                            ],
                        )
                    })
                    .collect(),
            ),
            PackValue::List(indices),
        ],
    )
}

/// Wire form of a query value.
pub fn from_value(value: &Value) -> PackValue {
    match value {
        Value::Null => PackValue::Null,
        Value::Bool(b) => PackValue::Bool(*b),
        Value::Int(i) => PackValue::Int(*i),
        Value::Float(f) => PackValue::Float(*f),
        Value::String(s) => PackValue::String(s.clone()),
        Value::List(items) => PackValue::List(items.iter().map(from_value).collect()),
        Value::Map(map) => PackValue::map(map.iter().map(|(k, v)| (k.clone(), from_value(v)))),
        Value::DateTime(ms) => PackValue::Struct(
            tag::DATE_TIME,
            vec![
                PackValue::Int(ms.div_euclid(1000)),
                PackValue::Int(ms.rem_euclid(1000) * 1_000_000),
                PackValue::Int(0),
            ],
        ),
        Value::Node(node) => node_struct(node),
        Value::Relationship(edge) => PackValue::Struct(
            tag::RELATIONSHIP,
            vec![
                PackValue::Int(edge.id.0 as i64),
                PackValue::Int(edge.src.0 as i64),
                PackValue::Int(edge.dst.0 as i64),
                PackValue::from(edge.ty.as_str()),
                edge_props(edge),
            ],
        ),
        Value::Path(path) => path_struct(path),
    }
}

/// Query value from a client-supplied parameter.
pub fn to_value(value: PackValue) -> Result<Value, ServerError> {
    Ok(match value {
        PackValue::Null => Value::Null,
        PackValue::Bool(b) => Value::Bool(b),
        PackValue::Int(i) => Value::Int(i),
        PackValue::Float(f) => Value::Float(f),
        PackValue::String(s) => Value::String(s),
        PackValue::List(items) => Value::List(
            items
                .into_iter()
                .map(to_value)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        PackValue::Map(entries) => Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| Ok((k, to_value(v)?)))
                .collect::<Result<_, ServerError>>()?,
        ),
        PackValue::Struct(tag, fields) if tag == tag::DATE_TIME || tag == tag::DATE_TIME_UTC => {
            let [seconds, nanos, offset] = fields.as_slice() else {
                return Err(ServerError::Protocol("DateTime expects three fields".into()));
            };
            let (Some(seconds), Some(nanos), Some(offset)) =
                (seconds.as_int(), nanos.as_int(), offset.as_int())
            else {
                return Err(ServerError::Protocol("DateTime fields must be integers".into()));
            };
            let utc = if tag == tag::DATE_TIME { seconds - offset } else { seconds };
            Value::DateTime(utc * 1000 + nanos / 1_000_000)
        }
        PackValue::Bytes(_) | PackValue::Struct(..) => {
            return Err(ServerError::Protocol(
                "unsupported parameter type".into(),
            ))
        }
    })
}

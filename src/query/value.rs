//! Runtime values flowing through query execution.
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use super::errors::QueryError;
use crate::storage::{EdgeRecord, NodeRecord};
use crate::types::PropValue;

/// Statement parameters keyed by name (without the `$`).
pub type Params = BTreeMap<String, Value>;

/// A path: alternating nodes and relationships, `nodes.len() == rels.len() + 1`.
#[derive(Clone, Debug, PartialEq)]
pub struct Path {
    /// Nodes in traversal order.
    pub nodes: Vec<Arc<NodeRecord>>,
    /// Relationships in traversal order.
    pub rels: Vec<Arc<EdgeRecord>>,
}

impl Path {
    /// Zero-length path at `node`.
    pub fn single(node: Arc<NodeRecord>) -> Self {
        Self {
            nodes: vec![node],
            rels: Vec::new(),
        }
    }

    /// Number of relationships.
    pub fn len(&self) -> usize {
        self.rels.len()
    }

    /// True for a zero-length path.
    pub fn is_empty(&self) -> bool {
        self.rels.is_empty()
    }
}

/// Value produced by expression evaluation.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// Absent or unknown.
    Null,
    /// Boolean.
    Bool(bool),
    /// 64-bit integer.
    Int(i64),
    /// 64-bit float.
    Float(f64),
    /// UTF-8 string.
    String(String),
    /// List of values.
    List(Vec<Value>),
    /// String-keyed map.
    Map(BTreeMap<String, Value>),
    /// Milliseconds since the Unix epoch, UTC.
    DateTime(i64),
    /// Graph node.
    Node(Arc<NodeRecord>),
    /// Graph relationship.
    Relationship(Arc<EdgeRecord>),
    /// Graph path.
    Path(Path),
}

impl From<PropValue> for Value {
    fn from(value: PropValue) -> Self {
        match value {
            PropValue::Null => Value::Null,
            PropValue::Bool(b) => Value::Bool(b),
            PropValue::Int(i) => Value::Int(i),
            PropValue::Float(f) => Value::Float(f),
            PropValue::String(s) => Value::String(s),
            PropValue::List(items) => Value::List(items.into_iter().map(Value::from).collect()),
            PropValue::DateTime(ms) => Value::DateTime(ms),
        }
    }
}

impl From<&PropValue> for Value {
    fn from(value: &PropValue) -> Self {
        Value::from(value.clone())
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<Vec<f32>> for Value {
    fn from(value: Vec<f32>) -> Self {
        Value::List(value.into_iter().map(|x| Value::Float(f64::from(x))).collect())
    }
}

impl Value {
    /// Type name used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "Null",
            Value::Bool(_) => "Boolean",
            Value::Int(_) => "Integer",
            Value::Float(_) => "Float",
            Value::String(_) => "String",
            Value::List(_) => "List",
            Value::Map(_) => "Map",
            Value::DateTime(_) => "DateTime",
            Value::Node(_) => "Node",
            Value::Relationship(_) => "Relationship",
            Value::Path(_) => "Path",
        }
    }

    /// Returns `true` for null.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Boolean view for predicates: `None` is unknown (null).
    pub fn as_bool(&self) -> Result<Option<bool>, QueryError> {
        match self {
            Value::Null => Ok(None),
            Value::Bool(b) => Ok(Some(*b)),
            other => Err(QueryError::type_mismatch(format!(
                "expected Boolean, got {}",
                other.type_name()
            ))),
        }
    }

    /// Integer view; floats are not coerced.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view as a float.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Interprets a list of numbers as an embedding.
    pub fn as_vector(&self) -> Option<Vec<f32>> {
        match self {
            Value::List(items) => items.iter().map(|v| v.as_f64().map(|f| f as f32)).collect(),
            _ => None,
        }
    }

    /// Converts to a storable property value.
    pub fn to_prop(&self) -> Result<PropValue, QueryError> {
        Ok(match self {
            Value::Null => PropValue::Null,
            Value::Bool(b) => PropValue::Bool(*b),
            Value::Int(i) => PropValue::Int(*i),
            Value::Float(f) => PropValue::Float(*f),
            Value::String(s) => PropValue::String(s.clone()),
            Value::DateTime(ms) => PropValue::DateTime(*ms),
            Value::List(items) => PropValue::List(
                items
                    .iter()
                    .map(Value::to_prop)
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            other => {
                return Err(QueryError::type_mismatch(format!(
                    "a {} cannot be stored as a property",
                    other.type_name()
                )))
            }
        })
    }

    /// Cypher equality: `None` when either side is null.
    pub fn equals(&self, other: &Value) -> Option<bool> {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => None,
            (Value::Int(a), Value::Int(b)) => Some(a == b),
            (a, b) if a.as_f64().is_some() && b.as_f64().is_some() => {
                Some(a.as_f64() == b.as_f64())
            }
            (Value::List(a), Value::List(b)) => {
                if a.len() != b.len() {
                    return Some(false);
                }
                let mut unknown = false;
                for (x, y) in a.iter().zip(b) {
                    match x.equals(y) {
                        Some(false) => return Some(false),
                        None => unknown = true,
                        Some(true) => {}
                    }
                }
                if unknown {
                    None
                } else {
                    Some(true)
                }
            }
            (Value::Map(a), Value::Map(b)) => {
                if a.len() != b.len() || a.keys().ne(b.keys()) {
                    return Some(false);
                }
                let mut unknown = false;
                for (x, y) in a.values().zip(b.values()) {
                    match x.equals(y) {
                        Some(false) => return Some(false),
                        None => unknown = true,
                        Some(true) => {}
                    }
                }
                if unknown {
                    None
                } else {
                    Some(true)
                }
            }
            (Value::Node(a), Value::Node(b)) => Some(a.id == b.id),
            (Value::Relationship(a), Value::Relationship(b)) => Some(a.id == b.id),
            (Value::Path(a), Value::Path(b)) => Some(
                a.nodes.iter().map(|n| n.id).eq(b.nodes.iter().map(|n| n.id))
                    && a.rels.iter().map(|r| r.id).eq(b.rels.iter().map(|r| r.id)),
            ),
            (a, b) => Some(a == b),
        }
    }

    /// Comparison for `<`, `<=`, `>`, `>=`; `None` when incomparable.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (a, b) if a.as_f64().is_some() && b.as_f64().is_some() => {
                a.as_f64()?.partial_cmp(&b.as_f64()?)
            }
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::DateTime(a), Value::DateTime(b)) => Some(a.cmp(b)),
            (Value::List(a), Value::List(b)) => {
                for (x, y) in a.iter().zip(b) {
                    match x.compare(y)? {
                        Ordering::Equal => continue,
                        unequal => return Some(unequal),
                    }
                }
                Some(a.len().cmp(&b.len()))
            }
            _ => None,
        }
    }

    fn order_rank(&self) -> u8 {
        match self {
            Value::Map(_) => 0,
            Value::Node(_) => 1,
            Value::Relationship(_) => 2,
            Value::List(_) => 3,
            Value::Path(_) => 4,
            Value::DateTime(_) => 5,
            Value::String(_) => 6,
            Value::Bool(_) => 7,
            Value::Int(_) | Value::Float(_) => 8,
            Value::Null => 9,
        }
    }

    /// Total order used by `ORDER BY`; nulls sort last ascending.
    pub fn order_cmp(&self, other: &Value) -> Ordering {
        let rank = self.order_rank().cmp(&other.order_rank());
        if rank != Ordering::Equal {
            return rank;
        }
        match (self, other) {
            (Value::Node(a), Value::Node(b)) => a.id.cmp(&b.id),
            (Value::Relationship(a), Value::Relationship(b)) => a.id.cmp(&b.id),
            (Value::Path(a), Value::Path(b)) => a.len().cmp(&b.len()),
            (Value::List(a), Value::List(b)) => {
                for (x, y) in a.iter().zip(b) {
                    let ord = x.order_cmp(y);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            (Value::Map(a), Value::Map(b)) => a.len().cmp(&b.len()),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (a, b) => a.compare(b).unwrap_or(Ordering::Equal),
        }
    }

    /// Hashable identity for `DISTINCT` and grouping. Integral floats group
    /// with the equal integer.
    pub fn group_key(&self) -> GroupKey {
        match self {
            Value::Null => GroupKey::Null,
            Value::Bool(b) => GroupKey::Bool(*b),
            Value::Int(i) => GroupKey::Int(*i),
            Value::Float(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => GroupKey::Int(*f as i64),
            Value::Float(f) => GroupKey::Float(f.to_bits()),
            Value::String(s) => GroupKey::String(s.clone()),
            Value::List(items) => GroupKey::List(items.iter().map(Value::group_key).collect()),
            Value::Map(map) => GroupKey::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.group_key()))
                    .collect(),
            ),
            Value::DateTime(ms) => GroupKey::DateTime(*ms),
            Value::Node(n) => GroupKey::Node(n.id.0),
            Value::Relationship(r) => GroupKey::Relationship(r.id.0),
            Value::Path(p) => GroupKey::Path(
                p.nodes.iter().map(|n| n.id.0).collect(),
                p.rels.iter().map(|r| r.id.0).collect(),
            ),
        }
    }

    /// JSON rendering used by the HTTP API.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::json;
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => json!(b),
            Value::Int(i) => json!(i),
            Value::Float(f) => json!(f),
            Value::String(s) => json!(s),
            Value::List(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Value::DateTime(ms) => json!(format_datetime(*ms)),
            Value::Node(node) => node_json(node),
            Value::Relationship(rel) => rel_json(rel),
            Value::Path(path) => json!({
                "nodes": path.nodes.iter().map(|n| node_json(n)).collect::<Vec<_>>(),
                "relationships": path.rels.iter().map(|r| rel_json(r)).collect::<Vec<_>>(),
            }),
        }
    }

    /// Parameter value from JSON. Integral numbers become integers.
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => Value::List(items.iter().map(Value::from_json).collect()),
            serde_json::Value::Object(map) => Value::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }
}

fn props_json(props: &crate::storage::PropertyMap) -> serde_json::Value {
    serde_json::Value::Object(
        props
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(v).to_json()))
            .collect(),
    )
}

fn node_json(node: &NodeRecord) -> serde_json::Value {
    serde_json::json!({
        "id": node.id.0,
        "labels": node.labels.iter().collect::<Vec<_>>(),
        "properties": props_json(&node.props),
    })
}

fn rel_json(rel: &EdgeRecord) -> serde_json::Value {
    serde_json::json!({
        "id": rel.id.0,
        "type": rel.ty,
        "start": rel.src.0,
        "end": rel.dst.0,
        "properties": props_json(&rel.props),
    })
}

/// Hashable projection of a [`Value`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GroupKey {
    /// Null.
    Null,
    /// Boolean.
    Bool(bool),
    /// Integer or integral float.
    Int(i64),
    /// Float bit pattern.
    Float(u64),
    /// String.
    String(String),
    /// List.
    List(Vec<GroupKey>),
    /// Map.
    Map(Vec<(String, GroupKey)>),
    /// Datetime.
    DateTime(i64),
    /// Node id.
    Node(u64),
    /// Relationship id.
    Relationship(u64),
    /// Path ids.
    Path(Vec<u64>, Vec<u64>),
}

/// RFC 3339 rendering of epoch milliseconds.
pub fn format_datetime(ms: i64) -> String {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000)
        .ok()
        .and_then(|dt| dt.format(&Rfc3339).ok())
        .unwrap_or_else(|| ms.to_string())
}

/// Parses an RFC 3339 timestamp into epoch milliseconds.
pub fn parse_datetime(text: &str) -> Option<i64> {
    let dt = OffsetDateTime::parse(text, &Rfc3339).ok()?;
    i64::try_from(dt.unix_timestamp_nanos() / 1_000_000).ok()
}

/// Current time in epoch milliseconds.
pub fn now_millis() -> i64 {
    i64::try_from(OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x:?}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::List(items) => {
                write!(f, "[")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Map(map) => {
                write!(f, "{{")?;
                for (idx, (k, v)) in map.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
            Value::DateTime(ms) => write!(f, "{}", format_datetime(*ms)),
            Value::Node(node) => {
                write!(f, "({}", node.id)?;
                for label in &node.labels {
                    write!(f, ":{label}")?;
                }
                write_props(f, &node.props)?;
                write!(f, ")")
            }
            Value::Relationship(rel) => {
                write!(f, "[{}:{}", rel.id, rel.ty)?;
                write_props(f, &rel.props)?;
                write!(f, "]")
            }
            Value::Path(path) => {
                for (idx, node) in path.nodes.iter().enumerate() {
                    if idx > 0 {
                        if let Some(rel) = path.rels.get(idx - 1) {
                            if rel.dst == node.id {
                                write!(f, "-[:{}]->", rel.ty)?;
                            } else {
                                write!(f, "<-[:{}]-", rel.ty)?;
                            }
                        }
                    }
                    write!(f, "({})", node.id)?;
                }
                Ok(())
            }
        }
    }
}

fn write_props(f: &mut fmt::Formatter<'_>, props: &crate::storage::PropertyMap) -> fmt::Result {
    if props.is_empty() {
        return Ok(());
    }
    write!(f, " {{")?;
    for (idx, (k, v)) in props.iter().enumerate() {
        if idx > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{k}: {}", Value::from(v))?;
    }
    write!(f, "}}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_equality_is_unknown() {
        assert_eq!(Value::Null.equals(&Value::Int(1)), None);
        assert_eq!(Value::Int(1).equals(&Value::Float(1.0)), Some(true));
        assert_eq!(
            Value::List(vec![Value::Int(1), Value::Null]).equals(&Value::List(vec![Value::Int(2), Value::Null])),
            Some(false)
        );
    }

    #[test]
    fn order_puts_nulls_last_and_numbers_together() {
        let mut values = vec![Value::Null, Value::Float(2.5), Value::Int(1), Value::from("a")];
        values.sort_by(Value::order_cmp);
        assert_eq!(
            values,
            vec![Value::from("a"), Value::Int(1), Value::Float(2.5), Value::Null]
        );
    }

    #[test]
    fn integral_floats_group_with_integers() {
        assert_eq!(Value::Float(3.0).group_key(), Value::Int(3).group_key());
        assert_ne!(Value::Float(3.5).group_key(), Value::Int(3).group_key());
    }

    #[test]
    fn datetimes_round_trip_through_rfc3339() {
        let ms = parse_datetime("2024-05-01T12:30:00Z").unwrap();
        assert_eq!(format_datetime(ms), "2024-05-01T12:30:00Z");
    }
}

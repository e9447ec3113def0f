//! Property values stored on nodes and edges.
use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::{EngineError, Result};

/// Typed property value. The tagged serde layout keeps WAL and checkpoint
/// payloads unambiguous (an integer never decodes as a float).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum PropValue {
    /// Null literal. Never stored; setting a property to null removes it.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed 64-bit integer.
    Int(i64),
    /// 64-bit float.
    Float(f64),
    /// UTF-8 string.
    String(String),
    /// Homogeneous or mixed list of scalars.
    List(Vec<PropValue>),
    /// Milliseconds since the Unix epoch, UTC.
    DateTime(i64),
}

impl PropValue {
    /// Checks the storage rules: lists hold scalars only, floats are finite.
    pub fn validate(&self) -> Result<()> {
        match self {
            PropValue::Float(f) if !f.is_finite() => {
                Err(EngineError::Invalid("float property must be finite"))
            }
            PropValue::List(items) => {
                for item in items {
                    match item {
                        PropValue::List(_) => {
                            return Err(EngineError::Invalid(
                                "list properties may only contain scalars",
                            ))
                        }
                        PropValue::Null => {
                            return Err(EngineError::Invalid(
                                "list properties may not contain null",
                            ))
                        }
                        other => other.validate()?,
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Returns `true` for the null value.
    pub fn is_null(&self) -> bool {
        matches!(self, PropValue::Null)
    }

    /// Returns the string payload if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Interprets a list of numbers as an embedding.
    pub fn as_vector(&self) -> Option<Vec<f32>> {
        match self {
            PropValue::List(items) => items
                .iter()
                .map(|item| match item {
                    PropValue::Float(f) => Some(*f as f32),
                    PropValue::Int(i) => Some(*i as f32),
                    _ => None,
                })
                .collect(),
            _ => None,
        }
    }

    /// Ordering used by range predicates; `None` for incomparable types.
    pub fn partial_cmp_value(&self, other: &PropValue) -> Option<Ordering> {
        match (self, other) {
            (PropValue::Bool(a), PropValue::Bool(b)) => a.partial_cmp(b),
            (PropValue::Int(a), PropValue::Int(b)) => a.partial_cmp(b),
            (PropValue::Float(a), PropValue::Float(b)) => a.partial_cmp(b),
            (PropValue::Int(a), PropValue::Float(b)) => (*a as f64).partial_cmp(b),
            (PropValue::Float(a), PropValue::Int(b)) => a.partial_cmp(&(*b as f64)),
            (PropValue::String(a), PropValue::String(b)) => a.partial_cmp(b),
            (PropValue::DateTime(a), PropValue::DateTime(b)) => a.partial_cmp(b),
            _ => None,
        }
    }
}

impl fmt::Display for PropValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropValue::Null => write!(f, "null"),
            PropValue::Bool(v) => write!(f, "{v}"),
            PropValue::Int(v) => write!(f, "{v}"),
            PropValue::Float(v) => write!(f, "{v}"),
            PropValue::String(v) => write!(f, "{v}"),
            PropValue::List(items) => {
                write!(f, "[")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            PropValue::DateTime(v) => write!(f, "datetime({v})"),
        }
    }
}

impl From<&str> for PropValue {
    fn from(value: &str) -> Self {
        PropValue::String(value.to_owned())
    }
}

impl From<String> for PropValue {
    fn from(value: String) -> Self {
        PropValue::String(value)
    }
}

impl From<bool> for PropValue {
    fn from(value: bool) -> Self {
        PropValue::Bool(value)
    }
}

impl From<i64> for PropValue {
    fn from(value: i64) -> Self {
        PropValue::Int(value)
    }
}

impl From<f64> for PropValue {
    fn from(value: f64) -> Self {
        PropValue::Float(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_lists_are_rejected() {
        let nested = PropValue::List(vec![PropValue::List(vec![PropValue::Int(1)])]);
        assert!(nested.validate().is_err());
        let flat = PropValue::List(vec![PropValue::Int(1), PropValue::from("a")]);
        assert!(flat.validate().is_ok());
    }

    #[test]
    fn tagged_encoding_keeps_int_and_float_apart() {
        let json = serde_json::to_string(&PropValue::Int(3)).unwrap();
        assert_eq!(json, r#"{"t":"Int","v":3}"#);
        let back: PropValue = serde_json::from_str(r#"{"t":"Float","v":3.0}"#).unwrap();
        assert_eq!(back, PropValue::Float(3.0));
    }

    #[test]
    fn numeric_cross_comparison() {
        assert_eq!(
            PropValue::Int(2).partial_cmp_value(&PropValue::Float(2.5)),
            Some(Ordering::Less)
        );
        assert_eq!(PropValue::Int(2).partial_cmp_value(&PropValue::from("x")), None);
    }
}

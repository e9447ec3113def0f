use super::types::{EdgeRecord, NodeRecord, PropertyMap};
use crate::types::{EngineError, PropValue, Result};

/// Operations for patching properties, labels and embeddings.
#[derive(Clone, Debug, PartialEq)]
pub enum PropPatchOp {
    /// Set a property to a value. `Null` removes the property.
    Set(String, PropValue),
    /// Delete a property.
    Delete(String),
    /// Replace the whole property map.
    Replace(PropertyMap),
    /// Add a label (nodes only).
    AddLabel(String),
    /// Remove a label (nodes only).
    RemoveLabel(String),
    /// Set the embedding vector (nodes only).
    SetEmbedding(Vec<f32>),
    /// Clear the embedding vector (nodes only).
    ClearEmbedding,
}

/// A batch of patch operations applied in order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PropPatch {
    /// The list of patch operations to apply.
    pub ops: Vec<PropPatchOp>,
}

impl PropPatch {
    /// Creates a new patch from a vector of operations.
    pub fn new(ops: Vec<PropPatchOp>) -> Self {
        Self { ops }
    }

    /// Returns true if this patch contains no operations.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Appends a property assignment.
    pub fn set(mut self, key: impl Into<String>, value: impl Into<PropValue>) -> Self {
        self.ops.push(PropPatchOp::Set(key.into(), value.into()));
        self
    }

    /// Appends a property removal.
    pub fn delete(mut self, key: impl Into<String>) -> Self {
        self.ops.push(PropPatchOp::Delete(key.into()));
        self
    }

    /// Appends a label addition.
    pub fn add_label(mut self, label: impl Into<String>) -> Self {
        self.ops.push(PropPatchOp::AddLabel(label.into()));
        self
    }

    /// Appends a label removal.
    pub fn remove_label(mut self, label: impl Into<String>) -> Self {
        self.ops.push(PropPatchOp::RemoveLabel(label.into()));
        self
    }

    /// Applies the patch to a node image. Returns whether anything changed.
    pub fn apply_to_node(&self, node: &mut NodeRecord) -> Result<bool> {
        let mut changed = false;
        for op in &self.ops {
            changed |= match op {
                PropPatchOp::AddLabel(label) => node.labels.insert(label.clone()),
                PropPatchOp::RemoveLabel(label) => node.labels.remove(label),
                PropPatchOp::SetEmbedding(vector) => {
                    if vector.iter().any(|x| !x.is_finite()) {
                        return Err(EngineError::Invalid("embedding must be finite"));
                    }
                    let differs = node.embedding.as_deref() != Some(vector.as_slice());
                    node.embedding = Some(vector.clone());
                    differs
                }
                PropPatchOp::ClearEmbedding => node.embedding.take().is_some(),
                other => apply_prop_op(other, &mut node.props)?,
            };
        }
        Ok(changed)
    }

    /// Applies the patch to an edge image. Label and embedding operations are rejected.
    pub fn apply_to_edge(&self, edge: &mut EdgeRecord) -> Result<bool> {
        let mut changed = false;
        for op in &self.ops {
            changed |= match op {
                PropPatchOp::AddLabel(_) | PropPatchOp::RemoveLabel(_) => {
                    return Err(EngineError::Invalid("relationships do not carry labels"))
                }
                PropPatchOp::SetEmbedding(_) | PropPatchOp::ClearEmbedding => {
                    return Err(EngineError::Invalid("relationships do not carry embeddings"))
                }
                other => apply_prop_op(other, &mut edge.props)?,
            };
        }
        Ok(changed)
    }
}

fn apply_prop_op(op: &PropPatchOp, props: &mut PropertyMap) -> Result<bool> {
    Ok(match op {
        PropPatchOp::Set(key, PropValue::Null) | PropPatchOp::Delete(key) => {
            props.remove(key).is_some()
        }
        PropPatchOp::Set(key, value) => {
            value.validate()?;
            props.insert(key.clone(), value.clone()).as_ref() != Some(value)
        }
        PropPatchOp::Replace(map) => {
            let cleaned = clean_props(map.clone())?;
            let differs = *props != cleaned;
            *props = cleaned;
            differs
        }
        _ => false,
    })
}

/// Drops `Null` entries and validates the remaining values.
pub fn clean_props(mut props: PropertyMap) -> Result<PropertyMap> {
    props.retain(|_, value| !value.is_null());
    for value in props.values() {
        value.validate()?;
    }
    Ok(props)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EdgeId, NodeId};

    #[test]
    fn null_assignment_removes_property() {
        let mut node = NodeRecord::new(NodeId(1));
        PropPatch::default()
            .set("name", "Alice")
            .set("age", 30i64)
            .apply_to_node(&mut node)
            .unwrap();
        let changed = PropPatch::default()
            .set("age", PropValue::Null)
            .apply_to_node(&mut node)
            .unwrap();
        assert!(changed);
        assert!(!node.props.contains_key("age"));
        assert_eq!(node.props.get("name"), Some(&PropValue::from("Alice")));
    }

    #[test]
    fn labels_and_embedding_on_nodes() {
        let mut node = NodeRecord::new(NodeId(1));
        let patch = PropPatch::new(vec![
            PropPatchOp::AddLabel("Memory".into()),
            PropPatchOp::SetEmbedding(vec![0.1, 0.2]),
        ]);
        assert!(patch.apply_to_node(&mut node).unwrap());
        assert!(node.has_label("Memory"));
        assert!(!patch.apply_to_node(&mut node).unwrap());
        let clear = PropPatch::new(vec![
            PropPatchOp::ClearEmbedding,
            PropPatchOp::RemoveLabel("Memory".into()),
        ]);
        assert!(clear.apply_to_node(&mut node).unwrap());
        assert!(node.embedding.is_none() && node.labels.is_empty());
    }

    #[test]
    fn edges_reject_labels() {
        let mut edge = EdgeRecord {
            id: EdgeId(1),
            ty: "T".into(),
            src: NodeId(1),
            dst: NodeId(2),
            props: PropertyMap::new(),
        };
        let err = PropPatch::default()
            .add_label("X")
            .apply_to_edge(&mut edge)
            .unwrap_err();
        assert!(matches!(err, EngineError::Invalid(_)));
    }

    #[test]
    fn nested_list_is_rejected() {
        let mut node = NodeRecord::new(NodeId(1));
        let nested = PropValue::List(vec![PropValue::List(vec![])]);
        assert!(PropPatch::default()
            .set("bad", nested)
            .apply_to_node(&mut node)
            .is_err());
    }
}

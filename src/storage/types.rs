use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::types::{EdgeId, NodeId, PropValue};

/// Property map keyed by property name. Ordered so records serialize stably.
pub type PropertyMap = BTreeMap<String, PropValue>;

/// Complete committed image of a node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Node identifier.
    pub id: NodeId,
    /// Node labels.
    pub labels: BTreeSet<String>,
    /// Node properties; never contains `Null`.
    pub props: PropertyMap,
    /// Optional embedding vector of the configured dimension.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl NodeRecord {
    /// Creates a record with no labels or properties.
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            labels: BTreeSet::new(),
            props: PropertyMap::new(),
            embedding: None,
        }
    }

    /// Returns true when the node carries `label`.
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.contains(label)
    }
}

/// Complete committed image of an edge.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EdgeRecord {
    /// Edge identifier.
    pub id: EdgeId,
    /// Relationship type.
    pub ty: String,
    /// Source node.
    pub src: NodeId,
    /// Target node.
    pub dst: NodeId,
    /// Edge properties; never contains `Null`.
    pub props: PropertyMap,
}

impl EdgeRecord {
    /// Returns the endpoint opposite to `node`, if `node` is an endpoint.
    pub fn other(&self, node: NodeId) -> Option<NodeId> {
        if self.src == node {
            Some(self.dst)
        } else if self.dst == node {
            Some(self.src)
        } else {
            None
        }
    }
}

/// Deletion mode for node deletion operations.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeleteMode {
    /// Fails if the node has any connected edges (default).
    #[default]
    Restrict,
    /// Deletes the node and all connected edges.
    Cascade,
}

/// Direction of an adjacency lookup relative to the anchor node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    /// Edges whose source is the anchor.
    Outgoing,
    /// Edges whose target is the anchor.
    Incoming,
    /// Either direction.
    Both,
}

impl Direction {
    /// Whether `edge` leaves or enters `node` consistently with this direction.
    pub fn matches(self, edge: &EdgeRecord, node: NodeId) -> bool {
        match self {
            Direction::Outgoing => edge.src == node,
            Direction::Incoming => edge.dst == node,
            Direction::Both => edge.src == node || edge.dst == node,
        }
    }
}

/// Conjunction of property-equality clauses applied during scans.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PropertyFilter {
    clauses: Vec<(String, PropValue)>,
}

impl PropertyFilter {
    /// Filter that accepts everything.
    pub fn any() -> Self {
        Self::default()
    }

    /// Adds an equality clause.
    pub fn eq(mut self, key: impl Into<String>, value: impl Into<PropValue>) -> Self {
        self.clauses.push((key.into(), value.into()));
        self
    }

    /// Returns true when no clause is present.
    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Clauses in insertion order.
    pub fn clauses(&self) -> &[(String, PropValue)] {
        &self.clauses
    }

    /// Tests a property map. Integer and float compare numerically.
    pub fn matches(&self, props: &PropertyMap) -> bool {
        self.clauses.iter().all(|(key, expected)| match props.get(key) {
            Some(actual) => {
                actual == expected
                    || actual.partial_cmp_value(expected) == Some(std::cmp::Ordering::Equal)
            }
            None => expected.is_null(),
        })
    }
}

/// Counts over the latest committed state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct GraphStats {
    /// Live nodes.
    pub nodes: u64,
    /// Live edges.
    pub edges: u64,
    /// Live nodes per label.
    pub labels: BTreeMap<String, u64>,
    /// Live edges per relationship type.
    pub types: BTreeMap<String, u64>,
    /// Versions retained across all chains, tombstones included.
    pub versions: u64,
}

impl GraphStats {
    /// Estimated number of nodes carrying `label`.
    pub fn label_count(&self, label: &str) -> u64 {
        self.labels.get(label).copied().unwrap_or(0)
    }
}

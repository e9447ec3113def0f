use std::collections::BTreeSet;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::debug;

use super::mutation::Mutation;
use super::mvcc::VersionChain;
use super::types::{Direction, EdgeRecord, GraphStats, NodeRecord};
use crate::types::{CommitId, EdgeId, NodeId, PropValue};

/// Result of a vacuum pass.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct VacuumStats {
    /// Versions dropped from chains.
    pub versions_removed: u64,
    /// Nodes whose tombstone was the only remaining version.
    pub nodes_purged: u64,
    /// Edges whose tombstone was the only remaining version.
    pub edges_purged: u64,
}

#[derive(Default)]
struct Counts {
    nodes: u64,
    edges: u64,
    labels: FxHashMap<String, u64>,
    types: FxHashMap<String, u64>,
}

impl Counts {
    fn bump(map: &mut FxHashMap<String, u64>, key: &str, delta: i64) {
        let slot = map.entry(key.to_owned()).or_insert(0);
        *slot = slot.saturating_add_signed(delta);
        if *slot == 0 {
            map.remove(key);
        }
    }
}

/// Multi-version in-memory node and edge store.
///
/// Label, type and adjacency sets are supersets: they contain every id that
/// any retained version belongs to, and readers filter members through
/// [`VersionChain::visible_at`]. Memberships shrink only during vacuum.
#[derive(Default)]
pub struct GraphStore {
    nodes: FxHashMap<NodeId, VersionChain<NodeRecord>>,
    edges: FxHashMap<EdgeId, VersionChain<EdgeRecord>>,
    labels: FxHashMap<String, BTreeSet<NodeId>>,
    types: FxHashMap<String, BTreeSet<EdgeId>>,
    outgoing: FxHashMap<NodeId, BTreeSet<EdgeId>>,
    incoming: FxHashMap<NodeId, BTreeSet<EdgeId>>,
    counts: Counts,
    last_commit: CommitId,
    max_node_id: u64,
    max_edge_id: u64,
}

impl GraphStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Node as seen at `snapshot`.
    pub fn node(&self, id: NodeId, snapshot: CommitId) -> Option<Arc<NodeRecord>> {
        self.nodes.get(&id)?.visible_at(snapshot).cloned()
    }

    /// Edge as seen at `snapshot`.
    pub fn edge(&self, id: EdgeId, snapshot: CommitId) -> Option<Arc<EdgeRecord>> {
        self.edges.get(&id)?.visible_at(snapshot).cloned()
    }

    /// Newest committed node image.
    pub fn latest_node(&self, id: NodeId) -> Option<Arc<NodeRecord>> {
        self.nodes.get(&id)?.latest_value().cloned()
    }

    /// Newest committed edge image.
    pub fn latest_edge(&self, id: EdgeId) -> Option<Arc<EdgeRecord>> {
        self.edges.get(&id)?.latest_value().cloned()
    }

    /// Commit that last wrote the node, deletes included.
    pub fn node_commit(&self, id: NodeId) -> Option<CommitId> {
        self.nodes.get(&id)?.latest_commit()
    }

    /// Commit that last wrote the edge, deletes included.
    pub fn edge_commit(&self, id: EdgeId) -> Option<CommitId> {
        self.edges.get(&id)?.latest_commit()
    }

    /// Every node id visible at `snapshot`, ascending.
    pub fn node_ids(&self, snapshot: CommitId) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|(_, chain)| chain.visible_at(snapshot).is_some())
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Every edge id visible at `snapshot`, ascending.
    pub fn edge_ids(&self, snapshot: CommitId) -> Vec<EdgeId> {
        let mut ids: Vec<EdgeId> = self
            .edges
            .iter()
            .filter(|(_, chain)| chain.visible_at(snapshot).is_some())
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Nodes carrying `label` at `snapshot`, ascending.
    pub fn nodes_with_label(&self, label: &str, snapshot: CommitId) -> Vec<NodeId> {
        let Some(members) = self.labels.get(label) else {
            return Vec::new();
        };
        members
            .iter()
            .copied()
            .filter(|id| {
                self.node(*id, snapshot)
                    .is_some_and(|node| node.has_label(label))
            })
            .collect()
    }

    /// Edges of type `ty` at `snapshot`, ascending.
    pub fn edges_with_type(&self, ty: &str, snapshot: CommitId) -> Vec<EdgeId> {
        let Some(members) = self.types.get(ty) else {
            return Vec::new();
        };
        members
            .iter()
            .copied()
            .filter(|id| self.edge(*id, snapshot).is_some())
            .collect()
    }

    /// Edges incident to `node` in `dir` at `snapshot`, ascending and without
    /// duplicates (a self-loop appears once).
    pub fn adjacent(&self, node: NodeId, dir: Direction, snapshot: CommitId) -> Vec<EdgeId> {
        let mut out = BTreeSet::new();
        if matches!(dir, Direction::Outgoing | Direction::Both) {
            if let Some(set) = self.outgoing.get(&node) {
                out.extend(set.iter().copied());
            }
        }
        if matches!(dir, Direction::Incoming | Direction::Both) {
            if let Some(set) = self.incoming.get(&node) {
                out.extend(set.iter().copied());
            }
        }
        out.into_iter()
            .filter(|id| self.edge(*id, snapshot).is_some())
            .collect()
    }

    /// Live edges incident to `node` in the newest committed state.
    pub fn latest_adjacent(&self, node: NodeId) -> Vec<EdgeId> {
        let mut out = BTreeSet::new();
        for index in [&self.outgoing, &self.incoming] {
            if let Some(set) = index.get(&node) {
                out.extend(
                    set.iter()
                        .copied()
                        .filter(|id| self.latest_edge(*id).is_some()),
                );
            }
        }
        out.into_iter().collect()
    }

    /// Live nodes labelled `label` whose `key` equals `value` in the newest
    /// committed state.
    pub fn latest_nodes_with_property(
        &self,
        label: &str,
        key: &str,
        value: &PropValue,
    ) -> Vec<NodeId> {
        let Some(members) = self.labels.get(label) else {
            return Vec::new();
        };
        members
            .iter()
            .copied()
            .filter(|id| {
                self.latest_node(*id).is_some_and(|node| {
                    node.has_label(label) && node.props.get(key) == Some(value)
                })
            })
            .collect()
    }

    /// Labels with at least one node visible at `snapshot`.
    pub fn labels_at(&self, snapshot: CommitId) -> Vec<String> {
        let mut labels: Vec<String> = self
            .labels
            .keys()
            .filter(|label| !self.nodes_with_label(label, snapshot).is_empty())
            .cloned()
            .collect();
        labels.sort();
        labels
    }

    /// Relationship types with at least one edge visible at `snapshot`.
    pub fn types_at(&self, snapshot: CommitId) -> Vec<String> {
        let mut types: Vec<String> = self
            .types
            .iter()
            .filter(|(_, ids)| ids.iter().any(|id| self.edge(*id, snapshot).is_some()))
            .map(|(ty, _)| ty.clone())
            .collect();
        types.sort();
        types
    }

    /// Commit id of the newest applied batch.
    pub fn last_commit(&self) -> CommitId {
        self.last_commit
    }

    /// Largest node id ever stored.
    pub fn max_node_id(&self) -> u64 {
        self.max_node_id
    }

    /// Largest edge id ever stored.
    pub fn max_edge_id(&self) -> u64 {
        self.max_edge_id
    }

    /// Installs a committed batch as versions stamped with `commit`.
    ///
    /// Callers validate the batch first; this only records it.
    pub fn apply(&mut self, commit: CommitId, mutations: &[Mutation]) {
        for mutation in mutations {
            match mutation {
                Mutation::CreateNode(node) | Mutation::UpdateNode(node) => {
                    self.put_node(commit, Some(Arc::clone(node)), node.id);
                }
                Mutation::DeleteNode(id) => self.put_node(commit, None, *id),
                Mutation::CreateEdge(edge) | Mutation::UpdateEdge(edge) => {
                    self.put_edge(commit, Some(Arc::clone(edge)), edge.id);
                }
                Mutation::DeleteEdge(id) => self.put_edge(commit, None, *id),
            }
        }
        self.last_commit = self.last_commit.max(commit);
    }

    fn put_node(&mut self, commit: CommitId, value: Option<Arc<NodeRecord>>, id: NodeId) {
        let chain = self.nodes.entry(id).or_default();
        let previous = chain.latest_value().cloned();
        chain.push(commit, value.clone());
        self.max_node_id = self.max_node_id.max(id.0);
        if let Some(prev) = &previous {
            self.counts.nodes -= 1;
            for label in &prev.labels {
                Counts::bump(&mut self.counts.labels, label, -1);
            }
        }
        if let Some(node) = &value {
            self.counts.nodes += 1;
            for label in &node.labels {
                Counts::bump(&mut self.counts.labels, label, 1);
                self.labels.entry(label.clone()).or_default().insert(id);
            }
        }
    }

    fn put_edge(&mut self, commit: CommitId, value: Option<Arc<EdgeRecord>>, id: EdgeId) {
        let chain = self.edges.entry(id).or_default();
        let previous = chain.latest_value().cloned();
        chain.push(commit, value.clone());
        self.max_edge_id = self.max_edge_id.max(id.0);
        if let Some(prev) = &previous {
            self.counts.edges -= 1;
            Counts::bump(&mut self.counts.types, &prev.ty, -1);
        }
        if let Some(edge) = &value {
            self.counts.edges += 1;
            Counts::bump(&mut self.counts.types, &edge.ty, 1);
            self.types.entry(edge.ty.clone()).or_default().insert(id);
            self.outgoing.entry(edge.src).or_default().insert(id);
            self.incoming.entry(edge.dst).or_default().insert(id);
        }
    }

    /// Drops versions older than what a reader at `horizon` needs, then purges
    /// entities that are only a tombstone and their index memberships.
    pub fn vacuum(&mut self, horizon: CommitId) -> VacuumStats {
        let mut stats = VacuumStats::default();
        let mut dead_nodes = Vec::new();
        let mut touched_nodes = Vec::new();
        for (id, chain) in self.nodes.iter_mut() {
            let outcome = chain.prune(horizon);
            stats.versions_removed += outcome.removed as u64;
            if outcome.dead {
                dead_nodes.push(*id);
            } else if outcome.removed > 0 {
                touched_nodes.push(*id);
            }
        }
        let mut dead_edges = Vec::new();
        for (id, chain) in self.edges.iter_mut() {
            let outcome = chain.prune(horizon);
            stats.versions_removed += outcome.removed as u64;
            if outcome.dead {
                dead_edges.push(*id);
            }
        }
        for id in &dead_nodes {
            self.nodes.remove(id);
            self.outgoing.remove(id);
            self.incoming.remove(id);
        }
        for id in dead_nodes.iter().chain(touched_nodes.iter()) {
            let retained: BTreeSet<&String> = self
                .nodes
                .get(id)
                .map(|chain| {
                    chain
                        .versions()
                        .iter()
                        .filter_map(|v| v.value.as_ref())
                        .flat_map(|node| node.labels.iter())
                        .collect()
                })
                .unwrap_or_default();
            let stale: Vec<String> = self
                .labels
                .iter()
                .filter(|(label, members)| members.contains(id) && !retained.contains(label))
                .map(|(label, _)| label.clone())
                .collect();
            for label in stale {
                if let Some(members) = self.labels.get_mut(&label) {
                    members.remove(id);
                    if members.is_empty() {
                        self.labels.remove(&label);
                    }
                }
            }
        }
        for id in &dead_edges {
            self.edges.remove(id);
            for index in [&mut self.outgoing, &mut self.incoming] {
                for set in index.values_mut() {
                    set.remove(id);
                }
            }
            self.types.retain(|_, members| {
                members.remove(id);
                !members.is_empty()
            });
        }
        self.outgoing.retain(|_, set| !set.is_empty());
        self.incoming.retain(|_, set| !set.is_empty());
        stats.nodes_purged = dead_nodes.len() as u64;
        stats.edges_purged = dead_edges.len() as u64;
        if stats.versions_removed > 0 {
            debug!(
                horizon,
                versions = stats.versions_removed,
                nodes = stats.nodes_purged,
                edges = stats.edges_purged,
                "storage.vacuum"
            );
        }
        stats
    }

    /// Live nodes carrying `label` in the newest committed state.
    pub fn label_count(&self, label: &str) -> u64 {
        self.counts.labels.get(label).copied().unwrap_or(0)
    }

    /// Live nodes in the newest committed state.
    pub fn node_count(&self) -> u64 {
        self.counts.nodes
    }

    /// Counts over the newest committed state.
    pub fn stats(&self) -> GraphStats {
        GraphStats {
            nodes: self.counts.nodes,
            edges: self.counts.edges,
            labels: self
                .counts
                .labels
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
            types: self
                .counts
                .types
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
            versions: self.nodes.values().map(|c| c.len() as u64).sum::<u64>()
                + self.edges.values().map(|c| c.len() as u64).sum::<u64>(),
        }
    }

    /// Live nodes in the newest committed state, ascending by id.
    pub fn latest_nodes(&self) -> Vec<Arc<NodeRecord>> {
        let mut out: Vec<Arc<NodeRecord>> =
            self.nodes.values().filter_map(|c| c.latest_value().cloned()).collect();
        out.sort_unstable_by_key(|n| n.id);
        out
    }

    /// Live edges in the newest committed state, ascending by id.
    pub fn latest_edges(&self) -> Vec<Arc<EdgeRecord>> {
        let mut out: Vec<Arc<EdgeRecord>> =
            self.edges.values().filter_map(|c| c.latest_value().cloned()).collect();
        out.sort_unstable_by_key(|e| e.id);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::PropertyMap;

    fn node(id: u64, labels: &[&str], age: i64) -> Arc<NodeRecord> {
        let mut rec = NodeRecord::new(NodeId(id));
        rec.labels = labels.iter().map(|l| l.to_string()).collect();
        rec.props.insert("age".into(), PropValue::Int(age));
        Arc::new(rec)
    }

    fn edge(id: u64, src: u64, dst: u64) -> Arc<EdgeRecord> {
        Arc::new(EdgeRecord {
            id: EdgeId(id),
            ty: "KNOWS".into(),
            src: NodeId(src),
            dst: NodeId(dst),
            props: PropertyMap::new(),
        })
    }

    #[test]
    fn snapshots_see_their_own_versions() {
        let mut store = GraphStore::new();
        store.apply(1, &[Mutation::CreateNode(node(1, &["Person"], 30))]);
        store.apply(2, &[Mutation::UpdateNode(node(1, &["Person"], 31))]);
        assert_eq!(store.node(NodeId(1), 1).unwrap().props["age"], PropValue::Int(30));
        assert_eq!(store.node(NodeId(1), 2).unwrap().props["age"], PropValue::Int(31));
        assert!(store.node(NodeId(1), 0).is_none());
        assert_eq!(store.stats().nodes, 1);
        assert_eq!(store.stats().label_count("Person"), 1);
    }

    #[test]
    fn adjacency_and_label_membership_follow_snapshot() {
        let mut store = GraphStore::new();
        store.apply(
            1,
            &[
                Mutation::CreateNode(node(1, &["A"], 1)),
                Mutation::CreateNode(node(2, &["A", "B"], 2)),
                Mutation::CreateEdge(edge(10, 1, 2)),
            ],
        );
        store.apply(2, &[Mutation::DeleteEdge(EdgeId(10))]);
        store.apply(3, &[Mutation::UpdateNode(node(2, &["A"], 2))]);
        assert_eq!(store.adjacent(NodeId(1), Direction::Outgoing, 1), vec![EdgeId(10)]);
        assert!(store.adjacent(NodeId(1), Direction::Outgoing, 2).is_empty());
        assert_eq!(store.adjacent(NodeId(2), Direction::Incoming, 1), vec![EdgeId(10)]);
        assert_eq!(store.nodes_with_label("B", 2), vec![NodeId(2)]);
        assert!(store.nodes_with_label("B", 3).is_empty());
        assert_eq!(store.labels_at(3), vec!["A".to_string()]);
    }

    #[test]
    fn vacuum_purges_dead_entities_and_memberships() {
        let mut store = GraphStore::new();
        store.apply(
            1,
            &[
                Mutation::CreateNode(node(1, &["Gone"], 1)),
                Mutation::CreateNode(node(2, &["Stay"], 2)),
                Mutation::CreateEdge(edge(5, 1, 2)),
            ],
        );
        store.apply(2, &[Mutation::DeleteEdge(EdgeId(5)), Mutation::DeleteNode(NodeId(1))]);
        store.apply(3, &[Mutation::UpdateNode(node(2, &["Stay"], 3))]);
        let stats = store.vacuum(3);
        assert_eq!(stats.nodes_purged, 1);
        assert_eq!(stats.edges_purged, 1);
        assert!(store.nodes_with_label("Gone", 3).is_empty());
        assert!(store.labels_at(3) == vec!["Stay".to_string()]);
        assert!(store.adjacent(NodeId(2), Direction::Both, 3).is_empty());
        assert_eq!(store.stats().versions, 1);
    }
}

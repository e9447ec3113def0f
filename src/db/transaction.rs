//! Transaction handles.
//!
//! A transaction reads the committed state at its snapshot plus its own
//! buffered writes. Writes take entity locks eagerly, so a second writer of
//! the same node or edge fails with `TransactionConflict` at the write, not at
//! commit. Nothing reaches the WAL or the store until [`Transaction::commit`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use tracing::{debug, trace};

use super::config::Config;
use super::manager::TxManager;
use crate::storage::{
    clean_props, DeleteMode, Direction, EdgeRecord, Mutation, NodeRecord, PropPatch, PropPatchOp,
    PropertyFilter, PropertyMap,
};
use crate::types::{
    clone_error, CommitId, EdgeId, EngineError, EntityKey, NodeId, PropValue, Result, TxId,
};

/// Cooperative cancellation flag shared between a caller and a running
/// transaction or query.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Fresh, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Options for [`Database::begin_with`](super::Database::begin_with).
#[derive(Clone, Debug, Default)]
pub struct TxOptions {
    /// Abort operations once the transaction is older than this.
    pub timeout: Option<Duration>,
    /// External cancellation token.
    pub cancel: Option<CancelToken>,
}

/// Lifecycle of a transaction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TxStatus {
    /// Started; nothing read or written yet.
    Begin,
    /// At least one operation ran.
    Active,
    /// Being written to the WAL and applied.
    Committing,
    /// Applied and visible to later snapshots.
    Committed,
    /// Discarded.
    RolledBack,
}

#[derive(Clone, Debug)]
enum Pending<T> {
    Created(Arc<T>),
    Updated(Arc<T>),
    Deleted,
}

impl<T> Pending<T> {
    fn value(&self) -> Option<&Arc<T>> {
        match self {
            Pending::Created(v) | Pending::Updated(v) => Some(v),
            Pending::Deleted => None,
        }
    }
}

#[derive(Clone, Debug, Default)]
struct Overlay {
    nodes: BTreeMap<NodeId, Pending<NodeRecord>>,
    edges: BTreeMap<EdgeId, Pending<EdgeRecord>>,
}

impl Overlay {
    fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }

    /// Node creates and updates, edge creates and updates, edge deletes,
    /// then node deletes; ascending ids within each group.
    fn to_mutations(&self) -> Vec<Mutation> {
        let mut out = Vec::with_capacity(self.nodes.len() + self.edges.len());
        for pending in self.nodes.values() {
            match pending {
                Pending::Created(node) => out.push(Mutation::CreateNode(Arc::clone(node))),
                Pending::Updated(node) => out.push(Mutation::UpdateNode(Arc::clone(node))),
                Pending::Deleted => {}
            }
        }
        for pending in self.edges.values() {
            match pending {
                Pending::Created(edge) => out.push(Mutation::CreateEdge(Arc::clone(edge))),
                Pending::Updated(edge) => out.push(Mutation::UpdateEdge(Arc::clone(edge))),
                Pending::Deleted => {}
            }
        }
        for (id, pending) in &self.edges {
            if matches!(pending, Pending::Deleted) {
                out.push(Mutation::DeleteEdge(*id));
            }
        }
        for (id, pending) in &self.nodes {
            if matches!(pending, Pending::Deleted) {
                out.push(Mutation::DeleteNode(*id));
            }
        }
        out
    }
}

struct TxInner {
    status: TxStatus,
    failed: Option<EngineError>,
    overlay: Overlay,
    savepoints: Vec<Overlay>,
    locks: FxHashSet<EntityKey>,
}

struct TxShared {
    id: TxId,
    snapshot: CommitId,
    manager: Arc<TxManager>,
    deadline: Option<Instant>,
    cancel: CancelToken,
    inner: Mutex<TxInner>,
}

/// Handle to an open transaction. Clones share the same transaction; the
/// last handle dropped while still open rolls it back.
#[derive(Clone)]
pub struct Transaction {
    shared: Arc<TxShared>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.shared.id)
            .field("snapshot", &self.shared.snapshot)
            .finish()
    }
}

/// Errors after which the transaction can only roll back.
fn poisons(err: &EngineError) -> bool {
    matches!(
        err,
        EngineError::ConstraintViolation(_)
            | EngineError::DanglingReference { .. }
            | EngineError::TransactionConflict { .. }
            | EngineError::Cancelled
            | EngineError::Timeout
            | EngineError::Io(_)
            | EngineError::Corruption(_)
            | EngineError::Halted
    )
}

impl Transaction {
    pub(crate) fn begin(manager: &Arc<TxManager>, options: TxOptions) -> Result<Self> {
        let (id, snapshot) = manager.register()?;
        trace!(tx_id = id.0, snapshot, "txn.begin");
        Ok(Self {
            shared: Arc::new(TxShared {
                id,
                snapshot,
                manager: Arc::clone(manager),
                deadline: options.timeout.map(|t| Instant::now() + t),
                cancel: options.cancel.unwrap_or_default(),
                inner: Mutex::new(TxInner {
                    status: TxStatus::Begin,
                    failed: None,
                    overlay: Overlay::default(),
                    savepoints: Vec::new(),
                    locks: FxHashSet::default(),
                }),
            }),
        })
    }

    /// Transaction id.
    pub fn id(&self) -> TxId {
        self.shared.id
    }

    /// Commit id this transaction reads at.
    pub fn snapshot(&self) -> CommitId {
        self.shared.snapshot
    }

    /// Current lifecycle state.
    pub fn status(&self) -> TxStatus {
        self.shared.inner.lock().status
    }

    /// Whether an earlier error left the transaction only able to roll back.
    pub fn is_failed(&self) -> bool {
        self.shared.inner.lock().failed.is_some()
    }

    /// Whether the transaction has buffered writes.
    pub fn has_writes(&self) -> bool {
        !self.shared.inner.lock().overlay.is_empty()
    }

    /// Token that cancels this transaction's operations.
    pub fn cancel_token(&self) -> CancelToken {
        self.shared.cancel.clone()
    }

    /// Engine configuration.
    pub fn config(&self) -> &Config {
        &self.shared.manager.config
    }

    /// Fails with `Cancelled` or `Timeout` when the transaction was
    /// cancelled or ran past its deadline.
    pub fn check_interrupt(&self) -> Result<()> {
        self.shared.interrupted()
    }

    fn run<T>(&self, op: impl FnOnce(&TxShared, &mut TxInner) -> Result<T>) -> Result<T> {
        let shared = &*self.shared;
        let mut inner = shared.inner.lock();
        match inner.status {
            TxStatus::Committing | TxStatus::Committed | TxStatus::RolledBack => {
                return Err(EngineError::TransactionClosed(shared.id))
            }
            TxStatus::Begin => inner.status = TxStatus::Active,
            TxStatus::Active => {}
        }
        if let Some(err) = &inner.failed {
            debug!(tx_id = shared.id.0, %err, "txn.op_on_failed");
            return Err(EngineError::TransactionClosed(shared.id));
        }
        let out = shared.interrupted().and_then(|()| op(shared, &mut inner));
        if let Err(err) = &out {
            if poisons(err) {
                debug!(tx_id = shared.id.0, %err, "txn.failed");
                inner.failed = Some(clone_error(err));
            }
        }
        out
    }

    /// Creates a node. A property named after the configured embedding
    /// property becomes the node's embedding.
    pub fn create_node<I, S>(&self, labels: I, props: PropertyMap) -> Result<NodeId>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let labels: BTreeSet<String> = labels.into_iter().map(Into::into).collect();
        self.run(|shared, inner| {
            let mut props = props;
            let embedding = shared.take_embedding(&mut props)?;
            let props = clean_props(props)?;
            let id = shared.manager.allocate_node_id();
            let record = NodeRecord {
                id,
                labels,
                props,
                embedding,
            };
            shared.manager.lock_new(shared.id, EntityKey::Node(id));
            inner.locks.insert(EntityKey::Node(id));
            inner.overlay.nodes.insert(id, Pending::Created(Arc::new(record)));
            Ok(id)
        })
    }

    /// Creates a directed edge between two nodes visible to this transaction.
    pub fn create_edge(
        &self,
        ty: impl Into<String>,
        src: NodeId,
        dst: NodeId,
        props: PropertyMap,
    ) -> Result<EdgeId> {
        let ty = ty.into();
        if ty.is_empty() {
            return Err(EngineError::Invalid("relationship type must not be empty"));
        }
        self.run(|shared, inner| {
            let props = clean_props(props)?;
            let id = shared.manager.allocate_edge_id();
            for endpoint in [src, dst] {
                if shared.node_view(inner, endpoint).is_none() {
                    return Err(EngineError::DanglingReference { edge: id, node: endpoint });
                }
            }
            shared.manager.lock_new(shared.id, EntityKey::Edge(id));
            inner.locks.insert(EntityKey::Edge(id));
            let record = EdgeRecord {
                id,
                ty,
                src,
                dst,
                props,
            };
            inner.overlay.edges.insert(id, Pending::Created(Arc::new(record)));
            Ok(id)
        })
    }

    /// Node visible to this transaction, if any.
    pub fn node(&self, id: NodeId) -> Result<Option<Arc<NodeRecord>>> {
        self.run(|shared, inner| Ok(shared.node_view(inner, id)))
    }

    /// Node visible to this transaction, or `NotFound`.
    pub fn get_node(&self, id: NodeId) -> Result<Arc<NodeRecord>> {
        self.node(id)?
            .ok_or(EngineError::NotFound(EntityKey::Node(id)))
    }

    /// Edge visible to this transaction, if any.
    pub fn edge(&self, id: EdgeId) -> Result<Option<Arc<EdgeRecord>>> {
        self.run(|shared, inner| Ok(shared.edge_view(inner, id)))
    }

    /// Edge visible to this transaction, or `NotFound`.
    pub fn get_edge(&self, id: EdgeId) -> Result<Arc<EdgeRecord>> {
        self.edge(id)?
            .ok_or(EngineError::NotFound(EntityKey::Edge(id)))
    }

    /// Applies a patch to a node and returns the new image.
    pub fn update_node(&self, id: NodeId, patch: &PropPatch) -> Result<Arc<NodeRecord>> {
        self.run(|shared, inner| {
            let current = shared
                .node_view(inner, id)
                .ok_or(EngineError::NotFound(EntityKey::Node(id)))?;
            let patch = shared.route_embedding(patch)?;
            let mut image = (*current).clone();
            if !patch.apply_to_node(&mut image)? {
                return Ok(current);
            }
            shared.write_lock(inner, EntityKey::Node(id))?;
            let image = Arc::new(image);
            let pending = match inner.overlay.nodes.get(&id) {
                Some(Pending::Created(_)) => Pending::Created(Arc::clone(&image)),
                _ => Pending::Updated(Arc::clone(&image)),
            };
            inner.overlay.nodes.insert(id, pending);
            Ok(image)
        })
    }

    /// Applies a property patch to an edge and returns the new image.
    pub fn update_edge(&self, id: EdgeId, patch: &PropPatch) -> Result<Arc<EdgeRecord>> {
        self.run(|shared, inner| {
            let current = shared
                .edge_view(inner, id)
                .ok_or(EngineError::NotFound(EntityKey::Edge(id)))?;
            let mut image = (*current).clone();
            if !patch.apply_to_edge(&mut image)? {
                return Ok(current);
            }
            shared.write_lock(inner, EntityKey::Edge(id))?;
            let image = Arc::new(image);
            let pending = match inner.overlay.edges.get(&id) {
                Some(Pending::Created(_)) => Pending::Created(Arc::clone(&image)),
                _ => Pending::Updated(Arc::clone(&image)),
            };
            inner.overlay.edges.insert(id, pending);
            Ok(image)
        })
    }

    /// Deletes an edge.
    pub fn delete_edge(&self, id: EdgeId) -> Result<()> {
        self.run(|shared, inner| shared.delete_edge(inner, id))
    }

    /// Deletes a node. `Restrict` fails while edges remain; `Cascade` deletes
    /// them first.
    pub fn delete_node(&self, id: NodeId, mode: DeleteMode) -> Result<()> {
        self.run(|shared, inner| {
            if shared.node_view(inner, id).is_none() {
                return Err(EngineError::NotFound(EntityKey::Node(id)));
            }
            let incident = shared.edges_of(inner, id, Direction::Both);
            if !incident.is_empty() {
                match mode {
                    DeleteMode::Restrict => {
                        return Err(EngineError::ConstraintViolation(format!(
                            "cannot delete node {id}: it still has {} relationship(s)",
                            incident.len()
                        )))
                    }
                    DeleteMode::Cascade => {
                        for edge in incident {
                            shared.delete_edge(inner, edge)?;
                        }
                    }
                }
            }
            shared.write_lock(inner, EntityKey::Node(id))?;
            match inner.overlay.nodes.get(&id) {
                Some(Pending::Created(_)) => {
                    inner.overlay.nodes.remove(&id);
                }
                _ => {
                    inner.overlay.nodes.insert(id, Pending::Deleted);
                }
            }
            Ok(())
        })
    }

    /// Ids of edges incident to `node` in direction `dir`, ascending.
    pub fn edges_of(&self, node: NodeId, dir: Direction) -> Result<Vec<EdgeId>> {
        self.run(|shared, inner| Ok(shared.edges_of(inner, node, dir)))
    }

    /// Edges incident to `node`, optionally restricted to types, paired
    /// with the node at the other end.
    pub fn expand(
        &self,
        node: NodeId,
        dir: Direction,
        types: &[String],
    ) -> Result<Vec<(Arc<EdgeRecord>, NodeId)>> {
        self.run(|shared, inner| {
            let mut out = Vec::new();
            for id in shared.edges_of(inner, node, dir) {
                let Some(edge) = shared.edge_view(inner, id) else {
                    continue;
                };
                if !types.is_empty() && !types.iter().any(|t| *t == edge.ty) {
                    continue;
                }
                let other = if edge.src == node { edge.dst } else { edge.src };
                out.push((edge, other));
            }
            Ok(out)
        })
    }

    /// Lazily scans nodes, optionally restricted to a label and filtered
    /// by property equality.
    pub fn scan_nodes(&self, label: Option<&str>, filter: PropertyFilter) -> Result<NodeScan> {
        let ids = self.run(|shared, inner| {
            let store = shared.manager.store.read();
            let mut ids: BTreeSet<NodeId> = match label {
                Some(label) => store.nodes_with_label(label, shared.snapshot),
                None => store.node_ids(shared.snapshot),
            }
            .into_iter()
            .collect();
            for (id, pending) in &inner.overlay.nodes {
                match pending.value() {
                    Some(_) => {
                        ids.insert(*id);
                    }
                    None => {
                        ids.remove(id);
                    }
                }
            }
            Ok(ids.into_iter().collect::<Vec<_>>())
        })?;
        Ok(NodeScan {
            tx: self.clone(),
            ids: ids.into_iter(),
            label: label.map(str::to_owned),
            filter,
        })
    }

    /// Lazily scans edges, optionally restricted to a type.
    pub fn scan_edges(&self, ty: Option<&str>, filter: PropertyFilter) -> Result<EdgeScan> {
        let ids = self.run(|shared, inner| {
            let store = shared.manager.store.read();
            let mut ids: BTreeSet<EdgeId> = match ty {
                Some(ty) => store.edges_with_type(ty, shared.snapshot),
                None => store.edge_ids(shared.snapshot),
            }
            .into_iter()
            .collect();
            for (id, pending) in &inner.overlay.edges {
                match pending.value() {
                    Some(_) => {
                        ids.insert(*id);
                    }
                    None => {
                        ids.remove(id);
                    }
                }
            }
            Ok(ids.into_iter().collect::<Vec<_>>())
        })?;
        Ok(EdgeScan {
            tx: self.clone(),
            ids: ids.into_iter(),
            ty: ty.map(str::to_owned),
            filter,
        })
    }

    /// Estimated number of nodes carrying `label` in committed state.
    pub fn estimate_label(&self, label: &str) -> u64 {
        self.shared.manager.store.read().label_count(label)
    }

    /// Estimated number of nodes in committed state.
    pub fn estimate_nodes(&self) -> u64 {
        self.shared.manager.store.read().node_count()
    }

    /// Labels in use, including this transaction's writes.
    pub fn labels(&self) -> Result<Vec<String>> {
        self.run(|shared, inner| {
            let mut labels: BTreeSet<String> = shared
                .manager
                .store
                .read()
                .labels_at(shared.snapshot)
                .into_iter()
                .collect();
            for node in inner.overlay.nodes.values().filter_map(Pending::value) {
                labels.extend(node.labels.iter().cloned());
            }
            Ok(labels.into_iter().collect())
        })
    }

    /// Relationship types in use, including this transaction's writes.
    pub fn relationship_types(&self) -> Result<Vec<String>> {
        self.run(|shared, inner| {
            let mut types: BTreeSet<String> = shared
                .manager
                .store
                .read()
                .types_at(shared.snapshot)
                .into_iter()
                .collect();
            for edge in inner.overlay.edges.values().filter_map(Pending::value) {
                types.insert(edge.ty.clone());
            }
            Ok(types.into_iter().collect())
        })
    }

    /// Nearest neighbours of `query` among committed nodes visible here.
    pub fn vector_search(&self, query: &[f32], k: usize) -> Result<Vec<(Arc<NodeRecord>, f32)>> {
        self.run(|shared, inner| {
            let hits = shared.manager.indexes.vector_search(query, overfetch(k))?;
            Ok(shared.resolve_hits(inner, hits, k))
        })
    }

    /// BM25 matches of `query` among committed nodes visible here.
    pub fn fulltext_search(&self, query: &str, k: usize) -> Result<Vec<(Arc<NodeRecord>, f32)>> {
        self.run(|shared, inner| {
            let hits = shared.manager.indexes.fulltext_search(query, overfetch(k));
            Ok(shared.resolve_hits(inner, hits, k))
        })
    }

    /// Reciprocal-rank fusion of text and (optionally) vector matches.
    pub fn hybrid_search(
        &self,
        query: &str,
        embedding: Option<&[f32]>,
        k: usize,
    ) -> Result<Vec<(Arc<NodeRecord>, f32)>> {
        self.run(|shared, inner| {
            let hits = shared.manager.indexes.hybrid_search(query, embedding, k)?;
            Ok(shared.resolve_hits(inner, hits, k))
        })
    }

    /// Checks an index name against the configured vector index.
    pub fn resolve_vector_index(&self, name: &str) -> Result<()> {
        self.shared.manager.indexes.resolve_vector_index(name)
    }

    /// Checks an index name against the configured full-text index.
    pub fn resolve_fulltext_index(&self, name: &str) -> Result<()> {
        self.shared.manager.indexes.resolve_fulltext_index(name)
    }

    /// Marks the start of a statement whose writes can be undone alone.
    pub fn savepoint(&self) -> Result<()> {
        self.run(|_, inner| {
            let snapshot = inner.overlay.clone();
            inner.savepoints.push(snapshot);
            Ok(())
        })
    }

    /// Undoes writes since the latest savepoint. Locks taken meanwhile are
    /// kept until the transaction ends.
    pub fn rollback_to_savepoint(&self) {
        let mut inner = self.shared.inner.lock();
        if let Some(overlay) = inner.savepoints.pop() {
            inner.overlay = overlay;
        }
    }

    /// Forgets the latest savepoint, keeping its writes.
    pub fn release_savepoint(&self) {
        self.shared.inner.lock().savepoints.pop();
    }

    /// Records a failure raised outside the transaction (e.g. by the query
    /// layer) that leaves it only able to roll back.
    pub fn mark_failed(&self, err: &EngineError) {
        let mut inner = self.shared.inner.lock();
        if inner.failed.is_none() {
            inner.failed = Some(clone_error(err));
        }
    }

    /// Validates, logs and applies buffered writes. A failed transaction is
    /// rolled back and its failure returned.
    pub fn commit(&self) -> Result<CommitId> {
        let shared = &*self.shared;
        let mut inner = shared.inner.lock();
        match inner.status {
            TxStatus::Committing | TxStatus::Committed | TxStatus::RolledBack => {
                return Err(EngineError::TransactionClosed(shared.id))
            }
            _ => {}
        }
        if let Some(err) = inner.failed.take() {
            shared.finish(&mut inner, TxStatus::RolledBack);
            return Err(err);
        }
        if let Err(err) = shared.interrupted() {
            shared.finish(&mut inner, TxStatus::RolledBack);
            return Err(err);
        }
        inner.status = TxStatus::Committing;
        let mutations = inner.overlay.to_mutations();
        match shared.manager.commit(shared.id, shared.snapshot, mutations) {
            Ok(commit) => {
                shared.finish(&mut inner, TxStatus::Committed);
                Ok(commit)
            }
            Err(err) => {
                debug!(tx_id = shared.id.0, %err, "txn.commit_failed");
                shared.finish(&mut inner, TxStatus::RolledBack);
                Err(err)
            }
        }
    }

    /// Discards buffered writes. Rolling back twice is a no-op.
    pub fn rollback(&self) -> Result<()> {
        let shared = &*self.shared;
        let mut inner = shared.inner.lock();
        match inner.status {
            TxStatus::RolledBack => Ok(()),
            TxStatus::Committing | TxStatus::Committed => {
                Err(EngineError::TransactionClosed(shared.id))
            }
            TxStatus::Begin | TxStatus::Active => {
                shared.finish(&mut inner, TxStatus::RolledBack);
                debug!(tx_id = shared.id.0, "txn.rollback");
                Ok(())
            }
        }
    }
}

fn overfetch(k: usize) -> usize {
    k.saturating_mul(2).saturating_add(8)
}

impl TxShared {
    fn interrupted(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(EngineError::Timeout);
        }
        Ok(())
    }

    fn finish(&self, inner: &mut TxInner, status: TxStatus) {
        inner.status = status;
        inner.overlay = Overlay::default();
        inner.savepoints.clear();
        let locks = std::mem::take(&mut inner.locks);
        self.manager.release(self.id, &locks);
        self.manager.unregister(self.id, status == TxStatus::Committed);
    }

    fn node_view(&self, inner: &TxInner, id: NodeId) -> Option<Arc<NodeRecord>> {
        match inner.overlay.nodes.get(&id) {
            Some(pending) => pending.value().cloned(),
            None => self.manager.store.read().node(id, self.snapshot),
        }
    }

    fn edge_view(&self, inner: &TxInner, id: EdgeId) -> Option<Arc<EdgeRecord>> {
        match inner.overlay.edges.get(&id) {
            Some(pending) => pending.value().cloned(),
            None => self.manager.store.read().edge(id, self.snapshot),
        }
    }

    fn edges_of(&self, inner: &TxInner, node: NodeId, dir: Direction) -> Vec<EdgeId> {
        let mut ids: BTreeSet<EdgeId> = self
            .manager
            .store
            .read()
            .adjacent(node, dir, self.snapshot)
            .into_iter()
            .filter(|id| !matches!(inner.overlay.edges.get(id), Some(Pending::Deleted)))
            .collect();
        for (id, pending) in &inner.overlay.edges {
            if let Some(edge) = pending.value() {
                if dir.matches(edge, node) {
                    ids.insert(*id);
                }
            }
        }
        ids.into_iter().collect()
    }

    fn write_lock(&self, inner: &mut TxInner, key: EntityKey) -> Result<()> {
        if inner.locks.contains(&key) {
            return Ok(());
        }
        self.manager.acquire(self.id, self.snapshot, key)?;
        inner.locks.insert(key);
        Ok(())
    }

    fn delete_edge(&self, inner: &mut TxInner, id: EdgeId) -> Result<()> {
        if self.edge_view(inner, id).is_none() {
            return Err(EngineError::NotFound(EntityKey::Edge(id)));
        }
        self.write_lock(inner, EntityKey::Edge(id))?;
        match inner.overlay.edges.get(&id) {
            Some(Pending::Created(_)) => {
                inner.overlay.edges.remove(&id);
            }
            _ => {
                inner.overlay.edges.insert(id, Pending::Deleted);
            }
        }
        Ok(())
    }

    fn embedding_from(&self, value: &PropValue) -> Result<Vec<f32>> {
        let key = &self.manager.config.vector.property;
        let vector = value.as_vector().ok_or_else(|| {
            EngineError::InvalidOwned(format!("property `{key}` must be a list of numbers"))
        })?;
        self.manager.indexes.check_embedding(&vector)?;
        Ok(vector)
    }

    fn take_embedding(&self, props: &mut PropertyMap) -> Result<Option<Vec<f32>>> {
        let key = &self.manager.config.vector.property;
        match props.remove(key) {
            None | Some(PropValue::Null) => Ok(None),
            Some(value) => self.embedding_from(&value).map(Some),
        }
    }

    /// Rewrites assignments to the embedding property into embedding ops.
    fn route_embedding(&self, patch: &PropPatch) -> Result<PropPatch> {
        let key = self.manager.config.vector.property.as_str();
        let mut ops = Vec::with_capacity(patch.ops.len());
        for op in &patch.ops {
            match op {
                PropPatchOp::Set(k, PropValue::Null) | PropPatchOp::Delete(k) if k == key => {
                    ops.push(PropPatchOp::ClearEmbedding)
                }
                PropPatchOp::Set(k, value) if k == key => {
                    ops.push(PropPatchOp::SetEmbedding(self.embedding_from(value)?))
                }
                PropPatchOp::Replace(map) => {
                    let mut map = map.clone();
                    let embedding = self.take_embedding(&mut map)?;
                    ops.push(PropPatchOp::Replace(map));
                    ops.push(match embedding {
                        Some(vector) => PropPatchOp::SetEmbedding(vector),
                        None => PropPatchOp::ClearEmbedding,
                    });
                }
                PropPatchOp::SetEmbedding(vector) => {
                    self.manager.indexes.check_embedding(vector)?;
                    ops.push(op.clone());
                }
                other => ops.push(other.clone()),
            }
        }
        Ok(PropPatch::new(ops))
    }

    /// Maps index hits to records visible at this snapshot. Hits the store
    /// cannot resolve in committed state are reported as drift.
    fn resolve_hits(
        &self,
        inner: &TxInner,
        hits: Vec<(NodeId, f32)>,
        k: usize,
    ) -> Vec<(Arc<NodeRecord>, f32)> {
        let mut out = Vec::with_capacity(k.min(hits.len()));
        let mut drifted = Vec::new();
        {
            let store = self.manager.store.read();
            for (id, score) in hits {
                if out.len() >= k {
                    break;
                }
                if let Some(pending) = inner.overlay.nodes.get(&id) {
                    if let Some(node) = pending.value() {
                        out.push((Arc::clone(node), score));
                    }
                    continue;
                }
                if let Some(node) = store.node(id, self.snapshot) {
                    out.push((node, score));
                    continue;
                }
                let drift = match store.node_commit(id) {
                    None => true,
                    Some(commit) => store.latest_node(id).is_none() && commit <= self.snapshot,
                };
                if drift {
                    drifted.push(id);
                }
            }
        }
        for id in drifted {
            self.manager.indexes.report_drift(id);
        }
        out
    }
}

impl Drop for TxShared {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if matches!(inner.status, TxStatus::Begin | TxStatus::Active) {
            inner.status = TxStatus::RolledBack;
            let locks = std::mem::take(&mut inner.locks);
            self.manager.release(self.id, &locks);
            self.manager.unregister(self.id, false);
            debug!(tx_id = self.id.0, "txn.drop_rollback");
        }
    }
}

/// Lazy node scan; see [`Transaction::scan_nodes`].
pub struct NodeScan {
    tx: Transaction,
    ids: std::vec::IntoIter<NodeId>,
    label: Option<String>,
    filter: PropertyFilter,
}

impl Iterator for NodeScan {
    type Item = Result<Arc<NodeRecord>>;

    fn next(&mut self) -> Option<Self::Item> {
        for id in self.ids.by_ref() {
            let node = match self.tx.node(id) {
                Ok(Some(node)) => node,
                Ok(None) => continue,
                Err(err) => return Some(Err(err)),
            };
            if let Some(label) = &self.label {
                if !node.has_label(label) {
                    continue;
                }
            }
            if self.filter.matches(&node.props) {
                return Some(Ok(node));
            }
        }
        None
    }
}

/// Lazy edge scan; see [`Transaction::scan_edges`].
pub struct EdgeScan {
    tx: Transaction,
    ids: std::vec::IntoIter<EdgeId>,
    ty: Option<String>,
    filter: PropertyFilter,
}

impl Iterator for EdgeScan {
    type Item = Result<Arc<EdgeRecord>>;

    fn next(&mut self) -> Option<Self::Item> {
        for id in self.ids.by_ref() {
            let edge = match self.tx.edge(id) {
                Ok(Some(edge)) => edge,
                Ok(None) => continue,
                Err(err) => return Some(Err(err)),
            };
            if self.ty.as_ref().is_some_and(|ty| *ty != edge.ty) {
                continue;
            }
            if self.filter.matches(&edge.props) {
                return Some(Ok(edge));
            }
        }
        None
    }
}

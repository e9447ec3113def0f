//! Commit pipeline, lock table and visibility watermark.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, error, info, warn};

use super::backend::StorageBackend;
use super::checkpoint::{self, CheckpointImage};
use super::config::{Config, UniqueConstraint};
use crate::index::IndexSubsystem;
use crate::primitives::wal::{Wal, WalFlusher, WalOp, WalRecord, WalSyncMode};
use crate::storage::{GraphStore, Mutation, NodeRecord, VacuumStats};
use crate::types::{CommitId, EdgeId, EngineError, EntityKey, Lsn, NodeId, Result, TxId};

/// Transaction counters since open.
#[derive(Clone, Debug, Default, serde::Serialize)]
pub struct TxCounters {
    /// Transactions started.
    pub begun: u64,
    /// Transactions that committed at least one mutation.
    pub committed: u64,
    /// Transactions rolled back, explicitly or after a failure.
    pub rolled_back: u64,
    /// Write-write conflicts detected.
    pub conflicts: u64,
}

#[derive(Default)]
struct AtomicCounters {
    begun: AtomicU64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
    conflicts: AtomicU64,
}

struct CommitState {
    next_lsn: u64,
    since_checkpoint: u64,
}

/// Allocation state restored by recovery.
pub(crate) struct ManagerSeed {
    pub store: GraphStore,
    pub wal: Arc<Wal>,
    pub next_lsn: u64,
    pub next_node_id: u64,
    pub next_edge_id: u64,
}

/// Shared engine state behind every [`Transaction`](super::Transaction).
pub(crate) struct TxManager {
    pub(crate) config: Arc<Config>,
    pub(crate) store: RwLock<GraphStore>,
    pub(crate) indexes: IndexSubsystem,
    wal: Arc<Wal>,
    flusher: WalFlusher,
    backend: Arc<dyn StorageBackend>,
    commit: Mutex<CommitState>,
    visible: AtomicU64,
    next_tx: AtomicU64,
    next_node: AtomicU64,
    next_edge: AtomicU64,
    locks: Mutex<FxHashMap<EntityKey, TxId>>,
    active: Mutex<BTreeMap<TxId, CommitId>>,
    counters: AtomicCounters,
    closed: AtomicBool,
    halted: AtomicBool,
}

impl TxManager {
    pub(crate) fn new(
        config: Arc<Config>,
        backend: Arc<dyn StorageBackend>,
        indexes: IndexSubsystem,
        seed: ManagerSeed,
    ) -> Self {
        let visible = seed.store.last_commit();
        let flusher = WalFlusher::start(Arc::clone(&seed.wal), config.wal_sync_mode());
        Self {
            store: RwLock::new(seed.store),
            indexes,
            flusher,
            backend,
            commit: Mutex::new(CommitState {
                next_lsn: seed.next_lsn,
                since_checkpoint: 0,
            }),
            wal: seed.wal,
            visible: AtomicU64::new(visible),
            next_tx: AtomicU64::new(1),
            next_node: AtomicU64::new(seed.next_node_id),
            next_edge: AtomicU64::new(seed.next_edge_id),
            locks: Mutex::new(FxHashMap::default()),
            active: Mutex::new(BTreeMap::new()),
            counters: AtomicCounters::default(),
            config,
            closed: AtomicBool::new(false),
            halted: AtomicBool::new(false),
        }
    }

    /// True once a failed WAL flush stopped the commit pipeline.
    pub(crate) fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_halted() {
            return Err(EngineError::Halted);
        }
        Ok(())
    }

    /// Stops accepting commits and checkpoints after `err` and rewinds the log
    /// to its last durable entry. Store versions above the visibility
    /// watermark stay unreachable because the watermark no longer moves.
    fn halt(&self, tx: TxId, err: &EngineError) {
        if self.halted.swap(true, Ordering::AcqRel) {
            return;
        }
        error!(tx_id = tx.0, %err, "txn.commit.sync_failed");
        let _guard = self.commit.lock();
        match self.wal.discard_unsynced() {
            Ok(lsn) => warn!(durable_lsn = lsn.0, "txn.halt.wal_rewound"),
            Err(err) => error!(%err, "txn.halt.wal_rewind_failed"),
        }
    }

    /// Newest commit visible to new transactions.
    pub(crate) fn visible(&self) -> CommitId {
        self.visible.load(Ordering::Acquire)
    }

    /// Registers a transaction and hands out its id and snapshot.
    pub(crate) fn register(&self) -> Result<(TxId, CommitId)> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::Invalid("database is closed"));
        }
        let id = TxId(self.next_tx.fetch_add(1, Ordering::Relaxed));
        let mut active = self.active.lock();
        let snapshot = self.visible();
        active.insert(id, snapshot);
        self.counters.begun.fetch_add(1, Ordering::Relaxed);
        Ok((id, snapshot))
    }

    /// Forgets a finished transaction.
    pub(crate) fn unregister(&self, tx: TxId, committed: bool) {
        self.active.lock().remove(&tx);
        if !committed {
            self.counters.rolled_back.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn allocate_node_id(&self) -> NodeId {
        NodeId(self.next_node.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn allocate_edge_id(&self) -> EdgeId {
        EdgeId(self.next_edge.fetch_add(1, Ordering::Relaxed))
    }

    /// Takes the write lock on `key` for `tx`. Fails when another transaction
    /// holds it or when a commit newer than `snapshot` already wrote it.
    pub(crate) fn acquire(&self, tx: TxId, snapshot: CommitId, key: EntityKey) -> Result<()> {
        let mut locks = self.locks.lock();
        match locks.get(&key) {
            Some(owner) if *owner != tx => return Err(self.conflict(tx, key)),
            Some(_) => return Ok(()),
            None => {}
        }
        let newest = {
            let store = self.store.read();
            match key {
                EntityKey::Node(id) => store.node_commit(id),
                EntityKey::Edge(id) => store.edge_commit(id),
            }
        };
        if newest.is_some_and(|commit| commit > snapshot) {
            return Err(self.conflict(tx, key));
        }
        locks.insert(key, tx);
        Ok(())
    }

    /// Records a lock on an entity the transaction just created.
    pub(crate) fn lock_new(&self, tx: TxId, key: EntityKey) {
        self.locks.lock().insert(key, tx);
    }

    pub(crate) fn release(&self, tx: TxId, keys: &FxHashSet<EntityKey>) {
        if keys.is_empty() {
            return;
        }
        let mut locks = self.locks.lock();
        for key in keys {
            if locks.get(key) == Some(&tx) {
                locks.remove(key);
            }
        }
    }

    fn conflict(&self, tx: TxId, entity: EntityKey) -> EngineError {
        self.counters.conflicts.fetch_add(1, Ordering::Relaxed);
        debug!(tx_id = tx.0, %entity, "txn.conflict");
        EngineError::TransactionConflict { tx, entity }
    }

    /// Validates, logs and applies a transaction's mutations. Returns the
    /// commit id, or the snapshot for read-only transactions.
    pub(crate) fn commit(
        &self,
        tx: TxId,
        snapshot: CommitId,
        mutations: Vec<Mutation>,
    ) -> Result<CommitId> {
        if mutations.is_empty() {
            return Ok(snapshot);
        }
        let immediate = matches!(self.flusher.mode(), WalSyncMode::Immediate);
        let (commit_id, checkpoint_due) = {
            let mut state = self.commit.lock();
            self.ensure_running()?;
            {
                let store = self.store.read();
                self.validate(&store, tx, snapshot, &mutations)?;
            }
            let mut records = Vec::with_capacity(mutations.len() + 1);
            let mut lsn = state.next_lsn;
            for mutation in &mutations {
                records.push(WalRecord {
                    lsn: Lsn(lsn),
                    tx,
                    op: mutation.op(),
                    payload: mutation.encode_payload()?,
                });
                lsn += 1;
            }
            records.push(WalRecord {
                lsn: Lsn(lsn),
                tx,
                op: WalOp::Commit,
                payload: Vec::new(),
            });
            if let Err(err) = self.wal.append_batch(&records) {
                state.next_lsn = self.wal.last_lsn().0 + 1;
                warn!(tx_id = tx.0, %err, "txn.commit.wal_failed");
                return Err(err);
            }
            state.next_lsn = lsn + 1;
            let commit_id = lsn;

            self.store.write().apply(commit_id, &mutations);
            self.indexes.apply_batch(&mutations);

            if !immediate {
                self.visible.fetch_max(commit_id, Ordering::AcqRel);
            }
            state.since_checkpoint += 1;
            let due = self.config.checkpoint_every > 0
                && state.since_checkpoint >= self.config.checkpoint_every;
            (commit_id, due)
        };
        if immediate {
            if let Err(err) = self.flusher.wait_durable(Lsn(commit_id)) {
                self.halt(tx, &err);
                return Err(err);
            }
            self.visible.fetch_max(commit_id, Ordering::AcqRel);
        }
        self.counters.committed.fetch_add(1, Ordering::Relaxed);
        debug!(tx_id = tx.0, commit = commit_id, ops = mutations.len(), "txn.commit");
        if checkpoint_due {
            if let Err(err) = self.checkpoint() {
                warn!(%err, "txn.checkpoint.auto_failed");
            }
        }
        Ok(commit_id)
    }

    fn validate(
        &self,
        store: &GraphStore,
        tx: TxId,
        snapshot: CommitId,
        mutations: &[Mutation],
    ) -> Result<()> {
        let mut created_nodes = FxHashSet::default();
        let mut deleted_nodes = FxHashSet::default();
        let mut deleted_edges = FxHashSet::default();
        for mutation in mutations {
            match mutation {
                Mutation::CreateNode(node) => {
                    created_nodes.insert(node.id);
                }
                Mutation::DeleteNode(id) => {
                    deleted_nodes.insert(*id);
                }
                Mutation::DeleteEdge(id) => {
                    deleted_edges.insert(*id);
                }
                _ => {}
            }
        }
        let node_alive = |id: NodeId| {
            !deleted_nodes.contains(&id)
                && (created_nodes.contains(&id) || store.latest_node(id).is_some())
        };

        for mutation in mutations {
            match mutation {
                Mutation::CreateEdge(edge) | Mutation::UpdateEdge(edge) => {
                    for endpoint in [edge.src, edge.dst] {
                        if !node_alive(endpoint) {
                            return Err(EngineError::DanglingReference {
                                edge: edge.id,
                                node: endpoint,
                            });
                        }
                    }
                }
                Mutation::DeleteNode(id) => {
                    for edge in store.latest_adjacent(*id) {
                        if deleted_edges.contains(&edge) {
                            continue;
                        }
                        let fresh = store.edge_commit(edge).is_some_and(|c| c > snapshot);
                        if fresh {
                            return Err(self.conflict(tx, EntityKey::Edge(edge)));
                        }
                        return Err(EngineError::ConstraintViolation(format!(
                            "node {id} still has relationship {edge}"
                        )));
                    }
                }
                _ => {}
            }
        }
        self.check_unique(store, mutations, &deleted_nodes)
    }

    fn check_unique(
        &self,
        store: &GraphStore,
        mutations: &[Mutation],
        deleted: &FxHashSet<NodeId>,
    ) -> Result<()> {
        if self.config.unique_constraints.is_empty() {
            return Ok(());
        }
        let written: FxHashMap<NodeId, &Arc<NodeRecord>> = mutations
            .iter()
            .filter_map(|m| match m {
                Mutation::CreateNode(node) | Mutation::UpdateNode(node) => Some((node.id, node)),
                _ => None,
            })
            .collect();
        for UniqueConstraint { label, property } in &self.config.unique_constraints {
            let mut seen = FxHashMap::default();
            for node in written.values() {
                if !node.has_label(label) {
                    continue;
                }
                let Some(value) = node.props.get(property) else {
                    continue;
                };
                let key = serde_json::to_string(value)?;
                if let Some(other) = seen.insert(key, node.id) {
                    return Err(unique_violation(label, property, other));
                }
                let clash = store
                    .latest_nodes_with_property(label, property, value)
                    .into_iter()
                    .find(|id| *id != node.id && !deleted.contains(id) && !written.contains_key(id));
                if let Some(other) = clash {
                    return Err(unique_violation(label, property, other));
                }
            }
        }
        Ok(())
    }

    /// Writes a checkpoint image of the committed state and truncates the WAL.
    pub(crate) fn checkpoint(&self) -> Result<Lsn> {
        let mut state = self.commit.lock();
        self.ensure_running()?;
        let last_lsn = Lsn(state.next_lsn.saturating_sub(1));
        let image = {
            let store = self.store.read();
            CheckpointImage {
                last_lsn,
                next_node_id: self.next_node.load(Ordering::Relaxed),
                next_edge_id: self.next_edge.load(Ordering::Relaxed),
                nodes: store.latest_nodes(),
                edges: store.latest_edges(),
            }
        };
        let bytes = checkpoint::encode(&image)?;
        self.backend.write_checkpoint(&bytes)?;
        self.wal.reset(Lsn(state.next_lsn))?;
        state.since_checkpoint = 0;
        info!(
            lsn = last_lsn.0,
            nodes = image.nodes.len(),
            edges = image.edges.len(),
            bytes = bytes.len(),
            "txn.checkpoint"
        );
        Ok(last_lsn)
    }

    /// Oldest snapshot any open transaction may still read.
    pub(crate) fn horizon(&self) -> CommitId {
        let active = self.active.lock();
        active
            .values()
            .copied()
            .min()
            .unwrap_or_else(|| self.visible())
    }

    /// Prunes versions invisible to every open snapshot.
    pub(crate) fn vacuum(&self) -> VacuumStats {
        let horizon = self.horizon();
        let stats = self.store.write().vacuum(horizon);
        debug!(
            horizon,
            removed = stats.versions_removed,
            nodes = stats.nodes_purged,
            edges = stats.edges_purged,
            "txn.vacuum"
        );
        stats
    }

    pub(crate) fn counters(&self) -> TxCounters {
        TxCounters {
            begun: self.counters.begun.load(Ordering::Relaxed),
            committed: self.counters.committed.load(Ordering::Relaxed),
            rolled_back: self.counters.rolled_back.load(Ordering::Relaxed),
            conflicts: self.counters.conflicts.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    pub(crate) fn wal(&self) -> &Wal {
        &self.wal
    }

    pub(crate) fn durable_lsn(&self) -> Lsn {
        match self.flusher.mode() {
            WalSyncMode::Off => Lsn(0),
            _ => self.flusher.durable_lsn(),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Flushes pending WAL bytes, stops the flusher and refuses new transactions.
    pub(crate) fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.wal.sync();
        self.flusher.shutdown();
        info!(backend = %self.backend.describe(), "db.close");
        result
    }
}

impl Drop for TxManager {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            if let Err(err) = self.close() {
                warn!(%err, "db.close.failed");
            }
        }
    }
}

fn unique_violation(label: &str, property: &str, existing: NodeId) -> EngineError {
    EngineError::ConstraintViolation(format!(
        "node {existing} already has label `{label}` and the same `{property}` value"
    ))
}

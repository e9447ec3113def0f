//! Startup recovery: checkpoint image plus committed WAL transactions.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::{info, warn};

use super::backend::StorageBackend;
use super::checkpoint;
use super::manager::ManagerSeed;
use crate::primitives::wal::{Wal, WalOp, WalOptions, WalTail};
use crate::storage::{GraphStore, Mutation};
use crate::types::{EngineError, Lsn, Result, TxId};

/// What recovery found on startup.
#[derive(Clone, Debug, Default, Serialize)]
pub struct RecoveryReport {
    /// LSN covered by the loaded checkpoint, if one existed.
    pub checkpoint_lsn: Option<u64>,
    /// Transactions replayed from the WAL.
    pub replayed_transactions: u64,
    /// Transactions without a commit marker that were dropped.
    pub discarded_transactions: u64,
    /// Whether a torn tail was truncated.
    pub torn_tail: bool,
    /// Bytes cut from the WAL tail.
    pub discarded_bytes: u64,
}

pub(crate) fn recover(backend: &dyn StorageBackend) -> Result<(ManagerSeed, RecoveryReport)> {
    let mut report = RecoveryReport::default();
    let mut store = GraphStore::new();
    let mut next_node_id = 1;
    let mut next_edge_id = 1;
    let mut base = 0;

    if let Some(bytes) = backend.read_checkpoint()? {
        let image = checkpoint::decode(&bytes)?;
        base = image.last_lsn.0;
        next_node_id = image.next_node_id;
        next_edge_id = image.next_edge_id;
        let mut load = Vec::with_capacity(image.nodes.len() + image.edges.len());
        load.extend(image.nodes.into_iter().map(Mutation::CreateNode));
        load.extend(image.edges.into_iter().map(Mutation::CreateEdge));
        store.apply(base, &load);
        report.checkpoint_lsn = Some(base);
    }

    let options = WalOptions {
        salt: rand::random(),
        start_lsn: Lsn(base + 1),
    };
    let (wal, scan) = Wal::recover(backend.wal_io()?, options)?;
    if report.checkpoint_lsn.is_none() && scan.start_lsn.0 > 1 {
        return Err(EngineError::Corruption(
            "wal starts past lsn 1 but no checkpoint exists",
        ));
    }
    if scan.start_lsn.0 > base + 1 {
        return Err(EngineError::Corruption("wal starts after the checkpoint"));
    }
    report.torn_tail = scan.tail == WalTail::Torn;
    report.discarded_bytes = scan.discarded_bytes;

    let mut pending: FxHashMap<TxId, Vec<Mutation>> = FxHashMap::default();
    for record in &scan.records {
        if record.lsn.0 <= base {
            continue;
        }
        match record.op {
            WalOp::Commit => {
                let batch = pending.remove(&record.tx).unwrap_or_default();
                store.apply(record.lsn.0, &batch);
                report.replayed_transactions += 1;
            }
            op => {
                let mutation = Mutation::decode(op, &record.payload)?;
                pending.entry(record.tx).or_default().push(mutation);
            }
        }
    }
    report.discarded_transactions = pending.len() as u64;
    if !pending.is_empty() {
        warn!(count = pending.len(), "recovery.uncommitted_dropped");
    }

    next_node_id = next_node_id.max(store.max_node_id() + 1);
    next_edge_id = next_edge_id.max(store.max_edge_id() + 1);
    let next_lsn = (wal.last_lsn().0 + 1).max(base + 1);
    info!(
        backend = %backend.describe(),
        checkpoint = base,
        replayed = report.replayed_transactions,
        discarded = report.discarded_transactions,
        torn = report.torn_tail,
        "recovery.complete"
    );
    Ok((
        ManagerSeed {
            store,
            wal: Arc::new(wal),
            next_lsn,
            next_node_id,
            next_edge_id,
        },
        report,
    ))
}

//! Embedded database: recovery, transactions, checkpoints and queries.

mod backend;
mod checkpoint;
pub mod config;
mod health;
mod manager;
mod metrics;
mod recovery;
mod scheduler;
mod transaction;
mod verify;

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info};

pub use backend::{DiskBackend, MemoryBackend, StorageBackend};
pub use checkpoint::{decode as decode_checkpoint, CheckpointImage};
pub use config::{Config, ConfigError, SyncMode, UniqueConstraint};
pub use health::{Check, HealthCheck, HealthStatus};
pub use manager::TxCounters;
pub use metrics::DbStats;
pub use recovery::RecoveryReport;
pub use scheduler::{CheckpointTask, ScheduledTask, Scheduler, VacuumTask};
pub use transaction::{CancelToken, EdgeScan, NodeScan, Transaction, TxOptions, TxStatus};
pub use verify::{VerifyCounts, VerifyFinding, VerifyReport, VerifySeverity};

use crate::index::IndexSubsystem;
use crate::query::{Params, QueryCursor, QueryEngine, QueryError, QueryResult};
use crate::storage::VacuumStats;
use crate::types::{CommitId, EngineError, Lsn, Result};
use manager::TxManager;

struct DbInner {
    manager: Arc<TxManager>,
    queries: QueryEngine,
    recovery: RecoveryReport,
}

/// Handle to an open database. Cheap to clone; clones share the engine.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DbInner>,
}

impl Database {
    /// Opens (or creates) the database under `config.data_dir`.
    pub fn open(config: Config) -> Result<Self> {
        config
            .validate()
            .map_err(|err| EngineError::InvalidOwned(err.to_string()))?;
        let backend = DiskBackend::open(&config.data_dir)?;
        Self::open_with_backend(config, Arc::new(backend))
    }

    /// Opens an ephemeral in-memory database.
    pub fn open_in_memory(config: Config) -> Result<Self> {
        Self::open_with_backend(config, Arc::new(MemoryBackend::new()))
    }

    /// Recovers from `backend`, rebuilds the indexes and writes a fresh
    /// checkpoint that truncates the replayed log.
    pub fn open_with_backend(config: Config, backend: Arc<dyn StorageBackend>) -> Result<Self> {
        config
            .validate()
            .map_err(|err| EngineError::InvalidOwned(err.to_string()))?;
        let (seed, recovery) = recovery::recover(backend.as_ref())?;
        let indexes = IndexSubsystem::new(&config);
        indexes.rebuild(&seed.store.latest_nodes());
        let config = Arc::new(config);
        let queries = QueryEngine::new(&config.query);
        let manager = Arc::new(TxManager::new(Arc::clone(&config), backend, indexes, seed));
        manager.checkpoint()?;
        info!(
            visible = manager.visible(),
            sync_mode = ?config.sync_mode,
            "db.open"
        );
        Ok(Self {
            inner: Arc::new(DbInner {
                manager,
                queries,
                recovery,
            }),
        })
    }

    /// Engine configuration.
    pub fn config(&self) -> &Config {
        &self.inner.manager.config
    }

    /// What recovery found when this database was opened.
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.inner.recovery
    }

    /// Starts a transaction with default options.
    pub fn begin(&self) -> Result<Transaction> {
        self.begin_with(TxOptions::default())
    }

    /// Starts a transaction.
    pub fn begin_with(&self, options: TxOptions) -> Result<Transaction> {
        Transaction::begin(&self.inner.manager, options)
    }

    /// Runs `work` in a read transaction that is rolled back afterwards.
    pub fn read<T>(&self, work: impl FnOnce(&Transaction) -> Result<T>) -> Result<T> {
        let tx = self.begin()?;
        let out = work(&tx);
        tx.rollback()?;
        out
    }

    /// Runs `work` in a transaction and commits it, retrying the whole unit
    /// after write conflicts up to `conflict_retries` times.
    pub fn write<T>(&self, mut work: impl FnMut(&Transaction) -> Result<T>) -> Result<T> {
        let mut attempt = 0;
        loop {
            let tx = self.begin()?;
            let outcome = work(&tx).and_then(|value| tx.commit().map(|_| value));
            match outcome {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let _ = tx.rollback();
                    if !self.should_retry(err.is_retryable(), &mut attempt) {
                        return Err(err);
                    }
                }
            }
        }
    }

    /// Runs one statement in its own transaction and commits it, retrying
    /// after write conflicts.
    pub fn execute(&self, query: &str, params: Params) -> std::result::Result<QueryResult, QueryError> {
        let mut attempt = 0;
        loop {
            let tx = self.begin()?;
            let outcome = self
                .inner
                .queries
                .execute(&tx, query, &params)
                .and_then(|result| {
                    tx.commit()?;
                    Ok(result)
                });
            match outcome {
                Ok(result) => return Ok(result),
                Err(err) => {
                    let _ = tx.rollback();
                    if !self.should_retry(err.is_retryable(), &mut attempt) {
                        return Err(err);
                    }
                }
            }
        }
    }

    /// Runs one statement inside `tx` and materialises its rows.
    pub fn execute_in(
        &self,
        tx: &Transaction,
        query: &str,
        params: &Params,
    ) -> std::result::Result<QueryResult, QueryError> {
        self.inner.queries.execute(tx, query, params)
    }

    /// Runs one statement inside `tx`, returning a cursor that produces rows
    /// as they are pulled.
    pub fn stream_in(
        &self,
        tx: &Transaction,
        query: &str,
        params: &Params,
    ) -> std::result::Result<QueryCursor, QueryError> {
        self.inner.queries.open_cursor(tx, query, params)
    }

    /// Query engine shared by this database.
    pub fn queries(&self) -> &QueryEngine {
        &self.inner.queries
    }

    fn should_retry(&self, retryable: bool, attempt: &mut u32) -> bool {
        if !retryable || *attempt >= self.config().conflict_retries {
            return false;
        }
        *attempt += 1;
        debug!(attempt = *attempt, "db.retry_conflict");
        thread::sleep(Duration::from_millis(u64::from(*attempt) * 2));
        true
    }

    /// Writes a checkpoint and truncates the WAL. Returns the covered LSN.
    pub fn checkpoint(&self) -> Result<Lsn> {
        self.inner.manager.checkpoint()
    }

    /// Prunes versions invisible to every open transaction.
    pub fn vacuum(&self) -> VacuumStats {
        self.inner.manager.vacuum()
    }

    /// Newest commit visible to new transactions.
    pub fn visible_commit(&self) -> CommitId {
        self.inner.manager.visible()
    }

    /// Whether [`Database::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.inner.manager.is_closed()
    }

    /// Counters and sizes across the engine.
    pub fn stats(&self) -> DbStats {
        let manager = &self.inner.manager;
        let graph = manager.store.read().stats();
        let wal = manager.wal().stats();
        DbStats {
            graph,
            index: manager.indexes.stats(),
            transactions: manager.counters(),
            active_transactions: manager.active_count(),
            visible_commit: manager.visible(),
            durable_lsn: manager.durable_lsn().0,
            wal_bytes: manager.wal().len().unwrap_or(0),
            wal_entries_appended: wal.entries_appended,
            wal_syncs: wal.syncs,
            halted: manager.is_halted(),
            recovery: self.inner.recovery.clone(),
        }
    }

    /// Health summary for `/health`.
    pub fn health(&self) -> HealthCheck {
        HealthCheck::from_stats(&self.stats(), !self.is_closed())
    }

    /// Flushes the WAL and refuses new transactions. Open transactions can
    /// still roll back.
    pub fn close(&self) -> Result<()> {
        self.inner.manager.close()
    }
}

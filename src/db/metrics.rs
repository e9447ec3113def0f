use serde::Serialize;

use super::manager::TxCounters;
use super::recovery::RecoveryReport;
use crate::index::IndexStats;
use crate::storage::GraphStats;

/// Point-in-time view of the engine, served by `stats` and `/health`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DbStats {
    /// Live graph counts.
    pub graph: GraphStats,
    /// Vector and full-text index sizes.
    pub index: IndexStats,
    /// Lifetime transaction outcomes.
    pub transactions: TxCounters,
    /// Transactions currently open.
    pub active_transactions: usize,
    /// Newest commit visible to new snapshots.
    pub visible_commit: u64,
    /// Highest LSN known to be on stable storage.
    pub durable_lsn: u64,
    /// Bytes in the live WAL segment.
    pub wal_bytes: u64,
    /// WAL entries appended since open.
    pub wal_entries_appended: u64,
    /// fsync calls issued by the WAL.
    pub wal_syncs: u64,
    /// True after a failed WAL flush stopped the commit pipeline.
    pub halted: bool,
    /// Outcome of the recovery that ran at open.
    pub recovery: RecoveryReport,
}

impl DbStats {
    /// Prints a human-readable summary to stdout.
    pub fn print_report(&self) {
        println!("\n=== engramdb stats ===");
        println!("Nodes:                {}", self.graph.nodes);
        println!("Edges:                {}", self.graph.edges);
        for (label, count) in &self.graph.labels {
            println!("  :{label:<19} {count}");
        }
        println!("Stored versions:      {}", self.graph.versions);
        println!("Vectors:              {}", self.index.vectors);
        println!("Text documents:       {}", self.index.documents);
        println!("Index drift events:   {}", self.index.drift_events);
        println!("Committed txns:       {}", self.transactions.committed);
        println!("Conflicts:            {}", self.transactions.conflicts);
        println!("Visible commit:       {}", self.visible_commit);
        println!("WAL bytes:            {}", self.wal_bytes);
        println!(
            "Recovery:             {} replayed, {} discarded",
            self.recovery.replayed_transactions, self.recovery.discarded_transactions
        );
    }
}

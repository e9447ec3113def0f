//! Low-level primitives for building the storage engine.

/// File handles with positional reads and writes.
pub mod io;

/// Write-ahead logging (WAL) for crash recovery.
///
/// Ensures durability through sequential logging of committed transactions.
pub mod wal;

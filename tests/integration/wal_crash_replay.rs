//! Crash recovery through the write-ahead log.
//!
//! Each test commits through a [`MemoryBackend`], takes its crash image
//! (synced WAL bytes plus the last checkpoint) while the database is still
//! open, and reopens from that image.

#![allow(missing_docs)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use engramdb::db::{Config, Database, HealthStatus, MemoryBackend, SyncMode};
use engramdb::query::{Params, Value};
use engramdb::types::EngineError;

fn config(mode: SyncMode) -> Config {
    let mut config = Config::default();
    config.sync_mode = mode;
    config
}

fn open(backend: &MemoryBackend, mode: SyncMode) -> Database {
    Database::open_with_backend(config(mode), Arc::new(backend.clone())).expect("open")
}

fn memory_count(db: &Database) -> i64 {
    let result = db
        .execute("MATCH (m:Memory) RETURN count(m) AS n", Params::new())
        .expect("count");
    match result.rows.first().and_then(|row| row.first()) {
        Some(Value::Int(n)) => *n,
        other => panic!("unexpected count {other:?}"),
    }
}

fn remember(db: &Database, text: &str) {
    let mut params = Params::new();
    params.insert("text".into(), Value::from(text));
    db.execute("CREATE (:Memory {text: $text})", params)
        .expect("create");
}

#[test]
fn immediate_sync_keeps_every_commit() {
    let backend = MemoryBackend::new();
    let db = open(&backend, SyncMode::Immediate);
    for i in 0..5 {
        remember(&db, &format!("fact {i}"));
    }
    let image = backend.crash_image();
    drop(db);

    let recovered = open(&image, SyncMode::Immediate);
    assert_eq!(memory_count(&recovered), 5);
    let report = recovered.recovery_report();
    assert_eq!(report.replayed_transactions, 5);
    assert_eq!(report.discarded_transactions, 0);
    assert!(!report.torn_tail);
}

#[test]
fn unsynced_commits_are_lost_without_sync() {
    let backend = MemoryBackend::new();
    let db = open(&backend, SyncMode::None);
    remember(&db, "volatile");
    assert_eq!(memory_count(&db), 1);
    let image = backend.crash_image();
    drop(db);

    let recovered = open(&image, SyncMode::None);
    assert_eq!(memory_count(&recovered), 0);
}

fn wait_until_flushed(db: &Database) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let stats = db.stats();
        if stats.durable_lsn >= stats.visible_commit {
            return;
        }
        assert!(Instant::now() < deadline, "batch flusher never caught up");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn batch_sync_keeps_commits_flushed_by_the_interval() {
    let backend = MemoryBackend::new();
    let mut batch = config(SyncMode::Batch);
    batch.batch_interval_ms = 20;
    let db = Database::open_with_backend(batch.clone(), Arc::new(backend.clone())).expect("open");
    remember(&db, "first");
    remember(&db, "second");
    wait_until_flushed(&db);
    let flushed = backend.crash_image();

    remember(&db, "maybe flushed");
    let late = backend.crash_image();
    drop(db);

    let recovered = Database::open_with_backend(batch.clone(), Arc::new(flushed)).expect("reopen");
    assert_eq!(memory_count(&recovered), 2);

    let recovered = Database::open_with_backend(batch, Arc::new(late)).expect("reopen late");
    let count = memory_count(&recovered);
    assert!((2..=3).contains(&count), "unexpected count {count}");
}

#[test]
fn failed_flush_halts_and_never_persists_the_commit() {
    let backend = MemoryBackend::new();
    let db = open(&backend, SyncMode::Immediate);
    remember(&db, "kept");

    backend.wal_file().fail_next_syncs(1);
    assert!(db
        .execute("CREATE (:Memory {text: 'ghost'})", Params::new())
        .is_err());
    assert_eq!(memory_count(&db), 1);
    assert!(db.stats().halted);
    assert_eq!(db.health().status, HealthStatus::Unhealthy);

    assert!(matches!(db.checkpoint(), Err(EngineError::Halted)));
    let refused = db
        .execute("CREATE (:Memory {text: 'after'})", Params::new())
        .expect_err("writes are refused after a failed flush");
    assert_eq!(
        refused.code(),
        "Neo.DatabaseError.Transaction.TransactionCommitFailed"
    );
    let image = backend.crash_image();
    drop(db);

    for survivor in [backend, image] {
        let recovered = open(&survivor, SyncMode::Immediate);
        assert_eq!(memory_count(&recovered), 1);
    }
}

#[test]
fn checkpoint_then_crash_replays_only_the_suffix() {
    let backend = MemoryBackend::new();
    let db = open(&backend, SyncMode::Immediate);
    remember(&db, "before checkpoint");
    remember(&db, "also before");
    let lsn = db.checkpoint().expect("checkpoint");
    remember(&db, "after checkpoint");
    let image = backend.crash_image();
    drop(db);

    let recovered = open(&image, SyncMode::Immediate);
    assert_eq!(memory_count(&recovered), 3);
    let report = recovered.recovery_report();
    assert_eq!(report.checkpoint_lsn, Some(lsn.0));
    assert_eq!(report.replayed_transactions, 1);
}

#[test]
fn torn_commit_marker_discards_the_last_transaction() {
    let backend = MemoryBackend::new();
    let db = open(&backend, SyncMode::Immediate);
    remember(&db, "complete");
    remember(&db, "torn");
    let image = backend.crash_image();
    drop(db);

    let mut bytes = image.wal_file().snapshot_bytes();
    bytes.truncate(bytes.len() - 3);
    image.wal_file().replace_bytes(bytes);

    let recovered = open(&image, SyncMode::Immediate);
    let report = recovered.recovery_report().clone();
    assert!(report.torn_tail);
    assert!(report.discarded_bytes > 0);
    assert_eq!(report.replayed_transactions, 1);
    assert_eq!(report.discarded_transactions, 1);
    assert_eq!(memory_count(&recovered), 1);

    remember(&recovered, "after repair");
    assert_eq!(memory_count(&recovered), 2);
    let verify = recovered.verify().expect("verify");
    assert!(verify.success);
    assert!(!verify.findings.is_empty(), "torn tail is reported as a warning");
}

#[test]
fn recovered_ids_do_not_collide() {
    let backend = MemoryBackend::new();
    let first = {
        let db = open(&backend, SyncMode::Immediate);
        let id = db
            .write(|tx| tx.create_node(["Memory"], Default::default()))
            .expect("create");
        db.close().expect("close");
        id
    };
    let db = open(&backend, SyncMode::Immediate);
    let second = db
        .write(|tx| tx.create_node(["Memory"], Default::default()))
        .expect("create");
    assert!(second > first);
}

#[test]
fn flipped_bit_before_valid_entries_is_corruption() {
    let backend = MemoryBackend::new();
    let db = open(&backend, SyncMode::Immediate);
    remember(&db, "one");
    remember(&db, "two");
    let image = backend.crash_image();
    drop(db);

    let mut bytes = image.wal_file().snapshot_bytes();
    // First payload byte of the first entry; later entries stay valid.
    let first_payload_byte = 32 + 36;
    bytes[first_payload_byte] ^= 0xFF;
    image.wal_file().replace_bytes(bytes);

    let err = Database::open_with_backend(config(SyncMode::Immediate), Arc::new(image))
        .err()
        .expect("corrupt wal must not open");
    assert!(matches!(err, EngineError::Corruption(_)), "{err}");
}

//! MVCC isolation anomaly tests.
//!
//! Documents which anomalies snapshot isolation prevents and which it
//! allows.
//!
//! ## Prevented
//! - Dirty reads (P1)
//! - Non-repeatable reads (P2)
//! - Phantom reads (P3)
//! - Lost updates (second writer of an entity aborts)
//!
//! ## Allowed
//! - Write skew (A5B): transactions writing disjoint entities both commit.
//!
//! References:
//! - "A Critique of ANSI SQL Isolation Levels" (Berenson et al., 1995)
//! - "Generalized Isolation Level Definitions" (Adya et al., 2000)

#![allow(missing_docs)]

use engramdb::db::{Config, Database};
use engramdb::query::{Params, Value};
use engramdb::storage::{PropPatch, PropertyFilter, PropertyMap};
use engramdb::types::{EngineError, NodeId, PropValue, Result};

fn db() -> Database {
    Database::open_in_memory(Config::default()).expect("open")
}

fn int_node(db: &Database, label: &str, value: i64) -> Result<NodeId> {
    db.write(|tx| {
        let mut props = PropertyMap::new();
        props.insert("value".into(), PropValue::Int(value));
        tx.create_node([label], props)
    })
}

fn read_value(tx: &engramdb::db::Transaction, id: NodeId) -> Result<Option<i64>> {
    Ok(tx.node(id)?.and_then(|node| match node.props.get("value") {
        Some(PropValue::Int(i)) => Some(*i),
        _ => None,
    }))
}

// ============================================================================
// ANOMALIES PREVENTED BY SNAPSHOT ISOLATION
// ============================================================================

/// Dirty read (P1): an uncommitted node is invisible to other transactions.
#[test]
fn si_prevents_dirty_read() -> Result<()> {
    let db = db();
    let writer = db.begin()?;
    let mut props = PropertyMap::new();
    props.insert("value".into(), PropValue::Int(1));
    let id = writer.create_node(["Item"], props)?;

    let reader = db.begin()?;
    assert_eq!(read_value(&reader, id)?, None, "uncommitted node leaked");
    assert_eq!(read_value(&writer, id)?, Some(1), "writer sees its own write");

    writer.commit()?;
    assert_eq!(read_value(&reader, id)?, None, "reader snapshot predates commit");
    assert_eq!(read_value(&db.begin()?, id)?, Some(1));
    Ok(())
}

/// Non-repeatable read (P2): a value read twice in one transaction stays
/// the same even if another transaction commits a change in between.
#[test]
fn si_prevents_non_repeatable_read() -> Result<()> {
    let db = db();
    let id = int_node(&db, "Item", 10)?;

    let reader = db.begin()?;
    assert_eq!(read_value(&reader, id)?, Some(10));

    db.write(|tx| tx.update_node(id, &PropPatch::default().set("value", 20i64)).map(|_| ()))?;

    assert_eq!(read_value(&reader, id)?, Some(10));
    reader.rollback()?;
    assert_eq!(read_value(&db.begin()?, id)?, Some(20));
    Ok(())
}

/// Phantom read (P3): a label scan returns the same set throughout a
/// transaction, through the query engine as well as the scan API.
#[test]
fn si_prevents_phantom_read() -> Result<()> {
    let db = db();
    int_node(&db, "Item", 1)?;
    int_node(&db, "Item", 2)?;

    let reader = db.begin()?;
    let count = |tx: &engramdb::db::Transaction| -> Result<usize> {
        tx.scan_nodes(Some("Item"), PropertyFilter::any())?
            .collect::<Result<Vec<_>>>()
            .map(|nodes| nodes.len())
    };
    assert_eq!(count(&reader)?, 2);

    int_node(&db, "Item", 3)?;

    assert_eq!(count(&reader)?, 2);
    let result = db
        .execute_in(&reader, "MATCH (i:Item) RETURN count(i) AS n", &Params::new())
        .expect("query");
    assert_eq!(result.rows, vec![vec![Value::Int(2)]]);
    reader.rollback()?;
    assert_eq!(count(&db.begin()?)?, 3);
    Ok(())
}

/// Lost update: of two transactions incrementing the same counter, the
/// second writer aborts instead of overwriting the first.
#[test]
fn si_prevents_lost_update() -> Result<()> {
    let db = db();
    let id = int_node(&db, "Counter", 0)?;

    let a = db.begin()?;
    let b = db.begin()?;
    let a_seen = read_value(&a, id)?.unwrap_or_default();
    let b_seen = read_value(&b, id)?.unwrap_or_default();

    a.update_node(id, &PropPatch::default().set("value", a_seen + 1))?;
    let err = b
        .update_node(id, &PropPatch::default().set("value", b_seen + 1))
        .expect_err("second writer must abort");
    assert!(matches!(err, EngineError::TransactionConflict { .. }));

    a.commit()?;
    b.rollback()?;
    assert_eq!(read_value(&db.begin()?, id)?, Some(1));
    Ok(())
}

/// A writer that starts after a concurrent commit touched the same node
/// still conflicts if its snapshot predates that commit.
#[test]
fn stale_snapshot_writer_conflicts() -> Result<()> {
    let db = db();
    let id = int_node(&db, "Counter", 0)?;

    let stale = db.begin()?;
    db.write(|tx| tx.update_node(id, &PropPatch::default().set("value", 5i64)).map(|_| ()))?;

    let err = stale
        .update_node(id, &PropPatch::default().set("value", 1i64))
        .expect_err("write on a stale snapshot");
    assert!(err.is_retryable());
    Ok(())
}

/// Auto-commit statements retry after conflicts, so concurrent increments
/// through `Database::execute` are never lost.
#[test]
fn autocommit_increments_retry_after_conflict() {
    let mut config = Config::default();
    config.conflict_retries = 200;
    let db = Database::open_in_memory(config).expect("open");
    db.execute("CREATE (:Counter {value: 0})", Params::new())
        .expect("seed");
    let threads: Vec<_> = (0..4)
        .map(|_| {
            let db = db.clone();
            std::thread::spawn(move || {
                for _ in 0..5 {
                    db.execute("MATCH (c:Counter) SET c.value = c.value + 1", Params::new())
                        .expect("increment");
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().expect("thread");
    }
    let result = db
        .execute("MATCH (c:Counter) RETURN c.value AS v", Params::new())
        .expect("read");
    assert_eq!(result.rows, vec![vec![Value::Int(20)]]);
}

// ============================================================================
// ANOMALIES ALLOWED BY SNAPSHOT ISOLATION
// ============================================================================

/// Write skew (A5B): two transactions each read both on-call flags and
/// clear a different one. Both commit, leaving nobody on call.
#[test]
fn si_allows_write_skew() -> Result<()> {
    let db = db();
    let alice = int_node(&db, "Doctor", 1)?;
    let bob = int_node(&db, "Doctor", 1)?;

    let a = db.begin()?;
    let b = db.begin()?;
    let on_call = |tx: &engramdb::db::Transaction| -> Result<i64> {
        Ok(read_value(tx, alice)?.unwrap_or(0) + read_value(tx, bob)?.unwrap_or(0))
    };
    assert_eq!(on_call(&a)?, 2);
    assert_eq!(on_call(&b)?, 2);

    a.update_node(alice, &PropPatch::default().set("value", 0i64))?;
    b.update_node(bob, &PropPatch::default().set("value", 0i64))?;
    a.commit()?;
    b.commit()?;

    assert_eq!(on_call(&db.begin()?)?, 0);
    Ok(())
}

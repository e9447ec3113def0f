#![allow(missing_docs)]

use std::sync::{Arc, Barrier};
use std::thread;

use engramdb::db::{Config, Database};
use engramdb::query::{Params, Value};
use engramdb::storage::{PropPatch, PropertyFilter, PropertyMap};
use engramdb::types::{PropValue, Result};

const THREADS: usize = 8;

fn db_with_retries(retries: u32) -> Database {
    let mut config = Config::default();
    config.conflict_retries = retries;
    Database::open_in_memory(config).expect("open")
}

#[test]
fn disjoint_writers_all_commit() -> Result<()> {
    let db = db_with_retries(0);
    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|worker| {
            let db = db.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || -> Result<()> {
                barrier.wait();
                for i in 0..25 {
                    db.write(|tx| {
                        let mut props = PropertyMap::new();
                        props.insert("worker".into(), PropValue::Int(worker as i64));
                        props.insert("seq".into(), PropValue::Int(i));
                        tx.create_node(["Event"], props).map(|_| ())
                    })?;
                }
                Ok(())
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("writer thread")?;
    }

    db.read(|tx| {
        let events = tx
            .scan_nodes(Some("Event"), PropertyFilter::any())?
            .collect::<Result<Vec<_>>>()?;
        assert_eq!(events.len(), THREADS * 25);
        Ok(())
    })?;
    assert_eq!(db.stats().transactions.conflicts, 0);
    Ok(())
}

#[test]
fn contended_node_has_exactly_one_winner() -> Result<()> {
    let db = db_with_retries(0);
    let target = db.write(|tx| tx.create_node(["Slot"], PropertyMap::new()))?;

    // Every transaction opens before any writes, so all share a snapshot.
    let txs: Vec<_> = (0..THREADS).map(|_| db.begin()).collect::<Result<_>>()?;
    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = txs
        .into_iter()
        .enumerate()
        .map(|(worker, tx)| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let patch = PropPatch::default().set("owner", worker as i64);
                match tx.update_node(target, &patch).and_then(|_| tx.commit()) {
                    Ok(_) => Some(worker as i64),
                    Err(err) => {
                        assert!(err.is_retryable(), "unexpected error: {err}");
                        let _ = tx.rollback();
                        None
                    }
                }
            })
        })
        .collect();
    let winners: Vec<i64> = handles
        .into_iter()
        .filter_map(|handle| handle.join().expect("writer thread"))
        .collect();

    assert_eq!(winners.len(), 1, "winners: {winners:?}");
    db.read(|tx| {
        let node = tx.get_node(target)?;
        assert_eq!(node.props.get("owner"), Some(&PropValue::Int(winners[0])));
        Ok(())
    })
}

#[test]
fn retried_edges_to_a_hub_all_land() -> Result<()> {
    let db = db_with_retries(500);
    let hub = db.write(|tx| tx.create_node(["Topic"], PropertyMap::new()))?;
    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let db = db.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || -> Result<()> {
                barrier.wait();
                for _ in 0..10 {
                    db.write(|tx| {
                        let memory = tx.create_node(["Memory"], PropertyMap::new())?;
                        tx.create_edge("ABOUT", memory, hub, PropertyMap::new())?;
                        Ok(())
                    })?;
                }
                Ok(())
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("writer thread")?;
    }

    let result = db
        .execute(
            "MATCH (m:Memory)-[:ABOUT]->(t:Topic) RETURN count(m) AS n",
            Params::new(),
        )
        .expect("count");
    assert_eq!(result.rows, vec![vec![Value::Int((THREADS * 10) as i64)]]);
    Ok(())
}

#[test]
fn readers_never_observe_half_a_transaction() -> Result<()> {
    let db = db_with_retries(0);
    let writer = {
        let db = db.clone();
        thread::spawn(move || -> Result<()> {
            for i in 0..200 {
                db.write(|tx| {
                    let mut props = PropertyMap::new();
                    props.insert("pair".into(), PropValue::Int(i));
                    tx.create_node(["Half"], props.clone())?;
                    tx.create_node(["Half"], props)?;
                    Ok(())
                })?;
            }
            Ok(())
        })
    };

    for _ in 0..200 {
        let seen = db.read(|tx| {
            Ok(tx
                .scan_nodes(Some("Half"), PropertyFilter::any())?
                .collect::<Result<Vec<_>>>()?
                .len())
        })?;
        assert_eq!(seen % 2, 0, "saw {seen} nodes");
    }
    writer.join().expect("writer thread")?;
    Ok(())
}

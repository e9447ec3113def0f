use super::*;
use crate::storage::{DeleteMode, Direction, PropPatch, PropertyMap};
use crate::types::{PropValue, TxId};
use tempfile::TempDir;

fn props(entries: &[(&str, PropValue)]) -> PropertyMap {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn disk_config(dir: &TempDir) -> Config {
    let mut config = Config::with_data_dir(dir.path());
    config.sync_mode = SyncMode::Immediate;
    config
}

#[test]
fn committed_graph_survives_reopen() {
    let dir = TempDir::new().expect("tempdir");
    let (a, b) = {
        let db = Database::open(disk_config(&dir)).expect("open");
        let tx = db.begin().expect("begin");
        let a = tx
            .create_node(["Person"], props(&[("name", "Alice".into())]))
            .expect("node a");
        let b = tx
            .create_node(["Person"], props(&[("name", "Bob".into())]))
            .expect("node b");
        tx.create_edge("KNOWS", a, b, PropertyMap::new()).expect("edge");
        tx.commit().expect("commit");
        db.close().expect("close");
        (a, b)
    };

    let db = Database::open(disk_config(&dir)).expect("reopen");
    db.read(|tx| {
        let alice = tx.get_node(a)?;
        assert_eq!(alice.props.get("name"), Some(&PropValue::from("Alice")));
        let out = tx.expand(a, Direction::Outgoing, &[])?;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].1, b);
        Ok(())
    })
    .expect("read");
}

#[test]
fn checkpoint_then_more_commits_recover() {
    let dir = TempDir::new().expect("tempdir");
    {
        let db = Database::open(disk_config(&dir)).expect("open");
        db.execute("CREATE (:Memory {text: 'before'})", Params::new())
            .expect("create");
        db.checkpoint().expect("checkpoint");
        db.execute("CREATE (:Memory {text: 'after'})", Params::new())
            .expect("create");
        db.close().expect("close");
    }
    let db = Database::open(disk_config(&dir)).expect("reopen");
    let result = db
        .execute("MATCH (m:Memory) RETURN m.text AS text ORDER BY text", Params::new())
        .expect("query");
    assert_eq!(
        result.rows,
        vec![
            vec![crate::query::Value::from("after")],
            vec![crate::query::Value::from("before")]
        ]
    );
}

#[test]
fn rollback_leaves_no_trace() {
    let db = Database::open_in_memory(Config::default()).expect("open");
    let tx = db.begin().expect("begin");
    let id = tx.create_node(["Draft"], PropertyMap::new()).expect("create");
    assert!(tx.node(id).expect("read own write").is_some());
    tx.rollback().expect("rollback");

    db.read(|tx| {
        assert!(tx.node(id)?.is_none());
        assert_eq!(tx.estimate_label("Draft"), 0);
        Ok(())
    })
    .expect("read");
}

#[test]
fn snapshot_ignores_later_commits() {
    let db = Database::open_in_memory(Config::default()).expect("open");
    let id = db
        .write(|tx| tx.create_node(["Person"], props(&[("age", 30i64.into())])))
        .expect("seed");

    let reader = db.begin().expect("reader");
    assert_eq!(
        reader.get_node(id).expect("read").props.get("age"),
        Some(&PropValue::Int(30))
    );

    db.write(|tx| tx.update_node(id, &PropPatch::default().set("age", 31i64)).map(|_| ()))
        .expect("update");

    assert_eq!(
        reader.get_node(id).expect("read").props.get("age"),
        Some(&PropValue::Int(30))
    );
    reader.rollback().expect("rollback");

    db.read(|tx| {
        assert_eq!(tx.get_node(id)?.props.get("age"), Some(&PropValue::Int(31)));
        Ok(())
    })
    .expect("fresh read");
}

#[test]
fn second_writer_of_a_node_conflicts() {
    let db = Database::open_in_memory(Config::default()).expect("open");
    let id = db
        .write(|tx| tx.create_node(["Counter"], props(&[("n", 0i64.into())])))
        .expect("seed");

    let first = db.begin().expect("first");
    let second = db.begin().expect("second");
    first
        .update_node(id, &PropPatch::default().set("n", 1i64))
        .expect("first write");
    let err = second
        .update_node(id, &PropPatch::default().set("n", 2i64))
        .expect_err("second write must conflict");
    assert!(err.is_retryable(), "{err}");
    assert!(second.is_failed());
    assert!(second.commit().is_err());

    first.commit().expect("first commit");
    db.read(|tx| {
        assert_eq!(tx.get_node(id)?.props.get("n"), Some(&PropValue::Int(1)));
        Ok(())
    })
    .expect("read");
}

#[test]
fn restrict_delete_poisons_and_cascade_removes_edges() {
    let db = Database::open_in_memory(Config::default()).expect("open");
    let (a, b) = db
        .write(|tx| {
            let a = tx.create_node(["N"], PropertyMap::new())?;
            let b = tx.create_node(["N"], PropertyMap::new())?;
            tx.create_edge("LINKS", a, b, PropertyMap::new())?;
            Ok((a, b))
        })
        .expect("seed");

    let tx = db.begin().expect("begin");
    let err = tx.delete_node(a, DeleteMode::Restrict).expect_err("restricted");
    assert_eq!(err.code(), "Neo.ClientError.Schema.ConstraintValidationFailed");
    assert!(tx.is_failed());
    tx.rollback().expect("rollback");

    db.write(|tx| tx.delete_node(a, DeleteMode::Cascade)).expect("cascade");
    db.read(|tx| {
        assert!(tx.node(a)?.is_none());
        assert!(tx.edges_of(b, Direction::Both)?.is_empty());
        Ok(())
    })
    .expect("read");
}

#[test]
fn stats_and_health_reflect_commits() {
    let db = Database::open_in_memory(Config::default()).expect("open");
    db.execute("CREATE (:A)-[:R]->(:B)", Params::new()).expect("create");
    let stats = db.stats();
    assert_eq!(stats.graph.nodes, 2);
    assert_eq!(stats.graph.edges, 1);
    assert!(stats.transactions.committed >= 1);
    assert!(db.health().is_healthy());
    db.close().expect("close");
    assert!(!db.health().is_healthy());
    assert!(db.begin().is_err());
}

#[test]
fn transaction_ids_increase() {
    let db = Database::open_in_memory(Config::default()).expect("open");
    let first = db.begin().expect("first").id();
    let second = db.begin().expect("second").id();
    assert!(second > first);
    assert_ne!(first, TxId(0));
}

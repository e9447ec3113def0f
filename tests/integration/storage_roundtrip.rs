#![allow(missing_docs)]

use std::collections::BTreeSet;
use std::sync::Arc;

use engramdb::db::{Config, Database, MemoryBackend};
use engramdb::storage::{DeleteMode, Direction, PropPatch, PropertyMap};
use engramdb::types::{PropValue, Result};
use proptest::prelude::*;

fn small_config() -> Config {
    let mut config = Config::default();
    config.vector.dimensions = 4;
    config
}

fn open(backend: &MemoryBackend) -> Database {
    Database::open_with_backend(small_config(), Arc::new(backend.clone())).expect("open")
}

fn prop_value() -> impl Strategy<Value = PropValue> {
    prop_oneof![
        any::<bool>().prop_map(PropValue::Bool),
        any::<i64>().prop_map(PropValue::Int),
        (-1.0e9f64..1.0e9).prop_map(PropValue::Float),
        "[a-z ]{0,12}".prop_map(PropValue::String),
        prop::collection::vec(any::<i64>().prop_map(PropValue::Int), 0..4).prop_map(PropValue::List),
    ]
}

fn node_spec() -> impl Strategy<Value = (BTreeSet<String>, PropertyMap)> {
    (
        prop::collection::btree_set("[A-Z][a-z]{0,5}", 0..3),
        prop::collection::btree_map("[a-d]{1,6}", prop_value(), 0..5),
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn nodes_round_trip_through_reopen(specs in prop::collection::vec(node_spec(), 1..8)) {
        let backend = MemoryBackend::new();
        let ids = {
            let db = open(&backend);
            let tx = db.begin().expect("begin");
            let mut ids = Vec::new();
            for (labels, props) in &specs {
                ids.push(tx.create_node(labels.iter().cloned(), props.clone()).expect("create"));
            }
            tx.commit().expect("commit");
            db.close().expect("close");
            ids
        };

        let db = open(&backend);
        let tx = db.begin().expect("begin");
        for (id, (labels, props)) in ids.iter().zip(&specs) {
            let node = tx.get_node(*id).expect("node survives");
            prop_assert_eq!(&node.labels, labels);
            prop_assert_eq!(&node.props, props);
        }
    }
}

#[test]
fn edges_and_updates_round_trip() -> Result<()> {
    let backend = MemoryBackend::new();
    let (a, b, edge) = {
        let db = open(&backend);
        let (a, b, edge) = db.write(|tx| {
            let a = tx.create_node(["Person"], PropertyMap::new())?;
            let b = tx.create_node(["Person"], PropertyMap::new())?;
            let mut props = PropertyMap::new();
            props.insert("since".into(), PropValue::Int(2020));
            let edge = tx.create_edge("KNOWS", a, b, props)?;
            Ok((a, b, edge))
        })?;
        db.write(|tx| {
            tx.update_edge(edge, &PropPatch::default().set("since", 2021i64))?;
            tx.update_node(a, &PropPatch::default().add_label("Agent").set("name", "Ada"))?;
            Ok(())
        })?;
        db.close()?;
        (a, b, edge)
    };

    let db = open(&backend);
    db.read(|tx| {
        let record = tx.get_edge(edge)?;
        assert_eq!(record.src, a);
        assert_eq!(record.dst, b);
        assert_eq!(record.props.get("since"), Some(&PropValue::Int(2021)));
        let ada = tx.get_node(a)?;
        assert!(ada.labels.contains("Agent"));
        assert_eq!(ada.props.get("name"), Some(&PropValue::from("Ada")));
        assert_eq!(tx.edges_of(b, Direction::Incoming)?, vec![edge]);
        Ok(())
    })
}

#[test]
fn deleted_nodes_leave_every_index() -> Result<()> {
    let backend = MemoryBackend::new();
    let db = open(&backend);
    let id = db.write(|tx| {
        let mut props = PropertyMap::new();
        props.insert("content".into(), PropValue::from("espresso brewing notes"));
        props.insert(
            "embedding".into(),
            PropValue::List(vec![
                PropValue::Float(1.0),
                PropValue::Float(0.0),
                PropValue::Float(0.0),
                PropValue::Float(0.0),
            ]),
        );
        tx.create_node(["Memory"], props)
    })?;

    db.read(|tx| {
        assert_eq!(tx.fulltext_search("espresso", 5)?.len(), 1);
        assert_eq!(tx.vector_search(&[1.0, 0.0, 0.0, 0.0], 5)?.len(), 1);
        Ok(())
    })?;

    db.write(|tx| tx.delete_node(id, DeleteMode::Restrict))?;
    db.read(|tx| {
        assert!(tx.fulltext_search("espresso", 5)?.is_empty());
        assert!(tx.vector_search(&[1.0, 0.0, 0.0, 0.0], 5)?.is_empty());
        assert!(tx.node(id)?.is_none());
        Ok(())
    })?;
    assert_eq!(db.stats().index.vectors, 0);
    assert_eq!(db.stats().index.documents, 0);
    Ok(())
}

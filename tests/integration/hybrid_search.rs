#![allow(missing_docs)]

use std::collections::HashSet;
use std::sync::Arc;

use engramdb::db::{Config, Database};
use engramdb::index::{HnswIndex, HnswParams, Metric, ScalarKernel};
use engramdb::query::{Params, QueryResult, Value};
use engramdb::types::NodeId;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const DIMS: usize = 32;

fn random_vector(rng: &mut ChaCha8Rng) -> Vec<f32> {
    (0..DIMS).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
}

fn build_index(seed: u64, count: u64) -> HnswIndex {
    let params = HnswParams {
        dimensions: DIMS,
        ef_search: 128,
        metric: Metric::Cosine,
        ..HnswParams::default()
    };
    let mut index = HnswIndex::new(params, Arc::new(ScalarKernel));
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    for id in 1..=count {
        index
            .insert(NodeId(id), &random_vector(&mut rng))
            .expect("insert");
    }
    index
}

#[test]
fn hnsw_recall_tracks_brute_force() {
    let index = build_index(7, 2_000);
    let mut rng = ChaCha8Rng::seed_from_u64(99);
    let k = 10;
    let mut found = 0usize;
    let queries = 50;
    for _ in 0..queries {
        let query = random_vector(&mut rng);
        let exact: HashSet<NodeId> = index
            .brute_force(&query, k)
            .expect("exact")
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        found += index
            .search(&query, k)
            .expect("search")
            .iter()
            .filter(|(id, _)| exact.contains(id))
            .count();
    }
    let recall = found as f64 / (queries * k) as f64;
    assert!(recall >= 0.95, "recall {recall:.3}");
}

#[test]
fn identical_seeds_build_identical_graphs() {
    let a = build_index(3, 500);
    let b = build_index(3, 500);
    let mut rng = ChaCha8Rng::seed_from_u64(11);
    for _ in 0..10 {
        let query = random_vector(&mut rng);
        assert_eq!(
            a.search(&query, 5).expect("search a"),
            b.search(&query, 5).expect("search b")
        );
    }
}

#[test]
fn removed_vectors_are_never_returned() {
    let mut index = build_index(5, 300);
    let mut rng = ChaCha8Rng::seed_from_u64(5);
    let target = random_vector(&mut rng);
    let best = index.search(&target, 1).expect("search")[0].0;
    assert!(index.remove(best));
    assert!(!index.contains(best));
    let hits = index.search(&target, 20).expect("search");
    assert!(hits.iter().all(|(id, _)| *id != best));
    assert_eq!(index.len(), 299);
}

fn memory_db() -> Database {
    let mut config = Config::default();
    config.vector.dimensions = 4;
    let db = Database::open_in_memory(config).expect("open");
    db.execute(
        "CREATE (:Memory {content: 'espresso needs a fine grind', embedding: [1.0, 0.0, 0.0, 0.0]}), \
                (:Memory {content: 'espresso machine descaling schedule', embedding: [0.0, 1.0, 0.0, 0.0]}), \
                (:Memory {content: 'tea steeping times', embedding: [0.9, 0.1, 0.0, 0.0]}), \
                (:Memory {content: 'bicycle tyre pressure', embedding: [0.0, 0.0, 0.0, 1.0]})",
        Params::new(),
    )
    .expect("seed");
    db
}

fn contents(result: &QueryResult) -> Vec<String> {
    result
        .rows
        .iter()
        .map(|row| match &row[0] {
            Value::String(s) => s.clone(),
            other => panic!("expected content string, got {other:?}"),
        })
        .collect()
}

#[test]
fn hybrid_procedure_ranks_agreeing_signals_first() {
    let db = memory_db();
    let query = "CALL db.index.hybrid.queryNodes('espresso', [1.0, 0.0, 0.0, 0.0], 3) \
                 YIELD node, score RETURN node.content, score";
    let first = db.execute(query, Params::new()).expect("hybrid");
    assert_eq!(first.rows.len(), 3);
    assert_eq!(contents(&first)[0], "espresso needs a fine grind");
    let scores: Vec<f64> = first
        .rows
        .iter()
        .map(|row| match row[1] {
            Value::Float(s) => s,
            ref other => panic!("expected score, got {other:?}"),
        })
        .collect();
    assert!(scores.windows(2).all(|w| w[0] >= w[1]), "{scores:?}");

    let second = db.execute(query, Params::new()).expect("hybrid again");
    assert_eq!(first.rows, second.rows);
}

#[test]
fn hybrid_without_embedding_uses_text_only() {
    let db = memory_db();
    let result = db
        .execute(
            "CALL db.index.hybrid.queryNodes('descaling', null, 5) YIELD node RETURN node.content",
            Params::new(),
        )
        .expect("hybrid");
    assert_eq!(contents(&result), vec!["espresso machine descaling schedule"]);
}

#[test]
fn fulltext_and_vector_procedures() {
    let db = memory_db();
    let text = db
        .execute(
            "CALL db.index.fulltext.queryNodes('memory_text', 'espresso', {limit: 1}) \
             YIELD node RETURN node.content",
            Params::new(),
        )
        .expect("fulltext");
    assert_eq!(text.rows.len(), 1);

    let mut params = Params::new();
    params.insert(
        "embedding".into(),
        Value::List(vec![
            Value::Float(0.0),
            Value::Float(0.0),
            Value::Float(0.0),
            Value::Float(1.0),
        ]),
    );
    let nearest = db
        .execute(
            "CALL db.index.vector.queryNodes('memory_vectors', 1, $embedding) YIELD node RETURN node.content",
            params,
        )
        .expect("vector");
    assert_eq!(contents(&nearest), vec!["bicycle tyre pressure"]);

    assert!(db
        .execute(
            "CALL db.index.fulltext.queryNodes('no_such_index', 'espresso')",
            Params::new()
        )
        .is_err());
    assert!(db
        .execute(
            "CALL db.index.vector.queryNodes('memory_vectors', 1, [1.0, 0.0])",
            Params::new()
        )
        .is_err());
}

#[test]
fn maximal_k_returns_every_memory() {
    let db = memory_db();
    let vector = db
        .execute(
            "CALL db.index.vector.queryNodes('memory_vectors', 9223372036854775807, [1.0, 0.0, 0.0, 0.0]) \
             YIELD node RETURN node.content",
            Params::new(),
        )
        .expect("vector");
    assert_eq!(vector.rows.len(), 4);
    assert_eq!(contents(&vector)[0], "espresso needs a fine grind");

    let hybrid = db
        .execute(
            "CALL db.index.hybrid.queryNodes('espresso', [1.0, 0.0, 0.0, 0.0], 9223372036854775807) \
             YIELD node RETURN node.content",
            Params::new(),
        )
        .expect("hybrid");
    assert_eq!(hybrid.rows.len(), 4);
}

#[test]
fn uncommitted_memories_are_not_searchable() {
    let db = memory_db();
    let tx = db.begin().expect("begin");
    db.execute_in(
        &tx,
        "CREATE (:Memory {content: 'sourdough starter feeding'})",
        &Params::new(),
    )
    .expect("create");
    assert!(tx.fulltext_search("sourdough", 5).expect("search").is_empty());
    tx.commit().expect("commit");

    db.read(|tx| {
        assert_eq!(tx.fulltext_search("sourdough", 5)?.len(), 1);
        Ok(())
    })
    .expect("read");
}

#[test]
fn mis_sized_embeddings_are_rejected() {
    let db = memory_db();
    let err = db
        .execute("CREATE (:Memory {embedding: [1.0, 2.0]})", Params::new())
        .expect_err("wrong dimension");
    assert!(!err.is_retryable());
    assert_eq!(db.stats().index.vectors, 4);
}

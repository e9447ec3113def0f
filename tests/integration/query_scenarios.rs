//! End-to-end statements through `Database::execute` and explicit
//! transactions.

#![allow(missing_docs)]

use std::thread;
use std::time::Duration;

use engramdb::db::{CancelToken, Config, Database, TxOptions};
use engramdb::query::{Params, QueryCursor, QueryError, QueryResult, Value};

fn db() -> Database {
    Database::open_in_memory(Config::default()).expect("open")
}

fn run(db: &Database, query: &str) -> QueryResult {
    db.execute(query, Params::new())
        .unwrap_or_else(|err| panic!("{query}: {err}"))
}

fn single(result: &QueryResult) -> &Value {
    assert_eq!(result.rows.len(), 1, "rows: {:?}", result.rows);
    &result.rows[0][0]
}

fn strings(result: &QueryResult) -> Vec<String> {
    result
        .rows
        .iter()
        .map(|row| match &row[0] {
            Value::String(s) => s.clone(),
            other => panic!("expected a string, got {other:?}"),
        })
        .collect()
}

fn seed_people(db: &Database) {
    run(
        db,
        "CREATE (a:Person {name: 'Ada', team: 'core', age: 36}), \
                (b:Person {name: 'Bo', team: 'core', age: 29}), \
                (c:Person {name: 'Cy', team: 'infra', age: 41}), \
                (a)-[:KNOWS {since: 2019}]->(b), \
                (b)-[:KNOWS {since: 2021}]->(c)",
    );
}

#[test]
fn read_is_stable_while_a_concurrent_update_commits() {
    let db = db();
    let created = run(&db, "CREATE (n:Person {name:\"Alice\", age:30})");
    assert_eq!(created.stats.nodes_created, 1);
    assert_eq!(created.stats.labels_added, 1);

    let reader = db.begin().expect("begin");
    let query = "MATCH (n:Person {name:\"Alice\"}) RETURN n.age";
    let first = db.execute_in(&reader, query, &Params::new()).expect("read");
    assert_eq!(first.columns, vec!["n.age".to_string()]);
    assert_eq!(single(&first), &Value::Int(30));

    let updated = run(&db, "MATCH (n:Person {name:\"Alice\"}) SET n.age = 31");
    assert_eq!(updated.stats.properties_set, 1);

    let again = db.execute_in(&reader, query, &Params::new()).expect("reread");
    assert_eq!(single(&again), &Value::Int(30));
    reader.commit().expect("read-only commit");

    assert_eq!(single(&run(&db, query)), &Value::Int(31));
}

#[test]
fn filters_ordering_and_paging() {
    let db = db();
    seed_people(&db);
    let result = run(
        &db,
        "MATCH (p:Person) WHERE p.age > 30 RETURN p.name AS name ORDER BY name DESC",
    );
    assert_eq!(strings(&result), vec!["Cy", "Ada"]);

    let paged = run(
        &db,
        "MATCH (p:Person) RETURN p.name AS name, p.age AS age ORDER BY age SKIP 1 LIMIT 1",
    );
    assert_eq!(strings(&paged), vec!["Ada"]);

    let text = run(
        &db,
        "MATCH (p:Person) WHERE p.name STARTS WITH 'C' OR p.name CONTAINS 'd' \
         RETURN p.name AS name ORDER BY name",
    );
    assert_eq!(strings(&text), vec!["Ada", "Cy"]);
}

#[test]
fn grouped_aggregation() {
    let db = db();
    seed_people(&db);
    let result = run(
        &db,
        "MATCH (p:Person) RETURN p.team AS team, count(*) AS n, max(p.age) AS oldest ORDER BY team",
    );
    assert_eq!(result.columns, vec!["team", "n", "oldest"]);
    assert_eq!(
        result.rows,
        vec![
            vec![Value::from("core"), Value::Int(2), Value::Int(36)],
            vec![Value::from("infra"), Value::Int(1), Value::Int(41)],
        ]
    );

    let totals = run(&db, "UNWIND [1, 2, 3, 4] AS x RETURN sum(x) AS s, collect(x) AS xs");
    assert_eq!(totals.rows[0][0], Value::Int(10));
    assert_eq!(
        totals.rows[0][1],
        Value::List((1..=4).map(Value::Int).collect())
    );

    let empty = run(&db, "MATCH (m:Missing) RETURN count(m) AS n");
    assert_eq!(single(&empty), &Value::Int(0));
}

#[test]
fn traversals_and_variable_length_paths() {
    let db = db();
    seed_people(&db);
    let direct = run(
        &db,
        "MATCH (a:Person {name: 'Ada'})-[r:KNOWS]->(b) RETURN b.name, r.since",
    );
    assert_eq!(
        direct.rows,
        vec![vec![Value::from("Bo"), Value::Int(2019)]]
    );

    let reach = run(
        &db,
        "MATCH (a:Person {name: 'Ada'})-[:KNOWS*1..2]->(b) RETURN b.name AS name ORDER BY name",
    );
    assert_eq!(strings(&reach), vec!["Bo", "Cy"]);

    let incoming = run(
        &db,
        "MATCH (c:Person {name: 'Cy'})<-[:KNOWS]-(b) RETURN b.name",
    );
    assert_eq!(strings(&incoming), vec!["Bo"]);

    let shortest = run(
        &db,
        "MATCH p = shortestPath((a:Person {name: 'Ada'})-[*..5]-(c:Person {name: 'Cy'})) RETURN length(p)",
    );
    assert_eq!(single(&shortest), &Value::Int(2));
}

#[test]
fn optional_match_yields_nulls() {
    let db = db();
    seed_people(&db);
    let result = run(
        &db,
        "MATCH (p:Person {name: 'Cy'}) OPTIONAL MATCH (p)-[:KNOWS]->(q) RETURN p.name, q.name",
    );
    assert_eq!(result.rows, vec![vec![Value::from("Cy"), Value::Null]]);
}

#[test]
fn merge_creates_once_then_matches() {
    let db = db();
    let query = "MERGE (t:Topic {key: 'coffee'}) ON CREATE SET t.hits = 1 ON MATCH SET t.hits = t.hits + 1 RETURN t.hits";
    let first = run(&db, query);
    assert_eq!(first.stats.nodes_created, 1);
    assert_eq!(single(&first), &Value::Int(1));

    let second = run(&db, query);
    assert_eq!(second.stats.nodes_created, 0);
    assert_eq!(single(&second), &Value::Int(2));

    let count = run(&db, "MATCH (t:Topic) RETURN count(t)");
    assert_eq!(single(&count), &Value::Int(1));
}

#[test]
fn labels_remove_and_detach_delete() {
    let db = db();
    seed_people(&db);
    let relabel = run(
        &db,
        "MATCH (p:Person {name: 'Bo'}) SET p:Agent REMOVE p.team RETURN labels(p) AS labels, p.team",
    );
    assert_eq!(relabel.stats.labels_added, 1);
    assert_eq!(relabel.rows[0][1], Value::Null);
    match &relabel.rows[0][0] {
        Value::List(labels) => {
            assert!(labels.contains(&Value::from("Agent")));
            assert!(labels.contains(&Value::from("Person")));
        }
        other => panic!("expected labels list, got {other:?}"),
    }

    let err = db
        .execute("MATCH (p:Person {name: 'Bo'}) DELETE p", Params::new())
        .expect_err("connected node needs DETACH");
    assert_eq!(err.code(), "Neo.ClientError.Schema.ConstraintValidationFailed");

    let deleted = run(&db, "MATCH (p:Person {name: 'Bo'}) DETACH DELETE p");
    assert_eq!(deleted.stats.nodes_deleted, 1);
    assert_eq!(deleted.stats.relationships_deleted, 2);
    assert_eq!(single(&run(&db, "MATCH ()-[r]->() RETURN count(r)")), &Value::Int(0));
}

#[test]
fn parameters_bind_values_and_missing_ones_are_named() {
    let db = db();
    let mut params = Params::new();
    params.insert("name".into(), Value::from("Dee"));
    params.insert("tags".into(), Value::List(vec![Value::from("a"), Value::from("b")]));
    db.execute("CREATE (:Person {name: $name, tags: $tags})", params)
        .expect("create");
    let result = run(&db, "MATCH (p:Person) RETURN size(p.tags)");
    assert_eq!(single(&result), &Value::Int(2));

    let err = db
        .execute("MATCH (p:Person {name: $who}) RETURN p", Params::new())
        .expect_err("missing parameter");
    assert!(matches!(err, QueryError::MissingParameter(ref names) if names == "who"));
}

#[test]
fn errors_map_to_status_codes() {
    let db = db();
    let parse = db
        .execute("MATCH (n RETURN n", Params::new())
        .expect_err("syntax");
    assert_eq!(parse.code(), "Neo.ClientError.Statement.SyntaxError");

    let unbound = db.execute("RETURN m.name", Params::new()).expect_err("unbound");
    assert!(matches!(unbound, QueryError::UnboundVariable(_)));

    let unknown = db
        .execute("CALL db.nothing()", Params::new())
        .expect_err("unknown procedure");
    assert_eq!(unknown.code(), "Neo.ClientError.Procedure.ProcedureNotFound");

    let types = db
        .execute("RETURN 'a' * 2 AS x", Params::new())
        .expect_err("type mismatch");
    assert_eq!(types.code(), "Neo.ClientError.Statement.TypeError");
}

#[test]
fn explain_plans_without_writing() {
    let db = db();
    let result = run(&db, "EXPLAIN MATCH (p:Person) WHERE p.age > 1 RETURN p.name");
    let plan = result.plan.expect("plan text");
    assert!(!plan.is_empty());
    assert!(result.rows.is_empty());

    let explained_write = run(&db, "EXPLAIN CREATE (:Person {name: 'ghost'})");
    assert!(!explained_write.stats.contains_updates());
    assert_eq!(single(&run(&db, "MATCH (p:Person) RETURN count(p)")), &Value::Int(0));
}

#[test]
fn catalog_procedures_list_labels_and_types() {
    let db = db();
    seed_people(&db);
    let labels = run(&db, "CALL db.labels() YIELD label RETURN label ORDER BY label");
    assert_eq!(strings(&labels), vec!["Person"]);
    let types = run(&db, "CALL db.relationshipTypes()");
    assert_eq!(strings(&types), vec!["KNOWS"]);
}

#[test]
fn failed_statement_in_explicit_transaction_rejects_the_rest() {
    let db = db();
    seed_people(&db);
    let tx = db.begin().expect("begin");
    db.execute_in(&tx, "CREATE (:Person {name: 'Eve'})", &Params::new())
        .expect("create");
    db.execute_in(&tx, "MATCH (p:Person {name: 'Ada'}) DELETE p", &Params::new())
        .expect_err("restricted delete");
    assert!(tx.is_failed());
    assert!(db
        .execute_in(&tx, "RETURN 1", &Params::new())
        .is_err());
    tx.rollback().expect("rollback");

    let names = run(&db, "MATCH (p:Person {name: 'Eve'}) RETURN p.name");
    assert!(names.rows.is_empty());
}

fn seed_items(db: &Database, count: i64) {
    let mut params = Params::new();
    params.insert("ids".into(), Value::List((0..count).map(Value::Int).collect()));
    db.execute("UNWIND $ids AS i CREATE (:Item {i: i})", params)
        .expect("seed items");
}

/// Pulls until the cursor fails, returning the error and the rows pulled.
fn pull_until_error(cursor: &mut QueryCursor) -> (QueryError, usize) {
    let mut pulled = 0;
    loop {
        match cursor.next_row() {
            Ok(Some(_)) => pulled += 1,
            Ok(None) => panic!("cursor finished after {pulled} rows without interruption"),
            Err(err) => return (err, pulled),
        }
    }
}

#[test]
fn cancelling_a_transaction_stops_a_running_scan() {
    let db = db();
    seed_items(&db, 500);
    let token = CancelToken::new();
    let tx = db
        .begin_with(TxOptions {
            cancel: Some(token.clone()),
            ..TxOptions::default()
        })
        .expect("begin");
    let mut cursor = db
        .stream_in(&tx, "MATCH (n:Item) RETURN n.i AS i", &Params::new())
        .expect("cursor");
    assert!(cursor.next_row().expect("first row").is_some());

    token.cancel();
    let (err, pulled) = pull_until_error(&mut cursor);
    assert!(pulled < 128, "scan kept going for {pulled} rows");
    assert_eq!(err.code(), "Neo.TransientError.Transaction.Terminated");
    assert!(tx.is_failed());
    assert!(db.execute_in(&tx, "RETURN 1 AS one", &Params::new()).is_err());
    tx.rollback().expect("rollback");
}

#[test]
fn statement_timeout_interrupts_a_slow_consumer() {
    let mut config = Config::default();
    config.query.timeout_ms = 25;
    let db = Database::open_in_memory(config).expect("open");
    seed_items(&db, 500);
    let tx = db.begin().expect("begin");
    let mut cursor = db
        .stream_in(&tx, "MATCH (n:Item) RETURN n.i AS i", &Params::new())
        .expect("cursor");
    assert!(cursor.next_row().expect("first row").is_some());
    thread::sleep(Duration::from_millis(60));

    let (err, pulled) = pull_until_error(&mut cursor);
    assert!(pulled < 128, "scan kept going for {pulled} rows");
    assert_eq!(err.code(), "Neo.ClientError.Transaction.TransactionTimedOut");
    assert!(tx.is_failed());
    tx.rollback().expect("rollback");
}

#[test]
fn expired_transaction_rejects_a_traversal() {
    let db = db();
    seed_items(&db, 50);
    run(
        &db,
        "MATCH (a:Item), (b:Item) WHERE b.i = a.i + 1 CREATE (a)-[:NEXT]->(b)",
    );
    let tx = db
        .begin_with(TxOptions {
            timeout: Some(Duration::from_millis(1)),
            ..TxOptions::default()
        })
        .expect("begin");
    thread::sleep(Duration::from_millis(10));
    let err = db
        .execute_in(
            &tx,
            "MATCH (a:Item {i: 0})-[:NEXT*1..5]->(b) RETURN count(b) AS n",
            &Params::new(),
        )
        .expect_err("expired transaction");
    assert_eq!(err.code(), "Neo.ClientError.Transaction.TransactionTimedOut");
    assert!(tx.is_failed());
    tx.rollback().expect("rollback");
}

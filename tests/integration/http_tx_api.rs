//! Transactional HTTP endpoint exercised through the axum router.

#![allow(missing_docs)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use engramdb::db::{Config, Database};
use engramdb::server::http::{router, HttpState};
use engramdb::server::AllowAll;
use serde_json::{json, Value as JsonValue};
use tower::ServiceExt;

fn app() -> (Router, HttpState, Database) {
    let db = Database::open_in_memory(Config::default()).expect("open");
    let state = HttpState::new(db.clone(), Arc::new(AllowAll));
    (router(state.clone()), state, db)
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<&str>) -> (StatusCode, JsonValue) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(body.map_or_else(Body::empty, |b| Body::from(b.to_owned())))
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let json = if bytes.is_empty() {
        JsonValue::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, json)
}

async fn post(app: &Router, uri: &str, body: JsonValue) -> (StatusCode, JsonValue) {
    send(app, "POST", uri, Some(&body.to_string())).await
}

fn statements(list: &[&str]) -> JsonValue {
    json!({ "statements": list.iter().map(|s| json!({"statement": s})).collect::<Vec<_>>() })
}

async fn count(app: &Router, label: &str) -> i64 {
    let (_, body) = post(
        app,
        "/db/neo4j/tx/commit",
        statements(&[&format!("MATCH (n:{label}) RETURN count(n) AS n")]),
    )
    .await;
    body["results"][0]["data"][0]["row"][0]
        .as_i64()
        .expect("count value")
}

#[tokio::test]
async fn open_run_commit_across_requests() {
    let (app, state, _db) = app();
    let (status, opened) = post(
        &app,
        "/db/neo4j/tx",
        statements(&["CREATE (:Memory {content: 'first'})"]),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = opened["transaction"]["id"].as_u64().expect("tx id");
    assert_eq!(
        opened["commit"],
        json!(format!("/db/neo4j/tx/{id}/commit"))
    );
    assert_eq!(state.open_transactions(), 1);

    let (status, ran) = post(
        &app,
        &format!("/db/neo4j/tx/{id}"),
        statements(&["CREATE (:Memory {content: 'second'})"]),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ran["errors"], json!([]));
    assert_eq!(count(&app, "Memory").await, 0, "uncommitted writes are private");

    let (status, committed) = post(
        &app,
        &format!("/db/neo4j/tx/{id}/commit"),
        statements(&["MATCH (m:Memory) RETURN m.content AS c ORDER BY c"]),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        committed["results"][0]["data"],
        json!([{"row": ["first"]}, {"row": ["second"]}])
    );
    assert!(committed.get("transaction").is_none());
    assert_eq!(state.open_transactions(), 0);
    assert_eq!(count(&app, "Memory").await, 2);
}

#[tokio::test]
async fn delete_rolls_back_open_transaction() {
    let (app, state, _db) = app();
    let (_, opened) = post(&app, "/db/neo4j/tx", statements(&["CREATE (:Draft)"])).await;
    let id = opened["transaction"]["id"].as_u64().expect("tx id");

    let (status, body) = send(&app, "DELETE", &format!("/db/neo4j/tx/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["errors"], json!([]));
    assert_eq!(state.open_transactions(), 0);
    assert_eq!(count(&app, "Draft").await, 0);
}

#[tokio::test]
async fn concurrent_transactions_conflict_on_the_same_node() {
    let (app, _state, db) = app();
    db.execute("CREATE (:Counter {n: 0})", Default::default())
        .expect("seed");

    let (_, first) = post(&app, "/db/neo4j/tx", json!({})).await;
    let (_, second) = post(&app, "/db/neo4j/tx", json!({})).await;
    let first = first["transaction"]["id"].as_u64().expect("first id");
    let second = second["transaction"]["id"].as_u64().expect("second id");
    assert_ne!(first, second);

    let bump = statements(&["MATCH (c:Counter) SET c.n = c.n + 1"]);
    let (_, ok) = post(&app, &format!("/db/neo4j/tx/{first}"), bump.clone()).await;
    assert_eq!(ok["errors"], json!([]));
    let (status, conflict) = post(&app, &format!("/db/neo4j/tx/{second}"), bump).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        conflict["errors"][0]["code"],
        json!("Neo.TransientError.Transaction.Outdated")
    );

    let (_, done) = post(&app, &format!("/db/neo4j/tx/{first}/commit"), json!({})).await;
    assert_eq!(done["errors"], json!([]));
    let (status, _) = post(&app, &format!("/db/neo4j/tx/{second}/commit"), json!({})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn results_stop_at_the_first_failing_statement() {
    let (app, _state, _db) = app();
    let (status, body) = post(
        &app,
        "/db/neo4j/tx/commit",
        statements(&[
            "CREATE (:Memory {content: 'lost'})",
            "RETURN missing.value",
            "CREATE (:Memory {content: 'never run'})",
        ]),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["results"].as_array().map(Vec::len), Some(1));
    assert_eq!(
        body["errors"][0]["code"],
        json!("Neo.ClientError.Statement.SyntaxError")
    );
    assert_eq!(count(&app, "Memory").await, 0);
}

#[tokio::test]
async fn explain_returns_plan_text() {
    let (app, _state, _db) = app();
    let (_, body) = post(
        &app,
        "/db/neo4j/tx/commit",
        statements(&["EXPLAIN MATCH (m:Memory) RETURN m"]),
    )
    .await;
    assert!(body["results"][0]["plan"].as_str().is_some_and(|p| !p.is_empty()));
    assert_eq!(body["results"][0]["data"], json!([]));
}

#[tokio::test]
async fn malformed_requests_are_client_errors() {
    let (app, _state, _db) = app();
    let (status, body) = send(&app, "POST", "/db/neo4j/tx/commit", Some("{not json")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["errors"][0]["code"], json!("Neo.ClientError.Request.Invalid"));

    let (status, _) = post(&app, "/db/neo4j/tx/abc", json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = post(&app, "/db/neo4j/tx/424242", json!({})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn health_turns_unavailable_after_close() {
    let (app, _state, db) = app();
    let (status, body) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_object());

    db.close().expect("close");
    let (status, _) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

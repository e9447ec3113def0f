//! Transactional HTTP/JSON endpoint.
//!
//! | Method | Path | Effect |
//! |---|---|---|
//! | `POST` | `/db/{db}/tx` | open a transaction, optionally running statements |
//! | `POST` | `/db/{db}/tx/{id}` | run statements in an open transaction |
//! | `POST` | `/db/{db}/tx/{id}/commit` | run statements, then commit |
//! | `DELETE` | `/db/{db}/tx/{id}` | roll back |
//! | `POST` | `/db/{db}/tx/commit` | run statements in a fresh transaction and commit |
//! | `GET` | `/health` | health report |
//!
//! A statement error rolls back the transaction it ran in. Open
//! transactions that sit idle past `server.tx_idle_timeout_ms` are rolled
//! back, either when next touched or by the reaper task.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use super::auth::{parse_basic_header, Authenticator};
use super::{blocking, ServerError};
use crate::db::{Database, HealthStatus, Transaction};
use crate::query::{Params, QueryResult, QueryStats, Value};

#[derive(Debug, Default, Deserialize)]
struct StatementsRequest {
    #[serde(default)]
    statements: Vec<StatementRequest>,
}

#[derive(Debug, Deserialize)]
struct StatementRequest {
    statement: String,
    #[serde(default)]
    parameters: serde_json::Map<String, JsonValue>,
}

#[derive(Debug, Serialize)]
struct ErrorEntry {
    code: String,
    message: String,
}

#[derive(Debug, Serialize)]
struct TxInfo {
    id: u64,
    expires_in_ms: u64,
}

#[derive(Debug, Default, Serialize)]
struct TxResponse {
    results: Vec<JsonValue>,
    errors: Vec<ErrorEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    commit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    transaction: Option<TxInfo>,
}

impl TxResponse {
    fn failed(results: Vec<JsonValue>, err: &ServerError) -> Self {
        Self {
            results,
            errors: vec![ErrorEntry {
                code: err.code().to_owned(),
                message: err.client_message(),
            }],
            ..Self::default()
        }
    }
}

struct OpenTx {
    tx: Transaction,
    last_used: Instant,
}

struct Shared {
    db: Database,
    auth: Arc<dyn Authenticator>,
    idle: Duration,
    open: Mutex<FxHashMap<u64, OpenTx>>,
}

/// Router state: the database plus open HTTP transactions.
#[derive(Clone)]
pub struct HttpState {
    inner: Arc<Shared>,
}

impl HttpState {
    /// State for `db`, with the idle timeout from its config.
    pub fn new(db: Database, auth: Arc<dyn Authenticator>) -> Self {
        let idle = Duration::from_millis(db.config().server.tx_idle_timeout_ms);
        Self {
            inner: Arc::new(Shared {
                db,
                auth,
                idle,
                open: Mutex::new(FxHashMap::default()),
            }),
        }
    }

    /// Number of open transactions.
    pub fn open_transactions(&self) -> usize {
        self.inner.open.lock().len()
    }

    fn check_auth(&self, headers: &HeaderMap) -> Result<(), ServerError> {
        let credentials = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_basic_header);
        let (user, pass) = match &credentials {
            Some((user, pass)) => (Some(user.as_str()), Some(pass.as_str())),
            None => (None, None),
        };
        self.inner.auth.authenticate(user, pass)
    }

    fn is_expired(&self, entry: &OpenTx, now: Instant) -> bool {
        !self.inner.idle.is_zero() && now.duration_since(entry.last_used) > self.inner.idle
    }

    fn register(&self, tx: Transaction) -> u64 {
        let id = tx.id().0;
        self.inner.open.lock().insert(
            id,
            OpenTx {
                tx,
                last_used: Instant::now(),
            },
        );
        id
    }

    /// Looks up an open transaction and marks it used.
    fn checkout(&self, id: u64) -> Result<Transaction, ServerError> {
        let now = Instant::now();
        let mut open = self.inner.open.lock();
        match open.get_mut(&id) {
            None => return Err(ServerError::TransactionNotFound(id)),
            Some(entry) if !self.is_expired(entry, now) => {
                entry.last_used = now;
                return Ok(entry.tx.clone());
            }
            Some(_) => {}
        }
        if let Some(entry) = open.remove(&id) {
            let _ = entry.tx.rollback();
            info!(tx_id = id, "http.tx_expired");
        }
        Err(ServerError::TransactionNotFound(id))
    }

    /// Removes an open transaction so the caller can finish it.
    fn take(&self, id: u64) -> Result<Transaction, ServerError> {
        let tx = self.checkout(id)?;
        self.inner.open.lock().remove(&id);
        Ok(tx)
    }

    fn forget(&self, id: u64) {
        self.inner.open.lock().remove(&id);
    }

    fn tx_info(&self, id: u64) -> TxInfo {
        TxInfo {
            id,
            expires_in_ms: self.inner.idle.as_millis() as u64,
        }
    }

    /// Rolls back transactions idle past the timeout. Returns how many.
    pub fn expire_idle(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<OpenTx> = {
            let mut open = self.inner.open.lock();
            let ids: Vec<u64> = open
                .iter()
                .filter(|(_, entry)| self.is_expired(entry, now))
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| open.remove(&id)).collect()
        };
        for entry in &expired {
            if let Err(err) = entry.tx.rollback() {
                warn!(tx_id = entry.tx.id().0, %err, "http.tx_expire_failed");
            }
        }
        expired.len()
    }

    /// Rolls back every open transaction.
    pub fn rollback_all(&self) {
        let open: Vec<OpenTx> = self.inner.open.lock().drain().map(|(_, e)| e).collect();
        for entry in open {
            let _ = entry.tx.rollback();
        }
    }
}

/// Periodically rolls back idle transactions. Does nothing when the
/// timeout is zero.
pub fn spawn_reaper(state: HttpState) -> JoinHandle<()> {
    let idle = state.inner.idle;
    tokio::spawn(async move {
        if idle.is_zero() {
            return;
        }
        let mut ticker = tokio::time::interval((idle / 2).max(Duration::from_millis(50)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let sweep = state.clone();
            match blocking(move || sweep.expire_idle()).await {
                Ok(0) => {}
                Ok(expired) => info!(expired, "http.tx_reaped"),
                Err(err) => warn!(%err, "http.reaper_failed"),
            }
        }
    })
}

/// Builds the HTTP router.
pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/db/:db/tx", post(open_handler))
        .route("/db/:db/tx/commit", post(autocommit_handler))
        .route("/db/:db/tx/:id", post(run_handler).delete(rollback_handler))
        .route("/db/:db/tx/:id/commit", post(commit_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

fn parse_statements(body: &Bytes) -> Result<Vec<StatementRequest>, ServerError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    serde_json::from_slice::<StatementsRequest>(body)
        .map(|request| request.statements)
        .map_err(|err| ServerError::Request(err.to_string()))
}

fn parse_tx_id(raw: &str) -> Result<u64, ServerError> {
    raw.parse()
        .map_err(|_| ServerError::Request(format!("`{raw}` is not a transaction id")))
}

fn stats_json(stats: &QueryStats) -> JsonValue {
    let mut value = serde_json::to_value(stats).unwrap_or_default();
    if let JsonValue::Object(map) = &mut value {
        map.insert("contains_updates".into(), stats.contains_updates().into());
    }
    value
}

fn result_json(result: &QueryResult) -> JsonValue {
    let data: Vec<JsonValue> = result
        .rows
        .iter()
        .map(|row| json!({ "row": row.iter().map(Value::to_json).collect::<Vec<_>>() }))
        .collect();
    let mut value = json!({
        "columns": result.columns,
        "data": data,
        "stats": stats_json(&result.stats),
    });
    if let (Some(plan), JsonValue::Object(map)) = (&result.plan, &mut value) {
        map.insert("plan".into(), JsonValue::String(plan.clone()));
    }
    value
}

/// Runs statements in order, stopping at the first error.
fn run_statements(
    db: &Database,
    tx: &Transaction,
    statements: Vec<StatementRequest>,
) -> (Vec<JsonValue>, Option<ServerError>) {
    let mut results = Vec::with_capacity(statements.len());
    for statement in statements {
        let params: Params = statement
            .parameters
            .iter()
            .map(|(k, v)| (k.clone(), Value::from_json(v)))
            .collect();
        match db.execute_in(tx, &statement.statement, &params) {
            Ok(result) => results.push(result_json(&result)),
            Err(err) => return (results, Some(err.into())),
        }
    }
    (results, None)
}

async fn health_handler(State(state): State<HttpState>) -> Result<Response, AppError> {
    let db = state.inner.db.clone();
    let report = blocking(move || db.health()).await?;
    let status = match report.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
    };
    Ok((status, Json(report)).into_response())
}

async fn open_handler(
    State(state): State<HttpState>,
    Path(db_name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    state.check_auth(&headers)?;
    let statements = parse_statements(&body)?;
    let db = state.inner.db.clone();
    let (tx, results, failed) = blocking(move || -> Result<_, ServerError> {
        let tx = db.begin()?;
        let (results, failed) = run_statements(&db, &tx, statements);
        if failed.is_some() {
            let _ = tx.rollback();
        }
        Ok((tx, results, failed))
    })
    .await??;
    if let Some(err) = failed {
        return Ok(Json(TxResponse::failed(results, &err)).into_response());
    }
    let id = state.register(tx);
    debug!(tx_id = id, db = %db_name, "http.tx_open");
    let location = format!("/db/{db_name}/tx/{id}");
    let response = TxResponse {
        results,
        commit: Some(format!("{location}/commit")),
        transaction: Some(state.tx_info(id)),
        ..TxResponse::default()
    };
    Ok((StatusCode::CREATED, [(header::LOCATION, location)], Json(response)).into_response())
}

async fn run_handler(
    State(state): State<HttpState>,
    Path((db_name, id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<TxResponse>, AppError> {
    state.check_auth(&headers)?;
    let id = parse_tx_id(&id)?;
    let statements = parse_statements(&body)?;
    let tx = state.checkout(id)?;
    let db = state.inner.db.clone();
    let (results, failed) = blocking(move || {
        let outcome = run_statements(&db, &tx, statements);
        if outcome.1.is_some() {
            let _ = tx.rollback();
        }
        outcome
    })
    .await?;
    if let Some(err) = failed {
        state.forget(id);
        return Ok(Json(TxResponse::failed(results, &err)));
    }
    Ok(Json(TxResponse {
        results,
        commit: Some(format!("/db/{db_name}/tx/{id}/commit")),
        transaction: Some(state.tx_info(id)),
        ..TxResponse::default()
    }))
}

async fn commit_handler(
    State(state): State<HttpState>,
    Path((_db, id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<TxResponse>, AppError> {
    state.check_auth(&headers)?;
    let id = parse_tx_id(&id)?;
    let statements = parse_statements(&body)?;
    let tx = state.take(id)?;
    let db = state.inner.db.clone();
    Ok(Json(blocking(move || finish(&db, &tx, statements)).await?))
}

async fn autocommit_handler(
    State(state): State<HttpState>,
    Path(_db): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<TxResponse>, AppError> {
    state.check_auth(&headers)?;
    let statements = parse_statements(&body)?;
    let db = state.inner.db.clone();
    let response = blocking(move || -> Result<_, ServerError> {
        let tx = db.begin()?;
        Ok(finish(&db, &tx, statements))
    })
    .await??;
    Ok(Json(response))
}

/// Runs the final statements of a transaction and commits it.
fn finish(db: &Database, tx: &Transaction, statements: Vec<StatementRequest>) -> TxResponse {
    let (results, failed) = run_statements(db, tx, statements);
    let outcome = match failed {
        Some(err) => {
            let _ = tx.rollback();
            Err(err)
        }
        None => tx.commit().map_err(ServerError::from),
    };
    match outcome {
        Ok(commit) => {
            debug!(tx_id = tx.id().0, commit, "http.tx_commit");
            TxResponse {
                results,
                ..TxResponse::default()
            }
        }
        Err(err) => TxResponse::failed(results, &err),
    }
}

async fn rollback_handler(
    State(state): State<HttpState>,
    Path((_db, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<TxResponse>, AppError> {
    state.check_auth(&headers)?;
    let id = parse_tx_id(&id)?;
    let tx = state.take(id)?;
    blocking(move || tx.rollback()).await??;
    debug!(tx_id = id, "http.tx_rollback");
    Ok(Json(TxResponse::default()))
}

struct AppError(ServerError);

impl<E> From<E> for AppError
where
    E: Into<ServerError>,
{
    fn from(err: E) -> Self {
        AppError(err.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ServerError::Unauthorized => StatusCode::UNAUTHORIZED,
            ServerError::TransactionNotFound(_) => StatusCode::NOT_FOUND,
            ServerError::Request(_) | ServerError::Protocol(_) | ServerError::Query(_) => {
                StatusCode::BAD_REQUEST
            }
            ServerError::Engine(err) if err.is_retryable() => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(err = %self.0, "http.request_failed");
        }
        let body = Json(TxResponse::failed(Vec::new(), &self.0));
        if status == StatusCode::UNAUTHORIZED {
            return (
                status,
                [(header::WWW_AUTHENTICATE, "Basic realm=\"engramdb\"")],
                body,
            )
                .into_response();
        }
        (status, body).into_response()
    }
}

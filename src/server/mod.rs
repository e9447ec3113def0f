//! Network front ends: Bolt over TCP and a transactional HTTP/JSON API.
//!
//! Each connection runs as its own task. Engine calls block, so they are
//! moved onto the blocking pool with `spawn_blocking`.

pub mod auth;
pub mod bolt;
pub mod http;
pub mod packstream;

use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;

use crate::db::Database;
use crate::logging::install_tracing_subscriber;
use crate::query::QueryError;
use crate::types::EngineError;

pub use auth::{AllowAll, Authenticator, BasicAuth};

/// Errors surfaced to protocol clients.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Socket or listener failure.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Statement failed.
    #[error(transparent)]
    Query(#[from] QueryError),
    /// Transaction-level failure.
    #[error(transparent)]
    Engine(#[from] EngineError),
    /// Credentials were missing or wrong.
    #[error("the client is unauthorized due to authentication failure")]
    Unauthorized,
    /// The client broke the wire protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// Malformed request body or message in the wrong state.
    #[error("invalid request: {0}")]
    Request(String),
    /// Unknown or expired HTTP transaction.
    #[error("transaction {0} not found or expired")]
    TransactionNotFound(u64),
    /// A blocking task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl ServerError {
    /// Neo4j-style status code.
    pub fn code(&self) -> &'static str {
        match self {
            ServerError::Query(err) => err.code(),
            ServerError::Engine(err) => err.code(),
            ServerError::Unauthorized => "Neo.ClientError.Security.Unauthorized",
            ServerError::Protocol(_) | ServerError::Request(_) => "Neo.ClientError.Request.Invalid",
            ServerError::TransactionNotFound(_) => "Neo.ClientError.Transaction.TransactionNotFound",
            ServerError::Io(_) | ServerError::Join(_) => "Neo.DatabaseError.General.UnknownError",
        }
    }

    /// Message safe to send to a client.
    pub fn client_message(&self) -> String {
        match self {
            ServerError::Io(_) | ServerError::Join(_) => "internal server error".to_owned(),
            ServerError::Engine(EngineError::Io(_)) => "internal storage error".to_owned(),
            ServerError::Query(QueryError::Execution(EngineError::Io(_))) => {
                "internal storage error".to_owned()
            }
            other => other.to_string(),
        }
    }
}

/// Runs `work` on the blocking pool.
pub(crate) async fn blocking<T, F>(work: F) -> Result<T, ServerError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    Ok(tokio::task::spawn_blocking(work).await?)
}

/// Serves Bolt and HTTP on the configured addresses until Ctrl-C.
pub async fn serve(db: Database) -> Result<(), ServerError> {
    install_tracing_subscriber();
    let server = db.config().server.clone();
    let auth = auth::from_config(&db.config().auth);

    let bolt_listener = TcpListener::bind(&server.bolt_addr).await?;
    let http_listener = TcpListener::bind(&server.http_addr).await?;
    tracing::info!(
        bolt = %bolt_listener.local_addr()?,
        http = %http_listener.local_addr()?,
        "server.listening"
    );

    let state = http::HttpState::new(db.clone(), Arc::clone(&auth));
    let reaper = http::spawn_reaper(state.clone());
    let bolt_task = tokio::spawn(bolt::accept_loop(bolt_listener, db.clone(), auth));

    let served = axum::serve(http_listener, http::router(state.clone()).into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await;

    bolt_task.abort();
    reaper.abort();
    state.rollback_all();
    tracing::info!("server.stopped");
    served?;
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("shutdown signal received"),
        Err(err) => tracing::error!(?err, "failed to listen for shutdown signal"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_details_stay_internal() {
        let err = ServerError::Io(std::io::Error::other("/var/lib/engram/wal.log: disk full"));
        assert_eq!(err.code(), "Neo.DatabaseError.General.UnknownError");
        assert!(!err.client_message().contains("wal.log"));
    }

    #[test]
    fn query_codes_pass_through() {
        let err = ServerError::from(QueryError::semantic("nope"));
        assert_eq!(err.code(), QueryError::semantic("nope").code());
    }
}

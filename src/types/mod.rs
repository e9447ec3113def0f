//! Identifiers, property values, and the engine-wide error type.

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};

mod checksum;
mod value;

pub use checksum::{Checksum, Crc32Fast};
pub use value::PropValue;

/// Identifier of a node. Never reused, stable across restarts.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

/// Identifier of an edge. Never reused, stable across restarts.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EdgeId(pub u64);

/// Identifier assigned to every transaction at `BEGIN`.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxId(pub u64);

/// Log sequence number of a WAL entry.
#[derive(
    Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Lsn(pub u64);

/// Commit identifier; equal to the LSN of the transaction's commit marker.
pub type CommitId = u64;

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key of a versioned entity, used by the lock table and conflict reports.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub enum EntityKey {
    /// A node.
    Node(NodeId),
    /// An edge.
    Edge(EdgeId),
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKey::Node(id) => write!(f, "node {id}"),
            EntityKey::Edge(id) => write!(f, "edge {id}"),
        }
    }
}

/// Errors raised by the storage engine, WAL, transaction manager and indexes.
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    /// Underlying file I/O failed.
    #[error("IO: {0}")]
    Io(#[from] io::Error),
    /// Persistent state failed validation beyond the crash boundary.
    #[error("storage corruption: {0}")]
    Corruption(&'static str),
    /// The requested entity does not exist in the caller's view.
    #[error("{0} not found")]
    NotFound(EntityKey),
    /// A uniqueness, policy or required-property rule was violated.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
    /// An edge references a node that does not exist.
    #[error("edge {edge} references missing node {node}")]
    DanglingReference {
        /// The offending edge.
        edge: EdgeId,
        /// The absent endpoint.
        node: NodeId,
    },
    /// A concurrent transaction already wrote the same entity.
    #[error("transaction {tx} conflicts with a concurrent write on {entity}")]
    TransactionConflict {
        /// The transaction that lost.
        tx: TxId,
        /// The contended entity.
        entity: EntityKey,
    },
    /// The transaction is no longer accepting operations.
    #[error("transaction {0} is not active")]
    TransactionClosed(TxId),
    /// An index returned an id the store cannot resolve.
    #[error("index drift: {0}")]
    IndexDrift(String),
    /// Invalid argument with a static description.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Invalid argument with a formatted description.
    #[error("invalid argument: {0}")]
    InvalidOwned(String),
    /// Payload (de)serialization failed.
    #[error("serialization: {0}")]
    Serialization(String),
    /// The operation was cancelled through its token.
    #[error("operation cancelled")]
    Cancelled,
    /// The operation exceeded its deadline.
    #[error("operation timed out")]
    Timeout,
    /// A WAL flush failed; the engine refuses writes until reopened.
    #[error("database halted after a failed log flush")]
    Halted,
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Returns `true` when retrying the whole transaction may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::TransactionConflict { .. })
    }

    /// Machine-readable status code, in the Neo4j status code namespace.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Io(_) => "Neo.DatabaseError.General.UnknownError",
            EngineError::Corruption(_) => "Neo.DatabaseError.General.StorageDamageDetected",
            EngineError::NotFound(_) => "Neo.ClientError.Statement.EntityNotFound",
            EngineError::ConstraintViolation(_) => "Neo.ClientError.Schema.ConstraintValidationFailed",
            EngineError::DanglingReference { .. } => "Neo.ClientError.Schema.ConstraintValidationFailed",
            EngineError::TransactionConflict { .. } => "Neo.TransientError.Transaction.Outdated",
            EngineError::TransactionClosed(_) => "Neo.ClientError.Transaction.TransactionNotFound",
            EngineError::IndexDrift(_) => "Neo.TransientError.General.DatabaseUnavailable",
            EngineError::Invalid(_) | EngineError::InvalidOwned(_) => {
                "Neo.ClientError.Statement.ArgumentError"
            }
            EngineError::Serialization(_) => "Neo.DatabaseError.General.UnknownError",
            EngineError::Cancelled => "Neo.TransientError.Transaction.Terminated",
            EngineError::Timeout => "Neo.ClientError.Transaction.TransactionTimedOut",
            EngineError::Halted => "Neo.DatabaseError.Transaction.TransactionCommitFailed",
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

/// Clones an error for fan-out to several waiters; I/O errors keep kind and message.
pub fn clone_error(err: &EngineError) -> EngineError {
    match err {
        EngineError::Io(io_err) => EngineError::Io(io::Error::new(io_err.kind(), io_err.to_string())),
        EngineError::Corruption(msg) => EngineError::Corruption(msg),
        EngineError::NotFound(key) => EngineError::NotFound(*key),
        EngineError::ConstraintViolation(msg) => EngineError::ConstraintViolation(msg.clone()),
        EngineError::DanglingReference { edge, node } => EngineError::DanglingReference {
            edge: *edge,
            node: *node,
        },
        EngineError::TransactionConflict { tx, entity } => EngineError::TransactionConflict {
            tx: *tx,
            entity: *entity,
        },
        EngineError::TransactionClosed(tx) => EngineError::TransactionClosed(*tx),
        EngineError::IndexDrift(msg) => EngineError::IndexDrift(msg.clone()),
        EngineError::Invalid(msg) => EngineError::Invalid(msg),
        EngineError::InvalidOwned(msg) => EngineError::InvalidOwned(msg.clone()),
        EngineError::Serialization(msg) => EngineError::Serialization(msg.clone()),
        EngineError::Cancelled => EngineError::Cancelled,
        EngineError::Timeout => EngineError::Timeout,
        EngineError::Halted => EngineError::Halted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_is_retryable_and_coded() {
        let err = EngineError::TransactionConflict {
            tx: TxId(7),
            entity: EntityKey::Node(NodeId(3)),
        };
        assert!(err.is_retryable());
        assert_eq!(err.code(), "Neo.TransientError.Transaction.Outdated");
        assert_eq!(
            err.to_string(),
            "transaction 7 conflicts with a concurrent write on node 3"
        );
    }

    #[test]
    fn clone_error_preserves_io_kind() {
        let err = EngineError::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "eof"));
        match clone_error(&err) {
            EngineError::Io(inner) => assert_eq!(inner.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected clone: {other:?}"),
        }
    }
}

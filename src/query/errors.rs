use std::fmt;

use thiserror::Error;

use crate::types::EngineError;

/// Errors raised while parsing, validating or executing a statement.
///
/// Parse and semantic errors fail the statement only; the enclosing
/// transaction stays usable. Execution errors carry the storage error that
/// caused them and may leave the transaction failed.
#[derive(Debug, Error)]
pub enum QueryError {
    /// The text is not valid query syntax.
    #[error("invalid input at line {line}, column {column}: {message}")]
    Parse {
        /// What the parser expected or found.
        message: String,
        /// 1-based line.
        line: usize,
        /// 1-based column.
        column: usize,
    },
    /// A variable was referenced before it was bound.
    #[error("variable `{0}` not defined")]
    UnboundVariable(String),
    /// A `$parameter` was referenced but not supplied.
    #[error("expected parameter(s): {0}")]
    MissingParameter(String),
    /// An operand or argument had the wrong type.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    /// Unknown scalar or aggregate function.
    #[error("unknown function `{0}`")]
    UnknownFunction(String),
    /// Unknown procedure in `CALL`.
    #[error("there is no procedure named `{0}`")]
    UnknownProcedure(String),
    /// Statement is well-formed but not meaningful.
    #[error("{0}")]
    Semantic(String),
    /// The storage engine rejected an operation.
    #[error(transparent)]
    Execution(#[from] EngineError),
}

impl QueryError {
    pub(crate) fn parse(message: impl Into<String>, line: usize, column: usize) -> Self {
        QueryError::Parse {
            message: message.into(),
            line,
            column,
        }
    }

    pub(crate) fn type_mismatch(message: impl Into<String>) -> Self {
        QueryError::TypeMismatch(message.into())
    }

    pub(crate) fn semantic(message: impl Into<String>) -> Self {
        QueryError::Semantic(message.into())
    }

    /// Neo4j-style status code.
    pub fn code(&self) -> &'static str {
        match self {
            QueryError::Parse { .. } => "Neo.ClientError.Statement.SyntaxError",
            QueryError::UnboundVariable(_) => "Neo.ClientError.Statement.SyntaxError",
            QueryError::MissingParameter(_) => "Neo.ClientError.Statement.ParameterMissing",
            QueryError::TypeMismatch(_) => "Neo.ClientError.Statement.TypeError",
            QueryError::UnknownFunction(_) => "Neo.ClientError.Statement.SyntaxError",
            QueryError::UnknownProcedure(_) => "Neo.ClientError.Procedure.ProcedureNotFound",
            QueryError::Semantic(_) => "Neo.ClientError.Statement.SemanticError",
            QueryError::Execution(err) => err.code(),
        }
    }

    /// Whether retrying the whole transaction may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, QueryError::Execution(err) if err.is_retryable())
    }

    /// Whether only the statement failed, leaving the transaction usable.
    pub fn is_statement_local(&self) -> bool {
        match self {
            QueryError::Execution(err) => matches!(
                err,
                EngineError::NotFound(_) | EngineError::Invalid(_) | EngineError::InvalidOwned(_)
            ),
            _ => true,
        }
    }
}

/// Formats an error with its status code, e.g. for CLI output.
pub struct QueryErrorWithCode<'a>(pub &'a QueryError);

impl fmt::Display for QueryErrorWithCode<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.0.code(), self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntityKey, NodeId, TxId};

    #[test]
    fn codes_follow_the_neo4j_namespace() {
        let parse = QueryError::parse("unexpected `)`", 1, 9);
        assert_eq!(parse.code(), "Neo.ClientError.Statement.SyntaxError");
        assert!(parse.to_string().contains("line 1, column 9"));
        let conflict = QueryError::from(EngineError::TransactionConflict {
            tx: TxId(1),
            entity: EntityKey::Node(NodeId(2)),
        });
        assert!(conflict.is_retryable());
        assert!(!conflict.is_statement_local());
        assert_eq!(
            format!("{}", QueryErrorWithCode(&conflict)),
            "[Neo.TransientError.Transaction.Outdated] transaction 1 conflicts with a concurrent write on node 2"
        );
    }
}

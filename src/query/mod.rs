//! openCypher subset: parsing, validation, planning and execution.
//!
//! Statements run inside a [`crate::db::Transaction`] through a
//! [`QueryEngine`]. Reads stream through a [`QueryCursor`]; writes go
//! through the transaction overlay and become visible to other
//! transactions only on commit.

/// Syntax tree of a statement.
pub mod ast;
mod engine;
/// Query errors and their status codes.
pub mod errors;
mod executor;
mod expr;
mod lexer;
/// Recursive-descent parser.
pub mod parser;
mod planner;
mod procedures;
/// Static checks on parsed statements.
pub mod validate;
/// Runtime values.
pub mod value;

pub use engine::QueryEngine;
pub use errors::{QueryError, QueryErrorWithCode};
pub use executor::{QueryCursor, QueryResult, QueryStats};
pub use parser::parse;
pub use procedures::{procedure_names, DEFAULT_TEXT_LIMIT};
pub use validate::{validate, Analysis};
pub use value::{Params, Path, Value};

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::ast::Statement;
use super::errors::QueryError;
use super::executor::{build, drain, ExecCtx, QueryCursor, QueryResult, Row};
use super::parser::parse;
use super::planner::plan;
use super::validate::{validate, Analysis};
use super::value::Params;
use crate::db::config::QueryConfig;
use crate::db::Transaction;

/// A parsed and validated statement.
#[derive(Debug)]
struct Prepared {
    statement: Statement,
    analysis: Analysis,
}

/// Parses, plans and runs Cypher statements against a transaction.
///
/// Parsed statements are kept in an LRU cache keyed by query text; plans
/// are rebuilt per execution so they follow current label statistics.
pub struct QueryEngine {
    cache: Option<Mutex<LruCache<String, Arc<Prepared>>>>,
}

impl std::fmt::Debug for QueryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryEngine")
            .field("cached", &self.cache.as_ref().map(|c| c.lock().len()))
            .finish()
    }
}

impl QueryEngine {
    /// Creates an engine; a zero `plan_cache` disables caching.
    pub fn new(config: &QueryConfig) -> Self {
        Self {
            cache: NonZeroUsize::new(config.plan_cache).map(|cap| Mutex::new(LruCache::new(cap))),
        }
    }

    fn prepare(&self, query: &str) -> Result<Arc<Prepared>, QueryError> {
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.lock().get(query) {
                trace!("query.cache_hit");
                return Ok(Arc::clone(hit));
            }
        }
        let statement = parse(query)?;
        let analysis = validate(&statement)?;
        let prepared = Arc::new(Prepared {
            statement,
            analysis,
        });
        if let Some(cache) = &self.cache {
            cache.lock().put(query.to_owned(), Arc::clone(&prepared));
        }
        Ok(prepared)
    }

    /// Runs `query` inside `tx` and collects every row.
    pub fn execute(&self, tx: &Transaction, query: &str, params: &Params) -> Result<QueryResult, QueryError> {
        self.open_cursor(tx, query, params)?.collect()
    }

    /// Runs `query` inside `tx`.
    ///
    /// Updating statements run to completion before this returns, under a
    /// savepoint: a statement-local error undoes only this statement's
    /// writes, anything else leaves the transaction failed. Read-only
    /// statements produce rows as the cursor is pulled.
    pub fn open_cursor(&self, tx: &Transaction, query: &str, params: &Params) -> Result<QueryCursor, QueryError> {
        if tx.is_failed() {
            return Err(QueryError::semantic(
                "the transaction has failed and can only be rolled back",
            ));
        }
        let prepared = self.prepare(query)?;
        let missing: Vec<&str> = prepared
            .analysis
            .params
            .iter()
            .filter(|name| !params.contains_key(*name))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(QueryError::MissingParameter(missing.join(", ")));
        }

        let planned = plan(&prepared.statement, tx)?;
        let mut ctx = ExecCtx::new(tx.clone(), params.clone(), tx.config());
        if prepared.statement.explain {
            let text = planned.plan.to_string();
            return Ok(QueryCursor::buffered(planned.columns, Default::default(), ctx, Some(text)));
        }

        let mut stream = build(&planned.plan, Row::new())?;
        if !prepared.statement.is_updating() {
            return Ok(QueryCursor::lazy(planned.columns, stream, ctx));
        }

        tx.savepoint()?;
        match drain(&mut stream, &mut ctx) {
            Ok(rows) => {
                tx.release_savepoint();
                debug!(tx_id = tx.id().0, stats = ?ctx.stats, "query.write");
                Ok(QueryCursor::buffered(planned.columns, rows, ctx, None))
            }
            Err(err) => {
                tx.rollback_to_savepoint();
                if let QueryError::Execution(engine) = &err {
                    if !err.is_statement_local() {
                        tx.mark_failed(engine);
                    }
                }
                debug!(tx_id = tx.id().0, %err, "query.write_failed");
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Config, Database};
    use crate::query::Value;

    fn db() -> Database {
        Database::open_in_memory(Config::default()).unwrap()
    }

    #[test]
    fn statement_errors_keep_earlier_writes() {
        let db = db();
        let tx = db.begin().unwrap();
        db.execute_in(&tx, "CREATE (:Memory {text: 'kept'})", &Params::new())
            .unwrap();
        let err = db
            .execute_in(&tx, "CREATE (:Memory {text: 'dropped'}) WITH 1 AS x RETURN x / 0", &Params::new())
            .unwrap_err();
        assert!(err.is_statement_local(), "{err}");
        let result = db
            .execute_in(&tx, "MATCH (m:Memory) RETURN m.text AS text", &Params::new())
            .unwrap();
        assert_eq!(result.rows, vec![vec![Value::from("kept")]]);
        tx.commit().unwrap();
    }

    #[test]
    fn missing_parameters_are_reported_by_name() {
        let db = db();
        let tx = db.begin().unwrap();
        let err = db
            .execute_in(&tx, "MATCH (n) WHERE n.a = $a AND n.b = $b RETURN n", &Params::new())
            .unwrap_err();
        assert!(matches!(err, QueryError::MissingParameter(ref names) if names == "a, b"));
    }

    #[test]
    fn explain_renders_without_running() {
        let db = db();
        let tx = db.begin().unwrap();
        let result = db
            .execute_in(&tx, "EXPLAIN CREATE (n:Memory) RETURN n", &Params::new())
            .unwrap();
        assert!(result.rows.is_empty());
        assert!(result.plan.unwrap().contains("Create"));
        assert!(!result.stats.contains_updates());
        let count = db
            .execute_in(&tx, "MATCH (n) RETURN count(n) AS c", &Params::new())
            .unwrap();
        assert_eq!(count.rows, vec![vec![Value::Int(0)]]);
    }

    #[test]
    fn cache_can_be_disabled() {
        let engine = QueryEngine::new(&QueryConfig {
            plan_cache: 0,
            ..QueryConfig::default()
        });
        assert!(engine.cache.is_none());
    }
}

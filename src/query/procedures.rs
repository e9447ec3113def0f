//! Built-in procedures callable with `CALL`.

use super::errors::QueryError;
use super::executor::{shortest_paths, ExecCtx, PathSearch};
use super::value::Value;
use crate::storage::Direction;
use crate::types::NodeId;

/// Rows returned when a full-text query does not pass a `limit` option.
pub const DEFAULT_TEXT_LIMIT: usize = 100;

/// A procedure: fixed outputs, rows computed from evaluated arguments.
pub(crate) trait Procedure: Send + Sync {
    /// Dotted name used in `CALL`.
    fn name(&self) -> &'static str;
    /// Output column names in order.
    fn outputs(&self) -> &'static [&'static str];
    /// Accepted argument counts.
    fn arity(&self) -> (usize, usize);
    /// Runs the procedure; each row has one value per output.
    fn call(&self, ctx: &mut ExecCtx, args: &[Value]) -> Result<Vec<Vec<Value>>, QueryError>;
}

static PROCEDURES: &[&dyn Procedure] = &[
    &FulltextQueryNodes,
    &VectorQueryNodes,
    &HybridQueryNodes,
    &ShortestPathProcedure,
    &Labels,
    &RelationshipTypes,
];

/// Procedure registered under `name`.
pub(crate) fn lookup(name: &str) -> Option<&'static dyn Procedure> {
    PROCEDURES.iter().copied().find(|p| p.name() == name)
}

/// Names of all built-in procedures.
pub fn procedure_names() -> impl Iterator<Item = &'static str> {
    PROCEDURES.iter().map(|p| p.name())
}

fn arg<'a>(args: &'a [Value], idx: usize, proc: &str) -> Result<&'a Value, QueryError> {
    args.get(idx)
        .ok_or_else(|| QueryError::semantic(format!("{proc}: missing argument {}", idx + 1)))
}

fn string_arg(args: &[Value], idx: usize, proc: &str) -> Result<String, QueryError> {
    match arg(args, idx, proc)? {
        Value::String(s) => Ok(s.clone()),
        other => Err(QueryError::type_mismatch(format!(
            "{proc}: argument {} must be a String, got {}",
            idx + 1,
            other.type_name()
        ))),
    }
}

fn count_arg(args: &[Value], idx: usize, proc: &str) -> Result<usize, QueryError> {
    match arg(args, idx, proc)? {
        Value::Int(k) if *k >= 0 => Ok(*k as usize),
        other => Err(QueryError::type_mismatch(format!(
            "{proc}: argument {} must be a non-negative Integer, got {other}",
            idx + 1
        ))),
    }
}

fn vector_arg(value: &Value, proc: &str) -> Result<Vec<f32>, QueryError> {
    value.as_vector().ok_or_else(|| {
        QueryError::type_mismatch(format!(
            "{proc}: embedding must be a list of numbers, got {}",
            value.type_name()
        ))
    })
}

fn node_arg(args: &[Value], idx: usize, proc: &str) -> Result<Option<NodeId>, QueryError> {
    match arg(args, idx, proc)? {
        Value::Null => Ok(None),
        Value::Node(node) => Ok(Some(node.id)),
        Value::Int(id) if *id >= 0 => Ok(Some(NodeId(*id as u64))),
        other => Err(QueryError::type_mismatch(format!(
            "{proc}: argument {} must be a Node or node id, got {}",
            idx + 1,
            other.type_name()
        ))),
    }
}

fn scored(hits: Vec<(std::sync::Arc<crate::storage::NodeRecord>, f32)>) -> Vec<Vec<Value>> {
    hits.into_iter()
        .map(|(node, score)| vec![Value::Node(node), Value::Float(f64::from(score))])
        .collect()
}

/// `db.index.fulltext.queryNodes(indexName, query [, {limit}])`.
struct FulltextQueryNodes;

impl Procedure for FulltextQueryNodes {
    fn name(&self) -> &'static str {
        "db.index.fulltext.queryNodes"
    }

    fn outputs(&self) -> &'static [&'static str] {
        &["node", "score"]
    }

    fn arity(&self) -> (usize, usize) {
        (2, 3)
    }

    fn call(&self, ctx: &mut ExecCtx, args: &[Value]) -> Result<Vec<Vec<Value>>, QueryError> {
        let index = string_arg(args, 0, self.name())?;
        ctx.tx.resolve_fulltext_index(&index)?;
        let query = string_arg(args, 1, self.name())?;
        let limit = match args.get(2) {
            None | Some(Value::Null) => DEFAULT_TEXT_LIMIT,
            Some(Value::Map(options)) => match options.get("limit") {
                None | Some(Value::Null) => DEFAULT_TEXT_LIMIT,
                Some(Value::Int(n)) if *n >= 0 => *n as usize,
                Some(other) => {
                    return Err(QueryError::type_mismatch(format!(
                        "{}: limit must be a non-negative Integer, got {other}",
                        self.name()
                    )))
                }
            },
            Some(other) => {
                return Err(QueryError::type_mismatch(format!(
                    "{}: options must be a Map, got {}",
                    self.name(),
                    other.type_name()
                )))
            }
        };
        Ok(scored(ctx.tx.fulltext_search(&query, limit)?))
    }
}

/// `db.index.vector.queryNodes(indexName, k, embedding)`.
struct VectorQueryNodes;

impl Procedure for VectorQueryNodes {
    fn name(&self) -> &'static str {
        "db.index.vector.queryNodes"
    }

    fn outputs(&self) -> &'static [&'static str] {
        &["node", "score"]
    }

    fn arity(&self) -> (usize, usize) {
        (3, 3)
    }

    fn call(&self, ctx: &mut ExecCtx, args: &[Value]) -> Result<Vec<Vec<Value>>, QueryError> {
        let index = string_arg(args, 0, self.name())?;
        ctx.tx.resolve_vector_index(&index)?;
        let k = count_arg(args, 1, self.name())?;
        let embedding = vector_arg(arg(args, 2, self.name())?, self.name())?;
        Ok(scored(ctx.tx.vector_search(&embedding, k)?))
    }
}

/// `db.index.hybrid.queryNodes(query, embedding | null, k)`.
struct HybridQueryNodes;

impl Procedure for HybridQueryNodes {
    fn name(&self) -> &'static str {
        "db.index.hybrid.queryNodes"
    }

    fn outputs(&self) -> &'static [&'static str] {
        &["node", "score"]
    }

    fn arity(&self) -> (usize, usize) {
        (3, 3)
    }

    fn call(&self, ctx: &mut ExecCtx, args: &[Value]) -> Result<Vec<Vec<Value>>, QueryError> {
        let query = string_arg(args, 0, self.name())?;
        let embedding = match arg(args, 1, self.name())? {
            Value::Null => None,
            value => Some(vector_arg(value, self.name())?),
        };
        let k = count_arg(args, 2, self.name())?;
        Ok(scored(ctx.tx.hybrid_search(&query, embedding.as_deref(), k)?))
    }
}

/// `db.shortestPath(source, target, maxHops)` over relationships of any
/// type in either direction.
struct ShortestPathProcedure;

impl Procedure for ShortestPathProcedure {
    fn name(&self) -> &'static str {
        "db.shortestPath"
    }

    fn outputs(&self) -> &'static [&'static str] {
        &["path", "length"]
    }

    fn arity(&self) -> (usize, usize) {
        (3, 3)
    }

    fn call(&self, ctx: &mut ExecCtx, args: &[Value]) -> Result<Vec<Vec<Value>>, QueryError> {
        let (Some(source), Some(target)) = (
            node_arg(args, 0, self.name())?,
            node_arg(args, 1, self.name())?,
        ) else {
            return Ok(Vec::new());
        };
        let max_hops = u32::try_from(count_arg(args, 2, self.name())?).unwrap_or(u32::MAX);
        let search = PathSearch {
            types: Vec::new(),
            direction: Direction::Both,
            min_hops: 0,
            max_hops: ctx.check_hops(max_hops)?,
            all: false,
        };
        let paths = shortest_paths(ctx, source, target, &search)?;
        Ok(paths
            .into_iter()
            .map(|path| {
                let len = path.len() as i64;
                vec![Value::Path(path), Value::Int(len)]
            })
            .collect())
    }
}

/// `db.labels()`.
struct Labels;

impl Procedure for Labels {
    fn name(&self) -> &'static str {
        "db.labels"
    }

    fn outputs(&self) -> &'static [&'static str] {
        &["label"]
    }

    fn arity(&self) -> (usize, usize) {
        (0, 0)
    }

    fn call(&self, ctx: &mut ExecCtx, _args: &[Value]) -> Result<Vec<Vec<Value>>, QueryError> {
        Ok(ctx
            .tx
            .labels()?
            .into_iter()
            .map(|label| vec![Value::String(label)])
            .collect())
    }
}

/// `db.relationshipTypes()`.
struct RelationshipTypes;

impl Procedure for RelationshipTypes {
    fn name(&self) -> &'static str {
        "db.relationshipTypes"
    }

    fn outputs(&self) -> &'static [&'static str] {
        &["relationshipType"]
    }

    fn arity(&self) -> (usize, usize) {
        (0, 0)
    }

    fn call(&self, ctx: &mut ExecCtx, _args: &[Value]) -> Result<Vec<Vec<Value>>, QueryError> {
        Ok(ctx
            .tx
            .relationship_types()?
            .into_iter()
            .map(|ty| vec![Value::String(ty)])
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_exposes_documented_procedures() {
        let names: Vec<_> = procedure_names().collect();
        for expected in [
            "db.index.fulltext.queryNodes",
            "db.index.vector.queryNodes",
            "db.index.hybrid.queryNodes",
            "db.shortestPath",
            "db.labels",
            "db.relationshipTypes",
        ] {
            assert!(names.contains(&expected), "missing {expected}");
        }
        assert_eq!(lookup("db.labels").unwrap().outputs(), &["label"]);
        assert!(lookup("db.Labels").is_none());
    }
}

//! Pull-based execution of planned queries.
//!
//! Every operator is a [`RowStream`] pulling rows from its input. Reading
//! operators stream; grouping, sorting and all writing operators drain
//! their input first so a statement never observes its own writes halfway
//! through a scan.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use tracing::trace;

use super::ast::{PatternPath, RelDirection, RemoveItem, SetItem};
use super::errors::QueryError;
use super::expr::{eval, eval_predicate};
use super::planner::{AggFunc, AggSpec, ExpandSpec, NodeMatch, Plan, ShortestSpec};
use super::procedures::{self, Procedure};
use super::value::{GroupKey, Params, Path, Value};
use crate::db::{Config, NodeScan, Transaction};
use crate::storage::{
    DeleteMode, Direction, EdgeRecord, NodeRecord, PropPatch, PropPatchOp, PropertyFilter,
    PropertyMap,
};
use crate::types::{EdgeId, EngineError, NodeId, PropValue};

/// Variable bindings of one intermediate result row.
pub(crate) type Row = BTreeMap<String, Value>;

/// Counters reported for updating statements.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct QueryStats {
    /// Nodes created.
    pub nodes_created: u64,
    /// Nodes deleted.
    pub nodes_deleted: u64,
    /// Relationships created.
    pub relationships_created: u64,
    /// Relationships deleted, including those removed by `DETACH DELETE`.
    pub relationships_deleted: u64,
    /// Property assignments and removals.
    pub properties_set: u64,
    /// Labels added.
    pub labels_added: u64,
    /// Labels removed.
    pub labels_removed: u64,
}

impl QueryStats {
    /// True when the statement changed the graph.
    pub fn contains_updates(&self) -> bool {
        *self != QueryStats::default()
    }
}

/// Fully materialised statement result.
#[derive(Clone, Debug, Default)]
pub struct QueryResult {
    /// Column names.
    pub columns: Vec<String>,
    /// One value per column per row.
    pub rows: Vec<Vec<Value>>,
    /// Update counters.
    pub stats: QueryStats,
    /// Rendered plan for `EXPLAIN`.
    pub plan: Option<String>,
}

/// State shared by all operators of one statement.
pub(crate) struct ExecCtx {
    pub(crate) tx: Transaction,
    pub(crate) params: Params,
    pub(crate) stats: QueryStats,
    /// Set once the statement wrote; entity reads then refresh their images.
    pub(crate) wrote: bool,
    pub(crate) deadline: Option<Instant>,
    pub(crate) max_hops: u32,
    pub(crate) embedding_property: String,
    pub(crate) delete_policy: DeleteMode,
    ticks: u32,
}

impl ExecCtx {
    pub(crate) fn new(tx: Transaction, params: Params, config: &Config) -> Self {
        Self {
            tx,
            params,
            stats: QueryStats::default(),
            wrote: false,
            deadline: config.query_timeout().map(|timeout| Instant::now() + timeout),
            max_hops: config.query.max_hops,
            embedding_property: config.vector.property.clone(),
            delete_policy: config.delete_policy,
            ticks: 0,
        }
    }

    /// Checks the statement deadline and transaction cancellation.
    pub(crate) fn tick(&mut self) -> Result<(), QueryError> {
        self.ticks = self.ticks.wrapping_add(1);
        if self.ticks % 64 != 1 {
            return Ok(());
        }
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(EngineError::Timeout.into());
        }
        self.tx.check_interrupt()?;
        Ok(())
    }

    /// Validates an explicit hop bound against the configured maximum.
    pub(crate) fn check_hops(&self, requested: u32) -> Result<u32, QueryError> {
        if requested > self.max_hops {
            return Err(QueryError::semantic(format!(
                "hop bound {requested} exceeds the configured maximum of {}",
                self.max_hops
            )));
        }
        Ok(requested)
    }
}

/// A source of rows.
pub(crate) trait RowStream: Send {
    fn try_next(&mut self, ctx: &mut ExecCtx) -> Result<Option<Row>, QueryError>;
}

pub(crate) type BoxStream = Box<dyn RowStream>;

/// Builds the operator tree for `plan`; [`Plan::Start`] yields `seed` once.
pub(crate) fn build(plan: &Plan, seed: Row) -> Result<BoxStream, QueryError> {
    Ok(match plan {
        Plan::Start => Box::new(Start { seed: Some(seed) }),
        Plan::NodeScan { input, node, hints } => Box::new(ScanNodes {
            input: build(input, seed)?,
            node: node.clone(),
            hints: hints.clone(),
            current: None,
        }),
        Plan::NodeById { input, node, id } => per_row(
            build(input, seed)?,
            NodeById {
                node: node.clone(),
                id: id.clone(),
            },
        ),
        Plan::CheckNode { input, node } => per_row(build(input, seed)?, CheckNode { node: node.clone() }),
        Plan::Expand { input, spec } => per_row(build(input, seed)?, Expand { spec: spec.clone() }),
        Plan::ShortestPath { input, spec } => {
            per_row(build(input, seed)?, Shortest { spec: spec.clone() })
        }
        Plan::BindPath {
            input,
            var,
            nodes,
            rels,
        } => per_row(
            build(input, seed)?,
            BindPath {
                var: var.clone(),
                nodes: nodes.clone(),
                rels: rels.clone(),
            },
        ),
        Plan::Filter { input, predicate } => per_row(
            build(input, seed)?,
            Filter {
                predicate: predicate.clone(),
            },
        ),
        Plan::Optional {
            input,
            inner,
            introduced,
        } => per_row(
            build(input, seed)?,
            Optional {
                inner: (**inner).clone(),
                introduced: introduced.clone(),
            },
        ),
        Plan::Unwind { input, expr, alias } => per_row(
            build(input, seed)?,
            Unwind {
                expr: expr.clone(),
                alias: alias.clone(),
            },
        ),
        Plan::Project { input, items } => per_row(build(input, seed)?, Project { items: items.clone() }),
        Plan::Select { input, columns } => per_row(
            build(input, seed)?,
            Select {
                columns: columns.clone(),
            },
        ),
        Plan::Aggregate { input, keys, aggs } => Box::new(Aggregate {
            input: build(input, seed)?,
            keys: keys.clone(),
            aggs: aggs.clone(),
            output: None,
        }),
        Plan::Distinct { input } => Box::new(Distinct {
            input: build(input, seed)?,
            seen: FxHashSet::default(),
        }),
        Plan::Sort { input, keys } => Box::new(Sort {
            input: build(input, seed)?,
            keys: keys.clone(),
            output: None,
        }),
        Plan::Skip { input, count } => Box::new(Skip {
            input: build(input, seed)?,
            count: count.clone(),
            remaining: None,
        }),
        Plan::Limit { input, count } => Box::new(Limit {
            input: build(input, seed)?,
            count: count.clone(),
            remaining: None,
        }),
        Plan::Create { input, patterns } => eager(
            build(input, seed)?,
            CreateWriter {
                patterns: patterns.clone(),
            },
        ),
        Plan::Merge {
            input,
            pattern,
            matcher,
            on_create,
            on_match,
        } => eager(
            build(input, seed)?,
            MergeWriter {
                pattern: pattern.clone(),
                matcher: (**matcher).clone(),
                on_create: on_create.clone(),
                on_match: on_match.clone(),
            },
        ),
        Plan::Set { input, items } => eager(build(input, seed)?, SetWriter { items: items.clone() }),
        Plan::Remove { input, items } => {
            eager(build(input, seed)?, RemoveWriter { items: items.clone() })
        }
        Plan::Delete {
            input,
            exprs,
            detach,
        } => eager(
            build(input, seed)?,
            DeleteWriter {
                exprs: exprs.clone(),
                detach: *detach,
                nodes: Vec::new(),
            },
        ),
        Plan::Call {
            input,
            procedure,
            args,
            yields,
        } => {
            let procedure = procedures::lookup(procedure)
                .ok_or_else(|| QueryError::UnknownProcedure(procedure.clone()))?;
            per_row(
                build(input, seed)?,
                Call {
                    procedure,
                    args: args.clone(),
                    yields: yields.clone(),
                },
            )
        }
    })
}

struct Start {
    seed: Option<Row>,
}

impl RowStream for Start {
    fn try_next(&mut self, _ctx: &mut ExecCtx) -> Result<Option<Row>, QueryError> {
        Ok(self.seed.take())
    }
}

/// Operators that turn each input row into zero or more output rows.
trait RowMapper: Send {
    fn map(&mut self, row: Row, ctx: &mut ExecCtx, out: &mut VecDeque<Row>) -> Result<(), QueryError>;
}

struct PerRow<M> {
    input: BoxStream,
    mapper: M,
    pending: VecDeque<Row>,
}

fn per_row<M: RowMapper + 'static>(input: BoxStream, mapper: M) -> BoxStream {
    Box::new(PerRow {
        input,
        mapper,
        pending: VecDeque::new(),
    })
}

impl<M: RowMapper> RowStream for PerRow<M> {
    fn try_next(&mut self, ctx: &mut ExecCtx) -> Result<Option<Row>, QueryError> {
        loop {
            if let Some(row) = self.pending.pop_front() {
                return Ok(Some(row));
            }
            let Some(row) = self.input.try_next(ctx)? else {
                return Ok(None);
            };
            ctx.tick()?;
            self.mapper.map(row, ctx, &mut self.pending)?;
        }
    }
}

/// Evaluates an inline property map. `None` when a value is null, since
/// nothing can equal null.
fn eval_props(
    expr: Option<&super::ast::Expr>,
    row: &Row,
    ctx: &ExecCtx,
) -> Result<Option<Vec<(String, Value)>>, QueryError> {
    let Some(expr) = expr else {
        return Ok(Some(Vec::new()));
    };
    match eval(expr, row, ctx)? {
        Value::Map(map) => {
            if map.values().any(Value::is_null) {
                return Ok(None);
            }
            Ok(Some(map.into_iter().collect()))
        }
        Value::Null => Ok(None),
        other => Err(QueryError::type_mismatch(format!(
            "expected a Map of properties, got {}",
            other.type_name()
        ))),
    }
}

fn node_prop(node: &NodeRecord, key: &str, ctx: &ExecCtx) -> Value {
    if key == ctx.embedding_property {
        return node.embedding.clone().map(Value::from).unwrap_or(Value::Null);
    }
    node.props.get(key).map(Value::from).unwrap_or(Value::Null)
}

fn node_matches(node: &NodeRecord, labels: &[String], props: &[(String, Value)], ctx: &ExecCtx) -> bool {
    labels.iter().all(|label| node.has_label(label))
        && props
            .iter()
            .all(|(key, value)| node_prop(node, key, ctx).equals(value) == Some(true))
}

fn edge_matches(edge: &EdgeRecord, props: &[(String, Value)]) -> bool {
    props.iter().all(|(key, value)| {
        edge.props
            .get(key)
            .map(Value::from)
            .unwrap_or(Value::Null)
            .equals(value)
            == Some(true)
    })
}

/// Node bound to `var`; `None` for null.
fn bound_node(row: &Row, var: &str) -> Result<Option<Arc<NodeRecord>>, QueryError> {
    match row.get(var) {
        None => Err(QueryError::UnboundVariable(var.to_owned())),
        Some(Value::Null) => Ok(None),
        Some(Value::Node(node)) => Ok(Some(Arc::clone(node))),
        Some(other) => Err(QueryError::type_mismatch(format!(
            "`{var}` must be a Node, got {}",
            other.type_name()
        ))),
    }
}

struct ScanNodes {
    input: BoxStream,
    node: NodeMatch,
    hints: Vec<(String, super::ast::Expr)>,
    current: Option<(Row, Vec<(String, Value)>, NodeScan)>,
}

impl ScanNodes {
    /// Opens the scan for one input row; `None` when it cannot match.
    fn open(&self, row: &Row, ctx: &ExecCtx) -> Result<Option<(Vec<(String, Value)>, NodeScan)>, QueryError> {
        let Some(mut props) = eval_props(self.node.props.as_ref(), row, ctx)? else {
            return Ok(None);
        };
        for (key, expr) in &self.hints {
            let value = eval(expr, row, ctx)?;
            if value.is_null() {
                return Ok(None);
            }
            props.push((key.clone(), value));
        }
        let mut filter = PropertyFilter::any();
        for (key, value) in &props {
            // Numbers compare across Integer and Float, so only exact kinds
            // are pushed into the store filter.
            match value {
                Value::String(s) if *key != ctx.embedding_property => {
                    filter = filter.eq(key.clone(), PropValue::String(s.clone()));
                }
                Value::Bool(b) => filter = filter.eq(key.clone(), PropValue::Bool(*b)),
                _ => {}
            }
        }
        let label = self.node.labels.first().map(String::as_str);
        Ok(Some((props, ctx.tx.scan_nodes(label, filter)?)))
    }
}

impl RowStream for ScanNodes {
    fn try_next(&mut self, ctx: &mut ExecCtx) -> Result<Option<Row>, QueryError> {
        loop {
            if let Some((row, props, scan)) = &mut self.current {
                for node in scan.by_ref() {
                    ctx.tick()?;
                    let node = node?;
                    if node_matches(&node, &self.node.labels, props, ctx) {
                        let mut out = row.clone();
                        out.insert(self.node.var.clone(), Value::Node(node));
                        return Ok(Some(out));
                    }
                }
                self.current = None;
            }
            let Some(row) = self.input.try_next(ctx)? else {
                return Ok(None);
            };
            if let Some((props, scan)) = self.open(&row, ctx)? {
                self.current = Some((row, props, scan));
            }
        }
    }
}

struct NodeById {
    node: NodeMatch,
    id: super::ast::Expr,
}

impl RowMapper for NodeById {
    fn map(&mut self, mut row: Row, ctx: &mut ExecCtx, out: &mut VecDeque<Row>) -> Result<(), QueryError> {
        let id = match eval(&self.id, &row, ctx)? {
            Value::Int(id) if id >= 0 => NodeId(id as u64),
            _ => return Ok(()),
        };
        let Some(props) = eval_props(self.node.props.as_ref(), &row, ctx)? else {
            return Ok(());
        };
        if let Some(node) = ctx.tx.node(id)? {
            if node_matches(&node, &self.node.labels, &props, ctx) {
                row.insert(self.node.var.clone(), Value::Node(node));
                out.push_back(row);
            }
        }
        Ok(())
    }
}

struct CheckNode {
    node: NodeMatch,
}

impl RowMapper for CheckNode {
    fn map(&mut self, row: Row, ctx: &mut ExecCtx, out: &mut VecDeque<Row>) -> Result<(), QueryError> {
        let Some(node) = bound_node(&row, &self.node.var)? else {
            return Ok(());
        };
        let Some(props) = eval_props(self.node.props.as_ref(), &row, ctx)? else {
            return Ok(());
        };
        let node = if ctx.wrote { ctx.tx.node(node.id)? } else { Some(node) };
        if node.is_some_and(|node| node_matches(&node, &self.node.labels, &props, ctx)) {
            out.push_back(row);
        }
        Ok(())
    }
}

/// Ids of relationships bound to `vars` in `row`, including list bindings.
fn used_edges(row: &Row, vars: &[String]) -> FxHashSet<EdgeId> {
    let mut used = FxHashSet::default();
    for var in vars {
        match row.get(var) {
            Some(Value::Relationship(edge)) => {
                used.insert(edge.id);
            }
            Some(Value::List(items)) => {
                used.extend(items.iter().filter_map(|item| match item {
                    Value::Relationship(edge) => Some(edge.id),
                    _ => None,
                }));
            }
            _ => {}
        }
    }
    used
}

struct Expand {
    spec: ExpandSpec,
}

/// Per-row constants of one expansion.
struct ExpandFrame {
    rel_props: Vec<(String, Value)>,
    to_props: Vec<(String, Value)>,
    target: Option<NodeId>,
    banned: FxHashSet<EdgeId>,
}

impl Expand {
    fn frame(&self, row: &Row, ctx: &ExecCtx) -> Result<Option<ExpandFrame>, QueryError> {
        let Some(rel_props) = eval_props(self.spec.rel_props.as_ref(), row, ctx)? else {
            return Ok(None);
        };
        let Some(to_props) = eval_props(self.spec.to.props.as_ref(), row, ctx)? else {
            return Ok(None);
        };
        let target = if self.spec.to_bound {
            match bound_node(row, &self.spec.to.var)? {
                Some(node) => Some(node.id),
                None => return Ok(None),
            }
        } else {
            None
        };
        Ok(Some(ExpandFrame {
            rel_props,
            to_props,
            target,
            banned: used_edges(row, &self.spec.unique_with),
        }))
    }

    /// The node at the far end when it satisfies the target constraints.
    fn reach(&self, id: NodeId, frame: &ExpandFrame, ctx: &ExecCtx) -> Result<Option<Arc<NodeRecord>>, QueryError> {
        if frame.target.is_some_and(|target| target != id) {
            return Ok(None);
        }
        Ok(ctx
            .tx
            .node(id)?
            .filter(|node| node_matches(node, &self.spec.to.labels, &frame.to_props, ctx)))
    }

    #[allow(clippy::too_many_arguments)]
    fn walk(
        &self,
        ctx: &mut ExecCtx,
        row: &Row,
        frame: &ExpandFrame,
        node: NodeId,
        (min, max): (u32, u32),
        trail: &mut Vec<Arc<EdgeRecord>>,
        out: &mut VecDeque<Row>,
    ) -> Result<(), QueryError> {
        let depth = trail.len() as u32;
        if depth >= min {
            if let Some(end) = self.reach(node, frame, ctx)? {
                let mut rels: Vec<Value> = trail.iter().cloned().map(Value::Relationship).collect();
                if !self.spec.forward {
                    rels.reverse();
                }
                let mut next = row.clone();
                next.insert(self.spec.rel.clone(), Value::List(rels));
                next.insert(self.spec.to.var.clone(), Value::Node(end));
                out.push_back(next);
            }
        }
        if depth >= max {
            return Ok(());
        }
        for (edge, other) in ctx.tx.expand(node, self.spec.direction, &self.spec.types)? {
            ctx.tick()?;
            if frame.banned.contains(&edge.id)
                || trail.iter().any(|used| used.id == edge.id)
                || !edge_matches(&edge, &frame.rel_props)
            {
                continue;
            }
            trail.push(edge);
            self.walk(ctx, row, frame, other, (min, max), trail, out)?;
            trail.pop();
        }
        Ok(())
    }
}

impl RowMapper for Expand {
    fn map(&mut self, row: Row, ctx: &mut ExecCtx, out: &mut VecDeque<Row>) -> Result<(), QueryError> {
        let Some(from) = bound_node(&row, &self.spec.from)? else {
            return Ok(());
        };
        let Some(frame) = self.frame(&row, ctx)? else {
            return Ok(());
        };
        if let Some((min, max)) = self.spec.hops {
            let max = match max {
                Some(max) => ctx.check_hops(max)?,
                None => ctx.max_hops,
            };
            let mut trail = Vec::new();
            return self.walk(ctx, &row, &frame, from.id, (min, max), &mut trail, out);
        }
        for (edge, other) in ctx.tx.expand(from.id, self.spec.direction, &self.spec.types)? {
            if frame.banned.contains(&edge.id) || !edge_matches(&edge, &frame.rel_props) {
                continue;
            }
            if let Some(end) = self.reach(other, &frame, ctx)? {
                let mut next = row.clone();
                next.insert(self.spec.rel.clone(), Value::Relationship(edge));
                next.insert(self.spec.to.var.clone(), Value::Node(end));
                out.push_back(next);
            }
        }
        Ok(())
    }
}

/// Parameters of a shortest-path search.
pub(crate) struct PathSearch {
    pub types: Vec<String>,
    pub direction: Direction,
    pub min_hops: u32,
    pub max_hops: u32,
    /// Return every path of minimal length instead of one.
    pub all: bool,
}

/// Breadth-first shortest paths from `from` to `to`.
pub(crate) fn shortest_paths(
    ctx: &mut ExecCtx,
    from: NodeId,
    to: NodeId,
    search: &PathSearch,
) -> Result<Vec<Path>, QueryError> {
    let Some(start) = ctx.tx.node(from)? else {
        return Ok(Vec::new());
    };
    if from == to {
        return Ok(if search.min_hops == 0 {
            vec![Path::single(start)]
        } else {
            Vec::new()
        });
    }
    let mut depth: FxHashMap<NodeId, u32> = FxHashMap::default();
    let mut parents: FxHashMap<NodeId, Vec<(Arc<EdgeRecord>, NodeId)>> = FxHashMap::default();
    depth.insert(from, 0);
    let mut frontier = vec![from];
    for level in 1..=search.max_hops {
        let mut next = Vec::new();
        for node in frontier {
            ctx.tick()?;
            for (edge, other) in ctx.tx.expand(node, search.direction, &search.types)? {
                match depth.get(&other) {
                    None => {
                        depth.insert(other, level);
                        parents.insert(other, vec![(edge, node)]);
                        next.push(other);
                    }
                    Some(&seen) if seen == level && search.all => {
                        parents.entry(other).or_default().push((edge, node));
                    }
                    Some(_) => {}
                }
            }
        }
        if depth.contains_key(&to) || next.is_empty() {
            break;
        }
        frontier = next;
    }
    if !depth.contains_key(&to) {
        return Ok(Vec::new());
    }

    let mut trails: Vec<Vec<Arc<EdgeRecord>>> = Vec::new();
    let mut stack: Vec<(NodeId, Vec<Arc<EdgeRecord>>)> = vec![(to, Vec::new())];
    while let Some((node, trail)) = stack.pop() {
        if node == from {
            let mut trail = trail;
            trail.reverse();
            trails.push(trail);
            if !search.all {
                break;
            }
            continue;
        }
        for (edge, parent) in parents.get(&node).into_iter().flatten() {
            let mut extended = trail.clone();
            extended.push(Arc::clone(edge));
            stack.push((*parent, extended));
        }
    }

    let mut paths = Vec::with_capacity(trails.len());
    for trail in trails {
        let mut path = Path::single(Arc::clone(&start));
        let mut current = from;
        for edge in trail {
            let next = edge.other(current).ok_or_else(|| {
                QueryError::semantic(format!("relationship {} is not incident to node {current}", edge.id))
            })?;
            path.nodes.push(ctx.tx.get_node(next)?);
            path.rels.push(edge);
            current = next;
        }
        paths.push(path);
    }
    trace!(from = from.0, to = to.0, found = paths.len(), "query.shortest_path");
    Ok(paths)
}

struct Shortest {
    spec: ShortestSpec,
}

impl RowMapper for Shortest {
    fn map(&mut self, row: Row, ctx: &mut ExecCtx, out: &mut VecDeque<Row>) -> Result<(), QueryError> {
        let (Some(from), Some(to)) = (bound_node(&row, &self.spec.from)?, bound_node(&row, &self.spec.to)?)
        else {
            return Ok(());
        };
        let max_hops = match self.spec.max_hops {
            Some(max) => ctx.check_hops(max)?,
            None => ctx.max_hops,
        };
        let search = PathSearch {
            types: self.spec.types.clone(),
            direction: self.spec.direction,
            min_hops: self.spec.min_hops,
            max_hops,
            all: self.spec.all,
        };
        for path in shortest_paths(ctx, from.id, to.id, &search)? {
            let mut next = row.clone();
            if let Some(rel) = &self.spec.rel {
                let rels = path.rels.iter().cloned().map(Value::Relationship).collect();
                next.insert(rel.clone(), Value::List(rels));
            }
            if let Some(var) = &self.spec.path {
                next.insert(var.clone(), Value::Path(path));
            }
            out.push_back(next);
        }
        Ok(())
    }
}

struct BindPath {
    var: String,
    nodes: Vec<String>,
    rels: Vec<String>,
}

impl BindPath {
    fn assemble(&self, row: &Row, ctx: &ExecCtx) -> Result<Value, QueryError> {
        let Some(first) = bound_node(row, &self.nodes[0])? else {
            return Ok(Value::Null);
        };
        let mut path = Path::single(Arc::clone(&first));
        let mut current = first.id;
        for rel in &self.rels {
            let steps: Vec<Arc<EdgeRecord>> = match row.get(rel) {
                Some(Value::Relationship(edge)) => vec![Arc::clone(edge)],
                Some(Value::List(items)) => items
                    .iter()
                    .filter_map(|item| match item {
                        Value::Relationship(edge) => Some(Arc::clone(edge)),
                        _ => None,
                    })
                    .collect(),
                _ => return Ok(Value::Null),
            };
            for edge in steps {
                let next = edge.other(current).ok_or_else(|| {
                    QueryError::semantic(format!(
                        "relationship {} is not incident to node {current}",
                        edge.id
                    ))
                })?;
                path.nodes.push(ctx.tx.get_node(next)?);
                path.rels.push(edge);
                current = next;
            }
        }
        Ok(Value::Path(path))
    }
}

impl RowMapper for BindPath {
    fn map(&mut self, mut row: Row, ctx: &mut ExecCtx, out: &mut VecDeque<Row>) -> Result<(), QueryError> {
        let path = self.assemble(&row, ctx)?;
        row.insert(self.var.clone(), path);
        out.push_back(row);
        Ok(())
    }
}

struct Filter {
    predicate: super::ast::Expr,
}

impl RowMapper for Filter {
    fn map(&mut self, row: Row, ctx: &mut ExecCtx, out: &mut VecDeque<Row>) -> Result<(), QueryError> {
        if eval_predicate(&self.predicate, &row, ctx)? {
            out.push_back(row);
        }
        Ok(())
    }
}

struct Optional {
    inner: Plan,
    introduced: Vec<String>,
}

impl RowMapper for Optional {
    fn map(&mut self, row: Row, ctx: &mut ExecCtx, out: &mut VecDeque<Row>) -> Result<(), QueryError> {
        let mut matches = build(&self.inner, row.clone())?;
        let before = out.len();
        while let Some(found) = matches.try_next(ctx)? {
            out.push_back(found);
        }
        if out.len() == before {
            let mut row = row;
            for var in &self.introduced {
                row.insert(var.clone(), Value::Null);
            }
            out.push_back(row);
        }
        Ok(())
    }
}

struct Unwind {
    expr: super::ast::Expr,
    alias: String,
}

impl RowMapper for Unwind {
    fn map(&mut self, row: Row, ctx: &mut ExecCtx, out: &mut VecDeque<Row>) -> Result<(), QueryError> {
        let items = match eval(&self.expr, &row, ctx)? {
            Value::List(items) => items,
            Value::Null => return Ok(()),
            single => vec![single],
        };
        for item in items {
            let mut next = row.clone();
            next.insert(self.alias.clone(), item);
            out.push_back(next);
        }
        Ok(())
    }
}

struct Project {
    items: Vec<(String, super::ast::Expr)>,
}

impl RowMapper for Project {
    fn map(&mut self, mut row: Row, ctx: &mut ExecCtx, out: &mut VecDeque<Row>) -> Result<(), QueryError> {
        let values = self
            .items
            .iter()
            .map(|(_, expr)| eval(expr, &row, ctx))
            .collect::<Result<Vec<_>, _>>()?;
        for ((alias, _), value) in self.items.iter().zip(values) {
            row.insert(alias.clone(), value);
        }
        out.push_back(row);
        Ok(())
    }
}

struct Select {
    columns: Vec<String>,
}

impl RowMapper for Select {
    fn map(&mut self, mut row: Row, _ctx: &mut ExecCtx, out: &mut VecDeque<Row>) -> Result<(), QueryError> {
        let selected = self
            .columns
            .iter()
            .map(|column| (column.clone(), row.remove(column).unwrap_or(Value::Null)))
            .collect();
        out.push_back(selected);
        Ok(())
    }
}

struct Call {
    procedure: &'static dyn Procedure,
    args: Vec<super::ast::Expr>,
    yields: Vec<(usize, String)>,
}

impl RowMapper for Call {
    fn map(&mut self, row: Row, ctx: &mut ExecCtx, out: &mut VecDeque<Row>) -> Result<(), QueryError> {
        let args = self
            .args
            .iter()
            .map(|arg| eval(arg, &row, ctx))
            .collect::<Result<Vec<_>, _>>()?;
        for mut record in self.procedure.call(ctx, &args)? {
            let mut next = row.clone();
            for (idx, alias) in &self.yields {
                let value = record
                    .get_mut(*idx)
                    .map(|v| std::mem::replace(v, Value::Null))
                    .unwrap_or(Value::Null);
                next.insert(alias.clone(), value);
            }
            out.push_back(next);
        }
        Ok(())
    }
}

/// Running state of one aggregate within one group.
struct Accumulator {
    spec: AggSpec,
    seen: FxHashSet<GroupKey>,
    state: AccState,
}

enum AccState {
    Count(i64),
    Sum { int: i64, float: f64, floating: bool },
    Avg { sum: f64, count: u64 },
    Extreme(Option<Value>),
    Collect(Vec<Value>),
}

impl Accumulator {
    fn new(spec: &AggSpec) -> Self {
        let state = match spec.func {
            AggFunc::Count => AccState::Count(0),
            AggFunc::Sum => AccState::Sum {
                int: 0,
                float: 0.0,
                floating: false,
            },
            AggFunc::Avg => AccState::Avg { sum: 0.0, count: 0 },
            AggFunc::Min | AggFunc::Max => AccState::Extreme(None),
            AggFunc::Collect => AccState::Collect(Vec::new()),
        };
        Self {
            spec: spec.clone(),
            seen: FxHashSet::default(),
            state,
        }
    }

    fn update(&mut self, value: Option<Value>) -> Result<(), QueryError> {
        let Some(value) = value else {
            // count(*)
            if let AccState::Count(n) = &mut self.state {
                *n += 1;
            }
            return Ok(());
        };
        if value.is_null() {
            return Ok(());
        }
        if self.spec.distinct && !self.seen.insert(value.group_key()) {
            return Ok(());
        }
        let func = self.spec.func;
        match &mut self.state {
            AccState::Count(n) => *n += 1,
            AccState::Sum {
                int,
                float,
                floating,
            } => match value {
                Value::Int(i) => match int.checked_add(i) {
                    Some(total) => *int = total,
                    None => {
                        *floating = true;
                        *float += i as f64;
                    }
                },
                Value::Float(f) => {
                    *floating = true;
                    *float += f;
                }
                other => {
                    return Err(QueryError::type_mismatch(format!(
                        "sum() expects numbers, got {}",
                        other.type_name()
                    )))
                }
            },
            AccState::Avg { sum, count } => match value.as_f64() {
                Some(f) => {
                    *sum += f;
                    *count += 1;
                }
                None => {
                    return Err(QueryError::type_mismatch(format!(
                        "avg() expects numbers, got {}",
                        value.type_name()
                    )))
                }
            },
            AccState::Extreme(best) => {
                let replace = match best {
                    None => true,
                    Some(current) => {
                        let ord = value
                            .compare(current)
                            .unwrap_or_else(|| value.order_cmp(current));
                        match func {
                            AggFunc::Min => ord.is_lt(),
                            _ => ord.is_gt(),
                        }
                    }
                };
                if replace {
                    *best = Some(value);
                }
            }
            AccState::Collect(items) => items.push(value),
        }
        Ok(())
    }

    fn finish(self) -> Value {
        match self.state {
            AccState::Count(n) => Value::Int(n),
            AccState::Sum {
                int,
                float,
                floating,
            } => {
                if floating {
                    Value::Float(float + int as f64)
                } else {
                    Value::Int(int)
                }
            }
            AccState::Avg { sum, count } => {
                if count == 0 {
                    Value::Null
                } else {
                    Value::Float(sum / count as f64)
                }
            }
            AccState::Extreme(best) => best.unwrap_or(Value::Null),
            AccState::Collect(items) => Value::List(items),
        }
    }
}

struct Aggregate {
    input: BoxStream,
    keys: Vec<(String, super::ast::Expr)>,
    aggs: Vec<(String, AggSpec)>,
    output: Option<VecDeque<Row>>,
}

impl Aggregate {
    fn compute(&mut self, ctx: &mut ExecCtx) -> Result<VecDeque<Row>, QueryError> {
        let mut index: FxHashMap<Vec<GroupKey>, usize> = FxHashMap::default();
        let mut groups: Vec<(Vec<Value>, Vec<Accumulator>)> = Vec::new();
        while let Some(row) = self.input.try_next(ctx)? {
            ctx.tick()?;
            let key_values = self
                .keys
                .iter()
                .map(|(_, expr)| eval(expr, &row, ctx))
                .collect::<Result<Vec<_>, _>>()?;
            let group_key: Vec<GroupKey> = key_values.iter().map(Value::group_key).collect();
            let slot = match index.get(&group_key) {
                Some(&slot) => slot,
                None => {
                    let accs = self.aggs.iter().map(|(_, spec)| Accumulator::new(spec)).collect();
                    groups.push((key_values, accs));
                    index.insert(group_key, groups.len() - 1);
                    groups.len() - 1
                }
            };
            let (_, accs) = &mut groups[slot];
            for acc in accs.iter_mut() {
                let value = match &acc.spec.arg {
                    Some(arg) => Some(eval(arg, &row, ctx)?),
                    None => None,
                };
                acc.update(value)?;
            }
        }
        if groups.is_empty() && self.keys.is_empty() {
            let accs = self.aggs.iter().map(|(_, spec)| Accumulator::new(spec)).collect();
            groups.push((Vec::new(), accs));
        }
        Ok(groups
            .into_iter()
            .map(|(key_values, accs)| {
                let mut row = Row::new();
                for ((alias, _), value) in self.keys.iter().zip(key_values) {
                    row.insert(alias.clone(), value);
                }
                for ((slot, _), acc) in self.aggs.iter().zip(accs) {
                    row.insert(slot.clone(), acc.finish());
                }
                row
            })
            .collect())
    }
}

impl RowStream for Aggregate {
    fn try_next(&mut self, ctx: &mut ExecCtx) -> Result<Option<Row>, QueryError> {
        if self.output.is_none() {
            self.output = Some(self.compute(ctx)?);
        }
        Ok(self.output.as_mut().and_then(VecDeque::pop_front))
    }
}

struct Distinct {
    input: BoxStream,
    seen: FxHashSet<Vec<GroupKey>>,
}

impl RowStream for Distinct {
    fn try_next(&mut self, ctx: &mut ExecCtx) -> Result<Option<Row>, QueryError> {
        while let Some(row) = self.input.try_next(ctx)? {
            let key: Vec<GroupKey> = row.values().map(Value::group_key).collect();
            if self.seen.insert(key) {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }
}

struct Sort {
    input: BoxStream,
    keys: Vec<(super::ast::Expr, bool)>,
    output: Option<VecDeque<Row>>,
}

impl RowStream for Sort {
    fn try_next(&mut self, ctx: &mut ExecCtx) -> Result<Option<Row>, QueryError> {
        if self.output.is_none() {
            let mut keyed = Vec::new();
            while let Some(row) = self.input.try_next(ctx)? {
                ctx.tick()?;
                let keys = self
                    .keys
                    .iter()
                    .map(|(expr, _)| eval(expr, &row, ctx))
                    .collect::<Result<Vec<_>, _>>()?;
                keyed.push((keys, row));
            }
            keyed.sort_by(|(a, _), (b, _)| {
                for ((x, y), (_, desc)) in a.iter().zip(b).zip(&self.keys) {
                    let ord = x.order_cmp(y);
                    let ord = if *desc { ord.reverse() } else { ord };
                    if ord.is_ne() {
                        return ord;
                    }
                }
                std::cmp::Ordering::Equal
            });
            self.output = Some(keyed.into_iter().map(|(_, row)| row).collect());
        }
        Ok(self.output.as_mut().and_then(VecDeque::pop_front))
    }
}

fn row_count(expr: &super::ast::Expr, ctx: &ExecCtx, clause: &str) -> Result<u64, QueryError> {
    match eval(expr, &Row::new(), ctx)? {
        Value::Int(n) if n >= 0 => Ok(n as u64),
        other => Err(QueryError::semantic(format!(
            "{clause} expects a non-negative Integer, got {other}"
        ))),
    }
}

struct Skip {
    input: BoxStream,
    count: super::ast::Expr,
    remaining: Option<u64>,
}

impl RowStream for Skip {
    fn try_next(&mut self, ctx: &mut ExecCtx) -> Result<Option<Row>, QueryError> {
        let mut remaining = match self.remaining {
            Some(n) => n,
            None => row_count(&self.count, ctx, "SKIP")?,
        };
        while remaining > 0 {
            if self.input.try_next(ctx)?.is_none() {
                self.remaining = Some(0);
                return Ok(None);
            }
            remaining -= 1;
        }
        self.remaining = Some(0);
        self.input.try_next(ctx)
    }
}

struct Limit {
    input: BoxStream,
    count: super::ast::Expr,
    remaining: Option<u64>,
}

impl RowStream for Limit {
    fn try_next(&mut self, ctx: &mut ExecCtx) -> Result<Option<Row>, QueryError> {
        let remaining = match self.remaining {
            Some(n) => n,
            None => row_count(&self.count, ctx, "LIMIT")?,
        };
        if remaining == 0 {
            self.remaining = Some(0);
            return Ok(None);
        }
        self.remaining = Some(remaining - 1);
        self.input.try_next(ctx)
    }
}

/// Writing operators: applied row by row after the input is drained.
trait RowWriter: Send {
    fn write(&mut self, row: Row, ctx: &mut ExecCtx, out: &mut VecDeque<Row>) -> Result<(), QueryError>;

    /// Runs after every row was written.
    fn finish(&mut self, _ctx: &mut ExecCtx) -> Result<(), QueryError> {
        Ok(())
    }
}

struct EagerWrite<W> {
    input: BoxStream,
    writer: W,
    output: Option<VecDeque<Row>>,
}

fn eager<W: RowWriter + 'static>(input: BoxStream, writer: W) -> BoxStream {
    Box::new(EagerWrite {
        input,
        writer,
        output: None,
    })
}

impl<W: RowWriter> RowStream for EagerWrite<W> {
    fn try_next(&mut self, ctx: &mut ExecCtx) -> Result<Option<Row>, QueryError> {
        if self.output.is_none() {
            let mut rows = Vec::new();
            while let Some(row) = self.input.try_next(ctx)? {
                rows.push(row);
            }
            let mut out = VecDeque::with_capacity(rows.len());
            for row in rows {
                ctx.tick()?;
                self.writer.write(row, ctx, &mut out)?;
            }
            self.writer.finish(ctx)?;
            self.output = Some(out);
        }
        Ok(self.output.as_mut().and_then(VecDeque::pop_front))
    }
}

/// Converts an evaluated map into stored properties, dropping nulls.
fn to_property_map(values: BTreeMap<String, Value>) -> Result<PropertyMap, QueryError> {
    values
        .into_iter()
        .filter(|(_, value)| !value.is_null())
        .map(|(key, value)| Ok((key, value.to_prop()?)))
        .collect()
}

fn eval_map(
    expr: Option<&super::ast::Expr>,
    row: &Row,
    ctx: &ExecCtx,
) -> Result<BTreeMap<String, Value>, QueryError> {
    let Some(expr) = expr else {
        return Ok(BTreeMap::new());
    };
    match eval(expr, row, ctx)? {
        Value::Map(map) => Ok(map),
        Value::Null => Ok(BTreeMap::new()),
        other => Err(QueryError::type_mismatch(format!(
            "expected a Map of properties, got {}",
            other.type_name()
        ))),
    }
}

/// Creates the unbound parts of `pattern`, binding new entities in `row`.
/// With `strict`, null property values are rejected instead of skipped.
fn create_path(pattern: &PatternPath, row: &mut Row, ctx: &mut ExecCtx, strict: bool) -> Result<(), QueryError> {
    let mut node_ids = Vec::with_capacity(pattern.steps.len() + 1);
    for node in pattern.nodes() {
        if let Some(var) = &node.var {
            if row.contains_key(var) {
                let bound = bound_node(row, var)?.ok_or_else(|| {
                    QueryError::semantic(format!("cannot create a relationship to null node `{var}`"))
                })?;
                node_ids.push(bound.id);
                continue;
            }
        }
        let values = eval_map(node.props.as_ref(), row, ctx)?;
        if strict {
            if let Some((key, _)) = values.iter().find(|(_, v)| v.is_null()) {
                return Err(QueryError::semantic(format!(
                    "cannot merge a node using null property value for `{key}`"
                )));
            }
        }
        let props = to_property_map(values)?;
        let set = props.len() as u64;
        let id = ctx.tx.create_node(node.labels.iter().cloned(), props)?;
        ctx.stats.nodes_created += 1;
        ctx.stats.labels_added += node.labels.len() as u64;
        ctx.stats.properties_set += set;
        if let Some(var) = &node.var {
            row.insert(var.clone(), Value::Node(ctx.tx.get_node(id)?));
        }
        node_ids.push(id);
    }
    let mut rels = Vec::with_capacity(pattern.steps.len());
    for (idx, (rel, _)) in pattern.steps.iter().enumerate() {
        let (left, right) = (node_ids[idx], node_ids[idx + 1]);
        let (src, dst) = match rel.direction {
            RelDirection::Left => (right, left),
            RelDirection::Right | RelDirection::Either => (left, right),
        };
        let ty = rel
            .types
            .first()
            .ok_or_else(|| QueryError::semantic("a created relationship needs exactly one type"))?;
        let values = eval_map(rel.props.as_ref(), row, ctx)?;
        if strict && values.values().any(Value::is_null) {
            return Err(QueryError::semantic(
                "cannot merge a relationship using a null property value",
            ));
        }
        let props = to_property_map(values)?;
        let set = props.len() as u64;
        let id = ctx.tx.create_edge(ty.clone(), src, dst, props)?;
        ctx.stats.relationships_created += 1;
        ctx.stats.properties_set += set;
        let edge = ctx.tx.get_edge(id)?;
        if let Some(var) = &rel.var {
            row.insert(var.clone(), Value::Relationship(Arc::clone(&edge)));
        }
        rels.push(edge);
    }
    if let Some(var) = &pattern.var {
        let mut nodes = Vec::with_capacity(node_ids.len());
        for id in &node_ids {
            nodes.push(ctx.tx.get_node(*id)?);
        }
        row.insert(var.clone(), Value::Path(Path { nodes, rels }));
    }
    ctx.wrote = true;
    Ok(())
}

struct CreateWriter {
    patterns: Vec<PatternPath>,
}

impl RowWriter for CreateWriter {
    fn write(&mut self, mut row: Row, ctx: &mut ExecCtx, out: &mut VecDeque<Row>) -> Result<(), QueryError> {
        for pattern in &self.patterns {
            create_path(pattern, &mut row, ctx, false)?;
        }
        out.push_back(row);
        Ok(())
    }
}

struct MergeWriter {
    pattern: PatternPath,
    matcher: Plan,
    on_create: Vec<SetItem>,
    on_match: Vec<SetItem>,
}

impl RowWriter for MergeWriter {
    fn write(&mut self, row: Row, ctx: &mut ExecCtx, out: &mut VecDeque<Row>) -> Result<(), QueryError> {
        let mut matches = build(&self.matcher, row.clone())?;
        let mut found = Vec::new();
        while let Some(matched) = matches.try_next(ctx)? {
            found.push(matched);
        }
        if found.is_empty() {
            let mut row = row;
            create_path(&self.pattern, &mut row, ctx, true)?;
            apply_set_items(&self.on_create, &mut row, ctx)?;
            out.push_back(row);
            return Ok(());
        }
        for mut matched in found {
            apply_set_items(&self.on_match, &mut matched, ctx)?;
            out.push_back(matched);
        }
        Ok(())
    }
}

enum Entity {
    Node(NodeId),
    Edge(EdgeId),
}

/// Entity bound to `var`; `None` for null.
fn entity(row: &Row, var: &str) -> Result<Option<Entity>, QueryError> {
    match row.get(var) {
        None => Err(QueryError::UnboundVariable(var.to_owned())),
        Some(Value::Null) => Ok(None),
        Some(Value::Node(node)) => Ok(Some(Entity::Node(node.id))),
        Some(Value::Relationship(edge)) => Ok(Some(Entity::Edge(edge.id))),
        Some(other) => Err(QueryError::type_mismatch(format!(
            "cannot update a {} bound to `{var}`",
            other.type_name()
        ))),
    }
}

/// Applies `patch` and rebinds `var` to the new image.
fn patch_entity(target: &Entity, var: &str, patch: &PropPatch, row: &mut Row, ctx: &mut ExecCtx) -> Result<(), QueryError> {
    let value = match target {
        Entity::Node(id) => Value::Node(ctx.tx.update_node(*id, patch)?),
        Entity::Edge(id) => Value::Relationship(ctx.tx.update_edge(*id, patch)?),
    };
    row.insert(var.to_owned(), value);
    ctx.wrote = true;
    Ok(())
}

/// Property map from a map value or the properties of an entity.
fn map_operand(value: Value, ctx: &ExecCtx) -> Result<BTreeMap<String, Value>, QueryError> {
    match value {
        Value::Map(map) => Ok(map),
        Value::Null => Ok(BTreeMap::new()),
        Value::Node(node) => {
            let mut map: BTreeMap<String, Value> =
                node.props.iter().map(|(k, v)| (k.clone(), Value::from(v))).collect();
            if let Some(embedding) = &node.embedding {
                map.insert(ctx.embedding_property.clone(), Value::from(embedding.clone()));
            }
            Ok(map)
        }
        Value::Relationship(edge) => Ok(edge
            .props
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(v)))
            .collect()),
        other => Err(QueryError::type_mismatch(format!(
            "expected a Map, got {}",
            other.type_name()
        ))),
    }
}

fn apply_set_items(items: &[SetItem], row: &mut Row, ctx: &mut ExecCtx) -> Result<(), QueryError> {
    for item in items {
        match item {
            SetItem::Property { var, key, value } => {
                let value = eval(value, row, ctx)?;
                let Some(target) = entity(row, var)? else {
                    continue;
                };
                let patch = PropPatch::new(vec![PropPatchOp::Set(key.clone(), value.to_prop()?)]);
                patch_entity(&target, var, &patch, row, ctx)?;
                ctx.stats.properties_set += 1;
            }
            SetItem::Replace { var, value } => {
                let value = eval(value, row, ctx)?;
                let Some(target) = entity(row, var)? else {
                    continue;
                };
                let map = map_operand(value, ctx)?;
                let set = map.len() as u64;
                let patch = PropPatch::new(vec![PropPatchOp::Replace(to_property_map(map)?)]);
                patch_entity(&target, var, &patch, row, ctx)?;
                ctx.stats.properties_set += set;
            }
            SetItem::Merge { var, value } => {
                let value = eval(value, row, ctx)?;
                let Some(target) = entity(row, var)? else {
                    continue;
                };
                let map = map_operand(value, ctx)?;
                let set = map.len() as u64;
                let ops = map
                    .into_iter()
                    .map(|(key, value)| Ok(PropPatchOp::Set(key, value.to_prop()?)))
                    .collect::<Result<Vec<_>, QueryError>>()?;
                patch_entity(&target, var, &PropPatch::new(ops), row, ctx)?;
                ctx.stats.properties_set += set;
            }
            SetItem::Labels { var, labels } => {
                let Some(node) = bound_node(row, var)? else {
                    continue;
                };
                let current = ctx.tx.get_node(node.id)?;
                let added: Vec<PropPatchOp> = labels
                    .iter()
                    .filter(|label| !current.has_label(label))
                    .map(|label| PropPatchOp::AddLabel(label.clone()))
                    .collect();
                ctx.stats.labels_added += added.len() as u64;
                patch_entity(&Entity::Node(node.id), var, &PropPatch::new(added), row, ctx)?;
            }
        }
    }
    Ok(())
}

struct SetWriter {
    items: Vec<SetItem>,
}

impl RowWriter for SetWriter {
    fn write(&mut self, mut row: Row, ctx: &mut ExecCtx, out: &mut VecDeque<Row>) -> Result<(), QueryError> {
        apply_set_items(&self.items, &mut row, ctx)?;
        out.push_back(row);
        Ok(())
    }
}

struct RemoveWriter {
    items: Vec<RemoveItem>,
}

impl RowWriter for RemoveWriter {
    fn write(&mut self, mut row: Row, ctx: &mut ExecCtx, out: &mut VecDeque<Row>) -> Result<(), QueryError> {
        for item in &self.items {
            match item {
                RemoveItem::Property { var, key } => {
                    let Some(target) = entity(&row, var)? else {
                        continue;
                    };
                    let present = match &target {
                        Entity::Node(id) => !node_prop(&*ctx.tx.get_node(*id)?, key, ctx).is_null(),
                        Entity::Edge(id) => ctx.tx.get_edge(*id)?.props.contains_key(key),
                    };
                    if present {
                        let patch = PropPatch::new(vec![PropPatchOp::Set(key.clone(), PropValue::Null)]);
                        patch_entity(&target, var, &patch, &mut row, ctx)?;
                        ctx.stats.properties_set += 1;
                    }
                }
                RemoveItem::Labels { var, labels } => {
                    let Some(node) = bound_node(&row, var)? else {
                        continue;
                    };
                    let current = ctx.tx.get_node(node.id)?;
                    let removed: Vec<PropPatchOp> = labels
                        .iter()
                        .filter(|label| current.has_label(label))
                        .map(|label| PropPatchOp::RemoveLabel(label.clone()))
                        .collect();
                    ctx.stats.labels_removed += removed.len() as u64;
                    patch_entity(&Entity::Node(node.id), var, &PropPatch::new(removed), &mut row, ctx)?;
                }
            }
        }
        out.push_back(row);
        Ok(())
    }
}

/// Deletes relationships as rows arrive and nodes once all rows are seen,
/// so a node and its relationships can be deleted by the same statement.
struct DeleteWriter {
    exprs: Vec<super::ast::Expr>,
    detach: bool,
    nodes: Vec<NodeId>,
}

impl DeleteWriter {
    fn delete_edge(&self, id: EdgeId, ctx: &mut ExecCtx) -> Result<(), QueryError> {
        if ctx.tx.edge(id)?.is_some() {
            ctx.tx.delete_edge(id)?;
            ctx.stats.relationships_deleted += 1;
            ctx.wrote = true;
        }
        Ok(())
    }

}

fn queue_node(nodes: &mut Vec<NodeId>, id: NodeId) {
    if !nodes.contains(&id) {
        nodes.push(id);
    }
}

impl RowWriter for DeleteWriter {
    fn write(&mut self, row: Row, ctx: &mut ExecCtx, out: &mut VecDeque<Row>) -> Result<(), QueryError> {
        for expr in &self.exprs {
            match eval(expr, &row, ctx)? {
                Value::Null => {}
                Value::Node(node) => queue_node(&mut self.nodes, node.id),
                Value::Relationship(edge) => self.delete_edge(edge.id, ctx)?,
                Value::Path(path) => {
                    for edge in &path.rels {
                        self.delete_edge(edge.id, ctx)?;
                    }
                    for node in &path.nodes {
                        queue_node(&mut self.nodes, node.id);
                    }
                }
                other => {
                    return Err(QueryError::type_mismatch(format!(
                        "cannot delete a {}",
                        other.type_name()
                    )))
                }
            }
        }
        out.push_back(row);
        Ok(())
    }

    fn finish(&mut self, ctx: &mut ExecCtx) -> Result<(), QueryError> {
        let mode = if self.detach {
            DeleteMode::Cascade
        } else {
            ctx.delete_policy
        };
        for id in std::mem::take(&mut self.nodes) {
            ctx.tick()?;
            if ctx.tx.node(id)?.is_none() {
                continue;
            }
            let incident = match mode {
                DeleteMode::Cascade => ctx.tx.edges_of(id, Direction::Both)?.len() as u64,
                DeleteMode::Restrict => 0,
            };
            ctx.tx.delete_node(id, mode)?;
            ctx.stats.nodes_deleted += 1;
            ctx.stats.relationships_deleted += incident;
            ctx.wrote = true;
        }
        Ok(())
    }
}

/// Current image of every entity inside `value`; deleted ones keep their
/// last image.
fn refresh(value: Value, ctx: &ExecCtx) -> Value {
    match value {
        Value::Node(node) => match ctx.tx.node(node.id) {
            Ok(Some(fresh)) => Value::Node(fresh),
            _ => Value::Node(node),
        },
        Value::Relationship(edge) => match ctx.tx.edge(edge.id) {
            Ok(Some(fresh)) => Value::Relationship(fresh),
            _ => Value::Relationship(edge),
        },
        Value::List(items) => Value::List(items.into_iter().map(|v| refresh(v, ctx)).collect()),
        Value::Map(map) => Value::Map(map.into_iter().map(|(k, v)| (k, refresh(v, ctx))).collect()),
        Value::Path(path) => Value::Path(Path {
            nodes: path
                .nodes
                .into_iter()
                .map(|n| match ctx.tx.node(n.id) {
                    Ok(Some(fresh)) => fresh,
                    _ => n,
                })
                .collect(),
            rels: path
                .rels
                .into_iter()
                .map(|r| match ctx.tx.edge(r.id) {
                    Ok(Some(fresh)) => fresh,
                    _ => r,
                })
                .collect(),
        }),
        other => other,
    }
}

enum Source {
    Buffered(VecDeque<Row>),
    Lazy(BoxStream),
}

/// Rows of one statement, produced as they are pulled.
///
/// Read-only statements run lazily inside [`QueryCursor::next_row`];
/// updating statements have already run to completion when the cursor is
/// returned.
pub struct QueryCursor {
    columns: Vec<String>,
    source: Source,
    ctx: ExecCtx,
    plan: Option<String>,
    finished: bool,
}

impl std::fmt::Debug for QueryCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCursor")
            .field("columns", &self.columns)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl QueryCursor {
    pub(crate) fn buffered(columns: Vec<String>, rows: VecDeque<Row>, ctx: ExecCtx, plan: Option<String>) -> Self {
        Self {
            columns,
            source: Source::Buffered(rows),
            ctx,
            plan,
            finished: false,
        }
    }

    pub(crate) fn lazy(columns: Vec<String>, stream: BoxStream, ctx: ExecCtx) -> Self {
        Self {
            columns,
            source: Source::Lazy(stream),
            ctx,
            plan: None,
            finished: false,
        }
    }

    /// Column names, in output order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Counters accumulated so far.
    pub fn stats(&self) -> &QueryStats {
        &self.ctx.stats
    }

    /// Rendered plan, for `EXPLAIN` statements.
    pub fn plan(&self) -> Option<&str> {
        self.plan.as_deref()
    }

    /// Pulls the next row. After an error the cursor is exhausted, and an
    /// error that cannot be confined to the statement fails the transaction.
    pub fn next_row(&mut self) -> Result<Option<Vec<Value>>, QueryError> {
        if self.finished {
            return Ok(None);
        }
        let next = match &mut self.source {
            Source::Buffered(rows) => Ok(rows.pop_front()),
            Source::Lazy(stream) => stream.try_next(&mut self.ctx),
        };
        match next {
            Ok(Some(row)) => Ok(Some(self.shape(row))),
            Ok(None) => {
                self.finished = true;
                Ok(None)
            }
            Err(err) => {
                self.finished = true;
                if let QueryError::Execution(engine) = &err {
                    if !err.is_statement_local() {
                        self.ctx.tx.mark_failed(engine);
                    }
                }
                Err(err)
            }
        }
    }

    fn shape(&self, mut row: Row) -> Vec<Value> {
        self.columns
            .iter()
            .map(|column| {
                let value = row.remove(column).unwrap_or(Value::Null);
                if self.ctx.wrote {
                    refresh(value, &self.ctx)
                } else {
                    value
                }
            })
            .collect()
    }

    /// Drains the remaining rows into a [`QueryResult`].
    pub fn collect(mut self) -> Result<QueryResult, QueryError> {
        let mut rows = Vec::new();
        while let Some(row) = self.next_row()? {
            rows.push(row);
        }
        Ok(QueryResult {
            columns: self.columns,
            rows,
            stats: self.ctx.stats,
            plan: self.plan,
        })
    }
}

impl Iterator for QueryCursor {
    type Item = Result<Vec<Value>, QueryError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_row().transpose()
    }
}

/// Drains a stream; used for updating statements.
pub(crate) fn drain(stream: &mut BoxStream, ctx: &mut ExecCtx) -> Result<VecDeque<Row>, QueryError> {
    let mut rows = VecDeque::new();
    while let Some(row) = stream.try_next(ctx)? {
        rows.push_back(row);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn ctx_for(db: &Database) -> ExecCtx {
        ExecCtx::new(db.begin().unwrap(), Params::new(), db.config())
    }

    #[test]
    fn shortest_paths_prefers_fewest_hops() {
        let db = Database::open_in_memory(Config::default()).unwrap();
        let tx = db.begin().unwrap();
        let a = tx.create_node(["Memory"], PropertyMap::new()).unwrap();
        let b = tx.create_node(["Memory"], PropertyMap::new()).unwrap();
        let c = tx.create_node(["Memory"], PropertyMap::new()).unwrap();
        tx.create_edge("NEXT", a, b, PropertyMap::new()).unwrap();
        tx.create_edge("NEXT", b, c, PropertyMap::new()).unwrap();
        tx.create_edge("SKIP", a, c, PropertyMap::new()).unwrap();
        tx.commit().unwrap();

        let mut ctx = ctx_for(&db);
        let search = PathSearch {
            types: Vec::new(),
            direction: Direction::Outgoing,
            min_hops: 1,
            max_hops: 5,
            all: false,
        };
        let paths = shortest_paths(&mut ctx, a, c, &search).unwrap();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].len(), 1);
        assert_eq!(paths[0].rels[0].ty, "SKIP");

        let typed = PathSearch {
            types: vec!["NEXT".into()],
            ..search
        };
        let paths = shortest_paths(&mut ctx, a, c, &typed).unwrap();
        assert_eq!(paths[0].len(), 2);
        assert_eq!(paths[0].nodes.last().unwrap().id, c);
    }

    #[test]
    fn zero_length_path_requires_zero_minimum() {
        let db = Database::open_in_memory(Config::default()).unwrap();
        let tx = db.begin().unwrap();
        let a = tx.create_node(["Memory"], PropertyMap::new()).unwrap();
        tx.commit().unwrap();

        let mut ctx = ctx_for(&db);
        let mut search = PathSearch {
            types: Vec::new(),
            direction: Direction::Both,
            min_hops: 1,
            max_hops: 3,
            all: false,
        };
        assert!(shortest_paths(&mut ctx, a, a, &search).unwrap().is_empty());
        search.min_hops = 0;
        let paths = shortest_paths(&mut ctx, a, a, &search).unwrap();
        assert_eq!(paths.len(), 1);
        assert!(paths[0].is_empty());
    }

    #[test]
    fn hop_bounds_above_configured_maximum_are_rejected() {
        let db = Database::open_in_memory(Config::default()).unwrap();
        let ctx = ctx_for(&db);
        assert_eq!(ctx.check_hops(3).unwrap(), 3);
        assert!(matches!(ctx.check_hops(ctx.max_hops + 1), Err(QueryError::Semantic(_))));
    }

    #[test]
    fn stats_report_updates() {
        let mut stats = QueryStats::default();
        assert!(!stats.contains_updates());
        stats.labels_removed = 1;
        assert!(stats.contains_updates());
    }
}

//! Turns a validated [`Statement`] into an operator tree.
//!
//! Each pattern is anchored at its cheapest node: an already bound variable,
//! then an `id(n) = ...` seek, then a label scan narrowed by property
//! equality, then a plain label scan, then a full node scan. The rest of the
//! pattern is reached by adjacency expansion outwards from the anchor.

use std::collections::BTreeSet;
use std::fmt;

use super::ast::{
    BinaryOp, Clause, Expr, NodePattern, PatternPath, Projection, RelDirection, RelPattern,
    RemoveItem, SetItem, ShortestKind, Statement, AGGREGATES,
};
use super::errors::QueryError;
use super::procedures;
use crate::db::Transaction;
use crate::storage::Direction;

/// Prefix of planner-generated variable names; never a valid identifier.
pub(crate) const HIDDEN_PREFIX: &str = "  ";

/// Store statistics consulted when choosing pattern anchors.
pub(crate) trait PlanStatistics {
    /// Nodes carrying `label`.
    fn label_count(&self, label: &str) -> u64;
    /// All nodes.
    fn node_count(&self) -> u64;
}

impl PlanStatistics for Transaction {
    fn label_count(&self, label: &str) -> u64 {
        self.estimate_label(label)
    }

    fn node_count(&self) -> u64 {
        self.estimate_nodes()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AggFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    Collect,
}

impl AggFunc {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name.to_ascii_lowercase().as_str() {
            "count" => AggFunc::Count,
            "sum" => AggFunc::Sum,
            "avg" => AggFunc::Avg,
            "min" => AggFunc::Min,
            "max" => AggFunc::Max,
            "collect" => AggFunc::Collect,
            _ => return None,
        })
    }
}

/// One aggregate call; `arg` is `None` for `count(*)`.
#[derive(Clone, Debug)]
pub(crate) struct AggSpec {
    pub func: AggFunc,
    pub distinct: bool,
    pub arg: Option<Expr>,
}

/// Node constraints checked when binding a variable.
#[derive(Clone, Debug)]
pub(crate) struct NodeMatch {
    pub var: String,
    pub labels: Vec<String>,
    pub props: Option<Expr>,
}

impl NodeMatch {
    fn new(var: &str, pattern: &NodePattern) -> Self {
        Self {
            var: var.to_owned(),
            labels: pattern.labels.clone(),
            props: pattern.props.clone(),
        }
    }

    fn is_unconstrained(&self) -> bool {
        self.labels.is_empty() && self.props.is_none()
    }
}

/// One relationship hop (or bounded run of hops) out of a bound node.
#[derive(Clone, Debug)]
pub(crate) struct ExpandSpec {
    pub from: String,
    pub rel: String,
    pub to: NodeMatch,
    pub to_bound: bool,
    pub types: Vec<String>,
    pub direction: Direction,
    pub rel_props: Option<Expr>,
    /// Relationship variables already matched in the same `MATCH`.
    pub unique_with: Vec<String>,
    /// `(min, max)` for variable-length hops.
    pub hops: Option<(u32, Option<u32>)>,
    /// Whether traversal follows the written order of the pattern.
    pub forward: bool,
}

/// Shortest-path search between two bound nodes.
#[derive(Clone, Debug)]
pub(crate) struct ShortestSpec {
    pub from: String,
    pub to: String,
    pub rel: Option<String>,
    pub path: Option<String>,
    pub types: Vec<String>,
    pub direction: Direction,
    pub min_hops: u32,
    pub max_hops: Option<u32>,
    pub all: bool,
}

/// Operator tree. Leaves are [`Plan::Start`], which yields the seed row.
#[derive(Clone, Debug)]
pub(crate) enum Plan {
    Start,
    NodeScan {
        input: Box<Plan>,
        node: NodeMatch,
        hints: Vec<(String, Expr)>,
    },
    NodeById {
        input: Box<Plan>,
        node: NodeMatch,
        id: Expr,
    },
    CheckNode {
        input: Box<Plan>,
        node: NodeMatch,
    },
    Expand {
        input: Box<Plan>,
        spec: ExpandSpec,
    },
    ShortestPath {
        input: Box<Plan>,
        spec: ShortestSpec,
    },
    BindPath {
        input: Box<Plan>,
        var: String,
        nodes: Vec<String>,
        rels: Vec<String>,
    },
    Filter {
        input: Box<Plan>,
        predicate: Expr,
    },
    Optional {
        input: Box<Plan>,
        inner: Box<Plan>,
        introduced: Vec<String>,
    },
    Unwind {
        input: Box<Plan>,
        expr: Expr,
        alias: String,
    },
    Project {
        input: Box<Plan>,
        items: Vec<(String, Expr)>,
    },
    Select {
        input: Box<Plan>,
        columns: Vec<String>,
    },
    Aggregate {
        input: Box<Plan>,
        keys: Vec<(String, Expr)>,
        aggs: Vec<(String, AggSpec)>,
    },
    Distinct {
        input: Box<Plan>,
    },
    Sort {
        input: Box<Plan>,
        keys: Vec<(Expr, bool)>,
    },
    Skip {
        input: Box<Plan>,
        count: Expr,
    },
    Limit {
        input: Box<Plan>,
        count: Expr,
    },
    Create {
        input: Box<Plan>,
        patterns: Vec<PatternPath>,
    },
    Merge {
        input: Box<Plan>,
        pattern: PatternPath,
        matcher: Box<Plan>,
        on_create: Vec<SetItem>,
        on_match: Vec<SetItem>,
    },
    Set {
        input: Box<Plan>,
        items: Vec<SetItem>,
    },
    Remove {
        input: Box<Plan>,
        items: Vec<RemoveItem>,
    },
    Delete {
        input: Box<Plan>,
        exprs: Vec<Expr>,
        detach: bool,
    },
    Call {
        input: Box<Plan>,
        procedure: String,
        args: Vec<Expr>,
        yields: Vec<(usize, String)>,
    },
}

/// Plan plus the names of the columns it produces.
#[derive(Clone, Debug)]
pub(crate) struct PlannedQuery {
    pub plan: Plan,
    pub columns: Vec<String>,
}

/// Plans `stmt` using `stats` for anchor selection.
pub(crate) fn plan(stmt: &Statement, stats: &dyn PlanStatistics) -> Result<PlannedQuery, QueryError> {
    let mut planner = Planner {
        stats,
        scope: BTreeSet::new(),
        hidden: 0,
    };
    let mut plan = Plan::Start;
    let mut columns = Vec::new();
    for clause in &stmt.clauses {
        let (next, produced) = planner.clause(plan, clause)?;
        plan = next;
        columns = produced;
    }
    Ok(PlannedQuery { plan, columns })
}

struct Planner<'a> {
    stats: &'a dyn PlanStatistics,
    scope: BTreeSet<String>,
    hidden: u32,
}

fn boxed(plan: Plan) -> Box<Plan> {
    Box::new(plan)
}

fn is_hidden(name: &str) -> bool {
    name.starts_with(HIDDEN_PREFIX)
}

fn conjuncts(expr: &Expr, out: &mut Vec<Expr>) {
    match expr {
        Expr::Binary(BinaryOp::And, a, b) => {
            conjuncts(a, out);
            conjuncts(b, out);
        }
        other => out.push(other.clone()),
    }
}

fn direction(written: RelDirection, forward: bool) -> Direction {
    match (written, forward) {
        (RelDirection::Right, true) | (RelDirection::Left, false) => Direction::Outgoing,
        (RelDirection::Left, true) | (RelDirection::Right, false) => Direction::Incoming,
        (RelDirection::Either, _) => Direction::Both,
    }
}

/// Rebuilds `expr`, replacing every sub-expression for which `f` returns
/// a substitute.
fn rewrite(expr: &Expr, f: &mut dyn FnMut(&Expr) -> Option<Expr>) -> Expr {
    if let Some(replacement) = f(expr) {
        return replacement;
    }
    let mut sub = |e: &Expr| Box::new(rewrite(e, &mut *f));
    match expr {
        Expr::Literal(_) | Expr::Param(_) | Expr::Var(_) | Expr::CountStar => expr.clone(),
        Expr::Property(inner, key) => Expr::Property(sub(inner), key.clone()),
        Expr::Index(a, b) => {
            let a = sub(a);
            Expr::Index(a, sub(b))
        }
        Expr::Slice(a, from, to) => {
            let a = sub(a);
            let from = from.as_ref().map(|e| sub(e));
            let to = to.as_ref().map(|e| sub(e));
            Expr::Slice(a, from, to)
        }
        Expr::List(items) => Expr::List(items.iter().map(|e| *sub(e)).collect()),
        Expr::Map(entries) => Expr::Map(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), *sub(v)))
                .collect(),
        ),
        Expr::Unary(op, inner) => Expr::Unary(*op, sub(inner)),
        Expr::Binary(op, a, b) => {
            let a = sub(a);
            Expr::Binary(*op, a, sub(b))
        }
        Expr::IsNull(inner, negated) => Expr::IsNull(sub(inner), *negated),
        Expr::HasLabels(inner, labels) => Expr::HasLabels(sub(inner), labels.clone()),
        Expr::Call {
            name,
            distinct,
            args,
        } => Expr::Call {
            name: name.clone(),
            distinct: *distinct,
            args: args.iter().map(|e| *sub(e)).collect(),
        },
        Expr::Case {
            operand,
            branches,
            default,
        } => Expr::Case {
            operand: operand.as_ref().map(|e| sub(e)),
            branches: branches
                .iter()
                .map(|(w, t)| (*sub(w), *sub(t)))
                .collect(),
            default: default.as_ref().map(|e| sub(e)),
        },
    }
}

fn references(expr: &Expr, name: &str) -> bool {
    let mut found = false;
    expr.walk(&mut |e| {
        if matches!(e, Expr::Var(v) if v == name) {
            found = true;
        }
    });
    found
}

impl<'a> Planner<'a> {
    fn hidden_name(&mut self, kind: &str) -> String {
        self.hidden += 1;
        format!("{HIDDEN_PREFIX}{kind}{}", self.hidden)
    }

    fn clause(&mut self, input: Plan, clause: &Clause) -> Result<(Plan, Vec<String>), QueryError> {
        let plan = match clause {
            Clause::Match {
                optional: false,
                patterns,
                predicate,
            } => self.match_clause(input, patterns, predicate.as_ref())?,
            Clause::Match {
                optional: true,
                patterns,
                predicate,
            } => {
                let before = self.scope.clone();
                let inner = self.match_clause(Plan::Start, patterns, predicate.as_ref())?;
                let introduced = self
                    .scope
                    .difference(&before)
                    .cloned()
                    .collect();
                Plan::Optional {
                    input: boxed(input),
                    inner: boxed(inner),
                    introduced,
                }
            }
            Clause::Unwind { expr, alias } => {
                self.scope.insert(alias.clone());
                Plan::Unwind {
                    input: boxed(input),
                    expr: expr.clone(),
                    alias: alias.clone(),
                }
            }
            Clause::With(projection) => {
                let (plan, _) = self.projection(input, projection)?;
                match &projection.predicate {
                    Some(predicate) => Plan::Filter {
                        input: boxed(plan),
                        predicate: predicate.clone(),
                    },
                    None => plan,
                }
            }
            Clause::Return(projection) => return self.projection(input, projection),
            Clause::Create(patterns) => {
                for pattern in patterns {
                    self.declare_pattern(pattern);
                }
                Plan::Create {
                    input: boxed(input),
                    patterns: patterns.clone(),
                }
            }
            Clause::Merge {
                pattern,
                on_create,
                on_match,
            } => {
                let mut rel_vars = Vec::new();
                let matcher = self.match_path(Plan::Start, pattern, &[], &mut rel_vars)?;
                self.declare_pattern(pattern);
                Plan::Merge {
                    input: boxed(input),
                    pattern: pattern.clone(),
                    matcher: boxed(matcher),
                    on_create: on_create.clone(),
                    on_match: on_match.clone(),
                }
            }
            Clause::Set(items) => Plan::Set {
                input: boxed(input),
                items: items.clone(),
            },
            Clause::Remove(items) => Plan::Remove {
                input: boxed(input),
                items: items.clone(),
            },
            Clause::Delete { detach, exprs } => Plan::Delete {
                input: boxed(input),
                exprs: exprs.clone(),
                detach: *detach,
            },
            Clause::Call {
                procedure,
                args,
                yields,
                predicate,
            } => {
                let proc = procedures::lookup(procedure)
                    .ok_or_else(|| QueryError::UnknownProcedure(procedure.clone()))?;
                let outputs = proc.outputs();
                let yields: Vec<(usize, String)> = match yields {
                    Some(items) => items
                        .iter()
                        .map(|(name, alias)| {
                            outputs
                                .iter()
                                .position(|o| o == name)
                                .map(|idx| (idx, alias.clone()))
                                .ok_or_else(|| {
                                    QueryError::semantic(format!(
                                        "procedure `{procedure}` has no output `{name}`"
                                    ))
                                })
                        })
                        .collect::<Result<_, _>>()?,
                    None => outputs
                        .iter()
                        .enumerate()
                        .map(|(idx, name)| (idx, (*name).to_owned()))
                        .collect(),
                };
                let columns: Vec<String> = yields.iter().map(|(_, alias)| alias.clone()).collect();
                self.scope.extend(columns.iter().cloned());
                let mut plan = Plan::Call {
                    input: boxed(input),
                    procedure: procedure.clone(),
                    args: args.clone(),
                    yields,
                };
                if let Some(predicate) = predicate {
                    plan = Plan::Filter {
                        input: boxed(plan),
                        predicate: predicate.clone(),
                    };
                }
                return Ok((plan, columns));
            }
        };
        Ok((plan, Vec::new()))
    }

    fn declare_pattern(&mut self, pattern: &PatternPath) {
        for node in pattern.nodes() {
            if let Some(var) = &node.var {
                self.scope.insert(var.clone());
            }
        }
        for (rel, _) in &pattern.steps {
            if let Some(var) = &rel.var {
                self.scope.insert(var.clone());
            }
        }
        if let Some(var) = &pattern.var {
            self.scope.insert(var.clone());
        }
    }

    fn match_clause(
        &mut self,
        input: Plan,
        patterns: &[PatternPath],
        predicate: Option<&Expr>,
    ) -> Result<Plan, QueryError> {
        let mut terms = Vec::new();
        if let Some(predicate) = predicate {
            conjuncts(predicate, &mut terms);
        }
        let mut rel_vars = Vec::new();
        let mut plan = input;
        let ordered = patterns
            .iter()
            .filter(|p| p.shortest.is_none())
            .chain(patterns.iter().filter(|p| p.shortest.is_some()));
        for pattern in ordered {
            plan = self.match_path(plan, pattern, &terms, &mut rel_vars)?;
        }
        Ok(match predicate {
            Some(predicate) => Plan::Filter {
                input: boxed(plan),
                predicate: predicate.clone(),
            },
            None => plan,
        })
    }

    fn match_path(
        &mut self,
        input: Plan,
        path: &PatternPath,
        terms: &[Expr],
        rel_vars: &mut Vec<String>,
    ) -> Result<Plan, QueryError> {
        let nodes: Vec<&NodePattern> = path.nodes().collect();
        let node_names: Vec<String> = nodes
            .iter()
            .map(|n| n.var.clone().unwrap_or_else(|| self.hidden_name("node")))
            .collect();
        let rel_names: Vec<String> = path
            .steps
            .iter()
            .map(|(r, _)| r.var.clone().unwrap_or_else(|| self.hidden_name("rel")))
            .collect();

        if let Some(kind) = path.shortest {
            return self.shortest_path(input, path, kind, &nodes, &node_names, terms);
        }

        let anchor = (0..nodes.len())
            .min_by_key(|&idx| self.anchor_cost(nodes[idx], &node_names[idx], terms))
            .unwrap_or(0);
        let mut plan = self.anchor(input, nodes[anchor], &node_names[anchor], terms);
        for idx in anchor..path.steps.len() {
            let (rel, _) = &path.steps[idx];
            plan = self.expand(
                plan,
                rel,
                &rel_names[idx],
                &node_names[idx],
                (&node_names[idx + 1], nodes[idx + 1]),
                true,
                rel_vars,
            );
        }
        for idx in (0..anchor).rev() {
            let (rel, _) = &path.steps[idx];
            plan = self.expand(
                plan,
                rel,
                &rel_names[idx],
                &node_names[idx + 1],
                (&node_names[idx], nodes[idx]),
                false,
                rel_vars,
            );
        }
        if let Some(var) = &path.var {
            self.scope.insert(var.clone());
            plan = Plan::BindPath {
                input: boxed(plan),
                var: var.clone(),
                nodes: node_names,
                rels: rel_names,
            };
        }
        Ok(plan)
    }

    fn shortest_path(
        &mut self,
        input: Plan,
        path: &PatternPath,
        kind: ShortestKind,
        nodes: &[&NodePattern],
        node_names: &[String],
        terms: &[Expr],
    ) -> Result<Plan, QueryError> {
        let (rel, _) = &path.steps[0];
        if rel.props.is_some() {
            return Err(QueryError::semantic(
                "relationship properties are not supported in shortestPath",
            ));
        }
        let mut plan = self.anchor(input, nodes[0], &node_names[0], terms);
        plan = self.anchor(plan, nodes[1], &node_names[1], terms);
        let (min_hops, max_hops) = match rel.length {
            None => (1, Some(1)),
            Some((min, max)) => (min.unwrap_or(1), max),
        };
        if min_hops > 1 {
            return Err(QueryError::semantic(
                "shortestPath requires a minimal length of 0 or 1",
            ));
        }
        if let Some(var) = &rel.var {
            self.scope.insert(var.clone());
        }
        if let Some(var) = &path.var {
            self.scope.insert(var.clone());
        }
        Ok(Plan::ShortestPath {
            input: boxed(plan),
            spec: ShortestSpec {
                from: node_names[0].clone(),
                to: node_names[1].clone(),
                rel: rel.var.clone(),
                path: path.var.clone(),
                types: rel.types.clone(),
                direction: direction(rel.direction, true),
                min_hops,
                max_hops,
                all: kind == ShortestKind::All,
            },
        })
    }

    /// `id(var) = expr` where `expr` only uses variables bound earlier.
    fn id_seek(&self, var: &str, terms: &[Expr]) -> Option<Expr> {
        terms.iter().find_map(|term| {
            let Expr::Binary(BinaryOp::Eq, a, b) = term else {
                return None;
            };
            let is_id_of = |e: &Expr| {
                matches!(e, Expr::Call { name, args, .. }
                    if name.eq_ignore_ascii_case("id")
                        && matches!(args.as_slice(), [Expr::Var(v)] if v == var))
            };
            let other = if is_id_of(a) {
                b
            } else if is_id_of(b) {
                a
            } else {
                return None;
            };
            self.is_bound_expr(other, var).then(|| (**other).clone())
        })
    }

    fn is_bound_expr(&self, expr: &Expr, var: &str) -> bool {
        let mut ok = !references(expr, var) && !expr.contains_aggregate();
        expr.walk(&mut |e| {
            if let Expr::Var(name) = e {
                ok &= self.scope.contains(name);
            }
        });
        ok
    }

    /// `var.key = literal-or-parameter` terms usable as scan filters.
    fn property_hints(var: &str, terms: &[Expr]) -> Vec<(String, Expr)> {
        terms
            .iter()
            .filter_map(|term| {
                let Expr::Binary(BinaryOp::Eq, a, b) = term else {
                    return None;
                };
                let hint = |prop: &Expr, value: &Expr| match (prop, value) {
                    (Expr::Property(target, key), Expr::Literal(_) | Expr::Param(_))
                        if matches!(&**target, Expr::Var(v) if v == var) =>
                    {
                        Some((key.clone(), value.clone()))
                    }
                    _ => None,
                };
                hint(a, b).or_else(|| hint(b, a))
            })
            .collect()
    }

    fn anchor_cost(&self, node: &NodePattern, name: &str, terms: &[Expr]) -> u64 {
        if self.scope.contains(name) {
            return 0;
        }
        if self.id_seek(name, terms).is_some() {
            return 1;
        }
        let filtered = node.props.is_some() || !Self::property_hints(name, terms).is_empty();
        let base = match node.labels.iter().map(|l| self.stats.label_count(l)).min() {
            Some(count) => count,
            None => self.stats.node_count().saturating_add(1),
        };
        if filtered {
            base / 10 + 2
        } else {
            base.saturating_add(2)
        }
    }

    fn anchor(&mut self, input: Plan, node: &NodePattern, name: &str, terms: &[Expr]) -> Plan {
        let matcher = NodeMatch::new(name, node);
        if self.scope.contains(name) {
            if matcher.is_unconstrained() {
                return input;
            }
            return Plan::CheckNode {
                input: boxed(input),
                node: matcher,
            };
        }
        let plan = match self.id_seek(name, terms) {
            Some(id) => Plan::NodeById {
                input: boxed(input),
                node: matcher,
                id,
            },
            None => Plan::NodeScan {
                input: boxed(input),
                hints: Self::property_hints(name, terms),
                node: matcher,
            },
        };
        self.scope.insert(name.to_owned());
        plan
    }

    #[allow(clippy::too_many_arguments)]
    fn expand(
        &mut self,
        input: Plan,
        rel: &RelPattern,
        rel_name: &str,
        from: &str,
        (to_name, to_node): (&str, &NodePattern),
        forward: bool,
        rel_vars: &mut Vec<String>,
    ) -> Plan {
        let spec = ExpandSpec {
            from: from.to_owned(),
            rel: rel_name.to_owned(),
            to: NodeMatch::new(to_name, to_node),
            to_bound: self.scope.contains(to_name),
            types: rel.types.clone(),
            direction: direction(rel.direction, forward),
            rel_props: rel.props.clone(),
            unique_with: rel_vars.clone(),
            hops: rel.length.map(|(min, max)| (min.unwrap_or(1), max)),
            forward,
        };
        rel_vars.push(rel_name.to_owned());
        self.scope.insert(rel_name.to_owned());
        self.scope.insert(to_name.to_owned());
        Plan::Expand {
            input: boxed(input),
            spec,
        }
    }

    fn projection(&mut self, input: Plan, projection: &Projection) -> Result<(Plan, Vec<String>), QueryError> {
        let mut items: Vec<(String, Expr)> = Vec::new();
        if projection.star {
            for name in self.scope.iter().filter(|n| !is_hidden(n)) {
                items.push((name.clone(), Expr::Var(name.clone())));
            }
        }
        for item in &projection.items {
            items.retain(|(alias, _)| *alias != item.alias);
            items.push((item.alias.clone(), item.expr.clone()));
        }
        let columns: Vec<String> = items.iter().map(|(alias, _)| alias.clone()).collect();
        let order_keys: Vec<(Expr, bool)> = projection
            .order_by
            .iter()
            .map(|(key, desc)| {
                let key = rewrite(key, &mut |e| {
                    items
                        .iter()
                        .find(|(_, expr)| expr == e && !matches!(e, Expr::Var(_)))
                        .map(|(alias, _)| Expr::Var(alias.clone()))
                });
                (key, *desc)
            })
            .collect();

        let aggregating = items.iter().any(|(_, expr)| expr.contains_aggregate());
        let mut plan = if aggregating {
            let mut aggs: Vec<(String, AggSpec)> = Vec::new();
            let mut keys = Vec::new();
            let mut finals = Vec::new();
            for (alias, expr) in &items {
                if !expr.contains_aggregate() {
                    keys.push((alias.clone(), expr.clone()));
                    continue;
                }
                let rewritten = rewrite(expr, &mut |e| {
                    let spec = match e {
                        Expr::CountStar => AggSpec {
                            func: AggFunc::Count,
                            distinct: false,
                            arg: None,
                        },
                        Expr::Call {
                            name,
                            distinct,
                            args,
                        } if AGGREGATES.contains(&name.to_ascii_lowercase().as_str()) => AggSpec {
                            func: AggFunc::from_name(name)?,
                            distinct: *distinct,
                            arg: args.first().cloned(),
                        },
                        _ => return None,
                    };
                    self.hidden += 1;
                    let slot = format!("{HIDDEN_PREFIX}agg{}", self.hidden);
                    aggs.push((slot.clone(), spec));
                    Some(Expr::Var(slot))
                });
                finals.push((alias.clone(), rewritten));
            }
            let grouped = Plan::Aggregate {
                input: boxed(input),
                keys,
                aggs,
            };
            let projected = Plan::Project {
                input: boxed(grouped),
                items: finals,
            };
            Plan::Select {
                input: boxed(projected),
                columns: columns.clone(),
            }
        } else {
            let projected = Plan::Project {
                input: boxed(input),
                items: items.clone(),
            };
            if projection.distinct {
                Plan::Select {
                    input: boxed(projected),
                    columns: columns.clone(),
                }
            } else {
                projected
            }
        };
        if projection.distinct {
            plan = Plan::Distinct { input: boxed(plan) };
        }
        if !order_keys.is_empty() {
            plan = Plan::Sort {
                input: boxed(plan),
                keys: order_keys,
            };
        }
        if let Some(count) = &projection.skip {
            plan = Plan::Skip {
                input: boxed(plan),
                count: count.clone(),
            };
        }
        if let Some(count) = &projection.limit {
            plan = Plan::Limit {
                input: boxed(plan),
                count: count.clone(),
            };
        }
        if !aggregating && !projection.distinct {
            plan = Plan::Select {
                input: boxed(plan),
                columns: columns.clone(),
            };
        }
        self.scope = columns.iter().cloned().collect();
        Ok((plan, columns))
    }
}

impl Plan {
    fn input(&self) -> Option<&Plan> {
        match self {
            Plan::Start => None,
            Plan::NodeScan { input, .. }
            | Plan::NodeById { input, .. }
            | Plan::CheckNode { input, .. }
            | Plan::Expand { input, .. }
            | Plan::ShortestPath { input, .. }
            | Plan::BindPath { input, .. }
            | Plan::Filter { input, .. }
            | Plan::Optional { input, .. }
            | Plan::Unwind { input, .. }
            | Plan::Project { input, .. }
            | Plan::Select { input, .. }
            | Plan::Aggregate { input, .. }
            | Plan::Distinct { input }
            | Plan::Sort { input, .. }
            | Plan::Skip { input, .. }
            | Plan::Limit { input, .. }
            | Plan::Create { input, .. }
            | Plan::Merge { input, .. }
            | Plan::Set { input, .. }
            | Plan::Remove { input, .. }
            | Plan::Delete { input, .. }
            | Plan::Call { input, .. } => Some(input),
        }
    }

    fn write_tree(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        write!(f, "{:indent$}+", "", indent = depth * 2)?;
        self.describe(f)?;
        writeln!(f)?;
        match self {
            Plan::Optional { inner, .. } | Plan::Merge { matcher: inner, .. } => {
                inner.write_tree(f, depth + 2)?;
            }
            _ => {}
        }
        match self.input() {
            Some(input) => input.write_tree(f, depth + 1),
            None => Ok(()),
        }
    }

    fn describe(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Plan::Start => write!(f, "Start"),
            Plan::NodeScan { node, hints, .. } => {
                let kind = if node.labels.is_empty() {
                    "AllNodesScan"
                } else if node.props.is_some() || !hints.is_empty() {
                    "NodeByLabelAndPropertyScan"
                } else {
                    "NodeByLabelScan"
                };
                write!(f, "{kind} {}", NodeLabel(node))?;
                for (key, value) in hints {
                    write!(f, " {}.{key} = {value}", show(&node.var))?;
                }
                Ok(())
            }
            Plan::NodeById { node, id, .. } => write!(f, "NodeByIdSeek {} id = {id}", NodeLabel(node)),
            Plan::CheckNode { node, .. } => write!(f, "CheckNode {}", NodeLabel(node)),
            Plan::Expand { spec, .. } => {
                let kind = if spec.to_bound { "ExpandInto" } else { "Expand" };
                let (left, right) = match spec.direction {
                    Direction::Outgoing => ("-", "->"),
                    Direction::Incoming => ("<-", "-"),
                    Direction::Both => ("-", "-"),
                };
                write!(f, "{kind} ({}){left}[{}", show(&spec.from), show(&spec.rel))?;
                if !spec.types.is_empty() {
                    write!(f, ":{}", spec.types.join("|"))?;
                }
                if let Some((min, max)) = spec.hops {
                    write!(f, "*{min}..")?;
                    if let Some(max) = max {
                        write!(f, "{max}")?;
                    }
                }
                write!(f, "]{right}{}", NodeLabel(&spec.to))
            }
            Plan::ShortestPath { spec, .. } => write!(
                f,
                "{} ({})..({}) hops {}..{}",
                if spec.all { "AllShortestPaths" } else { "ShortestPath" },
                show(&spec.from),
                show(&spec.to),
                spec.min_hops,
                spec.max_hops.map(|m| m.to_string()).unwrap_or_default()
            ),
            Plan::BindPath { var, .. } => write!(f, "BindPath {var}"),
            Plan::Filter { predicate, .. } => write!(f, "Filter {}", Shown(predicate)),
            Plan::Optional { introduced, .. } => {
                write!(f, "Optional [{}]", Names(introduced))
            }
            Plan::Unwind { expr, alias, .. } => write!(f, "Unwind {} AS {alias}", Shown(expr)),
            Plan::Project { items, .. } => {
                write!(f, "Project ")?;
                for (idx, (alias, expr)) in items.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{} AS {}", Shown(expr), show(alias))?;
                }
                Ok(())
            }
            Plan::Select { columns, .. } => write!(f, "Produce [{}]", Names(columns)),
            Plan::Aggregate { keys, aggs, .. } => {
                write!(f, "Aggregate keys [")?;
                for (idx, (alias, _)) in keys.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{alias}")?;
                }
                write!(f, "] aggregates [")?;
                for (idx, (_, spec)) in aggs.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    let name = format!("{:?}", spec.func).to_ascii_lowercase();
                    match &spec.arg {
                        Some(arg) if spec.distinct => write!(f, "{name}(DISTINCT {})", Shown(arg))?,
                        Some(arg) => write!(f, "{name}({})", Shown(arg))?,
                        None => write!(f, "{name}(*)")?,
                    }
                }
                write!(f, "]")
            }
            Plan::Distinct { .. } => write!(f, "Distinct"),
            Plan::Sort { keys, .. } => {
                write!(f, "Sort ")?;
                for (idx, (key, desc)) in keys.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}{}", Shown(key), if *desc { " DESC" } else { "" })?;
                }
                Ok(())
            }
            Plan::Skip { count, .. } => write!(f, "Skip {}", Shown(count)),
            Plan::Limit { count, .. } => write!(f, "Limit {}", Shown(count)),
            Plan::Create { patterns, .. } => write!(f, "Create ({} pattern(s))", patterns.len()),
            Plan::Merge { .. } => write!(f, "Merge"),
            Plan::Set { items, .. } => write!(f, "SetProperties ({} item(s))", items.len()),
            Plan::Remove { items, .. } => write!(f, "Remove ({} item(s))", items.len()),
            Plan::Delete { detach, .. } => {
                write!(f, "{}", if *detach { "DetachDelete" } else { "Delete" })
            }
            Plan::Call { procedure, .. } => write!(f, "ProcedureCall {procedure}"),
        }
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_tree(f, 0)
    }
}

/// Renders planner-generated names as `anon_N`.
fn show(name: &str) -> String {
    match name.strip_prefix(HIDDEN_PREFIX) {
        Some(rest) => format!("anon_{}", rest.trim_start_matches(|c: char| c.is_alphabetic())),
        None => name.to_owned(),
    }
}

struct Shown<'a>(&'a Expr);

impl fmt::Display for Shown<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = self.0.to_string();
        if text.contains(HIDDEN_PREFIX) {
            let expr = rewrite(self.0, &mut |e| match e {
                Expr::Var(name) if is_hidden(name) => Some(Expr::Var(show(name))),
                _ => None,
            });
            write!(f, "{expr}")
        } else {
            f.write_str(&text)
        }
    }
}

struct Names<'a>(&'a [String]);

impl fmt::Display for Names<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, name) in self.0.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", show(name))?;
        }
        Ok(())
    }
}

struct NodeLabel<'a>(&'a NodeMatch);

impl fmt::Display for NodeLabel<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}", show(&self.0.var))?;
        for label in &self.0.labels {
            write!(f, ":{label}")?;
        }
        if let Some(props) = &self.0.props {
            write!(f, " {props}")?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::parser::parse;
    use rustc_hash::FxHashMap;

    struct FixedStats {
        labels: FxHashMap<&'static str, u64>,
        nodes: u64,
    }

    impl PlanStatistics for FixedStats {
        fn label_count(&self, label: &str) -> u64 {
            self.labels.get(label).copied().unwrap_or(0)
        }

        fn node_count(&self) -> u64 {
            self.nodes
        }
    }

    fn stats() -> FixedStats {
        let mut labels = FxHashMap::default();
        labels.insert("Person", 1_000);
        labels.insert("City", 10);
        FixedStats {
            labels,
            nodes: 5_000,
        }
    }

    fn explain(query: &str) -> String {
        plan(&parse(query).unwrap(), &stats()).unwrap().plan.to_string()
    }

    #[test]
    fn anchors_at_the_smaller_label() {
        let text = explain("MATCH (p:Person)-[:LIVES_IN]->(c:City) RETURN p");
        let lines: Vec<&str> = text.lines().collect();
        let last = lines.last().unwrap().trim();
        assert_eq!(last, "+Start");
        assert!(lines[lines.len() - 2].contains("NodeByLabelScan (c:City)"), "{text}");
        assert!(text.contains("Expand (c)<-[anon_"), "{text}");
    }

    #[test]
    fn id_predicates_become_seeks() {
        let text = explain("MATCH (n:Person) WHERE id(n) = $id RETURN n");
        assert!(text.contains("NodeByIdSeek (n:Person) id = $id"), "{text}");
    }

    #[test]
    fn where_equality_narrows_label_scans() {
        let text = explain("MATCH (n:Person) WHERE n.name = 'Alice' RETURN n.age");
        assert!(
            text.contains("NodeByLabelAndPropertyScan (n:Person) n.name = 'Alice'"),
            "{text}"
        );
    }

    #[test]
    fn aggregation_plans_hidden_slots() {
        let planned = plan(
            &parse("MATCH (n:Person) RETURN n.city AS city, count(*) AS c ORDER BY c DESC").unwrap(),
            &stats(),
        )
        .unwrap();
        assert_eq!(planned.columns, vec!["city".to_string(), "c".to_string()]);
        let text = planned.plan.to_string();
        assert!(text.contains("Aggregate keys [city] aggregates [count(*)]"), "{text}");
        assert!(text.starts_with("+Sort c DESC"), "{text}");
    }

    #[test]
    fn call_columns_follow_yield_aliases() {
        let planned = plan(
            &parse("CALL db.index.fulltext.queryNodes('memory_text', 'tea') YIELD node AS n").unwrap(),
            &stats(),
        )
        .unwrap();
        assert_eq!(planned.columns, vec!["n".to_string()]);
    }
}

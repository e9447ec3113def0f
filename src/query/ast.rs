//! Typed syntax tree produced by the parser.

use std::fmt;

/// A parsed statement: a linear pipeline of clauses.
#[derive(Clone, Debug, PartialEq)]
pub struct Statement {
    /// `EXPLAIN` prefix: describe the plan instead of running it.
    pub explain: bool,
    /// Clauses in source order.
    pub clauses: Vec<Clause>,
}

impl Statement {
    /// Whether any clause writes to the graph.
    pub fn is_updating(&self) -> bool {
        self.clauses.iter().any(Clause::is_updating)
    }
}

/// One clause of a statement.
#[derive(Clone, Debug, PartialEq)]
pub enum Clause {
    /// `MATCH` / `OPTIONAL MATCH`.
    Match {
        /// `OPTIONAL MATCH`.
        optional: bool,
        /// Comma-separated patterns.
        patterns: Vec<PatternPath>,
        /// Attached `WHERE`.
        predicate: Option<Expr>,
    },
    /// `UNWIND expr AS alias`.
    Unwind {
        /// List expression.
        expr: Expr,
        /// Bound name.
        alias: String,
    },
    /// `WITH ...`.
    With(Projection),
    /// `RETURN ...`.
    Return(Projection),
    /// `CREATE pattern, ...`.
    Create(Vec<PatternPath>),
    /// `MERGE pattern [ON CREATE SET ...] [ON MATCH SET ...]`.
    Merge {
        /// Node or single-hop pattern.
        pattern: PatternPath,
        /// Applied when the pattern was created.
        on_create: Vec<SetItem>,
        /// Applied when the pattern matched.
        on_match: Vec<SetItem>,
    },
    /// `SET item, ...`.
    Set(Vec<SetItem>),
    /// `REMOVE item, ...`.
    Remove(Vec<RemoveItem>),
    /// `[DETACH] DELETE expr, ...`.
    Delete {
        /// `DETACH DELETE`.
        detach: bool,
        /// Entities to delete.
        exprs: Vec<Expr>,
    },
    /// `CALL proc(args) [YIELD ...] [WHERE ...]`.
    Call {
        /// Dotted procedure name.
        procedure: String,
        /// Arguments.
        args: Vec<Expr>,
        /// Yielded columns with optional aliases; `None` yields all.
        yields: Option<Vec<(String, String)>>,
        /// Filter over yielded columns.
        predicate: Option<Expr>,
    },
}

impl Clause {
    /// Whether the clause writes.
    pub fn is_updating(&self) -> bool {
        matches!(
            self,
            Clause::Create(_)
                | Clause::Merge { .. }
                | Clause::Set(_)
                | Clause::Remove(_)
                | Clause::Delete { .. }
        )
    }
}

/// Projection body shared by `WITH` and `RETURN`.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct Projection {
    /// `DISTINCT`.
    pub distinct: bool,
    /// `*`: carry every bound variable.
    pub star: bool,
    /// Projected items.
    pub items: Vec<ProjectionItem>,
    /// `ORDER BY` keys; `true` means descending.
    pub order_by: Vec<(Expr, bool)>,
    /// `SKIP`.
    pub skip: Option<Expr>,
    /// `LIMIT`.
    pub limit: Option<Expr>,
    /// `WITH ... WHERE`.
    pub predicate: Option<Expr>,
}

/// `expr [AS alias]`.
#[derive(Clone, Debug, PartialEq)]
pub struct ProjectionItem {
    /// Projected expression.
    pub expr: Expr,
    /// Column name: the alias, or the expression's source text.
    pub alias: String,
}

/// `shortestPath(...)` wrapper.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShortestKind {
    /// One shortest path.
    Single,
    /// Every path of minimal length.
    All,
}

/// `[p =] (a)-[r]->(b)...`.
#[derive(Clone, Debug, PartialEq)]
pub struct PatternPath {
    /// Path variable.
    pub var: Option<String>,
    /// `shortestPath` / `allShortestPaths`.
    pub shortest: Option<ShortestKind>,
    /// First node.
    pub start: NodePattern,
    /// Following hops.
    pub steps: Vec<(RelPattern, NodePattern)>,
}

impl PatternPath {
    /// Node patterns in order.
    pub fn nodes(&self) -> impl Iterator<Item = &NodePattern> {
        std::iter::once(&self.start).chain(self.steps.iter().map(|(_, n)| n))
    }
}

/// `(var:Label {key: expr})`.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct NodePattern {
    /// Variable.
    pub var: Option<String>,
    /// Required labels.
    pub labels: Vec<String>,
    /// Inline properties: a map literal or a parameter.
    pub props: Option<Expr>,
}

/// Relationship direction as written.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelDirection {
    /// `-->`.
    Right,
    /// `<--`.
    Left,
    /// `--`.
    Either,
}

impl RelDirection {
    /// Direction when the pattern is read from the other end.
    pub fn reversed(self) -> Self {
        match self {
            RelDirection::Right => RelDirection::Left,
            RelDirection::Left => RelDirection::Right,
            RelDirection::Either => RelDirection::Either,
        }
    }
}

/// `-[var:TYPE|OTHER *min..max {key: expr}]->`.
#[derive(Clone, Debug, PartialEq)]
pub struct RelPattern {
    /// Variable.
    pub var: Option<String>,
    /// Allowed types; empty means any.
    pub types: Vec<String>,
    /// Direction.
    pub direction: RelDirection,
    /// Inline properties: a map literal or a parameter.
    pub props: Option<Expr>,
    /// Variable-length bounds; `None` is a single hop.
    pub length: Option<(Option<u32>, Option<u32>)>,
}

/// `SET` items.
#[derive(Clone, Debug, PartialEq)]
pub enum SetItem {
    /// `n.key = expr`.
    Property {
        /// Variable.
        var: String,
        /// Property key.
        key: String,
        /// New value.
        value: Expr,
    },
    /// `n = map`.
    Replace {
        /// Variable.
        var: String,
        /// New property map.
        value: Expr,
    },
    /// `n += map`.
    Merge {
        /// Variable.
        var: String,
        /// Properties to merge.
        value: Expr,
    },
    /// `n:Label:Other`.
    Labels {
        /// Variable.
        var: String,
        /// Labels to add.
        labels: Vec<String>,
    },
}

/// `REMOVE` items.
#[derive(Clone, Debug, PartialEq)]
pub enum RemoveItem {
    /// `n.key`.
    Property {
        /// Variable.
        var: String,
        /// Property key.
        key: String,
    },
    /// `n:Label`.
    Labels {
        /// Variable.
        var: String,
        /// Labels to remove.
        labels: Vec<String>,
    },
}

/// Literal constants.
#[derive(Clone, Debug, PartialEq)]
pub enum Literal {
    /// `null`.
    Null,
    /// `true` or `false`.
    Bool(bool),
    /// Integer literal.
    Int(i64),
    /// Float literal.
    Float(f64),
    /// Quoted string.
    String(String),
}

/// Prefix operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    /// `NOT`.
    Not,
    /// Unary minus.
    Neg,
}

/// Infix operators, loosest binding first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    /// `OR`.
    Or,
    /// `XOR`.
    Xor,
    /// `AND`.
    And,
    /// `=`.
    Eq,
    /// `<>`.
    Ne,
    /// `<`.
    Lt,
    /// `<=`.
    Le,
    /// `>`.
    Gt,
    /// `>=`.
    Ge,
    /// `+`, also list and string concatenation.
    Add,
    /// `-`.
    Sub,
    /// `*`.
    Mul,
    /// `/`.
    Div,
    /// `%`.
    Mod,
    /// `^`.
    Pow,
    /// List membership.
    In,
    /// `STARTS WITH`.
    StartsWith,
    /// `ENDS WITH`.
    EndsWith,
    /// `CONTAINS`.
    Contains,
}

/// Expressions.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    /// Constant.
    Literal(Literal),
    /// `$name`.
    Param(String),
    /// Bound variable.
    Var(String),
    /// `expr.key`.
    Property(Box<Expr>, String),
    /// `expr[index]`.
    Index(Box<Expr>, Box<Expr>),
    /// `expr[from..to]`; either bound may be absent.
    Slice(Box<Expr>, Option<Box<Expr>>, Option<Box<Expr>>),
    /// `[a, b, ..]`.
    List(Vec<Expr>),
    /// `{key: expr, ..}`.
    Map(Vec<(String, Expr)>),
    /// Prefix operation.
    Unary(UnaryOp, Box<Expr>),
    /// Infix operation.
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    /// `expr IS [NOT] NULL`; the flag is `true` for `IS NOT NULL`.
    IsNull(Box<Expr>, bool),
    /// `n:Label` used as a predicate.
    HasLabels(Box<Expr>, Vec<String>),
    /// Function call; `distinct` applies to aggregates.
    Call {
        /// Function name as written.
        name: String,
        /// `DISTINCT` inside the argument list.
        distinct: bool,
        /// Arguments.
        args: Vec<Expr>,
    },
    /// `count(*)`.
    CountStar,
    /// `CASE [operand] WHEN .. THEN .. [ELSE ..] END`.
    Case {
        /// Simple-form operand compared against each `WHEN`.
        operand: Option<Box<Expr>>,
        /// `WHEN` / `THEN` pairs in order.
        branches: Vec<(Expr, Expr)>,
        /// `ELSE` value.
        default: Option<Box<Expr>>,
    },
}

/// Aggregate function names, lowercase.
pub const AGGREGATES: &[&str] = &["count", "sum", "avg", "min", "max", "collect"];

impl Expr {
    /// Whether this expression contains an aggregate call.
    pub fn contains_aggregate(&self) -> bool {
        let mut found = false;
        self.walk(&mut |e| {
            if matches!(e, Expr::CountStar)
                || matches!(e, Expr::Call { name, .. } if AGGREGATES.contains(&name.to_ascii_lowercase().as_str()))
            {
                found = true;
            }
        });
        found
    }

    /// Visits this expression and all sub-expressions, parents first.
    pub fn walk(&self, visit: &mut dyn FnMut(&Expr)) {
        visit(self);
        match self {
            Expr::Literal(_) | Expr::Param(_) | Expr::Var(_) | Expr::CountStar => {}
            Expr::Property(inner, _) | Expr::Unary(_, inner) | Expr::IsNull(inner, _) => {
                inner.walk(visit)
            }
            Expr::HasLabels(inner, _) => inner.walk(visit),
            Expr::Index(a, b) | Expr::Binary(_, a, b) => {
                a.walk(visit);
                b.walk(visit);
            }
            Expr::Slice(a, from, to) => {
                a.walk(visit);
                if let Some(from) = from {
                    from.walk(visit);
                }
                if let Some(to) = to {
                    to.walk(visit);
                }
            }
            Expr::List(items) => items.iter().for_each(|e| e.walk(visit)),
            Expr::Call { args, .. } => args.iter().for_each(|e| e.walk(visit)),
            Expr::Map(entries) => entries.iter().for_each(|(_, e)| e.walk(visit)),
            Expr::Case {
                operand,
                branches,
                default,
            } => {
                if let Some(op) = operand {
                    op.walk(visit);
                }
                for (when, then) in branches {
                    when.walk(visit);
                    then.walk(visit);
                }
                if let Some(d) = default {
                    d.walk(visit);
                }
            }
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Null => write!(f, "null"),
            Literal::Bool(b) => write!(f, "{b}"),
            Literal::Int(i) => write!(f, "{i}"),
            Literal::Float(x) => write!(f, "{x:?}"),
            Literal::String(s) => write!(f, "'{}'", s.replace('\'', "\\'")),
        }
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            BinaryOp::Or => "OR",
            BinaryOp::Xor => "XOR",
            BinaryOp::And => "AND",
            BinaryOp::Eq => "=",
            BinaryOp::Ne => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Pow => "^",
            BinaryOp::In => "IN",
            BinaryOp::StartsWith => "STARTS WITH",
            BinaryOp::EndsWith => "ENDS WITH",
            BinaryOp::Contains => "CONTAINS",
        };
        f.write_str(op)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(lit) => write!(f, "{lit}"),
            Expr::Param(name) => write!(f, "${name}"),
            Expr::Var(name) => write!(f, "{name}"),
            Expr::Property(inner, key) => write!(f, "{inner}.{key}"),
            Expr::Index(inner, idx) => write!(f, "{inner}[{idx}]"),
            Expr::Slice(inner, from, to) => {
                write!(f, "{inner}[")?;
                if let Some(from) = from {
                    write!(f, "{from}")?;
                }
                write!(f, "..")?;
                if let Some(to) = to {
                    write!(f, "{to}")?;
                }
                write!(f, "]")
            }
            Expr::List(items) => {
                write!(f, "[")?;
                write_joined(f, items)?;
                write!(f, "]")
            }
            Expr::Map(entries) => {
                write!(f, "{{")?;
                for (idx, (k, v)) in entries.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
            Expr::Unary(UnaryOp::Not, inner) => write!(f, "NOT {inner}"),
            Expr::Unary(UnaryOp::Neg, inner) => write!(f, "-{inner}"),
            Expr::Binary(op, a, b) => write!(f, "{a} {op} {b}"),
            Expr::IsNull(inner, false) => write!(f, "{inner} IS NULL"),
            Expr::IsNull(inner, true) => write!(f, "{inner} IS NOT NULL"),
            Expr::HasLabels(inner, labels) => {
                write!(f, "{inner}")?;
                for label in labels {
                    write!(f, ":{label}")?;
                }
                Ok(())
            }
            Expr::Call {
                name,
                distinct,
                args,
            } => {
                write!(f, "{name}(")?;
                if *distinct {
                    write!(f, "DISTINCT ")?;
                }
                write_joined(f, args)?;
                write!(f, ")")
            }
            Expr::CountStar => write!(f, "count(*)"),
            Expr::Case {
                operand,
                branches,
                default,
            } => {
                write!(f, "CASE")?;
                if let Some(op) = operand {
                    write!(f, " {op}")?;
                }
                for (when, then) in branches {
                    write!(f, " WHEN {when} THEN {then}")?;
                }
                if let Some(d) = default {
                    write!(f, " ELSE {d}")?;
                }
                write!(f, " END")
            }
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, items: &[Expr]) -> fmt::Result {
    for (idx, item) in items.iter().enumerate() {
        if idx > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

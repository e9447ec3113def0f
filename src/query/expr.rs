//! Expression evaluation and scalar functions.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use time::OffsetDateTime;

use super::ast::{BinaryOp, Expr, Literal, UnaryOp, AGGREGATES};
use super::errors::QueryError;
use super::executor::{ExecCtx, Row};
use super::value::{format_datetime, now_millis, parse_datetime, Value};
use crate::storage::{EdgeRecord, NodeRecord};
use crate::types::{EdgeId, NodeId};

/// Scalar functions with their accepted argument counts.
const FUNCTIONS: &[(&str, usize, usize)] = &[
    ("id", 1, 1),
    ("elementid", 1, 1),
    ("labels", 1, 1),
    ("type", 1, 1),
    ("keys", 1, 1),
    ("properties", 1, 1),
    ("size", 1, 1),
    ("length", 1, 1),
    ("tolower", 1, 1),
    ("toupper", 1, 1),
    ("tostring", 1, 1),
    ("tointeger", 1, 1),
    ("tofloat", 1, 1),
    ("coalesce", 1, usize::MAX),
    ("startnode", 1, 1),
    ("endnode", 1, 1),
    ("nodes", 1, 1),
    ("relationships", 1, 1),
    ("datetime", 0, 1),
    ("timestamp", 0, 0),
    ("abs", 1, 1),
    ("exists", 1, 1),
    ("head", 1, 1),
    ("last", 1, 1),
    ("range", 2, 3),
    ("round", 1, 1),
];

/// Argument count bounds of a scalar or aggregate function.
pub(crate) fn function_arity(name: &str) -> Option<(usize, usize)> {
    let lower = name.to_ascii_lowercase();
    if AGGREGATES.contains(&lower.as_str()) {
        return Some((1, 1));
    }
    FUNCTIONS
        .iter()
        .find(|(n, _, _)| *n == lower)
        .map(|(_, min, max)| (*min, *max))
}

/// Evaluates a predicate; null counts as false.
pub(crate) fn eval_predicate(expr: &Expr, row: &Row, ctx: &ExecCtx) -> Result<bool, QueryError> {
    Ok(eval(expr, row, ctx)?.as_bool()?.unwrap_or(false))
}

/// Evaluates `expr` against a row.
pub(crate) fn eval(expr: &Expr, row: &Row, ctx: &ExecCtx) -> Result<Value, QueryError> {
    match expr {
        Expr::Literal(lit) => Ok(literal(lit)),
        Expr::Param(name) => ctx
            .params
            .get(name)
            .cloned()
            .ok_or_else(|| QueryError::MissingParameter(name.clone())),
        Expr::Var(name) => row
            .get(name)
            .cloned()
            .ok_or_else(|| QueryError::UnboundVariable(name.clone())),
        Expr::Property(target, key) => {
            let target = eval(target, row, ctx)?;
            property(target, key, ctx)
        }
        Expr::Index(target, index) => {
            let target = eval(target, row, ctx)?;
            let index = eval(index, row, ctx)?;
            subscript(target, index, ctx)
        }
        Expr::Slice(target, from, to) => {
            let target = eval(target, row, ctx)?;
            let from = from.as_ref().map(|e| eval(e, row, ctx)).transpose()?;
            let to = to.as_ref().map(|e| eval(e, row, ctx)).transpose()?;
            slice(target, from, to)
        }
        Expr::List(items) => Ok(Value::List(
            items
                .iter()
                .map(|e| eval(e, row, ctx))
                .collect::<Result<_, _>>()?,
        )),
        Expr::Map(entries) => {
            let mut map = BTreeMap::new();
            for (key, value) in entries {
                map.insert(key.clone(), eval(value, row, ctx)?);
            }
            Ok(Value::Map(map))
        }
        Expr::Unary(UnaryOp::Not, inner) => {
            Ok(match eval(inner, row, ctx)?.as_bool()? {
                Some(b) => Value::Bool(!b),
                None => Value::Null,
            })
        }
        Expr::Unary(UnaryOp::Neg, inner) => match eval(inner, row, ctx)? {
            Value::Null => Ok(Value::Null),
            Value::Int(i) => i
                .checked_neg()
                .map(Value::Int)
                .ok_or_else(|| QueryError::semantic("integer overflow")),
            Value::Float(f) => Ok(Value::Float(-f)),
            other => Err(QueryError::type_mismatch(format!(
                "cannot negate a {}",
                other.type_name()
            ))),
        },
        Expr::Binary(op, lhs, rhs) => binary(*op, lhs, rhs, row, ctx),
        Expr::IsNull(inner, negated) => {
            let is_null = eval(inner, row, ctx)?.is_null();
            Ok(Value::Bool(is_null != *negated))
        }
        Expr::HasLabels(inner, labels) => match eval(inner, row, ctx)? {
            Value::Null => Ok(Value::Null),
            Value::Node(node) => {
                let node = match fresh_node(node, ctx)? {
                    Some(node) => node,
                    None => return Ok(Value::Null),
                };
                Ok(Value::Bool(labels.iter().all(|l| node.has_label(l))))
            }
            other => Err(QueryError::type_mismatch(format!(
                "label predicate on a {}",
                other.type_name()
            ))),
        },
        Expr::Case {
            operand,
            branches,
            default,
        } => {
            let subject = operand.as_ref().map(|e| eval(e, row, ctx)).transpose()?;
            for (when, then) in branches {
                let hit = match &subject {
                    Some(subject) => subject.equals(&eval(when, row, ctx)?) == Some(true),
                    None => eval_predicate(when, row, ctx)?,
                };
                if hit {
                    return eval(then, row, ctx);
                }
            }
            match default {
                Some(d) => eval(d, row, ctx),
                None => Ok(Value::Null),
            }
        }
        Expr::CountStar => Err(misplaced_aggregate()),
        Expr::Call { name, args, .. } => {
            let lower = name.to_ascii_lowercase();
            if AGGREGATES.contains(&lower.as_str()) {
                return Err(misplaced_aggregate());
            }
            if lower == "exists" {
                let value = match args.first() {
                    Some(arg) => eval(arg, row, ctx)?,
                    None => Value::Null,
                };
                return Ok(Value::Bool(!value.is_null()));
            }
            if lower == "coalesce" {
                for arg in args {
                    let value = eval(arg, row, ctx)?;
                    if !value.is_null() {
                        return Ok(value);
                    }
                }
                return Ok(Value::Null);
            }
            let values = args
                .iter()
                .map(|a| eval(a, row, ctx))
                .collect::<Result<Vec<_>, _>>()?;
            call_function(&lower, values, ctx)
        }
    }
}

fn misplaced_aggregate() -> QueryError {
    QueryError::semantic("aggregate functions are only allowed in RETURN and WITH")
}

fn literal(lit: &Literal) -> Value {
    match lit {
        Literal::Null => Value::Null,
        Literal::Bool(b) => Value::Bool(*b),
        Literal::Int(i) => Value::Int(*i),
        Literal::Float(f) => Value::Float(*f),
        Literal::String(s) => Value::String(s.clone()),
    }
}

/// Latest image of a node when the statement has written; `None` once it
/// was deleted.
fn fresh_node(node: Arc<NodeRecord>, ctx: &ExecCtx) -> Result<Option<Arc<NodeRecord>>, QueryError> {
    if !ctx.wrote {
        return Ok(Some(node));
    }
    Ok(ctx.tx.node(node.id)?)
}

fn fresh_edge(edge: Arc<EdgeRecord>, ctx: &ExecCtx) -> Result<Option<Arc<EdgeRecord>>, QueryError> {
    if !ctx.wrote {
        return Ok(Some(edge));
    }
    Ok(ctx.tx.edge(edge.id)?)
}

pub(crate) fn property(target: Value, key: &str, ctx: &ExecCtx) -> Result<Value, QueryError> {
    match target {
        Value::Null => Ok(Value::Null),
        Value::Node(node) => {
            let Some(node) = fresh_node(node, ctx)? else {
                return Ok(Value::Null);
            };
            if key == ctx.embedding_property {
                return Ok(node.embedding.clone().map(Value::from).unwrap_or(Value::Null));
            }
            Ok(node.props.get(key).map(Value::from).unwrap_or(Value::Null))
        }
        Value::Relationship(edge) => {
            let Some(edge) = fresh_edge(edge, ctx)? else {
                return Ok(Value::Null);
            };
            Ok(edge.props.get(key).map(Value::from).unwrap_or(Value::Null))
        }
        Value::Map(mut map) => Ok(map.remove(key).unwrap_or(Value::Null)),
        Value::DateTime(ms) => datetime_field(ms, key),
        other => Err(QueryError::type_mismatch(format!(
            "cannot read property `{key}` of a {}",
            other.type_name()
        ))),
    }
}

fn datetime_field(ms: i64, key: &str) -> Result<Value, QueryError> {
    let dt = OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000)
        .map_err(|_| QueryError::semantic("datetime out of range"))?;
    let value = match key {
        "year" => i64::from(dt.year()),
        "month" => i64::from(u8::from(dt.month())),
        "day" => i64::from(dt.day()),
        "hour" => i64::from(dt.hour()),
        "minute" => i64::from(dt.minute()),
        "second" => i64::from(dt.second()),
        "millisecond" => i64::from(dt.millisecond()),
        "epochMillis" => ms,
        "epochSeconds" => ms.div_euclid(1000),
        _ => return Ok(Value::Null),
    };
    Ok(Value::Int(value))
}

fn list_index(len: usize, index: i64) -> Option<usize> {
    let len = i64::try_from(len).ok()?;
    let idx = if index < 0 { len + index } else { index };
    (0..len).contains(&idx).then_some(idx as usize)
}

fn subscript(target: Value, index: Value, ctx: &ExecCtx) -> Result<Value, QueryError> {
    match (target, index) {
        (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
        (Value::List(mut items), Value::Int(i)) => Ok(match list_index(items.len(), i) {
            Some(idx) => items.swap_remove(idx),
            None => Value::Null,
        }),
        (target @ (Value::Map(_) | Value::Node(_) | Value::Relationship(_)), Value::String(key)) => {
            property(target, &key, ctx)
        }
        (target, index) => Err(QueryError::type_mismatch(format!(
            "cannot index a {} with a {}",
            target.type_name(),
            index.type_name()
        ))),
    }
}

fn slice(target: Value, from: Option<Value>, to: Option<Value>) -> Result<Value, QueryError> {
    let items = match target {
        Value::Null => return Ok(Value::Null),
        Value::List(items) => items,
        other => {
            return Err(QueryError::type_mismatch(format!(
                "cannot slice a {}",
                other.type_name()
            )))
        }
    };
    let len = items.len() as i64;
    let bound = |value: Option<Value>, default: i64| -> Result<Option<i64>, QueryError> {
        match value {
            None => Ok(Some(default)),
            Some(Value::Null) => Ok(None),
            Some(Value::Int(i)) => Ok(Some(if i < 0 { (len + i).max(0) } else { i.min(len) })),
            Some(other) => Err(QueryError::type_mismatch(format!(
                "slice bounds must be integers, got {}",
                other.type_name()
            ))),
        }
    };
    let (Some(start), Some(end)) = (bound(from, 0)?, bound(to, len)?) else {
        return Ok(Value::Null);
    };
    if start >= end {
        return Ok(Value::List(Vec::new()));
    }
    Ok(Value::List(
        items
            .into_iter()
            .skip(start as usize)
            .take((end - start) as usize)
            .collect(),
    ))
}

fn binary(op: BinaryOp, lhs: &Expr, rhs: &Expr, row: &Row, ctx: &ExecCtx) -> Result<Value, QueryError> {
    match op {
        BinaryOp::And | BinaryOp::Or => {
            let left = eval(lhs, row, ctx)?;
            let short = op == BinaryOp::Or;
            if left.as_bool()? == Some(short) {
                return Ok(Value::Bool(short));
            }
            let right = eval(rhs, row, ctx)?;
            apply_binary(op, left, right)
        }
        _ => {
            let left = eval(lhs, row, ctx)?;
            let right = eval(rhs, row, ctx)?;
            apply_binary(op, left, right)
        }
    }
}

fn cmp_result(left: &Value, right: &Value, accept: fn(Ordering) -> bool) -> Value {
    if left.is_null() || right.is_null() {
        return Value::Null;
    }
    match left.compare(right) {
        Some(ord) => Value::Bool(accept(ord)),
        None => Value::Null,
    }
}

fn apply_binary(op: BinaryOp, left: Value, right: Value) -> Result<Value, QueryError> {
    match op {
        BinaryOp::Eq => Ok(left.equals(&right).map(Value::Bool).unwrap_or(Value::Null)),
        BinaryOp::Ne => Ok(left
            .equals(&right)
            .map(|eq| Value::Bool(!eq))
            .unwrap_or(Value::Null)),
        BinaryOp::Lt => Ok(cmp_result(&left, &right, |o| o == Ordering::Less)),
        BinaryOp::Le => Ok(cmp_result(&left, &right, |o| o != Ordering::Greater)),
        BinaryOp::Gt => Ok(cmp_result(&left, &right, |o| o == Ordering::Greater)),
        BinaryOp::Ge => Ok(cmp_result(&left, &right, |o| o != Ordering::Less)),
        BinaryOp::In => match right {
            Value::Null => Ok(Value::Null),
            Value::List(items) => {
                if left.is_null() {
                    return Ok(Value::Null);
                }
                let mut unknown = false;
                for item in &items {
                    match left.equals(item) {
                        Some(true) => return Ok(Value::Bool(true)),
                        None => unknown = true,
                        Some(false) => {}
                    }
                }
                Ok(if unknown { Value::Null } else { Value::Bool(false) })
            }
            other => Err(QueryError::type_mismatch(format!(
                "IN expects a list, got {}",
                other.type_name()
            ))),
        },
        BinaryOp::StartsWith | BinaryOp::EndsWith | BinaryOp::Contains => {
            match (&left, &right) {
                (Value::String(a), Value::String(b)) => Ok(Value::Bool(match op {
                    BinaryOp::StartsWith => a.starts_with(b.as_str()),
                    BinaryOp::EndsWith => a.ends_with(b.as_str()),
                    _ => a.contains(b.as_str()),
                })),
                _ => Ok(Value::Null),
            }
        }
        BinaryOp::Add => add(left, right),
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod | BinaryOp::Pow => {
            arithmetic(op, left, right)
        }
        BinaryOp::And | BinaryOp::Or | BinaryOp::Xor => {
            let (a, b) = (left.as_bool()?, right.as_bool()?);
            Ok(match (op, a, b) {
                (BinaryOp::And, Some(false), _) | (BinaryOp::And, _, Some(false)) => Value::Bool(false),
                (BinaryOp::And, Some(true), Some(true)) => Value::Bool(true),
                (BinaryOp::Or, Some(true), _) | (BinaryOp::Or, _, Some(true)) => Value::Bool(true),
                (BinaryOp::Or, Some(false), Some(false)) => Value::Bool(false),
                (BinaryOp::Xor, Some(a), Some(b)) => Value::Bool(a != b),
                _ => Value::Null,
            })
        }
    }
}

fn add(left: Value, right: Value) -> Result<Value, QueryError> {
    match (left, right) {
        (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
        (Value::List(mut a), Value::List(b)) => {
            a.extend(b);
            Ok(Value::List(a))
        }
        (Value::List(mut a), item) => {
            a.push(item);
            Ok(Value::List(a))
        }
        (item, Value::List(mut b)) => {
            b.insert(0, item);
            Ok(Value::List(b))
        }
        (Value::String(a), b @ (Value::String(_) | Value::Int(_) | Value::Float(_))) => {
            Ok(Value::String(format!("{a}{}", plain_string(&b))))
        }
        (a @ (Value::Int(_) | Value::Float(_)), Value::String(b)) => {
            Ok(Value::String(format!("{}{b}", plain_string(&a))))
        }
        (Value::DateTime(ms), Value::Int(delta)) | (Value::Int(delta), Value::DateTime(ms)) => ms
            .checked_add(delta)
            .map(Value::DateTime)
            .ok_or_else(|| QueryError::semantic("datetime overflow")),
        (a, b) => arithmetic(BinaryOp::Add, a, b),
    }
}

fn arithmetic(op: BinaryOp, left: Value, right: Value) -> Result<Value, QueryError> {
    if left.is_null() || right.is_null() {
        return Ok(Value::Null);
    }
    if op == BinaryOp::Pow {
        return match (left.as_f64(), right.as_f64()) {
            (Some(a), Some(b)) => Ok(Value::Float(a.powf(b))),
            _ => Err(operand_mismatch(op, &left, &right)),
        };
    }
    if let (Value::Int(a), Value::Int(b)) = (&left, &right) {
        let (a, b) = (*a, *b);
        let out = match op {
            BinaryOp::Add => a.checked_add(b),
            BinaryOp::Sub => a.checked_sub(b),
            BinaryOp::Mul => a.checked_mul(b),
            BinaryOp::Div | BinaryOp::Mod if b == 0 => {
                return Err(QueryError::semantic("/ by zero"));
            }
            BinaryOp::Div => a.checked_div(b),
            BinaryOp::Mod => a.checked_rem(b),
            _ => None,
        };
        return out
            .map(Value::Int)
            .ok_or_else(|| QueryError::semantic("integer overflow"));
    }
    if let (Value::DateTime(a), Value::DateTime(b)) = (&left, &right) {
        if op == BinaryOp::Sub {
            return Ok(Value::Int(a - b));
        }
    }
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => Ok(Value::Float(match op {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            _ => a % b,
        })),
        _ => Err(operand_mismatch(op, &left, &right)),
    }
}

fn operand_mismatch(op: BinaryOp, left: &Value, right: &Value) -> QueryError {
    QueryError::type_mismatch(format!(
        "cannot apply `{op}` to {} and {}",
        left.type_name(),
        right.type_name()
    ))
}

/// String rendering without quotes, as `toString` produces it.
fn plain_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::DateTime(ms) => format_datetime(*ms),
        other => other.to_string(),
    }
}

fn expect_node(value: &Value, func: &str) -> Result<Option<Arc<NodeRecord>>, QueryError> {
    match value {
        Value::Null => Ok(None),
        Value::Node(node) => Ok(Some(Arc::clone(node))),
        other => Err(QueryError::type_mismatch(format!(
            "{func}() expects a Node, got {}",
            other.type_name()
        ))),
    }
}

fn expect_rel(value: &Value, func: &str) -> Result<Option<Arc<EdgeRecord>>, QueryError> {
    match value {
        Value::Null => Ok(None),
        Value::Relationship(rel) => Ok(Some(Arc::clone(rel))),
        other => Err(QueryError::type_mismatch(format!(
            "{func}() expects a Relationship, got {}",
            other.type_name()
        ))),
    }
}

fn wrong_arg(func: &str, value: &Value) -> QueryError {
    QueryError::type_mismatch(format!(
        "{func}() does not accept a {}",
        value.type_name()
    ))
}

fn props_map(props: &crate::storage::PropertyMap) -> Value {
    Value::Map(
        props
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(v)))
            .collect(),
    )
}

fn call_function(name: &str, mut args: Vec<Value>, ctx: &ExecCtx) -> Result<Value, QueryError> {
    if name == "timestamp" {
        return Ok(Value::Int(now_millis()));
    }
    if name == "datetime" && args.is_empty() {
        return Ok(Value::DateTime(now_millis()));
    }
    if name == "range" {
        return range(&args);
    }
    if args.is_empty() {
        return Err(QueryError::semantic(format!("{name}() expects an argument")));
    }
    let arg = args.swap_remove(0);
    if arg.is_null() {
        return Ok(Value::Null);
    }
    Ok(match name {
        "id" => match &arg {
            Value::Node(n) => Value::Int(n.id.0 as i64),
            Value::Relationship(r) => Value::Int(r.id.0 as i64),
            other => return Err(wrong_arg(name, other)),
        },
        "elementid" => match &arg {
            Value::Node(n) => Value::String(format!("node:{}", n.id.0)),
            Value::Relationship(r) => Value::String(format!("relationship:{}", r.id.0)),
            other => return Err(wrong_arg(name, other)),
        },
        "labels" => match expect_node(&arg, name)?.map(|n| fresh_node(n, ctx)).transpose()? {
            Some(Some(node)) => Value::List(node.labels.iter().map(|l| Value::from(l.as_str())).collect()),
            _ => Value::Null,
        },
        "type" => match expect_rel(&arg, name)? {
            Some(rel) => Value::String(rel.ty.clone()),
            None => Value::Null,
        },
        "keys" => match arg {
            Value::Node(node) => match fresh_node(node, ctx)? {
                Some(node) => Value::List(node.props.keys().map(|k| Value::from(k.as_str())).collect()),
                None => Value::Null,
            },
            Value::Relationship(rel) => match fresh_edge(rel, ctx)? {
                Some(rel) => Value::List(rel.props.keys().map(|k| Value::from(k.as_str())).collect()),
                None => Value::Null,
            },
            Value::Map(map) => Value::List(map.into_keys().map(Value::String).collect()),
            other => return Err(wrong_arg(name, &other)),
        },
        "properties" => match arg {
            Value::Node(node) => match fresh_node(node, ctx)? {
                Some(node) => props_map(&node.props),
                None => Value::Null,
            },
            Value::Relationship(rel) => match fresh_edge(rel, ctx)? {
                Some(rel) => props_map(&rel.props),
                None => Value::Null,
            },
            map @ Value::Map(_) => map,
            other => return Err(wrong_arg(name, &other)),
        },
        "size" => match &arg {
            Value::List(items) => Value::Int(items.len() as i64),
            Value::String(s) => Value::Int(s.chars().count() as i64),
            other => return Err(wrong_arg(name, other)),
        },
        "length" => match &arg {
            Value::Path(p) => Value::Int(p.len() as i64),
            Value::List(items) => Value::Int(items.len() as i64),
            Value::String(s) => Value::Int(s.chars().count() as i64),
            other => return Err(wrong_arg(name, other)),
        },
        "tolower" | "toupper" => match &arg {
            Value::String(s) if name == "tolower" => Value::String(s.to_lowercase()),
            Value::String(s) => Value::String(s.to_uppercase()),
            other => return Err(wrong_arg(name, other)),
        },
        "tostring" => match &arg {
            Value::String(_) | Value::Int(_) | Value::Float(_) | Value::Bool(_) | Value::DateTime(_) => {
                Value::String(plain_string(&arg))
            }
            other => return Err(wrong_arg(name, other)),
        },
        "tointeger" => match &arg {
            Value::Int(i) => Value::Int(*i),
            Value::Float(f) if f.is_finite() => Value::Int(f.trunc() as i64),
            Value::Float(_) => Value::Null,
            Value::Bool(b) => Value::Int(i64::from(*b)),
            Value::String(s) => {
                let s = s.trim();
                match s.parse::<i64>() {
                    Ok(i) => Value::Int(i),
                    Err(_) => s
                        .parse::<f64>()
                        .ok()
                        .filter(|f| f.is_finite())
                        .map(|f| Value::Int(f.trunc() as i64))
                        .unwrap_or(Value::Null),
                }
            }
            other => return Err(wrong_arg(name, other)),
        },
        "tofloat" => match &arg {
            Value::Int(i) => Value::Float(*i as f64),
            Value::Float(f) => Value::Float(*f),
            Value::String(s) => s.trim().parse::<f64>().map(Value::Float).unwrap_or(Value::Null),
            other => return Err(wrong_arg(name, other)),
        },
        "startnode" | "endnode" => match expect_rel(&arg, name)? {
            Some(rel) => {
                let id = if name == "startnode" { rel.src } else { rel.dst };
                node_value(id, ctx)?
            }
            None => Value::Null,
        },
        "nodes" => match arg {
            Value::Path(path) => Value::List(path.nodes.into_iter().map(Value::Node).collect()),
            other => return Err(wrong_arg(name, &other)),
        },
        "relationships" => match arg {
            Value::Path(path) => {
                Value::List(path.rels.into_iter().map(Value::Relationship).collect())
            }
            other => return Err(wrong_arg(name, &other)),
        },
        "datetime" => match &arg {
            Value::DateTime(ms) => Value::DateTime(*ms),
            Value::Int(ms) => Value::DateTime(*ms),
            Value::String(text) => match parse_datetime(text) {
                Some(ms) => Value::DateTime(ms),
                None => {
                    return Err(QueryError::semantic(format!(
                        "text cannot be parsed to a DateTime: `{text}`"
                    )))
                }
            },
            Value::Map(map) => match map.get("epochMillis") {
                Some(Value::Int(ms)) => Value::DateTime(*ms),
                _ => return Err(wrong_arg(name, &arg)),
            },
            other => return Err(wrong_arg(name, other)),
        },
        "abs" => match &arg {
            Value::Int(i) => Value::Int(
                i.checked_abs()
                    .ok_or_else(|| QueryError::semantic("integer overflow"))?,
            ),
            Value::Float(f) => Value::Float(f.abs()),
            other => return Err(wrong_arg(name, other)),
        },
        "round" => match &arg {
            Value::Int(i) => Value::Float(*i as f64),
            Value::Float(f) => Value::Float(f.round()),
            other => return Err(wrong_arg(name, other)),
        },
        "head" | "last" => match arg {
            Value::List(mut items) => {
                let item = if name == "head" {
                    (!items.is_empty()).then(|| items.swap_remove(0))
                } else {
                    items.pop()
                };
                item.unwrap_or(Value::Null)
            }
            other => return Err(wrong_arg(name, &other)),
        },
        other => return Err(QueryError::UnknownFunction(other.to_owned())),
    })
}

fn node_value(id: NodeId, ctx: &ExecCtx) -> Result<Value, QueryError> {
    Ok(ctx.tx.node(id)?.map(Value::Node).unwrap_or(Value::Null))
}

/// Relationship by id as a value, or null once deleted.
pub(crate) fn edge_value(id: EdgeId, ctx: &ExecCtx) -> Result<Value, QueryError> {
    Ok(ctx.tx.edge(id)?.map(Value::Relationship).unwrap_or(Value::Null))
}

const MAX_RANGE: i64 = 10_000_000;

fn range(args: &[Value]) -> Result<Value, QueryError> {
    let int = |value: &Value| {
        value
            .as_int()
            .ok_or_else(|| QueryError::type_mismatch("range() expects integer arguments"))
    };
    let (Some(start), Some(end)) = (args.first(), args.get(1)) else {
        return Err(QueryError::semantic("range() expects a start and an end"));
    };
    let (start, end) = (int(start)?, int(end)?);
    let step = match args.get(2) {
        Some(step) => int(step)?,
        None => 1,
    };
    if step == 0 {
        return Err(QueryError::semantic("range() step must not be zero"));
    }
    let count = if (step > 0 && start > end) || (step < 0 && start < end) {
        0
    } else {
        (end - start) / step + 1
    };
    if count > MAX_RANGE {
        return Err(QueryError::semantic(format!(
            "range() would produce {count} elements"
        )));
    }
    Ok(Value::List(
        (0..count).map(|i| Value::Int(start + i * step)).collect(),
    ))
}

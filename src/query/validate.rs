//! Static checks run once per parsed statement: variable scoping, function
//! and procedure names, clause order and write-pattern shape.

use std::collections::BTreeSet;

use super::ast::{Clause, Expr, PatternPath, Projection, RelDirection, RemoveItem, SetItem, Statement};
use super::errors::QueryError;
use super::expr::function_arity;
use super::procedures;

/// What the engine needs to know about a statement before running it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Analysis {
    /// Parameters referenced anywhere in the statement.
    pub params: BTreeSet<String>,
}

type Scope = BTreeSet<String>;

/// Validates `stmt`, returning the parameters it needs.
pub fn validate(stmt: &Statement) -> Result<Analysis, QueryError> {
    let mut analysis = Analysis::default();
    let mut scope = Scope::new();
    let last = stmt.clauses.len() - 1;
    for (idx, clause) in stmt.clauses.iter().enumerate() {
        if idx < last && matches!(clause, Clause::Return(_)) {
            return Err(QueryError::semantic(
                "RETURN can only be used at the end of the query",
            ));
        }
        clause_scope(clause, &mut scope, &mut analysis)?;
    }
    match &stmt.clauses[last] {
        Clause::Return(_) | Clause::Call { .. } => {}
        clause if clause.is_updating() => {}
        Clause::With(_) => {
            return Err(QueryError::semantic("query cannot conclude with WITH"))
        }
        Clause::Unwind { .. } => {
            return Err(QueryError::semantic("query cannot conclude with UNWIND"))
        }
        _ => return Err(QueryError::semantic("query cannot conclude with MATCH")),
    }
    Ok(analysis)
}

fn clause_scope(clause: &Clause, scope: &mut Scope, analysis: &mut Analysis) -> Result<(), QueryError> {
    match clause {
        Clause::Match {
            patterns,
            predicate,
            ..
        } => {
            for pattern in patterns {
                bind_match_pattern(pattern, scope)?;
            }
            for pattern in patterns {
                pattern_exprs(pattern, scope, analysis)?;
            }
            if let Some(predicate) = predicate {
                check_expr(predicate, scope, analysis, false)?;
            }
        }
        Clause::Unwind { expr, alias } => {
            check_expr(expr, scope, analysis, false)?;
            declare(scope, alias)?;
        }
        Clause::With(projection) => {
            *scope = check_projection(projection, scope, analysis)?;
            if let Some(predicate) = &projection.predicate {
                check_expr(predicate, scope, analysis, false)?;
            }
        }
        Clause::Return(projection) => {
            *scope = check_projection(projection, scope, analysis)?;
        }
        Clause::Create(patterns) => {
            for pattern in patterns {
                check_write_pattern(pattern, scope, analysis, "CREATE")?;
            }
        }
        Clause::Merge {
            pattern,
            on_create,
            on_match,
        } => {
            if pattern.steps.len() > 1 {
                return Err(QueryError::semantic(
                    "MERGE supports a single node or a single relationship pattern",
                ));
            }
            check_write_pattern(pattern, scope, analysis, "MERGE")?;
            for item in on_create.iter().chain(on_match) {
                check_set_item(item, scope, analysis)?;
            }
        }
        Clause::Set(items) => {
            for item in items {
                check_set_item(item, scope, analysis)?;
            }
        }
        Clause::Remove(items) => {
            for item in items {
                let var = match item {
                    RemoveItem::Property { var, .. } | RemoveItem::Labels { var, .. } => var,
                };
                require(scope, var)?;
            }
        }
        Clause::Delete { exprs, .. } => {
            for expr in exprs {
                check_expr(expr, scope, analysis, false)?;
            }
        }
        Clause::Call {
            procedure,
            args,
            yields,
            predicate,
        } => {
            let proc = procedures::lookup(procedure)
                .ok_or_else(|| QueryError::UnknownProcedure(procedure.clone()))?;
            let (min, max) = proc.arity();
            if args.len() < min || args.len() > max {
                return Err(QueryError::semantic(format!(
                    "procedure `{procedure}` takes {min} to {max} arguments, got {}",
                    args.len()
                )));
            }
            for arg in args {
                check_expr(arg, scope, analysis, false)?;
            }
            match yields {
                Some(items) => {
                    for (name, alias) in items {
                        if !proc.outputs().contains(&name.as_str()) {
                            return Err(QueryError::semantic(format!(
                                "procedure `{procedure}` has no output `{name}`"
                            )));
                        }
                        declare(scope, alias)?;
                    }
                }
                None => {
                    for name in proc.outputs() {
                        declare(scope, name)?;
                    }
                }
            }
            if let Some(predicate) = predicate {
                check_expr(predicate, scope, analysis, false)?;
            }
        }
    }
    Ok(())
}

fn declare(scope: &mut Scope, name: &str) -> Result<(), QueryError> {
    if !scope.insert(name.to_owned()) {
        return Err(QueryError::semantic(format!(
            "variable `{name}` already declared"
        )));
    }
    Ok(())
}

fn require(scope: &Scope, name: &str) -> Result<(), QueryError> {
    if scope.contains(name) {
        Ok(())
    } else {
        Err(QueryError::UnboundVariable(name.to_owned()))
    }
}

fn bind_match_pattern(pattern: &PatternPath, scope: &mut Scope) -> Result<(), QueryError> {
    for node in pattern.nodes() {
        if let Some(var) = &node.var {
            scope.insert(var.clone());
        }
    }
    for (rel, _) in &pattern.steps {
        if let Some((Some(min), Some(max))) = rel.length {
            if min > max {
                return Err(QueryError::semantic(format!(
                    "invalid hop range *{min}..{max}"
                )));
            }
        }
        if let Some(var) = &rel.var {
            declare(scope, var)?;
        }
    }
    if let Some(var) = &pattern.var {
        declare(scope, var)?;
    }
    Ok(())
}

fn pattern_exprs(pattern: &PatternPath, scope: &Scope, analysis: &mut Analysis) -> Result<(), QueryError> {
    for node in pattern.nodes() {
        if let Some(props) = &node.props {
            check_expr(props, scope, analysis, false)?;
        }
    }
    for (rel, _) in &pattern.steps {
        if let Some(props) = &rel.props {
            check_expr(props, scope, analysis, false)?;
        }
    }
    Ok(())
}

fn check_write_pattern(
    pattern: &PatternPath,
    scope: &mut Scope,
    analysis: &mut Analysis,
    clause: &str,
) -> Result<(), QueryError> {
    if pattern.shortest.is_some() {
        return Err(QueryError::semantic(format!(
            "shortestPath cannot be used in {clause}"
        )));
    }
    let outer = scope.clone();
    for node in pattern.nodes() {
        if let Some(props) = &node.props {
            check_expr(props, scope, analysis, false)?;
        }
        let Some(var) = &node.var else { continue };
        if outer.contains(var) && (!node.labels.is_empty() || node.props.is_some()) {
            return Err(QueryError::semantic(format!(
                "can't {clause} node `{var}` with labels or properties: the variable is already declared"
            )));
        }
        scope.insert(var.clone());
    }
    for (rel, _) in &pattern.steps {
        if rel.types.len() != 1 {
            return Err(QueryError::semantic(format!(
                "exactly one relationship type must be specified for {clause}"
            )));
        }
        if rel.length.is_some() {
            return Err(QueryError::semantic(format!(
                "variable length relationships cannot be used in {clause}"
            )));
        }
        if rel.direction == RelDirection::Either && clause == "CREATE" {
            return Err(QueryError::semantic(
                "only directed relationships are supported in CREATE",
            ));
        }
        if let Some(props) = &rel.props {
            check_expr(props, scope, analysis, false)?;
        }
        if let Some(var) = &rel.var {
            declare(scope, var)?;
        }
    }
    if let Some(var) = &pattern.var {
        declare(scope, var)?;
    }
    Ok(())
}

fn check_set_item(item: &SetItem, scope: &Scope, analysis: &mut Analysis) -> Result<(), QueryError> {
    match item {
        SetItem::Property { var, value, .. }
        | SetItem::Replace { var, value }
        | SetItem::Merge { var, value } => {
            require(scope, var)?;
            check_expr(value, scope, analysis, false)
        }
        SetItem::Labels { var, .. } => require(scope, var),
    }
}

/// Checks a projection and returns the scope after it.
fn check_projection(projection: &Projection, scope: &Scope, analysis: &mut Analysis) -> Result<Scope, QueryError> {
    let mut out = if projection.star {
        if scope.is_empty() {
            return Err(QueryError::semantic(
                "RETURN * is not allowed when there are no variables in scope",
            ));
        }
        scope.clone()
    } else {
        Scope::new()
    };
    let mut aggregating = false;
    for item in &projection.items {
        check_expr(&item.expr, scope, analysis, true)?;
        aggregating |= item.expr.contains_aggregate();
        if !out.insert(item.alias.clone()) && !projection.star {
            return Err(QueryError::semantic(format!(
                "multiple result columns with the same name `{}`",
                item.alias
            )));
        }
    }
    let restricted = aggregating || projection.distinct;
    for (key, _) in &projection.order_by {
        if restricted {
            if projection.items.iter().any(|item| item.expr == *key) {
                continue;
            }
            check_expr(key, &out, analysis, false)?;
        } else {
            let visible: Scope = scope.union(&out).cloned().collect();
            check_expr(key, &visible, analysis, false)?;
        }
    }
    for bound in projection.skip.iter().chain(&projection.limit) {
        check_expr(bound, &Scope::new(), analysis, false)?;
    }
    Ok(out)
}

/// Checks variables, function names and aggregate placement.
fn check_expr(expr: &Expr, scope: &Scope, analysis: &mut Analysis, allow_aggregate: bool) -> Result<(), QueryError> {
    let mut failure = None;
    expr.walk(&mut |e| {
        if failure.is_some() {
            return;
        }
        match e {
            Expr::Var(name) if !scope.contains(name) => {
                failure = Some(QueryError::UnboundVariable(name.clone()));
            }
            Expr::Param(name) => {
                analysis.params.insert(name.clone());
            }
            Expr::Call { name, args, .. } => match function_arity(name) {
                None => failure = Some(QueryError::UnknownFunction(name.clone())),
                Some((min, max)) if args.len() < min || args.len() > max => {
                    failure = Some(QueryError::semantic(format!(
                        "function `{name}` called with {} argument(s)",
                        args.len()
                    )));
                }
                Some(_) => {}
            },
            _ => {}
        }
    });
    if let Some(err) = failure {
        return Err(err);
    }
    if expr.contains_aggregate() {
        if !allow_aggregate {
            return Err(QueryError::semantic(
                "aggregate functions are only allowed in RETURN and WITH",
            ));
        }
        let mut nested = false;
        expr.walk(&mut |e| {
            if let Expr::Call { args, name, .. } = e {
                if super::ast::AGGREGATES.contains(&name.to_ascii_lowercase().as_str())
                    && args.iter().any(Expr::contains_aggregate)
                {
                    nested = true;
                }
            }
        });
        if nested {
            return Err(QueryError::semantic("aggregate calls cannot be nested"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::parser::parse;

    fn check(query: &str) -> Result<Analysis, QueryError> {
        validate(&parse(query).unwrap())
    }

    #[test]
    fn collects_parameters() {
        let analysis = check("MATCH (n:Person {name: $name}) WHERE n.age > $min RETURN n").unwrap();
        assert_eq!(
            analysis.params.into_iter().collect::<Vec<_>>(),
            vec!["min".to_string(), "name".to_string()]
        );
    }

    #[test]
    fn rejects_unbound_variables() {
        assert!(matches!(
            check("MATCH (n) RETURN m"),
            Err(QueryError::UnboundVariable(v)) if v == "m"
        ));
        assert!(matches!(
            check("MATCH (n) WITH n.name AS name RETURN n"),
            Err(QueryError::UnboundVariable(_))
        ));
        assert!(check("MATCH (n) WITH n ORDER BY n.age RETURN n").is_ok());
    }

    #[test]
    fn clause_order_and_endings() {
        assert!(check("RETURN 1 RETURN 2").is_err());
        assert!(check("MATCH (n)").is_err());
        assert!(check("CREATE (n:Note)").is_ok());
        assert!(check("CALL db.labels()").is_ok());
    }

    #[test]
    fn aggregates_only_in_projections() {
        assert!(check("MATCH (n) WHERE count(*) > 1 RETURN n").is_err());
        assert!(check("MATCH (n) RETURN n.kind, count(*) AS c ORDER BY c DESC").is_ok());
        assert!(check("RETURN count(count(*))").is_err());
    }

    #[test]
    fn unknown_functions_and_procedures() {
        assert!(matches!(check("RETURN nope(1)"), Err(QueryError::UnknownFunction(_))));
        assert!(matches!(check("CALL db.nope()"), Err(QueryError::UnknownProcedure(_))));
        assert!(check("RETURN toUpper('a', 'b')").is_err());
    }

    #[test]
    fn write_pattern_shape() {
        assert!(check("CREATE (a)-[:KNOWS]-(b)").is_err());
        assert!(check("CREATE (a)-[:A|B]->(b)").is_err());
        assert!(check("MATCH (a) CREATE (a:Person)").is_err());
        assert!(check("MATCH (a), (b) CREATE (a)-[:KNOWS]->(b)").is_ok());
        assert!(check("MERGE (a)-[:R]->(b)-[:R]->(c)").is_err());
    }
}

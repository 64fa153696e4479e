//! Expand-to-subquery correlation.
//!
//! An expand column `a.b.c { ... }` becomes an inner SELECT from
//! `<source>:a.b.c`, normalized through the full pipeline. The inner
//! query then carries a terminating EXISTS whose where-clause references
//! the expand root entity; that innermost EXISTS is replaced by an
//! equality correlation against the enclosing query's alias.

use super::errors::RewriteError;
use super::expression::ExprEnv;
use crate::cqn::ast::{Column, Expr, RefStep, SelectQuery, Source, SourceRef, Xpr};

/// Rewrite an expand-over-association column into a correlated subquery
/// column. Returns `None` when the subquery has nothing to project.
pub(crate) fn build_expand_column(
    column: &Column,
    name: &str,
    one: bool,
    env: &ExprEnv,
) -> Result<Option<Column>, RewriteError> {
    let Expr::Ref(root) = &column.expr else {
        return Ok(None);
    };

    // The contributing source: entity and alias the subquery correlates
    // with.
    let outer_alias = root.links[0].alias.clone();
    let source_def = env
        .scope
        .lookup_source(&outer_alias)
        .or_else(|| env.scope.lookup_outer(&outer_alias))
        .cloned()
        .ok_or_else(|| RewriteError::AssocInExpression { path: root.path() })?;

    // Inner from: `<source>:path`, keeping the step filters.
    let explicit_root = root.links[0].definition.as_entity().is_some();
    let mut steps: Vec<RefStep> = vec![RefStep::new(source_def.name.clone())];
    let path_steps = if explicit_root {
        &root.steps[1..]
    } else {
        &root.steps[..]
    };
    for step in path_steps {
        let mut s = step.clone();
        if let Some(filter) = &mut s.filter {
            for t in filter.iter_mut() {
                t.strip_links();
            }
        }
        steps.push(s);
    }

    let sub_alias = path_steps
        .last()
        .map(|s| s.name.clone())
        .unwrap_or_else(|| name.to_string());

    let mut inner = SelectQuery::from(Source::Ref(SourceRef::aliased(
        crate::cqn::ast::RefExpr::new(steps),
        sub_alias,
    )));
    inner.columns = column.expand.clone().unwrap_or_default();
    inner.excluding = column.excluding.clone();
    inner.where_clause = column.where_clause.clone();
    inner.order_by = column.order_by.clone();
    inner.limit = column.limit.clone();
    inner.localized = env.scope.localized;
    inner.one = one;
    inner.expand = true;

    let (mut flat, _meta) = env.rw.rewrite_select(inner, None)?;

    patch_correlation(&mut flat, &outer_alias);

    let mut col = Column::new(Expr::Select(Box::new(flat)));
    col.alias = Some(name.to_string());
    Ok(Some(col))
}

/// Replace the innermost EXISTS of the normalized expand query by its
/// where-clause, correlated against the enclosing query's alias.
fn patch_correlation(sel: &mut SelectQuery, outer_alias: &str) -> bool {
    match &mut sel.where_clause {
        Some(tokens) => {
            let patched = patch_in_tokens(tokens, outer_alias);
            if tokens.is_empty() {
                sel.where_clause = None;
            }
            patched
        }
        None => false,
    }
}

fn patch_in_tokens(tokens: &mut Xpr, outer_alias: &str) -> bool {
    for idx in (1..tokens.len()).rev() {
        if !tokens[idx - 1].is_keyword("exists") {
            continue;
        }
        let Expr::Select(sub) = &mut tokens[idx] else {
            continue;
        };
        // Descend into a deeper trailing EXISTS first.
        if let Some(inner) = &mut sub.where_clause {
            if patch_in_tokens(inner, outer_alias) {
                return true;
            }
        }
        // This is the innermost subquery: splice its where-clause in
        // place of the EXISTS, renaming its own alias to the outer one.
        let own_alias = from_alias_of(sub);
        let mut cond = sub.where_clause.take().unwrap_or_default();
        if let Some(own) = own_alias {
            rename_alias(&mut cond, &own, outer_alias);
        }
        let replacement = if cond.len() > 3 {
            vec![Expr::Xpr(cond)]
        } else {
            cond
        };
        tokens.splice(idx - 1..=idx, replacement);
        return true;
    }
    false
}

fn from_alias_of(sel: &SelectQuery) -> Option<String> {
    match &sel.from {
        Source::Ref(sr) => sr.alias.clone(),
        _ => None,
    }
}

fn rename_alias(tokens: &mut [Expr], from: &str, to: &str) {
    for token in tokens.iter_mut() {
        match token {
            Expr::Ref(r) => {
                if r.steps.first().is_some_and(|s| s.name == from) {
                    r.steps[0].name = to.to_string();
                }
            }
            Expr::Func(f) => rename_alias(&mut f.args, from, to),
            Expr::Xpr(inner) | Expr::List(inner) => rename_alias(inner, from, to),
            _ => {}
        }
    }
}

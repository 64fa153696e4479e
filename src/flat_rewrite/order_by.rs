//! `orderBy` and `groupBy` rewriting.
//!
//! Both use the standard reference rewriting. In `orderBy`, a reference
//! flattening to more than one column is rejected because the ordering
//! would be positional and unstable; in `groupBy`, structured references
//! expand into one expression per leaf.

use super::errors::RewriteError;
use super::expression::{
    comparison_leaves, flat_ref_of, rewrite_operand, rewrite_tokens, shape_of, ExprEnv,
    OperandShape,
};
use crate::cqn::ast::{Expr, OrderItem, Xpr};
use crate::query_inference::join_tree::JoinTree;
use crate::query_inference::resolver::{resolve_ref, ResolveEnv};

pub(crate) fn rewrite_order_by(
    items: Vec<OrderItem>,
    env: &ExprEnv,
    jt: &mut JoinTree,
) -> Result<Vec<OrderItem>, RewriteError> {
    let mut out = Vec::with_capacity(items.len());
    for mut item in items {
        let expr = std::mem::replace(&mut item.expr, Expr::Star);
        let rewritten = rewrite_order_expr(expr, env, jt)?;
        out.push(OrderItem {
            expr: rewritten,
            sort: item.sort,
            nulls: item.nulls,
        });
    }
    Ok(out)
}

fn rewrite_order_expr(expr: Expr, env: &ExprEnv, jt: &mut JoinTree) -> Result<Expr, RewriteError> {
    let mut r = match expr {
        Expr::Ref(r) => r,
        Expr::Xpr(tokens) => return Ok(Expr::Xpr(rewrite_tokens(&tokens, env, jt)?)),
        other => return rewrite_operand(&other, env, jt),
    };

    // A single name that matches an inferred element orders by that
    // element's defining column.
    if r.steps.len() == 1 {
        if let Some(projection) = env.projection {
            if let Some(column) = projection.by_name.get(&r.steps[0].name) {
                return rewrite_order_expr(column.expr.clone(), env, jt);
            }
        }
    }

    let renv = ResolveEnv::new(env.model, env.scope);
    resolve_ref(&mut r, &renv, jt)?;
    let as_expr = Expr::Ref(r.clone());
    match shape_of(&as_expr) {
        OperandShape::Scalar => Ok(flat_ref_of(&r)),
        OperandShape::Struct | OperandShape::Assoc | OperandShape::Entity => {
            let leaves = comparison_leaves(&as_expr, env)?;
            match leaves.len() {
                1 => Ok(leaves.into_iter().next().map(|(_, e)| e).unwrap_or(as_expr)),
                n => Err(RewriteError::AmbiguousOrderBy {
                    path: r.path(),
                    columns: n,
                }),
            }
        }
    }
}

pub(crate) fn rewrite_group_by(
    exprs: Vec<Expr>,
    env: &ExprEnv,
    jt: &mut JoinTree,
) -> Result<Vec<Expr>, RewriteError> {
    let mut out: Xpr = Vec::with_capacity(exprs.len());
    for expr in exprs {
        let mut r = match expr {
            Expr::Ref(r) => r,
            other => {
                out.push(rewrite_operand(&other, env, jt)?);
                continue;
            }
        };
        let renv = ResolveEnv::new(env.model, env.scope);
        resolve_ref(&mut r, &renv, jt)?;
        let as_expr = Expr::Ref(r.clone());
        match shape_of(&as_expr) {
            OperandShape::Scalar => out.push(flat_ref_of(&r)),
            OperandShape::Struct | OperandShape::Assoc | OperandShape::Entity => {
                for (_, leaf) in comparison_leaves(&as_expr, env)? {
                    out.push(leaf);
                }
            }
        }
    }
    Ok(out)
}

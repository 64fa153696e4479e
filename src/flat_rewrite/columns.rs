//! Projection rewriting.
//!
//! Consumes the inferred projection plan: flattens references (one flat
//! column per scalar leaf, foreign-key leaves for managed associations),
//! emits wildcard entries, inlines nested projections and turns expands
//! over associations into correlated subqueries. Virtual elements are
//! dropped; an all-virtual projection is an error.

use super::errors::RewriteError;
use super::expand::build_expand_column;
use super::expression::{flat_ref_parts, rewrite_operand, rewrite_tokens, ExprEnv};
use crate::cqn::ast::{Column, Expr, ResolvedDef};
use crate::model_catalog::csn_model::ElementDef;
use crate::query_inference::elements::{struct_leaves, Projection, ProjectionItem};
use crate::query_inference::join_tree::JoinTree;
use crate::query_inference::resolver::table_alias_and_flat;

pub(crate) fn rewrite_columns(
    projection: &Projection,
    env: &ExprEnv,
    jt: &mut JoinTree,
) -> Result<Vec<Column>, RewriteError> {
    let mut out: Vec<Column> = Vec::with_capacity(projection.items.len());

    for item in &projection.items {
        match item {
            ProjectionItem::Column { column, name } => {
                rewrite_explicit(column, name, env, jt, &mut out)?;
            }
            ProjectionItem::WildcardElement { alias, elem, name } => {
                rewrite_wildcard_entry(alias, elem, name, &mut out);
            }
            ProjectionItem::Expand {
                column,
                name,
                one,
                skipped,
            } => {
                if *skipped {
                    continue;
                }
                if let Some(col) = build_expand_column(column, name, *one, env)? {
                    out.push(col);
                }
            }
        }
    }

    if out.is_empty() {
        return Err(RewriteError::EmptyProjection);
    }
    Ok(out)
}

fn rewrite_explicit(
    column: &Column,
    name: &str,
    env: &ExprEnv,
    jt: &mut JoinTree,
    out: &mut Vec<Column>,
) -> Result<(), RewriteError> {
    let Expr::Ref(r) = &column.expr else {
        return rewrite_value_column(column, env, jt, out);
    };

    // Pseudo paths render as is.
    if r.links
        .first()
        .and_then(|l| l.definition.as_element())
        .is_some_and(|e| e.pseudo)
    {
        let mut clean = r.clone();
        clean.strip_links();
        let mut col = Column::new(Expr::Ref(clean));
        col.alias = column.alias.clone();
        col.cast = column.cast.clone();
        out.push(col);
        return Ok(());
    }

    if r.is_self_root() {
        let expr = rewrite_operand(&column.expr, env, jt)?;
        let mut col = Column::new(expr);
        col.alias = Some(name.to_string());
        col.cast = column.cast.clone();
        out.push(col);
        return Ok(());
    }

    let leaf = r.leaf_link().map(|l| l.definition.clone());
    match leaf {
        Some(ResolvedDef::Element(elem)) if elem.virtual_ => Ok(()),
        Some(ResolvedDef::Element(elem)) if elem.is_structured() => {
            let (alias, base_flat) = table_alias_and_flat(r);
            for (path, leaf_def) in struct_leaves(&elem) {
                if leaf_def.virtual_ {
                    continue;
                }
                let flat = format!("{}_{}", base_flat, path.join("_"));
                let elem_name = format!("{}_{}", name, path.join("_"));
                let mut col = Column::new(flat_ref_parts(&alias, &flat));
                if elem_name != flat {
                    col.alias = Some(elem_name);
                }
                out.push(col);
            }
            Ok(())
        }
        Some(ResolvedDef::Element(elem)) if elem.is_association() => {
            if !elem.is_managed() {
                return Err(RewriteError::AssocInExpression { path: r.path() });
            }
            let (alias, base_flat) = table_alias_and_flat(r);
            let info = elem.association.as_ref().ok_or_else(|| {
                RewriteError::AssocInExpression { path: r.path() }
            })?;
            for fk in &info.keys {
                let flat = format!("{}_{}", base_flat, fk.flat_tail());
                let elem_name = format!("{}_{}", name, fk.flat_tail());
                let mut col = Column::new(flat_ref_parts(&alias, &flat));
                if elem_name != flat {
                    col.alias = Some(elem_name);
                }
                out.push(col);
            }
            Ok(())
        }
        Some(ResolvedDef::Element(_)) | Some(ResolvedDef::Entity(_)) | None => {
            let (alias, flat) = table_alias_and_flat(r);
            if flat.is_empty() {
                return Err(RewriteError::StructInExpression { path: r.path() });
            }
            let mut col = Column::new(flat_ref_parts(&alias, &flat));
            if name != flat {
                col.alias = Some(name.to_string());
            }
            col.cast = column.cast.clone();
            out.push(col);
            Ok(())
        }
    }
}

fn rewrite_value_column(
    column: &Column,
    env: &ExprEnv,
    jt: &mut JoinTree,
    out: &mut Vec<Column>,
) -> Result<(), RewriteError> {
    let expr = match &column.expr {
        Expr::Val(_) | Expr::Param(_) => column.expr.clone(),
        Expr::Xpr(tokens) => Expr::Xpr(rewrite_tokens(tokens, env, jt)?),
        other => rewrite_operand(other, env, jt)?,
    };
    let mut col = Column::new(expr);
    col.alias = column.alias.clone();
    col.cast = column.cast.clone();
    out.push(col);
    Ok(())
}

fn rewrite_wildcard_entry(
    alias: &str,
    elem: &ElementDef,
    name: &str,
    out: &mut Vec<Column>,
) {
    if elem.virtual_ {
        return;
    }
    if elem.is_association() {
        if !elem.is_managed() {
            return;
        }
        if let Some(info) = elem.association.as_ref() {
            for fk in &info.keys {
                let flat = format!("{}_{}", name, fk.flat_tail());
                out.push(Column::new(flat_ref_parts(alias, &flat)));
            }
        }
        return;
    }
    if elem.is_structured() {
        for (path, leaf_def) in struct_leaves(elem) {
            if leaf_def.virtual_ {
                continue;
            }
            let flat = format!("{}_{}", name, path.join("_"));
            out.push(Column::new(flat_ref_parts(alias, &flat)));
        }
        return;
    }
    out.push(Column::new(flat_ref_parts(alias, name)));
}

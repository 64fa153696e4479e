//! Token-stream rewriting.
//!
//! Walks `where`/`having`/`on` streams replacing every reference by its
//! flat `{alias, column}` form, recursing into nested subqueries,
//! synthesizing EXISTS chains for association predicates, expanding
//! structural comparisons into matched leaf sequences and normalizing
//! empty IN lists.

use std::sync::Arc;

use super::errors::RewriteError;
use super::from_exists::synthesize_exists;
use super::on_condition::rewrite_on_roots;
use super::Rewriter;
use crate::cqn::ast::{Expr, Literal, RefExpr, ResolvedDef, Xpr};
use crate::model_catalog::csn_model::{CsnModel, Definition, ElementDef};
use crate::query_inference::elements::{struct_leaves, Projection};
use crate::query_inference::join_tree::JoinTree;
use crate::query_inference::resolver::{
    resolve_ref, table_alias_and_flat, RefCategory, ResolveEnv,
};
use crate::query_inference::scope::QueryScope;

const MAX_BACKLINK_DEPTH: u8 = 8;

/// Shared context of one rewriting pass over a query's clauses.
pub(crate) struct ExprEnv<'a> {
    pub rw: &'a Rewriter<'a>,
    pub model: &'a CsnModel,
    pub scope: &'a QueryScope<'a>,
    pub projection: Option<&'a Projection>,
    pub depth: u8,
}

impl<'a> ExprEnv<'a> {
    fn deeper(&self) -> ExprEnv<'a> {
        ExprEnv {
            rw: self.rw,
            model: self.model,
            scope: self.scope,
            projection: self.projection,
            depth: self.depth + 1,
        }
    }
}

/// Rewrite a token stream into its flat form.
pub(crate) fn rewrite_tokens(
    tokens: &[Expr],
    env: &ExprEnv,
    jt: &mut JoinTree,
) -> Result<Xpr, RewriteError> {
    let mut out = Xpr::new();
    let mut i = 0;
    while i < tokens.len() {
        if tokens[i].is_keyword("exists") {
            match tokens.get(i + 1) {
                Some(Expr::Ref(r)) => {
                    let sub = synthesize_exists(r, env, jt)?;
                    out.push(Expr::kw("exists"));
                    out.push(Expr::Select(sub));
                    i += 2;
                    continue;
                }
                Some(Expr::Select(s)) => {
                    let (flat, _) = env.rw.rewrite_select((**s).clone(), Some(env.scope))?;
                    out.push(Expr::kw("exists"));
                    out.push(Expr::Select(Box::new(flat)));
                    i += 2;
                    continue;
                }
                _ => {
                    out.push(tokens[i].clone());
                    i += 1;
                    continue;
                }
            }
        }

        if is_operand(&tokens[i]) {
            if let Some((op, op_len)) = comparison_op(tokens, i + 1) {
                if let Some(rhs) = tokens.get(i + 1 + op_len) {
                    let seq = rewrite_comparison(&tokens[i], &op, rhs, env, jt)?;
                    out.extend(seq);
                    i += op_len + 2;
                    continue;
                }
            }
        }

        out.push(rewrite_operand(&tokens[i], env, jt)?);
        i += 1;
    }
    Ok(out)
}

fn is_operand(e: &Expr) -> bool {
    !matches!(e, Expr::Keyword(_))
}

/// Parse the comparison operator starting at token `i`, returning its
/// canonical lowercase spelling and how many tokens it spans.
fn comparison_op(tokens: &[Expr], i: usize) -> Option<(String, usize)> {
    let Some(Expr::Keyword(k)) = tokens.get(i) else {
        return None;
    };
    let k = k.to_lowercase();
    match k.as_str() {
        "=" | "==" | "!=" | "<>" | "<" | "<=" | ">" | ">=" | "like" | "in" => Some((k, 1)),
        "is" => match tokens.get(i + 1) {
            Some(Expr::Keyword(n)) if n.eq_ignore_ascii_case("not") => {
                Some(("is not".to_string(), 2))
            }
            _ => Some(("is".to_string(), 1)),
        },
        "not" => match tokens.get(i + 1) {
            Some(Expr::Keyword(n)) if n.eq_ignore_ascii_case("in") => {
                Some(("not in".to_string(), 2))
            }
            Some(Expr::Keyword(n)) if n.eq_ignore_ascii_case("like") => {
                Some(("not like".to_string(), 2))
            }
            _ => None,
        },
        _ => None,
    }
}

fn op_keywords(op: &str) -> Vec<Expr> {
    op.split_whitespace().map(Expr::kw).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OperandShape {
    Scalar,
    Struct,
    Assoc,
    Entity,
}

pub(crate) fn shape_of(expr: &Expr) -> OperandShape {
    let Expr::Ref(r) = expr else {
        return OperandShape::Scalar;
    };
    if r.is_self_root() || r.links.is_empty() {
        return OperandShape::Scalar;
    }
    if let Some(link) = r.leaf_link() {
        match &link.definition {
            ResolvedDef::Entity(_) => {
                if r.steps.len() == 1 {
                    return OperandShape::Entity;
                }
            }
            ResolvedDef::Element(e) => {
                if e.pseudo {
                    return OperandShape::Scalar;
                }
                if e.is_association() {
                    return OperandShape::Assoc;
                }
                if e.is_structured() {
                    return OperandShape::Struct;
                }
            }
        }
    }
    OperandShape::Scalar
}

fn rewrite_comparison(
    lhs: &Expr,
    op: &str,
    rhs: &Expr,
    env: &ExprEnv,
    jt: &mut JoinTree,
) -> Result<Xpr, RewriteError> {
    let mut l = lhs.clone();
    let mut r = rhs.clone();
    ensure_resolved(&mut l, env, jt)?;
    ensure_resolved(&mut r, env, jt)?;

    // IN with an empty list collapses to a null comparison so database
    // behavior is uniform.
    if let Expr::List(items) = &r {
        if items.is_empty() && (op == "in" || op == "not in") {
            let mut out = vec![rewrite_operand(&l, env, jt)?];
            if op == "in" {
                out.push(Expr::kw("="));
                out.push(Expr::null());
            } else {
                out.push(Expr::kw("is"));
                out.push(Expr::kw("not"));
                out.push(Expr::null());
            }
            return Ok(out);
        }
    }

    let l_shape = shape_of(&l);
    let r_shape = shape_of(&r);

    if l_shape == OperandShape::Scalar && r_shape == OperandShape::Scalar {
        let mut out = vec![rewrite_operand(&l, env, jt)?];
        out.extend(op_keywords(op));
        out.push(rewrite_operand(&r, env, jt)?);
        return Ok(out);
    }

    // At least one structured operand from here on.
    let struct_path = |e: &Expr| match e {
        Expr::Ref(r) => r.path(),
        _ => String::new(),
    };

    match op {
        "<" | "<=" | ">" | ">=" => {
            let path = if l_shape != OperandShape::Scalar {
                struct_path(&l)
            } else {
                struct_path(&r)
            };
            return Err(RewriteError::UnsupportedStructuralComparison {
                op: op.to_string(),
                path,
            });
        }
        "=" | "==" | "is" | "!=" | "<>" | "is not" => {}
        _ => {
            let path = if l_shape != OperandShape::Scalar {
                struct_path(&l)
            } else {
                struct_path(&r)
            };
            return Err(RewriteError::UnsupportedStructuralComparison {
                op: op.to_string(),
                path,
            });
        }
    }
    let negated = matches!(op, "!=" | "<>" | "is not");

    // Normalize so the structured operand is on the left.
    let (sl, sr, flipped) = if l_shape == OperandShape::Scalar {
        (&r, &l, true)
    } else {
        (&l, &r, false)
    };
    let sl_shape = if flipped { r_shape } else { l_shape };
    let sr_shape = if flipped { l_shape } else { r_shape };

    // Structured against a scalar: only null is comparable.
    if sr_shape == OperandShape::Scalar {
        if matches!(sr, Expr::Val(Literal::Null)) || sr.is_keyword("null") {
            let leaves = comparison_leaves(sl, env)?;
            return Ok(emit_null_checks(&leaves, negated));
        }
        return Err(RewriteError::CannotCompareStructWithValue {
            path: struct_path(sl),
        });
    }

    // An unmanaged association against the peer entity: substitute the
    // backlink's on-condition with the aliases of this traversal.
    if let Some(tokens) = backlink_substitution(sl, sl_shape, sr, sr_shape, env)? {
        if env.depth >= MAX_BACKLINK_DEPTH {
            return Err(RewriteError::UnresolvableBacklink {
                path: struct_path(sl),
            });
        }
        return rewrite_tokens(&tokens, &env.deeper(), jt);
    }

    let left_leaves = comparison_leaves(sl, env)?;
    let right_leaves = comparison_leaves(sr, env)?;
    let mut pairs: Vec<(Expr, Expr)> = Vec::new();
    let mut unmatched: Vec<String> = Vec::new();
    for (key, lf) in &left_leaves {
        match right_leaves.iter().find(|(k, _)| k == key) {
            Some((_, rf)) => {
                if flipped {
                    pairs.push((rf.clone(), lf.clone()));
                } else {
                    pairs.push((lf.clone(), rf.clone()));
                }
            }
            None => unmatched.push(key.join(".")),
        }
    }
    for (key, _) in &right_leaves {
        if !left_leaves.iter().any(|(k, _)| k == key) {
            unmatched.push(key.join("."));
        }
    }
    if !unmatched.is_empty() {
        return Err(RewriteError::StructuralShapeMismatch {
            left: struct_path(sl),
            right: struct_path(sr),
            unmatched,
        });
    }

    let connective = if negated { "or" } else { "and" };
    let mut inner = Xpr::new();
    for (lf, rf) in &pairs {
        if !inner.is_empty() {
            inner.push(Expr::kw(connective));
        }
        inner.push(lf.clone());
        inner.extend(op_keywords(op));
        inner.push(rf.clone());
    }
    if pairs.len() > 1 {
        Ok(vec![Expr::Xpr(inner)])
    } else {
        Ok(inner)
    }
}

fn emit_null_checks(leaves: &[(Vec<String>, Expr)], negated: bool) -> Xpr {
    let mut inner = Xpr::new();
    let connective = if negated { "or" } else { "and" };
    for (_, leaf) in leaves {
        if !inner.is_empty() {
            inner.push(Expr::kw(connective));
        }
        inner.push(leaf.clone());
        inner.push(Expr::kw("is"));
        if negated {
            inner.push(Expr::kw("not"));
        }
        inner.push(Expr::kw("null"));
    }
    if leaves.len() > 1 {
        vec![Expr::Xpr(inner)]
    } else {
        inner
    }
}

/// When the left side is an unmanaged association and the right side the
/// peer entity (or vice versa after normalization), produce the
/// backlink's on-condition with the traversal aliases substituted.
fn backlink_substitution(
    sl: &Expr,
    sl_shape: OperandShape,
    sr: &Expr,
    sr_shape: OperandShape,
    _env: &ExprEnv,
) -> Result<Option<Xpr>, RewriteError> {
    // The association may sit on either side of the comparison.
    let (sl, sl_shape, sr, sr_shape) =
        if sl_shape == OperandShape::Entity && sr_shape == OperandShape::Assoc {
            (sr, sr_shape, sl, sl_shape)
        } else {
            (sl, sl_shape, sr, sr_shape)
        };
    if sl_shape != OperandShape::Assoc || sr_shape != OperandShape::Entity {
        return Ok(None);
    }
    let (Expr::Ref(lr), Expr::Ref(rr)) = (sl, sr) else {
        return Ok(None);
    };
    let Some(assoc) = lr.leaf_link().and_then(|l| l.definition.as_element().cloned()) else {
        return Ok(None);
    };
    if assoc.is_managed() {
        // Managed associations pair their foreign keys with the entity
        // keys through the regular leaf matching.
        return Ok(None);
    }
    let Some(info) = assoc.association.as_ref() else {
        return Ok(None);
    };
    let Some(on) = info.on.clone() else {
        return Err(RewriteError::UnresolvableBacklink { path: lr.path() });
    };
    let t_alias = lr.links[0].alias.clone();
    let s_alias = rr.links[0].alias.clone();
    let mut tokens = on;
    for t in tokens.iter_mut() {
        t.strip_links();
    }
    rewrite_on_roots(&mut tokens, &assoc.name, &t_alias, &s_alias);
    Ok(Some(tokens))
}

/// Enumerate the comparable leaves of a structured operand as
/// (path key, flat reference) pairs.
pub(crate) fn comparison_leaves(
    expr: &Expr,
    env: &ExprEnv,
) -> Result<Vec<(Vec<String>, Expr)>, RewriteError> {
    let Expr::Ref(r) = expr else {
        return Ok(Vec::new());
    };
    match shape_of(expr) {
        OperandShape::Entity => {
            let def: &Arc<Definition> = r.links[0]
                .definition
                .as_entity()
                .ok_or_else(|| RewriteError::StructInExpression { path: r.path() })?;
            let alias = r.links[0].alias.clone();
            Ok(def
                .keys()
                .map(|k| {
                    (
                        vec![k.name.clone()],
                        flat_ref_parts(&alias, &k.name),
                    )
                })
                .collect())
        }
        OperandShape::Assoc => {
            let elem = leaf_element(r)?;
            let (alias, base) = table_alias_and_flat(r);
            let info = elem
                .association
                .as_ref()
                .ok_or_else(|| RewriteError::AssocInExpression { path: r.path() })?;
            Ok(info
                .keys
                .iter()
                .map(|fk| {
                    (
                        fk.path.clone(),
                        flat_ref_parts(&alias, &format!("{}_{}", base, fk.flat_tail())),
                    )
                })
                .collect())
        }
        OperandShape::Struct => {
            let elem = leaf_element(r)?;
            let (alias, base) = table_alias_and_flat(r);
            Ok(struct_leaves(&elem)
                .into_iter()
                .map(|(path, _)| {
                    let flat = format!("{}_{}", base, path.join("_"));
                    (path, flat_ref_parts(&alias, &flat))
                })
                .collect())
        }
        OperandShape::Scalar => Ok(Vec::new()),
    }
}

fn leaf_element(r: &RefExpr) -> Result<Arc<ElementDef>, RewriteError> {
    r.leaf_link()
        .and_then(|l| l.definition.as_element().cloned())
        .ok_or_else(|| RewriteError::StructInExpression { path: r.path() })
}

pub(crate) fn flat_ref_parts(alias: &str, column: &str) -> Expr {
    Expr::Ref(RefExpr::from_names([alias.to_string(), column.to_string()]))
}

/// The flat `{alias, column}` rendering of a resolved scalar reference.
pub(crate) fn flat_ref_of(r: &RefExpr) -> Expr {
    let (alias, flat) = table_alias_and_flat(r);
    flat_ref_parts(&alias, &flat)
}

fn ensure_resolved(
    expr: &mut Expr,
    env: &ExprEnv,
    jt: &mut JoinTree,
) -> Result<(), RewriteError> {
    if let Expr::Ref(r) = expr {
        let renv = ResolveEnv::new(env.model, env.scope);
        resolve_ref(r, &renv, jt)?;
    }
    Ok(())
}

/// Rewrite a single operand token.
pub(crate) fn rewrite_operand(
    expr: &Expr,
    env: &ExprEnv,
    jt: &mut JoinTree,
) -> Result<Expr, RewriteError> {
    match expr {
        Expr::Ref(r0) => {
            let mut r = r0.clone();
            let renv = ResolveEnv::new(env.model, env.scope);
            let category = resolve_ref(&mut r, &renv, jt)?;
            match category {
                RefCategory::Pseudo => {
                    let mut clean = r.clone();
                    clean.strip_links();
                    Ok(Expr::Ref(clean))
                }
                RefCategory::SelfRef => substitute_self(&r, env, jt),
                RefCategory::Plain { .. } | RefCategory::Outer => match shape_of(&Expr::Ref(
                    r.clone(),
                )) {
                    OperandShape::Scalar => Ok(flat_ref_of(&r)),
                    OperandShape::Struct => {
                        Err(RewriteError::StructInExpression { path: r.path() })
                    }
                    OperandShape::Assoc => Err(RewriteError::AssocInExpression { path: r.path() }),
                    OperandShape::Entity => {
                        Err(RewriteError::StructInExpression { path: r.path() })
                    }
                },
            }
        }
        Expr::Val(_) | Expr::Param(_) | Expr::Keyword(_) | Expr::Star => Ok(expr.clone()),
        Expr::Func(f) => {
            let mut args = Vec::with_capacity(f.args.len());
            for a in &f.args {
                match a {
                    Expr::Xpr(ts) => args.push(Expr::Xpr(rewrite_tokens(ts, env, jt)?)),
                    other => args.push(rewrite_operand(other, env, jt)?),
                }
            }
            Ok(Expr::Func(crate::cqn::ast::FuncCall {
                name: f.name.clone(),
                args,
            }))
        }
        Expr::Xpr(ts) => Ok(Expr::Xpr(rewrite_tokens(ts, env, jt)?)),
        Expr::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for it in items {
                out.push(rewrite_operand(it, env, jt)?);
            }
            Ok(Expr::List(out))
        }
        Expr::Select(s) => {
            let (flat, _) = env.rw.rewrite_select((**s).clone(), Some(env.scope))?;
            Ok(Expr::Select(Box::new(flat)))
        }
    }
}

/// Replace a `$self.<element>` reference by the rewritten form of the
/// column that defines the element.
fn substitute_self(r: &RefExpr, env: &ExprEnv, jt: &mut JoinTree) -> Result<Expr, RewriteError> {
    let name = r.steps.get(1).map(|s| s.name.clone()).ok_or_else(|| {
        RewriteError::Inference(crate::query_inference::errors::InferenceError::UnknownName {
            path: r.path(),
            context: "an expression ($self cannot be used as a value)".to_string(),
        })
    })?;
    let column = env
        .projection
        .and_then(|p| p.by_name.get(&name))
        .cloned()
        .ok_or_else(|| {
            RewriteError::Inference(crate::query_inference::errors::InferenceError::UnknownName {
                path: r.path(),
                context: "the query's own elements".to_string(),
            })
        })?;
    rewrite_operand(&column.expr, env, jt)
}

/// AND-append a rewritten condition to a token stream, parenthesizing
/// compound additions.
pub(crate) fn and_append(dst: &mut Xpr, tokens: Xpr) {
    if tokens.is_empty() {
        return;
    }
    let wrapped = if tokens.len() > 3 {
        vec![Expr::Xpr(tokens)]
    } else {
        tokens
    };
    if dst.is_empty() {
        dst.extend(wrapped);
    } else {
        dst.push(Expr::kw("and"));
        dst.extend(wrapped);
    }
}

/// Prefix bare references with an alias: used for infix filters lowered
/// into a scope where plain names would otherwise be ambiguous.
pub(crate) fn prefix_plain_refs(tokens: &mut [Expr], alias: &str, known_aliases: &[&str]) {
    for token in tokens.iter_mut() {
        match token {
            Expr::Ref(r) => {
                if let Some(first) = r.steps.first() {
                    if !first.name.starts_with('$') && !known_aliases.contains(&first.name.as_str())
                    {
                        r.strip_links();
                        r.steps
                            .insert(0, crate::cqn::ast::RefStep::new(alias.to_string()));
                    }
                }
            }
            Expr::Func(f) => prefix_plain_refs(&mut f.args, alias, known_aliases),
            Expr::Xpr(inner) | Expr::List(inner) => prefix_plain_refs(inner, alias, known_aliases),
            _ => {}
        }
    }
}

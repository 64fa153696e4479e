//! `from` rewriting and EXISTS-chain synthesis.
//!
//! A path-shaped `from` reduces to its last step's target entity; every
//! earlier association step becomes a correlated `EXISTS (SELECT 1 FROM
//! ... WHERE <link> [AND <filter>])`, nested and AND-composed in reverse
//! order. A `where`-rooted `exists <assoc>` synthesizes the same chain
//! with source and target roles flipped.

use std::collections::HashSet;
use std::sync::Arc;

use indexmap::IndexMap;

use super::errors::RewriteError;
use super::expression::{and_append, prefix_plain_refs, rewrite_tokens, ExprEnv};
use super::joins::materialize_joins;
use super::on_condition::assoc_on_cqn;
use crate::cqn::ast::{
    Column, Expr, RefExpr, SelectQuery, Source, SourceRef, Xpr,
};
use crate::model_catalog::csn_model::{short_name_of, Definition};
use crate::query_inference::join_tree::JoinTree;
use crate::query_inference::resolver::{resolve_ref, ResolveEnv, ResolveMode};
use crate::query_inference::scope::QueryScope;

/// One level of an EXISTS chain: the entity it selects from, its alias,
/// the raw (CQN-level) link condition and an optional step filter whose
/// references are already alias-prefixed.
struct ChainLevel {
    entity: Arc<Definition>,
    alias: String,
    on_cqn: Xpr,
    filter: Option<Xpr>,
}

/// Rewrite a query source into its flat form, returning the source and
/// the flat where-conditions derived from path expansion and infix
/// filters.
pub(crate) fn rewrite_from(
    from: Source,
    env: &ExprEnv,
    jt: &mut JoinTree,
) -> Result<(Source, Xpr), RewriteError> {
    match from {
        Source::Ref(sr) => rewrite_from_ref(sr, env, jt),
        Source::Join(mut join) => {
            let mut additions = Xpr::new();
            let args = std::mem::take(&mut join.args);
            let mut new_args = Vec::with_capacity(args.len());
            for arg in args {
                let (rewritten, extra) = rewrite_from(arg, env, jt)?;
                new_args.push(rewritten);
                and_append(&mut additions, extra);
            }
            join.args = new_args;
            let on = std::mem::take(&mut join.on);
            join.on = rewrite_tokens(&on, env, jt)?;
            Ok((Source::Join(join), additions))
        }
        // Subquery sources were normalized before scope construction.
        Source::Select(sub) => Ok((Source::Select(sub), Xpr::new())),
    }
}

fn rewrite_from_ref(
    mut sr: SourceRef,
    env: &ExprEnv,
    jt: &mut JoinTree,
) -> Result<(Source, Xpr), RewriteError> {
    let alias = sr.alias.clone().unwrap_or_else(|| {
        short_name_of(&sr.ref_.steps.last().map(|s| s.name.clone()).unwrap_or_default())
            .to_string()
    });

    if sr.ref_.steps.len() == 1 {
        let physical = sr.ref_.links[0]
            .target
            .as_ref()
            .map(|t| t.name.clone())
            .unwrap_or_else(|| sr.ref_.steps[0].name.clone());
        let mut additions = Xpr::new();
        if let Some(mut filter) = sr.ref_.steps[0].filter.take() {
            for t in filter.iter_mut() {
                t.strip_links();
            }
            let known: Vec<&str> = env.scope.sources.keys().map(String::as_str).collect();
            prefix_plain_refs(&mut filter, &alias, &known);
            let flat = rewrite_tokens(&filter, env, jt)?;
            and_append(&mut additions, flat);
        }
        let source = Source::Ref(SourceRef::aliased(RefExpr::from_names([physical]), alias));
        return Ok((source, additions));
    }

    expand_from_path(sr, alias, env, jt)
}

/// Reduce a multi-step `from` to its last target plus a reverse chain of
/// where-exists subqueries.
fn expand_from_path(
    mut sr: SourceRef,
    alias: String,
    env: &ExprEnv,
    jt: &mut JoinTree,
) -> Result<(Source, Xpr), RewriteError> {
    let n = sr.ref_.steps.len() - 1;
    let links = sr.ref_.links.clone();
    let target = links[n]
        .target
        .clone()
        .ok_or_else(|| RewriteError::AssocInExpression {
            path: sr.ref_.path(),
        })?;

    let mut additions = Xpr::new();

    // The last step's filter applies to the reduced source itself.
    if let Some(mut filter) = sr.ref_.steps[n].filter.take() {
        for t in filter.iter_mut() {
            t.strip_links();
        }
        let known: Vec<&str> = env.scope.sources.keys().map(String::as_str).collect();
        prefix_plain_refs(&mut filter, &alias, &known);
        let flat = rewrite_tokens(&filter, env, jt)?;
        and_append(&mut additions, flat);
    }

    let mut taken: HashSet<String> = HashSet::new();
    taken.insert(alias.clone());

    // Levels in reverse: the level of step i selects the entity that
    // declares the association of step i.
    let mut levels: Vec<ChainLevel> = Vec::new();
    let mut outer_side = alias.clone();
    for i in (1..=n).rev() {
        let decl_entity = links[i - 1]
            .target
            .clone()
            .ok_or_else(|| RewriteError::AssocInExpression {
                path: sr.ref_.path(),
            })?;
        let base = if i == 1 {
            short_name_of(&decl_entity.name).to_string()
        } else {
            sr.ref_.steps[i - 1].name.clone()
        };
        let level_alias = unique_chain_alias(&base, &mut taken, env.scope);
        let assoc = links[i]
            .definition
            .as_element()
            .cloned()
            .ok_or_else(|| RewriteError::AssocInExpression {
                path: sr.ref_.path(),
            })?;
        let on_cqn = assoc_on_cqn(
            &assoc,
            &[sr.ref_.steps[i].name.clone()],
            &level_alias,
            &outer_side,
            true,
        );
        let filter = sr.ref_.steps[i - 1].filter.take().map(|mut f| {
            for t in f.iter_mut() {
                t.strip_links();
            }
            prefix_plain_refs(&mut f, &level_alias, &[]);
            f
        });
        levels.push(ChainLevel {
            entity: decl_entity,
            alias: level_alias.clone(),
            on_cqn,
            filter,
        });
        outer_side = level_alias;
    }

    log::debug!(
        "from expansion: {} reduced to {} with {} exists level(s)",
        sr.ref_.path(),
        target.name,
        levels.len()
    );
    let chain = build_chain(levels, env)?;
    and_append(&mut additions, vec![Expr::kw("exists"), Expr::Select(Box::new(chain))]);

    let source = Source::Ref(SourceRef::aliased(
        RefExpr::from_names([target.name.clone()]),
        alias,
    ));
    Ok((source, additions))
}

/// Synthesize the EXISTS chain of a `where`-rooted `exists <assoc-path>`
/// predicate: the chain follows the navigation forward, source and
/// target roles flipped relative to `from` expansion.
pub(crate) fn synthesize_exists(
    r: &RefExpr,
    env: &ExprEnv,
    jt: &mut JoinTree,
) -> Result<Box<SelectQuery>, RewriteError> {
    let mut resolved = r.clone();
    let renv = ResolveEnv::new(env.model, env.scope).with_mode(ResolveMode::Exists);
    resolve_ref(&mut resolved, &renv, jt)?;

    let mut taken: HashSet<String> = HashSet::new();
    let mut levels: Vec<ChainLevel> = Vec::new();
    let mut prev_alias = resolved.links[0].alias.clone();
    let mut struct_prefix: Vec<String> = Vec::new();

    for (i, step) in resolved.steps.iter().enumerate() {
        let Some(elem) = resolved.links[i].definition.as_element().cloned() else {
            // Explicit source alias root.
            continue;
        };
        if elem.is_structured() {
            struct_prefix.push(step.name.clone());
            continue;
        }
        if !elem.is_association() {
            return Err(RewriteError::AssocInExpression {
                path: resolved.path(),
            });
        }
        let target = resolved.links[i]
            .target
            .clone()
            .ok_or_else(|| RewriteError::AssocInExpression {
                path: resolved.path(),
            })?;
        let level_alias = unique_chain_alias(&step.name, &mut taken, env.scope);
        let mut assoc_path = std::mem::take(&mut struct_prefix);
        assoc_path.push(step.name.clone());
        let on_cqn = assoc_on_cqn(&elem, &assoc_path, &prev_alias, &level_alias, false);
        let filter = step.filter.clone().map(|mut f| {
            for t in f.iter_mut() {
                t.strip_links();
            }
            prefix_plain_refs(&mut f, &level_alias, &[]);
            f
        });
        levels.push(ChainLevel {
            entity: target,
            alias: level_alias.clone(),
            on_cqn,
            filter,
        });
        prev_alias = level_alias;
    }

    if levels.is_empty() {
        return Err(RewriteError::AssocInExpression {
            path: resolved.path(),
        });
    }
    let chain = build_chain(levels, env)?;
    Ok(Box::new(chain))
}

/// Assemble chain levels, outermost first, into nested `SELECT 1`
/// subqueries. Each level's conditions are rewritten in a scope covering
/// all chain aliases with the enclosing query's scope as parent.
fn build_chain(levels: Vec<ChainLevel>, env: &ExprEnv) -> Result<SelectQuery, RewriteError> {
    let mut chain_sources = IndexMap::new();
    for lvl in &levels {
        chain_sources.insert(lvl.alias.clone(), lvl.entity.clone());
    }
    let chain_scope = QueryScope {
        sources: chain_sources,
        combined: IndexMap::new(),
        localized: env.scope.localized,
        outer: Some(env.scope),
    };
    let chain_env = ExprEnv {
        rw: env.rw,
        model: env.model,
        scope: &chain_scope,
        projection: None,
        depth: env.depth,
    };

    let mut current: Option<SelectQuery> = None;
    for lvl in levels.iter().rev() {
        let mut level_jt = JoinTree::new();
        for a in chain_scope.sources.keys() {
            level_jt.seed_alias(a);
        }
        let mut where_tokens = rewrite_tokens(&lvl.on_cqn, &chain_env, &mut level_jt)?;
        if let Some(filter) = &lvl.filter {
            let flat = rewrite_tokens(filter, &chain_env, &mut level_jt)?;
            and_append(&mut where_tokens, flat);
        }
        if let Some(inner) = current.take() {
            if where_tokens.is_empty() {
                where_tokens.push(Expr::kw("exists"));
                where_tokens.push(Expr::Select(Box::new(inner)));
            } else {
                where_tokens.push(Expr::kw("and"));
                where_tokens.push(Expr::kw("exists"));
                where_tokens.push(Expr::Select(Box::new(inner)));
            }
        }

        let base = Source::Ref(SourceRef::aliased(
            RefExpr::from_names([lvl.entity.name.clone()]),
            lvl.alias.clone(),
        ));
        let from = materialize_joins(base, &level_jt, &chain_env)?;
        let mut sel = SelectQuery::from(from);
        sel.columns = vec![Column::new(Expr::int(1))];
        sel.where_clause = if where_tokens.is_empty() {
            None
        } else {
            Some(where_tokens)
        };
        current = Some(sel);
    }

    current.ok_or(RewriteError::EmptyProjection)
}

fn unique_chain_alias(base: &str, taken: &mut HashSet<String>, scope: &QueryScope) -> String {
    let mut candidate = base.to_string();
    let mut n = 1;
    while taken.contains(&candidate) || scope.knows_alias(&candidate) {
        n += 1;
        candidate = format!("{}_{}", base, n);
    }
    taken.insert(candidate.clone());
    candidate
}

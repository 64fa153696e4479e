//! Join materialization.
//!
//! After every clause is rewritten, a non-initial join tree replaces the
//! single-source `from` by a left-deep chain of LEFT JOIN nodes, one per
//! join-tree node, each with an on-condition derived from the traversed
//! association (navigation direction, so flipped operands) plus the
//! step's inline filter.

use std::sync::Arc;

use indexmap::IndexMap;

use super::errors::RewriteError;
use super::expression::{and_append, prefix_plain_refs, rewrite_tokens, ExprEnv};
use super::on_condition::assoc_on_cqn;
use crate::cqn::ast::{JoinKind, JoinSource, RefExpr, Source, SourceRef};
use crate::model_catalog::csn_model::Definition;
use crate::query_inference::join_tree::{JoinNode, JoinTree};
use crate::query_inference::scope::QueryScope;

/// Materialize the join tree onto a rewritten `from`.
pub(crate) fn materialize_joins(
    base: Source,
    jt: &JoinTree,
    env: &ExprEnv,
) -> Result<Source, RewriteError> {
    if jt.is_initial() {
        return Ok(base);
    }
    log::debug!("materializing join tree onto {:?}", base);
    let mut acc = base;
    for (root_alias, root) in jt.roots() {
        let Some(parent_def) = env.scope.sources.get(root_alias) else {
            continue;
        };
        for child in root.children.values() {
            acc = attach(acc, root_alias, parent_def, child, env)?;
        }
    }
    Ok(acc)
}

fn attach(
    acc: Source,
    parent_alias: &str,
    parent_def: &Arc<Definition>,
    node: &JoinNode,
    env: &ExprEnv,
) -> Result<Source, RewriteError> {
    let mut on_cqn = assoc_on_cqn(
        &node.assoc,
        &node.assoc_path,
        parent_alias,
        &node.alias,
        true,
    );
    if let Some(filter) = &node.filter {
        let mut filter = filter.clone();
        prefix_plain_refs(&mut filter, &node.alias, &[parent_alias, node.alias.as_str()]);
        and_append(&mut on_cqn, filter);
    }

    // The edge condition resolves in a two-alias scope of its own; any
    // further navigation inside it would be unmaterializable.
    let mut edge_sources = IndexMap::new();
    edge_sources.insert(parent_alias.to_string(), parent_def.clone());
    edge_sources.insert(node.alias.clone(), node.target.clone());
    let edge_scope = QueryScope {
        sources: edge_sources,
        combined: IndexMap::new(),
        localized: env.scope.localized,
        outer: Some(env.scope),
    };
    let edge_env = ExprEnv {
        rw: env.rw,
        model: env.model,
        scope: &edge_scope,
        projection: None,
        depth: env.depth,
    };
    let mut throwaway = JoinTree::new();
    let on = rewrite_tokens(&on_cqn, &edge_env, &mut throwaway)?;

    let mut acc = Source::Join(Box::new(JoinSource {
        kind: JoinKind::Left,
        args: vec![
            acc,
            Source::Ref(SourceRef::aliased(
                RefExpr::from_names([node.target.name.clone()]),
                node.alias.clone(),
            )),
        ],
        on,
    }));

    for child in node.children.values() {
        acc = attach(acc, &node.alias, &node.target, child, env)?;
    }
    Ok(acc)
}

//! # Query inference
//!
//! Phase 1 of the pipeline: build the name environment of a query,
//! resolve every reference against the model, classify navigations,
//! collect the join tree and compute the output elements. The rewriter
//! (`flat_rewrite`) consumes the attached metadata without re-resolving.

use crate::cqn::ast::SelectQuery;
use crate::model_catalog::csn_model::CsnModel;

pub mod elements;
pub mod errors;
pub mod join_tree;
pub mod resolver;
pub mod scope;

pub use elements::{InferredElement, Projection, ProjectionItem};
pub use errors::InferenceError;
pub use join_tree::{JoinNode, JoinTree};
pub use resolver::{RefCategory, ResolveEnv, ResolveMode};
pub use scope::QueryScope;

/// Resolve the token streams of `where`, `having` and `groupBy`.
/// References merge into the join tree; nested subqueries are left for
/// the rewriter to recurse into. `orderBy` is resolved by the rewriter
/// because its names resolve against the inferred elements first.
pub fn resolve_select_clauses(
    sel: &mut SelectQuery,
    scope: &QueryScope,
    jt: &mut JoinTree,
    model: &CsnModel,
) -> Result<(), InferenceError> {
    let env = ResolveEnv::new(model, scope);

    if let Some(tokens) = &mut sel.where_clause {
        resolver::resolve_stream(tokens, &env, jt)?;
    }
    if let Some(tokens) = &mut sel.having {
        resolver::resolve_stream(tokens, &env, jt)?;
    }
    if let Some(exprs) = &mut sel.group_by {
        resolver::resolve_stream(exprs, &env, jt)?;
    }
    Ok(())
}

//! # Flat rewrite
//!
//! Phase 2 of the pipeline: clone the inferred query and rebuild each
//! clause into the flat, SQL-shaped form. Every output reference is
//! either a raw table alias in `from` or a `{alias, column}` pair;
//! association traversals end up as left joins or correlated EXISTS
//! subqueries; structured values are decomposed into scalar leaves.

use std::sync::Arc;

use indexmap::IndexMap;

use crate::cqn::ast::{
    Query, RefExpr, SelectQuery, Source, SourceRef, Xpr,
};
use crate::model_catalog::csn_model::{CsnModel, Definition};
use crate::query_inference::elements::{infer_projection, InferredElement};
use crate::query_inference::errors::InferenceError;
use crate::query_inference::join_tree::JoinTree;
use crate::query_inference::scope::{build_scope, resolve_from_ref, synthesize_definition, QueryScope};
use crate::query_inference::resolve_select_clauses;

pub mod columns;
pub mod errors;
pub mod expand;
pub mod expression;
pub mod from_exists;
pub mod joins;
pub mod on_condition;
pub mod order_by;
pub mod search;

pub use errors::RewriteError;
pub use search::{DefaultSearchColumns, SearchColumns};

use columns::rewrite_columns;
use expression::{and_append, rewrite_operand, rewrite_tokens, ExprEnv};
use from_exists::rewrite_from;
use joins::materialize_joins;
use order_by::{rewrite_group_by, rewrite_order_by};
use search::lower_search;

/// The effective target of a normalized query: its single source, or the
/// query itself when several sources contribute.
#[derive(Debug, Clone)]
pub enum QueryTarget {
    Definition(Arc<Definition>),
    Query,
}

/// The result of a rewrite: the flat query plus the inference metadata
/// of the outermost SELECT (sources, target, output elements, join
/// tree).
#[derive(Debug, Clone)]
pub struct NormalizedQuery {
    pub query: Query,
    pub sources: IndexMap<String, Arc<Definition>>,
    pub target: QueryTarget,
    pub elements: IndexMap<String, InferredElement>,
    pub join_tree: JoinTree,
}

/// Normalize a query against a model with the default search
/// collaborator. Deterministic for a fixed input and model; the input is
/// never mutated.
pub fn rewrite_query(query: &Query, model: &CsnModel) -> Result<NormalizedQuery, RewriteError> {
    rewrite_query_with(query, model, &DefaultSearchColumns)
}

/// Normalize a query with a caller-supplied search collaborator.
pub fn rewrite_query_with(
    query: &Query,
    model: &CsnModel,
    search: &dyn SearchColumns,
) -> Result<NormalizedQuery, RewriteError> {
    let rewriter = Rewriter { model, search };
    rewriter.rewrite(query.clone())
}

/// Metadata of one rewritten SELECT.
pub(crate) struct SelectMeta {
    pub sources: IndexMap<String, Arc<Definition>>,
    pub elements: IndexMap<String, InferredElement>,
    pub join_tree: JoinTree,
}

pub(crate) struct Rewriter<'a> {
    pub model: &'a CsnModel,
    pub search: &'a dyn SearchColumns,
}

impl<'a> Rewriter<'a> {
    pub(crate) fn rewrite(&self, query: Query) -> Result<NormalizedQuery, RewriteError> {
        match query {
            Query::Set(_) => Err(RewriteError::UnionNotSupported),
            Query::Select(sel) => {
                let (flat, meta) = self.rewrite_select(*sel, None)?;
                Ok(NormalizedQuery {
                    query: Query::select(flat),
                    target: target_of(&meta.sources),
                    sources: meta.sources,
                    elements: meta.elements,
                    join_tree: meta.join_tree,
                })
            }
            Query::Insert(mut q) => {
                let (into, sources) = self.normalize_into(q.into)?;
                q.into = into;
                Ok(plain_result(Query::Insert(q), sources))
            }
            Query::Upsert(mut q) => {
                let (into, sources) = self.normalize_into(q.into)?;
                q.into = into;
                Ok(plain_result(Query::Upsert(q), sources))
            }
            Query::Update(mut q) => {
                let entity = q.entity;
                let where_clause = q.where_clause.take();
                let (entity, where_clause, sources, scope_values) = self.rewrite_data_target(
                    entity,
                    where_clause,
                    Some(std::mem::take(&mut q.with_values)),
                )?;
                q.entity = entity;
                q.where_clause = where_clause;
                if let Some(values) = scope_values {
                    q.with_values = values;
                }
                Ok(plain_result(Query::Update(q), sources))
            }
            Query::Delete(mut q) => {
                let from = q.from;
                let where_clause = q.where_clause.take();
                let (from, where_clause, sources, _) =
                    self.rewrite_data_target(from, where_clause, None)?;
                q.from = from;
                q.where_clause = where_clause;
                Ok(plain_result(Query::Delete(q), sources))
            }
            Query::Stream(mut q) => {
                // Vestigial: threads through the same from/where paths.
                let from = q.from;
                let where_clause = q.where_clause.take();
                let (from, where_clause, sources, _) =
                    self.rewrite_data_target(from, where_clause, None)?;
                q.from = from;
                q.where_clause = where_clause;
                Ok(plain_result(Query::Stream(q), sources))
            }
        }
    }

    /// Normalize one SELECT: inference, then clause-by-clause rewriting,
    /// then join materialization.
    pub(crate) fn rewrite_select(
        &self,
        mut sel: SelectQuery,
        outer: Option<&QueryScope>,
    ) -> Result<(SelectQuery, SelectMeta), RewriteError> {
        log::debug!("rewrite_select: from={:?}", sel.from);

        let mut subquery_defs: IndexMap<String, Arc<Definition>> = IndexMap::new();
        self.normalize_subquery_sources(&mut sel.from, outer, &mut subquery_defs)?;

        let scope = build_scope(&mut sel.from, self.model, sel.localized, outer, &subquery_defs)?;
        let mut jt = JoinTree::new();
        for alias in scope.sources.keys() {
            jt.seed_alias(alias);
        }

        let mut cols = std::mem::take(&mut sel.columns);
        let projection = infer_projection(&mut cols, &sel.excluding, &scope, &mut jt, self.model)?;
        sel.columns = cols;
        resolve_select_clauses(&mut sel, &scope, &mut jt, self.model)?;

        let meta_sources = scope.sources.clone();

        // A plain join with no join-relevant navigation passes through.
        if matches!(sel.from, Source::Join(_)) && jt.is_initial() {
            return Ok((
                sel,
                SelectMeta {
                    sources: meta_sources,
                    elements: projection.elements.clone(),
                    join_tree: jt,
                },
            ));
        }

        let env = ExprEnv {
            rw: self,
            model: self.model,
            scope: &scope,
            projection: Some(&projection),
            depth: 0,
        };

        let mut where_out = match sel.where_clause.take() {
            Some(tokens) => rewrite_tokens(&tokens, &env, &mut jt)?,
            None => Xpr::new(),
        };

        let from_taken = std::mem::replace(&mut sel.from, placeholder_source());
        let (new_from, additions) = rewrite_from(from_taken, &env, &mut jt)?;
        sel.from = new_from;
        and_append(&mut where_out, additions);

        sel.columns = rewrite_columns(&projection, &env, &mut jt)?;

        if let Some(group) = sel.group_by.take() {
            sel.group_by = Some(rewrite_group_by(group, &env, &mut jt)?);
        }
        if let Some(having) = sel.having.take() {
            sel.having = Some(rewrite_tokens(&having, &env, &mut jt)?);
        }
        if let Some(order) = sel.order_by.take() {
            sel.order_by = Some(rewrite_order_by(order, &env, &mut jt)?);
        }
        if let Some(search) = sel.search.take() {
            if let Some(condition) = lower_search(&search, &scope, self.search) {
                let flat = rewrite_tokens(&condition, &env, &mut jt)?;
                and_append(&mut where_out, flat);
            }
        }

        sel.where_clause = if where_out.is_empty() {
            None
        } else {
            Some(where_out)
        };
        let base = std::mem::replace(&mut sel.from, placeholder_source());
        sel.from = materialize_joins(base, &jt, &env)?;
        sel.excluding = Vec::new();

        Ok((
            sel,
            SelectMeta {
                sources: meta_sources,
                elements: projection.elements,
                join_tree: jt,
            },
        ))
    }

    /// Normalize subquery sources ahead of scope construction, replacing
    /// each with its flat form and registering a synthesized definition
    /// under its alias.
    fn normalize_subquery_sources(
        &self,
        source: &mut Source,
        outer: Option<&QueryScope>,
        defs: &mut IndexMap<String, Arc<Definition>>,
    ) -> Result<(), RewriteError> {
        match source {
            Source::Ref(_) => Ok(()),
            Source::Join(join) => {
                for arg in &mut join.args {
                    self.normalize_subquery_sources(arg, outer, defs)?;
                }
                Ok(())
            }
            Source::Select(sub) => {
                let alias =
                    sub.alias
                        .clone()
                        .ok_or_else(|| InferenceError::ExpectingAlias {
                            hint: "subquery in from".to_string(),
                        })?;
                let (flat, meta) = self.rewrite_select((*sub.query).clone(), outer)?;
                *sub.query = flat;
                let def = synthesize_definition(&alias, &meta.elements);
                defs.insert(alias, Arc::new(def));
                Ok(())
            }
        }
    }

    /// INSERT/UPSERT `into` normalization: a single-step reference to
    /// the resolved target, preserving an explicit alias.
    fn normalize_into(
        &self,
        mut into: SourceRef,
    ) -> Result<(SourceRef, IndexMap<String, Arc<Definition>>), RewriteError> {
        let (alias, target) = resolve_from_ref(&mut into, self.model, false)?;
        let normalized = SourceRef {
            ref_: RefExpr::from_names([target.name.clone()]),
            alias: into.alias,
        };
        let mut sources = IndexMap::new();
        sources.insert(alias, target);
        Ok((normalized, sources))
    }

    /// Shared `from`/`where` rewrite of the data statements
    /// (UPDATE/DELETE/STREAM): path expansion into where-exists, flat
    /// reference rewriting, value rewriting for UPDATE.
    #[allow(clippy::type_complexity)]
    fn rewrite_data_target(
        &self,
        target: SourceRef,
        where_clause: Option<Xpr>,
        with_values: Option<IndexMap<String, crate::cqn::ast::Expr>>,
    ) -> Result<
        (
            SourceRef,
            Option<Xpr>,
            IndexMap<String, Arc<Definition>>,
            Option<IndexMap<String, crate::cqn::ast::Expr>>,
        ),
        RewriteError,
    > {
        let mut from = Source::Ref(target);
        let empty_defs = IndexMap::new();
        let scope = build_scope(&mut from, self.model, false, None, &empty_defs)?;
        let mut jt = JoinTree::new();
        for alias in scope.sources.keys() {
            jt.seed_alias(alias);
        }

        let env = ExprEnv {
            rw: self,
            model: self.model,
            scope: &scope,
            projection: None,
            depth: 0,
        };

        let mut where_out = match where_clause {
            Some(tokens) => rewrite_tokens(&tokens, &env, &mut jt)?,
            None => Xpr::new(),
        };
        let (new_from, additions) = rewrite_from(from, &env, &mut jt)?;
        and_append(&mut where_out, additions);

        let values = match with_values {
            Some(mut values) => {
                for (_, value) in values.iter_mut() {
                    *value = rewrite_operand(value, &env, &mut jt)?;
                }
                Some(values)
            }
            None => None,
        };

        // Data statements have no join materialization surface.
        if !jt.is_initial() {
            let path = first_join_path(&jt);
            return Err(RewriteError::AssocInExpression { path });
        }

        let Source::Ref(sr) = new_from else {
            return Err(RewriteError::EmptyProjection);
        };
        let where_out = if where_out.is_empty() {
            None
        } else {
            Some(where_out)
        };
        Ok((sr, where_out, scope.sources, values))
    }
}

fn first_join_path(jt: &JoinTree) -> String {
    jt.roots()
        .find_map(|(_, root)| root.children.values().next())
        .map(|node| node.assoc_path.join("."))
        .unwrap_or_default()
}

fn target_of(sources: &IndexMap<String, Arc<Definition>>) -> QueryTarget {
    if sources.len() == 1 {
        QueryTarget::Definition(sources[0].clone())
    } else {
        QueryTarget::Query
    }
}

fn plain_result(query: Query, sources: IndexMap<String, Arc<Definition>>) -> NormalizedQuery {
    NormalizedQuery {
        query,
        target: target_of(&sources),
        sources,
        elements: IndexMap::new(),
        join_tree: JoinTree::new(),
    }
}

fn placeholder_source() -> Source {
    Source::Ref(SourceRef::new(RefExpr::new(Vec::new())))
}

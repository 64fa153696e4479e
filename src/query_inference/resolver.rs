//! The reference resolver.
//!
//! Given a path reference and an environment (alias scope, optional base
//! link for infix filters, outer-query chain), attaches per-step
//! resolution links, validates infix filters, classifies the reference
//! (pseudo, self, foreign-key-only, join-relevant) and merges
//! join-relevant prefixes into the join tree.

use std::sync::Arc;

use super::errors::InferenceError;
use super::join_tree::JoinTree;
use super::scope::QueryScope;
use crate::cqn::ast::{Expr, RefExpr, RefLink, ResolvedDef};
use crate::model_catalog::csn_model::{CsnModel, Definition, ElementDef, ForeignKey};
use crate::model_catalog::pseudo::pseudo_root;

/// The syntactic context a reference appears in. Exists predicates and
/// expand columns relax the infix-filter restrictions because their
/// navigation is materialized as subqueries, not joins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMode {
    Plain,
    Exists,
    Expand,
}

/// Base link for resolution inside an infix filter: names resolve against
/// the target entity of the filtered step.
#[derive(Debug, Clone)]
pub struct BaseLink {
    pub target: Arc<Definition>,
    pub alias: String,
    /// Dotted path of the filtered association, for error messages.
    pub assoc_path: String,
}

pub struct ResolveEnv<'a> {
    pub model: &'a CsnModel,
    pub scope: &'a QueryScope<'a>,
    pub base: Option<BaseLink>,
    pub mode: ResolveMode,
    pub in_filter: bool,
}

impl<'a> ResolveEnv<'a> {
    pub fn new(model: &'a CsnModel, scope: &'a QueryScope<'a>) -> Self {
        ResolveEnv {
            model,
            scope,
            base: None,
            mode: ResolveMode::Plain,
            in_filter: false,
        }
    }

    pub fn with_mode(mut self, mode: ResolveMode) -> Self {
        self.mode = mode;
        self
    }
}

/// How a reference classified after resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefCategory {
    /// Rooted in the pseudo-namespace; rendered as is.
    Pseudo,
    /// Rooted in `$self`/`$projection`; substituted by the rewriter.
    SelfRef,
    /// An ordinary reference; join-relevant when it was merged into the
    /// join tree.
    Plain { join_relevant: bool },
    /// Rooted in an enclosing query's alias (correlated reference).
    Outer,
}

enum Walk {
    Entity(Arc<Definition>),
    Struct(Arc<ElementDef>),
    Leaf,
}

/// Resolve a reference, attaching links and merging join-relevant
/// prefixes into the join tree. Idempotent: already-resolved references
/// are classified from their attached metadata.
pub fn resolve_ref(
    r: &mut RefExpr,
    env: &ResolveEnv,
    jt: &mut JoinTree,
) -> Result<RefCategory, InferenceError> {
    if r.is_self_root() {
        return Ok(RefCategory::SelfRef);
    }
    if !r.links.is_empty() {
        return Ok(classify_resolved(r));
    }

    let first = r.steps.first().ok_or_else(|| InferenceError::UnknownName {
        path: String::new(),
        context: "an empty reference".to_string(),
    })?;

    if let Some(p) = pseudo_root(&first.name) {
        resolve_pseudo(r, p)?;
        return Ok(RefCategory::Pseudo);
    }

    let mut is_outer = false;
    let (link0, walk0) = resolve_root(r, env, &mut is_outer)?;
    r.links.push(link0);
    let mut walk = walk0;

    for i in 1..r.steps.len() {
        let name = r.steps[i].name.clone();
        let elem = match &walk {
            Walk::Entity(def) => def.element(&name).cloned(),
            Walk::Struct(parent) => parent.elements.get(&name).cloned(),
            Walk::Leaf => None,
        };
        let elem = elem.ok_or_else(|| InferenceError::UnknownName {
            path: r.path(),
            context: walk_context(&walk),
        })?;

        if env.in_filter
            && env.mode == ResolveMode::Plain
            && elem.is_association()
            && !elem.is_managed()
        {
            return Err(InferenceError::UnmanagedInInfixFilter { path: r.path() });
        }

        let target = if elem.is_association() {
            Some(env.model.target_of(&elem, env.scope.localized)?)
        } else {
            None
        };
        walk = walk_of(&elem, target.clone());
        r.links.push(RefLink {
            definition: ResolvedDef::Element(elem),
            target,
            alias: name,
        });
    }

    validate_filters(r, env, jt)?;

    let join_until = compute_join_until(r);
    if env.in_filter && env.mode == ResolveMode::Plain && join_until.is_some() {
        let assoc = env
            .base
            .as_ref()
            .map(|b| b.assoc_path.clone())
            .unwrap_or_default();
        return Err(InferenceError::NonFkInInfixFilter {
            assoc,
            path: r.path(),
        });
    }
    if is_outer {
        if join_until.is_some() {
            return Err(InferenceError::CorrelatedNavigation { path: r.path() });
        }
        return Ok(RefCategory::Outer);
    }

    match join_until {
        Some(until) if env.mode == ResolveMode::Plain && !env.in_filter => {
            log::trace!("resolve: {} is join relevant up to step {}", r.path(), until);
            let source_alias = r.links[0].alias.clone();
            jt.merge_ref(r, until, &source_alias);
            Ok(RefCategory::Plain {
                join_relevant: true,
            })
        }
        _ => Ok(RefCategory::Plain {
            join_relevant: false,
        }),
    }
}

fn classify_resolved(r: &RefExpr) -> RefCategory {
    if let Some(ResolvedDef::Element(e)) = r.links.first().map(|l| &l.definition) {
        if e.pseudo {
            return RefCategory::Pseudo;
        }
    }
    RefCategory::Plain {
        join_relevant: r.join_split.is_some(),
    }
}

fn resolve_pseudo(r: &mut RefExpr, root: &Arc<ElementDef>) -> Result<(), InferenceError> {
    let mut links = vec![RefLink {
        definition: ResolvedDef::Element(root.clone()),
        target: None,
        alias: String::new(),
    }];
    let mut current = root.clone();
    for step in &r.steps[1..] {
        if step.filter.is_some() {
            return Err(InferenceError::FilterOnNonAssoc { path: r.path() });
        }
        let child = current
            .elements
            .get(&step.name)
            .cloned()
            .ok_or_else(|| InferenceError::UnknownName {
                path: r.path(),
                context: format!("\"{}\"", current.name),
            })?;
        links.push(RefLink {
            definition: ResolvedDef::Element(child.clone()),
            target: None,
            alias: String::new(),
        });
        current = child;
    }
    r.links = links;
    Ok(())
}

/// Resolve the first step, in priority order: base link elements, own
/// source aliases, outer-query aliases, combined elements.
fn resolve_root(
    r: &RefExpr,
    env: &ResolveEnv,
    is_outer: &mut bool,
) -> Result<(RefLink, Walk), InferenceError> {
    let name = &r.steps[0].name;

    if let Some(base) = &env.base {
        if let Some(elem) = base.target.element(name) {
            if env.mode == ResolveMode::Plain && elem.is_association() && !elem.is_managed() {
                return Err(InferenceError::UnmanagedInInfixFilter { path: r.path() });
            }
            let target = if elem.is_association() {
                Some(env.model.target_of(elem, env.scope.localized)?)
            } else {
                None
            };
            let link = RefLink {
                definition: ResolvedDef::Element(elem.clone()),
                target: target.clone(),
                alias: base.alias.clone(),
            };
            return Ok((link, walk_of(elem, target)));
        }
    }

    if let Some(def) = env.scope.lookup_source(name) {
        let link = RefLink {
            definition: ResolvedDef::Entity(def.clone()),
            target: Some(def.clone()),
            alias: name.clone(),
        };
        return Ok((link, Walk::Entity(def.clone())));
    }

    if let Some(def) = env.scope.lookup_outer(name) {
        *is_outer = true;
        let link = RefLink {
            definition: ResolvedDef::Entity(def.clone()),
            target: Some(def.clone()),
            alias: name.clone(),
        };
        return Ok((link, Walk::Entity(def.clone())));
    }

    match env.scope.combined.get(name) {
        Some(contributors) if contributors.len() > 1 => Err(InferenceError::AmbiguousName {
            name: name.clone(),
            alternatives: contributors
                .iter()
                .map(|(alias, _)| format!("{}.{}", alias, name))
                .collect(),
        }),
        Some(contributors) => {
            let (alias, elem) = &contributors[0];
            if env.in_filter
                && env.mode == ResolveMode::Plain
                && elem.is_association()
                && !elem.is_managed()
            {
                return Err(InferenceError::UnmanagedInInfixFilter { path: r.path() });
            }
            let target = if elem.is_association() {
                Some(env.model.target_of(elem, env.scope.localized)?)
            } else {
                None
            };
            let link = RefLink {
                definition: ResolvedDef::Element(elem.clone()),
                target: target.clone(),
                alias: alias.clone(),
            };
            Ok((link, walk_of(elem, target)))
        }
        None => Err(InferenceError::UnknownName {
            path: r.path(),
            context: format!(
                "the query sources {:?}",
                env.scope.sources.keys().collect::<Vec<_>>()
            ),
        }),
    }
}

fn walk_of(elem: &ElementDef, target: Option<Arc<Definition>>) -> Walk {
    if let Some(t) = target {
        Walk::Entity(t)
    } else if elem.is_structured() {
        Walk::Struct(Arc::new(elem.clone()))
    } else {
        Walk::Leaf
    }
}

fn walk_context(walk: &Walk) -> String {
    match walk {
        Walk::Entity(def) => format!("\"{}\"", def.name),
        Walk::Struct(elem) => format!("\"{}\"", elem.name),
        Walk::Leaf => "a scalar element".to_string(),
    }
}

/// Validate and resolve the infix filters carried by the reference's
/// steps. A filter is only allowed on an association step; a terminal
/// filter is only allowed in exists/expand contexts.
fn validate_filters(
    r: &mut RefExpr,
    env: &ResolveEnv,
    _jt: &mut JoinTree,
) -> Result<(), InferenceError> {
    let last = r.steps.len() - 1;
    for i in 0..r.steps.len() {
        if r.steps[i].filter.is_none() {
            continue;
        }
        let elem = match r.links[i].definition.as_element() {
            Some(e) => e.clone(),
            None => {
                return Err(InferenceError::FilterOnNonAssoc {
                    path: r.steps[i].name.clone(),
                })
            }
        };
        if !elem.is_association() {
            return Err(InferenceError::FilterOnNonAssoc {
                path: prefix_path(r, i),
            });
        }
        if i == last && env.mode == ResolveMode::Plain {
            return Err(InferenceError::FilterWithoutNavigation {
                path: prefix_path(r, i),
            });
        }

        let base = BaseLink {
            target: r.links[i].target.clone().ok_or_else(|| {
                InferenceError::UnknownName {
                    path: prefix_path(r, i),
                    context: "the association targets".to_string(),
                }
            })?,
            alias: r.links[i].alias.clone(),
            assoc_path: prefix_path(r, i),
        };
        let filter_env = ResolveEnv {
            model: env.model,
            scope: env.scope,
            base: Some(base),
            mode: env.mode,
            in_filter: true,
        };
        // Filter navigation never becomes an independent join; a local
        // throwaway tree swallows any merge in exists/expand contexts.
        let mut throwaway = JoinTree::new();
        if let Some(filter) = &mut r.steps[i].filter {
            resolve_stream(filter, &filter_env, &mut throwaway)?;
        }
    }
    Ok(())
}

fn prefix_path(r: &RefExpr, until: usize) -> String {
    r.steps[..=until]
        .iter()
        .map(|s| s.name.as_str())
        .collect::<Vec<_>>()
        .join(".")
}

/// Resolve every reference inside a token stream. Nested subqueries are
/// skipped; the rewriter recurses into them with the proper outer scope.
pub fn resolve_stream(
    tokens: &mut [Expr],
    env: &ResolveEnv,
    jt: &mut JoinTree,
) -> Result<(), InferenceError> {
    let mut exists_next = false;
    for token in tokens.iter_mut() {
        match token {
            Expr::Keyword(k) if k.eq_ignore_ascii_case("exists") => {
                exists_next = true;
                continue;
            }
            Expr::Ref(r) => {
                let mode = if exists_next {
                    ResolveMode::Exists
                } else {
                    env.mode
                };
                let step_env = ResolveEnv {
                    model: env.model,
                    scope: env.scope,
                    base: env.base.clone(),
                    mode,
                    in_filter: env.in_filter,
                };
                resolve_ref(r, &step_env, jt)?;
            }
            Expr::Func(f) => resolve_stream(&mut f.args, env, jt)?,
            Expr::Xpr(inner) | Expr::List(inner) => resolve_stream(inner, env, jt)?,
            Expr::Select(_) => {}
            _ => {}
        }
        exists_next = false;
    }
    Ok(())
}

/// Index of the last association step that requires a join, or `None`
/// when the reference is foreign-key-only (every association crossed is a
/// terminal, unfiltered managed association whose tail stays within its
/// foreign keys).
pub fn compute_join_until(r: &RefExpr) -> Option<usize> {
    let mut until = None;
    let mut last_assoc = None;
    for i in 0..r.steps.len() {
        if let Some(ResolvedDef::Element(e)) = r.links.get(i).map(|l| &l.definition) {
            if e.is_association() {
                last_assoc = Some(i);
            }
        }
    }

    for i in 0..r.steps.len() {
        let Some(ResolvedDef::Element(elem)) = r.links.get(i).map(|l| &l.definition) else {
            continue;
        };
        if !elem.is_association() {
            continue;
        }
        let tail: Vec<&str> = r.steps[i + 1..].iter().map(|s| s.name.as_str()).collect();
        let terminal_fk_reach = Some(i) == last_assoc
            && r.steps[i].filter.is_none()
            && elem.is_managed()
            && (tail.is_empty() || find_foreign_key(elem, &tail).is_some());
        let bare_unjoined = Some(i) == last_assoc && tail.is_empty();
        if !(terminal_fk_reach || bare_unjoined) {
            until = Some(i);
        }
    }
    until
}

/// The foreign key of a managed association matched by a tail path.
pub fn find_foreign_key<'a>(assoc: &'a ElementDef, tail: &[&str]) -> Option<&'a ForeignKey> {
    let info = assoc.association.as_ref()?;
    info.keys
        .iter()
        .find(|fk| fk.path.len() == tail.len() && fk.path.iter().zip(tail).all(|(a, b)| a == b))
}

/// Flat (underscore-joined) name of the path from `start` to the leaf,
/// substituting the rename of a managed foreign key so the name matches
/// the physical column.
pub fn flat_name_from(r: &RefExpr, start: usize) -> String {
    let mut segs: Vec<String> = Vec::new();
    let mut i = start;
    while i < r.steps.len() {
        if let Some(ResolvedDef::Element(elem)) = r.links.get(i).map(|l| &l.definition) {
            if elem.is_managed() && i + 1 < r.steps.len() {
                let tail: Vec<&str> = r.steps[i + 1..].iter().map(|s| s.name.as_str()).collect();
                if let Some(fk) = find_foreign_key(elem, &tail) {
                    segs.push(r.steps[i].name.clone());
                    segs.push(fk.flat_tail());
                    return segs.join("_");
                }
            }
        }
        segs.push(r.steps[i].name.clone());
        i += 1;
    }
    segs.join("_")
}

/// The `(table alias, flat column name)` pair of a resolved reference's
/// flat rendering.
pub fn table_alias_and_flat(r: &RefExpr) -> (String, String) {
    match r.join_split {
        Some(split) => (
            r.links[split].alias.clone(),
            flat_name_from(r, split + 1),
        ),
        None => {
            let alias = r.links[0].alias.clone();
            let start = if r.links[0].definition.as_entity().is_some() {
                1
            } else {
                0
            };
            (alias, flat_name_from(r, start))
        }
    }
}

/// The output element name of a reference column: the flat path from the
/// first element step, ignoring join materialization.
pub fn element_name_of(r: &RefExpr) -> String {
    let start = if r
        .links
        .first()
        .is_some_and(|l| l.definition.as_entity().is_some())
    {
        1
    } else {
        0
    };
    flat_name_from(r, start)
}

//! Per-query name environment: the alias to source-definition map, the
//! combined-elements index used for unqualified resolution, and the
//! parent-scope chain for correlated subqueries.

use std::sync::Arc;

use indexmap::IndexMap;

use super::errors::InferenceError;
use crate::cqn::ast::{RefLink, ResolvedDef, Source, SourceRef};
use crate::model_catalog::csn_model::{short_name_of, CsnModel, Definition, ElementDef};

#[derive(Debug)]
pub struct QueryScope<'a> {
    /// Alias to (possibly localized) source definition, in `from` order.
    pub sources: IndexMap<String, Arc<Definition>>,
    /// Element name to the (alias, element) pairs contributing it.
    pub combined: IndexMap<String, Vec<(String, Arc<ElementDef>)>>,
    pub localized: bool,
    pub outer: Option<&'a QueryScope<'a>>,
}

impl<'a> QueryScope<'a> {
    pub fn lookup_source(&self, alias: &str) -> Option<&Arc<Definition>> {
        self.sources.get(alias)
    }

    /// Walk the parent-scope chain for an alias of an enclosing query.
    pub fn lookup_outer(&self, alias: &str) -> Option<&Arc<Definition>> {
        let mut scope = self.outer;
        while let Some(s) = scope {
            if let Some(def) = s.sources.get(alias) {
                return Some(def);
            }
            scope = s.outer;
        }
        None
    }

    /// The single source definition, when there is exactly one.
    pub fn single_source(&self) -> Option<(&String, &Arc<Definition>)> {
        if self.sources.len() == 1 {
            self.sources.iter().next()
        } else {
            None
        }
    }

    /// True when the alias is visible in this scope or any parent.
    pub fn knows_alias(&self, alias: &str) -> bool {
        self.sources.contains_key(alias) || self.lookup_outer(alias).is_some()
    }
}

/// Build the scope of a query from its (annotated) `from` clause.
///
/// From-references are resolved against the model here: the first step
/// names a definition, later steps navigate associations; each step gets
/// its resolution link attached. Subquery sources must have been
/// normalized by the caller beforehand and registered in
/// `subquery_defs` under their alias.
pub fn build_scope<'a>(
    from: &mut Source,
    model: &CsnModel,
    localized: bool,
    outer: Option<&'a QueryScope<'a>>,
    subquery_defs: &IndexMap<String, Arc<Definition>>,
) -> Result<QueryScope<'a>, InferenceError> {
    let mut sources = IndexMap::new();
    collect_sources(from, model, localized, subquery_defs, &mut sources)?;

    let mut combined: IndexMap<String, Vec<(String, Arc<ElementDef>)>> = IndexMap::new();
    for (alias, def) in &sources {
        for (name, elem) in &def.elements {
            combined
                .entry(name.clone())
                .or_default()
                .push((alias.clone(), elem.clone()));
        }
    }

    Ok(QueryScope {
        sources,
        combined,
        localized,
        outer,
    })
}

fn collect_sources(
    source: &mut Source,
    model: &CsnModel,
    localized: bool,
    subquery_defs: &IndexMap<String, Arc<Definition>>,
    sources: &mut IndexMap<String, Arc<Definition>>,
) -> Result<(), InferenceError> {
    match source {
        Source::Ref(sr) => {
            let (alias, def) = resolve_from_ref(sr, model, localized)?;
            insert_source(sources, alias, def)
        }
        Source::Join(join) => {
            for arg in &mut join.args {
                collect_sources(arg, model, localized, subquery_defs, sources)?;
            }
            Ok(())
        }
        Source::Select(sub) => {
            // The caller normalizes subquery sources up front; here only
            // the synthesized definition is registered.
            let alias = sub
                .alias
                .clone()
                .ok_or_else(|| InferenceError::ExpectingAlias {
                    hint: "subquery in from".to_string(),
                })?;
            let def = subquery_defs
                .get(&alias)
                .cloned()
                .ok_or_else(|| InferenceError::UnknownName {
                    path: alias.clone(),
                    context: "the normalized subquery sources".to_string(),
                })?;
            insert_source(sources, alias, def)
        }
    }
}

fn insert_source(
    sources: &mut IndexMap<String, Arc<Definition>>,
    alias: String,
    def: Arc<Definition>,
) -> Result<(), InferenceError> {
    if sources.contains_key(&alias) {
        return Err(InferenceError::DuplicateAlias { alias });
    }
    sources.insert(alias, def);
    Ok(())
}

/// Resolve a `from` reference: the first step names a definition, later
/// steps navigate associations. Returns the effective alias and the
/// definition of the last step's target, which is what the query
/// ultimately selects from.
pub fn resolve_from_ref(
    sr: &mut SourceRef,
    model: &CsnModel,
    localized: bool,
) -> Result<(String, Arc<Definition>), InferenceError> {
    let r = &mut sr.ref_;
    let first = r.steps.first().ok_or_else(|| InferenceError::UnknownName {
        path: String::new(),
        context: "from clause".to_string(),
    })?;

    let root = model.lookup(&first.name)?;
    let mut links = vec![RefLink {
        definition: ResolvedDef::Entity(root.clone()),
        target: Some(model.localized_view_for(root, localized).clone()),
        alias: short_name_of(&first.name).to_string(),
    }];
    let mut current = model.localized_view_for(root, localized).clone();

    for i in 1..r.steps.len() {
        let name = r.steps[i].name.clone();
        let elem = current
            .element(&name)
            .cloned()
            .ok_or_else(|| InferenceError::UnknownName {
                path: r.path(),
                context: format!("\"{}\"", current.name),
            })?;
        if !elem.is_association() {
            if r.steps[i].filter.is_some() {
                return Err(InferenceError::FilterOnNonAssoc { path: r.path() });
            }
            return Err(InferenceError::UnknownName {
                path: r.path(),
                context: format!("the associations of \"{}\"", current.name),
            });
        }
        let target = model.target_of(&elem, localized)?;
        links.push(RefLink {
            definition: ResolvedDef::Element(elem),
            target: Some(target.clone()),
            alias: name,
        });
        current = target;
    }

    r.links = links;
    let alias = sr
        .alias
        .clone()
        .unwrap_or_else(|| short_name_of(&r.steps.last().expect("nonempty").name).to_string());
    Ok((alias, current))
}

/// Synthesize a definition from the output elements of a normalized
/// subquery so it can serve as a query source.
pub fn synthesize_definition(
    name: &str,
    elements: &IndexMap<String, super::elements::InferredElement>,
) -> Definition {
    use super::elements::InferredElement;

    let mut def = Definition::new(name);
    for (n, ie) in elements {
        let elem = match ie {
            InferredElement::Leaf { def, .. } => def.as_ref().clone(),
            InferredElement::Scalar { type_name, key, .. } => {
                let mut e = ElementDef::scalar(n.clone(), "");
                e.type_name = type_name.clone();
                e.key = *key;
                e
            }
            InferredElement::Struct { .. } | InferredElement::Subquery { .. } => continue,
        };
        let mut elem = elem;
        elem.name = n.clone();
        def.elements.insert(n.clone(), Arc::new(elem));
    }
    def
}

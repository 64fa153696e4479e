//! The element inferencer.
//!
//! Computes the ordered output elements of a SELECT and a projection plan
//! the clause rewriter consumes: explicit columns (resolved in place),
//! wildcard expansion over the combined elements, nested projections
//! (expand/inline) decomposed into flat leaves or subquery items.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;

use super::errors::InferenceError;
use super::join_tree::JoinTree;
use super::resolver::{
    element_name_of, resolve_ref, resolve_stream, RefCategory, ResolveEnv, ResolveMode,
};
use super::scope::QueryScope;
use crate::cqn::ast::{Column, Expr, Literal, RefExpr, RefStep, ResolvedDef};
use crate::model_catalog::csn_model::{CsnModel, Definition, ElementDef};

/// An output element of the query.
#[derive(Debug, Clone)]
pub enum InferredElement {
    /// A leaf taken from the model, possibly with a cast override.
    Leaf {
        def: Arc<ElementDef>,
        cast: Option<String>,
        key: bool,
        annotations: IndexMap<String, Literal>,
    },
    /// A synthesized scalar (literal, parameter, expression, function,
    /// scalar subquery).
    Scalar {
        type_name: Option<String>,
        key: bool,
        annotations: IndexMap<String, Literal>,
    },
    /// A nested structured shape from an expand over a structured
    /// element.
    Struct {
        elements: IndexMap<String, InferredElement>,
    },
    /// An expand over an association: a correlated subquery yielding one
    /// struct (to-one) or a collection (to-many). `skipped` marks expands
    /// whose target is persistence-skipped; they produce no column.
    Subquery {
        target: Arc<Definition>,
        one: bool,
        skipped: bool,
    },
}

impl InferredElement {
    pub fn is_virtual(&self) -> bool {
        matches!(self, InferredElement::Leaf { def, .. } if def.virtual_)
    }
}

/// One entry of the projection plan.
#[derive(Debug, Clone)]
pub enum ProjectionItem {
    /// An explicit column (reference or value), resolved in place.
    Column { column: Column, name: String },
    /// One combined element contributed by wildcard expansion.
    WildcardElement {
        alias: String,
        elem: Arc<ElementDef>,
        name: String,
    },
    /// An expand over an association, to be rewritten into a correlated
    /// subquery.
    Expand {
        column: Column,
        name: String,
        one: bool,
        skipped: bool,
    },
}

/// The inferred projection: plan items in output order, the element
/// mapping, and annotated columns by name for `$self`/order-by
/// substitution.
#[derive(Debug, Clone, Default)]
pub struct Projection {
    pub items: Vec<ProjectionItem>,
    pub elements: IndexMap<String, InferredElement>,
    pub by_name: HashMap<String, Column>,
}

struct ColInfer {
    item: ProjectionItem,
    elements: Vec<(String, InferredElement)>,
    name: String,
}

pub fn infer_projection(
    columns: &mut Vec<Column>,
    excluding: &[String],
    scope: &QueryScope,
    jt: &mut JoinTree,
    model: &CsnModel,
) -> Result<Projection, InferenceError> {
    if columns.is_empty() {
        columns.push(Column::star());
    }

    let mut star_seen = false;
    let mut before: Vec<ColInfer> = Vec::new();
    let mut after: Vec<ColInfer> = Vec::new();

    for col in columns.iter_mut() {
        if col.is_star() {
            star_seen = true;
            continue;
        }
        let mut out = Vec::new();
        infer_column(col, scope, jt, model, &mut out)?;
        if star_seen {
            after.extend(out);
        } else {
            before.extend(out);
        }
    }

    assemble(before, after, star_seen, excluding, scope)
}

/// Infer one explicit column into plan entries. Inline columns and
/// struct expands push one entry per flattened sibling.
fn infer_column(
    col: &mut Column,
    scope: &QueryScope,
    jt: &mut JoinTree,
    model: &CsnModel,
    out: &mut Vec<ColInfer>,
) -> Result<(), InferenceError> {
    match &mut col.expr {
        Expr::Ref(_) => infer_ref_column(col, scope, jt, model, out),
        Expr::Val(lit) => {
            let hint = format!("{:?}", lit);
            let name = named_or_expecting(col.alias.as_deref(), hint)?;
            let element = InferredElement::Scalar {
                type_name: literal_type(lit),
                key: col.key,
                annotations: col.annotations.clone(),
            };
            out.push(plain_entry(col, name, element));
            Ok(())
        }
        Expr::Param(p) => {
            // Bind parameters stay opaque; the element is runtime-bound.
            let name = col.alias.clone().unwrap_or_else(|| p.clone());
            let element = InferredElement::Scalar {
                type_name: None,
                key: col.key,
                annotations: col.annotations.clone(),
            };
            out.push(plain_entry(col, name, element));
            Ok(())
        }
        Expr::Func(f) => {
            let fname = f.name.clone();
            let env = ResolveEnv::new(model, scope);
            resolve_stream(&mut f.args, &env, jt)?;
            let name = named_or_expecting(col.alias.as_deref(), fname)?;
            let element = InferredElement::Scalar {
                type_name: col.cast.clone(),
                key: col.key,
                annotations: col.annotations.clone(),
            };
            out.push(plain_entry(col, name, element));
            Ok(())
        }
        Expr::Xpr(tokens) => {
            let env = ResolveEnv::new(model, scope);
            resolve_stream(tokens, &env, jt)?;
            let type_name = col.cast.clone().or_else(|| first_ref_type(tokens));
            let name = named_or_expecting(col.alias.as_deref(), "expression".to_string())?;
            let element = InferredElement::Scalar {
                type_name,
                key: col.key,
                annotations: col.annotations.clone(),
            };
            out.push(plain_entry(col, name, element));
            Ok(())
        }
        Expr::Select(_) => {
            let name = named_or_expecting(col.alias.as_deref(), "subquery".to_string())?;
            let element = InferredElement::Scalar {
                type_name: col.cast.clone(),
                key: col.key,
                annotations: col.annotations.clone(),
            };
            out.push(plain_entry(col, name, element));
            Ok(())
        }
        Expr::Star | Expr::Keyword(_) | Expr::List(_) => Err(InferenceError::ExpectingAlias {
            hint: "unsupported column expression".to_string(),
        }),
    }
}

fn plain_entry(col: &Column, name: String, element: InferredElement) -> ColInfer {
    ColInfer {
        item: ProjectionItem::Column {
            column: col.clone(),
            name: name.clone(),
        },
        elements: vec![(name.clone(), element)],
        name,
    }
}

fn infer_ref_column(
    col: &mut Column,
    scope: &QueryScope,
    jt: &mut JoinTree,
    model: &CsnModel,
    out: &mut Vec<ColInfer>,
) -> Result<(), InferenceError> {
    let mode = if col.expand.is_some() {
        ResolveMode::Expand
    } else {
        ResolveMode::Plain
    };
    let category = {
        let Expr::Ref(r) = &mut col.expr else {
            unreachable!("caller matched a ref column")
        };
        let env = ResolveEnv::new(model, scope).with_mode(mode);
        resolve_ref(r, &env, jt)?
    };
    let Expr::Ref(r) = &col.expr else {
        unreachable!("caller matched a ref column")
    };
    let r = r.clone();

    if matches!(category, RefCategory::Pseudo | RefCategory::SelfRef) {
        let name = col
            .alias
            .clone()
            .or_else(|| r.last_name().map(String::from))
            .unwrap_or_default();
        let element = InferredElement::Scalar {
            type_name: None,
            key: col.key,
            annotations: col.annotations.clone(),
        };
        out.push(plain_entry(col, name, element));
        return Ok(());
    }

    let leaf = r
        .leaf_link()
        .and_then(|l| l.definition.as_element().cloned());

    if let Some(body) = col.expand.clone() {
        let leaf = leaf.ok_or_else(|| expand_target_error(&r))?;
        if leaf.is_association() {
            let target = model.target_of(&leaf, scope.localized)?;
            let skipped = target.persistence_skip;
            let one = leaf.is_to_one();
            let name = col.alias.clone().unwrap_or_else(|| element_name_of(&r));
            out.push(ColInfer {
                item: ProjectionItem::Expand {
                    column: col.clone(),
                    name: name.clone(),
                    one,
                    skipped,
                },
                elements: vec![(
                    name.clone(),
                    InferredElement::Subquery {
                        target,
                        one,
                        skipped,
                    },
                )],
                name,
            });
            return Ok(());
        }
        if leaf.is_structured() {
            let base = col.alias.clone().unwrap_or_else(|| element_name_of(&r));
            let mut nested = IndexMap::new();
            let mut flat = Vec::new();
            nested_struct_items(
                &r,
                &leaf,
                &base,
                &body,
                &col.excluding,
                scope,
                jt,
                model,
                &mut flat,
                &mut nested,
            )?;
            // Columns carry the flat leaves; the element is the nested
            // structured shape, attached to the first leaf entry.
            for (i, mut ci) in flat.into_iter().enumerate() {
                ci.elements.clear();
                if i == 0 {
                    ci.elements.push((
                        base.clone(),
                        InferredElement::Struct {
                            elements: nested.clone(),
                        },
                    ));
                }
                out.push(ci);
            }
            return Ok(());
        }
        return Err(expand_target_error(&r));
    }

    if let Some(body) = col.inline.clone() {
        let leaf = leaf.ok_or_else(|| expand_target_error(&r))?;
        if !leaf.is_structured() {
            return Err(expand_target_error(&r));
        }
        let base = col.alias.clone().unwrap_or_else(|| element_name_of(&r));
        let mut nested = IndexMap::new();
        nested_struct_items(
            &r,
            &leaf,
            &base,
            &body,
            &col.excluding,
            scope,
            jt,
            model,
            out,
            &mut nested,
        )?;
        return Ok(());
    }

    // Plain reference column.
    let base = col.alias.clone().unwrap_or_else(|| element_name_of(&r));
    let mut elements = Vec::new();
    match &leaf {
        Some(e) if e.is_structured() => {
            for (path, leaf_def) in struct_leaves(e) {
                let name = format!("{}_{}", base, path.join("_"));
                elements.push((
                    name,
                    InferredElement::Leaf {
                        def: leaf_def,
                        cast: None,
                        key: false,
                        annotations: IndexMap::new(),
                    },
                ));
            }
        }
        Some(e) => {
            elements.push((
                base.clone(),
                InferredElement::Leaf {
                    def: e.clone(),
                    cast: col.cast.clone(),
                    key: col.key || e.key,
                    annotations: col.annotations.clone(),
                },
            ));
        }
        None => {
            // Length-1 source reference; exposed as an opaque scalar.
            elements.push((
                base.clone(),
                InferredElement::Scalar {
                    type_name: None,
                    key: false,
                    annotations: col.annotations.clone(),
                },
            ));
        }
    }
    out.push(ColInfer {
        item: ProjectionItem::Column {
            column: col.clone(),
            name: base.clone(),
        },
        elements,
        name: base,
    });
    Ok(())
}

/// Flatten the body of a struct expand/inline into sibling plan items
/// with `base`-prefixed names, collecting the nested element shape.
#[allow(clippy::too_many_arguments)]
fn nested_struct_items(
    root: &RefExpr,
    struct_elem: &Arc<ElementDef>,
    base: &str,
    body: &[Column],
    excluding: &[String],
    scope: &QueryScope,
    jt: &mut JoinTree,
    model: &CsnModel,
    out: &mut Vec<ColInfer>,
    nested: &mut IndexMap<String, InferredElement>,
) -> Result<(), InferenceError> {
    for body_col in body {
        if body_col.is_star() {
            for name in struct_elem.elements.keys() {
                if excluding.iter().any(|x| x == name) {
                    continue;
                }
                let mut synth_col = Column::new(Expr::Ref(synthesize_ref(root, &[name.clone()])));
                synth_col.alias = Some(format!("{}_{}", base, name));
                let mut sub = Vec::new();
                infer_column(&mut synth_col, scope, jt, model, &mut sub)?;
                for ci in sub {
                    for (n, e) in &ci.elements {
                        nested.insert(strip_prefix(n, base), e.clone());
                    }
                    out.push(ci);
                }
            }
            continue;
        }
        let Expr::Ref(body_ref) = &body_col.expr else {
            return Err(InferenceError::ExpectingAlias {
                hint: "non-reference column in nested projection".to_string(),
            });
        };
        let tail: Vec<String> = body_ref.steps.iter().map(|s| s.name.clone()).collect();
        let mut synth_col = body_col.clone();
        synth_col.expr = Expr::Ref(synthesize_ref(root, &tail));
        let sub_name = body_col.alias.clone().unwrap_or_else(|| tail.join("_"));
        synth_col.alias = Some(format!("{}_{}", base, sub_name));
        let mut sub = Vec::new();
        infer_column(&mut synth_col, scope, jt, model, &mut sub)?;
        for ci in sub {
            for (n, e) in &ci.elements {
                nested.insert(strip_prefix(n, base), e.clone());
            }
            out.push(ci);
        }
    }
    Ok(())
}

fn strip_prefix(name: &str, base: &str) -> String {
    name.strip_prefix(base)
        .and_then(|s| s.strip_prefix('_'))
        .unwrap_or(name)
        .to_string()
}

/// Extend a resolved reference by a tail path, dropping resolution
/// metadata so the synthesized path resolves as a whole.
fn synthesize_ref(root: &RefExpr, tail: &[String]) -> RefExpr {
    let mut r = root.clone();
    r.strip_links();
    for name in tail {
        r.steps.push(RefStep::new(name.clone()));
    }
    r
}

fn expand_target_error(r: &RefExpr) -> InferenceError {
    InferenceError::UnknownName {
        path: r.path(),
        context: "the expandable (structured or association) elements".to_string(),
    }
}

/// Enumerate the scalar leaves of a structured element, depth first, as
/// (path, leaf) pairs. Associations nested in structs contribute their
/// foreign keys through flat-name resolution, not through leaves.
pub fn struct_leaves(elem: &ElementDef) -> Vec<(Vec<String>, Arc<ElementDef>)> {
    fn walk(prefix: &[String], e: &ElementDef, leaves: &mut Vec<(Vec<String>, Arc<ElementDef>)>) {
        for (name, child) in &e.elements {
            let mut path = prefix.to_vec();
            path.push(name.clone());
            if child.is_structured() {
                walk(&path, child, leaves);
            } else if child.is_scalar() {
                leaves.push((path, child.clone()));
            }
        }
    }
    let mut leaves = Vec::new();
    walk(&[], elem, &mut leaves);
    leaves
}

fn named_or_expecting(alias: Option<&str>, hint: String) -> Result<String, InferenceError> {
    match alias {
        Some(a) => Ok(a.to_string()),
        None => Err(InferenceError::ExpectingAlias { hint }),
    }
}

/// Literal typing: string, boolean, integer when safely integral,
/// decimal otherwise; null stays opaque.
pub fn literal_type(lit: &Literal) -> Option<String> {
    match lit {
        Literal::Null => None,
        Literal::Bool(_) => Some("cds.Boolean".to_string()),
        Literal::Int(_) => Some("cds.Integer".to_string()),
        Literal::Float(_) => Some("cds.Decimal".to_string()),
        Literal::String(_) => Some("cds.String".to_string()),
    }
}

fn first_ref_type(tokens: &[Expr]) -> Option<String> {
    for t in tokens {
        if let Expr::Ref(r) = t {
            if let Some(link) = r.leaf_link() {
                if let ResolvedDef::Element(e) = &link.definition {
                    return e.type_name.clone();
                }
            }
        }
    }
    None
}

/// Assemble the final ordered plan: explicit columns before the wildcard,
/// then wildcard entries (post-wildcard columns replacing their entry in
/// place), then post-wildcard additions.
fn assemble(
    before: Vec<ColInfer>,
    after: Vec<ColInfer>,
    star_seen: bool,
    excluding: &[String],
    scope: &QueryScope,
) -> Result<Projection, InferenceError> {
    let mut projection = Projection::default();

    fn add(projection: &mut Projection, ci: ColInfer) -> Result<(), InferenceError> {
        for (name, element) in ci.elements {
            if projection.elements.contains_key(&name) {
                return Err(InferenceError::DuplicateElement { name });
            }
            projection.elements.insert(name, element);
        }
        if let ProjectionItem::Column { column, name } = &ci.item {
            projection.by_name.insert(name.clone(), column.clone());
        }
        projection.items.push(ci.item);
        Ok(())
    }

    if !star_seen {
        for ci in before {
            add(&mut projection, ci)?;
        }
        for ci in after {
            add(&mut projection, ci)?;
        }
        return Ok(projection);
    }

    let before_names: Vec<String> = before.iter().map(|c| c.name.clone()).collect();
    let mut replacements: HashMap<String, ColInfer> = HashMap::new();
    let mut additions: Vec<ColInfer> = Vec::new();
    for ci in after {
        if scope.combined.contains_key(&ci.name) {
            replacements.insert(ci.name.clone(), ci);
        } else {
            additions.push(ci);
        }
    }

    for ci in before {
        add(&mut projection, ci)?;
    }

    for (name, contributors) in &scope.combined {
        if excluding.iter().any(|x| x == name) {
            continue;
        }
        if before_names.iter().any(|n| n == name) {
            continue;
        }
        if let Some(replacement) = replacements.remove(name) {
            add(&mut projection, replacement)?;
            continue;
        }
        if contributors
            .iter()
            .all(|(_, elem)| elem.is_foreign_key_mirror())
        {
            continue;
        }
        if contributors.len() > 1 {
            return Err(InferenceError::AmbiguousWildcard {
                name: name.clone(),
                alternatives: contributors
                    .iter()
                    .map(|(alias, _)| format!("{}.{}", alias, name))
                    .collect(),
            });
        }
        let (alias, elem) = &contributors[0];
        add(
            &mut projection,
            ColInfer {
                item: ProjectionItem::WildcardElement {
                    alias: alias.clone(),
                    elem: elem.clone(),
                    name: name.clone(),
                },
                elements: vec![(
                    name.clone(),
                    InferredElement::Leaf {
                        def: elem.clone(),
                        cast: None,
                        key: elem.key,
                        annotations: IndexMap::new(),
                    },
                )],
                name: name.clone(),
            },
        )?;
    }

    for ci in additions {
        add(&mut projection, ci)?;
    }

    Ok(projection)
}

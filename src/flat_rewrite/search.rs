//! Search lowering.
//!
//! When a query carries a search specification and the effective source
//! has searchable columns, a `search(<columns>, <expr>)` predicate is
//! AND-ed into `where`. Which columns are searchable is a collaborator
//! concern: callers may supply their own [`SearchColumns`]; the default
//! selects string-typed scalar elements, honoring `@cds.search.*`
//! annotations on the entity.

use crate::cqn::ast::{Expr, FuncCall, Literal, RefExpr, Xpr};
use crate::model_catalog::csn_model::{Definition, SEARCH_ANNOTATION_PREFIX};
use crate::query_inference::scope::QueryScope;

/// Computes the searchable columns of an entity for search lowering.
pub trait SearchColumns {
    fn searchable_columns(&self, entity: &Definition, alias: &str) -> Vec<RefExpr>;
}

/// Default collaborator: string-typed scalar elements. When the entity
/// carries `@cds.search.<element>: true` annotations, only those
/// elements are searchable; `false` annotations exclude an element.
#[derive(Debug, Default)]
pub struct DefaultSearchColumns;

impl SearchColumns for DefaultSearchColumns {
    fn searchable_columns(&self, entity: &Definition, alias: &str) -> Vec<RefExpr> {
        let mut included: Vec<&str> = Vec::new();
        let mut excluded: Vec<&str> = Vec::new();
        for (key, value) in &entity.annotations {
            if let Some(elem) = key.strip_prefix(SEARCH_ANNOTATION_PREFIX) {
                match value {
                    Literal::Bool(true) => included.push(elem),
                    Literal::Bool(false) => excluded.push(elem),
                    _ => {}
                }
            }
        }

        entity
            .elements
            .iter()
            .filter(|(name, elem)| {
                if !included.is_empty() {
                    return included.contains(&name.as_str());
                }
                elem.is_scalar() && elem.is_string_typed() && !excluded.contains(&name.as_str())
            })
            .map(|(name, _)| RefExpr::from_names([alias, name.as_str()]))
            .collect()
    }
}

/// Lower a search specification into a `search(...)` predicate, or
/// nothing when there is no single effective source or it has no
/// searchable columns.
pub(crate) fn lower_search(
    search: &Xpr,
    scope: &QueryScope,
    provider: &dyn SearchColumns,
) -> Option<Xpr> {
    let (alias, def) = scope.single_source()?;
    let columns = provider.searchable_columns(def, alias);
    if columns.is_empty() {
        return None;
    }
    let needle = if search.len() == 1 {
        search[0].clone()
    } else {
        Expr::Xpr(search.clone())
    };
    Some(vec![Expr::Func(FuncCall {
        name: "search".to_string(),
        args: vec![
            Expr::List(columns.into_iter().map(Expr::Ref).collect()),
            needle,
        ],
    })])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_catalog::csn_model::CsnModel;
    use serde_json::json;

    fn model() -> CsnModel {
        CsnModel::from_value(json!({
            "Books": {
                "elements": {
                    "ID": { "type": "cds.Integer", "key": true },
                    "title": { "type": "cds.String" },
                    "descr": { "type": "cds.LargeString" },
                    "stock": { "type": "cds.Integer" }
                }
            },
            "Tagged": {
                "annotations": { "@cds.search.title": true },
                "elements": {
                    "title": { "type": "cds.String" },
                    "descr": { "type": "cds.String" }
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_default_search_columns_are_string_scalars() {
        let m = model();
        let books = m.lookup("Books").unwrap();
        let cols = DefaultSearchColumns.searchable_columns(books, "Books");
        let names: Vec<String> = cols.iter().map(|r| r.path()).collect();
        assert_eq!(names, vec!["Books.title", "Books.descr"]);
    }

    #[test]
    fn test_search_annotations_whitelist() {
        let m = model();
        let tagged = m.lookup("Tagged").unwrap();
        let cols = DefaultSearchColumns.searchable_columns(tagged, "T");
        let names: Vec<String> = cols.iter().map(|r| r.path()).collect();
        assert_eq!(names, vec!["T.title"]);
    }
}

//! Shared test fixture: a small bookshop model covering managed and
//! backlink associations, structured elements, virtual elements, renamed
//! foreign keys, localization and persistence-skipped targets.
#![allow(dead_code)]

use cqnflat::cqn::{Column, Expr, Query, RefExpr, SelectQuery, Source, SourceRef};
use cqnflat::CsnModel;
use serde_json::json;

/// Route the crate's `log` output into the test harness; `RUST_LOG`
/// selects levels. Safe to call from every test.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn bookshop() -> CsnModel {
    init_logging();
    CsnModel::from_value(json!({
        "Books": {
            "localizedView": "localized.Books",
            "elements": {
                "ID": { "type": "cds.Integer", "key": true },
                "title": { "type": "cds.String" },
                "descr": { "type": "cds.LargeString" },
                "stock": { "type": "cds.Integer" },
                "price": { "type": "cds.Decimal" },
                "author": {
                    "association": { "target": "Authors", "keys": [{ "ref": ["ID"] }] }
                },
                "genre": {
                    "association": { "target": "Genres", "keys": [{ "ref": ["ID"] }] }
                },
                "author_ID": {
                    "type": "cds.Integer",
                    "annotations": { "@odata.foreignKey4": "author" }
                },
                "struc": {
                    "elements": {
                        "x": { "type": "cds.Integer" },
                        "y": { "type": "cds.Integer" }
                    }
                },
                "footnote": { "type": "cds.String", "virtual": true },
                "archive": {
                    "association": { "target": "Archive", "keys": [{ "ref": ["ID"] }] }
                }
            }
        },
        "localized.Books": {
            "elements": {
                "ID": { "type": "cds.Integer", "key": true },
                "title": { "type": "cds.String" },
                "descr": { "type": "cds.LargeString" },
                "stock": { "type": "cds.Integer" },
                "price": { "type": "cds.Decimal" },
                "author": {
                    "association": { "target": "Authors", "keys": [{ "ref": ["ID"] }] }
                }
            }
        },
        "Authors": {
            "elements": {
                "ID": { "type": "cds.Integer", "key": true },
                "name": { "type": "cds.String" },
                "books": {
                    "association": {
                        "target": "Books",
                        "cardinality": "many",
                        "on": [
                            { "ref": ["books", "author"] },
                            { "kw": "=" },
                            { "ref": ["$self"] }
                        ]
                    }
                }
            }
        },
        "Genres": {
            "elements": {
                "ID": { "type": "cds.Integer", "key": true },
                "name": { "type": "cds.String" },
                "parent": {
                    "association": { "target": "Genres", "keys": [{ "ref": ["ID"] }] }
                },
                "children": {
                    "association": {
                        "target": "Genres",
                        "cardinality": "many",
                        "on": [
                            { "ref": ["children", "parent"] },
                            { "kw": "=" },
                            { "ref": ["$self"] }
                        ]
                    }
                }
            }
        },
        "Orders": {
            "elements": {
                "ID": { "type": "cds.Integer", "key": true },
                "item": {
                    "association": {
                        "target": "Items",
                        "keys": [{ "ref": ["ID"], "as": "key" }]
                    }
                }
            }
        },
        "Items": {
            "elements": {
                "ID": { "type": "cds.Integer", "key": true },
                "label": { "type": "cds.String" }
            }
        },
        "Archive": {
            "persistenceSkip": true,
            "elements": {
                "ID": { "type": "cds.Integer", "key": true },
                "note": { "type": "cds.String" }
            }
        },
        "E": {
            "elements": {
                "a": { "type": "cds.String" },
                "b": {
                    "elements": {
                        "x": { "type": "cds.Integer" },
                        "y": { "type": "cds.Integer" }
                    }
                }
            }
        }
    }))
    .expect("fixture model is well formed")
}

pub fn select_from(entity: &str) -> SelectQuery {
    SelectQuery::from(Source::Ref(SourceRef::new(RefExpr::parse(entity))))
}

pub fn select(entity: &str, columns: Vec<Column>) -> Query {
    let mut sel = select_from(entity);
    sel.columns = columns;
    Query::select(sel)
}

/// The flat `{ref: [alias, column]}` column shape.
pub fn flat_col(alias: &str, column: &str) -> Column {
    Column::new(Expr::Ref(RefExpr::from_names([alias, column])))
}

/// All aliases introduced by the output `from` of a SELECT.
pub fn from_aliases(source: &Source, out: &mut Vec<String>) {
    match source {
        Source::Ref(sr) => {
            if let Some(a) = &sr.alias {
                out.push(a.clone());
            }
        }
        Source::Join(j) => {
            for arg in &j.args {
                from_aliases(arg, out);
            }
        }
        Source::Select(sub) => {
            if let Some(a) = &sub.alias {
                out.push(a.clone());
            }
        }
    }
}

//! Error-path coverage: every failure kind with the offending path in
//! the message.

mod common;

use common::{bookshop, init_logging, select, select_from};
use cqnflat::cqn::{
    Column, Expr, JoinKind, JoinSource, OrderItem, Query, RefExpr, RefStep, SelectQuery, SetQuery,
    Source, SourceRef,
};
use cqnflat::flat_rewrite::RewriteError;
use cqnflat::query_inference::InferenceError;
use cqnflat::{rewrite_query, CsnModel};
use serde_json::json;

fn inference_err(result: Result<cqnflat::NormalizedQuery, RewriteError>) -> InferenceError {
    match result.unwrap_err() {
        RewriteError::Inference(e) => e,
        other => panic!("expected an inference error, got {:?}", other),
    }
}

#[test]
fn test_unknown_name() {
    let model = bookshop();
    let q = select("Books", vec![Column::ref_("tittle")]);
    let err = inference_err(rewrite_query(&q, &model));
    match err {
        InferenceError::UnknownName { path, .. } => assert_eq!(path, "tittle"),
        other => panic!("unexpected error {:?}", other),
    }
}

#[test]
fn test_unknown_step_reports_dotted_path() {
    let model = bookshop();
    let q = select("Books", vec![Column::ref_("author.nam")]);
    let err = inference_err(rewrite_query(&q, &model));
    match err {
        InferenceError::UnknownName { path, .. } => assert_eq!(path, "author.nam"),
        other => panic!("unexpected error {:?}", other),
    }
}

fn join_of(left: &str, right: &str) -> Source {
    Source::Join(Box::new(JoinSource {
        kind: JoinKind::Inner,
        args: vec![
            Source::Ref(SourceRef::new(RefExpr::parse(left))),
            Source::Ref(SourceRef::new(RefExpr::parse(right))),
        ],
        on: vec![
            Expr::Ref(RefExpr::from_names([left, "ID"])),
            Expr::kw("="),
            Expr::Ref(RefExpr::from_names([right, "ID"])),
        ],
    }))
}

#[test]
fn test_ambiguous_unqualified_name() {
    let model = bookshop();
    let mut sel = SelectQuery::from(join_of("Authors", "Genres"));
    sel.columns = vec![Column::ref_("name")];
    let err = inference_err(rewrite_query(&Query::select(sel), &model));
    match err {
        InferenceError::AmbiguousName { name, alternatives } => {
            assert_eq!(name, "name");
            assert_eq!(alternatives, vec!["Authors.name", "Genres.name"]);
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[test]
fn test_ambiguous_wildcard() {
    let model = bookshop();
    let mut sel = SelectQuery::from(join_of("Authors", "Genres"));
    sel.columns = vec![Column::star()];
    let err = inference_err(rewrite_query(&Query::select(sel), &model));
    assert!(matches!(err, InferenceError::AmbiguousWildcard { .. }));
}

#[test]
fn test_duplicate_alias() {
    let model = bookshop();
    let sel = SelectQuery::from(Source::Join(Box::new(JoinSource {
        kind: JoinKind::Inner,
        args: vec![
            Source::Ref(SourceRef::aliased(RefExpr::parse("Books"), "B")),
            Source::Ref(SourceRef::aliased(RefExpr::parse("Authors"), "B")),
        ],
        on: vec![],
    })));
    let err = inference_err(rewrite_query(&Query::select(sel), &model));
    assert_eq!(err, InferenceError::DuplicateAlias { alias: "B".into() });
}

#[test]
fn test_duplicate_element() {
    let model = bookshop();
    let q = select("Books", vec![Column::ref_("title"), Column::ref_("title")]);
    let err = inference_err(rewrite_query(&q, &model));
    assert_eq!(
        err,
        InferenceError::DuplicateElement {
            name: "title".into()
        }
    );
}

#[test]
fn test_value_column_needs_alias() {
    let model = bookshop();
    let q = select("Books", vec![Column::new(Expr::int(1))]);
    let err = inference_err(rewrite_query(&q, &model));
    assert!(matches!(err, InferenceError::ExpectingAlias { .. }));
}

#[test]
fn test_filter_on_non_association() {
    let model = bookshop();
    let q = select(
        "Books",
        vec![Column::new(Expr::Ref(RefExpr::new(vec![RefStep::filtered(
            "title",
            vec![Expr::rf("x"), Expr::kw("="), Expr::int(1)],
        )])))],
    );
    let err = inference_err(rewrite_query(&q, &model));
    assert!(matches!(err, InferenceError::FilterOnNonAssoc { .. }));
}

#[test]
fn test_filter_without_navigation() {
    let model = bookshop();
    let mut sel = select_from("Books");
    sel.columns = vec![Column::ref_("title")];
    sel.where_clause = Some(vec![
        Expr::Ref(RefExpr::new(vec![RefStep::filtered(
            "author",
            vec![Expr::rf("name"), Expr::kw("="), Expr::string("x")],
        )])),
        Expr::kw("is"),
        Expr::kw("null"),
    ]);
    let err = inference_err(rewrite_query(&Query::select(sel), &model));
    assert!(matches!(err, InferenceError::FilterWithoutNavigation { .. }));
}

#[test]
fn test_unmanaged_association_in_infix_filter() {
    let model = bookshop();
    let q = select(
        "Books",
        vec![Column::new(Expr::Ref(RefExpr::new(vec![
            RefStep::filtered(
                "author",
                vec![Expr::rf("books.title"), Expr::kw("="), Expr::string("x")],
            ),
            RefStep::new("name"),
        ])))],
    );
    let err = inference_err(rewrite_query(&q, &model));
    assert!(matches!(err, InferenceError::UnmanagedInInfixFilter { .. }));
}

#[test]
fn test_non_foreign_key_navigation_in_infix_filter() {
    let model = bookshop();
    let q = select(
        "Books",
        vec![Column::new(Expr::Ref(RefExpr::new(vec![
            RefStep::filtered(
                "genre",
                vec![Expr::rf("parent.name"), Expr::kw("="), Expr::string("x")],
            ),
            RefStep::new("name"),
        ])))],
    );
    let err = inference_err(rewrite_query(&q, &model));
    assert!(matches!(err, InferenceError::NonFkInInfixFilter { .. }));
}

#[test]
fn test_union_is_rejected() {
    let model = bookshop();
    let q = Query::Set(SetQuery {
        op: "union".to_string(),
        args: vec![
            select("Books", vec![Column::ref_("title")]),
            select("Authors", vec![Column::ref_("name")]),
        ],
    });
    assert!(matches!(
        rewrite_query(&q, &model),
        Err(RewriteError::UnionNotSupported)
    ));
}

#[test]
fn test_struct_compared_with_value() {
    let model = bookshop();
    let mut sel = select_from("Books");
    sel.columns = vec![Column::ref_("title")];
    sel.where_clause = Some(vec![Expr::rf("struc"), Expr::kw("="), Expr::int(1)]);
    assert!(matches!(
        rewrite_query(&Query::select(sel), &model),
        Err(RewriteError::CannotCompareStructWithValue { .. })
    ));
}

#[test]
fn test_structural_shape_mismatch() {
    let model = bookshop();
    let mut sel = select_from("Books");
    sel.columns = vec![Column::ref_("title")];
    sel.where_clause = Some(vec![Expr::rf("struc"), Expr::kw("="), Expr::rf("author")]);
    assert!(matches!(
        rewrite_query(&Query::select(sel), &model),
        Err(RewriteError::StructuralShapeMismatch { .. })
    ));
}

#[test]
fn test_struct_as_value_in_expression() {
    let model = bookshop();
    let mut sel = select_from("Books");
    sel.columns = vec![Column::ref_("title")];
    sel.where_clause = Some(vec![Expr::rf("struc")]);
    assert!(matches!(
        rewrite_query(&Query::select(sel), &model),
        Err(RewriteError::StructInExpression { .. })
    ));
}

#[test]
fn test_unmanaged_association_as_column() {
    let model = bookshop();
    let q = select("Authors", vec![Column::ref_("books")]);
    assert!(matches!(
        rewrite_query(&q, &model),
        Err(RewriteError::AssocInExpression { .. })
    ));
}

#[test]
fn test_ambiguous_order_by() {
    let model = bookshop();
    let mut sel = select_from("Books");
    sel.columns = vec![Column::ref_("title")];
    sel.order_by = Some(vec![OrderItem::new(Expr::rf("struc"))]);
    assert!(matches!(
        rewrite_query(&Query::select(sel), &model),
        Err(RewriteError::AmbiguousOrderBy { columns: 2, .. })
    ));
}

#[test]
fn test_empty_projection_after_virtual_drop() {
    let model = bookshop();
    let q = select("Books", vec![Column::ref_("footnote")]);
    assert!(matches!(
        rewrite_query(&q, &model),
        Err(RewriteError::EmptyProjection)
    ));
}

#[test]
fn test_correlated_reference_must_stay_on_foreign_keys() {
    let model = bookshop();
    // The subquery's correlated reference navigates genre past its
    // foreign keys; that join could only live in the enclosing query.
    let sub = {
        let mut s = select_from("Authors");
        s.columns = vec![Column::ref_("ID")];
        s.where_clause = Some(vec![
            Expr::rf("Books.genre.name"),
            Expr::kw("="),
            Expr::string("Drama"),
        ]);
        s
    };
    let mut sel = select_from("Books");
    sel.columns = vec![Column::ref_("title")];
    sel.where_clause = Some(vec![
        Expr::rf("author.ID"),
        Expr::kw("in"),
        Expr::Select(Box::new(sub)),
    ]);
    let err = inference_err(rewrite_query(&Query::select(sel), &model));
    match err {
        InferenceError::CorrelatedNavigation { path } => {
            assert_eq!(path, "Books.genre.name");
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[test]
fn test_unresolvable_backlink_chain() {
    init_logging();
    // Two unmanaged associations whose on-conditions point at each other
    // through $self: the backlink substitution alternates between them
    // and never reaches a foreign-key pairing.
    let model = CsnModel::from_value(json!({
        "Left": {
            "elements": {
                "ID": { "type": "cds.Integer", "key": true },
                "twin": {
                    "association": {
                        "target": "Right",
                        "cardinality": "many",
                        "on": [
                            { "ref": ["twin", "mate"] },
                            { "kw": "=" },
                            { "ref": ["$self"] }
                        ]
                    }
                }
            }
        },
        "Right": {
            "elements": {
                "ID": { "type": "cds.Integer", "key": true },
                "mate": {
                    "association": {
                        "target": "Left",
                        "cardinality": "many",
                        "on": [
                            { "ref": ["mate", "twin"] },
                            { "kw": "=" },
                            { "ref": ["$self"] }
                        ]
                    }
                }
            }
        }
    }))
    .expect("fixture model is well formed");

    let mut sel = select_from("Left");
    sel.columns = vec![Column::ref_("ID")];
    sel.where_clause = Some(vec![Expr::kw("exists"), Expr::rf("twin")]);
    assert!(matches!(
        rewrite_query(&Query::select(sel), &model),
        Err(RewriteError::UnresolvableBacklink { .. })
    ));
}

#[test]
fn test_error_messages_carry_the_path() {
    let model = bookshop();
    let q = select("Books", vec![Column::ref_("author.nam")]);
    let message = rewrite_query(&q, &model).unwrap_err().to_string();
    assert!(message.contains("author.nam"), "message: {}", message);
}

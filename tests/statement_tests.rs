//! Statement-level behavior: data statements, localization, expand
//! decorations, persistence-skipped targets, subquery sources.

mod common;

use common::{bookshop, flat_col, select, select_from};
use cqnflat::cqn::{
    Column, DeleteQuery, Expr, InsertQuery, Literal, Query, RefExpr, SelectQuery, Source,
    SourceRef, SubquerySource, UpdateQuery,
};
use cqnflat::query_inference::elements::InferredElement;
use cqnflat::rewrite_query;
use indexmap::IndexMap;

#[test]
fn test_insert_into_is_normalized_to_single_step() {
    let model = bookshop();
    let q = Query::Insert(InsertQuery {
        into: SourceRef::new(RefExpr::parse("Authors.books")),
        columns: vec!["title".to_string()],
        entries: Vec::new(),
    });
    let result = rewrite_query(&q, &model).unwrap();
    let Query::Insert(insert) = &result.query else {
        panic!("expected an INSERT");
    };
    assert_eq!(insert.into.ref_, RefExpr::parse("Books"));
    assert_eq!(insert.into.alias, None);
    assert_eq!(insert.columns, vec!["title".to_string()]);
}

#[test]
fn test_update_rewrites_where_and_values() {
    let model = bookshop();
    let mut with_values = IndexMap::new();
    with_values.insert("stock".to_string(), Expr::int(0));
    with_values.insert("descr".to_string(), Expr::rf("title"));
    let q = Query::Update(UpdateQuery {
        entity: SourceRef::new(RefExpr::parse("Books")),
        with_values,
        where_clause: Some(vec![Expr::rf("stock"), Expr::kw("<"), Expr::int(5)]),
    });
    let result = rewrite_query(&q, &model).unwrap();
    let Query::Update(update) = &result.query else {
        panic!("expected an UPDATE");
    };
    assert_eq!(
        update.where_clause.as_deref(),
        Some(&[Expr::rf("Books.stock"), Expr::kw("<"), Expr::int(5)][..])
    );
    assert_eq!(update.with_values.get("stock"), Some(&Expr::int(0)));
    assert_eq!(
        update.with_values.get("descr"),
        Some(&Expr::rf("Books.title"))
    );
}

#[test]
fn test_delete_with_path_target_gets_exists() {
    let model = bookshop();
    let q = Query::Delete(DeleteQuery {
        from: SourceRef::new(RefExpr::parse("Authors.books")),
        where_clause: None,
    });
    let result = rewrite_query(&q, &model).unwrap();
    let Query::Delete(delete) = &result.query else {
        panic!("expected a DELETE");
    };
    assert_eq!(delete.from.ref_, RefExpr::parse("Books"));
    let where_clause = delete.where_clause.as_ref().expect("derived where");
    assert!(where_clause[0].is_keyword("exists"));
}

#[test]
fn test_localized_query_uses_localized_view() {
    let model = bookshop();
    let mut sel = select_from("Books");
    sel.columns = vec![Column::ref_("title")];
    sel.localized = true;
    let result = rewrite_query(&Query::select(sel), &model).unwrap();
    let sel = result.query.as_select().unwrap();
    assert_eq!(
        sel.from,
        Source::Ref(SourceRef::aliased(
            RefExpr::from_names(["localized.Books"]),
            "Books"
        ))
    );
    assert_eq!(sel.columns, vec![flat_col("Books", "title")]);
}

#[test]
fn test_expand_decorations_carry_onto_subquery() {
    let model = bookshop();
    let mut expand_col = Column::ref_("books").expanded(vec![Column::ref_("title")]);
    expand_col.limit = Some(cqnflat::cqn::Limit {
        rows: Some(Literal::Int(10)),
        offset: None,
    });
    let q = select("Authors", vec![Column::ref_("ID"), expand_col]);
    let result = rewrite_query(&q, &model).unwrap();
    let sel = result.query.as_select().unwrap();
    let Expr::Select(sub) = &sel.columns[1].expr else {
        panic!("expected a subquery column");
    };
    assert_eq!(
        sub.limit,
        Some(cqnflat::cqn::Limit {
            rows: Some(Literal::Int(10)),
            offset: None,
        })
    );
}

#[test]
fn test_expand_of_persistence_skipped_target_is_omitted() {
    let model = bookshop();
    let q = select(
        "Books",
        vec![
            Column::ref_("title"),
            Column::ref_("archive").expanded(vec![Column::ref_("note")]),
        ],
    );
    let result = rewrite_query(&q, &model).unwrap();
    let sel = result.query.as_select().unwrap();
    assert_eq!(sel.columns, vec![flat_col("Books", "title")]);
    match result.elements.get("archive") {
        Some(InferredElement::Subquery { skipped, .. }) => assert!(*skipped),
        other => panic!("expected a skipped subquery element, got {:?}", other),
    }
}

#[test]
fn test_to_one_expand_is_marked_one() {
    let model = bookshop();
    let q = select(
        "Books",
        vec![Column::ref_("author").expanded(vec![Column::ref_("name")])],
    );
    let result = rewrite_query(&q, &model).unwrap();
    let sel = result.query.as_select().unwrap();
    let Expr::Select(sub) = &sel.columns[0].expr else {
        panic!("expected a subquery column");
    };
    assert!(sub.one);
    assert!(sub.expand);
}

#[test]
fn test_subquery_source_is_normalized_and_resolvable() {
    let model = bookshop();
    let inner = {
        let mut s = select_from("Books");
        s.columns = vec![Column::ref_("title"), Column::ref_("stock")];
        s
    };
    let mut sel = SelectQuery::from(Source::Select(SubquerySource {
        query: Box::new(inner),
        alias: Some("B".to_string()),
    }));
    sel.columns = vec![Column::ref_("title")];
    let result = rewrite_query(&Query::select(sel), &model).unwrap();
    let sel = result.query.as_select().unwrap();
    assert_eq!(sel.columns, vec![flat_col("B", "title")]);
    let Source::Select(sub) = &sel.from else {
        panic!("expected a subquery source");
    };
    assert_eq!(sub.alias.as_deref(), Some("B"));
    assert_eq!(sub.query.columns[0], flat_col("Books", "title"));
}

#[test]
fn test_infix_filter_lands_on_join_edge() {
    let model = bookshop();
    let q = select(
        "Books",
        vec![Column::new(Expr::Ref(RefExpr::new(vec![
            cqnflat::cqn::RefStep::filtered(
                "author",
                vec![Expr::rf("name"), Expr::kw("="), Expr::string("Poe")],
            ),
            cqnflat::cqn::RefStep::new("name"),
        ])))],
    );
    let result = rewrite_query(&q, &model).unwrap();
    let sel = result.query.as_select().unwrap();
    let Source::Join(join) = &sel.from else {
        panic!("expected a join");
    };
    // The edge carries the foreign-key pairing plus the filter.
    let rendered = format!("{:?}", join.on);
    assert!(rendered.contains("Poe"), "on: {}", rendered);
}

#[test]
fn test_group_by_expands_structured_reference() {
    let model = bookshop();
    let mut sel = select_from("Books");
    sel.columns = vec![Column::ref_("title")];
    sel.group_by = Some(vec![Expr::rf("struc"), Expr::rf("title")]);
    let result = rewrite_query(&Query::select(sel), &model).unwrap();
    let sel = result.query.as_select().unwrap();
    assert_eq!(
        sel.group_by.as_deref(),
        Some(
            &[
                Expr::rf("Books.struc_x"),
                Expr::rf("Books.struc_y"),
                Expr::rf("Books.title"),
            ][..]
        )
    );
}

#[test]
fn test_order_by_resolves_output_element_names() {
    let model = bookshop();
    let mut sel = select_from("Books");
    sel.columns = vec![Column::ref_("author.name").aliased("authorName")];
    sel.order_by = Some(vec![cqnflat::cqn::OrderItem {
        expr: Expr::rf("authorName"),
        sort: Some(cqnflat::cqn::SortOrder::Desc),
        nulls: None,
    }]);
    let result = rewrite_query(&Query::select(sel), &model).unwrap();
    let sel = result.query.as_select().unwrap();
    let order = sel.order_by.as_ref().unwrap();
    assert_eq!(order[0].expr, Expr::rf("author.name"));
    assert_eq!(order[0].sort, Some(cqnflat::cqn::SortOrder::Desc));
}

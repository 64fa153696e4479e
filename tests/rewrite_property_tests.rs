//! Universal properties of the rewrite: reference closure, alias
//! uniqueness, determinism, idempotence, annotation preservation,
//! subquery correlation.

mod common;

use std::collections::HashSet;

use common::{bookshop, from_aliases, select, select_from};
use cqnflat::cqn::{Column, Expr, Literal, Query, SelectQuery};
use cqnflat::query_inference::elements::InferredElement;
use cqnflat::rewrite_query;

fn collect_refs<'a>(tokens: &'a [Expr], out: &mut Vec<&'a cqnflat::cqn::RefExpr>) {
    for t in tokens {
        match t {
            Expr::Ref(r) => out.push(r),
            Expr::Func(f) => collect_refs(&f.args, out),
            Expr::Xpr(inner) | Expr::List(inner) => collect_refs(inner, out),
            _ => {}
        }
    }
}

fn check_reference_closure(sel: &SelectQuery) {
    let mut aliases = Vec::new();
    from_aliases(&sel.from, &mut aliases);
    let aliases: HashSet<String> = aliases.into_iter().collect();

    let mut refs = Vec::new();
    for col in &sel.columns {
        match &col.expr {
            Expr::Ref(r) => refs.push(r),
            Expr::Select(sub) => check_reference_closure(sub),
            Expr::Func(f) => collect_refs(&f.args, &mut refs),
            Expr::Xpr(ts) => collect_refs(ts, &mut refs),
            _ => {}
        }
    }
    if let Some(ts) = &sel.where_clause {
        let mut where_refs = Vec::new();
        collect_refs(ts, &mut where_refs);
        for r in where_refs {
            if r.steps[0].name.starts_with('$') {
                continue;
            }
            // Correlated references may name an outer alias, so only the
            // shape is checked here.
            assert_eq!(r.steps.len(), 2, "flat reference expected: {}", r.path());
        }
    }
    for r in refs {
        if r.steps[0].name.starts_with('$') {
            continue;
        }
        assert_eq!(r.steps.len(), 2, "flat reference expected: {}", r.path());
        assert!(
            aliases.contains(&r.steps[0].name),
            "alias {} must come from the from clause",
            r.steps[0].name
        );
    }
}

#[test]
fn test_reference_closure_and_alias_uniqueness() {
    let model = bookshop();
    let mut sel = select_from("Books");
    sel.columns = vec![
        Column::ref_("title"),
        Column::ref_("author.name"),
        Column::ref_("genre.name"),
    ];
    sel.where_clause = Some(vec![
        Expr::rf("author.name"),
        Expr::kw("="),
        Expr::string("Poe"),
    ]);
    let result = rewrite_query(&Query::select(sel), &model).unwrap();
    let sel = result.query.as_select().unwrap();

    check_reference_closure(sel);

    let mut aliases = Vec::new();
    from_aliases(&sel.from, &mut aliases);
    let unique: HashSet<&String> = aliases.iter().collect();
    assert_eq!(unique.len(), aliases.len(), "aliases must be unique");
    assert!(aliases.contains(&"author".to_string()));
    assert!(aliases.contains(&"genre".to_string()));
}

#[test]
fn test_shared_prefix_shares_the_join_alias() {
    let model = bookshop();
    let q = select(
        "Books",
        vec![Column::ref_("author.name"), Column::ref_("author.ID")],
    );
    let result = rewrite_query(&q, &model).unwrap();
    let sel = result.query.as_select().unwrap();

    // author.ID is foreign-key-only and stays on Books; author.name
    // joins. Only one join alias may exist.
    let mut aliases = Vec::new();
    from_aliases(&sel.from, &mut aliases);
    assert_eq!(aliases, vec!["Books".to_string(), "author".to_string()]);
}

#[test]
fn test_determinism() {
    let model = bookshop();
    let mut sel = select_from("Books");
    sel.columns = vec![Column::star()];
    sel.where_clause = Some(vec![
        Expr::kw("exists"),
        Expr::rf("author.books"),
    ]);
    let q = Query::select(sel);
    let a = rewrite_query(&q, &model).unwrap();
    let b = rewrite_query(&q, &model).unwrap();
    assert_eq!(a.query, b.query);
}

#[test]
fn test_flat_query_is_a_fixed_point() {
    let model = bookshop();
    let q = select("Books", vec![Column::ref_("title")]);
    let once = rewrite_query(&q, &model).unwrap();
    let twice = rewrite_query(&once.query, &model).unwrap();
    assert_eq!(once.query, twice.query);
}

#[test]
fn test_input_query_is_not_mutated() {
    let model = bookshop();
    let q = select("Books", vec![Column::ref_("author.name")]);
    let before = q.clone();
    let _ = rewrite_query(&q, &model).unwrap();
    assert_eq!(q, before);
}

#[test]
fn test_annotations_survive_onto_elements() {
    let model = bookshop();
    let mut col = Column::ref_("title");
    col.annotations
        .insert("@readonly".to_string(), Literal::Bool(true));
    let q = select("Books", vec![col]);
    let result = rewrite_query(&q, &model).unwrap();
    match result.elements.get("title") {
        Some(InferredElement::Leaf { annotations, .. }) => {
            assert_eq!(annotations.get("@readonly"), Some(&Literal::Bool(true)));
        }
        other => panic!("expected a leaf element, got {:?}", other),
    }
}

#[test]
fn test_expand_correlation_names_outer_alias() {
    let model = bookshop();
    let q = select(
        "Authors",
        vec![
            Column::ref_("ID"),
            Column::ref_("books").expanded(vec![Column::ref_("title")]),
        ],
    );
    let result = rewrite_query(&q, &model).unwrap();
    let sel = result.query.as_select().unwrap();

    let mut outer_aliases = Vec::new();
    from_aliases(&sel.from, &mut outer_aliases);

    let Expr::Select(sub) = &sel.columns[1].expr else {
        panic!("expected a subquery column");
    };
    let mut refs = Vec::new();
    collect_refs(sub.where_clause.as_deref().unwrap_or(&[]), &mut refs);
    let correlated: Vec<_> = refs
        .iter()
        .filter(|r| outer_aliases.contains(&r.steps[0].name))
        .collect();
    assert!(
        !correlated.is_empty(),
        "the expand subquery must correlate with the enclosing select"
    );
}

#[test]
fn test_no_association_traversals_survive() {
    let model = bookshop();
    let mut sel = select_from("Books");
    sel.columns = vec![Column::ref_("author.name"), Column::ref_("genre.parent.name")];
    let result = rewrite_query(&Query::select(sel), &model).unwrap();
    let sel = result.query.as_select().unwrap();
    for col in &sel.columns {
        if let Expr::Ref(r) = &col.expr {
            assert_eq!(r.steps.len(), 2);
        }
    }
    // genre.parent requires two chained joins with distinct aliases.
    let mut aliases = Vec::new();
    from_aliases(&sel.from, &mut aliases);
    assert!(aliases.contains(&"genre".to_string()));
    assert!(aliases.contains(&"parent".to_string()));
}

#[test]
fn test_search_lowering_produces_predicate() {
    let model = bookshop();
    let mut sel = select_from("Books");
    sel.columns = vec![Column::ref_("title")];
    sel.search = Some(vec![Expr::string("dystopia")]);
    let result = rewrite_query(&Query::select(sel), &model).unwrap();
    let sel = result.query.as_select().unwrap();
    let where_clause = sel.where_clause.as_ref().expect("search lowered to where");
    let Expr::Func(f) = &where_clause[0] else {
        panic!("expected a search() predicate, got {:?}", where_clause[0]);
    };
    assert_eq!(f.name, "search");
    assert_eq!(f.args.len(), 2);
    let Expr::List(cols) = &f.args[0] else {
        panic!("expected the searchable column list");
    };
    assert!(!cols.is_empty());
}

#[test]
fn test_wildcard_skips_foreign_key_mirrors_and_virtuals() {
    let model = bookshop();
    let q = select("Books", vec![Column::star()]);
    let result = rewrite_query(&q, &model).unwrap();
    let sel = result.query.as_select().unwrap();

    let names: Vec<String> = sel
        .columns
        .iter()
        .filter_map(|c| match &c.expr {
            Expr::Ref(r) => Some(r.steps[1].name.clone()),
            _ => None,
        })
        .collect();
    // The synthesized mirror contributes once (through the association),
    // the virtual element not at all.
    assert_eq!(
        names.iter().filter(|n| n.as_str() == "author_ID").count(),
        1
    );
    assert!(!names.contains(&"footnote".to_string()));
}

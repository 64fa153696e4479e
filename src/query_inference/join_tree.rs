//! The join tree: a deduplicating forest of association traversals that
//! must be materialized as left joins.
//!
//! Each root corresponds to one query source, each child node to one
//! association step. Two references sharing a canonical prefix (path plus
//! inline-filter fingerprint) share the node and therefore the table
//! alias. Traversal order is insertion order, which keeps rewriting
//! deterministic.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::cqn::ast::{RefExpr, Xpr};
use crate::model_catalog::csn_model::{Definition, ElementDef};

#[derive(Debug, Clone)]
pub struct JoinNode {
    /// Unique table alias of the joined association target.
    pub alias: String,
    /// The association element this node traverses.
    pub assoc: Arc<ElementDef>,
    /// Flat path of the association within its declaring entity, e.g.
    /// `["dedication", "addressee"]` for an association nested in a
    /// struct.
    pub assoc_path: Vec<String>,
    /// The (possibly localized) target entity.
    pub target: Arc<Definition>,
    /// Inline filter at this step, with resolution metadata stripped.
    pub filter: Option<Xpr>,
    pub children: IndexMap<String, JoinNode>,
}

#[derive(Debug, Clone, Default)]
pub struct JoinTree {
    roots: IndexMap<String, JoinNode>,
    alias_seq: HashMap<String, u32>,
}

impl JoinTree {
    pub fn new() -> Self {
        JoinTree::default()
    }

    /// Reserve an alias so join nodes never collide with query sources.
    pub fn seed_alias(&mut self, alias: &str) {
        self.alias_seq.entry(alias.to_string()).or_insert(1);
    }

    /// Allocate a unique alias derived from a short id: the id itself on
    /// first use, then `<id>_2`, `<id>_3`, ...
    pub fn next_alias(&mut self, short: &str) -> String {
        alloc_alias(&mut self.alias_seq, short)
    }

    /// No join-relevant navigation was recorded.
    pub fn is_initial(&self) -> bool {
        self.roots.iter().all(|(_, n)| n.children.is_empty())
    }

    pub fn roots(&self) -> impl Iterator<Item = (&String, &JoinNode)> {
        self.roots.iter()
    }

    /// Insert every join-relevant prefix of a resolved reference, reusing
    /// nodes for shared canonical prefixes, and rewrite the reference's
    /// link aliases to the node aliases. `until` is the index of the last
    /// step that requires a join.
    pub fn merge_ref(&mut self, r: &mut RefExpr, until: usize, source_alias: &str) {
        let JoinTree { roots, alias_seq } = self;

        let root = roots
            .entry(source_alias.to_string())
            .or_insert_with(|| JoinNode {
                alias: source_alias.to_string(),
                // Roots carry no traversal; these slots are unused.
                assoc: placeholder_element(),
                assoc_path: Vec::new(),
                target: placeholder_definition(),
                filter: None,
                children: IndexMap::new(),
            });

        let mut node: &mut JoinNode = root;
        let mut struct_prefix: Vec<String> = Vec::new();

        for i in 0..=until {
            let link = &r.links[i];
            let elem = match link.definition.as_element() {
                Some(e) => e.clone(),
                // Explicit source-alias step; contributes no node.
                None => continue,
            };
            if elem.is_structured() {
                struct_prefix.push(r.steps[i].name.clone());
                continue;
            }
            if !elem.is_association() {
                continue;
            }

            let mut assoc_path = std::mem::take(&mut struct_prefix);
            assoc_path.push(r.steps[i].name.clone());

            let key = canonical_key(&assoc_path, r.steps[i].filter.as_ref());
            if !node.children.contains_key(&key) {
                let alias = alloc_alias(alias_seq, &r.steps[i].name);
                log::debug!("join tree: new node {} as {}", key, alias);
                let target = link.target.clone().unwrap_or_else(placeholder_definition);
                let filter = r.steps[i].filter.clone().map(|mut f| {
                    for t in f.iter_mut() {
                        t.strip_links();
                    }
                    f
                });
                node.children.insert(
                    key.clone(),
                    JoinNode {
                        alias,
                        assoc: elem,
                        assoc_path,
                        target,
                        filter,
                        children: IndexMap::new(),
                    },
                );
            }
            let child = node.children.get_mut(&key).expect("just inserted");
            r.links[i].alias = child.alias.clone();
            r.join_split = Some(i);
            node = child;
        }
    }
}

fn alloc_alias(alias_seq: &mut HashMap<String, u32>, short: &str) -> String {
    let n = alias_seq.entry(short.to_string()).or_insert(0);
    *n += 1;
    if *n == 1 {
        short.to_string()
    } else {
        format!("{}_{}", short, n)
    }
}

/// Canonical node key: dotted path plus the filter fingerprint, so two
/// references with different filters at the same step get distinct nodes.
fn canonical_key(path: &[String], filter: Option<&Xpr>) -> String {
    let mut key = path.join(".");
    if let Some(f) = filter {
        key.push('[');
        key.push_str(&serde_json::to_string(f).unwrap_or_default());
        key.push(']');
    }
    key
}

fn placeholder_element() -> Arc<ElementDef> {
    Arc::new(ElementDef::scalar("", ""))
}

fn placeholder_definition() -> Arc<Definition> {
    Arc::new(Definition::new(""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alias_allocation_is_monotonic() {
        let mut jt = JoinTree::new();
        assert_eq!(jt.next_alias("author"), "author");
        assert_eq!(jt.next_alias("author"), "author_2");
        assert_eq!(jt.next_alias("author"), "author_3");
        assert_eq!(jt.next_alias("genre"), "genre");
    }

    #[test]
    fn test_seeded_alias_is_skipped() {
        let mut jt = JoinTree::new();
        jt.seed_alias("Books");
        assert_eq!(jt.next_alias("Books"), "Books_2");
    }

    #[test]
    fn test_canonical_key_includes_filter() {
        use crate::cqn::ast::Expr;
        let path = vec!["author".to_string()];
        let plain = canonical_key(&path, None);
        let filtered = canonical_key(
            &path,
            Some(&vec![Expr::rf("name"), Expr::kw("="), Expr::string("x")]),
        );
        assert_ne!(plain, filtered);
    }
}

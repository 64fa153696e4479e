//! Fixed pseudo-namespace for session/context variables.
//!
//! Paths rooted in one of these names resolve against synthetic
//! definitions and bypass join-tree merging and table-alias prepending:
//! they are rendered as is and bound by the consuming layer.

use std::sync::Arc;

use indexmap::IndexMap;
use lazy_static::lazy_static;

use super::csn_model::ElementDef;

lazy_static! {
    /// Reserved path roots mapped to their synthetic definitions.
    pub static ref PSEUDOS: IndexMap<String, Arc<ElementDef>> = build_pseudos();
}

fn pseudo_scalar(name: &str, type_name: &str) -> Arc<ElementDef> {
    let mut e = ElementDef::scalar(name, type_name);
    e.pseudo = true;
    Arc::new(e)
}

fn build_pseudos() -> IndexMap<String, Arc<ElementDef>> {
    let mut map = IndexMap::new();

    let mut user = ElementDef::scalar("$user", "cds.String");
    user.pseudo = true;
    user.elements
        .insert("id".to_string(), pseudo_scalar("id", "cds.String"));
    user.elements
        .insert("locale".to_string(), pseudo_scalar("locale", "cds.String"));
    user.elements
        .insert("tenant".to_string(), pseudo_scalar("tenant", "cds.String"));
    map.insert("$user".to_string(), Arc::new(user));

    map.insert("$now".to_string(), pseudo_scalar("$now", "cds.Timestamp"));
    map.insert("$at".to_string(), pseudo_scalar("$at", "cds.Timestamp"));
    map.insert("$from".to_string(), pseudo_scalar("$from", "cds.Timestamp"));
    map.insert("$to".to_string(), pseudo_scalar("$to", "cds.Timestamp"));
    map.insert("$locale".to_string(), pseudo_scalar("$locale", "cds.String"));
    map.insert("$tenant".to_string(), pseudo_scalar("$tenant", "cds.String"));

    map
}

/// Look up a pseudo root by name. `$self`/`$projection` are not pseudos;
/// they resolve against the query's own elements.
pub fn pseudo_root(name: &str) -> Option<&'static Arc<ElementDef>> {
    PSEUDOS.get(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_pseudo_has_children() {
        let user = pseudo_root("$user").unwrap();
        assert!(user.pseudo);
        assert!(user.elements.contains_key("id"));
        assert!(user.elements.get("locale").unwrap().pseudo);
    }

    #[test]
    fn test_self_is_not_a_pseudo() {
        assert!(pseudo_root("$self").is_none());
        assert!(pseudo_root("$projection").is_none());
    }
}

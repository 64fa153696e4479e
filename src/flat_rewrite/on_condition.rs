//! On-condition derivation for association traversals.
//!
//! The tokens produced here stay at the CQN level (paths, not flat
//! columns): `[decl, assoc, fk] = [target, fk]` for a managed
//! association, or the cloned on-condition with its roots rewritten for
//! an unmanaged one. The expression rewriter flattens them afterwards,
//! which also expands any `$self`-backlink comparison left in place.

use crate::cqn::ast::{Expr, RefExpr, RefStep, Xpr};
use crate::model_catalog::csn_model::ElementDef;

/// Derive the condition linking `decl_alias` (the entity declaring the
/// association) and `target_alias` (the association target) for one
/// traversal of `assoc`.
///
/// `flip` swaps the operand order of each comparison: joins and
/// from-expansions put the newly introduced side first, where-rooted
/// exists keep the foreign key first.
pub(crate) fn assoc_on_cqn(
    assoc: &ElementDef,
    assoc_path: &[String],
    decl_alias: &str,
    target_alias: &str,
    flip: bool,
) -> Xpr {
    let Some(info) = assoc.association.as_ref() else {
        return Xpr::new();
    };

    if assoc.is_managed() {
        let mut tokens = Xpr::new();
        for fk in &info.keys {
            if !tokens.is_empty() {
                tokens.push(Expr::kw("and"));
            }
            let mut decl_steps: Vec<RefStep> = vec![RefStep::new(decl_alias)];
            decl_steps.extend(assoc_path.iter().map(RefStep::new));
            decl_steps.extend(fk.path.iter().map(RefStep::new));

            let mut target_steps: Vec<RefStep> = vec![RefStep::new(target_alias)];
            target_steps.extend(fk.path.iter().map(RefStep::new));

            let fk_side = Expr::Ref(RefExpr::new(decl_steps));
            let key_side = Expr::Ref(RefExpr::new(target_steps));
            if flip {
                tokens.push(key_side);
                tokens.push(Expr::kw("="));
                tokens.push(fk_side);
            } else {
                tokens.push(fk_side);
                tokens.push(Expr::kw("="));
                tokens.push(key_side);
            }
        }
        return tokens;
    }

    let mut tokens = info.on.clone().unwrap_or_default();
    for t in tokens.iter_mut() {
        t.strip_links();
    }
    rewrite_on_roots(&mut tokens, &assoc.name, decl_alias, target_alias);
    if flip {
        flip_comparisons(&mut tokens);
    }
    tokens
}

/// Rewrite the path roots of an unmanaged on-condition for a concrete
/// traversal: association-rooted paths go to the target side, `$self`
/// and bare element paths to the declaring side.
pub(crate) fn rewrite_on_roots(
    tokens: &mut [Expr],
    assoc_name: &str,
    decl_alias: &str,
    target_alias: &str,
) {
    for token in tokens.iter_mut() {
        match token {
            Expr::Ref(r) => rewrite_ref_root(r, assoc_name, decl_alias, target_alias),
            Expr::Func(f) => rewrite_on_roots(&mut f.args, assoc_name, decl_alias, target_alias),
            Expr::Xpr(inner) | Expr::List(inner) => {
                rewrite_on_roots(inner, assoc_name, decl_alias, target_alias)
            }
            _ => {}
        }
    }
}

fn rewrite_ref_root(r: &mut RefExpr, assoc_name: &str, decl_alias: &str, target_alias: &str) {
    let Some(first) = r.steps.first() else { return };
    if first.name == assoc_name {
        r.steps[0].name = target_alias.to_string();
    } else if first.name == "$self" {
        r.steps[0].name = decl_alias.to_string();
    } else if first.name != decl_alias && first.name != target_alias {
        r.steps.insert(0, RefStep::new(decl_alias));
    }
}

/// Swap the operands of each top-level equality comparison, used when a
/// traversal follows the navigation direction (joins, from-expansion).
pub(crate) fn flip_comparisons(tokens: &mut Xpr) {
    let mut i = 0;
    while i + 2 < tokens.len() {
        let is_eq = matches!(&tokens[i + 1], Expr::Keyword(k)
            if matches!(k.to_lowercase().as_str(), "=" | "==" | "!=" | "<>"));
        if is_eq && is_operand(&tokens[i]) && is_operand(&tokens[i + 2]) {
            tokens.swap(i, i + 2);
            i += 3;
            // Skip a following connective.
            if matches!(tokens.get(i), Some(Expr::Keyword(_))) {
                i += 1;
            }
        } else {
            i += 1;
        }
    }
}

fn is_operand(e: &Expr) -> bool {
    !matches!(e, Expr::Keyword(_))
}

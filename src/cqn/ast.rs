use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::model_catalog::csn_model::{Definition, ElementDef};

/// A token stream, as used by `where`, `having` and `on` clauses.
///
/// Operators and keywords appear as [`Expr::Keyword`] tokens between
/// operand nodes, e.g. `[Ref(x), Keyword("="), Val(1)]`.
pub type Xpr = Vec<Expr>;

/// A statement in query object notation.
///
/// The variant tags follow the CQN wire form (`{"SELECT": {...}}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Query {
    #[serde(rename = "SELECT")]
    Select(Box<SelectQuery>),
    #[serde(rename = "INSERT")]
    Insert(InsertQuery),
    #[serde(rename = "UPSERT")]
    Upsert(InsertQuery),
    #[serde(rename = "UPDATE")]
    Update(UpdateQuery),
    #[serde(rename = "DELETE")]
    Delete(DeleteQuery),
    #[serde(rename = "STREAM")]
    Stream(StreamQuery),
    /// A set operation (UNION and friends). Carried only to be rejected
    /// by the rewriter.
    #[serde(rename = "SET")]
    Set(SetQuery),
}

impl Query {
    pub fn select(sel: SelectQuery) -> Self {
        Query::Select(Box::new(sel))
    }

    pub fn as_select(&self) -> Option<&SelectQuery> {
        match self {
            Query::Select(sel) => Some(sel),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectQuery {
    pub from: Source,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<Column>,
    #[serde(rename = "where", default, skip_serializing_if = "Option::is_none")]
    pub where_clause: Option<Xpr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_by: Option<Vec<Expr>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub having: Option<Xpr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_by: Option<Vec<OrderItem>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<Limit>,
    /// Search specification; lowered into `where` against the searchable
    /// columns of the effective source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<Xpr>,
    /// Element names excluded from wildcard expansion.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluding: Vec<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub localized: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub distinct: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub count: bool,
    /// Marks an expand subquery whose association leaf is to-one.
    #[serde(default, skip_serializing_if = "is_false")]
    pub one: bool,
    /// Marks a correlated subquery produced from a nested projection.
    #[serde(default, skip_serializing_if = "is_false")]
    pub expand: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl SelectQuery {
    /// A bare `SELECT * from <source>` skeleton.
    pub fn from(from: Source) -> Self {
        SelectQuery {
            from,
            columns: Vec::new(),
            where_clause: None,
            group_by: None,
            having: None,
            order_by: None,
            limit: None,
            search: None,
            excluding: Vec::new(),
            localized: false,
            distinct: false,
            count: false,
            one: false,
            expand: false,
        }
    }
}

/// A query source: a (possibly path-shaped) reference, a join node, or a
/// nested subquery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Source {
    #[serde(rename = "ref")]
    Ref(SourceRef),
    #[serde(rename = "join")]
    Join(Box<JoinSource>),
    #[serde(rename = "SELECT")]
    Select(SubquerySource),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubquerySource {
    pub query: Box<SelectQuery>,
    #[serde(rename = "as", default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    #[serde(rename = "ref")]
    pub ref_: RefExpr,
    #[serde(rename = "as", default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl SourceRef {
    pub fn new(ref_: RefExpr) -> Self {
        SourceRef { ref_, alias: None }
    }

    pub fn aliased(ref_: RefExpr, alias: impl Into<String>) -> Self {
        SourceRef {
            ref_,
            alias: Some(alias.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinKind {
    Left,
    Right,
    Inner,
    Full,
    Cross,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinSource {
    pub kind: JoinKind,
    pub args: Vec<Source>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on: Xpr,
}

/// One step of a path reference: an element (or definition) name with an
/// optional infix filter. Serializes as a bare string when unfiltered,
/// `{id, where}` otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RefStepRepr", into = "RefStepRepr")]
pub struct RefStep {
    pub name: String,
    pub filter: Option<Xpr>,
}

#[derive(Serialize, Deserialize, Clone)]
#[serde(untagged)]
enum RefStepRepr {
    Name(String),
    Full {
        id: String,
        #[serde(rename = "where", default, skip_serializing_if = "Option::is_none")]
        filter: Option<Xpr>,
    },
}

impl From<RefStepRepr> for RefStep {
    fn from(repr: RefStepRepr) -> Self {
        match repr {
            RefStepRepr::Name(name) => RefStep { name, filter: None },
            RefStepRepr::Full { id, filter } => RefStep { name: id, filter },
        }
    }
}

impl From<RefStep> for RefStepRepr {
    fn from(step: RefStep) -> Self {
        match step.filter {
            None => RefStepRepr::Name(step.name),
            Some(filter) => RefStepRepr::Full {
                id: step.name,
                filter: Some(filter),
            },
        }
    }
}

impl RefStep {
    pub fn new(name: impl Into<String>) -> Self {
        RefStep {
            name: name.into(),
            filter: None,
        }
    }

    pub fn filtered(name: impl Into<String>, filter: Xpr) -> Self {
        RefStep {
            name: name.into(),
            filter: Some(filter),
        }
    }
}

/// A path reference.
///
/// `links` is the per-step resolution attachment populated by inference on
/// the working clone of the query. It never appears in serialized form and
/// the caller's input query is never annotated. `join_split`, when set,
/// names the step index that provides the table alias of the flat
/// rendering (the deepest join-materialized association step).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RefExpr {
    pub steps: Vec<RefStep>,
    #[serde(skip)]
    pub links: Vec<RefLink>,
    #[serde(skip)]
    pub join_split: Option<usize>,
}

/// Equality compares the path only; resolution metadata is hidden.
impl PartialEq for RefExpr {
    fn eq(&self, other: &Self) -> bool {
        self.steps == other.steps
    }
}

impl RefExpr {
    pub fn new(steps: Vec<RefStep>) -> Self {
        RefExpr {
            steps,
            links: Vec::new(),
            join_split: None,
        }
    }

    /// Build a reference from a dotted path, e.g. `"author.name"`.
    pub fn parse(path: &str) -> Self {
        RefExpr::new(path.split('.').map(RefStep::new).collect())
    }

    /// Build a reference from pre-split step names.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        RefExpr::new(names.into_iter().map(RefStep::new).collect())
    }

    /// The dotted rendering of the path, used in error messages.
    pub fn path(&self) -> String {
        self.steps
            .iter()
            .map(|s| s.name.as_str())
            .collect::<Vec<_>>()
            .join(".")
    }

    pub fn first_name(&self) -> Option<&str> {
        self.steps.first().map(|s| s.name.as_str())
    }

    pub fn last_name(&self) -> Option<&str> {
        self.steps.last().map(|s| s.name.as_str())
    }

    /// True when the path is rooted in the `$self`/`$projection` token.
    pub fn is_self_root(&self) -> bool {
        matches!(self.first_name(), Some("$self") | Some("$projection"))
    }

    /// The resolution link of the leaf step, if inference ran.
    pub fn leaf_link(&self) -> Option<&RefLink> {
        self.links.last()
    }

    /// Drop all resolution metadata, recursively through step filters.
    /// Used when a resolved reference is cloned into a synthesized
    /// subquery that must re-resolve it in its own scope.
    pub fn strip_links(&mut self) {
        self.links.clear();
        self.join_split = None;
        for step in &mut self.steps {
            if let Some(filter) = &mut step.filter {
                for t in filter.iter_mut() {
                    t.strip_links();
                }
            }
        }
    }
}

/// Per-step resolution metadata attached by the reference resolver.
#[derive(Debug, Clone, PartialEq)]
pub struct RefLink {
    /// What the step resolved to.
    pub definition: ResolvedDef,
    /// The entity in which the following step resolves; `None` for scalar
    /// and structured steps.
    pub target: Option<Arc<Definition>>,
    /// The table alias this step contributes to the flat rendering. For
    /// join-materialized association steps this is the join-tree node
    /// alias; for path roots it is the contributing source alias.
    pub alias: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedDef {
    Entity(Arc<Definition>),
    Element(Arc<ElementDef>),
}

impl ResolvedDef {
    pub fn as_element(&self) -> Option<&Arc<ElementDef>> {
        match self {
            ResolvedDef::Element(e) => Some(e),
            ResolvedDef::Entity(_) => None,
        }
    }

    pub fn as_entity(&self) -> Option<&Arc<Definition>> {
        match self {
            ResolvedDef::Entity(d) => Some(d),
            ResolvedDef::Element(_) => None,
        }
    }
}

/// A scalar literal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

/// An expression node. Doubles as the token of a `where`/`having`/`on`
/// stream, where `Keyword` carries operators and keywords.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    #[serde(rename = "kw")]
    Keyword(String),
    #[serde(rename = "*")]
    Star,
    #[serde(rename = "val")]
    Val(Literal),
    #[serde(rename = "param")]
    Param(String),
    #[serde(rename = "ref")]
    Ref(RefExpr),
    #[serde(rename = "func")]
    Func(FuncCall),
    #[serde(rename = "xpr")]
    Xpr(Xpr),
    #[serde(rename = "SELECT")]
    Select(Box<SelectQuery>),
    #[serde(rename = "list")]
    List(Vec<Expr>),
}

impl Expr {
    pub fn kw(s: impl Into<String>) -> Self {
        Expr::Keyword(s.into())
    }

    pub fn rf(path: &str) -> Self {
        Expr::Ref(RefExpr::parse(path))
    }

    pub fn val(lit: Literal) -> Self {
        Expr::Val(lit)
    }

    pub fn string(s: impl Into<String>) -> Self {
        Expr::Val(Literal::String(s.into()))
    }

    pub fn int(i: i64) -> Self {
        Expr::Val(Literal::Int(i))
    }

    pub fn null() -> Self {
        Expr::Val(Literal::Null)
    }

    pub fn as_ref_expr(&self) -> Option<&RefExpr> {
        match self {
            Expr::Ref(r) => Some(r),
            _ => None,
        }
    }

    pub fn is_keyword(&self, kw: &str) -> bool {
        matches!(self, Expr::Keyword(k) if k.eq_ignore_ascii_case(kw))
    }

    /// Recursively drop resolution metadata (see [`RefExpr::strip_links`]).
    pub fn strip_links(&mut self) {
        match self {
            Expr::Ref(r) => r.strip_links(),
            Expr::Func(f) => {
                for a in &mut f.args {
                    a.strip_links();
                }
            }
            Expr::Xpr(tokens) | Expr::List(tokens) => {
                for t in tokens.iter_mut() {
                    t.strip_links();
                }
            }
            _ => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FuncCall {
    #[serde(rename = "func")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Expr>,
}

/// A projection column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub expr: Expr,
    #[serde(rename = "as", default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cast: Option<String>,
    /// Nested projection over an association or structured element.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expand: Option<Vec<Column>>,
    /// Nested projection over a structured element contributing flat
    /// sibling columns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline: Option<Vec<Column>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluding: Vec<String>,
    /// Decorations carried onto an expand subquery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_by: Option<Vec<OrderItem>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<Limit>,
    #[serde(rename = "where", default, skip_serializing_if = "Option::is_none")]
    pub where_clause: Option<Xpr>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub key: bool,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub annotations: IndexMap<String, Literal>,
}

impl Column {
    pub fn new(expr: Expr) -> Self {
        Column {
            expr,
            alias: None,
            cast: None,
            expand: None,
            inline: None,
            excluding: Vec::new(),
            order_by: None,
            limit: None,
            where_clause: None,
            key: false,
            annotations: IndexMap::new(),
        }
    }

    pub fn star() -> Self {
        Column::new(Expr::Star)
    }

    pub fn ref_(path: &str) -> Self {
        Column::new(Expr::rf(path))
    }

    pub fn aliased(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn expanded(mut self, body: Vec<Column>) -> Self {
        self.expand = Some(body);
        self
    }

    pub fn inlined(mut self, body: Vec<Column>) -> Self {
        self.inline = Some(body);
        self
    }

    pub fn is_star(&self) -> bool {
        matches!(self.expr, Expr::Star)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NullsOrder {
    First,
    Last,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub expr: Expr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<SortOrder>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nulls: Option<NullsOrder>,
}

impl OrderItem {
    pub fn new(expr: Expr) -> Self {
        OrderItem {
            expr,
            sort: None,
            nulls: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Limit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<Literal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<Literal>,
}

/// INSERT and UPSERT share one shape; only `into` is touched by the
/// rewrite (normalized to a single-step reference).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertQuery {
    pub into: SourceRef,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entries: Vec<IndexMap<String, Literal>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateQuery {
    pub entity: SourceRef,
    #[serde(rename = "with", default, skip_serializing_if = "IndexMap::is_empty")]
    pub with_values: IndexMap<String, Expr>,
    #[serde(rename = "where", default, skip_serializing_if = "Option::is_none")]
    pub where_clause: Option<Xpr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteQuery {
    pub from: SourceRef,
    #[serde(rename = "where", default, skip_serializing_if = "Option::is_none")]
    pub where_clause: Option<Xpr>,
}

/// Vestigial kind threaded through the UPDATE/DELETE paths. Pass-through
/// only; no semantics beyond `from`/`where` normalization are guaranteed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamQuery {
    pub from: SourceRef,
    #[serde(rename = "where", default, skip_serializing_if = "Option::is_none")]
    pub where_clause: Option<Xpr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetQuery {
    pub op: String,
    pub args: Vec<Query>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ref_parse_dotted_path() {
        let r = RefExpr::parse("author.address.city");
        assert_eq!(r.steps.len(), 3);
        assert_eq!(r.steps[0].name, "author");
        assert_eq!(r.steps[2].name, "city");
        assert_eq!(r.path(), "author.address.city");
    }

    #[test]
    fn test_strip_links_recurses_into_filters() {
        let mut r = RefExpr::new(vec![RefStep::filtered(
            "books",
            vec![Expr::rf("title"), Expr::kw("="), Expr::string("x")],
        )]);
        r.join_split = Some(0);
        r.strip_links();
        assert!(r.links.is_empty());
        assert_eq!(r.join_split, None);
    }

    #[test]
    fn test_select_serde_round_trip() {
        let sel = SelectQuery {
            columns: vec![Column::ref_("title")],
            where_clause: Some(vec![Expr::rf("stock"), Expr::kw(">"), Expr::int(7)]),
            ..SelectQuery::from(Source::Ref(SourceRef::aliased(
                RefExpr::parse("Books"),
                "Books",
            )))
        };
        let q = Query::select(sel);
        let json = serde_json::to_value(&q).unwrap();
        let back: Query = serde_json::from_value(json).unwrap();
        assert_eq!(back, q);
    }
}

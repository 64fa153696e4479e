//! # CQN - Query Object Notation
//!
//! The query AST consumed and produced by the normalization pipeline.
//! Queries arrive as data (built programmatically or deserialized from
//! JSON), never as text, so there is no parser here.
//!
//! The central type is [`ast::Expr`], a single tagged variant that doubles
//! as the token stream of `where`/`having`/`on` clauses: operators and
//! keywords are `Expr::Keyword` tokens mixed with operand nodes. Rewriting
//! dispatches on the tag, never on string content of operands.

pub mod ast;

pub use ast::{
    Column, DeleteQuery, Expr, FuncCall, InsertQuery, JoinKind, JoinSource, Limit, Literal,
    NullsOrder, OrderItem, Query, RefExpr, RefLink, RefStep, ResolvedDef, SelectQuery, SetQuery,
    SortOrder, Source, SourceRef, StreamQuery, SubquerySource, UpdateQuery, Xpr,
};

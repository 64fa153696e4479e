//! cqnflat - ER-aware query normalization compiler
//!
//! This crate turns a high-level, object-graph shaped query (CQN) written
//! against an entity-relationship model (CSN) into a semantically equivalent
//! flat, SQL-shaped CQN:
//! - Path references resolve to base table columns
//! - Association traversals become left joins or correlated EXISTS subqueries
//! - Structured values decompose into scalar leaves
//! - Nested projections over associations become correlated subqueries
//!
//! The pipeline has two phases: inference (`query_inference`) resolves every
//! name against the model, classifies navigations and builds the join tree;
//! rewriting (`flat_rewrite`) clones the inferred query and rebuilds each
//! clause into the flat form.

pub mod cqn;
pub mod flat_rewrite;
pub mod model_catalog;
pub mod query_inference;

pub use flat_rewrite::{rewrite_query, rewrite_query_with, NormalizedQuery, QueryTarget};
pub use model_catalog::csn_model::CsnModel;

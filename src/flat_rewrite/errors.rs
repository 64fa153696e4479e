use thiserror::Error;

use crate::model_catalog::errors::ModelError;
use crate::query_inference::errors::InferenceError;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RewriteError {
    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error("UNION queries are not supported")]
    UnionNotSupported,

    #[error("cannot compare structured operand \"{path}\" with operator \"{op}\"")]
    UnsupportedStructuralComparison { op: String, path: String },

    #[error("structural comparison of \"{left}\" and \"{right}\" does not match: {unmatched:?}")]
    StructuralShapeMismatch {
        left: String,
        right: String,
        unmatched: Vec<String>,
    },

    #[error("cannot compare structured operand \"{path}\" with a value")]
    CannotCompareStructWithValue { path: String },

    #[error("\"{path}\" in order by expands to {columns} columns, ordering would be ambiguous")]
    AmbiguousOrderBy { path: String, columns: usize },

    #[error("an association (\"{path}\") can't be used as a value in an expression")]
    AssocInExpression { path: String },

    #[error("a structured element (\"{path}\") can't be used as a value in an expression")]
    StructInExpression { path: String },

    #[error("the projection is empty after excluding virtual elements")]
    EmptyProjection,

    #[error("cannot resolve the backlink of \"{path}\"")]
    UnresolvableBacklink { path: String },
}

impl From<ModelError> for RewriteError {
    fn from(err: ModelError) -> Self {
        RewriteError::Inference(err.into())
    }
}

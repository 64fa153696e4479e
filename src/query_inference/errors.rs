use thiserror::Error;

use crate::model_catalog::errors::ModelError;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum InferenceError {
    #[error("\"{path}\" not found in {context}")]
    UnknownName { path: String, context: String },

    #[error("ambiguous reference \"{name}\", write one of {alternatives:?} instead")]
    AmbiguousName {
        name: String,
        alternatives: Vec<String>,
    },

    #[error("a filter can only be applied to an association, but \"{path}\" is not one")]
    FilterOnNonAssoc { path: String },

    #[error("unexpected unmanaged association \"{path}\" in infix filter")]
    UnmanagedInInfixFilter { path: String },

    #[error("only foreign keys of \"{assoc}\" can be accessed in an infix filter, but found \"{path}\"")]
    NonFkInInfixFilter { assoc: String, path: String },

    #[error("a filter without navigation is not allowed at \"{path}\"")]
    FilterWithoutNavigation { path: String },

    #[error("duplicate alias \"{alias}\" in from clause")]
    DuplicateAlias { alias: String },

    #[error("duplicate definition of element \"{name}\"")]
    DuplicateElement { name: String },

    #[error("ambiguous wildcard: \"{name}\" is contributed by multiple sources, write one of {alternatives:?} instead")]
    AmbiguousWildcard {
        name: String,
        alternatives: Vec<String>,
    },

    #[error("expecting \"as\" alias for expression or value column \"{hint}\"")]
    ExpectingAlias { hint: String },

    /// A correlated reference into an enclosing query may not navigate
    /// associations beyond their foreign keys.
    #[error("correlated reference \"{path}\" must not navigate past foreign keys")]
    CorrelatedNavigation { path: String },

    #[error(transparent)]
    Model(#[from] ModelError),
}

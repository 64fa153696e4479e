use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ModelError {
    #[error("\"{0}\" not found in the model")]
    UnknownDefinition(String),

    #[error("association \"{0}\" targets unknown definition \"{1}\"")]
    UnknownTarget(String, String),

    #[error("invalid model: {0}")]
    InvalidModel(String),
}

use thiserror::Error;

pub type OptimizerResult<T> = Result<T, OptimizerError>;

#[derive(Error, Debug)]
pub enum OptimizerError {
    #[error("Insufficient data: need at least {required} qualifying samples, got {actual}")]
    InsufficientData { required: usize, actual: usize },

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Safety boundary violation: {0}")]
    BoundaryViolation(String),

    #[error("Apply failure: {0}")]
    ApplyFailure(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid status transition: {0}")]
    InvalidTransition(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

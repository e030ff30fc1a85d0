use thiserror::Error;

#[derive(Debug, Error)]
pub enum AiError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] crate::learner::CheckpointError),

    #[error("internal error: {0}")]
    Internal(String),
}

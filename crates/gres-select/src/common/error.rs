use thiserror::Error;

#[derive(Debug, Error)]
pub enum SelectError {
    #[error("insufficient CPUs to satisfy the GRES request")]
    InsufficientCpus,
    #[error("insufficient memory to satisfy the GRES request")]
    InsufficientMemory,
    #[error("insufficient GRES available on the node")]
    InsufficientCount,
    #[error("invalid GRES request: {0}")]
    InvalidGres(String),
    #[error("no node available to satisfy the gres-per-job counter")]
    NodeNotAvailable,
    #[error("task layout unavailable: {0}")]
    InvalidTaskLayout(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<String> for SelectError {
    fn from(e: String) -> Self {
        Self::Internal(e)
    }
}

impl From<&str> for SelectError {
    fn from(e: &str) -> Self {
        Self::Internal(e.to_string())
    }
}

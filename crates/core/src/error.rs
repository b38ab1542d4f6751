use thiserror::Error;

#[derive(Error, Debug)]
pub enum LabnavError {
    #[error("invalid query: {0}")]
    Validation(String),
    #[error("retrieval unavailable: {0}")]
    RetrievalUnavailable(String),
    #[error("invalid privacy budget: {0}")]
    InvalidBudget(String),
    #[error("invalid privacy config: {0}")]
    InvalidPrivacyConfig(String),
    #[error("corrupt cache record {fingerprint}: {reason}")]
    CacheCorruption { fingerprint: String, reason: String },
    #[error("embedding dimension mismatch: {left} vs {right}")]
    DimensionMismatch { left: usize, right: usize },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde json error: {0}")]
    SerdeJson(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, LabnavError>;

impl LabnavError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn storage(err: impl ToString) -> Self {
        Self::Storage(err.to_string())
    }

    /// Errors that must stop the service from taking traffic.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LabnavError::InvalidBudget(_) | LabnavError::InvalidPrivacyConfig(_)
        )
    }
}

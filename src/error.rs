//! Error types for CertChain

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    /// Structural validation failure: bad index, broken linkage or hash mismatch.
    InvalidBlock(String),
    InsufficientCredits { available: usize, required: usize },
    InsufficientTokens { available: usize, required: usize },
    AlreadySpent(String),
    TokenNotFound(String),
    EmptyPendingBuffer,
    NetworkError(String),
    PersistenceError(String),
    IoError(String),
    SerializationError(String),
    InvalidInput(String),
}

impl ChainError {
    /// Business-rule failures the caller is expected to react to, as opposed
    /// to infrastructure failures.
    pub fn is_business_rule(&self) -> bool {
        matches!(
            self,
            ChainError::InsufficientCredits { .. }
                | ChainError::InsufficientTokens { .. }
                | ChainError::AlreadySpent(_)
        )
    }
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ChainError::InvalidBlock(msg) => write!(f, "Invalid block: {}", msg),
            ChainError::InsufficientCredits { available, required } => write!(
                f,
                "Insufficient credits: {} available, {} required",
                available, required
            ),
            ChainError::InsufficientTokens { available, required } => write!(
                f,
                "Insufficient tokens: {} available, {} required",
                available, required
            ),
            ChainError::AlreadySpent(token_id) => write!(f, "Token already spent: {}", token_id),
            ChainError::TokenNotFound(token_id) => write!(f, "Token not found: {}", token_id),
            ChainError::EmptyPendingBuffer => write!(f, "No pending entries to seal"),
            ChainError::NetworkError(msg) => write!(f, "Network error: {}", msg),
            ChainError::PersistenceError(msg) => write!(f, "Persistence error: {}", msg),
            ChainError::IoError(msg) => write!(f, "IO error: {}", msg),
            ChainError::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
            ChainError::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
        }
    }
}

impl std::error::Error for ChainError {}

impl From<std::io::Error> for ChainError {
    fn from(err: std::io::Error) -> Self {
        ChainError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for ChainError {
    fn from(err: serde_json::Error) -> Self {
        ChainError::SerializationError(err.to_string())
    }
}

impl From<rusqlite::Error> for ChainError {
    fn from(err: rusqlite::Error) -> Self {
        ChainError::PersistenceError(err.to_string())
    }
}

impl From<reqwest::Error> for ChainError {
    fn from(err: reqwest::Error) -> Self {
        ChainError::NetworkError(err.to_string())
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, ChainError>;

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("transient store error: {0}")]
    Transient(String),
    #[error("malformed record {token}: {reason}")]
    MalformedRecord { token: String, reason: String },
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),
    #[error("record {0} already exists")]
    RecordExists(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("invalid cursor: {0}")]
    InvalidCursor(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl PipelineError {
    pub fn malformed(token: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedRecord {
            token: token.into(),
            reason: reason.into(),
        }
    }

    /// Errors worth retrying with backoff. Everything else either cannot
    /// succeed on retry or must not be retried automatically.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn is_permanent_record(&self) -> bool {
        matches!(self, Self::MalformedRecord { .. })
    }
}

impl From<rocksdb::Error> for PipelineError {
    fn from(err: rocksdb::Error) -> Self {
        match err.kind() {
            rocksdb::ErrorKind::Busy
            | rocksdb::ErrorKind::TryAgain
            | rocksdb::ErrorKind::TimedOut
            | rocksdb::ErrorKind::Incomplete => Self::Transient(err.to_string()),
            _ => Self::Storage(err.to_string()),
        }
    }
}

impl From<toml::de::Error> for PipelineError {
    fn from(err: toml::de::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::ser::Error> for PipelineError {
    fn from(err: toml::ser::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_transient_and_permanent() {
        assert!(PipelineError::Transient("throttled".into()).is_transient());
        assert!(!PipelineError::Storage("corrupt".into()).is_transient());

        let malformed = PipelineError::malformed("A1#V1", "unitprice missing");
        assert!(malformed.is_permanent_record());
        assert!(!malformed.is_transient());
        assert_eq!(
            malformed.to_string(),
            "malformed record A1#V1: unitprice missing"
        );
    }
}

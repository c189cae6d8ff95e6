use thiserror::Error;

/// A time window whose start lies after its end.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid range: from ({from}) is after to ({to})")]
pub struct InvalidRangeError {
    pub from: i64,
    pub to: i64,
}

/// A filter specification that could not be parsed.
///
/// `clause` holds the offending fragment of the input text so the caller can
/// point at it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed filter clause '{clause}': {reason}")]
pub struct FilterParseError {
    pub clause: String,
    pub reason: String,
}

impl FilterParseError {
    pub fn new(clause: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            clause: clause.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to open storage: {0}")]
    Open(String),
    #[error("failed to write: {0}")]
    Write(String),
    #[error("failed to read: {0}")]
    Read(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// A `TransactionId` string that does not follow `agentId^startTime^sequence`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transaction id '{0}'")]
pub struct TransactionIdParseError(pub String);

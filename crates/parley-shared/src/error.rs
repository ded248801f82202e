use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("Unknown message kind: {0}")]
    UnknownMessageKind(String),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(i64),
}

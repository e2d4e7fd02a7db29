use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MetaError>;

/// Errors surfaced by the metadata engine.
///
/// `Backend`/`BackendUnavailable` are split deliberately: a permanent backend
/// failure halts the volume unconditionally, while a transient one lets the
/// catch-up path on a slave return a partial count instead of failing.
#[derive(Debug, Error)]
pub enum MetaError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("corruption detected: {0}")]
    Corruption(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("permanent backend error: {0}")]
    Backend(String),
    #[error("backend temporarily unavailable: {0}")]
    BackendUnavailable(String),
    #[error("namespace owner mismatch: expected {expected}, found {found}")]
    OwnerTagMismatch { expected: String, found: String },
    #[error("tlog is missing its final CRC entry")]
    TLogWithoutFinalCRC,
    #[error("volume is halted after a prior fatal error")]
    Halted,
}

impl MetaError {
    /// True for errors that should halt the volume rather than be retried.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, MetaError::BackendUnavailable(_))
    }
}

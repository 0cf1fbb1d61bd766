//! Error types for dosguard.

use thiserror::Error;

/// A malformed threshold (or duration) expression.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid threshold token '{token}': {message}")]
pub struct ParseError {
    /// The part of the expression that could not be understood
    pub token: String,
    /// What was expected instead
    pub message: String,
}

impl ParseError {
    pub(crate) fn new(token: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            message: message.into(),
        }
    }
}

/// Failures raised by rule stores and audit sinks.
#[derive(Error, Debug)]
pub enum PersistenceError {
    /// File access failed
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The rule file could not be encoded or decoded
    #[error("rule file error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// An audit record could not be encoded
    #[error("audit encoding error: {0}")]
    Json(#[from] serde_json::Error),

    /// The backing store refused the operation
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Failures to hand a task to a [`TaskExecutor`](crate::executor::TaskExecutor).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    /// The queue is full; the task was dropped
    #[error("task queue is full")]
    Saturated,

    /// The executor has shut down
    #[error("executor is closed")]
    Closed,
}

/// Main error type for dosguard operations.
#[derive(Error, Debug)]
pub enum DosError {
    /// Malformed threshold expression
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Malformed rule registration
    #[error("invalid rule: {0}")]
    InvalidRule(String),

    /// Rule or audit persistence failed
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Asynchronous work could not be scheduled
    #[error("submit error: {0}")]
    Submit(#[from] SubmitError),

    /// Configuration-related errors
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for dosguard operations.
pub type Result<T> = std::result::Result<T, DosError>;

/// Receives failures that cannot be returned to a caller, such as a failed
/// audit write on a background worker.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, error: &DosError);
}

/// Reports errors through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, error: &DosError) {
        tracing::error!(error = %error, "Background operation failed");
    }
}

//! Error types for the unmasking experiment engine

use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, UnmaskingError>;

/// Errors that can occur while running unmasking experiments
#[derive(Error, Debug)]
pub enum UnmaskingError {
    /// Invalid or missing job configuration (raised before any worker is dispatched)
    #[error("configuration error: {0}")]
    Config(String),

    /// Event bus failure (bad bridge state, publish after shutdown)
    #[error("event bus error: {0}")]
    Bus(String),

    /// An event of the wrong type was delivered to a handler
    #[error("unexpected event type: {0}")]
    EventType(String),

    /// Classifier fitting or cross-validation failed on degenerate data
    #[error("classifier error: {0}")]
    Classifier(String),

    /// Aggregation invariant violated (e.g. class mismatch within a bucket)
    #[error("aggregation error: {0}")]
    Aggregation(String),

    /// A worker task panicked or could not be joined
    #[error("worker task failed: {0}")]
    Task(String),

    /// Corpus streaming failed
    #[error("corpus error: {0}")]
    Corpus(String),

    /// Filesystem error while persisting results
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The user requested cooperative shutdown
    #[error("interrupted by user")]
    Interrupted,
}

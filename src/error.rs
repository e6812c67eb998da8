//! Error types for the anomaly detection engine.

use thiserror::Error;

/// Result type alias for detection operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for anomaly detection operations
#[derive(Debug, Error)]
pub enum Error {
    /// Input does not meet a detector's minimum sample-size precondition.
    /// Routine condition, converted to an empty result at the system boundary.
    #[error("Insufficient data: got {actual} points, need {required}")]
    InsufficientData { required: usize, actual: usize },

    /// Sequence model detect() called before train()
    #[error("Model not trained: call train() before detect()")]
    ModelNotTrained,

    /// Configuration error
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Detector runtime failure
    #[error("Detection error: {0}")]
    Detection(String),

    /// Storage backend error
    #[error("Storage error: {0}")]
    Storage(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Convenience constructor for the insufficient-data precondition
    pub fn insufficient(required: usize, actual: usize) -> Self {
        Error::InsufficientData { required, actual }
    }
}

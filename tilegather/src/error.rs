//! Error types for tilegather

use thiserror::Error;

/// Result type alias using tilegather's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for tilegather operations.
///
/// All failures here are detected eagerly, before any rank thread or
/// stream work is issued. Once a fused call is in flight the only
/// failure mode left is a flag that never arrives, which hangs the
/// call (a crash-free rank set is assumed for the duration of a call).
#[derive(Error, Debug)]
pub enum Error {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Invalid shape: {0}")]
    InvalidShape(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

//! Error types for the compute core.

use thiserror::Error;

/// Errors raised while building or running the pipeline.
///
/// Build-time variants name the offending tensor, buffer or kernel; run-time
/// variants name the failing phase.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid shape {shape:?}: {reason}")]
    InvalidShape { shape: Vec<usize>, reason: String },

    #[error("invalid reshape from {from:?} to {to:?}: {reason}")]
    Reshape {
        from: Vec<usize>,
        to: Vec<usize>,
        reason: String,
    },

    #[error("invalid axes {axes:?} over shape {shape:?}")]
    Index { axes: Vec<usize>, shape: Vec<usize> },

    #[error("index {index:?} out of bounds for shape {shape:?}")]
    Bounds { index: Vec<usize>, shape: Vec<usize> },

    #[error("size mismatch on '{label}': expected {expected} elements, got {actual}")]
    SizeMismatch {
        label: String,
        expected: usize,
        actual: usize,
    },

    #[error("tensor '{tensor}' has shape {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        tensor: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("required tensor '{0}' is missing")]
    MissingTensor(String),

    #[error("tensor '{tensor}' has unsupported dtype '{dtype}' (only float32 is supported)")]
    UnsupportedDtype { tensor: String, dtype: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to create kernel program '{kernel}': {log}\n--- source ---\n{source_text}")]
    KernelCompile {
        kernel: String,
        source_text: String,
        log: String,
    },

    #[error("Failed to create kernel program for phase '{phase}': {reason}")]
    KernelBinding { phase: String, reason: String },

    #[error("phase '{phase}' failed: {reason}")]
    PhaseFailed { phase: String, reason: String },

    #[error("no buffer named '{0}'")]
    UnknownBuffer(String),

    #[error("compute device lost: {0}")]
    DeviceLost(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for compute core operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

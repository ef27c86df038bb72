//! # Vocana Error Types
//!
//! Typed errors for the streaming pipeline. Every runtime condition is
//! recoverable at frame or stream level; only configuration problems found at
//! construction are fatal.

use thiserror::Error;

/// Vocana library error type
///
/// Each variant carries enough context to log a useful line without the
/// caller re-deriving what went wrong.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VocanaError {
    // === Configuration Errors (1xx) ===
    /// A configuration field failed validation
    #[error("Invalid configuration: {field} = '{value}' - {reason}")]
    InvalidConfiguration {
        field: String,
        value: String,
        reason: String,
    },

    /// The generated analysis window contains NaN or infinity
    #[error("Analysis window is not finite at index {index}")]
    NonFiniteWindow { index: usize },

    // === Shape / Input Errors (2xx) ===
    /// Data of the wrong length reached a transform or inference stage
    #[error("Shape mismatch in {context}: expected {expected}, got {got}")]
    ShapeMismatch {
        context: String,
        expected: String,
        got: String,
    },

    /// Non-finite or malformed sample/feature data
    #[error("Input validation failed: {reason}")]
    InputValidation { reason: String },

    // === Buffer Errors (3xx) ===
    /// Buffer capacity would be exceeded by an append
    #[error("Buffer overflow: projected {projected} samples exceeds capacity {capacity}")]
    Overflow { projected: usize, capacity: usize },

    /// A bounded hand-off queue is full
    #[error("Hand-off queue full (capacity {capacity})")]
    Backpressure { capacity: usize },

    /// The stream has been torn down
    #[error("Stream is closed")]
    StreamClosed,

    // === Inference Errors (4xx) ===
    /// The inference backend failed or returned malformed tensors
    #[error("Inference stage '{stage}' failed: {reason}")]
    InferenceRuntime { stage: String, reason: String },

    /// The inference call did not complete within its deadline or the queue was saturated
    #[error("Inference stage '{stage}' exhausted its budget of {timeout_ms}ms")]
    ResourceExhausted { stage: String, timeout_ms: u64 },

    /// An in-flight call was interrupted by stream teardown
    #[error("Inference call cancelled")]
    Cancelled,

    // === IO Errors (5xx) ===
    /// File read/write error
    #[error("IO error on '{path}': {reason}")]
    Io { path: String, reason: String },
}

impl VocanaError {
    /// Get stable numeric error code
    pub fn code(&self) -> i32 {
        match self {
            // Configuration (1xx)
            Self::InvalidConfiguration { .. } => 101,
            Self::NonFiniteWindow { .. } => 102,

            // Shape / input (2xx)
            Self::ShapeMismatch { .. } => 201,
            Self::InputValidation { .. } => 202,

            // Buffer (3xx)
            Self::Overflow { .. } => 301,
            Self::Backpressure { .. } => 302,
            Self::StreamClosed => 303,

            // Inference (4xx)
            Self::InferenceRuntime { .. } => 401,
            Self::ResourceExhausted { .. } => 402,
            Self::Cancelled => 403,

            // IO (5xx)
            Self::Io { .. } => 501,
        }
    }

    /// Check if error is recoverable at frame or stream level
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Self::InvalidConfiguration { .. } | Self::NonFiniteWindow { .. } | Self::StreamClosed
        )
    }

    /// Whether the inference orchestrator should degrade to pass-through for this error
    pub fn is_inference_fallback(&self) -> bool {
        matches!(
            self,
            Self::InferenceRuntime { .. }
                | Self::ResourceExhausted { .. }
                | Self::ShapeMismatch { .. }
                | Self::Cancelled
        )
    }

    pub(crate) fn config(field: &str, value: impl ToString, reason: &str) -> Self {
        Self::InvalidConfiguration {
            field: field.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn shape(context: &str, expected: impl ToString, got: impl ToString) -> Self {
        Self::ShapeMismatch {
            context: context.to_string(),
            expected: expected.to_string(),
            got: got.to_string(),
        }
    }

    pub(crate) fn runtime(stage: &str, reason: impl ToString) -> Self {
        Self::InferenceRuntime {
            stage: stage.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<std::io::Error> for VocanaError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            path: String::new(),
            reason: err.to_string(),
        }
    }
}

/// Result type alias using VocanaError
pub type Result<T> = std::result::Result<T, VocanaError>;

//! Error types for specbatch

use crate::types::Phase;
use thiserror::Error;

/// Result type alias for specbatch operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for specbatch
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration or request, detected before any executor call
    #[error("Configuration error: {0}")]
    Config(String),

    /// No accelerator device is reachable
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    /// An executor call failed or produced unusable output
    #[error("Execution failed during {phase}: {message}")]
    Execution {
        /// Phase in which the failure happened
        phase: Phase,
        /// Description of the failure
        message: String,
    },

    /// A decode-loop invariant no longer holds
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Shape mismatch
    #[error("Shape mismatch for {buffer}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Name of the offending buffer
        buffer: String,
        /// Expected dimensions
        expected: Vec<usize>,
        /// Actual dimensions
        actual: Vec<usize>,
    },

    /// A named buffer was absent from a tensor map
    #[error("Missing buffer: {0}")]
    MissingBuffer(String),

    /// Tensor operation error
    #[error("Tensor operation error: {0}")]
    Tensor(String),

    /// File I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other error with context
    #[error("{context}: {source}")]
    WithContext {
        /// What was being done
        context: String,
        /// Underlying error
        source: Box<Error>,
    },
}

impl Error {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Error::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create an execution error for the given phase
    pub fn execution(phase: Phase, msg: impl Into<String>) -> Self {
        Error::Execution {
            phase,
            message: msg.into(),
        }
    }

    /// Create an invariant violation
    pub fn invariant(msg: impl Into<String>) -> Self {
        Error::InvariantViolation(msg.into())
    }

    /// Tag a low-level failure with the phase it happened in.
    ///
    /// Configuration, device, invariant and already-tagged execution errors
    /// pass through untouched; everything else becomes [`Error::Execution`].
    pub fn in_phase(self, phase: Phase) -> Self {
        match self {
            Error::Config(_)
            | Error::DeviceUnavailable(_)
            | Error::InvariantViolation(_)
            | Error::Execution { .. } => self,
            Error::WithContext { context, source } => Error::WithContext {
                context,
                source: Box::new(source.in_phase(phase)),
            },
            other => Error::Execution {
                phase,
                message: other.to_string(),
            },
        }
    }

    /// Phase that failed, if this is an execution failure
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Error::Execution { phase, .. } => Some(*phase),
            Error::WithContext { source, .. } => source.phase(),
            _ => None,
        }
    }

    /// Check if this is a configuration error
    pub fn is_config(&self) -> bool {
        match self {
            Error::Config(_) => true,
            Error::WithContext { source, .. } => source.is_config(),
            _ => false,
        }
    }

    /// Check if this is an invariant violation
    pub fn is_invariant_violation(&self) -> bool {
        match self {
            Error::InvariantViolation(_) => true,
            Error::WithContext { source, .. } => source.is_invariant_violation(),
            _ => false,
        }
    }
}

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add lazy context to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;

    /// Tag an error result with the phase it happened in
    fn in_phase(self, phase: Phase) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }

    fn in_phase(self, phase: Phase) -> Result<T> {
        self.map_err(|e| e.in_phase(phase))
    }
}

//! Error types for the Forge governance engine.
//!
//! Every fallible governance operation returns a tagged failure rather than
//! panicking. The tag returned by [`Error::code`] is stable and safe to
//! surface to dashboards and logs.

use thiserror::Error;

use crate::validation::ValidationError;

/// Result type alias using the Forge error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for Forge governance components.
#[derive(Error, Debug)]
pub enum Error {
    /// Too many executions in the trailing rate window
    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    /// Structural validation failed; prior state is untouched
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Alignment collaborator reported the action as off-mission
    #[error("Alignment check failed: {0}")]
    Alignment(String),

    /// Action text matched a dangerous-operation pattern
    #[error("Safety check failed: {0}")]
    SafetyCheckFailed(String),

    /// No rollback snapshot recorded for the action
    #[error("No rollback snapshot for action {0}")]
    NoSnapshot(String),

    /// Rollback replay failed
    #[error("Rollback failed: {0}")]
    Rollback(String),

    /// Project state update rejected
    #[error("State update failed: {0}")]
    StateUpdate(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation not permitted in the entity's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Persistence collaborator failure
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Create an error with additional context.
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Stable tag for this failure.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited(_) => "RATE_LIMIT",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Alignment(_) => "ALIGNMENT_ERROR",
            Self::SafetyCheckFailed(_) => "SAFETY_CHECK_FAILED",
            Self::NoSnapshot(_) => "NO_SNAPSHOT",
            Self::Rollback(_) => "ROLLBACK_ERROR",
            Self::StateUpdate(_) => "STATE_UPDATE_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::InvalidState(_) => "INVALID_STATE",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Persistence(_) => "PERSISTENCE_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::WithContext { source, .. } => source.code(),
        }
    }

    /// Check if this is a rate limit error.
    pub fn is_rate_limited(&self) -> bool {
        self.code() == "RATE_LIMIT"
    }

    /// Check if this is a validation error.
    pub fn is_validation(&self) -> bool {
        self.code() == "VALIDATION_ERROR"
    }

    /// Check if the action was refused by a safety or alignment gate.
    pub fn is_safety_rejection(&self) -> bool {
        matches!(self.code(), "SAFETY_CHECK_FAILED" | "ALIGNMENT_ERROR")
    }
}

/// Extension trait for adding context to any error type.
pub trait ResultExt<T> {
    /// Add context to an error.
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(context))
    }
}

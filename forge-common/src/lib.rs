//! Forge Common - shared error taxonomy, validation, configuration, and
//! logging for the Forge automation governance engine.
//!
//! This crate provides:
//! - The tagged error type returned by every governance operation
//! - Validation primitives for entities and configuration
//! - Configuration types and loading with environment overrides
//! - Logging setup and trace id helpers
//! - The shared governance vocabulary (action kinds, impact, automation levels)

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod logging;
pub mod types;
pub mod validation;

pub use config::{
    ActivityConfig, ApprovalConfig, AutomationConfig, GovernanceConfig, ObservabilityConfig,
    RuleConfig, StateConfig,
};
pub use error::{Error, Result, ResultExt};
pub use types::{ActionKind, AutomationLevel, ConfidenceBand, ConfidenceThresholds, Impact};
pub use validation::{Validate, ValidationError, ValidationResult, Validator};

/// Re-export commonly used types for convenience
pub mod prelude {
    pub use crate::config::GovernanceConfig;
    pub use crate::error::{Error, Result, ResultExt};
    pub use crate::logging::init_logging;
    pub use crate::types::{ActionKind, AutomationLevel, ConfidenceThresholds, Impact};
    pub use crate::validation::{Validate, ValidationError, Validator};
}

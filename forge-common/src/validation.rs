//! Validation primitives shared by configuration and runtime entities.
//!
//! Governance entities (actions, thresholds, project state snapshots) and
//! configuration sections implement [`Validate`]. Failures are collected so
//! callers see every problem at once.

use thiserror::Error;

/// Validation error.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("{field} = {value} is outside [{min}, {max}]")]
    OutOfRange {
        field: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Conflict: {reason}")]
    Conflict { reason: String },

    #[error("Multiple validation errors: {0:?}")]
    Multiple(Vec<ValidationError>),
}

impl ValidationError {
    /// Name of the offending field, if the error concerns a single field.
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::MissingField { field }
            | Self::InvalidValue { field, .. }
            | Self::OutOfRange { field, .. } => Some(field),
            Self::Conflict { .. } | Self::Multiple(_) => None,
        }
    }
}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Trait for validatable values.
pub trait Validate {
    /// Validate this value.
    fn validate(&self) -> ValidationResult<()>;
}

/// Accumulates validation failures.
#[derive(Debug, Default)]
pub struct Validator {
    errors: Vec<ValidationError>,
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require a non-blank string.
    pub fn require(&mut self, field: &str, value: &str) -> &mut Self {
        if value.trim().is_empty() {
            self.errors.push(ValidationError::MissingField {
                field: field.to_string(),
            });
        }
        self
    }

    /// Require a finite value within `[min, max]`.
    pub fn in_range(&mut self, field: &str, value: f64, min: f64, max: f64) -> &mut Self {
        if !value.is_finite() || value < min || value > max {
            self.errors.push(ValidationError::OutOfRange {
                field: field.to_string(),
                value,
                min,
                max,
            });
        }
        self
    }

    /// Record a failure when `condition` is false.
    pub fn check(&mut self, condition: bool, field: &str, reason: impl Into<String>) -> &mut Self {
        if !condition {
            self.errors.push(ValidationError::InvalidValue {
                field: field.to_string(),
                reason: reason.into(),
            });
        }
        self
    }

    /// Merge the outcome of a nested validation.
    pub fn nested(&mut self, result: ValidationResult<()>) -> &mut Self {
        if let Err(e) = result {
            self.errors.push(e);
        }
        self
    }

    pub fn push(&mut self, error: ValidationError) -> &mut Self {
        self.errors.push(error);
        self
    }

    /// Collapse the accumulated failures into a single result.
    pub fn finish(&mut self) -> ValidationResult<()> {
        let mut errors = std::mem::take(&mut self.errors);
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ValidationError::Multiple(errors)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validator_collects_errors() {
        let result = Validator::new()
            .require("id", "")
            .in_range("confidence", 1.5, 0.0, 1.0)
            .finish();

        match result {
            Err(ValidationError::Multiple(errors)) => {
                assert_eq!(errors.len(), 2);
                assert_eq!(errors[0].field(), Some("id"));
                assert_eq!(errors[1].field(), Some("confidence"));
            }
            other => panic!("expected multiple errors, got {:?}", other),
        }
    }

    #[test]
    fn test_validator_single_error_unwrapped() {
        let result = Validator::new().in_range("progress", 150.0, 0.0, 100.0).finish();
        assert!(matches!(result, Err(ValidationError::OutOfRange { .. })));
    }

    #[test]
    fn test_nan_is_out_of_range() {
        assert!(Validator::new()
            .in_range("confidence", f64::NAN, 0.0, 1.0)
            .finish()
            .is_err());
    }

    #[test]
    fn test_validator_passes() {
        assert!(Validator::new()
            .require("title", "Fix flaky test")
            .in_range("confidence", 1.0, 0.0, 1.0)
            .check(true, "impact", "unused")
            .finish()
            .is_ok());
    }
}

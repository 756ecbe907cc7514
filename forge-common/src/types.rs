//! Shared governance vocabulary: action kinds, impact, automation levels.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::validation::{Validate, ValidationError, ValidationResult, Validator};

/// Kind of work an automated action performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Fix,
    Optimize,
    Refactor,
    Update,
    Deploy,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Fix => "fix",
            ActionKind::Optimize => "optimize",
            ActionKind::Refactor => "refactor",
            ActionKind::Update => "update",
            ActionKind::Deploy => "deploy",
        }
    }

    /// Estimated human minutes saved when an action of this kind completes.
    pub fn estimated_minutes_saved(&self) -> f64 {
        match self {
            ActionKind::Fix => 15.0,
            ActionKind::Optimize => 30.0,
            ActionKind::Refactor => 45.0,
            ActionKind::Update => 10.0,
            ActionKind::Deploy => 20.0,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Blast radius of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Impact {
    Low,
    Medium,
    High,
}

impl Impact {
    pub fn as_str(&self) -> &'static str {
        match self {
            Impact::Low => "low",
            Impact::Medium => "medium",
            Impact::High => "high",
        }
    }
}

impl Default for Impact {
    fn default() -> Self {
        Impact::Medium
    }
}

impl fmt::Display for Impact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named automation profile selecting a set of confidence thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutomationLevel {
    Conservative,
    Balanced,
    Aggressive,
    Maximum,
}

impl AutomationLevel {
    pub const ALL: [AutomationLevel; 4] = [
        AutomationLevel::Conservative,
        AutomationLevel::Balanced,
        AutomationLevel::Aggressive,
        AutomationLevel::Maximum,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AutomationLevel::Conservative => "conservative",
            AutomationLevel::Balanced => "balanced",
            AutomationLevel::Aggressive => "aggressive",
            AutomationLevel::Maximum => "maximum",
        }
    }

    /// Default thresholds for this level. These are starting points, not a
    /// calibrated safety boundary.
    pub fn default_thresholds(&self) -> ConfidenceThresholds {
        match self {
            AutomationLevel::Conservative => ConfidenceThresholds::new(0.70, 0.85, 0.95),
            AutomationLevel::Balanced => ConfidenceThresholds::new(0.50, 0.70, 0.85),
            AutomationLevel::Aggressive => ConfidenceThresholds::new(0.30, 0.50, 0.70),
            AutomationLevel::Maximum => ConfidenceThresholds::new(0.10, 0.30, 0.50),
        }
    }
}

impl Default for AutomationLevel {
    fn default() -> Self {
        AutomationLevel::Balanced
    }
}

impl fmt::Display for AutomationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AutomationLevel {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "conservative" => Ok(AutomationLevel::Conservative),
            "balanced" => Ok(AutomationLevel::Balanced),
            "aggressive" => Ok(AutomationLevel::Aggressive),
            "maximum" => Ok(AutomationLevel::Maximum),
            other => Err(ValidationError::InvalidValue {
                field: "automation.level".into(),
                reason: format!("unknown automation level '{}'", other),
            }),
        }
    }
}

/// The three confidence cut points of an automation level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceThresholds {
    /// Below this the action is skipped outright
    pub minimum: f64,
    /// At or above this the action may run without confirmation
    pub caution: f64,
    /// At or above this the engine considers the action high-confidence
    pub confident: f64,
}

impl ConfidenceThresholds {
    pub const fn new(minimum: f64, caution: f64, confident: f64) -> Self {
        Self {
            minimum,
            caution,
            confident,
        }
    }

    /// Band a confidence value falls into.
    pub fn classify(&self, confidence: f64) -> ConfidenceBand {
        if confidence < self.minimum {
            ConfidenceBand::BelowMinimum
        } else if confidence < self.caution {
            ConfidenceBand::NeedsConfirmation
        } else if confidence < self.confident {
            ConfidenceBand::Cautious
        } else {
            ConfidenceBand::Confident
        }
    }
}

impl Validate for ConfidenceThresholds {
    fn validate(&self) -> ValidationResult<()> {
        Validator::new()
            .in_range("thresholds.minimum", self.minimum, 0.0, 1.0)
            .in_range("thresholds.caution", self.caution, 0.0, 1.0)
            .in_range("thresholds.confident", self.confident, 0.0, 1.0)
            .check(
                self.minimum < self.caution && self.caution < self.confident,
                "thresholds",
                format!(
                    "must satisfy minimum < caution < confident (got {} / {} / {})",
                    self.minimum, self.caution, self.confident
                ),
            )
            .finish()
    }
}

/// Confidence band relative to a threshold set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceBand {
    BelowMinimum,
    NeedsConfirmation,
    Cautious,
    Confident,
}

//! Configuration for the Forge governance engine.
//!
//! The engine reads a single JSON document at `~/.forge/governance.json`.
//! Every field is optional and falls back to the documented default.
//!
//! # Configuration Priority
//!
//! 1. Environment variables (FORGE_* prefix)
//! 2. Explicit config file values
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! - `FORGE_AUTOMATION_LEVEL` → automation.level
//! - `FORGE_MAX_ACTIONS_PER_MINUTE` → automation.max_actions_per_minute
//! - `FORGE_ROLLBACK_ENABLED` → automation.rollback_enabled
//! - `FORGE_SAFETY_CHECKS_ENABLED` → automation.safety_checks_enabled
//! - `FORGE_DRY_RUN` → automation.dry_run
//! - `FORGE_APPROVAL_TIMEOUT_MINUTES` → approval.default_timeout_minutes
//! - `FORGE_ACTIVITY_HISTORY_CAP` → activity.history_cap
//! - `FORGE_ACTIVITY_STREAM_BUFFER` → activity.stream_buffer_size
//! - `FORGE_LOG_LEVEL` → observability.log_level
//! - `FORGE_LOG_FORMAT` → observability.log_format

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::types::{ActionKind, AutomationLevel, ConfidenceThresholds, Impact};
use crate::validation::{Validate, ValidationError, ValidationResult, Validator};

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".forge"),
        |dirs| dirs.home_dir().join(".forge"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("governance.json")
}

// ============================================================================
// Automation
// ============================================================================

/// Policy gate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationConfig {
    /// Active automation level
    #[serde(default)]
    pub level: AutomationLevel,

    /// Executions allowed in any trailing 60-second window
    #[serde(default = "default_max_actions_per_minute")]
    pub max_actions_per_minute: u32,

    /// Capture a rollback snapshot before each execution
    #[serde(default = "default_true")]
    pub rollback_enabled: bool,

    /// Run the alignment and dangerous-pattern checks
    #[serde(default = "default_true")]
    pub safety_checks_enabled: bool,

    /// Simulate execution instead of calling the executor
    #[serde(default)]
    pub dry_run: bool,

    /// Hourly rate used to estimate cost saved by completed actions
    #[serde(default = "default_hourly_rate")]
    pub hourly_rate: f64,

    /// Per-level threshold overrides
    #[serde(default)]
    pub thresholds: HashMap<AutomationLevel, ConfidenceThresholds>,

    /// Rules loaded at startup
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            level: AutomationLevel::default(),
            max_actions_per_minute: default_max_actions_per_minute(),
            rollback_enabled: true,
            safety_checks_enabled: true,
            dry_run: false,
            hourly_rate: default_hourly_rate(),
            thresholds: HashMap::new(),
            rules: Vec::new(),
        }
    }
}

impl AutomationConfig {
    /// Thresholds for `level`, honouring configured overrides.
    pub fn thresholds_for(&self, level: AutomationLevel) -> ConfidenceThresholds {
        self.thresholds
            .get(&level)
            .copied()
            .unwrap_or_else(|| level.default_thresholds())
    }
}

fn default_max_actions_per_minute() -> u32 {
    10
}

fn default_hourly_rate() -> f64 {
    75.0
}

fn default_true() -> bool {
    true
}

/// A rule definition as it appears in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Regex matched against the serialized situation context
    pub pattern: String,
    pub kind: ActionKind,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub impact: Impact,
    /// Base confidence of the candidate action
    pub confidence: f64,
    /// Multiplier applied to the base confidence
    #[serde(default)]
    pub confidence_modifier: Option<f64>,
    #[serde(default)]
    pub requires_confirmation: bool,
    #[serde(default)]
    pub max_executions_per_hour: Option<u32>,
}

impl Validate for RuleConfig {
    fn validate(&self) -> ValidationResult<()> {
        let mut v = Validator::new();
        v.require("automation.rules[].id", &self.id)
            .require(&format!("automation.rules[{}].title", self.id), &self.title)
            .in_range(
                &format!("automation.rules[{}].confidence", self.id),
                self.confidence,
                0.0,
                1.0,
            );
        if let Some(modifier) = self.confidence_modifier {
            v.check(
                modifier.is_finite() && modifier >= 0.0,
                &format!("automation.rules[{}].confidence_modifier", self.id),
                "must be a non-negative finite number",
            );
        }
        if let Some(cap) = self.max_executions_per_hour {
            v.check(
                cap > 0,
                &format!("automation.rules[{}].max_executions_per_hour", self.id),
                "must be greater than 0 when set",
            );
        }
        if let Err(e) = regex::Regex::new(&self.pattern) {
            v.push(ValidationError::InvalidValue {
                field: format!("automation.rules[{}].pattern", self.id),
                reason: e.to_string(),
            });
        }
        v.finish()
    }
}

// ============================================================================
// Approval queue
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// Minutes before an undecided request times out
    #[serde(default = "default_timeout_minutes")]
    pub default_timeout_minutes: u64,

    /// Number of recent decisions used for response statistics
    #[serde(default = "default_stats_window")]
    pub stats_window: usize,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            default_timeout_minutes: default_timeout_minutes(),
            stats_window: default_stats_window(),
        }
    }
}

fn default_timeout_minutes() -> u64 {
    5
}

fn default_stats_window() -> usize {
    100
}

// ============================================================================
// Activity recorder
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityConfig {
    /// Maximum retained events
    #[serde(default = "default_history_cap")]
    pub history_cap: usize,

    /// Per-subscriber stream buffer
    #[serde(default = "default_stream_buffer_size")]
    pub stream_buffer_size: usize,

    /// Age after which ordinary events are dropped, at most
    /// [`MAX_RETENTION_DAYS`]
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,

    /// Keep critical/error events regardless of age
    #[serde(default = "default_true")]
    pub retain_critical: bool,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            history_cap: default_history_cap(),
            stream_buffer_size: default_stream_buffer_size(),
            retention_days: default_retention_days(),
            retain_critical: true,
        }
    }
}

fn default_history_cap() -> usize {
    1000
}

fn default_stream_buffer_size() -> usize {
    100
}

fn default_retention_days() -> i64 {
    30
}

/// Upper bound accepted for `activity.retention_days` (100 years).
pub const MAX_RETENTION_DAYS: i64 = 36_500;

// ============================================================================
// Project state
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Recent decisions kept in the project snapshot
    #[serde(default = "default_max_recent_decisions")]
    pub max_recent_decisions: usize,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            max_recent_decisions: default_max_recent_decisions(),
        }
    }
}

fn default_max_recent_decisions() -> usize {
    50
}

// ============================================================================
// Observability
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// "json" or "pretty"
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

// ============================================================================
// Root
// ============================================================================

/// Root configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GovernanceConfig {
    #[serde(default)]
    pub automation: AutomationConfig,

    #[serde(default)]
    pub approval: ApprovalConfig,

    #[serde(default)]
    pub activity: ActivityConfig,

    #[serde(default)]
    pub state: StateConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl GovernanceConfig {
    /// Load configuration from the default path.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            tracing::info!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Load configuration with environment variable overrides, then validate.
    pub fn load_with_env(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::load_from(p)?,
            None => Self::load()?,
        };
        config.apply_env_overrides();
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup("FORGE_AUTOMATION_LEVEL") {
            match level.parse() {
                Ok(l) => self.automation.level = l,
                Err(e) => tracing::warn!(error = %e, "Ignoring FORGE_AUTOMATION_LEVEL"),
            }
        }
        if let Some(v) = lookup("FORGE_MAX_ACTIONS_PER_MINUTE").and_then(|v| v.parse().ok()) {
            self.automation.max_actions_per_minute = v;
        }
        if let Some(v) = lookup("FORGE_ROLLBACK_ENABLED").and_then(|v| parse_bool(&v)) {
            self.automation.rollback_enabled = v;
        }
        if let Some(v) = lookup("FORGE_SAFETY_CHECKS_ENABLED").and_then(|v| parse_bool(&v)) {
            self.automation.safety_checks_enabled = v;
        }
        if let Some(v) = lookup("FORGE_DRY_RUN").and_then(|v| parse_bool(&v)) {
            self.automation.dry_run = v;
        }
        if let Some(v) = lookup("FORGE_APPROVAL_TIMEOUT_MINUTES").and_then(|v| v.parse().ok()) {
            self.approval.default_timeout_minutes = v;
        }
        if let Some(v) = lookup("FORGE_ACTIVITY_HISTORY_CAP").and_then(|v| v.parse().ok()) {
            self.activity.history_cap = v;
        }
        if let Some(v) = lookup("FORGE_ACTIVITY_STREAM_BUFFER").and_then(|v| v.parse().ok()) {
            self.activity.stream_buffer_size = v;
        }
        if let Some(level) = lookup("FORGE_LOG_LEVEL") {
            self.observability.log_level = level;
        }
        if let Some(format) = lookup("FORGE_LOG_FORMAT") {
            self.observability.log_format = format;
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl Validate for GovernanceConfig {
    fn validate(&self) -> ValidationResult<()> {
        let mut v = Validator::new();

        for level in AutomationLevel::ALL {
            v.nested(self.automation.thresholds_for(level).validate());
        }
        v.check(
            self.automation.max_actions_per_minute > 0,
            "automation.max_actions_per_minute",
            "must be greater than 0",
        )
        .check(
            self.automation.hourly_rate.is_finite() && self.automation.hourly_rate >= 0.0,
            "automation.hourly_rate",
            "must be a non-negative finite number",
        )
        .check(
            self.approval.default_timeout_minutes > 0,
            "approval.default_timeout_minutes",
            "must be greater than 0",
        )
        .check(
            self.approval.stats_window > 0,
            "approval.stats_window",
            "must be greater than 0",
        )
        .check(
            self.activity.history_cap > 0,
            "activity.history_cap",
            "must be greater than 0",
        )
        .check(
            self.activity.stream_buffer_size > 0,
            "activity.stream_buffer_size",
            "must be greater than 0",
        )
        .check(
            (1..=MAX_RETENTION_DAYS).contains(&self.activity.retention_days),
            "activity.retention_days",
            format!("must be between 1 and {}", MAX_RETENTION_DAYS),
        )
        .check(
            self.state.max_recent_decisions > 0,
            "state.max_recent_decisions",
            "must be greater than 0",
        );

        let mut seen = std::collections::HashSet::new();
        for rule in &self.automation.rules {
            v.nested(rule.validate());
            if !seen.insert(rule.id.as_str()) {
                v.push(ValidationError::Conflict {
                    reason: format!("duplicate rule id '{}'", rule.id),
                });
            }
        }

        v.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = GovernanceConfig::default();
        assert_eq!(config.automation.level, AutomationLevel::Balanced);
        assert_eq!(config.automation.max_actions_per_minute, 10);
        assert!(config.automation.rollback_enabled);
        assert!(config.automation.safety_checks_enabled);
        assert_eq!(config.approval.default_timeout_minutes, 5);
        assert_eq!(config.activity.history_cap, 1000);
        assert_eq!(config.activity.stream_buffer_size, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: GovernanceConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.approval.stats_window, 100);
        assert_eq!(config.observability.log_format, "pretty");
    }

    #[test]
    fn test_threshold_override() {
        let json = r#"{
            "automation": {
                "level": "aggressive",
                "thresholds": { "aggressive": { "minimum": 0.4, "caution": 0.6, "confident": 0.8 } }
            }
        }"#;
        let config: GovernanceConfig = serde_json::from_str(json).unwrap();
        let t = config.automation.thresholds_for(AutomationLevel::Aggressive);
        assert_eq!(t.minimum, 0.4);
        assert_eq!(
            config.automation.thresholds_for(AutomationLevel::Balanced),
            AutomationLevel::Balanced.default_thresholds()
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_override_rejected() {
        let mut config = GovernanceConfig::default();
        config
            .automation
            .thresholds
            .insert(AutomationLevel::Maximum, ConfidenceThresholds::new(0.5, 0.3, 0.9));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retention_days_bounded() {
        let mut config = GovernanceConfig::default();
        config.activity.retention_days = MAX_RETENTION_DAYS;
        assert!(config.validate().is_ok());

        config.activity.retention_days = 200_000_000;
        let err = config.validate().unwrap_err();
        assert_eq!(err.field(), Some("activity.retention_days"));
    }

    #[test]
    fn test_rule_with_bad_pattern_rejected() {
        let mut config = GovernanceConfig::default();
        config.automation.rules.push(RuleConfig {
            id: "r1".into(),
            name: "broken".into(),
            pattern: "(unclosed".into(),
            kind: ActionKind::Fix,
            title: "Fix".into(),
            description: String::new(),
            impact: Impact::Low,
            confidence: 0.8,
            confidence_modifier: None,
            requires_confirmation: false,
            max_executions_per_hour: None,
        });
        let err = config.validate().unwrap_err();
        assert_eq!(err.field(), Some("automation.rules[r1].pattern"));
    }

    #[test]
    fn test_overrides_from_lookup() {
        let mut config = GovernanceConfig::default();
        config.apply_overrides(|key| match key {
            "FORGE_AUTOMATION_LEVEL" => Some("maximum".into()),
            "FORGE_DRY_RUN" => Some("yes".into()),
            "FORGE_MAX_ACTIONS_PER_MINUTE" => Some("3".into()),
            "FORGE_ACTIVITY_HISTORY_CAP" => Some("not-a-number".into()),
            _ => None,
        });
        assert_eq!(config.automation.level, AutomationLevel::Maximum);
        assert!(config.automation.dry_run);
        assert_eq!(config.automation.max_actions_per_minute, 3);
        assert_eq!(config.activity.history_cap, 1000);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "approval": {{ "default_timeout_minutes": 2 }} }}"#).unwrap();
        let config = GovernanceConfig::load_from(file.path()).unwrap();
        assert_eq!(config.approval.default_timeout_minutes, 2);
    }
}

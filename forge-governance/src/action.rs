//! Automated actions and their lifecycle.
//!
//! ```text
//! pending ──► executing ──┬──► completed ──► reverted
//!                         └──► failed
//! ```

use chrono::{DateTime, Utc};
use forge_common::{ActionKind, Impact, Validate, ValidationError, ValidationResult, Validator};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::executor::ExecutionResult;

/// Lifecycle status of an automated action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Pending,
    Executing,
    Completed,
    Failed,
    Reverted,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Executing => "executing",
            ActionStatus::Completed => "completed",
            ActionStatus::Failed => "failed",
            ActionStatus::Reverted => "reverted",
        }
    }

    /// Returns true once the action has left the execution pipeline.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ActionStatus::Completed | ActionStatus::Failed | ActionStatus::Reverted
        )
    }
}

impl Default for ActionStatus {
    fn default() -> Self {
        ActionStatus::Pending
    }
}

/// A proposed unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomatedAction {
    #[serde(default = "fresh_id")]
    pub id: String,
    pub kind: ActionKind,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub impact: Impact,
    /// Estimated likelihood the action is correct and safe, in [0, 1]
    pub confidence: f64,
    #[serde(default)]
    pub status: ActionStatus,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Shell command the executor runs for this action
    #[serde(default)]
    pub command: Option<String>,
    /// Rule that proposed this action
    #[serde(default)]
    pub source_rule: Option<String>,
    /// Force the confirmation path regardless of confidence
    #[serde(default)]
    pub requires_confirmation: bool,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: Option<ExecutionResult>,
}

fn fresh_id() -> String {
    Uuid::new_v4().to_string()
}

impl AutomatedAction {
    /// Create a pending action with a fresh id.
    pub fn new(kind: ActionKind, title: impl Into<String>, confidence: f64) -> Self {
        Self {
            id: fresh_id(),
            kind,
            title: title.into(),
            description: String::new(),
            impact: Impact::default(),
            confidence,
            status: ActionStatus::Pending,
            created_at: Utc::now(),
            command: None,
            source_rule: None,
            requires_confirmation: false,
            completed_at: None,
            result: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_impact(mut self, impact: Impact) -> Self {
        self.impact = impact;
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn from_rule(mut self, rule_id: impl Into<String>) -> Self {
        self.source_rule = Some(rule_id.into());
        self
    }

    pub fn requiring_confirmation(mut self) -> Self {
        self.requires_confirmation = true;
        self
    }

    /// All free text the safety filter inspects.
    pub fn inspection_text(&self) -> String {
        let mut text = format!("{}\n{}", self.title, self.description);
        if let Some(command) = &self.command {
            text.push('\n');
            text.push_str(command);
        }
        text
    }
}

impl Validate for AutomatedAction {
    fn validate(&self) -> ValidationResult<()> {
        let mut v = Validator::new();
        v.require("action.id", &self.id)
            .require("action.title", &self.title)
            .in_range("action.confidence", self.confidence, 0.0, 1.0);
        if let Some(command) = &self.command {
            v.require("action.command", command);
        }
        if self.status != ActionStatus::Pending {
            v.push(ValidationError::InvalidValue {
                field: "action.status".into(),
                reason: format!("only pending actions can be executed (got {})", self.status.as_str()),
            });
        }
        v.finish()
    }
}

/// Pre-execution capture sufficient to reverse an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackSnapshot {
    pub id: String,
    /// Lookup key only; the action lives in the engine's history
    pub action_id: String,
    pub state: serde_json::Value,
    #[serde(default)]
    pub files: BTreeMap<String, String>,
    #[serde(default)]
    pub commands: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl RollbackSnapshot {
    pub fn capture(
        action_id: impl Into<String>,
        state: serde_json::Value,
        files: BTreeMap<String, String>,
        commands: Vec<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            action_id: action_id.into(),
            state,
            files,
            commands,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_action_is_pending_and_valid() {
        let action = AutomatedAction::new(ActionKind::Fix, "Fix lint warnings", 0.8);
        assert_eq!(action.status, ActionStatus::Pending);
        assert!(!action.status.is_terminal());
        assert!(action.validate().is_ok());
    }

    #[test]
    fn test_out_of_range_confidence_is_invalid() {
        let action = AutomatedAction::new(ActionKind::Fix, "Fix", 1.01);
        assert_eq!(
            action.validate().unwrap_err().field(),
            Some("action.confidence")
        );
    }

    #[test]
    fn test_non_pending_action_is_invalid() {
        let mut action = AutomatedAction::new(ActionKind::Update, "Bump deps", 0.9);
        action.status = ActionStatus::Completed;
        assert!(action.validate().is_err());
    }

    #[test]
    fn test_missing_title_is_invalid() {
        let action = AutomatedAction::new(ActionKind::Refactor, "   ", 0.9);
        assert_eq!(action.validate().unwrap_err().field(), Some("action.title"));
    }

    #[test]
    fn test_deserialize_minimal_action() {
        let json = r#"{ "id": "a1", "kind": "optimize", "title": "Cache build", "confidence": 0.7 }"#;
        let action: AutomatedAction = serde_json::from_str(json).unwrap();
        assert_eq!(action.kind, ActionKind::Optimize);
        assert_eq!(action.impact, Impact::Medium);
        assert_eq!(action.status, ActionStatus::Pending);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(ActionStatus::Completed.is_terminal());
        assert!(ActionStatus::Failed.is_terminal());
        assert!(ActionStatus::Reverted.is_terminal());
        assert!(!ActionStatus::Executing.is_terminal());
    }

    #[test]
    fn test_inspection_text_includes_command() {
        let action = AutomatedAction::new(ActionKind::Deploy, "Ship", 0.9)
            .with_description("release build")
            .with_command("git push origin main");
        let text = action.inspection_text();
        assert!(text.contains("Ship"));
        assert!(text.contains("git push origin main"));
    }
}

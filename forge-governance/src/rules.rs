//! Automation rules: a pluggable match predicate plus the action template
//! produced when it matches.

use forge_common::{ActionKind, Impact, RuleConfig, Validate, ValidationError};
use regex::Regex;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::action::AutomatedAction;

/// Decides whether a rule applies to a free-form situation context.
pub trait RuleMatcher: Send + Sync + fmt::Debug {
    fn matches(&self, context: &Value) -> bool;
}

/// Matches a regex against a string context, or against the serialized
/// JSON of any other context.
#[derive(Debug, Clone)]
pub struct RegexMatcher {
    pattern: Regex,
}

impl RegexMatcher {
    pub fn new(pattern: &str) -> Result<Self, ValidationError> {
        Regex::new(pattern)
            .map(|pattern| Self { pattern })
            .map_err(|e| ValidationError::InvalidValue {
                field: "rule.pattern".into(),
                reason: e.to_string(),
            })
    }
}

impl RuleMatcher for RegexMatcher {
    fn matches(&self, context: &Value) -> bool {
        match context {
            Value::String(s) => self.pattern.is_match(s),
            other => self.pattern.is_match(&other.to_string()),
        }
    }
}

/// Matcher backed by an arbitrary closure.
pub struct PredicateMatcher {
    name: String,
    predicate: Box<dyn Fn(&Value) -> bool + Send + Sync>,
}

impl PredicateMatcher {
    pub fn new<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            predicate: Box::new(predicate),
        }
    }
}

impl fmt::Debug for PredicateMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PredicateMatcher")
            .field("name", &self.name)
            .finish()
    }
}

impl RuleMatcher for PredicateMatcher {
    fn matches(&self, context: &Value) -> bool {
        (self.predicate)(context)
    }
}

/// Shape of the candidate action a rule proposes.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionTemplate {
    pub kind: ActionKind,
    pub title: String,
    pub description: String,
    pub impact: Impact,
    pub confidence: f64,
    pub command: Option<String>,
}

impl ActionTemplate {
    pub fn new(kind: ActionKind, title: impl Into<String>, confidence: f64) -> Self {
        Self {
            kind,
            title: title.into(),
            description: String::new(),
            impact: Impact::default(),
            confidence,
            command: None,
        }
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
}

#[derive(Debug, Clone)]
pub struct AutomationRule {
    pub id: String,
    pub name: String,
    pub matcher: Arc<dyn RuleMatcher>,
    pub template: ActionTemplate,
    /// Multiplier applied to the template confidence
    pub confidence_modifier: Option<f64>,
    pub requires_confirmation: bool,
    pub max_executions_per_hour: Option<u32>,
}

impl AutomationRule {
    pub fn new(
        id: impl Into<String>,
        matcher: impl RuleMatcher + 'static,
        template: ActionTemplate,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            matcher: Arc::new(matcher),
            template,
            confidence_modifier: None,
            requires_confirmation: false,
            max_executions_per_hour: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_confidence_modifier(mut self, modifier: f64) -> Self {
        self.confidence_modifier = Some(modifier);
        self
    }

    pub fn requiring_confirmation(mut self) -> Self {
        self.requires_confirmation = true;
        self
    }

    pub fn with_hourly_cap(mut self, cap: u32) -> Self {
        self.max_executions_per_hour = Some(cap);
        self
    }

    /// Build a regex-backed rule from its config definition.
    pub fn from_config(config: &RuleConfig) -> Result<Self, ValidationError> {
        config.validate()?;
        let matcher = RegexMatcher::new(&config.pattern)?;
        let template = ActionTemplate {
            kind: config.kind,
            title: config.title.clone(),
            description: config.description.clone(),
            impact: config.impact,
            confidence: config.confidence,
            command: None,
        };

        Ok(Self {
            id: config.id.clone(),
            name: if config.name.is_empty() {
                config.id.clone()
            } else {
                config.name.clone()
            },
            matcher: Arc::new(matcher),
            template,
            confidence_modifier: config.confidence_modifier,
            requires_confirmation: config.requires_confirmation,
            max_executions_per_hour: config.max_executions_per_hour,
        })
    }

    pub fn matches(&self, context: &Value) -> bool {
        self.matcher.matches(context)
    }

    /// Candidate confidence: the template confidence scaled by the modifier,
    /// clamped to [0, 1].
    pub fn scaled_confidence(&self) -> f64 {
        let base = self.template.confidence * self.confidence_modifier.unwrap_or(1.0);
        base.clamp(0.0, 1.0)
    }

    /// Candidate action proposed by this rule. Does not check the match.
    pub fn candidate(&self) -> AutomatedAction {
        let t = &self.template;
        let mut action = AutomatedAction::new(t.kind, t.title.clone(), self.scaled_confidence())
            .with_description(t.description.clone())
            .with_impact(t.impact)
            .from_rule(self.id.clone());
        if let Some(command) = &t.command {
            action = action.with_command(command.clone());
        }
        if self.requires_confirmation {
            action = action.requiring_confirmation();
        }
        action
    }
}

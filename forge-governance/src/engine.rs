//! Automation engine: the policy gate every proposed action passes through.
//!
//! ```text
//! execute_action
//!   1. rate check          ── RATE_LIMIT
//!   2. validation          ── VALIDATION_ERROR
//!   3. safety              ── ALIGNMENT_ERROR / SAFETY_CHECK_FAILED
//!   4. confidence gate     ── Skipped(below minimum | confirmation required)
//!   5. rollback snapshot
//!   6. execute (or dry-run)
//!   7. finalize            ── completed | failed
//! ```
//!
//! The engine never enqueues approvals itself. A `ConfirmationRequired`
//! outcome is returned to the caller, which owns the approval round-trip.

use chrono::Utc;
use forge_common::{
    AutomationConfig, AutomationLevel, ConfidenceBand, ConfidenceThresholds, Error, Impact,
    Result, Validate, ValidationError,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use crate::action::{ActionStatus, AutomatedAction, RollbackSnapshot};
use crate::executor::{CommandExecutor, DryRunExecutor, ExecutionResult};
use crate::rules::AutomationRule;
use crate::safety::{find_dangerous_pattern, AlignmentChecker};
use crate::subscription::{SubscribeOptions, SubscriberList, Subscription};

const RATE_WINDOW: Duration = Duration::from_secs(60);
const RULE_CAP_WINDOW: Duration = Duration::from_secs(3600);

/// Agent id recorded when the caller does not name one.
pub const DEFAULT_AGENT_ID: &str = "automation-engine";

// ============================================================================
// Execution context and outcome
// ============================================================================

/// Caller-supplied context for one execution attempt.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub agent_id: String,
    /// Force the confirmation path
    pub require_confirmation: bool,
    /// Set when a human already approved this action
    pub approved_by: Option<String>,
    /// Pre-execution state captured into the rollback snapshot
    pub state: Value,
    pub files: BTreeMap<String, String>,
    /// Commands replayed on rollback, in order
    pub rollback_commands: Vec<String>,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self {
            agent_id: DEFAULT_AGENT_ID.to_string(),
            require_confirmation: false,
            approved_by: None,
            state: Value::Null,
            files: BTreeMap::new(),
            rollback_commands: Vec::new(),
        }
    }
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = agent_id.into();
        self
    }

    pub fn requiring_confirmation(mut self) -> Self {
        self.require_confirmation = true;
        self
    }

    /// Mark the action as approved; clears the confirmation requirement.
    pub fn approved_by(mut self, approver: impl Into<String>) -> Self {
        self.approved_by = Some(approver.into());
        self.require_confirmation = false;
        self
    }

    pub fn with_state(mut self, state: Value) -> Self {
        self.state = state;
        self
    }

    pub fn with_file(mut self, path: impl Into<String>, contents: impl Into<String>) -> Self {
        self.files.insert(path.into(), contents.into());
        self
    }

    pub fn with_rollback_command(mut self, command: impl Into<String>) -> Self {
        self.rollback_commands.push(command.into());
        self
    }
}

/// Why an action was not executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    BelowMinimum,
    ConfirmationRequired,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::BelowMinimum => "below minimum",
            SkipReason::ConfirmationRequired => "confirmation required",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// The executor ran; the action is `completed` or `failed`.
    Executed(AutomatedAction),
    /// The gate stopped the action; it is still `pending`.
    Skipped {
        action: AutomatedAction,
        reason: SkipReason,
    },
}

impl ExecutionOutcome {
    pub fn action(&self) -> &AutomatedAction {
        match self {
            ExecutionOutcome::Executed(action) => action,
            ExecutionOutcome::Skipped { action, .. } => action,
        }
    }

    pub fn is_executed(&self) -> bool {
        matches!(self, ExecutionOutcome::Executed(_))
    }

    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self {
            ExecutionOutcome::Skipped { reason, .. } => Some(*reason),
            ExecutionOutcome::Executed(_) => None,
        }
    }
}

// ============================================================================
// Events and statistics
// ============================================================================

/// Notifications emitted by the engine.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    ActionSkipped {
        action: AutomatedAction,
        reason: SkipReason,
        agent_id: String,
    },
    ActionRejected {
        action_id: String,
        code: &'static str,
        message: String,
        agent_id: String,
    },
    ActionStarted {
        action_id: String,
        agent_id: String,
    },
    SnapshotCaptured {
        action_id: String,
        snapshot_id: String,
    },
    ActionCompleted {
        action: AutomatedAction,
        agent_id: String,
    },
    ActionFailed {
        action: AutomatedAction,
        agent_id: String,
    },
    /// File contents need a human to restore them
    FileRestoreRequested {
        action_id: String,
        snapshot_id: String,
        paths: Vec<String>,
    },
    ActionReverted {
        action_id: String,
    },
    /// Replay stopped; the first `commands_applied` commands already ran
    RollbackFailed {
        action_id: String,
        commands_applied: usize,
        commands_total: usize,
        reason: String,
    },
    LevelChanged {
        from: AutomationLevel,
        to: AutomationLevel,
    },
    RuleAdded {
        rule_id: String,
    },
    RuleRemoved {
        rule_id: String,
    },
}

/// Rolling automation statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AutomationStats {
    pub total_executed: u64,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub rejected: u64,
    pub reverted: u64,
    /// completed / total_executed
    pub success_rate: f64,
    pub time_saved_minutes: f64,
    pub cost_saved: f64,
    /// Completed `optimize` actions
    pub performance_gains: u64,
}

impl AutomationStats {
    fn record_result(&mut self, action: &AutomatedAction, hourly_rate: f64) {
        self.total_executed += 1;
        if action.status == ActionStatus::Completed {
            self.completed += 1;
            self.time_saved_minutes += action.kind.estimated_minutes_saved();
            self.cost_saved = self.time_saved_minutes / 60.0 * hourly_rate;
            if action.kind == forge_common::ActionKind::Optimize {
                self.performance_gains += 1;
            }
        } else {
            self.failed += 1;
        }
        self.success_rate = self.completed as f64 / self.total_executed as f64;
    }
}

// ============================================================================
// Engine
// ============================================================================

struct EngineState {
    level: AutomationLevel,
    rules: Vec<AutomationRule>,
    rule_runs: HashMap<String, VecDeque<Instant>>,
    recent_executions: VecDeque<Instant>,
    in_flight: HashMap<String, AutomatedAction>,
    /// Finished actions in completion order. Kept for the engine's lifetime;
    /// callers that run long sessions persist and rebuild the engine.
    history: Vec<AutomatedAction>,
    /// Action id to position in `history`
    history_index: HashMap<String, usize>,
    snapshots: HashMap<String, RollbackSnapshot>,
    rolling_back: HashSet<String>,
    stats: AutomationStats,
}

impl EngineState {
    fn finished(&self, action_id: &str) -> Option<&AutomatedAction> {
        self.history_index.get(action_id).map(|&i| &self.history[i])
    }

    fn finished_mut(&mut self, action_id: &str) -> Option<&mut AutomatedAction> {
        let i = *self.history_index.get(action_id)?;
        self.history.get_mut(i)
    }

    fn push_history(&mut self, action: AutomatedAction) {
        self.history_index.insert(action.id.clone(), self.history.len());
        self.history.push(action);
    }

    fn prune_rate_window(&mut self, now: Instant) {
        while let Some(front) = self.recent_executions.front() {
            if now.duration_since(*front) >= RATE_WINDOW {
                self.recent_executions.pop_front();
            } else {
                break;
            }
        }
    }

    /// Executions of `rule_id` in the trailing hour.
    fn rule_runs_in_window(&mut self, rule_id: &str, now: Instant) -> usize {
        match self.rule_runs.get_mut(rule_id) {
            Some(runs) => {
                while let Some(front) = runs.front() {
                    if now.duration_since(*front) >= RULE_CAP_WINDOW {
                        runs.pop_front();
                    } else {
                        break;
                    }
                }
                runs.len()
            }
            None => 0,
        }
    }

    fn rule_cap(&self, rule_id: &str) -> Option<u32> {
        self.rules
            .iter()
            .find(|r| r.id == rule_id)
            .and_then(|r| r.max_executions_per_hour)
    }

    /// Admission check shared by the pre-flight and the reservation step.
    fn admit(&mut self, action: &AutomatedAction, max_per_minute: u32, now: Instant) -> Result<()> {
        self.prune_rate_window(now);
        if self.recent_executions.len() >= max_per_minute as usize {
            return Err(Error::RateLimited(format!(
                "{} executions in the last 60s (max {})",
                self.recent_executions.len(),
                max_per_minute
            )));
        }

        if let Some(rule_id) = &action.source_rule {
            if let Some(cap) = self.rule_cap(rule_id) {
                let runs = self.rule_runs_in_window(rule_id, now);
                if runs >= cap as usize {
                    return Err(Error::RateLimited(format!(
                        "rule {} reached {} executions this hour",
                        rule_id, cap
                    )));
                }
            }
        }

        if self.in_flight.contains_key(&action.id) || self.history_index.contains_key(&action.id) {
            return Err(ValidationError::Conflict {
                reason: format!("action {} was already executed", action.id),
            }
            .into());
        }

        Ok(())
    }
}

/// The policy gate.
pub struct AutomationEngine {
    config: AutomationConfig,
    executor: Arc<dyn CommandExecutor>,
    dry_run: DryRunExecutor,
    alignment: Option<Arc<dyn AlignmentChecker>>,
    state: Mutex<EngineState>,
    events: SubscriberList<EngineEvent>,
}

impl AutomationEngine {
    /// Create an engine. Thresholds and startup rules are validated here.
    pub fn new(config: AutomationConfig, executor: Arc<dyn CommandExecutor>) -> Result<Self> {
        for level in AutomationLevel::ALL {
            config.thresholds_for(level).validate()?;
        }
        if config.max_actions_per_minute == 0 {
            return Err(Error::Config(
                "automation.max_actions_per_minute must be greater than 0".into(),
            ));
        }

        let mut rules: Vec<AutomationRule> = Vec::with_capacity(config.rules.len());
        for rule_config in &config.rules {
            if rules.iter().any(|r| r.id == rule_config.id) {
                return Err(ValidationError::Conflict {
                    reason: format!("duplicate rule id '{}'", rule_config.id),
                }
                .into());
            }
            rules.push(AutomationRule::from_config(rule_config)?);
        }

        tracing::info!(
            level = %config.level,
            rules = rules.len(),
            dry_run = config.dry_run,
            "Automation engine initialized"
        );

        Ok(Self {
            state: Mutex::new(EngineState {
                level: config.level,
                rules,
                rule_runs: HashMap::new(),
                recent_executions: VecDeque::new(),
                in_flight: HashMap::new(),
                history: Vec::new(),
                history_index: HashMap::new(),
                snapshots: HashMap::new(),
                rolling_back: HashSet::new(),
                stats: AutomationStats::default(),
            }),
            config,
            executor,
            dry_run: DryRunExecutor,
            alignment: None,
            events: SubscriberList::unbounded("automation"),
        })
    }

    pub fn with_alignment_checker(mut self, checker: Arc<dyn AlignmentChecker>) -> Self {
        self.alignment = Some(checker);
        self
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &AutomationConfig {
        &self.config
    }

    pub fn is_dry_run(&self) -> bool {
        self.config.dry_run
    }

    // ------------------------------------------------------------------------
    // Levels and thresholds
    // ------------------------------------------------------------------------

    pub fn level(&self) -> AutomationLevel {
        self.lock().level
    }

    pub fn set_level(&self, level: AutomationLevel) {
        let from = {
            let mut state = self.lock();
            std::mem::replace(&mut state.level, level)
        };
        if from != level {
            tracing::info!(from = %from, to = %level, "Automation level changed");
            self.events.publish(&EngineEvent::LevelChanged { from, to: level });
        }
    }

    /// Thresholds of the active level.
    pub fn thresholds(&self) -> ConfidenceThresholds {
        self.config.thresholds_for(self.level())
    }

    // ------------------------------------------------------------------------
    // Rules
    // ------------------------------------------------------------------------

    pub fn add_rule(&self, rule: AutomationRule) -> Result<()> {
        let rule_id = rule.id.clone();
        {
            let mut state = self.lock();
            if state.rules.iter().any(|r| r.id == rule.id) {
                return Err(ValidationError::Conflict {
                    reason: format!("rule '{}' already registered", rule.id),
                }
                .into());
            }
            state.rules.push(rule);
        }
        tracing::info!(rule_id = %rule_id, "Rule added");
        self.events.publish(&EngineEvent::RuleAdded { rule_id });
        Ok(())
    }

    pub fn remove_rule(&self, rule_id: &str) -> bool {
        let removed = {
            let mut state = self.lock();
            let before = state.rules.len();
            state.rules.retain(|r| r.id != rule_id);
            state.rule_runs.remove(rule_id);
            state.rules.len() != before
        };
        if removed {
            tracing::info!(rule_id = %rule_id, "Rule removed");
            self.events.publish(&EngineEvent::RuleRemoved {
                rule_id: rule_id.to_string(),
            });
        }
        removed
    }

    /// Registered rules in registration order.
    pub fn rules(&self) -> Vec<AutomationRule> {
        self.lock().rules.clone()
    }

    /// Evaluate every rule against `context` and return candidate actions,
    /// highest confidence first. Nothing is executed.
    pub fn analyze_situation(&self, context: &Value) -> Vec<AutomatedAction> {
        let now = Instant::now();
        let mut state = self.lock();
        let rules = state.rules.clone();

        let mut candidates = Vec::new();
        for rule in &rules {
            if let Some(cap) = rule.max_executions_per_hour {
                if state.rule_runs_in_window(&rule.id, now) >= cap as usize {
                    tracing::debug!(rule_id = %rule.id, cap, "Rule skipped: hourly cap reached");
                    continue;
                }
            }
            if rule.matches(context) {
                candidates.push(rule.candidate());
            }
        }
        drop(state);

        candidates.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(Ordering::Equal)
        });
        candidates
    }

    // ------------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------------

    /// Gate `action` through policy and execute it if permitted.
    ///
    /// Rejections return an error and leave no trace beyond an event.
    /// Skips return `Ok(Skipped)`; the action stays `pending`. Executor
    /// failures are not errors: the action is returned as `failed`.
    pub async fn execute_action(
        &self,
        mut action: AutomatedAction,
        ctx: ExecutionContext,
    ) -> Result<ExecutionOutcome> {
        let max_per_minute = self.config.max_actions_per_minute;

        // 1. Rate check (and duplicate id guard)
        let admitted = self.lock().admit(&action, max_per_minute, Instant::now());
        if let Err(e) = admitted {
            return Err(self.rejected(&action.id, &ctx.agent_id, e));
        }

        // 2. Structural validation
        if let Err(e) = action.validate() {
            return Err(self.rejected(&action.id, &ctx.agent_id, e.into()));
        }

        // 3. Safety
        if self.config.safety_checks_enabled {
            if let Err(e) = self.safety_check(&action).await {
                return Err(self.rejected(&action.id, &ctx.agent_id, e));
            }
        }

        // 4. Confidence gate
        if let Some(reason) = self.gate(&action, &ctx) {
            return Ok(self.skipped(action, reason, &ctx.agent_id));
        }

        // 5. Reserve and snapshot. The rate window is re-checked because the
        // safety check may have awaited.
        let snapshot_id = {
            let now = Instant::now();
            let mut state = self.lock();
            if let Err(e) = state.admit(&action, max_per_minute, now) {
                drop(state);
                return Err(self.rejected(&action.id, &ctx.agent_id, e));
            }
            state.recent_executions.push_back(now);
            if let Some(rule_id) = &action.source_rule {
                state
                    .rule_runs
                    .entry(rule_id.clone())
                    .or_default()
                    .push_back(now);
            }

            action.status = ActionStatus::Executing;
            state.in_flight.insert(action.id.clone(), action.clone());

            if self.config.rollback_enabled {
                let snapshot = RollbackSnapshot::capture(
                    action.id.clone(),
                    ctx.state.clone(),
                    ctx.files.clone(),
                    ctx.rollback_commands.clone(),
                );
                let id = snapshot.id.clone();
                state.snapshots.insert(action.id.clone(), snapshot);
                Some(id)
            } else {
                None
            }
        };

        tracing::info!(
            action_id = %action.id,
            kind = %action.kind,
            confidence = action.confidence,
            agent_id = %ctx.agent_id,
            approved_by = ?ctx.approved_by,
            "Executing action"
        );
        self.events.publish(&EngineEvent::ActionStarted {
            action_id: action.id.clone(),
            agent_id: ctx.agent_id.clone(),
        });
        if let Some(snapshot_id) = snapshot_id {
            self.events.publish(&EngineEvent::SnapshotCaptured {
                action_id: action.id.clone(),
                snapshot_id,
            });
        }

        // 6. Execute
        let result = self.run_executor(&action).await;

        // 7. Finalize
        action.status = if result.is_completed() {
            ActionStatus::Completed
        } else {
            ActionStatus::Failed
        };
        action.completed_at = Some(Utc::now());
        action.result = Some(result);

        {
            let mut state = self.lock();
            state.in_flight.remove(&action.id);
            state.stats.record_result(&action, self.config.hourly_rate);
            state.push_history(action.clone());
        }

        if action.status == ActionStatus::Completed {
            tracing::info!(action_id = %action.id, "Action completed");
            self.events.publish(&EngineEvent::ActionCompleted {
                action: action.clone(),
                agent_id: ctx.agent_id,
            });
        } else {
            tracing::warn!(
                action_id = %action.id,
                exit_code = action.result.as_ref().map(|r| r.exit_code),
                "Action failed"
            );
            self.events.publish(&EngineEvent::ActionFailed {
                action: action.clone(),
                agent_id: ctx.agent_id,
            });
        }

        Ok(ExecutionOutcome::Executed(action))
    }

    async fn safety_check(&self, action: &AutomatedAction) -> Result<()> {
        let text = action.inspection_text();

        if let Some(checker) = &self.alignment {
            match checker.check_alignment(&text).await {
                Ok(report) if report.aligned => {}
                Ok(report) => {
                    return Err(Error::Alignment(
                        report
                            .reason
                            .unwrap_or_else(|| "action is not aligned with the project vision".into()),
                    ));
                }
                // An unavailable checker blocks rather than waves through.
                Err(e) => {
                    return Err(Error::Alignment(format!("alignment check unavailable: {}", e)));
                }
            }
        }

        if let Some(pattern) = find_dangerous_pattern(&text) {
            return Err(Error::SafetyCheckFailed(format!(
                "action text matches dangerous pattern '{}'",
                pattern
            )));
        }

        Ok(())
    }

    /// Skip reason for `action`, or None when it may execute.
    fn gate(&self, action: &AutomatedAction, ctx: &ExecutionContext) -> Option<SkipReason> {
        let band = self.thresholds().classify(action.confidence);
        if band == ConfidenceBand::BelowMinimum {
            return Some(SkipReason::BelowMinimum);
        }
        if ctx.approved_by.is_some() {
            return None;
        }

        let needs_confirmation = band == ConfidenceBand::NeedsConfirmation
            || action.impact == Impact::High
            || action.requires_confirmation
            || ctx.require_confirmation;
        needs_confirmation.then_some(SkipReason::ConfirmationRequired)
    }

    async fn run_executor(&self, action: &AutomatedAction) -> ExecutionResult {
        let outcome = if self.config.dry_run {
            self.dry_run.execute(action).await
        } else {
            self.executor.execute(action).await
        };
        outcome.unwrap_or_else(|e| {
            tracing::error!(action_id = %action.id, error = %e, "Executor error");
            ExecutionResult::failed(vec![e.to_string()], -1, 0)
        })
    }

    fn rejected(&self, action_id: &str, agent_id: &str, err: Error) -> Error {
        self.lock().stats.rejected += 1;
        tracing::warn!(
            action_id = %action_id,
            code = err.code(),
            error = %err,
            "Action rejected"
        );
        self.events.publish(&EngineEvent::ActionRejected {
            action_id: action_id.to_string(),
            code: err.code(),
            message: err.to_string(),
            agent_id: agent_id.to_string(),
        });
        err
    }

    fn skipped(&self, action: AutomatedAction, reason: SkipReason, agent_id: &str) -> ExecutionOutcome {
        self.lock().stats.skipped += 1;
        tracing::info!(
            action_id = %action.id,
            confidence = action.confidence,
            reason = reason.as_str(),
            "Action skipped"
        );
        self.events.publish(&EngineEvent::ActionSkipped {
            action: action.clone(),
            reason,
            agent_id: agent_id.to_string(),
        });
        ExecutionOutcome::Skipped { action, reason }
    }

    // ------------------------------------------------------------------------
    // Rollback
    // ------------------------------------------------------------------------

    /// Reverse a completed action by replaying its snapshot's commands.
    ///
    /// File contents are never written back automatically; a
    /// `FileRestoreRequested` event is emitted for a human to act on.
    pub async fn rollback(&self, action_id: &str) -> Result<AutomatedAction> {
        let snapshot = {
            let mut state = self.lock();
            let snapshot = state
                .snapshots
                .get(action_id)
                .cloned()
                .ok_or_else(|| Error::NoSnapshot(action_id.to_string()))?;

            let status = state.finished(action_id).map(|a| a.status);
            match status {
                Some(ActionStatus::Completed) => {}
                Some(other) => {
                    return Err(Error::InvalidState(format!(
                        "action {} is {}; only completed actions can be rolled back",
                        action_id,
                        other.as_str()
                    )));
                }
                None => {
                    return Err(Error::InvalidState(format!(
                        "action {} has not finished executing",
                        action_id
                    )));
                }
            }

            if !state.rolling_back.insert(action_id.to_string()) {
                return Err(Error::InvalidState(format!(
                    "rollback of action {} already in progress",
                    action_id
                )));
            }
            snapshot
        };

        tracing::info!(
            action_id = %action_id,
            snapshot_id = %snapshot.id,
            commands = snapshot.commands.len(),
            "Rolling back action"
        );

        let total = snapshot.commands.len();
        for (applied, command) in snapshot.commands.iter().enumerate() {
            let outcome = if self.config.dry_run {
                self.dry_run.run_command(command).await
            } else {
                self.executor.run_command(command).await
            };
            let failure = match outcome {
                Ok(result) if result.is_completed() => None,
                Ok(result) => Some(format!(
                    "command '{}' exited with {}",
                    command, result.exit_code
                )),
                Err(e) => Some(format!("command '{}' failed: {}", command, e)),
            };
            if let Some(reason) = failure {
                self.lock().rolling_back.remove(action_id);
                tracing::error!(
                    action_id = %action_id,
                    applied,
                    total,
                    reason = %reason,
                    "Rollback failed"
                );
                self.events.publish(&EngineEvent::RollbackFailed {
                    action_id: action_id.to_string(),
                    commands_applied: applied,
                    commands_total: total,
                    reason: reason.clone(),
                });
                return Err(Error::Rollback(format!(
                    "{} ({} of {} commands already applied)",
                    reason, applied, total
                )));
            }
        }

        if !snapshot.files.is_empty() {
            self.events.publish(&EngineEvent::FileRestoreRequested {
                action_id: action_id.to_string(),
                snapshot_id: snapshot.id.clone(),
                paths: snapshot.files.keys().cloned().collect(),
            });
        }

        let reverted = {
            let mut state = self.lock();
            state.rolling_back.remove(action_id);
            let entry = state.finished_mut(action_id);
            let reverted = match entry {
                Some(action) => {
                    action.status = ActionStatus::Reverted;
                    action.clone()
                }
                None => return Err(Error::NotFound(format!("action {}", action_id))),
            };
            state.stats.reverted += 1;
            reverted
        };

        tracing::info!(action_id = %action_id, "Action reverted");
        self.events.publish(&EngineEvent::ActionReverted {
            action_id: action_id.to_string(),
        });
        Ok(reverted)
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Look up an executing or finished action.
    pub fn get_action(&self, action_id: &str) -> Option<AutomatedAction> {
        let state = self.lock();
        state
            .in_flight
            .get(action_id)
            .cloned()
            .or_else(|| state.finished(action_id).cloned())
    }

    /// Finished actions, oldest first.
    pub fn history(&self) -> Vec<AutomatedAction> {
        self.lock().history.clone()
    }

    pub fn snapshot(&self, action_id: &str) -> Option<RollbackSnapshot> {
        self.lock().snapshots.get(action_id).cloned()
    }

    pub fn statistics(&self) -> AutomationStats {
        self.lock().stats.clone()
    }

    /// Load previously persisted history. Non-terminal and already known
    /// actions are ignored. Returns the number imported.
    pub fn import_history(&self, actions: Vec<AutomatedAction>) -> usize {
        let mut state = self.lock();
        let mut imported = 0;
        for action in actions {
            if !action.status.is_terminal() || state.history_index.contains_key(&action.id) {
                continue;
            }
            if action.status == ActionStatus::Reverted {
                state.stats.reverted += 1;
                let mut counted = action.clone();
                counted.status = ActionStatus::Completed;
                state.stats.record_result(&counted, self.config.hourly_rate);
            } else {
                state.stats.record_result(&action, self.config.hourly_rate);
            }
            state.push_history(action);
            imported += 1;
        }
        imported
    }

    pub fn subscribe<F>(
        &self,
        id: impl Into<String>,
        callback: F,
        options: SubscribeOptions<EngineEvent>,
    ) -> Subscription
    where
        F: Fn(&EngineEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.events.subscribe(id, callback, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{ActionTemplate, PredicateMatcher, RegexMatcher};
    use crate::safety::AlignmentReport;
    use async_trait::async_trait;
    use forge_common::ActionKind;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingExecutor {
        executed: Mutex<Vec<String>>,
        commands: Mutex<Vec<String>>,
        fail: bool,
        /// Replay command that exits non-zero
        failing_command: Option<&'static str>,
    }

    #[async_trait]
    impl CommandExecutor for RecordingExecutor {
        async fn execute(&self, action: &AutomatedAction) -> anyhow::Result<ExecutionResult> {
            self.executed.lock().unwrap().push(action.id.clone());
            if self.fail {
                Ok(ExecutionResult::failed(vec!["boom".into()], 1, 5))
            } else {
                Ok(ExecutionResult::completed(vec!["ok".into()], 5))
            }
        }

        async fn run_command(&self, command: &str) -> anyhow::Result<ExecutionResult> {
            self.commands.lock().unwrap().push(command.to_string());
            if self.failing_command.map_or(false, |c| c == command) {
                return Ok(ExecutionResult::failed(vec![], 2, 1));
            }
            Ok(ExecutionResult::completed(vec![], 1))
        }
    }

    struct RejectingChecker;

    #[async_trait]
    impl AlignmentChecker for RejectingChecker {
        async fn check_alignment(&self, _text: &str) -> anyhow::Result<AlignmentReport> {
            Ok(AlignmentReport::misaligned("outside the roadmap"))
        }
    }

    fn engine_with(level: AutomationLevel) -> (AutomationEngine, Arc<RecordingExecutor>) {
        let executor = Arc::new(RecordingExecutor::default());
        let config = AutomationConfig {
            level,
            ..AutomationConfig::default()
        };
        let engine = AutomationEngine::new(config, executor.clone()).unwrap();
        (engine, executor)
    }

    fn action(confidence: f64, impact: Impact) -> AutomatedAction {
        AutomatedAction::new(ActionKind::Fix, "Fix flaky test", confidence).with_impact(impact)
    }

    #[tokio::test]
    async fn test_balanced_mid_confidence_requires_confirmation() {
        let (engine, executor) = engine_with(AutomationLevel::Balanced);
        let outcome = engine
            .execute_action(action(0.6, Impact::Low), ExecutionContext::new())
            .await
            .unwrap();
        assert_eq!(outcome.skip_reason(), Some(SkipReason::ConfirmationRequired));
        assert_eq!(outcome.action().status, ActionStatus::Pending);
        assert!(executor.executed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_maximum_low_impact_executes() {
        let (engine, executor) = engine_with(AutomationLevel::Maximum);
        let outcome = engine
            .execute_action(action(0.6, Impact::Low), ExecutionContext::new())
            .await
            .unwrap();
        assert!(outcome.is_executed());
        assert_eq!(outcome.action().status, ActionStatus::Completed);
        assert_eq!(executor.executed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_below_minimum_is_skipped() {
        let (engine, executor) = engine_with(AutomationLevel::Conservative);
        let outcome = engine
            .execute_action(action(0.69, Impact::Low), ExecutionContext::new())
            .await
            .unwrap();
        assert_eq!(outcome.skip_reason(), Some(SkipReason::BelowMinimum));
        assert!(executor.executed.lock().unwrap().is_empty());
        assert_eq!(engine.statistics().skipped, 1);
    }

    #[tokio::test]
    async fn test_below_minimum_skipped_even_when_approved() {
        let (engine, _) = engine_with(AutomationLevel::Balanced);
        let outcome = engine
            .execute_action(action(0.2, Impact::Low), ExecutionContext::new().approved_by("lead"))
            .await
            .unwrap();
        assert_eq!(outcome.skip_reason(), Some(SkipReason::BelowMinimum));
    }

    #[tokio::test]
    async fn test_high_impact_requires_confirmation_until_approved() {
        let (engine, _) = engine_with(AutomationLevel::Maximum);
        let a = action(0.99, Impact::High);
        let first = engine
            .execute_action(a.clone(), ExecutionContext::new())
            .await
            .unwrap();
        assert_eq!(first.skip_reason(), Some(SkipReason::ConfirmationRequired));

        let second = engine
            .execute_action(a, ExecutionContext::new().approved_by("lead"))
            .await
            .unwrap();
        assert!(second.is_executed());
    }

    #[tokio::test]
    async fn test_caller_requested_confirmation() {
        let (engine, _) = engine_with(AutomationLevel::Maximum);
        let outcome = engine
            .execute_action(action(0.99, Impact::Low), ExecutionContext::new().requiring_confirmation())
            .await
            .unwrap();
        assert_eq!(outcome.skip_reason(), Some(SkipReason::ConfirmationRequired));
    }

    #[tokio::test]
    async fn test_validation_rejects_out_of_range_confidence() {
        let (engine, _) = engine_with(AutomationLevel::Balanced);
        let err = engine
            .execute_action(action(1.5, Impact::Low), ExecutionContext::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert_eq!(engine.statistics().rejected, 1);
    }

    #[tokio::test]
    async fn test_dangerous_command_rejected() {
        let (engine, executor) = engine_with(AutomationLevel::Maximum);
        let a = action(0.99, Impact::Low).with_command("git push --force origin main");
        let err = engine
            .execute_action(a, ExecutionContext::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SAFETY_CHECK_FAILED");
        assert!(executor.executed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_safety_checks_can_be_disabled() {
        let executor = Arc::new(RecordingExecutor::default());
        let config = AutomationConfig {
            level: AutomationLevel::Maximum,
            safety_checks_enabled: false,
            ..AutomationConfig::default()
        };
        let engine = AutomationEngine::new(config, executor).unwrap();
        let a = action(0.99, Impact::Low).with_command("rm -rf ./build");
        assert!(engine
            .execute_action(a, ExecutionContext::new())
            .await
            .unwrap()
            .is_executed());
    }

    #[tokio::test]
    async fn test_alignment_rejection() {
        let (engine, _) = engine_with(AutomationLevel::Maximum);
        let engine = engine.with_alignment_checker(Arc::new(RejectingChecker));
        let err = engine
            .execute_action(action(0.99, Impact::Low), ExecutionContext::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ALIGNMENT_ERROR");
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_trailing_window() {
        let executor = Arc::new(RecordingExecutor::default());
        let config = AutomationConfig {
            level: AutomationLevel::Maximum,
            max_actions_per_minute: 2,
            ..AutomationConfig::default()
        };
        let engine = AutomationEngine::new(config, executor).unwrap();

        for _ in 0..2 {
            engine
                .execute_action(action(0.9, Impact::Low), ExecutionContext::new())
                .await
                .unwrap();
        }
        let err = engine
            .execute_action(action(0.9, Impact::Low), ExecutionContext::new())
            .await
            .unwrap_err();
        assert!(err.is_rate_limited());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(engine
            .execute_action(action(0.9, Impact::Low), ExecutionContext::new())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_action_id_rejected() {
        let (engine, _) = engine_with(AutomationLevel::Maximum);
        let a = action(0.9, Impact::Low).with_id("dup");
        engine
            .execute_action(a.clone(), ExecutionContext::new())
            .await
            .unwrap();
        let err = engine
            .execute_action(a, ExecutionContext::new())
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_imported_action_id_rejected() {
        let (engine, _) = engine_with(AutomationLevel::Maximum);
        let mut done = action(0.9, Impact::Low).with_id("old");
        done.status = ActionStatus::Completed;
        assert_eq!(engine.import_history(vec![done.clone(), done]), 1);
        assert_eq!(engine.get_action("old").unwrap().status, ActionStatus::Completed);

        let err = engine
            .execute_action(action(0.9, Impact::Low).with_id("old"), ExecutionContext::new())
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(engine.history().len(), 1);
    }

    #[tokio::test]
    async fn test_executor_failure_is_not_an_error() {
        let executor = Arc::new(RecordingExecutor {
            fail: true,
            ..RecordingExecutor::default()
        });
        let config = AutomationConfig {
            level: AutomationLevel::Maximum,
            ..AutomationConfig::default()
        };
        let engine = AutomationEngine::new(config, executor).unwrap();
        let outcome = engine
            .execute_action(action(0.9, Impact::Low), ExecutionContext::new())
            .await
            .unwrap();
        assert_eq!(outcome.action().status, ActionStatus::Failed);
        let stats = engine.statistics();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.success_rate, 0.0);
    }

    #[tokio::test]
    async fn test_statistics_track_savings() {
        let (engine, _) = engine_with(AutomationLevel::Maximum);
        let optimize = AutomatedAction::new(ActionKind::Optimize, "Cache deps", 0.9)
            .with_impact(Impact::Low);
        engine
            .execute_action(optimize, ExecutionContext::new())
            .await
            .unwrap();
        let stats = engine.statistics();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.performance_gains, 1);
        assert_eq!(stats.time_saved_minutes, 30.0);
        assert!((stats.cost_saved - 37.5).abs() < 1e-9);
        assert_eq!(stats.success_rate, 1.0);
    }

    #[tokio::test]
    async fn test_dry_run_never_calls_executor() {
        let executor = Arc::new(RecordingExecutor::default());
        let config = AutomationConfig {
            level: AutomationLevel::Maximum,
            dry_run: true,
            ..AutomationConfig::default()
        };
        let engine = AutomationEngine::new(config, executor.clone()).unwrap();
        let outcome = engine
            .execute_action(action(0.9, Impact::Low), ExecutionContext::new())
            .await
            .unwrap();
        assert_eq!(outcome.action().status, ActionStatus::Completed);
        assert!(executor.executed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rollback_replays_commands() {
        let (engine, executor) = engine_with(AutomationLevel::Maximum);
        let a = action(0.9, Impact::Low).with_id("a1");
        let ctx = ExecutionContext::new()
            .with_state(json!({ "version": "1.2.0" }))
            .with_rollback_command("git revert --no-edit HEAD");
        engine.execute_action(a, ctx).await.unwrap();
        assert_eq!(engine.snapshot("a1").unwrap().action_id, "a1");

        let reverted = engine.rollback("a1").await.unwrap();
        assert_eq!(reverted.status, ActionStatus::Reverted);
        assert_eq!(
            *executor.commands.lock().unwrap(),
            vec!["git revert --no-edit HEAD".to_string()]
        );
        assert_eq!(engine.statistics().reverted, 1);

        // A reverted action cannot be rolled back again.
        assert_eq!(engine.rollback("a1").await.unwrap_err().code(), "INVALID_STATE");
    }

    #[tokio::test]
    async fn test_rollback_without_snapshot() {
        let (engine, _) = engine_with(AutomationLevel::Maximum);
        assert_eq!(engine.rollback("missing").await.unwrap_err().code(), "NO_SNAPSHOT");
    }

    #[tokio::test]
    async fn test_rollback_of_failed_action_rejected() {
        let executor = Arc::new(RecordingExecutor {
            fail: true,
            ..RecordingExecutor::default()
        });
        let config = AutomationConfig {
            level: AutomationLevel::Maximum,
            ..AutomationConfig::default()
        };
        let engine = AutomationEngine::new(config, executor).unwrap();
        engine
            .execute_action(action(0.9, Impact::Low).with_id("f1"), ExecutionContext::new())
            .await
            .unwrap();
        assert_eq!(engine.rollback("f1").await.unwrap_err().code(), "INVALID_STATE");
    }

    #[tokio::test]
    async fn test_partial_rollback_reports_applied_commands() {
        let executor = Arc::new(RecordingExecutor {
            failing_command: Some("npm ci"),
            ..RecordingExecutor::default()
        });
        let config = AutomationConfig {
            level: AutomationLevel::Maximum,
            ..AutomationConfig::default()
        };
        let engine = AutomationEngine::new(config, executor.clone()).unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _sub = engine.subscribe(
            "rollback",
            move |event: &EngineEvent| {
                if let EngineEvent::RollbackFailed {
                    commands_applied,
                    commands_total,
                    ..
                } = event
                {
                    tx.send((*commands_applied, *commands_total))?;
                }
                Ok(())
            },
            SubscribeOptions::new(),
        );

        let ctx = ExecutionContext::new()
            .with_rollback_command("git checkout package-lock.json")
            .with_rollback_command("npm ci")
            .with_rollback_command("npm test");
        engine
            .execute_action(action(0.9, Impact::Low).with_id("p1"), ctx)
            .await
            .unwrap();

        let err = engine.rollback("p1").await.unwrap_err();
        assert_eq!(err.code(), "ROLLBACK_ERROR");
        assert!(err.to_string().contains("1 of 3 commands already applied"));
        assert_eq!(executor.commands.lock().unwrap().len(), 2);
        assert_eq!(engine.get_action("p1").unwrap().status, ActionStatus::Completed);

        let progress = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(progress, (1, 3));
    }

    #[tokio::test]
    async fn test_rollback_surfaces_file_restore() {
        let (engine, _) = engine_with(AutomationLevel::Maximum);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _sub = engine.subscribe(
            "files",
            move |event: &EngineEvent| {
                if let EngineEvent::FileRestoreRequested { paths, .. } = event {
                    tx.send(paths.clone())?;
                }
                Ok(())
            },
            SubscribeOptions::new(),
        );

        let ctx = ExecutionContext::new().with_file("Cargo.toml", "[package]\nname = \"app\"\n");
        engine
            .execute_action(action(0.9, Impact::Low).with_id("f2"), ctx)
            .await
            .unwrap();
        engine.rollback("f2").await.unwrap();

        let paths = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(paths, vec!["Cargo.toml".to_string()]);
    }

    #[tokio::test]
    async fn test_no_snapshot_when_rollback_disabled() {
        let executor = Arc::new(RecordingExecutor::default());
        let config = AutomationConfig {
            level: AutomationLevel::Maximum,
            rollback_enabled: false,
            ..AutomationConfig::default()
        };
        let engine = AutomationEngine::new(config, executor).unwrap();
        engine
            .execute_action(action(0.9, Impact::Low).with_id("n1"), ExecutionContext::new())
            .await
            .unwrap();
        assert!(engine.snapshot("n1").is_none());
        assert_eq!(engine.rollback("n1").await.unwrap_err().code(), "NO_SNAPSHOT");
    }

    #[tokio::test]
    async fn test_analyze_situation_sorts_stably() {
        let (engine, _) = engine_with(AutomationLevel::Balanced);
        let always = |id: &str, confidence: f64| {
            AutomationRule::new(
                id,
                PredicateMatcher::new("always", |_| true),
                ActionTemplate::new(ActionKind::Fix, format!("rule {}", id), confidence),
            )
        };
        engine.add_rule(always("first", 0.6)).unwrap();
        engine.add_rule(always("second", 0.9)).unwrap();
        engine.add_rule(always("third", 0.6)).unwrap();
        engine
            .add_rule(AutomationRule::new(
                "never",
                RegexMatcher::new("never-matches-anything").unwrap(),
                ActionTemplate::new(ActionKind::Fix, "nope", 1.0),
            ))
            .unwrap();

        let candidates = engine.analyze_situation(&json!({ "ci": "red" }));
        let rules: Vec<_> = candidates
            .iter()
            .map(|a| a.source_rule.clone().unwrap())
            .collect();
        assert_eq!(rules, vec!["second", "first", "third"]);
    }

    #[tokio::test]
    async fn test_hourly_cap_skips_rule() {
        let (engine, _) = engine_with(AutomationLevel::Maximum);
        engine
            .add_rule(
                AutomationRule::new(
                    "deps",
                    PredicateMatcher::new("always", |_| true),
                    ActionTemplate::new(ActionKind::Update, "Bump deps", 0.9)
                        .with_impact(Impact::Low),
                )
                .with_hourly_cap(1),
            )
            .unwrap();

        let candidate = engine.analyze_situation(&json!({})).remove(0);
        engine
            .execute_action(candidate, ExecutionContext::new())
            .await
            .unwrap();
        assert!(engine.analyze_situation(&json!({})).is_empty());

        let rule = engine.rules().remove(0);
        let err = engine
            .execute_action(rule.candidate(), ExecutionContext::new())
            .await
            .unwrap_err();
        assert!(err.is_rate_limited());
    }

    #[tokio::test]
    async fn test_duplicate_rule_rejected_and_removal() {
        let (engine, _) = engine_with(AutomationLevel::Balanced);
        let rule = AutomationRule::new(
            "r1",
            PredicateMatcher::new("always", |_| true),
            ActionTemplate::new(ActionKind::Fix, "Fix", 0.9),
        );
        engine.add_rule(rule.clone()).unwrap();
        assert!(engine.add_rule(rule).unwrap_err().is_validation());
        assert!(engine.remove_rule("r1"));
        assert!(!engine.remove_rule("r1"));
        assert!(engine.rules().is_empty());
    }

    #[tokio::test]
    async fn test_set_level_changes_gate() {
        let (engine, _) = engine_with(AutomationLevel::Balanced);
        engine.set_level(AutomationLevel::Maximum);
        assert_eq!(engine.level(), AutomationLevel::Maximum);
        assert_eq!(engine.thresholds().caution, 0.30);
    }

    #[test]
    fn test_invalid_threshold_override_rejected() {
        let mut config = AutomationConfig::default();
        config.thresholds.insert(
            AutomationLevel::Balanced,
            ConfidenceThresholds::new(0.8, 0.7, 0.9),
        );
        let result = AutomationEngine::new(config, Arc::new(DryRunExecutor));
        assert!(result.is_err());
    }
}

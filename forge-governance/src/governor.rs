//! Wires the four components together.
//!
//! ```text
//! propose ─► engine ─┬─ executed ───────────────► activity + state + metrics
//!                    ├─ below minimum ──────────► activity
//!                    └─ confirmation required ──► approval queue (parked)
//!                                                   │
//!          approve ─► engine (approved_by) ◄────────┘
//!          reject / cancel / timeout ─► parked action dropped
//! ```
//!
//! An approved action the rate limiter turns away stays parked under its
//! approval id; calling [`Governor::approve`] again resumes it.
//!
//! The engine never talks to the queue directly; the governor owns the
//! round-trip.

use forge_common::{Error, GovernanceConfig, Result};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::action::{ActionStatus, AutomatedAction};
use crate::activity::{ActivityRecorder, ActivityType, Importance, NewActivity};
use crate::approval::{
    ApprovalEvent, ApprovalQueue, ApprovalRequest, ApprovalStatus, NewApproval, RiskLevel,
};
use crate::broadcaster::{AgentState, AgentStatus, Decision, HealthInputs, StateBroadcaster, StateUpdate};
use crate::engine::{AutomationEngine, ExecutionContext, ExecutionOutcome, SkipReason};
use crate::executor::CommandExecutor;
use crate::metrics::{MetricsTracker, AUTOMATION_SUCCESS_RATE};
use crate::store::SnapshotStore;
use crate::subscription::{SubscribeOptions, Subscription};

/// Result of proposing an action.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Proposal {
    /// The executor ran; check the action status for success.
    Executed { action: AutomatedAction },
    /// Dropped by the confidence gate.
    Skipped {
        action: AutomatedAction,
        reason: SkipReason,
    },
    /// Parked until a human decides.
    AwaitingApproval {
        action: AutomatedAction,
        request: ApprovalRequest,
    },
}

impl Proposal {
    pub fn action(&self) -> &AutomatedAction {
        match self {
            Proposal::Executed { action }
            | Proposal::Skipped { action, .. }
            | Proposal::AwaitingApproval { action, .. } => action,
        }
    }

    pub fn approval_id(&self) -> Option<&str> {
        match self {
            Proposal::AwaitingApproval { request, .. } => Some(&request.id),
            _ => None,
        }
    }
}

/// What [`Governor::restore`] loaded.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RestoreReport {
    pub project_restored: bool,
    pub actions: usize,
    pub approvals: usize,
}

struct Parked {
    action: AutomatedAction,
    context: ExecutionContext,
}

type ParkedMap = Arc<Mutex<HashMap<String, Parked>>>;

fn lock_parked(parked: &ParkedMap) -> MutexGuard<'_, HashMap<String, Parked>> {
    parked.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drop the action parked behind `request`, if it is still there, and
/// unblock its agent.
fn discard(
    parked: &ParkedMap,
    activity: &ActivityRecorder,
    state: &StateBroadcaster,
    request: &ApprovalRequest,
) {
    let Some(entry) = lock_parked(parked).remove(&request.id) else {
        return;
    };
    tracing::info!(
        approval_id = %request.id,
        action_id = %entry.action.id,
        status = request.status.as_str(),
        "Parked action discarded"
    );
    activity.record(
        NewActivity::new(ActivityType::DecisionMade, entry.context.agent_id.clone()).with_data(json!({
            "action_id": entry.action.id,
            "approval_id": request.id,
            "outcome": request.status.as_str(),
            "feedback": request.feedback,
        })),
    );
    let agent_id = entry.context.agent_id;
    if let Err(e) = state.update_agent_state(AgentState::new(agent_id.as_str(), AgentStatus::Idle)) {
        tracing::warn!(agent_id = %agent_id, code = e.code(), error = %e, "Failed to unblock agent");
    }
}

pub struct Governor {
    engine: AutomationEngine,
    approvals: ApprovalQueue,
    state: Arc<StateBroadcaster>,
    activity: Arc<ActivityRecorder>,
    metrics: MetricsTracker,
    store: Option<Arc<dyn SnapshotStore>>,
    parked: ParkedMap,
    approval_watch: Option<Subscription>,
}

impl Governor {
    /// Build every component from `config`. Must be called from within a
    /// Tokio runtime.
    pub fn new(config: &GovernanceConfig, executor: Arc<dyn CommandExecutor>) -> Result<Self> {
        let engine = AutomationEngine::new(config.automation.clone(), executor)?;
        Ok(Self::from_engine(config, engine))
    }

    /// Build around a preconfigured engine, e.g. one with an alignment
    /// checker attached.
    pub fn from_engine(config: &GovernanceConfig, engine: AutomationEngine) -> Self {
        let approvals = ApprovalQueue::new(config.approval.clone());
        let activity = Arc::new(ActivityRecorder::new(config.activity.clone()));
        let state = Arc::new(StateBroadcaster::new(config.state.clone()));
        let parked: ParkedMap = Arc::new(Mutex::new(HashMap::new()));

        // Timeouts resolve without a caller; react to them here.
        let watch_parked = parked.clone();
        let watch_activity = activity.clone();
        let watch_state = state.clone();
        let approval_watch = approvals.subscribe(
            "governor",
            move |event: &ApprovalEvent| {
                if let ApprovalEvent::TimedOut { request }
                | ApprovalEvent::Cancelled { request }
                | ApprovalEvent::Rejected { request } = event
                {
                    discard(&watch_parked, &watch_activity, &watch_state, request);
                }
                Ok(())
            },
            SubscribeOptions::new(),
        );

        Self {
            engine,
            approvals,
            state,
            activity,
            metrics: MetricsTracker::default(),
            store: None,
            parked,
            approval_watch: Some(approval_watch),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn engine(&self) -> &AutomationEngine {
        &self.engine
    }

    pub fn approvals(&self) -> &ApprovalQueue {
        &self.approvals
    }

    pub fn state(&self) -> &StateBroadcaster {
        &self.state
    }

    pub fn activity(&self) -> &ActivityRecorder {
        &self.activity
    }

    pub fn metrics(&self) -> &MetricsTracker {
        &self.metrics
    }

    /// Ids of approval requests with a parked action.
    pub fn parked(&self) -> Vec<String> {
        let mut ids: Vec<_> = lock_parked(&self.parked).keys().cloned().collect();
        ids.sort();
        ids
    }

    // ------------------------------------------------------------------------
    // Decision flow
    // ------------------------------------------------------------------------

    /// Run `action` through the gate, routing it to the approval queue when
    /// confirmation is required.
    pub async fn propose(&self, action: AutomatedAction, ctx: ExecutionContext) -> Result<Proposal> {
        let agent_id = ctx.agent_id.clone();
        let action_id = action.id.clone();

        let outcome = match self.engine.execute_action(action, ctx.clone()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.on_rejected(&action_id, &agent_id, &e);
                return Err(e);
            }
        };

        match outcome {
            ExecutionOutcome::Executed(action) => Ok(self.on_executed(action, &agent_id)),
            ExecutionOutcome::Skipped {
                action,
                reason: SkipReason::BelowMinimum,
            } => {
                self.activity.record(
                    NewActivity::new(ActivityType::DecisionMade, agent_id.as_str())
                        .with_importance(Importance::Low)
                        .with_data(json!({
                            "action_id": action.id,
                            "outcome": "skipped",
                            "reason": SkipReason::BelowMinimum.as_str(),
                            "confidence": action.confidence,
                        })),
                );
                Ok(Proposal::Skipped {
                    action,
                    reason: SkipReason::BelowMinimum,
                })
            }
            ExecutionOutcome::Skipped { action, .. } => self.park(action, ctx),
        }
    }

    fn park(&self, action: AutomatedAction, ctx: ExecutionContext) -> Result<Proposal> {
        let risk = match (action.kind, action.impact) {
            (forge_common::ActionKind::Deploy, forge_common::Impact::High) => RiskLevel::Critical,
            (_, impact) => RiskLevel::from_impact(impact),
        };
        let payload = serde_json::to_value(&action)?;
        let request = self.approvals.request_approval(
            NewApproval::new(format!("{} '{}'", action.kind, action.title))
                .with_payload(payload)
                .with_impact(action.impact)
                .with_risk(risk),
        )?;

        let agent_id = ctx.agent_id.clone();
        lock_parked(&self.parked).insert(
            request.id.clone(),
            Parked {
                action: action.clone(),
                context: ctx,
            },
        );

        tracing::info!(
            action_id = %action.id,
            approval_id = %request.id,
            "Action awaiting approval"
        );
        self.activity.record(
            NewActivity::new(ActivityType::AgentBlocked, agent_id.as_str()).with_data(json!({
                "action_id": action.id,
                "approval_id": request.id,
                "confidence": action.confidence,
            })),
        );
        self.best_effort(
            "agent state",
            self.state.update_agent_state(
                AgentState::new(agent_id, AgentStatus::Blocked).with_task(action.title.clone()),
            ),
        );

        Ok(Proposal::AwaitingApproval { action, request })
    }

    /// Approve a parked action and execute it.
    ///
    /// The request is only decided once a parked action exists for it. If
    /// the approved action is rate limited it stays parked and a later call
    /// resumes it under the recorded approver; any other rejection drops it
    /// and records the failure.
    pub async fn approve(
        &self,
        approval_id: &str,
        approver: &str,
        feedback: Option<String>,
    ) -> Result<Proposal> {
        let request = self
            .approvals
            .get(approval_id)
            .ok_or_else(|| Error::NotFound(format!("approval request {}", approval_id)))?;
        let has_parked = lock_parked(&self.parked).contains_key(approval_id);

        let approver = match request.status {
            ApprovalStatus::Pending if has_parked => {
                self.approvals.approve(approval_id, approver, feedback)?;
                approver.to_string()
            }
            ApprovalStatus::Approved if has_parked => {
                request.approver.unwrap_or_else(|| approver.to_string())
            }
            ApprovalStatus::Pending => {
                return Err(Error::NotFound(format!(
                    "no parked action for approval {}",
                    approval_id
                )));
            }
            other => {
                return Err(Error::InvalidState(format!(
                    "approval request {} is already {}",
                    approval_id,
                    other.as_str()
                )));
            }
        };

        let parked = lock_parked(&self.parked)
            .remove(approval_id)
            .ok_or_else(|| Error::NotFound(format!("no parked action for approval {}", approval_id)))?;

        tracing::info!(
            approval_id = %approval_id,
            action_id = %parked.action.id,
            approver = %approver,
            "Resuming approved action"
        );

        let agent_id = parked.context.agent_id.clone();
        let action_id = parked.action.id.clone();
        let ctx = parked.context.clone().approved_by(approver.as_str());
        match self.engine.execute_action(parked.action.clone(), ctx).await {
            Ok(ExecutionOutcome::Executed(action)) => Ok(self.on_executed(action, &agent_id)),
            Ok(ExecutionOutcome::Skipped { action, reason }) => {
                self.best_effort(
                    "agent state",
                    self.state
                        .update_agent_state(AgentState::new(agent_id.as_str(), AgentStatus::Idle)),
                );
                Ok(Proposal::Skipped { action, reason })
            }
            Err(e) if e.is_rate_limited() => {
                tracing::warn!(
                    approval_id = %approval_id,
                    action_id = %action_id,
                    error = %e,
                    "Approved action deferred"
                );
                self.on_rejected(&action_id, &agent_id, &e);
                lock_parked(&self.parked).insert(approval_id.to_string(), parked);
                Err(e)
            }
            Err(e) => {
                self.on_rejected(&action_id, &agent_id, &e);
                self.activity.record(
                    NewActivity::new(ActivityType::DecisionMade, agent_id.as_str())
                        .with_importance(Importance::High)
                        .with_data(json!({
                            "action_id": action_id,
                            "approval_id": approval_id,
                            "outcome": "failed",
                            "code": e.code(),
                        })),
                );
                self.best_effort(
                    "agent state",
                    self.state
                        .update_agent_state(AgentState::new(agent_id.as_str(), AgentStatus::Failed)),
                );
                Err(e)
            }
        }
    }

    pub fn reject(
        &self,
        approval_id: &str,
        approver: &str,
        feedback: Option<String>,
    ) -> Result<ApprovalRequest> {
        let request = self.approvals.reject(approval_id, approver, feedback)?;
        discard(&self.parked, &self.activity, &self.state, &request);
        Ok(request)
    }

    pub fn cancel(&self, approval_id: &str, reason: Option<String>) -> Result<ApprovalRequest> {
        let request = self.approvals.cancel(approval_id, reason)?;
        discard(&self.parked, &self.activity, &self.state, &request);
        Ok(request)
    }

    pub async fn rollback(&self, action_id: &str) -> Result<AutomatedAction> {
        let action = self.engine.rollback(action_id).await?;
        self.activity.record(
            NewActivity::new(ActivityType::DecisionMade, crate::engine::DEFAULT_AGENT_ID)
                .with_importance(Importance::High)
                .with_data(json!({ "action_id": action.id, "outcome": "reverted" })),
        );
        self.best_effort(
            "decision",
            self.state.record_decision(Decision::new(
                format!("Reverted {} '{}'", action.kind, action.title),
                crate::engine::DEFAULT_AGENT_ID,
            )),
        );
        Ok(action)
    }

    pub fn update_health(&self, inputs: &HealthInputs) -> Result<StateUpdate> {
        self.state.update_health(inputs)
    }

    fn on_executed(&self, action: AutomatedAction, agent_id: &str) -> Proposal {
        let completed = action.status == ActionStatus::Completed;
        let event_type = if completed {
            ActivityType::TaskCompleted
        } else {
            ActivityType::AgentFailed
        };
        self.activity.record(
            NewActivity::new(event_type, agent_id).with_data(json!({
                "action_id": action.id,
                "kind": action.kind,
                "title": action.title,
                "exit_code": action.result.as_ref().map(|r| r.exit_code),
            })),
        );

        self.best_effort(
            "decision",
            self.state.record_decision(
                Decision::new(
                    format!("Executed {} '{}' ({})", action.kind, action.title, action.status.as_str()),
                    agent_id,
                )
                .with_confidence(action.confidence),
            ),
        );
        let status = if completed {
            AgentStatus::Idle
        } else {
            AgentStatus::Failed
        };
        self.best_effort(
            "agent state",
            self.state.update_agent_state(AgentState::new(agent_id, status)),
        );

        self.metrics
            .record(AUTOMATION_SUCCESS_RATE, self.engine.statistics().success_rate);

        Proposal::Executed { action }
    }

    fn on_rejected(&self, action_id: &str, agent_id: &str, err: &Error) {
        let importance = if err.is_safety_rejection() {
            Importance::Critical
        } else {
            Importance::High
        };
        self.activity.record(
            NewActivity::new(ActivityType::Error, agent_id)
                .with_importance(importance)
                .with_data(json!({
                    "action_id": action_id,
                    "code": err.code(),
                    "message": err.to_string(),
                })),
        );
    }

    /// Bookkeeping that must not fail a decision that already happened.
    fn best_effort<T>(&self, what: &str, result: Result<T>) {
        if let Err(e) = result {
            tracing::warn!(what, code = e.code(), error = %e, "State bookkeeping failed");
        }
    }

    // ------------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------------

    fn require_store(&self) -> Result<&Arc<dyn SnapshotStore>> {
        self.store
            .as_ref()
            .ok_or_else(|| Error::Persistence("no snapshot store configured".into()))
    }

    /// Save project state, action history, and approval history.
    pub async fn persist(&self) -> Result<()> {
        let store = self.require_store()?;
        let snapshot = self.state.get_snapshot();
        let actions = self.engine.history();
        let approvals = self.approvals.history();

        store
            .save_project_state(&snapshot)
            .await
            .map_err(|e| Error::Persistence(format!("{:#}", e)))?;
        store
            .save_actions(&actions)
            .await
            .map_err(|e| Error::Persistence(format!("{:#}", e)))?;
        store
            .save_approvals(&approvals)
            .await
            .map_err(|e| Error::Persistence(format!("{:#}", e)))?;

        tracing::info!(
            version = snapshot.version,
            actions = actions.len(),
            approvals = approvals.len(),
            "Governance state persisted"
        );
        Ok(())
    }

    /// Load whatever the store holds. Project state goes through the
    /// broadcaster's validated restore path.
    pub async fn restore(&self) -> Result<RestoreReport> {
        let store = self.require_store()?;
        let project = store
            .load_project_state()
            .await
            .map_err(|e| Error::Persistence(format!("{:#}", e)))?;
        let actions = store
            .load_actions()
            .await
            .map_err(|e| Error::Persistence(format!("{:#}", e)))?;
        let approvals = store
            .load_approvals()
            .await
            .map_err(|e| Error::Persistence(format!("{:#}", e)))?;

        let mut report = RestoreReport::default();
        if let Some(snapshot) = project {
            self.state.restore_from_snapshot(snapshot)?;
            report.project_restored = true;
        }
        report.actions = self.engine.import_history(actions);
        report.approvals = self.approvals.import_history(approvals);

        tracing::info!(
            project = report.project_restored,
            actions = report.actions,
            approvals = report.approvals,
            "Governance state restored"
        );
        Ok(report)
    }
}

impl Drop for Governor {
    fn drop(&mut self) {
        if let Some(watch) = self.approval_watch.take() {
            watch.unsubscribe();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::DryRunExecutor;
    use forge_common::{ActionKind, AutomationLevel, Impact};

    fn governor(level: AutomationLevel) -> Governor {
        let mut config = GovernanceConfig::default();
        config.automation.level = level;
        Governor::new(&config, Arc::new(DryRunExecutor)).unwrap()
    }

    #[tokio::test]
    async fn test_confirmation_parks_action() {
        let g = governor(AutomationLevel::Balanced);
        let action = AutomatedAction::new(ActionKind::Refactor, "Split module", 0.6);
        let proposal = g.propose(action, ExecutionContext::new()).await.unwrap();

        let approval_id = proposal.approval_id().unwrap().to_string();
        assert_eq!(g.parked(), vec![approval_id.clone()]);
        assert_eq!(g.approvals().get_pending(None).len(), 1);
        assert_eq!(
            g.state().state().active_agents[0].status,
            AgentStatus::Blocked
        );

        let resumed = g.approve(&approval_id, "lead", None).await.unwrap();
        assert_eq!(resumed.action().status, ActionStatus::Completed);
        assert!(g.parked().is_empty());
    }

    #[tokio::test]
    async fn test_reject_discards_parked_action() {
        let g = governor(AutomationLevel::Balanced);
        let proposal = g
            .propose(
                AutomatedAction::new(ActionKind::Fix, "Patch", 0.99).with_impact(Impact::High),
                ExecutionContext::new(),
            )
            .await
            .unwrap();
        let approval_id = proposal.approval_id().unwrap().to_string();

        g.reject(&approval_id, "lead", Some("too risky".into())).unwrap();
        assert!(g.parked().is_empty());
        assert_eq!(g.state().state().active_agents[0].status, AgentStatus::Idle);
        assert!(g.engine().history().is_empty());
        assert_eq!(
            g.approve(&approval_id, "lead", None).await.unwrap_err().code(),
            "INVALID_STATE"
        );
    }

    #[tokio::test]
    async fn test_execution_feeds_activity_and_metrics() {
        let g = governor(AutomationLevel::Maximum);
        let action = AutomatedAction::new(ActionKind::Optimize, "Cache deps", 0.9)
            .with_impact(Impact::Low);
        let proposal = g
            .propose(action, ExecutionContext::new().for_agent("builder-1"))
            .await
            .unwrap();
        assert!(matches!(proposal, Proposal::Executed { .. }));

        let perf = g.activity().performance("builder-1").unwrap();
        assert_eq!(perf.tasks_completed, 1);
        assert_eq!(g.state().state().recent_decisions.len(), 1);
        assert_eq!(g.metrics().points()[0].name, AUTOMATION_SUCCESS_RATE);
    }

    #[tokio::test]
    async fn test_rejection_logged_as_error_activity() {
        let g = governor(AutomationLevel::Maximum);
        let action = AutomatedAction::new(ActionKind::Fix, "Reset", 0.9)
            .with_impact(Impact::Low)
            .with_command("git reset --hard origin/main");
        let err = g.propose(action, ExecutionContext::new()).await.unwrap_err();
        assert_eq!(err.code(), "SAFETY_CHECK_FAILED");

        let events = g.activity().events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, ActivityType::Error);
        assert_eq!(events[0].importance, Importance::Critical);
    }

    #[tokio::test]
    async fn test_persist_requires_store() {
        let g = governor(AutomationLevel::Balanced);
        assert_eq!(g.persist().await.unwrap_err().code(), "PERSISTENCE_ERROR");
    }
}

//! Canonical project state and its update fan-out.
//!
//! All mutation goes through one validate-then-commit path: the patch is
//! merged into a copy of the current state, the whole copy is validated, and
//! only then swapped in with a version bump. Updates are published while the
//! state lock is held so every subscriber sees commits in version order.

use chrono::{DateTime, Utc};
use forge_common::{
    Error, Impact, Result, StateConfig, Validate, ValidationError, ValidationResult, Validator,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use crate::subscription::{SubscribeOptions, SubscriberList, Subscription};

// ============================================================================
// Project state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectPhase {
    Planning,
    Development,
    Testing,
    Review,
    Deployment,
    Maintenance,
}

impl Default for ProjectPhase {
    fn default() -> Self {
        ProjectPhase::Planning
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blocker {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub severity: Impact,
    #[serde(default)]
    pub agent_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,
    pub summary: String,
    pub made_by: String,
    #[serde(default)]
    pub confidence: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl Decision {
    pub fn new(summary: impl Into<String>, made_by: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            summary: summary.into(),
            made_by: made_by.into(),
            confidence: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Working,
    Blocked,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub agent_id: String,
    pub status: AgentStatus,
    #[serde(default)]
    pub current_task: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl AgentState {
    pub fn new(agent_id: impl Into<String>, status: AgentStatus) -> Self {
        Self {
            agent_id: agent_id.into(),
            status,
            current_task: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.current_task = Some(task.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectState {
    #[serde(default)]
    pub phase: ProjectPhase,
    /// Percent complete, 0-100
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub blockers: Vec<Blocker>,
    /// Oldest first
    #[serde(default)]
    pub recent_decisions: Vec<Decision>,
    #[serde(default)]
    pub active_agents: Vec<AgentState>,
    /// Composite health, 0-100
    #[serde(default)]
    pub health_score: f64,
}

impl Default for ProjectState {
    fn default() -> Self {
        Self {
            phase: ProjectPhase::default(),
            progress: 0.0,
            blockers: Vec::new(),
            recent_decisions: Vec::new(),
            active_agents: Vec::new(),
            health_score: 0.0,
        }
    }
}

fn check_unique<'a>(
    v: &mut Validator,
    field: &str,
    ids: impl Iterator<Item = &'a str>,
) {
    let mut seen = HashSet::new();
    for id in ids {
        v.require(field, id);
        if !seen.insert(id) {
            v.push(ValidationError::Conflict {
                reason: format!("duplicate {} '{}'", field, id),
            });
        }
    }
}

impl Validate for ProjectState {
    fn validate(&self) -> ValidationResult<()> {
        let mut v = Validator::new();
        v.in_range("state.progress", self.progress, 0.0, 100.0)
            .in_range("state.health_score", self.health_score, 0.0, 100.0);

        check_unique(&mut v, "blocker.id", self.blockers.iter().map(|b| b.id.as_str()));
        for blocker in &self.blockers {
            v.require("blocker.description", &blocker.description);
        }

        check_unique(
            &mut v,
            "decision.id",
            self.recent_decisions.iter().map(|d| d.id.as_str()),
        );
        for decision in &self.recent_decisions {
            v.require("decision.summary", &decision.summary);
            if let Some(confidence) = decision.confidence {
                v.in_range("decision.confidence", confidence, 0.0, 1.0);
            }
        }

        check_unique(
            &mut v,
            "agent.agent_id",
            self.active_agents.iter().map(|a| a.agent_id.as_str()),
        );

        v.finish()
    }
}

/// Partial update merged field-by-field into the current state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectStatePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<ProjectPhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blockers: Option<Vec<Blocker>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recent_decisions: Option<Vec<Decision>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_agents: Option<Vec<AgentState>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_score: Option<f64>,
}

impl ProjectStatePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(mut self, phase: ProjectPhase) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn health_score(mut self, score: f64) -> Self {
        self.health_score = Some(score);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    fn apply(self, state: &mut ProjectState) {
        if let Some(phase) = self.phase {
            state.phase = phase;
        }
        if let Some(progress) = self.progress {
            state.progress = progress;
        }
        if let Some(blockers) = self.blockers {
            state.blockers = blockers;
        }
        if let Some(decisions) = self.recent_decisions {
            state.recent_decisions = decisions;
        }
        if let Some(agents) = self.active_agents {
            state.active_agents = agents;
        }
        if let Some(score) = self.health_score {
            state.health_score = score;
        }
    }
}

// ============================================================================
// Updates
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateUpdateKind {
    ProjectUpdated,
    BlockerAdded,
    BlockerResolved,
    DecisionRecorded,
    AgentUpdated,
    SnapshotRestored,
}

/// Immutable delta emitted after every accepted mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateUpdate {
    #[serde(rename = "type")]
    pub kind: StateUpdateKind,
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

/// Atomic read of the state with its version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub version: u64,
    pub state: ProjectState,
    pub taken_at: DateTime<Utc>,
}

// ============================================================================
// Health score
// ============================================================================

/// Inputs to the 0-100 health composite.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HealthInputs {
    pub git_clean: bool,
    pub tests_passed: u32,
    pub tests_total: u32,
    /// Governance confidence in [0, 1]
    pub governance_confidence: f64,
    pub remote_synced: bool,
}

impl HealthInputs {
    /// Git hygiene 25, test pass ratio 40, governance confidence 20,
    /// remote sync 15.
    pub fn score(&self) -> f64 {
        let git = if self.git_clean { 25.0 } else { 0.0 };
        let tests = if self.tests_total == 0 {
            0.0
        } else {
            40.0 * (self.tests_passed.min(self.tests_total) as f64 / self.tests_total as f64)
        };
        let confidence = if self.governance_confidence.is_finite() {
            self.governance_confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let remote = if self.remote_synced { 15.0 } else { 0.0 };
        (git + tests + 20.0 * confidence + remote).clamp(0.0, 100.0)
    }
}

// ============================================================================
// Broadcaster
// ============================================================================

struct Inner {
    state: ProjectState,
    version: u64,
}

pub struct StateBroadcaster {
    config: StateConfig,
    inner: Mutex<Inner>,
    subscribers: SubscriberList<StateUpdate>,
}

impl fmt::Debug for StateBroadcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateBroadcaster")
            .field("version", &self.version())
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

impl StateBroadcaster {
    pub fn new(config: StateConfig) -> Self {
        Self::with_state(config, ProjectState::default())
    }

    /// Start from `state` without validating it; the first commit will.
    pub fn with_state(config: StateConfig, state: ProjectState) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner { state, version: 0 }),
            subscribers: SubscriberList::unbounded("state"),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn version(&self) -> u64 {
        self.lock().version
    }

    pub fn state(&self) -> ProjectState {
        self.lock().state.clone()
    }

    /// Merge `patch`, validate the whole result, commit, and emit.
    pub fn update_project_state(&self, patch: ProjectStatePatch) -> Result<StateUpdate> {
        let data = serde_json::to_value(&patch)
            .map_err(|e| Error::StateUpdate(format!("unserializable patch: {}", e)))?;
        self.commit_with(StateUpdateKind::ProjectUpdated, move |state| {
            patch.apply(state);
            Ok(data)
        })
    }

    /// The single commit path. `mutate` works on a copy; the copy replaces
    /// the live state only if it validates.
    fn commit_with<F>(&self, kind: StateUpdateKind, mutate: F) -> Result<StateUpdate>
    where
        F: FnOnce(&mut ProjectState) -> Result<Value>,
    {
        let mut inner = self.lock();
        let mut next = inner.state.clone();
        let data = mutate(&mut next)?;

        if let Err(e) = next.validate() {
            tracing::warn!(kind = ?kind, version = inner.version, error = %e, "State update rejected");
            return Err(e.into());
        }

        inner.state = next;
        inner.version += 1;
        let update = StateUpdate {
            kind,
            version: inner.version,
            timestamp: Utc::now(),
            data,
        };

        tracing::debug!(kind = ?kind, version = update.version, "State committed");
        self.subscribers.publish(&update);
        Ok(update)
    }

    pub fn add_blocker(
        &self,
        description: impl Into<String>,
        severity: Impact,
        agent_id: Option<String>,
    ) -> Result<Blocker> {
        let blocker = Blocker {
            id: Uuid::new_v4().to_string(),
            description: description.into(),
            severity,
            agent_id,
            created_at: Utc::now(),
        };
        let added = blocker.clone();
        self.commit_with(StateUpdateKind::BlockerAdded, move |state| {
            let data = serde_json::to_value(&blocker)?;
            state.blockers.push(blocker);
            Ok(data)
        })?;
        Ok(added)
    }

    pub fn resolve_blocker(&self, blocker_id: &str) -> Result<Blocker> {
        let mut resolved = None;
        self.commit_with(StateUpdateKind::BlockerResolved, |state| {
            let index = state
                .blockers
                .iter()
                .position(|b| b.id == blocker_id)
                .ok_or_else(|| Error::NotFound(format!("blocker {}", blocker_id)))?;
            let blocker = state.blockers.remove(index);
            let data = serde_json::to_value(&blocker)?;
            resolved = Some(blocker);
            Ok(data)
        })?;
        resolved.ok_or_else(|| Error::NotFound(format!("blocker {}", blocker_id)))
    }

    /// Append a decision, keeping only the most recent ones.
    pub fn record_decision(&self, decision: Decision) -> Result<StateUpdate> {
        let cap = self.config.max_recent_decisions.max(1);
        self.commit_with(StateUpdateKind::DecisionRecorded, move |state| {
            let data = serde_json::to_value(&decision)?;
            state.recent_decisions.push(decision);
            let excess = state.recent_decisions.len().saturating_sub(cap);
            state.recent_decisions.drain(..excess);
            Ok(data)
        })
    }

    /// Insert or replace the state of one agent.
    pub fn update_agent_state(&self, agent: AgentState) -> Result<StateUpdate> {
        self.commit_with(StateUpdateKind::AgentUpdated, move |state| {
            let data = serde_json::to_value(&agent)?;
            match state
                .active_agents
                .iter_mut()
                .find(|a| a.agent_id == agent.agent_id)
            {
                Some(existing) => *existing = agent,
                None => state.active_agents.push(agent),
            }
            Ok(data)
        })
    }

    /// Recompute the health score from repository and test inputs.
    pub fn update_health(&self, inputs: &HealthInputs) -> Result<StateUpdate> {
        self.update_project_state(ProjectStatePatch::new().health_score(inputs.score()))
    }

    pub fn get_snapshot(&self) -> StateSnapshot {
        let inner = self.lock();
        StateSnapshot {
            version: inner.version,
            state: inner.state.clone(),
            taken_at: Utc::now(),
        }
    }

    /// Replace the whole state. The version keeps increasing; it never
    /// rewinds to the snapshot's version.
    pub fn restore_from_snapshot(&self, snapshot: StateSnapshot) -> Result<StateUpdate> {
        let restored_from = snapshot.version;
        self.commit_with(StateUpdateKind::SnapshotRestored, move |state| {
            *state = snapshot.state;
            Ok(json!({ "restored_from_version": restored_from }))
        })
    }

    /// Register a durable callback. Filters run before debouncing.
    pub fn subscribe<F>(
        &self,
        id: impl Into<String>,
        callback: F,
        options: SubscribeOptions<StateUpdate>,
    ) -> Subscription
    where
        F: Fn(&StateUpdate) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribers.subscribe(id, callback, options)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

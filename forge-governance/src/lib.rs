//! Forge Governance - automation governance engine.
//!
//! Decides whether automated actions may run, routes the uncertain ones
//! through human approval, and keeps a versioned view of project state and
//! an activity log for observers.
//!
//! ## Components
//!
//! - [`AutomationEngine`]: confidence gate, safety checks, execution,
//!   rollback snapshots, rule matching, and automation statistics
//! - [`ApprovalQueue`]: human-in-the-loop requests with timeouts
//! - [`StateBroadcaster`]: versioned project state with ordered updates
//! - [`ActivityRecorder`]: capped, filterable activity log with per-agent
//!   performance
//! - [`Governor`]: wires the above together
//!
//! ## Example
//!
//! ```no_run
//! use forge_common::{ActionKind, GovernanceConfig};
//! use forge_governance::{AutomatedAction, DryRunExecutor, ExecutionContext, Governor};
//! use std::sync::Arc;
//!
//! # async fn run() -> forge_common::Result<()> {
//! let governor = Governor::new(&GovernanceConfig::default(), Arc::new(DryRunExecutor))?;
//! let action = AutomatedAction::new(ActionKind::Fix, "Fix flaky test", 0.9);
//! let proposal = governor.propose(action, ExecutionContext::new()).await?;
//! if let Some(id) = proposal.approval_id() {
//!     governor.approve(id, "lead", None).await?;
//! }
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod action;
pub mod activity;
pub mod approval;
pub mod broadcaster;
pub mod engine;
pub mod executor;
pub mod governor;
pub mod metrics;
pub mod rules;
pub mod safety;
pub mod store;
pub mod subscription;

pub use action::{ActionStatus, AutomatedAction, RollbackSnapshot};
pub use activity::{
    ActivityCategory, ActivityEvent, ActivityFilter, ActivityRecorder, ActivityStatistics,
    ActivityType, AgentPerformance, EngagementMode, Importance, NewActivity,
};
pub use approval::{
    ApprovalContext, ApprovalEvent, ApprovalQueue, ApprovalRequest, ApprovalStats, ApprovalStatus,
    NewApproval, RiskLevel,
};
pub use broadcaster::{
    AgentState, AgentStatus, Blocker, Decision, HealthInputs, ProjectPhase, ProjectState,
    ProjectStatePatch, StateBroadcaster, StateSnapshot, StateUpdate, StateUpdateKind,
};
pub use engine::{
    AutomationEngine, AutomationStats, EngineEvent, ExecutionContext, ExecutionOutcome, SkipReason,
};
pub use executor::{CommandExecutor, DryRunExecutor, ExecutionResult, ExecutionStatus, ShellExecutor};
pub use governor::{Governor, Proposal, RestoreReport};
pub use metrics::{MetricPoint, MetricQuery, MetricsReport, MetricsTracker, Trend, TrendDirection};
pub use rules::{ActionTemplate, AutomationRule, PredicateMatcher, RegexMatcher, RuleMatcher};
pub use safety::{AlignmentChecker, AlignmentReport};
pub use store::{MemoryStore, SnapshotStore, SqliteStore};
pub use subscription::{SubscribeOptions, Subscription};

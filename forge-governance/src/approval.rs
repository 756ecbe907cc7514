//! Approval queue for actions that need a human decision.
//!
//! ```text
//! request_approval ─► pending ─┬─► approved
//!                              ├─► rejected
//!                              ├─► timeout    (timer only)
//!                              └─► cancelled
//! ```
//!
//! Every terminal state is absorbing. Each pending request owns one timer
//! task; the timer is aborted on any terminal transition and re-checks the
//! status under the lock before expiring a request, so a late timer is a
//! no-op.

use chrono::{DateTime, Utc};
use forge_common::{ApprovalConfig, Error, Impact, Result, Validator};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::subscription::{SubscribeOptions, SubscriberList, Subscription};

/// Risk level attached to an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn from_impact(impact: Impact) -> Self {
        match impact {
            Impact::Low => RiskLevel::Low,
            Impact::Medium => RiskLevel::Medium,
            Impact::High => RiskLevel::High,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Timeout,
    Cancelled,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
            ApprovalStatus::Timeout => "timeout",
            ApprovalStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }
}

/// What the human is asked to decide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalContext {
    /// Human-readable decision description
    pub decision: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub context: ApprovalContext,
    pub impact: Impact,
    pub risk: RiskLevel,
    /// Role that must decide; None means anyone
    #[serde(default)]
    pub required_approver: Option<String>,
    pub timeout_minutes: u64,
    pub status: ApprovalStatus,
    #[serde(default)]
    pub approver: Option<String>,
    #[serde(default)]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub feedback: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ApprovalRequest {
    fn visible_to(&self, approver: Option<&str>) -> bool {
        match (&self.required_approver, approver) {
            (None, _) => true,
            (Some(_), None) => true,
            (Some(required), Some(approver)) => required == approver,
        }
    }
}

/// Input to [`ApprovalQueue::request_approval`].
#[derive(Debug, Clone)]
pub struct NewApproval {
    pub decision: String,
    pub payload: Value,
    pub impact: Impact,
    pub risk: Option<RiskLevel>,
    pub required_approver: Option<String>,
    pub timeout_minutes: Option<u64>,
}

impl NewApproval {
    pub fn new(decision: impl Into<String>) -> Self {
        Self {
            decision: decision.into(),
            payload: Value::Null,
            impact: Impact::default(),
            risk: None,
            required_approver: None,
            timeout_minutes: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_impact(mut self, impact: Impact) -> Self {
        self.impact = impact;
        self
    }

    pub fn with_risk(mut self, risk: RiskLevel) -> Self {
        self.risk = Some(risk);
        self
    }

    pub fn with_required_approver(mut self, role: impl Into<String>) -> Self {
        self.required_approver = Some(role.into());
        self
    }

    pub fn with_timeout_minutes(mut self, minutes: u64) -> Self {
        self.timeout_minutes = Some(minutes);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApprovalEvent {
    Requested { request: ApprovalRequest },
    Approved { request: ApprovalRequest },
    Rejected { request: ApprovalRequest },
    TimedOut { request: ApprovalRequest },
    Cancelled { request: ApprovalRequest },
}

impl ApprovalEvent {
    pub fn request(&self) -> &ApprovalRequest {
        match self {
            ApprovalEvent::Requested { request }
            | ApprovalEvent::Approved { request }
            | ApprovalEvent::Rejected { request }
            | ApprovalEvent::TimedOut { request }
            | ApprovalEvent::Cancelled { request } => request,
        }
    }

    fn for_transition(request: ApprovalRequest) -> Self {
        match request.status {
            ApprovalStatus::Pending => ApprovalEvent::Requested { request },
            ApprovalStatus::Approved => ApprovalEvent::Approved { request },
            ApprovalStatus::Rejected => ApprovalEvent::Rejected { request },
            ApprovalStatus::Timeout => ApprovalEvent::TimedOut { request },
            ApprovalStatus::Cancelled => ApprovalEvent::Cancelled { request },
        }
    }
}

/// Queue statistics over the rolling decision window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApprovalStats {
    pub pending: usize,
    /// Decisions in the rolling window
    pub decided: usize,
    /// approved / decided within the window
    pub approval_rate: f64,
    pub avg_response_ms: f64,
}

#[derive(Debug, Clone, Copy)]
struct DecisionSample {
    approved: bool,
    response_ms: u64,
}

struct QueueState {
    /// Insertion order
    requests: Vec<ApprovalRequest>,
    opened_at: HashMap<String, Instant>,
    timers: HashMap<String, JoinHandle<()>>,
    samples: VecDeque<DecisionSample>,
}

impl QueueState {
    fn find_mut(&mut self, id: &str) -> Option<&mut ApprovalRequest> {
        self.requests.iter_mut().find(|r| r.id == id)
    }

    fn stop_timer(&mut self, id: &str) {
        if let Some(timer) = self.timers.remove(id) {
            timer.abort();
        }
    }
}

struct Shared {
    config: ApprovalConfig,
    state: Mutex<QueueState>,
    events: SubscriberList<ApprovalEvent>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Timer callback. No-op unless the request is still pending.
    fn expire(&self, id: &str) {
        let expired = {
            let mut state = self.lock();
            state.timers.remove(id);
            state.opened_at.remove(id);
            match state.find_mut(id) {
                Some(request) if request.status == ApprovalStatus::Pending => {
                    request.status = ApprovalStatus::Timeout;
                    request.decided_at = Some(Utc::now());
                    request.feedback = Some(format!(
                        "Request timed out after {} minute(s) without a decision",
                        request.timeout_minutes
                    ));
                    Some(request.clone())
                }
                _ => None,
            }
        };

        if let Some(request) = expired {
            tracing::warn!(
                approval_id = %request.id,
                timeout_minutes = request.timeout_minutes,
                "Approval request timed out"
            );
            self.events.publish(&ApprovalEvent::TimedOut { request });
        }
    }
}

/// Holds pending and decided approval requests.
#[derive(Clone)]
pub struct ApprovalQueue {
    shared: Arc<Shared>,
}

impl fmt::Debug for ApprovalQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApprovalQueue")
            .field("config", &self.shared.config)
            .finish()
    }
}

impl ApprovalQueue {
    pub fn new(config: ApprovalConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(QueueState {
                    requests: Vec::new(),
                    opened_at: HashMap::new(),
                    timers: HashMap::new(),
                    samples: VecDeque::new(),
                }),
                events: SubscriberList::unbounded("approval"),
            }),
        }
    }

    /// Open a new pending request and start its timeout timer.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn request_approval(&self, new: NewApproval) -> Result<ApprovalRequest> {
        let timeout_minutes = new
            .timeout_minutes
            .unwrap_or(self.shared.config.default_timeout_minutes);
        Validator::new()
            .require("approval.decision", &new.decision)
            .check(timeout_minutes > 0, "approval.timeout_minutes", "must be greater than 0")
            .finish()?;

        let request = ApprovalRequest {
            id: Uuid::new_v4().to_string(),
            context: ApprovalContext {
                decision: new.decision,
                payload: new.payload,
            },
            impact: new.impact,
            risk: new.risk.unwrap_or_else(|| RiskLevel::from_impact(new.impact)),
            required_approver: new.required_approver,
            timeout_minutes,
            status: ApprovalStatus::Pending,
            approver: None,
            decided_at: None,
            feedback: None,
            created_at: Utc::now(),
        };

        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let timer_id = request.id.clone();
        let timeout = Duration::from_secs(timeout_minutes.saturating_mul(60));

        {
            let mut state = self.shared.lock();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(shared) = weak.upgrade() {
                    shared.expire(&timer_id);
                }
            });
            state.timers.insert(request.id.clone(), timer);
            state.opened_at.insert(request.id.clone(), Instant::now());
            state.requests.push(request.clone());
        }

        tracing::info!(
            approval_id = %request.id,
            risk = ?request.risk,
            timeout_minutes,
            required_approver = ?request.required_approver,
            "Approval requested"
        );
        self.shared.events.publish(&ApprovalEvent::Requested {
            request: request.clone(),
        });
        Ok(request)
    }

    pub fn approve(
        &self,
        id: &str,
        approver: &str,
        feedback: Option<String>,
    ) -> Result<ApprovalRequest> {
        self.decide(id, approver, ApprovalStatus::Approved, feedback)
    }

    pub fn reject(
        &self,
        id: &str,
        approver: &str,
        feedback: Option<String>,
    ) -> Result<ApprovalRequest> {
        self.decide(id, approver, ApprovalStatus::Rejected, feedback)
    }

    fn decide(
        &self,
        id: &str,
        approver: &str,
        status: ApprovalStatus,
        feedback: Option<String>,
    ) -> Result<ApprovalRequest> {
        let window = self.shared.config.stats_window;
        let decided = {
            let mut state = self.shared.lock();
            let request = state
                .find_mut(id)
                .ok_or_else(|| Error::NotFound(format!("approval request {}", id)))?;
            if request.status != ApprovalStatus::Pending {
                return Err(Error::InvalidState(format!(
                    "approval request {} is already {}",
                    id,
                    request.status.as_str()
                )));
            }
            if let Some(required) = &request.required_approver {
                if required != approver {
                    return Err(Error::InvalidState(format!(
                        "approval request {} requires approver '{}'",
                        id, required
                    )));
                }
            }

            request.status = status;
            request.approver = Some(approver.to_string());
            request.decided_at = Some(Utc::now());
            request.feedback = feedback;
            let decided = request.clone();

            state.stop_timer(id);
            if let Some(opened) = state.opened_at.remove(id) {
                state.samples.push_back(DecisionSample {
                    approved: status == ApprovalStatus::Approved,
                    response_ms: opened.elapsed().as_millis() as u64,
                });
                while state.samples.len() > window {
                    state.samples.pop_front();
                }
            }
            decided
        };

        tracing::info!(
            approval_id = %id,
            approver = %approver,
            status = decided.status.as_str(),
            "Approval decided"
        );
        self.shared
            .events
            .publish(&ApprovalEvent::for_transition(decided.clone()));
        Ok(decided)
    }

    /// Withdraw a pending request that is no longer needed.
    pub fn cancel(&self, id: &str, reason: Option<String>) -> Result<ApprovalRequest> {
        let cancelled = {
            let mut state = self.shared.lock();
            let request = state
                .find_mut(id)
                .ok_or_else(|| Error::NotFound(format!("approval request {}", id)))?;
            if request.status != ApprovalStatus::Pending {
                return Err(Error::InvalidState(format!(
                    "approval request {} is already {}",
                    id,
                    request.status.as_str()
                )));
            }
            request.status = ApprovalStatus::Cancelled;
            request.decided_at = Some(Utc::now());
            request.feedback = reason;
            let cancelled = request.clone();
            state.stop_timer(id);
            state.opened_at.remove(id);
            cancelled
        };

        tracing::info!(approval_id = %id, "Approval request cancelled");
        self.shared.events.publish(&ApprovalEvent::Cancelled {
            request: cancelled.clone(),
        });
        Ok(cancelled)
    }

    /// Pending requests the given approver may decide, oldest first.
    pub fn get_pending(&self, approver: Option<&str>) -> Vec<ApprovalRequest> {
        self.shared
            .lock()
            .requests
            .iter()
            .filter(|r| r.status == ApprovalStatus::Pending && r.visible_to(approver))
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<ApprovalRequest> {
        self.shared
            .lock()
            .requests
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    /// Requests that reached a terminal state, oldest first.
    pub fn history(&self) -> Vec<ApprovalRequest> {
        self.shared
            .lock()
            .requests
            .iter()
            .filter(|r| r.status.is_terminal())
            .cloned()
            .collect()
    }

    /// Drop terminal requests decided at least `older_than_minutes` ago.
    /// An age beyond what a timestamp can represent matches nothing.
    pub fn clear_completed(&self, older_than_minutes: u64) -> usize {
        let cutoff = i64::try_from(older_than_minutes)
            .ok()
            .and_then(chrono::Duration::try_minutes)
            .and_then(|age| Utc::now().checked_sub_signed(age));
        let Some(cutoff) = cutoff else {
            return 0;
        };
        let mut state = self.shared.lock();
        let before = state.requests.len();
        state.requests.retain(|r| {
            !(r.status.is_terminal() && r.decided_at.map_or(true, |at| at <= cutoff))
        });
        let removed = before - state.requests.len();
        if removed > 0 {
            tracing::debug!(removed, "Cleared completed approval requests");
        }
        removed
    }

    pub fn statistics(&self) -> ApprovalStats {
        let state = self.shared.lock();
        let pending = state
            .requests
            .iter()
            .filter(|r| r.status == ApprovalStatus::Pending)
            .count();
        let decided = state.samples.len();
        if decided == 0 {
            return ApprovalStats {
                pending,
                ..ApprovalStats::default()
            };
        }

        let approved = state.samples.iter().filter(|s| s.approved).count();
        let total_ms: u64 = state.samples.iter().map(|s| s.response_ms).sum();
        ApprovalStats {
            pending,
            decided,
            approval_rate: approved as f64 / decided as f64,
            avg_response_ms: total_ms as f64 / decided as f64,
        }
    }

    /// Load previously persisted terminal requests. Pending requests are
    /// skipped since their timers cannot be resumed faithfully.
    pub fn import_history(&self, requests: Vec<ApprovalRequest>) -> usize {
        let mut state = self.shared.lock();
        let mut imported = 0;
        for request in requests {
            if !request.status.is_terminal() || state.requests.iter().any(|r| r.id == request.id) {
                continue;
            }
            state.requests.push(request);
            imported += 1;
        }
        imported
    }

    pub fn subscribe<F>(
        &self,
        id: impl Into<String>,
        callback: F,
        options: SubscribeOptions<ApprovalEvent>,
    ) -> Subscription
    where
        F: Fn(&ApprovalEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.shared.events.subscribe(id, callback, options)
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let mut state = self.lock();
        for (_, timer) in state.timers.drain() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn queue() -> ApprovalQueue {
        ApprovalQueue::new(ApprovalConfig::default())
    }

    #[tokio::test]
    async fn test_request_defaults() {
        let q = queue();
        let req = q
            .request_approval(NewApproval::new("Deploy v1.2").with_impact(Impact::High))
            .unwrap();
        assert_eq!(req.status, ApprovalStatus::Pending);
        assert_eq!(req.timeout_minutes, 5);
        assert_eq!(req.risk, RiskLevel::High);
        assert_eq!(q.get_pending(None).len(), 1);
    }

    #[tokio::test]
    async fn test_blank_decision_rejected() {
        let err = queue().request_approval(NewApproval::new("  ")).unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_approve_then_reject_fails() {
        let q = queue();
        let req = q.request_approval(NewApproval::new("Bump deps")).unwrap();
        let approved = q.approve(&req.id, "lead", Some("ship it".into())).unwrap();
        assert_eq!(approved.status, ApprovalStatus::Approved);
        assert_eq!(approved.approver.as_deref(), Some("lead"));
        assert!(approved.decided_at.is_some());

        let err = q.reject(&req.id, "lead", None).unwrap_err();
        assert_eq!(err.code(), "INVALID_STATE");
        assert_eq!(q.get(&req.id).unwrap().status, ApprovalStatus::Approved);
    }

    #[tokio::test]
    async fn test_unknown_request_not_found() {
        let err = queue().approve("nope", "lead", None).unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_at_deadline_not_before() {
        let q = queue();
        let req = q
            .request_approval(NewApproval::new("Refactor auth").with_timeout_minutes(1))
            .unwrap();

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(q.get(&req.id).unwrap().status, ApprovalStatus::Pending);

        tokio::time::sleep(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        let expired = q.get(&req.id).unwrap();
        assert_eq!(expired.status, ApprovalStatus::Timeout);
        assert!(!expired.feedback.unwrap_or_default().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_decided_request_never_times_out() {
        let q = queue();
        let req = q
            .request_approval(NewApproval::new("Fix lint").with_timeout_minutes(1))
            .unwrap();
        q.reject(&req.id, "lead", Some("not now".into())).unwrap();

        tokio::time::sleep(Duration::from_secs(120)).await;
        let after = q.get(&req.id).unwrap();
        assert_eq!(after.status, ApprovalStatus::Rejected);
        assert_eq!(after.feedback.as_deref(), Some("not now"));
    }

    #[tokio::test]
    async fn test_cancel_is_distinct_from_reject() {
        let q = queue();
        let req = q.request_approval(NewApproval::new("Update CI")).unwrap();
        let cancelled = q.cancel(&req.id, Some("superseded".into())).unwrap();
        assert_eq!(cancelled.status, ApprovalStatus::Cancelled);
        assert!(cancelled.approver.is_none());
        assert_eq!(q.cancel(&req.id, None).unwrap_err().code(), "INVALID_STATE");
        assert_eq!(q.statistics().decided, 0);
    }

    #[tokio::test]
    async fn test_get_pending_filters_by_approver() {
        let q = queue();
        q.request_approval(NewApproval::new("Anyone")).unwrap();
        q.request_approval(NewApproval::new("Security").with_required_approver("security"))
            .unwrap();

        assert_eq!(q.get_pending(None).len(), 2);
        assert_eq!(q.get_pending(Some("security")).len(), 2);
        let eng = q.get_pending(Some("engineer"));
        assert_eq!(eng.len(), 1);
        assert_eq!(eng[0].context.decision, "Anyone");
    }

    #[tokio::test]
    async fn test_required_approver_enforced() {
        let q = queue();
        let req = q
            .request_approval(NewApproval::new("Rotate keys").with_required_approver("security"))
            .unwrap();
        assert_eq!(q.approve(&req.id, "engineer", None).unwrap_err().code(), "INVALID_STATE");
        assert!(q.approve(&req.id, "security", None).is_ok());
    }

    #[tokio::test]
    async fn test_statistics_window() {
        let q = ApprovalQueue::new(ApprovalConfig {
            stats_window: 3,
            ..ApprovalConfig::default()
        });
        for i in 0..4 {
            let req = q
                .request_approval(NewApproval::new(format!("d{}", i)).with_payload(json!({ "i": i })))
                .unwrap();
            if i == 0 {
                q.reject(&req.id, "lead", None).unwrap();
            } else {
                q.approve(&req.id, "lead", None).unwrap();
            }
        }
        q.request_approval(NewApproval::new("open")).unwrap();

        let stats = q.statistics();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.decided, 3);
        assert_eq!(stats.approval_rate, 1.0);
    }

    #[tokio::test]
    async fn test_clear_completed_keeps_pending() {
        let q = queue();
        let done = q.request_approval(NewApproval::new("done")).unwrap();
        q.approve(&done.id, "lead", None).unwrap();
        let open = q.request_approval(NewApproval::new("open")).unwrap();

        assert_eq!(q.clear_completed(0), 1);
        assert!(q.get(&done.id).is_none());
        assert!(q.get(&open.id).is_some());
        assert!(q.history().is_empty());
    }

    #[tokio::test]
    async fn test_clear_completed_with_huge_age_removes_nothing() {
        let q = queue();
        let done = q.request_approval(NewApproval::new("done")).unwrap();
        q.reject(&done.id, "lead", None).unwrap();

        assert_eq!(q.clear_completed(u64::MAX), 0);
        assert_eq!(q.clear_completed(i64::MAX as u64), 0);
        assert_eq!(q.clear_completed(60), 0);
        assert_eq!(q.history().len(), 1);
    }

    #[tokio::test]
    async fn test_events_emitted_per_transition() {
        let q = queue();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _sub = q.subscribe(
            "ui",
            move |event: &ApprovalEvent| {
                tx.send(event.request().status)?;
                Ok(())
            },
            SubscribeOptions::new(),
        );

        let req = q.request_approval(NewApproval::new("Deploy")).unwrap();
        q.approve(&req.id, "lead", None).unwrap();

        let mut seen = Vec::new();
        for _ in 0..2 {
            seen.push(
                tokio::time::timeout(Duration::from_secs(1), rx.recv())
                    .await
                    .unwrap()
                    .unwrap(),
            );
        }
        assert_eq!(seen, vec![ApprovalStatus::Pending, ApprovalStatus::Approved]);
    }
}

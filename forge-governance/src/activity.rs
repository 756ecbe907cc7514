//! Bounded activity log with derived per-agent performance.
//!
//! Two trimming rules run on every insert:
//! 1. retention: events older than `retention_days` are dropped unless pinned
//! 2. cap: at most `history_cap` events are kept, oldest non-pinned first
//!
//! Pinned events are `ERROR`/`CRITICAL` typed or critical importance, and
//! only when `retain_critical` is on. If pinned events alone exceed the cap
//! the newest of them are kept.

use chrono::{DateTime, Utc};
use forge_common::ActivityConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use crate::subscription::{SubscribeOptions, SubscriberList, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityType {
    AgentStarted,
    AgentCompleted,
    AgentFailed,
    AgentBlocked,
    TaskStarted,
    TaskCompleted,
    DecisionMade,
    Error,
    Critical,
}

impl ActivityType {
    pub fn default_category(&self) -> ActivityCategory {
        match self {
            ActivityType::AgentStarted
            | ActivityType::AgentCompleted
            | ActivityType::TaskStarted
            | ActivityType::TaskCompleted => ActivityCategory::Execution,
            ActivityType::AgentBlocked => ActivityCategory::Communication,
            ActivityType::DecisionMade => ActivityCategory::Decision,
            ActivityType::AgentFailed | ActivityType::Error | ActivityType::Critical => {
                ActivityCategory::Error
            }
        }
    }

    pub fn default_importance(&self) -> Importance {
        match self {
            ActivityType::AgentStarted | ActivityType::TaskStarted => Importance::Low,
            ActivityType::AgentCompleted
            | ActivityType::TaskCompleted
            | ActivityType::DecisionMade => Importance::Medium,
            ActivityType::AgentFailed | ActivityType::AgentBlocked | ActivityType::Error => {
                Importance::High
            }
            ActivityType::Critical => Importance::Critical,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Importance {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityCategory {
    Execution,
    Communication,
    Decision,
    Error,
}

/// Viewer tier gating which events are visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngagementMode {
    Ceo,
    Vp,
    Engineer,
    Builder,
    Founder,
}

impl EngagementMode {
    pub const ALL: [EngagementMode; 5] = [
        EngagementMode::Ceo,
        EngagementMode::Vp,
        EngagementMode::Engineer,
        EngagementMode::Builder,
        EngagementMode::Founder,
    ];

    /// Tiers that see events of `importance` unless told otherwise.
    pub fn default_visibility(importance: Importance) -> BTreeSet<EngagementMode> {
        use EngagementMode::*;
        match importance {
            Importance::Critical | Importance::High => Self::ALL.into_iter().collect(),
            Importance::Medium => [Vp, Engineer, Builder, Founder].into_iter().collect(),
            Importance::Low => [Engineer, Builder].into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: ActivityType,
    pub agent_id: String,
    pub timestamp: DateTime<Utc>,
    pub importance: Importance,
    pub category: ActivityCategory,
    #[serde(default)]
    pub data: Value,
    pub visibility: BTreeSet<EngagementMode>,
}

impl ActivityEvent {
    /// Pinned events survive retention and are evicted last by the cap.
    pub fn is_pinned(&self) -> bool {
        matches!(self.event_type, ActivityType::Error | ActivityType::Critical)
            || self.importance == Importance::Critical
    }

    pub fn visible_to(&self, mode: EngagementMode) -> bool {
        self.visibility.contains(&mode)
    }
}

/// Input to [`ActivityRecorder::record`]. Unset fields take type defaults.
#[derive(Debug, Clone)]
pub struct NewActivity {
    pub event_type: ActivityType,
    pub agent_id: String,
    pub importance: Option<Importance>,
    pub category: Option<ActivityCategory>,
    pub data: Value,
    pub visibility: Option<BTreeSet<EngagementMode>>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl NewActivity {
    pub fn new(event_type: ActivityType, agent_id: impl Into<String>) -> Self {
        Self {
            event_type,
            agent_id: agent_id.into(),
            importance: None,
            category: None,
            data: Value::Null,
            visibility: None,
            timestamp: None,
        }
    }

    pub fn with_importance(mut self, importance: Importance) -> Self {
        self.importance = Some(importance);
        self
    }

    pub fn with_category(mut self, category: ActivityCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn visible_to(mut self, modes: impl IntoIterator<Item = EngagementMode>) -> Self {
        self.visibility = Some(modes.into_iter().collect());
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    fn into_event(self) -> ActivityEvent {
        let importance = self
            .importance
            .unwrap_or_else(|| self.event_type.default_importance());
        ActivityEvent {
            id: Uuid::new_v4().to_string(),
            category: self
                .category
                .unwrap_or_else(|| self.event_type.default_category()),
            visibility: self
                .visibility
                .unwrap_or_else(|| EngagementMode::default_visibility(importance)),
            event_type: self.event_type,
            agent_id: self.agent_id,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            importance,
            data: self.data,
        }
    }
}

/// Derived per-agent metrics, updated incrementally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentPerformance {
    pub agent_id: String,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub success_rate: f64,
    pub blocker_count: u64,
    pub decisions_influenced: u64,
    pub confidence_score: f64,
    pub last_active: DateTime<Utc>,
}

impl AgentPerformance {
    fn new(agent_id: &str, at: DateTime<Utc>) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            tasks_completed: 0,
            tasks_failed: 0,
            success_rate: 0.0,
            blocker_count: 0,
            decisions_influenced: 0,
            confidence_score: 0.0,
            last_active: at,
        }
    }

    fn apply(&mut self, event: &ActivityEvent) {
        match event.event_type {
            ActivityType::TaskCompleted => self.tasks_completed += 1,
            ActivityType::AgentFailed => self.tasks_failed += 1,
            ActivityType::AgentBlocked => self.blocker_count += 1,
            ActivityType::DecisionMade => self.decisions_influenced += 1,
            _ => {}
        }
        let finished = self.tasks_completed + self.tasks_failed;
        self.success_rate = if finished == 0 {
            0.0
        } else {
            self.tasks_completed as f64 / finished as f64
        };
        self.confidence_score = (self.success_rate * 1.2).min(1.0);
        if event.timestamp > self.last_active {
            self.last_active = event.timestamp;
        }
    }
}

/// Query over the retained log. Unset fields do not filter.
#[derive(Debug, Clone, Default)]
pub struct ActivityFilter {
    pub agent_id: Option<String>,
    pub types: Option<Vec<ActivityType>>,
    pub categories: Option<Vec<ActivityCategory>>,
    pub min_importance: Option<Importance>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub visible_to: Option<EngagementMode>,
    /// Keep only the most recent `limit` matches
    pub limit: Option<usize>,
}

impl ActivityFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn types(mut self, types: impl IntoIterator<Item = ActivityType>) -> Self {
        self.types = Some(types.into_iter().collect());
        self
    }

    pub fn categories(mut self, categories: impl IntoIterator<Item = ActivityCategory>) -> Self {
        self.categories = Some(categories.into_iter().collect());
        self
    }

    pub fn min_importance(mut self, importance: Importance) -> Self {
        self.min_importance = Some(importance);
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    pub fn visible_to(mut self, mode: EngagementMode) -> Self {
        self.visible_to = Some(mode);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, event: &ActivityEvent) -> bool {
        self.agent_id.as_ref().map_or(true, |a| &event.agent_id == a)
            && self
                .types
                .as_ref()
                .map_or(true, |t| t.contains(&event.event_type))
            && self
                .categories
                .as_ref()
                .map_or(true, |c| c.contains(&event.category))
            && self.min_importance.map_or(true, |m| event.importance >= m)
            && self.since.map_or(true, |s| event.timestamp >= s)
            && self.until.map_or(true, |u| event.timestamp <= u)
            && self.visible_to.map_or(true, |m| event.visible_to(m))
    }
}

/// Point-in-time statistics over a set of events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivityStatistics {
    pub total: usize,
    pub by_type: BTreeMap<ActivityType, usize>,
    pub by_category: BTreeMap<ActivityCategory, usize>,
    pub by_importance: BTreeMap<Importance, usize>,
    pub by_agent: BTreeMap<String, usize>,
    pub pinned: usize,
    pub first_timestamp: Option<DateTime<Utc>>,
    pub last_timestamp: Option<DateTime<Utc>>,
}

struct RecorderState {
    /// Sorted by timestamp, oldest first
    events: Vec<ActivityEvent>,
    performance: HashMap<String, AgentPerformance>,
}

pub struct ActivityRecorder {
    config: ActivityConfig,
    state: Mutex<RecorderState>,
    stream: SubscriberList<ActivityEvent>,
}

impl ActivityRecorder {
    pub fn new(config: ActivityConfig) -> Self {
        let buffer = config.stream_buffer_size;
        Self {
            config,
            state: Mutex::new(RecorderState {
                events: Vec::new(),
                performance: HashMap::new(),
            }),
            stream: SubscriberList::bounded("activity", buffer),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RecorderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an event, update its agent's performance, trim, and stream it.
    pub fn record(&self, new: NewActivity) -> ActivityEvent {
        let event = new.into_event();
        {
            let mut state = self.lock();
            state
                .performance
                .entry(event.agent_id.clone())
                .or_insert_with(|| AgentPerformance::new(&event.agent_id, event.timestamp))
                .apply(&event);

            let at = state
                .events
                .partition_point(|e| e.timestamp <= event.timestamp);
            state.events.insert(at, event.clone());
            self.trim(&mut state.events, Utc::now());

            // Stream under the lock so subscribers see insertion order.
            self.stream.publish(&event);
        }

        tracing::debug!(
            event_id = %event.id,
            agent_id = %event.agent_id,
            event_type = ?event.event_type,
            "Activity recorded"
        );
        event
    }

    fn trim(&self, events: &mut Vec<ActivityEvent>, now: DateTime<Utc>) {
        let retain_critical = self.config.retain_critical;
        let pinned = |e: &ActivityEvent| retain_critical && e.is_pinned();

        // A window too large to represent has no age cutoff.
        let cutoff = chrono::Duration::try_days(self.config.retention_days)
            .and_then(|window| now.checked_sub_signed(window));
        if let Some(cutoff) = cutoff {
            events.retain(|e| e.timestamp >= cutoff || pinned(e));
        }

        let cap = self.config.history_cap;
        if events.len() <= cap {
            return;
        }

        let (kept_pinned, others): (Vec<_>, Vec<_>) =
            std::mem::take(events).into_iter().partition(|e| pinned(e));

        let evicted;
        if kept_pinned.len() >= cap {
            evicted = others.len() + kept_pinned.len() - cap;
            let skip = kept_pinned.len() - cap;
            *events = kept_pinned.into_iter().skip(skip).collect();
        } else {
            let room = cap - kept_pinned.len();
            let skip = others.len().saturating_sub(room);
            evicted = skip;
            let mut merged = kept_pinned;
            merged.extend(others.into_iter().skip(skip));
            merged.sort_by_key(|e| e.timestamp);
            *events = merged;
        }

        tracing::debug!(evicted, cap, "Activity history trimmed");
    }

    /// Matching events, oldest first.
    pub fn query(&self, filter: &ActivityFilter) -> Vec<ActivityEvent> {
        let state = self.lock();
        let mut matched: Vec<ActivityEvent> = state
            .events
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        drop(state);

        if let Some(limit) = filter.limit {
            let skip = matched.len().saturating_sub(limit);
            matched.drain(..skip);
        }
        matched
    }

    pub fn events(&self) -> Vec<ActivityEvent> {
        self.lock().events.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Statistics over exactly `events`. Never cached.
    pub fn get_statistics(events: &[ActivityEvent]) -> ActivityStatistics {
        let mut stats = ActivityStatistics {
            total: events.len(),
            ..ActivityStatistics::default()
        };
        for event in events {
            *stats.by_type.entry(event.event_type).or_default() += 1;
            *stats.by_category.entry(event.category).or_default() += 1;
            *stats.by_importance.entry(event.importance).or_default() += 1;
            *stats.by_agent.entry(event.agent_id.clone()).or_default() += 1;
            if event.is_pinned() {
                stats.pinned += 1;
            }
            stats.first_timestamp = Some(
                stats
                    .first_timestamp
                    .map_or(event.timestamp, |t| t.min(event.timestamp)),
            );
            stats.last_timestamp = Some(
                stats
                    .last_timestamp
                    .map_or(event.timestamp, |t| t.max(event.timestamp)),
            );
        }
        stats
    }

    /// Query then compute statistics over the result.
    pub fn statistics(&self, filter: &ActivityFilter) -> ActivityStatistics {
        Self::get_statistics(&self.query(filter))
    }

    pub fn performance(&self, agent_id: &str) -> Option<AgentPerformance> {
        self.lock().performance.get(agent_id).cloned()
    }

    /// All agents, sorted by id.
    pub fn all_performance(&self) -> Vec<AgentPerformance> {
        let mut all: Vec<_> = self.lock().performance.values().cloned().collect();
        all.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        all
    }

    /// Stream new events. Each subscriber has a buffer of
    /// `stream_buffer_size`; overflow is dropped for that subscriber only.
    pub fn subscribe_to_stream<F>(
        &self,
        id: impl Into<String>,
        callback: F,
        options: SubscribeOptions<ActivityEvent>,
    ) -> Subscription
    where
        F: Fn(&ActivityEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.stream.subscribe(id, callback, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn recorder(cap: usize) -> ActivityRecorder {
        ActivityRecorder::new(ActivityConfig {
            history_cap: cap,
            ..ActivityConfig::default()
        })
    }

    #[test]
    fn test_success_rate_and_confidence() {
        let r = recorder(100);
        for _ in 0..3 {
            r.record(NewActivity::new(ActivityType::TaskCompleted, "builder"));
        }
        r.record(NewActivity::new(ActivityType::AgentFailed, "builder"));

        let perf = r.performance("builder").unwrap();
        assert_eq!(perf.tasks_completed, 3);
        assert_eq!(perf.tasks_failed, 1);
        assert_eq!(perf.success_rate, 0.75);
        assert!((perf.confidence_score - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_huge_retention_keeps_everything() {
        let r = ActivityRecorder::new(ActivityConfig {
            retention_days: 200_000_000,
            ..ActivityConfig::default()
        });
        r.record(NewActivity::new(ActivityType::TaskStarted, "a"));
        r.record(NewActivity::new(ActivityType::TaskCompleted, "a"));
        assert_eq!(r.events().len(), 2);
    }

    #[test]
    fn test_confidence_capped_at_one() {
        let r = recorder(100);
        r.record(NewActivity::new(ActivityType::TaskCompleted, "a"));
        assert_eq!(r.performance("a").unwrap().confidence_score, 1.0);
    }

    #[test]
    fn test_zero_denominator() {
        let r = recorder(100);
        r.record(NewActivity::new(ActivityType::AgentBlocked, "a"));
        r.record(NewActivity::new(ActivityType::DecisionMade, "a"));
        let perf = r.performance("a").unwrap();
        assert_eq!(perf.success_rate, 0.0);
        assert_eq!(perf.blocker_count, 1);
        assert_eq!(perf.decisions_influenced, 1);
    }

    #[test]
    fn test_cap_evicts_oldest() {
        let r = recorder(3);
        for i in 0..5 {
            r.record(NewActivity::new(ActivityType::TaskStarted, "a").with_data(json!({ "i": i })));
        }
        let kept: Vec<_> = r.events().iter().map(|e| e.data["i"].as_i64().unwrap()).collect();
        assert_eq!(kept, vec![2, 3, 4]);
    }

    #[test]
    fn test_cap_prefers_non_critical_eviction() {
        let r = recorder(3);
        let base = Utc::now() - Duration::minutes(10);
        r.record(NewActivity::new(ActivityType::Error, "a").at(base));
        r.record(NewActivity::new(ActivityType::TaskStarted, "a").at(base + Duration::minutes(1)));
        r.record(NewActivity::new(ActivityType::Critical, "a").at(base + Duration::minutes(2)));
        r.record(NewActivity::new(ActivityType::TaskStarted, "a").at(base + Duration::minutes(3)));

        let events = r.events();
        assert_eq!(events.len(), 3);
        let types: Vec<_> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            vec![ActivityType::Error, ActivityType::Critical, ActivityType::TaskStarted]
        );
        assert!(events.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn test_pinned_overflow_keeps_newest_pinned() {
        let r = recorder(2);
        let base = Utc::now() - Duration::minutes(10);
        for i in 0..3 {
            r.record(
                NewActivity::new(ActivityType::Critical, "a")
                    .with_data(json!({ "i": i }))
                    .at(base + Duration::minutes(i)),
            );
        }
        let kept: Vec<_> = r.events().iter().map(|e| e.data["i"].as_i64().unwrap()).collect();
        assert_eq!(kept, vec![1, 2]);
    }

    #[test]
    fn test_retention_keeps_pinned() {
        let r = recorder(100);
        let old = Utc::now() - Duration::days(45);
        r.record(NewActivity::new(ActivityType::TaskStarted, "a").at(old));
        r.record(NewActivity::new(ActivityType::Error, "a").at(old));
        r.record(NewActivity::new(ActivityType::TaskStarted, "a"));

        let types: Vec<_> = r.events().iter().map(|e| e.event_type).collect();
        assert_eq!(types, vec![ActivityType::Error, ActivityType::TaskStarted]);
    }

    #[test]
    fn test_retain_critical_off() {
        let r = ActivityRecorder::new(ActivityConfig {
            history_cap: 2,
            retain_critical: false,
            ..ActivityConfig::default()
        });
        let base = Utc::now() - Duration::minutes(5);
        r.record(NewActivity::new(ActivityType::Critical, "a").at(base));
        r.record(NewActivity::new(ActivityType::TaskStarted, "a").at(base + Duration::minutes(1)));
        r.record(NewActivity::new(ActivityType::TaskStarted, "a").at(base + Duration::minutes(2)));
        assert!(r.events().iter().all(|e| e.event_type == ActivityType::TaskStarted));
    }

    #[test]
    fn test_default_visibility() {
        let r = recorder(10);
        let low = r.record(NewActivity::new(ActivityType::TaskStarted, "a"));
        assert!(low.visible_to(EngagementMode::Engineer));
        assert!(!low.visible_to(EngagementMode::Ceo));

        let critical = r.record(NewActivity::new(ActivityType::Critical, "a"));
        assert!(EngagementMode::ALL.iter().all(|m| critical.visible_to(*m)));

        let custom = r.record(
            NewActivity::new(ActivityType::DecisionMade, "a").visible_to([EngagementMode::Founder]),
        );
        assert_eq!(custom.visibility.len(), 1);
    }

    #[test]
    fn test_query_filters_and_limit() {
        let r = recorder(100);
        r.record(NewActivity::new(ActivityType::TaskStarted, "a"));
        r.record(NewActivity::new(ActivityType::TaskCompleted, "a"));
        r.record(NewActivity::new(ActivityType::TaskCompleted, "b"));
        r.record(NewActivity::new(ActivityType::Error, "b"));

        assert_eq!(r.query(&ActivityFilter::new().agent("b")).len(), 2);
        assert_eq!(
            r.query(&ActivityFilter::new().types([ActivityType::TaskCompleted])).len(),
            2
        );
        assert_eq!(
            r.query(&ActivityFilter::new().categories([ActivityCategory::Error])).len(),
            1
        );
        assert_eq!(
            r.query(&ActivityFilter::new().min_importance(Importance::Medium)).len(),
            3
        );
        assert_eq!(
            r.query(&ActivityFilter::new().visible_to(EngagementMode::Ceo)).len(),
            1
        );
        let last = r.query(&ActivityFilter::new().limit(1));
        assert_eq!(last[0].event_type, ActivityType::Error);
    }

    #[test]
    fn test_statistics_follow_filter() {
        let r = recorder(100);
        r.record(NewActivity::new(ActivityType::TaskCompleted, "a"));
        r.record(NewActivity::new(ActivityType::Error, "b"));

        let all = r.statistics(&ActivityFilter::new());
        assert_eq!(all.total, 2);
        assert_eq!(all.pinned, 1);

        let only_a = r.statistics(&ActivityFilter::new().agent("a"));
        assert_eq!(only_a.total, 1);
        assert_eq!(only_a.by_type.get(&ActivityType::TaskCompleted), Some(&1));
        assert!(only_a.by_agent.get("b").is_none());
    }

    #[test]
    fn test_all_performance_sorted() {
        let r = recorder(100);
        r.record(NewActivity::new(ActivityType::TaskStarted, "zeta"));
        r.record(NewActivity::new(ActivityType::TaskStarted, "alpha"));
        let ids: Vec<_> = r.all_performance().into_iter().map(|p| p.agent_id).collect();
        assert_eq!(ids, vec!["alpha", "zeta"]);
    }

    #[tokio::test]
    async fn test_stream_delivers_with_filter() {
        let r = recorder(100);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _sub = r.subscribe_to_stream(
            "errors",
            move |e: &ActivityEvent| {
                tx.send(e.event_type)?;
                Ok(())
            },
            SubscribeOptions::new().with_filter(|e: &ActivityEvent| e.is_pinned()),
        );

        r.record(NewActivity::new(ActivityType::TaskStarted, "a"));
        r.record(NewActivity::new(ActivityType::Error, "a"));

        let got = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, ActivityType::Error);
    }
}

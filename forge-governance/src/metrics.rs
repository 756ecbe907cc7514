//! Named metric series with trend analysis.
//!
//! Trends compare the average of the first half of a period's points with
//! the average of the second half. A change under 5% is `stable`.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Metric the governor records after every execution.
pub const AUTOMATION_SUCCESS_RATE: &str = "automation_success_rate";

const STABLE_BAND_PERCENT: f64 = 5.0;
const DEFAULT_MAX_POINTS: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub name: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Up,
    Down,
    Stable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trend {
    pub metric_name: String,
    pub direction: TrendDirection,
    pub change_percent: f64,
    /// Second-half average
    pub current_value: f64,
    /// First-half average
    pub previous_value: f64,
    pub period_days: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub count: usize,
    pub current: f64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trend: Option<Trend>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsReport {
    pub period_days: i64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub total_points: usize,
    pub metrics: BTreeMap<String, MetricSummary>,
}

/// Point filter. Unset fields do not filter; every tag must match.
#[derive(Debug, Clone, Default)]
pub struct MetricQuery {
    pub name: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub tags: BTreeMap<String, String>,
}

impl MetricQuery {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn between(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.start = Some(start);
        self.end = Some(end);
        self
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    fn matches(&self, point: &MetricPoint) -> bool {
        self.name.as_ref().map_or(true, |n| &point.name == n)
            && self.start.map_or(true, |s| point.timestamp >= s)
            && self.end.map_or(true, |e| point.timestamp <= e)
            && self
                .tags
                .iter()
                .all(|(k, v)| point.tags.get(k) == Some(v))
    }
}

#[derive(Debug)]
pub struct MetricsTracker {
    max_points: usize,
    points: Mutex<VecDeque<MetricPoint>>,
}

impl Default for MetricsTracker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_POINTS)
    }
}

impl MetricsTracker {
    /// Tracker retaining at most `max_points`, oldest dropped first.
    pub fn new(max_points: usize) -> Self {
        Self {
            max_points: max_points.max(1),
            points: Mutex::new(VecDeque::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<MetricPoint>> {
        self.points.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record(&self, name: impl Into<String>, value: f64) -> MetricPoint {
        self.record_point(MetricPoint {
            name: name.into(),
            value,
            timestamp: Utc::now(),
            tags: BTreeMap::new(),
            metadata: Value::Null,
        })
    }

    pub fn record_point(&self, point: MetricPoint) -> MetricPoint {
        let mut points = self.lock();
        points.push_back(point.clone());
        while points.len() > self.max_points {
            points.pop_front();
        }
        tracing::debug!(metric = %point.name, value = point.value, "Metric recorded");
        point
    }

    /// Matching points sorted by timestamp.
    pub fn get_metrics(&self, query: &MetricQuery) -> Vec<MetricPoint> {
        let mut matched: Vec<_> = self
            .lock()
            .iter()
            .filter(|p| query.matches(p))
            .cloned()
            .collect();
        matched.sort_by_key(|p| p.timestamp);
        matched
    }

    /// Trend of `name` over the trailing `period_days`. None with fewer than
    /// two points.
    pub fn calculate_trend(&self, name: &str, period_days: i64) -> Option<Trend> {
        let now = Utc::now();
        let points = self.get_metrics(
            &MetricQuery::named(name).between(now - Duration::days(period_days), now),
        );
        trend_of(name, &points, period_days)
    }

    /// Per-metric summary over the trailing `period_days`.
    pub fn summary(&self, period_days: i64) -> MetricsReport {
        let end = Utc::now();
        let start = end - Duration::days(period_days);
        let points = self.get_metrics(&MetricQuery::default().between(start, end));

        let mut by_name: BTreeMap<String, Vec<MetricPoint>> = BTreeMap::new();
        for point in &points {
            by_name
                .entry(point.name.clone())
                .or_default()
                .push(point.clone());
        }

        let metrics = by_name
            .into_iter()
            .map(|(name, series)| {
                let values: Vec<f64> = series.iter().map(|p| p.value).collect();
                let summary = MetricSummary {
                    count: values.len(),
                    current: values.last().copied().unwrap_or(0.0),
                    min: values.iter().copied().fold(f64::INFINITY, f64::min),
                    max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                    avg: values.iter().sum::<f64>() / values.len() as f64,
                    trend: trend_of(&name, &series, period_days),
                };
                (name, summary)
            })
            .collect();

        MetricsReport {
            period_days,
            start,
            end,
            total_points: points.len(),
            metrics,
        }
    }

    pub fn points(&self) -> Vec<MetricPoint> {
        self.lock().iter().cloned().collect()
    }
}

fn trend_of(name: &str, points: &[MetricPoint], period_days: i64) -> Option<Trend> {
    if points.len() < 2 {
        return None;
    }
    let (first, second) = points.split_at(points.len() / 2);
    let avg = |s: &[MetricPoint]| s.iter().map(|p| p.value).sum::<f64>() / s.len() as f64;
    let previous = avg(first);
    let current = avg(second);

    let change_percent = if previous != 0.0 {
        (current - previous) / previous * 100.0
    } else {
        0.0
    };
    let direction = if change_percent.abs() < STABLE_BAND_PERCENT {
        TrendDirection::Stable
    } else if change_percent > 0.0 {
        TrendDirection::Up
    } else {
        TrendDirection::Down
    };

    Some(Trend {
        metric_name: name.to_string(),
        direction,
        change_percent,
        current_value: current,
        previous_value: previous,
        period_days,
    })
}

//! # Freshness Tracker
//!
//! Answers "how stale is topic X" without widgets polling the feed. The router
//! touches a topic on every message; readers ask for ages against their own
//! notion of `now`.
//!
//! Timestamps only move forward: a late message carrying an older source
//! timestamp never rewinds a record.

use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::engine::message::Topic;

/// Last-received timestamp for one topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FreshnessRecord {
    pub topic: Topic,
    pub last_received: u64,
}

/// Coarse freshness bucket, mirroring a dashboard's "Live / Lagging / Stale" badge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FreshnessLevel {
    /// Updated within the first half of the stale threshold.
    Live,
    /// Past half the threshold but not yet stale.
    Lagging,
    /// Past the threshold, or never received.
    Stale,
}

impl fmt::Display for FreshnessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FreshnessLevel::Live => "Live",
            FreshnessLevel::Lagging => "Lagging",
            FreshnessLevel::Stale => "Stale",
        };
        f.write_str(label)
    }
}

/// # Stale Policy
///
/// Caller-side staleness thresholds. The tracker itself never hardcodes one;
/// widgets and monitors pass a policy (or a raw threshold) when they ask.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StalePolicy {
    /// Threshold used when a topic class has no override.
    pub default_threshold_ms: u64,
    /// Per topic-class overrides, keyed by the part before `:` (e.g. `news`).
    pub class_thresholds_ms: HashMap<String, u64>,
}

impl Default for StalePolicy {
    fn default() -> Self {
        Self {
            default_threshold_ms: 30_000,
            class_thresholds_ms: HashMap::new(),
        }
    }
}

impl StalePolicy {
    pub fn with_class(mut self, class: &str, threshold_ms: u64) -> Self {
        self.class_thresholds_ms.insert(class.to_string(), threshold_ms);
        self
    }

    /// Stale threshold that applies to `topic`.
    pub fn threshold_for(&self, topic: &Topic) -> u64 {
        self.class_thresholds_ms
            .get(topic.class())
            .copied()
            .unwrap_or(self.default_threshold_ms)
    }
}

/// Per-topic last-received timestamps (Unix milliseconds).
#[derive(Debug, Default)]
pub struct FreshnessTracker {
    records: RwLock<HashMap<Topic, u64>>,
}

impl FreshnessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a message for `topic`. Stores `max(existing, timestamp)` and
    /// returns the stored value.
    pub fn touch(&self, topic: &Topic, timestamp: u64) -> u64 {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let entry = records.entry(topic.clone()).or_insert(timestamp);
        if timestamp > *entry {
            *entry = timestamp;
        }
        *entry
    }

    pub fn last_received(&self, topic: &str) -> Option<u64> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        records.get(topic).copied()
    }

    /// Milliseconds since `topic` was last touched, or `None` when it never was
    /// (an unbounded age). A source clock ahead of `now` yields zero, never a
    /// negative age.
    pub fn age_of(&self, topic: &str, now: u64) -> Option<u64> {
        self.last_received(topic).map(|last| now.saturating_sub(last))
    }

    /// True when `topic` is older than `threshold_ms` or was never touched.
    pub fn is_stale(&self, topic: &str, now: u64, threshold_ms: u64) -> bool {
        match self.age_of(topic, now) {
            Some(age) => age > threshold_ms,
            None => true,
        }
    }

    pub fn level(&self, topic: &Topic, now: u64, policy: &StalePolicy) -> FreshnessLevel {
        let threshold = policy.threshold_for(topic);
        match self.age_of(topic.as_str(), now) {
            None => FreshnessLevel::Stale,
            Some(age) if age > threshold => FreshnessLevel::Stale,
            Some(age) if age > threshold / 2 => FreshnessLevel::Lagging,
            Some(_) => FreshnessLevel::Live,
        }
    }

    /// Every tracked topic that is stale under `policy`, sorted by topic.
    pub fn stale_topics(&self, now: u64, policy: &StalePolicy) -> Vec<Topic> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        let mut stale: Vec<Topic> = records
            .iter()
            .filter(|(topic, last)| now.saturating_sub(**last) > policy.threshold_for(topic))
            .map(|(topic, _)| topic.clone())
            .collect();
        stale.sort();
        stale
    }

    pub fn snapshot(&self) -> Vec<FreshnessRecord> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        let mut snapshot: Vec<FreshnessRecord> = records
            .iter()
            .map(|(topic, last)| FreshnessRecord {
                topic: topic.clone(),
                last_received: *last,
            })
            .collect();
        snapshot.sort_by(|a, b| a.topic.cmp(&b.topic));
        snapshot
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Human-readable age: `"12s ago"`, `"3m ago"`, `"2h ago"`, or `"never"`.
pub fn format_age(age_ms: Option<u64>) -> String {
    let Some(age_ms) = age_ms else {
        return "never".to_string();
    };
    let secs = age_ms / 1_000;
    if secs < 60 {
        format!("{}s ago", secs)
    } else if secs < 3_600 {
        format!("{}m ago", secs / 60)
    } else {
        format!("{}h ago", secs / 3_600)
    }
}

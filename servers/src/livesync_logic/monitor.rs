use lib_livesync::engine::format_age;
use lib_livesync::utils::{millis_to_rfc3339, now_millis};
use lib_livesync::{
    FeedConnection, FreshnessLevel, FreshnessTracker, StalePolicy, SubscriptionRegistry, Topic,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::interval;

/// Remembers the last level seen per topic so only transitions are logged.
#[derive(Debug, Default)]
pub struct FreshnessMonitor {
    last_levels: HashMap<Topic, FreshnessLevel>,
}

impl FreshnessMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the topics whose level changed since the previous check.
    pub fn check(
        &mut self,
        tracker: &FreshnessTracker,
        topics: &[Topic],
        now: u64,
        policy: &StalePolicy,
    ) -> Vec<(Topic, FreshnessLevel)> {
        let mut changes = Vec::new();
        for topic in topics {
            let level = tracker.level(topic, now, policy);
            if self.last_levels.insert(topic.clone(), level) != Some(level) {
                changes.push((topic.clone(), level));
            }
        }
        changes
    }
}

/// Log text for a level change, with the age and the source time of the last update.
pub fn describe_transition(tracker: &FreshnessTracker, topic: &Topic, level: FreshnessLevel, now: u64) -> String {
    let age = format_age(tracker.age_of(topic.as_str(), now));
    match tracker.last_received(topic.as_str()) {
        Some(ts) => format!("{} is {} (last update {}, at {})", topic, level, age, millis_to_rfc3339(ts)),
        None => format!("{} is {} (last update {})", topic, level, age),
    }
}

pub async fn run(
    check_every: Duration,
    policy: StalePolicy,
    feed: Arc<FeedConnection>,
    registry: Arc<SubscriptionRegistry>,
    tracker: Arc<FreshnessTracker>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut check_interval = interval(check_every);
    let mut monitor = FreshnessMonitor::new();

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                log::info!("Freshness monitor received shutdown signal.");
                break;
            }
            _ = check_interval.tick() => {
                let now = now_millis();
                let topics = registry.active_topics();
                for (topic, level) in monitor.check(&tracker, &topics, now, &policy) {
                    let line = describe_transition(&tracker, &topic, level, now);
                    match level {
                        FreshnessLevel::Stale => log::warn!("{}", line),
                        _ => log::info!("{}", line),
                    }
                }

                let stats = feed.stats();
                log::debug!(
                    "Feed {} | link {} | {} messages | {} reconnects",
                    feed.state(),
                    feed.link_quality().map_or_else(|| "unknown".to_string(), |q| q.to_string()),
                    stats.messages,
                    stats.reconnects
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transitions_are_reported() {
        let tracker = FreshnessTracker::new();
        let policy = StalePolicy::default();
        let aapl = Topic::new("price:AAPL").unwrap();
        let topics = vec![aapl.clone()];
        let mut monitor = FreshnessMonitor::new();

        // Never received: stale from the start.
        assert_eq!(monitor.check(&tracker, &topics, 0, &policy), vec![(aapl.clone(), FreshnessLevel::Stale)]);

        tracker.touch(&aapl, 1_000);
        assert_eq!(monitor.check(&tracker, &topics, 2_000, &policy), vec![(aapl.clone(), FreshnessLevel::Live)]);
        assert!(monitor.check(&tracker, &topics, 3_000, &policy).is_empty());

        assert_eq!(
            monitor.check(&tracker, &topics, 20_000, &policy),
            vec![(aapl.clone(), FreshnessLevel::Lagging)]
        );
        assert_eq!(
            monitor.check(&tracker, &topics, 40_000, &policy),
            vec![(aapl, FreshnessLevel::Stale)]
        );
    }

    #[test]
    fn test_transition_line_includes_source_time() {
        let tracker = FreshnessTracker::new();
        let aapl = Topic::new("price:AAPL").unwrap();

        let line = describe_transition(&tracker, &aapl, FreshnessLevel::Stale, 0);
        assert!(line.starts_with("price:AAPL is "));
        assert!(!line.contains(", at "));

        tracker.touch(&aapl, 1_000);
        let line = describe_transition(&tracker, &aapl, FreshnessLevel::Live, 2_000);
        assert!(line.ends_with("at 1970-01-01T00:00:01+00:00)"), "{}", line);
    }
}

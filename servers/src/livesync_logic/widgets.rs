//! Console widgets: stand-ins for dashboard panels that log what they would draw.

use lib_livesync::{
    RenderFrame, SubscriptionHandle, SubscriptionRegistry, SyncError, Topic, Update, WidgetCallback,
};
use std::sync::Arc;

pub const OVERVIEW_WIDGET: &str = "overview";

pub fn describe_update(update: &Update) -> String {
    format!("{} = {} ({} ms old)", update.topic(), update.payload(), update.age_ms())
}

/// One log line per frame.
pub fn render_line(frame: &RenderFrame) -> String {
    let body = frame
        .updates()
        .iter()
        .map(describe_update)
        .collect::<Vec<_>>()
        .join(" | ");
    format!("[{}] {}", frame.widget_id(), body)
}

pub fn console_widget() -> WidgetCallback {
    Arc::new(|frame: &RenderFrame| -> anyhow::Result<()> {
        log::info!("{}", render_line(frame));
        Ok(())
    })
}

/// Mounts one panel per topic plus an overview panel that watches all of them,
/// so every topic has at least two subscribers sharing the same feed data.
pub fn mount_console_widgets(
    registry: &SubscriptionRegistry,
    topics: &[Topic],
) -> Result<Vec<SubscriptionHandle>, SyncError> {
    let mut handles = Vec::with_capacity(topics.len() + 1);
    for topic in topics {
        handles.push(registry.subscribe(&format!("panel:{}", topic), [topic.clone()], console_widget())?);
    }
    if !topics.is_empty() {
        handles.push(registry.subscribe(OVERVIEW_WIDGET, topics.iter().cloned(), console_widget())?);
    }
    log::info!("Mounted {} console widgets", handles.len());
    Ok(handles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_livesync::{FreshnessTracker, Message, RenderScheduler, TopicRouter};
    use serde_json::json;
    use std::sync::Mutex;

    fn topics(names: &[&str]) -> Vec<Topic> {
        names.iter().map(|n| Topic::new(n).unwrap()).collect()
    }

    #[test]
    fn test_mount_adds_panels_and_overview() {
        let registry = SubscriptionRegistry::new();
        let handles = mount_console_widgets(&registry, &topics(&["price:AAPL", "news:GLOBAL"])).unwrap();

        assert_eq!(handles.len(), 3);
        assert_eq!(registry.topic_refcount("price:AAPL"), 2);
        assert!(registry.is_subscribed(OVERVIEW_WIDGET, "news:GLOBAL"));
        assert!(mount_console_widgets(&registry, &[]).unwrap().is_empty());
    }

    #[test]
    fn test_render_line_lists_latest_values() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let scheduler = Arc::new(RenderScheduler::new());
        let router = TopicRouter::new(Arc::clone(&registry), Arc::new(FreshnessTracker::new()), Arc::clone(&scheduler));

        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        let callback: WidgetCallback = Arc::new(move |frame: &RenderFrame| -> anyhow::Result<()> {
            sink.lock().unwrap().push(render_line(frame));
            Ok(())
        });
        registry
            .subscribe("desk", topics(&["price:AAPL", "risk:VAR"]), callback)
            .unwrap();

        router.route(Message::new(Topic::new("price:AAPL").unwrap(), json!(100), 1_000));
        router.route(Message::new(Topic::new("risk:VAR").unwrap(), json!(0.02), 1_500));
        router.route(Message::new(Topic::new("price:AAPL").unwrap(), json!(101), 2_000));
        scheduler.flush_at(2_000);

        let lines = lines.lock().unwrap();
        assert_eq!(
            lines.as_slice(),
            ["[desk] price:AAPL = 101 (0 ms old) | risk:VAR = 0.02 (500 ms old)".to_string()]
        );
    }
}

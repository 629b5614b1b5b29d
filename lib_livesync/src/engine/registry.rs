//! # Widget Subscription Registry
//!
//! Lifecycle-safe mapping between widgets and the topics they display.
//!
//! All mutation happens behind one `RwLock`. The router schedules deliveries
//! while holding the read side ([`SubscriptionRegistry::with_subscribers`]), so
//! once [`SubscriptionRegistry::unsubscribe`] has returned no new delivery can
//! be scheduled for that widget. A delivery that was already queued for the
//! current tick is allowed to complete.
//!
//! Each widget holds at most one live subscription. Subscribing again under the
//! same widget id replaces the previous one (a re-mount); the stale handle from
//! the earlier mount then no longer matches and unsubscribing with it is a no-op.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::engine::message::Topic;
use crate::engine::scheduler::RenderFrame;
use crate::errors::SyncError;

/// Widget-side callback, invoked by the scheduler at most once per tick.
///
/// Errors (and panics) are contained per widget; they never stop delivery to
/// other widgets.
pub type WidgetCallback = Arc<dyn Fn(&RenderFrame) -> anyhow::Result<()> + Send + Sync>;

/// Proof of a subscription, returned by [`SubscriptionRegistry::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    widget_id: String,
    id: u64,
}

impl SubscriptionHandle {
    pub fn widget_id(&self) -> &str {
        &self.widget_id
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

struct Subscription {
    id: u64,
    topics: BTreeSet<Topic>,
    callback: WidgetCallback,
}

#[derive(Default)]
struct RegistryState {
    // widget id -> its live subscription
    by_widget: HashMap<String, Subscription>,
    // topic -> widget ids, in subscription order (the length is the refcount)
    by_topic: HashMap<Topic, Vec<String>>,
}

impl RegistryState {
    fn detach(&mut self, widget_id: &str, topics: &BTreeSet<Topic>) {
        for topic in topics {
            if let Some(widgets) = self.by_topic.get_mut(topic) {
                widgets.retain(|w| w != widget_id);
                if widgets.is_empty() {
                    self.by_topic.remove(topic);
                    log::debug!("Topic '{}' has no remaining subscribers", topic);
                }
            }
        }
    }
}

/// # Subscription Registry
///
/// Tracks which widgets are interested in which topics.
pub struct SubscriptionRegistry {
    state: RwLock<RegistryState>,
    next_id: AtomicU64,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("SubscriptionRegistry")
            .field("widgets", &state.by_widget.len())
            .field("topics", &state.by_topic.len())
            .finish()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers `widget_id` for `topics`.
    ///
    /// Fails with [`SyncError::InvalidSubscription`] when the topic set is
    /// empty or the widget id is blank. Replaces any earlier subscription held
    /// by the same widget.
    pub fn subscribe<I>(
        &self,
        widget_id: &str,
        topics: I,
        callback: WidgetCallback,
    ) -> Result<SubscriptionHandle, SyncError>
    where
        I: IntoIterator<Item = Topic>,
    {
        if widget_id.trim().is_empty() {
            return Err(SyncError::InvalidSubscription {
                widget_id: widget_id.to_string(),
                reason: "widget id is blank".to_string(),
            });
        }
        let topics: BTreeSet<Topic> = topics.into_iter().collect();
        if topics.is_empty() {
            return Err(SyncError::InvalidSubscription {
                widget_id: widget_id.to_string(),
                reason: "topic set is empty".to_string(),
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(previous) = state.by_widget.remove(widget_id) {
            log::debug!(
                "Widget '{}' resubscribed; replacing subscription #{}",
                widget_id,
                previous.id
            );
            state.detach(widget_id, &previous.topics);
        }

        for topic in &topics {
            state
                .by_topic
                .entry(topic.clone())
                .or_default()
                .push(widget_id.to_string());
        }
        log::info!(
            "Widget '{}' subscribed to {} topic(s) as #{}",
            widget_id,
            topics.len(),
            id
        );
        state.by_widget.insert(
            widget_id.to_string(),
            Subscription {
                id,
                topics,
                callback,
            },
        );

        Ok(SubscriptionHandle {
            widget_id: widget_id.to_string(),
            id,
        })
    }

    /// Removes the subscription behind `handle`.
    ///
    /// Idempotent: returns `true` only for the call that actually removed the
    /// entry. A handle superseded by a resubscription is ignored.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let matches = state
            .by_widget
            .get(&handle.widget_id)
            .is_some_and(|sub| sub.id == handle.id);
        if !matches {
            return false;
        }
        if let Some(subscription) = state.by_widget.remove(&handle.widget_id) {
            state.detach(&handle.widget_id, &subscription.topics);
        }
        log::info!("Widget '{}' unsubscribed (#{})", handle.widget_id, handle.id);
        true
    }

    /// Topics the widget currently subscribes to, sorted. Empty when unknown.
    pub fn topics_of(&self, widget_id: &str) -> Vec<Topic> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .by_widget
            .get(widget_id)
            .map(|sub| sub.topics.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Widget ids subscribed to `topic`, in subscription order.
    pub fn subscribers_of(&self, topic: &str) -> Vec<String> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.by_topic.get(topic).cloned().unwrap_or_default()
    }

    pub fn is_subscribed(&self, widget_id: &str, topic: &str) -> bool {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .by_widget
            .get(widget_id)
            .is_some_and(|sub| sub.topics.contains(topic))
    }

    /// Calls `f` with the widget id, subscription id and callback of every
    /// subscriber of `topic` while holding the read lock, and returns how many
    /// were visited.
    pub fn with_subscribers<F>(&self, topic: &str, mut f: F) -> usize
    where
        F: FnMut(&str, u64, &WidgetCallback),
    {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let Some(widgets) = state.by_topic.get(topic) else {
            return 0;
        };
        let mut visited = 0;
        for widget_id in widgets {
            if let Some(subscription) = state.by_widget.get(widget_id) {
                f(widget_id, subscription.id, &subscription.callback);
                visited += 1;
            }
        }
        visited
    }

    /// Topics with at least one subscriber, sorted.
    pub fn active_topics(&self) -> Vec<Topic> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let mut topics: Vec<Topic> = state.by_topic.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Number of widgets subscribed to `topic`.
    pub fn topic_refcount(&self, topic: &str) -> usize {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.by_topic.get(topic).map_or(0, Vec::len)
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.state.read().unwrap_or_else(PoisonError::into_inner).by_widget.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

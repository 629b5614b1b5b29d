//! # Topic Router
//!
//! Demultiplexes feed messages to the widgets subscribed to their topic.
//!
//! The router runs on the feed's consumer task. It touches the freshness
//! tracker, looks the topic up in the registry and hands each subscriber a
//! delivery on the render scheduler. It never calls widget code itself, so the
//! feed is never blocked by rendering.
//!
//! Each message is wrapped in a single `Arc` and shared by every delivery
//! (zero-copy fan-out). Because one task routes messages in arrival order and
//! the scheduler keeps the last write, each subscriber observes a topic's
//! messages in source order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

use crate::engine::feed::MessageHandler;
use crate::engine::freshness::FreshnessTracker;
use crate::engine::message::Message;
use crate::engine::registry::SubscriptionRegistry;
use crate::engine::scheduler::RenderScheduler;

/// Routing counters since creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    /// Messages that reached at least one subscriber.
    pub routed: u64,
    /// Messages for topics nobody subscribes to. Not an error.
    pub dropped_unknown: u64,
    /// Deliveries handed to the scheduler.
    pub deliveries: u64,
}

#[derive(Default)]
struct Counters {
    routed: AtomicU64,
    dropped_unknown: AtomicU64,
    deliveries: AtomicU64,
}

pub struct TopicRouter {
    registry: Arc<SubscriptionRegistry>,
    freshness: Arc<FreshnessTracker>,
    scheduler: Arc<RenderScheduler>,
    counters: Counters,
}

impl TopicRouter {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        freshness: Arc<FreshnessTracker>,
        scheduler: Arc<RenderScheduler>,
    ) -> Self {
        Self {
            registry,
            freshness,
            scheduler,
            counters: Counters::default(),
        }
    }

    /// Routes one message and returns the number of deliveries scheduled.
    ///
    /// Every message refreshes its topic's freshness record, whether or not a
    /// widget is currently listening.
    pub fn route(&self, message: Message) -> usize {
        self.freshness.touch(&message.topic, message.source_timestamp);

        let message = Arc::new(message);
        let scheduled = self.registry.with_subscribers(message.topic.as_str(), |widget_id, subscription_id, callback| {
            self.scheduler
                .schedule(widget_id, subscription_id, Arc::clone(&message), Arc::clone(callback));
        });

        if scheduled == 0 {
            self.counters.dropped_unknown.fetch_add(1, Ordering::Relaxed);
            log::trace!("No subscribers for topic '{}'; message dropped", message.topic);
        } else {
            self.counters.routed.fetch_add(1, Ordering::Relaxed);
            self.counters
                .deliveries
                .fetch_add(scheduled as u64, Ordering::Relaxed);
        }
        scheduled
    }

    /// Single-consumer loop over a message channel, for hosts that feed the
    /// router through `mpsc` instead of registering it on the connection.
    pub async fn run(
        self: Arc<Self>,
        mut messages: mpsc::UnboundedReceiver<Message>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    log::info!("Topic router received shutdown signal.");
                    break;
                }
                next = messages.recv() => match next {
                    Some(message) => {
                        self.route(message);
                    }
                    None => {
                        log::info!("Message channel closed; topic router stopping.");
                        break;
                    }
                }
            }
        }
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            routed: self.counters.routed.load(Ordering::Relaxed),
            dropped_unknown: self.counters.dropped_unknown.load(Ordering::Relaxed),
            deliveries: self.counters.deliveries.load(Ordering::Relaxed),
        }
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn freshness(&self) -> &Arc<FreshnessTracker> {
        &self.freshness
    }

    pub fn scheduler(&self) -> &Arc<RenderScheduler> {
        &self.scheduler
    }
}

impl MessageHandler for TopicRouter {
    fn handle(&self, message: Message) {
        self.route(message);
    }
}

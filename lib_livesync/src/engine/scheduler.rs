//! # Render Scheduler
//!
//! Coalesces bursts of messages into at most one callback per widget per tick.
//!
//! Within a tick, updates are kept per widget and per topic with last-write-wins
//! semantics: ten `price:AAPL` messages for one widget collapse into the latest
//! one. A widget following several topics still gets a single callback, whose
//! [`RenderFrame`] carries the latest update of each topic that changed.
//!
//! `flush()` takes the pending set out from under the lock before running any
//! widget code, so callbacks can never block `schedule()` on the feed side.
//! Widgets are flushed in the order they first became pending during the tick.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

use crate::engine::message::{Message, Topic};
use crate::engine::registry::WidgetCallback;
use crate::utils::now_millis;

/// One topic's latest value as seen by a widget.
#[derive(Debug, Clone)]
pub struct Update {
    message: Arc<Message>,
    age_ms: u64,
}

impl Update {
    pub fn topic(&self) -> &Topic {
        &self.message.topic
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.message.payload
    }

    pub fn source_timestamp(&self) -> u64 {
        self.message.source_timestamp
    }

    /// Milliseconds between the source timestamp and the flush.
    pub fn age_ms(&self) -> u64 {
        self.age_ms
    }
}

/// Everything one widget receives in one tick.
#[derive(Debug, Clone)]
pub struct RenderFrame {
    widget_id: String,
    updates: Vec<Update>,
}

impl RenderFrame {
    pub fn widget_id(&self) -> &str {
        &self.widget_id
    }

    /// Latest update per topic, in the order the topics first changed this tick.
    pub fn updates(&self) -> &[Update] {
        &self.updates
    }

    pub fn latest(&self, topic: &str) -> Option<&Update> {
        self.updates.iter().find(|u| u.topic().as_str() == topic)
    }
}

/// Outcome of one `flush()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Callbacks that returned `Ok`.
    pub delivered: usize,
    /// Callbacks that returned an error or panicked.
    pub failed: usize,
}

/// Counters since creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub ticks: u64,
    pub scheduled: u64,
    /// Updates that replaced a pending one for the same widget and topic.
    pub coalesced: u64,
    pub callbacks: u64,
    pub failures: u64,
}

struct PendingWidget {
    subscription_id: u64,
    callback: WidgetCallback,
    // one entry per topic; replaced in place on coalesce
    messages: Vec<Arc<Message>>,
}

#[derive(Default)]
struct PendingState {
    order: Vec<String>,
    widgets: HashMap<String, PendingWidget>,
}

#[derive(Default)]
struct Counters {
    ticks: AtomicU64,
    scheduled: AtomicU64,
    coalesced: AtomicU64,
    callbacks: AtomicU64,
    failures: AtomicU64,
}

/// # Render Scheduler
///
/// Driven by the UI's own tick: either call [`RenderScheduler::flush`] from an
/// animation-frame hook, or spawn [`RenderScheduler::run`] for a fixed interval.
#[derive(Default)]
pub struct RenderScheduler {
    pending: Mutex<PendingState>,
    counters: Counters,
}

impl RenderScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `message` for the subscription `subscription_id` of `widget_id`
    /// in the current tick.
    ///
    /// A pending update for the same widget and topic is replaced (last write
    /// wins). Updates pending for an earlier subscription of the same widget
    /// are discarded, so a re-mounted widget only sees its own topics.
    /// Returns `true` when the widget was not yet pending this tick.
    pub fn schedule(
        &self,
        widget_id: &str,
        subscription_id: u64,
        message: Arc<Message>,
        callback: WidgetCallback,
    ) -> bool {
        self.counters.scheduled.fetch_add(1, Ordering::Relaxed);
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(widget) = pending.widgets.get_mut(widget_id) {
            if widget.subscription_id != subscription_id {
                log::debug!(
                    "Widget '{}' re-subscribed; dropping {} update(s) from its previous subscription",
                    widget_id,
                    widget.messages.len()
                );
                widget.subscription_id = subscription_id;
                widget.messages.clear();
            }
            widget.callback = callback;
            match widget.messages.iter_mut().find(|m| m.topic == message.topic) {
                Some(slot) => {
                    *slot = message;
                    self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                }
                None => widget.messages.push(message),
            }
            return false;
        }

        pending.order.push(widget_id.to_string());
        pending.widgets.insert(
            widget_id.to_string(),
            PendingWidget {
                subscription_id,
                callback,
                messages: vec![message],
            },
        );
        true
    }

    /// Delivers one callback per pending widget, using the wall clock for ages.
    pub fn flush(&self) -> FlushReport {
        self.flush_at(now_millis())
    }

    /// Delivers one callback per pending widget, computing ages against `now`
    /// (Unix milliseconds), then clears the pending set.
    pub fn flush_at(&self, now: u64) -> FlushReport {
        self.counters.ticks.fetch_add(1, Ordering::Relaxed);
        let PendingState { order, mut widgets } = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *pending)
        };

        let mut report = FlushReport::default();
        for widget_id in order {
            let Some(widget) = widgets.remove(&widget_id) else {
                continue;
            };
            let frame = RenderFrame {
                updates: widget
                    .messages
                    .into_iter()
                    .map(|message| Update {
                        age_ms: now.saturating_sub(message.source_timestamp),
                        message,
                    })
                    .collect(),
                widget_id,
            };

            self.counters.callbacks.fetch_add(1, Ordering::Relaxed);
            let callback = widget.callback;
            match panic::catch_unwind(AssertUnwindSafe(|| callback(&frame))) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    log::warn!("Widget '{}' callback failed: {:#}", frame.widget_id, e);
                }
                Err(_) => {
                    report.failed += 1;
                    log::error!("Widget '{}' callback panicked", frame.widget_id);
                }
            }
        }

        if report.failed > 0 {
            self.counters.failures.fetch_add(report.failed as u64, Ordering::Relaxed);
        }
        report
    }

    /// Number of widgets with pending data in the current tick.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).order.len()
    }

    pub fn is_pending(&self, widget_id: &str) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .widgets
            .contains_key(widget_id)
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            ticks: self.counters.ticks.load(Ordering::Relaxed),
            scheduled: self.counters.scheduled.load(Ordering::Relaxed),
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
            callbacks: self.counters.callbacks.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }

    /// Fixed-interval tick driver. Flushes every `tick` until `shutdown` fires.
    pub async fn run(self: Arc<Self>, tick: Duration, mut shutdown: broadcast::Receiver<()>) {
        let tick = tick.max(Duration::from_millis(1));
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        log::info!("Render scheduler started ({} ms tick)", tick.as_millis());

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    log::info!("Render scheduler received shutdown signal.");
                    break;
                }
                _ = interval.tick() => {
                    let report = self.flush();
                    if report.failed > 0 {
                        log::debug!("Tick delivered {} frame(s), {} failed", report.delivered, report.failed);
                    }
                }
            }
        }
    }
}

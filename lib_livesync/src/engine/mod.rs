//! # Sync Engine Module
//!
//! This module forms the heart of the live synchronization layer. It holds the
//! components that take a single upstream feed and keep any number of dashboard
//! widgets consistent with it.
//!
//! ## Core Components:
//!
//! - **`feed`**: Owns the one logical connection to the data source. Hides
//!   reconnection behind an exponential backoff with full jitter and surfaces
//!   only a terminal failure once the retry budget is spent.
//!
//! - **`router`**: Demultiplexes incoming messages by topic. It never calls
//!   widget code directly; it only enqueues deliveries on the scheduler, so a
//!   slow widget can not stall the feed.
//!
//! - **`freshness`**: Per-topic last-received timestamps, used by widgets and
//!   monitors to flag stale data without polling the feed.
//!
//! - **`registry`**: Lifecycle-safe mapping between widgets and topics, with
//!   per-topic reference counts.
//!
//! - **`scheduler`**: Coalesces bursts into at most one callback per widget
//!   per tick (last write wins).
//!
//! All shared state is passed through explicit `Arc` references; there is no
//! ambient "market snapshot" singleton.

/// Exponential backoff with full jitter for reconnect attempts.
pub mod backoff;
/// The single logical connection to the upstream source.
pub mod feed;
/// Per-topic staleness tracking.
pub mod freshness;
/// Topic identifiers and feed messages.
pub mod message;
/// Widget subscription bookkeeping.
pub mod registry;
/// Topic-based fan-out into the render scheduler.
pub mod router;
/// Per-tick coalescing of widget deliveries.
pub mod scheduler;

// --- Public API Re-exports ---
pub use backoff::BackoffPolicy;
pub use feed::{
    ConnectionState, FeedConnection, FeedFrame, FeedStats, LinkQuality, MessageHandler,
    MessageStream, SourceConfig, Transport,
};
pub use freshness::{format_age, FreshnessLevel, FreshnessRecord, FreshnessTracker, StalePolicy};
pub use message::{Message, Topic};
pub use registry::{SubscriptionHandle, SubscriptionRegistry, WidgetCallback};
pub use router::{RouterStats, TopicRouter};
pub use scheduler::{FlushReport, RenderFrame, RenderScheduler, SchedulerStats, Update};

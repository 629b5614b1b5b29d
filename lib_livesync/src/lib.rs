//! # lib_livesync
//!
//! A live data synchronization layer for multi-widget financial dashboards.
//! A single authoritative feed is pushed through a topic router into a
//! per-tick render scheduler, so every widget showing the same instrument
//! sees the same data, and never more than once per frame.
//!
//! ```text
//! FeedConnection -> TopicRouter -> (FreshnessTracker, SubscriptionRegistry) -> RenderScheduler -> widgets
//! ```

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

pub mod engine;
pub mod errors;
pub mod settings;
pub mod utils;

#[cfg(feature = "transport")]
pub mod transport;

// --- Public API Re-exports ---
pub use engine::{
    BackoffPolicy, ConnectionState, FeedConnection, FeedFrame, FreshnessLevel, FreshnessTracker,
    LinkQuality, Message, MessageHandler, RenderFrame, RenderScheduler, SourceConfig,
    StalePolicy, SubscriptionHandle, SubscriptionRegistry, Topic, TopicRouter, Transport, Update,
    WidgetCallback,
};
pub use errors::{SettingsError, SyncError};
pub use settings::SyncSettings;

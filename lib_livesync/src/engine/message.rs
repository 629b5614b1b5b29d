//! # Topics and Messages
//!
//! A `Message` is the unit that flows from the feed through the router. The
//! payload is opaque JSON; only the topic is inspected on the way through.

use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::SyncError;

/// # Topic
///
/// Identifier of one stream of related updates, e.g. `price:AAPL` or
/// `sentiment:US_EQUITY`. Cheap to clone; immutable once created.
///
/// The text before the first `:` is the topic *class* (`price`, `sentiment`,
/// `news`, `risk`, ...), used to pick per-class staleness thresholds.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Topic(Arc<str>);

impl Topic {
    /// Creates a topic, rejecting empty or whitespace-only identifiers.
    pub fn new(name: impl AsRef<str>) -> Result<Self, SyncError> {
        let name = name.as_ref();
        if name.trim().is_empty() {
            return Err(SyncError::InvalidTopic(name.to_string()));
        }
        Ok(Self(Arc::from(name)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The class prefix, or the whole topic when it has no `:`.
    pub fn class(&self) -> &str {
        match self.0.split_once(':') {
            Some((class, _)) => class,
            None => &self.0,
        }
    }
}

impl Borrow<str> for Topic {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic({})", self.0)
    }
}

impl FromStr for Topic {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::new(s)
    }
}

impl TryFrom<String> for Topic {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Topic::new(value)
    }
}

impl From<Topic> for String {
    fn from(topic: Topic) -> Self {
        topic.0.to_string()
    }
}

/// # Feed Message
///
/// One update as delivered by the upstream source. The wire form is
/// `{"topic": "...", "payload": ..., "sourceTimestamp": <unix ms>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub topic: Topic,
    pub payload: serde_json::Value,
    /// Timestamp assigned by the source, in Unix milliseconds.
    pub source_timestamp: u64,
}

impl Message {
    pub fn new(topic: Topic, payload: serde_json::Value, source_timestamp: u64) -> Self {
        Self {
            topic,
            payload,
            source_timestamp,
        }
    }

    /// Decodes a JSON wire frame.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

//! # Transports
//!
//! Wire implementations of [`crate::engine::Transport`]. Only the WebSocket
//! transport ships with the crate; anything else can plug into
//! [`crate::engine::FeedConnection`] through the same trait.

pub mod ws;

pub use ws::{decode_frame, WsTransport};

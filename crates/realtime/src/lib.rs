//! Push-channel client for planning notifications.
//!
//! Provides the WebSocket connection, exponential-backoff reconnection,
//! and the frame processing loop that turns server frames into typed
//! [`Notification`](planning_core::notifications::Notification)s on a
//! queue consumed by the sync engine.

pub mod client;
pub mod processor;
pub mod reconnect;

pub use client::{PushClient, PushClientError, PushConnection};
pub use processor::{run_push_channel, NotificationSender};
pub use reconnect::ReconnectConfig;

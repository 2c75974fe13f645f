//! Push-channel frame processing loop.
//!
//! Reads frames from the WebSocket, parses them into typed
//! [`Notification`]s and places them on the sync engine's queue. The loop
//! never touches local state itself; ordering and idempotency are the
//! dispatcher's concern.

use futures::StreamExt;
use planning_core::notifications::{parse_frame, Notification};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::client::{PushClient, PushStream};
use crate::reconnect::{reconnect_loop, ReconnectConfig};

/// Queue producer handed to the processing loop.
pub type NotificationSender = mpsc::UnboundedSender<Notification>;

/// Why a frame loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The socket closed or failed; reconnecting makes sense.
    Disconnected,
    /// The consumer is gone or shutdown was requested.
    Stopped,
}

/// Run the push channel until `cancel` fires or the queue consumer goes
/// away: connect, process frames, reconnect with backoff.
///
/// Every successful connection after the first one enqueues
/// [`Notification::Reconnected`] so the consumer can reload lock state.
pub async fn run_push_channel(
    client: &PushClient,
    config: &ReconnectConfig,
    tx: &NotificationSender,
    cancel: &CancellationToken,
) {
    let mut first = true;

    loop {
        let conn = match client.connect().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(error = %e, "Push connection failed, entering reconnect loop");
                match reconnect_loop(client, config, cancel).await {
                    Some(conn) => conn,
                    None => return,
                }
            }
        };

        if !first && tx.send(Notification::Reconnected).is_err() {
            return;
        }
        first = false;

        let mut ws_stream = conn.ws_stream;
        if process_frames(&mut ws_stream, tx, cancel).await == LoopExit::Stopped {
            tracing::info!("Push channel stopped");
            return;
        }

        if cancel.is_cancelled() {
            return;
        }
        tracing::info!("Push connection lost, reconnecting");
    }
}

/// Process frames from one connection until it closes.
pub async fn process_frames(
    ws_stream: &mut PushStream,
    tx: &NotificationSender,
    cancel: &CancellationToken,
) -> LoopExit {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return LoopExit::Stopped,
            next = ws_stream.next() => next,
        };

        match next {
            Some(Ok(Message::Text(text))) => {
                if !handle_text_frame(&text, tx) {
                    return LoopExit::Stopped;
                }
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                // Handled automatically by tungstenite.
            }
            Some(Ok(Message::Close(frame))) => {
                tracing::info!(?frame, "Push channel closed by server");
                return LoopExit::Disconnected;
            }
            Some(Ok(_)) => {
                tracing::trace!("Ignoring non-text push frame");
            }
            Some(Err(e)) => {
                tracing::error!(error = %e, "Push channel receive error");
                return LoopExit::Disconnected;
            }
            None => {
                tracing::info!("Push channel stream exhausted");
                return LoopExit::Disconnected;
            }
        }
    }
}

/// Parse one text frame and enqueue it.
///
/// Returns `false` once the consumer has dropped the queue.
pub fn handle_text_frame(text: &str, tx: &NotificationSender) -> bool {
    match parse_frame(text) {
        Ok(Some(notification)) => {
            tracing::debug!(?notification, "Push notification received");
            tx.send(notification).is_ok()
        }
        Ok(None) => {
            tracing::trace!(raw_message = %text, "Ignoring untracked push event");
            true
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                raw_message = %text,
                "Failed to parse push frame",
            );
            true
        }
    }
}

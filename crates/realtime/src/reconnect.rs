//! Backoff between push-channel connection attempts.
//!
//! A dropped channel usually means the planning server is restarting, so
//! [`reconnect_loop`] waits before every attempt, growing the wait until
//! it reaches [`ReconnectConfig::max_delay`].

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::client::{PushClient, PushConnection};

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Wait before the first attempt after a drop.
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Growth factor applied after each failed attempt.
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Sequence of waits between attempts: `initial_delay`, then growing by
/// `multiplier`, capped at `max_delay`.
#[derive(Debug)]
pub struct Backoff {
    next: Duration,
    max: Duration,
    multiplier: f64,
}

impl Backoff {
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            next: config.initial_delay.min(config.max_delay),
            max: config.max_delay,
            multiplier: config.multiplier.max(1.0),
        }
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let current = self.next;
        self.next = current.mul_f64(self.multiplier).min(self.max);
        Some(current)
    }
}

/// Keep trying to reach the push channel.
///
/// Returns the new connection, or `None` once `cancel` fires.
pub async fn reconnect_loop(
    client: &PushClient,
    config: &ReconnectConfig,
    cancel: &CancellationToken,
) -> Option<PushConnection> {
    for (attempt, delay) in (1u32..).zip(Backoff::new(config)) {
        tracing::info!(
            session = %client.session(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Push channel down, retrying",
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = client.connect() => result,
        };
        match result {
            Ok(conn) => {
                tracing::info!(attempt, "Push channel restored");
                return Some(conn);
            }
            Err(e) => tracing::warn!(attempt, error = %e, "Push channel attempt failed"),
        }
    }

    tracing::info!("Push channel reconnect cancelled");
    None
}

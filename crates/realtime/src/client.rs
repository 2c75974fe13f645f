//! WebSocket client for the planning push channel.
//!
//! [`PushClient`] holds the connection configuration. Call
//! [`PushClient::connect`] to establish a live [`PushConnection`].

use tokio_tungstenite::{connect_async, MaybeTlsStream};

/// Raw WebSocket stream of a push connection.
pub type PushStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Configuration handle for the push channel of one planning server.
pub struct PushClient {
    ws_url: String,
    session: String,
}

/// A live WebSocket connection to the push channel.
pub struct PushConnection {
    /// Session the connection was opened for.
    pub session: String,
    /// The raw WebSocket stream for reading frames.
    pub ws_stream: PushStream,
}

impl PushClient {
    /// * `ws_url`  - WebSocket URL, e.g. `wss://planning.example.com/ws`.
    /// * `session` - local session id, sent so the server can tag frames.
    pub fn new(ws_url: String, session: String) -> Self {
        Self { ws_url, session }
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    /// Connect to the push endpoint.
    pub async fn connect(&self) -> Result<PushConnection, PushClientError> {
        let separator = if self.ws_url.contains('?') { '&' } else { '?' };
        let url = format!("{}{separator}session={}", self.ws_url, self.session);

        let (ws_stream, _response) = connect_async(&url).await.map_err(|e| {
            PushClientError::Connection(format!(
                "Failed to connect to push channel at {}: {e}",
                self.ws_url
            ))
        })?;

        tracing::info!(
            session = %self.session,
            "Connected to push channel at {}",
            self.ws_url,
        );

        Ok(PushConnection {
            session: self.session.clone(),
            ws_stream,
        })
    }
}

/// Errors that can occur when working with the push client.
#[derive(Debug, thiserror::Error)]
pub enum PushClientError {
    /// Failed to establish the WebSocket connection.
    #[error("Connection error: {0}")]
    Connection(String),
}

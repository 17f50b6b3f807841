//! WebSocket client for the inference endpoint.
//!
//! [`InferenceClient`] holds the endpoint URL. Call
//! [`InferenceClient::connect`] to open a live [`InferenceConnection`].

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Raw websocket stream type used by the channel task.
pub type InferenceStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Connection settings for one inference endpoint.
#[derive(Debug, Clone)]
pub struct InferenceClient {
    ws_url: String,
}

/// A live websocket connection to the inference service.
pub struct InferenceConnection {
    /// Client-side id for correlating log lines of one connection.
    pub connection_id: String,
    pub connected_at: DateTime<Utc>,
    /// The raw websocket stream for reading/writing frames.
    pub ws_stream: InferenceStream,
}

impl fmt::Debug for InferenceConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InferenceConnection")
            .field("connection_id", &self.connection_id)
            .field("connected_at", &self.connected_at)
            .finish_non_exhaustive()
    }
}

impl InferenceClient {
    /// * `ws_url` - full endpoint URL, e.g. `ws://host:8000/api/v1/sam3/inference`.
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
        }
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    /// Perform the websocket handshake against the endpoint.
    pub async fn connect(&self) -> Result<InferenceConnection, InferenceClientError> {
        let (ws_stream, _response) = connect_async(self.ws_url.as_str()).await.map_err(|e| {
            InferenceClientError::Connection(format!(
                "Failed to connect to inference service at {}: {e}",
                self.ws_url
            ))
        })?;

        let connection_id = uuid::Uuid::new_v4().to_string();
        tracing::info!(
            connection_id = %connection_id,
            "Connected to inference service at {}",
            self.ws_url,
        );

        Ok(InferenceConnection {
            connection_id,
            connected_at: Utc::now(),
            ws_stream,
        })
    }

    /// [`connect`](Self::connect) bounded by `timeout`.
    pub async fn connect_within(
        &self,
        timeout: Duration,
    ) -> Result<InferenceConnection, InferenceClientError> {
        tokio::time::timeout(timeout, self.connect())
            .await
            .map_err(|_| InferenceClientError::Timeout(self.ws_url.clone()))?
    }
}

/// Errors that can occur when working with the websocket client.
#[derive(Debug, thiserror::Error)]
pub enum InferenceClientError {
    /// Failed to establish the websocket connection.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The handshake did not complete within the allotted time.
    #[error("Connection to {0} timed out")]
    Timeout(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn client_keeps_url() {
        let client = InferenceClient::new("ws://localhost:8000/api/v1/sam3/inference");
        assert_eq!(client.ws_url(), "ws://localhost:8000/api/v1/sam3/inference");
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = InferenceClient::new(format!("ws://{addr}"));
        let result = client.connect().await;
        assert_matches!(result, Err(InferenceClientError::Connection(_)));
    }

    #[tokio::test]
    async fn stalled_handshake_times_out() {
        // Accepts TCP but never answers the upgrade request.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _accept = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let client = InferenceClient::new(format!("ws://{addr}"));
        let result = client.connect_within(Duration::from_millis(100)).await;
        assert_matches!(
            result,
            Err(InferenceClientError::Timeout(ref url)) if url.contains(&addr.to_string())
        );
    }
}

//! HTTP transport
//!
//! Uses axum for the receiving side and reqwest for the sending side.
//! Messages travel as JSON POSTs to `/raft/message`; the router pushes
//! every received message into the node's server mailbox.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use tokio::sync::mpsc;
use tracing::warn;

use crate::core::message::Message;

use super::{Transport, TransportError};

/// HTTP sending side: node ID to address (e.g. "127.0.0.1:8001").
pub struct HttpTransport {
    peers: HashMap<u64, String>,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(peers: HashMap<u64, String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build HTTP client");
        HttpTransport { peers, client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, target: u64, msg: Message) -> Result<(), TransportError> {
        let addr = self.peers.get(&target).ok_or(TransportError::NodeNotFound)?;
        let url = format!("http://{}/raft/message", addr);

        let response = self.client.post(&url).json(&msg).send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::ConnectionFailed
            }
        })?;

        if !response.status().is_success() {
            return Err(TransportError::ConnectionFailed);
        }
        Ok(())
    }
}

/// Build the receiving router. Incoming messages land on `mailbox`.
pub fn create_router(mailbox: mpsc::Sender<Message>) -> Router {
    Router::new()
        .route("/raft/message", post(handle_message))
        .with_state(mailbox)
}

async fn handle_message(
    State(mailbox): State<mpsc::Sender<Message>>,
    Json(msg): Json<Message>,
) -> StatusCode {
    match mailbox.send(msg).await {
        Ok(()) => StatusCode::OK,
        Err(_) => {
            warn!("raft server mailbox closed, dropping inbound message");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

//! Transport layer for protocol messages
//!
//! Responses are first-class protocol messages in this design, so the
//! transport is one-way and fire-and-forget: hand a [`Message`] to a
//! peer, report failure, nothing else. The host turns a failed send
//! into a synthetic `Unreachable` message for the core.
//!
//! - [`inmemory::InMemoryNetwork`]: channel-based, with per-node
//!   connect/disconnect switches for partition tests
//! - [`http::HttpTransport`]: HTTP/JSON for real deployments

use async_trait::async_trait;
use thiserror::Error;

use crate::core::message::Message;

pub mod http;
pub mod inmemory;

/// Errors that can occur while sending a message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection to the target node failed")]
    ConnectionFailed,
    #[error("request timed out")]
    Timeout,
    #[error("target node not found")]
    NodeNotFound,
}

/// One-way message transport toward cluster peers.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Queue `msg` for delivery to `target`. No delivery guarantee;
    /// an `Err` means the host should consider the peer unreachable.
    async fn send(&self, target: u64, msg: Message) -> Result<(), TransportError>;
}

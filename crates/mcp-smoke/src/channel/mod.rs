//! Transport channels: one JSON-RPC exchange at a time over pipes, SSE or unary HTTP

mod http;
mod piped;
mod sse;

pub use http::HttpChannel;
pub use piped::PipedChannel;
pub use sse::SseChannel;

use crate::error::ChannelError;
use async_trait::async_trait;
use mcp_smoke_core::{Notification, RequestEnvelope, ResponseEnvelope, TransportMode};
use std::time::Duration;

/// Result of one request/response exchange
#[derive(Debug, Clone, PartialEq)]
pub enum Exchange {
    Response(ResponseEnvelope),
    TimedOut,
    Malformed { raw: String, reason: String },
    /// The endpoint accepted the request without returning a payload
    Acknowledged { status: u16 },
    Failed(String),
}

impl Exchange {
    pub fn failed(reason: impl Into<String>) -> Self {
        Exchange::Failed(reason.into())
    }
}

impl From<ChannelError> for Exchange {
    fn from(error: ChannelError) -> Self {
        if error.is_timeout() {
            Exchange::TimedOut
        } else {
            Exchange::Failed(error.to_string())
        }
    }
}

/// How a long-lived stream came up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opened {
    /// The transport has no long-lived state
    NotNeeded,
    /// Response headers arrived and events are being read
    Streaming,
    /// Headers did not arrive in time; the stream keeps connecting in the background
    Assumed,
}

#[async_trait]
pub trait TransportChannel: Send {
    fn mode(&self) -> TransportMode;

    /// Establish long-lived state, if the transport has any
    async fn open(&mut self, _deadline: Duration) -> Result<Opened, ChannelError> {
        Ok(Opened::NotNeeded)
    }

    /// Send one request and wait up to `deadline` for its response
    async fn send_and_await(&mut self, request: &RequestEnvelope, deadline: Duration) -> Exchange;

    /// Send a notification; no response is expected
    async fn notify(
        &mut self,
        notification: &Notification,
        deadline: Duration,
    ) -> Result<(), ChannelError>;

    /// A request was left unanswered, so later responses can no longer be matched
    fn is_desynchronized(&self) -> bool;

    /// Release the channel's resources; bounded and infallible
    async fn close(&mut self);
}

use super::{Exchange, TransportChannel};
use crate::error::ChannelError;
use async_trait::async_trait;
use mcp_smoke_core::{
    Decoded, MAX_RAW_BYTES, Notification, RequestEnvelope, SmokeError, TransportMode, decode,
    encode_line, encode_notification_line, truncate_raw,
};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tracing::{debug, warn};

/// The single outstanding request of a piped channel
#[derive(Debug)]
struct InFlight {
    correlation_id: u64,
    method: String,
}

/// Newline-delimited JSON-RPC over a service's stdin/stdout
pub struct PipedChannel<W, R> {
    stdin: Option<W>,
    stdout: Lines<BufReader<R>>,
    in_flight: Option<InFlight>,
}

impl<W, R> PipedChannel<W, R>
where
    W: AsyncWrite + Unpin + Send,
    R: AsyncRead + Unpin + Send,
{
    pub fn new(stdin: W, stdout: R) -> Self {
        Self {
            stdin: Some(stdin),
            stdout: BufReader::new(stdout).lines(),
            in_flight: None,
        }
    }

    async fn write_line(&mut self, line: &str) -> Result<(), ChannelError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| SmokeError::transport("service stdin already closed"))?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Read lines until the response to `correlation_id` shows up
    async fn read_response(&mut self, correlation_id: u64) -> Exchange {
        loop {
            let line = match self.stdout.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return Exchange::failed("service closed stdout"),
                Err(e) => return Exchange::failed(format!("reading service stdout failed: {e}")),
            };
            match decode(&line) {
                Decoded::NoData => continue,
                Decoded::ServerMessage { method } => {
                    debug!(%method, "Skipping server-initiated message");
                    continue;
                }
                Decoded::Response(response) if response.correlation_id == correlation_id => {
                    return Exchange::Response(response);
                }
                Decoded::Response(response) => {
                    return Exchange::Malformed {
                        raw: truncate_raw(&line, MAX_RAW_BYTES),
                        reason: format!(
                            "correlation mismatch: expected id {correlation_id}, got {}",
                            response.correlation_id
                        ),
                    };
                }
                Decoded::Malformed { raw, reason } => return Exchange::Malformed { raw, reason },
            }
        }
    }
}

#[async_trait]
impl<W, R> TransportChannel for PipedChannel<W, R>
where
    W: AsyncWrite + Unpin + Send,
    R: AsyncRead + Unpin + Send,
{
    fn mode(&self) -> TransportMode {
        TransportMode::PipedStream
    }

    async fn send_and_await(&mut self, request: &RequestEnvelope, deadline: Duration) -> Exchange {
        if let Some(pending) = &self.in_flight {
            return Exchange::failed(format!(
                "channel desynchronized: {} (id {}) never answered",
                pending.method, pending.correlation_id
            ));
        }

        self.in_flight = Some(InFlight {
            correlation_id: request.correlation_id,
            method: request.method.clone(),
        });
        debug!(id = request.correlation_id, method = %request.method, "Sending request over stdin");

        let line = encode_line(request);
        let exchange = tokio::time::timeout(deadline, async {
            if let Err(e) = self.write_line(&line).await {
                return Exchange::failed(format!("writing to service stdin failed: {e}"));
            }
            self.read_response(request.correlation_id).await
        })
        .await;

        match exchange {
            // The in-flight marker stays set: a late answer may still arrive
            Err(_) => {
                warn!(id = request.correlation_id, method = %request.method, "Request timed out, channel desynchronized");
                Exchange::TimedOut
            }
            Ok(exchange) => {
                // After a malformed line the real answer may still be queued
                if matches!(exchange, Exchange::Malformed { .. }) {
                    warn!(id = request.correlation_id, method = %request.method, "Malformed answer, channel desynchronized");
                } else {
                    self.in_flight = None;
                }
                exchange
            }
        }
    }

    async fn notify(
        &mut self,
        notification: &Notification,
        deadline: Duration,
    ) -> Result<(), ChannelError> {
        let line = encode_notification_line(notification);
        tokio::time::timeout(deadline, self.write_line(&line)).await?
    }

    fn is_desynchronized(&self) -> bool {
        self.in_flight.is_some()
    }

    async fn close(&mut self) {
        if let Some(mut stdin) = self.stdin.take() {
            let _ = tokio::time::timeout(Duration::from_millis(200), stdin.shutdown()).await;
        }
    }
}

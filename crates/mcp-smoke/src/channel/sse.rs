use super::{Exchange, Opened, TransportChannel};
use crate::error::ChannelError;
use crate::sse_parser::{SseEvent, SseParser};
use async_trait::async_trait;
use mcp_smoke_core::{
    Decoded, Leniency, MAX_RAW_BYTES, Notification, RequestEnvelope, SmokeError, TransportMode,
    decode, encode_body, encode_notification_body, truncate_raw,
};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of the `GET /sse` request, reported once headers arrive
type Headers = Result<StatusCode, reqwest::Error>;

/// Background task that connects the `GET /sse` stream and turns its body into events
///
/// The connection outlives the caller's deadline, so a stream whose headers are late
/// still delivers its events once they arrive.
struct StreamReader {
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl StreamReader {
    fn spawn(
        request: RequestBuilder,
        headers: oneshot::Sender<Headers>,
        tx: mpsc::UnboundedSender<SseEvent>,
    ) -> Self {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let join = tokio::spawn(async move {
            let response = tokio::select! {
                biased;
                _ = cancelled.cancelled() => return,
                response = request.send() => response,
            };
            let response = match response {
                Ok(response) => response,
                Err(e) => {
                    debug!(error = %e, "SSE connection failed");
                    let _ = headers.send(Err(e));
                    return;
                }
            };
            let status = response.status();
            if headers.send(Ok(status)).is_err() {
                debug!(status = %status, "SSE headers arrived after the deadline");
            }
            if !status.is_success() {
                return;
            }

            let mut body = response.bytes_stream();
            let mut parser = SseParser::new();
            loop {
                tokio::select! {
                    biased;
                    _ = cancelled.cancelled() => return,
                    chunk = body.next() => match chunk {
                        Some(Ok(bytes)) => {
                            for event in parser.feed(&bytes) {
                                debug!(event = %event.event, "Received SSE event");
                                if tx.send(event).is_err() {
                                    return;
                                }
                            }
                        }
                        Some(Err(e)) => {
                            debug!(error = %e, "SSE stream failed");
                            break;
                        }
                        None => break,
                    }
                }
            }
            if let Some(event) = parser.finish() {
                let _ = tx.send(event);
            }
            debug!("SSE stream ended");
        });
        Self { token, join }
    }

    async fn stop(mut self, bound: Duration) {
        self.token.cancel();
        if tokio::time::timeout(bound, &mut self.join).await.is_err() {
            warn!("SSE reader did not stop, aborting");
            self.join.abort();
        }
    }
}

/// JSON-RPC over a server-sent event stream plus the POST endpoint it advertises
pub struct SseChannel {
    client: Client,
    base_url: String,
    leniency: Leniency,
    events: Option<mpsc::UnboundedReceiver<SseEvent>>,
    reader: Option<StreamReader>,
    endpoint: Option<Url>,
    desynchronized: Option<String>,
}

impl SseChannel {
    pub fn new(client: Client, base_url: impl Into<String>, leniency: Leniency) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            leniency,
            events: None,
            reader: None,
            endpoint: None,
            desynchronized: None,
        }
    }

    async fn next_event(&mut self) -> Result<SseEvent, ChannelError> {
        let events = self
            .events
            .as_mut()
            .ok_or_else(|| SmokeError::transport("event stream not established"))?;
        match events.recv().await {
            Some(event) => Ok(event),
            None => Err(SmokeError::transport("event stream closed").into()),
        }
    }

    /// The POST endpoint announced by the first `endpoint` event
    async fn endpoint(&mut self) -> Result<Url, ChannelError> {
        if let Some(endpoint) = &self.endpoint {
            return Ok(endpoint.clone());
        }
        loop {
            let event = self.next_event().await?;
            if !event.is("endpoint") {
                debug!(event = %event.event, "Ignoring event before endpoint");
                continue;
            }
            let base = Url::parse(&self.base_url)
                .map_err(|e| SmokeError::transport(format!("invalid base URL: {e}")))?;
            let endpoint = base.join(event.data.trim()).map_err(|e| {
                SmokeError::transport(format!("invalid endpoint `{}`: {e}", event.data))
            })?;
            info!(endpoint = %endpoint, "SSE endpoint announced");
            self.endpoint = Some(endpoint.clone());
            return Ok(endpoint);
        }
    }

    async fn post(&mut self, body: String) -> Result<Option<Exchange>, ChannelError> {
        let endpoint = self.endpoint().await?;
        let response = self
            .client
            .post(endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            Ok(None)
        } else {
            Ok(Some(Exchange::failed(format!(
                "POST {endpoint} returned HTTP {status}"
            ))))
        }
    }

    async fn exchange(&mut self, request: &RequestEnvelope) -> Result<Exchange, ChannelError> {
        if let Some(refused) = self.post(encode_body(request)).await? {
            return Ok(refused);
        }
        loop {
            let event = self.next_event().await?;
            if !event.is("message") {
                continue;
            }
            match decode(&event.data) {
                Decoded::NoData | Decoded::ServerMessage { .. } => continue,
                Decoded::Response(response) if response.correlation_id == request.correlation_id => {
                    return Ok(Exchange::Response(response));
                }
                Decoded::Response(response) => {
                    self.desynchronized = Some(format!(
                        "response for id {} while waiting for {}",
                        response.correlation_id, request.correlation_id
                    ));
                    return Ok(Exchange::Malformed {
                        raw: truncate_raw(&event.data, MAX_RAW_BYTES),
                        reason: format!(
                            "correlation mismatch: expected id {}, got {}",
                            request.correlation_id, response.correlation_id
                        ),
                    });
                }
                Decoded::Malformed { raw, reason } => {
                    self.desynchronized = Some(format!(
                        "undecodable message while waiting for {}",
                        request.correlation_id
                    ));
                    return Ok(Exchange::Malformed { raw, reason });
                }
            }
        }
    }
}

#[async_trait]
impl TransportChannel for SseChannel {
    fn mode(&self) -> TransportMode {
        TransportMode::Sse
    }

    async fn open(&mut self, deadline: Duration) -> Result<Opened, ChannelError> {
        if self.events.is_some() {
            return Ok(Opened::Streaming);
        }
        let url = format!("{}/sse", self.base_url);
        let request = self.client.get(&url).header(ACCEPT, "text/event-stream");

        let (headers_tx, headers_rx) = oneshot::channel();
        let (tx, rx) = mpsc::unbounded_channel();
        let reader = StreamReader::spawn(request, headers_tx, tx);

        let opened = match tokio::time::timeout(deadline, headers_rx).await {
            Ok(Ok(Ok(status))) if status.is_success() => Ok(Opened::Streaming),
            Ok(Ok(Ok(status))) => Err(status.into()),
            Ok(Ok(Err(e))) => Err(e.into()),
            Ok(Err(_)) => Err(SmokeError::transport("SSE connection task ended").into()),
            Err(_) if self.leniency.sse_timeout_counts_as_open => {
                info!(url = %url, "No SSE headers before the deadline, treating the stream as open");
                Ok(Opened::Assumed)
            }
            Err(elapsed) => Err(elapsed.into()),
        };

        match opened {
            Ok(opened) => {
                if opened == Opened::Streaming {
                    info!(url = %url, "SSE stream established");
                }
                self.reader = Some(reader);
                self.events = Some(rx);
                Ok(opened)
            }
            Err(e) => {
                reader.stop(Duration::from_secs(1)).await;
                Err(e)
            }
        }
    }

    async fn send_and_await(&mut self, request: &RequestEnvelope, deadline: Duration) -> Exchange {
        if let Some(reason) = &self.desynchronized {
            return Exchange::failed(format!("channel desynchronized: {reason}"));
        }
        if self.events.is_none() {
            return Exchange::failed("event stream not established");
        }

        match tokio::time::timeout(deadline, self.exchange(request)).await {
            Ok(Ok(exchange)) => exchange,
            Ok(Err(e)) => Exchange::from(e),
            Err(_) => {
                warn!(id = request.correlation_id, method = %request.method, "Request timed out, channel desynchronized");
                self.desynchronized = Some(format!(
                    "{} (id {}) never answered",
                    request.method, request.correlation_id
                ));
                Exchange::TimedOut
            }
        }
    }

    async fn notify(
        &mut self,
        notification: &Notification,
        deadline: Duration,
    ) -> Result<(), ChannelError> {
        let body = encode_notification_body(notification);
        match tokio::time::timeout(deadline, self.post(body)).await?? {
            None => Ok(()),
            Some(_) => Err(SmokeError::transport("notification rejected").into()),
        }
    }

    fn is_desynchronized(&self) -> bool {
        self.desynchronized.is_some()
    }

    async fn close(&mut self) {
        self.events = None;
        if let Some(reader) = self.reader.take() {
            reader.stop(Duration::from_secs(1)).await;
        }
    }
}

impl Drop for SseChannel {
    fn drop(&mut self) {
        if let Some(reader) = &self.reader {
            reader.token.cancel();
        }
    }
}

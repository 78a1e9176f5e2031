use super::{Exchange, TransportChannel};
use crate::error::ChannelError;
use crate::sse_parser::SseParser;
use async_trait::async_trait;
use mcp_smoke_core::{
    Decoded, Leniency, MAX_RAW_BYTES, Notification, RequestEnvelope, TransportMode, decode,
    encode_body, encode_notification_body, truncate_raw,
};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, Response, StatusCode};
use std::time::Duration;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

pub const SESSION_HEADER: &str = "mcp-session-id";

/// One `POST /mcp` per JSON-RPC message
pub struct HttpChannel {
    client: Client,
    url: String,
    leniency: Leniency,
    session_id: Option<String>,
}

impl HttpChannel {
    pub fn new(client: Client, base_url: &str, leniency: Leniency) -> Self {
        Self {
            client,
            url: format!("{base_url}/mcp"),
            leniency,
            session_id: None,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    async fn post(&mut self, body: String) -> Result<Response, ChannelError> {
        let mut request = self
            .client
            .post(&self.url)
            .header(ACCEPT, "application/json, text/event-stream")
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(session_id) = &self.session_id {
            request = request.header(SESSION_HEADER, session_id);
        }

        let response = request.send().await?;
        if let Some(session_id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|value| value.to_str().ok())
        {
            if self.session_id.as_deref() != Some(session_id) {
                debug!(session_id, "Session established");
                self.session_id = Some(session_id.to_string());
            }
        }
        Ok(response)
    }

    async fn exchange(&mut self, request: &RequestEnvelope) -> Result<Exchange, ChannelError> {
        let response = self.post(encode_body(request)).await?;
        let status = response.status();
        match status {
            StatusCode::OK => {}
            StatusCode::ACCEPTED => {
                return Ok(Exchange::Acknowledged {
                    status: status.as_u16(),
                });
            }
            StatusCode::NOT_ACCEPTABLE if self.leniency.accept_precondition_status => {
                return Ok(Exchange::Acknowledged {
                    status: status.as_u16(),
                });
            }
            other => return Ok(Exchange::failed(format!("HTTP {other}"))),
        }

        let is_event_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("text/event-stream"));

        if is_event_stream {
            read_event_stream(response, request.correlation_id).await
        } else {
            let body = response.text().await?;
            Ok(match_response(&body, request.correlation_id).unwrap_or_else(|| {
                Exchange::Malformed {
                    raw: truncate_raw(&body, MAX_RAW_BYTES),
                    reason: "expected a response, got no data or a server message".to_string(),
                }
            }))
        }
    }
}

/// Read an SSE-framed reply until the response for `correlation_id` arrives
async fn read_event_stream(response: Response, correlation_id: u64) -> Result<Exchange, ChannelError> {
    let mut body = response.bytes_stream();
    let mut parser = SseParser::new();
    while let Some(chunk) = body.next().await {
        for event in parser.feed(&chunk?) {
            if let Some(exchange) = match_response(&event.data, correlation_id) {
                return Ok(exchange);
            }
        }
    }
    if let Some(event) = parser.finish() {
        if let Some(exchange) = match_response(&event.data, correlation_id) {
            return Ok(exchange);
        }
    }
    Ok(Exchange::Malformed {
        raw: String::new(),
        reason: "event stream ended without a response".to_string(),
    })
}

/// `None` when the payload carries nothing to answer the request
fn match_response(payload: &str, correlation_id: u64) -> Option<Exchange> {
    match decode(payload) {
        Decoded::NoData | Decoded::ServerMessage { .. } => None,
        Decoded::Response(response) if response.correlation_id == correlation_id => {
            Some(Exchange::Response(response))
        }
        Decoded::Response(response) => Some(Exchange::Malformed {
            raw: truncate_raw(payload, MAX_RAW_BYTES),
            reason: format!(
                "correlation mismatch: expected id {correlation_id}, got {}",
                response.correlation_id
            ),
        }),
        Decoded::Malformed { raw, reason } => Some(Exchange::Malformed { raw, reason }),
    }
}

#[async_trait]
impl TransportChannel for HttpChannel {
    fn mode(&self) -> TransportMode {
        TransportMode::HttpUnary
    }

    async fn send_and_await(&mut self, request: &RequestEnvelope, deadline: Duration) -> Exchange {
        debug!(id = request.correlation_id, method = %request.method, url = %self.url, "POST request");
        match tokio::time::timeout(deadline, self.exchange(request)).await {
            Ok(Ok(exchange)) => exchange,
            Ok(Err(e)) => Exchange::from(e),
            Err(_) => {
                warn!(id = request.correlation_id, method = %request.method, "Request timed out");
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
        let response = tokio::time::timeout(deadline, self.post(body)).await??;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(status.into())
        }
    }

    /// Every exchange is its own request, so late answers cannot interfere
    fn is_desynchronized(&self) -> bool {
        false
    }

    async fn close(&mut self) {
        self.session_id = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::HeaderMap;
    use axum::response::IntoResponse;
    use axum::routing::post;
    use mcp_smoke_core::{CorrelationIds, Outcome};
    use serde_json::{Value, json};

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn echo_result(headers: HeaderMap, body: String) -> impl IntoResponse {
        let request: Value = serde_json::from_str(&body).unwrap();
        let session = headers
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("none")
            .to_string();
        let reply = json!({"jsonrpc": "2.0", "id": request["id"], "result": {"session": session}});
        ([(SESSION_HEADER, "s-1")], axum::Json(reply))
    }

    #[tokio::test]
    async fn test_json_reply_and_session_header() {
        let base = serve(Router::new().route("/mcp", post(echo_result))).await;
        let mut channel = HttpChannel::new(Client::new(), &base, Leniency::default());
        let ids = CorrelationIds::new();

        let exchange = channel
            .send_and_await(&ids.request("initialize", json!({})), Duration::from_secs(2))
            .await;
        let Exchange::Response(response) = exchange else {
            panic!("expected response, got {exchange:?}");
        };
        assert_eq!(response.outcome, Outcome::Ok(json!({"session": "none"})));
        assert_eq!(channel.session_id(), Some("s-1"));

        let exchange = channel
            .send_and_await(&ids.request("tools/list", json!({})), Duration::from_secs(2))
            .await;
        let Exchange::Response(response) = exchange else {
            panic!("expected response, got {exchange:?}");
        };
        assert_eq!(response.outcome, Outcome::Ok(json!({"session": "s-1"})));
    }

    #[tokio::test]
    async fn test_event_stream_reply() {
        let router = Router::new().route(
            "/mcp",
            post(|body: String| async move {
                let request: Value = serde_json::from_str(&body).unwrap();
                let reply = json!({"jsonrpc": "2.0", "id": request["id"], "result": {"tools": []}});
                (
                    [(CONTENT_TYPE.as_str(), "text/event-stream")],
                    format!(
                        "event: message\ndata: {{\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\"}}\n\nevent: message\ndata: {reply}\n\n"
                    ),
                )
            }),
        );
        let base = serve(router).await;
        let mut channel = HttpChannel::new(Client::new(), &base, Leniency::default());

        let exchange = channel
            .send_and_await(
                &RequestEnvelope::new(4, "tools/list", json!({})),
                Duration::from_secs(2),
            )
            .await;
        assert!(matches!(exchange, Exchange::Response(ref r) if r.correlation_id == 4));
    }

    #[tokio::test]
    async fn test_not_acceptable_respects_leniency() {
        let router = Router::new().route("/mcp", post(|| async { StatusCode::NOT_ACCEPTABLE }));
        let base = serve(router).await;
        let request = RequestEnvelope::new(1, "initialize", json!({}));

        let mut lenient = HttpChannel::new(Client::new(), &base, Leniency::default());
        assert_eq!(
            lenient.send_and_await(&request, Duration::from_secs(2)).await,
            Exchange::Acknowledged { status: 406 }
        );

        let mut strict = HttpChannel::new(Client::new(), &base, Leniency::strict());
        let exchange = strict.send_and_await(&request, Duration::from_secs(2)).await;
        assert!(matches!(exchange, Exchange::Failed(ref reason) if reason.contains("406")));
    }

    #[tokio::test]
    async fn test_slow_server_times_out() {
        let router = Router::new().route(
            "/mcp",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                StatusCode::OK
            }),
        );
        let base = serve(router).await;
        let mut channel = HttpChannel::new(Client::new(), &base, Leniency::default());
        let exchange = channel
            .send_and_await(
                &RequestEnvelope::new(1, "initialize", json!({})),
                Duration::from_millis(100),
            )
            .await;
        assert_eq!(exchange, Exchange::TimedOut);
        assert!(!channel.is_desynchronized());
    }
}

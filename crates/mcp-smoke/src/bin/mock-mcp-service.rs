//! Stand-in MCP service with scriptable misbehaviour, used by the integration tests

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::process::ExitCode;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

const SESSION_HEADER: &str = "mcp-session-id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Transport {
    Stdio,
    Sse,
    Streamable,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "mock-mcp-service")]
struct Args {
    #[arg(long, value_enum, default_value = "stdio")]
    transport: Transport,

    #[arg(long, default_value_t = 32122)]
    port: u16,

    /// Accepted for launch compatibility; never contacted
    #[arg(long = "browserUrl")]
    browser_url: Option<String>,

    /// Number of tools advertised by tools/list
    #[arg(long, default_value_t = 5)]
    tools: usize,

    /// Answer initialize without capabilities
    #[arg(long)]
    omit_capabilities: bool,

    /// Never answer requests for this method
    #[arg(long)]
    hang_on: Option<String>,

    /// Exit with this code before doing anything
    #[arg(long)]
    exit_immediately: Option<u8>,

    /// Exit with code 0 after answering this many requests
    #[arg(long)]
    exit_after: Option<usize>,

    /// Write a burst of diagnostic lines at startup and one per request
    #[arg(long)]
    noisy_stderr: bool,

    /// Hold back the `/sse` response headers this long
    #[arg(long, default_value_t = 0)]
    sse_header_delay_ms: u64,
}

/// What the service does with one incoming message
enum Reply {
    Answer(Value),
    Ignore,
    Hang,
}

struct Service {
    args: Args,
    answered: AtomicUsize,
    sessions: Mutex<HashMap<String, mpsc::UnboundedSender<String>>>,
    next_session: AtomicUsize,
    shutdown: CancellationToken,
}

impl Service {
    fn new(args: Args) -> Self {
        Self {
            args,
            answered: AtomicUsize::new(0),
            sessions: Mutex::new(HashMap::new()),
            next_session: AtomicUsize::new(1),
            shutdown: CancellationToken::new(),
        }
    }

    fn new_session_id(&self) -> String {
        format!("session-{}", self.next_session.fetch_add(1, Ordering::Relaxed))
    }

    fn handle(&self, message: &Value) -> Reply {
        let method = message.get("method").and_then(Value::as_str).unwrap_or("");
        let Some(id) = message.get("id").cloned() else {
            return Reply::Ignore;
        };
        if self.args.noisy_stderr {
            eprintln!("mock: handling {method} (id {id})");
        }
        if self.args.hang_on.as_deref() == Some(method) {
            eprintln!("mock: not answering {method}");
            return Reply::Hang;
        }

        let outcome = match method {
            "initialize" => Ok(self.initialize_result()),
            "tools/list" => Ok(self.tools_result()),
            "tools/call" => Ok(call_result(message.get("params"))),
            "ping" => Ok(json!({})),
            other => Err(json!({"code": -32601, "message": format!("method not found: {other}")})),
        };
        Reply::Answer(match outcome {
            Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
            Err(error) => json!({"jsonrpc": "2.0", "id": id, "error": error}),
        })
    }

    /// Count an answered request and begin shutting down once the exit threshold is reached
    fn count_answer(&self) {
        let answered = self.answered.fetch_add(1, Ordering::SeqCst) + 1;
        if self.args.exit_after.is_some_and(|limit| answered >= limit) {
            eprintln!("mock: exit threshold reached");
            // Open event streams end once their senders are gone
            self.sessions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
            self.shutdown.cancel();
        }
    }

    fn initialize_result(&self) -> Value {
        let mut result = json!({
            "protocolVersion": "2024-11-05",
            "serverInfo": {"name": "mock-mcp-service", "version": env!("CARGO_PKG_VERSION")},
        });
        if !self.args.omit_capabilities {
            result["capabilities"] = json!({"tools": {}});
        }
        result
    }

    fn tools_result(&self) -> Value {
        let tools: Vec<Value> = (0..self.args.tools)
            .map(|i| {
                let name = if i == 0 {
                    "list_pages".to_string()
                } else {
                    format!("tool_{i}")
                };
                json!({"name": name, "description": "mock tool", "inputSchema": {"type": "object"}})
            })
            .collect();
        json!({ "tools": tools })
    }
}

fn call_result(params: Option<&Value>) -> Value {
    match params.and_then(|p| p.get("name")).and_then(Value::as_str) {
        Some("list_pages") => json!({"content": [{"type": "text", "text": "0: about:blank [selected]"}]}),
        Some(name) => json!({"isError": true, "content": [{"type": "text", "text": format!("unknown tool {name}")}]}),
        None => json!({"isError": true, "content": [{"type": "text", "text": "missing tool name"}]}),
    }
}

async fn run_stdio(service: Arc<Service>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let message: Value = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(e) => {
                eprintln!("mock: ignoring unparsable line: {e}");
                continue;
            }
        };
        if let Reply::Answer(response) = service.handle(&message) {
            stdout.write_all(format!("{response}\n").as_bytes()).await?;
            stdout.flush().await?;
            service.count_answer();
            if service.shutdown.is_cancelled() {
                break;
            }
        }
    }
    Ok(())
}

type Shared = Arc<Service>;

async fn health() -> impl IntoResponse {
    axum::Json(json!({"status": "ok"}))
}

/// Stall until any harness deadline has expired or the service shuts down
async fn hang(service: &Service) -> Response {
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(3600)) => {}
        _ = service.shutdown.cancelled() => {}
    }
    StatusCode::GATEWAY_TIMEOUT.into_response()
}

async fn sse_stream(State(service): State<Shared>) -> impl IntoResponse {
    if service.args.sse_header_delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(service.args.sse_header_delay_ms)).await;
    }
    let session_id = service.new_session_id();
    let (tx, rx) = mpsc::unbounded_channel();
    service
        .sessions
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(session_id.clone(), tx);

    let endpoint = Event::default()
        .event("endpoint")
        .data(format!("/message?sessionId={session_id}"));
    let messages = UnboundedReceiverStream::new(rx)
        .map(|message| Event::default().event("message").data(message));
    let stream = tokio_stream::once(endpoint)
        .chain(messages)
        .map(Ok::<_, Infallible>);
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Deserialize)]
struct SessionQuery {
    #[serde(rename = "sessionId")]
    session_id: String,
}

async fn sse_message(
    State(service): State<Shared>,
    Query(query): Query<SessionQuery>,
    body: String,
) -> Response {
    let sender = service
        .sessions
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&query.session_id)
        .cloned();
    let Some(sender) = sender else {
        return (StatusCode::NOT_FOUND, "unknown session").into_response();
    };
    let Ok(message) = serde_json::from_str::<Value>(&body) else {
        return (StatusCode::BAD_REQUEST, "invalid JSON").into_response();
    };
    if let Reply::Answer(response) = service.handle(&message) {
        if sender.send(response.to_string()).is_err() {
            return (StatusCode::GONE, "stream closed").into_response();
        }
        drop(sender);
        service.count_answer();
    }
    StatusCode::ACCEPTED.into_response()
}

async fn streamable(State(service): State<Shared>, headers: HeaderMap, body: String) -> Response {
    let accept = headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    if !(accept.contains("application/json") && accept.contains("text/event-stream")) {
        return (
            StatusCode::NOT_ACCEPTABLE,
            "client must accept application/json and text/event-stream",
        )
            .into_response();
    }
    let Ok(message) = serde_json::from_str::<Value>(&body) else {
        return (StatusCode::BAD_REQUEST, "invalid JSON").into_response();
    };

    let session_id = match headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
        Some(id) => id.to_string(),
        None => service.new_session_id(),
    };
    match service.handle(&message) {
        Reply::Ignore => StatusCode::ACCEPTED.into_response(),
        Reply::Hang => hang(&service).await,
        Reply::Answer(response) => {
            service.count_answer();
            ([(SESSION_HEADER, session_id)], axum::Json(response)).into_response()
        }
    }
}

async fn run_http(service: Arc<Service>, transport: Transport) -> Result<()> {
    let port = service.args.port;
    let router = Router::new().route("/health", get(health));
    let router = match transport {
        Transport::Sse => router
            .route("/sse", get(sse_stream))
            .route("/message", post(sse_message)),
        _ => router.route("/mcp", post(streamable)),
    };

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .with_context(|| format!("Failed to bind port {port}"))?;
    println!("mock: listening on 127.0.0.1:{port}");
    let shutdown = service.shutdown.clone();
    axum::serve(listener, router.with_state(service))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

async fn run(args: Args) -> Result<()> {
    if let Some(url) = &args.browser_url {
        eprintln!("mock: upstream {url} is not contacted");
    }
    if args.noisy_stderr {
        for i in 0..500 {
            eprintln!("mock: startup noise line {i}");
        }
    }

    let transport = args.transport;
    let service = Arc::new(Service::new(args));
    match transport {
        Transport::Stdio => run_stdio(service).await,
        Transport::Sse | Transport::Streamable => run_http(service, transport).await,
    }
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();
    if let Some(code) = args.exit_immediately {
        eprintln!("mock: exiting immediately with code {code}");
        return Ok(ExitCode::from(code));
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build the tokio runtime")?;
    let result = runtime.block_on(run(args));
    // A pending stdin read would otherwise hold shutdown open
    runtime.shutdown_timeout(Duration::from_millis(100));
    result.map(|()| ExitCode::SUCCESS)
}

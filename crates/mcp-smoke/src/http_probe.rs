//! Plain HTTP checks run before any JSON-RPC exchange

use crate::error::ChannelError;
use mcp_smoke_core::{CorrelationIds, Leniency, StepOutcome, StepStatus};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use std::time::{Duration, Instant};
use tracing::debug;

/// `GET /health` must answer 200 with a JSON body carrying `status`
pub async fn health_check(client: &Client, base_url: &str, deadline: Duration) -> StepOutcome {
    let started = Instant::now();
    let url = format!("{base_url}/health");
    let outcome = match tokio::time::timeout(deadline, fetch_health(client, &url)).await {
        Ok(Ok(status)) => StepOutcome::pass("health_check").with_detail(status),
        Ok(Err(reason)) => StepOutcome::fail("health_check", reason),
        Err(_) => StepOutcome::timeout("health_check"),
    };
    outcome.with_elapsed_ms(started.elapsed().as_millis() as u64)
}

async fn fetch_health(client: &Client, url: &str) -> Result<String, String> {
    let response = client.get(url).send().await.map_err(describe)?;
    let status = response.status();
    if status != StatusCode::OK {
        return Err(format!("HTTP {status}"));
    }
    let body: Value = response
        .json()
        .await
        .map_err(|e| format!("health body is not JSON: {e}"))?;
    match body.get("status") {
        Some(Value::String(status)) => Ok(status.clone()),
        Some(other) => Ok(other.to_string()),
        None => Err("health body has no status field".to_string()),
    }
}

/// Bare `POST /mcp` without negotiation headers; proves the route exists
pub async fn endpoint_probe(
    client: &Client,
    base_url: &str,
    ids: &CorrelationIds,
    leniency: Leniency,
    deadline: Duration,
) -> StepOutcome {
    let started = Instant::now();
    let url = format!("{base_url}/mcp");
    let body = json!({
        "jsonrpc": "2.0",
        "id": ids.next(),
        "method": "initialize",
        "params": {},
    });
    let request = client
        .post(&url)
        .header(CONTENT_TYPE, "application/json")
        .body(body.to_string())
        .send();

    let outcome = match tokio::time::timeout(deadline, request).await {
        Err(_) => StepOutcome::timeout("mcp_endpoint"),
        Ok(Err(e)) => StepOutcome::fail("mcp_endpoint", describe(e)),
        Ok(Ok(response)) => {
            let status = response.status();
            debug!(url = %url, %status, "Endpoint probe answered");
            let accepted = status == StatusCode::OK
                || (status == StatusCode::NOT_ACCEPTABLE && leniency.accept_precondition_status);
            let step = if accepted {
                StepOutcome::new("mcp_endpoint", StepStatus::Pass)
            } else {
                StepOutcome::fail("mcp_endpoint", format!("unexpected HTTP {status}"))
            };
            step.with_detail(format!("HTTP {}", status.as_u16()))
        }
    };
    outcome.with_elapsed_ms(started.elapsed().as_millis() as u64)
}

fn describe(error: reqwest::Error) -> String {
    ChannelError::from(error).to_string()
}

//! Upstream dependency check run once before any mode starts

use mcp_smoke_core::SmokeError;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

/// Subset of the upstream `/json/version` document
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct UpstreamInfo {
    #[serde(rename = "Browser", default)]
    pub browser: Option<String>,
    #[serde(rename = "Protocol-Version", default)]
    pub protocol_version: Option<String>,
}

impl UpstreamInfo {
    pub fn describe(&self) -> &str {
        self.browser.as_deref().unwrap_or("unknown")
    }
}

/// `GET {upstream}/json/version` must answer 200 with a JSON body
pub async fn check_upstream(
    client: &Client,
    upstream_url: &str,
    deadline: Duration,
) -> Result<UpstreamInfo, SmokeError> {
    let url = format!("{}/json/version", upstream_url.trim_end_matches('/'));
    debug!(url = %url, "Checking upstream");

    let response = tokio::time::timeout(deadline, client.get(&url).send())
        .await
        .map_err(|_| {
            SmokeError::Precondition(format!(
                "{url} did not answer within {}ms",
                deadline.as_millis()
            ))
        })?
        .map_err(|e| SmokeError::Precondition(format!("{url} is unreachable: {e}")))?;

    let status = response.status();
    if status != StatusCode::OK {
        return Err(SmokeError::Precondition(format!(
            "{url} returned HTTP {status}"
        )));
    }

    let info: UpstreamInfo = response
        .json()
        .await
        .map_err(|e| SmokeError::Precondition(format!("{url} did not return JSON: {e}")))?;
    info!(browser = info.describe(), "Upstream available");
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::routing::get;
    use serde_json::json;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_upstream_available() {
        let base = serve(Router::new().route(
            "/json/version",
            get(|| async { axum::Json(json!({"Browser": "Chrome/126.0", "Protocol-Version": "1.3"})) }),
        ))
        .await;
        let info = check_upstream(&Client::new(), &base, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(info.describe(), "Chrome/126.0");
        assert_eq!(info.protocol_version.as_deref(), Some("1.3"));
    }

    #[tokio::test]
    async fn test_non_json_body_is_fatal() {
        let base = serve(Router::new().route("/json/version", get(|| async { "hello" }))).await;
        let error = check_upstream(&Client::new(), &base, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(error.is_fatal());
        assert!(error.to_string().contains("did not return JSON"));
    }

    #[tokio::test]
    async fn test_unreachable_upstream() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let error = check_upstream(
            &Client::new(),
            &format!("http://{addr}"),
            Duration::from_secs(2),
        )
        .await
        .unwrap_err();
        assert!(matches!(error, SmokeError::Precondition(ref m) if m.contains("unreachable")));
    }
}

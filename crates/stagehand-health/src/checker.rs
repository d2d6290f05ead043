//! Health check logic.
//!
//! A check is a single HTTP/1 request over a fresh TCP connection, bounded
//! by a timeout. [`check_host`] repeats checks on a fixed budget.

use std::time::Duration;

use bytes::Bytes;
use http::{Method, StatusCode};
use http_body_util::Full;
use tracing::{debug, info};

use crate::error::{HealthError, HealthResult};

/// Result of a single health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckResult {
    /// The endpoint returned 2xx.
    Healthy,
    /// The endpoint answered with non-2xx (503 while draining).
    Unhealthy,
    /// Connection failed or timed out.
    Failed,
}

/// Retry budget for [`check_host`].
#[derive(Debug, Clone, Copy)]
pub struct HealthPolicy {
    pub attempts: u32,
    pub interval: Duration,
    /// Bound on each individual attempt.
    pub timeout: Duration,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            attempts: 30,
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(2),
        }
    }
}

/// Send one request and return the response status.
pub async fn http_request(
    address: &str,
    method: Method,
    path: &str,
    body: Option<Bytes>,
    timeout: Duration,
) -> HealthResult<StatusCode> {
    let uri = format!("http://{address}{path}");

    let attempt = async {
        let stream = tokio::net::TcpStream::connect(address)
            .await
            .map_err(|e| HealthError::Connect {
                address: address.to_string(),
                reason: e.to_string(),
            })?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| HealthError::Request {
                uri: uri.clone(),
                reason: e.to_string(),
            })?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let mut builder = http::Request::builder()
            .method(method)
            .uri(&uri)
            .header("host", address)
            .header("user-agent", "stagehand-health/0.1");
        if body.is_some() {
            builder = builder.header("content-type", "application/json");
        }
        let req = builder
            .body(Full::new(body.unwrap_or_default()))
            .map_err(|e| HealthError::Request {
                uri: uri.clone(),
                reason: e.to_string(),
            })?;

        let resp = sender.send_request(req).await.map_err(|e| HealthError::Request {
            uri: uri.clone(),
            reason: e.to_string(),
        })?;
        Ok(resp.status())
    };

    match tokio::time::timeout(timeout, attempt).await {
        Ok(result) => result,
        Err(_) => Err(HealthError::Timeout { uri }),
    }
}

/// Perform a single GET check.
///
/// Returns `Healthy` if the response is 2xx, `Unhealthy` for non-2xx,
/// or `Failed` if the connection fails or times out.
pub async fn http_check(address: &str, path: &str, timeout: Duration) -> CheckResult {
    match http_request(address, Method::GET, path, None, timeout).await {
        Ok(status) if status.is_success() => CheckResult::Healthy,
        Ok(status) => {
            debug!(%status, %address, %path, "health check non-2xx");
            CheckResult::Unhealthy
        }
        Err(e) => {
            debug!(error = %e, "health check failed");
            CheckResult::Failed
        }
    }
}

/// Check `host` until it answers 2xx or the budget runs out.
pub async fn check_host(host: &str, path: &str, policy: HealthPolicy) -> HealthResult<()> {
    for attempt in 1..=policy.attempts {
        if http_check(host, path, policy.timeout).await == CheckResult::Healthy {
            info!(%host, attempt, "instance healthy");
            return Ok(());
        }
        if attempt < policy.attempts {
            tokio::time::sleep(policy.interval).await;
        }
    }
    Err(HealthError::Unhealthy {
        host: host.to_string(),
        attempts: policy.attempts,
    })
}

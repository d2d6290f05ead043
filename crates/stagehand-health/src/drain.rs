//! Drain-mode control client.

use std::time::Duration;

use bytes::Bytes;
use http::Method;
use tracing::info;

use crate::checker::http_request;
use crate::error::{HealthError, HealthResult};

/// Toggle drain mode on the instance at `host`. Anything but 200 is an error.
pub async fn set_drain(host: &str, path: &str, enabled: bool, timeout: Duration) -> HealthResult<()> {
    let body = serde_json::json!({ "enabled": enabled }).to_string();
    let status = http_request(host, Method::POST, path, Some(Bytes::from(body)), timeout).await?;
    if status != http::StatusCode::OK {
        return Err(HealthError::Status {
            uri: format!("http://{host}{path}"),
            status,
        });
    }
    info!(%host, enabled, "drain mode updated");
    Ok(())
}

use http::StatusCode;
use thiserror::Error;

pub type HealthResult<T> = Result<T, HealthError>;

#[derive(Debug, Error)]
pub enum HealthError {
    #[error("connect to {address} failed: {reason}")]
    Connect { address: String, reason: String },

    #[error("request to {uri} failed: {reason}")]
    Request { uri: String, reason: String },

    #[error("request to {uri} timed out")]
    Timeout { uri: String },

    #[error("{uri} returned {status}")]
    Status { uri: String, status: StatusCode },

    #[error("{host} did not report healthy after {attempts} attempts")]
    Unhealthy { host: String, attempts: u32 },
}

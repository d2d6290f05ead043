//! stagehand-health — talking to a Stagehand instance over HTTP.
//!
//! Used by the rollout to decide whether an instance is safe to drain and
//! whether it came back after a restart.
//!
//! # Architecture
//!
//! ```text
//! check_host()  ── retries ──▶ http_check() ──▶ GET  /<prefix>/meta/ping
//! set_drain()   ─────────────▶ http_request() ─▶ POST /<prefix>/meta/drain
//! ```
//!
//! Every attempt is bounded by its own timeout and retries come from a
//! fixed budget. Nothing here waits indefinitely.

pub mod checker;
pub mod drain;
pub mod error;

pub use checker::{CheckResult, HealthPolicy, check_host, http_check, http_request};
pub use drain::set_drain;
pub use error::{HealthError, HealthResult};

//! stagehand-proxy — multiplexing traffic across live deployments.
//!
//! # Components
//!
//! - **`router`** — the [`RoutingTable`]: stage prefix → ready deployment,
//!   plus one optional main deployment for unprefixed traffic
//! - **`sync`** — rebuilds the table from the lifecycle store on start and
//!   on a reconciliation interval
//! - **`forward`** — axum middleware that forwards matching requests to
//!   the backend's port and lets everything else fall through to the API

pub mod forward;
pub mod router;
pub mod sync;

pub use forward::{Forwarder, forward};
pub use router::{RouteEntry, RouteTarget, RoutingSnapshot, RoutingTable};
pub use sync::{ProxySync, SyncStats};

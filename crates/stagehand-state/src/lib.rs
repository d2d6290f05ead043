//! stagehand-state — the lifecycle store.
//!
//! Backed by [redb](https://docs.rs/redb), holds the four record kinds the
//! orchestrators drive: releases, stages, tests, and deployments.
//!
//! # Architecture
//!
//! Every record is JSON-serialized into a `&[u8]` value column keyed by its
//! id. Operations that must be atomic across a read and a write (test
//! sequence allocation, port claims, switching the main deployment) run
//! inside a single redb write transaction, which redb serializes.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;

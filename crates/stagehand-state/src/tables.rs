//! redb table definitions for the lifecycle store.
//!
//! Record tables use `&str` keys (the record id) and `&[u8]` values
//! (JSON-serialized records). The event log is keyed by its append
//! sequence instead.

use redb::TableDefinition;

/// Releases keyed by tag name.
pub const RELEASES: TableDefinition<&str, &[u8]> = TableDefinition::new("releases");

/// Stages keyed by `{release_id}-{env_tag}`.
pub const STAGES: TableDefinition<&str, &[u8]> = TableDefinition::new("stages");

/// Tests keyed by `{stage_id}-test-{sequence}`.
pub const TESTS: TableDefinition<&str, &[u8]> = TableDefinition::new("tests");

/// Deployments keyed by stage id.
pub const DEPLOYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployments");

/// Lifecycle events keyed by append sequence, starting at 1.
pub const EVENTS: TableDefinition<u64, &[u8]> = TableDefinition::new("events");

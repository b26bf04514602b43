//! Update core of a search shard.
//!
//! `griddle` owns the write path of a single shard: it serializes document
//! mutations against one index writer, enforces a configurable set of update
//! semantics (optimistic-concurrency versioning included), coordinates the
//! transaction log with hard and soft commits, and tracks when auto-commits
//! should fire. The read side (query planning, searchers) and the cluster
//! layer (routing, forwarding) live elsewhere; this crate talks to them
//! through the contracts in [`index`] and [`update::log`].
//!
//! The companion crate `griddle-sync` drives this handler to replay updates
//! fetched from replica peers during recovery.

pub mod config;
pub mod error;
pub mod index;
pub mod metrics;
pub mod schema;
pub mod types;
pub mod update;

pub use config::UpdateHandlerConfig;
pub use error::{GriddleError, Result};
pub use schema::Schema;
pub use types::{Document, FieldValue, ROOT_FIELD, VERSION_FIELD};
pub use update::handler::UpdateHandler;

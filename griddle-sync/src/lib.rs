//! Pull-based replica recovery for griddle shards.
//!
//! A recovering replica probes its peers' fingerprints, fetches their most
//! recent update versions, works out which updates it is missing, requests
//! exactly those (individually or as version ranges), and replays them
//! through the local update handler. Success means this replica may be
//! considered to hold the latest updates; it says nothing about the peers.

pub mod config;
pub mod sync;
pub mod transport;
pub mod types;

pub use config::SyncConfig;
pub use sync::{PeerSync, PeerSyncResult, SyncMetrics};
pub use transport::{HttpSyncClient, SyncTransport, TransportError};
pub use types::{GetParams, GetResponse};

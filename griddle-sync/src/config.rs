use serde::{Deserialize, Serialize};

/// Peer-sync configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Base URLs of the replica peers, e.g. `http://node-b:7700/shard1`.
    pub peers: Vec<String>,
    /// Size of the recent-updates window exchanged with peers.
    pub n_updates: usize,
    /// Hard cap on the number of updates requested before failing the sync.
    pub max_updates: usize,
    /// Treat an unreachable peer as success for the versions fetch. Used
    /// when the peer being down means it cannot have newer data.
    pub cant_reach_is_success: bool,
    /// Treat a peer reporting zero versions as success.
    pub get_no_versions_is_success: bool,
    /// Ask peers to serve updates only while they are active.
    pub only_if_active: bool,
    /// Exchange fingerprints to short-circuit and to verify replay.
    pub do_fingerprint: bool,
    /// Request version ranges instead of individual versions when the peer
    /// supports it.
    pub use_range_versions: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            peers: Vec::new(),
            n_updates: 100,
            max_updates: 100,
            cant_reach_is_success: false,
            get_no_versions_is_success: true,
            only_if_active: false,
            do_fingerprint: true,
            use_range_versions: true,
        }
    }
}

impl SyncConfig {
    pub fn new(peers: Vec<String>, n_updates: usize) -> Self {
        SyncConfig {
            peers,
            n_updates,
            max_updates: n_updates,
            ..Default::default()
        }
    }
}

/// Kill switch for fingerprinting, independent of the per-sync config.
pub fn fingerprint_disabled_by_env() -> bool {
    std::env::var("GRIDDLE_DISABLE_FINGERPRINT")
        .map(|v| v == "true")
        .unwrap_or(false)
}

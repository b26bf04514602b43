use griddle::index::fingerprint::IndexFingerprint;
use griddle::update::LogEntry;
use serde::{Deserialize, Serialize};

/// Query parameters of a `/get` request. Every request carries
/// `qt=/get&distrib=false`; the rest depends on the purpose.
#[derive(Debug, Clone, Default)]
pub struct GetParams {
    pub get_versions: Option<usize>,
    pub get_fingerprint: Option<i64>,
    pub get_updates: Option<String>,
    /// Ask the peer to include its fingerprint in the response.
    pub fingerprint: bool,
    pub check_can_handle_version_ranges: bool,
    pub only_if_active: bool,
    pub peersync: bool,
}

impl GetParams {
    /// Fetch the peer's `n` most recent versions.
    pub fn versions(n: usize, fingerprint: bool) -> Self {
        GetParams {
            get_versions: Some(n),
            fingerprint,
            ..Default::default()
        }
    }

    /// Fetch the peer's fingerprint up to `max_version`.
    pub fn fingerprint_probe(max_version: i64) -> Self {
        GetParams {
            get_fingerprint: Some(max_version),
            ..Default::default()
        }
    }

    /// Capability probe for range-form `getUpdates`.
    pub fn can_handle_version_ranges() -> Self {
        GetParams {
            check_can_handle_version_ranges: true,
            ..Default::default()
        }
    }

    /// Fetch raw update records: `spec` is a comma-separated list of
    /// versions or `lo...hi` ranges.
    pub fn updates(spec: String, fingerprint: bool, only_if_active: bool) -> Self {
        GetParams {
            get_updates: Some(spec),
            fingerprint,
            only_if_active,
            peersync: true,
            ..Default::default()
        }
    }

    /// The wire form, query-string style.
    pub fn to_query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![
            ("qt".to_string(), "/get".to_string()),
            ("distrib".to_string(), "false".to_string()),
        ];
        if let Some(n) = self.get_versions {
            pairs.push(("getVersions".to_string(), n.to_string()));
        }
        if let Some(v) = self.get_fingerprint {
            pairs.push(("getFingerprint".to_string(), v.to_string()));
        }
        if let Some(spec) = &self.get_updates {
            pairs.push(("getUpdates".to_string(), spec.clone()));
        }
        if self.fingerprint {
            pairs.push(("fingerprint".to_string(), "true".to_string()));
        }
        if self.check_can_handle_version_ranges {
            pairs.push(("checkCanHandleVersionRanges".to_string(), "true".to_string()));
        }
        if self.only_if_active {
            pairs.push(("onlyIfActive".to_string(), "true".to_string()));
        }
        if self.peersync {
            pairs.push(("peersync".to_string(), "true".to_string()));
        }
        pairs
    }
}

/// Body of a `/get` response; fields are present according to the request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GetResponse {
    pub versions: Option<Vec<i64>>,
    pub fingerprint: Option<IndexFingerprint>,
    pub can_handle_version_ranges: Option<bool>,
    pub updates: Option<Vec<LogEntry>>,
}

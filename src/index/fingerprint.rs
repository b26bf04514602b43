use crate::error::Result;
use serde::{Deserialize, Serialize};

/// A digest of every document version at or below a chosen ceiling.
///
/// Two shards with matching fingerprints hold the same visible state up to
/// that ceiling. The hash is an order-independent sum, so it can be computed
/// from any iteration order of the version set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexFingerprint {
    /// The ceiling the caller asked for.
    pub max_version_specified: i64,
    /// Highest version seen while computing, including ones above the
    /// ceiling.
    pub max_version_encountered: i64,
    /// Highest version that contributed to the hash.
    pub max_in_hash: i64,
    /// Order-independent sum of per-version hashes.
    pub versions_hash: i64,
    pub num_versions: u64,
}

impl IndexFingerprint {
    /// Digest all versions with `|v| <= max_version`.
    pub fn compute<I>(versions: I, max_version: i64) -> IndexFingerprint
    where
        I: IntoIterator<Item = i64>,
    {
        let mut fp = IndexFingerprint {
            max_version_specified: max_version,
            ..Default::default()
        };
        for v in versions {
            let v = v.abs();
            if v > fp.max_version_encountered {
                fp.max_version_encountered = v;
            }
            if v > max_version {
                continue;
            }
            if v > fp.max_in_hash {
                fp.max_in_hash = v;
            }
            fp.versions_hash = fp.versions_hash.wrapping_add(hash64(v));
            fp.num_versions += 1;
        }
        fp
    }

    /// Equality as peer sync sees it: same ceiling, same count, same hash.
    /// `max_version_encountered` is deliberately excluded — it reflects
    /// traffic beyond the ceiling, not visible state.
    pub fn matches(&self, other: &IndexFingerprint) -> bool {
        self.max_version_specified == other.max_version_specified
            && self.num_versions == other.num_versions
            && self.max_in_hash == other.max_in_hash
            && self.versions_hash == other.versions_hash
    }
}

/// 64-bit finalizer (murmur3 fmix64).
fn hash64(v: i64) -> i64 {
    let mut h = v as u64;
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51afd7ed558ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ceb9fe1a85ec53);
    h ^= h >> 33;
    h as i64
}

/// Computes fingerprints over the shard's current visible state.
pub trait FingerprintSource: Send + Sync {
    fn fingerprint(&self, max_version: i64) -> Result<IndexFingerprint>;
}

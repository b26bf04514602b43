use crate::config::{fingerprint_disabled_by_env, SyncConfig};
use crate::transport::{SyncTransport, TransportError};
use crate::types::{GetParams, GetResponse};
use griddle::index::fingerprint::{FingerprintSource, IndexFingerprint};
use griddle::update::{
    AddCommand, DeleteCommand, LogEntry, LogOp, UpdateFlags, UpdateHandler, UpdateLog,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

/// Outcome of a sync attempt. Success means this replica may be considered
/// up to date; it does not mean the remote peers are in sync with us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerSyncResult {
    success: bool,
    other_has_versions: Option<bool>,
}

impl PeerSyncResult {
    pub fn success() -> Self {
        PeerSyncResult {
            success: true,
            other_has_versions: None,
        }
    }

    pub fn failure() -> Self {
        PeerSyncResult {
            success: false,
            other_has_versions: None,
        }
    }

    pub fn failure_with(other_has_versions: bool) -> Self {
        PeerSyncResult {
            success: false,
            other_has_versions: Some(other_has_versions),
        }
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    /// Whether any peer reported versions while we had none.
    pub fn other_has_versions(&self) -> Option<bool> {
        self.other_has_versions
    }
}

/// Sync counters: attempts that were skipped via the fingerprint shortcut,
/// failed attempts, and time spent in actual syncs.
#[derive(Default)]
pub struct SyncMetrics {
    errors: AtomicU64,
    skipped: AtomicU64,
    syncs: AtomicU64,
    total_time_ms: AtomicU64,
    last_time_ms: AtomicU64,
}

impl SyncMetrics {
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn syncs(&self) -> u64 {
        self.syncs.load(Ordering::Relaxed)
    }

    pub fn total_time_ms(&self) -> u64 {
        self.total_time_ms.load(Ordering::Relaxed)
    }

    pub fn last_time_ms(&self) -> u64 {
        self.last_time_ms.load(Ordering::Relaxed)
    }

    fn inc_errors(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    fn record_time(&self, elapsed: Duration) {
        let ms = elapsed.as_millis() as u64;
        self.syncs.fetch_add(1, Ordering::Relaxed);
        self.total_time_ms.fetch_add(ms, Ordering::Relaxed);
        self.last_time_ms.store(ms, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Purpose {
    Versions,
    Updates,
}

struct PeerState {
    replica: String,
    fingerprint: Option<IndexFingerprint>,
    /// Comparison deferred until all responses are in, because updates may
    /// still arrive from another peer.
    do_fingerprint_comparison: bool,
    total_requested: usize,
}

struct SyncCtx {
    our_updates: Vec<i64>,
    our_set: HashSet<i64>,
    requested: HashSet<i64>,
    /// 80th percentile of our window (the older region).
    low: i64,
    /// 20th percentile of our window (the newer region).
    high: i64,
    highest: i64,
}

type SyncTask = (usize, Purpose, Result<GetResponse, TransportError>);

/// Brings the local replica up to date by requesting the at-most-N most
/// recent updates known to a set of peers and replaying them through the
/// local update handler.
pub struct PeerSync {
    core_name: String,
    config: SyncConfig,
    handler: Arc<UpdateHandler>,
    log: Arc<dyn UpdateLog>,
    fingerprints: Arc<dyn FingerprintSource>,
    transport: Arc<dyn SyncTransport>,
    metrics: Arc<SyncMetrics>,
    starting_versions: Option<Vec<i64>>,
    do_fingerprint: bool,
}

impl PeerSync {
    pub fn new(
        core_name: impl Into<String>,
        config: SyncConfig,
        handler: Arc<UpdateHandler>,
        log: Arc<dyn UpdateLog>,
        fingerprints: Arc<dyn FingerprintSource>,
        transport: Arc<dyn SyncTransport>,
    ) -> Self {
        let do_fingerprint = config.do_fingerprint && !fingerprint_disabled_by_env();
        PeerSync {
            core_name: core_name.into(),
            config,
            handler,
            log,
            fingerprints,
            transport,
            metrics: Arc::new(SyncMetrics::default()),
            starting_versions: None,
            do_fingerprint,
        }
    }

    /// The updates we had before possibly receiving new ones (state at
    /// startup). When set, they anchor the overlap thresholds.
    pub fn set_starting_versions(&mut self, versions: Vec<i64>) {
        self.starting_versions = Some(versions);
    }

    pub fn metrics(&self) -> &Arc<SyncMetrics> {
        &self.metrics
    }

    /// Requests and applies recent updates from the peers.
    pub async fn sync(&self) -> PeerSyncResult {
        tracing::info!(
            "[SYNC {}] start replicas={:?} nUpdates={}",
            self.core_name,
            self.config.peers,
            self.config.n_updates
        );

        if self.do_fingerprint && self.already_in_sync().await {
            self.metrics.inc_skipped();
            return PeerSyncResult::success();
        }

        // measured only when an actual sync is performed
        let start = Instant::now();
        let result = self.do_sync().await;
        self.metrics.record_time(start.elapsed());
        if !result.is_success() {
            self.metrics.inc_errors();
        }
        tracing::info!(
            "[SYNC {}] done, sync {}",
            self.core_name,
            if result.is_success() {
                "succeeded"
            } else {
                "failed"
            }
        );
        result
    }

    async fn already_in_sync(&self) -> bool {
        let mut tasks = JoinSet::new();
        for replica in &self.config.peers {
            let transport = Arc::clone(&self.transport);
            let replica = replica.clone();
            tasks.spawn(async move {
                let result = transport
                    .get(&replica, &GetParams::fingerprint_probe(i64::MAX))
                    .await;
                (replica, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let Ok((replica, result)) = joined else {
                continue;
            };
            match result {
                Ok(resp) => {
                    let Some(other) = resp.fingerprint else {
                        tracing::warn!(
                            "[SYNC {}] {} did not return a fingerprint",
                            self.core_name,
                            replica
                        );
                        continue;
                    };
                    match self.fingerprints.fingerprint(i64::MAX) {
                        Ok(ours) if ours.matches(&other) => {
                            tracing::info!(
                                "[SYNC {}] already in sync with {}, skipping",
                                self.core_name,
                                replica
                            );
                            return true;
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!(
                            "[SYNC {}] could not confirm sync state: {}",
                            self.core_name,
                            e
                        ),
                    }
                }
                Err(e) => tracing::warn!(
                    "[SYNC {}] fingerprint probe to {} failed: {}",
                    self.core_name,
                    replica,
                    e
                ),
            }
        }
        false
    }

    async fn do_sync(&self) -> PeerSyncResult {
        let n = self.config.n_updates;
        let mut peers: Vec<PeerState> = self
            .config
            .peers
            .iter()
            .map(|replica| PeerState {
                replica: replica.clone(),
                fingerprint: None,
                do_fingerprint_comparison: false,
                total_requested: 0,
            })
            .collect();

        // Fire the version requests before reading our own recent updates,
        // so their windows cannot trail ours.
        let mut tasks: JoinSet<SyncTask> = JoinSet::new();
        for (idx, peer) in peers.iter().enumerate() {
            let transport = Arc::clone(&self.transport);
            let replica = peer.replica.clone();
            let params = GetParams::versions(n, self.do_fingerprint);
            tasks.spawn(async move {
                (idx, Purpose::Versions, transport.get(&replica, &params).await)
            });
        }

        let mut our_updates = self.log.recent_versions(n);
        sort_abs_desc(&mut our_updates);

        let (low, high) = if let Some(starting) = &self.starting_versions {
            if starting.is_empty() {
                tracing::warn!(
                    "[SYNC {}] no frame of reference to tell if we've missed updates",
                    self.core_name
                );
                return PeerSyncResult::failure();
            }
            let mut starting = starting.clone();
            sort_abs_desc(&mut starting);
            let low = percentile(&starting, 0.8);
            let high = percentile(&starting, 0.2);

            // the starting updates must overlap what we have now
            let smallest_new = our_updates.last().map(|v| v.abs()).unwrap_or(i64::MAX);
            if starting[0].abs() < smallest_new {
                tracing::warn!(
                    "[SYNC {}] too many updates received since start, startingVersions no longer overlap our window",
                    self.core_name
                );
                return PeerSyncResult::failure();
            }
            for &v in &starting {
                if v.abs() < smallest_new {
                    our_updates.push(v);
                }
            }
            sort_abs_desc(&mut our_updates);
            (low, high)
        } else if !our_updates.is_empty() {
            (percentile(&our_updates, 0.8), percentile(&our_updates, 0.2))
        } else {
            // No versions at all: no frame of reference to use a peer's
            // updates. Drain the in-flight responses to find out whether
            // anyone else has data.
            tracing::info!(
                "[SYNC {}] we have no versions, sync failed",
                self.core_name
            );
            let mut other_has_versions = false;
            while let Some(joined) = tasks.join_next().await {
                if let Ok((_, _, Ok(resp))) = joined {
                    if resp.versions.map(|v| !v.is_empty()).unwrap_or(false) {
                        other_has_versions = true;
                    }
                }
            }
            return PeerSyncResult::failure_with(other_has_versions);
        };

        let mut ctx = SyncCtx {
            highest: our_updates.first().copied().unwrap_or(0),
            our_set: our_updates.iter().copied().collect(),
            requested: HashSet::new(),
            our_updates,
            low,
            high,
        };

        while let Some(joined) = tasks.join_next().await {
            let (idx, purpose, result) = match joined {
                Ok(v) => v,
                Err(e) => {
                    tracing::error!("[SYNC {}] sync task failed: {}", self.core_name, e);
                    return PeerSyncResult::failure();
                }
            };
            let ok = self
                .handle_response(idx, purpose, result, &mut ctx, &mut peers, &mut tasks)
                .await;
            if !ok {
                tasks.abort_all();
                return PeerSyncResult::failure();
            }
        }

        // finish up the comparisons we deferred
        for peer in &peers {
            if peer.do_fingerprint_comparison && !self.compare_fingerprint(peer) {
                return PeerSyncResult::failure();
            }
        }
        PeerSyncResult::success()
    }

    async fn handle_response(
        &self,
        idx: usize,
        purpose: Purpose,
        result: Result<GetResponse, TransportError>,
        ctx: &mut SyncCtx,
        peers: &mut Vec<PeerState>,
        tasks: &mut JoinSet<SyncTask>,
    ) -> bool {
        let resp = match result {
            Err(e) => {
                // Only the versions fetch may be forgiven: if the peer died
                // between handing out versions and serving updates, we
                // counted on data we will not get.
                if self.config.cant_reach_is_success
                    && purpose == Purpose::Versions
                    && e.is_unreachable()
                {
                    tracing::warn!(
                        "[SYNC {}] couldn't reach {}, counting as success: {}",
                        self.core_name,
                        peers[idx].replica,
                        e
                    );
                    return true;
                }
                tracing::warn!(
                    "[SYNC {}] exception talking to {}, failed: {}",
                    self.core_name,
                    peers[idx].replica,
                    e
                );
                return false;
            }
            Ok(resp) => resp,
        };

        match purpose {
            Purpose::Versions => self.handle_versions(idx, resp, ctx, peers, tasks).await,
            Purpose::Updates => self.handle_updates(idx, resp, peers),
        }
    }

    async fn handle_versions(
        &self,
        idx: usize,
        resp: GetResponse,
        ctx: &mut SyncCtx,
        peers: &mut Vec<PeerState>,
        tasks: &mut JoinSet<SyncTask>,
    ) -> bool {
        let mut other = resp.versions.unwrap_or_default();
        if let Some(fp) = resp.fingerprint {
            peers[idx].fingerprint = Some(fp);
        }
        tracing::info!(
            "[SYNC {}] received {} versions from {}",
            self.core_name,
            other.len(),
            peers[idx].replica
        );

        if other.is_empty() {
            return self.config.get_no_versions_is_success;
        }

        // fewer than requested means we hold their complete list
        let complete_list = other.len() < self.config.n_updates;
        sort_abs_desc(&mut other);

        let other_high = percentile(&other, 0.2);
        let other_low = percentile(&other, 0.8);
        let other_highest = other[0];

        if ctx.high < other_low {
            // Small overlap and ours is older: using this peer could miss
            // updates in between.
            tracing::info!(
                "[SYNC {}] our versions are too old. ourHighThreshold={} otherLowThreshold={} ourHighest={} otherHighest={}",
                self.core_name, ctx.high, other_low, ctx.highest, other_highest
            );
            return false;
        }

        if ctx.low > other_high {
            // Ours is newer: replaying this peer could resurrect deleted
            // docs. We pass; the peer's own sync against us should fail.
            tracing::info!(
                "[SYNC {}] our versions are newer. ourLowThreshold={} otherHigh={} ourHighest={} otherHighest={}",
                self.core_name, ctx.low, other_high, ctx.highest, other_highest
            );
            return true;
        }

        let use_ranges =
            self.config.use_range_versions && self.peer_can_handle_ranges(&peers[idx].replica).await;

        let (spec, total) = if use_ranges {
            let (ranges, total) = build_ranges(&ctx.our_updates, &other, complete_list, ctx.low);
            if ranges.is_empty() {
                return self.nothing_to_request(idx, peers, ctx, other_high, other_highest);
            }
            (ranges.join(","), total)
        } else {
            let mut to_request = Vec::new();
            for &v in &other {
                // stop when entries get old enough that reorders could make
                // us fetch updates we do not need
                if !complete_list && v.abs() < ctx.low {
                    break;
                }
                if ctx.our_set.contains(&v) || ctx.requested.contains(&v) {
                    continue;
                }
                to_request.push(v);
                ctx.requested.insert(v);
            }
            if to_request.is_empty() {
                return self.nothing_to_request(idx, peers, ctx, other_high, other_highest);
            }
            let spec = to_request
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(",");
            (spec, to_request.len())
        };

        if total > self.config.max_updates {
            tracing::info!(
                "[SYNC {}] failing, requested updates ({}) exceed maxUpdates ({})",
                self.core_name,
                total,
                self.config.max_updates
            );
            return false;
        }

        peers[idx].total_requested = total;
        tracing::info!(
            "[SYNC {}] requesting updates from {} n={} versions={}",
            self.core_name,
            peers[idx].replica,
            total,
            spec
        );

        let transport = Arc::clone(&self.transport);
        let replica = peers[idx].replica.clone();
        let params = GetParams::updates(spec, self.do_fingerprint, self.config.only_if_active);
        tasks.spawn(async move { (idx, Purpose::Updates, transport.get(&replica, &params).await) });
        true
    }

    /// We had (or already requested elsewhere) everything this peer has.
    fn nothing_to_request(
        &self,
        idx: usize,
        peers: &mut [PeerState],
        ctx: &SyncCtx,
        other_high: i64,
        other_highest: i64,
    ) -> bool {
        tracing::info!(
            "[SYNC {}] no additional versions requested. ourLowThreshold={} otherHigh={} ourHighest={} otherHighest={}",
            self.core_name,
            ctx.low,
            other_high,
            ctx.highest,
            other_highest
        );
        // Updates may still arrive from another peer, so the fingerprint
        // comparison has to wait until all responses are in.
        if self.do_fingerprint {
            peers[idx].do_fingerprint_comparison = true;
        }
        true
    }

    async fn peer_can_handle_ranges(&self, replica: &str) -> bool {
        match self
            .transport
            .get(replica, &GetParams::can_handle_version_ranges())
            .await
        {
            Ok(resp) => resp.can_handle_version_ranges.unwrap_or(false),
            Err(e) => {
                tracing::warn!(
                    "[SYNC {}] capability probe to {} failed: {}",
                    self.core_name,
                    replica,
                    e
                );
                false
            }
        }
    }

    fn handle_updates(&self, idx: usize, resp: GetResponse, peers: &mut [PeerState]) -> bool {
        let mut updates = resp.updates.unwrap_or_default();
        if updates.len() < peers[idx].total_requested {
            tracing::error!(
                "[SYNC {}] requested {} updates from {} but retrieved {}",
                self.core_name,
                peers[idx].total_requested,
                peers[idx].replica,
                updates.len()
            );
            return false;
        }

        // the fingerprint here supersedes the one from the versions fetch
        if let Some(fp) = resp.fingerprint {
            peers[idx].fingerprint = Some(fp);
        }

        // apply oldest first
        updates.sort_by_key(|e| e.version.abs());

        if !self.apply_updates(&updates, &peers[idx].replica) {
            return false;
        }
        self.compare_fingerprint(&peers[idx])
    }

    fn apply_updates(&self, updates: &[LogEntry], replica: &str) -> bool {
        let mut last_version = 0i64;
        for entry in updates {
            // consecutive identical versions are the same update seen twice
            if entry.version == last_version && entry.version != 0 {
                continue;
            }
            last_version = entry.version;

            let result = match entry.op {
                LogOp::Add | LogOp::UpdateInPlace => {
                    let Some(doc) = entry.doc.clone() else {
                        tracing::error!(
                            "[SYNC {}] update record {} from {} has no document",
                            self.core_name,
                            entry.version,
                            replica
                        );
                        return false;
                    };
                    let mut cmd = AddCommand::new(doc);
                    cmd.version = entry.version;
                    cmd.requested_version = entry.version;
                    cmd.leader_logic = false;
                    cmd.flags = UpdateFlags::peer_sync_replay();
                    if entry.op == LogOp::UpdateInPlace {
                        cmd.in_place = true;
                        cmd.prev_version = entry.prev_version.unwrap_or(0);
                    }
                    tracing::debug!(
                        "[SYNC {}] replay add version={} id={}",
                        self.core_name,
                        entry.version,
                        cmd.doc.id
                    );
                    self.handler.add_doc(&cmd).map(|_| ())
                }
                LogOp::Delete => {
                    let Some(id) = entry.id.clone() else {
                        tracing::error!(
                            "[SYNC {}] delete record {} from {} has no id",
                            self.core_name,
                            entry.version,
                            replica
                        );
                        return false;
                    };
                    let mut cmd = DeleteCommand::by_id(id);
                    cmd.version = entry.version;
                    cmd.requested_version = entry.version;
                    cmd.leader_logic = false;
                    cmd.flags = UpdateFlags::peer_sync_replay();
                    self.handler.delete(&cmd)
                }
                LogOp::DeleteByQuery => {
                    let Some(query) = entry.query.clone() else {
                        tracing::error!(
                            "[SYNC {}] delete-by-query record {} from {} has no query",
                            self.core_name,
                            entry.version,
                            replica
                        );
                        return false;
                    };
                    let mut cmd = DeleteCommand::by_query(query);
                    cmd.version = entry.version;
                    cmd.requested_version = entry.version;
                    cmd.leader_logic = false;
                    cmd.flags = UpdateFlags::peer_sync_replay();
                    self.handler.delete_by_query(&cmd)
                }
            };

            if let Err(e) = result {
                tracing::error!(
                    "[SYNC {}] error applying update version {} from {}: {}",
                    self.core_name,
                    entry.version,
                    replica,
                    e
                );
                return false;
            }
        }
        true
    }

    fn compare_fingerprint(&self, peer: &PeerState) -> bool {
        let Some(other) = peer.fingerprint else {
            return true;
        };
        // compare only up to the ceiling the peer used, otherwise updates
        // we hold beyond it would poison the hash
        match self.fingerprints.fingerprint(other.max_version_specified) {
            Ok(ours) => {
                let matched = ours.matches(&other);
                if matched {
                    tracing::info!(
                        "[SYNC {}] fingerprint matched {}",
                        self.core_name,
                        peer.replica
                    );
                } else {
                    tracing::info!(
                        "[SYNC {}] fingerprint mismatch with {}: ours={:?} theirs={:?}",
                        self.core_name,
                        peer.replica,
                        ours,
                        other
                    );
                }
                matched
            }
            Err(e) => {
                tracing::error!(
                    "[SYNC {}] error computing index fingerprint: {}",
                    self.core_name,
                    e
                );
                false
            }
        }
    }
}

fn sort_abs_desc(versions: &mut [i64]) {
    versions.sort_by_key(|v| std::cmp::Reverse(v.abs()));
}

/// Positional percentile over a `|v|`-descending list: `frac` 0.2 lands in
/// the newer region, 0.8 in the older region.
fn percentile(sorted_desc: &[i64], frac: f64) -> i64 {
    let idx = ((sorted_desc.len() as f64) * frac) as usize;
    sorted_desc[idx.min(sorted_desc.len() - 1)].abs()
}

/// Walk both `|v|`-descending lists from the oldest end and produce
/// `lo...hi` ranges covering the peer versions we are missing. Returns the
/// ranges and the number of versions they span.
fn build_ranges(
    ours: &[i64],
    others: &[i64],
    complete_list: bool,
    our_low_threshold: i64,
) -> (Vec<String>, usize) {
    let mut ranges = Vec::new();
    let mut total = 0usize;

    let mut our_idx = ours.len() as isize - 1;
    let mut other_idx = others.len() as isize - 1;

    while other_idx >= 0 {
        if our_idx < 0 {
            // we ran out; take all the remaining peer versions
            ranges.push(format!(
                "{}...{}",
                others[other_idx as usize], others[0]
            ));
            total += other_idx as usize + 1;
            break;
        }

        let other = others[other_idx as usize];
        // stop when the entries get old enough that reorders may lead us
        // to see updates we don't need
        if !complete_list && other.abs() < our_low_threshold {
            break;
        }

        let our = ours[our_idx as usize];
        if our == other {
            our_idx -= 1;
            other_idx -= 1;
        } else if our.abs() < other.abs() {
            our_idx -= 1;
        } else {
            let range_start = other;
            while other_idx >= 0 && others[other_idx as usize].abs() < our.abs() {
                other_idx -= 1;
                total += 1;
            }
            ranges.push(format!(
                "{}...{}",
                range_start,
                others[(other_idx + 1) as usize]
            ));
        }
    }

    (ranges, total)
}

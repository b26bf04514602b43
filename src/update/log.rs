use crate::types::Document;
use crate::update::commands::{AddCommand, CommitCommand, DeleteCommand};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Operation code of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LogOp {
    Add,
    Delete,
    DeleteByQuery,
    UpdateInPlace,
}

/// One record of the transaction log; also the wire form peer sync
/// exchanges.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub op: LogOp,
    /// Signed version; negative marks a delete tombstone.
    pub version: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_version: Option<i64>,
    /// The document payload; the last element of the record on the wire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<Document>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogState {
    Active,
    Buffering,
    Closed,
}

/// A delete-by-query retained for reorder protection.
#[derive(Debug, Clone, PartialEq)]
pub struct DbqRecord {
    pub query: String,
    /// Absolute version of the delete.
    pub version: i64,
}

/// The append-only journal the update handler coordinates with.
///
/// The `pre_commit` → writer commit → `post_commit` sequence is bracketed by
/// the handler's update lock; implementations may assume no other log
/// mutation interleaves with it on the same shard.
pub trait UpdateLog: Send + Sync {
    fn add(&self, cmd: &AddCommand, under_update_lock: bool);
    fn delete(&self, cmd: &DeleteCommand);
    fn delete_by_query(&self, cmd: &DeleteCommand);
    fn delete_all(&self);

    /// Latest signed version recorded for the key; negative values come
    /// from tombstones.
    fn lookup_version(&self, id: &str) -> Option<i64>;

    /// Delete-by-query records with `|version| > version`.
    fn get_dbq_newer(&self, version: i64) -> Vec<DbqRecord>;

    /// The most recent versions, `|v|` descending, at most `n`.
    fn recent_versions(&self, n: usize) -> Vec<i64>;

    fn pre_commit(&self, cmd: &CommitCommand);
    fn post_commit(&self, cmd: &CommitCommand);
    fn pre_soft_commit(&self, cmd: &CommitCommand);
    fn post_soft_commit(&self, cmd: &CommitCommand);

    fn open_realtime_searcher(&self);

    fn has_uncommitted_changes(&self) -> bool;
    fn state(&self) -> LogState;

    fn total_size(&self) -> u64;
    fn total_logs(&self) -> usize;

    fn close(&self, commit_pending: bool);
}

const DEFAULT_WINDOW: usize = 4096;
const MAX_RETAINED_DBQS: usize = 100;

/// In-memory update log: a bounded recent-entries window, the id → latest
/// version map, and the retained delete-by-query list.
pub struct MemoryUpdateLog {
    inner: Mutex<LogInner>,
    window: usize,
}

struct LogInner {
    entries: VecDeque<LogEntry>,
    versions: HashMap<String, i64>,
    dbqs: VecDeque<DbqRecord>,
    uncommitted: u64,
    state: LogState,
    bytes: u64,
    realtime_opens: u64,
}

impl Default for MemoryUpdateLog {
    fn default() -> Self {
        MemoryUpdateLog::new(DEFAULT_WINDOW)
    }
}

impl MemoryUpdateLog {
    pub fn new(window: usize) -> Self {
        MemoryUpdateLog {
            inner: Mutex::new(LogInner {
                entries: VecDeque::new(),
                versions: HashMap::new(),
                dbqs: VecDeque::new(),
                uncommitted: 0,
                state: LogState::Active,
                bytes: 0,
                realtime_opens: 0,
            }),
            window,
        }
    }

    fn push(&self, inner: &mut LogInner, entry: LogEntry) {
        inner.bytes += serde_json::to_vec(&entry).map(|v| v.len() as u64).unwrap_or(0);
        inner.entries.push_back(entry);
        while inner.entries.len() > self.window {
            inner.entries.pop_front();
        }
        inner.uncommitted += 1;
    }

    /// The recent entries, newest window, `|version|` descending. Serves the
    /// peer-sync `getUpdates` surface.
    pub fn recent_entries(&self, n: usize) -> Vec<LogEntry> {
        let inner = self.inner.lock();
        let mut entries: Vec<LogEntry> = inner.entries.iter().cloned().collect();
        entries.sort_by_key(|e| std::cmp::Reverse(e.version.abs()));
        entries.truncate(n);
        entries
    }

    /// Entries whose version is in `versions`, any order.
    pub fn entries_for(&self, versions: &[i64]) -> Vec<LogEntry> {
        let inner = self.inner.lock();
        inner
            .entries
            .iter()
            .filter(|e| versions.contains(&e.version))
            .cloned()
            .collect()
    }

    pub fn realtime_opens(&self) -> u64 {
        self.inner.lock().realtime_opens
    }

    pub fn entry_count(&self) -> usize {
        self.inner.lock().entries.len()
    }
}

impl UpdateLog for MemoryUpdateLog {
    fn add(&self, cmd: &AddCommand, _under_update_lock: bool) {
        let mut inner = self.inner.lock();
        inner.versions.insert(cmd.doc.id.clone(), cmd.version);
        let entry = LogEntry {
            op: if cmd.in_place {
                LogOp::UpdateInPlace
            } else {
                LogOp::Add
            },
            version: cmd.version,
            id: Some(cmd.doc.id.clone()),
            query: None,
            prev_version: (cmd.prev_version != 0).then_some(cmd.prev_version),
            doc: Some(cmd.doc.clone()),
        };
        self.push(&mut inner, entry);
    }

    fn delete(&self, cmd: &DeleteCommand) {
        let mut inner = self.inner.lock();
        let id = cmd.id.clone().unwrap_or_default();
        let version = -cmd.version.abs();
        inner.versions.insert(id.clone(), version);
        let entry = LogEntry {
            op: LogOp::Delete,
            version,
            id: Some(id),
            query: None,
            prev_version: None,
            doc: None,
        };
        self.push(&mut inner, entry);
    }

    fn delete_by_query(&self, cmd: &DeleteCommand) {
        let mut inner = self.inner.lock();
        let version = -cmd.version.abs();
        let query = cmd.query.clone().unwrap_or_default();
        inner.dbqs.push_back(DbqRecord {
            query: query.clone(),
            version: version.abs(),
        });
        while inner.dbqs.len() > MAX_RETAINED_DBQS {
            inner.dbqs.pop_front();
        }
        let entry = LogEntry {
            op: LogOp::DeleteByQuery,
            version,
            id: None,
            query: Some(query),
            prev_version: None,
            doc: None,
        };
        self.push(&mut inner, entry);
    }

    fn delete_all(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.versions.clear();
        inner.dbqs.clear();
        inner.uncommitted = 0;
        inner.bytes = 0;
    }

    fn lookup_version(&self, id: &str) -> Option<i64> {
        self.inner.lock().versions.get(id).copied()
    }

    fn get_dbq_newer(&self, version: i64) -> Vec<DbqRecord> {
        let inner = self.inner.lock();
        inner
            .dbqs
            .iter()
            .filter(|d| d.version > version.abs())
            .cloned()
            .collect()
    }

    fn recent_versions(&self, n: usize) -> Vec<i64> {
        let inner = self.inner.lock();
        let mut versions: Vec<i64> = inner.entries.iter().map(|e| e.version).collect();
        versions.sort_by_key(|v| std::cmp::Reverse(v.abs()));
        versions.truncate(n);
        versions
    }

    fn pre_commit(&self, _cmd: &CommitCommand) {}

    fn post_commit(&self, _cmd: &CommitCommand) {
        self.inner.lock().uncommitted = 0;
    }

    fn pre_soft_commit(&self, _cmd: &CommitCommand) {}

    fn post_soft_commit(&self, _cmd: &CommitCommand) {}

    fn open_realtime_searcher(&self) {
        self.inner.lock().realtime_opens += 1;
    }

    fn has_uncommitted_changes(&self) -> bool {
        self.inner.lock().uncommitted > 0
    }

    fn state(&self) -> LogState {
        self.inner.lock().state
    }

    fn total_size(&self) -> u64 {
        self.inner.lock().bytes
    }

    fn total_logs(&self) -> usize {
        if self.inner.lock().entries.is_empty() {
            0
        } else {
            1
        }
    }

    fn close(&self, _commit_pending: bool) {
        self.inner.lock().state = LogState::Closed;
    }
}

/// Issues strictly increasing versions: the high bits carry wall-clock
/// milliseconds, the low 20 bits a sequence number, so versions order by
/// time across restarts while staying dense within a burst.
pub struct VersionClock {
    last: AtomicI64,
}

impl Default for VersionClock {
    fn default() -> Self {
        VersionClock::new()
    }
}

impl VersionClock {
    pub fn new() -> Self {
        VersionClock {
            last: AtomicI64::new(0),
        }
    }

    pub fn next(&self) -> i64 {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        let candidate = millis << 20;
        let mut last = self.last.load(Ordering::Acquire);
        loop {
            let next = if candidate > last { candidate } else { last + 1 };
            match self
                .last
                .compare_exchange(last, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }
}

use crate::update::commands::CommitCommand;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Decides when an automatic commit should fire, based on the number of
/// pending documents and elapsed time. One instance tracks hard commits,
/// another tracks soft commits.
///
/// Scheduling is a single timer thread per tracker; only the nearest
/// pending deadline is materialized, and an earlier schedule always wins
/// over a later one.
pub struct CommitTracker {
    name: &'static str,
    docs_upper_bound: i64,
    time_upper_bound_ms: i64,
    open_searcher: bool,
    is_soft: bool,
    docs_since_commit: AtomicI64,
    commit_count: AtomicU64,
    state: Mutex<SchedState>,
    signal: Condvar,
    on_commit: Box<dyn Fn(CommitCommand) + Send + Sync>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Default)]
struct SchedState {
    deadline: Option<Instant>,
    shutdown: bool,
}

impl CommitTracker {
    pub fn new(
        name: &'static str,
        docs_upper_bound: i64,
        time_upper_bound_ms: i64,
        open_searcher: bool,
        is_soft: bool,
        on_commit: Box<dyn Fn(CommitCommand) + Send + Sync>,
    ) -> Arc<Self> {
        let tracker = Arc::new(CommitTracker {
            name,
            docs_upper_bound,
            time_upper_bound_ms,
            open_searcher,
            is_soft,
            docs_since_commit: AtomicI64::new(0),
            commit_count: AtomicU64::new(0),
            state: Mutex::new(SchedState::default()),
            signal: Condvar::new(),
            on_commit,
            thread: Mutex::new(None),
        });

        let runner = Arc::clone(&tracker);
        let handle = std::thread::Builder::new()
            .name(format!("commit-tracker-{}", name))
            .spawn(move || runner.run())
            .expect("failed to spawn commit tracker thread");
        *tracker.thread.lock() = Some(handle);

        tracing::debug!(
            "[TRACKER {}] started, maxDocs={}, maxTime={}ms, openSearcher={}",
            name,
            docs_upper_bound,
            time_upper_bound_ms,
            open_searcher
        );
        tracker
    }

    pub fn added_document(&self, commit_within_ms: i64) {
        self.docs_since_commit.fetch_add(1, Ordering::AcqRel);
        self.maybe_schedule(commit_within_ms);
    }

    pub fn deleted_document(&self, commit_within_ms: i64) {
        self.docs_since_commit.fetch_add(1, Ordering::AcqRel);
        self.maybe_schedule(commit_within_ms);
    }

    fn maybe_schedule(&self, commit_within_ms: i64) {
        if self.docs_upper_bound > 0
            && self.docs_since_commit.load(Ordering::Acquire) >= self.docs_upper_bound
        {
            self.schedule_commit_within(0);
        } else if commit_within_ms > 0 {
            self.schedule_commit_within(commit_within_ms);
        } else if self.time_upper_bound_ms > 0 {
            let mut state = self.state.lock();
            if state.deadline.is_none() && !state.shutdown {
                state.deadline =
                    Some(Instant::now() + Duration::from_millis(self.time_upper_bound_ms as u64));
                self.signal.notify_all();
            }
        }
    }

    /// Schedule a commit at `now + delay_ms`. A later deadline than the one
    /// already pending is a no-op; an earlier one replaces it.
    pub fn schedule_commit_within(&self, delay_ms: i64) {
        let deadline = Instant::now() + Duration::from_millis(delay_ms.max(0) as u64);
        let mut state = self.state.lock();
        if state.shutdown {
            return;
        }
        match state.deadline {
            Some(existing) if existing <= deadline => {}
            _ => {
                state.deadline = Some(deadline);
                self.signal.notify_all();
            }
        }
    }

    pub fn cancel_pending_commit(&self) {
        let mut state = self.state.lock();
        if state.deadline.take().is_some() {
            tracing::debug!("[TRACKER {}] cancelled pending commit", self.name);
            self.signal.notify_all();
        }
    }

    pub fn has_pending_commit(&self) -> bool {
        self.state.lock().deadline.is_some()
    }

    pub fn did_commit(&self) {
        self.docs_since_commit.store(0, Ordering::Release);
        self.commit_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn did_rollback(&self) {
        self.docs_since_commit.store(0, Ordering::Release);
        self.cancel_pending_commit();
    }

    pub fn commit_count(&self) -> u64 {
        self.commit_count.load(Ordering::Acquire)
    }

    pub fn docs_since_commit(&self) -> i64 {
        self.docs_since_commit.load(Ordering::Acquire)
    }

    pub fn docs_upper_bound(&self) -> i64 {
        self.docs_upper_bound
    }

    pub fn time_upper_bound_ms(&self) -> i64 {
        self.time_upper_bound_ms
    }

    pub fn open_searcher(&self) -> bool {
        self.open_searcher
    }

    /// Stop the scheduler thread. Idempotent; any pending commit is
    /// discarded.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            state.shutdown = true;
            state.deadline = None;
            self.signal.notify_all();
        }
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
        tracing::debug!("[TRACKER {}] closed", self.name);
    }

    fn run(self: Arc<Self>) {
        loop {
            let fire = {
                let mut state = self.state.lock();
                loop {
                    if state.shutdown {
                        return;
                    }
                    match state.deadline {
                        None => self.signal.wait(&mut state),
                        Some(deadline) => {
                            if Instant::now() >= deadline {
                                state.deadline = None;
                                break true;
                            }
                            let _ = self.signal.wait_until(&mut state, deadline);
                        }
                    }
                }
            };
            if fire {
                self.fire();
            }
        }
    }

    fn fire(&self) {
        tracing::info!("[TRACKER {}] scheduled commit firing", self.name);
        let cmd = CommitCommand {
            soft_commit: self.is_soft,
            open_searcher: self.open_searcher,
            wait_searcher: false,
            ..CommitCommand::hard()
        };
        (self.on_commit)(cmd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn tracker_with_counter(
        docs_bound: i64,
        time_bound_ms: i64,
    ) -> (Arc<CommitTracker>, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);
        let tracker = CommitTracker::new(
            "test",
            docs_bound,
            time_bound_ms,
            true,
            false,
            Box::new(move |_cmd| {
                fired2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (tracker, fired)
    }

    fn wait_for(fired: &AtomicUsize, n: usize) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if fired.load(Ordering::SeqCst) >= n {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn docs_bound_triggers_commit() {
        let (tracker, fired) = tracker_with_counter(2, -1);
        tracker.added_document(-1);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tracker.added_document(-1);
        assert!(wait_for(&fired, 1));
        tracker.close();
    }

    #[test]
    fn commit_within_schedules() {
        let (tracker, fired) = tracker_with_counter(-1, -1);
        tracker.added_document(10);
        assert!(wait_for(&fired, 1));
        tracker.close();
    }

    #[test]
    fn time_bound_schedules_once() {
        let (tracker, fired) = tracker_with_counter(-1, 30);
        tracker.added_document(-1);
        tracker.added_document(-1);
        assert!(wait_for(&fired, 1));
        // one deadline for both documents
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        tracker.close();
    }

    #[test]
    fn disabled_bounds_never_fire() {
        let (tracker, fired) = tracker_with_counter(-1, -1);
        tracker.added_document(-1);
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!tracker.has_pending_commit());
        tracker.close();
    }

    #[test]
    fn earlier_schedule_wins() {
        let (tracker, fired) = tracker_with_counter(-1, -1);
        tracker.schedule_commit_within(10_000);
        tracker.schedule_commit_within(10);
        assert!(wait_for(&fired, 1));
        tracker.close();
    }

    #[test]
    fn later_schedule_is_noop() {
        let (tracker, _fired) = tracker_with_counter(-1, -1);
        tracker.schedule_commit_within(50);
        let before = tracker.state.lock().deadline;
        tracker.schedule_commit_within(10_000);
        let after = tracker.state.lock().deadline;
        assert_eq!(before, after);
        tracker.close();
    }

    #[test]
    fn cancel_prevents_fire() {
        let (tracker, fired) = tracker_with_counter(-1, -1);
        tracker.schedule_commit_within(40);
        tracker.cancel_pending_commit();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tracker.close();
    }

    #[test]
    fn did_commit_resets_pending_docs() {
        let (tracker, _fired) = tracker_with_counter(-1, -1);
        tracker.added_document(-1);
        tracker.added_document(-1);
        assert_eq!(tracker.docs_since_commit(), 2);
        tracker.did_commit();
        assert_eq!(tracker.docs_since_commit(), 0);
        assert_eq!(tracker.commit_count(), 1);
        tracker.close();
    }

    #[test]
    fn did_rollback_cancels_and_resets() {
        let (tracker, fired) = tracker_with_counter(-1, -1);
        tracker.added_document(-1);
        tracker.schedule_commit_within(40);
        tracker.did_rollback();
        assert_eq!(tracker.docs_since_commit(), 0);
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(tracker.commit_count(), 0);
        tracker.close();
    }

    #[test]
    fn close_is_idempotent() {
        let (tracker, _fired) = tracker_with_counter(-1, -1);
        tracker.close();
        tracker.close();
    }
}

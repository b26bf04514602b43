//! End-to-end update handler scenarios over the in-memory index: semantics
//! enforcement, optimistic concurrency, commit behavior, delete-by-query
//! version protection, and auto-commit wiring.

use griddle::config::UpdateHandlerConfig;
use griddle::error::GriddleError;
use griddle::index::memory::MemoryIndex;
use griddle::index::{Query, SearcherOpener, Term};
use griddle::schema::Schema;
use griddle::types::{Document, FieldValue};
use griddle::update::{
    AddCommand, CommitCommand, DeleteCommand, MemoryUpdateLog, RollbackCommand, SemanticsMode,
    UpdateFlags, UpdateHandler, UpdateLog, VersionClock,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Fixture {
    handler: Arc<UpdateHandler>,
    index: Arc<MemoryIndex>,
    log: Arc<MemoryUpdateLog>,
    clock: Arc<VersionClock>,
}

fn schema() -> Schema {
    Schema::builder()
        .unique_key("id")
        .version_field()
        .doc_values_only("popularity")
        .build()
}

fn fixture(config: UpdateHandlerConfig) -> Fixture {
    let index = MemoryIndex::new("shard1", "id");
    let log = Arc::new(MemoryUpdateLog::default());
    let dyn_log: Arc<dyn UpdateLog> = Arc::clone(&log) as Arc<dyn UpdateLog>;
    let handler = UpdateHandler::new(
        "shard1",
        config,
        schema(),
        index.writer(),
        Arc::clone(&index) as Arc<dyn SearcherOpener>,
        Some(dyn_log),
    )
    .unwrap();
    Fixture {
        handler,
        index,
        log,
        clock: Arc::new(VersionClock::new()),
    }
}

fn default_fixture() -> Fixture {
    fixture(UpdateHandlerConfig::default())
}

fn add_cmd(fx: &Fixture, id: &str, requested_version: i64) -> AddCommand {
    let mut cmd = AddCommand::new(Document::new(id));
    cmd.requested_version = requested_version;
    cmd.version = fx.clock.next();
    cmd
}

// ── insert / update semantics ───────────────────────────────────────────

#[test]
fn insert_then_commit_makes_doc_searchable() {
    let fx = default_fixture();
    assert_eq!(fx.index.searcher().num_docs(), 0);

    // a negative requested version means "insert"
    fx.handler.add_doc(&add_cmd(&fx, "A", -1)).unwrap();
    fx.handler.commit(&CommitCommand::hard()).unwrap();

    let searcher = fx.index.searcher();
    assert_eq!(searcher.count(&Query::Term(Term::new("id", "A"))), 1);
    fx.handler.close().unwrap();
}

#[test]
fn update_of_missing_doc_is_rejected() {
    let fx = default_fixture();

    // a positive requested version means "update existing"
    let err = fx.handler.add_doc(&add_cmd(&fx, "A", 1234)).unwrap_err();
    assert!(matches!(err, GriddleError::DocDoesNotExist { .. }));
    fx.handler.close().unwrap();
}

#[test]
fn strict_update_mode_rejects_any_missing_doc() {
    let config = UpdateHandlerConfig {
        semantics_mode: SemanticsMode::StrictUpdate,
        ..Default::default()
    };
    let fx = fixture(config);

    // even without a version assertion
    let err = fx.handler.add_doc(&add_cmd(&fx, "A", 0)).unwrap_err();
    assert!(matches!(err, GriddleError::DocDoesNotExist { .. }));
    fx.handler.close().unwrap();
}

#[test]
fn version_conflict_reports_current_version() {
    let fx = default_fixture();
    let cmd = add_cmd(&fx, "A", 0);
    let stored_version = cmd.version;
    fx.handler.add_doc(&cmd).unwrap();

    let err = fx
        .handler
        .add_doc(&add_cmd(&fx, "A", stored_version + 1))
        .unwrap_err();
    match err {
        GriddleError::VersionConflict {
            current, requested, ..
        } => {
            assert_eq!(current, stored_version);
            assert_eq!(requested, stored_version + 1);
        }
        other => panic!("expected VersionConflict, got {other:?}"),
    }
    fx.handler.close().unwrap();
}

#[test]
fn matching_version_updates_the_doc() {
    let fx = default_fixture();
    let cmd = add_cmd(&fx, "A", 0);
    let stored_version = cmd.version;
    fx.handler.add_doc(&cmd).unwrap();

    let mut update = add_cmd(&fx, "A", stored_version);
    update.doc.set_field("title", FieldValue::Text("two".into()));
    fx.handler.add_doc(&update).unwrap();

    assert_eq!(
        fx.index.get("A").unwrap().fields.get("title"),
        Some(&FieldValue::Text("two".into()))
    );
    fx.handler.close().unwrap();
}

#[test]
fn deleted_doc_counts_as_absent() {
    let fx = default_fixture();
    fx.handler.add_doc(&add_cmd(&fx, "A", -1)).unwrap();

    let mut del = DeleteCommand::by_id("A");
    del.version = fx.clock.next();
    fx.handler.delete(&del).unwrap();

    // insert-only succeeds again after the tombstone
    fx.handler.add_doc(&add_cmd(&fx, "A", -1)).unwrap();
    fx.handler.close().unwrap();
}

#[test]
fn partial_batch_reports_per_doc_errors() {
    let fx = default_fixture();
    fx.handler.add_doc(&add_cmd(&fx, "A", -2)).unwrap();

    let batch = vec![add_cmd(&fx, "A", -2), add_cmd(&fx, "B", -1234)];
    let err = fx.handler.add_batch(&batch).unwrap_err();
    match err {
        GriddleError::PartialErrors {
            errors,
            total,
            per_doc,
        } => {
            assert_eq!(errors, 1);
            assert_eq!(total, 2);
            assert!(matches!(
                per_doc[0],
                Some(GriddleError::DocAlreadyExists { .. })
            ));
            assert!(per_doc[1].is_none());
        }
        other => panic!("expected PartialErrors, got {other:?}"),
    }
    // B was applied despite A failing
    assert!(fx.index.get("B").is_some());
    fx.handler.close().unwrap();
}

#[test]
fn classic_mode_overwrites_without_checks() {
    let config = UpdateHandlerConfig {
        semantics_mode: SemanticsMode::Classic,
        ..Default::default()
    };
    let fx = fixture(config);

    fx.handler.add_doc(&add_cmd(&fx, "A", 0)).unwrap();
    fx.handler.add_doc(&add_cmd(&fx, "A", 0)).unwrap();
    assert_eq!(fx.index.realtime_searcher().num_docs(), 1);
    fx.handler.close().unwrap();
}

#[test]
fn semantics_override_applies_per_request() {
    let config = UpdateHandlerConfig {
        semantics_mode: SemanticsMode::Classic,
        ..Default::default()
    };
    let fx = fixture(config);
    fx.handler.add_doc(&add_cmd(&fx, "A", 0)).unwrap();

    let mut cmd = add_cmd(&fx, "A", 0);
    cmd.semantics_override = Some(SemanticsMode::StrictInsert);
    let err = fx.handler.add_doc(&cmd).unwrap_err();
    assert!(matches!(err, GriddleError::DocAlreadyExists { .. }));
    fx.handler.close().unwrap();
}

// ── optimistic concurrency ──────────────────────────────────────────────

#[test]
fn concurrent_read_modify_write_converges() {
    const WRITERS: usize = 50;
    let fx = default_fixture();
    let handler = Arc::clone(&fx.handler);
    let log = Arc::clone(&fx.log);
    let index = Arc::clone(&fx.index);
    let clock = Arc::clone(&fx.clock);

    let mut threads = Vec::new();
    for _ in 0..WRITERS {
        let handler = Arc::clone(&handler);
        let log = Arc::clone(&log);
        let index = Arc::clone(&index);
        let clock = Arc::clone(&clock);
        threads.push(std::thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(30);
            while Instant::now() < deadline {
                let current = log.lookup_version("A").unwrap_or(-1);
                let result = if current < 0 {
                    let mut doc = Document::new("A");
                    doc.set_field("popularity", FieldValue::Integer(1));
                    let mut cmd = AddCommand::new(doc);
                    cmd.requested_version = -1;
                    cmd.version = clock.next();
                    handler.add_doc(&cmd)
                } else {
                    let doc = match index.get("A") {
                        Some(d) => d,
                        None => continue,
                    };
                    let popularity = match doc.fields.get("popularity") {
                        Some(FieldValue::Integer(n)) => *n,
                        _ => continue,
                    };
                    let mut updated = Document::new("A");
                    updated.set_field("popularity", FieldValue::Integer(popularity + 1));
                    let mut cmd = AddCommand::new(updated);
                    cmd.requested_version = current;
                    cmd.version = clock.next();
                    handler.add_doc(&cmd)
                };
                match result {
                    Ok(_) => return true,
                    Err(e) if e.is_conflict() => {
                        std::thread::sleep(Duration::from_millis(rand::random::<u64>() % 3));
                        continue;
                    }
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
            false
        }));
    }

    for t in threads {
        assert!(t.join().unwrap(), "writer timed out");
    }

    let doc = fx.index.get("A").unwrap();
    assert_eq!(
        doc.fields.get("popularity"),
        Some(&FieldValue::Integer(WRITERS as i64))
    );
    fx.handler.close().unwrap();
}

// ── commits and counters ────────────────────────────────────────────────

#[test]
fn docs_pending_tracks_commit_interval() {
    let fx = default_fixture();
    for i in 0..3 {
        fx.handler.add_doc(&add_cmd(&fx, &format!("doc{i}"), -1)).unwrap();
    }
    assert_eq!(fx.handler.metrics().docs_pending(), 3);

    fx.handler.commit(&CommitCommand::hard()).unwrap();
    assert_eq!(fx.handler.metrics().docs_pending(), 0);
    assert!(!fx.log.has_uncommitted_changes());
    fx.handler.close().unwrap();
}

#[test]
fn prepare_commit_neither_opens_searcher_nor_resets_pending() {
    let fx = default_fixture();
    fx.handler.add_doc(&add_cmd(&fx, "A", -1)).unwrap();
    let opens_before = fx.index.searcher_opens();

    let cmd = CommitCommand {
        prepare_commit: true,
        ..CommitCommand::hard()
    };
    fx.handler.commit(&cmd).unwrap();

    assert!(fx.index.was_prepared());
    assert_eq!(fx.index.searcher_opens(), opens_before);
    assert_eq!(fx.handler.metrics().docs_pending(), 1);
    assert_eq!(fx.index.searcher().num_docs(), 0);
    fx.handler.close().unwrap();
}

#[test]
fn soft_commit_opens_searcher_without_flushing() {
    let fx = default_fixture();
    fx.handler.add_doc(&add_cmd(&fx, "A", -1)).unwrap();

    fx.handler.commit(&CommitCommand::soft()).unwrap();

    // visible to searchers, but the log still holds uncommitted changes
    assert_eq!(fx.index.searcher().num_docs(), 1);
    assert!(fx.log.has_uncommitted_changes());
    assert_eq!(fx.handler.soft_commit_tracker().commit_count(), 1);
    assert_eq!(fx.handler.commit_tracker().commit_count(), 0);
    fx.handler.close().unwrap();
}

#[test]
fn hard_commit_without_searcher_refreshes_realtime() {
    let fx = default_fixture();
    fx.handler.add_doc(&add_cmd(&fx, "A", -1)).unwrap();
    let realtime_before = fx.index.realtime_opens();

    let cmd = CommitCommand {
        open_searcher: false,
        ..CommitCommand::hard()
    };
    fx.handler.commit(&cmd).unwrap();

    assert_eq!(fx.index.searcher().num_docs(), 0);
    assert!(fx.index.realtime_opens() > realtime_before);
    assert!(!fx.log.has_uncommitted_changes());
    fx.handler.close().unwrap();
}

#[test]
fn optimize_merges_down_to_requested_segments() {
    let fx = default_fixture();
    for i in 0..4 {
        fx.handler.add_doc(&add_cmd(&fx, &format!("doc{i}"), -1)).unwrap();
        fx.handler.commit(&CommitCommand::hard()).unwrap();
    }
    assert!(fx.index.segment_count() > 1);

    let cmd = CommitCommand {
        optimize: true,
        max_optimize_segments: 1,
        ..CommitCommand::hard()
    };
    fx.handler.commit(&cmd).unwrap();
    assert_eq!(fx.index.segment_count(), 1);

    let stats = fx.handler.statistics();
    assert_eq!(stats.optimizes, 1);
    fx.handler.close().unwrap();
}

#[test]
fn commit_hooks_fire_for_their_flavor() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    let fx = default_fixture();
    let hard_fired = Arc::new(AtomicUsize::new(0));
    let soft_fired = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&hard_fired);
    fx.handler.add_post_commit_hook(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let counter = Arc::clone(&soft_fired);
    fx.handler.add_post_soft_commit_hook(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    fx.handler.commit(&CommitCommand::hard()).unwrap();
    assert_eq!(hard_fired.load(Ordering::SeqCst), 1);
    assert_eq!(soft_fired.load(Ordering::SeqCst), 0);

    fx.handler.commit(&CommitCommand::soft()).unwrap();
    assert_eq!(soft_fired.load(Ordering::SeqCst), 1);
    fx.handler.close().unwrap();
}

#[test]
fn rollback_discards_uncommitted_and_rewinds_counters() {
    let fx = default_fixture();
    fx.handler.add_doc(&add_cmd(&fx, "A", -1)).unwrap();
    fx.handler.commit(&CommitCommand::hard()).unwrap();
    fx.handler.add_doc(&add_cmd(&fx, "B", -1)).unwrap();

    fx.handler.rollback(&RollbackCommand::default()).unwrap();

    assert!(fx.index.get("A").is_some());
    assert!(fx.index.get("B").is_none());
    assert_eq!(fx.handler.metrics().docs_pending(), 0);
    let stats = fx.handler.statistics();
    assert_eq!(stats.rollbacks, 1);
    assert_eq!(stats.cumulative_adds, 1);
    fx.handler.close().unwrap();
}

#[test]
fn rollback_is_refused_when_cluster_aware() {
    let config = UpdateHandlerConfig {
        cluster_aware: true,
        ..Default::default()
    };
    let fx = fixture(config);
    let err = fx.handler.rollback(&RollbackCommand::default()).unwrap_err();
    assert!(matches!(err, GriddleError::WrongUsage(_)));
    fx.handler.close().unwrap();
}

// ── auto-commit wiring ──────────────────────────────────────────────────

#[test]
fn ignore_autocommit_suppresses_scheduling() {
    let config = UpdateHandlerConfig {
        auto_commit_max_docs: 1,
        commit_within_soft_commit: false,
        ..Default::default()
    };
    let fx = fixture(config);

    let mut cmd = add_cmd(&fx, "A", -1);
    cmd.flags = UpdateFlags::peer_sync_replay();
    fx.handler.add_doc(&cmd).unwrap();

    std::thread::sleep(Duration::from_millis(80));
    assert_eq!(fx.handler.commit_tracker().commit_count(), 0);
    assert!(!fx.handler.commit_tracker().has_pending_commit());
    assert_eq!(fx.handler.metrics().docs_pending(), 1);
    fx.handler.close().unwrap();
}

#[test]
fn doc_bound_autocommit_fires() {
    let config = UpdateHandlerConfig {
        auto_commit_max_docs: 2,
        commit_within_soft_commit: false,
        ..Default::default()
    };
    let fx = fixture(config);

    fx.handler.add_doc(&add_cmd(&fx, "A", -1)).unwrap();
    fx.handler.add_doc(&add_cmd(&fx, "B", -1)).unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline && fx.handler.commit_tracker().commit_count() == 0 {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(fx.handler.commit_tracker().commit_count() >= 1);
    assert_eq!(fx.handler.metrics().docs_pending(), 0);
    fx.handler.close().unwrap();
}

#[test]
fn commit_within_routes_to_soft_tracker() {
    let fx = default_fixture();

    let mut cmd = add_cmd(&fx, "A", -1);
    cmd.commit_within = 20;
    fx.handler.add_doc(&cmd).unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline && fx.handler.soft_commit_tracker().commit_count() == 0 {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(fx.handler.soft_commit_tracker().commit_count() >= 1);
    // the soft commit opened a searcher
    assert_eq!(fx.index.searcher().num_docs(), 1);
    fx.handler.close().unwrap();
}

// ── delete by query ─────────────────────────────────────────────────────

#[test]
fn match_all_wipe_empties_index_and_log() {
    let fx = default_fixture();
    fx.handler.add_doc(&add_cmd(&fx, "A", -1)).unwrap();
    fx.handler.add_doc(&add_cmd(&fx, "B", -1)).unwrap();

    let mut dbq = DeleteCommand::by_query("*:*");
    dbq.version = -i64::MAX;
    fx.handler.delete_by_query(&dbq).unwrap();

    assert_eq!(fx.index.realtime_searcher().num_docs(), 0);
    assert_eq!(fx.log.entry_count(), 0);
    assert!(!fx.log.has_uncommitted_changes());
    fx.handler.close().unwrap();
}

#[test]
fn dbq_does_not_remove_newer_writes() {
    let fx = default_fixture();
    let old = add_cmd(&fx, "old", -1);
    let old_version = old.version;
    fx.handler.add_doc(&old).unwrap();
    fx.handler.add_doc(&add_cmd(&fx, "new", -1)).unwrap();

    // delete at a version between the two writes
    let mut dbq = DeleteCommand::by_query("*:*");
    dbq.version = -(old_version + 1);
    fx.handler.delete_by_query(&dbq).unwrap();

    assert!(fx.index.get("old").is_none());
    assert!(fx.index.get("new").is_some());
    // and the delete was logged
    assert!(fx.log.recent_versions(10).contains(&-(old_version + 1)));
    fx.handler.close().unwrap();
}

#[test]
fn reordered_dbq_is_replayed_after_add() {
    let fx = default_fixture();

    // a follower sees the delete-by-query first...
    let mut dbq = DeleteCommand::by_query("color:red");
    dbq.version = fx.clock.next();
    dbq.leader_logic = false;
    fx.handler.delete_by_query(&dbq).unwrap();

    // ...then an add that logically preceded it arrives
    let mut doc = Document::new("A");
    doc.set_field("color", FieldValue::Text("red".into()));
    let mut cmd = AddCommand::new(doc);
    cmd.leader_logic = false;
    cmd.version = 1; // older than the delete
    fx.handler.add_doc(&cmd).unwrap();

    // the newer delete wins over the reordered add
    assert!(fx.index.get("A").is_none());
    fx.handler.close().unwrap();
}

// ── in-place updates and dedup terms ────────────────────────────────────

#[test]
fn in_place_update_merges_doc_values_fields() {
    let fx = default_fixture();
    let mut base = Document::new("A");
    base.set_field("title", FieldValue::Text("keep me".into()));
    let mut cmd = AddCommand::new(base);
    cmd.requested_version = -1;
    cmd.version = fx.clock.next();
    fx.handler.add_doc(&cmd).unwrap();
    let first_version = cmd.version;

    let mut inplace_doc = Document::new("A");
    inplace_doc.set_field("popularity", FieldValue::Integer(9));
    let mut inplace = AddCommand::new(inplace_doc);
    inplace.in_place = true;
    inplace.prev_version = first_version;
    inplace.requested_version = first_version;
    inplace.version = fx.clock.next();
    fx.handler.add_doc(&inplace).unwrap();

    let doc = fx.index.get("A").unwrap();
    assert_eq!(doc.fields.get("title"), Some(&FieldValue::Text("keep me".into())));
    assert_eq!(doc.fields.get("popularity"), Some(&FieldValue::Integer(9)));
    fx.handler.close().unwrap();
}

#[test]
fn in_place_update_rejects_indexed_fields() {
    let fx = default_fixture();
    fx.handler.add_doc(&add_cmd(&fx, "A", -1)).unwrap();

    let mut doc = Document::new("A");
    doc.set_field("title", FieldValue::Text("not doc-values".into()));
    let mut cmd = AddCommand::new(doc);
    cmd.in_place = true;
    cmd.version = fx.clock.next();
    let err = fx.handler.add_doc(&cmd).unwrap_err();
    assert!(matches!(err, GriddleError::WrongUsage(_)));
    fx.handler.close().unwrap();
}

#[test]
fn dedup_update_term_keeps_id_unique() {
    let fx = default_fixture();

    let mut doc = Document::new("A");
    doc.set_field("signature", FieldValue::Text("sig1".into()));
    let mut cmd = AddCommand::new(doc);
    cmd.update_term = Some(Term::new("signature", "sig1"));
    cmd.version = fx.clock.next();
    cmd.requested_version = -1;
    fx.handler.add_doc(&cmd).unwrap();

    assert_eq!(fx.index.realtime_searcher().num_docs(), 1);
    fx.handler.close().unwrap();
}

// ── close sequence ──────────────────────────────────────────────────────

#[test]
fn close_commits_pending_changes() {
    let fx = default_fixture();
    fx.handler.add_doc(&add_cmd(&fx, "A", -1)).unwrap();
    assert!(fx.log.has_uncommitted_changes());

    fx.handler.close().unwrap();

    assert!(!fx.log.has_uncommitted_changes());
    assert_eq!(fx.log.state(), griddle::update::LogState::Closed);
    // committed durably, but close does not open a searcher
    assert_eq!(fx.index.searcher().num_docs(), 0);
}

#[test]
fn operations_after_close_fail_cleanly() {
    let fx = default_fixture();
    fx.handler.close().unwrap();
    let err = fx.handler.add_doc(&add_cmd(&fx, "A", -1)).unwrap_err();
    assert!(matches!(err, GriddleError::WriterClosed));
}

#[test]
fn clear_index_bypasses_version_protection() {
    let fx = default_fixture();
    fx.handler.add_doc(&add_cmd(&fx, "A", -1)).unwrap();
    fx.handler.clear_index().unwrap();
    assert_eq!(fx.index.realtime_searcher().num_docs(), 0);
    assert_eq!(fx.log.entry_count(), 0);
    fx.handler.close().unwrap();
}

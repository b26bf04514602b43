use crate::config::UpdateHandlerConfig;
use crate::error::{GriddleError, Result};
use crate::index::{CoreState, IndexWriter, Query, SearcherOpener, Term};
use crate::metrics::{MetricsSnapshot, UpdateMetrics};
use crate::schema::Schema;
use crate::types::{Document, ROOT_FIELD};
use crate::update::commands::{
    AddCommand, CommitCommand, DeleteCommand, MergeIndexesCommand, RollbackCommand, SplitCommand,
};
use crate::update::commit_tracker::CommitTracker;
use crate::update::log::{DbqRecord, LogState, UpdateLog};
use crate::update::semantics::SemanticsMode;
use parking_lot::{Mutex, MutexGuard};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

/// The collaborator `split` delegates the actual index splitting to.
pub trait IndexSplitter: Send + Sync {
    fn split(&self, cmd: &SplitCommand) -> Result<()>;
}

const VERSION_BUCKETS: usize = 256;

/// Striped per-key locks serializing the leader's version lookup with the
/// mutation it gates.
struct VersionBuckets {
    locks: Vec<Mutex<()>>,
}

impl VersionBuckets {
    fn new(n: usize) -> Self {
        VersionBuckets {
            locks: (0..n).map(|_| Mutex::new(())).collect(),
        }
    }

    fn lock(&self, id: &str) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        self.locks[(hasher.finish() as usize) % self.locks.len()].lock()
    }
}

/// Applies document mutations directly to the shard's index writer,
/// coordinates them with the update log, and drives hard/soft commits.
///
/// All operations are callable from any thread. One hard commit proceeds at
/// a time; soft commits serialize their searcher swap under the update lock.
pub struct UpdateHandler {
    core_name: String,
    config: UpdateHandlerConfig,
    schema: Schema,
    core: CoreState,
    searcher: Arc<dyn SearcherOpener>,
    log: Option<Arc<dyn UpdateLog>>,
    metrics: Arc<UpdateMetrics>,
    commit_tracker: Arc<CommitTracker>,
    soft_commit_tracker: Arc<CommitTracker>,
    semantics_mode: SemanticsMode,
    version_buckets: VersionBuckets,
    post_commit_hooks: Mutex<Vec<CommitHook>>,
    post_soft_commit_hooks: Mutex<Vec<CommitHook>>,
}

type CommitHook = Box<dyn Fn(&CommitCommand) + Send + Sync>;

impl UpdateHandler {
    pub fn new(
        core_name: impl Into<String>,
        config: UpdateHandlerConfig,
        schema: Schema,
        writer: Arc<dyn IndexWriter>,
        searcher: Arc<dyn SearcherOpener>,
        log: Option<Arc<dyn UpdateLog>>,
    ) -> Result<Arc<Self>> {
        let core_name = core_name.into();
        let mode = config.semantics_mode;

        let rar = mode.require_unique_key_field_in_schema();
        if rar.enforced && schema.unique_key_field().is_none() {
            return Err(GriddleError::WrongUsage(rar.reason.to_string()));
        }
        let rar = mode.require_update_log();
        if rar.enforced && log.is_none() {
            return Err(GriddleError::WrongUsage(rar.reason.to_string()));
        }

        tracing::info!("[UPDATE {}] using semantics mode {}", core_name, mode);

        let metrics = Arc::new(UpdateMetrics::default());
        let handler = Arc::new_cyclic(|weak: &Weak<UpdateHandler>| {
            let commit_tracker = CommitTracker::new(
                "hard",
                config.auto_commit_max_docs,
                config.auto_commit_max_time_ms,
                config.auto_commit_open_searcher,
                false,
                Self::tracker_callback(weak.clone()),
            );
            let soft_commit_tracker = CommitTracker::new(
                "soft",
                config.auto_soft_commit_max_docs,
                config.auto_soft_commit_max_time_ms,
                true,
                true,
                Self::tracker_callback(weak.clone()),
            );
            UpdateHandler {
                semantics_mode: mode,
                core: CoreState::new(writer),
                searcher,
                log,
                metrics,
                commit_tracker,
                soft_commit_tracker,
                schema,
                config,
                core_name,
                version_buckets: VersionBuckets::new(VERSION_BUCKETS),
                post_commit_hooks: Mutex::new(Vec::new()),
                post_soft_commit_hooks: Mutex::new(Vec::new()),
            }
        });
        Ok(handler)
    }

    fn tracker_callback(weak: Weak<UpdateHandler>) -> Box<dyn Fn(CommitCommand) + Send + Sync> {
        Box::new(move |cmd| {
            if let Some(handler) = weak.upgrade() {
                if let Err(e) = handler.commit(&cmd) {
                    tracing::error!(
                        "[UPDATE {}] scheduled commit failed: {}",
                        handler.core_name,
                        e
                    );
                }
            }
        })
    }

    pub fn metrics(&self) -> &Arc<UpdateMetrics> {
        &self.metrics
    }

    pub fn commit_tracker(&self) -> &Arc<CommitTracker> {
        &self.commit_tracker
    }

    pub fn soft_commit_tracker(&self) -> &Arc<CommitTracker> {
        &self.soft_commit_tracker
    }

    pub fn update_log(&self) -> Option<&Arc<dyn UpdateLog>> {
        self.log.as_ref()
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Run after every hard commit.
    pub fn add_post_commit_hook(&self, hook: impl Fn(&CommitCommand) + Send + Sync + 'static) {
        self.post_commit_hooks.lock().push(Box::new(hook));
    }

    /// Run after every soft commit.
    pub fn add_post_soft_commit_hook(
        &self,
        hook: impl Fn(&CommitCommand) + Send + Sync + 'static,
    ) {
        self.post_soft_commit_hooks.lock().push(Box::new(hook));
    }

    pub fn statistics(&self) -> MetricsSnapshot {
        self.metrics.snapshot(
            self.commit_tracker.commit_count(),
            self.soft_commit_tracker.commit_count(),
            self.log.as_ref().map(|l| l.total_size()).unwrap_or(0),
            self.log.as_ref().map(|l| l.total_logs()).unwrap_or(0),
        )
    }

    /// Apply a single add/update. Returns 1 on success.
    pub fn add_doc(&self, cmd: &AddCommand) -> Result<u32> {
        match self.add_doc0(cmd) {
            Err(GriddleError::BadRequest(msg)) => Err(GriddleError::BadRequest(format!(
                "error writing document id {}; possible analysis error: {}",
                cmd.printable_id(),
                msg
            ))),
            other => other,
        }
    }

    /// Apply a batch of adds, collecting conflict-kind failures per
    /// document. Returns the number of applied documents, or
    /// [`GriddleError::PartialErrors`] carrying one error slot per failed
    /// document. Non-conflict errors abort the batch.
    pub fn add_batch(&self, cmds: &[AddCommand]) -> Result<u32> {
        let mut per_doc: Vec<Option<GriddleError>> = vec![None; cmds.len()];
        let mut errors = 0;
        for (i, cmd) in cmds.iter().enumerate() {
            match self.add_doc(cmd) {
                Ok(_) => {}
                Err(e) if e.is_conflict() => {
                    per_doc[i] = Some(e);
                    errors += 1;
                }
                Err(e) => return Err(e),
            }
        }
        if errors > 0 {
            return Err(GriddleError::PartialErrors {
                errors,
                total: cmds.len(),
                per_doc,
            });
        }
        Ok(cmds.len() as u32)
    }

    fn add_doc0(&self, cmd: &AddCommand) -> Result<u32> {
        let mode = self.effective_mode(cmd.semantics_override)?;

        // without a unique key there is nothing to overwrite
        let mut overwrite = cmd.overwrite;
        if mode.is_classic() && self.schema.unique_key_field().is_none() {
            overwrite = false;
        }

        let rar = mode.require_unique_key_in_doc();
        if rar.enforced && (self.schema.unique_key_field().is_none() || cmd.doc.id.is_empty()) {
            return Err(GriddleError::WrongUsage(rar.reason.to_string()));
        }
        let rar = mode.require_version_field_in_schema();
        if rar.enforced && !self.schema.has_version_field() {
            return Err(GriddleError::WrongUsage(rar.reason.to_string()));
        }
        let rar = mode.require_update_log();
        if rar.enforced && self.log.is_none() {
            return Err(GriddleError::WrongUsage(rar.reason.to_string()));
        }

        self.metrics.inc_adds();

        let check_existing = mode.need_to_lookup_existing() && cmd.leader_logic;
        let _bucket = check_existing.then(|| self.version_buckets.lock(cmd.indexed_id()));
        if check_existing {
            self.check_against_existing(mode, cmd.indexed_id(), cmd.requested_version)?;
        }

        let result = self.apply_add(cmd, mode, overwrite);
        match &result {
            Ok(()) => self.metrics.inc_docs_pending(),
            Err(_) => self.metrics.mark_error(),
        }
        result.map(|()| 1)
    }

    fn check_against_existing(
        &self,
        mode: SemanticsMode,
        id: &str,
        requested_version: i64,
    ) -> Result<()> {
        let log = self.log.as_ref().ok_or_else(|| {
            GriddleError::WrongUsage(
                "existence and version checks require an update log".to_string(),
            )
        })?;
        // tombstones come back negative and count as absent
        let current = log.lookup_version(id).unwrap_or(-1);
        if current < 0 {
            let rar = mode.require_existing_document(requested_version);
            if rar.enforced {
                return Err(GriddleError::DocDoesNotExist {
                    id: id.to_string(),
                    reason: rar.reason.to_string(),
                });
            }
        } else {
            let rar = mode.require_no_existing_document(requested_version);
            if rar.enforced {
                return Err(GriddleError::DocAlreadyExists {
                    id: id.to_string(),
                    reason: rar.reason.to_string(),
                });
            }
            let rar = mode.require_version_equality(requested_version);
            if rar.enforced && current != requested_version {
                return Err(GriddleError::VersionConflict {
                    id: id.to_string(),
                    requested: requested_version,
                    current,
                });
            }
        }
        Ok(())
    }

    fn apply_add(&self, cmd: &AddCommand, mode: SemanticsMode, overwrite: bool) -> Result<()> {
        if mode.need_to_delete_old_version(overwrite) {
            // reordered delete-by-query commands newer than this update;
            // empty on a leader
            let deletes_after = match &self.log {
                Some(log) if cmd.version > 0 => {
                    let dbqs = log.get_dbq_newer(cmd.version);
                    (!dbqs.is_empty()).then_some(dbqs)
                }
                _ => None,
            };
            match deletes_after {
                Some(dbqs) => self.add_and_delete(cmd, &dbqs)?,
                None => self.do_normal_update(cmd)?,
            }
        } else {
            self.allow_duplicate_update(cmd)?;
        }

        if !cmd.flags.ignore_autocommit {
            if self.config.commit_within_soft_commit {
                self.commit_tracker.added_document(-1);
                self.soft_commit_tracker.added_document(cmd.commit_within);
            } else {
                self.soft_commit_tracker.added_document(-1);
                self.commit_tracker.added_document(cmd.commit_within);
            }
        }
        Ok(())
    }

    fn allow_duplicate_update(&self, cmd: &AddCommand) -> Result<()> {
        let writer = self.core.writer()?;
        if cmd.is_block {
            writer.add_documents(&self.stamped_block(cmd))?;
        } else {
            writer.add_document(&self.stamped_doc(cmd))?;
        }
        if let Some(log) = &self.log {
            log.add(cmd, false);
        }
        Ok(())
    }

    fn do_normal_update(&self, cmd: &AddCommand) -> Result<()> {
        let id_term = self.id_term(cmd)?;
        // an explicit update term comes from dedup processing
        let (update_term, dedup) = match &cmd.update_term {
            None => (id_term.clone(), false),
            Some(term) => (term.clone(), true),
        };

        let writer = self.core.writer()?;
        self.update_doc_or_doc_values(cmd, &*writer, &update_term)?;

        if dedup {
            // ensure the id stays unique: drop docs with this id that do
            // not carry the new signature
            let q = Query::Bool {
                must: vec![Query::Term(id_term)],
                must_not: vec![Query::Term(update_term)],
            };
            writer.delete_documents(&q)?;
        }

        // Log after the writer mutation succeeded, so everything the log
        // holds is known to be in the index.
        if let Some(log) = &self.log {
            log.add(cmd, false);
        }
        Ok(())
    }

    fn add_and_delete(&self, cmd: &AddCommand, dbqs: &[DbqRecord]) -> Result<()> {
        tracing::info!(
            "[UPDATE {}] reordered DBQs detected for id {}: {} deletes newer than version {}",
            self.core_name,
            cmd.printable_id(),
            dbqs.len(),
            cmd.version
        );

        let mut queries = Vec::with_capacity(dbqs.len());
        for dbq in dbqs {
            let mut tmp = DeleteCommand::by_query(dbq.query.clone());
            tmp.version = -dbq.version;
            match self.delete_query(&tmp) {
                Ok(q) => queries.push(q),
                Err(e) => tracing::error!(
                    "[UPDATE {}] failed to parse reordered query '{}': {}",
                    self.core_name,
                    dbq.query,
                    e
                ),
            }
        }

        let id_term = self.id_term(cmd)?;
        let writer = self.core.writer()?;
        let _update_lock = self.core.update_lock().lock();
        self.update_doc_or_doc_values(cmd, &*writer, &id_term)?;
        if cmd.in_place {
            if let Some(log) = &self.log {
                log.open_realtime_searcher();
            }
        }
        // replay the newer deletes so the re-ordered add cannot undo them
        for q in &queries {
            writer.delete_documents(q)?;
        }
        if let Some(log) = &self.log {
            log.add(cmd, true);
        }
        Ok(())
    }

    fn update_doc_or_doc_values(
        &self,
        cmd: &AddCommand,
        writer: &dyn IndexWriter,
        update_term: &Term,
    ) -> Result<()> {
        if cmd.in_place {
            if !self.schema.supports_in_place(&cmd.doc) {
                return Err(GriddleError::WrongUsage(format!(
                    "in-place update of document {} touches fields that are not doc-values-only",
                    cmd.printable_id()
                )));
            }
            let doc = self.stamped_doc(cmd);
            tracing::debug!("[UPDATE {}] updateDocValues id={}", self.core_name, doc.id);
            writer.update_doc_values(update_term, &doc.fields)
        } else if cmd.is_block {
            tracing::debug!(
                "[UPDATE {}] updateDocuments block id={}",
                self.core_name,
                cmd.printable_id()
            );
            writer.update_documents(update_term, &self.stamped_block(cmd))
        } else {
            tracing::debug!(
                "[UPDATE {}] updateDocument id={}",
                self.core_name,
                cmd.printable_id()
            );
            writer.update_document(update_term, &self.stamped_doc(cmd))
        }
    }

    fn stamped_doc(&self, cmd: &AddCommand) -> Document {
        let mut doc = cmd.doc.clone();
        if cmd.version != 0 {
            doc.set_version(cmd.version);
        }
        doc
    }

    fn stamped_block(&self, cmd: &AddCommand) -> Vec<Document> {
        let mut docs = cmd.block_docs();
        if cmd.version != 0 {
            if let Some(parent) = docs.last_mut() {
                parent.set_version(cmd.version);
            }
        }
        docs
    }

    fn id_term(&self, cmd: &AddCommand) -> Result<Term> {
        let field = if cmd.is_block {
            ROOT_FIELD
        } else {
            self.schema.unique_key_field().ok_or_else(|| {
                GriddleError::WrongUsage(
                    "overwriting updates require a unique key field in the schema".to_string(),
                )
            })?
        };
        Ok(Term::new(field, cmd.indexed_id()))
    }

    /// Delete a single document by id.
    pub fn delete(&self, cmd: &DeleteCommand) -> Result<()> {
        let mode = self.effective_mode(cmd.semantics_override)?;

        let id = cmd.indexed_id().unwrap_or_default().to_string();
        let rar = mode.require_unique_key_in_doc();
        if rar.enforced && (self.schema.unique_key_field().is_none() || id.is_empty()) {
            return Err(GriddleError::WrongUsage(rar.reason.to_string()));
        }
        let rar = mode.require_version_field_in_schema();
        if rar.enforced && !self.schema.has_version_field() {
            return Err(GriddleError::WrongUsage(rar.reason.to_string()));
        }
        let rar = mode.require_update_log();
        if rar.enforced && self.log.is_none() {
            return Err(GriddleError::WrongUsage(rar.reason.to_string()));
        }
        let key_field = self.schema.unique_key_field().ok_or_else(|| {
            GriddleError::WrongUsage("delete by id requires a unique key field".to_string())
        })?;
        if id.is_empty() {
            return Err(GriddleError::WrongUsage(
                "delete by id requires the document key".to_string(),
            ));
        }

        let check_existing = mode.need_to_lookup_existing() && cmd.leader_logic;
        let _bucket = check_existing.then(|| self.version_buckets.lock(&id));
        if check_existing {
            self.check_against_existing(mode, &id, cmd.requested_version)?;
        }

        self.metrics.inc_deletes_by_id();

        let term = Term::new(key_field, &id);
        let writer = self.core.writer()?;
        writer.delete_documents(&Query::Term(term))?;
        drop(writer);

        if let Some(log) = &self.log {
            log.delete(cmd);
        }
        self.update_delete_trackers(cmd);
        Ok(())
    }

    /// Delete every document matching the command's query. A match-all
    /// query at version `-i64::MAX` wipes the index without version
    /// protection and without a log entry.
    pub fn delete_by_query(&self, cmd: &DeleteCommand) -> Result<()> {
        self.metrics.inc_deletes_by_query();
        let result = self.delete_by_query_inner(cmd);
        if result.is_err() {
            self.metrics.mark_error();
        }
        result
    }

    fn delete_by_query_inner(&self, cmd: &DeleteCommand) -> Result<()> {
        let q = self.delete_query(cmd)?;
        let del_all = q == Query::MatchAll;

        if del_all && cmd.version == -i64::MAX {
            let _update_lock = self.core.update_lock().lock();
            tracing::info!(
                "[UPDATE {}] removing all documents from index",
                self.core_name
            );
            let writer = self.core.writer()?;
            writer.delete_all()?;
            if let Some(log) = &self.log {
                log.delete_all();
            }
            return Ok(());
        }

        // The lock keeps the delete out of the pre/post-soft-commit window
        // and pairs it with the realtime-searcher refresh.
        {
            let _update_lock = self.core.update_lock().lock();
            if let Some(log) = &self.log {
                log.open_realtime_searcher();
            }
            let writer = self.core.writer()?;
            if del_all {
                writer.delete_all()?;
            } else {
                writer.delete_documents(&q)?;
            }
            if let Some(log) = &self.log {
                log.delete_by_query(cmd);
            }
        }

        self.update_delete_trackers(cmd);
        Ok(())
    }

    fn delete_query(&self, cmd: &DeleteCommand) -> Result<Query> {
        let raw = cmd.query.as_deref().ok_or_else(|| {
            GriddleError::BadRequest("delete by query requires a query".to_string())
        })?;
        let q = Query::parse(raw).map_err(|e| GriddleError::BadRequest(e.to_string()))?;

        // exclude newer versions, so a reordered DBQ cannot remove writes
        // that logically followed it
        if self.log.is_some() && cmd.version != 0 && cmd.version != -i64::MAX {
            Ok(Query::Bool {
                must: vec![q],
                must_not: vec![Query::VersionAtLeast {
                    min: cmd.version.abs(),
                }],
            })
        } else {
            Ok(q)
        }
    }

    fn update_delete_trackers(&self, cmd: &DeleteCommand) {
        if cmd.flags.ignore_autocommit {
            return;
        }
        if self.config.commit_within_soft_commit {
            self.soft_commit_tracker.deleted_document(cmd.commit_within);
        } else {
            self.commit_tracker.deleted_document(cmd.commit_within);
        }
        if self.commit_tracker.time_upper_bound_ms() > 0 {
            self.commit_tracker
                .schedule_commit_within(self.commit_tracker.time_upper_bound_ms());
        }
        if self.soft_commit_tracker.time_upper_bound_ms() > 0 {
            self.soft_commit_tracker
                .schedule_commit_within(self.soft_commit_tracker.time_upper_bound_ms());
        }
    }

    /// Hard or soft commit. `prepare_commit` only stores commit data and
    /// runs the writer's two-phase prepare.
    pub fn commit(&self, cmd: &CommitCommand) -> Result<()> {
        if cmd.prepare_commit {
            return self.prepare_commit(cmd);
        }

        if cmd.optimize {
            self.metrics.mark_optimize();
        } else {
            if cmd.soft_commit {
                self.metrics.mark_soft_commit();
            } else {
                self.metrics.mark_commit();
            }
            if cmd.expunge_deletes {
                self.metrics.mark_expunge_deletes();
            }
        }

        let result = {
            // only one hard commit at a time
            let _commit_lock = (!cmd.soft_commit).then(|| self.core.commit_lock().lock());
            self.commit_under_lock(cmd)
        };

        self.metrics.reset_window();
        if result.is_err() {
            self.metrics.mark_error();
        }
        result
    }

    fn commit_under_lock(&self, cmd: &CommitCommand) -> Result<()> {
        tracing::debug!(
            "[COMMIT {}] start soft={} openSearcher={}",
            self.core_name,
            cmd.soft_commit,
            cmd.open_searcher
        );

        // Cancel pending scheduled commits that this one subsumes, before
        // the commit itself runs.
        if cmd.open_searcher {
            self.soft_commit_tracker.cancel_pending_commit();
        }
        if !cmd.soft_commit && (cmd.open_searcher || !self.commit_tracker.open_searcher()) {
            self.commit_tracker.cancel_pending_commit();
        }

        let writer = self.core.writer()?;
        if cmd.optimize {
            tracing::warn!(
                "[COMMIT {}] starting optimize, reducing to {} segments",
                self.core_name,
                cmd.max_optimize_segments
            );
            writer.force_merge(cmd.max_optimize_segments)?;
        } else if cmd.expunge_deletes {
            tracing::warn!("[COMMIT {}] starting expungeDeletes", self.core_name);
            writer.force_merge_deletes()?;
        }

        if !cmd.soft_commit {
            {
                // keeps pre_commit out of the preSoft/postSoft window
                let _update_lock = self.core.update_lock().lock();
                if let Some(log) = &self.log {
                    log.pre_commit(cmd);
                }
            }
            if writer.has_uncommitted_changes() {
                writer.set_commit_data(self.commit_data());
                writer.commit()?;
            } else {
                tracing::debug!(
                    "[COMMIT {}] no uncommitted changes, skipping writer commit",
                    self.core_name
                );
            }
            self.metrics.reset_docs_pending();
            for hook in self.post_commit_hooks.lock().iter() {
                hook(cmd);
            }
        }
        drop(writer);

        if cmd.soft_commit {
            {
                let _update_lock = self.core.update_lock().lock();
                if let Some(log) = &self.log {
                    log.pre_soft_commit(cmd);
                }
                self.searcher.open_searcher(cmd.wait_searcher)?;
                if let Some(log) = &self.log {
                    log.post_soft_commit(cmd);
                }
            }
            for hook in self.post_soft_commit_hooks.lock().iter() {
                hook(cmd);
            }
            self.soft_commit_tracker.did_commit();
        } else {
            {
                let _update_lock = self.core.update_lock().lock();
                if let Some(log) = &self.log {
                    log.pre_soft_commit(cmd);
                }
                if cmd.open_searcher {
                    self.searcher.open_searcher(cmd.wait_searcher)?;
                } else {
                    // realtime-get must still see the latest state
                    self.searcher.open_realtime_searcher();
                }
                if let Some(log) = &self.log {
                    log.post_soft_commit(cmd);
                }
            }
            if let Some(log) = &self.log {
                log.post_commit(cmd);
            }
            self.commit_tracker.did_commit();
        }

        tracing::debug!("[COMMIT {}] end", self.core_name);
        Ok(())
    }

    fn prepare_commit(&self, _cmd: &CommitCommand) -> Result<()> {
        tracing::debug!("[COMMIT {}] prepareCommit", self.core_name);
        let result = (|| -> Result<()> {
            let writer = self.core.writer()?;
            writer.set_commit_data(self.commit_data());
            writer.prepare_commit()
        })();
        if result.is_err() {
            self.metrics.mark_error();
        }
        result
    }

    fn commit_data(&self) -> HashMap<String, String> {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let mut data = HashMap::new();
        data.insert("commitTime".to_string(), millis.to_string());
        data
    }

    /// Discard all uncommitted changes. Not available on cluster-aware
    /// shards, where replicas would silently diverge.
    pub fn rollback(&self, _cmd: &RollbackCommand) -> Result<()> {
        if self.config.cluster_aware {
            return Err(GriddleError::WrongUsage(
                "rollback is not supported on cluster-aware shards".to_string(),
            ));
        }

        self.metrics.mark_rollback();
        let result = (|| -> Result<()> {
            tracing::debug!("[UPDATE {}] start rollback", self.core_name);
            self.metrics.reset_docs_pending();
            let writer = self.core.writer()?;
            writer.rollback()?;
            self.commit_tracker.did_rollback();
            self.soft_commit_tracker.did_rollback();
            tracing::debug!("[UPDATE {}] end rollback", self.core_name);
            Ok(())
        })();

        self.metrics.rollback_window();
        if result.is_err() {
            self.metrics.mark_error();
        }
        result
    }

    /// Import foreign readers into this shard. Returns 1 when documents
    /// were imported, 0 when there was nothing to do.
    pub fn merge_indexes(&self, cmd: &MergeIndexesCommand) -> Result<u32> {
        self.metrics.mark_merge_indexes();
        tracing::debug!(
            "[UPDATE {}] start mergeIndexes ({} sources)",
            self.core_name,
            cmd.sources.len()
        );

        let rc = if cmd.sources.is_empty() {
            0
        } else {
            let writer = self.core.writer()?;
            writer.add_indexes(&cmd.sources)?;
            1
        };

        if rc == 1 {
            if self.commit_tracker.time_upper_bound_ms() > 0 {
                self.commit_tracker
                    .schedule_commit_within(self.commit_tracker.time_upper_bound_ms());
            } else if self.soft_commit_tracker.time_upper_bound_ms() > 0 {
                self.soft_commit_tracker
                    .schedule_commit_within(self.soft_commit_tracker.time_upper_bound_ms());
            }
        }
        Ok(rc)
    }

    /// Commit, then hand the shard to the splitter.
    pub fn split(&self, cmd: &SplitCommand, splitter: &dyn IndexSplitter) -> Result<()> {
        self.commit(&CommitCommand::hard())?;
        self.metrics.mark_split();
        if let Err(e) = splitter.split(cmd) {
            self.metrics.mark_error();
            return Err(e);
        }
        Ok(())
    }

    /// Remove every document and every log record, bypassing version
    /// protection.
    pub fn clear_index(&self) -> Result<()> {
        let writer = self.core.writer()?;
        writer.delete_all()?;
        if let Some(log) = &self.log {
            log.delete_all();
        }
        Ok(())
    }

    /// Shut the handler down: stop the trackers, optionally run a final
    /// minimal commit, then close the log and the writer. Failures along
    /// the way are logged and the remaining resources still closed.
    pub fn close(&self) -> Result<()> {
        tracing::debug!("[UPDATE {}] closing", self.core_name);
        self.commit_tracker.close();
        self.soft_commit_tracker.close();

        let _commit_lock = self.core.commit_lock().lock();

        if self.config.commit_on_close {
            let try_commit = self
                .log
                .as_ref()
                .map(|log| log.has_uncommitted_changes() && log.state() == LogState::Active)
                .unwrap_or(false);
            if try_commit {
                if let Ok(writer) = self.core.writer() {
                    tracing::info!("[UPDATE {}] committing on close", self.core_name);
                    let cmd = CommitCommand {
                        open_searcher: false,
                        wait_searcher: false,
                        ..CommitCommand::hard()
                    };
                    let log = self.log.as_ref().unwrap();
                    {
                        let _update_lock = self.core.update_lock().lock();
                        log.pre_commit(&cmd);
                    }
                    writer.set_commit_data(self.commit_data());
                    match writer.commit() {
                        Ok(()) => {
                            let _update_lock = self.core.update_lock().lock();
                            log.post_commit(&cmd);
                        }
                        Err(e) => {
                            tracing::error!(
                                "[UPDATE {}] error in final commit: {}",
                                self.core_name,
                                e
                            );
                        }
                    }
                }
            }
        } else if let Ok(writer) = self.core.writer() {
            if let Err(e) = writer.rollback() {
                tracing::error!(
                    "[UPDATE {}] error rolling back on close: {}",
                    self.core_name,
                    e
                );
            }
        }

        if let Some(log) = &self.log {
            log.close(false);
        }
        if let Some(writer) = self.core.take_writer() {
            if let Err(e) = writer.close() {
                tracing::error!(
                    "[UPDATE {}] error closing index writer: {}",
                    self.core_name,
                    e
                );
            }
        }
        self.metrics.reset_docs_pending();
        Ok(())
    }

    fn effective_mode(&self, override_mode: Option<SemanticsMode>) -> Result<SemanticsMode> {
        let mode = match override_mode {
            Some(m) if m != self.semantics_mode => m,
            _ => return Ok(self.semantics_mode),
        };
        let rar = mode.require_unique_key_field_in_schema();
        if rar.enforced && self.schema.unique_key_field().is_none() {
            return Err(GriddleError::WrongUsage(rar.reason.to_string()));
        }
        let rar = mode.require_update_log();
        if rar.enforced && self.log.is_none() {
            return Err(GriddleError::WrongUsage(rar.reason.to_string()));
        }
        Ok(mode)
    }
}

impl Drop for UpdateHandler {
    fn drop(&mut self) {
        self.commit_tracker.close();
        self.soft_commit_tracker.close();
    }
}

use crate::index::{DocSource, Term};
use crate::types::Document;
use crate::update::semantics::SemanticsMode;
use std::sync::Arc;

/// Flags carried by every mutation command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateFlags {
    /// The command is a peer-sync replay.
    pub peer_sync: bool,
    /// Do not notify the commit trackers for this command.
    pub ignore_autocommit: bool,
}

impl UpdateFlags {
    /// The flag set peer-sync replay applies: replayed updates must not
    /// trigger auto-commits.
    pub fn peer_sync_replay() -> Self {
        UpdateFlags {
            peer_sync: true,
            ignore_autocommit: true,
        }
    }
}

/// An add/update of a single document (or a parent/child block).
#[derive(Debug, Clone)]
pub struct AddCommand {
    pub doc: Document,
    /// Children of a block command; the parent is `doc`.
    pub children: Vec<Document>,
    pub is_block: bool,
    /// The version asserted by the client: `-1` (any negative) means
    /// insert-only, `> 0` asserts the current version, `0` asserts nothing.
    pub requested_version: i64,
    /// The version assigned to this update (signed).
    pub version: i64,
    /// In-place update: only doc-values fields are rewritten.
    pub in_place: bool,
    /// Version this in-place update chains from, `0` when unset.
    pub prev_version: i64,
    /// Leaders perform version lookup and assertion; followers replay as-is.
    pub leader_logic: bool,
    /// Dedup term distinct from the id term (signature processing).
    pub update_term: Option<Term>,
    /// Milliseconds within which a commit must happen, `-1` for none.
    pub commit_within: i64,
    /// Classic semantics only: overwrite an existing document with the same
    /// key. Turned off automatically when the schema has no unique key.
    pub overwrite: bool,
    pub semantics_override: Option<SemanticsMode>,
    pub flags: UpdateFlags,
}

impl AddCommand {
    pub fn new(doc: Document) -> Self {
        AddCommand {
            doc,
            children: Vec::new(),
            is_block: false,
            requested_version: 0,
            version: 0,
            in_place: false,
            prev_version: 0,
            leader_logic: true,
            update_term: None,
            commit_within: -1,
            overwrite: true,
            semantics_override: None,
            flags: UpdateFlags::default(),
        }
    }

    /// The indexed form of the unique key.
    pub fn indexed_id(&self) -> &str {
        &self.doc.id
    }

    /// Key rendered for error messages; `(null)` when the doc has no key.
    pub fn printable_id(&self) -> &str {
        if self.doc.id.is_empty() {
            "(null)"
        } else {
            &self.doc.id
        }
    }

    /// All documents of a block, parent last.
    pub fn block_docs(&self) -> Vec<Document> {
        let mut docs = self.children.clone();
        docs.push(self.doc.clone());
        docs
    }
}

/// A delete, either by id or by query.
#[derive(Debug, Clone)]
pub struct DeleteCommand {
    pub id: Option<String>,
    pub query: Option<String>,
    pub requested_version: i64,
    /// Signed version of this delete; negative for tombstones.
    pub version: i64,
    pub leader_logic: bool,
    pub commit_within: i64,
    pub semantics_override: Option<SemanticsMode>,
    pub flags: UpdateFlags,
}

impl DeleteCommand {
    pub fn by_id(id: impl Into<String>) -> Self {
        DeleteCommand {
            id: Some(id.into()),
            query: None,
            requested_version: 0,
            version: 0,
            leader_logic: true,
            commit_within: -1,
            semantics_override: None,
            flags: UpdateFlags::default(),
        }
    }

    pub fn by_query(query: impl Into<String>) -> Self {
        DeleteCommand {
            id: None,
            query: Some(query.into()),
            requested_version: 0,
            version: 0,
            leader_logic: true,
            commit_within: -1,
            semantics_override: None,
            flags: UpdateFlags::default(),
        }
    }

    pub fn indexed_id(&self) -> Option<&str> {
        self.id.as_deref()
    }
}

#[derive(Debug, Clone)]
pub struct CommitCommand {
    pub soft_commit: bool,
    pub open_searcher: bool,
    pub wait_searcher: bool,
    pub expunge_deletes: bool,
    pub optimize: bool,
    pub max_optimize_segments: u32,
    pub prepare_commit: bool,
}

impl CommitCommand {
    pub fn hard() -> Self {
        CommitCommand {
            soft_commit: false,
            open_searcher: true,
            wait_searcher: true,
            expunge_deletes: false,
            optimize: false,
            max_optimize_segments: 1,
            prepare_commit: false,
        }
    }

    pub fn soft() -> Self {
        CommitCommand {
            soft_commit: true,
            ..CommitCommand::hard()
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RollbackCommand {}

/// Import the documents of foreign index readers into this shard.
pub struct MergeIndexesCommand {
    pub sources: Vec<Arc<dyn DocSource>>,
}

/// Split this shard's committed documents into `partitions` pieces.
#[derive(Debug, Clone)]
pub struct SplitCommand {
    pub partitions: usize,
}

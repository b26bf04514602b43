//! Contracts the update path holds against the inverted index, plus the
//! in-memory reference implementation used by tests and embedders.

pub mod fingerprint;
pub mod memory;

use crate::error::{GriddleError, Result};
use crate::types::{Document, FieldValue};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

/// An exact term addressing documents by one indexed field value — the
/// opaque indexed form of a document key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Term {
    pub field: String,
    pub value: String,
}

impl Term {
    pub fn new(field: impl Into<String>, value: impl Into<String>) -> Self {
        Term {
            field: field.into(),
            value: value.into(),
        }
    }
}

/// The query shapes the update path constructs: parsed delete-by-query
/// input, the version range-exclusion wrapper, and the dedup-term clause.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    MatchAll,
    Term(Term),
    /// Matches documents whose version is `>= min` (positive versions as
    /// stored in the index).
    VersionAtLeast { min: i64 },
    Bool {
        must: Vec<Query>,
        must_not: Vec<Query>,
    },
}

impl Query {
    /// Parse the delete-by-query surface syntax: `*:*` or `field:value`.
    pub fn parse(input: &str) -> Result<Query> {
        let input = input.trim();
        if input == "*:*" {
            return Ok(Query::MatchAll);
        }
        match input.split_once(':') {
            Some((field, value)) if !field.is_empty() && !value.is_empty() => {
                Ok(Query::Term(Term::new(field, value.trim_matches('"'))))
            }
            _ => Err(GriddleError::QueryParse(format!(
                "cannot parse query '{}'",
                input
            ))),
        }
    }
}

/// The mutation surface of the index writer. Implementations are internally
/// synchronized; callers hold a shared handle and may invoke concurrently.
pub trait IndexWriter: Send + Sync {
    fn add_document(&self, doc: &Document) -> Result<()>;
    /// Adds a parent/child block atomically; the parent is last.
    fn add_documents(&self, docs: &[Document]) -> Result<()>;
    fn update_document(&self, term: &Term, doc: &Document) -> Result<()>;
    /// Block form of [`IndexWriter::update_document`].
    fn update_documents(&self, term: &Term, docs: &[Document]) -> Result<()>;
    /// In-place update: rewrites only the given doc-values fields of the
    /// documents matching `term`.
    fn update_doc_values(&self, term: &Term, fields: &HashMap<String, FieldValue>) -> Result<()>;
    fn delete_documents(&self, query: &Query) -> Result<()>;
    fn delete_all(&self) -> Result<()>;
    fn force_merge(&self, max_segments: u32) -> Result<()>;
    fn force_merge_deletes(&self) -> Result<()>;
    fn add_indexes(&self, sources: &[Arc<dyn DocSource>]) -> Result<()>;
    fn has_uncommitted_changes(&self) -> bool;
    fn set_commit_data(&self, data: HashMap<String, String>);
    fn prepare_commit(&self) -> Result<()>;
    fn commit(&self) -> Result<()>;
    fn rollback(&self) -> Result<()>;
    fn close(&self) -> Result<()>;
}

/// A readable source of documents handed to `merge_indexes`.
pub trait DocSource: Send + Sync {
    fn documents(&self) -> Vec<Document>;
}

/// Opens searchers over the index: the registered searcher served to
/// queries, and the realtime searcher backing get-by-id.
pub trait SearcherOpener: Send + Sync {
    fn open_searcher(&self, wait_searcher: bool) -> Result<()>;
    fn open_realtime_searcher(&self);
}

/// Shared per-shard writer state: the writer handle plus the two locks the
/// update path is built around.
///
/// The writer handle is a scoped borrow — [`CoreState::writer`] bumps the
/// reference count and the clone releases it on every exit path. Lock order
/// is fixed: when both are held, the update lock is acquired inside the
/// commit lock, never the other way around.
pub struct CoreState {
    writer: RwLock<Option<Arc<dyn IndexWriter>>>,
    commit_lock: Mutex<()>,
    update_lock: Mutex<()>,
}

impl CoreState {
    pub fn new(writer: Arc<dyn IndexWriter>) -> Self {
        CoreState {
            writer: RwLock::new(Some(writer)),
            commit_lock: Mutex::new(()),
            update_lock: Mutex::new(()),
        }
    }

    /// Borrow the writer. The returned handle keeps the writer alive for the
    /// duration of the operation; dropping it releases the borrow.
    pub fn writer(&self) -> Result<Arc<dyn IndexWriter>> {
        self.writer
            .read()
            .as_ref()
            .cloned()
            .ok_or(GriddleError::WriterClosed)
    }

    /// Remove the writer handle on shutdown. Outstanding borrows finish
    /// before the underlying writer is dropped.
    pub fn take_writer(&self) -> Option<Arc<dyn IndexWriter>> {
        self.writer.write().take()
    }

    pub fn commit_lock(&self) -> &Mutex<()> {
        &self.commit_lock
    }

    pub fn update_lock(&self) -> &Mutex<()> {
        &self.update_lock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::memory::MemoryIndex;

    #[test]
    fn parse_match_all() {
        assert_eq!(Query::parse("*:*").unwrap(), Query::MatchAll);
    }

    #[test]
    fn parse_term_query() {
        assert_eq!(
            Query::parse("title:hello").unwrap(),
            Query::Term(Term::new("title", "hello"))
        );
    }

    #[test]
    fn parse_quoted_value() {
        assert_eq!(
            Query::parse("title:\"hello\"").unwrap(),
            Query::Term(Term::new("title", "hello"))
        );
    }

    #[test]
    fn parse_garbage_fails() {
        assert!(Query::parse("no-colon-here").is_err());
        assert!(Query::parse(":").is_err());
    }

    #[test]
    fn writer_borrow_and_close() {
        let index = MemoryIndex::new("core1", "id");
        let state = CoreState::new(index.writer());
        let w = state.writer().unwrap();
        drop(w);
        assert!(state.take_writer().is_some());
        assert!(matches!(
            state.writer(),
            Err(GriddleError::WriterClosed)
        ));
    }
}

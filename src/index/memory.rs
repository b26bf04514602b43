//! In-memory index used by tests and embedders that do not carry a real
//! on-disk index. Mirrors the visibility rules of the production engine:
//! searchers serve the last opened snapshot, the realtime view always sees
//! the writer's live state, and commit/rollback move between the live and
//! committed maps.

use crate::error::{GriddleError, Result};
use crate::index::fingerprint::{FingerprintSource, IndexFingerprint};
use crate::index::{DocSource, IndexWriter, Query, SearcherOpener, Term};
use crate::types::{Document, FieldValue, ROOT_FIELD, VERSION_FIELD};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

pub struct MemoryIndex {
    name: String,
    inner: Arc<Mutex<IndexInner>>,
}

struct IndexInner {
    key_field: String,
    live: HashMap<String, Document>,
    committed: HashMap<String, Document>,
    snapshot: HashMap<String, Document>,
    commit_data: HashMap<String, String>,
    dirty: bool,
    prepared: bool,
    closed: bool,
    segment_count: u32,
    searcher_opens: u64,
    realtime_opens: u64,
}

impl MemoryIndex {
    pub fn new(name: impl Into<String>, key_field: impl Into<String>) -> Arc<Self> {
        Arc::new(MemoryIndex {
            name: name.into(),
            inner: Arc::new(Mutex::new(IndexInner {
                key_field: key_field.into(),
                live: HashMap::new(),
                committed: HashMap::new(),
                snapshot: HashMap::new(),
                commit_data: HashMap::new(),
                dirty: false,
                prepared: false,
                closed: false,
                segment_count: 1,
                searcher_opens: 0,
                realtime_opens: 0,
            })),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// A writer handle sharing this index's state.
    pub fn writer(self: &Arc<Self>) -> Arc<dyn IndexWriter> {
        Arc::new(MemoryIndexWriter {
            inner: Arc::clone(&self.inner),
        })
    }

    /// The registered searcher: sees the last `open_searcher` snapshot.
    pub fn searcher(&self) -> Searcher {
        let inner = self.inner.lock();
        Searcher {
            key_field: inner.key_field.clone(),
            docs: inner.snapshot.clone(),
        }
    }

    /// The realtime view: always sees the writer's live state.
    pub fn realtime_searcher(&self) -> Searcher {
        let inner = self.inner.lock();
        Searcher {
            key_field: inner.key_field.clone(),
            docs: inner.live.clone(),
        }
    }

    /// Realtime get-by-id.
    pub fn get(&self, id: &str) -> Option<Document> {
        self.inner.lock().live.get(id).cloned()
    }

    pub fn searcher_opens(&self) -> u64 {
        self.inner.lock().searcher_opens
    }

    pub fn realtime_opens(&self) -> u64 {
        self.inner.lock().realtime_opens
    }

    pub fn segment_count(&self) -> u32 {
        self.inner.lock().segment_count
    }

    pub fn commit_data(&self) -> HashMap<String, String> {
        self.inner.lock().commit_data.clone()
    }

    pub fn was_prepared(&self) -> bool {
        self.inner.lock().prepared
    }
}

impl SearcherOpener for MemoryIndex {
    fn open_searcher(&self, _wait_searcher: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.snapshot = inner.live.clone();
        inner.searcher_opens += 1;
        Ok(())
    }

    fn open_realtime_searcher(&self) {
        self.inner.lock().realtime_opens += 1;
    }
}

impl FingerprintSource for MemoryIndex {
    fn fingerprint(&self, max_version: i64) -> Result<IndexFingerprint> {
        let inner = self.inner.lock();
        let versions = inner.live.values().filter_map(|d| d.version());
        Ok(IndexFingerprint::compute(versions, max_version))
    }
}

impl DocSource for MemoryIndex {
    fn documents(&self) -> Vec<Document> {
        self.inner.lock().committed.values().cloned().collect()
    }
}

pub struct MemoryIndexWriter {
    inner: Arc<Mutex<IndexInner>>,
}

impl MemoryIndexWriter {
    fn with_inner<T>(&self, f: impl FnOnce(&mut IndexInner) -> T) -> Result<T> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(GriddleError::WriterClosed);
        }
        Ok(f(&mut inner))
    }
}

impl IndexWriter for MemoryIndexWriter {
    fn add_document(&self, doc: &Document) -> Result<()> {
        self.with_inner(|inner| {
            inner.live.insert(doc.id.clone(), doc.clone());
            inner.dirty = true;
        })
    }

    fn add_documents(&self, docs: &[Document]) -> Result<()> {
        self.with_inner(|inner| {
            for doc in docs {
                inner.live.insert(doc.id.clone(), doc.clone());
            }
            inner.dirty = true;
        })
    }

    fn update_document(&self, term: &Term, doc: &Document) -> Result<()> {
        self.with_inner(|inner| {
            let key_field = inner.key_field.clone();
            inner
                .live
                .retain(|_, d| !term_matches(d, term, &key_field));
            inner.live.insert(doc.id.clone(), doc.clone());
            inner.dirty = true;
        })
    }

    fn update_documents(&self, term: &Term, docs: &[Document]) -> Result<()> {
        self.with_inner(|inner| {
            let key_field = inner.key_field.clone();
            inner
                .live
                .retain(|_, d| !term_matches(d, term, &key_field));
            for doc in docs {
                inner.live.insert(doc.id.clone(), doc.clone());
            }
            inner.dirty = true;
        })
    }

    fn update_doc_values(&self, term: &Term, fields: &HashMap<String, FieldValue>) -> Result<()> {
        self.with_inner(|inner| {
            let key_field = inner.key_field.clone();
            for doc in inner.live.values_mut() {
                if term_matches(doc, term, &key_field) {
                    for (name, value) in fields {
                        doc.fields.insert(name.clone(), value.clone());
                    }
                }
            }
            inner.dirty = true;
        })
    }

    fn delete_documents(&self, query: &Query) -> Result<()> {
        self.with_inner(|inner| {
            let key_field = inner.key_field.clone();
            inner
                .live
                .retain(|_, d| !doc_matches(d, query, &key_field));
            inner.dirty = true;
        })
    }

    fn delete_all(&self) -> Result<()> {
        self.with_inner(|inner| {
            inner.live.clear();
            inner.dirty = true;
        })
    }

    fn force_merge(&self, max_segments: u32) -> Result<()> {
        self.with_inner(|inner| {
            inner.segment_count = inner.segment_count.min(max_segments.max(1));
        })
    }

    fn force_merge_deletes(&self) -> Result<()> {
        // Deletes are applied eagerly in the memory model.
        self.with_inner(|_| ())
    }

    fn add_indexes(&self, sources: &[Arc<dyn DocSource>]) -> Result<()> {
        self.with_inner(|inner| {
            for source in sources {
                for doc in source.documents() {
                    inner.live.insert(doc.id.clone(), doc);
                }
            }
            inner.dirty = true;
        })
    }

    fn has_uncommitted_changes(&self) -> bool {
        self.inner.lock().dirty
    }

    fn set_commit_data(&self, data: HashMap<String, String>) {
        self.inner.lock().commit_data = data;
    }

    fn prepare_commit(&self) -> Result<()> {
        self.with_inner(|inner| {
            inner.prepared = true;
        })
    }

    fn commit(&self) -> Result<()> {
        self.with_inner(|inner| {
            inner.committed = inner.live.clone();
            inner.dirty = false;
            inner.prepared = false;
            inner.segment_count += 1;
        })
    }

    fn rollback(&self) -> Result<()> {
        self.with_inner(|inner| {
            inner.live = inner.committed.clone();
            inner.dirty = false;
            inner.prepared = false;
        })
    }

    fn close(&self) -> Result<()> {
        self.inner.lock().closed = true;
        Ok(())
    }
}

fn term_matches(doc: &Document, term: &Term, key_field: &str) -> bool {
    if term.field == key_field || term.field == ROOT_FIELD {
        return doc.id == term.value;
    }
    match doc.fields.get(&term.field) {
        Some(FieldValue::Array(items)) => items.iter().any(|v| v.as_text() == term.value),
        Some(value) => value.as_text() == term.value,
        None => false,
    }
}

fn doc_matches(doc: &Document, query: &Query, key_field: &str) -> bool {
    match query {
        Query::MatchAll => true,
        Query::Term(term) => term_matches(doc, term, key_field),
        Query::VersionAtLeast { min } => match doc.fields.get(VERSION_FIELD) {
            Some(FieldValue::Integer(v)) => v.abs() >= *min,
            _ => false,
        },
        Query::Bool { must, must_not } => {
            must.iter().all(|q| doc_matches(doc, q, key_field))
                && !must_not.iter().any(|q| doc_matches(doc, q, key_field))
        }
    }
}

/// A point-in-time view of the index. Matches with the same rules the
/// writer side uses, keyed by the schema's unique-key field.
#[derive(Debug, Clone)]
pub struct Searcher {
    key_field: String,
    docs: HashMap<String, Document>,
}

impl Searcher {
    pub fn count(&self, query: &Query) -> usize {
        self.search(query).len()
    }

    pub fn search(&self, query: &Query) -> Vec<&Document> {
        self.docs
            .values()
            .filter(|d| doc_matches(d, query, &self.key_field))
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<&Document> {
        self.docs.get(id)
    }

    pub fn num_docs(&self) -> usize {
        self.docs.len()
    }
}

//! Index coordinator: the engine's public surface.
//!
//! Routes every write to the structural, full-text, and vector layers and
//! every read through the query planner. Writes are serialized on an
//! internal mutex (single-writer, many-reader); the embedder runs outside
//! that mutex because it is the slowest collaborator.
//!
//! Failure semantics: structural and full-text failures are fatal to a
//! `put` and surface as [`IndexError::Partial`] with the failed-layer set;
//! vector failures are logged and the put succeeds on the other two
//! layers, because the vector path depends on an external embedder that
//! may be transiently down. Such documents score 0 on semantic queries
//! until re-put.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde_json::Value;
use thiserror::Error;

use crate::config::EngineConfig;
use crate::db::{Database, DbError};
use crate::docstore::{DocStoreError, DocumentStore};
use crate::embedder::{Embedder, EmbedderError};
use crate::fulltext::{FtsError, FtsStats, FullTextIndex};
use crate::planner::{compose_key, PlannerError, QueryPlanner, SearchRequest, SearchResponse};
use crate::structural::{StructuralError, StructuralIndex};
use crate::vector::{VectorError, VectorLayer, VectorStats};

/// Index database filename (full-text + structural share it).
const INDEX_DB: &str = "index.db";
/// Vector layer subdirectory.
const VECTOR_DIR: &str = "vectors";
/// Batch size for draining bulk operations.
const BULK_BATCH_SIZE: usize = 32;

/// Bitmask of index layers, used to report partial write failures.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct LayerSet(u8);

impl LayerSet {
    pub const STRUCTURAL: LayerSet = LayerSet(1);
    pub const FULLTEXT: LayerSet = LayerSet(1 << 1);
    pub const VECTOR: LayerSet = LayerSet(1 << 2);

    pub fn insert(&mut self, other: LayerSet) {
        self.0 |= other.0;
    }

    pub fn contains(&self, other: LayerSet) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Debug for LayerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::STRUCTURAL) {
            names.push("structural");
        }
        if self.contains(Self::FULLTEXT) {
            names.push("fulltext");
        }
        if self.contains(Self::VECTOR) {
            names.push("vector");
        }
        write!(f, "{{{}}}", names.join(","))
    }
}

impl std::fmt::Display for LayerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Coordinator not initialized; call initialize() first")]
    NotInitialized,
    #[error("Partial index failure in layers {layers}: {detail}")]
    Partial { layers: LayerSet, detail: String },
    #[error("Operation deadline already passed")]
    TimedOut,
    #[error("Full-text error: {0}")]
    Fts(#[from] FtsError),
    #[error("Structural error: {0}")]
    Structural(#[from] StructuralError),
    #[error("Vector error: {0}")]
    Vector(#[from] VectorError),
    #[error("Planner error: {0}")]
    Planner(#[from] PlannerError),
    #[error("Document store error: {0}")]
    DocStore(#[from] DocStoreError),
    #[error("Embedding error: {0}")]
    Embedder(#[from] EmbedderError),
    #[error("Database error: {0}")]
    Db(#[from] DbError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A document to index.
#[derive(Debug, Clone, Default)]
pub struct Document {
    /// Text indexed by the full-text layer and, via the embedder, by the
    /// vector layer.
    pub content: String,
    /// Structural fields, keyed by (possibly dotted) field path.
    pub attributes: serde_json::Map<String, Value>,
    /// Precomputed embedding; when absent the coordinator asks the
    /// embedder for one.
    pub vector: Option<Vec<f32>>,
    /// Opaque metadata stored alongside the full-text and vector rows.
    pub metadata: Option<Value>,
}

impl Document {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_attribute(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(path.into(), value.into());
        self
    }

    pub fn with_vector(mut self, vector: Vec<f32>) -> Self {
        self.vector = Some(vector);
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Options for a single write.
#[derive(Debug, Clone, Copy, Default)]
pub struct PutOptions {
    /// Reject the write up-front when this instant has already passed.
    pub deadline: Option<Instant>,
}

/// What a successful `put` did.
#[derive(Debug, Clone)]
pub struct PutReport {
    /// Engine-wide document key (`collection:id`).
    pub key: String,
    /// Whether the vector layer was updated (false when the embedder was
    /// unavailable or failed; the put still succeeded).
    pub vector_indexed: bool,
}

/// One bulk operation.
#[derive(Debug, Clone)]
pub enum WriteOp {
    Put {
        collection: String,
        id: String,
        document: Document,
    },
    Delete {
        collection: String,
        id: String,
    },
}

/// Outcome of a bulk drain.
#[derive(Debug, Default)]
pub struct BulkReport {
    pub succeeded: usize,
    /// Failed keys with their error rendering.
    pub failed: Vec<(String, String)>,
}

/// Combined layer statistics.
#[derive(Debug)]
pub struct EngineStats {
    pub vector: VectorStats,
    pub fulltext: FtsStats,
}

struct AutoSave {
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl AutoSave {
    /// Spawn the save timer. The thread parks for the interval and saves
    /// whenever the layer reports unsaved changes; overlapping saves are
    /// already serialized inside the vector layer.
    fn start(vector: Arc<VectorLayer>, interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let handle = std::thread::Builder::new()
            .name("fathom-autosave".to_string())
            .spawn(move || {
                tracing::debug!(interval_ms = interval.as_millis() as u64, "Auto-save started");
                loop {
                    std::thread::park_timeout(interval);
                    if stop_flag.load(Ordering::SeqCst) {
                        break;
                    }
                    if vector.is_dirty() {
                        if let Err(e) = vector.save() {
                            tracing::warn!(error = %e, "Auto-save failed");
                        }
                    }
                }
                tracing::debug!("Auto-save stopped");
            })
            .expect("failed to spawn auto-save thread");
        Self {
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for AutoSave {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

struct Inner {
    db: Arc<Database>,
    fulltext: Arc<FullTextIndex>,
    structural: Arc<StructuralIndex>,
    vector: Arc<VectorLayer>,
    planner: QueryPlanner,
    /// Dropped (and thereby stopped) on close.
    autosave: Option<AutoSave>,
}

/// The public engine surface.
///
/// Construct with [`new`](Self::new), wire optional collaborators, then
/// call [`initialize`](Self::initialize) before any operation.
pub struct IndexCoordinator {
    base: PathBuf,
    config: EngineConfig,
    embedder: Option<Arc<dyn Embedder>>,
    docstore: Option<Arc<dyn DocumentStore>>,
    inner: RwLock<Option<Arc<Inner>>>,
    /// Serializes the logical write path.
    write_mutex: Mutex<()>,
}

impl IndexCoordinator {
    pub fn new(base: impl Into<PathBuf>, config: EngineConfig) -> Self {
        Self {
            base: base.into(),
            config,
            embedder: None,
            docstore: None,
            inner: RwLock::new(None),
            write_mutex: Mutex::new(()),
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_document_store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.docstore = Some(store);
        self
    }

    /// Open storage and indices, rebuild vector mappings from the
    /// sidecar, and start the auto-save timer when configured.
    pub fn initialize(&self) -> Result<(), IndexError> {
        let mut slot = self.write_guard_inner();
        if slot.is_some() {
            tracing::debug!("Coordinator already initialized");
            return Ok(());
        }

        std::fs::create_dir_all(&self.base)?;
        let db = Arc::new(Database::open(&self.base.join(INDEX_DB))?);
        let fulltext = Arc::new(FullTextIndex::open(db.clone(), self.config.fulltext.clone())?);
        let structural = Arc::new(StructuralIndex::open(db.clone())?);
        let vector = Arc::new(VectorLayer::open(
            &self.base.join(VECTOR_DIR),
            self.config.vector.clone(),
        )?);

        let planner = QueryPlanner::new(
            fulltext.clone(),
            structural.clone(),
            Some(vector.clone()),
            self.embedder.clone(),
            self.docstore.clone(),
            self.config.planner.clone(),
        );

        let autosave = self
            .config
            .auto_save
            .map(|interval| AutoSave::start(vector.clone(), interval));

        *slot = Some(Arc::new(Inner {
            db,
            fulltext,
            structural,
            vector,
            planner,
            autosave,
        }));
        tracing::info!(base = %self.base.display(), "Index coordinator initialized");
        Ok(())
    }

    /// Index a document across all three layers.
    pub fn put(
        &self,
        collection: &str,
        id: &str,
        document: Document,
        options: Option<PutOptions>,
    ) -> Result<PutReport, IndexError> {
        let inner = self.inner()?;
        if let Some(deadline) = options.and_then(|o| o.deadline) {
            if Instant::now() > deadline {
                return Err(IndexError::TimedOut);
            }
        }

        let key = compose_key(collection, id);
        let assembled = assemble_structural_doc(collection, id, &document);

        // The document store is the caller's source of truth; it is
        // written before any index so a reader never hydrates a missing
        // document. It carries the content too, which the structural
        // walk deliberately does not see.
        if let Some(ref store) = self.docstore {
            let mut stored = assembled.clone();
            if let Value::Object(ref mut map) = stored {
                map.insert("content".to_string(), Value::String(document.content.clone()));
            }
            store.put(&key, &stored)?;
        }

        // Embedding happens outside the write mutex: the model is the
        // slowest collaborator and must not block other writers
        let (vector_input, embed_failed) = match document.vector {
            Some(ref v) => (Some(v.clone()), false),
            None => match (&self.embedder, document.content.is_empty()) {
                (Some(embedder), false) => match embedder.embed(&document.content) {
                    Ok(v) => (Some(v), false),
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "Embedding failed; document will not be semantically searchable");
                        (None, true)
                    }
                },
                _ => (None, false),
            },
        };

        let _write = self.write_lock();
        let mut failed = LayerSet::default();
        let mut details: Vec<String> = Vec::new();
        let mut vector_indexed = false;

        // The three layer writes run in parallel and are all awaited
        // before the put returns
        let (structural_res, fulltext_res, vector_res) = std::thread::scope(|scope| {
            let structural_task = scope.spawn(|| inner.structural.add(&key, &assembled));
            let fulltext_task = scope.spawn(|| {
                inner
                    .fulltext
                    .add(id, collection, &document.content, document.metadata.as_ref())
            });
            let vector_task = scope.spawn(|| match vector_input {
                Some(ref v) => inner
                    .vector
                    .upsert(&key, v, document.metadata.clone())
                    .map(|_| true),
                None => Ok(false),
            });
            (
                structural_task.join().expect("structural write panicked"),
                fulltext_task.join().expect("fulltext write panicked"),
                vector_task.join().expect("vector write panicked"),
            )
        });

        if let Err(e) = structural_res {
            failed.insert(LayerSet::STRUCTURAL);
            details.push(format!("structural: {}", e));
        }
        if let Err(e) = fulltext_res {
            failed.insert(LayerSet::FULLTEXT);
            details.push(format!("fulltext: {}", e));
        }
        match vector_res {
            Ok(indexed) => vector_indexed = indexed,
            Err(e) => {
                // Non-fatal: the vector path has an external dependency
                // that may be transiently down
                failed.insert(LayerSet::VECTOR);
                tracing::warn!(key = %key, error = %e, "Vector layer write failed; put proceeds on structural + full-text");
            }
        }

        if failed.contains(LayerSet::STRUCTURAL) || failed.contains(LayerSet::FULLTEXT) {
            return Err(IndexError::Partial {
                layers: failed,
                detail: details.join("; "),
            });
        }

        if embed_failed {
            tracing::debug!(key = %key, "Document indexed without vector");
        }
        Ok(PutReport { key, vector_indexed })
    }

    /// Remove a document from every layer.
    pub fn delete(&self, collection: &str, id: &str) -> Result<(), IndexError> {
        let inner = self.inner()?;
        let key = compose_key(collection, id);

        if let Some(ref store) = self.docstore {
            store.delete(&key)?;
        }

        let _write = self.write_lock();
        let mut failed = LayerSet::default();
        let mut details: Vec<String> = Vec::new();

        if let Err(e) = inner.structural.remove(&key) {
            failed.insert(LayerSet::STRUCTURAL);
            details.push(format!("structural: {}", e));
        }
        if let Err(e) = inner.fulltext.remove(id, collection) {
            failed.insert(LayerSet::FULLTEXT);
            details.push(format!("fulltext: {}", e));
        }
        if let Err(e) = inner.vector.delete(&key) {
            failed.insert(LayerSet::VECTOR);
            tracing::warn!(key = %key, error = %e, "Vector delete failed; tombstone pending");
        }

        if failed.contains(LayerSet::STRUCTURAL) || failed.contains(LayerSet::FULLTEXT) {
            return Err(IndexError::Partial {
                layers: failed,
                detail: details.join("; "),
            });
        }
        Ok(())
    }

    /// Drain a batch of writes, puts first, then deletes, in bounded
    /// batches. Individual failures are collected, not fatal.
    pub fn bulk_write(&self, ops: Vec<WriteOp>) -> Result<BulkReport, IndexError> {
        self.inner()?;
        let (puts, deletes): (Vec<_>, Vec<_>) = ops
            .into_iter()
            .partition(|op| matches!(op, WriteOp::Put { .. }));

        let mut report = BulkReport::default();
        for batch in puts.chunks(BULK_BATCH_SIZE) {
            for op in batch {
                let WriteOp::Put {
                    collection,
                    id,
                    document,
                } = op
                else {
                    continue;
                };
                match self.put(collection, id, document.clone(), None) {
                    Ok(_) => report.succeeded += 1,
                    Err(e) => report
                        .failed
                        .push((compose_key(collection, id), e.to_string())),
                }
            }
        }
        for batch in deletes.chunks(BULK_BATCH_SIZE) {
            for op in batch {
                let WriteOp::Delete { collection, id } = op else {
                    continue;
                };
                match self.delete(collection, id) {
                    Ok(()) => report.succeeded += 1,
                    Err(e) => report
                        .failed
                        .push((compose_key(collection, id), e.to_string())),
                }
            }
        }
        tracing::info!(
            succeeded = report.succeeded,
            failed = report.failed.len(),
            "Bulk write drained"
        );
        Ok(report)
    }

    /// Execute a hybrid search.
    pub fn search(&self, request: &SearchRequest) -> Result<SearchResponse, IndexError> {
        let inner = self.inner()?;
        Ok(inner.planner.search(request)?)
    }

    /// Forward to the document store's snapshot primitive.
    pub fn snapshot(&self) -> Result<Value, IndexError> {
        self.inner()?;
        let store = self.docstore.as_ref().ok_or_else(|| {
            IndexError::DocStore(DocStoreError::Snapshot(
                "no document store configured".to_string(),
            ))
        })?;
        Ok(store.snapshot()?)
    }

    /// Persist the vector layer now.
    pub fn save(&self) -> Result<(), IndexError> {
        let inner = self.inner()?;
        inner.vector.save()?;
        Ok(())
    }

    /// Rebuild the vector index when tombstones exceed the threshold.
    /// Returns whether a rebuild ran.
    pub fn maintenance(&self) -> Result<bool, IndexError> {
        let inner = self.inner()?;
        Ok(inner.vector.maintenance()?)
    }

    pub fn stats(&self) -> Result<EngineStats, IndexError> {
        let inner = self.inner()?;
        Ok(EngineStats {
            vector: inner.vector.stats(),
            fulltext: inner.fulltext.stats()?,
        })
    }

    /// Stop auto-save, save unsaved vector state, and release storage.
    /// Idempotent; the coordinator can be re-initialized afterwards.
    pub fn close(&self) -> Result<(), IndexError> {
        let inner = { self.write_guard_inner().take() };
        let Some(inner) = inner else {
            return Ok(());
        };
        if let Ok(inner) = Arc::try_unwrap(inner) {
            // Dropping the AutoSave joins its thread before layers go away
            drop(inner.autosave);
            inner.vector.close()?;
            inner.fulltext.dispose();
            inner.db.close();
        } else {
            tracing::warn!("Coordinator closed while operations in flight; storage released on last drop");
        }
        tracing::info!("Index coordinator closed");
        Ok(())
    }

    // ===== internals =====

    fn inner(&self) -> Result<Arc<Inner>, IndexError> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .cloned()
            .ok_or(IndexError::NotInitialized)
    }

    fn write_guard_inner(&self) -> std::sync::RwLockWriteGuard<'_, Option<Arc<Inner>>> {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_mutex
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for IndexCoordinator {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "Close during drop failed");
        }
    }
}

/// Assemble the tree the structural index walks: identity fields and
/// timestamps at the top level, dotted attribute paths expanded into
/// nested objects, metadata under `metadata`.
fn assemble_structural_doc(collection: &str, id: &str, document: &Document) -> Value {
    let mut root = serde_json::Map::new();
    root.insert("id".to_string(), Value::String(id.to_string()));
    root.insert(
        "collection".to_string(),
        Value::String(collection.to_string()),
    );
    let now = chrono::Utc::now().to_rfc3339();
    root.insert("updated_at".to_string(), Value::String(now));

    for (path, value) in &document.attributes {
        insert_at_path(&mut root, path, value.clone());
    }
    if let Some(ref metadata) = document.metadata {
        match root.get_mut("metadata") {
            Some(Value::Object(existing)) => {
                if let Value::Object(incoming) = metadata {
                    for (k, v) in incoming {
                        existing.entry(k.clone()).or_insert_with(|| v.clone());
                    }
                }
            }
            _ => {
                root.insert("metadata".to_string(), metadata.clone());
            }
        }
    }
    Value::Object(root)
}

/// Expand a dotted path into nested objects, merging with siblings.
fn insert_at_path(root: &mut serde_json::Map<String, Value>, path: &str, value: Value) {
    let mut parts = path.split('.').peekable();
    let mut current = root;
    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            current.insert(part.to_string(), value);
            return;
        }
        let slot = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        if !slot.is_object() {
            // A scalar already sits on this path; the deeper value wins
            *slot = Value::Object(serde_json::Map::new());
        }
        current = slot.as_object_mut().expect("just ensured object");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_layer_set_bitmask() {
        let mut set = LayerSet::default();
        assert!(set.is_empty());
        set.insert(LayerSet::STRUCTURAL);
        set.insert(LayerSet::VECTOR);
        assert!(set.contains(LayerSet::STRUCTURAL));
        assert!(set.contains(LayerSet::VECTOR));
        assert!(!set.contains(LayerSet::FULLTEXT));
        assert_eq!(format!("{:?}", set), "{structural,vector}");
    }

    #[test]
    fn test_assemble_structural_doc_expands_dotted_paths() {
        let document = Document::new("body")
            .with_attribute("type", "note")
            .with_attribute("data.category", "tech")
            .with_attribute("data.tags", json!(["a", "b"]))
            .with_attribute("metadata.lang", "en");
        let assembled = assemble_structural_doc("articles", "d1", &document);

        assert_eq!(assembled["id"], "d1");
        assert_eq!(assembled["collection"], "articles");
        assert_eq!(assembled["type"], "note");
        assert_eq!(assembled["data"]["category"], "tech");
        assert_eq!(assembled["data"]["tags"], json!(["a", "b"]));
        assert_eq!(assembled["metadata"]["lang"], "en");
        assert!(assembled["updated_at"].is_string());
    }

    #[test]
    fn test_assemble_merges_metadata_object() {
        let document = Document::new("body")
            .with_attribute("metadata.lang", "en")
            .with_metadata(json!({"source": "rss", "lang": "override-loses"}));
        let assembled = assemble_structural_doc("c", "d", &document);

        // Attribute paths win over the metadata blob on collision
        assert_eq!(assembled["metadata"]["lang"], "en");
        assert_eq!(assembled["metadata"]["source"], "rss");
    }

    #[test]
    fn test_insert_at_path_scalar_conflict() {
        let mut root = serde_json::Map::new();
        insert_at_path(&mut root, "a", json!("scalar"));
        insert_at_path(&mut root, "a.b", json!("nested"));
        assert_eq!(root["a"]["b"], "nested");
    }
}

//! Vector layer: HNSW graph + durable sidecar + generation publishing.
//!
//! The sidecar database is the canonical truth; the graph is an
//! acceleration structure reconstructed from it whenever the published
//! generation is missing, corrupt, or behind. Labels are monotone `u64`s,
//! never reused within a generation; updates tombstone the old label and a
//! rebuild renumbers densely to reclaim the space.
//!
//! Visibility ordering: the in-memory doc_id ↔ label bijections are
//! updated only after both the graph insert and the sidecar commit
//! succeed, so a reader that resolves a label to a doc_id never sees a
//! label that is not durable.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde_json::Value;
use thiserror::Error;

use crate::config::{Space, VectorConfig};
use crate::db::{Database, DbError};
use crate::embedder::normalize_in_place;
use crate::generation::{GenerationError, GenerationManager, WriteLock};
use crate::hnsw::{HnswError, HnswIndex};
use crate::sidecar::{SidecarError, SidecarStore};

/// Sidecar database filename inside the layer's base directory.
const SIDECAR_DB: &str = "sidecar.db";

/// Backoff schedule for transient publish failures during save.
const SAVE_RETRY_BACKOFF_MS: &[u64] = &[10, 20, 50, 100, 200];

#[derive(Error, Debug)]
pub enum VectorError {
    #[error("Sidecar error: {0}")]
    Sidecar(#[from] SidecarError),
    #[error("Index error: {0}")]
    Hnsw(#[from] HnswError),
    #[error("Persistence error: {0}")]
    Generation(#[from] GenerationError),
    #[error("Database error: {0}")]
    Db(#[from] DbError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("Zero vector rejected for {0} space")]
    ZeroVector(Space),
    #[error("Inconsistent metadata for {field}: persisted {persisted}, configured {configured}")]
    InconsistentMetadata {
        field: &'static str,
        persisted: String,
        configured: String,
    },
    #[error("Startup self-check failed: {0}")]
    SelfCheck(String),
}

/// Options for a vector search.
pub struct SearchOptions<'a> {
    /// Drop hits scoring below this value.
    pub min_score: Option<f32>,
    /// Keep only doc_ids the predicate accepts.
    pub filter: Option<&'a (dyn Fn(&str) -> bool + Sync)>,
    /// Attach sidecar metadata to each hit.
    pub with_metadata: bool,
    /// Attach the stored vector to each hit.
    pub with_vector: bool,
}

impl Default for SearchOptions<'_> {
    fn default() -> Self {
        Self {
            min_score: None,
            filter: None,
            with_metadata: false,
            with_vector: false,
        }
    }
}

/// A scored search hit.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub doc_id: String,
    /// Similarity score in [0, 1], higher is more similar.
    pub score: f32,
    pub label: u64,
    pub metadata: Option<Value>,
    pub vector: Option<Vec<f32>>,
}

/// Layer statistics.
#[derive(Debug, Clone)]
pub struct VectorStats {
    /// Labels allocated so far (`next_label`).
    pub total_vectors: u64,
    /// Live documents.
    pub active_vectors: u64,
    /// Tombstoned labels awaiting a rebuild.
    pub deleted_vectors: u64,
    /// `(total − active) / total`; rebuild reclaims when this passes 0.3.
    pub tombstone_ratio: f64,
    pub dimensions: usize,
    pub space: Space,
}

/// Tombstone fraction above which `maintenance` rebuilds the graph.
const REBUILD_THRESHOLD: f64 = 0.3;

/// Graph plus bijections, guarded together so readers always observe a
/// consistent pairing.
struct Inner {
    hnsw: HnswIndex,
    doc_to_label: HashMap<String, u64>,
    label_to_doc: HashMap<u64, String>,
    next_label: u64,
}

/// Serialized form of `<stem>.meta.json`, written on every save.
#[derive(serde::Serialize, serde::Deserialize)]
struct LayerMeta {
    dimensions: usize,
    space: Space,
    normalized: bool,
    total_vectors: u64,
    active_vectors: u64,
    deleted_vectors: u64,
    saved_at: String,
    generation_path: String,
}

pub struct VectorLayer {
    config: VectorConfig,
    base: PathBuf,
    db: Arc<Database>,
    sidecar: SidecarStore,
    generations: GenerationManager,
    inner: RwLock<Inner>,
    /// Serializes overlapping saves (auto-save vs explicit).
    save_lock: Mutex<()>,
    dirty: AtomicBool,
    /// Held for the lifetime of the layer; released on drop.
    _write_lock: WriteLock,
}

impl std::fmt::Debug for VectorLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorLayer").field("base", &self.base).finish()
    }
}

impl VectorLayer {
    /// Open (creating if missing) a vector layer rooted at `base`.
    ///
    /// Acquires the advisory write lock, opens the sidecar, verifies
    /// persisted dimensionality/space against the configuration, rebuilds
    /// the in-memory bijections, and loads the current generation —
    /// falling back to a graph rebuild from the sidecar when the
    /// generation is absent, corrupt, or behind the sidecar state.
    pub fn open(base: &Path, config: VectorConfig) -> Result<Self, VectorError> {
        std::fs::create_dir_all(base)?;
        let base = dunce::canonicalize(base)?;
        let write_lock = WriteLock::acquire(&base, &config.stem)?;

        let db = Arc::new(Database::open(&base.join(SIDECAR_DB))?);
        let sidecar = SidecarStore::open(db.clone(), config.dimensions)?;

        check_persisted_meta(&sidecar, &config)?;

        let mappings = sidecar.all_mappings()?;
        let mut doc_to_label = HashMap::with_capacity(mappings.len());
        let mut label_to_doc = HashMap::with_capacity(mappings.len());
        let mut max_label: Option<u64> = None;
        for (label, doc_id) in mappings {
            doc_to_label.insert(doc_id.clone(), label);
            label_to_doc.insert(label, doc_id);
            max_label = Some(max_label.map_or(label, |m| m.max(label)));
        }
        let next_label = sidecar
            .next_label()?
            .max(max_label.map_or(0, |m| m + 1));

        let generations = GenerationManager::new(base.clone(), config.stem.clone());
        let hnsw = load_or_rebuild_graph(&generations, &sidecar, &config, doc_to_label.len())?;

        let layer = Self {
            config,
            base,
            db,
            sidecar,
            generations,
            inner: RwLock::new(Inner {
                hnsw,
                doc_to_label,
                label_to_doc,
                next_label,
            }),
            save_lock: Mutex::new(()),
            dirty: AtomicBool::new(false),
            _write_lock: write_lock,
        };
        layer.self_check()?;

        let stats = layer.stats();
        tracing::info!(
            base = %layer.base.display(),
            active = stats.active_vectors,
            total = stats.total_vectors,
            "Vector layer opened"
        );
        Ok(layer)
    }

    /// Startup self-check: the graph must answer knn probes consistently
    /// with the mapping state. Fails fast rather than serving bad results.
    fn self_check(&self) -> Result<(), VectorError> {
        let inner = self.read_inner();
        let active_in_graph = inner.hnsw.count().saturating_sub(inner.hnsw.deleted_count());
        if active_in_graph != inner.doc_to_label.len() {
            return Err(VectorError::SelfCheck(format!(
                "graph holds {} live points but mapping has {} documents",
                active_in_graph,
                inner.doc_to_label.len()
            )));
        }
        if let Some((&label, doc_id)) = inner.label_to_doc.iter().next() {
            let (probe, _) = self
                .sidecar
                .get_vector(doc_id)?
                .ok_or_else(|| VectorError::SelfCheck(format!("mapping references '{}' but the sidecar has no record", doc_id)))?;
            let hits = inner.hnsw.knn(&probe, 1)?;
            if hits.is_empty() {
                return Err(VectorError::SelfCheck(format!(
                    "knn probe for label {} returned no results from a non-empty graph",
                    label
                )));
            }
        }
        Ok(())
    }

    /// Insert or update a document's vector.
    ///
    /// Returns the label now owning the document. A payload identical to
    /// the stored record (same content hash) is skipped without allocating
    /// a label; an update tombstones the old label.
    pub fn upsert(
        &self,
        doc_id: &str,
        vector: &[f32],
        metadata: Option<Value>,
    ) -> Result<u64, VectorError> {
        let prepared = self.prepare_vector(vector)?;
        let content_hash = content_hash(&prepared, metadata.as_ref());

        // Dedup: identical payload for the same doc is a no-op
        if let Some(record) = self.sidecar.get_record(doc_id)? {
            if record.content_hash == content_hash {
                tracing::debug!(doc_id = doc_id, "Upsert skipped, content hash unchanged");
                return Ok(record.label);
            }
        }

        let mut inner = self.write_inner();
        let old_label = inner.doc_to_label.get(doc_id).copied();
        if let Some(old) = old_label {
            // Best-effort tombstone; dropping the mapping below is what
            // actually guarantees the old point never surfaces
            inner.hnsw.mark_deleted(old);
        }

        let new_label = inner.next_label;
        // The label is consumed even if the insert fails below: reusing it
        // would alias a point that may already be in the graph
        inner.next_label += 1;

        self.ensure_insertable(&mut inner)?;
        inner.hnsw.add(&prepared, new_label)?;

        if let Err(e) = self.sidecar.save_vector(
            doc_id,
            new_label,
            &prepared,
            &content_hash,
            metadata.as_ref(),
            self.config.space.normalizes(),
        ) {
            // The graph point is unreferenced; tombstone it and surface
            // the sidecar failure
            inner.hnsw.mark_deleted(new_label);
            return Err(e.into());
        }

        // Mapping updates come last: a resolvable label is always durable
        if let Some(old) = old_label {
            inner.label_to_doc.remove(&old);
        }
        inner.doc_to_label.insert(doc_id.to_string(), new_label);
        inner.label_to_doc.insert(new_label, doc_id.to_string());
        drop(inner);

        self.dirty.store(true, Ordering::SeqCst);
        tracing::debug!(doc_id = doc_id, label = new_label, "Vector upserted");
        Ok(new_label)
    }

    /// k-nearest search over live documents.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        opts: &SearchOptions<'_>,
    ) -> Result<Vec<SearchHit>, VectorError> {
        let prepared = self.prepare_vector(query)?;
        let inner = self.read_inner();
        let raw = inner.hnsw.knn(&prepared, k)?;

        let mut hits = Vec::with_capacity(k);
        for (label, distance) in raw {
            // Unmapped labels are tombstones riding in the graph
            let Some(doc_id) = inner.label_to_doc.get(&label) else {
                continue;
            };
            let score = HnswIndex::distance_to_score(self.config.space, distance);
            if let Some(min) = opts.min_score {
                if score < min {
                    continue;
                }
            }
            if let Some(filter) = opts.filter {
                if !filter(doc_id) {
                    continue;
                }
            }
            hits.push(SearchHit {
                doc_id: doc_id.clone(),
                score,
                label,
                metadata: None,
                vector: None,
            });
            if hits.len() >= k {
                break;
            }
        }
        drop(inner);

        if opts.with_metadata || opts.with_vector {
            let ids: Vec<&str> = hits.iter().map(|h| h.doc_id.as_str()).collect();
            let mut records = self.sidecar.batch_get(&ids)?;
            for hit in &mut hits {
                if let Some((vector, metadata)) = records.remove(&hit.doc_id) {
                    if opts.with_metadata {
                        hit.metadata = metadata;
                    }
                    if opts.with_vector {
                        hit.vector = Some(vector);
                    }
                }
            }
        }
        Ok(hits)
    }

    /// Remove a document. The graph keeps a tombstone until the next
    /// rebuild. Returns whether the document existed.
    pub fn delete(&self, doc_id: &str) -> Result<bool, VectorError> {
        let mut inner = self.write_inner();
        let Some(&label) = inner.doc_to_label.get(doc_id) else {
            return Ok(false);
        };
        // Durable removal first; the in-memory mapping never runs ahead of
        // the sidecar
        self.sidecar.remove_vector(doc_id)?;
        inner.doc_to_label.remove(doc_id);
        inner.label_to_doc.remove(&label);
        inner.hnsw.mark_deleted(label);
        drop(inner);

        self.dirty.store(true, Ordering::SeqCst);
        tracing::debug!(doc_id = doc_id, label = label, "Vector deleted");
        Ok(true)
    }

    /// Exact vector recall from the sidecar.
    pub fn get_vector(&self, doc_id: &str) -> Result<Option<(Vec<f32>, Option<Value>)>, VectorError> {
        Ok(self.sidecar.get_vector(doc_id)?)
    }

    /// The label currently mapped to a document, if live.
    pub fn get_label(&self, doc_id: &str) -> Option<u64> {
        self.read_inner().doc_to_label.get(doc_id).copied()
    }

    pub fn contains(&self, doc_id: &str) -> bool {
        self.read_inner().doc_to_label.contains_key(doc_id)
    }

    /// Fetch vectors and metadata for several documents at once.
    pub fn batch_get(
        &self,
        doc_ids: &[&str],
    ) -> Result<HashMap<String, (Vec<f32>, Option<Value>)>, VectorError> {
        Ok(self.sidecar.batch_get(doc_ids)?)
    }

    /// Adjust query-time search breadth.
    pub fn set_ef(&self, ef: usize) {
        self.read_inner().hnsw.set_ef(ef);
    }

    pub fn stats(&self) -> VectorStats {
        let inner = self.read_inner();
        let total = inner.next_label;
        let active = inner.doc_to_label.len() as u64;
        let deleted = total.saturating_sub(active);
        VectorStats {
            total_vectors: total,
            active_vectors: active,
            deleted_vectors: deleted,
            tombstone_ratio: if total == 0 {
                0.0
            } else {
                deleted as f64 / total as f64
            },
            dimensions: self.config.dimensions,
            space: self.config.space,
        }
    }

    /// Whether there are unsaved changes.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Access to the sidecar stats (count, bytes, last update).
    pub fn sidecar_stats(&self) -> Result<crate::sidecar::SidecarStats, VectorError> {
        Ok(self.sidecar.stats()?)
    }

    /// Publish the current graph as a new generation.
    ///
    /// Ordered protocol: save stats (including a checksum of the sorted
    /// doc_id set) into the sidecar, publish the serialized graph with
    /// retry backoff, checkpoint the WAL best-effort, then write
    /// `<stem>.meta.json`. Readers keep the previous generation until the
    /// new `CURRENT` pointer lands.
    pub fn save(&self) -> Result<PathBuf, VectorError> {
        let _save_guard = self
            .save_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let _span = tracing::info_span!("vector_save").entered();

        let inner = self.read_inner();
        let stats = {
            let total = inner.next_label;
            let active = inner.doc_to_label.len() as u64;
            (total, active, total.saturating_sub(active))
        };

        let mut doc_ids: Vec<&str> = inner.doc_to_label.keys().map(String::as_str).collect();
        doc_ids.sort_unstable();
        let mut hasher = blake3::Hasher::new();
        for id in &doc_ids {
            hasher.update(id.as_bytes());
            hasher.update(b"\n");
        }
        let doc_set_checksum = hasher.finalize().to_hex().to_string();
        let saved_at = chrono::Utc::now().to_rfc3339();

        self.sidecar.set_meta_batch(&[
            ("total_vectors", stats.0.to_string()),
            ("active_vectors", stats.1.to_string()),
            ("doc_set_checksum", doc_set_checksum),
            ("saved_at", saved_at.clone()),
        ])?;

        let generation_path = self.publish_with_retry(&inner.hnsw)?;

        // Best-effort durability extras; never escalated
        self.sidecar.checkpoint();

        let meta = LayerMeta {
            dimensions: self.config.dimensions,
            space: self.config.space,
            normalized: self.config.space.normalizes(),
            total_vectors: stats.0,
            active_vectors: stats.1,
            deleted_vectors: stats.2,
            saved_at,
            generation_path: generation_path.display().to_string(),
        };
        drop(inner);
        self.write_layer_meta(&meta)?;

        self.dirty.store(false, Ordering::SeqCst);
        tracing::info!(generation = %generation_path.display(), "Vector layer saved");
        Ok(generation_path)
    }

    fn publish_with_retry(&self, hnsw: &HnswIndex) -> Result<PathBuf, VectorError> {
        let mut last_err: Option<GenerationError> = None;
        for (attempt, backoff_ms) in std::iter::once(&0u64)
            .chain(SAVE_RETRY_BACKOFF_MS.iter())
            .enumerate()
        {
            if *backoff_ms > 0 {
                std::thread::sleep(std::time::Duration::from_millis(*backoff_ms));
            }
            match self
                .generations
                .publish(|path| hnsw.serialize(path).map_err(anyhow::Error::from))
            {
                Ok(path) => return Ok(path),
                Err(e) => {
                    tracing::warn!(attempt = attempt + 1, error = %e, "Generation publish failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err
            .map(VectorError::from)
            .unwrap_or_else(|| VectorError::SelfCheck("publish retry loop exhausted".into())))
    }

    /// Atomically write `<stem>.meta.json` (temp + rename).
    fn write_layer_meta(&self, meta: &LayerMeta) -> Result<(), VectorError> {
        let path = self.base.join(format!("{}.meta.json", self.config.stem));
        let tmp = self.base.join(format!("{}.meta.json.tmp", self.config.stem));
        let json = serde_json::to_string_pretty(meta)
            .map_err(|e| VectorError::SelfCheck(format!("meta serialization failed: {}", e)))?;
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Rebuild the graph with densely renumbered labels, reclaiming
    /// tombstone space, then save.
    ///
    /// `on_progress` receives `(done, total)` per re-inserted vector.
    pub fn rebuild(&self, on_progress: Option<&(dyn Fn(usize, usize) + Sync)>) -> Result<(), VectorError> {
        let _span = tracing::info_span!("vector_rebuild").entered();
        {
            let mut inner = self.write_inner();
            let rows = self.sidecar.all_vectors_by_label()?;
            let total = rows.len();
            tracing::info!(count = total, "Rebuilding vector index");

            let capacity = self.config.max_elements.max(total * 2).max(1);
            let mut fresh = HnswIndex::with_capacity(&self.config, capacity);
            let mut doc_to_label = HashMap::with_capacity(total);
            let mut label_to_doc = HashMap::with_capacity(total);
            let mut renumbering = Vec::with_capacity(total);

            for (i, (doc_id, _old_label, vector)) in rows.into_iter().enumerate() {
                let label = i as u64;
                fresh.add(&vector, label)?;
                doc_to_label.insert(doc_id.clone(), label);
                label_to_doc.insert(label, doc_id.clone());
                renumbering.push((doc_id, label));
                if let Some(progress) = on_progress {
                    progress(i + 1, total);
                }
            }

            self.sidecar.renumber_labels(&renumbering)?;
            self.sidecar.set_meta("next_label", &total.to_string())?;

            inner.hnsw = fresh;
            inner.doc_to_label = doc_to_label;
            inner.label_to_doc = label_to_doc;
            inner.next_label = total as u64;
        }
        self.dirty.store(true, Ordering::SeqCst);
        self.save()?;
        Ok(())
    }

    /// Rebuild when the tombstone ratio exceeds the threshold. Returns
    /// whether a rebuild ran.
    pub fn maintenance(&self) -> Result<bool, VectorError> {
        let stats = self.stats();
        if stats.tombstone_ratio > REBUILD_THRESHOLD {
            tracing::info!(
                tombstone_ratio = stats.tombstone_ratio,
                "Tombstone ratio above threshold, rebuilding"
            );
            self.rebuild(None)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Close the layer: save if dirty, checkpoint, release the database.
    pub fn close(&self) -> Result<(), VectorError> {
        if self.is_dirty() {
            self.save()?;
        }
        self.db.close();
        Ok(())
    }

    // ===== internals =====

    fn read_inner(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_inner(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Validate dimensionality and apply the space's normalization policy.
    fn prepare_vector(&self, vector: &[f32]) -> Result<Vec<f32>, VectorError> {
        if vector.len() != self.config.dimensions {
            return Err(VectorError::DimensionMismatch {
                expected: self.config.dimensions,
                actual: vector.len(),
            });
        }
        let mut prepared = vector.to_vec();
        if self.config.space.normalizes() && !normalize_in_place(&mut prepared) {
            return Err(VectorError::ZeroVector(self.config.space));
        }
        Ok(prepared)
    }

    /// Make the graph accept the next insert: thaw a read-only loaded
    /// graph, and grow by doubling at the occupancy threshold.
    fn ensure_insertable(&self, inner: &mut Inner) -> Result<(), VectorError> {
        if !inner.hnsw.is_writable() {
            tracing::info!("Thawing read-only graph before first write");
            let capacity = inner.hnsw.capacity();
            self.reload_graph_from_sidecar(inner, capacity)?;
        }
        if inner.hnsw.needs_growth() {
            let doubled = inner.hnsw.capacity().saturating_mul(2).max(1);
            tracing::info!(
                capacity = inner.hnsw.capacity(),
                new_capacity = doubled,
                "Growing vector index"
            );
            self.reload_graph_from_sidecar(inner, doubled)?;
        }
        Ok(())
    }

    /// Replace the graph with an owned one rebuilt from sidecar records,
    /// preserving existing labels (tombstoned points are dropped in
    /// passing, but label accounting is untouched).
    fn reload_graph_from_sidecar(&self, inner: &mut Inner, capacity: usize) -> Result<(), VectorError> {
        let rows = self.sidecar.all_vectors_by_label()?;
        let capacity = capacity.max(rows.len() * 2).max(1);
        let mut fresh = HnswIndex::with_capacity(&self.config, capacity);
        for (doc_id, label, vector) in rows {
            // Only live mappings re-enter the graph
            if inner.doc_to_label.get(&doc_id) == Some(&label) {
                fresh.add(&vector, label)?;
            }
        }
        inner.hnsw = fresh;
        Ok(())
    }
}

/// Hash of the prepared vector bytes plus metadata, used for idempotent
/// upserts.
fn content_hash(vector: &[f32], metadata: Option<&Value>) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(bytemuck::cast_slice(vector));
    if let Some(meta) = metadata {
        hasher.update(meta.to_string().as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

/// Compare persisted dimensionality/space against configuration, writing
/// them on first open.
fn check_persisted_meta(sidecar: &SidecarStore, config: &VectorConfig) -> Result<(), VectorError> {
    match sidecar.get_meta("dimensions")? {
        Some(persisted) if persisted != config.dimensions.to_string() => {
            return Err(VectorError::InconsistentMetadata {
                field: "dimensions",
                persisted,
                configured: config.dimensions.to_string(),
            });
        }
        Some(_) => {}
        None => sidecar.set_meta("dimensions", &config.dimensions.to_string())?,
    }
    match sidecar.get_meta("space")? {
        Some(persisted) if persisted != config.space.to_string() => {
            return Err(VectorError::InconsistentMetadata {
                field: "space",
                persisted,
                configured: config.space.to_string(),
            });
        }
        Some(_) => {}
        None => sidecar.set_meta("space", &config.space.to_string())?,
    }
    Ok(())
}

/// Load the published generation, falling back to a rebuild from the
/// sidecar when it is missing, corrupt, or out of step with the mappings.
fn load_or_rebuild_graph(
    generations: &GenerationManager,
    sidecar: &SidecarStore,
    config: &VectorConfig,
    active_count: usize,
) -> Result<HnswIndex, VectorError> {
    if let Some(current) = generations.resolve_current() {
        match HnswIndex::deserialize(&current, config) {
            Ok(graph) => {
                let live = graph.count().saturating_sub(graph.deleted_count());
                if live == active_count {
                    tracing::info!(generation = %current.display(), "Loaded published generation");
                    return Ok(graph);
                }
                tracing::warn!(
                    generation = %current.display(),
                    graph_live = live,
                    mapped = active_count,
                    "Generation behind sidecar state, rebuilding graph"
                );
            }
            Err(e) => {
                tracing::warn!(generation = %current.display(), error = %e, "Failed to load generation, rebuilding graph");
            }
        }
    }

    let rows = sidecar.all_vectors_by_label()?;
    let capacity = config.max_elements.max(rows.len() * 2).max(1);
    let mut graph = HnswIndex::with_capacity(config, capacity);
    for (_doc_id, label, vector) in rows {
        graph.add(&vector, label)?;
    }
    if !graph.is_empty() {
        tracing::info!(count = graph.count(), "Graph rebuilt from sidecar");
    }
    Ok(graph)
}

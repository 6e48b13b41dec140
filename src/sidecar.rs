//! Durable sidecar store for vectors and label mappings.
//!
//! The sidecar is the canonical record of what exists in the vector layer:
//! the HNSW graph is a rebuildable acceleration structure, this database is
//! the truth. Three tables: `vectors` (full records), `mappings` (the
//! doc_id ↔ label bijection, rehydrated into memory on open), and
//! `index_metadata` (free-form K/V for persisted configuration and save
//! stats).
//!
//! All writes are transactional; a crash leaves exactly the set of
//! committed transactions visible (WAL journaling via [`Database`]).

use std::collections::HashMap;

use serde_json::Value;
use sqlx::Row;
use std::sync::Arc;
use thiserror::Error;

use crate::db::{Database, DbError};

#[derive(Error, Debug)]
pub enum SidecarError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Database error: {0}")]
    Db(#[from] DbError),
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("Corrupt vector blob for '{doc_id}': {len} bytes is not a multiple of 4")]
    CorruptBlob { doc_id: String, len: usize },
}

/// A full sidecar row.
#[derive(Debug, Clone)]
pub struct SidecarRecord {
    pub doc_id: String,
    pub label: u64,
    pub vector: Vec<f32>,
    pub content_hash: String,
    pub metadata: Option<Value>,
    pub normalized: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// Aggregate statistics over the sidecar.
#[derive(Debug, Clone)]
pub struct SidecarStats {
    /// Number of active records.
    pub count: u64,
    /// Total bytes of stored vector data.
    pub total_bytes: u64,
    /// RFC 3339 timestamp of the most recent write, if any.
    pub last_update: Option<String>,
}

/// Convert a vector to its little-endian byte representation for storage.
fn vector_to_bytes(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Reinterpret a stored blob as f32s. The schema CHECK constraint keeps
/// lengths well-formed, but a corrupt file can still violate it.
/// `pod_collect_to_vec` copies, so blob alignment never matters.
fn bytes_to_vector(doc_id: &str, bytes: &[u8]) -> Result<Vec<f32>, SidecarError> {
    if bytes.len() % 4 != 0 {
        return Err(SidecarError::CorruptBlob {
            doc_id: doc_id.to_string(),
            len: bytes.len(),
        });
    }
    Ok(bytemuck::pod_collect_to_vec::<u8, f32>(bytes))
}

/// Durable doc_id → (label, vector, metadata) map backed by SQLite.
pub struct SidecarStore {
    db: Arc<Database>,
    dim: usize,
}

impl SidecarStore {
    /// Open the store over an existing database handle and create the
    /// schema if missing.
    ///
    /// The CHECK constraint pins every stored blob to the configured
    /// dimensionality, so a record that violates the dimension invariant
    /// cannot become durable even through a buggy code path.
    pub fn open(db: Arc<Database>, dim: usize) -> Result<Self, SidecarError> {
        let store = Self { db, dim };
        store.db.block_on(async {
            let create_vectors = format!(
                "CREATE TABLE IF NOT EXISTS vectors (
                    doc_id TEXT PRIMARY KEY,
                    label INTEGER NOT NULL UNIQUE,
                    vector BLOB NOT NULL CHECK (length(vector) = {}),
                    metadata BLOB,
                    content_hash TEXT NOT NULL,
                    model_version TEXT,
                    normalized INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                )",
                dim * std::mem::size_of::<f32>()
            );
            sqlx::query(&create_vectors).execute(&store.db.pool).await?;
            sqlx::query(
                "CREATE TABLE IF NOT EXISTS mappings (
                    doc_id TEXT PRIMARY KEY,
                    label INTEGER NOT NULL UNIQUE
                )",
            )
            .execute(&store.db.pool)
            .await?;
            sqlx::query(
                "CREATE TABLE IF NOT EXISTS index_metadata (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                )",
            )
            .execute(&store.db.pool)
            .await?;
            Ok::<_, SidecarError>(())
        })?;
        tracing::debug!(dim = dim, "Sidecar schema ready");
        Ok(store)
    }

    /// Insert or replace a record, writing `vectors`, `mappings`, and the
    /// `next_label` high-water mark in one transaction. The high-water mark
    /// must commit atomically with the label that consumed it: a label
    /// reused after a crash could resolve a tombstoned graph point to a new
    /// document. Idempotent when called twice with an identical payload.
    pub fn save_vector(
        &self,
        doc_id: &str,
        label: u64,
        vector: &[f32],
        content_hash: &str,
        metadata: Option<&Value>,
        normalized: bool,
    ) -> Result<(), SidecarError> {
        if vector.len() != self.dim {
            return Err(SidecarError::DimensionMismatch {
                expected: self.dim,
                actual: vector.len(),
            });
        }
        let blob = vector_to_bytes(vector);
        let metadata_blob = metadata.map(|m| serde_json::to_vec(m).unwrap_or_default());
        let now = chrono::Utc::now().to_rfc3339();

        self.db.block_on(async {
            let mut tx = self.db.pool.begin().await?;
            sqlx::query(
                "INSERT INTO vectors
                     (doc_id, label, vector, metadata, content_hash, normalized, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                 ON CONFLICT(doc_id) DO UPDATE SET
                     label = excluded.label,
                     vector = excluded.vector,
                     metadata = excluded.metadata,
                     content_hash = excluded.content_hash,
                     normalized = excluded.normalized,
                     updated_at = excluded.updated_at",
            )
            .bind(doc_id)
            .bind(label as i64)
            .bind(&blob)
            .bind(&metadata_blob)
            .bind(content_hash)
            .bind(normalized as i64)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                "INSERT INTO mappings (doc_id, label) VALUES (?1, ?2)
                 ON CONFLICT(doc_id) DO UPDATE SET label = excluded.label",
            )
            .bind(doc_id)
            .bind(label as i64)
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                "INSERT INTO index_metadata (key, value) VALUES ('next_label', ?1)
                 ON CONFLICT(key) DO UPDATE SET value = MAX(CAST(value AS INTEGER), CAST(excluded.value AS INTEGER))",
            )
            .bind((label + 1) as i64)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok(())
        })
    }

    /// The persisted label high-water mark (labels are never reused below
    /// it within a generation).
    pub fn next_label(&self) -> Result<u64, SidecarError> {
        Ok(self
            .get_meta("next_label")?
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0))
    }

    /// Fetch the vector and metadata for a document.
    pub fn get_vector(&self, doc_id: &str) -> Result<Option<(Vec<f32>, Option<Value>)>, SidecarError> {
        self.db.block_on(async {
            let row = sqlx::query("SELECT vector, metadata FROM vectors WHERE doc_id = ?1")
                .bind(doc_id)
                .fetch_optional(&self.db.pool)
                .await?;
            match row {
                Some(row) => {
                    let blob: Vec<u8> = row.get(0);
                    let metadata_blob: Option<Vec<u8>> = row.get(1);
                    let vector = bytes_to_vector(doc_id, &blob)?;
                    let metadata = metadata_blob.and_then(|b| serde_json::from_slice(&b).ok());
                    Ok(Some((vector, metadata)))
                }
                None => Ok(None),
            }
        })
    }

    /// Fetch the full record for a document (used for content-hash dedup).
    pub fn get_record(&self, doc_id: &str) -> Result<Option<SidecarRecord>, SidecarError> {
        self.db.block_on(async {
            let row = sqlx::query(
                "SELECT label, vector, metadata, content_hash, normalized, created_at, updated_at
                 FROM vectors WHERE doc_id = ?1",
            )
            .bind(doc_id)
            .fetch_optional(&self.db.pool)
            .await?;
            match row {
                Some(row) => {
                    let blob: Vec<u8> = row.get(1);
                    let metadata_blob: Option<Vec<u8>> = row.get(2);
                    Ok(Some(SidecarRecord {
                        doc_id: doc_id.to_string(),
                        label: row.get::<i64, _>(0) as u64,
                        vector: bytes_to_vector(doc_id, &blob)?,
                        metadata: metadata_blob.and_then(|b| serde_json::from_slice(&b).ok()),
                        content_hash: row.get(3),
                        normalized: row.get::<i64, _>(4) != 0,
                        created_at: row.get(5),
                        updated_at: row.get(6),
                    }))
                }
                None => Ok(None),
            }
        })
    }

    /// Fetch the label for a document.
    pub fn get_label(&self, doc_id: &str) -> Result<Option<u64>, SidecarError> {
        self.db.block_on(async {
            let row: Option<(i64,)> =
                sqlx::query_as("SELECT label FROM mappings WHERE doc_id = ?1")
                    .bind(doc_id)
                    .fetch_optional(&self.db.pool)
                    .await?;
            Ok(row.map(|(label,)| label as u64))
        })
    }

    /// Delete a record from both tables. No-op when the document is absent.
    pub fn remove_vector(&self, doc_id: &str) -> Result<(), SidecarError> {
        self.db.block_on(async {
            let mut tx = self.db.pool.begin().await?;
            sqlx::query("DELETE FROM vectors WHERE doc_id = ?1")
                .bind(doc_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM mappings WHERE doc_id = ?1")
                .bind(doc_id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(())
        })
    }

    /// Fetch vectors and metadata for a set of documents.
    ///
    /// Missing documents are simply absent from the result map. Queries are
    /// chunked to keep the bind-parameter count bounded.
    pub fn batch_get(
        &self,
        doc_ids: &[&str],
    ) -> Result<HashMap<String, (Vec<f32>, Option<Value>)>, SidecarError> {
        const BATCH_SIZE: usize = 200;
        let mut result = HashMap::with_capacity(doc_ids.len());
        self.db.block_on(async {
            for batch in doc_ids.chunks(BATCH_SIZE) {
                let placeholders: Vec<String> =
                    (1..=batch.len()).map(|i| format!("?{}", i)).collect();
                let sql = format!(
                    "SELECT doc_id, vector, metadata FROM vectors WHERE doc_id IN ({})",
                    placeholders.join(",")
                );
                let mut query = sqlx::query(&sql);
                for id in batch {
                    query = query.bind(*id);
                }
                let rows = query.fetch_all(&self.db.pool).await?;
                for row in rows {
                    let doc_id: String = row.get(0);
                    let blob: Vec<u8> = row.get(1);
                    let metadata_blob: Option<Vec<u8>> = row.get(2);
                    let vector = bytes_to_vector(&doc_id, &blob)?;
                    let metadata = metadata_blob.and_then(|b| serde_json::from_slice(&b).ok());
                    result.insert(doc_id, (vector, metadata));
                }
            }
            Ok(result)
        })
    }

    /// All (label, doc_id) pairs ordered by label. Used on startup to
    /// rehydrate the in-memory bijections.
    pub fn all_mappings(&self) -> Result<Vec<(u64, String)>, SidecarError> {
        self.db.block_on(async {
            let rows: Vec<(i64, String)> =
                sqlx::query_as("SELECT label, doc_id FROM mappings ORDER BY label ASC")
                    .fetch_all(&self.db.pool)
                    .await?;
            Ok(rows
                .into_iter()
                .map(|(label, doc_id)| (label as u64, doc_id))
                .collect())
        })
    }

    /// Stream every record in label order: `(doc_id, label, vector)`.
    /// Used by graph reconstruction and rebuild.
    pub fn all_vectors_by_label(&self) -> Result<Vec<(String, u64, Vec<f32>)>, SidecarError> {
        self.db.block_on(async {
            let rows = sqlx::query("SELECT doc_id, label, vector FROM vectors ORDER BY label ASC")
                .fetch_all(&self.db.pool)
                .await?;
            let mut out = Vec::with_capacity(rows.len());
            for row in rows {
                let doc_id: String = row.get(0);
                let label: i64 = row.get(1);
                let blob: Vec<u8> = row.get(2);
                let vector = bytes_to_vector(&doc_id, &blob)?;
                out.push((doc_id, label as u64, vector));
            }
            Ok(out)
        })
    }

    /// Rewrite every label in one transaction.
    ///
    /// `renumbering` maps doc_id → new label. Labels carry a UNIQUE
    /// constraint, so the update runs in two phases: first every touched
    /// row gets a negative placeholder (cannot collide with live labels),
    /// then the placeholders flip to their final values.
    pub fn renumber_labels(&self, renumbering: &[(String, u64)]) -> Result<(), SidecarError> {
        self.db.block_on(async {
            let mut tx = self.db.pool.begin().await?;
            for (doc_id, new_label) in renumbering {
                let placeholder = -(*new_label as i64) - 1;
                sqlx::query("UPDATE vectors SET label = ?1 WHERE doc_id = ?2")
                    .bind(placeholder)
                    .bind(doc_id)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("UPDATE mappings SET label = ?1 WHERE doc_id = ?2")
                    .bind(placeholder)
                    .bind(doc_id)
                    .execute(&mut *tx)
                    .await?;
            }
            sqlx::query("UPDATE vectors SET label = -label - 1 WHERE label < 0")
                .execute(&mut *tx)
                .await?;
            sqlx::query("UPDATE mappings SET label = -label - 1 WHERE label < 0")
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(())
        })
    }

    /// Store a metadata value, replacing any prior value for the key.
    pub fn set_meta(&self, key: &str, value: &str) -> Result<(), SidecarError> {
        self.db.block_on(async {
            sqlx::query(
                "INSERT INTO index_metadata (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            )
            .bind(key)
            .bind(value)
            .execute(&self.db.pool)
            .await?;
            Ok(())
        })
    }

    /// Store several metadata values in one transaction (used by `save` so
    /// the stats block is all-or-nothing).
    pub fn set_meta_batch(&self, entries: &[(&str, String)]) -> Result<(), SidecarError> {
        self.db.block_on(async {
            let mut tx = self.db.pool.begin().await?;
            for (key, value) in entries {
                sqlx::query(
                    "INSERT INTO index_metadata (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                )
                .bind(*key)
                .bind(value)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
            Ok(())
        })
    }

    /// Read a metadata value.
    pub fn get_meta(&self, key: &str) -> Result<Option<String>, SidecarError> {
        self.db.block_on(async {
            let row: Option<(String,)> =
                sqlx::query_as("SELECT value FROM index_metadata WHERE key = ?1")
                    .bind(key)
                    .fetch_optional(&self.db.pool)
                    .await?;
            Ok(row.map(|(v,)| v))
        })
    }

    /// Aggregate statistics.
    pub fn stats(&self) -> Result<SidecarStats, SidecarError> {
        self.db.block_on(async {
            let row: (i64, Option<i64>, Option<String>) = sqlx::query_as(
                "SELECT COUNT(*), COALESCE(SUM(length(vector)), 0), MAX(updated_at) FROM vectors",
            )
            .fetch_one(&self.db.pool)
            .await?;
            Ok(SidecarStats {
                count: row.0 as u64,
                total_bytes: row.1.unwrap_or(0) as u64,
                last_update: row.2,
            })
        })
    }

    /// Best-effort WAL checkpoint, forwarded to the database handle.
    pub fn checkpoint(&self) {
        self.db.checkpoint();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn open_store(dim: usize) -> (SidecarStore, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let db = Arc::new(Database::open(&dir.path().join("sidecar.db")).unwrap());
        let store = SidecarStore::open(db, dim).unwrap();
        (store, dir)
    }

    #[test]
    fn test_save_and_get_roundtrip() {
        let (store, _dir) = open_store(4);
        let v = vec![0.1f32, 0.2, 0.3, 0.4];
        store
            .save_vector("a", 0, &v, "hash-a", Some(&json!({"k": "v"})), true)
            .unwrap();

        let (vector, metadata) = store.get_vector("a").unwrap().unwrap();
        assert_eq!(vector, v);
        assert_eq!(metadata, Some(json!({"k": "v"})));
        assert_eq!(store.get_label("a").unwrap(), Some(0));
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let (store, _dir) = open_store(4);
        let result = store.save_vector("a", 0, &[1.0, 2.0], "h", None, false);
        assert!(matches!(
            result,
            Err(SidecarError::DimensionMismatch {
                expected: 4,
                actual: 2
            })
        ));
    }

    #[test]
    fn test_upsert_replaces_label_and_vector() {
        let (store, _dir) = open_store(4);
        store
            .save_vector("a", 0, &[1.0, 0.0, 0.0, 0.0], "h1", None, true)
            .unwrap();
        store
            .save_vector("a", 1, &[0.0, 1.0, 0.0, 0.0], "h2", None, true)
            .unwrap();

        assert_eq!(store.get_label("a").unwrap(), Some(1));
        let (vector, _) = store.get_vector("a").unwrap().unwrap();
        assert_eq!(vector, vec![0.0, 1.0, 0.0, 0.0]);
        assert_eq!(store.stats().unwrap().count, 1);
    }

    #[test]
    fn test_remove_vector_is_noop_when_absent() {
        let (store, _dir) = open_store(4);
        store.remove_vector("ghost").unwrap();
        store
            .save_vector("a", 0, &[1.0, 0.0, 0.0, 0.0], "h", None, true)
            .unwrap();
        store.remove_vector("a").unwrap();
        assert!(store.get_vector("a").unwrap().is_none());
        assert!(store.get_label("a").unwrap().is_none());
    }

    #[test]
    fn test_batch_get_skips_missing() {
        let (store, _dir) = open_store(4);
        store
            .save_vector("a", 0, &[1.0, 0.0, 0.0, 0.0], "ha", None, true)
            .unwrap();
        store
            .save_vector("b", 1, &[0.0, 1.0, 0.0, 0.0], "hb", None, true)
            .unwrap();

        let result = store.batch_get(&["a", "b", "missing"]).unwrap();
        assert_eq!(result.len(), 2);
        assert!(result.contains_key("a"));
        assert!(!result.contains_key("missing"));
    }

    #[test]
    fn test_all_mappings_ordered_by_label() {
        let (store, _dir) = open_store(4);
        store
            .save_vector("b", 2, &[0.0, 1.0, 0.0, 0.0], "hb", None, true)
            .unwrap();
        store
            .save_vector("a", 1, &[1.0, 0.0, 0.0, 0.0], "ha", None, true)
            .unwrap();

        let mappings = store.all_mappings().unwrap();
        assert_eq!(mappings, vec![(1, "a".to_string()), (2, "b".to_string())]);
    }

    #[test]
    fn test_renumber_labels_dense() {
        let (store, _dir) = open_store(4);
        store
            .save_vector("a", 5, &[1.0, 0.0, 0.0, 0.0], "ha", None, true)
            .unwrap();
        store
            .save_vector("b", 9, &[0.0, 1.0, 0.0, 0.0], "hb", None, true)
            .unwrap();

        store
            .renumber_labels(&[("a".to_string(), 0), ("b".to_string(), 1)])
            .unwrap();

        assert_eq!(store.get_label("a").unwrap(), Some(0));
        assert_eq!(store.get_label("b").unwrap(), Some(1));
        let mappings = store.all_mappings().unwrap();
        assert_eq!(mappings[0].0, 0);
        assert_eq!(mappings[1].0, 1);
    }

    #[test]
    fn test_renumber_swap_respects_unique_constraint() {
        let (store, _dir) = open_store(4);
        store
            .save_vector("a", 0, &[1.0, 0.0, 0.0, 0.0], "ha", None, true)
            .unwrap();
        store
            .save_vector("b", 1, &[0.0, 1.0, 0.0, 0.0], "hb", None, true)
            .unwrap();

        // Swapping labels collides without the placeholder phase
        store
            .renumber_labels(&[("a".to_string(), 1), ("b".to_string(), 0)])
            .unwrap();
        assert_eq!(store.get_label("a").unwrap(), Some(1));
        assert_eq!(store.get_label("b").unwrap(), Some(0));
    }

    #[test]
    fn test_next_label_tracks_high_water_mark() {
        let (store, _dir) = open_store(4);
        assert_eq!(store.next_label().unwrap(), 0);
        store
            .save_vector("a", 0, &[1.0, 0.0, 0.0, 0.0], "h0", None, true)
            .unwrap();
        store
            .save_vector("a", 1, &[0.0, 1.0, 0.0, 0.0], "h1", None, true)
            .unwrap();
        assert_eq!(store.next_label().unwrap(), 2);
        // Deleting the record does not lower the mark
        store.remove_vector("a").unwrap();
        assert_eq!(store.next_label().unwrap(), 2);
    }

    #[test]
    fn test_meta_roundtrip() {
        let (store, _dir) = open_store(4);
        assert!(store.get_meta("dimensions").unwrap().is_none());
        store.set_meta("dimensions", "4").unwrap();
        assert_eq!(store.get_meta("dimensions").unwrap().as_deref(), Some("4"));
        store.set_meta("dimensions", "8").unwrap();
        assert_eq!(store.get_meta("dimensions").unwrap().as_deref(), Some("8"));
    }

    #[test]
    fn test_stats_counts_bytes() {
        let (store, _dir) = open_store(4);
        assert_eq!(store.stats().unwrap().count, 0);
        store
            .save_vector("a", 0, &[1.0, 0.0, 0.0, 0.0], "h", None, true)
            .unwrap();
        let stats = store.stats().unwrap();
        assert_eq!(stats.count, 1);
        assert_eq!(stats.total_bytes, 16);
        assert!(stats.last_update.is_some());
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("sidecar.db");
        {
            let db = Arc::new(Database::open(&path).unwrap());
            let store = SidecarStore::open(db.clone(), 4).unwrap();
            store
                .save_vector("a", 0, &[1.0, 0.0, 0.0, 0.0], "h", None, true)
                .unwrap();
            db.close();
        }
        let db = Arc::new(Database::open(&path).unwrap());
        let store = SidecarStore::open(db, 4).unwrap();
        assert_eq!(store.get_label("a").unwrap(), Some(0));
    }
}

//! Document store interface.
//!
//! The engine indexes documents; storing the full JSON payload is the
//! caller's concern. The trait mirrors the minimal surface the coordinator
//! and planner need: point reads for hydration, point writes kept in step
//! with index writes, and a snapshot primitive forwarded verbatim.

use std::collections::BTreeMap;
use std::sync::RwLock;

use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DocStoreError {
    #[error("Document store error: {0}")]
    Backend(String),
    #[error("Snapshot failed: {0}")]
    Snapshot(String),
}

/// A single bulk operation against the store.
#[derive(Debug, Clone)]
pub enum DocOp {
    Put { key: String, value: Value },
    Delete { key: String },
}

/// External document store.
///
/// Implementations must be thread-safe. Keys are the engine's composite
/// `"collection:id"` form.
pub trait DocumentStore: Send + Sync {
    fn put(&self, key: &str, value: &Value) -> Result<(), DocStoreError>;

    fn get(&self, key: &str) -> Result<Option<Value>, DocStoreError>;

    fn delete(&self, key: &str) -> Result<(), DocStoreError>;

    /// Apply a batch of operations. The default loops over `put`/`delete`;
    /// backends with native batching should override.
    fn bulk_write(&self, ops: &[DocOp]) -> Result<(), DocStoreError> {
        for op in ops {
            match op {
                DocOp::Put { key, value } => self.put(key, value)?,
                DocOp::Delete { key } => self.delete(key)?,
            }
        }
        Ok(())
    }

    /// Produce a point-in-time snapshot of the store contents.
    fn snapshot(&self) -> Result<Value, DocStoreError>;

    fn keys(&self) -> Result<Vec<String>, DocStoreError>;
}

/// In-memory document store.
///
/// The default wiring when no external store is supplied, and the test
/// double for coordinator and planner tests. Snapshots are a deep copy of
/// the current map as a JSON object.
#[derive(Default)]
pub struct MemoryDocumentStore {
    docs: RwLock<BTreeMap<String, Value>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.docs.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DocumentStore for MemoryDocumentStore {
    fn put(&self, key: &str, value: &Value) -> Result<(), DocStoreError> {
        let mut docs = self
            .docs
            .write()
            .map_err(|_| DocStoreError::Backend("store lock poisoned".into()))?;
        docs.insert(key.to_string(), value.clone());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Value>, DocStoreError> {
        let docs = self
            .docs
            .read()
            .map_err(|_| DocStoreError::Backend("store lock poisoned".into()))?;
        Ok(docs.get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<(), DocStoreError> {
        let mut docs = self
            .docs
            .write()
            .map_err(|_| DocStoreError::Backend("store lock poisoned".into()))?;
        docs.remove(key);
        Ok(())
    }

    fn snapshot(&self) -> Result<Value, DocStoreError> {
        let docs = self
            .docs
            .read()
            .map_err(|_| DocStoreError::Backend("store lock poisoned".into()))?;
        let map: serde_json::Map<String, Value> =
            docs.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        Ok(Value::Object(map))
    }

    fn keys(&self) -> Result<Vec<String>, DocStoreError> {
        let docs = self
            .docs
            .read()
            .map_err(|_| DocStoreError::Backend("store lock poisoned".into()))?;
        Ok(docs.keys().cloned().collect())
    }
}

//! HNSW serialization into generation directories.
//!
//! A serialized index is a directory holding the hnsw_rs graph/data dump
//! (`index.hnsw.graph` + `index.hnsw.data`), a JSON sidecar with the graph
//! parameters and tombstone set (`index.meta.json`), and a blake3 checksum
//! manifest (`index.checksum`). The underlying library serializes with
//! bincode, which is unmaintained (RUSTSEC-2025-0141); the checksums are
//! the corruption guard before any bytes reach the deserializer.

use std::mem::ManuallyDrop;
use std::path::Path;

use hnsw_rs::api::AnnT;
use hnsw_rs::hnswio::HnswIo;
use hnsw_rs::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::{Space, VectorConfig};

use super::{with_graph, GraphState, HnswError, HnswIndex, LoadedGraph, SpaceGraph};

/// Basename for the files inside a generation directory.
const BASENAME: &str = "index";

/// Valid index file extensions (prevents path traversal via a malicious
/// checksum manifest).
const INDEX_EXTENSIONS: &[&str] = &["hnsw.graph", "hnsw.data", "meta.json"];

/// Graph parameters and tombstones persisted next to the dump.
#[derive(Serialize, Deserialize)]
struct GraphMeta {
    dimensions: usize,
    space: Space,
    m: usize,
    ef_construction: usize,
    capacity: usize,
    count: usize,
    deleted: Vec<u64>,
}

/// Verify file checksums using blake3.
///
/// Detects accidental corruption only (disk errors, incomplete writes); an
/// attacker with filesystem access can rewrite both files and manifest.
/// Returns Ok with a warning when no manifest exists.
fn verify_checksums(dir: &Path) -> Result<(), HnswError> {
    let manifest_path = dir.join(format!("{}.checksum", BASENAME));
    if !manifest_path.exists() {
        tracing::warn!(dir = %dir.display(), "No checksum manifest for index; skipping verification");
        return Ok(());
    }

    let manifest = std::fs::read_to_string(&manifest_path)?;
    for line in manifest.lines() {
        if let Some((ext, expected)) = line.split_once(':') {
            if !INDEX_EXTENSIONS.contains(&ext) {
                tracing::warn!(ext = ext, "Ignoring unknown extension in checksum manifest");
                continue;
            }
            let path = dir.join(format!("{}.{}", BASENAME, ext));
            if path.exists() {
                let file = std::fs::File::open(&path)?;
                let mut hasher = blake3::Hasher::new();
                std::io::copy(&mut std::io::BufReader::new(file), &mut hasher)?;
                let actual = hasher.finalize().to_hex().to_string();
                if actual != expected {
                    return Err(HnswError::ChecksumMismatch {
                        file: path.display().to_string(),
                        expected: expected.to_string(),
                        actual,
                    });
                }
            }
        }
    }
    tracing::debug!("Index checksums verified");
    Ok(())
}

fn load_graph<D: Distance<f32> + Default + Send + Sync>(
    dir: &Path,
) -> Result<(LoadedGraph<D>, usize), HnswError> {
    // hnsw_rs returns Hnsw<'a> borrowing from HnswIo. LoadedGraph keeps the
    // HnswIo allocation alive behind a raw pointer and enforces drop order.
    let hnsw_io = Box::new(HnswIo::new(dir, BASENAME));
    let io_ptr = Box::into_raw(hnsw_io);

    // SAFETY: io_ptr is valid, created from Box::into_raw above
    let hnsw: Hnsw<'_, f32, D> = unsafe { &mut *io_ptr }.load_hnsw().map_err(|e| {
        // SAFETY: reclaim the allocation on the error path
        unsafe {
            drop(Box::from_raw(io_ptr));
        }
        HnswError::Internal(format!("Failed to load HNSW: {}", e))
    })?;

    // SAFETY: the transmute is sound because io_ptr lives as long as the
    // LoadedGraph, whose Drop releases the Hnsw before freeing the HnswIo,
    // and the Hnsw only reads data owned by the HnswIo.
    let hnsw: Hnsw<'static, f32, D> = unsafe { std::mem::transmute(hnsw) };
    let count = hnsw.get_nb_point();

    Ok((
        LoadedGraph {
            io_ptr,
            hnsw: ManuallyDrop::new(hnsw),
        },
        count,
    ))
}

impl HnswIndex {
    /// Serialize the graph into `dir`.
    ///
    /// Writes the hnsw_rs dump, the parameter/tombstone sidecar, and the
    /// checksum manifest last, so a partial write always fails
    /// verification on load.
    pub fn serialize(&self, dir: &Path) -> Result<(), HnswError> {
        std::fs::create_dir_all(dir)?;
        tracing::info!(dir = %dir.display(), count = self.count(), "Serializing HNSW index");

        with_graph!(&self.graph, g => {
            g.file_dump(dir, BASENAME)
                .map(|_| ())
                .map_err(|e| HnswError::Internal(format!("Failed to dump HNSW: {}", e)))?
        });

        let meta = GraphMeta {
            dimensions: self.dimensions(),
            space: self.space(),
            m: self.m,
            ef_construction: self.ef_construction,
            capacity: self.capacity(),
            count: self.count(),
            deleted: self.deleted_labels(),
        };
        let meta_json = serde_json::to_string_pretty(&meta)
            .map_err(|e| HnswError::Internal(format!("Failed to serialize graph meta: {}", e)))?;
        std::fs::write(dir.join(format!("{}.meta.json", BASENAME)), &meta_json)?;

        let mut checksums = Vec::new();
        for ext in INDEX_EXTENSIONS {
            let path = dir.join(format!("{}.{}", BASENAME, ext));
            if path.exists() {
                let file = std::fs::File::open(&path)?;
                let mut hasher = blake3::Hasher::new();
                std::io::copy(&mut std::io::BufReader::new(file), &mut hasher)?;
                checksums.push(format!("{}:{}", ext, hasher.finalize().to_hex()));
            }
        }
        std::fs::write(dir.join(format!("{}.checksum", BASENAME)), checksums.join("\n"))?;

        Ok(())
    }

    /// Deserialize a graph from `dir`.
    ///
    /// Verifies checksums first, then checks the persisted dimensionality
    /// and space against the configuration. The resulting index is
    /// read-only; writes require a rebuild into an owned graph.
    pub fn deserialize(dir: &Path, config: &VectorConfig) -> Result<Self, HnswError> {
        let graph_path = dir.join(format!("{}.hnsw.graph", BASENAME));
        let data_path = dir.join(format!("{}.hnsw.data", BASENAME));
        let meta_path = dir.join(format!("{}.meta.json", BASENAME));
        if !graph_path.exists() || !data_path.exists() || !meta_path.exists() {
            return Err(HnswError::NotFound(dir.display().to_string()));
        }

        verify_checksums(dir)?;

        let meta: GraphMeta = serde_json::from_str(&std::fs::read_to_string(&meta_path)?)
            .map_err(|e| HnswError::Internal(format!("Failed to parse graph meta: {}", e)))?;

        if meta.dimensions != config.dimensions {
            return Err(HnswError::MetadataMismatch {
                field: "dimensions",
                persisted: meta.dimensions.to_string(),
                configured: config.dimensions.to_string(),
            });
        }
        if meta.space != config.space {
            return Err(HnswError::MetadataMismatch {
                field: "space",
                persisted: meta.space.to_string(),
                configured: config.space.to_string(),
            });
        }

        let (graph, loaded_count) = match config.space {
            Space::InnerProduct => {
                let (g, n) = load_graph::<DistDot>(dir)?;
                (SpaceGraph::InnerProduct(GraphState::Loaded(g)), n)
            }
            Space::Cosine => {
                let (g, n) = load_graph::<DistCosine>(dir)?;
                (SpaceGraph::Cosine(GraphState::Loaded(g)), n)
            }
            Space::L2 => {
                let (g, n) = load_graph::<DistL2>(dir)?;
                (SpaceGraph::L2(GraphState::Loaded(g)), n)
            }
        };

        if loaded_count != meta.count {
            return Err(HnswError::Internal(format!(
                "Point count mismatch: graph has {} points but meta records {}",
                loaded_count, meta.count
            )));
        }

        let mut index = HnswIndex {
            graph,
            dim: config.dimensions,
            space: config.space,
            m: meta.m,
            ef_construction: meta.ef_construction,
            ef_search: std::sync::atomic::AtomicUsize::new(config.ef_search),
            capacity: meta.capacity.max(loaded_count),
            count: loaded_count,
            deleted: std::collections::HashSet::new(),
        };
        index.restore_deleted(&meta.deleted);

        tracing::info!(
            dir = %dir.display(),
            count = loaded_count,
            deleted = meta.deleted.len(),
            "HNSW index loaded (read-only until rebuilt)"
        );
        Ok(index)
    }

    /// Whether a serialized index exists in `dir`.
    pub fn exists(dir: &Path) -> bool {
        dir.join(format!("{}.hnsw.graph", BASENAME)).exists()
            && dir.join(format!("{}.hnsw.data", BASENAME)).exists()
            && dir.join(format!("{}.meta.json", BASENAME)).exists()
    }
}

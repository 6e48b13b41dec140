//! # fathom - Embedded Hybrid Retrieval Engine
//!
//! Unifies three index layers behind a single query planner:
//!
//! - **Vector**: an HNSW graph over embeddings with a durable sidecar
//!   store, tombstone-based deletion, and crash-safe generation
//!   publishing
//! - **Full-text**: ranked BM25 search with phrase and mixed-script
//!   (CJK) queries and snippet extraction, backed by SQLite FTS5
//! - **Structural**: an inverted map over extracted document fields for
//!   equality filtering
//!
//! Writes fan out to all three layers; reads run through one of three
//! hybrid strategies (filter-first, semantic-first, parallel late
//! fusion). The embedding model and the outer document store are
//! capability interfaces wired by the caller.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::collections::BTreeMap;
//! use fathom::{
//!     Document, EngineConfig, IndexCoordinator, SearchRequest, SemanticQuery, Space,
//!     VectorConfig,
//! };
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = EngineConfig::new(VectorConfig::new(384, Space::Cosine));
//! let engine = IndexCoordinator::new(".fathom", config);
//! engine.initialize()?;
//!
//! let doc = Document::new("approximate nearest neighbor search")
//!     .with_attribute("data.category", "tech");
//! engine.put("articles", "a1", doc, None)?;
//!
//! let mut structural = BTreeMap::new();
//! structural.insert("collection".to_string(), "articles".to_string());
//! let response = engine.search(&SearchRequest {
//!     structural,
//!     semantic: Some(SemanticQuery {
//!         query: "nearest neighbor".to_string(),
//!         use_embedding: false,
//!         threshold: None,
//!     }),
//!     ..Default::default()
//! })?;
//! println!("{} results", response.total);
//! engine.close()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordinator;
pub mod db;
pub mod docstore;
pub mod embedder;
pub mod fulltext;
pub mod generation;
pub mod hnsw;
pub mod planner;
pub mod sidecar;
pub mod structural;
pub mod vector;

// Internal plumbing - not part of the public API
pub(crate) mod text;

pub use config::{EngineConfig, FtsConfig, PlannerConfig, Space, VectorConfig};
pub use db::Database;
pub use coordinator::{
    BulkReport, Document, EngineStats, IndexCoordinator, IndexError, LayerSet, PutOptions,
    PutReport, WriteOp,
};
pub use docstore::{DocOp, DocStoreError, DocumentStore, MemoryDocumentStore};
pub use embedder::{Embedder, EmbedderError};
pub use fulltext::{AdvancedSearchOptions, FtsSearchOptions, FullTextIndex, TextMatch};
pub use generation::{GenerationError, GenerationManager, WriteLock};
pub use hnsw::{HnswError, HnswIndex};
pub use planner::{
    Citation, FusionWeights, HybridStrategy, QueryPlanner, RankedResult, SearchMetrics,
    SearchRequest, SearchResponse, SemanticQuery,
};
pub use sidecar::{SidecarRecord, SidecarStats, SidecarStore};
pub use structural::StructuralIndex;
pub use vector::{SearchHit, SearchOptions, VectorError, VectorLayer, VectorStats};

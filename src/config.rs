//! Engine configuration.
//!
//! Plain builder-style structs wired at construction time. Loading these
//! from files or the environment is the caller's concern; the engine only
//! validates and consumes them.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Distance space for the vector index.
///
/// Controls both the HNSW distance function and the normalization policy:
/// inner-product and cosine vectors are unit-normalized on insert and query
/// when their norm drifts more than 1e-2 from 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Space {
    InnerProduct,
    Cosine,
    L2,
}

impl std::fmt::Display for Space {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Space::InnerProduct => write!(f, "inner_product"),
            Space::Cosine => write!(f, "cosine"),
            Space::L2 => write!(f, "l2"),
        }
    }
}

impl std::str::FromStr for Space {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inner_product" | "ip" => Ok(Space::InnerProduct),
            "cosine" => Ok(Space::Cosine),
            "l2" => Ok(Space::L2),
            _ => anyhow::bail!("Unknown space '{}'. Valid: inner_product, cosine, l2", s),
        }
    }
}

impl Space {
    /// Whether vectors in this space are unit-normalized before indexing.
    pub fn normalizes(&self) -> bool {
        matches!(self, Space::InnerProduct | Space::Cosine)
    }
}

// HNSW tuning parameters
//
// Defaults sized for mid-scale document collections (10k-100k vectors):
// - M=16: balanced connectivity for mixed-length content
// - ef_construction=200: thorough graph construction (one-time cost)
// - ef_search=100: good accuracy/latency tradeoff for interactive queries
//
// For other workloads:
// - Small collections (<5k): M=12, ef_construction=100, ef_search=50
// - Large collections (>100k): M=32, ef_construction=400, ef_search=200
const DEFAULT_M: usize = 16;
const DEFAULT_EF_CONSTRUCTION: usize = 200;
const DEFAULT_EF_SEARCH: usize = 100;
const DEFAULT_MAX_ELEMENTS: usize = 10_000;

/// Vector layer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorConfig {
    /// Embedding dimensionality. Every stored and queried vector must match.
    pub dimensions: usize,
    /// Distance space.
    pub space: Space,
    /// HNSW M parameter (connections per node).
    pub m: usize,
    /// Construction-time search width.
    pub ef_construction: usize,
    /// Query-time search width (adjustable at runtime via `set_ef`).
    pub ef_search: usize,
    /// Initial graph capacity. Doubled automatically when occupancy
    /// reaches 80%.
    pub max_elements: usize,
    /// Filename stem for index artifacts (`<stem>-<ts>-<pid>-<rnd>.idx`,
    /// `<stem>.lock`, `<stem>.meta.json`).
    pub stem: String,
}

impl VectorConfig {
    /// Create a configuration for the given dimensionality and space with
    /// default HNSW tuning.
    pub fn new(dimensions: usize, space: Space) -> Self {
        Self {
            dimensions,
            space,
            m: DEFAULT_M,
            ef_construction: DEFAULT_EF_CONSTRUCTION,
            ef_search: DEFAULT_EF_SEARCH,
            max_elements: DEFAULT_MAX_ELEMENTS,
            stem: "vectors".to_string(),
        }
    }

    /// Override the initial graph capacity.
    pub fn with_max_elements(mut self, max_elements: usize) -> Self {
        self.max_elements = max_elements;
        self
    }

    /// Override the artifact filename stem.
    pub fn with_stem(mut self, stem: impl Into<String>) -> Self {
        self.stem = stem.into();
        self
    }
}

/// Full-text index configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FtsConfig {
    /// Segment CJK codepoint runs into single-character tokens before
    /// indexing and querying. Without this, CJK queries match nothing
    /// because the unicode61 tokenizer treats a run as one token.
    pub cjk: bool,
    /// Approximate snippet window size in tokens.
    pub snippet_tokens: u32,
}

impl Default for FtsConfig {
    fn default() -> Self {
        Self {
            cjk: false,
            snippet_tokens: 30,
        }
    }
}

/// Query planner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Late-fusion weight for the structural result list.
    pub structural_weight: f32,
    /// Late-fusion weight for the full-text result list.
    pub fulltext_weight: f32,
    /// Late-fusion weight for the semantic result list.
    pub semantic_weight: f32,
    /// Minimum candidate count for semantic-first retrieval
    /// (`k = max(limit, candidate_floor)`).
    pub candidate_floor: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            structural_weight: 0.3,
            fulltext_weight: 0.3,
            semantic_weight: 0.4,
            candidate_floor: 100,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub vector: VectorConfig,
    pub fulltext: FtsConfig,
    pub planner: PlannerConfig,
    /// When set, a background task saves the vector layer on this interval
    /// while it has unsaved changes.
    pub auto_save: Option<Duration>,
}

impl EngineConfig {
    pub fn new(vector: VectorConfig) -> Self {
        Self {
            vector,
            fulltext: FtsConfig::default(),
            planner: PlannerConfig::default(),
            auto_save: None,
        }
    }

    pub fn with_cjk(mut self, enabled: bool) -> Self {
        self.fulltext.cjk = enabled;
        self
    }

    pub fn with_auto_save(mut self, interval: Duration) -> Self {
        self.auto_save = Some(interval);
        self
    }
}

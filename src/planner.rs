//! Hybrid query planner.
//!
//! Executes a [`SearchRequest`] through one of three interchangeable
//! strategies:
//!
//! - **filter-first** (default): structural candidates narrowed by lexical
//!   match or reranked by embedding similarity
//! - **semantic-first**: vector recall hydrated to documents, then
//!   filtered structurally
//! - **parallel**: all three indices queried concurrently, ranked lists
//!   combined by weighted late fusion
//!
//! Semantic requests degrade gracefully: when no vector layer or embedder
//! is wired, the planner logs the downgrade, flips the request to lexical,
//! and retries once via filter-first. Every result carries a citation and,
//! when the external document store cooperates, the full document.

use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lru::LruCache;
use serde_json::Value;
use thiserror::Error;

use crate::config::PlannerConfig;
use crate::docstore::DocumentStore;
use crate::embedder::{cosine_similarity, Embedder, EmbedderError};
use crate::fulltext::{FtsError, FtsSearchOptions, FullTextIndex};
use crate::structural::{StructuralError, StructuralIndex};
use crate::vector::{SearchOptions, VectorError, VectorLayer};

/// Query embeddings cached per planner (LRU, bounded).
const QUERY_CACHE_SIZE: usize = 100;

#[derive(Error, Debug)]
pub enum PlannerError {
    #[error("Full-text error: {0}")]
    Fts(#[from] FtsError),
    #[error("Structural error: {0}")]
    Structural(#[from] StructuralError),
    #[error("Vector error: {0}")]
    Vector(#[from] VectorError),
    #[error("Embedding error: {0}")]
    Embedder(#[from] EmbedderError),
}

/// Hybrid execution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HybridStrategy {
    #[default]
    FilterFirst,
    SemanticFirst,
    Parallel,
}

impl HybridStrategy {
    fn name(&self) -> &'static str {
        match self {
            HybridStrategy::FilterFirst => "filter-first",
            HybridStrategy::SemanticFirst => "semantic-first",
            HybridStrategy::Parallel => "parallel",
        }
    }
}

/// Semantic half of a request.
#[derive(Debug, Clone)]
pub struct SemanticQuery {
    pub query: String,
    /// Rerank by embedding similarity (requires a vector layer and an
    /// embedder) instead of lexical matching.
    pub use_embedding: bool,
    /// Drop results scoring below this value.
    pub threshold: Option<f32>,
}

/// Per-source weights for the parallel strategy.
#[derive(Debug, Clone, Copy)]
pub struct FusionWeights {
    pub structural: f32,
    pub fulltext: f32,
    pub semantic: f32,
}

impl FusionWeights {
    fn from_config(config: &PlannerConfig) -> Self {
        Self {
            structural: config.structural_weight,
            fulltext: config.fulltext_weight,
            semantic: config.semantic_weight,
        }
    }
}

/// A hybrid search request.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    /// Equality predicates over extracted fields (ANDed).
    pub structural: BTreeMap<String, String>,
    pub semantic: Option<SemanticQuery>,
    pub strategy: HybridStrategy,
    pub limit: usize,
    /// Override the configured fusion weights for this request.
    pub weights: Option<FusionWeights>,
    /// Soft deadline; once elapsed, partial results return with
    /// `metrics.timed_out` set.
    pub deadline: Option<Duration>,
}

impl Default for SearchRequest {
    fn default() -> Self {
        Self {
            structural: BTreeMap::new(),
            semantic: None,
            strategy: HybridStrategy::default(),
            limit: 10,
            weights: None,
            deadline: None,
        }
    }
}

/// Provenance attached to every result.
#[derive(Debug, Clone)]
pub struct Citation {
    /// Which index layer(s) produced the result.
    pub source: String,
    /// Engine-wide document key (`collection:id`).
    pub document_id: String,
    /// RFC 3339 time the result was produced.
    pub timestamp: String,
    pub collection: Option<String>,
    /// blake3 of the hydrated document, when available.
    pub checksum: Option<String>,
}

/// One ranked result.
#[derive(Debug, Clone)]
pub struct RankedResult {
    /// Engine-wide document key (`collection:id`).
    pub doc_id: String,
    pub score: f32,
    pub snippet: Option<String>,
    /// Full document from the external store, when hydration succeeded.
    pub document: Option<Value>,
    /// Index layers that contributed (parallel strategy).
    pub sources: Vec<String>,
    pub citation: Citation,
}

/// Execution metrics.
#[derive(Debug, Clone)]
pub struct SearchMetrics {
    pub strategy: &'static str,
    pub elapsed_ms: u64,
    pub timed_out: bool,
    /// Semantic was requested but unavailable; the planner fell back to
    /// lexical filter-first.
    pub downgraded: bool,
}

/// Response envelope.
#[derive(Debug)]
pub struct SearchResponse {
    pub results: Vec<RankedResult>,
    pub total: usize,
    pub metrics: SearchMetrics,
}

/// Intermediate scored entry before enrichment.
struct Scored {
    doc_id: String,
    score: f32,
    snippet: Option<String>,
    sources: Vec<String>,
}

pub struct QueryPlanner {
    fulltext: Arc<FullTextIndex>,
    structural: Arc<StructuralIndex>,
    vector: Option<Arc<VectorLayer>>,
    embedder: Option<Arc<dyn Embedder>>,
    docstore: Option<Arc<dyn DocumentStore>>,
    config: PlannerConfig,
    query_cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl QueryPlanner {
    pub fn new(
        fulltext: Arc<FullTextIndex>,
        structural: Arc<StructuralIndex>,
        vector: Option<Arc<VectorLayer>>,
        embedder: Option<Arc<dyn Embedder>>,
        docstore: Option<Arc<dyn DocumentStore>>,
        config: PlannerConfig,
    ) -> Self {
        let cache_size = NonZeroUsize::new(QUERY_CACHE_SIZE).expect("nonzero cache size");
        Self {
            fulltext,
            structural,
            vector,
            embedder,
            docstore,
            config,
            query_cache: Mutex::new(LruCache::new(cache_size)),
        }
    }

    /// Execute a request.
    pub fn search(&self, request: &SearchRequest) -> Result<SearchResponse, PlannerError> {
        let _span = tracing::info_span!(
            "planner_search",
            strategy = request.strategy.name(),
            limit = request.limit
        )
        .entered();
        let started = Instant::now();

        // Fallback rule: semantic requested without the machinery for it
        let mut request = request.clone();
        let mut downgraded = false;
        if let Some(ref mut semantic) = request.semantic {
            if semantic.use_embedding && (self.vector.is_none() || self.embedder.is_none()) {
                tracing::warn!(
                    "Semantic search requested but vector layer or embedder unavailable; \
                     downgrading to lexical filter-first"
                );
                semantic.use_embedding = false;
                request.strategy = HybridStrategy::FilterFirst;
                downgraded = true;
            }
        }

        let scored = match request.strategy {
            HybridStrategy::FilterFirst => self.filter_first(&request)?,
            HybridStrategy::SemanticFirst => self.semantic_first(&request)?,
            HybridStrategy::Parallel => self.parallel(&request, started)?,
        };

        let results = self.enrich(scored, request.strategy.name());
        let timed_out = request
            .deadline
            .is_some_and(|deadline| started.elapsed() > deadline);
        let total = results.len();
        Ok(SearchResponse {
            results,
            total,
            metrics: SearchMetrics {
                strategy: request.strategy.name(),
                elapsed_ms: started.elapsed().as_millis() as u64,
                timed_out,
                downgraded,
            },
        })
    }

    // ===== filter-first =====

    fn filter_first(&self, request: &SearchRequest) -> Result<Vec<Scored>, PlannerError> {
        let lexical_only = request
            .semantic
            .as_ref()
            .is_some_and(|s| !s.use_embedding && !s.query.is_empty());

        // No structural predicates: lexical requests fall through to the
        // full-text index directly, anything else has no candidate set
        if request.structural.is_empty() {
            if lexical_only {
                return self.lexical_path(request, None);
            }
            return Ok(Vec::new());
        }

        let candidates = self.structural.query(&request.structural)?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        match request.semantic {
            Some(ref semantic) if semantic.use_embedding => {
                self.rerank_by_embedding(request, semantic, candidates)
            }
            Some(ref semantic) if !semantic.query.is_empty() => {
                let candidate_set: std::collections::HashSet<&String> =
                    candidates.iter().collect();
                self.lexical_path(request, Some(&candidate_set))
            }
            _ => {
                // Pure structural result: equality matches all score 1.0
                let threshold = request.semantic.as_ref().and_then(|s| s.threshold);
                Ok(candidates
                    .into_iter()
                    .filter(|_| threshold.map_or(true, |t| 1.0 >= t))
                    .take(request.limit)
                    .map(|doc_id| Scored {
                        doc_id,
                        score: 1.0,
                        snippet: None,
                        sources: vec!["structural".to_string()],
                    })
                    .collect())
            }
        }
    }

    /// Full-text match, optionally restricted to a structural candidate
    /// set.
    fn lexical_path(
        &self,
        request: &SearchRequest,
        candidates: Option<&std::collections::HashSet<&String>>,
    ) -> Result<Vec<Scored>, PlannerError> {
        let semantic = request
            .semantic
            .as_ref()
            .expect("lexical path requires a semantic query");
        // Over-fetch so intersection can still fill the limit
        let fetch = if candidates.is_some() {
            (request.limit * 3).max(self.config.candidate_floor)
        } else {
            request.limit
        };
        let matches = self.fulltext.search(
            &semantic.query,
            &FtsSearchOptions {
                limit: fetch,
                collection: None,
            },
        )?;

        let mut sources = vec!["fulltext".to_string()];
        if candidates.is_some() {
            sources.insert(0, "structural".to_string());
        }

        Ok(matches
            .into_iter()
            .map(|m| {
                let doc_id = compose_key(&m.collection, &m.doc_id);
                (doc_id, m)
            })
            .filter(|(doc_id, _)| candidates.map_or(true, |set| set.contains(doc_id)))
            .filter(|(_, m)| semantic.threshold.map_or(true, |t| m.score >= t))
            .take(request.limit)
            .map(|(doc_id, m)| Scored {
                doc_id,
                score: m.score,
                snippet: Some(m.snippet),
                sources: sources.clone(),
            })
            .collect())
    }

    /// Rerank structural candidates by cosine similarity against each
    /// document's persisted vector. Documents without a vector score 0.
    fn rerank_by_embedding(
        &self,
        request: &SearchRequest,
        semantic: &SemanticQuery,
        candidates: Vec<String>,
    ) -> Result<Vec<Scored>, PlannerError> {
        let vector = self
            .vector
            .as_ref()
            .expect("embedding rerank requires a vector layer");
        let query_vec = self.query_embedding(&semantic.query)?;

        let ids: Vec<&str> = candidates.iter().map(String::as_str).collect();
        let stored = vector.batch_get(&ids)?;

        let mut scored: Vec<Scored> = candidates
            .into_iter()
            .map(|doc_id| {
                let score = stored
                    .get(&doc_id)
                    .and_then(|(v, _)| cosine_similarity(&query_vec, v))
                    .unwrap_or(0.0);
                Scored {
                    doc_id,
                    score,
                    snippet: None,
                    sources: vec!["structural".to_string(), "semantic".to_string()],
                }
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.doc_id.cmp(&b.doc_id))
        });
        if let Some(threshold) = semantic.threshold {
            scored.retain(|s| s.score >= threshold);
        }
        scored.truncate(request.limit);
        Ok(scored)
    }

    // ===== semantic-first =====

    fn semantic_first(&self, request: &SearchRequest) -> Result<Vec<Scored>, PlannerError> {
        let (Some(vector), Some(_)) = (self.vector.as_ref(), self.embedder.as_ref()) else {
            // Requires the vector machinery; fall back to filter-first
            tracing::warn!("semantic-first without vector layer, falling back to filter-first");
            return self.filter_first(request);
        };
        let Some(ref semantic) = request.semantic else {
            return self.filter_first(request);
        };

        let query_vec = self.query_embedding(&semantic.query)?;
        let k = request.limit.max(self.config.candidate_floor);
        let hits = vector.search(
            &query_vec,
            k,
            &SearchOptions {
                min_score: semantic.threshold,
                ..Default::default()
            },
        )?;

        // Structural predicates act as a post-filter
        let allowed: Option<std::collections::HashSet<String>> = if request.structural.is_empty() {
            None
        } else {
            Some(self.structural.query(&request.structural)?.into_iter().collect())
        };

        Ok(hits
            .into_iter()
            .filter(|hit| allowed.as_ref().map_or(true, |set| set.contains(&hit.doc_id)))
            .take(request.limit)
            .map(|hit| Scored {
                doc_id: hit.doc_id,
                score: hit.score,
                snippet: None,
                sources: vec!["semantic".to_string()],
            })
            .collect())
    }

    // ===== parallel (late fusion) =====

    fn parallel(&self, request: &SearchRequest, started: Instant) -> Result<Vec<Scored>, PlannerError> {
        let weights = request
            .weights
            .unwrap_or_else(|| FusionWeights::from_config(&self.config));

        let semantic_query = request.semantic.as_ref().filter(|s| !s.query.is_empty());

        // Dispatch the three sub-queries concurrently; each list is
        // independent and may observe a slightly different snapshot.
        let (structural_list, lexical_list, semantic_list) = std::thread::scope(|scope| {
            let structural_task = scope.spawn(|| -> Result<Vec<String>, PlannerError> {
                if request.structural.is_empty() {
                    return Ok(Vec::new());
                }
                Ok(self.structural.query(&request.structural)?)
            });
            let lexical_task = scope.spawn(|| -> Result<Vec<(String, String, f32)>, PlannerError> {
                let Some(semantic) = semantic_query else {
                    return Ok(Vec::new());
                };
                let matches = self.fulltext.search(
                    &semantic.query,
                    &FtsSearchOptions {
                        limit: request.limit.max(self.config.candidate_floor),
                        collection: None,
                    },
                )?;
                Ok(matches
                    .into_iter()
                    .map(|m| (compose_key(&m.collection, &m.doc_id), m.snippet, m.score))
                    .collect())
            });
            let semantic_task = scope.spawn(|| -> Result<Vec<(String, f32)>, PlannerError> {
                let (Some(vector), Some(semantic)) = (self.vector.as_ref(), semantic_query)
                else {
                    return Ok(Vec::new());
                };
                if !semantic.use_embedding || self.embedder.is_none() {
                    return Ok(Vec::new());
                }
                let query_vec = self.query_embedding(&semantic.query)?;
                let hits = vector.search(
                    &query_vec,
                    request.limit.max(self.config.candidate_floor),
                    &SearchOptions::default(),
                )?;
                Ok(hits.into_iter().map(|h| (h.doc_id, h.score)).collect())
            });

            (
                structural_task.join().expect("structural task panicked"),
                lexical_task.join().expect("lexical task panicked"),
                semantic_task.join().expect("semantic task panicked"),
            )
        });
        let structural_list = structural_list?;
        let lexical_list = lexical_list?;
        let semantic_list = semantic_list?;

        if let Some(deadline) = request.deadline {
            if started.elapsed() > deadline {
                tracing::warn!("Deadline elapsed during parallel dispatch, returning partial fusion");
            }
        }

        // Rank-based contributions: doc at rank i in list L adds
        // w · (1 − i/|L|)
        struct Fused {
            score: f32,
            snippet: Option<String>,
            sources: Vec<String>,
        }
        let mut fused: HashMap<String, Fused> = HashMap::new();
        let mut contribute =
            |doc_id: &str, rank: usize, len: usize, weight: f32, source: &str, snippet: Option<&str>| {
                let contribution = weight * (1.0 - rank as f32 / len as f32);
                let entry = fused.entry(doc_id.to_string()).or_insert_with(|| Fused {
                    score: 0.0,
                    snippet: None,
                    sources: Vec::new(),
                });
                entry.score += contribution;
                if entry.snippet.is_none() {
                    entry.snippet = snippet.map(str::to_string);
                }
                entry.sources.push(source.to_string());
            };

        let structural_len = structural_list.len();
        for (rank, doc_id) in structural_list.iter().enumerate() {
            contribute(doc_id, rank, structural_len, weights.structural, "structural", None);
        }
        let lexical_len = lexical_list.len();
        for (rank, (doc_id, snippet, _)) in lexical_list.iter().enumerate() {
            contribute(
                doc_id,
                rank,
                lexical_len,
                weights.fulltext,
                "fulltext",
                Some(snippet.as_str()),
            );
        }
        let semantic_len = semantic_list.len();
        for (rank, (doc_id, _)) in semantic_list.iter().enumerate() {
            contribute(doc_id, rank, semantic_len, weights.semantic, "semantic", None);
        }

        let mut scored: Vec<Scored> = fused
            .into_iter()
            .map(|(doc_id, f)| Scored {
                doc_id,
                score: f.score,
                snippet: f.snippet,
                sources: f.sources,
            })
            .collect();
        // Ties break by doc_id for deterministic output
        scored.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.doc_id.cmp(&b.doc_id))
        });
        scored.truncate(request.limit);
        Ok(scored)
    }

    // ===== shared =====

    /// Embed a query string through the LRU cache.
    fn query_embedding(&self, text: &str) -> Result<Vec<f32>, PlannerError> {
        if let Some(cached) = self
            .query_cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(text)
        {
            return Ok(cached.clone());
        }
        let embedder = self
            .embedder
            .as_ref()
            .ok_or_else(|| EmbedderError::EmbeddingFailed("no embedder wired".into()))?;
        let vector = embedder.embed(text)?;
        self.query_cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .put(text.to_string(), vector.clone());
        Ok(vector)
    }

    /// Hydrate documents and attach citations. Hydration failures degrade
    /// to fragment-only results; the caller always sees something.
    fn enrich(&self, scored: Vec<Scored>, strategy: &str) -> Vec<RankedResult> {
        let timestamp = chrono::Utc::now().to_rfc3339();
        scored
            .into_iter()
            .map(|s| {
                let document = self.docstore.as_ref().and_then(|store| {
                    store.get(&s.doc_id).unwrap_or_else(|e| {
                        tracing::debug!(doc_id = %s.doc_id, error = %e, "Document hydration failed");
                        None
                    })
                });
                let checksum = document
                    .as_ref()
                    .map(|doc| blake3::hash(doc.to_string().as_bytes()).to_hex().to_string());
                let collection = s.doc_id.split_once(':').map(|(c, _)| c.to_string());
                let source = if s.sources.len() == 1 {
                    s.sources[0].clone()
                } else if s.sources.is_empty() {
                    strategy.to_string()
                } else {
                    s.sources.join("+")
                };
                RankedResult {
                    citation: Citation {
                        source,
                        document_id: s.doc_id.clone(),
                        timestamp: timestamp.clone(),
                        collection,
                        checksum,
                    },
                    doc_id: s.doc_id,
                    score: s.score,
                    snippet: s.snippet,
                    document,
                    sources: s.sources,
                }
            })
            .collect()
    }
}

/// Engine-wide document key.
pub(crate) fn compose_key(collection: &str, id: &str) -> String {
    format!("{}:{}", collection, id)
}

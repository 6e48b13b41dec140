//! Hybrid planner scenarios: filter-first, CJK full-text, parallel
//! fusion.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use fathom::{
    Document, EngineConfig, HybridStrategy, IndexCoordinator, MemoryDocumentStore, SearchRequest,
    SemanticQuery, Space, VectorConfig,
};
use tempfile::TempDir;

use common::KeywordEmbedder;

fn engine_config() -> EngineConfig {
    let mut vector = VectorConfig::new(4, Space::InnerProduct);
    vector.max_elements = 128;
    EngineConfig::new(vector)
}

fn open_engine(dir: &TempDir, cjk: bool) -> IndexCoordinator {
    let engine = IndexCoordinator::new(dir.path(), engine_config().with_cjk(cjk))
        .with_embedder(Arc::new(KeywordEmbedder))
        .with_document_store(Arc::new(MemoryDocumentStore::new()));
    engine.initialize().unwrap();
    engine
}

fn structural(field: &str, value: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    map.insert(field.to_string(), value.to_string());
    map
}

#[test]
fn filter_first_with_fts_returns_only_matching_candidate() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir, false);

    engine
        .put("tech", "d1", Document::new("vector search"), None)
        .unwrap();
    engine
        .put("tech", "d2", Document::new("knowledge base"), None)
        .unwrap();
    engine
        .put("other", "d3", Document::new("vector graph"), None)
        .unwrap();

    let response = engine
        .search(&SearchRequest {
            structural: structural("collection", "tech"),
            semantic: Some(SemanticQuery {
                query: "vector".to_string(),
                use_embedding: false,
                threshold: None,
            }),
            strategy: HybridStrategy::FilterFirst,
            limit: 10,
            ..Default::default()
        })
        .unwrap();

    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].doc_id, "tech:d1");
    assert!(response.results[0].snippet.is_some());

    engine.close().unwrap();
}

#[test]
fn cjk_fulltext_hit_with_preprocessing() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir, true);

    engine
        .put("notes", "x", Document::new("知識管理系統"), None)
        .unwrap();

    let response = engine
        .search(&SearchRequest {
            semantic: Some(SemanticQuery {
                query: "知識管理".to_string(),
                use_embedding: false,
                threshold: None,
            }),
            ..Default::default()
        })
        .unwrap();

    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].doc_id, "notes:x");
    let snippet = response.results[0].snippet.as_deref().unwrap();
    assert!(!snippet.is_empty());

    engine.close().unwrap();
}

#[test]
fn cjk_fulltext_miss_without_preprocessing() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir, false);

    engine
        .put("notes", "x", Document::new("知識管理系統"), None)
        .unwrap();

    let response = engine
        .search(&SearchRequest {
            semantic: Some(SemanticQuery {
                query: "知識管理".to_string(),
                use_embedding: false,
                threshold: None,
            }),
            ..Default::default()
        })
        .unwrap();

    assert!(response.results.is_empty());
    engine.close().unwrap();
}

#[test]
fn parallel_fusion_default_weights_and_order() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir, false);

    // d1: structural match only (collection alpha-docs; unembeddable, no
    // lexical overlap with the query)
    engine
        .put(
            "alpha-docs",
            "d1",
            Document::new("unembeddable structural entry"),
            None,
        )
        .unwrap();
    // d2: lexical match only (contains both query terms, unembeddable)
    engine
        .put(
            "beta-docs",
            "d2",
            Document::new("unembeddable needle probe mention"),
            None,
        )
        .unwrap();
    // d3: semantic match only (embeds onto the query axis, no lexical
    // overlap, different collection than the structural predicate)
    engine
        .put("beta-docs", "d3", Document::new("semantic payload"), None)
        .unwrap();

    let response = engine
        .search(&SearchRequest {
            structural: structural("collection", "alpha-docs"),
            semantic: Some(SemanticQuery {
                query: "needle probe".to_string(),
                use_embedding: true,
                threshold: None,
            }),
            strategy: HybridStrategy::Parallel,
            limit: 10,
            ..Default::default()
        })
        .unwrap();

    // Each doc sits at rank 0 of exactly one list: fused scores are the
    // bare source weights
    assert_eq!(response.results.len(), 3);
    assert_eq!(response.results[0].doc_id, "beta-docs:d3");
    assert!((response.results[0].score - 0.4).abs() < 1e-6);
    assert_eq!(response.results[1].doc_id, "alpha-docs:d1");
    assert!((response.results[1].score - 0.3).abs() < 1e-6);
    assert_eq!(response.results[2].doc_id, "beta-docs:d2");
    assert!((response.results[2].score - 0.3).abs() < 1e-6);

    // Provenance names the contributing source
    assert_eq!(response.results[0].sources, vec!["semantic".to_string()]);
    assert_eq!(response.results[1].sources, vec!["structural".to_string()]);
    assert_eq!(response.results[2].sources, vec!["fulltext".to_string()]);

    // Fusion bound: no score exceeds the weight sum
    for result in &response.results {
        assert!(result.score >= 0.0 && result.score <= 1.0 + 1e-6);
    }

    engine.close().unwrap();
}

#[test]
fn semantic_first_filters_by_structural_predicate() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir, false);

    engine
        .put("tech", "d1", Document::new("alpha article"), None)
        .unwrap();
    engine
        .put("legacy", "d2", Document::new("alpha archive"), None)
        .unwrap();

    let response = engine
        .search(&SearchRequest {
            structural: structural("collection", "tech"),
            semantic: Some(SemanticQuery {
                query: "alpha".to_string(),
                use_embedding: true,
                threshold: None,
            }),
            strategy: HybridStrategy::SemanticFirst,
            limit: 10,
            ..Default::default()
        })
        .unwrap();

    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].doc_id, "tech:d1");

    engine.close().unwrap();
}

#[test]
fn results_hydrate_documents_with_citations() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir, false);

    engine
        .put(
            "tech",
            "d1",
            Document::new("vector search").with_attribute("data.category", "ml"),
            None,
        )
        .unwrap();

    let response = engine
        .search(&SearchRequest {
            structural: structural("data.category", "ml"),
            ..Default::default()
        })
        .unwrap();

    let result = &response.results[0];
    assert_eq!(result.doc_id, "tech:d1");
    let document = result.document.as_ref().expect("hydrated document");
    assert_eq!(document["collection"], "tech");
    assert_eq!(document["data"]["category"], "ml");
    assert_eq!(result.citation.document_id, "tech:d1");
    assert_eq!(result.citation.collection.as_deref(), Some("tech"));
    assert!(result.citation.checksum.is_some());

    engine.close().unwrap();
}

#[test]
fn semantic_downgrade_without_embedder() {
    let dir = TempDir::new().unwrap();
    // No embedder wired at all
    let engine = IndexCoordinator::new(dir.path(), engine_config())
        .with_document_store(Arc::new(MemoryDocumentStore::new()));
    engine.initialize().unwrap();

    engine
        .put("tech", "d1", Document::new("vector search"), None)
        .unwrap();

    let response = engine
        .search(&SearchRequest {
            structural: structural("collection", "tech"),
            semantic: Some(SemanticQuery {
                query: "vector".to_string(),
                use_embedding: true,
                threshold: None,
            }),
            ..Default::default()
        })
        .unwrap();

    assert!(response.metrics.downgraded);
    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].doc_id, "tech:d1");

    engine.close().unwrap();
}

#[test]
fn updates_are_visible_in_search_order() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir, false);

    engine
        .put("tech", "d1", Document::new("first revision wording"), None)
        .unwrap();
    engine
        .put("tech", "d1", Document::new("second revision wording"), None)
        .unwrap();

    let old = engine
        .search(&SearchRequest {
            semantic: Some(SemanticQuery {
                query: "first".to_string(),
                use_embedding: false,
                threshold: None,
            }),
            ..Default::default()
        })
        .unwrap();
    assert!(old.results.is_empty(), "stale revision must not match");

    let new = engine
        .search(&SearchRequest {
            semantic: Some(SemanticQuery {
                query: "second".to_string(),
                use_embedding: false,
                threshold: None,
            }),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(new.results.len(), 1);

    engine.close().unwrap();
}

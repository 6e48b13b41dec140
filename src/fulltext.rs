//! Ranked full-text index over (collection, doc_id) keyed documents.
//!
//! Backed by SQLite FTS5 through the shared database handle: a base table
//! holds the original content and metadata, a virtual table holds the
//! tokenized content, and the two are kept in step row-for-row inside each
//! transaction. Ranking is FTS5's BM25; the raw index orders ascending
//! (best first) and the API edge exposes the negated value as a
//! descending score.
//!
//! CJK support is preprocessing, not tokenizer configuration: with
//! `FtsConfig::cjk` set, runs of CJK codepoints are segmented into
//! single-character tokens on both the index and query sides, which the
//! stock unicode61 tokenizer then handles fine.

use serde_json::Value;
use sqlx::Row;
use std::sync::Arc;
use thiserror::Error;

use crate::config::FtsConfig;
use crate::db::{Database, DbError};
use crate::text::{build_match_query, is_wildcard_only, segment_cjk};

#[derive(Error, Debug)]
pub enum FtsError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Database error: {0}")]
    Db(#[from] DbError),
}

/// A ranked full-text match.
#[derive(Debug, Clone)]
pub struct TextMatch {
    pub doc_id: String,
    pub collection: String,
    /// Highlighted snippet (or content prefix for unranked listings).
    pub snippet: String,
    /// Negated BM25 rank: higher is better, 0.0 for unranked listings.
    pub score: f32,
    pub metadata: Option<Value>,
}

/// Options for `search`.
#[derive(Debug, Clone, Default)]
pub struct FtsSearchOptions {
    pub limit: usize,
    /// Restrict matches to one collection.
    pub collection: Option<String>,
}

/// Options for `advanced_search`: configurable snippet shape plus optional
/// score/highlight behavior.
#[derive(Debug, Clone)]
pub struct AdvancedSearchOptions {
    pub limit: usize,
    pub collection: Option<String>,
    /// Opening tag wrapped around matched terms.
    pub open_tag: String,
    /// Closing tag wrapped around matched terms.
    pub close_tag: String,
    /// Snippet window size in tokens.
    pub snippet_tokens: u32,
    /// Highlight the full content instead of extracting a window.
    pub highlight: bool,
    /// Include the BM25-derived score (otherwise 0.0).
    pub with_score: bool,
}

impl Default for AdvancedSearchOptions {
    fn default() -> Self {
        Self {
            limit: 10,
            collection: None,
            open_tag: "<b>".to_string(),
            close_tag: "</b>".to_string(),
            snippet_tokens: 30,
            highlight: false,
            with_score: true,
        }
    }
}

/// Index statistics.
#[derive(Debug, Clone)]
pub struct FtsStats {
    pub total_entries: u64,
    /// Entry count per collection, alphabetical.
    pub collections: Vec<(String, u64)>,
}

/// Ranked text index keyed on `(collection, doc_id)`.
pub struct FullTextIndex {
    db: Arc<Database>,
    config: FtsConfig,
}

impl FullTextIndex {
    /// Open the index over a shared database handle, creating the schema
    /// if missing.
    pub fn open(db: Arc<Database>, config: FtsConfig) -> Result<Self, FtsError> {
        let index = Self { db, config };
        index.db.block_on(async {
            sqlx::query(
                "CREATE TABLE IF NOT EXISTS fulltext_entries (
                    doc_id TEXT NOT NULL,
                    collection TEXT NOT NULL,
                    content TEXT NOT NULL,
                    metadata BLOB,
                    UNIQUE (collection, doc_id)
                )",
            )
            .execute(&index.db.pool)
            .await?;
            sqlx::query(
                "CREATE VIRTUAL TABLE IF NOT EXISTS fulltext_fts USING fts5(
                    doc_id UNINDEXED,
                    collection UNINDEXED,
                    content,
                    tokenize = 'unicode61'
                )",
            )
            .execute(&index.db.pool)
            .await?;
            Ok::<_, FtsError>(())
        })?;
        tracing::debug!(cjk = index.config.cjk, "Full-text schema ready");
        Ok(index)
    }

    /// Split a composite `"collection:id"` key so one logical document
    /// never produces two ranked rows.
    fn decompose_key<'a>(&self, doc_id: &'a str, collection: &str) -> &'a str {
        let prefix_len = collection.len() + 1;
        if doc_id.len() > prefix_len
            && doc_id.starts_with(collection)
            && doc_id.as_bytes()[collection.len()] == b':'
        {
            &doc_id[prefix_len..]
        } else {
            doc_id
        }
    }

    /// Insert or replace the row for `(collection, doc_id)`.
    pub fn add(
        &self,
        doc_id: &str,
        collection: &str,
        content: &str,
        metadata: Option<&Value>,
    ) -> Result<(), FtsError> {
        let doc_id = self.decompose_key(doc_id, collection);
        let indexed_content = if self.config.cjk {
            segment_cjk(content)
        } else {
            content.to_string()
        };
        let metadata_blob = metadata.map(|m| serde_json::to_vec(m).unwrap_or_default());

        self.db.block_on(async {
            let mut tx = self.db.pool.begin().await?;
            sqlx::query("DELETE FROM fulltext_entries WHERE collection = ?1 AND doc_id = ?2")
                .bind(collection)
                .bind(doc_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM fulltext_fts WHERE collection = ?1 AND doc_id = ?2")
                .bind(collection)
                .bind(doc_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                "INSERT INTO fulltext_entries (doc_id, collection, content, metadata)
                 VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(doc_id)
            .bind(collection)
            .bind(content)
            .bind(&metadata_blob)
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                "INSERT INTO fulltext_fts (doc_id, collection, content) VALUES (?1, ?2, ?3)",
            )
            .bind(doc_id)
            .bind(collection)
            .bind(&indexed_content)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok(())
        })
    }

    /// Remove the row for `(collection, doc_id)`. No-op when absent.
    pub fn remove(&self, doc_id: &str, collection: &str) -> Result<(), FtsError> {
        let doc_id = self.decompose_key(doc_id, collection);
        self.db.block_on(async {
            let mut tx = self.db.pool.begin().await?;
            sqlx::query("DELETE FROM fulltext_entries WHERE collection = ?1 AND doc_id = ?2")
                .bind(collection)
                .bind(doc_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM fulltext_fts WHERE collection = ?1 AND doc_id = ?2")
                .bind(collection)
                .bind(doc_id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(())
        })
    }

    /// Ranked search with default snippet shape (`<b>` tags, ~30 tokens).
    pub fn search(&self, query: &str, opts: &FtsSearchOptions) -> Result<Vec<TextMatch>, FtsError> {
        self.advanced_search(
            query,
            &AdvancedSearchOptions {
                limit: opts.limit,
                collection: opts.collection.clone(),
                snippet_tokens: self.config.snippet_tokens,
                ..Default::default()
            },
        )
    }

    /// Ranked search with configurable snippet tags/size and optional
    /// score/highlight fields. Results are ordered by score descending.
    pub fn advanced_search(
        &self,
        query: &str,
        opts: &AdvancedSearchOptions,
    ) -> Result<Vec<TextMatch>, FtsError> {
        let _span = tracing::info_span!("fts_search", limit = opts.limit).entered();

        let match_query = if is_wildcard_only(query) {
            String::new()
        } else {
            build_match_query(query, self.config.cjk)
        };
        // Empty and wildcard-only queries list rows deterministically
        if match_query.is_empty() {
            return self.list_unranked(opts);
        }

        let extractor = if opts.highlight {
            "highlight(fulltext_fts, 2, ?2, ?3)".to_string()
        } else {
            format!(
                "snippet(fulltext_fts, 2, ?2, ?3, '…', {})",
                opts.snippet_tokens.clamp(1, 64)
            )
        };
        let collection_clause = if opts.collection.is_some() {
            " AND f.collection = ?5"
        } else {
            ""
        };
        let sql = format!(
            "SELECT f.doc_id, f.collection, {} AS extract, bm25(fulltext_fts) AS rank, e.metadata
             FROM fulltext_fts f
             JOIN fulltext_entries e ON e.collection = f.collection AND e.doc_id = f.doc_id
             WHERE fulltext_fts MATCH ?1{}
             ORDER BY bm25(fulltext_fts)
             LIMIT ?4",
            extractor, collection_clause
        );

        self.db.block_on(async {
            let mut q = sqlx::query(&sql)
                .bind(&match_query)
                .bind(&opts.open_tag)
                .bind(&opts.close_tag)
                .bind(opts.limit as i64);
            if let Some(ref collection) = opts.collection {
                q = q.bind(collection);
            }
            let rows = q.fetch_all(&self.db.pool).await?;

            Ok(rows
                .into_iter()
                .map(|row| {
                    let rank: f64 = row.get(3);
                    let metadata_blob: Option<Vec<u8>> = row.get(4);
                    TextMatch {
                        doc_id: row.get(0),
                        collection: row.get(1),
                        snippet: row.get(2),
                        // bm25() returns lower-is-better; negate so the
                        // API score ranks descending
                        score: if opts.with_score { -rank as f32 } else { 0.0 },
                        metadata: metadata_blob.and_then(|b| serde_json::from_slice(&b).ok()),
                    }
                })
                .collect())
        })
    }

    /// Deterministic rowid-ordered listing for empty/wildcard queries.
    fn list_unranked(&self, opts: &AdvancedSearchOptions) -> Result<Vec<TextMatch>, FtsError> {
        let collection_clause = if opts.collection.is_some() {
            " WHERE collection = ?2"
        } else {
            ""
        };
        let sql = format!(
            "SELECT doc_id, collection, content, metadata FROM fulltext_entries{}
             ORDER BY rowid ASC LIMIT ?1",
            collection_clause
        );
        self.db.block_on(async {
            let mut q = sqlx::query(&sql).bind(opts.limit as i64);
            if let Some(ref collection) = opts.collection {
                q = q.bind(collection);
            }
            let rows = q.fetch_all(&self.db.pool).await?;
            Ok(rows
                .into_iter()
                .map(|row| {
                    let content: String = row.get(2);
                    let metadata_blob: Option<Vec<u8>> = row.get(3);
                    TextMatch {
                        doc_id: row.get(0),
                        collection: row.get(1),
                        snippet: content,
                        score: 0.0,
                        metadata: metadata_blob.and_then(|b| serde_json::from_slice(&b).ok()),
                    }
                })
                .collect())
        })
    }

    /// Remove every row.
    pub fn clear(&self) -> Result<(), FtsError> {
        self.db.block_on(async {
            let mut tx = self.db.pool.begin().await?;
            sqlx::query("DELETE FROM fulltext_entries")
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM fulltext_fts")
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(())
        })
    }

    /// Remove every row in one collection.
    pub fn clear_collection(&self, collection: &str) -> Result<(), FtsError> {
        self.db.block_on(async {
            let mut tx = self.db.pool.begin().await?;
            sqlx::query("DELETE FROM fulltext_entries WHERE collection = ?1")
                .bind(collection)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM fulltext_fts WHERE collection = ?1")
                .bind(collection)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(())
        })
    }

    pub fn stats(&self) -> Result<FtsStats, FtsError> {
        self.db.block_on(async {
            let total: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM fulltext_entries")
                .fetch_one(&self.db.pool)
                .await?;
            let rows: Vec<(String, i64)> = sqlx::query_as(
                "SELECT collection, COUNT(*) FROM fulltext_entries
                 GROUP BY collection ORDER BY collection",
            )
            .fetch_all(&self.db.pool)
            .await?;
            Ok(FtsStats {
                total_entries: total.0 as u64,
                collections: rows.into_iter().map(|(c, n)| (c, n as u64)).collect(),
            })
        })
    }

    /// Flush pending state. The shared database handle stays open; the
    /// coordinator owns its lifecycle.
    pub fn dispose(&self) {
        self.db.checkpoint();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_index(cjk: bool) -> (FullTextIndex, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let db = Arc::new(Database::open(&dir.path().join("index.db")).unwrap());
        let config = FtsConfig {
            cjk,
            ..Default::default()
        };
        (FullTextIndex::open(db, config).unwrap(), dir)
    }

    fn search_opts(limit: usize) -> FtsSearchOptions {
        FtsSearchOptions {
            limit,
            collection: None,
        }
    }

    #[test]
    fn test_add_and_ranked_search() {
        let (index, _dir) = open_index(false);
        index
            .add("d1", "tech", "vector search with graphs", None)
            .unwrap();
        index.add("d2", "tech", "knowledge base articles", None).unwrap();

        let results = index.search("vector", &search_opts(10)).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].doc_id, "d1");
        assert!(results[0].score > 0.0);
        assert!(results[0].snippet.contains("<b>vector</b>"));
    }

    #[test]
    fn test_replace_on_same_key() {
        let (index, _dir) = open_index(false);
        index.add("d1", "tech", "old content here", None).unwrap();
        index.add("d1", "tech", "fresh words entirely", None).unwrap();

        assert!(index.search("old", &search_opts(10)).unwrap().is_empty());
        let results = index.search("fresh", &search_opts(10)).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(index.stats().unwrap().total_entries, 1);
    }

    #[test]
    fn test_composite_key_decomposed() {
        let (index, _dir) = open_index(false);
        // Caller passes the composite "collection:id" form
        index.add("tech:d1", "tech", "vector search", None).unwrap();
        index.add("d1", "tech", "vector search", None).unwrap();

        // One logical document, one ranked hit
        let results = index.search("vector", &search_opts(10)).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].doc_id, "d1");
    }

    #[test]
    fn test_same_id_different_collections_coexist() {
        let (index, _dir) = open_index(false);
        index.add("d1", "tech", "vector search", None).unwrap();
        index.add("d1", "other", "vector graph", None).unwrap();

        let results = index.search("vector", &search_opts(10)).unwrap();
        assert_eq!(results.len(), 2);

        let scoped = index
            .search(
                "vector",
                &FtsSearchOptions {
                    limit: 10,
                    collection: Some("tech".into()),
                },
            )
            .unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].collection, "tech");
    }

    #[test]
    fn test_empty_query_lists_by_insertion_order() {
        let (index, _dir) = open_index(false);
        index.add("d1", "c", "first document", None).unwrap();
        index.add("d2", "c", "second document", None).unwrap();
        index.add("d3", "c", "third document", None).unwrap();

        let results = index.search("", &search_opts(2)).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].doc_id, "d1");
        assert_eq!(results[1].doc_id, "d2");
        assert!(results.iter().all(|r| r.score == 0.0));

        let wildcard = index.search("*", &search_opts(10)).unwrap();
        assert_eq!(wildcard.len(), 3);
    }

    #[test]
    fn test_hyphenated_query_is_phrase_not_negation() {
        let (index, _dir) = open_index(false);
        index.add("d1", "c", "full-text search engine", None).unwrap();
        index.add("d2", "c", "text only here", None).unwrap();

        // Without phrase quoting, "full-text" would parse as full NOT text
        let results = index.search("full-text", &search_opts(10)).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].doc_id, "d1");
    }

    #[test]
    fn test_cjk_query_matches_with_preprocessing() {
        let (index, _dir) = open_index(true);
        index.add("x", "notes", "知識管理系統", None).unwrap();

        let results = index.search("知識管理", &search_opts(10)).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].doc_id, "x");
        assert!(!results[0].snippet.is_empty());
    }

    #[test]
    fn test_cjk_query_misses_without_preprocessing() {
        let (index, _dir) = open_index(false);
        index.add("x", "notes", "知識管理系統", None).unwrap();

        // The whole run indexes as one token; the substring cannot match
        let results = index.search("知識管理", &search_opts(10)).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_scores_descend() {
        let (index, _dir) = open_index(false);
        index
            .add("heavy", "c", "vector vector vector search", None)
            .unwrap();
        index
            .add("light", "c", "vector appears once in a longer body of text", None)
            .unwrap();

        let results = index.search("vector", &search_opts(10)).unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0].score >= results[1].score);
        assert_eq!(results[0].doc_id, "heavy");
    }

    #[test]
    fn test_advanced_search_custom_tags() {
        let (index, _dir) = open_index(false);
        index.add("d1", "c", "vector search engine", None).unwrap();

        let opts = AdvancedSearchOptions {
            open_tag: "[[".to_string(),
            close_tag: "]]".to_string(),
            ..Default::default()
        };
        let results = index.advanced_search("vector", &opts).unwrap();
        assert!(results[0].snippet.contains("[[vector]]"));
    }

    #[test]
    fn test_advanced_search_highlight_full_content() {
        let (index, _dir) = open_index(false);
        index
            .add("d1", "c", "alpha vector beta vector gamma", None)
            .unwrap();

        let opts = AdvancedSearchOptions {
            highlight: true,
            ..Default::default()
        };
        let results = index.advanced_search("vector", &opts).unwrap();
        let snippet = &results[0].snippet;
        assert!(snippet.starts_with("alpha"));
        assert_eq!(snippet.matches("<b>vector</b>").count(), 2);
    }

    #[test]
    fn test_advanced_search_without_score() {
        let (index, _dir) = open_index(false);
        index.add("d1", "c", "vector search", None).unwrap();

        let opts = AdvancedSearchOptions {
            with_score: false,
            ..Default::default()
        };
        let results = index.advanced_search("vector", &opts).unwrap();
        assert_eq!(results[0].score, 0.0);
    }

    #[test]
    fn test_metadata_passthrough() {
        let (index, _dir) = open_index(false);
        let meta = serde_json::json!({"source": "rss"});
        index.add("d1", "c", "vector search", Some(&meta)).unwrap();

        let results = index.search("vector", &search_opts(10)).unwrap();
        assert_eq!(results[0].metadata, Some(meta));
    }

    #[test]
    fn test_remove_and_clear_collection() {
        let (index, _dir) = open_index(false);
        index.add("d1", "a", "vector one", None).unwrap();
        index.add("d2", "a", "vector two", None).unwrap();
        index.add("d3", "b", "vector three", None).unwrap();

        index.remove("d1", "a").unwrap();
        assert_eq!(index.search("vector", &search_opts(10)).unwrap().len(), 2);

        index.clear_collection("a").unwrap();
        let results = index.search("vector", &search_opts(10)).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].collection, "b");

        index.clear().unwrap();
        assert_eq!(index.stats().unwrap().total_entries, 0);
    }

    #[test]
    fn test_stats_per_collection() {
        let (index, _dir) = open_index(false);
        index.add("d1", "a", "one", None).unwrap();
        index.add("d2", "a", "two", None).unwrap();
        index.add("d3", "b", "three", None).unwrap();

        let stats = index.stats().unwrap();
        assert_eq!(stats.total_entries, 3);
        assert_eq!(
            stats.collections,
            vec![("a".to_string(), 2), ("b".to_string(), 1)]
        );
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("index.db");
        {
            let db = Arc::new(Database::open(&path).unwrap());
            let index = FullTextIndex::open(db.clone(), FtsConfig::default()).unwrap();
            index.add("d1", "c", "durable words", None).unwrap();
            db.close();
        }
        let db = Arc::new(Database::open(&path).unwrap());
        let index = FullTextIndex::open(db, FtsConfig::default()).unwrap();
        let results = index.search("durable", &search_opts(10)).unwrap();
        assert_eq!(results.len(), 1);
    }
}

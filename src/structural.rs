//! Structural index: inverted (field_path, field_value) → doc_id map.
//!
//! Field extraction walks a document tree to a bounded depth, producing
//! one row per (doc, path): top-level scalars, `data.*` and `metadata.*`
//! scalar leaves, and arrays of scalars joined by commas. Nested objects
//! recurse; the input is a tree, so cycles cannot occur. Queries are
//! conjunctions of equality predicates resolved by iterative
//! intersection.

use std::collections::BTreeMap;

use serde_json::Value;
use sqlx::Row;
use std::sync::Arc;
use thiserror::Error;

use crate::db::{Database, DbError};

/// Maximum nesting depth walked during extraction.
const MAX_DEPTH: usize = 3;

#[derive(Error, Debug)]
pub enum StructuralError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Database error: {0}")]
    Db(#[from] DbError),
}

/// One extracted row.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldEntry {
    pub field_path: String,
    pub field_value: String,
    pub field_type: &'static str,
}

/// Walk a document and collect indexable rows.
///
/// Scalars become their display form, booleans `true`/`false`, arrays of
/// scalars a comma-joined list. Objects recurse with a dotted path until
/// the depth bound.
pub fn extract_fields(document: &Value) -> Vec<FieldEntry> {
    let mut entries = Vec::new();
    if let Value::Object(map) = document {
        for (key, value) in map {
            walk(key.clone(), value, 1, &mut entries);
        }
    }
    entries
}

fn walk(path: String, value: &Value, depth: usize, entries: &mut Vec<FieldEntry>) {
    match value {
        Value::String(s) => entries.push(FieldEntry {
            field_path: path,
            field_value: s.clone(),
            field_type: "string",
        }),
        Value::Number(n) => entries.push(FieldEntry {
            field_path: path,
            field_value: n.to_string(),
            field_type: "number",
        }),
        Value::Bool(b) => entries.push(FieldEntry {
            field_path: path,
            field_value: b.to_string(),
            field_type: "boolean",
        }),
        Value::Array(items) => {
            // Simple arrays only: scalar elements joined by commas
            let scalars: Vec<String> = items
                .iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    Value::Bool(b) => Some(b.to_string()),
                    _ => None,
                })
                .collect();
            if !scalars.is_empty() {
                entries.push(FieldEntry {
                    field_path: path,
                    field_value: scalars.join(","),
                    field_type: "array",
                });
            }
        }
        Value::Object(map) => {
            if depth >= MAX_DEPTH {
                return;
            }
            for (key, child) in map {
                walk(format!("{}.{}", path, key), child, depth + 1, entries);
            }
        }
        Value::Null => {}
    }
}

/// Persistent inverted index over extracted fields.
pub struct StructuralIndex {
    db: Arc<Database>,
}

impl StructuralIndex {
    /// Open the index over a shared database handle, creating the schema
    /// if missing.
    pub fn open(db: Arc<Database>) -> Result<Self, StructuralError> {
        let index = Self { db };
        index.db.block_on(async {
            sqlx::query(
                "CREATE TABLE IF NOT EXISTS structural_entries (
                    doc_id TEXT NOT NULL,
                    field_path TEXT NOT NULL,
                    field_value TEXT NOT NULL,
                    field_type TEXT NOT NULL,
                    PRIMARY KEY (doc_id, field_path)
                )",
            )
            .execute(&index.db.pool)
            .await?;
            sqlx::query(
                "CREATE INDEX IF NOT EXISTS idx_structural_lookup
                 ON structural_entries (field_path, field_value)",
            )
            .execute(&index.db.pool)
            .await?;
            Ok::<_, StructuralError>(())
        })?;
        Ok(index)
    }

    /// Index a document, replacing all prior rows for `doc_id` in one
    /// transaction.
    pub fn add(&self, doc_id: &str, document: &Value) -> Result<(), StructuralError> {
        let entries = extract_fields(document);
        self.db.block_on(async {
            let mut tx = self.db.pool.begin().await?;
            sqlx::query("DELETE FROM structural_entries WHERE doc_id = ?1")
                .bind(doc_id)
                .execute(&mut *tx)
                .await?;
            for entry in &entries {
                sqlx::query(
                    "INSERT INTO structural_entries (doc_id, field_path, field_value, field_type)
                     VALUES (?1, ?2, ?3, ?4)",
                )
                .bind(doc_id)
                .bind(&entry.field_path)
                .bind(&entry.field_value)
                .bind(entry.field_type)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
            Ok(())
        })
    }

    /// Drop all rows for a document.
    pub fn remove(&self, doc_id: &str) -> Result<(), StructuralError> {
        self.db.block_on(async {
            sqlx::query("DELETE FROM structural_entries WHERE doc_id = ?1")
                .bind(doc_id)
                .execute(&self.db.pool)
                .await?;
            Ok(())
        })
    }

    /// Documents whose `field` equals `value`, sorted by doc_id.
    ///
    /// Array fields match when the value appears as one of the
    /// comma-joined elements.
    pub fn find_by_index(&self, field: &str, value: &str) -> Result<Vec<String>, StructuralError> {
        self.db.block_on(async {
            let rows: Vec<(String,)> = sqlx::query_as(
                "SELECT DISTINCT doc_id FROM structural_entries
                 WHERE field_path = ?1
                   AND (field_value = ?2
                        OR (field_type = 'array'
                            AND (',' || field_value || ',') LIKE ('%,' || ?2 || ',%')))
                 ORDER BY doc_id",
            )
            .bind(field)
            .bind(value)
            .fetch_all(&self.db.pool)
            .await?;
            Ok(rows.into_iter().map(|(id,)| id).collect())
        })
    }

    /// AND of equality predicates: documents matching every criterion.
    pub fn query(&self, criteria: &BTreeMap<String, String>) -> Result<Vec<String>, StructuralError> {
        let mut result: Option<Vec<String>> = None;
        for (field, value) in criteria {
            let matches = self.find_by_index(field, value)?;
            result = Some(match result {
                None => matches,
                Some(existing) => {
                    // Both lists are sorted; intersect by merge
                    let mut out = Vec::with_capacity(existing.len().min(matches.len()));
                    let mut a = existing.iter().peekable();
                    let mut b = matches.iter().peekable();
                    while let (Some(x), Some(y)) = (a.peek(), b.peek()) {
                        match x.cmp(y) {
                            std::cmp::Ordering::Less => {
                                a.next();
                            }
                            std::cmp::Ordering::Greater => {
                                b.next();
                            }
                            std::cmp::Ordering::Equal => {
                                out.push((*x).clone());
                                a.next();
                                b.next();
                            }
                        }
                    }
                    out
                }
            });
            if matches!(result.as_deref(), Some([])) {
                break;
            }
        }
        Ok(result.unwrap_or_default())
    }

    /// All rows for a document (diagnostics and tests).
    pub fn entries_for(&self, doc_id: &str) -> Result<Vec<FieldEntry>, StructuralError> {
        self.db.block_on(async {
            let rows = sqlx::query(
                "SELECT field_path, field_value, field_type FROM structural_entries
                 WHERE doc_id = ?1 ORDER BY field_path",
            )
            .bind(doc_id)
            .fetch_all(&self.db.pool)
            .await?;
            Ok(rows
                .into_iter()
                .map(|row| {
                    let field_type: String = row.get(2);
                    FieldEntry {
                        field_path: row.get(0),
                        field_value: row.get(1),
                        field_type: match field_type.as_str() {
                            "number" => "number",
                            "boolean" => "boolean",
                            "array" => "array",
                            _ => "string",
                        },
                    }
                })
                .collect())
        })
    }
}

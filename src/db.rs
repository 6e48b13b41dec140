//! Shared SQLite handle (sqlx async with a sync facade).
//!
//! One `Database` owns a connection pool and a tokio runtime; every
//! SQL-backed component (sidecar, full-text, structural) borrows it through
//! an `Arc` and runs its async sqlx operations via `block_on`. This keeps
//! the public API synchronous while using sqlx's pooling and WAL support.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use thiserror::Error;
use tokio::runtime::Runtime;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("Runtime error: {0}")]
    Runtime(String),
}

/// Thread-safe SQLite database handle.
///
/// Uses WAL mode for crash safety and concurrent reads with a single
/// writer. All methods are synchronous; async sqlx work runs on the owned
/// runtime.
pub struct Database {
    pub(crate) pool: SqlitePool,
    rt: Runtime,
    /// Whether close() has already run (skip WAL checkpoint in Drop).
    closed: AtomicBool,
}

impl Database {
    /// Open (creating if missing) a SQLite database at `path`.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let rt = Runtime::new().map_err(|e| DbError::Runtime(e.to_string()))?;

        // Forward slashes for URL compatibility (Windows backslashes don't work)
        let path_str = path.to_string_lossy().replace('\\', "/");
        let db_url = format!("sqlite://{}?mode=rwc", path_str);

        let pool = rt.block_on(async {
            SqlitePoolOptions::new()
                .max_connections(4)
                .idle_timeout(std::time::Duration::from_secs(300))
                .after_connect(|conn, _meta| {
                    Box::pin(async move {
                        // Foreign key enforcement is off by default in SQLite
                        sqlx::query("PRAGMA foreign_keys = ON")
                            .execute(&mut *conn)
                            .await?;
                        // WAL mode: concurrent reads, single writer
                        sqlx::query("PRAGMA journal_mode = WAL")
                            .execute(&mut *conn)
                            .await?;
                        // 5000ms busy timeout before SQLITE_BUSY
                        sqlx::query("PRAGMA busy_timeout = 5000")
                            .execute(&mut *conn)
                            .await?;
                        // NORMAL sync: fsync on WAL checkpoint only (safe with WAL)
                        sqlx::query("PRAGMA synchronous = NORMAL")
                            .execute(&mut *conn)
                            .await?;
                        // Keep temp tables in memory
                        sqlx::query("PRAGMA temp_store = MEMORY")
                            .execute(&mut *conn)
                            .await?;
                        Ok(())
                    })
                })
                .connect(&db_url)
                .await
        })?;

        tracing::info!(path = %path.display(), "Database connected");

        Ok(Self {
            pool,
            rt,
            closed: AtomicBool::new(false),
        })
    }

    /// Run an async sqlx future to completion on the owned runtime.
    ///
    /// Safe to call from multiple threads concurrently; the runtime is
    /// multi-threaded and `block_on` takes `&self`.
    pub(crate) fn block_on<F: std::future::Future>(&self, fut: F) -> F::Output {
        self.rt.block_on(fut)
    }

    /// Best-effort WAL checkpoint. Failures are logged, never propagated;
    /// the WAL replays on the next open either way.
    pub(crate) fn checkpoint(&self) {
        let result = self.rt.block_on(async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(&self.pool)
                .await
        });
        if let Err(e) = result {
            tracing::warn!(error = %e, "WAL checkpoint failed (non-fatal)");
        }
    }

    /// Checkpoint and close the pool. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.checkpoint();
        self.rt.block_on(self.pool.close());
        tracing::debug!("Database closed");
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            self.checkpoint();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates_file_and_executes() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = Database::open(&dir.path().join("test.db")).unwrap();
        db.block_on(async {
            sqlx::query("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)")
                .execute(&db.pool)
                .await
                .unwrap();
            sqlx::query("INSERT INTO t (v) VALUES ('x')")
                .execute(&db.pool)
                .await
                .unwrap();
            let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM t")
                .fetch_one(&db.pool)
                .await
                .unwrap();
            assert_eq!(row.0, 1);
        });
    }

    #[test]
    fn test_close_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = Database::open(&dir.path().join("test.db")).unwrap();
        db.close();
        db.close();
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("test.db");
        {
            let db = Database::open(&path).unwrap();
            db.block_on(async {
                sqlx::query("CREATE TABLE t (v TEXT)")
                    .execute(&db.pool)
                    .await
                    .unwrap();
                sqlx::query("INSERT INTO t (v) VALUES ('persisted')")
                    .execute(&db.pool)
                    .await
                    .unwrap();
            });
            db.close();
        }
        let db = Database::open(&path).unwrap();
        let count: (i64,) = db.block_on(async {
            sqlx::query_as("SELECT COUNT(*) FROM t")
                .fetch_one(&db.pool)
                .await
                .unwrap()
        });
        assert_eq!(count.0, 1);
    }
}

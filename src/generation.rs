//! Atomic, crash-safe publication of index generations.
//!
//! Some filesystems (network volumes, certain Windows configurations)
//! refuse to rename or unlink a file while another handle holds it open,
//! and occasionally refuse writes to otherwise-valid absolute paths under
//! load. The generation scheme works around all of that: each save writes
//! a brand-new immutable generation, a one-line `CURRENT` file names the
//! active one, and readers only ever follow `CURRENT`. A crash mid-publish
//! leaves `CURRENT` pointing at the previous complete generation.
//!
//! Layout under the base directory:
//!
//! ```text
//! <base>/
//!   CURRENT                        # content: active generation name
//!   <stem>-<ts>-<pid>-<rnd>.idx/   # one directory per generation
//!   <stem>.lock                    # advisory cross-process write lock
//! ```
//!
//! `publish` tries three write strategies in order: a relative-path write,
//! a chdir write (the working directory is treated as a coarse lock and
//! restored by an RAII guard on every exit path), and a write-local-then-
//! move. Only after the target verifies non-empty does `CURRENT` advance.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use thiserror::Error;

/// Generations retained after a successful publish.
const DEFAULT_RETAIN: usize = 3;

#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("All publish strategies failed: {}", attempts.join("; "))]
    PersistenceFailed { attempts: Vec<String> },
    #[error("Write lock already held: {0}")]
    LockHeld(PathBuf),
}

/// Advisory cross-process write lock on `<stem>.lock`.
///
/// Held for the lifetime of the owning layer; the OS releases it if the
/// process dies, so a crashed writer never wedges the directory.
pub struct WriteLock {
    file: File,
    path: PathBuf,
}

impl WriteLock {
    /// Acquire the lock, failing fast with `LockHeld` when another process
    /// holds it.
    pub fn acquire(base: &Path, stem: &str) -> Result<Self, GenerationError> {
        std::fs::create_dir_all(base)?;
        let path = base.join(format!("{}.lock", stem));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        file.try_lock_exclusive()
            .map_err(|_| GenerationError::LockHeld(path.clone()))?;
        tracing::debug!(path = %path.display(), "Write lock acquired");
        Ok(Self { file, path })
    }
}

impl Drop for WriteLock {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            tracing::debug!(path = %self.path.display(), error = %e, "Write lock release failed");
        }
    }
}

/// The working directory is process-global state; strategies that touch it
/// serialize on this lock so concurrent publishers never see each other's
/// chdir window.
static CWD_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// RAII guard for chdir-based writes: restores the original working
/// directory on every exit path, including panics.
struct CwdGuard {
    original: PathBuf,
}

impl CwdGuard {
    fn enter(dir: &Path) -> std::io::Result<Self> {
        let original = std::env::current_dir()?;
        std::env::set_current_dir(dir)?;
        Ok(Self { original })
    }
}

impl Drop for CwdGuard {
    fn drop(&mut self) {
        if let Err(e) = std::env::set_current_dir(&self.original) {
            tracing::error!(
                dir = %self.original.display(),
                error = %e,
                "Failed to restore working directory"
            );
        }
    }
}

/// Manages the generation directory: fresh names, the three-strategy
/// publish, the `CURRENT` pointer, and retention.
pub struct GenerationManager {
    base: PathBuf,
    stem: String,
    retain: usize,
}

impl GenerationManager {
    pub fn new(base: impl Into<PathBuf>, stem: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            stem: stem.into(),
            retain: DEFAULT_RETAIN,
        }
    }

    pub fn with_retain(mut self, retain: usize) -> Self {
        self.retain = retain.max(1);
        self
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Allocate a fresh generation name. The millisecond timestamp is
    /// zero-padded so lexicographic order matches creation order.
    fn allocate_name(&self) -> String {
        format!(
            "{}-{:013}-{}-{:08x}.idx",
            self.stem,
            chrono::Utc::now().timestamp_millis().max(0),
            std::process::id(),
            rand::random::<u32>()
        )
    }

    /// Publish a new generation written by `write_fn` and advance
    /// `CURRENT` to it.
    ///
    /// `write_fn` receives the path (file or directory) it should create;
    /// it is invoked at most once per strategy, against a clean target.
    /// On success returns the absolute path of the new generation. On
    /// failure `CURRENT` is untouched and the previous generation stays
    /// active.
    pub fn publish<F>(&self, write_fn: F) -> Result<PathBuf, GenerationError>
    where
        F: Fn(&Path) -> anyhow::Result<()>,
    {
        std::fs::create_dir_all(&self.base)?;
        let name = self.allocate_name();
        let target = self.base.join(&name);
        let mut attempts: Vec<String> = Vec::new();

        // Strategy a: relative-path write
        match self.try_relative(&write_fn, &target) {
            Ok(()) => return self.commit(&name, &target),
            Err(e) => {
                tracing::warn!(error = %e, "Relative-path write failed, trying chdir write");
                attempts.push(format!("relative: {}", e));
                discard_partial(&target);
            }
        }

        // Strategy b: chdir write
        match self.try_chdir(&write_fn, &name, &target) {
            Ok(()) => return self.commit(&name, &target),
            Err(e) => {
                tracing::warn!(error = %e, "Chdir write failed, trying local write + move");
                attempts.push(format!("chdir: {}", e));
                discard_partial(&target);
            }
        }

        // Strategy c: local write + move
        match self.try_local_move(&write_fn, &name, &target) {
            Ok(()) => return self.commit(&name, &target),
            Err(e) => {
                attempts.push(format!("local+move: {}", e));
                discard_partial(&target);
            }
        }

        tracing::error!(
            target = %target.display(),
            "All publish strategies exhausted; CURRENT unchanged"
        );
        Err(GenerationError::PersistenceFailed { attempts })
    }

    fn try_relative<F>(&self, write_fn: &F, target: &Path) -> anyhow::Result<()>
    where
        F: Fn(&Path) -> anyhow::Result<()>,
    {
        // Prefer a path relative to the working directory when the base
        // sits under it; otherwise the joined path is passed as-is.
        let relative = std::env::current_dir()
            .ok()
            .and_then(|cwd| target.strip_prefix(&cwd).map(Path::to_path_buf).ok())
            .unwrap_or_else(|| target.to_path_buf());
        write_fn(&relative)?;
        verify_written(target)
    }

    fn try_chdir<F>(&self, write_fn: &F, name: &str, target: &Path) -> anyhow::Result<()>
    where
        F: Fn(&Path) -> anyhow::Result<()>,
    {
        {
            let _cwd = CWD_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let _guard = CwdGuard::enter(&self.base)?;
            write_fn(Path::new(name))?;
            // guard drops here, restoring the working directory before
            // verification resolves the absolute target
        }
        verify_written(target)
    }

    fn try_local_move<F>(&self, write_fn: &F, name: &str, target: &Path) -> anyhow::Result<()>
    where
        F: Fn(&Path) -> anyhow::Result<()>,
    {
        let scratch = {
            let _cwd = CWD_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let scratch = std::env::current_dir()?.join(name);
            write_fn(Path::new(name))?;
            scratch
        };
        move_into(&scratch, target)?;
        verify_written(target)
    }

    /// Advance `CURRENT` and prune old generations.
    fn commit(&self, name: &str, target: &Path) -> Result<PathBuf, GenerationError> {
        self.update_current(name)?;
        self.prune(name);
        tracing::info!(generation = name, "Generation published");
        Ok(target.to_path_buf())
    }

    /// Atomically point `CURRENT` at `name` (write temp, fsync
    /// best-effort, rename).
    fn update_current(&self, name: &str) -> Result<(), GenerationError> {
        let tmp = self.base.join("CURRENT.tmp");
        let current = self.base.join("CURRENT");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(name.as_bytes())?;
            file.write_all(b"\n")?;
            if let Err(e) = file.sync_all() {
                // Some filesystems refuse fsync with permission errors;
                // the rename below is still ordered after the write.
                if e.kind() == std::io::ErrorKind::PermissionDenied {
                    tracing::debug!(error = %e, "fsync CURRENT.tmp denied, continuing");
                } else {
                    return Err(e.into());
                }
            }
        }
        std::fs::rename(&tmp, &current)?;
        if let Ok(dir) = File::open(&self.base) {
            let _ = dir.sync_all();
        }
        Ok(())
    }

    /// Read `CURRENT` and return the active generation path, if both the
    /// pointer and its target exist.
    pub fn resolve_current(&self) -> Option<PathBuf> {
        let content = std::fs::read_to_string(self.base.join("CURRENT")).ok()?;
        let name = content.trim();
        if name.is_empty() {
            return None;
        }
        let path = self.base.join(name);
        path.exists().then_some(path)
    }

    /// Delete all but the newest `retain` generations, always keeping the
    /// one just published. Transient failures skip the entry rather than
    /// failing the publish.
    fn prune(&self, keep_name: &str) {
        let prefix = format!("{}-", self.stem);
        let entries = match std::fs::read_dir(&self.base) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!(error = %e, "Retention scan failed");
                return;
            }
        };

        let mut generations: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|n| n.starts_with(&prefix) && n.ends_with(".idx"))
            .collect();
        // Names embed a zero-padded timestamp: lexicographic = chronological
        generations.sort_unstable_by(|a, b| b.cmp(a));

        for name in generations.iter().skip(self.retain) {
            if name == keep_name {
                continue;
            }
            let path = self.base.join(name);
            let result = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            match result {
                Ok(()) => tracing::debug!(generation = %name, "Old generation removed"),
                Err(e) => {
                    // The platform may still hold the file open; skip and
                    // retry on the next publish
                    tracing::debug!(generation = %name, error = %e, "Retention skip");
                }
            }
        }
    }
}

/// A published target must exist and contain data: a non-empty file, or a
/// directory with at least one non-empty file.
fn verify_written(target: &Path) -> anyhow::Result<()> {
    let meta = std::fs::metadata(target)
        .map_err(|e| anyhow::anyhow!("target missing after write: {}", e))?;
    if meta.is_file() {
        anyhow::ensure!(meta.len() > 0, "target file is empty");
        return Ok(());
    }
    let has_content = std::fs::read_dir(target)?
        .filter_map(|e| e.ok())
        .any(|e| e.metadata().map(|m| m.len() > 0).unwrap_or(false));
    anyhow::ensure!(has_content, "target directory is empty");
    Ok(())
}

/// Remove a partially-written target before the next strategy runs.
fn discard_partial(target: &Path) {
    if target.is_dir() {
        let _ = std::fs::remove_dir_all(target);
    } else if target.exists() {
        let _ = std::fs::remove_file(target);
    }
}

/// Move a file or directory, falling back to copy + remove for
/// cross-device moves.
fn move_into(src: &Path, dst: &Path) -> std::io::Result<()> {
    if std::fs::rename(src, dst).is_ok() {
        return Ok(());
    }
    copy_recursively(src, dst)?;
    if src.is_dir() {
        let _ = std::fs::remove_dir_all(src);
    } else {
        let _ = std::fs::remove_file(src);
    }
    Ok(())
}

fn copy_recursively(src: &Path, dst: &Path) -> std::io::Result<()> {
    if src.is_dir() {
        std::fs::create_dir_all(dst)?;
        for entry in std::fs::read_dir(src)? {
            let entry = entry?;
            copy_recursively(&entry.path(), &dst.join(entry.file_name()))?;
        }
        Ok(())
    } else {
        std::fs::copy(src, dst).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use tempfile::TempDir;

    fn write_generation(path: &Path) -> anyhow::Result<()> {
        std::fs::create_dir_all(path)?;
        std::fs::write(path.join("index.hnsw.graph"), b"graph-bytes")?;
        Ok(())
    }

    #[test]
    fn test_publish_and_resolve() {
        let tmp = TempDir::new().unwrap();
        let mgr = GenerationManager::new(tmp.path(), "vectors");

        let published = mgr.publish(write_generation).unwrap();
        assert!(published.exists());

        let current = mgr.resolve_current().unwrap();
        assert_eq!(current, published);
        assert!(current.join("index.hnsw.graph").exists());
    }

    #[test]
    fn test_resolve_current_absent() {
        let tmp = TempDir::new().unwrap();
        let mgr = GenerationManager::new(tmp.path(), "vectors");
        assert!(mgr.resolve_current().is_none());
    }

    #[test]
    fn test_publish_falls_back_to_third_strategy() {
        let tmp = TempDir::new().unwrap();
        let mgr = GenerationManager::new(tmp.path(), "vectors");

        // Fail the first two strategy invocations, succeed on the third
        let calls = Cell::new(0usize);
        let published = mgr
            .publish(|path| {
                let n = calls.get();
                calls.set(n + 1);
                if n < 2 {
                    anyhow::bail!("injected failure {}", n);
                }
                write_generation(path)
            })
            .unwrap();

        assert_eq!(calls.get(), 3);
        assert_eq!(mgr.resolve_current().unwrap(), published);
    }

    #[test]
    fn test_all_strategies_fail_leaves_current_untouched() {
        let tmp = TempDir::new().unwrap();
        let mgr = GenerationManager::new(tmp.path(), "vectors");

        let first = mgr.publish(write_generation).unwrap();

        let result = mgr.publish(|_| anyhow::bail!("disk on fire"));
        assert!(matches!(
            result,
            Err(GenerationError::PersistenceFailed { ref attempts }) if attempts.len() == 3
        ));

        // Reader path unaffected: CURRENT still names the first generation
        assert_eq!(mgr.resolve_current().unwrap(), first);
    }

    #[test]
    fn test_empty_write_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let mgr = GenerationManager::new(tmp.path(), "vectors");

        let result = mgr.publish(|path| {
            std::fs::create_dir_all(path)?;
            Ok(())
        });
        assert!(matches!(
            result,
            Err(GenerationError::PersistenceFailed { .. })
        ));
        assert!(mgr.resolve_current().is_none());
    }

    #[test]
    fn test_retention_keeps_newest_three() {
        let tmp = TempDir::new().unwrap();
        let mgr = GenerationManager::new(tmp.path(), "vectors");

        for _ in 0..5 {
            mgr.publish(write_generation).unwrap();
        }

        let generations: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                name.starts_with("vectors-") && name.ends_with(".idx")
            })
            .collect();
        assert_eq!(generations.len(), 3);

        // CURRENT points at one of the survivors
        let current = mgr.resolve_current().unwrap();
        assert!(current.exists());
    }

    #[test]
    fn test_write_lock_excludes_second_holder() {
        let tmp = TempDir::new().unwrap();
        let _lock = WriteLock::acquire(tmp.path(), "vectors").unwrap();
        assert!(matches!(
            WriteLock::acquire(tmp.path(), "vectors"),
            Err(GenerationError::LockHeld(_))
        ));
    }

    #[test]
    fn test_write_lock_released_on_drop() {
        let tmp = TempDir::new().unwrap();
        {
            let _lock = WriteLock::acquire(tmp.path(), "vectors").unwrap();
        }
        let _relock = WriteLock::acquire(tmp.path(), "vectors").unwrap();
    }

    #[test]
    fn test_cwd_restored_after_chdir_strategy() {
        let tmp = TempDir::new().unwrap();
        let mgr = GenerationManager::new(tmp.path(), "vectors");

        // Force the chdir path by failing only the first invocation
        let calls = Cell::new(0usize);
        mgr.publish(|path| {
            let n = calls.get();
            calls.set(n + 1);
            if n == 0 {
                anyhow::bail!("skip relative");
            }
            write_generation(path)
        })
        .unwrap();

        // The guard must not leave the process parked inside the base dir
        let after = std::env::current_dir().unwrap();
        assert_ne!(after, tmp.path());
    }
}

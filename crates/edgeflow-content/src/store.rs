use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};
use uuid::Uuid;

use edgeflow_core::error::{FlowError, Result};

use crate::claim::ContentClaim;

/// Counters describing the store's lifetime activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContentStats {
    pub claims_created: u64,
    pub blobs_deleted: u64,
    pub pending_deletions: usize,
}

/// Durable blob storage: a directory of opaque files, one per claim.
///
/// Each blob is owned by exactly one `ContentClaim` for its lifetime, so no
/// cross-process locking is needed. Blobs are removed when the last handle
/// to their claim is dropped.
pub struct ContentStore {
    dir: PathBuf,
    pending: Mutex<Vec<PathBuf>>,
    claims_created: AtomicU64,
    blobs_deleted: AtomicU64,
}

impl ContentStore {
    /// Open or create a content store rooted at `dir`.
    pub fn open(dir: &Path) -> Result<Arc<Self>> {
        std::fs::create_dir_all(dir).map_err(|e| {
            FlowError::Content(format!(
                "Failed to create content directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        info!(path = %dir.display(), "Content store opened");
        Ok(Arc::new(Self {
            dir: dir.to_path_buf(),
            pending: Mutex::new(Vec::new()),
            claims_created: AtomicU64::new(0),
            blobs_deleted: AtomicU64::new(0),
        }))
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    /// Allocate a fresh, uniquely addressed content location.
    ///
    /// Nothing is written until the claim is opened for writing.
    pub fn create_claim(self: &Arc<Self>) -> ContentClaim {
        let id = Uuid::new_v4();
        let path = self.dir.join(id.to_string());
        self.claims_created.fetch_add(1, Ordering::Relaxed);
        debug!(claim = %id, "Content claim created");
        ContentClaim::new(id, path, Arc::clone(self))
    }

    /// Open the claim's blob for writing, truncating anything already there.
    pub fn open_write(&self, claim: &ContentClaim) -> Result<File> {
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(claim.path())
            .map_err(|e| FlowError::Content(format!("Failed to open claim {} for write: {}", claim.id(), e)))
    }

    /// Open a window of the claim's blob for reading.
    pub fn open_read(&self, claim: &ContentClaim, offset: u64, size: u64) -> Result<io::Take<File>> {
        let mut file = File::open(claim.path())
            .map_err(|e| FlowError::Content(format!("Failed to open claim {} for read: {}", claim.id(), e)))?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset))?;
        }
        Ok(file.take(size))
    }

    /// Whether the backing bytes for `claim` exist on disk.
    pub fn exists(&self, claim: &ContentClaim) -> bool {
        claim.path().exists()
    }

    /// Length of the blob currently stored for `claim`.
    pub fn blob_len(&self, claim: &ContentClaim) -> Result<u64> {
        Ok(std::fs::metadata(claim.path())?.len())
    }

    /// Called once, when the last owner of a claim goes away.
    pub(crate) fn release(&self, claim_id: &Uuid, path: &Path) {
        match remove_blob(path) {
            Ok(()) => {
                self.blobs_deleted.fetch_add(1, Ordering::Relaxed);
                debug!(claim = %claim_id, "Content claim released");
            }
            Err(e) => {
                warn!(
                    claim = %claim_id,
                    path = %path.display(),
                    error = %e,
                    "Failed to delete claim content, deferring cleanup"
                );
                if let Ok(mut pending) = self.pending.lock() {
                    pending.push(path.to_path_buf());
                }
            }
        }
    }

    /// Retry deletions that failed on the release path. Returns how many succeeded.
    pub fn retry_pending_deletions(&self) -> usize {
        let batch: Vec<PathBuf> = match self.pending.lock() {
            Ok(mut pending) => std::mem::take(&mut *pending),
            Err(_) => return 0,
        };
        if batch.is_empty() {
            return 0;
        }

        let mut removed = 0;
        let mut still_pending = Vec::new();
        for path in batch {
            match remove_blob(&path) {
                Ok(()) => {
                    removed += 1;
                    self.blobs_deleted.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Deferred claim cleanup failed again");
                    still_pending.push(path);
                }
            }
        }

        if !still_pending.is_empty() {
            if let Ok(mut pending) = self.pending.lock() {
                pending.extend(still_pending);
            }
        }
        if removed > 0 {
            info!(removed, "Deferred claim cleanup completed");
        }
        removed
    }

    pub fn pending_deletions(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn stats(&self) -> ContentStats {
        ContentStats {
            claims_created: self.claims_created.load(Ordering::Relaxed),
            blobs_deleted: self.blobs_deleted.load(Ordering::Relaxed),
            pending_deletions: self.pending_deletions(),
        }
    }
}

/// A blob that was never written counts as deleted.
fn remove_blob(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_store() -> (tempfile::TempDir, Arc<ContentStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(&dir.path().join("content")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_open_creates_directory() {
        let (dir, store) = temp_store();
        assert!(dir.path().join("content").is_dir());
        assert_eq!(store.directory(), dir.path().join("content"));
    }

    #[test]
    fn test_open_fails_when_path_is_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("not-a-dir");
        std::fs::write(&file_path, b"x").unwrap();
        let err = ContentStore::open(&file_path.join("content")).err().unwrap();
        assert!(matches!(err, FlowError::Content(_)));
    }

    #[test]
    fn test_write_then_read_window() {
        let (_dir, store) = temp_store();
        let claim = store.create_claim();
        {
            let mut f = store.open_write(&claim).unwrap();
            f.write_all(b"hello world").unwrap();
        }
        let mut out = String::new();
        store.open_read(&claim, 6, 5).unwrap().read_to_string(&mut out).unwrap();
        assert_eq!(out, "world");
        assert_eq!(store.blob_len(&claim).unwrap(), 11);
    }

    #[test]
    fn test_unwritten_claim_release_is_clean() {
        let (_dir, store) = temp_store();
        let claim = store.create_claim();
        drop(claim);
        let stats = store.stats();
        assert_eq!(stats.claims_created, 1);
        assert_eq!(stats.blobs_deleted, 1);
        assert_eq!(stats.pending_deletions, 0);
    }

    #[test]
    fn test_failed_delete_is_deferred_and_retried() {
        let (_dir, store) = temp_store();
        let claim = store.create_claim();
        let path = claim.path().to_path_buf();

        // A non-empty directory at the blob path makes remove_file fail.
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join("inner"), b"x").unwrap();

        drop(claim);
        assert_eq!(store.pending_deletions(), 1);
        assert_eq!(store.retry_pending_deletions(), 0);
        assert_eq!(store.pending_deletions(), 1);

        std::fs::remove_dir_all(&path).unwrap();
        std::fs::write(&path, b"blob").unwrap();

        assert_eq!(store.retry_pending_deletions(), 1);
        assert_eq!(store.pending_deletions(), 0);
        assert!(!path.exists());
    }
}

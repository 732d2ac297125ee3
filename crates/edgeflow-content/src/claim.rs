use std::path::{Path, PathBuf};
use std::sync::Arc;

use uuid::Uuid;

use crate::store::ContentStore;

/// Shared-ownership handle to one content blob.
///
/// Cloning a claim attaches another owner; dropping a handle detaches it.
/// When the last handle goes away the blob is deleted, exactly once, by the
/// store that issued the claim. Records that fan out from one another share
/// a claim instead of copying bytes.
#[derive(Clone)]
pub struct ContentClaim {
    inner: Arc<ClaimInner>,
}

struct ClaimInner {
    id: Uuid,
    path: PathBuf,
    store: Arc<ContentStore>,
}

impl Drop for ClaimInner {
    fn drop(&mut self) {
        self.store.release(&self.id, &self.path);
    }
}

impl ContentClaim {
    pub(crate) fn new(id: Uuid, path: PathBuf, store: Arc<ContentStore>) -> Self {
        Self {
            inner: Arc::new(ClaimInner { id, path, store }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Live handles to this claim, i.e. the records (and in-flight writers)
    /// currently referencing it.
    pub fn owners(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Whether two handles refer to the same blob.
    pub fn same_claim(&self, other: &ContentClaim) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for ContentClaim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentClaim")
            .field("id", &self.inner.id)
            .field("path", &self.inner.path)
            .field("owners", &self.owners())
            .finish()
    }
}

impl std::fmt::Display for ContentClaim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner.path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_attaches_and_drop_detaches() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path()).unwrap();
        let claim = store.create_claim();
        std::fs::write(claim.path(), b"payload").unwrap();
        assert_eq!(claim.owners(), 1);

        let shared = claim.clone();
        assert_eq!(claim.owners(), 2);
        assert!(claim.same_claim(&shared));

        drop(shared);
        assert_eq!(claim.owners(), 1);
        assert!(claim.path().exists());

        let path = claim.path().to_path_buf();
        drop(claim);
        assert!(!path.exists());
    }

    #[test]
    fn test_distinct_claims_are_not_same() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path()).unwrap();
        let a = store.create_claim();
        let b = store.create_claim();
        assert!(!a.same_claim(&b));
        assert_ne!(a.id(), b.id());
        assert_ne!(a.path(), b.path());
    }
}

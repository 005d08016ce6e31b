//! Per-recording claims serializing concurrent record operations

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// In-process table of recording directories currently being written
///
/// Only one [`Claim`] per directory is live at a time; later claimers wait.
/// Nothing here coordinates separate processes sharing a store root.
#[derive(Clone, Default)]
pub struct ClaimTable {
    claims: Arc<DashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl ClaimTable {
    /// Create an empty claim table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a recording directory, waiting for the current holder
    pub async fn claim(&self, dir: &Path) -> Claim {
        let lock = Arc::clone(
            self.claims
                .entry(dir.to_path_buf())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        let guard = lock.lock_owned().await;

        Claim {
            guard: Some(guard),
            dir: dir.to_path_buf(),
            claims: Arc::clone(&self.claims),
        }
    }

    /// Claim a recording directory only if nobody holds it
    #[must_use]
    pub fn try_claim(&self, dir: &Path) -> Option<Claim> {
        let lock = Arc::clone(
            self.claims
                .entry(dir.to_path_buf())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        let guard = lock.try_lock_owned().ok()?;

        Some(Claim {
            guard: Some(guard),
            dir: dir.to_path_buf(),
            claims: Arc::clone(&self.claims),
        })
    }

    /// Number of directories with a live or pending claim
    #[must_use]
    pub fn len(&self) -> usize {
        self.claims.len()
    }

    /// Whether no directory is claimed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }
}

/// Exclusive right to write one recording directory, released on drop
pub struct Claim {
    guard: Option<OwnedMutexGuard<()>>,
    dir: PathBuf,
    claims: Arc<DashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl Claim {
    /// Claimed recording directory
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Waiters hold their own clone, so only the table's reference is left
        // when nobody else wants this directory.
        self.claims
            .remove_if(&self.dir, |_, lock| Arc::strong_count(lock) == 1);
    }
}

// Cache entry locking
// Advisory lock files guarding concurrent access to one cache entry.
// Acquisition timeout surfaces as a retryable CacheError; callers fall back
// to normal execution. A holder that dies without dropping leaves its file
// behind, so locks past a staleness age are broken rather than waited on.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::{sleep, Instant};

use crate::error::CacheError;

const RETRY_INTERVAL: Duration = Duration::from_millis(50);
const STALE_AFTER: Duration = Duration::from_secs(60);

/// Held advisory lock; the lock file is removed on drop
#[derive(Debug)]
pub struct CacheLock {
    path: PathBuf,
}

impl CacheLock {
    /// Acquire the lock at `path`, polling until `timeout` elapses
    pub async fn acquire(path: &Path, timeout: Duration) -> Result<CacheLock, CacheError> {
        Self::acquire_with_staleness(path, timeout, STALE_AFTER).await
    }

    /// Acquire with an explicit staleness age for orphaned lock files
    pub async fn acquire_with_staleness(
        path: &Path,
        timeout: Duration,
        stale_after: Duration,
    ) -> Result<CacheLock, CacheError> {
        let deadline = Instant::now() + timeout;

        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
            {
                Ok(_) => {
                    return Ok(CacheLock {
                        path: path.to_path_buf(),
                    })
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if is_stale(path, stale_after) {
                        tracing::warn!(path = %path.display(), "breaking stale cache lock");
                        let _ = std::fs::remove_file(path);
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(CacheError::LockTimeout(path.to_path_buf()));
                    }
                    sleep(RETRY_INTERVAL).await;
                }
                Err(e) => return Err(CacheError::Io(e)),
            }
        }
    }
}

/// A lock file whose mtime is older than `stale_after` belongs to a holder
/// that exited without releasing
fn is_stale(path: &Path, stale_after: Duration) -> bool {
    // Any failure here means the file vanished or the clock is unusable;
    // the next create_new attempt settles it either way
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    let Ok(modified) = metadata.modified() else {
        return false;
    };
    modified
        .elapsed()
        .map(|age| age >= stale_after)
        .unwrap_or(false)
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

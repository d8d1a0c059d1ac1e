use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// A lock older than this is presumed to belong to a dead process.
const LOCK_TTL_MS: i64 = 10 * 60 * 1000;

#[derive(Debug, Serialize, Deserialize)]
struct LockStamp {
    pid: u32,
    ts: i64,
}

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Cooperative advisory lock backed by exclusive file creation. Not a
/// kernel lock: writers that do not honor the file are not stopped. The
/// file holds `{pid, ts}` so a stale holder can be identified and evicted
/// after the TTL.
///
/// Dropping the guard removes the lock file.
#[derive(Debug)]
pub(crate) struct CacheLock {
    path: PathBuf,
}

impl CacheLock {
    /// Try to take the lock. On contention the holder's age is checked
    /// once: a stale lock is removed and acquisition retried a single time.
    /// Returns `None` on any failure — callers skip their write rather
    /// than block.
    pub(crate) async fn acquire(path: &Path) -> Option<Self> {
        if Self::try_create(path).await {
            return Some(Self {
                path: path.to_path_buf(),
            });
        }
        if Self::is_stale(path).await {
            debug!(path = %path.display(), "evicting stale cache lock");
            let _ = tokio::fs::remove_file(path).await;
            if Self::try_create(path).await {
                return Some(Self {
                    path: path.to_path_buf(),
                });
            }
        }
        debug!(path = %path.display(), "cache lock unavailable, skipping write");
        None
    }

    async fn try_create(path: &Path) -> bool {
        let opened = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await;
        match opened {
            Ok(mut file) => {
                let stamp = LockStamp {
                    pid: std::process::id(),
                    ts: now_millis(),
                };
                if let Ok(bytes) = serde_json::to_vec(&stamp) {
                    let _ = file.write_all(&bytes).await;
                }
                true
            }
            Err(_) => false,
        }
    }

    async fn is_stale(path: &Path) -> bool {
        if let Ok(raw) = tokio::fs::read_to_string(path).await {
            if let Ok(stamp) = serde_json::from_str::<LockStamp>(&raw) {
                return now_millis().saturating_sub(stamp.ts) > LOCK_TTL_MS;
            }
        }
        // Unreadable stamp: fall back to the file's own age.
        match tokio::fs::metadata(path).await.and_then(|m| m.modified()) {
            Ok(modified) => modified
                .elapsed()
                .map(|age| age.as_millis() as i64 > LOCK_TTL_MS)
                .unwrap_or(false),
            Err(_) => false,
        }
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;

use crate::filter::FilteredThreats;

mod lock;

use lock::CacheLock;

/// Bumped whenever the persisted shape changes; entries from another
/// version are misses.
pub const CACHE_VERSION: u32 = 1;

/// Filesystem operations in flight during a bulk migration.
const MIGRATION_CONCURRENCY: usize = 12;

const CACHE_FILE: &str = "cache.json";
const STATE_FILE: &str = "state.json";
const LOCK_FILE: &str = "cache.lock";

/// Storage strategy: one consolidated `cache.json`, or one file per source
/// file keyed by the sha256 of its relative path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    Single,
    Split,
}

/// Persisted workspace-level cache mode. Loaded once, up front, and handed
/// to [`CacheManager::new`] — never re-read behind the caller's back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceState {
    pub mode: CacheMode,
}

impl Default for WorkspaceState {
    fn default() -> Self {
        Self {
            mode: CacheMode::Single,
        }
    }
}

impl WorkspaceState {
    /// Read `state.json` from the cache directory. Any failure falls back
    /// to the default single-file mode.
    pub async fn load(cache_dir: &Path) -> Self {
        let path = cache_dir.join(STATE_FILE);
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|err| {
                debug!(%err, "unreadable workspace state, using default");
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SingleEntry {
    mtime: i64,
    size: u64,
    results: FilteredThreats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheData {
    version: u32,
    entries: HashMap<String, SingleEntry>,
}

impl CacheData {
    fn empty() -> Self {
        Self {
            version: CACHE_VERSION,
            entries: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SplitEntry {
    version: u32,
    rel_path: String,
    mtime: i64,
    size: u64,
    results: FilteredThreats,
}

/// Per-file scan-result cache keyed by path + mtime + size. Every failure
/// path is fail-open: reads degrade to misses, writes to no-ops, and the
/// only trace is a `debug!` event. Correctness never depends on the cache,
/// only throughput does.
#[derive(Debug)]
pub struct CacheManager {
    workspace_root: PathBuf,
    cache_dir: PathBuf,
    mode: CacheMode,
}

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Write via a uniquely named sibling temp file and rename into place, so a
/// reader never observes partial JSON. Concurrent writers race on the
/// rename and the last one wins.
async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(parent).await?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "cache".to_string());
    let tmp = parent.join(format!(
        ".{}.{}.{}.tmp",
        file_name,
        std::process::id(),
        TMP_SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    tokio::fs::write(&tmp, bytes).await?;
    match tokio::fs::rename(&tmp, path).await {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = tokio::fs::remove_file(&tmp).await;
            Err(err)
        }
    }
}

impl CacheManager {
    pub fn new(
        workspace_root: impl Into<PathBuf>,
        cache_dir: impl Into<PathBuf>,
        state: &WorkspaceState,
    ) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            cache_dir: cache_dir.into(),
            mode: state.mode,
        }
    }

    pub fn mode(&self) -> CacheMode {
        self.mode
    }

    fn single_path(&self) -> PathBuf {
        self.cache_dir.join(CACHE_FILE)
    }

    fn lock_path(&self) -> PathBuf {
        self.cache_dir.join(LOCK_FILE)
    }

    fn split_path(&self, rel_path: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(rel_path.as_bytes()));
        self.cache_dir.join(format!("{digest}.json"))
    }

    /// Current mtime (Unix millis) and size of the file behind `rel_path`.
    async fn stat(&self, rel_path: &str) -> Option<(i64, u64)> {
        let meta = tokio::fs::metadata(self.workspace_root.join(rel_path))
            .await
            .ok()?;
        let mtime = meta
            .modified()
            .ok()?
            .duration_since(std::time::UNIX_EPOCH)
            .ok()?
            .as_millis() as i64;
        Some((mtime, meta.len()))
    }

    /// Cached results for `rel_path`, or `None` when the file cannot be
    /// stat'ed, the entry is from another schema version, or the recorded
    /// mtime/size no longer match. Stale entries are not deleted — they are
    /// overwritten by the next `set`.
    pub async fn get(&self, rel_path: &str) -> Option<FilteredThreats> {
        let Some((mtime, size)) = self.stat(rel_path).await else {
            debug!(rel_path, "cache miss: stat failed");
            return None;
        };
        match self.mode {
            CacheMode::Single => {
                let data = self.read_single().await?;
                let entry = data.entries.get(rel_path)?;
                if entry.mtime != mtime || entry.size != size {
                    debug!(rel_path, "cache miss: fingerprint changed");
                    return None;
                }
                Some(entry.results.clone())
            }
            CacheMode::Split => {
                let raw = tokio::fs::read_to_string(self.split_path(rel_path))
                    .await
                    .ok()?;
                let entry: SplitEntry = match serde_json::from_str(&raw) {
                    Ok(entry) => entry,
                    Err(err) => {
                        debug!(rel_path, %err, "cache miss: unreadable entry");
                        return None;
                    }
                };
                if entry.version != CACHE_VERSION
                    || entry.rel_path != rel_path
                    || entry.mtime != mtime
                    || entry.size != size
                {
                    debug!(rel_path, "cache miss: entry invalid");
                    return None;
                }
                Some(entry.results)
            }
        }
    }

    /// Persist results for `rel_path`. Silently a no-op when the file
    /// cannot be stat'ed, the lock is unavailable, or any write fails.
    pub async fn set(&self, rel_path: &str, results: &FilteredThreats) {
        let Some((mtime, size)) = self.stat(rel_path).await else {
            debug!(rel_path, "cache set skipped: stat failed");
            return;
        };
        match self.mode {
            CacheMode::Single => {
                if let Err(err) = tokio::fs::create_dir_all(&self.cache_dir).await {
                    debug!(%err, "cache set skipped: cache dir unavailable");
                    return;
                }
                let Some(_lock) = CacheLock::acquire(&self.lock_path()).await else {
                    return;
                };
                let mut data = self.read_single().await.unwrap_or_else(CacheData::empty);
                data.entries.insert(
                    rel_path.to_string(),
                    SingleEntry {
                        mtime,
                        size,
                        results: results.clone(),
                    },
                );
                match serde_json::to_vec(&data) {
                    Ok(bytes) => {
                        if let Err(err) = write_atomic(&self.single_path(), &bytes).await {
                            debug!(%err, "cache write failed");
                        }
                    }
                    Err(err) => debug!(%err, "cache serialization failed"),
                }
            }
            CacheMode::Split => {
                let entry = SplitEntry {
                    version: CACHE_VERSION,
                    rel_path: rel_path.to_string(),
                    mtime,
                    size,
                    results: results.clone(),
                };
                match serde_json::to_vec(&entry) {
                    Ok(bytes) => {
                        if let Err(err) = write_atomic(&self.split_path(rel_path), &bytes).await {
                            debug!(%err, "cache write failed");
                        }
                    }
                    Err(err) => debug!(%err, "cache serialization failed"),
                }
            }
        }
    }

    /// Drop the cache directory wholesale: entries, state file, lock.
    pub async fn clear(&self) {
        if let Err(err) = tokio::fs::remove_dir_all(&self.cache_dir).await {
            debug!(%err, "cache clear incomplete");
        }
    }

    /// Advisory storage-mode recommendation. The `deviation` band around
    /// `threshold` is hysteresis: a workspace hovering at the boundary is
    /// not told to flip modes on every run.
    pub fn should_recommend_mode_switch(
        &self,
        file_count: usize,
        deviation: usize,
        threshold: usize,
    ) -> Option<CacheMode> {
        match self.mode {
            CacheMode::Single if file_count > threshold + deviation => Some(CacheMode::Split),
            CacheMode::Split if file_count + deviation < threshold => Some(CacheMode::Single),
            _ => None,
        }
    }

    async fn read_single(&self) -> Option<CacheData> {
        let raw = tokio::fs::read_to_string(self.single_path()).await.ok()?;
        let data: CacheData = match serde_json::from_str(&raw) {
            Ok(data) => data,
            Err(err) => {
                debug!(%err, "cache miss: unreadable cache file");
                return None;
            }
        };
        if data.version != CACHE_VERSION {
            debug!(
                found = data.version,
                expected = CACHE_VERSION,
                "cache miss: version mismatch"
            );
            return None;
        }
        Some(data)
    }

    /// Every split entry file in the cache directory.
    async fn split_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        let Ok(mut dir) = tokio::fs::read_dir(&self.cache_dir).await else {
            return files;
        };
        while let Ok(Some(entry)) = dir.next_entry().await {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".json") && name != CACHE_FILE && name != STATE_FILE {
                files.push(path);
            }
        }
        files
    }

    /// Persist the current mode, but only when it differs from what is
    /// already on disk.
    async fn persist_state(&self) -> Result<()> {
        let path = self.cache_dir.join(STATE_FILE);
        let current = WorkspaceState::load(&self.cache_dir).await;
        let desired = WorkspaceState { mode: self.mode };
        if current == desired && path.exists() {
            return Ok(());
        }
        let bytes = serde_json::to_vec(&desired)?;
        write_atomic(&path, &bytes)
            .await
            .context("failed to persist workspace state")
    }

    /// Collapse every split entry into one `cache.json`, bounded to
    /// [`MIGRATION_CONCURRENCY`] reads in flight, then delete the split
    /// files and rewrite the mode record. Returns the number of entries
    /// migrated; unreadable entries are dropped, not errors.
    pub async fn merge_split_to_single(&mut self) -> Result<usize> {
        let semaphore = Arc::new(Semaphore::new(MIGRATION_CONCURRENCY));
        let mut tasks: JoinSet<Option<(PathBuf, SplitEntry)>> = JoinSet::new();
        for path in self.split_files().await {
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                let raw = tokio::fs::read_to_string(&path).await.ok()?;
                let entry: SplitEntry = serde_json::from_str(&raw).ok()?;
                if entry.version != CACHE_VERSION {
                    return None;
                }
                Some((path, entry))
            });
        }

        let mut data = CacheData::empty();
        let mut consumed = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let Ok(Some((path, entry))) = joined else {
                continue;
            };
            consumed.push(path);
            data.entries.insert(
                entry.rel_path.clone(),
                SingleEntry {
                    mtime: entry.mtime,
                    size: entry.size,
                    results: entry.results,
                },
            );
        }

        let migrated = data.entries.len();
        let bytes = serde_json::to_vec(&data).context("failed to serialize merged cache")?;
        write_atomic(&self.single_path(), &bytes)
            .await
            .context("failed to write merged cache")?;

        // The merged file is durable; now the split entries can go.
        let mut removals: JoinSet<()> = JoinSet::new();
        for path in consumed {
            let semaphore = Arc::clone(&semaphore);
            removals.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                let _ = tokio::fs::remove_file(&path).await;
            });
        }
        while removals.join_next().await.is_some() {}

        self.mode = CacheMode::Single;
        self.persist_state().await?;
        Ok(migrated)
    }

    /// Explode `cache.json` into one file per entry, bounded to
    /// [`MIGRATION_CONCURRENCY`] writes in flight, then delete the single
    /// file and rewrite the mode record. Returns the number of entries
    /// migrated.
    pub async fn split_single_to_split(&mut self) -> Result<usize> {
        let data = self.read_single().await.unwrap_or_else(CacheData::empty);
        let semaphore = Arc::new(Semaphore::new(MIGRATION_CONCURRENCY));
        let mut tasks: JoinSet<bool> = JoinSet::new();
        let mut total = 0usize;
        for (rel_path, entry) in data.entries {
            total += 1;
            let target = self.split_path(&rel_path);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return false;
                };
                let split = SplitEntry {
                    version: CACHE_VERSION,
                    rel_path,
                    mtime: entry.mtime,
                    size: entry.size,
                    results: entry.results,
                };
                let Ok(bytes) = serde_json::to_vec(&split) else {
                    return false;
                };
                write_atomic(&target, &bytes).await.is_ok()
            });
        }

        let mut migrated = 0usize;
        while let Some(joined) = tasks.join_next().await {
            if matches!(joined, Ok(true)) {
                migrated += 1;
            }
        }
        if migrated < total {
            debug!(migrated, total, "some cache entries failed to split");
        }

        let _ = tokio::fs::remove_file(self.single_path()).await;
        self.mode = CacheMode::Split;
        self.persist_state().await?;
        Ok(migrated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{Location, Severity, ThreatCategory, ThreatReport};

    fn sample_results() -> FilteredThreats {
        FilteredThreats {
            threats: vec![ThreatReport::new(
                ThreatCategory::Invisible,
                1,
                Severity::High,
                "test",
                Location {
                    line: 1,
                    column: 6,
                    index: 5,
                },
                "\u{200B}",
            )],
            unused_ignores: Vec::new(),
        }
    }

    async fn manager(mode: CacheMode, root: &Path) -> CacheManager {
        let state = WorkspaceState { mode };
        CacheManager::new(root, root.join(".promptshield"), &state)
    }

    #[tokio::test]
    async fn set_then_get_round_trips_in_single_mode() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.ts"), "content").unwrap();
        let cache = manager(CacheMode::Single, dir.path()).await;

        cache.set("a.ts", &sample_results()).await;
        let hit = cache.get("a.ts").await.expect("fresh entry should hit");
        assert_eq!(hit.threats.len(), 1);
        assert_eq!(hit.threats[0].rule_id.as_deref(), Some("PSU001"));
    }

    #[tokio::test]
    async fn set_then_get_round_trips_in_split_mode() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.rs"), "content").unwrap();
        let cache = manager(CacheMode::Split, dir.path()).await;

        cache.set("b.rs", &sample_results()).await;
        assert!(cache.get("b.rs").await.is_some());
        // The entry lives in its own hashed file, not cache.json.
        assert!(!cache.single_path().exists());
        assert!(cache.split_path("b.rs").exists());
    }

    #[tokio::test]
    async fn empty_results_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.ts"), "x").unwrap();
        let cache = manager(CacheMode::Single, dir.path()).await;
        cache.set("a.ts", &FilteredThreats::default()).await;
        let hit = cache.get("a.ts").await.unwrap();
        assert!(hit.threats.is_empty());
    }

    #[tokio::test]
    async fn size_change_invalidates_entry() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.ts");
        std::fs::write(&file, "content").unwrap();
        let cache = manager(CacheMode::Single, dir.path()).await;

        cache.set("a.ts", &sample_results()).await;
        std::fs::write(&file, "content grew longer").unwrap();
        assert!(cache.get("a.ts").await.is_none());
    }

    #[tokio::test]
    async fn mtime_change_invalidates_entry() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.ts");
        std::fs::write(&file, "content").unwrap();
        let cache = manager(CacheMode::Split, dir.path()).await;

        cache.set("a.ts", &sample_results()).await;
        // Same size, later mtime; a full second clears even coarse
        // filesystem timestamp granularity.
        std::thread::sleep(std::time::Duration::from_millis(1050));
        std::fs::write(&file, "tnetnoc").unwrap();
        assert!(cache.get("a.ts").await.is_none());
    }

    #[tokio::test]
    async fn missing_file_is_a_miss_for_get_and_a_noop_for_set() {
        let dir = tempfile::tempdir().unwrap();
        let cache = manager(CacheMode::Single, dir.path()).await;
        cache.set("ghost.ts", &sample_results()).await;
        assert!(cache.get("ghost.ts").await.is_none());
        assert!(!cache.single_path().exists());
    }

    #[tokio::test]
    async fn version_mismatch_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.ts"), "x").unwrap();
        let cache = manager(CacheMode::Single, dir.path()).await;
        cache.set("a.ts", &sample_results()).await;

        // Rewrite the cache file under a foreign schema version.
        let raw = std::fs::read_to_string(cache.single_path()).unwrap();
        let mut value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        value["version"] = serde_json::json!(9999);
        std::fs::write(cache.single_path(), value.to_string()).unwrap();

        assert!(cache.get("a.ts").await.is_none());
    }

    #[tokio::test]
    async fn corrupt_cache_file_is_a_miss_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.ts"), "x").unwrap();
        let cache = manager(CacheMode::Single, dir.path()).await;
        std::fs::create_dir_all(dir.path().join(".promptshield")).unwrap();
        std::fs::write(cache.single_path(), "{ not json").unwrap();
        assert!(cache.get("a.ts").await.is_none());
    }

    #[tokio::test]
    async fn clear_removes_everything() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.ts"), "x").unwrap();
        let cache = manager(CacheMode::Single, dir.path()).await;
        cache.set("a.ts", &sample_results()).await;
        assert!(cache.single_path().exists());
        cache.clear().await;
        assert!(!dir.path().join(".promptshield").exists());
    }

    #[tokio::test]
    async fn held_lock_turns_set_into_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.ts"), "x").unwrap();
        let cache = manager(CacheMode::Single, dir.path()).await;
        std::fs::create_dir_all(dir.path().join(".promptshield")).unwrap();
        // A fresh foreign lock: set must skip, not block or fail.
        std::fs::write(
            cache.lock_path(),
            format!("{{\"pid\":0,\"ts\":{}}}", lock::now_millis()),
        )
        .unwrap();
        cache.set("a.ts", &sample_results()).await;
        assert!(!cache.single_path().exists());
        assert!(cache.get("a.ts").await.is_none());
    }

    #[test]
    fn mode_switch_recommendation_respects_hysteresis() {
        let state = WorkspaceState {
            mode: CacheMode::Single,
        };
        let single = CacheManager::new(".", ".cache", &state);
        assert_eq!(single.should_recommend_mode_switch(500, 50, 400), Some(CacheMode::Split));
        // Inside the band: no flapping.
        assert_eq!(single.should_recommend_mode_switch(430, 50, 400), None);
        assert_eq!(single.should_recommend_mode_switch(100, 50, 400), None);

        let state = WorkspaceState {
            mode: CacheMode::Split,
        };
        let split = CacheManager::new(".", ".cache", &state);
        assert_eq!(split.should_recommend_mode_switch(100, 50, 400), Some(CacheMode::Single));
        assert_eq!(split.should_recommend_mode_switch(380, 50, 400), None);
        assert_eq!(split.should_recommend_mode_switch(500, 50, 400), None);
    }

    #[tokio::test]
    async fn migration_round_trip_preserves_entries() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.ts", "b.ts", "c.ts"] {
            std::fs::write(dir.path().join(name), "x").unwrap();
        }
        let mut cache = manager(CacheMode::Single, dir.path()).await;
        for name in ["a.ts", "b.ts", "c.ts"] {
            cache.set(name, &sample_results()).await;
        }

        let split_count = cache.split_single_to_split().await.unwrap();
        assert_eq!(split_count, 3);
        assert_eq!(cache.mode(), CacheMode::Split);
        assert!(!cache.single_path().exists());
        assert!(cache.get("b.ts").await.is_some());

        let merged_count = cache.merge_split_to_single().await.unwrap();
        assert_eq!(merged_count, 3);
        assert_eq!(cache.mode(), CacheMode::Single);
        assert!(cache.split_files().await.is_empty());
        assert!(cache.get("c.ts").await.is_some());
    }

    #[tokio::test]
    async fn migration_rewrites_the_state_record() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.ts"), "x").unwrap();
        let mut cache = manager(CacheMode::Single, dir.path()).await;
        cache.set("a.ts", &sample_results()).await;

        cache.split_single_to_split().await.unwrap();
        let state = WorkspaceState::load(&dir.path().join(".promptshield")).await;
        assert_eq!(state.mode, CacheMode::Split);

        cache.merge_split_to_single().await.unwrap();
        let state = WorkspaceState::load(&dir.path().join(".promptshield")).await;
        assert_eq!(state.mode, CacheMode::Single);
    }
}

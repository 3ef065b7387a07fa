use std::collections::HashSet;
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, MutexGuard};

use crate::error::{LoaderError, Result};
use crate::manifest::LoadedManifest;

const ENTRIES_DIR: &str = "entries";
const INDEX_FILE: &str = "index.json";

/// Content-addressed store for module files and pinned manifests.
///
/// Directory layout:
/// ```text
/// directory/
///   index.json        -- sizes, last use times and application pins
///   entries/
///     <sha256 hex>    -- file contents
/// ```
///
/// Files are written to a temporary name and renamed into place, and only
/// become visible through the index once complete. Concurrent fetches of the
/// same key are serialized; unrelated keys proceed independently.
///
/// When the total size exceeds `max_size_in_bytes` the least recently used
/// entries are evicted, except those pinned by an application's current
/// manifest.
pub struct ZiplineCache {
    directory: PathBuf,
    max_size_in_bytes: u64,
    index: Mutex<CacheIndex>,
    key_locks: DashMap<String, Arc<Mutex<()>>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheIndex {
    #[serde(default)]
    entries: IndexMap<String, CacheEntry>,
    #[serde(default)]
    pins: IndexMap<String, ApplicationPin>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    size: u64,
    last_used_at_epoch_ms: u64,
}

/// The manifest an application last loaded successfully, and its modules.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ApplicationPin {
    manifest: String,
    fresh_at_epoch_ms: u64,
    modules: Vec<String>,
}

impl CacheIndex {
    fn total_size(&self) -> u64 {
        self.entries.values().map(|entry| entry.size).sum()
    }

    fn pinned_keys(&self) -> HashSet<&str> {
        self.pins
            .values()
            .flat_map(|pin| std::iter::once(&pin.manifest).chain(&pin.modules))
            .map(String::as_str)
            .collect()
    }
}

impl ZiplineCache {
    /// Open (or create) a cache in `directory`.
    ///
    /// Files the index doesn't know about, such as partial writes from a
    /// crashed process, are deleted.
    pub async fn open(directory: impl Into<PathBuf>, max_size_in_bytes: u64) -> Result<Self> {
        let directory = directory.into();
        let entries_dir = directory.join(ENTRIES_DIR);
        tokio::fs::create_dir_all(&entries_dir).await?;

        let mut index = read_index(&directory.join(INDEX_FILE)).await;

        let mut on_disk = HashSet::new();
        let mut files = tokio::fs::read_dir(&entries_dir).await?;
        while let Some(file) = files.next_entry().await? {
            let name = file.file_name().to_string_lossy().into_owned();
            if index.entries.contains_key(&name) {
                on_disk.insert(name);
            } else {
                tracing::debug!(file = %name, "Removing unindexed cache file");
                tokio::fs::remove_file(file.path()).await?;
            }
        }
        index.entries.retain(|key, _| on_disk.contains(key));

        let cache = Self {
            directory,
            max_size_in_bytes,
            index: Mutex::new(index),
            key_locks: DashMap::new(),
        };
        cache.write_index(&*cache.index.lock().await).await?;

        tracing::info!(
            path = %cache.directory.display(),
            entries = on_disk.len(),
            "Cache opened"
        );
        Ok(cache)
    }

    /// Default cache location: the platform cache directory, then `zipline`.
    pub fn default_path() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("zipline")
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn max_size_in_bytes(&self) -> u64 {
        self.max_size_in_bytes
    }

    pub async fn total_size(&self) -> u64 {
        self.index.lock().await.total_size()
    }

    pub async fn contains(&self, sha256_hex: &str) -> bool {
        self.index.lock().await.entries.contains_key(sha256_hex)
    }

    /// The stored bytes for `sha256_hex`, if present.
    ///
    /// An entry whose contents no longer match its key is dropped and
    /// reported as absent.
    pub async fn get(&self, sha256_hex: &str, now_epoch_ms: u64) -> Result<Option<Vec<u8>>> {
        if !self.contains(sha256_hex).await {
            return Ok(None);
        }

        let bytes = match tokio::fs::read(self.entry_path(sha256_hex)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut index = self.index.lock().await;
        if hex::encode(Sha256::digest(&bytes)) != sha256_hex {
            tracing::warn!(key = %sha256_hex, "Cached file is corrupt, dropping it");
            index.entries.shift_remove(sha256_hex);
            self.write_index(&index).await?;
            drop(index);
            remove_if_exists(&self.entry_path(sha256_hex)).await?;
            return Ok(None);
        }

        if let Some(entry) = index.entries.get_mut(sha256_hex) {
            entry.last_used_at_epoch_ms = now_epoch_ms;
        }
        self.write_index(&index).await?;
        Ok(Some(bytes))
    }

    /// Store `bytes`, which must hash to `sha256_hex`.
    pub async fn put(&self, sha256_hex: &str, bytes: &[u8], now_epoch_ms: u64) -> Result<()> {
        let actual = hex::encode(Sha256::digest(bytes));
        if actual != sha256_hex {
            return Err(LoaderError::Cache(format!(
                "content hashes to {actual}, not {sha256_hex}"
            )));
        }

        let path = self.entry_path(sha256_hex);
        write_atomically(&path, bytes).await?;

        let mut index = self.index.lock().await;
        index.entries.insert(
            sha256_hex.to_string(),
            CacheEntry {
                size: bytes.len() as u64,
                last_used_at_epoch_ms: now_epoch_ms,
            },
        );
        tracing::debug!(key = %sha256_hex, size = bytes.len(), "Cache entry written");
        self.prune_locked(&mut index).await?;
        self.write_index(&index).await
    }

    /// Return the cached bytes for `sha256_hex`, or run `download` and cache
    /// what it returns.
    ///
    /// Only one download per key runs at a time; a second caller waits and
    /// then reads what the first one stored.
    pub async fn get_or_put<F, Fut>(
        &self,
        sha256_hex: &str,
        now_epoch_ms: u64,
        download: F,
    ) -> Result<Option<Vec<u8>>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<Vec<u8>>>>,
    {
        let lock = Arc::clone(&self.key_locks.entry(sha256_hex.to_string()).or_default());
        let result = {
            let _guard = lock.lock().await;
            match self.get(sha256_hex, now_epoch_ms).await? {
                Some(bytes) => Ok(Some(bytes)),
                None => match download().await? {
                    Some(bytes) => {
                        self.put(sha256_hex, &bytes, now_epoch_ms).await?;
                        Ok(Some(bytes))
                    }
                    None => Ok(None),
                },
            }
        };
        drop(lock);
        self.key_locks
            .remove_if(sha256_hex, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    /// Record `manifest_bytes` as `application`'s current manifest and protect
    /// it and `module_keys` from pruning. Replaces any previous pin.
    pub async fn pin(
        &self,
        application_name: &str,
        manifest_bytes: &[u8],
        module_keys: &[String],
        fresh_at_epoch_ms: u64,
        now_epoch_ms: u64,
    ) -> Result<()> {
        let manifest_key = hex::encode(Sha256::digest(manifest_bytes));
        write_atomically(&self.entry_path(&manifest_key), manifest_bytes).await?;

        let mut index = self.index.lock().await;
        index.entries.insert(
            manifest_key.clone(),
            CacheEntry {
                size: manifest_bytes.len() as u64,
                last_used_at_epoch_ms: now_epoch_ms,
            },
        );
        index.pins.insert(
            application_name.to_string(),
            ApplicationPin {
                manifest: manifest_key,
                fresh_at_epoch_ms,
                modules: module_keys.to_vec(),
            },
        );
        tracing::info!(application = %application_name, modules = module_keys.len(), "Application pinned");
        self.prune_locked(&mut index).await?;
        self.write_index(&index).await
    }

    pub async fn unpin(&self, application_name: &str) -> Result<()> {
        let mut index = self.index.lock().await;
        if index.pins.shift_remove(application_name).is_some() {
            tracing::info!(application = %application_name, "Application unpinned");
            self.prune_locked(&mut index).await?;
            self.write_index(&index).await?;
        }
        Ok(())
    }

    /// The manifest `application` last pinned, if it is still readable.
    pub async fn pinned_manifest(
        &self,
        application_name: &str,
        now_epoch_ms: u64,
    ) -> Result<Option<LoadedManifest>> {
        let pin = self.index.lock().await.pins.get(application_name).cloned();
        let Some(pin) = pin else {
            return Ok(None);
        };
        let Some(bytes) = self.get(&pin.manifest, now_epoch_ms).await? else {
            return Ok(None);
        };
        LoadedManifest::parse(bytes, pin.fresh_at_epoch_ms).map(Some)
    }

    /// Evict least recently used unpinned entries until the cache fits its
    /// size bound. Returns how many entries were evicted.
    pub async fn prune(&self) -> Result<usize> {
        let mut index = self.index.lock().await;
        let evicted = self.prune_locked(&mut index).await?;
        if evicted > 0 {
            self.write_index(&index).await?;
        }
        Ok(evicted)
    }

    async fn prune_locked(&self, index: &mut MutexGuard<'_, CacheIndex>) -> Result<usize> {
        let mut total = index.total_size();
        if total <= self.max_size_in_bytes {
            return Ok(0);
        }

        let mut candidates: Vec<(String, CacheEntry)> = {
            let pinned = index.pinned_keys();
            index
                .entries
                .iter()
                .filter(|(key, _)| !pinned.contains(key.as_str()))
                .map(|(key, entry)| (key.clone(), entry.clone()))
                .collect()
        };
        candidates.sort_by_key(|(_, entry)| entry.last_used_at_epoch_ms);

        let mut evicted = 0;
        for (key, entry) in candidates {
            if total <= self.max_size_in_bytes {
                break;
            }
            index.entries.shift_remove(&key);
            remove_if_exists(&self.entry_path(&key)).await?;
            total -= entry.size;
            evicted += 1;
        }

        tracing::info!(
            evicted,
            total_size = total,
            max_size = self.max_size_in_bytes,
            "Cache pruned"
        );
        Ok(evicted)
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.directory.join(ENTRIES_DIR).join(key)
    }

    async fn write_index(&self, index: &CacheIndex) -> Result<()> {
        let json = serde_json::to_vec_pretty(index)?;
        write_atomically(&self.directory.join(INDEX_FILE), &json).await
    }
}

async fn read_index(path: &Path) -> CacheIndex {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return CacheIndex::default(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Cache index unreadable, starting empty");
            return CacheIndex::default();
        }
    };
    serde_json::from_slice(&bytes).unwrap_or_else(|e| {
        tracing::warn!(path = %path.display(), error = %e, "Cache index is corrupt, starting empty");
        CacheIndex::default()
    })
}

/// Write `bytes` to a uniquely named temporary file beside `path`, then
/// rename it over `path`. Concurrent writers of one path each rename a
/// complete file into place.
pub(crate) async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let path = path.to_path_buf();
    let bytes = bytes.to_vec();
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let directory = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let mut temp = tempfile::NamedTempFile::new_in(directory)?;
        temp.write_all(&bytes)?;
        temp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(|e| LoaderError::Cache(format!("write task failed: {e}")))??;
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn key(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    #[tokio::test]
    async fn put_then_get() {
        let dir = TempDir::new().unwrap();
        let cache = ZiplineCache::open(dir.path(), 1024).await.unwrap();

        let alpha = b"alpha".to_vec();
        assert_eq!(cache.get(&key(&alpha), 1).await.unwrap(), None);
        cache.put(&key(&alpha), &alpha, 1).await.unwrap();
        assert_eq!(cache.get(&key(&alpha), 2).await.unwrap(), Some(alpha.clone()));
        assert_eq!(cache.total_size().await, 5);
        assert!(dir.path().join("entries").join(key(&alpha)).exists());
    }

    #[tokio::test]
    async fn put_rejects_content_that_does_not_match_key() {
        let dir = TempDir::new().unwrap();
        let cache = ZiplineCache::open(dir.path(), 1024).await.unwrap();

        let error = cache.put(&key(b"alpha"), b"bravo", 1).await.unwrap_err();
        assert!(error.to_string().starts_with("cache error: content hashes to"), "{error}");
        assert!(!cache.contains(&key(b"alpha")).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_puts_of_one_key_all_succeed() {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(ZiplineCache::open(dir.path(), 1024).await.unwrap());
        let alpha = b"alpha".to_vec();

        for round in 0..50 {
            let writers: Vec<_> = (0..4)
                .map(|_| {
                    let cache = cache.clone();
                    let alpha = alpha.clone();
                    tokio::spawn(async move { cache.put(&key(&alpha), &alpha, round).await })
                })
                .collect();
            for writer in writers {
                writer.await.unwrap().unwrap();
            }
        }

        assert_eq!(cache.get(&key(&alpha), 100).await.unwrap(), Some(alpha.clone()));
        assert_eq!(cache.total_size().await, 5);
        let files = std::fs::read_dir(dir.path().join("entries")).unwrap().count();
        assert_eq!(files, 1);
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let cache = ZiplineCache::open(dir.path(), 1024).await.unwrap();
            cache.put(&key(b"alpha"), b"alpha", 1).await.unwrap();
        }
        std::fs::write(dir.path().join("entries").join("partial.tmp"), b"junk").unwrap();

        let cache = ZiplineCache::open(dir.path(), 1024).await.unwrap();
        assert_eq!(cache.get(&key(b"alpha"), 2).await.unwrap(), Some(b"alpha".to_vec()));
        assert!(!dir.path().join("entries").join("partial.tmp").exists());
    }

    #[tokio::test]
    async fn corrupt_entries_are_dropped() {
        let dir = TempDir::new().unwrap();
        let cache = ZiplineCache::open(dir.path(), 1024).await.unwrap();
        cache.put(&key(b"alpha"), b"alpha", 1).await.unwrap();
        std::fs::write(dir.path().join("entries").join(key(b"alpha")), b"alpha!").unwrap();

        assert_eq!(cache.get(&key(b"alpha"), 2).await.unwrap(), None);
        assert!(!cache.contains(&key(b"alpha")).await);
    }

    #[tokio::test]
    async fn prunes_least_recently_used() {
        let dir = TempDir::new().unwrap();
        let cache = ZiplineCache::open(dir.path(), 10).await.unwrap();

        cache.put(&key(b"aaaa"), b"aaaa", 1).await.unwrap();
        cache.put(&key(b"bbbb"), b"bbbb", 2).await.unwrap();
        // Touch "aaaa" so "bbbb" is the oldest.
        cache.get(&key(b"aaaa"), 3).await.unwrap();
        cache.put(&key(b"cccc"), b"cccc", 4).await.unwrap();

        assert!(cache.contains(&key(b"aaaa")).await);
        assert!(!cache.contains(&key(b"bbbb")).await);
        assert!(cache.contains(&key(b"cccc")).await);
        assert_eq!(cache.total_size().await, 8);
        assert!(!dir.path().join("entries").join(key(b"bbbb")).exists());
    }

    #[tokio::test]
    async fn pinned_entries_are_not_pruned() {
        let dir = TempDir::new().unwrap();
        let cache = ZiplineCache::open(dir.path(), 12).await.unwrap();
        let manifest = br#"{}"#;

        cache.put(&key(b"aaaa"), b"aaaa", 1).await.unwrap();
        cache
            .pin("red", manifest, &[key(b"aaaa")], 1, 1)
            .await
            .unwrap();
        cache.put(&key(b"bbbb"), b"bbbb", 2).await.unwrap();
        cache.put(&key(b"cccc"), b"cccc", 3).await.unwrap();

        assert!(cache.contains(&key(b"aaaa")).await);
        assert!(cache.contains(&key(manifest)).await);
        assert!(!cache.contains(&key(b"bbbb")).await);
        assert!(cache.contains(&key(b"cccc")).await);

        cache.unpin("red").await.unwrap();
        cache.put(&key(b"dddd"), b"dddd", 4).await.unwrap();
        assert!(!cache.contains(&key(b"aaaa")).await);
    }

    #[tokio::test]
    async fn pinned_manifest_round_trip() {
        let dir = TempDir::new().unwrap();
        let cache = ZiplineCache::open(dir.path(), 1024).await.unwrap();
        let manifest = br#"{"mainModuleId":"alpha","mainFunction":"main","modules":{}}"#;

        assert_eq!(cache.pinned_manifest("red", 1).await.unwrap(), None);
        cache.pin("red", manifest, &[], 7, 8).await.unwrap();

        let loaded = cache.pinned_manifest("red", 9).await.unwrap().unwrap();
        assert_eq!(loaded.manifest_bytes, manifest);
        assert_eq!(loaded.fresh_at_epoch_ms, 7);
        assert_eq!(loaded.manifest.main_module_id(), "alpha");
    }

    #[tokio::test]
    async fn get_or_put_downloads_once() {
        let dir = TempDir::new().unwrap();
        let cache = ZiplineCache::open(dir.path(), 1024).await.unwrap();
        let downloads = AtomicUsize::new(0);
        let alpha = key(b"alpha");

        let downloads = &downloads;
        let download = move || async move {
            downloads.fetch_add(1, Ordering::SeqCst);
            Ok::<_, LoaderError>(Some(b"alpha".to_vec()))
        };
        let (first, second) = tokio::join!(
            cache.get_or_put(&alpha, 1, download),
            cache.get_or_put(&alpha, 1, download),
        );

        assert_eq!(first.unwrap(), Some(b"alpha".to_vec()));
        assert_eq!(second.unwrap(), Some(b"alpha".to_vec()));
        assert_eq!(downloads.load(Ordering::SeqCst), 1);
        assert!(cache.key_locks.is_empty());
    }

    #[tokio::test]
    async fn get_or_put_passes_through_misses() {
        let dir = TempDir::new().unwrap();
        let cache = ZiplineCache::open(dir.path(), 1024).await.unwrap();

        let result = cache
            .get_or_put(&key(b"alpha"), 1, || async { Ok(None) })
            .await
            .unwrap();
        assert_eq!(result, None);
        assert_eq!(cache.total_size().await, 0);
    }
}

use super::{
    eviction_candidates, payload_size, CacheIndex, CacheRecord, FileMetadataStore,
    FsReferenceResolver, MetadataStore, ReferenceResolver, INDEX_KEY,
};
use crate::config::CacheConfig;
use crate::download::Downloader;
use crate::error::CacheError;
use chrono::{DateTime, Utc};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::{Mutex, MutexGuard};

/// Size-bounded, persistent cache of downloaded videos keyed by source uri.
///
/// Every mutating operation reloads the index from the [`MetadataStore`], applies its change,
/// runs an eviction pass where the size may have grown, and writes the index back, all while
/// holding a single write lock. Failures are logged and never returned: to a caller, anything
/// that went wrong looks like a cache miss.
pub struct VideoCache {
    store: Arc<dyn MetadataStore>,
    resolver: Arc<dyn ReferenceResolver>,
    downloader: Arc<dyn Downloader>,
    write_lock: Mutex<()>,
}

impl VideoCache {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        resolver: Arc<dyn ReferenceResolver>,
        downloader: Arc<dyn Downloader>,
    ) -> Self {
        Self {
            store,
            resolver,
            downloader,
            write_lock: Mutex::new(()),
        }
    }

    /// Opens the cache persisted under `config.cache_dir`.
    ///
    /// Applies the configured ceiling, if any, and purges whatever no longer fits.
    pub async fn open(
        config: &CacheConfig,
        downloader: Arc<dyn Downloader>,
    ) -> Result<Self, CacheError> {
        let store = FileMetadataStore::new(&config.cache_dir, INDEX_KEY).await?;
        let resolver = FsReferenceResolver::new(vec![config.cache_dir.clone()]);
        let cache = Self::new(Arc::new(store), Arc::new(resolver), downloader);

        match config.max_size {
            Some(max_size) => cache.set_capacity(max_size).await,
            None => cache.purge().await,
        }
        Ok(cache)
    }

    /// Downloads `uri` unless a live copy is already cached.
    ///
    /// The write lock is not held while downloading.
    pub async fn prefetch(&self, uri: &str) {
        if let Err(err) = url::Url::parse(uri) {
            tracing::warn!(%uri, %err, "ignoring prefetch of invalid uri");
            return;
        }
        if self.lookup(uri).await.is_some() {
            tracing::debug!(%uri, "already cached");
            return;
        }

        match self.downloader.download(uri).await {
            Ok(location) => self.store(&location, uri).await,
            Err(err) => {
                let err = CacheError::from(err);
                tracing::warn!(%uri, error = %err, "prefetch failed");
                self.evict(uri).await;
            }
        }
    }

    /// Takes ownership of the payload at `local_path` as the cached copy of `uri`.
    ///
    /// Older records for `uri` pointing at a different payload are evicted first. Storing the
    /// same payload again only refreshes its access time.
    pub async fn store(&self, local_path: &Path, uri: &str) {
        let Some((_guard, mut index)) = self.begin().await else {
            return;
        };
        if let Err(err) = self.store_locked(&mut index, local_path, uri).await {
            // 下载下来的文件留在原处，不做清理
            tracing::error!(%uri, path = %local_path.display(), error = %err, "failed to store payload");
            return;
        }
        self.purge_locked(&mut index).await;
        self.commit(&index).await;
    }

    /// Current location of the cached copy of `uri`, if it still exists.
    ///
    /// A stale record is reported as a miss but left in the index.
    pub async fn lookup(&self, uri: &str) -> Option<PathBuf> {
        let index = match self.load_index().await {
            Ok(index) => index,
            Err(err) => {
                tracing::error!(error = %err, "failed to load cache index");
                return None;
            }
        };
        let record = index.find(uri)?;
        let location = self.resolver.resolve(&record.file_reference);
        if location.is_none() {
            tracing::debug!(%uri, "cached payload is gone");
        }
        location
    }

    /// Looks up `uri` for playback, marking it as used on a hit.
    pub async fn cached_location(&self, uri: &str) -> Option<PathBuf> {
        let location = self.lookup(uri).await?;
        self.touch_access(uri, Utc::now()).await;
        Some(location)
    }

    pub async fn touch_access(&self, uri: &str, when: DateTime<Utc>) {
        let Some((_guard, mut index)) = self.begin().await else {
            return;
        };
        if index.touch_record(uri, when) {
            self.commit(&index).await;
        }
    }

    /// Deletes the cached payload of `uri` and forgets about it.
    ///
    /// The records are dropped even if the file could not be removed.
    pub async fn evict(&self, uri: &str) {
        let Some((_guard, mut index)) = self.begin().await else {
            return;
        };
        if self.evict_locked(&mut index, uri).await {
            self.commit(&index).await;
        }
    }

    /// Evicts `uri` and aborts any download of it still in flight.
    pub async fn remove(&self, uri: &str) {
        self.downloader.cancel_download(uri);
        self.evict(uri).await;
    }

    pub async fn clear(&self) {
        let Some((_guard, mut index)) = self.begin().await else {
            return;
        };
        let uris = index.uris();
        self.evict_many_locked(&mut index, &uris).await;
        self.commit(&index).await;
    }

    /// Replaces the ceiling and evicts down to it right away.
    pub async fn set_capacity(&self, max_size: u64) {
        if max_size == 0 {
            let err = CacheError::InvalidCapacity(max_size);
            tracing::warn!(error = %err, "ignoring capacity change");
            return;
        }
        let Some((_guard, mut index)) = self.begin().await else {
            return;
        };
        index.set_max_size(max_size);
        tracing::info!(max_size, current_size = index.current_size(), "cache capacity changed");
        self.purge_locked(&mut index).await;
        self.commit(&index).await;
    }

    /// Runs an eviction pass against the persisted index.
    pub async fn purge(&self) {
        let Some((_guard, mut index)) = self.begin().await else {
            return;
        };
        if self.purge_locked(&mut index).await {
            self.commit(&index).await;
        }
    }

    /// A copy of the persisted index.
    pub async fn snapshot(&self) -> Result<CacheIndex, CacheError> {
        self.load_index().await
    }

    async fn begin(&self) -> Option<(MutexGuard<'_, ()>, CacheIndex)> {
        let guard = self.write_lock.lock().await;
        match self.load_index().await {
            Ok(index) => Some((guard, index)),
            Err(err) => {
                tracing::error!(error = %err, "failed to load cache index");
                None
            }
        }
    }

    async fn commit(&self, index: &CacheIndex) {
        let result = match index.to_vec() {
            Ok(data) => self.store.save(&data).await.map_err(CacheError::from),
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            tracing::error!(error = %err, "failed to persist cache index");
        }
    }

    /// Loads the index. An undecodable blob is replaced by an empty index.
    async fn load_index(&self) -> Result<CacheIndex, CacheError> {
        let Some(data) = self.store.load().await? else {
            return Ok(CacheIndex::default());
        };
        match CacheIndex::from_slice(&data) {
            Ok(index) => Ok(index),
            Err(err) => {
                tracing::warn!(error = %err, "discarding unreadable cache index");
                Ok(CacheIndex::default())
            }
        }
    }

    async fn store_locked(
        &self,
        index: &mut CacheIndex,
        local_path: &Path,
        uri: &str,
    ) -> Result<(), CacheError> {
        let reference = self.resolver.materialize(local_path)?;

        // 同一个 uri 重复下载出不同文件时，删除旧的
        let conflicting: Vec<CacheRecord> = index
            .records_for(uri)
            .filter(|r| r.file_reference != reference)
            .cloned()
            .collect();
        let references: Vec<_> = conflicting.iter().map(|r| &r.file_reference).collect();
        let locations = self.resolver.resolve_all(&references);
        for (record, location) in conflicting.iter().zip(locations) {
            match location {
                Some(path) if path != reference.path => self.delete_payload(record, &path).await,
                _ => {}
            }
        }
        if !conflicting.is_empty() {
            index.remove_records(|r| r.uri == uri && r.file_reference != reference);
            tracing::info!(%uri, count = conflicting.len(), "replaced conflicting records");
        }

        if index.find(uri).is_some() {
            tracing::debug!(%uri, "payload already cached, refreshing access time");
            index.touch_record(uri, Utc::now());
            return Ok(());
        }

        let byte_size = payload_size(&reference.path);
        tracing::info!(%uri, byte_size, path = %reference.path.display(), "stored payload");
        index.add_record(CacheRecord::new(uri, reference, byte_size));
        Ok(())
    }

    /// Returns whether anything was removed from `index`.
    async fn evict_locked(&self, index: &mut CacheIndex, uri: &str) -> bool {
        self.evict_many_locked(index, &[uri.to_owned()]).await
    }

    /// Evicts every uri in `uris`, resolving all their references in one pass.
    async fn evict_many_locked(&self, index: &mut CacheIndex, uris: &[String]) -> bool {
        let records: Vec<CacheRecord> = index
            .records()
            .iter()
            .filter(|r| uris.contains(&r.uri))
            .cloned()
            .collect();
        if records.is_empty() {
            return false;
        }

        let references: Vec<_> = records.iter().map(|r| &r.file_reference).collect();
        let locations = self.resolver.resolve_all(&references);
        for (record, location) in records.iter().zip(locations) {
            match location {
                Some(path) => self.delete_payload(record, &path).await,
                None => {
                    let err = CacheError::StaleReference(record.uri.clone());
                    tracing::debug!(error = %err, "nothing to delete");
                }
            }
        }

        for uri in uris {
            let removed = index.remove_records(|r| &r.uri == uri);
            if removed.is_empty() {
                continue;
            }
            let freed = removed.iter().map(|r| r.byte_size).sum::<u64>();
            tracing::info!(%uri, freed, current_size = index.current_size(), "evicted");
        }
        true
    }

    /// Returns whether anything was evicted.
    async fn purge_locked(&self, index: &mut CacheIndex) -> bool {
        let candidates = eviction_candidates(index);
        if candidates.is_empty() {
            return false;
        }
        tracing::info!(
            current_size = index.current_size(),
            max_size = index.max_size(),
            count = candidates.len(),
            "cache over capacity, purging"
        );
        self.evict_many_locked(index, &candidates).await
    }

    /// Removes the payload of `record`, already resolved to `path`, from disk.
    ///
    /// Failures are logged only.
    async fn delete_payload(&self, record: &CacheRecord, path: &Path) {
        let result = match fs::metadata(path).await {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).await,
            Ok(_) => fs::remove_file(path).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => tracing::debug!(uri = %record.uri, path = %path.display(), "deleted payload"),
            Err(source) if source.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                let err = CacheError::Deletion {
                    path: path.to_path_buf(),
                    source,
                };
                tracing::warn!(uri = %record.uri, error = %err, "failed to delete cached payload");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryMetadataStore;
    use crate::error::DownloadError;
    use async_trait::async_trait;

    struct NoDownloads;

    #[async_trait]
    impl Downloader for NoDownloads {
        async fn download(&self, uri: &str) -> Result<PathBuf, DownloadError> {
            Err(DownloadError::InvalidUri(uri.to_owned()))
        }

        fn cancel_download(&self, _uri: &str) {}
    }

    fn cache_in(dir: &Path) -> VideoCache {
        VideoCache::new(
            Arc::new(MemoryMetadataStore::new()),
            Arc::new(FsReferenceResolver::new(vec![dir.to_path_buf()])),
            Arc::new(NoDownloads),
        )
    }

    fn payload(dir: &Path, name: &str, size: usize) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, vec![7u8; size]).unwrap();
        path
    }

    fn assert_size_invariant(index: &CacheIndex) {
        let sum: u64 = index.records().iter().map(|r| r.byte_size).sum();
        assert_eq!(index.current_size(), sum);
    }

    #[tokio::test]
    async fn test_store_then_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path());
        let file = payload(dir.path(), "a.mp4", 16);

        cache.store(&file, "http://x/a.mp4").await;
        let found = cache.lookup("http://x/a.mp4").await.unwrap();
        assert_eq!(std::fs::read(found).unwrap(), vec![7u8; 16]);

        let index = cache.snapshot().await.unwrap();
        assert_eq!(index.current_size(), 16);
        assert_size_invariant(&index);
    }

    #[tokio::test]
    async fn test_threshold_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path());
        cache.set_capacity(100).await;

        let a = payload(dir.path(), "a", 50);
        let b = payload(dir.path(), "b", 40);
        cache.store(&a, "a").await;
        cache.store(&b, "b").await;
        assert_eq!(cache.snapshot().await.unwrap().current_size(), 90);
        assert!(a.exists());

        let c = payload(dir.path(), "c", 30);
        cache.store(&c, "c").await;

        let index = cache.snapshot().await.unwrap();
        assert_eq!(index.current_size(), 70);
        assert_eq!(index.uris(), vec!["b".to_owned(), "c".to_owned()]);
        assert!(!a.exists());
        assert!(b.exists() && c.exists());
    }

    #[tokio::test]
    async fn test_touch_protects_from_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path());
        cache.set_capacity(100).await;

        cache.store(&payload(dir.path(), "a", 50), "a").await;
        cache.store(&payload(dir.path(), "b", 40), "b").await;
        cache
            .touch_access("a", Utc::now() + chrono::Duration::hours(1))
            .await;
        cache.store(&payload(dir.path(), "c", 30), "c").await;

        let index = cache.snapshot().await.unwrap();
        assert_eq!(index.uris(), vec!["a".to_owned(), "c".to_owned()]);
        assert_eq!(index.current_size(), 80);
    }

    #[tokio::test]
    async fn test_shrinking_capacity_evicts() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path());
        cache.set_capacity(1000).await;
        for name in ["a", "b", "c"] {
            cache.store(&payload(dir.path(), name, 10), name).await;
        }
        assert_eq!(cache.snapshot().await.unwrap().records().len(), 3);

        cache.set_capacity(10).await;
        let index = cache.snapshot().await.unwrap();
        // target = 2 + 20 = 22, three records of 10 are needed
        assert!(index.is_empty());
        assert_eq!(index.current_size(), 0);
        assert_eq!(index.max_size(), 10);
    }

    #[tokio::test]
    async fn test_zero_capacity_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path());
        cache.set_capacity(0).await;
        assert_eq!(
            cache.snapshot().await.unwrap().max_size(),
            crate::cache::DEFAULT_MAX_SIZE
        );
    }

    #[tokio::test]
    async fn test_restore_with_new_payload_replaces_old() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path());
        let old = payload(dir.path(), "old.mp4", 10);
        let new = payload(dir.path(), "new.mp4", 20);

        cache.store(&old, "v").await;
        cache.store(&new, "v").await;

        let index = cache.snapshot().await.unwrap();
        assert_eq!(index.records().len(), 1);
        assert_eq!(index.current_size(), 20);
        assert!(!old.exists());
        assert!(new.exists());
    }

    #[tokio::test]
    async fn test_restore_same_payload_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path());
        let file = payload(dir.path(), "a.mp4", 10);

        cache.store(&file, "v").await;
        cache.store(&file, "v").await;

        let index = cache.snapshot().await.unwrap();
        assert_eq!(index.records().len(), 1);
        assert_eq!(index.current_size(), 10);
        assert!(file.exists());
    }

    #[tokio::test]
    async fn test_store_missing_file_adds_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path());
        cache.store(&dir.path().join("missing"), "v").await;
        assert!(cache.snapshot().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_evict_twice_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path());
        let file = payload(dir.path(), "a.mp4", 10);
        cache.store(&file, "a").await;
        cache.store(&payload(dir.path(), "b.mp4", 5), "b").await;

        cache.evict("a").await;
        assert!(!file.exists());
        let after_first = cache.snapshot().await.unwrap();
        cache.evict("a").await;
        assert_eq!(cache.snapshot().await.unwrap(), after_first);
        assert_eq!(after_first.current_size(), 5);
    }

    #[tokio::test]
    async fn test_evict_unknown_uri() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path());
        cache.store(&payload(dir.path(), "a.mp4", 10), "a").await;
        let before = cache.snapshot().await.unwrap();

        cache.evict("nope").await;
        assert_eq!(cache.snapshot().await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_stale_reference() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path());
        let file = payload(dir.path(), "a.mp4", 10);
        cache.store(&file, "a").await;

        std::fs::remove_file(&file).unwrap();
        assert_eq!(cache.lookup("a").await, None);
        // lookup does not drop the record
        assert_eq!(cache.snapshot().await.unwrap().records().len(), 1);

        cache.evict("a").await;
        assert!(cache.snapshot().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_directory_payload() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path());
        let hls = dir.path().join("hls");
        std::fs::create_dir(&hls).unwrap();
        payload(&hls, "0.ts", 30);
        payload(&hls, "1.ts", 12);

        cache.store(&hls, "stream").await;
        assert_eq!(cache.snapshot().await.unwrap().current_size(), 42);

        cache.evict("stream").await;
        assert!(!hls.exists());
    }

    #[tokio::test]
    async fn test_clear() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path());
        let files: Vec<_> = ["a", "b", "c"]
            .into_iter()
            .map(|name| {
                let file = payload(dir.path(), name, 3);
                (name, file)
            })
            .collect();
        for (name, file) in &files {
            cache.store(file, name).await;
        }

        cache.clear().await;
        let index = cache.snapshot().await.unwrap();
        assert!(index.is_empty());
        assert_eq!(index.current_size(), 0);
        assert!(files.iter().all(|(_, file)| !file.exists()));
    }

    #[tokio::test]
    async fn test_unreadable_index_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryMetadataStore::new());
        store.save(b"garbage").await.unwrap();
        let cache = VideoCache::new(
            store,
            Arc::new(FsReferenceResolver::new(vec![dir.path().to_path_buf()])),
            Arc::new(NoDownloads),
        );

        assert!(cache.snapshot().await.unwrap().is_empty());
        cache.store(&payload(dir.path(), "a", 4), "a").await;
        assert_eq!(cache.snapshot().await.unwrap().current_size(), 4);
    }

    #[tokio::test]
    async fn test_failed_prefetch_clears_stale_record() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path());
        let file = payload(dir.path(), "a.mp4", 10);
        cache.store(&file, "http://x/a.mp4").await;
        std::fs::remove_file(&file).unwrap();

        cache.prefetch("http://x/a.mp4").await;
        assert!(cache.snapshot().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_record_never_claims_another_file() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path());
        let file = payload(dir.path(), "a.mp4", 10);
        cache.store(&file, "a").await;

        // 删除后新文件很可能复用同一个 inode
        std::fs::remove_file(&file).unwrap();
        let unrelated = payload(dir.path(), "unrelated.bin", 10);

        assert_eq!(cache.lookup("a").await, None);
        cache.evict("a").await;
        assert!(unrelated.exists());
        assert!(cache.snapshot().await.unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_deletion_still_drops_record() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path());
        let locked = dir.path().join("locked");
        std::fs::create_dir(&locked).unwrap();
        let file = payload(&locked, "a.mp4", 10);
        cache.store(&file, "a").await;
        cache.store(&payload(dir.path(), "b.mp4", 4), "b").await;

        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o555)).unwrap();
        // privileged users ignore directory permissions
        let writable = std::fs::write(locked.join("check"), b"").is_ok();
        if !writable {
            cache.evict("a").await;

            let index = cache.snapshot().await.unwrap();
            assert!(index.find("a").is_none());
            assert_eq!(index.current_size(), 4);
            assert!(file.exists());
        }
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
}

//! Local write-back staging area in front of the distributed store.
//!
//! Writes land in a local file and mark the entry dirty; a background task
//! commits dirty entries later. Misses are fetched once no matter how many
//! callers ask concurrently, and clean entries are evicted least recently used
//! first when the cache grows past its maximum size.

mod locks;
mod sync;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use futures::stream::{self, StreamExt};
use md5::{Digest, Md5};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use sync::SyncHandle;

use crate::config::{format_byte_size, StorageConfig};
use crate::engine::DistributedStore;
use crate::error::StorageError;
use crate::metastore::{CacheRecord, MetaStore};
use crate::metrics::SharedMetrics;
use locks::KeyedLocks;

/// Cache tuning, usually derived from [`StorageConfig`].
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub cache_dir: PathBuf,
    pub max_size: u64,
    pub sync_interval: Duration,
    pub quiet_period: Duration,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub flush_max_attempts: u32,
    pub sync_concurrency: usize,
}

impl From<&StorageConfig> for CacheSettings {
    fn from(config: &StorageConfig) -> Self {
        Self {
            cache_dir: config.cache_dir.clone(),
            max_size: config.cache_max_size,
            sync_interval: config.sync_interval,
            quiet_period: config.sync_quiet_period,
            retry_base_delay: config.retry_base_delay,
            retry_max_delay: config.retry_max_delay,
            flush_max_attempts: config.flush_max_attempts,
            sync_concurrency: config.sync_concurrency,
        }
    }
}

/// Snapshot of one cached object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentCacheEntry {
    pub data_id: String,
    /// Local file holding the plaintext.
    pub path: PathBuf,
    pub size: u64,
    pub dirty: bool,
    pub uploaded_size: u64,
    pub last_upload_time: Option<DateTime<Utc>>,
    pub last_access_time: DateTime<Utc>,
    pub marked_for_deletion: bool,
}

#[derive(Debug, Clone)]
struct EntryState {
    size: u64,
    dirty: bool,
    // bumped by every local write
    version: u64,
    // highest version known to be committed remotely
    synced_version: u64,
    uploaded_size: u64,
    last_upload_time: Option<i64>,
    last_access_time: i64,
    access_tick: u64,
    // access_tick as last written to the metadata store
    persisted_tick: u64,
    last_write: Instant,
    marked_for_deletion: bool,
    failed_attempts: u32,
    next_attempt: Option<Instant>,
}

impl EntryState {
    fn from_record(record: &CacheRecord, size: u64, quiet_period: Duration) -> Self {
        let now = Instant::now();
        let dirty = record.dirty || size != record.size;
        Self {
            size,
            dirty,
            version: u64::from(dirty),
            synced_version: 0,
            uploaded_size: record.uploaded_size,
            last_upload_time: record.last_upload_time,
            last_access_time: record.last_access_time,
            access_tick: record.access_tick,
            persisted_tick: record.access_tick,
            // resumed entries are due right away
            last_write: now.checked_sub(quiet_period).unwrap_or(now),
            marked_for_deletion: false,
            failed_attempts: 0,
            next_attempt: None,
        }
    }

    /// Earliest instant the background sync may pick this entry up.
    fn due(&self, quiet_period: Duration) -> Instant {
        let quiet_until = sync::deadline(self.last_write, quiet_period);
        match self.next_attempt {
            Some(retry_at) if retry_at > quiet_until => retry_at,
            _ => quiet_until,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncMode {
    /// Honors the quiet period and retry backoff.
    Background,
    /// Explicit flush or eviction pressure.
    Forced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncOutcome {
    Committed(u64),
    Clean,
    Deferred(Instant),
}

type FetchFuture = BoxFuture<'static, Result<ContentCacheEntry, StorageError>>;

struct Inner {
    objects_dir: PathBuf,
    tmp_dir: PathBuf,
    settings: CacheSettings,
    engine: Arc<DistributedStore>,
    meta: MetaStore,
    metrics: SharedMetrics,
    entries: Mutex<HashMap<String, EntryState>>,
    // guards the local file of an entry
    content_locks: KeyedLocks,
    // one generation in flight per id; always taken before the content lock
    sync_locks: KeyedLocks,
    inflight: Mutex<HashMap<String, WeakShared<FetchFuture>>>,
    tick: AtomicU64,
    dirty: Notify,
}

/// The write-back content cache. Cheap to clone.
#[derive(Clone)]
pub struct ContentCache {
    inner: Arc<Inner>,
}

impl fmt::Debug for ContentCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentCache")
            .field("objects_dir", &self.inner.objects_dir)
            .field("max_size", &self.inner.settings.max_size)
            .finish_non_exhaustive()
    }
}

impl ContentCache {
    /// Opens the cache directory and reloads the persisted entries. Entries
    /// whose local file vanished are dropped; dirty entries are picked up by
    /// the next sync.
    pub async fn open(
        settings: CacheSettings,
        engine: Arc<DistributedStore>,
        metrics: SharedMetrics,
    ) -> Result<Self, StorageError> {
        let objects_dir = settings.cache_dir.join("objects");
        let tmp_dir = settings.cache_dir.join("tmp");
        fs::create_dir_all(&objects_dir).await?;
        fs::create_dir_all(&tmp_dir).await?;

        let mut leftovers = fs::read_dir(&tmp_dir).await?;
        while let Some(entry) = leftovers.next_entry().await? {
            let _ = fs::remove_file(entry.path()).await;
        }

        let meta = engine.meta().clone();
        let mut entries = HashMap::new();
        let mut max_tick = 0;
        for record in meta.cache_records()? {
            let path = objects_dir.join(local_name(&record.data_id));
            match fs::metadata(&path).await {
                Ok(file) if file.is_file() => {
                    max_tick = max_tick.max(record.access_tick);
                    let state = EntryState::from_record(&record, file.len(), settings.quiet_period);
                    entries.insert(record.data_id.clone(), state);
                }
                _ => {
                    warn!(data_id = %record.data_id, "Dropping cache entry without local content");
                    meta.remove_cache_record(&record.data_id)?;
                }
            }
        }

        let known: HashSet<String> = entries.keys().map(|id| local_name(id)).collect();
        let mut files = fs::read_dir(&objects_dir).await?;
        while let Some(entry) = files.next_entry().await? {
            if !known.contains(entry.file_name().to_string_lossy().as_ref()) {
                debug!(path = %entry.path().display(), "Removing orphaned cache file");
                let _ = fs::remove_file(entry.path()).await;
            }
        }

        let dirty = entries.values().filter(|e| e.dirty).count();
        let usage: u64 = entries.values().map(|e| e.size).sum();
        info!(
            entries = entries.len(),
            dirty,
            usage = %format_byte_size(usage),
            max_size = %format_byte_size(settings.max_size),
            "Opened content cache at {}",
            settings.cache_dir.display()
        );

        Ok(Self {
            inner: Arc::new(Inner {
                objects_dir,
                tmp_dir,
                settings,
                engine,
                meta,
                metrics,
                entries: Mutex::new(entries),
                content_locks: KeyedLocks::default(),
                sync_locks: KeyedLocks::default(),
                inflight: Mutex::new(HashMap::new()),
                tick: AtomicU64::new(max_tick + 1),
                dirty: Notify::new(),
            }),
        })
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.inner.settings
    }

    /// Current entry for `data_id`, without counting as an access.
    pub fn entry(&self, data_id: &str) -> Option<ContentCacheEntry> {
        self.entries()
            .get(data_id)
            .map(|state| self.snapshot(data_id, state))
    }

    pub fn list(&self) -> Vec<ContentCacheEntry> {
        let mut entries: Vec<_> = self
            .entries()
            .iter()
            .map(|(id, state)| self.snapshot(id, state))
            .collect();
        entries.sort_by(|a, b| a.data_id.cmp(&b.data_id));
        entries
    }

    /// Bytes held locally.
    pub fn usage(&self) -> u64 {
        self.entries().values().map(|e| e.size).sum()
    }

    pub fn is_dirty(&self, data_id: &str) -> bool {
        self.entries().get(data_id).is_some_and(|e| e.dirty)
    }

    pub fn dirty_ids(&self) -> Vec<String> {
        self.entries()
            .iter()
            .filter(|(_, e)| e.dirty && !e.marked_for_deletion)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Replaces the local content of `data_id` with exactly `length` bytes of
    /// `reader` and marks it dirty. Never touches the network, except when
    /// eviction has to sync an entry to make room.
    pub async fn write<R: AsyncRead + Unpin>(
        &self,
        data_id: &str,
        reader: R,
        length: u64,
    ) -> Result<(), StorageError> {
        {
            let _content = self.inner.content_locks.lock(data_id).await;

            let tmp = TempPath::new(&self.inner.tmp_dir);
            let mut file = fs::File::create(tmp.path()).await?;
            let copied = tokio::io::copy(&mut reader.take(length), &mut file).await?;
            if copied != length {
                return Err(StorageError::Encoding(format!(
                    "data '{}': expected {} bytes, input ended after {}",
                    data_id, length, copied
                )));
            }
            file.sync_data().await?;
            drop(file);

            let now = Instant::now();
            let access_time = Utc::now().timestamp_millis();
            let tick = self.next_tick();
            let apply = |state: &mut EntryState| {
                state.size = length;
                state.dirty = true;
                state.version += 1;
                state.last_write = now;
                state.last_access_time = access_time;
                state.access_tick = tick;
                state.persisted_tick = tick;
                state.failed_attempts = 0;
                state.next_attempt = None;
            };

            let mut staged = self.entries().get(data_id).cloned().unwrap_or(EntryState {
                size: 0,
                dirty: true,
                version: 0,
                synced_version: 0,
                uploaded_size: 0,
                last_upload_time: None,
                last_access_time: 0,
                access_tick: 0,
                persisted_tick: 0,
                last_write: now,
                marked_for_deletion: false,
                failed_attempts: 0,
                next_attempt: None,
            });
            apply(&mut staged);

            // dirty is durable before the new content becomes visible.
            // Syncs record their result under the content lock, so the live
            // state cannot change underneath us.
            self.persist(data_id, &staged)?;
            tmp.persist(&self.path_for(data_id)).await?;
            self.entries()
                .entry(data_id.to_string())
                .and_modify(|live| apply(live))
                .or_insert(staged);
            debug!(data_id, size = length, "Staged local write");
        }

        self.inner.dirty.notify_one();
        if let Err(e) = self.evict_if_needed(Some(data_id)).await {
            warn!(data_id, "Eviction after write failed: {}", e);
        }
        Ok(())
    }

    /// Returns the local entry, fetching and decoding it from the cloud stores
    /// on a miss.
    ///
    /// Concurrent misses for the same id share one fetch and all observe its
    /// result. Dropping every caller of an in-flight fetch cancels it without
    /// leaving an entry or temporary file behind.
    pub async fn get_or_fetch(&self, data_id: &str) -> Result<ContentCacheEntry, StorageError> {
        if let Some(entry) = self.touch(data_id) {
            self.inner.metrics.cache_hit();
            self.record_access(data_id).await;
            return Ok(entry);
        }
        self.inner.metrics.cache_miss();

        let fetch: Shared<FetchFuture> = {
            let mut inflight = self.inflight();
            match inflight.get(data_id).and_then(WeakShared::upgrade) {
                Some(fetch) => fetch,
                None => {
                    let cache = self.clone();
                    let id = data_id.to_string();
                    let fetch = async move {
                        let result = cache.fetch_into_cache(&id).await;
                        cache.inflight().remove(&id);
                        result
                    }
                    .boxed()
                    .shared();
                    if let Some(weak) = fetch.downgrade() {
                        inflight.insert(data_id.to_string(), weak);
                    }
                    fetch
                }
            }
        };
        fetch.await
    }

    /// Copies the content of `data_id` into `writer`, fetching it on a miss.
    pub async fn read<W: AsyncWrite + Unpin + ?Sized>(
        &self,
        data_id: &str,
        writer: &mut W,
    ) -> Result<u64, StorageError> {
        // an eviction or delete can slip in between the fetch and the read
        for _ in 0..3 {
            let entry = self.get_or_fetch(data_id).await?;
            let _content = self.inner.content_locks.lock(data_id).await;
            let present = self
                .entries()
                .get(data_id)
                .is_some_and(|e| !e.marked_for_deletion);
            if !present {
                continue;
            }
            let mut file = fs::File::open(&entry.path).await?;
            let copied = tokio::io::copy(&mut file, writer).await?;
            writer.flush().await?;
            return Ok(copied);
        }
        warn!(data_id, "Entry kept disappearing while being read");
        Err(StorageError::Cancelled)
    }

    /// Blocks until every write made to `data_id` before the call is
    /// committed remotely. Transient failures are retried with backoff up to
    /// the configured number of attempts.
    pub async fn flush(&self, data_id: &str) -> Result<(), StorageError> {
        if self.entries().get(data_id).map_or(true, |e| !e.dirty) {
            return Ok(());
        }

        let max_attempts = self.inner.settings.flush_max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.sync_entry(data_id, SyncMode::Forced).await {
                Ok(_) => return Ok(()),
                Err(e) if !e.is_retryable() || attempt >= max_attempts => return Err(e),
                Err(e) => {
                    let delay = sync::backoff(&self.inner.settings, attempt);
                    debug!(data_id, attempt, ?delay, "Flush failed, retrying: {}", e);
                    tokio::time::sleep(delay).await;
                    self.inner.engine.registry().refresh().await;
                }
            }
        }
    }

    /// Flushes every dirty entry. Returns the first error once all flushes
    /// finished.
    pub async fn flush_all(&self) -> Result<(), StorageError> {
        let results: Vec<_> = stream::iter(self.dirty_ids())
            .map(|id| async move { self.flush(&id).await })
            .buffer_unordered(self.inner.settings.sync_concurrency.max(1))
            .collect()
            .await;
        results.into_iter().collect()
    }

    /// Drops the local copy of a clean entry. Dirty entries are kept and
    /// `false` is returned.
    pub async fn evict(&self, data_id: &str) -> Result<bool, StorageError> {
        let removed = self.remove_clean(data_id).await?;
        if removed {
            self.inner.metrics.entries_evicted(1);
        } else {
            debug!(data_id, "Nothing to evict");
        }
        Ok(removed)
    }

    /// Removes the local copy, then every remote slice, descriptor and key.
    /// Waits for an in-flight sync of the same id. Returns whether anything
    /// existed.
    pub async fn delete(&self, data_id: &str) -> Result<bool, StorageError> {
        let _sync = self.inner.sync_locks.lock(data_id).await;
        let _content = self.inner.content_locks.lock(data_id).await;

        let local = match self.entries().get_mut(data_id) {
            Some(state) => {
                state.marked_for_deletion = true;
                true
            }
            None => false,
        };
        if local {
            remove_file_if_exists(&self.path_for(data_id)).await?;
            self.inner.meta.remove_cache_record(data_id)?;
            self.entries().remove(data_id);
        }

        let remote = self.inner.engine.delete(data_id).await?;
        Ok(local || remote)
    }

    /// Evicts clean entries, least recently used first, until usage is back
    /// under the maximum. When only dirty entries are left the oldest is
    /// synced first. `protect` is never evicted.
    async fn evict_if_needed(&self, protect: Option<&str>) -> Result<(), StorageError> {
        enum Victim {
            Clean(String),
            Dirty(String),
        }

        let max_size = self.inner.settings.max_size;
        let mut evicted: u64 = 0;
        let mut forced = HashSet::new();
        loop {
            let victim = {
                let entries = self.entries();
                let usage: u64 = entries.values().map(|e| e.size).sum();
                if usage <= max_size {
                    break;
                }
                let mut candidates: Vec<_> = entries
                    .iter()
                    .filter(|(id, e)| Some(id.as_str()) != protect && !e.marked_for_deletion)
                    .map(|(id, e)| (e.access_tick, id.clone(), e.dirty))
                    .collect();
                candidates.sort();

                if let Some((_, id, _)) = candidates.iter().find(|(_, _, dirty)| !dirty) {
                    Victim::Clean(id.clone())
                } else if let Some((_, id, _)) =
                    candidates.iter().find(|(_, id, _)| !forced.contains(id))
                {
                    Victim::Dirty(id.clone())
                } else {
                    break;
                }
            };

            match victim {
                Victim::Clean(id) => {
                    if self.remove_clean(&id).await? {
                        evicted += 1;
                    }
                }
                Victim::Dirty(id) => {
                    info!(data_id = %id, "Cache full of dirty entries, syncing the oldest");
                    forced.insert(id.clone());
                    self.sync_entry(&id, SyncMode::Forced).await?;
                }
            }
        }

        if evicted > 0 {
            self.inner.metrics.entries_evicted(evicted);
            info!(
                evicted,
                usage = %format_byte_size(self.usage()),
                max_size = %format_byte_size(max_size),
                "Evicted cache entries"
            );
        }
        Ok(())
    }

    async fn remove_clean(&self, data_id: &str) -> Result<bool, StorageError> {
        let _content = self.inner.content_locks.lock(data_id).await;
        let evictable = self
            .entries()
            .get(data_id)
            .is_some_and(|e| !e.dirty && !e.marked_for_deletion);
        if !evictable {
            return Ok(false);
        }
        remove_file_if_exists(&self.path_for(data_id)).await?;
        self.inner.meta.remove_cache_record(data_id)?;
        self.entries().remove(data_id);
        debug!(data_id, "Evicted local copy");
        Ok(true)
    }

    async fn fetch_into_cache(&self, data_id: &str) -> Result<ContentCacheEntry, StorageError> {
        let entry = {
            let _content = self.inner.content_locks.lock(data_id).await;
            // a write may have created the entry while we waited
            if let Some(entry) = self.touch(data_id) {
                return Ok(entry);
            }

            let (object, data) = self.inner.engine.fetch(data_id).await?;
            let tmp = TempPath::new(&self.inner.tmp_dir);
            fs::write(tmp.path(), &data).await?;

            let tick = self.next_tick();
            let state = EntryState {
                size: object.size,
                dirty: false,
                version: 0,
                synced_version: 0,
                uploaded_size: object.size,
                last_upload_time: Some(object.committed_at),
                last_access_time: Utc::now().timestamp_millis(),
                access_tick: tick,
                persisted_tick: tick,
                last_write: Instant::now(),
                marked_for_deletion: false,
                failed_attempts: 0,
                next_attempt: None,
            };
            let path = self.path_for(data_id);
            tmp.persist(&path).await?;
            if let Err(e) = self.persist(data_id, &state) {
                let _ = fs::remove_file(&path).await;
                return Err(e);
            }
            let entry = self.snapshot(data_id, &state);
            self.entries().insert(data_id.to_string(), state);
            debug!(data_id, size = object.size, "Materialized remote data");
            entry
        };

        if let Err(e) = self.evict_if_needed(Some(data_id)).await {
            warn!(data_id, "Eviction after fetch failed: {}", e);
        }
        Ok(entry)
    }

    /// Commits the current local content of a dirty entry as a new
    /// generation. Writes that land while the upload runs keep the entry
    /// dirty.
    async fn sync_entry(&self, data_id: &str, mode: SyncMode) -> Result<SyncOutcome, StorageError> {
        let _sync = self.inner.sync_locks.lock(data_id).await;

        let (data, version) = {
            let _content = self.inner.content_locks.lock(data_id).await;
            let version = {
                let entries = self.entries();
                let Some(state) = entries.get(data_id) else {
                    return Ok(SyncOutcome::Clean);
                };
                if !state.dirty || state.marked_for_deletion {
                    return Ok(SyncOutcome::Clean);
                }
                if mode == SyncMode::Background {
                    let due = state.due(self.inner.settings.quiet_period);
                    if due > Instant::now() {
                        return Ok(SyncOutcome::Deferred(due));
                    }
                }
                state.version
            };
            (fs::read(self.path_for(data_id)).await?, version)
        };

        match self.inner.engine.commit(data_id, &data).await {
            Ok(object) => {
                // a write stages its record and bumps the version under this
                // lock, so the comparison below sees every acknowledged write
                let _content = self.inner.content_locks.lock(data_id).await;
                let committed = self.entries().get_mut(data_id).map(|state| {
                    state.uploaded_size = object.size;
                    state.last_upload_time = Some(object.committed_at);
                    state.synced_version = state.synced_version.max(version);
                    state.failed_attempts = 0;
                    state.next_attempt = None;
                    if state.version == version {
                        state.dirty = false;
                    } else {
                        debug!(data_id, "Rewritten during sync, staying dirty");
                    }
                    state.clone()
                });
                if let Some(state) = committed {
                    self.persist(data_id, &state)?;
                }
                Ok(SyncOutcome::Committed(object.generation))
            }
            Err(e) => {
                let mut entries = self.entries();
                if let Some(state) = entries.get_mut(data_id) {
                    state.failed_attempts = state.failed_attempts.saturating_add(1);
                    state.next_attempt = Some(sync::deadline(
                        Instant::now(),
                        sync::backoff(&self.inner.settings, state.failed_attempts),
                    ));
                }
                Err(e)
            }
        }
    }

    fn touch(&self, data_id: &str) -> Option<ContentCacheEntry> {
        let tick = self.next_tick();
        let mut entries = self.entries();
        let state = entries.get_mut(data_id)?;
        if state.marked_for_deletion {
            return None;
        }
        state.access_tick = tick;
        state.last_access_time = Utc::now().timestamp_millis();
        Some(self.snapshot(data_id, state))
    }

    /// Writes the access order of a hit to the metadata store so LRU order
    /// survives a restart. Failures only cost ordering and are logged.
    async fn record_access(&self, data_id: &str) {
        let _content = self.inner.content_locks.lock(data_id).await;
        let state = match self.entries().get(data_id) {
            Some(state) if state.access_tick != state.persisted_tick && !state.marked_for_deletion => {
                state.clone()
            }
            _ => return,
        };
        if let Err(e) = self.persist(data_id, &state) {
            warn!(data_id, "Failed to record cache access: {}", e);
            return;
        }
        if let Some(live) = self.entries().get_mut(data_id) {
            live.persisted_tick = live.persisted_tick.max(state.access_tick);
        }
    }

    fn snapshot(&self, data_id: &str, state: &EntryState) -> ContentCacheEntry {
        ContentCacheEntry {
            data_id: data_id.to_string(),
            path: self.path_for(data_id),
            size: state.size,
            dirty: state.dirty,
            uploaded_size: state.uploaded_size,
            last_upload_time: state
                .last_upload_time
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
            last_access_time: Utc
                .timestamp_millis_opt(state.last_access_time)
                .single()
                .unwrap_or_default(),
            marked_for_deletion: state.marked_for_deletion,
        }
    }

    fn persist(&self, data_id: &str, state: &EntryState) -> Result<(), StorageError> {
        self.inner.meta.save_cache_record(&CacheRecord {
            data_id: data_id.to_string(),
            size: state.size,
            dirty: state.dirty,
            uploaded_size: state.uploaded_size,
            last_upload_time: state.last_upload_time,
            last_access_time: state.last_access_time,
            access_tick: state.access_tick,
        })
    }

    fn path_for(&self, data_id: &str) -> PathBuf {
        self.inner.objects_dir.join(local_name(data_id))
    }

    fn next_tick(&self) -> u64 {
        self.inner.tick.fetch_add(1, Ordering::AcqRel)
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, EntryState>> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn inflight(&self) -> MutexGuard<'_, HashMap<String, WeakShared<FetchFuture>>> {
        self.inner
            .inflight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// File name of the local copy: data ids are opaque and may not be valid
/// file names.
fn local_name(data_id: &str) -> String {
    faster_hex::hex_string(&Md5::digest(data_id.as_bytes()))
}

async fn remove_file_if_exists(path: &Path) -> Result<(), StorageError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Temporary file removed on drop unless persisted.
struct TempPath(Option<PathBuf>);

impl TempPath {
    fn new(dir: &Path) -> Self {
        Self(Some(dir.join(format!("{}.download", Uuid::new_v4()))))
    }

    fn path(&self) -> &Path {
        self.0.as_deref().unwrap_or_else(|| Path::new(""))
    }

    async fn persist(mut self, to: &Path) -> Result<(), StorageError> {
        if let Some(path) = &self.0 {
            fs::rename(path, to).await?;
        }
        self.0 = None;
        Ok(())
    }
}

impl Drop for TempPath {
    fn drop(&mut self) {
        if let Some(path) = self.0.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rand::RngCore;
    use tempfile::TempDir;

    use super::*;
    use crate::cloud::{CloudStore, CloudStoreRegistry, MemoryCloudStore};
    use crate::erasure::ErasureCodec;

    struct Fixture {
        dir: TempDir,
        stores: Vec<Arc<MemoryCloudStore>>,
        engine: Arc<DistributedStore>,
        cache: ContentCache,
    }

    fn settings(dir: &Path, max_size: u64) -> CacheSettings {
        CacheSettings {
            cache_dir: dir.join("cache"),
            max_size,
            sync_interval: Duration::from_millis(50),
            quiet_period: Duration::from_millis(10),
            retry_base_delay: Duration::from_millis(10),
            retry_max_delay: Duration::from_millis(100),
            flush_max_attempts: 3,
            sync_concurrency: 2,
        }
    }

    async fn fixture(max_size: u64) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let stores: Vec<_> = (0..6)
            .map(|i| Arc::new(MemoryCloudStore::new(format!("s{}", i), 64 << 20)))
            .collect();
        let registry = CloudStoreRegistry::connect(
            stores
                .iter()
                .map(|s| Arc::clone(s) as Arc<dyn CloudStore>)
                .collect(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        let engine = Arc::new(DistributedStore::new(
            ErasureCodec::new(4, 2, 64).unwrap(),
            Arc::new(registry),
            MetaStore::in_memory(),
            SharedMetrics::default(),
            0,
        ));
        let cache = ContentCache::open(
            settings(dir.path(), max_size),
            Arc::clone(&engine),
            SharedMetrics::default(),
        )
        .await
        .unwrap();
        Fixture {
            dir,
            stores,
            engine,
            cache,
        }
    }

    fn random(len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut data);
        data
    }

    fn uploads(f: &Fixture) -> usize {
        f.stores.iter().map(|s| s.upload_count()).sum()
    }

    fn downloads(f: &Fixture) -> usize {
        f.stores.iter().map(|s| s.download_count()).sum()
    }

    async fn read_all(cache: &ContentCache, id: &str) -> Vec<u8> {
        let mut out = Vec::new();
        cache.read(id, &mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_write_stays_local() {
        let f = fixture(1 << 20).await;
        let payload = random(5_000);
        f.cache.write("f1", payload.as_slice(), 5_000).await.unwrap();

        let entry = f.cache.entry("f1").unwrap();
        assert!(entry.dirty);
        assert_eq!(entry.size, 5_000);
        assert_eq!(uploads(&f), 0);
        assert_eq!(read_all(&f.cache, "f1").await, payload);
    }

    #[tokio::test]
    async fn test_short_input_is_rejected() {
        let f = fixture(1 << 20).await;
        let err = f.cache.write("f1", &[1u8; 10][..], 100).await.unwrap_err();
        assert!(matches!(err, StorageError::Encoding(_)));
        assert!(f.cache.entry("f1").is_none());
    }

    #[tokio::test]
    async fn test_flush_clears_dirty() {
        let f = fixture(1 << 20).await;
        f.cache.write("f1", &random(3_000)[..], 3_000).await.unwrap();
        f.cache.flush("f1").await.unwrap();

        let entry = f.cache.entry("f1").unwrap();
        assert!(!entry.dirty);
        assert_eq!(entry.uploaded_size, 3_000);
        assert!(entry.last_upload_time.is_some());
        assert_eq!(uploads(&f), 6);
        assert_eq!(f.engine.data_object("f1").unwrap().unwrap().generation, 1);
    }

    #[tokio::test]
    async fn test_flush_surfaces_insufficient_stores() {
        let f = fixture(1 << 20).await;
        f.cache.write("f1", &random(100)[..], 100).await.unwrap();
        f.stores[0].set_offline(true);
        f.engine.registry().refresh().await;

        assert!(matches!(
            f.cache.flush("f1").await,
            Err(StorageError::InsufficientStores { .. })
        ));
        assert!(f.cache.is_dirty("f1"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_misses_share_one_fetch() {
        let f = fixture(1 << 20).await;
        let payload = random(50_000);
        f.engine.commit("f1", &payload).await.unwrap();
        for store in &f.stores {
            store.set_latency(Duration::from_millis(50));
        }

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let cache = f.cache.clone();
                tokio::spawn(async move { cache.get_or_fetch("f1").await })
            })
            .collect();
        for task in tasks {
            let entry = task.await.unwrap().unwrap();
            assert_eq!(entry.size, 50_000);
        }

        // one fetch sequence: exactly k slice downloads
        assert_eq!(downloads(&f), 4);
        assert_eq!(read_all(&f.cache, "f1").await, payload);
    }

    #[tokio::test]
    async fn test_failed_fetch_reaches_every_waiter() {
        let f = fixture(1 << 20).await;
        let results =
            futures::future::join_all((0..5).map(|_| f.cache.get_or_fetch("missing"))).await;
        assert!(results
            .iter()
            .all(|r| matches!(r, Err(StorageError::NotFound(_)))));
    }

    #[tokio::test]
    async fn test_cancelled_fetch_leaves_nothing_behind() {
        let f = fixture(1 << 20).await;
        let payload = random(10_000);
        f.engine.commit("f1", &payload).await.unwrap();
        for store in &f.stores {
            store.set_latency(Duration::from_millis(300));
        }

        let cancelled =
            tokio::time::timeout(Duration::from_millis(30), f.cache.get_or_fetch("f1")).await;
        assert!(cancelled.is_err());
        assert!(f.cache.entry("f1").is_none());
        let tmp_files = std::fs::read_dir(f.dir.path().join("cache/tmp")).unwrap().count();
        assert_eq!(tmp_files, 0);

        for store in &f.stores {
            store.set_latency(Duration::ZERO);
        }
        assert_eq!(read_all(&f.cache, "f1").await, payload);
    }

    #[tokio::test]
    async fn test_eviction_skips_dirty_entries() {
        let f = fixture(1_000).await;
        f.cache.write("old-dirty", &random(400)[..], 400).await.unwrap();
        f.cache.write("clean", &random(400)[..], 400).await.unwrap();
        f.cache.flush("clean").await.unwrap();

        f.cache.write("new", &random(400)[..], 400).await.unwrap();

        assert!(f.cache.entry("clean").is_none());
        assert!(f.cache.entry("old-dirty").unwrap().dirty);
        assert!(f.engine.data_object("old-dirty").unwrap().is_none());
        assert!(f.cache.entry("new").unwrap().dirty);
    }

    #[tokio::test]
    async fn test_all_dirty_forces_sync_of_oldest() {
        let f = fixture(1_000).await;
        let oldest = random(600);
        f.cache.write("a", &oldest[..], 600).await.unwrap();
        f.cache.write("b", &random(600)[..], 600).await.unwrap();

        // "a" was committed before being evicted
        assert!(f.cache.entry("a").is_none());
        assert!(f.engine.data_object("a").unwrap().is_some());
        assert!(f.cache.entry("b").unwrap().dirty);
        assert_eq!(read_all(&f.cache, "a").await, oldest);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_write_during_sync_stays_dirty() {
        let f = fixture(1 << 20).await;
        f.cache.write("f1", &random(1_000)[..], 1_000).await.unwrap();
        for store in &f.stores {
            store.set_latency(Duration::from_millis(200));
        }

        let cache = f.cache.clone();
        let flush = tokio::spawn(async move { cache.flush("f1").await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = random(2_000);
        f.cache.write("f1", &second[..], 2_000).await.unwrap();

        flush.await.unwrap().unwrap();
        assert!(f.cache.is_dirty("f1"));

        for store in &f.stores {
            store.set_latency(Duration::ZERO);
        }
        f.cache.flush("f1").await.unwrap();
        assert!(!f.cache.is_dirty("f1"));
        let (_, remote) = f.engine.fetch("f1").await.unwrap();
        assert_eq!(remote, second);
    }

    fn persisted(f: &Fixture, id: &str) -> Option<CacheRecord> {
        f.engine
            .meta()
            .cache_records()
            .unwrap()
            .into_iter()
            .find(|r| r.data_id == id)
    }

    async fn reopen(f: &Fixture, max_size: u64) -> ContentCache {
        ContentCache::open(
            settings(f.dir.path(), max_size),
            Arc::clone(&f.engine),
            SharedMetrics::default(),
        )
        .await
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_persisted_dirty_flag_follows_racing_writes() {
        let f = fixture(1 << 20).await;
        for round in 0..200u32 {
            f.cache.write("f1", &random(512)[..], 512).await.unwrap();

            let cache = f.cache.clone();
            let flush = tokio::spawn(async move { cache.flush("f1").await });
            let cache = f.cache.clone();
            let write = tokio::spawn(async move {
                for _ in 0..(round % 8) {
                    tokio::task::yield_now().await;
                }
                cache.write("f1", &random(512)[..], 512).await
            });
            flush.await.unwrap().unwrap();
            write.await.unwrap().unwrap();

            let record = persisted(&f, "f1").unwrap();
            assert_eq!(record.dirty, f.cache.is_dirty("f1"), "round {}", round);
        }
    }

    #[tokio::test]
    async fn test_write_during_upload_survives_reopen() {
        let f = fixture(1 << 20).await;
        f.cache.write("f1", &random(1_000)[..], 1_000).await.unwrap();
        for store in &f.stores {
            store.set_latency(Duration::from_millis(100));
        }

        let cache = f.cache.clone();
        let flush = tokio::spawn(async move { cache.flush("f1").await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        let second = random(1_000);
        f.cache.write("f1", &second[..], 1_000).await.unwrap();
        flush.await.unwrap().unwrap();

        let reopened = reopen(&f, 1 << 20).await;
        assert!(reopened.is_dirty("f1"));
        assert!(!reopened.evict("f1").await.unwrap());
        assert_eq!(read_all(&reopened, "f1").await, second);
    }

    #[tokio::test]
    async fn test_hits_keep_lru_order_across_reopen() {
        let f = fixture(1 << 20).await;
        f.cache.write("a", &random(1_000)[..], 1_000).await.unwrap();
        f.cache.write("b", &random(1_000)[..], 1_000).await.unwrap();
        f.cache.flush_all().await.unwrap();
        read_all(&f.cache, "a").await;
        assert!(persisted(&f, "a").unwrap().access_tick > persisted(&f, "b").unwrap().access_tick);

        let reopened = reopen(&f, 2_500).await;
        reopened.write("c", &random(1_000)[..], 1_000).await.unwrap();
        assert!(reopened.entry("a").is_some());
        assert!(reopened.entry("b").is_none());
    }

    #[tokio::test]
    async fn test_unbounded_quiet_period_defers_sync() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(1 << 20).await;
        let cache = ContentCache::open(
            CacheSettings {
                quiet_period: Duration::MAX,
                ..settings(dir.path(), 1 << 20)
            },
            Arc::clone(&f.engine),
            SharedMetrics::default(),
        )
        .await
        .unwrap();
        cache.write("f1", &random(100)[..], 100).await.unwrap();

        let due = cache.sync_pass().await.unwrap();
        assert!(due > Instant::now() + Duration::from_secs(3600));
        assert!(cache.is_dirty("f1"));
        assert_eq!(uploads(&f), 0);
    }

    #[tokio::test]
    async fn test_evict_refuses_dirty() {
        let f = fixture(1 << 20).await;
        f.cache.write("f1", &random(100)[..], 100).await.unwrap();
        assert!(!f.cache.evict("f1").await.unwrap());
        f.cache.flush("f1").await.unwrap();
        assert!(f.cache.evict("f1").await.unwrap());
        assert!(f.cache.entry("f1").is_none());
    }

    #[tokio::test]
    async fn test_delete_removes_local_and_remote() {
        let f = fixture(1 << 20).await;
        f.cache.write("f1", &random(100)[..], 100).await.unwrap();
        f.cache.flush("f1").await.unwrap();
        let path = f.cache.entry("f1").unwrap().path;

        assert!(f.cache.delete("f1").await.unwrap());
        assert!(f.cache.entry("f1").is_none());
        assert!(!path.exists());
        assert!(f.engine.data_object("f1").unwrap().is_none());
        assert!(f.stores.iter().all(|s| s.object_ids().is_empty()));
        assert!(!f.cache.delete("f1").await.unwrap());
    }

    #[tokio::test]
    async fn test_reopen_resumes_dirty_entries() {
        let f = fixture(1 << 20).await;
        let payload = random(700);
        f.cache.write("f1", &payload[..], 700).await.unwrap();
        f.cache.write("gone", &random(10)[..], 10).await.unwrap();
        std::fs::remove_file(f.cache.entry("gone").unwrap().path).unwrap();

        let reopened = ContentCache::open(
            settings(f.dir.path(), 1 << 20),
            Arc::clone(&f.engine),
            SharedMetrics::default(),
        )
        .await
        .unwrap();
        assert!(reopened.is_dirty("f1"));
        assert!(reopened.entry("gone").is_none());

        reopened.flush_all().await.unwrap();
        assert!(!reopened.is_dirty("f1"));
        assert_eq!(f.engine.fetch("f1").await.unwrap().1, payload);
    }

    #[tokio::test]
    async fn test_background_sync() {
        let f = fixture(1 << 20).await;
        let handle = f.cache.start_sync();
        f.cache.write("f1", &random(1_000)[..], 1_000).await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while f.cache.is_dirty("f1") && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        handle.shutdown().await;
        assert!(!f.cache.is_dirty("f1"));
        assert!(f.engine.data_object("f1").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_background_sync_retries_after_outage() {
        let f = fixture(1 << 20).await;
        f.stores[3].set_offline(true);
        let handle = f.cache.start_sync();
        f.cache.write("f1", &random(1_000)[..], 1_000).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(f.cache.is_dirty("f1"));

        f.stores[3].set_offline(false);
        let deadline = Instant::now() + Duration::from_secs(5);
        while f.cache.is_dirty("f1") && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        handle.shutdown().await;
        assert!(!f.cache.is_dirty("f1"));
    }
}

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use chrono::Utc;
use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, info, warn};

use cirrus_types::meta::{apply_range, chunk_containing, coalesce_sorted, covers};
use cirrus_types::{ChunkMeta, CirrusError, FileMeta, Result, UploadRecord, UploadStatus};

use crate::cancel::CancelToken;
use crate::cleaner::{Cleaner, CleanerConfig, Trigger};
use crate::config::CacheConfig;
use crate::failsafe::FailsafeMonitor;
use crate::files::ContainerStore;
use crate::index::{CacheIndex, IndexStore};
use crate::metrics::UploaderMetrics;
use crate::paths;
use crate::uploader::{
    LocalChunkSource, RemoteStore, UploadListener, Uploader, UploaderConfig,
};

#[cfg(unix)]
use crate::cleaner::StatvfsDiskUsage;
#[cfg(not(unix))]
use crate::cleaner::DirDiskUsage;

/// Lifecycle orchestrator and the API surface the filesystem host calls.
///
/// Owns the open index (and with it the cache root's `.lock`), the container
/// store, and the background uploader/cleaner threads. Writes to the same
/// logical path are serialized by a per-path lock so their effects on the
/// chunk list land in call order.
pub struct CacheManager {
    root: PathBuf,
    index: Arc<IndexStore>,
    store: ContainerStore,
    uploader: Arc<Uploader>,
    cleaner: Arc<Cleaner>,
    failsafe: Option<FailsafeMonitor>,
    cancel: CancelToken,
    threads: Mutex<Vec<JoinHandle<()>>>,
    cleaner_tx: Sender<Trigger>,
    cleaner_rx: Mutex<Option<Receiver<Trigger>>>,
    write_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

/// Flips the matching chunk clean once its upload is confirmed.
///
/// Runs strictly after the `complete` status is durable, which keeps the
/// rule intact that a clean chunk always refers to uploaded bytes. A chunk
/// reshaped by a newer write no longer matches and is left alone.
struct ChunkCleanListener {
    index: Arc<dyn CacheIndex>,
    cancel: CancelToken,
}

impl UploadListener for ChunkCleanListener {
    fn upload_complete(&self, record: &UploadRecord) {
        let result = self.index.update(&self.cancel, &record.path, &|mut meta| {
            let mut flipped = false;
            for chunk in meta.chunks.iter_mut() {
                if chunk.offset == record.offset && chunk.length == record.length && chunk.dirty {
                    chunk.dirty = false;
                    flipped = true;
                }
            }
            if flipped {
                let chunks = std::mem::take(&mut meta.chunks);
                meta.chunks = coalesce_sorted(chunks);
            }
            Ok(meta)
        });

        match result {
            Ok(_) => debug!(path = %record.path, offset = record.offset, "chunk marked clean"),
            Err(CirrusError::NotFound) => {
                debug!(path = %record.path, "entry gone before upload confirmation")
            }
            Err(e) => warn!(path = %record.path, "failed to mark chunk clean: {e}"),
        }
    }
}

impl CacheManager {
    /// Build a manager rooted at `root` (the cache directory from the
    /// config), uploading through `remote`.
    pub fn new(cfg: CacheConfig, root: &Path, remote: Arc<dyn RemoteStore>) -> Result<Self> {
        Self::build(cfg, root, remote, None)
    }

    /// Like [`new`](Self::new) with an uploader metrics sink.
    pub fn with_upload_metrics(
        cfg: CacheConfig,
        root: &Path,
        remote: Arc<dyn RemoteStore>,
        metrics: Arc<dyn UploaderMetrics>,
    ) -> Result<Self> {
        Self::build(cfg, root, remote, Some(metrics))
    }

    fn build(
        cfg: CacheConfig,
        root: &Path,
        remote: Arc<dyn RemoteStore>,
        metrics: Option<Arc<dyn UploaderMetrics>>,
    ) -> Result<Self> {
        let issues = cfg.validate();
        if !issues.is_empty() {
            return Err(CirrusError::Validation(issues));
        }

        let cancel = CancelToken::new();
        let index = Arc::new(IndexStore::open(root)?);

        let objects = root.join("objects");
        std::fs::create_dir_all(&objects)?;
        let store = ContainerStore::new(&objects);

        let listener = Arc::new(ChunkCleanListener {
            index: index.clone() as Arc<dyn CacheIndex>,
            cancel: cancel.clone(),
        });

        let uploader_cfg = UploaderConfig {
            max_concurrent_uploads: cfg.upload.max_concurrent_uploads,
            base_retry_delay: cfg.base_retry_delay(),
            max_retry_delay: cfg.max_retry_delay(),
            ..UploaderConfig::default()
        };
        let mut uploader = Uploader::new(
            uploader_cfg,
            index.clone() as Arc<dyn CacheIndex>,
            remote,
            Arc::new(LocalChunkSource::new(&objects)),
        )
        .with_listener(listener);
        if let Some(metrics) = metrics {
            uploader = uploader.with_metrics(metrics);
        }
        let uploader = Arc::new(uploader);

        #[cfg(unix)]
        let disk: Box<dyn crate::cleaner::DiskUsage> = Box::new(StatvfsDiskUsage);
        #[cfg(not(unix))]
        let disk: Box<dyn crate::cleaner::DiskUsage> = Box::new(DirDiskUsage::new(0));

        let cleaner = Arc::new(Cleaner::new(
            CleanerConfig {
                objects_dir: objects,
                max_cache_bytes: cfg.max_cache_bytes(),
                min_free_percent: cfg.fail_safe.disk_min_free_percent,
                clean_interval: cfg.clean_interval(),
            },
            index.clone() as Arc<dyn CacheIndex>,
            disk,
        )?);

        let failsafe = cfg.fail_safe.enable.then(|| {
            FailsafeMonitor::new(
                cleaner.clone() as Arc<dyn crate::failsafe::EmergencyCleaner>,
                uploader.clone() as Arc<dyn crate::uploader::UploaderController>,
            )
        });

        let (cleaner_tx, cleaner_rx) = crossbeam_channel::unbounded();

        Ok(Self {
            root: root.to_path_buf(),
            index,
            store,
            uploader,
            cleaner,
            failsafe,
            cancel,
            threads: Mutex::new(Vec::new()),
            cleaner_tx,
            cleaner_rx: Mutex::new(Some(cleaner_rx)),
            write_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Start the uploader and cleaner background loops.
    pub fn start(&self) -> Result<()> {
        let rx = self
            .cleaner_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| CirrusError::Other("cache manager already started".into()))?;

        // Clear journal records confirmed before the last shutdown.
        let compacted = self.index.compact_uploads(&self.cancel)?;
        if compacted > 0 {
            debug!(compacted, "dropped confirmed upload records at startup");
        }

        let mut threads = self.threads.lock().unwrap();

        let uploader = Arc::clone(&self.uploader);
        let cancel = self.cancel.clone();
        threads.push(std::thread::spawn(move || {
            if let Err(e) = uploader.run(&cancel) {
                if !matches!(e, CirrusError::Cancelled) {
                    warn!("uploader loop exited: {e}");
                }
            }
        }));

        let cleaner = Arc::clone(&self.cleaner);
        let cancel = self.cancel.clone();
        threads.push(std::thread::spawn(move || {
            if let Err(e) = cleaner.run_background(&cancel, rx) {
                if !matches!(e, CirrusError::Cancelled) {
                    warn!("cleaner loop exited: {e}");
                }
            }
        }));

        info!(root = %self.root.display(), "cache manager started");
        Ok(())
    }

    /// Cancel background loops, wait for them to drain, and flush the index.
    pub fn stop(&self) -> Result<()> {
        self.cancel.cancel();
        let threads: Vec<JoinHandle<()>> = self.threads.lock().unwrap().drain(..).collect();
        for handle in threads {
            if handle.join().is_err() {
                warn!("background thread panicked during shutdown");
            }
        }
        self.index.sync()?;
        info!("cache manager stopped");
        Ok(())
    }

    /// Read cached bytes for `[offset, offset+length)`.
    ///
    /// Bumps `atime_local`. Ranges not fully backed by cached chunks signal
    /// `NotFound`; the host fetches from remote and calls
    /// [`write_range`](Self::write_range) with `dirty = false`.
    pub fn read_range(
        &self,
        cancel: &CancelToken,
        path: &str,
        offset: u64,
        length: usize,
    ) -> Result<Vec<u8>> {
        let path = paths::normalize(path)?;
        if length == 0 {
            return Ok(Vec::new());
        }

        let meta = self.index.get(cancel, &path)?;
        if !covers(&meta.chunks, offset, length as u64) {
            return Err(CirrusError::NotFound);
        }

        let bytes = self.store.read_committed(&path, offset, length)?;
        if bytes.len() != length {
            // Chunk list says covered but the container is short; treat as a
            // miss so the host refetches.
            warn!(path = %path, offset, length, got = bytes.len(), "container shorter than chunk map");
            return Err(CirrusError::NotFound);
        }
        Ok(bytes)
    }

    /// Write bytes at `offset`, durable on return.
    ///
    /// The container commit happens before the index learns about the chunk,
    /// so the index never references bytes that are not on disk. A dirty
    /// write replaces any queued journal records its coalesced range
    /// absorbs and appends a single record for the merged dirty chunk.
    pub fn write_range(
        &self,
        cancel: &CancelToken,
        path: &str,
        offset: u64,
        data: &[u8],
        dirty: bool,
    ) -> Result<()> {
        let path = paths::normalize(path)?;
        cancel.check()?;
        if data.is_empty() {
            return Ok(());
        }

        let lock = self.write_lock(&path);
        let _guard = lock.lock().unwrap();

        let container = self.store.open(&path)?;
        container.write_at(data, offset)?;
        container.fsync()?;
        container.close()?;

        let incoming = ChunkMeta::new(offset, data.len() as u64, dirty);
        let end = incoming.end();

        let meta = match self.index.update(cancel, &path, &|mut meta| {
            meta.chunks = apply_range(&meta.chunks, incoming);
            meta.size = meta.size.max(end);
            meta.atime_local = Utc::now();
            Ok(meta)
        }) {
            Ok(meta) => meta,
            Err(CirrusError::NotFound) => {
                let mut meta = FileMeta::new(&path);
                meta.chunks = vec![incoming];
                meta.size = end;
                self.index.put(cancel, meta.clone())?;
                meta
            }
            Err(e) => return Err(e),
        };

        if dirty {
            let merged = chunk_containing(&meta.chunks, offset).unwrap_or(incoming);
            self.replace_pending_records(cancel, &path, merged)?;
        }

        Ok(())
    }

    /// Drop pending records absorbed by `merged` and append one covering it.
    ///
    /// Queued and in-flight records are both superseded. The uploader
    /// tolerates the removal (a record that vanishes mid-flight is dropped
    /// on completion without touching the chunk map) and holds the
    /// replacement record back until the running upload drains, so two
    /// uploads at overlapping ranges of one path never proceed together.
    fn replace_pending_records(
        &self,
        cancel: &CancelToken,
        path: &str,
        merged: ChunkMeta,
    ) -> Result<()> {
        for record in self.index.list_uploads(cancel)? {
            if record.path != path || record.status.is_terminal() {
                continue;
            }
            if record.offset >= merged.offset && record.end() <= merged.end() {
                debug!(id = %record.id, status = %record.status, "superseded by coalesced write");
                self.index.remove_upload(cancel, &record.id)?;
            }
        }

        self.index
            .add_upload(cancel, UploadRecord::queued(path, merged.offset, merged.length))?;
        Ok(())
    }

    /// Drop all local state for a path whose remote etag changed.
    ///
    /// Pending uploads are marked failed with the etag-mismatch reason; the
    /// host reconciles by refetching remote metadata.
    pub fn invalidate(&self, cancel: &CancelToken, path: &str) -> Result<()> {
        let path = paths::normalize(path)?;
        let lock = self.write_lock(&path);
        let _guard = lock.lock().unwrap();

        for record in self.index.list_uploads(cancel)? {
            if record.path != path || record.status.is_terminal() {
                continue;
            }
            self.index.update_upload_status(
                cancel,
                &record.id,
                UploadStatus::Failed,
                &CirrusError::EtagMismatch.to_string(),
            )?;
        }

        self.index.delete(cancel, &path)?;
        self.store.remove(&path)?;
        info!(path = %path, "invalidated cache entry");
        Ok(())
    }

    /// Ask the cleaner for an out-of-band pass, e.g. after a failed write.
    pub fn request_clean(&self) {
        let _ = self.cleaner_tx.send(Trigger::maintenance());
    }

    /// Snapshot of the upload journal, id ascending. The host uses this to
    /// surface stuck uploads and reconcile etag-mismatch failures.
    pub fn upload_records(&self, cancel: &CancelToken) -> Result<Vec<UploadRecord>> {
        self.index.list_uploads(cancel)
    }

    /// Snapshot of cached objects in LRU order; `limit == 0` means all.
    pub fn lru_snapshot(&self, cancel: &CancelToken, limit: usize) -> Result<Vec<FileMeta>> {
        self.index.list_lru(cancel, limit)
    }

    /// Recover from an out-of-space condition.
    ///
    /// With the failsafe enabled this pauses the uploader around an
    /// emergency eviction; when disabled in config, a bare emergency pass
    /// runs instead.
    pub fn handle_enospc(&self, cancel: &CancelToken) -> Result<()> {
        match &self.failsafe {
            Some(monitor) => monitor.handle_enospc(cancel),
            None => self.cleaner.run_once(cancel, Trigger::enospc()).map(|_| ()),
        }
    }

    fn write_lock(&self, path: &str) -> Arc<Mutex<()>> {
        let mut locks = self.write_locks.lock().unwrap();
        locks
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

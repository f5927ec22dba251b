use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::Receiver;
use tracing::{debug, error, info, warn};

use cirrus_types::{CirrusError, FileMeta, Result};

use crate::cancel::CancelToken;
use crate::index::CacheIndex;
use crate::paths;

/// What prompted a cleaner pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerReason {
    /// Periodic maintenance tick.
    Maintenance,
    /// Emergency pass after an out-of-space condition.
    Enospc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trigger {
    pub reason: TriggerReason,
}

impl Trigger {
    pub fn maintenance() -> Self {
        Self {
            reason: TriggerReason::Maintenance,
        }
    }

    pub fn enospc() -> Self {
        Self {
            reason: TriggerReason::Enospc,
        }
    }
}

/// Summary of one cleaner pass.
#[derive(Debug, Clone)]
pub struct Report {
    pub trigger: Trigger,
    pub total_before: u64,
    pub total_after: u64,
    pub bytes_freed: u64,
    pub evicted: Vec<String>,
    pub emergency: bool,
}

/// Disk capacity probe for the cache filesystem: `(total, free)` bytes.
pub trait DiskUsage: Send + Sync {
    fn stat(&self, path: &Path) -> Result<(u64, u64)>;
}

/// Production probe backed by `statvfs`.
#[cfg(unix)]
#[derive(Debug, Default)]
pub struct StatvfsDiskUsage;

#[cfg(unix)]
impl DiskUsage for StatvfsDiskUsage {
    fn stat(&self, path: &Path) -> Result<(u64, u64)> {
        use std::os::unix::ffi::OsStrExt;

        let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
            .map_err(|_| CirrusError::InvalidPath(path.display().to_string()))?;

        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }

        // Casts needed for cross-platform: field types vary between Linux
        // and macOS.
        #[allow(clippy::unnecessary_cast)]
        let frsize = stat.f_frsize as u64;
        #[allow(clippy::unnecessary_cast)]
        let total = (stat.f_blocks as u64).saturating_mul(frsize);
        #[allow(clippy::unnecessary_cast)]
        let free = (stat.f_bavail as u64).saturating_mul(frsize);
        Ok((total, free))
    }
}

/// Probe that walks the directory and reports usage against a configured
/// capacity. Deterministic substitute for `statvfs` in tests and on
/// platforms without it.
#[derive(Debug)]
pub struct DirDiskUsage {
    capacity: u64,
}

impl DirDiskUsage {
    pub fn new(capacity: u64) -> Self {
        Self { capacity }
    }

    fn walk(dir: &Path, used: &mut u64) -> Result<()> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                Self::walk(&entry.path(), used)?;
            } else if file_type.is_file() {
                *used += entry.metadata()?.len();
            }
        }
        Ok(())
    }
}

impl DiskUsage for DirDiskUsage {
    fn stat(&self, path: &Path) -> Result<(u64, u64)> {
        let mut used = 0u64;
        Self::walk(path, &mut used)?;

        let mut capacity = self.capacity;
        if capacity == 0 {
            capacity = used.max(1);
        }
        let free = capacity.saturating_sub(used);
        Ok((capacity, free))
    }
}

/// Cleaner tuning.
#[derive(Debug, Clone)]
pub struct CleanerConfig {
    /// Objects directory under the cache root.
    pub objects_dir: PathBuf,
    /// Capacity ceiling; 0 means unlimited.
    pub max_cache_bytes: u64,
    /// Free-space floor as a percentage of the cache filesystem. Only
    /// enforced on emergency passes; 0 disables it.
    pub min_free_percent: u32,
    pub clean_interval: Duration,
}

/// LRU evictor keeping the cache within capacity and free-space thresholds.
///
/// One pass at a time: concurrent callers serialize on an internal lock and
/// each observes a complete, atomic pass.
pub struct Cleaner {
    cfg: CleanerConfig,
    index: Arc<dyn CacheIndex>,
    disk: Box<dyn DiskUsage>,
    run_lock: Mutex<()>,
}

impl std::fmt::Debug for Cleaner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cleaner")
            .field("cfg", &self.cfg)
            .finish_non_exhaustive()
    }
}

impl Cleaner {
    pub fn new(cfg: CleanerConfig, index: Arc<dyn CacheIndex>, disk: Box<dyn DiskUsage>) -> Result<Self> {
        if cfg.objects_dir.as_os_str().is_empty() {
            return Err(CirrusError::Other(
                "cache cleaner: objects directory is required".into(),
            ));
        }
        if cfg.min_free_percent > 100 {
            return Err(CirrusError::Other(format!(
                "cache cleaner: min free percent must be within [0,100], got {}",
                cfg.min_free_percent
            )));
        }

        let mut cfg = cfg;
        if cfg.clean_interval.is_zero() {
            cfg.clean_interval = Duration::from_secs(30 * 60);
        }

        Ok(Self {
            cfg,
            index,
            disk,
            run_lock: Mutex::new(()),
        })
    }

    /// Execute a single eviction pass for the trigger.
    pub fn run_once(&self, cancel: &CancelToken, trigger: Trigger) -> Result<Report> {
        let _guard = self.run_lock.lock().unwrap();
        cancel.check()?;

        let mut report = Report {
            trigger,
            total_before: 0,
            total_after: 0,
            bytes_freed: 0,
            evicted: Vec::new(),
            emergency: trigger.reason == TriggerReason::Enospc,
        };

        let metas = self.index.list_lru(cancel, 0)?;
        let mut usage: u64 = metas.iter().map(|m| m.size).sum();
        report.total_before = usage;

        let limit = if self.cfg.max_cache_bytes == 0 {
            u64::MAX
        } else {
            self.cfg.max_cache_bytes
        };

        let (total, mut free) = self.disk.stat(&self.cfg.objects_dir)?;
        let required_free = required_free_bytes(total, self.cfg.min_free_percent);
        let emergency = report.emergency && required_free > 0;

        for meta in &metas {
            cancel.check()?;

            if usage <= limit && (!emergency || free >= required_free) {
                break;
            }
            if !meta.is_evictable() {
                debug!(path = %meta.path, "skipping dirty file");
                continue;
            }

            match self.evict(cancel, meta) {
                Ok(freed) => {
                    usage = usage.saturating_sub(meta.size);
                    free = free.saturating_add(freed);
                    report.bytes_freed += freed;
                    report.evicted.push(meta.path.clone());
                }
                Err(e) => {
                    error!(path = %meta.path, "evict failed: {e}");
                    continue;
                }
            }
        }

        report.total_after = usage;
        info!(
            evicted = report.evicted.len(),
            bytes_freed = report.bytes_freed,
            usage_after = usage,
            emergency = report.emergency,
            "cleaner pass finished"
        );

        // In an emergency the free-space floor is the verdict that matters:
        // failing it is fatal even when capacity alone could not be met.
        if emergency {
            let (total, free) = self.disk.stat(&self.cfg.objects_dir)?;
            if total > 0 && free < required_free {
                return Err(CirrusError::FatalCondition);
            }
        }

        if usage > limit {
            return Err(CirrusError::CapacityNotReduced);
        }

        Ok(report)
    }

    /// Run maintenance passes on a timer, plus any explicitly requested
    /// triggers, until `cancel` trips.
    pub fn run_background(&self, cancel: &CancelToken, triggers: Receiver<Trigger>) -> Result<()> {
        let ticker = crossbeam_channel::tick(self.cfg.clean_interval);
        let mut triggers = triggers;

        loop {
            if cancel.is_cancelled() {
                return Err(CirrusError::Cancelled);
            }

            let fired: Option<Trigger> = crossbeam_channel::select! {
                recv(ticker) -> _ => Some(Trigger::maintenance()),
                recv(triggers) -> msg => match msg {
                    Ok(trigger) => Some(trigger),
                    Err(_) => None,
                },
                default(Duration::from_millis(200)) => continue,
            };

            match fired {
                Some(trigger) => {
                    match self.run_once(cancel, trigger) {
                        Ok(_) => {}
                        // Dirty files can legitimately pin usage above the
                        // limit between uploads.
                        Err(CirrusError::CapacityNotReduced) => {}
                        Err(CirrusError::Cancelled) => return Err(CirrusError::Cancelled),
                        Err(e) => warn!("cleaner pass failed: {e}"),
                    }
                }
                None => {
                    // Trigger sender gone; keep only the timer.
                    triggers = crossbeam_channel::never();
                }
            }
        }
    }

    /// Evict one file: remove its bytes, drop the index entry, prune empty
    /// ancestors. Returns the disk bytes actually freed; a file already
    /// missing from disk frees zero.
    fn evict(&self, cancel: &CancelToken, meta: &FileMeta) -> Result<u64> {
        let path = paths::resolve(&self.cfg.objects_dir, &meta.path)?;

        let freed = match std::fs::metadata(&path) {
            Ok(info) => info.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        self.index.delete(cancel, &meta.path)?;
        self.prune_empty_dirs(&path);

        Ok(freed)
    }

    /// Remove now-empty ancestor directories up to (not including) the
    /// objects root. Non-empty directories end the climb.
    fn prune_empty_dirs(&self, evicted: &Path) {
        let root = &self.cfg.objects_dir;
        let mut dir = evicted.parent();
        while let Some(d) = dir {
            if d == root.as_path() || !d.starts_with(root) {
                break;
            }
            if std::fs::remove_dir(d).is_err() {
                break;
            }
            debug!(dir = %d.display(), "pruned empty cache directory");
            dir = d.parent();
        }
    }
}

fn required_free_bytes(total: u64, percent: u32) -> u64 {
    if percent == 0 || total == 0 {
        return 0;
    }
    (u128::from(total) * u128::from(percent) / 100) as u64
}

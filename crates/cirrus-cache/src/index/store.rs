use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use cirrus_types::meta::is_zero_time;
use cirrus_types::{CirrusError, FileMeta, Result, UploadRecord, UploadStatus};

use super::CacheIndex;
use crate::cancel::CancelToken;

const CURRENT_SCHEMA_VERSION: u64 = 1;
const INDEX_FILE: &str = "index.db";
const LOCK_FILE: &str = ".lock";

/// Full persisted index state. Unknown-at-decode fields fall back to their
/// defaults so older files decode; `schema_version` gates everything else.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct IndexState {
    #[serde(default)]
    schema_version: u64,
    #[serde(default)]
    upload_seq: u64,
    #[serde(default)]
    files: BTreeMap<String, FileMeta>,
    #[serde(default)]
    uploads: BTreeMap<String, UploadRecord>,
}

/// Durable single-writer [`CacheIndex`] backed by `index.db` under the cache
/// root.
///
/// State lives in memory behind a `RwLock`; every mutation serializes the
/// full state to a staging file, fsyncs, renames over `index.db`, and fsyncs
/// the parent directory before the in-memory change becomes observable. A
/// failed commit rolls the mutation back, so callers never see an effect
/// that did not reach disk. The cache root's `.lock` file is held with an
/// exclusive advisory lock for the lifetime of the store.
pub struct IndexStore {
    root: PathBuf,
    db_path: PathBuf,
    state: RwLock<IndexState>,
    // Held for the process-exclusive advisory lock; released on drop.
    _lock: File,
}

impl std::fmt::Debug for IndexStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexStore")
            .field("root", &self.root)
            .field("db_path", &self.db_path)
            .finish_non_exhaustive()
    }
}

impl IndexStore {
    /// Open (or create) the index under `root`, running schema migrations.
    pub fn open(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)?;

        let lock = File::options()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(root.join(LOCK_FILE))?;
        try_lock_exclusive(&lock, root)?;

        let db_path = root.join(INDEX_FILE);
        let (state, needs_commit) = match std::fs::read(&db_path) {
            Ok(raw) => {
                let mut state: IndexState = serde_json::from_slice(&raw)?;
                if state.schema_version > CURRENT_SCHEMA_VERSION {
                    return Err(CirrusError::UnknownSchema(state.schema_version));
                }
                let migrated = state.schema_version < CURRENT_SCHEMA_VERSION;
                if migrated {
                    migrate(&mut state)?;
                }
                (state, migrated)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let state = IndexState {
                    schema_version: CURRENT_SCHEMA_VERSION,
                    ..IndexState::default()
                };
                (state, true)
            }
            Err(e) => return Err(e.into()),
        };

        let store = Self {
            root: root.to_path_buf(),
            db_path,
            state: RwLock::new(state),
            _lock: lock,
        };

        if needs_commit {
            let state = store.state.read().unwrap();
            store.commit(&state)?;
        }

        Ok(store)
    }

    /// Persist the current state. Mutating operations already commit before
    /// returning; this is for explicit shutdown flushes.
    pub fn sync(&self) -> Result<()> {
        let state = self.state.read().unwrap();
        self.commit(&state)
    }

    /// Serialize `state` to a staging file and atomically replace `index.db`.
    fn commit(&self, state: &IndexState) -> Result<()> {
        let mut staging = tempfile::Builder::new()
            .prefix("index.db.tmp-")
            .tempfile_in(&self.root)?;
        serde_json::to_writer(staging.as_file_mut(), state)?;
        staging.as_file().sync_all()?;
        staging
            .persist(&self.db_path)
            .map_err(|e| CirrusError::Io(e.error))?;
        // The rename itself must survive a crash.
        File::open(&self.root)?.sync_all()?;
        Ok(())
    }
}

#[cfg(unix)]
fn try_lock_exclusive(file: &File, root: &Path) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            return Err(CirrusError::Locked(root.display().to_string()));
        }
        return Err(err.into());
    }
    Ok(())
}

#[cfg(not(unix))]
fn try_lock_exclusive(_file: &File, _root: &Path) -> Result<()> {
    Ok(())
}

/// Sequential, idempotent migrations up to the current version.
fn migrate(state: &mut IndexState) -> Result<()> {
    while state.schema_version < CURRENT_SCHEMA_VERSION {
        match state.schema_version {
            // v0 predates explicit versioning; the maps already decode with
            // defaults, so only the version stamp moves.
            0 => state.schema_version = 1,
            v => return Err(CirrusError::UnknownSchema(v)),
        }
    }
    debug!(version = state.schema_version, "cache index schema current");
    Ok(())
}

fn normalize_meta(mut meta: FileMeta) -> FileMeta {
    let now = Utc::now();
    if is_zero_time(&meta.atime_local) {
        meta.atime_local = now;
    }
    if is_zero_time(&meta.mtime_remote) {
        meta.mtime_remote = now;
    }
    meta
}

fn format_upload_id(seq: u64) -> String {
    format!("upl-{seq:020}")
}

/// Bump a record timestamp so `updated_at` is strictly increasing even when
/// two transitions land within clock resolution.
fn strictly_after(now: DateTime<Utc>, prev: DateTime<Utc>) -> DateTime<Utc> {
    if now > prev {
        now
    } else {
        prev + chrono::Duration::nanoseconds(1)
    }
}

impl CacheIndex for IndexStore {
    fn put(&self, cancel: &CancelToken, meta: FileMeta) -> Result<()> {
        cancel.check()?;
        if meta.path.is_empty() {
            return Err(CirrusError::Other(
                "cache index: path must not be empty".into(),
            ));
        }

        let normalized = normalize_meta(meta);
        let key = normalized.path.clone();

        let mut state = self.state.write().unwrap();
        let prev = state.files.insert(key.clone(), normalized);
        if let Err(e) = self.commit(&state) {
            match prev {
                Some(p) => state.files.insert(key, p),
                None => state.files.remove(&key),
            };
            return Err(e);
        }
        Ok(())
    }

    fn get(&self, cancel: &CancelToken, path: &str) -> Result<FileMeta> {
        cancel.check()?;
        if path.is_empty() {
            return Err(CirrusError::Other(
                "cache index: path must not be empty".into(),
            ));
        }

        let mut state = self.state.write().unwrap();
        let prev = match state.files.get(path) {
            Some(meta) => meta.clone(),
            None => return Err(CirrusError::NotFound),
        };

        let mut touched = prev.clone();
        touched.atime_local = Utc::now();
        state.files.insert(path.to_string(), touched.clone());
        if let Err(e) = self.commit(&state) {
            state.files.insert(path.to_string(), prev);
            return Err(e);
        }
        Ok(touched)
    }

    fn update(
        &self,
        cancel: &CancelToken,
        path: &str,
        apply: &dyn Fn(FileMeta) -> Result<FileMeta>,
    ) -> Result<FileMeta> {
        cancel.check()?;
        if path.is_empty() {
            return Err(CirrusError::Other(
                "cache index: path must not be empty".into(),
            ));
        }

        let mut state = self.state.write().unwrap();
        let prev = match state.files.get(path) {
            Some(meta) => meta.clone(),
            None => return Err(CirrusError::NotFound),
        };

        let mut updated = apply(prev.clone())?;
        // The entry stays keyed by the caller's path regardless of what the
        // closure did to the field.
        updated.path = path.to_string();
        let updated = normalize_meta(updated);

        state.files.insert(path.to_string(), updated.clone());
        if let Err(e) = self.commit(&state) {
            state.files.insert(path.to_string(), prev);
            return Err(e);
        }
        Ok(updated)
    }

    fn delete(&self, cancel: &CancelToken, path: &str) -> Result<()> {
        cancel.check()?;
        if path.is_empty() {
            return Err(CirrusError::Other(
                "cache index: path must not be empty".into(),
            ));
        }

        let mut state = self.state.write().unwrap();
        let Some(prev) = state.files.remove(path) else {
            return Ok(());
        };
        if let Err(e) = self.commit(&state) {
            state.files.insert(path.to_string(), prev);
            return Err(e);
        }
        Ok(())
    }

    fn list_lru(&self, cancel: &CancelToken, limit: usize) -> Result<Vec<FileMeta>> {
        cancel.check()?;

        let state = self.state.read().unwrap();
        let mut metas: Vec<FileMeta> = state.files.values().cloned().collect();
        // Path tiebreak keeps eviction order deterministic when atimes collide.
        metas.sort_by(|a, b| {
            a.atime_local
                .cmp(&b.atime_local)
                .then_with(|| a.path.cmp(&b.path))
        });
        if limit > 0 && limit < metas.len() {
            metas.truncate(limit);
        }
        Ok(metas)
    }

    fn add_upload(&self, cancel: &CancelToken, record: UploadRecord) -> Result<UploadRecord> {
        cancel.check()?;

        let mut state = self.state.write().unwrap();
        let prev_seq = state.upload_seq;

        let mut record = record;
        let now = Utc::now();
        if is_zero_time(&record.created_at) {
            record.created_at = now;
        }
        record.updated_at = now;
        if record.id.is_empty() {
            state.upload_seq += 1;
            record.id = format_upload_id(state.upload_seq);
        }

        let key = record.id.clone();
        let prev = state.uploads.insert(key.clone(), record.clone());
        if let Err(e) = self.commit(&state) {
            state.upload_seq = prev_seq;
            match prev {
                Some(p) => state.uploads.insert(key, p),
                None => state.uploads.remove(&key),
            };
            return Err(e);
        }
        Ok(record)
    }

    fn list_uploads(&self, cancel: &CancelToken) -> Result<Vec<UploadRecord>> {
        cancel.check()?;

        let state = self.state.read().unwrap();
        // Ids are zero-padded, so key order is id order.
        Ok(state.uploads.values().cloned().collect())
    }

    fn update_upload_status(
        &self,
        cancel: &CancelToken,
        id: &str,
        status: UploadStatus,
        last_error: &str,
    ) -> Result<UploadRecord> {
        cancel.check()?;
        if id.is_empty() {
            return Err(CirrusError::Other(
                "cache index: upload id must not be empty".into(),
            ));
        }

        let mut state = self.state.write().unwrap();
        let prev = match state.uploads.get(id) {
            Some(rec) => rec.clone(),
            None => return Err(CirrusError::NotFound),
        };

        let mut rec = prev.clone();
        rec.status = status;
        rec.attempts += 1;
        rec.last_error = last_error.to_string();
        rec.updated_at = strictly_after(Utc::now(), prev.updated_at);

        state.uploads.insert(id.to_string(), rec.clone());
        if let Err(e) = self.commit(&state) {
            state.uploads.insert(id.to_string(), prev);
            return Err(e);
        }
        Ok(rec)
    }

    fn remove_upload(&self, cancel: &CancelToken, id: &str) -> Result<()> {
        cancel.check()?;

        let mut state = self.state.write().unwrap();
        let Some(prev) = state.uploads.remove(id) else {
            return Ok(());
        };
        if let Err(e) = self.commit(&state) {
            state.uploads.insert(id.to_string(), prev);
            return Err(e);
        }
        Ok(())
    }

    fn compact_uploads(&self, cancel: &CancelToken) -> Result<usize> {
        cancel.check()?;

        let mut state = self.state.write().unwrap();
        let complete: Vec<String> = state
            .uploads
            .iter()
            .filter(|(_, rec)| rec.status == UploadStatus::Complete)
            .map(|(id, _)| id.clone())
            .collect();
        if complete.is_empty() {
            return Ok(0);
        }

        let mut removed = Vec::with_capacity(complete.len());
        for id in &complete {
            if let Some(rec) = state.uploads.remove(id) {
                removed.push(rec);
            }
        }
        if let Err(e) = self.commit(&state) {
            for rec in removed {
                state.uploads.insert(rec.id.clone(), rec);
            }
            return Err(e);
        }
        Ok(complete.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus_types::ChunkMeta;
    use std::sync::Arc;

    fn open_store(dir: &Path) -> IndexStore {
        IndexStore::open(dir).unwrap()
    }

    fn sample_meta(path: &str, size: u64) -> FileMeta {
        let mut meta = FileMeta::new(path);
        meta.etag = format!("etag-{path}");
        meta.size = size;
        meta.chunks = vec![ChunkMeta::new(0, size, false)];
        meta
    }

    #[test]
    fn put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let cancel = CancelToken::new();

        store.put(&cancel, sample_meta("docs/report.pdf", 4096)).unwrap();
        let fetched = store.get(&cancel, "docs/report.pdf").unwrap();
        assert_eq!(fetched.etag, "etag-docs/report.pdf");
        assert_eq!(fetched.size, 4096);
        assert_eq!(fetched.chunks, vec![ChunkMeta::new(0, 4096, false)]);
        assert!(!is_zero_time(&fetched.atime_local), "atime normalized to now");
        assert!(!is_zero_time(&fetched.mtime_remote));
    }

    #[test]
    fn get_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let err = store.get(&CancelToken::new(), "missing.txt").unwrap_err();
        assert!(matches!(err, CirrusError::NotFound));
    }

    #[test]
    fn put_rejects_empty_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let err = store
            .put(&CancelToken::new(), FileMeta::new(""))
            .unwrap_err();
        assert!(err.to_string().contains("must not be empty"));
    }

    #[test]
    fn put_overwrites_existing() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let cancel = CancelToken::new();

        store.put(&cancel, sample_meta("file.bin", 1024)).unwrap();
        let mut updated = sample_meta("file.bin", 2048);
        updated.chunks[0].dirty = true;
        store.put(&cancel, updated).unwrap();

        let fetched = store.get(&cancel, "file.bin").unwrap();
        assert_eq!(fetched.size, 2048);
        assert!(fetched.chunks[0].dirty);
    }

    #[test]
    fn get_bumps_and_persists_atime() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let cancel = CancelToken::new();

        store.put(&cancel, sample_meta("a", 1)).unwrap();
        let first = store.get(&cancel, "a").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = store.get(&cancel, "a").unwrap();
        assert!(second.atime_local > first.atime_local);

        // The bump survives a reopen.
        drop(store);
        let reopened = open_store(dir.path());
        let metas = reopened.list_lru(&cancel, 0).unwrap();
        assert_eq!(metas[0].atime_local, second.atime_local);
    }

    #[test]
    fn update_applies_closure_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let cancel = CancelToken::new();

        store.put(&cancel, sample_meta("a", 10)).unwrap();
        let updated = store
            .update(&cancel, "a", &|mut meta| {
                meta.size = 20;
                meta.etag = "etag-v2".into();
                Ok(meta)
            })
            .unwrap();
        assert_eq!(updated.size, 20);

        let fetched = store.get(&cancel, "a").unwrap();
        assert_eq!(fetched.size, 20);
        assert_eq!(fetched.etag, "etag-v2");
    }

    #[test]
    fn update_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let err = store
            .update(&CancelToken::new(), "nope", &|meta| Ok(meta))
            .unwrap_err();
        assert!(matches!(err, CirrusError::NotFound));
    }

    #[test]
    fn update_closure_error_leaves_entry_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let cancel = CancelToken::new();

        store.put(&cancel, sample_meta("a", 10)).unwrap();
        let err = store
            .update(&cancel, "a", &|_| Err(CirrusError::Other("boom".into())))
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert_eq!(store.get(&cancel, "a").unwrap().size, 10);
    }

    #[test]
    fn update_pins_path_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let cancel = CancelToken::new();

        store.put(&cancel, sample_meta("a", 10)).unwrap();
        let updated = store
            .update(&cancel, "a", &|mut meta| {
                meta.path = "b".into();
                Ok(meta)
            })
            .unwrap();
        assert_eq!(updated.path, "a");
        assert!(store.get(&cancel, "a").is_ok());
        assert!(matches!(
            store.get(&cancel, "b").unwrap_err(),
            CirrusError::NotFound
        ));
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let cancel = CancelToken::new();

        store.put(&cancel, sample_meta("a", 1)).unwrap();
        store.delete(&cancel, "a").unwrap();
        store.delete(&cancel, "a").unwrap();
        assert!(matches!(
            store.get(&cancel, "a").unwrap_err(),
            CirrusError::NotFound
        ));
    }

    #[test]
    fn lru_orders_by_atime_with_path_tiebreak() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let cancel = CancelToken::new();

        let t1 = Utc::now();
        let t2 = t1 + chrono::Duration::seconds(1);

        for (path, atime) in [("b", t1), ("c", t2), ("a", t1)] {
            let mut meta = sample_meta(path, 1);
            meta.atime_local = atime;
            store.put(&cancel, meta).unwrap();
        }

        let metas = store.list_lru(&cancel, 0).unwrap();
        let paths: Vec<&str> = metas.iter().map(|m| m.path.as_str()).collect();
        assert_eq!(paths, vec!["a", "b", "c"]);
    }

    #[test]
    fn lru_limit_semantics() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let cancel = CancelToken::new();

        for path in ["a", "b", "c"] {
            store.put(&cancel, sample_meta(path, 1)).unwrap();
        }

        assert_eq!(store.list_lru(&cancel, 0).unwrap().len(), 3);
        assert_eq!(store.list_lru(&cancel, 2).unwrap().len(), 2);
        assert_eq!(store.list_lru(&cancel, 10).unwrap().len(), 3);
    }

    #[test]
    fn add_upload_assigns_sequential_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let cancel = CancelToken::new();

        let first = store
            .add_upload(&cancel, UploadRecord::queued("a", 0, 4))
            .unwrap();
        let second = store
            .add_upload(&cancel, UploadRecord::queued("a", 4, 4))
            .unwrap();
        assert_eq!(first.id, "upl-00000000000000000001");
        assert_eq!(second.id, "upl-00000000000000000002");
        assert!(!is_zero_time(&first.created_at));
        assert!(!is_zero_time(&first.updated_at));

        // The sequence survives a reopen; ids never repeat.
        drop(store);
        let reopened = open_store(dir.path());
        let third = reopened
            .add_upload(&cancel, UploadRecord::queued("b", 0, 4))
            .unwrap();
        assert_eq!(third.id, "upl-00000000000000000003");
    }

    #[test]
    fn list_uploads_is_id_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let cancel = CancelToken::new();

        for offset in [0u64, 8, 16] {
            store
                .add_upload(&cancel, UploadRecord::queued("a", offset, 8))
                .unwrap();
        }
        let records = store.list_uploads(&cancel).unwrap();
        let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        assert_eq!(records[0].offset, 0);
        assert_eq!(records[2].offset, 16);
    }

    #[test]
    fn update_status_increments_attempts_and_bumps_updated_at() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let cancel = CancelToken::new();

        let rec = store
            .add_upload(&cancel, UploadRecord::queued("a", 0, 4))
            .unwrap();

        let started = store
            .update_upload_status(&cancel, &rec.id, UploadStatus::InProgress, "")
            .unwrap();
        assert_eq!(started.attempts, 1);
        assert!(started.updated_at > rec.updated_at);

        let failed = store
            .update_upload_status(&cancel, &rec.id, UploadStatus::Failed, "remote 500")
            .unwrap();
        assert_eq!(failed.attempts, 2);
        assert!(failed.updated_at > started.updated_at);
        assert_eq!(failed.last_error, "remote 500");
    }

    #[test]
    fn update_status_unknown_id_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let err = store
            .update_upload_status(&CancelToken::new(), "upl-404", UploadStatus::Complete, "")
            .unwrap_err();
        assert!(matches!(err, CirrusError::NotFound));
    }

    #[test]
    fn remove_upload_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let cancel = CancelToken::new();

        let rec = store
            .add_upload(&cancel, UploadRecord::queued("a", 0, 4))
            .unwrap();
        store.remove_upload(&cancel, &rec.id).unwrap();
        store.remove_upload(&cancel, &rec.id).unwrap();
        assert!(store.list_uploads(&cancel).unwrap().is_empty());
    }

    #[test]
    fn compact_drops_only_complete_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let cancel = CancelToken::new();

        let done = store
            .add_upload(&cancel, UploadRecord::queued("a", 0, 4))
            .unwrap();
        let failed = store
            .add_upload(&cancel, UploadRecord::queued("a", 4, 4))
            .unwrap();
        let pending = store
            .add_upload(&cancel, UploadRecord::queued("a", 8, 4))
            .unwrap();

        store
            .update_upload_status(&cancel, &done.id, UploadStatus::Complete, "")
            .unwrap();
        store
            .update_upload_status(&cancel, &failed.id, UploadStatus::Failed, "permanent")
            .unwrap();

        assert_eq!(store.compact_uploads(&cancel).unwrap(), 1);
        let remaining: Vec<String> = store
            .list_uploads(&cancel)
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(remaining, vec![failed.id, pending.id]);
        assert_eq!(store.compact_uploads(&cancel).unwrap(), 0);
    }

    #[test]
    fn concurrent_updates_never_lose_effects() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(open_store(dir.path()));
        let cancel = CancelToken::new();

        store.put(&cancel, FileMeta::new("counter")).unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            let cancel = cancel.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..10 {
                    store
                        .update(&cancel, "counter", &|mut meta| {
                            meta.size += 1;
                            Ok(meta)
                        })
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.get(&cancel, "counter").unwrap().size, 80);
    }

    #[test]
    fn reopen_preserves_everything() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancelToken::new();

        let (metas_before, uploads_before) = {
            let store = open_store(dir.path());
            store.put(&cancel, sample_meta("x/y", 128)).unwrap();
            let mut dirty = sample_meta("z", 64);
            dirty.chunks[0].dirty = true;
            store.put(&cancel, dirty).unwrap();
            store
                .add_upload(&cancel, UploadRecord::queued("z", 0, 64))
                .unwrap();
            (
                store.list_lru(&cancel, 0).unwrap(),
                store.list_uploads(&cancel).unwrap(),
            )
        };

        let store = open_store(dir.path());
        assert_eq!(store.list_lru(&cancel, 0).unwrap(), metas_before);
        assert_eq!(store.list_uploads(&cancel).unwrap(), uploads_before);
    }

    #[test]
    fn newer_schema_refuses_to_open() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(INDEX_FILE),
            r#"{"schema_version": 99, "upload_seq": 0, "files": {}, "uploads": {}}"#,
        )
        .unwrap();

        let err = IndexStore::open(dir.path()).unwrap_err();
        assert!(matches!(err, CirrusError::UnknownSchema(99)));
    }

    #[test]
    fn versionless_file_migrates_forward() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(INDEX_FILE),
            r#"{"files": {}, "uploads": {}}"#,
        )
        .unwrap();

        let store = IndexStore::open(dir.path()).unwrap();
        drop(store);

        // Migration is persisted and idempotent on reopen.
        let raw = std::fs::read_to_string(dir.path().join(INDEX_FILE)).unwrap();
        assert!(raw.contains("\"schema_version\":1"));
        IndexStore::open(dir.path()).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn second_open_is_locked_out() {
        let dir = tempfile::tempdir().unwrap();
        let _store = open_store(dir.path());
        let err = IndexStore::open(dir.path()).unwrap_err();
        assert!(matches!(err, CirrusError::Locked(_)), "got {err}");
    }

    #[test]
    fn cancelled_operations_have_no_effect() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let live = CancelToken::new();
        let cancelled = CancelToken::new();
        cancelled.cancel();

        assert!(matches!(
            store.put(&cancelled, sample_meta("a", 1)).unwrap_err(),
            CirrusError::Cancelled
        ));
        assert!(matches!(
            store
                .add_upload(&cancelled, UploadRecord::queued("a", 0, 1))
                .unwrap_err(),
            CirrusError::Cancelled
        ));
        assert!(store.list_lru(&live, 0).unwrap().is_empty());
        assert!(store.list_uploads(&live).unwrap().is_empty());
    }
}

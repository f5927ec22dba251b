mod store;

pub use store::IndexStore;

use cirrus_types::{FileMeta, Result, UploadRecord, UploadStatus};

use crate::cancel::CancelToken;

/// Durable metadata store for cached objects and the upload journal.
///
/// The index is the single writer for all persisted cache metadata. Every
/// operation takes a cancellation token and fails without partial effect
/// when the token has tripped. Mutations are fsync-durable on return: after
/// a successful call, a crash-restart reopens to the same state.
pub trait CacheIndex: Send + Sync {
    /// Insert or replace metadata for the path. Zero timestamps are
    /// normalized to now.
    fn put(&self, cancel: &CancelToken, meta: FileMeta) -> Result<()>;

    /// Fetch metadata for the path, refreshing `atime_local` as a persisted
    /// side effect. Fails with `NotFound`.
    fn get(&self, cancel: &CancelToken, path: &str) -> Result<FileMeta>;

    /// Atomically mutate metadata for the path. `apply` must be pure; it is
    /// retried never and runs under the writer lock. Fails with `NotFound`.
    fn update(
        &self,
        cancel: &CancelToken,
        path: &str,
        apply: &dyn Fn(FileMeta) -> Result<FileMeta>,
    ) -> Result<FileMeta>;

    /// Remove metadata for the path. Removing a missing key is not an error.
    fn delete(&self, cancel: &CancelToken, path: &str) -> Result<()>;

    /// All metadata ordered by `atime_local` ascending, ties broken by path.
    /// `limit == 0` means unlimited.
    fn list_lru(&self, cancel: &CancelToken, limit: usize) -> Result<Vec<FileMeta>>;

    /// Append an upload record. A blank id is assigned from the persistent
    /// upload sequence; `created_at`/`updated_at` are stamped.
    fn add_upload(&self, cancel: &CancelToken, record: UploadRecord) -> Result<UploadRecord>;

    /// All upload records, id ascending.
    fn list_uploads(&self, cancel: &CancelToken) -> Result<Vec<UploadRecord>>;

    /// Transition an upload record: sets status and `last_error`, increments
    /// `attempts`, bumps `updated_at` strictly. Fails with `NotFound`.
    fn update_upload_status(
        &self,
        cancel: &CancelToken,
        id: &str,
        status: UploadStatus,
        last_error: &str,
    ) -> Result<UploadRecord>;

    /// Remove a journal record (idempotent). Used when a newer overlapping
    /// dirty write replaces a queued record.
    fn remove_upload(&self, cancel: &CancelToken, id: &str) -> Result<()>;

    /// Drop records whose status is `complete`. Failed records are retained
    /// for inspection. Returns the number removed.
    fn compact_uploads(&self, cancel: &CancelToken) -> Result<usize>;
}

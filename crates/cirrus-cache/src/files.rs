use std::fs::File;
use std::io::{self, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tempfile::NamedTempFile;
use tracing::debug;

use cirrus_types::{CirrusError, Result};

use crate::paths;

/// Owns the per-object sparse files under `<cache_root>/objects`.
///
/// Every cached object is one file whose location mirrors its logical path.
/// Mutation goes through a [`Container`]: writes land on a staging file that
/// starts as a copy of the committed content and replaces it atomically on
/// close, so a crash mid-write never corrupts the committed version.
pub struct ContainerStore {
    root: PathBuf,
}

impl ContainerStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Open a container for the logical path, seeding the staging file from
    /// any committed content.
    pub fn open(&self, logical: &str) -> Result<Container> {
        let final_path = paths::resolve(&self.root, logical)?;
        let parent = final_path
            .parent()
            .ok_or_else(|| CirrusError::InvalidPath(logical.to_string()))?;
        std::fs::create_dir_all(parent)?;

        let name = final_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| CirrusError::InvalidPath(logical.to_string()))?;
        let staging = tempfile::Builder::new()
            .prefix(&format!("{name}.tmp-"))
            .rand_bytes(6)
            .tempfile_in(parent)?;

        copy_existing(&final_path, &staging)?;

        // Sparse allocation needs no explicit hint here: positional writes
        // beyond EOF leave holes on every filesystem we run on.
        Ok(Container {
            inner: Mutex::new(Some(Staged {
                staging,
                final_path,
            })),
        })
    }

    /// Positional read of the committed file, without staging.
    ///
    /// Returns the bytes actually available; reads beyond EOF come back
    /// short. A missing committed file is `NotFound`.
    pub fn read_committed(&self, logical: &str, offset: u64, length: usize) -> Result<Vec<u8>> {
        let path = paths::resolve(&self.root, logical)?;
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(CirrusError::NotFound),
            Err(e) => return Err(e.into()),
        };

        let mut buf = vec![0u8; length];
        let filled = read_full_at(&file, &mut buf, offset)?;
        buf.truncate(filled);
        Ok(buf)
    }

    /// Size of the committed file, `None` when absent.
    pub fn committed_size(&self, logical: &str) -> Result<Option<u64>> {
        let path = paths::resolve(&self.root, logical)?;
        match std::fs::metadata(&path) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the committed file. Missing files are not an error.
    pub fn remove(&self, logical: &str) -> Result<()> {
        let path = paths::resolve(&self.root, logical)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "container already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

struct Staged {
    staging: NamedTempFile,
    final_path: PathBuf,
}

/// A mutable cache file. All writes land on the staging copy; `close`
/// commits it atomically over the committed path.
pub struct Container {
    // `None` once closed.
    inner: Mutex<Option<Staged>>,
}

impl Container {
    /// Positional write into the staging file, growing it sparsely.
    pub fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        let guard = self.inner.lock().unwrap();
        let staged = guard.as_ref().ok_or(CirrusError::Closed)?;
        write_all_at_offset(staged.staging.as_file(), buf, offset)?;
        Ok(buf.len())
    }

    /// Positional read from the staging file; short reads at EOF.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let guard = self.inner.lock().unwrap();
        let staged = guard.as_ref().ok_or(CirrusError::Closed)?;
        read_full_at(staged.staging.as_file(), buf, offset)
    }

    /// Resize the staging file.
    pub fn truncate(&self, size: u64) -> Result<()> {
        let guard = self.inner.lock().unwrap();
        let staged = guard.as_ref().ok_or(CirrusError::Closed)?;
        staged.staging.as_file().set_len(size)?;
        Ok(())
    }

    /// Flush staged data and metadata to disk.
    pub fn fsync(&self) -> Result<()> {
        let guard = self.inner.lock().unwrap();
        let staged = guard.as_ref().ok_or(CirrusError::Closed)?;
        staged.staging.as_file().sync_all()?;
        Ok(())
    }

    /// Fsync, then atomically rename the staging file over the committed
    /// path. Until this returns, the committed path holds the previous
    /// version. Idempotent: later calls are no-ops.
    pub fn close(&self) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        let Some(staged) = guard.take() else {
            return Ok(());
        };

        staged.staging.as_file().sync_all()?;
        let final_path = staged.final_path;
        staged
            .staging
            .persist(&final_path)
            .map_err(|e| CirrusError::Io(e.error))?;

        // Make the rename itself durable.
        if let Some(parent) = final_path.parent() {
            File::open(parent)?.sync_all()?;
        }
        Ok(())
    }
}

/// Positional read of one slice. The non-unix fallback seeks the shared
/// handle; callers serialize access to the file (the container mutex, or
/// exclusive ownership in the chunk reader).
#[cfg(unix)]
pub(crate) fn read_at_offset(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(not(unix))]
pub(crate) fn read_at_offset(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::io::Read;
    let mut file = file;
    file.seek(SeekFrom::Start(offset))?;
    file.read(buf)
}

#[cfg(unix)]
fn write_all_at_offset(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(not(unix))]
fn write_all_at_offset(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::io::Write;
    let mut file = file;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(buf)
}

/// Fill `buf` from `offset`, stopping early only at EOF.
fn read_full_at(file: &File, buf: &mut [u8], offset: u64) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match read_at_offset(file, &mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

fn copy_existing(final_path: &Path, staging: &NamedTempFile) -> Result<()> {
    let mut source = match File::open(final_path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let mut dest = staging.as_file();
    io::copy(&mut source, &mut dest)?;
    dest.seek(SeekFrom::Start(0))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &Path) -> ContainerStore {
        ContainerStore::new(dir.join("objects"))
    }

    #[test]
    fn write_read_roundtrip_through_commit() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let container = store.open("a/b.bin").unwrap();
        container.write_at(b"hello world", 0).unwrap();
        container.fsync().unwrap();
        container.close().unwrap();

        let bytes = store.read_committed("a/b.bin", 6, 5).unwrap();
        assert_eq!(&bytes, b"world");
        assert_eq!(store.committed_size("a/b.bin").unwrap(), Some(11));
    }

    #[test]
    fn sparse_writes_and_short_reads() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let container = store.open("sparse.bin").unwrap();
        container.write_at(b"tail", 100).unwrap();

        // The hole reads back as zeroes.
        let mut buf = [0xFFu8; 4];
        assert_eq!(container.read_at(&mut buf, 50).unwrap(), 4);
        assert_eq!(buf, [0, 0, 0, 0]);

        // Reads beyond EOF come back short, not as errors.
        let mut buf = [0u8; 16];
        assert_eq!(container.read_at(&mut buf, 100).unwrap(), 4);
        assert_eq!(&buf[..4], b"tail");
        assert_eq!(container.read_at(&mut buf, 200).unwrap(), 0);

        container.close().unwrap();
    }

    #[test]
    fn truncate_resizes_staging() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let container = store.open("t.bin").unwrap();
        container.write_at(b"0123456789", 0).unwrap();
        container.truncate(4).unwrap();
        container.close().unwrap();

        let bytes = store.read_committed("t.bin", 0, 16).unwrap();
        assert_eq!(&bytes, b"0123");
    }

    #[test]
    fn committed_content_visible_until_close() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let first = store.open("swap.bin").unwrap();
        first.write_at(b"version-1", 0).unwrap();
        first.close().unwrap();

        // Staging starts as a copy of the committed file.
        let second = store.open("swap.bin").unwrap();
        let mut buf = [0u8; 9];
        assert_eq!(second.read_at(&mut buf, 0).unwrap(), 9);
        assert_eq!(&buf, b"version-1");

        second.write_at(b"2", 8).unwrap();

        // The committed path still holds the previous version.
        let committed = store.read_committed("swap.bin", 0, 9).unwrap();
        assert_eq!(&committed, b"version-1");

        second.close().unwrap();
        let committed = store.read_committed("swap.bin", 0, 9).unwrap();
        assert_eq!(&committed, b"version-2");
    }

    #[test]
    fn close_is_idempotent_and_finalizes() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let container = store.open("c.bin").unwrap();
        container.write_at(b"data", 0).unwrap();
        container.close().unwrap();
        container.close().unwrap();

        assert!(matches!(
            container.write_at(b"late", 0).unwrap_err(),
            CirrusError::Closed
        ));
        let mut buf = [0u8; 4];
        assert!(matches!(
            container.read_at(&mut buf, 0).unwrap_err(),
            CirrusError::Closed
        ));
        assert!(matches!(
            container.truncate(0).unwrap_err(),
            CirrusError::Closed
        ));
        assert!(matches!(container.fsync().unwrap_err(), CirrusError::Closed));
    }

    #[test]
    fn abandoned_staging_leaves_committed_intact() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let first = store.open("a.bin").unwrap();
        first.write_at(b"keep me", 0).unwrap();
        first.close().unwrap();

        {
            let abandoned = store.open("a.bin").unwrap();
            abandoned.write_at(b"discard", 0).unwrap();
            // Dropped without close: the staging file evaporates.
        }

        let committed = store.read_committed("a.bin", 0, 7).unwrap();
        assert_eq!(&committed, b"keep me");
    }

    #[test]
    fn read_committed_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        assert!(matches!(
            store.read_committed("no/such.bin", 0, 4).unwrap_err(),
            CirrusError::NotFound
        ));
        assert_eq!(store.committed_size("no/such.bin").unwrap(), None);
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let container = store.open("r.bin").unwrap();
        container.write_at(b"x", 0).unwrap();
        container.close().unwrap();

        store.remove("r.bin").unwrap();
        store.remove("r.bin").unwrap();
        assert_eq!(store.committed_size("r.bin").unwrap(), None);
    }

    #[test]
    fn escaping_paths_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        assert!(store.open("../escape").is_err());
        assert!(store.read_committed("/abs", 0, 1).is_err());
        assert!(store.remove("a/../../b").is_err());
    }
}

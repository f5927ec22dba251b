use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A contiguous byte range of a cached object backed on local disk.
///
/// A chunk is either entirely dirty (bytes not yet confirmed uploaded) or
/// entirely clean. Within a [`FileMeta`], chunks are disjoint and sorted by
/// offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMeta {
    pub offset: u64,
    pub length: u64,
    pub dirty: bool,
}

impl ChunkMeta {
    pub fn new(offset: u64, length: u64, dirty: bool) -> Self {
        Self {
            offset,
            length,
            dirty,
        }
    }

    /// Exclusive end offset of the chunk.
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Metadata for one cached object, keyed by its slash-normalized relative path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMeta {
    pub path: String,
    #[serde(default)]
    pub etag: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub chunks: Vec<ChunkMeta>,
    #[serde(default = "zero_time")]
    pub mtime_remote: DateTime<Utc>,
    #[serde(default = "zero_time")]
    pub atime_local: DateTime<Utc>,
}

impl FileMeta {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            etag: String::new(),
            size: 0,
            chunks: Vec::new(),
            mtime_remote: zero_time(),
            atime_local: zero_time(),
        }
    }

    /// A file is evictable only when no chunk is dirty.
    pub fn is_evictable(&self) -> bool {
        self.chunks.iter().all(|c| !c.dirty)
    }
}

/// The unset-timestamp sentinel. Stores normalize it to "now" on write.
pub fn zero_time() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

/// Whether a timestamp still carries the unset sentinel.
pub fn is_zero_time(t: &DateTime<Utc>) -> bool {
    *t == DateTime::<Utc>::UNIX_EPOCH
}

/// Fold a new range into a chunk list, preserving the chunk invariants.
///
/// Existing chunks that partially overlap the incoming range are split and
/// their non-overlapping remainders keep their dirty flag; fully covered
/// chunks are replaced. Adjacent runs with the same dirty flag coalesce into
/// a single chunk, so one write never produces more than one journal entry
/// per dirty range.
pub fn apply_range(chunks: &[ChunkMeta], incoming: ChunkMeta) -> Vec<ChunkMeta> {
    if incoming.length == 0 {
        return chunks.to_vec();
    }

    let mut out: Vec<ChunkMeta> = Vec::with_capacity(chunks.len() + 2);
    for c in chunks {
        if c.end() <= incoming.offset || c.offset >= incoming.end() {
            out.push(*c);
            continue;
        }
        if c.offset < incoming.offset {
            out.push(ChunkMeta::new(c.offset, incoming.offset - c.offset, c.dirty));
        }
        if c.end() > incoming.end() {
            out.push(ChunkMeta::new(incoming.end(), c.end() - incoming.end(), c.dirty));
        }
    }
    out.push(incoming);
    out.sort_by_key(|c| c.offset);
    coalesce_sorted(out)
}

/// Merge adjacent same-flag runs in an offset-sorted, disjoint chunk list.
pub fn coalesce_sorted(chunks: Vec<ChunkMeta>) -> Vec<ChunkMeta> {
    let mut merged: Vec<ChunkMeta> = Vec::with_capacity(chunks.len());
    for c in chunks {
        match merged.last_mut() {
            Some(prev) if prev.end() == c.offset && prev.dirty == c.dirty => {
                prev.length += c.length;
            }
            _ => merged.push(c),
        }
    }
    merged
}

/// Return the chunk whose range contains `offset`, if any.
pub fn chunk_containing(chunks: &[ChunkMeta], offset: u64) -> Option<ChunkMeta> {
    chunks
        .iter()
        .find(|c| c.offset <= offset && offset < c.end())
        .copied()
}

/// Whether the chunk list fully covers `[offset, offset+length)`.
///
/// Assumes the invariant holds: chunks disjoint and sorted by offset.
pub fn covers(chunks: &[ChunkMeta], offset: u64, length: u64) -> bool {
    if length == 0 {
        return true;
    }
    let end = offset + length;
    let mut cursor = offset;
    for c in chunks {
        if c.offset > cursor {
            break;
        }
        if c.end() > cursor {
            cursor = c.end();
        }
        if cursor >= end {
            return true;
        }
    }
    cursor >= end
}

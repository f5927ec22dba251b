use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::PathBuf;

use cirrus_types::{CirrusError, Result, UploadRecord};

use crate::cancel::CancelToken;
use crate::paths;

use super::{ChunkData, ChunkSource};

/// Reads chunk bytes straight from the committed container files on disk.
pub struct LocalChunkSource {
    root: PathBuf,
}

impl LocalChunkSource {
    /// `root` is the objects directory under the cache root.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ChunkSource for LocalChunkSource {
    fn open_chunk(&self, cancel: &CancelToken, record: &UploadRecord) -> Result<Box<dyn ChunkData>> {
        cancel.check()?;

        let path = paths::resolve(&self.root, &record.path)?;
        let file = File::open(&path)?;

        let file_size = file.metadata()?.len();
        if record.offset > file_size {
            return Err(CirrusError::Other(format!(
                "chunk at {}+{} starts past end of {} ({file_size} bytes)",
                record.offset, record.length, record.path
            )));
        }

        // A zero length means "the rest of the file".
        let length = if record.length == 0 {
            file_size - record.offset
        } else {
            record.length
        };

        Ok(Box::new(SectionReader::new(file, record.offset, length)))
    }
}

/// A `Read + Seek` view over `[start, start+length)` of a file.
///
/// Seeks are relative to the section, reads never cross its end.
pub struct SectionReader {
    file: File,
    start: u64,
    length: u64,
    pos: u64,
}

impl SectionReader {
    pub fn new(file: File, start: u64, length: u64) -> Self {
        Self {
            file,
            start,
            length,
            pos: 0,
        }
    }
}

impl Read for SectionReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.length {
            return Ok(0);
        }
        let remaining = (self.length - self.pos) as usize;
        let want = buf.len().min(remaining);
        let n = crate::files::read_at_offset(&self.file, &mut buf[..want], self.start + self.pos)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for SectionReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target: i64 = match pos {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::Current(delta) => self.pos as i64 + delta,
            SeekFrom::End(delta) => self.length as i64 + delta,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of section",
            ));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}

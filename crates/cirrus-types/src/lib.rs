pub mod error;
pub mod meta;
pub mod upload;

pub use error::{CirrusError, Result};
pub use meta::{ChunkMeta, FileMeta};
pub use upload::{UploadRecord, UploadStatus};

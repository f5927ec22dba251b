use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::meta::zero_time;

/// Lifecycle state of a pending background upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    /// Waiting for uploader pickup.
    Queued,
    /// An upload is currently executing.
    InProgress,
    /// Uploaded successfully; the record may be compacted away.
    Complete,
    /// Exhausted retries or hit a permanent error; requires intervention.
    Failed,
}

impl UploadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UploadStatus::Queued => "queued",
            UploadStatus::InProgress => "in_progress",
            UploadStatus::Complete => "complete",
            UploadStatus::Failed => "failed",
        }
    }

    /// Terminal states are never re-enqueued by the uploader.
    pub fn is_terminal(self) -> bool {
        matches!(self, UploadStatus::Complete | UploadStatus::Failed)
    }
}

impl std::fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One queued or in-progress chunk upload in the journal.
///
/// `attempts` increments on every status mutation; the observed retry count
/// is `attempts / 2` (queued→in_progress is one increment, in_progress→next
/// state is another).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadRecord {
    pub id: String,
    pub path: String,
    pub offset: u64,
    pub length: u64,
    pub status: UploadStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: String,
    #[serde(default = "zero_time")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "zero_time")]
    pub updated_at: DateTime<Utc>,
}

impl UploadRecord {
    /// A fresh queued record for a dirty range. The index assigns the id.
    pub fn queued(path: impl Into<String>, offset: u64, length: u64) -> Self {
        Self {
            id: String::new(),
            path: path.into(),
            offset,
            length,
            status: UploadStatus::Queued,
            attempts: 0,
            last_error: String::new(),
            created_at: zero_time(),
            updated_at: zero_time(),
        }
    }

    /// Exclusive end offset of the record's range.
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// Observed retry count under the two-increments-per-cycle convention.
    pub fn observed_retries(&self) -> u32 {
        self.attempts / 2
    }
}

use cirrus_types::UploadRecord;

/// Failure reasons reported through [`UploaderMetrics::record_failed`].
pub const FAIL_REASON_MAX_ATTEMPTS: &str = "max_attempts";
pub const FAIL_REASON_OPEN_CHUNK: &str = "open_chunk";
pub const FAIL_REASON_ETAG_MISMATCH: &str = "etag_mismatch";
pub const FAIL_REASON_BACKEND_ERROR: &str = "backend_error";

/// Telemetry sink for the uploader. The host wires its own collector; the
/// default discards everything.
pub trait UploaderMetrics: Send + Sync {
    fn record_queued(&self, record: &UploadRecord);
    fn record_started(&self, record: &UploadRecord);
    fn record_retried(&self, record: &UploadRecord);
    fn record_completed(&self, record: &UploadRecord);
    fn record_failed(&self, record: &UploadRecord, reason: &str);
}

/// Sink that discards all events.
#[derive(Debug, Default)]
pub struct NoopMetrics;

impl UploaderMetrics for NoopMetrics {
    fn record_queued(&self, _record: &UploadRecord) {}
    fn record_started(&self, _record: &UploadRecord) {}
    fn record_retried(&self, _record: &UploadRecord) {}
    fn record_completed(&self, _record: &UploadRecord) {}
    fn record_failed(&self, _record: &UploadRecord, _reason: &str) {}
}

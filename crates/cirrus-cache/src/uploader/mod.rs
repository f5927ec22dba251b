mod chunks;

pub use chunks::{LocalChunkSource, SectionReader};

use std::collections::{HashMap, HashSet};
use std::io::{Read, Seek};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{Receiver, SendTimeoutError, Sender};
use tracing::{debug, error, warn};

use cirrus_types::{CirrusError, Result, UploadRecord, UploadStatus};

use crate::cancel::CancelToken;
use crate::index::CacheIndex;
use crate::metrics::{
    NoopMetrics, UploaderMetrics, FAIL_REASON_BACKEND_ERROR, FAIL_REASON_ETAG_MISMATCH,
    FAIL_REASON_MAX_ATTEMPTS, FAIL_REASON_OPEN_CHUNK,
};

/// Streamed chunk bytes handed to the remote store.
pub trait ChunkData: Read + Seek + Send {}

impl<T: Read + Seek + Send> ChunkData for T {}

impl std::fmt::Debug for dyn ChunkData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn ChunkData")
    }
}

/// Supplies the bytes for an upload record: a bounded stream over
/// `[offset, offset+length)` of the record's container file.
pub trait ChunkSource: Send + Sync {
    fn open_chunk(&self, cancel: &CancelToken, record: &UploadRecord) -> Result<Box<dyn ChunkData>>;
}

/// The remote object store the journal drains into. Implementations classify
/// failures through the error type: `Transient` retries under backoff,
/// `EtagMismatch` is terminal, `Cancelled` requeues without sleeping,
/// anything else is permanent.
pub trait RemoteStore: Send + Sync {
    fn upload(
        &self,
        cancel: &CancelToken,
        record: &UploadRecord,
        data: &mut dyn ChunkData,
    ) -> Result<()>;
}

/// Sleep seam so tests can observe exact backoff delays.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration, cancel: &CancelToken);
}

/// Production sleeper: waits on the cancellation token so backoff wakes
/// promptly on shutdown.
#[derive(Debug, Default)]
pub struct TokenSleeper;

impl Sleeper for TokenSleeper {
    fn sleep(&self, duration: Duration, cancel: &CancelToken) {
        cancel.sleep(duration);
    }
}

/// Observer invoked after a record reaches `complete`. The cache façade
/// registers one to flip the matching chunk's dirty flag.
pub trait UploadListener: Send + Sync {
    fn upload_complete(&self, record: &UploadRecord);
}

/// Pause/resume surface consumed by the failsafe monitor.
pub trait UploaderController: Send + Sync {
    fn pause(&self, cancel: &CancelToken) -> Result<()>;
    fn resume(&self, cancel: &CancelToken) -> Result<()>;
}

/// Uploader runtime tuning. Zero values fall back to conservative defaults.
#[derive(Debug, Clone)]
pub struct UploaderConfig {
    pub max_concurrent_uploads: usize,
    /// Cap on observed retries (`attempts / 2`), not raw increments.
    pub max_attempts: u32,
    pub base_retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub poll_interval: Duration,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            max_concurrent_uploads: 2,
            max_attempts: 3,
            base_retry_delay: Duration::from_millis(100),
            max_retry_delay: Duration::from_secs(5),
            poll_interval: Duration::from_millis(200),
        }
    }
}

impl UploaderConfig {
    fn normalized(mut self) -> Self {
        let defaults = UploaderConfig::default();
        if self.max_concurrent_uploads == 0 {
            self.max_concurrent_uploads = defaults.max_concurrent_uploads;
        }
        if self.max_attempts == 0 {
            self.max_attempts = defaults.max_attempts;
        }
        if self.base_retry_delay.is_zero() {
            self.base_retry_delay = defaults.base_retry_delay;
        }
        if self.max_retry_delay.is_zero() {
            self.max_retry_delay = defaults.max_retry_delay;
        }
        if self.max_retry_delay < self.base_retry_delay {
            self.max_retry_delay = self.base_retry_delay;
        }
        if self.poll_interval.is_zero() {
            self.poll_interval = defaults.poll_interval;
        }
        self
    }
}

/// Coordinates of a record currently held by a worker.
struct InflightRange {
    path: String,
    offset: u64,
    length: u64,
}

#[derive(Default)]
struct LoopState {
    queued: HashSet<String>,
    inflight: HashMap<String, InflightRange>,
    tasks: Option<Sender<UploadRecord>>,
    running: bool,
}

/// Outcome of a worker's attempt to claim a record.
enum Pickup {
    Start,
    AlreadyRunning,
    /// An in-flight record on the same path overlaps this one; it stays
    /// queued in the journal and a later scan retries.
    Overlapping,
}

/// Range intersection; a zero length means "through end of file".
fn ranges_overlap(a_off: u64, a_len: u64, b_off: u64, b_len: u64) -> bool {
    let a_end = if a_len == 0 { u64::MAX } else { a_off + a_len };
    let b_end = if b_len == 0 { u64::MAX } else { b_off + b_len };
    a_off < b_end && b_off < a_end
}

/// Pool of workers draining the upload journal.
///
/// A scan loop periodically lists the journal and feeds non-terminal records
/// through a bounded channel to the workers. The `queued`/`inflight` sets
/// make enqueueing idempotent, so the same record is never processed twice
/// concurrently no matter how often the scan sees it.
pub struct Uploader {
    cfg: UploaderConfig,
    index: Arc<dyn CacheIndex>,
    remote: Arc<dyn RemoteStore>,
    source: Arc<dyn ChunkSource>,
    metrics: Arc<dyn UploaderMetrics>,
    sleeper: Arc<dyn Sleeper>,
    listener: Option<Arc<dyn UploadListener>>,
    paused: AtomicBool,
    state: Mutex<LoopState>,
}

impl Uploader {
    pub fn new(
        cfg: UploaderConfig,
        index: Arc<dyn CacheIndex>,
        remote: Arc<dyn RemoteStore>,
        source: Arc<dyn ChunkSource>,
    ) -> Self {
        Self {
            cfg: cfg.normalized(),
            index,
            remote,
            source,
            metrics: Arc::new(NoopMetrics),
            sleeper: Arc::new(TokenSleeper),
            listener: None,
            paused: AtomicBool::new(false),
            state: Mutex::new(LoopState::default()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn UploaderMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn UploadListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Run the scan loop and worker pool until `cancel` trips.
    ///
    /// Blocks the calling thread; the cache façade runs it on a background
    /// thread. Returns `Cancelled` on orderly shutdown.
    pub fn run(&self, cancel: &CancelToken) -> Result<()> {
        let workers = self.cfg.max_concurrent_uploads.max(1);
        let (tx, rx) = crossbeam_channel::bounded::<UploadRecord>(workers * 2);

        {
            let mut state = self.state.lock().unwrap();
            if state.running {
                return Err(CirrusError::Other("uploader already running".into()));
            }
            state.running = true;
            state.tasks = Some(tx.clone());
        }

        std::thread::scope(|s| {
            for _ in 0..workers {
                let rx = rx.clone();
                s.spawn(move || self.worker(cancel, rx));
            }
            drop(rx);

            if let Err(e) = self.scan_and_queue(cancel) {
                warn!("initial upload scan failed: {e}");
            }

            loop {
                if !cancel.sleep(self.cfg.poll_interval) {
                    break;
                }
                if self.paused.load(Ordering::SeqCst) {
                    continue;
                }
                if let Err(e) = self.scan_and_queue(cancel) {
                    warn!("upload scan failed: {e}");
                }
            }

            // Stop feeding; workers drain what is left and exit when the
            // last sender drops.
            self.state.lock().unwrap().tasks = None;
            drop(tx);
        });

        let mut state = self.state.lock().unwrap();
        state.running = false;
        state.queued.clear();
        state.inflight.clear();
        Err(CirrusError::Cancelled)
    }

    /// Concise state snapshot for logs and tests.
    pub fn debug_summary(&self) -> String {
        let state = self.state.lock().unwrap();
        format!(
            "queued={} inflight={}",
            state.queued.len(),
            state.inflight.len()
        )
    }

    fn scan_and_queue(&self, cancel: &CancelToken) -> Result<()> {
        let records = self.index.list_uploads(cancel)?;
        for record in records {
            // Terminal records stay in the journal until compaction; a
            // record stuck in_progress after a crash is picked up again.
            if record.status.is_terminal() {
                continue;
            }
            self.enqueue(cancel, record);
        }
        Ok(())
    }

    fn enqueue(&self, cancel: &CancelToken, record: UploadRecord) {
        let tasks = {
            let mut state = self.state.lock().unwrap();
            if !state.running {
                return;
            }
            let Some(tasks) = state.tasks.clone() else {
                return;
            };
            if state.queued.contains(&record.id) || state.inflight.contains_key(&record.id) {
                return;
            }
            state.queued.insert(record.id.clone());
            tasks
        };

        self.metrics.record_queued(&record);

        let mut pending = record;
        loop {
            match tasks.send_timeout(pending, Duration::from_millis(50)) {
                Ok(()) => return,
                Err(SendTimeoutError::Timeout(r)) => {
                    if cancel.is_cancelled() {
                        self.unqueue(&r.id);
                        return;
                    }
                    pending = r;
                }
                Err(SendTimeoutError::Disconnected(r)) => {
                    self.unqueue(&r.id);
                    return;
                }
            }
        }
    }

    fn unqueue(&self, id: &str) {
        self.state.lock().unwrap().queued.remove(id);
    }

    /// Move a record queued → inflight, unless it is already running or an
    /// in-flight record on the same path overlaps its range. Overlapping
    /// uploads run one at a time so the newest bytes land on the remote
    /// last.
    fn start_processing(&self, record: &UploadRecord) -> Pickup {
        let mut state = self.state.lock().unwrap();
        state.queued.remove(&record.id);

        if state.inflight.contains_key(&record.id) {
            return Pickup::AlreadyRunning;
        }
        let overlapping = state.inflight.values().any(|running| {
            running.path == record.path
                && ranges_overlap(running.offset, running.length, record.offset, record.length)
        });
        if overlapping {
            return Pickup::Overlapping;
        }

        state.inflight.insert(
            record.id.clone(),
            InflightRange {
                path: record.path.clone(),
                offset: record.offset,
                length: record.length,
            },
        );
        Pickup::Start
    }

    fn finish_processing(&self, id: &str) {
        self.state.lock().unwrap().inflight.remove(id);
    }

    fn worker(&self, cancel: &CancelToken, tasks: Receiver<UploadRecord>) {
        for record in tasks {
            if cancel.is_cancelled() {
                return;
            }
            if self.paused.load(Ordering::SeqCst) {
                // Paused: do not start. The scan loop re-enqueues after resume.
                self.unqueue(&record.id);
                continue;
            }
            match self.start_processing(&record) {
                Pickup::Start => self.process_record(cancel, record),
                Pickup::AlreadyRunning => continue,
                Pickup::Overlapping => {
                    debug!(id = %record.id, "deferring behind overlapping in-flight upload");
                    continue;
                }
            }
        }
    }

    fn process_record(&self, cancel: &CancelToken, record: UploadRecord) {
        let mut finished = false;
        let id = record.id.clone();

        let attempts_before = record.attempts / 2;
        let result = self.process_inner(cancel, &record, attempts_before, &mut finished);
        if !finished {
            self.finish_processing(&id);
        }
        if let Err(e) = result {
            error!(id = %id, "upload bookkeeping failed: {e}");
        }
    }

    /// Transition a record's status, tolerating its removal by a
    /// superseding write. Returns `None` when the record left the journal
    /// mid-flight; callers skip metrics, listener, and requeueing then.
    fn transition(
        &self,
        cancel: &CancelToken,
        id: &str,
        status: UploadStatus,
        last_error: &str,
    ) -> Result<Option<UploadRecord>> {
        match self.index.update_upload_status(cancel, id, status, last_error) {
            Ok(rec) => Ok(Some(rec)),
            Err(CirrusError::NotFound) => {
                debug!(id = %id, "upload record left the journal mid-flight");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// One attempt for one record. `finished` is set when the inflight slot
    /// was already released (the backoff path releases early so the sleep
    /// does not hold the slot).
    fn process_inner(
        &self,
        cancel: &CancelToken,
        record: &UploadRecord,
        attempts_before: u32,
        finished: &mut bool,
    ) -> Result<()> {
        if attempts_before >= self.cfg.max_attempts {
            warn!(id = %record.id, "upload reached max attempts");
            if let Some(failed) =
                self.transition(cancel, &record.id, UploadStatus::Failed, "max attempts reached")?
            {
                self.metrics.record_failed(&failed, FAIL_REASON_MAX_ATTEMPTS);
            }
            return Ok(());
        }

        let Some(updated) =
            self.transition(cancel, &record.id, UploadStatus::InProgress, "")?
        else {
            return Ok(());
        };
        self.metrics.record_started(&updated);

        let mut chunk = match self.source.open_chunk(cancel, &updated) {
            Ok(chunk) => chunk,
            Err(e) => {
                error!(id = %record.id, "open chunk failed: {e}");
                if let Some(failed) = self.transition(
                    cancel,
                    &record.id,
                    UploadStatus::Failed,
                    &format!("open chunk: {e}"),
                )? {
                    self.metrics.record_failed(&failed, FAIL_REASON_OPEN_CHUNK);
                }
                return Ok(());
            }
        };

        let current_attempt = attempts_before + 1;

        match self.remote.upload(cancel, &updated, chunk.as_mut()) {
            Ok(()) => {
                if let Some(completed) =
                    self.transition(cancel, &record.id, UploadStatus::Complete, "")?
                {
                    self.metrics.record_completed(&completed);
                    if let Some(listener) = &self.listener {
                        listener.upload_complete(&completed);
                    }
                }
                Ok(())
            }
            Err(CirrusError::EtagMismatch) => {
                let msg = CirrusError::EtagMismatch.to_string();
                warn!(path = %record.path, "etag mismatch: {msg}");
                if let Some(failed) =
                    self.transition(cancel, &record.id, UploadStatus::Failed, &msg)?
                {
                    self.metrics.record_failed(&failed, FAIL_REASON_ETAG_MISMATCH);
                }
                Ok(())
            }
            Err(CirrusError::Cancelled) => {
                warn!(id = %record.id, "upload cancelled, requeueing");
                self.metrics.record_retried(&updated);
                self.transition(cancel, &record.id, UploadStatus::Queued, "cancelled")?;
                Ok(())
            }
            Err(e) if e.is_transient() && current_attempt < self.cfg.max_attempts => {
                let delay = self.backoff_delay(current_attempt);
                warn!(id = %record.id, "retrying upload in {delay:?}: {e}");
                self.metrics.record_retried(&updated);
                let Some(requeued) =
                    self.transition(cancel, &record.id, UploadStatus::Queued, &e.to_string())?
                else {
                    return Ok(());
                };
                // Release the inflight slot before sleeping so the backoff
                // does not starve other records of a worker.
                self.finish_processing(&record.id);
                *finished = true;
                self.sleeper.sleep(delay, cancel);
                self.enqueue(cancel, requeued);
                Ok(())
            }
            Err(e) => {
                let msg = e.to_string();
                warn!(id = %record.id, "upload failed: {msg}");
                if let Some(failed) =
                    self.transition(cancel, &record.id, UploadStatus::Failed, &msg)?
                {
                    self.metrics.record_failed(&failed, FAIL_REASON_BACKEND_ERROR);
                }
                Ok(())
            }
        }
    }

    /// `clamp(base · 2^(n-1), base, max)`.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let mut delay = self.cfg.base_retry_delay;
        for _ in 1..attempt {
            if delay >= self.cfg.max_retry_delay {
                break;
            }
            delay = delay.saturating_mul(2);
        }
        delay.clamp(self.cfg.base_retry_delay, self.cfg.max_retry_delay)
    }
}

impl UploaderController for Uploader {
    fn pause(&self, cancel: &CancelToken) -> Result<()> {
        cancel.check()?;
        self.paused.store(true, Ordering::SeqCst);
        debug!("uploader paused");
        Ok(())
    }

    fn resume(&self, cancel: &CancelToken) -> Result<()> {
        cancel.check()?;
        self.paused.store(false, Ordering::SeqCst);
        debug!("uploader resumed");
        Ok(())
    }
}

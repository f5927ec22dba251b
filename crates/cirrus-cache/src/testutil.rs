//! Shared fakes for unit tests: a scriptable remote store, a recording
//! sleeper, a counting metrics sink, and a fixed disk probe.

use std::collections::VecDeque;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use cirrus_types::{CirrusError, Result, UploadRecord};

use crate::cancel::CancelToken;
use crate::cleaner::DiskUsage;
use crate::metrics::UploaderMetrics;
use crate::uploader::{ChunkData, RemoteStore, Sleeper};

/// Poll `pred` until it holds or `timeout` elapses.
pub fn wait_until<F: Fn() -> bool>(timeout: Duration, pred: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    pred()
}

/// Scripted outcome for one [`FakeRemote`] upload call.
pub enum Outcome {
    Ok,
    Transient(&'static str),
    Permanent(&'static str),
    EtagMismatch,
    Cancelled,
}

/// Remote store that plays back a script of outcomes, recording every call
/// and the exact bytes streamed to it. Calls beyond the script succeed.
pub struct FakeRemote {
    script: Mutex<VecDeque<Outcome>>,
    calls: AtomicUsize,
    payloads: Mutex<Vec<Vec<u8>>>,
}

impl FakeRemote {
    pub fn new(script: Vec<Outcome>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
            payloads: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.payloads.lock().unwrap().clone()
    }
}

impl RemoteStore for FakeRemote {
    fn upload(
        &self,
        _cancel: &CancelToken,
        _record: &UploadRecord,
        data: &mut dyn ChunkData,
    ) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let mut bytes = Vec::new();
        data.read_to_end(&mut bytes)?;
        self.payloads.lock().unwrap().push(bytes);

        match self.script.lock().unwrap().pop_front() {
            None | Some(Outcome::Ok) => Ok(()),
            Some(Outcome::Transient(msg)) => Err(CirrusError::Transient(msg.into())),
            Some(Outcome::Permanent(msg)) => Err(CirrusError::Other(msg.into())),
            Some(Outcome::EtagMismatch) => Err(CirrusError::EtagMismatch),
            Some(Outcome::Cancelled) => Err(CirrusError::Cancelled),
        }
    }
}

/// Sleeper that records requested delays instead of waiting.
#[derive(Default)]
pub struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().unwrap().clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration, _cancel: &CancelToken) {
        self.delays.lock().unwrap().push(duration);
    }
}

/// Metrics sink that counts events and keeps failure reasons in order.
#[derive(Default)]
pub struct CountingMetrics {
    queued: AtomicUsize,
    started: AtomicUsize,
    retried: AtomicUsize,
    completed: AtomicUsize,
    failed: Mutex<Vec<String>>,
}

impl CountingMetrics {
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn retried(&self) -> usize {
        self.retried.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn failed_reasons(&self) -> Vec<String> {
        self.failed.lock().unwrap().clone()
    }
}

impl UploaderMetrics for CountingMetrics {
    fn record_queued(&self, _record: &UploadRecord) {
        self.queued.fetch_add(1, Ordering::SeqCst);
    }

    fn record_started(&self, _record: &UploadRecord) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn record_retried(&self, _record: &UploadRecord) {
        self.retried.fetch_add(1, Ordering::SeqCst);
    }

    fn record_completed(&self, _record: &UploadRecord) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    fn record_failed(&self, _record: &UploadRecord, reason: &str) {
        self.failed.lock().unwrap().push(reason.to_string());
    }
}

/// Disk probe reporting fixed totals, for deterministic cleaner tests.
pub struct FixedDiskUsage {
    total: u64,
    free: u64,
}

impl FixedDiskUsage {
    pub fn new(total: u64, free: u64) -> Self {
        Self { total, free }
    }
}

impl DiskUsage for FixedDiskUsage {
    fn stat(&self, _path: &Path) -> Result<(u64, u64)> {
        Ok((self.total, self.free))
    }
}

use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use cirrus_types::{CirrusError, Result};

use crate::cancel::CancelToken;
use crate::cleaner::{Cleaner, Report, Trigger};
use crate::uploader::UploaderController;

/// Eviction surface the monitor drives during recovery.
pub trait EmergencyCleaner: Send + Sync {
    fn run_once(&self, cancel: &CancelToken, trigger: Trigger) -> Result<Report>;
}

impl EmergencyCleaner for Cleaner {
    fn run_once(&self, cancel: &CancelToken, trigger: Trigger) -> Result<Report> {
        Cleaner::run_once(self, cancel, trigger)
    }
}

/// ENOSPC recovery coordinator: pauses the uploader, runs an emergency
/// eviction pass, and resumes (or refuses to, when the cache cannot be
/// brought back to a safe state).
pub struct FailsafeMonitor {
    cleaner: Arc<dyn EmergencyCleaner>,
    uploader: Arc<dyn UploaderController>,
    recovering: Mutex<bool>,
}

impl FailsafeMonitor {
    pub fn new(cleaner: Arc<dyn EmergencyCleaner>, uploader: Arc<dyn UploaderController>) -> Self {
        Self {
            cleaner,
            uploader,
            recovering: Mutex::new(false),
        }
    }

    /// Recover from an out-of-space event.
    ///
    /// Exactly one recovery runs at a time; concurrent callers get
    /// `RecoveryInProgress`. A `FatalCondition` from the cleaner leaves the
    /// uploader paused and surfaces as `RecoveryFailed`: writes must not
    /// resume against a disk that cannot be brought back under the floor.
    pub fn handle_enospc(&self, cancel: &CancelToken) -> Result<()> {
        cancel.check()?;

        if !self.begin_recovery() {
            return Err(CirrusError::RecoveryInProgress);
        }
        let _guard = RecoveryGuard { monitor: self };

        self.uploader.pause(cancel)?;

        let report = match self.cleaner.run_once(cancel, Trigger::enospc()) {
            Ok(report) => report,
            Err(CirrusError::FatalCondition) => {
                return Err(CirrusError::RecoveryFailed(
                    CirrusError::FatalCondition.to_string(),
                ));
            }
            Err(e) => {
                if let Err(resume_err) = self.uploader.resume(cancel) {
                    warn!("resume uploads after cleaner error failed: {resume_err}");
                }
                return Err(e);
            }
        };

        info!(
            bytes_freed = report.bytes_freed,
            evicted = report.evicted.len(),
            "ENOSPC recovery completed"
        );

        self.uploader.resume(cancel)?;
        Ok(())
    }

    fn begin_recovery(&self) -> bool {
        let mut recovering = self.recovering.lock().unwrap();
        if *recovering {
            return false;
        }
        *recovering = true;
        true
    }

    fn end_recovery(&self) {
        *self.recovering.lock().unwrap() = false;
    }
}

struct RecoveryGuard<'a> {
    monitor: &'a FailsafeMonitor,
}

impl Drop for RecoveryGuard<'_> {
    fn drop(&mut self) {
        self.monitor.end_recovery();
    }
}

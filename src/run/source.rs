use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use super::schedule::{DicomNaming, RunSchedule, TrialSchedule};
use crate::error::{Result, RtError};
use crate::watch::{FileWatch, WaitOutcome};
use crate::worker::CancelFlag;

/// What a trial command carries to the model.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrialPayload {
    pub features: Option<Vec<f64>>,
    pub data: Option<Vec<u8>>,
}

/// Produces the payload for each trial as the driver reaches it.
pub trait TrialSource: Send {
    fn load(
        &mut self,
        run: &RunSchedule,
        trial: &TrialSchedule,
    ) -> impl Future<Output = Result<TrialPayload>> + Send;
}

/// Replays feature vectors recorded in the schedule.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplaySource;

impl TrialSource for ReplaySource {
    async fn load(&mut self, run: &RunSchedule, trial: &TrialSchedule) -> Result<TrialPayload> {
        let features = trial.data.clone().ok_or_else(|| {
            RtError::domain(format!(
                "run {} vol {} has no replay data",
                run.run_id, trial.vol
            ))
        })?;
        Ok(TrialPayload {
            features: Some(features),
            data: None,
        })
    }
}

/// Waits for the scanner to write each volume and ships the raw file.
pub struct WatchedFileSource<W> {
    watcher: W,
    naming: DicomNaming,
    timeout: Duration,
    cancel: CancelFlag,
}

impl<W: FileWatch> WatchedFileSource<W> {
    /// `timeout` bounds each individual wait; timed out waits are retried
    /// until the file shows up or the cancel flag is set.
    pub fn new(watcher: W, naming: DicomNaming, timeout: Duration) -> Self {
        Self {
            watcher,
            naming,
            timeout,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn watcher(&self) -> &W {
        &self.watcher
    }
}

impl<W: FileWatch> TrialSource for WatchedFileSource<W> {
    async fn load(&mut self, run: &RunSchedule, trial: &TrialSchedule) -> Result<TrialPayload> {
        let path = self
            .naming
            .file_name(run.scan_num, run.file_num(trial.vol))?;

        loop {
            self.cancel.check()?;
            match self.watcher.wait_for_file(&path, self.timeout).await? {
                WaitOutcome::Found(found) => {
                    let bytes = tokio::fs::read(&found).await.map_err(|e| {
                        RtError::domain(format!("failed to read {}: {}", found.display(), e))
                    })?;
                    debug!(path = %found.display(), size = bytes.len(), "trial file loaded");
                    return Ok(TrialPayload {
                        features: None,
                        data: Some(bytes),
                    });
                }
                WaitOutcome::TimedOut => {
                    warn!(path = %path.display(), "still waiting for scanner file");
                }
            }
        }
    }
}

impl<W> std::fmt::Debug for WatchedFileSource<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchedFileSource")
            .field("naming", &self.naming)
            .field("timeout", &self.timeout)
            .finish()
    }
}

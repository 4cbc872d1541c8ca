use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::{Result, RtError};

/// Cooperative stop request shared between a worker and whoever owns it.
///
/// Workers check the flag between steps; nothing is preempted.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once a stop was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(RtError::Cancelled);
        }
        Ok(())
    }
}

/// Owner of at most one long-running task.
///
/// Starting while a task is still running is rejected, not queued. The join
/// handle is the only place the task's result can be collected from.
pub struct WorkerSlot<T> {
    name: String,
    active: Option<(JoinHandle<T>, CancelFlag)>,
}

impl<T: Send + 'static> WorkerSlot<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            active: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn `task` with a fresh cancel flag, which is also returned.
    pub fn start<F, Fut>(&mut self, task: F) -> Result<CancelFlag>
    where
        F: FnOnce(CancelFlag) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        if self.is_running() {
            return Err(RtError::domain(format!("{} is already running", self.name)));
        }
        if self.active.is_some() {
            debug!(worker = %self.name, "discarding uncollected result");
        }

        let cancel = CancelFlag::new();
        let handle = tokio::spawn(task(cancel.clone()));
        info!(worker = %self.name, "worker started");
        self.active = Some((handle, cancel.clone()));
        Ok(cancel)
    }

    pub fn is_running(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|(handle, _)| !handle.is_finished())
    }

    /// Ask the running task to stop. Returns false when nothing is running.
    pub fn stop(&self) -> bool {
        match &self.active {
            Some((handle, cancel)) if !handle.is_finished() => {
                info!(worker = %self.name, "stop requested");
                cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Wait for the task and take its result, leaving the slot empty.
    pub async fn join(&mut self) -> Result<Option<T>> {
        let Some((handle, _)) = self.active.take() else {
            return Ok(None);
        };
        let output = handle
            .await
            .map_err(|e| RtError::domain(format!("{} worker failed: {}", self.name, e)))?;
        debug!(worker = %self.name, "worker joined");
        Ok(Some(output))
    }
}

impl<T> std::fmt::Debug for WorkerSlot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSlot")
            .field("name", &self.name)
            .field("occupied", &self.active.is_some())
            .finish()
    }
}

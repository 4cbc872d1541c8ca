//! File-arrival watching.
//!
//! A notification backend runs on its own thread and pushes [`WatchEvent`]s
//! into an unbounded queue. [`FileWatch::wait_for_file`] drains that queue with
//! a bounded wait and re-checks the disk on every wake, so a lost or stale
//! notification only costs latency, never correctness.

mod strategy;
mod wait;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::{Result, RtError};

pub use strategy::WatchStrategy;
pub use wait::{POLL_INTERVAL, WRITE_WAIT_CAP, WRITE_WAIT_STEP};

/// A file-change notification as produced by the backend thread.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchEvent {
    pub path: PathBuf,
    pub timestamp: DateTime<Local>,
}

impl WatchEvent {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            timestamp: Local::now(),
        }
    }
}

/// Result of waiting for a file. Timing out is routine, so it is not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    Found(PathBuf),
    TimedOut,
}

impl WaitOutcome {
    pub fn is_found(&self) -> bool {
        matches!(self, Self::Found(_))
    }
}

/// Capability interface over the watcher variants.
pub trait FileWatch: Send {
    /// Begin (or re-point) monitoring of `dir` for files matching `pattern`.
    fn init_watch(&mut self, dir: &Path, pattern: &str, min_file_size: u64) -> Result<()>;

    fn is_initialized(&self) -> bool;

    /// Directory of the current watch, if any.
    fn watch_dir(&self) -> Option<&Path>;

    /// Block until `path` exists and has reached the minimum size, or until
    /// `timeout` elapses. A zero timeout waits forever.
    fn wait_for_file(
        &mut self,
        path: &Path,
        timeout: Duration,
    ) -> impl Future<Output = Result<WaitOutcome>> + Send;
}

/// Single-consumer queue fed by the notification thread.
#[derive(Debug)]
pub struct EventQueue {
    tx: mpsc::UnboundedSender<WatchEvent>,
    rx: mpsc::UnboundedReceiver<WatchEvent>,
}

impl EventQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    /// Producer handle. The queue keeps its own copy so `recv` never sees a
    /// closed channel while the watcher is alive.
    pub fn sender(&self) -> mpsc::UnboundedSender<WatchEvent> {
        self.tx.clone()
    }

    pub(crate) async fn recv(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Directory watcher backed by `notify`, using whichever strategy was detected
/// at startup.
pub struct FileWatcher {
    strategy: WatchStrategy,
    queue: EventQueue,
    backend: Option<Box<dyn notify::Watcher + Send>>,
    watch_dir: Option<PathBuf>,
    pattern: String,
    min_file_size: u64,
}

impl FileWatcher {
    pub fn new(strategy: WatchStrategy) -> Self {
        Self {
            strategy,
            queue: EventQueue::new(),
            backend: None,
            watch_dir: None,
            pattern: "*".to_string(),
            min_file_size: 0,
        }
    }

    /// Construct with the strategy the current platform supports best.
    pub fn detect() -> Self {
        Self::new(WatchStrategy::detect())
    }

    pub fn strategy(&self) -> WatchStrategy {
        self.strategy
    }

    pub fn min_file_size(&self) -> u64 {
        self.min_file_size
    }

    #[cfg(test)]
    pub(crate) fn inject(&self, event: WatchEvent) {
        let _ = self.queue.tx.send(event);
    }
}

impl std::fmt::Debug for FileWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWatcher")
            .field("strategy", &self.strategy)
            .field("watch_dir", &self.watch_dir)
            .field("pattern", &self.pattern)
            .field("min_file_size", &self.min_file_size)
            .finish()
    }
}

impl FileWatch for FileWatcher {
    fn init_watch(&mut self, dir: &Path, pattern: &str, min_file_size: u64) -> Result<()> {
        let pattern = if pattern.is_empty() { "*" } else { pattern };
        let matcher = glob::Pattern::new(pattern)
            .map_err(|e| RtError::domain(format!("invalid file pattern '{}': {}", pattern, e)))?;

        // Drop the old backend first so its thread stops feeding the queue
        self.backend = None;
        let backend = self.strategy.spawn_backend(dir, matcher, self.queue.sender())?;

        info!(
            dir = %dir.display(),
            pattern,
            min_file_size,
            strategy = ?self.strategy,
            "file watch initialized"
        );

        self.backend = Some(backend);
        self.watch_dir = Some(dir.to_path_buf());
        self.pattern = pattern.to_string();
        self.min_file_size = min_file_size;
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.backend.is_some()
    }

    fn watch_dir(&self) -> Option<&Path> {
        self.watch_dir.as_deref()
    }

    async fn wait_for_file(&mut self, path: &Path, timeout: Duration) -> Result<WaitOutcome> {
        if !path.exists() && self.backend.is_none() {
            return Err(RtError::domain(format!(
                "no file watch initialized and file not found: {}",
                path.display()
            )));
        }
        debug!(path = %path.display(), ?timeout, "waiting for file");
        wait::wait_on_queue(&mut self.queue, path, timeout, self.min_file_size).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tempfile::TempDir;

    #[tokio::test]
    async fn existing_file_returns_immediately() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("001_000001_000001.dcm");
        std::fs::write(&path, b"volume").unwrap();

        // No watch initialized: an existing file never needs one
        let mut watcher = FileWatcher::new(WatchStrategy::Poll);
        let started = Instant::now();
        let outcome = watcher
            .wait_for_file(&path, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(outcome, WaitOutcome::Found(path));
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn missing_file_without_watch_is_an_error() {
        let dir = TempDir::new().unwrap();
        let mut watcher = FileWatcher::new(WatchStrategy::Poll);
        let result = watcher
            .wait_for_file(&dir.path().join("missing.dcm"), Duration::from_millis(10))
            .await;
        assert!(matches!(result, Err(RtError::Domain(_))));
    }

    #[tokio::test]
    async fn invalid_pattern_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut watcher = FileWatcher::new(WatchStrategy::Poll);
        let result = watcher.init_watch(dir.path(), "[", 0);
        assert!(result.is_err());
        assert!(!watcher.is_initialized());
    }

    #[tokio::test]
    async fn timeout_is_reported_as_outcome() {
        let dir = TempDir::new().unwrap();
        let mut watcher = FileWatcher::new(WatchStrategy::Poll);
        watcher.init_watch(dir.path(), "*.dcm", 0).unwrap();

        let outcome = watcher
            .wait_for_file(&dir.path().join("never.dcm"), Duration::from_millis(300))
            .await
            .unwrap();
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }

    #[tokio::test]
    async fn injected_event_for_target_ends_wait() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("001_000002_000004.dcm");
        let mut watcher = FileWatcher::new(WatchStrategy::Poll);
        watcher.init_watch(dir.path(), "*", 0).unwrap();

        std::fs::write(&path, b"data").unwrap();
        watcher.inject(WatchEvent::new(&path));

        let outcome = watcher.wait_for_file(&path, Duration::ZERO).await.unwrap();
        assert!(outcome.is_found());
    }

    #[tokio::test]
    async fn reinit_points_watch_at_new_directory() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        let mut watcher = FileWatcher::new(WatchStrategy::Poll);

        watcher.init_watch(first.path(), "", 10).unwrap();
        watcher.init_watch(second.path(), "*.dcm", 20).unwrap();

        assert_eq!(watcher.watch_dir(), Some(second.path()));
        assert_eq!(watcher.min_file_size(), 20);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn notify_wakes_wait_before_next_poll() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("001_000003_000001.dcm");
        let mut watcher = FileWatcher::new(WatchStrategy::Notify);
        watcher.init_watch(dir.path(), "*.dcm", 0).unwrap();

        let (other, target) = (dir.path().join("other.txt"), path.clone());
        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            // Filtered out by the pattern
            std::fs::write(&other, b"skip").unwrap();
            std::fs::write(&target, b"volume").unwrap();
        });

        let started = Instant::now();
        let outcome = watcher
            .wait_for_file(&path, Duration::from_secs(5))
            .await
            .unwrap();
        let elapsed = started.elapsed();
        writer.join().unwrap();

        assert_eq!(outcome, WaitOutcome::Found(path));
        assert!(elapsed < POLL_INTERVAL, "took {:?}", elapsed);
    }
}

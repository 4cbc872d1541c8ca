use std::path::Path;
use std::time::{Duration, Instant};

use tracing::debug;

use super::{EventQueue, WaitOutcome};
use crate::error::Result;

/// Upper bound on a single queue wait before the disk is re-checked.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Size polling step while a file is still being written.
pub const WRITE_WAIT_STEP: Duration = Duration::from_millis(10);

/// Give up waiting for `min_file_size` after this long and use what is there.
pub const WRITE_WAIT_CAP: Duration = Duration::from_millis(300);

/// Wait for `path` using `queue` as a wake-up source and the disk as the
/// source of truth. A zero `timeout` waits forever.
pub(crate) async fn wait_on_queue(
    queue: &mut EventQueue,
    path: &Path,
    timeout: Duration,
    min_file_size: u64,
) -> Result<WaitOutcome> {
    let started = Instant::now();
    let mut exists = path.exists();
    let mut next_disk_check = started + POLL_INTERVAL;
    let mut event_loops = 0u64;
    let mut captured_event = None;

    while !exists {
        let bound = if timeout.is_zero() {
            POLL_INTERVAL
        } else {
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                debug!(path = %path.display(), ?timeout, "file wait timed out");
                return Ok(WaitOutcome::TimedOut);
            }
            POLL_INTERVAL.min(timeout - elapsed)
        };
        event_loops += 1;

        match tokio::time::timeout(bound, queue.recv()).await {
            Err(_) => {
                exists = path.exists();
            }
            Ok(None) => {
                // Backend gone; keep going on disk checks alone
                tokio::time::sleep(bound).await;
                exists = path.exists();
            }
            Ok(Some(event)) => {
                // Stale events from earlier files are expected and skipped
                if event.path == path {
                    exists = true;
                    captured_event = Some(event.timestamp);
                    continue;
                }
                // Swamped with unrelated events: still look at the disk once per interval
                if Instant::now() >= next_disk_check {
                    exists = path.exists();
                    next_disk_check = Instant::now() + POLL_INTERVAL;
                }
            }
        }
    }

    let write_wait = wait_for_size(path, min_file_size).await;
    debug!(
        path = %path.display(),
        event_loops,
        write_wait_ms = write_wait.as_millis() as u64,
        event_captured = captured_event.is_some(),
        event_time = ?captured_event,
        "file available"
    );
    Ok(WaitOutcome::Found(path.to_path_buf()))
}

/// Poll the file size until it reaches `min_file_size` or the cap expires.
/// Cap expiry is not an error. Returns how long was spent waiting.
pub(crate) async fn wait_for_size(path: &Path, min_file_size: u64) -> Duration {
    let mut waited = Duration::ZERO;
    let mut size = file_size(path);
    while size < min_file_size && waited <= WRITE_WAIT_CAP {
        tokio::time::sleep(WRITE_WAIT_STEP).await;
        waited += WRITE_WAIT_STEP;
        size = file_size(path);
    }
    waited
}

fn file_size(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

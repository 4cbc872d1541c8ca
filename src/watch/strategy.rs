use std::path::Path;
use std::time::Duration;

use notify::event::{AccessKind, AccessMode};
use notify::{Config, EventKind, PollWatcher, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use super::WatchEvent;
use crate::error::Result;

/// Scan interval of the polling backend.
const POLL_BACKEND_INTERVAL: Duration = Duration::from_millis(100);

/// How file arrivals are detected. Chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchStrategy {
    /// Push-based OS notifications. On Linux this is inotify close-write,
    /// which only fires once the writer has closed the file.
    Notify,
    /// Directory scanning at a short interval, for platforms where push
    /// notifications are slow or unavailable.
    Poll,
}

impl WatchStrategy {
    /// Capability detection: only Linux exposes close-write notifications.
    pub fn detect() -> Self {
        if cfg!(target_os = "linux") {
            Self::Notify
        } else {
            Self::Poll
        }
    }

    /// Whether an event of this kind means the file may now be read.
    fn is_ready(self, kind: &EventKind) -> bool {
        match self {
            Self::Notify if cfg!(target_os = "linux") => {
                matches!(kind, EventKind::Access(AccessKind::Close(AccessMode::Write)))
            }
            Self::Notify | Self::Poll => {
                matches!(kind, EventKind::Create(_) | EventKind::Modify(_))
            }
        }
    }

    /// Start a backend thread that pushes matching events for `dir` into `tx`.
    pub(super) fn spawn_backend(
        self,
        dir: &Path,
        pattern: glob::Pattern,
        tx: mpsc::UnboundedSender<WatchEvent>,
    ) -> Result<Box<dyn Watcher + Send>> {
        let handler = move |res: notify::Result<notify::Event>| match res {
            Ok(event) => {
                if !self.is_ready(&event.kind) {
                    return;
                }
                for path in event.paths {
                    let matches = path
                        .file_name()
                        .map(|name| pattern.matches(&name.to_string_lossy()))
                        .unwrap_or(false);
                    if matches {
                        let _ = tx.send(WatchEvent::new(path));
                    }
                }
            }
            Err(e) => warn!(error = %e, "file notification error"),
        };

        let mut backend: Box<dyn Watcher + Send> = match self {
            Self::Notify => Box::new(RecommendedWatcher::new(handler, Config::default())?),
            Self::Poll => Box::new(PollWatcher::new(
                handler,
                Config::default().with_poll_interval(POLL_BACKEND_INTERVAL),
            )?),
        };
        backend.watch(dir, RecursiveMode::NonRecursive)?;
        Ok(backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, ModifyKind};

    #[test]
    fn poll_strategy_treats_create_and_modify_as_ready() {
        assert!(WatchStrategy::Poll.is_ready(&EventKind::Create(CreateKind::File)));
        assert!(WatchStrategy::Poll.is_ready(&EventKind::Modify(ModifyKind::Any)));
        assert!(!WatchStrategy::Poll.is_ready(&EventKind::Remove(
            notify::event::RemoveKind::File
        )));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn linux_notify_strategy_waits_for_close_write() {
        let close_write = EventKind::Access(AccessKind::Close(AccessMode::Write));
        assert!(WatchStrategy::Notify.is_ready(&close_write));
        assert!(!WatchStrategy::Notify.is_ready(&EventKind::Create(CreateKind::File)));
        assert_eq!(WatchStrategy::detect(), WatchStrategy::Notify);
    }

    #[test]
    fn strategy_parses_from_config_names() {
        let s: WatchStrategy = serde_json::from_str("\"poll\"").unwrap();
        assert_eq!(s, WatchStrategy::Poll);
    }
}

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::allowlist::AllowList;
use super::protocol::{RelayRecord, RelayRequest, RelayResponse};
use crate::error::{Result, RtError};
use crate::watch::{FileWatch, WaitOutcome};

/// Reads file contents for the relay. Split out so access can be observed.
pub trait FileAccess: Send {
    fn read(&mut self, path: &Path) -> impl Future<Output = io::Result<Vec<u8>>> + Send;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DiskAccess;

impl FileAccess for DiskAccess {
    async fn read(&mut self, path: &Path) -> io::Result<Vec<u8>> {
        tokio::fs::read(path).await
    }
}

/// Serves `init`, `get` and `ping` against a local file watcher.
pub struct RelayHandler<W, F = DiskAccess> {
    watcher: W,
    files: F,
    allow: AllowList,
}

impl<W: FileWatch> RelayHandler<W, DiskAccess> {
    pub fn new(watcher: W, allow: AllowList) -> Self {
        Self::with_access(watcher, DiskAccess, allow)
    }
}

impl<W: FileWatch, F: FileAccess> RelayHandler<W, F> {
    pub fn with_access(watcher: W, files: F, allow: AllowList) -> Self {
        Self {
            watcher,
            files,
            allow,
        }
    }

    pub fn watcher(&self) -> &W {
        &self.watcher
    }

    pub fn files(&self) -> &F {
        &self.files
    }

    /// Answer one request. Every outcome, including failures, becomes a
    /// response that echoes the request fields.
    pub async fn handle(&mut self, request: &RelayRecord) -> RelayRecord {
        let response = match self.dispatch(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, cmd = ?request.get("cmd"), "relay request rejected");
                RelayResponse::from_error(&e)
            }
        };
        response.merge_echo(request)
    }

    async fn dispatch(&mut self, request: &RelayRecord) -> Result<RelayResponse> {
        match RelayRequest::parse(request)? {
            RelayRequest::Init {
                dir,
                pattern,
                min_file_size,
            } => {
                let dir = self.allow.check_dir(Path::new(&dir))?;
                info!(dir = %dir.display(), %pattern, min_file_size, "relay init");
                self.watcher.init_watch(&dir, &pattern, min_file_size)?;
                Ok(RelayResponse::ok())
            }
            RelayRequest::Get { filename } => {
                let path = self.resolve(&filename)?;
                let bytes = self.fetch(&path).await?;
                Ok(RelayResponse::with_file(&bytes))
            }
            RelayRequest::Ping => Ok(RelayResponse::ok()),
        }
    }

    /// Check a requested filename and turn it into the path to read.
    fn resolve(&self, filename: &str) -> Result<PathBuf> {
        let watch_dir = match self.watcher.watch_dir() {
            Some(dir) if self.watcher.is_initialized() => dir,
            _ => return Err(RtError::domain("fileWatcher not initialized")),
        };
        if Path::new(filename).is_absolute() {
            self.allow.validate(None, Some(filename))
        } else {
            self.allow.validate(Some(watch_dir), Some(filename))
        }
    }

    async fn fetch(&mut self, path: &Path) -> Result<Vec<u8>> {
        debug!(path = %path.display(), "relay get");
        match self.watcher.wait_for_file(path, Duration::ZERO).await? {
            WaitOutcome::Found(found) => {
                // The file may have been swapped for a symlink while waiting
                self.allow.check_file(&found)?;
                self.files.read(&found).await.map_err(|e| {
                    RtError::domain(format!("failed to read {}: {}", found.display(), e))
                })
            }
            WaitOutcome::TimedOut => Err(RtError::domain(format!(
                "file never appeared: {}",
                path.display()
            ))),
        }
    }
}

impl<W, F> std::fmt::Debug for RelayHandler<W, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayHandler")
            .field("allow", &self.allow)
            .finish()
    }
}

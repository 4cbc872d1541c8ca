use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{Result, RtError};
use crate::ipc::protocol::Prediction;

const RUN_LINES_FILE: &str = "fileprocessing.txt";
const SESSION_LINES_FILE: &str = "session.txt";

/// Durable sink for what the model reports back during a run.
pub trait OutputWriter: Send {
    fn begin_run(&mut self, run_id: u32) -> Result<()>;

    /// Called once a run is over, whether it finished or aborted.
    fn end_run(&mut self) -> Result<()> {
        Ok(())
    }

    /// Lines arriving outside a run (session start and end) are still kept.
    fn write_lines(&mut self, lines: &[String]) -> Result<()>;

    fn write_prediction(&mut self, prediction: &Prediction) -> Result<()>;
}

/// Writes each run under `<root>/run<N>/`: reply lines go to
/// `fileprocessing.txt`, each prediction to its own `vol_<n>` file. Lines
/// outside any run are appended to `<root>/session.txt`.
#[derive(Debug)]
pub struct RunOutputDir {
    root: PathBuf,
    run_dir: Option<PathBuf>,
    lines: Option<File>,
    session: Option<File>,
}

impl RunOutputDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            run_dir: None,
            lines: None,
            session: None,
        }
    }

    pub fn run_dir(&self) -> Option<&Path> {
        self.run_dir.as_deref()
    }

    fn current_dir(&self) -> Result<&Path> {
        self.run_dir
            .as_deref()
            .ok_or_else(|| RtError::domain("prediction written outside a run"))
    }

    fn open_session_log(&self) -> Result<File> {
        std::fs::create_dir_all(&self.root).map_err(|e| output_error(&self.root, e))?;
        let path = self.root.join(SESSION_LINES_FILE);
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| output_error(&path, e))
    }
}

fn output_error(path: &Path, e: std::io::Error) -> RtError {
    RtError::domain(format!("failed to write {}: {}", path.display(), e))
}

impl OutputWriter for RunOutputDir {
    fn begin_run(&mut self, run_id: u32) -> Result<()> {
        let dir = self.root.join(format!("run{}", run_id));
        std::fs::create_dir_all(&dir).map_err(|e| output_error(&dir, e))?;

        let path = dir.join(RUN_LINES_FILE);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| output_error(&path, e))?;

        self.lines = Some(file);
        self.run_dir = Some(dir);
        Ok(())
    }

    fn end_run(&mut self) -> Result<()> {
        self.lines = None;
        self.run_dir = None;
        Ok(())
    }

    fn write_lines(&mut self, lines: &[String]) -> Result<()> {
        if lines.is_empty() {
            return Ok(());
        }
        if self.lines.is_none() && self.session.is_none() {
            self.session = Some(self.open_session_log()?);
        }
        let (file, path) = match (self.lines.as_mut(), self.run_dir.as_deref()) {
            (Some(file), Some(dir)) => (file, dir.join(RUN_LINES_FILE)),
            _ => (
                self.session
                    .as_mut()
                    .ok_or_else(|| RtError::domain("session log is not open"))?,
                self.root.join(SESSION_LINES_FILE),
            ),
        };
        for line in lines {
            info!(target: "rtfmri::output", "{}", line);
            writeln!(file, "{}", line).map_err(|e| output_error(&path, e))?;
        }
        file.flush().map_err(|e| output_error(&path, e))
    }

    fn write_prediction(&mut self, prediction: &Prediction) -> Result<()> {
        let path = self.current_dir()?.join(format!("vol_{}", prediction.vol));
        std::fs::write(&path, prediction.catsep.to_string()).map_err(|e| output_error(&path, e))
    }
}

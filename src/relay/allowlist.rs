use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

use crate::error::{Result, RtError};

/// Directories and file extensions the relay may serve from.
///
/// A path is first checked lexically, with `.` and `..` folded away. The
/// part of it that already exists is then resolved through symlinks and must
/// still land under a resolved root. Resolving reads metadata only, never
/// file contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowList {
    roots: Vec<PathBuf>,
    extensions: Vec<String>,
}

impl AllowList {
    pub fn new<R, E>(roots: R, extensions: E) -> Self
    where
        R: IntoIterator,
        R::Item: AsRef<Path>,
        E: IntoIterator,
        E::Item: AsRef<str>,
    {
        Self {
            roots: roots
                .into_iter()
                .filter_map(|r| normalize(r.as_ref()))
                .collect(),
            extensions: extensions
                .into_iter()
                .map(|e| normalize_extension(e.as_ref()))
                .collect(),
        }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    /// Accept `dir` if it lies under one of the allowed roots.
    pub fn check_dir(&self, dir: &Path) -> Result<PathBuf> {
        let dir = normalize(dir)
            .ok_or_else(|| RtError::access_denied(format!("invalid path {}", dir.display())))?;
        if !dir.is_absolute() {
            return Err(RtError::access_denied(format!(
                "{} is not an absolute path",
                dir.display()
            )));
        }
        if !self.roots.iter().any(|root| dir.starts_with(root)) {
            return Err(RtError::access_denied(format!(
                "{} is not under an allowed directory",
                dir.display()
            )));
        }
        self.check_resolved(&dir)?;
        Ok(dir)
    }

    /// Follow symlinks in the existing part of `path` and require the real
    /// location to be under a real root.
    fn check_resolved(&self, path: &Path) -> Result<PathBuf> {
        let real = resolve_existing(path);
        if self
            .roots
            .iter()
            .any(|root| real.starts_with(resolve_existing(root)))
        {
            return Ok(real);
        }
        Err(RtError::access_denied(format!(
            "{} resolves to {}, outside the allowed directories",
            path.display(),
            real.display()
        )))
    }

    /// Accept `file` if its directory is allowed and its extension is listed.
    pub fn check_file(&self, file: &Path) -> Result<PathBuf> {
        let file = normalize(file)
            .ok_or_else(|| RtError::access_denied(format!("invalid path {}", file.display())))?;
        let parent = file.parent().ok_or_else(|| {
            RtError::access_denied(format!("{} has no parent directory", file.display()))
        })?;
        self.check_dir(parent)?;
        self.check_extension(&file)?;
        // A symlinked file is judged by its target
        let real = self.check_resolved(&file)?;
        self.check_extension(&real)?;
        Ok(file)
    }

    fn check_extension(&self, file: &Path) -> Result<()> {
        let ext = file
            .extension()
            .and_then(|e| e.to_str())
            .map(normalize_extension)
            .unwrap_or_default();
        if self.extensions.iter().any(|allowed| *allowed == ext) {
            return Ok(());
        }
        Err(RtError::access_denied(format!(
            "file type of {} is not allowed",
            file.display()
        )))
    }

    /// Combined check used for relay requests. With a directory, a filename
    /// is taken relative to it; without one, the filename must be absolute.
    /// Returns the normalized path that may be accessed.
    pub fn validate(&self, dir: Option<&Path>, file: Option<&str>) -> Result<PathBuf> {
        match (dir, file) {
            (Some(dir), None) => self.check_dir(dir),
            (Some(dir), Some(file)) => {
                let dir = self.check_dir(dir)?;
                self.check_file(&dir.join(file))
            }
            (None, Some(file)) => self.check_file(Path::new(file)),
            (None, None) => Err(RtError::access_denied("no path given")),
        }
    }
}

fn normalize(path: &Path) -> Option<PathBuf> {
    let text = path.to_str()?;
    let cleaned = PathBuf::from(path_clean::clean(text));
    // `..` above the root survives cleaning on relative paths; never accept it
    if cleaned.components().any(|c| c == Component::ParentDir) {
        return None;
    }
    Some(cleaned)
}

/// Canonicalize the deepest existing ancestor of `path` and re-attach the
/// components that do not exist yet.
fn resolve_existing(path: &Path) -> PathBuf {
    let mut existing = path;
    let mut missing: Vec<&OsStr> = Vec::new();
    loop {
        if let Ok(real) = std::fs::canonicalize(existing) {
            return missing
                .iter()
                .rev()
                .fold(real, |acc, part| acc.join(part));
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name);
                existing = parent;
            }
            _ => return path.to_path_buf(),
        }
    }
}

fn normalize_extension(ext: &str) -> String {
    ext.trim_start_matches('.').to_ascii_lowercase()
}

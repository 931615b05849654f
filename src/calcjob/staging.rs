//! Local staging area: a private temporary directory per job

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use tempfile::TempDir;
use walkdir::WalkDir;

/// Temporary directory the plugin writes a job's input files into.
///
/// Removed from disk when dropped.
#[derive(Debug)]
pub struct StagingArea {
    job_id: String,
    dir: TempDir,
}

impl StagingArea {
    pub fn create(job_id: &str) -> io::Result<Self> {
        Self::create_in(&std::env::temp_dir(), job_id)
    }

    pub fn create_in(parent: &Path, job_id: &str) -> io::Result<Self> {
        fs::create_dir_all(parent)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("jobstage-{}-", job_id))
            .tempdir_in(parent)?;
        Ok(Self {
            job_id: job_id.to_string(),
            dir,
        })
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Absolute path for a relative name inside the area.
    ///
    /// Absolute names and `..` components are rejected.
    pub fn abs_path(&self, relative: &str) -> io::Result<PathBuf> {
        let candidate = Path::new(relative);
        let escapes = candidate
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if relative.is_empty() || escapes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("'{}' is not a relative path inside the staging area", relative),
            ));
        }
        Ok(self.dir.path().join(candidate))
    }

    /// Write a file, creating parent directories
    pub fn write(&self, relative: &str, contents: impl AsRef<[u8]>) -> io::Result<PathBuf> {
        let path = self.abs_path(relative)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, contents)?;
        Ok(path)
    }

    /// Copy an existing local file into the area
    pub fn copy_in(&self, source: &Path, relative: &str) -> io::Result<PathBuf> {
        let path = self.abs_path(relative)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(source, &path)?;
        Ok(path)
    }

    /// Fail early when the directory cannot be written
    pub fn ensure_writable(&self) -> io::Result<()> {
        let probe = self.dir.path().join(".jobstage-probe");
        fs::write(&probe, b"")?;
        fs::remove_file(&probe)
    }

    /// Relative paths of every staged file, sorted
    pub fn files(&self) -> io::Result<Vec<String>> {
        let mut files = Vec::new();
        for entry in WalkDir::new(self.dir.path()).min_depth(1) {
            let entry = entry?;
            if entry.file_type().is_file() {
                if let Ok(relative) = entry.path().strip_prefix(self.dir.path()) {
                    files.push(relative.to_string_lossy().into_owned());
                }
            }
        }
        files.sort();
        Ok(files)
    }

    /// Remove the directory now, reporting errors
    pub fn close(self) -> io::Result<()> {
        self.dir.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_list() {
        let area = StagingArea::create("job-1").unwrap();
        area.write("b.txt", "b").unwrap();
        area.write("sub/a.txt", "a").unwrap();
        assert_eq!(area.files().unwrap(), vec!["b.txt", "sub/a.txt"]);
    }

    #[test]
    fn test_traversal_rejected() {
        let area = StagingArea::create("job-2").unwrap();
        assert!(area.abs_path("../escape").is_err());
        assert!(area.abs_path("/etc/passwd").is_err());
        assert!(area.abs_path("").is_err());
        assert!(area.abs_path("./ok").is_ok());
    }

    #[test]
    fn test_removed_on_drop() {
        let area = StagingArea::create("job-3").unwrap();
        let path = area.path().to_path_buf();
        assert!(path.is_dir());
        drop(area);
        assert!(!path.exists());
    }
}

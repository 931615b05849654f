//! Local transport: the "computer" is this machine

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use walkdir::WalkDir;

use super::{CommandOutput, Transport, TransportError, TransportSession};
use crate::authinfo::{AuthInfo, CredentialSchema};
use crate::computer::Computer;

/// Transport that acts directly on the local filesystem
#[derive(Debug)]
pub struct LocalTransport {
    schema: CredentialSchema,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self {
            schema: CredentialSchema::new("local", &[]),
        }
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for LocalTransport {
    fn name(&self) -> &'static str {
        "local"
    }

    fn auth_schema(&self) -> &CredentialSchema {
        &self.schema
    }

    fn open(
        &self,
        computer: &Computer,
        auth: &AuthInfo,
    ) -> Result<Box<dyn TransportSession>, TransportError> {
        Ok(Box::new(LocalSession {
            root: computer.resolved_workdir(auth.username()),
            open: true,
        }))
    }
}

struct LocalSession {
    root: PathBuf,
    open: bool,
}

impl LocalSession {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.open {
            Ok(())
        } else {
            Err(TransportError::Closed("localhost".to_string()))
        }
    }
}

fn create_parent(path: &Path) -> Result<(), TransportError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| TransportError::io(parent, e))?;
    }
    Ok(())
}

/// Copy a file, or a directory tree entry by entry
fn copy_any(source: &Path, destination: &Path) -> Result<(), TransportError> {
    let meta = fs::metadata(source).map_err(|e| TransportError::io(source, e))?;
    if !meta.is_dir() {
        create_parent(destination)?;
        fs::copy(source, destination).map_err(|e| TransportError::io(source, e))?;
        return Ok(());
    }

    for entry in WalkDir::new(source) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(source).to_path_buf();
            TransportError::io(path, e.into())
        })?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .unwrap_or_else(|_| entry.path());
        let target = destination.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(|e| TransportError::io(&target, e))?;
        } else {
            create_parent(&target)?;
            fs::copy(entry.path(), &target).map_err(|e| TransportError::io(entry.path(), e))?;
        }
    }
    Ok(())
}

impl TransportSession for LocalSession {
    fn root(&self) -> &Path {
        &self.root
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.open = false;
        Ok(())
    }

    fn exists(&self, path: &Path) -> Result<bool, TransportError> {
        self.ensure_open()?;
        let path = self.resolve(path);
        path.try_exists().map_err(|e| TransportError::io(path, e))
    }

    fn is_file(&self, path: &Path) -> Result<bool, TransportError> {
        self.ensure_open()?;
        Ok(self.resolve(path).is_file())
    }

    fn put(&self, local: &Path, remote: &Path) -> Result<(), TransportError> {
        self.ensure_open()?;
        copy_any(local, &self.resolve(remote))
    }

    fn get(&self, remote: &Path, local: &Path) -> Result<(), TransportError> {
        self.ensure_open()?;
        copy_any(&self.resolve(remote), local)
    }

    fn mkdir(&self, path: &Path) -> Result<(), TransportError> {
        self.ensure_open()?;
        let path = self.resolve(path);
        fs::create_dir_all(&path).map_err(|e| TransportError::io(path, e))
    }

    fn remove(&self, path: &Path) -> Result<(), TransportError> {
        self.ensure_open()?;
        let path = self.resolve(path);
        let result = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        result.map_err(|e| TransportError::io(path, e))
    }

    fn copy(&self, source: &Path, destination: &Path) -> Result<(), TransportError> {
        self.ensure_open()?;
        copy_any(&self.resolve(source), &self.resolve(destination))
    }

    fn write_file(&self, path: &Path, contents: &[u8]) -> Result<(), TransportError> {
        self.ensure_open()?;
        let path = self.resolve(path);
        create_parent(&path)?;
        fs::write(&path, contents).map_err(|e| TransportError::io(path, e))
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>, TransportError> {
        self.ensure_open()?;
        let path = self.resolve(path);
        fs::read(&path).map_err(|e| TransportError::io(path, e))
    }

    fn exec(&self, command: &str, cwd: &Path) -> Result<CommandOutput, TransportError> {
        self.ensure_open()?;
        let cwd = self.resolve(cwd);
        tracing::trace!(command, cwd = %cwd.display(), "local exec");
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&cwd)
            .output()
            .map_err(|e| TransportError::io(cwd, e))?;
        Ok(CommandOutput::from_output(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn session(root: &Path) -> LocalSession {
        LocalSession {
            root: root.to_path_buf(),
            open: true,
        }
    }

    #[test]
    fn test_relative_paths_resolve_against_root() {
        let tmp = TempDir::new().unwrap();
        let s = session(tmp.path());
        s.write_file(Path::new("sub/a.txt"), b"hello").unwrap();
        assert!(tmp.path().join("sub/a.txt").is_file());
        assert!(s.is_file(Path::new("sub/a.txt")).unwrap());
        assert!(!s.is_file(Path::new("sub")).unwrap());
    }

    #[test]
    fn test_copy_directory_tree() {
        let tmp = TempDir::new().unwrap();
        let s = session(tmp.path());
        s.write_file(Path::new("src/one"), b"1").unwrap();
        s.write_file(Path::new("src/nested/two"), b"2").unwrap();

        s.copy(Path::new("src"), Path::new("dst")).unwrap();

        assert_eq!(s.read_file(Path::new("dst/one")).unwrap(), b"1");
        assert_eq!(s.read_file(Path::new("dst/nested/two")).unwrap(), b"2");
    }

    #[test]
    fn test_exec_runs_in_cwd() {
        let tmp = TempDir::new().unwrap();
        let s = session(tmp.path());
        s.mkdir(Path::new("work")).unwrap();
        let out = s.exec("pwd", Path::new("work")).unwrap();
        assert!(out.success());
        assert!(out.stdout.trim().ends_with("work"));
    }

    #[test]
    fn test_exec_reports_nonzero_status() {
        let tmp = TempDir::new().unwrap();
        let s = session(tmp.path());
        let out = s.exec("echo oops >&2; exit 3", Path::new(".")).unwrap();
        assert_eq!(out.status, 3);
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[test]
    fn test_operations_fail_after_close() {
        let tmp = TempDir::new().unwrap();
        let mut s = session(tmp.path());
        s.close().unwrap();
        assert!(matches!(
            s.exists(Path::new("x")),
            Err(TransportError::Closed(_))
        ));
    }
}

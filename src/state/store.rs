//! Job record persistence
//!
//! Layout under the state directory:
//! `jobs/<job_id>/job_state.json` and `jobs/<job_id>/retrieved/`

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::{JobRunState, JobStateError};

const JOBS_DIR: &str = "jobs";
const STATE_FILE: &str = "job_state.json";
const RETRIEVED_DIR: &str = "retrieved";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Corrupt job record {}: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    fn from_state(path: &Path, err: JobStateError) -> Self {
        match err {
            JobStateError::JsonError(source) => StoreError::Corrupt {
                path: path.to_path_buf(),
                source,
            },
            JobStateError::IoError(source) => StoreError::Io {
                path: path.to_path_buf(),
                source,
            },
            other => StoreError::Io {
                path: path.to_path_buf(),
                source: io::Error::new(io::ErrorKind::Other, other.to_string()),
            },
        }
    }
}

/// Where job records and retrieved files live
pub trait JobStore: Send + Sync {
    /// Persist atomically; a crash leaves either the old or the new record
    fn save(&self, state: &JobRunState) -> Result<(), StoreError>;

    fn load(&self, job_id: &str) -> Result<Option<JobRunState>, StoreError>;

    /// Every stored record, oldest first
    fn list(&self) -> Result<Vec<JobRunState>, StoreError>;

    /// Local directory retrieved files are written to
    fn retrieved_dir(&self, job_id: &str) -> PathBuf;
}

/// JSON files under a state directory
#[derive(Debug, Clone)]
pub struct FileJobStore {
    root: PathBuf,
}

impl FileJobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn job_dir(&self, job_id: &str) -> PathBuf {
        self.root.join(JOBS_DIR).join(job_id)
    }
}

impl JobStore for FileJobStore {
    fn save(&self, state: &JobRunState) -> Result<(), StoreError> {
        let dir = self.job_dir(&state.job_id);
        fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;
        let path = dir.join(STATE_FILE);
        state
            .write_to_file(&path)
            .map_err(|e| StoreError::from_state(&path, e))
    }

    fn load(&self, job_id: &str) -> Result<Option<JobRunState>, StoreError> {
        let path = self.job_dir(job_id).join(STATE_FILE);
        if !path.exists() {
            return Ok(None);
        }
        JobRunState::from_file(&path)
            .map(Some)
            .map_err(|e| StoreError::from_state(&path, e))
    }

    fn list(&self) -> Result<Vec<JobRunState>, StoreError> {
        let jobs = self.root.join(JOBS_DIR);
        if !jobs.is_dir() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&jobs).map_err(|source| StoreError::Io {
            path: jobs.clone(),
            source,
        })?;

        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StoreError::Io {
                path: jobs.clone(),
                source,
            })?;
            let path = entry.path().join(STATE_FILE);
            if !path.is_file() {
                continue;
            }
            match JobRunState::from_file(&path) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable job record"),
            }
        }
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    fn retrieved_dir(&self, job_id: &str) -> PathBuf {
        self.job_dir(job_id).join(RETRIEVED_DIR)
    }
}

//! Job run state machine
//!
//! Job states: BUILT → STAGED → SUBMITTED → POLLING → RETRIEVED → COMPLETED
//! with FAILED reachable from every non-terminal state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::{next_seq, now_utc};
use crate::calcjob::RetrieveEntry;
use crate::orchestrator::FailureKind;
use crate::scheduler::{JobStatus, RemoteJob};

/// Schema version for job_state.json
pub const SCHEMA_VERSION: u32 = 1;

/// Schema identifier
pub const SCHEMA_ID: &str = "jobstage/job_state@1";

/// Job state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Inputs validated and written locally
    Built,
    /// Job directory populated on the computer
    Staged,
    /// Accepted by the scheduler
    Submitted,
    /// Waiting for a terminal scheduler status
    Polling,
    /// Outputs fetched
    Retrieved,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Check if transition from this state to target is valid
    pub fn can_transition_to(&self, target: JobState) -> bool {
        match (self, target) {
            (JobState::Built, JobState::Staged) => true,
            (JobState::Staged, JobState::Submitted) => true,
            (JobState::Submitted, JobState::Polling) => true,
            (JobState::Polling, JobState::Retrieved) => true,
            (JobState::Retrieved, JobState::Completed) => true,

            (from, JobState::Failed) => !from.is_terminal(),

            _ => false,
        }
    }

    /// A remote job may exist that the scheduler still runs
    pub fn has_remote_job(&self) -> bool {
        matches!(self, JobState::Submitted | JobState::Polling)
    }
}

/// One entry of the transition history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub state: JobState,
    pub at: DateTime<Utc>,
    pub seq: u64,
}

/// A file fetched into the local retrieved directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievedFile {
    pub name: String,
    pub path: PathBuf,
    /// Hex SHA-256 of the contents; None for directories
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// Why a job ended in FAILED
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub kind: FailureKind,
    pub message: String,
    /// The state the job was in when it failed
    pub state: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
}

/// Errors for job state operations
#[derive(Debug, thiserror::Error)]
pub enum JobStateError {
    #[error("Invalid state transition from {from:?} to {to:?}")]
    InvalidTransition { from: JobState, to: JobState },

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Persisted record of one job (job_state.json)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRunState {
    pub schema_version: u32,
    pub schema_id: String,

    pub job_id: String,
    pub plugin: String,
    pub computer: String,
    pub user: String,

    pub state: JobState,

    /// Scheduler id, set once submission succeeded
    #[serde(default)]
    pub remote_id: Option<String>,

    /// Absolute job directory on the computer
    #[serde(default)]
    pub remote_workdir: Option<PathBuf>,

    #[serde(default)]
    pub last_status: Option<JobStatus>,

    #[serde(default)]
    pub exit_code: Option<i32>,

    pub retrieve: Vec<RetrieveEntry>,

    #[serde(default)]
    pub retrieved: Vec<RetrievedFile>,

    /// Set right before the scheduler is asked to submit
    #[serde(default)]
    pub submission_started_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub failure: Option<FailureRecord>,

    pub history: Vec<Transition>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Monotonic sequence counter for ordering
    pub seq: u64,
}

impl JobRunState {
    /// Create a new job in BUILT state
    pub fn new(
        job_id: impl Into<String>,
        plugin: impl Into<String>,
        computer: impl Into<String>,
        user: impl Into<String>,
        retrieve: Vec<RetrieveEntry>,
    ) -> Self {
        let now = now_utc();
        let seq = next_seq();
        Self {
            schema_version: SCHEMA_VERSION,
            schema_id: SCHEMA_ID.to_string(),
            job_id: job_id.into(),
            plugin: plugin.into(),
            computer: computer.into(),
            user: user.into(),
            state: JobState::Built,
            remote_id: None,
            remote_workdir: None,
            last_status: None,
            exit_code: None,
            retrieve,
            retrieved: Vec::new(),
            submission_started_at: None,
            failure: None,
            history: vec![Transition {
                state: JobState::Built,
                at: now,
                seq,
            }],
            created_at: now,
            updated_at: now,
            seq,
        }
    }

    // Records reloaded in a new process keep counting upward
    fn touch(&mut self) {
        self.updated_at = now_utc();
        self.seq = next_seq().max(self.seq + 1);
    }

    /// Transition to a new state
    pub fn transition(&mut self, new_state: JobState) -> Result<(), JobStateError> {
        if !self.state.can_transition_to(new_state) {
            return Err(JobStateError::InvalidTransition {
                from: self.state,
                to: new_state,
            });
        }

        self.state = new_state;
        self.touch();
        self.history.push(Transition {
            state: new_state,
            at: self.updated_at,
            seq: self.seq,
        });

        Ok(())
    }

    /// Mark job as failed, recording the cause
    pub fn fail(&mut self, kind: FailureKind, message: impl Into<String>) -> Result<(), JobStateError> {
        let record = FailureRecord {
            kind,
            message: message.into(),
            state: self.state,
            remote_id: self.remote_id.clone(),
        };
        self.transition(JobState::Failed)?;
        self.failure = Some(record);
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn mark_submission_started(&mut self) {
        self.submission_started_at = Some(now_utc());
        self.touch();
    }

    pub fn set_remote_job(&mut self, job: &RemoteJob) {
        self.remote_id = Some(job.id.clone());
        self.remote_workdir = Some(job.working_directory.clone());
        self.touch();
    }

    /// The submitted job, once both id and directory are known
    pub fn remote_job(&self) -> Option<RemoteJob> {
        match (&self.remote_id, &self.remote_workdir) {
            (Some(id), Some(dir)) => Some(RemoteJob {
                id: id.clone(),
                working_directory: dir.clone(),
            }),
            _ => None,
        }
    }

    /// Record a poll result; returns whether it differs from the last one
    pub fn observe(&mut self, status: &JobStatus) -> bool {
        if self.last_status.as_ref() == Some(status) {
            return false;
        }
        self.last_status = Some(status.clone());
        if let JobStatus::Done { exit_code } = status {
            self.exit_code = Some(*exit_code);
        }
        self.touch();
        true
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Load from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Write atomically to file (write-then-rename)
    pub fn write_to_file(&self, path: &Path) -> Result<(), JobStateError> {
        let json = self.to_json()?;

        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, &json)?;
        fs::rename(&temp_path, path)?;

        Ok(())
    }

    /// Load from file
    pub fn from_file(path: &Path) -> Result<Self, JobStateError> {
        let json = fs::read_to_string(path)?;
        Ok(Self::from_json(&json)?)
    }
}

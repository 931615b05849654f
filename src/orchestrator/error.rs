//! Job failure taxonomy and exit codes

use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;

use crate::authinfo::InvalidParameterError;
use crate::calcjob::{BuildError, InputValidationError, PlanConflictError};
use crate::computer::ValidationError;
use crate::config::ConfigError;
use crate::inventory::InventoryError;
use crate::scheduler::SchedulerError;
use crate::state::{FailureRecord, JobState, JobStateError, RetrievedFile, StoreError};
use crate::transport::TransportError;

/// Failure category; the discriminant is the CLI exit code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// Computer, AuthInfo, code or engine configuration (exit code 10)
    Configuration = 10,
    /// Inputs rejected by the plugin's declaration (exit code 11)
    InputValidation = 11,
    /// Input writing or transfer planning (exit code 12)
    Preparation = 12,
    /// Could not open a session (exit code 20)
    Connection = 20,
    /// Uploading into the job directory (exit code 21)
    Staging = 21,
    /// Scheduler refused the job (exit code 30)
    Submission = 30,
    /// Repeated poll failures (exit code 31)
    Poll = 31,
    /// Scheduler lost track of the job (exit code 32)
    JobLost = 32,
    /// Scheduler ended the job abnormally (exit code 40)
    SchedulerFailed = 40,
    /// Command exited nonzero (exit code 41)
    NonZeroExit = 41,
    /// Fetching outputs (exit code 70)
    Retrieval = 70,
    /// Cancelled by the user (exit code 80)
    Cancelled = 80,
    /// Job record could not be read or written (exit code 90)
    Persistence = 90,
    /// Job thread panicked or could not start (exit code 99)
    Internal = 99,
}

impl FailureKind {
    pub fn exit_code(self) -> i32 {
        self as i32
    }
}

/// Staging failures: the first transport error while populating the job directory
#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    #[error("Failed to stage {}: {source}", path.display())]
    Transfer {
        path: PathBuf,
        #[source]
        source: TransportError,
    },

    #[error("Remote copy from computer '{source_computer}' into a job on '{computer}'")]
    CrossComputer {
        source_computer: String,
        computer: String,
    },
}

/// Retrieval failures
#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("Required output '{path}' is missing")]
    Missing { path: String },

    #[error("Failed to fetch '{path}': {source}")]
    Transfer {
        path: String,
        #[source]
        source: TransportError,
    },

    #[error("Failed to store {} locally: {source}", path.display())]
    Local {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Everything that can end a job
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Credentials(#[from] InvalidParameterError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Inventory(#[from] InventoryError),

    #[error("No AuthInfo configured for user '{user}' on computer '{computer}'")]
    NotConfigured { computer: String, user: String },

    #[error("Unknown code: {0}")]
    UnknownCode(String),

    #[error(transparent)]
    InputValidation(InputValidationError),

    #[error(transparent)]
    PlanConflict(PlanConflictError),

    #[error(transparent)]
    Build(BuildError),

    #[error("Invalid resources: {0}")]
    Resources(String),

    #[error("Cannot open a session to '{computer}': {source}")]
    Connection {
        computer: String,
        #[source]
        source: TransportError,
    },

    #[error(transparent)]
    Staging(#[from] StagingError),

    #[error("Submission failed: {0}")]
    Submission(#[source] SchedulerError),

    #[error("Polling job {remote_id} failed: {source}")]
    Poll {
        remote_id: String,
        #[source]
        source: SchedulerError,
    },

    #[error("Job {} lost: {reason}", remote_id.as_deref().unwrap_or("<unsubmitted>"))]
    JobLost {
        remote_id: Option<String>,
        reason: String,
    },

    #[error("Cancelled while {state:?}")]
    Cancelled { state: JobState },

    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    #[error("Job {remote_id} exited with status {exit_code}")]
    NonZeroExit { remote_id: String, exit_code: i32 },

    #[error("Scheduler reported job {remote_id} failed: {reason}")]
    SchedulerFailed { remote_id: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    State(#[from] JobStateError),

    #[error("Job {job_id} cannot be resumed: {reason}")]
    NotResumable { job_id: String, reason: String },

    #[error("No job record for '{0}'")]
    NotFound(String),

    #[error("A job with id '{0}' already exists")]
    AlreadyExists(String),

    #[error("Invalid job id {job_id:?}: {reason}")]
    InvalidJobId { job_id: String, reason: &'static str },

    /// Failure read back from a stored record
    #[error("{}", .0.message)]
    Recorded(FailureRecord),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<BuildError> for JobError {
    fn from(err: BuildError) -> Self {
        match err {
            BuildError::InputValidation(e) => JobError::InputValidation(e),
            BuildError::PlanConflict(e) => JobError::PlanConflict(e),
            other => JobError::Build(other),
        }
    }
}

impl From<InputValidationError> for JobError {
    fn from(err: InputValidationError) -> Self {
        JobError::InputValidation(err)
    }
}

impl JobError {
    /// Map error to failure kind for exit code
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            JobError::Validation(_)
            | JobError::Credentials(_)
            | JobError::Config(_)
            | JobError::Inventory(_)
            | JobError::NotConfigured { .. }
            | JobError::UnknownCode(_)
            | JobError::Resources(_)
            | JobError::NotResumable { .. }
            | JobError::NotFound(_)
            | JobError::AlreadyExists(_)
            | JobError::InvalidJobId { .. } => FailureKind::Configuration,
            JobError::InputValidation(_) => FailureKind::InputValidation,
            JobError::PlanConflict(_) | JobError::Build(_) => FailureKind::Preparation,
            JobError::Connection { .. } => FailureKind::Connection,
            JobError::Staging(_) => FailureKind::Staging,
            JobError::Submission(_) => FailureKind::Submission,
            JobError::Poll { .. } => FailureKind::Poll,
            JobError::JobLost { .. } => FailureKind::JobLost,
            JobError::Cancelled { .. } => FailureKind::Cancelled,
            JobError::Retrieval(_) => FailureKind::Retrieval,
            JobError::NonZeroExit { .. } => FailureKind::NonZeroExit,
            JobError::SchedulerFailed { .. } => FailureKind::SchedulerFailed,
            JobError::Store(_) | JobError::State(_) => FailureKind::Persistence,
            JobError::Recorded(record) => record.kind,
            JobError::Internal(_) => FailureKind::Internal,
        }
    }

    /// Get exit code for this error
    pub fn exit_code(&self) -> i32 {
        self.failure_kind().exit_code()
    }
}

/// A job that reached COMPLETED
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub job_id: String,
    pub remote_id: Option<String>,
    pub exit_code: i32,
    pub retrieved: Vec<RetrievedFile>,
}

/// A job that reached FAILED, with the cause and whatever was known remotely
#[derive(Debug, thiserror::Error)]
#[error("Job {job_id} failed: {error}")]
pub struct JobFailure {
    pub job_id: String,
    pub remote_id: Option<String>,
    pub exit_code: Option<i32>,
    pub retrieved: Vec<RetrievedFile>,
    #[source]
    pub error: JobError,
}

impl JobFailure {
    pub fn failure_kind(&self) -> FailureKind {
        self.error.failure_kind()
    }

    /// Failure of a job that never got a record
    pub fn early(job_id: impl Into<String>, error: JobError) -> Self {
        Self {
            job_id: job_id.into(),
            remote_id: None,
            exit_code: None,
            retrieved: Vec::new(),
            error,
        }
    }
}

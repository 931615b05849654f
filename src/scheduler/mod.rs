//! Scheduler Layer
//!
//! Submits job scripts, polls their status and cancels them. Schedulers are
//! stateless: every call receives the open transport session to act through,
//! and the remote identifier they returned from `submit` is opaque to callers.

mod direct;
mod pbs;
mod script;
mod slurm;

pub use direct::DirectScheduler;
pub use pbs::PbsProScheduler;
pub use script::{format_walltime, JobResources, JobScript};
pub use slurm::SlurmScheduler;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::transport::{TransportError, TransportSession};

/// Script file written into the job directory
pub const SUBMIT_SCRIPT_NAME: &str = "_jobstage_submit.sh";

/// File the script writes its command's exit status to
pub const EXIT_STATUS_FILE: &str = "_jobstage_exit_status";

/// Scheduler-captured stdout/stderr of the script itself
pub const SCHEDULER_STDOUT: &str = "_scheduler-stdout.txt";
pub const SCHEDULER_STDERR: &str = "_scheduler-stderr.txt";

/// Status of a submitted job as reported by its scheduler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    /// Finished; carries the command's exit code
    Done { exit_code: i32 },
    /// The scheduler ended the job abnormally
    Failed { reason: String },
    /// The scheduler cannot currently locate the job
    Unknown,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done { .. } | JobStatus::Failed { .. })
    }
}

/// Handle to a submitted job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteJob {
    /// Scheduler-assigned identifier
    pub id: String,
    /// Absolute job directory on the computer
    pub working_directory: PathBuf,
}

/// Scheduler errors
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Submission rejected: {0}")]
    Submission(String),

    #[error("`{command}` failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("Unexpected output from `{command}`: {output:?}")]
    Parse { command: String, output: String },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// A batch system (or the lack of one)
pub trait Scheduler: Send + Sync {
    /// Scheduler type tag referenced by computers
    fn name(&self) -> &'static str;

    /// Header lines placed right after the shebang
    fn directives(&self, script: &JobScript) -> Vec<String>;

    /// Write the script into `working_directory` and hand it to the scheduler.
    ///
    /// Returns the scheduler's identifier for the job.
    fn submit(
        &self,
        session: &dyn TransportSession,
        script: &JobScript,
        working_directory: &Path,
    ) -> Result<String, SchedulerError>;

    fn poll(&self, session: &dyn TransportSession, job: &RemoteJob) -> Result<JobStatus, SchedulerError>;

    /// Ask the scheduler to stop the job. A job the scheduler no longer
    /// knows about is not an error.
    fn cancel(&self, session: &dyn TransportSession, job: &RemoteJob) -> Result<(), SchedulerError>;

    fn render(&self, script: &JobScript) -> Result<String, SchedulerError> {
        Ok(script.render(&self.directives(script))?)
    }
}

/// Write the rendered script into the job directory
pub(crate) fn write_script(
    session: &dyn TransportSession,
    scheduler: &dyn Scheduler,
    script: &JobScript,
    working_directory: &Path,
) -> Result<(), SchedulerError> {
    let text = scheduler.render(script)?;
    session.write_file(&working_directory.join(SUBMIT_SCRIPT_NAME), text.as_bytes())?;
    Ok(())
}

/// Exit status recorded by a finished script, if present and complete
pub(crate) fn recorded_exit_status(
    session: &dyn TransportSession,
    job: &RemoteJob,
) -> Result<Option<i32>, SchedulerError> {
    let path = job.working_directory.join(EXIT_STATUS_FILE);
    if !session.is_file(&path)? {
        return Ok(None);
    }
    let content = session.read_file(&path)?;
    Ok(String::from_utf8_lossy(&content).trim().parse().ok())
}

/// Run a scheduler command, turning a nonzero status into an error
pub(crate) fn run_checked(
    session: &dyn TransportSession,
    command: &str,
    cwd: &Path,
) -> Result<String, SchedulerError> {
    let output = session.exec(command, cwd)?;
    if !output.success() {
        return Err(SchedulerError::Command {
            command: command.to_string(),
            stderr: output.stderr.trim().to_string(),
        });
    }
    Ok(output.stdout)
}

/// Job names most batch systems accept: alphanumerics, dash, underscore
pub(crate) fn sanitize_job_name(name: &str, max_len: usize) -> String {
    let mut cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .take(max_len)
        .collect();
    if !cleaned.starts_with(|c: char| c.is_ascii_alphabetic()) {
        cleaned.insert(0, 'j');
        cleaned.truncate(max_len);
    }
    cleaned
}

//! SLURM: sbatch / squeue / scancel

use regex_lite::Regex;
use std::path::Path;

use super::{
    format_walltime, recorded_exit_status, run_checked, sanitize_job_name, write_script,
    JobScript, JobStatus, RemoteJob, Scheduler, SchedulerError, SCHEDULER_STDERR,
    SCHEDULER_STDOUT, SUBMIT_SCRIPT_NAME,
};
use crate::transport::{quote, TransportSession};

#[derive(Debug)]
pub struct SlurmScheduler {
    job_id_pattern: Regex,
}

impl SlurmScheduler {
    pub fn new() -> Self {
        Self {
            // `sbatch --parsable` prints "<id>" or "<id>;<cluster>"
            job_id_pattern: Regex::new(r"^\s*(\d+)(?:;\S+)?\s*$").expect("static regex"),
        }
    }

    fn parse_submission(&self, stdout: &str) -> Option<String> {
        stdout
            .lines()
            .rev()
            .find_map(|line| self.job_id_pattern.captures(line))
            .map(|caps| caps[1].to_string())
    }
}

impl Default for SlurmScheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Classification of an squeue `%T` state
enum QueueState {
    Status(JobStatus),
    /// Finished normally; the exit status file decides
    Completed,
}

fn classify_state(state: &str) -> QueueState {
    match state {
        "PENDING" | "CONFIGURING" | "REQUEUED" | "REQUEUE_FED" | "REQUEUE_HOLD"
        | "RESV_DEL_HOLD" | "SUSPENDED" | "STOPPED" | "RESIZING" => {
            QueueState::Status(JobStatus::Queued)
        }
        "RUNNING" | "COMPLETING" | "SIGNALING" | "STAGE_OUT" => {
            QueueState::Status(JobStatus::Running)
        }
        "COMPLETED" => QueueState::Completed,
        "CANCELLED" | "FAILED" | "TIMEOUT" | "NODE_FAIL" | "PREEMPTED" | "BOOT_FAIL"
        | "DEADLINE" | "OUT_OF_MEMORY" | "SPECIAL_EXIT" | "REVOKED" => {
            QueueState::Status(JobStatus::Failed {
                reason: format!("SLURM state {}", state),
            })
        }
        other => {
            tracing::warn!(state = other, "unrecognized SLURM job state");
            QueueState::Status(JobStatus::Unknown)
        }
    }
}

/// Status of a job that left the queue, from its exit status file
fn finished_status(session: &dyn TransportSession, job: &RemoteJob) -> Result<JobStatus, SchedulerError> {
    Ok(match recorded_exit_status(session, job)? {
        Some(exit_code) => JobStatus::Done { exit_code },
        None => JobStatus::Unknown,
    })
}

impl Scheduler for SlurmScheduler {
    fn name(&self) -> &'static str {
        "slurm"
    }

    fn directives(&self, script: &JobScript) -> Vec<String> {
        let resources = &script.resources;
        let mut lines = vec![
            "#SBATCH --no-requeue".to_string(),
            format!("#SBATCH --job-name={}", sanitize_job_name(&script.job_name, 128)),
            format!("#SBATCH --output={}", SCHEDULER_STDOUT),
            format!("#SBATCH --error={}", SCHEDULER_STDERR),
            format!("#SBATCH --nodes={}", resources.machines()),
            format!("#SBATCH --ntasks-per-node={}", script.mpiprocs_per_machine),
        ];
        if let Some(seconds) = resources.max_wallclock_seconds {
            lines.push(format!("#SBATCH --time={}", format_walltime(seconds)));
        }
        if let Some(ref queue) = resources.queue_name {
            lines.push(format!("#SBATCH --partition={}", queue));
        }
        if let Some(ref account) = resources.account {
            lines.push(format!("#SBATCH --account={}", account));
        }
        lines
    }

    fn submit(
        &self,
        session: &dyn TransportSession,
        script: &JobScript,
        working_directory: &Path,
    ) -> Result<String, SchedulerError> {
        write_script(session, self, script, working_directory)?;

        let command = format!("sbatch --parsable {}", SUBMIT_SCRIPT_NAME);
        let output = session.exec(&command, working_directory)?;
        if !output.success() {
            return Err(SchedulerError::Submission(output.stderr.trim().to_string()));
        }
        self.parse_submission(&output.stdout)
            .ok_or(SchedulerError::Parse {
                command,
                output: output.stdout,
            })
    }

    fn poll(&self, session: &dyn TransportSession, job: &RemoteJob) -> Result<JobStatus, SchedulerError> {
        let command = format!("squeue --noheader --jobs={} --format=%T", quote(&job.id)?);
        let output = session.exec(&command, &job.working_directory)?;

        let state = output.stdout.split_whitespace().next();
        match state {
            Some(state) if output.success() => match classify_state(state) {
                QueueState::Status(status) => Ok(status),
                // Shared filesystems can lag behind the scheduler
                QueueState::Completed => finished_status(session, job),
            },
            // squeue forgets finished jobs, exiting nonzero for their ids
            _ if output.success() || output.stderr.contains("Invalid job id") => {
                finished_status(session, job)
            }
            _ => Err(SchedulerError::Command {
                command,
                stderr: output.stderr.trim().to_string(),
            }),
        }
    }

    fn cancel(&self, session: &dyn TransportSession, job: &RemoteJob) -> Result<(), SchedulerError> {
        let command = format!("scancel {}", quote(&job.id)?);
        if let Err(e) = run_checked(session, &command, &job.working_directory) {
            match e {
                SchedulerError::Command { ref stderr, .. } => {
                    tracing::warn!(remote_id = %job.id, stderr = %stderr, "scancel refused");
                }
                other => return Err(other),
            }
        }
        Ok(())
    }
}

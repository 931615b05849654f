//! Direct execution: the script runs as a background process, no batch system
//!
//! Where `setsid` exists the script is started in its own session, so its
//! pid is also the process group id and cancellation reaches everything the
//! script started. Elsewhere only the script itself is signalled.

use std::path::Path;

use super::{
    recorded_exit_status, write_script, JobScript, JobStatus, RemoteJob, Scheduler,
    SchedulerError, SUBMIT_SCRIPT_NAME,
};
use crate::transport::TransportSession;

#[derive(Debug, Default)]
pub struct DirectScheduler;

impl DirectScheduler {
    pub fn new() -> Self {
        Self
    }
}

fn parse_pid(stdout: &str) -> Option<u32> {
    stdout.lines().last()?.trim().parse().ok()
}

/// Remote ids are pids; anything else never reaches a shell
fn job_pid(job: &RemoteJob) -> Result<u32, SchedulerError> {
    job.id.trim().parse().map_err(|_| SchedulerError::Parse {
        command: "pid".to_string(),
        output: job.id.clone(),
    })
}

impl Scheduler for DirectScheduler {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn directives(&self, _script: &JobScript) -> Vec<String> {
        Vec::new()
    }

    fn submit(
        &self,
        session: &dyn TransportSession,
        script: &JobScript,
        working_directory: &Path,
    ) -> Result<String, SchedulerError> {
        write_script(session, self, script, working_directory)?;

        let command = format!(
            "chmod +x {script}; session=$(command -v setsid); \
             $session nohup ./{script} > /dev/null 2>&1 < /dev/null & echo $!",
            script = SUBMIT_SCRIPT_NAME
        );
        let output = session.exec(&command, working_directory)?;
        if !output.success() {
            return Err(SchedulerError::Submission(output.stderr.trim().to_string()));
        }
        let pid = parse_pid(&output.stdout).ok_or_else(|| SchedulerError::Parse {
            command,
            output: output.stdout.clone(),
        })?;
        Ok(pid.to_string())
    }

    fn poll(&self, session: &dyn TransportSession, job: &RemoteJob) -> Result<JobStatus, SchedulerError> {
        if let Some(exit_code) = recorded_exit_status(session, job)? {
            return Ok(JobStatus::Done { exit_code });
        }

        let alive = session.exec(
            &format!("kill -0 {} 2>/dev/null", job_pid(job)?),
            &job.working_directory,
        )?;
        if alive.success() {
            return Ok(JobStatus::Running);
        }

        // The process may have exited between the two checks
        match recorded_exit_status(session, job)? {
            Some(exit_code) => Ok(JobStatus::Done { exit_code }),
            None => Ok(JobStatus::Unknown),
        }
    }

    fn cancel(&self, session: &dyn TransportSession, job: &RemoteJob) -> Result<(), SchedulerError> {
        let pid = job_pid(job)?;
        let output = session.exec(
            &format!("kill -TERM -- -{pid} 2>/dev/null || kill -TERM {pid}"),
            &job.working_directory,
        )?;
        if !output.success() {
            tracing::warn!(
                remote_id = %job.id,
                stderr = %output.stderr.trim(),
                "process already gone"
            );
        }
        Ok(())
    }
}

//! PBS Pro: qsub / qstat / qdel

use std::collections::HashMap;
use std::path::Path;

use super::{
    format_walltime, recorded_exit_status, run_checked, sanitize_job_name, write_script,
    JobScript, JobStatus, RemoteJob, Scheduler, SchedulerError, SCHEDULER_STDERR,
    SCHEDULER_STDOUT, SUBMIT_SCRIPT_NAME,
};
use crate::transport::{quote, TransportSession};

/// PBS job names are limited to 15 characters
const MAX_JOB_NAME: usize = 15;

#[derive(Debug, Default)]
pub struct PbsProScheduler;

impl PbsProScheduler {
    pub fn new() -> Self {
        Self
    }
}

/// `key = value` attributes from `qstat -f` output, continuation lines joined
fn parse_qstat_attributes(output: &str) -> HashMap<String, String> {
    let mut attributes = HashMap::new();
    let mut last_key: Option<String> = None;
    for line in output.lines() {
        if line.trim().is_empty() || line.starts_with("Job Id:") {
            continue;
        }
        if let Some((key, value)) = line.split_once(" = ") {
            let key = key.trim().to_string();
            attributes.insert(key.clone(), value.trim().to_string());
            last_key = Some(key);
        } else if let Some(ref key) = last_key {
            if let Some(value) = attributes.get_mut(key) {
                value.push_str(line.trim());
            }
        }
    }
    attributes
}

impl Scheduler for PbsProScheduler {
    fn name(&self) -> &'static str {
        "pbspro"
    }

    fn directives(&self, script: &JobScript) -> Vec<String> {
        let resources = &script.resources;
        let procs = script.mpiprocs_per_machine;
        let mut lines = vec![
            "#PBS -r n".to_string(),
            format!("#PBS -N {}", sanitize_job_name(&script.job_name, MAX_JOB_NAME)),
            format!("#PBS -o {}", SCHEDULER_STDOUT),
            format!("#PBS -e {}", SCHEDULER_STDERR),
            format!(
                "#PBS -l select={}:ncpus={}:mpiprocs={}",
                resources.machines(),
                procs,
                procs
            ),
        ];
        if let Some(seconds) = resources.max_wallclock_seconds {
            lines.push(format!("#PBS -l walltime={}", format_walltime(seconds)));
        }
        if let Some(ref queue) = resources.queue_name {
            lines.push(format!("#PBS -q {}", queue));
        }
        if let Some(ref account) = resources.account {
            lines.push(format!("#PBS -A {}", account));
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

        let command = format!("qsub {}", SUBMIT_SCRIPT_NAME);
        let output = session.exec(&command, working_directory)?;
        if !output.success() {
            return Err(SchedulerError::Submission(output.stderr.trim().to_string()));
        }
        // "1234.server"
        match output.stdout.trim() {
            id if !id.is_empty() && !id.contains(char::is_whitespace) => Ok(id.to_string()),
            _ => Err(SchedulerError::Parse {
                command,
                output: output.stdout.clone(),
            }),
        }
    }

    fn poll(&self, session: &dyn TransportSession, job: &RemoteJob) -> Result<JobStatus, SchedulerError> {
        let command = format!("qstat -x -f {}", quote(&job.id)?);
        let output = session.exec(&command, &job.working_directory)?;

        if !output.success() {
            if output.stderr.contains("Unknown Job Id") || output.stderr.contains("Job has finished") {
                return Ok(match recorded_exit_status(session, job)? {
                    Some(exit_code) => JobStatus::Done { exit_code },
                    None => JobStatus::Unknown,
                });
            }
            return Err(SchedulerError::Command {
                command,
                stderr: output.stderr.trim().to_string(),
            });
        }

        let attributes = parse_qstat_attributes(&output.stdout);
        let state = attributes.get("job_state").ok_or_else(|| SchedulerError::Parse {
            command: command.clone(),
            output: output.stdout.clone(),
        })?;

        match state.as_str() {
            "Q" | "H" | "W" | "T" | "S" | "U" => Ok(JobStatus::Queued),
            "R" | "E" | "B" => Ok(JobStatus::Running),
            "F" | "X" => {
                if let Some(exit_code) = recorded_exit_status(session, job)? {
                    return Ok(JobStatus::Done { exit_code });
                }
                // Negative Exit_status values are PBS-side failures
                match attributes
                    .get("Exit_status")
                    .and_then(|s| s.parse::<i32>().ok())
                {
                    Some(code) if code < 0 => Ok(JobStatus::Failed {
                        reason: format!("PBS Exit_status {}", code),
                    }),
                    _ => Ok(JobStatus::Unknown),
                }
            }
            other => {
                tracing::warn!(state = other, "unrecognized PBS job state");
                Ok(JobStatus::Unknown)
            }
        }
    }

    fn cancel(&self, session: &dyn TransportSession, job: &RemoteJob) -> Result<(), SchedulerError> {
        let command = format!("qdel {}", quote(&job.id)?);
        match run_checked(session, &command, &job.working_directory) {
            Ok(_) => Ok(()),
            Err(SchedulerError::Command { stderr, .. }) => {
                tracing::warn!(remote_id = %job.id, stderr = %stderr, "qdel refused");
                Ok(())
            }
            Err(other) => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::script::tests_support::sample;

    const QSTAT_FINISHED: &str = "Job Id: 4242.pbs01
    Job_Name = jobstage-0123
    job_state = F
    Exit_status = -11
    Resource_List.select = 2:ncpus=4:mpiprocs=4
    Variable_List = PBS_O_HOME=/home/alice,PBS_O_LANG=C,
\tPBS_O_PATH=/usr/bin
";

    #[test]
    fn test_parse_qstat_attributes() {
        let attrs = parse_qstat_attributes(QSTAT_FINISHED);
        assert_eq!(attrs["job_state"], "F");
        assert_eq!(attrs["Exit_status"], "-11");
        assert!(attrs["Variable_List"].ends_with("PBS_O_PATH=/usr/bin"));
    }

    #[test]
    fn test_directives() {
        let lines = PbsProScheduler::new().directives(&sample());
        assert!(lines.contains(&"#PBS -l select=2:ncpus=4:mpiprocs=4".to_string()));
        assert!(lines.contains(&"#PBS -l walltime=01:01:01".to_string()));
        assert!(lines.contains(&"#PBS -q debug".to_string()));
        assert!(lines.contains(&"#PBS -A proj42".to_string()));
        let name = lines.iter().find(|l| l.starts_with("#PBS -N ")).unwrap();
        assert!(name.len() <= "#PBS -N ".len() + MAX_JOB_NAME);
    }
}

//! Job script rendering and resource requests

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::calcjob::CommandDescriptor;
use crate::computer::Computer;
use crate::transport::{quote, quote_path, TransportError};

use super::EXIT_STATUS_FILE;

/// Resources requested from the scheduler
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JobResources {
    pub num_machines: Option<u32>,
    pub num_mpiprocs_per_machine: Option<u32>,
    pub max_wallclock_seconds: Option<u64>,
    pub queue_name: Option<String>,
    pub account: Option<String>,
}

impl JobResources {
    pub fn machines(&self) -> u32 {
        self.num_machines.unwrap_or(1)
    }

    /// Per-machine processes, falling back to the computer default and then 1
    pub fn mpiprocs_per_machine(&self, computer: &Computer) -> u32 {
        self.num_mpiprocs_per_machine
            .or(computer.default_mpiprocs_per_machine)
            .unwrap_or(1)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.num_machines == Some(0) {
            return Err("num_machines must be positive".to_string());
        }
        if self.num_mpiprocs_per_machine == Some(0) {
            return Err("num_mpiprocs_per_machine must be positive".to_string());
        }
        if self.max_wallclock_seconds == Some(0) {
            return Err("max_wallclock_seconds must be positive".to_string());
        }
        Ok(())
    }
}

/// `HH:MM:SS`, hours unbounded
pub fn format_walltime(seconds: u64) -> String {
    format!(
        "{:02}:{:02}:{:02}",
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60
    )
}

/// Everything a scheduler needs to render and submit one job
#[derive(Debug, Clone)]
pub struct JobScript {
    pub job_name: String,
    pub command: CommandDescriptor,
    pub executable: PathBuf,
    pub withmpi: bool,
    pub resources: JobResources,
    pub shebang: String,
    pub prepend_text: String,
    pub append_text: String,
    /// MPI launcher tokens, already substituted
    pub mpirun: Vec<String>,
    /// Per-machine processes after defaults are applied
    pub mpiprocs_per_machine: u32,
}

impl JobScript {
    pub fn new(
        computer: &Computer,
        command: CommandDescriptor,
        executable: PathBuf,
        withmpi: bool,
        resources: JobResources,
    ) -> Self {
        let per_machine = resources.mpiprocs_per_machine(computer);
        let total = resources.machines() * per_machine;
        Self {
            job_name: format!("jobstage-{}", command.id()),
            command,
            executable,
            withmpi,
            resources,
            shebang: computer.shebang.clone(),
            prepend_text: computer.prepend_text.clone(),
            append_text: computer.append_text.clone(),
            mpirun: computer.mpirun_for(total),
            mpiprocs_per_machine: per_machine,
        }
    }

    /// The command line, with redirections
    pub fn command_line(&self) -> Result<String, TransportError> {
        let mut words: Vec<String> = Vec::new();
        if self.withmpi {
            for token in &self.mpirun {
                words.push(quote(token)?);
            }
        }
        words.push(quote_path(&self.executable)?);
        for arg in self.command.args() {
            words.push(quote(arg)?);
        }
        if let Some(stdin) = self.command.stdin_name() {
            words.push(format!("< {}", quote(stdin)?));
        }
        words.push(format!("> {}", quote(self.command.stdout_name())?));
        if let Some(stderr) = self.command.stderr_name() {
            words.push(format!("2> {}", quote(stderr)?));
        }
        Ok(words.join(" "))
    }

    /// Full script text with the scheduler's directives after the shebang.
    ///
    /// The exit status file is written last, by rename, so its presence means
    /// the whole script finished.
    pub fn render(&self, directives: &[String]) -> Result<String, TransportError> {
        let mut lines = vec![self.shebang.clone()];
        lines.extend(directives.iter().cloned());
        lines.push(String::new());
        if !self.prepend_text.trim().is_empty() {
            lines.push(self.prepend_text.trim_end().to_string());
            lines.push(String::new());
        }
        lines.push(self.command_line()?);
        lines.push("jobstage_status=$?".to_string());
        if !self.append_text.trim().is_empty() {
            lines.push(String::new());
            lines.push(self.append_text.trim_end().to_string());
        }
        lines.push(String::new());
        lines.push(format!(
            "echo $jobstage_status > {file}.tmp && mv {file}.tmp {file}",
            file = EXIT_STATUS_FILE
        ));
        lines.push(String::new());
        Ok(lines.join("\n"))
    }
}

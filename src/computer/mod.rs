//! Computers: named execution targets
//!
//! A computer records where jobs run (hostname, working directory) and how
//! the engine reaches it (transport and scheduler type tags). Registration
//! validates the record; credentials live separately in AuthInfo.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::backends::Backends;

/// Placeholder substituted with the remote username in `workdir`
pub const USERNAME_PLACEHOLDER: &str = "{username}";

fn default_enabled() -> bool {
    true
}

fn default_shebang() -> String {
    "#!/bin/bash".to_string()
}

fn default_mpirun_command() -> Vec<String> {
    vec![
        "mpirun".to_string(),
        "-np".to_string(),
        "{tot_num_mpiprocs}".to_string(),
    ]
}

/// A registered execution target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Computer {
    /// Unique label
    pub name: String,

    #[serde(default)]
    pub description: String,

    pub hostname: String,

    /// Absolute root for job directories; may contain `{username}`
    pub workdir: String,

    /// Transport type tag
    pub transport: String,

    /// Scheduler type tag
    pub scheduler: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// First line of every job script
    #[serde(default = "default_shebang")]
    pub shebang: String,

    /// Shell text placed before the job command
    #[serde(default)]
    pub prepend_text: String,

    /// Shell text placed after the job command
    #[serde(default)]
    pub append_text: String,

    /// Launcher for MPI jobs; `{tot_num_mpiprocs}` is substituted
    #[serde(default = "default_mpirun_command")]
    pub mpirun_command: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_mpiprocs_per_machine: Option<u32>,
}

/// Errors for computer registration
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Computer '{name}': field '{field}' must not be empty")]
    MissingField { name: String, field: &'static str },

    #[error("Computer '{name}': workdir '{workdir}' is not an absolute path")]
    RelativeWorkdir { name: String, workdir: String },

    #[error("Computer '{name}': unknown transport type '{tag}'")]
    UnknownTransport { name: String, tag: String },

    #[error("Computer '{name}': unknown scheduler type '{tag}'")]
    UnknownScheduler { name: String, tag: String },

    #[error("Computer '{name}': invalid value for '{field}': {reason}")]
    InvalidValue {
        name: String,
        field: &'static str,
        reason: String,
    },

    #[error("Duplicate computer name: '{0}'")]
    DuplicateName(String),

    #[error("Computer '{0}' is not registered")]
    NotFound(String),

    #[error("Computer '{0}' is disabled")]
    Disabled(String),
}

impl Computer {
    pub fn new(
        name: impl Into<String>,
        hostname: impl Into<String>,
        workdir: impl Into<String>,
        transport: impl Into<String>,
        scheduler: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            hostname: hostname.into(),
            workdir: workdir.into(),
            transport: transport.into(),
            scheduler: scheduler.into(),
            enabled: true,
            shebang: default_shebang(),
            prepend_text: String::new(),
            append_text: String::new(),
            mpirun_command: default_mpirun_command(),
            default_mpiprocs_per_machine: None,
        }
    }

    /// Check the record against the available backends
    pub fn validate(&self, backends: &Backends) -> Result<(), ValidationError> {
        let name = self.name.clone();
        if self.name.trim().is_empty() {
            return Err(ValidationError::MissingField {
                name,
                field: "name",
            });
        }
        if self.hostname.trim().is_empty() {
            return Err(ValidationError::MissingField {
                name,
                field: "hostname",
            });
        }
        if self.workdir.trim().is_empty() {
            return Err(ValidationError::MissingField {
                name,
                field: "workdir",
            });
        }
        if !Path::new(&self.workdir).is_absolute() {
            return Err(ValidationError::RelativeWorkdir {
                name,
                workdir: self.workdir.clone(),
            });
        }
        if backends.transport(&self.transport).is_none() {
            return Err(ValidationError::UnknownTransport {
                name,
                tag: self.transport.clone(),
            });
        }
        if backends.scheduler(&self.scheduler).is_none() {
            return Err(ValidationError::UnknownScheduler {
                name,
                tag: self.scheduler.clone(),
            });
        }
        if !self.shebang.starts_with("#!") {
            return Err(ValidationError::InvalidValue {
                name,
                field: "shebang",
                reason: "must start with '#!'".to_string(),
            });
        }
        if self.default_mpiprocs_per_machine == Some(0) {
            return Err(ValidationError::InvalidValue {
                name,
                field: "default_mpiprocs_per_machine",
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Working directory root with `{username}` substituted.
    ///
    /// Falls back to `$USER` when the credentials carry no username.
    pub fn resolved_workdir(&self, username: Option<&str>) -> PathBuf {
        if !self.workdir.contains(USERNAME_PLACEHOLDER) {
            return PathBuf::from(&self.workdir);
        }
        let user = username
            .map(String::from)
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_default();
        PathBuf::from(self.workdir.replace(USERNAME_PLACEHOLDER, &user))
    }

    /// MPI launcher tokens for `total_procs` processes
    pub fn mpirun_for(&self, total_procs: u32) -> Vec<String> {
        self.mpirun_command
            .iter()
            .map(|t| t.replace("{tot_num_mpiprocs}", &total_procs.to_string()))
            .collect()
    }
}

/// Why `job_id` cannot name a directory, if it cannot.
///
/// Ids become path components both remotely and in the local store.
pub fn check_job_id(job_id: &str) -> Result<(), &'static str> {
    if job_id.is_empty() {
        return Err("must not be empty");
    }
    if job_id.contains('\0') {
        return Err("must not contain NUL");
    }
    if job_id.contains('/') {
        return Err("must not contain '/'");
    }
    if job_id.contains("..") {
        return Err("must not contain '..'");
    }
    Ok(())
}

/// Sharded per-job directory under a workdir root: `<root>/ab/cd/<rest>`.
///
/// Keeps any single directory from collecting every job.
pub fn job_directory(root: &Path, job_id: &str) -> PathBuf {
    if job_id.len() <= 4 || !job_id.is_char_boundary(2) || !job_id.is_char_boundary(4) {
        return root.join(job_id);
    }
    root.join(&job_id[..2]).join(&job_id[2..4]).join(&job_id[4..])
}

/// Registered computers, in registration order
#[derive(Debug, Clone, Default)]
pub struct ComputerRegistry {
    computers: Vec<Computer>,
}

impl ComputerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, computer: Computer, backends: &Backends) -> Result<(), ValidationError> {
        computer.validate(backends)?;
        if self.get(&computer.name).is_some() {
            return Err(ValidationError::DuplicateName(computer.name));
        }
        tracing::debug!(
            computer = %computer.name,
            transport = %computer.transport,
            scheduler = %computer.scheduler,
            "computer registered"
        );
        self.computers.push(computer);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Computer> {
        self.computers.iter().find(|c| c.name == name)
    }

    /// Look up a computer that jobs may run on
    pub fn usable(&self, name: &str) -> Result<&Computer, ValidationError> {
        let computer = self
            .get(name)
            .ok_or_else(|| ValidationError::NotFound(name.to_string()))?;
        if !computer.enabled {
            return Err(ValidationError::Disabled(name.to_string()));
        }
        Ok(computer)
    }

    pub fn remove(&mut self, name: &str) -> Option<Computer> {
        let index = self.computers.iter().position(|c| c.name == name)?;
        Some(self.computers.remove(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Computer> {
        self.computers.iter()
    }

    pub fn len(&self) -> usize {
        self.computers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.computers.is_empty()
    }
}

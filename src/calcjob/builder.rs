//! Job specification builder
//!
//! Turns a plugin plus raw inputs into a populated staging area, a transfer
//! plan and a command descriptor.

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use super::command::CommandDescriptor;
use super::inputs::{InputSpec, InputValidationError, InputValue, ValidatedInputs};
use super::plan::{LocalCopy, PlanConflictError, RemoteCopy, RetrieveEntry, TransferPlan};
use super::staging::StagingArea;
use crate::scheduler::{JobResources, SCHEDULER_STDERR, SCHEDULER_STDOUT};

/// Link name of the code input every plugin declares
pub const CODE_LINK: &str = "code";

/// Builder errors
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    InputValidation(#[from] InputValidationError),

    #[error(transparent)]
    PlanConflict(#[from] PlanConflictError),

    #[error("Staging area for job {job_id}: {source}")]
    Staging {
        job_id: String,
        #[source]
        source: io::Error,
    },

    #[error("Plugin '{plugin}' failed to write inputs: {reason}")]
    Writer { plugin: String, reason: String },

    #[error("Unknown plugin '{0}'")]
    UnknownPlugin(String),
}

impl BuildError {
    pub fn writer(plugin: &str, reason: impl ToString) -> Self {
        BuildError::Writer {
            plugin: plugin.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// A code type: declares inputs and knows how to lay out its input files
pub trait CalcJobPlugin: Send + Sync {
    /// Registry tag, e.g. "arithmetic.add"
    fn name(&self) -> &str;

    fn spec(&self) -> InputSpec;

    /// Serialize validated inputs into the staging area
    fn write_inputs(&self, staging: &StagingArea, inputs: &ValidatedInputs) -> Result<(), BuildError>;

    /// The command line, with `code_uuid` taken from the code input
    fn command(&self, job_id: &str, inputs: &ValidatedInputs) -> Result<CommandDescriptor, BuildError>;

    /// Files to fetch; the stdout capture file is added when missing
    fn retrieve_list(&self, inputs: &ValidatedInputs) -> Vec<RetrieveEntry>;

    /// Uploads beyond the staged files
    fn local_copy_list(&self, _inputs: &ValidatedInputs) -> Vec<LocalCopy> {
        Vec::new()
    }

    fn remote_copy_list(&self, _inputs: &ValidatedInputs) -> Vec<RemoteCopy> {
        Vec::new()
    }

    fn default_resources(&self) -> JobResources {
        JobResources::default()
    }
}

/// Plugins keyed by tag
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: BTreeMap<String, Arc<dyn CalcJobPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in plugins
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(crate::plugins::ArithmeticAdd));
        registry
    }

    pub fn register(&mut self, plugin: Arc<dyn CalcJobPlugin>) {
        self.plugins.insert(plugin.name().to_string(), plugin);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn CalcJobPlugin>, BuildError> {
        self.plugins
            .get(name)
            .cloned()
            .ok_or_else(|| BuildError::UnknownPlugin(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.plugins.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.plugins.keys()).finish()
    }
}

/// Output of preparation: ready for the orchestrator.
///
/// Owns the staging area, which lives until the job is staged.
#[derive(Debug)]
pub struct PreparedJob {
    pub job_id: String,
    pub inputs: ValidatedInputs,
    pub command: CommandDescriptor,
    pub plan: TransferPlan,
    pub resources: JobResources,
    pub staging: StagingArea,
}

/// Prepares one job with one plugin
pub struct JobBuilder<'a> {
    plugin: &'a dyn CalcJobPlugin,
    job_id: String,
    staging_root: Option<PathBuf>,
}

impl<'a> JobBuilder<'a> {
    pub fn new(plugin: &'a dyn CalcJobPlugin, job_id: impl Into<String>) -> Self {
        Self {
            plugin,
            job_id: job_id.into(),
            staging_root: None,
        }
    }

    /// Create staging areas under `dir` instead of the system temp dir
    pub fn staging_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_root = Some(dir.into());
        self
    }

    pub fn validate_inputs(
        &self,
        raw: BTreeMap<String, InputValue>,
    ) -> Result<ValidatedInputs, InputValidationError> {
        self.plugin.spec().validate(raw)
    }

    fn staging_error(&self, source: io::Error) -> BuildError {
        BuildError::Staging {
            job_id: self.job_id.clone(),
            source,
        }
    }

    pub fn create_staging(&self) -> Result<StagingArea, BuildError> {
        let area = match &self.staging_root {
            Some(root) => StagingArea::create_in(root, &self.job_id),
            None => StagingArea::create(&self.job_id),
        };
        area.map_err(|e| self.staging_error(e))
    }

    /// Populate the staging area through the plugin.
    ///
    /// Takes ownership so a failed write drops (and deletes) the area.
    pub fn write_inputs(
        &self,
        staging: StagingArea,
        inputs: &ValidatedInputs,
    ) -> Result<StagingArea, BuildError> {
        staging.ensure_writable().map_err(|e| self.staging_error(e))?;
        self.plugin.write_inputs(&staging, inputs)?;
        tracing::debug!(
            job_id = %self.job_id,
            plugin = self.plugin.name(),
            path = %staging.path().display(),
            "inputs written"
        );
        Ok(staging)
    }

    /// Retrieve, local-copy and remote-copy lists for a populated area
    pub fn build_transfer_plan(
        &self,
        staging: &StagingArea,
        inputs: &ValidatedInputs,
        command: &CommandDescriptor,
    ) -> Result<TransferPlan, BuildError> {
        let mut retrieve = self.plugin.retrieve_list(inputs);
        let has = |retrieve: &[RetrieveEntry], name: &str| retrieve.iter().any(|e| e.remote == name);
        if !has(&retrieve, command.stdout_name()) {
            retrieve.insert(0, RetrieveEntry::required(command.stdout_name()));
        }
        for extra in [SCHEDULER_STDOUT, SCHEDULER_STDERR] {
            if !has(&retrieve, extra) {
                retrieve.push(RetrieveEntry::optional(extra));
            }
        }

        let mut local_copy: Vec<LocalCopy> = staging
            .files()
            .map_err(|e| self.staging_error(e))?
            .into_iter()
            .map(|relative| LocalCopy {
                source: staging.path().join(&relative),
                destination: relative,
            })
            .collect();
        local_copy.extend(self.plugin.local_copy_list(inputs));

        let remote_copy = self.plugin.remote_copy_list(inputs);
        Ok(TransferPlan::new(retrieve, local_copy, remote_copy)?)
    }

    /// Validate, write and plan in one go
    pub fn prepare(self, raw: BTreeMap<String, InputValue>) -> Result<PreparedJob, BuildError> {
        let inputs = self.validate_inputs(raw)?;
        self.prepare_validated(inputs)
    }

    /// Write and plan from inputs already checked by [`Self::validate_inputs`]
    pub fn prepare_validated(self, inputs: ValidatedInputs) -> Result<PreparedJob, BuildError> {
        let command = self.plugin.command(&self.job_id, &inputs)?;
        let staging = self.write_inputs(self.create_staging()?, &inputs)?;
        let plan = self.build_transfer_plan(&staging, &inputs, &command)?;
        Ok(PreparedJob {
            job_id: self.job_id,
            inputs,
            command,
            plan,
            resources: self.plugin.default_resources(),
            staging,
        })
    }
}

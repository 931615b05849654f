//! Engine: the entry point that owns registries and starts job threads
//!
//! `submit` validates and prepares the job on the caller's thread, so
//! configuration and input errors surface immediately. Staging, submission,
//! polling and retrieval then run on a dedicated thread behind a `JobHandle`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use uuid::Uuid;

use crate::authinfo::ParamValue;
use crate::backends::Backends;
use crate::calcjob::{InputValue, JobBuilder, PluginRegistry, CODE_LINK};
use crate::code::Code;
use crate::computer::{check_job_id, Computer, ValidationError};
use crate::config::EngineConfig;
use crate::inventory::{Inventory, Registries};
use crate::orchestrator::{
    CancellationToken, FailureKind, JobContext, JobError, JobFailure, JobOutcome, Orchestrator,
};
use crate::scheduler::{JobResources, JobScript, RemoteJob};
use crate::state::{FileJobStore, JobRunState, JobStore};
use crate::transport::Session;

/// A request to run one calculation
#[derive(Debug, Clone)]
pub struct JobRequest {
    /// Stable identifier; also names the remote job directory
    pub job_id: String,
    pub plugin: String,
    pub computer: String,
    pub user: String,
    pub inputs: BTreeMap<String, InputValue>,
    /// Overrides the plugin's default resources
    pub resources: Option<JobResources>,
}

impl JobRequest {
    /// Request with a fresh job id
    pub fn new(
        plugin: impl Into<String>,
        computer: impl Into<String>,
        user: impl Into<String>,
        inputs: BTreeMap<String, InputValue>,
    ) -> Self {
        Self {
            job_id: Uuid::new_v4().to_string(),
            plugin: plugin.into(),
            computer: computer.into(),
            user: user.into(),
            inputs,
            resources: None,
        }
    }
}

/// A running (or finished) job
pub struct JobHandle {
    job_id: String,
    record: Arc<Mutex<JobRunState>>,
    cancel: CancellationToken,
    thread: JoinHandle<Result<JobOutcome, JobFailure>>,
}

impl JobHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Snapshot of the job record
    pub fn status(&self) -> JobRunState {
        self.record.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Request cancellation; the job thread fails the job with Cancelled
    pub fn cancel(&self) {
        tracing::info!(job_id = %self.job_id, "cancellation requested");
        self.cancel.cancel();
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Block until the job is terminal
    pub fn wait(self) -> Result<JobOutcome, JobFailure> {
        match self.thread.join() {
            Ok(result) => result,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "job thread panicked".to_string());
                Err(JobFailure::early(self.job_id, JobError::Internal(message)))
            }
        }
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("job_id", &self.job_id)
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Owns computers, credentials, codes and plugins, and runs jobs against them
pub struct Engine {
    config: EngineConfig,
    backends: Backends,
    plugins: PluginRegistry,
    registries: Registries,
    store: Arc<dyn JobStore>,
}

impl Engine {
    /// Fails on a configuration that [`EngineConfig::validate`] rejects
    pub fn new(config: EngineConfig, backends: Backends, plugins: PluginRegistry) -> Result<Self, JobError> {
        config.validate()?;
        let store = Arc::new(FileJobStore::new(config.state_dir.clone()));
        Ok(Self {
            config,
            backends,
            plugins,
            registries: Registries::default(),
            store,
        })
    }

    /// Engine with built-in backends and plugins, populated from an inventory
    pub fn from_inventory(config: EngineConfig, inventory: Inventory) -> Result<Self, JobError> {
        let backends = Backends::builtin();
        let registries = inventory.into_registries(&backends)?;
        let mut engine = Self::new(config, backends, PluginRegistry::builtin())?;
        engine.registries = registries;
        Ok(engine)
    }

    pub fn with_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = store;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    pub fn plugins(&self) -> &PluginRegistry {
        &self.plugins
    }

    pub fn registries(&self) -> &Registries {
        &self.registries
    }

    /// Current registries in inventory file form
    pub fn inventory(&self) -> Inventory {
        Inventory::from_registries(&self.registries)
    }

    pub fn register_computer(&mut self, computer: Computer) -> Result<(), JobError> {
        self.registries.computers.register(computer, &self.backends)?;
        Ok(())
    }

    /// Create or replace the AuthInfo of `user` on `computer`
    pub fn configure(
        &mut self,
        computer: &str,
        user: &str,
        params: BTreeMap<String, ParamValue>,
    ) -> Result<(), JobError> {
        let transport_tag = self
            .registries
            .computers
            .get(computer)
            .ok_or_else(|| ValidationError::NotFound(computer.to_string()))?
            .transport
            .clone();
        let transport = self
            .backends
            .transport(&transport_tag)
            .ok_or_else(|| ValidationError::UnknownTransport {
                name: computer.to_string(),
                tag: transport_tag,
            })?;
        self.registries
            .authinfos
            .configure(computer, user, transport.auth_schema(), params)?;
        Ok(())
    }

    pub fn is_configured(&self, computer: &str, user: &str) -> bool {
        self.registries.authinfos.is_configured(computer, user)
    }

    pub fn register_code(&mut self, code: Code) -> Result<Uuid, JobError> {
        let uuid = code.uuid;
        self.registries.codes.register(code, &self.registries.computers)?;
        Ok(uuid)
    }

    fn context(&self, computer: &str, user: &str, usable: bool) -> Result<JobContext, JobError> {
        let computer = if usable {
            self.registries.computers.usable(computer)?
        } else {
            self.registries
                .computers
                .get(computer)
                .ok_or_else(|| ValidationError::NotFound(computer.to_string()))?
        };
        let auth = self
            .registries
            .authinfos
            .get(&computer.name, user)
            .ok_or_else(|| JobError::NotConfigured {
                computer: computer.name.clone(),
                user: user.to_string(),
            })?;
        let transport = self.backends.transport(&computer.transport).ok_or_else(|| {
            ValidationError::UnknownTransport {
                name: computer.name.clone(),
                tag: computer.transport.clone(),
            }
        })?;
        let scheduler = self.backends.scheduler(&computer.scheduler).ok_or_else(|| {
            ValidationError::UnknownScheduler {
                name: computer.name.clone(),
                tag: computer.scheduler.clone(),
            }
        })?;
        Ok(JobContext {
            computer: computer.clone(),
            auth: auth.clone(),
            transport,
            scheduler,
        })
    }

    /// Open and close a session to check credentials and reachability
    pub fn test_computer(&self, computer: &str, user: &str) -> Result<(), JobError> {
        let ctx = self.context(computer, user, false)?;
        let session = Session::open(ctx.transport.as_ref(), &ctx.computer, &ctx.auth).map_err(
            |source| JobError::Connection {
                computer: ctx.computer.name.clone(),
                source,
            },
        )?;
        tracing::info!(computer, root = %session.root().display(), "connection ok");
        session.close().map_err(|source| JobError::Connection {
            computer: ctx.computer.name.clone(),
            source,
        })
    }

    fn orchestrator(&self, ctx: JobContext, record: JobRunState) -> Orchestrator {
        Orchestrator::new(
            ctx,
            Arc::clone(&self.store),
            self.config.polling.clone(),
            self.config.retry.clone(),
            record,
        )
    }

    fn spawn(
        job_id: String,
        orchestrator: Orchestrator,
        work: impl FnOnce(Orchestrator) -> Result<JobOutcome, JobFailure> + Send + 'static,
    ) -> Result<JobHandle, JobError> {
        let record = orchestrator.record();
        let cancel = orchestrator.cancellation();
        let thread = thread::Builder::new()
            .name(format!("job-{}", job_id))
            .spawn(move || work(orchestrator))
            .map_err(|e| JobError::Internal(format!("failed to start job thread: {}", e)))?;
        Ok(JobHandle {
            job_id,
            record,
            cancel,
            thread,
        })
    }

    /// Validate and prepare a job, then run it on its own thread
    #[tracing::instrument(skip_all, fields(job_id = %request.job_id, plugin = %request.plugin))]
    pub fn submit(&self, request: JobRequest) -> Result<JobHandle, JobError> {
        let JobRequest {
            job_id,
            plugin,
            computer,
            user,
            inputs,
            resources,
        } = request;

        valid_job_id(&job_id)?;
        if self.store.load(&job_id)?.is_some() {
            return Err(JobError::AlreadyExists(job_id));
        }
        let ctx = self.context(&computer, &user, true)?;
        let plugin = self.plugins.get(&plugin)?;

        let mut builder = JobBuilder::new(plugin.as_ref(), job_id.clone());
        if let Some(dir) = &self.config.staging_dir {
            builder = builder.staging_root(dir.clone());
        }
        let validated = builder.validate_inputs(inputs)?;
        let code_ref = validated.code(CODE_LINK)?;
        let code = self
            .registries
            .codes
            .get(&code_ref)
            .ok_or_else(|| JobError::UnknownCode(code_ref.to_string()))?
            .clone();
        if code.computer != ctx.computer.name {
            return Err(ValidationError::InvalidValue {
                name: ctx.computer.name.clone(),
                field: "code",
                reason: format!(
                    "code '{}' is installed on '{}'",
                    code.full_label(),
                    code.computer
                ),
            }
            .into());
        }

        let prepared = builder.prepare_validated(validated)?;
        let resources = resources.unwrap_or_else(|| prepared.resources.clone());
        resources.validate().map_err(JobError::Resources)?;
        let script = JobScript::new(
            &ctx.computer,
            prepared.command.clone(),
            code.executable.clone(),
            code.withmpi,
            resources,
        );

        let record = JobRunState::new(
            job_id.clone(),
            plugin.name(),
            ctx.computer.name.clone(),
            user,
            prepared.plan.retrieve().to_vec(),
        );
        self.store.save(&record)?;
        tracing::info!(
            job_id = %job_id,
            plugin = plugin.name(),
            computer = %ctx.computer.name,
            code = %code.full_label(),
            "job built"
        );

        let orchestrator = self.orchestrator(ctx, record);
        Self::spawn(job_id, orchestrator, move |o| o.run(prepared, script))
    }

    /// Continue a persisted job without resubmitting it
    pub fn resume(&self, job_id: &str) -> Result<JobHandle, JobError> {
        valid_job_id(job_id)?;
        let record = self
            .store
            .load(job_id)?
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
        let ctx = self.context(&record.computer, &record.user, false)?;
        let orchestrator = self.orchestrator(ctx, record);
        Self::spawn(job_id.to_string(), orchestrator, Orchestrator::resume)
    }

    pub fn await_completion(&self, handle: JobHandle) -> Result<JobOutcome, JobFailure> {
        handle.wait()
    }

    /// Persisted record of a job
    pub fn status(&self, job_id: &str) -> Result<JobRunState, JobError> {
        valid_job_id(job_id)?;
        self.store
            .load(job_id)?
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))
    }

    pub fn jobs(&self) -> Result<Vec<JobRunState>, JobError> {
        Ok(self.store.list()?)
    }

    /// Cancel a job that is not running in this process, working from its
    /// persisted record. The scheduler is contacted only when the record has
    /// a remote job.
    pub fn cancel_detached(&self, job_id: &str) -> Result<JobRunState, JobError> {
        let mut record = self.status(job_id)?;
        if record.is_terminal() {
            return Ok(record);
        }
        if record.state.has_remote_job() {
            if let Some(job) = record.remote_job() {
                self.cancel_remote(&record, &job)?;
            }
        }
        let state = record.state;
        record.fail(
            FailureKind::Cancelled,
            JobError::Cancelled { state }.to_string(),
        )?;
        self.store.save(&record)?;
        tracing::info!(job_id, state = ?state, "job cancelled");
        Ok(record)
    }

    fn cancel_remote(&self, record: &JobRunState, job: &RemoteJob) -> Result<(), JobError> {
        let ctx = self.context(&record.computer, &record.user, false)?;
        let session = Session::open(ctx.transport.as_ref(), &ctx.computer, &ctx.auth).map_err(
            |source| JobError::Connection {
                computer: ctx.computer.name.clone(),
                source,
            },
        )?;
        if let Err(e) = ctx.scheduler.cancel(&*session, job) {
            tracing::warn!(remote_id = %job.id, error = %e, "scheduler cancel failed");
        }
        Ok(())
    }
}

fn valid_job_id(job_id: &str) -> Result<(), JobError> {
    check_job_id(job_id).map_err(|reason| JobError::InvalidJobId {
        job_id: job_id.to_string(),
        reason,
    })
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("state_dir", &self.config.state_dir)
            .field("computers", &self.registries.computers.len())
            .field("plugins", &self.plugins)
            .finish()
    }
}

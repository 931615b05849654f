//! jobstage - calculation-job staging and remote execution
//!
//! Turns a calculation request (a plugin plus typed inputs) into files and a
//! job script on a local or remote computer, submits it through a scheduler,
//! polls it to completion and retrieves its outputs.

pub mod authinfo;
pub mod backends;
pub mod calcjob;
pub mod code;
pub mod computer;
pub mod config;
pub mod engine;
pub mod inventory;
pub mod orchestrator;
pub mod plugins;
pub mod scheduler;
pub mod state;
pub mod transport;

pub use authinfo::{AuthInfo, CredentialSchema, InvalidParameterError, ParamValue};
pub use backends::Backends;
pub use calcjob::{CalcJobPlugin, InputValue, PluginRegistry};
pub use code::Code;
pub use computer::{Computer, ValidationError};
pub use config::EngineConfig;
pub use engine::{Engine, JobHandle, JobRequest};
pub use inventory::Inventory;
pub use orchestrator::{FailureKind, JobError, JobFailure, JobOutcome};
pub use scheduler::{JobStatus, Scheduler};
pub use state::{JobRunState, JobState};
pub use transport::{Transport, TransportSession};

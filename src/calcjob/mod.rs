//! Job specification: inputs, staging, transfer plan and command descriptor

mod builder;
mod command;
mod inputs;
mod plan;
mod staging;

pub use builder::{BuildError, CalcJobPlugin, JobBuilder, PluginRegistry, PreparedJob, CODE_LINK};
pub use command::{CommandBuilder, CommandDescriptor, DEFAULT_STDOUT_NAME};
pub use inputs::{
    validate_inputs, InputPort, InputSpec, InputValidationError, InputValue, ValidatedInputs,
    ValueKind,
};
pub use plan::{LocalCopy, PlanConflictError, PlanList, RemoteCopy, RetrieveEntry, TransferPlan};
pub use staging::StagingArea;

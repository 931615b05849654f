//! Command descriptor: what the job script runs

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Immutable description of one job's command line.
///
/// Built once through [`CommandBuilder`]; there is no way to change the
/// argument list afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandDescriptor {
    id: String,
    code_uuid: Uuid,
    args: Vec<String>,
    stdout_name: String,
    stderr_name: Option<String>,
    stdin_name: Option<String>,
}

/// Default stdout capture file
pub const DEFAULT_STDOUT_NAME: &str = "_jobstage_stdout.txt";

impl CommandDescriptor {
    pub fn builder(id: impl Into<String>, code_uuid: Uuid) -> CommandBuilder {
        CommandBuilder {
            inner: CommandDescriptor {
                id: id.into(),
                code_uuid,
                args: Vec::new(),
                stdout_name: DEFAULT_STDOUT_NAME.to_string(),
                stderr_name: None,
                stdin_name: None,
            },
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn code_uuid(&self) -> Uuid {
        self.code_uuid
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn stdout_name(&self) -> &str {
        &self.stdout_name
    }

    pub fn stderr_name(&self) -> Option<&str> {
        self.stderr_name.as_deref()
    }

    pub fn stdin_name(&self) -> Option<&str> {
        self.stdin_name.as_deref()
    }
}

pub struct CommandBuilder {
    inner: CommandDescriptor,
}

impl CommandBuilder {
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.inner.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdout(mut self, name: impl Into<String>) -> Self {
        self.inner.stdout_name = name.into();
        self
    }

    pub fn stderr(mut self, name: impl Into<String>) -> Self {
        self.inner.stderr_name = Some(name.into());
        self
    }

    pub fn stdin(mut self, name: impl Into<String>) -> Self {
        self.inner.stdin_name = Some(name.into());
        self
    }

    pub fn build(self) -> CommandDescriptor {
        self.inner
    }
}

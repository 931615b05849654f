//! Transport Layer
//!
//! Moves files to and from a computer and runs shell commands there.
//! - Transport: stateless factory, shared by every job on a computer
//! - TransportSession: one live connection, owned by a single job phase
//! - Session: scoped guard that closes its session on every exit path
//!
//! Relative paths given to a session resolve against its root, which is the
//! computer's working directory with `{username}` substituted.

mod local;
mod shell;
mod ssh;

pub use local::LocalTransport;
pub use shell::{quote, quote_path, CommandOutput};
pub use ssh::{SshSettings, SshTransport};

use std::io;
use std::ops::Deref;
use std::path::{Path, PathBuf};

use crate::authinfo::{AuthInfo, CredentialSchema};
use crate::computer::Computer;

/// Transport errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection to '{target}' failed: {reason}")]
    Connection { target: String, reason: String },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Command `{command}` exited with status {status}: {stderr}")]
    Command {
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("Session to '{0}' is closed")]
    Closed(String),

    #[error("Cannot pass {0:?} to a shell: it contains a NUL byte")]
    Unquotable(String),
}

impl TransportError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        TransportError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether repeating the same operation could succeed
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Connection { .. } | TransportError::Command { .. } => true,
            TransportError::Io { source, .. } => !matches!(
                source.kind(),
                io::ErrorKind::NotFound
                    | io::ErrorKind::PermissionDenied
                    | io::ErrorKind::InvalidInput
                    | io::ErrorKind::AlreadyExists
            ),
            TransportError::Closed(_) | TransportError::Unquotable(_) => false,
        }
    }
}

/// Factory for sessions of one transport kind
pub trait Transport: Send + Sync {
    /// Transport type tag referenced by computers (e.g. "local", "ssh")
    fn name(&self) -> &'static str;

    /// Parameters an AuthInfo for this transport may carry
    fn auth_schema(&self) -> &CredentialSchema;

    /// Open a session to the computer using the given credentials.
    ///
    /// The session keeps a snapshot of the credentials; later reconfiguration
    /// of the AuthInfo does not affect it.
    fn open(
        &self,
        computer: &Computer,
        auth: &AuthInfo,
    ) -> Result<Box<dyn TransportSession>, TransportError>;
}

/// One open connection to a computer
pub trait TransportSession: Send {
    /// Directory that relative paths resolve against
    fn root(&self) -> &Path;

    fn is_open(&self) -> bool;

    /// Release the connection. Closing an already-closed session is a no-op.
    fn close(&mut self) -> Result<(), TransportError>;

    fn exists(&self, path: &Path) -> Result<bool, TransportError>;

    fn is_file(&self, path: &Path) -> Result<bool, TransportError>;

    /// Upload a local file or directory tree, creating missing parents remotely
    fn put(&self, local: &Path, remote: &Path) -> Result<(), TransportError>;

    /// Download a remote file or directory tree, creating missing local parents
    fn get(&self, remote: &Path, local: &Path) -> Result<(), TransportError>;

    /// Create a directory and any missing parents
    fn mkdir(&self, path: &Path) -> Result<(), TransportError>;

    /// Remove a file or directory tree
    fn remove(&self, path: &Path) -> Result<(), TransportError>;

    /// Copy a file or directory tree within the computer
    fn copy(&self, source: &Path, destination: &Path) -> Result<(), TransportError>;

    fn write_file(&self, path: &Path, contents: &[u8]) -> Result<(), TransportError>;

    fn read_file(&self, path: &Path) -> Result<Vec<u8>, TransportError>;

    /// Run a shell command with `cwd` as working directory
    fn exec(&self, command: &str, cwd: &Path) -> Result<CommandOutput, TransportError>;

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root().join(path)
        }
    }
}

/// Scoped session: closed when dropped, whether the scope exits normally or
/// through an error.
pub struct Session {
    inner: Box<dyn TransportSession>,
    computer: String,
}

impl Session {
    pub fn open(
        transport: &dyn Transport,
        computer: &Computer,
        auth: &AuthInfo,
    ) -> Result<Self, TransportError> {
        let inner = transport.open(computer, auth)?;
        tracing::debug!(
            computer = %computer.name,
            transport = transport.name(),
            root = %inner.root().display(),
            "session opened"
        );
        Ok(Self {
            inner,
            computer: computer.name.clone(),
        })
    }

    /// Close now and report any error instead of logging it on drop
    pub fn close(mut self) -> Result<(), TransportError> {
        self.inner.close()
    }
}

impl Deref for Session {
    type Target = dyn TransportSession;

    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.inner.close() {
            tracing::warn!(computer = %self.computer, error = %e, "failed to close session");
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("computer", &self.computer)
            .field("root", &self.inner.root())
            .field("open", &self.inner.is_open())
            .finish()
    }
}

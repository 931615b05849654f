//! SSH transport
//!
//! Drives the system `ssh` client in batch mode. Every operation is one ssh
//! invocation; file contents travel over stdin/stdout so no remote path is
//! ever parsed by scp.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use walkdir::WalkDir;

use super::shell::quote_path;
use super::{CommandOutput, Transport, TransportError, TransportSession};
use crate::authinfo::{AuthInfo, CredentialSchema, ParamKind, ParamSpec};
use crate::computer::Computer;

/// Exit status ssh itself uses for connection failures
const SSH_FAILURE_STATUS: i32 = 255;

const SSH_PARAMS: &[ParamSpec] = &[
    ParamSpec::new("username", ParamKind::String, "Login name on the remote computer"),
    ParamSpec::new("port", ParamKind::Integer, "SSH port"),
    ParamSpec::new("key_filename", ParamKind::String, "Path to the private key"),
    ParamSpec::new("timeout", ParamKind::Integer, "Connection timeout in seconds"),
    ParamSpec::new(
        "strict_host_key_checking",
        ParamKind::Bool,
        "Refuse hosts missing from known_hosts",
    ),
    ParamSpec::new("proxy_jump", ParamKind::String, "Jump host ([user@]host[:port])"),
];

/// Connection settings resolved from a computer and its AuthInfo
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshSettings {
    pub host: String,
    pub username: Option<String>,
    pub port: u16,
    pub key_filename: Option<String>,
    pub connect_timeout_seconds: u32,
    pub strict_host_key_checking: bool,
    pub proxy_jump: Option<String>,
    pub server_alive_interval: u32,
    pub server_alive_count_max: u32,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            host: String::new(),
            username: None,
            port: 22,
            key_filename: None,
            connect_timeout_seconds: 30,
            strict_host_key_checking: true,
            proxy_jump: None,
            server_alive_interval: 15,
            server_alive_count_max: 2,
        }
    }
}

impl SshSettings {
    pub fn from_auth(computer: &Computer, auth: &AuthInfo) -> Self {
        let defaults = Self::default();
        let string = |key: &str| auth.param(key).and_then(|v| v.as_str()).map(String::from);
        Self {
            host: computer.hostname.clone(),
            username: string("username"),
            port: auth
                .param("port")
                .and_then(|v| v.as_i64())
                .and_then(|p| u16::try_from(p).ok())
                .unwrap_or(defaults.port),
            key_filename: string("key_filename").map(|k| expand_home(&k)),
            connect_timeout_seconds: auth
                .param("timeout")
                .and_then(|v| v.as_i64())
                .and_then(|t| u32::try_from(t).ok())
                .unwrap_or(defaults.connect_timeout_seconds),
            strict_host_key_checking: auth
                .param("strict_host_key_checking")
                .and_then(|v| v.as_bool())
                .unwrap_or(defaults.strict_host_key_checking),
            proxy_jump: string("proxy_jump"),
            ..defaults
        }
    }

    /// `user@host`, or the bare host when no username is configured
    pub fn destination(&self) -> String {
        match &self.username {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }

    /// Arguments placed before the remote command
    pub fn build_ssh_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_seconds),
            "-o".to_string(),
            format!("ServerAliveInterval={}", self.server_alive_interval),
            "-o".to_string(),
            format!("ServerAliveCountMax={}", self.server_alive_count_max),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!(
                "StrictHostKeyChecking={}",
                if self.strict_host_key_checking { "yes" } else { "no" }
            ),
            "-p".to_string(),
            self.port.to_string(),
        ];

        if let Some(ref key) = self.key_filename {
            args.push("-i".to_string());
            args.push(key.clone());
        }
        if let Some(ref jump) = self.proxy_jump {
            args.push("-J".to_string());
            args.push(jump.clone());
        }

        args.push(self.destination());
        args
    }
}

fn expand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return format!("{}/{}", home, rest);
        }
    }
    path.to_string()
}

/// Transport over the system ssh client
#[derive(Debug)]
pub struct SshTransport {
    schema: CredentialSchema,
}

impl SshTransport {
    pub fn new() -> Self {
        Self {
            schema: CredentialSchema::new("ssh", SSH_PARAMS),
        }
    }
}

impl Default for SshTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for SshTransport {
    fn name(&self) -> &'static str {
        "ssh"
    }

    fn auth_schema(&self) -> &CredentialSchema {
        &self.schema
    }

    fn open(
        &self,
        computer: &Computer,
        auth: &AuthInfo,
    ) -> Result<Box<dyn TransportSession>, TransportError> {
        let settings = SshSettings::from_auth(computer, auth);
        let root = computer.resolved_workdir(settings.username.as_deref());
        let session = SshSession {
            settings,
            root,
            open: true,
        };

        // Handshake: fail at open rather than on the first operation
        let output = session.run_raw("true", None)?;
        if !output.status.success() {
            return Err(TransportError::Connection {
                target: session.settings.destination(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(Box::new(session))
    }
}

struct SshSession {
    settings: SshSettings,
    root: PathBuf,
    open: bool,
}

impl SshSession {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.open {
            Ok(())
        } else {
            Err(TransportError::Closed(self.settings.destination()))
        }
    }

    fn run_raw(&self, remote_command: &str, stdin: Option<&[u8]>) -> Result<Output, TransportError> {
        let mut child = Command::new("ssh")
            .args(self.settings.build_ssh_args())
            .arg(remote_command)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| TransportError::Connection {
                target: self.settings.destination(),
                reason: format!("failed to spawn ssh: {}", e),
            })?;

        if let (Some(content), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(content)
                .and_then(|_| pipe.flush())
                .map_err(|e| TransportError::Connection {
                    target: self.settings.destination(),
                    reason: format!("failed to write to ssh: {}", e),
                })?;
        }

        child.wait_with_output().map_err(|e| TransportError::Connection {
            target: self.settings.destination(),
            reason: format!("ssh process error: {}", e),
        })
    }

    /// Run a command that must succeed; returns stdout bytes
    fn run_checked(&self, remote_command: &str, stdin: Option<&[u8]>) -> Result<Vec<u8>, TransportError> {
        let output = self.run_raw(remote_command, stdin)?;
        let status = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        match status {
            0 => Ok(output.stdout),
            SSH_FAILURE_STATUS => Err(TransportError::Connection {
                target: self.settings.destination(),
                reason: stderr,
            }),
            _ => Err(TransportError::Command {
                command: remote_command.to_string(),
                status,
                stderr,
            }),
        }
    }

    /// `test` style probe: Ok(true) on 0, Ok(false) on 1
    fn probe(&self, remote_command: &str) -> Result<bool, TransportError> {
        let output = self.run_raw(remote_command, None)?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            status => Err(TransportError::Connection {
                target: self.settings.destination(),
                reason: format!(
                    "`{}` exited with {:?}: {}",
                    remote_command,
                    status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            }),
        }
    }

    fn put_file(&self, local: &Path, remote: &Path) -> Result<(), TransportError> {
        let content = fs::read(local).map_err(|e| TransportError::io(local, e))?;
        self.write_file(remote, &content)
    }

    fn get_file(&self, remote: &Path, local: &Path) -> Result<(), TransportError> {
        let content = self.read_file(remote)?;
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent).map_err(|e| TransportError::io(parent, e))?;
        }
        fs::write(local, content).map_err(|e| TransportError::io(local, e))
    }
}

impl TransportSession for SshSession {
    fn root(&self) -> &Path {
        &self.root
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.open = false;
        Ok(())
    }

    fn exists(&self, path: &Path) -> Result<bool, TransportError> {
        self.ensure_open()?;
        self.probe(&format!("test -e {}", quote_path(&self.resolve(path))?))
    }

    fn is_file(&self, path: &Path) -> Result<bool, TransportError> {
        self.ensure_open()?;
        self.probe(&format!("test -f {}", quote_path(&self.resolve(path))?))
    }

    fn put(&self, local: &Path, remote: &Path) -> Result<(), TransportError> {
        self.ensure_open()?;
        let remote = self.resolve(remote);
        if !local.is_dir() {
            return self.put_file(local, &remote);
        }
        self.mkdir(&remote)?;
        for entry in WalkDir::new(local).min_depth(1) {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(local).to_path_buf();
                TransportError::io(path, e.into())
            })?;
            let relative = entry.path().strip_prefix(local).unwrap_or_else(|_| entry.path());
            let target = remote.join(relative);
            if entry.file_type().is_dir() {
                self.mkdir(&target)?;
            } else {
                self.put_file(entry.path(), &target)?;
            }
        }
        Ok(())
    }

    fn get(&self, remote: &Path, local: &Path) -> Result<(), TransportError> {
        self.ensure_open()?;
        let remote = self.resolve(remote);
        if self.is_file(&remote)? {
            return self.get_file(&remote, local);
        }
        let listing = self.run_checked(&format!("find {} -type f", quote_path(&remote)?), None)?;
        for line in String::from_utf8_lossy(&listing).lines() {
            let file = Path::new(line);
            if let Ok(relative) = file.strip_prefix(&remote) {
                self.get_file(file, &local.join(relative))?;
            }
        }
        Ok(())
    }

    fn mkdir(&self, path: &Path) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.run_checked(&format!("mkdir -p {}", quote_path(&self.resolve(path))?), None)?;
        Ok(())
    }

    fn remove(&self, path: &Path) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.run_checked(&format!("rm -rf {}", quote_path(&self.resolve(path))?), None)?;
        Ok(())
    }

    fn copy(&self, source: &Path, destination: &Path) -> Result<(), TransportError> {
        self.ensure_open()?;
        let destination = self.resolve(destination);
        let parent = destination.parent().unwrap_or(&self.root);
        self.run_checked(
            &format!(
                "mkdir -p {} && cp -r {} {}",
                quote_path(parent)?,
                quote_path(&self.resolve(source))?,
                quote_path(&destination)?
            ),
            None,
        )?;
        Ok(())
    }

    fn write_file(&self, path: &Path, contents: &[u8]) -> Result<(), TransportError> {
        self.ensure_open()?;
        let path = self.resolve(path);
        let parent = path.parent().unwrap_or(&self.root);
        self.run_checked(
            &format!("mkdir -p {} && cat > {}", quote_path(parent)?, quote_path(&path)?),
            Some(contents),
        )?;
        Ok(())
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>, TransportError> {
        self.ensure_open()?;
        self.run_checked(&format!("cat {}", quote_path(&self.resolve(path))?), None)
    }

    fn exec(&self, command: &str, cwd: &Path) -> Result<CommandOutput, TransportError> {
        self.ensure_open()?;
        let remote = format!("cd {} && {}", quote_path(&self.resolve(cwd))?, command);
        tracing::trace!(host = %self.settings.host, command = %remote, "ssh exec");
        let output = self.run_raw(&remote, None)?;
        let result = CommandOutput::from_output(output);
        if result.status == SSH_FAILURE_STATUS {
            return Err(TransportError::Connection {
                target: self.settings.destination(),
                reason: result.stderr.trim().to_string(),
            });
        }
        Ok(result)
    }
}

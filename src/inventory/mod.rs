//! Inventory file
//!
//! Computers, AuthInfos and codes persisted at `~/.config/jobstage/inventory.toml`:
//!
//! ```toml
//! [[computer]]
//! name = "cluster"
//! hostname = "login.cluster.example"
//! workdir = "/scratch/{username}/jobstage"
//! transport = "ssh"
//! scheduler = "slurm"
//!
//! [[authinfo]]
//! user = "alice"
//! computer = "cluster"
//! params = { username = "alice", port = 22 }
//!
//! [[code]]
//! label = "add"
//! computer = "cluster"
//! executable = "/opt/bin/add.sh"
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::authinfo::{AuthInfo, AuthInfoStore, InvalidParameterError};
use crate::backends::Backends;
use crate::code::{Code, CodeRegistry};
use crate::computer::{Computer, ComputerRegistry, ValidationError};
use crate::config::EngineConfig;

/// Inventory file contents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inventory {
    /// Schema version for forward compatibility
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,

    #[serde(default, rename = "computer")]
    pub computers: Vec<Computer>,

    #[serde(default, rename = "authinfo")]
    pub authinfos: Vec<AuthInfo>,

    #[serde(default, rename = "code")]
    pub codes: Vec<Code>,
}

fn default_schema_version() -> u32 {
    1
}

impl Default for Inventory {
    fn default() -> Self {
        Self {
            schema_version: default_schema_version(),
            computers: Vec::new(),
            authinfos: Vec::new(),
            codes: Vec::new(),
        }
    }
}

/// Errors that can occur when loading, validating or saving the inventory
#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    #[error("Failed to access inventory {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize inventory: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Duplicate computer name: '{0}'")]
    DuplicateName(String),

    #[error("AuthInfo for user '{user}' refers to unknown computer '{computer}'")]
    UnknownComputer { user: String, computer: String },

    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("AuthInfo for user '{user}' on '{computer}': {source}")]
    Credentials {
        user: String,
        computer: String,
        #[source]
        source: InvalidParameterError,
    },

    #[error("Inventory file not found: {0}")]
    NotFound(PathBuf),
}

/// Validated, in-memory form of the inventory
#[derive(Debug, Clone, Default)]
pub struct Registries {
    pub computers: ComputerRegistry,
    pub authinfos: AuthInfoStore,
    pub codes: CodeRegistry,
}

impl Inventory {
    /// Get the default inventory file path
    pub fn default_path() -> PathBuf {
        EngineConfig::config_dir().join("inventory.toml")
    }

    /// Load inventory from a specific path
    pub fn load(path: &Path) -> Result<Self, InventoryError> {
        if !path.exists() {
            return Err(InventoryError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path).map_err(|source| InventoryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Like `load`, but a missing file is an empty inventory
    pub fn load_or_default(path: &Path) -> Result<Self, InventoryError> {
        match Self::load(path) {
            Err(InventoryError::NotFound(_)) => Ok(Self::default()),
            other => other,
        }
    }

    /// Parse inventory from TOML string
    pub fn parse(content: &str) -> Result<Self, InventoryError> {
        let inventory: Inventory = toml::from_str(content)?;
        inventory.validate()?;
        Ok(inventory)
    }

    /// Structural checks; backend tags and credentials are checked by
    /// `into_registries`
    fn validate(&self) -> Result<(), InventoryError> {
        let mut names = HashSet::new();
        for computer in &self.computers {
            if !names.insert(computer.name.as_str()) {
                return Err(InventoryError::DuplicateName(computer.name.clone()));
            }
        }
        for auth in &self.authinfos {
            if !names.contains(auth.computer.as_str()) {
                return Err(InventoryError::UnknownComputer {
                    user: auth.user.clone(),
                    computer: auth.computer.clone(),
                });
            }
        }
        Ok(())
    }

    /// Register everything, validating against the available backends
    pub fn into_registries(self, backends: &Backends) -> Result<Registries, InventoryError> {
        let mut registries = Registries::default();
        for computer in self.computers {
            registries.computers.register(computer, backends)?;
        }
        for auth in self.authinfos {
            let schema = registries
                .computers
                .get(&auth.computer)
                .and_then(|c| backends.transport(&c.transport))
                .ok_or_else(|| InventoryError::UnknownComputer {
                    user: auth.user.clone(),
                    computer: auth.computer.clone(),
                })?;
            registries
                .authinfos
                .configure(&auth.computer, &auth.user, schema.auth_schema(), auth.params)
                .map_err(|source| InventoryError::Credentials {
                    user: auth.user.clone(),
                    computer: auth.computer.clone(),
                    source,
                })?;
        }
        for code in self.codes {
            registries.codes.register(code, &registries.computers)?;
        }
        Ok(registries)
    }

    pub fn from_registries(registries: &Registries) -> Self {
        Self {
            schema_version: default_schema_version(),
            computers: registries.computers.iter().cloned().collect(),
            authinfos: registries.authinfos.iter().cloned().collect(),
            codes: registries.codes.iter().cloned().collect(),
        }
    }

    pub fn to_toml(&self) -> Result<String, InventoryError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Write atomically (write-then-rename), creating the parent directory
    pub fn save(&self, path: &Path) -> Result<(), InventoryError> {
        let io_err = |source| InventoryError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let content = self.to_toml()?;
        let temp_path = path.with_extension("toml.tmp");
        std::fs::write(&temp_path, content).map_err(io_err)?;
        std::fs::rename(&temp_path, path).map_err(io_err)?;
        tracing::debug!(path = %path.display(), "inventory saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authinfo::ParamValue;

    const SAMPLE: &str = r#"
[[computer]]
name = "localhost"
hostname = "localhost"
workdir = "/tmp/jobstage"
transport = "local"
scheduler = "direct"

[[computer]]
name = "cluster"
hostname = "login.cluster.example"
workdir = "/scratch/{username}/jobs"
transport = "ssh"
scheduler = "slurm"
prepend_text = "module load add"

[[authinfo]]
user = "alice"
computer = "cluster"
params = { username = "alice", port = "2222" }

[[code]]
label = "add"
computer = "localhost"
executable = "/usr/local/bin/add.sh"
"#;

    #[test]
    fn test_parse_sample() {
        let inventory = Inventory::parse(SAMPLE).unwrap();
        assert_eq!(inventory.schema_version, 1);
        assert_eq!(inventory.computers.len(), 2);
        assert_eq!(inventory.computers[1].prepend_text, "module load add");
        assert_eq!(inventory.codes[0].label, "add");
    }

    #[test]
    fn test_into_registries_coerces_params() {
        let registries = Inventory::parse(SAMPLE)
            .unwrap()
            .into_registries(&Backends::builtin())
            .unwrap();
        let auth = registries.authinfos.get("cluster", "alice").unwrap();
        assert_eq!(auth.param("port"), Some(&ParamValue::Integer(2222)));
        assert!(registries.codes.by_label("add@localhost").is_some());
    }

    #[test]
    fn test_duplicate_computer_rejected() {
        let content = r#"
[[computer]]
name = "a"
hostname = "h"
workdir = "/w"
transport = "local"
scheduler = "direct"

[[computer]]
name = "a"
hostname = "h2"
workdir = "/w"
transport = "local"
scheduler = "direct"
"#;
        assert!(matches!(
            Inventory::parse(content),
            Err(InventoryError::DuplicateName(name)) if name == "a"
        ));
    }

    #[test]
    fn test_authinfo_for_unknown_computer() {
        let content = r#"
[[authinfo]]
user = "alice"
computer = "nowhere"
"#;
        assert!(matches!(
            Inventory::parse(content),
            Err(InventoryError::UnknownComputer { .. })
        ));
    }

    #[test]
    fn test_bad_credentials_rejected() {
        let content = r#"
[[computer]]
name = "local"
hostname = "localhost"
workdir = "/w"
transport = "local"
scheduler = "direct"

[[authinfo]]
user = "alice"
computer = "local"
params = { port = 22 }
"#;
        let err = Inventory::parse(content)
            .unwrap()
            .into_registries(&Backends::builtin())
            .unwrap_err();
        assert!(matches!(err, InventoryError::Credentials { .. }));
        assert!(err.to_string().contains("alice"));
    }

    #[test]
    fn test_unknown_scheduler_rejected() {
        let content = r#"
[[computer]]
name = "c"
hostname = "h"
workdir = "/w"
transport = "local"
scheduler = "lsf"
"#;
        let err = Inventory::parse(content)
            .unwrap()
            .into_registries(&Backends::builtin())
            .unwrap_err();
        assert!(matches!(
            err,
            InventoryError::Invalid(ValidationError::UnknownScheduler { .. })
        ));
    }

    #[test]
    fn test_save_and_reload() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("nested/inventory.toml");
        let registries = Inventory::parse(SAMPLE)
            .unwrap()
            .into_registries(&Backends::builtin())
            .unwrap();
        let inventory = Inventory::from_registries(&registries);
        inventory.save(&path).unwrap();

        let reloaded = Inventory::load(&path).unwrap();
        assert_eq!(reloaded, inventory);
        assert_eq!(reloaded.codes[0].uuid, registries.codes.iter().next().unwrap().uuid);
    }

    #[test]
    fn test_missing_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("absent.toml");
        assert!(matches!(Inventory::load(&path), Err(InventoryError::NotFound(_))));
        assert_eq!(Inventory::load_or_default(&path).unwrap(), Inventory::default());
    }
}

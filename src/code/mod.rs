//! Installed codes: executables that live on a specific computer

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::computer::{ComputerRegistry, ValidationError};

/// An executable installed on one computer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Code {
    /// Generated when omitted from the inventory
    #[serde(default = "Uuid::new_v4")]
    pub uuid: Uuid,
    pub label: String,
    /// Name of the computer the executable is installed on
    pub computer: String,
    /// Absolute path of the executable on that computer
    pub executable: PathBuf,
    #[serde(default)]
    pub description: String,
    /// Launch through the computer's MPI command
    #[serde(default)]
    pub withmpi: bool,
}

impl Code {
    pub fn new(label: impl Into<String>, computer: impl Into<String>, executable: impl Into<PathBuf>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            label: label.into(),
            computer: computer.into(),
            executable: executable.into(),
            description: String::new(),
            withmpi: false,
        }
    }

    /// `label@computer`
    pub fn full_label(&self) -> String {
        format!("{}@{}", self.label, self.computer)
    }
}

/// Registered codes
#[derive(Debug, Clone, Default)]
pub struct CodeRegistry {
    codes: Vec<Code>,
}

impl CodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, code: Code, computers: &ComputerRegistry) -> Result<(), ValidationError> {
        if computers.get(&code.computer).is_none() {
            return Err(ValidationError::NotFound(code.computer));
        }
        if code.label.trim().is_empty() {
            return Err(ValidationError::InvalidValue {
                name: code.computer,
                field: "code.label",
                reason: "must not be empty".to_string(),
            });
        }
        if !code.executable.is_absolute() {
            return Err(ValidationError::InvalidValue {
                name: code.computer,
                field: "code.executable",
                reason: format!("'{}' is not an absolute path", code.executable.display()),
            });
        }
        if self.get(&code.uuid).is_some() || self.by_label(&code.full_label()).is_some() {
            return Err(ValidationError::InvalidValue {
                name: code.computer.clone(),
                field: "code",
                reason: format!("'{}' is already registered", code.full_label()),
            });
        }
        self.codes.push(code);
        Ok(())
    }

    pub fn get(&self, uuid: &Uuid) -> Option<&Code> {
        self.codes.iter().find(|c| &c.uuid == uuid)
    }

    /// Find by `label@computer`, or by bare label when it is unambiguous
    pub fn by_label(&self, label: &str) -> Option<&Code> {
        if let Some((name, computer)) = label.split_once('@') {
            return self
                .codes
                .iter()
                .find(|c| c.label == name && c.computer == computer);
        }
        let mut matches = self.codes.iter().filter(|c| c.label == label);
        match (matches.next(), matches.next()) {
            (Some(code), None) => Some(code),
            _ => None,
        }
    }

    /// Resolve a UUID string or a label
    pub fn lookup(&self, reference: &str) -> Option<&Code> {
        match Uuid::parse_str(reference) {
            Ok(uuid) => self.get(&uuid),
            Err(_) => self.by_label(reference),
        }
    }

    pub fn remove_computer(&mut self, computer: &str) {
        self.codes.retain(|c| c.computer != computer);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Code> {
        self.codes.iter()
    }
}

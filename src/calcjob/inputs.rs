//! Input declarations and validation

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// A raw or validated input value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum InputValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Dict(BTreeMap<String, serde_json::Value>),
    /// Reference to a registered code
    Code(Uuid),
    /// A file on this machine to upload into the job directory
    LocalFile(PathBuf),
    /// A directory left behind on a computer by an earlier job
    RemoteFolder { computer: String, path: PathBuf },
}

/// Kind tag of an [`InputValue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Int,
    Float,
    Bool,
    Str,
    Dict,
    Code,
    LocalFile,
    RemoteFolder,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Int => "int",
            ValueKind::Float => "float",
            ValueKind::Bool => "bool",
            ValueKind::Str => "str",
            ValueKind::Dict => "dict",
            ValueKind::Code => "code",
            ValueKind::LocalFile => "local_file",
            ValueKind::RemoteFolder => "remote_folder",
        };
        f.write_str(name)
    }
}

impl ValueKind {
    /// Default-constructed value of this kind
    pub fn default_value(self) -> InputValue {
        match self {
            ValueKind::Int => InputValue::Int(0),
            ValueKind::Float => InputValue::Float(0.0),
            ValueKind::Bool => InputValue::Bool(false),
            ValueKind::Str => InputValue::Str(String::new()),
            ValueKind::Dict => InputValue::Dict(BTreeMap::new()),
            ValueKind::Code => InputValue::Code(Uuid::nil()),
            ValueKind::LocalFile => InputValue::LocalFile(PathBuf::new()),
            ValueKind::RemoteFolder => InputValue::RemoteFolder {
                computer: String::new(),
                path: PathBuf::new(),
            },
        }
    }
}

impl InputValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            InputValue::Int(_) => ValueKind::Int,
            InputValue::Float(_) => ValueKind::Float,
            InputValue::Bool(_) => ValueKind::Bool,
            InputValue::Str(_) => ValueKind::Str,
            InputValue::Dict(_) => ValueKind::Dict,
            InputValue::Code(_) => ValueKind::Code,
            InputValue::LocalFile(_) => ValueKind::LocalFile,
            InputValue::RemoteFolder { .. } => ValueKind::RemoteFolder,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            InputValue::Int(i) => Some(*i as f64),
            InputValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_code(&self) -> Option<Uuid> {
        match self {
            InputValue::Code(uuid) => Some(*uuid),
            _ => None,
        }
    }

    /// Parse a CLI `key=value` value: integer, float, boolean, else string
    pub fn parse_loose(raw: &str) -> Self {
        if let Ok(i) = raw.parse::<i64>() {
            return InputValue::Int(i);
        }
        if let Ok(f) = raw.parse::<f64>() {
            return InputValue::Float(f);
        }
        match raw {
            "true" => InputValue::Bool(true),
            "false" => InputValue::Bool(false),
            _ => InputValue::Str(raw.to_string()),
        }
    }
}

impl fmt::Display for InputValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputValue::Int(i) => write!(f, "{}", i),
            InputValue::Float(x) => write!(f, "{}", x),
            InputValue::Bool(b) => write!(f, "{}", b),
            InputValue::Str(s) => f.write_str(s),
            InputValue::Dict(d) => match serde_json::to_string(d) {
                Ok(json) => f.write_str(&json),
                Err(_) => Err(fmt::Error),
            },
            InputValue::Code(uuid) => write!(f, "{}", uuid),
            InputValue::LocalFile(path) => write!(f, "{}", path.display()),
            InputValue::RemoteFolder { computer, path } => {
                write!(f, "{}:{}", computer, path.display())
            }
        }
    }
}

/// Declaration of one input
#[derive(Debug, Clone)]
pub struct InputPort {
    key: String,
    link_name: String,
    kinds: Vec<ValueKind>,
    default: Option<InputValue>,
    help: String,
}

impl InputPort {
    pub fn new(key: impl Into<String>, kinds: &[ValueKind]) -> Self {
        let key = key.into();
        Self {
            link_name: key.clone(),
            key,
            kinds: kinds.to_vec(),
            default: None,
            help: String::new(),
        }
    }

    /// Store the value under a different name than the caller-facing key
    pub fn link_name(mut self, name: impl Into<String>) -> Self {
        self.link_name = name.into();
        self
    }

    /// Value used when an optional input is absent
    pub fn default_value(mut self, value: InputValue) -> Self {
        self.default = Some(value);
        self
    }

    pub fn help(mut self, text: impl Into<String>) -> Self {
        self.help = text.into();
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn link(&self) -> &str {
        &self.link_name
    }

    pub fn kinds(&self) -> &[ValueKind] {
        &self.kinds
    }

    pub fn help_text(&self) -> &str {
        &self.help
    }

    fn accepts(&self, value: &InputValue) -> bool {
        self.kinds.contains(&value.kind())
    }

    /// Explicit default, else the default of the first accepted kind
    fn fallback(&self) -> InputValue {
        match (&self.default, self.kinds.first()) {
            (Some(value), _) => value.clone(),
            (None, Some(kind)) => kind.default_value(),
            (None, None) => InputValue::Str(String::new()),
        }
    }

    fn check(&self, value: &InputValue) -> Result<(), InputValidationError> {
        if self.accepts(value) {
            return Ok(());
        }
        Err(InputValidationError::InvalidType {
            key: self.key.clone(),
            found: value.kind(),
            expected: self
                .kinds
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", "),
        })
    }
}

/// Required and optional inputs of a plugin
#[derive(Debug, Clone, Default)]
pub struct InputSpec {
    pub required: Vec<InputPort>,
    pub optional: Vec<InputPort>,
}

impl InputSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self, port: InputPort) -> Self {
        self.required.push(port);
        self
    }

    pub fn optional(mut self, port: InputPort) -> Self {
        self.optional.push(port);
        self
    }

    pub fn validate(&self, raw: BTreeMap<String, InputValue>) -> Result<ValidatedInputs, InputValidationError> {
        validate_inputs(&self.required, &self.optional, raw)
    }
}

/// Input validation errors
#[derive(Debug, thiserror::Error)]
pub enum InputValidationError {
    #[error("Required input '{0}' was not specified")]
    Missing(String),

    #[error("Unrecognized inputs: {}", .0.join(", "))]
    Unrecognized(Vec<String>),

    #[error("Input '{key}' is a {found}, expected one of: {expected}")]
    InvalidType {
        key: String,
        found: ValueKind,
        expected: String,
    },

    #[error("Input '{key}' is invalid: {reason}")]
    InvalidValue { key: String, reason: String },
}

/// Validated inputs keyed by link name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidatedInputs(BTreeMap<String, InputValue>);

impl ValidatedInputs {
    pub fn get(&self, link: &str) -> Option<&InputValue> {
        self.0.get(link)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &InputValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Numeric input, for plugins that declared int|float
    pub fn number(&self, link: &str) -> Result<&InputValue, InputValidationError> {
        match self.0.get(link) {
            Some(value) if value.as_f64().is_some() => Ok(value),
            Some(value) => Err(InputValidationError::InvalidType {
                key: link.to_string(),
                found: value.kind(),
                expected: "int, float".to_string(),
            }),
            None => Err(InputValidationError::Missing(link.to_string())),
        }
    }

    pub fn code(&self, link: &str) -> Result<Uuid, InputValidationError> {
        self.0
            .get(link)
            .and_then(InputValue::as_code)
            .ok_or_else(|| InputValidationError::Missing(link.to_string()))
    }
}

/// Check raw inputs against required and optional declarations.
///
/// Required keys are checked in declaration order and the first missing one is
/// reported. Absent optional keys receive their default. Unknown keys are
/// reported together. The result is keyed by each port's link name.
pub fn validate_inputs(
    required: &[InputPort],
    optional: &[InputPort],
    mut raw: BTreeMap<String, InputValue>,
) -> Result<ValidatedInputs, InputValidationError> {
    let mut validated = BTreeMap::new();

    for port in required {
        let value = raw
            .remove(port.key())
            .ok_or_else(|| InputValidationError::Missing(port.key().to_string()))?;
        port.check(&value)?;
        validated.insert(port.link().to_string(), value);
    }

    for port in optional {
        let value = match raw.remove(port.key()) {
            Some(value) => {
                port.check(&value)?;
                value
            }
            None => port.fallback(),
        };
        validated.insert(port.link().to_string(), value);
    }

    if !raw.is_empty() {
        return Err(InputValidationError::Unrecognized(raw.into_keys().collect()));
    }

    Ok(ValidatedInputs(validated))
}

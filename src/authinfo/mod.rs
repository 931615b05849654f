//! Per-(user, computer) credentials
//!
//! An AuthInfo holds the transport parameters one user needs to reach one
//! computer. Parameters are validated against the transport's
//! [`CredentialSchema`] when configured, never when a session is opened.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Type of a credential parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    String,
    Integer,
    Bool,
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamKind::String => write!(f, "a string"),
            ParamKind::Integer => write!(f, "an integer"),
            ParamKind::Bool => write!(f, "a boolean"),
        }
    }
}

/// A credential parameter value
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Integer(i64),
    String(String),
}

impl ParamValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Parse a `key=value` style string the way the CLI receives it
    pub fn parse_loose(raw: &str) -> Self {
        if let Ok(i) = raw.parse::<i64>() {
            return ParamValue::Integer(i);
        }
        match raw {
            "true" | "yes" => ParamValue::Bool(true),
            "false" | "no" => ParamValue::Bool(false),
            _ => ParamValue::String(raw.to_string()),
        }
    }

    /// Convert to `kind`, accepting the string spellings of numbers and booleans
    fn coerce(self, kind: ParamKind) -> Option<ParamValue> {
        match (kind, self) {
            (ParamKind::String, ParamValue::String(s)) => Some(ParamValue::String(s)),
            (ParamKind::String, ParamValue::Integer(i)) => Some(ParamValue::String(i.to_string())),
            (ParamKind::Integer, ParamValue::Integer(i)) => Some(ParamValue::Integer(i)),
            (ParamKind::Integer, ParamValue::String(s)) => s.trim().parse().ok().map(ParamValue::Integer),
            (ParamKind::Bool, ParamValue::Bool(b)) => Some(ParamValue::Bool(b)),
            (ParamKind::Bool, ParamValue::String(s)) => match s.to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Some(ParamValue::Bool(true)),
                "false" | "no" | "0" => Some(ParamValue::Bool(false)),
                _ => None,
            },
            _ => None,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            ParamValue::Bool(_) => "boolean",
            ParamValue::Integer(_) => "integer",
            ParamValue::String(_) => "string",
        }
    }
}

impl fmt::Debug for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.type_name())
    }
}

/// One accepted credential parameter
#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub help: &'static str,
}

impl ParamSpec {
    pub const fn new(name: &'static str, kind: ParamKind, help: &'static str) -> Self {
        Self { name, kind, help }
    }
}

/// Parameters a transport accepts
#[derive(Debug, Clone)]
pub struct CredentialSchema {
    transport: &'static str,
    params: &'static [ParamSpec],
}

impl CredentialSchema {
    pub const fn new(transport: &'static str, params: &'static [ParamSpec]) -> Self {
        Self { transport, params }
    }

    pub fn params(&self) -> &[ParamSpec] {
        self.params
    }

    pub fn get(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }

    /// Check every key is known and coerce every value to its declared kind
    pub fn validate(
        &self,
        params: BTreeMap<String, ParamValue>,
    ) -> Result<BTreeMap<String, ParamValue>, InvalidParameterError> {
        params
            .into_iter()
            .map(|(key, value)| {
                let spec = self
                    .get(&key)
                    .ok_or_else(|| InvalidParameterError::Unrecognized {
                        key: key.clone(),
                        transport: self.transport.to_string(),
                    })?;
                let found = value.type_name();
                match value.coerce(spec.kind) {
                    Some(v) => Ok((key, v)),
                    None => Err(InvalidParameterError::Malformed {
                        key,
                        expected: spec.kind,
                        found,
                    }),
                }
            })
            .collect()
    }
}

/// Errors when configuring credentials
#[derive(Debug, thiserror::Error)]
pub enum InvalidParameterError {
    #[error("Parameter '{key}' is not accepted by the {transport} transport")]
    Unrecognized { key: String, transport: String },

    // Values never appear in the message
    #[error("Parameter '{key}' must be {expected}, got a {found}")]
    Malformed {
        key: String,
        expected: ParamKind,
        found: &'static str,
    },
}

/// Credentials of one user on one computer
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthInfo {
    pub user: String,
    pub computer: String,
    #[serde(default)]
    pub params: BTreeMap<String, ParamValue>,
}

impl AuthInfo {
    pub fn new(
        user: impl Into<String>,
        computer: impl Into<String>,
        params: BTreeMap<String, ParamValue>,
    ) -> Self {
        Self {
            user: user.into(),
            computer: computer.into(),
            params,
        }
    }

    pub fn param(&self, key: &str) -> Option<&ParamValue> {
        self.params.get(key)
    }

    /// Remote login name, when the transport has one
    pub fn username(&self) -> Option<&str> {
        self.param("username").and_then(|v| v.as_str())
    }
}

impl fmt::Debug for AuthInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthInfo")
            .field("user", &self.user)
            .field("computer", &self.computer)
            .field("params", &self.params.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// All configured AuthInfos, keyed by (user, computer)
#[derive(Debug, Clone, Default)]
pub struct AuthInfoStore {
    entries: BTreeMap<(String, String), AuthInfo>,
}

impl AuthInfoStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace the AuthInfo for (user, computer).
    ///
    /// Nothing is stored when validation fails.
    pub fn configure(
        &mut self,
        computer: &str,
        user: &str,
        schema: &CredentialSchema,
        params: BTreeMap<String, ParamValue>,
    ) -> Result<&AuthInfo, InvalidParameterError> {
        let params = schema.validate(params)?;
        let key = (user.to_string(), computer.to_string());
        tracing::debug!(user, computer, keys = ?params.keys().collect::<Vec<_>>(), "authinfo configured");
        self.entries.insert(key.clone(), AuthInfo::new(user, computer, params));
        Ok(&self.entries[&key])
    }

    pub fn is_configured(&self, computer: &str, user: &str) -> bool {
        self.get(computer, user).is_some()
    }

    pub fn get(&self, computer: &str, user: &str) -> Option<&AuthInfo> {
        self.entries.get(&(user.to_string(), computer.to_string()))
    }

    /// Drop every AuthInfo for a computer
    pub fn remove_computer(&mut self, computer: &str) {
        self.entries.retain(|(_, c), _| c != computer);
    }

    pub fn iter(&self) -> impl Iterator<Item = &AuthInfo> {
        self.entries.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEMA_PARAMS: &[ParamSpec] = &[
        ParamSpec::new("username", ParamKind::String, ""),
        ParamSpec::new("port", ParamKind::Integer, ""),
        ParamSpec::new("strict", ParamKind::Bool, ""),
    ];

    fn schema() -> CredentialSchema {
        CredentialSchema::new("ssh", SCHEMA_PARAMS)
    }

    fn params(pairs: &[(&str, ParamValue)]) -> BTreeMap<String, ParamValue> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_configure_then_is_configured() {
        let mut store = AuthInfoStore::new();
        assert!(!store.is_configured("cluster", "alice"));

        store
            .configure(
                "cluster",
                "alice",
                &schema(),
                params(&[("username", ParamValue::String("alice".into()))]),
            )
            .unwrap();

        assert!(store.is_configured("cluster", "alice"));
        assert!(!store.is_configured("cluster", "bob"));
        assert_eq!(store.get("cluster", "alice").unwrap().username(), Some("alice"));
    }

    #[test]
    fn test_unrecognized_parameter_rejected_and_nothing_stored() {
        let mut store = AuthInfoStore::new();
        let err = store
            .configure(
                "cluster",
                "alice",
                &schema(),
                params(&[("password", ParamValue::String("hunter2".into()))]),
            )
            .unwrap_err();

        assert!(matches!(err, InvalidParameterError::Unrecognized { ref key, .. } if key == "password"));
        assert!(!err.to_string().contains("hunter2"));
        assert!(!store.is_configured("cluster", "alice"));
    }

    #[test]
    fn test_string_values_coerced_to_declared_kind() {
        let validated = schema()
            .validate(params(&[
                ("port", ParamValue::String("2222".into())),
                ("strict", ParamValue::String("no".into())),
            ]))
            .unwrap();
        assert_eq!(validated["port"], ParamValue::Integer(2222));
        assert_eq!(validated["strict"], ParamValue::Bool(false));
    }

    #[test]
    fn test_malformed_value_rejected() {
        let err = schema()
            .validate(params(&[("port", ParamValue::String("twenty".into()))]))
            .unwrap_err();
        assert!(matches!(
            err,
            InvalidParameterError::Malformed { expected: ParamKind::Integer, .. }
        ));
    }

    #[test]
    fn test_reconfigure_replaces_parameters() {
        let mut store = AuthInfoStore::new();
        store
            .configure("c", "u", &schema(), params(&[("port", ParamValue::Integer(22))]))
            .unwrap();
        store
            .configure("c", "u", &schema(), params(&[("port", ParamValue::Integer(2200))]))
            .unwrap();
        let auth = store.get("c", "u").unwrap();
        assert_eq!(auth.param("port"), Some(&ParamValue::Integer(2200)));
        assert_eq!(store.iter().count(), 1);
    }

    #[test]
    fn test_debug_hides_values() {
        let auth = AuthInfo::new("u", "c", params(&[("username", ParamValue::String("secret-login".into()))]));
        let rendered = format!("{:?}", auth);
        assert!(rendered.contains("username"));
        assert!(!rendered.contains("secret-login"));
    }

    #[test]
    fn test_parse_loose() {
        assert_eq!(ParamValue::parse_loose("22"), ParamValue::Integer(22));
        assert_eq!(ParamValue::parse_loose("yes"), ParamValue::Bool(true));
        assert_eq!(ParamValue::parse_loose("alice"), ParamValue::String("alice".into()));
    }
}

//! Credentials for the reporting sink and redaction of secret values.
//!
//! A [`Credential`] never prints its value through `Debug`. A [`Redactor`]
//! collects secret values (the credential, service passwords, connection
//! strings) and scrubs them from text before it reaches the audit trail.

use std::env;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Source from which to retrieve a secret value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecretSource {
    /// Read from an environment variable.
    EnvVar(String),
    /// Read from a file.
    File(String),
    /// Provided directly (for testing only).
    Direct(String),
}

/// An opaque secret handed to the reporting sink.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    name: String,
    value: String,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("name", &self.name)
            .field("value", &"[REDACTED]")
            .finish()
    }
}

impl Credential {
    /// Creates a credential from a known value.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Resolves a credential from its source.
    ///
    /// File contents are trimmed. An empty value is rejected.
    pub fn load(name: impl Into<String>, source: &SecretSource) -> Result<Self> {
        let name = name.into();
        let value = match source {
            SecretSource::EnvVar(var) => env::var(var).map_err(|_| {
                Error::Config(format!("environment variable '{}' not set", var))
            })?,
            SecretSource::File(path) => std::fs::read_to_string(path)
                .map_err(|e| Error::Config(format!("cannot read file '{}': {}", path, e)))?
                .trim()
                .to_string(),
            SecretSource::Direct(value) => value.clone(),
        };

        if value.is_empty() {
            return Err(Error::Config(format!("credential '{}' is empty", name)));
        }
        Ok(Self { name, value })
    }

    /// Returns the credential name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the secret value.
    pub fn expose(&self) -> &str {
        &self.value
    }
}

/// Replaces known secret values with `[REDACTED:<name>]`.
#[derive(Clone, Default)]
pub struct Redactor {
    /// (name, value), longest value first.
    patterns: Vec<(String, String)>,
}

impl std::fmt::Debug for Redactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.patterns.iter().map(|(name, _)| name))
            .finish()
    }
}

impl Redactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a secret value. Empty values are ignored.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let value = value.into();
        if value.is_empty() || self.patterns.iter().any(|(_, v)| *v == value) {
            return;
        }
        self.patterns.push((name.into(), value));
        // Longer values first so a secret containing another is fully replaced.
        self.patterns.sort_by(|a, b| b.1.len().cmp(&a.1.len()));
    }

    /// Registers a credential.
    pub fn with_credential(mut self, credential: &Credential) -> Self {
        self.add(credential.name(), credential.expose());
        self
    }

    /// Returns true if no secrets are registered.
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Redacts all known secret values from a string.
    pub fn redact(&self, text: &str) -> String {
        let mut result = text.to_string();
        for (name, value) in &self.patterns {
            result = result.replace(value, &format!("[REDACTED:{}]", name));
        }
        result
    }

    /// Redacts every string inside a JSON value.
    pub fn redact_json(&self, value: &serde_json::Value) -> serde_json::Value {
        use serde_json::Value;
        if self.is_empty() {
            return value.clone();
        }
        match value {
            Value::String(s) => Value::String(self.redact(s)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.redact_json(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.redact_json(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn credential_debug_hides_value() {
        let credential = Credential::new("GITHUB_TOKEN", "ghp_secret");
        let debug = format!("{:?}", credential);
        assert!(debug.contains("GITHUB_TOKEN"));
        assert!(!debug.contains("ghp_secret"));
    }

    #[test]
    fn credential_loads_from_direct_source() {
        let credential =
            Credential::load("token", &SecretSource::Direct("abc".to_string())).unwrap();
        assert_eq!(credential.expose(), "abc");
    }

    #[test]
    fn credential_loads_from_file_trimmed() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "  file-token  ").unwrap();

        let credential = Credential::load(
            "token",
            &SecretSource::File(file.path().to_string_lossy().to_string()),
        )
        .unwrap();

        assert_eq!(credential.expose(), "file-token");
    }

    #[test]
    fn credential_from_missing_env_var_fails() {
        let result = Credential::load(
            "token",
            &SecretSource::EnvVar("SANDBOX_HEAL_SURELY_UNSET_VAR".to_string()),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn empty_credential_is_rejected() {
        let result = Credential::load("token", &SecretSource::Direct(String::new()));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn redact_replaces_longest_first() {
        let mut redactor = Redactor::new();
        redactor.add("PASSWORD", "secret");
        redactor.add("DATABASE_URL", "postgresql://postgres:secret@db:5432/app_test");

        let text = "url=postgresql://postgres:secret@db:5432/app_test pw=secret";
        assert_eq!(
            redactor.redact(text),
            "url=[REDACTED:DATABASE_URL] pw=[REDACTED:PASSWORD]"
        );
    }

    #[test]
    fn redact_json_walks_nested_values() {
        let redactor = Redactor::new().with_credential(&Credential::new("TOKEN", "tok"));
        let value = serde_json::json!({"cmd": "echo tok", "args": ["tok", 1]});

        assert_eq!(
            redactor.redact_json(&value),
            serde_json::json!({"cmd": "echo [REDACTED:TOKEN]", "args": ["[REDACTED:TOKEN]", 1]})
        );
    }

    #[test]
    fn empty_values_are_ignored() {
        let mut redactor = Redactor::new();
        redactor.add("EMPTY", "");
        assert!(redactor.is_empty());
        assert_eq!(redactor.redact("text"), "text");
    }
}

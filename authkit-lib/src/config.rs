//! Configuration for AuthKit clients.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{AuthKitError, Result};

/// Metadata an app presents to wallets.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppMetadata {
    pub name: String,
    pub description: String,
    pub url: String,
    #[serde(default)]
    pub icons: Vec<String>,
}

impl AppMetadata {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Client configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuthKitConfig {
    /// Relay protocol advertised in pairing URIs.
    #[serde(default = "default_relay_protocol")]
    pub relay_protocol: String,

    /// Validity window of signed assertions, in seconds.
    #[serde(default = "default_assertion_ttl")]
    pub assertion_ttl_secs: i64,

    /// Lifetime of a freshly created pairing.
    #[serde(default = "default_pairing_ttl")]
    pub pairing_ttl_secs: i64,

    /// Lifetime of a pairing once the peer has connected.
    #[serde(default = "default_active_pairing_ttl")]
    pub active_pairing_ttl_secs: i64,

    /// Relay TTL of published requests and lifetime of pending entries.
    #[serde(default = "default_request_ttl")]
    pub request_ttl_secs: i64,

    /// Keyserver advertised in watch assertions (`ksu`).
    #[serde(default = "default_keyserver_url")]
    pub keyserver_url: String,

    /// Capacity of each broadcast event stream.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    #[serde(default)]
    pub metadata: AppMetadata,
}

fn default_relay_protocol() -> String {
    "irn".to_string()
}

fn default_assertion_ttl() -> i64 {
    crate::auth_payload::DEFAULT_ASSERTION_TTL_SECS
}

fn default_pairing_ttl() -> i64 {
    5 * 60
}

fn default_active_pairing_ttl() -> i64 {
    30 * 24 * 60 * 60
}

fn default_request_ttl() -> i64 {
    24 * 60 * 60
}

fn default_keyserver_url() -> String {
    "https://keys.walletconnect.com".to_string()
}

fn default_event_buffer() -> usize {
    64
}

impl Default for AuthKitConfig {
    fn default() -> Self {
        Self {
            relay_protocol: default_relay_protocol(),
            assertion_ttl_secs: default_assertion_ttl(),
            pairing_ttl_secs: default_pairing_ttl(),
            active_pairing_ttl_secs: default_active_pairing_ttl(),
            request_ttl_secs: default_request_ttl(),
            keyserver_url: default_keyserver_url(),
            event_buffer: default_event_buffer(),
            metadata: AppMetadata::default(),
        }
    }
}

impl AuthKitConfig {
    pub fn new(metadata: AppMetadata) -> Self {
        Self {
            metadata,
            ..Default::default()
        }
    }

    /// Set the assertion validity window.
    pub fn with_assertion_ttl(mut self, secs: i64) -> Self {
        self.assertion_ttl_secs = secs;
        self
    }

    /// Set the pending request lifetime.
    pub fn with_request_ttl(mut self, secs: i64) -> Self {
        self.request_ttl_secs = secs;
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            AuthKitError::Storage(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    fn validate(&self) -> Result<()> {
        if self.assertion_ttl_secs <= 0 {
            return Err(AuthKitError::malformed("assertion_ttl_secs", "must be positive"));
        }
        if self.pairing_ttl_secs <= 0 || self.active_pairing_ttl_secs <= 0 {
            return Err(AuthKitError::malformed("pairing ttl", "must be positive"));
        }
        if self.event_buffer == 0 {
            return Err(AuthKitError::malformed("event_buffer", "must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config = AuthKitConfig::from_json_str(r#"{"metadata":{"name":"App","description":"","url":"https://app.example.com"}}"#)
            .unwrap();
        assert_eq!(config.relay_protocol, "irn");
        assert_eq!(config.assertion_ttl_secs, 3600);
        assert_eq!(config.pairing_ttl_secs, 300);
        assert_eq!(config.request_ttl_secs, 86400);
        assert_eq!(config.event_buffer, 64);
        assert_eq!(config.metadata.name, "App");
        assert!(config.metadata.icons.is_empty());
    }

    #[test]
    fn test_rejects_zero_ttl() {
        let err = AuthKitConfig::from_json_str(r#"{"assertion_ttl_secs":0}"#).unwrap_err();
        assert_eq!(err.code(), crate::AuthKitErrorCode::MalformedInput);
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authkit.json");
        std::fs::write(&path, r#"{"keyserver_url":"https://keys.example.com"}"#).unwrap();

        let config = AuthKitConfig::from_json_file(&path).unwrap();
        assert_eq!(config.keyserver_url, "https://keys.example.com");
        assert!(AuthKitConfig::from_json_file(dir.path().join("missing.json")).is_err());
    }
}

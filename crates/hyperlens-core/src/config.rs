//! Configuration management for Hyperlens.
//!
//! Configuration is loaded from (in priority order):
//! 1. Environment variables (HYPERLENS__ prefix, `__` as section separator)
//! 2. Config file (hyperlens.toml, or the prefix given on the command line)
//! 3. Defaults

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::HyperlensError;
use crate::types::DEFAULT_PAGE_SIZE;

/// Settings for the query cache and mutation dispatcher.
///
/// Loaded from the `[sync]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Endpoint used for public-space queries and publishes.
    #[serde(default = "default_public_endpoint")]
    pub public_endpoint: String,

    /// Endpoint of the private-space sync server.
    #[serde(default = "default_private_endpoint")]
    pub private_endpoint: String,

    /// Page size for queries built without an explicit limit.
    #[serde(default = "default_page_size")]
    pub default_page_size: u32,

    /// Successful entries at least this old are refetched on `get`. Unset: never.
    #[serde(default)]
    pub stale_after_secs: Option<u64>,

    /// Buffer size of the broadcast event stream.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl SyncConfig {
    /// Maximum age of a successful entry. Values too large for a
    /// `TimeDelta` mean never stale.
    pub fn stale_after(&self) -> Option<chrono::TimeDelta> {
        self.stale_after_secs
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(chrono::TimeDelta::try_seconds)
    }
}

fn default_public_endpoint() -> String {
    "http://localhost:4000/graphql".to_string()
}

fn default_private_endpoint() -> String {
    "ws://localhost:3030/sync".to_string()
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

fn default_event_capacity() -> usize {
    256
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            public_endpoint: default_public_endpoint(),
            private_endpoint: default_private_endpoint(),
            default_page_size: default_page_size(),
            stale_after_secs: None,
            event_capacity: default_event_capacity(),
        }
    }
}

/// Load one section of the layered configuration.
///
/// A missing file or section yields `T::default()`; a section that exists
/// but does not deserialize is an error.
pub fn load_section<T>(file_prefix: &str, section: &str) -> Result<T, HyperlensError>
where
    T: DeserializeOwned + Default,
{
    let cfg = config::Config::builder()
        .add_source(config::File::with_name(file_prefix).required(false))
        .add_source(
            config::Environment::with_prefix("HYPERLENS")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .map_err(|e| HyperlensError::Config(e.to_string()))?;

    match cfg.get::<T>(section) {
        Ok(value) => Ok(value),
        Err(config::ConfigError::NotFound(_)) => {
            tracing::debug!(section, "Config section absent, using defaults");
            Ok(T::default())
        }
        Err(e) => Err(HyperlensError::Config(format!("[{section}]: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert_eq!(config.default_page_size, 100);
        assert_eq!(config.stale_after_secs, None);
        assert!(config.stale_after().is_none());
        assert_eq!(config.event_capacity, 256);
    }

    #[test]
    fn test_huge_stale_after_never_expires() {
        for secs in [u64::MAX, i64::MAX as u64 + 1, i64::MAX as u64] {
            let config = SyncConfig {
                stale_after_secs: Some(secs),
                ..SyncConfig::default()
            };
            assert!(config.stale_after().is_none(), "{secs} should not wrap");
        }
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config: SyncConfig = load_section("does-not-exist/hyperlens", "sync").unwrap();
        assert_eq!(config.default_page_size, 100);
    }

    #[test]
    fn test_file_section_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hyperlens.toml");
        std::fs::write(
            &path,
            "[sync]\npublic_endpoint = \"https://graph.example\"\nstale_after_secs = 30\n",
        )
        .unwrap();

        let config: SyncConfig = load_section(path.to_str().unwrap(), "sync").unwrap();
        assert_eq!(config.public_endpoint, "https://graph.example");
        assert_eq!(config.stale_after().unwrap().num_seconds(), 30);
        assert_eq!(config.private_endpoint, default_private_endpoint());
    }

    #[test]
    fn test_malformed_section_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hyperlens.toml");
        std::fs::write(&path, "[sync]\ndefault_page_size = \"many\"\n").unwrap();

        let result: Result<SyncConfig, _> = load_section(path.to_str().unwrap(), "sync");
        assert!(matches!(result, Err(HyperlensError::Config(_))));
    }
}

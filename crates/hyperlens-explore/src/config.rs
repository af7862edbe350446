//! Configuration for the hyperlens-explore CLI.

use serde::Deserialize;

/// Explorer configuration.
///
/// Loaded from the `hyperlens.toml` `[explore]` section or
/// `HYPERLENS__EXPLORE__` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct ExploreConfig {
    /// JSON snapshot the explorer reads and writes (default: "./hyperlens-snapshot.json").
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: String,

    /// Private space of the signed-in user. Unset: signed out.
    #[serde(default)]
    pub private_space_id: Option<String>,

    /// Session token. Unset: signed out.
    #[serde(default)]
    pub auth_token: Option<String>,
}

fn default_snapshot_path() -> String {
    "./hyperlens-snapshot.json".to_string()
}

impl Default for ExploreConfig {
    fn default() -> Self {
        Self {
            snapshot_path: default_snapshot_path(),
            private_space_id: None,
            auth_token: None,
        }
    }
}

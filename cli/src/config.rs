// Configuration management for the MeetLink CLI
//
// Cross-platform config stored in:
// - macOS/Linux: ~/.config/meetlink/config.json
// - Windows: %APPDATA%\meetlink\config.json

use anyhow::{Context, Result};
use meetlink_core::ClientConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    /// Stable local user id, generated on first run.
    pub user_id: String,
    /// Display name shown to other participants.
    pub display_name: Option<String>,
    /// Relay endpoints, ICE servers and reconnect tuning.
    pub core: ClientConfig,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            user_id: uuid::Uuid::new_v4().to_string(),
            display_name: None,
            core: ClientConfig::default(),
        }
    }
}

impl CliConfig {
    pub fn path() -> Result<PathBuf> {
        let base = dirs::config_dir().context("no config directory on this platform")?;
        Ok(base.join("meetlink").join("config.json"))
    }

    /// Load the config, creating (and persisting) a default one on first run
    /// so the generated user id stays stable across sessions.
    pub fn load_or_create() -> Result<Self> {
        let path = Self::path()?;
        Self::load_or_create_at(&path)
    }

    pub fn load_or_create_at(path: &Path) -> Result<Self> {
        if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
        } else {
            let config = Self::default();
            config.save_at(path)?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_at(&Self::path()?)
    }

    pub fn save_at(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let raw = serde_json::to_string_pretty(self).context("serializing config")?;
        std::fs::write(path, raw).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_first_run_creates_config_with_stable_user_id() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meetlink").join("config.json");

        let first = CliConfig::load_or_create_at(&path).unwrap();
        let second = CliConfig::load_or_create_at(&path).unwrap();
        assert_eq!(first.user_id, second.user_id);
        assert!(path.exists());
    }

    #[test]
    fn test_round_trip_preserves_overrides() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = CliConfig::default();
        config.display_name = Some("Ada".to_string());
        config.core.ws_base_url = "ws://relay.example.net:9000".to_string();
        config.save_at(&path).unwrap();

        let reloaded = CliConfig::load_or_create_at(&path).unwrap();
        assert_eq!(reloaded.display_name.as_deref(), Some("Ada"));
        assert_eq!(reloaded.core.ws_base_url, "ws://relay.example.net:9000");
    }
}

//! Configuration management for ride-cli.

use anyhow::{Context, Result};
use ride_client::EngineConfig;
use ride_core::Role;
use ride_types::ParticipantId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the config file inside the data directory.
pub const CONFIG_FILE: &str = "ridesync.toml";

/// Name of the active-ride record inside the data directory.
pub const SESSION_FILE: &str = "active_ride.json";

/// Participant configuration stored locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CliConfig {
    /// Who this client signs in as.
    pub participant_id: ParticipantId,
    /// Requester or provider.
    pub role: Role,
    /// Engine tunables. Missing fields take their defaults.
    #[serde(default)]
    pub engine: EngineConfig,
}

impl CliConfig {
    /// Create a configuration with default engine settings.
    pub fn new(participant_id: ParticipantId, role: Role) -> Self {
        Self {
            participant_id,
            role,
            engine: EngineConfig::default(),
        }
    }

    /// Path of the config file under `data_dir`.
    pub fn path(data_dir: &Path) -> PathBuf {
        data_dir.join(CONFIG_FILE)
    }

    /// Load configuration from a directory.
    pub async fn load(data_dir: &Path) -> Result<Self> {
        let path = Self::path(data_dir);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .context("Not configured. Run 'ride-cli init' first.")?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;
        config.engine.validate()?;
        Ok(config)
    }

    /// Save configuration to a directory.
    pub async fn save(&self, data_dir: &Path) -> Result<()> {
        let path = Self::path(data_dir);
        let contents = toml::to_string_pretty(self)?;
        tokio::fs::write(&path, contents)
            .await
            .context("Failed to save configuration")?;
        set_file_permissions_0600(&path).await?;
        Ok(())
    }

    /// Check if a configuration exists.
    pub async fn exists(data_dir: &Path) -> bool {
        tokio::fs::try_exists(Self::path(data_dir))
            .await
            .unwrap_or(false)
    }
}

/// Path of the active-ride record under `data_dir`.
pub fn session_path(data_dir: &Path) -> PathBuf {
    data_dir.join(SESSION_FILE)
}

/// Set file permissions to 0600 (owner read/write only) on Unix.
/// No-op on non-Unix platforms.
async fn set_file_permissions_0600(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .await
            .context("Failed to set file permissions")?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

/// Set directory permissions to 0700 (owner only) on Unix.
/// No-op on non-Unix platforms.
pub async fn set_dir_permissions_0700(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
            .await
            .context("Failed to set directory permissions")?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

//! Configuration Storage
//!
//! Reads and writes the saved profile and settings.
//! Config location: ~/.tunnelproxy on macOS/Linux, %APPDATA%\TunnelProxy on Windows

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::profile::ConnectionProfile;
use super::settings::SessionSettings;

/// Current config file version
pub const CONFIG_VERSION: u32 = 1;

/// Configuration storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config version {found} is newer than supported {supported}")]
    VersionTooNew { found: u32, supported: u32 },

    #[error("No profile saved in {0}")]
    NoProfile(PathBuf),
}

/// On-disk layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<ConnectionProfile>,

    #[serde(default)]
    pub settings: SessionSettings,
}

fn default_version() -> u32 {
    CONFIG_VERSION
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            profile: None,
            settings: SessionSettings::default(),
        }
    }
}

/// Get the configuration directory
/// Returns %APPDATA%\TunnelProxy on Windows, ~/.tunnelproxy on macOS/Linux
pub fn config_dir() -> Result<PathBuf, StorageError> {
    #[cfg(windows)]
    {
        if let Some(app_data) = dirs::config_dir() {
            return Ok(app_data.join("TunnelProxy"));
        }
        dirs::home_dir()
            .map(|home| home.join(".tunnelproxy"))
            .ok_or(StorageError::NoConfigDir)
    }

    #[cfg(not(windows))]
    {
        dirs::home_dir()
            .map(|home| home.join(".tunnelproxy"))
            .ok_or(StorageError::NoConfigDir)
    }
}

/// Get the profile file path
pub fn profile_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("profile.json"))
}

/// Configuration storage manager
pub struct ConfigStorage {
    path: PathBuf,
}

impl ConfigStorage {
    /// Create a new storage manager with default path
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self {
            path: profile_file()?,
        })
    }

    /// Create storage manager with custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    async fn ensure_dir(&self) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Load configuration from disk
    /// Returns default config if file doesn't exist
    pub async fn load(&self) -> Result<ConfigFile, StorageError> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => {
                let config = serde_json::from_str::<ConfigFile>(&contents)?;
                if config.version > CONFIG_VERSION {
                    return Err(StorageError::VersionTooNew {
                        found: config.version,
                        supported: CONFIG_VERSION,
                    });
                }
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    /// Load the saved profile, failing if none is stored
    pub async fn load_profile(&self) -> Result<(ConnectionProfile, SessionSettings), StorageError> {
        let config = self.load().await?;
        let profile = config
            .profile
            .ok_or_else(|| StorageError::NoProfile(self.path.clone()))?;
        Ok((profile, config.settings))
    }

    /// Save configuration to disk
    pub async fn save(&self, config: &ConfigFile) -> Result<(), StorageError> {
        self.ensure_dir().await?;

        // Write to temp file first, then rename (atomic write)
        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(config)?;

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, &self.path).await?;

        Ok(())
    }

    /// Get config file path
    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_load_nonexistent() {
        let temp = tempdir().unwrap();
        let storage = ConfigStorage::with_path(temp.path().join("profile.json"));

        let config = storage.load().await.unwrap();
        assert_eq!(config.version, CONFIG_VERSION);
        assert!(config.profile.is_none());
        assert!(matches!(
            storage.load_profile().await,
            Err(StorageError::NoProfile(_))
        ));
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp = tempdir().unwrap();
        let storage = ConfigStorage::with_path(temp.path().join("nested").join("profile.json"));

        let mut config = ConfigFile::default();
        config.profile = Some(
            ConnectionProfile::new("i-0123456789abcdef0", "ec2-user", "/home/me/.ssh/id_ed25519")
                .with_region("eu-west-1")
                .with_bind_port(1080),
        );
        config.settings.auto_reconnect = false;

        storage.save(&config).await.unwrap();

        let (profile, settings) = storage.load_profile().await.unwrap();
        assert_eq!(profile.host, "i-0123456789abcdef0");
        assert_eq!(profile.region.as_deref(), Some("eu-west-1"));
        assert_eq!(profile.bind_port, 1080);
        assert!(!settings.auto_reconnect);
    }

    #[tokio::test]
    async fn test_version_too_new() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("profile.json");
        tokio::fs::write(&path, r#"{"version": 99}"#).await.unwrap();

        let storage = ConfigStorage::with_path(path);
        assert!(matches!(
            storage.load().await,
            Err(StorageError::VersionTooNew { found: 99, .. })
        ));
    }
}

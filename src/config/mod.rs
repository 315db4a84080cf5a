//! Configuration Module
//!
//! Connection profiles, session tunables and their persistent storage.

pub mod profile;
pub mod settings;
pub mod storage;

pub use profile::{is_instance_id, ConfigError, ConnectionProfile, Target, DEFAULT_PROXY_PORT};
pub use settings::SessionSettings;
pub use storage::{config_dir, profile_file, ConfigFile, ConfigStorage, StorageError, CONFIG_VERSION};

//! Configuration management for hepunion

use crate::branch::MountDescriptor;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default attribute and entry TTL in seconds
pub const DEFAULT_ATTR_TTL_SECS: u64 = 1;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Mount configuration
    pub mount: MountConfig,

    /// Branch configuration
    pub branches: BranchConfig,
}

/// Mount configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Mount point path
    pub mount_point: PathBuf,

    /// Allow other users to access the mount
    pub allow_other: bool,

    /// Unmount when the process exits
    pub auto_unmount: bool,

    /// Filesystem name shown in the mount table
    pub fs_name: String,

    /// Let the kernel check permissions against the reported modes
    pub default_permissions: bool,
}

/// Branch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BranchConfig {
    /// Mount argument, `path[=RW|RO]:path[=RW|RO]`
    pub spec: Option<String>,

    /// Revalidate cached entries against the host filesystem
    pub revalidate: bool,

    /// Attribute and entry TTL in seconds
    pub attr_ttl_secs: u64,
}

impl Default for MountConfig {
    fn default() -> Self {
        MountConfig {
            mount_point: PathBuf::from("/mnt/hepunion"),
            allow_other: false,
            auto_unmount: true,
            fs_name: crate::fs::HEPUNION_NAME.to_string(),
            default_permissions: true,
        }
    }
}

impl Default for BranchConfig {
    fn default() -> Self {
        BranchConfig {
            spec: None,
            revalidate: true,
            attr_ttl_secs: DEFAULT_ATTR_TTL_SECS,
        }
    }
}

impl Config {
    /// Load configuration from a file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!("Failed to read config file: {}", e))
        })?;

        let mut config: Config = serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse config file: {}", e))
        })?;

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise start from defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            return Self::load(path);
        }
        let mut config = Config::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(spec) = std::env::var("HEPUNION_BRANCHES") {
            let spec = spec.trim().to_string();
            if !spec.is_empty() {
                self.branches.spec = Some(spec);
            }
        }

        if let Ok(mount_point) = std::env::var("HEPUNION_MOUNT_POINT") {
            let mount_point = mount_point.trim();
            if !mount_point.is_empty() {
                self.mount.mount_point = PathBuf::from(mount_point);
            }
        }

        if let Ok(ttl) = std::env::var("HEPUNION_ATTR_TTL") {
            if let Ok(secs) = ttl.trim().parse::<u64>() {
                self.branches.attr_ttl_secs = secs;
            }
        }
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self).map_err(|e| {
            Error::Config(format!("Failed to serialize config: {}", e))
        })?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path.as_ref(), content).map_err(|e| {
            Error::Config(format!("Failed to write config file: {}", e))
        })?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if let Some(spec) = &self.branches.spec {
            MountDescriptor::parse(spec).map_err(|e| {
                Error::InvalidConfig(format!("Invalid branches '{}': {}", spec, e))
            })?;
        }

        if !self.mount.mount_point.is_absolute() {
            return Err(Error::InvalidConfig(
                "Mount point must be an absolute path".to_string(),
            ));
        }

        if self.mount.fs_name.is_empty() {
            return Err(Error::InvalidConfig(
                "Filesystem name must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Default configuration file location
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("hepunion")
            .join("config.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert!(config.branches.revalidate);
        assert_eq!(config.branches.attr_ttl_secs, DEFAULT_ATTR_TTL_SECS);
        assert_eq!(config.mount.fs_name, "hepunion");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = Config::default();
        config.branches.spec = Some("/lower=RO:/upper=RW".to_string());
        config.mount.mount_point = PathBuf::from("/mnt/union");
        config.mount.allow_other = true;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.branches.spec.as_deref(), Some("/lower=RO:/upper=RW"));
        assert_eq!(loaded.mount.mount_point, PathBuf::from("/mnt/union"));
        assert!(loaded.mount.allow_other);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "mount": { "allow_other": true } }"#).unwrap();

        let config = Config::load(&path).unwrap();
        assert!(config.mount.allow_other);
        assert!(config.mount.auto_unmount);
        assert!(config.branches.revalidate);
    }

    #[test]
    fn test_invalid_branches_rejected() {
        let mut config = Config::default();
        config.branches.spec = Some("/a=RO:/b=RO".to_string());
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        config.branches.spec = Some("relative:/b".to_string());
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_relative_mount_point_rejected() {
        let mut config = Config::default();
        config.mount.mount_point = PathBuf::from("mnt");
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_unreadable_file() {
        let dir = tempdir().unwrap();
        let err = Config::load(dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}

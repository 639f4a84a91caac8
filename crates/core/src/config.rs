//! Session configuration
//!
//! Loaded from `config.toml` in the platform config directory. Every key
//! is optional and falls back to the protocol defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Well-known port the group owner listens on
pub const DEFAULT_OWNER_PORT: u16 = 9999;

/// Service kind advertised by owners and matched by members
pub const DEFAULT_SERVICE_KIND: &str = "tether";

/// Session tunables shared by the owner and member roles
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Owner listener port (0 lets the OS choose)
    pub owner_port: u16,
    /// Member listener port (0 lets the OS choose)
    pub member_port: u16,
    /// Outbound connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Upper bound on reading one inbound message once a peer has connected
    pub read_timeout_ms: u64,
    /// Upper bound on waiting for the farewell message when leaving, and
    /// for background tasks to stop during teardown
    pub leave_grace_ms: u64,
    /// Service kind matched during discovery
    pub service_kind: String,
    /// Largest inbound message accepted, in bytes
    pub max_message_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            owner_port: DEFAULT_OWNER_PORT,
            member_port: 0,
            connect_timeout_ms: 2000,
            read_timeout_ms: 5000,
            leave_grace_ms: 2000,
            service_kind: DEFAULT_SERVICE_KIND.to_string(),
            max_message_bytes: 16 * 1024 * 1024,
        }
    }
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn leave_grace(&self) -> Duration {
        Duration::from_millis(self.leave_grace_ms)
    }

    /// Parse a TOML document
    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&text)?;
        tracing::debug!(path = %path.display(), "Loaded session config");
        Ok(config)
    }

    /// Load configuration, using defaults when the file does not exist
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Default config file location
    pub fn default_path() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("dev", "onyx", "tether").ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "Could not determine config directory",
            ))
        })?;
        Ok(dirs.config_dir().join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.owner_port, 9999);
        assert_eq!(config.member_port, 0);
        assert_eq!(config.connect_timeout(), Duration::from_secs(2));
        assert_eq!(config.read_timeout(), Duration::from_secs(5));
        assert_eq!(config.service_kind, "tether");
    }

    #[test]
    fn test_partial_toml() {
        let config = SessionConfig::from_toml("owner_port = 7000\nservice_kind = \"study\"\n")
            .unwrap();
        assert_eq!(config.owner_port, 7000);
        assert_eq!(config.service_kind, "study");
        assert_eq!(config.connect_timeout_ms, 2000);
    }

    #[test]
    fn test_invalid_toml() {
        let result = SessionConfig::from_toml("owner_port = \"not a port\"");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_load_from_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "connect_timeout_ms = 500\n").unwrap();

        let config = SessionConfig::load(&path).unwrap();
        assert_eq!(config.connect_timeout(), Duration::from_millis(500));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let temp = TempDir::new().unwrap();
        let config = SessionConfig::load_or_default(&temp.path().join("absent.toml")).unwrap();
        assert_eq!(config, SessionConfig::default());
    }
}

//! Configuration file parser for the bridge
//!
//! Supports sandbridge.yml with the host socket location, descriptor scan
//! ceiling, environment write policy and reply buffer sizes.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use sandbridge_shared::protocol::MAX_MESSAGE_SIZE;

use crate::env::EnvWrite;
use crate::fdctl::DEFAULT_FD_CEILING;

/// File names `resolve` looks for, in order
const CONFIG_NAMES: [&str; 2] = ["sandbridge.yml", ".sandbridge.yml"];

/// Environment variable overriding the socket path
pub const SOCKET_ENV: &str = "SANDBRIDGE_SOCKET";

/// Root configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Host socket for the framed transport
    #[serde(default = "default_socket")]
    pub socket: PathBuf,

    /// Exclusive upper bound when searching for a free descriptor
    #[serde(default = "default_fd_ceiling")]
    pub fd_ceiling: u32,

    /// Ordering of mirror and host writes in set_env
    #[serde(default)]
    pub env_write: EnvWrite,

    /// First buffer size tried by getcwd
    #[serde(default = "default_getcwd_initial_len")]
    pub getcwd_initial_len: usize,

    /// getcwd gives up with ENAMETOOLONG past this size
    #[serde(default = "default_getcwd_max_len")]
    pub getcwd_max_len: usize,

    /// Reply capacity for terminal attribute reads
    #[serde(default = "default_hterm_value_len")]
    pub hterm_value_len: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            socket: default_socket(),
            fd_ceiling: default_fd_ceiling(),
            env_write: EnvWrite::default(),
            getcwd_initial_len: default_getcwd_initial_len(),
            getcwd_max_len: default_getcwd_max_len(),
            hterm_value_len: default_hterm_value_len(),
        }
    }
}

fn default_socket() -> PathBuf {
    PathBuf::from("/run/sandbridge.sock")
}

fn default_fd_ceiling() -> u32 {
    DEFAULT_FD_CEILING
}

fn default_getcwd_initial_len() -> usize {
    256
}

fn default_getcwd_max_len() -> usize {
    65536
}

fn default_hterm_value_len() -> usize {
    256
}

impl BridgeConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: BridgeConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, else from the first `sandbridge.yml` or
    /// `.sandbridge.yml` in the working directory or home, else defaults.
    /// `SANDBRIDGE_SOCKET` overrides the socket either way.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let found = path.map(Path::to_path_buf).or_else(|| {
            std::iter::once(PathBuf::new())
                .chain(dirs::home_dir())
                .flat_map(|dir| CONFIG_NAMES.iter().map(move |name| dir.join(name)))
                .find(|candidate| candidate.is_file())
        });
        let mut config = match found {
            Some(p) => Self::load(&p)?,
            None => Self::default(),
        };
        if let Some(socket) = std::env::var_os(SOCKET_ENV) {
            config.socket = PathBuf::from(socket);
        }
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.socket.as_os_str().is_empty() {
            anyhow::bail!("Socket path cannot be empty");
        }
        if self.fd_ceiling == 0 {
            anyhow::bail!("fd_ceiling must be positive");
        }
        if self.getcwd_initial_len == 0 || self.getcwd_initial_len > self.getcwd_max_len {
            anyhow::bail!(
                "getcwd_initial_len ({}) must be between 1 and getcwd_max_len ({})",
                self.getcwd_initial_len,
                self.getcwd_max_len
            );
        }
        if self.getcwd_max_len > MAX_MESSAGE_SIZE {
            anyhow::bail!(
                "getcwd_max_len ({}) exceeds the {} byte message limit",
                self.getcwd_max_len,
                MAX_MESSAGE_SIZE
            );
        }
        if self.hterm_value_len == 0 || self.hterm_value_len > MAX_MESSAGE_SIZE {
            anyhow::bail!(
                "hterm_value_len ({}) must be between 1 and {}",
                self.hterm_value_len,
                MAX_MESSAGE_SIZE
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let yaml = r#"
socket: /tmp/host.sock
fd_ceiling: 64
env_write: host_first
getcwd_initial_len: 32
"#;
        let config: BridgeConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.socket, PathBuf::from("/tmp/host.sock"));
        assert_eq!(config.fd_ceiling, 64);
        assert_eq!(config.env_write, EnvWrite::HostFirst);
        assert_eq!(config.getcwd_initial_len, 32);
        assert_eq!(config.getcwd_max_len, 65536);
        assert_eq!(config.hterm_value_len, 256);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_config_is_default() {
        let config: BridgeConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, BridgeConfig::default());
        assert_eq!(config.env_write, EnvWrite::LocalFirst);
    }

    #[test]
    fn test_validate_rejects() {
        let mut config = BridgeConfig::default();
        config.fd_ceiling = 0;
        assert!(config.validate().is_err());

        let mut config = BridgeConfig::default();
        config.getcwd_initial_len = 1 << 20;
        assert!(config.validate().is_err());

        let mut config = BridgeConfig::default();
        config.socket = PathBuf::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_caps_reply_sizes() {
        let mut config = BridgeConfig::default();
        config.getcwd_max_len = MAX_MESSAGE_SIZE;
        assert!(config.validate().is_ok());
        config.getcwd_max_len = usize::MAX;
        assert!(config.validate().is_err());

        let mut config = BridgeConfig::default();
        config.hterm_value_len = MAX_MESSAGE_SIZE + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resolve_explicit_path() {
        let path = std::env::temp_dir().join(format!("sandbridge-{}.yml", std::process::id()));
        std::fs::write(&path, "fd_ceiling: 32\n").unwrap();
        let config = BridgeConfig::resolve(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.fd_ceiling, 32);
    }
}

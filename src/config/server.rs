use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::crypto::SecretBox;
use crate::error::{Error, Result};

const ENCRYPTION_KEY_FILE: &str = ".encryption_key";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    /// Base64 AES-256 key for server access tokens. Falls back to
    /// `<data_dir>/.encryption_key` when unset.
    pub encryption_key: Option<String>,
    pub agent: AgentConfig,
    pub queue: QueueConfig,
    pub operation_log: OperationLogConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// `https` in production; tests point Berth at plain-http fake agents.
    pub scheme: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub channel_capacity: usize,
    pub dependency_poll_secs: u64,
    pub dependency_timeout_secs: u64,
    pub reaper_interval_secs: u64,
    pub stale_after_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OperationLogConfig {
    pub log_to_file: bool,
    pub file_path: Option<PathBuf>,
    pub max_file_bytes: u64,
    pub max_backups: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub access_token_ttl_secs: i64,
    pub refresh_token_ttl_secs: i64,
}

impl ServerConfig {
    /// Loads a TOML config file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))
    }

    pub fn socket_addr(&self) -> std::result::Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }

    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("berth.db")
    }

    #[must_use]
    pub fn encryption_key_path(&self) -> PathBuf {
        self.data_dir.join(ENCRYPTION_KEY_FILE)
    }

    #[must_use]
    pub fn operation_log_path(&self) -> PathBuf {
        self.operation_log
            .file_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("operations.log"))
    }

    /// Resolves the secret box from config or the key file written by `admin init`.
    pub fn secret_box(&self) -> Result<SecretBox> {
        if let Some(key) = &self.encryption_key {
            return SecretBox::from_base64(key);
        }
        let path = self.encryption_key_path();
        let key = fs::read_to_string(&path).map_err(|e| {
            Error::Config(format!(
                "no encryption_key configured and {} is unreadable: {e}",
                path.display()
            ))
        })?;
        SecretBox::from_base64(&key)
    }
}

impl QueueConfig {
    #[must_use]
    pub const fn dependency_poll(&self) -> Duration {
        Duration::from_secs(self.dependency_poll_secs)
    }

    #[must_use]
    pub const fn dependency_timeout(&self) -> Duration {
        Duration::from_secs(self.dependency_timeout_secs)
    }

    #[must_use]
    pub const fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    #[must_use]
    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_after_secs as i64)
    }
}

impl AgentConfig {
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            data_dir: PathBuf::from("./data"),
            encryption_key: None,
            agent: AgentConfig::default(),
            queue: QueueConfig::default(),
            operation_log: OperationLogConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            scheme: "https".to_string(),
            request_timeout_secs: 30,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 100,
            dependency_poll_secs: 5,
            dependency_timeout_secs: 30 * 60,
            reaper_interval_secs: 60,
            stale_after_secs: 5 * 60,
        }
    }
}

impl Default for OperationLogConfig {
    fn default() -> Self {
        Self {
            log_to_file: false,
            file_path: None,
            max_file_bytes: 10 * 1024 * 1024,
            max_backups: 5,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            access_token_ttl_secs: 900,
            refresh_token_ttl_secs: 7 * 24 * 60 * 60,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: ServerConfig = toml::from_str(
            r#"
            port = 9000

            [queue]
            stale_after_secs = 120

            [agent]
            scheme = "http"
            "#,
        )
        .unwrap();

        assert_eq!(config.port, 9000);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.queue.stale_after_secs, 120);
        assert_eq!(config.queue.channel_capacity, 100);
        assert_eq!(config.agent.scheme, "http");
        assert_eq!(config.agent.request_timeout_secs, 30);
        assert_eq!(config.auth.access_token_ttl_secs, 900);
    }

    #[test]
    fn test_paths_derive_from_data_dir() {
        let config = ServerConfig {
            data_dir: PathBuf::from("/var/lib/berth"),
            ..Default::default()
        };
        assert_eq!(config.db_path(), PathBuf::from("/var/lib/berth/berth.db"));
        assert_eq!(
            config.operation_log_path(),
            PathBuf::from("/var/lib/berth/operations.log")
        );
    }

    #[test]
    fn test_secret_box_from_key_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let config = ServerConfig {
            data_dir: temp.path().to_path_buf(),
            ..Default::default()
        };
        assert!(config.secret_box().is_err());

        fs::write(config.encryption_key_path(), SecretBox::generate_key()).unwrap();
        let sealed = config.secret_box().unwrap().encrypt("t").unwrap();
        assert_eq!(config.secret_box().unwrap().decrypt(&sealed).unwrap(), "t");
    }
}

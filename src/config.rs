use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::watch::WatchStrategy;

pub const DEFAULT_CONFIG_PATH: &str = "rtfmri.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub watch: WatchConfig,

    // This field is not serialized, just used at runtime
    #[serde(skip)]
    pub config_path: Option<PathBuf>,
}

/// Model server (`rtf serve`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_addr")]
    pub addr: String,
}

/// Run client (`rtf run`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_server_addr")]
    pub server_addr: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(default = "default_connect_retry_ms")]
    pub connect_retry_ms: u64,
}

/// Where a session reads its schedule and scanner files, and writes output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<PathBuf>,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Scanner output directory. Trials are replayed from the schedule when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_dir: Option<PathBuf>,
    #[serde(default = "default_name_pattern")]
    pub dicom_name_pattern: String,
}

/// Scanner-side file relay (`rtf relay`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_peer_addr")]
    pub peer_addr: String,
    #[serde(default = "default_retry_secs")]
    pub retry_secs: u64,
    #[serde(default)]
    pub allowed_dirs: Vec<PathBuf>,
    #[serde(default = "default_allowed_types")]
    pub allowed_types: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Forces a watcher strategy instead of detecting one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<WatchStrategy>,
    #[serde(default = "default_file_pattern")]
    pub file_pattern: String,
    #[serde(default)]
    pub min_file_size: u64,
    /// Per-wait bound in seconds; waits that time out are retried. 0 waits forever.
    #[serde(default = "default_wait_timeout_secs")]
    pub wait_timeout_secs: u64,
}

fn default_server_addr() -> String {
    "127.0.0.1:5200".to_string()
}

fn default_model() -> String {
    "base".to_string()
}

fn default_connect_attempts() -> u32 {
    10
}

fn default_connect_retry_ms() -> u64 {
    500
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_name_pattern() -> String {
    "001_0000{}_000{}.dcm".to_string()
}

fn default_peer_addr() -> String {
    "127.0.0.1:5210".to_string()
}

fn default_retry_secs() -> u64 {
    10
}

fn default_allowed_types() -> Vec<String> {
    vec![".dcm".to_string(), ".mat".to_string()]
}

fn default_file_pattern() -> String {
    "*.dcm".to_string()
}

fn default_wait_timeout_secs() -> u64 {
    5
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_server_addr(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            model: default_model(),
            connect_attempts: default_connect_attempts(),
            connect_retry_ms: default_connect_retry_ms(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            schedule: None,
            output_dir: default_output_dir(),
            image_dir: None,
            dicom_name_pattern: default_name_pattern(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            peer_addr: default_peer_addr(),
            retry_secs: default_retry_secs(),
            allowed_dirs: Vec::new(),
            allowed_types: default_allowed_types(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            strategy: None,
            file_pattern: default_file_pattern(),
            min_file_size: 0,
            wait_timeout_secs: default_wait_timeout_secs(),
        }
    }
}

impl ClientConfig {
    pub fn connect_retry(&self) -> Duration {
        Duration::from_millis(self.connect_retry_ms)
    }
}

impl RelayConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_secs)
    }
}

impl WatchConfig {
    pub fn strategy(&self) -> WatchStrategy {
        self.strategy.unwrap_or_else(WatchStrategy::detect)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &str) -> anyhow::Result<Self> {
        let mut config = if std::path::Path::new(path).exists() {
            Self::from_file(path)?
        } else {
            Self::default()
        };
        config.config_path = Some(PathBuf::from(path));
        Ok(config)
    }

    pub fn save(&self, path: &str) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.relay.retry_secs == 0 {
            anyhow::bail!("relay.retry_secs must be at least 1");
        }
        for dir in &self.relay.allowed_dirs {
            if !dir.is_absolute() {
                anyhow::bail!(
                    "relay.allowed_dirs entry '{}' must be an absolute path",
                    dir.display()
                );
            }
        }
        if self.session.dicom_name_pattern.matches("{}").count() != 2 {
            anyhow::bail!(
                "session.dicom_name_pattern '{}' needs exactly two '{{}}' placeholders",
                self.session.dicom_name_pattern
            );
        }
        if glob::Pattern::new(&self.watch.file_pattern).is_err() {
            anyhow::bail!("watch.file_pattern '{}' is not a valid glob", self.watch.file_pattern);
        }
        if self.client.model.is_empty() {
            anyhow::bail!("client.model cannot be empty");
        }
        Ok(())
    }
}

//! CLI configuration.
//!
//! Stored as TOML:
//! - Linux: `$XDG_CONFIG_HOME/vidvault/config.toml` (or `~/.config`)
//! - Windows: `%APPDATA%/vidvault/config.toml`

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use vidvault_scheduler::SchedulerConfig;
use vidvault_transport::HttpTransportConfig;

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub http: HttpConfig,
}

/// Network settings for the HTTP transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Seconds without any bytes before a transfer times out.
    #[serde(default = "default_stall_timeout")]
    pub stall_timeout_secs: u64,

    /// Write buffer and progress granularity in KiB.
    #[serde(default = "default_progress_step")]
    pub progress_step_kib: usize,
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_stall_timeout() -> u64 {
    60
}

fn default_progress_step() -> usize {
    1024
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            stall_timeout_secs: default_stall_timeout(),
            progress_step_kib: default_progress_step(),
        }
    }
}

impl HttpConfig {
    pub fn transport_config(&self, partial_dir: PathBuf) -> HttpTransportConfig {
        HttpTransportConfig {
            partial_dir,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs.max(1)),
            stall_timeout: Duration::from_secs(self.stall_timeout_secs.max(1)),
            progress_step_bytes: self.progress_step_kib.max(1) * 1024,
        }
    }
}

impl Config {
    /// Loads configuration from `path` (or the default location), creating
    /// a default file if none exists.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => config_path()?,
        };

        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Saves the configuration to `path`.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }
}

/// Returns the platform-specific configuration file path.
fn config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        let base = std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|_| std::env::var("HOME").map(|h| PathBuf::from(h).join(".config")))
            .unwrap_or_else(|_| PathBuf::from("/tmp"));
        Ok(base.join("vidvault").join("config.toml"))
    }

    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        Ok(PathBuf::from(appdata).join("vidvault").join("config.toml"))
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        Ok(PathBuf::from(home)
            .join(".config")
            .join("vidvault")
            .join("config.toml"))
    }
}

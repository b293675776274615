//! Server configuration, loaded from TOML. Every field has a default.

use crate::application::mime;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {}", .0.join(", "))]
    Validation(Vec<String>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub bind_address: String,
    /// Paths under `/api/v<api_version>` get JSON error bodies instead of HTML pages.
    pub api_version: u32,
    /// Concurrent connection cap. Unbounded when absent.
    pub max_workers: Option<usize>,
    /// Per-read timeout while receiving a request. Waits forever when absent.
    pub idle_timeout_ms: Option<u64>,
    pub max_head_bytes: usize,
    /// Largest accepted request body, declared or drained.
    pub max_body_bytes: usize,
    pub asset_root: PathBuf,
    pub pages: PagesConfig,
    pub static_mounts: Vec<StaticMount>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            api_version: 1,
            max_workers: None,
            idle_timeout_ms: None,
            max_head_bytes: 64 * 1024,
            max_body_bytes: 8 * 1024 * 1024,
            asset_root: PathBuf::from("assets"),
            pages: PagesConfig::default(),
            static_mounts: vec![
                StaticMount::new("/images/", "img/", mime::JPEG),
                StaticMount::new("/sounds/", "sound/", mime::MPEG),
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PagesConfig {
    pub login: String,
    pub not_found: String,
    pub server_error: String,
}

impl Default for PagesConfig {
    fn default() -> Self {
        Self {
            login: "html/login.html".to_string(),
            not_found: "html/404.html".to_string(),
            server_error: "html/500.html".to_string(),
        }
    }
}

/// GET requests under `url_prefix` with no matching route are served from `asset_dir`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct StaticMount {
    pub url_prefix: String,
    pub asset_dir: String,
    /// Used when the file extension says nothing.
    pub content_type: String,
}

impl StaticMount {
    pub fn new(url_prefix: &str, asset_dir: &str, content_type: &str) -> Self {
        Self {
            url_prefix: url_prefix.to_string(),
            asset_dir: asset_dir.to_string(),
            content_type: content_type.to_string(),
        }
    }
}

impl ServerConfig {
    pub fn api_prefix(&self) -> String {
        format!("/api/v{}", self.api_version)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.bind_address.parse::<SocketAddr>().is_err() {
            errors.push(format!("bind_address `{}` is not a socket address", self.bind_address));
        }
        match self.max_workers {
            Some(0) => errors.push("max_workers must be greater than zero".to_string()),
            Some(max) if max > Semaphore::MAX_PERMITS => errors.push(format!(
                "max_workers must not exceed {}",
                Semaphore::MAX_PERMITS
            )),
            _ => {}
        }
        if self.max_head_bytes == 0 {
            errors.push("max_head_bytes must be greater than zero".to_string());
        }
        if self.max_body_bytes == 0 {
            errors.push("max_body_bytes must be greater than zero".to_string());
        }
        for mount in &self.static_mounts {
            if !mount.url_prefix.starts_with('/') || !mount.url_prefix.ends_with('/') {
                errors.push(format!(
                    "static mount `{}` must start and end with `/`",
                    mount.url_prefix
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: ServerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }
}

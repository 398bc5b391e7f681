use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ConfigError;
use crate::post::StreamOptions;
use crate::source::RetryPolicy;

const APP_DIR: &str = "postfeed";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub stream: StreamOptions,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

/// Where the remote collection lives and how to talk to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    pub base_url: String,
    pub username: Option<String>,
    /// WordPress application password, sent as HTTP basic auth.
    pub app_password: Option<String>,
    pub timeout_seconds: u64,
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    pub interval_seconds: u64,
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Page cache directory; `None` means the platform cache dir.
    pub dir: Option<PathBuf>,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_owned(),
            username: None,
            app_password: None,
            timeout_seconds: 10,
            retry_attempts: 3,
            retry_backoff_ms: 250,
            user_agent: concat!("postfeed/", env!("CARGO_PKG_VERSION")).to_owned(),
        }
    }
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 300,
            scopes: vec!["posts".to_owned()],
        }
    }
}

impl SiteConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.max(1))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_attempts,
            Duration::from_millis(self.retry_backoff_ms),
        )
    }
}

impl RefreshConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds.max(1))
    }
}

impl CacheConfig {
    pub fn resolve_dir(&self) -> PathBuf {
        match &self.dir {
            Some(dir) => dir.clone(),
            None => dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join(APP_DIR),
        }
    }
}

impl AppConfig {
    /// `~/.config/postfeed/config.json` on Linux.
    pub fn config_file_path() -> Result<PathBuf, ConfigError> {
        let config_dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(config_dir.join(APP_DIR).join("config.json"))
    }

    /// Loads the user config, falling back to (and trying to write) defaults.
    pub fn load() -> Self {
        let path = match Self::config_file_path() {
            Ok(path) => path,
            Err(e) => {
                warn!(error = %e, "no config location, using defaults");
                return Self::default();
            }
        };
        match Self::load_from(&path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, path = %path.display(), "failed to load config, using defaults");
                let config = Self::default();
                if let Err(save_err) = config.save_to(&path) {
                    warn!(error = %save_err, "failed to write default config");
                } else {
                    info!(path = %path.display(), "wrote default config");
                }
                config
            }
        }
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_fills_defaults() {
        let cfg: AppConfig = serde_json::from_str(
            r#"{
                "site": { "base_url": "https://blog.example", "retry_attempts": 5 },
                "stream": { "warm_first_count": 0, "max_batch_size": 50 }
            }"#,
        )
        .unwrap();

        assert_eq!(cfg.site.base_url, "https://blog.example");
        assert_eq!(cfg.site.retry_attempts, 5);
        assert_eq!(cfg.site.timeout_seconds, 10);
        assert_eq!(cfg.stream.warm_first_count(), 10);
        assert_eq!(cfg.stream.max_batch_size(), 50);
        assert_eq!(cfg.refresh.scopes, vec!["posts".to_owned()]);
        assert_eq!(cfg.refresh.interval(), Duration::from_secs(300));
    }

    #[test]
    fn save_and_reload_round_trip() {
        let mut dir = std::env::temp_dir();
        dir.push(format!("postfeed_config_{}", uuid::Uuid::new_v4()));
        let path = dir.join("config.json");

        let mut cfg = AppConfig::default();
        cfg.refresh.scopes = vec!["posts".into(), "pages".into()];
        cfg.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.refresh.scopes, cfg.refresh.scopes);
        assert_eq!(loaded.stream, cfg.stream);

        let _ = std::fs::remove_dir_all(&dir);
    }
}

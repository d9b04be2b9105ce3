use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::info;

use crate::error::{Error, Result};
use crate::platform::AppPaths;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub catalog: CatalogConfig,
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// URL of the external model listing (full snapshots).
    pub feed_url: String,
    pub timeout_seconds: u64,
    pub max_retries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Days to keep per-turn cost records; daily aggregates are kept forever.
    pub cost_record_days: u32,
    /// Days to keep individual anonymous error events.
    pub error_event_days: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            catalog: CatalogConfig {
                feed_url: "https://models.example.com/api/v1/models".to_string(),
                timeout_seconds: 30,
                max_retries: 3,
            },
            retention: RetentionConfig {
                cost_record_days: 365,
                error_event_days: 90,
            },
        }
    }
}

impl AppConfig {
    pub async fn load(paths: &AppPaths) -> Result<Self> {
        let config_file = paths.config_file();

        if !config_file.exists() {
            info!("Config file not found, creating default configuration");
            let default_config = Self::default();
            default_config.save(paths).await?;
            return Ok(default_config);
        }

        info!("Loading configuration from: {:?}", config_file);

        let config_content = fs::read_to_string(&config_file).await?;
        let config: AppConfig = toml::from_str(&config_content)
            .map_err(|e| Error::Config(config::ConfigError::Message(e.to_string())))?;

        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, paths: &AppPaths) -> Result<()> {
        let config_file = paths.config_file();
        if let Some(parent) = config_file.parent() {
            fs::create_dir_all(parent).await?;
        }

        let config_content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(config::ConfigError::Message(e.to_string())))?;
        fs::write(&config_file, config_content).await?;

        info!("Configuration saved to: {:?}", config_file);
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.catalog.feed_url.is_empty() {
            return Err(Error::validation("Catalog feed URL must not be empty"));
        }
        if self.catalog.timeout_seconds == 0 {
            return Err(Error::validation("Catalog feed timeout must be positive"));
        }
        if self.retention.cost_record_days == 0 || self.retention.error_event_days == 0 {
            return Err(Error::validation("Retention windows must be at least one day"));
        }
        Ok(())
    }
}

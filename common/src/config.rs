use serde::Deserialize;
use std::{error::Error, fs};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CommonConfig {
    pub project_name: String,
    pub database_url: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct BackendConfig {
    pub server_address: String,
    pub log_level: String,
    #[serde(default = "default_allowed_origin")]
    pub allowed_origin: String,
}

fn default_allowed_origin() -> String {
    "http://localhost:5173".to_string()
}

/// Settings of the outbox relay worker.
#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    pub batch_size: u32,
    pub sleep_ms: u64,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub log_level: String,
    /// Where the relay serves `GET /metrics`.
    #[serde(default = "default_relay_metrics_address")]
    pub metrics_address: String,
}

fn default_relay_metrics_address() -> String {
    "0.0.0.0:9091".to_string()
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            sleep_ms: 1000,
            max_attempts: 8,
            base_delay_ms: 500,
            max_delay_ms: 60_000,
            log_level: "info".to_string(),
            metrics_address: default_relay_metrics_address(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CompressionConfig {
    pub max_width: u32,
    pub max_height: u32,
    pub quality: u8,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            max_width: 1200,
            max_height: 1200,
            quality: 80,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub base_url: String,
    pub service_key: String,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
    #[serde(default)]
    pub compression: Option<CompressionConfig>,
}

fn default_max_upload_bytes() -> usize {
    5 * 1024 * 1024
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            service_key: String::new(),
            max_upload_bytes: default_max_upload_bytes(),
            compression: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    pub common: CommonConfig,
    pub backend: BackendConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Config {
    pub fn load(config_path: &str) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let contents = fs::read_to_string(config_path)?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let mut config: Config = serde_yml::from_str(contents)?;

        // Deployments inject the connection string instead of baking it into the file
        if let Ok(url) = std::env::var("DATABASE_URL") {
            if !url.is_empty() {
                config.common.database_url = url;
            }
        }

        Ok(config)
    }
}

//! Shelf configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::providers::ProvidersConfig;
use crate::scheduler::SchedulerConfig;
use crate::sink::SinkConfig;

/// Main Shelf configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Document store connection
    pub store: StoreConfig,

    /// Write sink tuning
    pub sink: SinkConfig,

    /// Scheduler tuning
    pub scheduler: SchedulerConfig,

    /// Provider sets (llm, ocr, tts)
    pub providers: ProvidersConfig,

    /// Pipeline defaults
    pub pipeline: PipelineConfig,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .shelf.yml
        let local_config = PathBuf::from(".shelf.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/shelf/shelf.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("shelf").join("shelf.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        // No config file found, use defaults
        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Document store connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct StoreConfig {
    /// Store API base URL
    pub base_url: String,

    /// Request timeout in milliseconds
    pub timeout_ms: u64,

    /// Launch the store as a sibling container when it is not reachable
    pub manage_container: bool,

    /// Container image when managing the store
    pub container_image: String,

    /// Host directory bind-mounted as the store's data dir
    pub data_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9181".to_string(),
            timeout_ms: 30_000,
            manage_container: false,
            container_image: "sourcenetwork/defradb:latest".to_string(),
            data_dir: PathBuf::from("./data"),
        }
    }
}

/// Pipeline defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PipelineConfig {
    /// Directory holding page scans (page_0001.png, ...)
    pub scans_dir: PathBuf,

    /// Default OCR provider name
    pub ocr_provider: String,

    /// Default LLM provider name
    pub llm_provider: String,

    /// Job-level retries per work unit
    pub max_unit_retries: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            scans_dir: PathBuf::from("./scans"),
            ocr_provider: "mistral".to_string(),
            llm_provider: "openrouter".to_string(),
            max_unit_retries: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderStyle;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.store.base_url, "http://localhost:9181");
        assert_eq!(config.sink.batch_size, 100);
        assert_eq!(config.sink.queue_size, 10_000);
        assert_eq!(config.scheduler.queue_capacity, 1024);
        assert!(config.providers.llm.is_empty());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
store:
  base-url: http://store:9181
  manage-container: true
sink:
  batch-size: 50
  flush-interval-ms: 1000
providers:
  llm:
    - name: openrouter
      style: openai
      base-url: https://openrouter.ai/api/v1
      api-key-env: OPENROUTER_API_KEY
      model: gpt-4o
      rps: 2.5
      max-concurrency: 8
  ocr:
    - name: mistral
      style: mistral-ocr
      base-url: https://api.mistral.ai/v1
      api-key-env: MISTRAL_API_KEY
      rps: 4
      price-per-page: 0.001
pipeline:
  scans-dir: /books/scans
  max-unit-retries: 3
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.store.base_url, "http://store:9181");
        assert!(config.store.manage_container);
        assert_eq!(config.sink.batch_size, 50);
        assert_eq!(config.sink.concurrency, 4); // default survives partial section

        let llm = &config.providers.llm[0];
        assert_eq!(llm.name, "openrouter");
        assert_eq!(llm.style, ProviderStyle::Openai);
        assert_eq!(llm.rps, 2.5);
        assert_eq!(llm.max_concurrency, 8);

        let ocr = &config.providers.ocr[0];
        assert_eq!(ocr.style, ProviderStyle::MistralOcr);
        assert_eq!(ocr.price_per_page, Some(0.001));
        // Unset fields take their defaults
        assert_eq!(ocr.max_retries, 3);

        assert_eq!(config.pipeline.max_unit_retries, 3);
    }
}

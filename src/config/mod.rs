//! Configuration management for obsearch
//!
//! Settings live in a TOML file (`~/.config/obsearch/config.toml` by default).
//! Any key can be overridden from the environment as
//! `OBSEARCH_SECTION__KEY=value`, e.g. `OBSEARCH_ENGINE__URL`.

use crate::error::{ObsearchError, Result};
use crate::flatten::PromotionRules;
use crate::index::{EmbedderSettings, IndexOptions};
use crate::retrieval::{RouterOptions, StructuredBackend};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

mod validator;

pub use validator::ConfigValidator;

pub const SCHEMA_VERSION: &str = "1.0.0";

const ENV_PREFIX: &str = "OBSEARCH_";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "_meta")]
    pub meta: MetaConfig,
    pub database: DatabaseConfig,
    pub engine: EngineConfig,
    pub indexing: IndexingConfig,
    pub llm: LlmConfig,
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub deadlines: DeadlineConfig,
    /// Form labels feeding each promoted field
    #[serde(default = "PromotionRules::reference")]
    pub promotion: PromotionRules,
}

/// Metadata about the configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaConfig {
    pub schema_version: String,
    #[serde(default = "current_timestamp")]
    pub created_at: String,
    #[serde(default = "current_timestamp")]
    pub last_modified: String,
}

fn current_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Relational source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

/// Search engine connection and index layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// "meilisearch" or "memory"
    pub backend: String,
    pub url: String,
    /// Environment variable holding the API key
    pub api_key_env: String,
    pub index_name: String,
    pub primary_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedder: Option<EmbedderSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingConfig {
    pub chunk_size: usize,
    pub max_concurrent_chunks: usize,
    pub chunk_retries: usize,
}

/// Text completion used for classification and answers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub enabled: bool,
    pub provider: String,
    pub url: String,
    pub model: String,
    pub temperature: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub semantic_k: usize,
    pub structured_limit: usize,
    pub structured_backend: StructuredBackend,
    pub page_size: usize,
}

/// Deadlines for external calls, in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadlineConfig {
    pub settings_task_ms: u64,
    pub documents_task_ms: u64,
    pub poll_interval_ms: u64,
    pub request_ms: u64,
    pub query_ms: u64,
    pub completion_ms: u64,
}

impl Default for DeadlineConfig {
    fn default() -> Self {
        Self {
            settings_task_ms: 180_000,
            documents_task_ms: 300_000,
            poll_interval_ms: 250,
            request_ms: 30_000,
            query_ms: 30_000,
            completion_ms: 60_000,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ObsearchError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| ObsearchError::Io {
            source: e,
            context: format!("Failed to read config file: {:?}", path),
        })?;
        let mut config: Config = toml::from_str(&content)?;

        // Environment wins over the file, then the merged result is validated
        config.apply_env_overrides();
        ConfigValidator::validate(&config)?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ObsearchError::Io {
                source: e,
                context: format!("Failed to create config directory: {:?}", parent),
            })?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| ObsearchError::Io {
            source: e,
            context: format!("Failed to write config file: {:?}", path),
        })?;
        Ok(())
    }

    /// Apply environment variable overrides
    /// Environment variables in format: OBSEARCH_SECTION__KEY=value
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(std::env::vars());
    }

    pub fn apply_overrides(&mut self, vars: impl IntoIterator<Item = (String, String)>) {
        for (key, value) in vars {
            if let Some(config_key) = key.strip_prefix(ENV_PREFIX) {
                if let Err(e) = self.set_value_from_env(config_key, &value) {
                    tracing::warn!("Failed to apply env override {}: {}", key, e);
                }
            }
        }
    }

    fn set_value_from_env(&mut self, path: &str, value: &str) -> Result<()> {
        match path {
            "DATABASE__PATH" => self.database.path = PathBuf::from(value),
            "ENGINE__BACKEND" => self.engine.backend = value.to_string(),
            "ENGINE__URL" => self.engine.url = value.to_string(),
            "ENGINE__API_KEY_ENV" => self.engine.api_key_env = value.to_string(),
            "ENGINE__INDEX_NAME" => self.engine.index_name = value.to_string(),
            "INDEXING__CHUNK_SIZE" => self.indexing.chunk_size = parse(path, value)?,
            "INDEXING__MAX_CONCURRENT_CHUNKS" => {
                self.indexing.max_concurrent_chunks = parse(path, value)?
            }
            "INDEXING__CHUNK_RETRIES" => self.indexing.chunk_retries = parse(path, value)?,
            "LLM__ENABLED" => self.llm.enabled = parse(path, value)?,
            "LLM__URL" => self.llm.url = value.to_string(),
            "LLM__MODEL" => self.llm.model = value.to_string(),
            "LLM__TEMPERATURE" => self.llm.temperature = parse(path, value)?,
            "RETRIEVAL__SEMANTIC_K" => self.retrieval.semantic_k = parse(path, value)?,
            "RETRIEVAL__STRUCTURED_LIMIT" => self.retrieval.structured_limit = parse(path, value)?,
            "RETRIEVAL__STRUCTURED_BACKEND" => {
                self.retrieval.structured_backend = match value.to_ascii_lowercase().as_str() {
                    "relational" => StructuredBackend::Relational,
                    "search" => StructuredBackend::Search,
                    _ => {
                        return Err(ObsearchError::InvalidConfigValue {
                            path: path.to_string(),
                            message: format!("Expected 'relational' or 'search', got '{}'", value),
                        })
                    }
                }
            }
            "RETRIEVAL__PAGE_SIZE" => self.retrieval.page_size = parse(path, value)?,
            "DEADLINES__COMPLETION_MS" => self.deadlines.completion_ms = parse(path, value)?,
            "DEADLINES__REQUEST_MS" => self.deadlines.request_ms = parse(path, value)?,
            "DEADLINES__QUERY_MS" => self.deadlines.query_ms = parse(path, value)?,
            _ => {
                tracing::debug!("Unknown env config key: {}", path);
            }
        }
        Ok(())
    }

    /// API key read from the configured environment variable
    pub fn engine_api_key(&self) -> Option<String> {
        std::env::var(&self.engine.api_key_env)
            .ok()
            .filter(|k| !k.is_empty())
    }

    pub fn index_options(&self) -> IndexOptions {
        IndexOptions {
            primary_key: self.engine.primary_key.clone(),
            settings_timeout: Duration::from_millis(self.deadlines.settings_task_ms),
            documents_timeout: Duration::from_millis(self.deadlines.documents_task_ms),
            poll_interval: Duration::from_millis(self.deadlines.poll_interval_ms),
            request_timeout: Duration::from_millis(self.deadlines.request_ms),
            chunk_size: self.indexing.chunk_size,
            chunk_retries: self.indexing.chunk_retries,
            max_concurrent_chunks: self.indexing.max_concurrent_chunks,
            page_size: self.retrieval.page_size,
            embedder: self.engine.embedder.clone(),
        }
    }

    pub fn router_options(&self) -> RouterOptions {
        RouterOptions {
            index_name: self.engine.index_name.clone(),
            semantic_k: self.retrieval.semantic_k,
            structured_limit: self.retrieval.structured_limit,
            structured_backend: self.retrieval.structured_backend,
            completion_timeout: Duration::from_millis(self.deadlines.completion_ms),
            query_timeout: Duration::from_millis(self.deadlines.query_ms),
        }
    }

    /// Get the default configuration file path
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().ok_or_else(|| {
            ObsearchError::Config("Cannot determine config directory".to_string())
        })?;

        Ok(config_dir.join("obsearch").join("config.toml"))
    }
}

fn parse<T: std::str::FromStr>(path: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| ObsearchError::InvalidConfigValue {
        path: path.to_string(),
        message: format!("Cannot parse '{}'", value),
    })
}

impl Default for Config {
    fn default() -> Self {
        Self {
            meta: MetaConfig {
                schema_version: SCHEMA_VERSION.to_string(),
                created_at: current_timestamp(),
                last_modified: current_timestamp(),
            },
            database: DatabaseConfig {
                path: PathBuf::from("~/.obsearch/occurrences.db"),
            },
            engine: EngineConfig {
                backend: "meilisearch".to_string(),
                url: "http://localhost:7700".to_string(),
                api_key_env: "MEILI_API_KEY".to_string(),
                index_name: "incidents".to_string(),
                primary_key: "id".to_string(),
                embedder: Some(EmbedderSettings {
                    name: "incidents-ollama".to_string(),
                    url: "http://localhost:11434/api/embeddings".to_string(),
                    model: "mxbai-embed-large".to_string(),
                    document_template: "{{doc.searchable_text}}".to_string(),
                }),
            },
            indexing: IndexingConfig {
                chunk_size: 1000,
                max_concurrent_chunks: 1,
                chunk_retries: 1,
            },
            llm: LlmConfig {
                enabled: true,
                provider: "ollama".to_string(),
                url: "http://localhost:11434".to_string(),
                model: "llama3.1".to_string(),
                temperature: 0.0,
            },
            retrieval: RetrievalConfig {
                semantic_k: 5,
                structured_limit: 20,
                structured_backend: StructuredBackend::Relational,
                page_size: 10,
            },
            deadlines: DeadlineConfig::default(),
            promotion: PromotionRules::reference(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::PromotedField;

    #[test]
    fn test_default_roundtrips_through_toml() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();

        assert_eq!(parsed.engine.index_name, "incidents");
        assert_eq!(parsed.promotion, config.promotion);
        assert_eq!(parsed.engine.embedder, config.engine.embedder);
        assert_eq!(
            parsed.retrieval.structured_backend,
            StructuredBackend::Relational
        );
    }

    #[test]
    fn test_missing_promotion_uses_reference_table() {
        let mut value = toml::Value::try_from(Config::default()).unwrap();
        value.as_table_mut().unwrap().remove("promotion");
        value.as_table_mut().unwrap().remove("deadlines");
        let parsed: Config = toml::from_str(&toml::to_string(&value).unwrap()).unwrap();

        assert!(!parsed.promotion.aliases(PromotedField::CauseOfDeath).is_empty());
        assert_eq!(parsed.deadlines.settings_task_ms, 180_000);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_overrides(vec![
            ("OBSEARCH_ENGINE__INDEX_NAME".to_string(), "occurrences".to_string()),
            ("OBSEARCH_INDEXING__CHUNK_SIZE".to_string(), "250".to_string()),
            ("OBSEARCH_RETRIEVAL__STRUCTURED_BACKEND".to_string(), "search".to_string()),
            ("OBSEARCH_LLM__ENABLED".to_string(), "not-a-bool".to_string()),
            ("UNRELATED".to_string(), "x".to_string()),
        ]);

        assert_eq!(config.engine.index_name, "occurrences");
        assert_eq!(config.indexing.chunk_size, 250);
        assert_eq!(config.retrieval.structured_backend, StructuredBackend::Search);
        assert!(config.llm.enabled);
    }

    #[test]
    fn test_options_follow_config() {
        let mut config = Config::default();
        config.deadlines.settings_task_ms = 5;
        config.retrieval.page_size = 25;

        let index = config.index_options();
        assert_eq!(index.settings_timeout, Duration::from_millis(5));
        assert_eq!(index.page_size, 25);
        assert_eq!(index.embedder.map(|e| e.name), Some("incidents-ollama".to_string()));

        let router = config.router_options();
        assert_eq!(router.semantic_k, 5);
        assert_eq!(router.index_name, "incidents");
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = Config::load(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ObsearchError::ConfigNotFound { .. }));
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        Config::default().save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.meta.schema_version, SCHEMA_VERSION);
    }
}

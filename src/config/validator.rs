use crate::config::{Config, SCHEMA_VERSION};
use crate::error::{ObsearchError, Result, ValidationError};

/// Configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the configuration, reporting every problem at once
    pub fn validate(config: &Config) -> Result<()> {
        let mut errors = Vec::new();

        // Every section is checked, so one run reports everything
        Self::validate_schema_version(config, &mut errors);
        Self::validate_database(config, &mut errors);
        Self::validate_engine(config, &mut errors);
        Self::validate_indexing(config, &mut errors);
        Self::validate_llm(config, &mut errors);
        Self::validate_retrieval(config, &mut errors);
        Self::validate_deadlines(config, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ObsearchError::ConfigValidation { errors })
        }
    }

    fn validate_schema_version(config: &Config, errors: &mut Vec<ValidationError>) {
        let version = &config.meta.schema_version;
        if version != SCHEMA_VERSION {
            errors.push(ValidationError::new(
                "_meta.schema_version",
                format!("Unsupported schema version: {}", version),
            ));
        }
    }

    fn validate_database(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.database.path.as_os_str().is_empty() {
            errors.push(ValidationError::new(
                "database.path",
                "Database path cannot be empty",
            ));
        }
    }

    fn validate_engine(config: &Config, errors: &mut Vec<ValidationError>) {
        let engine = &config.engine;
        // Validate backend
        let backends = ["meilisearch", "memory"];
        if !backends.contains(&engine.backend.as_str()) {
            errors.push(ValidationError::new(
                "engine.backend",
                format!("Backend must be one of {:?}, got '{}'", backends, engine.backend),
            ));
        }

        // The memory backend has no server to reach
        if engine.backend == "meilisearch" && !Self::is_http_url(&engine.url) {
            errors.push(ValidationError::new(
                "engine.url",
                format!("Not an http(s) URL: '{}'", engine.url),
            ));
        }

        // Validate index uid
        if !Self::is_valid_index_name(&engine.index_name) {
            errors.push(ValidationError::new(
                "engine.index_name",
                format!(
                    "Index name must be alphanumeric, '-' or '_', got '{}'",
                    engine.index_name
                ),
            ));
        }

        if engine.primary_key.is_empty() {
            errors.push(ValidationError::new(
                "engine.primary_key",
                "Primary key cannot be empty",
            ));
        }

        // Validate embedder settings
        if let Some(embedder) = &engine.embedder {
            if embedder.name.is_empty() {
                errors.push(ValidationError::new(
                    "engine.embedder.name",
                    "Embedder name cannot be empty",
                ));
            }
            if !Self::is_http_url(&embedder.url) {
                errors.push(ValidationError::new(
                    "engine.embedder.url",
                    format!("Not an http(s) URL: '{}'", embedder.url),
                ));
            }
            if embedder.model.is_empty() {
                errors.push(ValidationError::new(
                    "engine.embedder.model",
                    "Embedder model cannot be empty",
                ));
            }
        }
    }

    fn validate_indexing(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.indexing.chunk_size == 0 {
            errors.push(ValidationError::new(
                "indexing.chunk_size",
                "Chunk size must be greater than 0",
            ));
        }

        if config.indexing.max_concurrent_chunks == 0 {
            errors.push(ValidationError::new(
                "indexing.max_concurrent_chunks",
                "Concurrent chunks must be greater than 0",
            ));
        }
    }

    fn validate_llm(config: &Config, errors: &mut Vec<ValidationError>) {
        // Validate temperature range
        let temp = config.llm.temperature;
        if !(0.0..=2.0).contains(&temp) {
            errors.push(ValidationError::new(
                "llm.temperature",
                format!("Temperature must be between 0.0 and 2.0, got {}", temp),
            ));
        }

        // Validate provider
        if config.llm.provider != "ollama" {
            errors.push(ValidationError::new(
                "llm.provider",
                format!("Provider must be 'ollama', got '{}'", config.llm.provider),
            ));
        }

        // Endpoint and model only matter when the LLM is used
        if config.llm.enabled {
            if !Self::is_http_url(&config.llm.url) {
                errors.push(ValidationError::new(
                    "llm.url",
                    format!("Not an http(s) URL: '{}'", config.llm.url),
                ));
            }
            if config.llm.model.is_empty() {
                errors.push(ValidationError::new("llm.model", "Model name cannot be empty"));
            }
        }
    }

    fn validate_retrieval(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.retrieval.semantic_k == 0 {
            errors.push(ValidationError::new(
                "retrieval.semantic_k",
                "semantic_k must be greater than 0",
            ));
        }

        if config.retrieval.structured_limit == 0 {
            errors.push(ValidationError::new(
                "retrieval.structured_limit",
                "structured_limit must be greater than 0",
            ));
        }

        if config.retrieval.page_size == 0 {
            errors.push(ValidationError::new(
                "retrieval.page_size",
                "Page size must be greater than 0",
            ));
        }
    }

    fn validate_deadlines(config: &Config, errors: &mut Vec<ValidationError>) {
        let d = &config.deadlines;
        let deadlines = [
            ("deadlines.settings_task_ms", d.settings_task_ms),
            ("deadlines.documents_task_ms", d.documents_task_ms),
            ("deadlines.request_ms", d.request_ms),
            ("deadlines.query_ms", d.query_ms),
            ("deadlines.completion_ms", d.completion_ms),
        ];
        for (path, value) in deadlines {
            if value == 0 {
                errors.push(ValidationError::new(path, "Deadline must be greater than 0"));
            }
        }

        // A poll interval past the deadline would never observe completion
        if d.poll_interval_ms == 0 || d.poll_interval_ms > d.settings_task_ms {
            errors.push(ValidationError::new(
                "deadlines.poll_interval_ms",
                "Poll interval must be positive and shorter than the settings deadline",
            ));
        }
    }

    fn is_http_url(s: &str) -> bool {
        s.starts_with("http://") || s.starts_with("https://")
    }

    // Meilisearch uids: alphanumeric, hyphen, underscore, at most 400 bytes
    fn is_valid_index_name(s: &str) -> bool {
        !s.is_empty()
            && s.len() <= 400
            && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }
}

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for obsearch
#[derive(Error, Debug)]
pub enum ObsearchError {
    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration validation errors
    #[error("Configuration validation failed: {errors:?}")]
    ConfigValidation { errors: Vec<ValidationError> },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    /// Invalid configuration value
    #[error("Invalid configuration value at {path}: {message}")]
    InvalidConfigValue { path: String, message: String },

    /// Module schemas could not be loaded from the relational source
    #[error("Schema load failed: {0}")]
    SchemaLoad(String),

    /// Index creation or settings update failed
    #[error("Index configuration failed for '{index}': {message}")]
    IndexConfig { index: String, message: String },

    /// An engine task did not finish before its deadline
    #[error("Engine task {task_uid} did not complete within {timeout:?}")]
    TaskTimeout { task_uid: u64, timeout: Duration },

    /// An engine task finished in a failed or canceled state
    #[error("Engine task {task_uid} failed: {message}")]
    TaskFailed { task_uid: u64, message: String },

    /// A document batch could not be submitted after its retry
    #[error("Chunk {chunk} submission failed: {message}")]
    ChunkSubmit { chunk: usize, message: String },

    /// The completion capability failed or returned unusable output
    #[error("Classification failed: {0}")]
    Classification(String),

    /// A retrieval path failed at query time
    #[error("{path} retrieval failed: {message}")]
    RetrievalBackend { path: String, message: String },

    /// An external call exceeded the caller-supplied deadline
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    /// Another bulk load is already running against the index
    #[error("A bulk load is already running for index '{index}'")]
    LoadInProgress { index: String },

    /// Search engine returned an error response
    #[error("Search engine error ({status}): {message}")]
    Engine { status: u16, message: String },

    /// Text completion capability errors
    #[error("Completion error: {0}")]
    Completion(String),

    /// IO errors
    #[error("IO error: {context}: {source}")]
    Io {
        source: std::io::Error,
        context: String,
    },

    /// TOML deserialization errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization errors
    #[error("TOML serialization error: {0}")]
    TomlSerialization(#[from] toml::ser::Error),

    /// JSON errors
    #[error("JSON error: {context}: {source}")]
    Json {
        source: serde_json::Error,
        context: String,
    },

    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// HTTP transport errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Generic errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration validation error
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// Path to the configuration key that failed validation
    pub path: String,
    /// Error message describing the validation failure
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Result type for obsearch operations
pub type Result<T> = std::result::Result<T, ObsearchError>;

//! Search engine access
//!
//! [`SearchEngine`] mirrors the task-based engine API: mutations return a
//! [`TaskHandle`] immediately and complete later, observed through
//! [`await_task`]. [`MeiliEngine`] talks HTTP; [`MemoryEngine`] runs in
//! process for tests and offline use.

pub mod manager;
pub mod meili;
pub mod memory;
pub mod task;

pub use manager::{IndexManager, IndexOptions, IndexState, LoadReport, SearchPage, VerifyProbe};
pub use meili::MeiliEngine;
pub use memory::MemoryEngine;
pub use task::await_task;

use crate::error::Result;
use crate::query::CORE_FILTER_FIELDS;
use crate::records::PromotedField;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Identifier of an enqueued engine task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskHandle {
    pub uid: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Enqueued,
    Processing,
    Succeeded,
    Failed(String),
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed(_) | Self::Canceled)
    }
}

/// Text-to-vector service the engine calls while indexing and searching
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbedderSettings {
    pub name: String,
    /// Embedding endpoint, e.g. Ollama's `/api/embeddings`
    pub url: String,
    pub model: String,
    /// Template rendering a document into the text that gets embedded
    pub document_template: String,
}

/// Index settings applied once after creation
#[derive(Debug, Clone, PartialEq)]
pub struct IndexSettings {
    pub searchable: Vec<String>,
    pub filterable: Vec<String>,
    pub one_typo_min_len: u8,
    pub two_typos_min_len: u8,
    pub ranking_rules: Vec<String>,
    pub embedder: Option<EmbedderSettings>,
}

impl IndexSettings {
    /// Settings for occurrence documents: everything searchable, core and
    /// promoted fields filterable
    pub fn for_documents(embedder: Option<EmbedderSettings>) -> Self {
        let filterable = CORE_FILTER_FIELDS
            .iter()
            .map(|f| f.to_string())
            .chain(PromotedField::ALL.iter().map(|f| f.as_str().to_string()))
            .collect();

        Self {
            searchable: vec!["*".to_string()],
            filterable,
            one_typo_min_len: 2,
            two_typos_min_len: 4,
            ranking_rules: ["words", "typo", "proximity", "attribute", "sort", "exactness"]
                .iter()
                .map(|r| r.to_string())
                .collect(),
            embedder,
        }
    }

    /// Request body of the engine's settings endpoint
    pub fn to_json(&self) -> Value {
        let mut body = json!({
            "searchableAttributes": self.searchable,
            "filterableAttributes": self.filterable,
            "typoTolerance": {
                "enabled": true,
                "minWordSizeForTypos": {
                    "oneTypo": self.one_typo_min_len,
                    "twoTypos": self.two_typos_min_len,
                }
            },
            "rankingRules": self.ranking_rules,
        });

        if let Some(embedder) = &self.embedder {
            body["embedders"] = json!({
                embedder.name.as_str(): {
                    "source": "rest",
                    "url": embedder.url,
                    "request": { "model": embedder.model, "prompt": "{{text}}" },
                    "response": { "embedding": "{{embedding}}" },
                    "documentTemplate": embedder.document_template,
                }
            });
        }

        body
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SearchMode {
    Keyword,
    /// Pure vector search through a configured embedder
    Semantic { embedder: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub query: String,
    pub filter: Option<String>,
    pub limit: usize,
    pub offset: usize,
    pub mode: SearchMode,
}

impl SearchRequest {
    pub fn keyword(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            filter: None,
            limit: 20,
            offset: 0,
            mode: SearchMode::Keyword,
        }
    }

    pub fn semantic(query: impl Into<String>, embedder: impl Into<String>) -> Self {
        Self {
            mode: SearchMode::Semantic {
                embedder: embedder.into(),
            },
            ..Self::keyword(query)
        }
    }

    pub fn with_filter(mut self, filter: Option<String>) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_page(mut self, limit: usize, offset: usize) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub document: Map<String, Value>,
    pub score: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SearchResponse {
    pub hits: Vec<SearchHit>,
    /// Matches before paging
    pub total_hits: usize,
}

/// Task-based search engine
#[async_trait]
pub trait SearchEngine: Send + Sync {
    async fn index_exists(&self, index: &str) -> Result<bool>;

    async fn create_index(&self, index: &str, primary_key: &str) -> Result<TaskHandle>;

    async fn delete_index(&self, index: &str) -> Result<TaskHandle>;

    async fn update_settings(&self, index: &str, settings: &IndexSettings) -> Result<TaskHandle>;

    /// Upsert documents by primary key
    async fn add_documents(
        &self,
        index: &str,
        documents: &[Value],
        primary_key: &str,
    ) -> Result<TaskHandle>;

    async fn task_status(&self, task: TaskHandle) -> Result<TaskStatus>;

    async fn search(&self, index: &str, request: &SearchRequest) -> Result<SearchResponse>;

    async fn document_count(&self, index: &str) -> Result<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_settings() {
        let settings = IndexSettings::for_documents(None);
        assert_eq!(settings.searchable, vec!["*"]);
        assert!(settings.filterable.contains(&"module_name".to_string()));
        assert!(settings.filterable.contains(&"submitted_at".to_string()));
        assert!(settings.filterable.contains(&"vehicle_registration".to_string()));

        let body = settings.to_json();
        assert_eq!(body["typoTolerance"]["minWordSizeForTypos"]["oneTypo"], 2);
        assert_eq!(body["typoTolerance"]["minWordSizeForTypos"]["twoTypos"], 4);
        assert_eq!(body["rankingRules"][0], "words");
        assert!(body.get("embedders").is_none());
    }

    #[test]
    fn test_embedder_settings_body() {
        let settings = IndexSettings::for_documents(Some(EmbedderSettings {
            name: "incidents-ollama".into(),
            url: "http://localhost:11434/api/embeddings".into(),
            model: "mxbai-embed-large".into(),
            document_template: "{{doc.searchable_text}}".into(),
        }));

        let body = settings.to_json();
        let embedder = &body["embedders"]["incidents-ollama"];
        assert_eq!(embedder["source"], "rest");
        assert_eq!(embedder["request"]["model"], "mxbai-embed-large");
        assert_eq!(embedder["request"]["prompt"], "{{text}}");
        assert_eq!(embedder["documentTemplate"], "{{doc.searchable_text}}");
    }
}

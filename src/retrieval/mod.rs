//! Question answering over the occurrence index
//!
//! A question is classified into a retrieval strategy, the matching paths
//! run (relational or engine filtering, semantic similarity, or both), and
//! their results are packaged into one [`AnswerContext`] for a generation
//! step.

pub mod extract;
pub mod fusion;
pub mod llm;
pub mod router;

pub use extract::PredicateExtractor;
pub use fusion::{fuse, AnswerContext, PathOutcome, PathStatus};
pub use llm::{OllamaCompletion, TextCompletion};
pub use router::{parse_classification, Answer, RetrievalRouter, RouterOptions, StructuredBackend};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// How a question should be answered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Strategy {
    /// Exact filtering on modules, dates, urgency and field presence
    Structured,
    /// Similarity over narratives and descriptions
    Semantic,
    /// Both, reconciled
    Hybrid,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Structured => "STRUCTURED",
            Self::Semantic => "SEMANTIC",
            Self::Hybrid => "HYBRID",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalDecision {
    pub strategy: Strategy,
    pub rationale: String,
}

/// Path that produced an item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathSource {
    Structured,
    Semantic,
}

/// One record returned by a retrieval path, with its citation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedItem {
    pub source: PathSource,
    pub record_id: i64,
    pub case_number: Option<String>,
    pub module_name: Option<String>,
    pub summary: String,
    pub score: Option<f32>,
}

const SUMMARY_NARRATIVE_CHARS: usize = 300;

impl RetrievedItem {
    /// Build from an engine document; `None` when it carries no usable id
    pub fn from_document(
        source: PathSource,
        document: &Map<String, Value>,
        score: Option<f32>,
    ) -> Option<Self> {
        let record_id = match document.get("id")? {
            Value::Number(n) => n.as_i64()?,
            Value::String(s) => s.parse().ok()?,
            _ => return None,
        };
        let text = |key: &str| {
            document
                .get(key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
        };

        let mut parts = Vec::new();
        if let Some(location) = text("location") {
            parts.push(format!("location: {}", location));
        }
        if let Some(urgency) = text("urgency") {
            parts.push(format!("urgency: {}", urgency));
        }
        if let Some(ts) = document.get("submitted_at").and_then(Value::as_i64) {
            if let Some(date) = chrono::DateTime::from_timestamp(ts, 0) {
                parts.push(format!("submitted: {}", date.format("%Y-%m-%d")));
            }
        }
        for field in crate::records::PromotedField::ALL {
            if let Some(value) = document.get(field.as_str()) {
                let rendered = match value {
                    Value::Null => continue,
                    Value::String(s) if s.trim().is_empty() => continue,
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                parts.push(format!("{}: {}", field, rendered));
            }
        }
        if let Some(narrative) = text("narrative") {
            let clipped: String = narrative.chars().take(SUMMARY_NARRATIVE_CHARS).collect();
            if clipped.len() < narrative.len() {
                parts.push(format!("narrative: {}...", clipped));
            } else {
                parts.push(format!("narrative: {}", clipped));
            }
        }

        Some(Self {
            source,
            record_id,
            case_number: text("case_number"),
            module_name: text("module_name"),
            summary: parts.join("; "),
            score,
        })
    }

    /// Citation label, the case number when there is one
    pub fn citation(&self) -> String {
        self.case_number
            .clone()
            .unwrap_or_else(|| format!("record {}", self.record_id))
    }
}

//! Values paired with the non-fatal problems met while producing them
//!
//! Batch operations skip and count bad items instead of aborting. Each item's
//! problems are recorded as [`Diagnostic`]s and merged into the batch result.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Category of a non-fatal problem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// A record's attribute bag or timestamp was malformed
    FlattenAnomaly,
    /// A module definition disagreed with itself (duplicate or unnamed fields)
    SchemaDrift,
    /// Module definitions or counts could not be read; retrieval went on without them
    SchemaUnavailable,
    /// A document batch failed after its retry
    ChunkSubmit,
    /// Classification fell back to hybrid
    Classification,
    /// One retrieval path failed while the other survived
    RetrievalBackend,
    /// Answer generation failed and the raw context was returned
    Synthesis,
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::FlattenAnomaly => "flatten_anomaly",
            Self::SchemaDrift => "schema_drift",
            Self::SchemaUnavailable => "schema_unavailable",
            Self::ChunkSubmit => "chunk_submit",
            Self::Classification => "classification",
            Self::RetrievalBackend => "retrieval_backend",
            Self::Synthesis => "synthesis",
        };
        f.write_str(s)
    }
}

/// A single non-fatal problem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub message: String,
    /// Record the problem belongs to, when there is one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<i64>,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            record_id: None,
        }
    }

    pub fn for_record(kind: DiagnosticKind, record_id: i64, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            record_id: Some(record_id),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.record_id {
            Some(id) => write!(f, "[{}] record {}: {}", self.kind, id, self.message),
            None => write!(f, "[{}] {}", self.kind, self.message),
        }
    }
}

/// A value plus the diagnostics collected while producing it
#[derive(Debug, Clone)]
pub struct Outcome<T> {
    pub value: T,
    pub diagnostics: Vec<Diagnostic>,
}

impl<T> Outcome<T> {
    pub fn clean(value: T) -> Self {
        Self {
            value,
            diagnostics: Vec::new(),
        }
    }

    pub fn with_diagnostics(value: T, diagnostics: Vec<Diagnostic>) -> Self {
        Self { value, diagnostics }
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
    }

    pub fn is_clean(&self) -> bool {
        self.diagnostics.is_empty()
    }

    /// Count diagnostics of one kind
    pub fn count(&self, kind: DiagnosticKind) -> usize {
        self.diagnostics.iter().filter(|d| d.kind == kind).count()
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        Outcome {
            value: f(self.value),
            diagnostics: self.diagnostics,
        }
    }

    /// Take the value, moving its diagnostics into `sink`
    pub fn absorb_into(self, sink: &mut Vec<Diagnostic>) -> T {
        sink.extend(self.diagnostics);
        self.value
    }

    pub fn into_parts(self) -> (T, Vec<Diagnostic>) {
        (self.value, self.diagnostics)
    }
}

impl<T> FromIterator<Outcome<T>> for Outcome<Vec<T>> {
    fn from_iter<I: IntoIterator<Item = Outcome<T>>>(iter: I) -> Self {
        let mut values = Vec::new();
        let mut diagnostics = Vec::new();
        for outcome in iter {
            values.push(outcome.absorb_into(&mut diagnostics));
        }
        Outcome::with_diagnostics(values, diagnostics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_merges_diagnostics() {
        let items = vec![
            Outcome::clean(1),
            Outcome::with_diagnostics(
                2,
                vec![Diagnostic::for_record(
                    DiagnosticKind::FlattenAnomaly,
                    2,
                    "bag is a list",
                )],
            ),
            Outcome::clean(3),
        ];

        let merged: Outcome<Vec<i32>> = items.into_iter().collect();
        assert_eq!(merged.value, vec![1, 2, 3]);
        assert_eq!(merged.count(DiagnosticKind::FlattenAnomaly), 1);
        assert_eq!(merged.diagnostics[0].record_id, Some(2));
    }

    #[test]
    fn test_display() {
        let d = Diagnostic::new(DiagnosticKind::ChunkSubmit, "chunk 3 failed");
        assert_eq!(d.to_string(), "[chunk_submit] chunk 3 failed");
    }
}

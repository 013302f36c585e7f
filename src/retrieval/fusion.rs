//! Packaging both retrieval paths into one answer context

use super::{PathSource, RetrievalDecision, RetrievedItem};
use crate::storage::ModuleStatistics;
use serde::Serialize;
use std::fmt::Write as _;

/// Width of the "recent" column in module statistics
pub const RECENT_WINDOW_DAYS: u64 = 30;

/// What one path produced
#[derive(Debug, Clone, PartialEq)]
pub enum PathOutcome {
    NotRequested,
    Completed(Vec<RetrievedItem>),
    Failed(String),
}

/// Per-path flag carried into the context; an empty result is not a failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum PathStatus {
    NotRequested,
    Results(usize),
    Empty,
    Failed(String),
}

impl PathStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Everything the generation step sees
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnswerContext {
    pub question: String,
    pub decision: RetrievalDecision,
    pub schema_summary: String,
    /// Per-module totals, present when the structured path was requested
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub statistics: Vec<ModuleStatistics>,
    /// Structured items first, then semantic ones
    pub items: Vec<RetrievedItem>,
    pub structured: PathStatus,
    pub semantic: PathStatus,
}

/// Combine both paths; items keep their source tag and duplicates across
/// paths are kept so each path's citation survives
pub fn fuse(
    question: &str,
    decision: RetrievalDecision,
    structured: PathOutcome,
    semantic: PathOutcome,
    schema_summary: &str,
) -> AnswerContext {
    let mut items = Vec::new();
    let structured = absorb(structured, PathSource::Structured, &mut items);
    let semantic = absorb(semantic, PathSource::Semantic, &mut items);

    AnswerContext {
        question: question.to_string(),
        decision,
        schema_summary: schema_summary.to_string(),
        statistics: Vec::new(),
        items,
        structured,
        semantic,
    }
}

fn absorb(outcome: PathOutcome, source: PathSource, items: &mut Vec<RetrievedItem>) -> PathStatus {
    match outcome {
        PathOutcome::NotRequested => PathStatus::NotRequested,
        PathOutcome::Failed(reason) => PathStatus::Failed(reason),
        PathOutcome::Completed(found) if found.is_empty() => PathStatus::Empty,
        PathOutcome::Completed(found) => {
            let count = found.len();
            items.extend(found.into_iter().map(|mut item| {
                item.source = source;
                item
            }));
            PathStatus::Results(count)
        }
    }
}

impl AnswerContext {
    pub fn with_statistics(mut self, statistics: Vec<ModuleStatistics>) -> Self {
        self.statistics = statistics;
        self
    }

    pub fn items_from(&self, source: PathSource) -> impl Iterator<Item = &RetrievedItem> {
        self.items.iter().filter(move |item| item.source == source)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Prompt text for the generation step
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Question: {}", self.question);
        let _ = writeln!(
            out,
            "Strategy: {} ({})",
            self.decision.strategy, self.decision.rationale
        );
        out.push('\n');

        if !self.schema_summary.is_empty() {
            out.push_str("Available occurrence types:\n");
            out.push_str(&self.schema_summary);
            if !self.schema_summary.ends_with('\n') {
                out.push('\n');
            }
            out.push('\n');
        }

        if !self.statistics.is_empty() {
            out.push_str("Record counts by occurrence type:\n");
            for stat in &self.statistics {
                let _ = writeln!(
                    out,
                    "- {}: {} total, {} in the last {} days, {} high urgency",
                    stat.module_name.as_deref().unwrap_or("Unknown module"),
                    stat.total,
                    stat.recent,
                    RECENT_WINDOW_DAYS,
                    stat.high_urgency
                );
            }
            out.push('\n');
        }

        self.render_section(&mut out, "Structured results", PathSource::Structured, &self.structured);
        self.render_section(&mut out, "Similar occurrences", PathSource::Semantic, &self.semantic);
        out
    }

    fn render_section(&self, out: &mut String, title: &str, source: PathSource, status: &PathStatus) {
        match status {
            PathStatus::NotRequested => return,
            PathStatus::Failed(reason) => {
                let _ = writeln!(out, "{}: unavailable ({})", title, reason);
            }
            PathStatus::Empty => {
                let _ = writeln!(out, "{}: no matching records", title);
            }
            PathStatus::Results(n) => {
                let _ = writeln!(out, "{} ({}):", title, n);
                for item in self.items_from(source) {
                    let module = item.module_name.as_deref().unwrap_or("Unknown module");
                    let _ = write!(out, "- [{}] {}", item.citation(), module);
                    if let Some(score) = item.score {
                        let _ = write!(out, " (score {:.2})", score);
                    }
                    if item.summary.is_empty() {
                        out.push('\n');
                    } else {
                        let _ = writeln!(out, ": {}", item.summary);
                    }
                }
            }
        }
        out.push('\n');
    }
}

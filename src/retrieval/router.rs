//! Classifying questions and dispatching retrieval

use super::extract::PredicateExtractor;
use super::fusion::{fuse, AnswerContext, PathOutcome, RECENT_WINDOW_DAYS};
use super::llm::TextCompletion;
use super::{PathSource, RetrievalDecision, RetrievedItem, Strategy};
use crate::deadline::with_deadline;
use crate::error::{ObsearchError, Result};
use crate::flatten::{PromotionRules, RecordFlattener};
use crate::index::{IndexManager, SearchHit};
use crate::outcome::{Diagnostic, DiagnosticKind, Outcome};
use crate::query::{Predicates, StructuredQueryBuilder};
use crate::schema::{SchemaRegistry, SchemaSnapshot};
use crate::storage::{ModuleStatistics, RecordSource};
use chrono::{Days, NaiveTime};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const FALLBACK_RATIONALE: &str = "classification failed, defaulting to hybrid";
const NO_REASONING: &str = "no reasoning provided";

/// Completion text that carried no usable METHOD line
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unparseable classification: {0}")]
pub struct Unparseable(pub String);

/// Where the structured path looks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StructuredBackend {
    /// Parameterized SQL against the relational source
    Relational,
    /// Filtered keyword search against the index
    Search,
}

#[derive(Debug, Clone)]
pub struct RouterOptions {
    pub index_name: String,
    pub semantic_k: usize,
    pub structured_limit: usize,
    pub structured_backend: StructuredBackend,
    pub completion_timeout: Duration,
    pub query_timeout: Duration,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            index_name: "incidents".to_string(),
            semantic_k: 5,
            structured_limit: 20,
            structured_backend: StructuredBackend::Relational,
            completion_timeout: Duration::from_secs(60),
            query_timeout: Duration::from_secs(30),
        }
    }
}

/// A generated answer and the context it was built from
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub text: String,
    /// False when generation failed and `text` is the rendered context
    pub synthesized: bool,
    pub context: AnswerContext,
}

/// Parse a `METHOD: ... / REASONING: ...` completion
///
/// Accepts `STRUCTURED`/`SQL`, `SEMANTIC`/`VECTOR` and `HYBRID` in any case,
/// optionally wrapped in brackets or quotes.
pub fn parse_classification(text: &str) -> std::result::Result<RetrievalDecision, Unparseable> {
    if text.trim().is_empty() {
        return Err(Unparseable("empty response".to_string()));
    }

    let mut method = None;
    let mut reasoning = None;
    for line in text.lines() {
        if method.is_none() {
            if let Some(value) = labelled(line, "METHOD") {
                method = Some(value);
                continue;
            }
        }
        if reasoning.is_none() {
            if let Some(value) = labelled(line, "REASONING") {
                reasoning = Some(value);
            }
        }
    }

    let method = method.ok_or_else(|| Unparseable("no METHOD line".to_string()))?;
    let token = method
        .split(|c: char| !c.is_ascii_alphabetic())
        .find(|t| !t.is_empty())
        .unwrap_or("")
        .to_ascii_uppercase();
    let strategy = match token.as_str() {
        "STRUCTURED" | "SQL" => Strategy::Structured,
        "SEMANTIC" | "VECTOR" => Strategy::Semantic,
        "HYBRID" => Strategy::Hybrid,
        _ => return Err(Unparseable(format!("unknown method '{}'", method))),
    };

    let rationale = reasoning
        .filter(|r| !r.is_empty())
        .unwrap_or(NO_REASONING)
        .to_string();
    Ok(RetrievalDecision {
        strategy,
        rationale,
    })
}

/// Value after `KEY:` on a line, tolerating markdown emphasis and bullets
fn labelled<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let line = line
        .trim()
        .trim_start_matches(|c: char| c == '*' || c == '#' || c == '-')
        .trim_start();
    let head = line.get(..key.len())?;
    if !head.eq_ignore_ascii_case(key) {
        return None;
    }
    let rest = line[key.len()..].trim_start_matches('*').trim_start();
    let value = rest.strip_prefix(':')?;
    Some(
        value
            .trim()
            .trim_start_matches('*')
            .trim()
            .trim_matches(|c: char| matches!(c, '[' | ']' | '"' | '\'' | '*'))
            .trim(),
    )
}

fn classification_prompt(question: &str) -> String {
    format!(
        "Analyze this question about police occurrence records and choose how to search for the answer.

Question: {question}

Available methods:
1. STRUCTURED - counts, filtering on occurrence type, dates, urgency or specific fields
2. SEMANTIC - similar incidents, narrative descriptions, fuzzy matching
3. HYBRID - questions that need both exact filtering and similar examples

Examples:
- \"How many vehicle thefts in the last month?\" -> STRUCTURED
- \"Show me cases similar to a stolen laptop at a university\" -> SEMANTIC
- \"What are the trends in cyber crime and show me examples\" -> HYBRID
- \"Find arson cases at schools\" -> HYBRID
- \"Count death cases by cause\" -> STRUCTURED
- \"Cases involving stolen electronics\" -> SEMANTIC

Respond in exactly this format:
METHOD: STRUCTURED, SEMANTIC or HYBRID
REASONING: one sentence
"
    )
}

fn answer_prompt(context: &AnswerContext) -> String {
    format!(
        "You are analyzing police occurrence records. Answer the question using only the records below.

{}
Instructions:
- Cite the OB number of every case you mention
- Use record counts for totals, structured results for exact facts, similar occurrences for examples
- Say so plainly if the records do not answer the question
- Be concise

Answer:
",
        context.render()
    )
}

/// Chooses a strategy per question and runs it
pub struct RetrievalRouter {
    completion: Arc<dyn TextCompletion>,
    source: Arc<dyn RecordSource>,
    registry: Arc<SchemaRegistry>,
    index: Arc<IndexManager>,
    builder: StructuredQueryBuilder,
    flattener: RecordFlattener,
    extractor: PredicateExtractor,
    options: RouterOptions,
}

impl RetrievalRouter {
    pub fn new(
        completion: Arc<dyn TextCompletion>,
        source: Arc<dyn RecordSource>,
        registry: Arc<SchemaRegistry>,
        index: Arc<IndexManager>,
        rules: Arc<PromotionRules>,
        options: RouterOptions,
    ) -> Result<Self> {
        Ok(Self {
            completion,
            source,
            registry,
            index,
            builder: StructuredQueryBuilder::new(rules.clone()),
            flattener: RecordFlattener::new(rules),
            extractor: PredicateExtractor::new()?,
            options,
        })
    }

    pub fn with_extractor(mut self, extractor: PredicateExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    /// Ask the completion capability for a strategy; never fails
    pub async fn classify(&self, question: &str) -> Outcome<RetrievalDecision> {
        let prompt = classification_prompt(question);
        let response = with_deadline(
            "classification",
            self.options.completion_timeout,
            self.completion.complete(&prompt),
        )
        .await;

        let reason = match response {
            Ok(text) => match parse_classification(&text) {
                Ok(decision) => {
                    tracing::info!("Classified as {}: {}", decision.strategy, decision.rationale);
                    return Outcome::clean(decision);
                }
                Err(e) => e.to_string(),
            },
            Err(e) => ObsearchError::Classification(e.to_string()).to_string(),
        };

        tracing::warn!("{}, defaulting to hybrid", reason);
        Outcome::with_diagnostics(
            RetrievalDecision {
                strategy: Strategy::Hybrid,
                rationale: FALLBACK_RATIONALE.to_string(),
            },
            vec![Diagnostic::new(DiagnosticKind::Classification, reason)],
        )
    }

    /// Classify and run the chosen paths
    ///
    /// `explicit` predicates replace the ones extracted from the question.
    pub async fn retrieve(
        &self,
        question: &str,
        explicit: Option<Predicates>,
    ) -> Result<Outcome<AnswerContext>> {
        let mut diagnostics = Vec::new();
        let decision = self.classify(question).await.absorb_into(&mut diagnostics);
        self.retrieve_with(question, decision, explicit, diagnostics)
            .await
    }

    /// Run a known strategy without classifying
    pub async fn retrieve_with(
        &self,
        question: &str,
        decision: RetrievalDecision,
        explicit: Option<Predicates>,
        mut diagnostics: Vec<Diagnostic>,
    ) -> Result<Outcome<AnswerContext>> {
        // Without a schema there is no summary and no module-name extraction
        let snapshot = match self.registry.load().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!("Schema unavailable, retrieving without it: {}", e);
                diagnostics.push(Diagnostic::new(
                    DiagnosticKind::SchemaUnavailable,
                    format!("schema unavailable: {}", e),
                ));
                Arc::new(SchemaSnapshot::default())
            }
        };
        let summary = snapshot.summary();
        let predicates = match explicit {
            Some(p) => p,
            None => self.extractor.extract(question, &snapshot),
        };

        let statistics = match decision.strategy {
            Strategy::Semantic => Vec::new(),
            _ => self.module_statistics(&predicates, &mut diagnostics).await,
        };

        let (structured, semantic) = match decision.strategy {
            Strategy::Structured => {
                let items = self
                    .structured_path(&predicates)
                    .await
                    .map_err(|e| backend_error("structured", e))?;
                (
                    PathOutcome::Completed(items.absorb_into(&mut diagnostics)),
                    PathOutcome::NotRequested,
                )
            }
            Strategy::Semantic => {
                let items = self
                    .semantic_path(question)
                    .await
                    .map_err(|e| backend_error("semantic", e))?;
                (PathOutcome::NotRequested, PathOutcome::Completed(items))
            }
            Strategy::Hybrid => {
                let (structured, semantic) = tokio::join!(
                    self.structured_path(&predicates),
                    self.semantic_path(question)
                );
                match (structured, semantic) {
                    (Err(s), Err(v)) => {
                        return Err(ObsearchError::RetrievalBackend {
                            path: "hybrid".to_string(),
                            message: format!("structured: {}; semantic: {}", s, v),
                        })
                    }
                    (structured, semantic) => {
                        let structured = match structured {
                            Ok(items) => PathOutcome::Completed(items.absorb_into(&mut diagnostics)),
                            Err(e) => {
                                tracing::warn!("Structured path failed: {}", e);
                                diagnostics.push(Diagnostic::new(
                                    DiagnosticKind::RetrievalBackend,
                                    format!("structured path failed: {}", e),
                                ));
                                PathOutcome::Failed(e.to_string())
                            }
                        };
                        let semantic = match semantic {
                            Ok(items) => PathOutcome::Completed(items),
                            Err(e) => {
                                tracing::warn!("Semantic path failed: {}", e);
                                diagnostics.push(Diagnostic::new(
                                    DiagnosticKind::RetrievalBackend,
                                    format!("semantic path failed: {}", e),
                                ));
                                PathOutcome::Failed(e.to_string())
                            }
                        };
                        (structured, semantic)
                    }
                }
            }
        };

        let context = fuse(question, decision, structured, semantic, &summary)
            .with_statistics(statistics);
        tracing::info!(
            "Retrieved {} items (structured: {:?}, semantic: {:?})",
            context.items.len(),
            context.structured,
            context.semantic
        );
        Ok(Outcome::with_diagnostics(context, diagnostics))
    }

    /// Totals behind counting questions, which the row limit would truncate
    ///
    /// Narrowed to the question's modules when it names any. A failure is
    /// recorded and the context goes without counts.
    async fn module_statistics(
        &self,
        predicates: &Predicates,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Vec<ModuleStatistics> {
        let today = self.extractor.today();
        let since = today
            .checked_sub_days(Days::new(RECENT_WINDOW_DAYS))
            .unwrap_or(today)
            .and_time(NaiveTime::MIN)
            .and_utc();

        let result = with_deadline(
            "module statistics",
            self.options.query_timeout,
            self.source.module_statistics(since),
        )
        .await;

        match result {
            Ok(mut statistics) => {
                if !predicates.modules.is_empty() {
                    statistics.retain(|stat| {
                        stat.module_name.as_deref().is_some_and(|name| {
                            predicates
                                .modules
                                .iter()
                                .any(|m| m.eq_ignore_ascii_case(name))
                        })
                    });
                }
                statistics
            }
            Err(e) => {
                tracing::warn!("Module statistics unavailable: {}", e);
                diagnostics.push(Diagnostic::new(
                    DiagnosticKind::SchemaUnavailable,
                    format!("module statistics unavailable: {}", e),
                ));
                Vec::new()
            }
        }
    }

    async fn structured_path(&self, predicates: &Predicates) -> Result<Outcome<Vec<RetrievedItem>>> {
        let limit = self.options.structured_limit;

        match self.options.structured_backend {
            StructuredBackend::Relational => {
                let query = self.builder.relational(predicates, limit);
                let rows = with_deadline(
                    "relational query",
                    self.options.query_timeout,
                    self.source.run_query(&query),
                )
                .await?;
                let (documents, diagnostics) = self.flattener.flatten_rows(&rows).into_parts();
                let items = documents
                    .iter()
                    .filter_map(|doc| {
                        let json = doc.to_json();
                        let map = json.as_object()?;
                        RetrievedItem::from_document(PathSource::Structured, map, None)
                    })
                    .collect();
                Ok(Outcome::with_diagnostics(items, diagnostics))
            }
            StructuredBackend::Search => {
                let filter = self.builder.filter(predicates);
                let hits = self
                    .index
                    .filtered(
                        &self.options.index_name,
                        predicates.query_text(),
                        filter,
                        limit,
                    )
                    .await?;
                Ok(Outcome::clean(items_from_hits(PathSource::Structured, hits)))
            }
        }
    }

    async fn semantic_path(&self, question: &str) -> Result<Vec<RetrievedItem>> {
        let hits = self
            .index
            .semantic(&self.options.index_name, question, self.options.semantic_k)
            .await?;
        Ok(items_from_hits(PathSource::Semantic, hits))
    }

    /// Retrieve, then generate an answer from the context
    ///
    /// A failed generation returns the rendered context as the answer text.
    pub async fn answer(
        &self,
        question: &str,
        explicit: Option<Predicates>,
    ) -> Result<Outcome<Answer>> {
        let (context, mut diagnostics) = self.retrieve(question, explicit).await?.into_parts();

        let prompt = answer_prompt(&context);
        let generated = with_deadline(
            "answer synthesis",
            self.options.completion_timeout,
            self.completion.complete(&prompt),
        )
        .await;

        let answer = match generated {
            Ok(text) if !text.trim().is_empty() => Answer {
                text: text.trim().to_string(),
                synthesized: true,
                context,
            },
            other => {
                let reason = match other {
                    Err(e) => e.to_string(),
                    Ok(_) => "empty completion".to_string(),
                };
                tracing::warn!("Answer synthesis failed: {}", reason);
                diagnostics.push(Diagnostic::new(
                    DiagnosticKind::Synthesis,
                    format!("answer synthesis failed: {}", reason),
                ));
                Answer {
                    text: context.render(),
                    synthesized: false,
                    context,
                }
            }
        };

        Ok(Outcome::with_diagnostics(answer, diagnostics))
    }
}

fn items_from_hits(source: PathSource, hits: Vec<SearchHit>) -> Vec<RetrievedItem> {
    hits.iter()
        .filter_map(|hit| RetrievedItem::from_document(source, &hit.document, hit.score))
        .collect()
}

fn backend_error(path: &str, error: ObsearchError) -> ObsearchError {
    match error {
        e @ ObsearchError::RetrievalBackend { .. } => e,
        other => ObsearchError::RetrievalBackend {
            path: path.to_string(),
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain() {
        let d = parse_classification("METHOD: SQL\nREASONING: counts by date").unwrap();
        assert_eq!(d.strategy, Strategy::Structured);
        assert_eq!(d.rationale, "counts by date");
    }

    #[test]
    fn test_parse_tolerates_brackets_case_and_markdown() {
        let d = parse_classification("Sure!\n**METHOD:** [vector]\n**REASONING:** similarity").unwrap();
        assert_eq!(d.strategy, Strategy::Semantic);
        assert_eq!(d.rationale, "similarity");

        let d = parse_classification("method: Hybrid").unwrap();
        assert_eq!(d.strategy, Strategy::Hybrid);
        assert_eq!(d.rationale, NO_REASONING);

        let d = parse_classification("METHOD: structured\nREASONING:").unwrap();
        assert_eq!(d.strategy, Strategy::Structured);
        assert_eq!(d.rationale, NO_REASONING);
    }

    #[test]
    fn test_parse_failures() {
        assert!(parse_classification("").is_err());
        assert!(parse_classification("I think SQL is best").is_err());
        assert!(parse_classification("METHOD: GRAPH\nREASONING: x").is_err());
    }

    #[test]
    fn test_labelled() {
        assert_eq!(labelled("- METHOD: \"SQL\"", "METHOD"), Some("SQL"));
        assert_eq!(labelled("METHODOLOGY: x", "METHOD"), None);
        assert_eq!(labelled("REASON", "REASONING"), None);
    }

    #[test]
    fn test_prompts_mention_their_inputs() {
        let prompt = classification_prompt("How many arsons?");
        assert!(prompt.contains("Question: How many arsons?"));
        assert!(prompt.contains("METHOD:"));
        assert!(prompt.contains("REASONING:"));
    }
}

//! Question routing over a seeded database and the memory engine

use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use obsearch::error::{ObsearchError, Result};
use obsearch::flatten::{PromotionRules, RecordFlattener};
use obsearch::index::{EmbedderSettings, IndexManager, IndexOptions, MemoryEngine};
use obsearch::outcome::DiagnosticKind;
use obsearch::query::{Predicates, RelationalQuery};
use obsearch::retrieval::{
    PathSource, PathStatus, PredicateExtractor, RetrievalDecision, RetrievalRouter,
    RouterOptions, StructuredBackend, Strategy, TextCompletion,
};
use obsearch::schema::SchemaRegistry;
use obsearch::storage::{Database, ModuleRow, ModuleStatistics, RecordSource, SourceRow};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

const INDEX: &str = "incidents";

/// Replies with canned responses in order, then errors
struct ScriptedCompletion {
    replies: Mutex<VecDeque<Result<String>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedCompletion {
    fn new(replies: Vec<Result<String>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl TextCompletion for ScriptedCompletion {
    async fn complete(&self, prompt: &str) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ObsearchError::Completion("script exhausted".into())))
    }
}

/// A relational source whose every call fails
struct UnreachableSource;

fn db_down<T>() -> Result<T> {
    Err(ObsearchError::Config("db down".into()))
}

#[async_trait]
impl RecordSource for UnreachableSource {
    async fn module_rows(&self) -> Result<Vec<ModuleRow>> {
        db_down()
    }

    async fn count_records(&self) -> Result<usize> {
        db_down()
    }

    async fn fetch_records(&self, _offset: usize, _limit: usize) -> Result<Vec<SourceRow>> {
        db_down()
    }

    async fn run_query(&self, _query: &RelationalQuery) -> Result<Vec<SourceRow>> {
        db_down()
    }

    async fn module_statistics(
        &self,
        _since: chrono::DateTime<Utc>,
    ) -> Result<Vec<ModuleStatistics>> {
        db_down()
    }
}

fn reply(text: &str) -> Result<String> {
    Ok(text.to_string())
}

struct Fixture {
    _temp: TempDir,
    engine: Arc<MemoryEngine>,
    manager: Arc<IndexManager>,
    database: Arc<Database>,
}

async fn fixture() -> Fixture {
    let temp = TempDir::new().unwrap();
    let database = Database::new(&temp.path().join("occurrences.db")).unwrap();

    database
        .insert_module(1, "Arson", "Deliberate fires", "[]")
        .unwrap();
    database
        .insert_module(2, "Theft", "Stolen property", "[]")
        .unwrap();

    let narratives = [
        (1, "School dormitory fire started at night"),
        (2, "Laptop taken from library desk"),
        (2, "Laptop bag snatched at bus stage"),
        (2, "Office laptop missing after weekend"),
        (2, "Phone taken from parked car"),
    ];
    for (i, (module, narrative)) in narratives.iter().enumerate() {
        let id = i as i64 + 1;
        let mut record = obsearch::records::RawRecord::new(id, *module);
        record.case_number = Some(format!("OB/{}/2025", id));
        record.submitted_at = Some(Utc.with_ymd_and_hms(2025, 6, id as u32, 12, 0, 0).unwrap());
        record.location = Some("Nairobi".into());
        record.narrative = Some(narrative.to_string());
        database.seed_record(&record).unwrap();
    }

    let engine = Arc::new(MemoryEngine::new());
    let options = IndexOptions {
        settings_timeout: Duration::from_millis(500),
        documents_timeout: Duration::from_millis(500),
        poll_interval: Duration::from_millis(5),
        embedder: Some(EmbedderSettings {
            name: "test-embedder".into(),
            url: "http://localhost:11434/api/embeddings".into(),
            model: "mxbai-embed-large".into(),
            document_template: "{{doc.searchable_text}}".into(),
        }),
        ..IndexOptions::default()
    };
    let manager = Arc::new(IndexManager::new(engine.clone(), options));
    let flattener = RecordFlattener::new(Arc::new(PromotionRules::reference()));
    let report = manager
        .bulk_load(INDEX, &database, &flattener, &|_: usize, _: usize| {})
        .await
        .unwrap();
    assert_eq!(report.value.indexed, 5);

    let database = Arc::new(database);
    Fixture {
        _temp: temp,
        engine,
        manager,
        database,
    }
}

fn options(backend: StructuredBackend) -> RouterOptions {
    RouterOptions {
        index_name: INDEX.to_string(),
        structured_backend: backend,
        completion_timeout: Duration::from_secs(5),
        ..RouterOptions::default()
    }
}

fn build_router(
    fixture: &Fixture,
    completion: Arc<ScriptedCompletion>,
    source: Arc<dyn RecordSource>,
    options: RouterOptions,
) -> RetrievalRouter {
    let today = NaiveDate::from_ymd_opt(2025, 6, 10).unwrap();
    let registry = Arc::new(SchemaRegistry::new(source.clone()));
    RetrievalRouter::new(
        completion,
        source,
        registry,
        fixture.manager.clone(),
        Arc::new(PromotionRules::reference()),
        options,
    )
    .unwrap()
    .with_extractor(PredicateExtractor::new().unwrap().with_today(today))
}

fn router(
    fixture: &Fixture,
    completion: Arc<ScriptedCompletion>,
    backend: StructuredBackend,
) -> RetrievalRouter {
    build_router(fixture, completion, fixture.database.clone(), options(backend))
}

fn decision(strategy: Strategy) -> RetrievalDecision {
    RetrievalDecision {
        strategy,
        rationale: "fixed".into(),
    }
}

#[tokio::test]
async fn test_malformed_classification_falls_back_to_hybrid() {
    let fixture = fixture().await;
    let completion = ScriptedCompletion::new(vec![reply("Honestly, hard to say.")]);
    let router = router(&fixture, completion.clone(), StructuredBackend::Relational);

    let outcome = router.classify("Anything about fires?").await;
    assert_eq!(outcome.value.strategy, Strategy::Hybrid);
    assert_eq!(
        outcome.value.rationale,
        "classification failed, defaulting to hybrid"
    );
    assert_eq!(outcome.count(DiagnosticKind::Classification), 1);
    assert!(completion.prompts()[0].contains("Question: Anything about fires?"));
}

#[tokio::test]
async fn test_completion_error_falls_back_to_hybrid() {
    let fixture = fixture().await;
    let completion = ScriptedCompletion::new(vec![Err(ObsearchError::Completion(
        "connection refused".into(),
    ))]);
    let router = router(&fixture, completion, StructuredBackend::Relational);

    let outcome = router.classify("fires").await;
    assert_eq!(outcome.value.strategy, Strategy::Hybrid);
    assert!(!outcome.is_clean());
}

#[tokio::test]
async fn test_hybrid_survives_failed_structured_path() {
    let fixture = fixture().await;
    fixture.engine.fail_keyword_search(true);
    let completion = ScriptedCompletion::new(vec![reply("METHOD: HYBRID\nREASONING: both")]);
    let router = router(&fixture, completion, StructuredBackend::Search);

    let outcome = router.retrieve("laptop", None).await.unwrap();
    let context = &outcome.value;

    assert_eq!(context.decision.strategy, Strategy::Hybrid);
    assert!(context.structured.is_failed());
    assert_eq!(context.semantic, PathStatus::Results(3));
    assert_eq!(context.items.len(), 3);
    assert!(context.items.iter().all(|i| i.source == PathSource::Semantic));
    let mut ids: Vec<i64> = context.items.iter().map(|i| i.record_id).collect();
    ids.sort();
    assert_eq!(ids, vec![2, 3, 4]);
    assert_eq!(outcome.count(DiagnosticKind::RetrievalBackend), 1);
    assert!(context.render().contains("Structured results: unavailable"));
}

#[tokio::test]
async fn test_hybrid_fails_only_when_both_paths_fail() {
    let fixture = fixture().await;
    fixture.engine.fail_keyword_search(true);
    fixture.engine.fail_semantic_search(true);
    let completion = ScriptedCompletion::new(vec![reply("METHOD: HYBRID")]);
    let router = router(&fixture, completion, StructuredBackend::Search);

    let err = router.retrieve("laptop", None).await.unwrap_err();
    assert!(matches!(err, ObsearchError::RetrievalBackend { ref path, .. } if path == "hybrid"));
}

#[tokio::test]
async fn test_structured_only_failure_is_an_error() {
    let fixture = fixture().await;
    fixture.engine.fail_keyword_search(true);
    let completion = ScriptedCompletion::new(vec![reply("METHOD: SQL\nREASONING: filter")]);
    let router = router(&fixture, completion, StructuredBackend::Search);

    let err = router.retrieve("arson cases", None).await.unwrap_err();
    assert!(matches!(err, ObsearchError::RetrievalBackend { ref path, .. } if path == "structured"));
}

#[tokio::test]
async fn test_relational_backend_uses_extracted_module() {
    let fixture = fixture().await;
    let completion =
        ScriptedCompletion::new(vec![reply("METHOD: STRUCTURED\nREASONING: module filter")]);
    let router = router(&fixture, completion, StructuredBackend::Relational);

    let outcome = router.retrieve("List arson cases", None).await.unwrap();
    let context = outcome.value;

    assert_eq!(context.semantic, PathStatus::NotRequested);
    assert_eq!(context.structured, PathStatus::Results(1));
    assert_eq!(context.items[0].citation(), "OB/1/2025");
    assert_eq!(context.items[0].module_name.as_deref(), Some("Arson"));
}

#[tokio::test]
async fn test_explicit_predicates_replace_extraction() {
    let fixture = fixture().await;
    let completion = ScriptedCompletion::new(vec![reply("METHOD: SQL")]);
    let router = router(&fixture, completion, StructuredBackend::Search);

    let predicates = Predicates {
        modules: vec!["Theft".into()],
        text: Some("laptop".into()),
        ..Predicates::default()
    };
    let outcome = router
        .retrieve("List arson cases", Some(predicates))
        .await
        .unwrap();

    assert_eq!(outcome.value.structured, PathStatus::Results(3));
    assert!(outcome
        .value
        .items
        .iter()
        .all(|i| i.module_name.as_deref() == Some("Theft")));
}

#[tokio::test]
async fn test_structured_path_with_no_match_is_empty_not_failed() {
    let fixture = fixture().await;
    let completion = ScriptedCompletion::new(vec![reply("METHOD: SQL")]);
    let router = router(&fixture, completion, StructuredBackend::Relational);

    let outcome = router
        .retrieve("arson cases yesterday", None)
        .await
        .unwrap();
    assert_eq!(outcome.value.structured, PathStatus::Empty);
    assert!(outcome.is_clean());
}

#[tokio::test]
async fn test_answer_is_synthesized_from_context() {
    let fixture = fixture().await;
    let completion = ScriptedCompletion::new(vec![
        reply("METHOD: SEMANTIC\nREASONING: similarity"),
        reply("Three laptop thefts: OB/2/2025, OB/3/2025 and OB/4/2025."),
    ]);
    let router = router(&fixture, completion.clone(), StructuredBackend::Relational);

    let outcome = router.answer("laptop", None).await.unwrap();
    assert!(outcome.is_clean());
    assert!(outcome.value.synthesized);
    assert!(outcome.value.text.starts_with("Three laptop thefts"));

    let prompts = completion.prompts();
    assert_eq!(prompts.len(), 2);
    assert!(prompts[1].contains("Similar occurrences (3):"));
    assert!(prompts[1].contains("OB/2/2025"));
}

#[tokio::test]
async fn test_failed_synthesis_returns_rendered_context() {
    let fixture = fixture().await;
    let completion = ScriptedCompletion::new(vec![reply("METHOD: SEMANTIC")]);
    let router = router(&fixture, completion, StructuredBackend::Relational);

    let outcome = router.answer("laptop", None).await.unwrap();
    assert!(!outcome.value.synthesized);
    assert_eq!(outcome.value.text, outcome.value.context.render());
    assert_eq!(outcome.count(DiagnosticKind::Synthesis), 1);
}

#[tokio::test]
async fn test_hybrid_survives_unreachable_relational_source() {
    let fixture = fixture().await;
    let router = build_router(
        &fixture,
        ScriptedCompletion::new(Vec::new()),
        Arc::new(UnreachableSource),
        options(StructuredBackend::Relational),
    );

    let outcome = router
        .retrieve_with("laptop", decision(Strategy::Hybrid), None, Vec::new())
        .await
        .unwrap();
    let context = &outcome.value;

    assert!(context.structured.is_failed());
    assert_eq!(context.semantic, PathStatus::Results(3));
    assert!(context.schema_summary.is_empty());
    assert!(context.statistics.is_empty());
    assert_eq!(outcome.count(DiagnosticKind::RetrievalBackend), 1);
    // Schema and counts both went missing
    assert_eq!(outcome.count(DiagnosticKind::SchemaUnavailable), 2);
}

#[tokio::test]
async fn test_semantic_needs_no_relational_source() {
    let fixture = fixture().await;
    let router = build_router(
        &fixture,
        ScriptedCompletion::new(Vec::new()),
        Arc::new(UnreachableSource),
        options(StructuredBackend::Relational),
    );

    let outcome = router
        .retrieve_with("laptop", decision(Strategy::Semantic), None, Vec::new())
        .await
        .unwrap();
    assert_eq!(outcome.value.semantic, PathStatus::Results(3));
    assert_eq!(outcome.count(DiagnosticKind::SchemaUnavailable), 1);

    let err = router
        .retrieve_with("laptop", decision(Strategy::Structured), None, Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ObsearchError::RetrievalBackend { ref path, .. } if path == "structured"));
}

#[tokio::test]
async fn test_counts_are_not_capped_by_row_limit() {
    let fixture = fixture().await;
    let options = RouterOptions {
        structured_limit: 2,
        ..options(StructuredBackend::Relational)
    };
    let router = build_router(
        &fixture,
        ScriptedCompletion::new(Vec::new()),
        fixture.database.clone(),
        options,
    );

    let outcome = router
        .retrieve_with(
            "How many theft cases were reported?",
            decision(Strategy::Structured),
            None,
            Vec::new(),
        )
        .await
        .unwrap();
    let context = &outcome.value;

    assert_eq!(context.structured, PathStatus::Results(2));
    assert_eq!(context.statistics.len(), 1);
    let theft = &context.statistics[0];
    assert_eq!(theft.module_name.as_deref(), Some("Theft"));
    assert_eq!(theft.total, 4);
    assert_eq!(theft.recent, 4);
    assert_eq!(theft.high_urgency, 0);
    assert!(context
        .render()
        .contains("- Theft: 4 total, 4 in the last 30 days, 0 high urgency"));
}

#[tokio::test]
async fn test_semantic_context_carries_no_counts() {
    let fixture = fixture().await;
    let router = router(
        &fixture,
        ScriptedCompletion::new(Vec::new()),
        StructuredBackend::Relational,
    );

    let outcome = router
        .retrieve_with("laptop", decision(Strategy::Semantic), None, Vec::new())
        .await
        .unwrap();
    assert!(outcome.value.statistics.is_empty());
    assert!(outcome.is_clean());
}

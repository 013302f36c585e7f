use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use obsearch::cli::{Cli, Commands, ConfigAction};
use obsearch::config::Config;
use obsearch::flatten::{PromotionRules, RecordFlattener};
use obsearch::index::{IndexManager, MeiliEngine, MemoryEngine, SearchEngine};
use obsearch::outcome::Diagnostic;
use obsearch::query::{DateRange, FilterField, Predicates, StructuredQueryBuilder};
use obsearch::records::Urgency;
use obsearch::retrieval::fusion::RECENT_WINDOW_DAYS;
use obsearch::retrieval::{OllamaCompletion, RetrievalDecision, RetrievalRouter, Strategy};
use obsearch::schema::SchemaRegistry;
use obsearch::storage::{Database, RecordSource};
use obsearch::storage::database::SeedFixture;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_PROBES: [&str; 4] = ["theft", "stolen vehicle", "missing person", "fire"];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse_args();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Config { action } => cmd_config(cli.config, action)?,
        command => {
            let config = load_config(cli.config)?;
            let app = App::open(config)?;
            run(&app, command).await?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default = if verbose { "obsearch=debug" } else { "obsearch=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    fmt().with_env_filter(filter).with_target(false).init();
}

/// Collaborators shared by every command
struct App {
    config: Config,
    database: Arc<Database>,
    registry: Arc<SchemaRegistry>,
    manager: Arc<IndexManager>,
    rules: Arc<PromotionRules>,
}

impl App {
    fn open(config: Config) -> anyhow::Result<Self> {
        let db_path = expand_path(&config.database.path)?;
        let database = Database::new(&db_path)
            .with_context(|| format!("Failed to open database at {}", db_path.display()))?
            .with_query_timeout(Duration::from_millis(config.deadlines.query_ms));
        let database = Arc::new(database);

        let engine: Arc<dyn SearchEngine> = match config.engine.backend.as_str() {
            "memory" => {
                tracing::warn!("Using the in-process memory engine; the index lives only for this command");
                Arc::new(MemoryEngine::new())
            }
            _ => Arc::new(
                MeiliEngine::new(
                    &config.engine.url,
                    config.engine_api_key(),
                    Duration::from_millis(config.deadlines.request_ms),
                )
                .context("Failed to build search engine client")?,
            ),
        };

        let source: Arc<dyn RecordSource> = database.clone();
        Ok(Self {
            registry: Arc::new(SchemaRegistry::new(source)),
            manager: Arc::new(IndexManager::new(engine, config.index_options())),
            rules: Arc::new(config.promotion.clone()),
            database,
            config,
        })
    }

    fn index_name(&self) -> &str {
        &self.config.engine.index_name
    }

    fn router(&self) -> anyhow::Result<RetrievalRouter> {
        let completion = OllamaCompletion::new(
            &self.config.llm.url,
            &self.config.llm.model,
            self.config.llm.temperature,
            Duration::from_millis(self.config.deadlines.completion_ms),
        )?;
        let router = RetrievalRouter::new(
            Arc::new(completion),
            self.database.clone(),
            self.registry.clone(),
            self.manager.clone(),
            self.rules.clone(),
            self.config.router_options(),
        )?;
        Ok(router)
    }
}

async fn run(app: &App, command: Commands) -> anyhow::Result<()> {
    let reads_index = matches!(
        command,
        Commands::Search { .. } | Commands::Ask { .. } | Commands::Verify { .. }
    );
    if reads_index && app.config.engine.backend == "memory" {
        prime_memory_index(app).await?;
    }

    match command {
        Commands::Reindex { reset } => cmd_reindex(app, reset).await,
        Commands::Search {
            query,
            module,
            urgency,
            from,
            to,
            has,
            page,
            json,
        } => {
            let predicates = search_predicates(module, urgency, from, to, has)?;
            cmd_search(app, &query, &predicates, page, json).await
        }
        Commands::Ask {
            question,
            no_llm,
            json,
        } => cmd_ask(app, &question, no_llm, json).await,
        Commands::Classify { question } => cmd_classify(app, &question).await,
        Commands::Schema { module } => cmd_schema(app, module).await,
        Commands::Verify { queries } => cmd_verify(app, queries).await,
        Commands::Seed { fixture } => cmd_seed(app, &fixture),
        Commands::Status => cmd_status(app).await,
        Commands::Config { .. } => Ok(()),
    }
}

async fn cmd_reindex(app: &App, reset: bool) -> anyhow::Result<()> {
    let index = app.index_name();
    if reset {
        println!("Resetting index '{}'...", index);
        app.manager.reset_index(index).await?;
    }

    let flattener = RecordFlattener::new(app.rules.clone());
    let progress = |done: usize, total: usize| {
        tracing::info!("Indexed {}/{} records", done, total);
    };
    let outcome = app
        .manager
        .bulk_load(index, app.database.as_ref(), &flattener, &progress)
        .await
        .with_context(|| format!("Failed to load index '{}'", index))?;

    let (report, diagnostics) = outcome.into_parts();
    println!("✓ Indexed {} of {} records into '{}'", report.indexed, report.total_expected, index);
    if report.failed_chunks > 0 {
        println!(
            "⚠ {} chunks failed, {} records skipped",
            report.failed_chunks, report.skipped_records
        );
    }
    if report.anomalies > 0 {
        println!("  {} records had malformed data", report.anomalies);
    }
    print_diagnostics(&diagnostics);
    Ok(())
}

/// The memory engine starts empty in every process
async fn prime_memory_index(app: &App) -> anyhow::Result<()> {
    let flattener = RecordFlattener::new(app.rules.clone());
    let outcome = app
        .manager
        .bulk_load(
            app.index_name(),
            app.database.as_ref(),
            &flattener,
            &|_: usize, _: usize| {},
        )
        .await
        .context("Failed to load the in-process index")?;
    print_diagnostics(&outcome.diagnostics);
    Ok(())
}

fn search_predicates(
    modules: Vec<String>,
    urgency: Option<String>,
    from: Option<chrono::NaiveDate>,
    to: Option<chrono::NaiveDate>,
    has: Vec<String>,
) -> anyhow::Result<Predicates> {
    let present = has
        .iter()
        .map(|name| {
            FilterField::parse(name).with_context(|| format!("Unknown filterable field '{}'", name))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let date_range = match (from, to) {
        (None, None) => None,
        (start, end) => {
            let start = start.unwrap_or_else(|| DateTime::<Utc>::UNIX_EPOCH.date_naive());
            let end = end.unwrap_or_else(|| Utc::now().date_naive());
            if end < start {
                bail!("--to {} is before --from {}", end, start);
            }
            Some(DateRange::new(start, end))
        }
    };

    Ok(Predicates {
        modules,
        text: None,
        date_range,
        urgency: urgency.as_deref().and_then(Urgency::parse),
        present,
    })
}

async fn cmd_search(
    app: &App,
    query: &str,
    predicates: &Predicates,
    page: usize,
    json: bool,
) -> anyhow::Result<()> {
    let builder = StructuredQueryBuilder::new(app.rules.clone());
    let filter = builder.filter(predicates);
    tracing::debug!("Search filter: {:?}", filter);

    let results = app
        .manager
        .search(app.index_name(), query, filter, page)
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
        return Ok(());
    }

    println!(
        "{} results, page {} of {}",
        results.total_hits, results.page, results.total_pages
    );
    for hit in &results.hits {
        let text = |key: &str| hit.get(key).and_then(|v| v.as_str()).unwrap_or("-");
        let submitted = hit
            .get("submitted_at")
            .and_then(|v| v.as_i64())
            .and_then(|ts| DateTime::from_timestamp(ts, 0))
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<18} {:<28} {:<20} {}",
            text("case_number"),
            text("module_name"),
            text("location"),
            submitted
        );
    }
    Ok(())
}

async fn cmd_ask(app: &App, question: &str, no_llm: bool, json: bool) -> anyhow::Result<()> {
    let router = app.router()?;

    if no_llm || !app.config.llm.enabled {
        let decision = RetrievalDecision {
            strategy: Strategy::Hybrid,
            rationale: "language model disabled".to_string(),
        };
        let (context, diagnostics) = router
            .retrieve_with(question, decision, None, Vec::new())
            .await?
            .into_parts();
        if json {
            println!("{}", serde_json::to_string_pretty(&context)?);
        } else {
            print!("{}", context.render());
        }
        print_diagnostics(&diagnostics);
        return Ok(());
    }

    let (answer, diagnostics) = router.answer(question, None).await?.into_parts();
    if json {
        println!("{}", serde_json::to_string_pretty(&answer)?);
    } else {
        println!(
            "Strategy: {} ({})\n",
            answer.context.decision.strategy, answer.context.decision.rationale
        );
        println!("{}", answer.text);
    }
    print_diagnostics(&diagnostics);
    Ok(())
}

async fn cmd_classify(app: &App, question: &str) -> anyhow::Result<()> {
    let router = app.router()?;
    let (decision, diagnostics) = router.classify(question).await.into_parts();
    println!("{}: {}", decision.strategy, decision.rationale);
    print_diagnostics(&diagnostics);
    Ok(())
}

async fn cmd_schema(app: &App, module: Option<i64>) -> anyhow::Result<()> {
    let snapshot = app.registry.load().await?;
    match module {
        Some(id) => {
            if snapshot.get(id).is_none() {
                bail!("No module with id {}", id);
            }
            println!("{}", snapshot.describe(id));
        }
        None => println!("{}", snapshot.summary()),
    }
    print_diagnostics(snapshot.diagnostics());
    Ok(())
}

async fn cmd_verify(app: &App, queries: Vec<String>) -> anyhow::Result<()> {
    let queries = if queries.is_empty() {
        DEFAULT_PROBES.iter().map(|q| q.to_string()).collect()
    } else {
        queries
    };

    let count = app.manager.document_count(app.index_name()).await?;
    println!("Index '{}' holds {} documents", app.index_name(), count);

    for probe in app.manager.verify(app.index_name(), &queries).await? {
        println!("  '{}': {} hits {:?}", probe.query, probe.hits, probe.top);
    }
    Ok(())
}

fn cmd_seed(app: &App, fixture: &Path) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(fixture)
        .with_context(|| format!("Failed to read fixture {}", fixture.display()))?;
    let fixture: SeedFixture =
        serde_json::from_str(&content).context("Fixture is not a valid seed file")?;

    let stats = app.database.seed_fixture(&fixture)?;
    println!(
        "✓ Seeded {} modules, {} records, {} reporters",
        stats.module_count, stats.record_count, stats.reporter_count
    );
    Ok(())
}

async fn cmd_status(app: &App) -> anyhow::Result<()> {
    let stats = app.database.stats()?;

    println!("obsearch status");
    println!("===============");
    println!("\nDatabase: {}", app.config.database.path.display());
    println!("  Modules:   {}", stats.module_count);
    println!("  Records:   {}", stats.record_count);
    println!("  Reporters: {}", stats.reporter_count);

    let since = Utc::now() - chrono::Duration::days(RECENT_WINDOW_DAYS as i64);
    let by_module = app.database.module_statistics(since).await?;
    if !by_module.is_empty() {
        println!(
            "\n  {:<32} {:>8} {:>10} {:>8}",
            "Module",
            "Total",
            format!("Last {}d", RECENT_WINDOW_DAYS),
            "High"
        );
        for stat in &by_module {
            println!(
                "  {:<32} {:>8} {:>10} {:>8}",
                stat.module_name.as_deref().unwrap_or("(unknown)"),
                stat.total,
                stat.recent,
                stat.high_urgency
            );
        }
    }

    println!("\nIndex: {} ({})", app.index_name(), app.config.engine.backend);
    match app.manager.document_count(app.index_name()).await {
        Ok(count) => println!("  Documents: {}", count),
        Err(e) => println!("  Unavailable: {}", e),
    }
    Ok(())
}

fn cmd_config(config_path: Option<PathBuf>, action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            let config = load_config(config_path)?;
            println!("{}", toml::to_string_pretty(&config)?);
        }
        ConfigAction::Validate { file } => {
            let path = match file.or(config_path) {
                Some(path) => path,
                None => Config::default_path()?,
            };
            let config = Config::load(&path)?;
            println!("✓ Configuration is valid");
            println!("  Schema version: {}", config.meta.schema_version);
        }
        ConfigAction::Init { force } => {
            let path = match config_path {
                Some(path) => path,
                None => Config::default_path()?,
            };

            if path.exists() && !force {
                println!("Configuration file already exists at: {}", path.display());
                println!("Use --force to overwrite");
                return Ok(());
            }

            Config::default().save(&path)?;
            println!("✓ Configuration initialized at: {}", path.display());
        }
    }

    Ok(())
}

fn load_config(config_path: Option<PathBuf>) -> anyhow::Result<Config> {
    let path = match config_path {
        Some(path) => path,
        None => Config::default_path()?,
    };

    if !path.exists() {
        tracing::warn!(
            "Config file not found, using defaults. Run 'obsearch config init' to create one."
        );
        let mut config = Config::default();
        config.apply_env_overrides();
        return Ok(config);
    }

    Config::load(&path).with_context(|| format!("Failed to load config from {}", path.display()))
}

fn print_diagnostics(diagnostics: &[Diagnostic]) {
    if diagnostics.is_empty() {
        return;
    }
    println!("\n{} warnings:", diagnostics.len());
    for diagnostic in diagnostics.iter().take(20) {
        println!("  - {}", diagnostic);
    }
    if diagnostics.len() > 20 {
        println!("  ... and {} more", diagnostics.len() - 20);
    }
}

fn expand_path(path: &Path) -> anyhow::Result<PathBuf> {
    let path_str = path.to_str().context("Invalid path encoding")?;

    if let Some(stripped) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir().context("Cannot determine home directory")?;
        Ok(home.join(stripped))
    } else {
        Ok(path.to_path_buf())
    }
}

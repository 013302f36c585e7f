//! Index lifecycle and bulk loading
//!
//! An index moves through `Nonexistent -> Creating -> Configured -> Loading ->
//! Ready`. Loading streams the relational source in fixed-size chunks, one
//! engine task per chunk. A chunk that fails is retried and then skipped, so a
//! bad batch costs its own records and nothing else.

use super::{await_task, EmbedderSettings, IndexSettings, SearchEngine, SearchHit, SearchRequest};
use crate::deadline::with_deadline;
use crate::error::{ObsearchError, Result};
use crate::flatten::{IndexDocument, RecordFlattener};
use crate::outcome::{Diagnostic, DiagnosticKind, Outcome};
use crate::storage::RecordSource;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Lifecycle state of an index as seen by this manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexState {
    Nonexistent,
    Creating,
    Configured,
    Loading,
    Ready,
}

#[derive(Debug, Clone)]
pub struct IndexOptions {
    pub primary_key: String,
    /// Wait for index creation, deletion and settings tasks
    pub settings_timeout: Duration,
    /// Wait for each document batch task
    pub documents_timeout: Duration,
    pub poll_interval: Duration,
    /// Deadline for a single engine request
    pub request_timeout: Duration,
    pub chunk_size: usize,
    /// Extra attempts per failed chunk
    pub chunk_retries: usize,
    pub max_concurrent_chunks: usize,
    pub page_size: usize,
    pub embedder: Option<EmbedderSettings>,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            primary_key: "id".to_string(),
            settings_timeout: Duration::from_millis(180_000),
            documents_timeout: Duration::from_millis(300_000),
            poll_interval: Duration::from_millis(250),
            request_timeout: Duration::from_secs(30),
            chunk_size: 1000,
            chunk_retries: 1,
            max_concurrent_chunks: 1,
            page_size: 10,
            embedder: None,
        }
    }
}

/// Totals of one bulk load
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub indexed: usize,
    pub failed_chunks: usize,
    /// Records lost with failed chunks
    pub skipped_records: usize,
    pub total_expected: usize,
    /// Records indexed despite a malformed bag or timestamp
    pub anomalies: usize,
}

/// One page of keyword results
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchPage {
    pub hits: Vec<Map<String, Value>>,
    pub page: usize,
    pub total_hits: usize,
    pub total_pages: usize,
}

/// Hit count for a smoke-test query
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerifyProbe {
    pub query: String,
    pub hits: usize,
    /// Case numbers of the first few hits
    pub top: Vec<String>,
}

/// Marks an index as loading until dropped
struct LoadGuard<'a> {
    loading: &'a Mutex<HashSet<String>>,
    index: String,
}

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut loading) = self.loading.lock() {
            loading.remove(&self.index);
        }
    }
}

struct ChunkResult {
    chunk: usize,
    expected: usize,
    indexed: usize,
    anomalies: usize,
    diagnostics: Vec<Diagnostic>,
}

/// Owns the search index: creation, settings, loading and paging
pub struct IndexManager {
    engine: Arc<dyn SearchEngine>,
    options: IndexOptions,
    states: Mutex<HashMap<String, IndexState>>,
    loading: Mutex<HashSet<String>>,
}

impl IndexManager {
    pub fn new(engine: Arc<dyn SearchEngine>, options: IndexOptions) -> Self {
        Self {
            engine,
            options,
            states: Mutex::new(HashMap::new()),
            loading: Mutex::new(HashSet::new()),
        }
    }

    pub fn options(&self) -> &IndexOptions {
        &self.options
    }

    pub fn engine(&self) -> &Arc<dyn SearchEngine> {
        &self.engine
    }

    pub fn state(&self, index: &str) -> IndexState {
        self.states
            .lock()
            .ok()
            .and_then(|states| states.get(index).copied())
            .unwrap_or(IndexState::Nonexistent)
    }

    fn set_state(&self, index: &str, state: IndexState) {
        if let Ok(mut states) = self.states.lock() {
            tracing::debug!("Index '{}' is now {:?}", index, state);
            states.insert(index.to_string(), state);
        }
    }

    async fn wait(&self, task: super::TaskHandle, timeout: Duration) -> Result<()> {
        await_task(
            self.engine.as_ref(),
            task,
            timeout,
            self.options.poll_interval,
        )
        .await
    }

    /// Create and configure the index if it does not exist
    ///
    /// Returns whether it was created. An existing index is left untouched.
    pub async fn ensure_index(&self, index: &str) -> Result<bool> {
        let exists = with_deadline(
            "index lookup",
            self.options.request_timeout,
            self.engine.index_exists(index),
        )
        .await
        .map_err(|e| config_error(index, e))?;

        if exists {
            if self.state(index) == IndexState::Nonexistent {
                self.set_state(index, IndexState::Ready);
            }
            return Ok(false);
        }

        self.set_state(index, IndexState::Creating);
        let result = self.create_and_configure(index).await;
        if result.is_err() {
            self.set_state(index, IndexState::Nonexistent);
        }
        result.map(|_| true)
    }

    async fn create_and_configure(&self, index: &str) -> Result<()> {
        tracing::info!("Creating index '{}'", index);
        let task = with_deadline(
            "index creation",
            self.options.request_timeout,
            self.engine.create_index(index, &self.options.primary_key),
        )
        .await
        .map_err(|e| config_error(index, e))?;
        self.wait(task, self.options.settings_timeout)
            .await
            .map_err(|e| config_error(index, e))?;

        tracing::info!("Applying settings to index '{}'", index);
        let settings = IndexSettings::for_documents(self.options.embedder.clone());
        let task = with_deadline(
            "settings update",
            self.options.request_timeout,
            self.engine.update_settings(index, &settings),
        )
        .await
        .map_err(|e| config_error(index, e))?;
        self.wait(task, self.options.settings_timeout)
            .await
            .map_err(|e| config_error(index, e))?;

        self.set_state(index, IndexState::Configured);
        Ok(())
    }

    /// Drop the index and everything in it
    pub async fn reset_index(&self, index: &str) -> Result<()> {
        let exists = with_deadline(
            "index lookup",
            self.options.request_timeout,
            self.engine.index_exists(index),
        )
        .await?;

        if exists {
            tracing::info!("Deleting index '{}'", index);
            let task = with_deadline(
                "index deletion",
                self.options.request_timeout,
                self.engine.delete_index(index),
            )
            .await?;
            self.wait(task, self.options.settings_timeout).await?;
        }

        self.set_state(index, IndexState::Nonexistent);
        Ok(())
    }

    fn begin_load(&self, index: &str) -> Result<LoadGuard<'_>> {
        let mut loading = self
            .loading
            .lock()
            .map_err(|_| ObsearchError::Config("load registry poisoned".to_string()))?;
        if !loading.insert(index.to_string()) {
            return Err(ObsearchError::LoadInProgress {
                index: index.to_string(),
            });
        }
        Ok(LoadGuard {
            loading: &self.loading,
            index: index.to_string(),
        })
    }

    /// Stream every record from `source` into the index
    ///
    /// `progress(done, total)` is called after each chunk. Chunk failures
    /// are reported in the outcome, not as errors.
    pub async fn bulk_load(
        &self,
        index: &str,
        source: &dyn RecordSource,
        flattener: &RecordFlattener,
        progress: &(dyn Fn(usize, usize) + Send + Sync),
    ) -> Result<Outcome<LoadReport>> {
        let _guard = self.begin_load(index)?;
        self.ensure_index(index).await?;
        let previous = self.state(index);
        self.set_state(index, IndexState::Loading);

        // Nothing has been submitted yet, so a failed count leaves the index as it was
        let total = match source.count_records().await {
            Ok(total) => total,
            Err(e) => {
                self.set_state(index, previous);
                return Err(e);
            }
        };
        let chunk_size = self.options.chunk_size.max(1);
        tracing::info!(
            "Loading {} records into '{}' in chunks of {}",
            total,
            index,
            chunk_size
        );

        let offsets: Vec<(usize, usize)> = (0..total).step_by(chunk_size).enumerate().collect();

        let results = stream::iter(offsets)
            .map(|(chunk, offset)| {
                let expected = chunk_size.min(total - offset);
                self.load_chunk(index, source, flattener, chunk, offset, expected)
            })
            .buffer_unordered(self.options.max_concurrent_chunks.max(1));

        let report = self.collect(results, total, progress).await;
        self.set_state(index, IndexState::Ready);
        Ok(report)
    }

    async fn load_chunk(
        &self,
        index: &str,
        source: &dyn RecordSource,
        flattener: &RecordFlattener,
        chunk: usize,
        offset: usize,
        expected: usize,
    ) -> ChunkResult {
        let rows = match source.fetch_records(offset, expected).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!("Chunk {} could not be read: {}", chunk, e);
                return ChunkResult {
                    chunk,
                    expected,
                    indexed: 0,
                    anomalies: 0,
                    diagnostics: vec![Diagnostic::new(
                        DiagnosticKind::ChunkSubmit,
                        format!("chunk {} could not be read: {}", chunk, e),
                    )],
                };
            }
        };

        let (documents, diagnostics) = flattener.flatten_rows(&rows).into_parts();
        let anomalies = diagnostics
            .iter()
            .filter_map(|d| d.record_id)
            .collect::<HashSet<_>>()
            .len();
        self.submit_chunk(index, chunk, &documents, diagnostics, anomalies)
            .await
    }

    async fn submit_chunk(
        &self,
        index: &str,
        chunk: usize,
        documents: &[IndexDocument],
        mut diagnostics: Vec<Diagnostic>,
        anomalies: usize,
    ) -> ChunkResult {
        let expected = documents.len();
        if documents.is_empty() {
            return ChunkResult {
                chunk,
                expected,
                indexed: 0,
                anomalies,
                diagnostics,
            };
        }

        let payload: Vec<Value> = documents.iter().map(IndexDocument::to_json).collect();
        let attempts = 1 + self.options.chunk_retries;
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.submit_once(index, &payload).await {
                Ok(()) => {
                    tracing::debug!("Chunk {} indexed ({} documents)", chunk, expected);
                    return ChunkResult {
                        chunk,
                        expected,
                        indexed: expected,
                        anomalies,
                        diagnostics,
                    };
                }
                Err(e) => {
                    tracing::warn!("Chunk {} attempt {}/{} failed: {}", chunk, attempt, attempts, e);
                    last_error = Some(e);
                }
            }
        }

        let error = ObsearchError::ChunkSubmit {
            chunk,
            message: last_error.map(|e| e.to_string()).unwrap_or_default(),
        };
        diagnostics.push(Diagnostic::new(DiagnosticKind::ChunkSubmit, error.to_string()));
        ChunkResult {
            chunk,
            expected,
            indexed: 0,
            anomalies: 0,
            diagnostics,
        }
    }

    async fn submit_once(&self, index: &str, payload: &[Value]) -> Result<()> {
        let task = with_deadline(
            "document submission",
            self.options.request_timeout,
            self.engine
                .add_documents(index, payload, &self.options.primary_key),
        )
        .await?;
        self.wait(task, self.options.documents_timeout).await
    }

    async fn collect(
        &self,
        results: impl futures::Stream<Item = ChunkResult>,
        total: usize,
        progress: &(dyn Fn(usize, usize) + Send + Sync),
    ) -> Outcome<LoadReport> {
        let mut results = std::pin::pin!(results);
        let mut report = LoadReport {
            total_expected: total,
            ..Default::default()
        };
        let mut diagnostics = Vec::new();
        let mut done = 0;

        while let Some(result) = results.next().await {
            done += result.expected;
            report.indexed += result.indexed;
            report.anomalies += result.anomalies;
            if result.indexed < result.expected {
                report.failed_chunks += 1;
                report.skipped_records += result.expected - result.indexed;
                tracing::warn!("Chunk {} skipped", result.chunk);
            }
            diagnostics.extend(result.diagnostics);
            progress(done.min(total), total);
        }

        tracing::info!(
            "Indexed {}/{} records ({} failed chunks, {} anomalies)",
            report.indexed,
            report.total_expected,
            report.failed_chunks,
            report.anomalies
        );
        Outcome::with_diagnostics(report, diagnostics)
    }

    /// Load already-flattened documents through the same chunked path
    pub async fn load_documents(
        &self,
        index: &str,
        documents: &[IndexDocument],
    ) -> Result<Outcome<LoadReport>> {
        let _guard = self.begin_load(index)?;
        self.ensure_index(index).await?;
        self.set_state(index, IndexState::Loading);

        let chunk_size = self.options.chunk_size.max(1);
        let results = stream::iter(documents.chunks(chunk_size).enumerate())
            .map(|(chunk, batch)| self.submit_chunk(index, chunk, batch, Vec::new(), 0))
            .buffer_unordered(self.options.max_concurrent_chunks.max(1));

        let report = self.collect(results, documents.len(), &|_, _| {}).await;
        self.set_state(index, IndexState::Ready);
        Ok(report)
    }

    /// Run smoke-test queries and report their hit counts
    pub async fn verify(&self, index: &str, queries: &[String]) -> Result<Vec<VerifyProbe>> {
        let mut probes = Vec::with_capacity(queries.len());
        for query in queries {
            let response = with_deadline(
                "verification search",
                self.options.request_timeout,
                self.engine
                    .search(index, &SearchRequest::keyword(query.as_str()).with_page(3, 0)),
            )
            .await?;

            let top = response
                .hits
                .iter()
                .filter_map(|hit| hit.document.get("case_number").and_then(Value::as_str))
                .map(String::from)
                .collect();
            tracing::info!("Probe '{}' matched {} documents", query, response.total_hits);
            probes.push(VerifyProbe {
                query: query.clone(),
                hits: response.total_hits,
                top,
            });
        }
        Ok(probes)
    }

    pub async fn document_count(&self, index: &str) -> Result<usize> {
        with_deadline(
            "document count",
            self.options.request_timeout,
            self.engine.document_count(index),
        )
        .await
    }

    /// One page of keyword results, pages numbered from 1
    pub async fn search(
        &self,
        index: &str,
        query: &str,
        filter: Option<String>,
        page: usize,
    ) -> Result<SearchPage> {
        let page = page.max(1);
        let page_size = self.options.page_size.max(1);
        let request = SearchRequest::keyword(query)
            .with_filter(filter)
            .with_page(page_size, (page - 1) * page_size);

        let response = with_deadline(
            "search",
            self.options.request_timeout,
            self.engine.search(index, &request),
        )
        .await?;

        let total_pages = response.total_hits.div_ceil(page_size).max(1);
        Ok(SearchPage {
            hits: response.hits.into_iter().map(|h| h.document).collect(),
            page,
            total_hits: response.total_hits,
            total_pages,
        })
    }

    /// Filtered keyword search used by the structured path
    pub async fn filtered(
        &self,
        index: &str,
        query: &str,
        filter: Option<String>,
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        let request = SearchRequest::keyword(query)
            .with_filter(filter)
            .with_page(limit, 0);
        let response = with_deadline(
            "filtered search",
            self.options.request_timeout,
            self.engine.search(index, &request),
        )
        .await?;
        Ok(response.hits)
    }

    /// Top-k vector search through the configured embedder
    pub async fn semantic(&self, index: &str, query: &str, k: usize) -> Result<Vec<SearchHit>> {
        let embedder = self
            .options
            .embedder
            .as_ref()
            .ok_or_else(|| ObsearchError::Config("no embedder configured".to_string()))?;
        let request = SearchRequest::semantic(query, embedder.name.as_str()).with_page(k, 0);
        let response = with_deadline(
            "semantic search",
            self.options.request_timeout,
            self.engine.search(index, &request),
        )
        .await?;
        Ok(response.hits)
    }
}

fn config_error(index: &str, error: ObsearchError) -> ObsearchError {
    match error {
        e @ (ObsearchError::TaskTimeout { .. }
        | ObsearchError::Timeout { .. }
        | ObsearchError::IndexConfig { .. }) => e,
        other => ObsearchError::IndexConfig {
            index: index.to_string(),
            message: other.to_string(),
        },
    }
}

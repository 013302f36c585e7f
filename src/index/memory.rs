//! In-process search engine
//!
//! Follows the task model of the HTTP engine closely enough for the index
//! manager and router to run unchanged: mutations are applied when enqueued
//! and reported through task status, filters use the same grammar, and
//! unknown filter fields or embedders are rejected. Ranking is simple token
//! matching; semantic search scores token overlap.
//!
//! Failure switches let tests exercise retry, timeout and path-isolation
//! behavior.

use super::{
    IndexSettings, SearchEngine, SearchHit, SearchMode, SearchRequest, SearchResponse, TaskHandle,
    TaskStatus,
};
use crate::error::{ObsearchError, Result};
use crate::query::FilterExpr;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

#[derive(Debug, Default)]
struct MemoryIndex {
    settings: Option<IndexSettings>,
    documents: Vec<Map<String, Value>>,
    positions: HashMap<String, usize>,
}

#[derive(Debug, Default)]
struct State {
    indexes: HashMap<String, MemoryIndex>,
    tasks: HashMap<u64, TaskStatus>,
    next_uid: u64,
    stall_tasks: bool,
    failing_add_requests: usize,
    failing_add_tasks: usize,
    fail_keyword: bool,
    fail_semantic: bool,
    add_requests: usize,
}

impl State {
    fn enqueue(&mut self, status: TaskStatus) -> TaskHandle {
        let uid = self.next_uid;
        self.next_uid += 1;
        let status = if self.stall_tasks {
            TaskStatus::Enqueued
        } else {
            status
        };
        self.tasks.insert(uid, status);
        TaskHandle { uid }
    }
}

/// Search engine held entirely in memory
#[derive(Debug, Default)]
pub struct MemoryEngine {
    state: Mutex<State>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| ObsearchError::Config("memory engine state poisoned".to_string()))
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        match self.state.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    /// Leave every new task enqueued forever
    pub fn stall_tasks(&self, stall: bool) {
        self.with_state(|s| s.stall_tasks = stall);
    }

    /// Reject the next `n` document submissions outright
    pub fn fail_add_requests(&self, n: usize) {
        self.with_state(|s| s.failing_add_requests = n);
    }

    /// Accept the next `n` document submissions but fail their tasks
    pub fn fail_add_tasks(&self, n: usize) {
        self.with_state(|s| s.failing_add_tasks = n);
    }

    pub fn fail_keyword_search(&self, fail: bool) {
        self.with_state(|s| s.fail_keyword = fail);
    }

    pub fn fail_semantic_search(&self, fail: bool) {
        self.with_state(|s| s.fail_semantic = fail);
    }

    /// Number of document submissions received, failed ones included
    pub fn add_requests(&self) -> usize {
        self.with_state(|s| s.add_requests)
    }

    /// Stored document by primary key value
    pub fn document(&self, index: &str, id: &str) -> Option<Map<String, Value>> {
        self.with_state(|s| {
            let idx = s.indexes.get(index)?;
            idx.positions.get(id).map(|&pos| idx.documents[pos].clone())
        })
    }

    pub fn settings(&self, index: &str) -> Option<IndexSettings> {
        self.with_state(|s| s.indexes.get(index).and_then(|i| i.settings.clone()))
    }
}

fn not_found(index: &str) -> ObsearchError {
    ObsearchError::Engine {
        status: 404,
        message: format!("Index `{}` not found.", index),
    }
}

fn key_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn tokens(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

fn document_tokens(doc: &Map<String, Value>) -> Vec<String> {
    fn collect(value: &Value, out: &mut Vec<String>) {
        match value {
            Value::String(s) => out.extend(tokens(s)),
            Value::Number(n) => out.push(n.to_string()),
            Value::Array(items) => items.iter().for_each(|v| collect(v, out)),
            Value::Object(map) => map.values().for_each(|v| collect(v, out)),
            _ => {}
        }
    }
    let mut out = Vec::new();
    for value in doc.values() {
        collect(value, &mut out);
    }
    out
}

/// Every query token must prefix some document token
fn keyword_matches(query: &[String], doc_tokens: &HashSet<String>) -> bool {
    query
        .iter()
        .all(|q| doc_tokens.iter().any(|t| t.starts_with(q.as_str())))
}

fn overlap_score(query: &[String], doc_tokens: &[String]) -> f32 {
    if query.is_empty() || doc_tokens.is_empty() {
        return 0.0;
    }
    let query_set: HashSet<&str> = query.iter().map(String::as_str).collect();
    let doc_set: HashSet<&str> = doc_tokens.iter().map(String::as_str).collect();
    let shared = query_set.intersection(&doc_set).count() as f32;
    shared / ((query_set.len() as f32).sqrt() * (doc_set.len() as f32).sqrt())
}

#[async_trait]
impl SearchEngine for MemoryEngine {
    async fn index_exists(&self, index: &str) -> Result<bool> {
        Ok(self.lock()?.indexes.contains_key(index))
    }

    async fn create_index(&self, index: &str, _primary_key: &str) -> Result<TaskHandle> {
        let mut state = self.lock()?;
        let status = if state.indexes.contains_key(index) {
            TaskStatus::Failed(format!("Index `{}` already exists.", index))
        } else {
            state.indexes.insert(index.to_string(), MemoryIndex::default());
            TaskStatus::Succeeded
        };
        Ok(state.enqueue(status))
    }

    async fn delete_index(&self, index: &str) -> Result<TaskHandle> {
        let mut state = self.lock()?;
        let status = match state.indexes.remove(index) {
            Some(_) => TaskStatus::Succeeded,
            None => TaskStatus::Failed(format!("Index `{}` not found.", index)),
        };
        Ok(state.enqueue(status))
    }

    async fn update_settings(&self, index: &str, settings: &IndexSettings) -> Result<TaskHandle> {
        let mut state = self.lock()?;
        let idx = state.indexes.entry(index.to_string()).or_default();
        idx.settings = Some(settings.clone());
        Ok(state.enqueue(TaskStatus::Succeeded))
    }

    async fn add_documents(
        &self,
        index: &str,
        documents: &[Value],
        primary_key: &str,
    ) -> Result<TaskHandle> {
        let mut state = self.lock()?;
        state.add_requests += 1;

        if state.failing_add_requests > 0 {
            state.failing_add_requests -= 1;
            return Err(ObsearchError::Engine {
                status: 503,
                message: "service unavailable".to_string(),
            });
        }
        if state.failing_add_tasks > 0 {
            state.failing_add_tasks -= 1;
            return Ok(state.enqueue(TaskStatus::Failed("document batch rejected".to_string())));
        }

        let mut keyed = Vec::with_capacity(documents.len());
        for doc in documents {
            let key = doc
                .as_object()
                .and_then(|map| map.get(primary_key).and_then(key_of).map(|k| (k, map.clone())));
            match key {
                Some(entry) => keyed.push(entry),
                None => {
                    return Ok(state.enqueue(TaskStatus::Failed(format!(
                        "Document is missing its `{}` primary key.",
                        primary_key
                    ))))
                }
            }
        }

        let idx = state.indexes.entry(index.to_string()).or_default();
        for (key, map) in keyed {
            match idx.positions.get(&key) {
                Some(&pos) => idx.documents[pos] = map,
                None => {
                    idx.positions.insert(key, idx.documents.len());
                    idx.documents.push(map);
                }
            }
        }
        Ok(state.enqueue(TaskStatus::Succeeded))
    }

    async fn task_status(&self, task: TaskHandle) -> Result<TaskStatus> {
        self.lock()?
            .tasks
            .get(&task.uid)
            .cloned()
            .ok_or_else(|| ObsearchError::Engine {
                status: 404,
                message: format!("Task `{}` not found.", task.uid),
            })
    }

    async fn search(&self, index: &str, request: &SearchRequest) -> Result<SearchResponse> {
        let state = self.lock()?;
        let idx = state.indexes.get(index).ok_or_else(|| not_found(index))?;

        let semantic = match &request.mode {
            SearchMode::Keyword => {
                if state.fail_keyword {
                    return Err(ObsearchError::Engine {
                        status: 503,
                        message: "keyword search unavailable".to_string(),
                    });
                }
                false
            }
            SearchMode::Semantic { embedder } => {
                if state.fail_semantic {
                    return Err(ObsearchError::Engine {
                        status: 503,
                        message: "embedder unreachable".to_string(),
                    });
                }
                let configured = idx
                    .settings
                    .as_ref()
                    .and_then(|s| s.embedder.as_ref())
                    .is_some_and(|e| &e.name == embedder);
                if !configured {
                    return Err(ObsearchError::Engine {
                        status: 400,
                        message: format!("Cannot find embedder with name `{}`.", embedder),
                    });
                }
                true
            }
        };

        let filter = match request.filter.as_deref() {
            Some(text) => {
                let expr = FilterExpr::parse(text).map_err(|e| ObsearchError::Engine {
                    status: 400,
                    message: format!("Invalid filter `{}`: {}", text, e),
                })?;
                if let Some(settings) = &idx.settings {
                    if let Some(field) = expr
                        .fields()
                        .into_iter()
                        .find(|f| !settings.filterable.iter().any(|a| a == f))
                    {
                        return Err(ObsearchError::Engine {
                            status: 400,
                            message: format!("Attribute `{}` is not filterable.", field),
                        });
                    }
                }
                Some(expr)
            }
            None => None,
        };

        let query = tokens(&request.query);
        let candidates = idx
            .documents
            .iter()
            .filter(|doc| filter.as_ref().map_or(true, |f| f.matches(doc)));

        let mut scored: Vec<(f32, &Map<String, Value>)> = if semantic {
            let mut scored: Vec<_> = candidates
                .map(|doc| (overlap_score(&query, &document_tokens(doc)), doc))
                .filter(|(score, _)| *score > 0.0)
                .collect();
            scored.sort_by(|a, b| b.0.total_cmp(&a.0));
            scored
        } else {
            candidates
                .filter(|doc| {
                    let doc_tokens: HashSet<String> = document_tokens(doc).into_iter().collect();
                    keyword_matches(&query, &doc_tokens)
                })
                .map(|doc| (1.0, doc))
                .collect()
        };

        let total_hits = scored.len();
        let hits = scored
            .drain(..)
            .skip(request.offset)
            .take(request.limit)
            .map(|(score, doc)| SearchHit {
                document: doc.clone(),
                score: Some(score),
            })
            .collect();

        Ok(SearchResponse { hits, total_hits })
    }

    async fn document_count(&self, index: &str) -> Result<usize> {
        let state = self.lock()?;
        let idx = state.indexes.get(index).ok_or_else(|| not_found(index))?;
        Ok(idx.documents.len())
    }
}

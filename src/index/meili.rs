//! Meilisearch over HTTP

use super::{
    IndexSettings, SearchEngine, SearchHit, SearchMode, SearchRequest, SearchResponse, TaskHandle,
    TaskStatus,
};
use crate::error::{ObsearchError, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;

/// Meilisearch client
pub struct MeiliEngine {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnqueuedTask {
    task_uid: u64,
}

#[derive(Deserialize)]
struct TaskView {
    status: String,
    #[serde(default)]
    error: Option<ErrorBody>,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchBody {
    hits: Vec<Map<String, Value>>,
    #[serde(default)]
    estimated_total_hits: Option<usize>,
    #[serde(default)]
    total_hits: Option<usize>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatsBody {
    number_of_documents: usize,
}

impl MeiliEngine {
    /// `request_timeout` bounds each HTTP exchange
    pub fn new(base_url: &str, api_key: Option<String>, request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(ObsearchError::Http)?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = self.authorized(request).send().await?;
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&text)
            .map(|body| body.message)
            .unwrap_or(text);
        Err(ObsearchError::Engine { status, message })
    }

    async fn enqueue(&self, request: RequestBuilder) -> Result<TaskHandle> {
        let task: EnqueuedTask = self.send(request).await?.json().await?;
        tracing::debug!("Enqueued engine task {}", task.task_uid);
        Ok(TaskHandle {
            uid: task.task_uid,
        })
    }
}

#[async_trait]
impl SearchEngine for MeiliEngine {
    async fn index_exists(&self, index: &str) -> Result<bool> {
        let request = self.client.get(self.url(&format!("/indexes/{}", index)));
        // 404 is the only answer that means "absent"
        match self.send(request).await {
            Ok(_) => Ok(true),
            Err(ObsearchError::Engine { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn create_index(&self, index: &str, primary_key: &str) -> Result<TaskHandle> {
        let request = self
            .client
            .post(self.url("/indexes"))
            .json(&json!({ "uid": index, "primaryKey": primary_key }));
        self.enqueue(request).await
    }

    async fn delete_index(&self, index: &str) -> Result<TaskHandle> {
        let request = self.client.delete(self.url(&format!("/indexes/{}", index)));
        self.enqueue(request).await
    }

    async fn update_settings(&self, index: &str, settings: &IndexSettings) -> Result<TaskHandle> {
        let request = self
            .client
            .patch(self.url(&format!("/indexes/{}/settings", index)))
            .json(&settings.to_json());
        self.enqueue(request).await
    }

    async fn add_documents(
        &self,
        index: &str,
        documents: &[Value],
        primary_key: &str,
    ) -> Result<TaskHandle> {
        let request = self
            .client
            .post(self.url(&format!("/indexes/{}/documents", index)))
            .query(&[("primaryKey", primary_key)])
            .json(documents);
        self.enqueue(request).await
    }

    async fn task_status(&self, task: TaskHandle) -> Result<TaskStatus> {
        let request = self.client.get(self.url(&format!("/tasks/{}", task.uid)));
        let view: TaskView = self.send(request).await?.json().await?;

        Ok(match view.status.as_str() {
            "enqueued" => TaskStatus::Enqueued,
            "processing" => TaskStatus::Processing,
            "succeeded" => TaskStatus::Succeeded,
            "canceled" => TaskStatus::Canceled,
            _ => TaskStatus::Failed(
                view.error
                    .map(|e| e.message)
                    .unwrap_or_else(|| format!("task ended with status '{}'", view.status)),
            ),
        })
    }

    async fn search(&self, index: &str, request: &SearchRequest) -> Result<SearchResponse> {
        let mut body = json!({
            "q": request.query,
            "limit": request.limit,
            "offset": request.offset,
            "showRankingScore": true,
        });
        if let Some(filter) = &request.filter {
            body["filter"] = Value::String(filter.clone());
        }
        // Pure vector ranking through the configured embedder
        if let SearchMode::Semantic { embedder } = &request.mode {
            body["hybrid"] = json!({ "embedder": embedder, "semanticRatio": 1.0 });
        }

        let http = self
            .client
            .post(self.url(&format!("/indexes/{}/search", index)))
            .json(&body);
        let result: SearchBody = self.send(http).await?.json().await?;

        // Exhaustive count when paging by page, estimate otherwise
        let total_hits = result
            .total_hits
            .or(result.estimated_total_hits)
            .unwrap_or(result.hits.len());
        let hits = result
            .hits
            .into_iter()
            .map(|mut document| {
                let score = document
                    .remove("_rankingScore")
                    .and_then(|v| v.as_f64())
                    .map(|s| s as f32);
                SearchHit { document, score }
            })
            .collect();

        Ok(SearchResponse { hits, total_hits })
    }

    async fn document_count(&self, index: &str) -> Result<usize> {
        let request = self.client.get(self.url(&format!("/indexes/{}/stats", index)));
        let stats: StatsBody = self.send(request).await?.json().await?;
        Ok(stats.number_of_documents)
    }
}

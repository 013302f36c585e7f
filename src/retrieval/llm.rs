//! Text completion capability

use crate::error::{ObsearchError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Prompt in, text out
#[async_trait]
pub trait TextCompletion: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// Ollama `/api/generate` without streaming
#[derive(Debug, Clone)]
pub struct OllamaCompletion {
    client: Client,
    base_url: String,
    model: String,
    temperature: f32,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

impl OllamaCompletion {
    pub fn new(base_url: &str, model: &str, temperature: f32, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ObsearchError::Http)?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            temperature,
        })
    }
}

#[async_trait]
impl TextCompletion for OllamaCompletion {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/api/generate", self.base_url);
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
            options: GenerateOptions {
                temperature: self.temperature,
            },
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| ObsearchError::Completion(format!("Failed to send request: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ObsearchError::Completion(format!(
                "HTTP {}: {}",
                status, error_text
            )));
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| ObsearchError::Completion(format!("Unreadable response: {}", e)))?;
        Ok(body.response)
    }
}

//! C1 — Embed Client, plus the sibling `generate` call used by the Router (C4).
//!
//! Both operations are thin wrappers around the external LLM runtime's HTTP surface (§6): one
//! round-trip per call, no retries here (retry policy is layered on the `reqwest_middleware`
//! client itself, following `indexer::embeddings`'s use of `reqwest_middleware` against the NN
//! server).

use std::time::Duration;

use reqwest_middleware::ClientWithMiddleware;
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use url::Url;

use crate::error::{EnrichError, Result};

/// Builds the `reqwest_middleware` client used for all runtime calls: a bounded timeout plus an
/// exponential-backoff retry policy for transient failures only (connection resets, 5xx).
pub fn build_runtime_client(timeout: Duration, max_retries: u32) -> ClientWithMiddleware {
    let retry_policy = ExponentialBackoff::builder().build_with_max_retries(max_retries);
    let inner = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .expect("reqwest client config is static and always valid");
    reqwest_middleware::ClientBuilder::new(inner)
        .with(RetryTransientMiddleware::new_with_policy(retry_policy))
        .build()
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Serialize)]
struct GenerateOptions<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
pub struct GenerateResponse {
    pub response: String,
    #[serde(default)]
    pub done: bool,
}

/// Client handle for the external LLM runtime. Cheap to clone (wraps an `Arc`-backed
/// `reqwest::Client` internally via `ClientWithMiddleware`).
#[derive(Clone)]
pub struct RuntimeClient {
    http: ClientWithMiddleware,
    base_url: Url,
}

impl RuntimeClient {
    pub fn new(http: ClientWithMiddleware, base_url: Url) -> Self {
        Self { http, base_url }
    }

    /// `embed(model, input) -> float[D]` for a single input string.
    pub async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>> {
        if text.is_empty() {
            return Err(EnrichError::InvalidResponse(
                "embed: input text must be non-empty".to_owned(),
            ));
        }
        let mut vectors = self.embed_batch(model, &[text.to_owned()]).await?;
        if vectors.len() != 1 {
            return Err(EnrichError::InvalidResponse(format!(
                "expected exactly 1 embedding, got {}",
                vectors.len()
            )));
        }
        Ok(vectors.remove(0))
    }

    /// `embedBatch(texts) -> float[D][]`.
    pub async fn embed_batch(&self, model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = self
            .base_url
            .join("api/embed")
            .map_err(|e| EnrichError::ConfigInvalid(e.to_string()))?;

        let response = self
            .http
            .post(url)
            .json(&json!({ "model": model, "input": texts }))
            .send()
            .await
            .map_err(|e| EnrichError::RuntimeUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(EnrichError::RuntimeUnavailable(format!(
                "embed: runtime returned status {}",
                response.status()
            )));
        }

        let body: EmbedResponse = response
            .json()
            .await
            .map_err(|e| EnrichError::InvalidResponse(e.to_string()))?;

        if body.embeddings.len() != texts.len() {
            return Err(EnrichError::InvalidResponse(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                body.embeddings.len()
            )));
        }
        Ok(body.embeddings)
    }

    /// `generate(model, prompt, { format }) -> { response, done }`.
    pub async fn generate(&self, model: &str, prompt: &str, json_format: bool) -> Result<Value> {
        let url = self
            .base_url
            .join("api/generate")
            .map_err(|e| EnrichError::ConfigInvalid(e.to_string()))?;

        let options = GenerateOptions {
            format: json_format.then_some("json"),
        };

        let response = self
            .http
            .post(url)
            .json(&json!({
                "model": model,
                "prompt": prompt,
                "stream": false,
                "format": options.format,
            }))
            .send()
            .await
            .map_err(|e| EnrichError::RuntimeUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(EnrichError::RuntimeUnavailable(format!(
                "generate: runtime returned status {}",
                response.status()
            )));
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| EnrichError::InvalidResponse(e.to_string()))?;

        Ok(json!({ "response": body.response, "done": body.done }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_runtime_client_does_not_panic() {
        let _ = build_runtime_client(Duration::from_secs(5), 2);
    }
}

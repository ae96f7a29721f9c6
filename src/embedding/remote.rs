//! OpenAI-compatible HTTP embedding provider.
//!
//! Requests are batched, retried with exponential backoff and, when a batch
//! keeps failing, retried one text at a time before giving up.

use super::provider::{EmbeddingError, EmbeddingProvider, ProviderIdentity};
use crate::config::ModelConfig;
use reqwest::Client;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

pub struct HttpEmbeddingProvider {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    dimension: usize,
    batch_size: usize,
    max_retries: u32,
}

impl HttpEmbeddingProvider {
    pub fn new(config: &ModelConfig, batch_size: usize) -> Result<Self, EmbeddingError> {
        let api_base = config
            .api_base
            .as_deref()
            .filter(|base| !base.is_empty())
            .ok_or_else(|| EmbeddingError::InitializationError("api_base is required".into()))?;

        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| EmbeddingError::InitializationError(e.to_string()))?;

        let api_key = config
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|key| !key.is_empty());

        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", api_base.trim_end_matches('/')),
            model: config.model.clone(),
            api_key,
            dimension: config.dimension,
            batch_size: batch_size.max(1),
            max_retries: config.max_retries,
        })
    }

    async fn request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
            "dimensions": self.dimension,
        });

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| EmbeddingError::Remote(format!("HTTP error: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::Remote(format!("API returned {status}: {body}")));
        }

        let json: Value = response
            .json()
            .await
            .map_err(|e| EmbeddingError::Remote(format!("JSON parse error: {e}")))?;

        let embeddings = parse_embedding_response(json)?;
        if embeddings.len() != texts.len() {
            return Err(EmbeddingError::Remote(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                embeddings.len()
            )));
        }
        for embedding in &embeddings {
            if embedding.len() != self.dimension {
                return Err(EmbeddingError::DimensionMismatch {
                    expected: self.dimension,
                    actual: embedding.len(),
                });
            }
        }
        Ok(embeddings)
    }

    async fn request_with_retry(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut last_err = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_millis(100 * 2u64.pow(attempt - 1));
                tokio::time::sleep(delay).await;
                debug!(attempt, "retrying embedding request");
            }

            match self.request(texts).await {
                Ok(embeddings) => return Ok(embeddings),
                Err(e) => {
                    warn!(attempt, error = %e, "embedding request failed");
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| EmbeddingError::Remote("all retries exhausted".into())))
    }

    async fn embed_all(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            match self.request_with_retry(batch).await {
                Ok(mut embeddings) => out.append(&mut embeddings),
                Err(batch_err) if batch.len() > 1 => {
                    warn!(error = %batch_err, "batch failed, embedding texts one by one");
                    for text in batch {
                        let mut single = self.request_with_retry(std::slice::from_ref(text)).await?;
                        out.append(&mut single);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }
}

/// Drive a future to completion from synchronous code.
///
/// Inside a runtime this must be called from a blocking-pool thread.
pub(crate) fn block_on<F: Future>(future: F) -> std::io::Result<F::Output> {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => Ok(handle.block_on(future)),
        Err(_) => {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            Ok(rt.block_on(future))
        }
    }
}

fn runtime_error(e: std::io::Error) -> EmbeddingError {
    EmbeddingError::Remote(format!("runtime error: {e}"))
}

impl EmbeddingProvider for HttpEmbeddingProvider {
    fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        block_on(self.embed_all(texts)).map_err(runtime_error)?
    }

    fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::InvalidInput("Empty text".to_string()));
        }
        let texts = [text.to_string()];
        block_on(self.request_with_retry(&texts)).map_err(runtime_error)??
            .pop()
            .ok_or_else(|| EmbeddingError::Remote("empty response".into()))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn identity(&self) -> ProviderIdentity {
        ProviderIdentity::new("http", &self.model, &self.endpoint)
    }
}

fn parse_embedding_response(json: Value) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let data = json
        .get("data")
        .and_then(|v| v.as_array())
        .ok_or_else(|| EmbeddingError::Remote("response is missing data array".into()))?;

    let mut indexed: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());
    for (fallback_index, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(fallback_index);
        let embedding = item
            .get("embedding")
            .and_then(|v| v.as_array())
            .ok_or_else(|| EmbeddingError::Remote("item missing embedding array".into()))?;
        let mut vec = Vec::with_capacity(embedding.len());
        for value in embedding {
            let number = value
                .as_f64()
                .ok_or_else(|| EmbeddingError::Remote("embedding value must be numeric".into()))?;
            vec.push(number as f32);
        }
        indexed.push((index, vec));
    }

    indexed.sort_by_key(|(index, _)| *index);

    Ok(indexed.into_iter().map(|(_, vec)| vec).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderKind;

    #[test]
    fn parses_embeddings_in_index_order() {
        let json = serde_json::json!({
            "data": [
                { "index": 1, "embedding": [2.0, 3.0] },
                { "index": 0, "embedding": [0.5, 1.5] }
            ]
        });
        let parsed = parse_embedding_response(json).unwrap();
        assert_eq!(parsed, vec![vec![0.5, 1.5], vec![2.0, 3.0]]);
    }

    #[test]
    fn rejects_non_numeric_values() {
        let json = serde_json::json!({ "data": [{ "embedding": ["x"] }] });
        assert!(parse_embedding_response(json).is_err());
    }

    #[test]
    fn requires_api_base() {
        let config = ModelConfig {
            provider: ProviderKind::Http,
            api_base: None,
            ..ModelConfig::default()
        };
        assert!(HttpEmbeddingProvider::new(&config, 8).is_err());
    }

    #[test]
    fn unreachable_endpoint_is_an_error() {
        let config = ModelConfig {
            provider: ProviderKind::Http,
            model: "text-embedding-3-small".into(),
            dimension: 8,
            api_base: Some("http://127.0.0.1:9".into()),
            api_key_env: None,
            timeout_ms: 200,
            max_retries: 0,
        };
        let provider = HttpEmbeddingProvider::new(&config, 8).unwrap();
        assert!(provider.embed_query("hello").is_err());
    }
}

//! Embedding adapter.
//!
//! [`Embedder`] is the seam between the pipelines and the embedding model:
//! batch mode for ingestion throughput, single mode for query latency.
//! [`HttpEmbedder`] calls an OpenAI-compatible `/embeddings` endpoint with
//! retry and exponential backoff:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use async_trait::async_trait;
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::{RagError, Result};

/// Interface to the embedding model. Assumed deterministic and stateless:
/// the same text always produces the same vector, so an index built at
/// ingestion time stays valid for every later query.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a single text. Query-time latency path.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch, one vector per input, same order. Ingestion
    /// throughput path.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Vector dimensionality produced by this embedder.
    fn dims(&self) -> usize;
}

/// Batch-embed chunks with per-item fallback.
///
/// Tries one batch call first. If the whole batch fails, retries each chunk
/// individually and drops only the chunks that individually fail, so the
/// returned chunk and vector sequences stay aligned row-for-row. Errors only
/// when the input is empty or every item fails.
pub async fn embed_chunks(
    embedder: &dyn Embedder,
    chunks: Vec<String>,
) -> Result<(Vec<String>, Vec<Vec<f32>>)> {
    if chunks.is_empty() {
        return Err(RagError::UpstreamModel("no chunks to embed".to_string()));
    }

    match embedder.embed_batch(&chunks).await {
        Ok(vectors) if vectors.len() == chunks.len() => Ok((chunks, vectors)),
        Ok(vectors) => Err(RagError::UpstreamModel(format!(
            "embedding batch returned {} vectors for {} inputs",
            vectors.len(),
            chunks.len()
        ))),
        Err(batch_err) => {
            tracing::warn!(error = %batch_err, "batch embedding failed, falling back to per-item");
            let mut kept = Vec::with_capacity(chunks.len());
            let mut vectors = Vec::with_capacity(chunks.len());
            for chunk in chunks {
                match embedder.embed(&chunk).await {
                    Ok(v) => {
                        kept.push(chunk);
                        vectors.push(v);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "dropping chunk that failed to embed");
                    }
                }
            }
            if vectors.is_empty() {
                return Err(RagError::UpstreamModel(
                    "every chunk failed to embed".to_string(),
                ));
            }
            Ok((kept, vectors))
        }
    }
}

/// Embedder backed by an OpenAI-compatible HTTP embeddings API.
pub struct HttpEmbedder {
    client: reqwest::Client,
    config: EmbeddingConfig,
    api_key: String,
}

impl HttpEmbedder {
    pub fn new(config: EmbeddingConfig) -> anyhow::Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| anyhow::anyhow!("{} environment variable not set", config.api_key_env))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            config,
            api_key,
        })
    }

    async fn request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.config.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.config.model,
            "input": texts,
        });

        let mut last_err = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(&url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response
                            .json()
                            .await
                            .map_err(|e| RagError::UpstreamModel(e.to_string()))?;
                        return parse_embeddings_response(&json, self.config.dims);
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let text = response.text().await.unwrap_or_default();
                        last_err = Some(format!("embeddings API error {}: {}", status, text));
                        continue;
                    }

                    let text = response.text().await.unwrap_or_default();
                    return Err(RagError::UpstreamModel(format!(
                        "embeddings API error {}: {}",
                        status, text
                    )));
                }
                Err(e) => {
                    last_err = Some(e.to_string());
                    continue;
                }
            }
        }

        Err(RagError::UpstreamModel(last_err.unwrap_or_else(|| {
            "embedding failed after retries".to_string()
        })))
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let vectors = self.request(std::slice::from_ref(&text.to_string())).await?;
        vectors
            .into_iter()
            .next()
            .ok_or_else(|| RagError::UpstreamModel("empty embedding response".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut all = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.config.batch_size) {
            all.extend(self.request(batch).await?);
        }
        Ok(all)
    }

    fn dims(&self) -> usize {
        self.config.dims
    }
}

/// Extract `data[].embedding` arrays in input order.
fn parse_embeddings_response(json: &serde_json::Value, dims: usize) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| RagError::UpstreamModel("invalid response: missing data array".to_string()))?;

    let mut embeddings = Vec::with_capacity(data.len());
    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| {
                RagError::UpstreamModel("invalid response: missing embedding".to_string())
            })?;

        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();

        if vec.len() != dims {
            return Err(RagError::UpstreamModel(format!(
                "embedding has {} dims, expected {}",
                vec.len(),
                dims
            )));
        }
        embeddings.push(vec);
    }

    Ok(embeddings)
}

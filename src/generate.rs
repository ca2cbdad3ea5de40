//! Streaming text generation adapter.
//!
//! [`Generator`] models generation as a finite, non-restartable sequence:
//! zero or more text increments in order, then completion or an error item.
//! [`HttpGenerator`] calls an OpenAI-compatible chat completions endpoint
//! with `stream: true` and relays SSE `data:` increments as they arrive.
//! Dropping the stream drops the upstream request, so client disconnects
//! stop generation instead of producing a discarded answer.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::GenerationConfig;
use crate::error::{RagError, Result};

/// Finite stream of generated text increments.
pub type TokenStream = BoxStream<'static, Result<String>>;

#[async_trait]
pub trait Generator: Send + Sync {
    /// Start streaming a completion for `prompt`.
    async fn stream(&self, prompt: &str) -> Result<TokenStream>;
}

/// Generator backed by an OpenAI-compatible streaming chat API.
pub struct HttpGenerator {
    client: reqwest::Client,
    config: GenerationConfig,
    api_key: String,
}

impl HttpGenerator {
    pub fn new(config: GenerationConfig) -> anyhow::Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| anyhow::anyhow!("{} environment variable not set", config.api_key_env))?;

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            config,
            api_key,
        })
    }
}

#[async_trait]
impl Generator for HttpGenerator {
    async fn stream(&self, prompt: &str) -> Result<TokenStream> {
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let body = serde_json::json!({
            "model": self.config.model,
            "messages": [{"role": "user", "content": prompt}],
            "stream": true,
        });

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| RagError::UpstreamModel(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RagError::UpstreamModel(format!(
                "generation API error {}: {}",
                status, text
            )));
        }

        let (tx, rx) = mpsc::channel::<Result<String>>(32);
        let mut bytes = response.bytes_stream();

        tokio::spawn(async move {
            let mut buffer = String::new();
            while let Some(item) = bytes.next().await {
                let chunk = match item {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx.send(Err(RagError::UpstreamModel(e.to_string()))).await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);

                    let Some(payload) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let payload = payload.trim();
                    if payload == "[DONE]" {
                        return;
                    }
                    if let Some(text) = extract_delta(payload) {
                        if !text.is_empty() && tx.send(Ok(text)).await.is_err() {
                            // Receiver dropped: client disconnected, stop
                            // consuming upstream tokens.
                            return;
                        }
                    }
                }
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }
}

/// Pull `choices[0].delta.content` out of a streamed chunk payload.
fn extract_delta(payload: &str) -> Option<String> {
    let json: serde_json::Value = serde_json::from_str(payload).ok()?;
    json.get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()
        .map(|s| s.to_string())
}

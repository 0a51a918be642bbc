//! Chat completion providers
//!
//! The completion service is an external collaborator: an opaque
//! token-stream behind [`CompletionProvider`]. The HTTP implementation
//! streams from the Anthropic Messages API; the fallback produces a
//! deterministic word-by-word stream so the chat surface keeps working
//! without a key (and so tests have a provider with no network at all).
//!
//! Cancellation is cooperative: providers stop generating as soon as the
//! token channel closes.

use crate::error::{Result, TraceryError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::StreamExt as _;
use tracing::{debug, warn};

/// Configuration for the HTTP completion provider
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Anthropic API key
    pub api_key: String,

    /// Model to use
    pub model: String,

    /// Max tokens for responses
    pub max_tokens: usize,

    /// Temperature for sampling
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: env::var("ANTHROPIC_API_KEY").unwrap_or_default(),
            model: "claude-3-5-haiku-20241022".to_string(),
            max_tokens: 512,
            temperature: 0.7,
        }
    }
}

/// Opaque token-stream completion service
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Stream token deltas for `prompt` into `tx`. Returns when generation
    /// completes or when `tx` closes (the client cancelled).
    async fn stream_completion(&self, prompt: &str, tx: mpsc::Sender<String>) -> Result<()>;

    fn name(&self) -> &'static str;
}

/// Pick a provider: the HTTP provider when a key is configured, otherwise
/// the deterministic fallback
pub fn provider_from_env() -> Arc<dyn CompletionProvider> {
    let config = LlmConfig::default();
    if config.api_key.is_empty() {
        warn!("ANTHROPIC_API_KEY not set; using fallback completion provider");
        Arc::new(FallbackProvider::default())
    } else {
        Arc::new(AnthropicProvider::new(config))
    }
}

/// Anthropic API message format
#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: usize,
    temperature: f32,
    stream: bool,
    messages: Vec<Message>,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

/// One SSE frame of the streaming response; only delta frames carry text
#[derive(Debug, Deserialize)]
struct StreamFrame {
    #[serde(rename = "type")]
    frame_type: String,
    #[serde(default)]
    delta: Option<Delta>,
}

#[derive(Debug, Deserialize)]
struct Delta {
    #[serde(default)]
    text: Option<String>,
}

/// Streaming completion over the Anthropic Messages API
pub struct AnthropicProvider {
    config: LlmConfig,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl CompletionProvider for AnthropicProvider {
    async fn stream_completion(&self, prompt: &str, tx: mpsc::Sender<String>) -> Result<()> {
        let request = AnthropicRequest {
            model: self.config.model.clone(),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            stream: true,
            messages: vec![Message {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
        };

        let response = self
            .client
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(TraceryError::Other(format!(
                "completion request failed with status {}: {}",
                status, error_text
            )));
        }

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(newline) = buffer.find('\n') {
                let line: String = buffer.drain(..=newline).collect();
                let line = line.trim();

                let data = match line.strip_prefix("data: ") {
                    Some(data) => data,
                    None => continue,
                };

                let frame = match serde_json::from_str::<StreamFrame>(data) {
                    Ok(frame) => frame,
                    Err(_) => continue,
                };

                match frame.frame_type.as_str() {
                    "content_block_delta" => {
                        if let Some(text) = frame.delta.and_then(|d| d.text) {
                            if tx.send(text).await.is_err() {
                                debug!("completion cancelled by client; stopping stream");
                                return Ok(());
                            }
                        }
                    }
                    "message_stop" => return Ok(()),
                    _ => {}
                }
            }
        }

        Ok(())
    }

    fn name(&self) -> &'static str {
        "anthropic"
    }
}

/// Deterministic word-by-word stream used when no key is configured
pub struct FallbackProvider {
    delay: Duration,
}

impl Default for FallbackProvider {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(30),
        }
    }
}

impl FallbackProvider {
    /// A fallback with no inter-token delay (tests)
    pub fn instant() -> Self {
        Self {
            delay: Duration::ZERO,
        }
    }
}

#[async_trait]
impl CompletionProvider for FallbackProvider {
    async fn stream_completion(&self, prompt: &str, tx: mpsc::Sender<String>) -> Result<()> {
        let text = format!(
            "No completion provider is configured, so this is a canned reply. \
             (Received message: {})",
            prompt
        );

        for (i, word) in text.split_whitespace().enumerate() {
            let delta = if i == 0 {
                word.to_string()
            } else {
                format!(" {}", word)
            };

            if tx.send(delta).await.is_err() {
                debug!("fallback stream cancelled by client");
                return Ok(());
            }

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
        }

        Ok(())
    }

    fn name(&self) -> &'static str {
        "fallback"
    }
}

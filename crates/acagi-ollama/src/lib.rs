use acagi_conversation::Embedder;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

const CHAT_TIMEOUT_SECS: u64 = 600;
const EMBED_TIMEOUT_SECS: u64 = 120;
const HEALTH_TIMEOUT_SECS: u64 = 3;

#[derive(Debug, Error)]
pub enum OllamaError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("runtime rejected request ({status}): {body}")]
    Api { status: u16, body: String },
    #[error("runtime returned an empty reply")]
    EmptyReply,
}

#[derive(Debug, Clone)]
pub struct OllamaConfig {
    pub base_url: String,
    pub chat_model: String,
    pub embed_model: String,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:11434".to_string(),
            chat_model: "llama3.1".to_string(),
            embed_model: "nomic-embed-text".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant".to_string(), content: content.into() }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    message: Option<ChatMessage>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    #[serde(default)]
    embedding: Vec<f32>,
    #[serde(default)]
    error: Option<String>,
}

/// Blocking client for a local Ollama-compatible runtime. Every call carries
/// a hard timeout; callers run these on worker threads, never on the UI task.
pub struct OllamaClient {
    config: OllamaConfig,
    chat_http: reqwest::blocking::Client,
    embed_http: reqwest::blocking::Client,
    health_http: reqwest::blocking::Client,
}

impl OllamaClient {
    pub fn new(config: OllamaConfig) -> Result<Self, OllamaError> {
        let chat_http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(CHAT_TIMEOUT_SECS))
            .build()?;
        let embed_http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(EMBED_TIMEOUT_SECS))
            .build()?;
        let health_http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(HEALTH_TIMEOUT_SECS))
            .build()?;
        Ok(Self { config, chat_http, embed_http, health_http })
    }

    pub fn config(&self) -> &OllamaConfig {
        &self.config
    }

    pub fn chat(&self, messages: &[ChatMessage]) -> Result<String, OllamaError> {
        let url = format!("{}/api/chat", self.config.base_url);
        let body = json!({
            "model": self.config.chat_model,
            "messages": messages,
            "stream": false,
        });
        debug!(event = "ollama_chat", model = %self.config.chat_model, turns = messages.len());
        let response = self.chat_http.post(&url).json(&body).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(OllamaError::Api {
                status: status.as_u16(),
                body: response.text().unwrap_or_default(),
            });
        }
        let parsed: ChatResponse = response.json()?;
        if let Some(error) = parsed.error {
            return Err(OllamaError::Api { status: status.as_u16(), body: error });
        }
        match parsed.message {
            Some(message) if !message.content.trim().is_empty() => Ok(message.content),
            _ => Err(OllamaError::EmptyReply),
        }
    }

    pub fn embeddings(&self, text: &str) -> Result<Vec<f32>, OllamaError> {
        let url = format!("{}/api/embeddings", self.config.base_url);
        let body = json!({
            "model": self.config.embed_model,
            "prompt": text,
        });
        let response = self.embed_http.post(&url).json(&body).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(OllamaError::Api {
                status: status.as_u16(),
                body: response.text().unwrap_or_default(),
            });
        }
        let parsed: EmbeddingsResponse = response.json()?;
        if let Some(error) = parsed.error {
            return Err(OllamaError::Api { status: status.as_u16(), body: error });
        }
        if parsed.embedding.is_empty() {
            return Err(OllamaError::EmptyReply);
        }
        Ok(parsed.embedding)
    }

    pub fn health(&self) -> bool {
        match self.health_http.get(&self.config.base_url).send() {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                warn!(event = "ollama_health_failed", error = %err);
                false
            }
        }
    }
}

impl Embedder for OllamaClient {
    fn embed(&self, text: &str) -> Result<Vec<f32>, String> {
        self.embeddings(text).map_err(|err| err.to_string())
    }
}

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{estimate_tokens, Completion, GenerationError, TextGenerator};

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: Option<u32>,
    temperature: f32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

/// Text generator that calls an OpenAI-compatible `/chat/completions` endpoint
/// (vLLM, Groq, OpenAI).
pub struct HttpChatGenerator {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    max_tokens: u32,
    deterministic: bool,
    seed: Option<u64>,
}

impl HttpChatGenerator {
    pub fn new(base_url: String, model: String, deterministic: bool, seed: Option<u64>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            model,
            api_key: None,
            max_tokens: 1024,
            deterministic,
            seed,
        }
    }

    pub fn with_api_key(mut self, key: Option<String>) -> Self {
        self.api_key = key.filter(|k| !k.is_empty());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Applies a client-side request timeout on top of the loop's own deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        if let Ok(client) = reqwest::Client::builder().timeout(timeout).build() {
            self.client = client;
        }
        self
    }
}

#[async_trait]
impl TextGenerator for HttpChatGenerator {
    async fn complete(&self, prompt: &str) -> Result<Completion, GenerationError> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));

        let body = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            max_tokens: Some(self.max_tokens),
            temperature: if self.deterministic { 0.0 } else { 0.1 },
            stream: false,
            seed: if self.deterministic { self.seed } else { None },
        };

        let mut req = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                GenerationError::Timeout
            } else {
                GenerationError::Transport(format!("HTTP error: {e}"))
            }
        })?;

        if !resp.status().is_success() {
            return Err(GenerationError::Transport(format!(
                "HTTP status: {}",
                resp.status()
            )));
        }

        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| GenerationError::Malformed(e.to_string()))?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| GenerationError::Malformed("empty completion".into()))?;

        tracing::debug!(model = %self.model, chars = text.len(), "completion received");

        let (prompt_tokens, completion_tokens) = match parsed.usage {
            Some(u) => (u.prompt_tokens, u.completion_tokens),
            None => (estimate_tokens(prompt), estimate_tokens(&text)),
        };

        Ok(Completion {
            text,
            prompt_tokens,
            completion_tokens,
        })
    }
}

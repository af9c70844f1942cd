use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub mod http_chat;
pub use http_chat::HttpChatGenerator;

/// Text returned by a generation call, with token accounting for cost tracking.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl Completion {
    /// Builds a completion with token counts estimated at four characters per token.
    pub fn estimated(prompt: &str, text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            prompt_tokens: estimate_tokens(prompt),
            completion_tokens: estimate_tokens(&text),
            text,
        }
    }
}

pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GenerationError {
    #[error("text generation not configured")]
    NotConfigured,
    #[error("text generation timed out")]
    Timeout,
    #[error("text generation transport error: {0}")]
    Transport(String),
    #[error("malformed generation output: {0}")]
    Malformed(String),
}

/// External text-generation service. Its output is a candidate, never trusted.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<Completion, GenerationError>;
}

/// Generator used when no model is configured: every call fails, which sends
/// the loop straight to its deterministic fallback.
pub struct NullGenerator;

#[async_trait]
impl TextGenerator for NullGenerator {
    async fn complete(&self, _prompt: &str) -> Result<Completion, GenerationError> {
        Err(GenerationError::NotConfigured)
    }
}

/// Replays a fixed queue of responses and records the prompts it was given.
pub struct ScriptedGenerator {
    responses: Mutex<VecDeque<Result<String, GenerationError>>>,
    prompts: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl ScriptedGenerator {
    pub fn new<I>(responses: I) -> Self
    where
        I: IntoIterator<Item = Result<String, GenerationError>>,
    {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            prompts: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// Convenience constructor for a script of successful completions.
    pub fn replies<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(replies.into_iter().map(|r| Ok(r.into())))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Prompts received so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().map(|p| p.len()).unwrap_or(0)
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn complete(&self, prompt: &str) -> Result<Completion, GenerationError> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self
            .responses
            .lock()
            .map_err(|_| GenerationError::Transport("script lock poisoned".into()))?
            .pop_front()
            .unwrap_or_else(|| Err(GenerationError::Transport("script exhausted".into())));
        next.map(|text| Completion::estimated(prompt, text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_generator_replays_in_order() {
        let gen = ScriptedGenerator::replies(["one", "two"]);
        assert_eq!(gen.complete("p1").await.unwrap().text, "one");
        assert_eq!(gen.complete("p2").await.unwrap().text, "two");
        assert!(gen.complete("p3").await.is_err());
        assert_eq!(gen.prompts(), vec!["p1", "p2", "p3"]);
    }

    #[tokio::test]
    async fn null_generator_is_not_configured() {
        assert_eq!(
            NullGenerator.complete("x").await,
            Err(GenerationError::NotConfigured)
        );
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}

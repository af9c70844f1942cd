use std::sync::Arc;

use warden_embed::{cosine_similarity, EmbedError, Embedder};

use crate::store::ActivePolicy;

#[derive(Clone, Debug, PartialEq)]
pub enum SemanticVerdict {
    /// Highest topic similarity stayed at or below the threshold.
    Clear { score: f32 },
    Blocked { topic: String, score: f32 },
    /// The check did not run; the request is not blocked by it.
    Skipped { reason: String },
    /// The embedding service failed and the policy is fail-closed.
    Unavailable { reason: String },
}

/// Off-topic detection by embedding similarity against the blocked topics.
pub struct SemanticGuardrail {
    embedder: Arc<dyn Embedder>,
}

impl SemanticGuardrail {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self { embedder }
    }

    pub async fn evaluate(&self, policy: &ActivePolicy, text: &str) -> SemanticVerdict {
        let config = &policy.config;
        if !config.enable_content_guardrails {
            return SemanticVerdict::Skipped {
                reason: "content guardrails disabled".into(),
            };
        }
        if config.blocked_topics.is_empty() {
            return SemanticVerdict::Clear { score: 0.0 };
        }

        match self.score(policy, text).await {
            Ok((idx, score)) if score > config.similarity_threshold => SemanticVerdict::Blocked {
                topic: config.blocked_topics[idx].clone(),
                score,
            },
            Ok((_, score)) => SemanticVerdict::Clear { score },
            Err(err) if config.semantic_fail_open => {
                tracing::warn!(error = %err, "semantic check skipped: embedding unavailable");
                SemanticVerdict::Skipped {
                    reason: err.to_string(),
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "semantic check failed closed");
                SemanticVerdict::Unavailable {
                    reason: err.to_string(),
                }
            }
        }
    }

    /// Index and similarity of the closest blocked topic.
    async fn score(&self, policy: &ActivePolicy, text: &str) -> Result<(usize, f32), EmbedError> {
        let topics = policy
            .topic_embeddings
            .get_or_try_init(|| async {
                let mut out = Vec::with_capacity(policy.config.blocked_topics.len());
                for topic in &policy.config.blocked_topics {
                    out.push(self.embedder.embed(topic).await?);
                }
                Ok::<_, EmbedError>(out)
            })
            .await?;
        let request = self.embedder.embed(text).await?;
        Ok(topics
            .iter()
            .enumerate()
            .map(|(i, t)| (i, cosine_similarity(&request, t)))
            .fold((0, f32::MIN), |best, cur| if cur.1 > best.1 { cur } else { best }))
    }
}

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::Mutex;
use warden_embed::{cosine_similarity, Embedder};
use warden_types::DataSignature;

pub const DEFAULT_CACHE_THRESHOLD: f32 = 0.95;
pub const DEFAULT_CACHE_CAPACITY: usize = 256;

/// A verified answer served again for a near-identical request.
#[derive(Clone, Debug, PartialEq)]
pub struct CachedAnswer {
    /// The request the answer was first produced for.
    pub request_text: String,
    pub statement_text: String,
    pub answer_text: String,
    pub data: DataSignature,
    pub similarity: f32,
}

struct CacheEntry {
    embedding: Vec<f32>,
    answer: CachedAnswer,
}

/// Verified answers keyed by request embedding. Oldest entries are evicted
/// first once `capacity` is reached.
pub struct SemanticCache {
    embedder: Arc<dyn Embedder>,
    threshold: f32,
    capacity: usize,
    entries: Mutex<VecDeque<CacheEntry>>,
}

impl SemanticCache {
    pub fn new(embedder: Arc<dyn Embedder>, threshold: f32, capacity: usize) -> Self {
        Self {
            embedder,
            threshold,
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Best entry at or above the threshold. Embedding failures are a miss.
    pub async fn lookup(&self, request_text: &str) -> Option<CachedAnswer> {
        let query = self.embed(request_text).await?;
        let entries = self.entries.lock().await;
        entries
            .iter()
            .map(|e| (cosine_similarity(&query, &e.embedding), e))
            .filter(|(score, _)| *score >= self.threshold)
            .max_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(similarity, e)| CachedAnswer {
                similarity,
                ..e.answer.clone()
            })
    }

    /// Stores an answer unless a near-identical request is already cached.
    pub async fn store(&self, request_text: &str, statement_text: &str, answer_text: &str, data: DataSignature) {
        let Some(embedding) = self.embed(request_text).await else {
            return;
        };
        let mut entries = self.entries.lock().await;
        if entries
            .iter()
            .any(|e| cosine_similarity(&embedding, &e.embedding) >= self.threshold)
        {
            return;
        }
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(CacheEntry {
            embedding,
            answer: CachedAnswer {
                request_text: request_text.to_string(),
                statement_text: statement_text.to_string(),
                answer_text: answer_text.to_string(),
                data,
                similarity: 1.0,
            },
        });
        tracing::debug!(request = request_text, cached = entries.len(), "answer cached");
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    async fn embed(&self, text: &str) -> Option<Vec<f32>> {
        match self.embedder.embed(text).await {
            Ok(v) => Some(v),
            Err(err) => {
                tracing::debug!(error = %err, "semantic cache skipped");
                None
            }
        }
    }
}

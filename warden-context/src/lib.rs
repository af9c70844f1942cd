use std::fs;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use warden_embed::{cosine_similarity, EmbedError, Embedder};
use warden_types::{ContextEntry, EntityKind, RetrievedContext};

pub mod select;
pub use select::{Candidate, ContextSelector, FacilityLocationSelector, Selection, SelectionBudget};

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("catalog io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("catalog parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbedError),
}

/// Returns ranked schema/metric definitions for a request. Empty is a valid answer.
#[async_trait]
pub trait ContextRetriever: Send + Sync {
    async fn retrieve(&self, request_text: &str) -> Result<RetrievedContext, RetrievalError>;
}

/// Retriever with nothing to offer; the loop runs in degraded-context mode.
pub struct NullRetriever;

#[async_trait]
impl ContextRetriever for NullRetriever {
    async fn retrieve(&self, _request_text: &str) -> Result<RetrievedContext, RetrievalError> {
        Ok(RetrievedContext::empty())
    }
}

/// Semantic catalog document (YAML): a flat list of entity definitions.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub entries: Vec<ContextEntry>,
}

impl Catalog {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, RetrievalError> {
        let text = fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&text)?)
    }
}

#[derive(Clone, Debug)]
pub struct RetrieverSettings {
    /// Maximum number of entries returned.
    pub top_k: usize,
    /// Token budget across returned definitions.
    pub max_tokens: usize,
    /// Entries scoring at or below this (after boosting) are dropped.
    pub min_relevance: f32,
    /// Weight of relevance against coverage in diversity selection.
    pub gamma: f32,
}

impl Default for RetrieverSettings {
    fn default() -> Self {
        Self {
            top_k: 5,
            max_tokens: 1500,
            min_relevance: 0.05,
            gamma: 2.0,
        }
    }
}

/// Multiplier applied to cosine relevance per entity kind.
pub fn kind_boost(kind: EntityKind) -> f32 {
    match kind {
        EntityKind::Metric => 1.3,
        EntityKind::Table => 1.2,
        EntityKind::Relationship => 0.9,
    }
}

struct IndexedEntry {
    entry: ContextEntry,
    embedding: Vec<f32>,
    tokens: usize,
}

/// In-process retriever over a semantic catalog: embedding relevance, kind boost,
/// then facility-location selection for a diverse ranked subset.
pub struct CatalogRetriever {
    embedder: Arc<dyn Embedder>,
    entries: Vec<IndexedEntry>,
    selector: FacilityLocationSelector,
    settings: RetrieverSettings,
}

impl CatalogRetriever {
    pub async fn build(
        catalog: Catalog,
        embedder: Arc<dyn Embedder>,
        settings: RetrieverSettings,
    ) -> Result<Self, RetrievalError> {
        let mut entries = Vec::with_capacity(catalog.entries.len());
        for entry in catalog.entries {
            let text = format!("{} {}", entry.entity_name, entry.definition);
            let embedding = embedder.embed(&text).await?;
            let tokens = (text.chars().count() / 4).max(1);
            entries.push(IndexedEntry {
                entry,
                embedding,
                tokens,
            });
        }
        tracing::debug!(entries = entries.len(), "catalog indexed");
        Ok(Self {
            embedder,
            entries,
            selector: FacilityLocationSelector::new(settings.gamma),
            settings,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl ContextRetriever for CatalogRetriever {
    async fn retrieve(&self, request_text: &str) -> Result<RetrievedContext, RetrievalError> {
        if self.entries.is_empty() {
            return Ok(RetrievedContext::empty());
        }
        let query = self.embedder.embed(request_text).await?;

        let mut pool: Vec<(usize, f32)> = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| {
                let score = cosine_similarity(&query, &e.embedding) * kind_boost(e.entry.entity_kind);
                (i, score)
            })
            .filter(|(_, score)| *score > self.settings.min_relevance)
            .collect();
        pool.sort_by(|a, b| b.1.total_cmp(&a.1));
        // Selection is quadratic in the pool size.
        pool.truncate(self.settings.top_k * 4);

        let candidates: Vec<Candidate<'_>> = pool
            .iter()
            .map(|&(i, relevance)| Candidate {
                tokens: self.entries[i].tokens,
                embedding: &self.entries[i].embedding,
                relevance,
            })
            .collect();

        let budget = SelectionBudget {
            max_tokens: self.settings.max_tokens,
            max_items: self.settings.top_k,
        };
        let selection = self.selector.select(&candidates, budget);
        let entries = selection
            .indices
            .iter()
            .map(|&c| self.entries[pool[c].0].entry.clone())
            .collect();
        Ok(RetrievedContext::new(entries))
    }
}

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use warden_context::{Catalog, CatalogRetriever, ContextRetriever, NullRetriever, RetrieverSettings};
use warden_embed::{Embedder, HashEmbedder, HttpEmbedder};
use warden_feedback::FeedbackLedger;
use warden_infer::{HttpChatGenerator, NullGenerator, TextGenerator};
use warden_memory::ConversationMemory;
use warden_policy::{ControlPlane, KillSwitch, PolicyDocument};
use warden_store::{DataBackend, FixtureBackend, NullBackend, ReadOnlyBackend, SqliteBackend};

use crate::cache::SemanticCache;
use crate::config::WardenConfig;
use crate::fallback::FallbackCatalog;
use crate::Warden;

pub fn embedder_from_config(config: &WardenConfig) -> Arc<dyn Embedder> {
    match &config.embedding.base_url {
        Some(url) => Arc::new(HttpEmbedder::new(url.clone(), config.embedding.model.clone())),
        None => Arc::new(HashEmbedder::new(config.embedding.dim)),
    }
}

pub fn generator_from_config(config: &WardenConfig, timeout: Duration) -> Arc<dyn TextGenerator> {
    let llm = &config.llm;
    match &llm.base_url {
        Some(url) if !llm.stub => {
            tracing::info!(url = %url, model = %llm.model, deterministic = llm.deterministic, "using HTTP text generator");
            Arc::new(
                HttpChatGenerator::new(url.clone(), llm.model.clone(), llm.deterministic, llm.seed)
                    .with_api_key(llm.api_key.clone())
                    .with_max_tokens(config.cost.max_completion_tokens)
                    .with_timeout(timeout),
            )
        }
        _ => {
            tracing::info!("no text generator configured; answering from predefined queries");
            Arc::new(NullGenerator)
        }
    }
}

/// Read-only backend: the SQLite database if configured, else fixture rules,
/// else nothing.
pub fn backend_from_config(config: &WardenConfig) -> anyhow::Result<Arc<dyn DataBackend>> {
    let execution = &config.execution;
    if let Some(path) = &execution.database {
        let database = SqliteBackend::open(path)
            .with_context(|| format!("opening database {}", path.display()))?;
        return Ok(Arc::new(ReadOnlyBackend::new(database)));
    }
    match &execution.fixtures {
        Some(path) => {
            let fixtures = FixtureBackend::from_yaml_path(path)
                .with_context(|| format!("loading fixtures from {}", path.display()))?;
            Ok(Arc::new(ReadOnlyBackend::new(fixtures)))
        }
        None => Ok(Arc::new(ReadOnlyBackend::new(NullBackend))),
    }
}

pub fn policy_document(config: &WardenConfig) -> anyhow::Result<PolicyDocument> {
    match &config.policy.path {
        Some(path) => PolicyDocument::from_path(path)
            .with_context(|| format!("loading policy from {}", path.display())),
        None => {
            config.policy.inline.validate()?;
            Ok(PolicyDocument {
                version: 1,
                policy: config.policy.inline.clone(),
            })
        }
    }
}

async fn retriever_from_config(
    config: &WardenConfig,
    embedder: Arc<dyn Embedder>,
) -> anyhow::Result<Arc<dyn ContextRetriever>> {
    let Some(path) = &config.catalog.path else {
        return Ok(Arc::new(NullRetriever));
    };
    let catalog = Catalog::from_path(path)
        .with_context(|| format!("loading catalog from {}", path.display()))?;
    let settings = RetrieverSettings {
        top_k: config.catalog.top_k,
        max_tokens: config.catalog.max_tokens,
        min_relevance: config.catalog.min_relevance,
        ..RetrieverSettings::default()
    };
    match CatalogRetriever::build(catalog, embedder, settings).await {
        Ok(retriever) => Ok(Arc::new(retriever)),
        Err(err) => {
            // Requests still run, in degraded-context mode.
            tracing::warn!(error = %err, "catalog could not be indexed");
            Ok(Arc::new(NullRetriever))
        }
    }
}

/// Wires every plane from configuration. The kill switch is passed in so the
/// host can hand the same handle to its admin surface.
pub async fn build_warden(
    config: &WardenConfig,
    kill_switch: KillSwitch,
    backend: Arc<dyn DataBackend>,
) -> anyhow::Result<Warden> {
    let embedder = embedder_from_config(config);
    let document = policy_document(config)?;
    let generation_timeout = Duration::from_millis(document.policy.generation_timeout_ms);
    let control = ControlPlane::from_document(document, kill_switch, Arc::clone(&embedder))?;
    let retriever = retriever_from_config(config, Arc::clone(&embedder)).await?;
    let generator = generator_from_config(config, generation_timeout);
    let memory = ConversationMemory::new(config.memory.max_sessions);
    let feedback = match &config.feedback.path {
        Some(path) => FeedbackLedger::open(path)
            .with_context(|| format!("opening feedback ledger {}", path.display()))?,
        None => FeedbackLedger::in_memory(),
    };

    let mut warden = Warden::new(
        Arc::new(control),
        retriever,
        generator,
        backend,
        Arc::new(memory),
        Arc::new(feedback),
    );
    if config.cache.enabled {
        warden = warden.with_cache(SemanticCache::new(
            embedder,
            config.cache.threshold,
            config.cache.capacity,
        ));
    }

    Ok(warden
        .with_fallbacks(FallbackCatalog::new(
            config.fallbacks.patterns.clone(),
            config.fallbacks.default_statement.clone(),
        ))
        .with_cost_model(config.cost.clone())
        .with_max_display_rows(config.execution.max_display_rows))
}

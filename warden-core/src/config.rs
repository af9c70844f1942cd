use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use warden_policy::PolicyConfig;

use crate::cost::CostModel;
use crate::fallback::FallbackPattern;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    /// OpenAI-compatible base URL. Unset means no generator: fallbacks only.
    pub base_url: Option<String>,
    pub model: String,
    pub api_key: Option<String>,
    pub deterministic: bool,
    pub seed: Option<u64>,
    /// Force the null generator even when a URL is configured.
    pub stub: bool,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            model: "gpt-4o-mini".into(),
            api_key: None,
            deterministic: true,
            seed: None,
            stub: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    /// OpenAI-compatible base URL. Unset means the local hashing embedder.
    pub base_url: Option<String>,
    pub model: String,
    pub dim: usize,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            model: "text-embedding-3-small".into(),
            dim: 1024,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSettings {
    /// Rows rendered into the answer table.
    pub max_display_rows: usize,
    /// SQLite database, opened read-only. Takes precedence over `fixtures`.
    pub database: Option<PathBuf>,
    /// YAML fixture file for the demo backend.
    pub fixtures: Option<PathBuf>,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            max_display_rows: 10,
            database: None,
            fixtures: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    /// Cosine similarity a new request needs to reuse a cached answer.
    pub threshold: f32,
    pub capacity: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: crate::cache::DEFAULT_CACHE_THRESHOLD,
            capacity: crate::cache::DEFAULT_CACHE_CAPACITY,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackSettings {
    /// JSONL ledger. Unset keeps feedback in memory only.
    pub path: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySettings {
    pub max_sessions: usize,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            max_sessions: warden_memory::DEFAULT_MAX_SESSIONS,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogSettings {
    pub path: Option<PathBuf>,
    pub top_k: usize,
    pub max_tokens: usize,
    pub min_relevance: f32,
}

impl Default for CatalogSettings {
    fn default() -> Self {
        let defaults = warden_context::RetrieverSettings::default();
        Self {
            path: None,
            top_k: defaults.top_k,
            max_tokens: defaults.max_tokens,
            min_relevance: defaults.min_relevance,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackSettings {
    pub patterns: Vec<FallbackPattern>,
    /// Statement used when no pattern matches. Unset means no default.
    pub default_statement: Option<String>,
}

impl Default for FallbackSettings {
    fn default() -> Self {
        let catalog = crate::fallback::FallbackCatalog::sales_star_schema();
        Self {
            patterns: catalog.patterns().to_vec(),
            default_statement: catalog.default_statement().map(str::to_string),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySettings {
    /// Versioned policy document (YAML or JSON). Takes precedence over `inline`.
    pub path: Option<PathBuf>,
    pub inline: PolicyConfig,
}

/// Runtime configuration of the whole service.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    pub llm: LlmSettings,
    pub embedding: EmbeddingSettings,
    pub execution: ExecutionSettings,
    pub cache: CacheSettings,
    pub feedback: FeedbackSettings,
    pub memory: MemorySettings,
    pub cost: CostModel,
    pub catalog: CatalogSettings,
    pub fallbacks: FallbackSettings,
    pub policy: PolicySettings,
}

impl WardenConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&text)?)
    }

    /// Reads `WARDEN_CONFIG` if set, otherwise defaults, then applies the
    /// `WARDEN_*` overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("WARDEN_CONFIG") {
            Ok(path) if !path.is_empty() => Self::from_path(path)?,
            _ => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(url) = var("WARDEN_LLM_URL").filter(|v| !v.is_empty()) {
            self.llm.base_url = Some(url);
        }
        if let Some(model) = var("WARDEN_LLM_MODEL").filter(|v| !v.is_empty()) {
            self.llm.model = model;
        }
        if let Some(key) = var("WARDEN_LLM_API_KEY").filter(|v| !v.is_empty()) {
            self.llm.api_key = Some(key);
        }
        if let Some(stub) = var("WARDEN_LLM_STUB") {
            self.llm.stub = flag(&stub);
        }
        if let Some(seed) = var("WARDEN_LLM_SEED").and_then(|v| v.parse().ok()) {
            self.llm.seed = Some(seed);
        }
        if let Some(url) = var("WARDEN_EMBED_URL").filter(|v| !v.is_empty()) {
            self.embedding.base_url = Some(url);
        }
        if let Some(path) = var("WARDEN_FEEDBACK_FILE").filter(|v| !v.is_empty()) {
            self.feedback.path = Some(PathBuf::from(path));
        }
        if let Some(path) = var("WARDEN_POLICY_FILE").filter(|v| !v.is_empty()) {
            self.policy.path = Some(PathBuf::from(path));
        }
        if let Some(path) = var("WARDEN_CATALOG_FILE").filter(|v| !v.is_empty()) {
            self.catalog.path = Some(PathBuf::from(path));
        }
        if let Some(path) = var("WARDEN_FIXTURES_FILE").filter(|v| !v.is_empty()) {
            self.execution.fixtures = Some(PathBuf::from(path));
        }
        if let Some(path) = var("WARDEN_DATABASE").filter(|v| !v.is_empty()) {
            self.execution.database = Some(PathBuf::from(path));
        }
        if let Some(enabled) = var("WARDEN_CACHE") {
            self.cache.enabled = flag(&enabled);
        }
    }
}

fn flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

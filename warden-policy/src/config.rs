use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::PolicyError;

pub const DEFAULT_BLOCKED_KEYWORDS: [&str; 13] = [
    "DROP", "DELETE", "TRUNCATE", "ALTER", "INSERT", "UPDATE", "CREATE", "GRANT", "REVOKE",
    "MERGE", "REPLACE", "ATTACH", "COPY",
];

pub const DEFAULT_BLOCKED_TOPICS: [&str; 5] = [
    "politics",
    "religion",
    "hate speech",
    "medical advice",
    "legal advice",
];

/// Active governance configuration. Replaced as a whole, never edited in place.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Daily spend ceiling in USD.
    pub daily_cost_ceiling: Decimal,
    pub blocked_operation_keywords: BTreeSet<String>,
    pub blocked_topics: Vec<String>,
    /// Cosine similarity above which a request is blocked as off-topic. In [0, 1].
    pub similarity_threshold: f32,
    pub max_requests_per_minute: u32,
    /// Let requests through when the embedding service is down.
    pub semantic_fail_open: bool,
    pub enable_cost_limits: bool,
    pub enable_content_guardrails: bool,
    /// Feedback examples injected into each plan prompt.
    pub few_shot_examples: usize,
    pub execute_timeout_ms: u64,
    pub generation_timeout_ms: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            daily_cost_ceiling: Decimal::new(1000, 2),
            blocked_operation_keywords: DEFAULT_BLOCKED_KEYWORDS
                .iter()
                .map(|k| k.to_string())
                .collect(),
            blocked_topics: DEFAULT_BLOCKED_TOPICS.iter().map(|t| t.to_string()).collect(),
            similarity_threshold: 0.55,
            max_requests_per_minute: 60,
            semantic_fail_open: true,
            enable_cost_limits: true,
            enable_content_guardrails: true,
            few_shot_examples: 3,
            execute_timeout_ms: 10_000,
            generation_timeout_ms: 30_000,
        }
    }
}

impl PolicyConfig {
    pub fn validate(&self) -> Result<(), PolicyError> {
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(PolicyError::Invalid(format!(
                "similarity_threshold {} outside [0, 1]",
                self.similarity_threshold
            )));
        }
        if self.daily_cost_ceiling.is_sign_negative() {
            return Err(PolicyError::Invalid("daily_cost_ceiling is negative".into()));
        }
        if self.max_requests_per_minute == 0 {
            return Err(PolicyError::Invalid("max_requests_per_minute must be positive".into()));
        }
        if self
            .blocked_operation_keywords
            .iter()
            .any(|k| k.trim().is_empty())
        {
            return Err(PolicyError::Invalid("empty blocked keyword".into()));
        }
        Ok(())
    }
}

/// The persisted form of the policy: a single versioned document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolicyDocument {
    pub version: u64,
    #[serde(default)]
    pub policy: PolicyConfig,
}

impl PolicyDocument {
    /// Reads YAML (`.yaml`/`.yml`) or JSON (anything else).
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        let doc: PolicyDocument = if is_yaml {
            serde_yaml::from_str(&text).map_err(|e| PolicyError::Parse(e.to_string()))?
        } else {
            serde_json::from_str(&text).map_err(|e| PolicyError::Parse(e.to_string()))?
        };
        doc.policy.validate()?;
        Ok(doc)
    }

    pub fn to_yaml(&self) -> Result<String, PolicyError> {
        serde_yaml::to_string(self).map_err(|e| PolicyError::Parse(e.to_string()))
    }
}

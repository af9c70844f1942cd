use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::{BackendError, DataBackend, QueryResult};

enum Matcher {
    Exact(String),
    Contains(String),
}

impl Matcher {
    fn matches(&self, normalized: &str) -> bool {
        match self {
            Matcher::Exact(s) => s == normalized,
            Matcher::Contains(s) => normalized.contains(s.as_str()),
        }
    }
}

/// In-memory backend answering from registered statement fixtures.
///
/// Statements are compared after normalisation (lowercase, collapsed whitespace,
/// trailing `;` removed). Rules are tried in registration order; an unmatched
/// statement gets the default response, which is a query error unless overridden.
pub struct FixtureBackend {
    rules: Vec<(Matcher, Result<QueryResult, BackendError>)>,
    default: Option<Result<QueryResult, BackendError>>,
    delay: Option<Duration>,
    executed: Mutex<Vec<String>>,
}

impl FixtureBackend {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            default: None,
            delay: None,
            executed: Mutex::new(Vec::new()),
        }
    }

    pub fn on(mut self, statement: &str, response: Result<QueryResult, BackendError>) -> Self {
        self.rules.push((Matcher::Exact(normalize(statement)), response));
        self
    }

    pub fn on_fragment(mut self, fragment: &str, response: Result<QueryResult, BackendError>) -> Self {
        self.rules.push((Matcher::Contains(normalize(fragment)), response));
        self
    }

    pub fn otherwise(mut self, response: Result<QueryResult, BackendError>) -> Self {
        self.default = Some(response);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Statements received so far, verbatim, in call order.
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

/// One rule of a fixture file: statements containing `matches` get either the
/// rows or the error.
#[derive(Clone, Debug, Deserialize)]
pub struct FixtureSpec {
    pub matches: String,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub rows: Vec<Vec<String>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl FixtureSpec {
    fn response(&self) -> Result<QueryResult, BackendError> {
        if let Some(message) = &self.error {
            return Err(BackendError::Query(message.clone()));
        }
        let columns: Vec<&str> = self.columns.iter().map(String::as_str).collect();
        QueryResult::from_rows(&columns, self.rows.clone())
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct FixtureFile {
    #[serde(default)]
    pub fixtures: Vec<FixtureSpec>,
}

impl FixtureBackend {
    /// Loads fragment rules from a YAML fixture file.
    pub fn from_yaml_path(path: impl AsRef<Path>) -> Result<Self, BackendError> {
        let text = fs::read_to_string(path.as_ref())
            .map_err(|e| BackendError::Unavailable(format!("fixture file: {e}")))?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, BackendError> {
        let file: FixtureFile = serde_yaml::from_str(text)
            .map_err(|e| BackendError::Unavailable(format!("fixture file: {e}")))?;
        let mut backend = Self::new();
        for spec in &file.fixtures {
            let response = spec.response();
            backend = backend.on_fragment(&spec.matches, response);
        }
        Ok(backend)
    }
}

impl Default for FixtureBackend {
    fn default() -> Self {
        Self::new()
    }
}

pub fn normalize(statement: &str) -> String {
    statement
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches(';')
        .trim()
        .to_lowercase()
}

#[async_trait]
impl DataBackend for FixtureBackend {
    async fn execute(&self, statement: &str) -> Result<QueryResult, BackendError> {
        if let Ok(mut executed) = self.executed.lock() {
            executed.push(statement.to_string());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let normalized = normalize(statement);
        for (matcher, response) in &self.rules {
            if matcher.matches(&normalized) {
                return response.clone();
            }
        }
        match &self.default {
            Some(response) => response.clone(),
            None => Err(BackendError::Query(format!("no fixture for statement: {normalized}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn matches_after_normalisation() {
        let backend = FixtureBackend::new().on(
            "SELECT region FROM dim_store;",
            QueryResult::from_rows(&["region"], vec![vec!["EU"]]),
        );
        let result = backend
            .execute("select   region\n FROM dim_store")
            .await
            .unwrap();
        assert_eq!(result.row_count(), 1);
        assert!(backend.execute("SELECT nope FROM dim_store").await.is_err());
        assert_eq!(backend.executed().len(), 2);
    }

    #[tokio::test]
    async fn fragment_rules_and_default() {
        let backend = FixtureBackend::new()
            .on_fragment("missing_col", Err(BackendError::Query("no such column".into())))
            .otherwise(Ok(QueryResult::empty(&["x"])));
        assert!(backend.execute("SELECT missing_col FROM t").await.is_err());
        assert!(backend.execute("SELECT x FROM t").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn loads_rules_from_yaml() {
        let backend = FixtureBackend::from_yaml_str(
            r#"
fixtures:
  - matches: "group by s.region"
    columns: [region, total_revenue]
    rows:
      - [EU, "120"]
      - [US, "95"]
  - matches: "no_such_column"
    error: "column no_such_column does not exist"
"#,
        )
        .unwrap();
        let rows = backend
            .execute("SELECT s.region, SUM(f.revenue) FROM f JOIN dim_store s ON 1=1 GROUP BY s.region")
            .await
            .unwrap();
        assert_eq!(rows.row_count(), 2);
        assert_eq!(
            backend.execute("SELECT no_such_column FROM t").await.unwrap_err(),
            BackendError::Query("column no_such_column does not exist".into())
        );
        assert!(backend.execute("SELECT 1").await.is_err());
    }
}

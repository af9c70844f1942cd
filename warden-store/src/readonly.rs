use async_trait::async_trait;

use crate::{BackendError, DataBackend, QueryResult};

const READ_VERBS: [&str; 3] = ["select", "with", "explain"];

/// Last line of defence in front of a backend: only single read statements pass.
pub struct ReadOnlyBackend<B> {
    inner: B,
}

impl<B: DataBackend> ReadOnlyBackend<B> {
    pub fn new(inner: B) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }
}

/// Returns the reason a statement is not read-only, if it is not.
pub fn read_only_violation(statement: &str) -> Option<String> {
    let body = statement.trim().trim_end_matches(';').trim();
    if body.contains(';') {
        return Some("multiple statements".into());
    }
    let first = body
        .trim_start_matches('(')
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_lowercase();
    if READ_VERBS.contains(&first.as_str()) {
        None
    } else if first.is_empty() {
        Some("empty statement".into())
    } else {
        Some(format!("statement starts with '{first}'"))
    }
}

#[async_trait]
impl<B: DataBackend> DataBackend for ReadOnlyBackend<B> {
    async fn execute(&self, statement: &str) -> Result<QueryResult, BackendError> {
        if let Some(reason) = read_only_violation(statement) {
            tracing::warn!(%reason, "read-only backend refused statement");
            return Err(BackendError::ReadOnly(reason));
        }
        self.inner.execute(statement).await
    }
}

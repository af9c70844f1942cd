use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum number of rows carried in a [`DataSignature`].
pub const MAX_SAMPLE_ROWS: usize = 3;

/// Identity of a conversation session. Memory is scoped per session.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which governance layer refused a request.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    KillSwitch,
    Budget,
    Permission,
    Semantic,
    RateLimit,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::KillSwitch => "kill_switch",
            BlockReason::Budget => "budget",
            BlockReason::Permission => "permission",
            BlockReason::Semantic => "semantic",
            BlockReason::RateLimit => "rate_limit",
        }
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a governance check. Produced fresh per request and never mutated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub allowed: bool,
    pub blocked_by: Option<BlockReason>,
    pub detail: String,
}

impl Decision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            blocked_by: None,
            detail: "allowed".into(),
        }
    }

    pub fn block(reason: BlockReason, detail: impl Into<String>) -> Self {
        Self {
            allowed: false,
            blocked_by: Some(reason),
            detail: detail.into(),
        }
    }

    pub fn is_blocked_by(&self, reason: BlockReason) -> bool {
        self.blocked_by == Some(reason)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Table,
    Metric,
    Relationship,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Table => "table",
            EntityKind::Metric => "metric",
            EntityKind::Relationship => "relationship",
        }
    }
}

/// One schema or metric definition returned by the context retriever.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub entity_name: String,
    pub entity_kind: EntityKind,
    pub definition: String,
}

/// Ranked schema context for a request, most relevant first. Empty is valid.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievedContext {
    pub entries: Vec<ContextEntry>,
}

impl RetrievedContext {
    pub fn new(entries: Vec<ContextEntry>) -> Self {
        Self { entries }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ContextEntry> {
        self.entries.iter()
    }
}

/// Why an attempt failed verification.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptErrorKind {
    /// The text generator timed out.
    GenerationTimeout,
    /// The text generator failed or returned no usable statement.
    MalformedOutput,
    /// The backend rejected the statement (syntax, unknown column, ...).
    Execution,
    /// The backend did not answer within the execution timeout.
    ExecutionTimeout,
    /// The statement ran but returned no rows where rows were expected.
    EmptyResult,
    /// The statement ignores a filter value named in the request.
    FilterMismatch,
    /// The statement matched the destructive-operation deny list.
    Refused,
}

impl AttemptErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptErrorKind::GenerationTimeout => "generation_timeout",
            AttemptErrorKind::MalformedOutput => "malformed_output",
            AttemptErrorKind::Execution => "execution_error",
            AttemptErrorKind::ExecutionTimeout => "execution_timeout",
            AttemptErrorKind::EmptyResult => "empty_result",
            AttemptErrorKind::FilterMismatch => "filter_mismatch",
            AttemptErrorKind::Refused => "refused",
        }
    }
}

/// Where the statement of an attempt came from.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOrigin {
    Generated,
    Corrected,
    Fallback,
}

/// One plan/execute/verify pass. A request produces an ordered list of these.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionAttempt {
    /// Position in the request's attempt list, starting at 0.
    pub index: usize,
    pub origin: AttemptOrigin,
    pub statement_text: String,
    pub result_row_count: usize,
    pub succeeded: bool,
    pub error_kind: Option<AttemptErrorKind>,
    pub error_detail: Option<String>,
    /// Index of the failed attempt this one corrects.
    pub correction_of: Option<usize>,
}

/// Compact summary of a result used to ground follow-up requests.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DataSignature {
    pub row_count: usize,
    pub column_names: Vec<String>,
    /// At most [`MAX_SAMPLE_ROWS`] rows, rendered as text.
    pub sample_rows: Vec<Vec<String>>,
}

impl DataSignature {
    pub fn new(row_count: usize, column_names: Vec<String>, mut sample_rows: Vec<Vec<String>>) -> Self {
        sample_rows.truncate(MAX_SAMPLE_ROWS);
        Self {
            row_count,
            column_names,
            sample_rows,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub request_text: String,
    pub final_statement_text: String,
    pub data_signature: DataSignature,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rating {
    Positive,
    Negative,
}

/// A user judgment on a past answer. Never mutated after it is written.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub record_id: Uuid,
    pub request_text: String,
    pub statement_text: String,
    pub rating: Rating,
    pub correction: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl FeedbackRecord {
    pub fn new(
        request_text: impl Into<String>,
        statement_text: impl Into<String>,
        rating: Rating,
        correction: Option<String>,
    ) -> Self {
        Self {
            record_id: Uuid::new_v4(),
            request_text: request_text.into(),
            statement_text: statement_text.into(),
            rating,
            correction,
            timestamp: Utc::now(),
        }
    }
}

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::Instrument;
use uuid::Uuid;

use warden_context::ContextRetriever;
use warden_feedback::{AppendReceipt, FeedbackLedger};
use warden_infer::{Completion, GenerationError, TextGenerator};
use warden_memory::ConversationMemory;
use warden_policy::{ActivePolicy, ControlPlane, GovernedRequest};
use warden_store::{DataBackend, QueryResult};
use warden_types::{
    AttemptErrorKind, AttemptOrigin, BlockReason, ConversationTurn, DataSignature,
    ExecutionAttempt, FeedbackRecord, Rating, RetrievedContext, SessionId,
};

pub mod cache;
pub mod config;
pub mod cost;
pub mod extract;
pub mod fallback;
pub mod intent;
pub mod prompt;
pub mod runtime;
pub mod trace;

pub use cache::{CachedAnswer, SemanticCache};
pub use config::{ConfigError, WardenConfig};
pub use cost::CostModel;
pub use extract::extract_statement;
pub use fallback::{FallbackCatalog, FallbackPattern};
pub use intent::{verify, Intent, VerifyFailure};
pub use prompt::{build_prompt, PlanInput, RejectedStatement};
pub use trace::{LoopState, Trace, TraceEvent};

/// A request never gets more than this many generated statements.
pub const MAX_GENERATIVE_ATTEMPTS: usize = 2;

pub const NO_MATCHING_DATA: &str = "No matching data";
pub const UNABLE_TO_ANSWER: &str = "Unable to answer";

pub const DEFAULT_MAX_DISPLAY_ROWS: usize = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// A generated statement passed verification.
    Answered,
    /// A predefined query produced rows.
    Fallback,
    /// A predefined query ran and returned nothing.
    NoMatchingData,
    /// Governance refused the request or a generated statement.
    Refused,
    /// Neither generated nor predefined queries produced a result.
    Unanswerable,
}

#[derive(Clone, Debug, Serialize)]
pub struct Response {
    pub answer_text: String,
    pub trace: Vec<TraceEvent>,
    pub blocked: bool,
    pub block_reason: Option<BlockReason>,
    pub outcome: Outcome,
    pub statement_text: Option<String>,
    pub data: Option<DataSignature>,
    pub attempts: Vec<ExecutionAttempt>,
    /// No schema context was available to the Plan step.
    pub degraded_context: bool,
    /// Generation spend charged to the daily budget.
    pub cost: Decimal,
    /// Served from the semantic cache without generating.
    pub cached: bool,
}

impl Response {
    pub fn states(&self) -> Vec<LoopState> {
        self.trace.iter().map(|e| e.state).collect()
    }

    pub fn generative_attempts(&self) -> usize {
        self.attempts
            .iter()
            .filter(|a| a.origin != AttemptOrigin::Fallback)
            .count()
    }
}

/// A generated statement plus the completion it came from. Governance checks
/// the whole completion, so a second statement the extractor skipped still
/// counts.
struct Planned {
    statement: String,
    raw: String,
}

enum PlanError {
    /// No generator is wired in; go straight to the fallback.
    Unavailable,
    Failed(VerifyFailure),
}

/// Per-request bookkeeping.
struct Run {
    trace: Trace,
    attempts: Vec<ExecutionAttempt>,
    completions: Vec<Completion>,
    degraded_context: bool,
}

impl Run {
    fn record(
        &mut self,
        origin: AttemptOrigin,
        statement: &str,
        rows: usize,
        failure: Option<&VerifyFailure>,
        correction_of: Option<usize>,
    ) -> usize {
        let index = self.attempts.len();
        self.attempts.push(ExecutionAttempt {
            index,
            origin,
            statement_text: statement.to_string(),
            result_row_count: rows,
            succeeded: failure.is_none(),
            error_kind: failure.map(|f| f.kind),
            error_detail: failure.map(|f| f.detail.clone()),
            correction_of,
        });
        index
    }

    fn respond(
        mut self,
        outcome: Outcome,
        answer_text: String,
        statement_text: Option<String>,
        data: Option<DataSignature>,
        cost: Decimal,
    ) -> Response {
        self.trace.enter(LoopState::Respond);
        Response {
            answer_text,
            trace: self.trace.into_events(),
            blocked: false,
            block_reason: None,
            outcome,
            statement_text,
            data,
            attempts: self.attempts,
            degraded_context: self.degraded_context,
            cost,
            cached: false,
        }
    }

    fn refuse(self, reason: BlockReason, detail: &str, cost: Decimal) -> Response {
        let mut response = self.respond(
            Outcome::Refused,
            format!("Request refused ({reason}): {detail}"),
            None,
            None,
            cost,
        );
        response.blocked = true;
        response.block_reason = Some(reason);
        response
    }
}

/// The governed request loop: GuardCheck, Retrieve, Plan, Execute, Verify, at
/// most one SelfCorrect, then a deterministic Fallback, then Respond.
pub struct Warden {
    pub control: Arc<ControlPlane>,
    pub retriever: Arc<dyn ContextRetriever>,
    pub generator: Arc<dyn TextGenerator>,
    pub backend: Arc<dyn DataBackend>,
    pub memory: Arc<ConversationMemory>,
    pub feedback: Arc<FeedbackLedger>,
    cache: Option<SemanticCache>,
    fallbacks: FallbackCatalog,
    cost: CostModel,
    max_display_rows: usize,
}

impl Warden {
    pub fn new(
        control: Arc<ControlPlane>,
        retriever: Arc<dyn ContextRetriever>,
        generator: Arc<dyn TextGenerator>,
        backend: Arc<dyn DataBackend>,
        memory: Arc<ConversationMemory>,
        feedback: Arc<FeedbackLedger>,
    ) -> Self {
        Self {
            control,
            retriever,
            generator,
            backend,
            memory,
            feedback,
            cache: None,
            fallbacks: FallbackCatalog::sales_star_schema(),
            cost: CostModel::default(),
            max_display_rows: DEFAULT_MAX_DISPLAY_ROWS,
        }
    }

    pub fn with_cache(mut self, cache: SemanticCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn cache(&self) -> Option<&SemanticCache> {
        self.cache.as_ref()
    }

    pub fn with_fallbacks(mut self, fallbacks: FallbackCatalog) -> Self {
        self.fallbacks = fallbacks;
        self
    }

    pub fn with_cost_model(mut self, cost: CostModel) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_max_display_rows(mut self, rows: usize) -> Self {
        self.max_display_rows = rows.max(1);
        self
    }

    pub fn cost_model(&self) -> &CostModel {
        &self.cost
    }

    /// Answers one request for `session`. Governance blocks, generation and
    /// execution failures all end in a `Response`; nothing here returns an error.
    pub async fn handle(&self, request_text: &str, session: &SessionId) -> Response {
        let span = tracing::info_span!("request", trace_id = %Uuid::new_v4(), session = %session);
        self.run_loop(request_text, session).instrument(span).await
    }

    async fn run_loop(&self, request_text: &str, session: &SessionId) -> Response {
        let mut run = Run {
            trace: Trace::new(),
            attempts: Vec::new(),
            completions: Vec::new(),
            degraded_context: false,
        };

        run.trace.enter(LoopState::GuardCheck);
        let admission = self
            .control
            .validate(&GovernedRequest {
                caller: session.as_str(),
                text: request_text,
                estimated_cost: self.cost.estimate_request(request_text),
            })
            .await;
        if let Some(reason) = admission.decision.blocked_by {
            let detail = admission.decision.detail.clone();
            run.trace.note(detail.clone());
            return run.refuse(reason, &detail, Decimal::ZERO);
        }
        let policy = Arc::clone(&admission.policy);
        let intent = Intent::parse(request_text);

        // Follow-ups depend on the session's last result, so they never hit.
        if !intent.follow_up {
            if let Some(hit) = self.cached_answer(&policy, request_text).await {
                run.trace.note(format!(
                    "semantic cache hit: {:.2} similar to '{}'",
                    hit.similarity, hit.request_text
                ));
                self.remember(session, request_text, &hit.statement_text, hit.data.clone())
                    .await;
                admission.settle(Decimal::ZERO);
                tracing::info!(session = %session, similarity = hit.similarity, "request served from cache");
                let mut response = run.respond(
                    Outcome::Answered,
                    hit.answer_text,
                    Some(hit.statement_text),
                    Some(hit.data),
                    Decimal::ZERO,
                );
                response.cached = true;
                return response;
            }
        }

        run.trace.enter(LoopState::Retrieve);
        let context = match self.retriever.retrieve(request_text).await {
            Ok(context) => context,
            Err(err) => {
                tracing::warn!(error = %err, "context retrieval failed");
                run.trace.note(format!("retrieval failed: {err}"));
                RetrievedContext::empty()
            }
        };
        if context.is_empty() {
            run.degraded_context = true;
            run.trace.note("degraded context: no schema definitions retrieved");
        }
        let previous = if intent.follow_up {
            self.memory.last_turn(session).await
        } else {
            None
        };
        let examples = self
            .feedback
            .sample_top_examples(request_text, policy.config.few_shot_examples);

        let generation_timeout = Duration::from_millis(policy.config.generation_timeout_ms);
        let mut rejected: Option<(usize, RejectedStatement)> = None;
        let mut answered: Option<(String, QueryResult)> = None;

        for round in 0..MAX_GENERATIVE_ATTEMPTS {
            if round > 0 {
                run.trace.enter(LoopState::SelfCorrect);
            }
            run.trace.enter(LoopState::Plan);
            let origin = if round == 0 {
                AttemptOrigin::Generated
            } else {
                AttemptOrigin::Corrected
            };
            let correction_of = rejected.as_ref().map(|(index, _)| *index);
            let prompt = build_prompt(&PlanInput {
                request_text,
                context: &context,
                previous: previous.as_ref(),
                examples: &examples,
                rejected: rejected.as_ref().map(|(_, r)| r),
            });

            let Planned { statement, raw } = match self
                .plan(&policy, &prompt, generation_timeout, &mut run.completions)
                .await
            {
                Ok(planned) => planned,
                Err(PlanError::Unavailable) => {
                    run.trace.note("no text generator configured");
                    break;
                }
                Err(PlanError::Failed(failure)) => {
                    run.trace.note(format!("{}: {}", failure.kind.as_str(), failure.detail));
                    let index = run.record(origin, "", 0, Some(&failure), correction_of);
                    rejected = Some((
                        index,
                        RejectedStatement {
                            statement_text: String::new(),
                            error: failure.detail,
                        },
                    ));
                    continue;
                }
            };

            let decision = self.control.check_statement_with(&policy, &raw);
            if let Some(reason) = decision.blocked_by {
                tracing::warn!(session = %session, detail = %decision.detail, "generated statement refused");
                run.trace.note(decision.detail.clone());
                let failure = VerifyFailure::new(AttemptErrorKind::Refused, decision.detail.clone());
                run.record(origin, &statement, 0, Some(&failure), correction_of);
                let cost = self.cost.actual(&run.completions);
                admission.settle(cost);
                return run.refuse(reason, &decision.detail, cost);
            }

            run.trace.enter(LoopState::Execute);
            let executed = self.execute(&policy, &statement).await;
            run.trace.enter(LoopState::Verify);
            let verified = match executed {
                Ok(result) => match verify(&intent, &statement, result.row_count()) {
                    Ok(()) => Ok(result),
                    Err(failure) => Err((result.row_count(), failure)),
                },
                Err(failure) => Err((0, failure)),
            };
            match verified {
                Ok(result) => {
                    run.record(origin, &statement, result.row_count(), None, correction_of);
                    answered = Some((statement, result));
                    break;
                }
                Err((rows, failure)) => {
                    run.trace.note(format!("{}: {}", failure.kind.as_str(), failure.detail));
                    let index = run.record(origin, &statement, rows, Some(&failure), correction_of);
                    rejected = Some((
                        index,
                        RejectedStatement {
                            statement_text: statement,
                            error: failure.detail,
                        },
                    ));
                }
            }
        }

        let response = match answered {
            Some((statement, result)) => {
                let data = signature(&result);
                self.remember(session, request_text, &statement, data.clone()).await;
                let mut answer = self.render(&result);
                answer.push_str(&format!("\n\n```sql\n{statement}\n```"));
                if run.degraded_context {
                    answer.push_str("\n\n_Answered without schema context; check the tables used._");
                }
                if let (Some(cache), false) = (&self.cache, intent.follow_up) {
                    cache.store(request_text, &statement, &answer, data.clone()).await;
                }
                let cost = self.cost.actual(&run.completions);
                run.respond(Outcome::Answered, answer, Some(statement), Some(data), cost)
            }
            None => {
                let correction_of = rejected.as_ref().map(|(index, _)| *index);
                self.fall_back(run, &policy, request_text, session, correction_of)
                    .await
            }
        };

        admission.settle(response.cost);
        tracing::info!(
            session = %session,
            outcome = ?response.outcome,
            attempts = response.attempts.len(),
            cost = %response.cost,
            "request handled"
        );
        response
    }

    async fn fall_back(
        &self,
        mut run: Run,
        policy: &ActivePolicy,
        request_text: &str,
        session: &SessionId,
        correction_of: Option<usize>,
    ) -> Response {
        run.trace.enter(LoopState::Fallback);
        let cost = self.cost.actual(&run.completions);
        let Some(choice) = self.fallbacks.select(request_text) else {
            run.trace.note("no predefined query matches");
            return run.respond(Outcome::Unanswerable, unable_text(), None, None, cost);
        };
        run.trace.note(format!("predefined query '{}'", choice.name));
        let statement = choice.statement.to_string();

        match self.execute(policy, &statement).await {
            Ok(result) => {
                run.record(
                    AttemptOrigin::Fallback,
                    &statement,
                    result.row_count(),
                    None,
                    correction_of,
                );
                let data = signature(&result);
                self.remember(session, request_text, &statement, data.clone()).await;
                if result.is_empty() {
                    let answer = format!(
                        "{NO_MATCHING_DATA} for this request (predefined '{}' query returned no rows).\n\n```sql\n{statement}\n```",
                        choice.name
                    );
                    run.respond(Outcome::NoMatchingData, answer, Some(statement), Some(data), cost)
                } else {
                    let answer = format!(
                        "*Used the predefined '{}' query.*\n\n{}\n\n```sql\n{statement}\n```",
                        choice.name,
                        self.render(&result)
                    );
                    run.respond(Outcome::Fallback, answer, Some(statement), Some(data), cost)
                }
            }
            Err(failure) => {
                run.trace.note(format!("{}: {}", failure.kind.as_str(), failure.detail));
                run.record(AttemptOrigin::Fallback, &statement, 0, Some(&failure), correction_of);
                run.respond(Outcome::Unanswerable, unable_text(), None, None, cost)
            }
        }
    }

    async fn plan(
        &self,
        policy: &ActivePolicy,
        prompt: &str,
        limit: Duration,
        completions: &mut Vec<Completion>,
    ) -> Result<Planned, PlanError> {
        match tokio::time::timeout(limit, self.generator.complete(prompt)).await {
            Err(_) | Ok(Err(GenerationError::Timeout)) => Err(PlanError::Failed(VerifyFailure::new(
                AttemptErrorKind::GenerationTimeout,
                format!("no completion within {} ms", limit.as_millis()),
            ))),
            Ok(Err(GenerationError::NotConfigured)) => Err(PlanError::Unavailable),
            Ok(Err(err)) => Err(PlanError::Failed(VerifyFailure::new(
                AttemptErrorKind::MalformedOutput,
                err.to_string(),
            ))),
            Ok(Ok(completion)) => {
                let raw = completion.text.clone();
                completions.push(completion);
                match extract_statement(&raw) {
                    Some(statement) => Ok(Planned { statement, raw }),
                    // Output with no query but a blocked keyword is still refused.
                    None if policy.permissions().find(&raw).is_some() => Ok(Planned {
                        statement: raw.trim().to_string(),
                        raw,
                    }),
                    None => Err(PlanError::Failed(VerifyFailure::new(
                        AttemptErrorKind::MalformedOutput,
                        "generator output contains no query",
                    ))),
                }
            }
        }
    }

    /// Runs a statement with the deny-list re-checked and the execution timeout applied.
    async fn execute(&self, policy: &ActivePolicy, statement: &str) -> Result<QueryResult, VerifyFailure> {
        if let Some(keyword) = policy.permissions().find(statement) {
            return Err(VerifyFailure::new(
                AttemptErrorKind::Refused,
                format!("refused to execute statement containing {keyword}"),
            ));
        }
        let limit = Duration::from_millis(policy.config.execute_timeout_ms);
        match tokio::time::timeout(limit, self.backend.execute(statement)).await {
            Err(_) => Err(VerifyFailure::new(
                AttemptErrorKind::ExecutionTimeout,
                format!("no result within {} ms", limit.as_millis()),
            )),
            Ok(Err(err)) => Err(VerifyFailure::new(AttemptErrorKind::Execution, err.to_string())),
            Ok(Ok(result)) => Ok(result),
        }
    }

    /// A cached answer whose statement the current policy still permits.
    async fn cached_answer(&self, policy: &ActivePolicy, request_text: &str) -> Option<CachedAnswer> {
        let hit = self.cache.as_ref()?.lookup(request_text).await?;
        match policy.permissions().find(&hit.statement_text) {
            Some(keyword) => {
                tracing::debug!(keyword = %keyword, "cached statement no longer permitted");
                None
            }
            None => Some(hit),
        }
    }

    async fn remember(&self, session: &SessionId, request_text: &str, statement: &str, data: DataSignature) {
        let turn = ConversationTurn {
            request_text: request_text.to_string(),
            final_statement_text: statement.to_string(),
            data_signature: data,
            timestamp: Utc::now(),
        };
        self.memory.record(session, turn).await;
    }

    fn render(&self, result: &QueryResult) -> String {
        result
            .to_markdown_table(self.max_display_rows)
            .unwrap_or_else(|err| format!("{} rows (table could not be rendered: {err})", result.row_count()))
    }

    /// Records a user judgment on an earlier answer.
    pub fn submit_feedback(
        &self,
        request_text: &str,
        statement_text: &str,
        rating: Rating,
        correction: Option<String>,
    ) -> AppendReceipt {
        self.feedback
            .append(FeedbackRecord::new(request_text, statement_text, rating, correction))
    }
}

fn signature(result: &QueryResult) -> DataSignature {
    result
        .signature()
        .unwrap_or_else(|_| DataSignature::new(result.row_count(), result.column_names(), Vec::new()))
}

fn unable_text() -> String {
    format!("{UNABLE_TO_ANSWER} this request: neither generated nor predefined queries produced a result.")
}

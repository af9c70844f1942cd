use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use warden_context::{Catalog, CatalogRetriever, ContextRetriever, NullRetriever, RetrieverSettings};
use warden_core::{LoopState, Outcome, SemanticCache, Warden, NO_MATCHING_DATA, UNABLE_TO_ANSWER};
use warden_embed::{HashEmbedder, StaticEmbedder};
use warden_feedback::FeedbackLedger;
use warden_infer::{NullGenerator, ScriptedGenerator, TextGenerator};
use warden_memory::ConversationMemory;
use warden_policy::{ControlPlane, KillSwitch, PolicyConfig};
use warden_store::{BackendError, FixtureBackend, QueryResult};
use warden_types::{
    AttemptErrorKind, AttemptOrigin, BlockReason, ContextEntry, EntityKind, Rating, SessionId,
};

use LoopState::*;

const REGION_SQL: &str = "SELECT s.region, SUM(f.revenue) AS total_revenue FROM fact_sales_forecast f JOIN dim_store s ON f.store_id = s.store_id GROUP BY s.region";

fn fenced(statement: &str) -> String {
    format!("```sql\n{statement}\n```")
}

fn regions() -> Result<QueryResult, BackendError> {
    QueryResult::from_rows(
        &["region", "total_revenue"],
        vec![vec!["EU", "120"], vec!["US", "95"]],
    )
}

fn policy() -> PolicyConfig {
    PolicyConfig {
        blocked_topics: vec!["politics".into()],
        similarity_threshold: 0.35,
        ..PolicyConfig::default()
    }
}

fn embedder() -> Arc<StaticEmbedder> {
    Arc::new(StaticEmbedder::new(vec![0.0, 1.0]).with("politics", vec![1.0, 0.0]))
}

async fn catalog_retriever() -> Arc<dyn ContextRetriever> {
    let catalog = Catalog {
        entries: vec![ContextEntry {
            entity_name: "revenue".into(),
            entity_kind: EntityKind::Metric,
            definition: "SUM(f.revenue) over fact_sales_forecast".into(),
        }],
    };
    Arc::new(
        CatalogRetriever::build(catalog, embedder(), RetrieverSettings::default())
            .await
            .unwrap(),
    )
}

struct Harness {
    warden: Warden,
    generator: Arc<ScriptedGenerator>,
    backend: Arc<FixtureBackend>,
}

async fn harness(config: PolicyConfig, generator: ScriptedGenerator, backend: FixtureBackend) -> Harness {
    harness_with(config, generator, backend, catalog_retriever().await)
}

fn harness_with(
    config: PolicyConfig,
    generator: ScriptedGenerator,
    backend: FixtureBackend,
    retriever: Arc<dyn ContextRetriever>,
) -> Harness {
    let generator = Arc::new(generator);
    let backend = Arc::new(backend);
    let control = ControlPlane::new(config, KillSwitch::new(), embedder()).unwrap();
    let warden = Warden::new(
        Arc::new(control),
        retriever,
        generator.clone(),
        backend.clone(),
        Arc::new(ConversationMemory::default()),
        Arc::new(FeedbackLedger::in_memory()),
    );
    Harness {
        warden,
        generator,
        backend,
    }
}

#[tokio::test]
async fn verified_statement_is_answered_and_remembered() {
    let h = harness(
        policy(),
        ScriptedGenerator::replies([fenced(REGION_SQL)]),
        FixtureBackend::new().on_fragment("group by s.region", regions()),
    )
    .await;
    let session = SessionId::new("s1");

    let response = h.warden.handle("Total revenue by region", &session).await;

    assert_eq!(response.outcome, Outcome::Answered);
    assert!(!response.blocked);
    assert_eq!(
        response.states(),
        vec![GuardCheck, Retrieve, Plan, Execute, Verify, Respond]
    );
    assert!(!response.degraded_context);
    assert!(response.answer_text.contains("| EU | 120 |"));
    assert_eq!(response.statement_text.as_deref(), Some(REGION_SQL));
    assert!(response.cost > Decimal::ZERO);

    let ledger = h.warden.control.budget().ledger();
    assert_eq!(ledger.daily_total, response.cost);
    assert_eq!(h.warden.control.budget().reserved(), Decimal::ZERO);

    let turn = h.warden.memory.last_turn(&session).await.unwrap();
    assert_eq!(turn.final_statement_text, REGION_SQL);
    assert_eq!(turn.data_signature.row_count, 2);
}

#[tokio::test]
async fn failed_correction_falls_back_without_third_generation() {
    let h = harness(
        policy(),
        ScriptedGenerator::replies([
            fenced("SELECT bad_column FROM fact_sales_forecast"),
            fenced("SELECT other_bad_column FROM fact_sales_forecast"),
            fenced(REGION_SQL),
        ]),
        FixtureBackend::new()
            .on_fragment("bad_column", Err(BackendError::Query("column bad_column does not exist".into())))
            .on_fragment("group by s.region", regions()),
    )
    .await;

    let response = h.warden.handle("revenue for each region", &SessionId::new("s1")).await;

    assert_eq!(
        response.states(),
        vec![
            GuardCheck, Retrieve, Plan, Execute, Verify, SelfCorrect, Plan, Execute, Verify,
            Fallback, Respond
        ]
    );
    assert_eq!(h.generator.calls(), 2);
    assert_eq!(response.generative_attempts(), 2);
    assert_eq!(response.outcome, Outcome::Fallback);
    assert!(response.answer_text.contains("predefined 'revenue_by_region' query"));

    let attempts = &response.attempts;
    assert_eq!(attempts.len(), 3);
    assert_eq!(attempts[0].origin, AttemptOrigin::Generated);
    assert_eq!(attempts[0].error_kind, Some(AttemptErrorKind::Execution));
    assert_eq!(attempts[1].origin, AttemptOrigin::Corrected);
    assert_eq!(attempts[1].correction_of, Some(0));
    assert_eq!(attempts[2].origin, AttemptOrigin::Fallback);
    assert!(attempts[2].succeeded);

    let prompts = h.generator.prompts();
    assert!(!prompts[0].contains("## Avoid this form"));
    assert!(prompts[1].contains("## Avoid this form"));
    assert!(prompts[1].contains("bad_column"));
}

#[tokio::test]
async fn empty_results_end_in_no_matching_data() {
    let h = harness(
        policy(),
        ScriptedGenerator::replies([
            fenced("SELECT month FROM dim_date WHERE 1 = 0"),
            fenced("SELECT month FROM dim_date WHERE 2 = 0"),
        ]),
        FixtureBackend::new().otherwise(Ok(QueryResult::empty(&["month"]))),
    )
    .await;

    let response = h.warden.handle("forecast by month", &SessionId::new("s1")).await;

    assert_eq!(response.outcome, Outcome::NoMatchingData);
    assert!(response.answer_text.starts_with(NO_MATCHING_DATA));
    assert_eq!(response.attempts[0].error_kind, Some(AttemptErrorKind::EmptyResult));
    assert_eq!(response.attempts[1].error_kind, Some(AttemptErrorKind::EmptyResult));
    assert_eq!(response.attempts[2].result_row_count, 0);
}

#[tokio::test]
async fn exhausted_paths_report_unable_to_answer() {
    let h = harness(
        policy(),
        ScriptedGenerator::replies([fenced("SELECT a FROM t"), fenced("SELECT b FROM t")]),
        FixtureBackend::new().otherwise(Err(BackendError::Unavailable("down".into()))),
    )
    .await;
    let session = SessionId::new("s1");

    let response = h.warden.handle("revenue by store", &session).await;

    assert_eq!(response.outcome, Outcome::Unanswerable);
    assert!(response.answer_text.starts_with(UNABLE_TO_ANSWER));
    assert!(response.statement_text.is_none());
    assert_eq!(h.backend.executed().len(), 3);
    assert!(h.warden.memory.last_turn(&session).await.is_none());
}

#[tokio::test]
async fn generation_timeout_counts_as_failed_attempt() {
    let h = harness(
        PolicyConfig {
            generation_timeout_ms: 30,
            ..policy()
        },
        ScriptedGenerator::replies([fenced(REGION_SQL), fenced(REGION_SQL)])
            .with_delay(Duration::from_millis(300)),
        FixtureBackend::new().on_fragment("group by s.region", regions()),
    )
    .await;

    let response = h.warden.handle("revenue by region", &SessionId::new("s1")).await;

    assert_eq!(response.generative_attempts(), 2);
    assert_eq!(response.attempts[0].error_kind, Some(AttemptErrorKind::GenerationTimeout));
    assert_eq!(response.attempts[1].error_kind, Some(AttemptErrorKind::GenerationTimeout));
    assert_eq!(response.outcome, Outcome::Fallback);
    assert_eq!(response.cost, Decimal::ZERO);
}

#[tokio::test]
async fn execution_timeout_enters_self_correction() {
    let h = harness(
        PolicyConfig {
            execute_timeout_ms: 30,
            ..policy()
        },
        ScriptedGenerator::replies([fenced("SELECT a FROM t"), fenced("SELECT b FROM t")]),
        FixtureBackend::new()
            .otherwise(regions())
            .with_delay(Duration::from_millis(300)),
    )
    .await;

    let response = h.warden.handle("revenue by region", &SessionId::new("s1")).await;

    assert!(response.states().contains(&SelfCorrect));
    assert_eq!(response.attempts[0].error_kind, Some(AttemptErrorKind::ExecutionTimeout));
    assert_eq!(response.generative_attempts(), 2);
    assert_eq!(response.outcome, Outcome::Unanswerable);
}

#[tokio::test]
async fn filter_mismatch_is_corrected() {
    let h = harness(
        policy(),
        ScriptedGenerator::replies([
            fenced("SELECT SUM(revenue) FROM fact_sales_forecast"),
            fenced("SELECT SUM(f.revenue) FROM fact_sales_forecast f JOIN dim_store s ON f.store_id = s.store_id WHERE s.region = 'EMEA'"),
        ]),
        FixtureBackend::new().otherwise(QueryResult::from_rows(&["sum"], vec![vec!["42"]])),
    )
    .await;

    let response = h.warden.handle("revenue in 'EMEA'", &SessionId::new("s1")).await;

    assert_eq!(response.outcome, Outcome::Answered);
    assert_eq!(response.attempts[0].error_kind, Some(AttemptErrorKind::FilterMismatch));
    assert_eq!(response.attempts[0].result_row_count, 1);
    assert!(response.attempts[1].succeeded);
}

#[tokio::test]
async fn destructive_request_is_refused_before_any_work() {
    let h = harness(
        policy(),
        ScriptedGenerator::replies([fenced(REGION_SQL)]),
        FixtureBackend::new().otherwise(regions()),
    )
    .await;

    let response = h.warden.handle("DROP TABLE sales", &SessionId::new("s1")).await;

    assert!(response.blocked);
    assert_eq!(response.block_reason, Some(BlockReason::Permission));
    assert_eq!(response.outcome, Outcome::Refused);
    assert_eq!(response.states(), vec![GuardCheck, Respond]);
    assert_eq!(h.generator.calls(), 0);
    assert!(h.backend.executed().is_empty());
}

#[tokio::test]
async fn destructive_generated_statement_is_refused_without_retry() {
    let h = harness(
        policy(),
        ScriptedGenerator::replies([fenced("DELETE FROM fact_sales_forecast"), fenced(REGION_SQL)]),
        FixtureBackend::new().otherwise(regions()),
    )
    .await;

    let response = h.warden.handle("clean up the old rows", &SessionId::new("s1")).await;

    assert_eq!(response.block_reason, Some(BlockReason::Permission));
    assert_eq!(response.states(), vec![GuardCheck, Retrieve, Plan, Respond]);
    assert_eq!(h.generator.calls(), 1);
    assert!(h.backend.executed().is_empty());
    assert_eq!(response.attempts[0].error_kind, Some(AttemptErrorKind::Refused));
}

#[tokio::test]
async fn statement_after_a_query_in_the_same_reply_is_refused() {
    let h = harness(
        policy(),
        ScriptedGenerator::replies([
            "SELECT 1; DROP TABLE dim_store".to_string(),
            fenced(REGION_SQL),
        ]),
        FixtureBackend::new().otherwise(regions()),
    )
    .await;

    let response = h.warden.handle("revenue by region", &SessionId::new("s1")).await;

    assert_eq!(response.block_reason, Some(BlockReason::Permission));
    assert_eq!(response.states(), vec![GuardCheck, Retrieve, Plan, Respond]);
    assert_eq!(h.generator.calls(), 1);
    assert!(h.backend.executed().is_empty());
    assert_eq!(response.attempts[0].statement_text, "SELECT 1");
    assert_eq!(response.attempts[0].error_kind, Some(AttemptErrorKind::Refused));
}

#[tokio::test]
async fn possessive_request_is_answered_on_first_attempt() {
    let h = harness(
        policy(),
        ScriptedGenerator::replies([fenced(REGION_SQL), fenced(REGION_SQL)]),
        FixtureBackend::new().on_fragment("group by s.region", regions()),
    )
    .await;

    let response = h
        .warden
        .handle("What's the revenue for each store's region?", &SessionId::new("s1"))
        .await;

    assert_eq!(response.outcome, Outcome::Answered);
    assert_eq!(response.attempts.len(), 1);
    assert!(response.attempts[0].succeeded);
    assert_eq!(h.generator.calls(), 1);
}

#[tokio::test]
async fn repeated_request_is_served_from_cache() {
    let mut h = harness(
        policy(),
        ScriptedGenerator::replies([fenced(REGION_SQL)]),
        FixtureBackend::new().on_fragment("group by s.region", regions()),
    )
    .await;
    h.warden = h
        .warden
        .with_cache(SemanticCache::new(Arc::new(HashEmbedder::new(256)), 0.95, 16));

    let first = h.warden.handle("Total revenue by region", &SessionId::new("s1")).await;
    assert!(!first.cached);
    let second = h.warden.handle("total revenue by region?", &SessionId::new("s2")).await;

    assert!(second.cached);
    assert_eq!(second.outcome, Outcome::Answered);
    assert_eq!(second.states(), vec![GuardCheck, Respond]);
    assert!(second.trace[0].note.as_deref().unwrap_or("").contains("cache hit"));
    assert_eq!(second.statement_text, first.statement_text);
    assert_eq!(second.answer_text, first.answer_text);
    assert_eq!(second.cost, Decimal::ZERO);
    assert_eq!(h.generator.calls(), 1);
    assert_eq!(h.backend.executed().len(), 1);
    assert_eq!(h.warden.control.budget().reserved(), Decimal::ZERO);

    let turn = h.warden.memory.last_turn(&SessionId::new("s2")).await.unwrap();
    assert_eq!(turn.final_statement_text, REGION_SQL);
}

#[tokio::test]
async fn off_topic_request_is_a_semantic_block() {
    let embedder = Arc::new(
        StaticEmbedder::new(vec![0.0, 1.0])
            .with("politics", vec![1.0, 0.0])
            .with("Democrats vs Republicans", vec![0.42, (1.0f32 - 0.42 * 0.42).sqrt()]),
    );
    let control = ControlPlane::new(policy(), KillSwitch::new(), embedder).unwrap();
    let warden = Warden::new(
        Arc::new(control),
        Arc::new(NullRetriever),
        Arc::new(ScriptedGenerator::replies([fenced(REGION_SQL)])),
        Arc::new(FixtureBackend::new().otherwise(regions())),
        Arc::new(ConversationMemory::default()),
        Arc::new(FeedbackLedger::in_memory()),
    );

    let response = warden.handle("Democrats vs Republicans", &SessionId::new("s1")).await;
    assert_eq!(response.block_reason, Some(BlockReason::Semantic));

    let allowed = warden.handle("show revenue", &SessionId::new("s1")).await;
    assert!(!allowed.blocked);
}

#[tokio::test]
async fn empty_context_runs_in_degraded_mode() {
    let h = harness_with(
        policy(),
        ScriptedGenerator::replies([fenced(REGION_SQL)]),
        FixtureBackend::new().on_fragment("group by s.region", regions()),
        Arc::new(NullRetriever),
    );

    let response = h.warden.handle("revenue by region", &SessionId::new("s1")).await;

    assert_eq!(response.outcome, Outcome::Answered);
    assert!(response.degraded_context);
    let retrieve = response.trace.iter().find(|e| e.state == Retrieve).unwrap();
    assert!(retrieve.note.as_deref().unwrap_or("").contains("degraded"));
    assert!(response.answer_text.contains("without schema context"));
    assert!(h.generator.prompts()[0].contains("No schema context was retrieved"));
}

#[tokio::test]
async fn follow_up_sees_previous_result_of_same_session_only() {
    let h = harness(
        policy(),
        ScriptedGenerator::replies([fenced(REGION_SQL), fenced(REGION_SQL), fenced(REGION_SQL)]),
        FixtureBackend::new().on_fragment("group by s.region", regions()),
    )
    .await;
    let (alice, bob) = (SessionId::new("alice"), SessionId::new("bob"));

    h.warden.handle("revenue by region", &alice).await;
    h.warden.handle("compare that to last year", &alice).await;
    h.warden.handle("compare that to last year", &bob).await;

    let prompts = h.generator.prompts();
    assert!(!prompts[0].contains("## Previous result"));
    assert!(prompts[1].contains("## Previous result"));
    assert!(prompts[1].contains("Request: revenue by region"));
    assert!(!prompts[2].contains("## Previous result"));
}

#[tokio::test]
async fn positive_feedback_is_injected_as_example() {
    let h = harness(
        policy(),
        ScriptedGenerator::replies([fenced(REGION_SQL)]),
        FixtureBackend::new().on_fragment("group by s.region", regions()),
    )
    .await;
    let receipt = h.warden.submit_feedback(
        "total revenue by region",
        "SELECT region, SUM(revenue) FROM sales GROUP BY region",
        Rating::Positive,
        None,
    );
    assert!(!receipt.persisted);

    let top = h.warden.feedback.sample_top_examples("total revenue by region", 3);
    assert_eq!(top[0].record_id, receipt.record_id);

    h.warden.handle("total revenue by region", &SessionId::new("s1")).await;
    let prompt = &h.generator.prompts()[0];
    assert!(prompt.contains("## Verified examples"));
    assert!(prompt.contains("SELECT region, SUM(revenue) FROM sales GROUP BY region"));
}

#[tokio::test]
async fn missing_generator_goes_straight_to_fallback() {
    let control = ControlPlane::new(policy(), KillSwitch::new(), embedder()).unwrap();
    let generator: Arc<dyn TextGenerator> = Arc::new(NullGenerator);
    let warden = Warden::new(
        Arc::new(control),
        Arc::new(NullRetriever),
        generator,
        Arc::new(FixtureBackend::new().on_fragment("group by s.region", regions())),
        Arc::new(ConversationMemory::default()),
        Arc::new(FeedbackLedger::in_memory()),
    );

    let response = warden.handle("revenue by region", &SessionId::new("s1")).await;

    assert_eq!(response.states(), vec![GuardCheck, Retrieve, Plan, Fallback, Respond]);
    assert_eq!(response.generative_attempts(), 0);
    assert_eq!(response.outcome, Outcome::Fallback);
}

#[tokio::test]
async fn budget_exhaustion_stops_later_requests() {
    let h = harness(
        PolicyConfig {
            daily_cost_ceiling: Decimal::new(1, 4),
            ..policy()
        },
        ScriptedGenerator::replies([fenced(REGION_SQL)]),
        FixtureBackend::new().otherwise(regions()),
    )
    .await;

    let first = h.warden.handle("revenue by region", &SessionId::new("s1")).await;
    assert_eq!(first.block_reason, Some(BlockReason::Budget));
    assert!(h.warden.control.kill_switch().is_active());

    let second = h.warden.handle("revenue by region", &SessionId::new("s1")).await;
    assert_eq!(second.block_reason, Some(BlockReason::KillSwitch));

    h.warden.control.reset_kill_switch();
    h.warden
        .control
        .apply_policy_update(PolicyConfig {
            enable_cost_limits: false,
            ..policy()
        })
        .unwrap();
    let third = h.warden.handle("revenue by region", &SessionId::new("s1")).await;
    assert!(!third.blocked);
}

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};
use uuid::Uuid;

use warden_core::runtime::{backend_from_config, build_warden};
use warden_core::{Response, Warden, WardenConfig};
use warden_policy::{ControlStatus, KillSwitchState, PolicyConfig};
use warden_types::{Rating, SessionId};

const DEFAULT_ADDR: &str = "0.0.0.0:7000";
const DEFAULT_SESSION: &str = "default";

#[derive(Clone)]
struct AppState {
    warden: Arc<Warden>,
}

#[derive(Debug, Deserialize)]
struct AskRequest {
    text: String,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FeedbackRequest {
    request_text: String,
    statement_text: String,
    rating: Rating,
    #[serde(default)]
    correction: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FeedbackResponse {
    record_id: Uuid,
    chain_hash: String,
    persisted: bool,
}

#[derive(Debug, Default, Deserialize)]
struct TriggerRequest {
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SwitchResponse {
    changed: bool,
    state: KillSwitchState,
}

#[derive(Debug, Serialize, Deserialize)]
struct PolicyVersion {
    version: u64,
}

type ApiError = (StatusCode, String);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let config = WardenConfig::load()?;
    let backend = backend_from_config(&config)?;
    let warden = build_warden(&config, warden_policy::KillSwitch::new(), backend).await?;

    let addr: SocketAddr = std::env::var("WARDEN_HTTP_ADDR")
        .unwrap_or_else(|_| DEFAULT_ADDR.into())
        .parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "warden HTTP server listening");
    axum::serve(listener, app(Arc::new(warden))).await?;

    Ok(())
}

fn app(warden: Arc<Warden>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/ask", post(ask))
        .route("/v1/feedback", post(feedback))
        .route("/v1/control/status", get(status))
        .route(
            "/v1/control/kill-switch",
            post(trigger_kill_switch).delete(reset_kill_switch),
        )
        .route("/v1/control/policy", put(replace_policy))
        .with_state(AppState { warden })
        .layer(TraceLayer::new_for_http())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn ask(State(state): State<AppState>, Json(req): Json<AskRequest>) -> Json<Response> {
    let session = SessionId::new(req.session_id.unwrap_or_else(|| DEFAULT_SESSION.into()));
    Json(state.warden.handle(&req.text, &session).await)
}

async fn feedback(
    State(state): State<AppState>,
    Json(req): Json<FeedbackRequest>,
) -> Result<Json<FeedbackResponse>, ApiError> {
    if req.request_text.trim().is_empty() || req.statement_text.trim().is_empty() {
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            "request_text and statement_text are required".into(),
        ));
    }
    let receipt = state.warden.submit_feedback(
        &req.request_text,
        &req.statement_text,
        req.rating,
        req.correction,
    );
    Ok(Json(FeedbackResponse {
        record_id: receipt.record_id,
        chain_hash: receipt.chain_hash,
        persisted: receipt.persisted,
    }))
}

async fn status(State(state): State<AppState>) -> Json<ControlStatus> {
    Json(state.warden.control.status())
}

async fn trigger_kill_switch(
    State(state): State<AppState>,
    body: Option<Json<TriggerRequest>>,
) -> Json<SwitchResponse> {
    let reason = body
        .and_then(|Json(req)| req.reason)
        .unwrap_or_else(|| "manual trigger".into());
    let control = &state.warden.control;
    let changed = control.trigger_kill_switch(reason);
    Json(SwitchResponse {
        changed,
        state: control.kill_switch().state(),
    })
}

async fn reset_kill_switch(State(state): State<AppState>) -> Json<SwitchResponse> {
    let control = &state.warden.control;
    let changed = control.reset_kill_switch();
    Json(SwitchResponse {
        changed,
        state: control.kill_switch().state(),
    })
}

async fn replace_policy(
    State(state): State<AppState>,
    Json(config): Json<PolicyConfig>,
) -> Result<Json<PolicyVersion>, ApiError> {
    state
        .warden
        .control
        .apply_policy_update(config)
        .map(|version| Json(PolicyVersion { version }))
        .map_err(|err| (StatusCode::BAD_REQUEST, err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use tower::ServiceExt;
    use warden_context::NullRetriever;
    use warden_embed::StaticEmbedder;
    use warden_feedback::FeedbackLedger;
    use warden_infer::ScriptedGenerator;
    use warden_memory::ConversationMemory;
    use warden_policy::{ControlPlane, KillSwitch};
    use warden_store::{FixtureBackend, QueryResult};

    fn test_app() -> Router {
        let policy = PolicyConfig {
            blocked_topics: Vec::new(),
            ..PolicyConfig::default()
        };
        let control =
            ControlPlane::new(policy, KillSwitch::new(), Arc::new(StaticEmbedder::new(vec![1.0]))).unwrap();
        let rows = QueryResult::from_rows(&["region", "total_revenue"], vec![vec!["EU", "120"]]);
        let warden = Warden::new(
            Arc::new(control),
            Arc::new(NullRetriever),
            Arc::new(ScriptedGenerator::replies([
                "```sql\nSELECT region, SUM(revenue) AS total_revenue FROM sales GROUP BY region\n```",
            ])),
            Arc::new(FixtureBackend::new().otherwise(rows)),
            Arc::new(ConversationMemory::default()),
            Arc::new(FeedbackLedger::in_memory()),
        );
        app(Arc::new(warden))
    }

    fn json_request(method: Method, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn ask_returns_answer_and_trace() {
        let response = test_app()
            .oneshot(json_request(
                Method::POST,
                "/v1/ask",
                serde_json::json!({ "text": "revenue by region", "session_id": "s1" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["outcome"], "answered");
        assert_eq!(body["blocked"], false);
        assert_eq!(body["trace"][0]["state"], "GuardCheck");
    }

    #[tokio::test]
    async fn kill_switch_round_trip_blocks_requests() {
        let app = test_app();
        let response = app
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/v1/control/kill-switch",
                serde_json::json!({ "reason": "incident" }),
            ))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["changed"], true);
        assert_eq!(body["state"]["activated_by"], "manual");

        let blocked = app
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/v1/ask",
                serde_json::json!({ "text": "revenue by region" }),
            ))
            .await
            .unwrap();
        let body = body_json(blocked).await;
        assert_eq!(body["block_reason"], "kill_switch");

        let reset = app
            .oneshot(
                Request::builder()
                    .method(Method::DELETE)
                    .uri("/v1/control/kill-switch")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(reset).await;
        assert_eq!(body["state"]["active"], false);
    }

    #[tokio::test]
    async fn invalid_policy_is_rejected() {
        let response = test_app()
            .oneshot(json_request(
                Method::PUT,
                "/v1/control/policy",
                serde_json::json!({ "similarity_threshold": 2.0 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn policy_update_bumps_version() {
        let app = test_app();
        let response = app
            .clone()
            .oneshot(json_request(
                Method::PUT,
                "/v1/control/policy",
                serde_json::json!({ "daily_cost_ceiling": "25.00" }),
            ))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["version"], 2);

        let status = app
            .oneshot(
                Request::builder()
                    .uri("/v1/control/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(status).await;
        assert_eq!(body["policy_version"], 2);
        assert_eq!(body["daily_cost_ceiling"], "25.00");
    }

    #[tokio::test]
    async fn feedback_is_acknowledged() {
        let response = test_app()
            .oneshot(json_request(
                Method::POST,
                "/v1/feedback",
                serde_json::json!({
                    "request_text": "revenue by region",
                    "statement_text": "SELECT 1",
                    "rating": "positive"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["persisted"], false);
    }
}

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;
use warden_embed::Embedder;
use warden_types::{BlockReason, Decision};

use crate::budget::{BudgetMonitor, Reservation, SpendLedger};
use crate::config::{PolicyConfig, PolicyDocument};
use crate::kill_switch::{Actor, KillSwitch, KillSwitchEvent, KillSwitchState};
use crate::rate_limit::RateLimiter;
use crate::semantic::{SemanticGuardrail, SemanticVerdict};
use crate::store::{ActivePolicy, PolicyStore};
use crate::PolicyError;

/// A request as seen by governance.
#[derive(Clone, Copy, Debug)]
pub struct GovernedRequest<'a> {
    pub caller: &'a str,
    pub text: &'a str,
    pub estimated_cost: Decimal,
}

/// Result of `validate`. An allowed admission carries the budget hold for the
/// request; settle it with the actual cost or drop it to release.
pub struct Admission {
    pub decision: Decision,
    pub policy: Arc<ActivePolicy>,
    reservation: Option<Reservation>,
}

impl fmt::Debug for Admission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Admission")
            .field("decision", &self.decision)
            .field("policy_version", &self.policy.version)
            .field("reservation", &self.reservation)
            .finish()
    }
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        self.decision.allowed
    }

    pub fn reserved_amount(&self) -> Decimal {
        self.reservation
            .as_ref()
            .map(Reservation::amount)
            .unwrap_or(Decimal::ZERO)
    }

    /// Commits the actual spend for an admitted request.
    pub fn settle(self, actual: Decimal) {
        if let Some(reservation) = self.reservation {
            reservation.commit(actual);
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ControlStatus {
    pub kill_switch: KillSwitchState,
    pub kill_switch_history: Vec<KillSwitchEvent>,
    pub spend: SpendLedger,
    pub reserved: Decimal,
    pub daily_cost_ceiling: Decimal,
    pub policy_version: u64,
    pub requests_last_minute: HashMap<String, usize>,
}

/// The governance gate. Checks run in a fixed order and stop at the first block:
/// kill switch, rate limit, budget, permission, semantic.
pub struct ControlPlane {
    policy: PolicyStore,
    kill_switch: KillSwitch,
    budget: BudgetMonitor,
    rate_limiter: RateLimiter,
    semantic: SemanticGuardrail,
}

impl ControlPlane {
    pub fn new(
        config: PolicyConfig,
        kill_switch: KillSwitch,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self, PolicyError> {
        Self::from_document(
            PolicyDocument {
                version: 1,
                policy: config,
            },
            kill_switch,
            embedder,
        )
    }

    pub fn from_document(
        doc: PolicyDocument,
        kill_switch: KillSwitch,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self, PolicyError> {
        Ok(Self {
            policy: PolicyStore::from_document(doc)?,
            budget: BudgetMonitor::new(kill_switch.clone()),
            kill_switch,
            rate_limiter: RateLimiter::new(),
            semantic: SemanticGuardrail::new(embedder),
        })
    }

    pub async fn validate(&self, request: &GovernedRequest<'_>) -> Admission {
        let policy = self.policy.snapshot();
        let (decision, reservation) = self.run_checks(&policy, request).await;
        match decision.blocked_by {
            Some(reason) => tracing::warn!(
                caller = request.caller,
                %reason,
                detail = %decision.detail,
                "request blocked"
            ),
            None => tracing::debug!(caller = request.caller, "request admitted"),
        }
        Admission {
            decision,
            policy,
            reservation,
        }
    }

    async fn run_checks(
        &self,
        policy: &ActivePolicy,
        request: &GovernedRequest<'_>,
    ) -> (Decision, Option<Reservation>) {
        let config = &policy.config;

        if self.kill_switch.is_active() {
            let reason = self
                .kill_switch
                .state()
                .reason
                .unwrap_or_else(|| "unspecified".into());
            return (
                Decision::block(BlockReason::KillSwitch, format!("kill switch active: {reason}")),
                None,
            );
        }

        if !self
            .rate_limiter
            .check_and_record(request.caller, config.max_requests_per_minute)
        {
            return (
                Decision::block(
                    BlockReason::RateLimit,
                    format!(
                        "more than {} requests in the last minute",
                        config.max_requests_per_minute
                    ),
                ),
                None,
            );
        }

        let ceiling = config.enable_cost_limits.then_some(config.daily_cost_ceiling);
        let reservation = match self.budget.reserve(request.estimated_cost, ceiling) {
            Ok(r) => r,
            Err(exceeded) => {
                return (Decision::block(BlockReason::Budget, exceeded.to_string()), None);
            }
        };

        if let Some(keyword) = policy.permissions.find(request.text) {
            return (
                Decision::block(
                    BlockReason::Permission,
                    format!("blocked operation keyword: {keyword}"),
                ),
                None,
            );
        }

        match self.semantic.evaluate(policy, request.text).await {
            SemanticVerdict::Blocked { topic, score } => (
                Decision::block(
                    BlockReason::Semantic,
                    format!("request resembles blocked topic '{topic}' (similarity {score:.2})"),
                ),
                None,
            ),
            SemanticVerdict::Unavailable { reason } => (
                Decision::block(
                    BlockReason::Semantic,
                    format!("semantic check unavailable: {reason}"),
                ),
                None,
            ),
            SemanticVerdict::Clear { .. } | SemanticVerdict::Skipped { .. } => {
                (Decision::allow(), Some(reservation))
            }
        }
    }

    /// Permission check for a generated statement, against the current policy.
    pub fn check_statement(&self, statement: &str) -> Decision {
        self.check_statement_with(&self.policy.snapshot(), statement)
    }

    pub fn check_statement_with(&self, policy: &ActivePolicy, statement: &str) -> Decision {
        match policy.permissions.find(statement) {
            Some(keyword) => Decision::block(
                BlockReason::Permission,
                format!("generated statement uses blocked operation: {keyword}"),
            ),
            None => Decision::allow(),
        }
    }

    /// Installs a new policy. Requests already validating keep their snapshot.
    pub fn apply_policy_update(&self, config: PolicyConfig) -> Result<u64, PolicyError> {
        let version = self.policy.replace(config)?;
        tracing::info!(version, "policy updated");
        Ok(version)
    }

    pub fn policy(&self) -> Arc<ActivePolicy> {
        self.policy.snapshot()
    }

    pub fn trigger_kill_switch(&self, reason: impl Into<String>) -> bool {
        self.kill_switch.trigger(reason, Actor::Manual)
    }

    pub fn reset_kill_switch(&self) -> bool {
        self.kill_switch.reset(Actor::Manual)
    }

    pub fn kill_switch(&self) -> &KillSwitch {
        &self.kill_switch
    }

    pub fn budget(&self) -> &BudgetMonitor {
        &self.budget
    }

    pub fn status(&self) -> ControlStatus {
        let policy = self.policy.snapshot();
        ControlStatus {
            kill_switch: self.kill_switch.state(),
            kill_switch_history: self.kill_switch.history(),
            spend: self.budget.ledger(),
            reserved: self.budget.reserved(),
            daily_cost_ceiling: policy.config.daily_cost_ceiling,
            policy_version: policy.version,
            requests_last_minute: self.rate_limiter.usage(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_embed::StaticEmbedder;

    const ELECTION: &str = "Who should I vote for in the election?";
    const REVENUE: &str = "What was total revenue last month?";

    fn usd(cents: i64) -> Decimal {
        Decimal::new(cents, 2)
    }

    fn topic_embedder() -> StaticEmbedder {
        StaticEmbedder::new(vec![0.0, 1.0])
            .with("politics", vec![1.0, 0.0])
            .with(ELECTION, vec![0.42, (1.0f32 - 0.42 * 0.42).sqrt()])
            .with(REVENUE, vec![0.07, (1.0f32 - 0.07 * 0.07).sqrt()])
    }

    fn config() -> PolicyConfig {
        PolicyConfig {
            blocked_topics: vec!["politics".into()],
            similarity_threshold: 0.35,
            ..PolicyConfig::default()
        }
    }

    fn plane(config: PolicyConfig, embedder: StaticEmbedder) -> ControlPlane {
        ControlPlane::new(config, KillSwitch::new(), Arc::new(embedder)).unwrap()
    }

    fn request<'a>(text: &'a str, cents: i64) -> GovernedRequest<'a> {
        GovernedRequest {
            caller: "analyst",
            text,
            estimated_cost: usd(cents),
        }
    }

    #[tokio::test]
    async fn active_kill_switch_blocks_everything() {
        let cp = plane(config(), topic_embedder());
        cp.trigger_kill_switch("maintenance");
        let admission = cp.validate(&request(REVENUE, 1)).await;
        assert!(admission.decision.is_blocked_by(BlockReason::KillSwitch));
        assert!(admission.decision.detail.contains("maintenance"));

        cp.reset_kill_switch();
        assert!(cp.validate(&request(REVENUE, 1)).await.is_allowed());
    }

    #[tokio::test]
    async fn budget_block_trips_kill_switch_for_later_requests() {
        let cp = plane(config(), topic_embedder());
        cp.budget().reserve(usd(950), None).unwrap().commit(usd(950));

        let first = cp.validate(&request(REVENUE, 100)).await;
        assert!(first.decision.is_blocked_by(BlockReason::Budget));
        let state = cp.kill_switch().state();
        assert_eq!(state.reason.as_deref(), Some("budget exceeded"));
        assert_eq!(state.activated_by, Some(Actor::BudgetMonitor));

        let second = cp.validate(&request(REVENUE, 0)).await;
        assert!(second.decision.is_blocked_by(BlockReason::KillSwitch));
    }

    #[tokio::test]
    async fn destructive_request_is_a_permission_block_and_releases_budget() {
        let cp = plane(config(), topic_embedder());
        let admission = cp.validate(&request("DROP TABLE sales", 10)).await;
        assert!(admission.decision.is_blocked_by(BlockReason::Permission));
        assert!(admission.decision.detail.contains("DROP"));
        assert_eq!(cp.budget().reserved(), Decimal::ZERO);
        assert_eq!(cp.budget().ledger().daily_total, Decimal::ZERO);
    }

    #[tokio::test]
    async fn similarity_above_threshold_is_blocked() {
        let cp = plane(config(), topic_embedder());
        let admission = cp.validate(&request(ELECTION, 1)).await;
        assert!(admission.decision.is_blocked_by(BlockReason::Semantic));
        assert!(admission.decision.detail.contains("politics"));

        assert!(cp.validate(&request(REVENUE, 1)).await.is_allowed());
    }

    #[tokio::test]
    async fn similarity_equal_to_threshold_is_allowed() {
        let embedder = StaticEmbedder::new(vec![0.0, 1.0])
            .with("politics", vec![1.0, 0.0])
            .with("borderline", vec![1.0, 0.0]);
        let cp = plane(
            PolicyConfig {
                similarity_threshold: 1.0,
                ..config()
            },
            embedder,
        );
        assert!(cp.validate(&request("borderline", 1)).await.is_allowed());
    }

    #[tokio::test]
    async fn embedding_outage_fails_open_by_default() {
        let cp = plane(config(), StaticEmbedder::unavailable());
        assert!(cp.validate(&request(REVENUE, 1)).await.is_allowed());
    }

    #[tokio::test]
    async fn embedding_outage_blocks_when_fail_closed() {
        let cp = plane(
            PolicyConfig {
                semantic_fail_open: false,
                ..config()
            },
            StaticEmbedder::unavailable(),
        );
        let admission = cp.validate(&request(REVENUE, 1)).await;
        assert!(admission.decision.is_blocked_by(BlockReason::Semantic));
    }

    #[tokio::test]
    async fn concurrent_requests_cannot_share_remaining_budget() {
        let cp = plane(config(), topic_embedder());
        let (first, second) = (request(REVENUE, 600), request(REVENUE, 600));
        let (a, b) = tokio::join!(cp.validate(&first), cp.validate(&second));
        let blocked = [&a, &b]
            .iter()
            .filter(|adm| adm.decision.is_blocked_by(BlockReason::Budget))
            .count();
        assert_eq!(blocked, 1);
        let winner = if a.is_allowed() { a } else { b };
        winner.settle(usd(600));
        assert_eq!(cp.budget().ledger().daily_total, usd(600));
        assert_eq!(cp.budget().reserved(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn rate_limit_counts_admitted_requests_per_caller() {
        let cp = plane(
            PolicyConfig {
                max_requests_per_minute: 2,
                ..config()
            },
            topic_embedder(),
        );
        assert!(cp.validate(&request(REVENUE, 0)).await.is_allowed());
        assert!(cp.validate(&request(REVENUE, 0)).await.is_allowed());
        let third = cp.validate(&request(REVENUE, 0)).await;
        assert!(third.decision.is_blocked_by(BlockReason::RateLimit));

        let other = GovernedRequest {
            caller: "someone-else",
            ..request(REVENUE, 0)
        };
        assert!(cp.validate(&other).await.is_allowed());
        assert_eq!(cp.status().requests_last_minute.get("analyst"), Some(&2));
    }

    #[tokio::test]
    async fn policy_update_applies_to_new_requests() {
        let cp = plane(config(), topic_embedder());
        let before = cp.validate(&request("show the merge history", 0)).await;
        assert!(before.decision.is_blocked_by(BlockReason::Permission));

        let mut relaxed = config();
        relaxed.blocked_operation_keywords.remove("MERGE");
        assert_eq!(cp.apply_policy_update(relaxed).unwrap(), 2);
        assert!(cp.validate(&request("show the merge history", 0)).await.is_allowed());
        assert_eq!(cp.status().policy_version, 2);
    }

    #[test]
    fn generated_statements_are_checked_for_blocked_operations() {
        let cp = plane(config(), topic_embedder());
        assert!(cp.check_statement("SELECT region FROM dim_store").allowed);
        let decision = cp.check_statement("DELETE FROM fact_sales_forecast");
        assert!(decision.is_blocked_by(BlockReason::Permission));
    }
}

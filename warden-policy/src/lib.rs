//! Governance for the query loop: kill switch, rate limits, daily budget,
//! blocked operations and off-topic detection behind one `validate` call.

use thiserror::Error;

pub mod budget;
pub mod config;
pub mod control_plane;
pub mod kill_switch;
pub mod permission;
pub mod rate_limit;
pub mod semantic;
pub mod store;

pub use budget::{BudgetExceeded, BudgetMonitor, Reservation, SpendLedger, BUDGET_EXCEEDED};
pub use config::{PolicyConfig, PolicyDocument};
pub use control_plane::{Admission, ControlPlane, ControlStatus, GovernedRequest};
pub use kill_switch::{Actor, KillSwitch, KillSwitchEvent, KillSwitchState, SwitchAction};
pub use permission::PermissionChecker;
pub use rate_limit::RateLimiter;
pub use semantic::{SemanticGuardrail, SemanticVerdict};
pub use store::{ActivePolicy, PolicyStore};

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("invalid policy: {0}")]
    Invalid(String),
    #[error("policy io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("policy parse error: {0}")]
    Parse(String),
}

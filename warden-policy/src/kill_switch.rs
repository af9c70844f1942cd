use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who flipped the switch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    Manual,
    BudgetMonitor,
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Actor::Manual => "manual",
            Actor::BudgetMonitor => "budget_monitor",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchAction {
    Activated,
    Reset,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillSwitchState {
    pub active: bool,
    pub reason: Option<String>,
    pub activated_at: Option<DateTime<Utc>>,
    pub activated_by: Option<Actor>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillSwitchEvent {
    pub action: SwitchAction,
    pub reason: Option<String>,
    pub actor: Actor,
    pub at: DateTime<Utc>,
}

struct Inner {
    active: AtomicBool,
    state: Mutex<KillSwitchState>,
    history: Mutex<Vec<KillSwitchEvent>>,
}

/// Shared emergency stop. Clones observe the same state; a trip is visible to
/// every request that starts after `trigger` returns.
#[derive(Clone)]
pub struct KillSwitch {
    inner: Arc<Inner>,
}

impl Default for KillSwitch {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for KillSwitch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KillSwitch")
            .field("active", &self.is_active())
            .finish()
    }
}

impl KillSwitch {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                active: AtomicBool::new(false),
                state: Mutex::new(KillSwitchState::default()),
                history: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Activates the switch. Returns false if it was already active, in which
    /// case the original reason is kept.
    pub fn trigger(&self, reason: impl Into<String>, actor: Actor) -> bool {
        let reason = reason.into();
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.active {
            return false;
        }
        let now = Utc::now();
        *state = KillSwitchState {
            active: true,
            reason: Some(reason.clone()),
            activated_at: Some(now),
            activated_by: Some(actor),
        };
        self.inner.active.store(true, Ordering::SeqCst);
        drop(state);

        tracing::warn!(%actor, %reason, "kill switch activated");
        self.record(KillSwitchEvent {
            action: SwitchAction::Activated,
            reason: Some(reason),
            actor,
            at: now,
        });
        true
    }

    /// Clears the switch. Returns false if it was not active.
    pub fn reset(&self, actor: Actor) -> bool {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.active {
            return false;
        }
        *state = KillSwitchState::default();
        self.inner.active.store(false, Ordering::SeqCst);
        drop(state);

        tracing::info!(%actor, "kill switch reset");
        self.record(KillSwitchEvent {
            action: SwitchAction::Reset,
            reason: None,
            actor,
            at: Utc::now(),
        });
        true
    }

    pub fn state(&self) -> KillSwitchState {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn history(&self) -> Vec<KillSwitchEvent> {
        self.inner
            .history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn record(&self, event: KillSwitchEvent) {
        self.inner
            .history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}

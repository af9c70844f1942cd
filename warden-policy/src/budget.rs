use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::kill_switch::{Actor, KillSwitch};

pub const BUDGET_EXCEEDED: &str = "budget exceeded";

/// Committed spend for the current UTC day. `daily_total` only grows within a window.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendLedger {
    pub daily_total: Decimal,
    pub window_start: DateTime<Utc>,
}

impl SpendLedger {
    fn starting(now: DateTime<Utc>) -> Self {
        Self {
            daily_total: Decimal::ZERO,
            window_start: day_start(now),
        }
    }
}

fn day_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_time(NaiveTime::MIN).and_utc()
}

#[derive(Debug)]
struct LedgerState {
    ledger: SpendLedger,
    /// Held by requests that passed the check but have not settled yet.
    reserved: Decimal,
}

impl LedgerState {
    fn roll(&mut self, now: DateTime<Utc>) {
        if now.date_naive() > self.ledger.window_start.date_naive() {
            tracing::info!(
                previous_total = %self.ledger.daily_total,
                "budget window rolled over"
            );
            self.ledger = SpendLedger::starting(now);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BudgetExceeded {
    pub committed: Decimal,
    pub reserved: Decimal,
    pub requested: Decimal,
    pub ceiling: Decimal,
}

impl fmt::Display for BudgetExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{BUDGET_EXCEEDED}: spent {} + in flight {} + estimated {} > ceiling {}",
            self.committed, self.reserved, self.requested, self.ceiling
        )
    }
}

struct BudgetInner {
    state: Mutex<LedgerState>,
    kill_switch: KillSwitch,
}

/// Daily spend tracking. The check and the hold happen under one lock, so two
/// concurrent requests can never both fit into the same remaining budget.
#[derive(Clone)]
pub struct BudgetMonitor {
    inner: Arc<BudgetInner>,
}

impl BudgetMonitor {
    pub fn new(kill_switch: KillSwitch) -> Self {
        Self::starting_at(kill_switch, Utc::now())
    }

    pub fn starting_at(kill_switch: KillSwitch, now: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(BudgetInner {
                state: Mutex::new(LedgerState {
                    ledger: SpendLedger::starting(now),
                    reserved: Decimal::ZERO,
                }),
                kill_switch,
            }),
        }
    }

    pub fn ledger(&self) -> SpendLedger {
        self.ledger_at(Utc::now())
    }

    pub fn ledger_at(&self, now: DateTime<Utc>) -> SpendLedger {
        let mut state = self.lock();
        state.roll(now);
        state.ledger.clone()
    }

    pub fn reserved(&self) -> Decimal {
        self.lock().reserved
    }

    /// Holds `amount` against `ceiling`. Passing `None` skips the check but still
    /// tracks the spend. A refusal trips the kill switch.
    pub fn reserve(
        &self,
        amount: Decimal,
        ceiling: Option<Decimal>,
    ) -> Result<Reservation, BudgetExceeded> {
        self.reserve_at(amount, ceiling, Utc::now())
    }

    pub fn reserve_at(
        &self,
        amount: Decimal,
        ceiling: Option<Decimal>,
        now: DateTime<Utc>,
    ) -> Result<Reservation, BudgetExceeded> {
        let amount = amount.max(Decimal::ZERO);
        let mut state = self.lock();
        state.roll(now);
        if let Some(ceiling) = ceiling {
            if state.ledger.daily_total + state.reserved + amount > ceiling {
                let err = BudgetExceeded {
                    committed: state.ledger.daily_total,
                    reserved: state.reserved,
                    requested: amount,
                    ceiling,
                };
                drop(state);
                self.inner.kill_switch.trigger(BUDGET_EXCEEDED, Actor::BudgetMonitor);
                return Err(err);
            }
        }
        state.reserved += amount;
        drop(state);
        Ok(Reservation {
            monitor: self.clone(),
            amount,
            ceiling,
            settled: false,
        })
    }

    fn release(&self, amount: Decimal) {
        let mut state = self.lock();
        state.reserved = (state.reserved - amount).max(Decimal::ZERO);
    }

    fn settle(&self, held: Decimal, actual: Decimal, ceiling: Option<Decimal>, now: DateTime<Utc>) {
        let mut state = self.lock();
        state.reserved = (state.reserved - held).max(Decimal::ZERO);
        state.roll(now);
        state.ledger.daily_total += actual.max(Decimal::ZERO);
        let over = ceiling.is_some_and(|c| state.ledger.daily_total > c);
        let total = state.ledger.daily_total;
        drop(state);
        tracing::debug!(%actual, %total, "spend committed");
        if over {
            self.inner.kill_switch.trigger(BUDGET_EXCEEDED, Actor::BudgetMonitor);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LedgerState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// An in-flight spend hold. Dropping it without `commit` releases the hold.
#[must_use = "dropping a reservation releases it"]
pub struct Reservation {
    monitor: BudgetMonitor,
    amount: Decimal,
    ceiling: Option<Decimal>,
    settled: bool,
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("amount", &self.amount)
            .field("ceiling", &self.ceiling)
            .finish()
    }
}

impl Reservation {
    pub fn amount(&self) -> Decimal {
        self.amount
    }

    /// Replaces the hold with the actual cost.
    pub fn commit(self, actual: Decimal) {
        self.commit_at(actual, Utc::now())
    }

    pub fn commit_at(mut self, actual: Decimal, now: DateTime<Utc>) {
        self.settled = true;
        self.monitor.settle(self.amount, actual, self.ceiling, now);
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.settled {
            self.monitor.release(self.amount);
        }
    }
}

//! Session lifecycle and in-memory accrual
//!
//! [`SessionPhase`] is the lifecycle of one user's mining session.
//! [`SessionAccrual`] is the cache half of the cache-plus-authority pair: the
//! durable session row holds the checkpointed earnings, this holds what has
//! been accrued since. Displayed earnings are always the sum of both.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rust_decimal::Decimal;

use crate::domain::services::{accrual_for_ticks, to_ledger_scale};
use crate::error::{MiningError, MiningResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    /// Durable session row being created
    Starting,
    Active,
    /// Terminal flush in flight
    Stopping,
}

impl SessionPhase {
    pub fn begin_start(self) -> MiningResult<SessionPhase> {
        match self {
            SessionPhase::Idle => Ok(SessionPhase::Starting),
            SessionPhase::Active => Err(MiningError::SessionAlreadyActive),
            SessionPhase::Starting | SessionPhase::Stopping => {
                Err(MiningError::SessionTransitionInProgress)
            }
        }
    }

    pub fn begin_stop(self) -> MiningResult<SessionPhase> {
        match self {
            SessionPhase::Active => Ok(SessionPhase::Stopping),
            SessionPhase::Idle => Err(MiningError::NoActiveSession),
            SessionPhase::Starting | SessionPhase::Stopping => {
                Err(MiningError::SessionTransitionInProgress)
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Idle => "idle",
            SessionPhase::Starting => "starting",
            SessionPhase::Active => "active",
            SessionPhase::Stopping => "stopping",
        }
    }
}

#[derive(Debug, Default)]
struct AccrualState {
    /// Last durable `earnings` of the session
    checkpointed: Decimal,
    /// Drained but not yet confirmed by the store
    in_flight: Decimal,
    /// Ticks since this accrual was created
    ticks: u64,
    /// Everything handed out by [`SessionAccrual::drain`], confirmed or not
    drained: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccrualSnapshot {
    pub checkpointed: Decimal,
    /// In-flight plus not yet drained
    pub unflushed: Decimal,
    pub ticks: u64,
}

impl AccrualSnapshot {
    pub fn total(&self) -> Decimal {
        self.checkpointed + self.unflushed
    }
}

/// Shared between the tick timer, the checkpoint timer and readers.
///
/// Ticks are counted, not summed: the accrued amount is always computed from
/// the tick count in one step, so it carries no per-tick rounding. Every
/// operation takes the lock once, so a drain can never observe half a tick
/// and a tick can never land between the read and the update of a drain.
#[derive(Debug)]
pub struct SessionAccrual {
    rate_per_minute: Decimal,
    tick: Duration,
    state: Mutex<AccrualState>,
}

impl SessionAccrual {
    /// Seeded from the session's durable earnings; each tick accrues one
    /// `tick` worth of `rate_per_minute`
    pub fn new(checkpointed: Decimal, rate_per_minute: Decimal, tick: Duration) -> Self {
        Self {
            rate_per_minute,
            tick,
            state: Mutex::new(AccrualState {
                checkpointed,
                ..AccrualState::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AccrualState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn accrued(&self, ticks: u64) -> Decimal {
        accrual_for_ticks(self.rate_per_minute, self.tick, ticks)
    }

    pub fn tick(&self) {
        self.lock().ticks += 1;
    }

    /// Read-and-zero.
    ///
    /// Returns what the ledger can store of the accrual since the last drain;
    /// the sub-precision remainder stays for the next one. The returned
    /// amount is in flight until [`confirm`](Self::confirm) or
    /// [`abandon`](Self::abandon).
    pub fn drain(&self) -> Decimal {
        let mut state = self.lock();
        let amount = to_ledger_scale(self.accrued(state.ticks)) - state.drained;
        if amount <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        state.drained += amount;
        state.in_flight += amount;
        amount
    }

    /// The store accepted `amount`; `session_earnings` is its new total
    pub fn confirm(&self, amount: Decimal, session_earnings: Decimal) {
        let mut state = self.lock();
        state.in_flight = (state.in_flight - amount).max(Decimal::ZERO);
        state.checkpointed = session_earnings;
    }

    /// `amount` will never be written
    pub fn abandon(&self, amount: Decimal) {
        let mut state = self.lock();
        state.in_flight = (state.in_flight - amount).max(Decimal::ZERO);
    }

    pub fn snapshot(&self) -> AccrualSnapshot {
        let state = self.lock();
        let undrained = (self.accrued(state.ticks) - state.drained).max(Decimal::ZERO);
        AccrualSnapshot {
            checkpointed: state.checkpointed,
            unflushed: state.in_flight + undrained,
            ticks: state.ticks,
        }
    }
}

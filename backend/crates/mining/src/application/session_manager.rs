//! Session State Machine
//!
//! Owns every session that is live in this process. Each user has at most one
//! slot (`Starting`, `Active` or `Stopping`); no slot means `Idle`. The slot
//! map is behind a synchronous mutex that is never held across an await, and
//! every transition out of `Starting`/`Stopping` goes through a guard so a
//! cancelled request cannot leave a user stuck mid-transition.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use kernel::id::MiningSessionId;
use rust_decimal::Decimal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::application::checkpoint::{CheckpointFlusher, run_checkpoint_timer};
use crate::application::config::MiningConfig;
use crate::application::rate::{MiningRate, RateResolver};
use crate::application::settlement::SettlementService;
use crate::domain::entities::{MiningSession, UserBalance};
use crate::domain::repository::{AntiCheatClassifier, MiningStore};
use crate::domain::session::{SessionAccrual, SessionPhase};
use crate::domain::value_objects::UserId;
use crate::error::{ErrorClass, MiningError, MiningResult};

/// Result of a successful start or resume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedSession {
    pub session_id: MiningSessionId,
    pub started_at: DateTime<Utc>,
    pub rate: MiningRate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoppedSession {
    pub session_id: MiningSessionId,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Final durable session earnings
    pub earnings: Decimal,
}

/// What the UI shows for one user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayState {
    pub phase: SessionPhase,
    pub active: bool,
    pub session_id: Option<MiningSessionId>,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_seconds: i64,
    /// Currency per minute
    pub current_rate: Decimal,
    pub hash_rate: Decimal,
    pub efficiency_percent: Decimal,
    pub checkpointed_earnings: Decimal,
    pub unflushed_earnings: Decimal,
    pub session_earnings: Decimal,
}

impl DisplayState {
    fn inactive(phase: SessionPhase) -> Self {
        Self {
            phase,
            active: false,
            session_id: None,
            started_at: None,
            uptime_seconds: 0,
            current_rate: Decimal::ZERO,
            hash_rate: Decimal::ZERO,
            efficiency_percent: Decimal::ZERO,
            checkpointed_earnings: Decimal::ZERO,
            unflushed_earnings: Decimal::ZERO,
            session_earnings: Decimal::ZERO,
        }
    }
}

struct SessionRuntime<S>
where
    S: MiningStore,
{
    session_id: MiningSessionId,
    /// `node_start_time`, which survives resumes
    started_at: DateTime<Utc>,
    rate: MiningRate,
    accrual: Arc<SessionAccrual>,
    flusher: Arc<CheckpointFlusher<S>>,
}

impl<S> SessionRuntime<S>
where
    S: MiningStore,
{
    fn display(&self, now: DateTime<Utc>) -> DisplayState {
        let snapshot = self.accrual.snapshot();
        DisplayState {
            phase: SessionPhase::Active,
            active: true,
            session_id: Some(self.session_id),
            started_at: Some(self.started_at),
            uptime_seconds: (now - self.started_at).num_seconds().max(0),
            current_rate: self.rate.per_minute,
            hash_rate: self.rate.hash_rate(),
            efficiency_percent: self.rate.efficiency_percent(),
            checkpointed_earnings: snapshot.checkpointed,
            unflushed_earnings: snapshot.unflushed,
            session_earnings: snapshot.total(),
        }
    }

    fn started(&self) -> StartedSession {
        StartedSession {
            session_id: self.session_id,
            started_at: self.started_at,
            rate: self.rate,
        }
    }
}

struct SessionTimers {
    tick_stop: watch::Sender<bool>,
    tick: JoinHandle<()>,
    checkpoint_stop: watch::Sender<bool>,
    checkpoint: JoinHandle<()>,
}

impl SessionTimers {
    /// Stop the tick timer, then the checkpoint timer. An in-flight flush
    /// finishes before this returns.
    async fn cancel(self) {
        let _ = self.tick_stop.send(true);
        let _ = self.tick.await;
        let _ = self.checkpoint_stop.send(true);
        let _ = self.checkpoint.await;
    }
}

struct ActiveSession<S>
where
    S: MiningStore,
{
    runtime: SessionRuntime<S>,
    timers: SessionTimers,
}

enum SessionSlot<S>
where
    S: MiningStore,
{
    Starting,
    Active(ActiveSession<S>),
    Stopping,
}

impl<S> SessionSlot<S>
where
    S: MiningStore,
{
    fn phase(&self) -> SessionPhase {
        match self {
            SessionSlot::Starting => SessionPhase::Starting,
            SessionSlot::Active(_) => SessionPhase::Active,
            SessionSlot::Stopping => SessionPhase::Stopping,
        }
    }
}

type Slots<S> = Mutex<HashMap<UserId, SessionSlot<S>>>;

fn lock<S>(slots: &Slots<S>) -> MutexGuard<'_, HashMap<UserId, SessionSlot<S>>>
where
    S: MiningStore,
{
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes a user's transitional slot when dropped, unless disarmed
struct TransitionGuard<'a, S>
where
    S: MiningStore,
{
    slots: &'a Slots<S>,
    user_id: &'a UserId,
    armed: bool,
}

impl<'a, S> TransitionGuard<'a, S>
where
    S: MiningStore,
{
    fn new(slots: &'a Slots<S>, user_id: &'a UserId) -> Self {
        Self {
            slots,
            user_id,
            armed: true,
        }
    }

    /// Replace the transitional slot with `slot`
    fn commit(mut self, slot: SessionSlot<S>) {
        self.armed = false;
        lock(self.slots).insert(self.user_id.clone(), slot);
    }
}

impl<S> Drop for TransitionGuard<'_, S>
where
    S: MiningStore,
{
    fn drop(&mut self) {
        if self.armed {
            lock(self.slots).remove(self.user_id);
        }
    }
}

async fn run_tick_timer(
    accrual: Arc<SessionAccrual>,
    period: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => accrual.tick(),
            _ = stop.changed() => break,
        }
    }
}

pub struct MiningSessionManager<S, A>
where
    S: MiningStore,
    A: AntiCheatClassifier + Sync + 'static,
{
    store: Arc<S>,
    settlement: Arc<SettlementService<S>>,
    rates: RateResolver<A>,
    config: Arc<MiningConfig>,
    slots: Slots<S>,
}

impl<S, A> MiningSessionManager<S, A>
where
    S: MiningStore,
    A: AntiCheatClassifier + Sync + 'static,
{
    pub fn new(store: Arc<S>, classifier: Arc<A>, config: Arc<MiningConfig>) -> Self {
        Self {
            settlement: Arc::new(SettlementService::new(store.clone(), config.clone())),
            rates: RateResolver::new(classifier, config.clone()),
            store,
            config,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn settlement(&self) -> Arc<SettlementService<S>> {
        self.settlement.clone()
    }

    pub fn config(&self) -> &MiningConfig {
        &self.config
    }

    pub fn phase(&self, user_id: &UserId) -> SessionPhase {
        lock(&self.slots)
            .get(user_id)
            .map(SessionSlot::phase)
            .unwrap_or(SessionPhase::Idle)
    }

    /// Number of sessions currently accruing in this process
    pub fn active_count(&self) -> usize {
        lock(&self.slots)
            .values()
            .filter(|slot| matches!(slot, SessionSlot::Active(_)))
            .count()
    }

    /// Open a new session and start accruing.
    ///
    /// `SessionAlreadyActive` if the user has an open session in memory or
    /// in the store.
    pub async fn start(&self, user_id: &UserId, ip: Option<IpAddr>) -> MiningResult<StartedSession> {
        self.begin(user_id, SessionPhase::begin_start)?;
        let guard = TransitionGuard::new(&self.slots, user_id);

        let user = self
            .store
            .find_by_id(user_id)
            .await?
            .ok_or(MiningError::UserNotFound)?;
        if self.store.find_open(user_id).await?.is_some() {
            return Err(MiningError::SessionAlreadyActive);
        }

        let rate = self.rates.resolve(&user, ip).await;
        let session = MiningSession::open(
            user_id.clone(),
            Utc::now(),
            rate.hash_rate(),
            rate.efficiency_percent(),
        );
        self.store.open(&session).await?;

        let runtime = self.runtime(&session, session.started_at, rate);
        let started = runtime.started();
        let timers = self.spawn_timers(&runtime);
        guard.commit(SessionSlot::Active(ActiveSession { runtime, timers }));

        tracing::info!(
            user_id = %user_id,
            session_id = %started.session_id,
            rate_per_minute = %rate.per_minute,
            penalty_level = rate.penalty_level,
            "Mining session started"
        );
        Ok(started)
    }

    /// Resume a durable open session, seeded from its checkpointed earnings
    pub async fn resume(
        &self,
        user: &UserBalance,
        session: &MiningSession,
        ip: Option<IpAddr>,
    ) -> MiningResult<StartedSession> {
        self.begin(&user.user_id, SessionPhase::begin_start)?;
        let guard = TransitionGuard::new(&self.slots, &user.user_id);

        let rate = self.rates.resolve(user, ip).await;
        let started_at = user.node_start_time.unwrap_or(session.started_at);
        let runtime = self.runtime(session, started_at, rate);
        let started = runtime.started();
        let timers = self.spawn_timers(&runtime);
        guard.commit(SessionSlot::Active(ActiveSession { runtime, timers }));

        tracing::info!(
            user_id = %user.user_id,
            session_id = %session.session_id,
            checkpointed = %session.earnings,
            last_sequence = session.last_checkpoint_seq,
            "Mining session resumed"
        );
        Ok(started)
    }

    /// Stop accruing, flush, and close the session.
    ///
    /// If the final flush or the close fails for any reason other than the
    /// session being gone, the session goes back to `Active` with fresh
    /// timers and the error is returned.
    pub async fn stop(&self, user_id: &UserId) -> MiningResult<StoppedSession> {
        let taken = {
            let mut slots = lock(&self.slots);
            let phase = slots
                .get(user_id)
                .map(SessionSlot::phase)
                .unwrap_or(SessionPhase::Idle);
            if phase != SessionPhase::Idle {
                phase.begin_stop()?;
            }
            match slots.insert(user_id.clone(), SessionSlot::Stopping) {
                Some(SessionSlot::Active(active)) => Some(active),
                _ => None,
            }
        };
        let guard = TransitionGuard::new(&self.slots, user_id);

        let Some(ActiveSession { runtime, timers }) = taken else {
            return self.stop_untracked(user_id).await;
        };

        timers.cancel().await;

        let result = match runtime.flusher.flush().await {
            Ok(_) => {
                self.store
                    .close(user_id, runtime.session_id, Utc::now())
                    .await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(closed) => {
                let ended_at = closed.ended_at.unwrap_or_else(Utc::now);
                tracing::info!(
                    user_id = %user_id,
                    session_id = %closed.session_id,
                    earnings = %closed.earnings,
                    "Mining session stopped"
                );
                Ok(StoppedSession {
                    session_id: closed.session_id,
                    started_at: runtime.started_at,
                    ended_at,
                    earnings: closed.earnings,
                })
            }
            Err(e) if e.class() == ErrorClass::NotFound => {
                tracing::warn!(
                    user_id = %user_id,
                    session_id = %runtime.session_id,
                    error = %e,
                    "Session disappeared during stop, discarding in-memory state"
                );
                Err(e)
            }
            Err(e) => {
                tracing::warn!(
                    user_id = %user_id,
                    session_id = %runtime.session_id,
                    error = %e,
                    "Stop failed, session restored to active"
                );
                let timers = self.spawn_timers(&runtime);
                guard.commit(SessionSlot::Active(ActiveSession { runtime, timers }));
                Err(e)
            }
        }
    }

    /// Close a durable open session this process never resumed
    async fn stop_untracked(&self, user_id: &UserId) -> MiningResult<StoppedSession> {
        let session = self
            .store
            .find_open(user_id)
            .await?
            .ok_or(MiningError::NoActiveSession)?;
        let closed = self
            .store
            .close(user_id, session.session_id, Utc::now())
            .await?;

        tracing::warn!(
            user_id = %user_id,
            session_id = %closed.session_id,
            earnings = %closed.earnings,
            "Closed session with no in-memory state at its checkpointed earnings"
        );
        Ok(StoppedSession {
            session_id: closed.session_id,
            started_at: closed.started_at,
            ended_at: closed.ended_at.unwrap_or_else(Utc::now),
            earnings: closed.earnings,
        })
    }

    pub fn display_state(&self, user_id: &UserId) -> DisplayState {
        match lock(&self.slots).get(user_id) {
            Some(SessionSlot::Active(active)) => active.runtime.display(Utc::now()),
            Some(slot) => DisplayState::inactive(slot.phase()),
            None => DisplayState::inactive(SessionPhase::Idle),
        }
    }

    /// Stop every timer and flush every active session without closing it.
    ///
    /// Returns the number of sessions flushed successfully.
    pub async fn shutdown(&self) -> usize {
        let active: Vec<(UserId, ActiveSession<S>)> = {
            let mut slots = lock(&self.slots);
            let ids: Vec<UserId> = slots
                .iter()
                .filter(|(_, slot)| matches!(slot, SessionSlot::Active(_)))
                .map(|(user_id, _)| user_id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|user_id| match slots.remove(&user_id) {
                    Some(SessionSlot::Active(active)) => Some((user_id, active)),
                    _ => None,
                })
                .collect()
        };

        let mut flushed = 0;
        for (user_id, ActiveSession { runtime, timers }) in active {
            timers.cancel().await;
            match runtime.flusher.flush().await {
                Ok(_) => flushed += 1,
                Err(e) => {
                    tracing::error!(
                        user_id = %user_id,
                        session_id = %runtime.session_id,
                        error = %e,
                        "Final flush failed during shutdown"
                    );
                }
            }
        }

        tracing::info!(flushed, "Mining sessions flushed for shutdown");
        flushed
    }

    /// Run `transition` against the user's current phase and occupy the
    /// slot with the resulting transitional state.
    fn begin(
        &self,
        user_id: &UserId,
        transition: fn(SessionPhase) -> MiningResult<SessionPhase>,
    ) -> MiningResult<()> {
        let mut slots = lock(&self.slots);
        let phase = slots
            .get(user_id)
            .map(SessionSlot::phase)
            .unwrap_or(SessionPhase::Idle);
        let slot = match transition(phase)? {
            SessionPhase::Starting => SessionSlot::Starting,
            SessionPhase::Stopping => SessionSlot::Stopping,
            other => {
                return Err(MiningError::Internal(format!(
                    "unexpected transition target: {}",
                    other.as_str()
                )));
            }
        };
        slots.insert(user_id.clone(), slot);
        Ok(())
    }

    fn runtime(
        &self,
        session: &MiningSession,
        started_at: DateTime<Utc>,
        rate: MiningRate,
    ) -> SessionRuntime<S> {
        let accrual = Arc::new(SessionAccrual::new(
            session.earnings,
            rate.per_minute,
            self.config.tick_interval,
        ));
        let flusher = Arc::new(CheckpointFlusher::new(
            session.user_id.clone(),
            session.session_id,
            session.last_checkpoint_seq,
            accrual.clone(),
            self.settlement.clone(),
            self.config.flush_failure_policy,
        ));
        SessionRuntime {
            session_id: session.session_id,
            started_at,
            rate,
            accrual,
            flusher,
        }
    }

    fn spawn_timers(&self, runtime: &SessionRuntime<S>) -> SessionTimers {
        let tick_interval = self.config.tick_interval;

        let (tick_stop, tick_rx) = watch::channel(false);
        let tick = tokio::spawn(run_tick_timer(
            runtime.accrual.clone(),
            tick_interval,
            tick_rx,
        ));

        let (checkpoint_stop, checkpoint_rx) = watch::channel(false);
        let checkpoint = tokio::spawn(run_checkpoint_timer(
            runtime.flusher.clone(),
            self.config.checkpoint_interval,
            checkpoint_rx,
        ));

        SessionTimers {
            tick_stop,
            tick,
            checkpoint_stop,
            checkpoint,
        }
    }
}

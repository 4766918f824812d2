//! In-memory store
//!
//! Same transactional contract as the PostgreSQL repository: each write runs
//! against a copy of the state under one store-wide lock and replaces the
//! state only if every step succeeded. Used by tests and local runs without a
//! database, with fault injection for the failure paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use kernel::id::MiningSessionId;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::Mutex as AsyncMutex;

use crate::domain::entities::{MiningSession, ReferralEarning, Task, TaskProgress, UserBalance};
use crate::domain::ledger::{
    AccrualCheckpoint, CheckpointReceipt, SettlementPlan, TaskCompletion,
};
use crate::domain::repository::{
    MiningSessionRepository, SettlementRepository, TaskCatalog, UserBalanceRepository,
};
use crate::domain::value_objects::{TaskType, UserId};
use crate::error::{MiningError, MiningResult};

#[derive(Debug, Clone, Default)]
struct StoreState {
    users: HashMap<UserId, UserBalance>,
    sessions: HashMap<MiningSessionId, MiningSession>,
    referral_log: Vec<ReferralEarning>,
    task_progress: HashMap<(UserId, String), TaskProgress>,
}

impl StoreState {
    fn open_session(&self, user_id: &UserId) -> Option<&MiningSession> {
        self.sessions
            .values()
            .find(|s| &s.user_id == user_id && s.is_open())
    }
}

#[derive(Debug, Default)]
struct Faults {
    unavailable: bool,
    failing_writes: u32,
    lost_acks: u32,
    failing_referrals: bool,
}

#[derive(Debug, Default)]
struct Inner {
    state: AsyncMutex<StoreState>,
    faults: Mutex<Faults>,
    commits: AtomicU64,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryMiningStore {
    inner: Arc<Inner>,
}

fn unavailable(reason: &str) -> MiningError {
    MiningError::StorageUnavailable(reason.to_string())
}

impl InMemoryMiningStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn faults(&self) -> MutexGuard<'_, Faults> {
        self.inner.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every call fails with `StorageUnavailable` while set
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults().unavailable = unavailable;
    }

    /// The next `n` write transactions fail before committing
    pub fn fail_next_writes(&self, n: u32) {
        self.faults().failing_writes = n;
    }

    /// The next `n` write transactions commit and then report a failure
    pub fn lose_next_acks(&self, n: u32) {
        self.faults().lost_acks = n;
    }

    /// Settlements that carry a referral credit fail at the cascade step
    pub fn fail_referral_credits(&self, fail: bool) {
        self.faults().failing_referrals = fail;
    }

    /// Number of committed write transactions
    pub fn commit_count(&self) -> u64 {
        self.inner.commits.load(Ordering::SeqCst)
    }

    /// Insert a session row directly, without touching the user's flag
    pub async fn seed_session(&self, session: MiningSession) {
        let mut state = self.inner.state.lock().await;
        state.sessions.insert(session.session_id, session);
    }

    pub async fn user(&self, user_id: &UserId) -> Option<UserBalance> {
        self.inner.state.lock().await.users.get(user_id).cloned()
    }

    pub async fn session(&self, session_id: MiningSessionId) -> Option<MiningSession> {
        self.inner.state.lock().await.sessions.get(&session_id).cloned()
    }

    pub async fn referral_log(&self) -> Vec<ReferralEarning> {
        self.inner.state.lock().await.referral_log.clone()
    }

    pub async fn task_progress(&self, user_id: &UserId, task_id: &str) -> Option<TaskProgress> {
        self.inner
            .state
            .lock()
            .await
            .task_progress
            .get(&(user_id.clone(), task_id.to_string()))
            .cloned()
    }

    fn check_available(&self) -> MiningResult<()> {
        if self.faults().unavailable {
            return Err(unavailable("store unavailable"));
        }
        Ok(())
    }

    async fn read<T, F>(&self, f: F) -> MiningResult<T>
    where
        F: FnOnce(&StoreState) -> MiningResult<T> + Send,
    {
        self.check_available()?;
        let state = self.inner.state.lock().await;
        f(&state)
    }

    /// Run `f` against a copy of the state and keep the copy only on success
    async fn transact<T, F>(&self, f: F) -> MiningResult<T>
    where
        F: FnOnce(&mut StoreState, bool) -> MiningResult<T> + Send,
    {
        self.check_available()?;
        let mut state = self.inner.state.lock().await;

        let failing_referrals = {
            let mut faults = self.faults();
            if faults.failing_writes > 0 {
                faults.failing_writes -= 1;
                return Err(unavailable("write failed"));
            }
            faults.failing_referrals
        };

        let mut work = state.clone();
        let value = f(&mut work, failing_referrals)?;
        *state = work;
        self.inner.commits.fetch_add(1, Ordering::SeqCst);

        let mut faults = self.faults();
        if faults.lost_acks > 0 {
            faults.lost_acks -= 1;
            return Err(unavailable("connection lost after commit"));
        }
        Ok(value)
    }
}

fn apply_plan(
    state: &mut StoreState,
    plan: &SettlementPlan,
    failing_referrals: bool,
) -> MiningResult<()> {
    let earner = state
        .users
        .get_mut(&plan.earner_id)
        .ok_or(MiningError::UserNotFound)?;
    plan.earner_credit.apply_to(earner, plan.settled_at);

    let Some(referral) = &plan.referral else {
        return Ok(());
    };
    if failing_referrals {
        return Err(unavailable("referral credit failed"));
    }
    match state.users.get_mut(&referral.referrer_id) {
        Some(referrer) => {
            referral.credit.apply_to(referrer, plan.settled_at);
            state.referral_log.push(referral.log_entry.clone());
        }
        None => {
            tracing::warn!(
                user_id = %plan.earner_id,
                referrer_id = %referral.referrer_id,
                "Referrer has no balance record, skipping referral cascade"
            );
        }
    }
    Ok(())
}

impl UserBalanceRepository for InMemoryMiningStore {
    async fn find_by_id(&self, user_id: &UserId) -> MiningResult<Option<UserBalance>> {
        self.read(|s| Ok(s.users.get(user_id).cloned())).await
    }

    async fn create(&self, user: &UserBalance) -> MiningResult<()> {
        self.transact(|s, _| {
            if s.users.contains_key(&user.user_id) {
                return Err(MiningError::UserAlreadyExists);
            }
            s.users.insert(user.user_id.clone(), user.clone());
            Ok(())
        })
        .await
    }

    async fn find_node_active_user_ids(&self) -> MiningResult<Vec<UserId>> {
        self.read(|s| {
            let mut ids: Vec<UserId> = s
                .users
                .values()
                .filter(|u| u.is_node_active)
                .map(|u| u.user_id.clone())
                .collect();
            ids.sort();
            Ok(ids)
        })
        .await
    }

    async fn clear_node_flag(&self, user_id: &UserId) -> MiningResult<bool> {
        self.transact(|s, _| {
            let user = s.users.get_mut(user_id).ok_or(MiningError::UserNotFound)?;
            let was_active = user.is_node_active;
            user.is_node_active = false;
            user.node_start_time = None;
            user.updated_at = Utc::now();
            Ok(was_active)
        })
        .await
    }
}

impl MiningSessionRepository for InMemoryMiningStore {
    async fn find_open(&self, user_id: &UserId) -> MiningResult<Option<MiningSession>> {
        self.read(|s| Ok(s.open_session(user_id).cloned())).await
    }

    async fn open(&self, session: &MiningSession) -> MiningResult<()> {
        self.transact(|s, _| {
            if s.open_session(&session.user_id).is_some() {
                return Err(MiningError::SessionAlreadyActive);
            }
            let user = s
                .users
                .get_mut(&session.user_id)
                .ok_or(MiningError::UserNotFound)?;
            user.is_node_active = true;
            user.node_start_time = Some(session.started_at);
            user.updated_at = session.started_at;
            s.sessions.insert(session.session_id, session.clone());
            Ok(())
        })
        .await
    }

    async fn close(
        &self,
        user_id: &UserId,
        session_id: MiningSessionId,
        ended_at: DateTime<Utc>,
    ) -> MiningResult<MiningSession> {
        self.transact(|s, _| {
            let session = s
                .sessions
                .get_mut(&session_id)
                .filter(|session| &session.user_id == user_id && session.is_open())
                .ok_or(MiningError::SessionNotFound)?;
            session.ended_at = Some(ended_at.max(session.started_at));
            let closed = session.clone();

            if let Some(user) = s.users.get_mut(user_id) {
                user.is_node_active = false;
                user.node_start_time = None;
                user.updated_at = ended_at;
            }
            Ok(closed)
        })
        .await
    }
}

impl SettlementRepository for InMemoryMiningStore {
    async fn apply_checkpoint(
        &self,
        checkpoint: &AccrualCheckpoint,
        plan: &SettlementPlan,
    ) -> MiningResult<CheckpointReceipt> {
        self.transact(|s, failing_referrals| {
            let session = s
                .sessions
                .get(&checkpoint.session_id)
                .filter(|session| session.user_id == checkpoint.user_id && session.is_open())
                .ok_or(MiningError::SessionNotFound)?;
            if checkpoint.sequence <= session.last_checkpoint_seq {
                return Ok(CheckpointReceipt::AlreadyApplied {
                    session_earnings: session.earnings,
                });
            }

            apply_plan(s, plan, failing_referrals)?;

            let session = s
                .sessions
                .get_mut(&checkpoint.session_id)
                .ok_or(MiningError::SessionNotFound)?;
            session.earnings += checkpoint.amount;
            session.last_checkpoint_seq = checkpoint.sequence;
            Ok(CheckpointReceipt::Applied {
                session_earnings: session.earnings,
            })
        })
        .await
    }

    async fn apply_task_completion(
        &self,
        completion: &TaskCompletion,
        plan: &SettlementPlan,
    ) -> MiningResult<()> {
        self.transact(|s, failing_referrals| {
            if !s.users.contains_key(&completion.user_id) {
                return Err(MiningError::UserNotFound);
            }

            let key = (completion.user_id.clone(), completion.task_id.clone());
            if s.task_progress.get(&key).is_some_and(|p| p.completed) {
                return Err(MiningError::TaskAlreadyCompleted(completion.task_id.clone()));
            }
            s.task_progress.insert(
                key,
                TaskProgress {
                    user_id: completion.user_id.clone(),
                    task_id: completion.task_id.clone(),
                    progress: completion.max_progress,
                    completed: true,
                    completed_at: Some(completion.completed_at),
                },
            );

            apply_plan(s, plan, failing_referrals)?;

            if completion.daily_check_in
                && let Some(user) = s.users.get_mut(&completion.user_id)
            {
                user.daily_check_in_claimed = true;
                user.last_login_time = Some(completion.completed_at);
            }
            Ok(())
        })
        .await
    }
}

/// Fixed task list served from memory
#[derive(Debug, Clone)]
pub struct StaticTaskCatalog {
    tasks: Arc<Vec<Task>>,
}

impl StaticTaskCatalog {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self {
            tasks: Arc::new(tasks),
        }
    }
}

impl Default for StaticTaskCatalog {
    fn default() -> Self {
        let task = |task_id: &str, title: &str, base_reward: Decimal, task_type| Task {
            task_id: task_id.to_string(),
            title: title.to_string(),
            base_reward,
            max_progress: 1,
            task_type,
        };
        Self::new(vec![
            task("daily-checkin", "Daily check-in", dec!(10), TaskType::Daily),
            task("join-discord", "Join the Discord server", dec!(25), TaskType::Social),
            task("first-hour", "Mine for one hour", dec!(50), TaskType::Mining),
            task("invite-friend", "Invite a friend", dec!(100), TaskType::Referral),
        ])
    }
}

impl TaskCatalog for StaticTaskCatalog {
    async fn find(&self, task_id: &str) -> MiningResult<Option<Task>> {
        Ok(self.tasks.iter().find(|t| t.task_id == task_id).cloned())
    }

    async fn list(&self) -> MiningResult<Vec<Task>> {
        Ok(self.tasks.as_ref().clone())
    }
}

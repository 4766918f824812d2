//! Repository Traits
//!
//! Interfaces for the durable store and the external collaborators.
//! Implementations are in the infrastructure layer.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use kernel::id::MiningSessionId;
use rust_decimal::Decimal;

use crate::domain::entities::{MiningSession, Task, UserBalance};
use crate::domain::ledger::{AccrualCheckpoint, CheckpointReceipt, SettlementPlan, TaskCompletion};
use crate::domain::value_objects::{Efficiency, UserId};
use crate::error::MiningResult;

/// User balance repository trait
#[trait_variant::make(UserBalanceRepository: Send)]
pub trait LocalUserBalanceRepository {
    async fn find_by_id(&self, user_id: &UserId) -> MiningResult<Option<UserBalance>>;

    /// Insert a new record; `Conflict` if the user already exists
    async fn create(&self, user: &UserBalance) -> MiningResult<()>;

    /// Users whose `is_node_active` flag is set
    async fn find_node_active_user_ids(&self) -> MiningResult<Vec<UserId>>;

    /// Clear `is_node_active` / `node_start_time`.
    /// Returns false if the flag was already clear.
    async fn clear_node_flag(&self, user_id: &UserId) -> MiningResult<bool>;
}

/// Mining session repository trait
#[trait_variant::make(MiningSessionRepository: Send)]
pub trait LocalMiningSessionRepository {
    /// The user's session with no `ended_at`, if any
    async fn find_open(&self, user_id: &UserId) -> MiningResult<Option<MiningSession>>;

    /// Insert `session` and set the user's node flag in one transaction.
    ///
    /// `SessionAlreadyActive` if the user already has an open session,
    /// `UserNotFound` if the user has no balance record.
    async fn open(&self, session: &MiningSession) -> MiningResult<()>;

    /// Close the session and clear the user's node flag in one transaction.
    ///
    /// Returns the closed session. `SessionNotFound` if it is not open.
    async fn close(
        &self,
        user_id: &UserId,
        session_id: MiningSessionId,
        ended_at: DateTime<Utc>,
    ) -> MiningResult<MiningSession>;
}

/// Settlement repository trait
///
/// Each method applies everything it is given in one transaction or nothing.
#[trait_variant::make(SettlementRepository: Send)]
pub trait LocalSettlementRepository {
    /// Apply an accrual checkpoint: the plan's credits plus the session's
    /// `earnings` and `last_checkpoint_seq`.
    ///
    /// A sequence at or below `last_checkpoint_seq` is reported as
    /// `AlreadyApplied` and writes nothing. `SessionNotFound` if the session
    /// is closed or belongs to another user.
    async fn apply_checkpoint(
        &self,
        checkpoint: &AccrualCheckpoint,
        plan: &SettlementPlan,
    ) -> MiningResult<CheckpointReceipt>;

    /// Mark the task completed and apply the plan.
    /// `TaskAlreadyCompleted` if the progress row is already completed.
    async fn apply_task_completion(
        &self,
        completion: &TaskCompletion,
        plan: &SettlementPlan,
    ) -> MiningResult<()>;
}

/// Classifier output for one user and address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AntiCheatVerdict {
    pub efficiency: Efficiency,
    pub penalty_level: u8,
}

impl AntiCheatVerdict {
    pub const CLEAN: AntiCheatVerdict = AntiCheatVerdict {
        efficiency: Efficiency::FULL,
        penalty_level: 0,
    };

    pub fn new(efficiency: Decimal, penalty_level: u8) -> Self {
        Self {
            efficiency: Efficiency::clamped(efficiency),
            penalty_level,
        }
    }
}

/// Anti-cheat classifier trait
#[trait_variant::make(AntiCheatClassifier: Send)]
pub trait LocalAntiCheatClassifier {
    async fn classify(&self, user_id: &UserId, ip: Option<IpAddr>) -> MiningResult<AntiCheatVerdict>;
}

/// Task catalog trait
#[trait_variant::make(TaskCatalog: Send)]
pub trait LocalTaskCatalog {
    async fn find(&self, task_id: &str) -> MiningResult<Option<Task>>;

    async fn list(&self) -> MiningResult<Vec<Task>>;
}

/// Everything the engine needs from the durable store
pub trait MiningStore:
    UserBalanceRepository
    + MiningSessionRepository
    + SettlementRepository
    + Sync
    + 'static
{
}

impl<T> MiningStore for T where
    T: UserBalanceRepository + MiningSessionRepository + SettlementRepository + Sync + 'static
{
}

//! Domain Entities
//!
//! Durable records of the mining economy. The store is the single source of
//! truth for all of them; in-memory copies are snapshots.

use chrono::{DateTime, Utc};
use kernel::id::{MiningSessionId, ReferralEarningId};
use rust_decimal::Decimal;

use crate::domain::services;
use crate::domain::value_objects::{AccountMultiplier, EarningType, TaskType, UserId};

/// Balance and activity state of one user
#[derive(Debug, Clone, PartialEq)]
pub struct UserBalance {
    pub user_id: UserId,
    pub current_balance: Decimal,
    pub total_earned: Decimal,
    pub weekly_earnings: Decimal,
    pub monthly_earnings: Decimal,
    pub referral_earnings: Decimal,
    pub total_referrals: i32,
    /// Back-reference only; the referrer record is owned elsewhere
    pub referred_by: Option<UserId>,
    /// Fixed at account creation
    pub multiplier: AccountMultiplier,
    pub is_node_active: bool,
    /// Present iff `is_node_active`
    pub node_start_time: Option<DateTime<Utc>>,
    pub tasks_completed: i32,
    pub daily_check_in_claimed: bool,
    pub last_login_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserBalance {
    /// Fresh record for a first login.
    ///
    /// `account_created_at` is the age of the upstream (Discord) account and
    /// only feeds the multiplier tier.
    pub fn new(
        user_id: UserId,
        account_created_at: DateTime<Utc>,
        referred_by: Option<UserId>,
    ) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            current_balance: Decimal::ZERO,
            total_earned: Decimal::ZERO,
            weekly_earnings: Decimal::ZERO,
            monthly_earnings: Decimal::ZERO,
            referral_earnings: Decimal::ZERO,
            total_referrals: 0,
            referred_by,
            multiplier: services::multiplier_for_account(account_created_at, now),
            is_node_active: false,
            node_start_time: None,
            tasks_completed: 0,
            daily_check_in_claimed: false,
            last_login_time: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// `total_earned >= current_balance` and the node flag/timestamp agree
    pub fn is_consistent(&self) -> bool {
        self.total_earned >= self.current_balance
            && self.current_balance >= Decimal::ZERO
            && self.is_node_active == self.node_start_time.is_some()
    }
}

/// One continuous interval of accrual
#[derive(Debug, Clone, PartialEq)]
pub struct MiningSession {
    pub session_id: MiningSessionId,
    pub user_id: UserId,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Cumulative checkpointed accrual
    pub earnings: Decimal,
    pub hash_rate: Decimal,
    pub efficiency: Decimal,
    /// Highest checkpoint sequence applied; 0 before the first checkpoint
    pub last_checkpoint_seq: i64,
}

impl MiningSession {
    pub fn open(
        user_id: UserId,
        started_at: DateTime<Utc>,
        hash_rate: Decimal,
        efficiency: Decimal,
    ) -> Self {
        Self {
            session_id: MiningSessionId::new(),
            user_id,
            started_at,
            ended_at: None,
            earnings: Decimal::ZERO,
            hash_rate,
            efficiency,
            last_checkpoint_seq: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// Append-only audit entry for a referral credit
#[derive(Debug, Clone, PartialEq)]
pub struct ReferralEarning {
    pub id: ReferralEarningId,
    pub referrer_id: UserId,
    pub referred_id: UserId,
    pub earning_type: EarningType,
    pub base_amount: Decimal,
    pub referral_amount: Decimal,
    pub created_at: DateTime<Utc>,
}

/// Catalog entry
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub task_id: String,
    pub title: String,
    pub base_reward: Decimal,
    pub max_progress: i32,
    pub task_type: TaskType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskProgress {
    pub user_id: UserId,
    pub task_id: String,
    pub progress: i32,
    pub completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
}

//! Settlement plans
//!
//! A settlement is computed up front as a [`SettlementPlan`] and handed to
//! the store, which applies every part of it in one transaction or none of
//! it. [`BalanceCredit`] names every balance column a settlement may touch;
//! there is no free-form update path.

use chrono::{DateTime, Utc};
use kernel::id::{MiningSessionId, ReferralEarningId};
use rust_decimal::Decimal;

use crate::domain::entities::{ReferralEarning, UserBalance};
use crate::domain::services::referral_bonus;
use crate::domain::value_objects::{EarningType, RewardAmount, UserId};

/// Additive deltas applied to one user balance row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BalanceCredit {
    pub current_balance: Decimal,
    pub total_earned: Decimal,
    pub weekly_earnings: Decimal,
    pub monthly_earnings: Decimal,
    pub referral_earnings: Decimal,
    pub tasks_completed: i32,
}

impl BalanceCredit {
    /// Credit for the user who earned `amount`
    pub fn earned(amount: Decimal) -> Self {
        Self {
            current_balance: amount,
            total_earned: amount,
            weekly_earnings: amount,
            monthly_earnings: amount,
            ..Self::default()
        }
    }

    /// Credit for a referrer receiving `bonus`
    pub fn referral(bonus: Decimal) -> Self {
        Self {
            current_balance: bonus,
            total_earned: bonus,
            referral_earnings: bonus,
            ..Self::default()
        }
    }

    pub fn with_completed_task(mut self) -> Self {
        self.tasks_completed += 1;
        self
    }

    /// Applying this credit keeps `total_earned >= current_balance`
    pub fn preserves_balance_invariant(&self) -> bool {
        self.total_earned >= self.current_balance && self.current_balance >= Decimal::ZERO
    }

    /// In-memory application, used by the in-memory store
    pub fn apply_to(&self, user: &mut UserBalance, at: DateTime<Utc>) {
        user.current_balance += self.current_balance;
        user.total_earned += self.total_earned;
        user.weekly_earnings += self.weekly_earnings;
        user.monthly_earnings += self.monthly_earnings;
        user.referral_earnings += self.referral_earnings;
        user.tasks_completed += self.tasks_completed;
        user.updated_at = at;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReferralCredit {
    pub referrer_id: UserId,
    pub credit: BalanceCredit,
    pub log_entry: ReferralEarning,
}

/// Everything one settlement writes
#[derive(Debug, Clone, PartialEq)]
pub struct SettlementPlan {
    pub earner_id: UserId,
    pub earning_type: EarningType,
    pub amount: Decimal,
    pub earner_credit: BalanceCredit,
    pub referral: Option<ReferralCredit>,
    pub settled_at: DateTime<Utc>,
}

impl SettlementPlan {
    /// Plan crediting `amount` to `earner` and cascading to its referrer.
    ///
    /// A bonus that truncates to zero at ledger precision produces no
    /// referral credit and no log entry.
    pub fn for_reward(
        earner: &UserBalance,
        earning_type: EarningType,
        amount: RewardAmount,
        referral_rate: Decimal,
    ) -> Self {
        let amount = amount.value();
        let settled_at = Utc::now();

        let referral = earner
            .referred_by
            .as_ref()
            .filter(|referrer| **referrer != earner.user_id)
            .and_then(|referrer| {
                let bonus = referral_bonus(amount, referral_rate);
                (bonus > Decimal::ZERO).then(|| ReferralCredit {
                    referrer_id: referrer.clone(),
                    credit: BalanceCredit::referral(bonus),
                    log_entry: ReferralEarning {
                        id: ReferralEarningId::new(),
                        referrer_id: referrer.clone(),
                        referred_id: earner.user_id.clone(),
                        earning_type: earning_type.clone(),
                        base_amount: amount,
                        referral_amount: bonus,
                        created_at: settled_at,
                    },
                })
            });

        Self {
            earner_id: earner.user_id.clone(),
            earning_type,
            amount,
            earner_credit: BalanceCredit::earned(amount),
            referral,
            settled_at,
        }
    }

    pub fn with_completed_task(mut self) -> Self {
        self.earner_credit = self.earner_credit.with_completed_task();
        self
    }

    pub fn referral_bonus(&self) -> Decimal {
        self.referral
            .as_ref()
            .map(|r| r.credit.current_balance)
            .unwrap_or(Decimal::ZERO)
    }

    /// Users whose rows this plan locks, in lock order
    pub fn locked_users(&self) -> Vec<UserId> {
        let mut ids = vec![self.earner_id.clone()];
        if let Some(r) = &self.referral {
            ids.push(r.referrer_id.clone());
        }
        ids.sort();
        ids.dedup();
        ids
    }
}

/// Idempotency key and amount of one accrual checkpoint
#[derive(Debug, Clone, PartialEq)]
pub struct AccrualCheckpoint {
    pub user_id: UserId,
    pub session_id: MiningSessionId,
    /// Strictly increasing per session, starting at 1
    pub sequence: i64,
    pub amount: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointReceipt {
    /// Written now; carries the session's new cumulative earnings
    Applied { session_earnings: Decimal },
    /// Sequence was already written by an earlier attempt
    AlreadyApplied { session_earnings: Decimal },
}

impl CheckpointReceipt {
    pub fn session_earnings(&self) -> Decimal {
        match self {
            CheckpointReceipt::Applied { session_earnings }
            | CheckpointReceipt::AlreadyApplied { session_earnings } => *session_earnings,
        }
    }
}

/// Task progress transition written alongside a task settlement
#[derive(Debug, Clone, PartialEq)]
pub struct TaskCompletion {
    pub user_id: UserId,
    pub task_id: String,
    /// Written as the final `progress` of the task row
    pub max_progress: i32,
    pub completed_at: DateTime<Utc>,
    /// Also flips `daily_check_in_claimed` and refreshes `last_login_time`
    pub daily_check_in: bool,
}

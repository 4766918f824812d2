//! Settlement Service
//!
//! The only writer of balances. Every credit goes through a
//! [`SettlementPlan`] applied by the store in a single transaction, so a
//! failed referral cascade also rolls back the earner's credit.

use std::sync::Arc;

use kernel::id::MiningSessionId;
use rust_decimal::Decimal;

use crate::application::config::MiningConfig;
use crate::domain::entities::Task;
use crate::domain::ledger::{AccrualCheckpoint, CheckpointReceipt, SettlementPlan, TaskCompletion};
use crate::domain::repository::{SettlementRepository, UserBalanceRepository};
use crate::domain::services::to_ledger_scale;
use crate::domain::value_objects::{EarningType, RewardAmount, UserId};
use crate::error::{MiningError, MiningResult};

/// Task whose completion also claims the daily check-in
pub const DAILY_CHECKIN_TASK_ID: &str = "daily-checkin";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccrualReceipt {
    pub amount: Decimal,
    pub referral_bonus: Decimal,
    /// Session `earnings` after this checkpoint
    pub session_earnings: Decimal,
    /// The sequence had been applied by an earlier attempt
    pub replayed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRewardReceipt {
    pub task_id: String,
    /// `base_reward * multiplier`
    pub total_reward: Decimal,
    pub referral_bonus: Decimal,
}

pub struct SettlementService<S>
where
    S: UserBalanceRepository + SettlementRepository,
{
    store: Arc<S>,
    config: Arc<MiningConfig>,
}

impl<S> SettlementService<S>
where
    S: UserBalanceRepository + SettlementRepository,
{
    pub fn new(store: Arc<S>, config: Arc<MiningConfig>) -> Self {
        Self { store, config }
    }

    /// Credit `delta` accrued in `session_id` as checkpoint `sequence`.
    ///
    /// Repeating a call with a sequence the store already applied is a
    /// no-op that reports the session's current earnings.
    pub async fn settle_accrual(
        &self,
        user_id: &UserId,
        session_id: MiningSessionId,
        sequence: i64,
        delta: Decimal,
    ) -> MiningResult<AccrualReceipt> {
        let amount = RewardAmount::new(delta)?;
        if sequence < 1 {
            return Err(MiningError::Validation(format!(
                "checkpoint sequence must be >= 1 (got {sequence})"
            )));
        }

        let user = self
            .store
            .find_by_id(user_id)
            .await?
            .ok_or(MiningError::UserNotFound)?;

        let plan = SettlementPlan::for_reward(
            &user,
            EarningType::Mining,
            amount,
            self.config.referral_rate,
        );
        let checkpoint = AccrualCheckpoint {
            user_id: user_id.clone(),
            session_id,
            sequence,
            amount: amount.value(),
        };

        let receipt = self.store.apply_checkpoint(&checkpoint, &plan).await?;
        let replayed = matches!(receipt, CheckpointReceipt::AlreadyApplied { .. });

        if replayed {
            tracing::info!(
                user_id = %user_id,
                session_id = %session_id,
                sequence,
                "Checkpoint already applied"
            );
        } else {
            tracing::debug!(
                user_id = %user_id,
                session_id = %session_id,
                sequence,
                amount = %amount.value(),
                referral_bonus = %plan.referral_bonus(),
                "Accrual settled"
            );
        }

        Ok(AccrualReceipt {
            amount: amount.value(),
            referral_bonus: if replayed { Decimal::ZERO } else { plan.referral_bonus() },
            session_earnings: receipt.session_earnings(),
            replayed,
        })
    }

    /// Pay `base_reward` scaled by the user's multiplier and mark the task
    /// completed. A task can be paid once per user.
    /// Reward for a task with a single step
    pub async fn settle_task_reward(
        &self,
        user_id: &UserId,
        task_id: &str,
        base_reward: Decimal,
    ) -> MiningResult<TaskRewardReceipt> {
        self.settle_completion(user_id, task_id, base_reward, 1).await
    }

    /// Reward for a catalog task; its progress is recorded as `max_progress`
    pub async fn settle_task(&self, user_id: &UserId, task: &Task) -> MiningResult<TaskRewardReceipt> {
        self.settle_completion(user_id, &task.task_id, task.base_reward, task.max_progress)
            .await
    }

    async fn settle_completion(
        &self,
        user_id: &UserId,
        task_id: &str,
        base_reward: Decimal,
        max_progress: i32,
    ) -> MiningResult<TaskRewardReceipt> {
        RewardAmount::new(base_reward)?;
        if max_progress < 1 {
            return Err(MiningError::Validation(format!(
                "task max_progress must be >= 1 (got {max_progress})"
            )));
        }

        let user = self
            .store
            .find_by_id(user_id)
            .await?
            .ok_or(MiningError::UserNotFound)?;

        let total_reward = RewardAmount::new(to_ledger_scale(base_reward * user.multiplier.value()))?;
        let plan = SettlementPlan::for_reward(
            &user,
            EarningType::TaskCompletion,
            total_reward,
            self.config.referral_rate,
        )
        .with_completed_task();

        let completion = TaskCompletion {
            user_id: user_id.clone(),
            task_id: task_id.to_string(),
            max_progress,
            completed_at: plan.settled_at,
            daily_check_in: task_id == DAILY_CHECKIN_TASK_ID,
        };

        self.store.apply_task_completion(&completion, &plan).await?;

        tracing::info!(
            user_id = %user_id,
            task_id = %task_id,
            total_reward = %total_reward.value(),
            referral_bonus = %plan.referral_bonus(),
            "Task reward settled"
        );

        Ok(TaskRewardReceipt {
            task_id: task_id.to_string(),
            total_reward: total_reward.value(),
            referral_bonus: plan.referral_bonus(),
        })
    }
}

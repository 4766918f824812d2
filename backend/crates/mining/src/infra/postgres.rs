//! PostgreSQL Repository Implementations
//!
//! Every balance mutation is a delta (`col = col + $n`) inside one
//! transaction. User rows are locked first, in user-id order, then the
//! session row, so concurrent settlements for the same pair of users cannot
//! deadlock.

use chrono::{DateTime, Utc};
use kernel::id::MiningSessionId;
use rust_decimal::Decimal;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::domain::entities::{MiningSession, Task, UserBalance};
use crate::domain::ledger::{
    AccrualCheckpoint, BalanceCredit, CheckpointReceipt, ReferralCredit, SettlementPlan,
    TaskCompletion,
};
use crate::domain::repository::{
    MiningSessionRepository, SettlementRepository, TaskCatalog, UserBalanceRepository,
};
use crate::domain::value_objects::{AccountMultiplier, UserId};
use crate::error::{MiningError, MiningResult};

const UNIQUE_VIOLATION: &str = "23505";
const FOREIGN_KEY_VIOLATION: &str = "23503";

/// PostgreSQL-backed repository
#[derive(Clone)]
pub struct PgMiningRepository {
    pool: PgPool,
}

impl PgMiningRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn sqlstate(err: &sqlx::Error) -> Option<String> {
    err.as_database_error()
        .and_then(|db_err| db_err.code())
        .map(|code| code.into_owned())
}

/// Lock the given user rows in id order. Returns the ids that exist.
async fn lock_users(conn: &mut PgConnection, user_ids: &[UserId]) -> MiningResult<Vec<UserId>> {
    let ids: Vec<String> = user_ids.iter().map(|id| id.as_str().to_string()).collect();
    let locked = sqlx::query_scalar::<_, String>(
        r#"
        SELECT user_id
        FROM user_balances
        WHERE user_id = ANY($1)
        ORDER BY user_id
        FOR UPDATE
        "#,
    )
    .bind(ids)
    .fetch_all(&mut *conn)
    .await?;

    locked.into_iter().map(UserId::new).collect()
}

async fn apply_credit(
    conn: &mut PgConnection,
    user_id: &UserId,
    credit: &BalanceCredit,
    at: DateTime<Utc>,
) -> MiningResult<()> {
    if !credit.preserves_balance_invariant() {
        return Err(MiningError::Internal(format!(
            "credit for {user_id} would break total_earned >= current_balance"
        )));
    }

    let updated = sqlx::query(
        r#"
        UPDATE user_balances SET
            current_balance   = current_balance + $2,
            total_earned      = total_earned + $3,
            weekly_earnings   = weekly_earnings + $4,
            monthly_earnings  = monthly_earnings + $5,
            referral_earnings = referral_earnings + $6,
            tasks_completed   = tasks_completed + $7,
            updated_at        = $8
        WHERE user_id = $1
        "#,
    )
    .bind(user_id.as_str())
    .bind(credit.current_balance)
    .bind(credit.total_earned)
    .bind(credit.weekly_earnings)
    .bind(credit.monthly_earnings)
    .bind(credit.referral_earnings)
    .bind(credit.tasks_completed)
    .bind(at)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if updated == 0 {
        return Err(MiningError::UserNotFound);
    }
    Ok(())
}

async fn apply_referral(conn: &mut PgConnection, referral: &ReferralCredit) -> MiningResult<()> {
    let entry = &referral.log_entry;
    apply_credit(conn, &referral.referrer_id, &referral.credit, entry.created_at).await?;

    sqlx::query(
        r#"
        INSERT INTO referral_earnings (
            referral_earning_id,
            referrer_id,
            referred_id,
            earning_type,
            base_amount,
            referral_amount,
            created_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(entry.id.into_uuid())
    .bind(entry.referrer_id.as_str())
    .bind(entry.referred_id.as_str())
    .bind(entry.earning_type.as_str())
    .bind(entry.base_amount)
    .bind(entry.referral_amount)
    .bind(entry.created_at)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Apply the plan's credits. `locked` are the users already locked by this
/// transaction; a referrer without a balance record gets no cascade and the
/// earner is still credited.
async fn apply_plan(
    conn: &mut PgConnection,
    plan: &SettlementPlan,
    locked: &[UserId],
) -> MiningResult<()> {
    apply_credit(conn, &plan.earner_id, &plan.earner_credit, plan.settled_at).await?;

    if let Some(referral) = &plan.referral {
        if locked.contains(&referral.referrer_id) {
            apply_referral(conn, referral).await?;
        } else {
            tracing::warn!(
                user_id = %plan.earner_id,
                referrer_id = %referral.referrer_id,
                "Referrer has no balance record, skipping referral cascade"
            );
        }
    }
    Ok(())
}

impl UserBalanceRepository for PgMiningRepository {
    async fn find_by_id(&self, user_id: &UserId) -> MiningResult<Option<UserBalance>> {
        let row = sqlx::query_as::<_, UserBalanceRow>(
            r#"
            SELECT
                user_id,
                current_balance,
                total_earned,
                weekly_earnings,
                monthly_earnings,
                referral_earnings,
                total_referrals,
                referred_by,
                multiplier,
                is_node_active,
                node_start_time,
                tasks_completed,
                daily_check_in_claimed,
                last_login_time,
                created_at,
                updated_at
            FROM user_balances
            WHERE user_id = $1
            "#,
        )
        .bind(user_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(UserBalanceRow::into_user_balance).transpose()
    }

    async fn create(&self, user: &UserBalance) -> MiningResult<()> {
        sqlx::query(
            r#"
            INSERT INTO user_balances (
                user_id,
                referred_by,
                multiplier,
                created_at,
                updated_at
            ) VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(user.user_id.as_str())
        .bind(user.referred_by.as_ref().map(UserId::as_str))
        .bind(user.multiplier.value())
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match sqlstate(&e).as_deref() {
            Some(UNIQUE_VIOLATION) => MiningError::UserAlreadyExists,
            _ => MiningError::Database(e),
        })?;

        tracing::info!(
            user_id = %user.user_id,
            multiplier = %user.multiplier.value(),
            "User balance created"
        );
        Ok(())
    }

    async fn find_node_active_user_ids(&self) -> MiningResult<Vec<UserId>> {
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT user_id FROM user_balances WHERE is_node_active ORDER BY user_id",
        )
        .fetch_all(&self.pool)
        .await?;

        ids.into_iter().map(UserId::new).collect()
    }

    async fn clear_node_flag(&self, user_id: &UserId) -> MiningResult<bool> {
        let cleared = sqlx::query(
            r#"
            UPDATE user_balances
            SET is_node_active = FALSE, node_start_time = NULL, updated_at = now()
            WHERE user_id = $1 AND is_node_active
            "#,
        )
        .bind(user_id.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(cleared > 0)
    }
}

impl MiningSessionRepository for PgMiningRepository {
    async fn find_open(&self, user_id: &UserId) -> MiningResult<Option<MiningSession>> {
        let row = sqlx::query_as::<_, MiningSessionRow>(
            r#"
            SELECT
                session_id,
                user_id,
                started_at,
                ended_at,
                earnings,
                hash_rate,
                efficiency,
                last_checkpoint_seq
            FROM mining_sessions
            WHERE user_id = $1 AND ended_at IS NULL
            "#,
        )
        .bind(user_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(MiningSessionRow::into_session).transpose()
    }

    async fn open(&self, session: &MiningSession) -> MiningResult<()> {
        let mut tx = self.pool.begin().await?;

        let locked = lock_users(&mut tx, std::slice::from_ref(&session.user_id)).await?;
        if locked.is_empty() {
            return Err(MiningError::UserNotFound);
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO mining_sessions (
                session_id,
                user_id,
                started_at,
                earnings,
                hash_rate,
                efficiency,
                last_checkpoint_seq
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(session.session_id.into_uuid())
        .bind(session.user_id.as_str())
        .bind(session.started_at)
        .bind(session.earnings)
        .bind(session.hash_rate)
        .bind(session.efficiency)
        .bind(session.last_checkpoint_seq)
        .execute(&mut *tx)
        .await;

        if let Err(e) = inserted {
            return Err(match sqlstate(&e).as_deref() {
                Some(UNIQUE_VIOLATION) => MiningError::SessionAlreadyActive,
                Some(FOREIGN_KEY_VIOLATION) => MiningError::UserNotFound,
                _ => MiningError::Database(e),
            });
        }

        sqlx::query(
            r#"
            UPDATE user_balances
            SET is_node_active = TRUE, node_start_time = $2, updated_at = $2
            WHERE user_id = $1
            "#,
        )
        .bind(session.user_id.as_str())
        .bind(session.started_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            user_id = %session.user_id,
            session_id = %session.session_id,
            "Mining session opened"
        );
        Ok(())
    }

    async fn close(
        &self,
        user_id: &UserId,
        session_id: MiningSessionId,
        ended_at: DateTime<Utc>,
    ) -> MiningResult<MiningSession> {
        let mut tx = self.pool.begin().await?;

        lock_users(&mut tx, std::slice::from_ref(user_id)).await?;

        let row = sqlx::query_as::<_, MiningSessionRow>(
            r#"
            UPDATE mining_sessions
            SET ended_at = GREATEST($3, started_at)
            WHERE session_id = $1 AND user_id = $2 AND ended_at IS NULL
            RETURNING
                session_id,
                user_id,
                started_at,
                ended_at,
                earnings,
                hash_rate,
                efficiency,
                last_checkpoint_seq
            "#,
        )
        .bind(session_id.into_uuid())
        .bind(user_id.as_str())
        .bind(ended_at)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(MiningError::SessionNotFound)?;

        sqlx::query(
            r#"
            UPDATE user_balances
            SET is_node_active = FALSE, node_start_time = NULL, updated_at = $2
            WHERE user_id = $1
            "#,
        )
        .bind(user_id.as_str())
        .bind(ended_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            user_id = %user_id,
            session_id = %session_id,
            earnings = %row.earnings,
            "Mining session closed"
        );
        row.into_session()
    }
}

impl SettlementRepository for PgMiningRepository {
    async fn apply_checkpoint(
        &self,
        checkpoint: &AccrualCheckpoint,
        plan: &SettlementPlan,
    ) -> MiningResult<CheckpointReceipt> {
        let mut tx = self.pool.begin().await?;

        let locked = lock_users(&mut tx, &plan.locked_users()).await?;
        if !locked.contains(&checkpoint.user_id) {
            return Err(MiningError::UserNotFound);
        }

        let (earnings, last_seq) = sqlx::query_as::<_, (Decimal, i64)>(
            r#"
            SELECT earnings, last_checkpoint_seq
            FROM mining_sessions
            WHERE session_id = $1 AND user_id = $2 AND ended_at IS NULL
            FOR UPDATE
            "#,
        )
        .bind(checkpoint.session_id.into_uuid())
        .bind(checkpoint.user_id.as_str())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(MiningError::SessionNotFound)?;

        if checkpoint.sequence <= last_seq {
            tx.rollback().await?;
            return Ok(CheckpointReceipt::AlreadyApplied {
                session_earnings: earnings,
            });
        }

        apply_plan(&mut tx, plan, &locked).await?;

        let session_earnings = sqlx::query_scalar::<_, Decimal>(
            r#"
            UPDATE mining_sessions
            SET earnings = earnings + $2, last_checkpoint_seq = $3
            WHERE session_id = $1
            RETURNING earnings
            "#,
        )
        .bind(checkpoint.session_id.into_uuid())
        .bind(checkpoint.amount)
        .bind(checkpoint.sequence)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(CheckpointReceipt::Applied { session_earnings })
    }

    async fn apply_task_completion(
        &self,
        completion: &TaskCompletion,
        plan: &SettlementPlan,
    ) -> MiningResult<()> {
        let mut tx = self.pool.begin().await?;

        let locked = lock_users(&mut tx, &plan.locked_users()).await?;
        if !locked.contains(&completion.user_id) {
            return Err(MiningError::UserNotFound);
        }

        let marked = sqlx::query_scalar::<_, String>(
            r#"
            INSERT INTO task_progress (user_id, task_id, progress, completed, completed_at)
            VALUES ($1, $2, $3, TRUE, $4)
            ON CONFLICT (user_id, task_id) DO UPDATE
            SET progress = EXCLUDED.progress,
                completed = TRUE,
                completed_at = EXCLUDED.completed_at
            WHERE task_progress.completed = FALSE
            RETURNING task_id
            "#,
        )
        .bind(completion.user_id.as_str())
        .bind(&completion.task_id)
        .bind(completion.max_progress)
        .bind(completion.completed_at)
        .fetch_optional(&mut *tx)
        .await;

        match marked {
            Ok(Some(_)) => {}
            Ok(None) => return Err(MiningError::TaskAlreadyCompleted(completion.task_id.clone())),
            Err(e) if sqlstate(&e).as_deref() == Some(FOREIGN_KEY_VIOLATION) => {
                return Err(MiningError::TaskNotFound(completion.task_id.clone()));
            }
            Err(e) => return Err(e.into()),
        }

        apply_plan(&mut tx, plan, &locked).await?;

        if completion.daily_check_in {
            sqlx::query(
                r#"
                UPDATE user_balances
                SET daily_check_in_claimed = TRUE, last_login_time = $2
                WHERE user_id = $1
                "#,
            )
            .bind(completion.user_id.as_str())
            .bind(completion.completed_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

impl TaskCatalog for PgMiningRepository {
    async fn find(&self, task_id: &str) -> MiningResult<Option<Task>> {
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT task_id, title, base_reward, max_progress, task_type
            FROM tasks
            WHERE task_id = $1 AND is_active
            "#,
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TaskRow::into_task).transpose()
    }

    async fn list(&self) -> MiningResult<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT task_id, title, base_reward, max_progress, task_type
            FROM tasks
            WHERE is_active
            ORDER BY task_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TaskRow::into_task).collect()
    }
}

// Internal row types for sqlx mapping
#[derive(sqlx::FromRow)]
struct UserBalanceRow {
    user_id: String,
    current_balance: Decimal,
    total_earned: Decimal,
    weekly_earnings: Decimal,
    monthly_earnings: Decimal,
    referral_earnings: Decimal,
    total_referrals: i32,
    referred_by: Option<String>,
    multiplier: Decimal,
    is_node_active: bool,
    node_start_time: Option<DateTime<Utc>>,
    tasks_completed: i32,
    daily_check_in_claimed: bool,
    last_login_time: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl UserBalanceRow {
    fn into_user_balance(self) -> MiningResult<UserBalance> {
        Ok(UserBalance {
            user_id: UserId::new(self.user_id)?,
            current_balance: self.current_balance,
            total_earned: self.total_earned,
            weekly_earnings: self.weekly_earnings,
            monthly_earnings: self.monthly_earnings,
            referral_earnings: self.referral_earnings,
            total_referrals: self.total_referrals,
            referred_by: self.referred_by.map(UserId::new).transpose()?,
            multiplier: AccountMultiplier::new(self.multiplier)?,
            is_node_active: self.is_node_active,
            node_start_time: self.node_start_time,
            tasks_completed: self.tasks_completed,
            daily_check_in_claimed: self.daily_check_in_claimed,
            last_login_time: self.last_login_time,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct MiningSessionRow {
    session_id: Uuid,
    user_id: String,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    earnings: Decimal,
    hash_rate: Decimal,
    efficiency: Decimal,
    last_checkpoint_seq: i64,
}

impl MiningSessionRow {
    fn into_session(self) -> MiningResult<MiningSession> {
        Ok(MiningSession {
            session_id: MiningSessionId::from(self.session_id),
            user_id: UserId::new(self.user_id)?,
            started_at: self.started_at,
            ended_at: self.ended_at,
            earnings: self.earnings,
            hash_rate: self.hash_rate,
            efficiency: self.efficiency,
            last_checkpoint_seq: self.last_checkpoint_seq,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    task_id: String,
    title: String,
    base_reward: Decimal,
    max_progress: i32,
    task_type: String,
}

impl TaskRow {
    fn into_task(self) -> MiningResult<Task> {
        Ok(Task {
            task_type: self.task_type.parse()?,
            task_id: self.task_id,
            title: self.title,
            base_reward: self.base_reward,
            max_progress: self.max_progress,
        })
    }
}

//! Checkpoint Scheduler
//!
//! Periodically drains a session's accumulator into the store. Each
//! checkpoint carries a per-session sequence number so a write that committed
//! before its error surfaced is not applied twice when resent.

use std::sync::Arc;
use std::time::Duration;

use kernel::id::MiningSessionId;
use rust_decimal::Decimal;
use tokio::sync::{Mutex, watch};
use tokio::time::{Instant, MissedTickBehavior};

use crate::application::config::FlushFailurePolicy;
use crate::application::settlement::SettlementService;
use crate::domain::repository::MiningStore;
use crate::domain::session::SessionAccrual;
use crate::domain::value_objects::UserId;
use crate::error::{ErrorClass, MiningResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing accrued since the last flush; no write
    Skipped,
    Flushed {
        amount: Decimal,
        session_earnings: Decimal,
    },
}

#[derive(Debug, Clone, Copy)]
struct PendingCheckpoint {
    sequence: i64,
    amount: Decimal,
}

#[derive(Debug)]
struct Cursor {
    next_sequence: i64,
    /// Rejected checkpoint awaiting resend (retry policy only)
    pending: Option<PendingCheckpoint>,
}

/// Flushes one session. Concurrent flushes are serialized on the cursor.
pub struct CheckpointFlusher<S>
where
    S: MiningStore,
{
    user_id: UserId,
    session_id: MiningSessionId,
    accrual: Arc<SessionAccrual>,
    settlement: Arc<SettlementService<S>>,
    policy: FlushFailurePolicy,
    cursor: Mutex<Cursor>,
}

impl<S> CheckpointFlusher<S>
where
    S: MiningStore,
{
    /// `last_sequence` is the session's durable `last_checkpoint_seq`
    pub fn new(
        user_id: UserId,
        session_id: MiningSessionId,
        last_sequence: i64,
        accrual: Arc<SessionAccrual>,
        settlement: Arc<SettlementService<S>>,
        policy: FlushFailurePolicy,
    ) -> Self {
        Self {
            user_id,
            session_id,
            accrual,
            settlement,
            policy,
            cursor: Mutex::new(Cursor {
                next_sequence: last_sequence + 1,
                pending: None,
            }),
        }
    }

    pub fn session_id(&self) -> MiningSessionId {
        self.session_id
    }

    /// Resend a pending checkpoint if there is one, then drain and write
    /// whatever accrued since.
    pub async fn flush(&self) -> MiningResult<FlushOutcome> {
        let mut cursor = self.cursor.lock().await;
        let mut outcome = FlushOutcome::Skipped;

        if let Some(pending) = cursor.pending.take() {
            tracing::info!(
                user_id = %self.user_id,
                session_id = %self.session_id,
                sequence = pending.sequence,
                amount = %pending.amount,
                "Resending checkpoint"
            );
            outcome = self.write(&mut cursor, pending).await?;
        }

        let amount = self.accrual.drain();
        if amount <= Decimal::ZERO {
            return Ok(outcome);
        }

        let checkpoint = PendingCheckpoint {
            sequence: cursor.next_sequence,
            amount,
        };
        match self.write(&mut cursor, checkpoint).await? {
            FlushOutcome::Flushed {
                amount,
                session_earnings,
            } => Ok(FlushOutcome::Flushed {
                amount: amount + outcome_amount(outcome),
                session_earnings,
            }),
            FlushOutcome::Skipped => Ok(outcome),
        }
    }

    async fn write(
        &self,
        cursor: &mut Cursor,
        checkpoint: PendingCheckpoint,
    ) -> MiningResult<FlushOutcome> {
        let result = self
            .settlement
            .settle_accrual(
                &self.user_id,
                self.session_id,
                checkpoint.sequence,
                checkpoint.amount,
            )
            .await;

        match result {
            Ok(receipt) => {
                self.accrual.confirm(checkpoint.amount, receipt.session_earnings);
                cursor.next_sequence = checkpoint.sequence + 1;
                Ok(FlushOutcome::Flushed {
                    amount: checkpoint.amount,
                    session_earnings: receipt.session_earnings,
                })
            }
            Err(e) if e.is_retryable() && self.policy == FlushFailurePolicy::Retry => {
                tracing::warn!(
                    user_id = %self.user_id,
                    session_id = %self.session_id,
                    sequence = checkpoint.sequence,
                    amount = %checkpoint.amount,
                    error = %e,
                    "Checkpoint failed, will resend"
                );
                cursor.pending = Some(checkpoint);
                Err(e)
            }
            Err(e) => {
                tracing::error!(
                    user_id = %self.user_id,
                    session_id = %self.session_id,
                    sequence = checkpoint.sequence,
                    amount = %checkpoint.amount,
                    policy = self.policy.as_str(),
                    error = %e,
                    "Checkpoint failed, accrued amount dropped"
                );
                self.accrual.abandon(checkpoint.amount);
                // the write may have committed; never reuse its sequence
                cursor.next_sequence = checkpoint.sequence + 1;
                Err(e)
            }
        }
    }
}

fn outcome_amount(outcome: FlushOutcome) -> Decimal {
    match outcome {
        FlushOutcome::Skipped => Decimal::ZERO,
        FlushOutcome::Flushed { amount, .. } => amount,
    }
}

/// Checkpoint timer for one session.
///
/// Runs until `stop` changes or its sender is dropped. A stop signal that
/// arrives mid-flush takes effect after that flush completes. Also stops once
/// the store reports the session gone, since no later checkpoint can land.
pub async fn run_checkpoint_timer<S>(
    flusher: Arc<CheckpointFlusher<S>>,
    period: Duration,
    mut stop: watch::Receiver<bool>,
) where
    S: MiningStore,
{
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => match flusher.flush().await {
                Err(e) if e.class() == ErrorClass::NotFound => {
                    tracing::warn!(
                        session_id = %flusher.session_id(),
                        error = %e,
                        "Session no longer open in store, stopping checkpoints"
                    );
                    break;
                }
                // other failures are logged and handled inside the flusher
                _ => {}
            },
            _ = stop.changed() => break,
        }
    }

    tracing::debug!(session_id = %flusher.session_id(), "Checkpoint timer stopped");
}

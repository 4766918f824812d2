//! Reconciliation Loader
//!
//! Re-derives in-memory sessions from the store after a restart or when a
//! client resumes. The store is authoritative: nothing is credited here, and
//! a second open session is never created.

use std::net::IpAddr;
use std::sync::Arc;

use kernel::id::MiningSessionId;
use rust_decimal::Decimal;

use crate::application::session_manager::{MiningSessionManager, StartedSession};
use crate::domain::repository::{AntiCheatClassifier, MiningStore};
use crate::domain::session::SessionPhase;
use crate::domain::value_objects::UserId;
use crate::error::{MiningError, MiningResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// No flag, no open session
    Idle,
    /// Already live in this process; nothing touched
    AlreadyActive,
    Resumed(StartedSession),
    /// Flag set without an open session; flag cleared, nothing credited
    OrphanFlagCleared { warning: String },
    /// Open session without the flag; closed at its checkpointed earnings
    OrphanSessionClosed {
        session_id: MiningSessionId,
        earnings: Decimal,
        warning: String,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub resumed: usize,
    pub orphans_cleared: usize,
    pub already_active: usize,
    pub failed: usize,
}

pub struct ReconciliationLoader<S, A>
where
    S: MiningStore,
    A: AntiCheatClassifier + Sync + 'static,
{
    store: Arc<S>,
    manager: Arc<MiningSessionManager<S, A>>,
}

impl<S, A> ReconciliationLoader<S, A>
where
    S: MiningStore,
    A: AntiCheatClassifier + Sync + 'static,
{
    pub fn new(store: Arc<S>, manager: Arc<MiningSessionManager<S, A>>) -> Self {
        Self { store, manager }
    }

    pub async fn reconcile(
        &self,
        user_id: &UserId,
        ip: Option<IpAddr>,
    ) -> MiningResult<ReconcileOutcome> {
        if self.manager.phase(user_id) != SessionPhase::Idle {
            return Ok(ReconcileOutcome::AlreadyActive);
        }

        let user = self
            .store
            .find_by_id(user_id)
            .await?
            .ok_or(MiningError::UserNotFound)?;
        let open = self.store.find_open(user_id).await?;

        match (user.is_node_active, open) {
            (true, Some(session)) => match self.manager.resume(&user, &session, ip).await {
                Ok(started) => Ok(ReconcileOutcome::Resumed(started)),
                Err(MiningError::SessionAlreadyActive | MiningError::SessionTransitionInProgress) => {
                    Ok(ReconcileOutcome::AlreadyActive)
                }
                Err(e) => Err(e),
            },
            (true, None) => {
                self.store.clear_node_flag(user_id).await?;
                let warning = "Node was marked active without an open session; the flag was \
                               cleared and no earnings were credited"
                    .to_string();
                tracing::warn!(user_id = %user_id, "Cleared orphaned node flag");
                Ok(ReconcileOutcome::OrphanFlagCleared { warning })
            }
            (false, Some(session)) => {
                let closed = self
                    .store
                    .close(user_id, session.session_id, chrono::Utc::now())
                    .await?;
                let warning = format!(
                    "Open session {} had no active node; closed at its checkpointed earnings",
                    closed.session_id
                );
                tracing::warn!(
                    user_id = %user_id,
                    session_id = %closed.session_id,
                    earnings = %closed.earnings,
                    "Closed orphaned session"
                );
                Ok(ReconcileOutcome::OrphanSessionClosed {
                    session_id: closed.session_id,
                    earnings: closed.earnings,
                    warning,
                })
            }
            (false, None) => Ok(ReconcileOutcome::Idle),
        }
    }

    /// Reconcile every user flagged active. Per-user failures are logged and
    /// counted; only failing to list the users is an error.
    pub async fn reconcile_all(&self) -> MiningResult<ReconcileSummary> {
        let user_ids = self.store.find_node_active_user_ids().await?;
        let mut summary = ReconcileSummary::default();

        for user_id in &user_ids {
            match self.reconcile(user_id, None).await {
                Ok(ReconcileOutcome::Resumed(_)) => summary.resumed += 1,
                Ok(ReconcileOutcome::OrphanFlagCleared { .. })
                | Ok(ReconcileOutcome::OrphanSessionClosed { .. }) => summary.orphans_cleared += 1,
                Ok(ReconcileOutcome::AlreadyActive) => summary.already_active += 1,
                Ok(ReconcileOutcome::Idle) => {}
                Err(e) => {
                    summary.failed += 1;
                    tracing::error!(user_id = %user_id, error = %e, "Reconciliation failed");
                }
            }
        }

        tracing::info!(
            users = user_ids.len(),
            resumed = summary.resumed,
            orphans_cleared = summary.orphans_cleared,
            failed = summary.failed,
            "Reconciliation complete"
        );
        Ok(summary)
    }
}

//! API DTOs (Data Transfer Objects)
//!
//! Money and rates are serialized as decimal strings.

use chrono::{DateTime, Utc};
use kernel::id::MiningSessionId;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::application::reconcile::ReconcileOutcome;
use crate::application::session_manager::{DisplayState, StartedSession, StoppedSession};
use crate::application::settlement::TaskRewardReceipt;
use crate::domain::entities::Task;
use crate::domain::value_objects::TaskType;

/// Response for POST /api/mining/users/{user_id}/session/start
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionResponse {
    pub session_id: MiningSessionId,
    pub started_at: DateTime<Utc>,
    pub rate_per_minute: Decimal,
    pub hash_rate: Decimal,
    /// Percent
    pub efficiency: Decimal,
    pub penalty_level: u8,
}

impl From<StartedSession> for StartSessionResponse {
    fn from(started: StartedSession) -> Self {
        Self {
            session_id: started.session_id,
            started_at: started.started_at,
            rate_per_minute: started.rate.per_minute,
            hash_rate: started.rate.hash_rate(),
            efficiency: started.rate.efficiency_percent(),
            penalty_level: started.rate.penalty_level,
        }
    }
}

/// Response for POST /api/mining/users/{user_id}/session/stop
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopSessionResponse {
    pub session_id: MiningSessionId,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub earnings: Decimal,
}

impl From<StoppedSession> for StopSessionResponse {
    fn from(stopped: StoppedSession) -> Self {
        Self {
            session_id: stopped.session_id,
            started_at: stopped.started_at,
            ended_at: stopped.ended_at,
            earnings: stopped.earnings,
        }
    }
}

/// Response for GET /api/mining/users/{user_id}/session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayStateResponse {
    pub phase: &'static str,
    pub active: bool,
    pub session_id: Option<MiningSessionId>,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_seconds: i64,
    pub current_rate: Decimal,
    pub hash_rate: Decimal,
    pub efficiency: Decimal,
    pub checkpointed_earnings: Decimal,
    pub unflushed_earnings: Decimal,
    pub session_earnings: Decimal,
}

impl From<DisplayState> for DisplayStateResponse {
    fn from(state: DisplayState) -> Self {
        Self {
            phase: state.phase.as_str(),
            active: state.active,
            session_id: state.session_id,
            started_at: state.started_at,
            uptime_seconds: state.uptime_seconds,
            current_rate: state.current_rate,
            hash_rate: state.hash_rate,
            efficiency: state.efficiency_percent,
            checkpointed_earnings: state.checkpointed_earnings,
            unflushed_earnings: state.unflushed_earnings,
            session_earnings: state.session_earnings,
        }
    }
}

/// Response for POST /api/mining/users/{user_id}/tasks/{task_id}/complete
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteTaskResponse {
    pub task_id: String,
    pub total_reward: Decimal,
    pub referral_bonus: Decimal,
}

impl From<TaskRewardReceipt> for CompleteTaskResponse {
    fn from(receipt: TaskRewardReceipt) -> Self {
        Self {
            task_id: receipt.task_id,
            total_reward: receipt.total_reward,
            referral_bonus: receipt.referral_bonus,
        }
    }
}

/// Item of GET /api/mining/tasks
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResponse {
    pub id: String,
    pub title: String,
    pub base_reward: Decimal,
    pub max_progress: i32,
    #[serde(rename = "type")]
    pub task_type: TaskType,
}

impl From<Task> for TaskResponse {
    fn from(task: Task) -> Self {
        Self {
            id: task.task_id,
            title: task.title,
            base_reward: task.base_reward,
            max_progress: task.max_progress,
            task_type: task.task_type,
        }
    }
}

/// Response for POST /api/mining/users/{user_id}/reconcile
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileResponse {
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<MiningSessionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub earnings: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl From<ReconcileOutcome> for ReconcileResponse {
    fn from(outcome: ReconcileOutcome) -> Self {
        let empty = |outcome| Self {
            outcome,
            session_id: None,
            earnings: None,
            warning: None,
        };
        match outcome {
            ReconcileOutcome::Idle => empty("idle"),
            ReconcileOutcome::AlreadyActive => empty("already_active"),
            ReconcileOutcome::Resumed(started) => Self {
                session_id: Some(started.session_id),
                ..empty("resumed")
            },
            ReconcileOutcome::OrphanFlagCleared { warning } => Self {
                warning: Some(warning),
                ..empty("orphan_flag_cleared")
            },
            ReconcileOutcome::OrphanSessionClosed {
                session_id,
                earnings,
                warning,
            } => Self {
                session_id: Some(session_id),
                earnings: Some(earnings),
                warning: Some(warning),
                ..empty("orphan_session_closed")
            },
        }
    }
}

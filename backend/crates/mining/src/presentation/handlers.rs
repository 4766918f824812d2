//! HTTP Handlers

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};

use crate::application::complete_task::CompleteTaskUseCase;
use crate::application::reconcile::ReconciliationLoader;
use crate::application::session_manager::MiningSessionManager;
use crate::domain::repository::{AntiCheatClassifier, MiningStore, TaskCatalog};
use crate::domain::value_objects::UserId;
use crate::error::MiningResult;
use crate::presentation::client::ClientIp;
use crate::presentation::dto::{
    CompleteTaskResponse, DisplayStateResponse, ReconcileResponse, StartSessionResponse,
    StopSessionResponse, TaskResponse,
};

/// Shared state for mining handlers
pub struct MiningAppState<S, A, C>
where
    S: MiningStore,
    A: AntiCheatClassifier + Sync + 'static,
    C: TaskCatalog + Sync + 'static,
{
    pub manager: Arc<MiningSessionManager<S, A>>,
    pub reconciler: Arc<ReconciliationLoader<S, A>>,
    pub catalog: Arc<C>,
}

impl<S, A, C> MiningAppState<S, A, C>
where
    S: MiningStore,
    A: AntiCheatClassifier + Sync + 'static,
    C: TaskCatalog + Sync + 'static,
{
    pub fn new(store: Arc<S>, manager: Arc<MiningSessionManager<S, A>>, catalog: Arc<C>) -> Self {
        Self {
            reconciler: Arc::new(ReconciliationLoader::new(store, manager.clone())),
            manager,
            catalog,
        }
    }
}

// Manual impl: derive would require `S: Clone` etc.
impl<S, A, C> Clone for MiningAppState<S, A, C>
where
    S: MiningStore,
    A: AntiCheatClassifier + Sync + 'static,
    C: TaskCatalog + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
            reconciler: self.reconciler.clone(),
            catalog: self.catalog.clone(),
        }
    }
}

/// POST /api/mining/users/{user_id}/session/start
pub async fn start_session<S, A, C>(
    State(state): State<MiningAppState<S, A, C>>,
    Path(user_id): Path<String>,
    ClientIp(ip): ClientIp,
) -> MiningResult<Json<StartSessionResponse>>
where
    S: MiningStore,
    A: AntiCheatClassifier + Sync + 'static,
    C: TaskCatalog + Sync + 'static,
{
    let user_id = UserId::new(user_id)?;
    let started = state.manager.start(&user_id, ip).await?;
    Ok(Json(started.into()))
}

/// POST /api/mining/users/{user_id}/session/stop
pub async fn stop_session<S, A, C>(
    State(state): State<MiningAppState<S, A, C>>,
    Path(user_id): Path<String>,
) -> MiningResult<Json<StopSessionResponse>>
where
    S: MiningStore,
    A: AntiCheatClassifier + Sync + 'static,
    C: TaskCatalog + Sync + 'static,
{
    let user_id = UserId::new(user_id)?;
    let stopped = state.manager.stop(&user_id).await?;
    Ok(Json(stopped.into()))
}

/// GET /api/mining/users/{user_id}/session
pub async fn display_state<S, A, C>(
    State(state): State<MiningAppState<S, A, C>>,
    Path(user_id): Path<String>,
) -> MiningResult<Json<DisplayStateResponse>>
where
    S: MiningStore,
    A: AntiCheatClassifier + Sync + 'static,
    C: TaskCatalog + Sync + 'static,
{
    let user_id = UserId::new(user_id)?;
    Ok(Json(state.manager.display_state(&user_id).into()))
}

/// POST /api/mining/users/{user_id}/tasks/{task_id}/complete
pub async fn complete_task<S, A, C>(
    State(state): State<MiningAppState<S, A, C>>,
    Path((user_id, task_id)): Path<(String, String)>,
) -> MiningResult<Json<CompleteTaskResponse>>
where
    S: MiningStore,
    A: AntiCheatClassifier + Sync + 'static,
    C: TaskCatalog + Sync + 'static,
{
    let user_id = UserId::new(user_id)?;
    let use_case = CompleteTaskUseCase::new(state.catalog.clone(), state.manager.settlement());
    let receipt = use_case.execute(&user_id, &task_id).await?;
    Ok(Json(receipt.into()))
}

/// POST /api/mining/users/{user_id}/reconcile
pub async fn reconcile<S, A, C>(
    State(state): State<MiningAppState<S, A, C>>,
    Path(user_id): Path<String>,
    ClientIp(ip): ClientIp,
) -> MiningResult<Json<ReconcileResponse>>
where
    S: MiningStore,
    A: AntiCheatClassifier + Sync + 'static,
    C: TaskCatalog + Sync + 'static,
{
    let user_id = UserId::new(user_id)?;
    let outcome = state.reconciler.reconcile(&user_id, ip).await?;
    Ok(Json(outcome.into()))
}

/// GET /api/mining/tasks
pub async fn list_tasks<S, A, C>(
    State(state): State<MiningAppState<S, A, C>>,
) -> MiningResult<Json<Vec<TaskResponse>>>
where
    S: MiningStore,
    A: AntiCheatClassifier + Sync + 'static,
    C: TaskCatalog + Sync + 'static,
{
    let tasks = state.catalog.list().await?;
    Ok(Json(tasks.into_iter().map(TaskResponse::from).collect()))
}

//! Mining Router

use axum::{
    Router,
    routing::{get, post},
};

use crate::domain::repository::{AntiCheatClassifier, MiningStore, TaskCatalog};
use crate::presentation::handlers::{self, MiningAppState};

/// Create the mining router for any store, classifier and catalog
pub fn mining_router<S, A, C>(state: MiningAppState<S, A, C>) -> Router
where
    S: MiningStore,
    A: AntiCheatClassifier + Sync + 'static,
    C: TaskCatalog + Sync + 'static,
{
    Router::new()
        .route("/tasks", get(handlers::list_tasks::<S, A, C>))
        .route(
            "/users/{user_id}/session",
            get(handlers::display_state::<S, A, C>),
        )
        .route(
            "/users/{user_id}/session/start",
            post(handlers::start_session::<S, A, C>),
        )
        .route(
            "/users/{user_id}/session/stop",
            post(handlers::stop_session::<S, A, C>),
        )
        .route(
            "/users/{user_id}/tasks/{task_id}/complete",
            post(handlers::complete_task::<S, A, C>),
        )
        .route(
            "/users/{user_id}/reconcile",
            post(handlers::reconcile::<S, A, C>),
        )
        .with_state(state)
}

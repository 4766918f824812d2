//! Mining Accrual & Settlement Engine
//!
//! Clean Architecture structure:
//! - `domain/` - Reward arithmetic, entities, settlement plans, repository traits
//! - `application/` - Session state machine, checkpointing, settlement, reconciliation
//! - `infra/` - PostgreSQL and in-memory stores, anti-cheat clients
//! - `presentation/` - HTTP handlers
//!
//! ## Consistency Model
//! - The durable store is the single source of truth; in-memory accrual is a cache
//! - Displayed earnings = last checkpointed earnings + un-checkpointed accrual
//! - Every settlement (credit + referral cascade + audit entry) is one transaction
//! - Checkpoints are idempotent per (session, sequence)

pub mod application;
pub mod domain;
pub mod error;
pub mod infra;
pub mod presentation;

// Re-exports for convenience
pub use application::config::{FlushFailurePolicy, MiningConfig};
pub use application::reconcile::{ReconcileOutcome, ReconciliationLoader};
pub use application::session_manager::MiningSessionManager;
pub use error::{ErrorClass, MiningError, MiningResult};
pub use infra::anti_cheat::{ConfiguredAntiCheat, HttpAntiCheatClassifier, NoPenaltyClassifier};
pub use infra::memory::{InMemoryMiningStore, StaticTaskCatalog};
pub use infra::postgres::PgMiningRepository;
pub use presentation::handlers::MiningAppState;
pub use presentation::router::mining_router;

// Re-export kernel error types for unified error handling
pub use kernel::error::{app_error::AppError, kind::ErrorKind};

#[cfg(test)]
mod tests;

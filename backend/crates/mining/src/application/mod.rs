//! Application Layer - Use Cases
//!
//! This layer orchestrates domain logic and infrastructure.
//! Contains the session state machine, checkpointing, settlement and
//! reconciliation.

pub mod checkpoint;
pub mod complete_task;
pub mod config;
pub mod rate;
pub mod reconcile;
pub mod session_manager;
pub mod settlement;

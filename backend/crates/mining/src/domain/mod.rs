//! Domain Layer - Business logic and entities
//!
//! This layer contains:
//! - Domain entities (UserBalance, MiningSession, ReferralEarning, Task)
//! - Domain value objects (UserId, AccountMultiplier, Efficiency)
//! - Domain services (rate tiers, accrual and referral arithmetic)
//! - Settlement plans and the session accumulator
//! - Repository traits (interfaces)

pub mod entities;
pub mod ledger;
pub mod repository;
pub mod services;
pub mod session;
pub mod value_objects;

//! Infrastructure Layer - Store and collaborator implementations

pub mod anti_cheat;
pub mod memory;
pub mod postgres;

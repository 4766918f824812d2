//! Domain Value Objects
//!
//! Immutable value types for the mining domain.

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::{MiningError, MiningResult};

/// Opaque user identifier (Discord snowflake in practice, never parsed)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl UserId {
    pub const MAX_LEN: usize = 64;

    pub fn new(raw: impl Into<String>) -> MiningResult<Self> {
        let raw = raw.into();
        if raw.is_empty() || raw.len() > Self::MAX_LEN {
            return Err(MiningError::Validation(format!(
                "user id must be 1..={} bytes",
                Self::MAX_LEN
            )));
        }
        if raw.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(MiningError::Validation(
                "user id must not contain whitespace or control characters".to_string(),
            ));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for UserId {
    type Error = MiningError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<UserId> for String {
    fn from(id: UserId) -> Self {
        id.0
    }
}

/// Account-age reward multiplier, always >= 1
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct AccountMultiplier(Decimal);

impl AccountMultiplier {
    pub const BASE: AccountMultiplier = AccountMultiplier(Decimal::ONE);

    pub fn new(value: Decimal) -> MiningResult<Self> {
        if value < Decimal::ONE {
            return Err(MiningError::Validation(format!(
                "account multiplier must be >= 1 (got {value})"
            )));
        }
        Ok(Self(value))
    }

    pub fn value(&self) -> Decimal {
        self.0
    }
}

impl Default for AccountMultiplier {
    fn default() -> Self {
        Self::BASE
    }
}

/// Anti-cheat efficiency factor, clamped to [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Efficiency(Decimal);

impl Efficiency {
    pub const FULL: Efficiency = Efficiency(Decimal::ONE);

    /// Out-of-range classifier output is clamped rather than rejected.
    pub fn clamped(value: Decimal) -> Self {
        Self(value.clamp(Decimal::ZERO, Decimal::ONE))
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    /// Percentage shown next to the hash rate
    pub fn as_percent(&self) -> Decimal {
        self.0 * dec!(100)
    }
}

impl Default for Efficiency {
    fn default() -> Self {
        Self::FULL
    }
}

/// Strictly positive currency amount
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RewardAmount(Decimal);

impl RewardAmount {
    pub fn new(value: Decimal) -> MiningResult<Self> {
        if value <= Decimal::ZERO {
            return Err(MiningError::Validation(format!(
                "reward amount must be positive (got {value})"
            )));
        }
        Ok(Self(value))
    }

    pub fn value(&self) -> Decimal {
        self.0
    }
}

/// Tag stored on every referral log entry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EarningType {
    Mining,
    TaskCompletion,
    Other(String),
}

impl EarningType {
    pub fn as_str(&self) -> &str {
        match self {
            EarningType::Mining => "mining",
            EarningType::TaskCompletion => "task_completion",
            EarningType::Other(tag) => tag,
        }
    }
}

impl fmt::Display for EarningType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EarningType {
    type Err = MiningError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mining" => Ok(EarningType::Mining),
            "task_completion" => Ok(EarningType::TaskCompletion),
            "" => Err(MiningError::Validation("empty earning type".to_string())),
            other => Ok(EarningType::Other(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Daily,
    Social,
    Mining,
    Referral,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Daily => "daily",
            TaskType::Social => "social",
            TaskType::Mining => "mining",
            TaskType::Referral => "referral",
        }
    }
}

impl FromStr for TaskType {
    type Err = MiningError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily" => Ok(TaskType::Daily),
            "social" => Ok(TaskType::Social),
            "mining" => Ok(TaskType::Mining),
            "referral" => Ok(TaskType::Referral),
            other => Err(MiningError::Validation(format!("unknown task type: {other}"))),
        }
    }
}

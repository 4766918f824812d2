//! Application Configuration
//!
//! Configuration for the mining application layer.

use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;

use crate::domain::services::{BASE_RATE_PER_MINUTE, REFERRAL_RATE};
use crate::error::{MiningError, MiningResult};

/// What the checkpoint scheduler does with a checkpoint the store rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushFailurePolicy {
    /// Keep the checkpoint and resend it (same sequence, same amount) first
    /// on the next flush
    #[default]
    Retry,
    /// Log the lost amount and discard it
    Drop,
}

impl FlushFailurePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushFailurePolicy::Retry => "retry",
            FlushFailurePolicy::Drop => "drop",
        }
    }
}

impl FromStr for FlushFailurePolicy {
    type Err = MiningError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "retry" => Ok(FlushFailurePolicy::Retry),
            "drop" => Ok(FlushFailurePolicy::Drop),
            other => Err(MiningError::Validation(format!(
                "unknown flush failure policy: {other}"
            ))),
        }
    }
}

/// Mining application configuration
#[derive(Debug, Clone)]
pub struct MiningConfig {
    /// Display tick period
    pub tick_interval: Duration,
    /// Durable checkpoint period
    pub checkpoint_interval: Duration,
    /// Currency per minute at multiplier 1.0
    pub base_rate_per_minute: Decimal,
    /// Share of each reward credited to the referrer
    pub referral_rate: Decimal,
    pub flush_failure_policy: FlushFailurePolicy,
    /// Upper bound on one anti-cheat classification
    pub anti_cheat_timeout: Duration,
}

impl Default for MiningConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            checkpoint_interval: Duration::from_secs(10),
            base_rate_per_minute: BASE_RATE_PER_MINUTE,
            referral_rate: REFERRAL_RATE,
            flush_failure_policy: FlushFailurePolicy::Retry,
            anti_cheat_timeout: Duration::from_secs(2),
        }
    }
}

impl MiningConfig {
    /// Create config for development (short checkpoint interval)
    pub fn development() -> Self {
        Self {
            checkpoint_interval: Duration::from_secs(5),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> MiningResult<()> {
        if self.tick_interval.is_zero() {
            return Err(MiningError::Validation(
                "tick interval must be positive".to_string(),
            ));
        }
        if self.checkpoint_interval < self.tick_interval {
            return Err(MiningError::Validation(
                "checkpoint interval must not be shorter than the tick interval".to_string(),
            ));
        }
        if self.base_rate_per_minute <= Decimal::ZERO {
            return Err(MiningError::Validation(
                "base rate must be positive".to_string(),
            ));
        }
        if self.referral_rate < Decimal::ZERO || self.referral_rate >= Decimal::ONE {
            return Err(MiningError::Validation(
                "referral rate must be in [0, 1)".to_string(),
            ));
        }
        if self.anti_cheat_timeout.is_zero() {
            return Err(MiningError::Validation(
                "anti-cheat timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

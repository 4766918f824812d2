//! Rate resolution
//!
//! Combines the account multiplier with the anti-cheat verdict. The
//! classifier is bounded by a timeout; any failure degrades to full
//! efficiency so a classifier outage never blocks mining.

use std::net::IpAddr;
use std::sync::Arc;

use rust_decimal::Decimal;

use crate::application::config::MiningConfig;
use crate::domain::entities::UserBalance;
use crate::domain::repository::{AntiCheatClassifier, AntiCheatVerdict};
use crate::domain::services::{display_hash_rate, mining_rate};
use crate::domain::value_objects::{AccountMultiplier, Efficiency, UserId};

/// Rate in effect for one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MiningRate {
    /// Currency per minute after the efficiency penalty
    pub per_minute: Decimal,
    pub multiplier: AccountMultiplier,
    pub efficiency: Efficiency,
    pub penalty_level: u8,
}

impl MiningRate {
    pub fn new(base_rate: Decimal, multiplier: AccountMultiplier, verdict: AntiCheatVerdict) -> Self {
        Self {
            per_minute: mining_rate(base_rate, multiplier, verdict.efficiency),
            multiplier,
            efficiency: verdict.efficiency,
            penalty_level: verdict.penalty_level,
        }
    }

    pub fn hash_rate(&self) -> Decimal {
        display_hash_rate(self.per_minute)
    }

    pub fn efficiency_percent(&self) -> Decimal {
        self.efficiency.as_percent()
    }
}

pub struct RateResolver<A>
where
    A: AntiCheatClassifier,
{
    classifier: Arc<A>,
    config: Arc<MiningConfig>,
}

impl<A> RateResolver<A>
where
    A: AntiCheatClassifier,
{
    pub fn new(classifier: Arc<A>, config: Arc<MiningConfig>) -> Self {
        Self { classifier, config }
    }

    /// Classifier verdict, or [`AntiCheatVerdict::CLEAN`] on error or timeout
    pub async fn verdict(&self, user_id: &UserId, ip: Option<IpAddr>) -> AntiCheatVerdict {
        let call = self.classifier.classify(user_id, ip);
        match tokio::time::timeout(self.config.anti_cheat_timeout, call).await {
            Ok(Ok(verdict)) => verdict,
            Ok(Err(e)) => {
                tracing::warn!(user_id = %user_id, error = %e, "Anti-cheat classification failed, using full efficiency");
                AntiCheatVerdict::CLEAN
            }
            Err(_) => {
                tracing::warn!(
                    user_id = %user_id,
                    timeout_ms = self.config.anti_cheat_timeout.as_millis() as u64,
                    "Anti-cheat classification timed out, using full efficiency"
                );
                AntiCheatVerdict::CLEAN
            }
        }
    }

    pub async fn resolve(&self, user: &UserBalance, ip: Option<IpAddr>) -> MiningRate {
        let verdict = self.verdict(&user.user_id, ip).await;
        MiningRate::new(self.config.base_rate_per_minute, user.multiplier, verdict)
    }
}

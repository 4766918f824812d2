//! Domain Services
//!
//! Pure reward arithmetic: account-age tiers, mining rate, per-tick accrual
//! and the referral split. No I/O.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;

use crate::domain::value_objects::{AccountMultiplier, Efficiency};

/// Currency per minute at multiplier 1.0 and no anti-cheat penalty
pub const BASE_RATE_PER_MINUTE: Decimal = dec!(0.5);

/// Share of every reward credited to the earner's referrer
pub const REFERRAL_RATE: Decimal = dec!(0.10);

/// Decimal places persisted by the ledger (NUMERIC(30, 10))
pub const LEDGER_SCALE: u32 = 10;

/// Hash rate display units per currency/minute
const HASH_RATE_DISPLAY_FACTOR: Decimal = dec!(1000);

/// Lower bound (whole years) → multiplier
const ACCOUNT_AGE_TIERS: [(i64, Decimal); 9] = [
    (8, dec!(10.0)),
    (7, dec!(7.0)),
    (6, dec!(5.0)),
    (5, dec!(3.5)),
    (4, dec!(2.5)),
    (3, dec!(2.0)),
    (2, dec!(1.5)),
    (1, dec!(1.2)),
    (0, dec!(1.0)),
];

/// Whole years between account creation and `now`, using 365.25-day years.
///
/// A creation time in the future (clock skew) counts as zero years.
pub fn account_age_years(created_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let days = (now - created_at).num_days().max(0);
    days * 4 / 1461
}

/// Multiplier tier for an account age in whole years
pub fn multiplier_for_age(years: i64) -> AccountMultiplier {
    let value = ACCOUNT_AGE_TIERS
        .iter()
        .find(|(min_years, _)| years >= *min_years)
        .map(|(_, m)| *m)
        .unwrap_or(Decimal::ONE);
    AccountMultiplier::new(value).unwrap_or_default()
}

pub fn multiplier_for_account(created_at: DateTime<Utc>, now: DateTime<Utc>) -> AccountMultiplier {
    multiplier_for_age(account_age_years(created_at, now))
}

/// Adjusted mining rate in currency per minute
pub fn mining_rate(base_rate: Decimal, multiplier: AccountMultiplier, efficiency: Efficiency) -> Decimal {
    base_rate * multiplier.value() * efficiency.value()
}

/// Amount accrued by `ticks` display ticks of length `tick`, in one step
pub fn accrual_for_ticks(rate_per_minute: Decimal, tick: Duration, ticks: u64) -> Decimal {
    rate_per_minute * Decimal::from(ticks) * Decimal::from(tick.as_millis() as u64) / dec!(60000)
}

/// Referral bonus owed on `amount`, truncated to ledger precision
pub fn referral_bonus(amount: Decimal, referral_rate: Decimal) -> Decimal {
    to_ledger_scale(amount * referral_rate)
}

/// Truncate toward zero to what the ledger can store
pub fn to_ledger_scale(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(LEDGER_SCALE, RoundingStrategy::ToZero)
}

pub fn display_hash_rate(rate_per_minute: Decimal) -> Decimal {
    rate_per_minute * HASH_RATE_DISPLAY_FACTOR
}

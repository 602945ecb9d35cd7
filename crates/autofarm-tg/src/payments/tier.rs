use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::Serialize;

/// Subscription plan. The discriminants are stored in the database.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    TryFromPrimitive,
    IntoPrimitive,
    Serialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[repr(i16)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub(crate) enum Tier {
    Basic = 0,
    Pro = 1,
    Enterprise = 2,
}

sqlx_bat::impl_try_into_from_db_via_std!(Tier, i16);

impl Tier {
    pub(crate) fn price_usd(self) -> f64 {
        match self {
            Tier::Basic => 15.0,
            Tier::Pro => 45.0,
            Tier::Enterprise => 75.0,
        }
    }

    /// Number of ad slots included in the plan
    pub(crate) fn slots(self) -> i32 {
        match self {
            Tier::Basic => 1,
            Tier::Pro => 3,
            Tier::Enterprise => 5,
        }
    }
}

/// Cryptocurrency accepted for the payments. The discriminants are stored
/// in the database.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    TryFromPrimitive,
    IntoPrimitive,
    Serialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[repr(i16)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub(crate) enum Crypto {
    Ton = 0,
    Btc = 1,
    Ltc = 2,
}

sqlx_bat::impl_try_into_from_db_via_std!(Crypto, i16);

impl Crypto {
    /// Number of decimal places the payment amount is rounded to
    pub(crate) fn decimals(self) -> i32 {
        match self {
            Crypto::Ton => 4,
            Crypto::Btc => 8,
            Crypto::Ltc => 6,
        }
    }

    /// How many of the smallest indivisible units make up a single coin
    pub(crate) fn base_units_per_coin(self) -> f64 {
        match self {
            // nanotons
            Crypto::Ton => 1e9,
            // satoshis and litoshis
            Crypto::Btc | Crypto::Ltc => 1e8,
        }
    }

    pub(crate) fn coingecko_id(self) -> &'static str {
        match self {
            Crypto::Ton => "the-open-network",
            Crypto::Btc => "bitcoin",
            Crypto::Ltc => "litecoin",
        }
    }

    /// Converts the USD amount to the amount in this currency
    pub(crate) fn amount_for_usd(self, usd: f64, usd_per_coin: f64) -> f64 {
        round_half_away_from_zero(usd / usd_per_coin, self.decimals())
    }
}

pub(crate) fn round_half_away_from_zero(value: f64, decimals: i32) -> f64 {
    let factor = 10_f64.powi(decimals);
    // `f64::round` rounds half-way cases away from zero
    (value * factor).round() / factor
}

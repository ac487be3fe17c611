/// Amount Parser
///
/// Converts between the node's decimal coin amounts and integer base units,
/// and computes the block subsidy paid by a coinbase.
///
/// The subsidy starts at 50 coins and halves every 210,000 blocks. A height
/// exactly on the interval boundary already pays the halved amount.
use serde::{Deserialize, Deserializer, Serializer};

/// Base units per coin
pub const COIN: u64 = 100_000_000;

/// Blocks between subsidy halvings
pub const HALVING_INTERVAL: u64 = 210_000;

const INITIAL_SUBSIDY: u64 = 50 * COIN;

/// Subsidy in base units for a block at `height`
pub fn block_subsidy(height: u64) -> u64 {
    let halvings = height / HALVING_INTERVAL;
    if halvings >= 64 {
        return 0;
    }

    INITIAL_SUBSIDY >> halvings
}

/// Convert a decimal coin amount (as reported by the node) to base units
pub fn coins_to_units(coins: f64) -> u64 {
    (coins * COIN as f64).round() as u64
}

pub fn units_to_coins(units: u64) -> f64 {
    units as f64 / COIN as f64
}

/// Serde adapter storing base units as a decimal coin amount
pub mod coin_serde {
    use super::{coins_to_units, units_to_coins, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(units: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(units_to_coins(*units))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let coins = f64::deserialize(deserializer)?;
        Ok(coins_to_units(coins))
    }
}

//! Core data types for the factor engine.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// One asset on one date, as seen by the ranking and simulation stages.
///
/// `signal` is `None` when the rolling statistic failed its coverage or
/// validity gate; `ret` is `None` on a data gap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub date: NaiveDate,
    pub symbol: String,
    pub signal: Option<f64>,
    /// Return realized over `date` (close of the prior row to close of this row).
    pub ret: Option<f64>,
    pub liquidity: Option<f64>,
    pub market_cap: Option<f64>,
    /// Trailing realized volatility, computed from rows strictly before `date`.
    pub volatility: Option<f64>,
}

impl Observation {
    /// Create an observation with only a signal and a return.
    pub fn new(date: NaiveDate, symbol: impl Into<String>, signal: Option<f64>, ret: Option<f64>) -> Self {
        Self {
            date,
            symbol: symbol.into(),
            signal,
            ret,
            liquidity: None,
            market_cap: None,
            volatility: None,
        }
    }

    pub fn with_liquidity(mut self, liquidity: f64) -> Self {
        self.liquidity = Some(liquidity);
        self
    }

    pub fn with_market_cap(mut self, market_cap: f64) -> Self {
        self.market_cap = Some(market_cap);
        self
    }

    pub fn with_volatility(mut self, volatility: f64) -> Self {
        self.volatility = Some(volatility);
        self
    }

    /// Signal value if present and finite.
    pub fn valid_signal(&self) -> Option<f64> {
        self.signal.filter(|s| s.is_finite())
    }
}

/// Leg membership of a symbol on a rebalance date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    Long,
    Short,
    Neutral,
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bucket::Long => write!(f, "LONG"),
            Bucket::Short => write!(f, "SHORT"),
            Bucket::Neutral => write!(f, "NEUTRAL"),
        }
    }
}

/// Signed target weights keyed by symbol.
///
/// Positive weights are long, negative weights are short. A vector is built
/// once per rebalance and replaced wholesale on the next one. The map is
/// ordered so that every iteration (and therefore every floating point sum)
/// happens in the same order across runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeightVector {
    weights: BTreeMap<String, f64>,
}

impl WeightVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from separate long and short magnitude maps.
    ///
    /// Magnitudes are taken as absolute values; short weights are stored
    /// negated. A symbol present in both maps keeps its long entry only.
    pub fn from_legs(long: BTreeMap<String, f64>, short: BTreeMap<String, f64>) -> Self {
        let mut weights = BTreeMap::new();
        for (symbol, w) in short {
            weights.insert(symbol, -w.abs());
        }
        for (symbol, w) in long {
            weights.insert(symbol, w.abs());
        }
        Self { weights }
    }

    pub fn get(&self, symbol: &str) -> f64 {
        self.weights.get(symbol).copied().unwrap_or(0.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &f64)> {
        self.weights.iter()
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn bucket(&self, symbol: &str) -> Bucket {
        match self.weights.get(symbol) {
            Some(w) if *w > 0.0 => Bucket::Long,
            Some(w) if *w < 0.0 => Bucket::Short,
            _ => Bucket::Neutral,
        }
    }

    pub fn long_symbols(&self) -> Vec<String> {
        self.weights
            .iter()
            .filter(|(_, w)| **w > 0.0)
            .map(|(s, _)| s.clone())
            .collect()
    }

    pub fn short_symbols(&self) -> Vec<String> {
        self.weights
            .iter()
            .filter(|(_, w)| **w < 0.0)
            .map(|(s, _)| s.clone())
            .collect()
    }

    /// Sum of long weights.
    pub fn gross_long(&self) -> f64 {
        self.weights.values().filter(|w| **w > 0.0).sum()
    }

    /// Sum of absolute short weights.
    pub fn gross_short(&self) -> f64 {
        self.weights.values().filter(|w| **w < 0.0).map(|w| w.abs()).sum()
    }

    pub fn as_map(&self) -> &BTreeMap<String, f64> {
        &self.weights
    }
}

/// Audit entry written on each successful rebalance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub rebalance_date: NaiveDate,
    pub long_symbols: Vec<String>,
    pub short_symbols: Vec<String>,
    /// Signal value at the long cutoff (the least extreme selected long name).
    pub long_threshold: Option<f64>,
    /// Signal value at the short cutoff.
    pub short_threshold: Option<f64>,
    /// Number of symbols that passed every eligibility gate.
    pub eligible: usize,
    pub turnover: f64,
}

/// Portfolio value on one simulated date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyValue {
    pub date: NaiveDate,
    pub capital: f64,
    pub daily_return: f64,
    pub long_return: f64,
    pub short_return: f64,
    /// Fraction of capital paid in transaction costs on this date.
    pub transaction_cost: f64,
    pub rebalanced: bool,
}

//! Cross-sectional ranking and long/short bucket assignment.

use crate::config::{FactorConfig, SelectionRule, SignalDirection};
use crate::error::{BacktestError, Result};
use crate::types::{Bucket, Observation};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One eligible symbol after ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedSymbol {
    pub symbol: String,
    pub signal: f64,
    /// Percentile rank on a 0-100 scale, 0 for the lowest signal.
    pub percentile: f64,
    pub bucket: Bucket,
    pub volatility: Option<f64>,
}

/// Partition of a date's eligible symbols into legs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketAssignment {
    pub date: NaiveDate,
    /// Eligible symbols in input order.
    pub ranked: Vec<RankedSymbol>,
    pub direction: SignalDirection,
}

impl BucketAssignment {
    fn in_bucket(&self, bucket: Bucket) -> impl Iterator<Item = &RankedSymbol> {
        self.ranked.iter().filter(move |r| r.bucket == bucket)
    }

    pub fn long(&self) -> Vec<&RankedSymbol> {
        self.in_bucket(Bucket::Long).collect()
    }

    pub fn short(&self) -> Vec<&RankedSymbol> {
        self.in_bucket(Bucket::Short).collect()
    }

    pub fn neutral(&self) -> Vec<&RankedSymbol> {
        self.in_bucket(Bucket::Neutral).collect()
    }

    pub fn long_symbols(&self) -> Vec<String> {
        self.in_bucket(Bucket::Long).map(|r| r.symbol.clone()).collect()
    }

    pub fn short_symbols(&self) -> Vec<String> {
        self.in_bucket(Bucket::Short).map(|r| r.symbol.clone()).collect()
    }

    pub fn bucket_of(&self, symbol: &str) -> Bucket {
        self.ranked
            .iter()
            .find(|r| r.symbol == symbol)
            .map(|r| r.bucket)
            .unwrap_or(Bucket::Neutral)
    }

    pub fn eligible(&self) -> usize {
        self.ranked.len()
    }

    /// Least extreme signal admitted to the long leg.
    pub fn long_threshold(&self) -> Option<f64> {
        let signals = self.in_bucket(Bucket::Long).map(|r| r.signal);
        match self.direction {
            SignalDirection::LongLow => signals.reduce(f64::max),
            SignalDirection::LongHigh => signals.reduce(f64::min),
        }
    }

    /// Least extreme signal admitted to the short leg.
    pub fn short_threshold(&self) -> Option<f64> {
        let signals = self.in_bucket(Bucket::Short).map(|r| r.signal);
        match self.direction {
            SignalDirection::LongLow => signals.reduce(f64::min),
            SignalDirection::LongHigh => signals.reduce(f64::max),
        }
    }
}

/// Percentile ranks (0-100) of `values`, lowest value first.
///
/// Ties are ordered by position in the input, so identical inputs always
/// produce identical ranks. A single value ranks at 50.
pub fn percentile_ranks(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    if n == 0 {
        return Vec::new();
    }
    if n == 1 {
        return vec![50.0];
    }

    let mut order: Vec<usize> = (0..n).collect();
    // Stable sort keeps input order among equal values.
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));

    let mut ranks = vec![0.0; n];
    for (rank, &idx) in order.iter().enumerate() {
        ranks[idx] = rank as f64 / (n - 1) as f64 * 100.0;
    }
    ranks
}

/// Assigns each date's eligible symbols to long, short or neutral.
#[derive(Debug, Clone, PartialEq)]
pub struct CrossSectionalRanker {
    selection: SelectionRule,
    direction: SignalDirection,
    min_liquidity: Option<f64>,
    min_market_cap: Option<f64>,
    min_universe: usize,
}

impl CrossSectionalRanker {
    pub fn new(selection: SelectionRule, direction: SignalDirection) -> Self {
        Self {
            selection,
            direction,
            min_liquidity: None,
            min_market_cap: None,
            min_universe: 2,
        }
    }

    pub fn from_config(config: &FactorConfig) -> Self {
        Self {
            selection: config.selection,
            direction: config.direction,
            min_liquidity: config.min_liquidity,
            min_market_cap: config.min_market_cap,
            min_universe: config.min_universe,
        }
    }

    pub fn with_min_universe(mut self, min_universe: usize) -> Self {
        self.min_universe = min_universe;
        self
    }

    pub fn with_min_liquidity(mut self, min_liquidity: f64) -> Self {
        self.min_liquidity = Some(min_liquidity);
        self
    }

    pub fn with_min_market_cap(mut self, min_market_cap: f64) -> Self {
        self.min_market_cap = Some(min_market_cap);
        self
    }

    /// Observations with a valid signal that pass the liquidity and
    /// market-cap gates. A gate rejects symbols that lack the field.
    pub fn eligible<'a>(&self, observations: &'a [Observation]) -> Vec<&'a Observation> {
        observations
            .iter()
            .filter(|o| o.valid_signal().is_some())
            .filter(|o| match self.min_liquidity {
                Some(min) => o.liquidity.map_or(false, |l| l >= min),
                None => true,
            })
            .filter(|o| match self.min_market_cap {
                Some(min) => o.market_cap.map_or(false, |m| m >= min),
                None => true,
            })
            .collect()
    }

    /// Rank a date's cross-section and assign buckets.
    ///
    /// Fails with a recoverable error when the universe is too small or when
    /// neither leg receives a symbol.
    pub fn rank(&self, date: NaiveDate, observations: &[Observation]) -> Result<BucketAssignment> {
        let eligible = self.eligible(observations);
        if eligible.len() < self.min_universe {
            return Err(BacktestError::InsufficientUniverse {
                date,
                eligible: eligible.len(),
                required: self.min_universe,
            });
        }

        let signals: Vec<f64> = eligible.iter().filter_map(|o| o.valid_signal()).collect();
        let percentiles = percentile_ranks(&signals);
        let buckets = self.assign(&percentiles);

        let ranked: Vec<RankedSymbol> = eligible
            .iter()
            .zip(signals.iter().zip(percentiles.iter().zip(buckets)))
            .map(|(obs, (&signal, (&percentile, bucket)))| RankedSymbol {
                symbol: obs.symbol.clone(),
                signal,
                percentile,
                bucket,
                volatility: obs.volatility,
            })
            .collect();

        let assignment = BucketAssignment {
            date,
            ranked,
            direction: self.direction,
        };

        let (n_long, n_short) = (assignment.long().len(), assignment.short().len());
        if n_long == 0 && n_short == 0 {
            return Err(BacktestError::NoCandidates { date });
        }

        debug!(
            "{}: {} eligible, {} long, {} short",
            date,
            assignment.eligible(),
            n_long,
            n_short
        );
        Ok(assignment)
    }

    fn assign(&self, percentiles: &[f64]) -> Vec<Bucket> {
        let (low_bucket, high_bucket) = match self.direction {
            SignalDirection::LongLow => (Bucket::Long, Bucket::Short),
            SignalDirection::LongHigh => (Bucket::Short, Bucket::Long),
        };

        match self.selection {
            SelectionRule::Percentile { long, short } => {
                let (low_cut, high_cut) = match self.direction {
                    SignalDirection::LongLow => (long, short),
                    SignalDirection::LongHigh => (short, long),
                };
                percentiles
                    .iter()
                    .map(|&p| {
                        if p <= low_cut {
                            low_bucket
                        } else if p >= high_cut {
                            high_bucket
                        } else {
                            Bucket::Neutral
                        }
                    })
                    .collect()
            }
            SelectionRule::Count { top_n, bottom_n } => {
                let n = percentiles.len();
                let low_count = bottom_n.min(n / 2);
                let high_count = top_n.min(n - low_count);

                // Percentiles are distinct, so position in sorted order is recoverable.
                let mut order: Vec<usize> = (0..n).collect();
                order.sort_by(|&a, &b| percentiles[a].total_cmp(&percentiles[b]));

                let mut buckets = vec![Bucket::Neutral; n];
                for &idx in order.iter().take(low_count) {
                    buckets[idx] = low_bucket;
                }
                for &idx in order.iter().rev().take(high_count) {
                    buckets[idx] = high_bucket;
                }
                buckets
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
    }

    fn universe(signals: &[(&str, f64)]) -> Vec<Observation> {
        signals
            .iter()
            .map(|(s, v)| Observation::new(date(), *s, Some(*v), Some(0.0)))
            .collect()
    }

    fn percentile_ranker(long: f64, short: f64) -> CrossSectionalRanker {
        CrossSectionalRanker::new(
            SelectionRule::Percentile { long, short },
            SignalDirection::LongLow,
        )
    }

    #[test]
    fn test_percentile_ranks() {
        assert_eq!(percentile_ranks(&[3.0, 1.0, 2.0]), vec![100.0, 0.0, 50.0]);
        assert_eq!(percentile_ranks(&[7.0]), vec![50.0]);
        assert!(percentile_ranks(&[]).is_empty());
    }

    #[test]
    fn test_ties_follow_input_order() {
        assert_eq!(percentile_ranks(&[1.0, 1.0, 1.0]), vec![0.0, 50.0, 100.0]);
    }

    #[test]
    fn test_three_symbol_scenario() {
        let obs = universe(&[("A", 0.1), ("B", 0.5), ("C", 0.9)]);
        let assignment = percentile_ranker(20.0, 80.0).rank(date(), &obs).unwrap();

        assert_eq!(assignment.long_symbols(), vec!["A"]);
        assert_eq!(assignment.short_symbols(), vec!["C"]);
        assert_eq!(assignment.bucket_of("B"), Bucket::Neutral);
        assert_eq!(assignment.long_threshold(), Some(0.1));
        assert_eq!(assignment.short_threshold(), Some(0.9));
    }

    #[test]
    fn test_long_high_direction() {
        let obs = universe(&[("A", 0.1), ("B", 0.5), ("C", 0.9)]);
        let ranker = CrossSectionalRanker::new(
            SelectionRule::Percentile {
                long: 80.0,
                short: 20.0,
            },
            SignalDirection::LongHigh,
        );
        let assignment = ranker.rank(date(), &obs).unwrap();
        assert_eq!(assignment.long_symbols(), vec!["C"]);
        assert_eq!(assignment.short_symbols(), vec!["A"]);
    }

    #[test]
    fn test_insufficient_universe() {
        let obs = universe(&[("A", 0.1), ("B", 0.5), ("C", 0.9)]);
        let err = percentile_ranker(20.0, 80.0)
            .with_min_universe(10)
            .rank(date(), &obs)
            .unwrap_err();
        assert!(matches!(
            err,
            BacktestError::InsufficientUniverse {
                eligible: 3,
                required: 10,
                ..
            }
        ));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_invalid_signals_excluded() {
        let mut obs = universe(&[("A", 0.1), ("B", 0.5), ("C", 0.9)]);
        obs.push(Observation::new(date(), "D", None, Some(0.01)));
        obs.push(Observation::new(date(), "E", Some(f64::NAN), Some(0.01)));

        let assignment = percentile_ranker(20.0, 80.0).rank(date(), &obs).unwrap();
        assert_eq!(assignment.eligible(), 3);
        assert_eq!(assignment.bucket_of("D"), Bucket::Neutral);
    }

    #[test]
    fn test_liquidity_and_market_cap_gates() {
        let obs = vec![
            Observation::new(date(), "A", Some(1.0), None).with_liquidity(10.0).with_market_cap(5.0),
            Observation::new(date(), "B", Some(2.0), None).with_liquidity(1.0).with_market_cap(5.0),
            Observation::new(date(), "C", Some(3.0), None).with_liquidity(10.0),
            Observation::new(date(), "D", Some(4.0), None).with_liquidity(20.0).with_market_cap(50.0),
        ];
        let ranker = percentile_ranker(20.0, 80.0)
            .with_min_liquidity(5.0)
            .with_min_market_cap(1.0);
        let eligible: Vec<&str> = ranker.eligible(&obs).iter().map(|o| o.symbol.as_str()).collect();
        assert_eq!(eligible, vec!["A", "D"]);
    }

    #[test]
    fn test_no_candidates_when_both_legs_empty() {
        // A lone symbol ranks at the 50th percentile and lands in neither leg.
        let obs = universe(&[("A", 1.0)]);
        let err = percentile_ranker(20.0, 80.0)
            .with_min_universe(1)
            .rank(date(), &obs)
            .unwrap_err();
        assert!(matches!(err, BacktestError::NoCandidates { .. }));
    }

    #[test]
    fn test_boundary_percentiles_are_inclusive() {
        let ranker = percentile_ranker(0.0, 100.0);
        let obs = universe(&[("A", 1.0), ("B", 2.0), ("C", 3.0)]);
        let assignment = ranker.rank(date(), &obs).unwrap();
        assert_eq!(assignment.long_symbols(), vec!["A"]);
        assert_eq!(assignment.short_symbols(), vec!["C"]);
    }

    #[test]
    fn test_count_selection() {
        let obs = universe(&[
            ("A", 5.0),
            ("B", 1.0),
            ("C", 4.0),
            ("D", 2.0),
            ("E", 3.0),
            ("F", 6.0),
        ]);
        let ranker = CrossSectionalRanker::new(
            SelectionRule::Count {
                top_n: 2,
                bottom_n: 2,
            },
            SignalDirection::LongHigh,
        );
        let assignment = ranker.rank(date(), &obs).unwrap();
        assert_eq!(assignment.long_symbols(), vec!["A", "F"]);
        assert_eq!(assignment.short_symbols(), vec!["B", "D"]);
        assert_eq!(assignment.neutral().len(), 2);
    }

    #[test]
    fn test_count_selection_capped_to_stay_disjoint() {
        let obs = universe(&[("A", 1.0), ("B", 2.0), ("C", 3.0)]);
        let ranker = CrossSectionalRanker::new(
            SelectionRule::Count {
                top_n: 3,
                bottom_n: 3,
            },
            SignalDirection::LongLow,
        );
        let assignment = ranker.rank(date(), &obs).unwrap();
        let long = assignment.long_symbols();
        let short = assignment.short_symbols();
        assert_eq!(long, vec!["A"]);
        assert_eq!(short, vec!["B", "C"]);
        assert!(long.iter().all(|s| !short.contains(s)));
    }

    #[test]
    fn test_deterministic_assignment() {
        let obs = universe(&[("A", 1.0), ("B", 1.0), ("C", 1.0), ("D", 2.0), ("E", 0.5)]);
        let ranker = percentile_ranker(30.0, 70.0);
        let first = ranker.rank(date(), &obs).unwrap();
        let second = ranker.rank(date(), &obs).unwrap();
        assert_eq!(first, second);
    }
}

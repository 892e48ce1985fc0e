//! Position sizing for the long and short legs.

use crate::config::{FactorConfig, TurnoverMode, WeightingMethod};
use crate::ranker::{BucketAssignment, RankedSymbol};
use crate::types::WeightVector;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Converts a bucket assignment into signed target weights.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionWeighter {
    method: WeightingMethod,
    long_allocation: f64,
    short_allocation: f64,
    min_volatility: f64,
}

impl PositionWeighter {
    pub fn new(method: WeightingMethod, long_allocation: f64, short_allocation: f64) -> Self {
        Self {
            method,
            long_allocation,
            short_allocation,
            min_volatility: 0.01,
        }
    }

    pub fn from_config(config: &FactorConfig) -> Self {
        Self {
            method: config.weighting_method,
            long_allocation: config.long_allocation,
            short_allocation: config.short_allocation,
            min_volatility: config.min_volatility,
        }
    }

    pub fn with_min_volatility(mut self, min_volatility: f64) -> Self {
        self.min_volatility = min_volatility;
        self
    }

    /// Allocations actually applied to each leg.
    ///
    /// When one leg is empty the other receives the whole gross allocation.
    pub fn effective_allocations(&self, has_long: bool, has_short: bool) -> (f64, f64) {
        let gross = self.long_allocation + self.short_allocation;
        match (has_long, has_short) {
            (true, true) => (self.long_allocation, self.short_allocation),
            (true, false) => (gross, 0.0),
            (false, true) => (0.0, gross),
            (false, false) => (0.0, 0.0),
        }
    }

    /// Target weights for an assignment.
    ///
    /// Long weights sum to the effective long allocation and absolute short
    /// weights sum to the effective short allocation.
    pub fn weigh(&self, assignment: &BucketAssignment) -> WeightVector {
        let long = assignment.long();
        let short = assignment.short();
        let (long_alloc, short_alloc) = self.effective_allocations(!long.is_empty(), !short.is_empty());

        let long_weights = self.leg_weights(&long, long_alloc);
        let short_weights = self.leg_weights(&short, short_alloc);

        debug!(
            "{}: weighted {} long ({:.4}) / {} short ({:.4}) with {:?}",
            assignment.date,
            long_weights.len(),
            long_alloc,
            short_weights.len(),
            short_alloc,
            self.method
        );

        WeightVector::from_legs(long_weights, short_weights)
    }

    fn leg_weights(&self, leg: &[&RankedSymbol], allocation: f64) -> BTreeMap<String, f64> {
        if leg.is_empty() || allocation <= 0.0 {
            return BTreeMap::new();
        }

        let raw: Vec<(String, f64)> = match self.method {
            WeightingMethod::EqualWeight => leg.iter().map(|r| (r.symbol.clone(), 1.0)).collect(),
            WeightingMethod::RiskParity => self.inverse_volatility(leg),
        };

        let total: f64 = raw.iter().map(|(_, w)| w).sum();
        if total <= 0.0 {
            let equal = allocation / leg.len() as f64;
            return leg.iter().map(|r| (r.symbol.clone(), equal)).collect();
        }

        raw.into_iter()
            .map(|(symbol, w)| (symbol, w / total * allocation))
            .collect()
    }

    /// Raw inverse-volatility scores, volatility floored at `min_volatility`.
    ///
    /// Symbols without a volatility estimate take the mean score of those
    /// that have one; if none do, all scores are equal.
    fn inverse_volatility(&self, leg: &[&RankedSymbol]) -> Vec<(String, f64)> {
        let scores: Vec<Option<f64>> = leg
            .iter()
            .map(|r| {
                r.volatility
                    .filter(|v| v.is_finite())
                    .map(|v| 1.0 / v.max(self.min_volatility))
            })
            .collect();

        let known: Vec<f64> = scores.iter().flatten().copied().collect();
        let fallback = if known.is_empty() {
            1.0
        } else {
            known.iter().sum::<f64>() / known.len() as f64
        };

        leg.iter()
            .zip(scores)
            .map(|(r, s)| (r.symbol.clone(), s.unwrap_or(fallback)))
            .collect()
    }
}

/// Turnover between two weight vectors under the given mode.
pub fn turnover(mode: TurnoverMode, old: &WeightVector, new: &WeightVector) -> f64 {
    match mode {
        TurnoverMode::PositionCount => position_count_turnover(old, new),
        TurnoverMode::Notional => notional_turnover(old, new),
    }
}

/// Sum of absolute weight changes across all symbols.
///
/// A full liquidation followed by a full rebuild of a 50/50 book is 2.0;
/// flipping a symbol from long to short counts both sides.
pub fn notional_turnover(old: &WeightVector, new: &WeightVector) -> f64 {
    let symbols: BTreeSet<&String> = old.as_map().keys().chain(new.as_map().keys()).collect();
    symbols
        .into_iter()
        .map(|s| (new.get(s) - old.get(s)).abs())
        .sum()
}

/// Fraction of names replaced in each leg, weighted by the leg's gross weight.
///
/// For one leg: `(entered + exited) / new_leg_size`, or `exited / old_leg_size`
/// when the new leg is empty. Building a fresh book from nothing is 1.0 per
/// unit of gross exposure.
pub fn position_count_turnover(old: &WeightVector, new: &WeightVector) -> f64 {
    let leg = |old_syms: Vec<String>, new_syms: Vec<String>| -> f64 {
        let old_set: BTreeSet<String> = old_syms.into_iter().collect();
        let new_set: BTreeSet<String> = new_syms.into_iter().collect();
        let entered = new_set.difference(&old_set).count();
        let exited = old_set.difference(&new_set).count();
        if !new_set.is_empty() {
            (entered + exited) as f64 / new_set.len() as f64
        } else if !old_set.is_empty() {
            exited as f64 / old_set.len() as f64
        } else {
            0.0
        }
    };

    let long_weight = new.gross_long().max(old.gross_long());
    let short_weight = new.gross_short().max(old.gross_short());

    leg(old.long_symbols(), new.long_symbols()) * long_weight
        + leg(old.short_symbols(), new.short_symbols()) * short_weight
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SelectionRule, SignalDirection};
    use crate::ranker::CrossSectionalRanker;
    use crate::types::Observation;
    use chrono::NaiveDate;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 6).unwrap()
    }

    /// Ten symbols S0..S9 with ascending signals and the given volatilities.
    fn assignment(vols: &[Option<f64>]) -> BucketAssignment {
        let obs: Vec<Observation> = vols
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let mut o = Observation::new(date(), format!("S{}", i), Some(i as f64), Some(0.0));
                o.volatility = *v;
                o
            })
            .collect();
        CrossSectionalRanker::new(
            SelectionRule::Percentile {
                long: 20.0,
                short: 80.0,
            },
            SignalDirection::LongLow,
        )
        .rank(date(), &obs)
        .unwrap()
    }

    fn weights(pairs: &[(&str, f64)]) -> WeightVector {
        let long = pairs
            .iter()
            .filter(|(_, w)| *w > 0.0)
            .map(|(s, w)| (s.to_string(), *w))
            .collect();
        let short = pairs
            .iter()
            .filter(|(_, w)| *w < 0.0)
            .map(|(s, w)| (s.to_string(), *w))
            .collect();
        WeightVector::from_legs(long, short)
    }

    #[test]
    fn test_equal_weight_normalization() {
        let assignment = assignment(&[None; 10]);
        let w = PositionWeighter::new(WeightingMethod::EqualWeight, 0.5, 0.5).weigh(&assignment);

        // Percentiles step by 11.1, so S0..S1 are long and S8..S9 short.
        assert_eq!(w.long_symbols(), vec!["S0", "S1"]);
        assert_eq!(w.short_symbols(), vec!["S8", "S9"]);
        assert!((w.gross_long() - 0.5).abs() < 1e-12);
        assert!((w.gross_short() - 0.5).abs() < 1e-12);
        assert!((w.get("S0") - 0.25).abs() < 1e-12);
        assert!((w.get("S9") + 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_risk_parity_inverse_volatility() {
        let mut vols = vec![Some(0.2); 10];
        vols[0] = Some(0.1);
        vols[1] = Some(0.3);
        let w = PositionWeighter::new(WeightingMethod::RiskParity, 0.5, 0.5).weigh(&assignment(&vols));

        // 1/0.1 : 1/0.3 = 3 : 1
        assert!((w.get("S0") - 0.375).abs() < 1e-12);
        assert!((w.get("S1") - 0.125).abs() < 1e-12);
        assert!((w.gross_long() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_risk_parity_volatility_floor() {
        let mut vols = vec![Some(0.2); 10];
        vols[0] = Some(0.0);
        vols[1] = Some(0.001);
        let w = PositionWeighter::new(WeightingMethod::RiskParity, 0.5, 0.5)
            .with_min_volatility(0.01)
            .weigh(&assignment(&vols));

        // Both floored to 0.01, so equal.
        assert!((w.get("S0") - w.get("S1")).abs() < 1e-12);
        assert!(w.get("S0").is_finite());
    }

    #[test]
    fn test_risk_parity_missing_volatility_gets_mean() {
        let mut vols = vec![Some(0.2); 10];
        vols[8] = None;
        vols[9] = Some(0.1);
        let w = PositionWeighter::new(WeightingMethod::RiskParity, 0.5, 0.5).weigh(&assignment(&vols));

        // S8 inherits 1/0.1 as the only known score, matching S9.
        assert!((w.get("S8") - w.get("S9")).abs() < 1e-12);
        assert!((w.gross_short() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_single_leg_takes_gross_allocation() {
        let weighter = PositionWeighter::new(WeightingMethod::EqualWeight, 0.6, 0.4);
        assert_eq!(weighter.effective_allocations(true, true), (0.6, 0.4));
        assert_eq!(weighter.effective_allocations(true, false), (1.0, 0.0));
        assert_eq!(weighter.effective_allocations(false, true), (0.0, 1.0));
    }

    #[test]
    fn test_zero_short_allocation_is_long_only() {
        let w = PositionWeighter::new(WeightingMethod::EqualWeight, 1.0, 0.0).weigh(&assignment(&[None; 10]));
        assert!(w.short_symbols().is_empty());
        assert!((w.gross_long() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_notional_turnover() {
        let old = weights(&[("A", 0.5), ("B", -0.5)]);
        let new = weights(&[("A", 0.5), ("C", -0.5)]);
        assert!((notional_turnover(&old, &new) - 1.0).abs() < 1e-12);
        assert!((notional_turnover(&WeightVector::new(), &new) - 1.0).abs() < 1e-12);
        assert_eq!(notional_turnover(&new, &new), 0.0);
    }

    #[test]
    fn test_position_count_turnover() {
        let empty = WeightVector::new();
        let book = weights(&[("A", 0.25), ("B", 0.25), ("C", -0.25), ("D", -0.25)]);
        assert!((position_count_turnover(&empty, &book) - 1.0).abs() < 1e-12);
        assert_eq!(position_count_turnover(&book, &book), 0.0);

        // One long swapped: (1 entered + 1 exited) / 2 on the long leg.
        let next = weights(&[("A", 0.25), ("E", 0.25), ("C", -0.25), ("D", -0.25)]);
        assert!((position_count_turnover(&book, &next) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_turnover_dispatch() {
        let old = WeightVector::new();
        let new = weights(&[("A", 0.5), ("B", -0.5)]);
        assert!((turnover(TurnoverMode::Notional, &old, &new) - 1.0).abs() < 1e-12);
        assert!((turnover(TurnoverMode::PositionCount, &old, &new) - 1.0).abs() < 1e-12);
    }
}

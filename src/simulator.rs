//! Day-by-day portfolio simulation.

use crate::analytics::PerformanceMetrics;
use crate::config::{FactorConfig, MissingReturnPolicy};
use crate::data::Panel;
use crate::error::{BacktestError, Result};
use crate::features::{build_observations, CrossSections};
use crate::scheduler::{RebalanceScheduler, StepOutcome};
use crate::types::{DailyValue, Observation, TradeRecord, WeightVector};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Mutable state threaded through the simulation loop.
#[derive(Debug, Clone, PartialEq)]
pub struct PortfolioState {
    pub date: Option<NaiveDate>,
    pub capital: f64,
    pub weights: WeightVector,
    pub last_rebalance_date: Option<NaiveDate>,
}

impl PortfolioState {
    pub fn new(initial_capital: f64) -> Self {
        Self {
            date: None,
            capital: initial_capital,
            weights: WeightVector::new(),
            last_rebalance_date: None,
        }
    }
}

/// Return contributions of one simulated day.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DayBlend {
    /// Weighted return of the long leg, per unit of long exposure.
    pub long_return: f64,
    /// Weighted return of the short leg's assets, per unit of short exposure.
    pub short_return: f64,
    /// Portfolio return before costs.
    pub portfolio_return: f64,
    /// Held symbols without a return on this day.
    pub gaps: usize,
}

/// Blend held weights with the day's realized returns.
///
/// The portfolio return is `gross_long * long_return - gross_short *
/// short_return`. Under [`MissingReturnPolicy::Zero`] a gap contributes
/// nothing while the leg keeps its full weight base; under `Exclude` the leg
/// return is averaged over symbols that have a return.
pub fn blend_day(
    weights: &WeightVector,
    returns: &BTreeMap<&str, f64>,
    policy: MissingReturnPolicy,
) -> DayBlend {
    let mut gaps = 0usize;
    // (weighted return, weight with data, total weight) per leg
    let mut long = (0.0, 0.0, 0.0);
    let mut short = (0.0, 0.0, 0.0);

    for (symbol, &w) in weights.iter() {
        if w == 0.0 {
            continue;
        }
        let leg = if w > 0.0 { &mut long } else { &mut short };
        let size = w.abs();
        leg.2 += size;
        match returns.get(symbol.as_str()) {
            Some(r) => {
                leg.0 += size * r;
                leg.1 += size;
            }
            None => gaps += 1,
        }
    }

    let leg_return = |(weighted, covered, total): (f64, f64, f64)| -> f64 {
        let base = match policy {
            MissingReturnPolicy::Zero => total,
            MissingReturnPolicy::Exclude => covered,
        };
        if base > 0.0 {
            weighted / base
        } else {
            0.0
        }
    };

    let long_return = leg_return(long);
    let short_return = leg_return(short);

    DayBlend {
        long_return,
        short_return,
        portfolio_return: long.2 * long_return - short.2 * short_return,
        gaps,
    }
}

/// Complete output of one backtest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationResult {
    pub run_id: Uuid,
    pub strategy_id: String,
    pub config: FactorConfig,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub initial_capital: f64,
    pub final_capital: f64,
    pub daily_values: Vec<DailyValue>,
    pub trades: Vec<TradeRecord>,
    pub metrics: PerformanceMetrics,
    /// Transaction costs paid, in currency.
    pub total_costs: f64,
    pub avg_turnover: f64,
    pub rebalance_count: usize,
    pub skipped_rebalances: usize,
    /// Held-symbol days without a realized return.
    pub data_gaps: usize,
    /// Capital reached zero and the run stopped early.
    pub ruined: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SimulationResult {
    /// Capital series including the initial value.
    pub fn capital_series(&self) -> Vec<f64> {
        std::iter::once(self.initial_capital)
            .chain(self.daily_values.iter().map(|d| d.capital))
            .collect()
    }
}

/// Runs the factor strategy over a date axis.
#[derive(Debug, Clone)]
pub struct PortfolioSimulator {
    config: FactorConfig,
}

impl PortfolioSimulator {
    pub fn new(config: FactorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &FactorConfig {
        &self.config
    }

    /// Compute observations from a panel and simulate them.
    pub fn run_panel(&self, panel: &Panel) -> Result<SimulationResult> {
        let sections = build_observations(panel, &self.config)?;
        self.run(&sections)
    }

    /// Simulate with a fresh scheduler that rebalances on the first date.
    pub fn run(&self, sections: &CrossSections) -> Result<SimulationResult> {
        let mut scheduler = RebalanceScheduler::new(&self.config);
        scheduler.force_rebalance();
        self.run_with_scheduler(sections, &mut scheduler)
    }

    /// Simulate using a caller-owned scheduler, e.g. one resumed from a store.
    ///
    /// A resumed scheduler holds weights produced on its last rebalance date,
    /// so only dates on or after that date are simulated. Earlier dates
    /// belong to the session that produced the state.
    pub fn run_with_scheduler(
        &self,
        sections: &CrossSections,
        scheduler: &mut RebalanceScheduler,
    ) -> Result<SimulationResult> {
        let resume_from = scheduler.last_rebalance_date();
        let dates: Vec<(NaiveDate, &[Observation])> = sections
            .iter()
            .filter(|(date, _)| resume_from.map_or(true, |from| *date >= from))
            .collect();
        if dates.is_empty() {
            return Err(BacktestError::NoData);
        }
        if let Some(from) = resume_from {
            let dropped = sections.len() - dates.len();
            if dropped > 0 {
                debug!("Resuming at {}: {} earlier dates not replayed", from, dropped);
            }
        }

        let started_at = Utc::now();
        let cfg = &self.config;
        info!(
            "Starting {} backtest over {} dates ({} signal, {}-day rebalance)",
            cfg.strategy_id,
            dates.len(),
            cfg.signal.name(),
            cfg.rebalance_interval_days
        );

        let mut state = PortfolioState::new(cfg.initial_capital);
        state.weights = scheduler.current_weights().clone();
        state.last_rebalance_date = scheduler.last_rebalance_date();

        let mut daily_values = Vec::with_capacity(dates.len());
        let mut trades = Vec::new();
        let mut total_costs = 0.0;
        let mut skipped = 0usize;
        let mut data_gaps = 0usize;
        let mut ruined = false;

        for (date, observations) in dates {
            let opening = state.capital;
            let mut cost_fraction = 0.0;
            let mut rebalanced = false;

            match scheduler.on_date(date, observations)? {
                StepOutcome::Rebalanced(record) => {
                    cost_fraction = record.turnover * cfg.transaction_cost_bps / 10_000.0;
                    let cost = state.capital * cost_fraction;
                    state.capital -= cost;
                    total_costs += cost;
                    state.weights = scheduler.current_weights().clone();
                    state.last_rebalance_date = Some(date);
                    trades.push(record);
                    rebalanced = true;
                }
                StepOutcome::Held => {}
                StepOutcome::Skipped(_) => skipped += 1,
            }

            let blend = blend_day(&state.weights, &realized_returns(observations), cfg.missing_return);
            if blend.gaps > 0 {
                debug!("{}: {} held symbols without a return", date, blend.gaps);
            }
            data_gaps += blend.gaps;

            state.capital *= 1.0 + blend.portfolio_return;
            state.date = Some(date);

            daily_values.push(DailyValue {
                date,
                capital: state.capital,
                daily_return: state.capital / opening - 1.0,
                long_return: blend.long_return,
                short_return: blend.short_return,
                transaction_cost: cost_fraction,
                rebalanced,
            });

            if !(state.capital > 0.0) {
                warn!(
                    "{}: capital exhausted ({:.2}), stopping {}",
                    date, state.capital, cfg.strategy_id
                );
                ruined = true;
                break;
            }
        }

        if skipped > 0 {
            warn!("{} rebalances skipped for {}", skipped, cfg.strategy_id);
        }
        if data_gaps > 0 {
            warn!("{} held-symbol days had no return", data_gaps);
        }

        let metrics =
            PerformanceMetrics::from_daily_values(cfg.initial_capital, &daily_values, cfg.periods_per_year);
        let avg_turnover = if trades.is_empty() {
            0.0
        } else {
            trades.iter().map(|t| t.turnover).sum::<f64>() / trades.len() as f64
        };

        info!(
            "Finished {}: total return {:.2}%, Sharpe {:.2}, {} rebalances",
            cfg.strategy_id,
            metrics.total_return * 100.0,
            metrics.sharpe_ratio,
            trades.len()
        );

        Ok(SimulationResult {
            run_id: Uuid::new_v4(),
            strategy_id: cfg.strategy_id.clone(),
            config: cfg.clone(),
            start_date: daily_values.first().map(|d| d.date),
            end_date: daily_values.last().map(|d| d.date),
            initial_capital: cfg.initial_capital,
            final_capital: state.capital,
            rebalance_count: trades.len(),
            daily_values,
            trades,
            metrics,
            total_costs,
            avg_turnover,
            skipped_rebalances: skipped,
            data_gaps,
            ruined,
            started_at,
            finished_at: Utc::now(),
        })
    }
}

fn realized_returns(observations: &[Observation]) -> BTreeMap<&str, f64> {
    observations
        .iter()
        .filter_map(|o| o.ret.filter(|r| r.is_finite()).map(|r| (o.symbol.as_str(), r)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SelectionRule;
    use crate::store::MemoryStateStore;
    use chrono::Duration;

    fn day(n: i64) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + Duration::days(n)
    }

    fn config() -> FactorConfig {
        FactorConfig {
            strategy_id: "test".to_string(),
            min_universe: 3,
            rebalance_interval_days: 7,
            transaction_cost_bps: 0.0,
            initial_capital: 1_000.0,
            ..FactorConfig::default()
        }
    }

    /// A/B/C with fixed signals and constant daily returns.
    fn sections(days: i64, returns: [Option<f64>; 3]) -> CrossSections {
        let mut sections = CrossSections::new();
        for n in 0..days {
            for (i, (symbol, signal)) in [("A", 0.1), ("B", 0.5), ("C", 0.9)].iter().enumerate() {
                sections.insert(Observation::new(day(n), *symbol, Some(*signal), returns[i]));
            }
        }
        sections
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
    fn test_blend_day_long_short() {
        let w = weights(&[("A", 0.5), ("C", -0.5)]);
        let returns = BTreeMap::from([("A", 0.02), ("C", -0.01)]);
        let blend = blend_day(&w, &returns, MissingReturnPolicy::Zero);
        assert!((blend.long_return - 0.02).abs() < 1e-12);
        assert!((blend.short_return + 0.01).abs() < 1e-12);
        assert!((blend.portfolio_return - 0.015).abs() < 1e-12);
        assert_eq!(blend.gaps, 0);
    }

    #[test]
    fn test_blend_day_gap_policies() {
        let w = weights(&[("A", 0.25), ("B", 0.25), ("C", -0.5)]);
        let returns = BTreeMap::from([("A", 0.04), ("C", 0.0)]);

        let zero = blend_day(&w, &returns, MissingReturnPolicy::Zero);
        assert_eq!(zero.gaps, 1);
        assert!((zero.long_return - 0.02).abs() < 1e-12);
        assert!((zero.portfolio_return - 0.01).abs() < 1e-12);

        let exclude = blend_day(&w, &returns, MissingReturnPolicy::Exclude);
        assert_eq!(exclude.gaps, 1);
        assert!((exclude.long_return - 0.04).abs() < 1e-12);
        assert!((exclude.portfolio_return - 0.02).abs() < 1e-12);
    }

    #[test]
    fn test_blend_day_empty_weights() {
        let blend = blend_day(&WeightVector::new(), &BTreeMap::new(), MissingReturnPolicy::Zero);
        assert_eq!(blend, DayBlend::default());
    }

    #[test]
    fn test_spread_return_compounds() {
        let sim = PortfolioSimulator::new(config()).unwrap();
        let result = sim.run(&sections(3, [Some(0.01), Some(0.0), Some(-0.01)])).unwrap();

        // Long A (+1%) and short C (-1%) at 0.5 each: +1% per day.
        assert_eq!(result.daily_values.len(), 3);
        let expected = 1_000.0 * 1.01f64.powi(3);
        assert!((result.final_capital - expected).abs() < 1e-9);
        assert_eq!(result.rebalance_count, 1);
        assert!(!result.ruined);
        assert_eq!(result.capital_series().len(), 4);
    }

    #[test]
    fn test_transaction_cost_on_rebalance() {
        let cfg = FactorConfig {
            transaction_cost_bps: 10.0,
            ..config()
        };
        let sim = PortfolioSimulator::new(cfg).unwrap();
        let result = sim.run(&sections(1, [Some(0.0), Some(0.0), Some(0.0)])).unwrap();

        // First rebalance has turnover 1.0: 10 bps of 1000.
        assert!((result.total_costs - 1.0).abs() < 1e-9);
        assert!((result.final_capital - 999.0).abs() < 1e-9);
        assert!((result.daily_values[0].daily_return + 0.001).abs() < 1e-12);
        assert!(result.daily_values[0].rebalanced);
    }

    #[test]
    fn test_missing_returns_count_as_gaps() {
        let sim = PortfolioSimulator::new(config()).unwrap();
        let result = sim.run(&sections(4, [None, Some(0.0), Some(-0.02)])).unwrap();

        assert_eq!(result.data_gaps, 4);
        // Only the short leg earns: 0.5 * 2% per day.
        let expected = 1_000.0 * 1.01f64.powi(4);
        assert!((result.final_capital - expected).abs() < 1e-9);
    }

    #[test]
    fn test_skipped_rebalance_holds_flat() {
        let cfg = FactorConfig {
            min_universe: 5,
            ..config()
        };
        let sim = PortfolioSimulator::new(cfg).unwrap();
        let result = sim.run(&sections(3, [Some(0.01), Some(0.0), Some(-0.01)])).unwrap();

        assert_eq!(result.rebalance_count, 0);
        assert_eq!(result.skipped_rebalances, 3);
        assert_eq!(result.final_capital, 1_000.0);
    }

    #[test]
    fn test_ruin_stops_simulation() {
        let cfg = FactorConfig {
            long_allocation: 1.0,
            short_allocation: 1.0,
            ..config()
        };
        let sim = PortfolioSimulator::new(cfg).unwrap();
        // Long A loses everything and short C doubles: -100% - 100%.
        let result = sim.run(&sections(5, [Some(-1.0), Some(0.0), Some(1.0)])).unwrap();

        assert!(result.ruined);
        assert_eq!(result.daily_values.len(), 1);
    }

    #[test]
    fn test_rebalances_follow_interval() {
        let cfg = FactorConfig {
            selection: SelectionRule::Percentile {
                long: 40.0,
                short: 60.0,
            },
            ..config()
        };
        let sim = PortfolioSimulator::new(cfg).unwrap();
        let result = sim.run(&sections(15, [Some(0.0), Some(0.0), Some(0.0)])).unwrap();

        let dates: Vec<NaiveDate> = result.trades.iter().map(|t| t.rebalance_date).collect();
        assert_eq!(dates, vec![day(0), day(7), day(14)]);
        // Same book every time: only the first rebalance trades.
        assert_eq!(result.trades[1].turnover, 0.0);
    }

    #[test]
    fn test_resumed_session_starts_at_last_rebalance() {
        let store = MemoryStateStore::new();
        let sim = PortfolioSimulator::new(config()).unwrap();
        let data = sections(10, [Some(0.01), Some(0.0), Some(-0.01)]);

        let mut first = RebalanceScheduler::resume(&store, sim.config());
        first.force_rebalance();
        let initial = sim.run_with_scheduler(&data, &mut first).unwrap();
        first.persist(&store).unwrap();
        assert_eq!(initial.rebalance_count, 2);
        assert_eq!(first.last_rebalance_date(), Some(day(7)));

        // Same table again: days before the saved rebalance are not replayed
        // with weights that did not exist yet.
        let mut second = RebalanceScheduler::resume(&store, sim.config());
        let resumed = sim.run_with_scheduler(&data, &mut second).unwrap();
        second.persist(&store).unwrap();
        assert_eq!(resumed.start_date, Some(day(7)));
        assert_eq!(resumed.daily_values.len(), 3);
        assert_eq!(resumed.rebalance_count, 0);
        assert!(resumed
            .daily_values
            .iter()
            .all(|d| Some(d.date) >= second.last_rebalance_date()));

        let mut third = RebalanceScheduler::resume(&store, sim.config());
        let again = sim.run_with_scheduler(&data, &mut third).unwrap();
        assert_eq!(again.capital_series(), resumed.capital_series());
    }

    #[test]
    fn test_resumed_session_without_new_dates_is_error() {
        let store = MemoryStateStore::new();
        let sim = PortfolioSimulator::new(config()).unwrap();

        let mut first = RebalanceScheduler::resume(&store, sim.config());
        first.force_rebalance();
        sim.run_with_scheduler(&sections(10, [Some(0.0); 3]), &mut first).unwrap();
        first.persist(&store).unwrap();

        let mut second = RebalanceScheduler::resume(&store, sim.config());
        assert!(matches!(
            sim.run_with_scheduler(&sections(5, [Some(0.0); 3]), &mut second),
            Err(BacktestError::NoData)
        ));
    }

    #[test]
    fn test_empty_sections_is_error() {
        let sim = PortfolioSimulator::new(config()).unwrap();
        assert!(matches!(
            sim.run(&CrossSections::new()),
            Err(BacktestError::NoData)
        ));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let cfg = FactorConfig {
            lookback_window: 0,
            ..config()
        };
        assert!(matches!(
            PortfolioSimulator::new(cfg),
            Err(BacktestError::ConfigError(_))
        ));
    }
}

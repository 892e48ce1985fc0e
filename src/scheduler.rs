//! Rebalance scheduling.
//!
//! The scheduler decides, date by date, whether to recompute target weights
//! or carry forward the last ones. Its state can be persisted through a
//! [`StateStore`] so that a process invoked once per day resumes the same
//! schedule instead of rebalancing on every start.

use crate::config::{FactorConfig, TurnoverMode};
use crate::error::{BacktestError, Result};
use crate::ranker::CrossSectionalRanker;
use crate::store::StateStore;
use crate::types::{Observation, TradeRecord, WeightVector};
use crate::weights::{turnover, PositionWeighter};
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

/// Lifecycle phase of a scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerPhase {
    /// Never rebalanced.
    NoState,
    /// Carrying weights from the last rebalance.
    Holding,
    /// Recomputing weights.
    Rebalancing,
}

/// Durable part of a scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub strategy_id: String,
    pub last_rebalance_date: Option<NaiveDate>,
    pub next_rebalance_date: Option<NaiveDate>,
    pub current_weights: WeightVector,
    /// Most recent rebalances, oldest first.
    #[serde(default)]
    pub history: Vec<TradeRecord>,
}

impl SchedulerState {
    pub fn new(strategy_id: impl Into<String>) -> Self {
        Self {
            strategy_id: strategy_id.into(),
            last_rebalance_date: None,
            next_rebalance_date: None,
            current_weights: WeightVector::new(),
            history: Vec::new(),
        }
    }

    /// Consistency checks applied when a record is read back.
    pub fn check(&self, strategy_id: &str) -> Result<()> {
        let corrupt = |reason: String| BacktestError::CorruptState {
            strategy_id: strategy_id.to_string(),
            reason,
        };

        if self.strategy_id != strategy_id {
            return Err(corrupt(format!(
                "record belongs to '{}'",
                self.strategy_id
            )));
        }
        match (self.last_rebalance_date, self.next_rebalance_date) {
            (Some(last), Some(next)) if next <= last => {
                return Err(corrupt(format!(
                    "next rebalance {} is not after last rebalance {}",
                    next, last
                )));
            }
            (Some(_), None) | (None, Some(_)) => {
                return Err(corrupt("rebalance dates are half set".to_string()));
            }
            _ => {}
        }
        if self.current_weights.iter().any(|(_, w)| !w.is_finite()) {
            return Err(corrupt("non-finite weight".to_string()));
        }
        Ok(())
    }
}

/// Why a due rebalance did not happen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    InsufficientUniverse { eligible: usize, required: usize },
    NoCandidates,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::InsufficientUniverse { eligible, required } => {
                write!(f, "{} eligible of {} required", eligible, required)
            }
            SkipReason::NoCandidates => write!(f, "no long or short candidates"),
        }
    }
}

/// Result of presenting one date to the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Rebalanced(TradeRecord),
    Held,
    /// A rebalance was due but could not be performed; prior weights persist.
    Skipped(SkipReason),
}

/// State machine driving rebalances for one strategy.
#[derive(Debug, Clone)]
pub struct RebalanceScheduler {
    ranker: CrossSectionalRanker,
    weighter: PositionWeighter,
    interval_days: u32,
    history_limit: usize,
    turnover_mode: TurnoverMode,
    state: SchedulerState,
    phase: SchedulerPhase,
    force: bool,
}

impl RebalanceScheduler {
    /// Fresh scheduler in the NO_STATE phase.
    pub fn new(config: &FactorConfig) -> Self {
        Self {
            ranker: CrossSectionalRanker::from_config(config),
            weighter: PositionWeighter::from_config(config),
            interval_days: config.rebalance_interval_days,
            history_limit: config.history_limit,
            turnover_mode: config.turnover_mode,
            state: SchedulerState::new(config.strategy_id.clone()),
            phase: SchedulerPhase::NoState,
            force: false,
        }
    }

    /// Scheduler continuing from an existing state record.
    pub fn with_state(config: &FactorConfig, state: SchedulerState) -> Self {
        let mut scheduler = Self::new(config);
        if state.last_rebalance_date.is_some() {
            scheduler.phase = SchedulerPhase::Holding;
        }
        scheduler.state = state;
        scheduler
    }

    /// Resume from a store. Missing or unreadable state starts a fresh
    /// schedule; this never fails.
    pub fn resume(store: &dyn StateStore, config: &FactorConfig) -> Self {
        match store.load(&config.strategy_id) {
            Ok(Some(state)) => {
                info!(
                    "Resumed schedule for {}: next rebalance {:?}",
                    config.strategy_id, state.next_rebalance_date
                );
                Self::with_state(config, state)
            }
            Ok(None) => {
                debug!("No saved schedule for {}", config.strategy_id);
                Self::new(config)
            }
            Err(e) => {
                warn!("Discarding scheduler state: {}", e);
                Self::new(config)
            }
        }
    }

    /// Write the current state to a store.
    pub fn persist(&self, store: &dyn StateStore) -> Result<()> {
        store.save(&self.state)
    }

    pub fn phase(&self) -> SchedulerPhase {
        self.phase
    }

    pub fn state(&self) -> &SchedulerState {
        &self.state
    }

    pub fn strategy_id(&self) -> &str {
        &self.state.strategy_id
    }

    /// Weights from the most recent successful rebalance.
    pub fn current_weights(&self) -> &WeightVector {
        &self.state.current_weights
    }

    pub fn last_rebalance_date(&self) -> Option<NaiveDate> {
        self.state.last_rebalance_date
    }

    pub fn next_rebalance_date(&self) -> Option<NaiveDate> {
        self.state.next_rebalance_date
    }

    pub fn history(&self) -> &[TradeRecord] {
        &self.state.history
    }

    /// Rebalance on the next date presented, regardless of schedule.
    pub fn force_rebalance(&mut self) {
        self.force = true;
    }

    pub fn should_rebalance(&self, date: NaiveDate) -> bool {
        if self.force || self.phase == SchedulerPhase::NoState {
            return true;
        }
        match self.state.next_rebalance_date {
            Some(next) => date >= next,
            None => true,
        }
    }

    /// Present one date's cross-section.
    ///
    /// Recoverable ranking failures leave the weights and the schedule
    /// untouched, so the rebalance is retried on the next date.
    pub fn on_date(&mut self, date: NaiveDate, observations: &[Observation]) -> Result<StepOutcome> {
        if !self.should_rebalance(date) {
            return Ok(StepOutcome::Held);
        }

        let resting = self.phase;
        self.phase = SchedulerPhase::Rebalancing;

        let assignment = match self.ranker.rank(date, observations) {
            Ok(a) => a,
            Err(e) => {
                self.phase = resting;
                let reason = match e {
                    BacktestError::InsufficientUniverse {
                        eligible, required, ..
                    } => SkipReason::InsufficientUniverse { eligible, required },
                    BacktestError::NoCandidates { .. } => SkipReason::NoCandidates,
                    other => return Err(other),
                };
                warn!("{}: skipping rebalance for {} ({})", date, self.state.strategy_id, reason);
                return Ok(StepOutcome::Skipped(reason));
            }
        };

        let Some(next) = date.checked_add_signed(Duration::days(i64::from(self.interval_days))) else {
            self.phase = resting;
            return Err(BacktestError::ConfigError(format!(
                "rebalance interval of {} days from {} is outside the calendar",
                self.interval_days, date
            )));
        };

        let weights = self.weighter.weigh(&assignment);
        let turnover = turnover(self.turnover_mode, &self.state.current_weights, &weights);

        let record = TradeRecord {
            rebalance_date: date,
            long_symbols: weights.long_symbols(),
            short_symbols: weights.short_symbols(),
            long_threshold: assignment.long_threshold(),
            short_threshold: assignment.short_threshold(),
            eligible: assignment.eligible(),
            turnover,
        };

        self.state.current_weights = weights;
        self.state.last_rebalance_date = Some(date);
        self.state.next_rebalance_date = Some(next);
        self.state.history.push(record.clone());
        if self.state.history.len() > self.history_limit {
            let excess = self.state.history.len() - self.history_limit;
            self.state.history.drain(..excess);
        }
        self.force = false;
        self.phase = SchedulerPhase::Holding;

        info!(
            "{}: rebalanced {} ({} long, {} short, turnover {:.3})",
            date,
            self.state.strategy_id,
            record.long_symbols.len(),
            record.short_symbols.len(),
            record.turnover
        );
        Ok(StepOutcome::Rebalanced(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SelectionRule;
    use crate::store::MemoryStateStore;

    fn day(n: i64) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + Duration::days(n)
    }

    fn config() -> FactorConfig {
        FactorConfig {
            strategy_id: "low_vol".to_string(),
            min_universe: 3,
            rebalance_interval_days: 7,
            history_limit: 3,
            ..FactorConfig::default()
        }
    }

    /// Five symbols whose signal order rotates with the date.
    fn cross_section(date: NaiveDate, shift: usize) -> Vec<Observation> {
        (0..5)
            .map(|i| {
                let signal = ((i + shift) % 5) as f64;
                Observation::new(date, format!("S{}", i), Some(signal), Some(0.0))
            })
            .collect()
    }

    #[test]
    fn test_seven_day_cadence() {
        let mut scheduler = RebalanceScheduler::new(&config());
        scheduler.force_rebalance();

        let mut day0_weights = None;
        for n in 0..22 {
            let date = day(n);
            let due = scheduler.should_rebalance(date);
            assert_eq!(due, n % 7 == 0, "day {}", n);

            let outcome = scheduler.on_date(date, &cross_section(date, n as usize)).unwrap();
            if n == 0 {
                day0_weights = Some(scheduler.current_weights().clone());
            }
            if (1..7).contains(&n) {
                assert_eq!(outcome, StepOutcome::Held);
                assert_eq!(Some(scheduler.current_weights()), day0_weights.as_ref());
            }
        }
        assert_eq!(scheduler.last_rebalance_date(), Some(day(21)));
        assert_eq!(scheduler.next_rebalance_date(), Some(day(28)));
    }

    #[test]
    fn test_no_state_rebalances_immediately() {
        let scheduler = RebalanceScheduler::new(&config());
        assert_eq!(scheduler.phase(), SchedulerPhase::NoState);
        assert!(scheduler.should_rebalance(day(3)));
    }

    #[test]
    fn test_force_overrides_schedule() {
        let mut scheduler = RebalanceScheduler::new(&config());
        scheduler.on_date(day(0), &cross_section(day(0), 0)).unwrap();
        assert!(!scheduler.should_rebalance(day(2)));
        scheduler.force_rebalance();
        assert!(scheduler.should_rebalance(day(2)));
        scheduler.on_date(day(2), &cross_section(day(2), 1)).unwrap();
        assert!(!scheduler.should_rebalance(day(3)));
        assert_eq!(scheduler.next_rebalance_date(), Some(day(9)));
    }

    #[test]
    fn test_skip_keeps_weights_and_retries() {
        let mut scheduler = RebalanceScheduler::new(&config());
        scheduler.on_date(day(0), &cross_section(day(0), 0)).unwrap();
        let held = scheduler.current_weights().clone();

        let thin = cross_section(day(7), 0)[..2].to_vec();
        let outcome = scheduler.on_date(day(7), &thin).unwrap();
        assert_eq!(
            outcome,
            StepOutcome::Skipped(SkipReason::InsufficientUniverse {
                eligible: 2,
                required: 3
            })
        );
        assert_eq!(scheduler.current_weights(), &held);
        assert_eq!(scheduler.phase(), SchedulerPhase::Holding);
        assert!(scheduler.should_rebalance(day(8)));

        let outcome = scheduler.on_date(day(8), &cross_section(day(8), 2)).unwrap();
        assert!(matches!(outcome, StepOutcome::Rebalanced(_)));
        assert_eq!(scheduler.next_rebalance_date(), Some(day(15)));
    }

    #[test]
    fn test_trade_record_contents() {
        let mut scheduler = RebalanceScheduler::new(&config());
        let outcome = scheduler.on_date(day(0), &cross_section(day(0), 0)).unwrap();
        let StepOutcome::Rebalanced(record) = outcome else {
            panic!("expected a rebalance");
        };
        // Percentiles 0, 25, 50, 75, 100 with 20/80 thresholds.
        assert_eq!(record.long_symbols, vec!["S0"]);
        assert_eq!(record.short_symbols, vec!["S4"]);
        assert_eq!(record.eligible, 5);
        assert!((record.turnover - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut scheduler = RebalanceScheduler::new(&config());
        for n in 0..6 {
            scheduler.force_rebalance();
            scheduler.on_date(day(n), &cross_section(day(n), n as usize)).unwrap();
        }
        assert_eq!(scheduler.history().len(), 3);
        assert_eq!(scheduler.history()[0].rebalance_date, day(3));
    }

    #[test]
    fn test_resume_from_store() {
        let store = MemoryStateStore::new();
        let cfg = config();

        let mut first = RebalanceScheduler::resume(&store, &cfg);
        first.on_date(day(0), &cross_section(day(0), 0)).unwrap();
        first.persist(&store).unwrap();

        let second = RebalanceScheduler::resume(&store, &cfg);
        assert_eq!(second.phase(), SchedulerPhase::Holding);
        assert_eq!(second.current_weights(), first.current_weights());
        assert!(!second.should_rebalance(day(1)));
        assert!(second.should_rebalance(day(7)));
    }

    #[test]
    fn test_corrupt_state_resets() {
        let store = MemoryStateStore::new();
        store.put_raw("low_vol", "][");
        let scheduler = RebalanceScheduler::resume(&store, &config());
        assert_eq!(scheduler.phase(), SchedulerPhase::NoState);
        assert!(scheduler.current_weights().is_empty());
    }

    #[test]
    fn test_state_check() {
        let mut state = SchedulerState::new("x");
        assert!(state.check("x").is_ok());
        assert!(state.check("y").is_err());

        state.last_rebalance_date = Some(day(5));
        state.next_rebalance_date = Some(day(5));
        assert!(state.check("x").is_err());

        state.next_rebalance_date = None;
        assert!(state.check("x").is_err());
    }

    #[test]
    fn test_count_selection_from_config() {
        let cfg = FactorConfig {
            selection: SelectionRule::Count {
                top_n: 2,
                bottom_n: 2,
            },
            ..config()
        };
        let mut scheduler = RebalanceScheduler::new(&cfg);
        scheduler.on_date(day(0), &cross_section(day(0), 0)).unwrap();
        assert_eq!(scheduler.current_weights().long_symbols(), vec!["S0", "S1"]);
        assert_eq!(scheduler.current_weights().short_symbols(), vec!["S3", "S4"]);
    }

    #[test]
    fn test_interval_past_calendar_end_is_error() {
        let cfg = FactorConfig {
            rebalance_interval_days: u32::MAX,
            ..config()
        };
        let mut scheduler = RebalanceScheduler::new(&cfg);
        let result = scheduler.on_date(day(0), &cross_section(day(0), 0));
        assert!(matches!(result, Err(BacktestError::ConfigError(_))));

        // Nothing is committed when the next date cannot be scheduled
        assert_eq!(scheduler.phase(), SchedulerPhase::NoState);
        assert!(scheduler.current_weights().is_empty());
        assert_eq!(scheduler.last_rebalance_date(), None);
        assert_eq!(scheduler.next_rebalance_date(), None);
    }
}

//! factorlab - a cross-sectional long/short factor backtesting engine.
//!
//! # Overview
//!
//! factorlab turns a per-asset signal into a market-neutral portfolio and
//! measures how it would have performed:
//!
//! - **Signals**: rolling statistics (volatility, z-score, kurtosis,
//!   Durbin-Watson, momentum, beta and more), shifted one period so a date's
//!   signal only sees earlier data
//! - **Ranking**: percentile or fixed-count selection of long and short legs
//!   with liquidity, market-cap and universe-size gates
//! - **Weighting**: equal weight or risk parity (inverse trailing volatility)
//! - **Scheduling**: periodic rebalances with a persistable schedule so a
//!   daily process resumes where it left off
//! - **Simulation**: compounded capital with turnover-proportional costs and
//!   explicit handling of missing returns
//! - **Analytics**: total and annualized return, volatility, Sharpe,
//!   Sortino, drawdown, Calmar, win rate
//! - **Sweeps**: independent backtests in parallel on a rayon pool
//!
//! # Quick Start
//!
//! ```no_run
//! use factorlab::{
//!     config::FactorConfig,
//!     data::{load_panel, DataConfig},
//!     simulator::PortfolioSimulator,
//! };
//!
//! let panel = load_panel("data/prices.csv", &DataConfig::default()).unwrap();
//!
//! let config = FactorConfig {
//!     strategy_id: "low_vol".to_string(),
//!     rebalance_interval_days: 14,
//!     ..Default::default()
//! };
//!
//! let result = PortfolioSimulator::new(config).unwrap().run_panel(&panel).unwrap();
//! println!("Return: {:.2}%", result.metrics.total_return * 100.0);
//! println!("Sharpe: {:.2}", result.metrics.sharpe_ratio);
//! ```
//!
//! # Custom Signals
//!
//! Implement [`features::SignalFunction`] and wrap it in a
//! [`features::RollingFeature`], which applies the coverage gate and the
//! one-period shift:
//!
//! ```
//! use factorlab::features::{RollingFeature, SignalFunction};
//!
//! struct Range;
//!
//! impl SignalFunction for Range {
//!     fn name(&self) -> &str {
//!         "range"
//!     }
//!
//!     fn compute_signal(&self, window: &[f64]) -> Option<f64> {
//!         let hi = window.iter().copied().fold(f64::NEG_INFINITY, f64::max);
//!         let lo = window.iter().copied().fold(f64::INFINITY, f64::min);
//!         Some(hi - lo)
//!     }
//! }
//!
//! let feature = RollingFeature::new(Box::new(Range), 3, 1.0);
//! let values = vec![Some(1.0), Some(4.0), Some(2.0), Some(8.0)];
//! let signal = feature.apply(&values);
//! assert_eq!(signal[3], Some(3.0));
//! ```
//!
//! # Modules
//!
//! - [`types`]: Observation, Bucket, WeightVector, TradeRecord, DailyValue
//! - [`data`]: Long-format CSV loading into a per-symbol panel
//! - [`features`]: Signal functions, rolling windows, cross-sections
//! - [`ranker`]: Cross-sectional ranking and bucket assignment
//! - [`weights`]: Leg weighting and turnover
//! - [`scheduler`]: Rebalance state machine
//! - [`store`]: Scheduler state persistence (memory, JSON files, SQLite)
//! - [`simulator`]: Day-by-day portfolio simulation
//! - [`analytics`]: Performance metrics and reporting
//! - [`sweep`]: Parallel independent backtests
//! - [`export`]: CSV and JSON output
//! - [`config`]: Engine configuration and TOML files

pub mod analytics;
pub mod config;
pub mod data;
pub mod error;
pub mod export;
pub mod features;
pub mod ranker;
pub mod scheduler;
pub mod simulator;
pub mod store;
pub mod sweep;
pub mod types;
pub mod weights;

// Re-exports for convenience
pub use analytics::{PerformanceMetrics, ResultFormatter, TradeReport};
pub use config::{
    FactorConfig, FactorFileConfig, MissingReturnPolicy, SelectionRule, SignalDirection,
    TurnoverMode, WeightingMethod,
};
pub use data::{load_panel, DataConfig, Panel};
pub use error::{BacktestError, Result};
pub use features::{build_observations, CrossSections, RollingFeature, SignalFunction, SignalKind};
pub use ranker::{BucketAssignment, CrossSectionalRanker};
pub use scheduler::{RebalanceScheduler, SchedulerPhase, SchedulerState, StepOutcome};
pub use simulator::{PortfolioSimulator, PortfolioState, SimulationResult};
pub use store::{JsonFileStateStore, MemoryStateStore, SqliteStateStore, StateStore};
pub use sweep::{interval_grid, run_sweep, SweepEntry};
pub use types::{Bucket, DailyValue, Observation, TradeRecord, WeightVector};
pub use weights::PositionWeighter;

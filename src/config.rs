//! Engine configuration and TOML configuration file support.
//!
//! [`FactorConfig`] is the validated, in-memory configuration consumed by the
//! engine. [`FactorFileConfig`] mirrors it as a sectioned TOML document so a
//! backtest can be reproduced from a file.

use crate::data::DataConfig;
use crate::error::{BacktestError, Result};
use crate::features::SignalKind;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::info;

/// Longest accepted rebalance interval (about ten years).
pub const MAX_REBALANCE_INTERVAL_DAYS: u32 = 3660;

/// Per-leg weighting scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WeightingMethod {
    #[default]
    EqualWeight,
    /// Inverse trailing volatility.
    RiskParity,
}

/// Which end of the signal distribution is bought.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SignalDirection {
    /// Long the lowest signals, short the highest (e.g. low volatility).
    #[default]
    LongLow,
    /// Long the highest signals, short the lowest (e.g. momentum).
    LongHigh,
}

/// How the long and short legs are sized.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "rule")]
pub enum SelectionRule {
    /// Percentile thresholds on a 0-100 scale.
    ///
    /// With [`SignalDirection::LongLow`] a symbol is long at or below `long`
    /// and short at or above `short`; with `LongHigh` the comparisons flip.
    Percentile { long: f64, short: f64 },
    /// Fixed number of names on each side.
    Count { top_n: usize, bottom_n: usize },
}

impl Default for SelectionRule {
    fn default() -> Self {
        SelectionRule::Percentile {
            long: 20.0,
            short: 80.0,
        }
    }
}

/// How rebalance turnover is measured for cost purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TurnoverMode {
    /// Symbols entering plus leaving each leg over the new leg size,
    /// weighted by the leg allocation.
    #[default]
    PositionCount,
    /// Sum of absolute weight changes.
    Notional,
}

/// Treatment of a held symbol with no return on a given day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MissingReturnPolicy {
    /// The symbol contributes zero; the leg keeps its full weight base.
    #[default]
    Zero,
    /// The leg is renormalized over symbols that do have a return.
    Exclude,
}

/// Validated configuration for one factor backtest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorConfig {
    /// Identifier used to key persisted scheduler state.
    pub strategy_id: String,
    /// Panel column holding per-row realized returns.
    pub return_column: String,
    /// Panel column fed to the rolling signal function.
    pub signal_column: String,
    pub signal: SignalKind,
    pub lookback_window: usize,
    /// Fraction of the lookback window that must hold finite values.
    pub min_coverage: f64,
    /// Market symbol for beta; `None` uses the equal-weight universe return.
    pub market_symbol: Option<String>,
    /// Annualize volatility signals by `sqrt(periods_per_year)`.
    pub annualize_signal: bool,
    pub rebalance_interval_days: u32,
    pub selection: SelectionRule,
    pub direction: SignalDirection,
    pub weighting_method: WeightingMethod,
    pub volatility_window: usize,
    /// Floor applied to annualized volatility in risk-parity weighting.
    pub min_volatility: f64,
    pub long_allocation: f64,
    pub short_allocation: f64,
    pub initial_capital: f64,
    pub transaction_cost_bps: f64,
    pub turnover_mode: TurnoverMode,
    pub missing_return: MissingReturnPolicy,
    pub liquidity_column: Option<String>,
    pub market_cap_column: Option<String>,
    pub min_liquidity: Option<f64>,
    pub min_market_cap: Option<f64>,
    /// Minimum eligible symbols required to rebalance.
    pub min_universe: usize,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    /// Rebalance records kept in persisted scheduler state.
    pub history_limit: usize,
    pub periods_per_year: f64,
}

impl Default for FactorConfig {
    fn default() -> Self {
        Self {
            strategy_id: "factor".to_string(),
            return_column: "return".to_string(),
            signal_column: "return".to_string(),
            signal: SignalKind::Volatility,
            lookback_window: 30,
            min_coverage: 0.7,
            market_symbol: None,
            annualize_signal: false,
            rebalance_interval_days: 7,
            selection: SelectionRule::default(),
            direction: SignalDirection::LongLow,
            weighting_method: WeightingMethod::EqualWeight,
            volatility_window: 60,
            min_volatility: 0.01,
            long_allocation: 0.5,
            short_allocation: 0.5,
            initial_capital: 100_000.0,
            transaction_cost_bps: 10.0,
            turnover_mode: TurnoverMode::PositionCount,
            missing_return: MissingReturnPolicy::Zero,
            liquidity_column: None,
            market_cap_column: None,
            min_liquidity: None,
            min_market_cap: None,
            min_universe: 10,
            start_date: None,
            end_date: None,
            history_limit: 52,
            periods_per_year: 252.0,
        }
    }
}

impl FactorConfig {
    /// Reject contradictory or out-of-range parameters.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(BacktestError::ConfigError(msg));

        if self.strategy_id.trim().is_empty() {
            return fail("strategy_id must not be empty".into());
        }
        if self.lookback_window == 0 {
            return fail("lookback_window must be positive".into());
        }
        if !(self.min_coverage > 0.0 && self.min_coverage <= 1.0) {
            return fail(format!(
                "min_coverage must be in (0, 1], got {}",
                self.min_coverage
            ));
        }
        if self.rebalance_interval_days == 0 {
            return fail("rebalance_interval_days must be positive".into());
        }
        if self.rebalance_interval_days > MAX_REBALANCE_INTERVAL_DAYS {
            return fail(format!(
                "rebalance_interval_days must be at most {}, got {}",
                MAX_REBALANCE_INTERVAL_DAYS, self.rebalance_interval_days
            ));
        }
        match self.selection {
            SelectionRule::Percentile { long, short } => {
                for (name, p) in [("long_percentile", long), ("short_percentile", short)] {
                    if !(0.0..=100.0).contains(&p) {
                        return fail(format!("{} must be in [0, 100], got {}", name, p));
                    }
                }
                let inverted = match self.direction {
                    SignalDirection::LongLow => long >= short,
                    SignalDirection::LongHigh => long <= short,
                };
                if inverted {
                    return fail(format!(
                        "percentile thresholds long={} short={} overlap for direction {:?}",
                        long, short, self.direction
                    ));
                }
            }
            SelectionRule::Count { top_n, bottom_n } => {
                if top_n == 0 || bottom_n == 0 {
                    return fail("top_n and bottom_n must be positive".into());
                }
            }
        }
        if self.long_allocation < 0.0 || self.short_allocation < 0.0 {
            return fail("allocations must be non-negative".into());
        }
        if self.long_allocation + self.short_allocation <= 0.0 {
            return fail("long_allocation + short_allocation must be positive".into());
        }
        if !(self.initial_capital > 0.0 && self.initial_capital.is_finite()) {
            return fail(format!(
                "initial_capital must be positive, got {}",
                self.initial_capital
            ));
        }
        if self.transaction_cost_bps < 0.0 {
            return fail("transaction_cost_bps must be non-negative".into());
        }
        if self.weighting_method == WeightingMethod::RiskParity && self.volatility_window < 2 {
            return fail("volatility_window must be at least 2 for risk parity".into());
        }
        if self.min_volatility <= 0.0 {
            return fail("min_volatility must be positive".into());
        }
        if self.min_universe < 2 {
            return fail("min_universe must be at least 2".into());
        }
        if self.history_limit == 0 {
            return fail("history_limit must be positive".into());
        }
        if self.periods_per_year <= 0.0 {
            return fail("periods_per_year must be positive".into());
        }
        if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
            if start > end {
                return fail(format!("start_date {} is after end_date {}", start, end));
            }
        }
        Ok(())
    }

    /// Whether a date falls inside the configured backtest window.
    pub fn in_window(&self, date: NaiveDate) -> bool {
        self.start_date.map_or(true, |s| date >= s) && self.end_date.map_or(true, |e| date <= e)
    }

    /// Total deployed notional across both legs.
    pub fn gross_allocation(&self) -> f64 {
        self.long_allocation + self.short_allocation
    }
}

/// Complete backtest configuration loaded from a file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FactorFileConfig {
    #[serde(default)]
    pub backtest: BacktestSettings,
    #[serde(default)]
    pub data: DataSettings,
    #[serde(default)]
    pub signal: SignalSettings,
    #[serde(default)]
    pub selection: SelectionSettings,
    #[serde(default)]
    pub weighting: WeightingSettings,
    #[serde(default)]
    pub costs: CostSettings,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
}

/// General backtest settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestSettings {
    #[serde(default = "default_strategy_id")]
    pub strategy_id: String,
    #[serde(default = "default_capital")]
    pub initial_capital: f64,
    /// Start date (YYYY-MM-DD format).
    #[serde(default)]
    pub start_date: Option<String>,
    /// End date (YYYY-MM-DD format).
    #[serde(default)]
    pub end_date: Option<String>,
    #[serde(default = "default_periods_per_year")]
    pub periods_per_year: f64,
}

fn default_strategy_id() -> String { "factor".to_string() }
fn default_capital() -> f64 { 100_000.0 }
fn default_periods_per_year() -> f64 { 252.0 }

impl Default for BacktestSettings {
    fn default() -> Self {
        Self {
            strategy_id: default_strategy_id(),
            initial_capital: default_capital(),
            start_date: None,
            end_date: None,
            periods_per_year: default_periods_per_year(),
        }
    }
}

/// Input table settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSettings {
    /// Path to the long-format CSV file.
    pub path: Option<String>,
    /// Date format in CSV.
    pub date_format: Option<String>,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    #[serde(default = "default_return_column")]
    pub return_column: String,
    #[serde(default = "default_close_column")]
    pub close_column: String,
    pub liquidity_column: Option<String>,
    pub market_cap_column: Option<String>,
}

fn default_delimiter() -> char { ',' }
fn default_return_column() -> String { "return".to_string() }
fn default_close_column() -> String { "close".to_string() }

impl Default for DataSettings {
    fn default() -> Self {
        Self {
            path: None,
            date_format: None,
            delimiter: default_delimiter(),
            return_column: default_return_column(),
            close_column: default_close_column(),
            liquidity_column: None,
            market_cap_column: None,
        }
    }
}

/// Rolling signal settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalSettings {
    #[serde(default = "default_signal_kind")]
    pub kind: SignalKind,
    /// Input column; defaults to the return column.
    pub column: Option<String>,
    #[serde(default = "default_lookback")]
    pub lookback_window: usize,
    #[serde(default = "default_min_coverage")]
    pub min_coverage: f64,
    pub market_symbol: Option<String>,
    #[serde(default)]
    pub annualize: bool,
}

fn default_signal_kind() -> SignalKind { SignalKind::Volatility }
fn default_lookback() -> usize { 30 }
fn default_min_coverage() -> f64 { 0.7 }

impl Default for SignalSettings {
    fn default() -> Self {
        Self {
            kind: default_signal_kind(),
            column: None,
            lookback_window: default_lookback(),
            min_coverage: default_min_coverage(),
            market_symbol: None,
            annualize: false,
        }
    }
}

/// Cross-sectional selection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionSettings {
    #[serde(default)]
    pub direction: SignalDirection,
    #[serde(default = "default_long_percentile")]
    pub long_percentile: f64,
    #[serde(default = "default_short_percentile")]
    pub short_percentile: f64,
    /// When both counts are set they take precedence over percentiles.
    pub top_n: Option<usize>,
    pub bottom_n: Option<usize>,
    #[serde(default = "default_min_universe")]
    pub min_universe: usize,
    pub min_liquidity: Option<f64>,
    pub min_market_cap: Option<f64>,
}

fn default_long_percentile() -> f64 { 20.0 }
fn default_short_percentile() -> f64 { 80.0 }
fn default_min_universe() -> usize { 10 }

impl Default for SelectionSettings {
    fn default() -> Self {
        Self {
            direction: SignalDirection::default(),
            long_percentile: default_long_percentile(),
            short_percentile: default_short_percentile(),
            top_n: None,
            bottom_n: None,
            min_universe: default_min_universe(),
            min_liquidity: None,
            min_market_cap: None,
        }
    }
}

/// Position weighting settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightingSettings {
    #[serde(default)]
    pub method: WeightingMethod,
    #[serde(default = "default_allocation")]
    pub long_allocation: f64,
    #[serde(default = "default_allocation")]
    pub short_allocation: f64,
    #[serde(default = "default_volatility_window")]
    pub volatility_window: usize,
    #[serde(default = "default_min_volatility")]
    pub min_volatility: f64,
}

fn default_allocation() -> f64 { 0.5 }
fn default_volatility_window() -> usize { 60 }
fn default_min_volatility() -> f64 { 0.01 }

impl Default for WeightingSettings {
    fn default() -> Self {
        Self {
            method: WeightingMethod::default(),
            long_allocation: default_allocation(),
            short_allocation: default_allocation(),
            volatility_window: default_volatility_window(),
            min_volatility: default_min_volatility(),
        }
    }
}

/// Cost model settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostSettings {
    #[serde(default = "default_cost_bps")]
    pub transaction_cost_bps: f64,
    #[serde(default)]
    pub turnover_mode: TurnoverMode,
    #[serde(default)]
    pub missing_return: MissingReturnPolicy,
}

fn default_cost_bps() -> f64 { 10.0 }

impl Default for CostSettings {
    fn default() -> Self {
        Self {
            transaction_cost_bps: default_cost_bps(),
            turnover_mode: TurnoverMode::default(),
            missing_return: MissingReturnPolicy::default(),
        }
    }
}

/// Rebalance scheduling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    #[serde(default = "default_interval")]
    pub rebalance_interval_days: u32,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_interval() -> u32 { 7 }
fn default_history_limit() -> usize { 52 }

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            rebalance_interval_days: default_interval(),
            history_limit: default_history_limit(),
        }
    }
}

fn parse_date(field: &str, value: &Option<String>) -> Result<Option<NaiveDate>> {
    value
        .as_deref()
        .map(|s| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| {
                BacktestError::ConfigError(format!("{} '{}' is not YYYY-MM-DD: {}", field, s, e))
            })
        })
        .transpose()
}

impl FactorFileConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        let content = fs::read_to_string(path)?;
        let config: FactorFileConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| BacktestError::ConfigError(e.to_string()))?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Convert to a validated [`FactorConfig`].
    pub fn to_factor_config(&self) -> Result<FactorConfig> {
        let selection = match (self.selection.top_n, self.selection.bottom_n) {
            (Some(top_n), Some(bottom_n)) => SelectionRule::Count { top_n, bottom_n },
            (None, None) => SelectionRule::Percentile {
                long: self.selection.long_percentile,
                short: self.selection.short_percentile,
            },
            _ => {
                return Err(BacktestError::ConfigError(
                    "top_n and bottom_n must be given together".into(),
                ))
            }
        };

        let config = FactorConfig {
            strategy_id: self.backtest.strategy_id.clone(),
            return_column: self.data.return_column.clone(),
            signal_column: self
                .signal
                .column
                .clone()
                .unwrap_or_else(|| self.data.return_column.clone()),
            signal: self.signal.kind,
            lookback_window: self.signal.lookback_window,
            min_coverage: self.signal.min_coverage,
            market_symbol: self.signal.market_symbol.clone(),
            annualize_signal: self.signal.annualize,
            rebalance_interval_days: self.scheduler.rebalance_interval_days,
            selection,
            direction: self.selection.direction,
            weighting_method: self.weighting.method,
            volatility_window: self.weighting.volatility_window,
            min_volatility: self.weighting.min_volatility,
            long_allocation: self.weighting.long_allocation,
            short_allocation: self.weighting.short_allocation,
            initial_capital: self.backtest.initial_capital,
            transaction_cost_bps: self.costs.transaction_cost_bps,
            turnover_mode: self.costs.turnover_mode,
            missing_return: self.costs.missing_return,
            liquidity_column: self.data.liquidity_column.clone(),
            market_cap_column: self.data.market_cap_column.clone(),
            min_liquidity: self.selection.min_liquidity,
            min_market_cap: self.selection.min_market_cap,
            min_universe: self.selection.min_universe,
            start_date: parse_date("start_date", &self.backtest.start_date)?,
            end_date: parse_date("end_date", &self.backtest.end_date)?,
            history_limit: self.scheduler.history_limit,
            periods_per_year: self.backtest.periods_per_year,
        };

        config.validate()?;
        Ok(config)
    }

    /// Loader settings for the input table.
    pub fn to_data_config(&self) -> DataConfig {
        DataConfig {
            date_format: self.data.date_format.clone(),
            delimiter: self.data.delimiter as u8,
            return_column: self.data.return_column.clone(),
            close_column: self.data.close_column.clone(),
            ..Default::default()
        }
    }

    /// Generate an example configuration file content.
    pub fn example() -> String {
        r#"# factorlab configuration file
# One cross-sectional long/short factor backtest

[backtest]
strategy_id = "low-vol-weekly"
initial_capital = 100000.0
periods_per_year = 252.0
# start_date = "2023-01-01"
# end_date = "2023-12-31"

[data]
path = "data/universe.csv"
return_column = "return"
close_column = "close"
liquidity_column = "volume"
# market_cap_column = "market_cap"

[signal]
kind = "volatility"      # raw, mean, volatility, z_score, kurtosis, durbin_watson,
                         # momentum, breakout, dilution_velocity, beta
lookback_window = 30
min_coverage = 0.7
# column = "return"
# market_symbol = "BTC"

[selection]
direction = "long_low"   # long_low or long_high
long_percentile = 20.0
short_percentile = 80.0
# top_n = 5
# bottom_n = 5
min_universe = 10
# min_liquidity = 1000000.0

[weighting]
method = "equal_weight"  # equal_weight or risk_parity
long_allocation = 0.5
short_allocation = 0.5
volatility_window = 60
min_volatility = 0.01

[costs]
transaction_cost_bps = 10.0
turnover_mode = "position_count"  # position_count or notional
missing_return = "zero"           # zero or exclude

[scheduler]
rebalance_interval_days = 7
history_limit = 52
"#
        .to_string()
    }
}

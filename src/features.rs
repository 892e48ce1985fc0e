//! Rolling signal features with strict no-lookahead alignment.
//!
//! Every factor is a [`SignalFunction`] evaluated over a trailing window of a
//! symbol's own rows. [`RollingFeature`] computes the raw rolling aggregate
//! and then shifts it by one row, so the value attributed to row `t` is built
//! only from rows strictly before `t`.
//!
//! # Example
//!
//! ```
//! use factorlab::features::{RollingFeature, Volatility};
//!
//! let returns = vec![Some(0.01), Some(-0.02), Some(0.015), Some(0.0), Some(0.03)];
//! let feature = RollingFeature::new(Box::new(Volatility::daily()), 3, 1.0);
//! let vol = feature.apply(&returns);
//!
//! // Row 3 sees rows 0..3 only.
//! assert!(vol[2].is_none());
//! assert!(vol[3].is_some());
//! ```

use crate::config::FactorConfig;
use crate::data::Panel;
use crate::error::{BacktestError, Result};
use crate::types::Observation;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Built-in signal kinds selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    /// Precomputed column, lagged one row like every other signal.
    Raw,
    Mean,
    Volatility,
    ZScore,
    Kurtosis,
    DurbinWatson,
    Momentum,
    Breakout,
    DilutionVelocity,
    Beta,
}

impl SignalKind {
    pub fn all() -> &'static [SignalKind] {
        &[
            SignalKind::Raw,
            SignalKind::Mean,
            SignalKind::Volatility,
            SignalKind::ZScore,
            SignalKind::Kurtosis,
            SignalKind::DurbinWatson,
            SignalKind::Momentum,
            SignalKind::Breakout,
            SignalKind::DilutionVelocity,
            SignalKind::Beta,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            SignalKind::Raw => "raw",
            SignalKind::Mean => "mean",
            SignalKind::Volatility => "volatility",
            SignalKind::ZScore => "z_score",
            SignalKind::Kurtosis => "kurtosis",
            SignalKind::DurbinWatson => "durbin_watson",
            SignalKind::Momentum => "momentum",
            SignalKind::Breakout => "breakout",
            SignalKind::DilutionVelocity => "dilution_velocity",
            SignalKind::Beta => "beta",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            SignalKind::Raw => "Precomputed signal column, lagged one period",
            SignalKind::Mean => "Trailing mean (e.g. average funding/carry)",
            SignalKind::Volatility => "Trailing sample standard deviation of returns",
            SignalKind::ZScore => "Latest value relative to its trailing mean and deviation",
            SignalKind::Kurtosis => "Trailing excess kurtosis of returns",
            SignalKind::DurbinWatson => "Durbin-Watson autocorrelation statistic, valid in [0, 4.5]",
            SignalKind::Momentum => "Compounded trailing return",
            SignalKind::Breakout => "Position of the latest value inside the trailing range",
            SignalKind::DilutionVelocity => "Log growth per period of circulating supply",
            SignalKind::Beta => "Trailing beta against a market return series",
        }
    }

    /// Single-series window function for this kind.
    ///
    /// `Raw` and `Beta` are not single-series window statistics and return `None`.
    pub fn function(&self, annualization: f64) -> Option<Box<dyn SignalFunction>> {
        match self {
            SignalKind::Raw | SignalKind::Beta => None,
            SignalKind::Mean => Some(Box::new(Mean)),
            SignalKind::Volatility => Some(Box::new(Volatility::annualized(annualization))),
            SignalKind::ZScore => Some(Box::new(ZScore)),
            SignalKind::Kurtosis => Some(Box::new(Kurtosis)),
            SignalKind::DurbinWatson => Some(Box::new(DurbinWatson)),
            SignalKind::Momentum => Some(Box::new(Momentum)),
            SignalKind::Breakout => Some(Box::new(Breakout)),
            SignalKind::DilutionVelocity => Some(Box::new(DilutionVelocity)),
        }
    }
}

/// A factor statistic computed over one trailing window.
///
/// The window holds only finite values, oldest first. Returning `None` (or a
/// non-finite value, or a value outside [`SignalFunction::valid_range`]) marks
/// the signal invalid for that row.
pub trait SignalFunction: Send + Sync {
    fn name(&self) -> &str;

    fn compute_signal(&self, window: &[f64]) -> Option<f64>;

    /// Fewest finite values the statistic is defined on.
    fn min_observations(&self) -> usize {
        2
    }

    /// Inclusive sanity range; values outside it are invalid.
    fn valid_range(&self) -> Option<(f64, f64)> {
        None
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation (n - 1 denominator).
fn sample_std(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values);
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    Some(variance.sqrt())
}

/// Trailing arithmetic mean.
pub struct Mean;

impl SignalFunction for Mean {
    fn name(&self) -> &str {
        "mean"
    }

    fn compute_signal(&self, window: &[f64]) -> Option<f64> {
        if window.is_empty() {
            return None;
        }
        Some(mean(window))
    }

    fn min_observations(&self) -> usize {
        1
    }
}

/// Trailing sample standard deviation, scaled by `sqrt(annualization)`.
pub struct Volatility {
    annualization: f64,
}

impl Volatility {
    /// Unscaled per-period volatility.
    pub fn daily() -> Self {
        Self { annualization: 1.0 }
    }

    pub fn annualized(periods_per_year: f64) -> Self {
        Self {
            annualization: periods_per_year,
        }
    }
}

impl SignalFunction for Volatility {
    fn name(&self) -> &str {
        "volatility"
    }

    fn compute_signal(&self, window: &[f64]) -> Option<f64> {
        sample_std(window).map(|s| s * self.annualization.sqrt())
    }
}

/// Latest value standardized against its window.
pub struct ZScore;

impl SignalFunction for ZScore {
    fn name(&self) -> &str {
        "z_score"
    }

    fn compute_signal(&self, window: &[f64]) -> Option<f64> {
        let std = sample_std(window)?;
        if !(std > 0.0 && std.is_finite()) {
            return None;
        }
        let last = *window.last()?;
        Some((last - mean(window)) / std)
    }

    fn min_observations(&self) -> usize {
        3
    }
}

/// Bias-corrected sample excess kurtosis.
pub struct Kurtosis;

impl SignalFunction for Kurtosis {
    fn name(&self) -> &str {
        "kurtosis"
    }

    fn compute_signal(&self, window: &[f64]) -> Option<f64> {
        let n = window.len() as f64;
        if window.len() < 4 {
            return None;
        }
        let m = mean(window);
        let m2: f64 = window.iter().map(|v| (v - m).powi(2)).sum();
        let m4: f64 = window.iter().map(|v| (v - m).powi(4)).sum();
        if m2 <= 0.0 {
            return None;
        }
        let adj = (n + 1.0) * n * (n - 1.0) / ((n - 2.0) * (n - 3.0));
        let correction = 3.0 * (n - 1.0).powi(2) / ((n - 2.0) * (n - 3.0));
        Some(adj * m4 / (m2 * m2) - correction)
    }

    fn min_observations(&self) -> usize {
        4
    }
}

/// Durbin-Watson statistic of demeaned values.
///
/// Near 2 for uncorrelated series, towards 0 for trending and towards 4 for
/// mean-reverting ones.
pub struct DurbinWatson;

impl SignalFunction for DurbinWatson {
    fn name(&self) -> &str {
        "durbin_watson"
    }

    fn compute_signal(&self, window: &[f64]) -> Option<f64> {
        let m = mean(window);
        let residuals: Vec<f64> = window.iter().map(|v| v - m).collect();
        let denominator: f64 = residuals.iter().map(|e| e * e).sum();
        if !(denominator > 0.0 && denominator.is_finite()) {
            return None;
        }
        let numerator: f64 = residuals.windows(2).map(|w| (w[1] - w[0]).powi(2)).sum();
        Some(numerator / denominator)
    }

    fn min_observations(&self) -> usize {
        3
    }

    fn valid_range(&self) -> Option<(f64, f64)> {
        Some((0.0, 4.5))
    }
}

/// Compounded return over the window.
pub struct Momentum;

impl SignalFunction for Momentum {
    fn name(&self) -> &str {
        "momentum"
    }

    fn compute_signal(&self, window: &[f64]) -> Option<f64> {
        if window.is_empty() {
            return None;
        }
        Some(window.iter().fold(1.0, |acc, r| acc * (1.0 + r)) - 1.0)
    }

    fn min_observations(&self) -> usize {
        1
    }
}

/// Where the latest value sits in the window's range: 0 at the low, 1 at the high.
pub struct Breakout;

impl SignalFunction for Breakout {
    fn name(&self) -> &str {
        "breakout"
    }

    fn compute_signal(&self, window: &[f64]) -> Option<f64> {
        let last = *window.last()?;
        let low = window.iter().copied().fold(f64::INFINITY, f64::min);
        let high = window.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let range = high - low;
        if range <= 0.0 {
            return None;
        }
        Some((last - low) / range)
    }

    fn valid_range(&self) -> Option<(f64, f64)> {
        Some((0.0, 1.0))
    }
}

/// Average log growth per period of a supply series.
pub struct DilutionVelocity;

impl SignalFunction for DilutionVelocity {
    fn name(&self) -> &str {
        "dilution_velocity"
    }

    fn compute_signal(&self, window: &[f64]) -> Option<f64> {
        let first = *window.first()?;
        let last = *window.last()?;
        if first <= 0.0 || last <= 0.0 || window.len() < 2 {
            return None;
        }
        Some((last.ln() - first.ln()) / (window.len() - 1) as f64)
    }
}

/// Shift a series forward by `periods` rows, filling the head with `None`.
pub fn shift<T: Clone>(values: &[Option<T>], periods: usize) -> Vec<Option<T>> {
    let len = values.len();
    let mut out = vec![None; len];
    if periods < len {
        out[periods..].clone_from_slice(&values[..len - periods]);
    }
    out
}

/// A [`SignalFunction`] applied over a trailing window with a coverage gate.
pub struct RollingFeature {
    function: Box<dyn SignalFunction>,
    window: usize,
    min_coverage: f64,
}

impl RollingFeature {
    pub fn new(function: Box<dyn SignalFunction>, window: usize, min_coverage: f64) -> Self {
        Self {
            function,
            window: window.max(1),
            min_coverage,
        }
    }

    pub fn name(&self) -> &str {
        self.function.name()
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Finite values a window must hold before the statistic is defined.
    pub fn required_observations(&self) -> usize {
        let coverage = (self.window as f64 * self.min_coverage).ceil() as usize;
        coverage.max(self.function.min_observations()).max(1)
    }

    /// Evaluate the statistic on a window of finite values.
    pub fn evaluate(&self, window: &[f64]) -> Option<f64> {
        if window.len() < self.required_observations() {
            return None;
        }
        let value = self.function.compute_signal(window)?;
        if !value.is_finite() {
            return None;
        }
        match self.function.valid_range() {
            Some((lo, hi)) if value < lo || value > hi => None,
            _ => Some(value),
        }
    }

    /// Rolling statistic over rows `t - window + 1 ..= t`, including row `t`.
    ///
    /// Not safe to rank on directly: the value at `t` has seen row `t`.
    pub fn rolling_unshifted(&self, values: &[Option<f64>]) -> Vec<Option<f64>> {
        let mut buffer = Vec::with_capacity(self.window);
        (0..values.len())
            .map(|t| {
                let start = (t + 1).saturating_sub(self.window);
                buffer.clear();
                buffer.extend(values[start..=t].iter().flatten().copied().filter(|v| v.is_finite()));
                self.evaluate(&buffer)
            })
            .collect()
    }

    /// Rolling statistic aligned so row `t` uses only rows `t - window .. t`.
    pub fn apply(&self, values: &[Option<f64>]) -> Vec<Option<f64>> {
        shift(&self.rolling_unshifted(values), 1)
    }
}

/// Trailing beta of `asset` against `market`, shifted one row.
///
/// Both slices must be aligned row for row. Only rows where both values are
/// finite count towards coverage.
pub fn rolling_beta(
    asset: &[Option<f64>],
    market: &[Option<f64>],
    window: usize,
    min_coverage: f64,
) -> Vec<Option<f64>> {
    let window = window.max(1);
    let required = ((window as f64 * min_coverage).ceil() as usize).max(3);
    let len = asset.len().min(market.len());

    let unshifted: Vec<Option<f64>> = (0..len)
        .map(|t| {
            let start = (t + 1).saturating_sub(window);
            let pairs: Vec<(f64, f64)> = (start..=t)
                .filter_map(|i| match (asset[i], market[i]) {
                    (Some(a), Some(m)) if a.is_finite() && m.is_finite() => Some((a, m)),
                    _ => None,
                })
                .collect();
            if pairs.len() < required {
                return None;
            }
            let n = pairs.len() as f64;
            let mean_a = pairs.iter().map(|p| p.0).sum::<f64>() / n;
            let mean_m = pairs.iter().map(|p| p.1).sum::<f64>() / n;
            let cov = pairs.iter().map(|(a, m)| (a - mean_a) * (m - mean_m)).sum::<f64>() / (n - 1.0);
            let var = pairs.iter().map(|(_, m)| (m - mean_m).powi(2)).sum::<f64>() / (n - 1.0);
            if !(var > 0.0 && var.is_finite()) {
                return None;
            }
            Some(cov / var).filter(|b| b.is_finite())
        })
        .collect();

    shift(&unshifted, 1)
}

/// Market return per date: a named symbol's return, or the equal-weight
/// average return of every symbol with data on that date.
pub fn market_returns(
    panel: &Panel,
    return_column: &str,
    market_symbol: Option<&str>,
) -> Result<BTreeMap<NaiveDate, f64>> {
    if let Some(symbol) = market_symbol {
        let series = panel.get(symbol).ok_or_else(|| {
            BacktestError::DataError(format!("Market symbol '{}' not in panel", symbol))
        })?;
        let returns = series.column(return_column).unwrap_or(&[]);
        return Ok(series
            .dates()
            .iter()
            .zip(returns)
            .filter_map(|(d, r)| r.map(|r| (*d, r)))
            .collect());
    }

    let mut sums: BTreeMap<NaiveDate, (f64, usize)> = BTreeMap::new();
    for series in panel.series() {
        if let Some(returns) = series.column(return_column) {
            for (date, r) in series.dates().iter().zip(returns) {
                if let Some(r) = r.filter(|r| r.is_finite()) {
                    let entry = sums.entry(*date).or_insert((0.0, 0));
                    entry.0 += r;
                    entry.1 += 1;
                }
            }
        }
    }
    Ok(sums
        .into_iter()
        .map(|(d, (sum, n))| (d, sum / n as f64))
        .collect())
}

/// Observations grouped by date, in symbol order within each date.
#[derive(Debug, Clone, Default)]
pub struct CrossSections {
    by_date: BTreeMap<NaiveDate, Vec<Observation>>,
}

impl CrossSections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, observation: Observation) {
        self.by_date
            .entry(observation.date)
            .or_default()
            .push(observation);
    }

    /// Observations on a date; empty when the date has no rows.
    pub fn get(&self, date: NaiveDate) -> &[Observation] {
        self.by_date.get(&date).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn dates(&self) -> Vec<NaiveDate> {
        self.by_date.keys().copied().collect()
    }

    /// Dates in ascending order with their observations.
    pub fn iter(&self) -> impl Iterator<Item = (NaiveDate, &[Observation])> {
        self.by_date.iter().map(|(d, v)| (*d, v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.by_date.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_date.is_empty()
    }

    pub fn observation_count(&self) -> usize {
        self.by_date.values().map(|v| v.len()).sum()
    }
}

/// Compute signals and trailing volatilities for every symbol and group the
/// in-window rows by date.
///
/// Features run over each symbol's full history so rows before `start_date`
/// serve as warmup.
pub fn build_observations(panel: &Panel, config: &FactorConfig) -> Result<CrossSections> {
    if panel.is_empty() {
        return Err(BacktestError::NoData);
    }

    let annualization = if config.annualize_signal {
        config.periods_per_year
    } else {
        1.0
    };
    let signal_feature = config
        .signal
        .function(annualization)
        .map(|f| RollingFeature::new(f, config.lookback_window, config.min_coverage));
    let volatility_feature = RollingFeature::new(
        Box::new(Volatility::annualized(config.periods_per_year)),
        config.volatility_window,
        config.min_coverage,
    );
    let market = if config.signal == SignalKind::Beta {
        Some(market_returns(
            panel,
            &config.return_column,
            config.market_symbol.as_deref(),
        )?)
    } else {
        None
    };

    let mut sections = CrossSections::new();
    let mut invalid = 0usize;

    for series in panel.series() {
        let len = series.len();
        let empty: Vec<Option<f64>> = vec![None; len];
        let returns = series.column(&config.return_column).unwrap_or(&empty);
        let input = series.column(&config.signal_column).unwrap_or(&empty);
        if !series.has_column(&config.signal_column) {
            debug!("{} has no '{}' column", series.symbol, config.signal_column);
        }

        let signals: Vec<Option<f64>> = match (&signal_feature, &market) {
            (Some(feature), _) => feature.apply(input),
            (None, Some(market)) => {
                let aligned: Vec<Option<f64>> = series
                    .dates()
                    .iter()
                    .map(|d| market.get(d).copied())
                    .collect();
                rolling_beta(input, &aligned, config.lookback_window, config.min_coverage)
            }
            // A row's own value is only known once the row has happened
            (None, None) => shift(input, 1),
        };
        let volatilities = volatility_feature.apply(returns);

        let liquidity = config.liquidity_column.as_deref().and_then(|c| series.column(c));
        let market_cap = config.market_cap_column.as_deref().and_then(|c| series.column(c));

        for (i, date) in series.dates().iter().enumerate() {
            if !config.in_window(*date) {
                continue;
            }
            let signal = signals[i].filter(|s| s.is_finite());
            if signal.is_none() {
                invalid += 1;
            }
            sections.insert(Observation {
                date: *date,
                symbol: series.symbol.clone(),
                signal,
                ret: returns[i].filter(|r| r.is_finite()),
                liquidity: liquidity.and_then(|c| c[i]),
                market_cap: market_cap.and_then(|c| c[i]),
                volatility: volatilities[i],
            });
        }
    }

    info!(
        "Built {} observations over {} dates ({} without a valid {} signal)",
        sections.observation_count(),
        sections.len(),
        invalid,
        config.signal.name()
    );

    Ok(sections)
}

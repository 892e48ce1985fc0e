//! Performance analytics and reporting.

use crate::simulator::SimulationResult;
use crate::types::{DailyValue, TradeRecord};
use colored::Colorize;
use serde::{Deserialize, Serialize};
use tabled::{builder::Builder, settings::Style};

const DAYS_PER_YEAR: f64 = 365.25;

/// Summary metrics of a capital series.
///
/// Returns and drawdowns are fractions (0.2 is 20%). Every ratio is 0 when
/// its denominator is 0.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_return: f64,
    /// Geometric, over elapsed calendar years.
    pub annualized_return: f64,
    pub annualized_volatility: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    /// Most negative `(value - running_max) / running_max`, in [-1, 0].
    pub max_drawdown: f64,
    /// Periods from the drawdown's peak to its trough.
    pub max_drawdown_duration: usize,
    pub calmar_ratio: f64,
    /// Fraction of periods with a positive return.
    pub win_rate: f64,
    pub best_period: f64,
    pub worst_period: f64,
    pub periods: usize,
    pub years: f64,
    /// Compounded return of the long leg's assets.
    pub long_leg_return: f64,
    /// Compounded return of the short leg's assets (a short profits when negative).
    pub short_leg_return: f64,
}

impl PerformanceMetrics {
    /// Metrics for a value series spanning `years` calendar years.
    pub fn from_values(values: &[f64], years: f64, periods_per_year: f64) -> Self {
        if values.len() < 2 || values[0] <= 0.0 {
            return Self::default();
        }

        let returns = period_returns(values);
        let first = values[0];
        let last = values[values.len() - 1];
        let total_return = last / first - 1.0;

        let years = if years > 0.0 {
            years
        } else {
            returns.len() as f64 / periods_per_year
        };
        let annualized_return = if last <= 0.0 {
            -1.0
        } else if years > 0.0 {
            (last / first).powf(1.0 / years) - 1.0
        } else {
            0.0
        };
        // Short spans with large moves overflow the compounding
        let annualized_return = if annualized_return.is_finite() {
            annualized_return
        } else {
            0.0
        };

        let annualized_volatility = std_dev(&returns) * periods_per_year.sqrt();
        let downside = downside_deviation(&returns) * periods_per_year.sqrt();
        let (max_drawdown, max_drawdown_duration) = drawdown(values);

        let wins = returns.iter().filter(|r| **r > 0.0).count();

        Self {
            total_return,
            annualized_return,
            annualized_volatility,
            sharpe_ratio: ratio(annualized_return, annualized_volatility),
            sortino_ratio: ratio(annualized_return, downside),
            max_drawdown,
            max_drawdown_duration,
            calmar_ratio: ratio(annualized_return, max_drawdown.abs()),
            win_rate: ratio(wins as f64, returns.len() as f64),
            best_period: returns.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            worst_period: returns.iter().copied().fold(f64::INFINITY, f64::min),
            periods: returns.len(),
            years,
            long_leg_return: 0.0,
            short_leg_return: 0.0,
        }
    }

    /// Metrics for a simulated run, the initial capital preceding the first date.
    pub fn from_daily_values(initial_capital: f64, daily: &[DailyValue], periods_per_year: f64) -> Self {
        let values: Vec<f64> = std::iter::once(initial_capital)
            .chain(daily.iter().map(|d| d.capital))
            .collect();

        let years = match (daily.first(), daily.last()) {
            (Some(first), Some(last)) => (last.date - first.date).num_days().max(1) as f64 / DAYS_PER_YEAR,
            _ => 0.0,
        };

        let compound = |f: fn(&DailyValue) -> f64| daily.iter().map(f).fold(1.0, |acc, r| acc * (1.0 + r)) - 1.0;

        Self {
            long_leg_return: compound(|d| d.long_return),
            short_leg_return: compound(|d| d.short_return),
            ..Self::from_values(&values, years, periods_per_year)
        }
    }
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 && denominator.is_finite() {
        numerator / denominator
    } else {
        0.0
    }
}

/// Simple returns between consecutive values.
pub fn period_returns(values: &[f64]) -> Vec<f64> {
    values
        .windows(2)
        .map(|w| if w[0] != 0.0 { w[1] / w[0] - 1.0 } else { 0.0 })
        .collect()
}

fn std_dev(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
    variance.sqrt()
}

fn downside_deviation(returns: &[f64]) -> f64 {
    if returns.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = returns.iter().filter(|r| **r < 0.0).map(|r| r.powi(2)).sum();
    (sum_sq / returns.len() as f64).sqrt()
}

/// Maximum drawdown and its peak-to-trough length in periods.
pub fn drawdown(values: &[f64]) -> (f64, usize) {
    let mut peak = f64::NEG_INFINITY;
    let mut peak_idx = 0;
    let mut max_dd = 0.0;
    let mut duration = 0;

    for (i, &v) in values.iter().enumerate() {
        if v > peak {
            peak = v;
            peak_idx = i;
        }
        if peak > 0.0 {
            let dd = (v - peak) / peak;
            if dd < max_dd {
                max_dd = dd;
                duration = i - peak_idx;
            }
        }
    }
    (max_dd, duration)
}

/// Format results for terminal display.
pub struct ResultFormatter;

impl ResultFormatter {
    /// Print a results report to stdout.
    pub fn print_report(result: &SimulationResult) {
        let m = &result.metrics;

        println!();
        println!("{}", "═".repeat(60).blue());
        println!("{}", " FACTOR BACKTEST RESULTS ".bold().blue());
        println!("{}", "═".repeat(60).blue());
        println!();

        println!("{}", "Overview".bold().underline());
        println!("  Strategy:        {}", result.strategy_id);
        println!("  Signal:          {}", result.config.signal.name());
        if let (Some(start), Some(end)) = (result.start_date, result.end_date) {
            println!("  Period:          {} to {}", start, end);
        }
        println!("  Rebalance:       every {} days", result.config.rebalance_interval_days);
        println!("  Run:             {}", result.run_id);
        println!();

        println!("{}", "Performance".bold().underline());
        println!("  Initial Capital: ${:>12.2}", result.initial_capital);
        println!(
            "  Final Capital:   ${:>12.2}  {}",
            result.final_capital,
            Self::format_pct_change(m.total_return * 100.0)
        );
        println!("  Total Return:    {:>12.2}%", m.total_return * 100.0);
        println!("  Annual Return:   {:>12.2}%", m.annualized_return * 100.0);
        println!("  Long Leg:        {:>12.2}%", m.long_leg_return * 100.0);
        println!("  Short Leg:       {:>12.2}%", m.short_leg_return * 100.0);
        println!();

        println!("{}", "Risk Metrics".bold().underline());
        println!("  Max Drawdown:    {:>12.2}%", m.max_drawdown * 100.0);
        println!("  Volatility:      {:>12.2}%", m.annualized_volatility * 100.0);
        println!("  Sharpe Ratio:    {:>12.2}", m.sharpe_ratio);
        println!("  Sortino Ratio:   {:>12.2}", m.sortino_ratio);
        println!("  Calmar Ratio:    {:>12.2}", m.calmar_ratio);
        println!("  Win Rate:        {:>12.1}%", m.win_rate * 100.0);
        println!();

        println!("{}", "Trading".bold().underline());
        println!("  Rebalances:      {:>12}", result.rebalance_count);
        println!("  Skipped:         {:>12}", result.skipped_rebalances);
        println!("  Avg Turnover:    {:>12.3}", result.avg_turnover);
        println!("  Total Costs:     ${:>11.2}", result.total_costs);
        println!("  Data Gaps:       {:>12}", result.data_gaps);
        if result.ruined {
            println!("  {}", "Capital exhausted, run stopped early".red().bold());
        }
        println!();

        println!("{}", "═".repeat(60).blue());
    }

    fn format_pct_change(pct: f64) -> String {
        if pct >= 0.0 {
            format!("(+{:.2}%)", pct).green().to_string()
        } else {
            format!("({:.2}%)", pct).red().to_string()
        }
    }

    /// Print several results as a table.
    pub fn print_table(results: &[&SimulationResult]) {
        let mut builder = Builder::new();
        builder.push_record([
            "Strategy", "Interval", "Return %", "Annual %", "Max DD %", "Sharpe", "Rebalances",
            "Turnover",
        ]);

        for result in results {
            let m = &result.metrics;
            builder.push_record([
                result.strategy_id.clone(),
                result.config.rebalance_interval_days.to_string(),
                format!("{:.2}", m.total_return * 100.0),
                format!("{:.2}", m.annualized_return * 100.0),
                format!("{:.2}", m.max_drawdown * 100.0),
                format!("{:.2}", m.sharpe_ratio),
                result.rebalance_count.to_string(),
                format!("{:.3}", result.avg_turnover),
            ]);
        }

        let table = builder.build().with(Style::rounded()).to_string();
        println!("{}", table);
    }

    /// Export results to JSON.
    pub fn to_json(result: &SimulationResult) -> String {
        serde_json::to_string_pretty(result).unwrap_or_else(|_| "{}".to_string())
    }

    /// One summary line matching [`ResultFormatter::csv_header`].
    pub fn to_csv_line(result: &SimulationResult) -> String {
        let m = &result.metrics;
        format!(
            "{},{},{},{:.2},{:.2},{:.6},{:.6},{:.6},{:.4},{:.4},{},{:.4}",
            result.strategy_id,
            result.config.signal.name(),
            result.config.rebalance_interval_days,
            result.initial_capital,
            result.final_capital,
            m.total_return,
            m.annualized_return,
            m.max_drawdown,
            m.sharpe_ratio,
            m.sortino_ratio,
            result.rebalance_count,
            result.avg_turnover
        )
    }

    pub fn csv_header() -> &'static str {
        "strategy,signal,interval_days,initial_capital,final_capital,total_return,annualized_return,max_drawdown,sharpe_ratio,sortino_ratio,rebalances,avg_turnover"
    }
}

/// Rebalance report generator.
pub struct TradeReport;

impl TradeReport {
    /// Print the most recent rebalances, `limit` 0 for all.
    pub fn print_trades(trades: &[TradeRecord], limit: usize) {
        if trades.is_empty() {
            println!("No rebalances.");
            return;
        }

        let shown = if limit > 0 && limit < trades.len() {
            &trades[trades.len() - limit..]
        } else {
            trades
        };

        let mut builder = Builder::new();
        builder.push_record(["Date", "Eligible", "Long", "Short", "Turnover"]);
        for trade in shown {
            builder.push_record([
                trade.rebalance_date.to_string(),
                trade.eligible.to_string(),
                trade.long_symbols.join(" "),
                trade.short_symbols.join(" "),
                format!("{:.3}", trade.turnover),
            ]);
        }

        let table = builder.build().with(Style::rounded()).to_string();
        println!("{}", table);

        if shown.len() < trades.len() {
            println!("... and {} earlier rebalances", trades.len() - shown.len());
        }
    }
}

//! Export of simulation results.
//!
//! A run is written as three tables:
//!
//! | File | Content |
//! |------|---------|
//! | `equity.csv` | Daily capital, returns, leg returns and costs |
//! | `trades.csv` | One row per rebalance |
//! | `metrics.json` | Run summary and performance metrics |
//!
//! # Example
//!
//! ```ignore
//! use factorlab::export::export_results;
//!
//! let result = simulator.run(&sections)?;
//! let paths = export_results(&result, "out/low_vol")?;
//! println!("{}", paths.equity.display());
//! ```

use crate::analytics::{PerformanceMetrics, ResultFormatter};
use crate::error::Result;
use crate::simulator::SimulationResult;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

/// Configuration for exports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Decimal precision for numeric values.
    pub precision: usize,
    pub include_headers: bool,
    pub delimiter: u8,
    /// Separator between symbols inside one trades.csv cell.
    pub symbol_separator: String,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            precision: 6,
            include_headers: true,
            delimiter: b',',
            symbol_separator: " ".to_string(),
        }
    }
}

/// Summary record written to `metrics.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub strategy_id: String,
    pub signal: String,
    pub rebalance_interval_days: u32,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub initial_capital: f64,
    pub final_capital: f64,
    pub total_costs: f64,
    pub avg_turnover: f64,
    pub rebalance_count: usize,
    pub skipped_rebalances: usize,
    pub data_gaps: usize,
    pub ruined: bool,
    pub metrics: PerformanceMetrics,
    pub finished_at: DateTime<Utc>,
}

impl RunSummary {
    pub fn from_result(result: &SimulationResult) -> Self {
        Self {
            run_id: result.run_id,
            strategy_id: result.strategy_id.clone(),
            signal: result.config.signal.name().to_string(),
            rebalance_interval_days: result.config.rebalance_interval_days,
            start_date: result.start_date,
            end_date: result.end_date,
            initial_capital: result.initial_capital,
            final_capital: result.final_capital,
            total_costs: result.total_costs,
            avg_turnover: result.avg_turnover,
            rebalance_count: result.rebalance_count,
            skipped_rebalances: result.skipped_rebalances,
            data_gaps: result.data_gaps,
            ruined: result.ruined,
            metrics: result.metrics.clone(),
            finished_at: result.finished_at,
        }
    }
}

/// Files written by [`export_results`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExportPaths {
    pub equity: PathBuf,
    pub trades: PathBuf,
    pub metrics: PathBuf,
}

/// Exporter for simulation results.
pub struct Exporter<'a> {
    result: &'a SimulationResult,
    config: ExportConfig,
}

impl<'a> Exporter<'a> {
    pub fn new(result: &'a SimulationResult) -> Self {
        Self {
            result,
            config: ExportConfig::default(),
        }
    }

    pub fn with_config(result: &'a SimulationResult, config: ExportConfig) -> Self {
        Self { result, config }
    }

    fn writer(&self, path: impl AsRef<Path>) -> Result<csv::Writer<File>> {
        Ok(csv::WriterBuilder::new()
            .delimiter(self.config.delimiter)
            .from_path(path)?)
    }

    fn num(&self, value: f64) -> String {
        format!("{:.prec$}", value, prec = self.config.precision)
    }

    /// Export the daily capital series to CSV.
    pub fn export_equity_csv(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut writer = self.writer(path)?;
        if self.config.include_headers {
            writer.write_record([
                "date",
                "capital",
                "daily_return",
                "long_return",
                "short_return",
                "transaction_cost",
                "rebalanced",
            ])?;
        }

        for day in &self.result.daily_values {
            writer.write_record([
                day.date.to_string(),
                self.num(day.capital),
                self.num(day.daily_return),
                self.num(day.long_return),
                self.num(day.short_return),
                self.num(day.transaction_cost),
                day.rebalanced.to_string(),
            ])?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Export rebalance records to CSV.
    pub fn export_trades_csv(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut writer = self.writer(path)?;
        if self.config.include_headers {
            writer.write_record([
                "rebalance_date",
                "eligible",
                "long_count",
                "short_count",
                "long_threshold",
                "short_threshold",
                "turnover",
                "long_symbols",
                "short_symbols",
            ])?;
        }

        let sep = &self.config.symbol_separator;
        for trade in &self.result.trades {
            writer.write_record([
                trade.rebalance_date.to_string(),
                trade.eligible.to_string(),
                trade.long_symbols.len().to_string(),
                trade.short_symbols.len().to_string(),
                trade.long_threshold.map(|v| self.num(v)).unwrap_or_default(),
                trade.short_threshold.map(|v| self.num(v)).unwrap_or_default(),
                self.num(trade.turnover),
                trade.long_symbols.join(sep),
                trade.short_symbols.join(sep),
            ])?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Export the run summary as JSON.
    pub fn export_summary_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(BufWriter::new(file), &RunSummary::from_result(self.result))?;
        Ok(())
    }

    /// Export the complete result, daily values included, as JSON.
    pub fn export_full_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(BufWriter::new(file), self.result)?;
        Ok(())
    }
}

/// Write `equity.csv`, `trades.csv` and `metrics.json` into `dir`.
pub fn export_results(result: &SimulationResult, dir: impl AsRef<Path>) -> Result<ExportPaths> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;

    let paths = ExportPaths {
        equity: dir.join("equity.csv"),
        trades: dir.join("trades.csv"),
        metrics: dir.join("metrics.json"),
    };

    let exporter = Exporter::new(result);
    exporter.export_equity_csv(&paths.equity)?;
    exporter.export_trades_csv(&paths.trades)?;
    exporter.export_summary_json(&paths.metrics)?;

    info!("Exported {} to {}", result.strategy_id, dir.display());
    Ok(paths)
}

/// Write one summary line per result, e.g. for a sweep.
pub fn export_comparison_csv(results: &[&SimulationResult], path: impl AsRef<Path>) -> Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    writeln!(writer, "{}", ResultFormatter::csv_header())?;
    for result in results {
        writeln!(writer, "{}", ResultFormatter::to_csv_line(result))?;
    }
    writer.flush()?;
    Ok(())
}

//! Panel data loading and storage.
//!
//! The engine consumes a long-format table with one row per (date, symbol)
//! and any number of numeric columns. Rows are grouped into one
//! [`SymbolSeries`] per symbol; rolling statistics run over each symbol's own
//! rows.

use crate::error::{BacktestError, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use csv::ReaderBuilder;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{debug, info, warn};

const DATE_ALIASES: &[&str] = &["date", "timestamp", "time", "datetime", "day"];
const SYMBOL_ALIASES: &[&str] = &["symbol", "ticker", "asset", "coin", "instrument"];

/// Input table configuration.
#[derive(Debug, Clone)]
pub struct DataConfig {
    /// Date format string (auto-detected when `None`).
    pub date_format: Option<String>,
    pub delimiter: u8,
    pub has_headers: bool,
    /// Column holding per-row returns.
    pub return_column: String,
    /// Close price column used to derive returns when none are supplied.
    pub close_column: String,
    /// Skip rows with an unparseable date instead of failing.
    pub skip_invalid: bool,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            date_format: None,
            delimiter: b',',
            has_headers: true,
            return_column: "return".to_string(),
            close_column: "close".to_string(),
            skip_invalid: false,
        }
    }
}

/// Ordered rows for one symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolSeries {
    pub symbol: String,
    dates: Vec<NaiveDate>,
    columns: BTreeMap<String, Vec<Option<f64>>>,
}

impl SymbolSeries {
    fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            dates: Vec::new(),
            columns: BTreeMap::new(),
        }
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    /// Values of a column, aligned with [`SymbolSeries::dates`].
    pub fn column(&self, name: &str) -> Option<&[Option<f64>]> {
        self.columns.get(name).map(|c| c.as_slice())
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &String> {
        self.columns.keys()
    }

    /// Row index of a date.
    pub fn index_of(&self, date: NaiveDate) -> Option<usize> {
        self.dates.binary_search(&date).ok()
    }

    /// Value of a column on a date.
    pub fn value(&self, name: &str, date: NaiveDate) -> Option<f64> {
        let idx = self.index_of(date)?;
        self.columns.get(name)?.get(idx).copied().flatten()
    }

    fn push(&mut self, date: NaiveDate, values: Vec<(String, Option<f64>)>) -> Result<()> {
        if let Some(last) = self.dates.last() {
            if date == *last {
                return Err(BacktestError::DataError(format!(
                    "Duplicate row for {} on {}",
                    self.symbol, date
                )));
            }
            if date < *last {
                return Err(BacktestError::DataError(format!(
                    "Rows for {} are not in date order ({} after {})",
                    self.symbol, date, last
                )));
            }
        }

        let row = self.dates.len();
        self.dates.push(date);
        for (name, value) in values {
            let column = self
                .columns
                .entry(name)
                .or_insert_with(|| vec![None; row]);
            column.push(value);
        }
        // Columns absent from this row
        for column in self.columns.values_mut() {
            if column.len() < row + 1 {
                column.push(None);
            }
        }
        Ok(())
    }

    /// Fill `return_column` from close-to-close changes of `close_column`.
    ///
    /// Existing return values are kept. Returns the number of values derived.
    fn derive_returns(&mut self, close_column: &str, return_column: &str) -> usize {
        let Some(closes) = self.columns.get(close_column).cloned() else {
            return 0;
        };
        let len = self.dates.len();
        let returns = self
            .columns
            .entry(return_column.to_string())
            .or_insert_with(|| vec![None; len]);

        let mut derived = 0;
        for i in 1..len {
            if returns[i].is_some() {
                continue;
            }
            if let (Some(prev), Some(curr)) = (closes[i - 1], closes[i]) {
                if prev > 0.0 && prev.is_finite() && curr.is_finite() {
                    returns[i] = Some(curr / prev - 1.0);
                    derived += 1;
                }
            }
        }
        derived
    }
}

/// All symbols of a backtest universe.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Panel {
    series: BTreeMap<String, SymbolSeries>,
}

impl Panel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one row for a symbol.
    ///
    /// Rows of a symbol must arrive in strictly increasing date order; a
    /// repeated (date, symbol) key is a data error.
    pub fn push_row<I, S>(&mut self, symbol: &str, date: NaiveDate, values: I) -> Result<()>
    where
        I: IntoIterator<Item = (S, Option<f64>)>,
        S: Into<String>,
    {
        let values = values.into_iter().map(|(k, v)| (k.into(), v)).collect();
        self.series
            .entry(symbol.to_string())
            .or_insert_with(|| SymbolSeries::new(symbol))
            .push(date, values)
    }

    pub fn get(&self, symbol: &str) -> Option<&SymbolSeries> {
        self.series.get(symbol)
    }

    pub fn symbols(&self) -> Vec<&String> {
        self.series.keys().collect()
    }

    pub fn series(&self) -> impl Iterator<Item = &SymbolSeries> {
        self.series.values()
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// Total number of rows across symbols.
    pub fn row_count(&self) -> usize {
        self.series.values().map(|s| s.len()).sum()
    }

    /// Sorted union of all dates, optionally clipped to `[start, end]`.
    pub fn date_axis(&self, start: Option<NaiveDate>, end: Option<NaiveDate>) -> Vec<NaiveDate> {
        let dates: BTreeSet<NaiveDate> = self
            .series
            .values()
            .flat_map(|s| s.dates.iter().copied())
            .filter(|d| start.map_or(true, |s| *d >= s) && end.map_or(true, |e| *d <= e))
            .collect();
        dates.into_iter().collect()
    }

    /// First and last date across all symbols.
    pub fn date_range(&self) -> Option<(NaiveDate, NaiveDate)> {
        let start = self.series.values().filter_map(|s| s.dates.first()).min()?;
        let end = self.series.values().filter_map(|s| s.dates.last()).max()?;
        Some((*start, *end))
    }

    /// Derive missing returns from close prices for every symbol.
    pub fn derive_returns(&mut self, close_column: &str, return_column: &str) -> usize {
        self.series
            .values_mut()
            .map(|s| s.derive_returns(close_column, return_column))
            .sum()
    }
}

fn parse_date(s: &str, format: Option<&str>) -> Result<NaiveDate> {
    let s = s.trim();
    if let Some(fmt) = format {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Ok(d);
        }
        return NaiveDateTime::parse_from_str(s, fmt)
            .map(|dt| dt.date())
            .map_err(BacktestError::from);
    }

    for fmt in ["%Y-%m-%d", "%Y/%m/%d", "%Y%m%d", "%d.%m.%Y"] {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Ok(d);
        }
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(dt.date());
        }
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.date_naive());
    }

    Err(BacktestError::DataError(format!("Unrecognized date: '{}'", s)))
}

fn parse_value(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    match s.to_ascii_lowercase().as_str() {
        "nan" | "null" | "none" | "na" => None,
        _ => s.parse::<f64>().ok().filter(|v| v.is_finite()),
    }
}

fn find_column(headers: &csv::StringRecord, aliases: &[&str]) -> Option<usize> {
    headers
        .iter()
        .position(|h| aliases.contains(&h.trim().to_ascii_lowercase().as_str()))
}

/// Load a long-format panel from a CSV file.
pub fn load_panel(path: impl AsRef<Path>, config: &DataConfig) -> Result<Panel> {
    let path = path.as_ref();
    info!("Loading panel from: {}", path.display());

    let reader = ReaderBuilder::new()
        .has_headers(config.has_headers)
        .delimiter(config.delimiter)
        .flexible(true)
        .from_path(path)?;

    read_panel(reader, config)
}

/// Load a long-format panel from CSV text.
pub fn load_panel_from_str(content: &str, config: &DataConfig) -> Result<Panel> {
    let reader = ReaderBuilder::new()
        .has_headers(config.has_headers)
        .delimiter(config.delimiter)
        .flexible(true)
        .from_reader(content.as_bytes());

    read_panel(reader, config)
}

fn read_panel<R: std::io::Read>(mut reader: csv::Reader<R>, config: &DataConfig) -> Result<Panel> {
    let headers = reader.headers()?.clone();
    let date_idx = find_column(&headers, DATE_ALIASES)
        .ok_or_else(|| BacktestError::DataError("Missing date column".into()))?;
    let symbol_idx = find_column(&headers, SYMBOL_ALIASES)
        .ok_or_else(|| BacktestError::DataError("Missing symbol column".into()))?;

    let value_columns: Vec<(usize, String)> = headers
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != date_idx && *i != symbol_idx)
        .map(|(i, h)| (i, h.trim().to_string()))
        .collect();

    let mut rows: Vec<(String, NaiveDate, Vec<(String, Option<f64>)>)> = Vec::new();
    let mut skipped = 0;

    for (row_num, record) in reader.records().enumerate() {
        let record = record?;
        let symbol = record.get(symbol_idx).unwrap_or("").trim().to_string();
        if symbol.is_empty() {
            debug!("Skipping row {}: empty symbol", row_num + 1);
            skipped += 1;
            continue;
        }

        let date = match parse_date(record.get(date_idx).unwrap_or(""), config.date_format.as_deref()) {
            Ok(d) => d,
            Err(e) if config.skip_invalid => {
                debug!("Skipping row {} due to date parse error: {}", row_num + 1, e);
                skipped += 1;
                continue;
            }
            Err(e) => return Err(e),
        };

        let values = value_columns
            .iter()
            .map(|(i, name)| (name.clone(), record.get(*i).and_then(parse_value)))
            .collect();
        rows.push((symbol, date, values));
    }

    if skipped > 0 {
        warn!("Skipped {} invalid rows", skipped);
    }
    if rows.is_empty() {
        return Err(BacktestError::NoData);
    }

    let sorted = rows
        .windows(2)
        .all(|w| (&w[0].0, w[0].1) <= (&w[1].0, w[1].1));
    if !sorted {
        warn!("Input not sorted by (symbol, date); sorting");
        rows.sort_by(|a, b| (&a.0, a.1).cmp(&(&b.0, b.1)));
    }

    let mut panel = Panel::new();
    for (symbol, date, values) in rows {
        panel.push_row(&symbol, date, values)?;
    }

    let derived = panel.derive_returns(&config.close_column, &config.return_column);
    if derived > 0 {
        debug!("Derived {} returns from '{}'", derived, config.close_column);
    }

    if let Some((start, end)) = panel.date_range() {
        info!(
            "Loaded {} rows for {} symbols from {} to {}",
            panel.row_count(),
            panel.len(),
            start,
            end
        );
    }

    Ok(panel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    #[test]
    fn test_push_row_aligns_columns() {
        let mut panel = Panel::new();
        panel.push_row("A", d(1), [("close", Some(10.0))]).unwrap();
        panel
            .push_row("A", d(2), [("close", Some(11.0)), ("volume", Some(5.0))])
            .unwrap();
        panel.push_row("A", d(3), [("volume", Some(6.0))]).unwrap();

        let series = panel.get("A").unwrap();
        assert_eq!(series.column("close").unwrap(), &[Some(10.0), Some(11.0), None]);
        assert_eq!(series.column("volume").unwrap(), &[None, Some(5.0), Some(6.0)]);
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let mut panel = Panel::new();
        panel.push_row("A", d(1), [("close", Some(10.0))]).unwrap();
        let err = panel.push_row("A", d(1), [("close", Some(10.5))]).unwrap_err();
        assert!(matches!(err, BacktestError::DataError(_)));
    }

    #[test]
    fn test_out_of_order_rejected() {
        let mut panel = Panel::new();
        panel.push_row("A", d(2), [("close", Some(10.0))]).unwrap();
        assert!(panel.push_row("A", d(1), [("close", Some(10.0))]).is_err());
    }

    #[test]
    fn test_date_axis_union_and_clip() {
        let mut panel = Panel::new();
        panel.push_row("A", d(1), [("close", Some(1.0))]).unwrap();
        panel.push_row("A", d(3), [("close", Some(1.0))]).unwrap();
        panel.push_row("B", d(2), [("close", Some(1.0))]).unwrap();
        panel.push_row("B", d(3), [("close", Some(1.0))]).unwrap();

        assert_eq!(panel.date_axis(None, None), vec![d(1), d(2), d(3)]);
        assert_eq!(panel.date_axis(Some(d(2)), None), vec![d(2), d(3)]);
        assert_eq!(panel.date_range(), Some((d(1), d(3))));
    }

    #[test]
    fn test_derive_returns_from_close() {
        let content = "date,symbol,close\n2024-01-01,A,100\n2024-01-02,A,110\n2024-01-03,A,99\n";
        let panel = load_panel_from_str(content, &DataConfig::default()).unwrap();
        let returns = panel.get("A").unwrap().column("return").unwrap();
        assert_eq!(returns[0], None);
        assert!((returns[1].unwrap() - 0.10).abs() < 1e-12);
        assert!((returns[2].unwrap() + 0.10).abs() < 1e-12);
    }

    #[test]
    fn test_supplied_returns_kept() {
        let content = "date,symbol,close,return\n2024-01-01,A,100,\n2024-01-02,A,110,0.5\n";
        let panel = load_panel_from_str(content, &DataConfig::default()).unwrap();
        assert_eq!(panel.get("A").unwrap().value("return", d(2)), Some(0.5));
    }

    #[test]
    fn test_unsorted_input_sorted() {
        let content = "Date,Ticker,close\n2024-01-02,B,1\n2024-01-01,A,1\n2024-01-01,B,1\n2024-01-02,A,1\n";
        let panel = load_panel_from_str(content, &DataConfig::default()).unwrap();
        assert_eq!(panel.len(), 2);
        assert_eq!(panel.get("B").unwrap().dates(), &[d(1), d(2)]);
    }

    #[test]
    fn test_duplicate_rows_in_file_rejected() {
        let content = "date,symbol,close\n2024-01-01,A,1\n2024-01-01,A,2\n";
        assert!(load_panel_from_str(content, &DataConfig::default()).is_err());
    }

    #[test]
    fn test_missing_values_are_none() {
        let content = "date,symbol,signal\n2024-01-01,A,NaN\n2024-01-02,A,\n2024-01-03,A,abc\n2024-01-04,A,2.5\n";
        let panel = load_panel_from_str(content, &DataConfig::default()).unwrap();
        assert_eq!(
            panel.get("A").unwrap().column("signal").unwrap(),
            &[None, None, None, Some(2.5)]
        );
    }

    #[test]
    fn test_load_panel_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "timestamp,asset,close,volume").unwrap();
        writeln!(file, "2024-01-01 00:00:00,BTC,40000,10").unwrap();
        writeln!(file, "2024-01-02 00:00:00,BTC,41000,12").unwrap();

        let panel = load_panel(file.path(), &DataConfig::default()).unwrap();
        let series = panel.get("BTC").unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series.value("volume", d(2)), Some(12.0));
    }

    #[test]
    fn test_missing_symbol_column() {
        let content = "date,close\n2024-01-01,1\n";
        assert!(load_panel_from_str(content, &DataConfig::default()).is_err());
    }

    #[test]
    fn test_empty_file_is_no_data() {
        let content = "date,symbol,close\n";
        assert!(matches!(
            load_panel_from_str(content, &DataConfig::default()),
            Err(BacktestError::NoData)
        ));
    }
}

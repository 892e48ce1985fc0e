//! Error types for the factor backtesting engine.

use chrono::NaiveDate;
use thiserror::Error;

/// Main error type for the factor engine.
///
/// Routine data sparsity never surfaces here: missing returns are absorbed by
/// the simulator and invalid signals simply exclude a symbol from ranking.
/// The variants below are either fatal (configuration and I/O) or
/// recoverable conditions that callers are expected to skip over, see
/// [`BacktestError::is_recoverable`].
#[derive(Error, Debug)]
pub enum BacktestError {
    #[error("Data error: {0}")]
    DataError(String),

    #[error("CSV parsing error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Date parsing error: {0}")]
    DateParseError(#[from] chrono::ParseError),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("No data loaded")]
    NoData,

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("SQLite error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    #[error("Insufficient universe on {date}: {eligible} eligible symbols, {required} required")]
    InsufficientUniverse {
        date: NaiveDate,
        eligible: usize,
        required: usize,
    },

    #[error("No long or short candidates on {date}")]
    NoCandidates { date: NaiveDate },

    #[error("Corrupt scheduler state for '{strategy_id}': {reason}")]
    CorruptState { strategy_id: String, reason: String },
}

impl BacktestError {
    /// Whether the condition can be skipped without aborting a run.
    ///
    /// A skipped rebalance keeps the previous weights; a corrupt scheduler
    /// state resets to a fresh schedule.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BacktestError::InsufficientUniverse { .. }
                | BacktestError::NoCandidates { .. }
                | BacktestError::CorruptState { .. }
        )
    }
}

/// Result type alias for factor engine operations.
pub type Result<T> = std::result::Result<T, BacktestError>;

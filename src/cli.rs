//! Command-line interface for the factor backtesting engine.

use factorlab::analytics::{ResultFormatter, TradeReport};
use factorlab::config::FactorFileConfig;
use factorlab::data::{load_panel, DataConfig};
use factorlab::error::{BacktestError, Result};
use factorlab::export::{export_comparison_csv, export_results, RunSummary};
use factorlab::features::{build_observations, SignalKind};
use factorlab::scheduler::RebalanceScheduler;
use factorlab::simulator::PortfolioSimulator;
use factorlab::store::SqliteStateStore;
use factorlab::sweep::{interval_grid, run_sweep};

use clap::{Parser, Subcommand, ValueEnum};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// factorlab - cross-sectional long/short factor backtesting.
#[derive(Parser)]
#[command(name = "factorlab")]
#[command(version)]
#[command(about = "Backtest cross-sectional long/short factor strategies")]
#[command(long_about = None)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text")]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a backtest from a configuration file
    Run {
        /// Path to TOML configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Path to data file; overrides [data].path
        #[arg(short, long)]
        data: Option<PathBuf>,

        /// Directory for equity.csv, trades.csv and metrics.json
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// SQLite file holding the persisted rebalance schedule
        #[arg(long)]
        state_db: Option<PathBuf>,

        /// Number of recent rebalances to list (0 for none)
        #[arg(long, default_value = "0")]
        show_trades: usize,
    },

    /// Run one configuration across several rebalance intervals in parallel
    Sweep {
        /// Path to TOML configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Path to data file; overrides [data].path
        #[arg(short, long)]
        data: Option<PathBuf>,

        /// Rebalance intervals in days
        #[arg(short, long, value_delimiter = ',', default_value = "7,14,30")]
        intervals: Vec<u32>,

        /// Write a summary CSV of all runs
        #[arg(long)]
        summary: Option<PathBuf>,
    },

    /// Generate an example configuration file
    Init {
        /// Output path for config file
        #[arg(short, long, default_value = "factor.toml")]
        output: PathBuf,
    },

    /// Validate a data file
    Validate {
        /// Path to CSV data file
        #[arg(short, long)]
        data: PathBuf,
    },

    /// List available signal kinds
    Signals,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
    Csv,
}

impl Cli {
    /// Initialize logging based on verbosity level.
    pub fn init_logging(&self) {
        let level = match self.verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        };

        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(false)
            .finish();

        if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
            eprintln!("Failed to set tracing subscriber: {}", e);
        }
    }
}

/// Run the CLI application.
pub fn run() -> Result<()> {
    let cli = Cli::parse();
    cli.init_logging();

    match &cli.command {
        Commands::Run {
            config,
            data,
            output_dir,
            state_db,
            show_trades,
        } => run_backtest(
            config,
            data.as_deref(),
            output_dir.as_deref(),
            state_db.as_deref(),
            *show_trades,
            cli.output,
        ),

        Commands::Sweep {
            config,
            data,
            intervals,
            summary,
        } => run_interval_sweep(config, data.as_deref(), intervals, summary.as_deref(), cli.output),

        Commands::Init { output } => init_config(output),

        Commands::Validate { data } => validate_data(data),

        Commands::Signals => {
            print_signals();
            Ok(())
        }
    }
}

/// Resolve the data path from the command line or the config file.
fn data_path(file_config: &FactorFileConfig, cli_path: Option<&Path>) -> Result<PathBuf> {
    cli_path
        .map(Path::to_path_buf)
        .or_else(|| file_config.data.path.as_ref().map(PathBuf::from))
        .ok_or_else(|| BacktestError::ConfigError("No data path given on the command line or in [data].path".to_string()))
}

fn run_backtest(
    config_path: &Path,
    data: Option<&Path>,
    output_dir: Option<&Path>,
    state_db: Option<&Path>,
    show_trades: usize,
    output: OutputFormat,
) -> Result<()> {
    let file_config = FactorFileConfig::load(config_path)?;
    let config = file_config.to_factor_config()?;
    let path = data_path(&file_config, data)?;

    info!("Loading data from: {}", path.display());
    let panel = load_panel(&path, &file_config.to_data_config())?;
    let sections = build_observations(&panel, &config)?;
    let simulator = PortfolioSimulator::new(config.clone())?;

    let result = match state_db {
        Some(db) => {
            let store = SqliteStateStore::new(db)?;
            let mut scheduler = RebalanceScheduler::resume(&store, &config);
            let result = simulator.run_with_scheduler(&sections, &mut scheduler)?;
            scheduler.persist(&store)?;
            info!(
                "Saved schedule for {}: next rebalance {:?}",
                config.strategy_id,
                scheduler.next_rebalance_date()
            );
            result
        }
        None => simulator.run(&sections)?,
    };

    match output {
        OutputFormat::Text => ResultFormatter::print_report(&result),
        OutputFormat::Json => println!("{}", ResultFormatter::to_json(&result)),
        OutputFormat::Csv => {
            println!("{}", ResultFormatter::csv_header());
            println!("{}", ResultFormatter::to_csv_line(&result));
        }
    }

    if show_trades > 0 {
        TradeReport::print_trades(&result.trades, show_trades);
    }

    if let Some(dir) = output_dir {
        let paths = export_results(&result, dir)?;
        println!("Results written to {}", paths.metrics.parent().unwrap_or(dir).display());
    }

    Ok(())
}

fn run_interval_sweep(
    config_path: &Path,
    data: Option<&Path>,
    intervals: &[u32],
    summary: Option<&Path>,
    output: OutputFormat,
) -> Result<()> {
    let file_config = FactorFileConfig::load(config_path)?;
    let base = file_config.to_factor_config()?;
    let path = data_path(&file_config, data)?;

    let panel = load_panel(&path, &file_config.to_data_config())?;
    let configs = interval_grid(&base, intervals);
    let entries = run_sweep(&panel, &configs, output == OutputFormat::Text)?;

    for entry in &entries {
        if let Err(e) = &entry.outcome {
            eprintln!("{}: {}", entry.strategy_id(), e);
        }
    }
    let results: Vec<_> = entries.iter().filter_map(|e| e.result()).collect();

    match output {
        OutputFormat::Text => ResultFormatter::print_table(&results),
        OutputFormat::Json => {
            let summaries: Vec<RunSummary> = results.iter().map(|r| RunSummary::from_result(r)).collect();
            println!("{}", serde_json::to_string_pretty(&summaries)?);
        }
        OutputFormat::Csv => {
            println!("{}", ResultFormatter::csv_header());
            for result in &results {
                println!("{}", ResultFormatter::to_csv_line(result));
            }
        }
    }

    if let Some(path) = summary {
        export_comparison_csv(&results, path)?;
        println!("Summary written to {}", path.display());
    }

    Ok(())
}

fn print_signals() {
    println!("\nAvailable Signals:\n");
    for kind in SignalKind::all() {
        println!("  {:<18} {}", kind.name(), kind.description());
    }
    println!();
    println!("Set [signal].kind in the configuration file, e.g. kind = \"z_score\".");
    println!();
}

fn init_config(output: &Path) -> Result<()> {
    let example = FactorFileConfig::example();
    fs::write(output, example)?;
    println!("Created example configuration file: {}", output.display());
    println!("\nEdit this file to describe your factor, then run:");
    println!("  factorlab run -c {}", output.display());
    Ok(())
}

fn validate_data(data_path: &Path) -> Result<()> {
    println!("Validating data file: {}", data_path.display());

    let panel = load_panel(data_path, &DataConfig::default())?;

    println!("\nData Summary:");
    println!("  Symbols: {}", panel.len());
    println!("  Rows:    {}", panel.row_count());

    if let Some((start, end)) = panel.date_range() {
        println!("  Start:   {}", start);
        println!("  End:     {}", end);
    }

    let columns: std::collections::BTreeSet<&String> =
        panel.series().flat_map(|s| s.column_names()).collect();
    println!(
        "  Columns: {}",
        columns.iter().map(|c| c.as_str()).collect::<Vec<_>>().join(", ")
    );

    if panel.is_empty() {
        return Err(BacktestError::NoData);
    }

    println!("\nValidation: PASSED");
    Ok(())
}

//! Parallel runs of independent backtests.
//!
//! Each configuration gets its own simulator and scheduler; nothing is
//! shared between runs except the read-only panel.

use crate::config::FactorConfig;
use crate::data::Panel;
use crate::error::{BacktestError, Result};
use crate::features::SignalKind;
use crate::simulator::{PortfolioSimulator, SimulationResult};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use std::collections::BTreeSet;
use tracing::{info, warn};

/// Outcome of one configuration in a sweep.
#[derive(Debug, Clone)]
pub struct SweepEntry {
    pub config: FactorConfig,
    /// The run's result, or the error message if it failed.
    pub outcome: std::result::Result<SimulationResult, String>,
}

impl SweepEntry {
    pub fn strategy_id(&self) -> &str {
        &self.config.strategy_id
    }

    pub fn result(&self) -> Option<&SimulationResult> {
        self.outcome.as_ref().ok()
    }
}

/// Variants of `base` differing only in rebalance interval.
///
/// Each variant's strategy id is suffixed with the interval, e.g. `vol_14d`.
pub fn interval_grid(base: &FactorConfig, intervals: &[u32]) -> Vec<FactorConfig> {
    intervals
        .iter()
        .map(|&days| FactorConfig {
            strategy_id: format!("{}_{}d", base.strategy_id, days),
            rebalance_interval_days: days,
            ..base.clone()
        })
        .collect()
}

/// Variants of `base` differing only in signal kind.
pub fn signal_grid(base: &FactorConfig, kinds: &[SignalKind]) -> Vec<FactorConfig> {
    kinds
        .iter()
        .map(|&kind| FactorConfig {
            strategy_id: format!("{}_{}", base.strategy_id, kind.name()),
            signal: kind,
            ..base.clone()
        })
        .collect()
}

/// Run every configuration over `panel` on the rayon pool.
///
/// Entries come back in input order. A failing run is logged and reported
/// in its entry; it does not abort the others. Duplicate strategy ids are
/// rejected up front.
pub fn run_sweep(panel: &Panel, configs: &[FactorConfig], show_progress: bool) -> Result<Vec<SweepEntry>> {
    let mut seen = BTreeSet::new();
    for config in configs {
        if !seen.insert(config.strategy_id.as_str()) {
            return Err(BacktestError::ConfigError(format!(
                "duplicate strategy_id '{}' in sweep",
                config.strategy_id
            )));
        }
    }

    info!("Running sweep of {} configurations", configs.len());

    let progress = if show_progress {
        let pb = ProgressBar::new(configs.len() as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        Some(pb)
    } else {
        None
    };

    let entries: Vec<SweepEntry> = configs
        .par_iter()
        .map(|config| {
            let outcome = PortfolioSimulator::new(config.clone())
                .and_then(|sim| sim.run_panel(panel))
                .map_err(|e| {
                    warn!("Sweep run {} failed: {}", config.strategy_id, e);
                    e.to_string()
                });
            if let Some(pb) = &progress {
                pb.inc(1);
            }
            SweepEntry {
                config: config.clone(),
                outcome,
            }
        })
        .collect();

    if let Some(pb) = progress {
        pb.finish_with_message("done");
    }

    let failed = entries.iter().filter(|e| e.outcome.is_err()).count();
    info!(
        "Sweep finished: {} succeeded, {} failed",
        entries.len() - failed,
        failed
    );

    Ok(entries)
}

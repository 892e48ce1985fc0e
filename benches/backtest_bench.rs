//! Performance benchmarks for the factor engine.
//!
//! Run with: cargo bench

use chrono::{Duration, NaiveDate};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use factorlab::config::{FactorConfig, SelectionRule, WeightingMethod};
use factorlab::data::Panel;
use factorlab::features::{build_observations, RollingFeature, SignalKind};
use factorlab::ranker::CrossSectionalRanker;
use factorlab::simulator::PortfolioSimulator;
use factorlab::sweep::{interval_grid, run_sweep};
use factorlab::types::Observation;
use factorlab::weights::PositionWeighter;

fn start() -> NaiveDate {
    NaiveDate::from_ymd_opt(2020, 1, 1).unwrap()
}

/// Generate a synthetic universe of daily returns.
fn generate_panel(symbols: usize, days: usize) -> Panel {
    let mut panel = Panel::new();
    for s in 0..symbols {
        let symbol = format!("SYM{:03}", s);
        let amplitude = 0.005 + 0.0005 * s as f64;
        for d in 0..days {
            let noise = ((d as f64 * 0.7 + s as f64).sin() * 2.0 + (d as f64 * 1.3).cos()) * 0.5;
            panel
                .push_row(
                    &symbol,
                    start() + Duration::days(d as i64),
                    [("return", Some(noise * amplitude))],
                )
                .unwrap();
        }
    }
    panel
}

fn generate_cross_section(size: usize) -> Vec<Observation> {
    (0..size)
        .map(|i| {
            let signal = (i as f64 * 0.37).sin();
            Observation::new(start(), format!("SYM{:03}", i), Some(signal), Some(0.0))
                .with_volatility(0.1 + (i as f64 * 0.11).cos().abs())
        })
        .collect()
}

fn bench_config(interval: u32) -> FactorConfig {
    FactorConfig {
        strategy_id: "bench".to_string(),
        lookback_window: 30,
        volatility_window: 30,
        rebalance_interval_days: interval,
        ..FactorConfig::default()
    }
}

/// Benchmark rolling signal computation.
fn bench_features(c: &mut Criterion) {
    let mut group = c.benchmark_group("features");

    for size in [252, 1000, 5000].iter() {
        let values: Vec<Option<f64>> = (0..*size)
            .map(|i| Some((i as f64 * 0.7).sin() * 0.01))
            .collect();

        for kind in [SignalKind::Volatility, SignalKind::Kurtosis, SignalKind::DurbinWatson] {
            let Some(function) = kind.function(1.0) else {
                continue;
            };
            let feature = RollingFeature::new(function, 30, 0.7);
            group.bench_with_input(BenchmarkId::new(kind.name(), size), &values, |b, values| {
                b.iter(|| feature.apply(black_box(values)))
            });
        }
    }

    let panel = generate_panel(50, 500);
    let config = bench_config(7);
    group.bench_function("build_observations_50x500", |b| {
        b.iter(|| build_observations(black_box(&panel), &config))
    });

    group.finish();
}

/// Benchmark ranking and weighting of one cross-section.
fn bench_ranking(c: &mut Criterion) {
    let mut group = c.benchmark_group("ranking");

    for size in [20, 200, 2000].iter() {
        let observations = generate_cross_section(*size);
        let ranker = CrossSectionalRanker::new(SelectionRule::default(), Default::default());

        group.bench_with_input(BenchmarkId::new("rank", size), &observations, |b, obs| {
            b.iter(|| ranker.rank(start(), black_box(obs)))
        });

        let Ok(assignment) = ranker.rank(start(), &observations) else {
            continue;
        };
        for method in [WeightingMethod::EqualWeight, WeightingMethod::RiskParity] {
            let weighter = PositionWeighter::new(method, 0.5, 0.5);
            group.bench_with_input(
                BenchmarkId::new(format!("weigh_{:?}", method), size),
                &assignment,
                |b, assignment| b.iter(|| weighter.weigh(black_box(assignment))),
            );
        }
    }

    group.finish();
}

/// Benchmark full simulations.
fn bench_simulation(c: &mut Criterion) {
    let mut group = c.benchmark_group("simulation");
    group.sample_size(20);

    for symbols in [20, 100].iter() {
        let panel = generate_panel(*symbols, 500);
        let config = bench_config(7);
        let sections = build_observations(&panel, &config).unwrap();
        let simulator = PortfolioSimulator::new(config).unwrap();

        group.bench_with_input(BenchmarkId::new("weekly_500d", symbols), &sections, |b, sections| {
            b.iter(|| simulator.run(black_box(sections)))
        });
    }

    let panel = generate_panel(50, 500);
    let configs = interval_grid(&bench_config(7), &[1, 7, 14, 30]);
    group.bench_function("sweep_4_intervals", |b| {
        b.iter(|| run_sweep(black_box(&panel), &configs, false))
    });

    group.finish();
}

criterion_group!(benches, bench_features, bench_ranking, bench_simulation);
criterion_main!(benches);

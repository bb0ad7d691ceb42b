//! End-to-end optimizer runs over small synthetic series

use std::sync::Arc;

use engine::{
    initial_population, next_generation, repair, BacktestEngine, BaseConfig, Feature,
    GeneticOptimizer, Kline, OptimizeProgress, OptimizerConfig, ParamKey,
    ParameterVector, RangeCatalog,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

const HOUR_MS: i64 = 3_600_000;

fn bar(i: usize, price: Decimal) -> Kline {
    Kline {
        open_time: i as i64 * HOUR_MS,
        open: price,
        high: price,
        low: price,
        close: price,
        volume: dec!(5),
        close_time: (i as i64 + 1) * HOUR_MS - 1,
    }
}

fn flat(bars: usize) -> Arc<[Kline]> {
    (0..bars).map(|i| bar(i, dec!(100))).collect()
}

/// Slow oscillation with a downward drift, enough to trigger several cycles
fn choppy(bars: usize) -> Arc<[Kline]> {
    (0..bars)
        .map(|i| {
            let x = i as f64;
            let p = 120.0 - 0.05 * x + 10.0 * (x / 7.0).sin() + 3.0 * (x / 2.5).cos();
            let price = Decimal::from_str_exact(&format!("{:.2}", p)).unwrap();
            bar(i, price)
        })
        .collect()
}

fn base_with(features: &[Feature]) -> BaseConfig {
    BaseConfig {
        features: features.iter().copied().collect(),
        ..Default::default()
    }
}

fn config(population_size: usize, generations: u32, max_concurrency: usize) -> OptimizerConfig {
    OptimizerConfig {
        population_size,
        generations,
        elite_size: 2,
        max_concurrency,
        seed: 1234,
        ..Default::default()
    }
}

async fn optimize(
    base: BaseConfig,
    config: OptimizerConfig,
    klines: Arc<[Kline]>,
) -> engine::OptimizationOutcome {
    let catalog = RangeCatalog::for_base(&base);
    GeneticOptimizer::new(config, base, catalog)
        .unwrap()
        .run(klines, Arc::new(OptimizeProgress::new()))
        .await
        .unwrap()
}

fn pairs_ordered(params: &ParameterVector) -> bool {
    ParamKey::PAIRS
        .iter()
        .all(|(lo, hi)| match (lo.get(params), hi.get(params)) {
            (Some(l), Some(h)) => l < h,
            _ => true,
        })
}

#[tokio::test]
async fn flat_market_never_trades() {
    let outcome = optimize(base_with(&[]), config(10, 3, 4), flat(50)).await;

    assert_eq!(outcome.metrics.total_trades, 0);
    assert_eq!(outcome.metrics.buy_orders, 0);
    assert_eq!(outcome.metrics.total_return_pct, Decimal::ZERO);
    assert_eq!(outcome.fitness, Decimal::ZERO);
    assert_eq!(outcome.history.len(), 3);
    for stats in &outcome.history {
        assert_eq!(stats.best, Decimal::ZERO);
        assert_eq!(stats.failed, 0);
    }
}

#[tokio::test]
async fn same_seed_same_outcome() {
    let base = base_with(&[Feature::Rsi, Feature::EmaCross, Feature::Regime]);
    let klines = choppy(300);
    let a = optimize(base.clone(), config(12, 4, 4), Arc::clone(&klines)).await;
    let b = optimize(base, config(12, 4, 4), klines).await;
    assert_eq!(a, b);
}

#[tokio::test]
async fn different_seed_still_valid() {
    let base = base_with(&[Feature::Rsi]);
    let mut other = config(12, 3, 4);
    other.seed = 99;
    let outcome = optimize(base, other, choppy(200)).await;
    assert!(outcome.best_params.validate().is_ok());
    assert!(pairs_ordered(&outcome.best_params));
}

#[tokio::test]
async fn concurrency_cap_is_invisible_in_results() {
    let base = base_with(&[Feature::Sma, Feature::VolatilitySpacing]);
    let klines = choppy(250);
    let serial = optimize(base.clone(), config(10, 3, 1), Arc::clone(&klines)).await;
    let wide = optimize(base, config(10, 3, 8), klines).await;
    assert_eq!(serial, wide);
}

#[tokio::test]
async fn best_ever_never_decreases() {
    let outcome = optimize(
        base_with(&[Feature::Rsi, Feature::Bollinger]),
        config(14, 6, 4),
        choppy(300),
    )
    .await;

    let mut previous: Option<Decimal> = None;
    for stats in &outcome.history {
        let current = stats.best_ever.expect("some candidate scored");
        if let Some(prev) = previous {
            assert!(current >= prev, "best-ever fell from {prev} to {current}");
        }
        // Elites survive, so the generation best cannot drop either
        assert!(stats.best >= previous.unwrap_or(stats.best));
        previous = Some(current);
    }
    assert_eq!(previous, Some(outcome.fitness));
}

#[tokio::test]
async fn champion_rerun_matches_standalone_backtest() {
    let base = base_with(&[Feature::EmaCross, Feature::Regime]);
    let klines = choppy(260);
    let outcome = optimize(base.clone(), config(8, 3, 3), Arc::clone(&klines)).await;

    let standalone = BacktestEngine::run(&outcome.best_params, &base, &klines).unwrap();
    assert_eq!(outcome.metrics, standalone);
    assert_eq!(outcome.fitness, standalone.total_return_pct);
    assert!(outcome.metrics.regime.is_some());
}

#[test]
fn inverted_rsi_thresholds_are_swapped() {
    let base = base_with(&[Feature::Rsi]);
    let catalog = RangeCatalog::for_base(&base);
    let mut params = ParameterVector::from_base(&base);
    ParamKey::RsiOversold.set(&mut params, dec!(40));
    ParamKey::RsiOverbought.set(&mut params, dec!(30));

    repair(&mut params, &catalog);

    assert_eq!(ParamKey::RsiOversold.get(&params), Some(dec!(30)));
    assert_eq!(ParamKey::RsiOverbought.get(&params), Some(dec!(40)));
}

#[test]
fn bred_generations_keep_invariants_and_elite_scores() {
    let base = base_with(&[Feature::Rsi, Feature::EmaCross, Feature::Regime]);
    let catalog = RangeCatalog::for_base(&base);
    let cfg = OptimizerConfig {
        crossover_rate: 1.0,
        mutation_rate: 0.5,
        ..config(16, 1, 1)
    };
    let klines = choppy(150);
    let mut rng = StdRng::seed_from_u64(5);

    let mut population = initial_population(cfg.population_size, &base, &catalog, &mut rng);
    for _ in 0..5 {
        for candidate in population.candidates.iter_mut().filter(|c| !c.is_scored()) {
            let metrics = BacktestEngine::run(&candidate.params, &base, &klines).unwrap();
            candidate.score(metrics);
        }
        population.sort_descending_by_fitness();
        let elite = population.elite(cfg.elite_size);

        let next = next_generation(&population, &cfg, &catalog, &mut rng);
        assert_eq!(next.len(), cfg.population_size);
        assert_eq!(&next.candidates[..cfg.elite_size], elite.as_slice());
        for child in &next.candidates[cfg.elite_size..] {
            assert!(pairs_ordered(&child.params));
            assert!(child.params.validate().is_ok());
            // Crossover always fires at rate 1.0, so every bred child is rescored
            assert!(!child.is_scored());
            assert!(child.metrics.is_none());
        }
        population = next;
    }
}

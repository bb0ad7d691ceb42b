//! DCA Tuner: genetic parameter search for a DCA accumulation strategy
//!
//! Usage:
//!   dca-tuner optimize --data klines.json --features rsi,ema_cross
//!   dca-tuner backtest --data klines.json --params best.json

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use engine::{
    load_validated, parse_features, BacktestEngine, BaseConfig, GeneticOptimizer,
    JsonFileSource, LoadRequest, MetricsBundle, OptimizationOutcome, OptimizeProgress,
    OptimizeStatus, OptimizerConfig, ParameterVector, RangeCatalog,
};
use rust_decimal::Decimal;
use tracing::info;

const APP_VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "-", env!("GIT_HASH"));

#[derive(Parser)]
#[command(name = "dca-tuner")]
#[command(about = "Genetic parameter search for DCA strategies", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true, env = "DCA_TUNER_VERBOSE")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evolve strategy parameters against a price series
    Optimize {
        #[command(flatten)]
        market: MarketArgs,
        /// Population size
        #[arg(long, env = "DCA_TUNER_POPULATION", default_value_t = 50)]
        population: usize,
        /// Number of generations
        #[arg(long, env = "DCA_TUNER_GENERATIONS", default_value_t = 20)]
        generations: u32,
        /// Tournament size
        #[arg(long, env = "DCA_TUNER_TOURNAMENT", default_value_t = 3)]
        tournament: usize,
        #[arg(long, env = "DCA_TUNER_CROSSOVER_RATE", default_value_t = 0.8)]
        crossover_rate: f64,
        #[arg(long, env = "DCA_TUNER_MUTATION_RATE", default_value_t = 0.1)]
        mutation_rate: f64,
        /// Candidates carried unchanged into the next generation
        #[arg(long, env = "DCA_TUNER_ELITE", default_value_t = 2)]
        elite: usize,
        /// Maximum parallel backtests (default: available cores)
        #[arg(long, env = "DCA_TUNER_MAX_CONCURRENCY")]
        max_concurrency: Option<usize>,
        #[arg(long, env = "DCA_TUNER_SEED", default_value_t = 42)]
        seed: u64,
        /// Per-candidate backtest timeout in seconds
        #[arg(long, env = "DCA_TUNER_TIMEOUT_SECS")]
        timeout_secs: Option<u64>,
        /// Optional JSON export path
        #[arg(long, env = "DCA_TUNER_EXPORT")]
        export: Option<PathBuf>,
    },
    /// Backtest a single parameter vector
    Backtest {
        #[command(flatten)]
        market: MarketArgs,
        /// JSON parameter vector; defaults derived from the base config when omitted
        #[arg(long)]
        params: Option<PathBuf>,
    },
}

#[derive(Args)]
struct MarketArgs {
    /// Kline JSON file (Kline objects or Binance rows)
    #[arg(long, env = "DCA_TUNER_DATA")]
    data: PathBuf,
    /// Base configuration JSON; flags below override it
    #[arg(long, env = "DCA_TUNER_BASE_CONFIG")]
    base_config: Option<PathBuf>,
    #[arg(long, env = "DCA_TUNER_SYMBOL")]
    symbol: Option<String>,
    #[arg(long, env = "DCA_TUNER_INTERVAL")]
    interval: Option<String>,
    /// Enabled features (comma-separated): rsi, sma, ema_cross, bollinger,
    /// volatility_spacing, regime
    #[arg(long, env = "DCA_TUNER_FEATURES")]
    features: Option<String>,
    #[arg(long, env = "DCA_TUNER_CAPITAL")]
    capital: Option<Decimal>,
    /// Commission as a fraction of notional (e.g., 0.001)
    #[arg(long, env = "DCA_TUNER_COMMISSION")]
    commission: Option<Decimal>,
    /// First bar to use (RFC 3339)
    #[arg(long)]
    start: Option<DateTime<Utc>>,
    /// Last bar to use (RFC 3339)
    #[arg(long)]
    end: Option<DateTime<Utc>>,
}

impl MarketArgs {
    fn base_config(&self) -> anyhow::Result<BaseConfig> {
        let mut base = match &self.base_config {
            Some(path) => read_json::<BaseConfig>(path)?,
            None => BaseConfig::default(),
        };
        if let Some(symbol) = &self.symbol {
            base.symbol = symbol.clone();
        }
        if let Some(interval) = &self.interval {
            base.interval = interval.clone();
        }
        if let Some(features) = &self.features {
            base.features = parse_features(features)?;
        }
        if let Some(capital) = self.capital {
            base.initial_capital = capital;
        }
        if let Some(commission) = self.commission {
            base.commission_rate = commission;
        }
        Ok(base)
    }

    fn load_request(&self, base: &BaseConfig) -> LoadRequest {
        LoadRequest {
            symbol: base.symbol.clone(),
            interval: base.interval.clone(),
            start: self.start,
            end: self.end,
        }
    }
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("debug,engine=debug,dca_tuner=debug")
    } else {
        EnvFilter::new("info,engine=info,dca_tuner=info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).compact())
        .with(filter)
        .init();
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Invalid JSON in {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Optimize {
            market,
            population,
            generations,
            tournament,
            crossover_rate,
            mutation_rate,
            elite,
            max_concurrency,
            seed,
            timeout_secs,
            export,
        } => {
            let defaults = OptimizerConfig::default();
            let config = OptimizerConfig {
                population_size: population,
                generations,
                tournament_size: tournament,
                crossover_rate,
                mutation_rate,
                elite_size: elite,
                max_concurrency: max_concurrency.unwrap_or(defaults.max_concurrency),
                seed,
                evaluation_timeout: timeout_secs.map(Duration::from_secs),
            };
            cmd_optimize(market, config, export).await?;
        }
        Commands::Backtest { market, params } => {
            cmd_backtest(market, params).await?;
        }
    }

    Ok(())
}

// ============================================================================
// Optimize command
// ============================================================================

async fn cmd_optimize(
    market: MarketArgs,
    config: OptimizerConfig,
    export: Option<PathBuf>,
) -> anyhow::Result<()> {
    println!("\n=== DCA Tuner v{} ===", APP_VERSION);

    let base = market.base_config()?;
    let catalog = RangeCatalog::for_base(&base);
    let optimizer = GeneticOptimizer::new(config.clone(), base.clone(), catalog)
        .context("Invalid optimizer configuration")?;

    let source = JsonFileSource::new(&market.data);
    let klines = load_validated(&source, &market.load_request(&base)).await?;

    println!("Data: {} ({} bars)", market.data.display(), klines.len());
    println!(
        "Symbol: {} {} | Features: {}",
        base.symbol,
        base.interval,
        if base.features.is_empty() {
            "none".to_string()
        } else {
            base.features
                .iter()
                .map(|f| f.name())
                .collect::<Vec<_>>()
                .join(", ")
        }
    );
    println!(
        "Population: {} | Generations: {} | Elite: {} | Workers: {} | Seed: {}",
        config.population_size,
        config.generations,
        config.elite_size,
        config.max_concurrency,
        config.seed
    );
    println!("Press Ctrl+C to stop after the current generation\n");

    let progress = Arc::new(OptimizeProgress::new());

    let progress_for_ctrlc = progress.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl+C received, requesting cancel...");
        progress_for_ctrlc.cancel();
    });

    let progress_clone = progress.clone();
    let handle = tokio::spawn(async move { optimizer.run(klines, progress_clone).await });

    // Progress display loop
    while !handle.is_finished() {
        tokio::time::sleep(Duration::from_millis(500)).await;
        if progress.status() != OptimizeStatus::Running {
            continue;
        }
        let pct = progress.progress_pct();
        let bar_len = 30;
        let filled = ((pct as usize) * bar_len / 100).min(bar_len);
        let bar: String = "=".repeat(filled) + &" ".repeat(bar_len - filled);
        let best = progress
            .best()
            .map(|b| format!("{:.2}%", b))
            .unwrap_or_else(|| "-".to_string());
        print!(
            "\r  Generation {}/{} [{}] {:.0}% ({} backtests) | Best: {}   ",
            progress.generation.load(Ordering::Relaxed),
            progress.total_generations.load(Ordering::Relaxed),
            bar,
            pct,
            progress.completed.load(Ordering::Relaxed),
            best
        );
    }
    println!();

    let outcome = handle.await.context("Optimizer task panicked")??;
    print_outcome(&outcome);

    if let Some(path) = export {
        let mut export_data = outcome.to_json();
        export_data["version"] = serde_json::Value::from(APP_VERSION);
        export_data["base"] = serde_json::to_value(&base)?;
        export_data["params"] = serde_json::to_value(&outcome.best_params)?;
        let json = serde_json::to_string_pretty(&export_data)?;
        std::fs::write(&path, &json)
            .with_context(|| format!("Cannot write {}", path.display()))?;
        println!("\nResults exported to {}", path.display());
    }

    Ok(())
}

fn print_outcome(outcome: &OptimizationOutcome) {
    println!("\nConvergence:");
    println!(
        "  {:>4}  {:>10} {:>10} {:>10} {:>6} {:>6}",
        "Gen", "Best%", "Avg%", "Worst%", "Evals", "Fail"
    );
    println!("  {}", "-".repeat(52));
    for g in &outcome.history {
        println!(
            "  {:>4}  {:>10} {:>10} {:>10} {:>6} {:>6}",
            g.generation,
            fmt_fitness(g.best),
            g.average.map(fmt_fitness).unwrap_or_else(|| "-".to_string()),
            fmt_fitness(g.worst),
            g.evaluated,
            g.failed,
        );
    }

    println!("\nBest parameters:");
    if let Some(map) = outcome.best_params.to_key_values().as_object() {
        for (key, value) in map {
            println!("  {:<24} {}", key, value);
        }
    }

    print_metrics(&outcome.metrics);
    println!("\n  Backtests run: {}", outcome.evaluations);
}

fn fmt_fitness(value: Decimal) -> String {
    if value == engine::MIN_FITNESS {
        "failed".to_string()
    } else {
        format!("{:.2}", value)
    }
}

fn print_metrics(m: &MetricsBundle) {
    println!("\nMetrics:");
    println!("  {:<20} {:>+12.2}%", "Total return", m.total_return_pct);
    println!("  {:<20} {:>+12.2}%", "Annualized return", m.annualized_return_pct);
    println!("  {:<20} {:>12.2}", "Final equity", m.final_equity);
    println!("  {:<20} {:>12.2}%", "Max drawdown", m.max_drawdown_pct);
    println!(
        "  {:<20} {:>12}",
        "Cycles (won/lost)",
        format!("{} ({}/{})", m.total_trades, m.winning_trades, m.losing_trades)
    );
    println!("  {:<20} {:>12.1}%", "Win rate", m.win_rate);
    println!("  {:<20} {:>12}", "Buy orders", m.buy_orders);
    println!("  {:<20} {:>12.2}", "Fees", m.total_fees);
    println!("  {:<20} {:>12.2}", "Sharpe", m.sharpe_ratio);
    println!("  {:<20} {:>12.2}", "Sortino", m.sortino_ratio);
    println!("  {:<20} {:>12.2}", "Calmar", m.calmar_ratio);
    println!("  {:<20} {:>12.4}", "VaR 95", m.var_95);
    if let Some(regime) = &m.regime {
        println!(
            "  {:<20} {:>12}",
            "Regime changes", regime.regime_changes
        );
        for (engine, share) in &regime.engine_utilization {
            let pnl = regime.engine_pnl.get(engine).copied().unwrap_or_default();
            println!(
                "    {:<18} {:>6.1}% of bars, P&L {:>+10.2}",
                format!("{:?}", engine),
                share * 100.0,
                pnl
            );
        }
    }
}

// ============================================================================
// Backtest command
// ============================================================================

async fn cmd_backtest(market: MarketArgs, params: Option<PathBuf>) -> anyhow::Result<()> {
    println!("\n=== DCA Tuner v{} ===", APP_VERSION);

    let base = market.base_config()?;
    let params = match params {
        Some(path) => read_json::<ParameterVector>(&path)?,
        None => ParameterVector::from_base(&base),
    };
    params.validate().context("Parameter vector does not match its features")?;

    let source = JsonFileSource::new(&market.data);
    let klines = load_validated(&source, &market.load_request(&base)).await?;
    println!("Data: {} ({} bars)", market.data.display(), klines.len());

    let metrics = BacktestEngine::run(&params, &base, &klines)?;
    print_metrics(&metrics);
    Ok(())
}

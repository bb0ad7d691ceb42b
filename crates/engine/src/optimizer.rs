//! Genetic parameter optimization for the DCA strategy
//!
//! Evolves a population of parameter vectors over a fixed number of
//! generations. Unscored candidates are backtested on the blocking pool
//! under a semaphore cap; results are written back by candidate index so
//! the degree of parallelism never changes the outcome. The champion is
//! re-run serially at the end and that run is the authoritative result.

use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc, RwLock,
};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::catalog::RangeCatalog;
use crate::engine::BacktestEngine;
use crate::error::{ConfigError, EvaluationError, OptimizerError, OptimizerResult};
use crate::genetic::{initial_population, next_generation};
use crate::loader::validate_klines;
use crate::metrics::MetricsBundle;
use crate::params::{ParamKey, ParameterVector};
use crate::population::{Candidate, Population};
use crate::types::{BaseConfig, Kline};

// ============================================================================
// Types
// ============================================================================

/// Search settings. These shape the search, not the strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub population_size: usize,
    pub generations: u32,
    /// Draws per tournament; 0 behaves as 1
    pub tournament_size: usize,
    pub crossover_rate: f64,
    pub mutation_rate: f64,
    /// Candidates carried unchanged into the next generation
    pub elite_size: usize,
    /// Maximum backtests in flight at once
    pub max_concurrency: usize,
    pub seed: u64,
    /// Per-candidate limit; a candidate that exceeds it scores minimum fitness
    pub evaluation_timeout: Option<Duration>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            population_size: 50,
            generations: 20,
            tournament_size: 3,
            crossover_rate: 0.8,
            mutation_rate: 0.1,
            elite_size: 2,
            max_concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            seed: 42,
            evaluation_timeout: None,
        }
    }
}

impl OptimizerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::InvalidSetting(msg));

        if self.population_size == 0 {
            return invalid("population_size must be at least 1".into());
        }
        if self.generations == 0 {
            return invalid("generations must be at least 1".into());
        }
        if self.max_concurrency == 0 {
            return invalid("max_concurrency must be at least 1".into());
        }
        if self.elite_size > self.population_size {
            return invalid(format!(
                "elite_size {} exceeds population_size {}",
                self.elite_size, self.population_size
            ));
        }
        for (name, rate) in [
            ("crossover_rate", self.crossover_rate),
            ("mutation_rate", self.mutation_rate),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                return invalid(format!("{name} must be within [0, 1], got {rate}"));
            }
        }
        if self.evaluation_timeout == Some(Duration::ZERO) {
            return invalid("evaluation_timeout must be positive".into());
        }
        Ok(())
    }
}

/// Fitness summary of one generation, taken after its evaluation barrier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationStats {
    pub generation: u32,
    pub best: Decimal,
    /// Mean over successful evaluations, `None` when every candidate failed
    pub average: Option<Decimal>,
    pub worst: Decimal,
    /// Champion fitness after this generation
    pub best_ever: Option<Decimal>,
    /// Backtests run in this generation (elites are not re-run)
    pub evaluated: usize,
    pub failed: usize,
}

/// Final result record of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationOutcome {
    pub best_params: ParameterVector,
    /// Metrics of the serial re-run of the champion
    pub metrics: MetricsBundle,
    pub fitness: Decimal,
    pub history: Vec<GenerationStats>,
    pub evaluations: usize,
}

impl OptimizationOutcome {
    /// Export form: parameters as flat key/values, metrics and history as-is
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "best_params": self.best_params.to_key_values(),
            "fitness": self.fitness,
            "metrics": self.metrics,
            "history": self.history,
            "evaluations": self.evaluations,
        })
    }
}

/// Optimization run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizeStatus {
    Idle,
    Running,
    Finalizing,
    Complete,
    Error,
}

/// Shared progress tracker between the optimizer and whoever watches it
pub struct OptimizeProgress {
    pub status: RwLock<OptimizeStatus>,
    pub total_generations: AtomicU32,
    pub generation: AtomicU32,
    /// Backtests dispatched in the current generation
    pub pending: AtomicU32,
    /// Backtests finished over the whole run
    pub completed: AtomicU32,
    pub failed: AtomicU32,
    /// Stops reproduction after the current generation; the champion so far
    /// is still finalized
    pub cancelled: AtomicBool,
    pub best_fitness: RwLock<Option<Decimal>>,
    pub error_message: RwLock<Option<String>>,
}

impl OptimizeProgress {
    pub fn new() -> Self {
        Self {
            status: RwLock::new(OptimizeStatus::Idle),
            total_generations: AtomicU32::new(0),
            generation: AtomicU32::new(0),
            pending: AtomicU32::new(0),
            completed: AtomicU32::new(0),
            failed: AtomicU32::new(0),
            cancelled: AtomicBool::new(false),
            best_fitness: RwLock::new(None),
            error_message: RwLock::new(None),
        }
    }

    /// Reset for a new optimization run
    pub fn reset(&self, total_generations: u32) {
        self.set_status(OptimizeStatus::Running);
        self.total_generations.store(total_generations, Ordering::Relaxed);
        self.generation.store(0, Ordering::Relaxed);
        self.pending.store(0, Ordering::Relaxed);
        self.completed.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        self.cancelled.store(false, Ordering::Relaxed);
        if let Ok(mut best) = self.best_fitness.write() {
            *best = None;
        }
        if let Ok(mut msg) = self.error_message.write() {
            *msg = None;
        }
    }

    pub fn status(&self) -> OptimizeStatus {
        self.status
            .read()
            .map(|s| *s)
            .unwrap_or(OptimizeStatus::Error)
    }

    fn set_status(&self, status: OptimizeStatus) {
        if let Ok(mut current) = self.status.write() {
            *current = status;
        }
    }

    fn set_best(&self, fitness: Decimal) {
        if let Ok(mut best) = self.best_fitness.write() {
            *best = Some(fitness);
        }
    }

    fn fail(&self, message: String) {
        if let Ok(mut msg) = self.error_message.write() {
            *msg = Some(message);
        }
        self.set_status(OptimizeStatus::Error);
    }

    pub fn best(&self) -> Option<Decimal> {
        self.best_fitness.read().ok().and_then(|b| *b)
    }

    pub fn error(&self) -> Option<String> {
        self.error_message.read().ok().and_then(|m| m.clone())
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Get progress as percentage of generations finished
    pub fn progress_pct(&self) -> f32 {
        let total = self.total_generations.load(Ordering::Relaxed);
        let done = self.generation.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            (done as f32 / total as f32) * 100.0
        }
    }

    /// Check if currently running
    pub fn is_running(&self) -> bool {
        matches!(
            self.status(),
            OptimizeStatus::Running | OptimizeStatus::Finalizing
        )
    }
}

impl Default for OptimizeProgress {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Optimizer
// ============================================================================

/// Scores one vector; `BacktestEngine::run` outside of tests
type EvaluateFn = fn(&ParameterVector, &BaseConfig, &[Kline]) -> Result<MetricsBundle, EvaluationError>;

pub struct GeneticOptimizer {
    config: OptimizerConfig,
    base: Arc<BaseConfig>,
    catalog: RangeCatalog,
    evaluate_fn: EvaluateFn,
}

impl GeneticOptimizer {
    /// Fails fast on settings, base configuration or catalog problems.
    ///
    /// Capital is fixed by the base configuration; the catalog's capital
    /// entry is replaced with it.
    pub fn new(
        config: OptimizerConfig,
        base: BaseConfig,
        catalog: RangeCatalog,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        validate_base(&base)?;

        let pinned = [base.initial_capital];
        if catalog.choices(ParamKey::InitialCapital) != pinned.as_slice() {
            debug!(capital = %base.initial_capital, "Pinning catalog capital to base");
        }
        let catalog = catalog.with_entry(ParamKey::InitialCapital, pinned.to_vec());
        catalog.validate(&base.features)?;
        ParameterVector::from_base(&base).validate()?;

        Ok(Self {
            config,
            base: Arc::new(base),
            catalog,
            evaluate_fn: BacktestEngine::run,
        })
    }

    #[cfg(test)]
    fn with_evaluator(mut self, evaluate_fn: EvaluateFn) -> Self {
        self.evaluate_fn = evaluate_fn;
        self
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn base(&self) -> &BaseConfig {
        &self.base
    }

    /// Run every generation and finalize the champion.
    ///
    /// Price data problems are reported before the first generation.
    pub async fn run(
        &self,
        klines: Arc<[Kline]>,
        progress: Arc<OptimizeProgress>,
    ) -> OptimizerResult<OptimizationOutcome> {
        progress.reset(self.config.generations);
        let result = self.run_generations(klines, &progress).await;
        match &result {
            Ok(outcome) => {
                progress.set_best(outcome.fitness);
                progress.set_status(OptimizeStatus::Complete);
            }
            Err(e) => progress.fail(e.to_string()),
        }
        result
    }

    async fn run_generations(
        &self,
        klines: Arc<[Kline]>,
        progress: &OptimizeProgress,
    ) -> OptimizerResult<OptimizationOutcome> {
        validate_klines(&klines)?;

        let config = &self.config;
        let mut rng = StdRng::seed_from_u64(config.seed);

        info!(
            symbol = %self.base.symbol,
            bars = klines.len(),
            population = config.population_size,
            generations = config.generations,
            max_concurrency = config.max_concurrency,
            seed = config.seed,
            features = ?self.base.features,
            "Starting genetic optimization"
        );

        let mut population =
            initial_population(config.population_size, &self.base, &self.catalog, &mut rng);
        // One cap for the whole run: a timed-out backtest keeps its permit
        // until it really finishes, across generation boundaries
        let slots = Arc::new(Semaphore::new(config.max_concurrency));
        let mut champion: Option<Candidate> = None;
        let mut history: Vec<GenerationStats> = Vec::with_capacity(config.generations as usize);
        let mut evaluations = 0usize;

        for generation in 1..=config.generations {
            let (evaluated, failed) = self.evaluate(&mut population, &klines, &slots, progress).await;
            evaluations += evaluated;

            population.sort_descending_by_fitness();

            // Deep copy: the live candidate is bred over next generation
            if let Some(best) = population.best().filter(|c| !c.failed && c.is_scored()) {
                let improves = champion
                    .as_ref()
                    .map_or(true, |c| best.rank_fitness() > c.rank_fitness());
                if improves {
                    debug!(generation, fitness = %best.rank_fitness(), "New champion");
                    progress.set_best(best.rank_fitness());
                    champion = Some(best.clone());
                }
            }

            let stats = GenerationStats {
                generation,
                best: population.best().map_or(Decimal::ZERO, |c| c.rank_fitness()),
                average: population.average_fitness(),
                worst: population.worst().map_or(Decimal::ZERO, |c| c.rank_fitness()),
                best_ever: champion.as_ref().and_then(|c| c.fitness),
                evaluated,
                failed,
            };
            info!(
                generation,
                best = %stats.best,
                average = ?stats.average,
                worst = %stats.worst,
                evaluated,
                failed,
                "Generation complete"
            );
            history.push(stats);
            progress.generation.store(generation, Ordering::Relaxed);

            if generation == config.generations {
                break;
            }
            if progress.is_cancelled() {
                warn!(generation, "Optimization cancelled");
                break;
            }
            population = next_generation(&population, config, &self.catalog, &mut rng);
        }

        // Abandoned backtests must finish before the serial re-run
        let workers = u32::try_from(config.max_concurrency).unwrap_or(u32::MAX);
        if let Err(e) = slots.acquire_many(workers).await {
            warn!(error = %e, "Could not drain evaluation slots");
        }

        let champion = champion.ok_or(OptimizerError::NoViableCandidate)?;

        progress.set_status(OptimizeStatus::Finalizing);
        let metrics = BacktestEngine::run(&champion.params, &self.base, &klines)?;
        if champion.fitness != Some(metrics.total_return_pct) {
            warn!(
                parallel = ?champion.fitness,
                serial = %metrics.total_return_pct,
                "Champion re-run differs from its parallel score"
            );
        }

        info!(
            fitness = %metrics.total_return_pct,
            trades = metrics.total_trades,
            max_drawdown_pct = %metrics.max_drawdown_pct,
            evaluations,
            "Optimization complete"
        );

        Ok(OptimizationOutcome {
            best_params: champion.params,
            fitness: metrics.total_return_pct,
            metrics,
            history,
            evaluations,
        })
    }

    /// Backtest every unscored candidate. Returns (evaluated, failed).
    async fn evaluate(
        &self,
        population: &mut Population,
        klines: &Arc<[Kline]>,
        slots: &Arc<Semaphore>,
        progress: &OptimizeProgress,
    ) -> (usize, usize) {
        let pending = population.unscored_indices();
        progress.pending.store(pending.len() as u32, Ordering::Relaxed);

        let mut jobs: JoinSet<(usize, Result<MetricsBundle, EvaluationError>)> = JoinSet::new();

        for &index in &pending {
            // Blocks dispatch while the cap is reached
            let permit = match Arc::clone(slots).acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    warn!(index, error = %e, "Evaluation slot unavailable");
                    continue;
                }
            };
            let params = population.candidates[index].params.clone();
            let base = Arc::clone(&self.base);
            let klines = Arc::clone(klines);
            let timeout = self.config.evaluation_timeout;
            let evaluate_fn = self.evaluate_fn;

            jobs.spawn(async move {
                let handle = tokio::task::spawn_blocking(move || {
                    // Held until the backtest really ends, even past a timeout
                    let _permit = permit;
                    evaluate_fn(&params, &base, &klines[..])
                });
                let joined = match timeout {
                    Some(limit) => match tokio::time::timeout(limit, handle).await {
                        Ok(joined) => joined,
                        Err(_) => {
                            return (
                                index,
                                Err(EvaluationError::Aborted(format!("timed out after {limit:?}"))),
                            )
                        }
                    },
                    None => handle.await,
                };
                let result = joined.unwrap_or_else(|e| Err(EvaluationError::Aborted(e.to_string())));
                (index, result)
            });
        }

        let mut evaluated = 0usize;
        let mut failed = 0usize;
        while let Some(joined) = jobs.join_next().await {
            evaluated += 1;
            progress.completed.fetch_add(1, Ordering::Relaxed);
            match joined {
                Ok((index, Ok(metrics))) => population.candidates[index].score(metrics),
                Ok((index, Err(e))) => {
                    warn!(index, error = %e, "Candidate evaluation failed");
                    population.candidates[index].mark_failed();
                    failed += 1;
                }
                Err(e) => warn!(error = %e, "Evaluation task lost"),
            }
        }

        // Anything still unscored never reported back
        for &index in &pending {
            let candidate = &mut population.candidates[index];
            if !candidate.is_scored() {
                candidate.mark_failed();
                failed += 1;
            }
        }

        progress.failed.fetch_add(failed as u32, Ordering::Relaxed);
        (evaluated, failed)
    }
}

fn validate_base(base: &BaseConfig) -> Result<(), ConfigError> {
    let invalid = |msg: &str| Err(ConfigError::InvalidSetting(msg.to_string()));
    if base.initial_capital <= Decimal::ZERO {
        return invalid("initial_capital must be positive");
    }
    if base.commission_rate < Decimal::ZERO || base.commission_rate >= Decimal::ONE {
        return invalid("commission_rate must be within [0, 1)");
    }
    if base.base_order_pct <= Decimal::ZERO {
        return invalid("base_order_pct must be positive");
    }
    if base.max_dca_levels == 0 {
        return invalid("max_dca_levels must be at least 1");
    }
    Ok(())
}

// ============================================================================
// Entry point
// ============================================================================

/// Request to start an optimization
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizeRequest {
    pub base: BaseConfig,
    pub optimizer: OptimizerConfig,
}

/// Build an optimizer over the standard catalog and run it.
pub async fn run_optimization(
    request: OptimizeRequest,
    klines: Arc<[Kline]>,
    progress: Arc<OptimizeProgress>,
) -> OptimizerResult<OptimizationOutcome> {
    let catalog = RangeCatalog::for_base(&request.base);
    let optimizer = match GeneticOptimizer::new(request.optimizer, request.base, catalog) {
        Ok(optimizer) => optimizer,
        Err(e) => {
            progress.fail(e.to_string());
            return Err(e.into());
        }
    };
    optimizer.run(klines, progress).await
}

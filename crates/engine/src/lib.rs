//! DCA Tuner Engine: genetic parameter search over a deterministic backtest
//!
//! Provides:
//! - Discrete parameter catalog and typed parameter vectors
//! - Genetic operators (tournament, uniform crossover, mutation, repair)
//! - DCA strategy with pluggable entry filters, spacing and regime engines
//! - Bar-by-bar backtesting engine used as the fitness oracle
//! - Optimizer loop with bounded parallel evaluation and a serial champion re-run

pub mod catalog;
pub mod engine;
pub mod error;
pub mod fees;
pub mod genetic;
pub mod indicators;
pub mod loader;
pub mod metrics;
pub mod optimizer;
pub mod params;
pub mod population;
pub mod regime;
pub mod spacing;
pub mod strategy;
pub mod types;

// Re-exports for convenience
pub use catalog::RangeCatalog;
pub use engine::BacktestEngine;
pub use error::{ConfigError, DataError, EvaluationError, OptimizerError, OptimizerResult};
pub use fees::calculate_commission;
pub use genetic::{
    crossover, initial_population, mutate, next_generation, random_vector, repair,
    tournament_select,
};
pub use indicators::{build_signal_sources, SignalSource};
pub use loader::{load_validated, validate_klines, JsonFileSource, KlineSource, LoadRequest, MemorySource};
pub use metrics::{MetricsBundle, RegimeMetrics};
pub use optimizer::{
    run_optimization, GenerationStats, GeneticOptimizer, OptimizationOutcome, OptimizeProgress,
    OptimizeRequest, OptimizeStatus, OptimizerConfig,
};
pub use params::{parse_features, Feature, ParamKey, ParameterVector};
pub use population::{Candidate, Population, MIN_FITNESS};
pub use regime::{EngineKind, Regime};
pub use spacing::{build_spacing, SpacingModel};
pub use strategy::{Action, DcaStrategy, PositionView, Signal};
pub use types::*;

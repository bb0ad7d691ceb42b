//! Error taxonomy for the tuner core
//!
//! Configuration and data errors are fatal and surface before the first
//! generation. Evaluation errors are local to one candidate and never abort
//! a run.

use thiserror::Error;

use crate::params::{Feature, ParamKey};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Unknown feature name: {0}")]
    UnknownFeature(String),

    #[error("Catalog entry for {0} is empty")]
    EmptyCatalogEntry(ParamKey),

    #[error("Catalog entry for {key} holds a non-integer or zero period: {value}")]
    InvalidPeriod { key: ParamKey, value: String },

    #[error("Catalog cannot order {lower} below {upper}: every {lower} choice is >= every {upper} choice")]
    UnorderablePair { lower: ParamKey, upper: ParamKey },

    #[error("Feature set inconsistent with parameter blocks: {0:?}")]
    InconsistentFeatures(Feature),

    #[error("Invalid optimizer setting: {0}")]
    InvalidSetting(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DataError {
    #[error("Price series is empty")]
    Empty,

    #[error("Price series is not strictly chronological at bar {index}")]
    NotChronological { index: usize },

    #[error("Price series has a non-positive close at bar {index}")]
    NonPositivePrice { index: usize },

    #[error("Price series could not be loaded: {0}")]
    Load(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvaluationError {
    #[error("Feature {0:?} is enabled but its parameter block is missing")]
    MissingBlock(Feature),

    #[error("Indicator {name} rejected its parameters: {reason}")]
    Indicator { name: &'static str, reason: String },

    #[error("Evaluation did not finish: {0}")]
    Aborted(String),
}

#[derive(Error, Debug)]
pub enum OptimizerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error("No candidate produced a successful evaluation")]
    NoViableCandidate,

    #[error("Champion re-evaluation failed: {0}")]
    Finalize(#[from] EvaluationError),
}

pub type OptimizerResult<T> = Result<T, OptimizerError>;

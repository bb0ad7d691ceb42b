//! Candidates and populations

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::metrics::MetricsBundle;
use crate::params::ParameterVector;

/// Fitness assigned to a candidate whose backtest failed
pub const MIN_FITNESS: Decimal = Decimal::MIN;

/// One parameter vector under evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub params: ParameterVector,
    /// `None` until evaluated
    pub fitness: Option<Decimal>,
    pub metrics: Option<MetricsBundle>,
    /// Set when the last evaluation failed; such candidates never become champion
    pub failed: bool,
}

impl Candidate {
    pub fn new(params: ParameterVector) -> Self {
        Self {
            params,
            fitness: None,
            metrics: None,
            failed: false,
        }
    }

    pub fn is_scored(&self) -> bool {
        self.fitness.is_some()
    }

    /// Fitness used for ranking; unscored sorts with failed candidates at the bottom
    pub fn rank_fitness(&self) -> Decimal {
        self.fitness.unwrap_or(MIN_FITNESS)
    }

    pub fn score(&mut self, metrics: MetricsBundle) {
        self.fitness = Some(metrics.total_return_pct);
        self.metrics = Some(metrics);
        self.failed = false;
    }

    pub fn mark_failed(&mut self) {
        self.fitness = Some(MIN_FITNESS);
        self.metrics = None;
        self.failed = true;
    }

    /// Drop the score and cached metrics. Required whenever the vector changes.
    pub fn reset(&mut self) {
        self.fitness = None;
        self.metrics = None;
        self.failed = false;
    }
}

/// Ordered collection of candidates; duplicate vectors are allowed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Population {
    pub candidates: Vec<Candidate>,
}

impl Population {
    pub fn new(candidates: Vec<Candidate>) -> Self {
        Self { candidates }
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Highest fitness, first encountered on ties
    pub fn best(&self) -> Option<&Candidate> {
        let mut iter = self.candidates.iter();
        let first = iter.next()?;
        Some(iter.fold(first, |best, c| {
            if c.rank_fitness() > best.rank_fitness() {
                c
            } else {
                best
            }
        }))
    }

    /// Lowest fitness, first encountered on ties
    pub fn worst(&self) -> Option<&Candidate> {
        let mut iter = self.candidates.iter();
        let first = iter.next()?;
        Some(iter.fold(first, |worst, c| {
            if c.rank_fitness() < worst.rank_fitness() {
                c
            } else {
                worst
            }
        }))
    }

    /// Stable sort, best first
    pub fn sort_descending_by_fitness(&mut self) {
        self.candidates
            .sort_by(|a, b| b.rank_fitness().cmp(&a.rank_fitness()));
    }

    /// Copies of the top `k` candidates, scores and metrics included
    pub fn elite(&self, k: usize) -> Vec<Candidate> {
        let mut sorted = self.candidates.clone();
        sorted.sort_by(|a, b| b.rank_fitness().cmp(&a.rank_fitness()));
        sorted.truncate(k.min(self.candidates.len()));
        sorted
    }

    /// Mean fitness over scored, non-failed candidates
    pub fn average_fitness(&self) -> Option<Decimal> {
        let scores: Vec<Decimal> = self
            .candidates
            .iter()
            .filter(|c| !c.failed)
            .filter_map(|c| c.fitness)
            .collect();
        if scores.is_empty() {
            return None;
        }
        Some(scores.iter().sum::<Decimal>() / Decimal::from(scores.len()))
    }

    pub fn unscored_indices(&self) -> Vec<usize> {
        self.candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.is_scored())
            .map(|(i, _)| i)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BaseConfig;
    use rust_decimal_macros::dec;

    fn scored(fitness: Decimal, capital: Decimal) -> Candidate {
        let mut params = ParameterVector::from_base(&BaseConfig::default());
        params.initial_capital = capital;
        let mut c = Candidate::new(params);
        let mut metrics = MetricsBundle::empty(capital);
        metrics.total_return_pct = fitness;
        c.score(metrics);
        c
    }

    fn population() -> Population {
        Population::new(vec![
            scored(dec!(1), dec!(100)),
            scored(dec!(5), dec!(200)),
            scored(dec!(-3), dec!(300)),
            scored(dec!(5), dec!(400)),
            scored(dec!(-3), dec!(500)),
        ])
    }

    #[test]
    fn test_best_and_worst_break_ties_by_first_seen() {
        let pop = population();
        assert_eq!(pop.best().unwrap().params.initial_capital, dec!(200));
        assert_eq!(pop.worst().unwrap().params.initial_capital, dec!(300));
        assert!(Population::default().best().is_none());
    }

    #[test]
    fn test_sort_is_stable_and_descending() {
        let mut pop = population();
        pop.sort_descending_by_fitness();
        let capitals: Vec<Decimal> = pop.candidates.iter().map(|c| c.params.initial_capital).collect();
        assert_eq!(
            capitals,
            vec![dec!(200), dec!(400), dec!(100), dec!(300), dec!(500)]
        );
    }

    #[test]
    fn test_elite_is_clamped_and_keeps_metrics() {
        let pop = population();
        let elite = pop.elite(2);
        assert_eq!(elite.len(), 2);
        assert_eq!(elite[0].fitness, Some(dec!(5)));
        assert!(elite[0].metrics.is_some());
        assert_eq!(pop.elite(50).len(), 5);
    }

    #[test]
    fn test_unscored_ranks_last_and_is_listed() {
        let mut pop = population();
        pop.candidates[1].reset();
        assert_eq!(pop.unscored_indices(), vec![1]);
        assert_eq!(pop.best().unwrap().params.initial_capital, dec!(400));
        pop.sort_descending_by_fitness();
        assert!(!pop.candidates.last().unwrap().is_scored());
    }

    #[test]
    fn test_average_skips_failed_and_unscored() {
        let mut pop = population();
        pop.candidates[2].mark_failed();
        pop.candidates[4].reset();
        // (1 + 5 + 5) / 3
        let avg = pop.average_fitness().unwrap();
        assert_eq!(avg.round_dp(4), dec!(3.6667));
        assert!(Population::default().average_fitness().is_none());
    }

    #[test]
    fn test_reset_clears_score_and_metrics() {
        let mut c = scored(dec!(2), dec!(100));
        c.reset();
        assert!(!c.is_scored());
        assert!(c.metrics.is_none());
        assert!(!c.failed);
    }
}

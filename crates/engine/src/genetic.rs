//! Genetic operators over parameter vectors
//!
//! Every operator draws from the `Rng` it is handed. The optimizer owns a
//! single seeded generator and threads it through here, so a run is fully
//! determined by its seed.

use rand::Rng;
use tracing::trace;

use crate::catalog::RangeCatalog;
use crate::optimizer::OptimizerConfig;
use crate::params::{ParamKey, ParameterVector};
use crate::population::{Candidate, Population};
use crate::types::BaseConfig;

/// Fresh vector: blocks follow the base feature set, every active key is
/// drawn uniformly from its catalog entry.
pub fn random_vector<R: Rng + ?Sized>(
    base: &BaseConfig,
    catalog: &RangeCatalog,
    rng: &mut R,
) -> ParameterVector {
    let mut params = ParameterVector::from_base(base);
    let keys: Vec<ParamKey> = params.active_keys().collect();
    for key in keys {
        if let Some(value) = catalog.sample(key, rng) {
            key.set(&mut params, value);
        }
    }
    repair(&mut params, catalog);
    params
}

pub fn initial_population<R: Rng + ?Sized>(
    size: usize,
    base: &BaseConfig,
    catalog: &RangeCatalog,
    rng: &mut R,
) -> Population {
    Population::new(
        (0..size)
            .map(|_| Candidate::new(random_vector(base, catalog, rng)))
            .collect(),
    )
}

/// Best of `size` uniform draws with replacement. First drawn wins ties.
pub fn tournament_select<'a, R: Rng + ?Sized>(
    population: &'a Population,
    size: usize,
    rng: &mut R,
) -> Option<&'a Candidate> {
    let candidates = &population.candidates;
    if candidates.is_empty() {
        return None;
    }
    let mut best = &candidates[rng.gen_range(0..candidates.len())];
    for _ in 1..size.max(1) {
        let challenger = &candidates[rng.gen_range(0..candidates.len())];
        if challenger.rank_fitness() > best.rank_fitness() {
            best = challenger;
        }
    }
    Some(best)
}

/// Uniform crossover. The child starts as a copy of `parent1`; when `rate`
/// fires, each active key takes `parent2`'s value with probability 0.5 and
/// the child's score is dropped.
pub fn crossover<R: Rng + ?Sized>(
    parent1: &Candidate,
    parent2: &Candidate,
    rate: f64,
    rng: &mut R,
) -> Candidate {
    let mut child = parent1.clone();
    if !rng.gen_bool(rate.clamp(0.0, 1.0)) {
        return child;
    }

    let keys: Vec<ParamKey> = child.params.active_keys().collect();
    for key in keys {
        if rng.gen_bool(0.5) {
            if let Some(value) = key.get(&parent2.params) {
                key.set(&mut child.params, value);
            }
        }
    }
    child.reset();
    child
}

/// Redraw each active key with probability `rate`. Returns whether any
/// value changed; only then is the score dropped. A redraw that lands on the
/// current value leaves the candidate untouched.
pub fn mutate<R: Rng + ?Sized>(
    candidate: &mut Candidate,
    rate: f64,
    catalog: &RangeCatalog,
    rng: &mut R,
) -> bool {
    let rate = rate.clamp(0.0, 1.0);
    let keys: Vec<ParamKey> = candidate.params.active_keys().collect();
    let mut changed = false;
    for key in keys {
        if !rng.gen_bool(rate) {
            continue;
        }
        let Some(value) = catalog.sample(key, rng) else {
            continue;
        };
        if key.get(&candidate.params) != Some(value) {
            changed |= key.set(&mut candidate.params, value);
        }
    }
    if changed {
        candidate.reset();
    }
    changed
}

/// Restore `lower < upper` on every active pair.
///
/// - `lower > upper`: swap
/// - `lower == upper`: upper moves one catalog step up; if it has no larger
///   catalog value, lower moves one step down instead
///
/// Idempotent. Leaves fitness alone.
pub fn repair(params: &mut ParameterVector, catalog: &RangeCatalog) {
    for (lower_key, upper_key) in ParamKey::PAIRS {
        let (Some(lower), Some(upper)) = (lower_key.get(params), upper_key.get(params)) else {
            continue;
        };

        if lower > upper {
            lower_key.set(params, upper);
            upper_key.set(params, lower);
            trace!(lower = %lower_key, upper = %upper_key, "Swapped inverted pair");
        } else if lower == upper {
            if let Some(up) = catalog.step_up(upper_key, upper) {
                upper_key.set(params, up);
            } else if let Some(down) = catalog.step_down(lower_key, lower) {
                lower_key.set(params, down);
            }
            trace!(lower = %lower_key, upper = %upper_key, "Separated equal pair");
        }
    }
}

/// Elite copied unchanged, remainder bred by tournament, crossover, mutation
/// and repair.
pub fn next_generation<R: Rng + ?Sized>(
    population: &Population,
    config: &OptimizerConfig,
    catalog: &RangeCatalog,
    rng: &mut R,
) -> Population {
    let mut next = population.elite(config.elite_size);

    while next.len() < config.population_size {
        let (Some(parent1), Some(parent2)) = (
            tournament_select(population, config.tournament_size, rng),
            tournament_select(population, config.tournament_size, rng),
        ) else {
            break;
        };

        let mut child = crossover(parent1, parent2, config.crossover_rate, rng);
        repair(&mut child.params, catalog);
        mutate(&mut child, config.mutation_rate, catalog, rng);
        repair(&mut child.params, catalog);
        next.push(child);
    }

    Population::new(next)
}

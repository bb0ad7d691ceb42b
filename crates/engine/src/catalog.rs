//! Discrete search ranges for every tunable parameter
//!
//! The catalog is read-only once built. Random draws always go through a
//! caller-supplied `Rng` so runs stay seedable.

use std::collections::{BTreeMap, BTreeSet};

use rand::seq::SliceRandom;
use rand::Rng;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::error::ConfigError;
use crate::params::{Feature, ParamKey};
use crate::types::BaseConfig;

#[derive(Debug, Clone)]
pub struct RangeCatalog {
    entries: BTreeMap<ParamKey, Vec<Decimal>>,
}

impl RangeCatalog {
    /// Built-in ranges for every key
    pub fn standard() -> Self {
        let ints = |values: &[u32]| values.iter().map(|&v| Decimal::from(v)).collect::<Vec<_>>();

        let entries: [(ParamKey, Vec<Decimal>); 19] = [
            (ParamKey::InitialCapital, vec![dec!(10000)]),
            (
                ParamKey::MaxMultiplier,
                vec![dec!(1), dec!(1.5), dec!(2), dec!(2.5), dec!(3), dec!(4), dec!(5)],
            ),
            (
                ParamKey::TakeProfitPct,
                vec![
                    dec!(0.5),
                    dec!(1),
                    dec!(1.5),
                    dec!(2),
                    dec!(2.5),
                    dec!(3),
                    dec!(4),
                    dec!(5),
                ],
            ),
            (
                ParamKey::PriceThresholdPct,
                vec![
                    dec!(0.5),
                    dec!(1),
                    dec!(1.5),
                    dec!(2),
                    dec!(2.5),
                    dec!(3),
                    dec!(4),
                    dec!(5),
                ],
            ),
            (
                ParamKey::ThresholdMultiplier,
                vec![
                    dec!(1),
                    dec!(1.1),
                    dec!(1.2),
                    dec!(1.3),
                    dec!(1.5),
                    dec!(1.75),
                    dec!(2),
                ],
            ),
            (ParamKey::RsiPeriod, ints(&[5, 7, 9, 11, 14, 18, 21, 28])),
            (ParamKey::RsiOversold, ints(&[15, 20, 25, 30, 35, 40, 45])),
            (ParamKey::RsiOverbought, ints(&[55, 60, 65, 70, 75, 80, 85])),
            (ParamKey::SmaPeriod, ints(&[10, 20, 30, 50, 100, 200])),
            (ParamKey::EmaFastPeriod, ints(&[5, 8, 10, 12, 13, 15])),
            (ParamKey::EmaSlowPeriod, ints(&[20, 25, 26, 30, 40, 50])),
            (ParamKey::BollingerPeriod, ints(&[8, 10, 15, 18, 20, 22, 25, 30])),
            (
                ParamKey::BollingerStdDev,
                vec![dec!(1.5), dec!(1.75), dec!(2), dec!(2.25), dec!(2.5), dec!(3)],
            ),
            (
                ParamKey::VolatilitySensitivity,
                vec![dec!(0.25), dec!(0.5), dec!(0.75), dec!(1), dec!(1.5), dec!(2)],
            ),
            (ParamKey::AtrPeriod, ints(&[5, 7, 10, 14, 21])),
            (
                ParamKey::LevelMultiplier,
                vec![dec!(0.5), dec!(0.75), dec!(1), dec!(1.25), dec!(1.5), dec!(2)],
            ),
            (ParamKey::RegimeShortWindow, ints(&[10, 15, 20, 30, 50])),
            (ParamKey::RegimeLongWindow, ints(&[50, 75, 100, 150, 200])),
            (
                ParamKey::RegimeTrendBandPct,
                vec![dec!(0.5), dec!(1), dec!(1.5), dec!(2), dec!(3)],
            ),
        ];

        entries
            .into_iter()
            .fold(Self { entries: BTreeMap::new() }, |catalog, (key, values)| {
                catalog.with_entry(key, values)
            })
    }

    /// Standard ranges with the capital pinned to the base configuration
    pub fn for_base(base: &BaseConfig) -> Self {
        Self::standard().with_entry(ParamKey::InitialCapital, vec![base.initial_capital])
    }

    /// Replace one entry. Values are sorted ascending and deduplicated.
    pub fn with_entry(mut self, key: ParamKey, mut values: Vec<Decimal>) -> Self {
        values.sort();
        values.dedup();
        self.entries.insert(key, values);
        self
    }

    /// Legal values for `key`, ascending. Empty when the key has no entry.
    pub fn choices(&self, key: ParamKey) -> &[Decimal] {
        self.entries.get(&key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Uniform draw from the entry of `key`
    pub fn sample<R: Rng + ?Sized>(&self, key: ParamKey, rng: &mut R) -> Option<Decimal> {
        self.choices(key).choose(rng).copied()
    }

    /// Smallest catalog value strictly above `value`
    pub fn step_up(&self, key: ParamKey, value: Decimal) -> Option<Decimal> {
        self.choices(key).iter().find(|&&v| v > value).copied()
    }

    /// Largest catalog value strictly below `value`
    pub fn step_down(&self, key: ParamKey, value: Decimal) -> Option<Decimal> {
        self.choices(key).iter().rev().find(|&&v| v < value).copied()
    }

    /// Check that every key active under `features` can be searched and that
    /// every active pair can always be put in strict order.
    pub fn validate(&self, features: &BTreeSet<Feature>) -> Result<(), ConfigError> {
        let active = |key: &ParamKey| key.feature().map_or(true, |f| features.contains(&f));

        for key in ParamKey::ALL.iter().filter(|k| active(k)) {
            let values = self.choices(*key);
            if values.is_empty() {
                return Err(ConfigError::EmptyCatalogEntry(*key));
            }
            if key.is_period() {
                if let Some(bad) = values.iter().find(|v| !v.fract().is_zero() || **v < Decimal::ONE) {
                    return Err(ConfigError::InvalidPeriod {
                        key: *key,
                        value: bad.to_string(),
                    });
                }
            }
        }

        for (lower, upper) in ParamKey::PAIRS.iter().filter(|(l, _)| active(l)) {
            let min_lower = self.choices(*lower).first();
            let max_upper = self.choices(*upper).last();
            match (min_lower, max_upper) {
                (Some(lo), Some(hi)) if lo < hi => {}
                _ => {
                    return Err(ConfigError::UnorderablePair {
                        lower: *lower,
                        upper: *upper,
                    })
                }
            }
        }

        Ok(())
    }
}

impl Default for RangeCatalog {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn all_features() -> BTreeSet<Feature> {
        Feature::ALL.into_iter().collect()
    }

    #[test]
    fn test_standard_catalog_is_valid() {
        let catalog = RangeCatalog::standard();
        assert!(catalog.validate(&all_features()).is_ok());
        for key in ParamKey::ALL {
            assert!(!catalog.choices(key).is_empty(), "{} has no choices", key);
        }
    }

    #[test]
    fn test_with_entry_sorts_and_dedups() {
        let catalog = RangeCatalog::standard()
            .with_entry(ParamKey::TakeProfitPct, vec![dec!(3), dec!(1), dec!(3.0), dec!(2)]);
        assert_eq!(catalog.choices(ParamKey::TakeProfitPct), &[dec!(1), dec!(2), dec!(3)]);
    }

    #[test]
    fn test_empty_entry_is_config_error() {
        let catalog = RangeCatalog::standard().with_entry(ParamKey::SmaPeriod, vec![]);
        let features: BTreeSet<Feature> = [Feature::Sma].into_iter().collect();
        assert_eq!(
            catalog.validate(&features),
            Err(ConfigError::EmptyCatalogEntry(ParamKey::SmaPeriod))
        );
        // Inactive features are not checked
        assert!(catalog.validate(&BTreeSet::new()).is_ok());
    }

    #[test]
    fn test_fractional_period_is_rejected() {
        let catalog = RangeCatalog::standard().with_entry(ParamKey::RsiPeriod, vec![dec!(14.5)]);
        let features: BTreeSet<Feature> = [Feature::Rsi].into_iter().collect();
        assert!(matches!(
            catalog.validate(&features),
            Err(ConfigError::InvalidPeriod { key: ParamKey::RsiPeriod, .. })
        ));
    }

    #[test]
    fn test_unorderable_pair_is_rejected() {
        let catalog = RangeCatalog::standard()
            .with_entry(ParamKey::EmaFastPeriod, vec![dec!(30), dec!(40)])
            .with_entry(ParamKey::EmaSlowPeriod, vec![dec!(20), dec!(30)]);
        let features: BTreeSet<Feature> = [Feature::EmaCross].into_iter().collect();
        assert_eq!(
            catalog.validate(&features),
            Err(ConfigError::UnorderablePair {
                lower: ParamKey::EmaFastPeriod,
                upper: ParamKey::EmaSlowPeriod,
            })
        );
    }

    #[test]
    fn test_steps_move_to_neighbouring_values() {
        let catalog = RangeCatalog::standard();
        assert_eq!(catalog.step_up(ParamKey::RsiOverbought, dec!(70)), Some(dec!(75)));
        assert_eq!(catalog.step_up(ParamKey::RsiOverbought, dec!(85)), None);
        assert_eq!(catalog.step_down(ParamKey::RsiOversold, dec!(15)), None);
        // Off-catalog values step to the nearest catalog neighbour
        assert_eq!(catalog.step_up(ParamKey::RsiOverbought, dec!(40)), Some(dec!(55)));
        assert_eq!(catalog.step_down(ParamKey::RsiOversold, dec!(33)), Some(dec!(30)));
    }

    #[test]
    fn test_sampling_is_seeded_and_in_range() {
        let catalog = RangeCatalog::standard();
        let mut a = StdRng::seed_from_u64(7);
        let mut b = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let va = catalog.sample(ParamKey::BollingerStdDev, &mut a).unwrap();
            let vb = catalog.sample(ParamKey::BollingerStdDev, &mut b).unwrap();
            assert_eq!(va, vb);
            assert!(catalog.choices(ParamKey::BollingerStdDev).contains(&va));
        }
    }

    #[test]
    fn test_for_base_pins_capital() {
        let base = BaseConfig {
            initial_capital: dec!(2500),
            ..Default::default()
        };
        assert_eq!(RangeCatalog::for_base(&base).choices(ParamKey::InitialCapital), &[dec!(2500)]);
    }
}

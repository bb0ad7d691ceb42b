//! Strategy parameter vectors
//!
//! A `ParameterVector` holds the always-present scalar fields of the DCA
//! strategy plus one typed block per optional feature. `ParamKey` is the
//! field registry the genetic operators work through: every tunable field
//! has a key with typed get/set accessors, so operators never inspect
//! fields by name at runtime.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::BaseConfig;

// ============================================================================
// Features
// ============================================================================

/// Optional strategy features. Which ones are active is a configuration
/// input, never a search dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    Rsi,
    Sma,
    EmaCross,
    Bollinger,
    VolatilitySpacing,
    Regime,
}

impl Feature {
    pub const ALL: [Feature; 6] = [
        Feature::Rsi,
        Feature::Sma,
        Feature::EmaCross,
        Feature::Bollinger,
        Feature::VolatilitySpacing,
        Feature::Regime,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Feature::Rsi => "rsi",
            Feature::Sma => "sma",
            Feature::EmaCross => "ema_cross",
            Feature::Bollinger => "bollinger",
            Feature::VolatilitySpacing => "volatility_spacing",
            Feature::Regime => "regime",
        }
    }

    /// Indicator features gate entries; the others shape spacing and regime.
    pub fn is_indicator(&self) -> bool {
        matches!(
            self,
            Feature::Rsi | Feature::Sma | Feature::EmaCross | Feature::Bollinger
        )
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Feature {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase().replace('-', "_");
        Feature::ALL
            .into_iter()
            .find(|f| f.name() == wanted)
            .ok_or_else(|| ConfigError::UnknownFeature(s.to_string()))
    }
}

/// Parse a comma-separated feature list such as `"rsi,ema_cross"`
pub fn parse_features(list: &str) -> Result<BTreeSet<Feature>, ConfigError> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(Feature::from_str)
        .collect()
}

// ============================================================================
// Feature blocks
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RsiBlock {
    pub period: usize,
    pub oversold: Decimal,
    pub overbought: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmaBlock {
    pub period: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmaCrossBlock {
    pub fast_period: usize,
    pub slow_period: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BollingerBlock {
    pub period: usize,
    pub std_dev: Decimal,
}

/// ATR-driven widening or tightening of entry spacing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolatilityBlock {
    pub sensitivity: Decimal,
    pub atr_period: usize,
    pub level_multiplier: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegimeBlock {
    pub short_window: usize,
    pub long_window: usize,
    /// Distance between the two averages, in percent, that counts as a trend
    pub trend_band_pct: Decimal,
}

// ============================================================================
// Parameter vector
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterVector {
    pub initial_capital: Decimal,
    /// Upper bound of the per-level order size multiplier
    pub max_multiplier: Decimal,
    pub take_profit_pct: Decimal,
    /// Price drop (percent) from the last entry that triggers the first DCA buy
    pub price_threshold_pct: Decimal,
    /// Growth factor of the spacing from one DCA level to the next
    pub threshold_multiplier: Decimal,
    pub features: BTreeSet<Feature>,
    pub rsi: Option<RsiBlock>,
    pub sma: Option<SmaBlock>,
    pub ema_cross: Option<EmaCrossBlock>,
    pub bollinger: Option<BollingerBlock>,
    pub volatility: Option<VolatilityBlock>,
    pub regime: Option<RegimeBlock>,
}

impl ParameterVector {
    /// Vector with conventional defaults for every block the base enables
    pub fn from_base(base: &BaseConfig) -> Self {
        let mut params = Self {
            initial_capital: base.initial_capital,
            max_multiplier: dec!(3),
            take_profit_pct: base.take_profit_pct,
            price_threshold_pct: dec!(1.5),
            threshold_multiplier: dec!(1.2),
            features: base.features.clone(),
            rsi: None,
            sma: None,
            ema_cross: None,
            bollinger: None,
            volatility: None,
            regime: None,
        };
        params.materialize_blocks();
        params
    }

    /// Create default blocks for enabled features and drop the rest.
    pub fn materialize_blocks(&mut self) {
        let on = |f: Feature| self.features.contains(&f);
        let (rsi, sma, ema, bb, vol, regime) = (
            on(Feature::Rsi),
            on(Feature::Sma),
            on(Feature::EmaCross),
            on(Feature::Bollinger),
            on(Feature::VolatilitySpacing),
            on(Feature::Regime),
        );

        self.rsi = rsi.then(|| {
            self.rsi.clone().unwrap_or(RsiBlock {
                period: 14,
                oversold: dec!(30),
                overbought: dec!(70),
            })
        });
        self.sma = sma.then(|| self.sma.clone().unwrap_or(SmaBlock { period: 50 }));
        self.ema_cross = ema.then(|| {
            self.ema_cross.clone().unwrap_or(EmaCrossBlock {
                fast_period: 12,
                slow_period: 26,
            })
        });
        self.bollinger = bb.then(|| {
            self.bollinger.clone().unwrap_or(BollingerBlock {
                period: 20,
                std_dev: dec!(2),
            })
        });
        self.volatility = vol.then(|| {
            self.volatility.clone().unwrap_or(VolatilityBlock {
                sensitivity: dec!(1),
                atr_period: 14,
                level_multiplier: dec!(1),
            })
        });
        self.regime = regime.then(|| {
            self.regime.clone().unwrap_or(RegimeBlock {
                short_window: 20,
                long_window: 100,
                trend_band_pct: dec!(1),
            })
        });
    }

    pub fn has_feature(&self, feature: Feature) -> bool {
        self.features.contains(&feature)
    }

    fn has_block(&self, feature: Feature) -> bool {
        match feature {
            Feature::Rsi => self.rsi.is_some(),
            Feature::Sma => self.sma.is_some(),
            Feature::EmaCross => self.ema_cross.is_some(),
            Feature::Bollinger => self.bollinger.is_some(),
            Feature::VolatilitySpacing => self.volatility.is_some(),
            Feature::Regime => self.regime.is_some(),
        }
    }

    /// Every enabled feature has a block and every block has its feature.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for feature in Feature::ALL {
            if self.has_feature(feature) != self.has_block(feature) {
                return Err(ConfigError::InconsistentFeatures(feature));
            }
        }
        Ok(())
    }

    /// Keys that are part of the search for this vector
    pub fn active_keys(&self) -> impl Iterator<Item = ParamKey> + '_ {
        ParamKey::ALL.into_iter().filter(move |key| match key.feature() {
            None => true,
            Some(f) => self.has_feature(f) && self.has_block(f),
        })
    }

    /// Serializable key/value form of the active fields
    pub fn to_key_values(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        map.insert(
            "features".to_string(),
            serde_json::Value::from(
                self.features
                    .iter()
                    .map(|f| f.name().to_string())
                    .collect::<Vec<_>>(),
            ),
        );
        for key in self.active_keys() {
            let Some(value) = key.get(self) else { continue };
            let json = if key.is_period() {
                serde_json::Value::from(period_from(value) as u64)
            } else {
                serde_json::Value::from(value.normalize().to_string())
            };
            map.insert(key.name().to_string(), json);
        }
        serde_json::Value::Object(map)
    }
}

fn period_from(value: Decimal) -> usize {
    value.trunc().to_usize().unwrap_or(0)
}

// ============================================================================
// Field registry
// ============================================================================

/// Every tunable field of a `ParameterVector`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKey {
    InitialCapital,
    MaxMultiplier,
    TakeProfitPct,
    PriceThresholdPct,
    ThresholdMultiplier,
    RsiPeriod,
    RsiOversold,
    RsiOverbought,
    SmaPeriod,
    EmaFastPeriod,
    EmaSlowPeriod,
    BollingerPeriod,
    BollingerStdDev,
    VolatilitySensitivity,
    AtrPeriod,
    LevelMultiplier,
    RegimeShortWindow,
    RegimeLongWindow,
    RegimeTrendBandPct,
}

impl ParamKey {
    pub const ALL: [ParamKey; 19] = [
        ParamKey::InitialCapital,
        ParamKey::MaxMultiplier,
        ParamKey::TakeProfitPct,
        ParamKey::PriceThresholdPct,
        ParamKey::ThresholdMultiplier,
        ParamKey::RsiPeriod,
        ParamKey::RsiOversold,
        ParamKey::RsiOverbought,
        ParamKey::SmaPeriod,
        ParamKey::EmaFastPeriod,
        ParamKey::EmaSlowPeriod,
        ParamKey::BollingerPeriod,
        ParamKey::BollingerStdDev,
        ParamKey::VolatilitySensitivity,
        ParamKey::AtrPeriod,
        ParamKey::LevelMultiplier,
        ParamKey::RegimeShortWindow,
        ParamKey::RegimeLongWindow,
        ParamKey::RegimeTrendBandPct,
    ];

    /// Ordered (lower, upper) pairs that must satisfy lower < upper
    pub const PAIRS: [(ParamKey, ParamKey); 3] = [
        (ParamKey::RsiOversold, ParamKey::RsiOverbought),
        (ParamKey::EmaFastPeriod, ParamKey::EmaSlowPeriod),
        (ParamKey::RegimeShortWindow, ParamKey::RegimeLongWindow),
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ParamKey::InitialCapital => "initial_capital",
            ParamKey::MaxMultiplier => "max_multiplier",
            ParamKey::TakeProfitPct => "take_profit_pct",
            ParamKey::PriceThresholdPct => "price_threshold_pct",
            ParamKey::ThresholdMultiplier => "threshold_multiplier",
            ParamKey::RsiPeriod => "rsi_period",
            ParamKey::RsiOversold => "rsi_oversold",
            ParamKey::RsiOverbought => "rsi_overbought",
            ParamKey::SmaPeriod => "sma_period",
            ParamKey::EmaFastPeriod => "ema_fast_period",
            ParamKey::EmaSlowPeriod => "ema_slow_period",
            ParamKey::BollingerPeriod => "bollinger_period",
            ParamKey::BollingerStdDev => "bollinger_std_dev",
            ParamKey::VolatilitySensitivity => "volatility_sensitivity",
            ParamKey::AtrPeriod => "atr_period",
            ParamKey::LevelMultiplier => "level_multiplier",
            ParamKey::RegimeShortWindow => "regime_short_window",
            ParamKey::RegimeLongWindow => "regime_long_window",
            ParamKey::RegimeTrendBandPct => "regime_trend_band_pct",
        }
    }

    /// Owning feature, `None` for the always-present scalars
    pub fn feature(&self) -> Option<Feature> {
        match self {
            ParamKey::InitialCapital
            | ParamKey::MaxMultiplier
            | ParamKey::TakeProfitPct
            | ParamKey::PriceThresholdPct
            | ParamKey::ThresholdMultiplier => None,
            ParamKey::RsiPeriod | ParamKey::RsiOversold | ParamKey::RsiOverbought => {
                Some(Feature::Rsi)
            }
            ParamKey::SmaPeriod => Some(Feature::Sma),
            ParamKey::EmaFastPeriod | ParamKey::EmaSlowPeriod => Some(Feature::EmaCross),
            ParamKey::BollingerPeriod | ParamKey::BollingerStdDev => Some(Feature::Bollinger),
            ParamKey::VolatilitySensitivity | ParamKey::AtrPeriod | ParamKey::LevelMultiplier => {
                Some(Feature::VolatilitySpacing)
            }
            ParamKey::RegimeShortWindow
            | ParamKey::RegimeLongWindow
            | ParamKey::RegimeTrendBandPct => Some(Feature::Regime),
        }
    }

    /// Period and window fields hold whole bar counts
    pub fn is_period(&self) -> bool {
        matches!(
            self,
            ParamKey::RsiPeriod
                | ParamKey::SmaPeriod
                | ParamKey::EmaFastPeriod
                | ParamKey::EmaSlowPeriod
                | ParamKey::BollingerPeriod
                | ParamKey::AtrPeriod
                | ParamKey::RegimeShortWindow
                | ParamKey::RegimeLongWindow
        )
    }

    /// Read the field, `None` when its block is absent
    pub fn get(&self, p: &ParameterVector) -> Option<Decimal> {
        let period = |v: usize| Decimal::from(v);
        match self {
            ParamKey::InitialCapital => Some(p.initial_capital),
            ParamKey::MaxMultiplier => Some(p.max_multiplier),
            ParamKey::TakeProfitPct => Some(p.take_profit_pct),
            ParamKey::PriceThresholdPct => Some(p.price_threshold_pct),
            ParamKey::ThresholdMultiplier => Some(p.threshold_multiplier),
            ParamKey::RsiPeriod => p.rsi.as_ref().map(|b| period(b.period)),
            ParamKey::RsiOversold => p.rsi.as_ref().map(|b| b.oversold),
            ParamKey::RsiOverbought => p.rsi.as_ref().map(|b| b.overbought),
            ParamKey::SmaPeriod => p.sma.as_ref().map(|b| period(b.period)),
            ParamKey::EmaFastPeriod => p.ema_cross.as_ref().map(|b| period(b.fast_period)),
            ParamKey::EmaSlowPeriod => p.ema_cross.as_ref().map(|b| period(b.slow_period)),
            ParamKey::BollingerPeriod => p.bollinger.as_ref().map(|b| period(b.period)),
            ParamKey::BollingerStdDev => p.bollinger.as_ref().map(|b| b.std_dev),
            ParamKey::VolatilitySensitivity => p.volatility.as_ref().map(|b| b.sensitivity),
            ParamKey::AtrPeriod => p.volatility.as_ref().map(|b| period(b.atr_period)),
            ParamKey::LevelMultiplier => p.volatility.as_ref().map(|b| b.level_multiplier),
            ParamKey::RegimeShortWindow => p.regime.as_ref().map(|b| period(b.short_window)),
            ParamKey::RegimeLongWindow => p.regime.as_ref().map(|b| period(b.long_window)),
            ParamKey::RegimeTrendBandPct => p.regime.as_ref().map(|b| b.trend_band_pct),
        }
    }

    /// Write the field. Returns `false` (and changes nothing) when the block
    /// is absent.
    pub fn set(&self, p: &mut ParameterVector, value: Decimal) -> bool {
        let period = period_from(value);
        match self {
            ParamKey::InitialCapital => p.initial_capital = value,
            ParamKey::MaxMultiplier => p.max_multiplier = value,
            ParamKey::TakeProfitPct => p.take_profit_pct = value,
            ParamKey::PriceThresholdPct => p.price_threshold_pct = value,
            ParamKey::ThresholdMultiplier => p.threshold_multiplier = value,
            ParamKey::RsiPeriod => match p.rsi.as_mut() {
                Some(b) => b.period = period,
                None => return false,
            },
            ParamKey::RsiOversold => match p.rsi.as_mut() {
                Some(b) => b.oversold = value,
                None => return false,
            },
            ParamKey::RsiOverbought => match p.rsi.as_mut() {
                Some(b) => b.overbought = value,
                None => return false,
            },
            ParamKey::SmaPeriod => match p.sma.as_mut() {
                Some(b) => b.period = period,
                None => return false,
            },
            ParamKey::EmaFastPeriod => match p.ema_cross.as_mut() {
                Some(b) => b.fast_period = period,
                None => return false,
            },
            ParamKey::EmaSlowPeriod => match p.ema_cross.as_mut() {
                Some(b) => b.slow_period = period,
                None => return false,
            },
            ParamKey::BollingerPeriod => match p.bollinger.as_mut() {
                Some(b) => b.period = period,
                None => return false,
            },
            ParamKey::BollingerStdDev => match p.bollinger.as_mut() {
                Some(b) => b.std_dev = value,
                None => return false,
            },
            ParamKey::VolatilitySensitivity => match p.volatility.as_mut() {
                Some(b) => b.sensitivity = value,
                None => return false,
            },
            ParamKey::AtrPeriod => match p.volatility.as_mut() {
                Some(b) => b.atr_period = period,
                None => return false,
            },
            ParamKey::LevelMultiplier => match p.volatility.as_mut() {
                Some(b) => b.level_multiplier = value,
                None => return false,
            },
            ParamKey::RegimeShortWindow => match p.regime.as_mut() {
                Some(b) => b.short_window = period,
                None => return false,
            },
            ParamKey::RegimeLongWindow => match p.regime.as_mut() {
                Some(b) => b.long_window = period,
                None => return false,
            },
            ParamKey::RegimeTrendBandPct => match p.regime.as_mut() {
                Some(b) => b.trend_band_pct = value,
                None => return false,
            },
        }
        true
    }
}

impl fmt::Display for ParamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_with(features: &[Feature]) -> BaseConfig {
        BaseConfig {
            features: features.iter().copied().collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_feature_parsing() {
        assert_eq!("rsi".parse::<Feature>(), Ok(Feature::Rsi));
        assert_eq!("EMA-Cross".parse::<Feature>(), Ok(Feature::EmaCross));
        assert_eq!(
            "macd".parse::<Feature>(),
            Err(ConfigError::UnknownFeature("macd".to_string()))
        );

        let set = parse_features("rsi, regime,,volatility_spacing").unwrap();
        assert_eq!(set.len(), 3);
        assert!(parse_features("rsi,nope").is_err());
    }

    #[test]
    fn test_blocks_follow_feature_set() {
        let params = ParameterVector::from_base(&base_with(&[Feature::Rsi, Feature::Regime]));
        assert!(params.rsi.is_some());
        assert!(params.regime.is_some());
        assert!(params.sma.is_none());
        assert!(params.validate().is_ok());

        let keys: Vec<ParamKey> = params.active_keys().collect();
        assert!(keys.contains(&ParamKey::RsiOversold));
        assert!(keys.contains(&ParamKey::RegimeLongWindow));
        assert!(!keys.contains(&ParamKey::SmaPeriod));
        assert_eq!(keys.len(), 5 + 3 + 3);
    }

    #[test]
    fn test_inconsistent_block_is_rejected() {
        let mut params = ParameterVector::from_base(&base_with(&[Feature::Sma]));
        params.ema_cross = Some(EmaCrossBlock {
            fast_period: 5,
            slow_period: 10,
        });
        assert_eq!(
            params.validate(),
            Err(ConfigError::InconsistentFeatures(Feature::EmaCross))
        );
    }

    #[test]
    fn test_accessors_round_trip_through_blocks() {
        let mut params = ParameterVector::from_base(&base_with(&[Feature::EmaCross]));
        assert!(ParamKey::EmaSlowPeriod.set(&mut params, dec!(40)));
        assert_eq!(params.ema_cross.as_ref().unwrap().slow_period, 40);
        assert_eq!(ParamKey::EmaSlowPeriod.get(&params), Some(dec!(40)));

        // Absent block: nothing happens
        assert!(!ParamKey::RsiPeriod.set(&mut params, dec!(9)));
        assert_eq!(ParamKey::RsiPeriod.get(&params), None);
    }

    #[test]
    fn test_key_values_only_include_active_fields() {
        let params = ParameterVector::from_base(&base_with(&[Feature::Rsi]));
        let kv = params.to_key_values();
        assert_eq!(kv["rsi_period"], serde_json::Value::from(14u64));
        assert_eq!(kv["rsi_oversold"], serde_json::Value::from("30"));
        assert!(kv.get("sma_period").is_none());
        assert_eq!(kv["features"], serde_json::json!(["rsi"]));
    }
}

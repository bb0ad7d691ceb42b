//! Entry spacing between DCA levels
//!
//! Level 1 is the first buy after the opening order. The spacing of level
//! `n` is `price_threshold_pct * threshold_multiplier^(n-1)`; the
//! volatility-adaptive model further scales it by recent ATR.

use rust_decimal::Decimal;
use ta::indicators::AverageTrueRange;
use ta::{DataItem, Next, Reset};

use crate::error::EvaluationError;
use crate::metrics::to_f64;
use crate::params::{Feature, ParameterVector};
use crate::types::Kline;

const MIN_VOLATILITY_FACTOR: f64 = 0.25;
const MAX_VOLATILITY_FACTOR: f64 = 4.0;

pub trait SpacingModel: Send {
    fn name(&self) -> &'static str;
    fn on_bar(&mut self, kline: &Kline);
    /// Price drop in percent from the last entry that triggers `level`
    fn threshold_pct(&self, level: u32) -> Decimal;
    fn is_ready(&self) -> bool;
    fn reset(&mut self);
}

// ============================================================================
// Geometric
// ============================================================================

pub struct GeometricSpacing {
    base_pct: Decimal,
    multiplier: Decimal,
}

impl GeometricSpacing {
    pub fn new(base_pct: Decimal, multiplier: Decimal) -> Self {
        Self {
            base_pct,
            multiplier,
        }
    }
}

impl SpacingModel for GeometricSpacing {
    fn name(&self) -> &'static str {
        "Geometric"
    }

    fn on_bar(&mut self, _kline: &Kline) {}

    fn threshold_pct(&self, level: u32) -> Decimal {
        let mut pct = self.base_pct;
        for _ in 1..level {
            pct *= self.multiplier;
        }
        pct
    }

    fn is_ready(&self) -> bool {
        true
    }

    fn reset(&mut self) {}
}

// ============================================================================
// Volatility adaptive
// ============================================================================

/// Geometric spacing widened in volatile markets and tightened in quiet ones
pub struct VolatilitySpacing {
    geometric: GeometricSpacing,
    atr: AverageTrueRange,
    atr_period: usize,
    sensitivity: f64,
    level_multiplier: f64,
    last_atr_pct: f64,
    bars_seen: usize,
}

impl VolatilitySpacing {
    pub fn new(
        geometric: GeometricSpacing,
        atr_period: usize,
        sensitivity: Decimal,
        level_multiplier: Decimal,
    ) -> Result<Self, EvaluationError> {
        let atr = AverageTrueRange::new(atr_period).map_err(|e| EvaluationError::Indicator {
            name: "ATR",
            reason: format!("{e:?}"),
        })?;
        Ok(Self {
            geometric,
            atr,
            atr_period,
            sensitivity: to_f64(sensitivity),
            level_multiplier: to_f64(level_multiplier),
            last_atr_pct: 0.0,
            bars_seen: 0,
        })
    }

    /// Multiplier applied on top of the geometric spacing
    pub fn factor(&self) -> f64 {
        if !self.is_ready() {
            return 1.0;
        }
        let raw = 1.0 + self.sensitivity * (self.last_atr_pct * self.level_multiplier - 1.0);
        raw.clamp(MIN_VOLATILITY_FACTOR, MAX_VOLATILITY_FACTOR)
    }
}

fn data_item(kline: &Kline) -> Option<DataItem> {
    DataItem::builder()
        .open(to_f64(kline.open))
        .high(to_f64(kline.high))
        .low(to_f64(kline.low))
        .close(to_f64(kline.close))
        .volume(to_f64(kline.volume))
        .build()
        .ok()
}

impl SpacingModel for VolatilitySpacing {
    fn name(&self) -> &'static str {
        "VolatilityAdaptive"
    }

    fn on_bar(&mut self, kline: &Kline) {
        // Malformed bars (high < low etc.) are skipped rather than poisoning the ATR
        let Some(item) = data_item(kline) else { return };
        let atr = self.atr.next(&item);
        let close = to_f64(kline.close);
        self.last_atr_pct = if close > 0.0 { atr / close * 100.0 } else { 0.0 };
        self.bars_seen += 1;
    }

    fn threshold_pct(&self, level: u32) -> Decimal {
        let base = self.geometric.threshold_pct(level);
        let factor = Decimal::from_f64_retain(self.factor())
            .map(|f| f.round_dp(6))
            .unwrap_or(Decimal::ONE);
        base * factor
    }

    fn is_ready(&self) -> bool {
        self.bars_seen >= self.atr_period
    }

    fn reset(&mut self) {
        self.atr.reset();
        self.last_atr_pct = 0.0;
        self.bars_seen = 0;
    }
}

/// Spacing model for the vector: volatility adaptive when that feature is on
pub fn build_spacing(params: &ParameterVector) -> Result<Box<dyn SpacingModel>, EvaluationError> {
    let geometric = GeometricSpacing::new(params.price_threshold_pct, params.threshold_multiplier);
    if !params.has_feature(Feature::VolatilitySpacing) {
        return Ok(Box::new(geometric));
    }
    let block = params
        .volatility
        .as_ref()
        .ok_or(EvaluationError::MissingBlock(Feature::VolatilitySpacing))?;
    Ok(Box::new(VolatilitySpacing::new(
        geometric,
        block.atr_period,
        block.sensitivity,
        block.level_multiplier,
    )?))
}

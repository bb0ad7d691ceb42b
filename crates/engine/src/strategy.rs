//! DCA accumulation strategy
//!
//! A cycle opens when price dips `threshold_pct(1)` below the highest close
//! seen since the previous cycle ended and every enabled entry filter
//! agrees. Further buys are added at widening drops below the last entry.
//! In cycle mode the whole position is sold at the take-profit target (or
//! on an exit signal while in profit after fees) and a new cycle may start.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::EvaluationError;
use crate::indicators::{build_signal_sources, SignalSource};
use crate::params::{Feature, ParameterVector};
use crate::regime::{EngineKind, Regime, RegimeDetector};
use crate::spacing::{build_spacing, SpacingModel};
use crate::types::{BaseConfig, Kline};

/// Trading signal emitted by a signal source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    Buy,
    Sell,
    Hold,
}

/// What the strategy wants done on the current bar
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Hold,
    /// Level 0 opens a cycle, level n is the n-th averaging-down buy
    Buy { level: u32 },
    TakeProfit,
}

/// Read-only view of the simulator's open cycle
#[derive(Debug, Clone, Copy, Default)]
pub struct PositionView {
    pub entries: u32,
    pub last_entry_price: Decimal,
    pub avg_entry_price: Decimal,
}

impl PositionView {
    pub fn is_flat(&self) -> bool {
        self.entries == 0
    }
}

pub struct DcaStrategy {
    sources: Vec<Box<dyn SignalSource>>,
    spacing: Box<dyn SpacingModel>,
    regime: Option<RegimeDetector>,
    current_regime: Option<Regime>,
    /// Highest close since the strategy went flat
    reference_price: Option<Decimal>,
    take_profit_pct: Decimal,
    commission_rate: Decimal,
    cycle_mode: bool,
    max_levels: u32,
}

impl DcaStrategy {
    /// Wire a strategy to exactly the features the vector enables
    pub fn new(params: &ParameterVector, base: &BaseConfig) -> Result<Self, EvaluationError> {
        let regime = if params.has_feature(Feature::Regime) {
            let block = params
                .regime
                .as_ref()
                .ok_or(EvaluationError::MissingBlock(Feature::Regime))?;
            Some(RegimeDetector::new(block)?)
        } else {
            None
        };

        Ok(Self {
            sources: build_signal_sources(params)?,
            spacing: build_spacing(params)?,
            regime,
            current_regime: None,
            reference_price: None,
            take_profit_pct: params.take_profit_pct,
            commission_rate: base.commission_rate,
            cycle_mode: base.cycle_mode,
            max_levels: base.max_dca_levels.max(1),
        })
    }

    /// Clear every indicator, spacing and regime accumulator
    pub fn reset(&mut self) {
        for source in &mut self.sources {
            source.reset();
        }
        self.spacing.reset();
        if let Some(detector) = self.regime.as_mut() {
            detector.reset();
        }
        self.current_regime = None;
        self.reference_price = None;
    }

    pub fn source_names(&self) -> Vec<&'static str> {
        self.sources.iter().map(|s| s.name()).collect()
    }

    pub fn spacing_name(&self) -> &'static str {
        self.spacing.name()
    }

    pub fn current_regime(&self) -> Option<Regime> {
        self.current_regime
    }

    pub fn current_engine(&self) -> Option<EngineKind> {
        self.current_regime.map(EngineKind::for_regime)
    }

    pub fn decide(&mut self, kline: &Kline, position: &PositionView) -> Action {
        // Every component sees every bar, whatever the decision
        let signals: Vec<Signal> = self.sources.iter_mut().map(|s| s.on_bar(kline)).collect();
        self.spacing.on_bar(kline);
        if let Some(detector) = self.regime.as_mut() {
            self.current_regime = Some(detector.on_bar(kline));
        }
        let engine = self.current_engine();
        let engine_factor = engine.map_or(Decimal::ONE, |e| e.spacing_factor());
        let all_ready = self.sources.iter().all(|s| s.is_ready());
        let hundred = dec!(100);

        if position.is_flat() {
            let reference = self
                .reference_price
                .map_or(kline.close, |r| r.max(kline.close));
            self.reference_price = Some(reference);

            let may_open = engine.map_or(true, |e| e.allows_new_cycle());
            let threshold = self.spacing.threshold_pct(1) * engine_factor;
            let trigger = reference * (Decimal::ONE - threshold / hundred);
            if may_open && kline.close <= trigger && entry_gate(all_ready, &signals) {
                return Action::Buy { level: 0 };
            }
            return Action::Hold;
        }
        self.reference_price = None;

        if self.cycle_mode {
            let target = position.avg_entry_price * (Decimal::ONE + self.take_profit_pct / hundred);
            if kline.close >= target {
                return Action::TakeProfit;
            }
            let breakeven = position.avg_entry_price * (Decimal::ONE + self.commission_rate * dec!(2));
            if all_ready && signals.contains(&Signal::Sell) && kline.close > breakeven {
                return Action::TakeProfit;
            }
        }

        if position.entries < self.max_levels {
            let level = position.entries;
            let threshold = self.spacing.threshold_pct(level) * engine_factor;
            let trigger = position.last_entry_price * (Decimal::ONE - threshold / hundred);
            if kline.close <= trigger {
                return Action::Buy { level };
            }
        }

        Action::Hold
    }
}

/// Entries need every filter warm, none bearish and at least one bullish.
fn entry_gate(all_ready: bool, signals: &[Signal]) -> bool {
    if signals.is_empty() {
        return true;
    }
    all_ready && !signals.contains(&Signal::Sell) && signals.contains(&Signal::Buy)
}

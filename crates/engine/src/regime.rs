//! Market regime detection for the regime-aware strategy variant
//!
//! A short and a long simple moving average classify every bar as bull,
//! bear or sideways. Each regime maps to an execution engine that shapes
//! how the DCA strategy spaces and opens entries.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use ta::indicators::SimpleMovingAverage;
use ta::{Next, Reset};

use crate::error::EvaluationError;
use crate::metrics::{to_f64, RegimeMetrics};
use crate::params::RegimeBlock;
use crate::types::Kline;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Regime {
    Bull,
    Bear,
    Sideways,
}

/// Execution engine selected by the current regime
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    Accumulation,
    Trend,
    Defensive,
}

impl EngineKind {
    pub fn for_regime(regime: Regime) -> Self {
        match regime {
            Regime::Bull => EngineKind::Trend,
            Regime::Bear => EngineKind::Defensive,
            Regime::Sideways => EngineKind::Accumulation,
        }
    }

    /// Scale applied to the entry spacing while this engine is active
    pub fn spacing_factor(&self) -> Decimal {
        match self {
            EngineKind::Accumulation => Decimal::ONE,
            EngineKind::Trend => dec!(0.5),
            EngineKind::Defensive => dec!(2),
        }
    }

    /// Defensive engine only manages open cycles
    pub fn allows_new_cycle(&self) -> bool {
        !matches!(self, EngineKind::Defensive)
    }
}

pub struct RegimeDetector {
    short: SimpleMovingAverage,
    long: SimpleMovingAverage,
    long_window: usize,
    band_pct: f64,
    bars_seen: usize,
}

impl RegimeDetector {
    pub fn new(block: &RegimeBlock) -> Result<Self, EvaluationError> {
        let sma = |period: usize| {
            SimpleMovingAverage::new(period).map_err(|e| EvaluationError::Indicator {
                name: "Regime",
                reason: format!("{e:?}"),
            })
        };
        Ok(Self {
            short: sma(block.short_window)?,
            long: sma(block.long_window)?,
            long_window: block.long_window,
            band_pct: to_f64(block.trend_band_pct),
            bars_seen: 0,
        })
    }

    /// Classify the bar. Sideways until the long average is warm.
    pub fn on_bar(&mut self, kline: &Kline) -> Regime {
        let close = to_f64(kline.close);
        let short = self.short.next(close);
        let long = self.long.next(close);
        self.bars_seen += 1;

        if !self.is_ready() || long <= 0.0 {
            return Regime::Sideways;
        }
        let spread_pct = (short - long) / long * 100.0;
        if spread_pct > self.band_pct {
            Regime::Bull
        } else if spread_pct < -self.band_pct {
            Regime::Bear
        } else {
            Regime::Sideways
        }
    }

    pub fn is_ready(&self) -> bool {
        self.bars_seen >= self.long_window
    }

    pub fn reset(&mut self) {
        self.short.reset();
        self.long.reset();
        self.bars_seen = 0;
    }
}

/// Accumulates regime statistics over one backtest
#[derive(Debug, Default)]
pub struct RegimeStats {
    current: Option<Regime>,
    changes: u32,
    segments: u32,
    total_bars: u64,
    engine_bars: BTreeMap<EngineKind, u64>,
    engine_pnl: BTreeMap<EngineKind, Decimal>,
    transitions: u32,
    transition_cost: Decimal,
    pending_transitions: u32,
    successful_transitions: u32,
}

impl RegimeStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one bar. `unrealized` is the open position's mark-to-market P&L.
    pub fn observe(&mut self, regime: Regime, position_open: bool, unrealized: Decimal) {
        match self.current {
            None => self.segments = 1,
            Some(prev) if prev != regime => {
                self.changes += 1;
                self.segments += 1;
                if position_open {
                    self.transitions += 1;
                    self.pending_transitions += 1;
                    if unrealized < Decimal::ZERO {
                        self.transition_cost += -unrealized;
                    }
                }
            }
            Some(_) => {}
        }
        self.current = Some(regime);
        self.total_bars += 1;
        *self
            .engine_bars
            .entry(EngineKind::for_regime(regime))
            .or_insert(0) += 1;
    }

    /// Attribute a closed cycle to the engine that opened it
    pub fn close_cycle(&mut self, engine: EngineKind, pnl: Decimal) {
        *self.engine_pnl.entry(engine).or_insert(Decimal::ZERO) += pnl;
        if pnl > Decimal::ZERO {
            self.successful_transitions += self.pending_transitions;
        }
        self.pending_transitions = 0;
    }

    pub fn finish(self) -> RegimeMetrics {
        let avg_regime_duration_bars = if self.segments > 0 {
            self.total_bars as f64 / self.segments as f64
        } else {
            0.0
        };
        let engine_utilization = self
            .engine_bars
            .iter()
            .map(|(engine, bars)| (*engine, *bars as f64 / self.total_bars.max(1) as f64))
            .collect();
        let transition_success_rate = if self.transitions > 0 {
            self.successful_transitions as f64 / self.transitions as f64
        } else {
            0.0
        };

        RegimeMetrics {
            regime_changes: self.changes,
            avg_regime_duration_bars,
            engine_pnl: self.engine_pnl,
            engine_utilization,
            transitions: self.transitions,
            transition_cost: self.transition_cost,
            transition_success_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kline(i: i64, close: Decimal) -> Kline {
        Kline {
            open_time: i * 60_000,
            open: close,
            high: close,
            low: close,
            close,
            volume: dec!(1),
            close_time: (i + 1) * 60_000 - 1,
        }
    }

    fn detector(short: usize, long: usize) -> RegimeDetector {
        RegimeDetector::new(&RegimeBlock {
            short_window: short,
            long_window: long,
            trend_band_pct: dec!(1),
        })
        .unwrap()
    }

    #[test]
    fn test_rising_prices_turn_bullish_after_warmup() {
        let mut det = detector(3, 10);
        let mut regimes = Vec::new();
        for i in 0..20 {
            regimes.push(det.on_bar(&kline(i, Decimal::from(100 + i * 5))));
        }
        assert!(regimes[..9].iter().all(|r| *r == Regime::Sideways));
        assert_eq!(*regimes.last().unwrap(), Regime::Bull);
    }

    #[test]
    fn test_falling_prices_turn_bearish() {
        let mut det = detector(3, 10);
        let mut last = Regime::Sideways;
        for i in 0..20 {
            last = det.on_bar(&kline(i, Decimal::from(300 - i * 5)));
        }
        assert_eq!(last, Regime::Bear);
        det.reset();
        assert!(!det.is_ready());
    }

    #[test]
    fn test_zero_window_is_an_evaluation_error() {
        let result = RegimeDetector::new(&RegimeBlock {
            short_window: 0,
            long_window: 10,
            trend_band_pct: dec!(1),
        });
        assert!(matches!(result, Err(EvaluationError::Indicator { .. })));
    }

    #[test]
    fn test_stats_count_changes_and_transitions() {
        let mut stats = RegimeStats::new();
        stats.observe(Regime::Sideways, false, Decimal::ZERO);
        stats.observe(Regime::Sideways, false, Decimal::ZERO);
        stats.observe(Regime::Bull, true, dec!(-5));
        stats.observe(Regime::Bear, true, dec!(3));
        stats.close_cycle(EngineKind::Accumulation, dec!(12));

        let m = stats.finish();
        assert_eq!(m.regime_changes, 2);
        assert_eq!(m.transitions, 2);
        assert_eq!(m.transition_cost, dec!(5));
        assert_eq!(m.transition_success_rate, 1.0);
        assert!((m.avg_regime_duration_bars - 4.0 / 3.0).abs() < 1e-12);
        assert_eq!(m.engine_pnl[&EngineKind::Accumulation], dec!(12));
        assert_eq!(m.engine_utilization[&EngineKind::Accumulation], 0.5);
    }
}

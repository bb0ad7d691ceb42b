//! Entry-filter signal sources
//!
//! Each enabled indicator feature becomes one `SignalSource`. Sources
//! process klines bar-by-bar and emit Buy/Sell/Hold. A source that has not
//! seen enough bars yet reports `is_ready() == false` and emits `Hold`.

use ta::indicators::{
    BollingerBands, ExponentialMovingAverage, RelativeStrengthIndex, SimpleMovingAverage,
};
use ta::{Next, Reset};

use crate::error::EvaluationError;
use crate::metrics::to_f64;
use crate::params::{Feature, ParameterVector};
use crate::strategy::Signal;
use crate::types::Kline;

// ============================================================================
// Core trait
// ============================================================================

/// Bar-by-bar signal capability
pub trait SignalSource: Send {
    fn name(&self) -> &'static str;
    fn on_bar(&mut self, kline: &Kline) -> Signal;
    fn is_ready(&self) -> bool;
    fn reset(&mut self);
}

fn indicator_error(name: &'static str) -> impl FnOnce(ta::errors::TaError) -> EvaluationError {
    move |e| EvaluationError::Indicator {
        name,
        reason: format!("{e:?}"),
    }
}

// ============================================================================
// 1. RSI
// ============================================================================

pub struct RsiSource {
    rsi: RelativeStrengthIndex,
    period: usize,
    oversold: f64,
    overbought: f64,
    bars_seen: usize,
}

impl RsiSource {
    pub fn new(period: usize, oversold: f64, overbought: f64) -> Result<Self, EvaluationError> {
        Ok(Self {
            rsi: RelativeStrengthIndex::new(period).map_err(indicator_error("RSI"))?,
            period,
            oversold,
            overbought,
            bars_seen: 0,
        })
    }
}

impl SignalSource for RsiSource {
    fn name(&self) -> &'static str {
        "RSI"
    }

    fn on_bar(&mut self, kline: &Kline) -> Signal {
        let val = self.rsi.next(to_f64(kline.close));
        self.bars_seen += 1;
        if !self.is_ready() {
            Signal::Hold
        } else if val < self.oversold {
            Signal::Buy
        } else if val > self.overbought {
            Signal::Sell
        } else {
            Signal::Hold
        }
    }

    fn is_ready(&self) -> bool {
        self.bars_seen > self.period
    }

    fn reset(&mut self) {
        self.rsi.reset();
        self.bars_seen = 0;
    }
}

// ============================================================================
// 2. SMA dip filter
// ============================================================================

/// Buys only while price trades below its moving average
pub struct SmaSource {
    sma: SimpleMovingAverage,
    period: usize,
    bars_seen: usize,
}

impl SmaSource {
    pub fn new(period: usize) -> Result<Self, EvaluationError> {
        Ok(Self {
            sma: SimpleMovingAverage::new(period).map_err(indicator_error("SMA"))?,
            period,
            bars_seen: 0,
        })
    }
}

impl SignalSource for SmaSource {
    fn name(&self) -> &'static str {
        "SMA"
    }

    fn on_bar(&mut self, kline: &Kline) -> Signal {
        let close = to_f64(kline.close);
        let avg = self.sma.next(close);
        self.bars_seen += 1;
        if self.is_ready() && close < avg {
            Signal::Buy
        } else {
            Signal::Hold
        }
    }

    fn is_ready(&self) -> bool {
        self.bars_seen >= self.period
    }

    fn reset(&mut self) {
        self.sma.reset();
        self.bars_seen = 0;
    }
}

// ============================================================================
// 3. EMA trend filter
// ============================================================================

/// Buy while the fast EMA is above the slow one, Sell while below
pub struct EmaCrossSource {
    ema_fast: ExponentialMovingAverage,
    ema_slow: ExponentialMovingAverage,
    slow_period: usize,
    bars_seen: usize,
}

impl EmaCrossSource {
    pub fn new(fast_period: usize, slow_period: usize) -> Result<Self, EvaluationError> {
        Ok(Self {
            ema_fast: ExponentialMovingAverage::new(fast_period)
                .map_err(indicator_error("EMACross"))?,
            ema_slow: ExponentialMovingAverage::new(slow_period)
                .map_err(indicator_error("EMACross"))?,
            slow_period,
            bars_seen: 0,
        })
    }
}

impl SignalSource for EmaCrossSource {
    fn name(&self) -> &'static str {
        "EMACross"
    }

    fn on_bar(&mut self, kline: &Kline) -> Signal {
        let close = to_f64(kline.close);
        let fast = self.ema_fast.next(close);
        let slow = self.ema_slow.next(close);
        self.bars_seen += 1;

        if !self.is_ready() {
            Signal::Hold
        } else if fast > slow {
            Signal::Buy
        } else if fast < slow {
            Signal::Sell
        } else {
            Signal::Hold
        }
    }

    fn is_ready(&self) -> bool {
        self.bars_seen > self.slow_period
    }

    fn reset(&mut self) {
        self.ema_fast.reset();
        self.ema_slow.reset();
        self.bars_seen = 0;
    }
}

// ============================================================================
// 4. Bollinger Bands
// ============================================================================

pub struct BollingerSource {
    bb: BollingerBands,
    period: usize,
    bars_seen: usize,
}

impl BollingerSource {
    pub fn new(period: usize, multiplier: f64) -> Result<Self, EvaluationError> {
        Ok(Self {
            bb: BollingerBands::new(period, multiplier).map_err(indicator_error("BollingerBands"))?,
            period,
            bars_seen: 0,
        })
    }
}

impl SignalSource for BollingerSource {
    fn name(&self) -> &'static str {
        "BollingerBands"
    }

    fn on_bar(&mut self, kline: &Kline) -> Signal {
        let close = to_f64(kline.close);
        let out = self.bb.next(close);
        self.bars_seen += 1;

        if !self.is_ready() || out.upper - out.lower <= 0.0 {
            Signal::Hold
        } else if close < out.lower {
            Signal::Buy
        } else if close > out.upper {
            Signal::Sell
        } else {
            Signal::Hold
        }
    }

    fn is_ready(&self) -> bool {
        self.bars_seen >= self.period
    }

    fn reset(&mut self) {
        self.bb.reset();
        self.bars_seen = 0;
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Build one source per enabled indicator feature, in feature order.
pub fn build_signal_sources(
    params: &ParameterVector,
) -> Result<Vec<Box<dyn SignalSource>>, EvaluationError> {
    let mut sources: Vec<Box<dyn SignalSource>> = Vec::new();

    for feature in params.features.iter().filter(|f| f.is_indicator()) {
        let missing = || EvaluationError::MissingBlock(*feature);
        let source: Box<dyn SignalSource> = match feature {
            Feature::Rsi => {
                let b = params.rsi.as_ref().ok_or_else(missing)?;
                Box::new(RsiSource::new(
                    b.period,
                    to_f64(b.oversold),
                    to_f64(b.overbought),
                )?)
            }
            Feature::Sma => {
                let b = params.sma.as_ref().ok_or_else(missing)?;
                Box::new(SmaSource::new(b.period)?)
            }
            Feature::EmaCross => {
                let b = params.ema_cross.as_ref().ok_or_else(missing)?;
                Box::new(EmaCrossSource::new(b.fast_period, b.slow_period)?)
            }
            Feature::Bollinger => {
                let b = params.bollinger.as_ref().ok_or_else(missing)?;
                Box::new(BollingerSource::new(b.period, to_f64(b.std_dev))?)
            }
            Feature::VolatilitySpacing | Feature::Regime => continue,
        };
        sources.push(source);
    }

    Ok(sources)
}

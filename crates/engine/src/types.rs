//! Types shared by the backtest engine and the optimizer

use std::collections::BTreeSet;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::params::Feature;
use crate::regime::EngineKind;

/// A single candlestick (OHLCV)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    pub open_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub close_time: i64,
}

/// Fixed inputs of a tuning run. These are not searched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BaseConfig {
    pub symbol: String,
    pub interval: String,
    pub initial_capital: Decimal,
    /// Commission as a fraction of notional (e.g., 0.001 = 0.1%)
    pub commission_rate: Decimal,
    /// Orders whose quote value falls below this are skipped
    pub min_order_value: Decimal,
    /// First order of a cycle as percentage of capital (e.g., 5.0 = 5%)
    pub base_order_pct: Decimal,
    /// Maximum number of buys per cycle, including the first
    pub max_dca_levels: u32,
    /// Close at take profit and start a new cycle
    pub cycle_mode: bool,
    pub take_profit_pct: Decimal,
    pub features: BTreeSet<Feature>,
}

impl Default for BaseConfig {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            interval: "1h".to_string(),
            initial_capital: dec!(10000),
            commission_rate: dec!(0.001),
            min_order_value: dec!(10),
            base_order_pct: dec!(5),
            max_dca_levels: 8,
            cycle_mode: true,
            take_profit_pct: dec!(2),
            features: BTreeSet::new(),
        }
    }
}

/// One completed accumulation cycle: every buy of the cycle plus the final sale
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleTrade {
    pub entry_time: i64,
    pub exit_time: i64,
    pub entries: u32,
    pub avg_entry_price: Decimal,
    pub exit_price: Decimal,
    pub size: Decimal,
    pub fees: Decimal,
    pub pnl: Decimal,
    pub pnl_pct: Decimal,
    /// Regime engine active when the cycle opened
    pub engine: Option<EngineKind>,
}

/// A point on the equity curve
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub time: i64,
    pub equity: Decimal,
}

//! Bar-by-bar backtesting engine

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, trace};

use crate::error::EvaluationError;
use crate::fees::{calculate_commission, max_affordable};
use crate::metrics::{DrawdownTracker, MetricsBundle, RunSummary};
use crate::params::ParameterVector;
use crate::regime::{EngineKind, RegimeStats};
use crate::strategy::{Action, DcaStrategy, PositionView};
use crate::types::*;

/// Fewer bars than this cannot produce a single return
const MIN_BARS: usize = 2;

/// Accumulation cycle state during simulation
struct OpenCycle {
    entry_time: i64,
    entries: u32,
    size: Decimal,
    /// Quote spent on fills, commission excluded
    cost: Decimal,
    fees: Decimal,
    last_entry_price: Decimal,
    engine: Option<EngineKind>,
}

impl OpenCycle {
    fn avg_entry_price(&self) -> Decimal {
        if self.size > Decimal::ZERO {
            self.cost / self.size
        } else {
            Decimal::ZERO
        }
    }

    fn view(&self) -> PositionView {
        PositionView {
            entries: self.entries,
            last_entry_price: self.last_entry_price,
            avg_entry_price: self.avg_entry_price(),
        }
    }

    fn unrealized(&self, price: Decimal) -> Decimal {
        self.size * price - self.cost - self.fees
    }
}

/// Cash and cycle bookkeeping for one run
struct Ledger<'a> {
    base: &'a BaseConfig,
    cash: Decimal,
    base_order_value: Decimal,
    max_multiplier: Decimal,
    total_fees: Decimal,
    buy_orders: u32,
    cycle: Option<OpenCycle>,
    trades: Vec<CycleTrade>,
}

impl<'a> Ledger<'a> {
    fn new(params: &ParameterVector, base: &'a BaseConfig) -> Self {
        Self {
            base,
            cash: params.initial_capital,
            base_order_value: params.initial_capital * base.base_order_pct / dec!(100),
            max_multiplier: params.max_multiplier.max(Decimal::ONE),
            total_fees: Decimal::ZERO,
            buy_orders: 0,
            cycle: None,
            trades: Vec::new(),
        }
    }

    fn view(&self) -> PositionView {
        self.cycle.as_ref().map(OpenCycle::view).unwrap_or_default()
    }

    fn equity(&self, price: Decimal) -> Decimal {
        self.cash + self.cycle.as_ref().map_or(Decimal::ZERO, |c| c.size * price)
    }

    /// Order value at `level`, capped to what the cash can pay for
    fn order_value(&self, level: u32) -> Decimal {
        let multiplier = Decimal::from(level + 1).min(self.max_multiplier);
        (self.base_order_value * multiplier).min(max_affordable(self.cash, self.base.commission_rate))
    }

    /// Returns false when the order was skipped
    fn buy(&mut self, kline: &Kline, level: u32, engine: Option<EngineKind>) -> bool {
        let value = self.order_value(level);
        if value < self.base.min_order_value || value <= Decimal::ZERO {
            trace!(level, value = %value, "Order below minimum, skipped");
            return false;
        }

        let fee = calculate_commission(value, self.base.commission_rate);
        let size = value / kline.close;
        self.cash -= value + fee;
        self.total_fees += fee;
        self.buy_orders += 1;

        let cycle = self.cycle.get_or_insert_with(|| OpenCycle {
            entry_time: kline.open_time,
            entries: 0,
            size: Decimal::ZERO,
            cost: Decimal::ZERO,
            fees: Decimal::ZERO,
            last_entry_price: kline.close,
            engine,
        });
        cycle.entries += 1;
        cycle.size += size;
        cycle.cost += value;
        cycle.fees += fee;
        cycle.last_entry_price = kline.close;

        debug!(
            level,
            price = %kline.close,
            value = %value,
            time = kline.open_time,
            "DCA buy"
        );
        true
    }

    fn close(&mut self, price: Decimal, time: i64) -> Option<CycleTrade> {
        let cycle = self.cycle.take()?;
        let proceeds = cycle.size * price;
        let fee = calculate_commission(proceeds, self.base.commission_rate);
        self.cash += proceeds - fee;
        self.total_fees += fee;

        let fees = cycle.fees + fee;
        let invested = cycle.cost + cycle.fees;
        let pnl = proceeds - cycle.cost - fees;
        let pnl_pct = if invested > Decimal::ZERO {
            pnl / invested * dec!(100)
        } else {
            Decimal::ZERO
        };

        let trade = CycleTrade {
            entry_time: cycle.entry_time,
            exit_time: time,
            entries: cycle.entries,
            avg_entry_price: cycle.avg_entry_price(),
            exit_price: price,
            size: cycle.size,
            fees,
            pnl,
            pnl_pct,
            engine: cycle.engine,
        };

        debug!(
            entries = trade.entries,
            avg_entry = %trade.avg_entry_price,
            exit = %price,
            pnl = %pnl,
            "Closed cycle"
        );
        self.trades.push(trade.clone());
        Some(trade)
    }
}

/// Backtesting engine that simulates bar-by-bar execution
pub struct BacktestEngine;

impl BacktestEngine {
    /// Run a backtest of `params` over `klines`.
    ///
    /// Deterministic: the same vector, base and series always give the same
    /// bundle. A fresh strategy is built per call and nothing is shared.
    pub fn run(
        params: &ParameterVector,
        base: &BaseConfig,
        klines: &[Kline],
    ) -> Result<MetricsBundle, EvaluationError> {
        let mut strategy = DcaStrategy::new(params, base)?;
        strategy.reset();

        if klines.len() < MIN_BARS {
            return Ok(MetricsBundle::empty(params.initial_capital));
        }

        debug!(
            symbol = %base.symbol,
            bars = klines.len(),
            capital = %params.initial_capital,
            sources = ?strategy.source_names(),
            spacing = strategy.spacing_name(),
            "Starting backtest"
        );

        let mut ledger = Ledger::new(params, base);
        let mut drawdown = DrawdownTracker::new(params.initial_capital);
        let mut equity_curve: Vec<EquityPoint> = Vec::with_capacity(klines.len());
        let mut regime_stats = params
            .has_feature(crate::params::Feature::Regime)
            .then(RegimeStats::new);

        for kline in klines {
            let action = strategy.decide(kline, &ledger.view());
            let engine = strategy.current_engine();

            match action {
                Action::Buy { level } => {
                    ledger.buy(kline, level, engine);
                }
                Action::TakeProfit => {
                    if let Some(trade) = ledger.close(kline.close, kline.open_time) {
                        if let (Some(stats), Some(engine)) = (regime_stats.as_mut(), trade.engine) {
                            stats.close_cycle(engine, trade.pnl);
                        }
                    }
                }
                Action::Hold => {}
            }

            if let (Some(stats), Some(regime)) = (regime_stats.as_mut(), strategy.current_regime()) {
                let unrealized = ledger
                    .cycle
                    .as_ref()
                    .map_or(Decimal::ZERO, |c| c.unrealized(kline.close));
                stats.observe(regime, ledger.cycle.is_some(), unrealized);
            }

            let equity = ledger.equity(kline.close);
            equity_curve.push(EquityPoint {
                time: kline.open_time,
                equity,
            });
            drawdown.update(equity);
        }

        // Liquidate whatever is still open at the last bar
        if let Some(last) = klines.last() {
            if let Some(trade) = ledger.close(last.close, last.open_time) {
                if let (Some(stats), Some(engine)) = (regime_stats.as_mut(), trade.engine) {
                    stats.close_cycle(engine, trade.pnl);
                }
            }
        }

        let metrics = MetricsBundle::from_run(RunSummary {
            initial_capital: params.initial_capital,
            final_equity: ledger.cash,
            total_fees: ledger.total_fees,
            buy_orders: ledger.buy_orders,
            trades: ledger.trades,
            equity_curve: &equity_curve,
            drawdown,
            regime: regime_stats.map(RegimeStats::finish),
        });

        debug!(
            total_trades = metrics.total_trades,
            buy_orders = metrics.buy_orders,
            total_return_pct = %metrics.total_return_pct,
            max_drawdown_pct = %metrics.max_drawdown_pct,
            "Backtest complete"
        );

        Ok(metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Feature;

    fn make_klines(prices: &[f64]) -> Vec<Kline> {
        prices
            .iter()
            .enumerate()
            .map(|(i, &p)| {
                let price = Decimal::from_str_exact(&format!("{:.2}", p)).unwrap();
                Kline {
                    open_time: (i as i64) * 3_600_000,
                    open: price,
                    high: price + dec!(1),
                    low: price - dec!(1),
                    close: price,
                    volume: dec!(100),
                    close_time: ((i + 1) as i64) * 3_600_000 - 1,
                }
            })
            .collect()
    }

    /// Down 10%, then back up past the start
    fn dip_and_recover() -> Vec<Kline> {
        let mut prices: Vec<f64> = (0..10).map(|i| 100.0 - i as f64).collect();
        prices.extend((0..15).map(|i| 91.0 + i as f64));
        make_klines(&prices)
    }

    fn plain() -> (ParameterVector, BaseConfig) {
        let base = BaseConfig::default();
        let mut params = ParameterVector::from_base(&base);
        params.price_threshold_pct = dec!(2);
        params.threshold_multiplier = dec!(1);
        params.take_profit_pct = dec!(2);
        (params, base)
    }

    #[test]
    fn test_empty_klines() {
        let (params, base) = plain();
        let result = BacktestEngine::run(&params, &base, &[]).unwrap();
        assert_eq!(result.total_trades, 0);
        assert_eq!(result.total_pnl, Decimal::ZERO);

        let one = make_klines(&[100.0]);
        let result = BacktestEngine::run(&params, &base, &one).unwrap();
        assert_eq!(result, MetricsBundle::empty(params.initial_capital));
    }

    #[test]
    fn test_flat_series_never_trades() {
        let (params, base) = plain();
        let klines = make_klines(&[100.0; 50]);
        let result = BacktestEngine::run(&params, &base, &klines).unwrap();
        assert_eq!(result.total_trades, 0);
        assert_eq!(result.buy_orders, 0);
        assert_eq!(result.total_return_pct, Decimal::ZERO);
        assert_eq!(result.bars, 50);
    }

    #[test]
    fn test_dip_is_accumulated_and_sold() {
        let (params, base) = plain();
        let result = BacktestEngine::run(&params, &base, &dip_and_recover()).unwrap();
        assert!(result.buy_orders >= 2, "should average down during the dip");
        assert!(result.total_trades >= 1);
        assert!(result.trades[0].pnl > Decimal::ZERO);
        assert!(result.total_return_pct > Decimal::ZERO);
        assert!(result.total_fees > Decimal::ZERO);
        assert_eq!(
            result.final_equity,
            result.initial_capital + result.total_pnl
        );
    }

    #[test]
    fn test_without_cycle_mode_only_final_liquidation() {
        let (params, mut base) = plain();
        base.cycle_mode = false;
        let result = BacktestEngine::run(&params, &base, &dip_and_recover()).unwrap();
        assert_eq!(result.total_trades, 1);
        assert_eq!(result.trades[0].exit_time, 24 * 3_600_000);
    }

    #[test]
    fn test_orders_below_minimum_are_skipped() {
        let (params, mut base) = plain();
        // 5% of 10000 is exactly the minimum
        base.min_order_value = dec!(500);
        let result = BacktestEngine::run(&params, &base, &dip_and_recover()).unwrap();
        assert!(result.buy_orders > 0);

        // Opening orders are always level 0, so no cycle can ever start
        base.min_order_value = dec!(501);
        let result = BacktestEngine::run(&params, &base, &dip_and_recover()).unwrap();
        assert_eq!(result.buy_orders, 0);
        assert_eq!(result.total_return_pct, Decimal::ZERO);
    }

    #[test]
    fn test_level_cap_limits_buys_per_cycle() {
        let (params, mut base) = plain();
        base.max_dca_levels = 2;
        base.cycle_mode = false;
        let result = BacktestEngine::run(&params, &base, &dip_and_recover()).unwrap();
        assert_eq!(result.buy_orders, 2);
    }

    #[test]
    fn test_backtest_is_deterministic() {
        let base = BaseConfig {
            features: [Feature::Rsi, Feature::VolatilitySpacing, Feature::Regime]
                .into_iter()
                .collect(),
            ..Default::default()
        };
        let params = ParameterVector::from_base(&base);
        let mut prices = Vec::new();
        for i in 0..300 {
            let x = i as f64;
            prices.push(100.0 + 15.0 * (x / 17.0).sin() + 5.0 * (x / 5.0).cos());
        }
        let klines = make_klines(&prices);
        let a = BacktestEngine::run(&params, &base, &klines).unwrap();
        let b = BacktestEngine::run(&params, &base, &klines).unwrap();
        assert_eq!(a, b);
        assert!(a.regime.is_some());
    }

    #[test]
    fn test_missing_block_is_an_evaluation_error() {
        let base = BaseConfig {
            features: [Feature::EmaCross].into_iter().collect(),
            ..Default::default()
        };
        let mut params = ParameterVector::from_base(&base);
        params.ema_cross = None;
        let err = BacktestEngine::run(&params, &base, &dip_and_recover()).unwrap_err();
        assert_eq!(err, EvaluationError::MissingBlock(Feature::EmaCross));
    }
}

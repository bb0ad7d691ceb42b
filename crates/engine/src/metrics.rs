//! Performance metrics computed from a finished backtest

use std::collections::BTreeMap;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::regime::EngineKind;
use crate::types::{CycleTrade, EquityPoint};

const YEAR_MS: f64 = 365.25 * 24.0 * 60.0 * 60.0 * 1000.0;

/// Statistics of the regime-aware strategy variant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeMetrics {
    pub regime_changes: u32,
    pub avg_regime_duration_bars: f64,
    /// Realised P&L per engine, attributed to the engine that opened the cycle
    pub engine_pnl: BTreeMap<EngineKind, Decimal>,
    /// Share of bars each engine was active
    pub engine_utilization: BTreeMap<EngineKind, f64>,
    /// Regime changes that happened while a position was open
    pub transitions: u32,
    /// Unrealised loss carried across those transitions
    pub transition_cost: Decimal,
    /// Fraction of transitions whose cycle still closed in profit
    pub transition_success_rate: f64,
}

/// Everything one backtest produces
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsBundle {
    pub initial_capital: Decimal,
    pub final_equity: Decimal,
    pub total_pnl: Decimal,
    pub total_return_pct: Decimal,
    pub annualized_return_pct: f64,
    pub max_drawdown: Decimal,
    pub max_drawdown_pct: Decimal,
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    pub win_rate: Decimal,
    pub buy_orders: u32,
    pub total_fees: Decimal,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub calmar_ratio: f64,
    /// 5th percentile of the per-bar return distribution
    pub var_95: f64,
    pub bars: usize,
    pub trades: Vec<CycleTrade>,
    pub regime: Option<RegimeMetrics>,
}

impl MetricsBundle {
    /// Zero trades, zero return
    pub fn empty(initial_capital: Decimal) -> Self {
        Self {
            initial_capital,
            final_equity: initial_capital,
            total_pnl: Decimal::ZERO,
            total_return_pct: Decimal::ZERO,
            annualized_return_pct: 0.0,
            max_drawdown: Decimal::ZERO,
            max_drawdown_pct: Decimal::ZERO,
            total_trades: 0,
            winning_trades: 0,
            losing_trades: 0,
            win_rate: Decimal::ZERO,
            buy_orders: 0,
            total_fees: Decimal::ZERO,
            sharpe_ratio: 0.0,
            sortino_ratio: 0.0,
            calmar_ratio: 0.0,
            var_95: 0.0,
            bars: 0,
            trades: Vec::new(),
            regime: None,
        }
    }

    pub fn from_run(run: RunSummary<'_>) -> Self {
        let hundred = dec!(100);

        let total_trades = run.trades.len() as u32;
        let winning_trades = run.trades.iter().filter(|t| t.pnl > Decimal::ZERO).count() as u32;
        let losing_trades = run.trades.iter().filter(|t| t.pnl < Decimal::ZERO).count() as u32;
        let win_rate = if total_trades > 0 {
            Decimal::from(winning_trades) / Decimal::from(total_trades) * hundred
        } else {
            Decimal::ZERO
        };

        let total_pnl = run.final_equity - run.initial_capital;
        let total_return_pct = if run.initial_capital > Decimal::ZERO {
            total_pnl / run.initial_capital * hundred
        } else {
            Decimal::ZERO
        };

        let returns = period_returns(run.equity_curve);
        let ppy = periods_per_year(run.equity_curve);
        let years = span_years(run.equity_curve);
        let annualized_return_pct = annualized_return_pct(to_f64(total_return_pct) / 100.0, years);
        let max_drawdown_pct = run.drawdown.max_drawdown_pct();
        let calmar_ratio = if max_drawdown_pct > Decimal::ZERO {
            annualized_return_pct / to_f64(max_drawdown_pct)
        } else {
            0.0
        };

        Self {
            initial_capital: run.initial_capital,
            final_equity: run.final_equity,
            total_pnl,
            total_return_pct,
            annualized_return_pct,
            max_drawdown: run.drawdown.max_drawdown(),
            max_drawdown_pct,
            total_trades,
            winning_trades,
            losing_trades,
            win_rate,
            buy_orders: run.buy_orders,
            total_fees: run.total_fees,
            sharpe_ratio: sharpe_ratio(&returns, ppy),
            sortino_ratio: sortino_ratio(&returns, ppy),
            calmar_ratio,
            var_95: value_at_risk_95(&returns),
            bars: run.equity_curve.len(),
            trades: run.trades,
            regime: run.regime,
        }
    }
}

/// Raw trace of a finished simulation
pub struct RunSummary<'a> {
    pub initial_capital: Decimal,
    pub final_equity: Decimal,
    pub total_fees: Decimal,
    pub buy_orders: u32,
    pub trades: Vec<CycleTrade>,
    pub equity_curve: &'a [EquityPoint],
    pub drawdown: DrawdownTracker,
    pub regime: Option<RegimeMetrics>,
}

/// Running peak-to-trough tracker
#[derive(Debug, Clone, Default)]
pub struct DrawdownTracker {
    peak: Decimal,
    max_drawdown: Decimal,
    max_drawdown_pct: Decimal,
}

impl DrawdownTracker {
    pub fn new(start_equity: Decimal) -> Self {
        Self {
            peak: start_equity,
            ..Default::default()
        }
    }

    pub fn update(&mut self, equity: Decimal) {
        if equity > self.peak {
            self.peak = equity;
        }
        let drawdown = self.peak - equity;
        if drawdown > self.max_drawdown {
            self.max_drawdown = drawdown;
        }
        if self.peak > Decimal::ZERO {
            let pct = drawdown / self.peak * dec!(100);
            if pct > self.max_drawdown_pct {
                self.max_drawdown_pct = pct;
            }
        }
    }

    pub fn max_drawdown(&self) -> Decimal {
        self.max_drawdown
    }

    pub fn max_drawdown_pct(&self) -> Decimal {
        self.max_drawdown_pct
    }
}

pub(crate) fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

/// Simple per-bar returns of the equity curve
pub fn period_returns(curve: &[EquityPoint]) -> Vec<f64> {
    curve
        .windows(2)
        .map(|w| {
            let prev = to_f64(w[0].equity);
            if prev > 0.0 {
                (to_f64(w[1].equity) - prev) / prev
            } else {
                0.0
            }
        })
        .collect()
}

fn span_years(curve: &[EquityPoint]) -> f64 {
    match (curve.first(), curve.last()) {
        (Some(first), Some(last)) if last.time > first.time => {
            (last.time - first.time) as f64 / YEAR_MS
        }
        _ => 0.0,
    }
}

fn periods_per_year(curve: &[EquityPoint]) -> f64 {
    let years = span_years(curve);
    if curve.len() < 2 || years <= 0.0 {
        return 1.0;
    }
    (curve.len() - 1) as f64 / years
}

fn annualized_return_pct(total_return: f64, years: f64) -> f64 {
    if years <= 0.0 {
        return 0.0;
    }
    let growth = 1.0 + total_return;
    if growth <= 0.0 {
        return -100.0;
    }
    (growth.powf(1.0 / years) - 1.0) * 100.0
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Annualised Sharpe ratio, zero when undefined
pub fn sharpe_ratio(returns: &[f64], periods_per_year: f64) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let n = returns.len() as f64;
    let m = mean(returns);
    let variance = returns.iter().map(|r| (r - m).powi(2)).sum::<f64>() / (n - 1.0);
    let std_dev = variance.sqrt();
    if std_dev < 1e-12 {
        return 0.0;
    }
    m / std_dev * periods_per_year.sqrt()
}

/// Annualised Sortino ratio, zero when there is no downside
pub fn sortino_ratio(returns: &[f64], periods_per_year: f64) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let n = returns.len() as f64;
    let downside = (returns.iter().map(|r| r.min(0.0).powi(2)).sum::<f64>() / n).sqrt();
    if downside < 1e-12 {
        return 0.0;
    }
    mean(returns) / downside * periods_per_year.sqrt()
}

/// Nearest-rank 5th percentile
pub fn value_at_risk_95(returns: &[f64]) -> f64 {
    if returns.is_empty() {
        return 0.0;
    }
    let mut sorted = returns.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = ((sorted.len() as f64) * 0.05).ceil().max(1.0) as usize;
    sorted[rank - 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn curve(equities: &[i64], step_ms: i64) -> Vec<EquityPoint> {
        equities
            .iter()
            .enumerate()
            .map(|(i, &e)| EquityPoint {
                time: i as i64 * step_ms,
                equity: Decimal::from(e),
            })
            .collect()
    }

    #[test]
    fn test_drawdown_tracks_running_peak() {
        let mut dd = DrawdownTracker::new(dec!(100));
        for e in [dec!(110), dec!(99), dec!(120), dec!(108), dec!(115)] {
            dd.update(e);
        }
        assert_eq!(dd.max_drawdown(), dec!(12));
        assert_eq!(dd.max_drawdown_pct(), dec!(10));
    }

    #[test]
    fn test_ratios_are_zero_on_flat_curve() {
        let returns = period_returns(&curve(&[100, 100, 100, 100], 60_000));
        assert_eq!(returns, vec![0.0, 0.0, 0.0]);
        assert_eq!(sharpe_ratio(&returns, 365.0), 0.0);
        assert_eq!(sortino_ratio(&returns, 365.0), 0.0);
        assert_eq!(value_at_risk_95(&returns), 0.0);
        assert_eq!(value_at_risk_95(&[]), 0.0);
    }

    #[test]
    fn test_sharpe_sign_follows_mean() {
        assert!(sharpe_ratio(&[0.01, 0.02, -0.005, 0.015], 252.0) > 0.0);
        assert!(sharpe_ratio(&[-0.01, -0.02, 0.005, -0.015], 252.0) < 0.0);
        // No negative returns: Sortino undefined
        assert_eq!(sortino_ratio(&[0.01, 0.02], 252.0), 0.0);
    }

    #[test]
    fn test_var_is_fifth_percentile() {
        let returns: Vec<f64> = (1..=40).map(|i| i as f64 / 100.0 - 0.2).collect();
        // ceil(40 * 0.05) = 2nd smallest
        assert!((value_at_risk_95(&returns) - (-0.18)).abs() < 1e-12);
    }

    #[test]
    fn test_annualized_return_over_one_year() {
        assert!((annualized_return_pct(0.10, 1.0) - 10.0).abs() < 1e-9);
        assert!((annualized_return_pct(0.21, 2.0) - 10.0).abs() < 1e-9);
        assert_eq!(annualized_return_pct(0.5, 0.0), 0.0);
        assert_eq!(annualized_return_pct(-1.5, 1.0), -100.0);
    }

    fn cycle(exit_time: i64, pnl: Decimal) -> CycleTrade {
        CycleTrade {
            entry_time: 0,
            exit_time,
            entries: 1,
            avg_entry_price: dec!(100),
            exit_price: dec!(100) + pnl,
            size: dec!(1),
            fees: Decimal::ZERO,
            pnl,
            pnl_pct: pnl,
            engine: None,
        }
    }

    #[test]
    fn test_breakeven_cycles_are_neither_wins_nor_losses() {
        let equity = curve(&[1000, 1010, 1010, 1005], 3_600_000);
        let m = MetricsBundle::from_run(RunSummary {
            initial_capital: dec!(1000),
            final_equity: dec!(1005),
            total_fees: Decimal::ZERO,
            buy_orders: 3,
            trades: vec![cycle(1, dec!(10)), cycle(2, Decimal::ZERO), cycle(3, dec!(-5))],
            equity_curve: &equity,
            drawdown: DrawdownTracker::new(dec!(1000)),
            regime: None,
        });
        assert_eq!(m.total_trades, 3);
        assert_eq!(m.winning_trades, 1);
        assert_eq!(m.losing_trades, 1);
    }

    #[test]
    fn test_empty_bundle_is_neutral() {
        let m = MetricsBundle::empty(dec!(1000));
        assert_eq!(m.final_equity, dec!(1000));
        assert_eq!(m.total_trades, 0);
        assert_eq!(m.total_return_pct, Decimal::ZERO);
    }
}

//! Performance metrics over a finished run.
//!
//! Ledger values stay exact; ratios are reported as `f64`.

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

use super::backtest::BacktestResult;
use super::error::{BacktestError, OrOverflow};
use super::order::Fill;
use super::portfolio::EquityPoint;

#[derive(Debug, Clone, PartialEq)]
pub struct Metrics {
    pub initial_capital: Decimal,
    pub final_value: Decimal,
    pub total_return: f64,
    pub max_drawdown: f64,
    /// Longest run of samples spent below a prior peak.
    pub max_drawdown_duration: usize,
    pub sharpe_ratio: f64,
    pub fill_count: usize,
    /// Fills that reduced or closed a position.
    pub closing_fills: usize,
    pub winning_fills: usize,
    pub losing_fills: usize,
    pub win_rate: f64,
    pub realized_pnl: Decimal,
    pub total_commission: Decimal,
}

impl Metrics {
    pub fn compute(result: &BacktestResult) -> Result<Self, BacktestError> {
        let initial_capital = result.account.initial_capital;
        let final_value = result
            .equity_curve
            .last()
            .map(|p| p.total_value)
            .unwrap_or(result.account.total_value);

        let total_return = if initial_capital > Decimal::ZERO {
            let gain = final_value
                .checked_sub(initial_capital)
                .or_overflow("total return")?;
            to_f64(gain.checked_div(initial_capital).or_overflow("total return")?)
        } else {
            0.0
        };

        let (max_drawdown, max_drawdown_duration) = compute_drawdown(&result.equity_curve);
        let sharpe_ratio = compute_sharpe(&result.equity_curve);
        let stats = FillStats::from_fills(&result.fills)?;

        Ok(Metrics {
            initial_capital,
            final_value,
            total_return,
            max_drawdown,
            max_drawdown_duration,
            sharpe_ratio,
            fill_count: result.fills.len(),
            closing_fills: stats.closing,
            winning_fills: stats.won,
            losing_fills: stats.lost,
            win_rate: stats.win_rate(),
            realized_pnl: stats.realized,
            total_commission: stats.commission,
        })
    }
}

#[derive(Debug, Default)]
struct FillStats {
    closing: usize,
    won: usize,
    lost: usize,
    realized: Decimal,
    commission: Decimal,
}

impl FillStats {
    fn from_fills(fills: &[Fill]) -> Result<Self, BacktestError> {
        let mut stats = FillStats::default();
        for fill in fills {
            stats.commission = stats
                .commission
                .checked_add(fill.commission)
                .or_overflow("total commission")?;
            if fill.realized_pnl.is_zero() {
                continue;
            }
            stats.closing += 1;
            stats.realized = stats
                .realized
                .checked_add(fill.realized_pnl)
                .or_overflow("total realized pnl")?;
            if fill.realized_pnl > Decimal::ZERO {
                stats.won += 1;
            } else {
                stats.lost += 1;
            }
        }
        Ok(stats)
    }

    fn win_rate(&self) -> f64 {
        if self.closing > 0 {
            self.won as f64 / self.closing as f64
        } else {
            0.0
        }
    }
}

fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

fn compute_drawdown(equity_curve: &[EquityPoint]) -> (f64, usize) {
    let Some(first) = equity_curve.first() else {
        return (0.0, 0);
    };

    let mut peak = first.total_value;
    let mut max_dd = 0.0_f64;
    let mut max_duration = 0usize;
    let mut current_duration = 0usize;

    for point in equity_curve {
        if point.total_value >= peak {
            peak = point.total_value;
            current_duration = 0;
        } else if peak > Decimal::ZERO {
            let dd = to_f64((peak - point.total_value) / peak);
            max_dd = max_dd.max(dd);
            current_duration += 1;
            max_duration = max_duration.max(current_duration);
        }
    }

    (max_dd, max_duration)
}

/// Per-sample Sharpe ratio (mean over population stddev of simple returns),
/// not annualized since bar spacing is arbitrary.
fn compute_sharpe(equity_curve: &[EquityPoint]) -> f64 {
    if equity_curve.len() < 2 {
        return 0.0;
    }

    let returns: Vec<f64> = equity_curve
        .windows(2)
        .map(|w| {
            let prev = w[0].total_value;
            if prev > Decimal::ZERO {
                to_f64((w[1].total_value - prev) / prev)
            } else {
                0.0
            }
        })
        .collect();

    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
    let stddev = variance.sqrt();

    if stddev > 0.0 { mean / stddev } else { 0.0 }
}

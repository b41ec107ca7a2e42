//! Strategy interface and the built-in strategies.

use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use super::bar::Bar;
use super::context::StrategyContext;
use super::error::BacktestError;

/// User trading logic, driven once per simulated timestamp.
pub trait Strategy {
    fn name(&self) -> &str;

    /// Called once at the first timestamp, before any bar is handled.
    fn initialize(&mut self, _ctx: &mut StrategyContext<'_>) -> Result<(), BacktestError> {
        Ok(())
    }

    /// Called with the bars stamped exactly at the current time.
    fn handle_bar(
        &mut self,
        ctx: &mut StrategyContext<'_>,
        bars: &BTreeMap<String, Bar>,
    ) -> Result<(), BacktestError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    BuyAndHold,
    SmaCross,
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buy_and_hold" => Ok(StrategyKind::BuyAndHold),
            "sma_cross" => Ok(StrategyKind::SmaCross),
            other => Err(format!(
                "unknown strategy '{other}', expected buy_and_hold or sma_cross"
            )),
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyKind::BuyAndHold => write!(f, "buy_and_hold"),
            StrategyKind::SmaCross => write!(f, "sma_cross"),
        }
    }
}

/// Parameters for the built-in strategies, as read from `[strategy]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyConfig {
    pub kind: StrategyKind,
    pub target_percent: Decimal,
    pub fast: usize,
    pub slow: usize,
}

pub fn build_strategy(config: &StrategyConfig) -> Box<dyn Strategy> {
    match config.kind {
        StrategyKind::BuyAndHold => Box::new(BuyAndHold::new(config.target_percent)),
        StrategyKind::SmaCross => Box::new(SmaCross::new(
            config.fast,
            config.slow,
            config.target_percent,
        )),
    }
}

/// Splits `target_pct` evenly across all symbols and buys each one on its
/// first bar.
#[derive(Debug, Clone)]
pub struct BuyAndHold {
    target_pct: Decimal,
    weight: Decimal,
    invested: BTreeSet<String>,
}

impl BuyAndHold {
    pub fn new(target_pct: Decimal) -> Self {
        BuyAndHold {
            target_pct,
            weight: target_pct,
            invested: BTreeSet::new(),
        }
    }
}

impl Strategy for BuyAndHold {
    fn name(&self) -> &str {
        "buy_and_hold"
    }

    fn initialize(&mut self, ctx: &mut StrategyContext<'_>) -> Result<(), BacktestError> {
        let count = ctx.symbols().len().max(1);
        self.weight = self.target_pct / Decimal::from(count);
        Ok(())
    }

    fn handle_bar(
        &mut self,
        ctx: &mut StrategyContext<'_>,
        bars: &BTreeMap<String, Bar>,
    ) -> Result<(), BacktestError> {
        for symbol in bars.keys() {
            if self.invested.contains(symbol) {
                continue;
            }
            ctx.order_target_percent(symbol, self.weight)?;
            self.invested.insert(symbol.clone());
        }
        Ok(())
    }
}

/// Goes long when the fast SMA of closes crosses above the slow one and
/// exits when it crosses back below.
#[derive(Debug, Clone)]
pub struct SmaCross {
    fast: usize,
    slow: usize,
    target_pct: Decimal,
    weight: Decimal,
}

impl SmaCross {
    pub fn new(fast: usize, slow: usize, target_pct: Decimal) -> Self {
        SmaCross {
            fast,
            slow,
            target_pct,
            weight: target_pct,
        }
    }
}

fn sma(closes: &[Decimal]) -> Decimal {
    if closes.is_empty() {
        return Decimal::ZERO;
    }
    closes.iter().sum::<Decimal>() / Decimal::from(closes.len())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cross {
    Up,
    Down,
    None,
}

fn detect_cross(closes: &[Decimal], fast: usize, slow: usize) -> Cross {
    let n = closes.len();
    if fast == 0 || slow <= fast || n < slow + 1 {
        return Cross::None;
    }
    let now = &closes[1..];
    let prev = &closes[..n - 1];
    let fast_now = sma(&now[now.len() - fast..]);
    let slow_now = sma(&now[now.len() - slow..]);
    let fast_prev = sma(&prev[prev.len() - fast..]);
    let slow_prev = sma(&prev[prev.len() - slow..]);

    if fast_prev <= slow_prev && fast_now > slow_now {
        Cross::Up
    } else if fast_prev >= slow_prev && fast_now < slow_now {
        Cross::Down
    } else {
        Cross::None
    }
}

impl Strategy for SmaCross {
    fn name(&self) -> &str {
        "sma_cross"
    }

    fn initialize(&mut self, ctx: &mut StrategyContext<'_>) -> Result<(), BacktestError> {
        if self.fast == 0 || self.slow <= self.fast {
            return Err(BacktestError::strategy(format!(
                "sma_cross needs 0 < fast < slow, got fast={} slow={}",
                self.fast, self.slow
            )));
        }
        let count = ctx.symbols().len().max(1);
        self.weight = self.target_pct / Decimal::from(count);
        Ok(())
    }

    fn handle_bar(
        &mut self,
        ctx: &mut StrategyContext<'_>,
        bars: &BTreeMap<String, Bar>,
    ) -> Result<(), BacktestError> {
        for symbol in bars.keys() {
            let closes: Vec<Decimal> = ctx
                .get_klines(symbol, self.slow + 1)?
                .iter()
                .map(|bar| bar.close)
                .collect();
            match detect_cross(&closes, self.fast, self.slow) {
                Cross::Up => {
                    ctx.order_target_percent(symbol, self.weight)?;
                }
                Cross::Down if !ctx.get_position(symbol).is_flat() => {
                    ctx.order_target_percent(symbol, Decimal::ZERO)?;
                }
                _ => {}
            }
        }
        Ok(())
    }
}

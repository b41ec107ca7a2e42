#![allow(dead_code)]

use backsim::domain::backtest::BacktestConfig;
pub use backsim::domain::bar::Bar;
use backsim::domain::context::StrategyContext;
use backsim::domain::error::BacktestError;
use backsim::domain::execution::{CommissionSchedule, PriceBasis};
use backsim::domain::strategy::Strategy;
use backsim::ports::data_port::DataPort;
use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{BTreeMap, HashMap};

pub struct MockDataPort {
    pub data: HashMap<String, Vec<Bar>>,
    pub errors: HashMap<String, String>,
}

impl MockDataPort {
    pub fn new() -> Self {
        Self {
            data: HashMap::new(),
            errors: HashMap::new(),
        }
    }

    pub fn with_bars(mut self, symbol: &str, bars: Vec<Bar>) -> Self {
        self.data.insert(symbol.to_string(), bars);
        self
    }

    pub fn with_error(mut self, symbol: &str, reason: &str) -> Self {
        self.errors.insert(symbol.to_string(), reason.to_string());
        self
    }
}

impl DataPort for MockDataPort {
    fn fetch_bars(
        &self,
        symbol: &str,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<Bar>, BacktestError> {
        if let Some(reason) = self.errors.get(symbol) {
            return Err(BacktestError::Data {
                reason: reason.clone(),
            });
        }
        Ok(self
            .data
            .get(symbol)
            .map(|bars| {
                bars.iter()
                    .filter(|b| b.timestamp >= start && b.timestamp <= end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn list_symbols(&self) -> Result<Vec<String>, BacktestError> {
        let mut symbols: Vec<String> = self.data.keys().cloned().collect();
        symbols.sort();
        Ok(symbols)
    }

    fn get_data_range(
        &self,
        symbol: &str,
    ) -> Result<Option<(NaiveDateTime, NaiveDateTime, usize)>, BacktestError> {
        match self.data.get(symbol) {
            Some(bars) if !bars.is_empty() => {
                let min = bars.iter().map(|b| b.timestamp).min().unwrap();
                let max = bars.iter().map(|b| b.timestamp).max().unwrap();
                Ok(Some((min, max, bars.len())))
            }
            _ => Ok(None),
        }
    }
}

pub fn ts(date: &str) -> NaiveDateTime {
    NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
}

/// Flat bar at `close` with a one-unit range either side.
pub fn make_bar(symbol: &str, date: &str, close: Decimal) -> Bar {
    Bar {
        symbol: symbol.to_string(),
        timestamp: ts(date),
        open: close,
        high: close + Decimal::ONE,
        low: close - Decimal::ONE,
        close,
        volume: dec!(1000),
        open_interest: Decimal::ZERO,
    }
}

/// One bar per day from 2024-01-01 with the given closes.
pub fn generate_bars(symbol: &str, closes: &[Decimal]) -> Vec<Bar> {
    let base = ts("2024-01-01");
    closes
        .iter()
        .enumerate()
        .map(|(i, &close)| {
            let mut bar = make_bar(symbol, "2024-01-01", close);
            bar.timestamp = base + chrono::Duration::days(i as i64);
            bar
        })
        .collect()
}

pub fn sample_config(symbols: &[&str]) -> BacktestConfig {
    BacktestConfig {
        symbols: symbols.iter().map(|s| s.to_string()).collect(),
        start: ts("2024-01-01"),
        end: ts("2024-12-31"),
        initial_capital: dec!(1000000),
        commission: CommissionSchedule {
            rate: dec!(0.0003),
            minimum: dec!(5),
        },
        market_fill: PriceBasis::Close,
    }
}

/// Buys a fixed quantity of one symbol on the first step.
pub struct BuyOnce {
    pub symbol: String,
    pub quantity: Decimal,
    done: bool,
}

impl BuyOnce {
    pub fn new(symbol: &str, quantity: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            quantity,
            done: false,
        }
    }
}

impl Strategy for BuyOnce {
    fn name(&self) -> &str {
        "buy_once"
    }

    fn handle_bar(
        &mut self,
        ctx: &mut StrategyContext<'_>,
        _bars: &BTreeMap<String, Bar>,
    ) -> Result<(), BacktestError> {
        if !self.done {
            ctx.buy(&self.symbol, self.quantity)?;
            self.done = true;
        }
        Ok(())
    }
}

/// Fails on the given step, either with an error or a panic.
pub struct FailAt {
    pub step: usize,
    pub panic: bool,
    seen: usize,
}

impl FailAt {
    pub fn error(step: usize) -> Self {
        Self {
            step,
            panic: false,
            seen: 0,
        }
    }

    pub fn panic(step: usize) -> Self {
        Self {
            step,
            panic: true,
            seen: 0,
        }
    }
}

impl Strategy for FailAt {
    fn name(&self) -> &str {
        "fail_at"
    }

    fn handle_bar(
        &mut self,
        _ctx: &mut StrategyContext<'_>,
        _bars: &BTreeMap<String, Bar>,
    ) -> Result<(), BacktestError> {
        let step = self.seen;
        self.seen += 1;
        if step == self.step {
            if self.panic {
                panic!("boom at step {step}");
            }
            return Err(BacktestError::strategy(format!("gave up at step {step}")));
        }
        Ok(())
    }
}

/// Records the timestamps it is driven with.
#[derive(Default)]
pub struct Recorder {
    pub seen: Vec<NaiveDateTime>,
    pub symbols_per_step: Vec<Vec<String>>,
}

impl Strategy for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn handle_bar(
        &mut self,
        ctx: &mut StrategyContext<'_>,
        bars: &BTreeMap<String, Bar>,
    ) -> Result<(), BacktestError> {
        self.seen.push(ctx.now());
        self.symbols_per_step.push(bars.keys().cloned().collect());
        Ok(())
    }
}

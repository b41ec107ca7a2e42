//! Historical bar replay.
//!
//! Holds one time-ordered series per symbol and a read cursor per series that
//! only moves forward with the driving clock. Queries anchored before the
//! clock are rejected with [`BacktestError::InvalidTimeOrder`].

use crate::domain::bar::Bar;
use crate::domain::error::BacktestError;
use crate::ports::data_port::DataPort;
use chrono::NaiveDateTime;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone)]
struct Series {
    bars: Vec<Bar>,
    /// Number of bars with `timestamp <= clock`.
    cursor: usize,
}

impl Series {
    fn new(bars: Vec<Bar>) -> Self {
        Self { bars, cursor: 0 }
    }

    fn advance(&mut self, at_time: NaiveDateTime) {
        while self.cursor < self.bars.len() && self.bars[self.cursor].timestamp <= at_time {
            self.cursor += 1;
        }
    }

    fn visible(&self) -> &[Bar] {
        &self.bars[..self.cursor]
    }
}

#[derive(Debug, Clone)]
pub struct DataReplay {
    series: BTreeMap<String, Series>,
    clock: Option<NaiveDateTime>,
}

impl DataReplay {
    /// Fetch every symbol from `provider`, keeping bars in `[start, end]`.
    pub fn load(
        provider: &dyn DataPort,
        symbols: &[String],
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Self, BacktestError> {
        let mut series = BTreeMap::new();

        for symbol in symbols {
            let bars = provider.fetch_bars(symbol, start, end)?;
            let bars = normalize(symbol, bars, start, end);
            if bars.is_empty() {
                return Err(BacktestError::DataUnavailable {
                    symbol: symbol.clone(),
                });
            }
            tracing::debug!(symbol = %symbol, bars = bars.len(), "loaded bar series");
            series.insert(symbol.clone(), Series::new(bars));
        }

        Ok(Self {
            series,
            clock: None,
        })
    }

    /// Build a replay from already-loaded series.
    pub fn from_bars(bars: BTreeMap<String, Vec<Bar>>) -> Result<Self, BacktestError> {
        let mut series = BTreeMap::new();
        for (symbol, bars) in bars {
            let bars = normalize(&symbol, bars, NaiveDateTime::MIN, NaiveDateTime::MAX);
            if bars.is_empty() {
                return Err(BacktestError::DataUnavailable { symbol });
            }
            series.insert(symbol, Series::new(bars));
        }
        Ok(Self {
            series,
            clock: None,
        })
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.series.keys().map(String::as_str)
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.series.contains_key(symbol)
    }

    pub fn bar_count(&self, symbol: &str) -> usize {
        self.series.get(symbol).map_or(0, |s| s.bars.len())
    }

    pub fn clock(&self) -> Option<NaiveDateTime> {
        self.clock
    }

    /// Sorted union of every timestamp across all symbols.
    pub fn timeline(&self) -> Vec<NaiveDateTime> {
        let unique: BTreeSet<NaiveDateTime> = self
            .series
            .values()
            .flat_map(|s| s.bars.iter().map(|bar| bar.timestamp))
            .collect();
        unique.into_iter().collect()
    }

    /// Move the clock and every cursor forward to `at_time`.
    pub fn advance_to(&mut self, at_time: NaiveDateTime) -> Result<(), BacktestError> {
        self.check_order("*", at_time)?;
        for series in self.series.values_mut() {
            series.advance(at_time);
        }
        self.clock = Some(at_time);
        Ok(())
    }

    /// The bar stamped exactly `at_time`, if any. No forward fill.
    pub fn current_bar(
        &mut self,
        symbol: &str,
        at_time: NaiveDateTime,
    ) -> Result<Option<Bar>, BacktestError> {
        let series = self.seek(symbol, at_time)?;
        Ok(series
            .visible()
            .last()
            .filter(|bar| bar.timestamp == at_time)
            .cloned())
    }

    /// Up to `count` bars ending at or before `at_time`, oldest first.
    pub fn historical_bars(
        &mut self,
        symbol: &str,
        at_time: NaiveDateTime,
        count: usize,
    ) -> Result<Vec<Bar>, BacktestError> {
        let visible = self.seek(symbol, at_time)?.visible();
        let from = visible.len().saturating_sub(count);
        Ok(visible[from..].to_vec())
    }

    /// Bars stamped exactly `at_time`, keyed by symbol. Symbols without a bar
    /// at that instant are absent.
    pub fn bars_at(&mut self, at_time: NaiveDateTime) -> Result<BTreeMap<String, Bar>, BacktestError> {
        self.advance_to(at_time)?;
        Ok(self
            .series
            .iter()
            .filter_map(|(symbol, series)| {
                series
                    .visible()
                    .last()
                    .filter(|bar| bar.timestamp == at_time)
                    .map(|bar| (symbol.clone(), bar.clone()))
            })
            .collect())
    }

    fn seek(&mut self, symbol: &str, at_time: NaiveDateTime) -> Result<&Series, BacktestError> {
        self.check_order(symbol, at_time)?;
        if !self.series.contains_key(symbol) {
            return Err(BacktestError::DataUnavailable {
                symbol: symbol.to_string(),
            });
        }
        self.advance_to(at_time)?;
        Ok(&self.series[symbol])
    }

    fn check_order(&self, symbol: &str, at_time: NaiveDateTime) -> Result<(), BacktestError> {
        match self.clock {
            Some(current) if at_time < current => Err(BacktestError::InvalidTimeOrder {
                symbol: symbol.to_string(),
                requested: at_time,
                current,
            }),
            _ => Ok(()),
        }
    }
}

fn normalize(
    symbol: &str,
    mut bars: Vec<Bar>,
    start: NaiveDateTime,
    end: NaiveDateTime,
) -> Vec<Bar> {
    bars.retain(|bar| bar.timestamp >= start && bar.timestamp <= end);
    bars.sort_by_key(|bar| bar.timestamp);
    let before = bars.len();
    bars.dedup_by_key(|bar| bar.timestamp);
    if bars.len() != before {
        tracing::warn!(
            symbol,
            dropped = before - bars.len(),
            "duplicate timestamps in bar series, keeping first"
        );
    }
    bars
}

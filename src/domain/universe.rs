//! Symbol universe: parsing the configured symbol list and checking each
//! symbol's data coverage before a run.

use crate::domain::error::BacktestError;
use crate::ports::data_port::DataPort;
use chrono::NaiveDateTime;
use std::collections::HashSet;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum UniverseError {
    #[error("empty symbol list")]
    Empty,

    #[error("empty token in symbol list")]
    EmptyToken,

    #[error("duplicate symbol: {0}")]
    DuplicateSymbol(String),
}

/// Split a comma-separated symbol list, trimming whitespace. Order is kept.
pub fn parse_symbols(input: &str) -> Result<Vec<String>, UniverseError> {
    if input.trim().is_empty() {
        return Err(UniverseError::Empty);
    }

    let mut symbols = Vec::new();
    let mut seen = HashSet::new();

    for token in input.split(',') {
        let symbol = token.trim();
        if symbol.is_empty() {
            return Err(UniverseError::EmptyToken);
        }
        if !seen.insert(symbol.to_string()) {
            return Err(UniverseError::DuplicateSymbol(symbol.to_string()));
        }
        symbols.push(symbol.to_string());
    }

    Ok(symbols)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolCoverage {
    pub symbol: String,
    pub bars: usize,
    pub first: Option<NaiveDateTime>,
    pub last: Option<NaiveDateTime>,
}

impl SymbolCoverage {
    pub fn is_empty(&self) -> bool {
        self.bars == 0
    }
}

/// Count the bars each symbol has in `[start, end]`. Symbols without data are
/// reported, not rejected; callers decide whether that is fatal.
pub fn survey_symbols(
    data_port: &dyn DataPort,
    symbols: &[String],
    start: NaiveDateTime,
    end: NaiveDateTime,
) -> Result<Vec<SymbolCoverage>, BacktestError> {
    let mut coverage = Vec::with_capacity(symbols.len());

    for symbol in symbols {
        let bars = match data_port.fetch_bars(symbol, start, end) {
            Ok(bars) => bars,
            Err(BacktestError::DataUnavailable { .. }) => Vec::new(),
            Err(e) => return Err(e),
        };
        let in_range: Vec<_> = bars
            .iter()
            .map(|bar| bar.timestamp)
            .filter(|ts| *ts >= start && *ts <= end)
            .collect();

        let entry = SymbolCoverage {
            symbol: symbol.clone(),
            bars: in_range.len(),
            first: in_range.iter().min().copied(),
            last: in_range.iter().max().copied(),
        };
        if entry.is_empty() {
            tracing::warn!(symbol = %symbol, "no bars in requested range");
        } else {
            tracing::debug!(symbol = %symbol, bars = entry.bars, "symbol coverage");
        }
        coverage.push(entry);
    }

    Ok(coverage)
}

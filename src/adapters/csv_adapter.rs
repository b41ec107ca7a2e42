//! CSV file data adapter.
//!
//! One `<SYMBOL>.csv` per symbol with the header
//! `timestamp,open,high,low,close,volume[,open_interest]`.

use crate::domain::bar::Bar;
use crate::domain::config_validation::parse_timestamp;
use crate::domain::error::BacktestError;
use crate::ports::data_port::DataPort;
use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

const EXTENSION: &str = ".csv";

pub struct CsvAdapter {
    base_path: PathBuf,
}

impl CsvAdapter {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn csv_path(&self, symbol: &str) -> PathBuf {
        self.base_path.join(format!("{symbol}{EXTENSION}"))
    }

    fn read_all(&self, symbol: &str) -> Result<Vec<Bar>, BacktestError> {
        let path = self.csv_path(symbol);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(BacktestError::DataUnavailable {
                    symbol: symbol.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let mut rdr = csv::Reader::from_reader(content.as_bytes());
        let mut bars = Vec::new();

        for (index, result) in rdr.records().enumerate() {
            // header is line 1
            let line = index + 2;
            let record = result.map_err(|e| data_error(symbol, line, format!("CSV parse error: {e}")))?;

            let raw_ts = field(&record, 0, "timestamp", symbol, line)?;
            let timestamp = parse_timestamp(raw_ts)
                .ok_or_else(|| data_error(symbol, line, format!("invalid timestamp '{raw_ts}'")))?;

            let open_interest = match record.get(6) {
                Some(raw) if !raw.trim().is_empty() => price(raw, "open_interest", symbol, line)?,
                _ => Decimal::ZERO,
            };

            bars.push(Bar {
                symbol: symbol.to_string(),
                timestamp,
                open: price(field(&record, 1, "open", symbol, line)?, "open", symbol, line)?,
                high: price(field(&record, 2, "high", symbol, line)?, "high", symbol, line)?,
                low: price(field(&record, 3, "low", symbol, line)?, "low", symbol, line)?,
                close: price(field(&record, 4, "close", symbol, line)?, "close", symbol, line)?,
                volume: price(field(&record, 5, "volume", symbol, line)?, "volume", symbol, line)?,
                open_interest,
            });
        }

        bars.sort_by_key(|b| b.timestamp);
        Ok(bars)
    }
}

fn data_error(symbol: &str, line: usize, reason: String) -> BacktestError {
    BacktestError::Data {
        reason: format!("{symbol}{EXTENSION} line {line}: {reason}"),
    }
}

fn field<'r>(
    record: &'r csv::StringRecord,
    index: usize,
    name: &str,
    symbol: &str,
    line: usize,
) -> Result<&'r str, BacktestError> {
    record
        .get(index)
        .ok_or_else(|| data_error(symbol, line, format!("missing {name} column")))
}

fn price(raw: &str, name: &str, symbol: &str, line: usize) -> Result<Decimal, BacktestError> {
    raw.trim()
        .parse::<Decimal>()
        .map_err(|e| data_error(symbol, line, format!("invalid {name} value '{raw}': {e}")))
}

impl DataPort for CsvAdapter {
    fn fetch_bars(
        &self,
        symbol: &str,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<Bar>, BacktestError> {
        let mut bars = self.read_all(symbol)?;
        bars.retain(|b| b.timestamp >= start && b.timestamp <= end);
        Ok(bars)
    }

    fn list_symbols(&self) -> Result<Vec<String>, BacktestError> {
        let entries = fs::read_dir(&self.base_path)?;
        let mut symbols = Vec::new();

        for entry in entries {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some(symbol) = name.strip_suffix(EXTENSION) {
                if !symbol.is_empty() {
                    symbols.push(symbol.to_string());
                }
            }
        }

        symbols.sort();
        Ok(symbols)
    }

    fn get_data_range(
        &self,
        symbol: &str,
    ) -> Result<Option<(NaiveDateTime, NaiveDateTime, usize)>, BacktestError> {
        let bars = match self.read_all(symbol) {
            Ok(bars) => bars,
            Err(BacktestError::DataUnavailable { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(match (bars.first(), bars.last()) {
            (Some(first), Some(last)) => Some((first.timestamp, last.timestamp, bars.len())),
            _ => None,
        })
    }
}

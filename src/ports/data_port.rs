//! Historical data provider port.

use crate::domain::bar::Bar;
use crate::domain::error::BacktestError;
use chrono::NaiveDateTime;

/// Pull-based source of historical bars. Implementations must be replayable:
/// two calls with the same arguments return the same bars.
pub trait DataPort {
    fn fetch_bars(
        &self,
        symbol: &str,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<Bar>, BacktestError>;

    fn list_symbols(&self) -> Result<Vec<String>, BacktestError>;

    fn get_data_range(
        &self,
        symbol: &str,
    ) -> Result<Option<(NaiveDateTime, NaiveDateTime, usize)>, BacktestError>;
}

//! Domain error types.

use chrono::NaiveDateTime;
use rust_decimal::Decimal;

/// Top-level error type for backsim.
#[derive(Debug, thiserror::Error)]
pub enum BacktestError {
    #[error("no data for {symbol} in the requested range")]
    DataUnavailable { symbol: String },

    #[error("out-of-order query for {symbol}: requested {requested}, clock is at {current}")]
    InvalidTimeOrder {
        symbol: String,
        requested: NaiveDateTime,
        current: NaiveDateTime,
    },

    #[error("invalid order: {reason}")]
    InvalidOrder { reason: String },

    #[error("ledger overflow while computing {context}")]
    LedgerOverflow { context: String },

    #[error("strategy error: {reason}")]
    Strategy { reason: String },

    #[error("data error: {reason}")]
    Data { reason: String },

    #[error("config parse error in {file}: {reason}")]
    ConfigParse { file: String, reason: String },

    #[error("missing config key [{section}] {key}")]
    ConfigMissing { section: String, key: String },

    #[error("invalid config value [{section}] {key}: {reason}")]
    ConfigInvalid {
        section: String,
        key: String,
        reason: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BacktestError {
    pub fn invalid_order(reason: impl Into<String>) -> Self {
        BacktestError::InvalidOrder {
            reason: reason.into(),
        }
    }

    pub fn overflow(context: impl Into<String>) -> Self {
        BacktestError::LedgerOverflow {
            context: context.into(),
        }
    }

    pub fn strategy(reason: impl Into<String>) -> Self {
        BacktestError::Strategy {
            reason: reason.into(),
        }
    }
}

/// Turns the `None` of a checked decimal operation into [`BacktestError::LedgerOverflow`].
pub(crate) trait OrOverflow<T> {
    fn or_overflow(self, context: &str) -> Result<T, BacktestError>;
}

impl<T> OrOverflow<T> for Option<T> {
    fn or_overflow(self, context: &str) -> Result<T, BacktestError> {
        self.ok_or_else(|| BacktestError::overflow(context))
    }
}

/// Checked sum of `values`; overflow is [`BacktestError::LedgerOverflow`].
pub(crate) fn checked_sum<I>(values: I, context: &str) -> Result<Decimal, BacktestError>
where
    I: IntoIterator<Item = Decimal>,
{
    values
        .into_iter()
        .try_fold(Decimal::ZERO, |acc, v| acc.checked_add(v))
        .or_overflow(context)
}

impl From<&BacktestError> for std::process::ExitCode {
    fn from(err: &BacktestError) -> Self {
        let code: u8 = match err {
            BacktestError::Io(_) => 1,
            BacktestError::ConfigParse { .. }
            | BacktestError::ConfigMissing { .. }
            | BacktestError::ConfigInvalid { .. } => 2,
            BacktestError::DataUnavailable { .. }
            | BacktestError::Data { .. }
            | BacktestError::InvalidTimeOrder { .. } => 3,
            BacktestError::InvalidOrder { .. } | BacktestError::LedgerOverflow { .. } => 4,
            BacktestError::Strategy { .. } => 5,
        };
        std::process::ExitCode::from(code)
    }
}

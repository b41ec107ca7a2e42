//! Configuration validation and typed config construction.
//!
//! Every field is checked before a run starts; `build_*` turn a validated
//! [`ConfigPort`] into the typed structs the engine consumes.

use crate::domain::backtest::BacktestConfig;
use crate::domain::error::BacktestError;
use crate::domain::execution::{CommissionSchedule, PriceBasis};
use crate::domain::strategy::{StrategyConfig, StrategyKind};
use crate::domain::universe::parse_symbols;
use crate::ports::config_port::ConfigPort;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

const DEFAULT_TARGET_PERCENT: Decimal = dec!(0.95);
const DEFAULT_FAST: i64 = 5;
const DEFAULT_SLOW: i64 = 20;

const DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];

/// Parse `YYYY-MM-DD HH:MM:SS`, `YYYY-MM-DDTHH:MM:SS` or a bare date at
/// midnight.
pub fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .ok()
                .map(|d| d.and_time(NaiveTime::MIN))
        })
}

pub fn validate_backtest_config(config: &dyn ConfigPort) -> Result<(), BacktestError> {
    symbols(config)?;
    date_range(config)?;
    initial_capital(config)?;
    commission(config)?;
    market_fill(config)?;
    Ok(())
}

pub fn validate_strategy_config(config: &dyn ConfigPort) -> Result<(), BacktestError> {
    strategy_kind(config, None)?;
    target_percent(config)?;
    windows(config)?;
    Ok(())
}

pub fn build_backtest_config(config: &dyn ConfigPort) -> Result<BacktestConfig, BacktestError> {
    let (start, end) = date_range(config)?;
    Ok(BacktestConfig {
        symbols: symbols(config)?,
        start,
        end,
        initial_capital: initial_capital(config)?,
        commission: commission(config)?,
        market_fill: market_fill(config)?,
    })
}

/// `name_override` replaces `[strategy] name`, as the CLI's `--strategy` does.
pub fn build_strategy_config(
    config: &dyn ConfigPort,
    name_override: Option<&str>,
) -> Result<StrategyConfig, BacktestError> {
    let kind = strategy_kind(config, name_override)?;
    let (fast, slow) = match kind {
        StrategyKind::SmaCross => windows(config)?,
        StrategyKind::BuyAndHold => (DEFAULT_FAST as usize, DEFAULT_SLOW as usize),
    };
    Ok(StrategyConfig {
        kind,
        target_percent: target_percent(config)?,
        fast,
        slow,
    })
}

fn invalid(section: &str, key: &str, reason: impl Into<String>) -> BacktestError {
    BacktestError::ConfigInvalid {
        section: section.to_string(),
        key: key.to_string(),
        reason: reason.into(),
    }
}

fn missing(section: &str, key: &str) -> BacktestError {
    BacktestError::ConfigMissing {
        section: section.to_string(),
        key: key.to_string(),
    }
}

fn symbols(config: &dyn ConfigPort) -> Result<Vec<String>, BacktestError> {
    let raw = config
        .get_string("backtest", "symbols")
        .ok_or_else(|| missing("backtest", "symbols"))?;
    parse_symbols(&raw).map_err(|e| invalid("backtest", "symbols", e.to_string()))
}

fn date_range(config: &dyn ConfigPort) -> Result<(NaiveDateTime, NaiveDateTime), BacktestError> {
    let start = bound(config, "start", false)?;
    let end = bound(config, "end", true)?;
    if start >= end {
        return Err(invalid("backtest", "start", "start must be before end"));
    }
    Ok((start, end))
}

/// A bare end date covers the whole day.
fn bound(config: &dyn ConfigPort, key: &str, is_end: bool) -> Result<NaiveDateTime, BacktestError> {
    let raw = config
        .get_string("backtest", key)
        .ok_or_else(|| missing("backtest", key))?;
    let raw = raw.trim();
    if is_end {
        if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
            if let Some(end_of_day) = date.and_hms_opt(23, 59, 59) {
                return Ok(end_of_day);
            }
        }
    }
    parse_timestamp(raw).ok_or_else(|| {
        invalid(
            "backtest",
            key,
            format!("invalid {key} '{raw}', expected YYYY-MM-DD or YYYY-MM-DD HH:MM:SS"),
        )
    })
}

fn decimal(config: &dyn ConfigPort, section: &str, key: &str) -> Result<Option<Decimal>, BacktestError> {
    match config.get_string(section, key) {
        None => Ok(None),
        Some(raw) => config
            .get_decimal(section, key)
            .map(Some)
            .ok_or_else(|| invalid(section, key, format!("'{}' is not a number", raw.trim()))),
    }
}

fn integer(config: &dyn ConfigPort, section: &str, key: &str) -> Result<Option<i64>, BacktestError> {
    match config.get_string(section, key) {
        None => Ok(None),
        Some(raw) => config
            .get_int(section, key)
            .map(Some)
            .ok_or_else(|| invalid(section, key, format!("'{}' is not an integer", raw.trim()))),
    }
}

fn initial_capital(config: &dyn ConfigPort) -> Result<Decimal, BacktestError> {
    let value =
        decimal(config, "backtest", "initial_capital")?.ok_or_else(|| missing("backtest", "initial_capital"))?;
    if value <= Decimal::ZERO {
        return Err(invalid(
            "backtest",
            "initial_capital",
            "initial_capital must be positive",
        ));
    }
    Ok(value)
}

fn commission(config: &dyn ConfigPort) -> Result<CommissionSchedule, BacktestError> {
    let rate = decimal(config, "backtest", "commission_rate")?.unwrap_or(Decimal::ZERO);
    if rate < Decimal::ZERO {
        return Err(invalid(
            "backtest",
            "commission_rate",
            "commission_rate must be non-negative",
        ));
    }
    let minimum = decimal(config, "backtest", "min_commission")?.unwrap_or(Decimal::ZERO);
    if minimum < Decimal::ZERO {
        return Err(invalid(
            "backtest",
            "min_commission",
            "min_commission must be non-negative",
        ));
    }
    Ok(CommissionSchedule { rate, minimum })
}

fn market_fill(config: &dyn ConfigPort) -> Result<PriceBasis, BacktestError> {
    match config.get_string("backtest", "market_fill") {
        None => Ok(PriceBasis::default()),
        Some(raw) => raw
            .parse::<PriceBasis>()
            .map_err(|reason| invalid("backtest", "market_fill", reason)),
    }
}

fn strategy_kind(
    config: &dyn ConfigPort,
    name_override: Option<&str>,
) -> Result<StrategyKind, BacktestError> {
    let name = match name_override {
        Some(name) => name.to_string(),
        None => config
            .get_string("strategy", "name")
            .ok_or_else(|| missing("strategy", "name"))?,
    };
    name.parse::<StrategyKind>()
        .map_err(|reason| invalid("strategy", "name", reason))
}

fn target_percent(config: &dyn ConfigPort) -> Result<Decimal, BacktestError> {
    let value = decimal(config, "strategy", "target_percent")?.unwrap_or(DEFAULT_TARGET_PERCENT);
    if value <= Decimal::ZERO || value > Decimal::ONE {
        return Err(invalid(
            "strategy",
            "target_percent",
            "target_percent must be in (0, 1]",
        ));
    }
    Ok(value)
}

fn windows(config: &dyn ConfigPort) -> Result<(usize, usize), BacktestError> {
    let fast = integer(config, "strategy", "fast")?.unwrap_or(DEFAULT_FAST);
    let slow = integer(config, "strategy", "slow")?.unwrap_or(DEFAULT_SLOW);
    if fast < 1 {
        return Err(invalid("strategy", "fast", "fast must be at least 1"));
    }
    if slow <= fast {
        return Err(invalid("strategy", "slow", "slow must be greater than fast"));
    }
    Ok((fast as usize, slow as usize))
}

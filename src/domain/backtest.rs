//! Backtest engine and event loop.
//!
//! One [`Engine::run`] replays the merged timeline of every symbol. Each step
//! runs strictly in order: stop check, replay advance, strategy callback,
//! order matching, mark-to-market, equity snapshot, progress update.

use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use super::context::StrategyContext;
use super::error::BacktestError;
use super::execution::{CommissionSchedule, PriceBasis, TradeExecutor};
use super::order::{Fill, Order};
use super::portfolio::{Account, EquityPoint, PortfolioManager};
use super::progress::{ProgressObserver, ProgressTracker};
use super::replay::DataReplay;
use super::strategy::Strategy;
use crate::ports::data_port::DataPort;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BacktestConfig {
    pub symbols: Vec<String>,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub initial_capital: Decimal,
    pub commission: CommissionSchedule,
    pub market_fill: PriceBasis,
}

/// A strategy callback that returned an error or panicked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunFailure {
    /// Index into the timeline; initialization failures report step 0.
    pub step: usize,
    pub timestamp: NaiveDateTime,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct BacktestResult {
    pub strategy: String,
    pub account: Account,
    pub equity_curve: Vec<EquityPoint>,
    pub fills: Vec<Fill>,
    /// Filled and cancelled orders.
    pub orders: Vec<Order>,
    /// Orders still pending when the run ended.
    pub pending: Vec<Order>,
    pub failure: Option<RunFailure>,
    pub steps_completed: usize,
    pub total_steps: usize,
    pub stopped: bool,
}

impl BacktestResult {
    pub fn is_complete(&self) -> bool {
        self.failure.is_none() && !self.stopped
    }

    pub fn final_value(&self) -> Decimal {
        self.account.total_value
    }
}

pub struct Engine {
    config: BacktestConfig,
    stop: Arc<AtomicBool>,
    observer: Option<ProgressObserver>,
}

impl Engine {
    pub fn new(config: BacktestConfig) -> Self {
        Engine {
            config,
            stop: Arc::new(AtomicBool::new(false)),
            observer: None,
        }
    }

    pub fn config(&self) -> &BacktestConfig {
        &self.config
    }

    /// Setting the flag stops the run before the next step.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn with_progress_observer(
        mut self,
        observer: impl FnMut(f64, Option<Duration>) + 'static,
    ) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn run(
        &mut self,
        provider: &dyn DataPort,
        strategy: &mut dyn Strategy,
    ) -> Result<BacktestResult, BacktestError> {
        let config = &self.config;
        if config.symbols.is_empty() {
            return Err(BacktestError::ConfigInvalid {
                section: "backtest".into(),
                key: "symbols".into(),
                reason: "at least one symbol is required".into(),
            });
        }
        if config.start > config.end {
            return Err(BacktestError::ConfigInvalid {
                section: "backtest".into(),
                key: "end".into(),
                reason: format!("end {} is before start {}", config.end, config.start),
            });
        }

        let mut replay = DataReplay::load(provider, &config.symbols, config.start, config.end)?;
        let timeline = replay.timeline();
        let mut executor =
            TradeExecutor::new(config.commission, config.market_fill, config.symbols.iter().cloned());
        let mut portfolio = PortfolioManager::new(config.initial_capital);
        let mut progress = ProgressTracker::new(timeline.len());
        progress.set_observer(self.observer.take());

        tracing::info!(
            strategy = strategy.name(),
            symbols = ?config.symbols,
            steps = timeline.len(),
            initial_capital = %config.initial_capital,
            "backtest started"
        );
        let started = Instant::now();
        progress.start();

        let outcome = drive(
            &timeline,
            &self.stop,
            &mut replay,
            &mut executor,
            &mut portfolio,
            &mut progress,
            strategy,
        );
        self.observer = progress.take_observer();
        let (steps_completed, failure, stopped) = outcome?;

        let (account, equity_curve) = portfolio.into_parts();
        let (orders, pending, fills) = executor.into_parts();

        tracing::info!(
            strategy = strategy.name(),
            steps = steps_completed,
            fills = fills.len(),
            final_value = %account.total_value,
            stopped,
            failed = failure.is_some(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "backtest finished"
        );

        Ok(BacktestResult {
            strategy: strategy.name().to_string(),
            account,
            equity_curve,
            fills,
            orders,
            pending,
            failure,
            steps_completed,
            total_steps: timeline.len(),
            stopped,
        })
    }
}

type LoopOutcome = (usize, Option<RunFailure>, bool);

fn drive(
    timeline: &[NaiveDateTime],
    stop: &AtomicBool,
    replay: &mut DataReplay,
    executor: &mut TradeExecutor,
    portfolio: &mut PortfolioManager,
    progress: &mut ProgressTracker,
    strategy: &mut dyn Strategy,
) -> Result<LoopOutcome, BacktestError> {
    let Some(&first) = timeline.first() else {
        progress.update_progress(0);
        return Ok((0, None, false));
    };

    {
        let mut ctx = StrategyContext::new(first, replay, executor, portfolio);
        if let Err(message) = guarded(|| strategy.initialize(&mut ctx)) {
            tracing::warn!(step = 0, timestamp = %first, error = %message, "strategy initialization failed");
            let failure = RunFailure {
                step: 0,
                timestamp: first,
                message,
            };
            return Ok((0, Some(failure), false));
        }
    }

    let mut steps_completed = 0;
    for (step, &at_time) in timeline.iter().enumerate() {
        if stop.load(Ordering::SeqCst) {
            tracing::info!(step, timestamp = %at_time, "stop requested");
            return Ok((steps_completed, None, true));
        }

        let bars = replay.bars_at(at_time)?;
        {
            let mut ctx = StrategyContext::new(at_time, replay, executor, portfolio);
            if let Err(message) = guarded(|| strategy.handle_bar(&mut ctx, &bars)) {
                tracing::warn!(step, timestamp = %at_time, error = %message, "strategy failed");
                let failure = RunFailure {
                    step,
                    timestamp: at_time,
                    message,
                };
                return Ok((steps_completed, Some(failure), false));
            }
        }

        executor.process_orders(at_time, &bars, portfolio)?;
        portfolio.update_market_value(&bars)?;
        portfolio.record_equity(at_time)?;

        steps_completed = step + 1;
        progress.update_progress(steps_completed);
    }

    Ok((steps_completed, None, false))
}

/// Run a strategy callback, turning both errors and panics into a message.
fn guarded<F>(callback: F) -> Result<(), String>
where
    F: FnOnce() -> Result<(), BacktestError>,
{
    match panic::catch_unwind(AssertUnwindSafe(callback)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(err.to_string()),
        Err(payload) => Err(panic_message(payload.as_ref())),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("strategy panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("strategy panicked: {msg}")
    } else {
        "strategy panicked".to_string()
    }
}

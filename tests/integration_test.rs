//! Integration tests for full runs through the engine.
//!
//! Tests cover:
//! - Ledger values after a single market buy, checked to the cent
//! - Multi-symbol timeline union and per-step bar delivery
//! - Limit orders resting across steps
//! - Strategy errors and panics ending the run with a recorded failure
//! - Stop requests, progress reporting and ETA
//! - Target-percent sizing across price moves
//! - Built-in strategies over synthetic series
//! - Repeat runs producing identical results

mod common;

use approx::assert_relative_eq;
use backsim::domain::backtest::{BacktestResult, Engine};
use backsim::domain::context::StrategyContext;
use backsim::domain::error::BacktestError;
use backsim::domain::metrics::Metrics;
use backsim::domain::order::{OrderSide, OrderStatus};
use backsim::domain::strategy::{BuyAndHold, SmaCross, Strategy};
use common::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::atomic::Ordering;
use std::time::Duration;

fn run(port: &MockDataPort, symbols: &[&str], strategy: &mut dyn Strategy) -> BacktestResult {
    Engine::new(sample_config(symbols)).run(port, strategy).unwrap()
}

fn btc_two_bars() -> MockDataPort {
    MockDataPort::new().with_bars(
        "BTC",
        vec![
            make_bar("BTC", "2024-01-01", dec!(70000)),
            make_bar("BTC", "2024-01-02", dec!(71000)),
        ],
    )
}

// ===========================================================================
// Ledger
// ===========================================================================

#[test]
fn market_buy_ledger_matches_hand_computation() {
    let port = btc_two_bars();
    let mut strategy = BuyOnce::new("BTC", dec!(10));
    let result = run(&port, &["BTC"], &mut strategy);

    assert!(result.is_complete());
    assert_eq!(result.fills.len(), 1);
    let fill = &result.fills[0];
    assert_eq!(fill.price, dec!(70000));
    assert_eq!(fill.commission, dec!(210));

    let account = &result.account;
    assert_eq!(account.available_cash, dec!(299790));
    assert_eq!(account.commission_paid, dec!(210));
    let btc = &account.positions["BTC"];
    assert_eq!(btc.quantity, dec!(10));
    assert_eq!(btc.average_cost, dec!(70021));
    assert_eq!(btc.market_value, dec!(710000));
    assert_eq!(btc.unrealized_pnl, dec!(9790));
    assert_eq!(account.total_value, dec!(1009790));
    assert!(account.is_balanced());

    assert_eq!(result.equity_curve.len(), 2);
    assert_eq!(result.equity_curve[0].total_value, dec!(999790));
    assert_eq!(result.equity_curve[1].total_value, dec!(1009790));
}

#[test]
fn metrics_over_finished_run() {
    let port = btc_two_bars();
    let mut strategy = BuyOnce::new("BTC", dec!(10));
    let result = run(&port, &["BTC"], &mut strategy);
    let metrics = Metrics::compute(&result).unwrap();

    assert_eq!(metrics.final_value, dec!(1009790));
    assert_relative_eq!(metrics.total_return, 0.00979, epsilon = 1e-9);
    assert_eq!(metrics.fill_count, 1);
    assert_eq!(metrics.closing_fills, 0);
    assert_eq!(metrics.total_commission, dec!(210));
    assert_eq!(metrics.max_drawdown, 0.0);
    assert_eq!(metrics.max_drawdown_duration, 0);
}

// ===========================================================================
// Timeline
// ===========================================================================

#[test]
fn timeline_is_union_of_symbol_timestamps() {
    let port = MockDataPort::new()
        .with_bars(
            "BTC",
            vec![
                make_bar("BTC", "2024-01-01", dec!(100)),
                make_bar("BTC", "2024-01-02", dec!(101)),
                make_bar("BTC", "2024-01-03", dec!(102)),
            ],
        )
        .with_bars(
            "ETH",
            vec![
                make_bar("ETH", "2024-01-02", dec!(10)),
                make_bar("ETH", "2024-01-03", dec!(11)),
                make_bar("ETH", "2024-01-04", dec!(12)),
            ],
        );
    let mut recorder = Recorder::default();
    let result = run(&port, &["BTC", "ETH"], &mut recorder);

    assert_eq!(result.total_steps, 4);
    assert_eq!(
        recorder.seen,
        vec![
            ts("2024-01-01"),
            ts("2024-01-02"),
            ts("2024-01-03"),
            ts("2024-01-04"),
        ]
    );
    assert_eq!(recorder.symbols_per_step[0], vec!["BTC".to_string()]);
    assert_eq!(
        recorder.symbols_per_step[1],
        vec!["BTC".to_string(), "ETH".to_string()]
    );
    assert_eq!(recorder.symbols_per_step[3], vec!["ETH".to_string()]);
}

#[test]
fn missing_symbol_fails_before_first_step() {
    let port = btc_two_bars();
    let mut recorder = Recorder::default();
    let err = Engine::new(sample_config(&["BTC", "ETH"]))
        .run(&port, &mut recorder)
        .unwrap_err();

    assert!(matches!(err, BacktestError::DataUnavailable { ref symbol } if symbol == "ETH"));
    assert!(recorder.seen.is_empty());
}

#[test]
fn provider_error_propagates() {
    let port = btc_two_bars().with_error("ETH", "disk on fire");
    let mut recorder = Recorder::default();
    let err = Engine::new(sample_config(&["BTC", "ETH"]))
        .run(&port, &mut recorder)
        .unwrap_err();
    assert!(matches!(err, BacktestError::Data { .. }));
}

#[test]
fn empty_symbol_list_is_rejected() {
    let port = btc_two_bars();
    let mut recorder = Recorder::default();
    let err = Engine::new(sample_config(&[]))
        .run(&port, &mut recorder)
        .unwrap_err();
    assert!(matches!(err, BacktestError::ConfigInvalid { .. }));
}

// ===========================================================================
// Orders across steps
// ===========================================================================

struct LimitOnce {
    limit: Decimal,
    placed: bool,
}

impl Strategy for LimitOnce {
    fn name(&self) -> &str {
        "limit_once"
    }

    fn handle_bar(
        &mut self,
        ctx: &mut StrategyContext<'_>,
        _bars: &BTreeMap<String, Bar>,
    ) -> Result<(), BacktestError> {
        if !self.placed {
            ctx.limit_buy("BTC", dec!(2), self.limit)?;
            self.placed = true;
        }
        Ok(())
    }
}

#[test]
fn limit_order_rests_until_price_reached() {
    let mut dip = make_bar("BTC", "2024-01-02", dec!(69960));
    dip.low = dec!(69900);
    let port = MockDataPort::new().with_bars(
        "BTC",
        vec![
            make_bar("BTC", "2024-01-01", dec!(70000)),
            dip,
            make_bar("BTC", "2024-01-03", dec!(70100)),
        ],
    );
    let mut strategy = LimitOnce {
        limit: dec!(69950),
        placed: false,
    };
    let result = run(&port, &["BTC"], &mut strategy);

    assert_eq!(result.fills.len(), 1);
    let fill = &result.fills[0];
    assert_eq!(fill.price, dec!(69950));
    assert_eq!(fill.timestamp, ts("2024-01-02"));
    assert!(result.pending.is_empty());
    assert_eq!(result.orders[0].status, OrderStatus::Filled);
    // 2 * 69950 * 0.0003 = 41.97
    assert_eq!(fill.commission, dec!(41.97));
    assert_eq!(result.account.available_cash, dec!(1000000) - dec!(139900) - dec!(41.97));
}

#[test]
fn unreached_limit_stays_pending_at_end() {
    let port = btc_two_bars();
    let mut strategy = LimitOnce {
        limit: dec!(60000),
        placed: false,
    };
    let result = run(&port, &["BTC"], &mut strategy);

    assert!(result.fills.is_empty());
    assert_eq!(result.pending.len(), 1);
    assert_eq!(result.pending[0].status, OrderStatus::Pending);
    assert_eq!(result.account.total_value, dec!(1000000));
}

// ===========================================================================
// Failures and stop
// ===========================================================================

fn five_days() -> MockDataPort {
    MockDataPort::new().with_bars(
        "BTC",
        generate_bars("BTC", &[dec!(100), dec!(101), dec!(102), dec!(103), dec!(104)]),
    )
}

#[test]
fn strategy_error_ends_run_with_failure() {
    let port = five_days();
    let mut strategy = FailAt::error(2);
    let result = run(&port, &["BTC"], &mut strategy);

    let failure = result.failure.as_ref().expect("failure recorded");
    assert_eq!(failure.step, 2);
    assert_eq!(failure.timestamp, ts("2024-01-03"));
    assert!(failure.message.contains("gave up at step 2"));
    assert_eq!(result.steps_completed, 2);
    assert_eq!(result.equity_curve.len(), 2);
    assert!(!result.is_complete());
}

#[test]
fn strategy_panic_ends_run_with_failure() {
    let port = five_days();
    let mut strategy = FailAt::panic(1);
    let result = run(&port, &["BTC"], &mut strategy);

    let failure = result.failure.as_ref().expect("failure recorded");
    assert_eq!(failure.step, 1);
    assert!(failure.message.starts_with("strategy panicked"));
    assert!(failure.message.contains("boom at step 1"));
    assert_eq!(result.equity_curve.len(), 1);
}

#[test]
fn invalid_sma_windows_fail_at_initialization() {
    let port = five_days();
    let mut strategy = SmaCross::new(5, 3, dec!(0.5));
    let result = run(&port, &["BTC"], &mut strategy);

    let failure = result.failure.as_ref().expect("failure recorded");
    assert_eq!(failure.step, 0);
    assert_eq!(result.steps_completed, 0);
    assert!(result.equity_curve.is_empty());
}

#[test]
fn stop_request_halts_before_next_step() {
    let port = five_days();
    let engine = Engine::new(sample_config(&["BTC"]));
    let stop = engine.stop_handle();
    let flag = stop.clone();
    let mut engine = engine.with_progress_observer(move |pct, _| {
        if pct >= 40.0 {
            flag.store(true, Ordering::SeqCst);
        }
    });

    let mut recorder = Recorder::default();
    let result = engine.run(&port, &mut recorder).unwrap();

    assert!(result.stopped);
    assert!(result.failure.is_none());
    assert_eq!(result.steps_completed, 2);
    assert_eq!(recorder.seen.len(), 2);
    assert!(stop.load(Ordering::SeqCst));
}

#[test]
fn progress_observer_reaches_completion() {
    let port = five_days();
    let reports = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&reports);
    let mut engine =
        Engine::new(sample_config(&["BTC"])).with_progress_observer(move |pct, _| sink.borrow_mut().push(pct));

    let mut recorder = Recorder::default();
    engine.run(&port, &mut recorder).unwrap();

    let reports = reports.borrow();
    assert_eq!(reports.len(), 5);
    assert_relative_eq!(reports[0], 20.0);
    assert_relative_eq!(reports[4], 100.0);
    assert!(reports.windows(2).all(|w| w[0] <= w[1]));
}

struct SlowSteps(Duration);

impl Strategy for SlowSteps {
    fn name(&self) -> &str {
        "slow_steps"
    }

    fn handle_bar(
        &mut self,
        _ctx: &mut StrategyContext<'_>,
        _bars: &BTreeMap<String, Bar>,
    ) -> Result<(), BacktestError> {
        std::thread::sleep(self.0);
        Ok(())
    }
}

#[test]
fn progress_eta_counts_the_first_step() {
    let port = five_days();
    let etas = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&etas);
    let mut engine = Engine::new(sample_config(&["BTC"]))
        .with_progress_observer(move |_, eta| sink.borrow_mut().push(eta));

    let mut strategy = SlowSteps(Duration::from_millis(20));
    engine.run(&port, &mut strategy).unwrap();

    let etas = etas.borrow();
    assert_eq!(etas.len(), 5);
    // at least 20ms for the first step, 4 steps left
    let first = etas[0].expect("eta after first step");
    assert!(first >= Duration::from_millis(80), "eta was {first:?}");
    assert_eq!(etas[4], Some(Duration::ZERO));
}

// ===========================================================================
// Position sizing across price moves
// ===========================================================================

struct TargetEveryBar(Decimal);

impl Strategy for TargetEveryBar {
    fn name(&self) -> &str {
        "target_every_bar"
    }

    fn handle_bar(
        &mut self,
        ctx: &mut StrategyContext<'_>,
        _bars: &BTreeMap<String, Bar>,
    ) -> Result<(), BacktestError> {
        ctx.order_target_percent("BTC", self.0)?;
        Ok(())
    }
}

fn free_config(capital: Decimal) -> backsim::domain::backtest::BacktestConfig {
    let mut config = sample_config(&["BTC"]);
    config.initial_capital = capital;
    config.commission = Default::default();
    config
}

#[test]
fn fully_invested_target_does_not_trade_on_price_move() {
    let port = MockDataPort::new().with_bars("BTC", generate_bars("BTC", &[dec!(100), dec!(200)]));
    let mut strategy = TargetEveryBar(dec!(1));
    let result = Engine::new(free_config(dec!(1000)))
        .run(&port, &mut strategy)
        .unwrap();

    assert_eq!(result.fills.len(), 1);
    assert_eq!(result.fills[0].quantity, dec!(10));
    assert_eq!(result.account.positions["BTC"].quantity, dec!(10));
    assert_eq!(result.account.available_cash, dec!(0));
    assert_eq!(result.account.total_value, dec!(2000));
}

#[test]
fn half_target_rebalances_at_new_price() {
    let port = MockDataPort::new().with_bars("BTC", generate_bars("BTC", &[dec!(100), dec!(200)]));
    let mut strategy = TargetEveryBar(dec!(0.5));
    let result = Engine::new(free_config(dec!(1000)))
        .run(&port, &mut strategy)
        .unwrap();

    // day 1: buy 5 @ 100; day 2: value 500 + 5 * 200 = 1500, target 750, sell 1.25 → 1
    assert_eq!(result.fills.len(), 2);
    assert_eq!(result.fills[1].side, OrderSide::Sell);
    assert_eq!(result.fills[1].quantity, dec!(1));
    assert_eq!(result.account.positions["BTC"].quantity, dec!(4));
    assert_eq!(result.account.available_cash, dec!(700));
}

// ===========================================================================
// Built-in strategies
// ===========================================================================

#[test]
fn buy_and_hold_invests_target_fraction() {
    let closes: Vec<Decimal> = (100..=110).map(Decimal::from).collect();
    let port = MockDataPort::new().with_bars("BTC", generate_bars("BTC", &closes));
    let mut strategy = BuyAndHold::new(dec!(0.95));
    let result = run(&port, &["BTC"], &mut strategy);

    assert_eq!(result.fills.len(), 1);
    let btc = &result.account.positions["BTC"];
    assert_eq!(btc.quantity, dec!(9500));
    // 950000 notional, 285 commission
    assert_eq!(result.account.available_cash, dec!(49715));
    assert_eq!(btc.last_price, Some(dec!(110)));
    assert!(result.account.is_balanced());
}

#[test]
fn buy_and_hold_splits_across_symbols() {
    let port = MockDataPort::new()
        .with_bars("BTC", generate_bars("BTC", &[dec!(100), dec!(100)]))
        .with_bars("ETH", generate_bars("ETH", &[dec!(50), dec!(50)]));
    let mut strategy = BuyAndHold::new(dec!(0.8));
    let result = run(&port, &["BTC", "ETH"], &mut strategy);

    assert_eq!(result.fills.len(), 2);
    assert_eq!(result.account.positions["BTC"].quantity, dec!(4000));
    // ETH is sized after the BTC order is placed but before it fills
    assert_eq!(result.account.positions["ETH"].quantity, dec!(8000));
}

#[test]
fn sma_cross_enters_and_exits() {
    let closes = [10, 10, 10, 15, 15, 15, 5, 5].map(Decimal::from);
    let port = MockDataPort::new().with_bars("BTC", generate_bars("BTC", &closes));
    let mut strategy = SmaCross::new(2, 3, dec!(0.95));
    let result = run(&port, &["BTC"], &mut strategy);

    assert!(result.is_complete());
    assert_eq!(result.fills.len(), 2);
    assert_eq!(result.fills[0].side, OrderSide::Buy);
    assert_eq!(result.fills[0].timestamp, ts("2024-01-04"));
    assert_eq!(result.fills[0].quantity, dec!(63333));
    assert_eq!(result.fills[1].side, OrderSide::Sell);
    assert_eq!(result.fills[1].timestamp, ts("2024-01-07"));
    assert_eq!(result.fills[1].quantity, dec!(63333));
    assert!(result.fills[1].realized_pnl < Decimal::ZERO);
    assert!(result.account.positions["BTC"].is_flat());
    assert!(result.account.is_balanced());
}

#[test]
fn repeat_runs_are_identical() {
    let port = MockDataPort::new()
        .with_bars(
            "BTC",
            generate_bars("BTC", &[10, 12, 9, 14, 15, 11, 8, 13].map(Decimal::from)),
        )
        .with_bars(
            "ETH",
            generate_bars("ETH", &[5, 4, 6, 7, 3, 8, 9, 2].map(Decimal::from)),
        );

    let first = run(&port, &["BTC", "ETH"], &mut SmaCross::new(2, 3, dec!(0.9)));
    let second = run(&port, &["BTC", "ETH"], &mut SmaCross::new(2, 3, dec!(0.9)));

    assert_eq!(first.equity_curve, second.equity_curve);
    assert_eq!(first.fills, second.fills);
    assert_eq!(first.account, second.account);
}

//! The view of the simulation a strategy gets at each step.
//!
//! Every query is anchored at the engine's simulated time, so a strategy
//! cannot read bars past the current step.

use chrono::NaiveDateTime;
use rust_decimal::Decimal;

use super::bar::Bar;
use super::error::{BacktestError, OrOverflow};
use super::execution::TradeExecutor;
use super::order::{Order, OrderId, OrderSide, OrderType};
use super::portfolio::{Account, PortfolioManager};
use super::position::Position;
use super::replay::DataReplay;

pub struct StrategyContext<'a> {
    now: NaiveDateTime,
    replay: &'a mut DataReplay,
    executor: &'a mut TradeExecutor,
    portfolio: &'a PortfolioManager,
}

impl<'a> StrategyContext<'a> {
    pub fn new(
        now: NaiveDateTime,
        replay: &'a mut DataReplay,
        executor: &'a mut TradeExecutor,
        portfolio: &'a PortfolioManager,
    ) -> Self {
        StrategyContext {
            now,
            replay,
            executor,
            portfolio,
        }
    }

    pub fn now(&self) -> NaiveDateTime {
        self.now
    }

    pub fn symbols(&self) -> Vec<String> {
        self.replay.symbols().map(str::to_string).collect()
    }

    pub fn account(&self) -> &Account {
        self.portfolio.account()
    }

    pub fn get_position(&self, symbol: &str) -> Position {
        self.portfolio.get_position(symbol)
    }

    /// Cash plus every open position marked at its latest visible close.
    /// Positions with no visible bar keep their last mark.
    pub fn account_value(&mut self) -> Result<Decimal, BacktestError> {
        let portfolio = self.portfolio;
        let mut total = portfolio.account().available_cash;
        for position in portfolio.account().positions.values() {
            if position.is_flat() {
                continue;
            }
            let value = match self.replay.historical_bars(&position.symbol, self.now, 1)?.last() {
                Some(bar) => position
                    .quantity
                    .checked_mul(bar.close)
                    .or_overflow("position value")?,
                None => position.market_value,
            };
            total = total.checked_add(value).or_overflow("account value")?;
        }
        Ok(total)
    }

    /// Up to `count` bars ending at the current time, oldest first.
    pub fn get_klines(&mut self, symbol: &str, count: usize) -> Result<Vec<Bar>, BacktestError> {
        self.replay.historical_bars(symbol, self.now, count)
    }

    pub fn pending_orders(&self) -> &[Order] {
        self.executor.pending_orders()
    }

    /// Trade `symbol` towards `target_pct` of [`Self::account_value`], sized at
    /// the latest close and truncated to whole units. Returns `None` when no
    /// order is needed.
    pub fn order_target_percent(
        &mut self,
        symbol: &str,
        target_pct: Decimal,
    ) -> Result<Option<Order>, BacktestError> {
        let price = self
            .get_klines(symbol, 1)?
            .last()
            .map(|bar| bar.close)
            .ok_or_else(|| {
                BacktestError::invalid_order(format!("no price for {symbol} at {}", self.now))
            })?;
        if price <= Decimal::ZERO {
            return Err(BacktestError::invalid_order(format!(
                "cannot size {symbol} at non-positive price {price}"
            )));
        }

        let held = self.portfolio.get_position(symbol).quantity;
        let current_value = held.checked_mul(price).or_overflow("position value")?;
        let target_value = self
            .account_value()?
            .checked_mul(target_pct)
            .or_overflow("target value")?;
        let delta_qty = target_value
            .checked_sub(current_value)
            .and_then(|delta| delta.checked_div(price))
            .or_overflow("target quantity")?
            .trunc();

        if delta_qty.is_zero() {
            return Ok(None);
        }
        let side = if delta_qty > Decimal::ZERO {
            OrderSide::Buy
        } else {
            OrderSide::Sell
        };
        self.executor
            .create_order(symbol, side, OrderType::Market, delta_qty.abs(), None, self.now)
            .map(Some)
    }

    pub fn buy(&mut self, symbol: &str, quantity: Decimal) -> Result<Order, BacktestError> {
        self.submit(symbol, OrderSide::Buy, OrderType::Market, quantity, None)
    }

    pub fn sell(&mut self, symbol: &str, quantity: Decimal) -> Result<Order, BacktestError> {
        self.submit(symbol, OrderSide::Sell, OrderType::Market, quantity, None)
    }

    pub fn limit_buy(
        &mut self,
        symbol: &str,
        quantity: Decimal,
        limit_price: Decimal,
    ) -> Result<Order, BacktestError> {
        self.submit(symbol, OrderSide::Buy, OrderType::Limit, quantity, Some(limit_price))
    }

    pub fn limit_sell(
        &mut self,
        symbol: &str,
        quantity: Decimal,
        limit_price: Decimal,
    ) -> Result<Order, BacktestError> {
        self.submit(symbol, OrderSide::Sell, OrderType::Limit, quantity, Some(limit_price))
    }

    pub fn cancel_order(&mut self, id: OrderId) -> bool {
        self.executor.cancel_order(id)
    }

    fn submit(
        &mut self,
        symbol: &str,
        side: OrderSide,
        order_type: OrderType,
        quantity: Decimal,
        limit_price: Option<Decimal>,
    ) -> Result<Order, BacktestError> {
        self.executor
            .create_order(symbol, side, order_type, quantity, limit_price, self.now)
    }
}

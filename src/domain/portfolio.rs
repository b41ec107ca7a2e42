//! Cash/position ledger and equity tracking.

use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use std::collections::BTreeMap;

use super::bar::Bar;
use super::error::{BacktestError, OrOverflow, checked_sum};
use super::order::{Order, OrderSide, OrderStatus};
use super::position::Position;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EquityPoint {
    pub timestamp: NaiveDateTime,
    pub total_value: Decimal,
    pub cash: Decimal,
    pub market_value: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub initial_capital: Decimal,
    pub available_cash: Decimal,
    pub total_value: Decimal,
    pub commission_paid: Decimal,
    pub positions: BTreeMap<String, Position>,
}

impl Account {
    pub fn new(initial_capital: Decimal) -> Self {
        Account {
            initial_capital,
            available_cash: initial_capital,
            total_value: initial_capital,
            commission_paid: Decimal::ZERO,
            positions: BTreeMap::new(),
        }
    }

    pub fn market_value(&self) -> Result<Decimal, BacktestError> {
        checked_sum(self.positions.values().map(|p| p.market_value), "total market value")
    }

    pub fn realized_pnl(&self) -> Result<Decimal, BacktestError> {
        checked_sum(self.positions.values().map(|p| p.realized_pnl), "total realized pnl")
    }

    pub fn unrealized_pnl(&self) -> Result<Decimal, BacktestError> {
        checked_sum(self.positions.values().map(|p| p.unrealized_pnl), "total unrealized pnl")
    }

    pub fn open_position_count(&self) -> usize {
        self.positions.values().filter(|p| !p.is_flat()).count()
    }

    /// `total_value == available_cash + Σ market_value`
    pub fn is_balanced(&self) -> bool {
        self.market_value()
            .ok()
            .and_then(|mv| self.available_cash.checked_add(mv))
            == Some(self.total_value)
    }
}

#[derive(Debug, Clone)]
pub struct PortfolioManager {
    account: Account,
    equity_curve: Vec<EquityPoint>,
}

impl PortfolioManager {
    pub fn new(initial_capital: Decimal) -> Self {
        PortfolioManager {
            account: Account::new(initial_capital),
            equity_curve: Vec::new(),
        }
    }

    /// Apply a filled order to its position and to cash.
    ///
    /// Returns the realized P&L booked by the fill.
    pub fn update_position(&mut self, order: &Order) -> Result<Decimal, BacktestError> {
        if order.status != OrderStatus::Filled {
            return Err(BacktestError::invalid_order(format!(
                "order {} is not filled",
                order.id
            )));
        }
        let price = order.filled_price.ok_or_else(|| {
            BacktestError::invalid_order(format!("order {} has no fill price", order.id))
        })?;

        let notional = order
            .filled_quantity
            .checked_mul(price)
            .or_overflow("fill notional")?;
        let cash_delta = match order.side {
            OrderSide::Buy => notional.checked_add(order.commission).map(|v| -v),
            OrderSide::Sell => notional.checked_sub(order.commission),
        }
        .or_overflow("cash")?;

        let position = self
            .account
            .positions
            .entry(order.symbol.clone())
            .or_insert_with(|| Position::empty(&order.symbol));
        let realized =
            position.apply_fill(order.signed_fill_quantity(), price, order.commission)?;
        position.mark(price)?;

        self.account.available_cash = self
            .account
            .available_cash
            .checked_add(cash_delta)
            .or_overflow("cash")?;
        self.account.commission_paid = self
            .account
            .commission_paid
            .checked_add(order.commission)
            .or_overflow("commission")?;
        self.recompute_total()?;

        Ok(realized)
    }

    /// Mark every open position to the close of its bar in `bars`. Positions
    /// without a bar keep their previous mark.
    pub fn update_market_value(&mut self, bars: &BTreeMap<String, Bar>) -> Result<(), BacktestError> {
        for (symbol, position) in self.account.positions.iter_mut() {
            if let Some(bar) = bars.get(symbol) {
                position.mark(bar.close)?;
            }
        }
        self.recompute_total()
    }

    fn recompute_total(&mut self) -> Result<(), BacktestError> {
        let market_value = self.account.market_value()?;
        self.account.total_value = self
            .account
            .available_cash
            .checked_add(market_value)
            .or_overflow("total value")?;
        Ok(())
    }

    pub fn get_account_info(&self) -> Account {
        self.account.clone()
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    /// Snapshot of the position in `symbol`; a zero position if never traded.
    pub fn get_position(&self, symbol: &str) -> Position {
        self.account
            .positions
            .get(symbol)
            .cloned()
            .unwrap_or_else(|| Position::empty(symbol))
    }

    pub fn record_equity(&mut self, timestamp: NaiveDateTime) -> Result<&EquityPoint, BacktestError> {
        let point = EquityPoint {
            timestamp,
            total_value: self.account.total_value,
            cash: self.account.available_cash,
            market_value: self.account.market_value()?,
            realized_pnl: self.account.realized_pnl()?,
            unrealized_pnl: self.account.unrealized_pnl()?,
        };
        self.equity_curve.push(point);
        Ok(&self.equity_curve[self.equity_curve.len() - 1])
    }

    pub fn equity_curve(&self) -> &[EquityPoint] {
        &self.equity_curve
    }

    pub fn into_parts(self) -> (Account, Vec<EquityPoint>) {
        (self.account, self.equity_curve)
    }
}

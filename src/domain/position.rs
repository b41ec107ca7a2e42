//! Per-symbol position ledger.
//!
//! Quantity is signed (positive = long). The average cost includes
//! commission: buying raises it, shorting lowers it, so unrealized P&L is net
//! of the entry commission in both directions.

use crate::domain::error::{BacktestError, OrOverflow};
use rust_decimal::Decimal;
use rust_decimal::prelude::Signed;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Position {
    pub symbol: String,
    pub quantity: Decimal,
    pub average_cost: Decimal,
    pub last_price: Option<Decimal>,
    pub market_value: Decimal,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
}

impl Position {
    /// A flat position with no history.
    pub fn empty(symbol: &str) -> Self {
        Position {
            symbol: symbol.to_string(),
            quantity: Decimal::ZERO,
            average_cost: Decimal::ZERO,
            last_price: None,
            market_value: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
        }
    }

    pub fn is_long(&self) -> bool {
        self.quantity > Decimal::ZERO
    }

    pub fn is_short(&self) -> bool {
        self.quantity < Decimal::ZERO
    }

    pub fn is_flat(&self) -> bool {
        self.quantity.is_zero()
    }

    /// Apply a fill of `signed_quantity` (buy > 0, sell < 0) at `price`.
    ///
    /// Returns the realized P&L booked by the fill.
    pub fn apply_fill(
        &mut self,
        signed_quantity: Decimal,
        price: Decimal,
        commission: Decimal,
    ) -> Result<Decimal, BacktestError> {
        if signed_quantity.is_zero() {
            return Ok(Decimal::ZERO);
        }

        let trade_qty = signed_quantity.abs();
        let trade_dir = signed_quantity.signum();

        if self.is_flat() || self.quantity.signum() == trade_dir {
            self.add(signed_quantity, price, commission)?;
            return Ok(Decimal::ZERO);
        }

        let held_dir = self.quantity.signum();
        let closed = trade_qty.min(self.quantity.abs());
        let realized = price
            .checked_sub(self.average_cost)
            .and_then(|diff| closed.checked_mul(diff))
            .and_then(|v| v.checked_mul(held_dir))
            .or_overflow("realized pnl")?;
        self.realized_pnl = self
            .realized_pnl
            .checked_add(realized)
            .or_overflow("realized pnl")?;
        self.quantity = self
            .quantity
            .checked_add(signed_quantity)
            .or_overflow("position quantity")?;

        if self.is_flat() {
            self.average_cost = Decimal::ZERO;
        } else if self.quantity.signum() != held_dir {
            // Reversed: the remainder opens at the fill price plus its share
            // of the commission.
            let per_unit = commission.checked_div(trade_qty).or_overflow("average cost")?;
            self.average_cost = price
                .checked_add(trade_dir * per_unit)
                .or_overflow("average cost")?;
        }

        Ok(realized)
    }

    fn add(
        &mut self,
        signed_quantity: Decimal,
        price: Decimal,
        commission: Decimal,
    ) -> Result<(), BacktestError> {
        let held = self.quantity.abs();
        let trade = signed_quantity.abs();
        let basis = held
            .checked_mul(self.average_cost)
            .and_then(|v| v.checked_add(trade.checked_mul(price)?))
            .and_then(|v| v.checked_add(signed_quantity.signum() * commission))
            .or_overflow("average cost")?;
        let total = held.checked_add(trade).or_overflow("position quantity")?;
        self.average_cost = basis.checked_div(total).or_overflow("average cost")?;
        self.quantity = self
            .quantity
            .checked_add(signed_quantity)
            .or_overflow("position quantity")?;
        Ok(())
    }

    /// Mark to `price`, refreshing market value and unrealized P&L.
    pub fn mark(&mut self, price: Decimal) -> Result<(), BacktestError> {
        self.last_price = Some(price);
        if self.is_flat() {
            self.market_value = Decimal::ZERO;
            self.unrealized_pnl = Decimal::ZERO;
            return Ok(());
        }
        self.market_value = self
            .quantity
            .checked_mul(price)
            .or_overflow("market value")?;
        self.unrealized_pnl = price
            .checked_sub(self.average_cost)
            .and_then(|diff| self.quantity.checked_mul(diff))
            .or_overflow("unrealized pnl")?;
        Ok(())
    }
}

//! Order lifecycle and fill simulation.
//!
//! Orders are created pending and matched against the next bars handed to
//! [`TradeExecutor::process_orders`]. Market orders fill at the configured
//! price basis; limit orders fill at their limit price once the bar range
//! touches it.

use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use super::bar::Bar;
use super::error::{BacktestError, OrOverflow};
use super::order::{Fill, Order, OrderId, OrderSide, OrderStatus, OrderType};
use super::portfolio::PortfolioManager;

/// Commission charged per fill: `max(quantity * price * rate, minimum)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommissionSchedule {
    pub rate: Decimal,
    pub minimum: Decimal,
}

pub fn calculate_commission(
    quantity: Decimal,
    price: Decimal,
    schedule: &CommissionSchedule,
) -> Result<Decimal, BacktestError> {
    let proportional = quantity
        .checked_mul(price)
        .and_then(|notional| notional.checked_mul(schedule.rate))
        .or_overflow("commission")?;
    Ok(proportional.max(schedule.minimum))
}

/// Bar price used to fill market orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PriceBasis {
    Open,
    #[default]
    Close,
}

impl PriceBasis {
    pub fn price(self, bar: &Bar) -> Decimal {
        match self {
            PriceBasis::Open => bar.open,
            PriceBasis::Close => bar.close,
        }
    }
}

impl FromStr for PriceBasis {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(PriceBasis::Open),
            "close" => Ok(PriceBasis::Close),
            other => Err(format!("unknown fill basis '{other}', expected open or close")),
        }
    }
}

impl fmt::Display for PriceBasis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PriceBasis::Open => write!(f, "open"),
            PriceBasis::Close => write!(f, "close"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillOutcome {
    Filled { price: Decimal },
    Pending,
}

/// Decide whether `order` executes against `bar`.
pub fn match_order(order: &Order, bar: &Bar, basis: PriceBasis) -> FillOutcome {
    match (order.order_type, order.limit_price) {
        (OrderType::Market, _) => FillOutcome::Filled {
            price: basis.price(bar),
        },
        (OrderType::Limit, Some(limit)) => {
            let touched = match order.side {
                OrderSide::Buy => bar.low <= limit,
                OrderSide::Sell => bar.high >= limit,
            };
            if touched {
                FillOutcome::Filled { price: limit }
            } else {
                FillOutcome::Pending
            }
        }
        (OrderType::Limit, None) => FillOutcome::Pending,
    }
}

#[derive(Debug, Clone)]
pub struct TradeExecutor {
    commission: CommissionSchedule,
    basis: PriceBasis,
    symbols: BTreeSet<String>,
    next_id: u64,
    /// Pending orders in creation order.
    pending: Vec<Order>,
    /// Orders that reached a terminal state, in the order they got there.
    history: Vec<Order>,
    fills: Vec<Fill>,
}

impl TradeExecutor {
    pub fn new<I, S>(commission: CommissionSchedule, basis: PriceBasis, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        TradeExecutor {
            commission,
            basis,
            symbols: symbols.into_iter().map(Into::into).collect(),
            next_id: 1,
            pending: Vec::new(),
            history: Vec::new(),
            fills: Vec::new(),
        }
    }

    pub fn commission(&self) -> &CommissionSchedule {
        &self.commission
    }

    pub fn price_basis(&self) -> PriceBasis {
        self.basis
    }

    /// Validate and queue a new order. Rejected orders leave no trace.
    pub fn create_order(
        &mut self,
        symbol: &str,
        side: OrderSide,
        order_type: OrderType,
        quantity: Decimal,
        limit_price: Option<Decimal>,
        created_at: NaiveDateTime,
    ) -> Result<Order, BacktestError> {
        if let Err(err) = self.validate(symbol, order_type, quantity, limit_price) {
            tracing::warn!(symbol, %side, %quantity, error = %err, "order rejected");
            return Err(err);
        }

        let order = Order {
            id: OrderId(self.next_id),
            symbol: symbol.to_string(),
            side,
            order_type,
            quantity,
            limit_price,
            status: OrderStatus::Pending,
            filled_price: None,
            filled_quantity: Decimal::ZERO,
            commission: Decimal::ZERO,
            created_at,
            filled_at: None,
        };
        self.next_id += 1;
        self.pending.push(order.clone());
        Ok(order)
    }

    fn validate(
        &self,
        symbol: &str,
        order_type: OrderType,
        quantity: Decimal,
        limit_price: Option<Decimal>,
    ) -> Result<(), BacktestError> {
        if quantity <= Decimal::ZERO {
            return Err(BacktestError::invalid_order(format!(
                "quantity must be positive, got {quantity}"
            )));
        }
        if !self.symbols.contains(symbol) {
            return Err(BacktestError::invalid_order(format!(
                "unknown symbol '{symbol}'"
            )));
        }
        match (order_type, limit_price) {
            (OrderType::Limit, None) => Err(BacktestError::invalid_order(
                "limit order requires a limit price",
            )),
            (OrderType::Limit, Some(price)) if price <= Decimal::ZERO => Err(
                BacktestError::invalid_order(format!("limit price must be positive, got {price}")),
            ),
            (OrderType::Market, Some(_)) => Err(BacktestError::invalid_order(
                "market order must not carry a limit price",
            )),
            _ => Ok(()),
        }
    }

    /// Match every pending order against `bars`, in creation order, applying
    /// each fill to `portfolio`. Orders whose symbol has no bar stay pending.
    pub fn process_orders(
        &mut self,
        at_time: NaiveDateTime,
        bars: &BTreeMap<String, Bar>,
        portfolio: &mut PortfolioManager,
    ) -> Result<Vec<Fill>, BacktestError> {
        let mut fills = Vec::new();
        let mut still_pending = Vec::with_capacity(self.pending.len());
        let mut queue = std::mem::take(&mut self.pending).into_iter();

        while let Some(mut order) = queue.next() {
            let outcome = bars
                .get(&order.symbol)
                .map_or(FillOutcome::Pending, |bar| match_order(&order, bar, self.basis));

            let price = match outcome {
                FillOutcome::Pending => {
                    still_pending.push(order);
                    continue;
                }
                FillOutcome::Filled { price } => price,
            };

            let applied = calculate_commission(order.quantity, price, &self.commission)
                .and_then(|commission| {
                    order.status = OrderStatus::Filled;
                    order.filled_price = Some(price);
                    order.filled_quantity = order.quantity;
                    order.commission = commission;
                    order.filled_at = Some(at_time);
                    portfolio.update_position(&order)
                });
            let realized_pnl = match applied {
                Ok(realized) => realized,
                Err(err) => {
                    // Fatal for the run; keep the order pending for inspection.
                    order.status = OrderStatus::Pending;
                    order.filled_price = None;
                    order.filled_quantity = Decimal::ZERO;
                    order.commission = Decimal::ZERO;
                    order.filled_at = None;
                    still_pending.push(order);
                    still_pending.extend(queue);
                    self.pending = still_pending;
                    return Err(err);
                }
            };

            let fill = Fill {
                order_id: order.id,
                symbol: order.symbol.clone(),
                side: order.side,
                quantity: order.filled_quantity,
                price,
                commission: order.commission,
                timestamp: at_time,
                realized_pnl,
            };
            tracing::debug!(
                order = %order.id,
                symbol = %order.symbol,
                side = %order.side,
                quantity = %fill.quantity,
                price = %fill.price,
                commission = %fill.commission,
                "order filled"
            );
            self.fills.push(fill.clone());
            self.history.push(order);
            fills.push(fill);
        }

        self.pending = still_pending;
        Ok(fills)
    }

    /// Cancel a pending order. Unknown or already terminal ids return false.
    pub fn cancel_order(&mut self, id: OrderId) -> bool {
        let Some(index) = self.pending.iter().position(|o| o.id == id) else {
            return false;
        };
        let mut order = self.pending.remove(index);
        order.status = OrderStatus::Cancelled;
        tracing::debug!(order = %id, symbol = %order.symbol, "order cancelled");
        self.history.push(order);
        true
    }

    pub fn pending_orders(&self) -> &[Order] {
        &self.pending
    }

    pub fn order_history(&self) -> &[Order] {
        &self.history
    }

    pub fn fills(&self) -> &[Fill] {
        &self.fills
    }

    /// Look up an order by id, pending or terminal.
    pub fn order(&self, id: OrderId) -> Option<&Order> {
        self.pending
            .iter()
            .chain(self.history.iter())
            .find(|o| o.id == id)
    }

    pub fn into_parts(self) -> (Vec<Order>, Vec<Order>, Vec<Fill>) {
        (self.history, self.pending, self.fills)
    }
}

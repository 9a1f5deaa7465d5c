//! Derived positions, completed trade records and fill matching

use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use super::order::OrderSide;

/// Direction of the current position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketPosition {
    Flat,
    Long,
    Short,
}

/// Position derived from the executions of one round trip
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Net signed quantity (positive = long, negative = short)
    pub quantity: i32,
    /// Average entry price while not flat
    pub avg_price: Option<f64>,
}

impl Position {
    pub fn flat() -> Self {
        Self { quantity: 0, avg_price: None }
    }

    pub fn market_position(&self) -> MarketPosition {
        match self.quantity {
            0 => MarketPosition::Flat,
            q if q > 0 => MarketPosition::Long,
            _ => MarketPosition::Short,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.quantity == 0
    }

    pub fn abs_quantity(&self) -> i32 {
        self.quantity.abs()
    }

    /// Side of the order that would flatten this position
    pub fn closing_side(&self) -> Option<OrderSide> {
        match self.market_position() {
            MarketPosition::Flat => None,
            MarketPosition::Long => Some(OrderSide::Sell),
            MarketPosition::Short => Some(OrderSide::Buy),
        }
    }
}

/// Outcome class of a completed trade
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeOutcome {
    Win,
    Loss,
    Breakeven,
}

/// Completed round trip with realized P&L
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    /// Entry price
    pub entry_price: f64,
    /// Exit price
    pub exit_price: f64,
    /// Side of the position that was closed
    pub side: OrderSide,
    /// Number of contracts
    pub quantity: i32,
    /// P&L in points (already multiplied by quantity)
    pub pnl_points: f64,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
}

impl TradeRecord {
    pub fn outcome(&self) -> TradeOutcome {
        if self.pnl_points > f64::EPSILON {
            TradeOutcome::Win
        } else if self.pnl_points < -f64::EPSILON {
            TradeOutcome::Loss
        } else {
            TradeOutcome::Breakeven
        }
    }
}

/// Net position book that turns a stream of fills into trade records.
///
/// This is the broker-side ledger; the strategy core only reads the
/// resulting [`TradeRecord`]s.
#[derive(Debug, Default)]
pub struct PositionBook {
    net_position: i32,
    avg_entry_price: Option<f64>,
    opened_at: Option<DateTime<Utc>>,
    trades: Vec<TradeRecord>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn net_position(&self) -> i32 {
        self.net_position
    }

    pub fn avg_entry_price(&self) -> Option<f64> {
        self.avg_entry_price
    }

    pub fn trades(&self) -> &[TradeRecord] {
        &self.trades
    }

    /// Apply a fill. Returns the trade record when the fill reduces the position.
    pub fn apply_fill(
        &mut self,
        side: OrderSide,
        quantity: i32,
        price: f64,
        time: DateTime<Utc>,
    ) -> Option<TradeRecord> {
        let signed_qty = side.signed(quantity);

        if self.net_position == 0 || self.net_position.signum() == signed_qty.signum() {
            // Opening or adding - weighted average
            let old_value = self.avg_entry_price.unwrap_or(price) * self.net_position.abs() as f64;
            let new_value = price * quantity as f64;
            let total = (self.net_position.abs() + quantity) as f64;
            self.avg_entry_price = Some((old_value + new_value) / total);
            if self.net_position == 0 {
                self.opened_at = Some(time);
            }
            self.net_position += signed_qty;
            return None;
        }

        let entry_price = self.avg_entry_price.unwrap_or(price);
        let closed = quantity.min(self.net_position.abs());
        let position_side = if self.net_position > 0 { OrderSide::Buy } else { OrderSide::Sell };
        let pnl_points = (price - entry_price) * position_side.direction() * closed as f64;

        let record = TradeRecord {
            entry_price,
            exit_price: price,
            side: position_side,
            quantity: closed,
            pnl_points,
            entry_time: self.opened_at.unwrap_or(time),
            exit_time: time,
        };
        self.trades.push(record.clone());

        self.net_position += signed_qty;
        if self.net_position == 0 {
            self.avg_entry_price = None;
            self.opened_at = None;
        } else if self.net_position.signum() == signed_qty.signum() {
            // Fill crossed through zero: the remainder opens a new position
            self.avg_entry_price = Some(price);
            self.opened_at = Some(time);
        }

        Some(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_direction() {
        let pos = Position { quantity: -2, avg_price: Some(100.0) };
        assert_eq!(pos.market_position(), MarketPosition::Short);
        assert_eq!(pos.closing_side(), Some(OrderSide::Buy));
        assert_eq!(pos.abs_quantity(), 2);
        assert!(Position::flat().is_flat());
        assert_eq!(Position::flat().closing_side(), None);
    }

    #[test]
    fn test_pnl_calculation() {
        let mut book = PositionBook::new();
        let now = Utc::now();

        assert!(book.apply_fill(OrderSide::Buy, 1, 21505.0, now).is_none());
        assert_eq!(book.net_position(), 1);

        // Exit with 10 pt profit
        let record = book.apply_fill(OrderSide::Sell, 1, 21515.0, now).unwrap();
        assert_eq!(record.pnl_points, 10.0);
        assert_eq!(record.outcome(), TradeOutcome::Win);
        assert_eq!(book.net_position(), 0);
        assert_eq!(book.avg_entry_price(), None);
    }

    #[test]
    fn test_short_loss_and_averaging() {
        let mut book = PositionBook::new();
        let now = Utc::now();

        book.apply_fill(OrderSide::Sell, 1, 100.0, now);
        book.apply_fill(OrderSide::Sell, 1, 102.0, now);
        assert_eq!(book.avg_entry_price(), Some(101.0));

        let record = book.apply_fill(OrderSide::Buy, 2, 103.0, now).unwrap();
        assert_eq!(record.pnl_points, -4.0);
        assert_eq!(record.outcome(), TradeOutcome::Loss);
        assert_eq!(book.trades().len(), 1);
    }

    #[test]
    fn test_fill_through_zero_reverses() {
        let mut book = PositionBook::new();
        let now = Utc::now();

        book.apply_fill(OrderSide::Buy, 1, 100.0, now);
        let record = book.apply_fill(OrderSide::Sell, 2, 100.0, now).unwrap();
        assert_eq!(record.quantity, 1);
        assert_eq!(record.outcome(), TradeOutcome::Breakeven);
        assert_eq!(book.net_position(), -1);
        assert_eq!(book.avg_entry_price(), Some(100.0));
    }
}

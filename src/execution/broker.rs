//! Broker-session seam
//!
//! The strategy core never talks to a venue directly. It submits, cancels and
//! amends through [`OrderSession`], reads completed trades through
//! [`TradeLedger`], and receives asynchronous callbacks as [`BrokerEvent`]s.

use thiserror::Error;

use super::order::{Execution, Order, OrderRequest, OrderState};
use super::position::TradeRecord;

/// Errors returned by a broker session
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BrokerError {
    #[error("order rejected: {0}")]
    Rejected(String),

    #[error("unknown order: {0}")]
    UnknownOrder(String),

    #[error("order {name} is not working (state {state})")]
    NotWorking { name: String, state: OrderState },

    #[error("broker session disconnected")]
    Disconnected,
}

/// Asynchronous broker callback
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    OrderUpdate(Order),
    Execution(Execution),
}

/// Order-session API controlled by the host platform
pub trait OrderSession {
    /// Submit an order. The returned snapshot is the broker's view at
    /// submission time; later state arrives through [`BrokerEvent`]s.
    fn submit_order(&mut self, request: OrderRequest) -> Result<Order, BrokerError>;

    fn cancel_order(&mut self, order: &Order) -> Result<(), BrokerError>;

    /// Change quantity and/or working prices of a live order
    fn amend_order(
        &mut self,
        order: &Order,
        quantity: i32,
        limit_price: Option<f64>,
        stop_price: Option<f64>,
    ) -> Result<(), BrokerError>;

    /// Whether the session links orders into native OCO groups
    fn supports_linked_orders(&self) -> bool {
        false
    }
}

/// Read-only list of completed trades
pub trait TradeLedger {
    fn completed_trades(&self) -> &[TradeRecord];
}

/// Source of queued broker callbacks, drained by the host loop
pub trait BrokerFeed {
    fn poll_events(&mut self) -> Vec<BrokerEvent>;
}

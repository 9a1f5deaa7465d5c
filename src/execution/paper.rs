//! Paper broker session
//!
//! Deterministic simulated broker: orders are acknowledged through queued
//! callbacks, market orders fill at the last price, stop-market and limit
//! orders trigger on price samples. Fills are matched into a trade ledger.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use tracing::debug;

use super::broker::{BrokerError, BrokerEvent, BrokerFeed, OrderSession, TradeLedger};
use super::order::{Execution, Order, OrderRequest, OrderSide, OrderState, OrderType};
use super::position::{PositionBook, TradeRecord};

/// Simulated broker session for one symbol
pub struct PaperBroker {
    symbol: String,
    orders: Vec<Order>,
    events: VecDeque<BrokerEvent>,
    book: PositionBook,
    last_price: Option<f64>,
    last_time: DateTime<Utc>,
    native_oco: bool,
    /// Largest quantity filled per trigger; `None` fills everything at once
    fill_lot: Option<i32>,
    reject_next: bool,
    reject_amendments: bool,
    execution_seq: u64,
    submissions: usize,
    cancellations: usize,
    amendments: usize,
}

impl PaperBroker {
    pub fn new(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            orders: Vec::new(),
            events: VecDeque::new(),
            book: PositionBook::new(),
            last_price: None,
            last_time: Utc::now(),
            native_oco: false,
            fill_lot: None,
            reject_next: false,
            reject_amendments: false,
            execution_seq: 0,
            submissions: 0,
            cancellations: 0,
            amendments: 0,
        }
    }

    /// Link orders sharing an OCO group: a fill cancels the rest of the group
    pub fn with_native_oco(mut self) -> Self {
        self.native_oco = true;
        self
    }

    /// Fill at most `lot` contracts per trigger, producing partial fills
    pub fn with_fill_lot(mut self, lot: i32) -> Self {
        self.fill_lot = Some(lot.max(1));
        self
    }

    pub fn reject_next_submission(&mut self) {
        self.reject_next = true;
    }

    pub fn set_reject_amendments(&mut self, reject: bool) {
        self.reject_amendments = reject;
    }

    pub fn last_price(&self) -> Option<f64> {
        self.last_price
    }

    /// Feed a price sample: triggers any marketable working order
    pub fn on_price(&mut self, price: f64, time: DateTime<Utc>) {
        self.last_price = Some(price);
        self.last_time = time;

        for idx in 0..self.orders.len() {
            // Earlier fills may have cancelled this order through its OCO group
            if self.orders[idx].is_active() {
                self.try_fill(idx, price);
            }
        }
    }

    /// Most recent order submitted under `name`
    pub fn order_named(&self, name: &str) -> Option<&Order> {
        self.orders.iter().rev().find(|o| o.name == name)
    }

    pub fn working_orders(&self) -> impl Iterator<Item = &Order> {
        self.orders.iter().filter(|o| o.is_active())
    }

    /// Cancel an order from outside the strategy, as a trader clicking cancel would
    pub fn cancel_externally(&mut self, name: &str) -> bool {
        self.terminate_named(name, OrderState::Cancelled)
    }

    /// Venue-side rejection of a working order
    pub fn reject_externally(&mut self, name: &str) -> bool {
        self.terminate_named(name, OrderState::Rejected)
    }

    pub fn submissions(&self) -> usize {
        self.submissions
    }

    pub fn cancellations(&self) -> usize {
        self.cancellations
    }

    pub fn amendments(&self) -> usize {
        self.amendments
    }

    pub fn net_position(&self) -> i32 {
        self.book.net_position()
    }

    fn terminate_named(&mut self, name: &str, state: OrderState) -> bool {
        let Some(idx) = self.orders.iter().rposition(|o| o.name == name && o.is_active()) else {
            return false;
        };
        self.orders[idx].update_state(state);
        self.events.push_back(BrokerEvent::OrderUpdate(self.orders[idx].clone()));
        true
    }

    fn find_index(&self, order: &Order) -> Result<usize, BrokerError> {
        self.orders
            .iter()
            .position(|o| o.id == order.id)
            .or_else(|| self.orders.iter().rposition(|o| o.name == order.name))
            .ok_or_else(|| BrokerError::UnknownOrder(order.name.clone()))
    }

    /// Fill price if the order is marketable at `price`
    fn trigger_price(order: &Order, price: f64) -> Option<f64> {
        match (order.order_type, order.side) {
            (OrderType::Market, _) => Some(price),
            (OrderType::StopMarket, OrderSide::Sell) => {
                order.stop_price.filter(|s| price <= *s).map(|_| price)
            }
            (OrderType::StopMarket, OrderSide::Buy) => {
                order.stop_price.filter(|s| price >= *s).map(|_| price)
            }
            (OrderType::Limit, OrderSide::Sell) => order.limit_price.filter(|l| price >= *l),
            (OrderType::Limit, OrderSide::Buy) => order.limit_price.filter(|l| price <= *l),
        }
    }

    fn try_fill(&mut self, idx: usize, price: f64) {
        let Some(fill_price) = Self::trigger_price(&self.orders[idx], price) else {
            return;
        };
        let remaining = self.orders[idx].remaining();
        let quantity = self.fill_lot.map_or(remaining, |lot| lot.min(remaining));
        if quantity <= 0 {
            return;
        }

        let time = self.last_time;
        let order = &mut self.orders[idx];
        order.record_fill(quantity, fill_price);
        self.execution_seq += 1;
        let execution = Execution {
            execution_id: format!("paper-{}", self.execution_seq),
            order_id: order.id,
            order_name: order.name.clone(),
            side: order.side,
            quantity,
            price: fill_price,
            time,
        };
        debug!("Paper fill: {} {} {} @ {:.2}", order.name, order.side, quantity, fill_price);

        let snapshot = order.clone();
        self.book.apply_fill(snapshot.side, quantity, fill_price, time);
        self.events.push_back(BrokerEvent::OrderUpdate(snapshot.clone()));
        self.events.push_back(BrokerEvent::Execution(execution));

        if self.native_oco && snapshot.state == OrderState::Filled {
            if let Some(group) = snapshot.oco_group.as_deref() {
                self.cancel_group(group, snapshot.id);
            }
        }
    }

    fn cancel_group(&mut self, group: &str, filled: uuid::Uuid) {
        for order in self.orders.iter_mut() {
            let linked = order.oco_group.as_deref() == Some(group);
            if order.id != filled && order.is_active() && linked {
                order.update_state(OrderState::Cancelled);
                self.events.push_back(BrokerEvent::OrderUpdate(order.clone()));
            }
        }
    }
}

fn not_working(order: &Order) -> BrokerError {
    BrokerError::NotWorking { name: order.name.clone(), state: order.state }
}

impl OrderSession for PaperBroker {
    fn submit_order(&mut self, request: OrderRequest) -> Result<Order, BrokerError> {
        self.submissions += 1;

        if std::mem::take(&mut self.reject_next) {
            return Err(BrokerError::Rejected(request.name));
        }
        if request.symbol != self.symbol || request.quantity <= 0 {
            return Err(BrokerError::Rejected(request.name));
        }

        let mut order = Order::from_request(&request, OrderState::PendingSubmit);
        if !self.native_oco {
            order.oco_group = None;
        }
        let submitted = order.clone();

        order.update_state(OrderState::Accepted);
        self.events.push_back(BrokerEvent::OrderUpdate(order.clone()));
        order.update_state(OrderState::Working);
        self.events.push_back(BrokerEvent::OrderUpdate(order.clone()));
        self.orders.push(order);

        if let Some(price) = self.last_price {
            self.try_fill(self.orders.len() - 1, price);
        }

        Ok(submitted)
    }

    fn cancel_order(&mut self, order: &Order) -> Result<(), BrokerError> {
        let idx = self.find_index(order)?;
        let current = &mut self.orders[idx];
        if current.is_terminal() {
            return Err(not_working(current));
        }
        current.update_state(OrderState::Cancelled);
        self.cancellations += 1;
        self.events.push_back(BrokerEvent::OrderUpdate(current.clone()));
        Ok(())
    }

    fn amend_order(
        &mut self,
        order: &Order,
        quantity: i32,
        limit_price: Option<f64>,
        stop_price: Option<f64>,
    ) -> Result<(), BrokerError> {
        self.amendments += 1;
        if self.reject_amendments {
            return Err(BrokerError::Rejected(order.name.clone()));
        }

        let idx = self.find_index(order)?;
        let current = &mut self.orders[idx];
        if current.is_terminal() {
            return Err(not_working(current));
        }
        if quantity <= current.filled_quantity {
            return Err(BrokerError::Rejected(current.name.clone()));
        }

        current.amend(quantity, limit_price, stop_price);
        self.events.push_back(BrokerEvent::OrderUpdate(current.clone()));

        if let Some(price) = self.last_price {
            self.try_fill(idx, price);
        }
        Ok(())
    }

    fn supports_linked_orders(&self) -> bool {
        self.native_oco
    }
}

impl TradeLedger for PaperBroker {
    fn completed_trades(&self) -> &[TradeRecord] {
        self.book.trades()
    }
}

impl BrokerFeed for PaperBroker {
    fn poll_events(&mut self) -> Vec<BrokerEvent> {
        self.events.drain(..).collect()
    }
}

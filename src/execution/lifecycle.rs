//! Order lifecycle manager - one round trip at a time
//!
//! ```text
//! Idle -> EntryPending -> PositionOpen -> ExitPending -> Idle
//! ```
//!
//! Owns the entry and flatten orders. Callback snapshots are bound to their
//! role by name and applied only when they carry newer information, so a
//! re-delivered update never changes state. Fills are summed per execution
//! and the position is only acted on once that sum agrees with the entry
//! order's last reported filled quantity.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::broker::{BrokerError, OrderSession};
use super::order::{Execution, Order, OrderRequest, OrderRole, OrderSide, OrderState, OrderTag};
use super::position::Position;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecyclePhase {
    /// No entry order
    Idle,
    /// Entry submitted, not yet reconciled as filled
    EntryPending,
    /// At least one reconciled fill
    PositionOpen,
    /// Flatten order working
    ExitPending,
}

/// Result of applying an entry order update
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EntryProgress {
    /// Entry ended with zero fill
    Abandoned,
    /// Summed executions now agree with the order's filled quantity
    Reconciled { quantity: i32, avg_price: f64, first: bool },
    Updated,
    /// Stale or duplicate snapshot
    Unchanged,
    Untracked,
}

/// Result of applying an execution report
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExecutionOutcome {
    Duplicate,
    /// No live round trip to apply it to
    Ignored,
    /// Entry fill summed; waiting for the order update to agree
    EntryPending,
    EntryReconciled { quantity: i32, avg_price: f64, first: bool },
    /// Fill of a protective or flatten order
    ExitApplied(OrderRole),
}

/// Result of applying a flatten order update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitProgress {
    Updated,
    Unchanged,
    Untracked,
    /// Cancelled or rejected with the position still open
    Failed(OrderRole),
}

#[derive(Debug)]
pub struct OrderLifecycle {
    phase: LifecyclePhase,
    round_trip: u64,
    entry: Option<Order>,
    entry_side: Option<OrderSide>,
    entry_cancel_requested: bool,
    /// Highest filled quantity reported on the entry order
    last_known_filled: i32,
    /// Entry fills summed from executions
    entry_fill_qty: i32,
    entry_fill_value: f64,
    reconciled_qty: i32,
    /// Signed sum of every execution in the round trip
    net_quantity: i32,
    exit: Option<Order>,
    exit_attempts: u32,
    seen_executions: HashSet<String>,
    /// Orders released by their owner that still await a terminal state
    draining: Vec<Order>,
    flatten_retry: Option<OrderRole>,
    closed: bool,
}

impl Default for OrderLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderLifecycle {
    pub fn new() -> Self {
        Self {
            phase: LifecyclePhase::Idle,
            round_trip: 0,
            entry: None,
            entry_side: None,
            entry_cancel_requested: false,
            last_known_filled: 0,
            entry_fill_qty: 0,
            entry_fill_value: 0.0,
            reconciled_qty: 0,
            net_quantity: 0,
            exit: None,
            exit_attempts: 0,
            seen_executions: HashSet::new(),
            draining: Vec::new(),
            flatten_retry: None,
            closed: false,
        }
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.phase
    }

    pub fn round_trip(&self) -> u64 {
        self.round_trip
    }

    pub fn entry(&self) -> Option<&Order> {
        self.entry.as_ref()
    }

    pub fn entry_side(&self) -> Option<OrderSide> {
        self.entry_side
    }

    pub fn exit(&self) -> Option<&Order> {
        self.exit.as_ref()
    }

    pub fn draining(&self) -> &[Order] {
        &self.draining
    }

    pub fn has_fills(&self) -> bool {
        self.entry_fill_qty > 0
    }

    pub fn reconciled_quantity(&self) -> i32 {
        self.reconciled_qty
    }

    /// Position derived from this round trip's executions
    pub fn position(&self) -> Position {
        if self.net_quantity == 0 || self.entry_fill_qty == 0 {
            return Position { quantity: self.net_quantity, avg_price: None };
        }
        Position {
            quantity: self.net_quantity,
            avg_price: Some(self.entry_fill_value / self.entry_fill_qty as f64),
        }
    }

    pub fn exit_in_flight(&self) -> bool {
        self.exit.as_ref().is_some_and(|o| o.is_active())
    }

    pub fn flatten_pending(&self) -> bool {
        self.flatten_retry.is_some()
    }

    pub fn schedule_flatten(&mut self, role: OrderRole) {
        self.flatten_retry.get_or_insert(role);
    }

    pub fn take_flatten_retry(&mut self) -> Option<OrderRole> {
        self.flatten_retry.take()
    }

    /// Position went flat and the remaining orders are being drained
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Submit a market entry. Only legal while idle.
    pub fn request_entry(
        &mut self,
        session: &mut dyn OrderSession,
        symbol: &str,
        side: OrderSide,
        quantity: i32,
    ) -> bool {
        if self.phase != LifecyclePhase::Idle {
            debug!("Entry ignored: round trip {} is {:?}", self.round_trip, self.phase);
            return false;
        }

        self.round_trip += 1;
        let tag = OrderTag::new(OrderRole::Entry, self.round_trip);
        let request = OrderRequest::market(tag, symbol, side, quantity);
        match session.submit_order(request) {
            Ok(order) => {
                info!(
                    "ENTRY submitted: {} {} @ MKT (round trip {})",
                    side, quantity, self.round_trip
                );
                self.entry = Some(order);
                self.entry_side = Some(side);
                self.phase = LifecyclePhase::EntryPending;
                true
            }
            Err(e) => {
                // Treated as cancelled with zero fill: nothing was created
                warn!("ENTRY rejected: {} (round trip {})", e, self.round_trip);
                false
            }
        }
    }

    pub fn apply_entry_update(&mut self, order: &Order) -> EntryProgress {
        let Some(entry) = self.entry.as_mut().filter(|e| e.name == order.name) else {
            return EntryProgress::Untracked;
        };
        if !order.supersedes(entry) {
            return EntryProgress::Unchanged;
        }
        *entry = order.clone();
        self.last_known_filled = self.last_known_filled.max(order.filled_quantity);
        debug!(
            "{} -> {} ({}/{} filled)",
            order.name, order.state, order.filled_quantity, order.quantity
        );

        if order.is_terminal() && order.filled_quantity == 0 && self.entry_fill_qty == 0 {
            info!("ENTRY {} with no fill (round trip {})", order.state, self.round_trip);
            return EntryProgress::Abandoned;
        }

        match self.try_reconcile() {
            Some((quantity, avg_price, first)) => {
                EntryProgress::Reconciled { quantity, avg_price, first }
            }
            None => EntryProgress::Updated,
        }
    }

    pub fn apply_execution(&mut self, execution: &Execution) -> ExecutionOutcome {
        let Some(tag) = execution.tag() else {
            return ExecutionOutcome::Ignored;
        };
        if self.phase == LifecyclePhase::Idle || tag.round_trip != self.round_trip {
            return ExecutionOutcome::Ignored;
        }
        if !self.seen_executions.insert(execution.execution_id.clone()) {
            return ExecutionOutcome::Duplicate;
        }

        self.net_quantity += execution.side.signed(execution.quantity);

        if tag.role != OrderRole::Entry {
            info!(
                "{} filled: {} {} @ {:.2} (position {})",
                execution.order_name,
                execution.side,
                execution.quantity,
                execution.price,
                self.net_quantity
            );
            return ExecutionOutcome::ExitApplied(tag.role);
        }

        self.entry_fill_qty += execution.quantity;
        self.entry_fill_value += execution.quantity as f64 * execution.price;
        match self.try_reconcile() {
            Some((quantity, avg_price, first)) => {
                ExecutionOutcome::EntryReconciled { quantity, avg_price, first }
            }
            None => {
                debug!(
                    "Entry fill summed to {} (order reports {}), awaiting reconciliation",
                    self.entry_fill_qty, self.last_known_filled
                );
                ExecutionOutcome::EntryPending
            }
        }
    }

    fn try_reconcile(&mut self) -> Option<(i32, f64, bool)> {
        if self.entry_fill_qty == 0
            || self.entry_fill_qty != self.last_known_filled
            || self.entry_fill_qty <= self.reconciled_qty
        {
            return None;
        }
        let first = self.reconciled_qty == 0;
        self.reconciled_qty = self.entry_fill_qty;
        if self.phase == LifecyclePhase::EntryPending {
            self.phase = LifecyclePhase::PositionOpen;
        }
        Some((self.reconciled_qty, self.entry_fill_value / self.entry_fill_qty as f64, first))
    }

    /// Cancel the unfilled remainder of the entry order, once
    pub fn cancel_entry(&mut self, session: &mut dyn OrderSession) -> bool {
        if self.entry_cancel_requested {
            return false;
        }
        let Some(entry) = self.entry.as_ref().filter(|o| o.is_active()) else {
            return false;
        };
        match session.cancel_order(entry) {
            Ok(()) => {
                info!(
                    "ENTRY cancel requested: {} ({} of {} filled)",
                    entry.name, self.entry_fill_qty, entry.quantity
                );
                self.entry_cancel_requested = true;
                true
            }
            Err(e @ BrokerError::NotWorking { .. }) => {
                debug!("Entry cancel skipped: {}", e);
                false
            }
            Err(e) => {
                warn!("Entry cancel refused: {}", e);
                false
            }
        }
    }

    /// Submit a market order closing the whole derived position.
    /// Returns the side and size sent; a refused submission schedules a retry.
    pub fn submit_flatten(
        &mut self,
        session: &mut dyn OrderSession,
        symbol: &str,
        role: OrderRole,
    ) -> Option<(OrderSide, i32)> {
        if self.exit_in_flight() {
            debug!("Flatten skipped: exit already working");
            return None;
        }
        let side = self.position().closing_side()?;
        let quantity = self.net_quantity.abs();

        let tag = OrderTag::new(role, self.round_trip).with_attempt(self.exit_attempts);
        self.exit_attempts += 1;
        match session.submit_order(OrderRequest::market(tag, symbol, side, quantity)) {
            Ok(order) => {
                self.exit = Some(order);
                self.phase = LifecyclePhase::ExitPending;
                self.flatten_retry = None;
                Some((side, quantity))
            }
            Err(e) => {
                warn!("{} refused: {} - flatten will be retried", tag, e);
                self.flatten_retry = Some(role);
                None
            }
        }
    }

    pub fn apply_exit_update(&mut self, order: &Order) -> ExitProgress {
        let Some(exit) = self.exit.as_mut().filter(|e| e.name == order.name) else {
            return ExitProgress::Untracked;
        };
        if !order.supersedes(exit) {
            return ExitProgress::Unchanged;
        }
        *exit = order.clone();

        match order.state {
            OrderState::Cancelled | OrderState::Rejected if self.net_quantity != 0 => {
                let role = order.tag().map_or(OrderRole::ManualExit, |t| t.role);
                warn!(
                    "{} {} with {} still open - flatten will be retried",
                    order.name, order.state, self.net_quantity
                );
                self.flatten_retry = Some(role);
                self.phase = LifecyclePhase::PositionOpen;
                ExitProgress::Failed(role)
            }
            _ => ExitProgress::Updated,
        }
    }

    /// Mark the position closed and hand over orders that still need a terminal state
    pub fn close(&mut self, released: Vec<Order>) {
        self.closed = true;
        self.draining.extend(released);
    }

    /// Apply an update to a released order. Returns false if it is not held.
    pub fn apply_drain_update(&mut self, order: &Order) -> bool {
        match self.draining.iter_mut().find(|o| o.name == order.name) {
            Some(held) => {
                if order.supersedes(held) {
                    *held = order.clone();
                }
                true
            }
            None => false,
        }
    }

    /// Orders owned here that are not yet terminal
    pub fn outstanding(&self) -> usize {
        self.entry
            .iter()
            .chain(self.exit.iter())
            .chain(self.draining.iter())
            .filter(|o| o.is_active())
            .count()
    }

    /// Drop every reference and return to idle. The round-trip counter survives.
    pub fn clear(&mut self) {
        *self = Self { round_trip: self.round_trip, ..Self::new() };
    }
}

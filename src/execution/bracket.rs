//! Bracket controller - protective stop-loss / profit-target management
//!
//! Owns the two protective orders of an open position and their working
//! prices. Prices are re-evaluated on every tick-level sample:
//!
//! - Trailing: the stop steps forward by `stop_distance` while price sits
//!   more than `2 * stop_distance` beyond it.
//! - Chasing: once price retraces `target_distance` from the best price
//!   seen, the target is pulled to `best - target_distance`, provided that
//!   still locks a gain over entry.
//!
//! Trailing runs before chasing in the same step. Neither price ever moves
//! against the position.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use super::broker::{BrokerError, OrderSession};
use super::order::{Order, OrderRequest, OrderRole, OrderSide, OrderState, OrderTag};

/// Working bracket prices for the open position
#[derive(Debug, Clone, PartialEq)]
pub struct BracketState {
    /// Side of the position (not of the protective orders)
    pub side: OrderSide,
    pub entry_price: f64,
    pub stop_price: f64,
    pub target_price: f64,
    /// Most favorable price since entry
    pub best_price: f64,
    pub target_chased: bool,
}

/// Price change applied to a protective order
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BracketChange {
    StopMoved { from: f64, to: f64 },
    TargetMoved { from: f64, to: f64 },
}

/// Result of binding a callback snapshot to a protective role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebindOutcome {
    Applied(OrderRole),
    /// Stale or duplicate snapshot
    Unchanged,
    /// No protective order of that name is held
    Untracked,
}

/// Initial stop and target for a fill at `avg_price`
pub fn initial_prices(
    side: OrderSide,
    avg_price: f64,
    stop_distance: f64,
    target_distance: f64,
) -> (f64, f64) {
    let dir = side.direction();
    (avg_price - dir * stop_distance, avg_price + dir * target_distance)
}

#[derive(Debug)]
pub struct BracketController {
    stop_distance: f64,
    target_distance: f64,
    use_trailing: bool,
    use_chasing: bool,
    state: Option<BracketState>,
    stop_order: Option<Order>,
    target_order: Option<Order>,
    cancel_requested: HashSet<OrderRole>,
}

impl BracketController {
    pub fn new(
        stop_distance: f64,
        target_distance: f64,
        use_trailing: bool,
        use_chasing: bool,
    ) -> Self {
        Self {
            stop_distance,
            target_distance,
            use_trailing,
            use_chasing,
            state: None,
            stop_order: None,
            target_order: None,
            cancel_requested: HashSet::new(),
        }
    }

    /// Submit stop and target for a freshly filled entry.
    ///
    /// Returns the roles whose submission was refused. Their slot holds a
    /// rejected snapshot so OCO handling treats them like any other rejection.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        &mut self,
        session: &mut dyn OrderSession,
        symbol: &str,
        round_trip: u64,
        side: OrderSide,
        avg_price: f64,
        quantity: i32,
        oco_group: Option<String>,
    ) -> Vec<OrderRole> {
        let (stop_price, target_price) =
            initial_prices(side, avg_price, self.stop_distance, self.target_distance);
        let exit_side = side.opposite();

        self.state = Some(BracketState {
            side,
            entry_price: avg_price,
            stop_price,
            target_price,
            best_price: avg_price,
            target_chased: false,
        });
        self.cancel_requested.clear();

        let stop_request = OrderRequest::stop(
            OrderTag::new(OrderRole::StopLoss, round_trip),
            symbol,
            exit_side,
            quantity,
            stop_price,
        )
        .with_oco_group(oco_group.clone());
        let target_request = OrderRequest::limit(
            OrderTag::new(OrderRole::ProfitTarget, round_trip),
            symbol,
            exit_side,
            quantity,
            target_price,
        )
        .with_oco_group(oco_group);

        let mut rejected = Vec::new();
        let requests = [
            (OrderRole::StopLoss, stop_request),
            (OrderRole::ProfitTarget, target_request),
        ];
        for (role, request) in requests {
            let order = match session.submit_order(request.clone()) {
                Ok(order) => order,
                Err(e) => {
                    warn!("{} submission refused: {}", role, e);
                    rejected.push(role);
                    Order::from_request(&request, OrderState::Rejected)
                }
            };
            *self.slot_mut(role) = Some(order);
        }

        info!(
            "Bracket placed: {} {} | Stop @ {:.2} | Target @ {:.2}",
            exit_side, quantity, stop_price, target_price
        );
        rejected
    }

    /// Re-size working protective orders to cover `open_quantity` contracts
    pub fn resize(&mut self, session: &mut dyn OrderSession, open_quantity: i32) {
        if open_quantity <= 0 {
            return;
        }
        for order in [self.stop_order.as_ref(), self.target_order.as_ref()].into_iter().flatten() {
            if !order.is_active() {
                continue;
            }
            let quantity = order.filled_quantity + open_quantity;
            if quantity == order.quantity {
                continue;
            }
            match session.amend_order(order, quantity, None, None) {
                Ok(()) => debug!("{} resized to {}", order.name, quantity),
                Err(e) => warn!("Resize of {} to {} refused: {}", order.name, quantity, e),
            }
        }
    }

    /// Evaluate trailing and chasing for one price sample
    pub fn on_price(&mut self, session: &mut dyn OrderSession, price: f64) -> Vec<BracketChange> {
        let Some(state) = self.state.as_mut() else {
            return Vec::new();
        };
        let dir = state.side.direction();
        if dir * (price - state.best_price) > 0.0 {
            state.best_price = price;
        }

        let mut changes = Vec::new();

        if self.use_trailing && self.stop_distance > 0.0 {
            let mut new_stop = state.stop_price;
            while dir * (price - new_stop) > 2.0 * self.stop_distance {
                new_stop += dir * self.stop_distance;
            }
            if new_stop != state.stop_price {
                match Self::amend_price(session, self.stop_order.as_ref(), None, Some(new_stop)) {
                    Ok(true) => {
                        debug!(
                            "Trailing stop {:.2} -> {:.2} (price {:.2})",
                            state.stop_price, new_stop, price
                        );
                        changes.push(BracketChange::StopMoved {
                            from: state.stop_price,
                            to: new_stop,
                        });
                        state.stop_price = new_stop;
                    }
                    Ok(false) => {}
                    Err(e) => warn!(
                        "Stop amend to {:.2} refused, keeping {:.2}: {}",
                        new_stop, state.stop_price, e
                    ),
                }
            }
        }

        if self.use_chasing && dir * (state.best_price - price) >= self.target_distance {
            let candidate = state.best_price - dir * self.target_distance;
            let locks_gain = dir * (candidate - state.entry_price) > 0.0;
            let beyond_stop = dir * (candidate - state.stop_price) > 0.0;
            let tightens = if state.target_chased {
                dir * (candidate - state.target_price) > 0.0
            } else {
                candidate != state.target_price
            };

            if locks_gain && beyond_stop && tightens {
                let target = self.target_order.as_ref();
                match Self::amend_price(session, target, Some(candidate), None) {
                    Ok(true) => {
                        debug!(
                            "Chasing target {:.2} -> {:.2} (best {:.2}, price {:.2})",
                            state.target_price, candidate, state.best_price, price
                        );
                        changes.push(BracketChange::TargetMoved {
                            from: state.target_price,
                            to: candidate,
                        });
                        state.target_price = candidate;
                        state.target_chased = true;
                    }
                    Ok(false) => {}
                    Err(e) => warn!(
                        "Target amend to {:.2} refused, keeping {:.2}: {}",
                        candidate, state.target_price, e
                    ),
                }
            }
        }

        changes
    }

    /// Amend a working order's price. `Ok(false)` when there is nothing live to amend.
    fn amend_price(
        session: &mut dyn OrderSession,
        order: Option<&Order>,
        limit_price: Option<f64>,
        stop_price: Option<f64>,
    ) -> Result<bool, BrokerError> {
        match order {
            Some(order) if order.is_active() => {
                session.amend_order(order, order.quantity, limit_price, stop_price)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Bind a callback snapshot to the protective order of the same name
    pub fn rebind(&mut self, order: &Order) -> RebindOutcome {
        let Some(role) = order.tag().map(|t| t.role).filter(|r| r.is_protective()) else {
            return RebindOutcome::Untracked;
        };
        let slot = self.slot_mut(role);
        match slot {
            Some(current) if current.name == order.name => {
                if order.supersedes(current) {
                    *current = order.clone();
                    RebindOutcome::Applied(role)
                } else {
                    RebindOutcome::Unchanged
                }
            }
            _ => RebindOutcome::Untracked,
        }
    }

    pub fn order(&self, role: OrderRole) -> Option<&Order> {
        match role {
            OrderRole::StopLoss => self.stop_order.as_ref(),
            OrderRole::ProfitTarget => self.target_order.as_ref(),
            _ => None,
        }
    }

    fn slot_mut(&mut self, role: OrderRole) -> &mut Option<Order> {
        match role {
            OrderRole::ProfitTarget => &mut self.target_order,
            _ => &mut self.stop_order,
        }
    }

    /// Cancel a working protective order. Sent at most once per order.
    pub fn request_cancel(&mut self, session: &mut dyn OrderSession, role: OrderRole) -> bool {
        if self.cancel_requested.contains(&role) {
            return false;
        }
        let Some(order) = self.order(role).filter(|o| o.is_active()) else {
            return false;
        };
        match session.cancel_order(order) {
            Ok(()) => {
                debug!("Cancel requested for {}", order.name);
                self.cancel_requested.insert(role);
                true
            }
            // Already done at the broker (native OCO); the callback is on its way
            Err(e @ BrokerError::NotWorking { .. }) => {
                debug!("Cancel of {} skipped: {}", order.name, e);
                false
            }
            Err(e) => {
                warn!("Cancel of {} refused: {}", order.name, e);
                false
            }
        }
    }

    /// Cancel every working protective order
    pub fn cancel_active(&mut self, session: &mut dyn OrderSession) -> usize {
        let mut sent = 0;
        for role in [OrderRole::StopLoss, OrderRole::ProfitTarget] {
            if self.request_cancel(session, role) {
                sent += 1;
            }
        }
        sent
    }

    /// Drop both references and the bracket state together.
    /// Returns the orders that were still live so the caller can drain them.
    pub fn clear(&mut self) -> Vec<Order> {
        self.state = None;
        self.cancel_requested.clear();
        [self.stop_order.take(), self.target_order.take()]
            .into_iter()
            .flatten()
            .filter(|o| o.is_active())
            .collect()
    }

    pub fn active_count(&self) -> usize {
        [self.stop_order.as_ref(), self.target_order.as_ref()]
            .into_iter()
            .flatten()
            .filter(|o| o.is_active())
            .count()
    }

    pub fn has_active_orders(&self) -> bool {
        self.active_count() > 0
    }

    pub fn has_orders(&self) -> bool {
        self.stop_order.is_some() || self.target_order.is_some()
    }

    pub fn state(&self) -> Option<&BracketState> {
        self.state.as_ref()
    }

    /// Current (stop, target)
    pub fn prices(&self) -> Option<(f64, f64)> {
        self.state.as_ref().map(|s| (s.stop_price, s.target_price))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::broker::{BrokerEvent, BrokerFeed};
    use crate::execution::paper::PaperBroker;

    fn open_long(controller: &mut BracketController, broker: &mut PaperBroker) {
        let rejected = controller.open(broker, "NQ", 1, OrderSide::Buy, 100.0, 1, None);
        assert!(rejected.is_empty());
        for event in broker.poll_events() {
            if let BrokerEvent::OrderUpdate(order) = event {
                controller.rebind(&order);
            }
        }
    }

    #[test]
    fn test_initial_prices() {
        assert_eq!(initial_prices(OrderSide::Buy, 100.0, 6.0, 24.0), (94.0, 124.0));
        assert_eq!(initial_prices(OrderSide::Sell, 100.0, 6.0, 24.0), (106.0, 76.0));
    }

    #[test]
    fn test_open_places_both_orders() {
        let mut broker = PaperBroker::new("NQ");
        let mut controller = BracketController::new(6.0, 24.0, false, false);
        open_long(&mut controller, &mut broker);

        let stop = controller.order(OrderRole::StopLoss).unwrap();
        assert_eq!(stop.state, OrderState::Working);
        assert_eq!(stop.stop_price, Some(94.0));
        assert_eq!(stop.side, OrderSide::Sell);
        let target = controller.order(OrderRole::ProfitTarget).unwrap();
        assert_eq!(target.limit_price, Some(124.0));
        assert_eq!(controller.prices(), Some((94.0, 124.0)));
    }

    #[test]
    fn test_chasing_waits_for_full_retrace() {
        let mut broker = PaperBroker::new("NQ");
        let mut controller = BracketController::new(6.0, 24.0, false, true);
        open_long(&mut controller, &mut broker);

        for price in [110.0, 120.0, 130.0, 125.0, 110.0, 106.5] {
            assert!(controller.on_price(&mut broker, price).is_empty());
        }
        let changes = controller.on_price(&mut broker, 106.0);
        assert_eq!(changes, vec![BracketChange::TargetMoved { from: 124.0, to: 106.0 }]);
        assert_eq!(controller.prices(), Some((94.0, 106.0)));

        // Lower candidates never loosen a chased target
        assert!(controller.on_price(&mut broker, 104.0).is_empty());
        assert_eq!(controller.prices(), Some((94.0, 106.0)));
    }

    #[test]
    fn test_trailing_steps_by_distance() {
        let mut broker = PaperBroker::new("NQ");
        let mut controller = BracketController::new(6.0, 24.0, true, false);
        open_long(&mut controller, &mut broker);

        // 106 is exactly 2 * 6 above the stop: no step yet
        assert!(controller.on_price(&mut broker, 106.0).is_empty());
        let changes = controller.on_price(&mut broker, 107.0);
        assert_eq!(changes, vec![BracketChange::StopMoved { from: 94.0, to: 100.0 }]);

        // Adverse move leaves the stop alone
        assert!(controller.on_price(&mut broker, 101.0).is_empty());
        assert_eq!(controller.prices(), Some((100.0, 124.0)));
    }

    #[test]
    fn test_trailing_before_chasing_blocks_target_inside_stop() {
        let mut broker = PaperBroker::new("NQ");
        let mut controller = BracketController::new(6.0, 24.0, true, true);
        open_long(&mut controller, &mut broker);

        controller.on_price(&mut broker, 130.0);
        assert_eq!(controller.prices(), Some((118.0, 124.0)));
        // A chased target at 106 would sit behind the trailed stop
        assert!(controller.on_price(&mut broker, 106.0).is_empty());
    }

    #[test]
    fn test_rejected_amend_keeps_price() {
        let mut broker = PaperBroker::new("NQ");
        let mut controller = BracketController::new(6.0, 24.0, true, false);
        open_long(&mut controller, &mut broker);
        broker.set_reject_amendments(true);

        assert!(controller.on_price(&mut broker, 110.0).is_empty());
        assert_eq!(controller.prices(), Some((94.0, 124.0)));

        broker.set_reject_amendments(false);
        assert_eq!(controller.on_price(&mut broker, 110.0).len(), 1);
    }

    #[test]
    fn test_rebind_by_name_and_clear() {
        let mut broker = PaperBroker::new("NQ");
        let mut controller = BracketController::new(6.0, 24.0, false, false);
        open_long(&mut controller, &mut broker);

        let mut replayed = controller.order(OrderRole::StopLoss).unwrap().clone();
        assert_eq!(controller.rebind(&replayed), RebindOutcome::Unchanged);

        // Same name, different broker identity
        replayed.id = uuid::Uuid::new_v4();
        replayed.update_state(OrderState::Cancelled);
        assert_eq!(controller.rebind(&replayed), RebindOutcome::Applied(OrderRole::StopLoss));

        let mut foreign = replayed.clone();
        foreign.name = "stop-loss#7".to_string();
        assert_eq!(controller.rebind(&foreign), RebindOutcome::Untracked);

        let live = controller.clear();
        assert_eq!(live.len(), 1);
        assert!(!controller.has_orders());
        assert!(controller.state().is_none());
    }

    #[test]
    fn test_cancel_requested_once() {
        let mut broker = PaperBroker::new("NQ");
        let mut controller = BracketController::new(6.0, 24.0, false, false);
        open_long(&mut controller, &mut broker);

        assert!(controller.request_cancel(&mut broker, OrderRole::StopLoss));
        assert!(!controller.request_cancel(&mut broker, OrderRole::StopLoss));
        assert_eq!(broker.cancellations(), 1);
    }
}

//! One-cancels-other handling for the protective pair

use tracing::{debug, warn};

use super::order::{Order, OrderRole, OrderState};

/// Reaction required after a protective order update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OcoAction {
    None,
    /// Cancel the named sibling
    CancelSibling(OrderRole),
    /// Both protective orders are gone while the position is open
    ProtectionLost,
}

/// Emulates OCO for brokers without linked orders.
///
/// In native mode the broker cancels siblings itself, so only fill
/// suppression and protection-loss detection remain active here.
#[derive(Debug, Default)]
pub struct OcoSimulator {
    native: bool,
    /// Set by a protective fill or a forced exit; lasts for the round trip
    suppressed: bool,
    /// Unprotected-position condition, consumed by the next evaluation step
    orders_cancelled: bool,
}

impl OcoSimulator {
    pub fn new(native: bool) -> Self {
        Self { native, ..Default::default() }
    }

    pub fn is_native(&self) -> bool {
        self.native
    }

    /// Evaluate an applied update of `role`'s order
    pub fn evaluate(
        &mut self,
        role: OrderRole,
        order: &Order,
        sibling: Option<&Order>,
        position_open: bool,
    ) -> OcoAction {
        match order.state {
            OrderState::Filled | OrderState::PartiallyFilled => {
                if !self.suppressed {
                    debug!("{} filled, OCO reactions suppressed", order.name);
                    self.suppressed = true;
                }
                OcoAction::None
            }
            OrderState::Cancelled | OrderState::Rejected => {
                if self.suppressed {
                    debug!("{} {} while OCO suppressed", order.name, order.state);
                    return OcoAction::None;
                }
                let sibling_role = role.sibling();
                let sibling_live = sibling.is_some_and(|s| s.is_active());
                if sibling_live {
                    return match (self.native, sibling_role) {
                        (false, Some(sibling_role)) => OcoAction::CancelSibling(sibling_role),
                        _ => OcoAction::None,
                    };
                }
                if position_open && !self.orders_cancelled {
                    warn!(
                        "Both protective orders gone with position open ({} {})",
                        order.name, order.state
                    );
                    self.orders_cancelled = true;
                    return OcoAction::ProtectionLost;
                }
                OcoAction::None
            }
            _ => OcoAction::None,
        }
    }

    pub fn suppress(&mut self) {
        self.suppressed = true;
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppressed
    }

    pub fn orders_cancelled(&self) -> bool {
        self.orders_cancelled
    }

    pub fn take_orders_cancelled(&mut self) -> bool {
        std::mem::take(&mut self.orders_cancelled)
    }

    pub fn reset(&mut self) {
        self.suppressed = false;
        self.orders_cancelled = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::order::{OrderRequest, OrderSide, OrderTag};

    fn order(role: OrderRole, state: OrderState) -> Order {
        let request = OrderRequest::market(OrderTag::new(role, 1), "NQ", OrderSide::Sell, 1);
        Order::from_request(&request, state)
    }

    #[test]
    fn test_cancel_cancels_working_sibling() {
        let mut oco = OcoSimulator::new(false);
        let target = order(OrderRole::ProfitTarget, OrderState::Cancelled);
        let stop = order(OrderRole::StopLoss, OrderState::Working);

        let action = oco.evaluate(OrderRole::ProfitTarget, &target, Some(&stop), true);
        assert_eq!(action, OcoAction::CancelSibling(OrderRole::StopLoss));
    }

    #[test]
    fn test_protection_lost_raised_once() {
        let mut oco = OcoSimulator::new(false);
        let target = order(OrderRole::ProfitTarget, OrderState::Cancelled);
        let stop = order(OrderRole::StopLoss, OrderState::Rejected);

        assert_eq!(
            oco.evaluate(OrderRole::StopLoss, &stop, Some(&target), true),
            OcoAction::ProtectionLost
        );
        assert_eq!(oco.evaluate(OrderRole::StopLoss, &stop, Some(&target), true), OcoAction::None);
        assert!(oco.take_orders_cancelled());
        assert!(!oco.orders_cancelled());

        // Flat position: nothing to protect
        let mut oco = OcoSimulator::new(false);
        assert_eq!(oco.evaluate(OrderRole::StopLoss, &stop, Some(&target), false), OcoAction::None);
    }

    #[test]
    fn test_fill_suppresses_reactions() {
        let mut oco = OcoSimulator::new(false);
        let stop = order(OrderRole::StopLoss, OrderState::Filled);
        let target = order(OrderRole::ProfitTarget, OrderState::Working);
        assert_eq!(oco.evaluate(OrderRole::StopLoss, &stop, Some(&target), false), OcoAction::None);
        assert!(oco.is_suppressed());

        let target = order(OrderRole::ProfitTarget, OrderState::Cancelled);
        assert_eq!(
            oco.evaluate(OrderRole::ProfitTarget, &target, Some(&stop), true),
            OcoAction::None
        );

        oco.reset();
        assert!(!oco.is_suppressed());
    }

    #[test]
    fn test_native_mode_leaves_sibling_to_broker() {
        let mut oco = OcoSimulator::new(true);
        let target = order(OrderRole::ProfitTarget, OrderState::Cancelled);
        let stop = order(OrderRole::StopLoss, OrderState::Working);
        assert_eq!(
            oco.evaluate(OrderRole::ProfitTarget, &target, Some(&stop), true),
            OcoAction::None
        );

        let stop = order(OrderRole::StopLoss, OrderState::Cancelled);
        assert_eq!(
            oco.evaluate(OrderRole::StopLoss, &stop, Some(&target), true),
            OcoAction::ProtectionLost
        );
    }
}

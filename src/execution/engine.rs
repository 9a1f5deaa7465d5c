//! Strategy engine - main interface for the strategy shell
//!
//! Wires the lifecycle manager, bracket controller, OCO simulator, session
//! flattener and trade accounting together behind three entry points:
//! [`StrategyEngine::on_new_bar`], [`StrategyEngine::on_order_update`] and
//! [`StrategyEngine::on_execution_update`]. Every handler runs to completion
//! and ends with the same evaluation step (fail-safes, then round-trip
//! completion), so no handler leaves an unprotected position behind.

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::accounting::TradeAccounting;
use super::bracket::{BracketChange, BracketController, BracketState, RebindOutcome};
use super::broker::{BrokerEvent, BrokerFeed, OrderSession, TradeLedger};
use super::config::{OcoMode, StrategyConfig};
use super::lifecycle::{
    EntryProgress, ExecutionOutcome, ExitProgress, LifecyclePhase, OrderLifecycle,
};
use super::oco::{OcoAction, OcoSimulator};
use super::order::{Execution, Order, OrderRole, OrderSide, OrderState};
use super::position::Position;
use super::session::{SessionFlattener, SessionPhase, SessionSignal};
use crate::signal::{resolve, EntryDecision, SignalSource};
use crate::types::{BarEvent, Series};

/// Upper bound on feed drain rounds per pump
const MAX_PUMP_ROUNDS: usize = 64;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("reset refused: {0} order(s) still working")]
    ResetBlocked(usize),
}

/// Events emitted by the strategy engine
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Entry order submitted
    EntrySubmitted {
        round_trip: u64,
        side: OrderSide,
        quantity: i32,
    },
    /// Entry refused by a gate
    EntryBlocked {
        reason: String,
    },
    /// Entry ended without a fill
    EntryAbandoned {
        round_trip: u64,
    },
    /// First reconciled entry fill
    PositionOpened {
        round_trip: u64,
        side: OrderSide,
        quantity: i32,
        avg_price: f64,
    },
    /// Protective orders submitted
    BracketPlaced {
        round_trip: u64,
        stop_price: f64,
        target_price: f64,
        quantity: i32,
    },
    StopMoved {
        from: f64,
        to: f64,
    },
    TargetMoved {
        from: f64,
        to: f64,
    },
    /// OCO simulator cancelled a protective order
    SiblingCancelled {
        role: OrderRole,
    },
    /// Both protective orders gone with the position open
    ProtectionLost {
        round_trip: u64,
    },
    FlattenSubmitted {
        role: OrderRole,
        side: OrderSide,
        quantity: i32,
        reason: String,
    },
    PositionClosed {
        round_trip: u64,
    },
    /// All references cleared, back to idle
    RoundTripComplete {
        round_trip: u64,
    },
    SessionExitWait,
    SessionOpened,
}

/// Comparable view of one order, without broker identity or timestamps
#[derive(Debug, Clone, PartialEq)]
pub struct OrderView {
    pub name: String,
    pub state: OrderState,
    pub quantity: i32,
    pub filled_quantity: i32,
    pub limit_price: Option<f64>,
    pub stop_price: Option<f64>,
}

impl From<&Order> for OrderView {
    fn from(order: &Order) -> Self {
        Self {
            name: order.name.clone(),
            state: order.state,
            quantity: order.quantity,
            filled_quantity: order.filled_quantity,
            limit_price: order.limit_price,
            stop_price: order.stop_price,
        }
    }
}

/// Derived engine state, used to compare runs
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSnapshot {
    pub phase: LifecyclePhase,
    pub round_trip: u64,
    pub position: Position,
    pub entry: Option<OrderView>,
    pub stop: Option<OrderView>,
    pub target: Option<OrderView>,
    pub exit: Option<OrderView>,
    pub draining: Vec<OrderView>,
    pub bracket: Option<BracketState>,
    pub oco_suppressed: bool,
    pub orders_cancelled: bool,
    pub flatten_pending: bool,
    pub session_phase: SessionPhase,
    pub streak: i32,
}

/// Per-instrument strategy engine
pub struct StrategyEngine<B> {
    config: StrategyConfig,
    broker: B,
    lifecycle: OrderLifecycle,
    bracket: BracketController,
    oco: OcoSimulator,
    session: SessionFlattener,
    accounting: TradeAccounting,
    event_tx: broadcast::Sender<EngineEvent>,
}

impl<B: OrderSession + TradeLedger> StrategyEngine<B> {
    /// Create a new engine around a broker session
    pub fn new(config: StrategyConfig, broker: B) -> Self {
        let native = match config.oco_mode {
            OcoMode::Native if broker.supports_linked_orders() => true,
            OcoMode::Native => {
                warn!("Native OCO requested but the session has no linked orders, simulating");
                false
            }
            OcoMode::Simulated => false,
        };

        let (event_tx, _) = broadcast::channel(1000);

        info!(
            "Strategy engine ready: {} x{} | Stop {:.2} | Target {:.2} | Trailing {} | \
             Chasing {} | OCO {}",
            config.symbol,
            config.quantity,
            config.stop_distance,
            config.target_distance,
            config.use_trailing_stop,
            config.use_profit_chasing,
            if native { "native" } else { "simulated" }
        );

        Self {
            lifecycle: OrderLifecycle::new(),
            bracket: BracketController::new(
                config.stop_distance,
                config.target_distance,
                config.use_trailing_stop,
                config.use_profit_chasing,
            ),
            oco: OcoSimulator::new(native),
            session: SessionFlattener::new(config.exit_lead()),
            accounting: TradeAccounting::new(
                config.max_consecutive_losses,
                config.daily_profit_target,
            ),
            config,
            broker,
            event_tx,
        }
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_tx.subscribe()
    }

    pub fn event_sender(&self) -> broadcast::Sender<EngineEvent> {
        self.event_tx.clone()
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.event_tx.send(event);
    }

    pub fn config(&self) -> &StrategyConfig {
        &self.config
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    pub fn broker_mut(&mut self) -> &mut B {
        &mut self.broker
    }

    pub fn into_broker(self) -> B {
        self.broker
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.lifecycle.phase()
    }

    pub fn position(&self) -> Position {
        self.lifecycle.position()
    }

    pub fn bracket(&self) -> &BracketController {
        &self.bracket
    }

    pub fn lifecycle(&self) -> &OrderLifecycle {
        &self.lifecycle
    }

    pub fn accounting(&self) -> &TradeAccounting {
        &self.accounting
    }

    pub fn session_phase(&self) -> SessionPhase {
        self.session.phase()
    }

    pub fn is_oco_suppressed(&self) -> bool {
        self.oco.is_suppressed()
    }

    // ------------------------------------------------------------------
    // Market data
    // ------------------------------------------------------------------

    /// Handle one bar of either series
    pub fn on_new_bar(&mut self, bar: &BarEvent, signals: &mut dyn SignalSource) {
        match bar.series {
            Series::Primary => {
                if bar.is_first_bar_of_session {
                    self.begin_session();
                }
                self.accounting.refresh(self.broker.completed_trades());
                self.evaluate_step(bar);

                let decision = resolve(signals.decide(bar));
                let quantity = self.config.quantity;
                match decision {
                    EntryDecision::Long => {
                        self.request_entry(OrderSide::Buy, quantity);
                    }
                    EntryDecision::Short => {
                        self.request_entry(OrderSide::Sell, quantity);
                    }
                    EntryDecision::Flat => {}
                }
            }
            Series::Secondary => {
                self.evaluate_step(bar);
                if self.lifecycle.phase() == LifecyclePhase::PositionOpen {
                    for change in self.bracket.on_price(&mut self.broker, bar.price) {
                        self.emit(match change {
                            BracketChange::StopMoved { from, to } => {
                                EngineEvent::StopMoved { from, to }
                            }
                            BracketChange::TargetMoved { from, to } => {
                                EngineEvent::TargetMoved { from, to }
                            }
                        });
                    }
                }
            }
        }
    }

    fn begin_session(&mut self) {
        self.session.begin_session();
        if let Err(e) = self.reset(false) {
            warn!("New session with a round trip still live: {}", e);
        }
        self.accounting.start_session(self.broker.completed_trades());
        info!("Session opened");
        self.emit(EngineEvent::SessionOpened);
    }

    /// Session window, historical cutoff and fail-safes
    fn evaluate_step(&mut self, bar: &BarEvent) {
        match self.session.check_window(bar) {
            SessionSignal::WindowEntered => {
                self.emit(EngineEvent::SessionExitWait);
                self.force_exit("session close");
            }
            SessionSignal::HistoricalCutoff => self.force_exit("end of historical data"),
            SessionSignal::None => {}
        }
        self.retry_flatten();
        self.check_fail_safes();
        self.try_complete();
    }

    fn force_exit(&mut self, reason: &str) {
        match self.lifecycle.phase() {
            LifecyclePhase::Idle => {}
            LifecyclePhase::EntryPending if self.lifecycle.position().is_flat() => {
                self.lifecycle.cancel_entry(&mut self.broker);
            }
            _ => {
                self.flatten(OrderRole::SessionExit, reason);
            }
        }
    }

    // ------------------------------------------------------------------
    // Entries and exits
    // ------------------------------------------------------------------

    /// Submit an entry if every gate allows it. No-op (logged) otherwise.
    pub fn request_entry(&mut self, side: OrderSide, quantity: i32) -> bool {
        if self.lifecycle.phase() != LifecyclePhase::Idle {
            debug!("Entry signal ignored: {:?}", self.lifecycle.phase());
            return false;
        }

        let blocked = if self.session.blocks_entries() {
            Some("session exit wait".to_string())
        } else if !self.accounting.no_consecutive_losses() {
            Some(format!("{} consecutive losses", self.config.max_consecutive_losses))
        } else if self.accounting.daily_profit_goal_reached() {
            Some(format!("daily profit goal reached (streak {:+})", self.accounting.streak()))
        } else {
            None
        };
        if let Some(reason) = blocked {
            info!("Entry blocked: {}", reason);
            self.emit(EngineEvent::EntryBlocked { reason });
            return false;
        }

        if !self.lifecycle.request_entry(&mut self.broker, &self.config.symbol, side, quantity) {
            return false;
        }
        self.emit(EngineEvent::EntrySubmitted {
            round_trip: self.lifecycle.round_trip(),
            side,
            quantity,
        });
        true
    }

    /// Cancel protection and any entry remainder, then send a market exit
    fn flatten(&mut self, role: OrderRole, reason: &str) -> bool {
        self.oco.suppress();
        self.bracket.cancel_active(&mut self.broker);
        self.lifecycle.cancel_entry(&mut self.broker);

        match self.lifecycle.submit_flatten(&mut self.broker, &self.config.symbol, role) {
            Some((side, quantity)) => {
                info!("FLATTEN submitted ({}): {} {} @ MKT - {}", role, side, quantity, reason);
                self.emit(EngineEvent::FlattenSubmitted {
                    role,
                    side,
                    quantity,
                    reason: reason.to_string(),
                });
                true
            }
            None => false,
        }
    }

    /// Pending flatten retries run on bars only, never from broker callbacks
    fn retry_flatten(&mut self) {
        if let Some(role) = self.lifecycle.take_flatten_retry() {
            if !self.lifecycle.position().is_flat() && !self.lifecycle.exit_in_flight() {
                self.flatten(role, "retry");
            }
        }
    }

    fn check_fail_safes(&mut self) {
        if self.oco.take_orders_cancelled() {
            if self.lifecycle.position().is_flat() {
                debug!("Protection-lost condition cleared: already flat");
            } else {
                self.flatten(OrderRole::ManualExit, "protective orders lost");
            }
        }

        // Covers protection lost while OCO reactions were suppressed
        if self.lifecycle.phase() == LifecyclePhase::PositionOpen
            && self.bracket.has_orders()
            && !self.bracket.has_active_orders()
            && !self.lifecycle.position().is_flat()
            && !self.lifecycle.exit_in_flight()
            && !self.lifecycle.flatten_pending()
        {
            warn!("Position open with no working protective order");
            self.flatten(OrderRole::ManualExit, "position unprotected");
        }
    }

    // ------------------------------------------------------------------
    // Broker callbacks
    // ------------------------------------------------------------------

    pub fn on_broker_event(&mut self, event: &BrokerEvent) {
        match event {
            BrokerEvent::OrderUpdate(order) => self.on_order_update(order),
            BrokerEvent::Execution(execution) => self.on_execution_update(execution),
        }
    }

    /// Apply one broker order state transition
    pub fn on_order_update(&mut self, order: &Order) {
        let Some(tag) = order.tag() else {
            warn!("Order update for unrecognised name '{}' ignored", order.name);
            return;
        };
        if tag.round_trip != self.lifecycle.round_trip() {
            debug!("Stale update {} ({}) ignored", order.name, order.state);
            return;
        }

        match tag.role {
            OrderRole::Entry => match self.lifecycle.apply_entry_update(order) {
                EntryProgress::Abandoned => self.abandon_entry(),
                EntryProgress::Reconciled { quantity, avg_price, first } => {
                    self.on_entry_fill(quantity, avg_price, first)
                }
                EntryProgress::Updated => {}
                EntryProgress::Unchanged => {
                    debug!("Duplicate update {} ({})", order.name, order.state)
                }
                EntryProgress::Untracked => self.drain_or_ignore(order),
            },
            OrderRole::StopLoss | OrderRole::ProfitTarget => match self.bracket.rebind(order) {
                RebindOutcome::Applied(role) => {
                    debug!("{} -> {}", order.name, order.state);
                    self.apply_oco(role);
                }
                RebindOutcome::Unchanged => {
                    debug!("Duplicate update {} ({})", order.name, order.state)
                }
                RebindOutcome::Untracked => self.drain_or_ignore(order),
            },
            OrderRole::SessionExit | OrderRole::ManualExit => {
                match self.lifecycle.apply_exit_update(order) {
                    ExitProgress::Updated | ExitProgress::Failed(_) => {}
                    ExitProgress::Unchanged => {
                        debug!("Duplicate update {} ({})", order.name, order.state)
                    }
                    ExitProgress::Untracked => self.drain_or_ignore(order),
                }
            }
        }

        self.check_fail_safes();
        self.try_complete();
    }

    /// Apply one execution report
    pub fn on_execution_update(&mut self, execution: &Execution) {
        let Some(tag) = execution.tag() else {
            warn!("Execution for unrecognised order '{}' ignored", execution.order_name);
            return;
        };
        if tag.round_trip != self.lifecycle.round_trip() {
            debug!(
                "Stale execution {} on {} ignored",
                execution.execution_id, execution.order_name
            );
            return;
        }

        match self.lifecycle.apply_execution(execution) {
            ExecutionOutcome::Duplicate => {
                debug!("Duplicate execution {} ignored", execution.execution_id);
                return;
            }
            ExecutionOutcome::Ignored => {
                debug!("Execution {} outside a live round trip ignored", execution.execution_id);
                return;
            }
            ExecutionOutcome::EntryPending => {}
            ExecutionOutcome::EntryReconciled { quantity, avg_price, first } => {
                self.on_entry_fill(quantity, avg_price, first)
            }
            ExecutionOutcome::ExitApplied(role) => self.after_exit_fill(role),
        }

        self.check_fail_safes();
        self.try_complete();
    }

    fn drain_or_ignore(&mut self, order: &Order) {
        if !self.lifecycle.apply_drain_update(order) {
            debug!("Update for untracked order {} ({}) ignored", order.name, order.state);
        }
    }

    fn abandon_entry(&mut self) {
        let round_trip = self.lifecycle.round_trip();
        match self.reset(false) {
            Ok(()) => self.emit(EngineEvent::EntryAbandoned { round_trip }),
            Err(e) => warn!("Abandoned entry could not reset: {}", e),
        }
    }

    fn on_entry_fill(&mut self, quantity: i32, avg_price: f64, first: bool) {
        let round_trip = self.lifecycle.round_trip();
        let Some(side) = self.lifecycle.entry_side() else {
            return;
        };
        let open_quantity = self.lifecycle.position().abs_quantity();

        if self.lifecycle.is_closed() {
            warn!("ENTRY filled after position closed ({} @ {:.2})", quantity, avg_price);
            self.flatten(OrderRole::ManualExit, "entry filled after close");
            return;
        }
        if self.lifecycle.exit_in_flight() {
            debug!("Entry fill while exit working, residual handled after the exit");
            return;
        }

        if !first {
            info!("ENTRY fill reconciled: {} filled @ {:.2} avg", quantity, avg_price);
            self.bracket.resize(&mut self.broker, open_quantity);
            return;
        }

        info!("ENTRY filled: {} {} @ {:.2} (round trip {})", side, quantity, avg_price, round_trip);
        self.emit(EngineEvent::PositionOpened { round_trip, side, quantity, avg_price });

        if self.session.blocks_entries() {
            self.flatten(OrderRole::SessionExit, "entry filled inside session exit window");
            return;
        }

        let oco_group = self.oco.is_native().then(|| format!("bracket-{}", round_trip));
        let rejected = self.bracket.open(
            &mut self.broker,
            &self.config.symbol,
            round_trip,
            side,
            avg_price,
            open_quantity,
            oco_group,
        );
        if let Some((stop_price, target_price)) = self.bracket.prices() {
            self.emit(EngineEvent::BracketPlaced {
                round_trip,
                stop_price,
                target_price,
                quantity: open_quantity,
            });
        }
        for role in rejected {
            self.apply_oco(role);
        }
    }

    fn after_exit_fill(&mut self, role: OrderRole) {
        let position = self.lifecycle.position();
        let Some(entry_side) = self.lifecycle.entry_side() else {
            return;
        };
        if position.is_flat() {
            return;
        }

        if position.quantity.signum() != entry_side.signed(1) {
            error!("Position reversed to {} after {} fill", position.quantity, role);
            self.oco.suppress();
            self.bracket.cancel_active(&mut self.broker);
            self.lifecycle.schedule_flatten(OrderRole::ManualExit);
            return;
        }

        if role.is_protective() {
            info!("Partial {} fill, {} still open", role, position.abs_quantity());
            self.bracket.resize(&mut self.broker, position.abs_quantity());
        } else if !self.lifecycle.exit_in_flight() {
            warn!("{} finished with {} still open", role, position.quantity);
            self.lifecycle.schedule_flatten(role);
        }
    }

    fn apply_oco(&mut self, role: OrderRole) {
        let Some(order) = self.bracket.order(role).cloned() else {
            return;
        };
        let sibling = role.sibling().and_then(|r| self.bracket.order(r));
        let position_open = !self.lifecycle.position().is_flat();

        match self.oco.evaluate(role, &order, sibling, position_open) {
            OcoAction::CancelSibling(sibling_role) => {
                if self.bracket.request_cancel(&mut self.broker, sibling_role) {
                    info!("OCO: {} {}, cancelling {}", role, order.state, sibling_role);
                    self.emit(EngineEvent::SiblingCancelled { role: sibling_role });
                }
            }
            OcoAction::ProtectionLost => {
                self.emit(EngineEvent::ProtectionLost { round_trip: self.lifecycle.round_trip() });
            }
            OcoAction::None => {}
        }
    }

    /// Close out a flat round trip and reset once every order is terminal
    fn try_complete(&mut self) {
        if self.lifecycle.phase() == LifecyclePhase::Idle || !self.lifecycle.has_fills() {
            return;
        }
        if !self.lifecycle.position().is_flat() {
            return;
        }

        let round_trip = self.lifecycle.round_trip();
        if !self.lifecycle.is_closed() {
            self.oco.suppress();
            self.bracket.cancel_active(&mut self.broker);
            self.lifecycle.cancel_entry(&mut self.broker);
            let released = self.bracket.clear();
            self.lifecycle.close(released);
            info!("Position closed (round trip {})", round_trip);
            self.emit(EngineEvent::PositionClosed { round_trip });
        }

        if self.reset(false).is_ok() {
            info!("Round trip {} complete", round_trip);
            self.emit(EngineEvent::RoundTripComplete { round_trip });
        }
    }

    // ------------------------------------------------------------------
    // Reset
    // ------------------------------------------------------------------

    fn outstanding(&self) -> usize {
        self.lifecycle.outstanding() + self.bracket.active_count()
    }

    /// Clear entry, stop, target and exit references together.
    ///
    /// Refused while any tracked order can still change, unless `force`.
    pub fn reset(&mut self, force: bool) -> Result<(), EngineError> {
        let outstanding = self.outstanding();
        if outstanding > 0 {
            if !force {
                return Err(EngineError::ResetBlocked(outstanding));
            }
            warn!("Forced reset with {} order(s) still working", outstanding);
        }
        self.bracket.clear();
        self.lifecycle.clear();
        self.oco.reset();
        debug!("Order references reset");
        Ok(())
    }

    /// Historical data done, live bars follow: forced cleanup
    pub fn on_realtime_transition(&mut self) {
        info!("Realtime transition: resetting order state");
        self.session.enter_realtime();
        if let Err(e) = self.reset(true) {
            warn!("Forced reset failed: {}", e);
        }
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            phase: self.lifecycle.phase(),
            round_trip: self.lifecycle.round_trip(),
            position: self.lifecycle.position(),
            entry: self.lifecycle.entry().map(OrderView::from),
            stop: self.bracket.order(OrderRole::StopLoss).map(OrderView::from),
            target: self.bracket.order(OrderRole::ProfitTarget).map(OrderView::from),
            exit: self.lifecycle.exit().map(OrderView::from),
            draining: self.lifecycle.draining().iter().map(OrderView::from).collect(),
            bracket: self.bracket.state().cloned(),
            oco_suppressed: self.oco.is_suppressed(),
            orders_cancelled: self.oco.orders_cancelled(),
            flatten_pending: self.lifecycle.flatten_pending(),
            session_phase: self.session.phase(),
            streak: self.accounting.streak(),
        }
    }

    /// Protective orders are held only for a live position, and a live
    /// position is always protected or being closed.
    pub fn protection_consistent(&self) -> bool {
        let position = self.lifecycle.position();
        let held_for_position =
            !self.bracket.has_orders() || (self.lifecycle.has_fills() && !position.is_flat());
        let covered = position.is_flat()
            || self.bracket.has_active_orders()
            || self.lifecycle.exit_in_flight()
            || self.lifecycle.flatten_pending()
            || self.lifecycle.phase() == LifecyclePhase::EntryPending;
        held_for_position && covered
    }
}

impl<B: OrderSession + TradeLedger + BrokerFeed> StrategyEngine<B> {
    /// Deliver queued broker callbacks until the feed is quiet
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        for _ in 0..MAX_PUMP_ROUNDS {
            let events = self.broker.poll_events();
            if events.is_empty() {
                return handled;
            }
            handled += events.len();
            for event in &events {
                self.on_broker_event(event);
            }
        }
        warn!("Broker feed still busy after {} rounds", MAX_PUMP_ROUNDS);
        handled
    }
}

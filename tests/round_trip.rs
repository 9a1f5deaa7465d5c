//! End-to-end round trips through the engine and the paper broker.

use chrono::{DateTime, Duration, TimeZone, Utc};
use chrono_tz::America::New_York;

use bracket_trader::execution::{
    BrokerEvent, BrokerFeed, EngineEvent, LifecyclePhase, OcoMode, OrderRole, OrderSide,
    OrderState, PaperBroker, SessionPhase, StrategyConfig, StrategyEngine, TradeLedger,
};
use bracket_trader::signal::{EntryDecision, ScriptedSignals};
use bracket_trader::types::BarEvent;

type Engine = StrategyEngine<PaperBroker>;

fn engine_with(config: StrategyConfig, broker: PaperBroker) -> Engine {
    StrategyEngine::new(config, broker)
}

fn engine(config: StrategyConfig) -> Engine {
    let broker = PaperBroker::new(&config.symbol);
    engine_with(config, broker)
}

fn session_open() -> DateTime<Utc> {
    New_York.with_ymd_and_hms(2025, 3, 12, 9, 30, 0).unwrap().with_timezone(&Utc)
}

fn session_close() -> DateTime<Utc> {
    New_York.with_ymd_and_hms(2025, 3, 12, 16, 0, 0).unwrap().with_timezone(&Utc)
}

fn primary(price: f64) -> BarEvent {
    BarEvent::primary(session_open() + Duration::minutes(5), price)
        .with_session_end(session_close())
}

fn secondary(price: f64) -> BarEvent {
    BarEvent::secondary(session_open() + Duration::minutes(6), price)
        .with_session_end(session_close())
}

/// Tick-level bar `minutes` before the close
fn closing_tick(minutes: i64, price: f64) -> BarEvent {
    BarEvent::secondary(session_close() - Duration::minutes(minutes), price)
        .with_session_end(session_close())
}

/// Primary bar carrying an entry decision, price seen by the broker first
fn enter(engine: &mut Engine, decision: EntryDecision, price: f64) {
    engine.broker_mut().on_price(price, Utc::now());
    engine.pump();
    let mut signals: ScriptedSignals = [decision].into_iter().collect();
    engine.on_new_bar(&primary(price), &mut signals);
    engine.pump();
}

/// Tick-level sample seen by both broker and engine
fn tick(engine: &mut Engine, price: f64) {
    engine.broker_mut().on_price(price, Utc::now());
    engine.pump();
    engine.on_new_bar(&secondary(price), &mut ScriptedSignals::new());
    engine.pump();
}

/// Tick-level sample the broker never sees, so nothing fills
fn engine_tick(engine: &mut Engine, price: f64) {
    engine.on_new_bar(&secondary(price), &mut ScriptedSignals::new());
    engine.pump();
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[test]
fn long_entry_brackets_at_fixed_distances() {
    let mut engine = engine(StrategyConfig::default());
    enter(&mut engine, EntryDecision::Long, 100.0);

    assert_eq!(engine.bracket().prices(), Some((94.0, 124.0)));
    let stop = engine.broker().order_named("stop-loss#1").unwrap();
    assert_eq!((stop.side, stop.stop_price, stop.quantity), (OrderSide::Sell, Some(94.0), 1));
    let target = engine.broker().order_named("profit-target#1").unwrap();
    assert_eq!(
        (target.side, target.limit_price, target.quantity),
        (OrderSide::Sell, Some(124.0), 1)
    );
}

#[test]
fn chased_target_moves_only_after_full_retrace() {
    let config = StrategyConfig { use_profit_chasing: true, ..Default::default() };
    let mut engine = engine(config);
    let mut rx = engine.subscribe();
    enter(&mut engine, EntryDecision::Long, 100.0);

    for price in [110.0, 120.0, 130.0, 125.0, 112.0, 106.25] {
        engine_tick(&mut engine, price);
        assert_eq!(engine.bracket().prices(), Some((94.0, 124.0)), "moved at {}", price);
    }

    engine_tick(&mut engine, 106.0);
    assert_eq!(engine.bracket().prices(), Some((94.0, 106.0)));
    assert_eq!(engine.broker().order_named("profit-target#1").unwrap().limit_price, Some(106.0));
    assert!(drain(&mut rx).contains(&EngineEvent::TargetMoved { from: 124.0, to: 106.0 }));
}

#[test]
fn manual_target_cancel_cancels_stop_in_same_pass() {
    let mut engine = engine(StrategyConfig::default());
    let mut rx = engine.subscribe();
    enter(&mut engine, EntryDecision::Long, 100.0);
    assert!(!engine.is_oco_suppressed());

    assert!(engine.broker_mut().cancel_externally("profit-target#1"));
    let events = engine.broker_mut().poll_events();
    assert_eq!(events.len(), 1);
    engine.on_broker_event(&events[0]);

    // Handling the target's cancellation alone sent the stop cancel
    assert_eq!(engine.broker().cancellations(), 1);
    assert_eq!(engine.broker().order_named("stop-loss#1").unwrap().state, OrderState::Cancelled);
    assert!(drain(&mut rx).contains(&EngineEvent::SiblingCancelled { role: OrderRole::StopLoss }));

    // With both gone the position is flattened
    engine.pump();
    assert_eq!(engine.broker().net_position(), 0);
    assert!(engine.broker().order_named("manual-exit#1").is_some());
    assert_eq!(engine.phase(), LifecyclePhase::Idle);
}

#[test]
fn losing_both_protective_orders_flattens_exactly_once() {
    let mut engine = engine(StrategyConfig::default());
    let mut rx = engine.subscribe();
    enter(&mut engine, EntryDecision::Long, 100.0);

    engine.broker_mut().cancel_externally("profit-target#1");
    engine.broker_mut().cancel_externally("stop-loss#1");
    engine.pump();
    engine_tick(&mut engine, 100.0);
    engine_tick(&mut engine, 99.0);

    let flattens = drain(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, EngineEvent::FlattenSubmitted { .. }))
        .count();
    assert_eq!(flattens, 1);
    // entry, stop, target, flatten
    assert_eq!(engine.broker().submissions(), 4);
    assert_eq!(engine.broker().net_position(), 0);
    assert_eq!(engine.phase(), LifecyclePhase::Idle);
}

#[test]
fn session_window_forces_exit_without_duplicate_cancels() {
    let mut engine = engine(StrategyConfig::default());
    let mut rx = engine.subscribe();
    enter(&mut engine, EntryDecision::Long, 100.0);
    drain(&mut rx);

    // 4 minutes before the close, inside the 5 minute lead
    let bar = closing_tick(4, 101.0);
    engine.on_new_bar(&bar, &mut ScriptedSignals::new());

    assert_eq!(engine.session_phase(), SessionPhase::ExitWait);
    assert!(engine.is_oco_suppressed());
    let exit = engine.broker().order_named("session-exit#1").unwrap();
    assert_eq!((exit.side, exit.quantity), (OrderSide::Sell, 1));

    engine.pump();
    assert_eq!(engine.broker().cancellations(), 2);
    assert_eq!(engine.broker().net_position(), 0);
    assert_eq!(engine.phase(), LifecyclePhase::Idle);

    let events = drain(&mut rx);
    assert!(events.contains(&EngineEvent::SessionExitWait));
    assert!(!events.iter().any(|e| matches!(e, EngineEvent::SiblingCancelled { .. })));

    // No new entries until the next session
    let mut signals: ScriptedSignals = [EntryDecision::Long].into_iter().collect();
    let late = BarEvent::primary(session_close() - Duration::minutes(3), 101.0)
        .with_session_end(session_close());
    engine.on_new_bar(&late, &mut signals);
    assert_eq!(engine.phase(), LifecyclePhase::Idle);
    assert_eq!(engine.lifecycle().round_trip(), 1);
}

#[test]
fn unfilled_entry_cancelled_at_session_window() {
    let mut engine = engine(StrategyConfig::default());
    // No price yet: the market entry rests unfilled
    let mut signals: ScriptedSignals = [EntryDecision::Short].into_iter().collect();
    engine.on_new_bar(&primary(100.0), &mut signals);
    engine.pump();
    assert_eq!(engine.phase(), LifecyclePhase::EntryPending);

    let bar = closing_tick(1, 100.0);
    engine.on_new_bar(&bar, &mut ScriptedSignals::new());
    engine.pump();

    assert_eq!(engine.broker().cancellations(), 1);
    assert_eq!(engine.phase(), LifecyclePhase::Idle);
    assert_eq!(engine.broker().submissions(), 1);
}

#[test]
fn three_losses_block_entries_until_next_session() {
    let mut engine = engine(StrategyConfig::default());

    for _ in 0..3 {
        enter(&mut engine, EntryDecision::Long, 100.0);
        assert_eq!(engine.phase(), LifecyclePhase::PositionOpen);
        tick(&mut engine, 93.0);
        assert_eq!(engine.phase(), LifecyclePhase::Idle);
    }
    assert_eq!(engine.broker().completed_trades().len(), 3);

    let mut rx = engine.subscribe();
    enter(&mut engine, EntryDecision::Long, 100.0);
    assert!(!engine.accounting().no_consecutive_losses());
    assert_eq!(engine.accounting().streak(), -3);
    assert_eq!(engine.phase(), LifecyclePhase::Idle);
    assert!(matches!(drain(&mut rx).as_slice(), [EngineEvent::EntryBlocked { .. }]));

    // A new session clears the streak
    engine.broker_mut().on_price(100.0, Utc::now());
    let mut signals: ScriptedSignals = [EntryDecision::Long].into_iter().collect();
    engine.on_new_bar(&primary(100.0).first_of_session(), &mut signals);
    engine.pump();
    assert!(engine.accounting().no_consecutive_losses());
    assert_eq!(engine.phase(), LifecyclePhase::PositionOpen);
}

#[test]
fn scalper_profit_goal_ends_the_day() {
    let config = StrategyConfig::scalper();
    assert!(config.daily_profit_target > config.max_consecutive_losses);
    let mut engine = engine(config);

    for _ in 0..3 {
        enter(&mut engine, EntryDecision::Long, 100.0);
        assert_eq!(engine.bracket().prices(), Some((96.0, 112.0)));
        tick(&mut engine, 112.0);
        assert_eq!(engine.phase(), LifecyclePhase::Idle);
    }
    assert_eq!(engine.broker().completed_trades().len(), 3);

    let mut rx = engine.subscribe();
    enter(&mut engine, EntryDecision::Long, 100.0);
    assert_eq!(engine.accounting().streak(), 3);
    assert!(engine.accounting().daily_profit_goal_reached());
    assert_eq!(engine.phase(), LifecyclePhase::Idle);
    assert!(matches!(drain(&mut rx).as_slice(), [EngineEvent::EntryBlocked { .. }]));
}

#[test]
fn stop_fill_round_trip_returns_to_idle() {
    let mut engine = engine(StrategyConfig::default());
    enter(&mut engine, EntryDecision::Short, 100.0);
    assert_eq!(engine.bracket().prices(), Some((106.0, 76.0)));

    tick(&mut engine, 107.0);

    assert_eq!(engine.phase(), LifecyclePhase::Idle);
    assert!(engine.lifecycle().entry().is_none());
    assert!(engine.lifecycle().exit().is_none());
    assert!(engine.lifecycle().draining().is_empty());
    assert!(!engine.bracket().has_orders());
    assert!(engine.reset(false).is_ok());

    let trade = &engine.broker().completed_trades()[0];
    assert_eq!(trade.pnl_points, -7.0);
    let target = engine.broker().order_named("profit-target#1").unwrap();
    assert_eq!(target.state, OrderState::Cancelled);
}

#[test]
fn partial_entry_fills_resize_bracket() {
    let config = StrategyConfig { quantity: 3, ..Default::default() };
    let broker = PaperBroker::new("NQ").with_fill_lot(1);
    let mut engine = engine_with(config, broker);

    enter(&mut engine, EntryDecision::Long, 100.0);
    assert_eq!(engine.position().quantity, 1);
    assert_eq!(engine.broker().order_named("stop-loss#1").unwrap().quantity, 1);

    tick(&mut engine, 101.0);
    tick(&mut engine, 102.0);

    assert_eq!(engine.position().quantity, 3);
    assert_eq!(engine.position().avg_price, Some(101.0));
    assert_eq!(engine.lifecycle().reconciled_quantity(), 3);
    assert_eq!(engine.broker().order_named("stop-loss#1").unwrap().quantity, 3);
    assert_eq!(engine.broker().order_named("profit-target#1").unwrap().quantity, 3);
    // Prices stay anchored on the first reconciled fill
    assert_eq!(engine.bracket().prices(), Some((94.0, 124.0)));
    assert!(engine.protection_consistent());
}

#[test]
fn late_stale_stop_update_does_not_shrink_stop() {
    let config = StrategyConfig { quantity: 3, use_trailing_stop: true, ..Default::default() };
    let broker = PaperBroker::new("NQ").with_fill_lot(1);
    let mut engine = engine_with(config, broker);
    enter(&mut engine, EntryDecision::Long, 100.0);

    // Second entry fill resizes the stop to 2; keep that callback
    engine.broker_mut().on_price(101.0, Utc::now());
    let mut stop_updates = Vec::new();
    loop {
        let events = engine.broker_mut().poll_events();
        if events.is_empty() {
            break;
        }
        for event in &events {
            if let BrokerEvent::OrderUpdate(order) = event {
                if order.name == "stop-loss#1" && order.quantity == 2 {
                    stop_updates.push(event.clone());
                }
            }
            engine.on_broker_event(event);
        }
    }
    engine.on_new_bar(&secondary(101.0), &mut ScriptedSignals::new());
    engine.pump();
    tick(&mut engine, 102.0);
    assert_eq!(engine.bracket().order(OrderRole::StopLoss).unwrap().quantity, 3);

    let stale = stop_updates.pop().expect("stop resized to 2");
    let before = engine.snapshot();
    engine.on_broker_event(&stale);
    assert_eq!(engine.snapshot(), before);
    assert_eq!(engine.bracket().order(OrderRole::StopLoss).unwrap().quantity, 3);

    // Trailing amend keeps covering the whole position
    tick(&mut engine, 115.0);
    assert_eq!(engine.bracket().prices(), Some((106.0, 124.0)));
    let stop = engine.broker().order_named("stop-loss#1").unwrap();
    assert_eq!((stop.quantity, stop.stop_price), (3, Some(106.0)));
    assert_eq!(engine.broker().net_position(), 3);
}

#[test]
fn rejected_flatten_is_retried_next_step() {
    let mut engine = engine(StrategyConfig::default());
    enter(&mut engine, EntryDecision::Long, 100.0);

    engine.broker_mut().reject_next_submission();
    engine.broker_mut().cancel_externally("profit-target#1");
    engine.pump();

    assert!(engine.lifecycle().flatten_pending());
    assert_eq!(engine.broker().net_position(), 1);
    assert!(engine.protection_consistent());

    engine_tick(&mut engine, 100.0);
    assert_eq!(engine.broker().net_position(), 0);
    assert!(engine.broker().order_named("manual-exit#1.1").is_some());
    assert_eq!(engine.phase(), LifecyclePhase::Idle);
}

#[test]
fn native_oco_lets_broker_cancel_sibling() {
    let config = StrategyConfig { oco_mode: OcoMode::Native, ..Default::default() };
    let broker = PaperBroker::new("NQ").with_native_oco();
    let mut engine = engine_with(config, broker);
    enter(&mut engine, EntryDecision::Long, 100.0);
    assert_eq!(
        engine.broker().order_named("stop-loss#1").unwrap().oco_group.as_deref(),
        Some("bracket-1")
    );

    tick(&mut engine, 125.0);

    assert_eq!(engine.phase(), LifecyclePhase::Idle);
    assert_eq!(engine.broker().cancellations(), 0);
    assert_eq!(engine.broker().order_named("stop-loss#1").unwrap().state, OrderState::Cancelled);
    assert_eq!(engine.broker().completed_trades()[0].pnl_points, 24.0);
}

#[test]
fn historical_cutoff_flattens_and_realtime_resets() {
    let mut engine = engine(StrategyConfig::default());
    enter(&mut engine, EntryDecision::Long, 100.0);

    let mut signals: ScriptedSignals = [EntryDecision::Short].into_iter().collect();
    engine.on_new_bar(&primary(101.0).with_historical_remaining(1), &mut signals);
    engine.pump();

    assert_eq!(engine.broker().net_position(), 0);
    assert!(engine.broker().order_named("session-exit#1").is_some());
    assert_eq!(engine.lifecycle().round_trip(), 1);

    engine.on_realtime_transition();
    enter(&mut engine, EntryDecision::Short, 101.0);
    assert_eq!(engine.phase(), LifecyclePhase::PositionOpen);
    assert_eq!(engine.lifecycle().round_trip(), 2);
}

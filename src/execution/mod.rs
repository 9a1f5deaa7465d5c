//! Order lifecycle and bracket management for strategy plugins
//!
//! The engine sits between a signal source and a broker session: it turns
//! entry decisions into orders, protects every fill with a stop-loss and a
//! profit target, and keeps that protection consistent through partial
//! fills, cancellations, rejections and session boundaries.

mod accounting;
mod actor;
mod bracket;
mod broker;
mod config;
mod engine;
mod lifecycle;
mod oco;
mod order;
mod paper;
mod position;
mod session;

pub use accounting::TradeAccounting;
pub use actor::{spawn_instrument, EngineInput, InstrumentHandle};
pub use bracket::{initial_prices, BracketChange, BracketController, BracketState, RebindOutcome};
pub use broker::{BrokerError, BrokerEvent, BrokerFeed, OrderSession, TradeLedger};
pub use config::{ConfigError, OcoMode, StrategyConfig};
pub use engine::{EngineError, EngineEvent, EngineSnapshot, OrderView, StrategyEngine};
pub use lifecycle::{EntryProgress, ExecutionOutcome, ExitProgress, LifecyclePhase, OrderLifecycle};
pub use oco::{OcoAction, OcoSimulator};
pub use order::{
    Execution, Order, OrderRequest, OrderRole, OrderSide, OrderState, OrderTag, OrderType,
};
pub use paper::PaperBroker;
pub use position::{MarketPosition, Position, PositionBook, TradeOutcome, TradeRecord};
pub use session::{SessionCalendar, SessionFlattener, SessionPhase, SessionSignal};

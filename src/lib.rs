// Library crate - exports the engine, signal interface and replay driver

pub mod types;
pub mod signal;
pub mod execution;
pub mod replay;

// Re-export commonly used types
pub use types::*;
pub use signal::{EntryDecision, SignalError, SignalSource};
pub use execution::{StrategyConfig, StrategyEngine};

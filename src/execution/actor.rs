//! Per-instrument engine task
//!
//! Each instrument's engine runs on its own tokio task and receives bars and
//! broker callbacks through one mpsc channel, so events are handled strictly
//! one at a time. Engines for different instruments share nothing.

use anyhow::{anyhow, Context, Result};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::broker::{BrokerEvent, BrokerFeed, OrderSession, TradeLedger};
use super::engine::{EngineEvent, StrategyEngine};
use crate::signal::SignalSource;
use crate::types::BarEvent;

/// Input to an instrument task
#[derive(Debug, Clone)]
pub enum EngineInput {
    Bar(BarEvent),
    Broker(BrokerEvent),
    RealtimeTransition,
    Shutdown,
}

/// Handle to a running instrument task
pub struct InstrumentHandle<B> {
    symbol: String,
    tx: mpsc::Sender<EngineInput>,
    events: broadcast::Sender<EngineEvent>,
    task: JoinHandle<StrategyEngine<B>>,
}

/// Spawn an engine on its own task
pub fn spawn_instrument<B, S>(engine: StrategyEngine<B>, signals: S) -> InstrumentHandle<B>
where
    B: OrderSession + TradeLedger + BrokerFeed + Send + 'static,
    S: SignalSource + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineInput>(1000);
    let symbol = engine.config().symbol.clone();
    let events = engine.event_sender();

    let task_symbol = symbol.clone();
    let task = tokio::spawn(async move {
        let mut engine = engine;
        let mut signals = signals;
        info!("[{}] instrument task started", task_symbol);

        while let Some(input) = rx.recv().await {
            match input {
                EngineInput::Bar(bar) => {
                    engine.pump();
                    engine.on_new_bar(&bar, &mut signals);
                }
                EngineInput::Broker(event) => engine.on_broker_event(&event),
                EngineInput::RealtimeTransition => engine.on_realtime_transition(),
                EngineInput::Shutdown => break,
            }
            // Callbacks raised by this input's submissions
            let handled = engine.pump();
            if handled > 0 {
                debug!("[{}] {} broker callbacks handled", task_symbol, handled);
            }
        }

        info!("[{}] instrument task stopped", task_symbol);
        engine
    });

    InstrumentHandle { symbol, tx, events, task }
}

impl<B> InstrumentHandle<B> {
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub async fn send(&self, input: EngineInput) -> Result<()> {
        self.tx
            .send(input)
            .await
            .map_err(|_| anyhow!("[{}] instrument task is gone", self.symbol))
    }

    /// Stop the task after queued input is handled and take the engine back
    pub async fn shutdown(self) -> Result<StrategyEngine<B>> {
        // A closed channel means the task already exited
        let _ = self.tx.send(EngineInput::Shutdown).await;
        self.task
            .await
            .with_context(|| format!("[{}] instrument task panicked", self.symbol))
    }
}

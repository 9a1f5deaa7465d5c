//! Replay driver
//!
//! Runs the strategy engine against a paper broker from a CSV of samples:
//!
//! ```text
//! timestamp,series,price,signal
//! 2025-03-03T14:30:00Z,primary,21450.25,long
//! 2025-03-03T14:30:01Z,secondary,21450.50,
//! ```
//!
//! Session boundaries come from the configured US/Eastern session hours.
//! With `historical` set the file is treated as the historical load that
//! precedes live trading: the engine is forced flat on the last-but-one
//! primary bar and reset at the realtime transition.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::TryRecvError;
use tracing::{debug, info, warn};

use crate::execution::{
    EngineEvent, OcoMode, PaperBroker, Position, StrategyConfig, StrategyEngine, TradeLedger,
    TradeOutcome, TradeRecord,
};
use crate::signal::{EntryDecision, ScriptedSignals};
use crate::types::{BarEvent, Series};

/// One CSV row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayRow {
    pub timestamp: DateTime<Utc>,
    pub series: String,
    pub price: f64,
    #[serde(default)]
    pub signal: Option<String>,
}

/// Load replay rows from a CSV file
pub fn load_rows(path: &Path) -> Result<Vec<ReplayRow>> {
    let file = File::open(path).with_context(|| format!("Failed to open replay file: {:?}", path))?;
    from_reader(file).with_context(|| format!("Failed to read replay file: {:?}", path))
}

pub fn from_reader<R: Read>(reader: R) -> Result<Vec<ReplayRow>> {
    let mut csv_reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let mut rows = Vec::new();
    for (line, result) in csv_reader.deserialize().enumerate() {
        let row: ReplayRow =
            result.with_context(|| format!("Failed to parse CSV row {}", line + 1))?;
        rows.push(row);
    }
    Ok(rows)
}

/// Write completed trades as CSV
pub fn write_trades(path: &Path, trades: &[TradeRecord]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create trade log: {:?}", path))?;
    for trade in trades {
        writer.serialize(trade).context("Failed to write trade")?;
    }
    writer.flush().context("Failed to flush trade log")?;
    Ok(())
}

/// Results of one replay run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplaySummary {
    pub rows_processed: usize,
    pub rows_skipped: usize,
    pub sessions: usize,
    pub total_trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub breakevens: usize,
    pub win_rate: f64,
    pub net_points: f64,
    pub net_dollars: f64,
    pub entries_blocked: usize,
    pub forced_exits: usize,
    /// Position left at the end of the file
    pub open_position: i32,
    #[serde(skip)]
    pub trades: Vec<TradeRecord>,
}

impl ReplaySummary {
    fn from_trades(trades: &[TradeRecord], config: &StrategyConfig) -> Self {
        let count =
            |outcome: TradeOutcome| trades.iter().filter(|t| t.outcome() == outcome).count();
        let wins = count(TradeOutcome::Win);
        let net_points: f64 = trades.iter().map(|t| t.pnl_points).sum();
        let win_rate = if trades.is_empty() {
            0.0
        } else {
            wins as f64 / trades.len() as f64 * 100.0
        };

        Self {
            rows_processed: 0,
            rows_skipped: 0,
            sessions: 0,
            total_trades: trades.len(),
            wins,
            losses: count(TradeOutcome::Loss),
            breakevens: count(TradeOutcome::Breakeven),
            win_rate,
            net_points,
            net_dollars: config.dollars(net_points),
            entries_blocked: 0,
            forced_exits: 0,
            open_position: 0,
            trades: trades.to_vec(),
        }
    }

    pub fn print(&self) {
        println!("\n═══════════════════════════════════════════════════════════");
        println!("                  REPLAY RESULTS                            ");
        println!("═══════════════════════════════════════════════════════════\n");

        println!(
            "Rows Processed:    {} ({} outside session)",
            self.rows_processed, self.rows_skipped
        );
        println!("Sessions:          {}", self.sessions);
        println!("Total Trades:      {}", self.total_trades);
        println!("Wins:              {} ({:.1}%)", self.wins, self.win_rate);
        println!("Losses:            {}", self.losses);
        println!("Breakevens:        {}", self.breakevens);
        println!();
        println!("Entries Blocked:   {}", self.entries_blocked);
        println!("Forced Exits:      {}", self.forced_exits);
        println!();
        println!("Net P&L:           {:+.2} pts (${:+.2})", self.net_points, self.net_dollars);
        if self.open_position != 0 {
            println!("Open Position:     {}", self.open_position);
        }

        println!("\n═══════════════════════════════════════════════════════════\n");
    }
}

/// Replay `rows` through a fresh engine and paper broker
pub fn run_replay(
    rows: &[ReplayRow],
    config: StrategyConfig,
    historical: bool,
) -> Result<ReplaySummary> {
    config.validate().context("Invalid strategy config")?;
    let calendar = config.session_calendar()?;

    let mut broker = PaperBroker::new(&config.symbol);
    if config.oco_mode == OcoMode::Native {
        broker = broker.with_native_oco();
    }
    let mut engine = StrategyEngine::new(config.clone(), broker);
    let mut events = engine.subscribe();
    let mut signals = ScriptedSignals::new();

    let in_session: Vec<&ReplayRow> = rows
        .iter()
        .filter(|r| calendar.is_trading_hours(r.timestamp))
        .collect();
    let rows_skipped = rows.len() - in_session.len();
    let mut primary_remaining = in_session
        .iter()
        .filter(|r| parse_series(r) == Some(Series::Primary))
        .count();

    info!(
        "Replaying {} rows ({} outside session, {} primary){}",
        in_session.len(),
        rows_skipped,
        primary_remaining,
        if historical { " as historical data" } else { "" }
    );

    let mut current_session: Option<NaiveDate> = None;
    let mut sessions = 0;
    let mut entries_blocked = 0;
    let mut forced_exits = 0;
    let mut rows_processed = 0;

    for row in in_session {
        let Some(series) = parse_series(row) else {
            warn!("Unknown series '{}' at {}, row skipped", row.series, row.timestamp);
            continue;
        };

        let mut bar = match series {
            Series::Primary => BarEvent::primary(row.timestamp, row.price),
            Series::Secondary => BarEvent::secondary(row.timestamp, row.price),
        }
        .with_session_end(calendar.session_end(row.timestamp));

        if series == Series::Primary {
            let date = calendar.session_date(row.timestamp);
            if current_session != Some(date) {
                current_session = Some(date);
                sessions += 1;
                bar = bar.first_of_session();
                debug!("Session {} begins at {}", date, row.timestamp);
            }
            primary_remaining = primary_remaining.saturating_sub(1);
            if historical {
                bar = bar.with_historical_remaining(primary_remaining);
            }
            signals.push(
                row.signal
                    .as_deref()
                    .unwrap_or_default()
                    .parse::<EntryDecision>(),
            );
        }

        // Broker sees the price first, as a live feed would deliver it
        engine.broker_mut().on_price(row.price, row.timestamp);
        engine.pump();
        engine.on_new_bar(&bar, &mut signals);
        engine.pump();
        rows_processed += 1;

        loop {
            match events.try_recv() {
                Ok(EngineEvent::EntryBlocked { .. }) => entries_blocked += 1,
                Ok(EngineEvent::FlattenSubmitted { .. }) => forced_exits += 1,
                Ok(_) => {}
                Err(TryRecvError::Lagged(n)) => warn!("Replay event counter lagged by {}", n),
                Err(_) => break,
            }
        }
    }

    if historical {
        engine.on_realtime_transition();
    }

    let open_position: Position = engine.position();
    let broker = engine.into_broker();
    let mut summary = ReplaySummary::from_trades(broker.completed_trades(), &config);
    summary.rows_processed = rows_processed;
    summary.rows_skipped = rows_skipped;
    summary.sessions = sessions;
    summary.entries_blocked = entries_blocked;
    summary.forced_exits = forced_exits;
    summary.open_position = broker.net_position();
    if open_position.quantity != summary.open_position && !historical {
        warn!(
            "Engine position {} disagrees with broker position {}",
            open_position.quantity, summary.open_position
        );
    }

    info!(
        "Replay complete: {} trades, {:+.2} pts",
        summary.total_trades, summary.net_points
    );
    Ok(summary)
}

fn parse_series(row: &ReplayRow) -> Option<Series> {
    row.series.parse().ok()
}

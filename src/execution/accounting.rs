//! Trade accounting - streak tracking that gates new entries

use tracing::{debug, info};

use super::position::{TradeOutcome, TradeRecord};

/// Signed win/loss streak over recently completed trades
#[derive(Debug, Clone, PartialEq)]
pub struct TradeAccounting {
    /// Loss count that blocks entries (0 disables)
    max_consecutive_losses: u32,
    /// Streak at which the day is done (0 disables)
    daily_profit_target: u32,
    /// Ledger length when the current session began
    session_baseline: usize,
    /// Ledger length at the last refresh
    last_seen_count: usize,
    /// Signed sum over the goal window
    streak: i32,
    /// Signed sum over the last `max_consecutive_losses` trades
    loss_streak: i32,
}

fn signed_sum(trades: &[TradeRecord]) -> i32 {
    trades
        .iter()
        .map(|t| match t.outcome() {
            TradeOutcome::Win => 1,
            TradeOutcome::Loss => -1,
            TradeOutcome::Breakeven => 0,
        })
        .sum()
}

/// The last `n` trades (all of them when `n` is 0)
fn last(trades: &[TradeRecord], n: usize) -> &[TradeRecord] {
    match n {
        0 => trades,
        n => &trades[trades.len() - n.min(trades.len())..],
    }
}

impl TradeAccounting {
    pub fn new(max_consecutive_losses: u32, daily_profit_target: u32) -> Self {
        Self {
            max_consecutive_losses,
            daily_profit_target,
            session_baseline: 0,
            last_seen_count: 0,
            streak: 0,
            loss_streak: 0,
        }
    }

    /// Trades counted by [`Self::streak`]: wide enough for the profit goal
    /// to be reachable, and never narrower than the loss window.
    fn window(&self) -> usize {
        match self.max_consecutive_losses {
            0 => 0,
            n => n.max(self.daily_profit_target) as usize,
        }
    }

    /// Re-baseline at the first bar of a session. Earlier trades no longer count.
    pub fn start_session(&mut self, trades: &[TradeRecord]) {
        self.session_baseline = trades.len();
        self.last_seen_count = trades.len();
        self.streak = 0;
        self.loss_streak = 0;
        debug!("Streak reset at session start ({} prior trades)", trades.len());
    }

    /// Recompute the streak if the ledger grew since the last call.
    /// Returns true when a recompute happened.
    pub fn refresh(&mut self, trades: &[TradeRecord]) -> bool {
        if trades.len() == self.last_seen_count {
            return false;
        }
        if trades.len() < self.session_baseline {
            // Ledger was replaced underneath us
            self.session_baseline = 0;
        }
        self.last_seen_count = trades.len();

        let session_trades = &trades[self.session_baseline..];
        self.streak = signed_sum(last(session_trades, self.window()));
        self.loss_streak = signed_sum(last(session_trades, self.max_consecutive_losses as usize));

        info!(
            "Trade accounting: {} session trades, streak {:+}",
            session_trades.len(),
            self.streak
        );
        true
    }

    pub fn streak(&self) -> i32 {
        self.streak
    }

    /// False only once the last N trades were all losses
    pub fn no_consecutive_losses(&self) -> bool {
        self.max_consecutive_losses == 0
            || self.loss_streak != -(self.max_consecutive_losses as i32)
    }

    pub fn daily_profit_goal_reached(&self) -> bool {
        self.daily_profit_target > 0 && self.streak >= self.daily_profit_target as i32
    }
}

//! Session clock and session-boundary flattening

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::America::New_York;
use tracing::{debug, info};

use crate::types::{BarEvent, Series};

/// Trading session hours in US/Eastern
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionCalendar {
    start: NaiveTime,
    end: NaiveTime,
}

impl SessionCalendar {
    /// Sessions with `start > end` run overnight (e.g. 18:00 - 17:00)
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    /// Regular trading hours, 9:30 - 16:00 ET
    pub fn rth() -> Self {
        Self::new(
            NaiveTime::from_hms_opt(9, 30, 0).unwrap_or_default(),
            NaiveTime::from_hms_opt(16, 0, 0).unwrap_or_default(),
        )
    }

    fn is_overnight(&self) -> bool {
        self.start > self.end
    }

    /// Check if within trading hours
    pub fn is_trading_hours(&self, time: DateTime<Utc>) -> bool {
        let t = time.with_timezone(&New_York).time();
        if self.is_overnight() {
            t >= self.start || t < self.end
        } else {
            t >= self.start && t < self.end
        }
    }

    /// Trading date (ET) of the session `time` belongs to: the date it ends on
    pub fn session_date(&self, time: DateTime<Utc>) -> NaiveDate {
        let local = time.with_timezone(&New_York);
        if local.time() < self.end {
            local.date_naive()
        } else {
            local.date_naive() + Duration::days(1)
        }
    }

    /// Close of the session `time` belongs to
    pub fn session_end(&self, time: DateTime<Utc>) -> DateTime<Utc> {
        let naive = self.session_date(time).and_time(self.end);
        New_York
            .from_local_datetime(&naive)
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
    }
}

impl Default for SessionCalendar {
    fn default() -> Self {
        Self::rth()
    }
}

/// Whether new entries are currently allowed by the session clock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Trading,
    /// Between the forced session-close exit and the next session's first bar
    ExitWait,
}

/// Outcome of checking a bar against the session window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSignal {
    None,
    /// `[session_end - exit_lead, session_end]` was just entered
    WindowEntered,
    /// Last-but-one bar of a historical load
    HistoricalCutoff,
}

/// Guarantees no position is carried across a session boundary
#[derive(Debug)]
pub struct SessionFlattener {
    exit_lead: Duration,
    phase: SessionPhase,
    /// Cutoff fired; entries stay blocked until the realtime transition
    historical_hold: bool,
}

impl SessionFlattener {
    pub fn new(exit_lead: Duration) -> Self {
        Self {
            exit_lead,
            phase: SessionPhase::Trading,
            historical_hold: false,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// First bar of a new session. Returns true if an exit wait was cleared.
    pub fn begin_session(&mut self) -> bool {
        let was_waiting = self.phase == SessionPhase::ExitWait;
        self.phase = SessionPhase::Trading;
        if was_waiting {
            info!("Session exit wait cleared");
        }
        was_waiting
    }

    pub fn check_window(&mut self, bar: &BarEvent) -> SessionSignal {
        if let Some(end) = bar.session_end {
            if self.phase == SessionPhase::Trading && bar.time >= end - self.exit_lead {
                self.phase = SessionPhase::ExitWait;
                info!(
                    "Session exit window entered at {} ({}s before close)",
                    bar.time.with_timezone(&New_York).format("%H:%M:%S"),
                    (end - bar.time).num_seconds()
                );
                return SessionSignal::WindowEntered;
            }
        }

        if bar.series == Series::Primary
            && bar.historical_bars_remaining == Some(1)
            && !self.historical_hold
        {
            self.historical_hold = true;
            debug!("Historical cutoff reached");
            return SessionSignal::HistoricalCutoff;
        }

        SessionSignal::None
    }

    /// Historical data finished; live bars follow
    pub fn enter_realtime(&mut self) {
        self.historical_hold = false;
    }

    pub fn blocks_entries(&self) -> bool {
        self.phase == SessionPhase::ExitWait || self.historical_hold
    }
}

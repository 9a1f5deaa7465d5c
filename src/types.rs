use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Data series a bar belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Series {
    /// Slower bar series that drives entry decisions
    Primary,
    /// Tick-level series used for bracket re-pricing
    Secondary,
}

impl std::str::FromStr for Series {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "primary" | "bar" | "0" => Ok(Self::Primary),
            "secondary" | "tick" | "1" => Ok(Self::Secondary),
            other => Err(format!("unknown series '{}'", other)),
        }
    }
}

/// One market-data sample delivered to the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarEvent {
    pub series: Series,
    pub time: DateTime<Utc>,
    /// Close (or last trade) price
    pub price: f64,
    pub is_first_bar_of_session: bool,
    /// End of the session this bar belongs to
    pub session_end: Option<DateTime<Utc>>,
    /// Primary bars still to come in a historical load after this one
    pub historical_bars_remaining: Option<usize>,
}

impl BarEvent {
    pub fn primary(time: DateTime<Utc>, price: f64) -> Self {
        Self {
            series: Series::Primary,
            time,
            price,
            is_first_bar_of_session: false,
            session_end: None,
            historical_bars_remaining: None,
        }
    }

    pub fn secondary(time: DateTime<Utc>, price: f64) -> Self {
        Self { series: Series::Secondary, ..Self::primary(time, price) }
    }

    pub fn first_of_session(mut self) -> Self {
        self.is_first_bar_of_session = true;
        self
    }

    pub fn with_session_end(mut self, session_end: DateTime<Utc>) -> Self {
        self.session_end = Some(session_end);
        self
    }

    pub fn with_historical_remaining(mut self, remaining: usize) -> Self {
        self.historical_bars_remaining = Some(remaining);
        self
    }
}

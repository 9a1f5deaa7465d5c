//! Configuration for the strategy engine

use std::path::Path;

use chrono::{Duration, NaiveTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::session::SessionCalendar;

/// How the stop/target pair is linked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OcoMode {
    /// Sibling cancellation is emulated by the engine
    #[default]
    Simulated,
    /// Broker links the pair (used only if the session supports linked orders)
    Native,
}

impl std::fmt::Display for OcoMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Simulated => write!(f, "Simulated"),
            Self::Native => write!(f, "Native"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} must be positive (got {value})")]
    NotPositive { field: &'static str, value: f64 },

    #[error("invalid session time {hour:02}:{minute:02}")]
    InvalidTime { hour: u32, minute: u32 },

    #[error("session start and end are both {0}")]
    EmptySession(NaiveTime),

    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Configuration for one strategy instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    /// Symbol to trade
    pub symbol: String,

    /// Contracts per entry
    pub quantity: i32,

    /// Stop-loss distance from the fill price, in points
    pub stop_distance: f64,

    /// Profit-target distance from the fill price, in points
    pub target_distance: f64,

    pub use_trailing_stop: bool,

    pub use_profit_chasing: bool,

    /// Seconds before session end at which positions are forced flat
    pub exit_lead_seconds: u32,

    /// Losses in a row that stop new entries (0 = never)
    pub max_consecutive_losses: u32,

    /// Winning streak that ends the day (0 = never)
    pub daily_profit_target: u32,

    pub oco_mode: OcoMode,

    /// Trading hours: start hour (ET)
    pub session_start_hour: u32,

    /// Trading hours: start minute
    pub session_start_minute: u32,

    /// Trading hours: end hour (ET)
    pub session_end_hour: u32,

    /// Trading hours: end minute
    pub session_end_minute: u32,

    /// Dollar value per point (NQ = $20, MNQ = $2)
    pub point_value: f64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            symbol: "NQ".to_string(),
            quantity: 1,
            stop_distance: 6.0,
            target_distance: 24.0,
            use_trailing_stop: false,
            use_profit_chasing: false,
            exit_lead_seconds: 300,      // Flat 5 minutes before the close
            max_consecutive_losses: 3,
            daily_profit_target: 0,
            oco_mode: OcoMode::Simulated,
            session_start_hour: 9,
            session_start_minute: 30,
            session_end_hour: 16,
            session_end_minute: 0,
            point_value: 20.0,           // NQ = $20/pt
        }
    }
}

impl StrategyConfig {
    /// Tight bracket with trailing and chasing, morning session only
    pub fn scalper() -> Self {
        Self {
            stop_distance: 4.0,
            target_distance: 12.0,
            use_trailing_stop: true,
            use_profit_chasing: true,
            max_consecutive_losses: 2,
            daily_profit_target: 3,
            session_end_hour: 11,
            session_end_minute: 0,
            ..Default::default()
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("quantity", self.quantity as f64),
            ("stop_distance", self.stop_distance),
            ("target_distance", self.target_distance),
            ("point_value", self.point_value),
        ] {
            if !(value > 0.0) {
                return Err(ConfigError::NotPositive { field, value });
            }
        }
        let (start, end) = self.session_times()?;
        if start == end {
            return Err(ConfigError::EmptySession(start));
        }
        Ok(())
    }

    fn session_times(&self) -> Result<(NaiveTime, NaiveTime), ConfigError> {
        let time = |hour: u32, minute: u32| {
            NaiveTime::from_hms_opt(hour, minute, 0)
                .ok_or(ConfigError::InvalidTime { hour, minute })
        };
        Ok((
            time(self.session_start_hour, self.session_start_minute)?,
            time(self.session_end_hour, self.session_end_minute)?,
        ))
    }

    pub fn exit_lead(&self) -> Duration {
        Duration::seconds(self.exit_lead_seconds as i64)
    }

    pub fn session_calendar(&self) -> Result<SessionCalendar, ConfigError> {
        let (start, end) = self.session_times()?;
        Ok(SessionCalendar::new(start, end))
    }

    /// Dollar value of a move in points (one contract)
    pub fn dollars(&self, points: f64) -> f64 {
        points * self.point_value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = StrategyConfig::default();
        assert!(config.validate().is_ok());
        assert!(StrategyConfig::scalper().validate().is_ok());
        assert_eq!(config.exit_lead(), Duration::seconds(300));
        assert_eq!(config.dollars(6.0), 120.0);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = StrategyConfig { stop_distance: 0.0, ..Default::default() };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NotPositive { field: "stop_distance", .. })
        ));

        let config = StrategyConfig { session_end_hour: 24, ..Default::default() };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidTime { hour: 24, .. })));

        let config = StrategyConfig {
            session_end_hour: 9,
            session_end_minute: 30,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::EmptySession(_))));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let raw = r#"{"stop_distance": 8.0, "use_trailing_stop": true, "oco_mode": "native"}"#;
        let config: StrategyConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.stop_distance, 8.0);
        assert!(config.use_trailing_stop);
        assert_eq!(config.oco_mode, OcoMode::Native);
        assert_eq!(config.target_distance, 24.0);
        assert_eq!(config.symbol, "NQ");
    }
}

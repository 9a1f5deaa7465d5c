//! Entry decisions from the strategy's signal source
//!
//! A signal source that cannot produce a decision (unreachable signal
//! server, missing indicator data) returns a [`SignalError`]; the engine
//! treats that exactly like [`EntryDecision::Flat`].

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::types::BarEvent;

/// Per-bar entry decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryDecision {
    Long,
    Short,
    #[default]
    Flat,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SignalError {
    #[error("signal source unavailable: {0}")]
    Unavailable(String),

    #[error("unrecognised signal '{0}'")]
    Unrecognised(String),
}

impl std::str::FromStr for EntryDecision {
    type Err = SignalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "long" | "buy" => Ok(Self::Long),
            "short" | "sell" => Ok(Self::Short),
            "" | "flat" | "none" => Ok(Self::Flat),
            other => Err(SignalError::Unrecognised(other.to_string())),
        }
    }
}

/// Yields an entry decision for each primary bar
pub trait SignalSource {
    fn decide(&mut self, bar: &BarEvent) -> Result<EntryDecision, SignalError>;
}

impl<F> SignalSource for F
where
    F: FnMut(&BarEvent) -> Result<EntryDecision, SignalError>,
{
    fn decide(&mut self, bar: &BarEvent) -> Result<EntryDecision, SignalError> {
        self(bar)
    }
}

/// Pre-recorded decisions, consumed one per bar
#[derive(Debug, Default)]
pub struct ScriptedSignals {
    decisions: VecDeque<Result<EntryDecision, SignalError>>,
}

impl ScriptedSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, decision: Result<EntryDecision, SignalError>) {
        self.decisions.push_back(decision);
    }
}

impl FromIterator<EntryDecision> for ScriptedSignals {
    fn from_iter<I: IntoIterator<Item = EntryDecision>>(iter: I) -> Self {
        Self { decisions: iter.into_iter().map(Ok).collect() }
    }
}

impl SignalSource for ScriptedSignals {
    fn decide(&mut self, _bar: &BarEvent) -> Result<EntryDecision, SignalError> {
        self.decisions.pop_front().unwrap_or(Ok(EntryDecision::Flat))
    }
}

/// Collapse a signal result: anything but a clean decision is `Flat`
pub fn resolve(result: Result<EntryDecision, SignalError>) -> EntryDecision {
    result.unwrap_or_else(|e| {
        warn!("No signal ({}), treating as flat", e);
        EntryDecision::Flat
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_parse_decisions() {
        assert_eq!("LONG".parse::<EntryDecision>(), Ok(EntryDecision::Long));
        assert_eq!("sell".parse::<EntryDecision>(), Ok(EntryDecision::Short));
        assert_eq!("".parse::<EntryDecision>(), Ok(EntryDecision::Flat));
        assert!(matches!("maybe".parse::<EntryDecision>(), Err(SignalError::Unrecognised(_))));
    }

    #[test]
    fn test_errors_resolve_to_flat() {
        let bar = BarEvent::primary(Utc::now(), 100.0);
        let mut offline = |_: &BarEvent| -> Result<EntryDecision, SignalError> {
            Err(SignalError::Unavailable("connection refused".into()))
        };
        assert_eq!(resolve(offline.decide(&bar)), EntryDecision::Flat);

        let mut scripted: ScriptedSignals = [EntryDecision::Long].into_iter().collect();
        assert_eq!(resolve(scripted.decide(&bar)), EntryDecision::Long);
        assert_eq!(resolve(scripted.decide(&bar)), EntryDecision::Flat);
    }
}

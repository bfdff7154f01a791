//! Round identifiers, round lifecycle states, and admission vocabulary.

use crate::version::ModelVersion;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Canonical round identifier. Assigned monotonically by the round
/// manager, starting at 1.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord, Default,
)]
#[serde(transparent)]
pub struct RoundId(u64);

impl RoundId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for RoundId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<RoundId> for u64 {
    fn from(value: RoundId) -> Self {
        value.0
    }
}

impl FromStr for RoundId {
    type Err = RoundIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s
            .trim()
            .parse::<u64>()
            .map_err(|_| RoundIdError::Parse(s.to_string()))?;
        Ok(RoundId::new(value))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoundIdError {
    #[error("invalid round id: {0}")]
    Parse(String),
}

/// Round lifecycle state.
///
/// Legal transitions: `OPEN -> COLLECTING -> AGGREGATING -> CLOSED`.
/// A round that never collected an assignment may go straight from
/// `OPEN` to `AGGREGATING` (it closes empty). `AGGREGATING` is entered
/// at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoundState {
    /// Round created, no assignments yet
    #[default]
    Open,
    /// At least one assigned client, awaiting updates
    Collecting,
    /// Closed to new updates, aggregation in progress
    Aggregating,
    /// Aggregation complete; terminal
    Closed,
}

impl RoundState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoundState::Open => "OPEN",
            RoundState::Collecting => "COLLECTING",
            RoundState::Aggregating => "AGGREGATING",
            RoundState::Closed => "CLOSED",
        }
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition(self, next: RoundState) -> bool {
        matches!(
            (self, next),
            (RoundState::Open, RoundState::Collecting)
                | (RoundState::Open, RoundState::Aggregating)
                | (RoundState::Collecting, RoundState::Aggregating)
                | (RoundState::Aggregating, RoundState::Closed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RoundState::Closed)
    }

    /// Whether the round still accepts updates from assigned clients.
    pub fn accepts_updates(self) -> bool {
        matches!(self, RoundState::Collecting | RoundState::Aggregating)
    }
}

impl fmt::Display for RoundState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RoundState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "OPEN" => Ok(RoundState::Open),
            "COLLECTING" => Ok(RoundState::Collecting),
            "AGGREGATING" => Ok(RoundState::Aggregating),
            "CLOSED" => Ok(RoundState::Closed),
            _ => Err(format!("Invalid round state: '{}'", s)),
        }
    }
}

/// Why an update was refused at admission time.
///
/// The validator chain runs in a fixed order and the first failing
/// check determines the reason. The string forms are stable codes that
/// reach clients verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    AuthenticationFailed,
    ClientNotRegistered,
    InvalidRoundOrAssignment,
    RateLimitExceeded,
    InvalidWeightDeltaFormat,
    NonFiniteValues,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::AuthenticationFailed => "authentication_failed",
            RejectReason::ClientNotRegistered => "client_not_registered",
            RejectReason::InvalidRoundOrAssignment => "invalid_round_or_assignment",
            RejectReason::RateLimitExceeded => "rate_limit_exceeded",
            RejectReason::InvalidWeightDeltaFormat => "invalid_weight_delta_format",
            RejectReason::NonFiniteValues => "non_finite_values",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Point-in-time view of a round, as served to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundSnapshot {
    pub round_id: RoundId,
    pub model_version: ModelVersion,
    pub state: RoundState,
    pub assigned_clients: Vec<String>,
    pub updates_received: Vec<String>,
    pub total_clients: usize,
    pub total_updates: usize,
}

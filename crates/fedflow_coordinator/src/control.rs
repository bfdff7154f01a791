//! Control Plane API for the Fedflow coordinator.
//!
//! The coordinator serves a ZMQ REP socket speaking JSON request and
//! response envelopes. Each variant maps one-to-one onto the HTTP-style
//! surface clients expect:
//!
//! | Request                  | HTTP analogue                    |
//! |--------------------------|----------------------------------|
//! | `RegisterClient`         | POST /client/register            |
//! | `GetTask`                | GET /task/{client_id}            |
//! | `SubmitUpdate`           | POST /update                     |
//! | `AggregateRound`         | GET /aggregate/{round_id}        |
//! | `GetRoundStatus`         | GET /status/{round_id}           |
//! | `GetModel`               | GET /model/{version}             |
//! | `GetMetrics` and friends | GET /metrics[...]                |
//! | `GetReputation`          | GET /reputation[/{client_id}]    |
//! | `GetIncentives`          | GET /incentives[/{client_id}]    |
//! | `GetAsyncRoundStats`     | GET /async/round/{id}/stats      |
//! | `Ping`                   | health check                     |
//!
//! Error responses carry a closed `ErrorCode`; the HTTP analogue of
//! each code is documented on the enum.

use fedflow_protocol::{RoundId, RoundSnapshot};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::aggregator::AggregateOutcome;
use crate::assigner::Task;
use crate::closer::AsyncRoundStats;
use crate::incentives::IncentiveSnapshot;
use crate::metrics::{MetricsReport, RoundMetricsReport};
use crate::reputation::ReputationSnapshot;

/// Control API request envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ApiRequest {
    /// Register a client and receive a capability token
    RegisterClient { client_name: String },
    /// Fetch (or re-fetch) the client's training task
    GetTask {
        client_id: String,
        api_key: Option<String>,
    },
    /// Submit a trained weight delta for a round
    SubmitUpdate {
        client_id: String,
        round_id: RoundId,
        weight_delta: String,
        api_key: Option<String>,
    },
    /// Aggregate a round now
    AggregateRound { round_id: RoundId },
    /// Snapshot of one round
    GetRoundStatus { round_id: RoundId },
    /// Fetch a persisted model artifact
    GetModel { version: String },
    /// All metrics, global and per-round
    GetMetrics,
    /// Metrics of the most recent round
    GetLatestMetrics,
    /// Metrics of one round
    GetRoundMetrics { round_id: RoundId },
    /// Reputation of one client, or the full roster
    GetReputation { client_id: Option<String> },
    /// Incentive ledger of one client, or the full roster
    GetIncentives { client_id: Option<String> },
    /// Async-closure statistics for a round
    GetAsyncRoundStats { round_id: RoundId },
    /// Ping/health check
    Ping,
}

/// Control API response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ApiResponse {
    Registered(RegisterInfo),
    Task(Task),
    UpdateAccepted { success: bool, message: String },
    Aggregated(AggregateOutcome),
    RoundStatus(RoundSnapshot),
    Model { version: String, model_data: Value },
    Metrics(MetricsReport),
    LatestMetrics(Option<RoundMetricsReport>),
    RoundMetrics(RoundMetricsReport),
    Reputation(ReputationSnapshot),
    ReputationRoster(Vec<ReputationSnapshot>),
    Incentives(IncentiveSnapshot),
    IncentiveRoster(Vec<IncentiveSnapshot>),
    AsyncRoundStats(AsyncRoundStats),
    Pong,
    Error { code: ErrorCode, message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterInfo {
    pub success: bool,
    pub message: String,
    pub client_id: String,
    pub api_key: String,
}

/// Stable error codes. HTTP analogues in parentheses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Client name already taken (400)
    AlreadyRegistered,
    /// Missing or wrong capability token (401)
    AuthFailed,
    /// No task could be assigned (404)
    NoAssignment,
    /// Round, model or metrics not found (404)
    NotFound,
    /// Update arrived after its round closed (410)
    Straggler,
    /// A request or update ceiling was hit (429)
    RateLimited,
    /// Update failed an admission check (400)
    InvalidUpdate,
    /// Persisted artifact could not be read (500)
    StoreError,
    /// Request could not be parsed (400)
    BadRequest,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::AlreadyRegistered => "ALREADY_REGISTERED",
            ErrorCode::AuthFailed => "AUTH_FAILED",
            ErrorCode::NoAssignment => "NO_ASSIGNMENT",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Straggler => "STRAGGLER",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::InvalidUpdate => "INVALID_UPDATE",
            ErrorCode::StoreError => "STORE_ERROR",
            ErrorCode::BadRequest => "BAD_REQUEST",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl ApiResponse {
    /// Create an error response.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }
}

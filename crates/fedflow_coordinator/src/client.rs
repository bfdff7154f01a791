//! REQ-side client for the coordinator control plane.
//!
//! Used by worker tooling, the CLI, and the integration tests. One
//! request in flight at a time, with a receive timeout so a dead
//! coordinator surfaces as an error rather than a hang.

use anyhow::{bail, Context, Result};

use crate::aggregator::AggregateOutcome;
use crate::assigner::Task;
use crate::control::{ApiRequest, ApiResponse, ErrorCode, RegisterInfo};
use fedflow_protocol::{RoundId, RoundSnapshot};

const DEFAULT_TIMEOUT_MS: i32 = 5_000;

pub struct ApiClient {
    socket: zmq::Socket,
}

impl ApiClient {
    pub fn connect(addr: &str) -> Result<Self> {
        Self::connect_with_timeout(addr, DEFAULT_TIMEOUT_MS)
    }

    pub fn connect_with_timeout(addr: &str, timeout_ms: i32) -> Result<Self> {
        let context = zmq::Context::new();
        let socket = context
            .socket(zmq::REQ)
            .context("Failed to create REQ socket")?;
        socket
            .set_rcvtimeo(timeout_ms)
            .context("Failed to set receive timeout")?;
        socket
            .set_sndtimeo(timeout_ms)
            .context("Failed to set send timeout")?;
        socket
            .set_linger(0)
            .context("Failed to set linger")?;
        socket
            .connect(addr)
            .with_context(|| format!("Failed to connect to coordinator at {addr}"))?;
        Ok(Self { socket })
    }

    /// Send one request and wait for its response.
    pub fn request(&self, request: &ApiRequest) -> Result<ApiResponse> {
        let body = serde_json::to_vec(request).context("Failed to encode request")?;
        self.socket
            .send(&body, 0)
            .context("Failed to send request")?;
        let reply = self
            .socket
            .recv_bytes(0)
            .context("No response from coordinator")?;
        serde_json::from_slice(&reply).context("Failed to decode response")
    }

    pub fn ping(&self) -> Result<()> {
        match self.request(&ApiRequest::Ping)? {
            ApiResponse::Pong => Ok(()),
            other => bail!("unexpected response to ping: {other:?}"),
        }
    }

    pub fn register(&self, client_name: &str) -> Result<RegisterInfo> {
        match self.request(&ApiRequest::RegisterClient {
            client_name: client_name.to_string(),
        })? {
            ApiResponse::Registered(info) => Ok(info),
            other => bail!("registration failed: {other:?}"),
        }
    }

    pub fn get_task(&self, client_id: &str, api_key: &str) -> Result<Task> {
        match self.request(&ApiRequest::GetTask {
            client_id: client_id.to_string(),
            api_key: Some(api_key.to_string()),
        })? {
            ApiResponse::Task(task) => Ok(task),
            other => bail!("task request failed: {other:?}"),
        }
    }

    /// Submit an update. Returns the server's acceptance message, or
    /// the error code and message on refusal.
    pub fn submit_update(
        &self,
        client_id: &str,
        round_id: RoundId,
        weight_delta: &str,
        api_key: &str,
    ) -> Result<std::result::Result<String, (ErrorCode, String)>> {
        match self.request(&ApiRequest::SubmitUpdate {
            client_id: client_id.to_string(),
            round_id,
            weight_delta: weight_delta.to_string(),
            api_key: Some(api_key.to_string()),
        })? {
            ApiResponse::UpdateAccepted { message, .. } => Ok(Ok(message)),
            ApiResponse::Error { code, message } => Ok(Err((code, message))),
            other => bail!("unexpected response to update: {other:?}"),
        }
    }

    pub fn aggregate_round(&self, round_id: RoundId) -> Result<AggregateOutcome> {
        match self.request(&ApiRequest::AggregateRound { round_id })? {
            ApiResponse::Aggregated(outcome) => Ok(outcome),
            other => bail!("aggregate failed: {other:?}"),
        }
    }

    pub fn round_status(&self, round_id: RoundId) -> Result<RoundSnapshot> {
        match self.request(&ApiRequest::GetRoundStatus { round_id })? {
            ApiResponse::RoundStatus(snapshot) => Ok(snapshot),
            other => bail!("status request failed: {other:?}"),
        }
    }
}

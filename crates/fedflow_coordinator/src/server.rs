//! Control-plane server.
//!
//! One REP socket, one event loop: receive a JSON `ApiRequest`, run it
//! against the core, send the JSON `ApiResponse`. The receive timeout
//! keeps the loop responsive to the shutdown channel. The async-closer
//! ticker is the only background thread; it re-evaluates round
//! readiness on a fixed cadence and joins within a bounded wait at
//! shutdown.

use anyhow::{Context, Result};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{error, info};

use crate::control::{ApiRequest, ApiResponse, ErrorCode};
use crate::core::{Core, ModelError, RegisterError, SubmitError, TaskError};
use fedflow_protocol::RejectReason;

const RECV_TIMEOUT_MS: i32 = 100;
/// Readiness is re-evaluated at least this often.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

pub struct CoordinatorServer {
    socket: zmq::Socket,
    core: Arc<Core>,
    running: bool,
}

impl CoordinatorServer {
    /// Bind the control-plane socket. A failed bind is fatal at
    /// startup.
    pub fn bind(core: Arc<Core>, bind_addr: &str) -> Result<Self> {
        let context = zmq::Context::new();
        let socket = context
            .socket(zmq::REP)
            .context("Failed to create REP socket")?;
        socket
            .bind(bind_addr)
            .with_context(|| format!("Failed to bind control socket to {bind_addr}"))?;
        socket
            .set_rcvtimeo(RECV_TIMEOUT_MS)
            .context("Failed to set socket receive timeout")?;
        info!("Coordinator control plane bound to {bind_addr}");

        Ok(Self {
            socket,
            core,
            running: false,
        })
    }

    /// Main event loop, until the process dies.
    pub fn run(&mut self) -> Result<()> {
        self.run_with_shutdown_inner(None)
    }

    /// Main event loop with a shutdown channel.
    pub fn run_with_shutdown(&mut self, stop_rx: mpsc::Receiver<()>) -> Result<()> {
        self.run_with_shutdown_inner(Some(stop_rx))
    }

    fn run_with_shutdown_inner(&mut self, stop_rx: Option<mpsc::Receiver<()>>) -> Result<()> {
        self.running = true;
        info!("Coordinator event loop started");

        while self.running {
            if let Some(rx) = stop_rx.as_ref() {
                match rx.try_recv() {
                    Ok(()) | Err(mpsc::TryRecvError::Disconnected) => {
                        info!("Coordinator received stop signal");
                        self.running = false;
                        break;
                    }
                    Err(mpsc::TryRecvError::Empty) => {}
                }
            }

            let request_bytes = match self.socket.recv_bytes(0) {
                Ok(bytes) => bytes,
                Err(zmq::Error::EAGAIN) => continue,
                Err(e) => {
                    error!("Control socket recv error: {e}");
                    continue;
                }
            };

            let response = match serde_json::from_slice::<ApiRequest>(&request_bytes) {
                Ok(request) => handle_request(&self.core, request),
                Err(e) => ApiResponse::error(ErrorCode::BadRequest, format!("Invalid request: {e}")),
            };

            let response_bytes =
                serde_json::to_vec(&response).context("Failed to encode control response")?;
            if let Err(e) = self.socket.send(&response_bytes, 0) {
                error!("Control socket send error: {e}");
            }
        }

        info!("Coordinator stopped");
        Ok(())
    }
}

/// Dispatch one request against the core.
pub fn handle_request(core: &Core, request: ApiRequest) -> ApiResponse {
    match request {
        ApiRequest::RegisterClient { client_name } => {
            match core.register_client(&client_name) {
                Ok(info) => ApiResponse::Registered(info),
                Err(RegisterError::AlreadyRegistered(name)) => ApiResponse::error(
                    ErrorCode::AlreadyRegistered,
                    format!("Client {name} is already registered"),
                ),
            }
        }
        ApiRequest::GetTask { client_id, api_key } => {
            match core.get_task(&client_id, api_key.as_deref()) {
                Ok(task) => ApiResponse::Task(task),
                Err(TaskError::AuthFailed) => ApiResponse::error(
                    ErrorCode::AuthFailed,
                    "Authentication failed. Valid API key required.",
                ),
                Err(TaskError::RateLimited(reason)) => ApiResponse::error(
                    ErrorCode::RateLimited,
                    format!("Rate limit exceeded: {reason}"),
                ),
                Err(TaskError::NoAssignment) => ApiResponse::error(
                    ErrorCode::NoAssignment,
                    format!("Could not assign task to client {client_id}"),
                ),
            }
        }
        ApiRequest::SubmitUpdate {
            client_id,
            round_id,
            weight_delta,
            api_key,
        } => match core.submit_update(&client_id, round_id, &weight_delta, api_key.as_deref()) {
            Ok(message) => ApiResponse::UpdateAccepted {
                success: true,
                message,
            },
            Err(SubmitError::Straggler) => ApiResponse::error(
                ErrorCode::Straggler,
                format!("Round {round_id} already closed; update from {client_id} arrived too late"),
            ),
            Err(SubmitError::Rejected(reason)) => {
                let code = match reason {
                    RejectReason::AuthenticationFailed => ErrorCode::AuthFailed,
                    RejectReason::RateLimitExceeded => ErrorCode::RateLimited,
                    _ => ErrorCode::InvalidUpdate,
                };
                ApiResponse::error(
                    code,
                    format!(
                        "Invalid update from client {client_id} for round {round_id}: {reason}"
                    ),
                )
            }
        },
        ApiRequest::AggregateRound { round_id } => match core.aggregate_round(round_id) {
            Some(outcome) => ApiResponse::Aggregated(outcome),
            None => not_found_round(round_id),
        },
        ApiRequest::GetRoundStatus { round_id } => match core.round_status(round_id) {
            Some(snapshot) => ApiResponse::RoundStatus(snapshot),
            None => not_found_round(round_id),
        },
        ApiRequest::GetModel { version } => match core.model(&version) {
            Ok(model_data) => ApiResponse::Model {
                version,
                model_data,
            },
            Err(ModelError::NotFound) => ApiResponse::error(
                ErrorCode::NotFound,
                format!("Model version {version} not found"),
            ),
            Err(ModelError::Store(e)) => ApiResponse::error(
                ErrorCode::StoreError,
                format!("Failed to load model {version}: {e}"),
            ),
        },
        ApiRequest::GetMetrics => ApiResponse::Metrics(core.metrics_report()),
        ApiRequest::GetLatestMetrics => ApiResponse::LatestMetrics(core.latest_round_metrics()),
        ApiRequest::GetRoundMetrics { round_id } => match core.round_metrics(round_id) {
            Some(report) => ApiResponse::RoundMetrics(report),
            None => ApiResponse::error(
                ErrorCode::NotFound,
                format!("Metrics for round {round_id} not found"),
            ),
        },
        ApiRequest::GetReputation { client_id } => match client_id {
            Some(client_id) => match core.reputation_of(&client_id) {
                Some(snapshot) => ApiResponse::Reputation(snapshot),
                None => not_found_client(&client_id),
            },
            None => ApiResponse::ReputationRoster(core.reputation_roster()),
        },
        ApiRequest::GetIncentives { client_id } => match client_id {
            Some(client_id) => match core.incentives_of(&client_id) {
                Some(snapshot) => ApiResponse::Incentives(snapshot),
                None => not_found_client(&client_id),
            },
            None => ApiResponse::IncentiveRoster(core.incentive_roster()),
        },
        ApiRequest::GetAsyncRoundStats { round_id } => match core.async_round_stats(round_id) {
            Some(stats) => ApiResponse::AsyncRoundStats(stats),
            None => not_found_round(round_id),
        },
        ApiRequest::Ping => ApiResponse::Pong,
    }
}

fn not_found_round(round_id: fedflow_protocol::RoundId) -> ApiResponse {
    ApiResponse::error(ErrorCode::NotFound, format!("Round {round_id} not found"))
}

fn not_found_client(client_id: &str) -> ApiResponse {
    ApiResponse::error(ErrorCode::NotFound, format!("Client {client_id} not found"))
}

/// Handle to the closer ticker thread.
pub struct TickerHandle {
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl TickerHandle {
    /// Signal the ticker and wait (bounded by the tick interval) for it
    /// to drain.
    pub fn shutdown(self) {
        let _ = self.stop_tx.send(());
        if self.handle.join().is_err() {
            error!("closer ticker panicked");
        }
    }
}

/// Start the background ticker that closes rounds on quorum or timeout.
///
/// The stop channel doubles as the sleep: each tick waits on it with a
/// timeout, so shutdown interrupts the wait immediately and the join is
/// bounded by one tick plus one close pass.
pub fn spawn_ticker(core: Arc<Core>) -> TickerHandle {
    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    let handle = std::thread::spawn(move || {
        info!("closer ticker started");
        loop {
            match stop_rx.recv_timeout(TICK_INTERVAL) {
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                Err(mpsc::RecvTimeoutError::Timeout) => {}
            }
            core.close_ready_rounds();
        }
        info!("closer ticker stopped");
    });
    TickerHandle { stop_tx, handle }
}

//! Asynchronous round closure.
//!
//! Watches open rounds and decides when they may close: quorum reached,
//! or wall-clock timeout. Also keeps the closed-round set used to spot
//! stragglers, and the per-round straggler roster. A background ticker
//! (one thread, owned by the server) re-evaluates readiness every few
//! seconds and fires the close path at most once per round.

use chrono::{DateTime, Utc};
use fedflow_protocol::RoundId;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Instant;

use crate::config::CloserConfig;

/// A submission that arrived after its round closed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StragglerRecord {
    pub client_id: String,
    pub round_id: RoundId,
    pub arrived_at: DateTime<Utc>,
}

/// Statistics served for one async round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsyncRoundStats {
    pub round_id: RoundId,
    pub assigned_clients: usize,
    pub updates_received: usize,
    pub minimum_required: usize,
    pub is_ready: bool,
    pub stragglers: Vec<StragglerRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_remaining: Option<f64>,
}

pub struct AsyncCloser {
    config: CloserConfig,
    start_times: HashMap<RoundId, Instant>,
    stragglers: HashMap<RoundId, Vec<StragglerRecord>>,
    closed_rounds: HashSet<RoundId>,
    ready_fired: HashSet<RoundId>,
}

impl AsyncCloser {
    pub fn new(config: CloserConfig) -> Self {
        Self {
            config,
            start_times: HashMap::new(),
            stragglers: HashMap::new(),
            closed_rounds: HashSet::new(),
            ready_fired: HashSet::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Record the start timestamp of a round.
    pub fn start(&mut self, round_id: RoundId) {
        self.start_times.entry(round_id).or_insert_with(Instant::now);
    }

    /// Seconds since the round started, if it is being tracked.
    pub fn elapsed(&self, round_id: RoundId) -> Option<f64> {
        self.start_times
            .get(&round_id)
            .map(|start| start.elapsed().as_secs_f64())
    }

    pub fn is_closed(&self, round_id: RoundId) -> bool {
        self.closed_rounds.contains(&round_id)
    }

    /// Whether a round may close, given its current membership counts.
    ///
    /// Async mode: quorum reached or timeout expired. Otherwise the
    /// predicate degenerates to "every assigned client has submitted".
    pub fn ready(&self, round_id: RoundId, updates_received: usize, assigned: usize) -> bool {
        if !self.config.enabled {
            return assigned > 0 && updates_received >= assigned;
        }
        if self.closed_rounds.contains(&round_id) {
            return false;
        }
        if updates_received >= self.config.min_updates {
            return true;
        }
        match self.start_times.get(&round_id) {
            Some(start) => start.elapsed() >= self.config.max_duration,
            None => false,
        }
    }

    /// Consume the one-shot ready trigger for a round. Returns true on
    /// the first call after the round becomes ready, false forever
    /// after.
    pub fn take_ready_fire(&mut self, round_id: RoundId) -> bool {
        self.ready_fired.insert(round_id)
    }

    /// Record a submission that arrived for an already-closed round.
    pub fn record_straggler(&mut self, client_id: &str, round_id: RoundId) {
        self.stragglers
            .entry(round_id)
            .or_default()
            .push(StragglerRecord {
                client_id: client_id.to_string(),
                round_id,
                arrived_at: Utc::now(),
            });
    }

    pub fn stragglers_for_round(&self, round_id: RoundId) -> &[StragglerRecord] {
        self.stragglers
            .get(&round_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Mark a round closed and stop tracking its start time.
    pub fn mark_closed(&mut self, round_id: RoundId) {
        self.closed_rounds.insert(round_id);
        self.start_times.remove(&round_id);
    }

    pub fn stats(
        &self,
        round_id: RoundId,
        updates_received: usize,
        assigned: usize,
    ) -> AsyncRoundStats {
        let elapsed = self.elapsed(round_id);
        let timeout = self.config.max_duration.as_secs_f64();
        AsyncRoundStats {
            round_id,
            assigned_clients: assigned,
            updates_received,
            minimum_required: if self.config.enabled {
                self.config.min_updates
            } else {
                assigned
            },
            is_ready: self.ready(round_id, updates_received, assigned),
            stragglers: self.stragglers_for_round(round_id).to_vec(),
            elapsed_seconds: elapsed,
            timeout_seconds: elapsed.map(|_| timeout),
            timeout_remaining: elapsed.map(|e| (timeout - e).max(0.0)),
        }
    }
}

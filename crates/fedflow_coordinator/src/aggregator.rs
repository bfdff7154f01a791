//! Per-round update buffers and aggregation results.
//!
//! The buffer keeps one entry per (client, round), in first-submission
//! order; a resubmission replaces the stored delta in place. The
//! aggregation itself (concatenating deltas under a new version) is
//! orchestrated by `Core`, which records its outcome here so repeated
//! aggregate requests are idempotent.

use fedflow_protocol::{ModelVersion, RoundId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// One client's buffered update for a round.
#[derive(Debug, Clone)]
pub struct ClientUpdate {
    pub client_id: String,
    pub round_id: RoundId,
    pub weight_delta: String,
}

/// Outcome of aggregating a round, as served to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateOutcome {
    pub round_id: RoundId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_version: Option<ModelVersion>,
    pub status: String,
    pub aggregated_model: Option<Value>,
    pub num_updates: usize,
}

impl AggregateOutcome {
    pub fn no_updates(round_id: RoundId) -> Self {
        Self {
            round_id,
            model_version: None,
            status: "no_updates".to_string(),
            aggregated_model: None,
            num_updates: 0,
        }
    }

    pub fn aggregated(
        round_id: RoundId,
        model_version: ModelVersion,
        model: Value,
        num_updates: usize,
    ) -> Self {
        Self {
            round_id,
            model_version: Some(model_version),
            status: "aggregated".to_string(),
            aggregated_model: Some(model),
            num_updates,
        }
    }
}

#[derive(Default)]
pub struct Aggregator {
    updates: HashMap<RoundId, Vec<ClientUpdate>>,
    results: HashMap<RoundId, AggregateOutcome>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer an update, overwriting any earlier submission from the
    /// same client while preserving first-submission order.
    pub fn upsert(&mut self, client_id: &str, round_id: RoundId, weight_delta: String) {
        let updates = self.updates.entry(round_id).or_default();
        match updates.iter_mut().find(|u| u.client_id == client_id) {
            Some(existing) => existing.weight_delta = weight_delta,
            None => updates.push(ClientUpdate {
                client_id: client_id.to_string(),
                round_id,
                weight_delta,
            }),
        }
    }

    /// Drain the buffered updates for a round. The buffer entry is
    /// dropped; round closure is the only caller.
    pub fn take_updates(&mut self, round_id: RoundId) -> Vec<ClientUpdate> {
        self.updates.remove(&round_id).unwrap_or_default()
    }

    pub fn buffered_count(&self, round_id: RoundId) -> usize {
        self.updates.get(&round_id).map(Vec::len).unwrap_or(0)
    }

    /// Remember the outcome of a closed round.
    pub fn store_result(&mut self, outcome: AggregateOutcome) {
        self.results.insert(outcome.round_id, outcome);
    }

    pub fn result_for(&self, round_id: RoundId) -> Option<&AggregateOutcome> {
        self.results.get(&round_id)
    }
}

//! The coordinator core: every stateful component behind its own lock,
//! threaded explicitly into request handlers and the closer ticker.
//!
//! Lock discipline: when two locks must be held at once they are
//! acquired in the order auth -> rounds -> assigner -> aggregator ->
//! limiter; every other component is locked on its own. Long
//! operations (aggregation) release locks between steps, so a request
//! handler never waits on another handler's full pipeline.

use serde_json::json;
use std::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

use fedflow_protocol::{ModelVersion, RejectReason, RoundId, RoundSnapshot, RoundState};

use crate::aggregator::{AggregateOutcome, Aggregator};
use crate::assigner::{Task, TaskAssigner};
use crate::auth::AuthStore;
use crate::closer::{AsyncCloser, AsyncRoundStats};
use crate::config::CoordinatorConfig;
use crate::control::RegisterInfo;
use crate::incentives::{IncentiveLedger, IncentiveSnapshot};
use crate::metrics::{MetricsCollector, MetricsReport, RoundMetricsReport};
use crate::privacy::PrivacyFilter;
use crate::rate_limit::{RateLimiter, RateReason};
use crate::reputation::{ReputationSnapshot, ReputationTracker};
use crate::rounds::{RecordOutcome, RoundManager};
use crate::store::{ModelStore, StoreError};
use crate::validator::UpdateValidator;

/// Why a registration was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterError {
    AlreadyRegistered(String),
}

/// Why a task request returned nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    AuthFailed,
    RateLimited(RateReason),
    NoAssignment,
}

/// Why an update submission was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    Rejected(RejectReason),
    Straggler,
}

/// Why a model read failed.
#[derive(Debug)]
pub enum ModelError {
    NotFound,
    Store(StoreError),
}

pub struct Core {
    store: ModelStore,
    privacy: PrivacyFilter,

    auth: Mutex<AuthStore>,
    rounds: Mutex<RoundManager>,
    assigner: Mutex<TaskAssigner>,
    limiter: Mutex<RateLimiter>,
    aggregator: Mutex<Aggregator>,
    closer: Mutex<AsyncCloser>,
    reputation: Mutex<ReputationTracker>,
    incentives: Mutex<IncentiveLedger>,
    metrics: Mutex<MetricsCollector>,
}

impl Core {
    /// Build the coordinator state, seeding the assigner's version from
    /// the newest persisted model. Fails on unusable data directories.
    pub fn new(config: CoordinatorConfig) -> anyhow::Result<Self> {
        let store = ModelStore::open(config.models_dir())?;
        let metrics = MetricsCollector::open(config.metrics_dir(), config.round_log_dir())?;
        let latest = store.latest()?;
        if let Some(version) = &latest {
            info!(%version, "resuming from persisted model");
        }

        Ok(Self {
            privacy: PrivacyFilter::new(config.privacy.clone()),
            auth: Mutex::new(AuthStore::new()),
            rounds: Mutex::new(RoundManager::new()),
            assigner: Mutex::new(TaskAssigner::new(latest)),
            limiter: Mutex::new(RateLimiter::new(config.rate_limit.clone())),
            aggregator: Mutex::new(Aggregator::new()),
            closer: Mutex::new(AsyncCloser::new(config.closer.clone())),
            reputation: Mutex::new(ReputationTracker::new()),
            incentives: Mutex::new(IncentiveLedger::new(config.incentives.clone())),
            metrics: Mutex::new(metrics),
            store,
        })
    }

    /// The model version new assignments currently bind to.
    pub fn current_version(&self) -> ModelVersion {
        lock(&self.assigner).version().clone()
    }

    // ========================================================================
    // Client registration
    // ========================================================================

    pub fn register_client(&self, client_name: &str) -> Result<RegisterInfo, RegisterError> {
        {
            let mut rounds = lock(&self.rounds);
            if !rounds.register_client(client_name) {
                return Err(RegisterError::AlreadyRegistered(client_name.to_string()));
            }
        }
        let api_key = match lock(&self.auth).issue(client_name) {
            Ok(api_key) => api_key,
            Err(_) => {
                return Err(RegisterError::AlreadyRegistered(client_name.to_string()));
            }
        };

        lock(&self.reputation).register_client(client_name);
        lock(&self.metrics).note_client(client_name);
        info!(client_id = client_name, "client registered");

        Ok(RegisterInfo {
            success: true,
            message: format!(
                "Client {client_name} registered successfully. Save your API key!"
            ),
            client_id: client_name.to_string(),
            api_key,
        })
    }

    // ========================================================================
    // Task assignment
    // ========================================================================

    pub fn get_task(&self, client_id: &str, api_key: Option<&str>) -> Result<Task, TaskError> {
        if !lock(&self.auth).validate(api_key, Some(client_id)) {
            return Err(TaskError::AuthFailed);
        }
        lock(&self.limiter)
            .check_request(client_id)
            .map_err(TaskError::RateLimited)?;

        let (task, effects) = {
            let mut rounds = lock(&self.rounds);
            let mut assigner = lock(&self.assigner);
            assigner
                .assign(client_id, &mut rounds)
                .ok_or(TaskError::NoAssignment)?
        };

        if effects.round_created {
            lock(&self.metrics).start_round(task.round_id, task.model_version.clone());
            lock(&self.closer).start(task.round_id);
        }
        if effects.newly_assigned {
            lock(&self.metrics).record_client_assigned(task.round_id, client_id);
            lock(&self.reputation).record_round_participation(client_id, task.round_id);
            info!(client_id, round_id = %task.round_id, version = %task.model_version, "task assigned");
        }

        Ok(task)
    }

    // ========================================================================
    // Update submission
    // ========================================================================

    pub fn submit_update(
        &self,
        client_id: &str,
        round_id: RoundId,
        weight_delta: &str,
        api_key: Option<&str>,
    ) -> Result<String, SubmitError> {
        // Stragglers get a distinct refusal and a reputation ding, but
        // only once the submitter's identity checks out.
        if let Err(reason) = self.admission_check(client_id, round_id, weight_delta, api_key) {
            let is_straggler = reason == RejectReason::InvalidRoundOrAssignment
                && self.is_straggler(client_id, round_id);
            if is_straggler {
                self.record_straggler(client_id, round_id);
                return Err(SubmitError::Straggler);
            }

            lock(&self.metrics).record_update_rejected(round_id);
            if !matches!(
                reason,
                RejectReason::AuthenticationFailed | RejectReason::ClientNotRegistered
            ) {
                let latency = lock(&self.closer).elapsed(round_id);
                let mut reputation = lock(&self.reputation);
                reputation.record_update_submitted(client_id, latency);
                reputation.record_update_rejected(client_id);
            }
            return Err(SubmitError::Rejected(reason));
        }

        let protected = self.privacy.protect(weight_delta);
        let latency = lock(&self.closer).elapsed(round_id);

        let outcome = lock(&self.rounds).record_update(client_id, round_id);
        if outcome == RecordOutcome::Rejected {
            // The round slipped away between validation and recording.
            lock(&self.metrics).record_update_rejected(round_id);
            return Err(SubmitError::Rejected(RejectReason::InvalidRoundOrAssignment));
        }

        lock(&self.aggregator).upsert(client_id, round_id, protected);
        lock(&self.limiter).record_update(client_id, round_id);

        {
            let mut reputation = lock(&self.reputation);
            reputation.record_update_submitted(client_id, latency);
            if outcome == RecordOutcome::First {
                reputation.record_update_accepted(client_id);
            }
        }
        if outcome == RecordOutcome::First {
            let mut metrics = lock(&self.metrics);
            metrics.record_update_received(round_id);
            metrics.record_update_accepted(round_id);
            drop(metrics);
            let tokens = lock(&self.incentives).award(client_id, round_id, latency);
            info!(client_id, round_id = %round_id, tokens, "update accepted");
        } else {
            info!(client_id, round_id = %round_id, "update overwritten");
        }

        // Quorum may have been reached just now; close without waiting
        // for the next tick.
        self.close_if_ready(round_id);

        Ok(format!(
            "Update from client {client_id} submitted successfully for round {round_id}"
        ))
    }

    fn admission_check(
        &self,
        client_id: &str,
        round_id: RoundId,
        weight_delta: &str,
        api_key: Option<&str>,
    ) -> Result<(), RejectReason> {
        let auth = lock(&self.auth);
        let rounds = lock(&self.rounds);
        let limiter = lock(&self.limiter);
        UpdateValidator::validate(
            &auth,
            &rounds,
            &limiter,
            &self.privacy,
            client_id,
            round_id,
            weight_delta,
            api_key,
        )
    }

    fn is_straggler(&self, client_id: &str, round_id: RoundId) -> bool {
        if !lock(&self.closer).is_closed(round_id) {
            return false;
        }
        lock(&self.rounds)
            .round(round_id)
            .is_some_and(|round| round.assigned_clients.contains(client_id))
    }

    fn record_straggler(&self, client_id: &str, round_id: RoundId) {
        warn!(client_id, round_id = %round_id, "straggler update refused");
        lock(&self.closer).record_straggler(client_id, round_id);
        lock(&self.reputation).record_round_dropout(client_id, round_id);
        lock(&self.incentives).record_dropout(client_id);
        lock(&self.metrics).record_update_rejected(round_id);
    }

    // ========================================================================
    // Round closure and aggregation
    // ========================================================================

    /// Aggregate a round: concatenate the collected deltas under the
    /// next model version, persist the artifact, advance the assigner,
    /// and close the round. Returns `None` for unknown rounds; repeated
    /// calls return the recorded outcome.
    pub fn aggregate_round(&self, round_id: RoundId) -> Option<AggregateOutcome> {
        let base_version = {
            let mut rounds = lock(&self.rounds);
            let round = match rounds.round(round_id) {
                Some(round) => round,
                None => return lock(&self.aggregator).result_for(round_id).cloned(),
            };
            let base_version = round.model_version.clone();
            if !rounds.set_state(round_id, RoundState::Aggregating) {
                // Already aggregating or closed; serve what we have.
                return lock(&self.aggregator).result_for(round_id).cloned();
            }
            base_version
        };

        lock(&self.metrics).start_aggregation(round_id);
        let updates = lock(&self.aggregator).take_updates(round_id);

        let outcome = if updates.is_empty() {
            info!(round_id = %round_id, "closing round without updates");
            AggregateOutcome::no_updates(round_id)
        } else {
            let new_version = base_version.next();
            let client_ids: Vec<&str> = updates.iter().map(|u| u.client_id.as_str()).collect();
            let weight_deltas: Vec<&str> = updates.iter().map(|u| u.weight_delta.as_str()).collect();
            let document = json!({
                "version": new_version,
                "base_version": base_version,
                "round_id": round_id,
                "weight_deltas": weight_deltas,
                "num_updates": updates.len(),
                "client_ids": client_ids,
                "aggregation_timestamp": chrono::Utc::now(),
            });

            // Liveness over durability: a failed save is logged and the
            // round still closes; operators reconcile out of band.
            if let Err(e) = self.store.save(&new_version, &document) {
                error!(round_id = %round_id, version = %new_version, error = %e, "failed to persist model artifact");
            }
            lock(&self.assigner).set_version(new_version.clone());
            info!(round_id = %round_id, version = %new_version, updates = updates.len(), "round aggregated");

            let mut reputation = lock(&self.reputation);
            for update in &updates {
                reputation.record_round_completion(&update.client_id, round_id);
            }
            drop(reputation);

            AggregateOutcome::aggregated(round_id, new_version, document, updates.len())
        };

        lock(&self.rounds).set_state(round_id, RoundState::Closed);
        lock(&self.closer).mark_closed(round_id);
        lock(&self.limiter).reset_round(round_id);
        {
            let mut metrics = lock(&self.metrics);
            metrics.complete_aggregation(round_id);
            metrics.end_round(round_id);
        }

        lock(&self.aggregator).store_result(outcome.clone());
        Some(outcome)
    }

    /// Evaluate the readiness predicate for every open round and close
    /// the ones whose trigger fires. Driven by the ticker and by
    /// submissions that complete a quorum.
    pub fn close_ready_rounds(&self) {
        let candidates = lock(&self.rounds).open_rounds();
        for (round_id, updates, assigned) in candidates {
            let fire = {
                let mut closer = lock(&self.closer);
                closer.enabled()
                    && closer.ready(round_id, updates, assigned)
                    && closer.take_ready_fire(round_id)
            };
            if fire {
                info!(round_id = %round_id, updates, assigned, "round ready, closing");
                self.aggregate_round(round_id);
            }
        }
    }

    fn close_if_ready(&self, round_id: RoundId) {
        let counts = lock(&self.rounds)
            .round(round_id)
            .map(|r| (r.updates_received.len(), r.assigned_clients.len()));
        let Some((updates, assigned)) = counts else {
            return;
        };
        let fire = {
            let mut closer = lock(&self.closer);
            closer.enabled()
                && closer.ready(round_id, updates, assigned)
                && closer.take_ready_fire(round_id)
        };
        if fire {
            info!(round_id = %round_id, updates, assigned, "quorum reached, closing round");
            self.aggregate_round(round_id);
        }
    }

    // ========================================================================
    // Read-side snapshots
    // ========================================================================

    pub fn round_status(&self, round_id: RoundId) -> Option<RoundSnapshot> {
        lock(&self.rounds).status(round_id)
    }

    pub fn model(&self, version: &str) -> Result<serde_json::Value, ModelError> {
        let version: ModelVersion = version.parse().map_err(|_| ModelError::NotFound)?;
        match self.store.load(&version) {
            Ok(document) => Ok(document),
            Err(StoreError::NotFound(_)) => Err(ModelError::NotFound),
            Err(e) => Err(ModelError::Store(e)),
        }
    }

    pub fn metrics_report(&self) -> MetricsReport {
        lock(&self.metrics).report()
    }

    pub fn latest_round_metrics(&self) -> Option<RoundMetricsReport> {
        lock(&self.metrics).latest_report()
    }

    pub fn round_metrics(&self, round_id: RoundId) -> Option<RoundMetricsReport> {
        lock(&self.metrics).round_report(round_id)
    }

    pub fn reputation_of(&self, client_id: &str) -> Option<ReputationSnapshot> {
        lock(&self.reputation).snapshot(client_id)
    }

    pub fn reputation_roster(&self) -> Vec<ReputationSnapshot> {
        lock(&self.reputation).roster()
    }

    pub fn incentives_of(&self, client_id: &str) -> Option<IncentiveSnapshot> {
        lock(&self.incentives).snapshot(client_id)
    }

    pub fn incentive_roster(&self) -> Vec<IncentiveSnapshot> {
        lock(&self.incentives).roster()
    }

    pub fn async_round_stats(&self, round_id: RoundId) -> Option<AsyncRoundStats> {
        let (updates, assigned) = {
            let rounds = lock(&self.rounds);
            let round = rounds.round(round_id)?;
            (round.updates_received.len(), round.assigned_clients.len())
        };
        Some(lock(&self.closer).stats(round_id, updates, assigned))
    }
}

/// Poison-tolerant lock: a panicked holder leaves the data in place and
/// the coordinator keeps serving.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

//! Round lifecycle and membership bookkeeping.
//!
//! Owns the registered-client set, the round map, and the
//! client -> active-round assignments. Round ids are handed out from a
//! monotone counter; the map is keyed by id, so iteration order is
//! creation order.

use fedflow_protocol::{ModelVersion, RoundId, RoundSnapshot, RoundState};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct Round {
    pub id: RoundId,
    pub model_version: ModelVersion,
    pub state: RoundState,
    pub assigned_clients: BTreeSet<String>,
    pub updates_received: BTreeSet<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Round {
    fn new(id: RoundId, model_version: ModelVersion) -> Self {
        Self {
            id,
            model_version,
            state: RoundState::Open,
            assigned_clients: BTreeSet::new(),
            updates_received: BTreeSet::new(),
            created_at: chrono::Utc::now(),
        }
    }

    /// Every assigned client has submitted; the round takes no more
    /// members.
    pub fn is_saturated(&self) -> bool {
        !self.assigned_clients.is_empty()
            && self.updates_received.len() >= self.assigned_clients.len()
    }

    pub fn snapshot(&self) -> RoundSnapshot {
        RoundSnapshot {
            round_id: self.id,
            model_version: self.model_version.clone(),
            state: self.state,
            assigned_clients: self.assigned_clients.iter().cloned().collect(),
            updates_received: self.updates_received.iter().cloned().collect(),
            total_clients: self.assigned_clients.len(),
            total_updates: self.updates_received.len(),
        }
    }
}

/// Result of assigning a client to a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub round_id: RoundId,
    /// The round was created by this assignment.
    pub round_created: bool,
}

/// Outcome of recording an update against a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// First accepted update from this client for this round.
    First,
    /// The client had already submitted; the stored delta is replaced
    /// but no counters move.
    Resubmission,
    /// The update is not admissible for this round.
    Rejected,
}

#[derive(Default)]
pub struct RoundManager {
    clients: BTreeSet<String>,
    rounds: BTreeMap<RoundId, Round>,
    active_assignments: HashMap<String, RoundId>,
    next_round_id: u64,
}

impl RoundManager {
    pub fn new() -> Self {
        Self {
            clients: BTreeSet::new(),
            rounds: BTreeMap::new(),
            active_assignments: HashMap::new(),
            next_round_id: 1,
        }
    }

    /// Register a client. Returns false if the name is already taken.
    pub fn register_client(&mut self, client_id: &str) -> bool {
        self.clients.insert(client_id.to_string())
    }

    pub fn is_registered(&self, client_id: &str) -> bool {
        self.clients.contains(client_id)
    }

    /// Assign a client to a round training against `model_version`.
    ///
    /// Returns `None` when the client is unknown, or when it already
    /// holds a live assignment at this version (the caller should
    /// re-serve the existing task). A stale assignment (version
    /// mismatch, or a saturated round) is cleared and replaced.
    pub fn assign(&mut self, client_id: &str, model_version: &ModelVersion) -> Option<Assignment> {
        if !self.clients.contains(client_id) {
            return None;
        }

        if let Some(assigned_id) = self.active_assignments.get(client_id).copied() {
            if let Some(round) = self.rounds.get(&assigned_id) {
                if round.is_saturated() {
                    self.active_assignments.remove(client_id);
                } else if matches!(round.state, RoundState::Open | RoundState::Collecting) {
                    if round.model_version == *model_version {
                        return None;
                    }
                    // The coordinator moved on to a newer model while
                    // this client sat on an old assignment.
                    self.active_assignments.remove(client_id);
                }
            } else {
                self.active_assignments.remove(client_id);
            }
        }

        // First open, unsaturated round at this version wins; map
        // iteration is creation order.
        let existing = self
            .rounds
            .values()
            .find(|round| {
                matches!(round.state, RoundState::Open | RoundState::Collecting)
                    && round.model_version == *model_version
                    && !round.is_saturated()
            })
            .map(|round| round.id);

        let (round_id, round_created) = match existing {
            Some(id) => (id, false),
            None => {
                let id = RoundId::new(self.next_round_id);
                self.next_round_id += 1;
                self.rounds
                    .insert(id, Round::new(id, model_version.clone()));
                debug!(round_id = %id, version = %model_version, "created round");
                (id, true)
            }
        };

        let round = self
            .rounds
            .get_mut(&round_id)
            .unwrap_or_else(|| unreachable!("round {round_id} inserted above"));
        round.assigned_clients.insert(client_id.to_string());
        if round.state == RoundState::Open {
            round.state = RoundState::Collecting;
        }
        self.active_assignments
            .insert(client_id.to_string(), round_id);

        Some(Assignment {
            round_id,
            round_created,
        })
    }

    /// Whether an update from `client_id` against `round_id` is
    /// admissible: registered client, known round, assigned membership,
    /// and a state that still accepts updates.
    pub fn validate_update(&self, client_id: &str, round_id: RoundId) -> bool {
        if !self.clients.contains(client_id) {
            return false;
        }
        let Some(round) = self.rounds.get(&round_id) else {
            return false;
        };
        round.assigned_clients.contains(client_id) && round.state.accepts_updates()
    }

    /// Record that a client submitted an update.
    pub fn record_update(&mut self, client_id: &str, round_id: RoundId) -> RecordOutcome {
        if !self.validate_update(client_id, round_id) {
            return RecordOutcome::Rejected;
        }
        let round = self
            .rounds
            .get_mut(&round_id)
            .unwrap_or_else(|| unreachable!("validated above"));
        if round.updates_received.insert(client_id.to_string()) {
            RecordOutcome::First
        } else {
            RecordOutcome::Resubmission
        }
    }

    /// Move a round to `state`, enforcing the transition graph.
    pub fn set_state(&mut self, round_id: RoundId, state: RoundState) -> bool {
        let Some(round) = self.rounds.get_mut(&round_id) else {
            return false;
        };
        if !round.state.can_transition(state) {
            debug!(
                round_id = %round_id,
                from = %round.state,
                to = %state,
                "illegal round state transition refused"
            );
            return false;
        }
        round.state = state;
        true
    }

    pub fn round(&self, round_id: RoundId) -> Option<&Round> {
        self.rounds.get(&round_id)
    }

    pub fn status(&self, round_id: RoundId) -> Option<RoundSnapshot> {
        self.rounds.get(&round_id).map(Round::snapshot)
    }

    /// Ids and membership counts of every round that is not yet closed.
    pub fn open_rounds(&self) -> Vec<(RoundId, usize, usize)> {
        self.rounds
            .values()
            .filter(|round| !round.state.is_terminal())
            .map(|round| {
                (
                    round.id,
                    round.updates_received.len(),
                    round.assigned_clients.len(),
                )
            })
            .collect()
    }

    /// The round a client is currently assigned to, if any is live.
    pub fn active_round_of(&self, client_id: &str) -> Option<RoundId> {
        self.active_assignments.get(client_id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v1() -> ModelVersion {
        ModelVersion::initial()
    }

    fn v2() -> ModelVersion {
        v1().next()
    }

    #[test]
    fn test_register_is_idempotent_safe() {
        let mut rm = RoundManager::new();
        assert!(rm.register_client("a"));
        assert!(!rm.register_client("a"));
        assert!(rm.is_registered("a"));
    }

    #[test]
    fn test_assign_unknown_client() {
        let mut rm = RoundManager::new();
        assert_eq!(rm.assign("ghost", &v1()), None);
    }

    #[test]
    fn test_two_clients_share_a_round() {
        let mut rm = RoundManager::new();
        rm.register_client("a");
        rm.register_client("b");

        let a = rm.assign("a", &v1()).unwrap();
        assert!(a.round_created);
        assert_eq!(a.round_id, RoundId::new(1));

        let b = rm.assign("b", &v1()).unwrap();
        assert!(!b.round_created);
        assert_eq!(b.round_id, RoundId::new(1));

        let snapshot = rm.status(RoundId::new(1)).unwrap();
        assert_eq!(snapshot.state, RoundState::Collecting);
        assert_eq!(snapshot.total_clients, 2);
    }

    #[test]
    fn test_live_assignment_is_not_duplicated() {
        let mut rm = RoundManager::new();
        rm.register_client("a");
        rm.assign("a", &v1()).unwrap();
        // Same version, round still live: caller should re-serve the
        // existing task.
        assert_eq!(rm.assign("a", &v1()), None);
        assert_eq!(rm.active_round_of("a"), Some(RoundId::new(1)));
    }

    #[test]
    fn test_version_mismatch_clears_assignment() {
        let mut rm = RoundManager::new();
        rm.register_client("a");
        rm.assign("a", &v1()).unwrap();

        let again = rm.assign("a", &v2()).unwrap();
        assert_eq!(again.round_id, RoundId::new(2));
        assert!(again.round_created);
        assert_eq!(rm.active_round_of("a"), Some(RoundId::new(2)));
    }

    #[test]
    fn test_saturated_round_spawns_new_round() {
        let mut rm = RoundManager::new();
        rm.register_client("a");
        rm.assign("a", &v1()).unwrap();
        assert_eq!(rm.record_update("a", RoundId::new(1)), RecordOutcome::First);

        // Round 1 is saturated (1/1); a new assignment at the same
        // version must open round 2.
        let next = rm.assign("a", &v1()).unwrap();
        assert_eq!(next.round_id, RoundId::new(2));
        assert!(next.round_created);
    }

    #[test]
    fn test_round_ids_strictly_increase() {
        let mut rm = RoundManager::new();
        rm.register_client("a");
        let mut last = 0;
        for _ in 0..5 {
            let assignment = rm.assign("a", &v1()).unwrap();
            rm.record_update("a", assignment.round_id);
            assert!(assignment.round_id.as_u64() > last);
            last = assignment.round_id.as_u64();
        }
    }

    #[test]
    fn test_validate_update_requirements() {
        let mut rm = RoundManager::new();
        rm.register_client("a");
        rm.register_client("b");
        rm.assign("a", &v1()).unwrap();

        assert!(rm.validate_update("a", RoundId::new(1)));
        // b is registered but not assigned to round 1.
        assert!(!rm.validate_update("b", RoundId::new(1)));
        assert!(!rm.validate_update("ghost", RoundId::new(1)));
        assert!(!rm.validate_update("a", RoundId::new(99)));
    }

    #[test]
    fn test_updates_stay_subset_of_assigned() {
        let mut rm = RoundManager::new();
        rm.register_client("a");
        rm.register_client("b");
        rm.assign("a", &v1()).unwrap();
        rm.assign("b", &v1()).unwrap();
        rm.record_update("a", RoundId::new(1));

        let round = rm.round(RoundId::new(1)).unwrap();
        assert!(round.updates_received.is_subset(&round.assigned_clients));
    }

    #[test]
    fn test_resubmission_detected() {
        let mut rm = RoundManager::new();
        rm.register_client("a");
        rm.assign("a", &v1()).unwrap();

        assert_eq!(rm.record_update("a", RoundId::new(1)), RecordOutcome::First);
        assert_eq!(
            rm.record_update("a", RoundId::new(1)),
            RecordOutcome::Resubmission
        );
    }

    #[test]
    fn test_no_updates_after_close() {
        let mut rm = RoundManager::new();
        rm.register_client("a");
        rm.register_client("b");
        rm.assign("a", &v1()).unwrap();
        rm.assign("b", &v1()).unwrap();
        rm.record_update("a", RoundId::new(1));

        assert!(rm.set_state(RoundId::new(1), RoundState::Aggregating));
        // Updates still land during aggregation...
        assert_eq!(rm.record_update("b", RoundId::new(1)), RecordOutcome::First);
        assert!(rm.set_state(RoundId::new(1), RoundState::Closed));
        // ...but not after close.
        assert_eq!(
            rm.record_update("b", RoundId::new(1)),
            RecordOutcome::Rejected
        );
    }

    #[test]
    fn test_transition_graph_enforced() {
        let mut rm = RoundManager::new();
        rm.register_client("a");
        rm.assign("a", &v1()).unwrap();
        let id = RoundId::new(1);

        // COLLECTING -> CLOSED skips AGGREGATING.
        assert!(!rm.set_state(id, RoundState::Closed));
        assert!(rm.set_state(id, RoundState::Aggregating));
        // AGGREGATING re-entry is forbidden.
        assert!(!rm.set_state(id, RoundState::Aggregating));
        assert!(rm.set_state(id, RoundState::Closed));
        assert!(!rm.set_state(id, RoundState::Aggregating));
        assert!(!rm.set_state(RoundId::new(42), RoundState::Closed));
    }

    #[test]
    fn test_at_most_one_active_assignment() {
        let mut rm = RoundManager::new();
        rm.register_client("a");
        rm.assign("a", &v1()).unwrap();
        rm.assign("a", &v2()).unwrap();

        // Only the v2 round counts "a" among its assigned set with a
        // live assignment pointer.
        let live: Vec<_> = rm
            .open_rounds()
            .iter()
            .map(|(id, _, _)| *id)
            .filter(|id| rm.active_round_of("a") == Some(*id))
            .collect();
        assert_eq!(live.len(), 1);
    }
}

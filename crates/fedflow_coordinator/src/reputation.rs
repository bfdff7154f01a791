//! Per-client reliability accounting.
//!
//! Counters move on every admission decision; the derived reputation
//! score is the convex combination
//! `0.4*completion + 0.3*acceptance + 0.2*(1 - dropout) + 0.1*latency`
//! clamped to [0, 1], where the latency term decays linearly to zero at
//! one minute of average latency.

use chrono::{DateTime, Utc};
use fedflow_protocol::RoundId;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

const MAX_REASONABLE_LATENCY_S: f64 = 60.0;

#[derive(Debug, Clone)]
pub struct ClientReputation {
    pub client_id: String,

    pub rounds_participated: u64,
    pub rounds_completed: u64,
    pub rounds_dropped: u64,

    pub updates_submitted: u64,
    pub updates_accepted: u64,
    pub updates_rejected: u64,

    pub latency_sum_s: f64,
    pub latency_samples: u64,

    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl ClientReputation {
    fn new(client_id: &str) -> Self {
        let now = Utc::now();
        Self {
            client_id: client_id.to_string(),
            rounds_participated: 0,
            rounds_completed: 0,
            rounds_dropped: 0,
            updates_submitted: 0,
            updates_accepted: 0,
            updates_rejected: 0,
            latency_sum_s: 0.0,
            latency_samples: 0,
            first_seen: now,
            last_seen: now,
        }
    }

    pub fn dropout_rate(&self) -> f64 {
        ratio(self.rounds_dropped, self.rounds_participated, 0.0)
    }

    pub fn completion_rate(&self) -> f64 {
        ratio(self.rounds_completed, self.rounds_participated, 0.0)
    }

    /// Clients that never submitted start with the benefit of the
    /// doubt.
    pub fn acceptance_rate(&self) -> f64 {
        ratio(self.updates_accepted, self.updates_submitted, 1.0)
    }

    pub fn average_latency_s(&self) -> f64 {
        if self.latency_samples == 0 {
            0.0
        } else {
            self.latency_sum_s / self.latency_samples as f64
        }
    }

    pub fn score(&self) -> f64 {
        let latency_term =
            (1.0 - self.average_latency_s() / MAX_REASONABLE_LATENCY_S).clamp(0.0, 1.0);
        let score = 0.4 * self.completion_rate()
            + 0.3 * self.acceptance_rate()
            + 0.2 * (1.0 - self.dropout_rate())
            + 0.1 * latency_term;
        score.clamp(0.0, 1.0)
    }
}

fn ratio(num: u64, den: u64, when_empty: f64) -> f64 {
    if den == 0 {
        when_empty
    } else {
        num as f64 / den as f64
    }
}

/// Serialized view of one client's reputation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReputationSnapshot {
    pub client_id: String,
    pub reputation_score: f64,
    pub rounds_participated: u64,
    pub rounds_completed: u64,
    pub rounds_dropped: u64,
    pub completion_rate: f64,
    pub updates_submitted: u64,
    pub updates_accepted: u64,
    pub updates_rejected: u64,
    pub acceptance_rate: f64,
    pub dropout_rate: f64,
    pub average_latency_seconds: f64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl From<&ClientReputation> for ReputationSnapshot {
    fn from(rep: &ClientReputation) -> Self {
        Self {
            client_id: rep.client_id.clone(),
            reputation_score: rep.score(),
            rounds_participated: rep.rounds_participated,
            rounds_completed: rep.rounds_completed,
            rounds_dropped: rep.rounds_dropped,
            completion_rate: rep.completion_rate(),
            updates_submitted: rep.updates_submitted,
            updates_accepted: rep.updates_accepted,
            updates_rejected: rep.updates_rejected,
            acceptance_rate: rep.acceptance_rate(),
            dropout_rate: rep.dropout_rate(),
            average_latency_seconds: rep.average_latency_s(),
            first_seen: rep.first_seen,
            last_seen: rep.last_seen,
        }
    }
}

#[derive(Default)]
pub struct ReputationTracker {
    reputations: HashMap<String, ClientReputation>,
    client_rounds: HashMap<String, HashSet<RoundId>>,
}

impl ReputationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the record if missing and bump `last_seen`. Safe to call
    /// on every touch.
    pub fn register_client(&mut self, client_id: &str) {
        let rep = self
            .reputations
            .entry(client_id.to_string())
            .or_insert_with(|| ClientReputation::new(client_id));
        rep.last_seen = Utc::now();
    }

    pub fn record_round_participation(&mut self, client_id: &str, round_id: RoundId) {
        self.register_client(client_id);
        self.entry(client_id).rounds_participated += 1;
        self.client_rounds
            .entry(client_id.to_string())
            .or_default()
            .insert(round_id);
    }

    /// `latency` is seconds since the round started, when known.
    pub fn record_update_submitted(&mut self, client_id: &str, latency: Option<f64>) {
        self.register_client(client_id);
        let rep = self.entry(client_id);
        rep.updates_submitted += 1;
        if let Some(latency) = latency {
            rep.latency_sum_s += latency;
            rep.latency_samples += 1;
        }
    }

    pub fn record_update_accepted(&mut self, client_id: &str) {
        self.register_client(client_id);
        self.entry(client_id).updates_accepted += 1;
    }

    pub fn record_update_rejected(&mut self, client_id: &str) {
        self.register_client(client_id);
        self.entry(client_id).updates_rejected += 1;
    }

    /// Credit a completion, provided the client actually participated
    /// in the round.
    pub fn record_round_completion(&mut self, client_id: &str, round_id: RoundId) {
        self.register_client(client_id);
        if self.participated(client_id, round_id) {
            self.entry(client_id).rounds_completed += 1;
        }
    }

    pub fn record_round_dropout(&mut self, client_id: &str, round_id: RoundId) {
        self.register_client(client_id);
        if self.participated(client_id, round_id) {
            self.entry(client_id).rounds_dropped += 1;
        }
    }

    pub fn snapshot(&self, client_id: &str) -> Option<ReputationSnapshot> {
        self.reputations.get(client_id).map(ReputationSnapshot::from)
    }

    pub fn roster(&self) -> Vec<ReputationSnapshot> {
        let mut all: Vec<_> = self.reputations.values().map(ReputationSnapshot::from).collect();
        all.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        all
    }

    /// Top clients by score, best first.
    pub fn top_clients(&self, n: usize) -> Vec<(String, f64)> {
        let mut scores: Vec<_> = self
            .reputations
            .values()
            .map(|rep| (rep.client_id.clone(), rep.score()))
            .collect();
        scores.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scores.truncate(n);
        scores
    }

    fn participated(&self, client_id: &str, round_id: RoundId) -> bool {
        self.client_rounds
            .get(client_id)
            .is_some_and(|rounds| rounds.contains(&round_id))
    }

    fn entry(&mut self, client_id: &str) -> &mut ClientReputation {
        self.reputations
            .get_mut(client_id)
            .unwrap_or_else(|| unreachable!("registered before every mutation"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_client_scores_mid_range() {
        let mut tracker = ReputationTracker::new();
        tracker.register_client("a");
        let snap = tracker.snapshot("a").unwrap();
        // 0 completion, perfect acceptance, 0 dropout, 0 latency:
        // 0.0 + 0.3 + 0.2 + 0.1 = 0.6
        assert!((snap.reputation_score - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_perfect_client_scores_one() {
        let mut tracker = ReputationTracker::new();
        let round = RoundId::new(1);
        tracker.record_round_participation("a", round);
        tracker.record_update_submitted("a", Some(0.0));
        tracker.record_update_accepted("a");
        tracker.record_round_completion("a", round);

        let snap = tracker.snapshot("a").unwrap();
        assert!((snap.reputation_score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_score_stays_in_unit_interval() {
        let mut tracker = ReputationTracker::new();
        let round = RoundId::new(1);
        tracker.record_round_participation("a", round);
        // Heavy rejection and huge latency cannot push below 0.
        for _ in 0..10 {
            tracker.record_update_submitted("a", Some(10_000.0));
            tracker.record_update_rejected("a");
        }
        tracker.record_round_dropout("a", round);

        let score = tracker.snapshot("a").unwrap().reputation_score;
        assert!((0.0..=1.0).contains(&score));
    }

    #[test]
    fn test_dropout_requires_participation() {
        let mut tracker = ReputationTracker::new();
        tracker.record_round_participation("a", RoundId::new(1));
        // Round 2 was never joined; the dropout is ignored.
        tracker.record_round_dropout("a", RoundId::new(2));
        assert_eq!(tracker.snapshot("a").unwrap().rounds_dropped, 0);

        tracker.record_round_dropout("a", RoundId::new(1));
        assert_eq!(tracker.snapshot("a").unwrap().rounds_dropped, 1);
    }

    #[test]
    fn test_latency_averaging() {
        let mut tracker = ReputationTracker::new();
        tracker.record_update_submitted("a", Some(10.0));
        tracker.record_update_submitted("a", Some(20.0));
        tracker.record_update_submitted("a", None);
        let snap = tracker.snapshot("a").unwrap();
        assert!((snap.average_latency_seconds - 15.0).abs() < 1e-9);
        assert_eq!(snap.updates_submitted, 3);
    }

    #[test]
    fn test_top_clients_ordering() {
        let mut tracker = ReputationTracker::new();
        let round = RoundId::new(1);
        for id in ["good", "bad"] {
            tracker.record_round_participation(id, round);
            tracker.record_update_submitted(id, Some(1.0));
        }
        tracker.record_update_accepted("good");
        tracker.record_round_completion("good", round);
        tracker.record_update_rejected("bad");
        tracker.record_round_dropout("bad", round);

        let top = tracker.top_clients(10);
        assert_eq!(top[0].0, "good");
        assert!(top[0].1 > top[1].1);
    }

    #[test]
    fn test_roster_is_sorted_by_client() {
        let mut tracker = ReputationTracker::new();
        tracker.register_client("zed");
        tracker.register_client("amy");
        let roster = tracker.roster();
        assert_eq!(roster[0].client_id, "amy");
        assert_eq!(roster[1].client_id, "zed");
    }
}

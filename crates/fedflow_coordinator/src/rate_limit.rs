//! Per-client request and update ceilings.
//!
//! Requests are bounded by two sliding windows (60s and 3600s) over
//! recorded timestamps; old entries are purged lazily on each check.
//! Updates are bounded per (client, round) pair; those counters are
//! dropped when the round closes.

use fedflow_protocol::RoundId;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::{Duration, Instant};

use crate::config::RateLimitConfig;

const MINUTE_WINDOW: Duration = Duration::from_secs(60);
const HOUR_WINDOW: Duration = Duration::from_secs(3600);

/// Which ceiling a refused request ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateReason {
    PerMinute,
    PerHour,
    PerRound,
}

impl RateReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateReason::PerMinute => "per_minute",
            RateReason::PerHour => "per_hour",
            RateReason::PerRound => "per_round",
        }
    }
}

impl fmt::Display for RateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Point-in-time rate usage for one client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateStats {
    pub requests_last_minute: usize,
    pub requests_last_hour: usize,
    pub rounds_with_updates: usize,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    request_times: HashMap<String, Vec<Instant>>,
    updates_per_round: HashMap<String, HashMap<RoundId, u32>>,
    round_clients: HashMap<RoundId, HashSet<String>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            request_times: HashMap::new(),
            updates_per_round: HashMap::new(),
            round_clients: HashMap::new(),
        }
    }

    /// Admit or refuse a request; admission records the timestamp.
    pub fn check_request(&mut self, client_id: &str) -> Result<(), RateReason> {
        let now = Instant::now();
        let timestamps = self.request_times.entry(client_id.to_string()).or_default();

        // Lazy purge: anything older than the hour window is dead weight.
        timestamps.retain(|t| now.duration_since(*t) < HOUR_WINDOW);

        if timestamps.len() >= self.config.max_requests_per_hour {
            return Err(RateReason::PerHour);
        }

        let last_minute = timestamps
            .iter()
            .filter(|t| now.duration_since(**t) < MINUTE_WINDOW)
            .count();
        if last_minute >= self.config.max_requests_per_minute {
            return Err(RateReason::PerMinute);
        }

        timestamps.push(now);
        Ok(())
    }

    /// Whether the client may submit another update against `round`.
    /// Does not record anything.
    pub fn check_update(&self, client_id: &str, round: RoundId) -> Result<(), RateReason> {
        let count = self
            .updates_per_round
            .get(client_id)
            .and_then(|rounds| rounds.get(&round))
            .copied()
            .unwrap_or(0);
        if count >= self.config.max_updates_per_round {
            return Err(RateReason::PerRound);
        }
        Ok(())
    }

    /// Called when an update is accepted.
    pub fn record_update(&mut self, client_id: &str, round: RoundId) {
        let rounds = self
            .updates_per_round
            .entry(client_id.to_string())
            .or_default();
        *rounds.entry(round).or_insert(0) += 1;
        self.round_clients
            .entry(round)
            .or_default()
            .insert(client_id.to_string());
    }

    /// Drop all per-round counters for a closed round.
    pub fn reset_round(&mut self, round: RoundId) {
        if let Some(clients) = self.round_clients.remove(&round) {
            for client_id in clients {
                if let Some(rounds) = self.updates_per_round.get_mut(&client_id) {
                    rounds.remove(&round);
                    if rounds.is_empty() {
                        self.updates_per_round.remove(&client_id);
                    }
                }
            }
        }
    }

    pub fn client_stats(&self, client_id: &str) -> RateStats {
        let now = Instant::now();
        let timestamps = self.request_times.get(client_id);
        let count_within = |window: Duration| {
            timestamps
                .map(|ts| {
                    ts.iter()
                        .filter(|t| now.duration_since(**t) < window)
                        .count()
                })
                .unwrap_or(0)
        };
        RateStats {
            requests_last_minute: count_within(MINUTE_WINDOW),
            requests_last_hour: count_within(HOUR_WINDOW),
            rounds_with_updates: self
                .updates_per_round
                .get(client_id)
                .map(HashMap::len)
                .unwrap_or(0),
        }
    }
}

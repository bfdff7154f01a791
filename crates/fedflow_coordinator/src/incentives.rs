//! Token rewards for accepted updates.
//!
//! Rewards are simulation currency, not money. Every accepted update
//! earns the base reward; fast submissions earn a 50% speed bonus, and
//! a streak of consecutive accepted updates earns a 30% consistency
//! bonus (the streak resets on award and on dropout).

use chrono::{DateTime, Utc};
use fedflow_protocol::RoundId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::IncentiveConfig;

/// One reward grant in a client's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardEntry {
    pub round_id: RoundId,
    pub tokens: f64,
    pub base: f64,
    pub speed_bonus: f64,
    pub consistency_bonus: f64,
    pub awarded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct ClientIncentives {
    pub total_earned: f64,
    pub total_spent: f64,
    pub rewards: Vec<RewardEntry>,
    pub speed_bonuses: u64,
    pub consistency_bonuses: u64,
}

impl ClientIncentives {
    pub fn balance(&self) -> f64 {
        self.total_earned - self.total_spent
    }
}

/// Serialized view of one client's ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncentiveSnapshot {
    pub client_id: String,
    pub total_tokens_earned: f64,
    pub tokens_spent: f64,
    pub current_balance: f64,
    pub speed_bonuses: u64,
    pub consistency_bonuses: u64,
    pub total_rewards: usize,
}

pub struct IncentiveLedger {
    config: IncentiveConfig,
    clients: HashMap<String, ClientIncentives>,
    streaks: HashMap<String, u32>,
}

impl IncentiveLedger {
    pub fn new(config: IncentiveConfig) -> Self {
        Self {
            config,
            clients: HashMap::new(),
            streaks: HashMap::new(),
        }
    }

    /// Award tokens for an accepted update; returns the total granted.
    ///
    /// `latency` is seconds from round start to submission, when known.
    pub fn award(&mut self, client_id: &str, round_id: RoundId, latency: Option<f64>) -> f64 {
        let base = self.config.base_reward;
        let client = self.clients.entry(client_id.to_string()).or_default();

        let mut tokens = base;

        let speed_bonus = match latency {
            Some(latency) if latency < self.config.speed_threshold.as_secs_f64() => {
                client.speed_bonuses += 1;
                base * 0.5
            }
            _ => 0.0,
        };
        tokens += speed_bonus;

        let streak = self.streaks.entry(client_id.to_string()).or_insert(0);
        let consistency_bonus = if *streak >= self.config.consistency_threshold {
            client.consistency_bonuses += 1;
            *streak = 0;
            base * 0.3
        } else {
            0.0
        };
        tokens += consistency_bonus;

        client.total_earned += tokens;
        client.rewards.push(RewardEntry {
            round_id,
            tokens,
            base,
            speed_bonus,
            consistency_bonus,
            awarded_at: Utc::now(),
        });

        *self.streaks.entry(client_id.to_string()).or_insert(0) += 1;
        tokens
    }

    /// A dropout breaks the streak without awarding anything.
    pub fn record_dropout(&mut self, client_id: &str) {
        self.streaks.insert(client_id.to_string(), 0);
    }

    pub fn balance(&self, client_id: &str) -> f64 {
        self.clients
            .get(client_id)
            .map(ClientIncentives::balance)
            .unwrap_or(0.0)
    }

    pub fn snapshot(&self, client_id: &str) -> Option<IncentiveSnapshot> {
        self.clients.get(client_id).map(|c| IncentiveSnapshot {
            client_id: client_id.to_string(),
            total_tokens_earned: c.total_earned,
            tokens_spent: c.total_spent,
            current_balance: c.balance(),
            speed_bonuses: c.speed_bonuses,
            consistency_bonuses: c.consistency_bonuses,
            total_rewards: c.rewards.len(),
        })
    }

    pub fn roster(&self) -> Vec<IncentiveSnapshot> {
        let mut all: Vec<_> = self
            .clients
            .keys()
            .filter_map(|id| self.snapshot(id))
            .collect();
        all.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        all
    }

    /// Top clients by lifetime earnings, best first.
    pub fn top_earners(&self, n: usize) -> Vec<(String, f64)> {
        let mut earners: Vec<_> = self
            .clients
            .iter()
            .map(|(id, c)| (id.clone(), c.total_earned))
            .collect();
        earners.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        earners.truncate(n);
        earners
    }

    pub fn rewards_of(&self, client_id: &str) -> &[RewardEntry] {
        self.clients
            .get(client_id)
            .map(|c| c.rewards.as_slice())
            .unwrap_or(&[])
    }
}

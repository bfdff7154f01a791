//! Per-round counters and their persistence.
//!
//! Counters live in memory while a round runs. When the round ends, a
//! JSON summary (`round_<id>.json`) is written to the metrics directory
//! and one human-readable paragraph is appended to the rolling
//! `rounds.log`. Global counters track distinct clients seen and total
//! rejects.

use chrono::Utc;
use fedflow_protocol::{ModelVersion, RoundId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Metrics for a single round. Timestamps are unix seconds; durations
/// are derived on read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundMetrics {
    pub round_id: RoundId,
    pub model_version: ModelVersion,
    pub round_start_time: f64,
    pub round_end_time: Option<f64>,

    pub clients_assigned: u64,
    pub updates_received: u64,
    pub updates_accepted: u64,
    pub updates_rejected: u64,

    pub aggregation_start_time: Option<f64>,
    pub aggregation_end_time: Option<f64>,
}

impl RoundMetrics {
    fn new(round_id: RoundId, model_version: ModelVersion) -> Self {
        Self {
            round_id,
            model_version,
            round_start_time: unix_now(),
            round_end_time: None,
            clients_assigned: 0,
            updates_received: 0,
            updates_accepted: 0,
            updates_rejected: 0,
            aggregation_start_time: None,
            aggregation_end_time: None,
        }
    }

    pub fn round_duration_seconds(&self) -> Option<f64> {
        self.round_end_time.map(|end| end - self.round_start_time)
    }

    pub fn aggregation_time_seconds(&self) -> Option<f64> {
        match (self.aggregation_start_time, self.aggregation_end_time) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    fn report(&self) -> RoundMetricsReport {
        RoundMetricsReport {
            metrics: self.clone(),
            round_duration_seconds: self.round_duration_seconds(),
            aggregation_time_seconds: self.aggregation_time_seconds(),
        }
    }
}

/// A round's metrics with the derived durations attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundMetricsReport {
    #[serde(flatten)]
    pub metrics: RoundMetrics,
    pub round_duration_seconds: Option<f64>,
    pub aggregation_time_seconds: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalMetrics {
    pub total_clients_seen: usize,
    pub total_failed_updates: u64,
    pub total_rounds: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsReport {
    pub global: GlobalMetrics,
    pub rounds: BTreeMap<u64, RoundMetricsReport>,
}

pub struct MetricsCollector {
    metrics_dir: PathBuf,
    logs_dir: PathBuf,
    rounds: BTreeMap<RoundId, RoundMetrics>,
    clients_seen: HashSet<String>,
    total_rejected: u64,
}

impl MetricsCollector {
    pub fn open(
        metrics_dir: impl Into<PathBuf>,
        logs_dir: impl Into<PathBuf>,
    ) -> std::io::Result<Self> {
        let metrics_dir = metrics_dir.into();
        let logs_dir = logs_dir.into();
        fs::create_dir_all(&metrics_dir)?;
        fs::create_dir_all(&logs_dir)?;
        Ok(Self {
            metrics_dir,
            logs_dir,
            rounds: BTreeMap::new(),
            clients_seen: HashSet::new(),
            total_rejected: 0,
        })
    }

    pub fn note_client(&mut self, client_id: &str) {
        self.clients_seen.insert(client_id.to_string());
    }

    pub fn start_round(&mut self, round_id: RoundId, model_version: ModelVersion) {
        self.rounds
            .entry(round_id)
            .or_insert_with(|| RoundMetrics::new(round_id, model_version));
    }

    pub fn is_tracking(&self, round_id: RoundId) -> bool {
        self.rounds.contains_key(&round_id)
    }

    pub fn record_client_assigned(&mut self, round_id: RoundId, client_id: &str) {
        self.clients_seen.insert(client_id.to_string());
        if let Some(m) = self.rounds.get_mut(&round_id) {
            m.clients_assigned += 1;
        }
    }

    pub fn record_update_received(&mut self, round_id: RoundId) {
        if let Some(m) = self.rounds.get_mut(&round_id) {
            m.updates_received += 1;
        }
    }

    pub fn record_update_accepted(&mut self, round_id: RoundId) {
        if let Some(m) = self.rounds.get_mut(&round_id) {
            m.updates_accepted += 1;
        }
    }

    pub fn record_update_rejected(&mut self, round_id: RoundId) {
        self.total_rejected += 1;
        if let Some(m) = self.rounds.get_mut(&round_id) {
            m.updates_rejected += 1;
        }
    }

    pub fn start_aggregation(&mut self, round_id: RoundId) {
        if let Some(m) = self.rounds.get_mut(&round_id) {
            m.aggregation_start_time = Some(unix_now());
        }
    }

    pub fn complete_aggregation(&mut self, round_id: RoundId) {
        if let Some(m) = self.rounds.get_mut(&round_id) {
            m.aggregation_end_time = Some(unix_now());
        }
    }

    /// Stamp the end of a round and persist its summary. Persistence
    /// failures are logged, never fatal.
    pub fn end_round(&mut self, round_id: RoundId) {
        let Some(m) = self.rounds.get_mut(&round_id) else {
            return;
        };
        m.round_end_time = Some(unix_now());
        let report = m.report();

        if let Err(e) = self.persist_round(&report) {
            warn!(round_id = %round_id, error = %e, "failed to persist round metrics");
        }
        if let Err(e) = self.append_round_log(&report) {
            warn!(round_id = %round_id, error = %e, "failed to append round log");
        }
    }

    fn persist_round(&self, report: &RoundMetricsReport) -> std::io::Result<()> {
        let path = self
            .metrics_dir
            .join(format!("round_{}.json", report.metrics.round_id));
        let body = serde_json::to_vec_pretty(report)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        fs::write(path, body)
    }

    fn append_round_log(&self, report: &RoundMetricsReport) -> std::io::Result<()> {
        let m = &report.metrics;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.logs_dir.join("rounds.log"))?;

        writeln!(
            file,
            "[{}] Round {} (Model {})",
            Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            m.round_id,
            m.model_version
        )?;
        writeln!(file, "  Clients assigned: {}", m.clients_assigned)?;
        writeln!(file, "  Updates received: {}", m.updates_received)?;
        writeln!(file, "  Updates accepted: {}", m.updates_accepted)?;
        writeln!(file, "  Updates rejected: {}", m.updates_rejected)?;
        if let Some(duration) = report.round_duration_seconds {
            writeln!(file, "  Round duration: {duration:.2}s")?;
        }
        if let Some(duration) = report.aggregation_time_seconds {
            writeln!(file, "  Aggregation time: {duration:.2}s")?;
        }
        writeln!(file)
    }

    /// Metrics for one round: in-memory first, then the persisted file.
    pub fn round_report(&self, round_id: RoundId) -> Option<RoundMetricsReport> {
        if let Some(m) = self.rounds.get(&round_id) {
            return Some(m.report());
        }
        let path = self.metrics_dir.join(format!("round_{round_id}.json"));
        let raw = fs::read(path).ok()?;
        serde_json::from_slice(&raw).ok()
    }

    pub fn latest_report(&self) -> Option<RoundMetricsReport> {
        self.rounds.values().next_back().map(RoundMetrics::report)
    }

    pub fn report(&self) -> MetricsReport {
        MetricsReport {
            global: GlobalMetrics {
                total_clients_seen: self.clients_seen.len(),
                total_failed_updates: self.total_rejected,
                total_rounds: self.rounds.len(),
            },
            rounds: self
                .rounds
                .iter()
                .map(|(id, m)| (id.as_u64(), m.report()))
                .collect(),
        }
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

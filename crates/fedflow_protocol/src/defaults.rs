//! Canonical default values shared across the coordinator and tooling.

/// Control plane bind address for the coordinator.
pub const DEFAULT_BIND_ADDR: &str = "tcp://127.0.0.1:5600";

/// Minimum accepted updates before an async round may close (quorum).
pub const DEFAULT_MIN_UPDATES: usize = 2;
/// Wall-clock round timeout in seconds.
pub const DEFAULT_MAX_ROUND_DURATION_S: f64 = 300.0;

/// Per-client request ceiling over a sliding 60 second window.
pub const DEFAULT_MAX_REQUESTS_PER_MINUTE: usize = 60;
/// Per-client request ceiling over a sliding 3600 second window.
pub const DEFAULT_MAX_REQUESTS_PER_HOUR: usize = 1000;
/// Per-client update ceiling against any single round.
pub const DEFAULT_MAX_UPDATES_PER_ROUND: u32 = 5;

/// L2 clipping bound applied to each tensor of a weight delta.
pub const DEFAULT_PRIVACY_MAX_NORM: f64 = 10.0;
/// Standard deviation of the optional additive gaussian noise.
pub const DEFAULT_PRIVACY_NOISE_SCALE: f64 = 0.01;

/// Tokens awarded for each accepted update.
pub const DEFAULT_INCENTIVE_BASE_REWARD: f64 = 10.0;
/// Latency below which an accepted update earns the speed bonus.
pub const DEFAULT_INCENTIVE_SPEED_THRESHOLD_S: f64 = 30.0;
/// Consecutive accepted updates required for the consistency bonus.
pub const DEFAULT_INCENTIVE_CONSISTENCY_THRESHOLD: u32 = 5;

/// The only task kind the coordinator currently hands out.
pub const TASK_KIND_TRAIN: &str = "train";

/// File name prefix for persisted model artifacts (`model_v<N>.json`).
pub const MODEL_FILE_PREFIX: &str = "model_";

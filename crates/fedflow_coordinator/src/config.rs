//! Coordinator configuration.
//!
//! Every knob is settable both as a CLI flag and through the
//! environment; the environment names are the stable interface that
//! deployment scripts rely on.

use clap::Parser;
use fedflow_protocol::defaults;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "fedflow-coordinator", about = "Fedflow federated training coordinator")]
pub struct CoordinatorArgs {
    /// ZMQ bind address for the control plane
    #[arg(long, env = "FEDFLOW_BIND", default_value_t = defaults::DEFAULT_BIND_ADDR.to_string())]
    pub bind: String,

    /// Data directory (models, metrics, round log)
    #[arg(long, env = "FEDFLOW_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Minimum accepted updates before an async round may close
    #[arg(long, env = "MIN_UPDATES", default_value_t = defaults::DEFAULT_MIN_UPDATES)]
    pub min_updates: usize,

    /// Wall-clock round timeout in seconds
    #[arg(long, env = "MAX_ROUND_DURATION_S", default_value_t = defaults::DEFAULT_MAX_ROUND_DURATION_S)]
    pub max_round_duration_s: f64,

    /// Close rounds on quorum or timeout instead of waiting for every client
    #[arg(long, env = "ENABLE_ASYNC", default_value_t = false)]
    pub enable_async: bool,

    /// Per-client request ceiling over a sliding minute
    #[arg(long, env = "MAX_REQUESTS_PER_MINUTE", default_value_t = defaults::DEFAULT_MAX_REQUESTS_PER_MINUTE)]
    pub max_requests_per_minute: usize,

    /// Per-client request ceiling over a sliding hour
    #[arg(long, env = "MAX_REQUESTS_PER_HOUR", default_value_t = defaults::DEFAULT_MAX_REQUESTS_PER_HOUR)]
    pub max_requests_per_hour: usize,

    /// Per-client update ceiling against a single round
    #[arg(long, env = "MAX_UPDATES_PER_ROUND", default_value_t = defaults::DEFAULT_MAX_UPDATES_PER_ROUND)]
    pub max_updates_per_round: u32,

    /// L2 clipping bound for each tensor of a weight delta
    #[arg(long, env = "PRIVACY_MAX_NORM", default_value_t = defaults::DEFAULT_PRIVACY_MAX_NORM)]
    pub privacy_max_norm: f64,

    /// Standard deviation of the additive gaussian noise
    #[arg(long, env = "PRIVACY_NOISE_SCALE", default_value_t = defaults::DEFAULT_PRIVACY_NOISE_SCALE)]
    pub privacy_noise_scale: f64,

    /// Add gaussian noise to clipped deltas
    #[arg(long, env = "PRIVACY_ENABLE_NOISE", default_value_t = false)]
    pub privacy_enable_noise: bool,

    /// Tokens awarded for each accepted update
    #[arg(long, env = "INCENTIVE_BASE_REWARD", default_value_t = defaults::DEFAULT_INCENTIVE_BASE_REWARD)]
    pub incentive_base_reward: f64,

    /// Latency (seconds) below which an accepted update earns the speed bonus
    #[arg(long, env = "INCENTIVE_SPEED_THRESHOLD_S", default_value_t = defaults::DEFAULT_INCENTIVE_SPEED_THRESHOLD_S)]
    pub incentive_speed_threshold_s: f64,

    /// Consecutive accepted updates required for the consistency bonus
    #[arg(long, env = "INCENTIVE_CONSISTENCY_THRESHOLD", default_value_t = defaults::DEFAULT_INCENTIVE_CONSISTENCY_THRESHOLD)]
    pub incentive_consistency_threshold: u32,

    /// Mirror the full log filter to stderr
    #[arg(long, short)]
    pub verbose: bool,
}

/// Resolved coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub bind_addr: String,
    pub data_dir: PathBuf,
    pub closer: CloserConfig,
    pub rate_limit: RateLimitConfig,
    pub privacy: PrivacyConfig,
    pub incentives: IncentiveConfig,
}

#[derive(Debug, Clone)]
pub struct CloserConfig {
    pub min_updates: usize,
    pub max_duration: Duration,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_requests_per_minute: usize,
    pub max_requests_per_hour: usize,
    pub max_updates_per_round: u32,
}

#[derive(Debug, Clone)]
pub struct PrivacyConfig {
    pub max_norm: f64,
    pub noise_scale: f64,
    pub enable_noise: bool,
}

#[derive(Debug, Clone)]
pub struct IncentiveConfig {
    pub base_reward: f64,
    pub speed_threshold: Duration,
    pub consistency_threshold: u32,
}

impl CoordinatorConfig {
    pub fn from_args(args: &CoordinatorArgs) -> Self {
        Self {
            bind_addr: args.bind.clone(),
            data_dir: args
                .data_dir
                .clone()
                .unwrap_or_else(fedflow_logging::fedflow_home),
            closer: CloserConfig {
                min_updates: args.min_updates,
                max_duration: Duration::from_secs_f64(args.max_round_duration_s),
                enabled: args.enable_async,
            },
            rate_limit: RateLimitConfig {
                max_requests_per_minute: args.max_requests_per_minute,
                max_requests_per_hour: args.max_requests_per_hour,
                max_updates_per_round: args.max_updates_per_round,
            },
            privacy: PrivacyConfig {
                max_norm: args.privacy_max_norm,
                noise_scale: args.privacy_noise_scale,
                enable_noise: args.privacy_enable_noise,
            },
            incentives: IncentiveConfig {
                base_reward: args.incentive_base_reward,
                speed_threshold: Duration::from_secs_f64(args.incentive_speed_threshold_s),
                consistency_threshold: args.incentive_consistency_threshold,
            },
        }
    }

    pub fn models_dir(&self) -> PathBuf {
        self.data_dir.join("models")
    }

    pub fn metrics_dir(&self) -> PathBuf {
        self.data_dir.join("metrics")
    }

    pub fn round_log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

impl Default for CloserConfig {
    fn default() -> Self {
        Self {
            min_updates: defaults::DEFAULT_MIN_UPDATES,
            max_duration: Duration::from_secs_f64(defaults::DEFAULT_MAX_ROUND_DURATION_S),
            enabled: false,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests_per_minute: defaults::DEFAULT_MAX_REQUESTS_PER_MINUTE,
            max_requests_per_hour: defaults::DEFAULT_MAX_REQUESTS_PER_HOUR,
            max_updates_per_round: defaults::DEFAULT_MAX_UPDATES_PER_ROUND,
        }
    }
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            max_norm: defaults::DEFAULT_PRIVACY_MAX_NORM,
            noise_scale: defaults::DEFAULT_PRIVACY_NOISE_SCALE,
            enable_noise: false,
        }
    }
}

impl Default for IncentiveConfig {
    fn default() -> Self {
        Self {
            base_reward: defaults::DEFAULT_INCENTIVE_BASE_REWARD,
            speed_threshold: Duration::from_secs_f64(defaults::DEFAULT_INCENTIVE_SPEED_THRESHOLD_S),
            consistency_threshold: defaults::DEFAULT_INCENTIVE_CONSISTENCY_THRESHOLD,
        }
    }
}

//! Integration tests for the Fedflow coordinator.
//!
//! Exercises the full pipeline: registration, task assignment, update
//! admission, privacy filtering, round closure (manual, quorum and
//! timeout driven), persistence, and the reputation/incentive ledgers,
//! both directly against `Core` and over the ZMQ control plane.

use std::sync::{mpsc, Arc};
use std::time::Duration;

use fedflow_coordinator::config::{
    CloserConfig, CoordinatorConfig, IncentiveConfig, PrivacyConfig, RateLimitConfig,
};
use fedflow_coordinator::core::{Core, SubmitError};
use fedflow_coordinator::server::{spawn_ticker, CoordinatorServer};
use fedflow_coordinator::{ApiClient, ErrorCode};
use fedflow_protocol::{RejectReason, RoundId, RoundState};
use tempfile::TempDir;

const DELTA: &str = r#"{"weight_delta": [[0.1, 0.2], [0.3]]}"#;

struct Harness {
    core: Arc<Core>,
    _data_dir: TempDir,
}

fn harness(mutate: impl FnOnce(&mut CoordinatorConfig)) -> Harness {
    let data_dir = TempDir::new().unwrap();
    let mut config = CoordinatorConfig {
        bind_addr: "unused".to_string(),
        data_dir: data_dir.path().to_path_buf(),
        closer: CloserConfig::default(),
        rate_limit: RateLimitConfig::default(),
        privacy: PrivacyConfig::default(),
        incentives: IncentiveConfig::default(),
    };
    mutate(&mut config);
    Harness {
        core: Arc::new(Core::new(config).unwrap()),
        _data_dir: data_dir,
    }
}

/// Register a client and return its api key.
fn register(core: &Core, name: &str) -> String {
    let info = core.register_client(name).unwrap();
    assert!(info.success);
    assert_eq!(info.api_key.len(), 32);
    info.api_key
}

#[test]
fn test_happy_path_single_round() {
    let h = harness(|_| {});
    let core = &h.core;

    let key_a = register(core, "A");
    let key_b = register(core, "B");

    // Both clients land in round 1 against v1.
    let task_a = core.get_task("A", Some(&key_a)).unwrap();
    let task_b = core.get_task("B", Some(&key_b)).unwrap();
    assert_eq!(task_a.round_id, RoundId::new(1));
    assert_eq!(task_b.round_id, RoundId::new(1));
    assert_eq!(task_a.model_version.to_string(), "v1");
    assert_eq!(task_a.task, "train");

    core.submit_update("A", task_a.round_id, DELTA, Some(&key_a))
        .unwrap();
    core.submit_update("B", task_b.round_id, DELTA, Some(&key_b))
        .unwrap();

    let status = core.round_status(RoundId::new(1)).unwrap();
    assert_eq!(status.total_updates, 2);
    assert_eq!(status.state, RoundState::Collecting);

    // Aggregation publishes v2 and closes the round.
    let outcome = core.aggregate_round(RoundId::new(1)).unwrap();
    assert_eq!(outcome.status, "aggregated");
    assert_eq!(outcome.num_updates, 2);
    assert_eq!(outcome.model_version.as_ref().unwrap().to_string(), "v2");

    let status = core.round_status(RoundId::new(1)).unwrap();
    assert_eq!(status.state, RoundState::Closed);

    let model = core.model("v2").unwrap();
    assert_eq!(model["base_version"], "v1");
    assert_eq!(model["num_updates"], 2);
    assert_eq!(model["client_ids"].as_array().unwrap().len(), 2);

    // The next task binds round 2 to the new version.
    let task = core.get_task("A", Some(&key_a)).unwrap();
    assert_eq!(task.round_id, RoundId::new(2));
    assert_eq!(task.model_version.to_string(), "v2");
}

#[test]
fn test_straggler_after_quorum_close() {
    let h = harness(|config| {
        config.closer = CloserConfig {
            min_updates: 2,
            max_duration: Duration::from_secs(300),
            enabled: true,
        };
    });
    let core = &h.core;

    let keys: Vec<String> = ["A", "B", "C"].iter().map(|c| register(core, c)).collect();
    for (client, key) in ["A", "B", "C"].iter().zip(&keys) {
        let task = core.get_task(client, Some(key)).unwrap();
        assert_eq!(task.round_id, RoundId::new(1));
    }

    // A and B reach the quorum; the round closes at once.
    core.submit_update("A", RoundId::new(1), DELTA, Some(&keys[0]))
        .unwrap();
    core.submit_update("B", RoundId::new(1), DELTA, Some(&keys[1]))
        .unwrap();

    let status = core.round_status(RoundId::new(1)).unwrap();
    assert_eq!(status.state, RoundState::Closed);
    assert!(core.model("v2").is_ok());

    // C arrives late and is refused with the distinct straggler code.
    let err = core
        .submit_update("C", RoundId::new(1), DELTA, Some(&keys[2]))
        .unwrap_err();
    assert_eq!(err, SubmitError::Straggler);

    let rep = core.reputation_of("C").unwrap();
    assert_eq!(rep.rounds_dropped, 1);

    let stats = core.async_round_stats(RoundId::new(1)).unwrap();
    assert_eq!(stats.stragglers.len(), 1);
    assert_eq!(stats.stragglers[0].client_id, "C");
}

#[test]
fn test_timeout_closes_round_with_single_submitter() {
    let h = harness(|config| {
        config.closer = CloserConfig {
            min_updates: 1,
            max_duration: Duration::from_secs(1),
            enabled: true,
        };
    });
    let core = &h.core;

    let key = register(core, "A");
    let task = core.get_task("A", Some(&key)).unwrap();
    assert_eq!(task.round_id, RoundId::new(1));

    // A trains past the timeout; the ticker closes the round empty.
    let ticker = spawn_ticker(Arc::clone(&h.core));
    std::thread::sleep(Duration::from_millis(2_800));
    ticker.shutdown();

    let status = core.round_status(RoundId::new(1)).unwrap();
    assert_eq!(status.state, RoundState::Closed);
    // No updates: the version does not advance and nothing is persisted.
    assert!(core.model("v2").is_err());
    assert_eq!(core.current_version().to_string(), "v1");

    // A's eventual submission is a straggler.
    let err = core
        .submit_update("A", RoundId::new(1), DELTA, Some(&key))
        .unwrap_err();
    assert_eq!(err, SubmitError::Straggler);
}

#[test]
fn test_non_finite_update_rejected() {
    let h = harness(|_| {});
    let core = &h.core;
    let key = register(core, "A");
    let task = core.get_task("A", Some(&key)).unwrap();

    let err = core
        .submit_update("A", task.round_id, r#"{"weight_delta": [[NaN]]}"#, Some(&key))
        .unwrap_err();
    assert_eq!(err, SubmitError::Rejected(RejectReason::NonFiniteValues));

    // Counters moved, state did not.
    let report = core.round_metrics(task.round_id).unwrap();
    assert_eq!(report.metrics.updates_rejected, 1);
    assert_eq!(report.metrics.updates_accepted, 0);
    let status = core.round_status(task.round_id).unwrap();
    assert_eq!(status.state, RoundState::Collecting);
    assert_eq!(status.total_updates, 0);
    assert!(core.model("v2").is_err());
}

#[test]
fn test_wrong_token_and_per_round_ceiling() {
    let h = harness(|config| {
        config.rate_limit.max_updates_per_round = 5;
    });
    let core = &h.core;
    let key = register(core, "A");
    register(core, "B");
    let task = core.get_task("A", Some(&key)).unwrap();

    // Wrong token.
    let err = core
        .submit_update("A", task.round_id, DELTA, Some("00000000000000000000000000000000"))
        .unwrap_err();
    assert_eq!(
        err,
        SubmitError::Rejected(RejectReason::AuthenticationFailed)
    );

    // Five submissions pass (later ones overwrite); the sixth trips the
    // per-round ceiling.
    for _ in 0..5 {
        core.submit_update("A", task.round_id, DELTA, Some(&key))
            .unwrap();
    }
    let err = core
        .submit_update("A", task.round_id, DELTA, Some(&key))
        .unwrap_err();
    assert_eq!(err, SubmitError::Rejected(RejectReason::RateLimitExceeded));
}

#[test]
fn test_clipping_applies_before_persistence() {
    let h = harness(|config| {
        config.privacy.max_norm = 1.0;
    });
    let core = &h.core;
    let key = register(core, "A");
    let task = core.get_task("A", Some(&key)).unwrap();

    core.submit_update(
        "A",
        task.round_id,
        r#"{"weight_delta": [[3.0, 4.0]]}"#,
        Some(&key),
    )
    .unwrap();

    let outcome = core.aggregate_round(task.round_id).unwrap();
    let model = outcome.aggregated_model.unwrap();

    let stored_delta: serde_json::Value =
        serde_json::from_str(model["weight_deltas"][0].as_str().unwrap()).unwrap();
    let tensor = stored_delta["weight_delta"][0].as_array().unwrap();
    assert!((tensor[0].as_f64().unwrap() - 0.6).abs() < 1e-9);
    assert!((tensor[1].as_f64().unwrap() - 0.8).abs() < 1e-9);
    assert_eq!(stored_delta["privacy_applied"]["clipping"], true);
}

#[test]
fn test_resubmission_counts_once() {
    let h = harness(|_| {});
    let core = &h.core;
    let key = register(core, "A");
    register(core, "B");
    let task = core.get_task("A", Some(&key)).unwrap();

    core.submit_update("A", task.round_id, DELTA, Some(&key))
        .unwrap();
    core.submit_update("A", task.round_id, DELTA, Some(&key))
        .unwrap();

    let report = core.round_metrics(task.round_id).unwrap();
    assert_eq!(report.metrics.updates_accepted, 1);
    assert_eq!(report.metrics.updates_received, 1);

    let rep = core.reputation_of("A").unwrap();
    assert_eq!(rep.updates_accepted, 1);
    assert_eq!(rep.updates_submitted, 2);

    // Only the first acceptance was rewarded.
    let incentives = core.incentives_of("A").unwrap();
    assert_eq!(incentives.total_rewards, 1);
}

#[test]
fn test_duplicate_registration_refused() {
    let h = harness(|_| {});
    register(&h.core, "A");
    assert!(h.core.register_client("A").is_err());
}

#[test]
fn test_version_sequence_across_rounds() {
    let h = harness(|_| {});
    let core = &h.core;
    let key = register(core, "A");

    for expected_round in 1..=3u64 {
        let task = core.get_task("A", Some(&key)).unwrap();
        assert_eq!(task.round_id, RoundId::new(expected_round));
        core.submit_update("A", task.round_id, DELTA, Some(&key))
            .unwrap();
        core.aggregate_round(task.round_id).unwrap();
    }

    // Persisted versions climb strictly: v2, v3, v4.
    let versions: Vec<u64> = ["v2", "v3", "v4"]
        .iter()
        .map(|v| {
            assert!(core.model(v).is_ok(), "missing artifact {v}");
            v[1..].parse().unwrap()
        })
        .collect();
    assert!(versions.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(core.current_version().to_string(), "v4");
}

#[test]
fn test_aggregate_unknown_round_is_none() {
    let h = harness(|_| {});
    assert!(h.core.aggregate_round(RoundId::new(42)).is_none());
    assert!(h.core.round_status(RoundId::new(42)).is_none());
}

#[test]
fn test_aggregate_is_idempotent() {
    let h = harness(|_| {});
    let core = &h.core;
    let key = register(core, "A");
    let task = core.get_task("A", Some(&key)).unwrap();
    core.submit_update("A", task.round_id, DELTA, Some(&key))
        .unwrap();

    let first = core.aggregate_round(task.round_id).unwrap();
    let again = core.aggregate_round(task.round_id).unwrap();
    assert_eq!(first.status, again.status);
    assert_eq!(first.num_updates, again.num_updates);
    // The version advanced exactly once.
    assert_eq!(core.current_version().to_string(), "v2");
    assert!(core.model("v3").is_err());
}

#[test]
fn test_speed_bonus_awarded_for_fast_update() {
    let h = harness(|_| {});
    let core = &h.core;
    let key = register(core, "A");
    register(core, "B");
    let task = core.get_task("A", Some(&key)).unwrap();

    core.submit_update("A", task.round_id, DELTA, Some(&key))
        .unwrap();

    let incentives = core.incentives_of("A").unwrap();
    // Base 10.0 plus the 50% speed bonus.
    assert_eq!(incentives.total_tokens_earned, 15.0);
    assert_eq!(incentives.speed_bonuses, 1);
    assert_eq!(incentives.current_balance, 15.0);
}

#[test]
fn test_control_plane_over_socket() {
    let h = harness(|_| {});
    let data_dir = TempDir::new().unwrap();
    let addr = format!(
        "ipc://{}",
        data_dir.path().join("control.sock").display()
    );

    let mut server = CoordinatorServer::bind(Arc::clone(&h.core), &addr).unwrap();
    let (stop_tx, stop_rx) = mpsc::channel();
    let server_thread = std::thread::spawn(move || server.run_with_shutdown(stop_rx));

    let client = ApiClient::connect(&addr).unwrap();
    client.ping().unwrap();

    let info = client.register("alice").unwrap();
    let task = client.get_task("alice", &info.api_key).unwrap();
    assert_eq!(task.round_id, RoundId::new(1));

    // Straggler-free happy path over the wire.
    let accepted = client
        .submit_update("alice", task.round_id, DELTA, &info.api_key)
        .unwrap();
    assert!(accepted.is_ok());

    let status = client.round_status(task.round_id).unwrap();
    assert_eq!(status.total_updates, 1);

    let outcome = client.aggregate_round(task.round_id).unwrap();
    assert_eq!(outcome.status, "aggregated");

    // A wrong token comes back with the auth code, not a transport
    // error.
    let refused = client
        .submit_update("alice", task.round_id, DELTA, "not-a-key")
        .unwrap();
    assert_eq!(refused.unwrap_err().0, ErrorCode::AuthFailed);

    stop_tx.send(()).unwrap();
    server_thread.join().unwrap().unwrap();
}

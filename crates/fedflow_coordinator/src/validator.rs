//! Admission checks for incoming updates.
//!
//! The checks run in a fixed order and the first failure decides the
//! reject reason: token, registration, assignment, rate ceiling, delta
//! shape, finiteness. All checks are read-only; recording happens after
//! acceptance.

use fedflow_protocol::{RejectReason, RoundId};
use tracing::warn;

use crate::auth::AuthStore;
use crate::privacy::{self, PrivacyFilter};
use crate::rate_limit::RateLimiter;
use crate::rounds::RoundManager;

pub struct UpdateValidator;

impl UpdateValidator {
    /// Run the admission chain for one update submission.
    pub fn validate(
        auth: &AuthStore,
        rounds: &RoundManager,
        limiter: &RateLimiter,
        privacy: &PrivacyFilter,
        client_id: &str,
        round_id: RoundId,
        weight_delta: &str,
        api_key: Option<&str>,
    ) -> Result<(), RejectReason> {
        if !auth.validate(api_key, Some(client_id)) {
            warn!(client_id, round_id = %round_id, reason = "authentication_failed", "update rejected");
            return Err(RejectReason::AuthenticationFailed);
        }

        if !rounds.is_registered(client_id) {
            warn!(client_id, round_id = %round_id, reason = "client_not_registered", "update rejected");
            return Err(RejectReason::ClientNotRegistered);
        }

        if !rounds.validate_update(client_id, round_id) {
            warn!(client_id, round_id = %round_id, reason = "invalid_round_or_assignment", "update rejected");
            return Err(RejectReason::InvalidRoundOrAssignment);
        }

        if let Err(reason) = limiter.check_update(client_id, round_id) {
            warn!(client_id, round_id = %round_id, rate_reason = %reason, "update rejected: rate limit");
            return Err(RejectReason::RateLimitExceeded);
        }

        if weight_delta.trim().is_empty() {
            warn!(client_id, round_id = %round_id, reason = "invalid_weight_delta_format", "update rejected");
            return Err(RejectReason::InvalidWeightDeltaFormat);
        }

        // A delta that does not parse into tensors passes here; shape
        // problems surface elsewhere or at aggregation time.
        if let Some(tensors) = privacy::tensors_from_document(weight_delta) {
            if let Err(e) = privacy.validate(&tensors) {
                warn!(client_id, round_id = %round_id, error = %e, "update rejected: non-finite values");
                return Err(RejectReason::NonFiniteValues);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PrivacyConfig, RateLimitConfig};
    use fedflow_protocol::ModelVersion;

    struct Fixture {
        auth: AuthStore,
        rounds: RoundManager,
        limiter: RateLimiter,
        privacy: PrivacyFilter,
        api_key: String,
    }

    fn fixture() -> Fixture {
        let mut auth = AuthStore::new();
        let api_key = auth.issue("a").unwrap();
        let mut rounds = RoundManager::new();
        rounds.register_client("a");
        rounds.assign("a", &ModelVersion::initial()).unwrap();
        Fixture {
            auth,
            rounds,
            limiter: RateLimiter::new(RateLimitConfig::default()),
            privacy: PrivacyFilter::new(PrivacyConfig::default()),
            api_key,
        }
    }

    fn validate(f: &Fixture, delta: &str, api_key: Option<&str>) -> Result<(), RejectReason> {
        UpdateValidator::validate(
            &f.auth,
            &f.rounds,
            &f.limiter,
            &f.privacy,
            "a",
            RoundId::new(1),
            delta,
            api_key,
        )
    }

    #[test]
    fn test_valid_update_passes() {
        let f = fixture();
        let key = f.api_key.clone();
        assert_eq!(
            validate(&f, r#"{"weight_delta": [[0.1, 0.2]]}"#, Some(&key)),
            Ok(())
        );
    }

    #[test]
    fn test_bad_token_fails_first() {
        let f = fixture();
        // Even a garbage delta reports the auth failure, not the shape.
        assert_eq!(
            validate(&f, "", Some("wrong")),
            Err(RejectReason::AuthenticationFailed)
        );
        assert_eq!(validate(&f, "{}", None), Err(RejectReason::AuthenticationFailed));
    }

    #[test]
    fn test_unassigned_round_rejected() {
        let f = fixture();
        let key = f.api_key.clone();
        let result = UpdateValidator::validate(
            &f.auth,
            &f.rounds,
            &f.limiter,
            &f.privacy,
            "a",
            RoundId::new(5),
            "{}",
            Some(&key),
        );
        assert_eq!(result, Err(RejectReason::InvalidRoundOrAssignment));
    }

    #[test]
    fn test_rate_ceiling_rejected() {
        let mut f = fixture();
        let key = f.api_key.clone();
        for _ in 0..RateLimitConfig::default().max_updates_per_round {
            f.limiter.record_update("a", RoundId::new(1));
        }
        assert_eq!(
            validate(&f, r#"{"weight_delta": [[0.1]]}"#, Some(&key)),
            Err(RejectReason::RateLimitExceeded)
        );
    }

    #[test]
    fn test_empty_delta_rejected() {
        let f = fixture();
        let key = f.api_key.clone();
        assert_eq!(
            validate(&f, "  ", Some(&key)),
            Err(RejectReason::InvalidWeightDeltaFormat)
        );
    }

    #[test]
    fn test_non_finite_rejected() {
        let f = fixture();
        let key = f.api_key.clone();
        assert_eq!(
            validate(&f, r#"{"weight_delta": [[NaN]]}"#, Some(&key)),
            Err(RejectReason::NonFiniteValues)
        );
        assert_eq!(
            validate(&f, r#"{"weight_delta": [[1.0, Infinity]]}"#, Some(&key)),
            Err(RejectReason::NonFiniteValues)
        );
    }

    #[test]
    fn test_unparseable_delta_passes_finiteness() {
        let f = fixture();
        let key = f.api_key.clone();
        assert_eq!(validate(&f, "not json at all", Some(&key)), Ok(()));
    }
}

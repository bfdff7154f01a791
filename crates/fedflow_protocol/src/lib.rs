//! Shared protocol types for the Fedflow coordinator and its clients.
//!
//! The coordinator speaks a JSON request/response protocol over a ZMQ
//! REP socket (see `fedflow_coordinator::control` for the envelope).
//! This crate holds the vocabulary both sides agree on: model version
//! identifiers, round ids and states, admission reject reasons, and the
//! canonical configuration defaults.

pub mod defaults;
pub mod types;
pub mod version;

pub use types::{RejectReason, RoundId, RoundSnapshot, RoundState};
pub use version::{ModelVersion, VersionError};

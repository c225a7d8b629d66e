//! Flock Core - leader election over a coordination service
//!
//! This crate provides the building blocks for electing a unique leader
//! among a set of candidate processes and for observing who the current
//! leader is:
//! - Group membership backed by ephemeral sequential nodes
//! - Leader contention (join the group, watch your own candidacy)
//! - Leader detection (track the lowest-sequenced member)

pub mod elect;
pub mod error;
pub mod group;
pub mod zk;

pub use elect::{
    contender, detector, Candidacy, ConnectionSpec, Contender, Detector, ElectionConfig, Identity,
    LeaderContender, LeaderDetector, StandaloneContender, StandaloneDetector,
};
pub use error::{FlockError, Result};
pub use group::{Group, GroupConfig, Membership};

/// Default session timeout for contender groups.
pub const DEFAULT_CONTENDER_SESSION_TIMEOUT_SECS: u64 = 10;

/// Default session timeout for detector groups.
pub const DEFAULT_DETECTOR_SESSION_TIMEOUT_SECS: u64 = 10;

/// Delay between retries of pending coordination-service operations.
pub const RETRY_INTERVAL_SECS: u64 = 2;

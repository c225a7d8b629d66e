//! Leader contention and detection
//!
//! Candidates contend for leadership of a group; observers detect who the
//! current leader is. Both come in a coordination-service-backed flavor and
//! a standalone, in-process flavor, selected by a connection specification:
//! an empty string picks the standalone variants, `zk://` the service
//! variants, and `file://` points at a file holding one of the other two.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{FlockError, Result};
use crate::group::{Group, GroupConfig};
use crate::zk::{ZkClient, ZkUrl};

mod contender;
mod detector;


pub use contender::{Candidacy, LeaderContender, StandaloneContender};
pub use detector::{LeaderDetector, StandaloneDetector};

/// How many `file://` indirections a specification may chain.
const MAX_FILE_DEPTH: usize = 8;

/// The addressable identity of a leader, carried as the member payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity(String);

impl Identity {
    /// Validates an address; it must be non-empty after trimming.
    pub fn new(address: impl Into<String>) -> Result<Self> {
        let address = address.into();
        let trimmed = address.trim();
        if trimmed.is_empty() {
            return Err(FlockError::MalformedIdentity {
                reason: "empty address".into(),
            });
        }
        Ok(Identity(trimmed.to_string()))
    }

    /// Parses a member payload read back from the group.
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(payload).map_err(|_| FlockError::MalformedIdentity {
            reason: "payload is not valid UTF-8".into(),
        })?;
        Identity::new(text)
    }

    /// The payload to join a group with.
    pub fn to_payload(&self) -> Bytes {
        Bytes::from(self.0.clone())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Identity {
    type Err = FlockError;

    fn from_str(s: &str) -> Result<Self> {
        Identity::new(s)
    }
}

/// A resolved connection specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionSpec {
    /// In-process leadership; no coordination service involved.
    Standalone,
    /// Leadership arbitrated by the coordination service at this URL.
    Service(ZkUrl),
}

impl ConnectionSpec {
    /// Parses a specification: `""`, `zk://...`, or `file://path` whose
    /// contents (trimmed) are parsed in turn.
    pub fn parse(spec: &str) -> Result<ConnectionSpec> {
        Self::parse_at_depth(spec, 0)
    }

    fn parse_at_depth(spec: &str, depth: usize) -> Result<ConnectionSpec> {
        if spec.is_empty() {
            return Ok(ConnectionSpec::Standalone);
        }
        if spec.starts_with(crate::zk::url::SCHEME) {
            let url = ZkUrl::parse(spec)?;
            if url.path == "/" {
                return Err(FlockError::InvalidSpec {
                    reason: "expecting a path for the group node ('/' is not supported)".into(),
                });
            }
            return Ok(ConnectionSpec::Service(url));
        }
        if let Some(path) = spec.strip_prefix("file://") {
            if depth >= MAX_FILE_DEPTH {
                return Err(FlockError::InvalidSpec {
                    reason: format!("too many file:// indirections at '{path}'"),
                });
            }
            let contents = std::fs::read_to_string(path).map_err(|error| FlockError::InvalidSpec {
                reason: format!("failed to read '{path}': {error}"),
            })?;
            return Self::parse_at_depth(contents.trim(), depth + 1);
        }
        Err(FlockError::InvalidSpec {
            reason: format!("failed to parse '{spec}'"),
        })
    }
}

/// Session-timeout configuration for the factory functions
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// Session timeout for contender groups.
    pub contender_session_timeout: Duration,
    /// Session timeout for detector groups.
    pub detector_session_timeout: Duration,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            contender_session_timeout: Duration::from_secs(
                crate::DEFAULT_CONTENDER_SESSION_TIMEOUT_SECS,
            ),
            detector_session_timeout: Duration::from_secs(
                crate::DEFAULT_DETECTOR_SESSION_TIMEOUT_SECS,
            ),
        }
    }
}

/// A candidate for leadership of a group.
#[async_trait]
pub trait Contender: Send + Sync {
    /// Enters the contest. Resolves once candidacy has been entered,
    /// yielding the [`Candidacy`] whose `lost()` future completes when the
    /// candidacy is gone.
    async fn contend(&self) -> Result<Candidacy>;

    /// Leaves the contest. Resolves to `true` when a held candidacy was
    /// cancelled by this call.
    async fn withdraw(&self) -> Result<bool>;
}

/// An observer of a group's current leader.
#[async_trait]
pub trait Detector: Send + Sync {
    /// Resolves once the current leader differs from `previous`: `Some` with
    /// the leader's identity, or `None` when no leader can be reported.
    async fn detect(&self, previous: Option<Identity>) -> Result<Option<Identity>>;
}

/// Builds a contender for `spec`, advertising `identity`.
pub fn contender(
    client: &Arc<dyn ZkClient>,
    spec: &str,
    identity: &Identity,
    config: &ElectionConfig,
) -> Result<Box<dyn Contender>> {
    match ConnectionSpec::parse(spec)? {
        ConnectionSpec::Standalone => Ok(Box::new(StandaloneContender::new())),
        ConnectionSpec::Service(url) => {
            let group = Group::new(
                client.clone(),
                GroupConfig::from_url(&url, config.contender_session_timeout),
            );
            Ok(Box::new(LeaderContender::new(group, identity.to_payload())))
        }
    }
}

/// Builds a detector for `spec`.
pub fn detector(
    client: &Arc<dyn ZkClient>,
    spec: &str,
    config: &ElectionConfig,
) -> Result<Box<dyn Detector>> {
    match ConnectionSpec::parse(spec)? {
        ConnectionSpec::Standalone => Ok(Box::new(StandaloneDetector::new())),
        ConnectionSpec::Service(url) => {
            let group = Group::new(
                client.clone(),
                GroupConfig::from_url(&url, config.detector_session_timeout),
            );
            Ok(Box::new(LeaderDetector::new(group)))
        }
    }
}

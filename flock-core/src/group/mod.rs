//! Group membership over the coordination service
//!
//! A [`Group`] owns one session and presents the ephemeral-sequential
//! children of a single node as a membership set: candidates [`join`] with a
//! payload, observers [`watch`] for changes, and everyone learns about a
//! member's departure through its [`Membership::cancelled`] signal.
//!
//! [`join`]: Group::join
//! [`watch`]: Group::watch

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::{FlockError, Result};
use crate::zk::{Authentication, ZkClient, ZkUrl};

mod actor;

#[cfg(test)]
mod tests;

use actor::{Command, GroupActor};

/// Prefix of member node names; the service appends the sequence.
pub const MEMBER_PREFIX: &str = "m_";

/// Delay before pending operations are retried after a transient failure.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(crate::RETRY_INTERVAL_SECS);

/// Configuration for a group
#[derive(Debug, Clone)]
pub struct GroupConfig {
    /// Comma-separated `host:port` list of coordination servers.
    pub servers: String,
    /// Session timeout; also bounds how long a disconnection is tolerated.
    pub session_timeout: Duration,
    /// Path of the persistent node whose children are the members.
    pub znode: String,
    /// Session credentials.
    pub auth: Option<Authentication>,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            servers: "localhost:2181".into(),
            session_timeout: Duration::from_secs(10),
            znode: "/flock".into(),
            auth: None,
        }
    }
}

impl GroupConfig {
    /// Builds a config from a parsed URL and a session timeout.
    pub fn from_url(url: &ZkUrl, session_timeout: Duration) -> Self {
        Self {
            servers: url.servers.clone(),
            session_timeout,
            znode: url.path.clone(),
            auth: url.auth.clone(),
        }
    }
}

/// One participant in a group.
///
/// Memberships compare, order, and hash by sequence alone, so two instances
/// observed through different groups refer to the same participant. The
/// leader of a group is its lowest-sequenced membership.
#[derive(Clone)]
pub struct Membership {
    sequence: u64,
    cancelled: watch::Receiver<Option<bool>>,
}

impl Membership {
    pub(crate) fn new(sequence: u64, cancelled: watch::Receiver<Option<bool>>) -> Self {
        Self {
            sequence,
            cancelled,
        }
    }

    /// The service-assigned sequence of this member.
    pub fn id(&self) -> u64 {
        self.sequence
    }

    /// Resolves once this membership has left the group: `true` if this
    /// process cancelled it through [`Group::cancel`], `false` for any other
    /// cause (session expiry, removal by someone else).
    pub async fn cancelled(&self) -> bool {
        let mut rx = self.cancelled.clone();
        let result = match rx.wait_for(|value| value.is_some()).await {
            Ok(value) => value.unwrap_or(false),
            // The group is gone; it did not cancel on our behalf.
            Err(_) => false,
        };
        result
    }
}

impl PartialEq for Membership {
    fn eq(&self, other: &Self) -> bool {
        self.sequence == other.sequence
    }
}

impl Eq for Membership {}

impl PartialOrd for Membership {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Membership {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sequence.cmp(&other.sequence)
    }
}

impl Hash for Membership {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.sequence.hash(state);
    }
}

impl fmt::Debug for Membership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Membership").field(&self.sequence).finish()
    }
}

/// Handle to a group.
///
/// Cloneable; all clones talk to the same background task and session. The
/// task runs until every handle (and every membership-holding helper) is
/// dropped.
#[derive(Clone)]
pub struct Group {
    commands: mpsc::UnboundedSender<Command>,
    client: Arc<dyn ZkClient>,
    config: GroupConfig,
}

impl Group {
    /// Spawns a group over `client`. Requires a tokio runtime.
    pub fn new(client: Arc<dyn ZkClient>, config: GroupConfig) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let actor = GroupActor::new(client.clone(), config.clone());
        tokio::spawn(actor.run(command_rx));
        Self {
            commands,
            client,
            config,
        }
    }

    /// Spawns a sibling group with the same configuration and a fresh
    /// session. Groups are terminal after session expiry; this is how a
    /// caller starts over.
    pub fn renew(&self) -> Group {
        Group::new(self.client.clone(), self.config.clone())
    }

    /// Joins the group with `data` as the member payload.
    ///
    /// On success the returned membership is owned by this group and can be
    /// cancelled through it. The membership is not renewed across session
    /// expiry; watch the group and rejoin instead.
    pub async fn join(&self, data: impl Into<Bytes>) -> Result<Membership> {
        self.request(|reply| Command::Join {
            data: data.into(),
            reply,
        })
        .await
    }

    /// Cancels a membership previously obtained from [`join`] on this group.
    ///
    /// Resolves to `true` when the member node was deleted by this call.
    ///
    /// [`join`]: Group::join
    pub async fn cancel(&self, membership: &Membership) -> Result<bool> {
        self.request(|reply| Command::Cancel {
            sequence: membership.id(),
            reply,
        })
        .await
    }

    /// Reads the payload a member joined with.
    pub async fn data(&self, membership: &Membership) -> Result<Bytes> {
        self.request(|reply| Command::Data {
            sequence: membership.id(),
            reply,
        })
        .await
    }

    /// Resolves once the membership set differs from `expected`.
    ///
    /// `None` expresses no expectation: the watch resolves as soon as a
    /// cached snapshot is available, even an empty one. `Some(set)` resolves
    /// only when the current members differ from `set`.
    pub async fn watch(&self, expected: Option<BTreeSet<Membership>>) -> Result<BTreeSet<Membership>> {
        self.request(|reply| Command::Watch { expected, reply }).await
    }

    /// The current session id, or `None` while no session is established.
    pub async fn session(&self) -> Result<Option<i64>> {
        self.request(|reply| Command::Session { reply }).await
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<Result<T>>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| FlockError::Shutdown)?;
        rx.await.map_err(|_| FlockError::Shutdown)?
    }
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("servers", &self.config.servers)
            .field("znode", &self.config.znode)
            .finish()
    }
}

/// Builds the full node path for a member sequence.
pub(crate) fn member_path(znode: &str, sequence: u64) -> String {
    format!("{znode}/{MEMBER_PREFIX}{sequence:010}")
}

/// Extracts the sequence from a member node name (with or without the
/// parent path).
pub(crate) fn parse_sequence(name: &str) -> Option<u64> {
    let name = name.rsplit('/').next().unwrap_or(name);
    let digits = name.strip_prefix(MEMBER_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

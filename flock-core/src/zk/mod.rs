//! Coordination-service client seam
//!
//! The group talks to the coordination service through the traits in this
//! module. A real client wraps its callback-driven watcher interface as a
//! producer of [`SessionEvent`]s posted into the channel handed to
//! [`ZkClient::connect`]; the in-memory implementation used by the tests
//! lives in [`testing`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod url;

#[cfg(test)]
pub(crate) mod testing;

pub use url::ZkUrl;

/// Session lifecycle and znode events delivered by the service.
///
/// Events are produced on the client's own thread and must be serialized
/// into the consuming actor's mailbox; they arrive in the order the service
/// produced them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A session is established. `reconnect` is true when an existing
    /// session was resumed after a disconnection.
    Connected { reconnect: bool },
    /// The connection was lost; the client is trying to reach the service
    /// again. The session is not dead yet.
    Reconnecting,
    /// The session expired. Every ephemeral node it owned is gone.
    Expired,
    /// The children of a watched path changed.
    ChildrenChanged { path: String },
}

/// Error classification for service operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ZkError {
    #[error("connection to the coordination service was lost")]
    ConnectionLoss,
    #[error("operation timed out")]
    OperationTimeout,
    #[error("no node at {path}")]
    NoNode { path: String },
    #[error("node already exists at {path}")]
    NodeExists { path: String },
    #[error("session expired")]
    SessionExpired,
    #[error("authentication failed")]
    AuthFailed,
    #[error("{message}")]
    Other { message: String },
}

impl ZkError {
    /// Returns true if the operation may succeed when tried again on the
    /// same session.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ZkError::ConnectionLoss | ZkError::OperationTimeout)
    }
}

/// Result type alias for service operations
pub type ZkResult<T> = std::result::Result<T, ZkError>;

/// Node creation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Survives the creating session.
    Persistent,
    /// Removed when the creating session ends; the service appends a
    /// monotonically increasing sequence to the requested name.
    EphemeralSequential,
}

/// Access control applied to writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acl {
    /// World-writable.
    OpenUnsafe,
    /// Full permissions for the authenticated creator only.
    CreatorAll,
}

/// Digest credentials for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authentication {
    pub scheme: String,
    pub credentials: String,
}

impl Authentication {
    pub fn digest(credentials: impl Into<String>) -> Self {
        Self {
            scheme: "digest".into(),
            credentials: credentials.into(),
        }
    }
}

/// Entry point into a coordination service.
#[async_trait]
pub trait ZkClient: Send + Sync + 'static {
    /// Begin establishing a session against `servers`.
    ///
    /// Returns a handle immediately; the session becomes usable once a
    /// `Connected` event arrives on `events`. Operations issued before that
    /// fail with a retryable error.
    async fn connect(
        &self,
        servers: &str,
        timeout: Duration,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> ZkResult<Arc<dyn ZkSession>>;
}

/// One session's view of the service.
#[async_trait]
pub trait ZkSession: Send + Sync {
    /// The service-assigned session id, once connected.
    fn session_id(&self) -> Option<i64>;

    /// Attach credentials to this session.
    async fn authenticate(&self, auth: &Authentication) -> ZkResult<()>;

    /// Create a node, returning the full name of the created node (which,
    /// for sequential modes, carries the assigned sequence suffix).
    async fn create(&self, path: &str, data: Bytes, acl: Acl, mode: CreateMode) -> ZkResult<String>;

    /// List the children of a path, optionally (re-)installing a one-shot
    /// child watch that fires a `ChildrenChanged` event.
    async fn children(&self, path: &str, watch: bool) -> ZkResult<Vec<String>>;

    /// Read the payload of a node.
    async fn get(&self, path: &str) -> ZkResult<Bytes>;

    /// Delete a node.
    async fn delete(&self, path: &str) -> ZkResult<()>;
}

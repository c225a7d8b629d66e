//! In-memory coordination service for tests
//!
//! Implements the client seam against a node tree behind a lock, with
//! enough lifecycle control to script the interesting failures: forced
//! session expiry, network shutdown and restore, and authentication
//! rejection.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{Acl, Authentication, CreateMode, SessionEvent, ZkClient, ZkError, ZkResult, ZkSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionPhase {
    /// Waiting for the network to come up for the first time.
    Pending,
    Connected,
    /// Was connected; the network is down.
    Disconnected,
    Expired,
}

struct SessionState {
    events: mpsc::UnboundedSender<SessionEvent>,
    phase: SessionPhase,
    child_watches: HashSet<String>,
}

struct Node {
    data: Bytes,
    ephemeral_owner: Option<i64>,
}

struct ServerState {
    network_up: bool,
    accept_auth: bool,
    next_session: i64,
    next_sequence: u64,
    nodes: HashMap<String, Node>,
    sessions: HashMap<i64, SessionState>,
}

/// A scriptable in-memory coordination service.
#[derive(Clone)]
pub(crate) struct TestServer {
    state: Arc<Mutex<ServerState>>,
}

impl TestServer {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ServerState {
                network_up: true,
                accept_auth: true,
                next_session: 1,
                next_sequence: 0,
                nodes: HashMap::new(),
                sessions: HashMap::new(),
            })),
        }
    }

    /// A client handle that connects sessions against this server.
    pub(crate) fn client(&self) -> Arc<dyn ZkClient> {
        Arc::new(TestClient {
            state: self.state.clone(),
        })
    }

    /// Forces a session to expire, removing its ephemeral nodes.
    pub(crate) fn expire_session(&self, id: i64) {
        let mut state = self.state.lock();
        let Some(session) = state.sessions.get_mut(&id) else {
            return;
        };
        session.phase = SessionPhase::Expired;
        let _ = session.events.send(SessionEvent::Expired);
        remove_ephemerals(&mut state, id);
    }

    /// Drops connectivity: every connected session starts reconnecting.
    pub(crate) fn shutdown_network(&self) {
        let mut state = self.state.lock();
        state.network_up = false;
        for session in state.sessions.values_mut() {
            if session.phase == SessionPhase::Connected {
                session.phase = SessionPhase::Disconnected;
                let _ = session.events.send(SessionEvent::Reconnecting);
            }
        }
    }

    /// Restores connectivity: surviving sessions reconnect, sessions that
    /// never connected connect now.
    pub(crate) fn start_network(&self) {
        let mut state = self.state.lock();
        state.network_up = true;
        for session in state.sessions.values_mut() {
            match session.phase {
                SessionPhase::Pending => {
                    session.phase = SessionPhase::Connected;
                    let _ = session.events.send(SessionEvent::Connected { reconnect: false });
                }
                SessionPhase::Disconnected => {
                    session.phase = SessionPhase::Connected;
                    let _ = session.events.send(SessionEvent::Connected { reconnect: true });
                }
                SessionPhase::Connected | SessionPhase::Expired => {}
            }
        }
    }

    /// Makes subsequent authentication attempts fail.
    pub(crate) fn reject_authentication(&self) {
        self.state.lock().accept_auth = false;
    }

    pub(crate) fn has_node(&self, path: &str) -> bool {
        self.state.lock().nodes.contains_key(path)
    }
}

struct TestClient {
    state: Arc<Mutex<ServerState>>,
}

#[async_trait]
impl ZkClient for TestClient {
    async fn connect(
        &self,
        _servers: &str,
        _timeout: Duration,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> ZkResult<Arc<dyn ZkSession>> {
        let mut state = self.state.lock();
        let id = state.next_session;
        state.next_session += 1;
        let phase = if state.network_up {
            let _ = events.send(SessionEvent::Connected { reconnect: false });
            SessionPhase::Connected
        } else {
            SessionPhase::Pending
        };
        state.sessions.insert(
            id,
            SessionState {
                events,
                phase,
                child_watches: HashSet::new(),
            },
        );
        Ok(Arc::new(TestSession {
            state: self.state.clone(),
            id,
        }))
    }
}

struct TestSession {
    state: Arc<Mutex<ServerState>>,
    id: i64,
}

impl TestSession {
    /// Fails unless this session can issue operations right now.
    fn usable(&self, state: &ServerState) -> ZkResult<()> {
        match state.sessions.get(&self.id).map(|s| s.phase) {
            Some(SessionPhase::Connected) if state.network_up => Ok(()),
            Some(SessionPhase::Expired) => Err(ZkError::SessionExpired),
            None => Err(ZkError::SessionExpired),
            _ => Err(ZkError::ConnectionLoss),
        }
    }
}

#[async_trait]
impl ZkSession for TestSession {
    fn session_id(&self) -> Option<i64> {
        Some(self.id)
    }

    async fn authenticate(&self, _auth: &Authentication) -> ZkResult<()> {
        let state = self.state.lock();
        self.usable(&state)?;
        if state.accept_auth {
            Ok(())
        } else {
            Err(ZkError::AuthFailed)
        }
    }

    async fn create(&self, path: &str, data: Bytes, _acl: Acl, mode: CreateMode) -> ZkResult<String> {
        let mut state = self.state.lock();
        self.usable(&state)?;

        let (name, parent, owner) = match mode {
            CreateMode::Persistent => {
                let parent = parent_of(path);
                (path.to_string(), parent, None)
            }
            CreateMode::EphemeralSequential => {
                let sequence = state.next_sequence;
                state.next_sequence += 1;
                let name = format!("{path}{sequence:010}");
                let parent = parent_of(&name);
                (name, parent, Some(self.id))
            }
        };

        if let Some(parent) = &parent {
            if !state.nodes.contains_key(parent) {
                return Err(ZkError::NoNode {
                    path: parent.clone(),
                });
            }
        }
        if state.nodes.contains_key(&name) {
            return Err(ZkError::NodeExists { path: name });
        }
        state.nodes.insert(
            name.clone(),
            Node {
                data,
                ephemeral_owner: owner,
            },
        );
        if let Some(parent) = parent {
            fire_child_watches(&mut state, &parent);
        }
        Ok(name)
    }

    async fn children(&self, path: &str, watch: bool) -> ZkResult<Vec<String>> {
        let mut state = self.state.lock();
        self.usable(&state)?;
        if !state.nodes.contains_key(path) {
            return Err(ZkError::NoNode {
                path: path.to_string(),
            });
        }
        let prefix = format!("{path}/");
        let children = state
            .nodes
            .keys()
            .filter_map(|name| name.strip_prefix(&prefix))
            .filter(|rest| !rest.contains('/'))
            .map(str::to_string)
            .collect();
        if watch {
            if let Some(session) = state.sessions.get_mut(&self.id) {
                session.child_watches.insert(path.to_string());
            }
        }
        Ok(children)
    }

    async fn get(&self, path: &str) -> ZkResult<Bytes> {
        let state = self.state.lock();
        self.usable(&state)?;
        state
            .nodes
            .get(path)
            .map(|node| node.data.clone())
            .ok_or_else(|| ZkError::NoNode {
                path: path.to_string(),
            })
    }

    async fn delete(&self, path: &str) -> ZkResult<()> {
        let mut state = self.state.lock();
        self.usable(&state)?;
        if state.nodes.remove(path).is_none() {
            return Err(ZkError::NoNode {
                path: path.to_string(),
            });
        }
        if let Some(parent) = parent_of(path) {
            fire_child_watches(&mut state, &parent);
        }
        Ok(())
    }
}

impl Drop for TestSession {
    fn drop(&mut self) {
        // The client going away ends the session; the server reclaims its
        // ephemeral nodes as if it had expired.
        let mut state = self.state.lock();
        state.sessions.remove(&self.id);
        remove_ephemerals(&mut state, self.id);
    }
}

fn parent_of(path: &str) -> Option<String> {
    let index = path.rfind('/')?;
    if index == 0 {
        None
    } else {
        Some(path[..index].to_string())
    }
}

/// Delivers `ChildrenChanged` to every session holding a one-shot child
/// watch on `parent`.
fn fire_child_watches(state: &mut ServerState, parent: &str) {
    for session in state.sessions.values_mut() {
        if session.phase == SessionPhase::Expired {
            continue;
        }
        if session.child_watches.remove(parent) {
            let _ = session.events.send(SessionEvent::ChildrenChanged {
                path: parent.to_string(),
            });
        }
    }
}

fn remove_ephemerals(state: &mut ServerState, owner: i64) {
    let doomed: Vec<String> = state
        .nodes
        .iter()
        .filter(|(_, node)| node.ephemeral_owner == Some(owner))
        .map(|(path, _)| path.clone())
        .collect();
    for path in doomed {
        state.nodes.remove(&path);
        if let Some(parent) = parent_of(&path) {
            fire_child_watches(&mut *state, &parent);
        }
    }
}

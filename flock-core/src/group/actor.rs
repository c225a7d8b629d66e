//! Group background task
//!
//! One task per group owns the session and all group state. Method calls
//! arrive as commands carrying reply channels, service callbacks arrive as
//! session events, and both are serialized through the same mailbox, so
//! every handler runs to completion without interleaving.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{FlockError, Result};
use crate::zk::{Acl, CreateMode, SessionEvent, ZkClient, ZkError, ZkSession};

use super::{member_path, parse_sequence, GroupConfig, Membership, MEMBER_PREFIX, RETRY_INTERVAL};

pub(crate) enum Command {
    Join {
        data: Bytes,
        reply: oneshot::Sender<Result<Membership>>,
    },
    Cancel {
        sequence: u64,
        reply: oneshot::Sender<Result<bool>>,
    },
    Data {
        sequence: u64,
        reply: oneshot::Sender<Result<Bytes>>,
    },
    Watch {
        expected: Option<BTreeSet<Membership>>,
        reply: oneshot::Sender<Result<BTreeSet<Membership>>>,
    },
    Session {
        reply: oneshot::Sender<Result<Option<i64>>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

struct JoinOp {
    data: Bytes,
    reply: oneshot::Sender<Result<Membership>>,
}

struct CancelOp {
    sequence: u64,
    reply: oneshot::Sender<Result<bool>>,
}

struct DataOp {
    sequence: u64,
    reply: oneshot::Sender<Result<Bytes>>,
}

struct WatchOp {
    expected: Option<BTreeSet<Membership>>,
    reply: oneshot::Sender<Result<BTreeSet<Membership>>>,
}

#[derive(Default)]
struct Pending {
    joins: VecDeque<JoinOp>,
    cancels: VecDeque<CancelOp>,
    datas: VecDeque<DataOp>,
    watches: VecDeque<WatchOp>,
}

pub(crate) struct GroupActor {
    client: Arc<dyn ZkClient>,
    config: GroupConfig,
    acl: Acl,
    session: Option<Arc<dyn ZkSession>>,
    state: ConnectionState,
    /// Terminal error; once set the group is dead and every operation
    /// fails with it.
    error: Option<FlockError>,
    authenticated: bool,
    /// Whether the group node is known to exist on the current session.
    prepared: bool,
    pending: Pending,
    /// Sequences created by this group, with the sender side of their
    /// cancellation signal.
    owned: HashMap<u64, watch::Sender<Option<bool>>>,
    /// Sequences observed through the cache only.
    unowned: HashMap<u64, watch::Sender<Option<bool>>>,
    /// `None` means the cache is stale and must be refetched before any
    /// watch can be resolved.
    memberships: Option<BTreeSet<Membership>>,
    /// Armed while the session is disconnected; firing expires the session
    /// on our side.
    expiry: Option<Instant>,
    retry_at: Option<Instant>,
}

impl GroupActor {
    pub(crate) fn new(client: Arc<dyn ZkClient>, config: GroupConfig) -> Self {
        let acl = if config.auth.is_some() {
            Acl::CreatorAll
        } else {
            Acl::OpenUnsafe
        };
        let authenticated = config.auth.is_none();
        Self {
            client,
            config,
            acl,
            session: None,
            state: ConnectionState::Disconnected,
            error: None,
            authenticated,
            prepared: false,
            pending: Pending::default(),
            owned: HashMap::new(),
            unowned: HashMap::new(),
            memberships: None,
            expiry: None,
            retry_at: None,
        }
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let (event_tx, mut events) = mpsc::unbounded_channel();
        match self
            .client
            .connect(&self.config.servers, self.config.session_timeout, event_tx)
            .await
        {
            Ok(session) => {
                debug!(znode = %self.config.znode, "connecting to {}", self.config.servers);
                self.session = Some(session);
                self.state = ConnectionState::Connecting;
            }
            Err(error) => self.fail(error),
        }

        let mut events_open = true;
        loop {
            let retry_deadline = self.retry_at.unwrap_or_else(far_future);
            let expiry_deadline = self.expiry.unwrap_or_else(far_future);
            tokio::select! {
                biased;
                event = events.recv(), if events_open => match event {
                    Some(event) => self.handle_event(event).await,
                    None => events_open = false,
                },
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                _ = sleep_until(expiry_deadline), if self.expiry.is_some() => {
                    self.expiry = None;
                    self.timed_out();
                }
                _ = sleep_until(retry_deadline), if self.retry_at.is_some() => {
                    self.retry_at = None;
                    if self.state == ConnectionState::Connected {
                        self.sync().await;
                    }
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        if let Some(error) = self.error.clone() {
            refuse(command, error);
            return;
        }
        match command {
            Command::Join { data, reply } => {
                self.pending.joins.push_back(JoinOp { data, reply });
                if self.state == ConnectionState::Connected {
                    self.sync().await;
                }
            }
            Command::Cancel { sequence, reply } => {
                if !self.owned.contains_key(&sequence) {
                    let _ = reply.send(Err(FlockError::NotOwned { sequence }));
                    return;
                }
                self.pending.cancels.push_back(CancelOp { sequence, reply });
                if self.state == ConnectionState::Connected {
                    self.sync().await;
                }
            }
            Command::Data { sequence, reply } => {
                self.pending.datas.push_back(DataOp { sequence, reply });
                if self.state == ConnectionState::Connected {
                    self.sync().await;
                }
            }
            Command::Watch { expected, reply } => {
                // The cache is invalidated on every disconnect, so a watch
                // can only be resolved while connected.
                self.pending.watches.push_back(WatchOp { expected, reply });
                if self.state == ConnectionState::Connected {
                    self.sync().await;
                }
            }
            Command::Session { reply } => {
                let id = if self.state == ConnectionState::Connected {
                    self.session.as_ref().and_then(|session| session.session_id())
                } else {
                    None
                };
                let _ = reply.send(Ok(id));
            }
        }
    }

    async fn handle_event(&mut self, event: SessionEvent) {
        if self.error.is_some() {
            return;
        }
        match event {
            SessionEvent::Connected { reconnect } => {
                info!(znode = %self.config.znode, reconnect, "session connected");
                self.state = ConnectionState::Connected;
                self.expiry = None;
                self.sync().await;
            }
            SessionEvent::Reconnecting => {
                info!(
                    znode = %self.config.znode,
                    "disconnected; session expires in {:?} unless reconnected",
                    self.config.session_timeout
                );
                self.state = ConnectionState::Disconnected;
                self.memberships = None;
                if self.expiry.is_none() {
                    self.expiry = Some(Instant::now() + self.config.session_timeout);
                }
            }
            SessionEvent::Expired => {
                warn!(znode = %self.config.znode, "session expired");
                self.fail_all(FlockError::SessionExpired);
            }
            SessionEvent::ChildrenChanged { path } => {
                if path == self.config.znode {
                    self.memberships = None;
                    if self.state == ConnectionState::Connected {
                        self.sync().await;
                    }
                }
            }
        }
    }

    fn timed_out(&mut self) {
        if self.state == ConnectionState::Connected {
            return;
        }
        warn!(
            znode = %self.config.znode,
            "timed out after {:?} waiting for reconnection",
            self.config.session_timeout
        );
        self.fail_all(FlockError::SessionTimedOut);
    }

    /// Synchronizes pending operations with the service: authenticates and
    /// prepares the group node if needed, drains the pending queues in
    /// order, refreshes the membership cache, and resolves watches. Any
    /// retryable failure leaves the current item at the head of its queue
    /// and arms the retry timer.
    async fn sync(&mut self) {
        if self.error.is_some() || self.state != ConnectionState::Connected {
            return;
        }
        let Some(session) = self.session.clone() else {
            return;
        };

        if !self.authenticated {
            let Some(auth) = self.config.auth.clone() else {
                return;
            };
            match session.authenticate(&auth).await {
                Ok(()) => {
                    debug!(scheme = %auth.scheme, "session authenticated");
                    self.authenticated = true;
                }
                Err(error) if error.is_retryable() => return self.schedule_retry(),
                Err(error) => {
                    return self.fail_all(FlockError::AuthenticationFailed {
                        message: error.to_string(),
                    })
                }
            }
        }

        if !self.prepared {
            match self.ensure_path(&session).await {
                Ok(()) => self.prepared = true,
                Err(error) if error.is_retryable() => return self.schedule_retry(),
                Err(error) => return self.fail(error),
            }
        }

        while let Some(op) = self.pending.joins.pop_front() {
            match self.do_join(&session, &op.data).await {
                Ok(membership) => {
                    info!(sequence = membership.id(), "joined group");
                    let _ = op.reply.send(Ok(membership));
                }
                Err(error) if error.is_retryable() => {
                    self.pending.joins.push_front(op);
                    return self.schedule_retry();
                }
                Err(error @ (ZkError::SessionExpired | ZkError::AuthFailed)) => {
                    self.pending.joins.push_front(op);
                    return self.fail(error);
                }
                Err(error) => {
                    let _ = op.reply.send(Err(FlockError::GroupFailed {
                        message: error.to_string(),
                    }));
                }
            }
        }

        while let Some(op) = self.pending.cancels.pop_front() {
            if !self.owned.contains_key(&op.sequence) {
                let _ = op.reply.send(Err(FlockError::NotOwned {
                    sequence: op.sequence,
                }));
                continue;
            }
            let path = member_path(&self.config.znode, op.sequence);
            match session.delete(&path).await {
                Ok(()) => {
                    // The cancellation signal resolves before the cancel
                    // call itself.
                    if let Some(sender) = self.owned.remove(&op.sequence) {
                        let _ = sender.send(Some(true));
                    }
                    if let Some(memberships) = self.memberships.as_mut() {
                        memberships.retain(|m| m.id() != op.sequence);
                    }
                    info!(sequence = op.sequence, "membership cancelled");
                    let _ = op.reply.send(Ok(true));
                }
                Err(ZkError::NoNode { .. }) => {
                    // Already removed by someone else; the next cache pass
                    // resolves the cancellation signal with `false`.
                    let _ = op.reply.send(Ok(false));
                }
                Err(error) if error.is_retryable() => {
                    self.pending.cancels.push_front(op);
                    return self.schedule_retry();
                }
                Err(error @ (ZkError::SessionExpired | ZkError::AuthFailed)) => {
                    self.pending.cancels.push_front(op);
                    return self.fail(error);
                }
                Err(error) => {
                    let _ = op.reply.send(Err(FlockError::GroupFailed {
                        message: error.to_string(),
                    }));
                }
            }
        }

        while let Some(op) = self.pending.datas.pop_front() {
            let path = member_path(&self.config.znode, op.sequence);
            match session.get(&path).await {
                Ok(data) => {
                    let _ = op.reply.send(Ok(data));
                }
                Err(ZkError::NoNode { .. }) => {
                    let _ = op.reply.send(Err(FlockError::MemberGone {
                        sequence: op.sequence,
                    }));
                }
                Err(error) if error.is_retryable() => {
                    self.pending.datas.push_front(op);
                    return self.schedule_retry();
                }
                Err(error @ (ZkError::SessionExpired | ZkError::AuthFailed)) => {
                    self.pending.datas.push_front(op);
                    return self.fail(error);
                }
                Err(error) => {
                    let _ = op.reply.send(Err(FlockError::GroupFailed {
                        message: error.to_string(),
                    }));
                }
            }
        }

        if self.memberships.is_none() {
            match self.cache(&session).await {
                Ok(()) => {}
                Err(ZkError::NoNode { .. }) => {
                    // The group node vanished; recreate it and try again.
                    self.prepared = false;
                    return self.schedule_retry();
                }
                Err(error) if error.is_retryable() => return self.schedule_retry(),
                Err(error) => return self.fail(error),
            }
        }

        self.update();
    }

    /// Creates the group node (and its parents) as persistent nodes.
    async fn ensure_path(&self, session: &Arc<dyn ZkSession>) -> std::result::Result<(), ZkError> {
        let mut path = String::new();
        for component in self.config.znode.split('/').filter(|c| !c.is_empty()) {
            path.push('/');
            path.push_str(component);
            match session
                .create(&path, Bytes::new(), self.acl, CreateMode::Persistent)
                .await
            {
                Ok(_) => {}
                // Someone else won the race; that is just as good.
                Err(ZkError::NodeExists { .. }) => {}
                Err(error) => return Err(error),
            }
        }
        Ok(())
    }

    async fn do_join(
        &mut self,
        session: &Arc<dyn ZkSession>,
        data: &Bytes,
    ) -> std::result::Result<Membership, ZkError> {
        let path = format!("{}/{}", self.config.znode, MEMBER_PREFIX);
        let created = session
            .create(&path, data.clone(), self.acl, CreateMode::EphemeralSequential)
            .await?;
        let sequence = parse_sequence(&created).ok_or_else(|| ZkError::Other {
            message: format!("service returned unparsable member node name '{created}'"),
        })?;
        let (sender, receiver) = watch::channel(None);
        if let Some(memberships) = self.memberships.as_mut() {
            memberships.insert(Membership::new(sequence, sender.subscribe()));
        }
        self.owned.insert(sequence, sender);
        Ok(Membership::new(sequence, receiver))
    }

    /// Replaces the membership cache with the current children of the group
    /// node, creating `unowned` entries for newly observed sequences and
    /// resolving the cancellation signal of sequences that disappeared.
    async fn cache(&mut self, session: &Arc<dyn ZkSession>) -> std::result::Result<(), ZkError> {
        let children = session.children(&self.config.znode, true).await?;
        let mut current = BTreeSet::new();
        for child in children {
            match parse_sequence(&child) {
                Some(sequence) => {
                    current.insert(sequence);
                }
                None => warn!(child = %child, "ignoring unexpected child of the group node"),
            }
        }

        for sequence in &current {
            if !self.owned.contains_key(sequence) && !self.unowned.contains_key(sequence) {
                let (sender, _) = watch::channel(None);
                self.unowned.insert(*sequence, sender);
            }
        }

        let gone: Vec<u64> = self
            .owned
            .keys()
            .chain(self.unowned.keys())
            .filter(|sequence| !current.contains(sequence))
            .copied()
            .collect();
        for sequence in gone {
            debug!(sequence, "membership removed");
            let sender = self
                .owned
                .remove(&sequence)
                .or_else(|| self.unowned.remove(&sequence));
            if let Some(sender) = sender {
                // Removal we did not initiate: expired session or an
                // external delete.
                let _ = sender.send(Some(false));
            }
        }

        let mut memberships = BTreeSet::new();
        for sequence in &current {
            if let Some(sender) = self
                .owned
                .get(sequence)
                .or_else(|| self.unowned.get(sequence))
            {
                memberships.insert(Membership::new(*sequence, sender.subscribe()));
            }
        }
        debug!(members = memberships.len(), "cached group members");
        self.memberships = Some(memberships);
        Ok(())
    }

    /// Resolves every pending watch whose expectation differs from the
    /// cached membership set.
    fn update(&mut self) {
        let Some(current) = self.memberships.clone() else {
            return;
        };
        let mut still_pending = VecDeque::new();
        while let Some(watch) = self.pending.watches.pop_front() {
            let changed = match &watch.expected {
                None => true,
                Some(expected) => *expected != current,
            };
            if changed {
                let _ = watch.reply.send(Ok(current.clone()));
            } else {
                still_pending.push_back(watch);
            }
        }
        self.pending.watches = still_pending;
    }

    fn schedule_retry(&mut self) {
        if self.retry_at.is_none() {
            debug!("retrying pending operations in {:?}", RETRY_INTERVAL);
            self.retry_at = Some(Instant::now() + RETRY_INTERVAL);
        }
    }

    fn fail(&mut self, error: ZkError) {
        let error = match &error {
            ZkError::SessionExpired => FlockError::SessionExpired,
            ZkError::AuthFailed => FlockError::AuthenticationFailed {
                message: error.to_string(),
            },
            other => FlockError::GroupFailed {
                message: other.to_string(),
            },
        };
        self.fail_all(error);
    }

    /// Enters the terminal state: fails every pending operation, resolves
    /// every cancellation signal with `false`, and drops the session.
    fn fail_all(&mut self, error: FlockError) {
        warn!(znode = %self.config.znode, %error, "group failed");
        self.error = Some(error.clone());
        for (_, sender) in self.owned.drain() {
            let _ = sender.send(Some(false));
        }
        for (_, sender) in self.unowned.drain() {
            let _ = sender.send(Some(false));
        }
        for op in self.pending.joins.drain(..) {
            let _ = op.reply.send(Err(error.clone()));
        }
        for op in self.pending.cancels.drain(..) {
            let _ = op.reply.send(Err(error.clone()));
        }
        for op in self.pending.datas.drain(..) {
            let _ = op.reply.send(Err(error.clone()));
        }
        for op in self.pending.watches.drain(..) {
            let _ = op.reply.send(Err(error.clone()));
        }
        self.memberships = None;
        self.expiry = None;
        self.retry_at = None;
        self.session = None;
        self.state = ConnectionState::Disconnected;
    }
}

fn refuse(command: Command, error: FlockError) {
    match command {
        Command::Join { reply, .. } => {
            let _ = reply.send(Err(error));
        }
        Command::Cancel { reply, .. } => {
            let _ = reply.send(Err(error));
        }
        Command::Data { reply, .. } => {
            let _ = reply.send(Err(error));
        }
        Command::Watch { reply, .. } => {
            let _ = reply.send(Err(error));
        }
        Command::Session { reply } => {
            let _ = reply.send(Err(error));
        }
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(60 * 60 * 24)
}

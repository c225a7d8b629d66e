//! Leader detectors
//!
//! A detector tracks the lowest-sequenced member of a group, reads its
//! payload, and reports each leader transition to every waiting subscriber.

use std::collections::BTreeSet;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::{FlockError, Result};
use crate::group::{Group, Membership};

use super::{Detector, Identity};

enum Msg {
    Detect {
        previous: Option<Identity>,
        reply: oneshot::Sender<Result<Option<Identity>>>,
    },
    Watched {
        epoch: u64,
        result: Result<BTreeSet<Membership>>,
    },
    Fetched {
        epoch: u64,
        sequence: u64,
        result: Result<Bytes>,
    },
}

/// A detector backed by a coordination-service group.
///
/// Long-lived: subscribers come and go through repeated `detect()` calls.
/// When the group's session expires the detector starts a new session with
/// the same configuration and keeps its subscribers pending; when the
/// session times out waiting for the service, pending detects fail and the
/// next `detect()` starts over.
pub struct LeaderDetector {
    mailbox: mpsc::UnboundedSender<Msg>,
}

impl LeaderDetector {
    /// Spawns a detector observing `group`.
    pub fn new(group: Group) -> Self {
        let (mailbox, rx) = mpsc::unbounded_channel();
        let actor = DetectorActor {
            group,
            epoch: 0,
            mailbox: mailbox.downgrade(),
            current: None,
            snapshot: None,
            last_leader: None,
            subscribers: Vec::new(),
            failed: None,
            malformed: None,
        };
        tokio::spawn(actor.run(rx));
        Self { mailbox }
    }

    /// Resolves once the current leader differs from `previous`.
    pub async fn detect(&self, previous: Option<Identity>) -> Result<Option<Identity>> {
        let (reply, rx) = oneshot::channel();
        self.mailbox
            .send(Msg::Detect { previous, reply })
            .map_err(|_| FlockError::Shutdown)?;
        rx.await.map_err(|_| FlockError::Shutdown)?
    }
}

#[async_trait::async_trait]
impl Detector for LeaderDetector {
    async fn detect(&self, previous: Option<Identity>) -> Result<Option<Identity>> {
        LeaderDetector::detect(self, previous).await
    }
}

struct DetectorActor {
    group: Group,
    /// Bumped on every session renewal; completions tagged with an older
    /// epoch are discarded.
    epoch: u64,
    mailbox: mpsc::WeakUnboundedSender<Msg>,
    /// The leader last reported to subscribers.
    current: Option<Identity>,
    /// Latest snapshot, used as the expectation of the next watch.
    snapshot: Option<BTreeSet<Membership>>,
    /// Sequence of the member whose payload `current` came from.
    last_leader: Option<u64>,
    subscribers: Vec<(Option<Identity>, oneshot::Sender<Result<Option<Identity>>>)>,
    failed: Option<FlockError>,
    /// Set while the current leader's payload does not parse; cleared by
    /// the next leader change.
    malformed: Option<FlockError>,
}

impl DetectorActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Msg>) {
        self.watch(None);
        while let Some(msg) = rx.recv().await {
            match msg {
                Msg::Detect { previous, reply } => self.detect(previous, reply),
                Msg::Watched { epoch, result } => self.watched(epoch, result),
                Msg::Fetched {
                    epoch,
                    sequence,
                    result,
                } => self.fetched(epoch, sequence, result),
            }
        }
    }

    fn detect(&mut self, previous: Option<Identity>, reply: oneshot::Sender<Result<Option<Identity>>>) {
        if self.failed.is_some() {
            // Start over with a fresh session for this and later detects.
            self.renew();
        }
        if let Some(error) = &self.malformed {
            let _ = reply.send(Err(error.clone()));
            return;
        }
        if previous != self.current {
            let _ = reply.send(Ok(self.current.clone()));
        } else {
            self.subscribers.push((previous, reply));
        }
    }

    fn watched(&mut self, epoch: u64, result: Result<BTreeSet<Membership>>) {
        if epoch != self.epoch {
            return;
        }
        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(FlockError::SessionExpired) => {
                info!("session expired; detecting over a new session");
                self.renew();
                return;
            }
            Err(error) => {
                self.fail(error);
                return;
            }
        };

        self.snapshot = Some(snapshot.clone());
        match snapshot.iter().next().cloned() {
            None => {
                debug!("group is empty, no leader");
                self.last_leader = None;
                self.resolved(None);
                self.rewatch();
            }
            Some(leader) if Some(leader.id()) == self.last_leader => {
                // Membership churn below the leader; nothing to report.
                self.rewatch();
            }
            Some(leader) => {
                debug!(sequence = leader.id(), "leader changed, fetching its data");
                self.last_leader = Some(leader.id());
                self.fetch(leader);
            }
        }
    }

    fn fetched(&mut self, epoch: u64, sequence: u64, result: Result<Bytes>) {
        if epoch != self.epoch || Some(sequence) != self.last_leader {
            return;
        }
        match result {
            Ok(payload) => match Identity::from_payload(&payload) {
                Ok(identity) => self.resolved(Some(identity)),
                Err(error) => {
                    warn!(%error, sequence, "leader payload did not parse");
                    self.malformed = Some(error.clone());
                    for (_, reply) in self.subscribers.drain(..) {
                        let _ = reply.send(Err(error.clone()));
                    }
                }
            },
            Err(FlockError::SessionExpired) => {
                info!("session expired; detecting over a new session");
                self.renew();
                return;
            }
            Err(error) if error.is_terminal() => {
                self.fail(error);
                return;
            }
            Err(error) => {
                // The leader vanished between the snapshot and the read;
                // nothing reportable until the next change.
                debug!(%error, sequence, "leader data unavailable");
                self.last_leader = None;
                self.resolved(None);
            }
        }
        self.rewatch();
    }

    /// Records the leader and answers every subscriber whose `previous`
    /// differs from it.
    fn resolved(&mut self, leader: Option<Identity>) {
        self.malformed = None;
        if self.current != leader {
            match &leader {
                Some(identity) => info!(leader = %identity, "detected a new leader"),
                None => info!("no leader detected"),
            }
        }
        self.current = leader;
        let mut waiting = Vec::new();
        for (previous, reply) in self.subscribers.drain(..) {
            if previous != self.current {
                let _ = reply.send(Ok(self.current.clone()));
            } else {
                waiting.push((previous, reply));
            }
        }
        self.subscribers = waiting;
    }

    /// Terminal failure: every subscriber gets the error and the tracked
    /// leader is forgotten. The next `detect()` renews the session.
    fn fail(&mut self, error: FlockError) {
        warn!(%error, "detector failed");
        self.failed = Some(error.clone());
        self.current = None;
        self.snapshot = None;
        self.last_leader = None;
        self.malformed = None;
        for (_, reply) in self.subscribers.drain(..) {
            let _ = reply.send(Err(error.clone()));
        }
    }

    fn renew(&mut self) {
        self.epoch += 1;
        self.group = self.group.renew();
        self.snapshot = None;
        self.last_leader = None;
        self.failed = None;
        self.malformed = None;
        self.watch(None);
    }

    fn rewatch(&mut self) {
        self.watch(self.snapshot.clone());
    }

    fn watch(&self, expected: Option<BTreeSet<Membership>>) {
        let group = self.group.clone();
        let mailbox = self.mailbox.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            let result = group.watch(expected).await;
            if let Some(mailbox) = mailbox.upgrade() {
                let _ = mailbox.send(Msg::Watched { epoch, result });
            }
        });
    }

    fn fetch(&self, leader: Membership) {
        let group = self.group.clone();
        let mailbox = self.mailbox.clone();
        let epoch = self.epoch;
        let sequence = leader.id();
        tokio::spawn(async move {
            let result = group.data(&leader).await;
            if let Some(mailbox) = mailbox.upgrade() {
                let _ = mailbox.send(Msg::Fetched {
                    epoch,
                    sequence,
                    result,
                });
            }
        });
    }
}

struct StandaloneState {
    leader: Option<Identity>,
    subscribers: Vec<oneshot::Sender<Result<Option<Identity>>>>,
}

/// A detector without a coordination service: the leader is whoever was
/// last appointed.
pub struct StandaloneDetector {
    state: Mutex<StandaloneState>,
}

impl StandaloneDetector {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StandaloneState {
                leader: None,
                subscribers: Vec::new(),
            }),
        }
    }

    /// Starts out with `leader` already appointed.
    pub fn with_leader(leader: Identity) -> Self {
        Self {
            state: Mutex::new(StandaloneState {
                leader: Some(leader),
                subscribers: Vec::new(),
            }),
        }
    }

    /// Sets the current leader and resolves every pending detect.
    pub fn appoint(&self, leader: Option<Identity>) {
        let mut state = self.state.lock();
        state.leader = leader.clone();
        for reply in state.subscribers.drain(..) {
            let _ = reply.send(Ok(leader.clone()));
        }
    }
}

impl Default for StandaloneDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Detector for StandaloneDetector {
    async fn detect(&self, previous: Option<Identity>) -> Result<Option<Identity>> {
        let rx = {
            let mut state = self.state.lock();
            if previous != state.leader {
                return Ok(state.leader.clone());
            }
            let (reply, rx) = oneshot::channel();
            state.subscribers.push(reply);
            rx
        };
        rx.await.map_err(|_| FlockError::Shutdown)?
    }
}

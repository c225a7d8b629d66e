//! Leader contenders
//!
//! A contender drives one candidacy lifecycle: join the group, hand the
//! caller a candidacy-lost future, and keep watching its own membership
//! until it disappears or is withdrawn.

use std::collections::BTreeSet;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::{FlockError, Result};
use crate::group::{Group, Membership};

use super::Contender;

/// A candidacy that has been entered.
///
/// Obtained from [`Contender::contend`]; [`lost`](Candidacy::lost) completes
/// when the candidacy ends (membership removed, withdrawn, or the group
/// failed terminally).
pub struct Candidacy {
    lost: oneshot::Receiver<Result<()>>,
}

impl Candidacy {
    /// Waits for the candidacy to end. `Ok(())` means the membership is
    /// gone; an error carries the terminal failure that ended it.
    pub async fn lost(self) -> Result<()> {
        match self.lost.await {
            Ok(outcome) => outcome,
            Err(_) => Err(FlockError::Shutdown),
        }
    }
}

enum Msg {
    Contend {
        reply: oneshot::Sender<Result<Candidacy>>,
    },
    Withdraw {
        reply: oneshot::Sender<Result<bool>>,
    },
    Joined(Result<Membership>),
    Watched(Result<BTreeSet<Membership>>),
    Cancelled(Result<bool>),
}

enum WithdrawState {
    NotRequested,
    InProgress(Vec<oneshot::Sender<Result<bool>>>),
    Done(Result<bool>),
}

/// A contender backed by a coordination-service group.
///
/// Accepts a single `contend()` call; contend again with a fresh contender.
/// Dropping the contender issues a best-effort cancel of an obtained
/// candidacy without awaiting it; if the contender is dropped after
/// contending but before the join resolves, the member node survives until
/// session expiry. Await `withdraw()` for a clean exit.
pub struct LeaderContender {
    mailbox: mpsc::UnboundedSender<Msg>,
}

impl LeaderContender {
    /// Spawns a contender that will join `group` with `data` as its
    /// advertised payload.
    pub fn new(group: Group, data: impl Into<Bytes>) -> Self {
        let (mailbox, rx) = mpsc::unbounded_channel();
        let actor = ContenderActor {
            group,
            data: data.into(),
            mailbox: mailbox.downgrade(),
            contending: None,
            contended: false,
            watching: None,
            candidacy: None,
            withdraw: WithdrawState::NotRequested,
        };
        tokio::spawn(actor.run(rx));
        Self { mailbox }
    }

    pub async fn contend(&self) -> Result<Candidacy> {
        let (reply, rx) = oneshot::channel();
        self.mailbox
            .send(Msg::Contend { reply })
            .map_err(|_| FlockError::Shutdown)?;
        rx.await.map_err(|_| FlockError::Shutdown)?
    }

    pub async fn withdraw(&self) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.mailbox
            .send(Msg::Withdraw { reply })
            .map_err(|_| FlockError::Shutdown)?;
        rx.await.map_err(|_| FlockError::Shutdown)?
    }
}

#[async_trait::async_trait]
impl Contender for LeaderContender {
    async fn contend(&self) -> Result<Candidacy> {
        LeaderContender::contend(self).await
    }

    async fn withdraw(&self) -> Result<bool> {
        LeaderContender::withdraw(self).await
    }
}

struct ContenderActor {
    group: Group,
    data: Bytes,
    mailbox: mpsc::WeakUnboundedSender<Msg>,
    /// Pending reply for contend(); fulfilled once the join completes.
    contending: Option<oneshot::Sender<Result<Candidacy>>>,
    contended: bool,
    /// Sender of the candidacy-lost signal; assigned when the candidacy is
    /// entered, consumed when it ends.
    watching: Option<oneshot::Sender<Result<()>>>,
    /// Outcome of the join, once known.
    candidacy: Option<Result<Membership>>,
    withdraw: WithdrawState,
}

impl ContenderActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Msg>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                Msg::Contend { reply } => self.contend(reply),
                Msg::Withdraw { reply } => self.withdraw(reply),
                Msg::Joined(result) => self.joined(result),
                Msg::Watched(result) => self.watched(result),
                Msg::Cancelled(result) => self.cancelled(result),
            }
        }
        self.finalize();
    }

    fn contend(&mut self, reply: oneshot::Sender<Result<Candidacy>>) {
        if self.contended {
            let _ = reply.send(Err(FlockError::AlreadyContending));
            return;
        }
        self.contended = true;
        self.contending = Some(reply);

        info!("joining the group with data '{:?}'", self.data);
        let group = self.group.clone();
        let data = self.data.clone();
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            let result = group.join(data).await;
            if let Some(mailbox) = mailbox.upgrade() {
                let _ = mailbox.send(Msg::Joined(result));
            }
        });
    }

    fn withdraw(&mut self, reply: oneshot::Sender<Result<bool>>) {
        if !self.contended {
            let _ = reply.send(Err(FlockError::NotContending));
            return;
        }
        match &mut self.withdraw {
            WithdrawState::Done(result) => {
                let _ = reply.send(result.clone());
            }
            WithdrawState::InProgress(waiters) => waiters.push(reply),
            WithdrawState::NotRequested => {
                self.withdraw = WithdrawState::InProgress(vec![reply]);
                match &self.candidacy {
                    // Join still in flight; cancel once it lands.
                    None => {
                        info!("withdraw requested before the candidacy is obtained; will withdraw after it happens");
                    }
                    Some(Ok(membership)) => self.cancel(membership.clone()),
                    // Never obtained a candidacy, nothing to cancel.
                    Some(Err(_)) => self.finish_withdraw(Ok(false)),
                }
            }
        }
    }

    fn joined(&mut self, result: Result<Membership>) {
        self.candidacy = Some(result.clone());
        let membership = match result {
            Ok(membership) => membership,
            Err(error) => {
                self.fail(error);
                return;
            }
        };

        if !matches!(self.withdraw, WithdrawState::NotRequested) {
            info!("joined the group after the contender started withdrawing");
            self.cancel(membership);
            return;
        }

        info!(
            sequence = membership.id(),
            "new candidate has entered the contest for leadership"
        );
        let (lost_tx, lost_rx) = oneshot::channel();
        self.watching = Some(lost_tx);
        if let Some(reply) = self.contending.take() {
            if reply.send(Ok(Candidacy { lost: lost_rx })).is_ok() {
                // Watch that our membership stays in place, starting from
                // whatever the group looks like right now.
                self.watch(None);
            }
        }
    }

    fn watched(&mut self, result: Result<BTreeSet<Membership>>) {
        if !matches!(self.withdraw, WithdrawState::NotRequested) {
            debug!("group memberships changed after the contender started withdrawing");
            return;
        }
        let memberships = match result {
            Ok(memberships) => memberships,
            Err(error) => {
                self.fail(error);
                return;
            }
        };
        let Some(Ok(membership)) = &self.candidacy else {
            return;
        };
        if memberships.contains(membership) {
            self.watch(Some(memberships));
        } else {
            info!(sequence = membership.id(), "lost candidacy");
            if let Some(lost) = self.watching.take() {
                let _ = lost.send(Ok(()));
            }
        }
    }

    fn cancelled(&mut self, result: Result<bool>) {
        if let Some(Ok(membership)) = &self.candidacy {
            info!(sequence = membership.id(), "membership cancelled");
        }
        self.finish_withdraw(result);
    }

    fn cancel(&self, membership: Membership) {
        let group = self.group.clone();
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            let result = group.cancel(&membership).await;
            if let Some(mailbox) = mailbox.upgrade() {
                let _ = mailbox.send(Msg::Cancelled(result));
            }
        });
    }

    fn watch(&self, expected: Option<BTreeSet<Membership>>) {
        let group = self.group.clone();
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            let result = group.watch(expected).await;
            if let Some(mailbox) = mailbox.upgrade() {
                let _ = mailbox.send(Msg::Watched(result));
            }
        });
    }

    fn finish_withdraw(&mut self, result: Result<bool>) {
        let state = std::mem::replace(&mut self.withdraw, WithdrawState::Done(result.clone()));
        if let WithdrawState::InProgress(waiters) = state {
            for waiter in waiters {
                let _ = waiter.send(result.clone());
            }
        }
    }

    /// Propagates a terminal failure to every assigned, unfulfilled slot.
    fn fail(&mut self, error: FlockError) {
        warn!(%error, "contender failed");
        if let Some(reply) = self.contending.take() {
            let _ = reply.send(Err(error.clone()));
        }
        if let Some(lost) = self.watching.take() {
            let _ = lost.send(Err(error.clone()));
        }
        if matches!(self.withdraw, WithdrawState::InProgress(_)) {
            self.finish_withdraw(Err(error));
        }
    }

    /// Best-effort cancel on destruction; the group keeps retrying until it
    /// succeeds or the session ends.
    fn finalize(&self) {
        if let Some(Ok(membership)) = &self.candidacy {
            let group = self.group.clone();
            let membership = membership.clone();
            tokio::spawn(async move {
                let _ = group.cancel(&membership).await;
            });
        }
    }
}

/// A contender without a coordination service: the candidacy is held until
/// it is withdrawn or the contender is dropped.
///
/// Contending again first withdraws the previous candidacy.
pub struct StandaloneContender {
    candidacy: Mutex<Option<oneshot::Sender<Result<()>>>>,
}

impl StandaloneContender {
    pub fn new() -> Self {
        Self {
            candidacy: Mutex::new(None),
        }
    }
}

impl Default for StandaloneContender {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Contender for StandaloneContender {
    async fn contend(&self) -> Result<Candidacy> {
        let mut candidacy = self.candidacy.lock();
        if let Some(previous) = candidacy.take() {
            info!("withdrawing the previous candidacy before recontending");
            let _ = previous.send(Ok(()));
        }
        let (lost_tx, lost_rx) = oneshot::channel();
        *candidacy = Some(lost_tx);
        Ok(Candidacy { lost: lost_rx })
    }

    async fn withdraw(&self) -> Result<bool> {
        match self.candidacy.lock().take() {
            Some(lost) => {
                let _ = lost.send(Ok(()));
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl Drop for StandaloneContender {
    fn drop(&mut self) {
        if let Some(lost) = self.candidacy.lock().take() {
            let _ = lost.send(Ok(()));
        }
    }
}

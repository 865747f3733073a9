//! Event-loop driver for [`RaftCore`].
//!
//! [`RaftNode::spawn`] moves the core into a tokio task that owns it
//! exclusively.  Everything else talks to that task through a channel:
//! client proposals, membership changes and peer messages all queue up
//! in one inbox, so log mutation has a single writer and no caller ever
//! holds a lock across network I/O.  Callers await a oneshot reply, which
//! suspends only their own request.

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, gauge};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use super::membership::{Configuration, MembershipChange, NodeId, Role};
use super::messages::Message;
use super::raft::{RaftConfig, RaftCore, RaftStatus};
use super::transport::Transport;
use crate::errors::DbError;
use crate::fsm::engine::{ExecResult, SqlCommand};
use crate::fsm::state_machine::StateMachine;
use crate::metrics::{
    PROPOSALS_TOTAL, RAFT_COMMIT_INDEX, RAFT_LAST_APPLIED, RAFT_TERM,
};

type Reply<T> = oneshot::Sender<Result<T, DbError>>;

/// Work for the consensus task.
enum Request {
    Message(Message),
    Propose {
        command: SqlCommand,
        reply: Reply<ExecResult>,
    },
    ChangeMembership {
        change: MembershipChange,
        reply: Reply<ExecResult>,
    },
    Transfer {
        target: NodeId,
        reply: Reply<()>,
    },
    Configuration {
        reply: Reply<Configuration>,
    },
    Shutdown,
}

/// Cloneable handle to a running consensus task.
#[derive(Clone)]
pub struct RaftNode {
    id: NodeId,
    inbox: mpsc::UnboundedSender<Request>,
    status: watch::Receiver<RaftStatus>,
    fsm: Arc<StateMachine>,
}

impl RaftNode {
    /// Start the consensus task.  Ticks at half the heartbeat interval.
    pub fn spawn(
        core: RaftCore,
        fsm: Arc<StateMachine>,
        transport: Arc<dyn Transport>,
        config: &RaftConfig,
    ) -> Self {
        let id = core.id();
        let (inbox, rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(core.status());
        let tick = (config.heartbeat_interval / 2).max(Duration::from_millis(1));
        tokio::spawn(run(core, rx, transport, status_tx, tick));
        Self {
            id,
            inbox,
            status,
            fsm,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn fsm(&self) -> &Arc<StateMachine> {
        &self.fsm
    }

    /// Hand a peer message to the consensus task.
    pub fn deliver(&self, message: Message) {
        let _ = self.inbox.send(Request::Message(message));
    }

    /// Replicate `command` and return its result once applied.
    pub async fn propose(&self, command: SqlCommand) -> Result<ExecResult, DbError> {
        let result = self
            .call(|reply| Request::Propose { command, reply })
            .await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(err) => err.code(),
        };
        counter!(PROPOSALS_TOTAL, "outcome" => outcome).increment(1);
        result
    }

    /// Add a node as a spare.
    pub async fn add_member(&self, id: NodeId, address: &str) -> Result<(), DbError> {
        self.change_membership(MembershipChange::Add {
            id,
            address: address.to_string(),
        })
        .await
    }

    pub async fn assign_role(&self, id: NodeId, role: Role) -> Result<(), DbError> {
        self.change_membership(MembershipChange::Assign { id, role })
            .await
    }

    pub async fn remove_member(&self, id: NodeId) -> Result<(), DbError> {
        self.change_membership(MembershipChange::Remove { id }).await
    }

    async fn change_membership(&self, change: MembershipChange) -> Result<(), DbError> {
        self.call(|reply| Request::ChangeMembership { change, reply })
            .await
            .map(|_| ())
    }

    /// Hand leadership to `target`; `0` picks the most up-to-date voter.
    pub async fn transfer_leadership(&self, target: NodeId) -> Result<(), DbError> {
        self.call(|reply| Request::Transfer { target, reply }).await
    }

    /// The latest node table in this node's log.
    pub async fn configuration(&self) -> Result<Configuration, DbError> {
        self.call(|reply| Request::Configuration { reply }).await
    }

    pub fn status(&self) -> RaftStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RaftStatus> {
        self.status.clone()
    }

    /// Wait until this node knows a leader.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<RaftStatus, DbError> {
        let mut rx = self.status.clone();
        let wait = async move {
            let status = rx.wait_for(|s| s.leader.is_some()).await?;
            Ok::<_, watch::error::RecvError>(status.clone())
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(status)) => Ok(status),
            Ok(Err(_)) => Err(DbError::Shutdown),
            Err(_) => Err(DbError::Timeout),
        }
    }

    /// Stop the consensus task.  Outstanding requests fail with `Shutdown`.
    pub async fn shutdown(&self) {
        let _ = self.inbox.send(Request::Shutdown);
        self.inbox.closed().await;
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Request) -> Result<T, DbError> {
        let (tx, rx) = oneshot::channel();
        self.inbox.send(make(tx)).map_err(|_| DbError::Shutdown)?;
        rx.await.map_err(|_| DbError::Shutdown)?
    }
}

async fn run(
    mut core: RaftCore,
    mut inbox: mpsc::UnboundedReceiver<Request>,
    transport: Arc<dyn Transport>,
    status_tx: watch::Sender<RaftStatus>,
    tick: Duration,
) {
    info!(id = core.id(), "consensus loop started");
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut members = core.configuration().clone();
    loop {
        let result = tokio::select! {
            _ = ticker.tick() => core.tick(Instant::now()),
            request = inbox.recv() => match request {
                None | Some(Request::Shutdown) => break,
                Some(request) => handle(&mut core, request),
            },
        };
        if let Err(err) = result {
            error!(id = core.id(), "consensus step failed: {err}");
        }
        for outgoing in core.take_outbox() {
            transport.send(outgoing);
        }
        if *core.configuration() != members {
            members = core.configuration().clone();
            transport.retain(&members);
        }
        publish(&core, &status_tx);
    }
    core.shutdown();
    inbox.close();
    info!(id = core.id(), "consensus loop stopped");
}

fn handle(core: &mut RaftCore, request: Request) -> Result<(), DbError> {
    let now = Instant::now();
    match request {
        Request::Message(message) => core.step(message, now),
        Request::Propose { command, reply } => core.propose(command, reply, now),
        Request::ChangeMembership { change, reply } => core.change_membership(change, reply, now),
        Request::Transfer { target, reply } => core.transfer_leadership(target, reply, now),
        Request::Configuration { reply } => {
            let _ = reply.send(Ok(core.configuration().clone()));
            Ok(())
        }
        Request::Shutdown => Ok(()),
    }
}

fn publish(core: &RaftCore, status_tx: &watch::Sender<RaftStatus>) {
    let status = core.status();
    gauge!(RAFT_TERM).set(status.term as f64);
    gauge!(RAFT_COMMIT_INDEX).set(status.commit_index as f64);
    gauge!(RAFT_LAST_APPLIED).set(status.last_applied as f64);
    status_tx.send_if_modified(|current| {
        if *current == status {
            return false;
        }
        *current = status;
        true
    });
}

//! Sans-I/O consensus core.
//!
//! [`RaftCore`] holds all consensus state for one node.  It never touches
//! the network or the clock: the driver in [`super::node`] feeds it
//! incoming messages, client requests and the current time, then drains
//! [`RaftCore::take_outbox`] into the transport.  Committed entries are
//! applied to the [`StateMachine`] from here, so log mutation and
//! application share one serialization point.
//!
//! Membership changes use joint consensus: while a membership entry is
//! uncommitted, commits and elections need a majority of voters in both
//! the last committed node table and the new one.  At most one such entry
//! is in flight at a time.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::counter;
use rand::Rng;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::log::{LogEntry, Payload};
use super::membership::{Configuration, MembershipChange, NodeId, NodeInfo, Role};
use super::messages::{Message, MessageBody, Outgoing};
use crate::errors::DbError;
use crate::fsm::engine::{ExecResult, SqlCommand};
use crate::fsm::snapshot::Snapshot;
use crate::fsm::state_machine::StateMachine;
use crate::logstore::store::LogStore;
use crate::metrics::{ELECTIONS_TOTAL, LEADER_CHANGES_TOTAL, SNAPSHOTS_TOTAL};

/// Entries read from the store per batch when applying or scanning.
const BATCH: usize = 256;

/// Completion channel for a proposed entry.
pub type ProposalReply = oneshot::Sender<Result<ExecResult, DbError>>;

/// Completion channel for a leadership transfer.
pub type TransferReply = oneshot::Sender<Result<(), DbError>>;

/// Timing and sizing knobs.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Base election timeout; the effective timeout is random in `[T, 2T)`.
    pub election_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// How long a proposal may wait for commit.
    pub apply_timeout: Duration,
    pub transfer_timeout: Duration,
    /// How long a node may take to catch up before a role change.
    pub promotion_timeout: Duration,
    /// Applied entries between snapshots; `0` disables snapshots.
    pub snapshot_threshold: u64,
    /// Entries kept in the log behind a snapshot.
    pub snapshot_trailing: u64,
    pub max_append_entries: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout: Duration::from_millis(1000),
            heartbeat_interval: Duration::from_millis(100),
            apply_timeout: Duration::from_millis(5000),
            transfer_timeout: Duration::from_millis(5000),
            promotion_timeout: Duration::from_millis(10000),
            snapshot_threshold: 1024,
            snapshot_trailing: 8192,
            max_append_entries: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Follower,
    Candidate,
    Leader,
}

impl NodeRole {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeRole::Follower => "follower",
            NodeRole::Candidate => "candidate",
            NodeRole::Leader => "leader",
        }
    }
}

/// Point-in-time view of a node's consensus state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RaftStatus {
    pub id: NodeId,
    pub role: NodeRole,
    pub term: u64,
    pub leader: Option<NodeInfo>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_index: u64,
    /// Set on a leader once the barrier of its term has been applied.
    pub leader_ready: bool,
    pub transferring: bool,
}

impl RaftStatus {
    pub fn initial(id: NodeId) -> Self {
        Self {
            id,
            role: NodeRole::Follower,
            term: 0,
            leader: None,
            commit_index: 0,
            last_applied: 0,
            last_index: 0,
            leader_ready: false,
            transferring: false,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.role == NodeRole::Leader
    }
}

/// Leader-side replication state for one peer.
struct Progress {
    next_index: u64,
    match_index: u64,
    last_contact: Instant,
    snapshot_sent: Option<Instant>,
}

struct Pending {
    term: u64,
    reply: ProposalReply,
    deadline: Instant,
}

/// A role change waiting for its target to catch up.
struct Promotion {
    id: NodeId,
    role: Role,
    reply: ProposalReply,
    deadline: Instant,
}

struct Transfer {
    target: NodeId,
    reply: TransferReply,
    deadline: Instant,
    timeout_sent: bool,
}

pub struct RaftCore {
    id: NodeId,
    address: String,
    config: RaftConfig,
    store: Box<dyn LogStore>,
    fsm: Arc<StateMachine>,

    role: NodeRole,
    term: u64,
    voted_for: Option<NodeId>,
    leader: Option<NodeId>,
    commit_index: u64,
    last_applied: u64,

    /// Node table stored with the latest snapshot.
    snapshot_config: Configuration,
    committed_config: Configuration,
    /// Uncommitted membership entry: index and resulting table.
    pending_config: Option<(u64, Configuration)>,

    election_deadline: Instant,
    last_leader_contact: Option<Instant>,
    votes: BTreeSet<NodeId>,

    progress: BTreeMap<NodeId, Progress>,
    next_heartbeat: Instant,
    barrier_index: u64,
    pending: BTreeMap<u64, Pending>,
    promotion: Option<Promotion>,
    transfer: Option<Transfer>,

    /// Addresses learned from incoming messages.
    addresses: HashMap<NodeId, String>,
    outbox: Vec<Outgoing>,
}

impl RaftCore {
    /// Load persisted state from `store` and restore the state machine
    /// from the stored snapshot, if any.
    pub fn new(
        id: NodeId,
        address: impl Into<String>,
        config: RaftConfig,
        store: Box<dyn LogStore>,
        fsm: Arc<StateMachine>,
        now: Instant,
    ) -> Result<Self, DbError> {
        let hard_state = store.hard_state()?;
        let mut snapshot_config = Configuration::new();
        let mut applied = 0;
        if let Some(snapshot) = store.load_snapshot()? {
            fsm.restore(&snapshot)?;
            snapshot_config = snapshot.configuration.clone();
            applied = snapshot.last_index;
        }

        let mut core = Self {
            id,
            address: address.into(),
            config,
            store,
            fsm,
            role: NodeRole::Follower,
            term: hard_state.term,
            voted_for: hard_state.voted_for,
            leader: None,
            commit_index: applied,
            last_applied: applied,
            committed_config: snapshot_config.clone(),
            snapshot_config,
            pending_config: None,
            election_deadline: now,
            last_leader_contact: None,
            votes: BTreeSet::new(),
            progress: BTreeMap::new(),
            next_heartbeat: now,
            barrier_index: 0,
            pending: BTreeMap::new(),
            promotion: None,
            transfer: None,
            addresses: HashMap::new(),
            outbox: Vec::new(),
        };
        core.reload_configurations()?;
        core.reset_election_timer(now);
        info!(
            id,
            term = core.term,
            last_index = core.store.last_index(),
            snapshot_index = applied,
            "consensus state loaded"
        );
        Ok(core)
    }

    /// Write the initial membership entry on a node with an empty log.
    /// Returns `false` if the log already has content.
    pub fn bootstrap(&mut self, configuration: Configuration) -> Result<bool, DbError> {
        if self.store.last_index() > 0 || self.term > 0 {
            return Ok(false);
        }
        if !configuration.is_voter(self.id) {
            return Err(DbError::Protocol {
                message: format!("bootstrap configuration must make node {} a voter", self.id),
            });
        }
        self.term = 1;
        self.persist()?;
        self.store.append(&[LogEntry::new(
            1,
            1,
            Payload::Membership {
                change: MembershipChange::Bootstrap,
                configuration,
            },
        )])?;
        self.reload_configurations()?;
        info!(id = self.id, "bootstrapped cluster");
        Ok(true)
    }

    // -- Accessors ------------------------------------------------------------

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    /// The most recent node table in the log, committed or not.
    pub fn configuration(&self) -> &Configuration {
        self.latest_config()
    }

    pub fn status(&self) -> RaftStatus {
        RaftStatus {
            id: self.id,
            role: self.role,
            term: self.term,
            leader: self.leader_info(),
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            last_index: self.store.last_index(),
            leader_ready: self.role == NodeRole::Leader
                && self.barrier_index > 0
                && self.last_applied >= self.barrier_index,
            transferring: self.transfer.is_some(),
        }
    }

    /// Messages produced since the last call.
    pub fn take_outbox(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.outbox)
    }

    // -- Client requests ------------------------------------------------------

    /// Append a command and reply once it is applied.
    pub fn propose(
        &mut self,
        command: SqlCommand,
        reply: ProposalReply,
        now: Instant,
    ) -> Result<(), DbError> {
        if let Err(err) = self.check_accepting() {
            let _ = reply.send(Err(err));
            return Ok(());
        }
        self.propose_entry(Payload::Command(command), reply, now)
    }

    /// Append a membership change and reply once it is applied.
    pub fn change_membership(
        &mut self,
        change: MembershipChange,
        reply: ProposalReply,
        now: Instant,
    ) -> Result<(), DbError> {
        if let Err(err) = self.check_accepting() {
            let _ = reply.send(Err(err));
            return Ok(());
        }
        if self.pending_config.is_some() || self.promotion.is_some() {
            let _ = reply.send(Err(DbError::ChangeInProgress));
            return Ok(());
        }
        let latest = self.latest_config();
        let next = match latest.apply_change(&change) {
            Ok(next) => next,
            Err(err) => {
                let _ = reply.send(Err(err));
                return Ok(());
            }
        };
        if let MembershipChange::Assign { id, role } = change {
            if latest.role_of(id) == Some(role) {
                let _ = reply.send(Ok(ExecResult::default()));
                return Ok(());
            }
            if role != Role::Spare
                && id != self.id
                && self.match_of(id) < self.store.last_index()
            {
                info!(id, %role, "catching up node before role change");
                self.promotion = Some(Promotion {
                    id,
                    role,
                    reply,
                    deadline: now + self.config.promotion_timeout,
                });
                self.sync_progress(now);
                return self.send_append(id, now);
            }
        }
        info!(%change, "proposing membership change");
        self.propose_entry(
            Payload::Membership {
                change,
                configuration: next,
            },
            reply,
            now,
        )
    }

    /// Hand leadership to `target` (`0` picks the most up-to-date voter).
    pub fn transfer_leadership(
        &mut self,
        target: NodeId,
        reply: TransferReply,
        now: Instant,
    ) -> Result<(), DbError> {
        if self.role != NodeRole::Leader {
            let _ = reply.send(Err(self.not_leader()));
            return Ok(());
        }
        if self.transfer.is_some() {
            let _ = reply.send(Err(DbError::ChangeInProgress));
            return Ok(());
        }
        if target == self.id {
            let _ = reply.send(Ok(()));
            return Ok(());
        }
        let target = if target == 0 {
            match self.most_up_to_date_voter() {
                Some(id) => id,
                None => {
                    let _ = reply.send(Err(DbError::UnknownTarget { id: 0 }));
                    return Ok(());
                }
            }
        } else {
            target
        };
        if !self.latest_config().is_voter(target) {
            let _ = reply.send(Err(DbError::UnknownTarget { id: target }));
            return Ok(());
        }
        info!(target, term = self.term, "transferring leadership");
        self.transfer = Some(Transfer {
            target,
            reply,
            deadline: now + self.config.transfer_timeout,
            timeout_sent: false,
        });
        self.check_transfer();
        if self.transfer.as_ref().is_some_and(|t| !t.timeout_sent) {
            self.send_append(target, now)?;
        }
        Ok(())
    }

    /// Fail every outstanding request.
    pub fn shutdown(&mut self) {
        for (_, pending) in std::mem::take(&mut self.pending) {
            let _ = pending.reply.send(Err(DbError::Shutdown));
        }
        if let Some(promotion) = self.promotion.take() {
            let _ = promotion.reply.send(Err(DbError::Shutdown));
        }
        if let Some(transfer) = self.transfer.take() {
            let _ = transfer.reply.send(Err(DbError::Shutdown));
        }
    }

    fn check_accepting(&self) -> Result<(), DbError> {
        if self.role != NodeRole::Leader {
            return Err(self.not_leader());
        }
        if self.transfer.is_some() {
            return Err(DbError::NotLeader { leader: None });
        }
        Ok(())
    }

    fn not_leader(&self) -> DbError {
        DbError::NotLeader {
            leader: self.leader_info(),
        }
    }

    fn propose_entry(
        &mut self,
        payload: Payload,
        reply: ProposalReply,
        now: Instant,
    ) -> Result<(), DbError> {
        let index = self.append(payload, now)?;
        self.pending.insert(
            index,
            Pending {
                term: self.term,
                reply,
                deadline: now + self.config.apply_timeout,
            },
        );
        self.broadcast_append(now)?;
        self.maybe_commit(now)
    }

    // -- Time -----------------------------------------------------------------

    pub fn tick(&mut self, now: Instant) -> Result<(), DbError> {
        self.expire_requests(now);
        match self.role {
            NodeRole::Leader => {
                if now >= self.next_heartbeat {
                    self.broadcast_append(now)?;
                }
                self.check_quorum(now)?;
            }
            NodeRole::Follower | NodeRole::Candidate => {
                if now >= self.election_deadline {
                    if self.can_campaign() {
                        self.campaign(now, false)?;
                    } else {
                        self.reset_election_timer(now);
                    }
                }
            }
        }
        Ok(())
    }

    fn expire_requests(&mut self, now: Instant) {
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(index, _)| *index)
            .collect();
        for index in expired {
            if let Some(pending) = self.pending.remove(&index) {
                debug!(index, "proposal timed out");
                let _ = pending.reply.send(Err(DbError::Timeout));
            }
        }
        if self.promotion.as_ref().is_some_and(|p| p.deadline <= now) {
            if let Some(promotion) = self.promotion.take() {
                warn!(id = promotion.id, "node did not catch up in time");
                let _ = promotion.reply.send(Err(DbError::Timeout));
                self.sync_progress(now);
            }
        }
        if self.transfer.as_ref().is_some_and(|t| t.deadline <= now) {
            if let Some(transfer) = self.transfer.take() {
                warn!(target = transfer.target, "leadership transfer timed out");
                let _ = transfer.reply.send(Err(DbError::TransferTimeout));
            }
        }
    }

    fn check_quorum(&mut self, now: Instant) -> Result<(), DbError> {
        let timeout = self.config.election_timeout;
        let me = self.id;
        let healthy = self.joint_quorum(|id| {
            id == me
                || self
                    .progress
                    .get(&id)
                    .is_some_and(|p| now.duration_since(p.last_contact) < timeout)
        });
        if !healthy {
            warn!(term = self.term, "lost contact with a quorum of voters, stepping down");
            self.become_follower(self.term, None, now)?;
        }
        Ok(())
    }

    fn reset_election_timer(&mut self, now: Instant) {
        let base = (self.config.election_timeout.as_millis() as u64).max(1);
        let timeout = rand::thread_rng().gen_range(base..base * 2);
        self.election_deadline = now + Duration::from_millis(timeout);
    }

    // -- Messages -------------------------------------------------------------

    pub fn step(&mut self, message: Message, now: Instant) -> Result<(), DbError> {
        let from = message.from;
        if from == self.id {
            return Ok(());
        }
        self.addresses.insert(from, message.from_address.clone());

        if let MessageBody::RequestVote {
            disrupt_leader: false,
            ..
        } = &message.body
        {
            if message.term > self.term && self.leader_is_fresh(now) {
                debug!(from, term = message.term, "ignoring vote request, leader is active");
                return Ok(());
            }
        }

        if message.term > self.term {
            let leader = match &message.body {
                MessageBody::AppendEntries { .. } | MessageBody::InstallSnapshot { .. } => {
                    Some(from)
                }
                _ => None,
            };
            self.become_follower(message.term, leader, now)?;
        } else if message.term < self.term {
            match &message.body {
                MessageBody::RequestVote { .. } => {
                    self.send(from, MessageBody::RequestVoteResponse { granted: false });
                }
                MessageBody::AppendEntries { .. } | MessageBody::InstallSnapshot { .. } => {
                    let last_index = self.store.last_index();
                    self.send(
                        from,
                        MessageBody::AppendEntriesResponse {
                            success: false,
                            last_index,
                        },
                    );
                }
                _ => {}
            }
            return Ok(());
        }

        match message.body {
            MessageBody::RequestVote {
                last_log_index,
                last_log_term,
                ..
            } => self.handle_request_vote(from, last_log_index, last_log_term, now),
            MessageBody::RequestVoteResponse { granted } => {
                self.handle_vote_response(from, granted, now)
            }
            MessageBody::AppendEntries {
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => self.handle_append_entries(
                from,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
                now,
            ),
            MessageBody::AppendEntriesResponse {
                success,
                last_index,
            } => self.handle_append_response(from, success, last_index, now),
            MessageBody::InstallSnapshot { snapshot } => {
                self.handle_install_snapshot(from, *snapshot, now)
            }
            MessageBody::InstallSnapshotResponse { last_index } => {
                self.handle_snapshot_response(from, last_index, now)
            }
            MessageBody::TimeoutNow => self.handle_timeout_now(now),
        }
    }

    fn leader_is_fresh(&self, now: Instant) -> bool {
        if self.role == NodeRole::Leader {
            return true;
        }
        self.leader.is_some()
            && self
                .last_leader_contact
                .is_some_and(|at| now.duration_since(at) < self.config.election_timeout)
    }

    fn handle_request_vote(
        &mut self,
        candidate: NodeId,
        last_log_index: u64,
        last_log_term: u64,
        now: Instant,
    ) -> Result<(), DbError> {
        let ours = (self.last_log_term()?, self.store.last_index());
        let up_to_date = (last_log_term, last_log_index) >= ours;
        let free = self.voted_for.is_none() || self.voted_for == Some(candidate);
        let granted = self.role != NodeRole::Leader && up_to_date && free;
        if granted {
            self.voted_for = Some(candidate);
            self.persist()?;
            self.reset_election_timer(now);
        }
        debug!(candidate, term = self.term, granted, "vote request");
        self.send(candidate, MessageBody::RequestVoteResponse { granted });
        Ok(())
    }

    fn handle_vote_response(
        &mut self,
        from: NodeId,
        granted: bool,
        now: Instant,
    ) -> Result<(), DbError> {
        if self.role != NodeRole::Candidate || !granted {
            return Ok(());
        }
        self.votes.insert(from);
        if self.joint_quorum(|id| self.votes.contains(&id)) {
            self.become_leader(now)?;
        }
        Ok(())
    }

    fn handle_append_entries(
        &mut self,
        leader: NodeId,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
        now: Instant,
    ) -> Result<(), DbError> {
        if self.role == NodeRole::Leader {
            warn!(from = leader, term = self.term, "append from another leader in the same term");
            return Ok(());
        }
        self.follow(leader, now)?;

        let last = self.store.last_index();
        if prev_log_index > last {
            self.send(
                leader,
                MessageBody::AppendEntriesResponse {
                    success: false,
                    last_index: last,
                },
            );
            return Ok(());
        }
        if let Some(term) = self.store.term_at(prev_log_index)? {
            if term != prev_log_term {
                debug!(prev_log_index, term, prev_log_term, "log mismatch");
                let hint = prev_log_index.saturating_sub(1).max(self.commit_index);
                self.send(
                    leader,
                    MessageBody::AppendEntriesResponse {
                        success: false,
                        last_index: hint,
                    },
                );
                return Ok(());
            }
        }

        let match_index = prev_log_index + entries.len() as u64;
        let mut reload = false;
        let mut append = Vec::new();
        for entry in entries {
            if append.is_empty() && entry.index <= self.store.last_index() {
                match self.store.term_at(entry.index)? {
                    Some(term) if term != entry.term => {
                        if entry.index <= self.commit_index {
                            return Err(DbError::InternalError(anyhow::anyhow!(
                                "leader conflicts with committed entry {}",
                                entry.index
                            )));
                        }
                        warn!(index = entry.index, "truncating conflicting entries");
                        self.store.truncate_after(entry.index - 1)?;
                        reload = true;
                    }
                    _ => continue,
                }
            }
            reload |= matches!(entry.payload, Payload::Membership { .. });
            append.push(entry);
        }
        if !append.is_empty() {
            self.store.append(&append)?;
        }
        if reload {
            self.reload_configurations()?;
        }

        let commit = leader_commit.min(match_index);
        if commit > self.commit_index {
            self.commit_index = commit;
            self.apply_committed(now)?;
        }
        self.send(
            leader,
            MessageBody::AppendEntriesResponse {
                success: true,
                last_index: match_index,
            },
        );
        Ok(())
    }

    /// Record contact from the leader of the current term.
    fn follow(&mut self, leader: NodeId, now: Instant) -> Result<(), DbError> {
        if self.role == NodeRole::Candidate {
            self.become_follower(self.term, Some(leader), now)?;
        }
        if self.leader != Some(leader) {
            info!(leader, term = self.term, "following new leader");
            self.leader = Some(leader);
        }
        self.last_leader_contact = Some(now);
        self.reset_election_timer(now);
        Ok(())
    }

    fn handle_append_response(
        &mut self,
        from: NodeId,
        success: bool,
        last_index: u64,
        now: Instant,
    ) -> Result<(), DbError> {
        if self.role != NodeRole::Leader {
            return Ok(());
        }
        let last = self.store.last_index();
        let Some(progress) = self.progress.get_mut(&from) else {
            return Ok(());
        };
        progress.last_contact = now;
        if !success {
            progress.next_index = (last_index + 1)
                .min(progress.next_index.saturating_sub(1))
                .max(progress.match_index + 1);
            return self.send_append(from, now);
        }
        progress.match_index = progress.match_index.max(last_index);
        progress.next_index = progress.match_index + 1;
        let behind = progress.next_index <= last;
        self.acknowledged(now)?;
        if behind && self.role == NodeRole::Leader {
            self.send_append(from, now)?;
        }
        Ok(())
    }

    fn handle_install_snapshot(
        &mut self,
        leader: NodeId,
        snapshot: Snapshot,
        now: Instant,
    ) -> Result<(), DbError> {
        if self.role == NodeRole::Leader {
            return Ok(());
        }
        self.follow(leader, now)?;
        if snapshot.last_index <= self.commit_index {
            let last_index = self.commit_index;
            self.send(leader, MessageBody::InstallSnapshotResponse { last_index });
            return Ok(());
        }
        info!(
            leader,
            last_index = snapshot.last_index,
            last_term = snapshot.last_term,
            "installing snapshot"
        );
        self.fsm.restore(&snapshot)?;
        self.store.install_snapshot(&snapshot)?;
        self.snapshot_config = snapshot.configuration.clone();
        self.commit_index = snapshot.last_index;
        self.last_applied = snapshot.last_index;
        self.reload_configurations()?;
        counter!(SNAPSHOTS_TOTAL, "kind" => "installed").increment(1);
        self.send(
            leader,
            MessageBody::InstallSnapshotResponse {
                last_index: snapshot.last_index,
            },
        );
        Ok(())
    }

    fn handle_snapshot_response(
        &mut self,
        from: NodeId,
        last_index: u64,
        now: Instant,
    ) -> Result<(), DbError> {
        if self.role != NodeRole::Leader {
            return Ok(());
        }
        let last = self.store.last_index();
        let Some(progress) = self.progress.get_mut(&from) else {
            return Ok(());
        };
        progress.last_contact = now;
        progress.snapshot_sent = None;
        progress.match_index = progress.match_index.max(last_index);
        progress.next_index = progress.match_index + 1;
        let behind = progress.next_index <= last;
        self.acknowledged(now)?;
        if behind && self.role == NodeRole::Leader {
            self.send_append(from, now)?;
        }
        Ok(())
    }

    /// Follow-up work after a peer's match index moved.
    fn acknowledged(&mut self, now: Instant) -> Result<(), DbError> {
        self.maybe_commit(now)?;
        if self.role != NodeRole::Leader {
            return Ok(());
        }
        self.check_promotion(now)?;
        self.check_transfer();
        Ok(())
    }

    fn handle_timeout_now(&mut self, now: Instant) -> Result<(), DbError> {
        if self.role == NodeRole::Leader || !self.can_campaign() {
            return Ok(());
        }
        info!(term = self.term, "asked to take over leadership");
        self.campaign(now, true)
    }

    // -- Role transitions -----------------------------------------------------

    fn can_campaign(&self) -> bool {
        self.latest_config().is_voter(self.id)
    }

    fn campaign(&mut self, now: Instant, disrupt_leader: bool) -> Result<(), DbError> {
        self.role = NodeRole::Candidate;
        self.term += 1;
        self.voted_for = Some(self.id);
        self.leader = None;
        self.persist()?;
        self.votes = BTreeSet::from([self.id]);
        self.reset_election_timer(now);
        counter!(ELECTIONS_TOTAL).increment(1);
        info!(term = self.term, transfer = disrupt_leader, "starting election");

        let me = self.id;
        if self.joint_quorum(|id| id == me) {
            return self.become_leader(now);
        }
        let last_log_index = self.store.last_index();
        let last_log_term = self.last_log_term()?;
        for voter in self.voters() {
            if voter != me {
                self.send(
                    voter,
                    MessageBody::RequestVote {
                        last_log_index,
                        last_log_term,
                        disrupt_leader,
                    },
                );
            }
        }
        Ok(())
    }

    fn become_leader(&mut self, now: Instant) -> Result<(), DbError> {
        info!(term = self.term, "became leader");
        counter!(LEADER_CHANGES_TOTAL).increment(1);
        self.role = NodeRole::Leader;
        self.leader = Some(self.id);
        self.votes.clear();
        self.progress.clear();
        self.sync_progress(now);
        self.barrier_index = self.append(Payload::Barrier, now)?;
        self.broadcast_append(now)?;
        self.maybe_commit(now)
    }

    fn become_follower(
        &mut self,
        term: u64,
        leader: Option<NodeId>,
        now: Instant,
    ) -> Result<(), DbError> {
        let term_increased = term > self.term;
        if term_increased {
            self.term = term;
            self.voted_for = None;
            self.persist()?;
        }
        let was_leader = self.role == NodeRole::Leader;
        self.role = NodeRole::Follower;
        self.leader = leader;
        self.votes.clear();
        if was_leader {
            info!(term = self.term, "stepping down");
            self.progress.clear();
            for (_, pending) in std::mem::take(&mut self.pending) {
                let _ = pending.reply.send(Err(DbError::LeadershipLost));
            }
            if let Some(promotion) = self.promotion.take() {
                let _ = promotion.reply.send(Err(DbError::LeadershipLost));
            }
            if let Some(transfer) = self.transfer.take() {
                let outcome = if term_increased {
                    info!(target = transfer.target, "leadership transferred");
                    Ok(())
                } else {
                    Err(DbError::LeadershipLost)
                };
                let _ = transfer.reply.send(outcome);
            }
        }
        self.reset_election_timer(now);
        Ok(())
    }

    // -- Replication ----------------------------------------------------------

    fn append(&mut self, payload: Payload, now: Instant) -> Result<u64, DbError> {
        let index = self.store.last_index() + 1;
        let configuration = payload.configuration().cloned();
        self.store
            .append(&[LogEntry::new(index, self.term, payload)])?;
        if let Some(configuration) = configuration {
            self.pending_config = Some((index, configuration));
            self.sync_progress(now);
        }
        Ok(index)
    }

    /// Nodes the leader replicates to: voters and standbys of either
    /// table, plus a node being caught up for promotion.
    fn replication_targets(&self) -> BTreeSet<NodeId> {
        let mut targets: BTreeSet<NodeId> = self
            .configs()
            .flat_map(|c| c.nodes())
            .filter(|n| n.role != Role::Spare)
            .map(|n| n.id)
            .collect();
        if let Some(promotion) = &self.promotion {
            targets.insert(promotion.id);
        }
        targets.remove(&self.id);
        targets
    }

    fn sync_progress(&mut self, now: Instant) {
        if self.role != NodeRole::Leader {
            return;
        }
        let targets = self.replication_targets();
        self.progress.retain(|id, _| targets.contains(id));
        let next_index = self.store.last_index() + 1;
        for id in targets {
            self.progress.entry(id).or_insert(Progress {
                next_index,
                match_index: 0,
                last_contact: now,
                snapshot_sent: None,
            });
        }
    }

    fn broadcast_append(&mut self, now: Instant) -> Result<(), DbError> {
        let peers: Vec<NodeId> = self.progress.keys().copied().collect();
        for peer in peers {
            self.send_append(peer, now)?;
        }
        self.next_heartbeat = now + self.config.heartbeat_interval;
        Ok(())
    }

    fn send_append(&mut self, to: NodeId, now: Instant) -> Result<(), DbError> {
        let Some(progress) = self.progress.get(&to) else {
            return Ok(());
        };
        let next_index = progress.next_index.max(1);
        let snapshot_sent = progress.snapshot_sent;
        let prev_log_index = next_index - 1;
        let prev_term = if next_index < self.store.first_index() {
            None
        } else {
            self.store.term_at(prev_log_index)?
        };
        let Some(prev_log_term) = prev_term else {
            return self.send_snapshot(to, snapshot_sent, now);
        };
        let entries = self.store.entries(
            next_index,
            self.store.last_index(),
            self.config.max_append_entries,
        )?;
        self.send(
            to,
            MessageBody::AppendEntries {
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: self.commit_index,
            },
        );
        Ok(())
    }

    fn send_snapshot(
        &mut self,
        to: NodeId,
        sent: Option<Instant>,
        now: Instant,
    ) -> Result<(), DbError> {
        if sent.is_some_and(|at| now.duration_since(at) < self.config.election_timeout) {
            return Ok(());
        }
        let Some(snapshot) = self.store.load_snapshot()? else {
            warn!(to, "peer needs compacted entries but no snapshot is stored");
            return Ok(());
        };
        info!(to, last_index = snapshot.last_index, "sending snapshot");
        if let Some(progress) = self.progress.get_mut(&to) {
            progress.snapshot_sent = Some(now);
        }
        self.send(
            to,
            MessageBody::InstallSnapshot {
                snapshot: Box::new(snapshot),
            },
        );
        Ok(())
    }

    fn match_of(&self, id: NodeId) -> u64 {
        if id == self.id {
            return self.store.last_index();
        }
        self.progress.get(&id).map_or(0, |p| p.match_index)
    }

    fn maybe_commit(&mut self, now: Instant) -> Result<(), DbError> {
        if self.role != NodeRole::Leader {
            return Ok(());
        }
        let mut commit = self.commit_index;
        let mut index = self.store.last_index();
        while index > self.commit_index {
            // Only entries of the current term are committed by counting.
            if self.store.term_at(index)? != Some(self.term) {
                break;
            }
            if self.joint_quorum(|id| self.match_of(id) >= index) {
                commit = index;
                break;
            }
            index -= 1;
        }
        if commit > self.commit_index {
            self.commit_index = commit;
            self.apply_committed(now)?;
        }
        Ok(())
    }

    fn apply_committed(&mut self, now: Instant) -> Result<(), DbError> {
        while self.last_applied < self.commit_index {
            let from = self.last_applied + 1;
            let batch = self.store.entries(from, self.commit_index, BATCH)?;
            if batch.is_empty() {
                return Err(DbError::InternalError(anyhow::anyhow!(
                    "committed entry {from} is missing from the log"
                )));
            }
            for entry in batch {
                let result = self.fsm.apply(&entry);
                self.last_applied = entry.index;
                if let Some(pending) = self.pending.remove(&entry.index) {
                    let outcome = if pending.term == entry.term {
                        result
                    } else {
                        Err(DbError::LeadershipLost)
                    };
                    let _ = pending.reply.send(outcome);
                }
            }
        }
        self.commit_configurations(now)?;
        self.maybe_snapshot()
    }

    fn commit_configurations(&mut self, now: Instant) -> Result<(), DbError> {
        let Some((index, _)) = &self.pending_config else {
            return Ok(());
        };
        if *index > self.commit_index {
            return Ok(());
        }
        if let Some((index, configuration)) = self.pending_config.take() {
            debug!(index, "membership change committed");
            self.committed_config = configuration;
        }
        if self.role == NodeRole::Leader {
            if self.committed_config.is_voter(self.id) {
                self.sync_progress(now);
            } else {
                info!(term = self.term, "no longer a voter, stepping down");
                self.become_follower(self.term, None, now)?;
            }
        }
        Ok(())
    }

    fn maybe_snapshot(&mut self) -> Result<(), DbError> {
        let threshold = self.config.snapshot_threshold;
        let meta = self.store.snapshot_meta();
        if threshold == 0 || self.last_applied < meta.last_index + threshold {
            return Ok(());
        }
        let snapshot = self.fsm.snapshot()?;
        self.store
            .save_snapshot(&snapshot, self.config.snapshot_trailing)?;
        self.snapshot_config = snapshot.configuration;
        counter!(SNAPSHOTS_TOTAL, "kind" => "taken").increment(1);
        info!(
            last_index = snapshot.last_index,
            first_index = self.store.first_index(),
            "took snapshot"
        );
        Ok(())
    }

    fn check_promotion(&mut self, now: Instant) -> Result<(), DbError> {
        let ready = self
            .promotion
            .as_ref()
            .is_some_and(|p| self.match_of(p.id) >= self.store.last_index());
        if !ready {
            return Ok(());
        }
        let Some(promotion) = self.promotion.take() else {
            return Ok(());
        };
        let change = MembershipChange::Assign {
            id: promotion.id,
            role: promotion.role,
        };
        match self.latest_config().apply_change(&change) {
            Ok(configuration) => {
                info!(%change, "node caught up, proposing role change");
                self.propose_entry(
                    Payload::Membership {
                        change,
                        configuration,
                    },
                    promotion.reply,
                    now,
                )
            }
            Err(err) => {
                let _ = promotion.reply.send(Err(err));
                Ok(())
            }
        }
    }

    fn check_transfer(&mut self) {
        let last = self.store.last_index();
        let target = match &self.transfer {
            Some(t) if !t.timeout_sent && self.match_of(t.target) >= last => t.target,
            _ => return,
        };
        if let Some(transfer) = self.transfer.as_mut() {
            transfer.timeout_sent = true;
        }
        info!(target, "transfer target caught up");
        self.send(target, MessageBody::TimeoutNow);
    }

    fn most_up_to_date_voter(&self) -> Option<NodeId> {
        self.latest_config()
            .voter_ids()
            .filter(|id| *id != self.id)
            .max_by_key(|id| (self.match_of(*id), std::cmp::Reverse(*id)))
    }

    // -- Configurations -------------------------------------------------------

    fn latest_config(&self) -> &Configuration {
        self.pending_config
            .as_ref()
            .map(|(_, c)| c)
            .unwrap_or(&self.committed_config)
    }

    fn configs(&self) -> impl Iterator<Item = &Configuration> {
        std::iter::once(&self.committed_config).chain(self.pending_config.as_ref().map(|(_, c)| c))
    }

    fn voters(&self) -> BTreeSet<NodeId> {
        self.configs().flat_map(|c| c.voter_ids()).collect()
    }

    /// Majority of voters in every non-empty table.
    fn joint_quorum<F>(&self, acks: F) -> bool
    where
        F: Fn(NodeId) -> bool,
    {
        let mut counted = false;
        for config in self.configs() {
            if config.voter_count() == 0 {
                continue;
            }
            if !config.has_quorum(&acks) {
                return false;
            }
            counted = true;
        }
        counted
    }

    /// Rebuild the committed and pending tables from the snapshot and the
    /// membership entries that follow it.
    fn reload_configurations(&mut self) -> Result<(), DbError> {
        let mut committed = self.snapshot_config.clone();
        let mut pending: Option<(u64, Configuration)> = None;
        let last = self.store.last_index();
        let mut next = self.store.snapshot_meta().last_index + 1;
        while next <= last {
            let batch = self.store.entries(next, last, BATCH)?;
            let Some(tail) = batch.last() else {
                break;
            };
            next = tail.index + 1;
            for entry in batch {
                if let Payload::Membership {
                    change,
                    configuration,
                } = entry.payload
                {
                    if entry.index <= self.commit_index || change == MembershipChange::Bootstrap {
                        committed = configuration;
                        pending = None;
                    } else {
                        if let Some((_, previous)) = pending.take() {
                            committed = previous;
                        }
                        pending = Some((entry.index, configuration));
                    }
                }
            }
        }
        self.committed_config = committed;
        self.pending_config = pending;
        Ok(())
    }

    // -- Helpers --------------------------------------------------------------

    fn persist(&mut self) -> Result<(), DbError> {
        self.store.persist(self.term, self.voted_for)?;
        Ok(())
    }

    fn last_log_term(&self) -> Result<u64, DbError> {
        Ok(self
            .store
            .term_at(self.store.last_index())?
            .unwrap_or(0))
    }

    fn address_of(&self, id: NodeId) -> Option<String> {
        if id == self.id {
            return Some(self.address.clone());
        }
        self.latest_config()
            .get(id)
            .or_else(|| self.committed_config.get(id))
            .map(|n| n.address.clone())
            .or_else(|| self.addresses.get(&id).cloned())
    }

    fn leader_info(&self) -> Option<NodeInfo> {
        let id = self.leader?;
        let role = self.latest_config().role_of(id).unwrap_or(Role::Voter);
        Some(NodeInfo::new(
            id,
            self.address_of(id).unwrap_or_default(),
            role,
        ))
    }

    fn send(&mut self, to: NodeId, body: MessageBody) {
        let Some(address) = self.address_of(to) else {
            debug!(to, kind = body.kind(), "no address for peer, dropping message");
            return;
        };
        self.outbox.push(Outgoing {
            to,
            address,
            message: Message {
                from: self.id,
                from_address: self.address.clone(),
                term: self.term,
                body,
            },
        });
    }
}

use crate::commit_stream::{AppDelivery, CommitPublisher, CommittedEntry};
use crate::config::{RaftConfig, RaftOptionsValidated};
use crate::consensus::graph::RaftGraph;
use crate::consensus::machine::{RaftMachine, Role};
use crate::consensus::messages::{
    AcceptReply, AppendEntries, ClientPropose, ClientResult, CommitNotify, RaftMsg, RejectCode,
    RejectReply, ResultCode, VoteReply, VoteRequest,
};
use crate::logstore::{LogEntry, LogStore, StoreError};
use crate::scheduler::{Scheduler, TimerHandle, TimerKind};
use crate::types::{Index, PeerId, Term};
use rand::Rng;
use slog::Logger;
use std::collections::VecDeque;
use tokio::time::Duration;

/// A message to hand to the transport, directed at one peer. `to == self` is
/// a local delivery the actor resolves without touching the network.
#[derive(Debug)]
pub struct Outbound {
    pub to: PeerId,
    pub msg: RaftMsg,
}

impl Outbound {
    pub fn new(to: PeerId, msg: RaftMsg) -> Outbound {
        Outbound { to, msg }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PeerCreateError {
    #[error("invalid options: {0}")]
    InvalidOptions(&'static str),
    #[error("node {0} is not in the configured peer set")]
    NotInPeerSet(PeerId),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Conditions the consensus layer cannot recover from. The actor loop logs
/// these at crit and exits; operator intervention is required.
#[derive(Debug, thiserror::Error)]
pub enum FatalError {
    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),
    #[error(
        "rollback to index {requested} reaches below the compacted start {start}; \
         the majority holds data this node cannot reconstruct"
    )]
    DataLoss { requested: Index, start: Index },
}

enum CatchUp {
    /// Anchor matched; queued entries were applied.
    Ok,
    /// The leader's bookkeeping for us is ahead of reality; accept without
    /// mutation so the reply corrects its view.
    LeaderAhead,
    /// Anchor mismatch; the suffix was rolled back.
    Conflict,
}

/// RaftPeer is the single-writer orchestrator for one cluster member. It
/// exclusively owns the local RaftMachine (inside the graph), the peer views,
/// and the LogStore; all entry points are reached only through the actor
/// mailbox, so none of this state needs internal locking.
pub struct RaftPeer<S: Scheduler> {
    id: PeerId,
    store: LogStore,
    graph: RaftGraph,
    scheduler: S,
    options: RaftOptionsValidated,
    publisher: CommitPublisher,
    /// Entries received ahead of a matching anchor, held until the log
    /// catches up. Discarded on any conflict.
    log_queue: VecDeque<LogEntry>,
    tick_timer: Option<TimerHandle>,
    elect_timer: Option<TimerHandle>,
    heartbeat_timer: Option<TimerHandle>,
    _snapshot_timer: TimerHandle,
    logger: Logger,
}

impl<S: Scheduler> RaftPeer<S> {
    pub fn new(
        config: &RaftConfig,
        scheduler: S,
        publisher: CommitPublisher,
        logger: Logger,
    ) -> Result<RaftPeer<S>, PeerCreateError> {
        let options = RaftOptionsValidated::try_from(config.options.clone())
            .map_err(PeerCreateError::InvalidOptions)?;
        if !config.contains_member(config.self_id) {
            return Err(PeerCreateError::NotInPeerSet(config.self_id));
        }
        let logger = logger.new(slog::o!("peer" => format!("{}", config.self_id)));

        let store = LogStore::open(
            &config.base_dir,
            options.max_segment_size,
            &config.peers,
            &config.gates,
            logger.clone(),
        )?;

        // Durable membership wins over configuration once recorded.
        let member_ids: Vec<PeerId> = store.meta().peer_set.iter().map(|n| n.id).collect();
        let local = RaftMachine::local(config.self_id, &store);
        let graph = RaftGraph::new(local, member_ids.into_iter().filter(|id| *id != config.self_id));

        let snapshot_timer = scheduler.schedule_repeating(options.snapshot_interval, TimerKind::Snapshot);
        let mut peer = RaftPeer {
            id: config.self_id,
            store,
            graph,
            scheduler,
            options,
            publisher,
            log_queue: VecDeque::new(),
            tick_timer: None,
            elect_timer: None,
            heartbeat_timer: None,
            _snapshot_timer: snapshot_timer,
            logger,
        };
        peer.arm_tick();
        Ok(peer)
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    fn local(&self) -> &RaftMachine {
        self.graph.machine(self.id).unwrap_or_else(|| unreachable!())
    }

    /// Entry point for every decoded inter-peer message.
    pub fn handle_message(&mut self, from: PeerId, msg: RaftMsg) -> Result<Vec<Outbound>, FatalError> {
        slog::debug!(self.logger, "Handling {} from {}", msg.kind_name(), from);
        match msg {
            RaftMsg::VoteRequest(m) => self.handle_vote_request(m),
            RaftMsg::VoteReply(m) => self.handle_vote_reply(m),
            RaftMsg::AppendEntries(m) => self.handle_append_entries(m),
            RaftMsg::AcceptReply(m) => self.handle_accept_reply(m),
            RaftMsg::RejectReply(m) => self.handle_reject_reply(m),
            RaftMsg::ClientPropose(m) => self.handle_propose(m),
            // Terminal deliveries for the application on this node; the
            // actor resolves them against its pending callbacks / stream.
            RaftMsg::ClientResult(m) => Ok(vec![Outbound::new(self.id, RaftMsg::ClientResult(m))]),
            RaftMsg::CommitNotify(m) => Ok(vec![Outbound::new(self.id, RaftMsg::CommitNotify(m))]),
        }
    }

    pub fn handle_timer(&mut self, kind: TimerKind) -> Result<Vec<Outbound>, FatalError> {
        match kind {
            TimerKind::Tick => self.handle_tick_timeout(),
            TimerKind::Elect => self.handle_elect_timeout(),
            TimerKind::Heartbeat => self.handle_heartbeat_timeout(),
            TimerKind::Snapshot => self.handle_snapshot_timeout().map(|()| Vec::new()),
        }
    }

    // ---- elections ----

    fn handle_vote_request(&mut self, m: VoteRequest) -> Result<Vec<Outbound>, FatalError> {
        if let Some(view) = self.graph.machine_mut(m.candidate) {
            view.term = m.term;
            view.index = m.index;
            view.index_term = m.index_term;
            view.applied = m.accept;
            view.commit = m.commit;
            view.candidate = m.candidate;
            view.role = Role::Candidate;
        } else {
            slog::warn!(self.logger, "Vote request from unknown peer {}", m.candidate);
            return Ok(Vec::new());
        }

        let my_term = self.local().term;
        if m.term < my_term {
            return Ok(vec![self.reject(m.candidate, RejectCode::LowerTerm)]);
        }
        if m.term > my_term {
            self.heartbeat_timer = None;
            self.elect_timer = None;
            let machine = self.graph.machine_mut(self.id).unwrap_or_else(|| unreachable!());
            machine.follow_term(m.term, &mut self.store)?;
        }

        let my = self.local().clone();
        match my.role {
            Role::Follower => {
                if my.term == m.term && my.candidate.is_valid() && my.candidate != m.candidate {
                    return Ok(vec![self.reject(m.candidate, RejectCode::AlreadyVote)]);
                }
                // Grant only when the candidate is at least as advanced on
                // every axis. A longer log written in a stale term can still
                // be missing committed entries, so no single field may trump
                // the others.
                let candidate_covers_us =
                    my.index <= m.index && my.index_term <= m.index_term && my.commit <= m.commit;
                if candidate_covers_us {
                    self.grant_ballot(m.candidate, m.term)
                } else {
                    // Self makes a better candidate.
                    let mut outs = vec![self.reject(m.candidate, RejectCode::Obsolete)];
                    outs.extend(self.vote4me()?);
                    Ok(outs)
                }
            }
            Role::Elector | Role::Candidate => {
                if my.candidate == m.candidate && my.term == m.term {
                    // Re-delivered request; re-grant the same ballot.
                    self.grant_ballot(m.candidate, m.term)
                } else {
                    Ok(vec![self.reject(m.candidate, RejectCode::AlreadyVote)])
                }
            }
            Role::Leader => Ok(vec![self.reject(m.candidate, RejectCode::IllegalState)]),
        }
    }

    fn grant_ballot(&mut self, candidate: PeerId, term: Term) -> Result<Vec<Outbound>, FatalError> {
        self.heartbeat_timer = None;
        {
            let machine = self.graph.machine_mut(self.id).unwrap_or_else(|| unreachable!());
            machine.be_elector(candidate, term, &mut self.store)?;
        }
        // The elect timer guards against a candidate that silently fails.
        self.tick_timer = None;
        self.elect_timer = Some(self.scheduler.schedule(self.options.elect_timeout, TimerKind::Elect));
        slog::info!(self.logger, "Granted ballot to {} in term {}", candidate, term);

        let my = self.local();
        Ok(vec![Outbound::new(
            candidate,
            RaftMsg::VoteReply(VoteReply {
                elector: self.id,
                term: my.term,
                index: my.index,
                index_term: my.index_term,
                candidate,
                commit: my.commit,
            }),
        )])
    }

    fn vote4me(&mut self) -> Result<Vec<Outbound>, FatalError> {
        self.heartbeat_timer = None;
        {
            let machine = self.graph.machine_mut(self.id).unwrap_or_else(|| unreachable!());
            machine.be_candidate(&mut self.store)?;
        }
        self.tick_timer = None;
        self.elect_timer = Some(self.scheduler.schedule(self.options.elect_timeout, TimerKind::Elect));

        let my = self.local().clone();
        slog::info!(self.logger, "Standing for election in term {}", my.term);
        let mut outs: Vec<Outbound> = self
            .graph
            .peer_ids(self.id)
            .into_iter()
            .map(|peer| {
                Outbound::new(
                    peer,
                    RaftMsg::VoteRequest(VoteRequest {
                        candidate: self.id,
                        elector: peer,
                        term: my.term,
                        index: my.index,
                        index_term: my.index_term,
                        accept: my.applied,
                        commit: my.commit,
                    }),
                )
            })
            .collect();

        // Single-node cluster: the own ballot already is the majority.
        if self.graph.is_major_accept_candidate(self.id, my.term) {
            outs.extend(self.step_up()?);
        }
        Ok(outs)
    }

    fn handle_vote_reply(&mut self, m: VoteReply) -> Result<Vec<Outbound>, FatalError> {
        if let Some(view) = self.graph.machine_mut(m.elector) {
            view.term = m.term;
            view.index = m.index;
            view.index_term = m.index_term;
            view.candidate = m.candidate;
            view.commit = m.commit;
            view.role = Role::Elector;
        } else {
            return Ok(Vec::new());
        }

        let my = self.local().clone();
        if m.term > my.term {
            self.step_down(m.term)?;
            return Ok(Vec::new());
        }
        if my.role == Role::Candidate
            && m.term == my.term
            && m.candidate == self.id
            && self.graph.is_major_accept_candidate(self.id, my.term)
        {
            return self.step_up();
        }
        Ok(Vec::new())
    }

    fn step_up(&mut self) -> Result<Vec<Outbound>, FatalError> {
        self.tick_timer = None;
        self.elect_timer = None;
        {
            let machine = self.graph.machine_mut(self.id).unwrap_or_else(|| unreachable!());
            machine.be_leader();
        }
        let my = self.local().clone();
        slog::info!(self.logger, "Won election, leading term {} from index {}", my.term, my.index);
        self.heartbeat_timer = Some(
            self.scheduler
                .schedule_repeating(self.options.heartbeat_interval, TimerKind::Heartbeat),
        );

        let mut outs = self.broadcast_appends()?;
        outs.extend(self.advance_commit()?);
        Ok(outs)
    }

    fn step_down(&mut self, term: Term) -> Result<(), FatalError> {
        let my = self.local().clone();
        if my.role > Role::Follower {
            slog::info!(self.logger, "Stepping down from {:?} at term {} to follower at term {}", my.role, my.term, term);
        }
        self.heartbeat_timer = None;
        self.elect_timer = None;
        {
            let machine = self.graph.machine_mut(self.id).unwrap_or_else(|| unreachable!());
            machine.follow_term(term, &mut self.store)?;
        }
        self.arm_tick();
        Ok(())
    }

    // ---- replication ----

    fn handle_append_entries(&mut self, m: AppendEntries) -> Result<Vec<Outbound>, FatalError> {
        let my_term = self.local().term;
        if m.term < my_term {
            return Ok(vec![self.reject(m.leader, RejectCode::LowerTerm)]);
        }
        if self.local().role == Role::Leader && m.term == my_term {
            slog::error!(self.logger, "Second leader {} claims term {}", m.leader, m.term);
            return Ok(vec![self.reject(m.leader, RejectCode::IllegalState)]);
        }

        self.heartbeat_timer = None;
        self.elect_timer = None;
        {
            let machine = self.graph.machine_mut(self.id).unwrap_or_else(|| unreachable!());
            machine.follow_leader(m.leader, m.term, &mut self.store)?;
        }
        self.arm_tick();

        if let Some(view) = self.graph.machine_mut(m.leader) {
            view.term = m.term;
            view.leader = m.leader;
            view.role = Role::Leader;
            view.commit = m.commit;
            view.applied = m.accept;
            let floor = m.pre_index.plus(m.entries.len() as u64);
            if view.index.is_nan() || view.index < floor {
                view.index = floor;
            }
        }

        self.enqueue(m.entries);
        match self.catch_up(m.pre_index, m.pre_index_term)? {
            CatchUp::Ok => {
                self.follower_commit(m.commit)?;
                Ok(vec![self.accept(m.leader)])
            }
            CatchUp::LeaderAhead => Ok(vec![self.accept(m.leader)]),
            CatchUp::Conflict => {
                self.log_queue.clear();
                Ok(vec![self.reject(m.leader, RejectCode::Conflict)])
            }
        }
    }

    /// Merges freshly received entries into the pending queue, deduplicating
    /// by index: anything queued at or after the first new entry is replaced.
    fn enqueue(&mut self, entries: Vec<LogEntry>) {
        if entries.is_empty() {
            return;
        }
        let first = entries[0].index;
        while matches!(self.log_queue.back(), Some(tail) if tail.index >= first) {
            self.log_queue.pop_back();
        }
        if matches!(self.log_queue.back(), Some(tail) if tail.index.plus(1) != first) {
            // Disjoint from what was buffered; the older run is stale.
            self.log_queue.clear();
        }
        self.log_queue.extend(entries);
    }

    fn catch_up(&mut self, pre_index: Index, pre_index_term: Term) -> Result<CatchUp, FatalError> {
        let my = self.local().clone();
        if my.index < pre_index {
            return Ok(CatchUp::LeaderAhead);
        }

        let anchor_ok = if pre_index == Index::ZERO {
            true
        } else if pre_index == my.index {
            my.index_term == pre_index_term
        } else if pre_index < self.store.start_index() {
            // Compacted, hence committed, hence matching by log matching.
            true
        } else {
            self.store.entry_term(pre_index)? == Some(pre_index_term)
        };
        if !anchor_ok {
            self.roll_back(pre_index.minus(1))?;
            return Ok(CatchUp::Conflict);
        }

        while let Some(front) = self.log_queue.front() {
            let end = self.store.end_index();
            if front.index <= end {
                match self.store.entry_term(front.index)? {
                    Some(term) if term == front.term => {
                        // Already stored; re-delivery is a no-op.
                        self.log_queue.pop_front();
                    }
                    Some(_) => {
                        let conflict_at = front.index;
                        self.roll_back(conflict_at.minus(1))?;
                        return Ok(CatchUp::Conflict);
                    }
                    None => {
                        // Below the compacted start; covered by the snapshot.
                        self.log_queue.pop_front();
                    }
                }
            } else if front.index == end.plus(1) {
                let entry = self.log_queue.pop_front().unwrap_or_else(|| unreachable!());
                self.store.append(&entry)?;
                let machine = self.graph.machine_mut(self.id).unwrap_or_else(|| unreachable!());
                machine.append_log(entry.index, entry.term);
            } else {
                // Gap ahead of the local end; keep buffered until it closes.
                break;
            }
        }
        Ok(CatchUp::Ok)
    }

    fn roll_back(&mut self, new_end: Index) -> Result<(), FatalError> {
        let start = self.store.start_index();
        if new_end.plus(1) < start {
            slog::crit!(
                self.logger,
                "Rollback to {} requested but the log is compacted from {}; halting",
                new_end,
                start
            );
            return Err(FatalError::DataLoss {
                requested: new_end,
                start,
            });
        }
        let tail = self.store.truncate_suffix(new_end)?;
        let snapshot_term = self.store.snapshot().term;
        let machine = self.graph.machine_mut(self.id).unwrap_or_else(|| unreachable!());
        match tail {
            Some(entry) => machine.roll_back(entry.index, entry.term),
            None if new_end == Index::ZERO => machine.roll_back(Index::ZERO, Term::ZERO),
            // Rolled back exactly to the compaction boundary.
            None => machine.roll_back(new_end, snapshot_term),
        }
        slog::info!(self.logger, "Rolled back to index {}", new_end);
        Ok(())
    }

    /// Advances follower commit/applied toward the leader's commit and hands
    /// each newly applied entry to the application.
    fn follower_commit(&mut self, leader_commit: Index) -> Result<(), FatalError> {
        let my = self.local().clone();
        let target = leader_commit.min(my.index);
        if target <= my.commit {
            return Ok(());
        }
        {
            let machine = self.graph.machine_mut(self.id).unwrap_or_else(|| unreachable!());
            machine.commit(target, &mut self.store)?;
        }
        self.apply_up_to_commit()?;
        Ok(())
    }

    fn apply_up_to_commit(&mut self) -> Result<(), FatalError> {
        let my = self.local().clone();
        let target = my.commit.min(my.index);
        let mut next = my.applied.plus(1);
        while next <= target {
            if let Some(entry) = self.store.entry(next)? {
                self.publisher.publish(AppDelivery::Committed(CommittedEntry {
                    index: entry.index,
                    term: entry.term,
                    client: entry.client,
                    origin: entry.origin,
                    sub_type: entry.sub_type,
                    payload: entry.payload,
                }));
            }
            next = next.plus(1);
        }
        let machine = self.graph.machine_mut(self.id).unwrap_or_else(|| unreachable!());
        machine.apply(&mut self.store)?;
        Ok(())
    }

    fn accept(&self, leader: PeerId) -> Outbound {
        let my = self.local();
        Outbound::new(
            leader,
            RaftMsg::AcceptReply(AcceptReply {
                follower: self.id,
                term: my.term,
                catch_up_index: my.index,
                catch_up_term: my.index_term,
                commit: my.commit,
                leader,
            }),
        )
    }

    fn reject(&self, to: PeerId, code: RejectCode) -> Outbound {
        let my = self.local();
        Outbound::new(
            to,
            RaftMsg::RejectReply(RejectReply {
                peer: self.id,
                term: my.term,
                index: my.index,
                index_term: my.index_term,
                accept: my.applied,
                commit: my.commit,
                reject_to: to,
                candidate: my.candidate,
                leader: my.leader,
                code,
                state: my.role,
            }),
        )
    }

    fn handle_accept_reply(&mut self, m: AcceptReply) -> Result<Vec<Outbound>, FatalError> {
        if let Some(view) = self.graph.machine_mut(m.follower) {
            view.term = m.term;
            view.index = m.catch_up_index;
            view.index_term = m.catch_up_term;
            view.match_index = m.catch_up_index;
            view.commit = m.commit;
            view.leader = m.leader;
            view.role = Role::Follower;
        } else {
            return Ok(Vec::new());
        }

        let my = self.local().clone();
        if m.term > my.term {
            self.step_down(m.term)?;
            return Ok(Vec::new());
        }
        if !my.is_leader() || m.term < my.term {
            return Ok(Vec::new());
        }

        let mut outs = self.advance_commit()?;
        if m.catch_up_index < self.store.end_index() {
            // Keep a lagging follower moving without waiting for the
            // next heartbeat.
            outs.push(self.create_append(m.follower, usize::MAX)?);
        }
        Ok(outs)
    }

    /// Leader-side commit: walk forward one index at a time while a majority
    /// durably holds it, applying and fanning out CommitNotify as we go.
    fn advance_commit(&mut self) -> Result<Vec<Outbound>, FatalError> {
        let mut outs = Vec::new();
        loop {
            let my = self.local().clone();
            let next = my.commit.plus(1);
            if next > my.index || !self.graph.is_major_accept_leader(my.term, next) {
                break;
            }
            let entry = match self.store.entry(next)? {
                Some(entry) => entry,
                None => {
                    return Err(FatalError::Storage(StoreError::Corrupt(format!(
                        "committed index {next} is missing from the store"
                    ))))
                }
            };
            {
                let machine = self.graph.machine_mut(self.id).unwrap_or_else(|| unreachable!());
                machine.commit(next, &mut self.store)?;
            }
            slog::debug!(self.logger, "Committed index {} at term {}", next, my.term);
            self.apply_up_to_commit()?;
            // Route the commit notification to whichever node owns the
            // original caller.
            outs.push(Outbound::new(
                entry.client,
                RaftMsg::CommitNotify(CommitNotify {
                    origin: entry.origin,
                    payload: entry.payload,
                }),
            ));
        }
        Ok(outs)
    }

    fn handle_reject_reply(&mut self, m: RejectReply) -> Result<Vec<Outbound>, FatalError> {
        if let Some(view) = self.graph.machine_mut(m.peer) {
            view.term = m.term;
            view.index = m.index;
            view.index_term = m.index_term;
            view.applied = m.accept;
            view.commit = m.commit;
            view.candidate = m.candidate;
            view.leader = m.leader;
            view.role = m.state;
            // match_index is deliberately untouched: a rejecting peer's log
            // is not known to agree with ours.
        } else {
            return Ok(Vec::new());
        }

        let my = self.local().clone();
        if m.term > my.term {
            self.step_down(m.term)?;
            return Ok(Vec::new());
        }

        match m.code {
            RejectCode::Conflict => {
                if my.is_leader() && m.term == my.term {
                    slog::debug!(self.logger, "Follower {} conflicted at {}; re-anchoring", m.peer, m.index);
                    return Ok(vec![self.create_append(m.peer, 1)?]);
                }
                Ok(Vec::new())
            }
            RejectCode::AlreadyVote | RejectCode::Obsolete => {
                if my.role == Role::Candidate
                    && m.term == my.term
                    && self.graph.is_minor_reject(self.id, my.term)
                {
                    slog::info!(self.logger, "Election for term {} cannot succeed", my.term);
                    self.step_down(my.term)?;
                }
                Ok(Vec::new())
            }
            RejectCode::LowerTerm => Ok(Vec::new()),
            RejectCode::IllegalState => {
                slog::warn!(self.logger, "Peer {} rejected us as illegal in state {:?}", m.peer, m.state);
                Ok(Vec::new())
            }
        }
    }

    // ---- proposals ----

    fn handle_propose(&mut self, m: ClientPropose) -> Result<Vec<Outbound>, FatalError> {
        let my = self.local().clone();
        if !my.is_leader() {
            if my.leader.is_valid() {
                return Ok(vec![Outbound::new(my.leader, RaftMsg::ClientPropose(m))]);
            }
            return Ok(vec![self.client_result(&m, ResultCode::NotLeader)]);
        }

        let entry = LogEntry::new(
            self.store.end_index().plus(1),
            my.term,
            m.client,
            m.origin,
            m.sub_type,
            m.payload.clone(),
        );
        match self.store.append(&entry) {
            Ok(()) => {
                let machine = self.graph.machine_mut(self.id).unwrap_or_else(|| unreachable!());
                machine.append_log(entry.index, entry.term);
                let mut outs = vec![self.client_result(&m, ResultCode::Success)];
                outs.extend(self.broadcast_appends()?);
                outs.extend(self.advance_commit()?);
                Ok(outs)
            }
            Err(e) => {
                // Never claim to replicate what was not durably written.
                slog::error!(self.logger, "WAL append failed, stepping down: {}", e);
                self.step_down(my.term)?;
                Ok(vec![self.client_result(&m, ResultCode::WalFailed)])
            }
        }
    }

    fn client_result(&self, m: &ClientPropose, code: ResultCode) -> Outbound {
        Outbound::new(
            m.client,
            RaftMsg::ClientResult(ClientResult {
                client: m.client,
                origin: m.origin,
                sub_type: m.sub_type,
                code,
                payload: bytes::Bytes::new(),
            }),
        )
    }

    fn broadcast_appends(&mut self) -> Result<Vec<Outbound>, FatalError> {
        let peers = self.graph.peer_ids(self.id);
        let mut outs = Vec::with_capacity(peers.len());
        for peer in peers {
            outs.push(self.create_append(peer, usize::MAX)?);
        }
        Ok(outs)
    }

    /// Builds one AppendEntries for `peer`, anchored at that peer's last
    /// known position. Unknown or up-to-date peers get a probe anchored at
    /// our own tip; lagging peers get a byte-bounded batch of their missing
    /// suffix (`limit` further caps the entry count).
    fn create_append(&mut self, peer: PeerId, limit: usize) -> Result<Outbound, FatalError> {
        let my = self.local().clone();
        let view_index = self
            .graph
            .machine(peer)
            .map(|v| v.index)
            .unwrap_or(Index::NAN);

        let (pre_index, pre_index_term, entries) = if view_index.is_nan() || view_index >= my.index {
            (my.index, my.index_term, Vec::new())
        } else if view_index.plus(1) < self.store.start_index() {
            slog::warn!(
                self.logger,
                "Follower {} needs index {} but the log is compacted from {}; awaiting out-of-band snapshot",
                peer,
                view_index.plus(1),
                self.store.start_index()
            );
            (my.index, my.index_term, Vec::new())
        } else {
            let anchor = view_index;
            let anchor_term = if anchor == Index::ZERO {
                Term::ZERO
            } else if anchor.plus(1) == self.store.start_index() {
                self.store.snapshot().term
            } else {
                match self.store.entry_term(anchor)? {
                    Some(term) => term,
                    None => {
                        // View raced past a compaction; probe at our tip.
                        return Ok(self.heartbeat_for(peer, &my));
                    }
                }
            };

            let mut batch = Vec::new();
            let mut bytes = 0u64;
            let mut next = anchor.plus(1);
            while next <= my.index && batch.len() < limit {
                let entry = match self.store.entry(next)? {
                    Some(entry) => entry,
                    None => break,
                };
                bytes += entry.encoded_len() as u64;
                if !batch.is_empty() && bytes > self.options.catch_up_batch_bytes {
                    break;
                }
                batch.push(entry);
                next = next.plus(1);
            }
            (anchor, anchor_term, batch)
        };

        Ok(Outbound::new(
            peer,
            RaftMsg::AppendEntries(AppendEntries {
                leader: self.id,
                term: my.term,
                pre_index,
                pre_index_term,
                accept: my.applied,
                commit: my.commit,
                follower: peer,
                entries,
            }),
        ))
    }

    fn heartbeat_for(&self, peer: PeerId, my: &RaftMachine) -> Outbound {
        Outbound::new(
            peer,
            RaftMsg::AppendEntries(AppendEntries {
                leader: self.id,
                term: my.term,
                pre_index: my.index,
                pre_index_term: my.index_term,
                accept: my.applied,
                commit: my.commit,
                follower: peer,
                entries: Vec::new(),
            }),
        )
    }

    // ---- timers ----

    fn handle_tick_timeout(&mut self) -> Result<Vec<Outbound>, FatalError> {
        if self.local().role != Role::Follower {
            // Stale event from a timer canceled after it fired.
            return Ok(Vec::new());
        }
        slog::debug!(self.logger, "Idle timeout; standing for election");
        self.vote4me()
    }

    fn handle_elect_timeout(&mut self) -> Result<Vec<Outbound>, FatalError> {
        let my = self.local().clone();
        if my.role != Role::Candidate && my.role != Role::Elector {
            return Ok(Vec::new());
        }
        slog::info!(self.logger, "Election for term {} timed out", my.term);
        self.step_down(my.term)?;
        Ok(Vec::new())
    }

    fn handle_heartbeat_timeout(&mut self) -> Result<Vec<Outbound>, FatalError> {
        if !self.local().is_leader() {
            return Ok(Vec::new());
        }
        self.broadcast_appends()
    }

    /// Compaction check. Skipped unless the log is big enough and everything
    /// committed has been applied; compaction must never discard un-applied
    /// data.
    fn handle_snapshot_timeout(&mut self) -> Result<(), FatalError> {
        let my = self.local().clone();
        if self.store.total_size() < self.options.snapshot_min_size {
            return Ok(());
        }
        if my.applied < my.commit || my.applied == Index::ZERO {
            return Ok(());
        }
        let term = if my.applied == my.index {
            my.index_term
        } else {
            match self.store.entry_term(my.applied)? {
                Some(term) => term,
                None => return Ok(()),
            }
        };
        self.store.update_snapshot_meta(my.applied, term)?;
        self.store.truncate_prefix(my.applied.plus(1))?;
        slog::info!(
            self.logger,
            "Snapshot taken at index {} term {}; log now starts at {}",
            my.applied,
            term,
            self.store.start_index()
        );
        Ok(())
    }

    fn arm_tick(&mut self) {
        let min = self.options.tick_min_timeout.as_millis() as u64;
        let max = self.options.tick_max_timeout.as_millis() as u64;
        let delay = Duration::from_millis(rand::thread_rng().gen_range(min..=max));
        self.tick_timer = Some(self.scheduler.schedule(delay, TimerKind::Tick));
    }

    #[cfg(test)]
    pub(crate) fn test_machine(&self) -> &RaftMachine {
        self.local()
    }

    #[cfg(test)]
    pub(crate) fn test_store(&self) -> &LogStore {
        &self.store
    }

    #[cfg(test)]
    pub(crate) fn test_roll_back(&mut self, new_end: Index) -> Result<(), FatalError> {
        self.roll_back(new_end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit_stream;
    use crate::config::{NodeInfo, RaftOptions};
    use bytes::Bytes;
    use slog::Drain;
    use tempfile::TempDir;

    /// Hands out inert handles; tests fire timers by calling handle_timer.
    struct ManualScheduler;

    impl Scheduler for ManualScheduler {
        fn schedule(&self, _delay: Duration, _kind: TimerKind) -> TimerHandle {
            TimerHandle::inert()
        }

        fn schedule_repeating(&self, _period: Duration, _kind: TimerKind) -> TimerHandle {
            TimerHandle::inert()
        }
    }

    fn test_logger() -> Logger {
        let decorator = slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        Logger::root(drain, slog::o!())
    }

    fn config(self_id: u64, member_ids: &[u64], dir: &TempDir, options: RaftOptions) -> RaftConfig {
        RaftConfig {
            self_id: PeerId::new(self_id),
            peers: member_ids
                .iter()
                .map(|id| NodeInfo::new(PeerId::new(*id), "127.0.0.1", 7000 + *id as u16))
                .collect(),
            gates: Vec::new(),
            base_dir: dir.path().to_path_buf(),
            options,
        }
    }

    fn peer_of_three(dir: &TempDir) -> (RaftPeer<ManualScheduler>, crate::commit_stream::CommitStream) {
        let (publisher, stream) = commit_stream::create();
        let peer = RaftPeer::new(
            &config(1, &[1, 2, 3], dir, RaftOptions::default()),
            ManualScheduler,
            publisher,
            test_logger(),
        )
        .unwrap();
        (peer, stream)
    }

    fn elect_leader(peer: &mut RaftPeer<ManualScheduler>) -> Vec<Outbound> {
        let requests = peer.handle_timer(TimerKind::Tick).unwrap();
        assert_eq!(requests.len(), 2);
        let term = peer.test_machine().term;
        let my = peer.test_machine().clone();
        // First grant reaches the majority together with the own ballot.
        peer.handle_message(
            PeerId::new(2),
            RaftMsg::VoteReply(VoteReply {
                elector: PeerId::new(2),
                term,
                index: my.index,
                index_term: my.index_term,
                candidate: PeerId::new(1),
                commit: my.commit,
            }),
        )
        .unwrap()
    }

    fn append_msg(term: u64, pre: (u64, u64), commit: u64, entries: Vec<LogEntry>) -> RaftMsg {
        RaftMsg::AppendEntries(AppendEntries {
            leader: PeerId::new(9),
            term: Term::new(term),
            pre_index: Index::new(pre.0),
            pre_index_term: Term::new(pre.1),
            accept: Index::new(commit),
            commit: Index::new(commit),
            follower: PeerId::new(1),
            entries,
        })
    }

    fn entry(index: u64, term: u64, payload: &'static [u8]) -> LogEntry {
        LogEntry::new(
            Index::new(index),
            Term::new(term),
            PeerId::new(9),
            index,
            0,
            Bytes::from_static(payload),
        )
    }

    #[test]
    fn idle_timeout_starts_candidacy_and_majority_elects_leader() {
        let dir = TempDir::new().unwrap();
        let (mut peer, _stream) = peer_of_three(&dir);

        let requests = peer.handle_timer(TimerKind::Tick).unwrap();
        assert_eq!(peer.test_machine().role, Role::Candidate);
        assert_eq!(peer.test_machine().term, Term::new(1));
        assert!(requests
            .iter()
            .all(|o| matches!(&o.msg, RaftMsg::VoteRequest(v) if v.index == Index::ZERO)));

        let term = peer.test_machine().term;
        let heartbeats = peer
            .handle_message(
                PeerId::new(2),
                RaftMsg::VoteReply(VoteReply {
                    elector: PeerId::new(2),
                    term,
                    index: Index::ZERO,
                    index_term: Term::ZERO,
                    candidate: PeerId::new(1),
                    commit: Index::ZERO,
                }),
            )
            .unwrap();
        assert_eq!(peer.test_machine().role, Role::Leader);
        assert_eq!(heartbeats.len(), 2);
        assert!(heartbeats.iter().all(|o| matches!(o.msg, RaftMsg::AppendEntries(_))));
    }

    #[test]
    fn grants_one_ballot_per_term() {
        let dir = TempDir::new().unwrap();
        let (mut peer, _stream) = peer_of_three(&dir);

        let vote = |candidate: u64| {
            RaftMsg::VoteRequest(VoteRequest {
                candidate: PeerId::new(candidate),
                elector: PeerId::new(1),
                term: Term::new(1),
                index: Index::ZERO,
                index_term: Term::ZERO,
                accept: Index::ZERO,
                commit: Index::ZERO,
            })
        };

        let granted = peer.handle_message(PeerId::new(2), vote(2)).unwrap();
        assert_eq!(peer.test_machine().role, Role::Elector);
        assert!(matches!(&granted[0].msg, RaftMsg::VoteReply(r) if r.candidate == PeerId::new(2)));

        let refused = peer.handle_message(PeerId::new(3), vote(3)).unwrap();
        assert!(matches!(&refused[0].msg, RaftMsg::RejectReply(r) if r.code == RejectCode::AlreadyVote));

        // Same candidate again: idempotent re-grant.
        let regrant = peer.handle_message(PeerId::new(2), vote(2)).unwrap();
        assert!(matches!(&regrant[0].msg, RaftMsg::VoteReply(r) if r.candidate == PeerId::new(2)));
    }

    #[test]
    fn obsolete_candidate_triggers_own_candidacy() {
        let dir = TempDir::new().unwrap();
        let (mut peer, _stream) = peer_of_three(&dir);

        // Give the local log one entry so the empty-logged candidate is behind.
        let outs = peer
            .handle_message(PeerId::new(9), append_msg(1, (0, 0), 0, vec![entry(1, 1, b"x")]))
            .unwrap();
        assert!(matches!(&outs[0].msg, RaftMsg::AcceptReply(_)));

        let outs = peer
            .handle_message(
                PeerId::new(3),
                RaftMsg::VoteRequest(VoteRequest {
                    candidate: PeerId::new(3),
                    elector: PeerId::new(1),
                    term: Term::new(2),
                    index: Index::ZERO,
                    index_term: Term::ZERO,
                    accept: Index::ZERO,
                    commit: Index::ZERO,
                }),
            )
            .unwrap();
        assert!(matches!(&outs[0].msg, RaftMsg::RejectReply(r) if r.code == RejectCode::Obsolete));
        assert_eq!(peer.test_machine().role, Role::Candidate);
        // Candidacy bumped past the rejected candidate's term.
        assert_eq!(peer.test_machine().term, Term::new(3));
    }

    #[test]
    fn longer_log_from_stale_term_is_obsolete() {
        let dir = TempDir::new().unwrap();
        let (mut peer, _stream) = peer_of_three(&dir);

        // Commit five entries written at term 2.
        let entries: Vec<LogEntry> = (1..=5).map(|i| entry(i, 2, b"v")).collect();
        peer.handle_message(PeerId::new(9), append_msg(2, (0, 0), 5, entries))
            .unwrap();
        assert_eq!(peer.test_machine().commit, Index::new(5));

        // Candidate with a longer log written entirely in term 1: it cannot
        // hold the committed term-2 entries, so index alone must not win the
        // ballot.
        let outs = peer
            .handle_message(
                PeerId::new(3),
                RaftMsg::VoteRequest(VoteRequest {
                    candidate: PeerId::new(3),
                    elector: PeerId::new(1),
                    term: Term::new(3),
                    index: Index::new(6),
                    index_term: Term::new(1),
                    accept: Index::ZERO,
                    commit: Index::ZERO,
                }),
            )
            .unwrap();
        assert!(matches!(&outs[0].msg, RaftMsg::RejectReply(r) if r.code == RejectCode::Obsolete));
        assert_eq!(peer.test_machine().role, Role::Candidate);
        assert_eq!(peer.test_machine().index, Index::new(5));
    }

    #[test]
    fn replication_appends_and_commits_on_follower() {
        let dir = TempDir::new().unwrap();
        let (mut peer, mut stream) = peer_of_three(&dir);

        let entries = vec![entry(1, 1, b"a"), entry(2, 1, b"b")];
        let outs = peer
            .handle_message(PeerId::new(9), append_msg(1, (0, 0), 1, entries))
            .unwrap();
        match &outs[0].msg {
            RaftMsg::AcceptReply(r) => {
                assert_eq!(r.catch_up_index, Index::new(2));
                assert_eq!(r.commit, Index::new(1));
            }
            other => panic!("expected accept, got {}", other.kind_name()),
        }
        assert_eq!(peer.test_machine().index, Index::new(2));
        assert_eq!(peer.test_machine().commit, Index::new(1));
        assert_eq!(peer.test_machine().applied, Index::new(1));
        match stream.try_next() {
            Some(AppDelivery::Committed(c)) => assert_eq!(c.index, Index::new(1)),
            other => panic!("expected committed entry, got {other:?}"),
        }
    }

    #[test]
    fn redelivered_append_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let (mut peer, _stream) = peer_of_three(&dir);

        let msg = append_msg(1, (0, 0), 0, vec![entry(1, 1, b"a"), entry(2, 1, b"b")]);
        let first = peer.handle_message(PeerId::new(9), msg.clone()).unwrap();
        let second = peer.handle_message(PeerId::new(9), msg).unwrap();
        let as_accept = |outs: &[Outbound]| match &outs[0].msg {
            RaftMsg::AcceptReply(r) => r.clone(),
            other => panic!("expected accept, got {}", other.kind_name()),
        };
        assert_eq!(as_accept(&first), as_accept(&second));
        assert_eq!(peer.test_machine().index, Index::new(2));
    }

    #[test]
    fn conflicting_anchor_rolls_back_and_reports_conflict() {
        let dir = TempDir::new().unwrap();
        let (mut peer, _stream) = peer_of_three(&dir);

        // Log 1..=5, where entry 5 was written in term 3.
        let entries = vec![
            entry(1, 1, b"a"),
            entry(2, 1, b"b"),
            entry(3, 1, b"c"),
            entry(4, 1, b"d"),
            entry(5, 3, b"e"),
        ];
        peer.handle_message(PeerId::new(9), append_msg(3, (0, 0), 0, entries))
            .unwrap();
        assert_eq!(peer.test_machine().index_term, Term::new(3));

        // New leader at term 4 believes entry 5 was written in term 2.
        let outs = peer
            .handle_message(PeerId::new(9), append_msg(4, (5, 2), 0, Vec::new()))
            .unwrap();
        match &outs[0].msg {
            RaftMsg::RejectReply(r) => {
                assert_eq!(r.code, RejectCode::Conflict);
                assert_eq!(r.index, Index::new(4));
                assert_eq!(r.index_term, Term::new(1));
            }
            other => panic!("expected conflict, got {}", other.kind_name()),
        }
        assert_eq!(peer.test_machine().index, Index::new(4));
        assert!(peer.test_store().entry(Index::new(5)).unwrap().is_none());
    }

    #[test]
    fn stale_leader_view_is_accepted_without_mutation() {
        let dir = TempDir::new().unwrap();
        let (mut peer, _stream) = peer_of_three(&dir);

        // Leader anchors far ahead of our empty log.
        let outs = peer
            .handle_message(PeerId::new(9), append_msg(2, (10, 2), 0, Vec::new()))
            .unwrap();
        match &outs[0].msg {
            RaftMsg::AcceptReply(r) => assert_eq!(r.catch_up_index, Index::ZERO),
            other => panic!("expected accept, got {}", other.kind_name()),
        }
        assert_eq!(peer.test_machine().index, Index::ZERO);
    }

    #[test]
    fn leader_commits_on_majority_match() {
        let dir = TempDir::new().unwrap();
        let (mut peer, mut stream) = peer_of_three(&dir);
        elect_leader(&mut peer);

        let outs = peer
            .handle_message(
                PeerId::new(1),
                RaftMsg::ClientPropose(ClientPropose {
                    client: PeerId::new(1),
                    origin: 77,
                    sub_type: 0,
                    payload: Bytes::from_static(b"set k"),
                }),
            )
            .unwrap();
        // Immediate ack plus replication to both followers.
        assert!(matches!(
            &outs[0].msg,
            RaftMsg::ClientResult(r) if r.code == ResultCode::Success && r.origin == 77
        ));
        assert_eq!(
            outs.iter().filter(|o| matches!(o.msg, RaftMsg::AppendEntries(_))).count(),
            2
        );
        assert_eq!(peer.test_machine().commit, Index::ZERO);

        let term = peer.test_machine().term;
        let outs = peer
            .handle_message(
                PeerId::new(2),
                RaftMsg::AcceptReply(AcceptReply {
                    follower: PeerId::new(2),
                    term,
                    catch_up_index: Index::new(1),
                    catch_up_term: term,
                    commit: Index::ZERO,
                    leader: PeerId::new(1),
                }),
            )
            .unwrap();
        assert_eq!(peer.test_machine().commit, Index::new(1));
        assert_eq!(peer.test_machine().applied, Index::new(1));
        // CommitNotify routed to the proposing client's node (self here).
        assert!(outs
            .iter()
            .any(|o| o.to == PeerId::new(1) && matches!(&o.msg, RaftMsg::CommitNotify(n) if n.origin == 77)));
        assert!(matches!(stream.try_next(), Some(AppDelivery::Committed(_))));
    }

    #[test]
    fn conflict_reject_re_anchors_at_follower_position() {
        let dir = TempDir::new().unwrap();
        let (mut peer, _stream) = peer_of_three(&dir);
        elect_leader(&mut peer);
        let term = peer.test_machine().term;
        for origin in 0..3u64 {
            peer.handle_message(
                PeerId::new(1),
                RaftMsg::ClientPropose(ClientPropose {
                    client: PeerId::new(1),
                    origin,
                    sub_type: 0,
                    payload: Bytes::from_static(b"p"),
                }),
            )
            .unwrap();
        }

        let outs = peer
            .handle_message(
                PeerId::new(3),
                RaftMsg::RejectReply(RejectReply {
                    peer: PeerId::new(3),
                    term,
                    index: Index::new(1),
                    index_term: term,
                    accept: Index::ZERO,
                    commit: Index::ZERO,
                    reject_to: PeerId::new(1),
                    candidate: PeerId::INVALID,
                    leader: PeerId::new(1),
                    code: RejectCode::Conflict,
                    state: Role::Follower,
                }),
            )
            .unwrap();
        match &outs[0].msg {
            RaftMsg::AppendEntries(m) => {
                assert_eq!(m.pre_index, Index::new(1));
                // Conflict probing ships a single entry.
                assert_eq!(m.entries.len(), 1);
                assert_eq!(m.entries[0].index, Index::new(2));
            }
            other => panic!("expected re-anchored append, got {}", other.kind_name()),
        }
    }

    #[test]
    fn higher_term_reject_steps_leader_down() {
        let dir = TempDir::new().unwrap();
        let (mut peer, _stream) = peer_of_three(&dir);
        elect_leader(&mut peer);
        let my_term = peer.test_machine().term;

        peer.handle_message(
            PeerId::new(2),
            RaftMsg::RejectReply(RejectReply {
                peer: PeerId::new(2),
                term: my_term.next(),
                index: Index::ZERO,
                index_term: Term::ZERO,
                accept: Index::ZERO,
                commit: Index::ZERO,
                reject_to: PeerId::new(1),
                candidate: PeerId::INVALID,
                leader: PeerId::INVALID,
                code: RejectCode::LowerTerm,
                state: Role::Follower,
            }),
        )
        .unwrap();
        assert_eq!(peer.test_machine().role, Role::Follower);
        assert_eq!(peer.test_machine().term, my_term.next());
    }

    #[test]
    fn minor_reject_abandons_hopeless_election() {
        let dir = TempDir::new().unwrap();
        let (mut peer, _stream) = peer_of_three(&dir);
        peer.handle_timer(TimerKind::Tick).unwrap();
        let term = peer.test_machine().term;

        let reject_from = |id: u64| {
            RaftMsg::RejectReply(RejectReply {
                peer: PeerId::new(id),
                term,
                index: Index::ZERO,
                index_term: Term::ZERO,
                accept: Index::ZERO,
                commit: Index::ZERO,
                reject_to: PeerId::new(1),
                candidate: PeerId::new(5),
                leader: PeerId::INVALID,
                code: RejectCode::AlreadyVote,
                state: Role::Elector,
            })
        };
        peer.handle_message(PeerId::new(2), reject_from(2)).unwrap();
        assert_eq!(peer.test_machine().role, Role::Candidate);
        peer.handle_message(PeerId::new(3), reject_from(3)).unwrap();
        assert_eq!(peer.test_machine().role, Role::Follower);
    }

    #[test]
    fn non_leader_without_leader_refuses_proposals() {
        let dir = TempDir::new().unwrap();
        let (mut peer, _stream) = peer_of_three(&dir);
        let outs = peer
            .handle_message(
                PeerId::new(1),
                RaftMsg::ClientPropose(ClientPropose {
                    client: PeerId::new(1),
                    origin: 5,
                    sub_type: 0,
                    payload: Bytes::new(),
                }),
            )
            .unwrap();
        assert!(matches!(
            &outs[0].msg,
            RaftMsg::ClientResult(r) if r.code == ResultCode::NotLeader
        ));
    }

    #[test]
    fn follower_forwards_proposals_to_its_leader() {
        let dir = TempDir::new().unwrap();
        let (mut peer, _stream) = peer_of_three(&dir);
        peer.handle_message(PeerId::new(9), append_msg(1, (0, 0), 0, Vec::new()))
            .unwrap();

        let outs = peer
            .handle_message(
                PeerId::new(1),
                RaftMsg::ClientPropose(ClientPropose {
                    client: PeerId::new(1),
                    origin: 6,
                    sub_type: 0,
                    payload: Bytes::from_static(b"fwd"),
                }),
            )
            .unwrap();
        assert_eq!(outs[0].to, PeerId::new(9));
        assert!(matches!(&outs[0].msg, RaftMsg::ClientPropose(p) if p.origin == 6));
    }

    #[test]
    fn snapshot_compacts_applied_prefix() {
        let dir = TempDir::new().unwrap();
        let (publisher, _stream) = commit_stream::create();
        // Single-node cluster commits immediately; tiny thresholds force
        // rotation and compaction.
        let options = RaftOptions {
            max_segment_size: Some(256),
            snapshot_min_size: Some(512),
            ..RaftOptions::default()
        };
        let mut peer = RaftPeer::new(
            &config(1, &[1], &dir, options),
            ManualScheduler,
            publisher,
            test_logger(),
        )
        .unwrap();
        peer.handle_timer(TimerKind::Tick).unwrap();
        assert!(peer.test_machine().is_leader());

        for origin in 0..20u64 {
            peer.handle_message(
                PeerId::new(1),
                RaftMsg::ClientPropose(ClientPropose {
                    client: PeerId::new(1),
                    origin,
                    sub_type: 0,
                    payload: Bytes::from_static(&[b'z'; 64]),
                }),
            )
            .unwrap();
        }
        assert_eq!(peer.test_machine().applied, Index::new(20));

        peer.handle_timer(TimerKind::Snapshot).unwrap();
        assert!(peer.test_store().start_index() > Index::MIN_START);
        assert_eq!(peer.test_store().snapshot().commit, Index::new(20));
        assert!(peer.test_store().entry(Index::new(1)).unwrap().is_none());
        // The tip is still present and the node keeps leading.
        assert_eq!(peer.test_machine().index, Index::new(20));
    }

    #[test]
    fn rollback_below_compacted_start_is_fatal() {
        let dir = TempDir::new().unwrap();
        let (publisher, _stream) = commit_stream::create();
        let options = RaftOptions {
            max_segment_size: Some(128),
            snapshot_min_size: Some(256),
            ..RaftOptions::default()
        };
        let mut peer = RaftPeer::new(
            &config(1, &[1], &dir, options),
            ManualScheduler,
            publisher,
            test_logger(),
        )
        .unwrap();
        peer.handle_timer(TimerKind::Tick).unwrap();
        for origin in 0..10u64 {
            peer.handle_message(
                PeerId::new(1),
                RaftMsg::ClientPropose(ClientPropose {
                    client: PeerId::new(1),
                    origin,
                    sub_type: 0,
                    payload: Bytes::from_static(&[b'w'; 48]),
                }),
            )
            .unwrap();
        }
        peer.handle_timer(TimerKind::Snapshot).unwrap();
        let start = peer.test_store().start_index();
        assert!(start > Index::MIN_START);

        let err = peer.test_roll_back(start.minus(2)).unwrap_err();
        assert!(matches!(err, FatalError::DataLoss { .. }));
    }
}

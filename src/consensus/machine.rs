use crate::logstore::{LogStore, StoreError};
use crate::types::{Index, PeerId, Term};

/// Role of one machine. The ordering is meaningful: `Follower < Elector <
/// Candidate < Leader`, so "above follower" reads as `role > Role::Follower`.
///
/// ELECTOR is the voted-and-waiting state: the machine granted a ballot to
/// some candidate this term and keeps an election timer running in case that
/// candidate silently fails.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Role {
    Follower = 0,
    Elector = 1,
    Candidate = 2,
    Leader = 3,
}

impl Role {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(code: u8) -> Option<Role> {
        match code {
            0 => Some(Role::Follower),
            1 => Some(Role::Elector),
            2 => Some(Role::Candidate),
            3 => Some(Role::Leader),
            _ => None,
        }
    }
}

/// RaftMachine holds the replication watermarks of one cluster member.
///
/// The local node's own machine is authoritative and every durable field
/// change is written through the LogStore before the in-memory mutation is
/// visible. Machines for remote peers are last-known views, updated only from
/// their RPCs, never guessed; until a peer replies for the first time its
/// `index`/`match_index` stay `Index::NAN`.
#[derive(Clone, Debug)]
pub struct RaftMachine {
    pub id: PeerId,
    pub role: Role,
    pub term: Term,
    /// Last log index this machine holds.
    pub index: Index,
    pub index_term: Term,
    /// Highest index known durably stored (leader-side bookkeeping).
    pub match_index: Index,
    /// Whom this machine voted for in `term`.
    pub candidate: PeerId,
    pub leader: PeerId,
    pub commit: Index,
    pub applied: Index,
}

impl RaftMachine {
    /// The local machine, resumed from the durable LogMeta.
    pub fn local(id: PeerId, store: &LogStore) -> RaftMachine {
        let meta = store.meta();
        RaftMachine {
            id,
            role: Role::Follower,
            term: meta.term,
            index: meta.index,
            index_term: meta.index_term,
            match_index: meta.index,
            candidate: meta.candidate,
            leader: PeerId::INVALID,
            commit: meta.commit,
            applied: meta.applied,
        }
    }

    /// A remote peer we have not heard from yet.
    pub fn peer_view(id: PeerId) -> RaftMachine {
        RaftMachine {
            id,
            role: Role::Follower,
            term: Term::ZERO,
            index: Index::NAN,
            index_term: Term::ZERO,
            match_index: Index::NAN,
            candidate: PeerId::INVALID,
            leader: PeerId::INVALID,
            commit: Index::ZERO,
            applied: Index::ZERO,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    /// term += 1, vote for self. Durable before visible.
    pub fn be_candidate(&mut self, store: &mut LogStore) -> Result<(), StoreError> {
        let next = self.term.next();
        store.update_term(next)?;
        store.update_candidate(self.id)?;
        self.term = next;
        self.candidate = self.id;
        self.leader = PeerId::INVALID;
        self.role = Role::Candidate;
        Ok(())
    }

    /// Grant a ballot: adopt the candidate's term and wait for it to win.
    pub fn be_elector(&mut self, candidate: PeerId, term: Term, store: &mut LogStore) -> Result<(), StoreError> {
        debug_assert!(term >= self.term);
        store.update_term(term)?;
        store.update_candidate(candidate)?;
        self.term = term;
        self.candidate = candidate;
        self.leader = PeerId::INVALID;
        self.role = Role::Elector;
        Ok(())
    }

    pub fn be_leader(&mut self) {
        self.role = Role::Leader;
        self.leader = self.id;
        self.match_index = self.index;
    }

    /// Step down to follower at `term`, clearing the vote.
    pub fn follow_term(&mut self, term: Term, store: &mut LogStore) -> Result<(), StoreError> {
        debug_assert!(term >= self.term);
        if term > self.term {
            store.update_term(term)?;
            store.update_candidate(PeerId::INVALID)?;
            self.candidate = PeerId::INVALID;
        }
        self.term = term;
        self.leader = PeerId::INVALID;
        self.role = Role::Follower;
        Ok(())
    }

    /// Follow a live leader at `term`.
    pub fn follow_leader(&mut self, leader: PeerId, term: Term, store: &mut LogStore) -> Result<(), StoreError> {
        self.follow_term(term, store)?;
        self.leader = leader;
        Ok(())
    }

    /// Advances the local log position after a successful store append.
    pub fn append_log(&mut self, index: Index, term: Term) {
        self.index = index;
        self.index_term = term;
        if self.is_leader() {
            self.match_index = index;
        }
    }

    /// Moves the local log position backward after a suffix truncation.
    pub fn roll_back(&mut self, index: Index, term: Term) {
        self.index = index;
        self.index_term = term;
        self.match_index = index;
    }

    /// Raises `commit`; lowering it is a silent no-op.
    pub fn commit(&mut self, index: Index, store: &mut LogStore) -> Result<(), StoreError> {
        if index <= self.commit {
            return Ok(());
        }
        store.update_commit(index)?;
        self.commit = index;
        Ok(())
    }

    /// Raises `applied` to `min(index, commit)`.
    pub fn apply(&mut self, store: &mut LogStore) -> Result<(), StoreError> {
        let target = self.commit.min(self.index);
        if target <= self.applied {
            return Ok(());
        }
        store.update_applied(target)?;
        self.applied = target;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeInfo;
    use slog::Drain;
    use tempfile::TempDir;

    fn test_store(dir: &TempDir) -> LogStore {
        let decorator = slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let logger = slog::Logger::root(drain, slog::o!());
        let peers = [NodeInfo::new(PeerId::new(1), "127.0.0.1", 7001)];
        LogStore::open(dir.path(), 1024 * 1024, &peers, &[], logger).unwrap()
    }

    #[test]
    fn candidate_bumps_term_and_votes_for_self() {
        let dir = TempDir::new().unwrap();
        let mut store = test_store(&dir);
        let mut machine = RaftMachine::local(PeerId::new(1), &store);

        machine.be_candidate(&mut store).unwrap();
        assert_eq!(machine.role, Role::Candidate);
        assert_eq!(machine.term, Term::new(1));
        assert_eq!(machine.candidate, PeerId::new(1));
        // Durable before visible.
        assert_eq!(store.meta().term, Term::new(1));
        assert_eq!(store.meta().candidate, PeerId::new(1));
    }

    #[test]
    fn follow_higher_term_clears_vote() {
        let dir = TempDir::new().unwrap();
        let mut store = test_store(&dir);
        let mut machine = RaftMachine::local(PeerId::new(1), &store);
        machine.be_candidate(&mut store).unwrap();

        machine.follow_term(Term::new(5), &mut store).unwrap();
        assert_eq!(machine.role, Role::Follower);
        assert_eq!(machine.term, Term::new(5));
        assert_eq!(machine.candidate, PeerId::INVALID);
        assert_eq!(store.meta().candidate, PeerId::INVALID);
    }

    #[test]
    fn commit_is_monotonic() {
        let dir = TempDir::new().unwrap();
        let mut store = test_store(&dir);
        let mut machine = RaftMachine::local(PeerId::new(1), &store);
        machine.index = Index::new(10);

        machine.commit(Index::new(7), &mut store).unwrap();
        machine.commit(Index::new(3), &mut store).unwrap();
        assert_eq!(machine.commit, Index::new(7));
        assert_eq!(store.meta().commit, Index::new(7));
    }

    #[test]
    fn apply_never_passes_commit_or_index() {
        let dir = TempDir::new().unwrap();
        let mut store = test_store(&dir);
        let mut machine = RaftMachine::local(PeerId::new(1), &store);
        machine.index = Index::new(4);

        machine.commit(Index::new(9), &mut store).unwrap();
        machine.apply(&mut store).unwrap();
        assert_eq!(machine.applied, Index::new(4));
    }

    #[test]
    fn role_ordering_reads_naturally() {
        assert!(Role::Follower < Role::Elector);
        assert!(Role::Candidate < Role::Leader);
        assert_eq!(Role::from_u8(Role::Leader.as_u8()), Some(Role::Leader));
        assert_eq!(Role::from_u8(9), None);
    }
}

use crate::consensus::machine::RaftMachine;
use crate::types::{Index, PeerId, Term};
use std::collections::HashMap;

/// RaftGraph maps each cluster member to the last known RaftMachine state.
/// Built once from configuration; membership never changes for the node's
/// lifetime. Owned exclusively by the RaftPeer actor.
pub struct RaftGraph {
    machines: HashMap<PeerId, RaftMachine>,
    majority: usize,
}

impl RaftGraph {
    /// `local` is this node's machine; `peer_ids` are the remaining members.
    pub fn new(local: RaftMachine, peer_ids: impl IntoIterator<Item = PeerId>) -> RaftGraph {
        let mut machines = HashMap::new();
        machines.insert(local.id, local);
        for id in peer_ids {
            machines.entry(id).or_insert_with(|| RaftMachine::peer_view(id));
        }
        let majority = machines.len() / 2 + 1;
        RaftGraph { machines, majority }
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn majority(&self) -> usize {
        self.majority
    }

    pub fn machine(&self, id: PeerId) -> Option<&RaftMachine> {
        self.machines.get(&id)
    }

    pub fn machine_mut(&mut self, id: PeerId) -> Option<&mut RaftMachine> {
        self.machines.get_mut(&id)
    }

    pub fn peer_ids(&self, excluding: PeerId) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.machines.keys().copied().filter(|id| *id != excluding).collect();
        ids.sort();
        ids
    }

    /// True when a majority (self included) has voted for `candidate` in `term`.
    pub fn is_major_accept_candidate(&self, candidate: PeerId, term: Term) -> bool {
        let ballots = self
            .machines
            .values()
            .filter(|m| m.term == term && m.candidate == candidate)
            .count();
        ballots >= self.majority
    }

    /// True when a majority (self included) durably holds `index` at `term`.
    /// This is the sole trigger for advancing the leader's commit.
    pub fn is_major_accept_leader(&self, term: Term, index: Index) -> bool {
        let holders = self
            .machines
            .values()
            .filter(|m| m.term == term && !m.match_index.is_nan() && m.match_index >= index)
            .count();
        holders >= self.majority
    }

    /// True once enough peers refused `candidate` in `term` that the election
    /// can no longer succeed.
    pub fn is_minor_reject(&self, candidate: PeerId, term: Term) -> bool {
        let rejections = self
            .machines
            .values()
            .filter(|m| m.id != candidate && m.term == term && m.candidate != candidate)
            .count();
        rejections > self.machines.len() - self.majority
    }
}

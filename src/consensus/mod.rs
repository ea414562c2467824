//! The consensus core: machines, quorum graph, wire messages, and the
//! single-writer RaftPeer orchestrator.

mod graph;
mod machine;
mod messages;
mod peer;

pub use graph::RaftGraph;
pub use machine::{RaftMachine, Role};
pub use messages::{
    AcceptReply, AppendEntries, ClientPropose, ClientResult, CodecError, CommitNotify, RaftMsg,
    RejectCode, RejectReply, ResultCode, VoteReply, VoteRequest,
};
pub use peer::{FatalError, Outbound, PeerCreateError, RaftPeer};

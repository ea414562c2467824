mod actor;
mod commit_stream;
mod config;
mod consensus;
mod logstore;
mod node;
mod scheduler;
mod types;

pub use actor::{ActorClient, ActorGone, Event, PeerActor, ProposeCallback};
pub use commit_stream::{AppDelivery, CommitPublisher, CommitStream, CommittedEntry};
pub use config::{NodeInfo, RaftConfig, RaftOptions};
pub use consensus::{
    AcceptReply, AppendEntries, ClientPropose, ClientResult, CodecError, CommitNotify, FatalError,
    Outbound, PeerCreateError, RaftGraph, RaftMachine, RaftMsg, RaftPeer, RejectCode, RejectReply,
    ResultCode, Role, VoteReply, VoteRequest,
};
pub use logstore::{Durable, EntryDecodeError, LogEntry, LogMeta, LogStore, SnapshotMeta, StoreError};
pub use node::{try_create_node, RaftNode};
pub use scheduler::{Scheduler, TimerHandle, TimerKind, TokioScheduler};
pub use types::{Index, PeerId, Term};

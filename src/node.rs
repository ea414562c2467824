use crate::actor::{ActorClient, PeerActor};
use crate::commit_stream::{self, CommitStream};
use crate::config::{RaftConfig, RaftOptionsValidated};
use crate::consensus::{Outbound, PeerCreateError, RaftPeer};
use crate::scheduler::TokioScheduler;
use slog::Logger;
use tokio::sync::mpsc;

/// A running raft node. The transport drains `outbound` and delivers inbound
/// messages through `client`; the application consumes `commit_stream`.
pub struct RaftNode {
    pub client: ActorClient,
    pub commit_stream: CommitStream,
    pub outbound: mpsc::UnboundedReceiver<Outbound>,
}

/// Opens the log store, resumes durable state, and spawns the peer's event
/// loop. Must be called from within a tokio runtime.
pub fn try_create_node(config: &RaftConfig, logger: Logger) -> Result<RaftNode, PeerCreateError> {
    let mailbox_depth = RaftOptionsValidated::try_from(config.options.clone())
        .map_err(PeerCreateError::InvalidOptions)?
        .mailbox_depth;

    let (event_tx, event_rx) = mpsc::channel(mailbox_depth);
    let client = ActorClient::new(event_tx);
    let scheduler = TokioScheduler::new(client.clone());
    let (publisher, stream) = commit_stream::create();

    let peer = RaftPeer::new(config, scheduler, publisher.clone(), logger.clone())?;
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let actor = PeerActor::new(peer, event_rx, outbound_tx, publisher, logger);
    tokio::task::spawn(actor.run_event_loop());

    Ok(RaftNode {
        client,
        commit_stream: stream,
        outbound: outbound_rx,
    })
}

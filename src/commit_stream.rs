use crate::consensus::ResultCode;
use crate::types::{Index, PeerId, Term};
use bytes::Bytes;
use tokio::sync::mpsc;

/// One entry that reached a commit quorum and should be applied by the
/// application state machine on this node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommittedEntry {
    pub index: Index,
    pub term: Term,
    pub client: PeerId,
    pub origin: u64,
    pub sub_type: u32,
    pub payload: Bytes,
}

/// Everything the consensus core hands up to the application layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AppDelivery {
    /// Apply this entry, in index order.
    Committed(CommittedEntry),
    /// An entry proposed through this node committed cluster-wide; answer
    /// the caller identified by `origin`.
    CommitNotify { origin: u64, payload: Bytes },
    /// Immediate ack for a proposal routed through this node.
    ProposeResult {
        origin: u64,
        sub_type: u32,
        code: ResultCode,
        payload: Bytes,
    },
}

/// Creates the channel pair: the publisher half lives inside the peer actor,
/// the stream half goes to the application.
pub fn create() -> (CommitPublisher, CommitStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (CommitPublisher { tx }, CommitStream { rx })
}

#[derive(Clone)]
pub struct CommitPublisher {
    tx: mpsc::UnboundedSender<AppDelivery>,
}

impl CommitPublisher {
    /// Send failure means the application dropped its stream; deliveries are
    /// then discarded.
    pub(crate) fn publish(&self, delivery: AppDelivery) {
        let _ = self.tx.send(delivery);
    }
}

pub struct CommitStream {
    rx: mpsc::UnboundedReceiver<AppDelivery>,
}

impl CommitStream {
    /// Resolves `None` after the peer actor exits.
    pub async fn next(&mut self) -> Option<AppDelivery> {
        self.rx.recv().await
    }

    /// Non-blocking drain, used by tests.
    pub fn try_next(&mut self) -> Option<AppDelivery> {
        self.rx.try_recv().ok()
    }
}

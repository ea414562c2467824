//! The mailbox around a RaftPeer. All timers, transport deliveries, and
//! local proposals enqueue events here; the single event loop task is the
//! only code that ever touches the peer's state.

use crate::commit_stream::{AppDelivery, CommitPublisher};
use crate::consensus::{ClientPropose, FatalError, Outbound, RaftMsg, RaftPeer, ResultCode};
use crate::scheduler::{Scheduler, TimerKind};
use crate::types::PeerId;
use bytes::Bytes;
use slog::Logger;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};

pub enum Event {
    /// A decoded inter-peer message handed in by the transport.
    Message { from: PeerId, msg: RaftMsg },
    /// A proposal from a caller on this node. The callback carries the
    /// immediate ack; the commit fan-out arrives later on the stream.
    Propose {
        origin: u64,
        sub_type: u32,
        payload: Bytes,
        callback: ProposeCallback,
    },
    Timer(TimerKind),
    /// Stop the event loop; the store is closed when the actor drops.
    Shutdown,
}

pub struct ProposeCallback(oneshot::Sender<ResultCode>);

impl ProposeCallback {
    fn resolve(self, code: ResultCode) {
        // Failure means the caller stopped waiting.
        let _ = self.0.send(code);
    }
}

#[derive(Debug, thiserror::Error)]
#[error("peer actor has exited")]
pub struct ActorGone;

/// Cheap-to-clone handle for enqueueing events on the peer's mailbox.
#[derive(Clone)]
pub struct ActorClient {
    tx: mpsc::Sender<Event>,
}

impl ActorClient {
    pub(crate) fn new(tx: mpsc::Sender<Event>) -> ActorClient {
        ActorClient { tx }
    }

    /// Transport entry point: deliver one decoded message.
    pub async fn deliver(&self, from: PeerId, msg: RaftMsg) -> Result<(), ActorGone> {
        self.tx
            .send(Event::Message { from, msg })
            .await
            .map_err(|_| ActorGone)
    }

    /// Submit a proposal and await the immediate ack. `origin` is the
    /// caller's correlation token; the eventual CommitNotify for it arrives
    /// on the commit stream.
    pub async fn propose(&self, origin: u64, sub_type: u32, payload: Bytes) -> Result<ResultCode, ActorGone> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Event::Propose {
                origin,
                sub_type,
                payload,
                callback: ProposeCallback(tx),
            })
            .await
            .map_err(|_| ActorGone)?;
        rx.await.map_err(|_| ActorGone)
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(Event::Shutdown).await;
    }

    /// Returns false once the mailbox is gone so periodic timer tasks can
    /// stop re-arming themselves.
    pub(crate) async fn timer(&self, kind: TimerKind) -> bool {
        self.tx.send(Event::Timer(kind)).await.is_ok()
    }
}

/// Owns the RaftPeer and its mailbox. Outbound messages for remote peers go
/// to the transport sink; deliveries addressed to self resolve pending
/// proposal callbacks or land on the commit stream.
pub struct PeerActor<S: Scheduler> {
    peer: RaftPeer<S>,
    rx: mpsc::Receiver<Event>,
    outbound: mpsc::UnboundedSender<Outbound>,
    publisher: CommitPublisher,
    pending: HashMap<u64, ProposeCallback>,
    logger: Logger,
}

impl<S: Scheduler> PeerActor<S> {
    pub fn new(
        peer: RaftPeer<S>,
        rx: mpsc::Receiver<Event>,
        outbound: mpsc::UnboundedSender<Outbound>,
        publisher: CommitPublisher,
        logger: Logger,
    ) -> PeerActor<S> {
        PeerActor {
            peer,
            rx,
            outbound,
            publisher,
            pending: HashMap::new(),
            logger,
        }
    }

    pub async fn run_event_loop(mut self) {
        let id = self.peer.id();
        while let Some(event) = self.rx.recv().await {
            let result = match event {
                Event::Message { from, msg } => self.peer.handle_message(from, msg),
                Event::Propose {
                    origin,
                    sub_type,
                    payload,
                    callback,
                } => self.on_propose(origin, sub_type, payload, callback),
                Event::Timer(kind) => self.peer.handle_timer(kind),
                Event::Shutdown => {
                    slog::info!(self.logger, "Shutdown requested");
                    break;
                }
            };
            match result {
                Ok(outs) => self.route(id, outs),
                Err(fatal) => {
                    slog::crit!(self.logger, "Unrecoverable failure, halting peer: {}", fatal);
                    break;
                }
            }
        }
        slog::info!(self.logger, "Peer actor exited");
    }

    fn on_propose(
        &mut self,
        origin: u64,
        sub_type: u32,
        payload: Bytes,
        callback: ProposeCallback,
    ) -> Result<Vec<Outbound>, FatalError> {
        // A forwarded proposal whose ClientResult is lost would otherwise
        // pin its callback here forever; callers that stopped waiting leave
        // a closed oneshot behind, so sweep those out on every proposal.
        self.pending.retain(|_, cb| !cb.0.is_closed());
        let id = self.peer.id();
        self.pending.insert(origin, callback);
        self.peer.handle_message(
            id,
            RaftMsg::ClientPropose(ClientPropose {
                client: id,
                origin,
                sub_type,
                payload,
            }),
        )
    }

    fn route(&mut self, id: PeerId, outs: Vec<Outbound>) {
        for out in outs {
            if out.to == id {
                self.deliver_local(out.msg);
            } else if self.outbound.send(out).is_err() {
                slog::warn!(self.logger, "Transport sink gone; dropping outbound message");
            }
        }
    }

    fn deliver_local(&mut self, msg: RaftMsg) {
        match msg {
            RaftMsg::ClientResult(m) => match self.pending.remove(&m.origin) {
                Some(callback) => callback.resolve(m.code),
                None => self.publisher.publish(AppDelivery::ProposeResult {
                    origin: m.origin,
                    sub_type: m.sub_type,
                    code: m.code,
                    payload: m.payload,
                }),
            },
            RaftMsg::CommitNotify(m) => self.publisher.publish(AppDelivery::CommitNotify {
                origin: m.origin,
                payload: m.payload,
            }),
            other => {
                slog::warn!(self.logger, "Unexpected local delivery: {}", other.kind_name());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit_stream;
    use crate::config::{NodeInfo, RaftConfig, RaftOptions};
    use crate::consensus::AppendEntries;
    use crate::scheduler::{Scheduler, TimerHandle, TimerKind};
    use crate::types::{Index, Term};
    use slog::Drain;
    use tempfile::TempDir;
    use tokio::time::Duration;

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

    /// A follower that knows its leader, so proposals are forwarded and the
    /// callback stays parked until the leader's ClientResult comes back.
    fn forwarding_actor(dir: &TempDir) -> PeerActor<ManualScheduler> {
        let (publisher, _stream) = commit_stream::create();
        let config = RaftConfig {
            self_id: PeerId::new(1),
            peers: (1..=3)
                .map(|id| NodeInfo::new(PeerId::new(id), "127.0.0.1", 7000 + id as u16))
                .collect(),
            gates: Vec::new(),
            base_dir: dir.path().to_path_buf(),
            options: RaftOptions::default(),
        };
        let mut peer = RaftPeer::new(&config, ManualScheduler, publisher.clone(), test_logger()).unwrap();
        peer.handle_message(
            PeerId::new(2),
            RaftMsg::AppendEntries(AppendEntries {
                leader: PeerId::new(2),
                term: Term::new(1),
                pre_index: Index::ZERO,
                pre_index_term: Term::ZERO,
                accept: Index::ZERO,
                commit: Index::ZERO,
                follower: PeerId::new(1),
                entries: Vec::new(),
            }),
        )
        .unwrap();

        let (_event_tx, event_rx) = mpsc::channel(8);
        let (outbound_tx, _outbound_rx) = mpsc::unbounded_channel();
        PeerActor::new(peer, event_rx, outbound_tx, publisher, test_logger())
    }

    #[test]
    fn abandoned_callbacks_are_swept_on_later_proposals() {
        let dir = TempDir::new().unwrap();
        let mut actor = forwarding_actor(&dir);

        // Two callers that gave up before their forwarded replies arrived.
        for origin in [1u64, 2] {
            let (cb_tx, cb_rx) = oneshot::channel();
            drop(cb_rx);
            actor.on_propose(origin, 0, Bytes::new(), ProposeCallback(cb_tx)).unwrap();
        }
        // The first abandoned entry was swept when the second arrived.
        assert_eq!(actor.pending.len(), 1);

        // A caller still waiting survives the sweep.
        let (cb_tx, cb_rx) = oneshot::channel();
        actor.on_propose(3, 0, Bytes::new(), ProposeCallback(cb_tx)).unwrap();
        assert_eq!(actor.pending.len(), 1);
        assert!(actor.pending.contains_key(&3));
        drop(cb_rx);
    }
}

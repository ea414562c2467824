use crate::consensus::machine::Role;
use crate::logstore::{EntryDecodeError, LogEntry};
use crate::types::{Index, PeerId, Term};
use bytes::{Buf, BufMut, Bytes, BytesMut};

// Wire kind tags. One byte in front of the fixed-width fields.
const KIND_VOTE_REQUEST: u8 = 1;
const KIND_VOTE_REPLY: u8 = 2;
const KIND_APPEND_ENTRIES: u8 = 3;
const KIND_ACCEPT_REPLY: u8 = 4;
const KIND_REJECT_REPLY: u8 = 5;
const KIND_CLIENT_PROPOSE: u8 = 6;
const KIND_CLIENT_RESULT: u8 = 7;
const KIND_COMMIT_NOTIFY: u8 = 8;

/// Why a message was refused. Rejects are protocol data, not errors: every
/// one of them drives a retry or a role transition on the receiving side.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RejectCode {
    /// Sender's term is behind ours.
    LowerTerm = 1,
    /// Log anchor mismatch during catch-up; leader must retry further back.
    Conflict = 2,
    /// Message makes no sense in our current role.
    IllegalState = 3,
    /// Already voted for a different candidate this term.
    AlreadyVote = 4,
    /// Candidate's log is behind ours; we make a better candidate.
    Obsolete = 5,
}

impl RejectCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(code: u8) -> Option<RejectCode> {
        match code {
            1 => Some(RejectCode::LowerTerm),
            2 => Some(RejectCode::Conflict),
            3 => Some(RejectCode::IllegalState),
            4 => Some(RejectCode::AlreadyVote),
            5 => Some(RejectCode::Obsolete),
            _ => None,
        }
    }
}

/// Immediate leader ack for a client proposal.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResultCode {
    Success = 0,
    /// The leader could not durably log the entry and stepped down.
    WalFailed = 1,
    /// This node is not the leader and knows no leader to forward to.
    NotLeader = 2,
}

impl ResultCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(code: u8) -> Option<ResultCode> {
        match code {
            0 => Some(ResultCode::Success),
            1 => Some(ResultCode::WalFailed),
            2 => Some(ResultCode::NotLeader),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("unknown message kind {0}")]
    UnknownKind(u8),
    #[error("{kind} message truncated")]
    Truncated { kind: &'static str },
    #[error("{kind} message carries invalid code {code}")]
    InvalidCode { kind: &'static str, code: u8 },
    #[error(transparent)]
    Entry(#[from] EntryDecodeError),
}

/// Solicit a ballot. `accept` is the candidate's applied watermark; a ballot
/// is granted only when the candidate's `index`, `index_term`, and `commit`
/// are each at least the elector's.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VoteRequest {
    pub candidate: PeerId,
    pub elector: PeerId,
    pub term: Term,
    pub index: Index,
    pub index_term: Term,
    pub accept: Index,
    pub commit: Index,
}

/// Grant a ballot: `candidate` is whom the elector voted for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VoteReply {
    pub elector: PeerId,
    pub term: Term,
    pub index: Index,
    pub index_term: Term,
    pub candidate: PeerId,
    pub commit: Index,
}

/// Replicate entries / heartbeat. An empty entry list is a pure heartbeat.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppendEntries {
    pub leader: PeerId,
    pub term: Term,
    pub pre_index: Index,
    pub pre_index_term: Term,
    pub accept: Index,
    pub commit: Index,
    pub follower: PeerId,
    pub entries: Vec<LogEntry>,
}

/// Positive replication ack: the follower now holds `catch_up_index`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AcceptReply {
    pub follower: PeerId,
    pub term: Term,
    pub catch_up_index: Index,
    pub catch_up_term: Term,
    pub commit: Index,
    pub leader: PeerId,
}

/// Negative ack with a reason code and the sender's full current view.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RejectReply {
    pub peer: PeerId,
    pub term: Term,
    pub index: Index,
    pub index_term: Term,
    pub accept: Index,
    pub commit: Index,
    /// Whom this reject is aimed at (the candidate or leader being refused).
    pub reject_to: PeerId,
    pub candidate: PeerId,
    pub leader: PeerId,
    pub code: RejectCode,
    pub state: Role,
}

/// A proposal entering the cluster. `client` is the node that owns the
/// original caller and will receive the CommitNotify fan-out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientPropose {
    pub client: PeerId,
    pub origin: u64,
    pub sub_type: u32,
    pub payload: Bytes,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientResult {
    pub client: PeerId,
    pub origin: u64,
    pub sub_type: u32,
    pub code: ResultCode,
    pub payload: Bytes,
}

/// Fan-out once an entry commits, routed to the node that must answer the
/// original caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitNotify {
    pub origin: u64,
    pub payload: Bytes,
}

/// All inter-peer messages. Dispatch is an explicit match on the kind tag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RaftMsg {
    VoteRequest(VoteRequest),
    VoteReply(VoteReply),
    AppendEntries(AppendEntries),
    AcceptReply(AcceptReply),
    RejectReply(RejectReply),
    ClientPropose(ClientPropose),
    ClientResult(ClientResult),
    CommitNotify(CommitNotify),
}

impl RaftMsg {
    pub fn kind_name(&self) -> &'static str {
        match self {
            RaftMsg::VoteRequest(_) => "VoteRequest",
            RaftMsg::VoteReply(_) => "VoteReply",
            RaftMsg::AppendEntries(_) => "AppendEntries",
            RaftMsg::AcceptReply(_) => "AcceptReply",
            RaftMsg::RejectReply(_) => "RejectReply",
            RaftMsg::ClientPropose(_) => "ClientPropose",
            RaftMsg::ClientResult(_) => "ClientResult",
            RaftMsg::CommitNotify(_) => "CommitNotify",
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            RaftMsg::VoteRequest(m) => {
                buf.put_u8(KIND_VOTE_REQUEST);
                buf.put_u64(m.candidate.as_u64());
                buf.put_u64(m.elector.as_u64());
                buf.put_u64(m.term.as_u64());
                buf.put_u64(m.index.as_u64());
                buf.put_u64(m.index_term.as_u64());
                buf.put_u64(m.accept.as_u64());
                buf.put_u64(m.commit.as_u64());
            }
            RaftMsg::VoteReply(m) => {
                buf.put_u8(KIND_VOTE_REPLY);
                buf.put_u64(m.elector.as_u64());
                buf.put_u64(m.term.as_u64());
                buf.put_u64(m.index.as_u64());
                buf.put_u64(m.index_term.as_u64());
                buf.put_u64(m.candidate.as_u64());
                buf.put_u64(m.commit.as_u64());
            }
            RaftMsg::AppendEntries(m) => {
                buf.put_u8(KIND_APPEND_ENTRIES);
                buf.put_u64(m.leader.as_u64());
                buf.put_u64(m.term.as_u64());
                buf.put_u64(m.pre_index.as_u64());
                buf.put_u64(m.pre_index_term.as_u64());
                buf.put_u64(m.accept.as_u64());
                buf.put_u64(m.commit.as_u64());
                buf.put_u64(m.follower.as_u64());
                for entry in &m.entries {
                    buf.put_u32(entry.encoded_len() as u32);
                    entry.encode_into(&mut buf);
                }
            }
            RaftMsg::AcceptReply(m) => {
                buf.put_u8(KIND_ACCEPT_REPLY);
                buf.put_u64(m.follower.as_u64());
                buf.put_u64(m.term.as_u64());
                buf.put_u64(m.catch_up_index.as_u64());
                buf.put_u64(m.catch_up_term.as_u64());
                buf.put_u64(m.commit.as_u64());
                buf.put_u64(m.leader.as_u64());
            }
            RaftMsg::RejectReply(m) => {
                buf.put_u8(KIND_REJECT_REPLY);
                buf.put_u64(m.peer.as_u64());
                buf.put_u64(m.term.as_u64());
                buf.put_u64(m.index.as_u64());
                buf.put_u64(m.index_term.as_u64());
                buf.put_u64(m.accept.as_u64());
                buf.put_u64(m.commit.as_u64());
                buf.put_u64(m.reject_to.as_u64());
                buf.put_u64(m.candidate.as_u64());
                buf.put_u64(m.leader.as_u64());
                buf.put_u8(m.code.as_u8());
                buf.put_u8(m.state.as_u8());
            }
            RaftMsg::ClientPropose(m) => {
                buf.put_u8(KIND_CLIENT_PROPOSE);
                buf.put_u64(m.client.as_u64());
                buf.put_u64(m.origin);
                buf.put_u32(m.sub_type);
                buf.put_slice(&m.payload);
            }
            RaftMsg::ClientResult(m) => {
                buf.put_u8(KIND_CLIENT_RESULT);
                buf.put_u64(m.client.as_u64());
                buf.put_u64(m.origin);
                buf.put_u32(m.sub_type);
                buf.put_u8(m.code.as_u8());
                buf.put_slice(&m.payload);
            }
            RaftMsg::CommitNotify(m) => {
                buf.put_u8(KIND_COMMIT_NOTIFY);
                buf.put_u64(m.origin);
                buf.put_slice(&m.payload);
            }
        }
        buf.freeze()
    }

    pub fn decode(mut data: Bytes) -> Result<RaftMsg, CodecError> {
        if data.is_empty() {
            return Err(CodecError::Truncated { kind: "RaftMsg" });
        }
        let kind = data.get_u8();
        match kind {
            KIND_VOTE_REQUEST => {
                need(&data, 7 * 8, "VoteRequest")?;
                Ok(RaftMsg::VoteRequest(VoteRequest {
                    candidate: PeerId::new(data.get_u64()),
                    elector: PeerId::new(data.get_u64()),
                    term: Term::new(data.get_u64()),
                    index: Index::new(data.get_u64()),
                    index_term: Term::new(data.get_u64()),
                    accept: Index::new(data.get_u64()),
                    commit: Index::new(data.get_u64()),
                }))
            }
            KIND_VOTE_REPLY => {
                need(&data, 6 * 8, "VoteReply")?;
                Ok(RaftMsg::VoteReply(VoteReply {
                    elector: PeerId::new(data.get_u64()),
                    term: Term::new(data.get_u64()),
                    index: Index::new(data.get_u64()),
                    index_term: Term::new(data.get_u64()),
                    candidate: PeerId::new(data.get_u64()),
                    commit: Index::new(data.get_u64()),
                }))
            }
            KIND_APPEND_ENTRIES => {
                need(&data, 7 * 8, "AppendEntries")?;
                let leader = PeerId::new(data.get_u64());
                let term = Term::new(data.get_u64());
                let pre_index = Index::new(data.get_u64());
                let pre_index_term = Term::new(data.get_u64());
                let accept = Index::new(data.get_u64());
                let commit = Index::new(data.get_u64());
                let follower = PeerId::new(data.get_u64());
                let mut entries = Vec::new();
                while data.has_remaining() {
                    need(&data, 4, "AppendEntries")?;
                    let len = data.get_u32() as usize;
                    need(&data, len, "AppendEntries")?;
                    entries.push(LogEntry::decode(data.split_to(len))?);
                }
                Ok(RaftMsg::AppendEntries(AppendEntries {
                    leader,
                    term,
                    pre_index,
                    pre_index_term,
                    accept,
                    commit,
                    follower,
                    entries,
                }))
            }
            KIND_ACCEPT_REPLY => {
                need(&data, 6 * 8, "AcceptReply")?;
                Ok(RaftMsg::AcceptReply(AcceptReply {
                    follower: PeerId::new(data.get_u64()),
                    term: Term::new(data.get_u64()),
                    catch_up_index: Index::new(data.get_u64()),
                    catch_up_term: Term::new(data.get_u64()),
                    commit: Index::new(data.get_u64()),
                    leader: PeerId::new(data.get_u64()),
                }))
            }
            KIND_REJECT_REPLY => {
                need(&data, 9 * 8 + 2, "RejectReply")?;
                let peer = PeerId::new(data.get_u64());
                let term = Term::new(data.get_u64());
                let index = Index::new(data.get_u64());
                let index_term = Term::new(data.get_u64());
                let accept = Index::new(data.get_u64());
                let commit = Index::new(data.get_u64());
                let reject_to = PeerId::new(data.get_u64());
                let candidate = PeerId::new(data.get_u64());
                let leader = PeerId::new(data.get_u64());
                let raw_code = data.get_u8();
                let code = RejectCode::from_u8(raw_code).ok_or(CodecError::InvalidCode {
                    kind: "RejectReply",
                    code: raw_code,
                })?;
                let raw_state = data.get_u8();
                let state = Role::from_u8(raw_state).ok_or(CodecError::InvalidCode {
                    kind: "RejectReply",
                    code: raw_state,
                })?;
                Ok(RaftMsg::RejectReply(RejectReply {
                    peer,
                    term,
                    index,
                    index_term,
                    accept,
                    commit,
                    reject_to,
                    candidate,
                    leader,
                    code,
                    state,
                }))
            }
            KIND_CLIENT_PROPOSE => {
                need(&data, 8 + 8 + 4, "ClientPropose")?;
                Ok(RaftMsg::ClientPropose(ClientPropose {
                    client: PeerId::new(data.get_u64()),
                    origin: data.get_u64(),
                    sub_type: data.get_u32(),
                    payload: data,
                }))
            }
            KIND_CLIENT_RESULT => {
                need(&data, 8 + 8 + 4 + 1, "ClientResult")?;
                let client = PeerId::new(data.get_u64());
                let origin = data.get_u64();
                let sub_type = data.get_u32();
                let raw_code = data.get_u8();
                let code = ResultCode::from_u8(raw_code).ok_or(CodecError::InvalidCode {
                    kind: "ClientResult",
                    code: raw_code,
                })?;
                Ok(RaftMsg::ClientResult(ClientResult {
                    client,
                    origin,
                    sub_type,
                    code,
                    payload: data,
                }))
            }
            KIND_COMMIT_NOTIFY => {
                need(&data, 8, "CommitNotify")?;
                Ok(RaftMsg::CommitNotify(CommitNotify {
                    origin: data.get_u64(),
                    payload: data,
                }))
            }
            other => Err(CodecError::UnknownKind(other)),
        }
    }
}

fn need(data: &Bytes, len: usize, kind: &'static str) -> Result<(), CodecError> {
    if data.remaining() < len {
        return Err(CodecError::Truncated { kind });
    }
    Ok(())
}

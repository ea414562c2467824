use crate::types::{Index, PeerId, Term};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Fixed-width header in front of the variable-length payload.
const ENTRY_HEADER_LEN: usize = 8 + 8 + 8 + 8 + 4;

/// LogEntry is the unit of replication: an indexed, term-stamped opaque
/// payload. `client` is the peer that accepted the original proposal and
/// `origin` is an opaque application token used to route the commit
/// notification back to the caller. Entries are immutable once written.
///
/// Binary layout (big-endian):
///
/// ```text
/// | index u64 | term u64 | client u64 | origin u64 | sub_type u32 | payload... |
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub index: Index,
    pub term: Term,
    pub client: PeerId,
    pub origin: u64,
    pub sub_type: u32,
    pub payload: Bytes,
}

impl LogEntry {
    pub fn new(index: Index, term: Term, client: PeerId, origin: u64, sub_type: u32, payload: Bytes) -> Self {
        LogEntry {
            index,
            term,
            client,
            origin,
            sub_type,
            payload,
        }
    }

    pub fn encoded_len(&self) -> usize {
        ENTRY_HEADER_LEN + self.payload.len()
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_u64(self.index.as_u64());
        buf.put_u64(self.term.as_u64());
        buf.put_u64(self.client.as_u64());
        buf.put_u64(self.origin);
        buf.put_u32(self.sub_type);
        buf.put_slice(&self.payload);
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Decodes one entry from `data`, which must hold exactly one encoded
    /// entry (the caller owns the outer length framing).
    pub fn decode(mut data: Bytes) -> Result<Self, EntryDecodeError> {
        if data.len() < ENTRY_HEADER_LEN {
            return Err(EntryDecodeError::Truncated {
                need: ENTRY_HEADER_LEN,
                have: data.len(),
            });
        }
        let index = Index::new(data.get_u64());
        let term = Term::new(data.get_u64());
        let client = PeerId::new(data.get_u64());
        let origin = data.get_u64();
        let sub_type = data.get_u32();
        Ok(LogEntry {
            index,
            term,
            client,
            origin,
            sub_type,
            payload: data,
        })
    }
}

impl fmt::Debug for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LogEntry{{{}@{}, client:{}, origin:{:#x}, sub_type:{}, payload:{}B}}",
            self.index,
            self.term,
            self.client,
            self.origin,
            self.sub_type,
            self.payload.len()
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EntryDecodeError {
    #[error("entry truncated: need at least {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> LogEntry {
        LogEntry::new(
            Index::new(42),
            Term::new(7),
            PeerId::new(0xBEEF),
            0x1234_5678_9ABC_DEF0,
            3,
            Bytes::from_static(b"set x = 1"),
        )
    }

    #[test]
    fn encode_decode_preserves_fields() {
        let entry = sample();
        let decoded = LogEntry::decode(entry.encode()).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn empty_payload_is_legal() {
        let entry = LogEntry::new(Index::new(1), Term::new(1), PeerId::new(1), 0, 0, Bytes::new());
        let decoded = LogEntry::decode(entry.encode()).unwrap();
        assert!(decoded.payload.is_empty());
        assert_eq!(decoded.index, Index::new(1));
    }

    #[test]
    fn truncated_header_is_rejected() {
        let mut bytes = sample().encode();
        let short = bytes.split_to(10);
        assert!(LogEntry::decode(short).is_err());
    }
}

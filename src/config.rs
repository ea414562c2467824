use crate::types::PeerId;
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::path::PathBuf;
use tokio::time::Duration;

/// One cluster member as known from configuration. `gate_host`/`gate_port`
/// describe the cross-partition gateway address when this member doubles as a
/// gate; gates are persisted and exposed but drive no consensus decisions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: PeerId,
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate_port: Option<u16>,
}

impl NodeInfo {
    pub fn new(id: PeerId, host: impl Into<String>, port: u16) -> Self {
        NodeInfo {
            id,
            host: host.into(),
            port,
            gate_host: None,
            gate_port: None,
        }
    }
}

/// Static configuration for one raft node.
#[derive(Clone)]
pub struct RaftConfig {
    pub self_id: PeerId,
    /// Full membership, including self.
    pub peers: Vec<NodeInfo>,
    /// Cross-partition gates. Loaded and persisted, never consulted by consensus.
    pub gates: Vec<NodeInfo>,
    /// Directory under which the segment files and meta records live.
    pub base_dir: PathBuf,
    pub options: RaftOptions,
}

impl RaftConfig {
    pub fn contains_member(&self, id: PeerId) -> bool {
        self.peers.iter().any(|n| n.id == id)
    }
}

/// Tunables with defaults. All fields optional so callers only set what they
/// care about.
#[derive(Clone, Default)]
pub struct RaftOptions {
    /// Leader heartbeat period.
    pub heartbeat_interval: Option<Duration>,
    /// How long a candidate/elector waits for the election to conclude.
    pub elect_timeout: Option<Duration>,
    /// Period of the snapshot/compaction timer.
    pub snapshot_interval: Option<Duration>,
    /// Segment rotation threshold in bytes.
    pub max_segment_size: Option<u64>,
    /// Total log size below which compaction is skipped.
    pub snapshot_min_size: Option<u64>,
    /// Upper bound on the encoded entry bytes shipped in one AppendEntries.
    pub catch_up_batch_bytes: Option<u64>,
    /// Mailbox depth of the peer actor.
    pub mailbox_depth: Option<usize>,
}

pub(crate) struct RaftOptionsValidated {
    pub heartbeat_interval: Duration,
    /// Idle (tick) timeout range; jittered per arm.
    pub tick_min_timeout: Duration,
    pub tick_max_timeout: Duration,
    pub elect_timeout: Duration,
    pub snapshot_interval: Duration,
    pub max_segment_size: u64,
    pub snapshot_min_size: u64,
    pub catch_up_batch_bytes: u64,
    pub mailbox_depth: usize,
}

impl RaftOptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.heartbeat_interval >= self.tick_min_timeout {
            return Err("Idle timeout must be greater than the leader heartbeat interval");
        }
        if self.elect_timeout <= self.heartbeat_interval {
            return Err("Election timeout must be greater than the heartbeat interval");
        }
        if self.max_segment_size == 0 {
            return Err("Segment size limit must be non-zero");
        }
        if self.catch_up_batch_bytes == 0 {
            return Err("Catch-up batch size must be non-zero");
        }
        Ok(())
    }
}

impl TryFrom<RaftOptions> for RaftOptionsValidated {
    type Error = &'static str;

    fn try_from(options: RaftOptions) -> Result<Self, Self::Error> {
        let heartbeat = options.heartbeat_interval.unwrap_or(Duration::from_millis(500));
        let values = RaftOptionsValidated {
            heartbeat_interval: heartbeat,
            // The idle timeout is derived from the heartbeat: a follower only
            // times out after missing at least two heartbeats, plus jitter so
            // followers don't all stand for election in the same instant.
            tick_min_timeout: heartbeat * 2,
            tick_max_timeout: heartbeat * 3,
            elect_timeout: options.elect_timeout.unwrap_or_else(|| heartbeat * 3),
            snapshot_interval: options.snapshot_interval.unwrap_or(Duration::from_secs(3600)),
            max_segment_size: options.max_segment_size.unwrap_or(64 * 1024 * 1024),
            snapshot_min_size: options.snapshot_min_size.unwrap_or(256 * 1024 * 1024),
            catch_up_batch_bytes: options.catch_up_batch_bytes.unwrap_or(1024 * 1024),
            mailbox_depth: options.mailbox_depth.unwrap_or(64),
        };

        values.validate()?;
        Ok(values)
    }
}

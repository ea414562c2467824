use crate::config::NodeInfo;
use crate::types::{Index, PeerId, Term};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

/// LogMeta is the durable replication bookkeeping record: everything the node
/// needs to resume after a restart besides the segment files themselves.
/// Term/candidate changes are flushed synchronously before the mutation is
/// considered durable; the other watermarks ride along on periodic flushes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMeta {
    pub start: Index,
    pub term: Term,
    pub index: Index,
    pub index_term: Term,
    pub candidate: PeerId,
    pub commit: Index,
    pub applied: Index,
    #[serde(default)]
    pub peer_set: Vec<NodeInfo>,
    #[serde(default)]
    pub gate_set: Vec<NodeInfo>,
}

impl Default for LogMeta {
    fn default() -> Self {
        LogMeta {
            start: Index::MIN_START,
            term: Term::ZERO,
            index: Index::ZERO,
            index_term: Term::ZERO,
            candidate: PeerId::INVALID,
            commit: Index::ZERO,
            applied: Index::ZERO,
            peer_set: Vec::new(),
            gate_set: Vec::new(),
        }
    }
}

impl LogMeta {
    pub fn reset(&mut self) {
        let keep_peers = std::mem::take(&mut self.peer_set);
        let keep_gates = std::mem::take(&mut self.gate_set);
        *self = LogMeta::default();
        // Membership survives a state reset; it is reloaded from config by the
        // store when absent.
        self.peer_set = keep_peers;
        self.gate_set = keep_gates;
    }
}

/// SnapshotMeta records the index/term covered by the last compaction.
/// Invariant: `commit <= applied` of the local machine.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub commit: Index,
    pub term: Term,
}

impl SnapshotMeta {
    pub fn reset(&mut self) {
        *self = SnapshotMeta::default();
    }
}

/// Durable wraps a serde-serializable record with atomic write-and-rename
/// persistence. Loading a missing file yields the default record.
pub struct Durable<T> {
    path: PathBuf,
    pub record: T,
}

impl<T> Durable<T>
where
    T: Serialize + for<'de> Deserialize<'de> + Default,
{
    pub fn load_or_default(path: PathBuf) -> io::Result<Self> {
        let record = match File::open(&path) {
            Ok(mut file) => {
                let mut raw = String::new();
                file.read_to_string(&mut raw)?;
                serde_json::from_str(&raw).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => T::default(),
            Err(e) => return Err(e),
        };
        Ok(Durable { path, record })
    }

    /// Writes the record to a temp file, fsyncs, then renames over the target.
    pub fn flush(&self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("tmp");
        let raw = serde_json::to_vec_pretty(&self.record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        {
            let mut tmp = OpenOptions::new().create(true).write(true).truncate(true).open(&tmp_path)?;
            tmp.write_all(&raw)?;
            tmp.sync_data()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        sync_parent_dir(&self.path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn sync_parent_dir(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}

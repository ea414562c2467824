use crate::config::NodeInfo;
use crate::logstore::entry::LogEntry;
use crate::logstore::meta::{Durable, LogMeta, SnapshotMeta};
use crate::logstore::segment::{self, Segment};
use crate::logstore::StoreError;
use crate::types::{Index, PeerId, Term};
use slog::Logger;
use std::collections::BTreeMap;
use std::fs;
use std::ops::Bound;
use std::path::{Path, PathBuf};

const LOG_META_FILE: &str = "raft.meta";
const SNAPSHOT_META_FILE: &str = "snapshot.meta";

/// LogStore owns the segment files and both durable bookkeeping records.
/// All mutation goes through the single RaftPeer that owns this store, so no
/// internal locking is needed.
///
/// Recovery is replay-authoritative: at startup every segment file is
/// replayed and the filename metadata corrected from what was actually read.
/// If the durable LogMeta then disagrees with the replayed end index, all
/// local state is reset and the node rejoins with an empty log.
pub struct LogStore {
    dir: PathBuf,
    /// Keyed by each segment's start index. The newest segment is the only
    /// writable one (or is frozen right after a suffix truncation, in which
    /// case the next append rotates).
    segments: BTreeMap<u64, Segment>,
    log_meta: Durable<LogMeta>,
    snapshot_meta: Durable<SnapshotMeta>,
    max_segment_size: u64,
    total_size: u64,
    logger: Logger,
}

impl LogStore {
    pub fn open(
        dir: &Path,
        max_segment_size: u64,
        default_peers: &[NodeInfo],
        default_gates: &[NodeInfo],
        logger: Logger,
    ) -> Result<LogStore, StoreError> {
        fs::create_dir_all(dir)?;
        let log_meta = Durable::<LogMeta>::load_or_default(dir.join(LOG_META_FILE))?;
        let snapshot_meta = Durable::<SnapshotMeta>::load_or_default(dir.join(SNAPSHOT_META_FILE))?;

        let mut segments = BTreeMap::new();
        for dir_entry in fs::read_dir(dir)? {
            let path = dir_entry?.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n,
                None => continue,
            };
            if segment::parse_file_name(name).is_none() {
                continue;
            }
            let seg = Segment::open(&path)?;
            segments.insert(seg.start(), seg);
        }

        let mut store = LogStore {
            dir: dir.to_path_buf(),
            segments,
            log_meta,
            snapshot_meta,
            max_segment_size,
            total_size: 0,
            logger,
        };
        store.total_size = store.segments.values().map(|s| s.file_size()).sum();

        if !store.layout_is_sane() {
            slog::warn!(store.logger, "Segment layout failed recovery checks, resetting local state");
            store.reset(default_peers, default_gates)?;
        } else if store.segments.is_empty() {
            let start = store.log_meta.record.start.as_u64().max(Index::MIN_START.as_u64());
            store.install_writable(start)?;
        }

        let recovered_end = store.recovered_end_index();
        if store.log_meta.record.index != recovered_end {
            slog::warn!(
                store.logger,
                "LogMeta index {:?} disagrees with replayed end index {:?}, resetting local state",
                store.log_meta.record.index,
                recovered_end
            );
            store.reset(default_peers, default_gates)?;
        }

        // Replay is authoritative for the first retained index too.
        if let Some((&first, _)) = store.segments.iter().next() {
            if store.log_meta.record.start.as_u64() != first {
                store.log_meta.record.start = Index::new(first);
                store.log_meta.flush()?;
            }
        }

        if store.log_meta.record.peer_set.is_empty() {
            store.log_meta.record.peer_set = default_peers.to_vec();
            store.log_meta.record.gate_set = default_gates.to_vec();
            store.log_meta.flush()?;
        }

        slog::info!(
            store.logger,
            "Log store opened: start={:?} end={:?} commit={:?} applied={:?} term={:?} segments={} bytes={}",
            store.log_meta.record.start,
            store.log_meta.record.index,
            store.log_meta.record.commit,
            store.log_meta.record.applied,
            store.log_meta.record.term,
            store.segments.len(),
            store.total_size
        );
        Ok(store)
    }

    pub fn meta(&self) -> &LogMeta {
        &self.log_meta.record
    }

    pub fn snapshot(&self) -> &SnapshotMeta {
        &self.snapshot_meta.record
    }

    pub fn start_index(&self) -> Index {
        self.log_meta.record.start
    }

    pub fn end_index(&self) -> Index {
        self.log_meta.record.index
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Appends one entry with strict contiguity, rotating to a fresh segment
    /// when the current one is full or frozen.
    pub fn append(&mut self, entry: &LogEntry) -> Result<(), StoreError> {
        let expected = self.end_index().plus(1);
        if entry.index != expected {
            return Err(StoreError::NonContiguous {
                expected,
                got: entry.index,
            });
        }

        let needs_rotation = match self.segments.values().next_back() {
            Some(seg) => !seg.is_writable() || (!seg.is_empty() && seg.file_size() >= self.max_segment_size),
            None => true,
        };
        if needs_rotation {
            if let Some(seg) = self.segments.values_mut().next_back() {
                seg.freeze()?;
            }
            self.install_writable(entry.index.as_u64())?;
            slog::debug!(self.logger, "Rotated to new segment starting at {:?}", entry.index);
        }

        let seg = self.segments.values_mut().next_back().unwrap_or_else(|| unreachable!());
        let before = seg.file_size();
        seg.append(entry)?;
        self.total_size += seg.file_size() - before;

        self.log_meta.record.index = entry.index;
        self.log_meta.record.index_term = entry.term;
        self.log_meta.flush()?;
        Ok(())
    }

    pub fn entry(&self, index: Index) -> Result<Option<LogEntry>, StoreError> {
        if index.is_nan() || index < self.start_index() || index > self.end_index() {
            return Ok(None);
        }
        match self.segments.range(..=index.as_u64()).next_back() {
            Some((_, seg)) => seg.get(index.as_u64()),
            None => Ok(None),
        }
    }

    pub fn entry_term(&self, index: Index) -> Result<Option<Term>, StoreError> {
        Ok(self.entry(index)?.map(|e| e.term))
    }

    /// Drops whole frozen segments entirely below `new_start`. The writable
    /// segment is never touched. No-op when `new_start` is not ahead of the
    /// current start.
    pub fn truncate_prefix(&mut self, new_start: Index) -> Result<(), StoreError> {
        if new_start <= self.start_index() {
            return Ok(());
        }
        let doomed: Vec<u64> = self
            .segments
            .iter()
            .filter(|(_, seg)| !seg.is_writable() && seg.end() < new_start.as_u64())
            .map(|(&start, _)| start)
            .collect();
        for start in doomed {
            let seg = self.segments.remove(&start).unwrap_or_else(|| unreachable!());
            self.total_size -= seg.file_size();
            slog::debug!(self.logger, "Compaction dropping segment {}-{}", seg.start(), seg.end());
            seg.drop_file()?;
        }
        if let Some((&first, _)) = self.segments.iter().next() {
            self.log_meta.record.start = Index::new(first.max(Index::MIN_START.as_u64()));
            self.log_meta.flush()?;
        }
        Ok(())
    }

    /// Discards the uncommitted tail so the last index becomes `new_end`,
    /// returning the entry now at the end (None when the log became empty).
    /// The caller must have checked that `new_end + 1 >= start`.
    pub fn truncate_suffix(&mut self, new_end: Index) -> Result<Option<LogEntry>, StoreError> {
        if new_end >= self.end_index() {
            return self.entry(new_end);
        }
        debug_assert!(new_end.plus(1) >= self.start_index());

        let doomed: Vec<u64> = self
            .segments
            .range((Bound::Excluded(new_end.as_u64()), Bound::Unbounded))
            .map(|(&start, _)| start)
            .collect();
        for start in doomed {
            let seg = self.segments.remove(&start).unwrap_or_else(|| unreachable!());
            self.total_size -= seg.file_size();
            seg.drop_file()?;
        }
        if let Some(seg) = self.segments.values_mut().next_back() {
            if seg.end() > new_end.as_u64() {
                self.total_size -= seg.truncate(new_end.as_u64())?;
            }
        } else {
            self.install_writable(self.log_meta.record.start.as_u64())?;
        }

        let tail = self.entry(new_end)?;
        self.log_meta.record.index = new_end;
        self.log_meta.record.index_term = tail.as_ref().map(|e| e.term).unwrap_or(Term::ZERO);
        self.log_meta.flush()?;
        Ok(tail)
    }

    pub fn update_term(&mut self, term: Term) -> Result<(), StoreError> {
        self.log_meta.record.term = term;
        self.log_meta.flush()?;
        Ok(())
    }

    pub fn update_candidate(&mut self, candidate: PeerId) -> Result<(), StoreError> {
        self.log_meta.record.candidate = candidate;
        self.log_meta.flush()?;
        Ok(())
    }

    pub fn update_commit(&mut self, commit: Index) -> Result<(), StoreError> {
        self.log_meta.record.commit = commit;
        self.log_meta.flush()?;
        Ok(())
    }

    pub fn update_applied(&mut self, applied: Index) -> Result<(), StoreError> {
        self.log_meta.record.applied = applied;
        self.log_meta.flush()?;
        Ok(())
    }

    pub fn update_snapshot_meta(&mut self, commit: Index, term: Term) -> Result<(), StoreError> {
        self.snapshot_meta.record.commit = commit;
        self.snapshot_meta.record.term = term;
        self.snapshot_meta.flush()?;
        Ok(())
    }

    /// Wipes every segment and restores both metas to defaults, keeping the
    /// configured membership. The node rejoins with an empty log.
    pub fn reset(&mut self, default_peers: &[NodeInfo], default_gates: &[NodeInfo]) -> Result<(), StoreError> {
        let old: Vec<Segment> = std::mem::take(&mut self.segments).into_values().collect();
        for seg in old {
            seg.drop_file()?;
        }
        self.total_size = 0;

        self.log_meta.record = LogMeta::default();
        self.log_meta.record.peer_set = default_peers.to_vec();
        self.log_meta.record.gate_set = default_gates.to_vec();
        self.snapshot_meta.record.reset();
        self.install_writable(Index::MIN_START.as_u64())?;
        self.log_meta.flush()?;
        self.snapshot_meta.flush()?;
        Ok(())
    }

    fn install_writable(&mut self, start: u64) -> Result<(), StoreError> {
        let seg = Segment::create(&self.dir, start)?;
        self.segments.insert(start, seg);
        Ok(())
    }

    fn recovered_end_index(&self) -> Index {
        match self.segments.values().next_back() {
            Some(seg) if !seg.is_empty() => Index::new(seg.end()),
            Some(seg) => Index::new(seg.start() - 1),
            None => Index::ZERO,
        }
    }

    /// Segments must be contiguous and only the newest may be writable.
    fn layout_is_sane(&self) -> bool {
        let mut prev_end: Option<u64> = None;
        let count = self.segments.len();
        for (i, seg) in self.segments.values().enumerate() {
            if let Some(end) = prev_end {
                if seg.start() != end + 1 {
                    return false;
                }
            }
            if seg.is_writable() && i != count - 1 {
                return false;
            }
            prev_end = Some(if seg.is_empty() { seg.start() - 1 } else { seg.end() });
        }
        true
    }
}

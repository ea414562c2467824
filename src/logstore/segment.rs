use crate::logstore::entry::LogEntry;
use crate::logstore::StoreError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub(crate) const SEGMENT_PREFIX: &str = "raft_seg";
const FRAME_LEN: usize = 4;

/// One on-disk segment file holding a contiguous run of log entries.
///
/// Records are framed as `[u32 length][encoded LogEntry]`. The filename
/// carries the index range and the writable flag
/// (`raft_seg_<start>-<end>_<r|w>`); a writable segment keeps `end = 0` in
/// its name and the real end index is recovered by replay, which is
/// authoritative over the name.
pub struct Segment {
    dir: PathBuf,
    /// Current on-disk path; tracked explicitly because renames (freeze,
    /// thaw, recovery correction) can leave the name out of step with the
    /// in-memory `end`.
    path: PathBuf,
    start: u64,
    /// Last index held. `start - 1` when the segment is empty.
    end: u64,
    writable: bool,
    file: File,
    /// Byte offset where record `i` (index `start + i`) begins, plus a final
    /// element holding the file size.
    offsets: Vec<u64>,
}

impl Segment {
    /// Creates a fresh writable segment whose first entry will be `start`.
    pub fn create(dir: &Path, start: u64) -> Result<Segment, StoreError> {
        let path = dir.join(file_name(start, 0, true));
        let file = OpenOptions::new().create_new(true).read(true).write(true).open(&path)?;
        Ok(Segment {
            dir: dir.to_path_buf(),
            path,
            start,
            end: start - 1,
            writable: true,
            file,
            offsets: vec![0],
        })
    }

    /// Opens an existing segment file, replaying every record to rebuild the
    /// offset table. A torn trailing record (crash mid-append) is cut off; a
    /// frozen file whose name disagrees with the replayed end is renamed.
    pub fn open(path: &Path) -> Result<Segment, StoreError> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| StoreError::Corrupt(format!("bad segment path {}", path.display())))?;
        let (start, named_end, writable) = parse_file_name(name)
            .ok_or_else(|| StoreError::Corrupt(format!("unparseable segment name {name}")))?;
        let dir = path
            .parent()
            .ok_or_else(|| StoreError::Corrupt(format!("segment {name} has no parent dir")))?
            .to_path_buf();

        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;

        let mut offsets = vec![0u64];
        let mut end = start - 1;
        let mut cursor = Bytes::from(raw);
        let mut consumed = 0u64;
        loop {
            if cursor.remaining() < FRAME_LEN {
                break;
            }
            let len = (&cursor[..FRAME_LEN]).get_u32() as usize;
            if cursor.remaining() < FRAME_LEN + len {
                break;
            }
            cursor.advance(FRAME_LEN);
            let entry = LogEntry::decode(cursor.split_to(len))
                .map_err(|e| StoreError::Corrupt(format!("segment {name}: {e}")))?;
            let expected = end + 1;
            if entry.index.as_u64() != expected {
                return Err(StoreError::Corrupt(format!(
                    "segment {name}: replayed index {} where {} was expected",
                    entry.index, expected
                )));
            }
            end = expected;
            consumed += (FRAME_LEN + len) as u64;
            offsets.push(consumed);
        }
        if cursor.remaining() > 0 {
            // Torn tail from a crash mid-append. Replay wins.
            file.set_len(consumed)?;
            file.sync_data()?;
        }

        let mut segment = Segment {
            dir,
            path: path.to_path_buf(),
            start,
            end,
            writable,
            file,
            offsets,
        };
        if !writable && named_end != end {
            segment.rename_to(file_name(start, end, false))?;
        }
        Ok(segment)
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    pub fn file_size(&self) -> u64 {
        *self.offsets.last().unwrap_or(&0)
    }

    pub fn path(&self) -> PathBuf {
        self.path.clone()
    }

    /// Appends one framed record and syncs it to disk. The caller (LogStore)
    /// guarantees contiguity and that this segment is the writable one.
    pub fn append(&mut self, entry: &LogEntry) -> Result<(), StoreError> {
        debug_assert!(self.writable);
        debug_assert_eq!(entry.index.as_u64(), self.end + 1);

        let mut frame = BytesMut::with_capacity(FRAME_LEN + entry.encoded_len());
        frame.put_u32(entry.encoded_len() as u32);
        entry.encode_into(&mut frame);

        self.file.seek(SeekFrom::Start(self.file_size()))?;
        self.file.write_all(&frame)?;
        self.file.sync_data()?;

        self.end = entry.index.as_u64();
        self.offsets.push(self.file_size() + frame.len() as u64);
        Ok(())
    }

    /// Reads the entry at `index`, or `None` when the index lies outside this
    /// segment's range.
    pub fn get(&self, index: u64) -> Result<Option<LogEntry>, StoreError> {
        if index < self.start || index > self.end {
            return Ok(None);
        }
        let slot = (index - self.start) as usize;
        let offset = self.offsets[slot];
        let frame_end = self.offsets[slot + 1];
        let mut raw = vec![0u8; (frame_end - offset) as usize];
        let mut reader = &self.file;
        reader.seek(SeekFrom::Start(offset))?;
        reader.read_exact(&mut raw)?;
        let mut buf = Bytes::from(raw);
        let len = buf.get_u32() as usize;
        if buf.remaining() != len {
            return Err(StoreError::Corrupt(format!(
                "segment record at index {index} has frame length {len} but {} bytes",
                buf.remaining()
            )));
        }
        let entry = LogEntry::decode(buf).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        Ok(Some(entry))
    }

    /// Freezes this segment read-only, renaming `_w` to `_r` with the real
    /// end index in the name.
    pub fn freeze(&mut self) -> Result<(), StoreError> {
        if !self.writable {
            return Ok(());
        }
        self.file.sync_data()?;
        self.rename_to(file_name(self.start, self.end, false))?;
        self.writable = false;
        Ok(())
    }

    /// Shrinks the segment so its last index becomes `new_end`, returning the
    /// number of bytes dropped. A frozen segment that is truncated becomes
    /// writable again, since it is now the newest segment in the store.
    pub fn truncate(&mut self, new_end: u64) -> Result<u64, StoreError> {
        if new_end >= self.end {
            return Ok(0);
        }
        debug_assert!(new_end + 1 >= self.start);

        let keep = (new_end + 1 - self.start) as usize;
        let old_size = self.file_size();
        let new_size = self.offsets[keep];
        self.file.set_len(new_size)?;
        self.file.sync_data()?;
        self.offsets.truncate(keep + 1);
        self.end = new_end;
        if !self.writable {
            self.rename_to(file_name(self.start, 0, true))?;
            self.writable = true;
        }
        Ok(old_size - new_size)
    }

    /// Deletes the backing file. Consumes the segment.
    pub fn drop_file(self) -> Result<(), StoreError> {
        drop(self.file);
        fs::remove_file(&self.path)?;
        Ok(())
    }

    fn rename_to(&mut self, new_name: String) -> Result<(), StoreError> {
        let new_path = self.dir.join(new_name);
        if self.path != new_path {
            fs::rename(&self.path, &new_path)?;
            self.path = new_path;
        }
        Ok(())
    }
}

fn file_name(start: u64, end: u64, writable: bool) -> String {
    format!(
        "{SEGMENT_PREFIX}_{start:020}-{end:020}_{}",
        if writable { 'w' } else { 'r' }
    )
}

/// Parses `raft_seg_<start>-<end>_<r|w>`; `None` for foreign files.
pub(crate) fn parse_file_name(name: &str) -> Option<(u64, u64, bool)> {
    let rest = name.strip_prefix(SEGMENT_PREFIX)?.strip_prefix('_')?;
    let (range, flag) = rest.rsplit_once('_')?;
    let writable = match flag {
        "w" => true,
        "r" => false,
        _ => return None,
    };
    let (start, end) = range.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?, writable))
}

use std::sync::Mutex;

use crate::proto;
use crate::snapshot::Snapshot;

/// A single replicated log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub term: u64,
    pub index: u64,
    pub payload: Vec<u8>,
}

impl Entry {
    pub fn term_index(&self) -> TermIndex {
        TermIndex {
            term: self.term,
            index: self.index,
        }
    }
}

/// Identity of a log position or snapshot tip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TermIndex {
    pub term: u64,
    pub index: u64,
}

impl std::fmt::Display for TermIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(t{}, i{})", self.term, self.index)
    }
}

impl From<TermIndex> for proto::TermIndex {
    fn from(ti: TermIndex) -> Self {
        proto::TermIndex {
            term: ti.term,
            index: ti.index,
        }
    }
}

impl From<proto::TermIndex> for TermIndex {
    fn from(ti: proto::TermIndex) -> Self {
        TermIndex {
            term: ti.term,
            index: ti.index,
        }
    }
}

/// Convert internal Entry to protobuf LogEntry
pub fn entry_to_proto(entry: &Entry) -> proto::LogEntry {
    proto::LogEntry {
        term: entry.term,
        index: entry.index,
        payload: entry.payload.clone(),
    }
}

/// Convert protobuf LogEntry to internal Entry
pub fn proto_to_entry(entry: &proto::LogEntry) -> Entry {
    Entry {
        term: entry.term,
        index: entry.index,
        payload: entry.payload.clone(),
    }
}

/// Read access to the leader's durable log, as seen by a replicator.
///
/// Indices are dense. `start_index` is the first retained entry (`None`
/// once everything has been truncated into a snapshot, or at genesis);
/// `next_index` is one past the last appended entry.
pub trait LogSource: Send + Sync + 'static {
    fn start_index(&self) -> Option<u64>;
    fn next_index(&self) -> u64;
    fn get(&self, index: u64) -> Option<Entry>;
    /// Entries in `[lo, hi)`. Contiguous; callers stay within retained bounds.
    fn get_range(&self, lo: u64, hi: u64) -> Vec<Entry>;
    fn latest_snapshot(&self) -> Option<Snapshot>;
}

struct LogInner {
    first_index: u64,
    entries: Vec<Entry>,
    snapshot: Option<Snapshot>,
}

/// In-memory `LogSource` (would be backed by a durable store in
/// production).
pub struct MemoryLog {
    inner: Mutex<LogInner>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LogInner {
                first_index: 1,
                entries: Vec::new(),
                snapshot: None,
            }),
        }
    }

    /// Append a new entry, returning its index.
    pub fn append(&self, term: u64, payload: Vec<u8>) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let index = inner.first_index + inner.entries.len() as u64;
        inner.entries.push(Entry {
            term,
            index,
            payload,
        });
        index
    }

    /// Drop all entries below `new_start` (they live on in a snapshot).
    pub fn truncate_prefix(&self, new_start: u64) {
        let mut inner = self.inner.lock().unwrap();
        if new_start <= inner.first_index {
            return;
        }
        let drop = ((new_start - inner.first_index) as usize).min(inner.entries.len());
        inner.entries.drain(..drop);
        inner.first_index = new_start;
    }

    pub fn set_snapshot(&self, snapshot: Snapshot) {
        let mut inner = self.inner.lock().unwrap();
        inner.snapshot = Some(snapshot);
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl LogSource for MemoryLog {
    fn start_index(&self) -> Option<u64> {
        let inner = self.inner.lock().unwrap();
        if inner.entries.is_empty() {
            None
        } else {
            Some(inner.first_index)
        }
    }

    fn next_index(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner.first_index + inner.entries.len() as u64
    }

    fn get(&self, index: u64) -> Option<Entry> {
        let inner = self.inner.lock().unwrap();
        if index < inner.first_index {
            return None;
        }
        inner.entries.get((index - inner.first_index) as usize).cloned()
    }

    fn get_range(&self, lo: u64, hi: u64) -> Vec<Entry> {
        let inner = self.inner.lock().unwrap();
        if hi <= lo || hi <= inner.first_index {
            return Vec::new();
        }
        let lo = lo.max(inner.first_index);
        let start = (lo - inner.first_index) as usize;
        let end = ((hi - inner.first_index) as usize).min(inner.entries.len());
        if start >= end {
            return Vec::new();
        }
        inner.entries[start..end].to_vec()
    }

    fn latest_snapshot(&self) -> Option<Snapshot> {
        let inner = self.inner.lock().unwrap();
        inner.snapshot.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::Snapshot;
    use std::path::PathBuf;

    fn filled_log(n: u64) -> MemoryLog {
        let log = MemoryLog::new();
        for _ in 0..n {
            log.append(1, b"x".to_vec());
        }
        log
    }

    #[test]
    fn test_empty_log_bounds() {
        let log = MemoryLog::new();
        assert_eq!(log.start_index(), None);
        assert_eq!(log.next_index(), 1);
        assert!(log.get(1).is_none());
        assert!(log.get_range(1, 5).is_empty());
    }

    #[test]
    fn test_append_assigns_dense_indices() {
        let log = filled_log(3);
        assert_eq!(log.start_index(), Some(1));
        assert_eq!(log.next_index(), 4);
        assert_eq!(log.get(2).unwrap().index, 2);
        assert!(log.get(4).is_none());
    }

    #[test]
    fn test_get_range_is_half_open() {
        let log = filled_log(5);
        let entries = log.get_range(2, 4);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].index, 2);
        assert_eq!(entries[1].index, 3);
        assert!(log.get_range(3, 3).is_empty());
    }

    #[test]
    fn test_truncate_prefix_shifts_start() {
        let log = filled_log(10);
        let snapshot = Snapshot {
            term_index: TermIndex { term: 1, index: 4 },
            root: PathBuf::from("/tmp"),
            files: Vec::new(),
        };
        log.set_snapshot(snapshot);
        log.truncate_prefix(5);

        assert_eq!(log.start_index(), Some(5));
        assert_eq!(log.next_index(), 11);
        assert!(log.get(4).is_none());
        assert_eq!(log.get(5).unwrap().index, 5);
        assert_eq!(log.latest_snapshot().unwrap().index(), 4);
    }

    #[test]
    fn test_truncate_everything_leaves_no_start() {
        let log = filled_log(3);
        log.truncate_prefix(4);
        assert_eq!(log.start_index(), None);
        assert_eq!(log.next_index(), 4);
    }

    #[test]
    fn test_entry_proto_roundtrip() {
        let entry = Entry {
            term: 3,
            index: 7,
            payload: b"payload".to_vec(),
        };
        let recovered = proto_to_entry(&entry_to_proto(&entry));
        assert_eq!(recovered, entry);
    }
}

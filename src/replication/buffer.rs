use crate::log::{entry_to_proto, Entry, TermIndex};
use crate::proto::AppendEntriesRequest;

/// Bounded staging area for entries pending in the next AppendEntries.
///
/// Entries are contiguous, starting at the follower's next index.
/// Draining clears the buffer in the same step that builds the request,
/// so no entry can be sent twice from here.
pub struct EntryBuffer {
    capacity: usize,
    buf: Vec<Entry>,
}

impl EntryBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Callers keep the total within capacity.
    pub fn append(&mut self, entries: Vec<Entry>) {
        self.buf.extend(entries);
    }

    pub fn is_full(&self) -> bool {
        self.buf.len() >= self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.buf.len()
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Build an AppendEntries request from the current contents and clear
    /// the buffer. An empty buffer yields a heartbeat.
    pub fn drain_into(
        &mut self,
        leader_term: u64,
        leader_id: u64,
        target_id: u64,
        previous: Option<TermIndex>,
        probe: bool,
    ) -> AppendEntriesRequest {
        let entries = self.buf.iter().map(entry_to_proto).collect();
        self.buf.clear();
        AppendEntriesRequest {
            leader_term,
            leader_id,
            target_id,
            previous: previous.map(Into::into),
            entries,
            probe,
        }
    }
}

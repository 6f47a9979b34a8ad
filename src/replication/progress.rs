use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::time::Instant;

/// Shared view of one follower's replication progress.
///
/// Written only by that follower's replicator; the leader's commit
/// calculator reads the counters as eventually consistent snapshots.
/// `match_index` never moves backward; `next_index` moves backward only
/// through [`decrease_next_index`](Self::decrease_next_index) when the
/// follower advertises an inconsistency backoff point.
pub struct FollowerProgress {
    peer_id: u64,
    next_index: AtomicU64,
    match_index: AtomicU64,
    attending_vote: AtomicBool,
    last_rpc_send: Mutex<Instant>,
    last_rpc_response: Mutex<Instant>,
}

impl FollowerProgress {
    pub fn new(peer_id: u64, next_index: u64, attending_vote: bool) -> Self {
        let now = Instant::now();
        Self {
            peer_id,
            next_index: AtomicU64::new(next_index),
            match_index: AtomicU64::new(0),
            attending_vote: AtomicBool::new(attending_vote),
            last_rpc_send: Mutex::new(now),
            last_rpc_response: Mutex::new(now),
        }
    }

    pub fn peer_id(&self) -> u64 {
        self.peer_id
    }

    pub fn next_index(&self) -> u64 {
        self.next_index.load(Ordering::Relaxed)
    }

    pub fn match_index(&self) -> u64 {
        self.match_index.load(Ordering::Relaxed)
    }

    pub fn attending_vote(&self) -> bool {
        self.attending_vote.load(Ordering::Relaxed)
    }

    /// Promote the follower into (or out of) the voting set.
    pub fn set_attending_vote(&self, attending: bool) {
        self.attending_vote.store(attending, Ordering::Relaxed);
    }

    pub fn update_match_index(&self, index: u64) {
        self.match_index.fetch_max(index, Ordering::Relaxed);
    }

    pub fn update_next_index(&self, index: u64) {
        debug_assert!(index >= self.next_index());
        self.next_index.store(index, Ordering::Relaxed);
    }

    /// Apply the follower-advertised backoff point. This is the only path
    /// that lowers `next_index`.
    pub fn decrease_next_index(&self, index: u64) {
        self.next_index.store(index, Ordering::Relaxed);
    }

    pub fn record_rpc_send(&self, at: Instant) {
        *self.last_rpc_send.lock().unwrap() = at;
    }

    pub fn record_rpc_response(&self, at: Instant) {
        *self.last_rpc_response.lock().unwrap() = at;
    }

    pub fn last_rpc_send(&self) -> Instant {
        *self.last_rpc_send.lock().unwrap()
    }

    pub fn last_rpc_response(&self) -> Instant {
        *self.last_rpc_response.lock().unwrap()
    }
}

impl std::fmt::Debug for FollowerProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FollowerProgress")
            .field("peer_id", &self.peer_id)
            .field("next_index", &self.next_index())
            .field("match_index", &self.match_index())
            .field("attending_vote", &self.attending_vote())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_index_is_monotonic() {
        let progress = FollowerProgress::new(2, 5, true);
        progress.update_match_index(7);
        progress.update_match_index(3);
        assert_eq!(progress.match_index(), 7);
    }

    #[test]
    fn test_decrease_applies_backoff_point() {
        let progress = FollowerProgress::new(2, 7, true);
        progress.decrease_next_index(3);
        assert_eq!(progress.next_index(), 3);
    }

    #[test]
    fn test_match_stays_below_next() {
        let progress = FollowerProgress::new(2, 5, true);
        progress.update_match_index(9);
        progress.update_next_index(10);
        assert!(progress.match_index() < progress.next_index());
    }
}

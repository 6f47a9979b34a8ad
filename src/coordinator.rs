use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

/// Progress signals a replicator feeds back to the leader's state loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaderEvent {
    /// A staging (non-voting) follower advanced its match index.
    StagingProgress { peer_id: u64 },
    /// A voting follower advanced; the commit index may move.
    UpdateCommit { peer_id: u64 },
    /// A reply carried a term above ours; the leader must step down.
    StepDown { term: u64 },
}

/// Handle to the leader's commit-tracking loop, shared by every
/// replicator of this leadership term.
///
/// Event submission is thread-safe and tolerates a dropped receiver
/// (the leader tearing down while replicators drain).
#[derive(Clone)]
pub struct LeaderCoordinator {
    term: Arc<Mutex<u64>>,
    events: mpsc::UnboundedSender<LeaderEvent>,
}

impl LeaderCoordinator {
    pub fn new(term: u64) -> (Self, mpsc::UnboundedReceiver<LeaderEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                term: Arc::new(Mutex::new(term)),
                events,
            },
            rx,
        )
    }

    pub fn current_term(&self) -> u64 {
        *self.term.lock().unwrap()
    }

    pub fn submit(&self, event: LeaderEvent) {
        let _ = self.events.send(event);
    }

    /// Step-down check, serialized with other term observers.
    ///
    /// Holding the term lock across the comparison and the event
    /// submission keeps concurrent observers of the same stale term from
    /// racing. Returns true when a `StepDown` was submitted.
    pub fn observe_term(&self, observed: u64) -> bool {
        let term = self.term.lock().unwrap();
        if observed > *term {
            let _ = self.events.send(LeaderEvent::StepDown { term: observed });
            return true;
        }
        false
    }
}

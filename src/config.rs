use std::time::Duration;

/// Per-replicator tuning, read once at construction.
#[derive(Debug, Clone)]
pub struct ReplicatorConfig {
    /// Max entries staged for a single AppendEntries batch.
    pub buffer_capacity: usize,
    /// When false, any non-empty buffer is flushed immediately instead of
    /// waiting to fill up.
    pub batch_enabled: bool,
    /// Upper bound on a single InstallSnapshot chunk payload, in bytes.
    pub snapshot_chunk_max_size: usize,
    /// Heartbeats go out after `min_election_timeout / 2` of rpc silence.
    pub min_election_timeout: Duration,
    /// Backoff before retrying a failed transport call.
    pub sync_interval: Duration,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 128,
            batch_enabled: false,
            snapshot_chunk_max_size: 16 * 1024 * 1024,
            min_election_timeout: Duration::from_millis(150),
            sync_interval: Duration::from_millis(10),
        }
    }
}

impl ReplicatorConfig {
    /// Silence interval after which a heartbeat is due.
    pub fn heartbeat_interval(&self) -> Duration {
        self.min_election_timeout / 2
    }
}

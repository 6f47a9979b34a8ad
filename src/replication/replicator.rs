use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ReplicatorConfig;
use crate::coordinator::{LeaderCoordinator, LeaderEvent};
use crate::error::{RelayError, Result};
use crate::log::{LogSource, TermIndex};
use crate::proto::{
    AppendEntriesReply, AppendEntriesRequest, AppendResult, InstallResult, InstallSnapshotReply,
};
use crate::replication::buffer::EntryBuffer;
use crate::replication::progress::FollowerProgress;
use crate::snapshot::{Snapshot, SnapshotChunkStream};
use crate::transport::Transport;

/// Drives one follower toward log convergence.
///
/// A replicator is spawned per follower when this server becomes leader
/// and runs until stopped, a fatal protocol violation, or an observed
/// higher term. Its loop is strictly sequential: it never has two RPCs to
/// its follower in flight at once, and it alone writes the follower's
/// [`FollowerProgress`].
///
/// # Safety rules
///
/// - `match_index` never moves backward; `next_index` moves backward only
///   to a follower-advertised inconsistency backoff point.
/// - A SUCCESS reply whose next index is below ours is an unrecoverable
///   protocol violation and terminates the replicator.
/// - The leader term is fixed at construction; a reply carrying a higher
///   term submits a single `StepDown` event and stops the replicator.
/// - When the log is idle, an empty AppendEntries (heartbeat) goes out
///   every `min_election_timeout / 2`.
pub struct Replicator<L, T> {
    server_id: u64,
    leader_term: u64,
    log: Arc<L>,
    transport: Arc<T>,
    follower: Arc<FollowerProgress>,
    coordinator: LeaderCoordinator,
    config: ReplicatorConfig,
    buffer: EntryBuffer,
    notify: Arc<Notify>,
    cancel: CancellationToken,
}

/// Control surface for a spawned replicator.
pub struct ReplicatorHandle {
    notify: Arc<Notify>,
    cancel: CancellationToken,
    follower: Arc<FollowerProgress>,
    task: JoinHandle<Result<()>>,
}

impl ReplicatorHandle {
    /// Wake the replicator because new entries were appended to the log.
    pub fn notify_append(&self) {
        self.notify.notify_one();
    }

    /// Request a stop. Idempotent and non-blocking.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.notify.notify_one();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn progress(&self) -> Arc<FollowerProgress> {
        self.follower.clone()
    }

    /// Wait for the replicator to exit. `Ok` covers both cooperative
    /// stops and cancellation; an error is a fatal protocol violation the
    /// leader-level supervisor must act on.
    pub async fn join(self) -> Result<()> {
        match self.task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => std::panic::resume_unwind(e.into_panic()),
        }
    }
}

impl<L: LogSource, T: Transport> Replicator<L, T> {
    pub fn new(
        server_id: u64,
        log: Arc<L>,
        transport: Arc<T>,
        follower: Arc<FollowerProgress>,
        coordinator: LeaderCoordinator,
        config: ReplicatorConfig,
    ) -> Self {
        let leader_term = coordinator.current_term();
        let buffer = EntryBuffer::new(config.buffer_capacity);
        Self {
            server_id,
            leader_term,
            log,
            transport,
            follower,
            coordinator,
            config,
            buffer,
            notify: Arc::new(Notify::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Spawn the replication loop onto the runtime.
    pub fn spawn(self) -> ReplicatorHandle {
        let notify = self.notify.clone();
        let cancel = self.cancel.clone();
        let follower = self.follower.clone();
        let task = tokio::spawn(self.run());
        ReplicatorHandle {
            notify,
            cancel,
            follower,
            task,
        }
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!(
            peer_id = self.follower.peer_id(),
            term = self.leader_term,
            "replicator started"
        );
        match self.replicate_loop().await {
            Ok(()) | Err(RelayError::Cancelled) => {
                tracing::info!(peer_id = self.follower.peer_id(), "replicator stopped");
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    peer_id = self.follower.peer_id(),
                    error = %e,
                    "replicator terminated on fatal error"
                );
                Err(e)
            }
        }
    }

    fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    async fn replicate_loop(&mut self) -> Result<()> {
        while self.is_running() {
            if self.should_send() {
                if let Some(snapshot) = self.should_install_snapshot() {
                    tracing::info!(
                        peer_id = self.follower.peer_id(),
                        follower_next = self.follower.next_index(),
                        log_start = ?self.log.start_index(),
                        snapshot_index = snapshot.index(),
                        "follower is behind the log start, installing snapshot"
                    );
                    if let Some(reply) = self.install_snapshot(&snapshot).await? {
                        if reply.result() == InstallResult::NotLeader {
                            self.check_response_term(reply.term);
                        }
                    }
                } else if let Some(reply) = self.send_append_entries().await? {
                    self.handle_reply(reply)?;
                }
            }

            let logical_next = self.follower.next_index() + self.buffer.pending() as u64;
            if self.is_running() && !self.should_append(logical_next) {
                let wait = self.heartbeat_remaining();
                if !wait.is_zero() {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = sleep(wait) => {}
                        _ = self.cancel.cancelled() => {}
                    }
                }
            }
        }
        Ok(())
    }

    /// Should the leader send anything to this follower right now?
    fn should_send(&self) -> bool {
        self.should_append(self.follower.next_index()) || self.heartbeat_due()
    }

    fn should_append(&self, follower_index: u64) -> bool {
        follower_index < self.log.next_index()
    }

    fn heartbeat_due(&self) -> bool {
        self.heartbeat_remaining().is_zero()
    }

    fn heartbeat_remaining(&self) -> Duration {
        let deadline = self.follower.last_rpc_send() + self.config.heartbeat_interval();
        deadline.saturating_duration_since(Instant::now())
    }

    /// Term/index preceding the next entry to send. Falls back to the
    /// snapshot tip when that position was truncated; absent only at
    /// leader genesis with no snapshot.
    fn previous(&self) -> Option<TermIndex> {
        let next = self.follower.next_index();
        self.log
            .get(next.saturating_sub(1))
            .map(|entry| entry.term_index())
            .or_else(|| self.log.latest_snapshot().map(|s| s.term_index))
    }

    /// Stage entries and decide whether a request goes out this pass.
    fn create_request(&mut self) -> Option<AppendEntriesRequest> {
        let previous = self.previous();
        let leader_next = self.log.next_index();
        let next = self.follower.next_index() + self.buffer.pending() as u64;
        let mut to_send = false;

        if leader_next > next {
            let num = (self.buffer.remaining() as u64).min(leader_next - next);
            self.buffer.append(self.log.get_range(next, next + num));
            if self.buffer.is_full() || !self.config.batch_enabled {
                to_send = true;
            }
        } else if !self.buffer.is_empty() {
            // no further log growth, flush what is staged
            to_send = true;
        }

        if to_send || self.heartbeat_due() {
            Some(self.buffer.drain_into(
                self.leader_term,
                self.server_id,
                self.follower.peer_id(),
                previous,
                !self.follower.attending_vote(),
            ))
        } else {
            None
        }
    }

    /// Send one logical batch, retrying through transient transport
    /// failures. The request is rebuilt only while it carries no entries
    /// (heartbeats pick up fresh state); a batch is redelivered verbatim
    /// so the follower can deduplicate by index and term.
    async fn send_append_entries(&mut self) -> Result<Option<AppendEntriesReply>> {
        let mut request: Option<AppendEntriesRequest> = None;
        let mut retry = 0u32;
        while self.is_running() {
            if request.as_ref().map_or(true, |r| r.entries.is_empty()) {
                request = self.create_request();
            }
            let req = match request.as_ref() {
                Some(req) => req,
                None => {
                    tracing::trace!(
                        peer_id = self.follower.peer_id(),
                        "nothing to append, waiting for more entries"
                    );
                    return Ok(None);
                }
            };

            self.follower.record_rpc_send(Instant::now());
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => return Err(RelayError::Cancelled),
                outcome = self.transport.send_append_entries(req.clone()) => outcome,
            };
            match outcome {
                Ok(reply) => {
                    self.follower.record_rpc_response(Instant::now());
                    return Ok(Some(reply));
                }
                Err(e) if e.is_cancellation() => return Err(RelayError::Cancelled),
                Err(e) => {
                    tracing::debug!(
                        peer_id = self.follower.peer_id(),
                        retry,
                        error = %e,
                        "append_entries failed, retrying"
                    );
                    retry += 1;
                }
            }
            if self.is_running() {
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(RelayError::Cancelled),
                    _ = sleep(self.config.sync_interval) => {}
                }
            }
        }
        Ok(None)
    }

    fn handle_reply(&mut self, reply: AppendEntriesReply) -> Result<()> {
        match AppendResult::try_from(reply.result) {
            Ok(AppendResult::Success) => {
                let old_next = self.follower.next_index();
                let next = reply.next_index;
                if next < old_next {
                    return Err(RelayError::NextIndexRegression {
                        peer_id: self.follower.peer_id(),
                        reply_next: next,
                        current_next: old_next,
                    });
                }
                if next > old_next {
                    self.follower.update_match_index(next - 1);
                    self.follower.update_next_index(next);
                    self.submit_progress_event();
                }
            }
            Ok(AppendResult::NotLeader) => {
                self.check_response_term(reply.term);
            }
            Ok(AppendResult::Inconsistency) => {
                tracing::debug!(
                    peer_id = self.follower.peer_id(),
                    backoff = reply.next_index,
                    "follower log inconsistent, backing off"
                );
                self.follower.decrease_next_index(reply.next_index);
            }
            Err(_) => {
                tracing::warn!(
                    peer_id = self.follower.peer_id(),
                    result = reply.result,
                    "received unrecognized append result"
                );
            }
        }
        Ok(())
    }

    fn submit_progress_event(&self) {
        let peer_id = self.follower.peer_id();
        let event = if self.follower.attending_vote() {
            LeaderEvent::UpdateCommit { peer_id }
        } else {
            LeaderEvent::StagingProgress { peer_id }
        };
        self.coordinator.submit(event);
    }

    /// Step down on a reply term above ours, once, and stop sending.
    fn check_response_term(&self, response_term: u64) {
        if self.is_running()
            && self.follower.attending_vote()
            && self.coordinator.observe_term(response_term)
        {
            tracing::warn!(
                peer_id = self.follower.peer_id(),
                response_term,
                leader_term = self.leader_term,
                "observed higher term, stepping down"
            );
            self.cancel.cancel();
        }
    }

    /// Snapshot transfer is needed when the follower has to catch up and
    /// either its next index precedes the log start or the log retains no
    /// entries at all but a snapshot exists.
    fn should_install_snapshot(&self) -> Option<Snapshot> {
        if self.follower.next_index() >= self.log.next_index() {
            return None;
        }
        let snapshot = self.log.latest_snapshot()?;
        match self.log.start_index() {
            Some(start) if self.follower.next_index() < start => Some(snapshot),
            None => Some(snapshot),
            _ => None,
        }
    }

    /// Stream one full snapshot to the follower.
    ///
    /// Returns the final reply on completion or rejection. A read or
    /// transport failure yields `None`; the next pass starts a fresh
    /// install under a new request id.
    async fn install_snapshot(
        &mut self,
        snapshot: &Snapshot,
    ) -> Result<Option<InstallSnapshotReply>> {
        let request_id = Uuid::new_v4().to_string();
        let mut stream = match SnapshotChunkStream::new(
            snapshot.clone(),
            self.leader_term,
            self.server_id,
            self.follower.peer_id(),
            request_id,
            self.config.snapshot_chunk_max_size,
        )
        .await
        {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(
                    peer_id = self.follower.peer_id(),
                    snapshot_index = snapshot.index(),
                    error = %e,
                    "failed to open snapshot for streaming"
                );
                return Ok(None);
            }
        };

        let mut reply = None;
        loop {
            let request = match stream.next_request().await {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(
                        peer_id = self.follower.peer_id(),
                        snapshot_index = snapshot.index(),
                        error = %e,
                        "snapshot read failed, aborting install"
                    );
                    return Ok(None);
                }
            };

            self.follower.record_rpc_send(Instant::now());
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => return Err(RelayError::Cancelled),
                outcome = self.transport.send_install_snapshot(request) => outcome,
            };
            match outcome {
                Ok(r) => {
                    self.follower.record_rpc_response(Instant::now());
                    if !r.success {
                        return Ok(Some(r));
                    }
                    reply = Some(r);
                }
                Err(e) if e.is_cancellation() => return Err(RelayError::Cancelled),
                Err(e) => {
                    tracing::warn!(
                        peer_id = self.follower.peer_id(),
                        snapshot_index = snapshot.index(),
                        error = %e,
                        "install_snapshot failed, restarting on next pass"
                    );
                    return Ok(None);
                }
            }
        }

        if reply.is_some() {
            self.follower.update_match_index(snapshot.index());
            self.follower.update_next_index(snapshot.index() + 1);
            tracing::info!(
                peer_id = self.follower.peer_id(),
                snapshot_index = snapshot.index(),
                "snapshot installed on follower"
            );
        }
        Ok(reply)
    }
}

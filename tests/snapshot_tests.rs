//! Snapshot-transfer tests: the switchover decision, the literal chunk
//! sequence, rejection and failure restarts, and replay determinism.


use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use raft_relay::coordinator::LeaderEvent;
use raft_relay::error::TransportError;
use raft_relay::log::{MemoryLog, TermIndex};
use raft_relay::proto::InstallResult;
use raft_relay::snapshot::SnapshotChunkStream;
use test_harness::{
    assert_eventually, snapshot_fixture, snapshot_reply, spawn_replica, test_config,
    MockTransport, TestReplica,
};

const FIVE_SECONDS: Duration = Duration::from_secs(5);

/// Follower at next_index 50 against a log compacted up to a snapshot at
/// (3, 99): all entries below the start are gone, so the replicator must
/// transfer the snapshot.
async fn behind_follower(dir: &std::path::Path, transport: Arc<MockTransport>) -> TestReplica {
    let snapshot = snapshot_fixture(
        dir,
        TermIndex { term: 3, index: 99 },
        &[("f1", 300), ("f2", 120)],
    )
    .await;

    let log = Arc::new(MemoryLog::new());
    log.truncate_prefix(100);
    log.set_snapshot(snapshot);

    spawn_replica(log, transport, 3, 50, true, test_config())
}

#[tokio::test]
async fn test_behind_follower_gets_snapshot_chunks_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MockTransport::new();
    let replica = behind_follower(dir.path(), transport.clone()).await;

    assert_eventually(
        || async { replica.progress.match_index() == 99 },
        FIVE_SECONDS,
        "snapshot install should complete",
    )
    .await;
    replica.handle.stop();

    assert_eq!(replica.progress.next_index(), 100);
    assert!(
        transport.append_batches().is_empty(),
        "no entries were appended while behind the log start"
    );

    let requests = transport.snapshot_requests();
    assert_eq!(requests.len(), 4);
    assert_eq!(
        requests
            .iter()
            .map(|r| {
                let c = &r.chunks[0];
                (c.filename.as_str(), c.offset, c.chunk_index, c.data.len(), c.done)
            })
            .collect::<Vec<_>>(),
        vec![
            ("f1", 0, 0, 128, false),
            ("f1", 128, 1, 128, false),
            ("f1", 256, 2, 44, true),
            ("f2", 0, 0, 120, true),
        ]
    );
    assert_eq!(
        requests.iter().map(|r| r.done).collect::<Vec<_>>(),
        vec![false, false, false, true]
    );
    assert_eq!(
        requests.iter().map(|r| r.request_index).collect::<Vec<_>>(),
        vec![0, 1, 2, 3]
    );
    let ids: HashSet<_> = requests.iter().map(|r| r.request_id.clone()).collect();
    assert_eq!(ids.len(), 1, "one request id for the whole install");
    assert!(requests
        .iter()
        .all(|r| r.term_index == Some(raft_relay::proto::TermIndex { term: 3, index: 99 })));
}

/// Once installed, the follower is served from the log again, with the
/// snapshot tip as the previous position.
#[tokio::test]
async fn test_post_install_heartbeat_uses_snapshot_tip() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MockTransport::new();
    let replica = behind_follower(dir.path(), transport.clone()).await;

    assert_eventually(
        || async { !transport.append_requests().is_empty() },
        FIVE_SECONDS,
        "a heartbeat should follow the install",
    )
    .await;
    replica.handle.stop();

    let heartbeat = &transport.append_requests()[0];
    assert!(heartbeat.entries.is_empty());
    assert_eq!(
        heartbeat.previous,
        Some(raft_relay::proto::TermIndex { term: 3, index: 99 })
    );
}

/// A follower rejection mid-stream aborts the transfer; the next pass
/// starts over with a fresh request id and a request index back at zero.
#[tokio::test]
async fn test_rejection_mid_stream_restarts_install() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MockTransport::new();
    transport.enqueue_snapshot_reply(snapshot_reply(InstallResult::Success, 3, true));
    transport.enqueue_snapshot_reply(snapshot_reply(InstallResult::InProgress, 3, false));

    let replica = behind_follower(dir.path(), transport.clone()).await;

    assert_eventually(
        || async { replica.progress.match_index() == 99 },
        FIVE_SECONDS,
        "second attempt should complete",
    )
    .await;
    replica.handle.stop();

    let requests = transport.snapshot_requests();
    assert_eq!(requests.len(), 6, "2 chunks of the aborted pass + 4 fresh");

    let ids: Vec<_> = requests.iter().map(|r| r.request_id.clone()).collect();
    assert_eq!(ids[0], ids[1]);
    assert_ne!(ids[1], ids[2], "restart uses a fresh request id");
    assert_eq!(requests[2].request_index, 0, "request index starts over");
    assert_eq!(replica.progress.next_index(), 100);
}

/// A transport failure mid-stream behaves the same way: abandon, retry
/// whole under a new id.
#[tokio::test]
async fn test_transport_error_mid_stream_restarts_install() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MockTransport::new();
    transport.enqueue_snapshot_reply(snapshot_reply(InstallResult::Success, 3, true));
    transport.enqueue_snapshot_error(TransportError::Rpc(tonic::Status::unavailable("down")));

    let replica = behind_follower(dir.path(), transport.clone()).await;

    assert_eventually(
        || async { replica.progress.match_index() == 99 },
        FIVE_SECONDS,
        "install should recover from the transport error",
    )
    .await;
    replica.handle.stop();

    let requests = transport.snapshot_requests();
    assert_eq!(requests.len(), 6);
    let ids: HashSet<_> = requests.iter().map(|r| r.request_id.clone()).collect();
    assert_eq!(ids.len(), 2);
}

/// NOT_LEADER during an install steps the leader down like an append-path
/// rejection would.
#[tokio::test]
async fn test_snapshot_not_leader_steps_down() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MockTransport::new();
    transport.enqueue_snapshot_reply(snapshot_reply(InstallResult::NotLeader, 9, false));

    let mut replica = behind_follower(dir.path(), transport.clone()).await;

    assert_eq!(
        replica.events.recv().await,
        Some(LeaderEvent::StepDown { term: 9 })
    );
    assert_eq!(replica.events.recv().await, None, "no second event");
    assert!(replica.handle.join().await.is_ok());

    assert_eq!(transport.snapshot_requests().len(), 1);
    assert_eq!(replica.progress.match_index(), 0);
    assert_eq!(replica.progress.next_index(), 50);
}

/// Two passes over the same snapshot produce the same chunk sequence:
/// offsets, data, digests, and done flags all line up.
#[tokio::test]
async fn test_chunk_stream_replay_is_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    let snapshot = snapshot_fixture(
        dir.path(),
        TermIndex { term: 3, index: 99 },
        &[("f1", 300), ("f2", 120)],
    )
    .await;

    let mut sequences = Vec::new();
    for request_id in ["first", "second"] {
        let mut stream = SnapshotChunkStream::new(
            snapshot.clone(),
            3,
            1,
            2,
            request_id.to_string(),
            128,
        )
        .await
        .unwrap();
        let mut sequence = Vec::new();
        while let Some(request) = stream.next_request().await.unwrap() {
            let c = request.chunks[0].clone();
            sequence.push((c.filename, c.offset, c.chunk_index, c.data, c.done, request.done));
        }
        sequences.push(sequence);
    }
    assert_eq!(sequences[0], sequences[1]);
}

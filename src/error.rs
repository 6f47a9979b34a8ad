use thiserror::Error;

/// Failure of a single transport call.
///
/// Cancellation is kept apart from I/O failure: a cancelled call must
/// never be retried, while any other variant is fair game for the
/// replicator's retry loop.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("rpc failed: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("connection error: {0}")]
    Connect(#[from] tonic::transport::Error),

    #[error("call cancelled")]
    Cancelled,
}

impl TransportError {
    /// True when the failure is a cancellation and must propagate
    /// unchanged rather than be retried.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, TransportError::Cancelled)
    }
}

/// Terminal outcome of a replicator run.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("replication cancelled")]
    Cancelled,

    #[error(
        "follower {peer_id} regressed on success: reply next_index {reply_next} \
         < current next_index {current_next}"
    )]
    NextIndexRegression {
        peer_id: u64,
        reply_next: u64,
        current_next: u64,
    },
}

pub type Result<T> = std::result::Result<T, RelayError>;

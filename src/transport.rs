use tonic::transport::Channel;
use tonic::Code;

use crate::error::TransportError;
use crate::proto::replication_service_client::ReplicationServiceClient;
use crate::proto::{
    AppendEntriesReply, AppendEntriesRequest, InstallSnapshotReply, InstallSnapshotRequest,
};

/// Client side of the replication RPCs, one per follower.
///
/// Implementations must report cancellation as
/// `TransportError::Cancelled`; every other failure is treated as
/// transient by the caller.
#[tonic::async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send_append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesReply, TransportError>;

    async fn send_install_snapshot(
        &self,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotReply, TransportError>;
}

/// gRPC transport over a lazily reconnecting tonic channel.
pub struct GrpcTransport {
    client: ReplicationServiceClient<Channel>,
}

impl GrpcTransport {
    pub async fn connect(addr: String) -> Result<Self, TransportError> {
        let client = ReplicationServiceClient::connect(addr).await?;
        Ok(Self { client })
    }

    fn classify(status: tonic::Status) -> TransportError {
        if status.code() == Code::Cancelled {
            TransportError::Cancelled
        } else {
            TransportError::Rpc(status)
        }
    }
}

#[tonic::async_trait]
impl Transport for GrpcTransport {
    async fn send_append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesReply, TransportError> {
        let mut client = self.client.clone();
        client
            .append_entries(request)
            .await
            .map(|response| response.into_inner())
            .map_err(Self::classify)
    }

    async fn send_install_snapshot(
        &self,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotReply, TransportError> {
        let mut client = self.client.clone();
        client
            .install_snapshot(request)
            .await
            .map(|response| response.into_inner())
            .map_err(Self::classify)
    }
}

pub mod config;
pub mod coordinator;
pub mod error;
pub mod log;
pub mod replication;
pub mod snapshot;
pub mod transport;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("replication");
}

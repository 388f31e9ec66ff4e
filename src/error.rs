use thiserror::Error;

use crate::raft::transport::TransportError;
use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum RaftError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Node is disconnected")]
    Disconnected,

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("gRPC error: {0}")]
    GrpcError(#[from] tonic::Status),

    #[error("gRPC transport error: {0}")]
    GrpcTransport(#[from] tonic::transport::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<RaftError> for tonic::Status {
    fn from(err: RaftError) -> Self {
        match err {
            RaftError::InvalidArgument(msg) => tonic::Status::invalid_argument(msg),
            RaftError::Disconnected => tonic::Status::unavailable("node is disconnected"),
            RaftError::GrpcError(status) => status,
            other => tonic::Status::internal(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, RaftError>;

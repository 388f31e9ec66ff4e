use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use tokio::sync::Mutex;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Status};

use crate::config::{NodeConfig, NodeId};
use crate::grpc::convert;
use crate::proto::raft_service_client::RaftServiceClient;
use crate::raft::rpc::{AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse};
use crate::raft::transport::{Transport, TransportError};

/// [`Transport`] over gRPC.
///
/// Channels are created lazily on first use and cached per peer; tonic
/// reconnects them on its own after a peer restarts. Every call is bounded
/// by the configured RPC timeout.
pub struct GrpcTransport {
    addrs: HashMap<NodeId, String>,
    rpc_timeout: Duration,
    clients: Mutex<HashMap<NodeId, RaftServiceClient<Channel>>>,
}

impl GrpcTransport {
    pub fn new(config: &NodeConfig) -> Self {
        Self {
            addrs: config
                .peers
                .iter()
                .map(|p| (p.node_id.clone(), p.addr.clone()))
                .collect(),
            rpc_timeout: config.rpc_timeout(),
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Get or create a cached client for `peer`
    async fn client(&self, peer: &str) -> Result<RaftServiceClient<Channel>, TransportError> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(peer) {
            return Ok(client.clone());
        }

        let addr = self
            .addrs
            .get(peer)
            .ok_or_else(|| TransportError::Unreachable(peer.to_string()))?;
        let endpoint = Endpoint::from_shared(format!("http://{}", addr))
            .map_err(|e| TransportError::Rejected {
                peer: peer.to_string(),
                message: format!("invalid address {}: {}", addr, e),
            })?
            .connect_timeout(self.rpc_timeout);

        tracing::debug!(peer = %peer, addr = %addr, "Opening channel to peer");
        let client = RaftServiceClient::new(endpoint.connect_lazy());
        clients.insert(peer.to_string(), client.clone());
        Ok(client)
    }

    async fn call<T, F>(&self, peer: &str, call: F) -> Result<T, TransportError>
    where
        F: Future<Output = Result<tonic::Response<T>, Status>>,
    {
        match tokio::time::timeout(self.rpc_timeout, call).await {
            Ok(Ok(response)) => Ok(response.into_inner()),
            Ok(Err(status)) => Err(status_to_error(peer, status)),
            Err(_) => Err(TransportError::Timeout(peer.to_string())),
        }
    }
}

fn status_to_error(peer: &str, status: Status) -> TransportError {
    match status.code() {
        Code::Unavailable => TransportError::Unreachable(peer.to_string()),
        Code::DeadlineExceeded => TransportError::Timeout(peer.to_string()),
        _ => TransportError::Rejected {
            peer: peer.to_string(),
            message: status.message().to_string(),
        },
    }
}

#[tonic::async_trait]
impl Transport for GrpcTransport {
    async fn request_vote(
        &self,
        peer: &str,
        req: VoteRequest,
    ) -> Result<VoteResponse, TransportError> {
        let mut client = self.client(peer).await?;
        let resp = self
            .call(peer, client.request_vote(convert::vote_request_to_proto(req)))
            .await?;
        convert::vote_response_from_proto(resp).map_err(|s| status_to_error(peer, s))
    }

    async fn append_entries(
        &self,
        peer: &str,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError> {
        let mut client = self.client(peer).await?;
        let resp = self
            .call(
                peer,
                client.append_entries(convert::append_request_to_proto(req)),
            )
            .await?;
        convert::append_response_from_proto(resp).map_err(|s| status_to_error(peer, s))
    }
}

use std::sync::Arc;
use tonic::{Request, Response, Status};

use crate::config::NodeConfig;
use crate::grpc::convert;
use crate::proto::client_service_server::ClientService as ClientApi;
use crate::proto::{
    GetLogRequest, GetLogResponse, GetRequest, GetResponse, GetStatusRequest, GetStatusResponse,
    SetConnectivityRequest, SetConnectivityResponse, SubmitRequest, SubmitResponse,
};
use crate::raft::RaftNode;
use crate::store::CommandStore;

/// gRPC service for client-facing API
pub struct ClientService {
    config: NodeConfig,
    raft_node: Arc<RaftNode>,
    store: Arc<CommandStore>,
}

impl ClientService {
    pub fn new(config: NodeConfig, raft_node: Arc<RaftNode>, store: Arc<CommandStore>) -> Self {
        Self {
            config,
            raft_node,
            store,
        }
    }

    /// Address a client should dial to reach `node_id`.
    fn addr_of(&self, node_id: &str) -> Option<String> {
        if node_id == self.config.node_id {
            return Some(self.config.listen_addr.to_string());
        }
        self.config.peer_addr(node_id).map(str::to_owned)
    }
}

#[tonic::async_trait]
impl ClientApi for ClientService {
    async fn submit(
        &self,
        request: Request<SubmitRequest>,
    ) -> Result<Response<SubmitResponse>, Status> {
        let command = request
            .into_inner()
            .command
            .ok_or_else(|| Status::invalid_argument("missing command"))?;
        let command = convert::command_from_proto(command)?;

        tracing::debug!(
            client_id = %command.client_id,
            sequence = command.sequence,
            "Received client command"
        );

        let response = self.raft_node.submit(command).await?;
        let leader_hint = response.leader_hint.unwrap_or_default();
        let leader_addr = self.addr_of(&leader_hint).unwrap_or_default();

        Ok(Response::new(SubmitResponse {
            success: response.success,
            leader_hint,
            leader_addr,
        }))
    }

    async fn get_status(
        &self,
        _request: Request<GetStatusRequest>,
    ) -> Result<Response<GetStatusResponse>, Status> {
        let status = self.raft_node.status().await;
        Ok(Response::new(GetStatusResponse {
            server_id: status.server_id,
            current_term: convert::wire(status.current_term),
            leader_id: status.leader_id.unwrap_or_default(),
            role: status.role.to_string(),
            commit_index: convert::wire(status.commit_index),
            last_applied: convert::wire(status.last_applied),
            last_log_index: convert::wire(status.last_log_index),
            connected: status.connected,
        }))
    }

    async fn get_log(
        &self,
        _request: Request<GetLogRequest>,
    ) -> Result<Response<GetLogResponse>, Status> {
        let entries = self
            .raft_node
            .log()
            .await
            .iter()
            .map(convert::log_entry_to_proto)
            .collect();
        Ok(Response::new(GetLogResponse { entries }))
    }

    async fn get(&self, request: Request<GetRequest>) -> Result<Response<GetResponse>, Status> {
        let key = request.into_inner().key;
        if key.is_empty() {
            return Err(Status::invalid_argument("key must not be empty"));
        }

        let value = self.store.get(&key).await;
        Ok(Response::new(GetResponse {
            found: value.is_some(),
            value: value.unwrap_or_default(),
        }))
    }

    async fn set_connectivity(
        &self,
        request: Request<SetConnectivityRequest>,
    ) -> Result<Response<SetConnectivityResponse>, Status> {
        if request.into_inner().connected {
            self.raft_node.connect();
        } else {
            self.raft_node.disconnect();
        }
        Ok(Response::new(SetConnectivityResponse {
            connected: self.raft_node.is_connected(),
        }))
    }
}

use std::sync::Arc;
use tonic::{Request, Response, Status};

use crate::grpc::convert;
use crate::proto::raft_service_server::RaftService;
use crate::proto::{AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse};
use crate::raft::RaftNode;

/// Peer-facing Raft RPCs, validated and handed to the local node.
pub struct ClusterService {
    raft_node: Arc<RaftNode>,
}

impl ClusterService {
    pub fn new(raft_node: Arc<RaftNode>) -> Self {
        Self { raft_node }
    }
}

#[tonic::async_trait]
impl RaftService for ClusterService {
    async fn request_vote(
        &self,
        request: Request<VoteRequest>,
    ) -> Result<Response<VoteResponse>, Status> {
        let req = convert::vote_request_from_proto(request.into_inner())?;
        tracing::debug!(
            candidate = %req.candidate_id,
            term = req.term,
            "Received RequestVote"
        );

        let response = self.raft_node.handle_request_vote(req).await?;
        Ok(Response::new(convert::vote_response_to_proto(response)))
    }

    async fn append_entries(
        &self,
        request: Request<AppendEntriesRequest>,
    ) -> Result<Response<AppendEntriesResponse>, Status> {
        let req = convert::append_request_from_proto(request.into_inner())?;
        let is_heartbeat = req.entries.is_empty();
        tracing::trace!(
            leader = %req.leader_id,
            term = req.term,
            entries = req.entries.len(),
            is_heartbeat,
            "Received AppendEntries"
        );

        let response = self.raft_node.handle_append_entries(req).await?;
        Ok(Response::new(convert::append_response_to_proto(response)))
    }
}

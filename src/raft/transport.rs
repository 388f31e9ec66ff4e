//! Outbound RPC delivery between cluster members.
//!
//! [`Transport`] is the only way a [`RaftNode`] talks to its peers. The gRPC
//! implementation lives in `crate::grpc::client`; [`LocalNetwork`] wires
//! nodes of one process together and can drop traffic between chosen pairs,
//! which is what the cluster tests use to partition and heal.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use thiserror::Error;
use tokio::sync::RwLock;

use crate::config::NodeId;
use crate::error::RaftError;
use crate::raft::node::RaftNode;
use crate::raft::rpc::{AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer {0} is unreachable")]
    Unreachable(NodeId),

    #[error("request to {0} timed out")]
    Timeout(NodeId),

    #[error("peer {peer} rejected the request: {message}")]
    Rejected { peer: NodeId, message: String },
}

#[tonic::async_trait]
pub trait Transport: Send + Sync {
    async fn request_vote(
        &self,
        peer: &str,
        req: VoteRequest,
    ) -> Result<VoteResponse, TransportError>;

    async fn append_entries(
        &self,
        peer: &str,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError>;
}

/// In-process message fabric.
#[derive(Default)]
pub struct LocalNetwork {
    nodes: RwLock<HashMap<NodeId, Weak<RaftNode>>>,
    /// Directed links that currently drop every message.
    blocked: RwLock<HashSet<(NodeId, NodeId)>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Transport handle for the node named `from`.
    pub fn transport(self: &Arc<Self>, from: impl Into<NodeId>) -> Arc<LocalTransport> {
        Arc::new(LocalTransport {
            from: from.into(),
            network: Arc::clone(self),
        })
    }

    pub async fn register(&self, node: &Arc<RaftNode>) {
        self.nodes
            .write()
            .await
            .insert(node.id.clone(), Arc::downgrade(node));
    }

    pub async fn unregister(&self, node_id: &str) {
        self.nodes.write().await.remove(node_id);
    }

    /// Cut every link between the two groups, in both directions.
    pub async fn partition(&self, group_a: &[&str], group_b: &[&str]) {
        let mut blocked = self.blocked.write().await;
        for a in group_a {
            for b in group_b {
                blocked.insert((a.to_string(), b.to_string()));
                blocked.insert((b.to_string(), a.to_string()));
            }
        }
        tracing::debug!(?group_a, ?group_b, "Network partitioned");
    }

    /// Cut `node_id` off from everyone else.
    pub async fn isolate(&self, node_id: &str) {
        let others: Vec<NodeId> = self
            .nodes
            .read()
            .await
            .keys()
            .filter(|id| id.as_str() != node_id)
            .cloned()
            .collect();
        let others: Vec<&str> = others.iter().map(String::as_str).collect();
        self.partition(&[node_id], &others).await;
    }

    /// Restore every link.
    pub async fn heal(&self) {
        self.blocked.write().await.clear();
        tracing::debug!("Network healed");
    }

    async fn check_link(&self, from: &str, to: &str) -> Result<(), TransportError> {
        if self
            .blocked
            .read()
            .await
            .contains(&(from.to_string(), to.to_string()))
        {
            return Err(TransportError::Unreachable(to.to_string()));
        }
        Ok(())
    }

    async fn route(&self, from: &str, to: &str) -> Result<Arc<RaftNode>, TransportError> {
        self.check_link(from, to).await?;
        self.nodes
            .read()
            .await
            .get(to)
            .and_then(Weak::upgrade)
            .ok_or_else(|| TransportError::Unreachable(to.to_string()))
    }
}

/// One node's view of a [`LocalNetwork`].
pub struct LocalTransport {
    from: NodeId,
    network: Arc<LocalNetwork>,
}

impl LocalTransport {
    /// Responses travel back over the same link, so a cut made while the
    /// request was in flight loses the reply too.
    async fn check_return_path(&self, peer: &str) -> Result<(), TransportError> {
        self.network
            .check_link(peer, &self.from)
            .await
            .map_err(|_| TransportError::Unreachable(peer.to_string()))
    }
}

fn remote_error(peer: &str, err: RaftError) -> TransportError {
    match err {
        RaftError::Disconnected => TransportError::Unreachable(peer.to_string()),
        other => TransportError::Rejected {
            peer: peer.to_string(),
            message: other.to_string(),
        },
    }
}

#[tonic::async_trait]
impl Transport for LocalTransport {
    async fn request_vote(
        &self,
        peer: &str,
        req: VoteRequest,
    ) -> Result<VoteResponse, TransportError> {
        let node = self.network.route(&self.from, peer).await?;
        let resp = node
            .handle_request_vote(req)
            .await
            .map_err(|e| remote_error(peer, e))?;
        self.check_return_path(peer).await?;
        Ok(resp)
    }

    async fn append_entries(
        &self,
        peer: &str,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError> {
        let node = self.network.route(&self.from, peer).await?;
        let resp = node
            .handle_append_entries(req)
            .await
            .map_err(|e| remote_error(peer, e))?;
        self.check_return_path(peer).await?;
        Ok(resp)
    }
}

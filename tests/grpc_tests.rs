//! The gRPC surface end to end: real listeners on loopback, real channels.


use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tonic::Code;

use raft_consensus::config::NodeConfig;
use raft_consensus::grpc::{GrpcServer, GrpcTransport};
use raft_consensus::node::Node;
use raft_consensus::proto::client_service_client::ClientServiceClient;
use raft_consensus::proto::raft_service_client::RaftServiceClient;
use raft_consensus::proto::{
    command, Command, GetRequest, GetStatusRequest, PutAction, SetConnectivityRequest,
    SubmitRequest, VoteRequest,
};
use raft_consensus::raft::{rpc, RaftNode, Transport};
use test_harness::{node_ids, wait_for, ELECTION_JITTER_MS};

const ELECTION_TIMEOUT_MS: u64 = 150;

struct GrpcNode {
    id: String,
    addr: SocketAddr,
    raft_node: Arc<RaftNode>,
}

struct GrpcCluster {
    nodes: Vec<GrpcNode>,
    shutdown: CancellationToken,
}

impl GrpcCluster {
    /// Bind every listener first so each node can be told its peers' ports.
    async fn start(num_nodes: usize) -> Self {
        let ids = node_ids(num_nodes);
        let mut listeners = Vec::new();
        for _ in &ids {
            listeners.push(TcpListener::bind("127.0.0.1:0").await.unwrap());
        }
        let addrs: Vec<SocketAddr> = listeners.iter().map(|l| l.local_addr().unwrap()).collect();

        let shutdown = CancellationToken::new();
        let mut nodes = Vec::new();
        for (i, listener) in listeners.into_iter().enumerate() {
            let mut config = NodeConfig::new(ids[i].clone(), addrs[i])
                .with_election_timeout(ELECTION_TIMEOUT_MS, ELECTION_JITTER_MS);
            for (j, peer) in ids.iter().enumerate() {
                if j != i {
                    config = config.with_peer(peer.clone(), addrs[j].to_string());
                }
            }

            let node = Node::new(config).unwrap();
            let raft_node = node.raft_node.clone();
            tokio::spawn({
                let raft_node = raft_node.clone();
                let token = shutdown.clone();
                async move { raft_node.run(token).await }
            });
            let server = GrpcServer::new(node.config, raft_node.clone(), node.store);
            tokio::spawn({
                let token = shutdown.clone();
                async move { server.run_with_listener(listener, token).await }
            });

            nodes.push(GrpcNode {
                id: ids[i].clone(),
                addr: addrs[i],
                raft_node,
            });
        }

        Self { nodes, shutdown }
    }

    fn node(&self, id: &str) -> &GrpcNode {
        self.nodes.iter().find(|n| n.id == id).unwrap()
    }

    async fn wait_for_leader(&self) -> String {
        let found = wait_for(
            || async { self.leader().await.is_some() },
            Duration::from_secs(5),
            Duration::from_millis(20),
        )
        .await;
        assert!(found, "a leader should be elected over gRPC");
        self.leader().await.unwrap()
    }

    async fn leader(&self) -> Option<String> {
        for node in &self.nodes {
            if node.raft_node.is_leader().await {
                return Some(node.id.clone());
            }
        }
        None
    }
}

impl Drop for GrpcCluster {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn client_for(addr: SocketAddr) -> ClientServiceClient<tonic::transport::Channel> {
    ClientServiceClient::connect(format!("http://{}", addr))
        .await
        .unwrap()
}

fn put(client: &str, sequence: u64, key: &str, value: &str) -> Command {
    Command {
        client_id: client.to_string(),
        sequence,
        action: Some(command::Action::Put(PutAction {
            key: key.to_string(),
            value: value.to_string(),
        })),
    }
}

#[tokio::test]
async fn test_grpc_submit_is_applied_on_every_node() {
    let cluster = GrpcCluster::start(3).await;
    let leader = cluster.wait_for_leader().await;

    let mut client = client_for(cluster.node(&leader).addr).await;
    let resp = client
        .submit(SubmitRequest {
            command: Some(put("c1", 1, "color", "blue")),
        })
        .await
        .unwrap()
        .into_inner();
    assert!(resp.success);
    assert_eq!(resp.leader_hint, leader);

    for node in &cluster.nodes {
        let mut client = client_for(node.addr).await;
        let applied = wait_for(
            || {
                let mut client = client.clone();
                async move {
                    let resp = client
                        .get(GetRequest {
                            key: "color".to_string(),
                        })
                        .await
                        .unwrap()
                        .into_inner();
                    resp.found && resp.value == "blue"
                }
            },
            Duration::from_secs(3),
            Duration::from_millis(20),
        )
        .await;
        assert!(applied, "{} should apply the command", node.id);

        let status = client
            .get_status(GetStatusRequest {})
            .await
            .unwrap()
            .into_inner();
        assert_eq!(status.server_id, node.id);
        assert_eq!(status.leader_id, leader);
        assert!(status.last_applied >= 1);
        assert!(status.current_term >= 1);
        assert!(status.last_log_index >= status.commit_index);
    }
}

#[tokio::test]
async fn test_grpc_follower_returns_leader_address() {
    let cluster = GrpcCluster::start(3).await;
    let leader = cluster.wait_for_leader().await;
    let follower = cluster.nodes.iter().find(|n| n.id != leader).unwrap();

    let knows_leader = wait_for(
        || async { follower.raft_node.leader_id().await.as_deref() == Some(leader.as_str()) },
        Duration::from_secs(2),
        Duration::from_millis(20),
    )
    .await;
    assert!(knows_leader);

    let mut client = client_for(follower.addr).await;
    let resp = client
        .submit(SubmitRequest {
            command: Some(put("c1", 1, "k", "v")),
        })
        .await
        .unwrap()
        .into_inner();
    assert!(!resp.success);
    assert_eq!(resp.leader_hint, leader);
    assert_eq!(resp.leader_addr, cluster.node(&leader).addr.to_string());
}

#[tokio::test]
async fn test_grpc_rejects_malformed_requests() {
    let cluster = GrpcCluster::start(1).await;
    let addr = cluster.nodes[0].addr;

    let mut raft_client = RaftServiceClient::connect(format!("http://{}", addr))
        .await
        .unwrap();
    let err = raft_client
        .request_vote(VoteRequest {
            term: -1,
            candidate_id: "n9".to_string(),
            last_log_index: 0,
            last_log_term: 0,
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    let mut client = client_for(addr).await;
    let err = client
        .submit(SubmitRequest { command: None })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    let mut no_action = put("c1", 1, "k", "v");
    no_action.action = None;
    let err = client
        .submit(SubmitRequest {
            command: Some(no_action),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    let err = client
        .get(GetRequest { key: String::new() })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn test_grpc_connectivity_hooks() {
    let cluster = GrpcCluster::start(1).await;
    let addr = cluster.nodes[0].addr;
    let mut client = client_for(addr).await;

    let resp = client
        .set_connectivity(SetConnectivityRequest { connected: false })
        .await
        .unwrap()
        .into_inner();
    assert!(!resp.connected);
    assert!(!cluster.nodes[0].raft_node.is_connected());

    // Peer traffic is refused while disconnected
    let mut raft_client = RaftServiceClient::connect(format!("http://{}", addr))
        .await
        .unwrap();
    let err = raft_client
        .request_vote(VoteRequest {
            term: 100,
            candidate_id: "n9".to_string(),
            last_log_index: 0,
            last_log_term: 0,
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unavailable);

    let resp = client
        .set_connectivity(SetConnectivityRequest { connected: true })
        .await
        .unwrap()
        .into_inner();
    assert!(resp.connected);
    let status = client
        .get_status(GetStatusRequest {})
        .await
        .unwrap()
        .into_inner();
    assert!(status.connected);
    assert!(status.current_term < 100, "the refused vote request left no trace");
}

#[tokio::test]
async fn test_grpc_transport_reaches_live_peer() {
    let cluster = GrpcCluster::start(1).await;
    let peer = &cluster.nodes[0];

    let config = NodeConfig::new("probe", "127.0.0.1:0".parse().unwrap())
        .with_peer(peer.id.clone(), peer.addr.to_string());
    let transport = GrpcTransport::new(&config);

    let resp = transport
        .request_vote(
            &peer.id,
            rpc::VoteRequest {
                term: 1_000,
                candidate_id: "probe".to_string(),
                last_log_index: 0,
                last_log_term: 0,
            },
        )
        .await
        .unwrap();
    assert_eq!(resp.term, 1_000);
}

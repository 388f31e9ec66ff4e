use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::config::NodeConfig;
use crate::grpc::client_service::ClientService;
use crate::grpc::cluster_service::ClusterService;
use crate::proto::client_service_server::ClientServiceServer;
use crate::proto::raft_service_server::RaftServiceServer;
use crate::raft::RaftNode;
use crate::store::CommandStore;

pub struct GrpcServer {
    config: NodeConfig,
    raft_node: Arc<RaftNode>,
    store: Arc<CommandStore>,
}

impl GrpcServer {
    pub fn new(config: NodeConfig, raft_node: Arc<RaftNode>, store: Arc<CommandStore>) -> Self {
        Self {
            config,
            raft_node,
            store,
        }
    }

    fn router(&self) -> tonic::transport::server::Router {
        let cluster_service = ClusterService::new(self.raft_node.clone());
        let client_service =
            ClientService::new(self.config.clone(), self.raft_node.clone(), self.store.clone());

        Server::builder()
            .add_service(RaftServiceServer::new(cluster_service))
            .add_service(ClientServiceServer::new(client_service))
    }

    /// Serve on the configured listen address until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), tonic::transport::Error> {
        let addr: SocketAddr = self.config.listen_addr;
        tracing::info!(addr = %addr, "Starting gRPC server");

        self.router()
            .serve_with_shutdown(addr, async move { shutdown.cancelled().await })
            .await
    }

    /// Serve on an already bound listener, e.g. one bound to port 0.
    pub async fn run_with_listener(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), tonic::transport::Error> {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(addr = %addr, "Starting gRPC server");
        }

        self.router()
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                shutdown.cancelled().await
            })
            .await
    }
}

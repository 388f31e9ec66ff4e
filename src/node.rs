use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::error::Result;
use crate::grpc::{GrpcServer, GrpcTransport};
use crate::raft::RaftNode;
use crate::storage::{FileStore, LogStore, MemoryStore};
use crate::store::CommandStore;

/// Main node that orchestrates all components
pub struct Node {
    pub config: NodeConfig,
    pub raft_node: Arc<RaftNode>,
    pub store: Arc<CommandStore>,
}

impl Node {
    /// Build a node from `config`, restoring durable state from
    /// `config.data_dir` when one is set.
    pub fn new(config: NodeConfig) -> Result<Self> {
        config.validate()?;

        let log_store: Box<dyn LogStore> = match &config.data_dir {
            Some(dir) => Box::new(FileStore::open(dir)?),
            None => {
                tracing::warn!("No data directory configured, Raft state will not survive restarts");
                Box::new(MemoryStore::new())
            }
        };

        let store = Arc::new(CommandStore::new());
        let transport = Arc::new(GrpcTransport::new(&config));
        let raft_node = Arc::new(RaftNode::new(
            config.clone(),
            log_store,
            transport,
            store.clone(),
        ));

        Ok(Self {
            config,
            raft_node,
            store,
        })
    }

    /// Run the node until `shutdown` is cancelled.
    ///
    /// The Raft timers run as a spawned task; the gRPC server runs on the
    /// calling task and returns once it has drained.
    ///
    /// # Errors
    ///
    /// Returns an error if the gRPC server fails to bind or hits a fatal
    /// transport error.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let raft_node = self.raft_node.clone();
        let raft_shutdown = shutdown.clone();
        let raft_task = tokio::spawn(async move {
            raft_node.run(raft_shutdown).await;
        });

        let server = GrpcServer::new(self.config.clone(), self.raft_node.clone(), self.store);
        let result = server.run(shutdown.clone()).await;

        // Stop the timers even if the server failed on its own.
        shutdown.cancel();
        if let Err(e) = raft_task.await {
            tracing::error!(error = %e, "Raft task panicked");
        }

        result?;
        tracing::info!(node_id = %self.config.node_id, "Node stopped");
        Ok(())
    }
}

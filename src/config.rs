use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{RaftError, Result};

/// Identity of a cluster member.
pub type NodeId = String;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: NodeId,
    pub listen_addr: SocketAddr,
    pub peers: Vec<PeerConfig>,
    /// Base election timeout. The heartbeat interval is derived from it.
    pub election_timeout_ms: u64,
    /// Extra random delay added on top of the base timeout at every firing,
    /// so that nodes do not keep timing out in lockstep.
    pub election_jitter_ms: u64,
    /// Deadline applied by the network transport to each outbound RPC.
    pub rpc_timeout_ms: u64,
    /// Directory of the durable state store. `None` keeps state in memory.
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub node_id: NodeId,
    pub addr: String, // host:port format, supports both IP and hostnames
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "node-1".to_string(),
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 50051)),
            peers: Vec::new(),
            election_timeout_ms: 300,
            election_jitter_ms: 300,
            rpc_timeout_ms: 100,
            data_dir: None,
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: impl Into<NodeId>, listen_addr: SocketAddr) -> Self {
        Self {
            node_id: node_id.into(),
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_peer(mut self, node_id: impl Into<NodeId>, addr: impl Into<String>) -> Self {
        self.peers.push(PeerConfig {
            node_id: node_id.into(),
            addr: addr.into(),
        });
        self
    }

    pub fn with_election_timeout(mut self, timeout_ms: u64, jitter_ms: u64) -> Self {
        self.election_timeout_ms = timeout_ms;
        self.election_jitter_ms = jitter_ms;
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }

    /// A live leader sends three heartbeats per follower timeout.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms / 3)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn peer_ids(&self) -> Vec<NodeId> {
        self.peers.iter().map(|p| p.node_id.clone()).collect()
    }

    pub fn peer_addr(&self, node_id: &str) -> Option<&str> {
        self.peers
            .iter()
            .find(|p| p.node_id == node_id)
            .map(|p| p.addr.as_str())
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() || self.node_id.contains(':') {
            return Err(RaftError::Config(format!(
                "invalid node id {:?}: must be non-empty and contain no ':'",
                self.node_id
            )));
        }
        if self.election_timeout_ms == 0 || self.heartbeat_interval().is_zero() {
            return Err(RaftError::Config(format!(
                "election timeout of {}ms leaves no room for a heartbeat interval",
                self.election_timeout_ms
            )));
        }

        let mut seen = HashSet::new();
        for peer in &self.peers {
            if peer.node_id == self.node_id {
                return Err(RaftError::Config(format!(
                    "peer list contains this node's own id {}",
                    peer.node_id
                )));
            }
            if !seen.insert(peer.node_id.as_str()) {
                return Err(RaftError::Config(format!(
                    "duplicate peer id {}",
                    peer.node_id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_config_default() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.node_id, "node-1");
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:50051");
        assert!(cfg.peers.is_empty());
        assert_eq!(cfg.election_timeout_ms, 300);
        assert_eq!(cfg.heartbeat_interval(), Duration::from_millis(100));
        assert!(cfg.data_dir.is_none());
    }

    #[test]
    fn node_config_with_peer() {
        let cfg = NodeConfig::default()
            .with_peer("b", "127.0.0.1:50052")
            .with_peer("c", "127.0.0.1:50053");
        assert_eq!(cfg.peers.len(), 2);
        assert_eq!(cfg.peer_ids(), vec!["b".to_string(), "c".to_string()]);
        assert_eq!(cfg.peer_addr("c"), Some("127.0.0.1:50053"));
        assert_eq!(cfg.peer_addr("z"), None);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn heartbeat_is_a_third_of_election_timeout() {
        let cfg = NodeConfig::default().with_election_timeout(150, 0);
        assert_eq!(cfg.election_timeout(), Duration::from_millis(150));
        assert_eq!(cfg.heartbeat_interval(), Duration::from_millis(50));
    }

    #[test]
    fn validate_rejects_self_in_peers() {
        let cfg = NodeConfig::new("a", "127.0.0.1:1".parse().unwrap()).with_peer("a", "x:1");
        assert!(matches!(cfg.validate(), Err(RaftError::Config(_))));
    }

    #[test]
    fn validate_rejects_duplicate_peers() {
        let cfg = NodeConfig::new("a", "127.0.0.1:1".parse().unwrap())
            .with_peer("b", "x:1")
            .with_peer("b", "x:2");
        assert!(matches!(cfg.validate(), Err(RaftError::Config(_))));
    }

    #[test]
    fn validate_rejects_tiny_timeout() {
        let cfg = NodeConfig::default().with_election_timeout(2, 0);
        assert!(cfg.validate().is_err());

        let cfg = NodeConfig {
            node_id: String::new(),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}

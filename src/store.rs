use std::collections::BTreeMap;

use tokio::sync::RwLock;

use crate::raft::state::{Action, Command};

/// Consumer of committed commands.
///
/// `apply` is called once per log index, in index order, and only after the
/// entry is committed.
#[tonic::async_trait]
pub trait StateMachine: Send + Sync {
    async fn apply(&self, index: u64, command: &Command);
}

#[derive(Debug, Default)]
struct Inner {
    data: BTreeMap<String, String>,
    last_applied: u64,
}

/// In-memory key/value store fed by the replicated log.
#[derive(Debug, Default)]
pub struct CommandStore {
    inner: RwLock<Inner>,
}

impl CommandStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.inner.read().await.data.get(key).cloned()
    }

    /// Copy of every key/value pair, sorted by key.
    pub async fn snapshot(&self) -> Vec<(String, String)> {
        self.inner
            .read()
            .await
            .data
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.data.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Index of the last command applied to this store.
    pub async fn last_applied(&self) -> u64 {
        self.inner.read().await.last_applied
    }
}

#[tonic::async_trait]
impl StateMachine for CommandStore {
    async fn apply(&self, index: u64, command: &Command) {
        let mut inner = self.inner.write().await;
        if index <= inner.last_applied {
            tracing::warn!(index, last_applied = inner.last_applied, "Ignoring replayed command");
            return;
        }

        match &command.action {
            Action::Put { key, value } => {
                inner.data.insert(key.clone(), value.clone());
            }
            Action::Delete { key } => {
                inner.data.remove(key);
            }
        }
        inner.last_applied = index;

        tracing::trace!(
            index,
            client_id = %command.client_id,
            sequence = command.sequence,
            "Applied command"
        );
    }
}

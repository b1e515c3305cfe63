//! Directory of connected tunnel agents

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::connection::AgentConnection;
use crate::error::TunnelError;

/// Maps agent ids to live connections
#[derive(Clone, Default)]
pub struct TunnelRegistry {
    connections: Arc<RwLock<HashMap<u64, Arc<AgentConnection>>>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection under its id
    pub async fn register(&self, connection: Arc<AgentConnection>) {
        let id = connection.id();
        self.connections.write().await.insert(id, connection);
        debug!(agent_id = id, "Registered agent");
    }

    /// Remove a connection; returns whether it was registered
    pub async fn deregister(&self, id: u64) -> bool {
        let removed = self.connections.write().await.remove(&id).is_some();
        if removed {
            debug!(agent_id = id, "Deregistered agent");
        }
        removed
    }

    pub async fn lookup(&self, id: u64) -> Result<Arc<AgentConnection>, TunnelError> {
        self.connections
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(TunnelError::TunnelNotFound(id))
    }

    /// Ids of all registered agents, ascending
    pub async fn ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.connections.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }
}

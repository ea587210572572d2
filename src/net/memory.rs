//! In-process transport implementation (for testing)

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::net::RaftTransport;
use crate::node::RaftNode;
use crate::rpc::{RpcRequest, RpcResponse};
use crate::{ConsensusError, NodeId, Result};

/// Routes RPCs between nodes living in the same process.
///
/// Nodes register their handles after spawning; `deregister` severs a node
/// from the mesh, which makes every call to it fail at the transport level
/// (a crash-stop or partition, from the callers' point of view).
#[derive(Debug, Clone, Default)]
pub struct InMemoryNetwork {
    nodes: Arc<RwLock<HashMap<NodeId, RaftNode>>>,
}

impl InMemoryNetwork {
    /// Create an empty mesh
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a node reachable under its id
    pub async fn register(&self, node: &RaftNode) {
        self.nodes
            .write()
            .await
            .insert(node.id().clone(), node.clone());
    }

    /// Sever a node from the mesh
    pub async fn deregister(&self, id: &NodeId) {
        self.nodes.write().await.remove(id);
    }
}

#[async_trait]
impl RaftTransport for InMemoryNetwork {
    async fn connect(&self, peer: &NodeId) -> Result<()> {
        if self.nodes.read().await.contains_key(peer) {
            Ok(())
        } else {
            Err(ConsensusError::Transport(format!("peer {peer} is unreachable")))
        }
    }

    async fn call(&self, peer: &NodeId, request: RpcRequest) -> Result<RpcResponse> {
        let target = self.nodes.read().await.get(peer).cloned();
        match target {
            Some(node) => node.handle_rpc(request).await,
            None => Err(ConsensusError::Transport(format!("peer {peer} is unreachable"))),
        }
    }
}

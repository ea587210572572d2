//! Common test utilities: an in-process multi-node cluster harness

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use raftforge::net::InMemoryNetwork;
use raftforge::{
    LogIndex, MemoryPersistence, NodeId, NodeStatus, RaftConfig, RaftNode, RoleKind,
};

/// Node configuration with shorter timeouts for faster tests
pub fn test_config(id: &NodeId) -> RaftConfig {
    RaftConfig {
        id: Some(id.clone()),
        election_timeout_min: 50,
        election_timeout_max: 100,
        heartbeat_interval: 20,
    }
}

/// Opt-in tracing output for debugging test runs (RUST_LOG=debug)
#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// A cluster of in-process nodes sharing one transport mesh and one
/// persistence backend (keyed per node id).
pub struct TestCluster {
    pub network: InMemoryNetwork,
    pub persistence: Arc<MemoryPersistence>,
    pub nodes: HashMap<NodeId, RaftNode>,
}

impl TestCluster {
    /// Start `size` nodes named n1..nN with fast test timeouts
    pub async fn start(size: usize) -> Self {
        Self::start_with(size, Arc::new(MemoryPersistence::new()), test_config).await
    }

    /// Start a cluster over an existing (possibly pre-seeded) backend with
    /// per-node configuration
    pub async fn start_with(
        size: usize,
        persistence: Arc<MemoryPersistence>,
        config_fn: impl Fn(&NodeId) -> RaftConfig,
    ) -> Self {
        let network = InMemoryNetwork::new();
        let ids: Vec<NodeId> = (1..=size).map(|i| NodeId::new(format!("n{i}"))).collect();

        let mut nodes = HashMap::new();
        for id in &ids {
            let peers = ids.iter().filter(|peer| *peer != id).cloned().collect();
            let node = RaftNode::spawn(
                config_fn(id),
                persistence.clone(),
                Arc::new(network.clone()),
                peers,
            )
            .expect("node should spawn");
            network.register(&node).await;
            nodes.insert(id.clone(), node);
        }

        Self {
            network,
            persistence,
            nodes,
        }
    }

    #[allow(dead_code)]
    pub fn node(&self, id: &str) -> &RaftNode {
        self.nodes.get(&NodeId::new(id)).expect("unknown node id")
    }

    pub async fn statuses(&self) -> Vec<NodeStatus> {
        let mut statuses = Vec::new();
        for node in self.nodes.values() {
            if let Ok(status) = node.status().await {
                statuses.push(status);
            }
        }
        statuses
    }

    /// Wait until exactly one live node reports itself leader
    pub async fn wait_for_leader(&self) -> NodeId {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let leaders: Vec<NodeId> = self
                .statuses()
                .await
                .into_iter()
                .filter(|s| s.role == RoleKind::Leader)
                .map(|s| s.id)
                .collect();
            if leaders.len() == 1 {
                return leaders.into_iter().next().unwrap();
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "no single leader elected within 5s (saw {leaders:?})"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Submit a command through whichever node currently leads, retrying
    /// across leadership changes. Returns the chosen leader and the index.
    #[allow(dead_code)]
    pub async fn command(&self, command: &[u8]) -> (NodeId, LogIndex) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let leader = self.wait_for_leader().await;
            match self.nodes[&leader].command(command.to_vec()).await {
                Ok(index) => return (leader, index),
                Err(err) => {
                    assert!(
                        tokio::time::Instant::now() < deadline,
                        "command not accepted within 5s: {err}"
                    );
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            }
        }
    }

    /// Wait until a node has applied entries up to `index`
    #[allow(dead_code)]
    pub async fn wait_applied(&self, id: &NodeId, index: LogIndex) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Ok(status) = self.nodes[id].status().await {
                if status.last_applied >= index {
                    return;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "{id} did not apply index {index} within 5s"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait until every node has applied entries up to `index`
    #[allow(dead_code)]
    pub async fn wait_all_applied(&self, index: LogIndex) {
        let ids: Vec<NodeId> = self.nodes.keys().cloned().collect();
        for id in ids {
            self.wait_applied(&id, index).await;
        }
    }

    /// Crash-stop a node and sever it from the mesh
    #[allow(dead_code)]
    pub async fn kill(&mut self, id: &NodeId) {
        if let Some(node) = self.nodes.remove(id) {
            let _ = node.stop().await;
        }
        self.network.deregister(id).await;
    }

    /// Restart a node under the same id against the shared backend
    #[allow(dead_code)]
    pub async fn restart(&mut self, id: &NodeId, all_ids: &[NodeId]) {
        let peers = all_ids.iter().filter(|peer| *peer != id).cloned().collect();
        let node = RaftNode::spawn(
            test_config(id),
            self.persistence.clone(),
            Arc::new(self.network.clone()),
            peers,
        )
        .expect("node should respawn");
        self.network.register(&node).await;
        self.nodes.insert(id.clone(), node);
    }

    #[allow(dead_code)]
    pub async fn stop_all(&self) {
        for node in self.nodes.values() {
            let _ = node.stop().await;
        }
    }
}

//! Network layer: the transport seam, per-peer connections, and RPC fan-out
//!
//! The physical transport carrying RPCs between nodes is an external
//! collaborator; the engine only talks to [`RaftTransport`]. [`Peer`] wraps
//! one remote participant, [`Broadcast`](broadcast::Broadcast) fans a single
//! request out to every peer, and [`InMemoryNetwork`] routes requests between
//! in-process nodes for tests and demos.

pub mod broadcast;
pub mod memory;
pub mod peer;

pub use memory::InMemoryNetwork;
pub use peer::Peer;

use async_trait::async_trait;

use crate::rpc::{RpcRequest, RpcResponse};
use crate::{NodeId, Result};

/// Transport seam between a node and its peers.
///
/// Implementations do not retry: a transport failure is surfaced to the
/// caller, and the role decides whether and when to re-invoke.
#[async_trait]
pub trait RaftTransport: Send + Sync + 'static {
    /// Establish the underlying channel to a peer; idempotent.
    async fn connect(&self, peer: &NodeId) -> Result<()>;

    /// Invoke one RPC on a peer and wait for its reply or a transport error.
    async fn call(&self, peer: &NodeId, request: RpcRequest) -> Result<RpcResponse>;
}

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::warn;

use super::cluster::NodeId;
use super::errors::SendError;
use super::messages::OutboundMessage;

/// Delivery seam implemented by the messaging layer.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, node: NodeId, msg: OutboundMessage) -> Result<(), SendError>;
}

/// In-process entry point of the map executor on the local node. Requests
/// addressed to the local node bypass the network and land here.
pub trait MapExecutor: Send + Sync {
    fn on_request(&self, source: NodeId, msg: OutboundMessage);
}

/// Produces a node-specific variant of an outbound message, e.g. to attach
/// per-node partitions or per-recipient transaction details.
pub type Specializer<'a> = dyn Fn(NodeId, &OutboundMessage) -> OutboundMessage + Send + Sync + 'a;

/// Fans one message out to a set of nodes, specializing per recipient and
/// short-circuiting local deliveries to the in-process map executor.
pub struct MessageAdapter {
    transport: Arc<dyn Transport>,
    local: NodeId,
    local_handler: RwLock<Option<Arc<dyn MapExecutor>>>,
}

impl MessageAdapter {
    pub fn new(transport: Arc<dyn Transport>, local: NodeId) -> MessageAdapter {
        MessageAdapter {
            transport,
            local,
            local_handler: RwLock::new(None),
        }
    }

    pub fn local_node(&self) -> NodeId {
        self.local
    }

    /// Registers the local map executor; without one, local deliveries go
    /// through the transport like any other node.
    pub fn set_local_handler(&self, handler: Arc<dyn MapExecutor>) {
        *self.local_handler.write() = Some(handler);
    }

    /// Sends `msg` to every node in `nodes`. Returns true iff every delivery
    /// succeeded; a false return is a retry signal for the orchestrator.
    ///
    /// When `run_local_parallel` is set, the local in-process delivery runs
    /// on its own task instead of blocking the caller.
    pub async fn send_to(
        &self,
        nodes: &[NodeId],
        msg: &OutboundMessage,
        specialize: Option<&Specializer<'_>>,
        run_local_parallel: bool,
    ) -> bool {
        let mut ok = true;

        for &node in nodes {
            let node_msg = match specialize {
                Some(f) => f(node, msg),
                None => msg.clone(),
            };

            let local_handler = if node == self.local {
                self.local_handler.read().clone()
            } else {
                None
            };

            if let Some(handler) = local_handler {
                let local = self.local;
                if run_local_parallel {
                    tokio::spawn(async move { handler.on_request(local, node_msg) });
                } else {
                    handler.on_request(local, node_msg);
                }
                continue;
            }

            if let Err(e) = self.transport.send(node, node_msg).await {
                warn!(node = %node, error = %e, "failed to send message");
                ok = false;
            }
        }

        ok
    }
}

//! Cluster fan-out.
//!
//! Messages produced locally are broadcast through a [`ClusterTransport`]; messages
//! received from peers are applied locally and never forwarded again, so a publish crosses
//! each node once.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::ServerContext;
use crate::dispatch::Message;
use crate::error::MqttError;
use crate::event::Event;
use crate::packet::Packet;
use crate::types::{ClientId, NodeId, Publish, Reason};
use crate::Result;

/// Inter-node message, encoded with bincode on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterMessage {
    Publish { from_node: NodeId, publish: Publish },
    /// A client connected on `node_id`, other nodes drop their session of that client
    Connected { client_id: ClientId, node_id: NodeId },
    Disconnected { client_id: ClientId, node_id: NodeId },
}

impl ClusterMessage {
    #[inline]
    pub fn origin(&self) -> NodeId {
        match self {
            ClusterMessage::Publish { from_node, .. } => *from_node,
            ClusterMessage::Connected { node_id, .. } | ClusterMessage::Disconnected { node_id, .. } => *node_id,
        }
    }

    #[inline]
    pub fn encode(&self) -> std::result::Result<Vec<u8>, MqttError> {
        Ok(bincode::serialize(self)?)
    }

    #[inline]
    pub fn decode(data: &[u8]) -> std::result::Result<ClusterMessage, MqttError> {
        Ok(bincode::deserialize::<ClusterMessage>(data)?)
    }
}

/// Delivery of cluster messages to the other nodes.
#[async_trait]
pub trait ClusterTransport: Sync + Send {
    /// Sends `msg` to every peer, not to the local node.
    async fn broadcast(&self, msg: ClusterMessage) -> Result<()>;

    fn local_node_id(&self) -> NodeId;
}

#[derive(Clone)]
pub struct ClusterAdaptor {
    transport: Arc<dyn ClusterTransport>,
}

impl ClusterAdaptor {
    pub fn new(transport: Arc<dyn ClusterTransport>) -> Self {
        Self { transport }
    }

    #[inline]
    pub fn node_id(&self) -> NodeId {
        self.transport.local_node_id()
    }

    /// Broadcasts a locally originated message; transport failures are logged.
    pub async fn forward(&self, scx: &ServerContext, msg: ClusterMessage) {
        if matches!(msg, ClusterMessage::Publish { .. }) {
            scx.metrics.messages_forward_inc();
        }
        if let Err(e) = self.transport.broadcast(msg).await {
            log::warn!("cluster forward error, {:?}", e);
        }
    }

    /// Delivers a publish received from a peer to local subscribers only.
    pub async fn publish_local_only(&self, scx: &ServerContext, publish: Publish) -> Option<Event> {
        scx.dispatcher.dispatch(scx, Message::Packet(Packet::Publish(publish)), None).await
    }

    /// Applies a message received from a peer.
    pub async fn on_message(&self, scx: &ServerContext, msg: ClusterMessage) {
        if msg.origin() == self.node_id() {
            log::debug!("cluster message from the local node ignored, {:?}", msg);
            return;
        }
        match msg {
            ClusterMessage::Publish { publish, .. } => {
                self.publish_local_only(scx, publish).await;
            }
            ClusterMessage::Connected { client_id, node_id } => {
                if let Some(channel) = scx.channels.get(&client_id) {
                    log::debug!("{:?} kicked, {} connected on node {}", channel, client_id, node_id);
                    channel.close(scx, Reason::Kicked(Some(node_id))).await;
                }
            }
            ClusterMessage::Disconnected { client_id, node_id } => {
                log::debug!("{} disconnected on node {}", client_id, node_id);
            }
        }
    }

    /// Decodes and applies a raw message received from a peer.
    pub async fn on_bytes(&self, scx: &ServerContext, data: &[u8]) -> Result<()> {
        let msg = ClusterMessage::decode(data)?;
        self.on_message(scx, msg).await;
        Ok(())
    }
}

impl fmt::Debug for ClusterAdaptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClusterAdaptor {{ node_id: {} }}", self.node_id())
    }
}

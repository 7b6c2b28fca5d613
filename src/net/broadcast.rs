//! Fan-out to pin-capable peers
//!
//! The tracker and the pin store both announce through this seam, so they
//! never hold a reference to the node (which owns them) and tests can
//! substitute a recording sink.

use std::sync::Weak;

use async_trait::async_trait;
use tracing::debug;

use crate::message::Message;

/// Sink for messages addressed to every pin-capable peer
#[async_trait]
pub trait Broadcast: Send + Sync {
    /// Send `message` on every channel advertising the pin service bit.
    /// Returns the number of channels reached; completion of the fan-out is
    /// the return itself.
    async fn broadcast_to_pin_peers(&self, message: Message) -> usize;
}

/// Node-backed broadcaster, linked after the node exists
pub struct Broadcaster {
    node: parking_lot::RwLock<Weak<crate::net::Node>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            node: parking_lot::RwLock::new(Weak::new()),
        }
    }

    /// Attach the node once it has been constructed.
    pub fn link_to_node(&self, node: &std::sync::Arc<crate::net::Node>) {
        *self.node.write() = std::sync::Arc::downgrade(node);
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broadcast for Broadcaster {
    async fn broadcast_to_pin_peers(&self, message: Message) -> usize {
        let node = match self.node.read().upgrade() {
            Some(node) => node,
            None => {
                debug!("broadcast before node link, dropping {}", message.command());
                return 0;
            }
        };

        let channels = node.pin_capable_channels();
        let mut reached = 0;
        for channel in channels {
            // Object sends go through the pin-sync instance so the peer
            // receives any headers it needs to verify the anchor first.
            let sent = if let Message::Object(payload) = &message {
                match channel.pin_sync() {
                    Some(sync) => sync.send_object(&channel, payload).await.is_ok(),
                    None => channel.send(message.clone()).await.is_ok(),
                }
            } else {
                channel.send(message.clone()).await.is_ok()
            };

            if sent {
                reached += 1;
            }
        }

        debug!(
            "broadcast {} reached {} pin peer(s)",
            message.command(),
            reached
        );
        reached
    }
}

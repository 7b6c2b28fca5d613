//! Per-peer protocol instances
//!
//! Each channel gets its own stack: liveness pings, reject logging when
//! the peer speaks BIP 61, address exchange, header synchronization and,
//! for pin-capable peers, pin synchronization.

pub mod address;
pub mod header_sync;
pub mod pin_sync;

pub use address::AddressProtocol;
pub use header_sync::HeaderSyncProtocol;
pub use pin_sync::PinSyncProtocol;

use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, warn};

use crate::error::Error;
use crate::message::{Message, VERSION_BIP31};
use crate::net::channel::{Channel, Protocol};

/// Liveness pings; nonce form from protocol 60001 on
pub struct PingProtocol {
    negotiated_version: u32,
}

impl PingProtocol {
    pub fn new(negotiated_version: u32) -> Self {
        Self { negotiated_version }
    }
}

#[async_trait]
impl Protocol for PingProtocol {
    fn name(&self) -> &'static str {
        "ping"
    }

    async fn on_message(&self, channel: &Arc<Channel>, message: &Message) -> Result<(), Error> {
        match message {
            // Pre-BIP31 pings carry no nonce and expect no reply.
            Message::Ping(Some(nonce)) => channel.send(Message::Pong(*nonce)).await,
            Message::Pong(nonce) => {
                debug!("pong {} from [{}]", nonce, channel.peer_address());
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn heartbeat(&self, channel: &Arc<Channel>) -> Result<(), Error> {
        let ping = if self.negotiated_version >= VERSION_BIP31 {
            Message::Ping(Some(rand::thread_rng().gen()))
        } else {
            Message::Ping(None)
        };
        channel.send(ping).await
    }
}

/// Logs rejects from BIP 61 peers; the overlay never acts on them
pub struct RejectProtocol;

#[async_trait]
impl Protocol for RejectProtocol {
    fn name(&self) -> &'static str {
        "reject"
    }

    async fn on_message(&self, channel: &Arc<Channel>, message: &Message) -> Result<(), Error> {
        if let Message::Reject(reject) = message {
            warn!(
                "[{}] rejected our {:?}: {:?} {}",
                channel.peer_address(),
                reject.message,
                reject.code,
                reject.reason
            );
        }
        Ok(())
    }
}

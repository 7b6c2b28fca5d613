//! Address exchange
//!
//! Advertises our own address, asks for more, serves the pin-capable
//! slice of the ring, and tops up whenever we run short of pin-capable
//! hosts.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::chain::unix_now;
use crate::error::Error;
use crate::message::{Message, NetAddress, SERVICE_PIN};
use crate::net::channel::{Channel, Protocol};
use crate::net::Node;

pub struct AddressProtocol {
    node: Arc<Node>,
}

impl AddressProtocol {
    pub fn new(node: Arc<Node>) -> Self {
        Self { node }
    }

    fn self_address(&self) -> Option<NetAddress> {
        self.node
            .settings()
            .self_address
            .map(|address| NetAddress::new(address, self.node.settings().services, unix_now()))
    }
}

#[async_trait]
impl Protocol for AddressProtocol {
    fn name(&self) -> &'static str {
        "address"
    }

    async fn start(&self, channel: &Arc<Channel>) -> Result<(), Error> {
        if let Some(self_address) = self.self_address() {
            channel.send(Message::Addr(vec![self_address])).await?;
        }

        // Without room to store addresses we neither ask nor handle.
        if self.node.settings().host_pool_capacity == 0 {
            return Ok(());
        }

        channel.send(Message::GetAddr).await
    }

    async fn on_message(&self, channel: &Arc<Channel>, message: &Message) -> Result<(), Error> {
        match message {
            Message::Addr(addresses) => {
                debug!(
                    "storing {} address(es) from [{}]",
                    addresses.len(),
                    channel.peer_address()
                );
                self.node.store(addresses);
                Ok(())
            }
            Message::GetAddr => {
                let mut response = self.node.fetch_addresses(SERVICE_PIN);
                if let Some(self_address) = self.self_address() {
                    response.push(self_address);
                }
                if response.is_empty() {
                    // Nothing worth sending; the peer will ask again.
                    return Ok(());
                }
                response.truncate(1000);
                debug!(
                    "sending {} address(es) to [{}]",
                    response.len(),
                    channel.peer_address()
                );
                channel.send(Message::Addr(response)).await
            }
            _ => Ok(()),
        }
    }

    async fn heartbeat(&self, channel: &Arc<Channel>) -> Result<(), Error> {
        let target = self.node.settings().outbound_connections;
        if self.node.address_count(SERVICE_PIN) < target {
            debug!(
                "short of pin-capable addresses, asking [{}]",
                channel.peer_address()
            );
            channel.send(Message::GetAddr).await?;
        }
        Ok(())
    }
}

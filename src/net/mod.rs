//! Peer networking: channels, the overlay node, broadcasting

pub mod broadcast;
pub mod channel;
pub mod node;

pub use broadcast::{Broadcast, Broadcaster};
pub use channel::{Channel, Protocol, HANDSHAKE_TIMEOUT, HEARTBEAT_INTERVAL};
pub use node::{Node, NodeSettings};

use std::net::{SocketAddr, UdpSocket};

/// Guess our externally visible IPv4 address.
///
/// Opening a UDP socket toward a public resolver selects the interface the
/// kernel would route through; no packet is sent.
pub fn guess_external_ip() -> Option<std::net::IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:53").ok()?;
    socket.local_addr().ok().map(|addr: SocketAddr| addr.ip())
}

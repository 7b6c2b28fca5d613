//! Payloads of the reused host-chain commands
//!
//! Version handshake, address exchange, inventories, header requests and
//! responses, ping liveness and rejects. Layouts follow the host chain's
//! wire formats so the overlay can ride its gossip topology unmodified.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use crate::chain::LiteHeader;
use crate::error::Error;
use crate::wire::{Reader, Writer};
use crate::Hash;

/// Service bit for plain network nodes
pub const SERVICE_NODE_NETWORK: u64 = 1;

/// Bit index claimed for the pin overlay capability
pub const PIN_SERVICE_BIT: u32 = 7;

/// Service mask for the pin overlay capability
pub const SERVICE_PIN: u64 = 1 << PIN_SERVICE_BIT;

/// First protocol version carrying ping nonces (BIP 31)
pub const VERSION_BIP31: u32 = 60001;

/// First protocol version handling reject messages (BIP 61)
pub const VERSION_BIP61: u32 = 70002;

/// Highest protocol version we speak
pub const PROTOCOL_MAXIMUM: u32 = 70013;

/// Lowest protocol version we accept
pub const PROTOCOL_MINIMUM: u32 = 31402;

/// Cap on headers per `headers` message, and on locator walks
pub const MAX_GET_HEADERS: usize = 2000;

/// A peer address with advertised services
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetAddress {
    /// Last-seen time; zero inside version messages
    pub timestamp: u32,
    pub services: u64,
    /// IPv6, with IPv4 mapped into ::ffff:0:0/96
    pub ip: [u8; 16],
    pub port: u16,
}

impl NetAddress {
    pub fn new(addr: SocketAddr, services: u64, timestamp: u32) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            IpAddr::V6(v6) => v6.octets(),
        };
        Self {
            timestamp,
            services,
            ip,
            port: addr.port(),
        }
    }

    /// An unroutable placeholder
    pub fn unspecified() -> Self {
        Self {
            timestamp: 0,
            services: 0,
            ip: [0u8; 16],
            port: 0,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        let v6 = Ipv6Addr::from(self.ip);
        match v6.to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), self.port),
            None => SocketAddr::new(IpAddr::V6(v6), self.port),
        }
    }

    /// Same endpoint: port and ip match
    pub fn same_endpoint(&self, other: &NetAddress) -> bool {
        self.port == other.port && self.ip == other.ip
    }

    /// True when every bit in `services` is advertised
    pub fn has_services(&self, services: u64) -> bool {
        self.services & services == services
    }

    pub fn is_valid(&self) -> bool {
        self.port != 0 && self.ip != [0u8; 16]
    }

    pub(crate) fn write(&self, writer: &mut Writer, with_timestamp: bool) {
        if with_timestamp {
            writer.write_u32(self.timestamp);
        }
        writer.write_u64(self.services);
        writer.write_bytes(&self.ip);
        writer.write_u16_be(self.port);
    }

    pub(crate) fn read(reader: &mut Reader<'_>, with_timestamp: bool) -> Result<Self, Error> {
        let timestamp = if with_timestamp { reader.read_u32()? } else { 0 };
        let services = reader.read_u64()?;
        let mut ip = [0u8; 16];
        ip.copy_from_slice(reader.read_bytes(16)?);
        let port = reader.read_u16_be()?;
        Ok(Self {
            timestamp,
            services,
            ip,
            port,
        })
    }
}

/// The `version` handshake payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: u32,
    pub services: u64,
    pub timestamp: u64,
    pub receiver: NetAddress,
    pub sender: NetAddress,
    /// Random per-node value; a match means we dialed ourselves
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: u32,
    pub relay: bool,
}

impl VersionMessage {
    /// True when the peer advertises the pin overlay capability
    pub fn has_pin_service(&self) -> bool {
        self.services & SERVICE_PIN == SERVICE_PIN
    }

    pub fn write(&self, writer: &mut Writer) {
        writer.write_u32(self.version);
        writer.write_u64(self.services);
        writer.write_u64(self.timestamp);
        self.receiver.write(writer, false);
        self.sender.write(writer, false);
        writer.write_u64(self.nonce);
        writer.write_var_string(&self.user_agent);
        writer.write_u32(self.start_height);
        writer.write_u8(self.relay as u8);
    }

    pub fn read(reader: &mut Reader<'_>) -> Result<Self, Error> {
        let version = reader.read_u32()?;
        let services = reader.read_u64()?;
        let timestamp = reader.read_u64()?;
        let receiver = NetAddress::read(reader, false)?;
        let sender = NetAddress::read(reader, false)?;
        let nonce = reader.read_u64()?;
        let user_agent = reader.read_var_string()?;
        let start_height = reader.read_u32()?;
        // Absent on pre-BIP37 peers.
        let relay = if reader.remaining() > 0 {
            reader.read_u8()? != 0
        } else {
            true
        };
        Ok(Self {
            version,
            services,
            timestamp,
            receiver,
            sender,
            nonce,
            user_agent,
            start_height,
            relay,
        })
    }
}

/// Inventory entry types we understand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvKind {
    Transaction = 1,
    Block = 2,
}

/// One `inv` entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvItem {
    pub kind: InvKind,
    pub hash: Hash,
}

impl InvItem {
    pub fn block(hash: Hash) -> Self {
        Self {
            kind: InvKind::Block,
            hash,
        }
    }

    pub(crate) fn write(&self, writer: &mut Writer) {
        writer.write_u32(self.kind as u32);
        writer.write_hash(&self.hash);
    }
}

/// Locator-based header request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetHeadersMessage {
    pub version: u32,
    /// Hashes the requester already holds, newest first
    pub start_hashes: Vec<Hash>,
    /// Walk target; null means "as far as you can"
    pub stop_hash: Hash,
}

impl GetHeadersMessage {
    pub fn new(start_hashes: Vec<Hash>, stop_hash: Hash) -> Self {
        Self {
            version: PROTOCOL_MAXIMUM,
            start_hashes,
            stop_hash,
        }
    }

    pub fn write(&self, writer: &mut Writer) {
        writer.write_u32(self.version);
        writer.write_varint(self.start_hashes.len() as u64);
        for hash in &self.start_hashes {
            writer.write_hash(hash);
        }
        writer.write_hash(&self.stop_hash);
    }

    pub fn read(reader: &mut Reader<'_>) -> Result<Self, Error> {
        let version = reader.read_u32()?;
        let count = reader.read_varint()? as usize;
        if count > MAX_GET_HEADERS {
            return Err(Error::BadStream);
        }
        let mut start_hashes = Vec::with_capacity(count);
        for _ in 0..count {
            start_hashes.push(reader.read_hash()?);
        }
        let stop_hash = reader.read_hash()?;
        Ok(Self {
            version,
            start_hashes,
            stop_hash,
        })
    }
}

/// Reject codes we may receive (we only log them)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectCode {
    Malformed = 0x01,
    Invalid = 0x10,
    Obsolete = 0x11,
    Duplicate = 0x12,
    NonStandard = 0x40,
    Dust = 0x41,
    InsufficientFee = 0x42,
    Checkpoint = 0x43,
}

impl RejectCode {
    fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(RejectCode::Malformed),
            0x10 => Some(RejectCode::Invalid),
            0x11 => Some(RejectCode::Obsolete),
            0x12 => Some(RejectCode::Duplicate),
            0x40 => Some(RejectCode::NonStandard),
            0x41 => Some(RejectCode::Dust),
            0x42 => Some(RejectCode::InsufficientFee),
            0x43 => Some(RejectCode::Checkpoint),
            _ => None,
        }
    }
}

/// The `reject` payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectMessage {
    pub message: String,
    pub code: RejectCode,
    pub reason: String,
    /// Hash of the rejected item for hash-carrying commands
    pub data: Option<Hash>,
}

impl RejectMessage {
    pub fn write(&self, writer: &mut Writer) {
        writer.write_var_string(&self.message);
        writer.write_u8(self.code as u8);
        writer.write_var_string(&self.reason);
        if let Some(hash) = &self.data {
            writer.write_hash(hash);
        }
    }

    pub fn read(reader: &mut Reader<'_>) -> Result<Self, Error> {
        let message = reader.read_var_string()?;
        let code = RejectCode::from_code(reader.read_u8()?).ok_or(Error::BadStream)?;
        let reason = reader.read_var_string()?;
        let data = if reader.remaining() >= 32 {
            Some(reader.read_hash()?)
        } else {
            None
        };
        Ok(Self {
            message,
            code,
            reason,
            data,
        })
    }
}

/// Write a `headers` element: 80 bytes plus the empty tx-count varint
pub fn write_headers_entry(header: &LiteHeader, writer: &mut Writer) {
    header.write(writer);
    writer.write_varint(0);
}

/// Read a `headers` element, discarding the tx-count varint
pub fn read_headers_entry(reader: &mut Reader<'_>) -> Result<LiteHeader, Error> {
    let header = LiteHeader::read(reader)?;
    let _tx_count = reader.read_varint()?;
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::sha256;

    #[test]
    fn test_net_address_roundtrip() {
        let addr: SocketAddr = "203.0.113.9:29333".parse().unwrap();
        let net = NetAddress::new(addr, SERVICE_NODE_NETWORK | SERVICE_PIN, 1700000000);

        let mut writer = Writer::new();
        net.write(&mut writer, true);
        let bytes = writer.into_bytes();
        assert_eq!(bytes.len(), 30);

        let mut reader = Reader::new(&bytes);
        let recovered = NetAddress::read(&mut reader, true).unwrap();
        assert_eq!(net, recovered);
        assert_eq!(recovered.socket_addr(), addr);
        assert!(recovered.has_services(SERVICE_PIN));
    }

    #[test]
    fn test_version_roundtrip() {
        let msg = VersionMessage {
            version: PROTOCOL_MAXIMUM,
            services: SERVICE_NODE_NETWORK | SERVICE_PIN,
            timestamp: 1700000000,
            receiver: NetAddress::unspecified(),
            sender: NetAddress::new("10.0.0.1:29333".parse().unwrap(), SERVICE_PIN, 0),
            nonce: 0xfeed_beef,
            user_agent: "/pinnet:0.1.0/".into(),
            start_height: 1341188,
            relay: true,
        };

        let mut writer = Writer::new();
        msg.write(&mut writer);
        let bytes = writer.into_bytes();
        let mut reader = Reader::new(&bytes);
        let recovered = VersionMessage::read(&mut reader).unwrap();
        assert_eq!(msg, recovered);
        assert!(recovered.has_pin_service());
    }

    #[test]
    fn test_version_without_relay_byte() {
        let msg = VersionMessage {
            version: 60000,
            services: SERVICE_NODE_NETWORK,
            timestamp: 0,
            receiver: NetAddress::unspecified(),
            sender: NetAddress::unspecified(),
            nonce: 1,
            user_agent: String::new(),
            start_height: 0,
            relay: true,
        };
        let mut writer = Writer::new();
        msg.write(&mut writer);
        let mut bytes = writer.into_bytes();
        bytes.pop();

        let mut reader = Reader::new(&bytes);
        let recovered = VersionMessage::read(&mut reader).unwrap();
        assert!(recovered.relay);
    }

    #[test]
    fn test_get_headers_roundtrip() {
        let msg = GetHeadersMessage::new(vec![sha256(b"tip a"), sha256(b"tip b")], Hash::zero());
        let mut writer = Writer::new();
        msg.write(&mut writer);
        let bytes = writer.into_bytes();
        let mut reader = Reader::new(&bytes);
        assert_eq!(GetHeadersMessage::read(&mut reader).unwrap(), msg);
    }

    #[test]
    fn test_reject_roundtrip() {
        let msg = RejectMessage {
            message: "object".into(),
            code: RejectCode::Invalid,
            reason: "insufficient work".into(),
            data: Some(sha256(b"pin")),
        };
        let mut writer = Writer::new();
        msg.write(&mut writer);
        let bytes = writer.into_bytes();
        let mut reader = Reader::new(&bytes);
        assert_eq!(RejectMessage::read(&mut reader).unwrap(), msg);
    }

    #[test]
    fn test_headers_entry_carries_empty_tx_count() {
        let header = LiteHeader::new(2, sha256(b"p"), sha256(b"m"), 10, 0x2000_ffff, 3);
        let mut writer = Writer::new();
        write_headers_entry(&header, &mut writer);
        let bytes = writer.into_bytes();
        assert_eq!(bytes.len(), 81);
        assert_eq!(bytes[80], 0);

        let mut reader = Reader::new(&bytes);
        assert_eq!(read_headers_entry(&mut reader).unwrap(), header);
    }
}

//! Wire messages and framing
//!
//! Every message rides in a 24-byte envelope: magic, a NUL-padded 12-byte
//! command, payload length and the first four bytes of the payload's
//! double-SHA-256. Commands we do not speak are skipped so the overlay can
//! coexist with whatever else the host network gossips.

pub mod multihash;
pub mod object;
pub mod payloads;
pub mod pow_certificate;

pub use multihash::Multihash;
pub use object::{ObjectPayload, OBJECT_COMMAND};
pub use payloads::{
    read_headers_entry, write_headers_entry, GetHeadersMessage, InvItem, InvKind, NetAddress,
    RejectCode, RejectMessage, VersionMessage, MAX_GET_HEADERS, PIN_SERVICE_BIT, PROTOCOL_MAXIMUM,
    PROTOCOL_MINIMUM, SERVICE_NODE_NETWORK, SERVICE_PIN, VERSION_BIP31, VERSION_BIP61,
};
pub use pow_certificate::{ChainTag, PowCertificate, PowKind, DEFAULT_POW_KIND};

use crate::chain::LiteHeader;
use crate::crypto::double_sha256;
use crate::error::Error;
use crate::wire::{Reader, Writer};

/// Network magic of the host chain (Litecoin mainnet)
pub const MAGIC_MAINNET: u32 = 0xDBB6_C0FB;

/// Network magic of the host chain's test network
pub const MAGIC_TESTNET: u32 = 0xFDD2_C8F1;

/// Envelope size: magic + command + length + checksum
pub const ENVELOPE_SIZE: usize = 24;

/// Upper bound on a single payload
pub const MAX_PAYLOAD_SIZE: usize = 4 * 1024 * 1024;

/// Every message the overlay sends or consumes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Version(VersionMessage),
    Verack,
    /// Nonce present from protocol 60001 on
    Ping(Option<u64>),
    Pong(u64),
    GetAddr,
    Addr(Vec<NetAddress>),
    Inv(Vec<InvItem>),
    GetHeaders(GetHeadersMessage),
    Headers(Vec<LiteHeader>),
    Reject(RejectMessage),
    Object(ObjectPayload),
}

impl Message {
    /// The envelope command string
    pub fn command(&self) -> &'static str {
        match self {
            Message::Version(_) => "version",
            Message::Verack => "verack",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::GetAddr => "getaddr",
            Message::Addr(_) => "addr",
            Message::Inv(_) => "inv",
            Message::GetHeaders(_) => "getheaders",
            Message::Headers(_) => "headers",
            Message::Reject(_) => "reject",
            Message::Object(_) => OBJECT_COMMAND,
        }
    }

    fn write_payload(&self, writer: &mut Writer) {
        match self {
            Message::Version(msg) => msg.write(writer),
            Message::Verack | Message::GetAddr => {}
            Message::Ping(nonce) => {
                if let Some(nonce) = nonce {
                    writer.write_u64(*nonce);
                }
            }
            Message::Pong(nonce) => writer.write_u64(*nonce),
            Message::Addr(addresses) => {
                writer.write_varint(addresses.len() as u64);
                for address in addresses {
                    address.write(writer, true);
                }
            }
            Message::Inv(items) => {
                writer.write_varint(items.len() as u64);
                for item in items {
                    item.write(writer);
                }
            }
            Message::GetHeaders(msg) => msg.write(writer),
            Message::Headers(headers) => {
                writer.write_varint(headers.len() as u64);
                for header in headers {
                    write_headers_entry(header, writer);
                }
            }
            Message::Reject(msg) => msg.write(writer),
            Message::Object(payload) => payload.write(writer),
        }
    }

    /// Decode a payload for a known command. Unknown commands yield `None`.
    pub fn decode_payload(command: &str, payload: &[u8]) -> Result<Option<Message>, Error> {
        let mut reader = Reader::new(payload);
        let message = match command {
            "version" => Message::Version(VersionMessage::read(&mut reader)?),
            "verack" => Message::Verack,
            "ping" => {
                if reader.remaining() >= 8 {
                    Message::Ping(Some(reader.read_u64()?))
                } else {
                    Message::Ping(None)
                }
            }
            "pong" => Message::Pong(reader.read_u64()?),
            "getaddr" => Message::GetAddr,
            "addr" => {
                let count = reader.read_varint()? as usize;
                if count > 1000 {
                    return Err(Error::BadStream);
                }
                let mut addresses = Vec::with_capacity(count);
                for _ in 0..count {
                    addresses.push(NetAddress::read(&mut reader, true)?);
                }
                Message::Addr(addresses)
            }
            "inv" => {
                let count = reader.read_varint()? as usize;
                if count > 50_000 {
                    return Err(Error::BadStream);
                }
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    let kind = match reader.read_u32()? {
                        1 => InvKind::Transaction,
                        2 => InvKind::Block,
                        // Entries we do not track still occupy list slots.
                        _ => {
                            reader.read_hash()?;
                            continue;
                        }
                    };
                    let hash = reader.read_hash()?;
                    items.push(InvItem { kind, hash });
                }
                Message::Inv(items)
            }
            "getheaders" => Message::GetHeaders(GetHeadersMessage::read(&mut reader)?),
            "headers" => {
                let count = reader.read_varint()? as usize;
                if count > MAX_GET_HEADERS {
                    return Err(Error::BadStream);
                }
                let mut headers = Vec::with_capacity(count);
                for _ in 0..count {
                    headers.push(read_headers_entry(&mut reader)?);
                }
                Message::Headers(headers)
            }
            "reject" => Message::Reject(RejectMessage::read(&mut reader)?),
            OBJECT_COMMAND => Message::Object(ObjectPayload::read(&mut reader)?),
            _ => return Ok(None),
        };
        Ok(Some(message))
    }

    /// Frame this message for the wire.
    pub fn to_wire(&self, magic: u32) -> Vec<u8> {
        let mut payload_writer = Writer::new();
        self.write_payload(&mut payload_writer);
        let payload = payload_writer.into_bytes();
        let checksum = payload_checksum(&payload);

        let mut writer = Writer::with_capacity(ENVELOPE_SIZE + payload.len());
        writer.write_u32(magic);

        let mut command = [0u8; 12];
        let name = self.command().as_bytes();
        command[..name.len()].copy_from_slice(name);
        writer.write_bytes(&command);

        writer.write_u32(payload.len() as u32);
        writer.write_u32(checksum);
        writer.write_bytes(&payload);
        writer.into_bytes()
    }
}

/// First four checksum bytes of a payload, as a little-endian u32
pub fn payload_checksum(payload: &[u8]) -> u32 {
    let digest = double_sha256(payload);
    u32::from_le_bytes([digest.0[0], digest.0[1], digest.0[2], digest.0[3]])
}

/// A parsed envelope header
#[derive(Debug, Clone, Copy)]
pub struct Envelope {
    pub magic: u32,
    pub command: [u8; 12],
    pub payload_length: usize,
    pub checksum: u32,
}

impl Envelope {
    /// Parse the 24 fixed bytes, validating magic and length bound.
    pub fn parse(bytes: &[u8; ENVELOPE_SIZE], expected_magic: u32) -> Result<Self, Error> {
        let mut reader = Reader::new(bytes);
        let magic = reader.read_u32()?;
        if magic != expected_magic {
            return Err(Error::BadStream);
        }
        let mut command = [0u8; 12];
        command.copy_from_slice(reader.read_bytes(12)?);
        let payload_length = reader.read_u32()? as usize;
        if payload_length > MAX_PAYLOAD_SIZE {
            return Err(Error::BadStream);
        }
        let checksum = reader.read_u32()?;
        Ok(Self {
            magic,
            command,
            payload_length,
            checksum,
        })
    }

    /// The command as a string, NUL padding stripped
    pub fn command_str(&self) -> &str {
        let end = self
            .command
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.command.len());
        std::str::from_utf8(&self.command[..end]).unwrap_or("")
    }

    /// Validate a received payload against the envelope checksum.
    pub fn verify_payload(&self, payload: &[u8]) -> Result<(), Error> {
        if payload.len() != self.payload_length || payload_checksum(payload) != self.checksum {
            return Err(Error::BadStream);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::sha256;

    fn roundtrip(message: Message) {
        let wire = message.to_wire(MAGIC_MAINNET);
        let mut envelope_bytes = [0u8; ENVELOPE_SIZE];
        envelope_bytes.copy_from_slice(&wire[..ENVELOPE_SIZE]);
        let envelope = Envelope::parse(&envelope_bytes, MAGIC_MAINNET).unwrap();
        let payload = &wire[ENVELOPE_SIZE..];
        envelope.verify_payload(payload).unwrap();

        let decoded = Message::decode_payload(envelope.command_str(), payload)
            .unwrap()
            .unwrap();
        assert_eq!(message, decoded);
    }

    #[test]
    fn test_roundtrip_all_commands() {
        roundtrip(Message::Verack);
        roundtrip(Message::GetAddr);
        roundtrip(Message::Ping(Some(77)));
        roundtrip(Message::Ping(None));
        roundtrip(Message::Pong(77));
        roundtrip(Message::Inv(vec![InvItem::block(sha256(b"tip"))]));
        roundtrip(Message::GetHeaders(GetHeadersMessage::new(
            vec![sha256(b"tip")],
            crate::Hash::zero(),
        )));
        roundtrip(Message::Headers(vec![LiteHeader::new(
            2,
            sha256(b"p"),
            sha256(b"m"),
            99,
            0x2000_ffff,
            1,
        )]));
        roundtrip(Message::Addr(vec![NetAddress::new(
            "198.51.100.7:29333".parse().unwrap(),
            SERVICE_PIN,
            12345,
        )]));

        let mut payload = ObjectPayload::from_body(b"pinned".to_vec());
        payload.set_pow(crate::message::PowCertificate::new(
            crate::message::PowKind::Scrypt14_1_8,
            crate::message::ChainTag::LitecoinMain,
            sha256(b"anchor"),
            5,
        ));
        roundtrip(Message::Object(payload));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let wire = Message::Verack.to_wire(MAGIC_MAINNET);
        let mut envelope_bytes = [0u8; ENVELOPE_SIZE];
        envelope_bytes.copy_from_slice(&wire[..ENVELOPE_SIZE]);
        assert!(Envelope::parse(&envelope_bytes, MAGIC_TESTNET).is_err());
    }

    #[test]
    fn test_corrupt_checksum_rejected() {
        let mut wire = Message::Ping(Some(1)).to_wire(MAGIC_MAINNET);
        let last = wire.len() - 1;
        wire[last] ^= 0xff;

        let mut envelope_bytes = [0u8; ENVELOPE_SIZE];
        envelope_bytes.copy_from_slice(&wire[..ENVELOPE_SIZE]);
        let envelope = Envelope::parse(&envelope_bytes, MAGIC_MAINNET).unwrap();
        assert!(envelope.verify_payload(&wire[ENVELOPE_SIZE..]).is_err());
    }

    #[test]
    fn test_inv_skips_unknown_kinds() {
        let mut writer = Writer::new();
        writer.write_varint(2);
        writer.write_u32(9);
        writer.write_hash(&sha256(b"ignored"));
        writer.write_u32(2);
        writer.write_hash(&sha256(b"block"));
        let payload = writer.into_bytes();

        let decoded = Message::decode_payload("inv", &payload).unwrap().unwrap();
        assert_eq!(decoded, Message::Inv(vec![InvItem::block(sha256(b"block"))]));
    }

    #[test]
    fn test_unknown_command_skipped() {
        assert!(Message::decode_payload("sendheaders", &[])
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_command_padding() {
        let wire = Message::Verack.to_wire(MAGIC_MAINNET);
        assert_eq!(&wire[4..10], b"verack");
        assert!(wire[10..16].iter().all(|&b| b == 0));
    }
}

//! Proof-of-work certificates
//!
//! A certificate binds a pin to a recent block header of the host chain
//! (the "anchor") and carries the nonce that satisfied the pin PoW. Wire
//! form: `varint(kind) | varint(tag) | anchor(32) | nonce(8 LE)`.

use primitive_types::U256;

use crate::crypto::{scrypt_16384_8_1, to_u256, Hash};
use crate::error::Error;
use crate::wire::{varint_size, Reader, Writer};

/// PoW algorithm identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowKind {
    /// No PoW
    Plain = 0,
    /// scrypt with N=2^14, r=8, p=1 (the recommended parameters)
    Scrypt14_1_8 = 1,
    /// scrypt with N=2^10, r=1, p=1 (the host chain's header parameters)
    Scrypt10_1_1 = 2,
}

impl PowKind {
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(PowKind::Plain),
            1 => Some(PowKind::Scrypt14_1_8),
            2 => Some(PowKind::Scrypt10_1_1),
            _ => None,
        }
    }

    /// Lifetime bought per unit of work per byte, for this algorithm
    pub fn pow_mul(self) -> u32 {
        match self {
            PowKind::Plain => 1,
            PowKind::Scrypt14_1_8 => 30,
            PowKind::Scrypt10_1_1 => 10,
        }
    }
}

/// The PoW kind every admitted pin must carry
pub const DEFAULT_POW_KIND: PowKind = PowKind::Scrypt14_1_8;

/// Host chain identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainTag {
    Unknown = 0,
    BitcoinMain = 1,
    BitcoinTest3 = 2,
    LitecoinMain = 10,
    LitecoinTest4 = 11,
}

impl ChainTag {
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(ChainTag::Unknown),
            1 => Some(ChainTag::BitcoinMain),
            2 => Some(ChainTag::BitcoinTest3),
            10 => Some(ChainTag::LitecoinMain),
            11 => Some(ChainTag::LitecoinTest4),
            _ => None,
        }
    }
}

/// PoW certificate carried by every pin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PowCertificate {
    kind: PowKind,
    tag: ChainTag,
    anchor: Hash,
    nonce: u64,
}

impl Default for PowCertificate {
    fn default() -> Self {
        Self {
            kind: PowKind::Plain,
            tag: ChainTag::Unknown,
            anchor: Hash::zero(),
            nonce: 0,
        }
    }
}

impl PowCertificate {
    pub fn new(kind: PowKind, tag: ChainTag, anchor: Hash, nonce: u64) -> Self {
        Self {
            kind,
            tag,
            anchor,
            nonce,
        }
    }

    pub fn kind(&self) -> PowKind {
        self.kind
    }

    pub fn tag(&self) -> ChainTag {
        self.tag
    }

    pub fn anchor(&self) -> Hash {
        self.anchor
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn set_kind(&mut self, kind: PowKind) {
        self.kind = kind;
    }

    pub fn set_tag(&mut self, tag: ChainTag) {
        self.tag = tag;
    }

    pub fn set_anchor(&mut self, anchor: Hash) {
        self.anchor = anchor;
    }

    pub fn set_nonce(&mut self, nonce: u64) {
        self.nonce = nonce;
    }

    /// A certificate is valid once it points at a real anchor
    pub fn is_valid(&self) -> bool {
        !self.anchor.is_zero()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn serialized_size(&self) -> usize {
        varint_size(self.kind as u64) + varint_size(self.tag as u64) + 32 + 8
    }

    pub fn write(&self, writer: &mut Writer) {
        writer.write_varint(self.kind as u64);
        writer.write_varint(self.tag as u64);
        writer.write_hash(&self.anchor);
        writer.write_u64(self.nonce);
    }

    pub fn read(reader: &mut Reader<'_>) -> Result<Self, Error> {
        let kind = PowKind::from_code(reader.read_varint()?).ok_or(Error::BadStream)?;
        let tag = ChainTag::from_code(reader.read_varint()?).ok_or(Error::BadStream)?;
        let anchor = reader.read_hash()?;
        let nonce = reader.read_u64()?;
        Ok(Self {
            kind,
            tag,
            anchor,
            nonce,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut writer = Writer::with_capacity(self.serialized_size());
        self.write(&mut writer);
        writer.into_bytes()
    }

    /// The preimage the pin PoW grinds over: `prefix || certificate`
    pub fn pow_blob(&self, prefix: &[u8]) -> Vec<u8> {
        let mut writer = Writer::with_capacity(prefix.len() + self.serialized_size());
        writer.write_bytes(prefix);
        self.write(&mut writer);
        writer.into_bytes()
    }

    /// PoW digest over `prefix || certificate` under the default algorithm
    pub fn pow_hash(&self, prefix: &[u8]) -> Hash {
        scrypt_16384_8_1(&self.pow_blob(prefix))
    }

    /// PoW digest as an integer, most significant byte first
    pub fn pow_value(&self, prefix: &[u8]) -> U256 {
        to_u256(&self.pow_hash(prefix))
    }
}

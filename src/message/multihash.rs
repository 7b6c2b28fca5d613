//! Self-describing digests
//!
//! A multihash is `varint(fn_code) | varint(len) | digest`, with function
//! codes from the IANA multihash table. Pins use it to name their body so
//! a body can be advertised by digest alone.

use crate::error::Error;
use crate::wire::{varint_size, Reader, Writer};

/// Identity "digest" (raw bytes)
pub const FN_IDENTITY: u32 = 0x00;
/// SHA-1
pub const FN_SHA1: u32 = 0x11;
/// SHA2-256, the code every pin body id uses
pub const FN_SHA2_256: u32 = 0x12;
/// SHA2-512
pub const FN_SHA2_512: u32 = 0x13;
/// SHA3-256
pub const FN_SHA3_256: u32 = 0x16;
/// Double SHA2-256
pub const FN_DBL_SHA2_256: u32 = 0x56;
/// MD5
pub const FN_MD5: u32 = 0xd5;

/// First code past the table; anything at or above it is invalid
pub const FN_CODE_LIMIT: u32 = 0xd6;

/// A self-describing digest
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Multihash {
    fn_code: u32,
    digest: Vec<u8>,
}

impl Multihash {
    pub fn new(fn_code: u32, digest: Vec<u8>) -> Self {
        Self { fn_code, digest }
    }

    /// Wrap a SHA2-256 digest
    pub fn sha2_256(digest: [u8; 32]) -> Self {
        Self::new(FN_SHA2_256, digest.to_vec())
    }

    pub fn fn_code(&self) -> u32 {
        self.fn_code
    }

    pub fn digest(&self) -> &[u8] {
        &self.digest
    }

    /// True when no digest bytes are present
    pub fn is_empty(&self) -> bool {
        self.digest.is_empty()
    }

    pub fn is_valid(&self) -> bool {
        self.fn_code < FN_CODE_LIMIT
    }

    pub fn reset(&mut self) {
        self.fn_code = FN_IDENTITY;
        self.digest.clear();
    }

    pub fn serialized_size(&self) -> usize {
        varint_size(self.fn_code as u64) + varint_size(self.digest.len() as u64) + self.digest.len()
    }

    pub fn write(&self, writer: &mut Writer) {
        writer.write_varint(self.fn_code as u64);
        writer.write_var_bytes(&self.digest);
    }

    pub fn read(reader: &mut Reader<'_>) -> Result<Self, Error> {
        let fn_code = reader.read_varint()?;
        if fn_code > u32::MAX as u64 {
            return Err(Error::BadStream);
        }
        let digest = reader.read_var_bytes()?;
        Ok(Self {
            fn_code: fn_code as u32,
            digest,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut writer = Writer::with_capacity(self.serialized_size());
        self.write(&mut writer);
        writer.into_bytes()
    }

    /// Base58 rendering of the wire form, the usual way a body id is shown
    pub fn to_base58(&self) -> String {
        bs58::encode(self.to_bytes()).into_string()
    }
}

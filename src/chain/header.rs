//! Lightweight block headers
//!
//! The overlay never sees transactions; it tracks the host chain through
//! bare 80-byte headers. The wire form is the host chain's exact layout.
//! The internal form appends four bytes of median-time-past annotation.

use parking_lot::{RwLock, RwLockUpgradableReadGuard};

use crate::crypto::{
    compact_to_target, double_sha256, pow_limit, scrypt_1024_1_1, to_u256, Hash,
};
use crate::error::Error;
use crate::wire::{Reader, Writer};

/// Wire size of a header: 4 + 32 + 32 + 4 + 4 + 4
pub const HEADER_WIRE_SIZE: usize = 80;

/// Headers may run at most this far ahead of wall clock (two hours)
pub const TIMESTAMP_FUTURE_SECONDS: u32 = 2 * 60 * 60;

#[derive(Default)]
struct HeaderCache {
    hash: Option<Hash>,
    pow_hash: Option<Hash>,
}

/// Chain-state inputs for contextual header acceptance
#[derive(Debug, Clone, Default)]
pub struct AcceptState {
    /// Compact bits the retarget schedule requires at this height
    pub work_required: u32,
    /// Hash a checkpoint pins at this height, if any
    pub checkpoint: Option<Hash>,
    /// True while below the last checkpoint (contextual rules waived)
    pub under_checkpoint: bool,
    /// Minimum header version at this height
    pub minimum_version: u32,
    /// Median of the previous timestamp window
    pub median_time_past: u32,
}

/// An 80-byte block header plus non-serialized chain annotations
pub struct LiteHeader {
    version: u32,
    prev: Hash,
    merkle_root: Hash,
    timestamp: u32,
    bits: u32,
    nonce: u32,

    /// Height in the host chain; assigned when the header joins the tracker
    pub height: usize,
    /// Median time past annotation, carried only by the internal form
    pub median_time_past: u32,

    cache: RwLock<HeaderCache>,
}

impl Clone for LiteHeader {
    fn clone(&self) -> Self {
        let cache = self.cache.read();
        Self {
            version: self.version,
            prev: self.prev,
            merkle_root: self.merkle_root,
            timestamp: self.timestamp,
            bits: self.bits,
            nonce: self.nonce,
            height: self.height,
            median_time_past: self.median_time_past,
            cache: RwLock::new(HeaderCache {
                hash: cache.hash,
                pow_hash: cache.pow_hash,
            }),
        }
    }
}

impl PartialEq for LiteHeader {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version
            && self.prev == other.prev
            && self.merkle_root == other.merkle_root
            && self.timestamp == other.timestamp
            && self.bits == other.bits
            && self.nonce == other.nonce
    }
}

impl Eq for LiteHeader {}

impl std::fmt::Debug for LiteHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiteHeader")
            .field("hash", &self.hash())
            .field("prev", &self.prev)
            .field("height", &self.height)
            .field("timestamp", &self.timestamp)
            .field("bits", &format_args!("{:#010x}", self.bits))
            .finish()
    }
}

impl Default for LiteHeader {
    fn default() -> Self {
        Self::new(0, Hash::zero(), Hash::zero(), 0, 0, 0)
    }
}

impl LiteHeader {
    pub fn new(
        version: u32,
        prev: Hash,
        merkle_root: Hash,
        timestamp: u32,
        bits: u32,
        nonce: u32,
    ) -> Self {
        Self {
            version,
            prev,
            merkle_root,
            timestamp,
            bits,
            nonce,
            height: 0,
            median_time_past: 0,
            cache: RwLock::new(HeaderCache::default()),
        }
    }

    // Accessors. Every mutator invalidates the digest cache under the
    // cache's own lock.

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn set_version(&mut self, value: u32) {
        self.version = value;
        self.invalidate_cache();
    }

    pub fn prev(&self) -> Hash {
        self.prev
    }

    pub fn set_prev(&mut self, value: Hash) {
        self.prev = value;
        self.invalidate_cache();
    }

    pub fn merkle_root(&self) -> Hash {
        self.merkle_root
    }

    pub fn set_merkle_root(&mut self, value: Hash) {
        self.merkle_root = value;
        self.invalidate_cache();
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn set_timestamp(&mut self, value: u32) {
        self.timestamp = value;
        self.invalidate_cache();
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn set_bits(&mut self, value: u32) {
        self.bits = value;
        self.invalidate_cache();
    }

    pub fn nonce(&self) -> u32 {
        self.nonce
    }

    pub fn set_nonce(&mut self, value: u32) {
        self.nonce = value;
        self.invalidate_cache();
    }

    fn invalidate_cache(&self) {
        let cache = self.cache.upgradable_read();
        if cache.hash.is_some() || cache.pow_hash.is_some() {
            let mut cache = RwLockUpgradableReadGuard::upgrade(cache);
            cache.hash = None;
            cache.pow_hash = None;
        }
    }

    /// Identity hash: double-SHA-256 of the wire form. Cached.
    pub fn hash(&self) -> Hash {
        let cache = self.cache.upgradable_read();
        if let Some(hash) = cache.hash {
            return hash;
        }
        let hash = double_sha256(&self.to_bytes());
        let mut cache = RwLockUpgradableReadGuard::upgrade(cache);
        cache.hash = Some(hash);
        hash
    }

    /// PoW hash: scrypt(1024,1,1) of the wire form salted with itself. Cached.
    pub fn pow_hash(&self) -> Hash {
        let cache = self.cache.upgradable_read();
        if let Some(hash) = cache.pow_hash {
            return hash;
        }
        let data = self.to_bytes();
        let hash = scrypt_1024_1_1(&data);
        let mut cache = RwLockUpgradableReadGuard::upgrade(cache);
        cache.pow_hash = Some(hash);
        hash
    }

    /// Serialize the 80-byte wire form
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut writer = Writer::with_capacity(HEADER_WIRE_SIZE);
        self.write(&mut writer);
        writer.into_bytes()
    }

    /// Serialize the internal form: wire form plus median-time-past
    pub fn to_bytes_internal(&self) -> Vec<u8> {
        let mut writer = Writer::with_capacity(HEADER_WIRE_SIZE + 4);
        self.write(&mut writer);
        writer.write_u32(self.median_time_past);
        writer.into_bytes()
    }

    pub fn write(&self, writer: &mut Writer) {
        writer.write_u32(self.version);
        writer.write_hash(&self.prev);
        writer.write_hash(&self.merkle_root);
        writer.write_u32(self.timestamp);
        writer.write_u32(self.bits);
        writer.write_u32(self.nonce);
    }

    pub fn read(reader: &mut Reader<'_>) -> Result<Self, Error> {
        let version = reader.read_u32()?;
        let prev = reader.read_hash()?;
        let merkle_root = reader.read_hash()?;
        let timestamp = reader.read_u32()?;
        let bits = reader.read_u32()?;
        let nonce = reader.read_u32()?;
        Ok(Self::new(version, prev, merkle_root, timestamp, bits, nonce))
    }

    /// Parse the internal form produced by `to_bytes_internal`
    pub fn read_internal(reader: &mut Reader<'_>) -> Result<Self, Error> {
        let mut header = Self::read(reader)?;
        header.median_time_past = reader.read_u32()?;
        Ok(header)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, Error> {
        let mut reader = Reader::new(data);
        Self::read(&mut reader)
    }

    /// True unless every field is at its default
    pub fn is_valid(&self) -> bool {
        self.version != 0
            || !self.prev.is_zero()
            || !self.merkle_root.is_zero()
            || self.timestamp != 0
            || self.bits != 0
            || self.nonce != 0
    }

    /// Timestamp no further than two hours past `now`
    pub fn is_valid_timestamp_at(&self, now: u32) -> bool {
        self.timestamp <= now.saturating_add(TIMESTAMP_FUTURE_SECONDS)
    }

    pub fn is_valid_timestamp(&self) -> bool {
        self.is_valid_timestamp_at(unix_now())
    }

    /// Compact target decodes into `[1, pow_limit]` and the PoW digest,
    /// read most-significant-byte first, does not exceed it.
    pub fn is_valid_proof_of_work(&self, retarget: bool) -> bool {
        let target = match compact_to_target(self.bits) {
            Some(target) => target,
            None => return false,
        };

        if target > pow_limit(retarget) {
            return false;
        }

        to_u256(&self.pow_hash()) <= target
    }

    /// Context-free checks, in error precedence order.
    pub fn check_at(&self, retarget: bool, now: u32) -> Result<(), Error> {
        if !self.is_valid_proof_of_work(retarget) {
            Err(Error::InvalidProofOfWork)
        } else if !self.is_valid_timestamp_at(now) {
            Err(Error::FuturisticTimestamp)
        } else {
            Ok(())
        }
    }

    pub fn check(&self, retarget: bool) -> Result<(), Error> {
        self.check_at(retarget, unix_now())
    }

    /// Contextual checks against the chain state at this height.
    pub fn accept(&self, state: &AcceptState) -> Result<(), Error> {
        if self.bits != state.work_required {
            return Err(Error::IncorrectProofOfWork);
        }

        if let Some(pinned) = state.checkpoint {
            if pinned != self.hash() {
                return Err(Error::CheckpointsFailed);
            }
        }

        if state.under_checkpoint {
            return Ok(());
        }

        if self.version < state.minimum_version {
            return Err(Error::OldVersionBlock);
        }

        if self.timestamp <= state.median_time_past {
            return Err(Error::TimestampTooEarly);
        }

        Ok(())
    }
}

/// Wall clock as 32-bit unix seconds
pub fn unix_now() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

//! Pin payloads
//!
//! A pin ("object" on the wire) is a body, the body's multihash id, and a
//! PoW certificate. The body id is only serialized when the body itself is
//! absent, so a node holding the body can advertise the pin by id alone.

use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use primitive_types::U256;

use crate::crypto::{sha256, work_from_value, Hash};
use crate::error::Error;
use crate::message::multihash::Multihash;
use crate::message::pow_certificate::PowCertificate;
use crate::wire::{varint_size, Reader, Writer};

/// Command string for the wire wrapper
pub const OBJECT_COMMAND: &str = "object";

#[derive(Default)]
struct DerivedState {
    id: Option<Hash>,
    body_id: Option<Multihash>,
    pow_value: Option<U256>,
    work_done: Option<U256>,
}

/// A pin: body, body id, PoW certificate
pub struct ObjectPayload {
    body: Vec<u8>,
    body_id: Multihash,
    pow: PowCertificate,
    derived: RwLock<DerivedState>,
}

impl Default for ObjectPayload {
    fn default() -> Self {
        Self {
            body: Vec::new(),
            body_id: Multihash::default(),
            pow: PowCertificate::default(),
            derived: RwLock::new(DerivedState::default()),
        }
    }
}

impl Clone for ObjectPayload {
    fn clone(&self) -> Self {
        // Derived values are cheap to recompute; the clone starts cold.
        Self {
            body: self.body.clone(),
            body_id: self.body_id.clone(),
            pow: self.pow.clone(),
            derived: RwLock::new(DerivedState::default()),
        }
    }
}

impl PartialEq for ObjectPayload {
    fn eq(&self, other: &Self) -> bool {
        self.body == other.body && self.body_id == other.body_id && self.pow == other.pow
    }
}

impl Eq for ObjectPayload {}

impl std::fmt::Debug for ObjectPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectPayload")
            .field("body_len", &self.body.len())
            .field("body_id", &self.body_id)
            .field("pow", &self.pow)
            .finish()
    }
}

impl ObjectPayload {
    /// Build a pin around a body; the certificate is filled in by mining
    pub fn from_body(body: Vec<u8>) -> Self {
        Self {
            body,
            ..Self::default()
        }
    }

    /// Build a bodiless pin advertising its body by id alone
    pub fn from_body_id(body_id: Multihash) -> Self {
        Self {
            body_id,
            ..Self::default()
        }
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn pow(&self) -> &PowCertificate {
        &self.pow
    }

    pub fn anchor(&self) -> Hash {
        self.pow.anchor()
    }

    pub fn nonce(&self) -> u64 {
        self.pow.nonce()
    }

    /// Replace the certificate, dropping every derived value
    pub fn set_pow(&mut self, pow: PowCertificate) {
        self.pow = pow;
        self.invalidate();
    }

    /// Point the certificate at a new anchor, dropping PoW-derived values
    pub fn set_anchor(&mut self, anchor: Hash) {
        self.pow.set_anchor(anchor);
        self.invalidate();
    }

    /// Set the certificate nonce, dropping PoW-derived values
    pub fn set_nonce(&mut self, nonce: u64) {
        self.pow.set_nonce(nonce);
        self.invalidate();
    }

    fn invalidate(&self) {
        let derived = self.derived.upgradable_read();
        let mut derived = RwLockUpgradableReadGuard::upgrade(derived);
        derived.id = None;
        derived.pow_value = None;
        derived.work_done = None;
        // body_id depends only on the body, which never changes after
        // construction or parse.
    }

    /// A payload is valid when it names a body (inline or by id), the id is
    /// well-formed, and the certificate points at a real anchor.
    pub fn is_valid(&self) -> bool {
        (!self.body.is_empty() || !self.body_id.is_empty())
            && self.body_id.is_valid()
            && self.pow.is_valid()
    }

    pub fn reset(&mut self) {
        self.body.clear();
        self.body_id.reset();
        self.pow.reset();
        self.invalidate();
    }

    pub fn serialized_size(&self) -> usize {
        varint_size(self.body.len() as u64)
            + self.body.len()
            + if self.body.is_empty() {
                self.body_id.serialized_size()
            } else {
                0
            }
            + self.pow.serialized_size()
    }

    pub fn write(&self, writer: &mut Writer) {
        writer.write_varint(self.body.len() as u64);
        if self.body.is_empty() {
            self.body_id.write(writer);
        } else {
            writer.write_bytes(&self.body);
        }
        self.pow.write(writer);
    }

    pub fn read(reader: &mut Reader<'_>) -> Result<Self, Error> {
        let body_size = reader.read_varint()? as usize;
        let mut payload = Self::default();
        if body_size > 0 {
            payload.body = reader.read_bytes(body_size)?.to_vec();
        } else {
            payload.body_id = Multihash::read(reader)?;
        }
        payload.pow = PowCertificate::read(reader)?;
        Ok(payload)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut writer = Writer::with_capacity(self.serialized_size());
        self.write(&mut writer);
        writer.into_bytes()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, Error> {
        let mut reader = Reader::new(data);
        Self::read(&mut reader)
    }

    /// The gossip and de-duplication key: sha256 of the wire form
    pub fn get_id(&self) -> Hash {
        let derived = self.derived.upgradable_read();
        if let Some(id) = derived.id {
            return id;
        }
        let id = sha256(&self.to_bytes());
        let mut derived = RwLockUpgradableReadGuard::upgrade(derived);
        derived.id = Some(id);
        id
    }

    /// The body's multihash, computed from the body when not carried
    pub fn get_body_id(&self) -> Multihash {
        let derived = self.derived.upgradable_read();
        if let Some(body_id) = &derived.body_id {
            return body_id.clone();
        }
        let body_id = if self.body_id.is_empty() {
            Multihash::sha2_256(sha256(&self.body).0)
        } else {
            self.body_id.clone()
        };
        let mut derived = RwLockUpgradableReadGuard::upgrade(derived);
        derived.body_id = Some(body_id.clone());
        body_id
    }

    /// The PoW digest over `body_id || certificate`, as an integer
    pub fn get_pow_value(&self) -> U256 {
        let body_id_bytes = self.get_body_id().to_bytes();
        let derived = self.derived.upgradable_read();
        if let Some(value) = derived.pow_value {
            return value;
        }
        let value = self.pow.pow_value(&body_id_bytes);
        let mut derived = RwLockUpgradableReadGuard::upgrade(derived);
        derived.pow_value = Some(value);
        value
    }

    /// Expected hash tries the certificate's PoW represents
    pub fn get_work_done(&self) -> U256 {
        let pow_value = self.get_pow_value();
        let derived = self.derived.upgradable_read();
        if let Some(work) = derived.work_done {
            return work;
        }
        let work = work_from_value(pow_value);
        let mut derived = RwLockUpgradableReadGuard::upgrade(derived);
        derived.work_done = Some(work);
        work
    }
}

//! Digests used by the pinnet overlay
//!
//! Headers hash with double-SHA-256 and prove work with scrypt(1024,1,1);
//! pins prove work with scrypt(16384,8,1). Hex strings follow the block
//! explorer convention: most significant byte first, i.e. the reverse of
//! the in-memory digest order.

use std::fmt;

use scrypt::Params;
use sha2::{Digest, Sha256};

/// 32-byte digest
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    /// The all-zero sentinel ("null hash")
    pub const fn zero() -> Self {
        Hash([0u8; 32])
    }

    /// True when this is the null sentinel
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Wrap raw digest bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Hash(bytes)
    }

    /// Parse a display-order hex string (most significant byte first)
    pub fn from_hex(hex_str: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(hex_str)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        for (i, b) in bytes.iter().rev().enumerate() {
            arr[i] = *b;
        }
        Ok(Hash(arr))
    }

    /// Render in display order (most significant byte first)
    pub fn to_hex(&self) -> String {
        let mut reversed = self.0;
        reversed.reverse();
        hex::encode(reversed)
    }

    /// Raw digest bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_hex())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Default for Hash {
    fn default() -> Self {
        Self::zero()
    }
}

/// SHA-256 of arbitrary bytes
pub fn sha256(data: &[u8]) -> Hash {
    let digest = Sha256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    Hash(out)
}

/// SHA-256 applied twice, the header hash function
pub fn double_sha256(data: &[u8]) -> Hash {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    Hash(out)
}

fn scrypt_32(data: &[u8], log_n: u8, r: u32, p: u32) -> Hash {
    // Parameters are compile-time constants; Params::new only rejects
    // out-of-range tuples.
    let params = Params::new(log_n, r, p, 32).expect("scrypt parameters");
    let mut out = [0u8; 32];
    scrypt::scrypt(data, data, &params, &mut out).expect("scrypt output length");
    Hash(out)
}

/// Header PoW: scrypt with N=1024, r=1, p=1, the header as its own salt
pub fn scrypt_1024_1_1(data: &[u8]) -> Hash {
    scrypt_32(data, 10, 1, 1)
}

/// Pin PoW: scrypt with N=16384, r=8, p=1, the blob as its own salt
pub fn scrypt_16384_8_1(data: &[u8]) -> Hash {
    scrypt_32(data, 14, 8, 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_deterministic() {
        assert_eq!(sha256(b"hello"), sha256(b"hello"));
        assert_ne!(sha256(b"hello"), sha256(b"world"));
    }

    #[test]
    fn test_double_sha256_differs_from_single() {
        let data = b"pin body";
        assert_ne!(sha256(data), double_sha256(data));
        assert_eq!(double_sha256(data), sha256(sha256(data).as_bytes()));
    }

    #[test]
    fn test_hex_roundtrip_reverses() {
        let h = sha256(b"test");
        let recovered = Hash::from_hex(&h.to_hex()).unwrap();
        assert_eq!(h, recovered);

        // Display order is the byte reverse of storage order.
        let hex_str = h.to_hex();
        let first_display_byte = u8::from_str_radix(&hex_str[0..2], 16).unwrap();
        assert_eq!(first_display_byte, h.0[31]);
    }

    #[test]
    fn test_from_hex_rejects_bad_length() {
        assert!(Hash::from_hex("abcd").is_err());
    }

    #[test]
    fn test_zero_sentinel() {
        assert!(Hash::zero().is_zero());
        assert!(!sha256(b"x").is_zero());
    }

    #[test]
    fn test_scrypt_parameter_sets_disagree() {
        let data = b"salt is self";
        assert_ne!(scrypt_1024_1_1(data), scrypt_16384_8_1(data));
        assert_eq!(scrypt_1024_1_1(data), scrypt_1024_1_1(data));
    }
}

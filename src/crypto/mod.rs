//! Hashing and difficulty primitives

pub mod compact;
pub mod hash;

pub use compact::{
    compact_to_target, pow_limit, target_to_compact, to_u256, work_from_value,
    NO_RETARGET_POW_LIMIT, RETARGET_POW_LIMIT,
};
pub use hash::{double_sha256, scrypt_1024_1_1, scrypt_16384_8_1, sha256, Hash};

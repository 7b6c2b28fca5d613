//! Pinnet core library
//!
//! A peer-to-peer overlay for broadcasting short authenticated messages
//! ("pins") whose storage lifetime is bought by proof-of-work anchored to
//! a recent block header of the host chain. The node rides the host
//! chain's gossip topology: it tracks bare headers, admits pins whose PoW
//! buys enough seconds relative to their size, and re-broadcasts them to
//! every peer advertising the pin service bit.

pub mod chain;
pub mod crypto;
pub mod error;
pub mod message;
pub mod mining;
pub mod net;
pub mod pinboard;
pub mod sync;
pub mod wire;

pub use crypto::Hash;
pub use error::Error;

/// Protocol constants
pub mod constants {
    use primitive_types::U256;

    /// Inbound port of the pin overlay (mainnet)
    pub const INBOUND_PORT: u16 = 29333;

    /// Inbound port of the pin overlay (testnet)
    pub const INBOUND_PORT_TESTNET: u16 = 19335;

    /// User agent advertised in version messages
    pub const USER_AGENT: &str = "/pinnet:0.1.0/";

    /// DNS seeds of the host network, used for initial peer discovery
    pub const SEEDS: &[&str] = &[
        "seed-a.litecoin.loshan.co.uk:9333",
        "dnsseed.thrasher.io:9333",
        "dnsseed.litecointools.com:9333",
        "dnsseed.litecoinpool.org:9333",
    ];

    /// Upper bound on an admissible pin PoW value. Roughly 2^20 expected
    /// scrypt tries; anything weaker is spam.
    pub fn min_target() -> U256 {
        U256::MAX >> 20
    }
}

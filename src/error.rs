//! Error codes shared across the node
//!
//! One flat set of codes, because the same kinds cross the codec, chain,
//! store and network boundaries (a malformed object is `BadStream` whether
//! it came off the wire or out of a test vector).

use thiserror::Error;

/// Errors raised by the pinnet core
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed bytes in a codec or during pin admission
    #[error("bad stream")]
    BadStream,

    /// PoW below claimed target, claimed below the minimum, or wrong PoW kind
    #[error("invalid proof of work")]
    InvalidProofOfWork,

    /// Header bits disagree with the chain-state retarget
    #[error("incorrect proof of work")]
    IncorrectProofOfWork,

    /// Header timestamp more than two hours in the future
    #[error("futuristic timestamp")]
    FuturisticTimestamp,

    /// Header timestamp at or below the median time past
    #[error("timestamp too early")]
    TimestampTooEarly,

    /// A header batch was rejected during merge
    #[error("invalid previous block")]
    InvalidPreviousBlock,

    /// Header conflicts with a hard-coded checkpoint
    #[error("checkpoints failed")]
    CheckpointsFailed,

    /// Header version below the minimum for its height
    #[error("old version block")]
    OldVersionBlock,

    /// A required antecedent is missing; recoverable
    #[error("unknown antecedent")]
    Unknown,

    /// The node is shutting down
    #[error("service stopped")]
    ServiceStopped,

    /// The channel is shutting down
    #[error("channel stopped")]
    ChannelStopped,

    /// Outbound dial to an address we already occupy
    #[error("address in use")]
    AddressInUse,

    /// Transport-level failure on a peer link
    #[error("network: {0}")]
    Network(#[from] std::io::Error),
}

impl Error {
    /// True for the codes that warrant disconnecting the sending peer.
    pub fn is_peer_fatal(&self) -> bool {
        matches!(self, Error::BadStream | Error::InvalidProofOfWork)
    }
}

//! Host-chain tracking: headers, checkpoint, concurrent index

pub mod checkpoint;
pub mod header;
pub mod tracker;

pub use checkpoint::{last_checkpoint, CHECKPOINT_HASH, CHECKPOINT_HEIGHT};
pub use header::{unix_now, AcceptState, LiteHeader, HEADER_WIRE_SIZE, TIMESTAMP_FUTURE_SECONDS};
pub use tracker::{ChainTracker, SYNCHRONIZED_WINDOW_SECONDS};

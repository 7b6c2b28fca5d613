//! The trusted root of the in-memory chain
//!
//! A single hard-coded header from the host chain. Everything the tracker
//! learns hangs off it; nothing below it is kept. The hash assertion at
//! startup catches a miscompiled or tampered constant before the node
//! talks to anyone.

use crate::chain::LiteHeader;
use crate::error::Error;
use crate::Hash;

/// Height of the hard-coded checkpoint in the host chain
pub const CHECKPOINT_HEIGHT: usize = 1_341_188;

/// Display-order hash the checkpoint header must produce
pub const CHECKPOINT_HASH: &str =
    "2dd9a6d0d30ded8925c303b8228713e72c345e0e3aed488897643d6d35b9d6ee";

const CHECKPOINT_PREV: &str = "d0a2824855062497a4b03c89b06def42abcb45158c406713cf219e5b4055a426";
const CHECKPOINT_MERKLE: &str = "e97314257cbd625676411a9c295861256c3932bae95312a0672d99711daf40d1";

/// Build the checkpoint header and assert its identity.
pub fn last_checkpoint() -> Result<LiteHeader, Error> {
    let prev = Hash::from_hex(CHECKPOINT_PREV).map_err(|_| Error::BadStream)?;
    let merkle_root = Hash::from_hex(CHECKPOINT_MERKLE).map_err(|_| Error::BadStream)?;
    let expected = Hash::from_hex(CHECKPOINT_HASH).map_err(|_| Error::BadStream)?;

    let mut header = LiteHeader::new(
        536870912,
        prev,
        merkle_root,
        1514572031,
        0x1a04_865f,
        2046883480,
    );
    header.height = CHECKPOINT_HEIGHT;

    if header.hash() != expected {
        return Err(Error::CheckpointsFailed);
    }

    Ok(header)
}

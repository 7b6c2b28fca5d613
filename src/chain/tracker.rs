//! Concurrent index of the host chain's headers
//!
//! One map of every header ever merged plus a height-indexed vector of
//! hash sets, so competing forks at a height simply coexist as set
//! members. A single lock guards both; readers share, `merge` excludes.
//! Headers arriving before their parent wait in an orphan queue keyed by
//! the missing parent and are connected when it shows up.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::chain::header::unix_now;
use crate::chain::LiteHeader;
use crate::error::Error;
use crate::message::{InvItem, Message};
use crate::net::Broadcast;
use crate::Hash;

/// A header is "recent" when its timestamp falls inside this window
pub const SYNCHRONIZED_WINDOW_SECONDS: u32 = 600;

struct TrackerInner {
    /// Every header ever merged, by identity hash
    known: HashMap<Hash, LiteHeader>,
    /// Hashes per height, indexed by `height - starting_height`
    chain: Vec<BTreeSet<Hash>>,
    /// Headers whose parent has not arrived, keyed by that parent
    orphans: HashMap<Hash, Vec<LiteHeader>>,
}

/// Concurrent store of lightweight headers rooted at a checkpoint
pub struct ChainTracker {
    broadcaster: Arc<dyn Broadcast>,
    starting_height: usize,
    /// Retarget mode handed to header checks; the host chain retargets
    retarget: bool,
    inner: RwLock<TrackerInner>,
}

impl ChainTracker {
    /// Install the checkpoint as the only known header.
    pub fn new(broadcaster: Arc<dyn Broadcast>, checkpoint: LiteHeader) -> Self {
        Self::with_retarget(broadcaster, checkpoint, true)
    }

    /// As `new`, with an explicit retarget mode for permissive-PoW setups.
    pub fn with_retarget(
        broadcaster: Arc<dyn Broadcast>,
        checkpoint: LiteHeader,
        retarget: bool,
    ) -> Self {
        let starting_height = checkpoint.height;
        let mut chain = Vec::new();
        let mut tip = BTreeSet::new();
        tip.insert(checkpoint.hash());
        chain.push(tip);

        let mut known = HashMap::new();
        known.insert(checkpoint.hash(), checkpoint);

        info!("chain tracker rooted at height {}", starting_height);

        Self {
            broadcaster,
            starting_height,
            retarget,
            inner: RwLock::new(TrackerInner {
                known,
                chain,
                orphans: HashMap::new(),
            }),
        }
    }

    /// Height of the installed checkpoint
    pub fn starting_height(&self) -> usize {
        self.starting_height
    }

    /// Merge a batch of headers in list order.
    ///
    /// Each header is checked before any state changes; a failing header
    /// aborts the batch with its check error and the remainder is not
    /// processed. If anything was merged, one block inventory for the last
    /// merged hash is fanned out to pin-capable peers.
    pub async fn merge(&self, headers: Vec<LiteHeader>) -> Result<(), Error> {
        let mut merged = 0usize;
        let mut last_merged = Hash::zero();

        for header in headers {
            header.check(self.retarget)?;

            let hash = header.hash();
            let mut inner = self.inner.write();

            if inner.known.contains_key(&hash) {
                debug!("header {} already known", hash);
                continue;
            }

            let parent_height = inner.known.get(&header.prev()).map(|parent| parent.height);
            match parent_height {
                None => {
                    // Parent not seen yet; park it until the parent merges.
                    let prev = header.prev();
                    debug!("orphan header {} waiting on {}", hash, prev);
                    inner.orphans.entry(prev).or_default().push(header);
                }
                Some(parent_height) => {
                    merged += Self::insert_at(
                        &mut inner,
                        header,
                        parent_height + 1,
                        self.starting_height,
                    );
                    last_merged = hash;
                }
            }
        }

        if merged > 0 {
            debug!("merged {} header(s), announcing {}", merged, last_merged);
            self.broadcaster
                .broadcast_to_pin_peers(Message::Inv(vec![InvItem::block(last_merged)]))
                .await;
        }

        Ok(())
    }

    /// Insert one connected header, then drain any orphans it unblocks.
    /// Returns how many headers joined the chain.
    fn insert_at(
        inner: &mut TrackerInner,
        mut header: LiteHeader,
        height: usize,
        starting_height: usize,
    ) -> usize {
        header.height = height;
        let mut connected = 0usize;
        let mut pending = vec![header];

        while let Some(header) = pending.pop() {
            let hash = header.hash();
            let height = header.height;

            let slot = height - starting_height;
            if inner.chain.len() <= slot {
                inner.chain.resize_with(slot + 1, BTreeSet::new);
            }
            inner.chain[slot].insert(hash);
            inner.known.insert(hash, header);
            connected += 1;

            if let Some(children) = inner.orphans.remove(&hash) {
                for mut child in children {
                    if inner.known.contains_key(&child.hash()) {
                        continue;
                    }
                    child.height = height + 1;
                    pending.push(child);
                }
            }
        }

        connected
    }

    /// Hashes of the highest non-empty, non-null slot.
    ///
    /// Empty only in a corrupted state: at minimum the checkpoint is known.
    pub fn get_last_known_block_hash(&self) -> BTreeSet<Hash> {
        let inner = self.inner.read();
        Self::top_set(&inner.chain, inner.chain.len().saturating_sub(1))
    }

    /// Hashes at `height`, clamped into `[starting_height, top]`, walking
    /// down to the first non-empty slot like `get_last_known_block_hash`.
    pub fn get_known_block_hashes(&self, height: usize) -> BTreeSet<Hash> {
        let inner = self.inner.read();
        let top = inner.chain.len().saturating_sub(1);
        let clamped = height.max(self.starting_height) - self.starting_height;
        Self::top_set(&inner.chain, clamped.min(top))
    }

    fn top_set(chain: &[BTreeSet<Hash>], from: usize) -> BTreeSet<Hash> {
        for slot in chain[..=from.min(chain.len().saturating_sub(1))].iter().rev() {
            let real: BTreeSet<Hash> = slot.iter().copied().filter(|h| !h.is_zero()).collect();
            if !real.is_empty() {
                return slot.clone();
            }
        }

        error!("no known block hashes; the checkpoint should always be present");
        BTreeSet::new()
    }

    /// Greatest height among the current top set
    pub fn get_top_height(&self) -> usize {
        let top = self.get_last_known_block_hash();
        let inner = self.inner.read();
        top.iter()
            .filter_map(|hash| inner.known.get(hash))
            .map(|header| header.height)
            .max()
            .unwrap_or(0)
    }

    /// Identity of the highest header in the top set
    pub fn get_top_checkpoint(&self) -> (Hash, usize) {
        let top = self.get_last_known_block_hash();
        let inner = self.inner.read();
        let mut best = (Hash::zero(), 0usize);
        for hash in top {
            if let Some(header) = inner.known.get(&hash) {
                if header.height >= best.1 {
                    best = (hash, header.height);
                }
            }
        }
        best
    }

    /// Latest timestamp among the current top set
    pub fn get_latest_timestamp(&self) -> u32 {
        let top = self.get_last_known_block_hash();
        let inner = self.inner.read();
        top.iter()
            .filter_map(|hash| inner.known.get(hash))
            .map(|header| header.timestamp())
            .max()
            .unwrap_or(0)
    }

    pub fn get_header_by_id(&self, id: &Hash) -> Option<LiteHeader> {
        self.inner.read().known.get(id).cloned()
    }

    pub fn get_height_by_id(&self, id: &Hash) -> Option<usize> {
        self.inner.read().known.get(id).map(|header| header.height)
    }

    pub fn get_prev_hash_by_id(&self, id: &Hash) -> Option<Hash> {
        self.inner.read().known.get(id).map(|header| header.prev())
    }

    /// Number of headers known (checkpoint included)
    pub fn known_count(&self) -> usize {
        self.inner.read().known.len()
    }

    /// True when some header in the first non-empty slot from the top is
    /// within the last ten minutes of `now`.
    pub fn is_synchronized_at(&self, now: u32) -> bool {
        let inner = self.inner.read();
        for slot in inner.chain.iter().rev() {
            if slot.is_empty() {
                continue;
            }
            return slot.iter().filter_map(|id| inner.known.get(id)).any(|header| {
                now > header.timestamp()
                    && now.saturating_sub(SYNCHRONIZED_WINDOW_SECONDS) < header.timestamp()
            });
        }
        false
    }

    pub fn is_synchronized(&self) -> bool {
        self.is_synchronized_at(unix_now())
    }

    /// Walk back from `from` following `prev` links until a hash in `stops`
    /// is met, collecting the walked hashes oldest-first. `from` itself is
    /// included; the stop hash is not. `None` when a link is missing
    /// (corrupted chain) — callers log and abort rather than loop.
    pub fn walk_back_until(&self, from: Hash, stops: &BTreeSet<Hash>) -> Option<Vec<Hash>> {
        let inner = self.inner.read();
        let mut path = std::collections::VecDeque::new();
        let mut cursor = from;

        while !stops.contains(&cursor) {
            let header = match inner.known.get(&cursor) {
                Some(header) => header,
                None => {
                    warn!("prev-hash walk hit unknown header {}", cursor);
                    return None;
                }
            };
            path.push_front(cursor);
            cursor = header.prev();

            if path.len() > inner.known.len() {
                warn!("prev-hash walk exceeded known set; aborting");
                return None;
            }
        }

        Some(path.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{sha256, NO_RETARGET_POW_LIMIT};
    use async_trait::async_trait;

    struct NullSink;

    #[async_trait]
    impl Broadcast for NullSink {
        async fn broadcast_to_pin_peers(&self, _message: Message) -> usize {
            0
        }
    }

    fn checkpoint() -> LiteHeader {
        let mut header = LiteHeader::new(
            1,
            sha256(b"below checkpoint"),
            sha256(b"merkle"),
            1_600_000_000,
            NO_RETARGET_POW_LIMIT,
            0,
        );
        header.height = 1000;
        header
    }

    /// Grind a child of `parent` that clears the permissive limit.
    fn mine_child(parent: &LiteHeader, salt: u32) -> LiteHeader {
        let mut header = LiteHeader::new(
            1,
            parent.hash(),
            sha256(&salt.to_le_bytes()),
            parent.timestamp() + 1,
            NO_RETARGET_POW_LIMIT,
            0,
        );
        while !header.is_valid_proof_of_work(false) {
            header.set_nonce(header.nonce() + 1);
        }
        header
    }

    fn tracker() -> ChainTracker {
        ChainTracker::with_retarget(Arc::new(NullSink), checkpoint(), false)
    }

    #[tokio::test]
    async fn test_merge_chain_of_three() {
        let tracker = tracker();
        let a = mine_child(&checkpoint(), 1);
        let b = mine_child(&a, 2);
        let c = mine_child(&b, 3);

        tracker
            .merge(vec![a.clone(), b.clone(), c.clone()])
            .await
            .unwrap();

        assert_eq!(tracker.get_top_height(), 1003);
        let top = tracker.get_last_known_block_hash();
        assert_eq!(top.len(), 1);
        assert!(top.contains(&c.hash()));
        assert_eq!(tracker.get_height_by_id(&b.hash()), Some(1002));
        assert_eq!(tracker.get_prev_hash_by_id(&b.hash()), Some(a.hash()));
    }

    #[tokio::test]
    async fn test_merge_rejects_bad_pow() {
        let tracker = tracker();
        let mut bad = mine_child(&checkpoint(), 1);
        // An impossible target: mantissa zero never decodes.
        bad.set_bits(0x0000_0000);

        let result = tracker.merge(vec![bad]).await;
        assert!(matches!(result, Err(Error::InvalidProofOfWork)));
        assert_eq!(tracker.get_top_height(), 1000);
    }

    #[tokio::test]
    async fn test_merge_is_idempotent() {
        let tracker = tracker();
        let a = mine_child(&checkpoint(), 1);

        tracker.merge(vec![a.clone()]).await.unwrap();
        let count = tracker.known_count();
        tracker.merge(vec![a]).await.unwrap();
        assert_eq!(tracker.known_count(), count);
    }

    #[tokio::test]
    async fn test_forks_coexist_at_same_height() {
        let tracker = tracker();
        let a = mine_child(&checkpoint(), 1);
        let b = mine_child(&checkpoint(), 2);

        tracker.merge(vec![a.clone(), b.clone()]).await.unwrap();
        let top = tracker.get_last_known_block_hash();
        assert_eq!(top.len(), 2);
        assert!(top.contains(&a.hash()) && top.contains(&b.hash()));
        assert_eq!(tracker.get_top_height(), 1001);
    }

    #[tokio::test]
    async fn test_orphans_connect_when_parent_arrives() {
        let tracker = tracker();
        let a = mine_child(&checkpoint(), 1);
        let b = mine_child(&a, 2);

        // Child first: parked, not counted.
        tracker.merge(vec![b.clone()]).await.unwrap();
        assert_eq!(tracker.get_top_height(), 1000);
        assert!(tracker.get_header_by_id(&b.hash()).is_none());

        // Parent arrives: both connect.
        tracker.merge(vec![a.clone()]).await.unwrap();
        assert_eq!(tracker.get_top_height(), 1002);
        assert_eq!(tracker.get_height_by_id(&b.hash()), Some(1002));
    }

    #[tokio::test]
    async fn test_known_block_hashes_clamped() {
        let tracker = tracker();
        let a = mine_child(&checkpoint(), 1);
        tracker.merge(vec![a.clone()]).await.unwrap();

        // Below the checkpoint clamps up to it.
        let below = tracker.get_known_block_hashes(1);
        assert!(below.contains(&checkpoint().hash()));

        // Past the top clamps down to the top.
        let above = tracker.get_known_block_hashes(99_999);
        assert!(above.contains(&a.hash()));

        // Exact heights hit their slot.
        let exact = tracker.get_known_block_hashes(1000);
        assert!(exact.contains(&checkpoint().hash()));
    }

    #[tokio::test]
    async fn test_is_synchronized_window() {
        let tracker = tracker();
        let ts = checkpoint().timestamp();
        assert!(tracker.is_synchronized_at(ts + 10));
        assert!(!tracker.is_synchronized_at(ts + SYNCHRONIZED_WINDOW_SECONDS + 1));
        // A clock at or before the header's own time is not "synchronized".
        assert!(!tracker.is_synchronized_at(ts));
    }

    #[tokio::test]
    async fn test_walk_back_until() {
        let tracker = tracker();
        let a = mine_child(&checkpoint(), 1);
        let b = mine_child(&a, 2);
        let c = mine_child(&b, 3);
        tracker
            .merge(vec![a.clone(), b.clone(), c.clone()])
            .await
            .unwrap();

        let mut stops = BTreeSet::new();
        stops.insert(checkpoint().hash());
        let path = tracker.walk_back_until(c.hash(), &stops).unwrap();
        assert_eq!(path, vec![a.hash(), b.hash(), c.hash()]);

        // Unknown link aborts instead of looping.
        let missing = tracker.walk_back_until(sha256(b"nowhere"), &stops);
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_top_checkpoint_and_timestamp() {
        let tracker = tracker();
        let a = mine_child(&checkpoint(), 1);
        tracker.merge(vec![a.clone()]).await.unwrap();

        let (hash, height) = tracker.get_top_checkpoint();
        assert_eq!(hash, a.hash());
        assert_eq!(height, 1001);
        assert_eq!(tracker.get_latest_timestamp(), a.timestamp());
    }
}

//! Per-peer pin synchronization
//!
//! Attached only when the remote advertises the pin service bit. Keeps a
//! high-water mark of the latest header the peer is known to hold, sends
//! pins as the peer's view of the chain advances, and bridges missing
//! header segments ahead of proactive pin sends so the peer can always
//! verify the anchor.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::chain::ChainTracker;
use crate::error::Error;
use crate::message::{InvKind, Message, ObjectPayload, MAX_GET_HEADERS};
use crate::net::channel::{Channel, Protocol};
use crate::pinboard::PinStore;

pub struct PinSyncProtocol {
    tracker: Arc<ChainTracker>,
    pins: Arc<PinStore>,
    /// Hash(es) of the newest header we believe the peer already has
    oldest_known_hashes: RwLock<BTreeSet<crate::Hash>>,
}

impl PinSyncProtocol {
    pub fn new(tracker: Arc<ChainTracker>, pins: Arc<PinStore>) -> Self {
        Self {
            tracker,
            pins,
            oldest_known_hashes: RwLock::new(BTreeSet::new()),
        }
    }

    fn max_known_height(&self) -> usize {
        self.oldest_known_hashes
            .read()
            .iter()
            .filter(|hash| !hash.is_zero())
            .filter_map(|hash| self.tracker.get_height_by_id(hash))
            .max()
            .unwrap_or(0)
    }

    /// The peer confirmed it holds `new_hash`; send every pin anchored in
    /// the window its confirmation just opened.
    async fn advance_peer_view(
        &self,
        channel: &Arc<Channel>,
        new_hash: crate::Hash,
    ) -> Result<(), Error> {
        let max_old_height = self.max_known_height();

        let new_height = match self.tracker.get_height_by_id(&new_hash) {
            Some(height) => height,
            None => {
                // An unknown block id is header sync's business, not ours.
                return Ok(());
            }
        };

        if new_height <= max_old_height {
            return Ok(());
        }

        {
            let mut oldest = self.oldest_known_hashes.write();
            oldest.clear();
            oldest.insert(new_hash);
        }
        info!(
            "[{}] advanced to height {}",
            channel.peer_address(),
            new_height
        );

        // Collect under the store lock alone; the tracker is consulted and
        // the sends happen only after it is released.
        let mut candidates = Vec::new();
        self.pins
            .for_each(|stored| candidates.push(stored.payload.clone()));

        let mut window = Vec::new();
        for payload in candidates {
            if let Some(anchor_height) = self.tracker.get_height_by_id(&payload.anchor()) {
                if anchor_height > max_old_height && anchor_height <= new_height {
                    window.push(payload);
                }
            }
        }

        debug!(
            "sending {} pin(s) newly covered for [{}]",
            window.len(),
            channel.peer_address()
        );
        for payload in window {
            channel.send(Message::Object(payload)).await?;
        }

        Ok(())
    }

    /// Proactively send one pin, prepending whatever header segment the
    /// peer needs to connect the pin's anchor.
    pub async fn send_object(
        &self,
        channel: &Arc<Channel>,
        payload: &ObjectPayload,
    ) -> Result<(), Error> {
        let anchor = payload.anchor();
        if self.tracker.get_height_by_id(&anchor).is_none() {
            warn!("cannot bridge unknown anchor {}", anchor);
            return Err(Error::Unknown);
        }

        let stops = self.oldest_known_hashes.read().clone();
        let path = match self.tracker.walk_back_until(anchor, &stops) {
            Some(path) => path,
            None => {
                warn!("no path from anchor {} to the peer's known headers", anchor);
                return Err(Error::Unknown);
            }
        };

        // Oldest first, in full batches, advancing the high-water mark
        // after each so a second send does not repeat the segment.
        for chunk in path.chunks(MAX_GET_HEADERS) {
            let mut headers = Vec::with_capacity(chunk.len());
            for hash in chunk {
                match self.tracker.get_header_by_id(hash) {
                    Some(header) => headers.push(header),
                    None => {
                        warn!("header {} vanished while bridging", hash);
                        return Err(Error::Unknown);
                    }
                }
            }
            let last = chunk[chunk.len() - 1];
            channel.send(Message::Headers(headers)).await?;

            let mut oldest = self.oldest_known_hashes.write();
            oldest.clear();
            oldest.insert(last);
        }

        channel.send(Message::Object(payload.clone())).await
    }
}

#[async_trait]
impl Protocol for PinSyncProtocol {
    fn name(&self) -> &'static str {
        "pin_sync"
    }

    async fn start(&self, channel: &Arc<Channel>) -> Result<(), Error> {
        let start_height = channel.peer_version().start_height as usize;
        let hashes = self.tracker.get_known_block_hashes(start_height);

        if let Some(first) = hashes.iter().next() {
            if !first.is_zero() {
                *self.oldest_known_hashes.write() = hashes;
                debug!(
                    "[{}] starts at height {}",
                    channel.peer_address(),
                    start_height
                );
            }
        }

        Ok(())
    }

    async fn on_message(&self, channel: &Arc<Channel>, message: &Message) -> Result<(), Error> {
        match message {
            Message::Inv(items) => {
                // The newest confirmation is what matters; scan from the tail.
                if let Some(item) = items.iter().rev().find(|item| item.kind == InvKind::Block) {
                    self.advance_peer_view(channel, item.hash).await?;
                }
                Ok(())
            }
            Message::Object(payload) => {
                match self.pins.process(payload.clone()).await {
                    Ok(_) => Ok(()),
                    Err(error) if error.is_peer_fatal() => {
                        warn!(
                            "bad pin from [{}]: {}, disconnecting",
                            channel.peer_address(),
                            error
                        );
                        Err(error)
                    }
                    Err(error) => {
                        // Missing anchors and the like resolve themselves.
                        debug!("pin from [{}] deferred: {}", channel.peer_address(), error);
                        Ok(())
                    }
                }
            }
            _ => Ok(()),
        }
    }
}

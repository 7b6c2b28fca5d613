//! Per-peer header synchronization
//!
//! Pulls headers from the peer by locator, serves the peer's own locator
//! requests, and reacts to block inventories. An unhelpful peer is left
//! connected; only the framework-level codec failures drop a channel.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::chain::ChainTracker;
use crate::error::Error;
use crate::message::{GetHeadersMessage, InvKind, Message, MAX_GET_HEADERS};
use crate::net::channel::{Channel, Protocol};
use crate::Hash;

pub struct HeaderSyncProtocol {
    tracker: Arc<ChainTracker>,
}

impl HeaderSyncProtocol {
    pub fn new(tracker: Arc<ChainTracker>) -> Self {
        Self { tracker }
    }

    /// Ask the peer for everything between our tips and `last`.
    ///
    /// On a fork every competing tip is offered as a start so the peer can
    /// answer from whichever branch it knows. Returns false when `last` is
    /// already one of our tips, i.e. nothing was requested.
    async fn request_missing_headers(
        &self,
        channel: &Arc<Channel>,
        last: Hash,
    ) -> Result<bool, Error> {
        let tips = self.tracker.get_last_known_block_hash();
        debug!("requesting from {} known tip(s)", tips.len());

        for tip in tips {
            if tip == last {
                return Ok(false);
            }
            channel
                .send(Message::GetHeaders(GetHeadersMessage::new(vec![tip], last)))
                .await?;
        }

        Ok(true)
    }

    /// Serve a locator: walk from the stop hash back to the best start
    /// hash we share with the peer, then emit that segment oldest-first.
    async fn serve_get_headers(
        &self,
        channel: &Arc<Channel>,
        request: &GetHeadersMessage,
    ) -> Result<(), Error> {
        let mut stop = request.stop_hash;

        if self.tracker.get_header_by_id(&stop).is_none() {
            debug!("unknown stop hash {}, assuming our chain top", stop);
            stop = Hash::zero();
            for tip in self.tracker.get_last_known_block_hash() {
                if !tip.is_zero() {
                    stop = tip;
                    break;
                }
            }
            if stop.is_zero() {
                warn!("no usable chain top to serve headers from");
                return Ok(());
            }
        }

        // Of the starts we hold, pick the highest.
        let mut known_start = Hash::zero();
        let mut best_height = 0usize;
        for start in &request.start_hashes {
            if let Some(height) = self.tracker.get_height_by_id(start) {
                if height >= best_height {
                    best_height = height;
                    known_start = *start;
                }
            }
        }

        if known_start.is_zero() {
            debug!("no requested start hash is known, dropping request");
            return Ok(());
        }

        let mut stops = BTreeSet::new();
        stops.insert(known_start);
        let path = match self.tracker.walk_back_until(stop, &stops) {
            Some(path) => path,
            None => {
                warn!("cannot bridge {} back to {}", stop, known_start);
                return Ok(());
            }
        };

        let mut headers = Vec::new();
        for hash in path.iter().take(MAX_GET_HEADERS) {
            match self.tracker.get_header_by_id(hash) {
                Some(header) => headers.push(header),
                None => {
                    warn!("header {} vanished during serve", hash);
                    return Ok(());
                }
            }
        }

        if !headers.is_empty() {
            debug!(
                "serving {} header(s) to [{}]",
                headers.len(),
                channel.peer_address()
            );
            channel.send(Message::Headers(headers)).await?;
        }

        Ok(())
    }
}

#[async_trait]
impl Protocol for HeaderSyncProtocol {
    fn name(&self) -> &'static str {
        "header_sync"
    }

    async fn start(&self, channel: &Arc<Channel>) -> Result<(), Error> {
        self.request_missing_headers(channel, Hash::zero()).await?;
        Ok(())
    }

    async fn on_message(&self, channel: &Arc<Channel>, message: &Message) -> Result<(), Error> {
        match message {
            Message::Headers(batch) => {
                let count = batch.len();
                if let Err(error) = self.tracker.merge(batch.clone()).await {
                    // The peer is unhelpful, not malicious enough to drop:
                    // report and stay connected.
                    warn!(
                        "merging {} header(s) from [{}] failed: {} ({})",
                        count,
                        channel.peer_address(),
                        error,
                        Error::InvalidPreviousBlock,
                    );
                }

                // A full batch means there is more where that came from.
                if count == MAX_GET_HEADERS {
                    self.request_missing_headers(channel, Hash::zero()).await?;
                } else {
                    info!(
                        "header sync with [{}] at height {}",
                        channel.peer_address(),
                        self.tracker.get_top_height()
                    );
                }
                Ok(())
            }
            Message::GetHeaders(request) => self.serve_get_headers(channel, request).await,
            Message::Inv(items) => {
                for item in items {
                    if item.kind == InvKind::Block {
                        debug!("block inventory {} from [{}]", item.hash, channel.peer_address());
                        if self.request_missing_headers(channel, item.hash).await? {
                            break;
                        }
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

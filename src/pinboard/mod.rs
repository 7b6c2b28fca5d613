//! The pin store
//!
//! Pins buy seconds of storage with proof-of-work: the stronger the PoW
//! and the smaller the pin, the longer it lives, counted from the
//! timestamp of the anchor header it references. Storage is grouped into
//! 256-second expiry buckets so the periodic sweep touches whole buckets
//! instead of individual pins.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use primitive_types::U256;
use tracing::{debug, info, warn};

use crate::chain::{unix_now, ChainTracker};
use crate::error::Error;
use crate::message::{Message, ObjectPayload, DEFAULT_POW_KIND};
use crate::net::Broadcast;
use crate::Hash;

/// Hard cap on a pin's lifetime: one day
pub const TTL_CAP_SECONDS: u32 = 60 * 60 * 24;

/// Period of the eviction sweep
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Outcome of a successful admission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admitted {
    /// Stored and re-broadcast
    Accepted,
    /// Already stored; nothing changed, nothing re-broadcast
    Duplicate,
}

/// A stored pin with its expiry bookkeeping
#[derive(Debug, Clone)]
pub struct StoredPin {
    pub payload: ObjectPayload,
    pub bucket_id: u32,
    pub anchor_timestamp: u32,
    pub ttl: u32,
}

struct StoreInner {
    objects: HashMap<Hash, StoredPin>,
    buckets: BTreeMap<u32, BTreeSet<Hash>>,
}

/// Expiring content-addressed store with PoW-priced admission
pub struct PinStore {
    broadcaster: Arc<dyn Broadcast>,
    tracker: Arc<ChainTracker>,
    min_target: U256,
    inner: RwLock<StoreInner>,
}

impl PinStore {
    pub fn new(
        broadcaster: Arc<dyn Broadcast>,
        tracker: Arc<ChainTracker>,
        min_target: U256,
    ) -> Self {
        Self {
            broadcaster,
            tracker,
            min_target,
            inner: RwLock::new(StoreInner {
                objects: HashMap::new(),
                buckets: BTreeMap::new(),
            }),
        }
    }

    /// Lifetime bought: `pow_mul * work / size`, capped at one day.
    pub fn calc_ttl(work_done: U256, size: usize) -> u32 {
        let ttl = work_done
            .saturating_mul(U256::from(DEFAULT_POW_KIND.pow_mul()))
            / U256::from(size.max(1));
        if ttl > U256::from(TTL_CAP_SECONDS) {
            TTL_CAP_SECONDS
        } else {
            ttl.low_u32()
        }
    }

    /// Bucket holding `expiry`: the next multiple of 256 strictly above it.
    pub fn calc_bucket_id(expiry: u32) -> u32 {
        ((expiry >> 8) + 1) << 8
    }

    /// Admit a pin, pricing its lifetime by PoW.
    pub async fn process(&self, payload: ObjectPayload) -> Result<Admitted, Error> {
        self.process_at(payload, unix_now()).await
    }

    /// Admission against an explicit clock.
    pub async fn process_at(&self, payload: ObjectPayload, now: u32) -> Result<Admitted, Error> {
        if !payload.is_valid() {
            warn!("rejecting malformed pin");
            return Err(Error::BadStream);
        }

        let id = payload.get_id();

        if payload.pow().kind() != DEFAULT_POW_KIND {
            warn!("pin {} carries wrong PoW kind, rejecting", id);
            return Err(Error::InvalidProofOfWork);
        }

        let work_done = payload.get_work_done();
        let size = payload.serialized_size();
        debug!("incoming pin {} size={} work={}", id, size, work_done);

        if payload.get_pow_value() > self.min_target {
            warn!("pin {} PoW above the minimum target, rejecting", id);
            return Err(Error::InvalidProofOfWork);
        }

        let anchor = payload.anchor();
        let anchor_header = match self.tracker.get_header_by_id(&anchor) {
            Some(header) => header,
            None => {
                // The anchor may still be in flight; the peer is not at fault.
                debug!("pin {} anchored at unknown header {}", id, anchor);
                return Err(Error::Unknown);
            }
        };

        let ttl = Self::calc_ttl(work_done, size);
        let anchor_timestamp = anchor_header.timestamp();
        let expiry = anchor_timestamp.saturating_add(ttl);

        if now >= expiry {
            debug!("pin {} expired {} seconds ago", id, now - expiry);
            return Err(Error::Unknown);
        }

        let bucket_id = Self::calc_bucket_id(expiry);
        debug!("pin {} lives {} more seconds, bucket {}", id, expiry - now, bucket_id);

        {
            let mut inner = self.inner.write();
            if inner.objects.contains_key(&id) {
                debug!("pin {} already stored", id);
                return Ok(Admitted::Duplicate);
            }

            inner.buckets.entry(bucket_id).or_default().insert(id);
            inner.objects.insert(
                id,
                StoredPin {
                    payload: payload.clone(),
                    bucket_id,
                    anchor_timestamp,
                    ttl,
                },
            );
        }

        info!("pin {} accepted, ttl {} s", id, ttl);
        self.broadcaster
            .broadcast_to_pin_peers(Message::Object(payload))
            .await;

        Ok(Admitted::Accepted)
    }

    /// Evict every bucket whose upper bound has passed.
    pub fn cleanup(&self) {
        self.cleanup_at(unix_now());
    }

    /// Eviction against an explicit clock.
    pub fn cleanup_at(&self, now: u32) {
        let mut inner = self.inner.write();

        let expired: Vec<u32> = inner
            .buckets
            .range(..=now)
            .map(|(bucket_id, _)| *bucket_id)
            .collect();

        for bucket_id in expired {
            if let Some(ids) = inner.buckets.remove(&bucket_id) {
                debug!("evicting bucket {} ({} pin(s))", bucket_id, ids.len());
                for id in ids {
                    inner.objects.remove(&id);
                }
            }
        }
    }

    /// Visit every stored pin in bucket order under a read lock.
    pub fn for_each<F: FnMut(&StoredPin)>(&self, mut visitor: F) {
        let inner = self.inner.read();
        for ids in inner.buckets.values() {
            for id in ids {
                if let Some(stored) = inner.objects.get(id) {
                    visitor(stored);
                }
            }
        }
    }

    /// Number of stored pins
    pub fn len(&self) -> usize {
        self.inner.read().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Human-readable listing for the `--print` action.
    pub fn dump(&self) -> String {
        let inner = self.inner.read();
        let mut out = String::new();
        for (bucket_id, ids) in &inner.buckets {
            let _ = writeln!(out, "{}", bucket_id);
            for id in ids {
                match inner.objects.get(id) {
                    Some(stored) => {
                        let _ = writeln!(
                            out,
                            "\t{}\t{}",
                            id,
                            stored.payload.get_body_id().to_base58()
                        );
                    }
                    None => {
                        let _ = writeln!(out, "\t{}\tmissing", id);
                    }
                }
            }
        }
        out
    }

    /// Run the sweep loop until `stop` flips.
    pub async fn run_sweeper(self: Arc<Self>, mut stop: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.cleanup(),
                result = stop.changed() => {
                    if result.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("pin store sweeper stopped");
    }
}

//! Pin miner
//!
//! Grinds the certificate nonce until the pin PoW clears a target. The
//! anchor is re-read from the tracker on every iteration: the chain moves
//! while we mine, and a fresher anchor buys more lifetime. The extra lock
//! traffic is the accepted price.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use primitive_types::U256;
use rand::Rng;
use tracing::{debug, info};

use crate::chain::ChainTracker;
use crate::error::Error;
use crate::message::{ChainTag, ObjectPayload, DEFAULT_POW_KIND};

pub struct Miner {
    tracker: Arc<ChainTracker>,
    stop_signal: Arc<AtomicBool>,
}

impl Miner {
    pub fn new(tracker: Arc<ChainTracker>) -> Self {
        Self {
            tracker,
            stop_signal: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle for interrupting a mining run from another task
    pub fn stop_signal(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop_signal)
    }

    pub fn stop(&self) {
        self.stop_signal.store(true, Ordering::SeqCst);
    }

    /// Search for a nonce whose PoW value falls below `target`.
    ///
    /// The nonce is seeded uniformly at random and incremented linearly.
    /// Fails with `Unknown` when the tracker has no usable tip, with
    /// `ServiceStopped` when interrupted.
    pub fn mine(&self, payload: &mut ObjectPayload, target: U256) -> Result<(), Error> {
        let mut pow = payload.pow().clone();
        pow.set_kind(DEFAULT_POW_KIND);
        pow.set_tag(ChainTag::LitecoinMain);
        payload.set_pow(pow);

        let start_nonce: u64 = rand::thread_rng().gen();
        let estimated = crate::crypto::work_from_value(target);
        info!(
            "mining: estimated work {}, starting from nonce {}",
            estimated, start_nonce
        );

        let started = Instant::now();
        for nonce in start_nonce..u64::MAX {
            if self.stop_signal.load(Ordering::SeqCst) {
                return Err(Error::ServiceStopped);
            }

            let top = self.tracker.get_last_known_block_hash();
            let anchor = match top.iter().next() {
                Some(anchor) => *anchor,
                None => return Err(Error::Unknown),
            };

            payload.set_anchor(anchor);
            payload.set_nonce(nonce);

            if payload.get_pow_value() < target {
                let elapsed = started.elapsed().as_secs_f64();
                let tries = nonce - start_nonce + 1;
                info!(
                    "mined nonce {} after {} tries in {:.1} s ({:.1} h/s)",
                    nonce,
                    tries,
                    elapsed,
                    tries as f64 / elapsed.max(f64::MIN_POSITIVE)
                );
                debug!("work done: {}", payload.get_work_done());
                return Ok(());
            }
        }

        Err(Error::Unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::LiteHeader;
    use crate::crypto::{sha256, NO_RETARGET_POW_LIMIT};
    use crate::message::Message;
    use crate::net::Broadcast;
    use async_trait::async_trait;

    struct NullSink;

    #[async_trait]
    impl Broadcast for NullSink {
        async fn broadcast_to_pin_peers(&self, _message: Message) -> usize {
            0
        }
    }

    fn tracker() -> Arc<ChainTracker> {
        let mut checkpoint = LiteHeader::new(
            1,
            sha256(b"p"),
            sha256(b"m"),
            1_600_000_000,
            NO_RETARGET_POW_LIMIT,
            0,
        );
        checkpoint.height = 10;
        Arc::new(ChainTracker::with_retarget(
            Arc::new(NullSink),
            checkpoint,
            false,
        ))
    }

    #[test]
    fn test_mine_with_permissive_target() {
        let tracker = tracker();
        let miner = Miner::new(tracker.clone());
        let mut payload = ObjectPayload::from_body(b"mined in test".to_vec());

        miner.mine(&mut payload, U256::MAX).unwrap();

        assert_eq!(payload.pow().kind(), DEFAULT_POW_KIND);
        assert_eq!(payload.pow().tag(), ChainTag::LitecoinMain);
        assert!(tracker
            .get_last_known_block_hash()
            .contains(&payload.anchor()));
        assert!(payload.get_pow_value() < U256::MAX);
        assert!(payload.is_valid());
    }

    #[test]
    fn test_mine_interrupted() {
        let miner = Miner::new(tracker());
        miner.stop();
        let mut payload = ObjectPayload::from_body(b"never".to_vec());
        let result = miner.mine(&mut payload, U256::zero());
        assert!(matches!(result, Err(Error::ServiceStopped)));
    }
}

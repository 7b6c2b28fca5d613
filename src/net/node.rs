//! The overlay node
//!
//! Wraps the peer link layer: accepts inbound connections, maintains
//! outbound ones with a bias toward pin-capable hosts, keeps a
//! fixed-capacity address ring fed by subsampled `addr` gossip, and
//! attaches the protocol stack to every channel.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::chain::{unix_now, ChainTracker};
use crate::error::Error;
use crate::message::{
    NetAddress, VersionMessage, MAGIC_MAINNET, PROTOCOL_MAXIMUM, SERVICE_NODE_NETWORK, SERVICE_PIN,
};
use crate::net::channel::{perform_handshake, run_channel, Channel};
use crate::pinboard::PinStore;
use crate::sync::{AddressProtocol, HeaderSyncProtocol, PingProtocol, PinSyncProtocol, RejectProtocol};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(5);

/// Network knobs for one node
#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub magic: u32,
    /// Zero disables the listener
    pub inbound_port: u16,
    pub inbound_connections: usize,
    pub outbound_connections: usize,
    /// Capacity of the address ring
    pub host_pool_capacity: usize,
    /// Peers to dial unconditionally at startup
    pub connect_peers: Vec<SocketAddr>,
    /// DNS seed host:port pairs, resolved at startup
    pub seeds: Vec<String>,
    /// Our externally visible address, if known
    pub self_address: Option<SocketAddr>,
    /// Services we advertise
    pub services: u64,
    pub user_agent: String,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            magic: MAGIC_MAINNET,
            inbound_port: crate::constants::INBOUND_PORT,
            inbound_connections: 16,
            outbound_connections: 16,
            host_pool_capacity: 256_000,
            connect_peers: Vec::new(),
            seeds: crate::constants::SEEDS.iter().map(|s| s.to_string()).collect(),
            self_address: None,
            services: SERVICE_NODE_NETWORK | SERVICE_PIN,
            user_agent: crate::constants::USER_AGENT.to_string(),
        }
    }
}

struct AddressRing {
    entries: VecDeque<NetAddress>,
    capacity: usize,
}

impl AddressRing {
    fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
        }
    }

    fn contains(&self, address: &NetAddress) -> bool {
        self.entries.iter().any(|entry| entry.same_endpoint(address))
    }

    /// Full ring drops the oldest entry.
    fn push(&mut self, address: NetAddress) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(address);
    }
}

/// The overlay node
pub struct Node {
    settings: NodeSettings,
    tracker: Arc<ChainTracker>,
    pins: Arc<PinStore>,
    /// Nonce advertised in our version messages; detects self-dials
    nonce: u64,
    channels: RwLock<Vec<Arc<Channel>>>,
    peers: RwLock<AddressRing>,
    stopped: AtomicBool,
    stop_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    pub fn new(settings: NodeSettings, tracker: Arc<ChainTracker>, pins: Arc<PinStore>) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        let capacity = settings.host_pool_capacity.max(1);
        Arc::new(Self {
            settings,
            tracker,
            pins,
            nonce: rand::thread_rng().gen(),
            channels: RwLock::new(Vec::new()),
            peers: RwLock::new(AddressRing::new(capacity)),
            stopped: AtomicBool::new(false),
            stop_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn settings(&self) -> &NodeSettings {
        &self.settings
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    /// Launch the listener, the seeders and the outbound maintainer.
    pub async fn start(self: &Arc<Self>) -> Result<(), Error> {
        if self.is_stopped() {
            return Err(Error::ServiceStopped);
        }

        self.seed_addresses().await;

        if self.settings.inbound_port != 0 && self.settings.inbound_connections > 0 {
            let listener =
                TcpListener::bind(("0.0.0.0", self.settings.inbound_port)).await?;
            info!("listening on port {}", self.settings.inbound_port);
            let node = self.clone();
            self.track(tokio::spawn(async move {
                node.accept_loop(listener).await;
            }));
        }

        for peer in self.settings.connect_peers.clone() {
            let node = self.clone();
            self.track(tokio::spawn(async move {
                if let Err(error) = node.connect_to(peer).await {
                    warn!("manual connection to {} failed: {}", peer, error);
                }
            }));
        }

        let node = self.clone();
        self.track(tokio::spawn(async move {
            node.outbound_loop().await;
        }));

        Ok(())
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    /// Resolve the configured DNS seeds into the address ring.
    async fn seed_addresses(&self) {
        for seed in &self.settings.seeds {
            match tokio::net::lookup_host(seed.as_str()).await {
                Ok(resolved) => {
                    let addresses: Vec<NetAddress> = resolved
                        .map(|addr| NetAddress::new(addr, SERVICE_NODE_NETWORK, unix_now()))
                        .collect();
                    debug!("seed {} resolved to {} address(es)", seed, addresses.len());
                    self.store(&addresses);
                }
                Err(error) => debug!("seed {} failed to resolve: {}", seed, error),
            }
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut stop = self.stop_signal();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            if self.connection_count(0) >= self.settings.inbound_connections
                                + self.settings.outbound_connections
                            {
                                debug!("connection table full, dropping [{}]", peer);
                                continue;
                            }
                            let node = self.clone();
                            tokio::spawn(async move {
                                if let Err(error) = node.establish(stream, false).await {
                                    debug!("inbound [{}] failed: {}", peer, error);
                                }
                            });
                        }
                        Err(error) => {
                            warn!("accept failed: {}", error);
                        }
                    }
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Keep dialing until the outbound target is met.
    async fn outbound_loop(self: Arc<Self>) {
        let mut stop = self.stop_signal();
        let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let outbound = self
                        .channels
                        .read()
                        .iter()
                        .filter(|channel| channel.is_outbound() && !channel.is_stopped())
                        .count();
                    if outbound >= self.settings.outbound_connections {
                        continue;
                    }

                    let candidate = match self.fetch_address() {
                        Some(address) => address,
                        None => continue,
                    };

                    let node = self.clone();
                    tokio::spawn(async move {
                        if let Err(error) = node.new_connect(candidate).await {
                            debug!("dial {} failed: {}", candidate.socket_addr(), error);
                        }
                    });
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Outbound dial with the connected/self check.
    async fn new_connect(self: Arc<Self>, candidate: NetAddress) -> Result<(), Error> {
        if self.is_stopped() {
            return Err(Error::ChannelStopped);
        }

        let address = candidate.socket_addr();
        if self.connected(&candidate) {
            return Err(Error::AddressInUse);
        }
        if let Some(self_address) = self.settings.self_address {
            if self_address == address {
                return Err(Error::AddressInUse);
            }
        }

        self.connect_to(address).await
    }

    async fn connect_to(self: &Arc<Self>, address: SocketAddr) -> Result<(), Error> {
        let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(address))
            .await
            .map_err(|_| Error::ChannelStopped)??;
        self.establish(stream, true).await
    }

    /// Handshake, attach the session and register the channel.
    async fn establish(self: &Arc<Self>, mut stream: TcpStream, outbound: bool) -> Result<(), Error> {
        let peer = stream.peer_addr()?;
        let handshake = perform_handshake(
            &mut stream,
            self.settings.magic,
            self.local_version(peer),
            self.nonce,
            outbound,
        )
        .await?;

        info!(
            "{} channel [{}] services {:#x} height {}",
            if outbound { "outbound" } else { "inbound" },
            peer,
            handshake.peer_version.services,
            handshake.peer_version.start_height,
        );

        let node = self.clone();
        let channel = run_channel(
            stream,
            self.settings.magic,
            handshake,
            outbound,
            |channel| node.attach_session(channel),
        )
        .await;

        self.register(channel);
        Ok(())
    }

    fn local_version(&self, peer: SocketAddr) -> VersionMessage {
        let sender = match self.settings.self_address {
            Some(address) => NetAddress::new(address, self.settings.services, 0),
            None => NetAddress::unspecified(),
        };
        VersionMessage {
            version: PROTOCOL_MAXIMUM,
            services: self.settings.services,
            timestamp: unix_now() as u64,
            receiver: NetAddress::new(peer, 0, 0),
            sender,
            nonce: self.nonce,
            user_agent: self.settings.user_agent.clone(),
            start_height: self.tracker.get_top_height() as u32,
            relay: true,
        }
    }

    /// Install the protocol stack on a fresh channel: ping, reject when
    /// negotiated, address exchange, header sync, and pin sync when the
    /// peer advertises the bit.
    fn attach_session(self: &Arc<Self>, channel: &Arc<Channel>) {
        channel.attach(Arc::new(PingProtocol::new(channel.negotiated_version())));

        if channel.negotiated_version() >= crate::message::VERSION_BIP61 {
            channel.attach(Arc::new(RejectProtocol));
        }

        channel.attach(Arc::new(AddressProtocol::new(self.clone())));
        channel.attach(Arc::new(HeaderSyncProtocol::new(self.tracker.clone())));

        if channel.peer_version().has_pin_service() {
            channel.attach_pin_sync(Arc::new(PinSyncProtocol::new(
                self.tracker.clone(),
                self.pins.clone(),
            )));
        }
    }

    fn register(&self, channel: Arc<Channel>) {
        let mut channels = self.channels.write();
        channels.retain(|existing| !existing.is_stopped());
        channels.push(channel);
    }

    /// Snapshot of the live channels
    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.channels
            .read()
            .iter()
            .filter(|channel| !channel.is_stopped())
            .cloned()
            .collect()
    }

    /// Live channels whose peer advertises the pin service bit
    pub fn pin_capable_channels(&self) -> Vec<Arc<Channel>> {
        self.channels()
            .into_iter()
            .filter(|channel| channel.peer_version().has_pin_service())
            .collect()
    }

    /// Count live channels advertising every bit in `services`
    pub fn connection_count(&self, services: u64) -> usize {
        self.channels()
            .iter()
            .filter(|channel| channel.peer_services() & services == services)
            .count()
    }

    /// Count ring addresses advertising every bit in `services`
    pub fn address_count(&self, services: u64) -> usize {
        self.peers
            .read()
            .entries
            .iter()
            .filter(|address| address.has_services(services))
            .count()
    }

    /// Ring addresses advertising every bit in `services`
    pub fn fetch_addresses(&self, services: u64) -> Vec<NetAddress> {
        self.peers
            .read()
            .entries
            .iter()
            .filter(|address| address.has_services(services))
            .copied()
            .collect()
    }

    /// True when a live channel already points at this endpoint
    pub fn connected(&self, address: &NetAddress) -> bool {
        let target = address.socket_addr();
        self.channels()
            .iter()
            .any(|channel| channel.peer_address() == target)
    }

    /// Store a batch of gossiped addresses, subsampled.
    ///
    /// Accept between one and all of the batch up to capacity, but always
    /// at least what we are short; the batch is then strided so a peer
    /// cannot force its whole list in.
    pub fn store(&self, addresses: &[NetAddress]) {
        if addresses.is_empty() || self.is_stopped() {
            return;
        }

        let mut peers = self.peers.write();
        let capacity = peers.capacity;
        let usable = addresses.len().min(capacity);
        let random = rand::thread_rng().gen_range(1..=usable.max(1));
        let gap = capacity.saturating_sub(peers.entries.len());
        let accept = gap.max(random);
        let step = (usable / accept).max(1);

        let mut accepted = 0usize;
        let mut index = 0usize;
        while index < usable {
            let address = &addresses[index];
            if address.is_valid() && !peers.contains(address) {
                peers.push(*address);
                accepted += 1;
            }
            index = index.saturating_add(step);
        }

        debug!("accepted {} of {} gossiped address(es)", accepted, addresses.len());
    }

    /// Pick an address to dial, biased toward pin-capable hosts while we
    /// are short of them.
    pub fn fetch_address(&self) -> Option<NetAddress> {
        let dice: usize = rand::thread_rng().gen_range(0..=3);
        let half_target = self.settings.outbound_connections / 2;

        if self.connection_count(SERVICE_PIN) < half_target
            && dice + self.connection_count(SERVICE_NODE_NETWORK) > half_target
        {
            let pin_hosts = self.fetch_addresses(SERVICE_PIN);
            if !pin_hosts.is_empty() {
                let index = rand::thread_rng().gen_range(0..pin_hosts.len());
                debug!("dialing one of {} pin-capable host(s)", pin_hosts.len());
                return Some(pin_hosts[index]);
            }
        }

        // Generic selection: uniform over the ring.
        let peers = self.peers.read();
        if peers.entries.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..peers.entries.len());
        Some(peers.entries[index])
    }

    /// Signal every task and channel to wind down. Idempotent.
    pub fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return true;
        }
        info!("stopping node");
        let _ = self.stop_tx.send(true);
        for channel in self.channels() {
            channel.stop();
        }
        true
    }

    /// Stop and wait for the node's tasks to finish.
    pub async fn close(&self) {
        self.stop();
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::LiteHeader;
    use crate::crypto::{sha256, NO_RETARGET_POW_LIMIT};
    use crate::net::broadcast::Broadcast;
    use async_trait::async_trait;
    use primitive_types::U256;

    struct NullSink;

    #[async_trait]
    impl Broadcast for NullSink {
        async fn broadcast_to_pin_peers(&self, _message: crate::message::Message) -> usize {
            0
        }
    }

    fn test_node(capacity: usize) -> Arc<Node> {
        let sink = Arc::new(NullSink);
        let mut checkpoint = LiteHeader::new(
            1,
            sha256(b"p"),
            sha256(b"m"),
            1_600_000_000,
            NO_RETARGET_POW_LIMIT,
            0,
        );
        checkpoint.height = 0;
        let tracker = Arc::new(ChainTracker::with_retarget(sink.clone(), checkpoint, false));
        let pins = Arc::new(PinStore::new(sink, tracker.clone(), U256::MAX));
        Node::new(
            NodeSettings {
                host_pool_capacity: capacity,
                seeds: Vec::new(),
                inbound_port: 0,
                ..NodeSettings::default()
            },
            tracker,
            pins,
        )
    }

    fn address(last_octet: u8, services: u64) -> NetAddress {
        NetAddress::new(
            format!("10.1.2.{}:29333", last_octet).parse().unwrap(),
            services,
            0,
        )
    }

    #[test]
    fn test_store_deduplicates() {
        let node = test_node(16);
        let batch = vec![address(1, SERVICE_PIN); 4];
        node.store(&batch);
        assert_eq!(node.address_count(0), 1);
        node.store(&batch);
        assert_eq!(node.address_count(0), 1);
    }

    #[test]
    fn test_store_fills_gap_when_empty() {
        let node = test_node(8);
        let batch: Vec<NetAddress> = (1..=8).map(|i| address(i, 0)).collect();
        // Ring empty: gap == capacity, so the whole batch is accepted.
        node.store(&batch);
        assert_eq!(node.address_count(0), 8);
    }

    #[test]
    fn test_ring_capacity_evicts_oldest() {
        let node = test_node(2);
        node.store(&[address(1, 0)]);
        node.store(&[address(2, 0)]);
        node.store(&[address(3, 0)]);
        assert_eq!(node.address_count(0), 2);
        let remaining = node.fetch_addresses(0);
        assert!(remaining.iter().all(|a| a.port == 29333));
        assert!(!remaining
            .iter()
            .any(|a| a.same_endpoint(&address(1, 0))));
    }

    #[test]
    fn test_address_count_filters_services() {
        let node = test_node(16);
        node.store(&[address(1, SERVICE_PIN), address(2, 0)]);
        assert_eq!(node.address_count(SERVICE_PIN), 1);
        assert_eq!(node.address_count(0), 2);
    }

    #[test]
    fn test_fetch_address_empty_ring() {
        let node = test_node(16);
        assert!(node.fetch_address().is_none());
    }

    #[test]
    fn test_fetch_address_returns_known() {
        let node = test_node(16);
        node.store(&[address(1, SERVICE_PIN)]);
        let fetched = node.fetch_address().unwrap();
        assert!(fetched.same_endpoint(&address(1, SERVICE_PIN)));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let node = test_node(16);
        assert!(node.stop());
        assert!(node.stop());
        assert!(node.is_stopped());
    }
}

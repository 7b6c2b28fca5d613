//! A single peer link
//!
//! Each accepted or dialed connection becomes a channel: a framed read
//! loop, a writer task draining a send queue, and an ordered list of
//! protocol instances that receive every decoded message in arrival
//! order. A protocol returning a peer-fatal error stops the channel.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::message::{
    Envelope, Message, VersionMessage, ENVELOPE_SIZE, PROTOCOL_MINIMUM,
};
use crate::sync::PinSyncProtocol;

/// Heartbeat period shared by every attached protocol
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Patience for the version handshake
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const SEND_QUEUE_DEPTH: usize = 64;

/// Per-channel protocol instance.
///
/// Handlers run on the channel's read task, so within one channel they
/// observe messages in arrival order. Returning a peer-fatal error stops
/// the channel.
#[async_trait]
pub trait Protocol: Send + Sync {
    fn name(&self) -> &'static str;

    /// Called once when the channel starts.
    async fn start(&self, _channel: &Arc<Channel>) -> Result<(), Error> {
        Ok(())
    }

    /// Called for every decoded message.
    async fn on_message(&self, _channel: &Arc<Channel>, _message: &Message) -> Result<(), Error> {
        Ok(())
    }

    /// Called on the shared heartbeat tick.
    async fn heartbeat(&self, _channel: &Arc<Channel>) -> Result<(), Error> {
        Ok(())
    }
}

/// One connected peer
pub struct Channel {
    peer_address: SocketAddr,
    outbound: bool,
    magic: u32,
    peer_version: VersionMessage,
    negotiated_version: u32,
    queue: mpsc::Sender<Message>,
    stopped: AtomicBool,
    stop_tx: watch::Sender<bool>,
    protocols: RwLock<Vec<Arc<dyn Protocol>>>,
    pin_sync: RwLock<Option<Arc<PinSyncProtocol>>>,
}

impl Channel {
    pub fn peer_address(&self) -> SocketAddr {
        self.peer_address
    }

    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    /// The version message the peer introduced itself with
    pub fn peer_version(&self) -> &VersionMessage {
        &self.peer_version
    }

    /// min(our maximum, peer's version)
    pub fn negotiated_version(&self) -> u32 {
        self.negotiated_version
    }

    /// Peer's advertised services
    pub fn peer_services(&self) -> u64 {
        self.peer_version.services
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Queue a message for the writer task. Returns immediately once
    /// queued; delivery is asynchronous.
    pub async fn send(&self, message: Message) -> Result<(), Error> {
        if self.is_stopped() {
            return Err(Error::ChannelStopped);
        }
        self.queue
            .send(message)
            .await
            .map_err(|_| Error::ChannelStopped)
    }

    /// Signal the read loop and writer task to wind down. Idempotent.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            debug!("stopping channel [{}]", self.peer_address);
            let _ = self.stop_tx.send(true);
        }
    }

    /// Attach a protocol; it will see every subsequent message.
    pub fn attach(&self, protocol: Arc<dyn Protocol>) {
        self.protocols.write().push(protocol);
    }

    /// Attach the pin-sync instance, kept addressable for object routing.
    pub fn attach_pin_sync(&self, protocol: Arc<PinSyncProtocol>) {
        *self.pin_sync.write() = Some(protocol.clone());
        self.attach(protocol);
    }

    pub fn pin_sync(&self) -> Option<Arc<PinSyncProtocol>> {
        self.pin_sync.read().clone()
    }

    fn detach_all(&self) {
        self.protocols.write().clear();
        *self.pin_sync.write() = None;
    }

    fn snapshot_protocols(&self) -> Vec<Arc<dyn Protocol>> {
        self.protocols.read().clone()
    }
}

/// Write one framed message to the stream.
async fn write_frame<W: AsyncWriteExt + Unpin>(
    stream: &mut W,
    magic: u32,
    message: &Message,
) -> Result<(), Error> {
    let wire = message.to_wire(magic);
    stream.write_all(&wire).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one framed message. Unknown commands yield `None`.
async fn read_frame<R: AsyncReadExt + Unpin>(
    stream: &mut R,
    magic: u32,
) -> Result<Option<(String, Message)>, Error> {
    let mut envelope_bytes = [0u8; ENVELOPE_SIZE];
    stream.read_exact(&mut envelope_bytes).await?;
    let envelope = Envelope::parse(&envelope_bytes, magic)?;

    let mut payload = vec![0u8; envelope.payload_length];
    stream.read_exact(&mut payload).await?;
    envelope.verify_payload(&payload)?;

    let command = envelope.command_str().to_string();
    Ok(Message::decode_payload(&command, &payload)?.map(|message| (command, message)))
}

/// Outcome of the version handshake
pub struct Handshake {
    pub peer_version: VersionMessage,
    pub negotiated_version: u32,
}

/// Exchange version/verack on a fresh stream.
///
/// `our_nonce` detects self-connections: a peer introducing itself with
/// our own nonce is us.
pub async fn perform_handshake(
    stream: &mut TcpStream,
    magic: u32,
    our_version: VersionMessage,
    our_nonce: u64,
    outbound: bool,
) -> Result<Handshake, Error> {
    let our_maximum = our_version.version;

    let exchange = async {
        if outbound {
            write_frame(stream, magic, &Message::Version(our_version.clone())).await?;
        }

        let mut peer_version: Option<VersionMessage> = None;
        let mut acked = false;

        while peer_version.is_none() || !acked {
            let frame = read_frame(stream, magic).await?;
            match frame {
                Some((_, Message::Version(version))) => {
                    if version.nonce == our_nonce {
                        return Err(Error::AddressInUse);
                    }
                    if version.version < PROTOCOL_MINIMUM {
                        return Err(Error::BadStream);
                    }
                    if !outbound {
                        write_frame(stream, magic, &Message::Version(our_version.clone())).await?;
                    }
                    write_frame(stream, magic, &Message::Verack).await?;
                    peer_version = Some(version);
                }
                Some((_, Message::Verack)) => {
                    acked = true;
                }
                Some((command, _)) => {
                    debug!("ignoring {} during handshake", command);
                }
                None => {}
            }
        }

        let peer_version = peer_version.ok_or(Error::BadStream)?;
        let negotiated_version = our_maximum.min(peer_version.version);
        Ok(Handshake {
            peer_version,
            negotiated_version,
        })
    };

    tokio::time::timeout(HANDSHAKE_TIMEOUT, exchange)
        .await
        .map_err(|_| Error::ChannelStopped)?
}

/// Build a channel from a handshaken stream and run its read loop until
/// stop or error. Protocols must be attached by `on_ready` before any
/// message is dispatched.
pub async fn run_channel<F>(
    stream: TcpStream,
    magic: u32,
    handshake: Handshake,
    outbound: bool,
    on_ready: F,
) -> Arc<Channel>
where
    F: FnOnce(&Arc<Channel>),
{
    let peer_address = stream
        .peer_addr()
        .unwrap_or_else(|_| "0.0.0.0:0".parse().expect("literal address"));
    let (read_half, write_half) = stream.into_split();
    let (queue_tx, queue_rx) = mpsc::channel(SEND_QUEUE_DEPTH);
    let (stop_tx, stop_rx) = watch::channel(false);

    let channel = Arc::new(Channel {
        peer_address,
        outbound,
        magic,
        peer_version: handshake.peer_version,
        negotiated_version: handshake.negotiated_version,
        queue: queue_tx,
        stopped: AtomicBool::new(false),
        stop_tx,
        protocols: RwLock::new(Vec::new()),
        pin_sync: RwLock::new(None),
    });

    on_ready(&channel);

    tokio::spawn(writer_task(
        write_half,
        magic,
        queue_rx,
        stop_rx.clone(),
        peer_address,
    ));
    tokio::spawn(read_loop(channel.clone(), read_half, stop_rx));

    channel
}

async fn writer_task(
    mut write_half: OwnedWriteHalf,
    magic: u32,
    mut queue: mpsc::Receiver<Message>,
    mut stop: watch::Receiver<bool>,
    peer: SocketAddr,
) {
    loop {
        tokio::select! {
            message = queue.recv() => {
                let message = match message {
                    Some(message) => message,
                    None => break,
                };
                if let Err(error) = write_frame(&mut write_half, magic, &message).await {
                    warn!("send to [{}] failed: {}", peer, error);
                    break;
                }
            }
            _ = stop.changed() => {
                if *stop.borrow() {
                    break;
                }
            }
        }
    }
    let _ = write_half.shutdown().await;
}

/// Decode frames off the socket into a queue. A frame read is not
/// cancellation-safe, so it lives in its own task; the dispatch loop
/// selects on the (cancel-safe) queue instead.
async fn frame_reader(
    mut read_half: OwnedReadHalf,
    magic: u32,
    frames: mpsc::Sender<Message>,
    mut stop: watch::Receiver<bool>,
) -> Result<(), Error> {
    loop {
        tokio::select! {
            frame = read_frame(&mut read_half, magic) => {
                match frame? {
                    Some((_, message)) => {
                        if frames.send(message).await.is_err() {
                            return Ok(());
                        }
                    }
                    None => {} // command we do not speak
                }
            }
            _ = stop.changed() => {
                if *stop.borrow() {
                    return Ok(());
                }
            }
        }
    }
}

async fn read_loop(channel: Arc<Channel>, read_half: OwnedReadHalf, mut stop: watch::Receiver<bool>) {
    let magic = channel.magic;
    let peer = channel.peer_address;

    for protocol in channel.snapshot_protocols() {
        if let Err(error) = protocol.start(&channel).await {
            warn!("protocol {} failed to start on [{}]: {}", protocol.name(), peer, error);
            channel.stop();
        }
    }

    let (frames_tx, mut frames_rx) = mpsc::channel(SEND_QUEUE_DEPTH);
    let reader = tokio::spawn(frame_reader(read_half, magic, frames_tx, stop.clone()));

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick of a tokio interval fires immediately; consume it.
    heartbeat.tick().await;

    while !channel.is_stopped() {
        tokio::select! {
            message = frames_rx.recv() => {
                let message = match message {
                    Some(message) => message,
                    None => {
                        info!("channel [{}] closed", peer);
                        break;
                    }
                };
                for protocol in channel.snapshot_protocols() {
                    if let Err(error) = protocol.on_message(&channel, &message).await {
                        if error.is_peer_fatal() {
                            warn!(
                                "protocol {} dropping [{}]: {}",
                                protocol.name(),
                                peer,
                                error
                            );
                            channel.stop();
                        } else {
                            debug!("protocol {} on [{}]: {}", protocol.name(), peer, error);
                        }
                    }
                }
            }
            _ = heartbeat.tick() => {
                for protocol in channel.snapshot_protocols() {
                    if let Err(error) = protocol.heartbeat(&channel).await {
                        debug!("heartbeat {} on [{}]: {}", protocol.name(), peer, error);
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

    channel.stop();
    channel.detach_all();
    reader.abort();
    debug!("read loop for [{}] finished", peer);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{NetAddress, PROTOCOL_MAXIMUM, SERVICE_PIN};
    use crate::message::MAGIC_MAINNET;
    use tokio::net::TcpListener;

    fn version(nonce: u64, services: u64) -> VersionMessage {
        VersionMessage {
            version: PROTOCOL_MAXIMUM,
            services,
            timestamp: 0,
            receiver: NetAddress::unspecified(),
            sender: NetAddress::unspecified(),
            nonce,
            user_agent: "/pinnet-test/".into(),
            start_height: 0,
            relay: true,
        }
    }

    #[tokio::test]
    async fn test_handshake_both_sides() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            perform_handshake(&mut stream, MAGIC_MAINNET, version(2, SERVICE_PIN), 2, false).await
        });

        let mut client = TcpStream::connect(address).await.unwrap();
        let client_side =
            perform_handshake(&mut client, MAGIC_MAINNET, version(1, 0), 1, true).await;

        let server_side = server.await.unwrap();
        let client_side = client_side.unwrap();
        let server_side = server_side.unwrap();

        assert_eq!(client_side.peer_version.nonce, 2);
        assert_eq!(server_side.peer_version.nonce, 1);
        assert!(client_side.peer_version.has_pin_service());
        assert_eq!(client_side.negotiated_version, PROTOCOL_MAXIMUM);
    }

    #[tokio::test]
    async fn test_handshake_detects_self_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            perform_handshake(&mut stream, MAGIC_MAINNET, version(7, 0), 7, false).await
        });

        let mut client = TcpStream::connect(address).await.unwrap();
        // Same nonce on both ends: we dialed ourselves.
        let _ = perform_handshake(&mut client, MAGIC_MAINNET, version(7, 0), 7, true).await;
        let server_side = server.await.unwrap();
        assert!(matches!(server_side, Err(Error::AddressInUse)));
    }
}

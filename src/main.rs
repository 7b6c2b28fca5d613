//! Pinnet node
//!
//! Rides the host chain's P2P network, keeps the pin store synchronized,
//! and optionally submits a freshly mined pin read from stdin.

use std::io::IsTerminal;
use std::io::Read;
use std::net::{IpAddr, SocketAddr};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};

use pinnet::chain::{last_checkpoint, ChainTracker};
use pinnet::message::{Message, ObjectPayload};
use pinnet::mining::Miner;
use pinnet::net::{guess_external_ip, Broadcast, Broadcaster, Node, NodeSettings};
use pinnet::pinboard::PinStore;

#[derive(Parser, Debug)]
#[command(name = "pinnet")]
#[command(about = "Proof-of-work pinboard riding the Litecoin P2P network", long_about = None)]
struct Args {
    /// Synchronize, print every stored pin, and exit
    #[arg(short, long)]
    print: bool,

    /// Mine and broadcast a message read from stdin, then exit
    #[arg(short, long)]
    submit: bool,

    /// Inbound port for p2p communication
    #[arg(short, long, default_value_t = pinnet::constants::INBOUND_PORT)]
    inbound_port: u16,

    /// Maintain at most this many inbound p2p connections
    #[arg(long, default_value_t = 16)]
    max_inbound: usize,

    /// Maintain at most this many outbound p2p connections
    #[arg(long, default_value_t = 16)]
    max_outbound: usize,

    /// Store at most this many peer addresses
    #[arg(long, default_value_t = 256_000)]
    max_addresses: usize,

    /// Peers to connect to, host:port (repeatable)
    #[arg(long)]
    connect_to: Vec<SocketAddr>,

    /// Advertise this external IP instead of guessing
    #[arg(long)]
    set_ip: Option<IpAddr>,

    /// Do not ask the host network's DNS seeds for peers
    #[arg(long)]
    dont_use_seeds: bool,

    /// Do not guess the external IP
    #[arg(long)]
    dont_guess_ip: bool,
}

fn settings_from(args: &Args) -> NodeSettings {
    let mut settings = NodeSettings {
        inbound_port: args.inbound_port,
        inbound_connections: args.max_inbound,
        outbound_connections: args.max_outbound,
        host_pool_capacity: args.max_addresses,
        connect_peers: args.connect_to.clone(),
        ..NodeSettings::default()
    };

    if args.dont_use_seeds {
        settings.seeds.clear();
    }

    if settings.inbound_connections > 0 {
        if let Some(ip) = args.set_ip {
            settings.self_address = Some(SocketAddr::new(ip, settings.inbound_port));
        } else if !args.dont_guess_ip {
            match guess_external_ip() {
                Some(ip) => settings.self_address = Some(SocketAddr::new(ip, settings.inbound_port)),
                None => {
                    error!("failed to guess the external ip; turning off inbound connections");
                    settings.inbound_connections = 0;
                }
            }
        }
    }

    settings
}

fn read_submission() -> Result<Vec<u8>, String> {
    if std::io::stdin().is_terminal() {
        return Err("--submit used but there is no message on stdin".into());
    }

    let mut body = String::new();
    std::io::stdin()
        .read_to_string(&mut body)
        .map_err(|error| format!("reading stdin: {}", error))?;
    let body = body.trim_end_matches('\n').to_string();

    if body.is_empty() {
        return Err("--submit used but the message is empty".into());
    }

    Ok(body.into_bytes())
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let args = Args::parse();

    let submission = if args.submit {
        match read_submission() {
            Ok(body) => Some(body),
            Err(message) => {
                eprintln!("error: {}", message);
                return ExitCode::FAILURE;
            }
        }
    } else {
        None
    };

    let settings = settings_from(&args);

    let checkpoint = match last_checkpoint() {
        Ok(checkpoint) => checkpoint,
        Err(error) => {
            error!("checkpoint verification failed: {}", error);
            return ExitCode::FAILURE;
        }
    };
    info!(
        "checkpoint {} at height {}",
        checkpoint.hash(),
        checkpoint.height
    );

    let broadcaster = Arc::new(Broadcaster::new());
    let tracker = Arc::new(ChainTracker::new(broadcaster.clone(), checkpoint));
    let pins = Arc::new(PinStore::new(
        broadcaster.clone(),
        tracker.clone(),
        pinnet::constants::min_target(),
    ));

    let node = Node::new(settings, tracker.clone(), pins.clone());
    broadcaster.link_to_node(&node);

    tokio::spawn(pins.clone().run_sweeper(node.stop_signal()));

    if let Err(error) = node.start().await {
        error!("node failed to start: {}", error);
        return ExitCode::FAILURE;
    }

    let mut exit = ExitCode::SUCCESS;

    if args.print {
        tokio::time::sleep(Duration::from_secs(30)).await;
        println!("{}", pins.dump());
        if !args.submit {
            node.close().await;
            info!("shutdown complete");
            return exit;
        }
    }

    if let Some(body) = submission {
        while !tracker.is_synchronized() {
            info!("waiting for header sync ...");
            tokio::time::sleep(Duration::from_secs(10)).await;
        }

        info!("starting miner ...");
        let miner = Miner::new(tracker.clone());
        let mut payload = ObjectPayload::from_body(body);
        let target = pinnet::constants::min_target();

        let mined = tokio::task::spawn_blocking(move || {
            miner.mine(&mut payload, target).map(|_| payload)
        })
        .await;

        match mined {
            Ok(Ok(payload)) => {
                info!(
                    "mined pin {} (nonce {}, work {})",
                    payload.get_id(),
                    payload.nonce(),
                    payload.get_work_done()
                );
                info!("pin bytes: {}", hex::encode(payload.to_bytes()));

                info!("broadcasting ...");
                let reached = broadcaster
                    .broadcast_to_pin_peers(Message::Object(payload))
                    .await;
                if reached == 0 {
                    warn!("broadcast reached no pin-capable peers");
                    exit = ExitCode::FAILURE;
                } else {
                    info!("broadcast reached {} peer(s)", reached);
                }
            }
            Ok(Err(error)) => {
                error!("mining failed: {}", error);
                exit = ExitCode::FAILURE;
            }
            Err(error) => {
                error!("mining task panicked: {}", error);
                exit = ExitCode::FAILURE;
            }
        }

        node.close().await;
        info!("shutdown complete");
        return exit;
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("interrupt received, shutting down"),
        Err(error) => error!("signal handler failed: {}", error),
    }
    node.close().await;
    info!("shutdown complete");
    exit
}

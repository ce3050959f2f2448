//! Interactive PeerLink peer
//!
//! Registers with a rendezvous server and chats with one remote peer over a
//! WebRTC data channel.
//!
//! # Usage
//!
//! ```bash
//! # Announce as "alice" and wait for requests
//! cargo run --bin peerlink-peer -- --name alice --auto-accept
//!
//! # Announce as "bob" and call alice right away
//! cargo run --bin peerlink-peer -- \
//!   --rendezvous-url http://localhost:3479 \
//!   --name bob \
//!   --connect user-1700000000000-alice
//! ```
//!
//! Commands read from stdin: `/peers`, `/connect <peer-id>`, `/accept`,
//! `/reject`, `/disconnect`, `/quit`. Any other line is sent as a message.
//!
//! Without a shared rendezvous, peers can connect by manual exchange:
//! one side runs `/offer` and passes the printed blob over any channel, the
//! other side runs `/answer <blob>` and passes its answer back, and the first
//! side finishes with `/complete <blob>`.

use anyhow::Context;
use clap::Parser;
use parking_lot::Mutex;
use peerlink_rendezvous::RendezvousClient;
use peerlink_webrtc::{
    ConnectionEvent, ConnectionRequest, PeerClient, PeerConfig, SignalRelay, TurnServerConfig,
    WebRtcTransportFactory,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// PeerLink peer
///
/// Peer-to-peer chat over WebRTC with rendezvous-based signaling.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Rendezvous server base URL
    #[arg(
        long,
        default_value = "http://localhost:3479",
        env = "PEERLINK_RENDEZVOUS_URL"
    )]
    rendezvous_url: String,

    /// Display name announced to other peers
    #[arg(short, long, env = "PEERLINK_NAME")]
    name: String,

    /// Fixed peer id (default: user-<epoch-ms>-<name>)
    #[arg(long, env = "PEERLINK_PEER_ID")]
    peer_id: Option<String>,

    /// STUN servers (comma-separated)
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "stun:stun.l.google.com:19302",
        env = "PEERLINK_STUN_SERVERS"
    )]
    stun_servers: Vec<String>,

    /// TURN servers (format: turn:host:port:username:credential, comma-separated)
    #[arg(long, value_delimiter = ',', env = "PEERLINK_TURN_SERVERS")]
    turn_servers: Vec<String>,

    /// Mailbox poll interval in milliseconds
    #[arg(long, default_value_t = 2000, env = "PEERLINK_POLL_INTERVAL_MS")]
    poll_interval_ms: u64,

    /// Maximum reconnection attempts before giving up
    #[arg(long, default_value_t = 30, env = "PEERLINK_MAX_RECONNECT_ATTEMPTS")]
    max_reconnect_attempts: u32,

    /// Offer a connection to this peer id after startup
    #[arg(long)]
    connect: Option<String>,

    /// Accept incoming requests without asking
    #[arg(long, default_value_t = false)]
    auto_accept: bool,
}

/// Parse `turn:host:port:username:credential`
///
/// The URL part keeps its scheme and port; username and credential are the
/// last two colon-separated fields.
fn parse_turn_server(s: &str) -> anyhow::Result<TurnServerConfig> {
    let mut parts = s.rsplitn(3, ':');
    let credential = parts.next().unwrap_or_default();
    let username = parts.next().unwrap_or_default();
    let url = parts.next().unwrap_or_default();

    if url.is_empty() || username.is_empty() || credential.is_empty() {
        anyhow::bail!(
            "invalid TURN server '{}', expected turn:host:port:username:credential",
            s
        );
    }

    Ok(TurnServerConfig {
        url: url.to_string(),
        username: username.to_string(),
        credential: credential.to_string(),
    })
}

fn build_config(args: &Args) -> anyhow::Result<PeerConfig> {
    let mut config = PeerConfig::new(&args.rendezvous_url, &args.name);
    config.peer_id = args.peer_id.clone();
    config.stun_servers = args.stun_servers.clone();
    config.turn_servers = args
        .turn_servers
        .iter()
        .map(|s| parse_turn_server(s))
        .collect::<anyhow::Result<Vec<_>>>()?;
    config.poll_interval_ms = args.poll_interval_ms;
    config.max_reconnect_attempts = args.max_reconnect_attempts;

    config.validate()?;
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .thread_name("peerlink-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args))
}

async fn async_main(args: Args) -> anyhow::Result<()> {
    init_tracing();

    let mut config = build_config(&args)?;
    let relay = Arc::new(
        RendezvousClient::new(&config.rendezvous_url).context("invalid rendezvous URL")?,
    );

    match SignalRelay::ice_servers(relay.as_ref()).await {
        Ok(servers) => config.merge_ice_servers(&servers),
        Err(e) => warn!(error = %e, "Could not fetch ICE servers from rendezvous, using local list"),
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        rendezvous_url = %config.rendezvous_url,
        name = %config.display_name,
        stun_servers = ?config.stun_servers,
        turn_servers = config.turn_servers.len(),
        "PeerLink peer starting"
    );

    let factory = Arc::new(WebRtcTransportFactory::new(&config));
    let client = PeerClient::start(config, factory, relay)
        .await
        .context("failed to start peer")?;

    println!("Registered as {}", client.peer_id());

    let pending: Arc<Mutex<Option<ConnectionRequest>>> = Arc::new(Mutex::new(None));
    let printer = spawn_event_printer(Arc::clone(&client), Arc::clone(&pending), args.auto_accept);

    if let Some(remote) = &args.connect {
        if let Err(e) = client.connect(remote).await {
            eprintln!("connect failed: {}", e);
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };

        let Some(line) = line else {
            break;
        };

        if !run_command(&client, &pending, line.trim()).await {
            break;
        }
    }

    client.shutdown().await;
    printer.abort();
    info!("PeerLink peer stopped");

    Ok(())
}

/// Execute one input line; returns false when the user quits
async fn run_command(
    client: &PeerClient,
    pending: &Mutex<Option<ConnectionRequest>>,
    line: &str,
) -> bool {
    let (command, argument) = match line.split_once(' ') {
        Some((command, argument)) => (command, argument.trim()),
        None => (line, ""),
    };

    let outcome = match command {
        "" => Ok(()),
        "/quit" => return false,
        "/peers" => client.peers().await.map(|peers| {
            if peers.is_empty() {
                println!("No other peers online");
            }
            for peer in peers {
                println!("  {}  ({})", peer.peer_id, peer.name);
            }
        }),
        "/connect" if argument.is_empty() => {
            println!("usage: /connect <peer-id>");
            Ok(())
        }
        "/connect" => client.connect(argument).await,
        "/accept" => {
            let request = pending.lock().take();
            match request {
                Some(request) => client.accept(&request).await,
                None => {
                    println!("No pending request");
                    Ok(())
                }
            }
        }
        "/reject" => {
            let request = pending.lock().take();
            match request {
                Some(request) => client.reject(&request),
                None => println!("No pending request"),
            }
            Ok(())
        }
        "/disconnect" => {
            client.disconnect().await;
            Ok(())
        }
        "/offer" => client.create_manual_offer().await.map(|offer| match offer {
            Some(blob) => println!("Send this offer to your peer:\n{}", blob),
            None => println!("Offer abandoned"),
        }),
        "/answer" if argument.is_empty() => {
            println!("usage: /answer <offer-blob>");
            Ok(())
        }
        "/answer" => client.accept_manual_offer(argument).await.map(|answer| match answer {
            Some(blob) => println!("Send this answer back to the offering peer:\n{}", blob),
            None => println!("Answer abandoned"),
        }),
        "/complete" if argument.is_empty() => {
            println!("usage: /complete <answer-blob>");
            Ok(())
        }
        "/complete" => client.complete_manual_exchange(argument).await,
        _ => client.send_message(line).await.map(|_| ()),
    };

    if let Err(e) = outcome {
        if e.is_terminal() {
            eprintln!("error: {} (use /connect to start over)", e);
        } else if e.is_retryable() {
            eprintln!("error: {} (try again shortly)", e);
        } else {
            eprintln!("error: {}", e);
        }
    }

    true
}

fn spawn_event_printer(
    client: Arc<PeerClient>,
    pending: Arc<Mutex<Option<ConnectionRequest>>>,
    auto_accept: bool,
) -> tokio::task::JoinHandle<()> {
    let mut events = client.subscribe();

    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event printer lagged");
                    continue;
                }
                Err(_) => break,
            };

            match event {
                ConnectionEvent::IncomingRequest(request) if auto_accept => {
                    println!("Accepting request from {}", request.from);
                    if let Err(e) = client.accept(&request).await {
                        eprintln!("accept failed: {}", e);
                    }
                }
                ConnectionEvent::IncomingRequest(request) => {
                    println!(
                        "{} wants to connect. Type /accept or /reject",
                        request.from
                    );
                    *pending.lock() = Some(request);
                }
                ConnectionEvent::StateChanged(state) => println!("[{}]", state),
                ConnectionEvent::ChannelOpen { remote_peer_id } => {
                    println!("Connected to {}", remote_peer_id)
                }
                ConnectionEvent::ChannelClosed { remote_peer_id } => {
                    println!("Channel to {} closed", remote_peer_id)
                }
                ConnectionEvent::Message(message) if message.is_system() => {
                    println!("* {}", message.content)
                }
                ConnectionEvent::Message(message) => {
                    println!("<{}> {}", message.sender, message.content)
                }
                ConnectionEvent::Reconnecting { attempt } => {
                    println!("Connection lost, reconnecting (attempt {})", attempt)
                }
                ConnectionEvent::Failed {
                    remote_peer_id,
                    reason,
                } => println!("Connection to {} failed: {}", remote_peer_id, reason),
            }
        }
    })
}

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,peerlink=info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

//! P2P Peer Node
//!
//! Runs one multiplexer endpoint over UDP:
//! - Server mode (default): accepts connections and echoes every payload
//!   back on the channel it arrived on
//! - Client mode (`--connect`): connects to one peer, sends `--message`,
//!   waits for the echo, then disconnects
//!
//! SIGINT/SIGTERM disconnect every peer and exit once the deferred session
//! closes have run.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::{Events, Interest, Poll, Token};
use p2p_mux::{Engine, Notification, PeerId, Role, TransportConfig};
use peer_node::UdpSubstrate;
use ring::rand::{SecureRandom, SystemRandom};

// ============================================================================
// Constants
// ============================================================================

/// Default bind address
const DEFAULT_BIND: &str = "0.0.0.0:7400";

/// Default client payload
const DEFAULT_MESSAGE: &str = "hello";

/// mio token for the UDP socket
const SOCKET_TOKEN: Token = Token(0);

/// Upper bound on a single poll, so signals are noticed promptly
const MAX_POLL_TIMEOUT: Duration = Duration::from_millis(100);

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();

    // --bind <addr:port>      Local UDP address
    // --id <hex>              Local peer id (random if omitted)
    // --config <path>         Transport config JSON
    // --peer <hex>@<addr>     Directory entry (repeatable)
    // --connect <hex>@<addr>  Client mode: peer to connect to
    // --message <text>        Client mode: payload to send

    let bind: SocketAddr = parse_arg(&args, "--bind")
        .unwrap_or_else(|| DEFAULT_BIND.to_string())
        .parse()
        .map_err(|_| "Invalid bind address")?;

    let local_id = match parse_arg(&args, "--id") {
        Some(id) => parse_peer_id(&id)?,
        None => random_peer_id()?,
    };

    let config = match parse_arg(&args, "--config") {
        Some(path) => TransportConfig::from_file(&path)?,
        None => TransportConfig::default(),
    };

    let target = parse_arg(&args, "--connect")
        .map(|s| parse_peer_entry(&s))
        .transpose()?;
    let message = parse_arg(&args, "--message").unwrap_or_else(|| DEFAULT_MESSAGE.to_string());

    let role = if target.is_some() {
        Role::Client
    } else {
        Role::Server
    };

    log::info!("P2P peer node starting...");
    log::info!("  Id:       {}", local_id);
    log::info!("  Bind:     {}", bind);
    log::info!("  Role:     {:?}", role);
    log::info!("  Channels: {:?}", config.channels);

    let mut substrate = UdpSubstrate::bind(bind, local_id)?;
    for entry in parse_all(&args, "--peer") {
        let (peer, addr) = parse_peer_entry(&entry)?;
        substrate.add_peer(peer, addr);
    }
    if let Some((peer, addr)) = target {
        substrate.add_peer(peer, addr);
    }

    let engine = Engine::new(substrate, role, &config)?;
    let mut node = PeerNode::new(engine, target.map(|(peer, _)| peer), message.into_bytes())?;
    node.run()
}

fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

/// Every value given for a repeatable flag
fn parse_all(args: &[String], flag: &str) -> Vec<String> {
    args.windows(2)
        .filter(|w| w[0] == flag)
        .map(|w| w[1].clone())
        .collect()
}

fn parse_peer_id(s: &str) -> Result<PeerId, Box<dyn std::error::Error>> {
    let hex = s.trim_start_matches("0x");
    let id = u64::from_str_radix(hex, 16).map_err(|_| format!("Invalid peer id: {}", s))?;
    Ok(PeerId(id))
}

/// `<hex id>@<addr:port>`
fn parse_peer_entry(s: &str) -> Result<(PeerId, SocketAddr), Box<dyn std::error::Error>> {
    let (id, addr) = s
        .split_once('@')
        .ok_or_else(|| format!("Expected <id>@<addr>, got {}", s))?;
    let addr: SocketAddr = addr
        .parse()
        .map_err(|_| format!("Invalid peer address: {}", addr))?;
    Ok((parse_peer_id(id)?, addr))
}

fn random_peer_id() -> Result<PeerId, Box<dyn std::error::Error>> {
    let rng = SystemRandom::new();
    let mut bytes = [0u8; PeerId::LEN];
    rng.fill(&mut bytes)
        .map_err(|_| "Failed to generate peer id")?;
    Ok(PeerId::from_be_bytes(bytes))
}

// ============================================================================
// Peer Node
// ============================================================================

struct PeerNode {
    /// mio poll instance
    poll: Poll,
    engine: Engine<UdpSubstrate>,
    /// Client mode: peer to connect to
    target: Option<PeerId>,
    /// Client mode: payload to send once connected
    message: Vec<u8>,
    /// Client finished (echo received or connection failed)
    done: bool,
    /// Set by SIGINT/SIGTERM
    terminate: Arc<AtomicBool>,
    shutting_down: bool,
}

impl PeerNode {
    fn new(
        mut engine: Engine<UdpSubstrate>,
        target: Option<PeerId>,
        message: Vec<u8>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let poll = Poll::new()?;
        poll.registry().register(
            engine.substrate_mut().socket_mut(),
            SOCKET_TOKEN,
            Interest::READABLE,
        )?;

        let terminate = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&terminate))?;
        signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&terminate))?;

        Ok(PeerNode {
            poll,
            engine,
            target,
            message,
            done: false,
            terminate,
            shutting_down: false,
        })
    }

    fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(target) = self.target {
            self.engine.connect(target)?;
        }

        let mut events = Events::with_capacity(64);
        let mut notifications: Vec<Notification> = Vec::new();

        loop {
            // Wake for the earliest engine task or substrate timeout
            let timeout = self.poll_timeout(Instant::now());
            self.poll.poll(&mut events, Some(timeout))?;

            for event in events.iter() {
                if event.token() == SOCKET_TOKEN {
                    self.engine.substrate_mut().receive_all()?;
                }
            }

            let now = Instant::now();
            self.engine.substrate_mut().check_timeouts(now);
            self.engine.pump_at(&mut notifications, now);

            for notification in notifications.drain(..) {
                self.handle(notification);
            }

            if self.terminate.load(Ordering::Relaxed) && !self.shutting_down {
                log::info!("Signal received, disconnecting");
                self.engine.shutdown();
                self.shutting_down = true;
            }

            if (self.shutting_down || self.done) && self.is_idle() {
                break;
            }
        }

        log::info!("Stats:\n{}", self.engine.stats().render());
        log::info!("Peer node stopped");
        Ok(())
    }

    fn poll_timeout(&self, now: Instant) -> Duration {
        [
            self.engine.next_deadline(),
            self.engine.substrate().next_timeout(),
        ]
        .into_iter()
        .flatten()
        .min()
        .map(|deadline| deadline.saturating_duration_since(now))
        .unwrap_or(MAX_POLL_TIMEOUT)
        .min(MAX_POLL_TIMEOUT)
    }

    /// No pending closes and no tracked peers left
    fn is_idle(&self) -> bool {
        self.engine.next_deadline().is_none()
            && self.engine.connected_peers().next().is_none()
            && self
                .target
                .map(|t| self.engine.state(t).is_none())
                .unwrap_or(true)
    }

    fn handle(&mut self, notification: Notification) {
        match notification {
            Notification::Connected(peer) => {
                log::info!("Connected: {}", peer);
                if self.target == Some(peer) {
                    match self.engine.send(peer, 0, &self.message) {
                        Ok(true) => log::info!("Sent {} bytes to {}", self.message.len(), peer),
                        Ok(false) => log::warn!("Send to {} rejected", peer),
                        Err(e) => log::warn!("Send to {} failed: {}", peer, e),
                    }
                }
            }
            Notification::Disconnected(peer) => {
                log::info!("Disconnected: {}", peer);
                if self.target == Some(peer) {
                    self.done = true;
                }
            }
            Notification::ConnectionFailed(peer, reason) => {
                log::error!("Connection to {} failed: {}", peer, reason);
                if self.target == Some(peer) {
                    self.done = true;
                }
            }
            Notification::Data {
                peer,
                channel,
                data,
            } => self.on_data(peer, channel, data),
        }
    }

    fn on_data(&mut self, peer: PeerId, channel: u8, data: Vec<u8>) {
        log::info!(
            "{} bytes from {} on channel {}: {}",
            data.len(),
            peer,
            channel,
            String::from_utf8_lossy(&data)
        );

        if self.target == Some(peer) {
            // Echo received, we're finished
            if let Err(e) = self.engine.disconnect(peer) {
                log::warn!("Disconnect from {} failed: {}", peer, e);
            }
            self.done = true;
            return;
        }

        if !self.engine.is_connected(peer) {
            return;
        }
        match self.engine.send(peer, channel, &data) {
            Ok(true) => log::debug!("Echoed {} bytes to {}", data.len(), peer),
            Ok(false) => log::warn!("Echo to {} rejected", peer),
            Err(e) => log::warn!("Echo to {} failed: {}", peer, e),
        }
    }
}

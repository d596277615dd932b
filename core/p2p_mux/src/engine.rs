//! Handshake and dispatch engine
//!
//! Drives the per-peer connection lifecycle from substrate session events
//! and control-channel messages, and forwards application payloads to the
//! handler.
//!
//! # State Machine
//!
//! ```text
//!            connect()                 ACCEPT_CONNECT
//!   Idle ───────────────► AwaitingAccept ─────────────► Established
//!    │                         │                          │      │
//!    │ CONNECT (server)        │ DISCONNECT / failure     │      │ DISCONNECT
//!    └─────────────────────────┼──────────► Established   │      │ disconnect()
//!                              ▼                          │      ▼
//!                            Closed ◄──── failure ────────┘   Closing
//!                              ▲                                 │
//!                              └──────── deferred close ─────────┘
//! ```
//!
//! # Pump Order
//!
//! 1. Prune `Closed` records left by the previous pump
//! 2. Session events queued by the substrate
//! 3. Control channel, drained completely
//! 4. Application channels in index order, each drained completely
//! 5. Due scheduled tasks (deferred close, connect timeout)
//!
//! Tasks run last so any event for a peer in the same pump can cancel them.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use crate::channel::{ChannelError, ChannelRouter};
use crate::config::{AcceptPolicy, ConfigError, TransportConfig};
use crate::control::ControlMessage;
use crate::handler::{ConnectionHandler, FailureReason, HandlerResult};
use crate::scheduler::{Scheduler, TaskKind};
use crate::stats::TransportStats;
use crate::substrate::{PeerId, SessionError, SessionEvent, Substrate};

// ============================================================================
// Roles and States
// ============================================================================

/// Which side of the handshake this engine plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiates a single outgoing connection
    Client,
    /// Accepts inbound connections from many peers
    Server,
}

/// Connection lifecycle of one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Session accepted, waiting for CONNECT
    Idle,
    /// CONNECT sent, waiting for ACCEPT_CONNECT
    AwaitingAccept,
    /// Handshake complete, data flows
    Established,
    /// DISCONNECT sent or received, session close pending
    Closing,
    /// Torn down; pruned at the start of the next pump
    Closed,
}

impl PeerState {
    /// Whether the peer still holds a live connection or attempt
    pub fn is_live(self) -> bool {
        matches!(
            self,
            PeerState::Idle | PeerState::AwaitingAccept | PeerState::Established
        )
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Handshake state machine plus channel demultiplexing receive loop
pub struct Engine<S> {
    role: Role,
    router: ChannelRouter<S>,
    peers: HashMap<PeerId, PeerState>,
    scheduler: Scheduler,
    /// Client: peer we are connecting or connected to
    target: Option<PeerId>,
    disconnect_delay: Duration,
    connect_timeout: Option<Duration>,
    max_connections: Option<usize>,
    accept_policy: AcceptPolicy,
    stats: TransportStats,
}

impl<S: Substrate> Engine<S> {
    /// Create an engine over `substrate`
    pub fn new(substrate: S, role: Role, config: &TransportConfig) -> Result<Self, ConfigError> {
        let table = config.channel_table()?;

        log::info!(
            "Transport engine ({:?}) with {} channels, control on channel {}",
            role,
            table.len(),
            table.control_channel()
        );

        Ok(Engine {
            role,
            router: ChannelRouter::new(substrate, table),
            peers: HashMap::new(),
            scheduler: Scheduler::new(),
            target: None,
            disconnect_delay: config.disconnect_delay(),
            connect_timeout: config.connect_timeout(),
            max_connections: config.max_connections,
            accept_policy: config.accept_policy.clone(),
            stats: TransportStats::default(),
        })
    }

    /// Engine that initiates a connection
    pub fn client(substrate: S, config: &TransportConfig) -> Result<Self, ConfigError> {
        Self::new(substrate, Role::Client, config)
    }

    /// Engine that listens for connections
    pub fn server(substrate: S, config: &TransportConfig) -> Result<Self, ConfigError> {
        Self::new(substrate, Role::Server, config)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Lifecycle state of `peer`, `None` if untracked
    pub fn state(&self, peer: PeerId) -> Option<PeerState> {
        self.peers.get(&peer).copied()
    }

    pub fn is_connected(&self, peer: PeerId) -> bool {
        self.state(peer) == Some(PeerState::Established)
    }

    /// Peers with an established connection, in no particular order
    pub fn connected_peers(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.peers
            .iter()
            .filter(|(_, state)| **state == PeerState::Established)
            .map(|(peer, _)| *peer)
    }

    /// Client: the peer being connected to
    pub fn target(&self) -> Option<PeerId> {
        self.target
    }

    /// Pending deferred task for `peer`
    pub fn pending_task(&self, peer: PeerId) -> Option<TaskKind> {
        self.scheduler.pending(peer)
    }

    /// Earliest time the next pump has scheduled work to do
    pub fn next_deadline(&self) -> Option<Instant> {
        self.scheduler.next_deadline()
    }

    pub fn stats(&self) -> &TransportStats {
        &self.stats
    }

    pub fn router(&self) -> &ChannelRouter<S> {
        &self.router
    }

    pub fn substrate(&self) -> &S {
        self.router.substrate()
    }

    pub fn substrate_mut(&mut self) -> &mut S {
        self.router.substrate_mut()
    }

    // ========================================================================
    // Local API
    // ========================================================================

    /// Start a connection to `peer` (client only)
    pub fn connect(&mut self, peer: PeerId) -> Result<(), EngineError> {
        self.connect_at(peer, Instant::now())
    }

    pub fn connect_at(&mut self, peer: PeerId, now: Instant) -> Result<(), EngineError> {
        if self.role != Role::Client {
            return Err(EngineError::NotClient);
        }

        if let Some(target) = self.target {
            let live = self.state(target).map(PeerState::is_live).unwrap_or(false);
            if live {
                return Err(EngineError::AlreadyConnecting(target));
            }
        }

        if !self.router.send_control(peer, ControlMessage::Connect) {
            return Err(EngineError::ControlSendFailed(peer));
        }

        // A previous session with this peer may still be waiting to close
        if self.scheduler.cancel(peer).is_some() {
            log::debug!("Cancelled pending task for {} on reconnect", peer);
        }

        self.target = Some(peer);
        self.peers.insert(peer, PeerState::AwaitingAccept);

        if let Some(timeout) = self.connect_timeout {
            self.scheduler
                .schedule(peer, TaskKind::ConnectTimeout, now + timeout);
        }

        log::info!("Connecting to {}", peer);
        Ok(())
    }

    /// Close the connection with `peer`
    pub fn disconnect(&mut self, peer: PeerId) -> Result<(), EngineError> {
        self.disconnect_at(peer, Instant::now())
    }

    pub fn disconnect_at(&mut self, peer: PeerId, now: Instant) -> Result<(), EngineError> {
        match self.state(peer) {
            Some(state) if state.is_live() => {
                if !self.router.send_control(peer, ControlMessage::Disconnect) {
                    log::warn!("DISCONNECT to {} was rejected, closing anyway", peer);
                }
                self.peers.insert(peer, PeerState::Closing);
                self.schedule_close(peer, now);
                log::info!("Disconnecting {} (was {:?})", peer, state);
                Ok(())
            }
            Some(PeerState::Closing) => {
                log::debug!("{} is already closing", peer);
                Ok(())
            }
            _ => Err(EngineError::UnknownPeer(peer)),
        }
    }

    /// Disconnect every live peer, returns how many
    pub fn shutdown(&mut self) -> usize {
        self.shutdown_at(Instant::now())
    }

    pub fn shutdown_at(&mut self, now: Instant) -> usize {
        let live: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, state)| state.is_live())
            .map(|(peer, _)| *peer)
            .collect();

        for peer in &live {
            // Cannot fail: every peer in `live` is tracked and live
            let _ = self.disconnect_at(*peer, now);
        }

        log::info!("Shutdown: disconnected {} peer(s)", live.len());
        live.len()
    }

    /// Send application data to an established peer
    ///
    /// `Ok(false)` means the substrate rejected the packet.
    pub fn send(&mut self, peer: PeerId, channel: u8, data: &[u8]) -> Result<bool, EngineError> {
        if !self.is_connected(peer) {
            return Err(EngineError::NotConnected(peer));
        }
        self.router
            .send(peer, channel, data)
            .map_err(EngineError::Channel)
    }

    // ========================================================================
    // Pump
    // ========================================================================

    /// Run one drain-and-dispatch cycle
    pub fn pump<H: ConnectionHandler>(&mut self, handler: &mut H) {
        self.pump_at(handler, Instant::now())
    }

    pub fn pump_at<H: ConnectionHandler>(&mut self, handler: &mut H, now: Instant) {
        self.peers.retain(|_, state| *state != PeerState::Closed);

        while let Some(event) = self.router.poll_event() {
            self.handle_session_event(event, handler, now);
        }

        while let Some((peer, data)) = self.router.receive_control() {
            match ControlMessage::decode(&data) {
                Ok(msg) => {
                    self.stats.control_received += 1;
                    log::trace!("{} from {}", msg, peer);
                    self.handle_control(peer, msg, handler, now);
                }
                Err(e) => {
                    self.stats.control_malformed += 1;
                    log::warn!("Dropping control packet from {}: {}", peer, e);
                }
            }
        }

        let control = self.router.channels().control_channel();
        for channel in 0..control {
            while let Some((peer, data)) = self.router.receive(channel) {
                self.dispatch_data(peer, channel, data, handler);
            }
        }

        for (peer, kind) in self.scheduler.take_due(now) {
            self.run_task(peer, kind, handler);
        }
    }

    // ========================================================================
    // Session Events
    // ========================================================================

    fn handle_session_event<H: ConnectionHandler>(
        &mut self,
        event: SessionEvent,
        handler: &mut H,
        now: Instant,
    ) {
        match event {
            SessionEvent::SessionRequest { peer } => self.on_session_request(peer, now),
            SessionEvent::ConnectFailed { peer, error } => {
                self.on_session_failed(peer, error, handler)
            }
        }
    }

    fn on_session_request(&mut self, peer: PeerId, now: Instant) {
        let allowed = match self.role {
            Role::Client => self.target == Some(peer),
            Role::Server => self.accept_policy.allows(peer),
        };

        if !allowed {
            // Release whatever the substrate holds for the request
            log::info!("Ignoring session request from {}", peer);
            self.close_session(peer);
            return;
        }

        if !self.router.accept_session(peer) {
            log::warn!("Substrate refused to accept session with {}", peer);
            return;
        }
        self.stats.sessions_accepted += 1;

        match self.state(peer) {
            Some(state) if state.is_live() => {
                log::debug!("Duplicate session request from {} ({:?})", peer, state);
            }
            _ if self.role == Role::Server => {
                if self.scheduler.cancel_kind(peer, TaskKind::CloseSession) {
                    log::debug!("Session with {} reopened, cancelled pending close", peer);
                }
                self.peers.insert(peer, PeerState::Idle);
                if let Some(timeout) = self.connect_timeout {
                    self.scheduler
                        .schedule(peer, TaskKind::IdleTimeout, now + timeout);
                }
                log::info!("Accepted session from {}", peer);
            }
            _ => {
                log::debug!("Accepted session from target {}", peer);
            }
        }
    }

    fn on_session_failed<H: ConnectionHandler>(
        &mut self,
        peer: PeerId,
        error: SessionError,
        handler: &mut H,
    ) {
        match self.state(peer) {
            None | Some(PeerState::Closed) => {
                log::error!("Connection failed for untracked peer {}: {}", peer, error);
            }
            Some(state) => {
                log::error!("Connection to {} failed ({:?}): {}", peer, state, error);
                self.scheduler.cancel(peer);
                self.peers.insert(peer, PeerState::Closed);
                self.close_session(peer);
                self.stats.connection_failures += 1;

                let reason = FailureReason::Session(error);
                self.notify(peer, "on_connection_failed", || {
                    handler.on_connection_failed(peer, reason)
                });
            }
        }
    }

    // ========================================================================
    // Control Messages
    // ========================================================================

    fn handle_control<H: ConnectionHandler>(
        &mut self,
        peer: PeerId,
        msg: ControlMessage,
        handler: &mut H,
        now: Instant,
    ) {
        match (self.role, msg) {
            (Role::Server, ControlMessage::Connect) => self.on_connect(peer, handler, now),
            (Role::Client, ControlMessage::AcceptConnect) => self.on_accept(peer, handler),
            (_, ControlMessage::Disconnect) => self.on_disconnect(peer, handler, now),
            (role, msg) => {
                log::warn!("Unexpected {} from {} in {:?} role", msg, peer, role);
            }
        }
    }

    fn on_connect<H: ConnectionHandler>(&mut self, peer: PeerId, handler: &mut H, now: Instant) {
        if self.state(peer) == Some(PeerState::Established) {
            log::debug!("Duplicate CONNECT from {}, re-acknowledging", peer);
            self.router.send_control(peer, ControlMessage::AcceptConnect);
            return;
        }

        if !self.accept_policy.allows(peer) {
            log::warn!("CONNECT from {} not allowed by accept policy", peer);
            self.refuse(peer, now);
            return;
        }

        if let Some(max) = self.max_connections {
            if self.connected_peers().count() >= max {
                log::warn!("Refusing {}: {} connections already open", peer, max);
                self.refuse(peer, now);
                return;
            }
        }

        if !self.router.send_control(peer, ControlMessage::AcceptConnect) {
            log::warn!("Could not answer CONNECT from {}", peer);
            return;
        }

        if let Some(kind) = self.scheduler.cancel(peer) {
            log::debug!("CONNECT from {} cancelled pending {:?}", peer, kind);
        }
        self.peers.insert(peer, PeerState::Established);
        log::info!("Peer {} connected", peer);

        self.notify(peer, "on_connected", || handler.on_connected(peer));
    }

    fn on_accept<H: ConnectionHandler>(&mut self, peer: PeerId, handler: &mut H) {
        match self.state(peer) {
            Some(PeerState::AwaitingAccept) => {
                self.scheduler.cancel_kind(peer, TaskKind::ConnectTimeout);
                self.peers.insert(peer, PeerState::Established);
                log::info!("Connected to {}", peer);

                self.notify(peer, "on_connected", || handler.on_connected(peer));
            }
            Some(PeerState::Established) => {
                log::debug!("Duplicate ACCEPT_CONNECT from {}", peer);
            }
            state => {
                log::warn!("ACCEPT_CONNECT from {} in state {:?}, ignoring", peer, state);
            }
        }
    }

    fn on_disconnect<H: ConnectionHandler>(&mut self, peer: PeerId, handler: &mut H, now: Instant) {
        match self.state(peer) {
            Some(PeerState::Established) => {
                self.peers.insert(peer, PeerState::Closing);
                self.schedule_close(peer, now);
                log::info!("Peer {} disconnected", peer);

                self.notify(peer, "on_disconnected", || handler.on_disconnected(peer));
            }
            Some(PeerState::AwaitingAccept) => {
                self.peers.insert(peer, PeerState::Closed);
                self.schedule_close(peer, now);
                self.stats.connection_failures += 1;
                log::info!("Connection to {} rejected", peer);

                self.notify(peer, "on_connection_failed", || {
                    handler.on_connection_failed(peer, FailureReason::Rejected)
                });
            }
            Some(PeerState::Idle) => {
                self.peers.insert(peer, PeerState::Closed);
                self.schedule_close(peer, now);
                log::debug!("{} disconnected before CONNECT", peer);
            }
            Some(PeerState::Closing) | Some(PeerState::Closed) => {
                log::debug!("DISCONNECT from {} while already closing", peer);
            }
            None => {
                log::debug!("DISCONNECT from untracked peer {}", peer);
            }
        }
    }

    /// Answer a CONNECT with DISCONNECT and drop the peer
    fn refuse(&mut self, peer: PeerId, now: Instant) {
        self.router.send_control(peer, ControlMessage::Disconnect);
        self.peers.remove(&peer);
        self.schedule_close(peer, now);
    }

    // ========================================================================
    // Application Data
    // ========================================================================

    fn dispatch_data<H: ConnectionHandler>(
        &mut self,
        peer: PeerId,
        channel: u8,
        data: Vec<u8>,
        handler: &mut H,
    ) {
        match self.state(peer) {
            // Closing peers still flush their last packets during the grace period
            Some(PeerState::Established) | Some(PeerState::Closing) => {
                self.stats.data_delivered += 1;
                log::trace!("{} bytes from {} on channel {}", data.len(), peer, channel);

                self.notify(peer, "on_data_received", || {
                    handler.on_data_received(peer, channel, data)
                });
            }
            state => {
                self.stats.data_dropped += 1;
                log::warn!(
                    "Dropping {} bytes on channel {} from unconnected peer {} ({:?})",
                    data.len(),
                    channel,
                    peer,
                    state
                );

                // A pending deferred close already covers this session
                let close_pending = self.scheduler.pending(peer) == Some(TaskKind::CloseSession);
                if self.role == Role::Server && state.is_none() && !close_pending {
                    self.close_session(peer);
                }
            }
        }
    }

    // ========================================================================
    // Scheduled Tasks
    // ========================================================================

    fn schedule_close(&mut self, peer: PeerId, now: Instant) {
        if let Some(replaced) =
            self.scheduler
                .schedule(peer, TaskKind::CloseSession, now + self.disconnect_delay)
        {
            log::debug!("Deferred close for {} replaced pending {:?}", peer, replaced);
        }
    }

    fn run_task<H: ConnectionHandler>(&mut self, peer: PeerId, kind: TaskKind, handler: &mut H) {
        match kind {
            TaskKind::CloseSession => {
                self.close_session(peer);
                if self.state(peer) == Some(PeerState::Closing) {
                    self.peers.insert(peer, PeerState::Closed);
                }
                log::info!("Closed session with {}", peer);
            }
            TaskKind::ConnectTimeout => {
                if self.state(peer) != Some(PeerState::AwaitingAccept) {
                    return;
                }
                log::warn!("Timed out waiting for ACCEPT_CONNECT from {}", peer);
                self.peers.insert(peer, PeerState::Closed);
                self.close_session(peer);
                self.stats.connection_failures += 1;

                self.notify(peer, "on_connection_failed", || {
                    handler.on_connection_failed(peer, FailureReason::HandshakeTimeout)
                });
            }
            TaskKind::IdleTimeout => {
                if self.state(peer) != Some(PeerState::Idle) {
                    return;
                }
                log::info!("No CONNECT from {} after session accept, closing", peer);
                self.peers.insert(peer, PeerState::Closed);
                self.close_session(peer);
            }
        }
    }

    fn close_session(&mut self, peer: PeerId) {
        self.router.close_session(peer);
        self.stats.sessions_closed += 1;
    }

    // ========================================================================
    // Handler Isolation
    // ========================================================================

    /// Invoke a handler callback; errors and panics are logged, never propagated
    fn notify<F>(&mut self, peer: PeerId, callback: &str, call: F)
    where
        F: FnOnce() -> HandlerResult,
    {
        match panic::catch_unwind(AssertUnwindSafe(call)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.stats.handler_failures += 1;
                log::error!("Handler {} for {} failed: {}", callback, peer, e);
            }
            Err(payload) => {
                self.stats.handler_failures += 1;
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                log::error!("Handler {} for {} panicked: {}", callback, peer, msg);
            }
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Error from a local engine call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// `connect` called on a server engine
    NotClient,
    /// Client already has a live connection or attempt to this peer
    AlreadyConnecting(PeerId),
    /// Peer has no live connection to close
    UnknownPeer(PeerId),
    /// Peer is not established, data not allowed
    NotConnected(PeerId),
    /// Substrate rejected a control message
    ControlSendFailed(PeerId),
    /// Invalid application channel
    Channel(ChannelError),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotClient => write!(f, "only a client engine can initiate connections"),
            EngineError::AlreadyConnecting(peer) => {
                write!(f, "already connecting or connected to {}", peer)
            }
            EngineError::UnknownPeer(peer) => write!(f, "no live connection with {}", peer),
            EngineError::NotConnected(peer) => write!(f, "{} is not connected", peer),
            EngineError::ControlSendFailed(peer) => {
                write!(f, "substrate rejected control message to {}", peer)
            }
            EngineError::Channel(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for EngineError {}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::SendMode;
    use crate::handler::Notification;
    use crate::loopback::{LoopbackNetwork, LoopbackSubstrate};

    const CLIENT: PeerId = PeerId(0xC1);
    const SERVER: PeerId = PeerId(0x5E);

    fn config() -> TransportConfig {
        TransportConfig::new(vec![SendMode::Reliable, SendMode::Unreliable])
    }

    /// Server engine; CLIENT gets an endpoint so replies have somewhere to go
    fn server_only(net: &LoopbackNetwork) -> Engine<LoopbackSubstrate> {
        net.endpoint(CLIENT);
        Engine::server(net.endpoint(SERVER), &config()).unwrap()
    }

    fn client_only(net: &LoopbackNetwork) -> Engine<LoopbackSubstrate> {
        Engine::client(net.endpoint(CLIENT), &config()).unwrap()
    }

    /// Handler that fails on every data packet whose first byte is 0xEE
    #[derive(Default)]
    struct Flaky {
        delivered: Vec<Vec<u8>>,
    }

    impl ConnectionHandler for Flaky {
        fn on_connected(&mut self, _peer: PeerId) -> HandlerResult {
            Ok(())
        }

        fn on_disconnected(&mut self, _peer: PeerId) -> HandlerResult {
            Ok(())
        }

        fn on_connection_failed(&mut self, _peer: PeerId, _reason: FailureReason) -> HandlerResult {
            Ok(())
        }

        fn on_data_received(&mut self, _peer: PeerId, _channel: u8, data: Vec<u8>) -> HandlerResult {
            match data.first() {
                Some(0xEE) => Err("corrupt payload".into()),
                Some(0xFF) => panic!("handler blew up"),
                _ => {
                    self.delivered.push(data);
                    Ok(())
                }
            }
        }
    }

    #[test]
    fn test_malformed_control_dropped() {
        let net = LoopbackNetwork::new();
        let mut server = server_only(&net);
        let mut events: Vec<Notification> = Vec::new();

        net.inject_packet(SERVER, CLIENT, 2, vec![0, 0]);
        net.inject_packet(SERVER, CLIENT, 2, vec![]);
        net.inject_packet(SERVER, CLIENT, 2, vec![9]);
        server.pump(&mut events);

        assert!(events.is_empty());
        assert_eq!(server.state(CLIENT), None);
        assert_eq!(server.stats().control_malformed, 3);
        assert_eq!(server.stats().control_received, 0);
        assert!(net.sent_packets(SERVER).is_empty());
    }

    #[test]
    fn test_malformed_control_leaves_established_peer() {
        let net = LoopbackNetwork::new();
        let mut server = server_only(&net);
        let mut events: Vec<Notification> = Vec::new();

        net.inject_packet(SERVER, CLIENT, 2, ControlMessage::Connect.encode().to_vec());
        server.pump(&mut events);
        assert_eq!(server.state(CLIENT), Some(PeerState::Established));

        net.inject_packet(SERVER, CLIENT, 2, vec![2, 2]);
        server.pump(&mut events);

        assert_eq!(server.state(CLIENT), Some(PeerState::Established));
        assert_eq!(server.stats().control_malformed, 1);
        assert_eq!(events, vec![Notification::Connected(CLIENT)]);
    }

    #[test]
    fn test_replayed_connect_is_not_a_new_transition() {
        let net = LoopbackNetwork::new();
        let mut server = server_only(&net);
        let mut events: Vec<Notification> = Vec::new();

        net.inject_packet(SERVER, CLIENT, 2, vec![0]);
        server.pump(&mut events);
        net.inject_packet(SERVER, CLIENT, 2, vec![0]);
        server.pump(&mut events);

        assert_eq!(events, vec![Notification::Connected(CLIENT)]);
        // Both CONNECTs acknowledged
        let accepts = net
            .sent_packets(SERVER)
            .iter()
            .filter(|p| p.data == vec![1])
            .count();
        assert_eq!(accepts, 2);
    }

    #[test]
    fn test_connect_requires_client_role() {
        let net = LoopbackNetwork::new();
        let mut server = server_only(&net);
        assert_eq!(server.connect(CLIENT), Err(EngineError::NotClient));
    }

    #[test]
    fn test_client_single_target() {
        let net = LoopbackNetwork::new();
        let _server = net.endpoint(SERVER);
        let mut client = client_only(&net);

        client.connect(SERVER).unwrap();
        assert_eq!(client.state(SERVER), Some(PeerState::AwaitingAccept));
        assert_eq!(
            client.connect(PeerId(99)),
            Err(EngineError::AlreadyConnecting(SERVER))
        );
        assert_eq!(
            client.connect(SERVER),
            Err(EngineError::AlreadyConnecting(SERVER))
        );
    }

    #[test]
    fn test_connect_send_rejected() {
        let net = LoopbackNetwork::new();
        let mut client = client_only(&net);
        net.set_reject_sends(CLIENT, true);

        assert_eq!(
            client.connect(SERVER),
            Err(EngineError::ControlSendFailed(SERVER))
        );
        assert_eq!(client.state(SERVER), None);
    }

    #[test]
    fn test_disconnect_during_handshake_replaces_timeout() {
        let net = LoopbackNetwork::new();
        let _server = net.endpoint(SERVER);
        let mut cfg = config();
        cfg.connect_timeout_ms = Some(5_000);
        let mut client = Engine::client(net.endpoint(CLIENT), &cfg).unwrap();
        let mut events: Vec<Notification> = Vec::new();
        let now = Instant::now();

        client.connect_at(SERVER, now).unwrap();
        assert_eq!(client.pending_task(SERVER), Some(TaskKind::ConnectTimeout));

        client.disconnect_at(SERVER, now).unwrap();
        assert_eq!(client.state(SERVER), Some(PeerState::Closing));
        assert_eq!(client.pending_task(SERVER), Some(TaskKind::CloseSession));

        // Second disconnect does not schedule a second close
        client.disconnect_at(SERVER, now).unwrap();

        client.pump_at(&mut events, now + Duration::from_secs(10));
        assert_eq!(net.closed_sessions(CLIENT), vec![SERVER]);
        assert_eq!(client.state(SERVER), Some(PeerState::Closed));
        assert!(events.is_empty());

        client.pump_at(&mut events, now + Duration::from_secs(20));
        assert_eq!(net.closed_sessions(CLIENT), vec![SERVER]);
        assert_eq!(client.state(SERVER), None);
    }

    #[test]
    fn test_connect_timeout() {
        let net = LoopbackNetwork::new();
        let _server = net.endpoint(SERVER);
        let mut cfg = config();
        cfg.connect_timeout_ms = Some(1_000);
        let mut client = Engine::client(net.endpoint(CLIENT), &cfg).unwrap();
        let mut events: Vec<Notification> = Vec::new();
        let now = Instant::now();

        client.connect_at(SERVER, now).unwrap();
        client.pump_at(&mut events, now + Duration::from_millis(999));
        assert!(events.is_empty());

        client.pump_at(&mut events, now + Duration::from_millis(1_000));
        assert_eq!(
            events,
            vec![Notification::ConnectionFailed(
                SERVER,
                FailureReason::HandshakeTimeout
            )]
        );
        assert_eq!(client.state(SERVER), Some(PeerState::Closed));
        assert_eq!(net.closed_sessions(CLIENT), vec![SERVER]);
    }

    #[test]
    fn test_disconnect_unknown_peer() {
        let net = LoopbackNetwork::new();
        let mut server = server_only(&net);
        assert_eq!(
            server.disconnect(CLIENT),
            Err(EngineError::UnknownPeer(CLIENT))
        );
    }

    #[test]
    fn test_session_failure_untracked_peer() {
        let net = LoopbackNetwork::new();
        let mut server = server_only(&net);
        let mut events: Vec<Notification> = Vec::new();

        net.inject_event(
            SERVER,
            SessionEvent::ConnectFailed {
                peer: CLIENT,
                error: SessionError::Timeout,
            },
        );
        server.pump(&mut events);

        assert!(events.is_empty());
        assert_eq!(server.state(CLIENT), None);
        assert_eq!(server.stats().connection_failures, 0);
        assert!(net.closed_sessions(SERVER).is_empty());
    }

    #[test]
    fn test_session_failure_while_awaiting_accept() {
        let net = LoopbackNetwork::new();
        let mut client = client_only(&net);
        let mut events: Vec<Notification> = Vec::new();

        // SERVER has no endpoint: the loopback reports it as not logged in
        client.connect(SERVER).unwrap();
        client.pump(&mut events);

        assert_eq!(
            events,
            vec![Notification::ConnectionFailed(
                SERVER,
                FailureReason::Session(SessionError::DestinationNotLoggedIn)
            )]
        );
        assert_eq!(client.state(SERVER), Some(PeerState::Closed));
        assert_eq!(client.stats().connection_failures, 1);

        // Pruned on the next pump, and the client may try again
        client.pump(&mut events);
        assert_eq!(client.state(SERVER), None);
        assert!(client.connect(SERVER).is_ok());
    }

    #[test]
    fn test_session_failure_established_peer() {
        let net = LoopbackNetwork::new();
        let mut server = server_only(&net);
        let mut events: Vec<Notification> = Vec::new();

        net.inject_packet(SERVER, CLIENT, 2, vec![0]);
        server.pump(&mut events);

        net.inject_event(
            SERVER,
            SessionEvent::ConnectFailed {
                peer: CLIENT,
                error: SessionError::from_code(1),
            },
        );
        server.pump(&mut events);

        assert_eq!(
            events.last(),
            Some(&Notification::ConnectionFailed(
                CLIENT,
                FailureReason::Session(SessionError::NotRunningApp)
            ))
        );
        assert_eq!(server.state(CLIENT), Some(PeerState::Closed));
    }

    #[test]
    fn test_data_drained_after_control_in_order() {
        let net = LoopbackNetwork::new();
        let mut server = server_only(&net);
        let mut events: Vec<Notification> = Vec::new();

        // Data queued before the CONNECT is still delivered: control drains first
        for i in 0..5u8 {
            net.inject_packet(SERVER, CLIENT, 0, vec![i]);
        }
        net.inject_packet(SERVER, CLIENT, 1, vec![100]);
        net.inject_packet(SERVER, CLIENT, 2, vec![0]);
        server.pump(&mut events);

        assert_eq!(events[0], Notification::Connected(CLIENT));
        let data: Vec<(u8, Vec<u8>)> = events[1..]
            .iter()
            .map(|n| match n {
                Notification::Data { channel, data, .. } => (*channel, data.clone()),
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(
            data,
            vec![
                (0, vec![0]),
                (0, vec![1]),
                (0, vec![2]),
                (0, vec![3]),
                (0, vec![4]),
                (1, vec![100]),
            ]
        );
        assert_eq!(server.stats().data_delivered, 6);
        assert_eq!(net.queued(SERVER, 0), 0);
    }

    #[test]
    fn test_handler_failure_does_not_stop_drain() {
        let net = LoopbackNetwork::new();
        let mut server = server_only(&net);
        let mut handler = Flaky::default();

        net.inject_packet(SERVER, CLIENT, 2, vec![0]);
        net.inject_packet(SERVER, CLIENT, 0, vec![1]);
        net.inject_packet(SERVER, CLIENT, 0, vec![0xEE]);
        net.inject_packet(SERVER, CLIENT, 0, vec![2]);
        net.inject_packet(SERVER, CLIENT, 0, vec![0xFF]);
        net.inject_packet(SERVER, CLIENT, 1, vec![3]);
        server.pump(&mut handler);

        assert_eq!(handler.delivered, vec![vec![1], vec![2], vec![3]]);
        assert_eq!(server.stats().handler_failures, 2);
        assert_eq!(server.stats().data_delivered, 5);
    }

    #[test]
    fn test_data_from_unknown_peer_dropped_and_closed() {
        let net = LoopbackNetwork::new();
        let mut server = server_only(&net);
        let mut events: Vec<Notification> = Vec::new();

        net.inject_packet(SERVER, CLIENT, 0, vec![1, 2, 3]);
        server.pump(&mut events);

        assert!(events.is_empty());
        assert_eq!(server.stats().data_dropped, 1);
        assert_eq!(net.closed_sessions(SERVER), vec![CLIENT]);
    }

    #[test]
    fn test_send_requires_established() {
        let net = LoopbackNetwork::new();
        let _server = net.endpoint(SERVER);
        let mut client = client_only(&net);

        client.connect(SERVER).unwrap();
        assert_eq!(
            client.send(SERVER, 0, &[1]),
            Err(EngineError::NotConnected(SERVER))
        );
    }

    #[test]
    fn test_max_connections_refuses() {
        let net = LoopbackNetwork::new();
        let mut cfg = config();
        cfg.max_connections = Some(1);
        let mut server = Engine::server(net.endpoint(SERVER), &cfg).unwrap();
        let mut events: Vec<Notification> = Vec::new();
        let now = Instant::now();
        let other = PeerId(0xC2);
        net.endpoint(CLIENT);
        net.endpoint(other);

        net.inject_packet(SERVER, CLIENT, 2, vec![0]);
        net.inject_packet(SERVER, other, 2, vec![0]);
        server.pump_at(&mut events, now);

        assert_eq!(events, vec![Notification::Connected(CLIENT)]);
        assert_eq!(server.state(other), None);

        let to_other: Vec<Vec<u8>> = net
            .sent_packets(SERVER)
            .into_iter()
            .filter(|p| p.to == other)
            .map(|p| p.data)
            .collect();
        assert_eq!(to_other, vec![vec![2]]);

        server.pump_at(&mut events, now + Duration::from_millis(100));
        assert_eq!(net.closed_sessions(SERVER), vec![other]);
    }

    #[test]
    fn test_accept_policy() {
        let net = LoopbackNetwork::new();
        let mut cfg = config();
        cfg.accept_policy = AcceptPolicy::Allow(vec![CLIENT]);
        let mut server = Engine::server(net.endpoint(SERVER), &cfg).unwrap();
        let mut events: Vec<Notification> = Vec::new();
        let stranger = PeerId(0xBAD);

        net.inject_event(SERVER, SessionEvent::SessionRequest { peer: stranger });
        net.inject_event(SERVER, SessionEvent::SessionRequest { peer: CLIENT });
        server.pump(&mut events);

        assert_eq!(server.state(stranger), None);
        assert_eq!(server.state(CLIENT), Some(PeerState::Idle));
        assert_eq!(server.stats().sessions_accepted, 1);
    }

    #[test]
    fn test_client_ignores_requests_from_non_target() {
        let net = LoopbackNetwork::new();
        let mut client = client_only(&net);
        let mut events: Vec<Notification> = Vec::new();

        net.inject_event(CLIENT, SessionEvent::SessionRequest { peer: PeerId(5) });
        client.pump(&mut events);

        assert_eq!(client.stats().sessions_accepted, 0);
        assert_eq!(client.state(PeerId(5)), None);
    }

    #[test]
    fn test_unexpected_control_ignored() {
        let net = LoopbackNetwork::new();
        let mut client = client_only(&net);
        let mut server = server_only(&net);
        let mut events: Vec<Notification> = Vec::new();

        net.inject_packet(CLIENT, SERVER, 2, vec![0]);
        net.inject_packet(SERVER, CLIENT, 2, vec![1]);
        client.pump(&mut events);
        server.pump(&mut events);

        assert!(events.is_empty());
        assert_eq!(client.state(SERVER), None);
        assert_eq!(server.state(CLIENT), None);
    }

    #[test]
    fn test_shutdown_disconnects_live_peers() {
        let net = LoopbackNetwork::new();
        let mut server = server_only(&net);
        let mut events: Vec<Notification> = Vec::new();

        net.inject_packet(SERVER, PeerId(1), 2, vec![0]);
        net.inject_packet(SERVER, PeerId(2), 2, vec![0]);
        server.pump(&mut events);
        assert_eq!(server.connected_peers().count(), 2);

        assert_eq!(server.shutdown(), 2);
        assert_eq!(server.state(PeerId(1)), Some(PeerState::Closing));
        assert_eq!(server.state(PeerId(2)), Some(PeerState::Closing));
        assert!(server.next_deadline().is_some());
    }

    #[test]
    fn test_session_request_for_established_peer_is_duplicate() {
        let net = LoopbackNetwork::new();
        let mut server = server_only(&net);
        let mut events: Vec<Notification> = Vec::new();

        net.inject_packet(SERVER, CLIENT, 2, vec![0]);
        server.pump(&mut events);
        let sent_before = net.sent_packets(SERVER).len();

        net.inject_event(SERVER, SessionEvent::SessionRequest { peer: CLIENT });
        server.pump(&mut events);

        assert_eq!(server.state(CLIENT), Some(PeerState::Established));
        assert_eq!(events, vec![Notification::Connected(CLIENT)]);
        assert_eq!(net.sent_packets(SERVER).len(), sent_before);
        assert!(net.has_session(SERVER, CLIENT));
        assert_eq!(server.pending_task(CLIENT), None);
    }

    #[test]
    fn test_session_failure_while_closing_is_reported() {
        let net = LoopbackNetwork::new();
        let mut server = server_only(&net);
        let mut events: Vec<Notification> = Vec::new();
        let now = Instant::now();

        net.inject_packet(SERVER, CLIENT, 2, vec![0]);
        server.pump_at(&mut events, now);
        server.disconnect_at(CLIENT, now).unwrap();
        assert_eq!(server.pending_task(CLIENT), Some(TaskKind::CloseSession));

        net.inject_event(
            SERVER,
            SessionEvent::ConnectFailed {
                peer: CLIENT,
                error: SessionError::Timeout,
            },
        );
        server.pump_at(&mut events, now);

        assert_eq!(
            events.last(),
            Some(&Notification::ConnectionFailed(
                CLIENT,
                FailureReason::Session(SessionError::Timeout)
            ))
        );
        assert_eq!(server.state(CLIENT), Some(PeerState::Closed));
        assert_eq!(server.pending_task(CLIENT), None);
        assert_eq!(net.closed_sessions(SERVER), vec![CLIENT]);

        // The cancelled deferred close never runs
        server.pump_at(&mut events, now + Duration::from_secs(1));
        assert_eq!(net.closed_sessions(SERVER), vec![CLIENT]);
    }

    #[test]
    fn test_ignored_session_request_releases_substrate() {
        let net = LoopbackNetwork::new();
        let stranger = PeerId(0xBAD);
        let mut cfg = config();
        cfg.accept_policy = AcceptPolicy::RejectAll;
        let mut server = Engine::server(net.endpoint(SERVER), &cfg).unwrap();
        let mut remote = net.endpoint(stranger);
        let mut events: Vec<Notification> = Vec::new();

        assert!(remote.send_packet(SERVER, &[0], SendMode::Reliable, 2));
        server.pump(&mut events);

        assert_eq!(server.state(stranger), None);
        assert_eq!(net.closed_sessions(SERVER), vec![stranger]);

        // Held packets were discarded, so the next packet is a fresh request
        assert!(remote.send_packet(SERVER, &[0], SendMode::Reliable, 2));
        assert_eq!(
            server.substrate_mut().poll_event(),
            Some(SessionEvent::SessionRequest { peer: stranger })
        );
        assert_eq!(net.queued(SERVER, 2), 0);
    }

    #[test]
    fn test_idle_session_expires_without_connect() {
        let net = LoopbackNetwork::new();
        net.endpoint(CLIENT);
        let mut cfg = config();
        cfg.connect_timeout_ms = Some(1_000);
        let mut server = Engine::server(net.endpoint(SERVER), &cfg).unwrap();
        let mut events: Vec<Notification> = Vec::new();
        let now = Instant::now();

        net.inject_event(SERVER, SessionEvent::SessionRequest { peer: CLIENT });
        server.pump_at(&mut events, now);
        assert_eq!(server.state(CLIENT), Some(PeerState::Idle));
        assert_eq!(server.pending_task(CLIENT), Some(TaskKind::IdleTimeout));

        server.pump_at(&mut events, now + Duration::from_millis(999));
        assert_eq!(server.state(CLIENT), Some(PeerState::Idle));

        server.pump_at(&mut events, now + Duration::from_millis(1_000));
        assert_eq!(server.state(CLIENT), Some(PeerState::Closed));
        assert_eq!(net.closed_sessions(SERVER), vec![CLIENT]);
        assert!(events.is_empty());
    }

    #[test]
    fn test_connect_cancels_idle_expiry() {
        let net = LoopbackNetwork::new();
        net.endpoint(CLIENT);
        let mut cfg = config();
        cfg.connect_timeout_ms = Some(1_000);
        let mut server = Engine::server(net.endpoint(SERVER), &cfg).unwrap();
        let mut events: Vec<Notification> = Vec::new();
        let now = Instant::now();

        net.inject_event(SERVER, SessionEvent::SessionRequest { peer: CLIENT });
        server.pump_at(&mut events, now);
        net.inject_packet(SERVER, CLIENT, 2, vec![0]);
        server.pump_at(&mut events, now + Duration::from_millis(500));

        server.pump_at(&mut events, now + Duration::from_secs(2));
        assert_eq!(server.state(CLIENT), Some(PeerState::Established));
        assert!(net.closed_sessions(SERVER).is_empty());
        assert_eq!(events, vec![Notification::Connected(CLIENT)]);
    }
}

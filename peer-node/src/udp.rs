//! UDP datagram substrate
//!
//! Implements [`Substrate`] over one non-blocking mio UDP socket. Sessions
//! are emulated on top of plain datagrams:
//!
//! - sending to a peer opens an outgoing session
//! - the first frame from a peer without a session raises
//!   [`SessionEvent::SessionRequest`]; its frames are held until accepted,
//!   and dropped if nobody accepts within [`SESSION_TIMEOUT`]
//! - an outgoing session that hears nothing within [`SESSION_TIMEOUT`]
//!   raises [`SessionError::Timeout`]
//!
//! Peer addresses come from a directory filled by [`UdpSubstrate::add_peer`]
//! and learned from inbound frames. Reliability modes travel in the frame
//! header; delivery itself is best-effort.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use mio::net::UdpSocket;
use p2p_mux::{PeerId, SendMode, SessionError, SessionEvent, Substrate};

use crate::frame::{Frame, MAX_PAYLOAD};

// ============================================================================
// Constants
// ============================================================================

/// Outgoing session fails if the peer stays silent this long
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(10);

/// Max frames held per peer while its session request is pending
const MAX_HELD_FRAMES: usize = 256;

/// Max peers with an unanswered session request
const MAX_HELD_PEERS: usize = 64;

// ============================================================================
// Session Tracking
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct Session {
    /// Set for sessions we opened and haven't heard back on yet
    awaiting_reply_since: Option<Instant>,
}

/// Frames from a peer whose session request is unanswered
#[derive(Debug)]
struct Held {
    since: Instant,
    frames: Vec<(u8, Vec<u8>)>,
}

// ============================================================================
// UDP Substrate
// ============================================================================

pub struct UdpSubstrate {
    socket: UdpSocket,
    local_id: PeerId,
    directory: HashMap<PeerId, SocketAddr>,
    sessions: HashMap<PeerId, Session>,
    requested: HashSet<PeerId>,
    held: HashMap<PeerId, Held>,
    queues: HashMap<u8, VecDeque<(PeerId, Vec<u8>)>>,
    events: VecDeque<SessionEvent>,
    recv_buf: Vec<u8>,
}

impl UdpSubstrate {
    /// Bind a non-blocking socket for `local_id`
    pub fn bind(addr: SocketAddr, local_id: PeerId) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        log::info!("UDP substrate {} bound to {}", local_id, socket.local_addr()?);

        Ok(UdpSubstrate {
            socket,
            local_id,
            directory: HashMap::new(),
            sessions: HashMap::new(),
            requested: HashSet::new(),
            held: HashMap::new(),
            queues: HashMap::new(),
            events: VecDeque::new(),
            recv_buf: vec![0u8; 65535],
        })
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Socket for registration with a mio `Poll`
    pub fn socket_mut(&mut self) -> &mut UdpSocket {
        &mut self.socket
    }

    /// Record where `peer` can be reached
    pub fn add_peer(&mut self, peer: PeerId, addr: SocketAddr) {
        log::debug!("Directory: {} at {}", peer, addr);
        self.directory.insert(peer, addr);
    }

    pub fn peer_addr(&self, peer: PeerId) -> Option<SocketAddr> {
        self.directory.get(&peer).copied()
    }

    /// Read every datagram waiting on the socket, returns frames accepted
    pub fn receive_all(&mut self) -> io::Result<usize> {
        let mut accepted = 0;

        loop {
            let (len, from) = match self.socket.recv_from(&mut self.recv_buf) {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            };

            let frame = match Frame::decode(&self.recv_buf[..len]) {
                Ok(f) => f,
                Err(e) => {
                    log::debug!("Dropping datagram from {}: {}", from, e);
                    continue;
                }
            };

            if frame.sender == self.local_id {
                log::debug!("Dropping frame with our own id from {}", from);
                continue;
            }

            self.on_frame(frame, from);
            accepted += 1;
        }

        Ok(accepted)
    }

    fn on_frame(&mut self, frame: Frame, from: SocketAddr) {
        let peer = frame.sender;
        let known = self.sessions.contains_key(&peer) || self.held.contains_key(&peer);

        if !known && self.held.len() >= MAX_HELD_PEERS {
            log::warn!("Too many pending session requests, dropping frame from {}", peer);
            return;
        }

        if self.directory.insert(peer, from) != Some(from) {
            log::debug!("Learned address {} for {}", from, peer);
        }

        if let Some(session) = self.sessions.get_mut(&peer) {
            session.awaiting_reply_since = None;
            self.queues
                .entry(frame.channel)
                .or_default()
                .push_back((peer, frame.payload));
            return;
        }

        let held = self.held.entry(peer).or_insert_with(|| Held {
            since: Instant::now(),
            frames: Vec::new(),
        });
        if held.frames.len() >= MAX_HELD_FRAMES {
            log::warn!("Too many frames held for {}, dropping", peer);
            return;
        }
        held.frames.push((frame.channel, frame.payload));

        if self.requested.insert(peer) {
            log::debug!("Session request from {} at {}", peer, from);
            self.events.push_back(SessionEvent::SessionRequest { peer });
        }
    }

    /// Fail outgoing sessions the remote never answered and drop session
    /// requests nobody accepted
    pub fn check_timeouts(&mut self, now: Instant) {
        let stale: Vec<PeerId> = self
            .held
            .iter()
            .filter(|(_, h)| now.duration_since(h.since) >= SESSION_TIMEOUT)
            .map(|(peer, _)| *peer)
            .collect();

        for peer in stale {
            if let Some(held) = self.held.remove(&peer) {
                log::debug!("Dropping {} unaccepted frames from {}", held.frames.len(), peer);
            }
            self.requested.remove(&peer);
        }

        let expired: Vec<PeerId> = self
            .sessions
            .iter()
            .filter_map(|(peer, s)| match s.awaiting_reply_since {
                Some(since) if now.duration_since(since) >= SESSION_TIMEOUT => Some(*peer),
                _ => None,
            })
            .collect();

        for peer in expired {
            log::warn!("No reply from {} within {:?}", peer, SESSION_TIMEOUT);
            self.sessions.remove(&peer);
            self.events.push_back(SessionEvent::ConnectFailed {
                peer,
                error: SessionError::Timeout,
            });
        }
    }

    /// When the next outgoing session would time out
    pub fn next_timeout(&self) -> Option<Instant> {
        self.sessions
            .values()
            .filter_map(|s| s.awaiting_reply_since)
            .chain(self.held.values().map(|h| h.since))
            .min()
            .map(|since| since + SESSION_TIMEOUT)
    }

    /// Peers whose frames are held pending a session accept
    pub fn held_peers(&self) -> usize {
        self.held.len()
    }

    pub fn has_session(&self, peer: PeerId) -> bool {
        self.sessions.contains_key(&peer)
    }
}

impl Substrate for UdpSubstrate {
    fn send_packet(&mut self, peer: PeerId, data: &[u8], mode: SendMode, channel: u8) -> bool {
        if data.len() > MAX_PAYLOAD {
            log::warn!("Payload of {} bytes to {} exceeds {}", data.len(), peer, MAX_PAYLOAD);
            return false;
        }

        let Some(addr) = self.peer_addr(peer) else {
            log::warn!("No address for {}", peer);
            self.events.push_back(SessionEvent::ConnectFailed {
                peer,
                error: SessionError::DestinationNotLoggedIn,
            });
            return true;
        };

        let frame = Frame {
            sender: self.local_id,
            channel,
            mode,
            payload: data.to_vec(),
        };
        let bytes = match frame.encode() {
            Ok(b) => b,
            Err(e) => {
                log::warn!("Cannot frame packet to {}: {}", peer, e);
                return false;
            }
        };

        match self.socket.send_to(&bytes, addr) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                log::debug!("Socket busy, packet to {} rejected", peer);
                return false;
            }
            Err(e) => {
                log::warn!("Send to {} ({}) failed: {}", peer, addr, e);
                return false;
            }
        }

        self.sessions.entry(peer).or_insert_with(|| {
            log::debug!("Opened outgoing session to {}", peer);
            Session {
                awaiting_reply_since: Some(Instant::now()),
            }
        });
        true
    }

    fn read_packet(&mut self, channel: u8) -> Option<(PeerId, Vec<u8>)> {
        self.queues.get_mut(&channel).and_then(|q| q.pop_front())
    }

    fn accept_session(&mut self, peer: PeerId) -> bool {
        self.requested.remove(&peer);
        self.sessions.insert(
            peer,
            Session {
                awaiting_reply_since: None,
            },
        );

        if let Some(held) = self.held.remove(&peer) {
            log::debug!("Releasing {} held frames from {}", held.frames.len(), peer);
            for (channel, payload) in held.frames {
                self.queues.entry(channel).or_default().push_back((peer, payload));
            }
        }
        true
    }

    fn close_session(&mut self, peer: PeerId) -> bool {
        self.requested.remove(&peer);
        self.held.remove(&peer);
        self.sessions.remove(&peer).is_some()
    }

    fn poll_event(&mut self) -> Option<SessionEvent> {
        self.events.pop_front()
    }
}

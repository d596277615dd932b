//! Datagram substrate abstraction
//!
//! The multiplexer never touches sockets. Everything below it (session
//! setup, NAT traversal, encryption, actual delivery) lives behind the
//! [`Substrate`] trait: send a packet to a peer on a numbered channel with a
//! reliability mode, read the next queued packet of a channel, accept or
//! close a session, and drain queued session events.

use serde::{Deserialize, Serialize};

use crate::channel::SendMode;

// ============================================================================
// Peer Identity
// ============================================================================

/// Opaque peer identifier issued by the substrate
///
/// Only equality and hashing are meaningful; the numeric value carries no
/// ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub u64);

impl PeerId {
    /// Size of a peer id on the wire
    pub const LEN: usize = 8;

    pub fn to_be_bytes(self) -> [u8; Self::LEN] {
        self.0.to_be_bytes()
    }

    pub fn from_be_bytes(bytes: [u8; Self::LEN]) -> Self {
        PeerId(u64::from_be_bytes(bytes))
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

// ============================================================================
// Session Events
// ============================================================================

/// Session-establishment failure code reported by the substrate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    /// The target user is not running the same app
    NotRunningApp,
    /// The local user doesn't own the app that is running
    NoRightsToApp,
    /// The target user isn't connected to the network
    DestinationNotLoggedIn,
    /// The target user didn't respond in time
    Timeout,
    /// Any other code
    Unknown,
}

impl SessionError {
    /// Map a raw substrate code to a failure reason
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => SessionError::NotRunningApp,
            2 => SessionError::NoRightsToApp,
            3 => SessionError::DestinationNotLoggedIn,
            4 => SessionError::Timeout,
            _ => SessionError::Unknown,
        }
    }

    /// Raw substrate code (0 for unknown)
    pub fn code(self) -> u8 {
        match self {
            SessionError::NotRunningApp => 1,
            SessionError::NoRightsToApp => 2,
            SessionError::DestinationNotLoggedIn => 3,
            SessionError::Timeout => 4,
            SessionError::Unknown => 0,
        }
    }
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::NotRunningApp => {
                write!(f, "the target user is not running the same app")
            }
            SessionError::NoRightsToApp => {
                write!(f, "the local user doesn't own the app that is running")
            }
            SessionError::DestinationNotLoggedIn => {
                write!(f, "target user isn't connected to the network")
            }
            SessionError::Timeout => write!(
                f,
                "the connection timed out because the target user didn't respond"
            ),
            SessionError::Unknown => write!(f, "unknown error"),
        }
    }
}

/// Notification queued by the substrate and drained by the engine once per tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A remote peer wants to open a session with us
    SessionRequest { peer: PeerId },
    /// A session with `peer` could not be established
    ConnectFailed { peer: PeerId, error: SessionError },
}

impl SessionEvent {
    /// Peer the event refers to
    pub fn peer(&self) -> PeerId {
        match self {
            SessionEvent::SessionRequest { peer } => *peer,
            SessionEvent::ConnectFailed { peer, .. } => *peer,
        }
    }
}

// ============================================================================
// Substrate Trait
// ============================================================================

/// Session-oriented datagram service the multiplexer runs on
///
/// All methods must be non-blocking.
pub trait Substrate {
    /// Queue a packet for `peer` on `channel` using `mode`
    ///
    /// Returns false if the packet was rejected (session not ready, queue
    /// full, payload too large). Sending to a peer without a session opens
    /// one.
    fn send_packet(&mut self, peer: PeerId, data: &[u8], mode: SendMode, channel: u8) -> bool;

    /// Pop the next packet queued on `channel`, if any
    fn read_packet(&mut self, channel: u8) -> Option<(PeerId, Vec<u8>)>;

    /// Accept a session requested by `peer`
    fn accept_session(&mut self, peer: PeerId) -> bool;

    /// Tear down the session with `peer`
    fn close_session(&mut self, peer: PeerId) -> bool;

    /// Pop the next pending session event, if any
    fn poll_event(&mut self) -> Option<SessionEvent>;
}

impl<S: Substrate + ?Sized> Substrate for Box<S> {
    fn send_packet(&mut self, peer: PeerId, data: &[u8], mode: SendMode, channel: u8) -> bool {
        (**self).send_packet(peer, data, mode, channel)
    }

    fn read_packet(&mut self, channel: u8) -> Option<(PeerId, Vec<u8>)> {
        (**self).read_packet(channel)
    }

    fn accept_session(&mut self, peer: PeerId) -> bool {
        (**self).accept_session(peer)
    }

    fn close_session(&mut self, peer: PeerId) -> bool {
        (**self).close_session(peer)
    }

    fn poll_event(&mut self) -> Option<SessionEvent> {
        (**self).poll_event()
    }
}

//! Channel table and router
//!
//! Application channels are numbered `0..N`, each with a reliability mode
//! fixed at construction. Index `N` is reserved for control traffic and is
//! always sent reliably.
//!
//! ```text
//!   channel:   0          1            ...   N-1        N
//!   mode:      reliable   unreliable   ...   no-delay   reliable (control)
//! ```
//!
//! The router holds no peer state: it maps a (peer, channel, bytes) request
//! onto a substrate call and exposes a non-blocking read per channel.

use serde::{Deserialize, Serialize};

use crate::control::ControlMessage;
use crate::substrate::{PeerId, SessionEvent, Substrate};

// ============================================================================
// Constants
// ============================================================================

/// Maximum number of application channels (control index must fit in a byte)
pub const MAX_CHANNELS: usize = u8::MAX as usize;

// ============================================================================
// Send Mode
// ============================================================================

/// Per-packet reliability mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendMode {
    /// Delivered in order, retransmitted on loss
    Reliable,
    /// Best effort, may be dropped or reordered
    Unreliable,
    /// Best effort, sent immediately without batching
    UnreliableNoDelay,
}

impl SendMode {
    /// Wire value used by datagram substrates that carry the mode in a header
    pub fn to_byte(self) -> u8 {
        match self {
            SendMode::Unreliable => 0,
            SendMode::UnreliableNoDelay => 1,
            SendMode::Reliable => 2,
        }
    }

    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            0 => Some(SendMode::Unreliable),
            1 => Some(SendMode::UnreliableNoDelay),
            2 => Some(SendMode::Reliable),
            _ => None,
        }
    }
}

// ============================================================================
// Channel Table
// ============================================================================

/// Immutable mapping from application channel index to send mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelTable {
    modes: Box<[SendMode]>,
}

impl ChannelTable {
    /// Build a table from an ordered list of modes
    pub fn new(modes: &[SendMode]) -> Result<Self, ChannelError> {
        if modes.is_empty() {
            return Err(ChannelError::NoChannels);
        }
        if modes.len() > MAX_CHANNELS {
            return Err(ChannelError::TooManyChannels(modes.len()));
        }

        Ok(ChannelTable {
            modes: modes.into(),
        })
    }

    /// Number of application channels
    pub fn len(&self) -> usize {
        self.modes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modes.is_empty()
    }

    /// Reserved control channel index (one past the last application channel)
    pub fn control_channel(&self) -> u8 {
        self.modes.len() as u8
    }

    /// Send mode of an application channel
    pub fn mode(&self, channel: u8) -> Option<SendMode> {
        self.modes.get(channel as usize).copied()
    }

    /// Application channel indices in ascending order
    pub fn indices(&self) -> impl Iterator<Item = u8> {
        0..self.control_channel()
    }
}

// ============================================================================
// Channel Router
// ============================================================================

/// Raw send/receive against the substrate, per channel
pub struct ChannelRouter<S> {
    substrate: S,
    table: ChannelTable,
}

impl<S: Substrate> ChannelRouter<S> {
    pub fn new(substrate: S, table: ChannelTable) -> Self {
        ChannelRouter { substrate, table }
    }

    pub fn channels(&self) -> &ChannelTable {
        &self.table
    }

    pub fn substrate(&self) -> &S {
        &self.substrate
    }

    pub fn substrate_mut(&mut self) -> &mut S {
        &mut self.substrate
    }

    /// Send application data using the channel's configured mode
    ///
    /// `Ok(false)` means the substrate rejected the packet; retrying is up to
    /// the caller.
    pub fn send(&mut self, peer: PeerId, channel: u8, data: &[u8]) -> Result<bool, ChannelError> {
        let mode = self
            .table
            .mode(channel)
            .ok_or(ChannelError::InvalidChannel(channel))?;

        let sent = self.substrate.send_packet(peer, data, mode, channel);
        if sent {
            log::trace!("Sent {} bytes to {} on channel {}", data.len(), peer, channel);
        } else {
            log::debug!(
                "Substrate rejected {} bytes to {} on channel {}",
                data.len(),
                peer,
                channel
            );
        }
        Ok(sent)
    }

    /// Send a control message, always reliable on the control channel
    pub fn send_control(&mut self, peer: PeerId, msg: ControlMessage) -> bool {
        let sent = self.substrate.send_packet(
            peer,
            &msg.encode(),
            SendMode::Reliable,
            self.table.control_channel(),
        );
        if sent {
            log::trace!("Sent {} to {}", msg, peer);
        } else {
            log::warn!("Substrate rejected {} to {}", msg, peer);
        }
        sent
    }

    /// Read one packet queued on an application channel
    pub fn receive(&mut self, channel: u8) -> Option<(PeerId, Vec<u8>)> {
        if self.table.mode(channel).is_none() {
            return None;
        }
        self.substrate.read_packet(channel)
    }

    /// Read one packet queued on the control channel
    pub fn receive_control(&mut self) -> Option<(PeerId, Vec<u8>)> {
        self.substrate.read_packet(self.table.control_channel())
    }

    pub fn accept_session(&mut self, peer: PeerId) -> bool {
        self.substrate.accept_session(peer)
    }

    pub fn close_session(&mut self, peer: PeerId) -> bool {
        self.substrate.close_session(peer)
    }

    pub fn poll_event(&mut self) -> Option<SessionEvent> {
        self.substrate.poll_event()
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Channel configuration or addressing error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    /// No application channel configured
    NoChannels,
    /// More channels than fit in a channel byte
    TooManyChannels(usize),
    /// Index outside `0..N`
    InvalidChannel(u8),
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelError::NoChannels => write!(f, "at least one channel is required"),
            ChannelError::TooManyChannels(n) => {
                write!(f, "too many channels: {} (max {})", n, MAX_CHANNELS)
            }
            ChannelError::InvalidChannel(ch) => write!(f, "invalid channel index {}", ch),
        }
    }
}

impl std::error::Error for ChannelError {}

// ============================================================================
// Tests
// ============================================================================

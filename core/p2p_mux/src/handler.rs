//! Upward notifications
//!
//! The engine reports lifecycle changes and inbound data through a
//! [`ConnectionHandler`]. These four calls are the only way it talks to the
//! connection/listener objects above it. A handler error never aborts a
//! pump: the engine logs it and moves on to the next packet.

use crate::substrate::{PeerId, SessionError};

/// Error returned by a handler callback
pub type HandlerError = Box<dyn std::error::Error>;

/// Result of a handler callback
pub type HandlerResult = Result<(), HandlerError>;

/// Why a connection attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// Substrate could not establish the session
    Session(SessionError),
    /// Peer answered CONNECT with DISCONNECT
    Rejected,
    /// No ACCEPT_CONNECT within the connect timeout
    HandshakeTimeout,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Session(e) => write!(f, "connection failed: {}", e),
            FailureReason::Rejected => write!(f, "connection rejected by peer"),
            FailureReason::HandshakeTimeout => {
                write!(f, "connection timed out waiting for the peer to accept")
            }
        }
    }
}

/// Receiver of connection lifecycle events and application data
pub trait ConnectionHandler {
    /// Handshake completed with `peer`
    fn on_connected(&mut self, peer: PeerId) -> HandlerResult;

    /// `peer` closed an established connection
    fn on_disconnected(&mut self, peer: PeerId) -> HandlerResult;

    /// Connecting to (or keeping) `peer` failed
    fn on_connection_failed(&mut self, peer: PeerId, reason: FailureReason) -> HandlerResult;

    /// Payload received from `peer` on an application channel, verbatim
    fn on_data_received(&mut self, peer: PeerId, channel: u8, data: Vec<u8>) -> HandlerResult;
}

/// A handler call captured as a value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Connected(PeerId),
    Disconnected(PeerId),
    ConnectionFailed(PeerId, FailureReason),
    Data {
        peer: PeerId,
        channel: u8,
        data: Vec<u8>,
    },
}

/// Collect notifications for processing after the pump returns
impl ConnectionHandler for Vec<Notification> {
    fn on_connected(&mut self, peer: PeerId) -> HandlerResult {
        self.push(Notification::Connected(peer));
        Ok(())
    }

    fn on_disconnected(&mut self, peer: PeerId) -> HandlerResult {
        self.push(Notification::Disconnected(peer));
        Ok(())
    }

    fn on_connection_failed(&mut self, peer: PeerId, reason: FailureReason) -> HandlerResult {
        self.push(Notification::ConnectionFailed(peer, reason));
        Ok(())
    }

    fn on_data_received(&mut self, peer: PeerId, channel: u8, data: Vec<u8>) -> HandlerResult {
        self.push(Notification::Data {
            peer,
            channel,
            data,
        });
        Ok(())
    }
}

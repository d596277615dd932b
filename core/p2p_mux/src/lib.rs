//! P2P Channel Multiplexer
//!
//! Connection-oriented transport over a peer-to-peer datagram service:
//! - Numbered application channels with fixed reliability modes
//! - Reserved control channel carrying the CONNECT / ACCEPT_CONNECT /
//!   DISCONNECT handshake
//! - Per-peer lifecycle with deferred session teardown
//! - Cooperative pump: drain events, control, then data, never block
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                     ConnectionHandler                          │
//! │     on_connected / on_disconnected / on_connection_failed      │
//! │                     on_data_received                           │
//! ├───────────────────────────────────────────────────────────────┤
//! │  engine.rs     - handshake state machine, pump loop            │
//! │  scheduler.rs  - deferred close and connect timeout            │
//! │  control.rs    - 1-byte control message codec                  │
//! │  channel.rs    - channel table and router                      │
//! ├───────────────────────────────────────────────────────────────┤
//! │  substrate.rs  - Substrate trait (peer ids, sessions, events)  │
//! │  loopback.rs   - in-memory substrate for tests and demos       │
//! └───────────────────────────────────────────────────────────────┘
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod channel;
pub mod config;
pub mod control;
pub mod engine;
pub mod handler;
pub mod loopback;
pub mod scheduler;
pub mod stats;
pub mod substrate;

// Re-export commonly used types
pub use channel::{ChannelError, ChannelRouter, ChannelTable, SendMode, MAX_CHANNELS};
pub use config::{AcceptPolicy, ConfigError, TransportConfig, DEFAULT_DISCONNECT_DELAY_MS};
pub use control::{ControlError, ControlMessage};
pub use engine::{Engine, EngineError, PeerState, Role};
pub use handler::{ConnectionHandler, FailureReason, HandlerError, HandlerResult, Notification};
pub use loopback::{LoopbackNetwork, LoopbackSubstrate, SentPacket};
pub use scheduler::TaskKind;
pub use stats::TransportStats;
pub use substrate::{PeerId, SessionError, SessionEvent, Substrate};

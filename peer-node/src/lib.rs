//! Peer node
//!
//! Runs the channel multiplexer over plain UDP. The library half holds the
//! frame codec and the [`udp::UdpSubstrate`] so integration tests can drive
//! two engines over real sockets; `main.rs` is the event loop.

pub mod frame;
pub mod udp;

pub use frame::{Frame, FrameError, HEADER_LEN, MAX_PAYLOAD};
pub use udp::{UdpSubstrate, SESSION_TIMEOUT};

//! UDP frame codec
//!
//! Every datagram carries one multiplexer packet:
//!
//! ```text
//!   0      1                9         10     11
//!   ┌──────┬────────────────┬─────────┬──────┬──────────────┐
//!   │ 0xF5 │ sender PeerId  │ channel │ mode │ payload ...  │
//!   │      │ (u64, BE)      │         │      │ (<= 1200)    │
//!   └──────┴────────────────┴─────────┴──────┴──────────────┘
//! ```

use p2p_mux::{PeerId, SendMode};

// ============================================================================
// Constants
// ============================================================================

/// First byte of every frame
pub const FRAME_MAGIC: u8 = 0xF5;

/// Magic + sender + channel + mode
pub const HEADER_LEN: usize = 1 + PeerId::LEN + 1 + 1;

/// Largest payload carried in one frame (keeps datagrams under common MTUs)
pub const MAX_PAYLOAD: usize = 1200;

/// Largest valid frame
pub const MAX_FRAME_LEN: usize = HEADER_LEN + MAX_PAYLOAD;

// ============================================================================
// Frame
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub sender: PeerId,
    pub channel: u8,
    pub mode: SendMode,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Encode into a datagram
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(FrameError::PayloadTooLarge(self.payload.len()));
        }

        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.push(FRAME_MAGIC);
        buf.extend_from_slice(&self.sender.to_be_bytes());
        buf.push(self.channel);
        buf.push(self.mode.to_byte());
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Decode a received datagram
    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < HEADER_LEN {
            return Err(FrameError::TooShort(data.len()));
        }
        if data[0] != FRAME_MAGIC {
            return Err(FrameError::BadMagic(data[0]));
        }
        if data.len() > MAX_FRAME_LEN {
            return Err(FrameError::PayloadTooLarge(data.len() - HEADER_LEN));
        }

        let mut id = [0u8; PeerId::LEN];
        id.copy_from_slice(&data[1..1 + PeerId::LEN]);
        let channel = data[HEADER_LEN - 2];
        let mode = SendMode::from_byte(data[HEADER_LEN - 1])
            .ok_or(FrameError::BadMode(data[HEADER_LEN - 1]))?;

        Ok(Frame {
            sender: PeerId::from_be_bytes(id),
            channel,
            mode,
            payload: data[HEADER_LEN..].to_vec(),
        })
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    TooShort(usize),
    BadMagic(u8),
    BadMode(u8),
    PayloadTooLarge(usize),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::TooShort(len) => {
                write!(f, "frame too short: {} bytes (header is {})", len, HEADER_LEN)
            }
            FrameError::BadMagic(b) => write!(f, "bad frame magic 0x{:02x}", b),
            FrameError::BadMode(b) => write!(f, "unknown send mode {}", b),
            FrameError::PayloadTooLarge(len) => {
                write!(f, "payload too large: {} bytes (max {})", len, MAX_PAYLOAD)
            }
        }
    }
}

impl std::error::Error for FrameError {}

//! Control channel messages
//!
//! The handshake runs over the reserved control channel. Every control
//! packet is exactly one byte:
//!
//! ```text
//! ┌──────────┬──────────────────┐
//! │ 0x00     │ CONNECT          │
//! │ 0x01     │ ACCEPT_CONNECT   │
//! │ 0x02     │ DISCONNECT       │
//! └──────────┴──────────────────┘
//! ```
//!
//! Anything else on the control channel is a protocol violation: dropped,
//! never fatal.

/// Length of every control packet
pub const CONTROL_MESSAGE_LEN: usize = 1;

/// Handshake message carried on the control channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ControlMessage {
    /// Initiator asks to open a connection
    Connect = 0,
    /// Listener accepts the connection
    AcceptConnect = 1,
    /// Either side closes the connection
    Disconnect = 2,
}

impl ControlMessage {
    /// Encode as a single-byte packet
    pub fn encode(self) -> [u8; CONTROL_MESSAGE_LEN] {
        [self as u8]
    }

    /// Decode a control packet
    pub fn decode(data: &[u8]) -> Result<Self, ControlError> {
        if data.len() != CONTROL_MESSAGE_LEN {
            return Err(ControlError::BadLength(data.len()));
        }

        match data[0] {
            0 => Ok(ControlMessage::Connect),
            1 => Ok(ControlMessage::AcceptConnect),
            2 => Ok(ControlMessage::Disconnect),
            other => Err(ControlError::UnknownType(other)),
        }
    }
}

impl std::fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlMessage::Connect => write!(f, "CONNECT"),
            ControlMessage::AcceptConnect => write!(f, "ACCEPT_CONNECT"),
            ControlMessage::Disconnect => write!(f, "DISCONNECT"),
        }
    }
}

/// Malformed control packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlError {
    /// Payload is not exactly one byte
    BadLength(usize),
    /// One byte, but not a known message type
    UnknownType(u8),
}

impl std::fmt::Display for ControlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlError::BadLength(len) => write!(
                f,
                "incorrect packet length on control channel: {} bytes (expected {})",
                len, CONTROL_MESSAGE_LEN
            ),
            ControlError::UnknownType(ty) => {
                write!(f, "unknown control message type 0x{:02x}", ty)
            }
        }
    }
}

impl std::error::Error for ControlError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_values() {
        assert_eq!(ControlMessage::Connect.encode(), [0]);
        assert_eq!(ControlMessage::AcceptConnect.encode(), [1]);
        assert_eq!(ControlMessage::Disconnect.encode(), [2]);
    }

    #[test]
    fn test_decode_known() {
        assert_eq!(ControlMessage::decode(&[0]), Ok(ControlMessage::Connect));
        assert_eq!(ControlMessage::decode(&[1]), Ok(ControlMessage::AcceptConnect));
        assert_eq!(ControlMessage::decode(&[2]), Ok(ControlMessage::Disconnect));
    }

    #[test]
    fn test_decode_bad_length() {
        assert_eq!(ControlMessage::decode(&[]), Err(ControlError::BadLength(0)));
        assert_eq!(ControlMessage::decode(&[0, 0]), Err(ControlError::BadLength(2)));
        assert_eq!(
            ControlMessage::decode(&[1, 2, 3, 4]),
            Err(ControlError::BadLength(4))
        );
    }

    #[test]
    fn test_decode_unknown_type() {
        assert_eq!(ControlMessage::decode(&[3]), Err(ControlError::UnknownType(3)));
        assert_eq!(
            ControlMessage::decode(&[0xff]),
            Err(ControlError::UnknownType(0xff))
        );
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            ControlError::BadLength(2).to_string(),
            "incorrect packet length on control channel: 2 bytes (expected 1)"
        );
        assert_eq!(
            ControlError::UnknownType(9).to_string(),
            "unknown control message type 0x09"
        );
    }
}

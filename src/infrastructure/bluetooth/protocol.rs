//! Headset Wire Protocol
//!
//! Frame layout shared by commands and device messages:
//!
//! ```text
//! [0-2] : Opcode (commands) or message prefix (device messages)
//! [3]   : Payload length (0-255)
//! [4..] : Payload
//! ```
//!
//! Everything here is pure; reading bytes off the stream is the reader's job.

use crate::error::{ProtocolError, Result};

/// RFCOMM service channel the headset listens on
pub const RFCOMM_CHANNEL: u8 = 8;

/// Opcode / message prefix length
pub const PREFIX_LEN: usize = 3;

/// Full header length: prefix plus payload length byte
pub const HEADER_LEN: usize = 4;

/// Largest payload a single length byte can announce
pub const MAX_PAYLOAD_LEN: usize = u8::MAX as usize;

/// Commands sent to the headset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Protocol handshake, answered with a connect ack
    Connect,
    /// Ask for the current settings (ANC level among them)
    QueryStatus,
    /// Ask for the battery percentage
    QueryBattery,
    /// Set the noise cancellation level (1-byte wire level payload)
    SetAnc,
}

impl Command {
    /// Get the fixed opcode for this command
    pub fn opcode(&self) -> [u8; PREFIX_LEN] {
        match self {
            Self::Connect => [0x00, 0x01, 0x01],
            Self::QueryStatus => [0x01, 0x01, 0x05],
            Self::QueryBattery => [0x02, 0x02, 0x01],
            Self::SetAnc => [0x01, 0x06, 0x02],
        }
    }
}

/// Messages received from the headset.
///
/// `Disconnect` never appears on the wire; the client emits it when the
/// session is torn down so subscribers see one ordered stream of signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Message {
    ConnectAck,
    AncLevel,
    BatteryLevel,
    Disconnect,
    Unknown,
}

/// Messages that can be recognised from a header prefix
const KNOWN_MESSAGES: [Message; 3] = [Message::ConnectAck, Message::AncLevel, Message::BatteryLevel];

impl Message {
    /// Header prefix for messages that exist on the wire
    pub fn prefix(&self) -> Option<[u8; PREFIX_LEN]> {
        match self {
            Self::ConnectAck => Some([0x00, 0x01, 0x03]),
            Self::AncLevel => Some([0x01, 0x06, 0x03]),
            Self::BatteryLevel => Some([0x02, 0x02, 0x03]),
            Self::Disconnect | Self::Unknown => None,
        }
    }
}

/// A command together with its payload, validated against the length byte
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    command: Command,
    payload: Vec<u8>,
}

impl OutboundFrame {
    pub fn new(command: Command, payload: &[u8]) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::PayloadTooLarge { len: payload.len() });
        }
        Ok(Self {
            command,
            payload: payload.to_vec(),
        })
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Serialize into wire bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.payload.len());
        bytes.extend_from_slice(&self.command.opcode());
        // Length was checked in `new`
        bytes.push(self.payload.len() as u8);
        bytes.extend_from_slice(&self.payload);
        bytes
    }
}

/// Encode a command frame: opcode, length byte, payload
pub fn encode(command: Command, payload: &[u8]) -> Result<Vec<u8>> {
    Ok(OutboundFrame::new(command, payload)?.to_bytes())
}

/// Classify an inbound header by its 3-byte prefix
pub fn classify_header(header: &[u8]) -> Message {
    if header.len() < PREFIX_LEN {
        return Message::Unknown;
    }

    KNOWN_MESSAGES
        .iter()
        .copied()
        .find(|message| {
            message
                .prefix()
                .is_some_and(|prefix| header[..PREFIX_LEN] == prefix)
        })
        .unwrap_or(Message::Unknown)
}

/// Number of payload bytes announced by a header
pub fn payload_length(header: &[u8]) -> Result<usize> {
    if header.len() < HEADER_LEN {
        return Err(ProtocolError::MalformedHeader { len: header.len() });
    }
    Ok(header[PREFIX_LEN] as usize)
}

/// Offset of the first known message prefix in `bytes`, if any.
///
/// Used to line the reader back up with frame boundaries after a short read.
pub fn find_frame_start(bytes: &[u8]) -> Option<usize> {
    bytes
        .windows(PREFIX_LEN)
        .position(|window| classify_header(window) != Message::Unknown)
}

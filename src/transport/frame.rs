//! Unit encoding and decoding for the RUC wire format.
//!
//! Every datagram carries exactly one unit:
//!
//! ```text
//! +---------+-----------------+-------------------+-----------------+---------+
//! | Control | Sequence        | Send timestamp    | Ack target      | Payload |
//! | 1 byte  | 2 bytes (LE16)  | 8 bytes (LE64 ms) | 2 bytes (LE16)  | rest    |
//! +---------+-----------------+-------------------+-----------------+---------+
//!             only if NOACK is clear                only for          only if
//!                                                   ACK / CONNECT_ACK HASDATA
//! ```
//!
//! Control byte, most significant bit first:
//!
//! ```text
//! +------+---------+-------+-------+----------+---------------+
//! | MORE | HASDATA | NOACK | RETRY | reserved | COMMAND (3)   |
//! +------+---------+-------+-------+----------+---------------+
//! ```

use thiserror::Error;

use crate::core::constants::{
    ACK_TARGET_SIZE, CMD_ACK, CMD_CLOSE, CMD_CONNECT, CMD_CONNECT_ACK, CMD_DATA, CMD_HEARTBEAT,
    COMMAND_MASK, CONNECT_REQUEST_SIZE, CONTROL_SIZE, FLAG_HAS_DATA, FLAG_MORE, FLAG_NO_ACK,
    FLAG_RETRY, SEQUENCED_HEADER_SIZE,
};

/// Errors produced while decoding a datagram.
///
/// None of these are reported to the peer or the application: the datagram is
/// dropped and logged.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Datagram shorter than its header requires.
    #[error("unit too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum length for this unit.
        expected: usize,
        /// Actual length.
        actual: usize,
    },

    /// NOACK and RETRY together are a protocol violation.
    #[error("NOACK unit marked as retry")]
    NoAckRetry,

    /// Command requires a sequenced header but NOACK was set.
    #[error("{0:?} requires a sequence header")]
    MissingHeader(Command),

    /// Neither a control unit nor a data-bearing unit.
    #[error("unroutable unit with control byte {0:#04x}")]
    Unroutable(u8),
}

/// Command field of the control byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Data segment.
    Data = CMD_DATA,
    /// Connect request.
    Connect = CMD_CONNECT,
    /// Acknowledgment.
    Ack = CMD_ACK,
    /// Combined connect-acknowledgment.
    ConnectAck = CMD_CONNECT_ACK,
    /// Close.
    Close = CMD_CLOSE,
    /// Heartbeat.
    Heartbeat = CMD_HEARTBEAT,
}

impl Command {
    /// Parse the command from the low three bits of a control byte.
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits & COMMAND_MASK {
            CMD_DATA => Some(Self::Data),
            CMD_CONNECT => Some(Self::Connect),
            CMD_ACK => Some(Self::Ack),
            CMD_CONNECT_ACK => Some(Self::ConnectAck),
            CMD_CLOSE => Some(Self::Close),
            CMD_HEARTBEAT => Some(Self::Heartbeat),
            _ => None,
        }
    }

    /// Command bits.
    pub fn as_bits(self) -> u8 {
        self as u8
    }

    /// Whether units with this command carry an acknowledgment target.
    pub fn carries_ack_target(self) -> bool {
        matches!(self, Self::Ack | Self::ConnectAck)
    }
}

/// The control byte leading every unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlByte(u8);

impl ControlByte {
    /// Control byte for the given command with no flags set.
    pub fn new(command: Command) -> Self {
        Self(command.as_bits())
    }

    /// Create from a raw byte.
    pub fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    /// Raw byte value.
    pub fn as_byte(self) -> u8 {
        self.0
    }

    /// Raw command bits (0..=7).
    pub fn command_bits(self) -> u8 {
        self.0 & COMMAND_MASK
    }

    /// Decoded command, if the bits name one.
    pub fn command(self) -> Option<Command> {
        Command::from_bits(self.0)
    }

    /// MORE flag.
    pub fn is_more(self) -> bool {
        self.0 & FLAG_MORE != 0
    }

    /// HASDATA flag.
    pub fn has_data(self) -> bool {
        self.0 & FLAG_HAS_DATA != 0
    }

    /// NOACK flag.
    pub fn is_no_ack(self) -> bool {
        self.0 & FLAG_NO_ACK != 0
    }

    /// RETRY flag.
    pub fn is_retry(self) -> bool {
        self.0 & FLAG_RETRY != 0
    }

    /// Control units have a command in 1..=5 and MORE clear.
    pub fn is_control(self) -> bool {
        (CMD_CONNECT..=CMD_HEARTBEAT).contains(&self.command_bits()) && !self.is_more()
    }

    /// Set MORE.
    pub fn with_more(self) -> Self {
        Self(self.0 | FLAG_MORE)
    }

    /// Set HASDATA.
    pub fn with_data(self) -> Self {
        Self(self.0 | FLAG_HAS_DATA)
    }

    /// Set NOACK.
    pub fn with_no_ack(self) -> Self {
        Self(self.0 | FLAG_NO_ACK)
    }

    /// Set RETRY.
    pub fn with_retry(self) -> Self {
        Self(self.0 | FLAG_RETRY)
    }
}

/// An inbound unit, decoded once at the protocol boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Connect request.
    Connect {
        /// Sequence number (0 for a fresh request).
        seq: u16,
        /// Sender's timestamp.
        timestamp: u64,
        /// RETRY flag.
        retry: bool,
    },
    /// Acknowledgment of a single sequence number.
    Ack {
        /// Acknowledged sequence number.
        ack: u16,
    },
    /// Combined connect-acknowledgment.
    ConnectAck {
        /// Sequence number.
        seq: u16,
        /// Sender's timestamp.
        timestamp: u64,
        /// Acknowledged sequence number.
        ack: u16,
        /// RETRY flag.
        retry: bool,
    },
    /// Close, forced when NOACK is set.
    Close {
        /// NOACK flag.
        forced: bool,
        /// Reason supplied by the peer, possibly empty.
        reason: Vec<u8>,
    },
    /// Heartbeat.
    Heartbeat {
        /// Sequence number.
        seq: u16,
        /// Sender's timestamp.
        timestamp: u64,
        /// RETRY flag.
        retry: bool,
    },
    /// Sequenced data that must be acknowledged.
    Data {
        /// Sequence number.
        seq: u16,
        /// Sender's timestamp.
        timestamp: u64,
        /// MORE flag.
        more: bool,
        /// RETRY flag.
        retry: bool,
        /// Payload bytes.
        payload: Vec<u8>,
    },
    /// Fire-and-forget data with no header.
    Unreliable {
        /// Payload bytes.
        payload: Vec<u8>,
    },
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}

fn require(bytes: &[u8], expected: usize) -> Result<(), FrameError> {
    if bytes.len() < expected {
        return Err(FrameError::TooShort {
            expected,
            actual: bytes.len(),
        });
    }
    Ok(())
}

impl Segment {
    /// Decode a datagram.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        require(bytes, CONTROL_SIZE)?;
        let control = ControlByte::from_byte(bytes[0]);
        let retry = control.is_retry();

        if control.is_no_ack() && retry {
            return Err(FrameError::NoAckRetry);
        }

        if control.is_control() {
            // is_control() guarantees a named command
            let command = control
                .command()
                .ok_or(FrameError::Unroutable(control.as_byte()))?;
            return Self::decode_control(command, control, bytes);
        }

        match (control.is_no_ack(), control.has_data()) {
            (false, true) => {
                require(bytes, SEQUENCED_HEADER_SIZE + 1)?;
                Ok(Self::Data {
                    seq: read_u16(bytes, 1),
                    timestamp: read_u64(bytes, 3),
                    more: control.is_more(),
                    retry,
                    payload: bytes[SEQUENCED_HEADER_SIZE..].to_vec(),
                })
            }
            (true, true) => {
                require(bytes, CONTROL_SIZE + 1)?;
                Ok(Self::Unreliable {
                    payload: bytes[CONTROL_SIZE..].to_vec(),
                })
            }
            _ => Err(FrameError::Unroutable(control.as_byte())),
        }
    }

    fn decode_control(
        command: Command,
        control: ControlByte,
        bytes: &[u8],
    ) -> Result<Self, FrameError> {
        let retry = control.is_retry();
        let sequenced = !control.is_no_ack();

        match command {
            Command::Ack if !sequenced => {
                require(bytes, CONTROL_SIZE + ACK_TARGET_SIZE)?;
                Ok(Self::Ack {
                    ack: read_u16(bytes, CONTROL_SIZE),
                })
            }
            Command::Ack => {
                require(bytes, SEQUENCED_HEADER_SIZE + ACK_TARGET_SIZE)?;
                Ok(Self::Ack {
                    ack: read_u16(bytes, SEQUENCED_HEADER_SIZE),
                })
            }
            Command::Close => {
                let header = if sequenced {
                    SEQUENCED_HEADER_SIZE
                } else {
                    CONTROL_SIZE
                };
                require(bytes, header)?;
                let reason = if control.has_data() {
                    bytes[header..].to_vec()
                } else {
                    Vec::new()
                };
                Ok(Self::Close {
                    forced: !sequenced,
                    reason,
                })
            }
            _ if !sequenced => Err(FrameError::MissingHeader(command)),
            Command::Connect => {
                require(bytes, SEQUENCED_HEADER_SIZE)?;
                Ok(Self::Connect {
                    seq: read_u16(bytes, 1),
                    timestamp: read_u64(bytes, 3),
                    retry,
                })
            }
            Command::ConnectAck => {
                require(bytes, SEQUENCED_HEADER_SIZE + ACK_TARGET_SIZE)?;
                Ok(Self::ConnectAck {
                    seq: read_u16(bytes, 1),
                    timestamp: read_u64(bytes, 3),
                    ack: read_u16(bytes, SEQUENCED_HEADER_SIZE),
                    retry,
                })
            }
            Command::Heartbeat => {
                require(bytes, SEQUENCED_HEADER_SIZE)?;
                Ok(Self::Heartbeat {
                    seq: read_u16(bytes, 1),
                    timestamp: read_u64(bytes, 3),
                    retry,
                })
            }
            Command::Data => Err(FrameError::Unroutable(control.as_byte())),
        }
    }

    /// Check whether a datagram from an unknown source is a fresh connect
    /// request: exactly the minimal header, COMMAND=1, sequence 0.
    pub fn is_fresh_connect_request(bytes: &[u8]) -> bool {
        if bytes.len() != CONNECT_REQUEST_SIZE {
            return false;
        }
        let control = ControlByte::from_byte(bytes[0]);
        let base = control.as_byte() & !FLAG_RETRY;
        base == CMD_CONNECT && read_u16(bytes, 1) == 0
    }
}

/// An outbound unit, before the send timestamp is stamped on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Control byte.
    pub control: ControlByte,
    /// Sequence number (ignored when NOACK is set).
    pub seq: u16,
    /// Acknowledgment target (only written for ACK / CONNECT_ACK).
    pub ack: u16,
    /// Payload (only written when HASDATA is set).
    pub payload: Vec<u8>,
}

impl Frame {
    /// Connect request, sequence 0.
    pub fn connect() -> Self {
        Self {
            control: ControlByte::new(Command::Connect),
            seq: 0,
            ack: 0,
            payload: Vec::new(),
        }
    }

    /// Combined connect-acknowledgment, sequence 0, ack target 0.
    pub fn connect_ack() -> Self {
        Self {
            control: ControlByte::new(Command::ConnectAck),
            seq: 0,
            ack: 0,
            payload: Vec::new(),
        }
    }

    /// Bare acknowledgment (NOACK) of `ack`.
    pub fn ack(ack: u16) -> Self {
        Self {
            control: ControlByte::new(Command::Ack).with_no_ack(),
            seq: 0,
            ack,
            payload: Vec::new(),
        }
    }

    /// Close unit (NOACK), carrying `reason` when non-empty.
    pub fn close(reason: &[u8]) -> Self {
        let mut control = ControlByte::new(Command::Close).with_no_ack();
        if !reason.is_empty() {
            control = control.with_data();
        }
        Self {
            control,
            seq: 0,
            ack: 0,
            payload: reason.to_vec(),
        }
    }

    /// Heartbeat at `seq`.
    pub fn heartbeat(seq: u16) -> Self {
        Self {
            control: ControlByte::new(Command::Heartbeat),
            seq,
            ack: 0,
            payload: Vec::new(),
        }
    }

    /// Sequenced data unit.
    pub fn data(seq: u16, payload: Vec<u8>, more: bool) -> Self {
        let mut control = ControlByte::new(Command::Data).with_data();
        if more {
            control = control.with_more();
        }
        Self {
            control,
            seq,
            ack: 0,
            payload,
        }
    }

    /// Fire-and-forget data unit.
    pub fn unreliable(payload: Vec<u8>) -> Self {
        Self {
            control: ControlByte::new(Command::Data).with_data().with_no_ack(),
            seq: 0,
            ack: 0,
            payload,
        }
    }

    /// Mark as a retransmission.
    pub fn mark_retry(&mut self) {
        self.control = self.control.with_retry();
    }

    /// Encoded length.
    pub fn encoded_len(&self) -> usize {
        let mut len = CONTROL_SIZE;
        if !self.control.is_no_ack() {
            len += SEQUENCED_HEADER_SIZE - CONTROL_SIZE;
        }
        if self.carries_ack_target() {
            len += ACK_TARGET_SIZE;
        }
        if self.control.has_data() {
            len += self.payload.len();
        }
        len
    }

    fn carries_ack_target(&self) -> bool {
        self.control
            .command()
            .is_some_and(Command::carries_ack_target)
    }

    /// Serialize with the given send timestamp.
    pub fn encode(&self, timestamp: u64) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.push(self.control.as_byte());
        if !self.control.is_no_ack() {
            buf.extend_from_slice(&self.seq.to_le_bytes());
            buf.extend_from_slice(&timestamp.to_le_bytes());
        }
        if self.carries_ack_target() {
            buf.extend_from_slice(&self.ack.to_le_bytes());
        }
        if self.control.has_data() {
            buf.extend_from_slice(&self.payload);
        }
        buf
    }
}

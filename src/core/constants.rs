//! Protocol constants for RUC.
//!
//! Wire values are fixed by the protocol and MUST NOT be changed. Timing and
//! sizing values are the defaults used by [`ConnectionConfig`] and may be
//! overridden per connection.
//!
//! [`ConnectionConfig`]: crate::transport::ConnectionConfig

use std::time::Duration;

// =============================================================================
// CONTROL BYTE
// =============================================================================

/// Bit 7: unit is a non-final fragment of a multi-fragment message.
pub const FLAG_MORE: u8 = 0x80;

/// Bit 6: a payload follows the header.
pub const FLAG_HAS_DATA: u8 = 0x40;

/// Bit 5: no sequence/timestamp header, no acknowledgment required.
pub const FLAG_NO_ACK: u8 = 0x20;

/// Bit 4: retransmission of a previously sent unit.
pub const FLAG_RETRY: u8 = 0x10;

/// Bits 2..0: command field.
pub const COMMAND_MASK: u8 = 0x07;

/// Data segment.
pub const CMD_DATA: u8 = 0;

/// Connect request.
pub const CMD_CONNECT: u8 = 1;

/// Acknowledgment.
pub const CMD_ACK: u8 = 2;

/// Combined connect-acknowledgment.
pub const CMD_CONNECT_ACK: u8 = 3;

/// Close.
pub const CMD_CLOSE: u8 = 4;

/// Heartbeat.
pub const CMD_HEARTBEAT: u8 = 5;

// =============================================================================
// HEADER SIZES
// =============================================================================

/// Control byte size.
pub const CONTROL_SIZE: usize = 1;

/// Sequence number size (LE16).
pub const SEQUENCE_SIZE: usize = 2;

/// Send timestamp size (LE64, milliseconds since the Unix epoch).
pub const TIMESTAMP_SIZE: usize = 8;

/// Acknowledgment target size (LE16).
pub const ACK_TARGET_SIZE: usize = 2;

/// Control byte + sequence + timestamp.
pub const SEQUENCED_HEADER_SIZE: usize = CONTROL_SIZE + SEQUENCE_SIZE + TIMESTAMP_SIZE;

/// A fresh connect request is exactly this long.
pub const CONNECT_REQUEST_SIZE: usize = SEQUENCED_HEADER_SIZE;

// =============================================================================
// SEQUENCING
// =============================================================================

/// Sequence numbers live in a 16-bit space.
pub const SEQUENCE_SPACE: u32 = 1 << 16;

/// Receive cursor before any handshake has run.
pub const INITIAL_RECV_CURSOR: u16 = u16::MAX;

/// Largest number of fragments a single message may be split into.
pub const MAX_FRAGMENTS: usize = 65534;

/// Units further ahead of the receive cursor than this are treated as old.
pub const MAX_RECV_AHEAD: u16 = 0x8000;

/// Largest send window; a wider one could put units past the peer's
/// [`MAX_RECV_AHEAD`] horizon.
pub const MAX_WINDOW_SIZE: usize = MAX_RECV_AHEAD as usize;

/// Shortest acknowledgment timeout. Wire timestamps have millisecond
/// resolution, so a retransmission must land in a later millisecond than the
/// unit it repeats.
pub const MIN_ACK_TIMEOUT: Duration = Duration::from_millis(1);

// =============================================================================
// DEFAULTS
// =============================================================================

/// Default payload bytes per fragment.
pub const DEFAULT_FRAGMENT_SIZE: usize = 1024;

/// Default send window size (units in flight).
pub const DEFAULT_WINDOW_SIZE: usize = 256;

/// Default retransmissions before a unit is given up on.
pub const DEFAULT_RETRY_LIMIT: u32 = 5;

/// Default time to wait for an acknowledgment before retransmitting.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_millis(500);

/// Default heartbeat period on an idle established connection.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);

/// Default cap on concurrently established connections per manager.
pub const DEFAULT_MAX_CONNECTIONS: usize = 65535;

/// Default receive buffer size for endpoint sockets.
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 65535;

// =============================================================================
// DISCONNECT REASONS
// =============================================================================

/// Reasons the protocol itself attaches to disconnect notifications.
pub mod reasons {
    /// A unit exhausted its retry budget.
    pub const ACK_TIMEOUT: &[u8] = b"peer acknowledgment timeout";

    /// Two distinct units arrived for the same receive window slot.
    pub const WINDOW_OVERLAP: &[u8] = b"receive window overlap: sequence number reused without retry";

    /// The manager already holds its maximum number of connections.
    pub const CAPACITY_EXCEEDED: &[u8] = b"connection limit reached";

    /// The manager is shutting down.
    pub const MANAGER_SHUTDOWN: &[u8] = b"connection manager shut down";

    /// No socket is bound for the peer's address family.
    pub const SOCKET_UNBOUND: &[u8] = b"no socket bound for the peer's address family";
}

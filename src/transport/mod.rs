//! RUC Protocol - Transport Layer
//!
//! Everything that concerns a single peer:
//!
//! - **Wire codec**: [`Frame`] (outbound) and [`Segment`] (inbound) over the
//!   control-byte format
//! - **Sequence arithmetic**: wrapping 16-bit helpers in [`sequence`]
//! - **Packet/Timer units**: [`PendingUnit`] with its retransmission deadline
//! - **Timestamps**: [`WallClock`] stamping and [`StalenessGuard`] checking
//! - **Connection engine**: [`Connection`], the per-peer state machine
//! - **Async sockets**: [`RucSocket`] wrapper for tokio UDP (`runtime` feature)
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │           Application                   │
//! ├─────────────────────────────────────────┤
//! │   Manager (demux, capacity, connects)   │
//! ├─────────────────────────────────────────┤
//! │   Connection engine                     │  ← This module
//! │   windows, fragments, retries, codec    │
//! ├─────────────────────────────────────────┤
//! │              UDP                        │
//! └─────────────────────────────────────────┘
//! ```

mod connection;
mod frame;
pub mod sequence;
#[cfg(feature = "runtime")]
mod socket;
mod timing;
mod unit;

pub use connection::*;
pub use frame::*;
#[cfg(feature = "runtime")]
pub use socket::*;
pub use timing::{StalenessGuard, WallClock};
pub use unit::PendingUnit;

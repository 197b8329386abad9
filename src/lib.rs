//! # RUC Protocol
//!
//! **R**eliable **U**DP **C**onnections
//!
//! RUC is a small connection-oriented transport layered on UDP datagrams. It
//! gives each pair of endpoints an ordered, acknowledged message channel:
//!
//! - **Handshake**: three-step connect (request, combined ack, ack)
//! - **Reliability**: per-unit retransmission with a retry budget
//! - **Ordering**: sliding send window, receive window reordering
//! - **Fragmentation**: large messages split and reassembled transparently
//! - **Liveness**: heartbeats on idle connections
//!
//! ## Feature Flags
//!
//! - `runtime` (default): tokio sockets and the [`manager::Endpoint`] run loop.
//!   Without it the crate is a pure sans-IO protocol library.
//!
//! ## Modules
//!
//! - [`core`]: Constants, disconnect reasons, and error types
//! - [`transport`]: Wire codec and the per-peer [`Connection`] engine
//! - [`manager`]: Multi-peer [`Manager`] and its tokio driver
//!
//! ## Example Usage
//!
//! Two sans-IO managers wired back to back:
//!
//! ```rust
//! use std::time::Instant;
//! use ruc_protocol::prelude::*;
//!
//! let a_addr = "127.0.0.1:4000".parse().unwrap();
//! let b_addr = "127.0.0.1:5000".parse().unwrap();
//! let mut a = Manager::new(ManagerConfig::default());
//! let mut b = Manager::new(ManagerConfig::default());
//! a.mark_bound(AddressFamily::V4);
//! b.mark_bound(AddressFamily::V4);
//!
//! let now = Instant::now();
//! a.connect(b_addr, now);
//! loop {
//!     let mut idle = true;
//!     while let Some(t) = a.poll_transmit() {
//!         b.handle_datagram(a_addr, &t.payload, now);
//!         idle = false;
//!     }
//!     while let Some(t) = b.poll_transmit() {
//!         a.handle_datagram(b_addr, &t.payload, now);
//!         idle = false;
//!     }
//!     if idle {
//!         break;
//!     }
//! }
//!
//! assert_eq!(a.poll_event(), Some(ManagerEvent::Connected { peer: b_addr }));
//! assert_eq!(b.poll_event(), Some(ManagerEvent::Connected { peer: a_addr }));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Core module (always included)
pub mod core;

// Per-peer protocol engine
pub mod transport;

// Multi-peer manager and runtime driver
pub mod manager;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::*;

    pub use crate::transport::{
        Connection, ConnectionConfig, ConnectionConfigBuilder, ConnectionEvent, ConnectionPhase,
        FrameError,
    };

    pub use crate::manager::{
        AddressFamily, BoundFamilies, Manager, ManagerConfig, ManagerConfigBuilder,
        ManagerError, ManagerEvent, Transmit,
    };

    #[cfg(feature = "runtime")]
    pub use crate::manager::{
        Endpoint, EndpointConfig, EndpointError, EndpointEvent, EndpointHandle,
    };
}

// Re-export commonly used items at crate root
pub use crate::core::{ConnectionError, reasons};
pub use manager::{Manager, ManagerConfig, ManagerEvent};
pub use transport::{Connection, ConnectionConfig, ConnectionEvent, ConnectionPhase};

#[cfg(feature = "runtime")]
#[cfg_attr(docsrs, doc(cfg(feature = "runtime")))]
pub use manager::{Endpoint, EndpointConfig, EndpointError, EndpointEvent, EndpointHandle};

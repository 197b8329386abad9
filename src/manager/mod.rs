//! RUC Protocol - Connection Manager
//!
//! - [`Manager`]: sans-IO demultiplexer keyed by peer address, with the
//!   capacity limit, outbound connects, and manager-wide shutdown
//! - [`Endpoint`] / [`EndpointHandle`]: tokio task owning the manager and the
//!   per-family sockets (`runtime` feature)

#[cfg(feature = "runtime")]
mod endpoint;
#[allow(clippy::module_inception)]
mod manager;

#[cfg(feature = "runtime")]
pub use endpoint::*;
pub use manager::*;

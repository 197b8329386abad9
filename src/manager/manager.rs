//! Connection manager: demultiplexing, capacity, outbound connects, shutdown.
//!
//! Like [`Connection`], the manager is sans-IO. It is fed datagrams tagged with
//! their source address and hands back [`Transmit`]s tagged with their
//! destination; the caller owns the sockets and the clock.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::core::ConnectionError;
use crate::core::constants::{DEFAULT_MAX_CONNECTIONS, reasons};
use crate::transport::{
    Connection, ConnectionConfig, ConnectionEvent, ConnectionPhase, Segment,
};

/// Errors returned by per-peer manager operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ManagerError {
    /// No connection, pending or established, for this peer.
    #[error("no connection for peer {0}")]
    UnknownPeer(SocketAddr),

    /// The connection refused the operation.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// IP address family of a socket or peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    /// IPv4.
    V4,
    /// IPv6.
    V6,
}

impl AddressFamily {
    /// Family of a socket address.
    pub fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => Self::V4,
            SocketAddr::V6(_) => Self::V6,
        }
    }
}

/// Which address families currently have a bound socket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BoundFamilies {
    /// IPv4 socket bound.
    pub v4: bool,
    /// IPv6 socket bound.
    pub v6: bool,
}

impl BoundFamilies {
    /// Whether `family` is bound.
    pub fn contains(&self, family: AddressFamily) -> bool {
        match family {
            AddressFamily::V4 => self.v4,
            AddressFamily::V6 => self.v6,
        }
    }

    /// Whether nothing is bound.
    pub fn is_empty(&self) -> bool {
        !self.v4 && !self.v6
    }

    fn set(&mut self, family: AddressFamily, bound: bool) {
        match family {
            AddressFamily::V4 => self.v4 = bound,
            AddressFamily::V6 => self.v6 = bound,
        }
    }
}

/// Manager configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Cap on concurrently established connections.
    pub max_connections: usize,
    /// Configuration given to every new connection.
    pub connection: ConnectionConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connection: ConnectionConfig::default(),
        }
    }
}

/// Builder for [`ManagerConfig`].
#[derive(Debug, Default)]
pub struct ManagerConfigBuilder {
    config: ManagerConfig,
}

impl ManagerConfigBuilder {
    /// Start from the defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connection cap. Zero is ignored.
    pub fn max_connections(mut self, max: usize) -> Self {
        if max > 0 {
            self.config.max_connections = max;
        }
        self
    }

    /// Set the per-connection configuration.
    pub fn connection(mut self, config: ConnectionConfig) -> Self {
        self.config.connection = config;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> ManagerConfig {
        self.config
    }
}

/// A datagram the manager wants sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit {
    /// Peer to send to.
    pub destination: SocketAddr,
    /// Encoded unit.
    pub payload: Vec<u8>,
}

/// Notification raised by the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerEvent {
    /// A connection reached `Established` (or an outbound connect found one).
    Connected {
        /// Remote peer.
        peer: SocketAddr,
    },

    /// A locally initiated connect did not complete.
    ConnectFailed {
        /// Remote peer.
        peer: SocketAddr,
        /// Why it failed.
        reason: Vec<u8>,
    },

    /// A message was delivered in order from the peer.
    Data {
        /// Remote peer.
        peer: SocketAddr,
        /// Message bytes.
        data: Vec<u8>,
    },

    /// An established connection closed.
    Disconnected {
        /// Remote peer.
        peer: SocketAddr,
        /// Why it closed.
        reason: Vec<u8>,
    },
}

/// Routes datagrams between the sockets and per-peer connections.
///
/// A peer appears in at most one of the pending and established maps. Pending
/// connections are promoted when their handshake completes, or closed if the
/// established map is full by then.
#[derive(Debug)]
pub struct Manager {
    config: ManagerConfig,
    established: HashMap<SocketAddr, Connection>,
    pending: HashMap<SocketAddr, Connection>,
    bound: BoundFamilies,
    transmits: VecDeque<Transmit>,
    events: VecDeque<ManagerEvent>,
}

impl Manager {
    /// Create a manager with no bound families.
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            established: HashMap::new(),
            pending: HashMap::new(),
            bound: BoundFamilies::default(),
            transmits: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    /// Manager configuration.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Cap on concurrently established connections.
    pub fn max_connections(&self) -> usize {
        self.config.max_connections
    }

    /// Change the connection cap. Zero is ignored.
    ///
    /// Lowering the cap never closes connections that are already
    /// established.
    pub fn set_max_connections(&mut self, max: usize) {
        if max == 0 {
            debug!("ignoring zero connection cap");
            return;
        }
        self.config.max_connections = max;
    }

    /// Established connections.
    pub fn connection_count(&self) -> usize {
        self.established.len()
    }

    /// Connections still handshaking.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Look up a connection, pending or established.
    pub fn connection(&self, peer: &SocketAddr) -> Option<&Connection> {
        self.established
            .get(peer)
            .or_else(|| self.pending.get(peer))
    }

    /// Phase of the connection to `peer`, if any.
    pub fn phase(&self, peer: &SocketAddr) -> Option<ConnectionPhase> {
        self.connection(peer).map(Connection::phase)
    }

    /// Peers with an established connection.
    pub fn peers(&self) -> impl Iterator<Item = &SocketAddr> {
        self.established.keys()
    }

    /// Record that a socket for `family` is bound.
    pub fn mark_bound(&mut self, family: AddressFamily) {
        self.bound.set(family, true);
    }

    /// Record that the socket for `family` was released.
    pub fn mark_unbound(&mut self, family: AddressFamily) {
        self.bound.set(family, false);
    }

    /// Families with a bound socket.
    pub fn bound_families(&self) -> BoundFamilies {
        self.bound
    }

    // ---------------------------------------------------------------------
    // Inputs
    // ---------------------------------------------------------------------

    /// Route an inbound datagram from `source`.
    pub fn handle_datagram(&mut self, source: SocketAddr, data: &[u8], now: Instant) {
        trace!(peer = %source, bytes = %hex::encode(data), "recv datagram");

        if let Some(conn) = self.established.get_mut(&source) {
            conn.handle_datagram(data, now);
        } else if let Some(conn) = self.pending.get_mut(&source) {
            conn.handle_datagram(data, now);
        } else if Segment::is_fresh_connect_request(data) {
            if self.established.len() >= self.config.max_connections {
                debug!(peer = %source, "refusing connect request: at capacity");
                return;
            }
            let mut conn = Connection::new(source, self.config.connection.clone(), now);
            conn.handle_datagram(data, now);
            self.pending.insert(source, conn);
            debug!(peer = %source, "provisioned pending connection");
        } else {
            trace!(peer = %source, "dropping datagram from unknown source");
            return;
        }

        self.drive(source, now);
    }

    /// Fire every timer due at `now`.
    pub fn handle_timeout(&mut self, now: Instant) {
        let due: Vec<SocketAddr> = self
            .established
            .iter()
            .chain(self.pending.iter())
            .filter(|(_, conn)| conn.poll_timeout().is_some_and(|deadline| deadline <= now))
            .map(|(peer, _)| *peer)
            .collect();

        for peer in due {
            if let Some(conn) = self.connection_mut(&peer) {
                conn.handle_timeout(now);
            }
            self.drive(peer, now);
        }
    }

    /// Start an outbound connect to `peer`.
    ///
    /// The outcome is reported as [`ManagerEvent::Connected`] or
    /// [`ManagerEvent::ConnectFailed`].
    pub fn connect(&mut self, peer: SocketAddr, now: Instant) {
        if self.established.contains_key(&peer) {
            self.events.push_back(ManagerEvent::Connected { peer });
            return;
        }
        if self.pending.contains_key(&peer) {
            debug!(peer = %peer, "connect already in progress");
            return;
        }
        if !self.bound.contains(AddressFamily::of(&peer)) {
            warn!(peer = %peer, "refusing connect: no socket bound for family");
            self.fail_connect(peer, reasons::SOCKET_UNBOUND);
            return;
        }
        if self.established.len() >= self.config.max_connections {
            warn!(peer = %peer, "refusing connect: at capacity");
            self.fail_connect(peer, reasons::CAPACITY_EXCEEDED);
            return;
        }

        let mut conn = Connection::new(peer, self.config.connection.clone(), now);
        conn.connect(now);
        self.pending.insert(peer, conn);
        self.drive(peer, now);
    }

    /// Queue a reliable message to `peer`.
    pub fn send(&mut self, peer: SocketAddr, data: &[u8], now: Instant) -> Result<(), ManagerError> {
        let conn = self
            .connection_mut(&peer)
            .ok_or(ManagerError::UnknownPeer(peer))?;
        conn.send(data, now)?;
        self.drive(peer, now);
        Ok(())
    }

    /// Send an unsequenced message to `peer` now.
    pub fn send_unreliable(
        &mut self,
        peer: SocketAddr,
        data: &[u8],
        now: Instant,
    ) -> Result<(), ManagerError> {
        let conn = self
            .connection_mut(&peer)
            .ok_or(ManagerError::UnknownPeer(peer))?;
        conn.send_unreliable(data, now)?;
        self.drive(peer, now);
        Ok(())
    }

    /// Change the heartbeat interval of the connection to `peer`.
    pub fn set_heartbeat_interval(
        &mut self,
        peer: SocketAddr,
        interval: Duration,
        now: Instant,
    ) -> Result<(), ManagerError> {
        let conn = self
            .connection_mut(&peer)
            .ok_or(ManagerError::UnknownPeer(peer))?;
        conn.set_heartbeat_interval(interval, now);
        Ok(())
    }

    /// Close the connection to `peer`.
    pub fn close(&mut self, peer: SocketAddr, reason: &[u8], now: Instant) -> Result<(), ManagerError> {
        let conn = self
            .connection_mut(&peer)
            .ok_or(ManagerError::UnknownPeer(peer))?;
        conn.close(reason, now);
        self.drive(peer, now);
        Ok(())
    }

    /// Close every connection and release both families.
    pub fn close_all(&mut self, now: Instant) {
        let peers: Vec<SocketAddr> = self
            .established
            .keys()
            .chain(self.pending.keys())
            .copied()
            .collect();
        info!(connections = peers.len(), "closing all connections");

        for peer in peers {
            if let Some(conn) = self.connection_mut(&peer) {
                conn.close(reasons::MANAGER_SHUTDOWN, now);
            }
            self.drive(peer, now);
        }
        self.bound = BoundFamilies::default();
    }

    // ---------------------------------------------------------------------
    // Outputs
    // ---------------------------------------------------------------------

    /// Next datagram to send.
    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.transmits.pop_front()
    }

    /// Next notification.
    pub fn poll_event(&mut self) -> Option<ManagerEvent> {
        self.events.pop_front()
    }

    /// Earliest instant at which [`Manager::handle_timeout`] has work.
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.established
            .values()
            .chain(self.pending.values())
            .filter_map(Connection::poll_timeout)
            .min()
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    fn connection_mut(&mut self, peer: &SocketAddr) -> Option<&mut Connection> {
        self.established
            .get_mut(peer)
            .or_else(|| self.pending.get_mut(peer))
    }

    fn fail_connect(&mut self, peer: SocketAddr, reason: &[u8]) {
        self.events.push_back(ManagerEvent::ConnectFailed {
            peer,
            reason: reason.to_vec(),
        });
    }

    /// Collect a connection's output and react to its events until it is
    /// quiet or gone.
    fn drive(&mut self, peer: SocketAddr, now: Instant) {
        loop {
            let Some(conn) = self
                .established
                .get_mut(&peer)
                .or_else(|| self.pending.get_mut(&peer))
            else {
                return;
            };
            while let Some(payload) = conn.poll_transmit() {
                self.transmits.push_back(Transmit {
                    destination: peer,
                    payload,
                });
            }
            let Some(event) = conn.poll_event() else {
                return;
            };
            self.on_connection_event(peer, event, now);
        }
    }

    fn on_connection_event(&mut self, peer: SocketAddr, event: ConnectionEvent, now: Instant) {
        match event {
            ConnectionEvent::Connected => self.promote(peer, now),
            ConnectionEvent::DataAvailable => {
                let Some(conn) = self.connection_mut(&peer) else {
                    return;
                };
                let messages = conn.read_all();
                self.events.extend(
                    messages
                        .into_iter()
                        .map(|data| ManagerEvent::Data { peer, data }),
                );
            }
            ConnectionEvent::Disconnected { reason } => {
                if self.established.remove(&peer).is_some() {
                    self.events
                        .push_back(ManagerEvent::Disconnected { peer, reason });
                } else if let Some(conn) = self.pending.remove(&peer) {
                    if conn.is_initiator() {
                        self.events
                            .push_back(ManagerEvent::ConnectFailed { peer, reason });
                    } else {
                        debug!(peer = %peer, "pending connection dropped");
                    }
                }
            }
        }
    }

    fn promote(&mut self, peer: SocketAddr, now: Instant) {
        if self.established.len() >= self.config.max_connections {
            warn!(peer = %peer, "handshake completed over capacity");
            if let Some(conn) = self.pending.get_mut(&peer) {
                conn.close(reasons::CAPACITY_EXCEEDED, now);
            }
            return;
        }
        if let Some(conn) = self.pending.remove(&peer) {
            self.established.insert(peer, conn);
            self.events.push_back(ManagerEvent::Connected { peer });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    use crate::transport::{ConnectionConfigBuilder, Frame};

    fn test_addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
    }

    fn test_manager(max: usize) -> Manager {
        let connection = ConnectionConfigBuilder::new()
            .ack_timeout(Duration::from_millis(100))
            .retry_limit(1)
            .build();
        let mut manager = Manager::new(
            ManagerConfigBuilder::new()
                .max_connections(max)
                .connection(connection)
                .build(),
        );
        manager.mark_bound(AddressFamily::V4);
        manager
    }

    fn events(manager: &mut Manager) -> Vec<ManagerEvent> {
        std::iter::from_fn(|| manager.poll_event()).collect()
    }

    #[test]
    fn test_default_config() {
        let config = ManagerConfig::default();
        assert_eq!(config.max_connections, 65535);
        assert_eq!(config.connection.window_size, 256);
    }

    #[test]
    fn test_zero_cap_ignored() {
        let mut manager = test_manager(4);
        manager.set_max_connections(0);
        assert_eq!(manager.max_connections(), 4);
        manager.set_max_connections(9);
        assert_eq!(manager.max_connections(), 9);

        let config = ManagerConfigBuilder::new().max_connections(0).build();
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
    }

    #[test]
    fn test_unknown_source_dropped() {
        let now = Instant::now();
        let mut manager = test_manager(4);

        manager.handle_datagram(test_addr(1), &Frame::heartbeat(0).encode(1), now);
        let mut long = Frame::connect().encode(1);
        long.push(0);
        manager.handle_datagram(test_addr(2), &long, now);

        assert_eq!(manager.pending_count(), 0);
        assert!(manager.poll_transmit().is_none());
    }

    #[test]
    fn test_connect_request_provisions_pending() {
        let now = Instant::now();
        let mut manager = test_manager(4);
        let peer = test_addr(1);

        manager.handle_datagram(peer, &Frame::connect().encode(1), now);
        assert_eq!(manager.pending_count(), 1);
        assert_eq!(manager.phase(&peer), Some(ConnectionPhase::HalfOpen));

        let reply = manager.poll_transmit().unwrap();
        assert_eq!(reply.destination, peer);
        assert_eq!(reply.payload[0], 0x03);

        manager.handle_datagram(peer, &Frame::ack(0).encode(0), now);
        assert_eq!(manager.connection_count(), 1);
        assert_eq!(manager.pending_count(), 0);
        assert_eq!(events(&mut manager), vec![ManagerEvent::Connected { peer }]);
    }

    #[test]
    fn test_delivered_data_becomes_events() {
        let now = Instant::now();
        let mut manager = test_manager(4);
        let peer = test_addr(1);
        manager.handle_datagram(peer, &Frame::connect().encode(1), now);
        manager.handle_datagram(peer, &Frame::ack(0).encode(0), now);
        events(&mut manager);

        let data = Frame::data(1, b"hello".to_vec(), false).encode(2);
        manager.handle_datagram(peer, &data, now);
        assert_eq!(events(&mut manager), vec![ManagerEvent::Data {
            peer,
            data: b"hello".to_vec()
        }]);
        // the engine's own queue was drained into the event
        assert!(!manager.connection(&peer).unwrap().has_data());
    }

    #[test]
    fn test_connect_requires_bound_family() {
        let now = Instant::now();
        let mut manager = test_manager(4);
        let peer = SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 9);

        manager.connect(peer, now);
        assert_eq!(events(&mut manager), vec![ManagerEvent::ConnectFailed {
            peer,
            reason: reasons::SOCKET_UNBOUND.to_vec()
        }]);
        assert_eq!(manager.pending_count(), 0);
    }

    #[test]
    fn test_connect_refused_at_capacity() {
        let now = Instant::now();
        let mut manager = test_manager(1);
        manager.handle_datagram(test_addr(1), &Frame::connect().encode(1), now);
        manager.handle_datagram(test_addr(1), &Frame::ack(0).encode(0), now);
        events(&mut manager);

        manager.connect(test_addr(2), now);
        assert_eq!(events(&mut manager), vec![ManagerEvent::ConnectFailed {
            peer: test_addr(2),
            reason: reasons::CAPACITY_EXCEEDED.to_vec()
        }]);

        // an inbound request is ignored outright
        manager.handle_datagram(test_addr(3), &Frame::connect().encode(1), now);
        assert_eq!(manager.pending_count(), 0);
    }

    #[test]
    fn test_connect_reuses_established() {
        let now = Instant::now();
        let mut manager = test_manager(4);
        let peer = test_addr(1);
        manager.handle_datagram(peer, &Frame::connect().encode(1), now);
        manager.handle_datagram(peer, &Frame::ack(0).encode(0), now);
        events(&mut manager);
        while manager.poll_transmit().is_some() {}

        manager.connect(peer, now);
        assert_eq!(events(&mut manager), vec![ManagerEvent::Connected { peer }]);
        assert!(manager.poll_transmit().is_none());
    }

    #[test]
    fn test_outbound_connect_times_out() {
        let now = Instant::now();
        let mut manager = test_manager(4);
        let peer = test_addr(7);

        manager.connect(peer, now);
        assert_eq!(manager.phase(&peer), Some(ConnectionPhase::HalfOpen));
        assert_eq!(manager.poll_transmit().unwrap().payload[0], 0x01);

        manager.handle_timeout(now + Duration::from_millis(100));
        assert_eq!(manager.poll_transmit().unwrap().payload[0], 0x11);
        manager.handle_timeout(now + Duration::from_millis(200));

        assert_eq!(events(&mut manager), vec![ManagerEvent::ConnectFailed {
            peer,
            reason: reasons::ACK_TIMEOUT.to_vec()
        }]);
        assert_eq!(manager.phase(&peer), None);
        assert_eq!(manager.poll_timeout(), None);
    }

    #[test]
    fn test_send_to_unknown_peer() {
        let now = Instant::now();
        let mut manager = test_manager(4);
        assert_eq!(
            manager.send(test_addr(1), b"x", now),
            Err(ManagerError::UnknownPeer(test_addr(1)))
        );
    }

    #[test]
    fn test_close_all_releases_everything() {
        let now = Instant::now();
        let mut manager = test_manager(4);
        let inbound = test_addr(1);
        let outbound = test_addr(2);
        manager.handle_datagram(inbound, &Frame::connect().encode(1), now);
        manager.handle_datagram(inbound, &Frame::ack(0).encode(0), now);
        manager.connect(outbound, now);
        events(&mut manager);
        while manager.poll_transmit().is_some() {}

        manager.close_all(now);

        let mut seen = events(&mut manager);
        seen.sort_by_key(|event| format!("{event:?}"));
        assert_eq!(seen, vec![
            ManagerEvent::ConnectFailed {
                peer: outbound,
                reason: reasons::MANAGER_SHUTDOWN.to_vec()
            },
            ManagerEvent::Disconnected {
                peer: inbound,
                reason: reasons::MANAGER_SHUTDOWN.to_vec()
            },
        ]);
        assert_eq!(manager.connection_count(), 0);
        assert_eq!(manager.pending_count(), 0);
        assert!(manager.bound_families().is_empty());
        // one close unit per connection
        assert_eq!(std::iter::from_fn(|| manager.poll_transmit()).count(), 2);
    }
}

//! Per-peer connection engine.
//!
//! A [`Connection`] is a sans-IO state machine: the owner feeds it inbound
//! datagrams ([`Connection::handle_datagram`]), timer expirations
//! ([`Connection::handle_timeout`]), and application sends, and drains the
//! datagrams it wants transmitted ([`Connection::poll_transmit`]) and the
//! notifications it raised ([`Connection::poll_event`]). It never touches a
//! socket and never blocks.
//!
//! ```text
//!            connect() / connect request
//!   Idle ──────────────────────────────────▶ HalfOpen
//!                                               │
//!              connect-ack ⇄ ack (handshake)    │
//!                                               ▼
//!                                          Established
//!                                               │
//!     close / forced close / retry exhaustion   │  (also from HalfOpen)
//!                                               ▼
//!                                             Closed
//! ```

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use super::frame::{Frame, Segment};
use super::sequence;
use super::timing::{StalenessGuard, WallClock};
use super::unit::PendingUnit;
use crate::core::ConnectionError;
use crate::core::constants::{
    DEFAULT_ACK_TIMEOUT, DEFAULT_FRAGMENT_SIZE, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_RETRY_LIMIT,
    DEFAULT_WINDOW_SIZE, INITIAL_RECV_CURSOR, MAX_FRAGMENTS, MAX_WINDOW_SIZE, MIN_ACK_TIMEOUT,
    reasons,
};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// No handshake attempted yet.
    Idle,
    /// Handshake in progress (either side).
    HalfOpen,
    /// Data may flow.
    Established,
    /// Terminal.
    Closed,
}

/// Per-connection tuning.
///
/// Out-of-range values are clamped when the configuration reaches a
/// [`Connection`]: the window to `1..=`[`MAX_WINDOW_SIZE`], the fragment size
/// to at least one byte, and the ack timeout to at least [`MIN_ACK_TIMEOUT`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Payload bytes per fragment.
    pub fragment_size: usize,
    /// Maximum units in flight.
    pub window_size: usize,
    /// Retransmissions before the connection is given up on.
    pub retry_limit: u32,
    /// Time to wait for an acknowledgment before retransmitting.
    pub ack_timeout: Duration,
    /// Heartbeat period on an idle established connection.
    pub heartbeat_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            fragment_size: DEFAULT_FRAGMENT_SIZE,
            window_size: DEFAULT_WINDOW_SIZE,
            retry_limit: DEFAULT_RETRY_LIMIT,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }
}

impl ConnectionConfig {
    fn clamped(mut self) -> Self {
        self.fragment_size = self.fragment_size.max(1);
        self.window_size = self.window_size.clamp(1, MAX_WINDOW_SIZE);
        self.ack_timeout = self.ack_timeout.max(MIN_ACK_TIMEOUT);
        self
    }
}

/// Builder for [`ConnectionConfig`].
#[derive(Debug, Default)]
pub struct ConnectionConfigBuilder {
    config: ConnectionConfig,
}

impl ConnectionConfigBuilder {
    /// Start from the defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the fragment size (at least one byte).
    pub fn fragment_size(mut self, size: usize) -> Self {
        self.config.fragment_size = size;
        self
    }

    /// Set the send window size (between one and [`MAX_WINDOW_SIZE`] units).
    pub fn window_size(mut self, size: usize) -> Self {
        self.config.window_size = size;
        self
    }

    /// Set the retry limit.
    pub fn retry_limit(mut self, limit: u32) -> Self {
        self.config.retry_limit = limit;
        self
    }

    /// Set the acknowledgment timeout (at least [`MIN_ACK_TIMEOUT`]).
    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.config.ack_timeout = timeout;
        self
    }

    /// Set the heartbeat interval.
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> ConnectionConfig {
        self.config.clamped()
    }
}

/// Notification raised by a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Handshake completed.
    Connected,
    /// New delivered data can be taken with [`Connection::next_pending_data`].
    ///
    /// A [`Manager`](crate::manager::Manager) drains the queue itself on this
    /// event and reports each message as
    /// [`ManagerEvent::Data`](crate::manager::ManagerEvent::Data).
    DataAvailable,
    /// Connection reached `Closed`. Raised exactly once.
    Disconnected {
        /// Opaque reason, human-readable or protocol-internal.
        reason: Vec<u8>,
    },
}

/// A buffered, not-yet-in-order receive window entry.
#[derive(Debug, Clone)]
struct Received {
    more: bool,
    /// `None` for heartbeats, which occupy a slot but carry no data.
    payload: Option<Vec<u8>>,
}

/// Connection engine for one remote peer.
#[derive(Debug)]
pub struct Connection {
    remote: SocketAddr,
    config: ConnectionConfig,
    phase: ConnectionPhase,
    initiator: bool,

    /// Next sequence number to retire from the send window.
    send_base: u16,
    /// Highest sequence number delivered in order.
    recv_cursor: u16,

    send_window: HashMap<u16, PendingUnit>,
    recv_window: HashMap<u16, Received>,
    /// Level-2: whole application messages.
    queued_messages: VecDeque<Vec<u8>>,
    /// Level-1: sequenced units awaiting a window slot.
    queued_units: VecDeque<PendingUnit>,
    reassembly: Vec<u8>,
    delivered: VecDeque<Vec<u8>>,

    staleness: StalenessGuard,
    clock: WallClock,
    heartbeat_deadline: Option<Instant>,

    transmits: VecDeque<Vec<u8>>,
    events: VecDeque<ConnectionEvent>,
}

impl Connection {
    /// Create an idle connection to `remote`.
    pub fn new(remote: SocketAddr, config: ConnectionConfig, now: Instant) -> Self {
        Self::with_clock(remote, config, WallClock::new(now))
    }

    /// Create an idle connection with an explicit timestamp clock.
    pub fn with_clock(remote: SocketAddr, config: ConnectionConfig, clock: WallClock) -> Self {
        Self {
            remote,
            config: config.clamped(),
            phase: ConnectionPhase::Idle,
            initiator: false,
            send_base: 0,
            recv_cursor: INITIAL_RECV_CURSOR,
            send_window: HashMap::new(),
            recv_window: HashMap::new(),
            queued_messages: VecDeque::new(),
            queued_units: VecDeque::new(),
            reassembly: Vec::new(),
            delivered: VecDeque::new(),
            staleness: StalenessGuard::new(),
            clock,
            heartbeat_deadline: None,
            transmits: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    // ---------------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------------

    /// Remote peer address.
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Current phase.
    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    /// Whether this side sent the connect request.
    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    /// Whether the connection is established.
    pub fn is_established(&self) -> bool {
        self.phase == ConnectionPhase::Established
    }

    /// Whether the connection is closed.
    pub fn is_closed(&self) -> bool {
        self.phase == ConnectionPhase::Closed
    }

    /// Connection configuration.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Next sequence number to retire from the send window.
    pub fn send_base(&self) -> u16 {
        self.send_base
    }

    /// Highest sequence number delivered in order.
    pub fn recv_cursor(&self) -> u16 {
        self.recv_cursor
    }

    /// Units currently in the send window.
    pub fn in_flight(&self) -> usize {
        self.send_window.len()
    }

    /// Units and messages waiting for a window slot.
    pub fn queued(&self) -> usize {
        self.queued_units.len() + self.queued_messages.len()
    }

    /// Change the heartbeat interval, rescheduling a running heartbeat.
    pub fn set_heartbeat_interval(&mut self, interval: Duration, now: Instant) {
        self.config.heartbeat_interval = interval;
        if self.heartbeat_deadline.is_some() {
            self.heartbeat_deadline = Some(now + interval);
        }
    }

    // ---------------------------------------------------------------------
    // Application API
    // ---------------------------------------------------------------------

    /// Start the handshake as initiator.
    pub fn connect(&mut self, now: Instant) {
        if self.phase != ConnectionPhase::Idle {
            return;
        }
        self.initiator = true;
        self.queued_units.push_back(PendingUnit::new(Frame::connect()));
        self.phase = ConnectionPhase::HalfOpen;
        debug!(peer = %self.remote, "connect request queued");
        self.update(now);
    }

    /// Queue a reliable message, fragmenting it if needed.
    pub fn send(&mut self, data: &[u8], now: Instant) -> Result<(), ConnectionError> {
        self.check_sendable(data)?;
        let fragments = data.len().div_ceil(self.config.fragment_size.max(1));
        if fragments > MAX_FRAGMENTS {
            return Err(ConnectionError::MessageTooLarge {
                fragments,
                max: MAX_FRAGMENTS,
            });
        }
        self.queued_messages.push_back(data.to_vec());
        self.update(now);
        Ok(())
    }

    /// Send a message immediately, without sequencing or acknowledgment.
    pub fn send_unreliable(&mut self, data: &[u8], now: Instant) -> Result<(), ConnectionError> {
        self.check_sendable(data)?;
        self.transmit(&Frame::unreliable(data.to_vec()), now);
        Ok(())
    }

    fn check_sendable(&self, data: &[u8]) -> Result<(), ConnectionError> {
        match self.phase {
            ConnectionPhase::Established => {}
            ConnectionPhase::Closed => return Err(ConnectionError::Closed),
            _ => return Err(ConnectionError::NotEstablished),
        }
        if data.is_empty() {
            return Err(ConnectionError::EmptyMessage);
        }
        Ok(())
    }

    /// Whether delivered data is waiting.
    ///
    /// The delivered queue is only read by whoever drives the connection
    /// directly. Under a [`Manager`](crate::manager::Manager) it is always
    /// empty between calls, since the manager turns every delivered message
    /// into a [`ManagerEvent::Data`](crate::manager::ManagerEvent::Data).
    pub fn has_data(&self) -> bool {
        !self.delivered.is_empty()
    }

    /// Take the oldest delivered message. See [`Connection::has_data`] for use
    /// under a manager.
    pub fn next_pending_data(&mut self) -> Option<Vec<u8>> {
        self.delivered.pop_front()
    }

    /// Take every delivered message. See [`Connection::has_data`] for use under
    /// a manager.
    pub fn read_all(&mut self) -> Vec<Vec<u8>> {
        self.delivered.drain(..).collect()
    }

    /// Close the connection, sending `reason` to the peer.
    ///
    /// Closing an already closed connection does nothing.
    pub fn close(&mut self, reason: &[u8], now: Instant) {
        if self.phase == ConnectionPhase::Closed {
            return;
        }
        if self.phase != ConnectionPhase::Idle {
            self.transmit(&Frame::close(reason), now);
        }
        self.teardown(reason);
    }

    // ---------------------------------------------------------------------
    // Driver API
    // ---------------------------------------------------------------------

    /// Next datagram to send to the peer.
    pub fn poll_transmit(&mut self) -> Option<Vec<u8>> {
        self.transmits.pop_front()
    }

    /// Next notification.
    pub fn poll_event(&mut self) -> Option<ConnectionEvent> {
        self.events.pop_front()
    }

    /// Earliest instant at which [`Connection::handle_timeout`] has work.
    pub fn poll_timeout(&self) -> Option<Instant> {
        if self.phase == ConnectionPhase::Closed {
            return None;
        }
        self.send_window
            .values()
            .filter_map(PendingUnit::deadline)
            .chain(self.heartbeat_deadline)
            .min()
    }

    /// Process an inbound datagram from the peer.
    pub fn handle_datagram(&mut self, data: &[u8], now: Instant) {
        if self.phase == ConnectionPhase::Closed {
            return;
        }
        let segment = match Segment::decode(data) {
            Ok(segment) => segment,
            Err(err) => {
                debug!(peer = %self.remote, error = %err, "dropping unit");
                return;
            }
        };

        match segment {
            Segment::Connect { seq, .. } => self.on_connect(seq),
            Segment::Ack { ack } => self.on_ack(ack, now),
            Segment::ConnectAck { seq, ack, retry, .. } => self.on_connect_ack(seq, ack, retry, now),
            Segment::Close { forced, reason } => {
                if forced {
                    self.on_forced_close(reason);
                }
            }
            Segment::Heartbeat { seq, timestamp, .. } => self.on_heartbeat(seq, timestamp, now),
            Segment::Data {
                seq,
                timestamp,
                more,
                retry,
                payload,
            } => self.on_data(seq, timestamp, more, retry, payload, now),
            Segment::Unreliable { payload } => self.on_unreliable(payload),
        }

        if self.phase != ConnectionPhase::Closed {
            self.update(now);
        }
    }

    /// Fire expired retransmission and heartbeat timers.
    pub fn handle_timeout(&mut self, now: Instant) {
        if self.phase == ConnectionPhase::Closed {
            return;
        }

        let base = self.send_base;
        let mut expired: Vec<u16> = self
            .send_window
            .values()
            .filter(|unit| unit.is_expired(now))
            .map(PendingUnit::seq)
            .collect();
        expired.sort_by_key(|seq| sequence::distance(base, *seq));

        for seq in expired {
            let Some(unit) = self.send_window.get_mut(&seq) else {
                continue;
            };
            if !unit.can_retry(self.config.retry_limit) {
                warn!(peer = %self.remote, seq, "retry budget exhausted");
                self.close(reasons::ACK_TIMEOUT, now);
                return;
            }
            unit.retransmit(now, self.config.ack_timeout);
            debug!(peer = %self.remote, seq, retries = unit.retries, "retransmitting");
            let frame = unit.frame.clone();
            self.transmit(&frame, now);
        }

        if self.heartbeat_deadline.is_some_and(|deadline| now >= deadline) {
            if self.send_window.is_empty() && self.queued_units.is_empty() {
                let seq = sequence::offset(self.send_base, self.send_window.len());
                trace!(peer = %self.remote, seq, "heartbeat");
                self.queued_units
                    .push_back(PendingUnit::new(Frame::heartbeat(seq)));
            }
            self.heartbeat_deadline = Some(now + self.config.heartbeat_interval);
        }

        self.update(now);
    }

    // ---------------------------------------------------------------------
    // Inbound handlers
    // ---------------------------------------------------------------------

    fn on_connect(&mut self, seq: u16) {
        if self.phase != ConnectionPhase::Idle || seq != 0 {
            trace!(peer = %self.remote, phase = ?self.phase, "ignoring connect request");
            return;
        }
        self.recv_cursor = 0;
        self.queued_units
            .push_back(PendingUnit::new(Frame::connect_ack()));
        self.phase = ConnectionPhase::HalfOpen;
        debug!(peer = %self.remote, "connect request accepted");
    }

    fn on_ack(&mut self, ack: u16, now: Instant) {
        if let Some(unit) = self.send_window.get_mut(&ack) {
            unit.disarm();
        }
        if ack == 0 && self.phase == ConnectionPhase::HalfOpen && !self.initiator {
            self.establish(now);
        }
    }

    fn on_connect_ack(&mut self, seq: u16, ack: u16, retry: bool, now: Instant) {
        let first_handshake = self.phase == ConnectionPhase::HalfOpen
            && self.initiator
            && self.send_base == 0
            && self.recv_cursor == INITIAL_RECV_CURSOR;

        if first_handshake {
            self.transmit(&Frame::ack(0), now);
            if seq == 0 && ack == 0 {
                self.send_base = 1;
                self.recv_cursor = 0;
                self.send_window.remove(&0);
                self.establish(now);
            }
        } else if retry {
            self.transmit(&Frame::ack(0), now);
        }
    }

    fn on_forced_close(&mut self, reason: Vec<u8>) {
        if !reason.is_empty() {
            self.delivered.push_back(reason.clone());
            self.events.push_back(ConnectionEvent::DataAvailable);
        }
        self.teardown(&reason);
    }

    fn on_heartbeat(&mut self, seq: u16, timestamp: u64, now: Instant) {
        if self.phase != ConnectionPhase::Established {
            return;
        }
        if !self.staleness.check_and_record(seq, timestamp) {
            trace!(peer = %self.remote, seq, "stale heartbeat");
            return;
        }
        self.transmit(&Frame::ack(seq), now);
        if seq == self.recv_cursor.wrapping_add(1) {
            self.heartbeat_deadline = Some(now + self.config.heartbeat_interval);
        }
        if sequence::is_ahead(self.recv_cursor, seq) {
            self.recv_window.entry(seq).or_insert(Received {
                more: false,
                payload: None,
            });
        }
    }

    fn on_data(
        &mut self,
        seq: u16,
        timestamp: u64,
        more: bool,
        retry: bool,
        payload: Vec<u8>,
        now: Instant,
    ) {
        if self.phase == ConnectionPhase::Idle {
            return;
        }
        if !self.staleness.check_and_record(seq, timestamp) {
            trace!(peer = %self.remote, seq, "stale data unit");
            return;
        }
        self.transmit(&Frame::ack(seq), now);

        if !sequence::is_ahead(self.recv_cursor, seq) {
            trace!(peer = %self.remote, seq, "already delivered");
            return;
        }
        if self.recv_window.contains_key(&seq) {
            if !retry {
                warn!(peer = %self.remote, seq, "sequence number reused without retry");
                self.close(reasons::WINDOW_OVERLAP, now);
            }
            return;
        }
        self.recv_window.insert(
            seq,
            Received {
                more,
                payload: Some(payload),
            },
        );
    }

    fn on_unreliable(&mut self, payload: Vec<u8>) {
        if self.phase != ConnectionPhase::Established {
            return;
        }
        self.delivered.push_back(payload);
        self.events.push_back(ConnectionEvent::DataAvailable);
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    fn establish(&mut self, now: Instant) {
        self.phase = ConnectionPhase::Established;
        self.heartbeat_deadline = Some(now + self.config.heartbeat_interval);
        self.events.push_back(ConnectionEvent::Connected);
        info!(peer = %self.remote, initiator = self.initiator, "connection established");
    }

    /// Retire acknowledged units, admit queued ones, and deliver in-order data.
    fn update(&mut self, now: Instant) {
        while self
            .send_window
            .get(&self.send_base)
            .is_some_and(|unit| !unit.is_active())
        {
            self.send_window.remove(&self.send_base);
            self.send_base = self.send_base.wrapping_add(1);
        }

        self.admit(now);

        // a responder may see data before the handshake ack; hold it until then
        if self.phase != ConnectionPhase::Established {
            return;
        }
        let mut delivered_any = false;
        while let Some(entry) = self.recv_window.remove(&self.recv_cursor.wrapping_add(1)) {
            self.recv_cursor = self.recv_cursor.wrapping_add(1);
            let Some(payload) = entry.payload else {
                continue;
            };
            self.reassembly.extend_from_slice(&payload);
            if !entry.more {
                self.delivered.push_back(std::mem::take(&mut self.reassembly));
                delivered_any = true;
            }
        }
        if delivered_any {
            self.events.push_back(ConnectionEvent::DataAvailable);
        }
    }

    /// Move Level-1 units into the send window, refilling Level-1 from
    /// Level-2 one message at a time.
    fn admit(&mut self, now: Instant) {
        loop {
            while self.send_window.len() < self.config.window_size {
                let Some(mut unit) = self.queued_units.pop_front() else {
                    break;
                };
                self.transmit(&unit.frame, now);
                unit.arm(now, self.config.ack_timeout);
                self.send_window.insert(unit.seq(), unit);
            }
            if !self.queued_units.is_empty() || self.send_window.len() >= self.config.window_size
            {
                return;
            }
            let Some(message) = self.queued_messages.pop_front() else {
                return;
            };
            self.fragment(message);
        }
    }

    fn fragment(&mut self, message: Vec<u8>) {
        let base = sequence::offset(self.send_base, self.send_window.len());
        let size = self.config.fragment_size.max(1);
        let count = message.len().div_ceil(size);
        for (i, chunk) in message.chunks(size).enumerate() {
            let frame = Frame::data(sequence::offset(base, i), chunk.to_vec(), i + 1 < count);
            self.queued_units.push_back(PendingUnit::new(frame));
        }
        trace!(peer = %self.remote, base, count, "message fragmented");
    }

    fn transmit(&mut self, frame: &Frame, now: Instant) {
        let bytes = frame.encode(self.clock.stamp(now));
        trace!(peer = %self.remote, bytes = %hex::encode(&bytes), "queue datagram");
        self.transmits.push_back(bytes);
    }

    fn teardown(&mut self, reason: &[u8]) {
        self.phase = ConnectionPhase::Closed;
        self.send_window.clear();
        self.recv_window.clear();
        self.queued_units.clear();
        self.queued_messages.clear();
        self.reassembly.clear();
        self.staleness.clear();
        self.heartbeat_deadline = None;
        self.events.push_back(ConnectionEvent::Disconnected {
            reason: reason.to_vec(),
        });
        info!(
            peer = %self.remote,
            reason = %String::from_utf8_lossy(reason),
            "connection closed"
        );
    }
}

//! In-memory network for driving sans-IO managers against each other.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use ruc_protocol::manager::{AddressFamily, Manager, ManagerConfig, ManagerEvent};

/// What the network does with one datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fate {
    Deliver,
    Drop,
    Duplicate,
    /// Deliver after everything else currently in flight.
    Delay,
}

/// A datagram on the wire.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub bytes: Vec<u8>,
}

type Filter = Box<dyn FnMut(&Datagram) -> Fate>;

pub struct Network {
    pub now: Instant,
    nodes: BTreeMap<SocketAddr, Manager>,
    events: BTreeMap<SocketAddr, Vec<ManagerEvent>>,
    wire: VecDeque<Datagram>,
    filter: Filter,
    /// Every datagram handed to the network, before the filter.
    pub sent: Vec<Datagram>,
}

pub fn addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

/// Opt-in log output: `RUST_LOG=ruc_protocol=trace cargo test`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("off")),
        )
        .try_init();
}

impl Network {
    pub fn new() -> Self {
        init_tracing();
        Self {
            now: Instant::now(),
            nodes: BTreeMap::new(),
            events: BTreeMap::new(),
            wire: VecDeque::new(),
            filter: Box::new(|_| Fate::Deliver),
            sent: Vec::new(),
        }
    }

    pub fn add(&mut self, at: SocketAddr, config: ManagerConfig) {
        let mut manager = Manager::new(config);
        manager.mark_bound(AddressFamily::V4);
        self.nodes.insert(at, manager);
    }

    pub fn set_filter(&mut self, filter: impl FnMut(&Datagram) -> Fate + 'static) {
        self.filter = Box::new(filter);
    }

    pub fn node(&mut self, at: SocketAddr) -> &mut Manager {
        self.nodes.get_mut(&at).expect("unknown node")
    }

    fn collect(&mut self) {
        for (from, manager) in self.nodes.iter_mut() {
            while let Some(transmit) = manager.poll_transmit() {
                let datagram = Datagram {
                    from: *from,
                    to: transmit.destination,
                    bytes: transmit.payload,
                };
                self.sent.push(datagram.clone());
                self.wire.push_back(datagram);
            }
            let events = self.events.entry(*from).or_default();
            events.extend(std::iter::from_fn(|| manager.poll_event()));
        }
    }

    fn deliver(&mut self, datagram: &Datagram) {
        if let Some(manager) = self.nodes.get_mut(&datagram.to) {
            manager.handle_datagram(datagram.from, &datagram.bytes, self.now);
        }
    }

    /// Deliver everything until the network is quiet.
    pub fn run(&mut self) {
        let mut delayed = Vec::new();
        for _ in 0..10_000_000 {
            self.collect();
            let Some(datagram) = self.wire.pop_front() else {
                if delayed.is_empty() {
                    return;
                }
                self.wire.extend(delayed.drain(..));
                continue;
            };
            match (self.filter)(&datagram) {
                Fate::Deliver => self.deliver(&datagram),
                Fate::Drop => {}
                Fate::Duplicate => {
                    self.deliver(&datagram);
                    self.deliver(&datagram);
                }
                Fate::Delay => delayed.push(datagram),
            }
        }
        panic!("network never went quiet");
    }

    /// Advance the clock to `now + duration`, firing timers on the way.
    pub fn advance(&mut self, duration: Duration) {
        let end = self.now + duration;
        self.run();
        loop {
            let next = self
                .nodes
                .values()
                .filter_map(Manager::poll_timeout)
                .min();
            match next {
                Some(deadline) if deadline <= end => {
                    self.now = self.now.max(deadline);
                    let now = self.now;
                    for manager in self.nodes.values_mut() {
                        manager.handle_timeout(now);
                    }
                    self.run();
                }
                _ => break,
            }
        }
        self.now = end;
    }

    /// Take the events raised by `at` so far.
    pub fn events(&mut self, at: SocketAddr) -> Vec<ManagerEvent> {
        self.collect();
        self.events.remove(&at).unwrap_or_default()
    }

    /// Take only the messages delivered to `at`, in order.
    pub fn messages(&mut self, at: SocketAddr) -> Vec<Vec<u8>> {
        self.events(at)
            .into_iter()
            .filter_map(|event| match event {
                ManagerEvent::Data { data, .. } => Some(data),
                _ => None,
            })
            .collect()
    }

    /// Connect `from` to `to` and run the handshake to completion.
    pub fn connect(&mut self, from: SocketAddr, to: SocketAddr) {
        let now = self.now;
        self.node(from).connect(to, now);
        self.run();
    }
}

/// Whether a datagram carries sequenced data (control byte HASDATA, NOACK clear).
pub fn is_data(datagram: &Datagram) -> bool {
    let control = datagram.bytes[0];
    control & 0x40 != 0 && control & 0x20 == 0
}

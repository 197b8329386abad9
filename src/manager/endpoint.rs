//! Tokio driver for a [`Manager`].
//!
//! An [`Endpoint`] task owns the manager and up to one socket per address
//! family. The application reaches it only through an [`EndpointHandle`],
//! which posts commands over a channel and awaits the reply, so every
//! manager and connection operation runs on the endpoint task.
//!
//! # Example
//!
//! ```no_run
//! use ruc_protocol::manager::{Endpoint, EndpointConfig, EndpointEvent};
//!
//! # async fn run() -> Result<(), ruc_protocol::manager::EndpointError> {
//! let (endpoint, mut events) = Endpoint::spawn(EndpointConfig::default());
//! endpoint.bind("0.0.0.0:7000".parse().unwrap()).await?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         EndpointEvent::Connected { peer } => println!("{peer} connected"),
//!         EndpointEvent::Data { peer, data } => endpoint.send(peer, data).await?,
//!         EndpointEvent::Disconnected { peer, .. } => println!("{peer} left"),
//!         EndpointEvent::ConnectFailed { .. } => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use std::future;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use super::manager::{
    AddressFamily, BoundFamilies, Manager, ManagerConfig, ManagerError, ManagerEvent,
};
use crate::core::ConnectionError;
use crate::core::constants::{DEFAULT_RECV_BUFFER_SIZE, SEQUENCED_HEADER_SIZE};
use crate::transport::{RucSocket, RucSocketBuilder};

/// Pending commands an endpoint buffers before callers wait.
const COMMAND_CHANNEL_CAPACITY: usize = 256;

/// Errors returned by [`EndpointHandle`] calls.
#[derive(Debug, Error)]
pub enum EndpointError {
    /// A socket for this family is already bound.
    #[error("{0:?} socket already bound")]
    AlreadyBound(AddressFamily),

    /// Binding a socket failed.
    #[error("bind to {addr} failed: {source}")]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// No connection for this peer.
    #[error("no connection for peer {0}")]
    UnknownPeer(SocketAddr),

    /// The connection refused the operation.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The endpoint task is gone.
    #[error("endpoint shut down")]
    Shutdown,
}

impl From<ManagerError> for EndpointError {
    fn from(err: ManagerError) -> Self {
        match err {
            ManagerError::UnknownPeer(peer) => Self::UnknownPeer(peer),
            ManagerError::Connection(err) => Self::Connection(err),
        }
    }
}

/// Events delivered to the application.
pub type EndpointEvent = ManagerEvent;

/// Endpoint configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    /// Manager and per-connection settings.
    pub manager: ManagerConfig,
    /// Socket receive buffer size. Raised to fit a full data unit when smaller.
    pub recv_buffer_size: usize,
}

impl EndpointConfig {
    /// Receive buffer size actually used: never smaller than a full data unit
    /// (header plus one fragment), since the socket truncates longer datagrams.
    pub fn effective_recv_buffer_size(&self) -> usize {
        let data_unit = SEQUENCED_HEADER_SIZE + self.manager.connection.fragment_size.max(1);
        self.recv_buffer_size.max(data_unit)
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            manager: ManagerConfig::default(),
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
        }
    }
}

/// Outcome of [`EndpointHandle::bind_all`], one result per family.
#[derive(Debug)]
pub struct BindAll {
    /// IPv4 wildcard bind.
    pub v4: Result<SocketAddr, EndpointError>,
    /// IPv6 wildcard bind.
    pub v6: Result<SocketAddr, EndpointError>,
}

enum Command {
    Bind {
        addr: SocketAddr,
        reply: oneshot::Sender<Result<SocketAddr, EndpointError>>,
    },
    BindAll {
        port: u16,
        reply: oneshot::Sender<BindAll>,
    },
    LocalAddr {
        family: AddressFamily,
        reply: oneshot::Sender<Option<SocketAddr>>,
    },
    BoundFamilies {
        reply: oneshot::Sender<BoundFamilies>,
    },
    Connect {
        peer: SocketAddr,
        reply: oneshot::Sender<()>,
    },
    Send {
        peer: SocketAddr,
        data: Vec<u8>,
        reliable: bool,
        reply: oneshot::Sender<Result<(), EndpointError>>,
    },
    Close {
        peer: SocketAddr,
        reason: Vec<u8>,
        reply: oneshot::Sender<Result<(), EndpointError>>,
    },
    SetHeartbeatInterval {
        peer: SocketAddr,
        interval: Duration,
        reply: oneshot::Sender<Result<(), EndpointError>>,
    },
    SetMaxConnections {
        max: usize,
        reply: oneshot::Sender<()>,
    },
    MaxConnections {
        reply: oneshot::Sender<usize>,
    },
    ConnectionCount {
        reply: oneshot::Sender<usize>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a running [`Endpoint`].
///
/// Calls made after the endpoint has shut down fail with
/// [`EndpointError::Shutdown`].
#[derive(Debug, Clone)]
pub struct EndpointHandle {
    commands: mpsc::Sender<Command>,
}

impl EndpointHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, EndpointError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| EndpointError::Shutdown)?;
        response.await.map_err(|_| EndpointError::Shutdown)
    }

    /// Bind the socket for `addr`'s family. Returns the bound address.
    pub async fn bind(&self, addr: SocketAddr) -> Result<SocketAddr, EndpointError> {
        self.request(|reply| Command::Bind { addr, reply }).await?
    }

    /// Bind `0.0.0.0:port` and `[::]:port`.
    ///
    /// Each family succeeds or fails on its own; on dual-stack hosts the IPv6
    /// wildcard may collide with the IPv4 one for a fixed port.
    pub async fn bind_all(&self, port: u16) -> Result<BindAll, EndpointError> {
        self.request(|reply| Command::BindAll { port, reply }).await
    }

    /// Local address of the socket for `family`.
    pub async fn local_addr(&self, family: AddressFamily) -> Result<Option<SocketAddr>, EndpointError> {
        self.request(|reply| Command::LocalAddr { family, reply })
            .await
    }

    /// Families with a bound socket.
    pub async fn bound_families(&self) -> Result<BoundFamilies, EndpointError> {
        self.request(|reply| Command::BoundFamilies { reply }).await
    }

    /// Start connecting to `peer`.
    ///
    /// The outcome arrives as [`EndpointEvent::Connected`] or
    /// [`EndpointEvent::ConnectFailed`].
    pub async fn connect(&self, peer: SocketAddr) -> Result<(), EndpointError> {
        self.request(|reply| Command::Connect { peer, reply }).await
    }

    /// Queue a reliable message to `peer`.
    pub async fn send(&self, peer: SocketAddr, data: impl Into<Vec<u8>>) -> Result<(), EndpointError> {
        let data = data.into();
        self.request(|reply| Command::Send {
            peer,
            data,
            reliable: true,
            reply,
        })
        .await?
    }

    /// Send an unsequenced, unacknowledged message to `peer`.
    pub async fn send_unreliable(
        &self,
        peer: SocketAddr,
        data: impl Into<Vec<u8>>,
    ) -> Result<(), EndpointError> {
        let data = data.into();
        self.request(|reply| Command::Send {
            peer,
            data,
            reliable: false,
            reply,
        })
        .await?
    }

    /// Close the connection to `peer`, sending `reason`.
    pub async fn close(&self, peer: SocketAddr, reason: impl Into<Vec<u8>>) -> Result<(), EndpointError> {
        let reason = reason.into();
        self.request(|reply| Command::Close {
            peer,
            reason,
            reply,
        })
        .await?
    }

    /// Change the heartbeat interval of the connection to `peer`.
    pub async fn set_heartbeat_interval(
        &self,
        peer: SocketAddr,
        interval: Duration,
    ) -> Result<(), EndpointError> {
        self.request(|reply| Command::SetHeartbeatInterval {
            peer,
            interval,
            reply,
        })
        .await?
    }

    /// Change the connection cap. Zero is ignored.
    pub async fn set_max_connections(&self, max: usize) -> Result<(), EndpointError> {
        self.request(|reply| Command::SetMaxConnections { max, reply })
            .await
    }

    /// Current connection cap.
    pub async fn max_connections(&self) -> Result<usize, EndpointError> {
        self.request(|reply| Command::MaxConnections { reply }).await
    }

    /// Established connections.
    pub async fn connection_count(&self) -> Result<usize, EndpointError> {
        self.request(|reply| Command::ConnectionCount { reply }).await
    }

    /// Close every connection, release both sockets, and stop the endpoint.
    pub async fn shutdown(&self) -> Result<(), EndpointError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    /// Whether the endpoint task has stopped.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

/// The endpoint task: one manager, up to one socket per family.
pub struct Endpoint {
    manager: Manager,
    v4: Option<RucSocket>,
    v6: Option<RucSocket>,
    recv_buffer_size: usize,
    commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedSender<EndpointEvent>,
}

impl Endpoint {
    /// Spawn an endpoint on the current tokio runtime.
    ///
    /// No socket is bound yet; call [`EndpointHandle::bind`] or
    /// [`EndpointHandle::bind_all`]. The endpoint stops on
    /// [`EndpointHandle::shutdown`] or once every handle is dropped.
    pub fn spawn(
        config: EndpointConfig,
    ) -> (EndpointHandle, mpsc::UnboundedReceiver<EndpointEvent>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let recv_buffer_size = config.effective_recv_buffer_size();
        if recv_buffer_size != config.recv_buffer_size {
            debug!(
                requested = config.recv_buffer_size,
                recv_buffer_size, "receive buffer raised to fit a data unit"
            );
        }
        let endpoint = Self {
            manager: Manager::new(config.manager),
            v4: None,
            v6: None,
            recv_buffer_size,
            commands: command_rx,
            events: event_tx,
        };
        tokio::spawn(endpoint.run());

        (
            EndpointHandle {
                commands: command_tx,
            },
            event_rx,
        )
    }

    async fn run(mut self) {
        debug!("endpoint started");
        loop {
            self.flush().await;
            let deadline = self.manager.poll_timeout();

            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    if let Some(reply) = self.handle_command(command).await {
                        self.shutdown().await;
                        let _ = reply.send(());
                        return;
                    }
                }
                received = recv(&mut self.v4) => self.on_received(AddressFamily::V4, received),
                received = recv(&mut self.v6) => self.on_received(AddressFamily::V6, received),
                () = sleep_until(deadline) => self.manager.handle_timeout(Instant::now()),
            }
        }
        self.shutdown().await;
    }

    /// Run one command. Returns the reply channel if it asked to shut down.
    async fn handle_command(&mut self, command: Command) -> Option<oneshot::Sender<()>> {
        let now = Instant::now();
        match command {
            Command::Bind { addr, reply } => {
                let _ = reply.send(self.bind(addr).await);
            }
            Command::BindAll { port, reply } => {
                let v4 = self
                    .bind(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port))
                    .await;
                let v6 = self
                    .bind(SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), port))
                    .await;
                let _ = reply.send(BindAll { v4, v6 });
            }
            Command::LocalAddr { family, reply } => {
                let addr = self
                    .socket(family)
                    .and_then(|socket| socket.local_addr().ok());
                let _ = reply.send(addr);
            }
            Command::BoundFamilies { reply } => {
                let _ = reply.send(self.manager.bound_families());
            }
            Command::Connect { peer, reply } => {
                self.manager.connect(peer, now);
                let _ = reply.send(());
            }
            Command::Send {
                peer,
                data,
                reliable,
                reply,
            } => {
                let result = if reliable {
                    self.manager.send(peer, &data, now)
                } else {
                    self.manager.send_unreliable(peer, &data, now)
                };
                let _ = reply.send(result.map_err(EndpointError::from));
            }
            Command::Close {
                peer,
                reason,
                reply,
            } => {
                let result = self.manager.close(peer, &reason, now);
                let _ = reply.send(result.map_err(EndpointError::from));
            }
            Command::SetHeartbeatInterval {
                peer,
                interval,
                reply,
            } => {
                let result = self.manager.set_heartbeat_interval(peer, interval, now);
                let _ = reply.send(result.map_err(EndpointError::from));
            }
            Command::SetMaxConnections { max, reply } => {
                self.manager.set_max_connections(max);
                let _ = reply.send(());
            }
            Command::MaxConnections { reply } => {
                let _ = reply.send(self.manager.max_connections());
            }
            Command::ConnectionCount { reply } => {
                let _ = reply.send(self.manager.connection_count());
            }
            Command::Shutdown { reply } => return Some(reply),
        }
        None
    }

    async fn bind(&mut self, addr: SocketAddr) -> Result<SocketAddr, EndpointError> {
        let family = AddressFamily::of(&addr);
        if self.socket(family).is_some() {
            return Err(EndpointError::AlreadyBound(family));
        }

        let socket = RucSocketBuilder::new()
            .recv_buffer_size(self.recv_buffer_size)
            .bind(addr)
            .await
            .map_err(|source| EndpointError::Bind { addr, source })?;
        let local = socket.local_addr()?;

        match family {
            AddressFamily::V4 => self.v4 = Some(socket),
            AddressFamily::V6 => self.v6 = Some(socket),
        }
        self.manager.mark_bound(family);
        info!(addr = %local, "socket bound");
        Ok(local)
    }

    fn socket(&self, family: AddressFamily) -> Option<&RucSocket> {
        match family {
            AddressFamily::V4 => self.v4.as_ref(),
            AddressFamily::V6 => self.v6.as_ref(),
        }
    }

    fn on_received(
        &mut self,
        family: AddressFamily,
        received: io::Result<(Vec<u8>, SocketAddr)>,
    ) {
        match received {
            Ok((data, source)) => self.manager.handle_datagram(source, &data, Instant::now()),
            Err(err) => warn!(family = ?family, error = %err, "receive failed"),
        }
    }

    /// Send queued datagrams and forward queued events.
    async fn flush(&mut self) {
        while let Some(transmit) = self.manager.poll_transmit() {
            let Some(socket) = self.socket(AddressFamily::of(&transmit.destination)) else {
                warn!(peer = %transmit.destination, "no socket bound for family, dropping datagram");
                continue;
            };
            if let Err(err) = socket
                .send_to(&transmit.payload, transmit.destination)
                .await
            {
                warn!(peer = %transmit.destination, error = %err, "send failed");
            }
        }
        while let Some(event) = self.manager.poll_event() {
            if self.events.send(event).is_err() {
                trace!("event receiver dropped");
            }
        }
    }

    async fn shutdown(&mut self) {
        self.manager.close_all(Instant::now());
        self.flush().await;
        self.v4 = None;
        self.v6 = None;
        self.commands.close();
        info!("endpoint shut down");
    }
}

async fn recv(socket: &mut Option<RucSocket>) -> io::Result<(Vec<u8>, SocketAddr)> {
    match socket {
        Some(socket) => {
            let (data, source) = socket.recv_from().await?;
            Ok((data.to_vec(), source))
        }
        None => future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
        }
        None => future::pending().await,
    }
}

//! Async UDP socket wrapper for RUC endpoints.
//!
//! One socket is bound per address family; the endpoint owns both and sends
//! every engine's datagrams through them.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::trace;

use crate::core::constants::DEFAULT_RECV_BUFFER_SIZE;

/// Async UDP socket with its own receive buffer.
#[derive(Debug)]
pub struct RucSocket {
    /// The underlying UDP socket.
    socket: Arc<UdpSocket>,
    /// Receive buffer.
    recv_buffer: Vec<u8>,
}

impl RucSocket {
    /// Bind a socket to the given address.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        RucSocketBuilder::new().bind(addr).await
    }

    /// Get the local address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Send a datagram to `addr`.
    pub async fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        trace!(peer = %addr, len = data.len(), "send datagram");
        self.socket.send_to(data, addr).await
    }

    /// Receive a datagram and return it with the sender's address.
    pub async fn recv_from(&mut self) -> io::Result<(&[u8], SocketAddr)> {
        let (len, addr) = self.socket.recv_from(&mut self.recv_buffer).await?;
        Ok((&self.recv_buffer[..len], addr))
    }

    /// Receive buffer capacity; longer datagrams are truncated.
    pub fn recv_buffer_size(&self) -> usize {
        self.recv_buffer.len()
    }
}

/// Builder for [`RucSocket`].
#[derive(Debug, Clone)]
pub struct RucSocketBuilder {
    recv_buffer_size: usize,
}

impl Default for RucSocketBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RucSocketBuilder {
    /// Create a builder with default options.
    pub fn new() -> Self {
        Self {
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
        }
    }

    /// Set the receive buffer size.
    pub fn recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = size.max(1);
        self
    }

    /// Bind to the given address and create a socket.
    pub async fn bind(self, addr: SocketAddr) -> io::Result<RucSocket> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(self.wrap(socket))
    }

    fn wrap(self, socket: UdpSocket) -> RucSocket {
        RucSocket {
            socket: Arc::new(socket),
            recv_buffer: vec![0u8; self.recv_buffer_size],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_socket_bind() {
        let socket = RucSocket::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = socket.local_addr().unwrap();
        assert!(addr.port() != 0);
        assert_eq!(socket.recv_buffer_size(), DEFAULT_RECV_BUFFER_SIZE);
    }

    #[tokio::test]
    async fn test_socket_send_recv() {
        let mut server = RucSocket::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let server_addr = server.local_addr().unwrap();

        let client = RucSocket::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        let data = [0x22, 0x00, 0x00];
        client.send_to(&data, server_addr).await.unwrap();

        let (received, from) = server.recv_from().await.unwrap();
        assert_eq!(received, data);
        assert_eq!(from, client.local_addr().unwrap());
    }

    #[test]
    fn test_socket_builder() {
        let builder = RucSocketBuilder::new().recv_buffer_size(4096);
        assert_eq!(builder.recv_buffer_size, 4096);

        let builder = RucSocketBuilder::new().recv_buffer_size(0);
        assert_eq!(builder.recv_buffer_size, 1);
    }
}

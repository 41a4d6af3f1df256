//! Tokio adapter for the [`Transport`] trait.
//!
//! Sessions are synchronous: they poll their transport once per
//! `net_update()`. [`TokioUdpTransport`] wraps a [`tokio::net::UdpSocket`] so
//! an async game loop can wait for readability between updates instead of
//! spinning.
//!
//! | Sync (trait)               | Async                                               |
//! |----------------------------|-----------------------------------------------------|
//! | `send_to()`                | [`wait_writable()`](TokioUdpTransport::wait_writable) first |
//! | `receive_all_datagrams()`  | [`recv_all()`](TokioUdpTransport::recv_all)         |
//!
//! The trait methods never block: `send_to()` drops the datagram if the
//! socket would block and `receive_all_datagrams()` returns what is ready.
//!
//! ```no_run
//! use kart_netsync::tokio_socket::TokioUdpTransport;
//! use kart_netsync::{LocalIdentity, SessionBuilder};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = TokioUdpTransport::bind_to_port(5029).await?;
//!     let mut server = SessionBuilder::new()
//!         .with_identity(LocalIdentity::generate(&["host"])?)
//!         .start_server(transport)?;
//!     loop {
//!         server.net_update();
//!         tokio::time::sleep(std::time::Duration::from_millis(28)).await;
//!     }
//! }
//! ```
//!
//! Requires the `tokio` feature.

use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use tokio::net::UdpSocket;

use crate::report_violation;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::{Transport, MAX_PACKET_LENGTH};

const RECV_BUFFER_SIZE: usize = 4096;

/// A [`Transport`] over a Tokio UDP socket.
#[derive(Debug)]
pub struct TokioUdpTransport {
    socket: UdpSocket,
    recv_buffer: Box<[u8; RECV_BUFFER_SIZE]>,
}

impl TokioUdpTransport {
    /// Wraps a bound socket.
    #[must_use]
    pub fn new(socket: UdpSocket) -> Self {
        Self {
            socket,
            recv_buffer: Box::new([0; RECV_BUFFER_SIZE]),
        }
    }

    /// Binds to the given port on all interfaces. Port 0 lets the OS choose.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound.
    pub async fn bind_to_port(port: u16) -> Result<Self, std::io::Error> {
        let socket = UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)).await?;
        Ok(Self::new(socket))
    }

    /// The address the socket is bound to.
    ///
    /// # Errors
    ///
    /// Returns an error if the local address cannot be determined.
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.socket.local_addr()
    }

    /// The wrapped socket.
    #[must_use]
    pub fn inner(&self) -> &UdpSocket {
        &self.socket
    }

    /// Waits until the socket is readable, then returns every ready datagram.
    pub async fn recv_all(&mut self) -> Vec<(SocketAddr, Vec<u8>)> {
        if self.socket.readable().await.is_err() {
            return Vec::new();
        }
        self.receive_all_datagrams()
    }

    /// Waits until the socket is readable.
    ///
    /// # Errors
    ///
    /// Returns the socket's error.
    pub async fn wait_readable(&self) -> Result<(), std::io::Error> {
        self.socket.readable().await
    }

    /// Waits until the socket is writable.
    ///
    /// # Errors
    ///
    /// Returns the socket's error.
    pub async fn wait_writable(&self) -> Result<(), std::io::Error> {
        self.socket.writable().await
    }
}

impl Transport<SocketAddr> for TokioUdpTransport {
    fn send_to(&mut self, datagram: &[u8], addr: &SocketAddr) {
        if datagram.len() > MAX_PACKET_LENGTH {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::NetworkProtocol,
                "Sending UDP datagram of {} bytes, above the packet limit of {}",
                datagram.len(),
                MAX_PACKET_LENGTH
            );
        }
        match self.socket.try_send_to(datagram, *addr) {
            Ok(_) => {},
            Err(ref err) if err.kind() == ErrorKind::WouldBlock => {
                tracing::trace!(%addr, "socket not writable, datagram dropped");
            },
            Err(err) => report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::NetworkProtocol,
                "Failed to send UDP datagram to {}: {}",
                addr,
                err
            ),
        }
    }

    fn receive_all_datagrams(&mut self) -> Vec<(SocketAddr, Vec<u8>)> {
        let mut received = Vec::with_capacity(4);
        loop {
            match self.socket.try_recv_from(&mut self.recv_buffer[..]) {
                Ok((number_of_bytes, src_addr)) => {
                    if let Some(bytes) = self.recv_buffer.get(..number_of_bytes) {
                        received.push((src_addr, bytes.to_vec()));
                    }
                },
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => return received,
                Err(ref err) if err.kind() == ErrorKind::ConnectionReset => continue,
                Err(err) => {
                    report_violation!(
                        ViolationSeverity::Error,
                        ViolationKind::NetworkProtocol,
                        "Unexpected socket error: {:?}: {}",
                        err.kind(),
                        err
                    );
                    return received;
                },
            }
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    fn loopback(transport: &TokioUdpTransport) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), transport.local_addr().unwrap().port())
    }

    #[tokio::test]
    async fn empty_receive_does_not_block() {
        let mut transport = TokioUdpTransport::bind_to_port(0).await.unwrap();
        assert!(transport.receive_all_datagrams().is_empty());
    }

    #[tokio::test]
    async fn recv_all_waits_for_a_datagram() {
        let mut a = TokioUdpTransport::bind_to_port(0).await.unwrap();
        let mut b = TokioUdpTransport::bind_to_port(0).await.unwrap();
        let addr_b = loopback(&b);

        a.wait_writable().await.unwrap();
        a.send_to(&[7, 7, 7], &addr_b);

        let received = tokio::time::timeout(std::time::Duration::from_secs(2), b.recv_all())
            .await
            .unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0.port(), loopback(&a).port());
        assert_eq!(received[0].1, vec![7, 7, 7]);
    }
}

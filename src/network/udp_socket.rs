use std::{
    io::ErrorKind,
    net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket},
};

use crate::report_violation;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::{Transport, MAX_PACKET_LENGTH};

const RECV_BUFFER_SIZE: usize = 4096;

/// A non-blocking UDP transport. Listens on 0.0.0.0 on a given port.
///
/// The receive buffer is allocated once and reused for every `recv_from`.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    recv_buffer: Box<[u8; RECV_BUFFER_SIZE]>,
}

impl UdpTransport {
    /// Binds a UDP socket to 0.0.0.0:port and sets it to non-blocking mode.
    pub fn bind_to_port(port: u16) -> Result<Self, std::io::Error> {
        Self::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))
    }

    /// Binds a UDP socket to `addr` and sets it to non-blocking mode.
    pub fn bind(addr: SocketAddr) -> Result<Self, std::io::Error> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        tracing::debug!(local = ?socket.local_addr().ok(), "udp transport bound");
        Ok(Self {
            socket,
            recv_buffer: Box::new([0; RECV_BUFFER_SIZE]),
        })
    }

    /// The address the socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.socket.local_addr()
    }
}

impl Transport<SocketAddr> for UdpTransport {
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
        // UDP is best-effort; the reliability layer resends what matters.
        if let Err(e) = self.socket.send_to(datagram, addr) {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::NetworkProtocol,
                "Failed to send UDP datagram to {}: {}",
                addr,
                e
            );
        }
    }

    fn receive_all_datagrams(&mut self) -> Vec<(SocketAddr, Vec<u8>)> {
        let mut received = Vec::with_capacity(4);
        loop {
            match self.socket.recv_from(&mut self.recv_buffer[..]) {
                Ok((number_of_bytes, src_addr)) => {
                    if let Some(bytes) = self.recv_buffer.get(..number_of_bytes) {
                        received.push((src_addr, bytes.to_vec()));
                    }
                },
                // there are no more datagrams
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => return received,
                // datagram sockets sometimes get this error as a result of calling send_to
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

    // UDP delivery timing varies across platforms.
    #[cfg(not(miri))]
    #[track_caller]
    fn wait_for_datagrams(
        transport: &mut UdpTransport,
        expected_count: usize,
        max_retries: u32,
    ) -> Vec<(SocketAddr, Vec<u8>)> {
        let mut all_received = Vec::new();
        for _ in 0..max_retries {
            all_received.extend(transport.receive_all_datagrams());
            if all_received.len() >= expected_count {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
        all_received
    }

    // A socket bound to 0.0.0.0 cannot be sent to on every platform.
    #[cfg(not(miri))]
    #[track_caller]
    fn to_loopback_addr(transport: &UdpTransport) -> SocketAddr {
        let local = transport.local_addr().unwrap();
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), local.port())
    }

    #[test]
    #[cfg(not(miri))]
    fn receive_is_non_blocking() {
        let mut transport = UdpTransport::bind_to_port(0).unwrap();
        assert!(transport.receive_all_datagrams().is_empty());
        assert!(transport.receive_all_datagrams().is_empty());
    }

    #[test]
    #[cfg(not(miri))]
    fn datagrams_arrive_unchanged_with_sender() {
        let mut a = UdpTransport::bind_to_port(0).unwrap();
        let mut b = UdpTransport::bind_to_port(0).unwrap();
        let addr_a = to_loopback_addr(&a);
        let addr_b = to_loopback_addr(&b);

        a.send_to(&[1, 2, 3, 4], &addr_b);
        a.send_to(&[9; 1400], &addr_b);

        let received = wait_for_datagrams(&mut b, 2, 20);
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].0.port(), addr_a.port());
        assert_eq!(received[0].1, vec![1, 2, 3, 4]);
        assert_eq!(received[1].1.len(), 1400);
    }

    #[test]
    #[cfg(not(miri))]
    fn send_to_an_invalid_address_does_not_panic() {
        let mut transport = UdpTransport::bind_to_port(0).unwrap();
        let invalid = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
        transport.send_to(&[0], &invalid);
    }

    #[test]
    #[cfg(not(miri))]
    fn bound_port_is_assigned() {
        let transport = UdpTransport::bind_to_port(0).unwrap();
        let local = transport.local_addr().unwrap();
        assert_ne!(local.port(), 0);
        assert!(local.ip().is_unspecified());
    }

    #[test]
    #[allow(clippy::assertions_on_constants)]
    fn receive_buffer_holds_any_packet() {
        assert!(RECV_BUFFER_SIZE >= MAX_PACKET_LENGTH);
    }
}

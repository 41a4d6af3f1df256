//! The single owner of the transport, the node directory and every
//! reliable channel.
//!
//! Sessions drive an [`Endpoint`] once per pump tic:
//!
//! ```text
//! poll() ─► take_incoming() ─► (session handles packets, calls send())
//!        ─► tick() ─► flush()
//! ```
//!
//! Inbound datagrams are decoded, filtered by sender and released by the
//! reliable channels in order. Channel timeouts are queued as local
//! `NODETIMEOUT` packets and come out of the next [`take_incoming`]
//! together with real traffic, so a timeout is handled by the same code
//! path as any other packet.
//!
//! [`take_incoming`]: Endpoint::take_incoming

use std::collections::VecDeque;

use crate::directory::{Directory, NodeHandle, SlotVec};
use crate::error::NetsyncError;
use crate::network::codec;
use crate::network::messages::{Packet, PacketBody};
use crate::network::network_stats::NetworkStats;
use crate::network::packet_kind::PacketKind;
use crate::network::reliability::ReliableChannel;
use crate::report_violation;
use crate::sessions::config::ReliabilityConfig;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::{NodeId, PeerAddress, Tic, Transport, MAXNETNODES};

/// Where an inbound packet came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source<A> {
    /// A node in the directory.
    Node(NodeHandle),
    /// An address without a node. Only discovery and join openers get here.
    Unknown(A),
}

/// One decoded inbound packet.
#[derive(Debug, Clone)]
pub struct Incoming<A> {
    /// The sender.
    pub source: Source<A>,
    /// The packet.
    pub packet: Packet,
}

#[derive(Debug)]
struct NodeChannel {
    generation: u32,
    channel: ReliableChannel,
    stats: NetworkStats,
    timeout_reported: bool,
}

/// Transport, directory and reliability bundled behind one pump.
pub struct Endpoint<A: PeerAddress> {
    transport: Box<dyn Transport<A>>,
    directory: Directory<A>,
    channels: Vec<Option<NodeChannel>>,
    config: ReliabilityConfig,
    inbound: VecDeque<Incoming<A>>,
    now: Tic,
}

impl<A: PeerAddress> std::fmt::Debug for Endpoint<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("now", &self.now)
            .field("inbound", &self.inbound.len())
            .field("directory", &self.directory)
            .finish_non_exhaustive()
    }
}

impl<A: PeerAddress> Endpoint<A> {
    /// Creates an endpoint with an empty directory.
    pub fn new(transport: Box<dyn Transport<A>>, config: ReliabilityConfig) -> Self {
        Self {
            transport,
            directory: Directory::new(),
            channels: (0..MAXNETNODES).map(|_| None).collect(),
            config,
            inbound: VecDeque::new(),
            now: Tic::ZERO,
        }
    }

    /// The node directory.
    #[must_use]
    pub fn directory(&self) -> &Directory<A> {
        &self.directory
    }

    /// The node directory, mutably. Node creation and removal go through
    /// [`open_node`](Self::open_node) and [`close_node`](Self::close_node).
    pub fn directory_mut(&mut self) -> &mut Directory<A> {
        &mut self.directory
    }

    /// Pump tics elapsed.
    #[must_use]
    pub const fn now(&self) -> Tic {
        self.now
    }

    /// Assigns a node to `address` and gives it a fresh reliable channel.
    pub fn open_node(&mut self, address: A) -> Result<NodeHandle, NetsyncError> {
        let handle = self.directory.assign_node(address)?;
        let slot = &mut self.channels[handle.id.as_usize()];
        if slot.as_ref().map(|c| c.generation) != Some(handle.generation) {
            *slot = Some(NodeChannel {
                generation: handle.generation,
                channel: ReliableChannel::new(self.config, self.now),
                stats: NetworkStats::new(),
                timeout_reported: false,
            });
        }
        Ok(handle)
    }

    /// Opens a node for the sender of `first`, a reliable packet that arrived
    /// before the node existed and has already been handled.
    pub fn open_node_from(&mut self, address: A, first: &Packet) -> Result<NodeHandle, NetsyncError> {
        let handle = self.open_node(address)?;
        if let Some(node) = self.channel_mut(handle) {
            node.channel.adopt_first(first.ack);
            node.channel.on_ack_received(first.ack_return);
        }
        Ok(handle)
    }

    /// Frees a node, drops its channel and returns the player slots it owned.
    pub fn close_node(&mut self, node: NodeHandle) -> Result<SlotVec, NetsyncError> {
        let slots = self.directory.free_node(node)?;
        self.channels[node.id.as_usize()] = None;
        Ok(slots)
    }

    fn channel_mut(&mut self, node: NodeHandle) -> Option<&mut NodeChannel> {
        self.channels
            .get_mut(node.id.as_usize())?
            .as_mut()
            .filter(|c| c.generation == node.generation)
    }

    fn channel(&self, node: NodeHandle) -> Option<&NodeChannel> {
        self.channels
            .get(node.id.as_usize())?
            .as_ref()
            .filter(|c| c.generation == node.generation)
    }

    /// Sends `packet` to a node, reliably or not.
    pub fn send(&mut self, node: NodeHandle, packet: Packet, reliable: bool) -> Result<(), NetsyncError> {
        let address = match self.directory.address(node.id) {
            Some(address) if self.directory.is_current(node) => address.clone(),
            _ => return Err(NetsyncError::InvalidNode { node: node.id }),
        };
        let now = self.now;
        let Some(entry) = self.channel_mut(node) else {
            return Err(NetsyncError::InvalidNode { node: node.id });
        };
        let mut packet = packet;
        entry.channel.stamp(&mut packet, reliable)?;
        let bytes = codec::encode(&packet)?;
        tracing::trace!(node = %node.id, kind = %packet.kind(), ack = packet.ack, bytes = bytes.len(), "send");
        entry.stats.packets_sent += 1;
        entry.stats.bytes_sent += bytes.len() as u64;
        entry.channel.commit(packet, now);
        self.transport.send_to(&bytes, &address);
        Ok(())
    }

    /// Sends an unreliable packet to an address that has no node.
    pub fn send_unconnected(&mut self, address: &A, packet: Packet) -> Result<(), NetsyncError> {
        let mut packet = packet;
        packet.ack = 0;
        packet.ack_return = 0;
        let bytes = codec::encode(&packet)?;
        tracing::trace!(?address, kind = %packet.kind(), bytes = bytes.len(), "send unconnected");
        self.transport.send_to(&bytes, address);
        Ok(())
    }

    /// Reads every datagram the transport has, decodes and filters them.
    pub fn poll(&mut self) {
        for (address, datagram) in self.transport.receive_all_datagrams() {
            let node = self.directory.node_for_address(&address);
            let packet = match codec::decode(&datagram) {
                Ok(packet) => packet,
                Err(err) => {
                    if let Some(entry) = node.and_then(|n| self.channel_mut(n)) {
                        entry.stats.packets_rejected += 1;
                    }
                    report_violation!(
                        ViolationSeverity::Warning,
                        ViolationKind::NetworkProtocol,
                        "dropped datagram of {} bytes from {:?}: {}",
                        datagram.len(),
                        address,
                        err
                    );
                    continue;
                },
            };
            let Some(node) = node else {
                let kind = packet.kind();
                if kind.allowed_from_unknown() || kind == PacketKind::TellFilesNeeded {
                    self.inbound.push_back(Incoming {
                        source: Source::Unknown(address),
                        packet,
                    });
                } else {
                    tracing::trace!(?address, %kind, "packet from unknown address dropped");
                }
                continue;
            };
            let now = self.now;
            let Some(entry) = self.channel_mut(node) else {
                continue;
            };
            entry.stats.packets_received += 1;
            for delivered in entry.channel.on_receive(packet, now) {
                if delivered.kind() == PacketKind::Nothing {
                    continue;
                }
                tracing::trace!(node = %node.id, kind = %delivered.kind(), ack = delivered.ack, "receive");
                self.inbound.push_back(Incoming {
                    source: Source::Node(node),
                    packet: delivered,
                });
            }
        }
    }

    /// Everything received since the last call, in arrival order.
    pub fn take_incoming(&mut self) -> VecDeque<Incoming<A>> {
        std::mem::take(&mut self.inbound)
    }

    /// Advances the pump clock by one tic: resends overdue packets and queues
    /// a `NODETIMEOUT` for every node that just timed out.
    pub fn tick(&mut self) {
        self.now += 1;
        let now = self.now;
        for index in 0..self.channels.len() {
            let Some(id) = NodeId::new(index as u8) else {
                continue;
            };
            let Some(address) = self.directory.address(id).cloned() else {
                continue;
            };
            let Some(entry) = self.channels[index].as_mut() else {
                continue;
            };
            let outcome = entry.channel.tick(now);
            for packet in &outcome.resend {
                match codec::encode(packet) {
                    Ok(bytes) => {
                        entry.stats.packets_sent += 1;
                        entry.stats.bytes_sent += bytes.len() as u64;
                        self.transport.send_to(&bytes, &address);
                    },
                    Err(err) => report_violation!(
                        ViolationSeverity::Critical,
                        ViolationKind::InternalError,
                        "pending packet no longer encodes: {}",
                        err
                    ),
                }
            }
            if outcome.timed_out && !entry.timeout_reported {
                entry.timeout_reported = true;
                let node = NodeHandle {
                    id,
                    generation: entry.generation,
                };
                report_violation!(
                    ViolationSeverity::Warning,
                    ViolationKind::Reliability,
                    "{} timed out with {} packets unacknowledged",
                    id,
                    entry.channel.pending_len()
                );
                self.inbound.push_back(Incoming {
                    source: Source::Node(node),
                    packet: Packet::new(PacketBody::NodeTimeout),
                });
            }
        }
    }

    /// Sends an ack-only packet to every node that is owed one.
    pub fn flush(&mut self) {
        for index in 0..self.channels.len() {
            let Some(id) = NodeId::new(index as u8) else {
                continue;
            };
            let Some(address) = self.directory.address(id).cloned() else {
                continue;
            };
            let Some(entry) = self.channels[index].as_mut() else {
                continue;
            };
            let Some(packet) = entry.channel.take_ack_only() else {
                continue;
            };
            if let Ok(bytes) = codec::encode(&packet) {
                entry.stats.packets_sent += 1;
                entry.stats.bytes_sent += bytes.len() as u64;
                self.transport.send_to(&bytes, &address);
            }
        }
    }

    /// Returns `true` if no node has unacknowledged reliable packets.
    #[must_use]
    pub fn all_acked(&self) -> bool {
        self.channels
            .iter()
            .flatten()
            .all(|entry| entry.channel.all_acked() || entry.timeout_reported)
    }

    /// Returns `true` if `node` has no unacknowledged reliable packets.
    #[must_use]
    pub fn node_acked(&self, node: NodeHandle) -> bool {
        self.channel(node).is_none_or(|entry| entry.channel.all_acked())
    }

    /// Statistics for a node.
    #[must_use]
    pub fn stats(&self, node: NodeHandle) -> Option<NetworkStats> {
        self.channel(node).map(|entry| NetworkStats {
            send_queue_len: entry.channel.pending_len(),
            resends: entry.channel.resends(),
            duplicates: entry.channel.duplicates(),
            ..entry.stats
        })
    }

    /// Session-maintained statistics for a node.
    pub fn stats_mut(&mut self, node: NodeHandle) -> Option<&mut NetworkStats> {
        self.channel_mut(node).map(|entry| &mut entry.stats)
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
    use crate::network::messages::{AskInfoBody, PlayerDepartedBody};
    use crate::KickReason;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;
    use std::net::SocketAddr;
    use std::sync::Arc;

    type Mailboxes = Arc<Mutex<BTreeMap<SocketAddr, Vec<(SocketAddr, Vec<u8>)>>>>;

    struct Wire {
        local: SocketAddr,
        mailboxes: Mailboxes,
    }

    impl Transport<SocketAddr> for Wire {
        fn send_to(&mut self, datagram: &[u8], addr: &SocketAddr) {
            self.mailboxes
                .lock()
                .entry(*addr)
                .or_default()
                .push((self.local, datagram.to_vec()));
        }

        fn receive_all_datagrams(&mut self) -> Vec<(SocketAddr, Vec<u8>)> {
            self.mailboxes.lock().remove(&self.local).unwrap_or_default()
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn pair() -> (Endpoint<SocketAddr>, Endpoint<SocketAddr>, Mailboxes) {
        let mailboxes = Mailboxes::default();
        let a = Endpoint::new(
            Box::new(Wire {
                local: addr(1),
                mailboxes: mailboxes.clone(),
            }),
            ReliabilityConfig::default(),
        );
        let b = Endpoint::new(
            Box::new(Wire {
                local: addr(2),
                mailboxes: mailboxes.clone(),
            }),
            ReliabilityConfig::default(),
        );
        (a, b, mailboxes)
    }

    fn departed(slot: u8) -> Packet {
        Packet::new(PacketBody::PlayerDeparted(PlayerDepartedBody {
            slot,
            reason: KickReason::Kicked,
        }))
    }

    #[test]
    fn reliable_packets_arrive_and_get_acked() {
        let (mut a, mut b, _) = pair();
        let to_b = a.open_node(addr(2)).unwrap();
        let to_a = b.open_node(addr(1)).unwrap();
        a.send(to_b, departed(3), true).unwrap();
        assert!(!a.all_acked());

        b.poll();
        let incoming = b.take_incoming();
        assert_eq!(incoming.len(), 1);
        assert_eq!(incoming[0].source, Source::Node(to_a));
        b.tick();
        b.flush();

        a.poll();
        assert!(a.take_incoming().is_empty());
        assert!(a.all_acked());
        assert_eq!(a.stats(to_b).unwrap().packets_sent, 1);
    }

    #[test]
    fn lost_packets_are_resent() {
        let (mut a, mut b, mailboxes) = pair();
        let to_b = a.open_node(addr(2)).unwrap();
        b.open_node(addr(1)).unwrap();
        a.send(to_b, departed(1), true).unwrap();
        mailboxes.lock().clear();
        for _ in 0..ReliabilityConfig::default().resend_interval_tics {
            a.tick();
        }
        b.poll();
        assert_eq!(b.take_incoming().len(), 1);
        assert_eq!(a.stats(to_b).unwrap().resends, 1);
    }

    #[test]
    fn unknown_senders_only_reach_discovery_kinds() {
        let (mut a, mut b, _) = pair();
        a.send_unconnected(
            &addr(2),
            Packet::new(PacketBody::AskInfo(AskInfoBody {
                version: 1,
                echo_time: 5,
            })),
        )
        .unwrap();
        a.send_unconnected(&addr(2), departed(1)).unwrap();
        b.poll();
        let incoming = b.take_incoming();
        assert_eq!(incoming.len(), 1);
        assert_eq!(incoming[0].source, Source::Unknown(addr(1)));
        assert_eq!(incoming[0].packet.kind(), PacketKind::AskInfo);
    }

    #[test]
    fn corrupt_datagrams_are_counted() {
        let (mut a, mut b, mailboxes) = pair();
        let to_b = a.open_node(addr(2)).unwrap();
        let to_a = b.open_node(addr(1)).unwrap();
        a.send(to_b, departed(1), false).unwrap();
        for (_, datagram) in mailboxes.lock().get_mut(&addr(2)).unwrap().iter_mut() {
            datagram[9] ^= 0xFF;
        }
        b.poll();
        assert!(b.take_incoming().is_empty());
        assert_eq!(b.stats(to_a).unwrap().packets_rejected, 1);
    }

    #[test]
    fn silent_node_yields_one_timeout() {
        let (mut a, _b, _) = pair();
        let config = ReliabilityConfig::default();
        let to_b = a.open_node(addr(2)).unwrap();
        for _ in 0..config.connection_timeout_tics + 5 {
            a.tick();
        }
        let incoming = a.take_incoming();
        assert_eq!(incoming.len(), 1);
        assert_eq!(incoming[0].source, Source::Node(to_b));
        assert_eq!(incoming[0].packet.kind(), PacketKind::NodeTimeout);
    }

    #[test]
    fn closed_nodes_reject_stale_handles() {
        let (mut a, _b, _) = pair();
        let to_b = a.open_node(addr(2)).unwrap();
        a.close_node(to_b).unwrap();
        assert_eq!(
            a.send(to_b, departed(1), true),
            Err(NetsyncError::InvalidNode { node: to_b.id })
        );
        let again = a.open_node(addr(2)).unwrap();
        assert_eq!(again.id, to_b.id);
        assert_ne!(again.generation, to_b.generation);
        assert!(a.stats(to_b).is_none());
        assert!(a.stats(again).is_some());
    }
}

//! Per-node reliable delivery on top of an unreliable datagram transport.
//!
//! Every reliable packet gets an ack number in `1..=255` (0 marks an
//! unreliable packet). Each outgoing packet also carries `ack_return`, the
//! highest ack this side has delivered in order from the destination, which
//! cumulatively clears the destination's pending queue.
//!
//! ```text
//!   sender                                   receiver
//!   pending: [7, 8, 9]  ── ack 8 (lost) ──X
//!                       ── ack 9 ──────────► reorder: {9}
//!                       ◄─ ack_return 7 ───  (owes ack)
//!   resend 8 after resend_interval
//!                       ── ack 8 ──────────► deliver 8, 9
//!                       ◄─ ack_return 9 ───
//!   pending: []
//! ```

use smallvec::SmallVec;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use crate::network::messages::{Packet, PacketBody};
use crate::network::packet_kind::PacketKind;
use crate::sessions::config::ReliabilityConfig;
use crate::Tic;

/// Number of distinct reliable ack values.
const ACK_CYCLE: i16 = 255;

/// The ack following `ack`, skipping 0.
#[inline]
#[must_use]
pub const fn next_ack(ack: u8) -> u8 {
    if ack == u8::MAX {
        1
    } else {
        ack + 1
    }
}

/// Signed distance from `from` to `to` on the `1..=255` ack cycle, in
/// `-127..=127`. Positive means `to` is later than `from`.
///
/// ```
/// use kart_netsync::__internal::ack_distance;
///
/// assert_eq!(ack_distance(254, 2), 3);
/// assert_eq!(ack_distance(2, 254), -3);
/// assert_eq!(ack_distance(9, 9), 0);
/// ```
#[must_use]
pub fn ack_distance(from: u8, to: u8) -> i16 {
    let d = (i16::from(to) - i16::from(from)).rem_euclid(ACK_CYCLE);
    if d > ACK_CYCLE / 2 {
        d - ACK_CYCLE
    } else {
        d
    }
}

/// Errors raised when handing a packet to a [`ReliableChannel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReliabilityError {
    /// Too many reliable packets are waiting for acknowledgment.
    Backlog {
        /// Packets currently pending.
        pending: usize,
    },
}

impl fmt::Display for ReliabilityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backlog { pending } => {
                write!(f, "{} reliable packets are still unacknowledged", pending)
            },
        }
    }
}

impl std::error::Error for ReliabilityError {}

#[derive(Debug, Clone)]
struct PendingPacket {
    packet: Packet,
    first_sent: Tic,
    last_sent: Tic,
    retries: u32,
}

/// Packets released by one call to [`ReliableChannel::on_receive`], in delivery order.
pub type Delivered = SmallVec<[Packet; 2]>;

/// What one [`ReliableChannel::tick`] decided.
#[derive(Debug, Default)]
pub struct TickOutcome {
    /// Pending packets to transmit again, already stamped with the current `ack_return`.
    pub resend: Vec<Packet>,
    /// The node exceeded its retry budget or went silent.
    pub timed_out: bool,
}

/// Reliable, ordered delivery state for one remote node.
#[derive(Debug, Clone)]
pub struct ReliableChannel {
    config: ReliabilityConfig,
    next_ack: u8,
    pending: VecDeque<PendingPacket>,
    expected: u8,
    last_delivered: u8,
    reorder: BTreeMap<u8, Packet>,
    owe_ack: bool,
    last_heard: Tic,
    resends: u64,
    duplicates: u64,
}

impl ReliableChannel {
    /// Creates a channel for a node first seen at `now`.
    #[must_use]
    pub fn new(config: ReliabilityConfig, now: Tic) -> Self {
        Self {
            config,
            next_ack: 1,
            pending: VecDeque::new(),
            expected: 1,
            last_delivered: 0,
            reorder: BTreeMap::new(),
            owe_ack: false,
            last_heard: now,
            resends: 0,
            duplicates: 0,
        }
    }

    /// Starts the inbound sequence at `ack`, which the caller has already
    /// delivered out of band.
    pub fn adopt_first(&mut self, ack: u8) {
        if ack == 0 {
            return;
        }
        self.last_delivered = ack;
        self.expected = next_ack(ack);
        self.owe_ack = true;
    }

    fn budget(&self, kind: PacketKind) -> usize {
        if kind.can_fail() {
            self.config
                .max_pending
                .saturating_sub(self.config.reserved_for_must_deliver)
        } else {
            self.config.max_pending
        }
    }

    /// Fills in the ack fields of an outgoing packet without recording it.
    ///
    /// Call [`commit`](Self::commit) once the packet was actually sent.
    pub fn stamp(&self, packet: &mut Packet, reliable: bool) -> Result<(), ReliabilityError> {
        if reliable {
            let pending = self.pending.len();
            if pending >= self.budget(packet.kind()) {
                return Err(ReliabilityError::Backlog { pending });
            }
            packet.ack = self.next_ack;
        } else {
            packet.ack = 0;
        }
        packet.ack_return = self.last_delivered;
        Ok(())
    }

    /// Records a packet stamped by [`stamp`](Self::stamp) as sent.
    pub fn commit(&mut self, packet: Packet, now: Tic) {
        self.owe_ack = false;
        if packet.ack == 0 {
            return;
        }
        self.next_ack = next_ack(packet.ack);
        self.pending.push_back(PendingPacket {
            packet,
            first_sent: now,
            last_sent: now,
            retries: 0,
        });
    }

    /// Clears every pending packet up to and including `ack_return`.
    pub fn on_ack_received(&mut self, ack_return: u8) {
        if ack_return == 0 || !self.pending.iter().any(|p| p.packet.ack == ack_return) {
            return;
        }
        while let Some(front) = self.pending.pop_front() {
            if front.packet.ack == ack_return {
                break;
            }
        }
    }

    /// Processes an inbound packet and returns what may be delivered now.
    pub fn on_receive(&mut self, packet: Packet, now: Tic) -> Delivered {
        self.last_heard = now;
        self.on_ack_received(packet.ack_return);

        let mut delivered = Delivered::new();
        if packet.ack == 0 {
            delivered.push(packet);
            return delivered;
        }

        self.owe_ack = true;
        let distance = ack_distance(self.expected, packet.ack);
        if distance < 0 {
            self.duplicates += 1;
            tracing::trace!(ack = packet.ack, expected = self.expected, "duplicate reliable packet");
            return delivered;
        }
        if distance > 0 {
            if self.reorder.contains_key(&packet.ack) {
                self.duplicates += 1;
            } else if self.reorder.len() < self.config.max_reorder {
                self.reorder.insert(packet.ack, packet);
            }
            return delivered;
        }

        self.deliver_in_order(packet, &mut delivered);
        while let Some(next) = self.reorder.remove(&self.expected) {
            self.deliver_in_order(next, &mut delivered);
        }
        delivered
    }

    fn deliver_in_order(&mut self, packet: Packet, delivered: &mut Delivered) {
        self.last_delivered = packet.ack;
        self.expected = next_ack(packet.ack);
        delivered.push(packet);
    }

    /// Advances the channel clock: selects resends and checks for timeouts.
    pub fn tick(&mut self, now: Tic) -> TickOutcome {
        let mut outcome = TickOutcome::default();
        let ack_return = self.last_delivered;
        for entry in &mut self.pending {
            if now - entry.last_sent < i64::from(self.config.resend_interval_tics) {
                continue;
            }
            entry.retries += 1;
            entry.last_sent = now;
            entry.packet.ack_return = ack_return;
            if entry.retries > self.config.max_retries {
                outcome.timed_out = true;
            }
            outcome.resend.push(entry.packet.clone());
        }
        self.resends += outcome.resend.len() as u64;
        if !outcome.resend.is_empty() {
            self.owe_ack = false;
        }
        if now - self.last_heard >= i64::from(self.config.connection_timeout_tics) {
            outcome.timed_out = true;
        }
        outcome
    }

    /// An ack-only packet, if an ack is owed and nothing else carried it.
    pub fn take_ack_only(&mut self) -> Option<Packet> {
        if !self.owe_ack {
            return None;
        }
        self.owe_ack = false;
        let mut packet = Packet::new(PacketBody::Nothing);
        packet.ack_return = self.last_delivered;
        Some(packet)
    }

    /// Reliable packets not yet acknowledged.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Returns `true` if every reliable packet was acknowledged.
    #[must_use]
    pub fn all_acked(&self) -> bool {
        self.pending.is_empty()
    }

    /// Age of the oldest unacknowledged packet.
    #[must_use]
    pub fn oldest_pending_age(&self, now: Tic) -> Option<i64> {
        self.pending.front().map(|p| now - p.first_sent)
    }

    /// Highest ack delivered in order, 0 if none.
    #[must_use]
    pub const fn ack_return(&self) -> u8 {
        self.last_delivered
    }

    /// Tic at which the node was last heard from.
    #[must_use]
    pub const fn last_heard(&self) -> Tic {
        self.last_heard
    }

    /// Total retransmissions.
    #[must_use]
    pub const fn resends(&self) -> u64 {
        self.resends
    }

    /// Total duplicate reliable packets received.
    #[must_use]
    pub const fn duplicates(&self) -> u64 {
        self.duplicates
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
    use crate::network::messages::{FileReceivedBody, PlayerDepartedBody};
    use crate::KickReason;

    fn departed(slot: u8) -> Packet {
        Packet::new(PacketBody::PlayerDeparted(PlayerDepartedBody {
            slot,
            reason: KickReason::Quit,
        }))
    }

    fn send(channel: &mut ReliableChannel, packet: Packet, now: Tic) -> Packet {
        let mut packet = packet;
        channel.stamp(&mut packet, true).unwrap();
        channel.commit(packet.clone(), now);
        packet
    }

    fn slots(delivered: &Delivered) -> Vec<u8> {
        delivered
            .iter()
            .map(|p| match &p.body {
                PacketBody::PlayerDeparted(body) => body.slot,
                other => panic!("unexpected body {:?}", other),
            })
            .collect()
    }

    #[test]
    fn ack_numbers_skip_zero() {
        assert_eq!(next_ack(0), 1);
        assert_eq!(next_ack(254), 255);
        assert_eq!(next_ack(255), 1);
        assert_eq!(ack_distance(255, 1), 1);
        assert_eq!(ack_distance(1, 255), -1);
        assert_eq!(ack_distance(1, 128), 127);
        assert_eq!(ack_distance(1, 129), -127);
    }

    #[test]
    fn in_order_delivery_and_cumulative_ack() {
        let mut a = ReliableChannel::new(ReliabilityConfig::default(), Tic::ZERO);
        let mut b = ReliableChannel::new(ReliabilityConfig::default(), Tic::ZERO);
        let p1 = send(&mut a, departed(1), Tic::ZERO);
        let p2 = send(&mut a, departed(2), Tic::ZERO);
        let p3 = send(&mut a, departed(3), Tic::ZERO);
        assert_eq!(a.pending_len(), 3);

        assert!(b.on_receive(p2, Tic::new(1)).is_empty());
        assert!(b.on_receive(p3, Tic::new(1)).is_empty());
        assert_eq!(slots(&b.on_receive(p1.clone(), Tic::new(1))), vec![1, 2, 3]);
        assert_eq!(b.ack_return(), 3);

        let ack = b.take_ack_only().unwrap();
        assert_eq!(ack.ack_return, 3);
        assert!(b.take_ack_only().is_none());
        a.on_receive(ack, Tic::new(2));
        assert!(a.all_acked());

        assert!(b.on_receive(p1, Tic::new(3)).is_empty());
        assert_eq!(b.duplicates(), 1);
        assert!(b.take_ack_only().is_some());
    }

    #[test]
    fn stray_acks_are_ignored() {
        let mut a = ReliableChannel::new(ReliabilityConfig::default(), Tic::ZERO);
        send(&mut a, departed(1), Tic::ZERO);
        send(&mut a, departed(2), Tic::ZERO);
        a.on_ack_received(200);
        assert_eq!(a.pending_len(), 2);
        a.on_ack_received(1);
        assert_eq!(a.pending_len(), 1);
        a.on_ack_received(1);
        assert_eq!(a.pending_len(), 1);
    }

    #[test]
    fn unreliable_packets_bypass_ordering() {
        let mut a = ReliableChannel::new(ReliabilityConfig::default(), Tic::ZERO);
        let mut packet = Packet::new(PacketBody::Nothing);
        a.stamp(&mut packet, false).unwrap();
        assert_eq!(packet.ack, 0);
        a.commit(packet.clone(), Tic::ZERO);
        assert!(a.all_acked());

        let mut b = ReliableChannel::new(ReliabilityConfig::default(), Tic::ZERO);
        assert_eq!(b.on_receive(packet, Tic::ZERO).len(), 1);
        assert!(b.take_ack_only().is_none());
    }

    #[test]
    fn backlog_reserves_room_for_must_deliver_kinds() {
        let config = ReliabilityConfig {
            max_pending: 4,
            reserved_for_must_deliver: 2,
            ..ReliabilityConfig::default()
        };
        let mut a = ReliableChannel::new(config, Tic::ZERO);
        let file_received = || {
            Packet::new(PacketBody::FileReceived(FileReceivedBody {
                file_id: 1,
                iteration: 1,
            }))
        };
        send(&mut a, file_received(), Tic::ZERO);
        send(&mut a, file_received(), Tic::ZERO);
        let mut refused = file_received();
        assert_eq!(
            a.stamp(&mut refused, true),
            Err(ReliabilityError::Backlog { pending: 2 })
        );
        send(&mut a, departed(1), Tic::ZERO);
        send(&mut a, departed(2), Tic::ZERO);
        let mut full = departed(3);
        assert!(a.stamp(&mut full, true).is_err());
        assert!(a.stamp(&mut full, false).is_ok());
    }

    #[test]
    fn resends_after_interval_and_times_out_after_retries() {
        let config = ReliabilityConfig {
            resend_interval_tics: 2,
            max_retries: 3,
            connection_timeout_tics: 1000,
            ..ReliabilityConfig::default()
        };
        let mut a = ReliableChannel::new(config, Tic::ZERO);
        send(&mut a, departed(1), Tic::ZERO);
        assert!(a.tick(Tic::new(1)).resend.is_empty());
        let mut tic = 2;
        let mut timed_out = false;
        while !timed_out {
            let outcome = a.tick(Tic::new(tic));
            timed_out = outcome.timed_out;
            if tic % 2 == 0 {
                assert_eq!(outcome.resend.len(), 1);
            }
            tic += 1;
        }
        assert_eq!(a.resends(), 4);
    }

    #[test]
    fn silence_times_out() {
        let config = ReliabilityConfig {
            connection_timeout_tics: 10,
            ..ReliabilityConfig::default()
        };
        let mut a = ReliableChannel::new(config, Tic::ZERO);
        assert!(!a.tick(Tic::new(9)).timed_out);
        a.on_receive(Packet::new(PacketBody::Nothing), Tic::new(9));
        assert!(!a.tick(Tic::new(18)).timed_out);
        assert!(a.tick(Tic::new(19)).timed_out);
    }

    #[test]
    fn adopted_first_packet_is_acknowledged() {
        let mut b = ReliableChannel::new(ReliabilityConfig::default(), Tic::ZERO);
        b.adopt_first(1);
        assert_eq!(b.ack_return(), 1);
        let mut second = departed(2);
        second.ack = 2;
        assert_eq!(b.on_receive(second, Tic::ZERO).len(), 1);
    }

    #[test]
    fn sequence_survives_ack_wraparound() {
        let mut a = ReliableChannel::new(ReliabilityConfig::default(), Tic::ZERO);
        let mut b = ReliableChannel::new(ReliabilityConfig::default(), Tic::ZERO);
        for round in 0..600u32 {
            let packet = send(&mut a, departed((round % 16) as u8), Tic::new(round));
            assert_eq!(b.on_receive(packet, Tic::new(round)).len(), 1);
            let ack = b.take_ack_only().unwrap();
            a.on_receive(ack, Tic::new(round));
            assert!(a.all_acked());
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
mod property_tests {
    use super::*;
    use crate::network::messages::PlayerDepartedBody;
    use crate::test_config::miri_case_count;
    use crate::KickReason;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(miri_case_count()))]

        /// Reliable packets are delivered exactly once and in send order,
        /// whatever the arrival order and duplication.
        #[test]
        fn delivery_is_ordered_and_exactly_once(
            count in 1usize..40,
            arrivals in proptest::collection::vec(any::<prop::sample::Index>(), 0..200),
        ) {
            let mut a = ReliableChannel::new(ReliabilityConfig::default(), Tic::ZERO);
            let mut b = ReliableChannel::new(ReliabilityConfig::default(), Tic::ZERO);
            let mut sent = Vec::new();
            for i in 0..count {
                let mut packet = Packet::new(PacketBody::PlayerDeparted(PlayerDepartedBody {
                    slot: i as u8,
                    reason: KickReason::Quit,
                }));
                a.stamp(&mut packet, true).unwrap();
                a.commit(packet.clone(), Tic::ZERO);
                sent.push(packet);
            }
            let mut delivered = Vec::new();
            let order = arrivals.iter().map(|ix| ix.index(count)).chain(0..count);
            for index in order {
                for packet in b.on_receive(sent[index].clone(), Tic::ZERO) {
                    delivered.push(packet.ack);
                }
            }
            let expected: Vec<u8> = sent.iter().map(|p| p.ack).collect();
            prop_assert_eq!(delivered, expected);
        }

        #[test]
        fn distance_is_antisymmetric(from in 1u8..=255, to in 1u8..=255) {
            prop_assert_eq!(ack_distance(from, to), -ack_distance(to, from));
        }
    }
}

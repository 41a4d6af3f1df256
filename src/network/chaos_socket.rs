//! A transport wrapper for network fault injection.
//!
//! [`ChaosTransport`] wraps any [`Transport`] to simulate adverse network
//! conditions: latency, jitter, loss, burst loss, duplication, reordering and
//! corruption. Sessions must survive all of them.
//!
//! ```rust,no_run
//! use kart_netsync::{ChaosConfig, ChaosTransport, UdpTransport};
//!
//! let config = ChaosConfig::builder()
//!     .latency_ms(50)
//!     .jitter_ms(20)
//!     .packet_loss_rate(0.05)
//!     .seed(42)
//!     .build();
//! let transport = ChaosTransport::new(UdpTransport::bind_to_port(5029).unwrap(), config);
//! # let _ = transport;
//! ```

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use web_time::Instant;

use crate::{PeerAddress, Transport};

/// Configuration for network chaos simulation.
///
/// All durations default to zero and all rates to 0.0 (no effect).
#[derive(Debug, Clone, PartialEq)]
pub struct ChaosConfig {
    /// Base latency added to every received datagram.
    pub latency: Duration,
    /// Jitter is uniformly distributed in `[-jitter, +jitter]` around the latency.
    pub jitter: Duration,
    /// Probability of dropping a datagram on send.
    pub send_loss_rate: f64,
    /// Probability of dropping a datagram on receive.
    pub receive_loss_rate: f64,
    /// Probability of sending a datagram twice.
    pub duplication_rate: f64,
    /// Datagrams held back before a batch may be reordered. 0 disables reordering.
    pub reorder_buffer_size: usize,
    /// Probability of swapping each buffered datagram with a random other one.
    pub reorder_rate: f64,
    /// Probability of starting a burst loss on send.
    pub burst_loss_probability: f64,
    /// Consecutive datagrams dropped by one burst.
    pub burst_loss_length: usize,
    /// Probability of flipping one random byte of a sent datagram.
    pub corruption_rate: f64,
    /// Seed for reproducible runs. Seeded from the OS when `None`.
    pub seed: Option<u64>,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            latency: Duration::ZERO,
            jitter: Duration::ZERO,
            send_loss_rate: 0.0,
            receive_loss_rate: 0.0,
            duplication_rate: 0.0,
            reorder_buffer_size: 0,
            reorder_rate: 0.0,
            burst_loss_probability: 0.0,
            burst_loss_length: 0,
            corruption_rate: 0.0,
            seed: None,
        }
    }
}

impl ChaosConfig {
    /// Creates a new builder for fluent configuration.
    pub fn builder() -> ChaosConfigBuilder {
        ChaosConfigBuilder::new()
    }

    /// No chaos at all.
    pub fn passthrough() -> Self {
        Self::default()
    }

    /// Loss in both directions.
    pub fn lossy(loss_rate: f64) -> Self {
        Self {
            send_loss_rate: loss_rate,
            receive_loss_rate: loss_rate,
            ..Default::default()
        }
    }

    /// A typical bad internet connection.
    pub fn poor_network() -> Self {
        Self {
            latency: Duration::from_millis(100),
            jitter: Duration::from_millis(50),
            send_loss_rate: 0.05,
            receive_loss_rate: 0.05,
            ..Default::default()
        }
    }

    /// Everything at once.
    pub fn terrible_network() -> Self {
        Self {
            latency: Duration::from_millis(250),
            jitter: Duration::from_millis(100),
            send_loss_rate: 0.15,
            receive_loss_rate: 0.15,
            duplication_rate: 0.02,
            reorder_buffer_size: 5,
            reorder_rate: 0.1,
            corruption_rate: 0.01,
            ..Default::default()
        }
    }
}

/// Builder for [`ChaosConfig`].
#[derive(Debug, Clone, Default)]
pub struct ChaosConfigBuilder {
    config: ChaosConfig,
}

impl ChaosConfigBuilder {
    /// Creates a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the base latency.
    pub fn latency(mut self, latency: Duration) -> Self {
        self.config.latency = latency;
        self
    }

    /// Sets the base latency in milliseconds.
    pub fn latency_ms(mut self, ms: u64) -> Self {
        self.config.latency = Duration::from_millis(ms);
        self
    }

    /// Sets the maximum jitter.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.config.jitter = jitter;
        self
    }

    /// Sets the maximum jitter in milliseconds.
    pub fn jitter_ms(mut self, ms: u64) -> Self {
        self.config.jitter = Duration::from_millis(ms);
        self
    }

    /// Sets the loss rate for both directions.
    pub fn packet_loss_rate(mut self, rate: f64) -> Self {
        self.config.send_loss_rate = rate.clamp(0.0, 1.0);
        self.config.receive_loss_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Sets the loss rate for sending only.
    pub fn send_loss_rate(mut self, rate: f64) -> Self {
        self.config.send_loss_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Sets the loss rate for receiving only.
    pub fn receive_loss_rate(mut self, rate: f64) -> Self {
        self.config.receive_loss_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Sets the duplication rate.
    pub fn duplication_rate(mut self, rate: f64) -> Self {
        self.config.duplication_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Sets the reorder buffer size and rate.
    pub fn reorder(mut self, buffer_size: usize, rate: f64) -> Self {
        self.config.reorder_buffer_size = buffer_size;
        self.config.reorder_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Sets burst loss parameters: with `probability`, `length` consecutive
    /// sends are dropped.
    pub fn burst_loss(mut self, probability: f64, length: usize) -> Self {
        self.config.burst_loss_probability = probability.clamp(0.0, 1.0);
        self.config.burst_loss_length = length;
        self
    }

    /// Sets the corruption rate.
    pub fn corruption_rate(mut self, rate: f64) -> Self {
        self.config.corruption_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Sets the seed.
    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = Some(seed);
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> ChaosConfig {
        self.config
    }
}

/// Counters of what the chaos layer did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChaosStats {
    pub datagrams_sent: u64,
    pub dropped_send: u64,
    pub duplicated: u64,
    pub corrupted: u64,
    pub datagrams_received: u64,
    pub dropped_receive: u64,
    pub reordered: u64,
    pub burst_loss_events: u64,
    pub dropped_burst: u64,
}

#[derive(Debug, Clone)]
struct InFlight<A> {
    addr: A,
    datagram: Vec<u8>,
    deliver_at: Instant,
}

/// A transport wrapper that injects configurable network chaos.
///
/// Loss, bursts, duplication and corruption apply on send; latency, jitter,
/// receive loss and reordering apply on receive.
pub struct ChaosTransport<A: PeerAddress, T: Transport<A>> {
    inner: T,
    config: ChaosConfig,
    rng: SmallRng,
    in_flight: VecDeque<InFlight<A>>,
    reorder_buffer: Vec<(A, Vec<u8>)>,
    burst_loss_remaining: usize,
    stats: ChaosStats,
    _address: PhantomData<A>,
}

impl<A: PeerAddress, T: Transport<A>> std::fmt::Debug for ChaosTransport<A, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaosTransport")
            .field("config", &self.config)
            .field("in_flight", &self.in_flight.len())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl<A: PeerAddress, T: Transport<A>> ChaosTransport<A, T> {
    /// Wraps `inner`.
    pub fn new(inner: T, config: ChaosConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };
        Self {
            inner,
            config,
            rng,
            in_flight: VecDeque::new(),
            reorder_buffer: Vec::new(),
            burst_loss_remaining: 0,
            stats: ChaosStats::default(),
            _address: PhantomData,
        }
    }

    /// The wrapped transport.
    pub fn inner(&self) -> &T {
        &self.inner
    }

    /// The wrapped transport, mutably.
    pub fn inner_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Unwraps the inner transport. Datagrams in flight are lost.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// The current configuration.
    pub fn config(&self) -> &ChaosConfig {
        &self.config
    }

    /// Replaces the configuration. The generator keeps its state.
    pub fn set_config(&mut self, config: ChaosConfig) {
        self.config = config;
    }

    /// What the chaos layer did so far.
    pub fn stats(&self) -> &ChaosStats {
        &self.stats
    }

    /// Resets the counters.
    pub fn reset_stats(&mut self) {
        self.stats = ChaosStats::default();
    }

    /// Datagrams received but held back by latency.
    pub fn datagrams_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn delivery_time(&mut self) -> Instant {
        let now = Instant::now();
        if self.config.jitter.is_zero() {
            return now + self.config.latency;
        }
        let range = self.config.jitter.as_nanos() as i64;
        let offset = self.rng.gen_range(-range..=range);
        if offset >= 0 {
            now + self.config.latency + Duration::from_nanos(offset as u64)
        } else {
            // Negative jitter never delivers before now.
            now + self.config.latency.saturating_sub(Duration::from_nanos(offset.unsigned_abs()))
        }
    }

    fn roll(&mut self, rate: f64) -> bool {
        if rate <= 0.0 {
            false
        } else if rate >= 1.0 {
            true
        } else {
            self.rng.gen::<f64>() < rate
        }
    }

    fn drop_for_burst(&mut self) -> bool {
        if self.burst_loss_remaining > 0 {
            self.burst_loss_remaining -= 1;
            self.stats.dropped_burst += 1;
            return true;
        }
        if self.config.burst_loss_length > 0 && self.roll(self.config.burst_loss_probability) {
            self.stats.burst_loss_events += 1;
            self.burst_loss_remaining = self.config.burst_loss_length.saturating_sub(1);
            self.stats.dropped_burst += 1;
            return true;
        }
        false
    }

    fn deliver_ready(&mut self) -> Vec<(A, Vec<u8>)> {
        let now = Instant::now();
        let mut ready = Vec::new();
        while self.in_flight.front().is_some_and(|d| d.deliver_at <= now) {
            if let Some(datagram) = self.in_flight.pop_front() {
                ready.push((datagram.addr, datagram.datagram));
            }
        }
        ready
    }

    fn reorder(&mut self, datagrams: &mut Vec<(A, Vec<u8>)>) {
        if self.config.reorder_buffer_size == 0 || self.config.reorder_rate <= 0.0 {
            return;
        }
        self.reorder_buffer.append(datagrams);
        if self.reorder_buffer.len() < self.config.reorder_buffer_size {
            return;
        }
        for i in 0..self.reorder_buffer.len() {
            if self.roll(self.config.reorder_rate) {
                let j = self.rng.gen_range(0..self.reorder_buffer.len());
                if i != j {
                    self.reorder_buffer.swap(i, j);
                    self.stats.reordered += 1;
                }
            }
        }
        datagrams.append(&mut self.reorder_buffer);
    }
}

impl<A: PeerAddress, T: Transport<A>> Transport<A> for ChaosTransport<A, T> {
    fn send_to(&mut self, datagram: &[u8], addr: &A) {
        self.stats.datagrams_sent += 1;
        if self.drop_for_burst() {
            return;
        }
        if self.roll(self.config.send_loss_rate) {
            self.stats.dropped_send += 1;
            return;
        }
        if !datagram.is_empty() && self.roll(self.config.corruption_rate) {
            let mut corrupted = datagram.to_vec();
            let index = self.rng.gen_range(0..corrupted.len());
            let flip = self.rng.gen_range(1..=u8::MAX);
            corrupted[index] ^= flip;
            self.stats.corrupted += 1;
            self.inner.send_to(&corrupted, addr);
        } else {
            self.inner.send_to(datagram, addr);
        }
        if self.roll(self.config.duplication_rate) {
            self.stats.duplicated += 1;
            self.inner.send_to(datagram, addr);
        }
    }

    fn receive_all_datagrams(&mut self) -> Vec<(A, Vec<u8>)> {
        for (addr, datagram) in self.inner.receive_all_datagrams() {
            if self.roll(self.config.receive_loss_rate) {
                self.stats.dropped_receive += 1;
                continue;
            }
            let deliver_at = self.delivery_time();
            self.in_flight.push_back(InFlight {
                addr,
                datagram,
                deliver_at,
            });
        }
        if self.config.reorder_rate <= 0.0 {
            self.in_flight
                .make_contiguous()
                .sort_by_key(|d| d.deliver_at);
        }
        let mut ready = self.deliver_ready();
        self.stats.datagrams_received += ready.len() as u64;
        self.reorder(&mut ready);
        ready
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
    use parking_lot::Mutex;
    use std::net::SocketAddr;
    use std::sync::Arc;

    /// Loops every sent datagram back to the receive side.
    #[derive(Clone, Default)]
    struct Echo {
        queue: Arc<Mutex<Vec<(SocketAddr, Vec<u8>)>>>,
    }

    impl Transport<SocketAddr> for Echo {
        fn send_to(&mut self, datagram: &[u8], addr: &SocketAddr) {
            self.queue.lock().push((*addr, datagram.to_vec()));
        }

        fn receive_all_datagrams(&mut self) -> Vec<(SocketAddr, Vec<u8>)> {
            std::mem::take(&mut *self.queue.lock())
        }
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:7000".parse().unwrap()
    }

    #[test]
    fn passthrough_delivers_everything_unchanged() {
        let mut chaos = ChaosTransport::new(Echo::default(), ChaosConfig::passthrough());
        for i in 0..10u8 {
            chaos.send_to(&[i; 8], &addr());
        }
        let received = chaos.receive_all_datagrams();
        assert_eq!(received.len(), 10);
        assert_eq!(received[3].1, vec![3; 8]);
        assert_eq!(chaos.stats().datagrams_sent, 10);
        assert_eq!(chaos.stats().datagrams_received, 10);
    }

    #[test]
    fn full_send_loss_drops_everything() {
        let config = ChaosConfig::builder().send_loss_rate(1.0).seed(1).build();
        let mut chaos = ChaosTransport::new(Echo::default(), config);
        for _ in 0..5 {
            chaos.send_to(&[1], &addr());
        }
        assert!(chaos.receive_all_datagrams().is_empty());
        assert_eq!(chaos.stats().dropped_send, 5);
    }

    #[test]
    fn seeded_loss_is_reproducible() {
        let run = || {
            let config = ChaosConfig::builder().packet_loss_rate(0.3).seed(99).build();
            let mut chaos = ChaosTransport::new(Echo::default(), config);
            for i in 0..200u8 {
                chaos.send_to(&[i], &addr());
            }
            chaos
                .receive_all_datagrams()
                .into_iter()
                .map(|(_, d)| d[0])
                .collect::<Vec<_>>()
        };
        let first = run();
        assert_eq!(first, run());
        assert!(first.len() > 50 && first.len() < 190);
    }

    #[test]
    fn latency_holds_datagrams_back() {
        let config = ChaosConfig::builder().latency_ms(60_000).build();
        let mut chaos = ChaosTransport::new(Echo::default(), config);
        chaos.send_to(&[1, 2], &addr());
        assert!(chaos.receive_all_datagrams().is_empty());
        assert_eq!(chaos.datagrams_in_flight(), 1);
    }

    #[test]
    fn bursts_drop_consecutive_sends() {
        let config = ChaosConfig::builder().burst_loss(1.0, 3).seed(5).build();
        let mut chaos = ChaosTransport::new(Echo::default(), config);
        for _ in 0..6 {
            chaos.send_to(&[0], &addr());
        }
        assert_eq!(chaos.stats().burst_loss_events, 2);
        assert_eq!(chaos.stats().dropped_burst, 6);
    }

    #[test]
    fn corruption_changes_exactly_one_byte() {
        let config = ChaosConfig::builder().corruption_rate(1.0).seed(3).build();
        let mut chaos = ChaosTransport::new(Echo::default(), config);
        chaos.send_to(&[0; 16], &addr());
        let received = chaos.receive_all_datagrams();
        let changed = received[0].1.iter().filter(|b| **b != 0).count();
        assert_eq!(changed, 1);
    }

    #[test]
    fn duplication_sends_twice() {
        let config = ChaosConfig::builder().duplication_rate(1.0).build();
        let mut chaos = ChaosTransport::new(Echo::default(), config);
        chaos.send_to(&[4], &addr());
        assert_eq!(chaos.receive_all_datagrams().len(), 2);
    }
}

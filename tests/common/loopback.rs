//! An in-memory datagram network with a scriptable filter.
//!
//! Every [`LoopbackTransport`] created from one [`LoopbackNetwork`] can reach
//! every other. A filter sees each datagram on send and decides whether it is
//! delivered, dropped or held back until [`LoopbackNetwork::release_held`].

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    dead_code
)]

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use kart_netsync::__internal::{decode, PacketKind};
use kart_netsync::Transport;
use parking_lot::Mutex;

/// What happens to a datagram.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Verdict {
    Deliver,
    Drop,
    Hold,
}

/// A datagram in transit.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub bytes: Vec<u8>,
}

impl Datagram {
    /// The packet kind, if the datagram decodes.
    pub fn kind(&self) -> Option<PacketKind> {
        decode(&self.bytes).ok().map(|packet| packet.kind())
    }
}

type Filter = Box<dyn FnMut(&Datagram) -> Verdict + Send>;

#[derive(Default)]
struct Hub {
    inboxes: BTreeMap<SocketAddr, Vec<(SocketAddr, Vec<u8>)>>,
    filter: Option<Filter>,
    held: Vec<Datagram>,
    delivered: u64,
    dropped: u64,
}

impl Hub {
    fn route(&mut self, datagram: Datagram) {
        let verdict = self.filter.as_mut().map_or(Verdict::Deliver, |filter| filter(&datagram));
        match verdict {
            Verdict::Deliver => self.deliver(datagram),
            Verdict::Drop => self.dropped += 1,
            Verdict::Hold => self.held.push(datagram),
        }
    }

    fn deliver(&mut self, datagram: Datagram) {
        match self.inboxes.get_mut(&datagram.to) {
            Some(inbox) => {
                inbox.push((datagram.from, datagram.bytes));
                self.delivered += 1;
            },
            None => self.dropped += 1,
        }
    }
}

/// The shared network.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport bound to 127.0.0.1:`port`.
    pub fn transport(&self, port: u16) -> LoopbackTransport {
        let addr = local_addr(port);
        self.hub.lock().inboxes.entry(addr).or_default();
        LoopbackTransport {
            addr,
            hub: Arc::clone(&self.hub),
        }
    }

    /// Installs a filter, replacing any previous one.
    pub fn set_filter(&self, filter: impl FnMut(&Datagram) -> Verdict + Send + 'static) {
        self.hub.lock().filter = Some(Box::new(filter));
    }

    /// Removes the filter. Held datagrams stay held.
    pub fn clear_filter(&self) {
        self.hub.lock().filter = None;
    }

    /// Delivers every held datagram, bypassing the filter.
    pub fn release_held(&self) {
        let mut hub = self.hub.lock();
        for datagram in std::mem::take(&mut hub.held) {
            hub.deliver(datagram);
        }
    }

    pub fn held_count(&self) -> usize {
        self.hub.lock().held.len()
    }

    pub fn dropped(&self) -> u64 {
        self.hub.lock().dropped
    }

    pub fn delivered(&self) -> u64 {
        self.hub.lock().delivered
    }
}

/// One endpoint on a [`LoopbackNetwork`].
pub struct LoopbackTransport {
    addr: SocketAddr,
    hub: Arc<Mutex<Hub>>,
}

impl LoopbackTransport {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Transport<SocketAddr> for LoopbackTransport {
    fn send_to(&mut self, datagram: &[u8], addr: &SocketAddr) {
        self.hub.lock().route(Datagram {
            from: self.addr,
            to: *addr,
            bytes: datagram.to_vec(),
        });
    }

    fn receive_all_datagrams(&mut self) -> Vec<(SocketAddr, Vec<u8>)> {
        self.hub
            .lock()
            .inboxes
            .get_mut(&self.addr)
            .map(std::mem::take)
            .unwrap_or_default()
    }
}

pub fn local_addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

//! Drives one server and its clients over a [`LoopbackNetwork`], one pump tic
//! per step.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    dead_code
)]

use std::net::SocketAddr;

use kart_netsync::{
    ClientSession, JoinState, LocalIdentity, ReliabilityConfig, ServerSession, SessionBuilder,
    SessionEvent, Tic,
};

use super::kart::{scripted_cmd, KartGame};
use super::loopback::{local_addr, LoopbackNetwork};

pub const SERVER_PORT: u16 = 5029;
pub const MAX_JOIN_STEPS: usize = 600;

pub fn server_addr() -> SocketAddr {
    local_addr(SERVER_PORT)
}

/// Sends library logs to the captured test output. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_test_writer()
        .try_init();
}

/// A server builder with one local player named "host".
pub fn host_builder() -> SessionBuilder {
    SessionBuilder::new()
        .with_identity(LocalIdentity::generate(&["host"]).unwrap())
        .with_rng_seed(1)
}

/// A client builder with one local player named after `index`.
pub fn racer_builder(index: usize) -> SessionBuilder {
    let name = format!("racer{}", index);
    SessionBuilder::new().with_identity(LocalIdentity::generate(&[name.as_str()]).unwrap())
}

pub struct ServerPeer {
    pub session: ServerSession<SocketAddr>,
    pub game: KartGame,
    pub events: Vec<SessionEvent>,
}

impl ServerPeer {
    pub fn start(net: &LoopbackNetwork, builder: SessionBuilder) -> Self {
        Self::with_session(builder.start_server(net.transport(SERVER_PORT)).unwrap())
    }

    /// Wraps a server started on any transport.
    pub fn with_session(session: ServerSession<SocketAddr>) -> Self {
        init_tracing();
        Self {
            session,
            game: KartGame::new(),
            events: Vec::new(),
        }
    }

    pub fn step(&mut self) {
        let tic = self.session.current_tic().as_u32();
        for split in 0..self.session.local_slots().len() {
            let player = u32::from(self.session.local_slots()[split].as_u8());
            self.session
                .submit_local_ticcmd(split, scripted_cmd(tic, player))
                .unwrap();
        }
        self.session.net_update();
        if let Ok(requests) = self.session.try_run_tics(self.session.current_tic() + 1) {
            for (tic, value) in self.game.handle_requests(requests) {
                self.session.record_consistency(tic, value);
            }
        }
        self.events.extend(self.session.events());
    }
}

pub struct ClientPeer {
    pub session: ClientSession<SocketAddr>,
    pub game: KartGame,
    pub events: Vec<SessionEvent>,
    pub port: u16,
    players: usize,
}

impl ClientPeer {
    pub fn start(net: &LoopbackNetwork, port: u16, builder: SessionBuilder, players: usize) -> Self {
        Self::with_session(builder.start_client(net.transport(port), server_addr()).unwrap(), port, players)
    }

    /// Wraps a client started on any transport.
    pub fn with_session(session: ClientSession<SocketAddr>, port: u16, players: usize) -> Self {
        Self {
            session,
            game: KartGame::new(),
            events: Vec::new(),
            port,
            players,
        }
    }

    pub fn step(&mut self) {
        let tic = self.session.current_tic().as_u32();
        for split in 0..self.players {
            let player = self
                .session
                .local_slots()
                .get(split)
                .map_or(u32::from(self.port), |slot| u32::from(slot.as_u8()));
            self.session
                .submit_local_ticcmd(split, scripted_cmd(tic, player))
                .unwrap();
        }
        self.session.net_update();
        if let Ok(requests) = self.session.try_run_tics(self.session.needed_tic()) {
            for (tic, value) in self.game.handle_requests(requests) {
                self.session.record_consistency(tic, value);
            }
        }
        self.events.extend(self.session.events());
    }

    pub fn is_joined(&self) -> bool {
        self.session.state() == JoinState::Joined
    }
}

pub struct Match {
    pub net: LoopbackNetwork,
    pub server: ServerPeer,
    pub clients: Vec<ClientPeer>,
}

impl Match {
    /// A server with one local player and `clients` one-player clients.
    pub fn new(clients: usize) -> Self {
        Self::with_reliability(clients, ReliabilityConfig::default())
    }

    pub fn with_reliability(clients: usize, reliability: ReliabilityConfig) -> Self {
        let server = host_builder().with_reliability_config(reliability);
        let clients = (0..clients)
            .map(|index| (racer_builder(index).with_reliability_config(reliability), 1))
            .collect();
        Self::custom(server, clients)
    }

    /// A server and one client per builder. Each client has as many local
    /// players as its identity.
    pub fn custom(server: SessionBuilder, clients: Vec<(SessionBuilder, usize)>) -> Self {
        let net = LoopbackNetwork::new();
        let server = ServerPeer::start(&net, server);
        let clients = clients
            .into_iter()
            .enumerate()
            .map(|(index, (builder, players))| {
                ClientPeer::start(&net, SERVER_PORT + 1 + index as u16, builder, players)
            })
            .collect();
        Self { net, server, clients }
    }

    pub fn step(&mut self) {
        self.server.step();
        for client in &mut self.clients {
            client.step();
        }
    }

    /// Steps until `done` holds or `max_steps` pass. Returns whether `done` held.
    pub fn run_until(&mut self, max_steps: usize, done: impl Fn(&Self) -> bool) -> bool {
        for _ in 0..max_steps {
            if done(self) {
                return true;
            }
            self.step();
        }
        done(self)
    }

    /// Schedules a round re-proof at `start` on the server and every client.
    pub fn begin_round(&mut self, start: Tic) {
        self.server.session.begin_round(start);
        for client in &mut self.clients {
            client.session.begin_round(start);
        }
    }

    pub fn all_joined(&self) -> bool {
        self.clients.iter().all(ClientPeer::is_joined)
    }

    pub fn join_all(&mut self) {
        assert!(
            self.run_until(MAX_JOIN_STEPS, Self::all_joined),
            "clients did not join: {:?}",
            self.clients.iter().map(|c| c.session.state()).collect::<Vec<_>>()
        );
    }

    /// Asserts every client's state after each tic it ran equals the server's.
    pub fn assert_identical(&self) {
        for client in &self.clients {
            assert!(!client.game.history.is_empty(), "client {} ran no tics", client.port);
            for (tic, digest) in &client.game.history {
                assert_eq!(
                    self.server.game.history.get(tic),
                    Some(digest),
                    "client {} diverged at tic {}",
                    client.port,
                    tic
                );
            }
        }
    }

    /// The lowest tic every client has run up to.
    pub fn slowest_client_tic(&self) -> Tic {
        self.clients
            .iter()
            .map(|c| c.session.current_tic())
            .min()
            .unwrap_or(Tic::ZERO)
    }
}

//! Common test infrastructure shared across integration tests.
//!
//! - `loopback`: an in-memory network with a drop/hold filter
//! - `kart`: a deterministic game stub fulfilling session requests
//! - `harness`: a server and its clients stepped together

pub mod harness;
pub mod kart;
pub mod loopback;

#[allow(unused_imports)]
pub use harness::{host_builder, racer_builder, server_addr, ClientPeer, Match, ServerPeer, MAX_JOIN_STEPS, SERVER_PORT};
#[allow(unused_imports)]
pub use loopback::{Datagram, LoopbackNetwork, Verdict};

//! Network integration tests.
//!
//! - Session resilience over `ChaosTransport` (loss, latency, corruption)
//! - Sessions over real loopback UDP sockets

// Shared test infrastructure
#[path = "common/mod.rs"]
mod common;

mod network {
    pub mod resilience;
    pub mod udp;
}

//! Session integration tests.
//!
//! A server and its clients run over an in-memory network:
//! - join handshake, refusals, quitting, kicks and shutdown
//! - lockstep agreement under loss and catch-up
//! - content downloads before joining
//! - challenge rounds and signature failures

// Shared test infrastructure
#[path = "common/mod.rs"]
mod common;

mod sessions {
    pub mod files;
    pub mod join;
    pub mod lockstep;
    pub mod trust;
}

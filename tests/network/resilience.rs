//! Session resilience over `ChaosTransport`.
//!
//! Every peer's loopback transport is wrapped in a chaos layer so that loss,
//! duplication, reordering and corruption hit both directions independently.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::time::Duration;

use kart_netsync::{ChaosConfig, ChaosTransport, ReliabilityConfig, TicSyncConfig};

use crate::common::{
    host_builder, racer_builder, server_addr, ClientPeer, LoopbackNetwork, Match, ServerPeer,
    MAX_JOIN_STEPS, SERVER_PORT,
};

/// A match where every transport runs through its own chaos layer.
fn chaos_match(clients: usize, chaos: impl Fn(u64) -> ChaosConfig) -> Match {
    let net = LoopbackNetwork::new();
    let server = host_builder()
        .with_reliability_config(ReliabilityConfig::lossy())
        .with_tic_sync_config(TicSyncConfig::lossy());
    let transport = ChaosTransport::new(net.transport(SERVER_PORT), chaos(1));
    let server = ServerPeer::with_session(server.start_server(transport).unwrap());

    let clients = (0..clients)
        .map(|index| {
            let port = SERVER_PORT + 1 + index as u16;
            let transport = ChaosTransport::new(net.transport(port), chaos(100 + index as u64));
            let session = racer_builder(index)
                .with_reliability_config(ReliabilityConfig::lossy())
                .with_tic_sync_config(TicSyncConfig::lossy())
                .start_client(transport, server_addr())
                .unwrap();
            ClientPeer::with_session(session, port, 1)
        })
        .collect();
    Match { net, server, clients }
}

fn settle(game: &mut Match, steps: usize) {
    game.run_until(steps, |_| false);
    let caught_up = game.run_until(600, |m| {
        m.slowest_client_tic() + 4 >= m.server.session.current_tic()
    });
    assert!(caught_up, "clients fell behind for good");
}

#[test]
fn join_and_play_with_ten_percent_loss() {
    let mut game = chaos_match(2, |seed| {
        ChaosConfig::builder()
            .packet_loss_rate(0.10)
            .seed(seed)
            .build()
    });
    game.join_all();
    settle(&mut game, 150);
    assert!(game.all_joined());
    game.assert_identical();
}

#[test]
fn duplicated_and_reordered_datagrams_are_harmless() {
    let mut game = chaos_match(2, |seed| {
        ChaosConfig::builder()
            .duplication_rate(0.2)
            .reorder(4, 0.3)
            .seed(seed)
            .build()
    });
    game.join_all();
    settle(&mut game, 150);
    game.assert_identical();
}

#[test]
fn burst_loss_is_recovered() {
    let mut game = chaos_match(1, |seed| {
        ChaosConfig::builder()
            .packet_loss_rate(0.02)
            .burst_loss(0.02, 6)
            .seed(seed)
            .build()
    });
    game.join_all();
    settle(&mut game, 200);
    assert!(game.all_joined());
    game.assert_identical();
}

#[test]
fn corrupted_datagrams_are_rejected() {
    let mut game = chaos_match(1, |seed| ChaosConfig::builder().corruption_rate(0.1).seed(seed).build());
    game.join_all();
    settle(&mut game, 150);

    assert!(game.all_joined());
    game.assert_identical();
}

#[test]
fn small_latency_with_jitter_still_converges() {
    let mut game = chaos_match(1, |seed| {
        ChaosConfig::builder()
            .latency_ms(2)
            .jitter_ms(1)
            .seed(seed)
            .build()
    });
    let mut joined = false;
    for _ in 0..MAX_JOIN_STEPS * 2 {
        game.step();
        if game.all_joined() {
            joined = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(joined);
    for _ in 0..100 {
        game.step();
        std::thread::sleep(Duration::from_millis(1));
    }
    game.assert_identical();
}

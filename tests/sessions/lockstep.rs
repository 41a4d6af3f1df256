//! Lockstep tic distribution: every peer runs the same tics with the same inputs.

use kart_netsync::{SessionEvent, TicSyncConfig, BACKUPTICS};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::common::{host_builder, racer_builder, Match, Verdict};

/// Steps until every client has run every tic the server has built, minus
/// `slack`.
fn catch_up(game: &mut Match, max_steps: usize, slack: u32) -> bool {
    game.run_until(max_steps, |m| {
        let server_tic = m.server.session.current_tic();
        m.slowest_client_tic() + slack >= server_tic
    })
}

#[test]
fn clients_replay_the_server_tics_exactly() {
    let mut game = Match::new(2);
    game.join_all();
    let joined_at = game.server.session.current_tic();

    game.run_until(100, |_| false);
    assert!(catch_up(&mut game, 50, 4));

    assert!(game.server.session.current_tic() >= joined_at + 100);
    game.assert_identical();
    for client in &game.clients {
        let ran = client.game.history.len() as u32;
        assert!(ran >= 90, "client {} ran only {} tics", client.port, ran);
    }
}

#[test]
fn lockstep_survives_random_loss() {
    let mut game = Match::with_reliability(2, kart_netsync::ReliabilityConfig::lossy());
    game.join_all();

    let mut rng = SmallRng::seed_from_u64(0x6b61_7274);
    game.net.set_filter(move |_| {
        if rng.gen_bool(0.3) {
            Verdict::Drop
        } else {
            Verdict::Deliver
        }
    });
    game.run_until(70, |_| false);
    game.net.clear_filter();
    assert!(game.net.dropped() > 0);

    assert!(catch_up(&mut game, 400, 4), "clients never caught up");
    assert!(game.all_joined());
    game.assert_identical();
}

#[test]
fn held_tics_are_recovered_after_release() {
    let mut game = Match::new(1);
    game.join_all();
    let client_port = game.clients[0].port;

    game.net.set_filter(move |datagram| {
        if datagram.to.port() == client_port {
            Verdict::Hold
        } else {
            Verdict::Deliver
        }
    });
    let stalled_at = game.clients[0].session.current_tic();
    game.run_until(20, |_| false);
    assert!(game.clients[0].session.current_tic() <= stalled_at + 1);
    assert!(game.net.held_count() > 0);

    game.net.clear_filter();
    game.net.release_held();
    assert!(catch_up(&mut game, 200, 4));
    game.assert_identical();
}

#[test]
fn client_never_runs_ahead_of_the_server() {
    let mut game = Match::new(1);
    game.join_all();
    for _ in 0..60 {
        game.step();
        let client = &game.clients[0];
        assert!(client.session.current_tic() <= client.session.needed_tic());
        assert!(client.session.needed_tic() <= game.server.session.current_tic());
        assert!(
            (game.server.session.current_tic() - client.session.current_tic()) < BACKUPTICS as i64
        );
    }
}

#[test]
fn desynced_client_is_resynchronized() {
    let mut game = Match::new(1);
    game.join_all();
    game.run_until(20, |_| false);

    // Corrupt the client's simulation so its next reports disagree.
    game.clients[0].game.state.positions[0] += 1_000;
    let resynced = game.run_until(300, |m| {
        m.clients[0].game.loads >= 2 && m.clients[0].is_joined()
    });
    assert!(resynced, "client was not resynchronized");

    assert!(game
        .server
        .events
        .iter()
        .any(|event| matches!(event, SessionEvent::DesyncDetected { .. })));
    assert!(game
        .server
        .events
        .iter()
        .any(|event| matches!(event, SessionEvent::ResyncStarted { .. })));

    assert!(catch_up(&mut game, 100, 4));
    let client = &game.clients[0];
    let reloaded_at = client.game.last_load.unwrap();
    let after_resync: Vec<_> = client
        .game
        .history
        .range(reloaded_at..)
        .map(|(tic, digest)| (*tic, *digest))
        .collect();
    assert!(!after_resync.is_empty());
    for (tic, digest) in after_resync {
        assert_eq!(game.server.game.history.get(&tic), Some(&digest), "tic {}", tic);
    }
    assert!(client.is_joined());
}

#[test]
fn silent_client_is_stalled_then_kicked() {
    let tic_sync = TicSyncConfig {
        stall_kick_tics: 120,
        ..TicSyncConfig::default()
    };
    let mut game = Match::custom(
        host_builder().with_tic_sync_config(tic_sync),
        vec![(racer_builder(0), 1)],
    );
    game.join_all();
    let silent = game.clients[0].session.local_slots()[0];
    let client_port = game.clients[0].port;

    game.net.set_filter(move |datagram| {
        if datagram.from.port() == client_port {
            Verdict::Drop
        } else {
            Verdict::Deliver
        }
    });
    let kicked = game.run_until(400, |m| m.server.session.joined_nodes().is_empty());
    assert!(kicked);

    assert!(game.server.events.iter().any(|event| matches!(
        event,
        SessionEvent::PlayerStalled { slot, .. } if *slot == silent
    )));
    assert!(game.server.events.iter().any(|event| matches!(
        event,
        SessionEvent::PlayerDeparted { slot, reason: kart_netsync::KickReason::Timeout } if *slot == silent
    )));
}

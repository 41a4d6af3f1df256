//! Join handshake: discovery, admission, refusal and departure.

use kart_netsync::{
    BuildInfo, GoneReason, JoinState, KickReason, RefusalReason, ServerSettings, SessionEvent,
};

use crate::common::{host_builder, racer_builder, Match, MAX_JOIN_STEPS};

fn gone_reason(state: JoinState) -> Option<GoneReason> {
    match state {
        JoinState::Gone(reason) => Some(reason),
        _ => None,
    }
}

#[test]
fn two_clients_join_with_distinct_slots() {
    let mut game = Match::new(2);
    game.join_all();

    let host_slot = game.server.session.local_slots()[0];
    let first = game.clients[0].session.local_slots().to_vec();
    let second = game.clients[1].session.local_slots().to_vec();
    assert_eq!(first.len(), 1);
    assert_eq!(second.len(), 1);
    assert_ne!(first[0], second[0]);
    assert_ne!(first[0], host_slot);
    assert_ne!(second[0], host_slot);

    assert_eq!(game.server.session.joined_nodes().len(), 2);
    let mask = game.server.session.ingame_mask();
    assert_eq!(mask.count_ones(), 3);
    assert_ne!(mask & first[0].mask_bit(), 0);
    assert_ne!(mask & second[0].mask_bit(), 0);

    for client in &game.clients {
        assert!(client
            .events
            .iter()
            .any(|event| matches!(event, SessionEvent::Joined { .. })));
        assert_eq!(client.game.loads, 1, "a joining client loads exactly one gamestate");
    }
    let node_joins = game
        .server
        .events
        .iter()
        .filter(|event| matches!(event, SessionEvent::NodeJoined { .. }))
        .count();
    assert_eq!(node_joins, 2);
}

#[test]
fn roster_names_reach_every_peer() {
    let mut game = Match::new(2);
    game.join_all();
    game.run_until(20, |_| false);

    let second_slot = game.clients[1].session.local_slots()[0];
    let host_slot = game.server.session.local_slots()[0];
    assert_eq!(game.server.session.player_name(second_slot), Some("racer1"));
    assert_eq!(game.clients[0].session.player_name(second_slot), Some("racer1"));
    assert_eq!(game.clients[0].session.player_name(host_slot), Some("host"));
    assert_eq!(game.clients[1].session.player_name(host_slot), Some("host"));
}

#[test]
fn client_passes_through_handshake_states_in_order() {
    let mut game = Match::new(1);
    game.join_all();

    let states: Vec<JoinState> = game.clients[0]
        .events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::JoinStateChanged { state } => Some(*state),
            _ => None,
        })
        .collect();
    let position = |wanted: JoinState| states.iter().position(|state| *state == wanted);
    let order = [
        JoinState::InfoQueried,
        JoinState::AwaitingChallenge,
        JoinState::AwaitingConfig,
        JoinState::HasConfig,
        JoinState::AwaitingGamestateReady,
        JoinState::ReceivingGamestate,
        JoinState::Joined,
    ];
    let positions: Vec<usize> = order
        .iter()
        .map(|state| position(*state).unwrap_or_else(|| panic!("never entered {}", state)))
        .collect();
    assert!(positions.windows(2).all(|pair| pair[0] < pair[1]), "{:?}", states);
}

#[test]
fn disabled_joins_are_refused() {
    let settings = ServerSettings {
        allow_joins: false,
        ..ServerSettings::default()
    };
    let mut game = Match::custom(
        host_builder().with_server_settings(settings),
        vec![(racer_builder(0), 1)],
    );
    assert!(game.run_until(MAX_JOIN_STEPS, |m| m.clients[0].session.state().is_gone()));
    assert_eq!(
        gone_reason(game.clients[0].session.state()),
        Some(GoneReason::Refused(RefusalReason::JoinsDisabled))
    );
    assert!(game.server.session.joined_nodes().is_empty());
}

#[test]
fn mismatched_version_is_refused() {
    let other_build = BuildInfo {
        version: 2,
        ..BuildInfo::default()
    };
    let mut game = Match::custom(
        host_builder(),
        vec![(racer_builder(0).with_build_info(other_build), 1)],
    );
    assert!(game.run_until(MAX_JOIN_STEPS, |m| m.clients[0].session.state().is_gone()));
    assert_eq!(
        gone_reason(game.clients[0].session.state()),
        Some(GoneReason::Refused(RefusalReason::VersionMismatch))
    );
    assert!(game.clients[0]
        .events
        .iter()
        .any(|event| matches!(event, SessionEvent::ServerInfoReceived { .. })));
}

#[test]
fn full_server_refuses_the_second_client() {
    let settings = ServerSettings {
        max_players: 2,
        ..ServerSettings::default()
    };
    let mut game = Match::custom(
        host_builder().with_server_settings(settings),
        vec![(racer_builder(0), 1), (racer_builder(1), 1)],
    );
    let settled = game.run_until(MAX_JOIN_STEPS, |m| {
        m.clients
            .iter()
            .all(|client| client.is_joined() || client.session.state().is_gone())
    });
    assert!(settled);

    let joined = game.clients.iter().filter(|client| client.is_joined()).count();
    assert_eq!(joined, 1);
    let refused = game
        .clients
        .iter()
        .find(|client| !client.is_joined())
        .map(|client| client.session.state());
    assert_eq!(
        refused.and_then(gone_reason),
        Some(GoneReason::Refused(RefusalReason::Full))
    );
    assert_eq!(game.server.session.ingame_mask().count_ones(), 2);
}

#[test]
fn quitting_client_departs_with_quit_reason() {
    let mut game = Match::new(1);
    game.join_all();
    let slot = game.clients[0].session.local_slots()[0];
    game.server.events.clear();

    game.clients[0].session.quit();
    assert_eq!(
        game.clients[0].session.state(),
        JoinState::Gone(GoneReason::Quit)
    );
    game.run_until(40, |m| m.server.session.joined_nodes().is_empty());

    assert!(game.server.session.joined_nodes().is_empty());
    assert_eq!(game.server.session.ingame_mask() & slot.mask_bit(), 0);
    assert!(game.server.events.iter().any(|event| matches!(
        event,
        SessionEvent::PlayerDeparted { slot: departed, reason: KickReason::Quit } if *departed == slot
    )));
    assert!(game.server.events.iter().any(|event| matches!(
        event,
        SessionEvent::NodeDisconnected { reason: KickReason::Quit, .. }
    )));
}

#[test]
fn remaining_client_sees_departure() {
    let mut game = Match::new(2);
    game.join_all();
    let leaving = game.clients[1].session.local_slots()[0];
    game.clients[0].events.clear();

    game.clients[1].session.quit();
    game.run_until(60, |m| {
        m.clients[0].session.player_name(leaving).is_none()
    });

    assert!(game.clients[0].session.player_name(leaving).is_none());
    assert!(game.clients[0].events.iter().any(|event| matches!(
        event,
        SessionEvent::PlayerDeparted { slot, reason: KickReason::Quit } if *slot == leaving
    )));
    assert!(game.clients[0].is_joined());
}

#[test]
fn kicked_client_learns_the_reason() {
    let mut game = Match::new(1);
    game.join_all();
    let node = game.server.session.joined_nodes()[0];

    game.server
        .session
        .kick(node, KickReason::KickedWithReason, "unsporting driving")
        .unwrap();
    assert!(game.run_until(40, |m| m.clients[0].session.state().is_gone()));

    assert_eq!(
        game.clients[0].session.state(),
        JoinState::Gone(GoneReason::Kicked(KickReason::KickedWithReason))
    );
    assert!(game.clients[0].events.iter().any(|event| matches!(
        event,
        SessionEvent::Disconnected { message, .. } if message == "unsporting driving"
    )));
    assert!(game.server.events.iter().any(|event| matches!(
        event,
        SessionEvent::NodeDisconnected { reason: KickReason::KickedWithReason, .. }
    )));
}

#[test]
fn kicking_the_local_node_is_rejected() {
    let mut game = Match::new(0);
    let result = game
        .server
        .session
        .kick(kart_netsync::NodeId::SELF, KickReason::Kicked, "");
    assert!(result.is_err());
}

#[test]
fn shutdown_reaches_clients() {
    let mut game = Match::new(2);
    game.join_all();

    game.server.session.shutdown();
    assert!(game.server.session.try_run_tics(game.server.session.current_tic() + 1).is_err());
    assert!(game.run_until(40, |m| m
        .clients
        .iter()
        .all(|client| client.session.state().is_gone())));

    for client in &game.clients {
        assert_eq!(
            client.session.state(),
            JoinState::Gone(GoneReason::ServerShutdown)
        );
    }
}

#[test]
fn gone_client_refuses_to_run_tics() {
    let mut game = Match::new(1);
    game.join_all();
    game.clients[0].session.quit();
    let target = game.clients[0].session.current_tic() + 5;
    assert!(game.clients[0].session.try_run_tics(target).is_err());
}

//! Signatures: per-round re-proof, chat verification and signed commands.

use kart_netsync::__internal::PacketKind;
use kart_netsync::telemetry::{CollectingObserver, ViolationKind};
use kart_netsync::{GoneReason, JoinState, KickReason, ReliabilityConfig, SessionEvent, TrustConfig};
use std::sync::Arc;

use crate::common::{host_builder, racer_builder, Match, Verdict, SERVER_PORT};

/// Enough retries that a dropped response outlives the round's kick deadline.
fn patient_reliability() -> ReliabilityConfig {
    ReliabilityConfig {
        max_retries: 60,
        ..ReliabilityConfig::default()
    }
}

#[test]
fn round_reproof_verifies_every_answering_player() {
    let mut game = Match::with_reliability(2, patient_reliability());
    game.join_all();
    let start = game.server.session.current_tic() + 5;
    game.begin_round(start);

    let verified = game.run_until(450, |m| {
        m.clients.iter().all(|client| {
            client
                .events
                .iter()
                .any(|event| matches!(event, SessionEvent::ChallengeResultsVerified { .. }))
        })
    });
    assert!(verified);
    for client in &game.clients {
        assert!(client.events.iter().any(|event| matches!(
            event,
            SessionEvent::ChallengeResultsVerified { players: 3 }
        )));
        assert!(client.is_joined());
    }
}

#[test]
fn unresponsive_player_is_kicked_before_results() {
    let mut game = Match::with_reliability(2, patient_reliability());
    game.join_all();
    let silent_port = SERVER_PORT + 2;
    game.net.set_filter(move |datagram| {
        if datagram.from.port() == silent_port && datagram.kind() == Some(PacketKind::ResponseAll) {
            Verdict::Drop
        } else {
            Verdict::Deliver
        }
    });

    let start = game.server.session.current_tic() + 5;
    game.begin_round(start);
    let finished = game.run_until(450, |m| {
        m.clients[0]
            .events
            .iter()
            .any(|event| matches!(event, SessionEvent::ChallengeResultsVerified { .. }))
    });
    assert!(finished, "the answering client never saw verified results");

    assert_eq!(
        game.clients[1].session.state(),
        JoinState::Gone(GoneReason::Kicked(KickReason::SignatureFailure))
    );
    assert!(!game.clients[1]
        .events
        .iter()
        .any(|event| matches!(event, SessionEvent::ChallengeResultsVerified { .. })));
    assert!(game.clients[0].events.iter().any(|event| matches!(
        event,
        SessionEvent::ChallengeResultsVerified { players: 2 }
    )));
    assert!(game.server.events.iter().any(|event| matches!(
        event,
        SessionEvent::NodeDisconnected { reason: KickReason::SignatureFailure, .. }
    )));
    assert!(game.clients[0].is_joined());
}

#[test]
fn missing_results_disconnect_the_client_at_the_cutoff() {
    let mut game = Match::with_reliability(1, patient_reliability());
    game.join_all();
    let client_port = game.clients[0].port;
    game.net.set_filter(move |datagram| {
        if datagram.to.port() == client_port && datagram.kind() == Some(PacketKind::ResultsAll) {
            Verdict::Drop
        } else {
            Verdict::Deliver
        }
    });

    let start = game.server.session.current_tic() + 5;
    game.begin_round(start);
    let gone = game.run_until(700, |m| m.clients[0].session.state().is_gone());
    assert!(gone, "client outlived the round cutoff");

    assert_eq!(
        game.clients[0].session.state(),
        JoinState::Gone(GoneReason::TrustFailure)
    );
    let cutoff = start + kart_netsync::trust::CHALLENGEALL_CLIENTCUTOFF;
    assert!(game.clients[0].session.current_tic() >= cutoff);
    assert!(!game.clients[0]
        .events
        .iter()
        .any(|event| matches!(event, SessionEvent::ChallengeResultsVerified { .. })));
}

#[test]
fn unscheduled_challenge_is_answered_but_results_are_ignored() {
    let mut game = Match::with_reliability(1, patient_reliability());
    game.join_all();
    let start = game.server.session.current_tic() + 5;
    game.server.session.begin_round(start);

    game.run_until(450, |_| false);
    assert!(game.clients[0].is_joined());
    assert!(!game.server.events.iter().any(|event| matches!(
        event,
        SessionEvent::NodeDisconnected { .. }
    )));
    assert!(!game.clients[0]
        .events
        .iter()
        .any(|event| matches!(event, SessionEvent::ChallengeResultsVerified { .. })));
}

#[test]
fn chat_is_signed_and_relayed() {
    let mut game = Match::new(2);
    game.join_all();
    let speaker = game.clients[0].session.local_slots()[0];

    game.clients[0].session.say(0, "gg").unwrap();
    let relayed = game.run_until(30, |m| {
        m.clients[1]
            .events
            .iter()
            .any(|event| matches!(event, SessionEvent::ChatReceived { .. }))
    });
    assert!(relayed);

    let expected = SessionEvent::ChatReceived {
        slot: speaker,
        text: "gg".to_owned(),
        verified: true,
    };
    assert!(game.server.events.contains(&expected));
    assert!(game.clients[1].events.contains(&expected));
}

#[test]
fn server_chat_reaches_clients_verified() {
    let mut game = Match::new(1);
    game.join_all();
    let host = game.server.session.local_slots()[0];

    game.server.session.say(0, "green flag").unwrap();
    game.run_until(30, |m| {
        m.clients[0]
            .events
            .iter()
            .any(|event| matches!(event, SessionEvent::ChatReceived { .. }))
    });

    assert!(game.clients[0].events.contains(&SessionEvent::ChatReceived {
        slot: host,
        text: "green flag".to_owned(),
        verified: true,
    }));
}

#[test]
fn chat_before_joining_is_rejected() {
    let mut game = Match::new(1);
    assert!(game.clients[0].session.say(0, "hello?").is_err());
    game.join_all();
    let too_long = "x".repeat(kart_netsync::MAX_CHAT_LENGTH + 1);
    assert!(game.clients[0].session.say(0, &too_long).is_err());
}

#[test]
fn unsigned_commands_play_without_signature_checks() {
    let trust = TrustConfig::unsigned_ticcmds();
    let mut game = Match::custom(
        host_builder().with_trust_config(trust),
        vec![(racer_builder(0).with_trust_config(trust), 1)],
    );
    game.join_all();
    game.run_until(60, |_| false);
    assert!(game.clients[0].is_joined());
    game.assert_identical();
}

#[test]
fn trust_violations_reach_the_observer() {
    let observer = Arc::new(CollectingObserver::new());
    let mut game = Match::custom(
        host_builder()
            .with_reliability_config(patient_reliability())
            .with_violation_observer(observer.clone()),
        vec![(racer_builder(0).with_reliability_config(patient_reliability()), 1)],
    );
    game.join_all();
    game.net.set_filter(|datagram| {
        if datagram.kind() == Some(PacketKind::ResponseAll) {
            Verdict::Drop
        } else {
            Verdict::Deliver
        }
    });
    let start = game.server.session.current_tic() + 1;
    game.begin_round(start);
    game.run_until(250, |m| m.server.session.joined_nodes().is_empty());

    assert!(game.server.session.joined_nodes().is_empty());
    assert!(observer.has_violation(ViolationKind::Trust));
}

//! Sessions over real loopback UDP sockets.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use kart_netsync::{GoneReason, JoinState, UdpTransport};

use crate::common::{host_builder, racer_builder, ClientPeer, ServerPeer};

fn loopback(transport: &UdpTransport) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), transport.local_addr().unwrap().port())
}

fn udp_peers(clients: usize) -> (ServerPeer, Vec<ClientPeer>) {
    let transport = UdpTransport::bind_to_port(0).unwrap();
    let server_addr = loopback(&transport);
    let server = ServerPeer::with_session(host_builder().start_server(transport).unwrap());
    let clients = (0..clients)
        .map(|index| {
            let transport = UdpTransport::bind_to_port(0).unwrap();
            let port = loopback(&transport).port();
            let session = racer_builder(index)
                .start_client(transport, server_addr)
                .unwrap();
            ClientPeer::with_session(session, port, 1)
        })
        .collect();
    (server, clients)
}

fn step_all(server: &mut ServerPeer, clients: &mut [ClientPeer]) {
    server.step();
    for client in clients.iter_mut() {
        client.step();
    }
    std::thread::sleep(Duration::from_millis(1));
}

#[test]
#[cfg(not(miri))]
fn clients_join_and_play_over_udp() {
    let (mut server, mut clients) = udp_peers(2);

    let mut steps = 0;
    while !clients.iter().all(ClientPeer::is_joined) {
        assert!(steps < 2_000, "join over UDP did not finish");
        step_all(&mut server, &mut clients);
        steps += 1;
    }
    for _ in 0..80 {
        step_all(&mut server, &mut clients);
    }

    assert_eq!(server.session.joined_nodes().len(), 2);
    for client in &clients {
        assert!(client.game.history.len() > 40);
        for (tic, digest) in &client.game.history {
            assert_eq!(server.game.history.get(tic), Some(digest), "tic {}", tic);
        }
    }
}

#[test]
#[cfg(not(miri))]
fn shutdown_is_delivered_over_udp() {
    let (mut server, mut clients) = udp_peers(1);
    let mut steps = 0;
    while !clients[0].is_joined() {
        assert!(steps < 2_000, "join over UDP did not finish");
        step_all(&mut server, &mut clients);
        steps += 1;
    }

    server.session.shutdown();
    for _ in 0..200 {
        step_all(&mut server, &mut clients);
        if clients[0].session.state().is_gone() {
            break;
        }
    }
    assert_eq!(
        clients[0].session.state(),
        JoinState::Gone(GoneReason::ServerShutdown)
    );
}

//! Benchmarks for the wire codec
//!
//! Run with: cargo bench --bench codec
//!
//! Covers the two packets sent every tic: the server's tic broadcast and a
//! client's command bundle.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use kart_netsync::__internal::{
    decode, encode, CmdPrefix, ClientCmdBody, ConsistencyReport, Packet, PacketBody, ServerTicsBody,
    TicFrame,
};
use kart_netsync::Ticcmd;
use std::hint::black_box;

fn racing_cmd(tic: usize, player: usize) -> Ticcmd {
    Ticcmd {
        forward_move: 50,
        turning: ((tic * 7 + player * 13) % 200) as i16 - 100,
        angle: (tic * 311) as i16,
        buttons: u16::from(tic % 9 == 0),
        latency: 2,
        ..Ticcmd::NEUTRAL
    }
}

fn server_tics(players: usize, tics: usize) -> Packet {
    let ingame = ((1u32 << players) - 1) as u16;
    let frames = (0..tics)
        .map(|tic| TicFrame {
            ingame,
            cmds: (0..players).map(|player| racing_cmd(tic, player)).collect(),
        })
        .collect();
    Packet::new(PacketBody::ServerTics(ServerTicsBody {
        start_tic: 17,
        tics: frames,
    }))
}

fn client_cmd() -> Packet {
    Packet::new(PacketBody::ClientCmd(ClientCmdBody {
        prefix: CmdPrefix {
            client_tic: 40,
            resend_from: 38,
            consistency: Some(ConsistencyReport {
                tic: 37,
                value: 0xBEEF,
            }),
        },
        cmd: racing_cmd(40, 1),
    }))
}

fn bench_server_tics(c: &mut Criterion) {
    let mut group = c.benchmark_group("ServerTics");

    for players in [2usize, 8, 16] {
        let packet = server_tics(players, 4);
        let bytes = encode(&packet).unwrap_or_default();
        group.throughput(Throughput::Bytes(bytes.len() as u64));
        group.bench_with_input(BenchmarkId::new("encode", players), &packet, |b, packet| {
            b.iter(|| encode(black_box(packet)));
        });
        group.bench_with_input(BenchmarkId::new("decode", players), &bytes, |b, bytes| {
            b.iter(|| decode(black_box(bytes)));
        });
    }

    group.finish();
}

fn bench_client_cmd(c: &mut Criterion) {
    let mut group = c.benchmark_group("ClientCmd");
    let packet = client_cmd();
    let bytes = encode(&packet).unwrap_or_default();

    group.bench_function("encode", |b| {
        b.iter(|| encode(black_box(&packet)));
    });
    group.bench_function("decode", |b| {
        b.iter(|| decode(black_box(&bytes)));
    });

    group.finish();
}

criterion_group!(benches, bench_server_tics, bench_client_cmd);
criterion_main!(benches);

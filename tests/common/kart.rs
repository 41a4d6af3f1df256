//! A tiny deterministic kart simulation driven by session requests.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    dead_code
)]

use std::collections::BTreeMap;

use kart_netsync::hash::fnv1a_bytes;
use kart_netsync::{PlayerSlot, Tic, TicRequest, Ticcmd, MAXPLAYERS};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KartState {
    /// The next tic to run.
    pub tic: u32,
    pub positions: Vec<i64>,
    pub headings: Vec<i32>,
    pub items_thrown: u32,
}

impl KartState {
    fn new() -> Self {
        Self {
            tic: 0,
            positions: vec![0; MAXPLAYERS],
            headings: vec![0; MAXPLAYERS],
            items_thrown: 0,
        }
    }

    fn step(&mut self, inputs: &[(PlayerSlot, Ticcmd)]) {
        for (slot, cmd) in inputs {
            let index = slot.as_usize();
            self.headings[index] = self.headings[index].wrapping_add(i32::from(cmd.turning));
            self.positions[index] += i64::from(cmd.forward_move) * i64::from(self.headings[index] % 7 + 8);
            if cmd.buttons & 1 != 0 {
                self.items_thrown += 1;
            }
        }
        self.tic += 1;
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap()
    }

    pub fn digest(&self) -> u64 {
        fnv1a_bytes(&self.encode())
    }

    pub fn consistency(&self) -> u16 {
        (self.digest() & 0xffff) as u16
    }
}

pub struct KartGame {
    pub state: KartState,
    /// Digest of the state reached after each tic, by tic.
    pub history: BTreeMap<u32, u64>,
    pub loads: usize,
    pub saves: usize,
    /// The tic of the last loaded state.
    pub last_load: Option<u32>,
}

impl Default for KartGame {
    fn default() -> Self {
        Self::new()
    }
}

impl KartGame {
    pub fn new() -> Self {
        Self {
            state: KartState::new(),
            history: BTreeMap::new(),
            loads: 0,
            saves: 0,
            last_load: None,
        }
    }

    /// Fulfills the requests in order. Returns the consistency value of each
    /// tic run.
    pub fn handle_requests(&mut self, requests: Vec<TicRequest>) -> Vec<(Tic, u16)> {
        let mut reports = Vec::new();
        for request in requests {
            match request {
                TicRequest::SaveGamestate { cell, tic } => {
                    assert_eq!(self.state.tic, tic.as_u32(), "saved state is for the wrong tic");
                    cell.save(tic, self.state.encode(), Some(self.state.consistency()));
                    self.saves += 1;
                },
                TicRequest::LoadGamestate { cell, tic } => {
                    let data = cell.load().expect("loaded cell holds no data");
                    self.state = serde_json::from_slice(&data).unwrap();
                    assert_eq!(self.state.tic, tic.as_u32(), "loaded state is for the wrong tic");
                    self.loads += 1;
                    self.last_load = Some(tic.as_u32());
                },
                TicRequest::AdvanceTic { tic, inputs } => {
                    assert_eq!(self.state.tic, tic.as_u32(), "tics must run in order");
                    self.state.step(&inputs);
                    self.history.insert(tic.as_u32(), self.state.digest());
                    reports.push((tic, self.state.consistency()));
                },
                _ => {},
            }
        }
        reports
    }
}

/// The scripted input of one player for one tic.
pub fn scripted_cmd(tic: u32, player: u32) -> Ticcmd {
    let mix = tic.wrapping_mul(31).wrapping_add(player.wrapping_mul(97));
    Ticcmd {
        forward_move: (mix % 50) as i8,
        turning: ((mix % 17) as i16) - 8,
        buttons: u16::from(mix % 23 == 0),
        ..Ticcmd::NEUTRAL
    }
}

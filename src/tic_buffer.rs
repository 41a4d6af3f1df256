//! Fixed-depth ring of per-player ticcmds.
//!
//! Every peer keeps one [`TicBuffer`]. The server fills it when it builds a
//! tic, clients fill it from `SERVERTICS` broadcasts. A tic is *complete*
//! once its in-game mask is known and every player in that mask has a
//! command stored for exactly that tic.
//!
//! # Invariants
//!
//! - Each cell remembers the absolute tic it was written for, so an entry
//!   left over from `tic - BACKUPTICS` is never read as the entry for `tic`.
//! - A cell is only ever overwritten by a strictly newer tic.
//! - Writes more than `BACKUPTICS - 1` tics away from the reference tic are
//!   rejected.

use crate::ticcmd::Ticcmd;
use crate::{InputVec, PlayerSlot, Tic, BACKUPTICS, MAXPLAYERS};

/// Restores a full tic from its low byte, relative to a nearby tic.
///
/// The result is exact whenever the real tic is within 64 tics of `base`.
///
/// ```
/// use kart_netsync::__internal::expand_tic;
/// use kart_netsync::Tic;
///
/// assert_eq!(expand_tic(0x02, Tic::new(0x1FE)), Tic::new(0x202));
/// assert_eq!(expand_tic(0xFE, Tic::new(0x202)), Tic::new(0x1FE));
/// ```
#[must_use]
pub fn expand_tic(low: u8, base: Tic) -> Tic {
    let block = i64::from(base.as_u32() & !0xFF);
    let delta = i64::from(low) - i64::from(base.low_byte());
    let expanded = if (-64..=64).contains(&delta) {
        block + i64::from(low)
    } else if delta > 64 {
        block - 256 + i64::from(low)
    } else {
        block + 256 + i64::from(low)
    };
    match u32::try_from(expanded) {
        Ok(tic) => Tic::new(tic),
        Err(_) => Tic::new(u32::from(low)),
    }
}

/// Result of a ring write.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StoreOutcome {
    /// The entry was written.
    Stored,
    /// The same tic was already stored; nothing changed.
    Duplicate,
    /// A newer tic occupies the cell; nothing changed.
    Stale,
    /// The tic is `BACKUPTICS` or more behind the reference tic.
    TooOld,
    /// The tic is `BACKUPTICS` or more ahead of the reference tic.
    TooFarAhead,
}

impl StoreOutcome {
    /// Returns `true` if the write changed the buffer.
    #[must_use]
    pub const fn is_stored(self) -> bool {
        matches!(self, Self::Stored)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct StoredCmd {
    tic: Tic,
    cmd: Ticcmd,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct FrameMask {
    tic: Tic,
    ingame: u16,
}

/// Ring of `BACKUPTICS` tics by `MAXPLAYERS` slots.
#[derive(Debug, Clone)]
pub struct TicBuffer {
    cmds: Vec<[Option<StoredCmd>; MAXPLAYERS]>,
    masks: Vec<Option<FrameMask>>,
}

impl Default for TicBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl TicBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cmds: vec![[None; MAXPLAYERS]; BACKUPTICS],
            masks: vec![None; BACKUPTICS],
        }
    }

    fn window_check(tic: Tic, reference: Tic) -> Option<StoreOutcome> {
        let distance = tic - reference;
        if distance <= -(BACKUPTICS as i64) {
            Some(StoreOutcome::TooOld)
        } else if distance >= BACKUPTICS as i64 {
            Some(StoreOutcome::TooFarAhead)
        } else {
            None
        }
    }

    /// Stores one player's command for `tic`. `reference` is the tic the
    /// caller currently considers "now".
    pub fn store_cmd(
        &mut self,
        tic: Tic,
        slot: PlayerSlot,
        cmd: Ticcmd,
        reference: Tic,
    ) -> StoreOutcome {
        if let Some(rejected) = Self::window_check(tic, reference) {
            return rejected;
        }
        let cell = &mut self.cmds[tic.ring_index()][slot.as_usize()];
        match cell {
            Some(existing) if existing.tic == tic => StoreOutcome::Duplicate,
            Some(existing) if existing.tic > tic => StoreOutcome::Stale,
            _ => {
                *cell = Some(StoredCmd { tic, cmd });
                StoreOutcome::Stored
            },
        }
    }

    /// Stores a complete tic: the in-game mask plus one command per set bit,
    /// lowest slot first.
    pub fn store_frame(
        &mut self,
        tic: Tic,
        ingame: u16,
        cmds: &[Ticcmd],
        reference: Tic,
    ) -> StoreOutcome {
        if let Some(rejected) = Self::window_check(tic, reference) {
            return rejected;
        }
        if cmds.len() != ingame.count_ones() as usize {
            return StoreOutcome::Stale;
        }
        let index = tic.ring_index();
        match self.masks[index] {
            Some(existing) if existing.tic == tic => return StoreOutcome::Duplicate,
            Some(existing) if existing.tic > tic => return StoreOutcome::Stale,
            _ => {},
        }
        let row = &mut self.cmds[index];
        for (slot, cmd) in PlayerSlot::in_mask(ingame).zip(cmds.iter()) {
            row[slot.as_usize()] = Some(StoredCmd { tic, cmd: *cmd });
        }
        self.masks[index] = Some(FrameMask { tic, ingame });
        StoreOutcome::Stored
    }

    /// Returns the command stored for `slot` at exactly `tic`.
    #[must_use]
    pub fn cmd(&self, tic: Tic, slot: PlayerSlot) -> Option<Ticcmd> {
        self.cmds[tic.ring_index()][slot.as_usize()]
            .filter(|stored| stored.tic == tic)
            .map(|stored| stored.cmd)
    }

    /// The in-game mask of `tic`, if that tic has been stored.
    #[must_use]
    pub fn ingame_mask(&self, tic: Tic) -> Option<u16> {
        self.masks[tic.ring_index()]
            .filter(|mask| mask.tic == tic)
            .map(|mask| mask.ingame)
    }

    /// Returns `true` if `tic` is complete.
    #[must_use]
    pub fn has_frame(&self, tic: Tic) -> bool {
        self.frame(tic).is_some()
    }

    /// Returns the in-game mask and the per-player inputs of `tic`, in slot
    /// order, if every required command is present.
    #[must_use]
    pub fn frame(&self, tic: Tic) -> Option<(u16, InputVec)> {
        let ingame = self.ingame_mask(tic)?;
        let mut inputs = InputVec::new();
        for slot in PlayerSlot::in_mask(ingame) {
            inputs.push((slot, self.cmd(tic, slot)?));
        }
        Some((ingame, inputs))
    }

    /// Forgets everything stored for `slot` at `from` or later. Complete
    /// tics in that range that included the slot become incomplete.
    pub fn clear_slot_from(&mut self, slot: PlayerSlot, from: Tic) {
        for row in &mut self.cmds {
            let cell = &mut row[slot.as_usize()];
            if cell.is_some_and(|stored| stored.tic >= from) {
                *cell = None;
            }
        }
        for mask in &mut self.masks {
            if mask.is_some_and(|m| m.tic >= from && m.ingame & slot.mask_bit() != 0) {
                *mask = None;
            }
        }
    }

    /// Forgets everything. Used after loading a gamestate.
    pub fn reset(&mut self) {
        for row in &mut self.cmds {
            *row = [None; MAXPLAYERS];
        }
        for mask in &mut self.masks {
            *mask = None;
        }
    }
}

/// Ring of per-tic consistency values reported by the simulation.
#[derive(Debug, Clone)]
pub struct ConsistencyLog {
    values: Vec<Option<(Tic, u16)>>,
}

impl Default for ConsistencyLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsistencyLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self {
            values: vec![None; BACKUPTICS],
        }
    }

    /// Records the value for `tic`.
    pub fn record(&mut self, tic: Tic, value: u16) {
        self.values[tic.ring_index()] = Some((tic, value));
    }

    /// The value recorded for exactly `tic`.
    #[must_use]
    pub fn get(&self, tic: Tic) -> Option<u16> {
        self.values[tic.ring_index()]
            .filter(|(stored, _)| *stored == tic)
            .map(|(_, value)| value)
    }

    /// Forgets every value.
    pub fn reset(&mut self) {
        for value in &mut self.values {
            *value = None;
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    fn slot(n: u8) -> PlayerSlot {
        PlayerSlot::new(n).unwrap()
    }

    fn cmd(forward: i8) -> Ticcmd {
        Ticcmd {
            forward_move: forward,
            ..Ticcmd::default()
        }
    }

    #[test]
    fn expand_tic_near_block_boundaries() {
        assert_eq!(expand_tic(10, Tic::new(5)), Tic::new(10));
        assert_eq!(expand_tic(250, Tic::new(260)), Tic::new(250));
        assert_eq!(expand_tic(4, Tic::new(250)), Tic::new(260));
        // Below tic 256 there is no previous block to fall back into.
        assert_eq!(expand_tic(200, Tic::new(20)), Tic::new(200));
    }

    #[test]
    fn frame_requires_every_ingame_player() {
        let mut buffer = TicBuffer::new();
        let tic = Tic::new(7);
        assert!(buffer.store_cmd(tic, slot(0), cmd(1), tic).is_stored());
        assert!(!buffer.has_frame(tic));
        assert_eq!(
            buffer.store_frame(tic, 0b11, &[cmd(1), cmd(2)], tic),
            StoreOutcome::Stored
        );
        let (mask, inputs) = buffer.frame(tic).unwrap();
        assert_eq!(mask, 0b11);
        assert_eq!(inputs.as_slice(), &[(slot(0), cmd(1)), (slot(1), cmd(2))]);
    }

    #[test]
    fn duplicate_frames_do_not_change_stored_input() {
        let mut buffer = TicBuffer::new();
        let tic = Tic::new(3);
        buffer.store_frame(tic, 0b1, &[cmd(5)], tic);
        assert_eq!(
            buffer.store_frame(tic, 0b1, &[cmd(9)], tic),
            StoreOutcome::Duplicate
        );
        assert_eq!(buffer.cmd(tic, slot(0)), Some(cmd(5)));
    }

    #[test]
    fn ring_boundary_rejects_too_old_tics() {
        let mut buffer = TicBuffer::new();
        let current = Tic::new(2000);
        let newer = Tic::new(2000 - 1);
        buffer.store_cmd(newer, slot(2), cmd(4), current);

        let too_old = Tic::new(2000 - BACKUPTICS as u32 - 1);
        assert_eq!(
            buffer.store_cmd(too_old, slot(2), cmd(8), current),
            StoreOutcome::TooOld
        );
        let exactly_depth = Tic::new(2000 - BACKUPTICS as u32);
        assert_eq!(
            buffer.store_cmd(exactly_depth, slot(2), cmd(8), current),
            StoreOutcome::TooOld
        );
        assert_eq!(buffer.cmd(newer, slot(2)), Some(cmd(4)));
    }

    #[test]
    fn older_tic_never_overwrites_newer_cell() {
        let mut buffer = TicBuffer::new();
        let newer = Tic::new(BACKUPTICS as u32 + 10);
        let older = Tic::new(10);
        buffer.store_cmd(newer, slot(0), cmd(1), newer);
        assert_eq!(
            buffer.store_cmd(older, slot(0), cmd(2), Tic::new(300)),
            StoreOutcome::Stale
        );
        assert_eq!(buffer.cmd(newer, slot(0)), Some(cmd(1)));
        assert_eq!(buffer.cmd(older, slot(0)), None);
    }

    #[test]
    fn stale_entry_at_same_index_is_not_read_as_current() {
        let mut buffer = TicBuffer::new();
        buffer.store_frame(Tic::new(1), 0b1, &[cmd(3)], Tic::new(1));
        let aliased = Tic::new(1 + BACKUPTICS as u32);
        assert!(!buffer.has_frame(aliased));
        assert_eq!(buffer.cmd(aliased, slot(0)), None);
    }

    #[test]
    fn too_far_ahead_is_rejected() {
        let mut buffer = TicBuffer::new();
        assert_eq!(
            buffer.store_frame(Tic::new(BACKUPTICS as u32), 0b1, &[cmd(1)], Tic::ZERO),
            StoreOutcome::TooFarAhead
        );
    }

    #[test]
    fn clearing_a_slot_invalidates_future_frames_only() {
        let mut buffer = TicBuffer::new();
        for t in 0..10u32 {
            buffer.store_frame(Tic::new(t), 0b11, &[cmd(1), cmd(2)], Tic::new(t));
        }
        buffer.clear_slot_from(slot(1), Tic::new(5));
        assert!(buffer.has_frame(Tic::new(4)));
        assert!(!buffer.has_frame(Tic::new(5)));
        assert_eq!(buffer.cmd(Tic::new(9), slot(1)), None);
        assert_eq!(buffer.cmd(Tic::new(9), slot(0)), Some(cmd(1)));
    }

    #[test]
    fn consistency_log_is_tic_exact() {
        let mut log = ConsistencyLog::new();
        log.record(Tic::new(4), 99);
        assert_eq!(log.get(Tic::new(4)), Some(99));
        assert_eq!(log.get(Tic::new(4 + BACKUPTICS as u32)), None);
    }

    mod property_tests {
        use super::*;
        use crate::test_config::miri_case_count;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: miri_case_count(),
                ..ProptestConfig::default()
            })]

            #[test]
            fn expand_tic_recovers_nearby_tics(base in 64u32..1_000_000, offset in -64i64..=64) {
                let actual = Tic::new((i64::from(base) + offset) as u32);
                prop_assert_eq!(expand_tic(actual.low_byte(), Tic::new(base)), actual);
            }

            #[test]
            fn stored_frames_read_back(start in 0u32..100_000, len in 1u32..64, mask in 1u16..=u16::MAX) {
                let mut buffer = TicBuffer::new();
                let players = mask.count_ones() as usize;
                for t in start..start + len {
                    let cmds: Vec<Ticcmd> = (0..players).map(|i| cmd((t as usize + i) as i8)).collect();
                    prop_assert!(buffer.store_frame(Tic::new(t), mask, &cmds, Tic::new(start)).is_stored());
                }
                for t in start..start + len {
                    let (stored_mask, inputs) = buffer.frame(Tic::new(t)).unwrap();
                    prop_assert_eq!(stored_mask, mask);
                    prop_assert_eq!(inputs.len(), players);
                }
            }
        }
    }
}

//! One tic of one player's input.

use serde::{Deserialize, Serialize};

/// One player's input for one simulation tic.
///
/// The field order is the wire order. Every field is fixed width, so a
/// `Ticcmd` always occupies [`Ticcmd::WIRE_SIZE`] bytes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Ticcmd {
    /// Throttle (positive) or brake/reverse (negative).
    pub forward_move: i8,
    /// Steering input.
    pub turning: i16,
    /// Absolute facing angle, high 16 bits.
    pub angle: i16,
    /// Item throw direction.
    pub throw_dir: i16,
    /// Vertical aim.
    pub aiming: i16,
    /// Button bitfield.
    pub buttons: u16,
    /// Reduced-width timestamp. Clients write the low byte of their current
    /// tic; the server replaces it with the measured lag in tics, clamped to
    /// [`MAX_PREDICT_TICS`](crate::MAX_PREDICT_TICS).
    pub latency: u8,
    /// Miscellaneous flags.
    pub flags: u8,
}

impl Ticcmd {
    /// Encoded size of one command.
    pub const WIRE_SIZE: usize = 13;

    /// The command substituted for a player whose input never arrived.
    pub const NEUTRAL: Ticcmd = Ticcmd {
        forward_move: 0,
        turning: 0,
        angle: 0,
        throw_dir: 0,
        aiming: 0,
        buttons: 0,
        latency: 0,
        flags: 0,
    };

    /// A copy of this command carrying the given latency value.
    #[must_use]
    pub const fn with_latency(mut self, latency: u8) -> Self {
        self.latency = latency;
        self
    }
}

//! Cell through which the game hands serialized state to the session and back.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::report_violation;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::Tic;

#[derive(Debug, Default)]
struct SavedGamestate {
    tic: Tic,
    data: Option<Vec<u8>>,
    consistency: Option<u16>,
}

/// A shared cell holding one serialized gamestate.
///
/// You receive it through [`TicRequest::SaveGamestate`] (fill it) and
/// [`TicRequest::LoadGamestate`] (read it). Clones share the same contents,
/// so the session sees what you saved as soon as `save` returns.
///
/// The bytes are opaque to this library; they are streamed to joining or
/// resynchronizing clients exactly as saved.
///
/// ```
/// use kart_netsync::{GamestateCell, Tic};
///
/// let cell = GamestateCell::expecting(Tic::new(42));
/// assert!(!cell.save(Tic::new(41), vec![1, 2, 3], None));
/// assert!(cell.save(Tic::new(42), vec![1, 2, 3], Some(7)));
/// assert_eq!(cell.load(), Some(vec![1, 2, 3]));
/// assert_eq!(cell.consistency(), Some(7));
/// ```
///
/// [`TicRequest::SaveGamestate`]: crate::TicRequest::SaveGamestate
/// [`TicRequest::LoadGamestate`]: crate::TicRequest::LoadGamestate
#[derive(Clone, Default)]
pub struct GamestateCell(Arc<Mutex<SavedGamestate>>);

impl GamestateCell {
    /// An empty cell that only accepts a save for `tic`.
    #[must_use]
    pub fn expecting(tic: Tic) -> Self {
        Self(Arc::new(Mutex::new(SavedGamestate {
            tic,
            data: None,
            consistency: None,
        })))
    }

    /// A cell already holding `data` for `tic`.
    #[must_use]
    pub fn with_data(tic: Tic, data: Vec<u8>) -> Self {
        Self(Arc::new(Mutex::new(SavedGamestate {
            tic,
            data: Some(data),
            consistency: None,
        })))
    }

    /// Stores the serialized state reached just before running `tic`.
    ///
    /// Returns `false` and stores nothing if `tic` is not the tic this cell
    /// was handed out for.
    pub fn save(&self, tic: Tic, data: Vec<u8>, consistency: Option<u16>) -> bool {
        let mut state = self.0.lock();
        if state.tic != tic {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::TicSync,
                "gamestate saved for tic {} but requested for tic {}",
                tic,
                state.tic
            );
            return false;
        }
        state.data = Some(data);
        state.consistency = consistency;
        true
    }

    /// A copy of the stored bytes, if any.
    #[must_use]
    pub fn load(&self) -> Option<Vec<u8>> {
        self.0.lock().data.clone()
    }

    /// The tic this cell belongs to.
    #[must_use]
    pub fn tic(&self) -> Tic {
        self.0.lock().tic
    }

    /// The consistency value stored alongside the state.
    #[must_use]
    pub fn consistency(&self) -> Option<u16> {
        self.0.lock().consistency
    }

    /// Returns `true` once the game has saved into the cell.
    #[must_use]
    pub fn is_saved(&self) -> bool {
        self.0.lock().data.is_some()
    }
}

impl std::fmt::Debug for GamestateCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.0.lock();
        f.debug_struct("GamestateCell")
            .field("tic", &state.tic)
            .field("bytes", &state.data.as_ref().map(Vec::len))
            .field("consistency", &state.consistency)
            .finish()
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

    #[test]
    fn clones_share_contents() {
        let cell = GamestateCell::expecting(Tic::new(3));
        let clone = cell.clone();
        assert!(!clone.is_saved());
        cell.save(Tic::new(3), vec![9; 4], None);
        assert!(clone.is_saved());
        assert_eq!(clone.load(), Some(vec![9; 4]));
    }

    #[test]
    fn with_data_is_immediately_loadable() {
        let cell = GamestateCell::with_data(Tic::new(10), vec![1]);
        assert_eq!(cell.tic(), Tic::new(10));
        assert_eq!(cell.load(), Some(vec![1]));
        assert!(format!("{:?}", cell).contains("bytes: Some(1)"));
    }
}

//! Join progress of a client, as seen by either end.
//!
//! ```text
//! Unknown ──► InfoQueried ──► AwaitingChallenge ──► AwaitingConfig ──► HasConfig
//!                  │                 ▲    │                                 │
//!                  │                 │    ▼                                 ▼
//!                  │           DownloadingFiles            AwaitingGamestateReady ◄─┐
//!                  │                                                  │             │
//!                  ▼                                                  ▼             │
//!              Gone(..) ◄──── any state          ReceivingGamestate ──► Joined ─────┘
//!                                                                      (resync)
//! ```

use std::fmt;

use crate::{KickReason, RefusalReason};

/// Why a session or a node left.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum GoneReason {
    /// The server refused the join.
    Refused(RefusalReason),
    /// The server removed the client.
    Kicked(KickReason),
    /// The other end stopped answering.
    TimedOut,
    /// The local side quit.
    Quit,
    /// The server shut down.
    ServerShutdown,
    /// The server's challenge results did not verify, or never arrived.
    TrustFailure,
    /// A file or gamestate transfer could not be completed.
    TransferFailed,
}

impl fmt::Display for GoneReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Refused(reason) => write!(f, "refused: {}", reason),
            Self::Kicked(reason) => write!(f, "kicked: {}", reason),
            Self::TimedOut => write!(f, "connection timed out"),
            Self::Quit => write!(f, "quit"),
            Self::ServerShutdown => write!(f, "server shut down"),
            Self::TrustFailure => write!(f, "server failed trust verification"),
            Self::TransferFailed => write!(f, "transfer failed"),
        }
    }
}

/// Where a client is in the join handshake.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum JoinState {
    /// Nothing sent yet.
    #[default]
    Unknown,
    /// `ASKINFO` sent, waiting for `SERVERINFO`.
    InfoQueried,
    /// `CLIENTKEY` sent, waiting for `SERVERCHALLENGE`.
    AwaitingChallenge,
    /// Missing content files are being downloaded.
    DownloadingFiles,
    /// `CLIENTJOIN` sent, waiting for `SERVERCFG`.
    AwaitingConfig,
    /// `SERVERCFG` received, waiting for the gamestate offer.
    HasConfig,
    /// `CANRECEIVEGAMESTATE` sent, waiting for the stream to start.
    AwaitingGamestateReady,
    /// The gamestate is streaming in.
    ReceivingGamestate,
    /// In game.
    Joined,
    /// Finished, with a reason.
    Gone(GoneReason),
}

impl JoinState {
    /// Returns `true` for [`JoinState::Joined`].
    #[must_use]
    pub const fn is_joined(&self) -> bool {
        matches!(self, Self::Joined)
    }

    /// Returns `true` for [`JoinState::Gone`].
    #[must_use]
    pub const fn is_gone(&self) -> bool {
        matches!(self, Self::Gone(_))
    }

    /// Returns `true` between `SERVERCFG` and the end of the gamestate stream.
    #[must_use]
    pub const fn is_loading_gamestate(&self) -> bool {
        matches!(
            self,
            Self::HasConfig | Self::AwaitingGamestateReady | Self::ReceivingGamestate
        )
    }

    /// Returns `true` if moving to `next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        use JoinState::*;
        match (*self, next) {
            (Gone(_), _) => false,
            (_, Gone(_)) => true,
            (Unknown, InfoQueried | AwaitingChallenge) => true,
            (InfoQueried, InfoQueried | AwaitingChallenge) => true,
            (AwaitingChallenge, AwaitingConfig | DownloadingFiles | AwaitingChallenge) => true,
            (DownloadingFiles, AwaitingChallenge) => true,
            (AwaitingConfig, HasConfig) => true,
            (HasConfig, AwaitingGamestateReady) => true,
            (AwaitingGamestateReady, AwaitingGamestateReady | ReceivingGamestate) => true,
            (ReceivingGamestate, Joined | AwaitingGamestateReady) => true,
            (Joined, AwaitingGamestateReady) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JoinState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gone(reason) => write!(f, "gone ({})", reason),
            other => write!(f, "{:?}", other),
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

    #[test]
    fn happy_path_is_legal() {
        let path = [
            JoinState::Unknown,
            JoinState::InfoQueried,
            JoinState::AwaitingChallenge,
            JoinState::AwaitingConfig,
            JoinState::HasConfig,
            JoinState::AwaitingGamestateReady,
            JoinState::ReceivingGamestate,
            JoinState::Joined,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn download_detour_returns_for_a_fresh_challenge() {
        assert!(JoinState::AwaitingChallenge.can_transition_to(JoinState::DownloadingFiles));
        assert!(JoinState::DownloadingFiles.can_transition_to(JoinState::AwaitingChallenge));
        assert!(!JoinState::DownloadingFiles.can_transition_to(JoinState::AwaitingConfig));
    }

    #[test]
    fn gone_is_terminal() {
        let gone = JoinState::Gone(GoneReason::TimedOut);
        assert!(!gone.can_transition_to(JoinState::Unknown));
        assert!(!gone.can_transition_to(JoinState::Gone(GoneReason::Quit)));
        assert!(JoinState::Joined.can_transition_to(gone));
    }

    #[test]
    fn resync_goes_back_through_gamestate_ready() {
        assert!(JoinState::Joined.can_transition_to(JoinState::AwaitingGamestateReady));
        assert!(!JoinState::Joined.can_transition_to(JoinState::AwaitingConfig));
    }

    #[test]
    fn reasons_display_distinctly() {
        let refused = GoneReason::Refused(RefusalReason::Full).to_string();
        let kicked = GoneReason::Kicked(KickReason::SignatureFailure).to_string();
        assert!(refused.contains("server is full"));
        assert!(kicked.contains("signature"));
        assert_ne!(GoneReason::TimedOut.to_string(), GoneReason::Quit.to_string());
    }
}

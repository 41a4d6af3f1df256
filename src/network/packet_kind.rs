//! The closed set of packet kinds and their per-kind header properties.

use std::fmt;

/// Tag selecting the payload layout of a packet.
///
/// Kinds at or above [`PacketKind::CAN_FAIL`] may be refused by the
/// reliability layer when a node's backlog is high. Everything below must be
/// delivered or the node times out.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum PacketKind {
    /// Ack-only packet with no payload.
    Nothing = 0,
    /// Session configuration sent to a joining client.
    ServerCfg = 1,
    /// One local player's command.
    ClientCmd = 2,
    /// One local player's command, client is missing tics.
    ClientMis = 3,
    /// Two local players' commands.
    Client2Cmd = 4,
    /// Two local players' commands, client is missing tics.
    Client2Mis = 5,
    /// Three local players' commands.
    Client3Cmd = 6,
    /// Three local players' commands, client is missing tics.
    Client3Mis = 7,
    /// Four local players' commands.
    Client4Cmd = 8,
    /// Four local players' commands, client is missing tics.
    Client4Mis = 9,
    /// Keep-alive from a node with no local players.
    NodeKeepAlive = 10,
    /// Keep-alive from a node with no local players, missing tics.
    NodeKeepAliveMis = 11,
    /// Window of complete tics broadcast by the server.
    ServerTics = 12,
    /// Join refused.
    ServerRefuse = 13,
    /// The server is shutting down.
    ServerShutdown = 14,
    /// The client is leaving.
    ClientQuit = 15,
    /// Discovery query.
    AskInfo = 16,
    /// Discovery reply.
    ServerInfo = 17,
    /// Roster update.
    PlayerInfo = 18,
    /// Client asks for missing content files.
    RequestFile = 19,
    /// Discovery query relayed by a directory service.
    AskInfoViaMs = 20,
    /// The server is about to stream a gamestate.
    WillResendGamestate = 21,
    /// The client is ready for the gamestate stream.
    CanReceiveGamestate = 22,
    /// The client loaded the gamestate.
    ReceivedGamestate = 23,
    /// The receiving node is being removed.
    Kick = 24,
    /// A player left the session.
    PlayerDeparted = 25,
    /// Join challenge issued to a client.
    ServerChallenge = 26,
    /// Client publishes its public keys.
    ClientKey = 27,
    /// Client join request with challenge signatures.
    ClientJoin = 28,
    /// Round challenge sent to every client.
    ChallengeAll = 29,
    /// A client's signatures over the round challenge.
    ResponseAll = 30,
    /// Every player's round signatures.
    ResultsAll = 31,
    /// One fragment of a file.
    FileFragment = 32,
    /// Receiver's fragment acknowledgments.
    FileAck = 33,
    /// Receiver has the whole file.
    FileReceived = 34,
    /// Client asks for one page of the needed-file list.
    TellFilesNeeded = 35,
    /// One page of the needed-file list.
    MoreFilesNeeded = 36,
    /// Per-player measured lag.
    Ping = 37,
    /// Chat message.
    Say = 38,
    /// A node stopped answering. Only ever injected locally.
    NodeTimeout = 39,
}

impl PacketKind {
    /// First kind that may be refused under backlog.
    pub const CAN_FAIL: u8 = 32;

    /// Every kind, in tag order.
    pub const ALL: [PacketKind; 40] = [
        Self::Nothing,
        Self::ServerCfg,
        Self::ClientCmd,
        Self::ClientMis,
        Self::Client2Cmd,
        Self::Client2Mis,
        Self::Client3Cmd,
        Self::Client3Mis,
        Self::Client4Cmd,
        Self::Client4Mis,
        Self::NodeKeepAlive,
        Self::NodeKeepAliveMis,
        Self::ServerTics,
        Self::ServerRefuse,
        Self::ServerShutdown,
        Self::ClientQuit,
        Self::AskInfo,
        Self::ServerInfo,
        Self::PlayerInfo,
        Self::RequestFile,
        Self::AskInfoViaMs,
        Self::WillResendGamestate,
        Self::CanReceiveGamestate,
        Self::ReceivedGamestate,
        Self::Kick,
        Self::PlayerDeparted,
        Self::ServerChallenge,
        Self::ClientKey,
        Self::ClientJoin,
        Self::ChallengeAll,
        Self::ResponseAll,
        Self::ResultsAll,
        Self::FileFragment,
        Self::FileAck,
        Self::FileReceived,
        Self::TellFilesNeeded,
        Self::MoreFilesNeeded,
        Self::Ping,
        Self::Say,
        Self::NodeTimeout,
    ];

    /// The wire tag.
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Parses a wire tag.
    #[must_use]
    pub fn from_u8(tag: u8) -> Option<Self> {
        Self::ALL.get(tag as usize).copied()
    }

    /// Returns `true` for kinds that may be refused under backlog.
    #[inline]
    #[must_use]
    pub const fn can_fail(self) -> bool {
        self as u8 >= Self::CAN_FAIL
    }

    /// Number of 64-byte signatures carried in the header.
    #[must_use]
    pub const fn signature_count(self) -> usize {
        match self {
            Self::ClientCmd | Self::ClientMis | Self::Say => 1,
            Self::Client2Cmd | Self::Client2Mis => 2,
            Self::Client3Cmd | Self::Client3Mis => 3,
            Self::Client4Cmd | Self::Client4Mis => 4,
            _ => 0,
        }
    }

    /// Returns `true` for the client ticcmd bundle kinds, including keep-alives.
    #[must_use]
    pub const fn is_client_cmd(self) -> bool {
        matches!(
            self,
            Self::ClientCmd
                | Self::ClientMis
                | Self::Client2Cmd
                | Self::Client2Mis
                | Self::Client3Cmd
                | Self::Client3Mis
                | Self::Client4Cmd
                | Self::Client4Mis
                | Self::NodeKeepAlive
                | Self::NodeKeepAliveMis
        )
    }

    /// Returns `true` for the `…MIS` variants, sent while the client lacks tics.
    #[must_use]
    pub const fn is_missing_tics(self) -> bool {
        matches!(
            self,
            Self::ClientMis
                | Self::Client2Mis
                | Self::Client3Mis
                | Self::Client4Mis
                | Self::NodeKeepAliveMis
        )
    }

    /// The client command kind for `players` local players.
    #[must_use]
    pub const fn client_cmd_for(players: usize, missing_tics: bool) -> Option<Self> {
        Some(match (players, missing_tics) {
            (0, false) => Self::NodeKeepAlive,
            (0, true) => Self::NodeKeepAliveMis,
            (1, false) => Self::ClientCmd,
            (1, true) => Self::ClientMis,
            (2, false) => Self::Client2Cmd,
            (2, true) => Self::Client2Mis,
            (3, false) => Self::Client3Cmd,
            (3, true) => Self::Client3Mis,
            (4, false) => Self::Client4Cmd,
            (4, true) => Self::Client4Mis,
            _ => return None,
        })
    }

    /// Kinds accepted from an address that has no node yet.
    #[must_use]
    pub const fn allowed_from_unknown(self) -> bool {
        matches!(
            self,
            Self::AskInfo | Self::AskInfoViaMs | Self::ClientKey | Self::ServerInfo
        )
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
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
    fn tags_match_table_positions() {
        for (index, kind) in PacketKind::ALL.iter().enumerate() {
            assert_eq!(kind.as_u8() as usize, index);
            assert_eq!(PacketKind::from_u8(index as u8), Some(*kind));
        }
        assert_eq!(PacketKind::from_u8(40), None);
        assert_eq!(PacketKind::from_u8(255), None);
    }

    #[test]
    fn file_transfer_and_chat_can_fail() {
        assert!(PacketKind::FileFragment.can_fail());
        assert!(PacketKind::Say.can_fail());
        assert!(!PacketKind::ServerCfg.can_fail());
        assert!(!PacketKind::ResultsAll.can_fail());
    }

    #[test]
    fn bundles_carry_one_signature_per_player() {
        for players in 1..=4 {
            let kind = PacketKind::client_cmd_for(players, false).unwrap();
            assert_eq!(kind.signature_count(), players);
            let mis = PacketKind::client_cmd_for(players, true).unwrap();
            assert!(mis.is_missing_tics());
            assert_eq!(mis.signature_count(), players);
        }
        assert_eq!(PacketKind::NodeKeepAlive.signature_count(), 0);
        assert!(PacketKind::client_cmd_for(5, false).is_none());
    }
}

//! # kart-netsync
//!
//! Client-server lockstep netcode for a multiplayer kart racer. The server is
//! authoritative: clients send their per-tic input ([`Ticcmd`]) to the server,
//! the server assembles every player's input for a tic and broadcasts the
//! result, and every peer runs the same simulation tic with identical inputs.
//!
//! The library never calls into your game. Both
//! [`ServerSession`] and [`ClientSession`] return a list of [`TicRequest`]s
//! from [`try_run_tics`](ServerSession::try_run_tics) which the game fulfills
//! in order:
//!
//! ```ignore
//! loop {
//!     client.submit_local_ticcmd(0, read_input())?;
//!     client.net_update();
//!     for request in client.try_run_tics(client.current_tic() + 1)? {
//!         match request {
//!             TicRequest::SaveGamestate { cell, tic } => cell.save(tic, game.serialize(), None),
//!             TicRequest::LoadGamestate { cell, .. } => {
//!                 if let Some(bytes) = cell.load() {
//!                     game = Game::deserialize(&bytes);
//!                 }
//!             }
//!             TicRequest::AdvanceTic { tic, inputs } => {
//!                 game.step(&inputs);
//!                 client.record_consistency(tic, game.consistency());
//!             }
//!             _ => {}
//!         }
//!     }
//!     for event in client.events() { /* log, update UI */ }
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
use std::fmt::Debug;
use std::hash::Hash;
use std::net::{Ipv4Addr, SocketAddr};

pub use directory::{Directory, NodeHandle, NodeStatus, PlayerBinding};
pub use error::NetsyncError;
pub use files::manifest::{ContentManifest, FileEntry};
pub use files::store::{ContentStore, DirectoryContentStore, MemoryContentStore};
pub use gamestate_cell::GamestateCell;
pub use network::chaos_socket::{ChaosConfig, ChaosConfigBuilder, ChaosStats, ChaosTransport};
pub use network::network_stats::NetworkStats;
pub use network::udp_socket::UdpTransport;
pub use sessions::builder::SessionBuilder;
pub use sessions::client_session::ClientSession;
pub use sessions::config::{
    BuildInfo, FileTransferConfig, ReliabilityConfig, ServerSettings, TicSyncConfig, TrustConfig,
};
pub use sessions::event_drain::EventDrain;
pub use sessions::join_state::{GoneReason, JoinState};
pub use sessions::server_session::ServerSession;
pub use ticcmd::Ticcmd;
pub use trust::{LocalIdentity, ShouldSign};

#[doc(hidden)]
pub mod directory;
#[doc(hidden)]
pub mod error;
pub mod files;
#[doc(hidden)]
pub mod gamestate_cell;
pub mod hash;
pub mod telemetry;
#[doc(hidden)]
pub mod test_config;
#[doc(hidden)]
pub mod tic_buffer;
#[doc(hidden)]
pub mod ticcmd;
pub mod trust;
#[doc(hidden)]
pub mod sessions {
    #[doc(hidden)]
    pub mod builder;
    #[doc(hidden)]
    pub mod client_session;
    #[doc(hidden)]
    pub mod config;
    #[doc(hidden)]
    pub mod event_drain;
    #[doc(hidden)]
    pub mod join_state;
    #[doc(hidden)]
    pub mod server_session;
}
#[doc(hidden)]
pub mod network {
    pub mod chaos_socket;
    /// Wire codec: packet header, checksum and per-kind payload layout.
    ///
    /// This is the only module that reasons about byte layout. Everything
    /// else works with decoded [`Packet`](messages::Packet) values.
    pub mod codec;
    #[doc(hidden)]
    pub mod endpoint;
    #[doc(hidden)]
    pub mod messages;
    #[doc(hidden)]
    pub mod network_stats;
    pub mod packet_kind;
    #[doc(hidden)]
    pub mod reliability;
    #[cfg(feature = "tokio")]
    pub mod tokio_socket;
    #[doc(hidden)]
    pub mod udp_socket;
}

/// Internal module exposing implementation details for testing and benchmarks.
///
/// **This module is NOT part of the public API.** Nothing here is covered by
/// semver guarantees.
#[doc(hidden)]
pub mod __internal {
    pub use crate::files::receiver::{segments_to_byte_ranges, FileReceiver, FragmentOutcome};
    pub use crate::files::sender::FileSender;
    pub use crate::network::codec::{checksum, decode, encode, header_len, min_payload_len};
    pub use crate::network::endpoint::{Endpoint, Incoming, Source};
    pub use crate::network::messages::*;
    pub use crate::network::packet_kind::PacketKind;
    pub use crate::network::reliability::{ack_distance, next_ack, ReliableChannel};
    pub use crate::tic_buffer::{expand_tic, StoreOutcome, TicBuffer};
    pub use crate::trust::{build_challenge, is_external_ip, should_sign_challenge, sign, verify};
}

// #############
// # CONSTANTS #
// #############

/// Simulation tics per second.
pub const TICRATE: u32 = 35;

/// Depth of every ticcmd ring buffer, in tics.
pub const BACKUPTICS: usize = 512;

/// Maximum number of player slots in a session.
pub const MAXPLAYERS: usize = 16;

/// Maximum number of local (splitscreen) players on one node.
pub const MAXSPLITSCREENPLAYERS: usize = 4;

/// Number of addressable transport nodes. Node ids are `0..MAXNETNODES`.
pub const MAXNETNODES: usize = 127;

/// Maximum number of tics a missing player command is extrapolated before
/// the player is considered stalled.
pub const MAXGENTLEMENDELAY: u32 = TICRATE;

/// Upper bound for the latency value carried in a [`Ticcmd`], in tics.
pub const MAX_PREDICT_TICS: u8 = 12;

/// Largest datagram the codec will produce or accept.
pub const MAX_PACKET_LENGTH: usize = 1450;

/// Maximum length of a player name in bytes.
pub const MAXPLAYERNAME: usize = 21;

/// Maximum length of a chat message in bytes.
pub const MAX_CHAT_LENGTH: usize = 223;

// #############
// #   TYPES   #
// #############

/// A tic is one atomic step of the deterministic simulation.
///
/// Tics start at 0 and only ever move forward. On the wire only the low byte
/// of a tic is transmitted; [`expand_tic`](tic_buffer::expand_tic) restores
/// the full value against a nearby reference tic.
///
/// # Examples
///
/// ```
/// use kart_netsync::Tic;
///
/// let tic = Tic::new(300);
/// assert_eq!(tic.low_byte(), 44);
/// assert_eq!((tic + 5).as_u32(), 305);
/// assert_eq!(Tic::new(310) - tic, 10);
/// ```
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Tic(u32);

impl Tic {
    /// The first tic of a session.
    pub const ZERO: Tic = Tic(0);

    /// Creates a new `Tic`.
    #[inline]
    #[must_use]
    pub const fn new(tic: u32) -> Self {
        Tic(tic)
    }

    /// Returns the underlying value.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// The reduced-width form sent on the wire.
    #[inline]
    #[must_use]
    pub const fn low_byte(self) -> u8 {
        (self.0 & 0xFF) as u8
    }

    /// Index of this tic in a [`BACKUPTICS`]-deep ring.
    #[inline]
    #[must_use]
    pub const fn ring_index(self) -> usize {
        self.0 as usize % BACKUPTICS
    }

    /// Subtracts `rhs` tics, stopping at tic 0.
    #[inline]
    #[must_use]
    pub const fn saturating_sub(self, rhs: u32) -> Tic {
        Tic(self.0.saturating_sub(rhs))
    }
}

impl std::fmt::Display for Tic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::ops::Add<u32> for Tic {
    type Output = Tic;

    #[inline]
    fn add(self, rhs: u32) -> Self::Output {
        Tic(self.0.wrapping_add(rhs))
    }
}

impl std::ops::AddAssign<u32> for Tic {
    #[inline]
    fn add_assign(&mut self, rhs: u32) {
        self.0 = self.0.wrapping_add(rhs);
    }
}

impl std::ops::Sub<Tic> for Tic {
    type Output = i64;

    #[inline]
    fn sub(self, rhs: Tic) -> Self::Output {
        i64::from(self.0) - i64::from(rhs.0)
    }
}

impl From<u32> for Tic {
    #[inline]
    fn from(value: u32) -> Self {
        Tic(value)
    }
}

/// A transport-level peer, identified by a small integer in `[0, MAXNETNODES)`.
///
/// Node 0 is always the local node. [`NodeId::BROADCAST`] addresses every
/// joined node at once and is never assigned to a peer.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct NodeId(u8);

impl NodeId {
    /// The local node.
    pub const SELF: NodeId = NodeId(0);
    /// Reserved broadcast value.
    pub const BROADCAST: NodeId = NodeId(MAXNETNODES as u8);

    /// Creates a new `NodeId`. Returns `None` outside `[0, MAXNETNODES]`.
    #[inline]
    #[must_use]
    pub const fn new(id: u8) -> Option<Self> {
        if (id as usize) <= MAXNETNODES {
            Some(NodeId(id))
        } else {
            None
        }
    }

    /// Returns the underlying value.
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self.0
    }

    /// Returns the id as an index.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node{}", self.0)
    }
}

/// A logical competitor index in `[0, MAXPLAYERS)`.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct PlayerSlot(u8);

impl PlayerSlot {
    /// Creates a new `PlayerSlot`. Returns `None` outside `[0, MAXPLAYERS)`.
    #[inline]
    #[must_use]
    pub const fn new(slot: u8) -> Option<Self> {
        if (slot as usize) < MAXPLAYERS {
            Some(PlayerSlot(slot))
        } else {
            None
        }
    }

    /// Returns the underlying value.
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self.0
    }

    /// Returns the slot as an index.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Bit of this slot in an in-game mask.
    #[inline]
    #[must_use]
    pub const fn mask_bit(self) -> u16 {
        1 << self.0
    }

    /// Iterates over every possible slot.
    pub fn all() -> impl Iterator<Item = PlayerSlot> {
        (0..MAXPLAYERS as u8).map(PlayerSlot)
    }

    /// Iterates over the slots set in `mask`, lowest first.
    pub fn in_mask(mask: u16) -> impl Iterator<Item = PlayerSlot> {
        Self::all().filter(move |slot| mask & slot.mask_bit() != 0)
    }
}

impl std::fmt::Display for PlayerSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stack-allocated list of per-player inputs for one tic.
pub type InputVec = smallvec::SmallVec<[(PlayerSlot, Ticcmd); 4]>;

// #############
// #   ENUMS   #
// #############

/// Why a player left the session.
///
/// Every reason is distinct on the wire and in logs so that operators can
/// tell network trouble from tampering.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum KickReason {
    /// The player left on their own.
    Quit,
    /// Kicked without a reason.
    Kicked,
    /// Kicked with an operator-provided reason.
    KickedWithReason,
    /// Removed by a player vote.
    VoteKicked,
    /// Banned without a reason.
    Banned,
    /// Banned with an operator-provided reason.
    BannedWithReason,
    /// The connection timed out or the player stalled for too long.
    Timeout,
    /// Latency stayed above the configured limit.
    PingTooHigh,
    /// Removed by anti-griefing rules.
    AntiGrief,
    /// The node desynchronized and could not be resynchronized.
    ResyncFailure,
    /// A signature or challenge response was missing or invalid.
    SignatureFailure,
}

impl KickReason {
    /// Human-readable description shown to the departing player.
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::Quit => "left the game",
            Self::Kicked => "kicked",
            Self::KickedWithReason => "kicked (with reason)",
            Self::VoteKicked => "vote-kicked",
            Self::Banned => "banned",
            Self::BannedWithReason => "banned (with reason)",
            Self::Timeout => "connection timed out",
            Self::PingTooHigh => "ping too high",
            Self::AntiGrief => "kicked for griefing",
            Self::ResyncFailure => "could not resynchronize",
            Self::SignatureFailure => "failed signature verification",
        }
    }
}

impl std::fmt::Display for KickReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description())
    }
}

impl From<KickReason> for u8 {
    fn from(reason: KickReason) -> Self {
        match reason {
            KickReason::Quit => 0,
            KickReason::Kicked => 1,
            KickReason::KickedWithReason => 2,
            KickReason::VoteKicked => 3,
            KickReason::Banned => 4,
            KickReason::BannedWithReason => 5,
            KickReason::Timeout => 6,
            KickReason::PingTooHigh => 7,
            KickReason::AntiGrief => 8,
            KickReason::ResyncFailure => 9,
            KickReason::SignatureFailure => 10,
        }
    }
}

impl TryFrom<u8> for KickReason {
    type Error = UnknownCode;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Ok(match code {
            0 => Self::Quit,
            1 => Self::Kicked,
            2 => Self::KickedWithReason,
            3 => Self::VoteKicked,
            4 => Self::Banned,
            5 => Self::BannedWithReason,
            6 => Self::Timeout,
            7 => Self::PingTooHigh,
            8 => Self::AntiGrief,
            9 => Self::ResyncFailure,
            10 => Self::SignatureFailure,
            other => return Err(UnknownCode(other)),
        })
    }
}

/// Why a join attempt was refused.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum RefusalReason {
    /// No free player slot or node.
    Full,
    /// The server does not accept new players.
    JoinsDisabled,
    /// The client runs a different version.
    VersionMismatch,
    /// The client's content differs and cannot be repaired by file transfer.
    ContentMismatch,
    /// A join signature did not verify.
    BadSignature,
    /// The join challenge expired before the client answered.
    ChallengeExpired,
    /// The client asked for zero or more than [`MAXSPLITSCREENPLAYERS`] local players.
    BadPlayerCount,
}

impl std::fmt::Display for RefusalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Full => "server is full",
            Self::JoinsDisabled => "server is not accepting players",
            Self::VersionMismatch => "version mismatch",
            Self::ContentMismatch => "content mismatch",
            Self::BadSignature => "bad join signature",
            Self::ChallengeExpired => "join challenge expired",
            Self::BadPlayerCount => "invalid local player count",
        };
        f.write_str(text)
    }
}

impl From<RefusalReason> for u8 {
    fn from(reason: RefusalReason) -> Self {
        match reason {
            RefusalReason::Full => 0,
            RefusalReason::JoinsDisabled => 1,
            RefusalReason::VersionMismatch => 2,
            RefusalReason::ContentMismatch => 3,
            RefusalReason::BadSignature => 4,
            RefusalReason::ChallengeExpired => 5,
            RefusalReason::BadPlayerCount => 6,
        }
    }
}

impl TryFrom<u8> for RefusalReason {
    type Error = UnknownCode;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Ok(match code {
            0 => Self::Full,
            1 => Self::JoinsDisabled,
            2 => Self::VersionMismatch,
            3 => Self::ContentMismatch,
            4 => Self::BadSignature,
            5 => Self::ChallengeExpired,
            6 => Self::BadPlayerCount,
            other => return Err(UnknownCode(other)),
        })
    }
}

/// A wire enum carried a code this version does not know.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct UnknownCode(pub u8);

impl std::fmt::Display for UnknownCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown code {}", self.0)
    }
}

impl std::error::Error for UnknownCode {}

/// Requests that you receive from a session. Handling them is mandatory and
/// they MUST be fulfilled in the order they are returned.
///
/// ```text
/// ┌──────────────────────────────────────────────────────────────┐
/// │ SaveGamestate ─► serialize the state reached after `tic`     │
/// │ LoadGamestate ─► replace the local state (join or resync)    │
/// │ AdvanceTic    ─► run exactly one tic with the given inputs   │
/// └──────────────────────────────────────────────────────────────┘
/// ```
#[non_exhaustive]
#[derive(Debug)]
pub enum TicRequest {
    /// Serialize the current gamestate into `cell`. The state must be the one
    /// reached after running every tic before `tic`.
    SaveGamestate {
        /// Use `cell.save(...)` to store your serialized state.
        cell: GamestateCell,
        /// Sanity check: the saved state is the one about to run `tic`.
        tic: Tic,
    },
    /// Replace the local gamestate with the one in `cell`. The next
    /// [`TicRequest::AdvanceTic`] will be for `tic`.
    LoadGamestate {
        /// Use `cell.load()` to read the serialized state.
        cell: GamestateCell,
        /// The tic the loaded state is about to run.
        tic: Tic,
    },
    /// Advance the simulation by one tic.
    AdvanceTic {
        /// The tic being run.
        tic: Tic,
        /// Input for every in-game player, in player-slot order.
        inputs: InputVec,
    },
}

impl TicRequest {
    /// Returns `true` for [`TicRequest::AdvanceTic`].
    #[must_use]
    pub const fn is_advance(&self) -> bool {
        matches!(self, Self::AdvanceTic { .. })
    }
}

/// Notifications that you can receive from a session. Handling them is up to you.
///
/// This enum is marked `#[non_exhaustive]`; always include a wildcard arm.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SessionEvent {
    /// The client's join state changed.
    JoinStateChanged {
        /// The new state.
        state: JoinState,
    },
    /// A `SERVERINFO` reply arrived.
    ServerInfoReceived {
        /// The advertised server snapshot.
        info: network::messages::ServerInfo,
    },
    /// The local client finished joining and owns these slots.
    Joined {
        /// Slots assigned to the local players, in splitscreen order.
        slots: Vec<PlayerSlot>,
    },
    /// A node finished joining (server only).
    NodeJoined {
        /// The node that joined.
        node: NodeId,
        /// Slots owned by that node.
        slots: Vec<PlayerSlot>,
    },
    /// A player appeared in the roster.
    PlayerJoined {
        /// The player's slot.
        slot: PlayerSlot,
        /// The player's name.
        name: String,
    },
    /// A player left the session.
    PlayerDeparted {
        /// The player's slot.
        slot: PlayerSlot,
        /// Why the player left.
        reason: KickReason,
    },
    /// A player's input was missing for longer than [`MAXGENTLEMENDELAY`] tics
    /// and a neutral command was substituted.
    PlayerStalled {
        /// The stalled player.
        slot: PlayerSlot,
        /// The tic at which the neutral command was substituted.
        tic: Tic,
    },
    /// A node left or was removed (server only).
    NodeDisconnected {
        /// The node.
        node: NodeId,
        /// Why it left.
        reason: KickReason,
    },
    /// The local session is no longer connected.
    Disconnected {
        /// Why the session ended.
        reason: GoneReason,
        /// Human-readable message from the server, if any.
        message: String,
    },
    /// A client reported a consistency value different from the server's
    /// (server only). A resync follows.
    DesyncDetected {
        /// The reporting node.
        node: NodeId,
        /// The tic the values belong to.
        tic: Tic,
        /// The server's value.
        local: u16,
        /// The client's value.
        remote: u16,
    },
    /// A gamestate resend to a node started (server only).
    ResyncStarted {
        /// The node being resynchronized.
        node: NodeId,
        /// The tic of the snapshot.
        tic: Tic,
    },
    /// A chat message arrived.
    ChatReceived {
        /// The sending player.
        slot: PlayerSlot,
        /// The message.
        text: String,
        /// Whether the signature verified against the sender's roster key.
        verified: bool,
    },
    /// The per-round challenge results were verified (client only).
    ChallengeResultsVerified {
        /// Number of player signatures checked.
        players: usize,
    },
    /// A missing content file finished downloading (client only).
    FileDownloaded {
        /// Name of the file.
        name: String,
    },
}

// #############
// #  TRAITS   #
// #############

/// Address type used to identify peers.
///
/// Implemented for [`SocketAddr`]. Custom transports may use any ordered,
/// hashable address type that can report an IPv4 address for challenge
/// binding and can be parsed from the text form relayed by a directory
/// service in `ASKINFOVIAMS`.
#[cfg(feature = "sync-send")]
pub trait PeerAddress:
    Clone + PartialEq + Eq + PartialOrd + Ord + Hash + Debug + Send + Sync + 'static
{
    /// The IPv4 address of this peer, if it has one.
    fn ipv4(&self) -> Option<Ipv4Addr>;

    /// Parses an address relayed as text by a directory service.
    fn parse_relayed(text: &str) -> Option<Self>;
}

/// Address type used to identify peers.
///
/// Implemented for [`SocketAddr`]. Custom transports may use any ordered,
/// hashable address type that can report an IPv4 address for challenge
/// binding and can be parsed from the text form relayed by a directory
/// service in `ASKINFOVIAMS`.
#[cfg(not(feature = "sync-send"))]
pub trait PeerAddress: Clone + PartialEq + Eq + PartialOrd + Ord + Hash + Debug + 'static {
    /// The IPv4 address of this peer, if it has one.
    fn ipv4(&self) -> Option<Ipv4Addr>;

    /// Parses an address relayed as text by a directory service.
    fn parse_relayed(text: &str) -> Option<Self>;
}

impl PeerAddress for SocketAddr {
    fn ipv4(&self) -> Option<Ipv4Addr> {
        match self {
            SocketAddr::V4(v4) => Some(*v4.ip()),
            SocketAddr::V6(v6) => v6.ip().to_ipv4_mapped(),
        }
    }

    fn parse_relayed(text: &str) -> Option<Self> {
        text.trim().parse().ok()
    }
}

/// This [`Transport`] trait is used when you want to use kart-netsync with your own socket.
/// Datagrams should be delivered in a UDP-like fashion, unordered and unreliable; the
/// library runs its own reliability layer on top.
#[cfg(feature = "sync-send")]
pub trait Transport<A>: Send + Sync
where
    A: PeerAddress,
{
    /// Sends one encoded datagram to the given address.
    fn send_to(&mut self, datagram: &[u8], addr: &A);

    /// Returns every datagram received since the last call, with its sender.
    fn receive_all_datagrams(&mut self) -> Vec<(A, Vec<u8>)>;
}

/// This [`Transport`] trait is used when you want to use kart-netsync with your own socket.
/// Datagrams should be delivered in a UDP-like fashion, unordered and unreliable; the
/// library runs its own reliability layer on top.
#[cfg(not(feature = "sync-send"))]
pub trait Transport<A>
where
    A: PeerAddress,
{
    /// Sends one encoded datagram to the given address.
    fn send_to(&mut self, datagram: &[u8], addr: &A);

    /// Returns every datagram received since the last call, with its sender.
    fn receive_all_datagrams(&mut self) -> Vec<(A, Vec<u8>)>;
}

// ###################
// # UNIT TESTS      #
// ###################

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
    fn tic_low_byte_and_ring_index() {
        let tic = Tic::new(BACKUPTICS as u32 + 3);
        assert_eq!(tic.ring_index(), 3);
        assert_eq!(Tic::new(0x1FF).low_byte(), 0xFF);
    }

    #[test]
    fn tic_difference_is_signed() {
        assert_eq!(Tic::new(5) - Tic::new(9), -4);
        assert_eq!(Tic::new(9) - Tic::new(5), 4);
    }

    #[test]
    fn node_id_bounds() {
        assert!(NodeId::new(126).is_some());
        assert_eq!(NodeId::new(127), Some(NodeId::BROADCAST));
        assert!(NodeId::new(128).is_none());
    }

    #[test]
    fn player_slot_mask_iteration() {
        let slots: Vec<u8> = PlayerSlot::in_mask(0b1000_0000_0000_0101)
            .map(PlayerSlot::as_u8)
            .collect();
        assert_eq!(slots, vec![0, 2, 15]);
        assert!(PlayerSlot::new(16).is_none());
    }

    #[test]
    fn kick_reason_codes_roundtrip() {
        for code in 0..=10u8 {
            let reason = KickReason::try_from(code).unwrap();
            assert_eq!(u8::from(reason), code);
        }
        assert_eq!(KickReason::try_from(11), Err(UnknownCode(11)));
    }

    #[test]
    fn kick_reasons_are_distinguishable() {
        let reasons: Vec<KickReason> = (0..=10u8).map(|code| KickReason::try_from(code).unwrap()).collect();
        for (i, a) in reasons.iter().enumerate() {
            for b in &reasons[i + 1..] {
                assert_ne!(a.to_string(), b.to_string(), "{:?} and {:?} display the same", a, b);
            }
        }
        assert_eq!(KickReason::KickedWithReason.to_string(), "kicked (with reason)");
    }

    #[test]
    fn refusal_reason_codes_roundtrip() {
        for code in 0..=6u8 {
            let reason = RefusalReason::try_from(code).unwrap();
            assert_eq!(u8::from(reason), code);
        }
        assert!(RefusalReason::try_from(200).is_err());
    }

    #[test]
    fn socket_addr_relayed_parsing() {
        let addr = SocketAddr::parse_relayed(" 10.0.0.7:5029 ").unwrap();
        assert_eq!(addr.ipv4(), Some(Ipv4Addr::new(10, 0, 0, 7)));
        assert!(SocketAddr::parse_relayed("not an address").is_none());
    }
}

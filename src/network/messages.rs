use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::files::manifest::FileEntry;
use crate::network::codec::CodecError;
use crate::network::packet_kind::PacketKind;
use crate::ticcmd::Ticcmd;
use crate::{KickReason, RefusalReason, MAXPLAYERNAME, MAXPLAYERS, MAXSPLITSCREENPLAYERS, MAX_CHAT_LENGTH};

/// Maximum number of manifest entries in one `MOREFILESNEEDED` or `SERVERINFO` page.
pub const MAX_FILES_PER_PACKET: usize = 32;
/// Maximum number of tics in one `SERVERTICS` packet.
pub const MAX_TICS_PER_PACKET: usize = 48;
/// Maximum number of segments in one `FILEACK`.
pub const MAX_ACK_SEGMENTS: usize = 64;
/// Maximum length of a content file name.
pub const MAX_FILENAME_LENGTH: usize = 64;
/// Maximum length of the server name.
pub const MAX_SERVER_NAME: usize = 32;
/// Maximum length of the application id and of the commit string.
pub const MAX_BUILD_STRING: usize = 40;
/// Maximum length of a kick or refusal message.
pub const MAX_REASON_LENGTH: usize = 128;
/// Maximum length of a relayed address.
pub const MAX_RELAY_ADDRESS: usize = 64;
/// Largest file fragment payload.
pub const MAX_FRAGMENT_SIZE: usize = 1280;

/// Serde support for byte arrays longer than serde's built-in tuple impls.
///
/// The array is written as a fixed-length tuple, so no length prefix reaches
/// the wire.
mod byte_array {
    use serde::de::{Error, SeqAccess, Visitor};
    use serde::ser::SerializeTuple;
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer, const N: usize>(
        bytes: &[u8; N],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(N)?;
        for byte in bytes {
            tuple.serialize_element(byte)?;
        }
        tuple.end()
    }

    struct ArrayVisitor<const N: usize>;

    impl<'de, const N: usize> Visitor<'de> for ArrayVisitor<N> {
        type Value = [u8; N];

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{} bytes", N)
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
            let mut bytes = [0u8; N];
            for (index, byte) in bytes.iter_mut().enumerate() {
                *byte = seq
                    .next_element()?
                    .ok_or_else(|| A::Error::invalid_length(index, &self))?;
            }
            Ok(bytes)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        deserializer: D,
    ) -> Result<[u8; N], D::Error> {
        deserializer.deserialize_tuple(N, ArrayVisitor::<N>)
    }
}

struct BytesDebug<'a>(&'a [u8]);

impl std::fmt::Debug for BytesDebug<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("0x")?;
        for byte in self.0.iter().take(8) {
            write!(f, "{:02x}", byte)?;
        }
        if self.0.len() > 8 {
            write!(f, "..({} bytes)", self.0.len())?;
        }
        Ok(())
    }
}

/// An ed25519 public key.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PublicKeyBytes(#[serde(with = "byte_array")] pub [u8; 32]);

/// An ed25519 signature.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignatureBytes(#[serde(with = "byte_array")] pub [u8; 64]);

impl SignatureBytes {
    /// The all-zero placeholder carried by unsigned packets.
    pub const ZERO: SignatureBytes = SignatureBytes([0; 64]);
}

impl Default for SignatureBytes {
    fn default() -> Self {
        Self::ZERO
    }
}

/// A 64-byte challenge: time, bound IPv4 address, random filler.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Challenge(#[serde(with = "byte_array")] pub [u8; 64]);

impl std::fmt::Debug for PublicKeyBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PublicKeyBytes").field(&BytesDebug(&self.0)).finish()
    }
}

impl std::fmt::Debug for SignatureBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SignatureBytes").field(&BytesDebug(&self.0)).finish()
    }
}

impl std::fmt::Debug for Challenge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Challenge").field(&BytesDebug(&self.0)).finish()
    }
}

/// Consistency value a client reports for one tic it has run.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    /// Low byte of the tic.
    pub tic: u8,
    /// The simulation's value for that tic.
    pub value: u16,
}

/// Fields shared by every client command bundle and keep-alive.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CmdPrefix {
    /// Low byte of the tic the bundled commands are for.
    pub client_tic: u8,
    /// Low byte of the first tic the client is missing.
    pub resend_from: u8,
    /// Consistency for the last tic the client ran, if the game reports one.
    pub consistency: Option<ConsistencyReport>,
}

/// `CLIENTCMD` / `CLIENTMIS` payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCmdBody {
    pub prefix: CmdPrefix,
    pub cmd: Ticcmd,
}

/// `CLIENT2CMD` / `CLIENT2MIS` payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client2CmdBody {
    pub prefix: CmdPrefix,
    pub cmds: [Ticcmd; 2],
}

/// `CLIENT3CMD` / `CLIENT3MIS` payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client3CmdBody {
    pub prefix: CmdPrefix,
    pub cmds: [Ticcmd; 3],
}

/// `CLIENT4CMD` / `CLIENT4MIS` payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client4CmdBody {
    pub prefix: CmdPrefix,
    pub cmds: [Ticcmd; 4],
}

/// One complete tic inside `SERVERTICS`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicFrame {
    /// In-game player mask.
    pub ingame: u16,
    /// One command per set bit of `ingame`, lowest slot first.
    pub cmds: Vec<Ticcmd>,
}

/// `SERVERTICS` payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerTicsBody {
    /// Low byte of the first tic in `tics`.
    pub start_tic: u8,
    /// Consecutive complete tics.
    pub tics: Vec<TicFrame>,
}

/// Join eligibility advertised in `SERVERINFO`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinEligibility {
    /// The server accepts new players.
    Joinable,
    /// The server does not accept new players.
    JoinsDisabled,
    /// Every slot is taken.
    Full,
}

/// `ASKINFO` payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AskInfoBody {
    /// Asker's protocol version.
    pub version: u8,
    /// Echoed back in `SERVERINFO` so the asker can compute a ping.
    pub echo_time: u64,
}

/// `ASKINFOVIAMS` payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AskInfoViaMsBody {
    /// Text form of the original asker's address.
    pub relay_addr: String,
    /// Echoed back in `SERVERINFO`.
    pub echo_time: u64,
}

/// `SERVERINFO` payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Protocol version.
    pub version: u8,
    /// Protocol subversion.
    pub subversion: u8,
    /// Application id.
    pub application: String,
    /// Number of players in game.
    pub player_count: u8,
    /// Player limit.
    pub max_players: u8,
    /// Whether a join attempt would be accepted.
    pub eligibility: JoinEligibility,
    /// Checksum of the server's content manifest.
    pub content_checksum: u64,
    /// Human-readable server name.
    pub server_name: String,
    /// The asker's echo time.
    pub echo_time: u64,
    /// Total number of manifest entries.
    pub file_count: u16,
    /// The first page of the manifest.
    pub files: Vec<FileEntry>,
    /// Whether more manifest pages follow.
    pub more_files: bool,
}

/// One player in the roster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    /// Player slot.
    pub slot: u8,
    /// Owning node, as numbered by the server.
    pub node: u8,
    /// Splitscreen index on the owning node.
    pub split: u8,
    /// Player name.
    pub name: String,
    /// Player's public key.
    pub key: PublicKeyBytes,
    /// First tic the player is in game.
    pub join_tic: u32,
}

/// `SERVERCFG` payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerCfgBody {
    pub version: u8,
    pub subversion: u8,
    pub commit: String,
    /// Number of players on the server's own node.
    pub server_players: u8,
    pub game_state: u8,
    pub game_mode: u8,
    pub modified: bool,
    pub max_players: u8,
    pub allow_joins: bool,
    pub content_checksum: u64,
    pub server_name: String,
    /// The node id the server assigned to the receiving client.
    pub your_node: u8,
    /// The slots assigned to the client's local players, in splitscreen order.
    pub your_slots: Vec<u8>,
    /// Every player already in game.
    pub roster: Vec<RosterEntry>,
}

/// `SERVERREFUSE` payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRefuseBody {
    pub reason: RefusalReason,
    pub message: String,
}

/// `KICK` payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KickBody {
    pub reason: KickReason,
    pub message: String,
}

/// `PLAYERDEPARTED` payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerDepartedBody {
    pub slot: u8,
    pub reason: KickReason,
}

/// `PLAYERINFO` payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerInfoBody {
    pub entries: Vec<RosterEntry>,
}

/// `CLIENTKEY` payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientKeyBody {
    /// One key per local player.
    pub keys: Vec<PublicKeyBytes>,
}

/// `SERVERCHALLENGE`, `CHALLENGEALL` payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeBody {
    pub challenge: Challenge,
}

/// `CLIENTJOIN` payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientJoinBody {
    pub version: u8,
    pub subversion: u8,
    pub application: String,
    pub content_checksum: u64,
    /// One name per local player.
    pub names: Vec<String>,
    /// One signature over the join challenge per local player.
    pub signatures: Vec<SignatureBytes>,
}

/// `RESPONSEALL` payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseAllBody {
    /// One signature per local player, in splitscreen order.
    pub signatures: Vec<SignatureBytes>,
}

/// One player's round signature inside `RESULTSALL`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundResult {
    pub slot: u8,
    pub signature: SignatureBytes,
}

/// `RESULTSALL` payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultsAllBody {
    pub entries: Vec<RoundResult>,
}

/// `WILLRESENDGAMESTATE` payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WillResendGamestateBody {
    /// The tic the snapshot is about to run.
    pub tic: u32,
    /// Transfer iteration of the gamestate stream.
    pub iteration: u8,
    /// Size of the snapshot in bytes.
    pub size: u32,
}

/// `FILEFRAGMENT` payload.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFragmentBody {
    pub file_id: u8,
    pub iteration: u8,
    /// Byte offset of `data` in the file.
    pub position: u32,
    pub file_size: u32,
    /// Size of every fragment but the last; fragment `i` starts at `i * fragment_size`.
    pub fragment_size: u16,
    pub data: Vec<u8>,
}

impl std::fmt::Debug for FileFragmentBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Self {
            file_id,
            iteration,
            position,
            file_size,
            fragment_size,
            data,
        } = self;
        f.debug_struct("FileFragmentBody")
            .field("file_id", file_id)
            .field("iteration", iteration)
            .field("position", position)
            .field("file_size", file_size)
            .field("fragment_size", fragment_size)
            .field("data", &BytesDebug(data))
            .finish()
    }
}

/// 32 consecutive fragments starting at `start`; bit `i` of `mask` is fragment `start + i`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckSegment {
    pub start: u32,
    pub mask: u32,
}

/// `FILEACK` payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAckBody {
    pub file_id: u8,
    pub iteration: u8,
    pub segments: Vec<AckSegment>,
}

/// `FILERECEIVED` payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReceivedBody {
    pub file_id: u8,
    pub iteration: u8,
}

/// `TELLFILESNEEDED` payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TellFilesNeededBody {
    /// Index of the first manifest entry wanted.
    pub first: u16,
}

/// `MOREFILESNEEDED` payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoreFilesNeededBody {
    pub first: u16,
    pub more: bool,
    pub files: Vec<FileEntry>,
}

/// `REQUESTFILE` payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFileBody {
    /// Manifest indices of the wanted files.
    pub files: Vec<u8>,
}

/// `PING` payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingBody {
    /// Measured lag in tics, per player slot.
    pub lag: [u8; MAXPLAYERS],
}

/// `SAY` payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SayBody {
    /// Sending player slot.
    pub source: u8,
    pub flags: u8,
    pub text: String,
}

/// A decoded payload. The variant always agrees with the packet kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PacketBody {
    Nothing,
    ServerCfg(Box<ServerCfgBody>),
    ClientCmd(ClientCmdBody),
    ClientMis(ClientCmdBody),
    Client2Cmd(Client2CmdBody),
    Client2Mis(Client2CmdBody),
    Client3Cmd(Client3CmdBody),
    Client3Mis(Client3CmdBody),
    Client4Cmd(Client4CmdBody),
    Client4Mis(Client4CmdBody),
    NodeKeepAlive(CmdPrefix),
    NodeKeepAliveMis(CmdPrefix),
    ServerTics(ServerTicsBody),
    ServerRefuse(ServerRefuseBody),
    ServerShutdown,
    ClientQuit,
    AskInfo(AskInfoBody),
    ServerInfo(Box<ServerInfo>),
    PlayerInfo(PlayerInfoBody),
    RequestFile(RequestFileBody),
    AskInfoViaMs(AskInfoViaMsBody),
    WillResendGamestate(WillResendGamestateBody),
    CanReceiveGamestate,
    ReceivedGamestate,
    Kick(KickBody),
    PlayerDeparted(PlayerDepartedBody),
    ServerChallenge(ChallengeBody),
    ClientKey(ClientKeyBody),
    ClientJoin(ClientJoinBody),
    ChallengeAll(ChallengeBody),
    ResponseAll(ResponseAllBody),
    ResultsAll(ResultsAllBody),
    FileFragment(FileFragmentBody),
    FileAck(FileAckBody),
    FileReceived(FileReceivedBody),
    TellFilesNeeded(TellFilesNeededBody),
    MoreFilesNeeded(MoreFilesNeededBody),
    Ping(PingBody),
    Say(SayBody),
    NodeTimeout,
}

fn check_len(field: &'static str, len: usize, max: usize) -> Result<(), CodecError> {
    if len > max {
        return Err(CodecError::FieldTooLarge { field, len, max });
    }
    Ok(())
}

fn check_files(files: &[FileEntry]) -> Result<(), CodecError> {
    check_len("files", files.len(), MAX_FILES_PER_PACKET)?;
    for file in files {
        check_len("file name", file.name.len(), MAX_FILENAME_LENGTH)?;
    }
    Ok(())
}

fn check_roster(entries: &[RosterEntry]) -> Result<(), CodecError> {
    check_len("roster", entries.len(), MAXPLAYERS)?;
    for entry in entries {
        check_len("player name", entry.name.len(), MAXPLAYERNAME)?;
    }
    Ok(())
}

impl PacketBody {
    /// The kind tag selecting this payload's layout.
    #[must_use]
    pub const fn kind(&self) -> PacketKind {
        match self {
            Self::Nothing => PacketKind::Nothing,
            Self::ServerCfg(_) => PacketKind::ServerCfg,
            Self::ClientCmd(_) => PacketKind::ClientCmd,
            Self::ClientMis(_) => PacketKind::ClientMis,
            Self::Client2Cmd(_) => PacketKind::Client2Cmd,
            Self::Client2Mis(_) => PacketKind::Client2Mis,
            Self::Client3Cmd(_) => PacketKind::Client3Cmd,
            Self::Client3Mis(_) => PacketKind::Client3Mis,
            Self::Client4Cmd(_) => PacketKind::Client4Cmd,
            Self::Client4Mis(_) => PacketKind::Client4Mis,
            Self::NodeKeepAlive(_) => PacketKind::NodeKeepAlive,
            Self::NodeKeepAliveMis(_) => PacketKind::NodeKeepAliveMis,
            Self::ServerTics(_) => PacketKind::ServerTics,
            Self::ServerRefuse(_) => PacketKind::ServerRefuse,
            Self::ServerShutdown => PacketKind::ServerShutdown,
            Self::ClientQuit => PacketKind::ClientQuit,
            Self::AskInfo(_) => PacketKind::AskInfo,
            Self::ServerInfo(_) => PacketKind::ServerInfo,
            Self::PlayerInfo(_) => PacketKind::PlayerInfo,
            Self::RequestFile(_) => PacketKind::RequestFile,
            Self::AskInfoViaMs(_) => PacketKind::AskInfoViaMs,
            Self::WillResendGamestate(_) => PacketKind::WillResendGamestate,
            Self::CanReceiveGamestate => PacketKind::CanReceiveGamestate,
            Self::ReceivedGamestate => PacketKind::ReceivedGamestate,
            Self::Kick(_) => PacketKind::Kick,
            Self::PlayerDeparted(_) => PacketKind::PlayerDeparted,
            Self::ServerChallenge(_) => PacketKind::ServerChallenge,
            Self::ClientKey(_) => PacketKind::ClientKey,
            Self::ClientJoin(_) => PacketKind::ClientJoin,
            Self::ChallengeAll(_) => PacketKind::ChallengeAll,
            Self::ResponseAll(_) => PacketKind::ResponseAll,
            Self::ResultsAll(_) => PacketKind::ResultsAll,
            Self::FileFragment(_) => PacketKind::FileFragment,
            Self::FileAck(_) => PacketKind::FileAck,
            Self::FileReceived(_) => PacketKind::FileReceived,
            Self::TellFilesNeeded(_) => PacketKind::TellFilesNeeded,
            Self::MoreFilesNeeded(_) => PacketKind::MoreFilesNeeded,
            Self::Ping(_) => PacketKind::Ping,
            Self::Say(_) => PacketKind::Say,
            Self::NodeTimeout => PacketKind::NodeTimeout,
        }
    }

    /// Builds the client bundle for `cmds.len()` local players (0 to 4).
    #[must_use]
    pub fn client_bundle(prefix: CmdPrefix, cmds: &[Ticcmd], missing_tics: bool) -> Option<Self> {
        Some(match (cmds, missing_tics) {
            ([], false) => Self::NodeKeepAlive(prefix),
            ([], true) => Self::NodeKeepAliveMis(prefix),
            ([cmd], false) => Self::ClientCmd(ClientCmdBody { prefix, cmd: *cmd }),
            ([cmd], true) => Self::ClientMis(ClientCmdBody { prefix, cmd: *cmd }),
            ([a, b], false) => Self::Client2Cmd(Client2CmdBody { prefix, cmds: [*a, *b] }),
            ([a, b], true) => Self::Client2Mis(Client2CmdBody { prefix, cmds: [*a, *b] }),
            ([a, b, c], false) => Self::Client3Cmd(Client3CmdBody {
                prefix,
                cmds: [*a, *b, *c],
            }),
            ([a, b, c], true) => Self::Client3Mis(Client3CmdBody {
                prefix,
                cmds: [*a, *b, *c],
            }),
            ([a, b, c, d], false) => Self::Client4Cmd(Client4CmdBody {
                prefix,
                cmds: [*a, *b, *c, *d],
            }),
            ([a, b, c, d], true) => Self::Client4Mis(Client4CmdBody {
                prefix,
                cmds: [*a, *b, *c, *d],
            }),
            _ => return None,
        })
    }

    /// The shared prefix and the bundled commands of a client command packet.
    #[must_use]
    pub fn as_client_bundle(&self) -> Option<(CmdPrefix, SmallVec<[Ticcmd; MAXSPLITSCREENPLAYERS]>)> {
        let (prefix, cmds): (&CmdPrefix, &[Ticcmd]) = match self {
            Self::NodeKeepAlive(prefix) | Self::NodeKeepAliveMis(prefix) => (prefix, &[][..]),
            Self::ClientCmd(body) | Self::ClientMis(body) => {
                (&body.prefix, std::slice::from_ref(&body.cmd))
            },
            Self::Client2Cmd(body) | Self::Client2Mis(body) => (&body.prefix, &body.cmds[..]),
            Self::Client3Cmd(body) | Self::Client3Mis(body) => (&body.prefix, &body.cmds[..]),
            Self::Client4Cmd(body) | Self::Client4Mis(body) => (&body.prefix, &body.cmds[..]),
            _ => return None,
        };
        Some((*prefix, cmds.iter().copied().collect()))
    }

    /// Checks every declared maximum of the payload.
    pub fn validate(&self) -> Result<(), CodecError> {
        match self {
            Self::ServerCfg(cfg) => {
                check_len("commit", cfg.commit.len(), MAX_BUILD_STRING)?;
                check_len("server name", cfg.server_name.len(), MAX_SERVER_NAME)?;
                check_len("slots", cfg.your_slots.len(), MAXSPLITSCREENPLAYERS)?;
                check_roster(&cfg.roster)
            },
            Self::ServerTics(body) => {
                check_len("tics", body.tics.len(), MAX_TICS_PER_PACKET)?;
                for frame in &body.tics {
                    let expected = frame.ingame.count_ones() as usize;
                    if frame.cmds.len() != expected {
                        return Err(CodecError::FieldTooLarge {
                            field: "tic frame commands",
                            len: frame.cmds.len(),
                            max: expected,
                        });
                    }
                }
                Ok(())
            },
            Self::ServerRefuse(body) => check_len("message", body.message.len(), MAX_REASON_LENGTH),
            Self::Kick(body) => check_len("message", body.message.len(), MAX_REASON_LENGTH),
            Self::ServerInfo(info) => {
                check_len("application", info.application.len(), MAX_BUILD_STRING)?;
                check_len("server name", info.server_name.len(), MAX_SERVER_NAME)?;
                check_files(&info.files)
            },
            Self::PlayerInfo(body) => check_roster(&body.entries),
            Self::RequestFile(body) => check_len("files", body.files.len(), MAX_FILES_PER_PACKET),
            Self::AskInfoViaMs(body) => {
                check_len("relay address", body.relay_addr.len(), MAX_RELAY_ADDRESS)
            },
            Self::ClientKey(body) => check_len("keys", body.keys.len(), MAXSPLITSCREENPLAYERS),
            Self::ClientJoin(body) => {
                check_len("application", body.application.len(), MAX_BUILD_STRING)?;
                check_len("names", body.names.len(), MAXSPLITSCREENPLAYERS)?;
                check_len("signatures", body.signatures.len(), MAXSPLITSCREENPLAYERS)?;
                for name in &body.names {
                    check_len("player name", name.len(), MAXPLAYERNAME)?;
                }
                Ok(())
            },
            Self::ResponseAll(body) => {
                check_len("signatures", body.signatures.len(), MAXSPLITSCREENPLAYERS)
            },
            Self::ResultsAll(body) => check_len("results", body.entries.len(), MAXPLAYERS),
            Self::FileFragment(body) => {
                check_len("fragment size", body.fragment_size as usize, MAX_FRAGMENT_SIZE)?;
                check_len("fragment", body.data.len(), body.fragment_size as usize)
            },
            Self::FileAck(body) => check_len("segments", body.segments.len(), MAX_ACK_SEGMENTS),
            Self::MoreFilesNeeded(body) => check_files(&body.files),
            Self::Say(body) => check_len("chat text", body.text.len(), MAX_CHAT_LENGTH),
            _ => Ok(()),
        }
    }
}

/// A complete packet: header fields plus payload.
///
/// The checksum and the reserved byte are not stored; the codec computes and
/// writes them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    /// Reliable ack number, 0 for unreliable packets.
    pub ack: u8,
    /// Highest consecutive ack received from the destination.
    pub ack_return: u8,
    /// Header signatures, exactly `kind().signature_count()` of them.
    pub signatures: SmallVec<[SignatureBytes; MAXSPLITSCREENPLAYERS]>,
    /// Payload.
    pub body: PacketBody,
}

impl Packet {
    /// An unreliable packet with zeroed signatures.
    #[must_use]
    pub fn new(body: PacketBody) -> Self {
        let count = body.kind().signature_count();
        Self {
            ack: 0,
            ack_return: 0,
            signatures: smallvec::smallvec![SignatureBytes::ZERO; count],
            body,
        }
    }

    /// A packet carrying `signatures` in its header.
    #[must_use]
    pub fn signed(body: PacketBody, signatures: &[SignatureBytes]) -> Self {
        Self {
            ack: 0,
            ack_return: 0,
            signatures: signatures.iter().copied().collect(),
            body,
        }
    }

    /// The kind tag of the payload.
    #[must_use]
    pub const fn kind(&self) -> PacketKind {
        self.body.kind()
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

    fn prefix() -> CmdPrefix {
        CmdPrefix {
            client_tic: 7,
            resend_from: 5,
            consistency: None,
        }
    }

    #[test]
    fn client_bundles_pick_kind_by_player_count() {
        let cmd = Ticcmd::NEUTRAL;
        for players in 0..=4 {
            let cmds = vec![cmd; players];
            let body = PacketBody::client_bundle(prefix(), &cmds, false).unwrap();
            assert_eq!(body.kind(), PacketKind::client_cmd_for(players, false).unwrap());
            let (got_prefix, got_cmds) = body.as_client_bundle().unwrap();
            assert_eq!(got_prefix, prefix());
            assert_eq!(got_cmds.len(), players);
        }
        assert!(PacketBody::client_bundle(prefix(), &[cmd; 5], false).is_none());
        assert!(PacketBody::Nothing.as_client_bundle().is_none());
    }

    #[test]
    fn new_packet_has_signature_slots_for_its_kind() {
        let body = PacketBody::client_bundle(prefix(), &[Ticcmd::NEUTRAL; 3], true).unwrap();
        let packet = Packet::new(body);
        assert_eq!(packet.kind(), PacketKind::Client3Mis);
        assert_eq!(packet.signatures.len(), 3);
        assert_eq!(Packet::new(PacketBody::Nothing).signatures.len(), 0);
    }

    #[test]
    fn validate_rejects_long_chat() {
        let body = PacketBody::Say(SayBody {
            source: 0,
            flags: 0,
            text: "x".repeat(MAX_CHAT_LENGTH + 1),
        });
        assert!(matches!(
            body.validate(),
            Err(CodecError::FieldTooLarge { field: "chat text", .. })
        ));
    }

    #[test]
    fn validate_rejects_frame_with_wrong_command_count() {
        let body = PacketBody::ServerTics(ServerTicsBody {
            start_tic: 0,
            tics: vec![TicFrame {
                ingame: 0b11,
                cmds: vec![Ticcmd::NEUTRAL],
            }],
        });
        assert!(body.validate().is_err());
    }

    #[test]
    fn fragment_debug_is_abbreviated() {
        let body = FileFragmentBody {
            file_id: 1,
            iteration: 0,
            position: 0,
            file_size: 100,
            fragment_size: 100,
            data: vec![0xAB; 100],
        };
        let debug = format!("{:?}", body);
        assert!(debug.contains("0xabababab"));
        assert!(debug.contains("(100 bytes)"));
    }
}

//! Binary codec for network packets.
//!
//! Header layout, all multi-byte integers little-endian:
//!
//! ```text
//! ┌──────────┬─────┬────────────┬──────┬──────────────────┬──────────┬─────────┐
//! │ checksum │ ack │ ack_return │ kind │ n × 64 signature │ reserved │ payload │
//! │   u32    │ u8  │     u8     │  u8  │      bytes       │    u8    │         │
//! └──────────┴─────┴────────────┴──────┴──────────────────┴──────────┴─────────┘
//! ```
//!
//! `n` is fixed by the kind. The payload is written with bincode using fixed
//! integer encoding, so its layout depends only on the kind and the values.
//!
//! # Examples
//!
//! ```
//! use kart_netsync::__internal::{decode, encode, Packet, PacketBody};
//!
//! let packet = Packet::new(PacketBody::ClientQuit);
//! let bytes = encode(&packet).expect("encoding should succeed");
//! assert_eq!(decode(&bytes), Ok(packet));
//! ```

use bincode::error::DecodeError;
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;
use std::sync::OnceLock;

use crate::network::messages::*;
use crate::network::packet_kind::PacketKind;
use crate::ticcmd::Ticcmd;
use crate::{KickReason, RefusalReason, MAXPLAYERS, MAX_PACKET_LENGTH};

// Fixed-width little-endian integers give every kind a deterministic layout
// on every host. The limit stops a forged length prefix from allocating more
// than one datagram's worth of memory.
fn config() -> impl bincode::config::Config {
    bincode::config::standard()
        .with_fixed_int_encoding()
        .with_little_endian()
        .with_limit::<MAX_PACKET_LENGTH>()
}

const CHECKSUM_SEED: u32 = 0x1234567;
const BASE_HEADER_LEN: usize = 8;
const SIGNATURE_LEN: usize = 64;

/// What the codec was doing when an error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CodecOperation {
    /// Writing a payload.
    EncodePayload,
    /// Reading a payload.
    DecodePayload,
}

impl fmt::Display for CodecOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EncodePayload => write!(f, "encoding payload"),
            Self::DecodePayload => write!(f, "decoding payload"),
        }
    }
}

/// Errors that can occur during encoding or decoding.
///
/// Bincode's own errors are opaque, so those are carried as strings. Every
/// framing problem the codec detects itself has a structured variant.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CodecError {
    /// Bincode failed to write a payload.
    Encode {
        /// The underlying bincode error message.
        message: String,
        /// The operation that was being performed.
        operation: CodecOperation,
    },
    /// Bincode failed to read a payload.
    Decode {
        /// The underlying bincode error message.
        message: String,
        /// The operation that was being performed.
        operation: CodecOperation,
    },
    /// The checksum field does not match the frame contents.
    ChecksumMismatch {
        /// Checksum computed over the frame.
        expected: u32,
        /// Checksum found in the header.
        actual: u32,
    },
    /// The kind tag is not a known wire kind.
    UnknownKind(u8),
    /// The frame is shorter than its kind requires.
    Truncated {
        /// The kind, if the tag could be read.
        kind: Option<PacketKind>,
        /// Minimum number of bytes required.
        required: usize,
        /// Number of bytes present.
        actual: usize,
    },
    /// The frame exceeds [`MAX_PACKET_LENGTH`].
    Oversized {
        /// Frame length.
        len: usize,
        /// The limit.
        max: usize,
    },
    /// The payload decoded without consuming the whole frame.
    TrailingBytes {
        /// The kind.
        kind: PacketKind,
        /// Number of unread bytes.
        extra: usize,
    },
    /// A payload field exceeds its declared maximum.
    FieldTooLarge {
        /// Field name.
        field: &'static str,
        /// Its length.
        len: usize,
        /// The limit.
        max: usize,
    },
    /// The header carries the wrong number of signatures for the kind.
    SignatureCount {
        /// The kind.
        kind: PacketKind,
        /// Signatures the kind requires.
        expected: usize,
        /// Signatures present.
        actual: usize,
    },
}

impl CodecError {
    /// Creates a new encode error with the given message and operation.
    pub fn encode(message: impl Into<String>, operation: CodecOperation) -> Self {
        Self::Encode {
            message: message.into(),
            operation,
        }
    }

    /// Creates a new decode error with the given message and operation.
    pub fn decode(message: impl Into<String>, operation: CodecOperation) -> Self {
        Self::Decode {
            message: message.into(),
            operation,
        }
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encode { message, operation } => {
                write!(f, "encoding failed while {operation}: {message}")
            },
            Self::Decode { message, operation } => {
                write!(f, "decoding failed while {operation}: {message}")
            },
            Self::ChecksumMismatch { expected, actual } => {
                write!(f, "checksum mismatch: computed {expected:#010x}, header has {actual:#010x}")
            },
            Self::UnknownKind(tag) => write!(f, "unknown packet kind {tag}"),
            Self::Truncated {
                kind,
                required,
                actual,
            } => match kind {
                Some(kind) => {
                    write!(f, "{kind} frame truncated: needed {required} bytes, got {actual}")
                },
                None => write!(f, "frame truncated: needed {required} bytes, got {actual}"),
            },
            Self::Oversized { len, max } => {
                write!(f, "frame of {len} bytes exceeds the {max} byte limit")
            },
            Self::TrailingBytes { kind, extra } => {
                write!(f, "{kind} payload left {extra} trailing bytes")
            },
            Self::FieldTooLarge { field, len, max } => {
                write!(f, "{field} has length {len}, limit is {max}")
            },
            Self::SignatureCount {
                kind,
                expected,
                actual,
            } => write!(f, "{kind} needs {expected} signatures, packet has {actual}"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Header length of a packet of `kind`.
#[inline]
#[must_use]
pub const fn header_len(kind: PacketKind) -> usize {
    BASE_HEADER_LEN + SIGNATURE_LEN * kind.signature_count()
}

/// Frame checksum over `bytes`, which must be everything after the checksum field.
#[must_use]
pub fn checksum(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .enumerate()
        .fold(CHECKSUM_SEED, |sum, (index, byte)| {
            sum.wrapping_add(u32::from(*byte).wrapping_mul(index as u32 + 1))
        })
}

fn put<T: Serialize>(value: &T, out: &mut Vec<u8>) -> CodecResult<()> {
    bincode::serde::encode_into_std_write(value, out, config())
        .map(|_| ())
        .map_err(|e| CodecError::encode(e.to_string(), CodecOperation::EncodePayload))
}

fn take<T: DeserializeOwned>(kind: PacketKind, payload: &[u8]) -> CodecResult<T> {
    let (value, used) = bincode::serde::decode_from_slice::<T, _>(payload, config()).map_err(
        |e| match e {
            DecodeError::UnexpectedEnd { additional } => CodecError::Truncated {
                kind: Some(kind),
                required: header_len(kind) + payload.len() + additional,
                actual: header_len(kind) + payload.len(),
            },
            other => CodecError::decode(other.to_string(), CodecOperation::DecodePayload),
        },
    )?;
    if used != payload.len() {
        return Err(CodecError::TrailingBytes {
            kind,
            extra: payload.len() - used,
        });
    }
    Ok(value)
}

fn take_empty(kind: PacketKind, payload: &[u8]) -> CodecResult<()> {
    if payload.is_empty() {
        Ok(())
    } else {
        Err(CodecError::TrailingBytes {
            kind,
            extra: payload.len(),
        })
    }
}

/// Encodes only the payload of `body`. This is also the byte string that
/// header signatures are computed over.
pub fn encode_payload(body: &PacketBody) -> CodecResult<Vec<u8>> {
    let mut out = Vec::new();
    write_payload(body, &mut out)?;
    Ok(out)
}

fn write_payload(body: &PacketBody, out: &mut Vec<u8>) -> CodecResult<()> {
    match body {
        PacketBody::Nothing
        | PacketBody::ServerShutdown
        | PacketBody::ClientQuit
        | PacketBody::CanReceiveGamestate
        | PacketBody::ReceivedGamestate => Ok(()),
        PacketBody::ServerCfg(b) => put(b, out),
        PacketBody::ClientCmd(b) | PacketBody::ClientMis(b) => put(b, out),
        PacketBody::Client2Cmd(b) | PacketBody::Client2Mis(b) => put(b, out),
        PacketBody::Client3Cmd(b) | PacketBody::Client3Mis(b) => put(b, out),
        PacketBody::Client4Cmd(b) | PacketBody::Client4Mis(b) => put(b, out),
        PacketBody::NodeKeepAlive(b) | PacketBody::NodeKeepAliveMis(b) => put(b, out),
        PacketBody::ServerTics(b) => put(b, out),
        PacketBody::ServerRefuse(b) => put(b, out),
        PacketBody::AskInfo(b) => put(b, out),
        PacketBody::ServerInfo(b) => put(b, out),
        PacketBody::PlayerInfo(b) => put(b, out),
        PacketBody::RequestFile(b) => put(b, out),
        PacketBody::AskInfoViaMs(b) => put(b, out),
        PacketBody::WillResendGamestate(b) => put(b, out),
        PacketBody::Kick(b) => put(b, out),
        PacketBody::PlayerDeparted(b) => put(b, out),
        PacketBody::ServerChallenge(b) | PacketBody::ChallengeAll(b) => put(b, out),
        PacketBody::ClientKey(b) => put(b, out),
        PacketBody::ClientJoin(b) => put(b, out),
        PacketBody::ResponseAll(b) => put(b, out),
        PacketBody::ResultsAll(b) => put(b, out),
        PacketBody::FileFragment(b) => put(b, out),
        PacketBody::FileAck(b) => put(b, out),
        PacketBody::FileReceived(b) => put(b, out),
        PacketBody::TellFilesNeeded(b) => put(b, out),
        PacketBody::MoreFilesNeeded(b) => put(b, out),
        PacketBody::Ping(b) => put(b, out),
        PacketBody::Say(b) => put(b, out),
        PacketBody::NodeTimeout => Err(CodecError::encode(
            "node timeouts are never sent",
            CodecOperation::EncodePayload,
        )),
    }
}

fn read_payload(kind: PacketKind, p: &[u8]) -> CodecResult<PacketBody> {
    Ok(match kind {
        PacketKind::Nothing => take_empty(kind, p).map(|()| PacketBody::Nothing)?,
        PacketKind::ServerShutdown => take_empty(kind, p).map(|()| PacketBody::ServerShutdown)?,
        PacketKind::ClientQuit => take_empty(kind, p).map(|()| PacketBody::ClientQuit)?,
        PacketKind::CanReceiveGamestate => {
            take_empty(kind, p).map(|()| PacketBody::CanReceiveGamestate)?
        },
        PacketKind::ReceivedGamestate => {
            take_empty(kind, p).map(|()| PacketBody::ReceivedGamestate)?
        },
        PacketKind::ServerCfg => PacketBody::ServerCfg(take(kind, p)?),
        PacketKind::ClientCmd => PacketBody::ClientCmd(take(kind, p)?),
        PacketKind::ClientMis => PacketBody::ClientMis(take(kind, p)?),
        PacketKind::Client2Cmd => PacketBody::Client2Cmd(take(kind, p)?),
        PacketKind::Client2Mis => PacketBody::Client2Mis(take(kind, p)?),
        PacketKind::Client3Cmd => PacketBody::Client3Cmd(take(kind, p)?),
        PacketKind::Client3Mis => PacketBody::Client3Mis(take(kind, p)?),
        PacketKind::Client4Cmd => PacketBody::Client4Cmd(take(kind, p)?),
        PacketKind::Client4Mis => PacketBody::Client4Mis(take(kind, p)?),
        PacketKind::NodeKeepAlive => PacketBody::NodeKeepAlive(take(kind, p)?),
        PacketKind::NodeKeepAliveMis => PacketBody::NodeKeepAliveMis(take(kind, p)?),
        PacketKind::ServerTics => PacketBody::ServerTics(take(kind, p)?),
        PacketKind::ServerRefuse => PacketBody::ServerRefuse(take(kind, p)?),
        PacketKind::AskInfo => PacketBody::AskInfo(take(kind, p)?),
        PacketKind::ServerInfo => PacketBody::ServerInfo(take(kind, p)?),
        PacketKind::PlayerInfo => PacketBody::PlayerInfo(take(kind, p)?),
        PacketKind::RequestFile => PacketBody::RequestFile(take(kind, p)?),
        PacketKind::AskInfoViaMs => PacketBody::AskInfoViaMs(take(kind, p)?),
        PacketKind::WillResendGamestate => PacketBody::WillResendGamestate(take(kind, p)?),
        PacketKind::Kick => PacketBody::Kick(take(kind, p)?),
        PacketKind::PlayerDeparted => PacketBody::PlayerDeparted(take(kind, p)?),
        PacketKind::ServerChallenge => PacketBody::ServerChallenge(take(kind, p)?),
        PacketKind::ClientKey => PacketBody::ClientKey(take(kind, p)?),
        PacketKind::ClientJoin => PacketBody::ClientJoin(take(kind, p)?),
        PacketKind::ChallengeAll => PacketBody::ChallengeAll(take(kind, p)?),
        PacketKind::ResponseAll => PacketBody::ResponseAll(take(kind, p)?),
        PacketKind::ResultsAll => PacketBody::ResultsAll(take(kind, p)?),
        PacketKind::FileFragment => PacketBody::FileFragment(take(kind, p)?),
        PacketKind::FileAck => PacketBody::FileAck(take(kind, p)?),
        PacketKind::FileReceived => PacketBody::FileReceived(take(kind, p)?),
        PacketKind::TellFilesNeeded => PacketBody::TellFilesNeeded(take(kind, p)?),
        PacketKind::MoreFilesNeeded => PacketBody::MoreFilesNeeded(take(kind, p)?),
        PacketKind::Ping => PacketBody::Ping(take(kind, p)?),
        PacketKind::Say => PacketBody::Say(take(kind, p)?),
        PacketKind::NodeTimeout => return Err(CodecError::UnknownKind(kind.as_u8())),
    })
}

/// The smallest payload of each kind: empty collections, empty strings, no options.
fn minimal_body(kind: PacketKind) -> PacketBody {
    let prefix = CmdPrefix::default();
    let cmd = Ticcmd::NEUTRAL;
    let signature_challenge = ChallengeBody {
        challenge: Challenge([0; 64]),
    };
    match kind {
        PacketKind::Nothing => PacketBody::Nothing,
        PacketKind::ServerCfg => PacketBody::ServerCfg(Box::new(ServerCfgBody {
            version: 0,
            subversion: 0,
            commit: String::new(),
            server_players: 0,
            game_state: 0,
            game_mode: 0,
            modified: false,
            max_players: 0,
            allow_joins: false,
            content_checksum: 0,
            server_name: String::new(),
            your_node: 0,
            your_slots: Vec::new(),
            roster: Vec::new(),
        })),
        PacketKind::ClientCmd => PacketBody::ClientCmd(ClientCmdBody { prefix, cmd }),
        PacketKind::ClientMis => PacketBody::ClientMis(ClientCmdBody { prefix, cmd }),
        PacketKind::Client2Cmd => PacketBody::Client2Cmd(Client2CmdBody {
            prefix,
            cmds: [cmd; 2],
        }),
        PacketKind::Client2Mis => PacketBody::Client2Mis(Client2CmdBody {
            prefix,
            cmds: [cmd; 2],
        }),
        PacketKind::Client3Cmd => PacketBody::Client3Cmd(Client3CmdBody {
            prefix,
            cmds: [cmd; 3],
        }),
        PacketKind::Client3Mis => PacketBody::Client3Mis(Client3CmdBody {
            prefix,
            cmds: [cmd; 3],
        }),
        PacketKind::Client4Cmd => PacketBody::Client4Cmd(Client4CmdBody {
            prefix,
            cmds: [cmd; 4],
        }),
        PacketKind::Client4Mis => PacketBody::Client4Mis(Client4CmdBody {
            prefix,
            cmds: [cmd; 4],
        }),
        PacketKind::NodeKeepAlive => PacketBody::NodeKeepAlive(prefix),
        PacketKind::NodeKeepAliveMis => PacketBody::NodeKeepAliveMis(prefix),
        PacketKind::ServerTics => PacketBody::ServerTics(ServerTicsBody {
            start_tic: 0,
            tics: Vec::new(),
        }),
        PacketKind::ServerRefuse => PacketBody::ServerRefuse(ServerRefuseBody {
            reason: RefusalReason::Full,
            message: String::new(),
        }),
        PacketKind::ServerShutdown => PacketBody::ServerShutdown,
        PacketKind::ClientQuit => PacketBody::ClientQuit,
        PacketKind::AskInfo => PacketBody::AskInfo(AskInfoBody {
            version: 0,
            echo_time: 0,
        }),
        PacketKind::ServerInfo => PacketBody::ServerInfo(Box::new(ServerInfo {
            version: 0,
            subversion: 0,
            application: String::new(),
            player_count: 0,
            max_players: 0,
            eligibility: JoinEligibility::Joinable,
            content_checksum: 0,
            server_name: String::new(),
            echo_time: 0,
            file_count: 0,
            files: Vec::new(),
            more_files: false,
        })),
        PacketKind::PlayerInfo => PacketBody::PlayerInfo(PlayerInfoBody {
            entries: Vec::new(),
        }),
        PacketKind::RequestFile => PacketBody::RequestFile(RequestFileBody { files: Vec::new() }),
        PacketKind::AskInfoViaMs => PacketBody::AskInfoViaMs(AskInfoViaMsBody {
            relay_addr: String::new(),
            echo_time: 0,
        }),
        PacketKind::WillResendGamestate => {
            PacketBody::WillResendGamestate(WillResendGamestateBody {
                tic: 0,
                iteration: 0,
                size: 0,
            })
        },
        PacketKind::CanReceiveGamestate => PacketBody::CanReceiveGamestate,
        PacketKind::ReceivedGamestate => PacketBody::ReceivedGamestate,
        PacketKind::Kick => PacketBody::Kick(KickBody {
            reason: KickReason::Kicked,
            message: String::new(),
        }),
        PacketKind::PlayerDeparted => PacketBody::PlayerDeparted(PlayerDepartedBody {
            slot: 0,
            reason: KickReason::Quit,
        }),
        PacketKind::ServerChallenge => PacketBody::ServerChallenge(signature_challenge),
        PacketKind::ClientKey => PacketBody::ClientKey(ClientKeyBody { keys: Vec::new() }),
        PacketKind::ClientJoin => PacketBody::ClientJoin(ClientJoinBody {
            version: 0,
            subversion: 0,
            application: String::new(),
            content_checksum: 0,
            names: Vec::new(),
            signatures: Vec::new(),
        }),
        PacketKind::ChallengeAll => PacketBody::ChallengeAll(signature_challenge),
        PacketKind::ResponseAll => PacketBody::ResponseAll(ResponseAllBody {
            signatures: Vec::new(),
        }),
        PacketKind::ResultsAll => PacketBody::ResultsAll(ResultsAllBody {
            entries: Vec::new(),
        }),
        PacketKind::FileFragment => PacketBody::FileFragment(FileFragmentBody {
            file_id: 0,
            iteration: 0,
            position: 0,
            file_size: 0,
            fragment_size: 0,
            data: Vec::new(),
        }),
        PacketKind::FileAck => PacketBody::FileAck(FileAckBody {
            file_id: 0,
            iteration: 0,
            segments: Vec::new(),
        }),
        PacketKind::FileReceived => PacketBody::FileReceived(FileReceivedBody {
            file_id: 0,
            iteration: 0,
        }),
        PacketKind::TellFilesNeeded => PacketBody::TellFilesNeeded(TellFilesNeededBody { first: 0 }),
        PacketKind::MoreFilesNeeded => PacketBody::MoreFilesNeeded(MoreFilesNeededBody {
            first: 0,
            more: false,
            files: Vec::new(),
        }),
        PacketKind::Ping => PacketBody::Ping(PingBody {
            lag: [0; MAXPLAYERS],
        }),
        PacketKind::Say => PacketBody::Say(SayBody {
            source: 0,
            flags: 0,
            text: String::new(),
        }),
        PacketKind::NodeTimeout => PacketBody::NodeTimeout,
    }
}

/// Smallest valid payload length of `kind`.
#[must_use]
pub fn min_payload_len(kind: PacketKind) -> usize {
    static TABLE: OnceLock<[usize; PacketKind::ALL.len()]> = OnceLock::new();
    let table = TABLE.get_or_init(|| {
        let mut table = [0; PacketKind::ALL.len()];
        for kind in PacketKind::ALL {
            table[kind.as_u8() as usize] = encode_payload(&minimal_body(kind)).map_or(0, |p| p.len());
        }
        table
    });
    table[kind.as_u8() as usize]
}

/// Encodes a packet into one datagram.
///
/// Fails if a payload field exceeds its declared maximum, if the header
/// signature count disagrees with the kind, or if the frame would exceed
/// [`MAX_PACKET_LENGTH`].
pub fn encode(packet: &Packet) -> CodecResult<Vec<u8>> {
    let kind = packet.kind();
    let expected = kind.signature_count();
    if packet.signatures.len() != expected {
        return Err(CodecError::SignatureCount {
            kind,
            expected,
            actual: packet.signatures.len(),
        });
    }
    packet.body.validate()?;

    let mut out = Vec::with_capacity(header_len(kind) + 64);
    out.extend_from_slice(&[0; 4]);
    out.push(packet.ack);
    out.push(packet.ack_return);
    out.push(kind.as_u8());
    for signature in &packet.signatures {
        out.extend_from_slice(&signature.0);
    }
    out.push(0);
    write_payload(&packet.body, &mut out)?;

    if out.len() > MAX_PACKET_LENGTH {
        return Err(CodecError::Oversized {
            len: out.len(),
            max: MAX_PACKET_LENGTH,
        });
    }
    let sum = checksum(&out[4..]);
    out[..4].copy_from_slice(&sum.to_le_bytes());
    Ok(out)
}

/// Decodes one datagram.
///
/// The checksum is verified before anything else is interpreted. The frame
/// must then carry a known kind, be within the kind's size bounds, and be
/// consumed exactly by the payload.
pub fn decode(bytes: &[u8]) -> CodecResult<Packet> {
    if bytes.len() < BASE_HEADER_LEN {
        return Err(CodecError::Truncated {
            kind: None,
            required: BASE_HEADER_LEN,
            actual: bytes.len(),
        });
    }
    let actual = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let expected = checksum(&bytes[4..]);
    if actual != expected {
        return Err(CodecError::ChecksumMismatch { expected, actual });
    }

    let tag = bytes[6];
    let kind = PacketKind::from_u8(tag)
        .filter(|kind| *kind != PacketKind::NodeTimeout)
        .ok_or(CodecError::UnknownKind(tag))?;
    let header = header_len(kind);
    let required = header + min_payload_len(kind);
    if bytes.len() < required {
        return Err(CodecError::Truncated {
            kind: Some(kind),
            required,
            actual: bytes.len(),
        });
    }
    if bytes.len() > MAX_PACKET_LENGTH {
        return Err(CodecError::Oversized {
            len: bytes.len(),
            max: MAX_PACKET_LENGTH,
        });
    }

    let signatures = bytes[7..header - 1]
        .chunks_exact(SIGNATURE_LEN)
        .map(|chunk| {
            let mut signature = [0u8; SIGNATURE_LEN];
            signature.copy_from_slice(chunk);
            SignatureBytes(signature)
        })
        .collect();
    let body = read_payload(kind, &bytes[header..])?;
    body.validate()?;

    tracing::trace!(%kind, len = bytes.len(), ack = bytes[4], "decoded packet");
    Ok(Packet {
        ack: bytes[4],
        ack_return: bytes[5],
        signatures,
        body,
    })
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
    use crate::files::manifest::FileEntry;

    fn sample_tics() -> Packet {
        let mut cmd = Ticcmd::NEUTRAL;
        cmd.forward_move = 50;
        cmd.turning = -300;
        Packet {
            ack: 17,
            ack_return: 16,
            signatures: smallvec::SmallVec::new(),
            body: PacketBody::ServerTics(ServerTicsBody {
                start_tic: 250,
                tics: vec![
                    TicFrame {
                        ingame: 0b101,
                        cmds: vec![cmd, Ticcmd::NEUTRAL],
                    },
                    TicFrame {
                        ingame: 0b1,
                        cmds: vec![cmd],
                    },
                ],
            }),
        }
    }

    #[test]
    fn header_fields_are_at_fixed_offsets() {
        let bytes = encode(&sample_tics()).unwrap();
        assert_eq!(bytes[4], 17);
        assert_eq!(bytes[5], 16);
        assert_eq!(bytes[6], PacketKind::ServerTics.as_u8());
        assert_eq!(bytes[7], 0);
        assert_eq!(bytes[8], 250);
    }

    #[test]
    fn roundtrip_signed_bundle() {
        let body = PacketBody::client_bundle(
            CmdPrefix {
                client_tic: 3,
                resend_from: 1,
                consistency: Some(ConsistencyReport { tic: 2, value: 0xBEEF }),
            },
            &[Ticcmd::NEUTRAL, Ticcmd::NEUTRAL.with_latency(9)],
            false,
        )
        .unwrap();
        let packet = Packet::signed(body, &[SignatureBytes([1; 64]), SignatureBytes([2; 64])]);
        let bytes = encode(&packet).unwrap();
        assert_eq!(bytes.len(), header_len(PacketKind::Client2Cmd) + encode_payload(&packet.body).unwrap().len());
        assert_eq!(decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn roundtrip_server_info_with_files() {
        let packet = Packet::new(PacketBody::ServerInfo(Box::new(ServerInfo {
            version: 1,
            subversion: 2,
            application: "kart".to_owned(),
            player_count: 3,
            max_players: 8,
            eligibility: JoinEligibility::Full,
            content_checksum: 99,
            server_name: "Test Server".to_owned(),
            echo_time: 123_456,
            file_count: 1,
            files: vec![FileEntry::new("main.pk3", 1000, 42)],
            more_files: false,
        })));
        assert_eq!(decode(&encode(&packet).unwrap()).unwrap(), packet);
    }

    #[test]
    fn ticcmd_occupies_its_wire_size() {
        let one = encode_payload(&PacketBody::ClientCmd(ClientCmdBody {
            prefix: CmdPrefix::default(),
            cmd: Ticcmd::NEUTRAL,
        }))
        .unwrap();
        let prefix = encode_payload(&PacketBody::NodeKeepAlive(CmdPrefix::default())).unwrap();
        assert_eq!(one.len() - prefix.len(), Ticcmd::WIRE_SIZE);
    }

    #[test]
    fn bundles_share_the_first_bundle_prefix() {
        let prefix = CmdPrefix {
            client_tic: 9,
            resend_from: 4,
            consistency: Some(ConsistencyReport { tic: 8, value: 77 }),
        };
        let mut cmd = Ticcmd::NEUTRAL;
        cmd.buttons = 0x0102;
        let single = encode_payload(&PacketBody::client_bundle(prefix, &[cmd], false).unwrap()).unwrap();
        let quad = encode_payload(&PacketBody::client_bundle(prefix, &[cmd; 4], false).unwrap()).unwrap();
        assert_eq!(&quad[..single.len()], single.as_slice());
    }

    #[test]
    fn rejects_bad_checksum() {
        let mut bytes = encode(&sample_tics()).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x40;
        assert!(matches!(decode(&bytes), Err(CodecError::ChecksumMismatch { .. })));
    }

    fn reseal(bytes: &mut [u8]) {
        let sum = checksum(&bytes[4..]);
        bytes[..4].copy_from_slice(&sum.to_le_bytes());
    }

    #[test]
    fn rejects_unknown_and_local_only_kinds() {
        let mut bytes = encode(&Packet::new(PacketBody::Nothing)).unwrap();
        bytes[6] = 200;
        reseal(&mut bytes);
        assert_eq!(decode(&bytes), Err(CodecError::UnknownKind(200)));
        bytes[6] = PacketKind::NodeTimeout.as_u8();
        reseal(&mut bytes);
        assert_eq!(decode(&bytes), Err(CodecError::UnknownKind(39)));
        assert!(encode(&Packet::new(PacketBody::NodeTimeout)).is_err());
    }

    #[test]
    fn rejects_truncated_and_trailing_frames() {
        let bytes = encode(&sample_tics()).unwrap();
        let mut short = bytes[..bytes.len() - 3].to_vec();
        reseal(&mut short);
        assert!(matches!(decode(&short), Err(CodecError::Truncated { .. })));

        let mut long = bytes;
        long.push(0);
        reseal(&mut long);
        assert!(matches!(decode(&long), Err(CodecError::TrailingBytes { extra: 1, .. })));

        assert!(matches!(
            decode(&[1, 2, 3]),
            Err(CodecError::Truncated { kind: None, .. })
        ));
    }

    #[test]
    fn rejects_frame_below_minimum_for_kind() {
        let mut bytes = encode(&Packet::new(PacketBody::Nothing)).unwrap();
        bytes[6] = PacketKind::ClientCmd.as_u8();
        reseal(&mut bytes);
        assert!(matches!(
            decode(&bytes),
            Err(CodecError::Truncated {
                kind: Some(PacketKind::ClientCmd),
                ..
            })
        ));
    }

    #[test]
    fn encode_refuses_wrong_signature_count_and_oversized_payloads() {
        let packet = Packet {
            ack: 0,
            ack_return: 0,
            signatures: smallvec::SmallVec::new(),
            body: PacketBody::Say(SayBody {
                source: 0,
                flags: 0,
                text: "hi".to_owned(),
            }),
        };
        assert!(matches!(encode(&packet), Err(CodecError::SignatureCount { .. })));

        let fragment = Packet::new(PacketBody::FileFragment(FileFragmentBody {
            file_id: 0,
            iteration: 0,
            position: 0,
            file_size: 10_000,
            fragment_size: MAX_FRAGMENT_SIZE as u16,
            data: vec![0; MAX_FRAGMENT_SIZE + 1],
        }));
        assert!(matches!(encode(&fragment), Err(CodecError::FieldTooLarge { .. })));
    }

    #[test]
    fn minimum_lengths_cover_fixed_fields() {
        assert_eq!(min_payload_len(PacketKind::Nothing), 0);
        assert_eq!(min_payload_len(PacketKind::FileReceived), 2);
        assert!(min_payload_len(PacketKind::Client4Cmd) > 4 * Ticcmd::WIRE_SIZE);
    }

    #[test]
    fn codec_error_display() {
        let err = CodecError::ChecksumMismatch {
            expected: 1,
            actual: 2,
        };
        assert!(err.to_string().contains("checksum mismatch"));
        let err = CodecError::encode("boom", CodecOperation::EncodePayload);
        assert!(err.to_string().contains("encoding payload"));
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod property_tests {
    use super::*;
    use crate::test_config::miri_case_count;
    use proptest::prelude::*;

    fn arb_ticcmd() -> impl Strategy<Value = Ticcmd> {
        (any::<i8>(), any::<i16>(), any::<i16>(), any::<u16>(), any::<u8>()).prop_map(
            |(forward_move, turning, angle, buttons, latency)| Ticcmd {
                forward_move,
                turning,
                angle,
                throw_dir: 0,
                aiming: 0,
                buttons,
                latency,
                flags: 0,
            },
        )
    }

    fn arb_packet() -> impl Strategy<Value = Packet> {
        prop_oneof![
            (any::<u8>(), any::<u8>(), proptest::collection::vec(arb_ticcmd(), 0..=4)).prop_map(
                |(client_tic, resend_from, cmds)| {
                    let body = PacketBody::client_bundle(
                        CmdPrefix {
                            client_tic,
                            resend_from,
                            consistency: None,
                        },
                        &cmds,
                        client_tic % 2 == 0,
                    )
                    .unwrap();
                    Packet::new(body)
                }
            ),
            (any::<u8>(), proptest::collection::vec(arb_ticcmd(), 1..6)).prop_map(
                |(start_tic, cmds)| {
                    let tics = cmds
                        .into_iter()
                        .map(|cmd| TicFrame {
                            ingame: 1,
                            cmds: vec![cmd],
                        })
                        .collect();
                    Packet::new(PacketBody::ServerTics(ServerTicsBody { start_tic, tics }))
                }
            ),
            ("[a-z ]{0,40}", any::<u8>()).prop_map(|(text, source)| {
                Packet::new(PacketBody::Say(SayBody {
                    source,
                    flags: 0,
                    text,
                }))
            }),
            (any::<u8>(), any::<u8>(), any::<u32>(), proptest::collection::vec(any::<u8>(), 0..200))
                .prop_map(|(file_id, iteration, position, data)| {
                    Packet::new(PacketBody::FileFragment(FileFragmentBody {
                        file_id,
                        iteration,
                        position,
                        file_size: position.saturating_add(data.len() as u32),
                        fragment_size: 200,
                        data,
                    }))
                }),
        ]
        .prop_flat_map(|packet| {
            (Just(packet), any::<u8>(), any::<u8>()).prop_map(|(mut packet, ack, ack_return)| {
                packet.ack = ack;
                packet.ack_return = ack_return;
                packet
            })
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: miri_case_count(),
            ..ProptestConfig::default()
        })]

        #[test]
        fn decode_inverts_encode(packet in arb_packet()) {
            let bytes = encode(&packet).unwrap();
            prop_assert_eq!(decode(&bytes).unwrap(), packet);
        }

        #[test]
        fn any_single_byte_corruption_is_rejected(
            packet in arb_packet(),
            index in any::<prop::sample::Index>(),
            flip in 1u8..=255,
        ) {
            let mut bytes = encode(&packet).unwrap();
            let at = index.index(bytes.len());
            bytes[at] ^= flip;
            prop_assert!(decode(&bytes).is_err());
        }

        #[test]
        fn decode_never_panics_on_garbage(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = decode(&bytes);
        }
    }
}

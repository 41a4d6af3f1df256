//! Configuration types for kart-netsync sessions.
//!
//! Every struct is plain data with a `Default` and a few presets. Pass them to
//! [`SessionBuilder`](crate::SessionBuilder), which validates the combination
//! when a session is started.
//!
//! # Overview
//!
//! | Config Type | Purpose | Key Presets |
//! |-------------|---------|-------------|
//! | `ReliabilityConfig` | Resend pacing, backlog and timeouts per node | `lan()`, `lossy()` |
//! | `TicSyncConfig` | Tic window, stall and resync handling | `lan()`, `lossy()` |
//! | `FileTransferConfig` | Fragment size and pacing | `fast()` |
//! | `TrustConfig` | Challenge binding and signature checks | `unsigned_ticcmds()` |
//! | `ServerSettings` | Player limit, join policy, advertised name | none |
//! | `BuildInfo` | Version and application id checked at join | none |
//!
//! # Example
//!
//! ```
//! use kart_netsync::{ReliabilityConfig, SessionBuilder, TicSyncConfig};
//!
//! let builder = SessionBuilder::new()
//!     .with_reliability_config(ReliabilityConfig::lossy())
//!     .with_tic_sync_config(TicSyncConfig::lossy());
//! # let _ = builder;
//! ```

use std::net::Ipv4Addr;

use crate::files::receiver::DEFAULT_MAX_FILE_SIZE;
use crate::network::messages::{MAX_BUILD_STRING, MAX_FRAGMENT_SIZE, MAX_SERVER_NAME, MAX_TICS_PER_PACKET};
use crate::{NetsyncError, MAXPLAYERS, MAX_PREDICT_TICS, TICRATE};

fn out_of_range(field: &str, min: u64, max: u64, actual: u64) -> NetsyncError {
    NetsyncError::InvalidRequest {
        info: format!("{} must be between {} and {}, got {}", field, min, max, actual),
    }
}

fn check_range(field: &str, min: u64, max: u64, actual: u64) -> Result<(), NetsyncError> {
    if actual < min || actual > max {
        return Err(out_of_range(field, min, max, actual));
    }
    Ok(())
}

/// Configuration of the per-node reliable channel.
///
/// All durations are in pump tics: one call of `net_update()` is one tic.
///
/// # Forward Compatibility
///
/// New fields may be added to this struct in future versions. Always use the
/// `..ReliabilityConfig::default()` pattern when constructing instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "ReliabilityConfig has no effect unless passed to SessionBuilder::with_reliability_config()"]
pub struct ReliabilityConfig {
    /// Tics between resends of an unacknowledged reliable packet.
    ///
    /// Default: 8
    pub resend_interval_tics: u32,

    /// Resends of one packet before the node is declared timed out.
    ///
    /// Default: 20
    pub max_retries: u32,

    /// Tics of silence after which the node is declared timed out.
    ///
    /// Default: 15 seconds worth of tics
    pub connection_timeout_tics: u32,

    /// Reliable packets that may wait for an ack at once.
    ///
    /// Default: 64
    pub max_pending: usize,

    /// Part of `max_pending` that can-fail kinds may not use.
    ///
    /// Default: 8
    pub reserved_for_must_deliver: usize,

    /// Out-of-order reliable packets held back for in-order delivery.
    ///
    /// Default: 64
    pub max_reorder: usize,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            resend_interval_tics: 8,
            max_retries: 20,
            connection_timeout_tics: 15 * TICRATE,
            max_pending: 64,
            reserved_for_must_deliver: 8,
            max_reorder: 64,
        }
    }
}

impl ReliabilityConfig {
    /// Creates a new `ReliabilityConfig` with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration preset for local networks: quick resends, quick timeouts.
    pub fn lan() -> Self {
        Self {
            resend_interval_tics: 4,
            max_retries: 20,
            connection_timeout_tics: 5 * TICRATE,
            ..Self::default()
        }
    }

    /// Configuration preset for lossy links (5-20% loss).
    ///
    /// Tolerates more retries and longer silence before giving up.
    pub fn lossy() -> Self {
        Self {
            resend_interval_tics: 6,
            max_retries: 60,
            connection_timeout_tics: 30 * TICRATE,
            max_pending: 128,
            reserved_for_must_deliver: 16,
            max_reorder: 128,
        }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `NetsyncError::InvalidRequest` if a value is out of range or if
    /// the must-deliver reserve leaves no room for can-fail packets.
    pub fn validate(&self) -> Result<(), NetsyncError> {
        check_range("resend_interval_tics", 1, u64::from(10 * TICRATE), u64::from(self.resend_interval_tics))?;
        check_range("max_retries", 1, 1000, u64::from(self.max_retries))?;
        check_range(
            "connection_timeout_tics",
            u64::from(self.resend_interval_tics),
            u64::from(600 * TICRATE),
            u64::from(self.connection_timeout_tics),
        )?;
        // Ack numbers live in 1..=255 and the window must stay unambiguous.
        check_range("max_pending", 2, 127, self.max_pending as u64)?;
        check_range(
            "reserved_for_must_deliver",
            0,
            self.max_pending as u64 - 1,
            self.reserved_for_must_deliver as u64,
        )?;
        check_range("max_reorder", 1, 127, self.max_reorder as u64)
    }
}

/// Configuration of tic making and lockstep delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "TicSyncConfig has no effect unless passed to SessionBuilder::with_tic_sync_config()"]
pub struct TicSyncConfig {
    /// Tics before a node's supposed position that every `SERVERTICS` repeats.
    ///
    /// Default: 1
    pub extra_tics: u32,

    /// Most tics sent in one `SERVERTICS`.
    ///
    /// Default: 48
    pub send_window: usize,

    /// Tics a player may go without sending commands before the owning node
    /// is kicked with `KickReason::Timeout`.
    ///
    /// Default: 10 seconds worth of tics
    pub stall_kick_tics: u32,

    /// Failed gamestate resends of one node before it is kicked with
    /// `KickReason::ResyncFailure`.
    ///
    /// Default: 3
    pub max_resync_attempts: u32,

    /// Tics between `ASKINFO` retries while a client waits for `SERVERINFO`.
    ///
    /// Default: 1 second worth of tics
    pub ask_info_retry_tics: u32,

    /// Tics between `PING` broadcasts.
    ///
    /// Default: 1 second worth of tics
    pub ping_interval_tics: u32,
}

impl Default for TicSyncConfig {
    fn default() -> Self {
        Self {
            extra_tics: 1,
            send_window: MAX_TICS_PER_PACKET,
            stall_kick_tics: 10 * TICRATE,
            max_resync_attempts: 3,
            ask_info_retry_tics: TICRATE,
            ping_interval_tics: TICRATE,
        }
    }
}

impl TicSyncConfig {
    /// Creates a new `TicSyncConfig` with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration preset for local networks.
    pub fn lan() -> Self {
        Self {
            extra_tics: 0,
            stall_kick_tics: 5 * TICRATE,
            ..Self::default()
        }
    }

    /// Configuration preset for lossy links: more redundancy per packet.
    pub fn lossy() -> Self {
        Self {
            extra_tics: 4,
            stall_kick_tics: 20 * TICRATE,
            max_resync_attempts: 5,
            ..Self::default()
        }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `NetsyncError::InvalidRequest` if a value is out of range.
    pub fn validate(&self) -> Result<(), NetsyncError> {
        check_range("extra_tics", 0, 16, u64::from(self.extra_tics))?;
        check_range("send_window", 1, MAX_TICS_PER_PACKET as u64, self.send_window as u64)?;
        check_range(
            "stall_kick_tics",
            u64::from(crate::MAXGENTLEMENDELAY),
            u64::from(600 * TICRATE),
            u64::from(self.stall_kick_tics),
        )?;
        check_range("max_resync_attempts", 1, 100, u64::from(self.max_resync_attempts))?;
        check_range("ask_info_retry_tics", 1, u64::from(60 * TICRATE), u64::from(self.ask_info_retry_tics))?;
        check_range("ping_interval_tics", 1, u64::from(60 * TICRATE), u64::from(self.ping_interval_tics))
    }
}

/// Configuration of bulk file and gamestate transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "FileTransferConfig has no effect unless passed to SessionBuilder::with_file_transfer_config()"]
pub struct FileTransferConfig {
    /// Payload bytes per fragment.
    ///
    /// Default: 960
    pub fragment_size: u16,

    /// Fragments sent to one node per tic.
    ///
    /// Default: 8
    pub fragments_per_tic: usize,

    /// Tics before an unacknowledged fragment is sent again.
    ///
    /// Default: half a second worth of tics
    pub fragment_resend_tics: u32,

    /// Tics without progress after which a transfer is abandoned.
    ///
    /// Default: 30 seconds worth of tics
    pub transfer_timeout_tics: u32,

    /// Largest file or gamestate, in bytes, a client agrees to receive.
    /// Larger offers end the session instead of allocating a buffer.
    ///
    /// Default: 64 MiB
    pub max_file_size: u32,
}

impl Default for FileTransferConfig {
    fn default() -> Self {
        Self {
            fragment_size: 960,
            fragments_per_tic: 8,
            fragment_resend_tics: TICRATE / 2,
            transfer_timeout_tics: 30 * TICRATE,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

impl FileTransferConfig {
    /// Creates a new `FileTransferConfig` with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration preset for fast local links.
    pub fn fast() -> Self {
        Self {
            fragments_per_tic: 32,
            fragment_resend_tics: TICRATE / 4,
            ..Self::default()
        }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `NetsyncError::InvalidRequest` if a value is out of range.
    pub fn validate(&self) -> Result<(), NetsyncError> {
        check_range("fragment_size", 1, MAX_FRAGMENT_SIZE as u64, u64::from(self.fragment_size))?;
        check_range("fragments_per_tic", 1, 256, self.fragments_per_tic as u64)?;
        check_range("fragment_resend_tics", 1, u64::from(60 * TICRATE), u64::from(self.fragment_resend_tics))?;
        check_range(
            "transfer_timeout_tics",
            u64::from(self.fragment_resend_tics),
            u64::from(600 * TICRATE),
            u64::from(self.transfer_timeout_tics),
        )?;
        check_range(
            "max_file_size",
            u64::from(self.fragment_size),
            u64::from(u32::MAX),
            u64::from(self.max_file_size),
        )
    }
}

/// Configuration of the trust engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "TrustConfig has no effect unless passed to SessionBuilder::with_trust_config()"]
pub struct TrustConfig {
    /// Largest accepted difference between a challenge's embedded time and
    /// the local clock, in seconds.
    ///
    /// Default: 900 (15 minutes)
    pub challenge_skew_secs: u64,

    /// Tics a join challenge stays valid on the server.
    ///
    /// Default: 10 seconds worth of tics
    pub join_challenge_tics: u32,

    /// Address the server embeds in its challenges. Leave unset behind NAT;
    /// clients on external addresses then refuse to sign.
    ///
    /// Default: `None`
    pub public_ip: Option<Ipv4Addr>,

    /// Whether client command bundles and chat must carry valid signatures.
    ///
    /// Default: `true`
    pub sign_ticcmds: bool,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            challenge_skew_secs: 15 * 60,
            join_challenge_tics: 10 * TICRATE,
            public_ip: None,
            sign_ticcmds: true,
        }
    }
}

impl TrustConfig {
    /// Creates a new `TrustConfig` with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Default trust settings without per-tic command signatures.
    pub fn unsigned_ticcmds() -> Self {
        Self {
            sign_ticcmds: false,
            ..Self::default()
        }
    }

    /// The address to embed in challenges.
    #[must_use]
    pub fn challenge_ip(&self) -> Ipv4Addr {
        self.public_ip.unwrap_or(Ipv4Addr::UNSPECIFIED)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `NetsyncError::InvalidRequest` if a value is out of range.
    pub fn validate(&self) -> Result<(), NetsyncError> {
        check_range("challenge_skew_secs", 1, 24 * 60 * 60, self.challenge_skew_secs)?;
        check_range("join_challenge_tics", 1, u64::from(600 * TICRATE), u64::from(self.join_challenge_tics))
    }
}

/// Server policy advertised in `SERVERINFO` and `SERVERCFG`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "ServerSettings has no effect unless passed to SessionBuilder::with_server_settings()"]
pub struct ServerSettings {
    /// Player limit, at most `MAXPLAYERS`.
    ///
    /// Default: 16
    pub max_players: u8,

    /// Whether new players may join.
    ///
    /// Default: `true`
    pub allow_joins: bool,

    /// Lag above which a node is kicked with `KickReason::PingTooHigh` once
    /// it persists for `ping_grace_tics`. `None` disables the check.
    ///
    /// Default: `None`
    pub max_ping_tics: Option<u8>,

    /// Tics the lag must stay above `max_ping_tics` before the kick.
    ///
    /// Default: 10 seconds worth of tics
    pub ping_grace_tics: u32,

    /// Human-readable server name.
    pub server_name: String,

    /// Opaque game state kind forwarded in `SERVERCFG`.
    pub game_state: u8,

    /// Opaque game mode forwarded in `SERVERCFG`.
    pub game_mode: u8,

    /// Whether the server runs modified content.
    pub modified: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            max_players: MAXPLAYERS as u8,
            allow_joins: true,
            max_ping_tics: None,
            ping_grace_tics: 10 * TICRATE,
            server_name: "kart-netsync server".to_owned(),
            game_state: 0,
            game_mode: 0,
            modified: false,
        }
    }
}

impl ServerSettings {
    /// Validates the settings.
    ///
    /// # Errors
    ///
    /// Returns `NetsyncError::InvalidRequest` if a value is out of range.
    pub fn validate(&self) -> Result<(), NetsyncError> {
        check_range("max_players", 1, MAXPLAYERS as u64, u64::from(self.max_players))?;
        if let Some(max_ping) = self.max_ping_tics {
            check_range("max_ping_tics", 1, u64::from(MAX_PREDICT_TICS), u64::from(max_ping))?;
        }
        check_range("server_name length", 1, MAX_SERVER_NAME as u64, self.server_name.len() as u64)
    }
}

/// Build identity compared at join.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BuildInfo {
    /// Protocol version. Must match exactly.
    pub version: u8,
    /// Protocol subversion. Must match exactly.
    pub subversion: u8,
    /// Application id. Must match exactly.
    pub application: String,
    /// Source revision, informational.
    pub commit: String,
}

impl Default for BuildInfo {
    fn default() -> Self {
        Self {
            version: 1,
            subversion: 0,
            application: env!("CARGO_PKG_NAME").to_owned(),
            commit: String::new(),
        }
    }
}

impl BuildInfo {
    /// Validates string lengths against the wire limits.
    ///
    /// # Errors
    ///
    /// Returns `NetsyncError::InvalidRequest` if a string is too long.
    pub fn validate(&self) -> Result<(), NetsyncError> {
        check_range("application length", 1, MAX_BUILD_STRING as u64, self.application.len() as u64)?;
        check_range("commit length", 0, MAX_BUILD_STRING as u64, self.commit.len() as u64)
    }

    /// Returns `true` if a peer built as `other` may join.
    #[must_use]
    pub fn compatible_with(&self, version: u8, subversion: u8, application: &str) -> bool {
        self.version == version && self.subversion == subversion && self.application == application
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
    fn defaults_and_presets_validate() {
        ReliabilityConfig::default().validate().unwrap();
        ReliabilityConfig::lan().validate().unwrap();
        ReliabilityConfig::lossy().validate().unwrap();
        TicSyncConfig::default().validate().unwrap();
        TicSyncConfig::lan().validate().unwrap();
        TicSyncConfig::lossy().validate().unwrap();
        FileTransferConfig::default().validate().unwrap();
        FileTransferConfig::fast().validate().unwrap();
        TrustConfig::default().validate().unwrap();
        ServerSettings::default().validate().unwrap();
        BuildInfo::default().validate().unwrap();
    }

    #[test]
    fn reliability_defaults() {
        let config = ReliabilityConfig::default();
        assert_eq!(config.resend_interval_tics, 8);
        assert_eq!(config.max_retries, 20);
        assert_eq!(config.connection_timeout_tics, 525);
        assert_eq!(config.max_pending, 64);
        assert_eq!(config.reserved_for_must_deliver, 8);
    }

    #[test]
    fn reserve_must_leave_room() {
        let config = ReliabilityConfig {
            max_pending: 8,
            reserved_for_must_deliver: 8,
            ..ReliabilityConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("reserved_for_must_deliver"));
    }

    #[test]
    fn window_cannot_exceed_packet_limit() {
        let config = TicSyncConfig {
            send_window: MAX_TICS_PER_PACKET + 1,
            ..TicSyncConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn fragment_size_is_bounded() {
        let config = FileTransferConfig {
            fragment_size: (MAX_FRAGMENT_SIZE + 1) as u16,
            ..FileTransferConfig::default()
        };
        assert!(config.validate().is_err());
        let config = FileTransferConfig {
            fragment_size: 0,
            ..FileTransferConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn file_size_limit_holds_at_least_one_fragment() {
        let config = FileTransferConfig {
            max_file_size: 959,
            ..FileTransferConfig::default()
        };
        assert!(config.validate().is_err());
        let config = FileTransferConfig {
            max_file_size: 960,
            ..FileTransferConfig::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn server_settings_limits() {
        let settings = ServerSettings {
            max_players: 17,
            ..ServerSettings::default()
        };
        assert!(settings.validate().is_err());
        let settings = ServerSettings {
            max_ping_tics: Some(MAX_PREDICT_TICS + 1),
            ..ServerSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn build_compatibility_is_exact() {
        let build = BuildInfo::default();
        assert!(build.compatible_with(1, 0, "kart-netsync"));
        assert!(!build.compatible_with(1, 1, "kart-netsync"));
        assert!(!build.compatible_with(1, 0, "other"));
    }

    #[test]
    fn challenge_ip_defaults_to_unspecified() {
        assert_eq!(TrustConfig::default().challenge_ip(), Ipv4Addr::UNSPECIFIED);
        let config = TrustConfig {
            public_ip: Some(Ipv4Addr::new(198, 51, 100, 1)),
            ..TrustConfig::default()
        };
        assert_eq!(config.challenge_ip(), Ipv4Addr::new(198, 51, 100, 1));
    }
}

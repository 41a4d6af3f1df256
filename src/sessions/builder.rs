use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::files::manifest::ContentManifest;
use crate::files::store::{ContentStore, MemoryContentStore};
use crate::sessions::config::{
    BuildInfo, FileTransferConfig, ReliabilityConfig, ServerSettings, TicSyncConfig, TrustConfig,
};
use crate::telemetry::ViolationObserver;
use crate::trust::LocalIdentity;
use crate::{ClientSession, NetsyncError, PeerAddress, ServerSession, Transport};

/// Everything a session is built from, after validation.
pub(crate) struct SessionParts {
    pub(crate) build: BuildInfo,
    pub(crate) settings: ServerSettings,
    pub(crate) reliability: ReliabilityConfig,
    pub(crate) tic_sync: TicSyncConfig,
    pub(crate) file_transfer: FileTransferConfig,
    pub(crate) trust: TrustConfig,
    pub(crate) identity: LocalIdentity,
    pub(crate) manifest: ContentManifest,
    pub(crate) store: Box<dyn ContentStore>,
    pub(crate) observer: Option<Arc<dyn ViolationObserver>>,
    pub(crate) rng: StdRng,
}

/// The [`SessionBuilder`] builds both kinds of session.
///
/// After setting all appropriate values, use [`start_server`](Self::start_server)
/// or [`start_client`](Self::start_client) to consume the builder.
///
/// ```
/// use kart_netsync::{LocalIdentity, SessionBuilder, TicSyncConfig};
///
/// let builder = SessionBuilder::new()
///     .with_tic_sync_config(TicSyncConfig::lan())
///     .with_identity(LocalIdentity::generate(&["host"]).unwrap());
/// # let _ = builder;
/// ```
#[must_use = "SessionBuilder must be consumed by calling start_server or start_client"]
pub struct SessionBuilder {
    build: BuildInfo,
    settings: ServerSettings,
    reliability: ReliabilityConfig,
    tic_sync: TicSyncConfig,
    file_transfer: FileTransferConfig,
    trust: TrustConfig,
    identity: LocalIdentity,
    manifest: ContentManifest,
    store: Box<dyn ContentStore>,
    /// Optional observer for protocol violations.
    violation_observer: Option<Arc<dyn ViolationObserver>>,
    rng_seed: Option<u64>,
}

impl std::fmt::Debug for SessionBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Destructure so a new field cannot be forgotten here.
        let Self {
            build,
            settings,
            reliability,
            tic_sync,
            file_transfer,
            trust,
            identity,
            manifest,
            store: _,
            violation_observer,
            rng_seed,
        } = self;

        f.debug_struct("SessionBuilder")
            .field("build", build)
            .field("settings", settings)
            .field("reliability", reliability)
            .field("tic_sync", tic_sync)
            .field("file_transfer", file_transfer)
            .field("trust", trust)
            .field("identity", identity)
            .field("manifest_files", &manifest.len())
            .field("has_violation_observer", &violation_observer.is_some())
            .field("rng_seed", rng_seed)
            .finish_non_exhaustive()
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionBuilder {
    /// Construct a new builder with all values set to their defaults.
    pub fn new() -> Self {
        Self {
            build: BuildInfo::default(),
            settings: ServerSettings::default(),
            reliability: ReliabilityConfig::default(),
            tic_sync: TicSyncConfig::default(),
            file_transfer: FileTransferConfig::default(),
            trust: TrustConfig::default(),
            identity: LocalIdentity::empty(),
            manifest: ContentManifest::default(),
            store: Box::new(MemoryContentStore::new()),
            violation_observer: None,
            rng_seed: None,
        }
    }

    /// Sets the build identity compared when a client joins.
    pub fn with_build_info(mut self, build: BuildInfo) -> Self {
        self.build = build;
        self
    }

    /// Sets the server's advertised and enforced settings. Ignored by clients.
    pub fn with_server_settings(mut self, settings: ServerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Sets the reliable-delivery configuration.
    pub fn with_reliability_config(mut self, reliability: ReliabilityConfig) -> Self {
        self.reliability = reliability;
        self
    }

    /// Sets the tic synchronization configuration.
    pub fn with_tic_sync_config(mut self, tic_sync: TicSyncConfig) -> Self {
        self.tic_sync = tic_sync;
        self
    }

    /// Sets the file transfer configuration.
    pub fn with_file_transfer_config(mut self, file_transfer: FileTransferConfig) -> Self {
        self.file_transfer = file_transfer;
        self
    }

    /// Sets the challenge and signature configuration.
    pub fn with_trust_config(mut self, trust: TrustConfig) -> Self {
        self.trust = trust;
        self
    }

    /// Sets the local players and their signing keys. A client needs at
    /// least one; a dedicated server may have none.
    pub fn with_identity(mut self, identity: LocalIdentity) -> Self {
        self.identity = identity;
        self
    }

    /// Sets the content files this peer runs with. The server advertises the
    /// manifest; a client compares it with the server's.
    pub fn with_manifest(mut self, manifest: ContentManifest) -> Self {
        self.manifest = manifest;
        self
    }

    /// Sets where content files are read from (server) or downloaded to (client).
    pub fn with_content_store(mut self, store: impl ContentStore + 'static) -> Self {
        self.store = Box::new(store);
        self
    }

    /// Sets a custom observer for protocol violations.
    ///
    /// By default violations are logged via `tracing`.
    pub fn with_violation_observer(mut self, observer: Arc<dyn ViolationObserver>) -> Self {
        self.violation_observer = Some(observer);
        self
    }

    /// Seeds the generator used for challenge nonces. Without a seed the
    /// generator is seeded from the operating system.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    fn into_parts(self) -> Result<SessionParts, NetsyncError> {
        self.build.validate()?;
        self.settings.validate()?;
        self.reliability.validate()?;
        self.tic_sync.validate()?;
        self.file_transfer.validate()?;
        self.trust.validate()?;
        if self.identity.len() > usize::from(self.settings.max_players) {
            return Err(NetsyncError::InvalidRequest {
                info: format!(
                    "{} local players exceed the limit of {}",
                    self.identity.len(),
                    self.settings.max_players
                ),
            });
        }
        let rng = match self.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(SessionParts {
            build: self.build,
            settings: self.settings,
            reliability: self.reliability,
            tic_sync: self.tic_sync,
            file_transfer: self.file_transfer,
            trust: self.trust,
            identity: self.identity,
            manifest: self.manifest,
            store: self.store,
            observer: self.violation_observer,
            rng,
        })
    }

    /// Consumes the builder to construct a [`ServerSession`]. The server's
    /// own players are in game from tic 0.
    ///
    /// # Errors
    /// - Returns [`InvalidRequest`] if a configuration value is out of range.
    ///
    /// [`InvalidRequest`]: NetsyncError::InvalidRequest
    pub fn start_server<A: PeerAddress>(
        self,
        transport: impl Transport<A> + 'static,
    ) -> Result<ServerSession<A>, NetsyncError> {
        let parts = self.into_parts()?;
        ServerSession::new(parts, Box::new(transport))
    }

    /// Consumes the builder to construct a [`ClientSession`] that starts
    /// joining `server` on its first `net_update()`.
    ///
    /// # Errors
    /// - Returns [`InvalidRequest`] if a configuration value is out of range or
    ///   there are no local players.
    ///
    /// [`InvalidRequest`]: NetsyncError::InvalidRequest
    pub fn start_client<A: PeerAddress>(
        self,
        transport: impl Transport<A> + 'static,
        server: A,
    ) -> Result<ClientSession<A>, NetsyncError> {
        if self.identity.is_empty() {
            return Err(NetsyncError::InvalidRequest {
                info: "a client needs at least one local player".to_owned(),
            });
        }
        let parts = self.into_parts()?;
        ClientSession::new(parts, Box::new(transport), server)
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
    use std::net::SocketAddr;

    struct NullTransport;

    impl Transport<SocketAddr> for NullTransport {
        fn send_to(&mut self, _datagram: &[u8], _addr: &SocketAddr) {}

        fn receive_all_datagrams(&mut self) -> Vec<(SocketAddr, Vec<u8>)> {
            Vec::new()
        }
    }

    fn server_addr() -> SocketAddr {
        "127.0.0.1:5029".parse().unwrap()
    }

    #[test]
    fn client_requires_local_players() {
        let result = SessionBuilder::new().start_client(NullTransport, server_addr());
        assert!(matches!(result, Err(NetsyncError::InvalidRequest { .. })));
    }

    #[test]
    fn invalid_config_is_rejected_at_start() {
        let result = SessionBuilder::new()
            .with_tic_sync_config(TicSyncConfig {
                send_window: 0,
                ..TicSyncConfig::default()
            })
            .start_server::<SocketAddr>(NullTransport);
        assert!(result.is_err());
    }

    #[test]
    fn server_binds_its_local_players() {
        let server = SessionBuilder::new()
            .with_identity(LocalIdentity::generate(&["one", "two"]).unwrap())
            .start_server::<SocketAddr>(NullTransport)
            .unwrap();
        assert_eq!(server.local_slots().len(), 2);
        assert_eq!(server.ingame_mask(), 0b11);
        assert_eq!(server.player_name(server.local_slots()[1]), Some("two"));
    }

    #[test]
    fn too_many_local_players_for_the_server_limit() {
        let result = SessionBuilder::new()
            .with_server_settings(ServerSettings {
                max_players: 1,
                ..ServerSettings::default()
            })
            .with_identity(LocalIdentity::generate(&["a", "b"]).unwrap())
            .start_server::<SocketAddr>(NullTransport);
        assert!(result.is_err());
    }

    #[test]
    fn debug_output_names_the_builder() {
        let text = format!("{:?}", SessionBuilder::new().with_rng_seed(7));
        assert!(text.starts_with("SessionBuilder"));
        assert!(text.contains("rng_seed: Some(7)"));
    }
}

//! The joining end of a session.
//!
//! A [`ClientSession`] walks the join handshake, then runs tics exactly as
//! the server broadcasts them. Each `net_update()`:
//!
//! ```text
//! poll ─► handle packets ─► handshake retries ─► transfers
//!      ─► round cutoff ─► command bundle ─► tick ─► flush
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use smallvec::SmallVec;
use web_time::Instant;

use crate::directory::{NodeHandle, SlotVec};
use crate::error::NetsyncError;
use crate::files::manifest::{ContentManifest, FileEntry};
use crate::files::receiver::{FileReceiver, FragmentOutcome};
use crate::files::store::ContentStore;
use crate::files::{TransferError, GAMESTATE_FILE_ID};
use crate::gamestate_cell::GamestateCell;
use crate::network::codec;
use crate::network::endpoint::{Endpoint, Source};
use crate::network::messages::{
    AskInfoBody, Challenge, ChallengeBody, ClientJoinBody, ClientKeyBody, CmdPrefix,
    ConsistencyReport, FileFragmentBody, FileReceivedBody, JoinEligibility, MoreFilesNeededBody,
    Packet, PacketBody, PublicKeyBytes, RequestFileBody, ResponseAllBody, ResultsAllBody,
    RosterEntry, SayBody, ServerCfgBody, ServerInfo, ServerTicsBody, SignatureBytes,
    TellFilesNeededBody, WillResendGamestateBody, MAX_FILES_PER_PACKET,
};
use crate::network::network_stats::NetworkStats;
use crate::sessions::builder::SessionParts;
use crate::sessions::config::{BuildInfo, FileTransferConfig, TicSyncConfig, TrustConfig};
use crate::sessions::event_drain::EventDrain;
use crate::sessions::join_state::{GoneReason, JoinState};
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::tic_buffer::{expand_tic, ConsistencyLog, TicBuffer};
use crate::ticcmd::Ticcmd;
use crate::trust::{
    should_sign_challenge, unix_time_now, verify, ClientRound, LocalIdentity, ShouldSign,
};
use crate::{
    report_violation_to, PeerAddress, PlayerSlot, RefusalReason, SessionEvent, Tic,
    TicRequest, Transport, BACKUPTICS, MAXPLAYERS, MAXSPLITSCREENPLAYERS, MAX_CHAT_LENGTH,
};

const MAX_EVENT_QUEUE_SIZE: usize = 256;

#[derive(Debug, Clone)]
struct RosterPlayer {
    name: String,
    key: PublicKeyBytes,
}

/// The gamestate the server announced with `WILLRESENDGAMESTATE`.
#[derive(Debug, Copy, Clone)]
struct GamestateOffer {
    tic: Tic,
    iteration: u8,
}

/// Manifest pages collected during discovery.
#[derive(Debug, Default)]
struct ManifestPages {
    checksum: u64,
    expected: u16,
    entries: Vec<FileEntry>,
    complete: bool,
}

/// A [`ClientSession`] joins a server and runs the tics it broadcasts.
///
/// The client never builds a tic itself: `try_run_tics()` only advances
/// through tics the server has sent, so every client runs the same inputs.
pub struct ClientSession<A: PeerAddress> {
    endpoint: Endpoint<A>,
    server_addr: A,
    server: NodeHandle,
    build: BuildInfo,
    tic_sync: TicSyncConfig,
    file_config: FileTransferConfig,
    trust: TrustConfig,
    identity: LocalIdentity,
    manifest: ContentManifest,
    store: Box<dyn ContentStore>,
    observer: Option<Arc<dyn ViolationObserver>>,

    state: JoinState,
    last_ask: Tic,
    pages: Option<ManifestPages>,
    receiver: FileReceiver,
    downloads: BTreeMap<u8, FileEntry>,
    finished_files: Vec<u8>,

    my_slots: SlotVec,
    roster: [Option<RosterPlayer>; MAXPLAYERS],
    lag: [u8; MAXPLAYERS],
    offer: Option<GamestateOffer>,
    pending_load: Option<GamestateCell>,
    has_joined: bool,

    buffer: TicBuffer,
    consistency: ConsistencyLog,
    /// Next tic to run.
    gametic: Tic,
    /// First tic not yet received.
    neededtic: Tic,
    /// One past the highest tic received.
    highest_seen: Tic,
    local_tic: Tic,
    local_cmds: [Ticcmd; MAXSPLITSCREENPLAYERS],
    round: Option<ClientRound>,

    events: VecDeque<SessionEvent>,
}

impl<A: PeerAddress> std::fmt::Debug for ClientSession<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("server", &self.server_addr)
            .field("state", &self.state)
            .field("gametic", &self.gametic)
            .field("neededtic", &self.neededtic)
            .finish_non_exhaustive()
    }
}

impl<A: PeerAddress> ClientSession<A> {
    /// Creates a client. Use [`SessionBuilder::start_client`](crate::SessionBuilder::start_client).
    pub(crate) fn new(
        parts: SessionParts,
        transport: Box<dyn Transport<A>>,
        server_addr: A,
    ) -> Result<Self, NetsyncError> {
        let mut endpoint = Endpoint::new(transport, parts.reliability);
        let server = endpoint.open_node(server_addr.clone())?;
        tracing::info!(server = ?server_addr, players = parts.identity.len(), "client started");
        let receiver = FileReceiver::with_max_file_size(parts.file_transfer.max_file_size);
        Ok(Self {
            endpoint,
            server_addr,
            server,
            build: parts.build,
            tic_sync: parts.tic_sync,
            file_config: parts.file_transfer,
            trust: parts.trust,
            identity: parts.identity,
            manifest: parts.manifest,
            store: parts.store,
            observer: parts.observer,
            state: JoinState::Unknown,
            last_ask: Tic::ZERO,
            pages: None,
            receiver,
            downloads: BTreeMap::new(),
            finished_files: Vec::new(),
            my_slots: SlotVec::new(),
            roster: std::array::from_fn(|_| None),
            lag: [0; MAXPLAYERS],
            offer: None,
            pending_load: None,
            has_joined: false,
            buffer: TicBuffer::new(),
            consistency: ConsistencyLog::new(),
            gametic: Tic::ZERO,
            neededtic: Tic::ZERO,
            highest_seen: Tic::ZERO,
            local_tic: Tic::ZERO,
            local_cmds: [Ticcmd::NEUTRAL; MAXSPLITSCREENPLAYERS],
            round: None,
            events: VecDeque::new(),
        })
    }

    // ###############
    // # PUBLIC API  #
    // ###############

    /// Stores the command of local player `split`. It is sent with every
    /// bundle until replaced.
    ///
    /// # Errors
    /// - Returns [`InvalidRequest`] if `split` is not a local player.
    ///
    /// [`InvalidRequest`]: NetsyncError::InvalidRequest
    pub fn submit_local_ticcmd(&mut self, split: usize, cmd: Ticcmd) -> Result<(), NetsyncError> {
        if split >= self.identity.len() {
            return Err(NetsyncError::InvalidRequest {
                info: format!("the client has {} local players", self.identity.len()),
            });
        }
        self.local_cmds[split] = cmd;
        Ok(())
    }

    /// Records the simulation's consistency value for `tic`. The value for
    /// the last tic run is reported to the server.
    pub fn record_consistency(&mut self, tic: Tic, value: u16) {
        self.consistency.record(tic, value);
    }

    /// Returns the requests needed to run received tics up to (not
    /// including) `target`.
    ///
    /// A `LoadGamestate` comes first right after a join or a resync. Tics
    /// the server has not sent yet are not run; call again after the next
    /// `net_update()`.
    ///
    /// # Errors
    /// - Returns [`NotJoined`] once the session is gone.
    ///
    /// [`NotJoined`]: NetsyncError::NotJoined
    pub fn try_run_tics(&mut self, target: Tic) -> Result<Vec<TicRequest>, NetsyncError> {
        if self.state.is_gone() {
            return Err(NetsyncError::NotJoined);
        }
        let mut requests = Vec::new();
        if let Some(cell) = self.pending_load.take() {
            let tic = cell.tic();
            requests.push(TicRequest::LoadGamestate { cell, tic });
        }
        if self.state.is_joined() {
            while self.gametic < target && self.gametic < self.neededtic {
                let Some((_, inputs)) = self.buffer.frame(self.gametic) else {
                    report_violation_to!(
                        &self.observer,
                        ViolationSeverity::Error,
                        ViolationKind::TicSync,
                        "tic {} below neededtic {} is incomplete",
                        self.gametic,
                        self.neededtic
                    );
                    break;
                };
                requests.push(TicRequest::AdvanceTic {
                    tic: self.gametic,
                    inputs,
                });
                self.gametic += 1;
            }
        }
        Ok(requests)
    }

    /// Runs one pump tic: receives and handles packets, drives the join
    /// handshake and transfers, sends the command bundle and flushes.
    pub fn net_update(&mut self) {
        self.endpoint.poll();
        for incoming in self.endpoint.take_incoming() {
            match incoming.source {
                Source::Node(handle) if handle == self.server => self.handle_packet(incoming.packet),
                source => tracing::trace!(?source, kind = %incoming.packet.kind(), "packet not from the server ignored"),
            }
        }
        if !self.state.is_gone() {
            self.drive_discovery();
            self.pump_transfers();
            self.check_round();
            self.send_bundle();
        }
        self.endpoint.tick();
        self.endpoint.flush();
    }

    /// Starts a round re-proof at `start`, the same tic the server was given.
    ///
    /// If the client is in game at `start` and has not verified the round
    /// results by `start + CHALLENGEALL_CLIENTCUTOFF`, it disconnects with
    /// [`GoneReason::TrustFailure`]. Results only verify against a challenge
    /// answered after this call.
    pub fn begin_round(&mut self, start: Tic) {
        if self.state.is_gone() {
            return;
        }
        tracing::debug!(%start, "round re-proof scheduled");
        self.round = Some(ClientRound::new(start));
    }

    /// Leaves the server. The quit notice is delivered reliably; keep calling
    /// `net_update()` or use [`wait_all_acks`](Self::wait_all_acks).
    pub fn quit(&mut self) {
        if self.state.is_gone() {
            return;
        }
        self.send(PacketBody::ClientQuit, true);
        self.go_gone(GoneReason::Quit, String::new());
    }

    /// Sends a chat line from local player `split`.
    ///
    /// # Errors
    /// - Returns [`NotJoined`] before the client is in game.
    /// - Returns [`InvalidRequest`] if `split` is not a local player or the text is too long.
    ///
    /// [`NotJoined`]: NetsyncError::NotJoined
    /// [`InvalidRequest`]: NetsyncError::InvalidRequest
    pub fn say(&mut self, split: usize, text: &str) -> Result<(), NetsyncError> {
        if !self.state.is_joined() {
            return Err(NetsyncError::NotJoined);
        }
        let slot = *self.my_slots.get(split).ok_or_else(|| NetsyncError::InvalidRequest {
            info: format!("the client has {} local players", self.my_slots.len()),
        })?;
        if text.len() > MAX_CHAT_LENGTH {
            return Err(NetsyncError::InvalidRequest {
                info: format!("chat text is limited to {} bytes", MAX_CHAT_LENGTH),
            });
        }
        let body = PacketBody::Say(SayBody {
            source: slot.as_u8(),
            flags: 0,
            text: text.to_owned(),
        });
        let payload = codec::encode_payload(&body)?;
        let signature = self
            .identity
            .sign_as(split, &payload)
            .ok_or(NetsyncError::InvalidPlayerSlot { slot })?;
        self.endpoint
            .send(self.server, Packet::signed(body, &[signature]), true)
    }

    /// Pumps the network until every reliable packet is acknowledged or
    /// `timeout` passes. Returns `true` if everything was acknowledged.
    pub fn wait_all_acks(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.endpoint.all_acked() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            self.net_update();
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Returns all events that happened since last queried for events. If the
    /// number of stored events exceeds an internal limit, the oldest events
    /// are discarded.
    pub fn events(&mut self) -> EventDrain<'_> {
        EventDrain::from_drain(self.events.drain(..))
    }

    /// Where the client is in the join handshake.
    #[must_use]
    pub const fn state(&self) -> JoinState {
        self.state
    }

    /// The next tic to run.
    #[must_use]
    pub const fn current_tic(&self) -> Tic {
        self.gametic
    }

    /// The first tic not yet received from the server.
    #[must_use]
    pub const fn needed_tic(&self) -> Tic {
        self.neededtic
    }

    /// The slots assigned to the local players, in splitscreen order.
    #[must_use]
    pub fn local_slots(&self) -> &[PlayerSlot] {
        &self.my_slots
    }

    /// The name of the player in `slot`.
    #[must_use]
    pub fn player_name(&self, slot: PlayerSlot) -> Option<&str> {
        self.roster[slot.as_usize()].as_ref().map(|p| p.name.as_str())
    }

    /// Lag in tics of the player in `slot`, as last reported by the server.
    #[must_use]
    pub fn player_lag(&self, slot: PlayerSlot) -> u8 {
        self.lag[slot.as_usize()]
    }

    /// The content manifest the client joins with.
    #[must_use]
    pub fn manifest(&self) -> &ContentManifest {
        &self.manifest
    }

    /// Connection statistics for the link to the server.
    ///
    /// # Errors
    /// - Returns [`NotJoined`] once the link is closed.
    ///
    /// [`NotJoined`]: NetsyncError::NotJoined
    pub fn network_stats(&self) -> Result<NetworkStats, NetsyncError> {
        let mut stats = self.endpoint.stats(self.server).ok_or(NetsyncError::NotJoined)?;
        if let Some(slot) = self.my_slots.first() {
            stats.lag_tics = self.lag[slot.as_usize()];
        }
        stats.nettics = self.state.is_joined().then_some(self.neededtic);
        Ok(stats)
    }

    /// Returns the violation observer, if one was configured.
    #[must_use]
    pub fn violation_observer(&self) -> Option<&Arc<dyn ViolationObserver>> {
        self.observer.as_ref()
    }

    // ###############
    // #    STATE    #
    // ###############

    fn push_event(&mut self, event: SessionEvent) {
        self.events.push_back(event);
        while self.events.len() > MAX_EVENT_QUEUE_SIZE {
            self.events.pop_front();
        }
    }

    fn set_state(&mut self, next: JoinState) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition_to(next) {
            report_violation_to!(
                &self.observer,
                ViolationSeverity::Error,
                ViolationKind::InternalError,
                "illegal join transition {} -> {}",
                self.state,
                next
            );
            return;
        }
        tracing::debug!(from = %self.state, to = %next, "join state changed");
        self.state = next;
        self.push_event(SessionEvent::JoinStateChanged { state: next });
    }

    fn go_gone(&mut self, reason: GoneReason, message: String) {
        if self.state.is_gone() {
            return;
        }
        tracing::info!(%reason, message = %message, "left the server");
        self.set_state(JoinState::Gone(reason));
        self.receiver.clear();
        self.downloads.clear();
        self.pending_load = None;
        self.round = None;
        self.push_event(SessionEvent::Disconnected { reason, message });
    }

    fn send(&mut self, body: PacketBody, reliable: bool) {
        let kind = body.kind();
        if let Err(err) = self.endpoint.send(self.server, Packet::new(body), reliable) {
            report_violation_to!(
                &self.observer,
                ViolationSeverity::Warning,
                ViolationKind::Reliability,
                "{} to the server not sent: {}",
                kind,
                err
            );
        }
    }

    // ###############
    // #  HANDLERS   #
    // ###############

    fn handle_packet(&mut self, packet: Packet) {
        if self.state.is_gone() {
            return;
        }
        let kind = packet.kind();
        match packet.body {
            PacketBody::ServerInfo(info) => self.on_server_info(*info),
            PacketBody::MoreFilesNeeded(body) => self.on_manifest_page(body),
            PacketBody::ServerRefuse(body) => {
                self.go_gone(GoneReason::Refused(body.reason), body.message);
            },
            PacketBody::ServerChallenge(ChallengeBody { challenge }) => {
                if self.state == JoinState::AwaitingChallenge {
                    self.on_join_challenge(challenge);
                }
            },
            PacketBody::FileFragment(fragment) => self.on_fragment(&fragment),
            PacketBody::ServerCfg(cfg) => {
                if self.state == JoinState::AwaitingConfig {
                    self.on_config(*cfg);
                }
            },
            PacketBody::WillResendGamestate(body) => self.on_gamestate_offer(body),
            PacketBody::ServerTics(body) => self.on_server_tics(&body),
            PacketBody::PlayerInfo(body) => {
                for entry in body.entries {
                    self.add_roster_entry(entry);
                }
            },
            PacketBody::PlayerDeparted(body) => {
                if let Some(slot) = PlayerSlot::new(body.slot) {
                    if self.roster[slot.as_usize()].take().is_some() {
                        self.push_event(SessionEvent::PlayerDeparted {
                            slot,
                            reason: body.reason,
                        });
                    }
                }
            },
            PacketBody::Ping(body) => self.lag = body.lag,
            PacketBody::Say(body) => self.on_say(body, &packet.signatures),
            PacketBody::ChallengeAll(ChallengeBody { challenge }) => self.on_round_challenge(challenge),
            PacketBody::ResultsAll(body) => self.on_round_results(&body),
            PacketBody::Kick(body) => self.go_gone(GoneReason::Kicked(body.reason), body.message),
            PacketBody::ServerShutdown => self.go_gone(GoneReason::ServerShutdown, String::new()),
            PacketBody::NodeTimeout => self.go_gone(GoneReason::TimedOut, String::new()),
            _ => report_violation_to!(
                &self.observer,
                ViolationSeverity::Warning,
                ViolationKind::NetworkProtocol,
                "unexpected {} from the server",
                kind
            ),
        }
    }

    // ###############
    // # DISCOVERY   #
    // ###############

    fn drive_discovery(&mut self) {
        let now = self.endpoint.now();
        match self.state {
            JoinState::Unknown => {
                self.ask_info();
                self.set_state(JoinState::InfoQueried);
            },
            JoinState::InfoQueried
                if now - self.last_ask >= i64::from(self.tic_sync.ask_info_retry_tics) =>
            {
                match self.pages.as_ref() {
                    Some(pages) => {
                        let first = pages.entries.len() as u16;
                        self.last_ask = now;
                        self.send(PacketBody::TellFilesNeeded(TellFilesNeededBody { first }), false);
                    },
                    None => self.ask_info(),
                }
            },
            _ => {},
        }
    }

    fn ask_info(&mut self) {
        self.last_ask = self.endpoint.now();
        self.send(
            PacketBody::AskInfo(AskInfoBody {
                version: self.build.version,
                echo_time: u64::from(self.last_ask.as_u32()),
            }),
            false,
        );
    }

    fn on_server_info(&mut self, info: ServerInfo) {
        if self.state != JoinState::InfoQueried || self.pages.is_some() {
            return;
        }
        if !self
            .build
            .compatible_with(info.version, info.subversion, &info.application)
        {
            let message = format!(
                "server runs {} {}.{}",
                info.application, info.version, info.subversion
            );
            self.go_gone(GoneReason::Refused(RefusalReason::VersionMismatch), message);
            return;
        }
        let refusal = match info.eligibility {
            JoinEligibility::JoinsDisabled => Some(RefusalReason::JoinsDisabled),
            JoinEligibility::Full => Some(RefusalReason::Full),
            JoinEligibility::Joinable
                if usize::from(info.player_count) + self.identity.len()
                    > usize::from(info.max_players) =>
            {
                Some(RefusalReason::Full)
            },
            JoinEligibility::Joinable => None,
        };
        if let Some(reason) = refusal {
            self.go_gone(GoneReason::Refused(reason), reason.to_string());
            return;
        }
        tracing::debug!(server = %info.server_name, players = info.player_count, files = info.file_count, "server info received");
        self.pages = Some(ManifestPages {
            checksum: info.content_checksum,
            expected: info.file_count,
            entries: info.files.clone(),
            complete: !info.more_files,
        });
        self.push_event(SessionEvent::ServerInfoReceived { info });
        self.continue_manifest();
    }

    fn on_manifest_page(&mut self, body: MoreFilesNeededBody) {
        if self.state != JoinState::InfoQueried {
            return;
        }
        let Some(pages) = self.pages.as_mut() else {
            return;
        };
        if pages.complete || usize::from(body.first) != pages.entries.len() {
            return;
        }
        pages.entries.extend(body.files);
        pages.complete = !body.more || pages.entries.len() >= usize::from(pages.expected);
        self.continue_manifest();
    }

    /// Asks for the next manifest page, or sends `CLIENTKEY` once the
    /// manifest is complete and matches the advertised checksum.
    fn continue_manifest(&mut self) {
        let Some(pages) = self.pages.as_ref() else {
            return;
        };
        if !pages.complete {
            let first = pages.entries.len() as u16;
            self.last_ask = self.endpoint.now();
            self.send(PacketBody::TellFilesNeeded(TellFilesNeededBody { first }), false);
            return;
        }
        let checksum = pages.checksum;
        let manifest = ContentManifest::new(pages.entries.clone());
        if manifest.checksum() != checksum {
            report_violation_to!(
                &self.observer,
                ViolationSeverity::Warning,
                ViolationKind::FileTransfer,
                "manifest of {} files does not match checksum {:#018x}",
                manifest.len(),
                checksum
            );
            self.go_gone(
                GoneReason::Refused(RefusalReason::ContentMismatch),
                "server manifest is inconsistent".to_owned(),
            );
            return;
        }
        self.manifest = manifest;
        self.send_client_key();
    }

    fn send_client_key(&mut self) {
        let keys = self.identity.public_keys();
        self.send(PacketBody::ClientKey(ClientKeyBody { keys }), true);
        self.set_state(JoinState::AwaitingChallenge);
    }

    // ###############
    // #    JOIN     #
    // ###############

    fn on_join_challenge(&mut self, challenge: Challenge) {
        let verdict = should_sign_challenge(
            &challenge,
            self.server_addr.ipv4(),
            unix_time_now(),
            self.trust.challenge_skew_secs,
        );
        if verdict != ShouldSign::Ok {
            report_violation_to!(
                &self.observer,
                ViolationSeverity::Error,
                ViolationKind::Trust,
                "join challenge refused: {:?}",
                verdict
            );
            self.go_gone(GoneReason::TrustFailure, format!("join challenge refused: {:?}", verdict));
            return;
        }
        let missing = self.manifest.missing_from(&*self.store);
        if !missing.is_empty() {
            self.request_files(&missing);
            return;
        }
        let body = ClientJoinBody {
            version: self.build.version,
            subversion: self.build.subversion,
            application: self.build.application.clone(),
            content_checksum: self.manifest.checksum(),
            names: self.identity.names().map(str::to_owned).collect(),
            signatures: self.identity.sign_all(&challenge.0),
        };
        self.send(PacketBody::ClientJoin(body), true);
        self.set_state(JoinState::AwaitingConfig);
    }

    fn request_files(&mut self, missing: &[u8]) {
        if !self.manifest.is_transferable() {
            self.go_gone(
                GoneReason::Refused(RefusalReason::ContentMismatch),
                format!("{} content files missing", missing.len()),
            );
            return;
        }
        let now = self.endpoint.now();
        for &file_id in missing {
            let Some(entry) = self.manifest.get(usize::from(file_id)).cloned() else {
                continue;
            };
            if let Err(err) = self.receiver.expect(file_id, entry.size, now) {
                self.refuse_transfer(&entry.name, &err);
                return;
            }
            self.downloads.insert(file_id, entry);
        }
        tracing::info!(files = missing.len(), "downloading missing content");
        for chunk in missing.chunks(MAX_FILES_PER_PACKET) {
            self.send(
                PacketBody::RequestFile(RequestFileBody {
                    files: chunk.to_vec(),
                }),
                true,
            );
        }
        self.set_state(JoinState::DownloadingFiles);
    }

    fn on_config(&mut self, cfg: ServerCfgBody) {
        let slots: SlotVec = cfg.your_slots.iter().filter_map(|slot| PlayerSlot::new(*slot)).collect();
        if slots.len() != self.identity.len() || slots.len() != cfg.your_slots.len() {
            report_violation_to!(
                &self.observer,
                ViolationSeverity::Error,
                ViolationKind::NetworkProtocol,
                "server assigned {} slots to {} local players",
                cfg.your_slots.len(),
                self.identity.len()
            );
            self.go_gone(
                GoneReason::Refused(RefusalReason::BadPlayerCount),
                "bad slot assignment".to_owned(),
            );
            return;
        }
        self.my_slots = slots;
        for entry in cfg.roster {
            self.add_roster_entry(entry);
        }
        let keys = self.identity.public_keys();
        for (slot, key) in self.my_slots.iter().zip(&keys) {
            if self.roster[slot.as_usize()].as_ref().is_some_and(|p| p.key != *key) {
                report_violation_to!(
                    &self.observer,
                    ViolationSeverity::Warning,
                    ViolationKind::Trust,
                    "roster key of local slot {} differs from ours",
                    slot
                );
            }
        }
        tracing::info!(node = cfg.your_node, slots = ?self.my_slots, server = %cfg.server_name, "join accepted");
        self.set_state(JoinState::HasConfig);
    }

    fn add_roster_entry(&mut self, entry: RosterEntry) {
        let Some(slot) = PlayerSlot::new(entry.slot) else {
            return;
        };
        let known = self.roster[slot.as_usize()]
            .as_ref()
            .is_some_and(|p| p.key == entry.key && p.name == entry.name);
        if known {
            return;
        }
        self.roster[slot.as_usize()] = Some(RosterPlayer {
            name: entry.name.clone(),
            key: entry.key,
        });
        self.push_event(SessionEvent::PlayerJoined {
            slot,
            name: entry.name,
        });
    }

    // ###############
    // #  TRANSFERS  #
    // ###############

    fn on_gamestate_offer(&mut self, body: WillResendGamestateBody) {
        if !(self.state.is_loading_gamestate() || self.state.is_joined()) {
            return;
        }
        let now = self.endpoint.now();
        self.receiver.cancel(GAMESTATE_FILE_ID);
        self.finished_files.retain(|id| *id != GAMESTATE_FILE_ID);
        if let Err(err) = self.receiver.expect(GAMESTATE_FILE_ID, body.size, now) {
            self.refuse_transfer("gamestate", &err);
            return;
        }
        self.offer = Some(GamestateOffer {
            tic: Tic::new(body.tic),
            iteration: body.iteration,
        });
        tracing::debug!(tic = body.tic, size = body.size, iteration = body.iteration, "gamestate offered");
        self.send(PacketBody::CanReceiveGamestate, true);
        self.set_state(JoinState::AwaitingGamestateReady);
    }

    fn refuse_transfer(&mut self, what: &str, err: &TransferError) {
        report_violation_to!(
            &self.observer,
            ViolationSeverity::Error,
            ViolationKind::FileTransfer,
            "refused to receive {}: {}",
            what,
            err
        );
        self.go_gone(GoneReason::TransferFailed, format!("{}: {}", what, err));
    }

    fn on_fragment(&mut self, fragment: &FileFragmentBody) {
        let now = self.endpoint.now();
        if fragment.file_id == GAMESTATE_FILE_ID {
            let current = self
                .offer
                .is_some_and(|offer| offer.iteration == fragment.iteration);
            if !current {
                return;
            }
            let outcome = self.receiver.on_fragment(fragment, now);
            if matches!(outcome, FragmentOutcome::Accepted | FragmentOutcome::Completed) {
                self.set_state(JoinState::ReceivingGamestate);
            }
            if outcome == FragmentOutcome::Completed {
                self.finished_files.push(GAMESTATE_FILE_ID);
            }
            return;
        }
        if self.state != JoinState::DownloadingFiles || !self.downloads.contains_key(&fragment.file_id) {
            return;
        }
        if self.receiver.on_fragment(fragment, now) == FragmentOutcome::Completed {
            self.finished_files.push(fragment.file_id);
        }
    }

    fn pump_transfers(&mut self) {
        let finished = std::mem::take(&mut self.finished_files);
        for ack in self.receiver.take_acks() {
            // The ack that completes a file must arrive before FILERECEIVED.
            let reliable = finished.contains(&ack.file_id);
            self.send(PacketBody::FileAck(ack), reliable);
        }
        for file_id in finished {
            let Some((iteration, data)) = self.receiver.take_completed(file_id) else {
                continue;
            };
            if file_id == GAMESTATE_FILE_ID {
                self.finish_gamestate(iteration, data);
            } else if !self.finish_download(file_id, iteration, &data) {
                return;
            }
        }
        if self.state == JoinState::DownloadingFiles && self.downloads.is_empty() {
            tracing::info!("content downloads complete");
            self.send_client_key();
        }
        let now = self.endpoint.now();
        let stalled = self
            .receiver
            .stalled(now, self.file_config.transfer_timeout_tics)
            .into_iter()
            .any(|file_id| file_id != GAMESTATE_FILE_ID && self.downloads.contains_key(&file_id));
        if stalled {
            self.go_gone(GoneReason::TransferFailed, "content download stalled".to_owned());
        }
    }

    fn finish_download(&mut self, file_id: u8, iteration: u8, data: &[u8]) -> bool {
        let Some(entry) = self.downloads.remove(&file_id) else {
            return true;
        };
        if !entry.matches(data) {
            report_violation_to!(
                &self.observer,
                ViolationSeverity::Error,
                ViolationKind::FileTransfer,
                "downloaded {} does not match its digest",
                entry.name
            );
            self.go_gone(GoneReason::TransferFailed, format!("{} is corrupt", entry.name));
            return false;
        }
        if let Err(err) = self.store.write(&entry.name, data) {
            self.go_gone(GoneReason::TransferFailed, err.to_string());
            return false;
        }
        self.send(
            PacketBody::FileReceived(FileReceivedBody { file_id, iteration }),
            true,
        );
        tracing::debug!(name = %entry.name, bytes = data.len(), "file downloaded");
        self.push_event(SessionEvent::FileDownloaded { name: entry.name });
        true
    }

    fn finish_gamestate(&mut self, iteration: u8, data: Vec<u8>) {
        let Some(offer) = self.offer.take() else {
            return;
        };
        self.send(
            PacketBody::FileReceived(FileReceivedBody {
                file_id: GAMESTATE_FILE_ID,
                iteration,
            }),
            true,
        );
        self.send(PacketBody::ReceivedGamestate, true);
        let tic = offer.tic;
        self.pending_load = Some(GamestateCell::with_data(tic, data));
        self.buffer.reset();
        self.consistency.reset();
        self.gametic = tic;
        self.neededtic = tic;
        self.highest_seen = tic;
        self.set_state(JoinState::Joined);
        if self.has_joined {
            tracing::debug!(%tic, "resynchronized");
            return;
        }
        self.has_joined = true;
        tracing::info!(%tic, slots = ?self.my_slots, "joined");
        self.push_event(SessionEvent::Joined {
            slots: self.my_slots.to_vec(),
        });
    }

    // ###############
    // #  TICCMDS    #
    // ###############

    fn on_server_tics(&mut self, body: &ServerTicsBody) {
        if !self.state.is_joined() {
            return;
        }
        let start = expand_tic(body.start_tic, self.neededtic);
        for (offset, frame) in body.tics.iter().enumerate() {
            let tic = start + offset as u32;
            if tic < self.neededtic {
                continue;
            }
            if tic - self.gametic >= BACKUPTICS as i64 {
                break;
            }
            let outcome = self.buffer.store_frame(tic, frame.ingame, &frame.cmds, self.gametic);
            if !outcome.is_stored() && !self.buffer.has_frame(tic) {
                report_violation_to!(
                    &self.observer,
                    ViolationSeverity::Warning,
                    ViolationKind::TicSync,
                    "frame for tic {} rejected: {:?}",
                    tic,
                    outcome
                );
                break;
            }
            if tic + 1 > self.highest_seen {
                self.highest_seen = tic + 1;
            }
        }
        while self.buffer.has_frame(self.neededtic)
            && self.neededtic - self.gametic < BACKUPTICS as i64
        {
            self.neededtic += 1;
        }
        if self.highest_seen < self.neededtic {
            self.highest_seen = self.neededtic;
        }
    }

    fn send_bundle(&mut self) {
        match self.state {
            JoinState::Joined => {},
            JoinState::AwaitingChallenge
            | JoinState::DownloadingFiles
            | JoinState::AwaitingConfig
            | JoinState::HasConfig
            | JoinState::AwaitingGamestateReady
            | JoinState::ReceivingGamestate => {
                let prefix = CmdPrefix {
                    client_tic: self.local_tic.low_byte(),
                    resend_from: self.neededtic.low_byte(),
                    consistency: None,
                };
                self.send(PacketBody::NodeKeepAlive(prefix), false);
                return;
            },
            _ => return,
        }
        let last_run = self.gametic.as_u32().checked_sub(1).map(Tic::new);
        let consistency = last_run.and_then(|tic| {
            self.consistency.get(tic).map(|value| ConsistencyReport {
                tic: tic.low_byte(),
                value,
            })
        });
        let prefix = CmdPrefix {
            client_tic: self.local_tic.low_byte(),
            resend_from: self.neededtic.low_byte(),
            consistency,
        };
        let players = self.my_slots.len();
        let stamp = self.gametic.low_byte();
        let cmds: SmallVec<[Ticcmd; MAXSPLITSCREENPLAYERS]> = self.local_cmds[..players]
            .iter()
            .map(|cmd| cmd.with_latency(stamp))
            .collect();
        let missing = self.highest_seen > self.neededtic;
        let Some(body) = PacketBody::client_bundle(prefix, &cmds, missing) else {
            report_violation_to!(
                &self.observer,
                ViolationSeverity::Critical,
                ViolationKind::InternalError,
                "no bundle for {} local players",
                players
            );
            return;
        };
        let signatures: Vec<SignatureBytes> = if self.trust.sign_ticcmds {
            match codec::encode_payload(&body) {
                Ok(payload) => self.identity.sign_first(players, &payload),
                Err(err) => {
                    report_violation_to!(
                        &self.observer,
                        ViolationSeverity::Critical,
                        ViolationKind::InternalError,
                        "command bundle does not encode: {}",
                        err
                    );
                    return;
                },
            }
        } else {
            Vec::new()
        };
        self.local_tic += 1;
        if let Err(err) = self
            .endpoint
            .send(self.server, Packet::signed(body, &signatures), false)
        {
            tracing::debug!(%err, "command bundle not sent");
        }
    }

    // ###############
    // #    TRUST    #
    // ###############

    fn on_say(&mut self, body: SayBody, signatures: &[SignatureBytes]) {
        let Some(slot) = PlayerSlot::new(body.source) else {
            return;
        };
        let text = body.text.clone();
        let packet_body = PacketBody::Say(body);
        let verified = match (self.roster[slot.as_usize()].as_ref(), signatures.first()) {
            (Some(player), Some(signature)) => codec::encode_payload(&packet_body)
                .is_ok_and(|payload| verify(&player.key, &payload, signature).is_ok()),
            _ => false,
        };
        self.push_event(SessionEvent::ChatReceived { slot, text, verified });
    }

    fn on_round_challenge(&mut self, challenge: Challenge) {
        let verdict = should_sign_challenge(
            &challenge,
            self.server_addr.ipv4(),
            unix_time_now(),
            self.trust.challenge_skew_secs,
        );
        if verdict != ShouldSign::Ok {
            report_violation_to!(
                &self.observer,
                ViolationSeverity::Error,
                ViolationKind::Trust,
                "round challenge refused: {:?}",
                verdict
            );
            self.go_gone(GoneReason::TrustFailure, format!("round challenge refused: {:?}", verdict));
            return;
        }
        let signatures = self.identity.sign_all(&challenge.0);
        self.send(PacketBody::ResponseAll(ResponseAllBody { signatures }), true);
        match self.round.as_mut() {
            Some(round) => {
                round.answered(challenge);
                tracing::debug!(tic = %self.gametic, "round challenge answered");
            },
            None => {
                tracing::debug!(tic = %self.gametic, "round challenge answered outside a scheduled round");
            },
        }
    }

    fn on_round_results(&mut self, body: &ResultsAllBody) {
        let Some(challenge) = self.round.as_ref().and_then(|round| round.challenge().copied()) else {
            tracing::debug!("round results without an answered challenge ignored");
            return;
        };
        let mut failure = None;
        for entry in &body.entries {
            let key = PlayerSlot::new(entry.slot)
                .and_then(|slot| self.roster[slot.as_usize()].as_ref())
                .map(|player| player.key);
            let valid = key.is_some_and(|key| verify(&key, &challenge.0, &entry.signature).is_ok());
            if !valid {
                failure = Some(format!("result for slot {} does not verify", entry.slot));
                break;
            }
        }
        if failure.is_none() {
            if let Some(slot) = self
                .my_slots
                .iter()
                .find(|slot| !body.entries.iter().any(|entry| entry.slot == slot.as_u8()))
            {
                failure = Some(format!("results omit local slot {}", slot));
            }
        }
        if let Some(message) = failure {
            report_violation_to!(
                &self.observer,
                ViolationSeverity::Error,
                ViolationKind::Trust,
                "round results rejected: {}",
                message
            );
            self.go_gone(GoneReason::TrustFailure, message);
            return;
        }
        if let Some(round) = self.round.as_mut() {
            round.verified();
        }
        tracing::debug!(players = body.entries.len(), "round results verified");
        self.push_event(SessionEvent::ChallengeResultsVerified {
            players: body.entries.len(),
        });
    }

    fn check_round(&mut self) {
        let now = self.gametic;
        let joined = self.state.is_joined();
        let Some(round) = self.round.as_mut() else {
            return;
        };
        round.observe(now, joined);
        if round.missed_cutoff(now) {
            report_violation_to!(
                &self.observer,
                ViolationSeverity::Error,
                ViolationKind::Trust,
                "no verified round results by tic {}",
                now
            );
            self.go_gone(GoneReason::TrustFailure, "round results never arrived".to_owned());
            return;
        }
        if round.is_finished(now) {
            self.round = None;
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
    use crate::{LocalIdentity, SessionBuilder};
    use parking_lot::Mutex;
    use std::net::SocketAddr;

    #[derive(Clone, Default)]
    struct Recorder {
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl Transport<SocketAddr> for Recorder {
        fn send_to(&mut self, datagram: &[u8], _addr: &SocketAddr) {
            self.sent.lock().push(datagram.to_vec());
        }

        fn receive_all_datagrams(&mut self) -> Vec<(SocketAddr, Vec<u8>)> {
            Vec::new()
        }
    }

    fn client(recorder: &Recorder) -> ClientSession<SocketAddr> {
        SessionBuilder::new()
            .with_identity(LocalIdentity::generate(&["p1"]).unwrap())
            .start_client(recorder.clone(), "127.0.0.1:5029".parse().unwrap())
            .unwrap()
    }

    #[test]
    fn first_update_asks_for_server_info() {
        let recorder = Recorder::default();
        let mut client = client(&recorder);
        assert_eq!(client.state(), JoinState::Unknown);
        client.net_update();
        assert_eq!(client.state(), JoinState::InfoQueried);
        let events: Vec<_> = client.events().collect();
        assert_eq!(
            events,
            vec![SessionEvent::JoinStateChanged {
                state: JoinState::InfoQueried
            }]
        );
        let sent = recorder.sent.lock();
        let first = codec::decode(&sent[0]).unwrap();
        assert!(matches!(first.body, PacketBody::AskInfo(_)));
    }

    #[test]
    fn nothing_runs_before_joining() {
        let recorder = Recorder::default();
        let mut client = client(&recorder);
        client.net_update();
        assert!(client.try_run_tics(Tic::new(10)).unwrap().is_empty());
        assert_eq!(client.current_tic(), Tic::ZERO);
        assert!(matches!(client.say(0, "hi"), Err(NetsyncError::NotJoined)));
    }

    #[test]
    fn quitting_is_terminal() {
        let recorder = Recorder::default();
        let mut client = client(&recorder);
        client.net_update();
        client.quit();
        assert_eq!(client.state(), JoinState::Gone(GoneReason::Quit));
        assert!(matches!(client.try_run_tics(Tic::new(1)), Err(NetsyncError::NotJoined)));
        let disconnected = client
            .events()
            .any(|event| matches!(event, SessionEvent::Disconnected { reason: GoneReason::Quit, .. }));
        assert!(disconnected);
        client.quit();
        assert_eq!(client.events().count(), 0);
    }

    #[test]
    fn submit_rejects_unknown_splits() {
        let recorder = Recorder::default();
        let mut client = client(&recorder);
        assert!(client.submit_local_ticcmd(0, Ticcmd::NEUTRAL).is_ok());
        assert!(client.submit_local_ticcmd(1, Ticcmd::NEUTRAL).is_err());
    }

    #[test]
    fn info_is_asked_again_after_the_retry_interval() {
        let recorder = Recorder::default();
        let mut client = client(&recorder);
        let retry = TicSyncConfig::default().ask_info_retry_tics;
        for _ in 0..=retry {
            client.net_update();
        }
        let asks = recorder
            .sent
            .lock()
            .iter()
            .filter(|bytes| matches!(codec::decode(bytes).map(|p| p.body), Ok(PacketBody::AskInfo(_))))
            .count();
        assert_eq!(asks, 2);
    }
}

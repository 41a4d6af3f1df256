//! The authoritative end of a session.
//!
//! A [`ServerSession`] owns the node directory and is the only peer that
//! builds tics. Every `net_update()` runs one pump tic:
//!
//! ```text
//! poll ─► handle packets ─► close departed nodes ─► gamestate offers
//!      ─► file fragments ─► ping check ─► round re-proof
//!      ─► SERVERTICS + PING ─► tick ─► flush
//! ```
//!
//! `try_run_tics()` is the simulation step. It asks the game to save a
//! gamestate for every node that needs one, then builds each tic from the
//! commands received so far.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use smallvec::SmallVec;
use web_time::Instant;

use crate::directory::{Directory, NodeHandle, NodeStatus, SlotVec};
use crate::error::NetsyncError;
use crate::files::manifest::ContentManifest;
use crate::files::sender::{FileSender, ReceivedOutcome};
use crate::files::store::ContentStore;
use crate::files::GAMESTATE_FILE_ID;
use crate::gamestate_cell::GamestateCell;
use crate::network::codec;
use crate::network::endpoint::{Endpoint, Incoming, Source};
use crate::network::messages::{
    AskInfoBody, Challenge, ChallengeBody, ClientJoinBody, ClientKeyBody, FileReceivedBody,
    JoinEligibility, KickBody, MoreFilesNeededBody, Packet, PacketBody, PingBody,
    PlayerDepartedBody, PlayerInfoBody, PublicKeyBytes, RequestFileBody, ResponseAllBody,
    ResultsAllBody, RosterEntry, RoundResult, SayBody, ServerCfgBody, ServerInfo,
    ServerRefuseBody, ServerTicsBody, SignatureBytes, TellFilesNeededBody, TicFrame,
    WillResendGamestateBody, MAX_REASON_LENGTH,
};
use crate::network::network_stats::NetworkStats;
use crate::network::packet_kind::PacketKind;
use crate::sessions::builder::SessionParts;
use crate::sessions::config::{
    BuildInfo, FileTransferConfig, ReliabilityConfig, ServerSettings, TicSyncConfig, TrustConfig,
};
use crate::sessions::event_drain::EventDrain;
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::tic_buffer::{expand_tic, ConsistencyLog, TicBuffer};
use crate::ticcmd::Ticcmd;
use crate::trust::{build_challenge, unix_time_now, verify, verify_all, LocalIdentity, ServerRound};
use crate::{
    report_violation_to, InputVec, KickReason, NodeId, PeerAddress, PlayerSlot, RefusalReason,
    SessionEvent, Tic, TicRequest, Transport, BACKUPTICS, MAXGENTLEMENDELAY, MAXPLAYERS,
    MAXSPLITSCREENPLAYERS, MAX_CHAT_LENGTH, MAX_PACKET_LENGTH, MAX_PREDICT_TICS,
};

const MAX_EVENT_QUEUE_SIZE: usize = 256;
/// Commands buffered per remote player before the oldest is dropped.
const MAX_QUEUED_CMDS: usize = 24;
/// Room left in `SERVERINFO` for everything but the manifest page.
const INFO_PAGE_BUDGET: usize = MAX_PACKET_LENGTH - 256;
const FILES_PAGE_BUDGET: usize = MAX_PACKET_LENGTH - 64;
/// `SERVERTICS` payload bytes before the first frame: start tic and frame count.
const TICS_PAYLOAD_BASE: usize = 1 + 8;
/// Bytes of one frame besides its commands: mask and command count.
const FRAME_OVERHEAD: usize = 2 + 8;
/// Furthest `supposedtics` may run ahead of `nettics` while low-byte tics stay unambiguous.
const MAX_UNCONFIRMED_TICS: i64 = 64;

#[derive(Debug)]
struct ServerPlayer {
    name: String,
    key: PublicKeyBytes,
    join_tic: Tic,
    queue: VecDeque<Ticcmd>,
    last_cmd: Ticcmd,
    missing_run: u32,
    stalled: bool,
}

/// Where the command a player ran with came from.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum CmdSource {
    Received { lag: u8 },
    Extrapolated,
    Stalled { started: bool, kick: bool },
}

impl ServerPlayer {
    fn new(name: String, key: PublicKeyBytes, join_tic: Tic) -> Self {
        Self {
            name,
            key,
            join_tic,
            queue: VecDeque::new(),
            last_cmd: Ticcmd::NEUTRAL,
            missing_run: 0,
            stalled: false,
        }
    }

    fn take_cmd(&mut self, tic: Tic, stall_kick_tics: u32) -> (Ticcmd, CmdSource) {
        if let Some(cmd) = self.queue.pop_front() {
            let lag = tic.low_byte().wrapping_sub(cmd.latency).min(MAX_PREDICT_TICS);
            let cmd = cmd.with_latency(lag);
            self.last_cmd = cmd;
            self.missing_run = 0;
            self.stalled = false;
            return (cmd, CmdSource::Received { lag });
        }
        self.missing_run = self.missing_run.saturating_add(1);
        if self.missing_run <= MAXGENTLEMENDELAY {
            return (self.last_cmd, CmdSource::Extrapolated);
        }
        let started = !self.stalled;
        self.stalled = true;
        let kick = self.missing_run - MAXGENTLEMENDELAY >= stall_kick_tics;
        (Ticcmd::NEUTRAL, CmdSource::Stalled { started, kick })
    }

    fn roster_entry(&self, slot: PlayerSlot, node: NodeId, split: u8) -> RosterEntry {
        RosterEntry {
            slot: slot.as_u8(),
            node: node.as_u8(),
            split,
            name: self.name.clone(),
            key: self.key,
            join_tic: self.join_tic.as_u32(),
        }
    }
}

/// A saved gamestate on its way to one node.
#[derive(Debug, Clone)]
struct GamestateOffer {
    tic: Tic,
    data: Vec<u8>,
    iteration: u8,
    resync: bool,
}

#[derive(Debug, Clone)]
enum NodePhase {
    /// Between `CLIENTKEY` and an accepted `CLIENTJOIN`. Files may be downloading.
    Handshake,
    /// Configured; the next `try_run_tics()` asks the game for a gamestate.
    NeedsGamestate { resync: bool },
    /// Waiting for the game to fill `cell`.
    Saving {
        cell: GamestateCell,
        tic: Tic,
        resync: bool,
    },
    /// `WILLRESENDGAMESTATE` sent, waiting for `CANRECEIVEGAMESTATE`.
    Offered(GamestateOffer),
    /// Gamestate fragments are streaming.
    Streaming {
        offer: GamestateOffer,
        delivered: bool,
    },
    Joined,
    /// Removed; the node id is released once its last reliable packet is acked.
    Leaving { since: Tic, deadline: Tic },
}

impl NodePhase {
    const fn is_configured(&self) -> bool {
        !matches!(self, Self::Handshake | Self::Leaving { .. })
    }
}

#[derive(Debug)]
struct ServerNode {
    handle: NodeHandle,
    phase: NodePhase,
    keys: Vec<PublicKeyBytes>,
    challenge: Option<(Challenge, Tic)>,
    sender: FileSender,
    /// First tic the node lacks.
    nettics: Tic,
    /// First tic not yet sent to the node.
    supposedtics: Tic,
    last_client_tic: Option<u8>,
    resync_attempts: u32,
    lag: u8,
    high_ping_since: Option<Tic>,
}

impl ServerNode {
    fn new(handle: NodeHandle, keys: Vec<PublicKeyBytes>, files: &FileTransferConfig) -> Self {
        Self {
            handle,
            phase: NodePhase::Handshake,
            keys,
            challenge: None,
            sender: FileSender::new(files),
            nettics: Tic::ZERO,
            supposedtics: Tic::ZERO,
            last_client_tic: None,
            resync_attempts: 0,
            lag: 0,
            high_ping_since: None,
        }
    }
}

fn node_in(nodes: &mut [Option<ServerNode>], handle: NodeHandle) -> Option<&mut ServerNode> {
    nodes
        .get_mut(handle.id.as_usize())?
        .as_mut()
        .filter(|node| node.handle == handle)
}

fn truncated(text: &str, max: usize) -> String {
    let mut end = text.len().min(max);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_owned()
}

/// A [`ServerSession`] hosts a race: it accepts joins, builds every tic from
/// the commands its clients send and broadcasts the result.
///
/// The server never waits for a slow client. Missing commands are
/// extrapolated, then replaced by neutral input, and a client that stays
/// silent is eventually kicked.
pub struct ServerSession<A: PeerAddress> {
    endpoint: Endpoint<A>,
    build: BuildInfo,
    settings: ServerSettings,
    reliability: ReliabilityConfig,
    tic_sync: TicSyncConfig,
    file_config: FileTransferConfig,
    trust: TrustConfig,
    identity: LocalIdentity,
    manifest: ContentManifest,
    store: Box<dyn ContentStore>,
    observer: Option<Arc<dyn ViolationObserver>>,
    rng: StdRng,

    buffer: TicBuffer,
    consistency: ConsistencyLog,
    /// Next tic to build. Equal to maketic: the server runs every tic it builds.
    gametic: Tic,
    ingame: u16,
    players: [Option<ServerPlayer>; MAXPLAYERS],
    nodes: Vec<Option<ServerNode>>,
    local_slots: SlotVec,
    local_cmds: [Option<Ticcmd>; MAXSPLITSCREENPLAYERS],

    round: Option<ServerRound>,
    round_targets: Vec<NodeHandle>,

    events: VecDeque<SessionEvent>,
    last_ping: Tic,
    shut_down: bool,
}

impl<A: PeerAddress> std::fmt::Debug for ServerSession<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSession")
            .field("gametic", &self.gametic)
            .field("ingame", &format_args!("{:#06x}", self.ingame))
            .field("endpoint", &self.endpoint)
            .field("shut_down", &self.shut_down)
            .finish_non_exhaustive()
    }
}

impl<A: PeerAddress> ServerSession<A> {
    /// Creates a server. Use [`SessionBuilder::start_server`](crate::SessionBuilder::start_server).
    pub(crate) fn new(parts: SessionParts, transport: Box<dyn Transport<A>>) -> Result<Self, NetsyncError> {
        let mut session = Self {
            endpoint: Endpoint::new(transport, parts.reliability),
            build: parts.build,
            settings: parts.settings,
            reliability: parts.reliability,
            tic_sync: parts.tic_sync,
            file_config: parts.file_transfer,
            trust: parts.trust,
            identity: parts.identity,
            manifest: parts.manifest,
            store: parts.store,
            observer: parts.observer,
            rng: parts.rng,
            buffer: TicBuffer::new(),
            consistency: ConsistencyLog::new(),
            gametic: Tic::ZERO,
            ingame: 0,
            players: std::array::from_fn(|_| None),
            nodes: (0..crate::MAXNETNODES).map(|_| None).collect(),
            local_slots: SlotVec::new(),
            local_cmds: [None; MAXSPLITSCREENPLAYERS],
            round: None,
            round_targets: Vec::new(),
            events: VecDeque::new(),
            last_ping: Tic::ZERO,
            shut_down: false,
        };
        session.bind_local_players()?;
        tracing::info!(
            local_players = session.local_slots.len(),
            files = session.manifest.len(),
            "server started"
        );
        Ok(session)
    }

    fn bind_local_players(&mut self) -> Result<(), NetsyncError> {
        let local = self.endpoint.directory().local();
        let keys = self.identity.public_keys();
        let names: Vec<String> = self.identity.names().map(str::to_owned).collect();
        for (split, (name, key)) in names.into_iter().zip(keys).enumerate() {
            let slot = self
                .endpoint
                .directory()
                .free_slot()
                .ok_or_else(|| NetsyncError::InvalidRequest {
                    info: "no free slot for a local player".to_owned(),
                })?;
            self.endpoint
                .directory_mut()
                .bind_player_to_node(slot, local, split as u8)?;
            self.players[slot.as_usize()] = Some(ServerPlayer::new(name, key, Tic::ZERO));
            self.ingame |= slot.mask_bit();
            self.local_slots.push(slot);
        }
        Ok(())
    }

    // ###############
    // # PUBLIC API  #
    // ###############

    /// Stores the command of local player `split` for the next tic. The last
    /// submitted command is reused until a new one arrives.
    ///
    /// # Errors
    /// - Returns [`InvalidRequest`] if `split` is not a local player.
    ///
    /// [`InvalidRequest`]: NetsyncError::InvalidRequest
    pub fn submit_local_ticcmd(&mut self, split: usize, cmd: Ticcmd) -> Result<(), NetsyncError> {
        if split >= self.local_slots.len() {
            return Err(NetsyncError::InvalidRequest {
                info: format!("the server has {} local players", self.local_slots.len()),
            });
        }
        self.local_cmds[split] = Some(cmd);
        Ok(())
    }

    /// Records the simulation's consistency value for `tic`. Clients report
    /// theirs; a mismatch resynchronizes the client.
    pub fn record_consistency(&mut self, tic: Tic, value: u16) {
        self.consistency.record(tic, value);
    }

    /// Builds and runs tics up to (not including) `target`.
    ///
    /// The returned requests MUST be fulfilled in order. A `SaveGamestate`
    /// comes first whenever a node is joining or resynchronizing.
    ///
    /// # Errors
    /// - Returns [`InvalidRequest`] after [`shutdown`](Self::shutdown).
    ///
    /// [`InvalidRequest`]: NetsyncError::InvalidRequest
    pub fn try_run_tics(&mut self, target: Tic) -> Result<Vec<TicRequest>, NetsyncError> {
        if self.shut_down {
            return Err(NetsyncError::InvalidRequest {
                info: "the server has shut down".to_owned(),
            });
        }
        let mut requests = Vec::new();
        self.schedule_gamestate_saves(&mut requests);
        let mut stalled: SmallVec<[NodeHandle; 4]> = SmallVec::new();
        while self.gametic < target {
            requests.push(self.make_tic(&mut stalled));
        }
        for node in stalled {
            self.kick_node(node, KickReason::Timeout, "stopped sending input");
        }
        Ok(requests)
    }

    /// Runs one pump tic: receives and handles packets, drives transfers and
    /// the round re-proof, sends tics and flushes acknowledgments.
    pub fn net_update(&mut self) {
        self.endpoint.poll();
        for incoming in self.endpoint.take_incoming() {
            self.handle_incoming(incoming);
        }
        self.close_departed_nodes();
        self.advance_gamestate_offers();
        self.pump_file_senders();
        self.check_pings();
        self.run_round();
        if !self.shut_down {
            self.send_server_tics();
            self.send_pings();
        }
        self.endpoint.tick();
        self.endpoint.flush();
    }

    /// Starts a round re-proof at `start`. Every joined node must answer the
    /// challenge within `CHALLENGEALL_KICKUNRESPONSIVE` tics.
    pub fn begin_round(&mut self, start: Tic) {
        tracing::debug!(%start, "round re-proof scheduled");
        self.round = Some(ServerRound::new(start));
        self.round_targets.clear();
    }

    /// Removes a remote node, telling it why.
    ///
    /// # Errors
    /// - Returns [`InvalidNode`] if `node` is the local node or not in use.
    ///
    /// [`InvalidNode`]: NetsyncError::InvalidNode
    pub fn kick(&mut self, node: NodeId, reason: KickReason, message: &str) -> Result<(), NetsyncError> {
        let handle = self
            .endpoint
            .directory()
            .handle(node)
            .filter(|handle| handle.id != NodeId::SELF)
            .ok_or(NetsyncError::InvalidNode { node })?;
        self.kick_node(handle, reason, message);
        Ok(())
    }

    /// Sends a chat line from local player `split` to every joined node.
    ///
    /// # Errors
    /// - Returns [`InvalidRequest`] if `split` is not a local player or the text is too long.
    ///
    /// [`InvalidRequest`]: NetsyncError::InvalidRequest
    pub fn say(&mut self, split: usize, text: &str) -> Result<(), NetsyncError> {
        let slot = *self.local_slots.get(split).ok_or_else(|| NetsyncError::InvalidRequest {
            info: format!("the server has {} local players", self.local_slots.len()),
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
        let packet = Packet::signed(body, &[signature]);
        for handle in self.joined_handles() {
            self.send_packet(handle, packet.clone(), true);
        }
        Ok(())
    }

    /// Tells every node the server is going away. Tics are no longer built or
    /// sent. Follow with [`wait_all_acks`](Self::wait_all_acks) before dropping.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        tracing::info!(gametic = %self.gametic, "server shutting down");
        self.shut_down = true;
        for handle in self.node_handles() {
            self.send(handle, PacketBody::ServerShutdown, true);
        }
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

    /// The next tic the server will build.
    #[must_use]
    pub const fn current_tic(&self) -> Tic {
        self.gametic
    }

    /// Bitmask of the player slots in game.
    #[must_use]
    pub const fn ingame_mask(&self) -> u16 {
        self.ingame
    }

    /// The slots of the server's own players, in splitscreen order.
    #[must_use]
    pub fn local_slots(&self) -> &[PlayerSlot] {
        &self.local_slots
    }

    /// The name of the player in `slot`.
    #[must_use]
    pub fn player_name(&self, slot: PlayerSlot) -> Option<&str> {
        self.players[slot.as_usize()].as_ref().map(|p| p.name.as_str())
    }

    /// Remote nodes that finished joining, lowest id first.
    #[must_use]
    pub fn joined_nodes(&self) -> Vec<NodeId> {
        self.joined_handles().into_iter().map(|handle| handle.id).collect()
    }

    /// The node and player directory.
    #[must_use]
    pub fn directory(&self) -> &Directory<A> {
        self.endpoint.directory()
    }

    /// Connection statistics for a remote node.
    ///
    /// # Errors
    /// - Returns [`InvalidNode`] if `node` is not in use.
    ///
    /// [`InvalidNode`]: NetsyncError::InvalidNode
    pub fn network_stats(&self, node: NodeId) -> Result<NetworkStats, NetsyncError> {
        let handle = self
            .endpoint
            .directory()
            .handle(node)
            .ok_or(NetsyncError::InvalidNode { node })?;
        let mut stats = self
            .endpoint
            .stats(handle)
            .ok_or(NetsyncError::InvalidNode { node })?;
        if let Some(entry) = self.nodes[node.as_usize()].as_ref() {
            stats.lag_tics = entry.lag;
            stats.nettics = matches!(entry.phase, NodePhase::Joined).then_some(entry.nettics);
        }
        Ok(stats)
    }

    /// Returns the violation observer, if one was configured.
    #[must_use]
    pub fn violation_observer(&self) -> Option<&Arc<dyn ViolationObserver>> {
        self.observer.as_ref()
    }

    // ###############
    // #   SENDING   #
    // ###############

    fn send(&mut self, node: NodeHandle, body: PacketBody, reliable: bool) {
        self.send_packet(node, Packet::new(body), reliable);
    }

    fn send_packet(&mut self, node: NodeHandle, packet: Packet, reliable: bool) {
        let kind = packet.kind();
        if let Err(err) = self.endpoint.send(node, packet, reliable) {
            report_violation_to!(
                &self.observer,
                ViolationSeverity::Warning,
                ViolationKind::Reliability,
                "{} to {} not sent: {}",
                kind,
                node.id,
                err
            );
        }
    }

    fn send_unconnected(&mut self, address: &A, body: PacketBody) {
        let kind = body.kind();
        if let Err(err) = self.endpoint.send_unconnected(address, Packet::new(body)) {
            report_violation_to!(
                &self.observer,
                ViolationSeverity::Warning,
                ViolationKind::NetworkProtocol,
                "{} to {:?} not sent: {}",
                kind,
                address,
                err
            );
        }
    }

    fn push_event(&mut self, event: SessionEvent) {
        self.events.push_back(event);
        while self.events.len() > MAX_EVENT_QUEUE_SIZE {
            self.events.pop_front();
        }
    }

    fn node_handles(&self) -> Vec<NodeHandle> {
        self.nodes.iter().flatten().map(|node| node.handle).collect()
    }

    fn joined_handles(&self) -> Vec<NodeHandle> {
        self.nodes
            .iter()
            .flatten()
            .filter(|node| matches!(node.phase, NodePhase::Joined))
            .map(|node| node.handle)
            .collect()
    }

    fn configured_handles(&self) -> Vec<NodeHandle> {
        self.nodes
            .iter()
            .flatten()
            .filter(|node| node.phase.is_configured())
            .map(|node| node.handle)
            .collect()
    }

    fn roster(&self) -> Vec<RosterEntry> {
        let directory = self.endpoint.directory();
        PlayerSlot::all()
            .filter_map(|slot| {
                let player = self.players[slot.as_usize()].as_ref()?;
                let binding = directory.binding(slot)?;
                Some(player.roster_entry(slot, binding.node.id, binding.split))
            })
            .collect()
    }

    // ###############
    // #  HANDLERS   #
    // ###############

    fn handle_incoming(&mut self, incoming: Incoming<A>) {
        match incoming.source {
            Source::Unknown(address) => self.handle_unconnected(address, incoming.packet),
            Source::Node(handle) => {
                if self.nodes[handle.id.as_usize()]
                    .as_ref()
                    .is_some_and(|node| node.handle == handle)
                {
                    self.handle_node_packet(handle, incoming.packet);
                }
            },
        }
    }

    fn handle_unconnected(&mut self, address: A, packet: Packet) {
        match &packet.body {
            PacketBody::AskInfo(AskInfoBody { echo_time, .. }) => {
                self.reply_server_info(&address, *echo_time);
            },
            PacketBody::AskInfoViaMs(body) => match A::parse_relayed(&body.relay_addr) {
                Some(asker) => self.reply_server_info(&asker, body.echo_time),
                None => report_violation_to!(
                    &self.observer,
                    ViolationSeverity::Warning,
                    ViolationKind::NetworkProtocol,
                    "relayed address {:?} does not parse",
                    body.relay_addr
                ),
            },
            PacketBody::TellFilesNeeded(body) => {
                let reply = self.files_page(*body);
                self.send_unconnected(&address, reply);
            },
            PacketBody::ClientKey(body) => {
                let body = body.clone();
                self.accept_client_key(address, &packet, body);
            },
            _ => tracing::trace!(?address, kind = %packet.kind(), "unexpected packet from unknown address"),
        }
    }

    fn handle_node_packet(&mut self, handle: NodeHandle, packet: Packet) {
        let kind = packet.kind();
        if kind.is_client_cmd() {
            self.handle_bundle(handle, &packet);
            return;
        }
        match packet.body {
            PacketBody::NodeTimeout => self.drop_node(handle, KickReason::Timeout),
            PacketBody::ClientQuit => self.drop_node(handle, KickReason::Quit),
            PacketBody::AskInfo(body) => {
                if let Some(address) = self.endpoint.directory().address(handle.id).cloned() {
                    self.reply_server_info(&address, body.echo_time);
                }
            },
            PacketBody::TellFilesNeeded(body) => {
                let reply = self.files_page(body);
                self.send(handle, reply, false);
            },
            PacketBody::ClientKey(body) => self.rechallenge(handle, body),
            PacketBody::ClientJoin(body) => self.handle_join(handle, &body),
            PacketBody::RequestFile(body) => self.start_file_transfers(handle, &body),
            PacketBody::FileAck(ack) => {
                let now = self.endpoint.now();
                if let Some(node) = node_in(&mut self.nodes, handle) {
                    node.sender.on_ack(&ack, now);
                }
            },
            PacketBody::FileReceived(body) => self.handle_file_received(handle, body),
            PacketBody::CanReceiveGamestate => self.start_gamestate_stream(handle),
            PacketBody::ReceivedGamestate => self.finish_join(handle),
            PacketBody::ResponseAll(body) => self.handle_round_response(handle, &body),
            PacketBody::Say(body) => self.handle_say(handle, body, &packet.signatures),
            _ => report_violation_to!(
                &self.observer,
                ViolationSeverity::Warning,
                ViolationKind::NetworkProtocol,
                "unexpected {} from {}",
                kind,
                handle.id
            ),
        }
    }

    // ###############
    // # DISCOVERY   #
    // ###############

    fn eligibility(&self, joining_players: usize) -> JoinEligibility {
        if !self.settings.allow_joins {
            JoinEligibility::JoinsDisabled
        } else if self.endpoint.directory().player_count() + joining_players
            > usize::from(self.settings.max_players)
        {
            JoinEligibility::Full
        } else {
            JoinEligibility::Joinable
        }
    }

    fn reply_server_info(&mut self, address: &A, echo_time: u64) {
        let (files, more_files) = self.manifest.page(0, INFO_PAGE_BUDGET);
        let info = ServerInfo {
            version: self.build.version,
            subversion: self.build.subversion,
            application: self.build.application.clone(),
            player_count: self.endpoint.directory().player_count() as u8,
            max_players: self.settings.max_players,
            eligibility: self.eligibility(1),
            content_checksum: self.manifest.checksum(),
            server_name: self.settings.server_name.clone(),
            echo_time,
            file_count: self.manifest.len() as u16,
            files,
            more_files,
        };
        tracing::trace!(?address, "server info sent");
        self.send_unconnected(address, PacketBody::ServerInfo(Box::new(info)));
    }

    fn files_page(&self, request: TellFilesNeededBody) -> PacketBody {
        let (files, more) = self.manifest.page(usize::from(request.first), FILES_PAGE_BUDGET);
        PacketBody::MoreFilesNeeded(MoreFilesNeededBody {
            first: request.first,
            more,
            files,
        })
    }

    // ###############
    // #    JOIN     #
    // ###############

    fn accept_client_key(&mut self, address: A, packet: &Packet, body: ClientKeyBody) {
        let players = body.keys.len();
        let refusal = if players == 0 || players > MAXSPLITSCREENPLAYERS {
            Some(RefusalReason::BadPlayerCount)
        } else {
            match self.eligibility(players) {
                JoinEligibility::Joinable => None,
                JoinEligibility::JoinsDisabled => Some(RefusalReason::JoinsDisabled),
                JoinEligibility::Full => Some(RefusalReason::Full),
            }
        };
        if let Some(reason) = refusal {
            tracing::info!(?address, %reason, "join refused");
            self.send_unconnected(&address, refuse_body(reason, &reason.to_string()));
            return;
        }
        let handle = match self.endpoint.open_node_from(address.clone(), packet) {
            Ok(handle) => handle,
            Err(err) => {
                tracing::info!(?address, %err, "no node for joining peer");
                let reason = RefusalReason::Full;
                self.send_unconnected(&address, refuse_body(reason, &reason.to_string()));
                return;
            },
        };
        tracing::debug!(node = %handle.id, ?address, players, "client key accepted");
        self.nodes[handle.id.as_usize()] = Some(ServerNode::new(handle, body.keys, &self.file_config));
        self.send_join_challenge(handle);
    }

    fn rechallenge(&mut self, handle: NodeHandle, body: ClientKeyBody) {
        let Some(node) = node_in(&mut self.nodes, handle) else {
            return;
        };
        if !matches!(node.phase, NodePhase::Handshake) {
            return;
        }
        if body.keys.is_empty() || body.keys.len() > MAXSPLITSCREENPLAYERS {
            self.refuse_node(handle, RefusalReason::BadPlayerCount);
            return;
        }
        node.keys = body.keys;
        self.send_join_challenge(handle);
    }

    fn send_join_challenge(&mut self, handle: NodeHandle) {
        let now = self.endpoint.now();
        let challenge = build_challenge(unix_time_now(), self.trust.challenge_ip(), &mut self.rng);
        if let Some(node) = node_in(&mut self.nodes, handle) {
            node.challenge = Some((challenge, now));
        }
        self.send(handle, PacketBody::ServerChallenge(ChallengeBody { challenge }), true);
    }

    fn join_refusal(&self, node: &ServerNode, body: &ClientJoinBody) -> Option<RefusalReason> {
        if !self
            .build
            .compatible_with(body.version, body.subversion, &body.application)
        {
            return Some(RefusalReason::VersionMismatch);
        }
        if body.content_checksum != self.manifest.checksum() {
            return Some(RefusalReason::ContentMismatch);
        }
        let players = body.names.len();
        if players == 0
            || players > MAXSPLITSCREENPLAYERS
            || players != node.keys.len()
            || body.names.iter().any(String::is_empty)
        {
            return Some(RefusalReason::BadPlayerCount);
        }
        let Some((challenge, issued)) = node.challenge else {
            return Some(RefusalReason::ChallengeExpired);
        };
        if self.endpoint.now() - issued > i64::from(self.trust.join_challenge_tics) {
            return Some(RefusalReason::ChallengeExpired);
        }
        if let Err(err) = verify_all(&node.keys, &challenge.0, &body.signatures) {
            report_violation_to!(
                &self.observer,
                ViolationSeverity::Warning,
                ViolationKind::Trust,
                "join signatures from {} rejected: {}",
                node.handle.id,
                err
            );
            return Some(RefusalReason::BadSignature);
        }
        match self.eligibility(players) {
            JoinEligibility::Joinable => None,
            JoinEligibility::JoinsDisabled => Some(RefusalReason::JoinsDisabled),
            JoinEligibility::Full => Some(RefusalReason::Full),
        }
    }

    fn handle_join(&mut self, handle: NodeHandle, body: &ClientJoinBody) {
        let refusal = match self.nodes[handle.id.as_usize()].as_ref() {
            Some(node) if matches!(node.phase, NodePhase::Handshake) => self.join_refusal(node, body),
            _ => return,
        };
        if let Some(reason) = refusal {
            self.refuse_node(handle, reason);
            return;
        }
        let keys = self.nodes[handle.id.as_usize()]
            .as_ref()
            .map(|node| node.keys.clone())
            .unwrap_or_default();
        let mut slots = SlotVec::new();
        for (split, (name, key)) in body.names.iter().zip(keys).enumerate() {
            let free = self.endpoint.directory().free_slot();
            let bound = match free {
                Some(slot) => self
                    .endpoint
                    .directory_mut()
                    .bind_player_to_node(slot, handle, split as u8)
                    .is_ok()
                    .then_some(slot),
                None => None,
            };
            let Some(slot) = bound else {
                if self.endpoint.directory_mut().unbind_players(handle).is_ok() {
                    for slot in &slots {
                        self.players[slot.as_usize()] = None;
                    }
                }
                self.refuse_node(handle, RefusalReason::Full);
                return;
            };
            self.players[slot.as_usize()] = Some(ServerPlayer::new(name.clone(), key, self.gametic));
            slots.push(slot);
        }

        let cfg = ServerCfgBody {
            version: self.build.version,
            subversion: self.build.subversion,
            commit: self.build.commit.clone(),
            server_players: self.local_slots.len() as u8,
            game_state: self.settings.game_state,
            game_mode: self.settings.game_mode,
            modified: self.settings.modified,
            max_players: self.settings.max_players,
            allow_joins: self.settings.allow_joins,
            content_checksum: self.manifest.checksum(),
            server_name: self.settings.server_name.clone(),
            your_node: handle.id.as_u8(),
            your_slots: slots.iter().map(|slot| slot.as_u8()).collect(),
            roster: self.roster(),
        };
        if let Some(node) = node_in(&mut self.nodes, handle) {
            node.phase = NodePhase::NeedsGamestate { resync: false };
            node.challenge = None;
        }
        tracing::info!(node = %handle.id, ?slots, "join accepted");
        self.send(handle, PacketBody::ServerCfg(Box::new(cfg)), true);
    }

    fn refuse_node(&mut self, handle: NodeHandle, reason: RefusalReason) {
        tracing::info!(node = %handle.id, %reason, "join refused");
        self.send(handle, refuse_body(reason, &reason.to_string()), true);
        self.enter_leaving(handle);
    }

    fn start_file_transfers(&mut self, handle: NodeHandle, body: &RequestFileBody) {
        let now = self.endpoint.now();
        let mut failure = None;
        for &index in &body.files {
            let Some(entry) = self.manifest.get(usize::from(index)) else {
                failure = Some(format!("no file with index {}", index));
                break;
            };
            let data = match self.store.read(&entry.name) {
                Ok(data) => data,
                Err(err) => {
                    failure = Some(err.to_string());
                    break;
                },
            };
            let Some(node) = node_in(&mut self.nodes, handle) else {
                return;
            };
            if !matches!(node.phase, NodePhase::Handshake) {
                return;
            }
            if let Err(err) = node.sender.start(index, data, now) {
                failure = Some(err.to_string());
                break;
            }
        }
        if let Some(message) = failure {
            report_violation_to!(
                &self.observer,
                ViolationSeverity::Warning,
                ViolationKind::FileTransfer,
                "file request from {} refused: {}",
                handle.id,
                message
            );
            self.send(handle, refuse_body(RefusalReason::ContentMismatch, &message), true);
            self.enter_leaving(handle);
        }
    }

    fn handle_file_received(&mut self, handle: NodeHandle, body: FileReceivedBody) {
        let Some(node) = node_in(&mut self.nodes, handle) else {
            return;
        };
        let outcome = node.sender.on_received(body.file_id, body.iteration);
        if body.file_id != GAMESTATE_FILE_ID {
            tracing::debug!(node = %handle.id, file_id = body.file_id, ?outcome, "file transfer closed");
            return;
        }
        match (&mut node.phase, outcome) {
            (NodePhase::Streaming { offer, delivered }, ReceivedOutcome::Completed)
                if offer.iteration == body.iteration =>
            {
                *delivered = true;
            },
            (NodePhase::Streaming { offer, .. }, ReceivedOutcome::Aborted) => {
                let resync = offer.resync;
                node.phase = NodePhase::NeedsGamestate { resync };
                tracing::debug!(node = %handle.id, "gamestate stream aborted by receiver");
            },
            _ => {},
        }
    }

    fn start_gamestate_stream(&mut self, handle: NodeHandle) {
        let now = self.endpoint.now();
        let Some(node) = node_in(&mut self.nodes, handle) else {
            return;
        };
        if !matches!(node.phase, NodePhase::Offered(_)) {
            // A resent CANRECEIVEGAMESTATE.
            return;
        }
        let NodePhase::Offered(offer) = std::mem::replace(&mut node.phase, NodePhase::Handshake) else {
            return;
        };
        match node.sender.start(GAMESTATE_FILE_ID, offer.data.clone(), now) {
            Ok(iteration) if iteration == offer.iteration => {
                tracing::debug!(node = %handle.id, tic = %offer.tic, bytes = offer.data.len(), "gamestate stream started");
                node.phase = NodePhase::Streaming {
                    offer,
                    delivered: false,
                };
            },
            outcome => {
                node.sender.cancel(GAMESTATE_FILE_ID);
                node.phase = NodePhase::NeedsGamestate { resync: offer.resync };
                report_violation_to!(
                    &self.observer,
                    ViolationSeverity::Error,
                    ViolationKind::InternalError,
                    "gamestate stream to {} did not start as offered: {:?}",
                    handle.id,
                    outcome
                );
            },
        }
    }

    fn finish_join(&mut self, handle: NodeHandle) {
        let Some(node) = node_in(&mut self.nodes, handle) else {
            return;
        };
        let offer = match &node.phase {
            NodePhase::Streaming {
                offer,
                delivered: true,
            } => offer.clone(),
            _ => {
                report_violation_to!(
                    &self.observer,
                    ViolationSeverity::Warning,
                    ViolationKind::NetworkProtocol,
                    "{} reported a gamestate that was not delivered",
                    handle.id
                );
                return;
            },
        };
        node.phase = NodePhase::Joined;
        node.nettics = offer.tic;
        node.supposedtics = offer.tic;
        node.last_client_tic = None;
        if let Err(err) = self
            .endpoint
            .directory_mut()
            .set_status(handle, NodeStatus::Joined)
        {
            report_violation_to!(
                &self.observer,
                ViolationSeverity::Error,
                ViolationKind::Directory,
                "{} joined but cannot be marked: {}",
                handle.id,
                err
            );
        }
        let slots = self.endpoint.directory().slots_of(handle.id);
        for slot in &slots {
            if let Some(player) = self.players[slot.as_usize()].as_mut() {
                player.queue.clear();
                player.missing_run = 0;
                player.stalled = false;
            }
        }
        if offer.resync {
            tracing::debug!(node = %handle.id, tic = %offer.tic, "node resynchronized");
            return;
        }

        tracing::info!(node = %handle.id, tic = %offer.tic, ?slots, "node joined");
        let entries: Vec<RosterEntry> = self
            .roster()
            .into_iter()
            .filter(|entry| entry.node == handle.id.as_u8())
            .collect();
        for other in self.configured_handles() {
            if other != handle {
                self.send(
                    other,
                    PacketBody::PlayerInfo(PlayerInfoBody {
                        entries: entries.clone(),
                    }),
                    true,
                );
            }
        }
        for entry in &entries {
            if let Some(slot) = PlayerSlot::new(entry.slot) {
                self.push_event(SessionEvent::PlayerJoined {
                    slot,
                    name: entry.name.clone(),
                });
            }
        }
        self.push_event(SessionEvent::NodeJoined {
            node: handle.id,
            slots: slots.to_vec(),
        });
    }

    // ###############
    // #  TICCMDS    #
    // ###############

    fn handle_bundle(&mut self, handle: NodeHandle, packet: &Packet) {
        let Some((prefix, cmds)) = packet.body.as_client_bundle() else {
            return;
        };
        if !self.nodes[handle.id.as_usize()]
            .as_ref()
            .is_some_and(|node| node.handle == handle && matches!(node.phase, NodePhase::Joined))
        {
            return;
        }
        let slots = self.endpoint.directory().slots_of(handle.id);
        if !cmds.is_empty() {
            if cmds.len() != slots.len() {
                report_violation_to!(
                    &self.observer,
                    ViolationSeverity::Warning,
                    ViolationKind::NetworkProtocol,
                    "{} sent {} commands for {} players",
                    handle.id,
                    cmds.len(),
                    slots.len()
                );
                return;
            }
            if self.trust.sign_ticcmds {
                if let Err(err) = self.verify_bundle(&slots, packet) {
                    report_violation_to!(
                        &self.observer,
                        ViolationSeverity::Error,
                        ViolationKind::Trust,
                        "command bundle from {} rejected: {}",
                        handle.id,
                        err
                    );
                    self.kick_node(handle, KickReason::SignatureFailure, "invalid command signature");
                    return;
                }
            }
        }

        self.apply_resend_from(handle, prefix.resend_from, packet.kind().is_missing_tics());
        if let Some(report) = prefix.consistency {
            if !self.check_consistency(handle, report.tic, report.value) {
                return;
            }
        }

        let Some(node) = node_in(&mut self.nodes, handle) else {
            return;
        };
        let fresh = node
            .last_client_tic
            .is_none_or(|last| (prefix.client_tic.wrapping_sub(last) as i8) > 0);
        if !fresh || cmds.is_empty() {
            return;
        }
        node.last_client_tic = Some(prefix.client_tic);
        for (slot, cmd) in slots.iter().zip(cmds) {
            if let Some(player) = self.players[slot.as_usize()].as_mut() {
                if player.queue.len() >= MAX_QUEUED_CMDS {
                    player.queue.pop_front();
                }
                player.queue.push_back(cmd);
            }
        }
    }

    fn verify_bundle(&self, slots: &[PlayerSlot], packet: &Packet) -> Result<(), NetsyncError> {
        let keys: Vec<PublicKeyBytes> = slots
            .iter()
            .filter_map(|slot| self.players[slot.as_usize()].as_ref().map(|p| p.key))
            .collect();
        let payload = codec::encode_payload(&packet.body)?;
        verify_all(&keys, &payload, &packet.signatures)?;
        Ok(())
    }

    fn apply_resend_from(&mut self, handle: NodeHandle, resend_from: u8, missing_tics: bool) {
        let Some(node) = node_in(&mut self.nodes, handle) else {
            return;
        };
        let tic = expand_tic(resend_from, node.supposedtics);
        if tic >= node.nettics && tic <= node.supposedtics {
            node.nettics = tic;
        }
        if missing_tics {
            node.supposedtics = node.nettics;
        }
    }

    /// Compares a client's consistency value with the server's. Returns
    /// `false` and schedules a resync on mismatch.
    fn check_consistency(&mut self, handle: NodeHandle, low: u8, remote: u16) -> bool {
        let Some(node) = node_in(&mut self.nodes, handle) else {
            return true;
        };
        let tic = expand_tic(low, node.supposedtics);
        if tic >= self.gametic {
            return true;
        }
        let Some(local) = self.consistency.get(tic) else {
            return true;
        };
        if local == remote {
            node.resync_attempts = 0;
            return true;
        }
        report_violation_to!(
            &self.observer,
            ViolationSeverity::Warning,
            ViolationKind::TicSync,
            "{} desynchronized at tic {}: local {:#06x}, remote {:#06x}",
            handle.id,
            tic,
            local,
            remote
        );
        self.push_event(SessionEvent::DesyncDetected {
            node: handle.id,
            tic,
            local,
            remote,
        });
        self.request_resync(handle);
        false
    }

    fn request_resync(&mut self, handle: NodeHandle) {
        let Some(node) = node_in(&mut self.nodes, handle) else {
            return;
        };
        node.resync_attempts += 1;
        if node.resync_attempts > self.tic_sync.max_resync_attempts {
            self.kick_node(handle, KickReason::ResyncFailure, "could not resynchronize");
            return;
        }
        node.sender.cancel(GAMESTATE_FILE_ID);
        node.phase = NodePhase::NeedsGamestate { resync: true };
        tracing::debug!(node = %handle.id, attempt = node.resync_attempts, "resync scheduled");
    }

    fn schedule_gamestate_saves(&mut self, requests: &mut Vec<TicRequest>) {
        let tic = self.gametic;
        let mut cell: Option<GamestateCell> = None;
        for index in 0..self.nodes.len() {
            let Some(node) = self.nodes[index].as_mut() else {
                continue;
            };
            let NodePhase::NeedsGamestate { resync } = node.phase else {
                continue;
            };
            let shared = cell.get_or_insert_with(|| {
                let cell = GamestateCell::expecting(tic);
                requests.push(TicRequest::SaveGamestate {
                    cell: cell.clone(),
                    tic,
                });
                cell
            });
            node.phase = NodePhase::Saving {
                cell: shared.clone(),
                tic,
                resync,
            };
            let id = node.handle.id;
            if resync {
                self.push_event(SessionEvent::ResyncStarted { node: id, tic });
            } else {
                for slot in self.endpoint.directory().slots_of(id) {
                    if self.ingame & slot.mask_bit() == 0 {
                        self.ingame |= slot.mask_bit();
                        if let Some(player) = self.players[slot.as_usize()].as_mut() {
                            player.join_tic = tic;
                        }
                    }
                }
            }
        }
    }

    fn make_tic(&mut self, stalled: &mut SmallVec<[NodeHandle; 4]>) -> TicRequest {
        let tic = self.gametic;
        let mut inputs = InputVec::new();
        let mut mask = 0u16;
        let mut newly_stalled = SlotVec::new();
        for slot in PlayerSlot::in_mask(self.ingame) {
            let Some(binding) = self.endpoint.directory().binding(slot) else {
                continue;
            };
            let cmd = if binding.node.id == NodeId::SELF {
                self.local_cmds
                    .get(usize::from(binding.split))
                    .copied()
                    .flatten()
                    .unwrap_or(Ticcmd::NEUTRAL)
            } else {
                let node = self.nodes[binding.node.id.as_usize()]
                    .as_mut()
                    .filter(|node| matches!(node.phase, NodePhase::Joined));
                match (node, self.players[slot.as_usize()].as_mut()) {
                    (Some(node), Some(player)) => {
                        let (cmd, source) = player.take_cmd(tic, self.tic_sync.stall_kick_tics);
                        match source {
                            CmdSource::Received { lag } => node.lag = lag,
                            CmdSource::Extrapolated => {},
                            CmdSource::Stalled { started, kick } => {
                                if started {
                                    tracing::debug!(%slot, %tic, "player stalled");
                                    newly_stalled.push(slot);
                                }
                                if kick && !stalled.contains(&binding.node) {
                                    stalled.push(binding.node);
                                }
                            },
                        }
                        cmd
                    },
                    _ => Ticcmd::NEUTRAL,
                }
            };
            mask |= slot.mask_bit();
            inputs.push((slot, cmd));
        }
        for slot in newly_stalled {
            self.push_event(SessionEvent::PlayerStalled { slot, tic });
        }
        let cmds: SmallVec<[Ticcmd; MAXPLAYERS]> = inputs.iter().map(|(_, cmd)| *cmd).collect();
        self.buffer.store_frame(tic, mask, &cmds, tic);
        self.gametic += 1;
        TicRequest::AdvanceTic { tic, inputs }
    }

    // ###############
    // #  LEAVING    #
    // ###############

    fn remove_players(&mut self, handle: NodeHandle, reason: KickReason) {
        let Ok(slots) = self.endpoint.directory_mut().unbind_players(handle) else {
            return;
        };
        for slot in &slots {
            self.players[slot.as_usize()] = None;
            self.ingame &= !slot.mask_bit();
            self.buffer.clear_slot_from(*slot, self.gametic);
            self.push_event(SessionEvent::PlayerDeparted { slot: *slot, reason });
        }
        if slots.is_empty() {
            return;
        }
        for other in self.configured_handles() {
            if other == handle {
                continue;
            }
            for slot in &slots {
                self.send(
                    other,
                    PacketBody::PlayerDeparted(PlayerDepartedBody {
                        slot: slot.as_u8(),
                        reason,
                    }),
                    true,
                );
            }
        }
    }

    fn enter_leaving(&mut self, handle: NodeHandle) {
        let now = self.endpoint.now();
        let deadline = now + self.reliability.connection_timeout_tics;
        if let Some(node) = node_in(&mut self.nodes, handle) {
            node.phase = NodePhase::Leaving {
                since: now,
                deadline,
            };
            node.sender = FileSender::new(&self.file_config);
        }
        self.round_targets.retain(|target| *target != handle);
    }

    fn kick_node(&mut self, handle: NodeHandle, reason: KickReason, message: &str) {
        if !self.endpoint.directory().is_current(handle)
            || self.nodes[handle.id.as_usize()]
                .as_ref()
                .is_some_and(|node| matches!(node.phase, NodePhase::Leaving { .. }))
        {
            return;
        }
        tracing::info!(node = %handle.id, %reason, message, "kicking node");
        self.send(
            handle,
            PacketBody::Kick(KickBody {
                reason,
                message: truncated(message, MAX_REASON_LENGTH),
            }),
            true,
        );
        self.remove_players(handle, reason);
        self.enter_leaving(handle);
        self.push_event(SessionEvent::NodeDisconnected {
            node: handle.id,
            reason,
        });
    }

    fn drop_node(&mut self, handle: NodeHandle, reason: KickReason) {
        let was_leaving = self.nodes[handle.id.as_usize()]
            .as_ref()
            .is_some_and(|node| matches!(node.phase, NodePhase::Leaving { .. }));
        self.remove_players(handle, reason);
        if reason == KickReason::Quit && !was_leaving {
            self.enter_leaving(handle);
        } else {
            self.close_node(handle);
        }
        if !was_leaving {
            tracing::info!(node = %handle.id, %reason, "node left");
            self.push_event(SessionEvent::NodeDisconnected {
                node: handle.id,
                reason,
            });
        }
    }

    fn close_node(&mut self, handle: NodeHandle) {
        self.round_targets.retain(|target| *target != handle);
        if let Some(slot) = self.nodes.get_mut(handle.id.as_usize()) {
            if slot.as_ref().is_some_and(|node| node.handle == handle) {
                *slot = None;
            }
        }
        match self.endpoint.close_node(handle) {
            Ok(_) => tracing::debug!(node = %handle.id, "node closed"),
            Err(err) => tracing::trace!(node = %handle.id, %err, "node already closed"),
        }
    }

    fn close_departed_nodes(&mut self) {
        let now = self.endpoint.now();
        let departed: Vec<NodeHandle> = self
            .nodes
            .iter()
            .flatten()
            .filter(|node| match node.phase {
                NodePhase::Leaving { since, deadline } => {
                    now > since && (self.endpoint.node_acked(node.handle) || now >= deadline)
                },
                _ => false,
            })
            .map(|node| node.handle)
            .collect();
        for handle in departed {
            self.close_node(handle);
        }
    }

    // ###############
    // # HOUSEKEEPING#
    // ###############

    fn advance_gamestate_offers(&mut self) {
        for handle in self.node_handles() {
            let Some(node) = node_in(&mut self.nodes, handle) else {
                continue;
            };
            let NodePhase::Saving { cell, tic, resync } = &node.phase else {
                continue;
            };
            let (tic, resync) = (*tic, *resync);
            let Some(data) = cell.load() else {
                if self.gametic > tic {
                    node.phase = NodePhase::NeedsGamestate { resync };
                    report_violation_to!(
                        &self.observer,
                        ViolationSeverity::Error,
                        ViolationKind::TicSync,
                        "gamestate for tic {} was never saved; asking again",
                        tic
                    );
                }
                continue;
            };
            let Ok(size) = u32::try_from(data.len()) else {
                report_violation_to!(
                    &self.observer,
                    ViolationSeverity::Critical,
                    ViolationKind::FileTransfer,
                    "gamestate of {} bytes cannot be streamed",
                    data.len()
                );
                self.kick_node(handle, KickReason::ResyncFailure, "gamestate too large");
                continue;
            };
            let iteration = node.sender.next_iteration(GAMESTATE_FILE_ID);
            node.phase = NodePhase::Offered(GamestateOffer {
                tic,
                data,
                iteration,
                resync,
            });
            tracing::debug!(node = %handle.id, %tic, size, iteration, "gamestate offered");
            self.send(
                handle,
                PacketBody::WillResendGamestate(WillResendGamestateBody {
                    tic: tic.as_u32(),
                    iteration,
                    size,
                }),
                true,
            );
        }
    }

    fn pump_file_senders(&mut self) {
        let now = self.endpoint.now();
        for handle in self.node_handles() {
            let Some(node) = node_in(&mut self.nodes, handle) else {
                continue;
            };
            if node.sender.is_idle() {
                continue;
            }
            let fragments = node.sender.poll(now);
            let mut gamestate_stalled = false;
            let mut files_stalled = false;
            for file_id in node.sender.stalled(now) {
                node.sender.cancel(file_id);
                if file_id == GAMESTATE_FILE_ID {
                    gamestate_stalled = true;
                } else {
                    files_stalled = true;
                }
            }
            for fragment in fragments {
                self.send(handle, PacketBody::FileFragment(fragment), false);
            }
            if gamestate_stalled {
                report_violation_to!(
                    &self.observer,
                    ViolationSeverity::Warning,
                    ViolationKind::FileTransfer,
                    "gamestate stream to {} stalled",
                    handle.id
                );
                self.request_resync(handle);
            }
            if files_stalled {
                report_violation_to!(
                    &self.observer,
                    ViolationSeverity::Warning,
                    ViolationKind::FileTransfer,
                    "file download of {} stalled",
                    handle.id
                );
                self.send(
                    handle,
                    refuse_body(RefusalReason::ContentMismatch, "file transfer stalled"),
                    true,
                );
                self.enter_leaving(handle);
            }
        }
    }

    fn check_pings(&mut self) {
        let Some(max_ping) = self.settings.max_ping_tics else {
            return;
        };
        let now = self.endpoint.now();
        let mut too_slow = Vec::new();
        for node in self.nodes.iter_mut().flatten() {
            if !matches!(node.phase, NodePhase::Joined) {
                continue;
            }
            if node.lag <= max_ping {
                node.high_ping_since = None;
                continue;
            }
            let since = *node.high_ping_since.get_or_insert(now);
            if now - since >= i64::from(self.settings.ping_grace_tics) {
                too_slow.push(node.handle);
            }
        }
        for handle in too_slow {
            self.kick_node(handle, KickReason::PingTooHigh, "ping too high");
        }
    }

    fn send_pings(&mut self) {
        let now = self.endpoint.now();
        if now - self.last_ping < i64::from(self.tic_sync.ping_interval_tics) {
            return;
        }
        self.last_ping = now;
        let mut lag = [0u8; MAXPLAYERS];
        for slot in PlayerSlot::all() {
            if let Some(owner) = self.endpoint.directory().lookup_owner(slot) {
                if let Some(node) = self.nodes[owner.id.as_usize()].as_ref() {
                    lag[slot.as_usize()] = node.lag;
                }
            }
        }
        for handle in self.configured_handles() {
            self.send(handle, PacketBody::Ping(PingBody { lag }), false);
        }
    }

    fn send_server_tics(&mut self) {
        let header = codec::header_len(PacketKind::ServerTics) + TICS_PAYLOAD_BASE;
        for handle in self.joined_handles() {
            let Some(node) = node_in(&mut self.nodes, handle) else {
                continue;
            };
            if self.gametic - node.nettics >= BACKUPTICS as i64 {
                tracing::debug!(node = %handle.id, nettics = %node.nettics, "node fell out of the tic window");
                self.request_resync(handle);
                continue;
            }
            if node.supposedtics - node.nettics >= MAX_UNCONFIRMED_TICS {
                node.supposedtics = node.nettics;
            }
            let start = node
                .nettics
                .max(node.supposedtics.saturating_sub(self.tic_sync.extra_tics));
            let end = self.gametic.min(start + self.tic_sync.send_window as u32);
            let mut frames = Vec::new();
            let mut size = header;
            let mut tic = start;
            let mut missing = false;
            while tic < end {
                let Some((ingame, inputs)) = self.buffer.frame(tic) else {
                    missing = true;
                    break;
                };
                let cost = FRAME_OVERHEAD + Ticcmd::WIRE_SIZE * inputs.len();
                if size + cost > MAX_PACKET_LENGTH {
                    break;
                }
                size += cost;
                frames.push(TicFrame {
                    ingame,
                    cmds: inputs.iter().map(|(_, cmd)| *cmd).collect(),
                });
                tic += 1;
            }
            if frames.is_empty() {
                if missing {
                    self.request_resync(handle);
                }
                continue;
            }
            node.supposedtics = node.supposedtics.max(tic);
            tracing::trace!(node = %handle.id, %start, count = frames.len(), "server tics");
            self.send(
                handle,
                PacketBody::ServerTics(ServerTicsBody {
                    start_tic: start.low_byte(),
                    tics: frames,
                }),
                false,
            );
        }
    }

    // ###############
    // #    TRUST    #
    // ###############

    fn run_round(&mut self) {
        let Some(mut round) = self.round.take() else {
            return;
        };
        let now = self.gametic;
        if round.due_to_challenge(now) {
            let challenge = build_challenge(unix_time_now(), self.trust.challenge_ip(), &mut self.rng);
            round.issue(challenge);
            for (split, slot) in self.local_slots.iter().enumerate() {
                if let Some(signature) = self.identity.sign_as(split, &challenge.0) {
                    round.record_response(*slot, signature);
                }
            }
            self.round_targets = self
                .nodes
                .iter()
                .flatten()
                .filter(|node| node.phase.is_configured())
                .filter(|node| self.endpoint.directory().status(node.handle.id) == NodeStatus::Joined)
                .map(|node| node.handle)
                .collect();
            tracing::debug!(%now, targets = self.round_targets.len(), "round challenge issued");
            for handle in self.round_targets.clone() {
                self.send(handle, PacketBody::ChallengeAll(ChallengeBody { challenge }), true);
            }
        }
        if round.take_kick_deadline(now) {
            let unresponsive: Vec<NodeHandle> = self
                .round_targets
                .iter()
                .copied()
                .filter(|handle| {
                    self.endpoint
                        .directory()
                        .slots_of(handle.id)
                        .iter()
                        .any(|slot| round.response(*slot).is_none())
                })
                .collect();
            for handle in unresponsive {
                report_violation_to!(
                    &self.observer,
                    ViolationSeverity::Warning,
                    ViolationKind::Trust,
                    "{} did not answer the round challenge in time",
                    handle.id
                );
                self.kick_node(handle, KickReason::SignatureFailure, "no answer to the round challenge");
            }
        }
        if round.take_results_deadline(now) {
            let entries: Vec<RoundResult> = PlayerSlot::all()
                .filter(|slot| self.players[slot.as_usize()].is_some())
                .filter_map(|slot| {
                    round.response(slot).map(|signature| RoundResult {
                        slot: slot.as_u8(),
                        signature,
                    })
                })
                .collect();
            tracing::debug!(%now, results = entries.len(), "round results broadcast");
            for handle in self.configured_handles() {
                self.send(
                    handle,
                    PacketBody::ResultsAll(ResultsAllBody {
                        entries: entries.clone(),
                    }),
                    true,
                );
            }
        }
        if round.is_finished() {
            self.round_targets.clear();
        } else {
            self.round = Some(round);
        }
    }

    fn handle_round_response(&mut self, handle: NodeHandle, body: &ResponseAllBody) {
        let now = self.gametic;
        let Some(round) = self.round.as_mut() else {
            return;
        };
        if !round.accepts_responses(now) {
            tracing::debug!(node = %handle.id, %now, "round response arrived after the deadline");
            return;
        }
        let Some(challenge) = round.challenge().copied() else {
            return;
        };
        if !self.round_targets.contains(&handle) {
            return;
        }
        let slots = self.endpoint.directory().slots_of(handle.id);
        let mut valid = body.signatures.len() == slots.len();
        if valid {
            for (slot, signature) in slots.iter().zip(&body.signatures) {
                let verified = self.players[slot.as_usize()]
                    .as_ref()
                    .is_some_and(|player| verify(&player.key, &challenge.0, signature).is_ok());
                if !verified {
                    valid = false;
                    break;
                }
                round.record_response(*slot, *signature);
            }
        }
        if !valid {
            report_violation_to!(
                &self.observer,
                ViolationSeverity::Error,
                ViolationKind::Trust,
                "invalid round response from {}",
                handle.id
            );
            self.kick_node(handle, KickReason::SignatureFailure, "invalid round response");
        }
    }

    fn handle_say(&mut self, handle: NodeHandle, body: SayBody, signatures: &[SignatureBytes]) {
        let Some(slot) = PlayerSlot::new(body.source) else {
            return;
        };
        if self.endpoint.directory().lookup_owner(slot) != Some(handle) {
            report_violation_to!(
                &self.observer,
                ViolationSeverity::Warning,
                ViolationKind::Trust,
                "{} sent chat as slot {} it does not own",
                handle.id,
                slot
            );
            return;
        }
        let packet_body = PacketBody::Say(body);
        let verified = match (self.players[slot.as_usize()].as_ref(), signatures.first()) {
            (Some(player), Some(signature)) => codec::encode_payload(&packet_body)
                .is_ok_and(|payload| verify(&player.key, &payload, signature).is_ok()),
            _ => false,
        };
        if !verified && self.trust.sign_ticcmds {
            self.kick_node(handle, KickReason::SignatureFailure, "invalid chat signature");
            return;
        }
        let PacketBody::Say(body) = &packet_body else {
            return;
        };
        self.push_event(SessionEvent::ChatReceived {
            slot,
            text: body.text.clone(),
            verified,
        });
        let packet = Packet::signed(packet_body.clone(), signatures);
        for other in self.joined_handles() {
            if other != handle {
                self.send_packet(other, packet.clone(), true);
            }
        }
    }
}

fn refuse_body(reason: RefusalReason, message: &str) -> PacketBody {
    PacketBody::ServerRefuse(ServerRefuseBody {
        reason,
        message: truncated(message, MAX_REASON_LENGTH),
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
    use crate::{LocalIdentity, SessionBuilder};
    use std::net::SocketAddr;

    fn player() -> ServerPlayer {
        ServerPlayer::new("p".to_owned(), PublicKeyBytes::default(), Tic::ZERO)
    }

    #[test]
    fn received_commands_carry_clamped_lag() {
        let mut p = player();
        p.queue.push_back(Ticcmd::NEUTRAL.with_latency(10));
        let (cmd, source) = p.take_cmd(Tic::new(13), 100);
        assert_eq!(source, CmdSource::Received { lag: 3 });
        assert_eq!(cmd.latency, 3);

        p.queue.push_back(Ticcmd::NEUTRAL.with_latency(250));
        let (_, source) = p.take_cmd(Tic::new(256 + 20), 100);
        assert_eq!(source, CmdSource::Received { lag: MAX_PREDICT_TICS });
    }

    #[test]
    fn missing_commands_extrapolate_then_stall_then_kick() {
        let mut p = player();
        let cmd = Ticcmd {
            forward_move: 50,
            ..Ticcmd::NEUTRAL
        };
        p.queue.push_back(cmd);
        p.take_cmd(Tic::new(1), 3);
        for tic in 0..MAXGENTLEMENDELAY {
            let (repeated, source) = p.take_cmd(Tic::new(2 + tic), 3);
            assert_eq!(source, CmdSource::Extrapolated);
            assert_eq!(repeated.forward_move, 50);
        }
        let (neutral, source) = p.take_cmd(Tic::new(100), 3);
        assert_eq!(neutral, Ticcmd::NEUTRAL);
        assert_eq!(
            source,
            CmdSource::Stalled {
                started: true,
                kick: false
            }
        );
        let (_, source) = p.take_cmd(Tic::new(101), 3);
        assert_eq!(
            source,
            CmdSource::Stalled {
                started: false,
                kick: false
            }
        );
        let (_, source) = p.take_cmd(Tic::new(102), 3);
        assert_eq!(
            source,
            CmdSource::Stalled {
                started: false,
                kick: true
            }
        );
    }

    struct Silent;

    impl Transport<SocketAddr> for Silent {
        fn send_to(&mut self, _datagram: &[u8], _addr: &SocketAddr) {}

        fn receive_all_datagrams(&mut self) -> Vec<(SocketAddr, Vec<u8>)> {
            Vec::new()
        }
    }

    #[test]
    fn stall_events_respect_the_queue_cap() {
        let mut server = SessionBuilder::new()
            .with_identity(LocalIdentity::generate(&["host"]).unwrap())
            .start_server(Silent)
            .unwrap();
        let address: SocketAddr = "127.0.0.1:6001".parse().unwrap();
        let handle = server.endpoint.directory_mut().assign_node(address).unwrap();
        let slot = server.endpoint.directory().free_slot().unwrap();
        server
            .endpoint
            .directory_mut()
            .bind_player_to_node(slot, handle, 0)
            .unwrap();
        let mut node = ServerNode::new(handle, Vec::new(), &server.file_config);
        node.phase = NodePhase::Joined;
        server.nodes[handle.id.as_usize()] = Some(node);
        let mut silent = player();
        silent.missing_run = MAXGENTLEMENDELAY;
        server.players[slot.as_usize()] = Some(silent);
        server.ingame |= slot.mask_bit();

        for _ in 0..MAX_EVENT_QUEUE_SIZE {
            server.push_event(SessionEvent::PlayerJoined {
                slot,
                name: "filler".to_owned(),
            });
        }
        let mut stalled = SmallVec::new();
        server.make_tic(&mut stalled);

        assert_eq!(server.events.len(), MAX_EVENT_QUEUE_SIZE);
        assert!(matches!(
            server.events.back(),
            Some(SessionEvent::PlayerStalled { slot: stalled_slot, .. }) if *stalled_slot == slot
        ));
        assert!(stalled.is_empty());
    }

    #[test]
    fn a_fresh_command_ends_the_stall() {
        let mut p = player();
        for tic in 0..=MAXGENTLEMENDELAY {
            p.take_cmd(Tic::new(tic), 1000);
        }
        assert!(p.stalled);
        p.queue.push_back(Ticcmd::NEUTRAL);
        p.take_cmd(Tic::new(MAXGENTLEMENDELAY + 1), 1000);
        assert!(!p.stalled);
        assert_eq!(p.missing_run, 0);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncated("héllo", 2), "h");
        assert_eq!(truncated("short", 128), "short");
    }

    #[test]
    fn phases_that_receive_broadcasts() {
        assert!(!NodePhase::Handshake.is_configured());
        assert!(NodePhase::NeedsGamestate { resync: false }.is_configured());
        assert!(NodePhase::Joined.is_configured());
        assert!(!NodePhase::Leaving {
            since: Tic::ZERO,
            deadline: Tic::ZERO
        }
        .is_configured());
    }
}

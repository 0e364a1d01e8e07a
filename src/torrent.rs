//! Torrent coordinator
//!
//! One task per torrent owns every piece of that torrent's mutable state:
//! the peer table, piece states, picker, counters and resume projection.
//! Peer sessions, piece writers, webseed fetches, announcers and the
//! verification pass all run as independent tasks that talk to the
//! coordinator exclusively through bounded channels, so the state has a
//! single writer and the loop body never blocks on I/O.
//!
//! The one cross-source invariant the loop enforces directly: at most one
//! writer task per piece index. A second buffer arriving for a piece that
//! is already `Writing` (endgame duplicate, webseed race) is discarded and
//! counted as wasted.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::announcer::{
    self, AnnounceIdentity, AnnouncerCommand, AnnouncerConfig, AnnouncerEvent, SwarmCounters,
};
use crate::bitfield::Bitfield;
use crate::config::Config;
use crate::downloader::PieceDownload;
use crate::error::{EngineError, Result};
use crate::limiter::RateLimits;
use crate::magnet::MagnetUri;
use crate::metainfo::{Info, Metainfo};
use crate::peer::{
    connection, CloseReason, PeerCommand, PeerEvent, PeerKey, PeerMessage, PeerState,
    SessionParams, SessionTimeouts,
};
use crate::picker::{PiecePicker, PiecePriority, PieceState};
use crate::piece::{pieces_from_info, BlockInfo, Piece};
use crate::resume::{ResumeSnapshot, ResumeStore};
use crate::stats::{SpeedMeter, TransferCounters};
use crate::storage::Storage;
use crate::tracker::{self, AnnounceEvent, TrackerTransport};
use crate::types::{InfoHash, PeerId, TorrentEvent, TorrentId, TorrentStats, TorrentStatus};
use crate::webseed::{self, WebseedPieceResult, WebseedSource};
use crate::writer::{self, PieceSource, WriterResult};

/// How many resume-claimed pieces the startup check re-hashes before
/// trusting the rest of the bitfield.
const RESUME_SAMPLE_PIECES: usize = 4;

/// Construction parameters for one torrent.
pub struct TorrentParams {
    pub id: TorrentId,
    pub info_hash: InfoHash,
    pub name: String,
    /// None for magnet adds until the metadata collaborator supplies it
    pub info: Option<Arc<Info>>,
    /// Tracker tiers (BEP 12)
    pub trackers: Vec<Vec<String>>,
    /// Webseed URLs (BEP 19)
    pub url_list: Vec<String>,
    /// Peers to dial regardless of tracker discovery
    pub fixed_peers: Vec<SocketAddr>,
    pub dest: PathBuf,
    pub port: u16,
    /// Prior state to resume from
    pub resume: Option<ResumeSnapshot>,
}

impl TorrentParams {
    /// Parameters for a torrent added from a `.torrent` file.
    pub fn from_metainfo(
        id: TorrentId,
        metainfo: &Metainfo,
        dest: impl Into<PathBuf>,
        port: u16,
    ) -> Self {
        Self {
            id,
            info_hash: metainfo.info_hash,
            name: metainfo.info.name.clone(),
            info: Some(Arc::clone(&metainfo.info)),
            trackers: metainfo.tracker_tiers(),
            url_list: metainfo.url_list.clone(),
            fixed_peers: Vec::new(),
            dest: dest.into(),
            port,
            resume: None,
        }
    }

    /// Parameters for a torrent added from a magnet link. The torrent sits
    /// in `DownloadingMetadata` until `provide_info` delivers the info
    /// dictionary.
    pub fn from_magnet(id: TorrentId, magnet: &MagnetUri, dest: impl Into<PathBuf>, port: u16) -> Self {
        Self {
            id,
            info_hash: magnet.info_hash,
            name: magnet.display_name(),
            info: None,
            trackers: magnet.tracker_tiers(),
            url_list: Vec::new(),
            fixed_peers: magnet.peers.clone(),
            dest: dest.into(),
            port,
            resume: None,
        }
    }

    /// Parameters reconstructed from a resume snapshot.
    pub fn from_snapshot(id: TorrentId, snapshot: ResumeSnapshot, info: Option<Arc<Info>>) -> Self {
        Self {
            id,
            info_hash: snapshot.info_hash,
            name: snapshot.name.clone(),
            info,
            trackers: snapshot.trackers.clone(),
            url_list: snapshot.url_list.clone(),
            fixed_peers: Vec::new(),
            dest: snapshot.dest_path.clone(),
            port: snapshot.port,
            resume: Some(snapshot),
        }
    }
}

/// Session-level collaborators handed to the torrent at construction.
pub struct Collaborators {
    pub storage: Arc<dyn Storage>,
    pub resume: Arc<dyn ResumeStore>,
    pub tracker: Arc<dyn TrackerTransport>,
    pub limits: RateLimits,
}

/// Control commands into the loop.
enum Command {
    Start,
    Stop,
    Pause,
    Resume,
    AnnounceNow,
    AddPeers(Vec<SocketAddr>),
    RemovePeer(SocketAddr),
    AddIncoming(TcpStream, SocketAddr),
    ProvideInfo(Arc<Info>),
    SetPriority(u32, PiecePriority),
    SetSequential(bool),
    Status(oneshot::Sender<TorrentStatus>),
    Stats(oneshot::Sender<TorrentStats>),
    Bitfield(oneshot::Sender<Option<Bitfield>>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to a running torrent. All methods are fire-and-forget messages
/// into the coordinator except the queries, which await a reply.
pub struct Torrent {
    id: TorrentId,
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<TorrentEvent>,
}

impl Torrent {
    /// Spawn a torrent coordinator. The torrent starts in `Stopped`; call
    /// [`Torrent::start`].
    pub fn spawn(params: TorrentParams, config: Config, collab: Collaborators) -> Torrent {
        let (commands_tx, commands_rx) = mpsc::channel(64);
        let (events_tx, _) = broadcast::channel(256);

        let id = params.id;
        let torrent_loop = TorrentLoop::new(params, config, collab, commands_rx, events_tx.clone());
        tokio::spawn(torrent_loop.run());

        Torrent {
            id,
            commands: commands_tx,
            events: events_tx,
        }
    }

    pub fn id(&self) -> TorrentId {
        self.id
    }

    /// Subscribe to this torrent's events.
    pub fn subscribe(&self) -> broadcast::Receiver<TorrentEvent> {
        self.events.subscribe()
    }

    pub async fn start(&self) -> Result<()> {
        self.send(Command::Start).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.send(Command::Stop).await
    }

    /// Keep connections, stop transferring.
    pub async fn pause(&self) -> Result<()> {
        self.send(Command::Pause).await
    }

    /// Undo [`Torrent::pause`].
    pub async fn resume(&self) -> Result<()> {
        self.send(Command::Resume).await
    }

    /// Reannounce to every tracker immediately.
    pub async fn announce_now(&self) -> Result<()> {
        self.send(Command::AnnounceNow).await
    }

    /// Inject peer addresses (DHT, PEX or user supplied).
    pub async fn add_peers(&self, peers: Vec<SocketAddr>) -> Result<()> {
        self.send(Command::AddPeers(peers)).await
    }

    /// Disconnect and forget a peer.
    pub async fn remove_peer(&self, addr: SocketAddr) -> Result<()> {
        self.send(Command::RemovePeer(addr)).await
    }

    /// Hand over an accepted inbound connection for this info-hash.
    pub async fn add_incoming(&self, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        self.send(Command::AddIncoming(stream, addr)).await
    }

    /// Deliver the info dictionary for a magnet add.
    pub async fn provide_info(&self, info: Arc<Info>) -> Result<()> {
        self.send(Command::ProvideInfo(info)).await
    }

    pub async fn set_piece_priority(&self, piece: u32, priority: PiecePriority) -> Result<()> {
        self.send(Command::SetPriority(piece, priority)).await
    }

    pub async fn set_sequential(&self, sequential: bool) -> Result<()> {
        self.send(Command::SetSequential(sequential)).await
    }

    pub async fn status(&self) -> Result<TorrentStatus> {
        self.query(Command::Status).await
    }

    pub async fn stats(&self) -> Result<TorrentStats> {
        self.query(Command::Stats).await
    }

    /// The verified-piece bitfield; None before the info is known.
    pub async fn bitfield(&self) -> Result<Option<Bitfield>> {
        self.query(Command::Bitfield).await
    }

    /// Stop the torrent, flush resume state and end the coordinator.
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Shutdown(tx)).await?;
        rx.await.map_err(|_| EngineError::Shutdown)
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| EngineError::Shutdown)
    }

    async fn query<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx)).await?;
        rx.await.map_err(|_| EngineError::Shutdown)
    }
}

/// Piece-level state; present once the info dictionary is known.
struct Content {
    info: Arc<Info>,
    pieces: Vec<Piece>,
    picker: PiecePicker,
    /// Active downloads keyed by (peer, piece); multiple peers per piece
    /// only in endgame
    downloads: HashMap<(PeerKey, u32), PieceDownload>,
    /// Pieces with a writer task in flight
    writing: HashSet<u32>,
}

/// Full-scan or sampled verification result.
struct VerifyReport {
    bitfield: Bitfield,
}

struct TorrentLoop {
    id: TorrentId,
    info_hash: InfoHash,
    name: String,
    dest: PathBuf,
    port: u16,
    trackers: Vec<Vec<String>>,
    url_list: Vec<String>,
    fixed_peers: Vec<SocketAddr>,
    added_at: DateTime<Utc>,

    config: Config,
    collab: Collaborators,
    our_peer_id: PeerId,

    status: TorrentStatus,
    last_error: Option<String>,
    paused: bool,
    started: bool,
    announcers_started: bool,

    content: Option<Content>,

    peers: HashMap<PeerKey, PeerState>,
    peer_by_addr: HashMap<SocketAddr, PeerKey>,
    known_peers: HashSet<SocketAddr>,
    banned: HashSet<SocketAddr>,
    next_peer_key: u64,

    webseeds: Vec<WebseedSource>,
    webseed_client: Option<reqwest::Client>,

    counters: TransferCounters,
    download_meter: SpeedMeter,
    upload_meter: SpeedMeter,
    seeded_for_base: Duration,
    seeding_since: Option<Instant>,

    resume_dirty: bool,
    last_resume_write: Instant,

    commands: mpsc::Receiver<Command>,
    events: broadcast::Sender<TorrentEvent>,

    peer_events_tx: mpsc::Sender<PeerEvent>,
    peer_events: mpsc::Receiver<PeerEvent>,
    writer_tx: mpsc::Sender<WriterResult>,
    writer_rx: mpsc::Receiver<WriterResult>,
    webseed_tx: mpsc::Sender<WebseedPieceResult>,
    webseed_rx: mpsc::Receiver<WebseedPieceResult>,
    announcer_tx: mpsc::Sender<AnnouncerEvent>,
    announcer_rx: mpsc::Receiver<AnnouncerEvent>,
    verify_tx: mpsc::Sender<VerifyReport>,
    verify_rx: mpsc::Receiver<VerifyReport>,

    counters_watch: watch::Sender<SwarmCounters>,
    announcer_cmds: Vec<mpsc::Sender<AnnouncerCommand>>,

    choker: crate::choker::Choker,
    cancel: CancellationToken,
    workers: JoinSet<()>,
}

impl TorrentLoop {
    fn new(
        params: TorrentParams,
        config: Config,
        collab: Collaborators,
        commands: mpsc::Receiver<Command>,
        events: broadcast::Sender<TorrentEvent>,
    ) -> Self {
        // Fan-in capacity proportional to peer count times the per-peer
        // request queue: full peers block on send, throttling their sockets.
        let fan_in = config.max_peers * config.request_queue_len;
        let (peer_events_tx, peer_events) = mpsc::channel(fan_in.max(64));
        let (writer_tx, writer_rx) = mpsc::channel(64);
        let (webseed_tx, webseed_rx) = mpsc::channel(16);
        let (announcer_tx, announcer_rx) = mpsc::channel(16);
        let (verify_tx, verify_rx) = mpsc::channel(1);
        let (counters_watch, _) = watch::channel(SwarmCounters::default());

        let picker_seed = derive_picker_seed(&config, &params.info_hash);
        let choker = crate::choker::Choker::new(
            config.unchoke_slots,
            config.optimistic_rounds,
            config.snub_penalty,
            config.fresh_peer_window,
            picker_seed,
        );

        let (counters, seeded_for_base, added_at) = match &params.resume {
            Some(snapshot) => (
                TransferCounters {
                    downloaded: snapshot.bytes_downloaded,
                    uploaded: snapshot.bytes_uploaded,
                    wasted: snapshot.bytes_wasted,
                },
                snapshot.seeded_for,
                snapshot.added_at,
            ),
            None => (TransferCounters::default(), Duration::ZERO, Utc::now()),
        };

        let webseeds = params
            .url_list
            .iter()
            .map(|url| WebseedSource::new(url.clone(), config.webseed_backoff_initial))
            .collect();

        let content = params.info.as_ref().map(|info| {
            Self::build_content(info, &config, picker_seed, params.resume.as_ref())
        });

        let rate_window = config.rate_window;
        Self {
            id: params.id,
            info_hash: params.info_hash,
            name: params.name,
            dest: params.dest,
            port: params.port,
            trackers: params.trackers,
            url_list: params.url_list,
            fixed_peers: params.fixed_peers,
            added_at,

            config,
            collab,
            our_peer_id: tracker::generate_peer_id(),

            status: TorrentStatus::Stopped,
            last_error: None,
            paused: false,
            started: false,
            announcers_started: false,

            content,

            peers: HashMap::new(),
            peer_by_addr: HashMap::new(),
            known_peers: HashSet::new(),
            banned: HashSet::new(),
            next_peer_key: 1,

            webseeds,
            webseed_client: None,

            counters,
            download_meter: SpeedMeter::new(rate_window),
            upload_meter: SpeedMeter::new(rate_window),
            seeded_for_base,
            seeding_since: None,

            resume_dirty: false,
            last_resume_write: Instant::now(),

            commands,
            events,

            peer_events_tx,
            peer_events,
            writer_tx,
            writer_rx,
            webseed_tx,
            webseed_rx,
            announcer_tx,
            announcer_rx,
            verify_tx,
            verify_rx,

            counters_watch,
            announcer_cmds: Vec::new(),

            choker,
            cancel: CancellationToken::new(),
            workers: JoinSet::new(),
        }
    }

    fn build_content(
        info: &Arc<Info>,
        config: &Config,
        picker_seed: u64,
        resume: Option<&ResumeSnapshot>,
    ) -> Content {
        let num_pieces = info.num_pieces();
        let mut picker = PiecePicker::new(
            num_pieces,
            config.endgame_threshold(num_pieces),
            config.sequential,
            picker_seed,
        );
        if let Some(have) = resume.and_then(|s| s.decode_bitfield()) {
            if have.len() == num_pieces {
                picker.restore_have(&have);
            }
        }
        Content {
            pieces: pieces_from_info(info),
            info: Arc::clone(info),
            picker,
            downloads: HashMap::new(),
            writing: HashSet::new(),
        }
    }

    async fn run(mut self) {
        let mut stats_tick = tokio::time::interval(Duration::from_secs(1));
        let mut choke_tick = tokio::time::interval(self.config.choke_interval);
        stats_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        choke_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown(ack)) => {
                        self.stop_torrent(true).await;
                        let _ = ack.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        // Every handle dropped: behave like shutdown.
                        self.stop_torrent(true).await;
                        break;
                    }
                },
                Some(event) = self.peer_events.recv() => self.handle_peer_event(event),
                Some(result) = self.writer_rx.recv() => self.handle_writer_result(result).await,
                Some(result) = self.webseed_rx.recv() => self.handle_webseed_result(result),
                Some(event) = self.announcer_rx.recv() => self.handle_announcer_event(event),
                Some(report) = self.verify_rx.recv() => self.handle_verify_report(report),
                _ = stats_tick.tick() => self.handle_stats_tick(),
                _ = choke_tick.tick() => self.run_choke_round(),
            }
        }

        tracing::debug!("torrent {} coordinator finished", self.id);
    }

    // ------------------------------------------------------------------
    // Control commands
    // ------------------------------------------------------------------

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start => self.start_torrent(),
            Command::Stop => self.stop_torrent(false).await,
            Command::Pause => self.pause_torrent(),
            Command::Resume => self.resume_torrent(),
            Command::AnnounceNow => {
                for cmds in &self.announcer_cmds {
                    let _ = cmds.try_send(AnnouncerCommand::AnnounceNow(AnnounceEvent::None));
                }
            }
            Command::AddPeers(addrs) => {
                for addr in addrs {
                    if !self.banned.contains(&addr) {
                        self.known_peers.insert(addr);
                    }
                }
                self.connect_more_peers();
            }
            Command::RemovePeer(addr) => {
                self.known_peers.remove(&addr);
                if let Some(key) = self.peer_by_addr.get(&addr).copied() {
                    self.close_peer(key);
                }
            }
            Command::AddIncoming(stream, addr) => self.accept_incoming(stream, addr),
            Command::ProvideInfo(info) => self.handle_provide_info(info),
            Command::SetPriority(piece, priority) => {
                if let Some(content) = &mut self.content {
                    content.picker.set_priority(piece, priority);
                }
            }
            Command::SetSequential(sequential) => {
                if let Some(content) = &mut self.content {
                    content.picker.set_sequential(sequential);
                }
            }
            Command::Status(reply) => {
                let _ = reply.send(self.status.clone());
            }
            Command::Stats(reply) => {
                let _ = reply.send(self.current_stats());
            }
            Command::Bitfield(reply) => {
                let _ = reply.send(self.content.as_ref().map(|c| c.picker.bitfield()));
            }
            Command::Shutdown(_) => unreachable!("handled in run()"),
        }
    }

    fn start_torrent(&mut self) {
        if self.started || matches!(self.status, TorrentStatus::Errored(_)) {
            return;
        }
        self.started = true;
        self.paused = false;
        self.cancel = CancellationToken::new();
        self.known_peers.extend(self.fixed_peers.iter().copied());
        let _ = self.events.send(TorrentEvent::Started);

        match self.content.as_ref().map(|c| c.picker.bitfield()) {
            Some(claimed) => {
                self.set_status(TorrentStatus::Verifying);
                self.spawn_verification(claimed);
            }
            None => {
                // Magnet add: announce and wait for the metadata
                // collaborator; peers are useless to us until then beyond
                // keeping the connection warm.
                self.set_status(TorrentStatus::DownloadingMetadata);
                self.start_announcers();
                self.connect_more_peers();
            }
        }
    }

    /// Re-hash data on disk off-loop and report the trustworthy bitfield.
    /// With a resume bitfield only a sample is re-read; a failed sample
    /// falls back to the full scan.
    fn spawn_verification(&mut self, claimed: Bitfield) {
        let Some(content) = &self.content else { return };
        let pieces = content.pieces.clone();
        let storage = Arc::clone(&self.collab.storage);
        let report_tx = self.verify_tx.clone();
        let trust_sample = self.counters.downloaded > 0 || claimed.count() > 0;

        self.workers.spawn(async move {
            let bitfield = if trust_sample
                && sample_verify(&storage, &pieces, &claimed, RESUME_SAMPLE_PIECES).await
            {
                claimed
            } else {
                full_verify(&storage, &pieces).await
            };
            let _ = report_tx.send(VerifyReport { bitfield }).await;
        });
    }

    fn handle_verify_report(&mut self, report: VerifyReport) {
        if !self.started {
            return;
        }
        let Some(content) = &mut self.content else { return };

        // Rebuild piece state from the verified bitfield
        for index in 0..content.picker.len() {
            let verified = report.bitfield.has(index);
            let state = content.picker.state(index as u32);
            match (verified, state) {
                (true, Some(s)) if s != PieceState::Have => content.picker.mark_have(index as u32),
                (false, Some(PieceState::Have)) => content.picker.mark_missing(index as u32),
                _ => {}
            }
        }

        let complete = content.picker.is_complete();
        if complete {
            self.seeding_since = Some(Instant::now());
            self.set_status(TorrentStatus::Seeding);
        } else {
            self.set_status(TorrentStatus::Downloading);
        }
        self.resume_dirty = true;
        self.publish_swarm_counters();
        self.start_announcers();
        self.connect_more_peers();
        self.schedule_webseeds();
    }

    async fn stop_torrent(&mut self, finaled: bool) {
        if !self.started {
            if finaled {
                self.write_resume_now().await;
            }
            return;
        }
        self.set_status(TorrentStatus::Stopping);
        self.started = false;
        self.announcers_started = false;
        self.announcer_cmds.clear();

        // Broadcast cancel; workers acknowledge by finishing. Announcers
        // send their `stopped` on the way out.
        self.cancel.cancel();
        let deadline = Instant::now() + self.config.stop_grace;
        while !self.workers.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::warn!("torrent {}: aborting stragglers on stop", self.id);
                self.workers.abort_all();
                while self.workers.join_next().await.is_some() {}
                break;
            }
            match tokio::time::timeout(remaining, self.workers.join_next()).await {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) => continue,
            }
        }

        self.drain_worker_channels();

        // Buffers in flight are gone; their pieces go back to Missing.
        if let Some(content) = &mut self.content {
            for index in content.writing.drain() {
                content.picker.mark_missing(index);
            }
            let assigned: Vec<u32> = content.downloads.keys().map(|(_, piece)| *piece).collect();
            content.downloads.clear();
            for index in assigned {
                content.picker.release(index);
            }
        }
        self.peers.clear();
        self.peer_by_addr.clear();

        self.write_resume_now().await;
        if !matches!(self.status, TorrentStatus::Errored(_)) {
            self.set_status(TorrentStatus::Stopped);
        }
        let _ = self.events.send(TorrentEvent::Stopped);
    }

    /// Throw away already-queued worker traffic after a stop so a restart
    /// begins clean.
    fn drain_worker_channels(&mut self) {
        while self.peer_events.try_recv().is_ok() {}
        while self.writer_rx.try_recv().is_ok() {}
        while self.webseed_rx.try_recv().is_ok() {}
        while self.announcer_rx.try_recv().is_ok() {}
        while self.verify_rx.try_recv().is_ok() {}
    }

    fn pause_torrent(&mut self) {
        if self.paused || !self.started {
            return;
        }
        self.paused = true;
        // Withdraw outstanding requests; connections stay up.
        let keys: Vec<PeerKey> = self.peers.keys().copied().collect();
        for key in keys {
            self.abandon_peer_downloads(key, true);
        }
    }

    fn resume_torrent(&mut self) {
        if !self.paused {
            return;
        }
        self.paused = false;
        let keys: Vec<PeerKey> = self.peers.keys().copied().collect();
        for key in keys {
            self.fill_request_pipeline(key);
        }
        self.schedule_webseeds();
    }

    fn handle_provide_info(&mut self, info: Arc<Info>) {
        if self.content.is_some() {
            return;
        }
        let picker_seed = derive_picker_seed(&self.config, &self.info_hash);
        self.name = info.name.clone();
        self.content = Some(Self::build_content(&info, &self.config, picker_seed, None));
        self.resume_dirty = true;

        if self.started {
            self.set_status(TorrentStatus::Verifying);
            self.spawn_verification(Bitfield::new(info.num_pieces()));
            // Existing metadata-phase peers know nothing about our pieces;
            // simplest correct move is a fresh connection pass.
            let keys: Vec<PeerKey> = self.peers.keys().copied().collect();
            for key in keys {
                self.close_peer(key);
            }
        }
    }

    fn fail_torrent(&mut self, message: String) {
        tracing::error!("torrent {} failed: {}", self.id, message);
        self.last_error = Some(message.clone());
        self.set_status(TorrentStatus::Errored(message));
        self.started = false;
        self.announcers_started = false;
        self.announcer_cmds.clear();
        self.cancel.cancel();
        self.workers.abort_all();
        self.peers.clear();
        self.peer_by_addr.clear();
        if let Some(content) = &mut self.content {
            content.downloads.clear();
            content.writing.clear();
        }
    }

    // ------------------------------------------------------------------
    // Announcers and peer discovery
    // ------------------------------------------------------------------

    fn start_announcers(&mut self) {
        if self.announcers_started || self.trackers.is_empty() {
            self.announcers_started = true;
            return;
        }
        self.announcers_started = true;

        let identity = AnnounceIdentity {
            info_hash: self.info_hash,
            peer_id: self.our_peer_id,
            port: self.port,
        };
        let announcer_config = AnnouncerConfig {
            min_interval: self.config.min_announce_interval,
            max_interval: self.config.max_announce_interval,
            backoff_initial: self.config.announce_backoff_initial,
            backoff_max: self.config.announce_backoff_max,
            numwant: self.config.max_peers as u32,
        };
        self.publish_swarm_counters();

        for tier in self.trackers.clone() {
            let (cmd_tx, cmd_rx) = mpsc::channel(4);
            self.announcer_cmds.push(cmd_tx);
            self.workers.spawn(announcer::run_tier(
                tier,
                Arc::clone(&self.collab.tracker),
                identity,
                self.counters_watch.subscribe(),
                self.announcer_tx.clone(),
                cmd_rx,
                self.cancel.clone(),
                announcer_config,
            ));
        }
    }

    fn handle_announcer_event(&mut self, event: AnnouncerEvent) {
        match event {
            AnnouncerEvent::Peers { peers } => {
                let mut new = 0;
                for addr in peers {
                    if !self.banned.contains(&addr) && self.known_peers.insert(addr) {
                        new += 1;
                    }
                }
                if new > 0 {
                    tracing::debug!("torrent {}: {} new peer addresses", self.id, new);
                    self.connect_more_peers();
                }
            }
        }
    }

    fn session_timeouts(&self) -> SessionTimeouts {
        SessionTimeouts {
            connect: self.config.connect_timeout,
            handshake: self.config.handshake_timeout,
            keepalive: self.config.keepalive_interval,
            idle: self.config.idle_timeout,
        }
    }

    fn connect_more_peers(&mut self) {
        if !self.started || self.paused || !self.status.is_active_for_peers() {
            return;
        }
        let candidates: Vec<SocketAddr> = self
            .known_peers
            .iter()
            .filter(|addr| !self.peer_by_addr.contains_key(addr) && !self.banned.contains(addr))
            .take(self.config.max_peers.saturating_sub(self.peers.len()))
            .copied()
            .collect();

        for addr in candidates {
            let (key, commands) = self.register_peer(addr);
            let params = self.session_params(key, addr, commands);
            self.workers.spawn(connection::run_outbound(params));
        }
    }

    fn accept_incoming(&mut self, stream: TcpStream, addr: SocketAddr) {
        if !self.started
            || self.banned.contains(&addr)
            || self.peers.len() >= self.config.max_peers
        {
            return;
        }
        let (key, commands) = self.register_peer(addr);
        let params = self.session_params(key, addr, commands);
        self.workers.spawn(connection::run_inbound(stream, params));
    }

    /// Create the loop-side peer entry; the returned receiver goes to the
    /// session's writer half.
    fn register_peer(&mut self, addr: SocketAddr) -> (PeerKey, mpsc::Receiver<PeerCommand>) {
        let key = PeerKey(self.next_peer_key);
        self.next_peer_key += 1;

        let (cmd_tx, cmd_rx) = mpsc::channel(self.config.request_queue_len * 2);
        let num_pieces = self.content.as_ref().map(|c| c.pieces.len()).unwrap_or(0);
        let state = PeerState::new(key, addr, cmd_tx, num_pieces, self.config.rate_window);
        self.peers.insert(key, state);
        self.peer_by_addr.insert(addr, key);
        (key, cmd_rx)
    }

    fn session_params(
        &self,
        key: PeerKey,
        addr: SocketAddr,
        commands: mpsc::Receiver<PeerCommand>,
    ) -> SessionParams {
        SessionParams {
            key,
            addr,
            info_hash: self.info_hash,
            our_peer_id: self.our_peer_id,
            events: self.peer_events_tx.clone(),
            commands,
            limits: self.collab.limits.clone(),
            cancel: self.cancel.clone(),
            timeouts: self.session_timeouts(),
        }
    }

    // ------------------------------------------------------------------
    // Peer events
    // ------------------------------------------------------------------

    fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Connected {
                key,
                addr,
                peer_id,
                fast,
            } => {
                let Some(peer) = self.peers.get_mut(&key) else { return };
                peer.connected = true;
                peer.connected_at = Instant::now();
                peer.peer_id = Some(peer_id);
                peer.fast = fast;
                let _ = self.events.send(TorrentEvent::PeerConnected { addr });
                self.send_initial_bitfield(key);
            }
            PeerEvent::Message { key, msg } => self.handle_peer_message(key, msg),
            PeerEvent::Uploaded { key, bytes } => {
                self.counters.uploaded += bytes;
                self.upload_meter.record(bytes);
                self.resume_dirty = true;
                if let Some(peer) = self.peers.get_mut(&key) {
                    peer.uploaded += bytes;
                    peer.upload_meter.record(bytes);
                    peer.upload_active = false;
                }
                self.serve_next_upload(key);
            }
            PeerEvent::Closed { key, reason } => self.handle_peer_closed(key, reason),
        }
    }

    fn send_initial_bitfield(&mut self, key: PeerKey) {
        let Some(content) = &self.content else {
            return;
        };
        let bitfield = content.picker.bitfield();
        let Some(peer) = self.peers.get(&key) else { return };

        if peer.fast {
            // Fast extension replaces the implicit empty bitfield
            if bitfield.count() == 0 {
                peer.send(PeerMessage::HaveNone);
            } else if bitfield.is_complete() {
                peer.send(PeerMessage::HaveAll);
            } else {
                peer.send(PeerMessage::Bitfield {
                    bytes: bitfield.serialize(),
                });
            }
        } else if bitfield.count() > 0 {
            peer.send(PeerMessage::Bitfield {
                bytes: bitfield.serialize(),
            });
        }
    }

    fn handle_peer_closed(&mut self, key: PeerKey, reason: CloseReason) {
        let Some(peer) = self.peers.remove(&key) else { return };
        self.peer_by_addr.remove(&peer.addr);
        self.choker.peer_disconnected(key);

        if reason.is_violation() {
            self.banned.insert(peer.addr);
            self.known_peers.remove(&peer.addr);
        }

        if peer.connected {
            if let Some(content) = &mut self.content {
                content.picker.peer_removed(&peer.bitfield);
            }
            let _ = self
                .events
                .send(TorrentEvent::PeerDisconnected { addr: peer.addr });
        }

        // Closed is terminal: every outstanding request goes back to the
        // picker.
        self.drop_peer_downloads(key);
        tracing::debug!("torrent {}: {} closed ({:?})", self.id, peer.addr, reason);
        self.connect_more_peers();
    }

    /// Remove all of a peer's downloads, releasing their assignments.
    fn drop_peer_downloads(&mut self, key: PeerKey) {
        let Some(content) = &mut self.content else { return };
        let pieces: Vec<u32> = content
            .downloads
            .keys()
            .filter(|(k, _)| *k == key)
            .map(|(_, piece)| *piece)
            .collect();
        for piece in pieces {
            content.downloads.remove(&(key, piece));
            content.picker.release(piece);
        }
    }

    /// Cancel a peer's outstanding requests (sending Cancel frames) and
    /// optionally drop its downloads.
    fn abandon_peer_downloads(&mut self, key: PeerKey, send_cancels: bool) {
        let inflight: Vec<BlockInfo> = match self.peers.get(&key) {
            Some(peer) => peer.inflight.iter().copied().collect(),
            None => return,
        };
        if send_cancels {
            if let Some(peer) = self.peers.get(&key) {
                for block in &inflight {
                    peer.send(PeerMessage::Cancel {
                        index: block.piece,
                        begin: block.offset,
                        length: block.length,
                    });
                }
            }
        }
        if let Some(peer) = self.peers.get_mut(&key) {
            peer.inflight.clear();
        }
        self.drop_peer_downloads(key);
    }

    fn handle_peer_message(&mut self, key: PeerKey, msg: PeerMessage) {
        if !self.peers.contains_key(&key) {
            return;
        }

        // Bitfield / HaveAll / HaveNone are only legal before any other
        // message; track that before dispatching.
        let first_message = !self.peers[&key].saw_first_message;
        if !matches!(msg, PeerMessage::KeepAlive) {
            if let Some(peer) = self.peers.get_mut(&key) {
                peer.saw_first_message = true;
            }
        }

        match msg {
            PeerMessage::KeepAlive => {}
            PeerMessage::Choke => self.on_choke(key),
            PeerMessage::Unchoke => {
                if let Some(peer) = self.peers.get_mut(&key) {
                    peer.peer_choking = false;
                }
                self.fill_request_pipeline(key);
            }
            PeerMessage::Interested => {
                if let Some(peer) = self.peers.get_mut(&key) {
                    peer.peer_interested = true;
                }
            }
            PeerMessage::NotInterested => {
                if let Some(peer) = self.peers.get_mut(&key) {
                    peer.peer_interested = false;
                }
            }
            PeerMessage::Have { index } => self.on_have(key, index),
            PeerMessage::Bitfield { bytes } => self.on_bitfield(key, bytes, first_message),
            PeerMessage::HaveAll => self.on_have_all(key, first_message, true),
            PeerMessage::HaveNone => self.on_have_all(key, first_message, false),
            PeerMessage::Request {
                index,
                begin,
                length,
            } => self.on_request(key, index, begin, length),
            PeerMessage::Piece {
                index,
                begin,
                block,
            } => self.on_piece(key, index, begin, block),
            PeerMessage::Cancel {
                index,
                begin,
                length,
            } => {
                if let Some(peer) = self.peers.get_mut(&key) {
                    let block = BlockInfo {
                        piece: index,
                        offset: begin,
                        length,
                    };
                    peer.upload_queue.retain(|b| *b != block);
                }
            }
            PeerMessage::Reject {
                index,
                begin,
                length,
            } => self.on_reject(key, index, begin, length),
            PeerMessage::AllowedFast { index } => {
                let fast = self.peers.get(&key).map(|p| p.fast).unwrap_or(false);
                if !fast {
                    self.protocol_violation(key, "allowed-fast without fast extension");
                    return;
                }
                let in_range = self
                    .content
                    .as_ref()
                    .map(|c| (index as usize) < c.pieces.len())
                    .unwrap_or(false);
                if in_range {
                    if let Some(peer) = self.peers.get_mut(&key) {
                        peer.allowed_fast.insert(index);
                    }
                    self.fill_request_pipeline(key);
                }
            }
            PeerMessage::SuggestPiece { index } => {
                tracing::trace!("torrent {}: {} suggests piece {}", self.id, key, index);
            }
            PeerMessage::Port { port } => {
                // DHT collaborator hint; nothing to do in the core.
                tracing::trace!("torrent {}: {} announced DHT port {}", self.id, key, port);
            }
            PeerMessage::Unknown { id, .. } => {
                tracing::trace!("torrent {}: {} sent unknown message {}", self.id, key, id);
            }
        }
    }

    fn protocol_violation(&mut self, key: PeerKey, reason: &str) {
        if let Some(peer) = self.peers.get(&key) {
            tracing::debug!(
                "torrent {}: dropping {} for protocol violation: {}",
                self.id,
                peer.addr,
                reason
            );
            self.banned.insert(peer.addr);
            self.known_peers.remove(&peer.addr);
        }
        self.close_peer(key);
    }

    /// Ask the session to close; the Closed event performs the cleanup.
    fn close_peer(&mut self, key: PeerKey) {
        if let Some(peer) = self.peers.get(&key) {
            let _ = peer.commands.try_send(PeerCommand::Close);
        }
    }

    fn on_choke(&mut self, key: PeerKey) {
        let fast = match self.peers.get_mut(&key) {
            Some(peer) => {
                peer.peer_choking = true;
                peer.fast
            }
            None => return,
        };
        // Without the fast extension a choke implicitly discards all our
        // requests; fast peers answer them with explicit Reject/Piece.
        if !fast {
            if let Some(peer) = self.peers.get_mut(&key) {
                peer.inflight.clear();
            }
            self.drop_peer_downloads(key);
        }
    }

    fn on_have(&mut self, key: PeerKey, index: u32) {
        let Some(content) = &mut self.content else { return };
        if index as usize >= content.pieces.len() {
            return;
        }
        if let Some(peer) = self.peers.get_mut(&key) {
            if !peer.bitfield.has(index as usize) {
                peer.bitfield.set(index as usize);
                content.picker.peer_has(index);
            }
        }
        self.update_interest(key);
        self.fill_request_pipeline(key);
    }

    fn on_bitfield(&mut self, key: PeerKey, bytes: Vec<u8>, first_message: bool) {
        if !first_message {
            self.protocol_violation(key, "bitfield after first message");
            return;
        }
        let Some(content) = &mut self.content else {
            // No piece table yet (metadata phase); nothing to record.
            return;
        };
        let parsed = Bitfield::parse(&bytes, content.pieces.len());
        match parsed {
            Ok(bitfield) => {
                content.picker.peer_added(&bitfield);
                if let Some(peer) = self.peers.get_mut(&key) {
                    peer.bitfield = bitfield;
                }
                self.update_interest(key);
                self.fill_request_pipeline(key);
            }
            Err(e) => {
                self.protocol_violation(key, &e.to_string());
            }
        }
    }

    fn on_have_all(&mut self, key: PeerKey, first_message: bool, all: bool) {
        let fast = self.peers.get(&key).map(|p| p.fast).unwrap_or(false);
        if !fast {
            self.protocol_violation(key, "have-all/have-none without fast extension");
            return;
        }
        if !first_message {
            self.protocol_violation(key, "have-all/have-none after first message");
            return;
        }
        let Some(content) = &mut self.content else { return };
        if all {
            let full = Bitfield::full(content.pieces.len());
            content.picker.peer_added(&full);
            if let Some(peer) = self.peers.get_mut(&key) {
                peer.bitfield = full;
            }
            self.update_interest(key);
            self.fill_request_pipeline(key);
        }
        // HaveNone leaves the zeroed bitfield in place
    }

    fn on_request(&mut self, key: PeerKey, index: u32, begin: u32, length: u32) {
        let Some(content) = &self.content else { return };

        let valid = (index as usize) < content.pieces.len()
            && content.pieces[index as usize].valid_request(begin, length)
            && content.picker.state(index) == Some(PieceState::Have);

        let Some(peer) = self.peers.get_mut(&key) else { return };
        let block = BlockInfo {
            piece: index,
            offset: begin,
            length,
        };

        if peer.am_choking || !valid {
            // Drop, or tell fast-extension peers explicitly
            if peer.fast {
                peer.send(PeerMessage::Reject {
                    index,
                    begin,
                    length,
                });
            }
            return;
        }

        // Bounded upload queue; a peer flooding requests loses the excess
        if peer.upload_queue.len() >= self.config.request_queue_len {
            if peer.fast {
                peer.send(PeerMessage::Reject {
                    index,
                    begin,
                    length,
                });
            }
            return;
        }
        peer.upload_queue.push_back(block);
        self.serve_next_upload(key);
    }

    /// Serve the head of a peer's upload queue off-loop: read the block in
    /// a task, push the Piece frame into the peer's writer, report bytes
    /// back via the fan-in channel.
    fn serve_next_upload(&mut self, key: PeerKey) {
        let Some(peer) = self.peers.get_mut(&key) else { return };
        if peer.upload_active || peer.am_choking {
            return;
        }
        let Some(block) = peer.upload_queue.pop_front() else { return };
        peer.upload_active = true;

        let storage = Arc::clone(&self.collab.storage);
        let commands = peer.commands.clone();
        let events = self.peer_events_tx.clone();
        self.workers.spawn(async move {
            match storage
                .read_block(block.piece, block.offset, block.length)
                .await
            {
                Ok(data) => {
                    let bytes = data.len() as u64;
                    let frame = PeerMessage::Piece {
                        index: block.piece,
                        begin: block.offset,
                        block: data,
                    };
                    let _ = commands.send(PeerCommand::Send(frame)).await;
                    let _ = events.send(PeerEvent::Uploaded { key, bytes }).await;
                }
                Err(e) => {
                    tracing::warn!("upload read failed for piece {}: {}", block.piece, e);
                    let _ = events.send(PeerEvent::Uploaded { key, bytes: 0 }).await;
                }
            }
        });
    }

    fn on_piece(&mut self, key: PeerKey, index: u32, begin: u32, data: Vec<u8>) {
        let Some(content) = &mut self.content else { return };
        if index as usize >= content.pieces.len() {
            // Out-of-range piece data is dropped, not fatal
            return;
        }

        let bytes = data.len() as u64;
        self.download_meter.record(bytes);
        if let Some(peer) = self.peers.get_mut(&key) {
            peer.note_block(bytes);
            peer.inflight.remove(&BlockInfo {
                piece: index,
                offset: begin,
                length: data.len() as u32,
            });
        }

        let Some(download) = content.downloads.get_mut(&(key, index)) else {
            // Late block for a piece finished elsewhere (endgame) or one we
            // cancelled: discard and account for it.
            self.counters.wasted += bytes;
            return;
        };

        match download.on_block(begin, &data) {
            Ok(Some(buffer)) => {
                content.downloads.remove(&(key, index));
                self.cancel_competing_downloads(index, key);
                self.begin_write(index, buffer, PieceSource::Peer(key));
                self.fill_request_pipeline(key);
            }
            Ok(None) => {
                self.fill_request_pipeline(key);
            }
            Err(e) => {
                self.protocol_violation(key, &e.to_string());
            }
        }
    }

    /// Endgame bookkeeping: a piece completed through one source; every
    /// other download of it gets a Cancel and is dropped.
    fn cancel_competing_downloads(&mut self, index: u32, winner: PeerKey) {
        let Some(content) = &mut self.content else { return };
        let losers: Vec<PeerKey> = content
            .downloads
            .keys()
            .filter(|(k, piece)| *piece == index && *k != winner)
            .map(|(k, _)| *k)
            .collect();

        for loser in losers {
            if let Some(download) = content.downloads.remove(&(loser, index)) {
                content.picker.release(index);
                if let Some(peer) = self.peers.get_mut(&loser) {
                    for block in download.requested_blocks() {
                        peer.inflight.remove(&block);
                        peer.send(PeerMessage::Cancel {
                            index: block.piece,
                            begin: block.offset,
                            length: block.length,
                        });
                    }
                }
            }
        }
    }

    fn on_reject(&mut self, key: PeerKey, index: u32, begin: u32, length: u32) {
        let fast = self.peers.get(&key).map(|p| p.fast).unwrap_or(false);
        if !fast {
            self.protocol_violation(key, "reject without fast extension");
            return;
        }
        if let Some(peer) = self.peers.get_mut(&key) {
            peer.inflight.remove(&BlockInfo {
                piece: index,
                offset: begin,
                length,
            });
        }
        let Some(content) = &mut self.content else { return };
        let choking = self
            .peers
            .get(&key)
            .map(|p| !p.may_request_piece(index))
            .unwrap_or(true);

        if let Some(download) = content.downloads.get_mut(&(key, index)) {
            download.on_reject(begin);
            if choking {
                // The peer will not serve this piece now; hand it back
                content.downloads.remove(&(key, index));
                content.picker.release(index);
            }
        }
    }

    fn update_interest(&mut self, key: PeerKey) {
        let Some(content) = &self.content else { return };
        let Some(peer) = self.peers.get_mut(&key) else { return };
        if !peer.connected {
            return;
        }
        let interesting = content.picker.is_interesting(&peer.bitfield);
        if interesting && !peer.am_interested {
            peer.am_interested = true;
            peer.send(PeerMessage::Interested);
        } else if !interesting && peer.am_interested {
            peer.am_interested = false;
            peer.send(PeerMessage::NotInterested);
        }
    }

    /// Keep a peer's request pipeline full: top up existing downloads, then
    /// pick new pieces while budget remains.
    fn fill_request_pipeline(&mut self, key: PeerKey) {
        if self.paused
            || !self.started
            || !matches!(self.status, TorrentStatus::Downloading)
        {
            return;
        }
        let Some(content) = &mut self.content else { return };
        let Some(peer) = self.peers.get_mut(&key) else { return };
        if !peer.connected || !peer.am_interested || !peer.can_request() || peer.snubbed_since.is_some()
        {
            return;
        }

        let mut budget = self
            .config
            .request_queue_len
            .saturating_sub(peer.inflight.len());
        if budget == 0 {
            return;
        }

        let mut to_send: Vec<BlockInfo> = Vec::new();

        // Top up pieces already assigned to this peer
        let mut own_pieces: HashSet<u32> = HashSet::new();
        for ((k, piece), download) in content.downloads.iter_mut() {
            if *k != key || budget == 0 {
                if *k == key {
                    own_pieces.insert(*piece);
                }
                continue;
            }
            own_pieces.insert(*piece);
            if !peer.may_request_piece(*piece) {
                continue;
            }
            let requests = download.next_requests(budget);
            budget -= requests.len();
            to_send.extend(requests);
        }

        // Open new downloads while the pipeline has room
        while budget > 0 {
            let effective = if peer.peer_choking {
                // Choked: only allowed-fast pieces are reachable
                let mut bf = Bitfield::new(peer.bitfield.len());
                for &piece in &peer.allowed_fast {
                    if peer.bitfield.has(piece as usize) {
                        bf.set(piece as usize);
                    }
                }
                bf
            } else {
                peer.bitfield.clone()
            };

            let Some(index) = content.picker.pick(&effective, &own_pieces) else {
                break;
            };
            content.picker.assign(index);
            own_pieces.insert(index);

            let mut download =
                PieceDownload::new(content.pieces[index as usize].clone(), key);
            let requests = download.next_requests(budget);
            budget -= requests.len();
            to_send.extend(requests);
            content.downloads.insert((key, index), download);
        }

        for block in to_send {
            peer.inflight.insert(block);
            peer.send(PeerMessage::Request {
                index: block.piece,
                begin: block.offset,
                length: block.length,
            });
        }
    }

    // ------------------------------------------------------------------
    // Piece results, writing, verification
    // ------------------------------------------------------------------

    /// Hand a completed buffer to a writer task unless a writer already
    /// owns this piece index.
    fn begin_write(&mut self, index: u32, buffer: Vec<u8>, source: PieceSource) {
        let Some(content) = &mut self.content else { return };
        if content.writing.contains(&index)
            || content.picker.state(index) == Some(PieceState::Have)
        {
            // At-most-one-writer-per-piece: the duplicate buffer is dropped.
            self.counters.wasted += buffer.len() as u64;
            tracing::debug!(
                "torrent {}: discarding duplicate buffer for piece {}",
                self.id,
                index
            );
            return;
        }

        content.writing.insert(index);
        content.picker.mark_writing(index);

        let piece = content.pieces[index as usize].clone();
        self.workers.spawn(writer::run(
            piece,
            buffer,
            source,
            Arc::clone(&self.collab.storage),
            self.writer_tx.clone(),
        ));
    }

    async fn handle_writer_result(&mut self, result: WriterResult) {
        match result {
            WriterResult::Verified { index, source } => self.on_piece_verified(index, source),
            WriterResult::Failed { index, source } => self.on_piece_failed(index, source),
            WriterResult::StorageError { index, message } => {
                if let Some(content) = &mut self.content {
                    content.writing.remove(&index);
                    content.picker.mark_missing(index);
                }
                // Storage failures are fatal: park the torrent in Errored
                // and tell the swarm we are gone.
                for cmds in &self.announcer_cmds {
                    let _ = cmds.try_send(AnnouncerCommand::AnnounceNow(AnnounceEvent::Stopped));
                }
                self.fail_torrent(message);
                self.write_resume_now().await;
            }
        }
    }

    fn on_piece_verified(&mut self, index: u32, source: PieceSource) {
        let piece_length = {
            let Some(content) = &mut self.content else { return };
            content.writing.remove(&index);
            content.picker.mark_have(index);
            content.pieces[index as usize].length as u64
        };

        self.counters.downloaded += piece_length;
        self.resume_dirty = true;
        if let PieceSource::Peer(key) = source {
            if let Some(peer) = self.peers.get_mut(&key) {
                peer.hash_failures = 0;
            }
        }
        let _ = self.events.send(TorrentEvent::PieceVerified { index });

        // Tell everyone who does not have it, and re-evaluate interest
        let keys: Vec<PeerKey> = self.peers.keys().copied().collect();
        for key in keys {
            if let Some(peer) = self.peers.get(&key) {
                if peer.connected && !peer.bitfield.has(index as usize) {
                    peer.send(PeerMessage::Have { index });
                }
            }
            self.update_interest(key);
        }

        self.publish_swarm_counters();

        let complete = self
            .content
            .as_ref()
            .map(|c| c.picker.is_complete())
            .unwrap_or(false);
        if complete && self.status == TorrentStatus::Downloading {
            self.seeding_since = Some(Instant::now());
            self.set_status(TorrentStatus::Seeding);
            let _ = self.events.send(TorrentEvent::Completed);
            for cmds in &self.announcer_cmds {
                let _ = cmds.try_send(AnnouncerCommand::AnnounceNow(AnnounceEvent::Completed));
            }
        }
    }

    fn on_piece_failed(&mut self, index: u32, source: PieceSource) {
        let piece_length = {
            let Some(content) = &mut self.content else { return };
            content.writing.remove(&index);
            content.picker.mark_missing(index);
            content.pieces[index as usize].length as u64
        };

        self.counters.wasted += piece_length;
        self.resume_dirty = true;
        let _ = self.events.send(TorrentEvent::PieceFailed { index });

        match source {
            PieceSource::Peer(key) => {
                // The supplier of the failing buffer is suspect
                let drop_peer = match self.peers.get_mut(&key) {
                    Some(peer) => {
                        peer.hash_failures += 1;
                        peer.hash_failures >= self.config.max_hash_failures
                    }
                    None => false,
                };
                if drop_peer {
                    tracing::debug!(
                        "torrent {}: dropping {} after repeated hash failures",
                        self.id,
                        key
                    );
                    if let Some(peer) = self.peers.get(&key) {
                        self.banned.insert(peer.addr);
                        self.known_peers.remove(&peer.addr);
                    }
                    self.close_peer(key);
                }
            }
            PieceSource::Webseed(url) => {
                let now = Instant::now();
                if let Some(source) = self.webseeds.iter_mut().find(|s| s.url == url) {
                    source.finish_failure(now, self.config.webseed_backoff_max);
                }
            }
        }
    }

    fn handle_webseed_result(&mut self, result: WebseedPieceResult) {
        let WebseedPieceResult { url, index, result } = result;
        match result {
            Ok(buffer) => {
                if let Some(source) = self.webseeds.iter_mut().find(|s| s.url == url) {
                    source.finish_success(self.config.webseed_backoff_initial);
                }
                // The fetch held an assignment; drop it before writing
                if let Some(content) = &mut self.content {
                    content.picker.release(index);
                }
                self.cancel_all_downloads_of(index);
                self.begin_write(index, buffer, PieceSource::Webseed(url));
            }
            Err(e) => {
                tracing::debug!(
                    "torrent {}: webseed {} failed piece {}: {}",
                    self.id,
                    url,
                    index,
                    e
                );
                let now = Instant::now();
                if let Some(source) = self.webseeds.iter_mut().find(|s| s.url == url) {
                    source.finish_failure(now, self.config.webseed_backoff_max);
                }
                // The piece returns to Missing so peers pick it up again.
                if let Some(content) = &mut self.content {
                    content.picker.release(index);
                }
            }
        }
    }

    /// Cancel every peer download of a piece (webseed completed it).
    fn cancel_all_downloads_of(&mut self, index: u32) {
        let Some(content) = &mut self.content else { return };
        let holders: Vec<PeerKey> = content
            .downloads
            .keys()
            .filter(|(_, piece)| *piece == index)
            .map(|(k, _)| *k)
            .collect();
        for holder in holders {
            if let Some(download) = content.downloads.remove(&(holder, index)) {
                content.picker.release(index);
                if let Some(peer) = self.peers.get_mut(&holder) {
                    for block in download.requested_blocks() {
                        peer.inflight.remove(&block);
                        peer.send(PeerMessage::Cancel {
                            index: block.piece,
                            begin: block.offset,
                            length: block.length,
                        });
                    }
                }
            }
        }
    }

    /// Assign missing pieces to idle webseed URLs.
    fn schedule_webseeds(&mut self) {
        if self.paused
            || !self.started
            || self.webseeds.is_empty()
            || !matches!(self.status, TorrentStatus::Downloading)
        {
            return;
        }
        let Some(content) = &mut self.content else { return };

        let client = match &self.webseed_client {
            Some(client) => client.clone(),
            None => match webseed::build_client(self.config.webseed_timeout, &self.config.user_agent)
            {
                Ok(client) => {
                    self.webseed_client = Some(client.clone());
                    client
                }
                Err(e) => {
                    tracing::warn!("torrent {}: webseed client unavailable: {}", self.id, e);
                    return;
                }
            },
        };

        let now = Instant::now();
        let everything = Bitfield::full(content.pieces.len());
        // Pieces other webseeds are already fetching
        let mut active: HashSet<u32> = self
            .webseeds
            .iter()
            .filter_map(|s| s.active_piece)
            .collect();

        for source in &mut self.webseeds {
            if !source.is_available(now) {
                continue;
            }
            let Some(index) = content.picker.pick(&everything, &active) else {
                break;
            };
            content.picker.assign(index);
            source.begin(index);
            active.insert(index);

            self.workers.spawn(webseed::fetch_piece(
                client.clone(),
                source.url.clone(),
                Arc::clone(&content.info),
                index,
                self.webseed_tx.clone(),
            ));
        }
    }

    // ------------------------------------------------------------------
    // Periodic work
    // ------------------------------------------------------------------

    fn handle_stats_tick(&mut self) {
        if !self.started {
            return;
        }

        self.check_snubbed_peers();
        self.schedule_webseeds();
        self.connect_more_peers();

        // Top up request pipelines that ran dry between events
        let keys: Vec<PeerKey> = self.peers.keys().copied().collect();
        for key in keys {
            self.fill_request_pipeline(key);
        }

        self.publish_swarm_counters();
        self.maybe_write_resume();
    }

    /// A peer with outstanding requests and no block for `snub_timeout` is
    /// snubbed: cancel its requests and hand the blocks back to the picker.
    /// The suspension is temporary; after two penalty windows the peer may
    /// earn requests again.
    fn check_snubbed_peers(&mut self) {
        let now = Instant::now();
        let parole = self.config.snub_penalty * 2;
        let snubbed: Vec<PeerKey> = self
            .peers
            .values()
            .filter(|peer| {
                peer.connected
                    && !peer.inflight.is_empty()
                    && peer.snubbed_since.is_none()
                    && now.duration_since(peer.last_block_at) >= self.config.snub_timeout
            })
            .map(|peer| peer.key)
            .collect();

        for peer in self.peers.values_mut() {
            if let Some(since) = peer.snubbed_since {
                if now.duration_since(since) >= parole {
                    peer.snubbed_since = None;
                    // Restart the stall clock or the next round re-snubs
                    // immediately
                    peer.last_block_at = now;
                }
            }
        }

        for key in snubbed {
            tracing::debug!("torrent {}: {} snubbed", self.id, key);
            if let Some(peer) = self.peers.get_mut(&key) {
                peer.snubbed_since = Some(now);
            }
            self.abandon_peer_downloads(key, true);
        }
    }

    fn run_choke_round(&mut self) {
        if !self.started || self.peers.is_empty() {
            return;
        }
        let seeding = matches!(self.status, TorrentStatus::Seeding);
        let now = Instant::now();

        let ranks: Vec<crate::choker::PeerRank> = self
            .peers
            .values_mut()
            .filter(|peer| peer.connected)
            .map(|peer| crate::choker::PeerRank {
                key: peer.key,
                rate: if seeding {
                    peer.upload_meter.rate()
                } else {
                    peer.download_meter.rate()
                },
                interested: peer.peer_interested,
                unchoked: !peer.am_choking,
                snubbed_for: peer.snubbed_for(now),
                age: now.duration_since(peer.connected_at),
            })
            .collect();

        for action in self.choker.run_round(&ranks) {
            match action {
                crate::choker::ChokeAction::Unchoke(key) => {
                    if let Some(peer) = self.peers.get_mut(&key) {
                        peer.am_choking = false;
                        peer.send(PeerMessage::Unchoke);
                    }
                }
                crate::choker::ChokeAction::Choke(key) => {
                    if let Some(peer) = self.peers.get_mut(&key) {
                        peer.am_choking = true;
                        peer.send(PeerMessage::Choke);
                        // Pending uploads are void; fast peers get Rejects
                        let fast = peer.fast;
                        let dropped: Vec<BlockInfo> = peer.upload_queue.drain(..).collect();
                        if fast {
                            for block in dropped {
                                peer.send(PeerMessage::Reject {
                                    index: block.piece,
                                    begin: block.offset,
                                    length: block.length,
                                });
                            }
                        }
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Stats and resume projection
    // ------------------------------------------------------------------

    fn bytes_left(&self) -> u64 {
        match &self.content {
            Some(content) => {
                let verified: u64 = content
                    .pieces
                    .iter()
                    .filter(|p| content.picker.state(p.index) == Some(PieceState::Have))
                    .map(|p| p.length as u64)
                    .sum();
                content.info.total_size.saturating_sub(verified)
            }
            None => 1,
        }
    }

    fn publish_swarm_counters(&self) {
        let _ = self.counters_watch.send(SwarmCounters {
            uploaded: self.counters.uploaded,
            downloaded: self.counters.downloaded,
            left: self.bytes_left(),
        });
    }

    fn seeded_for(&self) -> Duration {
        self.seeded_for_base
            + self
                .seeding_since
                .map(|since| since.elapsed())
                .unwrap_or(Duration::ZERO)
    }

    fn current_stats(&mut self) -> TorrentStats {
        let (have, total) = match &self.content {
            Some(content) => (content.picker.have_count(), content.picker.len()),
            None => (0, 0),
        };
        TorrentStats {
            bytes_downloaded: self.counters.downloaded,
            bytes_uploaded: self.counters.uploaded,
            bytes_wasted: self.counters.wasted,
            download_rate: self.download_meter.rate(),
            upload_rate: self.upload_meter.rate(),
            connected_peers: self.peers.values().filter(|p| p.connected).count(),
            have_pieces: have,
            total_pieces: total,
            seeded_for: self.seeded_for(),
        }
    }

    fn set_status(&mut self, new: TorrentStatus) {
        if self.status == new {
            return;
        }
        let old = std::mem::replace(&mut self.status, new.clone());
        tracing::debug!("torrent {}: {:?} -> {:?}", self.id, old, new);
        let _ = self.events.send(TorrentEvent::StatusChanged { old, new });
    }

    fn make_snapshot(&self) -> ResumeSnapshot {
        let (bitfield, num_pieces) = match &self.content {
            Some(content) => {
                let bf = content.picker.bitfield();
                (bf.serialize(), content.pieces.len() as u32)
            }
            None => (Vec::new(), 0),
        };
        ResumeSnapshot {
            info_hash: self.info_hash,
            trackers: self.trackers.clone(),
            url_list: self.url_list.clone(),
            dest_path: self.dest.clone(),
            port: self.port,
            name: self.name.clone(),
            bitfield,
            num_pieces,
            bytes_downloaded: self.counters.downloaded,
            bytes_uploaded: self.counters.uploaded,
            bytes_wasted: self.counters.wasted,
            seeded_for: self.seeded_for(),
            added_at: self.added_at,
        }
    }

    /// Coalesced resume projection: at most one write per interval while
    /// dirty.
    fn maybe_write_resume(&mut self) {
        if !self.resume_dirty
            || self.last_resume_write.elapsed() < self.config.resume_write_interval
        {
            return;
        }
        self.resume_dirty = false;
        self.last_resume_write = Instant::now();

        let snapshot = self.make_snapshot();
        let store = Arc::clone(&self.collab.resume);
        let id = self.id;
        self.workers.spawn(async move {
            if let Err(e) = store.write(&id, &snapshot).await {
                tracing::warn!("resume write for {} failed: {}", id, e);
            }
        });
    }

    /// Immediate resume write, awaited; used on stop and fatal errors.
    async fn write_resume_now(&mut self) {
        self.resume_dirty = false;
        self.last_resume_write = Instant::now();
        let snapshot = self.make_snapshot();
        if let Err(e) = self.collab.resume.write(&self.id, &snapshot).await {
            tracing::warn!("final resume write for {} failed: {}", self.id, e);
        }
    }
}

impl TorrentStatus {
    /// Whether peer connections make sense in this status.
    fn is_active_for_peers(&self) -> bool {
        matches!(
            self,
            TorrentStatus::Downloading | TorrentStatus::Seeding | TorrentStatus::DownloadingMetadata
        )
    }
}

/// Deterministic per-torrent shuffle seed: a config override, or the
/// leading bytes of the info-hash.
fn derive_picker_seed(config: &Config, info_hash: &InfoHash) -> u64 {
    config.picker_seed.unwrap_or_else(|| {
        u64::from_be_bytes(info_hash[..8].try_into().expect("info-hash prefix"))
    })
}

/// Re-hash a sample of claimed pieces; true when every sampled piece
/// checks out.
async fn sample_verify(
    storage: &Arc<dyn Storage>,
    pieces: &[Piece],
    claimed: &Bitfield,
    sample: usize,
) -> bool {
    let have: Vec<u32> = claimed.ones().map(|i| i as u32).collect();
    if have.is_empty() {
        return true;
    }
    // Deterministic spread over the claimed pieces
    let step = (have.len() / sample.max(1)).max(1);
    for index in have.iter().step_by(step).take(sample) {
        let piece = &pieces[*index as usize];
        match storage.read_piece(piece.index).await {
            Ok(data) if piece.verify(&data) => {}
            _ => return false,
        }
    }
    true
}

/// Re-hash everything readable on disk.
async fn full_verify(storage: &Arc<dyn Storage>, pieces: &[Piece]) -> Bitfield {
    let mut bitfield = Bitfield::new(pieces.len());
    for piece in pieces {
        if let Ok(data) = storage.read_piece(piece.index).await {
            if piece.verify(&data) {
                bitfield.set(piece.index as usize);
            }
        }
    }
    bitfield
}

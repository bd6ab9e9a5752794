//! The torrent orchestrator: one swarm, one task, one owner.
//!
//! A [`Swarm`] task owns every mutable piece of per-swarm state (peer
//! registry, download scheduler, upload scheduler, metadata fetch,
//! statistics) and is the only code that touches it. Everything else
//! communicates through channels: the engine sends [`SwarmCommand`]s via
//! the [`SwarmHandle`], connection tasks push
//! [`PeerEvent`](crate::peers::connection::PeerEvent)s, the announcer task
//! and upload tasks report through internal channels. Components never hold
//! a reference back to the swarm.
//!
//! Lifecycle: `idle -> fetching-metadata? -> checking -> downloading <->
//! paused -> seeding -> stopped`.
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use harbor_clock::clock::Time;
use harbor_metainfo::{magnet::Magnet, Metainfo};
use harbor_primitives::announce_event::AnnounceEvent;
use harbor_primitives::info_hash::InfoHash;
use harbor_primitives::peer;
use harbor_primitives::DurationSinceUnixEpoch;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, info, warn};

use crate::core::error::{EngineError, SwarmError};
use crate::core::events::{Event, EventSender};
use crate::core::statistics::SwarmStatistics;
use crate::core::storage::FileMap;
use crate::dht::Dht;
use crate::peers::connection::{CloseReason, PeerEvent, TransferLimits};
use crate::peers::PeerManager;
use crate::protocol::extended::{ExtendedHandshake, MetadataMessage, HANDSHAKE_ID, LOCAL_UT_METADATA_ID, METADATA_CHUNK_SIZE};
use crate::protocol::handshake::Handshake;
use crate::protocol::message::Message;
use crate::trackers::{AnnounceData, AnnounceParams, Health, TrackerManager};
use crate::CurrentClock;

pub mod download;
pub mod metadata;
pub mod upload;

use download::{BlockOutcome, DownloadScheduler};
use metadata::{MetadataFetch, MetadataProgress};
use upload::{UploadScheduler, Uploaded};

/// The request pump cadence.
pub const PUMP_INTERVAL: Duration = Duration::from_millis(100);

/// Tit-for-tat choke evaluation cadence.
pub const CHOKE_INTERVAL: Duration = Duration::from_secs(10);

/// Optimistic unchoke rotation cadence.
pub const OPTIMISTIC_INTERVAL: Duration = Duration::from_secs(30);

/// Progress events and deadline checks.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Re-announce fallback when the tracker gives no interval.
pub const ANNOUNCE_FALLBACK_INTERVAL: Duration = Duration::from_secs(1800);

/// DHT peers are refreshed and the announce renewed this often.
const DHT_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// The lifecycle states of a swarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SwarmState {
    Idle,
    FetchingMetadata,
    Checking,
    Downloading,
    Paused,
    Seeding,
    Stopped,
}

/// Static per-swarm settings, distilled from the engine configuration.
#[derive(Debug, Clone)]
pub struct SwarmConfig {
    pub download_root: PathBuf,
    /// The TCP port announced to trackers and the DHT.
    pub listen_port: u16,
    pub request_queue_depth: usize,
    pub max_peers: usize,
    pub unchoke_slots: usize,
    pub per_swarm_uploads: usize,
    pub seeding: harbor_configuration::Seeding,
}

/// A point-in-time view of one peer, for the stats surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PeerSummary {
    pub address: SocketAddr,
    pub peer_id: Option<String>,
    pub downloaded_from: u64,
    pub uploaded_to: u64,
    pub peer_choking: bool,
    pub am_choking: bool,
}

/// Everything the control surface reports about a swarm.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SwarmStats {
    pub info_hash: InfoHash,
    pub name: Option<String>,
    pub state: SwarmState,
    pub progress: f64,
    pub downloaded_bytes: u64,
    pub uploaded_bytes: u64,
    pub download_bps: u64,
    pub upload_bps: u64,
    pub piece_count: usize,
    pub completed_pieces: Vec<u32>,
    /// The wire-format bitfield of completed pieces.
    pub piece_bitmap: Vec<u8>,
    /// Connected-peer count advertising each piece.
    pub availability: Vec<u32>,
    pub per_file_progress: Vec<u64>,
    pub peers: Vec<PeerSummary>,
    pub trackers: Vec<(String, Health)>,
    /// `None` means every file is selected.
    pub selected_files: Option<Vec<usize>>,
}

/// Commands the engine sends to a swarm.
pub enum SwarmCommand {
    Start,
    Pause,
    Resume,
    Stop,
    SetFileSelection(Vec<usize>),
    SetSuperSeeding(bool),
    AddPeers(Vec<SocketAddr>),
    Inbound {
        stream: TcpStream,
        address: SocketAddr,
        handshake: Handshake,
    },
    Stats(oneshot::Sender<SwarmStats>),
    Shutdown(oneshot::Sender<()>),
}

/// The engine-side handle to a swarm task.
pub struct SwarmHandle {
    pub info_hash: InfoHash,
    commands: mpsc::Sender<SwarmCommand>,
}

impl SwarmHandle {
    /// # Errors
    ///
    /// Will return [`EngineError::SwarmGone`] when the swarm task is no
    /// longer running.
    pub async fn send(&self, command: SwarmCommand) -> Result<(), EngineError> {
        self.commands.send(command).await.map_err(|_| EngineError::SwarmGone)
    }

    /// # Errors
    ///
    /// Will return [`EngineError::SwarmGone`] when the swarm task is no
    /// longer running.
    pub async fn stats(&self) -> Result<SwarmStats, EngineError> {
        let (respond, receive) = oneshot::channel();
        self.send(SwarmCommand::Stats(respond)).await?;
        receive.await.map_err(|_| EngineError::SwarmGone)
    }

    /// Stops the swarm task and waits for it to acknowledge.
    pub async fn shutdown(&self) {
        let (respond, receive) = oneshot::channel();
        if self.send(SwarmCommand::Shutdown(respond)).await.is_ok() {
            let _ = receive.await;
        }
    }
}

/// A tracker announce to run off the swarm loop.
struct AnnounceJob {
    event: AnnounceEvent,
    uploaded: u64,
    downloaded: u64,
    left: u64,
}

/// Results flowing back into the swarm loop from helper tasks.
enum Internal {
    Announce {
        result: Result<AnnounceData, crate::trackers::Error>,
        health: Vec<(String, Health)>,
    },
    DhtPeers(Vec<SocketAddr>),
}

/// Spawns a swarm task.
///
/// Exactly one of `torrent`/`magnet` supplies the metadata: a parsed
/// metainfo starts in `idle -> checking`, a magnet first fetches its
/// metainfo from peers.
///
/// # Errors
///
/// Will return an error if the tracker HTTP client cannot be built.
#[allow(clippy::too_many_arguments)]
pub fn spawn(
    info_hash: InfoHash,
    torrent: Option<Metainfo>,
    magnet: Option<Magnet>,
    config: SwarmConfig,
    our_id: peer::Id,
    events: Arc<dyn EventSender>,
    dht: Option<Dht>,
    limits: TransferLimits,
    global_upload_slots: Arc<Semaphore>,
) -> Result<SwarmHandle, crate::trackers::Error> {
    let tracker_urls = match (&torrent, &magnet) {
        (Some(metainfo), _) => metainfo.all_trackers(),
        (None, Some(magnet)) => magnet.trackers.clone(),
        (None, None) => Vec::new(),
    };

    let tracker_manager = TrackerManager::new(tracker_urls)?;

    let (command_tx, command_rx) = mpsc::channel(32);
    let (peer_event_tx, peer_event_rx) = mpsc::channel(256);
    let (internal_tx, internal_rx) = mpsc::channel(64);
    let (upload_tx, upload_rx) = mpsc::channel(64);
    let (announce_tx, announce_rx) = mpsc::channel(8);

    spawn_announcer(
        tracker_manager,
        AnnounceParams {
            info_hash,
            peer_id: our_id,
            port: config.listen_port,
            uploaded: 0,
            downloaded: 0,
            left: 0,
            event: AnnounceEvent::None,
        },
        announce_rx,
        internal_tx.clone(),
    );

    let piece_count = torrent.as_ref().map_or(0, Metainfo::piece_count);
    let peers = PeerManager::new(
        info_hash,
        our_id,
        piece_count,
        config.max_peers,
        peer_event_tx,
        limits,
    );

    let display_name = match (&torrent, &magnet) {
        (Some(metainfo), _) => Some(metainfo.name().to_owned()),
        (None, Some(magnet)) => magnet.display_name.clone(),
        (None, None) => None,
    };

    let upload = UploadScheduler::new(config.unchoke_slots, config.per_swarm_uploads, global_upload_slots);

    let swarm = Swarm {
        info_hash,
        config,
        state: SwarmState::Idle,
        metainfo: torrent.map(Arc::new),
        display_name,
        peers,
        files: None,
        download: None,
        upload,
        metadata_fetch: None,
        statistics: SwarmStatistics::new(),
        events,
        dht,
        internal_tx,
        announce_jobs: announce_tx,
        tracker_health: Vec::new(),
        announce_interval: ANNOUNCE_FALLBACK_INTERVAL,
        next_announce_at: None,
        selected_files: None,
        completed_announced: false,
        uploads_tx: upload_tx,
    };

    tokio::spawn(swarm.run(command_rx, peer_event_rx, internal_rx, upload_rx));

    Ok(SwarmHandle {
        info_hash,
        commands: command_tx,
    })
}

fn spawn_announcer(
    mut manager: TrackerManager,
    base: AnnounceParams,
    mut jobs: mpsc::Receiver<AnnounceJob>,
    internal: mpsc::Sender<Internal>,
) {
    tokio::spawn(async move {
        while let Some(job) = jobs.recv().await {
            if !manager.has_endpoints() {
                continue;
            }

            let params = AnnounceParams {
                uploaded: job.uploaded,
                downloaded: job.downloaded,
                left: job.left,
                event: job.event,
                ..base
            };

            let result = manager.announce(&params).await;
            let health = manager.endpoint_health();

            if internal.send(Internal::Announce { result, health }).await.is_err() {
                break;
            }
        }
    });
}

enum Flow {
    Continue,
    Stop,
}

struct Swarm {
    info_hash: InfoHash,
    config: SwarmConfig,
    state: SwarmState,

    metainfo: Option<Arc<Metainfo>>,
    display_name: Option<String>,

    peers: PeerManager,
    files: Option<Arc<FileMap>>,
    download: Option<DownloadScheduler>,
    upload: UploadScheduler,
    metadata_fetch: Option<MetadataFetch>,
    statistics: SwarmStatistics,

    events: Arc<dyn EventSender>,
    dht: Option<Dht>,
    internal_tx: mpsc::Sender<Internal>,
    announce_jobs: mpsc::Sender<AnnounceJob>,
    tracker_health: Vec<(String, Health)>,
    announce_interval: Duration,
    next_announce_at: Option<DurationSinceUnixEpoch>,

    /// `None` means every file is selected.
    selected_files: Option<Vec<usize>>,
    completed_announced: bool,
    uploads_tx: mpsc::Sender<Uploaded>,
}

impl Swarm {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<SwarmCommand>,
        mut peer_events: mpsc::Receiver<PeerEvent>,
        mut internals: mpsc::Receiver<Internal>,
        mut uploads: mpsc::Receiver<Uploaded>,
    ) {
        let mut pump = tokio::time::interval(PUMP_INTERVAL);
        let mut choke = tokio::time::interval(CHOKE_INTERVAL);
        let mut optimistic = tokio::time::interval(OPTIMISTIC_INTERVAL);
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        let mut dht_timer = tokio::time::interval(DHT_INTERVAL);

        for timer in [&mut pump, &mut choke, &mut optimistic, &mut tick, &mut dht_timer] {
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        }

        loop {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        None => break,
                        Some(command) => {
                            if matches!(self.handle_command(command).await, Flow::Stop) {
                                break;
                            }
                        }
                    }
                }

                Some(event) = peer_events.recv() => self.handle_peer_event(event).await,

                Some(internal) = internals.recv() => self.handle_internal(internal).await,

                Some(upload) = uploads.recv() => {
                    self.statistics.record_uploaded(upload.bytes);
                    if let Some(peer) = self.peers.get_mut(&upload.address) {
                        peer.uploaded_bytes += upload.bytes;
                    }
                }

                _ = pump.tick() => {
                    if self.is_transferring() {
                        if let Some(download) = &mut self.download {
                            download.pump(&mut self.peers);
                        }
                    }
                }

                _ = choke.tick() => {
                    if self.is_transferring() {
                        self.upload.choke_round(&mut self.peers);
                    }
                }

                _ = optimistic.tick() => {
                    if self.is_transferring() {
                        self.upload.rotate_optimistic(&mut self.peers);
                    }
                }

                _ = tick.tick() => self.on_tick().await,

                _ = dht_timer.tick() => self.refresh_dht(),
            }
        }

        debug!(info_hash = %self.info_hash, "swarm task finished");
    }

    fn is_transferring(&self) -> bool {
        matches!(self.state, SwarmState::Downloading | SwarmState::Seeding)
    }

    fn is_active(&self) -> bool {
        matches!(
            self.state,
            SwarmState::FetchingMetadata | SwarmState::Checking | SwarmState::Downloading | SwarmState::Seeding
        )
    }

    async fn handle_command(&mut self, command: SwarmCommand) -> Flow {
        match command {
            SwarmCommand::Start | SwarmCommand::Resume => {
                if matches!(self.state, SwarmState::Idle | SwarmState::Paused | SwarmState::Stopped) {
                    if self.state == SwarmState::Paused {
                        self.emit(Event::Resumed { info_hash: self.info_hash }).await;
                    } else {
                        self.emit(Event::Started { info_hash: self.info_hash }).await;
                    }

                    self.start_flow().await;
                }
            }

            SwarmCommand::Pause => {
                if self.is_active() {
                    self.cancel_all_requests();
                    self.state = SwarmState::Paused;
                    self.emit(Event::Paused { info_hash: self.info_hash }).await;
                }
            }

            SwarmCommand::Stop => {
                self.stop_flow().await;
                self.emit(Event::Stopped { info_hash: self.info_hash }).await;
            }

            SwarmCommand::SetFileSelection(files) => self.apply_file_selection(Some(files)),

            SwarmCommand::SetSuperSeeding(enabled) => self.upload.set_super_seeding(enabled),

            SwarmCommand::AddPeers(addresses) => {
                self.peers.add_candidates(addresses);
                if self.is_active() {
                    self.peers.dial_candidates();
                }
            }

            SwarmCommand::Inbound {
                stream,
                address,
                handshake,
            } => {
                if self.is_active() {
                    self.peers.adopt_inbound(stream, address, handshake);
                } else {
                    debug!(%address, "dropping inbound peer while inactive");
                }
            }

            SwarmCommand::Stats(respond) => {
                let _ = respond.send(self.build_stats());
            }

            SwarmCommand::Shutdown(ack) => {
                self.stop_flow().await;
                let _ = ack.send(());
                return Flow::Stop;
            }
        }

        Flow::Continue
    }

    /// `start`/`resume`: fetch metadata if we only know the identity,
    /// otherwise check the disk and begin transferring.
    async fn start_flow(&mut self) {
        if self.metainfo.is_none() {
            self.state = SwarmState::FetchingMetadata;
            self.metadata_fetch = Some(MetadataFetch::new(self.info_hash));
            info!(info_hash = %self.info_hash, "fetching metadata from the swarm");

            self.enqueue_announce(AnnounceEvent::Started).await;
            self.refresh_dht();
            self.peers.dial_candidates();
            return;
        }

        let fresh = self.download.is_none();
        if fresh {
            self.state = SwarmState::Checking;
            if let Err(error) = self.initialize_storage().await {
                self.surface_error(error).await;
                return;
            }
        }

        self.state = if self.download.as_ref().is_some_and(DownloadScheduler::is_complete) {
            self.statistics.seeding_since = Some(CurrentClock::now());
            SwarmState::Seeding
        } else {
            SwarmState::Downloading
        };

        self.enqueue_announce(AnnounceEvent::Started).await;
        self.refresh_dht();
        self.peers.dial_candidates();
    }

    /// Builds the file map, sizes the files and marks what is already valid
    /// on disk.
    async fn initialize_storage(&mut self) -> Result<(), SwarmError> {
        let metainfo = self.metainfo.clone().expect("checked by the caller");

        let files = FileMap::new(&metainfo, &self.config.download_root).map_err(|error| SwarmError::from(&error))?;
        files.initialize().await.map_err(|error| SwarmError::from(&error))?;

        let (valid, invalid) = files.verify_all().await;
        debug!(info_hash = %self.info_hash, valid = valid.len(), invalid = invalid.len(), "disk check finished");

        let mut download = DownloadScheduler::new(metainfo, self.config.request_queue_depth);
        download.mark_complete_from_disk(valid);

        self.files = Some(Arc::new(files));
        self.download = Some(download);
        self.apply_file_selection(self.selected_files.clone());

        Ok(())
    }

    async fn stop_flow(&mut self) {
        if self.is_active() {
            self.enqueue_announce(AnnounceEvent::Stopped).await;
        }

        self.cancel_all_requests();
        self.peers.disconnect_all();
        self.state = SwarmState::Stopped;
    }

    fn cancel_all_requests(&mut self) {
        if let Some(download) = &mut self.download {
            for peer in self.peers.operational_mut() {
                download.on_choke(peer);
            }
        }
    }

    fn apply_file_selection(&mut self, files: Option<Vec<usize>>) {
        self.selected_files = files;

        let (Some(map), Some(download)) = (&self.files, &mut self.download) else {
            // A magnet swarm stores the selection until its metadata lands.
            return;
        };

        let skipped: HashSet<u32> = match &self.selected_files {
            None => HashSet::new(),
            Some(selection) => {
                let wanted = map.pieces_for_files(selection);
                #[allow(clippy::cast_possible_truncation)]
                (0..map.piece_count() as u32).filter(|piece| !wanted.contains(piece)).collect()
            }
        };

        download.set_skipped(skipped, &mut self.peers);
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Connected {
                address,
                peer_id,
                supports_extensions,
            } => {
                if !self.peers.on_connected(address, peer_id, supports_extensions) {
                    return;
                }

                if supports_extensions {
                    let metadata_size = self.metainfo.as_ref().map(|metainfo| metainfo.info_bytes().len() as u64);
                    let handshake = ExtendedHandshake::ours(metadata_size);
                    if let Some(peer) = self.peers.get(&address) {
                        peer.send(Message::Extended {
                            id: HANDSHAKE_ID,
                            payload: handshake.to_bytes(),
                        });
                    }
                }

                if let Some(download) = &self.download {
                    let bitfield = download.bitfield();
                    if bitfield.count_set() > 0 {
                        if let Some(peer) = self.peers.get(&address) {
                            peer.send(Message::Bitfield(bitfield.to_bytes()));
                        }
                    }
                }
            }

            PeerEvent::Message { address, message } => self.handle_message(address, message).await,

            PeerEvent::Closed { address, reason } => {
                if let Some(removed) = self.peers.on_closed(address, &reason) {
                    if let Some(download) = &mut self.download {
                        download.on_peer_closed(&removed);
                    }
                }
                if let Some(fetch) = &mut self.metadata_fetch {
                    fetch.on_peer_closed(address);
                }

                if reason.is_protocol_violation() {
                    debug!(%address, ?reason, "peer closed on protocol violation");
                }

                if self.is_active() {
                    self.peers.dial_candidates();
                }
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    async fn handle_message(&mut self, address: SocketAddr, message: Message) {
        match message {
            Message::KeepAlive => (),

            Message::Choke => {
                if let Some(peer) = self.peers.get_mut(&address) {
                    peer.peer_choking = true;
                    if let Some(download) = &mut self.download {
                        download.on_choke(peer);
                    }
                }
            }

            Message::Unchoke => {
                if let Some(peer) = self.peers.get_mut(&address) {
                    peer.peer_choking = false;
                }
            }

            Message::Interested => {
                if let Some(peer) = self.peers.get_mut(&address) {
                    peer.peer_interested = true;
                }
            }

            Message::NotInterested => {
                if let Some(peer) = self.peers.get_mut(&address) {
                    peer.peer_interested = false;
                }
            }

            Message::Have(piece_index) => {
                if let Some(peer) = self.peers.get_mut(&address) {
                    peer.bitfield.set(piece_index);
                }
                self.upload.on_peer_has(piece_index, address);
            }

            Message::Bitfield(bytes) => self.on_bitfield(address, &bytes),

            Message::Request(block) => {
                // Only verified pieces are served.
                let have = self
                    .download
                    .as_ref()
                    .is_some_and(|download| download.complete_set().contains(&block.piece_index));

                let completions = self.uploads_tx.clone();
                if have {
                    if let (Some(files), Some(peer)) = (&self.files, self.peers.get(&address)) {
                        self.upload.serve(peer, block, files, &completions);
                    }
                }
            }

            Message::Piece {
                piece_index,
                offset,
                data,
            } => self.on_piece(address, piece_index, offset, data).await,

            Message::Cancel(block) => self.upload.on_cancel(address, &block),

            Message::Port(port) => {
                if let Some(dht) = &self.dht {
                    let dht = dht.clone();
                    let node = SocketAddr::new(address.ip(), port);
                    tokio::spawn(async move { dht.add_node(node).await });
                }
            }

            Message::Extended { id, payload } => self.on_extended(address, id, &payload).await,
        }
    }

    fn on_bitfield(&mut self, address: SocketAddr, bytes: &[u8]) {
        let piece_count = self.metainfo.as_ref().map_or(0, |metainfo| metainfo.piece_count());
        if piece_count == 0 {
            // Magnet swarm before metadata: keep the bytes until the piece
            // count is known.
            if let Some(peer) = self.peers.get_mut(&address) {
                peer.pending_bitfield = Some(bytes.to_vec());
            }
            return;
        }

        match crate::peers::bitfield::Bitfield::from_bytes(bytes, piece_count) {
            Some(bitfield) => {
                if let Some(peer) = self.peers.get_mut(&address) {
                    peer.bitfield = bitfield;
                }
            }
            None => {
                warn!(%address, "malformed bitfield; dropping peer");
                if let Some(peer) = self.peers.get(&address) {
                    peer.close();
                }
                self.peers.on_closed(address, &CloseReason::FramingViolation);
            }
        }
    }

    async fn on_piece(&mut self, address: SocketAddr, piece_index: u32, offset: u32, data: Vec<u8>) {
        let bytes = data.len() as u64;

        let Some(download) = &mut self.download else {
            return;
        };
        let Some(peer) = self.peers.get_mut(&address) else {
            return;
        };

        let outcome = download.on_block(peer, piece_index, offset, data);

        match outcome {
            BlockOutcome::Rejected => (),

            BlockOutcome::Accepted => self.statistics.record_downloaded(bytes),

            BlockOutcome::PieceVerified { piece_index, data } => {
                self.statistics.record_downloaded(bytes);

                let files = self.files.clone().expect("transferring swarms have storage");
                if let Err(error) = files.write_piece(piece_index, &data).await {
                    self.surface_error(SwarmError::from(&error)).await;
                    return;
                }

                self.peers.broadcast_have(piece_index);
                self.emit(Event::PieceComplete {
                    info_hash: self.info_hash,
                    piece_index,
                })
                .await;

                let finished = self.download.as_ref().is_some_and(DownloadScheduler::is_complete);
                if finished && self.state == SwarmState::Downloading {
                    self.to_seeding().await;
                }
            }

            BlockOutcome::VerificationFailed { piece_index, fatal } => {
                if let Some(download) = &mut self.download {
                    download.cancel_piece_requests(piece_index, &mut self.peers);
                }

                if fatal {
                    self.surface_error(SwarmError::verification(
                        "piece-hash-mismatch",
                        format!("piece {piece_index} failed verification repeatedly"),
                    ))
                    .await;
                }
            }
        }
    }

    async fn to_seeding(&mut self) {
        info!(info_hash = %self.info_hash, "download complete; seeding");
        self.state = SwarmState::Seeding;
        self.statistics.seeding_since = Some(CurrentClock::now());

        self.emit(Event::Done { info_hash: self.info_hash }).await;

        if !self.completed_announced {
            self.completed_announced = true;
            self.enqueue_announce(AnnounceEvent::Completed).await;
        }
    }

    async fn on_extended(&mut self, address: SocketAddr, id: u8, payload: &[u8]) {
        if id == HANDSHAKE_ID {
            let Ok(handshake) = ExtendedHandshake::parse(payload) else {
                warn!(%address, "malformed extended handshake");
                return;
            };

            if let Some(peer) = self.peers.get_mut(&address) {
                peer.ut_metadata_id = handshake.ut_metadata_id();
                peer.metadata_size = handshake.metadata_size;
            }

            if let (Some(fetch), Some(size)) = (&mut self.metadata_fetch, handshake.metadata_size) {
                fetch.on_metadata_size(size);
            }
            self.pump_metadata(address);
            return;
        }

        if id == LOCAL_UT_METADATA_ID {
            match MetadataMessage::parse(payload) {
                Ok(MetadataMessage::Request { piece }) => self.serve_metadata_chunk(address, piece),
                Ok(MetadataMessage::Data {
                    piece,
                    total_size,
                    payload,
                }) => self.on_metadata_data(address, piece, total_size, &payload).await,
                Ok(MetadataMessage::Reject { .. }) => {
                    if let Some(fetch) = &mut self.metadata_fetch {
                        fetch.on_reject(address);
                    }
                }
                Err(error) => debug!(%address, %error, "ignoring malformed metadata message"),
            }
        }
    }

    /// Serves one chunk of our metainfo to a peer that asked for it.
    fn serve_metadata_chunk(&mut self, address: SocketAddr, piece: u32) {
        let Some(peer) = self.peers.get(&address) else {
            return;
        };
        let Some(remote_id) = peer.ut_metadata_id else {
            return;
        };

        let reply = match &self.metainfo {
            None => MetadataMessage::Reject { piece },
            Some(metainfo) => {
                let bytes = metainfo.info_bytes();
                let start = piece as usize * METADATA_CHUNK_SIZE;

                if start >= bytes.len() {
                    MetadataMessage::Reject { piece }
                } else {
                    let end = (start + METADATA_CHUNK_SIZE).min(bytes.len());
                    MetadataMessage::Data {
                        piece,
                        total_size: bytes.len() as u64,
                        payload: bytes[start..end].to_vec(),
                    }
                }
            }
        };

        peer.send(Message::Extended {
            id: remote_id,
            payload: reply.to_bytes(),
        });
    }

    async fn on_metadata_data(&mut self, address: SocketAddr, piece: u32, total_size: u64, payload: &[u8]) {
        let Some(fetch) = &mut self.metadata_fetch else {
            return;
        };

        match fetch.on_data(address, piece, total_size, payload) {
            MetadataProgress::Incomplete => self.pump_metadata(address),
            MetadataProgress::HashMismatch => {
                // Try again through whichever peers remain.
                for operational in self.peers.operational().map(|peer| peer.address).collect::<Vec<_>>() {
                    self.pump_metadata(operational);
                }
            }
            MetadataProgress::Complete(bytes) => match Metainfo::from_info_bytes(&bytes) {
                Err(error) => {
                    self.surface_error(SwarmError::from(&error)).await;
                }
                Ok(metainfo) => {
                    info!(info_hash = %self.info_hash, name = metainfo.name(), "metadata fetched");

                    self.display_name = Some(metainfo.name().to_owned());
                    self.peers.set_piece_count(metainfo.piece_count());
                    self.metainfo = Some(Arc::new(metainfo));
                    self.metadata_fetch = None;

                    self.state = SwarmState::Checking;
                    match self.initialize_storage().await {
                        Err(error) => self.surface_error(error).await,
                        Ok(()) => {
                            self.state = SwarmState::Downloading;
                            // Everyone we know gets our (empty) bitfield via
                            // the normal pump; just start asking.
                            self.peers.dial_candidates();
                        }
                    }
                }
            },
        }
    }

    /// Requests the next metadata chunk from `address` if the fetch wants
    /// one.
    fn pump_metadata(&mut self, address: SocketAddr) {
        let Some(fetch) = &mut self.metadata_fetch else {
            return;
        };
        let Some(peer) = self.peers.get(&address) else {
            return;
        };
        let Some(remote_id) = peer.ut_metadata_id else {
            return;
        };

        if let Some(chunk) = fetch.next_request(address) {
            peer.send(Message::Extended {
                id: remote_id,
                payload: MetadataMessage::Request { piece: chunk }.to_bytes(),
            });
        }
    }

    async fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Announce { result, health } => {
                self.tracker_health = health;

                match result {
                    Ok(data) => {
                        if let Some(interval) = data.interval {
                            self.announce_interval = interval;
                        }
                        self.next_announce_at = Some(CurrentClock::now() + self.announce_interval);

                        debug!(info_hash = %self.info_hash, peers = data.peers.len(), "announce answered");
                        self.peers.add_candidates(data.peers);
                        if self.is_active() {
                            self.peers.dial_candidates();
                        }
                    }
                    Err(error) => {
                        warn!(info_hash = %self.info_hash, %error, "announce failed on every endpoint");
                        self.next_announce_at = Some(CurrentClock::now() + self.announce_interval);

                        self.emit(Event::Error {
                            info_hash: self.info_hash,
                            error: SwarmError::tracker("announce-failed", error.to_string()),
                        })
                        .await;
                    }
                }
            }

            Internal::DhtPeers(addresses) => {
                if !addresses.is_empty() {
                    debug!(info_hash = %self.info_hash, count = addresses.len(), "DHT peers arrived");
                    self.peers.add_candidates(addresses);
                    if self.is_active() {
                        self.peers.dial_candidates();
                    }
                }
            }
        }
    }

    /// The once-a-second housekeeping tick: progress events, re-announce
    /// scheduling, metadata deadlines, seeding limits.
    async fn on_tick(&mut self) {
        if self.is_active() {
            if let Some(due) = self.next_announce_at {
                if CurrentClock::now() >= due {
                    self.next_announce_at = None;
                    self.enqueue_announce(AnnounceEvent::None).await;
                }
            }
        }

        if self.state == SwarmState::FetchingMetadata {
            if let Some(reason) = self.metadata_fetch.as_ref().and_then(MetadataFetch::timed_out) {
                self.emit(Event::Error {
                    info_hash: self.info_hash,
                    error: SwarmError::metadata_fetch(reason, "could not obtain metadata from the swarm".to_owned()),
                })
                .await;
                // The swarm stays in fetching-metadata for the operator.
                self.metadata_fetch = Some(MetadataFetch::new(self.info_hash));
            }
        }

        if self.is_transferring() {
            let progress = self.download.as_ref().map_or(0.0, DownloadScheduler::progress);
            let download_bps = self.statistics.download_bps();
            let upload_bps = self.statistics.upload_bps();

            self.emit(Event::Progress {
                info_hash: self.info_hash,
                progress,
                download_bps,
                upload_bps,
            })
            .await;
        }

        if self.state == SwarmState::Seeding {
            self.check_seeding_limits().await;
        }
    }

    async fn check_seeding_limits(&mut self) {
        let limits = &self.config.seeding;
        let now = CurrentClock::now();

        let ratio_reached = match (limits.max_ratio, self.statistics.ratio()) {
            (Some(max), Some(ratio)) => ratio >= max,
            _ => false,
        };

        let time_reached = match (limits.max_seed_time_secs, self.statistics.seeding_since) {
            (Some(max), Some(since)) => now.saturating_sub(since) >= Duration::from_secs(max),
            _ => false,
        };

        let idle_reached = limits
            .max_idle_time_secs
            .is_some_and(|max| now.saturating_sub(self.statistics.last_upload_activity) >= Duration::from_secs(max));

        if ratio_reached || time_reached || idle_reached {
            info!(info_hash = %self.info_hash, ratio_reached, time_reached, idle_reached, "seeding limit reached");
            self.stop_flow().await;
            self.emit(Event::Stopped { info_hash: self.info_hash }).await;
        }
    }

    /// Queues a tracker announce with the current counters.
    async fn enqueue_announce(&mut self, event: AnnounceEvent) {
        let left = match (&self.metainfo, &self.download) {
            (Some(metainfo), Some(download)) => {
                #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                {
                    (metainfo.total_length() as f64 * (1.0 - download.progress())) as u64
                }
            }
            (Some(metainfo), None) => metainfo.total_length(),
            (None, _) => 0,
        };

        let job = AnnounceJob {
            event,
            uploaded: self.statistics.uploaded_bytes,
            downloaded: self.statistics.downloaded_bytes,
            left,
        };

        if self.announce_jobs.send(job).await.is_err() {
            warn!(info_hash = %self.info_hash, "announcer task is gone");
        }
    }

    /// Asks the DHT for peers and (re)announces our port there.
    fn refresh_dht(&self) {
        let Some(dht) = &self.dht else {
            return;
        };

        if self.metainfo.as_ref().is_some_and(|metainfo| metainfo.is_private()) {
            // Private torrents never touch the DHT.
            return;
        }

        if !self.is_active() {
            return;
        }

        let dht = dht.clone();
        let info_hash = self.info_hash;
        let port = self.config.listen_port;
        let internal = self.internal_tx.clone();

        tokio::spawn(async move {
            let peers = dht.find_peers(info_hash).await;
            let _ = internal.send(Internal::DhtPeers(peers)).await;
            dht.announce(info_hash, port).await;
        });
    }

    async fn surface_error(&mut self, error: SwarmError) {
        warn!(info_hash = %self.info_hash, %error, "swarm error");

        let pause = matches!(error.action, crate::core::error::Action::Pause);

        self.emit(Event::Error {
            info_hash: self.info_hash,
            error,
        })
        .await;

        if pause && self.is_active() {
            self.cancel_all_requests();
            self.state = SwarmState::Paused;
            self.emit(Event::Paused { info_hash: self.info_hash }).await;
        }
    }

    async fn emit(&self, event: Event) {
        self.events.send_event(event).await;
    }

    fn build_stats(&mut self) -> SwarmStats {
        let piece_count = self.metainfo.as_ref().map_or(0, |metainfo| metainfo.piece_count());

        let (completed_pieces, piece_bitmap, progress) = match &self.download {
            Some(download) => (
                download.completed_pieces(),
                download.bitfield().to_bytes(),
                download.progress(),
            ),
            None => (Vec::new(), Vec::new(), 0.0),
        };

        let per_file_progress = match (&self.files, &self.download) {
            (Some(files), Some(download)) => files.file_progress(download.complete_set()),
            _ => Vec::new(),
        };

        let peers = self
            .peers
            .operational()
            .map(|peer| PeerSummary {
                address: peer.address,
                peer_id: peer.peer_id.map(|id| id.to_string()),
                downloaded_from: peer.delivered_bytes,
                uploaded_to: peer.uploaded_bytes,
                peer_choking: peer.peer_choking,
                am_choking: peer.am_choking,
            })
            .collect();

        SwarmStats {
            info_hash: self.info_hash,
            name: self.display_name.clone(),
            state: self.state,
            progress,
            downloaded_bytes: self.statistics.downloaded_bytes,
            uploaded_bytes: self.statistics.uploaded_bytes,
            download_bps: self.statistics.download_bps(),
            upload_bps: self.statistics.upload_bps(),
            piece_count,
            completed_pieces,
            piece_bitmap,
            availability: self.peers.availability(),
            per_file_progress,
            peers,
            trackers: self.tracker_health.clone(),
            selected_files: self.selected_files.clone(),
        }
    }
}

//! The core engine: the domain layer of Harbor, independent of any
//! delivery layer.
//!
//! The [`Engine`] is the multi-swarm registry and the control surface a
//! higher layer (an HTTP API, a UI, a CLI) talks to. It owns the shared
//! services every swarm uses: the global transfer throttles with their
//! fair-share split, the global upload slots, the DHT node and the inbound
//! peer listener that routes accepted connections to the right swarm by the
//! identity in their handshake.
//!
//! ```text
//! Delivery layer     Domain layer
//!
//!       HTTP API |
//!            CLI |> Engine -> Swarm tasks -> peers / trackers / DHT / disk
//!             UI |
//! ```
//!
//! Adding a swarm whose identity is already present fails deterministically;
//! so does exceeding the configured maximum of active swarms.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use harbor_configuration::Configuration;
use harbor_metainfo::{magnet::Magnet, Metainfo};
use harbor_primitives::info_hash::InfoHash;
use harbor_primitives::peer;
use tokio::net::TcpListener;
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, info, warn};

pub mod error;
pub mod events;
pub mod pieces;
pub mod snapshot;
pub mod statistics;
pub mod storage;
pub mod swarm;

use error::EngineError;
use events::{Event, EventSender};
use snapshot::{EngineSnapshot, PersistedState, SwarmSnapshot, SwarmSource};
use swarm::{SwarmCommand, SwarmConfig, SwarmHandle, SwarmState, SwarmStats};

use crate::dht::Dht;
use crate::peers::connection::{self, TransferLimits};
use crate::throttle::FairShare;

/// What a swarm is created from.
#[derive(Debug, Clone)]
pub enum AddSource {
    /// A `.torrent` file on disk.
    TorrentFile { path: PathBuf },
    /// A magnet URI.
    MagnetUri { uri: String },
}

struct SwarmEntry {
    handle: SwarmHandle,
    source: SwarmSource,
    download_root: PathBuf,
    /// The torrent's name once known, to locate its content on removal.
    name: Option<String>,
}

/// The engine. Cheap to share behind an [`Arc`]; every method takes
/// `&self`.
pub struct Engine {
    config: Configuration,
    our_id: peer::Id,
    swarms: RwLock<HashMap<InfoHash, SwarmEntry>>,
    download_shares: FairShare,
    upload_shares: FairShare,
    global_upload_slots: Arc<Semaphore>,
    dht: Option<Dht>,
    events: Arc<dyn EventSender>,
}

impl Engine {
    /// Builds the engine and, when configured, its DHT node.
    ///
    /// # Errors
    ///
    /// Will return an error if the DHT socket cannot be bound.
    pub async fn new(config: Configuration, events: Arc<dyn EventSender>) -> Result<Arc<Self>, crate::dht::Error> {
        let our_id = peer::Id::generate();
        info!(peer_id = %our_id, "engine starting");

        let dht = if config.dht.enabled {
            let (dht, _task) = crate::dht::spawn(&config.dht).await?;
            Some(dht)
        } else {
            None
        };

        Ok(Arc::new(Self {
            download_shares: FairShare::new(config.limits.download_bps),
            upload_shares: FairShare::new(config.limits.upload_bps),
            global_upload_slots: Arc::new(Semaphore::new(config.limits.active_uploads_global)),
            our_id,
            swarms: RwLock::new(HashMap::new()),
            dht,
            events,
            config,
        }))
    }

    #[must_use]
    pub fn peer_id(&self) -> peer::Id {
        self.our_id
    }

    /// Adds a swarm from a torrent file or magnet URI. `download_root`
    /// overrides the engine-wide content directory for this swarm.
    ///
    /// # Errors
    ///
    /// Will return an [`EngineError`] for an unreadable or invalid source, a
    /// duplicate identity, or too many active swarms.
    pub async fn add_swarm(
        &self,
        source: AddSource,
        download_root: Option<PathBuf>,
        auto_start: bool,
    ) -> Result<InfoHash, EngineError> {
        let (info_hash, metainfo, magnet, persisted_source) = match &source {
            AddSource::TorrentFile { path } => {
                let bytes = tokio::fs::read(path)
                    .await
                    .map_err(|source| EngineError::Source { source })?;
                let metainfo = Metainfo::parse(&bytes)?;

                (
                    metainfo.info_hash(),
                    Some(metainfo),
                    None,
                    SwarmSource::TorrentFile {
                        path: path.display().to_string(),
                    },
                )
            }
            AddSource::MagnetUri { uri } => {
                let magnet = Magnet::parse(uri)?;

                (
                    magnet.info_hash,
                    None,
                    Some(magnet),
                    SwarmSource::Magnet { uri: uri.clone() },
                )
            }
        };

        {
            let mut swarms = self.swarms.write().await;

            if swarms.contains_key(&info_hash) {
                return Err(EngineError::DuplicateSwarm { info_hash });
            }
            if swarms.len() >= self.config.limits.max_active_swarms {
                return Err(EngineError::TooManySwarms {
                    max: self.config.limits.max_active_swarms,
                });
            }

            let limits = TransferLimits {
                download: self.download_shares.register(info_hash, 1, 0).await,
                upload: self.upload_shares.register(info_hash, 1, 0).await,
            };

            let name = metainfo.as_ref().map(|metainfo| metainfo.name().to_owned());
            let root = download_root.unwrap_or_else(|| PathBuf::from(&self.config.download_root));

            let handle = swarm::spawn(
                info_hash,
                metainfo,
                magnet,
                self.swarm_config(root.clone()),
                self.our_id,
                self.events.clone(),
                self.dht.clone(),
                limits,
                self.global_upload_slots.clone(),
            )
            .map_err(|error| EngineError::Source {
                source: std::io::Error::other(error.to_string()),
            })?;

            swarms.insert(
                info_hash,
                SwarmEntry {
                    handle,
                    source: persisted_source,
                    download_root: root,
                    name,
                },
            );
        }

        self.events.send_event(Event::Added { info_hash }).await;
        info!(%info_hash, "swarm added");

        if auto_start {
            self.start(info_hash).await?;
        }

        Ok(info_hash)
    }

    /// Removes a swarm, optionally deleting its downloaded content.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::UnknownSwarm`] for an unknown identity.
    pub async fn remove_swarm(&self, info_hash: InfoHash, delete_files: bool) -> Result<(), EngineError> {
        let entry = self
            .swarms
            .write()
            .await
            .remove(&info_hash)
            .ok_or(EngineError::UnknownSwarm { info_hash })?;

        // The swarm may have learned its name after a metadata fetch.
        let name = match entry.handle.stats().await {
            Ok(stats) => stats.name,
            Err(_) => entry.name,
        };

        entry.handle.shutdown().await;

        self.download_shares.deregister(info_hash).await;
        self.upload_shares.deregister(info_hash).await;

        if delete_files {
            if let Some(name) = name {
                let content = entry.download_root.join(&name);
                let removed = if content.is_dir() {
                    tokio::fs::remove_dir_all(&content).await
                } else {
                    tokio::fs::remove_file(&content).await
                };

                match removed {
                    Ok(()) => debug!(%info_hash, path = %content.display(), "content deleted"),
                    Err(error) if error.kind() == std::io::ErrorKind::NotFound => (),
                    Err(error) => warn!(%info_hash, %error, "could not delete content"),
                }
            }
        }

        self.events.send_event(Event::Removed { info_hash }).await;
        Ok(())
    }

    /// # Errors
    ///
    /// Will return [`EngineError::UnknownSwarm`] for an unknown identity.
    pub async fn start(&self, info_hash: InfoHash) -> Result<(), EngineError> {
        self.command(info_hash, SwarmCommand::Start).await
    }

    /// # Errors
    ///
    /// Will return [`EngineError::UnknownSwarm`] for an unknown identity.
    pub async fn pause(&self, info_hash: InfoHash) -> Result<(), EngineError> {
        self.command(info_hash, SwarmCommand::Pause).await
    }

    /// # Errors
    ///
    /// Will return [`EngineError::UnknownSwarm`] for an unknown identity.
    pub async fn resume(&self, info_hash: InfoHash) -> Result<(), EngineError> {
        self.command(info_hash, SwarmCommand::Resume).await
    }

    /// # Errors
    ///
    /// Will return [`EngineError::UnknownSwarm`] for an unknown identity.
    pub async fn stop(&self, info_hash: InfoHash) -> Result<(), EngineError> {
        self.command(info_hash, SwarmCommand::Stop).await
    }

    /// Restricts the download to the given file indices.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::UnknownSwarm`] for an unknown identity.
    pub async fn set_file_selection(&self, info_hash: InfoHash, files: Vec<usize>) -> Result<(), EngineError> {
        self.command(info_hash, SwarmCommand::SetFileSelection(files)).await
    }

    /// # Errors
    ///
    /// Will return [`EngineError::UnknownSwarm`] for an unknown identity.
    pub async fn set_super_seeding(&self, info_hash: InfoHash, enabled: bool) -> Result<(), EngineError> {
        self.command(info_hash, SwarmCommand::SetSuperSeeding(enabled)).await
    }

    /// Hands extra peer addresses to a swarm (e.g. from a magnet's `x.pe`
    /// hints or a user).
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::UnknownSwarm`] for an unknown identity.
    pub async fn add_peers(&self, info_hash: InfoHash, peers: Vec<SocketAddr>) -> Result<(), EngineError> {
        self.command(info_hash, SwarmCommand::AddPeers(peers)).await
    }

    /// Summaries of every swarm.
    pub async fn list_swarms(&self) -> Vec<SwarmStats> {
        let swarms = self.swarms.read().await;

        let mut stats = Vec::with_capacity(swarms.len());
        for entry in swarms.values() {
            if let Ok(swarm_stats) = entry.handle.stats().await {
                stats.push(swarm_stats);
            }
        }

        stats.sort_by_key(|stats| stats.info_hash);
        stats
    }

    /// Full statistics for one swarm.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::UnknownSwarm`] for an unknown identity.
    pub async fn detailed_stats(&self, info_hash: InfoHash) -> Result<SwarmStats, EngineError> {
        let swarms = self.swarms.read().await;
        let entry = swarms.get(&info_hash).ok_or(EngineError::UnknownSwarm { info_hash })?;

        entry.handle.stats().await
    }

    /// Replaces the global transfer limits; fair shares are recomputed.
    pub async fn set_global_limits(&self, download_bps: u64, upload_bps: u64) {
        self.download_shares.set_global_limit(download_bps).await;
        self.upload_shares.set_global_limit(upload_bps).await;
    }

    pub async fn global_limits(&self) -> (u64, u64) {
        (
            self.download_shares.global_limit().await,
            self.upload_shares.global_limit().await,
        )
    }

    /// Accepts inbound peer connections and routes each to its swarm by the
    /// identity carried in the handshake. Returns the bound address.
    ///
    /// # Errors
    ///
    /// Will return an error if the listener cannot be bound.
    pub async fn spawn_listener(self: &Arc<Self>) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind(("0.0.0.0", self.config.network.port)).await?;
        let address = listener.local_addr()?;
        info!(%address, "peer listener bound");

        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, peer_address)) = listener.accept().await else {
                    break;
                };

                let engine = engine.clone();
                tokio::spawn(async move {
                    engine.route_inbound(stream, peer_address).await;
                });
            }
        });

        Ok(address)
    }

    async fn route_inbound(&self, mut stream: tokio::net::TcpStream, address: SocketAddr) {
        let handshake = match connection::read_handshake(&mut stream).await {
            Ok(handshake) => handshake,
            Err(reason) => {
                debug!(%address, ?reason, "dropping inbound connection");
                return;
            }
        };

        let swarms = self.swarms.read().await;
        match swarms.get(&handshake.info_hash) {
            None => debug!(%address, info_hash = %handshake.info_hash, "inbound peer for an unknown swarm"),
            Some(entry) => {
                let _ = entry
                    .handle
                    .send(SwarmCommand::Inbound {
                        stream,
                        address,
                        handshake,
                    })
                    .await;
            }
        }
    }

    /// Captures the persistent state of every swarm.
    pub async fn snapshot_state(&self) -> EngineSnapshot {
        let swarms = self.swarms.read().await;

        let mut records = Vec::with_capacity(swarms.len());
        for (info_hash, entry) in swarms.iter() {
            let Ok(stats) = entry.handle.stats().await else {
                continue;
            };

            records.push(SwarmSnapshot {
                info_hash: *info_hash,
                source: entry.source.clone(),
                download_root: entry.download_root.display().to_string(),
                completed_pieces: stats.completed_pieces,
                uploaded_bytes: stats.uploaded_bytes,
                selected_files: stats.selected_files,
                state: persisted_state(stats.state),
            });
        }

        records.sort_by_key(|record| record.info_hash);
        EngineSnapshot { swarms: records }
    }

    /// Saves the snapshot under the download root.
    ///
    /// # Errors
    ///
    /// Will return an error on any filesystem failure.
    pub async fn save_state(&self) -> Result<(), snapshot::Error> {
        let state = self.snapshot_state().await;
        snapshot::save(Path::new(&self.config.download_root), &state).await
    }

    /// Re-creates the swarms of a previously saved snapshot. Sources that
    /// no longer parse or exist are skipped with a warning.
    pub async fn restore_state(&self) {
        let state = match snapshot::load(Path::new(&self.config.download_root)).await {
            Ok(Some(state)) => state,
            Ok(None) => return,
            Err(error) => {
                warn!(%error, "could not load the state snapshot");
                return;
            }
        };

        for record in state.swarms {
            let source = match &record.source {
                SwarmSource::TorrentFile { path } => AddSource::TorrentFile {
                    path: PathBuf::from(path),
                },
                SwarmSource::Magnet { uri } => AddSource::MagnetUri { uri: uri.clone() },
            };

            let auto_start = record.state == PersistedState::Active;
            let download_root = Some(PathBuf::from(&record.download_root));

            match self.add_swarm(source, download_root, false).await {
                Err(error) => warn!(info_hash = %record.info_hash, %error, "skipping swarm from snapshot"),
                Ok(info_hash) => {
                    if let Some(files) = record.selected_files {
                        let _ = self.set_file_selection(info_hash, files).await;
                    }
                    if auto_start {
                        let _ = self.start(info_hash).await;
                    }
                }
            }
        }
    }

    /// Periodically persists the snapshot.
    pub fn spawn_snapshot_job(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let engine = self.clone();
        let period = Duration::from_secs(self.config.snapshot_interval_secs.max(1));

        tokio::spawn(async move {
            let mut timer = tokio::time::interval(period);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            timer.reset();

            loop {
                timer.tick().await;
                if let Err(error) = engine.save_state().await {
                    warn!(%error, "periodic state snapshot failed");
                }
            }
        })
    }

    /// Orderly shutdown: persist state, then stop every swarm (each sends
    /// its tracker `stopped` and cancels its waiters).
    pub async fn shutdown(&self) {
        info!("engine shutting down");

        if let Err(error) = self.save_state().await {
            warn!(%error, "could not save state during shutdown");
        }

        let handles: Vec<SwarmHandle> = {
            let mut swarms = self.swarms.write().await;
            swarms.drain().map(|(_, entry)| entry.handle).collect()
        };

        for handle in handles {
            handle.shutdown().await;
        }
    }

    async fn command(&self, info_hash: InfoHash, command: SwarmCommand) -> Result<(), EngineError> {
        let swarms = self.swarms.read().await;
        let entry = swarms.get(&info_hash).ok_or(EngineError::UnknownSwarm { info_hash })?;

        entry.handle.send(command).await
    }

    fn swarm_config(&self, download_root: PathBuf) -> SwarmConfig {
        SwarmConfig {
            download_root,
            listen_port: self.config.network.port,
            request_queue_depth: self.config.limits.request_queue_depth,
            max_peers: self.config.limits.max_peers_per_swarm,
            unchoke_slots: self.config.limits.unchoke_slots,
            per_swarm_uploads: self.config.limits.active_uploads_per_swarm,
            seeding: self.config.seeding.clone(),
        }
    }
}

fn persisted_state(state: SwarmState) -> PersistedState {
    match state {
        SwarmState::FetchingMetadata | SwarmState::Checking | SwarmState::Downloading | SwarmState::Seeding => {
            PersistedState::Active
        }
        SwarmState::Paused => PersistedState::Paused,
        SwarmState::Idle | SwarmState::Stopped => PersistedState::Stopped,
    }
}

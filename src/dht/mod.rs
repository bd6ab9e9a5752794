//! The Kademlia DHT node (BEP 5).
//!
//! One service task owns the UDP socket, the routing table, the peer store
//! and the token secrets. It serves incoming queries, matches responses to
//! pending transactions by their 2-byte tag, runs the periodic maintenance
//! (secret rotation, storage purge, liveness pings, bucket refresh) and
//! executes lookups and announces on behalf of the engine's swarms, which
//! talk to it only through the cloneable [`Dht`] handle.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use harbor_primitives::info_hash::InfoHash;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

pub mod lookup;
pub mod messages;
pub mod routing;
pub mod storage;

use lookup::{iterative_lookup, LookupKind, LookupOutcome, QueryClient, QueryError, K};
use messages::{Message, Query, ResponseData, ERROR_BAD_TOKEN, ERROR_UNKNOWN_METHOD};
use routing::{NodeEntry, NodeId, RoutingTable};
use storage::{PeerStore, TokenKeeper, SECRET_ROTATION_INTERVAL};

/// A query waits this long for its response.
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

const PURGE_INTERVAL: Duration = Duration::from_secs(5 * 60);
const LIVENESS_INTERVAL: Duration = Duration::from_secs(10 * 60);
const REFRESH_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Nodes pinged per liveness round.
const LIVENESS_SAMPLE: usize = 8;

/// Buckets refreshed per refresh round.
const REFRESH_BUCKETS: usize = 3;

const MAX_DATAGRAM: usize = 2048;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not bind the DHT socket: {source}")]
    Bind { source: std::io::Error },
}

/// Point-in-time counters for the stats surface.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct Stats {
    pub routing_table_size: usize,
    pub stored_swarms: usize,
}

enum Command {
    FindPeers {
        info_hash: InfoHash,
        respond: oneshot::Sender<Vec<SocketAddr>>,
    },
    Announce {
        info_hash: InfoHash,
        port: u16,
    },
    AddNode {
        address: SocketAddr,
    },
    Stats {
        respond: oneshot::Sender<Stats>,
    },
}

/// The engine-facing handle. Cheap to clone; all methods are best-effort
/// (a stopped DHT simply yields nothing).
#[derive(Clone)]
pub struct Dht {
    commands: mpsc::Sender<Command>,
}

impl Dht {
    /// Looks up peers for a swarm.
    pub async fn find_peers(&self, info_hash: InfoHash) -> Vec<SocketAddr> {
        let (respond, receive) = oneshot::channel();

        if self
            .commands
            .send(Command::FindPeers { info_hash, respond })
            .await
            .is_err()
        {
            return Vec::new();
        }

        receive.await.unwrap_or_default()
    }

    /// Announces that we serve `info_hash` on `port`. Fire and forget.
    pub async fn announce(&self, info_hash: InfoHash, port: u16) {
        let _ = self.commands.send(Command::Announce { info_hash, port }).await;
    }

    /// Offers a candidate node (e.g. from a peer's `port` message).
    pub async fn add_node(&self, address: SocketAddr) {
        let _ = self.commands.send(Command::AddNode { address }).await;
    }

    pub async fn stats(&self) -> Stats {
        let (respond, receive) = oneshot::channel();

        if self.commands.send(Command::Stats { respond }).await.is_err() {
            return Stats::default();
        }

        receive.await.unwrap_or_default()
    }
}

/// Binds the socket, joins the network through the bootstrap nodes and
/// spawns the service task.
///
/// # Errors
///
/// Will return an [`Error`] if the socket cannot be bound.
pub async fn spawn(config: &harbor_configuration::Dht) -> Result<(Dht, tokio::task::JoinHandle<()>), Error> {
    let socket = UdpSocket::bind(("0.0.0.0", config.port))
        .await
        .map_err(|source| Error::Bind { source })?;

    let node_id = NodeId::random();
    info!(%node_id, port = config.port, "DHT node starting");

    let shared = Arc::new(Shared {
        socket: Arc::new(socket),
        node_id,
        pending: Mutex::new(HashMap::new()),
        counter: AtomicU16::new(0),
    });

    let mut bootstrap = Vec::new();
    for host in &config.bootstrap_nodes {
        match tokio::net::lookup_host(host.as_str()).await {
            Ok(addresses) => bootstrap.extend(addresses.filter(SocketAddr::is_ipv4)),
            Err(error) => warn!(host, %error, "bootstrap node does not resolve"),
        }
    }

    let (command_tx, command_rx) = mpsc::channel(64);

    let service = Service {
        shared,
        routing: Arc::new(Mutex::new(RoutingTable::new(node_id))),
        store: PeerStore::new(),
        tokens: TokenKeeper::new(),
        bootstrap,
    };

    let handle = tokio::spawn(service.run(command_rx));

    Ok((Dht { commands: command_tx }, handle))
}

/// State shared between the service loop and spawned lookup tasks.
struct Shared {
    socket: Arc<UdpSocket>,
    node_id: NodeId,
    /// Outstanding queries keyed by transaction tag.
    pending: Mutex<HashMap<Vec<u8>, oneshot::Sender<Result<ResponseData, QueryError>>>>,
    counter: AtomicU16,
}

impl Shared {
    fn next_transaction(&self) -> Vec<u8> {
        self.counter.fetch_add(1, Ordering::Relaxed).to_be_bytes().to_vec()
    }
}

#[async_trait]
impl QueryClient for Shared {
    async fn query(&self, address: SocketAddr, query: Query) -> Result<ResponseData, QueryError> {
        let transaction = self.next_transaction();

        let (respond, receive) = oneshot::channel();
        self.pending.lock().await.insert(transaction.clone(), respond);

        let bytes = Message::Query {
            transaction: transaction.clone(),
            query,
        }
        .to_bytes();

        if let Err(error) = self.socket.send_to(&bytes, address).await {
            self.pending.lock().await.remove(&transaction);
            return Err(QueryError::Io {
                message: error.to_string(),
            });
        }

        match timeout(QUERY_TIMEOUT, receive).await {
            Ok(Ok(result)) => result,
            // Sender dropped: the service is shutting down.
            Ok(Err(_closed)) => Err(QueryError::Timeout),
            Err(_elapsed) => {
                self.pending.lock().await.remove(&transaction);
                Err(QueryError::Timeout)
            }
        }
    }
}

struct Service {
    shared: Arc<Shared>,
    routing: Arc<Mutex<RoutingTable>>,
    store: PeerStore,
    tokens: TokenKeeper,
    bootstrap: Vec<SocketAddr>,
}

impl Service {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        // Join the network: walk toward our own id so the closest buckets
        // fill up.
        self.spawn_lookup(self.shared.node_id.0, LookupKind::FindNode, self.bootstrap.clone(), None);

        let mut rotate = interval(SECRET_ROTATION_INTERVAL);
        let mut purge = interval(PURGE_INTERVAL);
        let mut liveness = interval(LIVENESS_INTERVAL);
        let mut refresh = interval(REFRESH_INTERVAL);
        for timer in [&mut rotate, &mut purge, &mut liveness, &mut refresh] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The immediate first tick would do nothing useful.
            timer.reset();
        }

        let socket = self.shared.socket.clone();
        let mut buffer = [0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                received = socket.recv_from(&mut buffer) => {
                    match received {
                        Ok((len, from)) => self.handle_datagram(&buffer[..len], from).await,
                        Err(error) => {
                            warn!(%error, "DHT socket receive failed");
                        }
                    }
                }

                command = commands.recv() => {
                    match command {
                        None => break,
                        Some(command) => self.handle_command(command).await,
                    }
                }

                _ = rotate.tick() => self.tokens.rotate(),
                _ = purge.tick() => self.store.purge_expired(),
                _ = liveness.tick() => self.liveness_round().await,
                _ = refresh.tick() => self.refresh_round().await,
            }
        }

        debug!("DHT service stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::FindPeers { info_hash, respond } => {
                self.spawn_lookup(info_hash.bytes(), LookupKind::GetPeers, Vec::new(), Some(respond));
            }
            Command::Announce { info_hash, port } => {
                self.spawn_announce(info_hash, port).await;
            }
            Command::AddNode { address } => {
                // A ping response routes the node into the table.
                let shared = self.shared.clone();
                tokio::spawn(async move {
                    let _ = shared
                        .query(address, Query::Ping { id: shared.node_id })
                        .await;
                });
            }
            Command::Stats { respond } => {
                let _ = respond.send(Stats {
                    routing_table_size: self.routing.lock().await.len(),
                    stored_swarms: self.store.swarm_count(),
                });
            }
        }
    }

    /// Spawns an iterative lookup task. For `get_peers` the accumulated
    /// peers are delivered through `respond`.
    fn spawn_lookup(
        &self,
        target: [u8; 20],
        kind: LookupKind,
        bare_addresses: Vec<SocketAddr>,
        respond: Option<oneshot::Sender<Vec<SocketAddr>>>,
    ) {
        let shared = self.shared.clone();
        let routing = self.routing.clone();

        tokio::spawn(async move {
            let outcome = run_lookup(&shared, &routing, target, kind, bare_addresses).await;

            if let Some(respond) = respond {
                let _ = respond.send(outcome.peers);
            }
        });
    }

    /// `get_peers` lookup, then `announce_peer` to the closest responders
    /// whose tokens we hold.
    async fn spawn_announce(&self, info_hash: InfoHash, port: u16) {
        let shared = self.shared.clone();
        let routing = self.routing.clone();

        tokio::spawn(async move {
            let outcome = run_lookup(&shared, &routing, info_hash.bytes(), LookupKind::GetPeers, Vec::new()).await;

            let mut announced = 0usize;
            for node in outcome.closest.iter().take(K) {
                let Some(token) = outcome.tokens.get(&node.address) else {
                    continue;
                };

                let query = Query::AnnouncePeer {
                    id: shared.node_id,
                    info_hash: info_hash.bytes(),
                    port,
                    token: token.clone(),
                    implied_port: false,
                };

                if shared.query(node.address, query).await.is_ok() {
                    announced += 1;
                }
            }

            debug!(%info_hash, announced, "DHT announce finished");
        });
    }

    async fn handle_datagram(&mut self, bytes: &[u8], from: SocketAddr) {
        let message = match Message::parse(bytes) {
            Ok(message) => message,
            Err(error) => {
                debug!(%from, %error, "dropping malformed datagram");
                return;
            }
        };

        match message {
            Message::Query { transaction, query } => {
                self.routing.lock().await.insert(NodeEntry {
                    id: query.sender_id(),
                    address: from,
                });

                let reply = self.serve_query(&query, from, transaction).await;
                if let Err(error) = self.shared.socket.send_to(&reply.to_bytes(), from).await {
                    warn!(%from, %error, "failed to answer query");
                }
            }

            Message::Response { transaction, data } => {
                if let Some(id) = data.id {
                    self.routing.lock().await.insert(NodeEntry { id, address: from });
                }

                match self.shared.pending.lock().await.remove(&transaction) {
                    Some(waiter) => {
                        let _ = waiter.send(Ok(data));
                    }
                    // Unsolicited transaction tags are ignored.
                    None => debug!(%from, "dropping response with unknown transaction"),
                }
            }

            Message::Error { transaction, code, message } => {
                if let Some(waiter) = self.shared.pending.lock().await.remove(&transaction) {
                    let _ = waiter.send(Err(QueryError::Remote { code, message }));
                }
            }
        }
    }

    async fn serve_query(&mut self, query: &Query, from: SocketAddr, transaction: Vec<u8>) -> Message {
        let our_id = Some(self.shared.node_id);

        match query {
            Query::Ping { .. } => Message::Response {
                transaction,
                data: ResponseData {
                    id: our_id,
                    ..ResponseData::default()
                },
            },

            Query::FindNode { target, .. } => {
                let nodes = self.routing.lock().await.closest(&target.0, K);

                Message::Response {
                    transaction,
                    data: ResponseData {
                        id: our_id,
                        nodes,
                        ..ResponseData::default()
                    },
                }
            }

            Query::GetPeers { info_hash, .. } => {
                let token = Some(self.tokens.make_token(from.ip()));
                let peers = self.store.get(&InfoHash(*info_hash));

                let data = if peers.is_empty() {
                    ResponseData {
                        id: our_id,
                        nodes: self.routing.lock().await.closest(info_hash, K),
                        token,
                        ..ResponseData::default()
                    }
                } else {
                    ResponseData {
                        id: our_id,
                        peers,
                        token,
                        ..ResponseData::default()
                    }
                };

                Message::Response { transaction, data }
            }

            Query::AnnouncePeer {
                info_hash,
                port,
                token,
                implied_port,
                ..
            } => {
                if !self.tokens.validate(from.ip(), token) {
                    return Message::Error {
                        transaction,
                        code: ERROR_BAD_TOKEN,
                        message: "bad token".to_owned(),
                    };
                }

                let peer_port = if *implied_port { from.port() } else { *port };
                self.store
                    .add(InfoHash(*info_hash), SocketAddr::new(from.ip(), peer_port));

                Message::Response {
                    transaction,
                    data: ResponseData {
                        id: our_id,
                        ..ResponseData::default()
                    },
                }
            }
        }
    }

    /// Pings a random sample of the table; evicts nodes that do not answer.
    async fn liveness_round(&self) {
        let sample = self.routing.lock().await.random_entries(LIVENESS_SAMPLE);
        if sample.is_empty() {
            return;
        }

        let shared = self.shared.clone();
        let routing = self.routing.clone();

        tokio::spawn(async move {
            for entry in sample {
                let alive = shared
                    .query(entry.address, Query::Ping { id: shared.node_id })
                    .await
                    .is_ok();

                if !alive {
                    debug!(id = %entry.id, "evicting unresponsive node");
                    routing.lock().await.remove(&entry.id);
                }
            }
        });
    }

    /// Refreshes up to [`REFRESH_BUCKETS`] random occupied buckets with a
    /// `find_node` walk toward a random id inside each.
    async fn refresh_round(&self) {
        use rand::seq::SliceRandom;

        let mut buckets = self.routing.lock().await.occupied_buckets();
        buckets.shuffle(&mut rand::thread_rng());

        for bucket in buckets.into_iter().take(REFRESH_BUCKETS) {
            let target = self.shared.node_id.random_id_in_bucket(bucket);
            self.spawn_lookup(target.0, LookupKind::FindNode, Vec::new(), None);
        }
    }
}

async fn run_lookup(
    shared: &Arc<Shared>,
    routing: &Arc<Mutex<RoutingTable>>,
    target: [u8; 20],
    kind: LookupKind,
    bare_addresses: Vec<SocketAddr>,
) -> LookupOutcome {
    let seeds = routing.lock().await.closest(&target, K);

    let outcome = iterative_lookup(shared.as_ref(), shared.node_id, target, kind, seeds, bare_addresses).await;

    // Responders are good nodes; remember them.
    {
        let mut routing = routing.lock().await;
        for node in &outcome.closest {
            routing.insert(*node);
        }
    }

    outcome
}

//! The peer manager: dialing, adopting inbound connections, per-peer
//! protocol state and the ban list.
//!
//! The manager is owned by its swarm's event loop and is only ever touched
//! from there, so its state needs no locking. Connection tasks report
//! through the swarm's event channel; the manager holds their
//! [`connection::PeerLink`] handles for sending.
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;

use harbor_clock::clock::Time;
use harbor_primitives::info_hash::InfoHash;
use harbor_primitives::peer;
use harbor_primitives::DurationSinceUnixEpoch;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::protocol::handshake::Handshake;
use crate::protocol::message::Message;
use crate::CurrentClock;

pub mod bitfield;
pub mod connection;

use bitfield::Bitfield;
use connection::{CloseReason, PeerEvent, PeerLink, TransferLimits};

/// First ban lasts this long; each further strike doubles it.
pub const BAN_BASE_COOLDOWN: Duration = Duration::from_secs(60);

/// Bans never exceed this.
pub const BAN_MAX_COOLDOWN: Duration = Duration::from_secs(3600);

/// A block request we sent and have not seen answered.
#[derive(Debug, Clone, Copy)]
pub struct OutstandingRequest {
    pub length: u32,
    pub issued_at: DurationSinceUnixEpoch,
}

/// Protocol state for one remote peer.
#[derive(Debug)]
pub struct PeerState {
    pub address: SocketAddr,
    pub peer_id: Option<peer::Id>,
    pub handshake_complete: bool,

    /// We are not serving this peer's requests.
    pub am_choking: bool,
    /// We want blocks from this peer.
    pub am_interested: bool,
    /// This peer is not serving our requests.
    pub peer_choking: bool,
    /// This peer wants blocks from us.
    pub peer_interested: bool,

    pub bitfield: Bitfield,
    /// A bitfield received while the piece count was still unknown (magnet
    /// swarm before its metadata); applied by [`PeerManager::set_piece_count`].
    pub pending_bitfield: Option<Vec<u8>>,
    pub supports_extensions: bool,
    /// The id the peer assigned to `ut_metadata`, once its extended
    /// handshake arrived.
    pub ut_metadata_id: Option<u8>,
    pub metadata_size: Option<u64>,

    /// Requests we sent, keyed by `(piece, offset)`.
    pub outstanding: HashMap<(u32, u32), OutstandingRequest>,

    /// Bytes of blocks this peer delivered to us, total and within the
    /// current choking round (the round counter drives tit-for-tat).
    pub delivered_bytes: u64,
    pub delivered_this_round: u64,
    /// Bytes of blocks we served to this peer.
    pub uploaded_bytes: u64,

    link: PeerLink,
}

impl PeerState {
    fn new(address: SocketAddr, piece_count: usize, link: PeerLink) -> Self {
        Self {
            address,
            peer_id: None,
            handshake_complete: false,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            bitfield: Bitfield::new(piece_count),
            pending_bitfield: None,
            supports_extensions: false,
            ut_metadata_id: None,
            metadata_size: None,
            outstanding: HashMap::new(),
            delivered_bytes: 0,
            delivered_this_round: 0,
            uploaded_bytes: 0,
            link,
        }
    }

    pub fn send(&self, message: Message) {
        self.link.send(message);
    }

    /// A clone of the connection handle, for tasks that outlive this
    /// borrow (uploads).
    #[must_use]
    pub fn link(&self) -> PeerLink {
        self.link.clone()
    }

    pub fn close(&self) {
        self.link.close();
    }
}

#[derive(Debug, Clone, Copy)]
struct BanEntry {
    strikes: u32,
    until: DurationSinceUnixEpoch,
}

/// The per-swarm peer registry.
pub struct PeerManager {
    info_hash: InfoHash,
    our_id: peer::Id,
    /// Grows when a magnet swarm learns its metainfo.
    piece_count: usize,
    max_peers: usize,

    peers: HashMap<SocketAddr, PeerState>,
    bans: HashMap<SocketAddr, BanEntry>,

    /// Addresses worth dialing, deduplicated.
    candidates: VecDeque<SocketAddr>,
    known_candidates: HashSet<SocketAddr>,

    events: mpsc::Sender<PeerEvent>,
    limits: TransferLimits,
}

impl PeerManager {
    #[must_use]
    pub fn new(
        info_hash: InfoHash,
        our_id: peer::Id,
        piece_count: usize,
        max_peers: usize,
        events: mpsc::Sender<PeerEvent>,
        limits: TransferLimits,
    ) -> Self {
        Self {
            info_hash,
            our_id,
            piece_count,
            max_peers,
            peers: HashMap::new(),
            bans: HashMap::new(),
            candidates: VecDeque::new(),
            known_candidates: HashSet::new(),
            events,
            limits,
        }
    }

    /// Called when a magnet swarm obtains its metainfo: resizes every
    /// zero-piece bitfield and applies bitfields that arrived before the
    /// piece count was known. Pending bitfields that do not fit the real
    /// piece count are dropped (the peer just looks empty).
    pub fn set_piece_count(&mut self, piece_count: usize) {
        self.piece_count = piece_count;
        for peer in self.peers.values_mut() {
            if peer.bitfield.piece_count() == 0 {
                peer.bitfield = match peer.pending_bitfield.take() {
                    Some(bytes) => Bitfield::from_bytes(&bytes, piece_count).unwrap_or_else(|| Bitfield::new(piece_count)),
                    None => Bitfield::new(piece_count),
                };
            }
        }
    }

    /// Feeds addresses from trackers, the DHT or magnet hints into the dial
    /// pool.
    pub fn add_candidates(&mut self, addresses: impl IntoIterator<Item = SocketAddr>) {
        for address in addresses {
            if self.known_candidates.insert(address) {
                self.candidates.push_back(address);
            }
        }
    }

    #[must_use]
    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    /// Dials candidates until the connection cap is reached. Banned
    /// addresses stay in nobody's way: they are dropped and may be re-added
    /// by a later tracker response.
    pub fn dial_candidates(&mut self) {
        let now = CurrentClock::now();

        while self.peers.len() < self.max_peers {
            let Some(address) = self.candidates.pop_front() else {
                break;
            };
            self.known_candidates.remove(&address);

            if self.peers.contains_key(&address) || self.is_banned(address, now) {
                continue;
            }

            debug!(%address, "dialing peer");
            let link = connection::spawn_outbound(
                address,
                self.info_hash,
                self.our_id,
                self.events.clone(),
                self.limits.clone(),
            );
            self.peers.insert(address, PeerState::new(address, self.piece_count, link));
        }
    }

    /// Adopts an inbound connection whose handshake the listener already
    /// read. The stream is dropped when the swarm is full or the address is
    /// banned.
    pub fn adopt_inbound(&mut self, stream: TcpStream, address: SocketAddr, their_handshake: Handshake) {
        let now = CurrentClock::now();

        if self.peers.len() >= self.max_peers || self.peers.contains_key(&address) || self.is_banned(address, now) {
            debug!(%address, "rejecting inbound peer");
            return;
        }

        let link = connection::spawn_inbound(
            stream,
            address,
            their_handshake,
            self.info_hash,
            self.our_id,
            self.events.clone(),
            self.limits.clone(),
        );
        self.peers.insert(address, PeerState::new(address, self.piece_count, link));
    }

    /// Marks the peer operational. Returns `false` for an unknown address
    /// (a race with removal).
    pub fn on_connected(&mut self, address: SocketAddr, peer_id: peer::Id, supports_extensions: bool) -> bool {
        let Some(peer) = self.peers.get_mut(&address) else {
            return false;
        };

        peer.handshake_complete = true;
        peer.peer_id = Some(peer_id);
        peer.supports_extensions = supports_extensions;
        true
    }

    /// Removes a closed peer, banning the address when the close reason was
    /// a protocol violation. Returns the removed state so the scheduler can
    /// re-queue its outstanding requests.
    pub fn on_closed(&mut self, address: SocketAddr, reason: &CloseReason) -> Option<PeerState> {
        let removed = self.peers.remove(&address);

        if reason.is_protocol_violation() {
            self.ban(address);
        }

        removed
    }

    /// Adaptive ban: each strike doubles the cool-down, bounded by
    /// [`BAN_MAX_COOLDOWN`].
    pub fn ban(&mut self, address: SocketAddr) {
        let now = CurrentClock::now();
        let entry = self.bans.entry(address).or_insert(BanEntry {
            strikes: 0,
            until: now,
        });

        entry.strikes += 1;
        let cooldown = BAN_BASE_COOLDOWN
            .saturating_mul(1u32 << (entry.strikes - 1).min(6))
            .min(BAN_MAX_COOLDOWN);
        entry.until = now + cooldown;

        info!(%address, strikes = entry.strikes, ?cooldown, "peer banned");
    }

    #[must_use]
    pub fn is_banned(&self, address: SocketAddr, now: DurationSinceUnixEpoch) -> bool {
        self.bans.get(&address).is_some_and(|entry| now < entry.until)
    }

    #[must_use]
    pub fn get(&self, address: &SocketAddr) -> Option<&PeerState> {
        self.peers.get(address)
    }

    pub fn get_mut(&mut self, address: &SocketAddr) -> Option<&mut PeerState> {
        self.peers.get_mut(address)
    }

    /// All peers that completed the handshake.
    pub fn operational(&self) -> impl Iterator<Item = &PeerState> {
        self.peers.values().filter(|peer| peer.handshake_complete)
    }

    pub fn operational_mut(&mut self) -> impl Iterator<Item = &mut PeerState> {
        self.peers.values_mut().filter(|peer| peer.handshake_complete)
    }

    #[must_use]
    pub fn connected_count(&self) -> usize {
        self.peers.len()
    }

    /// Sends `have` to every operational peer.
    pub fn broadcast_have(&self, piece_index: u32) {
        for peer in self.operational() {
            peer.send(Message::Have(piece_index));
        }
    }

    /// How many connected peers advertise each piece. Rarest-first feeds on
    /// this.
    #[must_use]
    pub fn availability(&self) -> Vec<u32> {
        let mut counts = vec![0u32; self.piece_count];

        for peer in self.operational() {
            #[allow(clippy::cast_possible_truncation)]
            for (index, count) in counts.iter_mut().enumerate() {
                if peer.bitfield.has(index as u32) {
                    *count += 1;
                }
            }
        }

        counts
    }

    pub fn disconnect_all(&mut self) {
        for peer in self.peers.values() {
            peer.close();
        }
        self.peers.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::time::Duration;

    use harbor_clock::clock::stopped::Stopped as _;
    use harbor_clock::clock::Time;
    use harbor_primitives::info_hash::InfoHash;
    use harbor_primitives::peer;
    use tokio::sync::mpsc;

    use super::connection::{CloseReason, TransferLimits};
    use super::{PeerManager, BAN_BASE_COOLDOWN};
    use crate::throttle::RateLimiter;
    use crate::CurrentClock;

    fn address(last_octet: u8) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last_octet)), 6881)
    }

    fn manager(max_peers: usize) -> (PeerManager, mpsc::Receiver<super::PeerEvent>) {
        let (event_tx, event_rx) = mpsc::channel(64);
        let limits = TransferLimits {
            download: RateLimiter::new(0),
            upload: RateLimiter::new(0),
        };

        (
            PeerManager::new(
                InfoHash([1; 20]),
                peer::Id(*b"-HB0100-000000000001"),
                4,
                max_peers,
                event_tx,
                limits,
            ),
            event_rx,
        )
    }

    #[tokio::test]
    async fn candidates_should_be_deduplicated() {
        let (mut manager, _events) = manager(10);

        manager.add_candidates([address(1), address(2), address(1)]);

        assert_eq!(manager.candidate_count(), 2);
    }

    #[tokio::test]
    async fn dialing_should_respect_the_connection_cap() {
        let (mut manager, _events) = manager(2);

        manager.add_candidates([address(1), address(2), address(3)]);
        manager.dial_candidates();

        assert_eq!(manager.connected_count(), 2);
        assert_eq!(manager.candidate_count(), 1);
    }

    #[tokio::test]
    async fn a_protocol_violation_should_ban_the_address_with_a_growing_cooldown() {
        CurrentClock::local_set(&Duration::from_secs(10_000));
        let (mut manager, _events) = manager(10);

        manager.add_candidates([address(1)]);
        manager.dial_candidates();
        assert_eq!(manager.connected_count(), 1);

        manager.on_closed(address(1), &CloseReason::OversizeMessage);
        assert_eq!(manager.connected_count(), 0);
        assert!(manager.is_banned(address(1), CurrentClock::now()));

        // The first strike rests for the base cool-down.
        CurrentClock::local_add(&BAN_BASE_COOLDOWN).unwrap();
        assert!(!manager.is_banned(address(1), CurrentClock::now()));

        // A second strike doubles it.
        manager.ban(address(1));
        CurrentClock::local_add(&BAN_BASE_COOLDOWN).unwrap();
        assert!(manager.is_banned(address(1), CurrentClock::now()));
        CurrentClock::local_add(&BAN_BASE_COOLDOWN).unwrap();
        assert!(!manager.is_banned(address(1), CurrentClock::now()));
    }

    #[tokio::test]
    async fn banned_addresses_should_not_be_dialed() {
        CurrentClock::local_set(&Duration::from_secs(20_000));
        let (mut manager, _events) = manager(10);

        manager.ban(address(1));
        manager.add_candidates([address(1), address(2)]);
        manager.dial_candidates();

        assert_eq!(manager.connected_count(), 1);
        assert!(manager.get(&address(2)).is_some());
        assert!(manager.get(&address(1)).is_none());
    }

    #[tokio::test]
    async fn an_orderly_close_should_not_ban() {
        CurrentClock::local_set(&Duration::from_secs(30_000));
        let (mut manager, _events) = manager(10);

        manager.add_candidates([address(1)]);
        manager.dial_candidates();
        manager.on_closed(address(1), &CloseReason::Eof);

        assert!(!manager.is_banned(address(1), CurrentClock::now()));
    }

    #[tokio::test]
    async fn availability_should_sum_operational_bitfields() {
        let (mut manager, _events) = manager(10);

        manager.add_candidates([address(1), address(2)]);
        manager.dial_candidates();

        manager.on_connected(address(1), peer::Id([1; 20]), false);
        manager.on_connected(address(2), peer::Id([2; 20]), false);

        manager.get_mut(&address(1)).unwrap().bitfield.set(0);
        manager.get_mut(&address(1)).unwrap().bitfield.set(2);
        manager.get_mut(&address(2)).unwrap().bitfield.set(2);

        assert_eq!(manager.availability(), vec![1, 0, 2, 0]);
    }
}

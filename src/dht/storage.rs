//! Announce-peer storage and the tokens that authorize it.
//!
//! A node answering `get_peers` hands the querier a token bound to the
//! querier's IP and the node's current secret. A later `announce_peer` must
//! present that token, which proves the announcing IP can receive our
//! datagrams (no spoofed announces). Secrets rotate every five minutes and
//! the previous secret stays valid for one rotation window, so a token is
//! usable for up to ten minutes.
//!
//! Stored peers expire 30 minutes after they announced.
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use harbor_clock::clock::Time;
use harbor_primitives::info_hash::InfoHash;
use harbor_primitives::DurationSinceUnixEpoch;
use rand::Rng;
use sha1::{Digest, Sha1};
use tracing::debug;

use crate::CurrentClock;

/// Stored peers older than this are purged.
pub const PEER_TTL: Duration = Duration::from_secs(30 * 60);

/// Secrets rotate this often; the previous secret stays valid one interval.
pub const SECRET_ROTATION_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Tokens are the first 8 bytes of `SHA-1(ip || secret)`.
pub const TOKEN_LEN: usize = 8;

const SECRET_LEN: usize = 16;

/// Issues and validates announce tokens.
#[derive(Debug)]
pub struct TokenKeeper {
    current: [u8; SECRET_LEN],
    previous: [u8; SECRET_LEN],
}

impl Default for TokenKeeper {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenKeeper {
    #[must_use]
    pub fn new() -> Self {
        let mut rng = rand::thread_rng();
        let mut current = [0u8; SECRET_LEN];
        let mut previous = [0u8; SECRET_LEN];
        rng.fill(&mut current);
        rng.fill(&mut previous);

        Self { current, previous }
    }

    /// The token for a querier at `ip` under the current secret.
    #[must_use]
    pub fn make_token(&self, ip: IpAddr) -> Vec<u8> {
        Self::token_for(ip, &self.current)
    }

    /// A token is valid if it matches the current or the previous secret
    /// for this IP.
    #[must_use]
    pub fn validate(&self, ip: IpAddr, token: &[u8]) -> bool {
        token == Self::token_for(ip, &self.current) || token == Self::token_for(ip, &self.previous)
    }

    /// Retires the current secret to `previous` and draws a fresh one.
    pub fn rotate(&mut self) {
        self.previous = self.current;
        rand::thread_rng().fill(&mut self.current);
        debug!("announce token secret rotated");
    }

    fn token_for(ip: IpAddr, secret: &[u8; SECRET_LEN]) -> Vec<u8> {
        let mut hasher = Sha1::new();
        match ip {
            IpAddr::V4(ip) => hasher.update(ip.octets()),
            IpAddr::V6(ip) => hasher.update(ip.octets()),
        }
        hasher.update(secret);

        hasher.finalize()[..TOKEN_LEN].to_vec()
    }
}

/// Peers stored from `announce_peer`, keyed by info-hash, with first-seen
/// timestamps for TTL purging.
#[derive(Debug, Default)]
pub struct PeerStore {
    peers: HashMap<InfoHash, HashMap<SocketAddr, DurationSinceUnixEpoch>>,
}

impl PeerStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an announce. Re-announcing refreshes the timestamp.
    pub fn add(&mut self, info_hash: InfoHash, peer: SocketAddr) {
        self.peers
            .entry(info_hash)
            .or_default()
            .insert(peer, CurrentClock::now());
    }

    /// Stored peers for a swarm, unordered.
    #[must_use]
    pub fn get(&self, info_hash: &InfoHash) -> Vec<SocketAddr> {
        self.peers
            .get(info_hash)
            .map(|entries| entries.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Drops every entry older than [`PEER_TTL`] and every swarm left
    /// empty.
    pub fn purge_expired(&mut self) {
        let now = CurrentClock::now();

        for entries in self.peers.values_mut() {
            entries.retain(|_, first_seen| now.saturating_sub(*first_seen) < PEER_TTL);
        }
        self.peers.retain(|_, entries| !entries.is_empty());
    }

    #[must_use]
    pub fn swarm_count(&self) -> usize {
        self.peers.len()
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::time::Duration;

    use harbor_clock::clock::stopped::Stopped as _;
    use harbor_clock::clock::Time;
    use harbor_primitives::info_hash::InfoHash;

    use super::{PeerStore, TokenKeeper, PEER_TTL, TOKEN_LEN};
    use crate::CurrentClock;

    const IP_A: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
    const IP_B: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

    #[test]
    fn a_token_should_be_8_bytes_and_bound_to_the_ip() {
        let keeper = TokenKeeper::new();

        let token = keeper.make_token(IP_A);
        assert_eq!(token.len(), TOKEN_LEN);

        assert!(keeper.validate(IP_A, &token));
        assert!(!keeper.validate(IP_B, &token));
    }

    #[test]
    fn a_token_should_survive_one_rotation_but_not_two() {
        let mut keeper = TokenKeeper::new();
        let token = keeper.make_token(IP_A);

        keeper.rotate();
        assert!(keeper.validate(IP_A, &token));

        keeper.rotate();
        assert!(!keeper.validate(IP_A, &token));
    }

    #[test]
    fn a_garbage_token_should_never_validate() {
        let keeper = TokenKeeper::new();

        assert!(!keeper.validate(IP_A, b"12345678"));
        assert!(!keeper.validate(IP_A, b""));
    }

    #[test]
    fn stored_peers_should_expire_after_the_ttl() {
        CurrentClock::local_set(&Duration::from_secs(100_000));

        let mut store = PeerStore::new();
        let info_hash = InfoHash([1; 20]);
        let peer = SocketAddr::new(IP_A, 6881);

        store.add(info_hash, peer);
        assert_eq!(store.get(&info_hash), vec![peer]);

        // Not yet expired.
        CurrentClock::local_add(&(PEER_TTL - Duration::from_secs(1))).unwrap();
        store.purge_expired();
        assert_eq!(store.get(&info_hash).len(), 1);

        // Expired.
        CurrentClock::local_add(&Duration::from_secs(1)).unwrap();
        store.purge_expired();
        assert!(store.get(&info_hash).is_empty());
        assert_eq!(store.swarm_count(), 0);
    }

    #[test]
    fn re_announcing_should_refresh_the_timestamp() {
        CurrentClock::local_set(&Duration::from_secs(200_000));

        let mut store = PeerStore::new();
        let info_hash = InfoHash([1; 20]);
        let peer = SocketAddr::new(IP_A, 6881);

        store.add(info_hash, peer);

        CurrentClock::local_add(&Duration::from_secs(20 * 60)).unwrap();
        store.add(info_hash, peer);

        // 20 more minutes: the refreshed entry is 20 minutes old, inside the
        // 30-minute TTL.
        CurrentClock::local_add(&Duration::from_secs(20 * 60)).unwrap();
        store.purge_expired();

        assert_eq!(store.get(&info_hash).len(), 1);
    }
}

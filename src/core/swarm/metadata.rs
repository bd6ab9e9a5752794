//! Fetching the metainfo of a magnet swarm from its peers (BEP 9).
//!
//! A magnet link only carries the identity; the `info` dictionary itself is
//! fetched chunk by chunk from peers that advertise `ut_metadata`. The
//! assembled bytes must hash to the swarm identity; a mismatch restarts the
//! fetch and the lying peer is not asked again. The whole fetch is bounded:
//! no usable peer within 30 seconds or no complete document within 5
//! minutes fails the start, leaving the swarm in `fetching-metadata` for
//! the operator.
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use harbor_clock::clock::Time;
use harbor_primitives::info_hash::InfoHash;
use harbor_primitives::DurationSinceUnixEpoch;
use sha1::{Digest, Sha1};
use tracing::{debug, warn};

use crate::protocol::extended::{metadata_chunk_count, METADATA_CHUNK_SIZE};
use crate::CurrentClock;

/// No peer with metadata within this long fails the fetch.
pub const NO_PEER_TIMEOUT: Duration = Duration::from_secs(30);

/// The whole fetch must finish within this long.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// One chunk request waits this long before being retried elsewhere.
const CHUNK_TIMEOUT: Duration = Duration::from_secs(20);

/// Outcome of feeding a `data` chunk into the fetch.
#[derive(Debug, PartialEq, Eq)]
pub enum MetadataProgress {
    /// More chunks are needed.
    Incomplete,
    /// All chunks arrived and the SHA-1 matches the identity.
    Complete(Vec<u8>),
    /// All chunks arrived but the hash did not match; the fetch restarted
    /// and the delivering peer is excluded.
    HashMismatch,
}

/// The state of one metadata fetch.
pub struct MetadataFetch {
    info_hash: InfoHash,
    total_size: Option<u64>,
    chunks: Vec<Option<Vec<u8>>>,
    /// The chunk currently requested: `(peer, chunk, issued_at)`.
    in_flight: Option<(SocketAddr, u32, DurationSinceUnixEpoch)>,
    /// Peers that rejected us or served a bad document.
    excluded: HashSet<SocketAddr>,
    started_at: DurationSinceUnixEpoch,
}

impl MetadataFetch {
    #[must_use]
    pub fn new(info_hash: InfoHash) -> Self {
        Self {
            info_hash,
            total_size: None,
            chunks: Vec::new(),
            in_flight: None,
            excluded: HashSet::new(),
            started_at: CurrentClock::now(),
        }
    }

    /// A peer's extended handshake advertised the metadata size. The first
    /// such handshake fixes the chunk layout.
    pub fn on_metadata_size(&mut self, total_size: u64) {
        if self.total_size.is_some() || total_size == 0 {
            return;
        }

        self.total_size = Some(total_size);
        self.chunks = vec![None; metadata_chunk_count(total_size) as usize];
        debug!(total_size, chunks = self.chunks.len(), "metadata size learned");
    }

    #[must_use]
    pub fn knows_size(&self) -> bool {
        self.total_size.is_some()
    }

    #[must_use]
    pub fn is_excluded(&self, address: SocketAddr) -> bool {
        self.excluded.contains(&address)
    }

    /// The next chunk to request from `address`, if this fetch wants one
    /// from that peer right now. One chunk is in flight at a time; a stale
    /// in-flight entry is recycled.
    pub fn next_request(&mut self, address: SocketAddr) -> Option<u32> {
        if self.excluded.contains(&address) || self.total_size.is_none() {
            return None;
        }

        if let Some((_, _, issued_at)) = self.in_flight {
            if CurrentClock::now().saturating_sub(issued_at) < CHUNK_TIMEOUT {
                return None;
            }
            self.in_flight = None;
        }

        #[allow(clippy::cast_possible_truncation)]
        let missing = self
            .chunks
            .iter()
            .position(Option::is_none)
            .map(|index| index as u32)?;

        self.in_flight = Some((address, missing, CurrentClock::now()));
        Some(missing)
    }

    /// A peer refused a chunk: do not bother it again.
    pub fn on_reject(&mut self, address: SocketAddr) {
        self.excluded.insert(address);
        if matches!(self.in_flight, Some((peer, _, _)) if peer == address) {
            self.in_flight = None;
        }
    }

    /// The peer went away; free its in-flight chunk.
    pub fn on_peer_closed(&mut self, address: SocketAddr) {
        if matches!(self.in_flight, Some((peer, _, _)) if peer == address) {
            self.in_flight = None;
        }
    }

    /// A `data` chunk arrived.
    pub fn on_data(&mut self, address: SocketAddr, chunk: u32, total_size: u64, payload: &[u8]) -> MetadataProgress {
        if self.total_size.is_none() {
            // Some peers never sent a handshake size; trust the data header.
            self.on_metadata_size(total_size);
        }

        let expected_len = self.chunk_length(chunk);

        let Some(slot) = self.chunks.get_mut(chunk as usize) else {
            return MetadataProgress::Incomplete;
        };

        if payload.len() != expected_len {
            warn!(%address, chunk, got = payload.len(), expected = expected_len, "bad metadata chunk length");
            self.excluded.insert(address);
            return MetadataProgress::Incomplete;
        }

        if slot.is_none() {
            *slot = Some(payload.to_vec());
        }

        if matches!(self.in_flight, Some((peer, piece, _)) if peer == address && piece == chunk) {
            self.in_flight = None;
        }

        if self.chunks.iter().any(Option::is_none) {
            return MetadataProgress::Incomplete;
        }

        // Assemble and check against the identity.
        let assembled: Vec<u8> = self.chunks.iter().flatten().flatten().copied().collect();

        let mut hasher = Sha1::new();
        hasher.update(&assembled);
        let digest: [u8; 20] = hasher.finalize().into();

        if digest == self.info_hash.bytes() {
            MetadataProgress::Complete(assembled)
        } else {
            warn!(%address, "assembled metadata does not hash to the identity; restarting");
            self.excluded.insert(address);
            for slot in &mut self.chunks {
                *slot = None;
            }
            MetadataProgress::HashMismatch
        }
    }

    /// The deadline verdict for the timers in the swarm loop.
    #[must_use]
    pub fn timed_out(&self) -> Option<&'static str> {
        let elapsed = CurrentClock::now().saturating_sub(self.started_at);

        if elapsed >= FETCH_TIMEOUT {
            return Some("metadata-fetch-timeout");
        }
        if !self.knows_size() && elapsed >= NO_PEER_TIMEOUT {
            return Some("no-metadata-peers");
        }

        None
    }

    fn chunk_length(&self, chunk: u32) -> usize {
        let total = self.total_size.unwrap_or(0) as usize;
        let start = chunk as usize * METADATA_CHUNK_SIZE;

        METADATA_CHUNK_SIZE.min(total.saturating_sub(start))
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::time::Duration;

    use harbor_clock::clock::stopped::Stopped as _;
    use harbor_clock::clock::Time;
    use harbor_primitives::info_hash::InfoHash;
    use sha1::{Digest, Sha1};

    use super::{MetadataFetch, MetadataProgress, FETCH_TIMEOUT, NO_PEER_TIMEOUT};
    use crate::protocol::extended::METADATA_CHUNK_SIZE;
    use crate::CurrentClock;

    fn address(last_octet: u8) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last_octet)), 6881)
    }

    fn document_and_fetch(len: usize) -> (Vec<u8>, MetadataFetch) {
        let document = vec![0xA5u8; len];
        let mut hasher = Sha1::new();
        hasher.update(&document);
        let digest: [u8; 20] = hasher.finalize().into();

        (document, MetadataFetch::new(InfoHash(digest)))
    }

    #[test]
    fn a_single_chunk_document_should_complete_in_one_data_message() {
        CurrentClock::local_set(&Duration::from_secs(1_000));
        let (document, mut fetch) = document_and_fetch(100);

        fetch.on_metadata_size(100);
        assert_eq!(fetch.next_request(address(1)), Some(0));

        let progress = fetch.on_data(address(1), 0, 100, &document);

        assert_eq!(progress, MetadataProgress::Complete(document));
    }

    #[test]
    fn a_multi_chunk_document_should_assemble_in_order() {
        CurrentClock::local_set(&Duration::from_secs(1_000));
        let (document, mut fetch) = document_and_fetch(METADATA_CHUNK_SIZE + 50);

        fetch.on_metadata_size(document.len() as u64);

        assert_eq!(fetch.next_request(address(1)), Some(0));
        assert_eq!(
            fetch.on_data(address(1), 0, document.len() as u64, &document[..METADATA_CHUNK_SIZE]),
            MetadataProgress::Incomplete
        );

        assert_eq!(fetch.next_request(address(1)), Some(1));
        assert_eq!(
            fetch.on_data(address(1), 1, document.len() as u64, &document[METADATA_CHUNK_SIZE..]),
            MetadataProgress::Complete(document.clone())
        );
    }

    #[test]
    fn a_hash_mismatch_should_restart_and_exclude_the_peer() {
        CurrentClock::local_set(&Duration::from_secs(1_000));
        let (_document, mut fetch) = document_and_fetch(100);

        fetch.on_metadata_size(100);
        fetch.next_request(address(1));

        let progress = fetch.on_data(address(1), 0, 100, &[0u8; 100]);

        assert_eq!(progress, MetadataProgress::HashMismatch);
        assert!(fetch.is_excluded(address(1)));
        // The fetch restarts from scratch with another peer.
        assert_eq!(fetch.next_request(address(1)), None);
        assert_eq!(fetch.next_request(address(2)), Some(0));
    }

    #[test]
    fn only_one_chunk_should_be_in_flight_at_a_time() {
        CurrentClock::local_set(&Duration::from_secs(1_000));
        let (_document, mut fetch) = document_and_fetch(100);
        fetch.on_metadata_size(100);

        assert_eq!(fetch.next_request(address(1)), Some(0));
        assert_eq!(fetch.next_request(address(2)), None);

        // A stale in-flight request is recycled.
        CurrentClock::local_add(&Duration::from_secs(21)).unwrap();
        assert_eq!(fetch.next_request(address(2)), Some(0));
    }

    #[test]
    fn a_reject_should_exclude_the_peer_and_free_the_chunk() {
        CurrentClock::local_set(&Duration::from_secs(1_000));
        let (_document, mut fetch) = document_and_fetch(100);
        fetch.on_metadata_size(100);

        fetch.next_request(address(1));
        fetch.on_reject(address(1));

        assert!(fetch.is_excluded(address(1)));
        assert_eq!(fetch.next_request(address(2)), Some(0));
    }

    #[test]
    fn deadlines_should_fire_in_the_documented_order() {
        CurrentClock::local_set(&Duration::from_secs(10_000));
        let (_document, mut fetch) = document_and_fetch(100);

        assert_eq!(fetch.timed_out(), None);

        // 30 s with no peer advertising a size.
        CurrentClock::local_add(&NO_PEER_TIMEOUT).unwrap();
        assert_eq!(fetch.timed_out(), Some("no-metadata-peers"));

        // Learning the size clears that deadline.
        fetch.on_metadata_size(100);
        assert_eq!(fetch.timed_out(), None);

        // The overall deadline still applies.
        CurrentClock::local_add(&FETCH_TIMEOUT).unwrap();
        assert_eq!(fetch.timed_out(), Some("metadata-fetch-timeout"));
    }
}

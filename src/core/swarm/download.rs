//! The download scheduler: rarest-first piece selection, request pipelining
//! and verification bookkeeping.
//!
//! The scheduler owns the piece state machine of its swarm: the complete
//! set, the pieces currently being assembled, the skipped set (file
//! selection) and one `(piece, offset)` in-flight set that keeps two peers
//! from fetching the same block concurrently. It is driven from the swarm
//! loop: a pump tick fills request pipelines, block arrivals mutate pieces,
//! choke transitions and timeouts recycle requests.
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use harbor_clock::clock::Time;
use harbor_metainfo::Metainfo;
use tracing::{debug, warn};

use crate::core::pieces::Piece;
use crate::peers::bitfield::Bitfield;
use crate::peers::{OutstandingRequest, PeerManager, PeerState};
use crate::protocol::message::{BlockInfo, Message};
use crate::CurrentClock;

/// An outstanding request is given up after this long; the block becomes
/// eligible for other peers. Timeouts alone never ban a peer.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A piece failing verification this many times in a row pauses the swarm.
pub const MAX_VERIFICATION_FAILURES: u32 = 3;

/// What a block arrival amounted to.
#[derive(Debug, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Unsolicited, duplicate-after-rerequest, or mismatched length;
    /// ignored without touching piece state.
    Rejected,
    /// Stored; the piece still has missing blocks.
    Accepted,
    /// The piece completed and verified; here are its bytes.
    PieceVerified { piece_index: u32, data: Vec<u8> },
    /// The piece completed but failed its hash and was reset. `fatal` when
    /// the failure streak reached [`MAX_VERIFICATION_FAILURES`].
    VerificationFailed { piece_index: u32, fatal: bool },
}

/// The per-swarm download state machine.
pub struct DownloadScheduler {
    metainfo: Arc<Metainfo>,
    /// Outstanding requests allowed per peer.
    depth: usize,

    complete: HashSet<u32>,
    active: HashMap<u32, Piece>,
    skipped: HashSet<u32>,

    /// Blocks currently requested from any peer.
    in_flight: HashSet<(u32, u32)>,

    /// Consecutive verification failures per piece.
    failures: HashMap<u32, u32>,
}

impl DownloadScheduler {
    #[must_use]
    pub fn new(metainfo: Arc<Metainfo>, depth: usize) -> Self {
        Self {
            metainfo,
            depth,
            complete: HashSet::new(),
            active: HashMap::new(),
            skipped: HashSet::new(),
            in_flight: HashSet::new(),
            failures: HashMap::new(),
        }
    }

    /// Marks pieces found valid on disk, on startup.
    pub fn mark_complete_from_disk(&mut self, valid: impl IntoIterator<Item = u32>) {
        self.complete.extend(valid);
    }

    /// Replaces the skipped set from a file selection. Active pieces that
    /// fell out of selection are dropped and their requests cancelled.
    pub fn set_skipped(&mut self, skipped: HashSet<u32>, peers: &mut PeerManager) {
        let newly_skipped: Vec<u32> = skipped.difference(&self.skipped).copied().collect();
        self.skipped = skipped;

        for piece_index in newly_skipped {
            if self.active.remove(&piece_index).is_some() {
                self.cancel_piece_requests(piece_index, peers);
            }
        }
    }

    #[must_use]
    pub fn completed_pieces(&self) -> Vec<u32> {
        let mut pieces: Vec<u32> = self.complete.iter().copied().collect();
        pieces.sort_unstable();
        pieces
    }

    #[must_use]
    pub fn complete_set(&self) -> &HashSet<u32> {
        &self.complete
    }

    /// Download done: every non-skipped piece is complete.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        #[allow(clippy::cast_possible_truncation)]
        (0..self.metainfo.piece_count() as u32)
            .all(|piece_index| self.skipped.contains(&piece_index) || self.complete.contains(&piece_index))
    }

    /// Completed fraction of the selected pieces, in `0.0..=1.0`.
    #[must_use]
    pub fn progress(&self) -> f64 {
        let total = self.metainfo.piece_count() - self.skipped.len();
        if total == 0 {
            return 1.0;
        }

        let done = self.complete.iter().filter(|piece| !self.skipped.contains(piece)).count();

        #[allow(clippy::cast_precision_loss)]
        {
            done as f64 / total as f64
        }
    }

    /// Our advertised bitfield.
    #[must_use]
    pub fn bitfield(&self) -> Bitfield {
        let mut field = Bitfield::new(self.metainfo.piece_count());
        for piece_index in &self.complete {
            field.set(*piece_index);
        }
        field
    }

    /// One scheduling tick: recycle timed-out requests, adjust interest,
    /// fill every unchoked peer's pipeline up to the depth limit.
    pub fn pump(&mut self, peers: &mut PeerManager) {
        self.recycle_timeouts(peers);

        let availability = peers.availability();
        let now = CurrentClock::now();

        for peer in peers.operational_mut() {
            let wants_something = self.peer_has_needed_piece(peer);

            if wants_something && !peer.am_interested {
                peer.am_interested = true;
                peer.send(Message::Interested);
            } else if !wants_something && peer.am_interested {
                peer.am_interested = false;
                peer.send(Message::NotInterested);
            }

            if peer.peer_choking || !wants_something {
                continue;
            }

            while peer.outstanding.len() < self.depth {
                let Some((piece_index, offset, length)) = self.pick_block(peer, &availability) else {
                    break;
                };

                peer.outstanding.insert(
                    (piece_index, offset),
                    OutstandingRequest {
                        length,
                        issued_at: now,
                    },
                );
                self.in_flight.insert((piece_index, offset));

                peer.send(Message::Request(BlockInfo {
                    piece_index,
                    offset,
                    length,
                }));
            }
        }
    }

    /// A block arrived from `peer`.
    pub fn on_block(&mut self, peer: &mut PeerState, piece_index: u32, offset: u32, data: Vec<u8>) -> BlockOutcome {
        let key = (piece_index, offset);

        // Only blocks matching an outstanding request are accepted. A block
        // whose request was recycled to another peer arrives with no entry
        // here and is treated as duplicate-received.
        let Some(request) = peer.outstanding.get(&key).copied() else {
            debug!(address = %peer.address, piece_index, offset, "ignoring unsolicited block");
            return BlockOutcome::Rejected;
        };

        if data.len() != request.length as usize {
            warn!(
                address = %peer.address,
                piece_index, offset,
                expected = request.length,
                got = data.len(),
                "block length does not match the request"
            );
            peer.outstanding.remove(&key);
            self.in_flight.remove(&key);
            return BlockOutcome::Rejected;
        }

        peer.outstanding.remove(&key);
        self.in_flight.remove(&key);
        peer.delivered_bytes += data.len() as u64;
        peer.delivered_this_round += data.len() as u64;

        let Some(piece) = self.active.get_mut(&piece_index) else {
            // The piece completed through another peer in the meantime.
            return BlockOutcome::Rejected;
        };

        if piece.add_block(offset, data).is_err() {
            return BlockOutcome::Rejected;
        }

        if !piece.is_complete() {
            return BlockOutcome::Accepted;
        }

        match piece.verify() {
            Ok(true) => {
                let data = piece.take_assembled().expect("a verified piece has its bytes");
                self.active.remove(&piece_index);
                self.complete.insert(piece_index);
                self.failures.remove(&piece_index);

                BlockOutcome::PieceVerified { piece_index, data }
            }
            Ok(false) | Err(_) => {
                let streak = self.failures.entry(piece_index).or_insert(0);
                *streak += 1;
                let fatal = *streak >= MAX_VERIFICATION_FAILURES;

                warn!(piece_index, streak, "piece failed verification; resetting");
                piece.reset();
                if fatal {
                    self.active.remove(&piece_index);
                }

                BlockOutcome::VerificationFailed { piece_index, fatal }
            }
        }
    }

    /// The peer choked us: its outstanding requests are void and their
    /// blocks immediately eligible for other peers.
    pub fn on_choke(&mut self, peer: &mut PeerState) {
        for key in peer.outstanding.drain() {
            self.in_flight.remove(&key.0);
        }
    }

    /// A peer went away entirely.
    pub fn on_peer_closed(&mut self, peer: &PeerState) {
        for key in peer.outstanding.keys() {
            self.in_flight.remove(key);
        }
    }

    /// Cancels every outstanding request for one piece, on every peer.
    pub fn cancel_piece_requests(&mut self, piece_index: u32, peers: &mut PeerManager) {
        for peer in peers.operational_mut() {
            let cancelled: Vec<((u32, u32), OutstandingRequest)> = peer
                .outstanding
                .iter()
                .filter(|((piece, _), _)| *piece == piece_index)
                .map(|(key, request)| (*key, *request))
                .collect();

            for ((piece, offset), request) in cancelled {
                peer.outstanding.remove(&(piece, offset));
                self.in_flight.remove(&(piece, offset));
                peer.send(Message::Cancel(BlockInfo {
                    piece_index: piece,
                    offset,
                    length: request.length,
                }));
            }
        }
    }

    fn recycle_timeouts(&mut self, peers: &mut PeerManager) {
        let now = CurrentClock::now();

        for peer in peers.operational_mut() {
            let expired: Vec<(u32, u32)> = peer
                .outstanding
                .iter()
                .filter(|(_, request)| now.saturating_sub(request.issued_at) >= REQUEST_TIMEOUT)
                .map(|(key, _)| *key)
                .collect();

            for key in expired {
                debug!(address = %peer.address, piece = key.0, offset = key.1, "request timed out; recycling");
                peer.outstanding.remove(&key);
                self.in_flight.remove(&key);
            }
        }
    }

    fn peer_has_needed_piece(&self, peer: &PeerState) -> bool {
        #[allow(clippy::cast_possible_truncation)]
        (0..self.metainfo.piece_count() as u32).any(|piece_index| {
            !self.complete.contains(&piece_index) && !self.skipped.contains(&piece_index) && peer.bitfield.has(piece_index)
        })
    }

    /// Picks the next block to request from `peer`: continue an active piece
    /// the peer has, otherwise open the rarest piece the peer can serve
    /// (ties break toward the lowest index).
    fn pick_block(&mut self, peer: &PeerState, availability: &[u32]) -> Option<(u32, u32, u32)> {
        // Continue active pieces first, lowest index first for determinism.
        let mut active_indices: Vec<u32> = self
            .active
            .keys()
            .copied()
            .filter(|piece_index| peer.bitfield.has(*piece_index))
            .collect();
        active_indices.sort_unstable();

        for piece_index in active_indices {
            if let Some(block) = self.first_free_block(piece_index) {
                return Some(block);
            }
        }

        // Open a new piece: rarest-first.
        let next = self.rarest_candidate(peer, availability)?;

        let length = u32::try_from(self.metainfo.length_of_piece(next as usize)).expect("pieces fit in u32");
        let hash = self.metainfo.pieces()[next as usize];
        self.active.insert(next, Piece::new(next, length, hash));

        self.first_free_block(next)
    }

    fn rarest_candidate(&self, peer: &PeerState, availability: &[u32]) -> Option<u32> {
        let mut best: Option<(u32, u32)> = None; // (availability, index)

        #[allow(clippy::cast_possible_truncation)]
        for piece_index in 0..self.metainfo.piece_count() as u32 {
            if self.complete.contains(&piece_index)
                || self.active.contains_key(&piece_index)
                || self.skipped.contains(&piece_index)
                || !peer.bitfield.has(piece_index)
            {
                continue;
            }

            let count = availability.get(piece_index as usize).copied().unwrap_or(0);
            let better = match best {
                None => true,
                Some((best_count, _)) => count < best_count,
            };
            if better {
                best = Some((count, piece_index));
            }
        }

        best.map(|(_, piece_index)| piece_index)
    }

    fn first_free_block(&self, piece_index: u32) -> Option<(u32, u32, u32)> {
        let piece = self.active.get(&piece_index)?;

        piece
            .missing_blocks()
            .into_iter()
            .find(|block| !self.in_flight.contains(&(piece_index, block.offset)))
            .map(|block| (piece_index, block.offset, block.length))
    }
}

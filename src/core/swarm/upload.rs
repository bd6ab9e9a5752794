//! The upload scheduler: serving blocks, tit-for-tat choking, the
//! optimistic unchoke and optional super-seeding.
//!
//! Serving is bounded twice: a per-swarm slot semaphore (default 4
//! concurrent uploads) and a global one shared by every swarm (default 20).
//! Each upload runs as its own task: acquire slots, re-check that the peer
//! is still unchoked and the request not cancelled, read the block from
//! disk, pay the upload throttle (inside the connection) and send. The
//! gate is how a `choke` or `cancel` issued by the swarm loop reaches
//! uploads that are already queued.
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use rand::seq::SliceRandom;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, warn};

use crate::core::storage::FileMap;
use crate::peers::{PeerManager, PeerState};
use crate::protocol::message::{BlockInfo, Message};
use crate::protocol::BLOCK_SIZE;

/// An upload that finished; accounted by the swarm loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Uploaded {
    pub address: SocketAddr,
    pub bytes: u64,
}

/// Visible to queued upload tasks: who is currently unchoked and which
/// requests were cancelled while waiting for a slot.
#[derive(Debug, Default)]
struct ServingGate {
    unchoked: Mutex<HashSet<SocketAddr>>,
    cancelled: Mutex<HashSet<(SocketAddr, u32, u32)>>,
}

impl ServingGate {
    fn may_serve(&self, address: SocketAddr, block: &BlockInfo) -> bool {
        let unchoked = self.unchoked.lock().expect("gate lock poisoned").contains(&address);
        let cancelled = self
            .cancelled
            .lock()
            .expect("gate lock poisoned")
            .remove(&(address, block.piece_index, block.offset));

        unchoked && !cancelled
    }
}

/// The per-swarm upload side.
pub struct UploadScheduler {
    /// Reciprocation slots, not counting the optimistic one.
    unchoke_slots: usize,
    per_swarm_slots: Arc<Semaphore>,
    global_slots: Arc<Semaphore>,
    gate: Arc<ServingGate>,

    optimistic: Option<SocketAddr>,

    super_seeding: bool,
    /// In super-seeding mode a piece is offered to one peer at a time until
    /// that peer advertises it.
    super_assignments: HashMap<u32, SocketAddr>,
}

impl UploadScheduler {
    #[must_use]
    pub fn new(unchoke_slots: usize, per_swarm_uploads: usize, global_slots: Arc<Semaphore>) -> Self {
        Self {
            unchoke_slots,
            per_swarm_slots: Arc::new(Semaphore::new(per_swarm_uploads)),
            global_slots,
            gate: Arc::new(ServingGate::default()),
            optimistic: None,
            super_seeding: false,
            super_assignments: HashMap::new(),
        }
    }

    pub fn set_super_seeding(&mut self, enabled: bool) {
        self.super_seeding = enabled;
        if !enabled {
            self.super_assignments.clear();
        }
    }

    /// A peer advertised a piece: in super-seeding mode this releases the
    /// piece for the next peer.
    pub fn on_peer_has(&mut self, piece_index: u32, address: SocketAddr) {
        if self.super_assignments.get(&piece_index) == Some(&address) {
            self.super_assignments.remove(&piece_index);
        }
    }

    /// A peer asked for a block. Returns `false` when the request is not
    /// served (choked peer, malformed request, super-seed hold).
    pub fn serve(
        &mut self,
        peer: &PeerState,
        block: BlockInfo,
        files: &Arc<FileMap>,
        completions: &mpsc::Sender<Uploaded>,
    ) -> bool {
        if peer.am_choking {
            debug!(address = %peer.address, "request from a choked peer ignored");
            return false;
        }

        if block.length == 0 || block.length > BLOCK_SIZE {
            warn!(address = %peer.address, length = block.length, "refusing block request with a bad length");
            return false;
        }

        let Ok(piece_length) = files.piece_length_at(block.piece_index) else {
            warn!(address = %peer.address, piece = block.piece_index, "refusing request for an unknown piece");
            return false;
        };
        if u64::from(block.offset) + u64::from(block.length) > piece_length {
            warn!(address = %peer.address, piece = block.piece_index, "refusing request past the end of the piece");
            return false;
        }

        if self.super_seeding {
            match self.super_assignments.get(&block.piece_index) {
                Some(assigned) if *assigned != peer.address => {
                    debug!(piece = block.piece_index, "piece is held for another peer (super-seeding)");
                    return false;
                }
                _ => {
                    self.super_assignments.insert(block.piece_index, peer.address);
                }
            }
        }

        let address = peer.address;
        let link = peer.link();
        let gate = self.gate.clone();
        let per_swarm = self.per_swarm_slots.clone();
        let global = self.global_slots.clone();
        let files = files.clone();
        let completions = completions.clone();

        tokio::spawn(async move {
            let Ok(_swarm_slot) = per_swarm.acquire().await else {
                return;
            };
            let Ok(_global_slot) = global.acquire().await else {
                return;
            };

            if !gate.may_serve(address, &block) {
                return;
            }

            let piece = match files.read_piece(block.piece_index).await {
                Ok(piece) => piece,
                Err(error) => {
                    warn!(piece = block.piece_index, %error, "upload read failed");
                    return;
                }
            };

            let start = block.offset as usize;
            let end = start + block.length as usize;
            let data = piece[start..end].to_vec();

            if !gate.may_serve(address, &block) {
                return;
            }

            link.send(Message::Piece {
                piece_index: block.piece_index,
                offset: block.offset,
                data,
            });

            let _ = completions
                .send(Uploaded {
                    address,
                    bytes: u64::from(block.length),
                })
                .await;
        });

        true
    }

    /// The peer cancelled a request it had queued with us.
    pub fn on_cancel(&self, address: SocketAddr, block: &BlockInfo) {
        self.gate
            .cancelled
            .lock()
            .expect("gate lock poisoned")
            .insert((address, block.piece_index, block.offset));
    }

    /// The 10-second tit-for-tat round: rank peers by the bytes they
    /// delivered to us since the previous round, unchoke the best
    /// `unchoke_slots` of the interested ones plus the optimistic slot,
    /// choke everyone else.
    pub fn choke_round(&mut self, peers: &mut PeerManager) {
        let mut ranked: Vec<(SocketAddr, u64)> = peers
            .operational()
            .filter(|peer| peer.peer_interested)
            .map(|peer| (peer.address, peer.delivered_this_round))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1));

        let mut keep: HashSet<SocketAddr> = ranked
            .iter()
            .take(self.unchoke_slots)
            .map(|(address, _)| *address)
            .collect();

        if let Some(optimistic) = self.optimistic {
            keep.insert(optimistic);
        }

        for peer in peers.operational_mut() {
            let wanted = keep.contains(&peer.address);

            if wanted && peer.am_choking {
                self.set_unchoked(peer, true);
            } else if !wanted && !peer.am_choking {
                self.set_unchoked(peer, false);
            }

            peer.delivered_this_round = 0;
        }
    }

    /// The 30-second optimistic rotation: one peer outside the
    /// reciprocation set, uniformly at random, gets unchoked regardless.
    pub fn rotate_optimistic(&mut self, peers: &mut PeerManager) {
        let candidates: Vec<SocketAddr> = peers
            .operational()
            .filter(|peer| peer.am_choking && peer.peer_interested)
            .map(|peer| peer.address)
            .collect();

        let Some(choice) = candidates.choose(&mut rand::thread_rng()).copied() else {
            return;
        };

        debug!(address = %choice, "optimistic unchoke");
        self.optimistic = Some(choice);

        if let Some(peer) = peers.get_mut(&choice) {
            self.set_unchoked(peer, true);
        }
    }

    /// Who is unchoked right now (for the stats surface).
    #[must_use]
    pub fn optimistic_peer(&self) -> Option<SocketAddr> {
        self.optimistic
    }

    fn set_unchoked(&self, peer: &mut PeerState, unchoked: bool) {
        let mut gate = self.gate.unchoked.lock().expect("gate lock poisoned");

        if unchoked {
            peer.am_choking = false;
            gate.insert(peer.address);
            peer.send(Message::Unchoke);
        } else {
            peer.am_choking = true;
            gate.remove(&peer.address);
            peer.send(Message::Choke);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::Arc;

    use harbor_metainfo::Metainfo;
    use harbor_primitives::info_hash::InfoHash;
    use harbor_primitives::peer;
    use sha1::{Digest, Sha1};
    use tokio::sync::{mpsc, Semaphore};

    use super::{UploadScheduler, Uploaded};
    use crate::core::storage::FileMap;
    use crate::peers::connection::TransferLimits;
    use crate::peers::PeerManager;
    use crate::protocol::message::BlockInfo;
    use crate::throttle::RateLimiter;

    fn address(last_octet: u8) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last_octet)), 6881)
    }

    fn manager_with(addresses: &[SocketAddr]) -> (PeerManager, mpsc::Receiver<crate::peers::connection::PeerEvent>) {
        let (event_tx, event_rx) = mpsc::channel(64);

        let mut manager = PeerManager::new(
            InfoHash([1; 20]),
            peer::Id(*b"-HB0100-000000000001"),
            3,
            50,
            event_tx,
            TransferLimits {
                download: RateLimiter::new(0),
                upload: RateLimiter::new(0),
            },
        );

        manager.add_candidates(addresses.iter().copied());
        manager.dial_candidates();
        for address in addresses {
            manager.on_connected(*address, peer::Id([9; 20]), false);
            manager.get_mut(address).unwrap().peer_interested = true;
        }

        (manager, event_rx)
    }

    fn scheduler(unchoke_slots: usize) -> UploadScheduler {
        UploadScheduler::new(unchoke_slots, 4, Arc::new(Semaphore::new(20)))
    }

    async fn single_piece_files() -> (Arc<FileMap>, tempfile::TempDir) {
        let content = b"ABCDEFGH";
        let mut document = b"d4:infod6:lengthi8e4:name1:f12:piece lengthi8e6:pieces20:".to_vec();
        let mut hasher = Sha1::new();
        hasher.update(content);
        let digest: [u8; 20] = hasher.finalize().into();
        document.extend_from_slice(&digest);
        document.extend_from_slice(b"ee");
        let metainfo = Metainfo::parse(&document).unwrap();

        let root = tempfile::tempdir().unwrap();
        let files = FileMap::new(&metainfo, root.path()).unwrap();
        files.initialize().await.unwrap();
        files.write_piece(0, content).await.unwrap();

        (Arc::new(files), root)
    }

    #[tokio::test]
    async fn the_choke_round_should_unchoke_the_best_reciprocators() {
        let (mut peers, _events) = manager_with(&[address(1), address(2), address(3)]);
        peers.get_mut(&address(1)).unwrap().delivered_this_round = 100;
        peers.get_mut(&address(2)).unwrap().delivered_this_round = 300;
        peers.get_mut(&address(3)).unwrap().delivered_this_round = 200;

        let mut scheduler = scheduler(2);
        scheduler.choke_round(&mut peers);

        assert!(!peers.get(&address(2)).unwrap().am_choking);
        assert!(!peers.get(&address(3)).unwrap().am_choking);
        assert!(peers.get(&address(1)).unwrap().am_choking);

        // The round counter resets.
        assert_eq!(peers.get(&address(2)).unwrap().delivered_this_round, 0);
    }

    #[tokio::test]
    async fn a_peer_that_stops_delivering_should_lose_its_slot() {
        let (mut peers, _events) = manager_with(&[address(1), address(2)]);
        let mut scheduler = scheduler(1);

        peers.get_mut(&address(1)).unwrap().delivered_this_round = 500;
        scheduler.choke_round(&mut peers);
        assert!(!peers.get(&address(1)).unwrap().am_choking);

        // Next round peer 2 delivers more.
        peers.get_mut(&address(2)).unwrap().delivered_this_round = 700;
        scheduler.choke_round(&mut peers);

        assert!(peers.get(&address(1)).unwrap().am_choking);
        assert!(!peers.get(&address(2)).unwrap().am_choking);
    }

    #[tokio::test]
    async fn the_optimistic_slot_should_survive_choke_rounds() {
        let (mut peers, _events) = manager_with(&[address(1), address(2)]);
        let mut scheduler = scheduler(1);

        // Peer 1 earns the reciprocation slot; the rotation can only pick
        // peer 2.
        peers.get_mut(&address(1)).unwrap().delivered_this_round = 500;
        scheduler.choke_round(&mut peers);
        scheduler.rotate_optimistic(&mut peers);

        assert_eq!(scheduler.optimistic_peer(), Some(address(2)));
        assert!(!peers.get(&address(2)).unwrap().am_choking);

        peers.get_mut(&address(1)).unwrap().delivered_this_round = 500;
        scheduler.choke_round(&mut peers);

        assert!(!peers.get(&address(2)).unwrap().am_choking, "optimistic peer stays unchoked");
    }

    #[tokio::test]
    async fn serving_should_read_the_block_and_report_completion() {
        let (files, _root) = single_piece_files().await;
        let (mut peers, _events) = manager_with(&[address(1)]);
        let mut scheduler = scheduler(1);

        peers.get_mut(&address(1)).unwrap().delivered_this_round = 1;
        scheduler.choke_round(&mut peers);

        let (completions_tx, mut completions) = mpsc::channel(4);
        let accepted = scheduler.serve(
            peers.get(&address(1)).unwrap(),
            BlockInfo {
                piece_index: 0,
                offset: 2,
                length: 4,
            },
            &files,
            &completions_tx,
        );

        assert!(accepted);
        assert_eq!(
            completions.recv().await,
            Some(Uploaded {
                address: address(1),
                bytes: 4
            })
        );
    }

    #[tokio::test]
    async fn requests_from_choked_peers_should_be_ignored() {
        let (files, _root) = single_piece_files().await;
        let (peers, _events) = manager_with(&[address(1)]);
        let mut scheduler = scheduler(1);

        let (completions_tx, _completions) = mpsc::channel(4);
        let accepted = scheduler.serve(
            peers.get(&address(1)).unwrap(),
            BlockInfo {
                piece_index: 0,
                offset: 0,
                length: 4,
            },
            &files,
            &completions_tx,
        );

        assert!(!accepted);
    }

    #[tokio::test]
    async fn malformed_requests_should_be_refused() {
        let (files, _root) = single_piece_files().await;
        let (mut peers, _events) = manager_with(&[address(1)]);
        let mut scheduler = scheduler(1);
        peers.get_mut(&address(1)).unwrap().delivered_this_round = 1;
        scheduler.choke_round(&mut peers);

        let (completions_tx, _completions) = mpsc::channel(4);
        let peer_ref = peers.get(&address(1)).unwrap();

        // Past the end of the piece.
        assert!(!scheduler.serve(
            peer_ref,
            BlockInfo {
                piece_index: 0,
                offset: 6,
                length: 4
            },
            &files,
            &completions_tx
        ));
        // Unknown piece.
        assert!(!scheduler.serve(
            peer_ref,
            BlockInfo {
                piece_index: 9,
                offset: 0,
                length: 4
            },
            &files,
            &completions_tx
        ));
        // Oversize block.
        assert!(!scheduler.serve(
            peer_ref,
            BlockInfo {
                piece_index: 0,
                offset: 0,
                length: 100_000
            },
            &files,
            &completions_tx
        ));
    }

    #[tokio::test]
    async fn super_seeding_should_hold_a_piece_for_one_peer_until_it_is_advertised() {
        let (files, _root) = single_piece_files().await;
        let (mut peers, _events) = manager_with(&[address(1), address(2)]);
        let mut scheduler = scheduler(2);

        peers.get_mut(&address(1)).unwrap().delivered_this_round = 1;
        peers.get_mut(&address(2)).unwrap().delivered_this_round = 1;
        scheduler.choke_round(&mut peers);
        scheduler.set_super_seeding(true);

        let (completions_tx, mut completions) = mpsc::channel(4);
        let block = BlockInfo {
            piece_index: 0,
            offset: 0,
            length: 8,
        };

        // Peer 1 claims the piece; peer 2 is held off.
        assert!(scheduler.serve(peers.get(&address(1)).unwrap(), block, &files, &completions_tx));
        assert!(!scheduler.serve(peers.get(&address(2)).unwrap(), block, &files, &completions_tx));
        let _ = completions.recv().await;

        // Peer 1 advertises the piece: it is released for peer 2.
        scheduler.on_peer_has(0, address(1));
        assert!(scheduler.serve(peers.get(&address(2)).unwrap(), block, &files, &completions_tx));
    }
}

//! The iterative Kademlia lookup.
//!
//! Starting from the closest nodes we already know (plus bootstrap
//! addresses whose ids are still unknown), query up to α nodes in parallel,
//! merge the closer nodes each response reveals, and repeat. The lookup
//! converges when at least k nodes have answered and two consecutive rounds
//! discovered nobody closer, or when candidates run out, or after a bounded
//! number of iterations.
//!
//! A `get_peers` lookup additionally accumulates peers and remembers the
//! announce token each responder handed us, keyed by responder endpoint.
use std::collections::HashMap;
use std::net::SocketAddr;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use super::messages::{Query, ResponseData};
use super::routing::{NodeEntry, NodeId};

/// Parallelism of one lookup round.
pub const ALPHA: usize = 3;

/// The `k` of Kademlia: bucket size, result-set size, termination quorum.
pub const K: usize = 8;

/// Hard bound on lookup rounds.
pub const MAX_ITERATIONS: usize = 20;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("query timed out")]
    Timeout,

    #[error("node answered error {code}: {message}")]
    Remote { code: i64, message: String },

    #[error("socket error: {message}")]
    Io { message: String },
}

/// The transport a lookup sends its queries through. The production
/// implementation is the DHT service's socket; tests substitute a scripted
/// network.
#[async_trait]
pub trait QueryClient: Send + Sync {
    async fn query(&self, address: SocketAddr, query: Query) -> Result<ResponseData, QueryError>;
}

/// What kind of query the lookup iterates with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupKind {
    FindNode,
    GetPeers,
}

/// The result of a converged lookup.
#[derive(Debug, Default)]
pub struct LookupOutcome {
    /// The closest responding nodes, nearest first, at most [`K`].
    pub closest: Vec<NodeEntry>,
    /// Peers accumulated from `get_peers` responses.
    pub peers: Vec<SocketAddr>,
    /// Announce token per responding endpoint.
    pub tokens: HashMap<SocketAddr, Vec<u8>>,
}

#[derive(Debug, Clone)]
struct Candidate {
    address: SocketAddr,
    id: Option<NodeId>,
    queried: bool,
    responded: bool,
}

/// Runs one iterative lookup. `seeds` are known nodes; `bare_addresses` are
/// endpoints whose id is unknown (bootstrap nodes).
pub async fn iterative_lookup(
    client: &dyn QueryClient,
    our_id: NodeId,
    target: [u8; 20],
    kind: LookupKind,
    seeds: Vec<NodeEntry>,
    bare_addresses: Vec<SocketAddr>,
) -> LookupOutcome {
    let mut candidates: Vec<Candidate> = Vec::new();

    for seed in seeds {
        push_candidate(&mut candidates, seed.address, Some(seed.id));
    }
    for address in bare_addresses {
        push_candidate(&mut candidates, address, None);
    }

    let mut outcome = LookupOutcome::default();
    let mut best_distance: Option<[u8; 20]> = None;
    let mut rounds_without_progress = 0usize;

    for round in 0..MAX_ITERATIONS {
        sort_candidates(&mut candidates, &target);

        let batch: Vec<(SocketAddr, Query)> = candidates
            .iter_mut()
            .filter(|candidate| !candidate.queried)
            .take(ALPHA)
            .map(|candidate| {
                candidate.queried = true;
                (candidate.address, make_query(our_id, target, kind))
            })
            .collect();

        if batch.is_empty() {
            break;
        }

        let responses = futures::future::join_all(
            batch
                .iter()
                .map(|(address, query)| client.query(*address, query.clone())),
        )
        .await;

        let mut round_progressed = false;

        for ((address, _), response) in batch.into_iter().zip(responses) {
            let Ok(data) = response else {
                continue;
            };

            mark_responded(&mut candidates, address, data.id);

            if let Some(id) = data.id {
                let distance = id.distance(&target);
                let improved = match best_distance {
                    None => true,
                    Some(best) => distance < best,
                };
                if improved {
                    best_distance = Some(distance);
                    round_progressed = true;
                }
            }

            for node in data.nodes {
                push_candidate(&mut candidates, node.address, Some(node.id));
            }

            if kind == LookupKind::GetPeers {
                outcome.peers.extend(data.peers);
                if let Some(token) = data.token {
                    outcome.tokens.insert(address, token);
                }
            }
        }

        if round_progressed {
            rounds_without_progress = 0;
        } else {
            rounds_without_progress += 1;
        }

        let responded = candidates.iter().filter(|candidate| candidate.responded).count();
        if responded >= K && rounds_without_progress >= 2 {
            debug!(round, responded, "lookup converged");
            break;
        }
    }

    outcome.peers.sort_unstable();
    outcome.peers.dedup();

    let mut responders: Vec<&Candidate> = candidates
        .iter()
        .filter(|candidate| candidate.responded && candidate.id.is_some())
        .collect();
    responders.sort_by_key(|candidate| candidate.id.expect("filtered on id").distance(&target));

    outcome.closest = responders
        .into_iter()
        .take(K)
        .map(|candidate| NodeEntry {
            id: candidate.id.expect("filtered on id"),
            address: candidate.address,
        })
        .collect();

    outcome
}

fn make_query(our_id: NodeId, target: [u8; 20], kind: LookupKind) -> Query {
    match kind {
        LookupKind::FindNode => Query::FindNode {
            id: our_id,
            target: NodeId(target),
        },
        LookupKind::GetPeers => Query::GetPeers {
            id: our_id,
            info_hash: target,
        },
    }
}

fn push_candidate(candidates: &mut Vec<Candidate>, address: SocketAddr, id: Option<NodeId>) {
    if let Some(existing) = candidates.iter_mut().find(|candidate| candidate.address == address) {
        if existing.id.is_none() {
            existing.id = id;
        }
        return;
    }

    candidates.push(Candidate {
        address,
        id,
        queried: false,
        responded: false,
    });
}

fn mark_responded(candidates: &mut [Candidate], address: SocketAddr, id: Option<NodeId>) {
    if let Some(candidate) = candidates.iter_mut().find(|candidate| candidate.address == address) {
        candidate.responded = true;
        if candidate.id.is_none() {
            candidate.id = id;
        }
    }
}

/// Nearest-first; candidates with unknown ids (bootstrap endpoints) sort
/// first so they are contacted in the opening round.
fn sort_candidates(candidates: &mut [Candidate], target: &[u8; 20]) {
    candidates.sort_by_key(|candidate| match candidate.id {
        None => [0u8; 20],
        Some(id) => id.distance(target),
    });
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::{iterative_lookup, LookupKind, QueryClient, QueryError, K};
    use crate::dht::messages::{Query, ResponseData};
    use crate::dht::routing::{NodeEntry, NodeId};

    fn address(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn node(first_byte: u8, port: u16) -> NodeEntry {
        let mut id = [0u8; 20];
        id[0] = first_byte;
        NodeEntry {
            id: NodeId(id),
            address: address(port),
        }
    }

    /// A scripted network: every known endpoint answers with its node id
    /// and a fixed set of closer nodes / peers / token.
    #[derive(Default)]
    struct FakeNetwork {
        nodes: HashMap<SocketAddr, FakeNode>,
        queries: AtomicUsize,
    }

    struct FakeNode {
        id: NodeId,
        closer: Vec<NodeEntry>,
        peers: Vec<SocketAddr>,
        token: Option<Vec<u8>>,
    }

    #[async_trait]
    impl QueryClient for FakeNetwork {
        async fn query(&self, address: SocketAddr, _query: Query) -> Result<ResponseData, QueryError> {
            self.queries.fetch_add(1, Ordering::Relaxed);

            match self.nodes.get(&address) {
                None => Err(QueryError::Timeout),
                Some(node) => Ok(ResponseData {
                    id: Some(node.id),
                    nodes: node.closer.clone(),
                    peers: node.peers.clone(),
                    token: node.token.clone(),
                }),
            }
        }
    }

    fn network(entries: Vec<(NodeEntry, Vec<NodeEntry>, Vec<SocketAddr>, Option<Vec<u8>>)>) -> FakeNetwork {
        let mut nodes = HashMap::new();
        for (entry, closer, peers, token) in entries {
            nodes.insert(
                entry.address,
                FakeNode {
                    id: entry.id,
                    closer,
                    peers,
                    token,
                },
            );
        }
        FakeNetwork {
            nodes,
            queries: AtomicUsize::new(0),
        }
    }

    #[tokio::test]
    async fn a_lookup_should_walk_toward_the_target_through_revealed_nodes() {
        // Target 0x01; far node reveals a nearer one, which reveals the
        // nearest.
        let target_id = {
            let mut id = [0u8; 20];
            id[0] = 0x01;
            id
        };

        let nearest = node(0x01, 3);
        let mid = node(0x03, 2);
        let far = node(0x80, 1);

        let network = network(vec![
            (far, vec![mid], vec![], None),
            (mid, vec![nearest], vec![], None),
            (nearest, vec![], vec![], None),
        ]);

        let outcome = iterative_lookup(
            &network,
            NodeId([0xF0; 20]),
            target_id,
            LookupKind::FindNode,
            vec![far],
            vec![],
        )
        .await;

        assert_eq!(outcome.closest.first().map(|entry| entry.id), Some(nearest.id));
        assert_eq!(outcome.closest.len(), 3);
    }

    #[tokio::test]
    async fn get_peers_should_accumulate_peers_and_tokens_by_responder() {
        let responder = node(0x02, 1);
        let peer = address(9999);

        let network = network(vec![(responder, vec![], vec![peer], Some(b"tok-1234".to_vec()))]);

        let outcome = iterative_lookup(
            &network,
            NodeId([0xF0; 20]),
            [0x01; 20],
            LookupKind::GetPeers,
            vec![responder],
            vec![],
        )
        .await;

        assert_eq!(outcome.peers, vec![peer]);
        assert_eq!(outcome.tokens.get(&responder.address), Some(&b"tok-1234".to_vec()));
    }

    #[tokio::test]
    async fn unresponsive_nodes_should_not_appear_in_the_result() {
        let alive = node(0x02, 1);
        let dead = node(0x01, 2); // closer, but never answers

        let network = network(vec![(alive, vec![dead], vec![], None)]);

        let outcome = iterative_lookup(
            &network,
            NodeId([0xF0; 20]),
            [0x01; 20],
            LookupKind::FindNode,
            vec![alive, dead],
            vec![],
        )
        .await;

        assert_eq!(outcome.closest.len(), 1);
        assert_eq!(outcome.closest[0].id, alive.id);
    }

    #[tokio::test]
    async fn a_bootstrap_address_without_an_id_should_be_usable_as_a_seed() {
        let bootstrap = node(0x40, 1);

        let network = network(vec![(bootstrap, vec![], vec![], None)]);

        let outcome = iterative_lookup(
            &network,
            NodeId([0xF0; 20]),
            [0x01; 20],
            LookupKind::FindNode,
            vec![],
            vec![bootstrap.address],
        )
        .await;

        // The id is learned from the response.
        assert_eq!(outcome.closest.len(), 1);
        assert_eq!(outcome.closest[0].id, bootstrap.id);
    }

    #[tokio::test]
    async fn a_converged_lookup_should_stop_querying() {
        // A fully-connected mesh of K+4 nodes that all know each other:
        // after everyone answered once there is nothing new to learn, so
        // the query count is bounded by the node count.
        let all: Vec<NodeEntry> = (0..u8::try_from(K + 4).unwrap())
            .map(|index| node(index + 1, u16::from(index) + 1))
            .collect();

        let network = network(
            all.iter()
                .map(|entry| (*entry, all.clone(), vec![], None))
                .collect(),
        );

        let outcome = iterative_lookup(
            &network,
            NodeId([0xF0; 20]),
            [0x01; 20],
            LookupKind::FindNode,
            all[..2].to_vec(),
            vec![],
        )
        .await;

        assert_eq!(outcome.closest.len(), K);
        assert!(network.queries.load(Ordering::Relaxed) <= all.len());
    }
}

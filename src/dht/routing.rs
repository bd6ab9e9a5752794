//! Kademlia node ids, the xor metric and the routing table (BEP 5).
use std::net::SocketAddr;

use rand::Rng;

/// Nodes kept per bucket.
pub const BUCKET_SIZE: usize = 8;

/// One bucket per possible prefix length of the xor distance.
pub const BUCKET_COUNT: usize = 160;

/// A 20-byte Kademlia node id. Distances are xor, compared big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; 20]);

impl NodeId {
    #[must_use]
    pub fn random() -> Self {
        let mut id = [0u8; 20];
        rand::thread_rng().fill(&mut id);
        Self(id)
    }

    #[must_use]
    pub fn distance(&self, other: &[u8; 20]) -> [u8; 20] {
        let mut distance = [0u8; 20];
        for (index, byte) in distance.iter_mut().enumerate() {
            *byte = self.0[index] ^ other[index];
        }
        distance
    }

    /// The bucket a node at this distance belongs to: 159 minus the number
    /// of leading zero bits of the distance, or `None` for the distance to
    /// ourselves.
    #[must_use]
    pub fn bucket_index(&self, other: &[u8; 20]) -> Option<usize> {
        let distance = self.distance(other);

        let mut leading_zeros = 0usize;
        for byte in distance {
            if byte == 0 {
                leading_zeros += 8;
            } else {
                leading_zeros += byte.leading_zeros() as usize;
                break;
            }
        }

        (leading_zeros < 160).then(|| 159 - leading_zeros)
    }

    /// A random id that would land in `bucket` of this node's table. Used by
    /// the periodic bucket refresh.
    #[must_use]
    pub fn random_id_in_bucket(&self, bucket: usize) -> NodeId {
        let mut id = self.0;
        let differing_bit = 159 - bucket;

        // Flip the bit that defines the bucket, randomize everything below.
        id[differing_bit / 8] ^= 0x80 >> (differing_bit % 8);

        let mut rng = rand::thread_rng();
        for bit in (differing_bit + 1)..160 {
            let mask = 0x80 >> (bit % 8);
            if rng.gen_bool(0.5) {
                id[bit / 8] |= mask;
            } else {
                id[bit / 8] &= !mask;
            }
        }

        NodeId(id)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut chars = [0u8; 40];
        binascii::bin2hex(&self.0, &mut chars).expect("output buffer has the exact size");
        write!(f, "{}", std::str::from_utf8(&chars).expect("hex digits are ASCII"))
    }
}

/// A known node: its id and UDP endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeEntry {
    pub id: NodeId,
    pub address: SocketAddr,
}

/// The bounded routing table: 160 buckets of up to 8 nodes, ordered within a
/// bucket from least to most recently seen.
#[derive(Debug)]
pub struct RoutingTable {
    own_id: NodeId,
    buckets: Vec<Vec<NodeEntry>>,
}

impl RoutingTable {
    #[must_use]
    pub fn new(own_id: NodeId) -> Self {
        Self {
            own_id,
            buckets: vec![Vec::new(); BUCKET_COUNT],
        }
    }

    #[must_use]
    pub fn own_id(&self) -> NodeId {
        self.own_id
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(Vec::is_empty)
    }

    /// Inserts or refreshes a node. Our own id is never stored. A full
    /// bucket drops the newcomer; stale entries leave through the liveness
    /// ping in maintenance, not here.
    pub fn insert(&mut self, entry: NodeEntry) {
        let Some(bucket_index) = self.own_id.bucket_index(&entry.id.0) else {
            return;
        };

        let bucket = &mut self.buckets[bucket_index];

        if let Some(position) = bucket.iter().position(|existing| existing.id == entry.id) {
            // Known node: refresh its endpoint and move it to the tail.
            bucket.remove(position);
            bucket.push(entry);
            return;
        }

        if bucket.len() < BUCKET_SIZE {
            bucket.push(entry);
        }
    }

    pub fn remove(&mut self, id: &NodeId) {
        if let Some(bucket_index) = self.own_id.bucket_index(&id.0) {
            self.buckets[bucket_index].retain(|entry| entry.id != *id);
        }
    }

    /// The `k` nodes closest to `target` by xor distance.
    #[must_use]
    pub fn closest(&self, target: &[u8; 20], k: usize) -> Vec<NodeEntry> {
        let mut all: Vec<NodeEntry> = self.buckets.iter().flatten().copied().collect();

        all.sort_by_key(|entry| entry.id.distance(target));
        all.truncate(k);
        all
    }

    /// A uniformly random subset of the table, for liveness checks.
    #[must_use]
    pub fn random_entries(&self, count: usize) -> Vec<NodeEntry> {
        use rand::seq::SliceRandom;

        let mut all: Vec<NodeEntry> = self.buckets.iter().flatten().copied().collect();
        all.shuffle(&mut rand::thread_rng());
        all.truncate(count);
        all
    }

    /// Indices of buckets that hold at least one node.
    #[must_use]
    pub fn occupied_buckets(&self) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, bucket)| !bucket.is_empty())
            .map(|(index, _)| index)
            .collect()
    }
}

//! The bit-exact wire formats shared by the peer protocol, the trackers and
//! the DHT.
//!
//! - The 68-byte peer [`handshake`].
//! - Length-prefixed peer [`message`]s (BEP 3).
//! - The [`extended`] extension protocol and metadata transfer (BEP 10 / BEP 9).
//! - Compact peer and node records (BEP 23 / BEP 5), in this module.
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use thiserror::Error;

pub mod extended;
pub mod handshake;
pub mod message;

/// The unit of peer-to-peer transfer: pieces are requested in blocks of at
/// most this many bytes, and metadata is fetched in chunks of exactly this
/// size (except the last).
pub const BLOCK_SIZE: u32 = 16_384;

/// A compact peer record is 6 bytes: a 4-byte IPv4 address followed by a
/// big-endian 2-byte port (BEP 23).
pub const COMPACT_PEER_LEN: usize = 6;

/// A compact node record is 26 bytes: a 20-byte node id followed by a compact
/// peer record (BEP 5).
pub const COMPACT_NODE_LEN: usize = 26;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompactError {
    #[error("compact peer list length {len} is not a multiple of {COMPACT_PEER_LEN}")]
    BadPeerListLength { len: usize },

    #[error("compact node list length {len} is not a multiple of {COMPACT_NODE_LEN}")]
    BadNodeListLength { len: usize },
}

/// Decodes a compact peer list: any number of 6-byte records.
///
/// # Errors
///
/// Will return a [`CompactError`] if the input length is not a multiple of 6.
pub fn decode_compact_peers(bytes: &[u8]) -> Result<Vec<SocketAddr>, CompactError> {
    if bytes.len() % COMPACT_PEER_LEN != 0 {
        return Err(CompactError::BadPeerListLength { len: bytes.len() });
    }

    Ok(bytes
        .chunks_exact(COMPACT_PEER_LEN)
        .map(|record| {
            let ip = Ipv4Addr::new(record[0], record[1], record[2], record[3]);
            let port = u16::from_be_bytes([record[4], record[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .collect())
}

/// Encodes peers into the compact form. Only IPv4 peers can be represented;
/// others are skipped.
#[must_use]
pub fn encode_compact_peers(peers: &[SocketAddr]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(peers.len() * COMPACT_PEER_LEN);

    for peer in peers {
        if let IpAddr::V4(ip) = peer.ip() {
            bytes.extend_from_slice(&ip.octets());
            bytes.extend_from_slice(&peer.port().to_be_bytes());
        }
    }

    bytes
}

/// Decodes a compact node list: any number of 26-byte `id || ip || port`
/// records.
///
/// # Errors
///
/// Will return a [`CompactError`] if the input length is not a multiple of 26.
pub fn decode_compact_nodes(bytes: &[u8]) -> Result<Vec<([u8; 20], SocketAddr)>, CompactError> {
    if bytes.len() % COMPACT_NODE_LEN != 0 {
        return Err(CompactError::BadNodeListLength { len: bytes.len() });
    }

    Ok(bytes
        .chunks_exact(COMPACT_NODE_LEN)
        .map(|record| {
            let mut id = [0u8; 20];
            id.copy_from_slice(&record[..20]);

            let ip = Ipv4Addr::new(record[20], record[21], record[22], record[23]);
            let port = u16::from_be_bytes([record[24], record[25]]);

            (id, SocketAddr::new(IpAddr::V4(ip), port))
        })
        .collect())
}

/// Encodes `(id, address)` pairs into the compact node form. Only IPv4
/// addresses can be represented; others are skipped.
#[must_use]
pub fn encode_compact_nodes(nodes: &[([u8; 20], SocketAddr)]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(nodes.len() * COMPACT_NODE_LEN);

    for (id, address) in nodes {
        if let IpAddr::V4(ip) = address.ip() {
            bytes.extend_from_slice(id);
            bytes.extend_from_slice(&ip.octets());
            bytes.extend_from_slice(&address.port().to_be_bytes());
        }
    }

    bytes
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    use super::{decode_compact_nodes, decode_compact_peers, encode_compact_nodes, encode_compact_peers, CompactError};

    #[test]
    fn it_should_decode_a_compact_peer_record() {
        let peers = decode_compact_peers(&[0x0A, 0x00, 0x00, 0x01, 0x1A, 0xE1]).unwrap();

        assert_eq!(
            peers,
            vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 6881)]
        );
    }

    #[test]
    fn it_should_reject_a_peer_list_with_a_partial_record() {
        assert_eq!(
            decode_compact_peers(&[1, 2, 3, 4, 5]),
            Err(CompactError::BadPeerListLength { len: 5 })
        );
    }

    #[test]
    fn peers_should_round_trip_through_the_compact_form() {
        let peers = vec![
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 88)), 17548),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(2, 137, 87, 41)), 1754),
        ];

        assert_eq!(decode_compact_peers(&encode_compact_peers(&peers)).unwrap(), peers);
    }

    #[test]
    fn nodes_should_round_trip_through_the_compact_form() {
        let nodes = vec![
            ([1u8; 20], SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 6881)),
            ([2u8; 20], SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 6882)),
        ];

        let bytes = encode_compact_nodes(&nodes);
        assert_eq!(bytes.len(), 52);
        assert_eq!(decode_compact_nodes(&bytes).unwrap(), nodes);
    }

    #[test]
    fn an_empty_list_should_decode_to_no_peers() {
        assert!(decode_compact_peers(&[]).unwrap().is_empty());
    }
}

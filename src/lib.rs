//! Harbor: a `BitTorrent` swarm engine.
//!
//! Harbor ingests torrent metadata (a metainfo file or a magnet link),
//! discovers peers through trackers and a Kademlia DHT, exchanges pieces
//! with peers over the wire protocol, verifies and persists them to disk,
//! and serves them back to the swarm. Many torrents run concurrently under
//! global and per-swarm resource limits.
//!
//! The crate is a library with a thin binary around it. The domain layer
//! lives in [`core`]: the [`core::Engine`] is the control surface an
//! embedding layer talks to, and one task per swarm
//! ([`core::swarm`]) owns all of that swarm's mutable state. The
//! supporting services are:
//!
//! - [`protocol`]: the bit-exact wire formats (handshake, messages,
//!   extension protocol, compact records).
//! - [`peers`]: connection tasks and the per-swarm peer registry.
//! - [`trackers`]: HTTP and UDP announcing with multi-tracker failover.
//! - [`dht`]: the Kademlia node (BEP 5).
//! - [`throttle`]: token-bucket rate limiting with a global fair share.
//!
//! # Implemented BEPs
//!
//! - [BEP 3](https://www.bittorrent.org/beps/bep_0003.html): The `BitTorrent` Protocol
//! - [BEP 5](https://www.bittorrent.org/beps/bep_0005.html): DHT Protocol
//! - [BEP 9](https://www.bittorrent.org/beps/bep_0009.html): Extension for Peers to Send Metadata Files
//! - [BEP 10](https://www.bittorrent.org/beps/bep_0010.html): Extension Protocol
//! - [BEP 12](https://www.bittorrent.org/beps/bep_0012.html): Multitracker Metadata Extension
//! - [BEP 15](https://www.bittorrent.org/beps/bep_0015.html): UDP Tracker Protocol
//! - [BEP 23](https://www.bittorrent.org/beps/bep_0023.html): Tracker Returns Compact Peer Lists
use harbor_clock::clock;

pub mod app;
pub mod bootstrap;
pub mod core;
pub mod dht;
pub mod peers;
pub mod protocol;
pub mod throttle;
pub mod trackers;

/// This code needs to be copied into each crate.
/// Working version, for production.
#[cfg(not(test))]
#[allow(dead_code)]
pub(crate) type CurrentClock = clock::Working;

/// Stopped version, for testing.
#[cfg(test)]
#[allow(dead_code)]
pub(crate) type CurrentClock = clock::Stopped;

//! Primitive types for the [Harbor](https://docs.rs/harbor) BitTorrent engine.
//!
//! This crate contains the basic data structures shared by the Harbor
//! packages: the torrent identity ([`info_hash::InfoHash`]), the peer
//! identity ([`peer::Id`]) and the announce event sent to trackers
//! ([`announce_event::AnnounceEvent`]).
use std::time::Duration;

pub mod announce_event;
pub mod info_hash;
pub mod peer;

/// A `std::time::Duration` since the Unix epoch (a timestamp).
///
/// Keeping timestamps as durations lets the clock be swapped for a stopped
/// one in tests without touching the types that store them.
pub type DurationSinceUnixEpoch = Duration;

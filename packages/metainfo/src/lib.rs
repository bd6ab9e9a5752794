//! Torrent metainfo for the [Harbor](https://docs.rs/harbor) engine.
//!
//! A metainfo (`.torrent`) file is a bencoded dictionary describing a
//! torrent: where to announce, how the content is split into pieces, and the
//! file layout. This crate parses those documents into an immutable
//! [`Metainfo`] and computes the torrent identity: the SHA-1 of the canonical
//! re-encoding of the `info` sub-dictionary.
//!
//! It also parses and synthesizes [`magnet::Magnet`] links, which identify a
//! swarm by its info-hash alone; for those the full `info` dictionary is
//! later fetched from peers (BEP 9) and handed to
//! [`Metainfo::from_info_bytes`].
pub mod error;
pub mod magnet;
pub mod metainfo;

pub use error::Error;
pub use metainfo::{FileMode, Metainfo, TorrentFile};

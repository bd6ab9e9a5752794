//! The extension protocol (BEP 10) and metadata transfer (BEP 9).
//!
//! Extended messages ride inside wire message type 20. Sub-id 0 is the
//! extended handshake, a bencoded dictionary whose `m` entry maps extension
//! names to the local ids the sending peer chose for them. The only
//! extension this client speaks is `ut_metadata`, which transfers the raw
//! `info` dictionary in 16384-byte chunks so a swarm started from a magnet
//! link can obtain its metainfo from peers.
use std::collections::BTreeMap;

use harbor_bencode::{decode, decode_prefix, encode, Value};
use thiserror::Error;

use crate::protocol::BLOCK_SIZE;

/// Sub-id of the extended handshake itself.
pub const HANDSHAKE_ID: u8 = 0;

/// The extension name of metadata transfer.
pub const UT_METADATA: &str = "ut_metadata";

/// The local id this client assigns to `ut_metadata` in its own handshake.
pub const LOCAL_UT_METADATA_ID: u8 = 1;

/// Metadata is chunked in pieces of this size; only the last chunk may be
/// shorter.
pub const METADATA_CHUNK_SIZE: usize = BLOCK_SIZE as usize;

const MSG_TYPE_REQUEST: i64 = 0;
const MSG_TYPE_DATA: i64 = 1;
const MSG_TYPE_REJECT: i64 = 2;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("extended payload is not valid bencode: {source}")]
    Bencode {
        #[from]
        source: harbor_bencode::Error,
    },

    #[error("extended payload is missing field `{field}`")]
    MissingField { field: &'static str },

    #[error("unknown metadata message type {msg_type}")]
    UnknownMetadataType { msg_type: i64 },
}

/// The extended handshake payload (sub-id 0).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExtendedHandshake {
    /// Extension name to the id the *sender* listens on.
    pub message_ids: BTreeMap<String, u8>,
    /// Total size of the metadata, advertised by peers that have it.
    pub metadata_size: Option<u64>,
}

impl ExtendedHandshake {
    /// The handshake this client sends: it listens for `ut_metadata` on
    /// [`LOCAL_UT_METADATA_ID`] and advertises the metadata size once known.
    #[must_use]
    pub fn ours(metadata_size: Option<u64>) -> Self {
        let mut message_ids = BTreeMap::new();
        message_ids.insert(UT_METADATA.to_owned(), LOCAL_UT_METADATA_ID);

        Self {
            message_ids,
            metadata_size,
        }
    }

    /// The id the remote peer assigned to `ut_metadata`, if it supports it.
    #[must_use]
    pub fn ut_metadata_id(&self) -> Option<u8> {
        self.message_ids.get(UT_METADATA).copied()
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let ids = self
            .message_ids
            .iter()
            .map(|(name, id)| (name.clone().into_bytes(), Value::Int(i64::from(*id))))
            .collect();

        let mut root = harbor_bencode::Dict::new();
        root.insert(b"m".to_vec(), Value::Dict(ids));
        if let Some(size) = self.metadata_size {
            #[allow(clippy::cast_possible_wrap)]
            root.insert(b"metadata_size".to_vec(), Value::Int(size as i64));
        }

        encode(&Value::Dict(root))
    }

    /// Parses a received extended handshake. Unknown extensions and keys are
    /// ignored; ids above 255 or below 1 are dropped (0 is reserved for the
    /// handshake itself).
    ///
    /// # Errors
    ///
    /// Will return an [`Error`] if the payload is not a bencoded dictionary.
    pub fn parse(payload: &[u8]) -> Result<Self, Error> {
        let document = decode(payload)?;
        let root = document.as_dict().ok_or(Error::MissingField { field: "m" })?;

        let mut message_ids = BTreeMap::new();
        if let Some(ids) = root.get(&b"m"[..]).and_then(Value::as_dict) {
            for (name, id) in ids {
                let Ok(name) = String::from_utf8(name.clone()) else {
                    continue;
                };
                if let Some(id) = id.as_int().and_then(|id| u8::try_from(id).ok()).filter(|id| *id != 0) {
                    message_ids.insert(name, id);
                }
            }
        }

        let metadata_size = root
            .get(&b"metadata_size"[..])
            .and_then(Value::as_int)
            .and_then(|size| u64::try_from(size).ok());

        Ok(Self {
            message_ids,
            metadata_size,
        })
    }
}

/// A metadata-transfer sub-message (BEP 9), carried under the id negotiated
/// in the extended handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataMessage {
    /// Ask for chunk `piece` of the metadata.
    Request { piece: u32 },
    /// Chunk `piece` of metadata totalling `total_size` bytes. The chunk
    /// bytes follow the bencoded header on the wire.
    Data {
        piece: u32,
        total_size: u64,
        payload: Vec<u8>,
    },
    /// The peer will not serve chunk `piece`.
    Reject { piece: u32 },
}

impl MetadataMessage {
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut header = harbor_bencode::Dict::new();

        match self {
            Self::Request { piece } => {
                header.insert(b"msg_type".to_vec(), Value::Int(MSG_TYPE_REQUEST));
                header.insert(b"piece".to_vec(), Value::Int(i64::from(*piece)));
                encode(&Value::Dict(header))
            }
            Self::Data {
                piece,
                total_size,
                payload,
            } => {
                header.insert(b"msg_type".to_vec(), Value::Int(MSG_TYPE_DATA));
                header.insert(b"piece".to_vec(), Value::Int(i64::from(*piece)));
                #[allow(clippy::cast_possible_wrap)]
                header.insert(b"total_size".to_vec(), Value::Int(*total_size as i64));

                let mut bytes = encode(&Value::Dict(header));
                bytes.extend_from_slice(payload);
                bytes
            }
            Self::Reject { piece } => {
                header.insert(b"msg_type".to_vec(), Value::Int(MSG_TYPE_REJECT));
                header.insert(b"piece".to_vec(), Value::Int(i64::from(*piece)));
                encode(&Value::Dict(header))
            }
        }
    }

    /// Parses a metadata sub-message. For `data` messages the raw chunk
    /// follows the bencoded header, so only a prefix of the payload is
    /// bencode.
    ///
    /// # Errors
    ///
    /// Will return an [`Error`] on malformed bencode, a missing `msg_type`
    /// or `piece`, or an unknown message type.
    pub fn parse(payload: &[u8]) -> Result<Self, Error> {
        let (header, header_len) = decode_prefix(payload)?;

        let msg_type = header
            .dict_get(b"msg_type")
            .and_then(Value::as_int)
            .ok_or(Error::MissingField { field: "msg_type" })?;

        let piece = header
            .dict_get(b"piece")
            .and_then(Value::as_int)
            .and_then(|piece| u32::try_from(piece).ok())
            .ok_or(Error::MissingField { field: "piece" })?;

        match msg_type {
            MSG_TYPE_REQUEST => Ok(Self::Request { piece }),
            MSG_TYPE_DATA => {
                let total_size = header
                    .dict_get(b"total_size")
                    .and_then(Value::as_int)
                    .and_then(|size| u64::try_from(size).ok())
                    .ok_or(Error::MissingField { field: "total_size" })?;

                Ok(Self::Data {
                    piece,
                    total_size,
                    payload: payload[header_len..].to_vec(),
                })
            }
            MSG_TYPE_REJECT => Ok(Self::Reject { piece }),
            other => Err(Error::UnknownMetadataType { msg_type: other }),
        }
    }
}

/// Number of chunks a metadata document of `total_size` bytes is split into.
#[must_use]
pub fn metadata_chunk_count(total_size: u64) -> u32 {
    #[allow(clippy::cast_possible_truncation)]
    let count = total_size.div_ceil(METADATA_CHUNK_SIZE as u64) as u32;
    count.max(1)
}

#[cfg(test)]
mod tests {
    use super::{metadata_chunk_count, Error, ExtendedHandshake, MetadataMessage};

    #[test]
    fn our_extended_handshake_should_advertise_ut_metadata() {
        let handshake = ExtendedHandshake::ours(Some(30_000));

        let bytes = handshake.to_bytes();
        assert_eq!(bytes, b"d1:md11:ut_metadatai1ee13:metadata_sizei30000ee");

        let parsed = ExtendedHandshake::parse(&bytes).unwrap();
        assert_eq!(parsed.ut_metadata_id(), Some(1));
        assert_eq!(parsed.metadata_size, Some(30_000));
    }

    #[test]
    fn a_handshake_without_ut_metadata_should_parse_with_no_id() {
        let parsed = ExtendedHandshake::parse(b"d1:md8:ut_holepi3eee").unwrap();

        assert_eq!(parsed.ut_metadata_id(), None);
        assert_eq!(parsed.metadata_size, None);
    }

    #[test]
    fn an_id_of_zero_should_be_dropped() {
        let parsed = ExtendedHandshake::parse(b"d1:md11:ut_metadatai0eee").unwrap();

        assert_eq!(parsed.ut_metadata_id(), None);
    }

    #[test]
    fn metadata_request_and_reject_should_round_trip() {
        for message in [MetadataMessage::Request { piece: 2 }, MetadataMessage::Reject { piece: 2 }] {
            assert_eq!(MetadataMessage::parse(&message.to_bytes()).unwrap(), message);
        }
    }

    #[test]
    fn a_data_message_should_carry_the_raw_chunk_after_the_header() {
        let message = MetadataMessage::Data {
            piece: 0,
            total_size: 5,
            payload: vec![0xDE, 0xAD, 0xBE, 0xEF, 0x00],
        };

        let bytes = message.to_bytes();
        assert!(bytes.starts_with(b"d8:msg_typei1e5:piecei0e10:total_sizei5ee"));

        assert_eq!(MetadataMessage::parse(&bytes).unwrap(), message);
    }

    #[test]
    fn an_unknown_metadata_type_should_be_rejected() {
        assert!(matches!(
            MetadataMessage::parse(b"d8:msg_typei9e5:piecei0ee"),
            Err(Error::UnknownMetadataType { msg_type: 9 })
        ));
    }

    #[test]
    fn chunk_count_should_round_up_and_never_be_zero() {
        assert_eq!(metadata_chunk_count(1), 1);
        assert_eq!(metadata_chunk_count(16_384), 1);
        assert_eq!(metadata_chunk_count(16_385), 2);
        assert_eq!(metadata_chunk_count(0), 1);
    }
}

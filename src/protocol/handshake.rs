//! The 68-byte handshake that opens every peer connection (BEP 3).
//!
//! Layout: a 1-byte length prefix (19), the ASCII label
//! `BitTorrent protocol`, 8 reserved bytes, the 20-byte info-hash and the
//! 20-byte peer id. Bit 0x10 of reserved byte 5 advertises support for the
//! extension protocol (BEP 10).
use harbor_primitives::info_hash::InfoHash;
use harbor_primitives::peer;
use thiserror::Error;

pub const HANDSHAKE_LEN: usize = 68;

const LABEL: &[u8; 19] = b"BitTorrent protocol";
const LABEL_LEN: u8 = 19;

/// Reserved byte 5, bit 0x10: the extension protocol.
const EXTENSION_PROTOCOL_BYTE: usize = 5;
const EXTENSION_PROTOCOL_BIT: u8 = 0x10;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("handshake is {len} bytes, expected {HANDSHAKE_LEN}")]
    BadLength { len: usize },

    #[error("handshake does not carry the BitTorrent protocol label")]
    LabelMismatch,
}

/// A decoded handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: InfoHash,
    pub peer_id: peer::Id,
    pub reserved: [u8; 8],
}

impl Handshake {
    /// A handshake for this client: extension protocol advertised.
    #[must_use]
    pub fn new(info_hash: InfoHash, peer_id: peer::Id) -> Self {
        let mut reserved = [0u8; 8];
        reserved[EXTENSION_PROTOCOL_BYTE] |= EXTENSION_PROTOCOL_BIT;

        Self {
            info_hash,
            peer_id,
            reserved,
        }
    }

    #[must_use]
    pub fn supports_extension_protocol(&self) -> bool {
        self.reserved[EXTENSION_PROTOCOL_BYTE] & EXTENSION_PROTOCOL_BIT != 0
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; HANDSHAKE_LEN] {
        let mut bytes = [0u8; HANDSHAKE_LEN];

        bytes[0] = LABEL_LEN;
        bytes[1..20].copy_from_slice(LABEL);
        bytes[20..28].copy_from_slice(&self.reserved);
        bytes[28..48].copy_from_slice(&self.info_hash.bytes());
        bytes[48..68].copy_from_slice(&self.peer_id.bytes());

        bytes
    }

    /// Decodes a received handshake.
    ///
    /// The identity carried in the handshake is NOT checked here: inbound
    /// connections use it to find the swarm, outbound connections compare it
    /// against the expected identity and abort on mismatch.
    ///
    /// # Errors
    ///
    /// Will return an [`Error`] if the input is not 68 bytes or the protocol
    /// label does not match.
    pub fn parse(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() != HANDSHAKE_LEN {
            return Err(Error::BadLength { len: bytes.len() });
        }

        if bytes[0] != LABEL_LEN || &bytes[1..20] != LABEL {
            return Err(Error::LabelMismatch);
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&bytes[20..28]);

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&bytes[28..48]);

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&bytes[48..68]);

        Ok(Self {
            info_hash: InfoHash(info_hash),
            peer_id: peer::Id(peer_id),
            reserved,
        })
    }
}

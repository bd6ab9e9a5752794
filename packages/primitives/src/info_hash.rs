use std::panic::Location;

use thiserror::Error;

/// `BitTorrent` Info Hash v1: the SHA-1 of the canonical re-encoding of the
/// metainfo `info` dictionary. It is the primary key of a swarm.
#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug, PartialOrd, Ord, Default)]
pub struct InfoHash(pub [u8; 20]);

pub const INFO_HASH_BYTES_LEN: usize = 20;

impl InfoHash {
    /// Returns the internal byte array.
    #[must_use]
    pub fn bytes(&self) -> [u8; 20] {
        self.0
    }

    /// Returns the `InfoHash` as a lowercase hex string.
    #[must_use]
    pub fn to_hex_string(&self) -> String {
        self.to_string()
    }
}

impl std::fmt::Display for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut chars = [0u8; 40];
        binascii::bin2hex(&self.0, &mut chars).expect("output buffer has the exact size");
        write!(f, "{}", std::str::from_utf8(&chars).expect("hex digits are ASCII"))
    }
}

impl std::str::FromStr for InfoHash {
    type Err = binascii::ConvertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 40 {
            return Err(binascii::ConvertError::InvalidInputLength);
        }
        let mut hash = Self::default();
        binascii::hex2bin(s.as_bytes(), &mut hash.0)?;
        Ok(hash)
    }
}

impl From<[u8; 20]> for InfoHash {
    fn from(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }
}

/// Errors that can occur when converting from a `Vec<u8>` to an `InfoHash`.
#[derive(Error, Debug)]
pub enum ConversionError {
    /// Not enough bytes for an infohash. An infohash is 20 bytes.
    #[error("not enough bytes for infohash: {message} {location}")]
    NotEnoughBytes {
        location: &'static Location<'static>,
        message: String,
    },
    /// Too many bytes for an infohash. An infohash is 20 bytes.
    #[error("too many bytes for infohash: {message} {location}")]
    TooManyBytes {
        location: &'static Location<'static>,
        message: String,
    },
}

impl TryFrom<Vec<u8>> for InfoHash {
    type Error = ConversionError;

    fn try_from(bytes: Vec<u8>) -> Result<Self, Self::Error> {
        if bytes.len() < INFO_HASH_BYTES_LEN {
            return Err(ConversionError::NotEnoughBytes {
                location: Location::caller(),
                message: format! {"got {} bytes, expected {}", bytes.len(), INFO_HASH_BYTES_LEN},
            });
        }
        if bytes.len() > INFO_HASH_BYTES_LEN {
            return Err(ConversionError::TooManyBytes {
                location: Location::caller(),
                message: format! {"got {} bytes, expected {}", bytes.len(), INFO_HASH_BYTES_LEN},
            });
        }
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&bytes);
        Ok(Self(hash))
    }
}

impl serde::ser::Serialize for InfoHash {
    fn serialize<S: serde::ser::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex_string())
    }
}

impl<'de> serde::de::Deserialize<'de> for InfoHash {
    fn deserialize<D: serde::de::Deserializer<'de>>(des: D) -> Result<Self, D::Error> {
        des.deserialize_str(InfoHashVisitor)
    }
}

struct InfoHashVisitor;

impl serde::de::Visitor<'_> for InfoHashVisitor {
    type Value = InfoHash;

    fn expecting(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "a 40 character long hash")
    }

    fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
        v.parse().map_err(|_| {
            serde::de::Error::invalid_value(serde::de::Unexpected::Str(v), &"a 40 character long hexadecimal string")
        })
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::InfoHash;

    #[test]
    fn it_should_display_as_lowercase_hex() {
        let hash = InfoHash([0xFF; 20]);

        assert_eq!(hash.to_string(), "ff".repeat(20));
    }

    #[test]
    fn it_should_parse_from_a_40_character_hex_string() {
        let hash = InfoHash::from_str("3b245504cf5f11bbdbe1201cea6a6bf45aee1bc0").unwrap();

        assert_eq!(hash.0[0], 0x3b);
        assert_eq!(hash.0[19], 0xc0);
    }

    #[test]
    fn it_should_reject_strings_that_are_not_40_characters_long() {
        assert!(InfoHash::from_str("deadbeef").is_err());
    }

    #[test]
    fn it_should_convert_from_an_exactly_20_byte_vector() {
        let hash = InfoHash::try_from(vec![7u8; 20]).unwrap();

        assert_eq!(hash.bytes(), [7u8; 20]);
        assert!(InfoHash::try_from(vec![7u8; 19]).is_err());
        assert!(InfoHash::try_from(vec![7u8; 21]).is_err());
    }

    #[test]
    fn it_should_round_trip_through_serde_as_a_hex_string() {
        let hash = InfoHash::from_str("3b245504cf5f11bbdbe1201cea6a6bf45aee1bc0").unwrap();

        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, "\"3b245504cf5f11bbdbe1201cea6a6bf45aee1bc0\"");

        let back: InfoHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
    }
}

//! The peer identity used on the wire and in tracker announces.
use std::panic::Location;

use thiserror::Error;

/// The prefix of peer ids generated by this client, in the Azureus style:
/// a dash, a two-letter client code, a four-digit version, a dash.
pub const ID_PREFIX: &[u8; 8] = b"-HB0100-";

/// A peer id: 20 bytes chosen by the peer itself and sent in the handshake
/// and in tracker announces. Unlike an [`InfoHash`](crate::info_hash::InfoHash)
/// it carries no integrity meaning; it only has to be unique per session.
#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug)]
pub struct Id(pub [u8; 20]);

impl Id {
    /// Generates a fresh id: the [`ID_PREFIX`] followed by 12 random digits.
    #[must_use]
    pub fn generate() -> Self {
        use rand::Rng;

        let mut bytes = [0u8; 20];
        bytes[..8].copy_from_slice(ID_PREFIX);

        let mut rng = rand::thread_rng();
        for byte in &mut bytes[8..] {
            *byte = rng.gen_range(b'0'..=b'9');
        }

        Self(bytes)
    }

    /// Returns the internal byte array.
    #[must_use]
    pub fn bytes(&self) -> [u8; 20] {
        self.0
    }

    /// Returns the id as a hex string.
    #[must_use]
    pub fn to_hex_string(&self) -> String {
        let mut chars = [0u8; 40];
        binascii::bin2hex(&self.0, &mut chars).expect("output buffer has the exact size");
        std::str::from_utf8(&chars).expect("hex digits are ASCII").to_owned()
    }
}

/// Most real-world peer ids are printable ASCII (the Azureus convention), so
/// display them as text when they are and fall back to hex when they are not.
impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.iter().all(|byte| byte.is_ascii_graphic()) {
            write!(f, "{}", std::str::from_utf8(&self.0).expect("graphic ASCII is UTF-8"))
        } else {
            write!(f, "0x{}", self.to_hex_string())
        }
    }
}

/// Errors that can occur when converting from a `Vec<u8>` to a peer [`Id`].
#[derive(Error, Debug)]
pub enum IdConversionError {
    #[error("not enough bytes for peer id: {message} {location}")]
    NotEnoughBytes {
        location: &'static Location<'static>,
        message: String,
    },
    #[error("too many bytes for peer id: {message} {location}")]
    TooManyBytes {
        location: &'static Location<'static>,
        message: String,
    },
}

impl TryFrom<Vec<u8>> for Id {
    type Error = IdConversionError;

    fn try_from(bytes: Vec<u8>) -> Result<Self, Self::Error> {
        if bytes.len() < 20 {
            return Err(IdConversionError::NotEnoughBytes {
                location: Location::caller(),
                message: format! {"got {} bytes, expected 20", bytes.len()},
            });
        }
        if bytes.len() > 20 {
            return Err(IdConversionError::TooManyBytes {
                location: Location::caller(),
                message: format! {"got {} bytes, expected 20", bytes.len()},
            });
        }
        let mut id = [0u8; 20];
        id.copy_from_slice(&bytes);
        Ok(Self(id))
    }
}

impl From<[u8; 20]> for Id {
    fn from(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }
}

impl serde::ser::Serialize for Id {
    fn serialize<S: serde::ser::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

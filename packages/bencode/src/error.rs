use thiserror::Error;

/// Errors raised while decoding a bencode document.
///
/// `pos` is the byte offset in the input at which the offending token starts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("unexpected end of input at byte {pos}")]
    UnexpectedEof { pos: usize },

    #[error("byte {byte:#04x} at {pos} does not start a bencode value")]
    InvalidByte { byte: u8, pos: usize },

    #[error("integer at {pos} has no closing delimiter")]
    UnterminatedInt { pos: usize },

    #[error("integer at {pos} is not valid decimal")]
    InvalidInt { pos: usize },

    #[error("integer at {pos} has a leading zero")]
    LeadingZero { pos: usize },

    #[error("negative zero at {pos} is not a valid integer")]
    NegativeZero { pos: usize },

    #[error("byte string at {pos} declares a negative length")]
    NegativeLength { pos: usize },

    #[error("byte string at {pos} runs past the end of the input")]
    LengthOverflow { pos: usize },

    #[error("dictionary key at {pos} is not in lexicographic order")]
    UnsortedKey { pos: usize },

    #[error("dictionary key at {pos} is a duplicate")]
    DuplicateKey { pos: usize },

    #[error("nesting deeper than {max} levels at {pos}")]
    DepthExceeded { pos: usize, max: usize },

    #[error("{remaining} trailing byte(s) after the value ending at {pos}")]
    TrailingBytes { pos: usize, remaining: usize },
}

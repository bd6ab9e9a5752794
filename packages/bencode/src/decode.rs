//! Recursive-descent bencode decoder.
use std::collections::btree_map::Entry;

use crate::error::Error;
use crate::value::{Dict, Value};

/// Dictionaries and lists nested deeper than this are rejected. Real torrent
/// and KRPC documents are at most a handful of levels deep.
const MAX_DEPTH: usize = 32;

const INT_START: u8 = b'i';
const LIST_START: u8 = b'l';
const DICT_START: u8 = b'd';
const END: u8 = b'e';
const LENGTH_DELIMITER: u8 = b':';

/// Decodes a complete bencode document.
///
/// The whole input must be consumed: a valid value followed by residual bytes
/// is an error, since it usually means a truncated write or a framing bug
/// upstream.
///
/// # Errors
///
/// Returns a positioned [`Error`] describing the first violation found.
pub fn decode(bytes: &[u8]) -> Result<Value, Error> {
    let (value, next_pos) = decode_value(bytes, 0, 0)?;

    if next_pos != bytes.len() {
        return Err(Error::TrailingBytes {
            pos: next_pos,
            remaining: bytes.len() - next_pos,
        });
    }

    Ok(value)
}

/// Decodes one value from the front of the input, returning it together with
/// the number of bytes consumed.
///
/// Some `BitTorrent` messages (the metadata extension's `data` message) are a
/// bencoded header followed by a raw payload; this is the entry point for
/// those. For whole documents use [`decode`], which also rejects trailing
/// bytes.
///
/// # Errors
///
/// Returns a positioned [`Error`] describing the first violation found.
pub fn decode_prefix(bytes: &[u8]) -> Result<(Value, usize), Error> {
    decode_value(bytes, 0, 0)
}

fn decode_value(bytes: &[u8], pos: usize, depth: usize) -> Result<(Value, usize), Error> {
    if depth >= MAX_DEPTH {
        return Err(Error::DepthExceeded { pos, max: MAX_DEPTH });
    }

    match peek(bytes, pos)? {
        INT_START => {
            let (n, next_pos) = decode_int(bytes, pos + 1, END)?;
            Ok((Value::Int(n), next_pos))
        }
        LIST_START => decode_list(bytes, pos + 1, depth),
        DICT_START => decode_dict(bytes, pos + 1, depth),
        b'0'..=b'9' => {
            let (slice, next_pos) = decode_bytes(bytes, pos)?;
            Ok((Value::Bytes(slice.to_vec()), next_pos))
        }
        byte => Err(Error::InvalidByte { byte, pos }),
    }
}

fn decode_int(bytes: &[u8], pos: usize, delimiter: u8) -> Result<(i64, usize), Error> {
    let digits_end = bytes[pos..]
        .iter()
        .position(|byte| *byte == delimiter)
        .ok_or(Error::UnterminatedInt { pos })?;
    let digits = &bytes[pos..pos + digits_end];

    if digits.len() > 1 {
        // "-0" would survive str::parse, so it is rejected explicitly.
        if digits[0] == b'-' && digits[1] == b'0' {
            return Err(Error::NegativeZero { pos });
        }
        if digits[0] == b'0' {
            return Err(Error::LeadingZero { pos });
        }
    }

    let text = std::str::from_utf8(digits).map_err(|_| Error::InvalidInt { pos })?;
    let n = text.parse::<i64>().map_err(|_| Error::InvalidInt { pos })?;

    Ok((n, pos + digits_end + 1))
}

fn decode_bytes(bytes: &[u8], pos: usize) -> Result<(&[u8], usize), Error> {
    let (declared_len, start) = decode_int(bytes, pos, LENGTH_DELIMITER)?;

    if declared_len < 0 {
        return Err(Error::NegativeLength { pos });
    }

    let len = usize::try_from(declared_len).map_err(|_| Error::LengthOverflow { pos })?;

    if len > bytes.len() - start {
        return Err(Error::LengthOverflow { pos });
    }

    Ok((&bytes[start..start + len], start + len))
}

fn decode_list(bytes: &[u8], pos: usize, depth: usize) -> Result<(Value, usize), Error> {
    let mut items = Vec::new();
    let mut pos = pos;

    while peek(bytes, pos)? != END {
        let (item, next_pos) = decode_value(bytes, pos, depth + 1)?;
        items.push(item);
        pos = next_pos;
    }

    Ok((Value::List(items), pos + 1))
}

fn decode_dict(bytes: &[u8], pos: usize, depth: usize) -> Result<(Value, usize), Error> {
    let mut entries = Dict::new();
    let mut pos = pos;

    while peek(bytes, pos)? != END {
        let key_pos = pos;
        let (key, value_pos) = decode_bytes(bytes, pos)?;

        if let Some((last_key, _)) = entries.last_key_value() {
            if key < last_key.as_slice() {
                return Err(Error::UnsortedKey { pos: key_pos });
            }
        }

        let (value, next_pos) = decode_value(bytes, value_pos, depth + 1)?;

        match entries.entry(key.to_vec()) {
            Entry::Vacant(slot) => {
                slot.insert(value);
            }
            Entry::Occupied(_) => return Err(Error::DuplicateKey { pos: key_pos }),
        }

        pos = next_pos;
    }

    Ok((Value::Dict(entries), pos + 1))
}

fn peek(bytes: &[u8], pos: usize) -> Result<u8, Error> {
    bytes.get(pos).copied().ok_or(Error::UnexpectedEof { pos })
}

#[cfg(test)]
mod tests {
    use crate::decode::decode;
    use crate::error::Error;
    use crate::value::Value;

    #[test]
    fn it_should_decode_each_variant() {
        assert_eq!(decode(b"i42e").unwrap(), Value::Int(42));
        assert_eq!(decode(b"i-7e").unwrap(), Value::Int(-7));
        assert_eq!(decode(b"3:abc").unwrap(), Value::bytes(b"abc"));
        assert_eq!(
            decode(b"l1:ai1ee").unwrap(),
            Value::List(vec![Value::bytes(b"a"), Value::Int(1)])
        );
        assert_eq!(
            decode(b"d1:ai1ee").unwrap(),
            Value::dict_from([(&b"a"[..], Value::Int(1))])
        );
    }

    #[test]
    fn it_should_decode_byte_strings_with_arbitrary_bytes() {
        let input = [b'3', b':', 0x00, 0xFF, 0x7F];

        assert_eq!(decode(&input).unwrap(), Value::Bytes(vec![0x00, 0xFF, 0x7F]));
    }

    #[test]
    fn it_should_reject_integers_with_leading_zeros() {
        assert_eq!(decode(b"i042e"), Err(Error::LeadingZero { pos: 1 }));
    }

    #[test]
    fn it_should_reject_negative_zero() {
        assert_eq!(decode(b"i-0e"), Err(Error::NegativeZero { pos: 1 }));
    }

    #[test]
    fn it_should_accept_plain_zero() {
        assert_eq!(decode(b"i0e").unwrap(), Value::Int(0));
    }

    #[test]
    fn it_should_reject_byte_strings_longer_than_the_input() {
        assert_eq!(decode(b"10:abc"), Err(Error::LengthOverflow { pos: 0 }));
    }

    #[test]
    fn it_should_reject_unsorted_dictionary_keys() {
        assert_eq!(decode(b"d1:bi1e1:ai2ee"), Err(Error::UnsortedKey { pos: 7 }));
    }

    #[test]
    fn it_should_reject_duplicate_dictionary_keys() {
        assert_eq!(decode(b"d1:ai1e1:ai2ee"), Err(Error::DuplicateKey { pos: 7 }));
    }

    #[test]
    fn it_should_reject_truncated_documents() {
        assert!(matches!(decode(b"l1:a"), Err(Error::UnexpectedEof { .. })));
        assert!(matches!(decode(b"i42"), Err(Error::UnterminatedInt { .. })));
    }

    #[test]
    fn it_should_reject_runaway_nesting() {
        let mut input = vec![b'l'; 64];
        input.extend(vec![b'e'; 64]);

        assert!(matches!(decode(&input), Err(Error::DepthExceeded { .. })));
    }

    #[test]
    fn it_should_reject_an_empty_input() {
        assert_eq!(decode(b""), Err(Error::UnexpectedEof { pos: 0 }));
    }

    #[test]
    fn decode_prefix_should_report_the_consumed_length_and_allow_trailing_bytes() {
        let (value, consumed) = crate::decode::decode_prefix(b"d1:xi1eeRAW PAYLOAD").unwrap();

        assert_eq!(consumed, 8);
        assert_eq!(value.dict_get(b"x").unwrap().as_int(), Some(1));
    }
}

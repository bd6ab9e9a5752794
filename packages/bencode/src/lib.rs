//! A strict bencode codec for the [Harbor](https://docs.rs/harbor) engine.
//!
//! Bencode is the tagged encoding used by `BitTorrent` for metainfo files,
//! HTTP tracker responses and DHT (KRPC) messages. It has four variants:
//!
//! - Integers: `i42e`, decimal ASCII between `i` and `e`.
//! - Byte strings: `4:spam`, a decimal length, a colon and that many raw bytes.
//! - Lists: `l...e`, a concatenation of values.
//! - Dictionaries: `d...e`, key-value pairs where keys are byte strings and
//!   MUST appear in lexicographic byte order.
//!
//! The codec is strict in both directions:
//!
//! - [`decode`] rejects leading zeros, `-0`, out-of-order or duplicate
//!   dictionary keys, unbounded nesting and trailing bytes after the value.
//! - [`encode`] always emits dictionary keys in lexicographic byte order, so
//!   `encode(decode(bytes)) == bytes` holds for any input produced by a
//!   conformant encoder. That canonical form is what makes info-hashes stable.
//!
//! Byte strings are kept as raw byte containers. They are never transcoded;
//! callers decide whether a given string is UTF-8 (a torrent name) or binary
//! (a piece hash).
//!
//! ```rust
//! use harbor_bencode::{decode, encode, Value};
//!
//! let input = b"d3:bar4:spam3:fooi42ee".to_vec();
//! let value = decode(&input).unwrap();
//!
//! assert_eq!(value.dict_get(b"foo").unwrap().as_int(), Some(42));
//! assert_eq!(encode(&value), input);
//! ```
pub mod decode;
pub mod encode;
pub mod error;
pub mod value;

pub use decode::{decode, decode_prefix};
pub use encode::encode;
pub use error::Error;
pub use value::{Dict, Value};

#[cfg(test)]
mod tests {
    use crate::{decode, encode, Value};

    #[test]
    fn it_should_round_trip_any_conformant_encoding() {
        let inputs: Vec<&[u8]> = vec![
            b"i0e",
            b"i-17e",
            b"0:",
            b"4:spam",
            b"le",
            b"de",
            b"l4:spami42ee",
            b"d3:cow3:moo4:spam4:eggse",
            b"d4:infod6:lengthi10e4:name1:x12:piece lengthi16384e6:pieces20:\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0ee",
        ];

        for input in inputs {
            let value = decode(input).unwrap();
            assert_eq!(encode(&value), input, "round trip failed for {input:?}");
        }
    }

    #[test]
    fn it_should_expose_typed_accessors_over_a_decoded_document() {
        let value = decode(b"d8:announce9:http://t/4:infod4:name1:xee").unwrap();

        let announce = value.dict_get(b"announce").unwrap();
        assert_eq!(announce.as_str(), Some("http://t/"));

        let info = value.dict_get(b"info").unwrap();
        let name = info.dict_get(b"name").unwrap();
        assert_eq!(name.as_bytes(), Some(&b"x"[..]));
    }

    #[test]
    fn it_should_reject_trailing_bytes_after_a_complete_value() {
        assert!(matches!(
            decode(b"i42etrailing"),
            Err(crate::Error::TrailingBytes { .. })
        ));
    }

    #[test]
    fn it_should_build_documents_programmatically() {
        let value = Value::dict_from([
            (&b"left"[..], Value::Int(0)),
            (&b"event"[..], Value::bytes(b"started")),
        ]);

        assert_eq!(encode(&value), b"d5:event7:started4:lefti0ee");
    }
}

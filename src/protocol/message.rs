//! Length-prefixed peer wire messages (BEP 3) and their framing codec.
//!
//! Every message after the handshake is a big-endian 32-bit length prefix
//! followed by a 1-byte type tag and a typed payload. A length of zero is a
//! keep-alive. The [`MessageCodec`] plugs into `tokio_util`'s `Framed` so a
//! connection is just a stream/sink of [`Message`]s.
use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Frames larger than this (length prefix included) are a protocol
/// violation: the largest legitimate frame is a `piece` carrying one 16 KiB
/// block, plus generous room for bitfields of very large torrents.
pub const MAX_FRAME_LEN: usize = 131_072;

const HEADER_LEN: usize = 4;

const CHOKE: u8 = 0;
const UNCHOKE: u8 = 1;
const INTERESTED: u8 = 2;
const NOT_INTERESTED: u8 = 3;
const HAVE: u8 = 4;
const BITFIELD: u8 = 5;
const REQUEST: u8 = 6;
const PIECE: u8 = 7;
const CANCEL: u8 = 8;
const PORT: u8 = 9;
const EXTENDED: u8 = 20;

/// Identifies one block within a torrent: the piece index, the byte offset
/// within the piece and the block length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockInfo {
    pub piece_index: u32,
    pub offset: u32,
    pub length: u32,
}

/// A peer wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request(BlockInfo),
    Piece {
        piece_index: u32,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel(BlockInfo),
    Port(u16),
    Extended {
        id: u8,
        payload: Vec<u8>,
    },
}

/// Errors raised by the framing codec. Any of them is fatal to the
/// connection.
#[derive(Error, Debug)]
pub enum Error {
    #[error("io error while framing: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    Oversize { len: usize },

    #[error("unknown message type {tag}")]
    UnknownType { tag: u8 },

    #[error("message type {tag} carries a malformed payload of {len} bytes")]
    BadPayloadLength { tag: u8, len: usize },
}

/// Encoder/decoder for the length-prefixed framing.
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageCodec;

impl Encoder<Message> for MessageCodec {
    type Error = Error;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match message {
            Message::KeepAlive => dst.put_u32(0),
            Message::Choke => put_header(dst, CHOKE, 0),
            Message::Unchoke => put_header(dst, UNCHOKE, 0),
            Message::Interested => put_header(dst, INTERESTED, 0),
            Message::NotInterested => put_header(dst, NOT_INTERESTED, 0),
            Message::Have(piece_index) => {
                put_header(dst, HAVE, 4);
                dst.put_u32(piece_index);
            }
            Message::Bitfield(bits) => {
                put_header(dst, BITFIELD, bits.len());
                dst.put_slice(&bits);
            }
            Message::Request(block) => {
                put_header(dst, REQUEST, 12);
                put_block_info(dst, block);
            }
            Message::Piece {
                piece_index,
                offset,
                data,
            } => {
                put_header(dst, PIECE, 8 + data.len());
                dst.put_u32(piece_index);
                dst.put_u32(offset);
                dst.put_slice(&data);
            }
            Message::Cancel(block) => {
                put_header(dst, CANCEL, 12);
                put_block_info(dst, block);
            }
            Message::Port(port) => {
                put_header(dst, PORT, 2);
                dst.put_u16(port);
            }
            Message::Extended { id, payload } => {
                put_header(dst, EXTENDED, 1 + payload.len());
                dst.put_u8(id);
                dst.put_slice(&payload);
            }
        }

        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[..HEADER_LEN]);
        let frame_len = u32::from_be_bytes(length_bytes) as usize;

        if HEADER_LEN + frame_len > MAX_FRAME_LEN {
            return Err(Error::Oversize {
                len: HEADER_LEN + frame_len,
            });
        }

        if src.len() < HEADER_LEN + frame_len {
            src.reserve(HEADER_LEN + frame_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let mut frame = src.split_to(frame_len);

        if frame.is_empty() {
            return Ok(Some(Message::KeepAlive));
        }

        let tag = frame.get_u8();
        let message = parse_payload(tag, &mut frame)?;

        Ok(Some(message))
    }
}

fn parse_payload(tag: u8, payload: &mut BytesMut) -> Result<Message, Error> {
    let expect = |len: usize, payload: &BytesMut| {
        if payload.len() == len {
            Ok(())
        } else {
            Err(Error::BadPayloadLength {
                tag,
                len: payload.len(),
            })
        }
    };

    match tag {
        CHOKE => {
            expect(0, payload)?;
            Ok(Message::Choke)
        }
        UNCHOKE => {
            expect(0, payload)?;
            Ok(Message::Unchoke)
        }
        INTERESTED => {
            expect(0, payload)?;
            Ok(Message::Interested)
        }
        NOT_INTERESTED => {
            expect(0, payload)?;
            Ok(Message::NotInterested)
        }
        HAVE => {
            expect(4, payload)?;
            Ok(Message::Have(payload.get_u32()))
        }
        BITFIELD => Ok(Message::Bitfield(payload.to_vec())),
        REQUEST => {
            expect(12, payload)?;
            Ok(Message::Request(get_block_info(payload)))
        }
        PIECE => {
            if payload.len() < 8 {
                return Err(Error::BadPayloadLength {
                    tag,
                    len: payload.len(),
                });
            }
            let piece_index = payload.get_u32();
            let offset = payload.get_u32();
            Ok(Message::Piece {
                piece_index,
                offset,
                data: payload.to_vec(),
            })
        }
        CANCEL => {
            expect(12, payload)?;
            Ok(Message::Cancel(get_block_info(payload)))
        }
        PORT => {
            expect(2, payload)?;
            Ok(Message::Port(payload.get_u16()))
        }
        EXTENDED => {
            if payload.is_empty() {
                return Err(Error::BadPayloadLength { tag, len: 0 });
            }
            let id = payload.get_u8();
            Ok(Message::Extended {
                id,
                payload: payload.to_vec(),
            })
        }
        _ => Err(Error::UnknownType { tag }),
    }
}

fn put_header(dst: &mut BytesMut, tag: u8, payload_len: usize) {
    #[allow(clippy::cast_possible_truncation)]
    dst.put_u32(1 + payload_len as u32);
    dst.put_u8(tag);
}

fn put_block_info(dst: &mut BytesMut, block: BlockInfo) {
    dst.put_u32(block.piece_index);
    dst.put_u32(block.offset);
    dst.put_u32(block.length);
}

fn get_block_info(payload: &mut BytesMut) -> BlockInfo {
    BlockInfo {
        piece_index: payload.get_u32(),
        offset: payload.get_u32(),
        length: payload.get_u32(),
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use tokio_util::codec::{Decoder, Encoder};

    use super::{BlockInfo, Error, Message, MessageCodec};

    fn round_trip(message: Message) -> Message {
        let mut codec = MessageCodec;
        let mut buffer = BytesMut::new();

        codec.encode(message, &mut buffer).unwrap();
        let decoded = codec.decode(&mut buffer).unwrap().unwrap();

        assert!(buffer.is_empty(), "the decoder should consume the whole frame");
        decoded
    }

    #[test]
    fn every_message_should_round_trip() {
        let block = BlockInfo {
            piece_index: 3,
            offset: 16_384,
            length: 16_384,
        };

        for message in [
            Message::KeepAlive,
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
            Message::Have(42),
            Message::Bitfield(vec![0b1010_0000, 0b0000_0001]),
            Message::Request(block),
            Message::Piece {
                piece_index: 3,
                offset: 16_384,
                data: vec![7u8; 1024],
            },
            Message::Cancel(block),
            Message::Port(6881),
            Message::Extended {
                id: 0,
                payload: b"d1:md11:ut_metadatai1eee".to_vec(),
            },
        ] {
            assert_eq!(round_trip(message.clone()), message);
        }
    }

    #[test]
    fn wire_bytes_should_match_the_specification() {
        let mut codec = MessageCodec;
        let mut buffer = BytesMut::new();

        codec.encode(Message::KeepAlive, &mut buffer).unwrap();
        assert_eq!(&buffer[..], &[0, 0, 0, 0]);

        buffer.clear();
        codec.encode(Message::Choke, &mut buffer).unwrap();
        assert_eq!(&buffer[..], &[0, 0, 0, 1, 0]);

        buffer.clear();
        codec.encode(Message::Have(1), &mut buffer).unwrap();
        assert_eq!(&buffer[..], &[0, 0, 0, 5, 4, 0, 0, 0, 1]);

        buffer.clear();
        codec
            .encode(
                Message::Request(BlockInfo {
                    piece_index: 1,
                    offset: 2,
                    length: 3,
                }),
                &mut buffer,
            )
            .unwrap();
        assert_eq!(
            &buffer[..],
            &[0, 0, 0, 13, 6, 0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0, 3]
        );
    }

    #[test]
    fn the_decoder_should_wait_for_a_complete_frame() {
        let mut codec = MessageCodec;
        let mut buffer = BytesMut::new();

        // Half a header.
        buffer.extend_from_slice(&[0, 0]);
        assert!(codec.decode(&mut buffer).unwrap().is_none());

        // A header promising 5 bytes, with only 2 delivered.
        buffer.clear();
        buffer.extend_from_slice(&[0, 0, 0, 5, 4, 0]);
        assert!(codec.decode(&mut buffer).unwrap().is_none());

        // The rest arrives.
        buffer.extend_from_slice(&[0, 0, 1]);
        assert_eq!(codec.decode(&mut buffer).unwrap(), Some(Message::Have(1)));
    }

    #[test]
    fn the_decoder_should_reject_oversize_frames_without_buffering_them() {
        let mut codec = MessageCodec;
        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(&u32::MAX.to_be_bytes());

        assert!(matches!(codec.decode(&mut buffer), Err(Error::Oversize { .. })));
    }

    #[test]
    fn the_decoder_should_reject_unknown_message_types() {
        let mut codec = MessageCodec;
        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(&[0, 0, 0, 1, 99]);

        assert!(matches!(
            codec.decode(&mut buffer),
            Err(Error::UnknownType { tag: 99 })
        ));
    }

    #[test]
    fn the_decoder_should_reject_malformed_payload_lengths() {
        let mut codec = MessageCodec;
        let mut buffer = BytesMut::new();
        // A `have` with a 3-byte payload.
        buffer.extend_from_slice(&[0, 0, 0, 4, 4, 0, 0, 1]);

        assert!(matches!(
            codec.decode(&mut buffer),
            Err(Error::BadPayloadLength { tag: 4, len: 3 })
        ));
    }

    #[test]
    fn back_to_back_frames_should_decode_one_at_a_time() {
        let mut codec = MessageCodec;
        let mut buffer = BytesMut::new();

        codec.encode(Message::Unchoke, &mut buffer).unwrap();
        codec.encode(Message::Interested, &mut buffer).unwrap();

        assert_eq!(codec.decode(&mut buffer).unwrap(), Some(Message::Unchoke));
        assert_eq!(codec.decode(&mut buffer).unwrap(), Some(Message::Interested));
        assert_eq!(codec.decode(&mut buffer).unwrap(), None);
    }
}

//! The per-piece block state machine.
//!
//! A piece is a fixed-size slab of the torrent's linear content with a
//! published SHA-1 hash. Peers transfer it in blocks of at most 16 KiB; this
//! module tracks which blocks have arrived, assembles them in order, and
//! verifies the result against the expected hash. Block buffers live in an
//! arena-style `Vec<Option<Vec<u8>>>` and are released once the piece
//! verifies, leaving only the assembled bytes (kept so replay requests and
//! the bitfield stay answerable until the piece is flushed to disk).
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::protocol::BLOCK_SIZE;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("piece {piece_index} has no block at offset {offset}")]
    UnknownBlockOffset { piece_index: u32, offset: u32 },

    #[error("block at offset {offset} of piece {piece_index} is {got} bytes, expected {expected}")]
    BlockLengthMismatch {
        piece_index: u32,
        offset: u32,
        expected: u32,
        got: usize,
    },

    #[error("piece {piece_index} cannot be verified before all blocks arrive")]
    Incomplete { piece_index: u32 },
}

/// A block that still has to be fetched: its offset within the piece and its
/// length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MissingBlock {
    pub offset: u32,
    pub length: u32,
}

#[derive(Debug)]
struct Block {
    offset: u32,
    length: u32,
    /// `Some` while received but unverified; drained into the assembled
    /// buffer on verification.
    data: Option<Vec<u8>>,
    received: bool,
}

/// One piece of the torrent and its acquisition state.
#[derive(Debug)]
pub struct Piece {
    index: u32,
    length: u32,
    expected_hash: [u8; 20],
    blocks: Vec<Block>,
    complete: bool,
    verified: bool,
    /// Present while complete; the concatenation of all blocks in offset
    /// order.
    assembled: Option<Vec<u8>>,
}

impl Piece {
    /// Lays out the blocks tiling `[0, length)`: all of [`BLOCK_SIZE`]
    /// except the last, which takes the remainder.
    ///
    /// # Panics
    ///
    /// Will panic if `length` is zero; the metainfo parser never produces an
    /// empty piece.
    #[must_use]
    pub fn new(index: u32, length: u32, expected_hash: [u8; 20]) -> Self {
        assert!(length > 0, "a piece cannot be empty");

        let mut blocks = Vec::with_capacity(length.div_ceil(BLOCK_SIZE) as usize);
        let mut offset = 0;

        while offset < length {
            let block_length = BLOCK_SIZE.min(length - offset);
            blocks.push(Block {
                offset,
                length: block_length,
                data: None,
                received: false,
            });
            offset += block_length;
        }

        Self {
            index,
            length,
            expected_hash,
            blocks,
            complete: false,
            verified: false,
            assembled: None,
        }
    }

    #[must_use]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[must_use]
    pub fn length(&self) -> u32 {
        self.length
    }

    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    #[must_use]
    pub fn is_verified(&self) -> bool {
        self.verified
    }

    /// The lowest-offset block that has not arrived yet.
    #[must_use]
    pub fn next_missing(&self) -> Option<MissingBlock> {
        self.blocks.iter().find(|block| !block.received).map(|block| MissingBlock {
            offset: block.offset,
            length: block.length,
        })
    }

    /// All blocks that have not arrived yet, in offset order.
    #[must_use]
    pub fn missing_blocks(&self) -> Vec<MissingBlock> {
        self.blocks
            .iter()
            .filter(|block| !block.received)
            .map(|block| MissingBlock {
                offset: block.offset,
                length: block.length,
            })
            .collect()
    }

    /// Records an arrived block.
    ///
    /// Re-receiving a block that already arrived is a no-op (duplicates are
    /// normal after a request is re-issued to another peer). A block at an
    /// unknown offset or with the wrong length is rejected without touching
    /// any state.
    ///
    /// # Errors
    ///
    /// Will return an [`Error`] for an unknown offset or a length mismatch.
    pub fn add_block(&mut self, offset: u32, data: Vec<u8>) -> Result<(), Error> {
        let piece_index = self.index;

        let block = self
            .blocks
            .iter_mut()
            .find(|block| block.offset == offset)
            .ok_or(Error::UnknownBlockOffset { piece_index, offset })?;

        if data.len() != block.length as usize {
            return Err(Error::BlockLengthMismatch {
                piece_index,
                offset,
                expected: block.length,
                got: data.len(),
            });
        }

        if !block.received {
            block.data = Some(data);
            block.received = true;
            self.complete = self.blocks.iter().all(|block| block.received);
        }

        Ok(())
    }

    /// Assembles the blocks in offset order and checks the SHA-1 against the
    /// expected hash. On success the block buffers are released and the
    /// assembled bytes retained.
    ///
    /// # Errors
    ///
    /// Will return [`Error::Incomplete`] when blocks are still missing.
    pub fn verify(&mut self) -> Result<bool, Error> {
        if !self.complete {
            return Err(Error::Incomplete { piece_index: self.index });
        }

        if self.verified {
            return Ok(true);
        }

        let mut assembled = Vec::with_capacity(self.length as usize);
        for block in &mut self.blocks {
            let data = block.data.take().expect("complete pieces have every block buffer");
            assembled.extend_from_slice(&data);
        }

        let mut hasher = Sha1::new();
        hasher.update(&assembled);
        let digest: [u8; 20] = hasher.finalize().into();

        if digest == self.expected_hash {
            self.verified = true;
            self.assembled = Some(assembled);
            Ok(true)
        } else {
            // Put nothing back: a failed piece is reset by the caller.
            Ok(false)
        }
    }

    /// The assembled bytes of a verified piece.
    #[must_use]
    pub fn assembled(&self) -> Option<&[u8]> {
        self.assembled.as_deref()
    }

    /// Takes the assembled bytes out, e.g. to hand them to the disk writer.
    pub fn take_assembled(&mut self) -> Option<Vec<u8>> {
        self.assembled.take()
    }

    /// Clears all blocks and flags, returning the piece to its initial
    /// state. Used after a verification failure.
    pub fn reset(&mut self) {
        for block in &mut self.blocks {
            block.data = None;
            block.received = false;
        }
        self.complete = false;
        self.verified = false;
        self.assembled = None;
    }
}

#[cfg(test)]
mod tests {
    use sha1::{Digest, Sha1};

    use super::{Error, Piece};
    use crate::protocol::BLOCK_SIZE;

    fn sha1(bytes: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(bytes);
        hasher.finalize().into()
    }

    #[test]
    fn blocks_should_tile_the_piece_exactly() {
        let piece = Piece::new(0, BLOCK_SIZE * 2 + 1, [0; 20]);

        assert_eq!(piece.block_count(), 3);
        let missing = piece.missing_blocks();
        assert_eq!(missing[0].offset, 0);
        assert_eq!(missing[0].length, BLOCK_SIZE);
        assert_eq!(missing[2].offset, BLOCK_SIZE * 2);
        assert_eq!(missing[2].length, 1);
    }

    #[test]
    fn a_piece_smaller_than_one_block_should_have_a_single_short_block() {
        let piece = Piece::new(0, 10, [0; 20]);

        assert_eq!(piece.block_count(), 1);
        assert_eq!(piece.next_missing().unwrap().length, 10);
    }

    #[test]
    fn it_should_verify_a_two_block_piece_and_detect_corruption() {
        // 16385 bytes of "A": one full block plus one byte.
        let content = vec![b'A'; BLOCK_SIZE as usize + 1];
        let mut piece = Piece::new(0, BLOCK_SIZE + 1, sha1(&content));

        piece.add_block(0, content[..BLOCK_SIZE as usize].to_vec()).unwrap();
        assert!(!piece.is_complete());

        piece.add_block(BLOCK_SIZE, content[BLOCK_SIZE as usize..].to_vec()).unwrap();
        assert!(piece.is_complete());

        assert!(piece.verify().unwrap());
        assert!(piece.is_verified());
        assert_eq!(piece.assembled(), Some(content.as_slice()));
    }

    #[test]
    fn a_flipped_byte_should_fail_verification() {
        let content = vec![b'A'; BLOCK_SIZE as usize + 1];
        let mut piece = Piece::new(0, BLOCK_SIZE + 1, sha1(&content));

        let mut corrupted = content[..BLOCK_SIZE as usize].to_vec();
        corrupted[0] ^= 0xFF;

        piece.add_block(0, corrupted).unwrap();
        piece.add_block(BLOCK_SIZE, content[BLOCK_SIZE as usize..].to_vec()).unwrap();

        assert!(!piece.verify().unwrap());
        assert!(!piece.is_verified());
    }

    #[test]
    fn reset_should_return_the_piece_to_its_initial_state() {
        let content = vec![b'A'; 100];
        let mut piece = Piece::new(0, 100, sha1(&content));

        piece.add_block(0, content).unwrap();
        piece.reset();

        assert!(!piece.is_complete());
        assert_eq!(piece.next_missing().unwrap().offset, 0);
    }

    #[test]
    fn it_should_reject_blocks_at_unknown_offsets() {
        let mut piece = Piece::new(7, 100, [0; 20]);

        assert_eq!(
            piece.add_block(50, vec![0; 50]),
            Err(Error::UnknownBlockOffset {
                piece_index: 7,
                offset: 50
            })
        );
    }

    #[test]
    fn it_should_reject_blocks_with_the_wrong_length_without_corrupting_state() {
        let mut piece = Piece::new(0, 100, [0; 20]);

        assert!(matches!(
            piece.add_block(0, vec![0; 99]),
            Err(Error::BlockLengthMismatch { expected: 100, got: 99, .. })
        ));

        assert!(!piece.is_complete());
        assert_eq!(piece.next_missing().unwrap().offset, 0);
    }

    #[test]
    fn re_receiving_a_block_should_be_idempotent() {
        let content = vec![b'B'; 100];
        let mut piece = Piece::new(0, 100, sha1(&content));

        piece.add_block(0, content.clone()).unwrap();
        piece.add_block(0, vec![b'C'; 100]).unwrap();

        // The first arrival wins.
        assert!(piece.verify().unwrap());
    }

    #[test]
    fn verifying_an_incomplete_piece_should_be_an_error() {
        let mut piece = Piece::new(0, 100, [0; 20]);

        assert!(matches!(piece.verify(), Err(Error::Incomplete { piece_index: 0 })));
    }
}

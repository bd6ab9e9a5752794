//! The parsed, immutable form of a torrent metainfo document.
use std::path::PathBuf;

use harbor_bencode::{decode, encode, Value};
use harbor_primitives::info_hash::InfoHash;
use sha1::{Digest, Sha1};

use crate::error::Error;

/// Whether the torrent was declared in single-file or multi-file form.
///
/// The forms differ on disk: a single-file torrent is stored as
/// `<root>/<name>`, a multi-file torrent as `<root>/<name>/<relative path>`,
/// even when the multi-file form contains exactly one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    SingleFile,
    MultiFile,
}

/// One file of the torrent content, with its offset in the linear byte space
/// formed by concatenating all files in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    /// Path components relative to the torrent directory.
    pub path: Vec<String>,
    pub length: u64,
    pub offset: u64,
}

impl TorrentFile {
    /// The path components joined into a relative path.
    #[must_use]
    pub fn relative_path(&self) -> PathBuf {
        self.path.iter().collect()
    }
}

/// A parsed metainfo document. Immutable after parse.
///
/// The canonical re-encoding of the `info` sub-dictionary is retained so that
/// the identity survives re-encoding even when the original document carried
/// info keys this parser does not model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metainfo {
    info_hash: InfoHash,
    info_bytes: Vec<u8>,
    name: String,
    piece_length: u64,
    pieces: Vec<[u8; 20]>,
    total_length: u64,
    files: Vec<TorrentFile>,
    mode: FileMode,
    announce: Option<String>,
    announce_list: Vec<Vec<String>>,
    private: bool,
}

impl Metainfo {
    /// Parses a whole metainfo document.
    ///
    /// # Errors
    ///
    /// Will return an [`Error`] if the document is not valid bencode, is
    /// missing a required field, declares piece hashes that are not a
    /// multiple of 20 bytes, has an empty file list or a non-positive file
    /// length.
    pub fn parse(bytes: &[u8]) -> Result<Self, Error> {
        let document = decode(bytes)?;
        let root = document.as_dict().ok_or(Error::NotADictionary)?;

        let info = root.get(&b"info"[..]).ok_or(Error::MissingField { field: "info" })?;

        let announce = match root.get(&b"announce"[..]) {
            Some(value) => Some(
                value
                    .as_str()
                    .ok_or(Error::InvalidField { field: "announce" })?
                    .to_owned(),
            ),
            None => None,
        };

        let announce_list = match root.get(&b"announce-list"[..]) {
            Some(value) => parse_announce_list(value)?,
            None => Vec::new(),
        };

        Self::from_info_value(info, announce, announce_list)
    }

    /// Parses a bare `info` dictionary, as delivered by the metadata
    /// extension (BEP 9).
    ///
    /// # Errors
    ///
    /// Same conditions as [`Metainfo::parse`], restricted to the info fields.
    pub fn from_info_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let info = decode(bytes)?;
        Self::from_info_value(&info, None, Vec::new())
    }

    fn from_info_value(info: &Value, announce: Option<String>, announce_list: Vec<Vec<String>>) -> Result<Self, Error> {
        let info_dict = info.as_dict().ok_or(Error::InvalidField { field: "info" })?;

        let info_bytes = encode(info);
        let info_hash = InfoHash(sha1_digest(&info_bytes));

        let name = info_dict
            .get(&b"name"[..])
            .ok_or(Error::MissingField { field: "name" })?
            .as_str()
            .ok_or(Error::InvalidField { field: "name" })?
            .to_owned();

        let piece_length = info_dict
            .get(&b"piece length"[..])
            .ok_or(Error::MissingField { field: "piece length" })?
            .as_int()
            .filter(|len| *len >= 1)
            .ok_or(Error::InvalidField { field: "piece length" })?;
        #[allow(clippy::cast_sign_loss)]
        let piece_length = piece_length as u64;

        let pieces_bytes = info_dict
            .get(&b"pieces"[..])
            .ok_or(Error::MissingField { field: "pieces" })?
            .as_bytes()
            .ok_or(Error::InvalidField { field: "pieces" })?;

        if pieces_bytes.len() % 20 != 0 {
            return Err(Error::InvalidPiecesLength {
                len: pieces_bytes.len(),
            });
        }

        let pieces = pieces_bytes
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let (files, mode) = parse_file_layout(info_dict, &name)?;

        let total_length: u64 = files.iter().map(|file| file.length).sum();
        if total_length == 0 {
            return Err(Error::EmptyContent);
        }

        let private = info_dict
            .get(&b"private"[..])
            .and_then(Value::as_int)
            .is_some_and(|flag| flag == 1);

        Ok(Self {
            info_hash,
            info_bytes,
            name,
            piece_length,
            pieces,
            total_length,
            files,
            mode,
            announce,
            announce_list,
            private,
        })
    }

    /// Re-encodes the document. The `info` dictionary is emitted from the
    /// bytes captured at parse time, so the identity is preserved.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut root = harbor_bencode::Dict::new();

        if let Some(announce) = &self.announce {
            root.insert(b"announce".to_vec(), Value::bytes(announce.as_bytes()));
        }

        if !self.announce_list.is_empty() {
            let tiers = self
                .announce_list
                .iter()
                .map(|tier| Value::List(tier.iter().map(|url| Value::bytes(url.as_bytes())).collect()))
                .collect();
            root.insert(b"announce-list".to_vec(), Value::List(tiers));
        }

        let info = decode(&self.info_bytes).expect("the captured info encoding is canonical bencode");
        root.insert(b"info".to_vec(), info);

        encode(&Value::Dict(root))
    }

    #[must_use]
    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    /// The canonical encoding of the `info` dictionary. This is what the
    /// metadata extension serves to other peers.
    #[must_use]
    pub fn info_bytes(&self) -> &[u8] {
        &self.info_bytes
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn piece_length(&self) -> u64 {
        self.piece_length
    }

    #[must_use]
    pub fn pieces(&self) -> &[[u8; 20]] {
        &self.pieces
    }

    #[must_use]
    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// The length of one piece; the last piece is shorter when the total
    /// length is not a multiple of the piece length.
    ///
    /// # Panics
    ///
    /// Will panic if `index` is out of range.
    #[must_use]
    pub fn length_of_piece(&self, index: usize) -> u64 {
        assert!(index < self.pieces.len(), "piece index {index} out of range");

        let start = index as u64 * self.piece_length;
        self.piece_length.min(self.total_length - start)
    }

    #[must_use]
    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    #[must_use]
    pub fn files(&self) -> &[TorrentFile] {
        &self.files
    }

    #[must_use]
    pub fn mode(&self) -> FileMode {
        self.mode
    }

    #[must_use]
    pub fn announce(&self) -> Option<&str> {
        self.announce.as_deref()
    }

    #[must_use]
    pub fn announce_list(&self) -> &[Vec<String>] {
        &self.announce_list
    }

    /// All announce URLs in failover order: the tiers of the announce list
    /// first (flattened), then the primary announce if not already present.
    #[must_use]
    pub fn all_trackers(&self) -> Vec<String> {
        let mut trackers: Vec<String> = self.announce_list.iter().flatten().cloned().collect();

        if let Some(announce) = &self.announce {
            if !trackers.iter().any(|url| url == announce) {
                trackers.insert(0, announce.clone());
            }
        }

        trackers
    }

    #[must_use]
    pub fn is_private(&self) -> bool {
        self.private
    }
}

fn parse_announce_list(value: &Value) -> Result<Vec<Vec<String>>, Error> {
    let tiers = value.as_list().ok_or(Error::InvalidField { field: "announce-list" })?;

    tiers
        .iter()
        .map(|tier| {
            tier.as_list()
                .ok_or(Error::InvalidField { field: "announce-list" })?
                .iter()
                .map(|url| {
                    url.as_str()
                        .map(ToOwned::to_owned)
                        .ok_or(Error::InvalidField { field: "announce-list" })
                })
                .collect()
        })
        .collect()
}

fn parse_file_layout(info_dict: &harbor_bencode::Dict, name: &str) -> Result<(Vec<TorrentFile>, FileMode), Error> {
    if let Some(length) = info_dict.get(&b"length"[..]) {
        let length = length.as_int().ok_or(Error::InvalidField { field: "length" })?;
        if length <= 0 {
            return Err(Error::NonPositiveFileLength { path: name.to_owned() });
        }

        #[allow(clippy::cast_sign_loss)]
        let file = TorrentFile {
            path: vec![name.to_owned()],
            length: length as u64,
            offset: 0,
        };

        return Ok((vec![file], FileMode::SingleFile));
    }

    let entries = info_dict
        .get(&b"files"[..])
        .ok_or(Error::MissingField { field: "length" })?
        .as_list()
        .ok_or(Error::InvalidField { field: "files" })?;

    if entries.is_empty() {
        return Err(Error::EmptyFileList);
    }

    let mut files = Vec::with_capacity(entries.len());
    let mut offset = 0u64;

    for entry in entries {
        let dict = entry.as_dict().ok_or(Error::InvalidField { field: "files" })?;

        let path: Vec<String> = dict
            .get(&b"path"[..])
            .ok_or(Error::MissingField { field: "path" })?
            .as_list()
            .ok_or(Error::InvalidField { field: "path" })?
            .iter()
            .map(|component| {
                component
                    .as_str()
                    .map(ToOwned::to_owned)
                    .ok_or(Error::InvalidField { field: "path" })
            })
            .collect::<Result<_, _>>()?;

        if path.is_empty() {
            return Err(Error::InvalidField { field: "path" });
        }

        let length = dict
            .get(&b"length"[..])
            .ok_or(Error::MissingField { field: "length" })?
            .as_int()
            .ok_or(Error::InvalidField { field: "length" })?;
        if length <= 0 {
            return Err(Error::NonPositiveFileLength { path: path.join("/") });
        }

        #[allow(clippy::cast_sign_loss)]
        let length = length as u64;

        files.push(TorrentFile { path, length, offset });
        offset += length;
    }

    Ok((files, FileMode::MultiFile))
}

fn sha1_digest(bytes: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

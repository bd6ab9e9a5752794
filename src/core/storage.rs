//! Mapping the torrent's linear byte space onto files on disk.
//!
//! A torrent's content is one contiguous byte space split into pieces; on
//! disk it is one or more files at linear offsets. The [`FileMap`] converts
//! between the two: writing a verified piece splits it across every file its
//! range intersects, reading a piece for upload gathers it back.
//!
//! Layout on disk follows the declared form: a single-file torrent lives at
//! `<root>/<name>`, a multi-file torrent under `<root>/<name>/<relative
//! path>`.
use std::path::{Component, Path, PathBuf};

use harbor_metainfo::{FileMode, Metainfo};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("file path {path:?} escapes the torrent directory")]
    UnsafePath { path: String },

    #[error("piece {index} is out of range (the torrent has {piece_count} pieces)")]
    UnknownPiece { index: u32, piece_count: usize },

    #[error("piece {index} is {got} bytes, expected {expected}")]
    PieceLengthMismatch { index: u32, expected: u64, got: usize },
}

#[derive(Debug, Clone)]
struct MappedFile {
    path: PathBuf,
    length: u64,
    offset: u64,
}

/// The mapping between piece space and files for one torrent.
#[derive(Debug)]
pub struct FileMap {
    files: Vec<MappedFile>,
    piece_length: u64,
    total_length: u64,
    piece_hashes: Vec<[u8; 20]>,
    /// The directory (multi-file) or file (single-file) everything lives
    /// under; what gets deleted when the swarm is removed with its data.
    content_path: PathBuf,
}

impl FileMap {
    /// Builds the map. No filesystem access happens here; call
    /// [`FileMap::initialize`] before reading or writing.
    ///
    /// # Errors
    ///
    /// Will return [`Error::UnsafePath`] if any declared path contains `..`,
    /// an absolute component or no components at all.
    pub fn new(metainfo: &Metainfo, download_root: &Path) -> Result<Self, Error> {
        let content_path = download_root.join(sanitize_component(metainfo.name())?);

        let files = metainfo
            .files()
            .iter()
            .map(|file| {
                let path = match metainfo.mode() {
                    FileMode::SingleFile => content_path.clone(),
                    FileMode::MultiFile => {
                        let mut path = content_path.clone();
                        for component in &file.path {
                            path.push(sanitize_component(component)?);
                        }
                        path
                    }
                };

                Ok(MappedFile {
                    path,
                    length: file.length,
                    offset: file.offset,
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;

        Ok(Self {
            files,
            piece_length: metainfo.piece_length(),
            total_length: metainfo.total_length(),
            piece_hashes: metainfo.pieces().to_vec(),
            content_path,
        })
    }

    #[must_use]
    pub fn content_path(&self) -> &Path {
        &self.content_path
    }

    #[must_use]
    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// The length of piece `index`; the last piece takes the remainder.
    ///
    /// # Errors
    ///
    /// Will return [`Error::UnknownPiece`] for an out-of-range index.
    pub fn piece_length_at(&self, index: u32) -> Result<u64, Error> {
        let start = u64::from(index) * self.piece_length;

        if index as usize >= self.piece_hashes.len() {
            return Err(Error::UnknownPiece {
                index,
                piece_count: self.piece_hashes.len(),
            });
        }

        Ok(self.piece_length.min(self.total_length - start))
    }

    /// Creates the directory hierarchy and every file at its declared size.
    /// Existing files with the wrong size are truncated or extended.
    ///
    /// # Errors
    ///
    /// Will return [`Error::Io`] on any filesystem failure.
    pub async fn initialize(&self) -> Result<(), Error> {
        for file in &self.files {
            if let Some(parent) = file.path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|source| Error::Io {
                        path: parent.to_path_buf(),
                        source,
                    })?;
            }

            let handle = tokio::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&file.path)
                .await
                .map_err(|source| Error::Io {
                    path: file.path.clone(),
                    source,
                })?;

            let current_len = handle
                .metadata()
                .await
                .map_err(|source| Error::Io {
                    path: file.path.clone(),
                    source,
                })?
                .len();

            if current_len != file.length {
                debug!(path = %file.path.display(), from = current_len, to = file.length, "resizing");
                handle.set_len(file.length).await.map_err(|source| Error::Io {
                    path: file.path.clone(),
                    source,
                })?;
            }
        }

        Ok(())
    }

    /// Writes a verified piece, splitting it across every file whose range
    /// intersects the piece's absolute byte range.
    ///
    /// # Errors
    ///
    /// Will return an [`Error`] for an out-of-range index, a byte count that
    /// does not match the piece length, or any filesystem failure.
    pub async fn write_piece(&self, index: u32, bytes: &[u8]) -> Result<(), Error> {
        let expected = self.piece_length_at(index)?;
        if bytes.len() as u64 != expected {
            return Err(Error::PieceLengthMismatch {
                index,
                expected,
                got: bytes.len(),
            });
        }

        let piece_start = u64::from(index) * self.piece_length;
        let piece_end = piece_start + bytes.len() as u64;

        for file in &self.files {
            let Some((overlap_start, overlap_end)) = overlap(piece_start, piece_end, file.offset, file.length) else {
                continue;
            };

            let slice = &bytes[(overlap_start - piece_start) as usize..(overlap_end - piece_start) as usize];

            let mut handle = tokio::fs::OpenOptions::new()
                .write(true)
                .open(&file.path)
                .await
                .map_err(|source| Error::Io {
                    path: file.path.clone(),
                    source,
                })?;

            handle
                .seek(std::io::SeekFrom::Start(overlap_start - file.offset))
                .await
                .map_err(|source| Error::Io {
                    path: file.path.clone(),
                    source,
                })?;

            handle.write_all(slice).await.map_err(|source| Error::Io {
                path: file.path.clone(),
                source,
            })?;
        }

        Ok(())
    }

    /// Reads a piece back, gathering it from every file its range
    /// intersects.
    ///
    /// # Errors
    ///
    /// Will return an [`Error`] for an out-of-range index or any filesystem
    /// failure (including files shorter than declared).
    pub async fn read_piece(&self, index: u32) -> Result<Vec<u8>, Error> {
        let length = self.piece_length_at(index)?;
        let piece_start = u64::from(index) * self.piece_length;
        let piece_end = piece_start + length;

        let mut bytes = vec![0u8; length as usize];

        for file in &self.files {
            let Some((overlap_start, overlap_end)) = overlap(piece_start, piece_end, file.offset, file.length) else {
                continue;
            };

            let slice = &mut bytes[(overlap_start - piece_start) as usize..(overlap_end - piece_start) as usize];

            let mut handle = tokio::fs::File::open(&file.path).await.map_err(|source| Error::Io {
                path: file.path.clone(),
                source,
            })?;

            handle
                .seek(std::io::SeekFrom::Start(overlap_start - file.offset))
                .await
                .map_err(|source| Error::Io {
                    path: file.path.clone(),
                    source,
                })?;

            handle.read_exact(slice).await.map_err(|source| Error::Io {
                path: file.path.clone(),
                source,
            })?;
        }

        Ok(bytes)
    }

    /// Hashes every piece on disk against its expected hash. Returns the
    /// indices that verified and those that did not; pieces that cannot be
    /// read count as invalid.
    pub async fn verify_all(&self) -> (Vec<u32>, Vec<u32>) {
        let mut valid = Vec::new();
        let mut invalid = Vec::new();

        #[allow(clippy::cast_possible_truncation)]
        for index in 0..self.piece_hashes.len() as u32 {
            match self.read_piece(index).await {
                Ok(bytes) => {
                    let mut hasher = Sha1::new();
                    hasher.update(&bytes);
                    let digest: [u8; 20] = hasher.finalize().into();

                    if digest == self.piece_hashes[index as usize] {
                        valid.push(index);
                    } else {
                        invalid.push(index);
                    }
                }
                Err(error) => {
                    warn!(index, %error, "piece unreadable during verification");
                    invalid.push(index);
                }
            }
        }

        (valid, invalid)
    }

    /// Bytes of each file covered by the given completed pieces: the sum of
    /// overlaps between the piece ranges and the file's range.
    #[must_use]
    pub fn file_progress(&self, completed: &std::collections::HashSet<u32>) -> Vec<u64> {
        self.files
            .iter()
            .map(|file| {
                completed
                    .iter()
                    .filter_map(|index| {
                        let piece_start = u64::from(*index) * self.piece_length;
                        let piece_end = (piece_start + self.piece_length).min(self.total_length);
                        overlap(piece_start, piece_end, file.offset, file.length)
                            .map(|(start, end)| end - start)
                    })
                    .sum()
            })
            .collect()
    }

    /// Piece indices whose range intersects any of the given files. Used by
    /// file selection to compute the skipped set's complement.
    #[must_use]
    pub fn pieces_for_files(&self, file_indices: &[usize]) -> std::collections::HashSet<u32> {
        let mut pieces = std::collections::HashSet::new();

        for file_index in file_indices {
            let Some(file) = self.files.get(*file_index) else {
                continue;
            };

            let first = file.offset / self.piece_length;
            let last = (file.offset + file.length).div_ceil(self.piece_length);

            #[allow(clippy::cast_possible_truncation)]
            for index in first..last.min(self.piece_hashes.len() as u64) {
                pieces.insert(index as u32);
            }
        }

        pieces
    }

    #[must_use]
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Removes the downloaded content from disk.
    ///
    /// # Errors
    ///
    /// Will return [`Error::Io`] on any filesystem failure other than the
    /// content not existing.
    pub async fn delete_content(&self) -> Result<(), Error> {
        let result = if self.content_path.is_dir() {
            tokio::fs::remove_dir_all(&self.content_path).await
        } else {
            tokio::fs::remove_file(&self.content_path).await
        };

        match result {
            Ok(()) => Ok(()),
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(Error::Io {
                path: self.content_path.clone(),
                source,
            }),
        }
    }
}

fn overlap(a_start: u64, a_end: u64, file_offset: u64, file_length: u64) -> Option<(u64, u64)> {
    let start = a_start.max(file_offset);
    let end = a_end.min(file_offset + file_length);

    (start < end).then_some((start, end))
}

fn sanitize_component(component: &str) -> Result<&str, Error> {
    let path = Path::new(component);
    let mut components = path.components();

    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(component),
        _ => Err(Error::UnsafePath {
            path: component.to_owned(),
        }),
    }
}

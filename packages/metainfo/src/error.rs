use thiserror::Error;

/// Errors raised while parsing a metainfo document.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid bencode: {source}")]
    Bencode {
        #[from]
        source: harbor_bencode::Error,
    },

    #[error("the document is not a dictionary")]
    NotADictionary,

    #[error("required field `{field}` is missing")]
    MissingField { field: &'static str },

    #[error("field `{field}` has the wrong type or an invalid value")]
    InvalidField { field: &'static str },

    #[error("`pieces` length {len} is not a multiple of 20")]
    InvalidPiecesLength { len: usize },

    #[error("the `files` list is empty")]
    EmptyFileList,

    #[error("file `{path}` declares a non-positive length")]
    NonPositiveFileLength { path: String },

    #[error("the torrent has no content (total length is zero)")]
    EmptyContent,
}

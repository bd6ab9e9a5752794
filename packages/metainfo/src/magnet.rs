//! Magnet links (BEP 9 / BEP 53 subset).
//!
//! A magnet link identifies a swarm by its info-hash without carrying the
//! metainfo document: `magnet:?xt=urn:btih:<40-hex>&dn=<name>&tr=<tracker>`.
//! The `tr` parameter may repeat, one per tracker.
use std::str::FromStr;

use harbor_primitives::info_hash::InfoHash;
use thiserror::Error;
use url::Url;

const XT_PREFIX: &str = "urn:btih:";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("not a magnet URI: {uri}")]
    NotAMagnetUri { uri: String },

    #[error("the magnet URI has no `xt=urn:btih:` parameter")]
    MissingInfoHash,

    #[error("the magnet URI carries an invalid info-hash: {value}")]
    InvalidInfoHash { value: String },
}

/// A parsed magnet link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Magnet {
    pub info_hash: InfoHash,
    pub display_name: Option<String>,
    pub trackers: Vec<String>,
}

impl Magnet {
    /// Parses a `magnet:` URI.
    ///
    /// # Errors
    ///
    /// Will return an [`Error`] if the scheme is not `magnet`, the `xt`
    /// parameter is missing, or the info-hash is not 40 hex characters.
    pub fn parse(uri: &str) -> Result<Self, Error> {
        let url = Url::parse(uri).map_err(|_| Error::NotAMagnetUri { uri: uri.to_owned() })?;

        if url.scheme() != "magnet" {
            return Err(Error::NotAMagnetUri { uri: uri.to_owned() });
        }

        let mut info_hash = None;
        let mut display_name = None;
        let mut trackers = Vec::new();

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" => {
                    let hex = value.strip_prefix(XT_PREFIX).ok_or_else(|| Error::InvalidInfoHash {
                        value: value.to_string(),
                    })?;
                    let hash = InfoHash::from_str(hex).map_err(|_| Error::InvalidInfoHash {
                        value: value.to_string(),
                    })?;
                    info_hash = Some(hash);
                }
                "dn" => display_name = Some(value.into_owned()),
                "tr" => trackers.push(value.into_owned()),
                _ => (),
            }
        }

        Ok(Self {
            info_hash: info_hash.ok_or(Error::MissingInfoHash)?,
            display_name,
            trackers,
        })
    }

    /// Synthesizes the URI form of this link.
    #[must_use]
    pub fn to_uri(&self) -> String {
        let mut uri = format!("magnet:?xt={XT_PREFIX}{}", self.info_hash.to_hex_string());

        let mut query = url::form_urlencoded::Serializer::new(String::new());
        if let Some(name) = &self.display_name {
            query.append_pair("dn", name);
        }
        for tracker in &self.trackers {
            query.append_pair("tr", tracker);
        }

        let tail = query.finish();
        if !tail.is_empty() {
            uri.push('&');
            uri.push_str(&tail);
        }

        uri
    }
}

impl FromStr for Magnet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for Magnet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_uri())
    }
}

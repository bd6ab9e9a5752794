//! The HTTP announce transport (BEP 3).
//!
//! An announce is a GET whose query carries the raw 20-byte `info_hash` and
//! `peer_id` percent-encoded over the RFC 3986 unreserved set
//! (`0-9 A-Z a-z - . _ ~`). `reqwest` cannot put byte arrays in query
//! parameters, so the query string is assembled by hand.
//!
//! The response is a bencoded dictionary: a `failure reason` key is surfaced
//! as an error; peers arrive either as a compact byte string (BEP 23) or as
//! a list of `{ip, port}` dictionaries.
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use harbor_bencode::Value;
use harbor_primitives::announce_event::AnnounceEvent;
use percent_encoding::{percent_encode, AsciiSet, NON_ALPHANUMERIC};

use super::{AnnounceData, AnnounceParams};
use crate::protocol::{decode_compact_peers, CompactError};

/// Everything except `0-9 A-Z a-z - . _ ~` gets percent-encoded.
const UNRESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

pub const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("building the http client failed: {source}")]
    ClientBuild { source: reqwest::Error },

    #[error("announce request failed: {source}")]
    Request {
        #[from]
        source: reqwest::Error,
    },

    #[error("tracker answered with status {status}")]
    NonSuccessStatus { status: u16 },

    #[error("tracker response is not valid bencode: {source}")]
    Bencode {
        #[from]
        source: harbor_bencode::Error,
    },

    #[error("tracker response is not a dictionary")]
    NotADictionary,

    #[error("tracker failure: {reason}")]
    Failure { reason: String },

    #[error("tracker sent a malformed peer list: {source}")]
    BadPeerList {
        #[from]
        source: CompactError,
    },
}

/// Percent-encodes a raw 20-byte array for use in the query string.
#[must_use]
pub fn percent_encode_byte_array(bytes: &[u8; 20]) -> String {
    percent_encode(bytes, UNRESERVED).to_string()
}

/// The HTTP announce client.
pub struct Client {
    http: reqwest::Client,
}

impl Client {
    /// # Errors
    ///
    /// Will return an [`Error`] if the underlying client cannot be built.
    pub fn new() -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(ANNOUNCE_TIMEOUT)
            .build()
            .map_err(|source| Error::ClientBuild { source })?;

        Ok(Self { http })
    }

    /// Announces to `url` and decodes the response.
    ///
    /// # Errors
    ///
    /// Will return an [`Error`] on network failure, a non-2xx status, a
    /// malformed response or a tracker-reported failure.
    pub async fn announce(&self, url: &str, params: &AnnounceParams) -> Result<AnnounceData, Error> {
        let separator = if url.contains('?') { '&' } else { '?' };
        let full_url = format!("{url}{separator}{}", build_query(params));

        let response = self.http.get(&full_url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::NonSuccessStatus { status: status.as_u16() });
        }

        let bytes = response.bytes().await?;
        parse_response(&bytes)
    }
}

/// Builds the announce query with the exact parameter names the protocol
/// requires.
fn build_query(params: &AnnounceParams) -> String {
    let mut query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
        percent_encode_byte_array(&params.info_hash.bytes()),
        percent_encode_byte_array(&params.peer_id.bytes()),
        params.port,
        params.uploaded,
        params.downloaded,
        params.left,
    );

    if params.event != AnnounceEvent::None {
        query.push_str("&event=");
        query.push_str(&params.event.to_string());
    }

    query
}

fn parse_response(bytes: &[u8]) -> Result<AnnounceData, Error> {
    let document = harbor_bencode::decode(bytes)?;
    let root = document.as_dict().ok_or(Error::NotADictionary)?;

    if let Some(reason) = root.get(&b"failure reason"[..]) {
        return Err(Error::Failure {
            reason: reason.as_str().unwrap_or("<non UTF-8 reason>").to_owned(),
        });
    }

    let interval = root
        .get(&b"interval"[..])
        .and_then(Value::as_int)
        .and_then(|secs| u64::try_from(secs).ok())
        .map(Duration::from_secs);

    let peers = match root.get(&b"peers"[..]) {
        Some(Value::Bytes(compact)) => decode_compact_peers(compact)?,
        Some(Value::List(entries)) => entries.iter().filter_map(parse_peer_dictionary).collect(),
        _ => Vec::new(),
    };

    Ok(AnnounceData { interval, peers })
}

/// One entry of the non-compact peer list: `{ip: "x.x.x.x", port: n}`.
/// Malformed entries are skipped rather than failing the whole response.
fn parse_peer_dictionary(entry: &Value) -> Option<SocketAddr> {
    let ip: IpAddr = entry.dict_get(b"ip")?.as_str()?.parse().ok()?;
    let port = entry.dict_get(b"port")?.as_int()?;
    let port = u16::try_from(port).ok()?;

    Some(SocketAddr::new(ip, port))
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::time::Duration;

    use harbor_primitives::announce_event::AnnounceEvent;
    use harbor_primitives::info_hash::InfoHash;
    use harbor_primitives::peer;

    use super::{build_query, parse_response, percent_encode_byte_array, Error};
    use crate::trackers::AnnounceParams;

    fn sample_params(event: AnnounceEvent) -> AnnounceParams {
        AnnounceParams {
            info_hash: InfoHash([0xFF; 20]),
            peer_id: peer::Id(*b"-HB0100-123456789012"),
            port: 6881,
            uploaded: 10,
            downloaded: 20,
            left: 30,
            event,
        }
    }

    #[test]
    fn unreserved_bytes_should_stay_literal_and_everything_else_escape() {
        assert_eq!(percent_encode_byte_array(&[0xFF; 20]), "%FF".repeat(20));

        // `-HB0100-abc.xyz_~AZ9` is entirely unreserved.
        let id = *b"-HB0100-abc.xyz_~AZ9";
        assert_eq!(percent_encode_byte_array(&id), "-HB0100-abc.xyz_~AZ9");
    }

    #[test]
    fn the_query_should_use_the_exact_parameter_names() {
        let query = build_query(&sample_params(AnnounceEvent::Started));

        assert_eq!(
            query,
            format!(
                "info_hash={}&peer_id=-HB0100-123456789012&port=6881&uploaded=10&downloaded=20&left=30&compact=1&event=started",
                "%FF".repeat(20)
            )
        );
    }

    #[test]
    fn regular_announces_should_omit_the_event_parameter() {
        let query = build_query(&sample_params(AnnounceEvent::None));

        assert!(!query.contains("event="));
        assert!(query.ends_with("&compact=1"));
    }

    #[test]
    fn it_should_parse_a_compact_peer_response() {
        let mut response = b"d8:intervali1800e5:peers6:".to_vec();
        response.extend_from_slice(&[0x0A, 0x00, 0x00, 0x01, 0x1A, 0xE1]);
        response.push(b'e');

        let data = parse_response(&response).unwrap();

        assert_eq!(data.interval, Some(Duration::from_secs(1800)));
        assert_eq!(
            data.peers,
            vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 6881)]
        );
    }

    #[test]
    fn it_should_parse_a_dictionary_peer_response() {
        let response = b"d5:peersld2:ip8:10.0.0.24:porti6882eed2:ip7:bad ip!4:porti1eeee";

        let data = parse_response(response).unwrap();

        // The malformed entry is skipped.
        assert_eq!(
            data.peers,
            vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 6882)]
        );
        assert_eq!(data.interval, None);
    }

    #[test]
    fn a_failure_reason_should_surface_as_an_error() {
        let response = b"d14:failure reason15:torrent unknowne";

        assert!(matches!(
            parse_response(response),
            Err(Error::Failure { reason }) if reason == "torrent unknown"
        ));
    }

    #[test]
    fn a_truncated_compact_peer_list_should_be_rejected() {
        let response = b"d5:peers5:AAAAAe";

        assert!(matches!(parse_response(response), Err(Error::BadPeerList { .. })));
    }

    #[test]
    fn a_non_dictionary_response_should_be_rejected() {
        assert!(matches!(parse_response(b"le"), Err(Error::NotADictionary)));
    }
}
